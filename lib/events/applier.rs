use std::sync::Arc;

use tokio::sync::mpsc::Receiver;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::cache::MetadataCache;
use crate::events::{AttrChange, Event, EventSender, Message};
use crate::fs::handles::OpenFileRegistry;
use crate::fs::helper::StorageHelper;
use crate::fs::provider::RemoteProvider;

/// Number of events that may queue before senders wait.
const CHANNEL_SIZE: usize = 1024;

struct EventApplier<P: RemoteProvider, H: StorageHelper> {
    cache: Arc<MetadataCache<P>>,
    registry: Arc<OpenFileRegistry<H>>,
    receiver: Receiver<Message>,
}

impl<P: RemoteProvider, H: StorageHelper> EventApplier<P, H> {
    async fn work(&mut self) {
        while let Some(msg) = self.receiver.recv().await
            && self.service_message(msg)
        {}
        debug!("event applier stopped");
    }

    /// Returns `false` when the worker should stop.
    fn service_message(&mut self, message: Message) -> bool {
        match message {
            Message::Apply(event) => self.apply(event),
            Message::Flush(done) => {
                // The flusher may have given up waiting.
                let _ = done.send(());
            }
        }
        true
    }

    fn apply(&self, event: Event) {
        match event {
            Event::AttrChanged {
                uuid,
                change: AttrChange::Updated(attr),
            } => {
                if attr.uuid != uuid {
                    debug!(uuid = %uuid, carried = %attr.uuid, "attribute event identifiers disagree, ignoring");
                    return;
                }
                if !self.cache.contains(&uuid) {
                    debug!(uuid = %uuid, "attribute event for uncached entry ignored");
                    return;
                }
                if let Some(size) = self.cache.apply_attr_changed(&attr) {
                    debug!(uuid = %uuid, size, "file shrank, truncating open block map");
                    self.registry.truncate_blocks(&uuid, size);
                }
            }
            Event::AttrChanged {
                uuid,
                change: AttrChange::Deleted,
            }
            | Event::Removed(uuid) => {
                if !self.cache.contains(&uuid) {
                    debug!(uuid = %uuid, "removal event for uncached entry ignored");
                    return;
                }
                debug!(uuid = %uuid, "applying removal event");
                self.cache.apply_deleted(&uuid);
            }
            Event::Renamed {
                old,
                new,
                new_name,
                new_parent,
            } => {
                let applied = self
                    .cache
                    .apply_renamed(&old, &new, &new_parent, &new_name, false);
                debug!(old = %old, new = %new, applied, "rename event");
            }
            Event::LocationChanged { uuid, update } => {
                let applied = self.registry.apply_location(&uuid, &update);
                debug!(uuid = %uuid, applied, "location change event");
            }
        }
    }
}

/// Starts the applier task feeding `cache` and `registry`.
///
/// The task runs until every [`EventSender`] clone is dropped.
pub fn spawn_applier<P: RemoteProvider, H: StorageHelper>(
    cache: Arc<MetadataCache<P>>,
    registry: Arc<OpenFileRegistry<H>>,
) -> (EventSender, JoinHandle<()>) {
    let (tx, receiver) = tokio::sync::mpsc::channel(CHANNEL_SIZE);
    let mut applier = EventApplier {
        cache,
        registry,
        receiver,
    };
    let worker = tokio::spawn(async move {
        applier.work().await;
    });
    (EventSender::new(tx), worker)
}
