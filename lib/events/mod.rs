//! Push events from the remote side and their ordered application to the cache.
//!
//! The transport delivers events through an [`EventSender`]. A single worker task applies them
//! in delivery order, taking the same state lock as local operations, so readers observe each
//! event either fully applied or not at all.

mod applier;

pub use applier::spawn_applier;

use std::ffi::OsString;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::fs::{FileAttr, LocationUpdate, Uuid};

/// What an attribute-changed event says about its entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrChange {
    /// New attributes to merge into the cached entry.
    Updated(FileAttr),
    /// The entry no longer exists.
    Deleted,
}

/// One push event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Attributes of `uuid` changed remotely.
    AttrChanged {
        /// Affected entry.
        uuid: Uuid,
        /// The change.
        change: AttrChange,
    },
    /// An entry was moved, possibly receiving a new identifier.
    Renamed {
        /// Identifier before the move.
        old: Uuid,
        /// Identifier after the move.
        new: Uuid,
        /// Name within the new parent.
        new_name: OsString,
        /// Destination directory.
        new_parent: Uuid,
    },
    /// An entry was removed.
    Removed(Uuid),
    /// The location of a file's bytes changed.
    LocationChanged {
        /// Affected file.
        uuid: Uuid,
        /// The block map delta.
        update: LocationUpdate,
    },
}

pub(crate) enum Message {
    Apply(Event),
    Flush(oneshot::Sender<()>),
}

/// The applier task has stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("event applier is no longer running")]
pub struct EventChannelClosed;

/// Delivers events to the applier, preserving order.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<Message>,
}

impl EventSender {
    pub(crate) fn new(tx: mpsc::Sender<Message>) -> Self {
        Self { tx }
    }

    /// Queues an event behind every event sent before it.
    pub async fn send(&self, event: Event) -> Result<(), EventChannelClosed> {
        self.tx
            .send(Message::Apply(event))
            .await
            .map_err(|_| EventChannelClosed)
    }

    /// Resolves once every event sent before this call has been applied.
    pub async fn flush(&self) -> Result<(), EventChannelClosed> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Message::Flush(done_tx))
            .await
            .map_err(|_| EventChannelClosed)?;
        done_rx.await.map_err(|_| EventChannelClosed)
    }
}
