//! Per-directory child listings and the gate that serializes their remote page fetches.

use std::ffi::{OsStr, OsString};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use rustc_hash::FxHashSet;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::fs::{FileAttr, FileType, Uuid};

/// Observable state of one directory's listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingState {
    /// Nothing cached for the directory.
    Empty,
    /// Some pages were fetched but the terminal page was not seen yet.
    Fetching,
    /// Every page was fetched.
    Complete,
}

/// A child as recorded in a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedChild {
    /// Identifier of the child.
    pub uuid: Uuid,
    /// Name of the child within the directory.
    pub name: OsString,
    /// Node type of the child.
    pub file_type: FileType,
    /// Replication flag at the time the child was listed.
    pub fully_replicated: bool,
}

impl From<&FileAttr> for ListedChild {
    fn from(attr: &FileAttr) -> Self {
        Self {
            uuid: attr.uuid.clone(),
            name: attr.name.clone(),
            file_type: attr.file_type,
            fully_replicated: attr.fully_replicated,
        }
    }
}

impl ListedChild {
    /// Whether the strict-replica filter hides this child.
    #[must_use]
    pub fn hidden_in_strict_mode(&self) -> bool {
        self.file_type == FileType::Regular && !self.fully_replicated
    }
}

/// Ordered children of one directory, deduplicated by identifier.
#[derive(Debug)]
pub struct DirListing {
    children: Vec<ListedChild>,
    members: FxHashSet<Uuid>,
    /// Raw number of rows consumed from the remote side, duplicates included.
    cursor: usize,
    complete: bool,
    expires_at: Instant,
    /// Identifies this incarnation; a fetch claimed against an older epoch is discarded.
    epoch: u64,
}

impl DirListing {
    /// Starts an empty, incomplete listing.
    #[must_use]
    pub fn new(epoch: u64, expires_at: Instant) -> Self {
        Self {
            children: Vec::new(),
            members: FxHashSet::default(),
            cursor: 0,
            complete: false,
            expires_at,
            epoch,
        }
    }

    /// Appends a child unless its identifier is already listed. Returns `true` if appended.
    pub fn push(&mut self, child: ListedChild) -> bool {
        if !self.members.insert(child.uuid.clone()) {
            return false;
        }
        self.children.push(child);
        true
    }

    /// Drops a child by identifier. Returns `true` if it was listed.
    pub fn remove(&mut self, uuid: &Uuid) -> bool {
        if !self.members.remove(uuid) {
            return false;
        }
        self.children.retain(|child| &child.uuid != uuid);
        true
    }

    /// Drops whichever child is listed under `name`. Returns `true` if one was.
    pub fn remove_name(&mut self, name: &OsStr) -> bool {
        let Some(pos) = self
            .children
            .iter()
            .position(|child| child.name.as_os_str() == name)
        else {
            return false;
        };
        let child = self.children.remove(pos);
        self.members.remove(&child.uuid);
        true
    }

    /// Whether a child with this identifier is listed.
    #[must_use]
    pub fn contains(&self, uuid: &Uuid) -> bool {
        self.members.contains(uuid)
    }

    /// Updates the recorded replication flag of a child.
    pub fn set_replicated(&mut self, uuid: &Uuid, fully_replicated: bool) {
        if let Some(child) = self.children.iter_mut().find(|c| &c.uuid == uuid) {
            child.fully_replicated = fully_replicated;
        }
    }

    /// Records a fetched page.
    pub fn absorb_page(&mut self, raw_len: usize, is_last: bool, expires_at: Instant) {
        self.cursor += raw_len;
        if is_last {
            self.complete = true;
            self.expires_at = expires_at;
        }
    }

    /// The children visible under the given filter mode, in listing order.
    pub fn visible(&self, strict_replicas: bool) -> impl Iterator<Item = &ListedChild> + '_ {
        self.children
            .iter()
            .filter(move |child| !(strict_replicas && child.hidden_in_strict_mode()))
    }

    /// Number of children visible under the given filter mode.
    #[must_use]
    pub fn visible_len(&self, strict_replicas: bool) -> usize {
        self.visible(strict_replicas).count()
    }

    /// Raw remote offset of the next page.
    #[must_use]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Whether the terminal page was seen.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Whether the expiry instant has passed.
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }

    /// The incarnation this listing belongs to.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

const GATE_IDLE: u8 = 0;
const GATE_FETCHING: u8 = 1;

#[derive(Debug)]
struct Gate {
    state: AtomicU8,
    /// Wakes waiters when `state` transitions out of `FETCHING`.
    notify: Notify,
}

/// Ensures at most one remote page fetch per directory is in flight.
#[derive(Debug, Default)]
pub struct FetchGates {
    gates: scc::HashMap<Uuid, Arc<Gate>>,
}

/// Exclusive right to fetch the next page of one directory. Released on drop, including when
/// the fetching future is cancelled.
#[derive(Debug)]
pub struct FetchLease {
    gate: Arc<Gate>,
}

impl Drop for FetchLease {
    fn drop(&mut self) {
        self.gate.state.store(GATE_IDLE, Ordering::Release);
        self.gate.notify.notify_waiters();
    }
}

impl FetchGates {
    fn gate(&self, dir: &Uuid) -> Arc<Gate> {
        if let Some(gate) = self.gates.read_sync(dir, |_, v| Arc::clone(v)) {
            return gate;
        }
        match self.gates.entry_sync(dir.clone()) {
            scc::hash_map::Entry::Occupied(occ) => Arc::clone(occ.get()),
            scc::hash_map::Entry::Vacant(vac) => {
                let gate = Arc::new(Gate {
                    state: AtomicU8::new(GATE_IDLE),
                    notify: Notify::new(),
                });
                vac.insert_entry(Arc::clone(&gate));
                gate
            }
        }
    }

    /// Claims the fetch right for `dir`, or `None` if another task holds it.
    #[must_use]
    pub fn try_claim(&self, dir: &Uuid) -> Option<FetchLease> {
        let gate = self.gate(dir);
        gate.state
            .compare_exchange(
                GATE_IDLE,
                GATE_FETCHING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .ok()
            .map(|_| FetchLease { gate })
    }

    /// Waits until no fetch for `dir` is in flight.
    ///
    /// The `Notified` future is enabled before the state check so a release racing with the
    /// check is not missed.
    pub async fn wait_idle(&self, dir: &Uuid) {
        let gate = self.gate(dir);
        loop {
            let mut notified = std::pin::pin!(gate.notify.notified());
            notified.as_mut().enable();
            if gate.state.load(Ordering::Acquire) != GATE_FETCHING {
                return;
            }
            notified.await;
        }
    }

    /// Number of directories with a gate.
    #[must_use]
    pub fn len(&self) -> usize {
        self.gates.len()
    }

    /// Whether no directory has a gate.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }

    /// Forgets the gate of a directory that is no longer cached, unless a fetch is running.
    pub fn forget(&self, dir: &Uuid) {
        drop(
            self.gates
                .remove_if_sync(dir, |gate| gate.state.load(Ordering::Acquire) == GATE_IDLE),
        );
    }
}
