//! Metadata caching: the entry store, directory listings, and their eviction.
/// Capacity and expiry enforcement.
pub mod eviction;
/// Per-directory listings and their fetch gates.
pub mod listing;
/// The concurrent cache facade.
pub mod metadata;
/// Deduplication of concurrent remote fetches.
pub mod single_flight;
/// The identifier-keyed entry arena.
pub mod store;

pub use listing::ListingState;
pub use metadata::{CacheSettings, MetadataCache};
pub use store::Removal;

use std::ffi::OsStr;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::fs::{FileAttr, Uuid};
use listing::{DirListing, ListedChild};
use store::EntryStore;

/// Everything that must change atomically: the entries and the listings that name them.
#[derive(Debug, Default)]
pub(crate) struct CacheState {
    pub(crate) store: EntryStore,
    pub(crate) listings: FxHashMap<Uuid, DirListing>,
}

/// What an attribute update did to a cached entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AttrMerge {
    /// The update belongs to a different parent and was dropped.
    Ignored,
    /// Attributes were merged in place.
    Merged {
        /// Set when the update shrank the file to this size.
        shrunk_to: Option<u64>,
    },
}

/// Folds freshly received attributes into a cached entry.
///
/// Timestamps only move forward. Ownership, mode, size, link count and replication state are
/// overwritten. Name and parent stay as cached; they only change through renames.
pub(crate) fn merge_attrs(cached: &mut FileAttr, fresh: &FileAttr) -> AttrMerge {
    if fresh.parent.is_some() && fresh.parent != cached.parent {
        return AttrMerge::Ignored;
    }
    let shrunk_to = (fresh.size < cached.size).then_some(fresh.size);

    cached.atime = cached.atime.max(fresh.atime);
    cached.mtime = cached.mtime.max(fresh.mtime);
    cached.ctime = cached.ctime.max(fresh.ctime);
    cached.mode = fresh.mode;
    cached.uid = fresh.uid;
    cached.gid = fresh.gid;
    cached.size = fresh.size;
    cached.nlink = fresh.nlink;
    cached.fully_replicated = fresh.fully_replicated;
    cached.replica_ref.clone_from(&fresh.replica_ref);

    AttrMerge::Merged { shrunk_to }
}

impl CacheState {
    /// Inserts fetched attributes, or merges them into the cached entry, then enforces capacity.
    ///
    /// Returns the entry as cached afterwards (`None` if the identifier is tombstoned) and the
    /// identifiers evicted to make room.
    pub(crate) fn admit(
        &mut self,
        attr: FileAttr,
        capacity: usize,
    ) -> (Option<FileAttr>, Vec<Uuid>) {
        if self.store.is_deleted(&attr.uuid) {
            debug!(uuid = %attr.uuid, "not caching attributes of a deleted entry");
            return (None, Vec::new());
        }
        let uuid = attr.uuid.clone();
        let mut evicted = Vec::new();
        if self.store.contains(&uuid) {
            self.store.update(&uuid, |cached| {
                merge_attrs(cached, &attr);
            });
            self.store.get(&uuid);
        } else {
            self.store.put(attr);
            evicted = eviction::enforce_capacity(self, capacity, Some(&uuid));
        }
        (self.store.peek(&uuid).cloned(), evicted)
    }

    /// Drops a cached entry together with its own listing. Protection is not consulted.
    pub(crate) fn evict_entry(&mut self, uuid: &Uuid) -> Option<FileAttr> {
        self.listings.remove(uuid);
        self.store.remove_now(uuid)
    }

    /// Applies a deletion: tombstone, listing removal, subtree cleanup and pin-aware removal.
    ///
    /// Returns the directories whose listings were dropped.
    pub(crate) fn delete(&mut self, uuid: &Uuid) -> Vec<Uuid> {
        self.store.mark_deleted(uuid.clone());

        match self.store.peek(uuid).and_then(|attr| attr.parent.clone()) {
            Some(parent) => {
                if let Some(listing) = self.listings.get_mut(&parent) {
                    listing.remove(uuid);
                }
            }
            None => {
                for listing in self.listings.values_mut() {
                    listing.remove(uuid);
                }
            }
        }

        let mut dropped = Vec::new();
        if self.store.peek(uuid).is_some_and(FileAttr::is_dir) {
            let protected = self.store.protected_set(None);
            dropped = eviction::evict_subtree(self, uuid, &protected);
        }
        if self.listings.remove(uuid).is_some() {
            dropped.push(uuid.clone());
        }

        let outcome = self.store.remove(uuid);
        debug!(uuid = %uuid, outcome = ?outcome, "entry deleted");
        dropped
    }

    /// Moves an entry to `(new_parent, new_name)`, possibly under a new identifier.
    ///
    /// When the identifier changes, the old entry is dropped rather than relabeled; the new one
    /// is only cached if `materialize` is set.
    ///
    /// Returns the identifiers whose entries or listings were dropped along the way, or `None`
    /// if `old` is not cached.
    pub(crate) fn rename(
        &mut self,
        old: &Uuid,
        new: &Uuid,
        new_parent: &Uuid,
        new_name: &OsStr,
        materialize: bool,
        capacity: usize,
    ) -> Option<Vec<Uuid>> {
        let old_attr = self.store.peek(old).cloned()?;
        let mut dropped = Vec::new();

        let target = self
            .store
            .lookup(new_parent, new_name)
            .map(|attr| attr.uuid.clone())
            .filter(|target| target != old && target != new);
        if let Some(target) = target {
            debug!(uuid = %target, "rename overwrites existing target");
            dropped.extend(self.delete(&target));
        }
        if let Some(listing) = self.listings.get_mut(new_parent) {
            listing.remove_name(new_name);
        }

        if let Some(parent) = &old_attr.parent
            && let Some(listing) = self.listings.get_mut(parent)
        {
            listing.remove(old);
        }

        let mut moved = old_attr;
        moved.parent = Some(new_parent.clone());
        moved.name = new_name.to_os_string();
        moved.uuid = new.clone();

        if old == new {
            self.store.update(old, |attr| {
                attr.parent = Some(new_parent.clone());
                attr.name = new_name.to_os_string();
            });
        } else {
            dropped.extend(self.delete(old));
            if materialize {
                dropped.extend(self.admit(moved.clone(), capacity).1);
            }
        }

        if let Some(listing) = self.listings.get_mut(new_parent) {
            listing.push(ListedChild::from(&moved));
        }
        Some(dropped)
    }
}
