//! Identifier-keyed arena of cached attribute entries.
//!
//! Entries are kept in a [`LinkedHashMap`] whose iteration order is least-recently-used first.
//! Parent/child relations are stored as identifiers only, in two side indices: the children of
//! each parent, and `(parent, name) -> uuid` for lookups by name.
//!
//! The store is not thread-safe on its own; it lives inside the cache's state lock together with
//! the directory listings so that both move in one atomic step.

use std::ffi::{OsStr, OsString};

use hashlink::LinkedHashMap;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::fs::{FileAttr, Uuid};

#[derive(Debug)]
struct Slot {
    attr: FileAttr,
    pins: usize,
    /// Removal was requested while the entry was protected.
    remove_on_unpin: bool,
}

/// Outcome of [`EntryStore::remove`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Removal {
    /// The entry was dropped.
    Removed(FileAttr),
    /// The entry is protected; it was detached from its parent and will be dropped on unpin.
    Deferred,
    /// No such entry.
    Absent,
}

/// Cached entries, their pin counts, and the name indices.
#[derive(Debug, Default)]
pub struct EntryStore {
    entries: LinkedHashMap<Uuid, Slot>,
    children: FxHashMap<Uuid, FxHashSet<Uuid>>,
    names: FxHashMap<(Uuid, OsString), Uuid>,
    pinned: FxHashSet<Uuid>,
    deleted: FxHashSet<Uuid>,
}

impl EntryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the entry and marks it most recently used.
    pub fn get(&mut self, uuid: &Uuid) -> Option<&FileAttr> {
        let slot = self.entries.remove(uuid)?;
        self.entries.insert(uuid.clone(), slot);
        self.entries.get(uuid).map(|slot| &slot.attr)
    }

    /// Returns the entry without touching recency.
    #[must_use]
    pub fn peek(&self, uuid: &Uuid) -> Option<&FileAttr> {
        self.entries.get(uuid).map(|slot| &slot.attr)
    }

    /// Inserts or overwrites an entry by identifier, marking it most recently used.
    ///
    /// Pin state survives an overwrite. The caller is responsible for enforcing capacity.
    pub fn put(&mut self, attr: FileAttr) {
        let uuid = attr.uuid.clone();
        let slot = match self.entries.remove(&uuid) {
            Some(mut slot) => {
                if !slot.remove_on_unpin {
                    self.unindex(&slot.attr);
                }
                slot.attr = attr;
                slot
            }
            None => Slot {
                attr,
                pins: 0,
                remove_on_unpin: false,
            },
        };
        if !slot.remove_on_unpin {
            self.index(&slot.attr);
        }
        self.entries.insert(uuid, slot);
    }

    /// Applies `f` to a cached entry in place, keeping the indices consistent.
    pub fn update(&mut self, uuid: &Uuid, f: impl FnOnce(&mut FileAttr)) -> Option<&FileAttr> {
        let (old_key, detached) = {
            let slot = self.entries.get(uuid)?;
            (
                (slot.attr.parent.clone(), slot.attr.name.clone()),
                slot.remove_on_unpin,
            )
        };
        let slot = self.entries.get_mut(uuid)?;
        f(&mut slot.attr);
        let changed = (slot.attr.parent.clone(), slot.attr.name.clone()) != old_key;
        if changed && !detached {
            let attr = slot.attr.clone();
            if let (Some(parent), name) = old_key {
                self.unindex_key(&parent, name, uuid);
            }
            self.index(&attr);
        }
        self.entries.get(uuid).map(|slot| &slot.attr)
    }

    /// Removes an entry, or defers the removal if the entry is protected.
    ///
    /// An entry is protected while it is pinned or while it is an ancestor of a pinned entry.
    /// A deferred entry disappears from the name indices immediately, so its name can be reused,
    /// but stays readable by identifier until [`unpin`](Self::unpin) releases it.
    pub fn remove(&mut self, uuid: &Uuid) -> Removal {
        if !self.entries.contains_key(uuid) {
            return Removal::Absent;
        }
        if self.is_protected(uuid) {
            if let Some(slot) = self.entries.get_mut(uuid)
                && !slot.remove_on_unpin
            {
                slot.remove_on_unpin = true;
                let attr = slot.attr.clone();
                self.unindex(&attr);
            }
            return Removal::Deferred;
        }
        match self.remove_now(uuid) {
            Some(attr) => Removal::Removed(attr),
            None => Removal::Absent,
        }
    }

    /// Drops an entry regardless of protection.
    pub(crate) fn remove_now(&mut self, uuid: &Uuid) -> Option<FileAttr> {
        let slot = self.entries.remove(uuid)?;
        if !slot.remove_on_unpin {
            self.unindex(&slot.attr);
        }
        self.pinned.remove(uuid);
        Some(slot.attr)
    }

    /// Increments the pin count. Returns `false` if the entry is not cached.
    pub fn pin(&mut self, uuid: &Uuid) -> bool {
        let Some(slot) = self.entries.get_mut(uuid) else {
            return false;
        };
        slot.pins += 1;
        self.pinned.insert(uuid.clone());
        true
    }

    /// Decrements the pin count and performs removals that were waiting on it.
    ///
    /// Ancestors whose removal was deferred only because they sat above this entry are dropped
    /// as well once nothing below them is pinned. Returns every entry dropped.
    pub fn unpin(&mut self, uuid: &Uuid) -> Vec<FileAttr> {
        let Some(slot) = self.entries.get_mut(uuid) else {
            return Vec::new();
        };
        slot.pins = slot.pins.saturating_sub(1);
        if slot.pins > 0 {
            return Vec::new();
        }
        self.pinned.remove(uuid);

        let mut dropped = Vec::new();
        let mut cursor = Some(uuid.clone());
        while let Some(current) = cursor {
            let Some(slot) = self.entries.get(&current) else {
                break;
            };
            let next = slot.attr.parent.clone();
            if slot.remove_on_unpin
                && !self.is_protected(&current)
                && let Some(attr) = self.remove_now(&current)
            {
                dropped.push(attr);
            }
            cursor = next;
        }
        dropped
    }

    /// Pin count of an entry, zero if absent.
    #[must_use]
    pub fn pins(&self, uuid: &Uuid) -> usize {
        self.entries.get(uuid).map_or(0, |slot| slot.pins)
    }

    /// Whether the entry is cached.
    #[must_use]
    pub fn contains(&self, uuid: &Uuid) -> bool {
        self.entries.contains_key(uuid)
    }

    /// Number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolves a name within a parent.
    #[must_use]
    pub fn lookup(&self, parent: &Uuid, name: &OsStr) -> Option<&FileAttr> {
        let uuid = self.names.get(&(parent.clone(), name.to_os_string()))?;
        self.peek(uuid)
    }

    /// Identifiers of the cached children of `parent`.
    #[must_use]
    pub fn children_of(&self, parent: &Uuid) -> Vec<Uuid> {
        self.children
            .get(parent)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether any cached entry names `parent` as its parent.
    #[must_use]
    pub fn has_children(&self, parent: &Uuid) -> bool {
        self.children.get(parent).is_some_and(|set| !set.is_empty())
    }

    /// Identifiers in least-recently-used-first order.
    pub fn lru_order(&self) -> impl Iterator<Item = &Uuid> + '_ {
        self.entries.keys()
    }

    /// Remembers that `uuid` no longer exists remotely.
    pub fn mark_deleted(&mut self, uuid: Uuid) {
        self.deleted.insert(uuid);
    }

    /// Whether `uuid` was marked deleted.
    #[must_use]
    pub fn is_deleted(&self, uuid: &Uuid) -> bool {
        self.deleted.contains(uuid)
    }

    /// Pinned entries plus every ancestor of a pinned entry, along with `extra` and its ancestors.
    #[must_use]
    pub fn protected_set(&self, extra: Option<&Uuid>) -> FxHashSet<Uuid> {
        let mut protected = FxHashSet::default();
        for start in self.pinned.iter().chain(extra) {
            let mut cursor = Some(start.clone());
            while let Some(current) = cursor {
                if !protected.insert(current.clone()) {
                    break;
                }
                cursor = self
                    .entries
                    .get(&current)
                    .and_then(|slot| slot.attr.parent.clone());
            }
        }
        protected
    }

    fn is_protected(&self, uuid: &Uuid) -> bool {
        if self.pinned.contains(uuid) {
            return true;
        }
        // Walk up from every pinned entry; pins are few compared to entries.
        self.pinned.iter().any(|pinned| {
            let mut cursor = self
                .entries
                .get(pinned)
                .and_then(|slot| slot.attr.parent.clone());
            while let Some(current) = cursor {
                if &current == uuid {
                    return true;
                }
                cursor = self
                    .entries
                    .get(&current)
                    .and_then(|slot| slot.attr.parent.clone());
            }
            false
        })
    }

    fn index(&mut self, attr: &FileAttr) {
        let Some(parent) = &attr.parent else {
            return;
        };
        self.children
            .entry(parent.clone())
            .or_default()
            .insert(attr.uuid.clone());
        self.names
            .insert((parent.clone(), attr.name.clone()), attr.uuid.clone());
    }

    fn unindex(&mut self, attr: &FileAttr) {
        if let Some(parent) = &attr.parent {
            self.unindex_key(parent, attr.name.clone(), &attr.uuid);
        }
    }

    fn unindex_key(&mut self, parent: &Uuid, name: OsString, uuid: &Uuid) {
        if let Some(set) = self.children.get_mut(parent) {
            set.remove(uuid);
            if set.is_empty() {
                self.children.remove(parent);
            }
        }
        let key = (parent.clone(), name);
        if self.names.get(&key) == Some(uuid) {
            self.names.remove(&key);
        }
    }
}
