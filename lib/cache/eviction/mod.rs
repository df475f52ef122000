//! Eviction policies for the entry store.
//!
//! Two independent triggers remove entries: the capacity bound, checked after every insertion,
//! and directory expiry, a time-driven sweep. Both leave protected entries alone: pinned entries
//! and every ancestor of a pinned entry.

mod expiry;
mod lru;

pub(crate) use expiry::{evict_subtree, sweep_expired};
pub(crate) use lru::enforce_capacity;
