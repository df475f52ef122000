//! Time-driven expiry of directory contents.

use rustc_hash::FxHashSet;
use tokio::time::Instant;
use tracing::debug;

use crate::cache::CacheState;
use crate::fs::{FileAttr, Uuid};

/// Drops every expired listing and evicts the children it covered.
///
/// Child directories are descended into when their own listing is absent or expired too; a child
/// directory with a fresh listing is kept together with its subtree. Protected entries and the
/// expired directories themselves stay cached.
///
/// Returns the directories whose listings were dropped.
pub(crate) fn sweep_expired(state: &mut CacheState, now: Instant) -> Vec<Uuid> {
    let expired: Vec<Uuid> = state
        .listings
        .iter()
        .filter(|(_, listing)| listing.is_expired(now))
        .map(|(dir, _)| dir.clone())
        .collect();
    if expired.is_empty() {
        return expired;
    }

    let protected = state.store.protected_set(None);
    let mut dropped = Vec::new();
    for dir in expired {
        dropped.extend(expire_dir(state, &dir, now, &protected));
    }
    dropped
}

fn expire_dir(
    state: &mut CacheState,
    dir: &Uuid,
    now: Instant,
    protected: &FxHashSet<Uuid>,
) -> Vec<Uuid> {
    let mut dropped = Vec::new();
    let mut evicted = 0usize;

    for child in state.store.children_of(dir) {
        if protected.contains(&child) {
            continue;
        }
        if state.store.peek(&child).is_some_and(FileAttr::is_dir) {
            let fresh = state
                .listings
                .get(&child)
                .is_some_and(|listing| !listing.is_expired(now));
            if fresh {
                continue;
            }
            dropped.extend(expire_dir(state, &child, now, protected));
            if state.store.has_children(&child) {
                continue;
            }
        }
        if state.evict_entry(&child).is_some() {
            evicted += 1;
        }
    }

    if state.listings.remove(dir).is_some() {
        dropped.push(dir.clone());
    }
    debug!(uuid = %dir, evicted, "directory listing expired");
    dropped
}

/// Evicts every unprotected cached descendant of `dir`, deepest first, and drops their listings.
///
/// `dir` itself is left in place. Returns the directories whose listings were dropped.
pub(crate) fn evict_subtree(
    state: &mut CacheState,
    dir: &Uuid,
    protected: &FxHashSet<Uuid>,
) -> Vec<Uuid> {
    let mut dropped = Vec::new();
    for child in state.store.children_of(dir) {
        if protected.contains(&child) {
            continue;
        }
        dropped.extend(evict_subtree(state, &child, protected));
        if state.store.has_children(&child) {
            continue;
        }
        if state.listings.contains_key(&child) {
            dropped.push(child.clone());
        }
        state.evict_entry(&child);
    }
    dropped
}
