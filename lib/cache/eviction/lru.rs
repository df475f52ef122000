//! Implements the LRU capacity policy.

use tracing::{debug, warn};

use crate::cache::CacheState;
use crate::fs::Uuid;

/// Evicts least-recently-used entries until the store holds at most `capacity` entries.
///
/// Victims are taken leaf-first: an entry that still has cached children is skipped until its
/// children are gone, so a retained child never loses its cached parent. `keep` (typically the
/// entry just inserted) is protected along with its ancestors. Stops early, leaving the store
/// over capacity, if every remaining entry is protected.
///
/// Returns the evicted identifiers in eviction order.
pub(crate) fn enforce_capacity(
    state: &mut CacheState,
    capacity: usize,
    keep: Option<&Uuid>,
) -> Vec<Uuid> {
    let mut evicted = Vec::new();
    if state.store.len() <= capacity {
        return evicted;
    }

    let protected = state.store.protected_set(keep);
    while state.store.len() > capacity {
        let victim = state
            .store
            .lru_order()
            .find(|uuid| !protected.contains(*uuid) && !state.store.has_children(uuid))
            .cloned();
        let Some(victim) = victim else {
            warn!(
                size = state.store.len(),
                capacity, "every cached entry is protected, cannot evict further"
            );
            break;
        };
        state.evict_entry(&victim);
        debug!(uuid = %victim, "evicted least recently used entry");
        evicted.push(victim);
    }
    evicted
}
