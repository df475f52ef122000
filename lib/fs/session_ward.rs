//! Reference-counted sharing of storage sessions.
//!
//! [`SessionWard`] tracks how many open handles reference each (storage, file) pair and hands the
//! session back to the caller when a pair's count reaches zero. Closing a session is async, so
//! the ward does not close anything itself: whoever receives the session from
//! [`dec`](SessionWard::dec) owns the close.
//!
//! # Concurrency
//!
//! Not thread-safe. All access requires `&mut self`. Wrap in a `Mutex` if shared across threads.

use std::hash::Hash;
use std::sync::Arc;

use rustc_hash::FxHashMap;

#[derive(Debug)]
struct Entry<S> {
    session: Arc<S>,
    refs: usize,
}

/// Sessions keyed by `K`, each with a reference count.
#[derive(Debug)]
pub struct SessionWard<K, S> {
    map: FxHashMap<K, Entry<S>>,
}

impl<K, S> Default for SessionWard<K, S> {
    fn default() -> Self {
        Self {
            map: FxHashMap::default(),
        }
    }
}

impl<K: Eq + Hash, S> SessionWard<K, S> {
    /// Takes another reference on an existing session. `None` if no session is open for `key`.
    pub fn inc(&mut self, key: &K) -> Option<Arc<S>> {
        let entry = self.map.get_mut(key)?;
        entry.refs += 1;
        Some(Arc::clone(&entry.session))
    }

    /// Registers a freshly opened session with one reference.
    ///
    /// Returns the session to use, plus the fresh session back if another caller registered one
    /// for `key` first. In that case the earlier session gains the reference and the spare is
    /// the caller's to close.
    pub fn insert(&mut self, key: K, session: Arc<S>) -> (Arc<S>, Option<Arc<S>>) {
        if let Some(existing) = self.map.get_mut(&key) {
            existing.refs += 1;
            return (Arc::clone(&existing.session), Some(session));
        }
        self.map.insert(
            key,
            Entry {
                session: Arc::clone(&session),
                refs: 1,
            },
        );
        (session, None)
    }

    /// Drops one reference. Returns the session once its count reaches zero.
    pub fn dec(&mut self, key: &K) -> Option<Arc<S>> {
        let entry = self.map.get_mut(key)?;
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs > 0 {
            return None;
        }
        self.map.remove(key).map(|entry| entry.session)
    }

    /// Current reference count of `key`.
    #[must_use]
    pub fn refs(&self, key: &K) -> usize {
        self.map.get(key).map_or(0, |entry| entry.refs)
    }

    /// Number of open sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns `true` if no session is open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
