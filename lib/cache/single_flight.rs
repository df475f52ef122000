//! Deduplication of concurrent async computations per key.
//!
//! Given a key and an async factory, ensures at most one factory runs per key at a time.
//! Callers arriving while a computation is in flight await the same [`Shared`] future. Unlike a
//! cache, nothing is retained once the computation finishes: the next caller starts a fresh one.

use std::panic::AssertUnwindSafe;
use std::{fmt::Debug, future::Future, hash::Hash, pin::Pin};

use futures::FutureExt as _;
use futures::future::Shared;

type SharedFut<V> = Shared<Pin<Box<dyn Future<Output = Option<V>> + Send>>>;

/// In-flight computations keyed by `K`.
pub struct SingleFlight<K, V: Clone + Send + 'static> {
    flights: scc::HashMap<K, SharedFut<V>>,
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash,
    V: Clone + Send + 'static,
{
    fn default() -> Self {
        Self {
            flights: scc::HashMap::default(),
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Debug + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Runs `factory` for `key`, or joins the run already in flight for it.
    ///
    /// Returns `None` if the factory panicked; the panic is contained and the slot is cleared
    /// so the next caller retries.
    pub async fn run<F, Fut>(&self, key: K, factory: F) -> Option<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let shared = match self.flights.entry_async(key.clone()).await {
            scc::hash_map::Entry::Occupied(occ) => occ.get().clone(),
            scc::hash_map::Entry::Vacant(vac) => {
                let shared = Self::make_shared(factory);
                vac.insert_entry(shared.clone());
                shared
            }
        };

        let result = shared.clone().await;

        // Only clear our own flight; a newer one may already occupy the slot.
        drop(
            self.flights
                .remove_if_async(&key, |current| current.ptr_eq(&shared))
                .await,
        );
        result
    }

    /// Wrap a factory future in `catch_unwind`, producing a `Shared` with `Output = Option<V>`.
    fn make_shared<F, Fut>(factory: F) -> SharedFut<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let fut = AssertUnwindSafe(factory()).catch_unwind();
        let boxed: Pin<Box<dyn Future<Output = Option<V>> + Send>> =
            Box::pin(async move { fut.await.ok() });
        boxed.shared()
    }

    /// Number of computations currently in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_callers_share_one_run() {
        let flights: Arc<SingleFlight<u32, u32>> = Arc::new(SingleFlight::default());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let flights = Arc::clone(&flights);
            let runs = Arc::clone(&runs);
            tasks.push(tokio::spawn(async move {
                flights
                    .run(7, || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        42
                    })
                    .await
            }));
        }
        for task in tasks {
            assert_eq!(task.await.ok().flatten(), Some(42));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn panicking_factory_yields_none_and_clears_the_slot() {
        let flights: SingleFlight<u32, u32> = SingleFlight::default();
        let out = flights
            .run(1, || async { panic!("boom") })
            .await;
        assert_eq!(out, None);
        assert_eq!(flights.run(1, || async { 5 }).await, Some(5));
    }
}
