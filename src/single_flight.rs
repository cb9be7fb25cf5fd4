use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::trace;

/// Collapses concurrent computations for the same key into one.
///
/// The first caller for a key runs its future; everybody arriving while it is still running waits for it and gets a
/// clone of the same outcome. Once the computation completes the key is forgotten, so the next call computes anew.
/// If the running caller is cancelled, one of the waiters takes over with its own future.
#[derive(Debug)]
pub struct SingleFlight<K, V> {
    flights: Mutex<HashMap<K, Arc<OnceCell<V>>>>,
}

impl<K, V> Default for SingleFlight<K, V> {
    fn default() -> Self {
        Self {
            flights: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Debug + Hash + Eq + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn run<F, Fut>(&self, key: &K, compute: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        let cell = {
            let mut flights = self.flights.lock();
            match flights.get(key) {
                Some(cell) => {
                    trace!(?key, "joining in-flight computation");
                    Arc::clone(cell)
                }
                None => {
                    let cell = Arc::new(OnceCell::new());
                    flights.insert(key.clone(), Arc::clone(&cell));
                    cell
                }
            }
        };

        let value = cell.get_or_init(compute).await.clone();

        let mut flights = self.flights.lock();
        if flights.get(key).is_some_and(|c| Arc::ptr_eq(c, &cell)) {
            flights.remove(key);
        }

        value
    }

    /// Number of keys with a computation in progress.
    pub fn in_flight(&self) -> usize {
        self.flights.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_computation() {
        let flight = Arc::new(SingleFlight::<&'static str, u64>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let flight = flight.clone();
            let calls = calls.clone();
            tasks.push(tokio::spawn(async move {
                flight
                    .run(&"k", || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        42
                    })
                    .await
            }));
        }

        for task in tasks {
            assert_eq!(task.await.unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(flight.in_flight(), 0);

        // Completed flights are not cached.
        assert_eq!(flight.run(&"k", || async { 7 }).await, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_leader_is_replaced() {
        let flight = Arc::new(SingleFlight::<&'static str, u64>::new());

        let leader = {
            let flight = flight.clone();
            tokio::spawn(async move {
                flight
                    .run(&"k", || async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        1
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let follower = {
            let flight = flight.clone();
            tokio::spawn(async move { flight.run(&"k", || async { 2 }).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        leader.abort();
        assert_eq!(follower.await.unwrap(), 2);
        assert_eq!(flight.in_flight(), 0);
    }
}
