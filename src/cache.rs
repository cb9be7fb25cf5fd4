use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use fieldx_plus::fx_plus;
use moka::future::Cache;
use moka::policy::EvictionPolicy;
use tokio::time::Instant;
use tracing::trace;

/// An immutable cached value together with its own time-to-live.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    value:      V,
    created_at: Instant,
    ttl:        Duration,
}

impl<V> CacheEntry<V> {
    pub fn new(value: V, ttl: Duration) -> Self {
        Self {
            value,
            created_at: Instant::now(),
            ttl,
        }
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// An entry is fresh for `[created_at, created_at + ttl)`.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) >= self.ttl
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    pub fn remaining(&self) -> Duration {
        self.ttl.saturating_sub(self.created_at.elapsed())
    }
}

/// Key/value cache with per-entry expiry and access to expired values.
///
/// The store never populates itself. Callers compute the authoritative value and [`put`](Self::put) it, choosing the
/// TTL per entry. Expired entries are not removed on expiry; they stay around as the stale fallback returned by
/// [`get_stale`](Self::get_stale) until they are replaced, invalidated, evicted by capacity, or outlive the
/// `stale_horizon`.
///
/// ```ignore
/// let earnings: Arc<CacheStore<AggregateKey, f64>> = CacheStore::builder()
///     .name("aggregates")
///     .max_capacity(50_000)
///     .build()?;
///
/// earnings.put(key.clone(), 12_000.0, Duration::from_secs(300)).await;
/// assert_eq!(earnings.get(&key).await, Some(12_000.0));
/// ```
#[fx_plus(
    parent,
    no_new,
    default(off),
    sync,
    builder(
        doc("Builder object of [`CacheStore`].", "", "See [`CacheStore::builder()`] method."),
        method_doc("Implement builder pattern for [`CacheStore`]."),
    )
)]
pub struct CacheStore<K, V>
where
    K: Debug + Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Cache name. Most useful for debugging and logging.
    #[fieldx(lock, optional, clearer, get(off))]
    name: &'static str,

    #[fieldx(get(copy), default(10_000))]
    max_capacity: u64,

    /// How long an entry is kept at all, expired or not.
    #[fieldx(get(copy), default(Duration::from_secs(24 * 3600)))]
    stale_horizon: Duration,

    #[fieldx(vis(pub(crate)), lazy, get(clone), builder(off))]
    cache: Arc<Cache<K, Arc<CacheEntry<V>>>>,
}

impl<K, V> CacheStore<K, V>
where
    K: Debug + Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn build_cache(&self) -> Arc<Cache<K, Arc<CacheEntry<V>>>> {
        Arc::new(
            Cache::builder()
                .max_capacity(self.max_capacity())
                .name(self.clear_name().unwrap_or_else(|| std::any::type_name::<V>()))
                .eviction_policy(EvictionPolicy::tiny_lfu())
                .time_to_live(self.stale_horizon())
                .build(),
        )
    }

    /// The cached value, only if its entry has not expired.
    pub async fn get(&self, key: &K) -> Option<V> {
        self.get_entry(key).await.map(|entry| entry.value().clone())
    }

    /// The unexpired entry for the key.
    pub async fn get_entry(&self, key: &K) -> Option<Arc<CacheEntry<V>>> {
        let entry = self.cache().get(key).await?;
        if entry.is_expired() {
            trace!(?key, "cache entry expired");
            None
        }
        else {
            Some(entry)
        }
    }

    /// The last value put under the key, expired or not.
    pub async fn get_stale(&self, key: &K) -> Option<V> {
        self.cache().get(key).await.map(|entry| entry.value().clone())
    }

    /// Replace whatever is cached under the key.
    pub async fn put(&self, key: K, value: V, ttl: Duration) {
        self.cache().insert(key, Arc::new(CacheEntry::new(value, ttl))).await;
    }

    pub async fn invalidate(&self, key: &K) {
        self.cache().invalidate(key).await;
    }

    pub fn invalidate_all(&self) {
        self.cache().invalidate_all();
    }

    /// Approximate number of entries, expired ones included.
    pub async fn entry_count(&self) -> u64 {
        let cache = self.cache();
        cache.run_pending_tasks().await;
        cache.entry_count()
    }
}

impl<K, V> Debug for CacheStore<K, V>
where
    K: Debug + Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("name", &self.cache().name())
            .field("max_capacity", &self.max_capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Arc<CacheStore<&'static str, i64>> {
        CacheStore::builder().name("test").max_capacity(100).build().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn hit_until_ttl_elapses() {
        let store = store();
        store.put("k", 42, Duration::from_secs(10)).await;

        assert_eq!(store.get(&"k").await, Some(42));
        tokio::time::advance(Duration::from_millis(9_999)).await;
        assert_eq!(store.get(&"k").await, Some(42));
        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(store.get(&"k").await, None);
        assert_eq!(store.get_stale(&"k").await, Some(42));
    }

    #[tokio::test(start_paused = true)]
    async fn put_replaces_entry() {
        let store = store();
        store.put("k", 1, Duration::from_secs(10)).await;
        tokio::time::advance(Duration::from_secs(8)).await;
        store.put("k", 2, Duration::from_secs(10)).await;
        tokio::time::advance(Duration::from_secs(8)).await;

        let entry = store.get_entry(&"k").await.unwrap();
        assert_eq!(*entry.value(), 2);
        assert_eq!(entry.remaining(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn invalidation_drops_stale_value_too() {
        let store = store();
        store.put("a", 1, Duration::from_secs(60)).await;
        store.put("b", 2, Duration::from_secs(60)).await;

        store.invalidate(&"a").await;
        assert_eq!(store.get(&"a").await, None);
        assert_eq!(store.get_stale(&"a").await, None);
        assert_eq!(store.get(&"b").await, Some(2));

        store.invalidate_all();
        assert_eq!(store.get_stale(&"b").await, None);
    }

    #[tokio::test]
    async fn zero_ttl_is_never_fresh() {
        let store = store();
        store.put("k", 7, Duration::ZERO).await;
        assert_eq!(store.get(&"k").await, None);
        assert_eq!(store.get_stale(&"k").await, Some(7));
    }
}
