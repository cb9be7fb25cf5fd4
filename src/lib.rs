//! # profile-store
//!
//! Data access layer for per-account game profiles: balance, unlocked cosmetics, statistics, and the ledger of
//! earnings and spending behind them.
//!
//! Player interactions produce a steady stream of small reads and writes against the same few rows. Sending each of
//! them to the database as-is is what this crate exists to avoid. It does so with three cooperating parts, glued
//! together by a façade:
//!
//! - [`ConnectionPool`] keeps a bounded set of database connections. Connections are validated before they are handed
//!   out, replaced when validation fails, reaped when idle for too long, and topped up to a floor by a periodic
//!   maintenance pass. Acquisition waits for a bounded time and then fails with the retriable
//!   [`StoreError::PoolExhausted`].
//! - [`CacheStore`] is a read-through cache where every entry carries its own time-to-live. Expired entries are kept
//!   as a stale fallback for when the storage is unavailable. [`TtlPolicy`] grows TTLs with the size of what they
//!   cover: aggregates that are expensive to recompute and slow to change are cached longer.
//! - [`WriteCoalescer`] buffers field writes per profile, last write wins, and turns them into one upsert per profile
//!   on a timer, on demand, or at session end. Failed writes stay buffered and are retried.
//! - [`ProfileService`] is what game logic talks to. It tracks each profile through its session
//!   (`Unloaded → Loading → Active → Flushing → Unloaded`), applies mutations to the in-memory copy, the cache, and the
//!   coalescer, and answers aggregate queries with concurrent recomputations collapsed into one.
//!
//! # Backends
//!
//! Storage is reached through two traits: [`ConnectionManager`] opens and probes physical connections and
//! [`ProfileStorage`] is implemented by a connection to run profile queries. The `sqlite` and `pg` features provide a
//! sea-orm implementation in [`db`]; the `test` feature provides an in-memory one with failure injection in
//! [`test::memory`].
//!
//! ```ignore
//! use profile_store::prelude::*;
//!
//! let manager = SqlConnectionManager::new("sqlite://profiles.db?mode=rwc");
//! manager.setup_schema().await?;
//!
//! let service = ProfileService::from_config(manager, &StoreConfig::from_file("store.json")?).await?;
//! let key = ProfileKey::from("5f0c1e0a-8f1d-4a47-9a77-5b3d1c8e2b6f");
//!
//! service.on_session_start(&key).await?;
//! service.mutate(&key, ProfileField::Balance, 150.into()).await?;
//! service.record_transaction(&key, LedgerKind::Earn, 25.0).await?;
//! let earned = service.get_aggregate(&key, AggregateKind::Earnings).await;
//! service.on_session_end(&key).await?;
//!
//! service.shutdown().await;
//! ```

pub mod cache;
pub mod coalescer;
pub mod config;
pub mod db;
pub mod error;
pub mod pool;
pub mod profile;
pub mod service;
pub mod single_flight;
pub mod test;
pub mod traits;
pub mod ttl;
pub mod types;

#[doc(inline)]
pub use cache::CacheStore;
#[doc(inline)]
pub use coalescer::WriteCoalescer;
#[doc(inline)]
pub use error::StoreError;
#[doc(inline)]
pub use pool::ConnectionPool;
#[doc(inline)]
pub use service::ProfileService;
#[doc(inline)]
pub use traits::ConnectionManager;
#[doc(inline)]
pub use traits::ProfileStorage;
#[doc(inline)]
pub use ttl::TtlPolicy;

pub mod prelude {
    pub use crate::cache::CacheEntry;
    pub use crate::cache::CacheStore;
    pub use crate::coalescer::FlushReport;
    pub use crate::coalescer::WriteCoalescer;
    pub use crate::config::StoreConfig;
    #[cfg(feature = "db")]
    pub use crate::db::SqlConnectionManager;
    pub use crate::error::Result;
    pub use crate::error::StoreError;
    pub use crate::pool::ConnectionPool;
    pub use crate::pool::PoolConnection;
    pub use crate::pool::PoolStats;
    pub use crate::profile::Profile;
    pub use crate::service::EntityState;
    pub use crate::service::ProfileService;
    pub use crate::single_flight::SingleFlight;
    pub use crate::traits::ConnectionManager;
    pub use crate::traits::FlushObserver;
    pub use crate::traits::ProfileStorage;
    pub use crate::ttl::TtlPolicy;
    pub use crate::ttl::TtlScale;
    pub use crate::types::*;
}
