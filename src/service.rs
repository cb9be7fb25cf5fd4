use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use fieldx_plus::fx_plus;
use parking_lot::Mutex;
use tokio::sync::OwnedMappedMutexGuard;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::cache::CacheStore;
use crate::coalescer::WriteCoalescer;
use crate::config::StoreConfig;
use crate::error::Result;
use crate::error::StoreError;
use crate::pool::ConnectionPool;
use crate::profile::Profile;
use crate::single_flight::SingleFlight;
use crate::traits::ConnectionManager;
use crate::traits::ProfileStorage;
use crate::ttl::TtlPolicy;
use crate::types::AggregateKey;
use crate::types::AggregateKind;
use crate::types::FieldValue;
use crate::types::LedgerEntry;
use crate::types::LedgerKind;
use crate::types::ProfileField;
use crate::types::ProfileKey;

/// Lifecycle phase of a profile as seen by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum EntityState {
    Unloaded,
    Loading,
    Active,
    Flushing,
}

enum SlotData {
    Unloaded,
    Active(Profile),
    // Session ended; the slot is gone from the session map and whoever still holds it must look the key up again.
    Retired,
}

struct EntitySlot {
    phase: Mutex<EntityState>,
    data:  Arc<tokio::sync::Mutex<SlotData>>,
}

impl EntitySlot {
    fn new() -> Self {
        Self {
            phase: Mutex::new(EntityState::Unloaded),
            data:  Arc::new(tokio::sync::Mutex::new(SlotData::Unloaded)),
        }
    }

    fn phase(&self) -> EntityState {
        *self.phase.lock()
    }

    fn set_phase(&self, phase: EntityState) {
        *self.phase.lock() = phase;
    }

    // Enter `phase`; unless `finish`ed, the guard puts `restore` back when dropped.
    fn enter(&self, phase: EntityState, restore: EntityState) -> PhaseGuard<'_> {
        self.set_phase(phase);
        PhaseGuard {
            slot:    self,
            restore: Some(restore),
        }
    }
}

struct PhaseGuard<'a> {
    slot:    &'a EntitySlot,
    restore: Option<EntityState>,
}

impl PhaseGuard<'_> {
    fn finish(mut self, phase: EntityState) {
        self.restore = None;
        self.slot.set_phase(phase);
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        if let Some(phase) = self.restore {
            self.slot.set_phase(phase);
        }
    }
}

/// The entry point for game logic: profile reads and writes, derived statistics, session lifecycle.
///
/// All collaborators are injected. The coalescer must write through the same pool the service reads from.
///
/// ```ignore
/// let service = ProfileService::from_config(SqlConnectionManager::new(url), &StoreConfig::default()).await?;
///
/// service.on_session_start(&key).await?;
/// service.mutate(&key, ProfileField::Balance, 150.into()).await?;
/// let earned = service.get_aggregate(&key, AggregateKind::Earnings).await;
/// service.on_session_end(&key).await?;
/// ```
#[fx_plus(
    parent,
    no_new,
    default(off),
    sync,
    builder(
        doc("Builder object of [`ProfileService`].", "", "See [`ProfileService::builder()`] method."),
        method_doc("Implement builder pattern for [`ProfileService`]."),
    )
)]
pub struct ProfileService<M>
where
    M: ConnectionManager,
{
    #[fieldx(vis(pub(crate)), builder(vis(pub), required, into), get(clone))]
    pool: Arc<ConnectionPool<M>>,

    #[fieldx(vis(pub(crate)), builder(vis(pub), required, into), get(clone))]
    coalescer: Arc<WriteCoalescer<M>>,

    #[fieldx(vis(pub(crate)), builder(vis(pub), required, into), get(clone))]
    profiles: Arc<CacheStore<ProfileKey, Profile>>,

    #[fieldx(vis(pub(crate)), builder(vis(pub), required, into), get(clone))]
    aggregates: Arc<CacheStore<AggregateKey, f64>>,

    /// How long a cached profile is trusted without asking the storage.
    #[fieldx(get(copy), default(Duration::from_secs(30 * 60)))]
    profile_ttl: Duration,

    #[fieldx(get(copy), default(TtlPolicy::earnings()))]
    earnings_ttl: TtlPolicy,

    #[fieldx(get(copy), default(TtlPolicy::spending()))]
    spending_ttl: TtlPolicy,

    #[fieldx(get(copy), default(TtlPolicy::stats()))]
    stats_ttl: TtlPolicy,

    #[fieldx(builder(off), default(Mutex::new(HashMap::new())))]
    sessions: Mutex<HashMap<ProfileKey, Arc<EntitySlot>>>,

    #[fieldx(builder(off), default(SingleFlight::new()))]
    flights: SingleFlight<AggregateKey, Result<f64>>,
}

impl<M> ProfileService<M>
where
    M: ConnectionManager,
{
    /// Build the whole stack from configuration and warm the pool up.
    pub async fn from_config(manager: M, config: &StoreConfig) -> Result<Arc<Self>> {
        let pool = config.pool.build_pool(manager)?;
        pool.init().await;

        let coalescer = WriteCoalescer::builder()
            .pool(Arc::clone(&pool))
            .flush_interval(config.coalescer.flush_interval)
            .max_pending(config.coalescer.max_pending)
            .build()
            .map_err(|e| StoreError::Build(e.to_string()))?;

        let profiles = CacheStore::builder()
            .name("profiles")
            .max_capacity(config.cache.profile_capacity)
            .build()
            .map_err(|e| StoreError::Build(e.to_string()))?;

        let aggregates = CacheStore::builder()
            .name("aggregates")
            .max_capacity(config.cache.aggregate_capacity)
            .build()
            .map_err(|e| StoreError::Build(e.to_string()))?;

        Self::builder()
            .pool(pool)
            .coalescer(coalescer)
            .profiles(profiles)
            .aggregates(aggregates)
            .profile_ttl(config.cache.profile_ttl)
            .earnings_ttl(config.cache.earnings)
            .spending_ttl(config.cache.spending)
            .stats_ttl(config.cache.stats)
            .build()
            .map_err(|e| StoreError::Build(e.to_string()))
    }

    /// The profile of the key: the active copy, else the cached one, else the stored one, else a fresh default.
    pub async fn get(&self, key: &ProfileKey) -> Result<Profile> {
        Ok(self.lock_active(key).await?.clone())
    }

    /// Set a field of the profile. The change is visible immediately and reaches the storage with the next flush.
    #[instrument(level = "debug", skip(self, value))]
    pub async fn mutate(&self, key: &ProfileKey, field: ProfileField, value: FieldValue) -> Result<()> {
        let mut profile = self.lock_active(key).await?;
        profile.apply(field, &value)?;

        self.profiles
            .put(key.clone(), profile.clone(), self.profile_ttl())
            .await;
        self.coalescer.enqueue(key.clone(), field, value);

        if let Some(stat) = field.stat_aggregate() {
            let snapshot = profile.field(field).as_integer().unwrap_or_default() as f64;
            let ttl = self.stats_ttl().ttl_for(1, snapshot);
            self.aggregates.put((key.clone(), stat), snapshot, ttl).await;
            self.aggregates
                .invalidate(&(key.clone(), AggregateKind::Earnings))
                .await;
        }

        Ok(())
    }

    /// A derived statistic. Served from the cache while fresh; recomputed otherwise, with concurrent recomputations of
    /// the same statistic collapsed into one. When recomputation fails the last known value is returned, or zero if
    /// there never was one.
    #[instrument(level = "debug", skip(self))]
    pub async fn get_aggregate(&self, key: &ProfileKey, kind: AggregateKind) -> f64 {
        let akey = (key.clone(), kind);
        if let Some(value) = self.aggregates.get(&akey).await {
            return value;
        }

        let cached_key = &akey;
        let computed = self
            .flights
            .run(&akey, || async move {
                // A flight that finished just before this one started may have filled the cache already.
                if let Some(value) = self.aggregates.get(cached_key).await {
                    return Ok(value);
                }
                self.recompute(key, kind).await
            })
            .await;

        match computed {
            Ok(value) => value,
            Err(err) => match self.aggregates.get_stale(&akey).await {
                Some(stale) => {
                    warn!(%key, %kind, error = %err, stale, "aggregate recomputation failed, serving last known value");
                    stale
                }
                None => {
                    warn!(%key, %kind, error = %err, "aggregate recomputation failed, no previous value");
                    0.0
                }
            },
        }
    }

    /// Append a ledger event and drop the aggregate it feeds.
    #[instrument(level = "debug", skip(self))]
    pub async fn record_transaction(&self, key: &ProfileKey, kind: LedgerKind, amount: f64) -> Result<()> {
        let entry = LedgerEntry::now(key.clone(), kind, amount);
        let mut conn = self.pool.acquire().await?;
        match conn.append_ledger(&entry).await {
            Ok(()) => conn.release().await,
            Err(err) => {
                conn.discard().await;
                return Err(err);
            }
        }
        self.aggregates.invalidate(&(key.clone(), kind.into())).await;
        Ok(())
    }

    pub async fn on_session_start(&self, key: &ProfileKey) -> Result<Profile> {
        debug!(%key, "session started");
        self.get(key).await
    }

    /// Write out the key's pending fields and retire its active copy.
    ///
    /// Requests for the key arriving meanwhile wait for this to finish and then load the profile anew. When the final
    /// write fails the fields stay queued for the background flusher and the error is returned; the profile is retired
    /// regardless.
    #[instrument(level = "debug", skip(self))]
    pub async fn on_session_end(&self, key: &ProfileKey) -> Result<()> {
        let slot = self.sessions.lock().get(key).cloned();
        let Some(slot) = slot
        else {
            self.coalescer.flush_one(key, true).await?;
            self.profiles.invalidate(key).await;
            return Ok(());
        };

        let mut data = slot.data.lock().await;
        if matches!(*data, SlotData::Retired) {
            return Ok(());
        }

        let phase = slot.enter(EntityState::Flushing, slot.phase());
        let flushed = self.coalescer.flush_one(key, true).await;
        match &flushed {
            // The next session reloads from the storage.
            Ok(()) => self.profiles.invalidate(key).await,
            // The cached copy stays as the fallback for a reload while the storage is down.
            Err(err) => warn!(%key, error = %err, "final write of an ending session failed, it stays queued"),
        }

        *data = SlotData::Retired;
        self.forget_slot(key, &slot);
        phase.finish(EntityState::Unloaded);
        debug!(%key, "session ended");

        flushed
    }

    pub fn state_of(&self, key: &ProfileKey) -> EntityState {
        self.sessions
            .lock()
            .get(key)
            .map_or(EntityState::Unloaded, |slot| slot.phase())
    }

    /// Keys whose profile is currently active.
    pub fn active_keys(&self) -> Vec<ProfileKey> {
        self.sessions
            .lock()
            .iter()
            .filter(|(_, slot)| slot.phase() == EntityState::Active)
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Stop background work, write out everything pending, close the pool.
    pub async fn shutdown(&self) {
        let report = self.coalescer.close().await;
        self.pool.close().await;
        info!(
            written = report.written,
            requeued = report.requeued,
            "profile service shut down"
        );
    }

    fn forget_slot(&self, key: &ProfileKey, slot: &Arc<EntitySlot>) {
        let mut sessions = self.sessions.lock();
        if sessions.get(key).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            sessions.remove(key);
        }
    }

    fn slot(&self, key: &ProfileKey) -> Arc<EntitySlot> {
        Arc::clone(
            self.sessions
                .lock()
                .entry(key.clone())
                .or_insert_with(|| Arc::new(EntitySlot::new())),
        )
    }

    // Lock the key's slot, loading the profile first if it is not active yet.
    async fn lock_active(&self, key: &ProfileKey) -> Result<OwnedMappedMutexGuard<SlotData, Profile>> {
        loop {
            let slot = self.slot(key);
            let mut data = Arc::clone(&slot.data).lock_owned().await;

            let loaded = match &*data {
                SlotData::Retired => continue,
                SlotData::Active(_) => true,
                SlotData::Unloaded => false,
            };

            if !loaded {
                let phase = slot.enter(EntityState::Loading, EntityState::Unloaded);
                match self.load(key).await {
                    Ok(profile) => {
                        *data = SlotData::Active(profile);
                        phase.finish(EntityState::Active);
                    }
                    Err(err) => {
                        // Callers queued on this slot move on to a fresh one.
                        *data = SlotData::Retired;
                        self.forget_slot(key, &slot);
                        phase.finish(EntityState::Unloaded);
                        return Err(err);
                    }
                }
            }

            if let Ok(profile) = OwnedMutexGuard::try_map(data, |data| match data {
                SlotData::Active(profile) => Some(profile),
                _ => None,
            }) {
                return Ok(profile);
            }
        }
    }

    // Cache, then storage, then defaults. Writes still waiting in the coalescer are newer than anything stored and are
    // laid over the result.
    async fn load(&self, key: &ProfileKey) -> Result<Profile> {
        let mut profile = match self.profiles.get(key).await {
            Some(cached) => {
                debug!(%key, "profile served from cache");
                cached
            }
            None => match self.fetch(key).await {
                Ok(Some(stored)) => stored,
                Ok(None) => {
                    debug!(%key, "no stored profile, creating defaults");
                    Profile::new_default(key.clone())
                }
                Err(err) => match self.profiles.get_stale(key).await {
                    Some(stale) => {
                        warn!(%key, error = %err, "profile load failed, using the last cached copy");
                        stale
                    }
                    None => return Err(err),
                },
            },
        };

        let pending = self.coalescer.pending_for(key);
        if !pending.is_empty() {
            if let Err(err) = profile.apply_all(&pending) {
                warn!(%key, error = %err, "pending writes do not fit the profile");
            }
        }

        self.profiles
            .put(key.clone(), profile.clone(), self.profile_ttl())
            .await;
        Ok(profile)
    }

    async fn fetch(&self, key: &ProfileKey) -> Result<Option<Profile>> {
        let mut conn = self.pool.acquire().await?;
        match conn.load_profile(key).await {
            Ok(profile) => {
                conn.release().await;
                Ok(profile)
            }
            Err(err) => {
                conn.discard().await;
                Err(err)
            }
        }
    }

    fn ttl_policy(&self, kind: AggregateKind) -> TtlPolicy {
        match kind {
            AggregateKind::Earnings => self.earnings_ttl(),
            AggregateKind::Spending => self.spending_ttl(),
            AggregateKind::Kills | AggregateKind::Deaths => self.stats_ttl(),
        }
    }

    #[instrument(level = "debug", skip(self))]
    async fn recompute(&self, key: &ProfileKey, kind: AggregateKind) -> Result<f64> {
        let mut conn = self.pool.acquire().await?;

        let computed = match (kind.ledger_kind(), kind.stat_field()) {
            (Some(ledger_kind), _) => conn.ledger_amounts(key, ledger_kind).await.map(|amounts| {
                let records = amounts.len() as u64;
                let mut ignored = 0;
                let total = amounts
                    .into_iter()
                    .filter(|amount| {
                        let keep = *amount >= 0.0;
                        ignored += usize::from(!keep);
                        keep
                    })
                    .sum::<f64>();
                if ignored > 0 {
                    warn!(%key, %kind, ignored, "negative ledger amounts ignored");
                }
                (total, records)
            }),
            (None, Some(field)) => conn.load_profile(key).await.map(|stored| {
                let mut profile = stored.unwrap_or_else(|| Profile::new_default(key.clone()));
                if let Some(value) = self.coalescer.pending_for(key).get(&field) {
                    let _ = profile.apply(field, value);
                }
                (profile.field(field).as_integer().unwrap_or_default() as f64, 1)
            }),
            (None, None) => Ok((0.0, 0)),
        };

        let (value, records) = match computed {
            Ok(computed) => {
                conn.release().await;
                computed
            }
            Err(err) => {
                conn.discard().await;
                return Err(err);
            }
        };

        let ttl = self.ttl_policy(kind).ttl_for(records, value);
        debug!(%key, %kind, value, records, ?ttl, "aggregate recomputed");
        self.aggregates.put((key.clone(), kind), value, ttl).await;
        Ok(value)
    }
}

impl<M> Debug for ProfileService<M>
where
    M: ConnectionManager,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileService")
            .field("pool", &self.pool)
            .field("coalescer", &self.coalescer)
            .field("sessions", &self.sessions.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::memory::MemoryDatabase;
    use crate::test::memory::MemoryManager;

    async fn service(db: &Arc<MemoryDatabase>) -> Arc<ProfileService<MemoryManager>> {
        ProfileService::from_config(db.manager(), &StoreConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn lifecycle_states() {
        let db = MemoryDatabase::new();
        let svc = service(&db).await;
        let key = ProfileKey::from("p");

        assert_eq!(svc.state_of(&key), EntityState::Unloaded);
        let profile = svc.on_session_start(&key).await.unwrap();
        assert_eq!(profile, Profile::new_default(key.clone()));
        assert_eq!(svc.state_of(&key), EntityState::Active);
        assert_eq!(svc.active_keys(), vec![key.clone()]);

        svc.on_session_end(&key).await.unwrap();
        assert_eq!(svc.state_of(&key), EntityState::Unloaded);
        assert!(svc.active_keys().is_empty());
        svc.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stored_profile_is_loaded_once() {
        let db = MemoryDatabase::new();
        let key = ProfileKey::from("p");
        let mut stored = Profile::new_default(key.clone());
        stored.balance = 500;
        stored.unlocked_items = vec!["WOOL".into()];
        db.insert_profile(stored.clone());

        let svc = service(&db).await;
        assert_eq!(svc.get(&key).await.unwrap(), stored);
        assert_eq!(svc.get(&key).await.unwrap(), stored);
        assert_eq!(db.profile_loads(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn mutation_type_mismatch_is_rejected() {
        let db = MemoryDatabase::new();
        let svc = service(&db).await;
        let key = ProfileKey::from("p");

        let err = svc
            .mutate(&key, ProfileField::SelectedItem, 5.into())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::FieldType { .. }));
        assert!(svc.coalescer().pending_keys().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stat_mutation_refreshes_snapshot() {
        let db = MemoryDatabase::new();
        let svc = service(&db).await;
        let key = ProfileKey::from("p");

        db.add_ledger(&key, LedgerKind::Earn, 50.0);
        assert_eq!(svc.get_aggregate(&key, AggregateKind::Earnings).await, 50.0);

        svc.mutate(&key, ProfileField::Kills, 7.into()).await.unwrap();
        let reads = db.ledger_reads();
        assert_eq!(svc.get_aggregate(&key, AggregateKind::Kills).await, 7.0);
        // Earnings were invalidated by the stat update.
        assert_eq!(svc.get_aggregate(&key, AggregateKind::Earnings).await, 50.0);
        assert_eq!(db.ledger_reads(), reads + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stat_recomputed_from_storage_and_pending() {
        let db = MemoryDatabase::new();
        let svc = service(&db).await;
        let key = ProfileKey::from("p");
        let mut stored = Profile::new_default(key.clone());
        stored.deaths = 3;
        db.insert_profile(stored);

        assert_eq!(svc.get_aggregate(&key, AggregateKind::Deaths).await, 3.0);
    }

    #[tokio::test(start_paused = true)]
    async fn negative_ledger_amounts_are_ignored() {
        let db = MemoryDatabase::new();
        let svc = service(&db).await;
        let key = ProfileKey::from("p");

        svc.record_transaction(&key, LedgerKind::Spend, 300.0).await.unwrap();
        svc.record_transaction(&key, LedgerKind::Spend, -100.0).await.unwrap();
        assert_eq!(svc.get_aggregate(&key, AggregateKind::Spending).await, 300.0);

        // Recording drops the cached total.
        svc.record_transaction(&key, LedgerKind::Spend, 200.0).await.unwrap();
        assert_eq!(svc.get_aggregate(&key, AggregateKind::Spending).await, 500.0);
    }

    #[tokio::test(start_paused = true)]
    async fn load_failure_without_cache_is_reported() {
        let db = MemoryDatabase::new();
        let svc = service(&db).await;
        let key = ProfileKey::from("p");

        db.set_failing(true);
        assert!(svc.get(&key).await.unwrap_err().is_retriable());
        assert_eq!(svc.state_of(&key), EntityState::Unloaded);

        db.set_failing(false);
        assert!(svc.get(&key).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn rejoin_reads_changes_made_while_offline() {
        let db = MemoryDatabase::new();
        let svc = service(&db).await;
        let key = ProfileKey::from("p");

        svc.on_session_start(&key).await.unwrap();
        svc.mutate(&key, ProfileField::Balance, 150.into()).await.unwrap();
        svc.on_session_end(&key).await.unwrap();
        let loads = db.profile_loads();

        let mut changed = db.stored_profile(&key).unwrap();
        changed.balance = 999;
        db.insert_profile(changed);

        assert_eq!(svc.on_session_start(&key).await.unwrap().balance, 999);
        assert_eq!(db.profile_loads(), loads + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn interrupted_session_end_keeps_the_profile_active() {
        let db = MemoryDatabase::new();
        let svc = service(&db).await;
        let key = ProfileKey::from("p");

        svc.mutate(&key, ProfileField::Kills, 2.into()).await.unwrap();
        db.set_latency(Duration::from_millis(100));

        let ending = {
            let svc = svc.clone();
            let key = key.clone();
            tokio::spawn(async move { svc.on_session_end(&key).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(svc.state_of(&key), EntityState::Flushing);

        ending.abort();
        assert!(ending.await.unwrap_err().is_cancelled());

        assert_eq!(svc.state_of(&key), EntityState::Active);
        assert_eq!(svc.active_keys(), vec![key.clone()]);
        assert_eq!(svc.coalescer().pending_keys(), vec![key.clone()]);

        db.set_latency(Duration::ZERO);
        svc.on_session_end(&key).await.unwrap();
        assert_eq!(db.stored_profile(&key).unwrap().kills, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_loads_leave_no_slots_behind() {
        let db = MemoryDatabase::new();
        let svc = service(&db).await;

        db.set_failing(true);
        for i in 0..10 {
            let key = ProfileKey::from(format!("p{i}"));
            assert!(svc.get(&key).await.is_err());
        }
        assert!(svc.sessions.lock().is_empty());

        db.set_failing(false);
        assert!(svc.get(&"p0".into()).await.is_ok());
        assert_eq!(svc.sessions.lock().len(), 1);
    }
}
