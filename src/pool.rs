//! Bounded pool of physical connections.
//!
//! Checkout is bounded by a semaphore holding `max_size` permits; every checked-out connection owns one. Idle
//! connections hold no permit. Pool bookkeeping (the idle queue and the active count) lives behind a single mutex,
//! which keeps `idle + active <= max_size` easy to check: a borrower only opens a new connection when the idle queue
//! is empty, and a refill only reserves a slot after checking the total under that mutex.
use std::collections::VecDeque;
use std::fmt::Debug;
use std::ops::Deref;
use std::ops::DerefMut;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use fieldx_plus::fx_plus;
use parking_lot::Mutex;
use tokio::sync::OwnedSemaphorePermit;
use tokio::sync::Semaphore;
use tokio::sync::TryAcquireError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::error::Result;
use crate::error::StoreError;
use crate::traits::ConnectionManager;

/// A physical connection plus the pool's bookkeeping about it.
#[derive(Debug)]
pub struct PooledConnection<C> {
    id:           u64,
    conn:         C,
    created_at:   Instant,
    last_used_at: Instant,
    use_count:    u64,
    valid:        bool,
}

impl<C> PooledConnection<C> {
    fn new(id: u64, conn: C) -> Self {
        let now = Instant::now();
        Self {
            id,
            conn,
            created_at: now,
            last_used_at: now,
            use_count: 0,
            valid: true,
        }
    }

    fn mark_used(&mut self) {
        self.last_used_at = Instant::now();
        self.use_count += 1;
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used_at(&self) -> Instant {
        self.last_used_at
    }

    pub fn use_count(&self) -> u64 {
        self.use_count
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used_at)
    }
}

struct PoolState<C> {
    // Front is the connection idle for the longest time.
    idle:   VecDeque<PooledConnection<C>>,
    active: usize,
    closed: bool,
}

impl<C> Default for PoolState<C> {
    fn default() -> Self {
        Self {
            idle:   VecDeque::new(),
            active: 0,
            closed: false,
        }
    }
}

#[derive(Debug, Default)]
struct PoolCounters {
    next_id:   AtomicU64,
    created:   AtomicU64,
    discarded: AtomicU64,
    waits:     AtomicU64,
    timeouts:  AtomicU64,
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub idle:      usize,
    pub active:    usize,
    pub total:     usize,
    /// Connections opened over the pool's lifetime.
    pub created:   u64,
    /// Connections closed because they failed validation, idled out, or were dropped by a borrower.
    pub discarded: u64,
    /// Acquisitions that had to wait for a free slot.
    pub waits:     u64,
    /// Acquisitions that gave up with [`StoreError::PoolExhausted`].
    pub timeouts:  u64,
}

/// Connection pool over a [`ConnectionManager`].
///
/// ```ignore
/// let pool = ConnectionPool::builder()
///     .manager(SqlConnectionManager::new("sqlite://profiles.db?mode=rwc"))
///     .max_size(10)
///     .min_size(3)
///     .build()?;
/// pool.init().await;
///
/// let mut conn = pool.acquire().await?;
/// let profile = conn.load_profile(&key).await?;
/// conn.release().await;
/// ```
#[fx_plus(
    parent,
    no_new,
    default(off),
    sync,
    builder(
        doc("Builder object of [`ConnectionPool`].", "", "See [`ConnectionPool::builder()`] method."),
        method_doc("Implement builder pattern for [`ConnectionPool`]."),
    )
)]
pub struct ConnectionPool<M>
where
    M: ConnectionManager,
{
    #[fieldx(vis(pub(crate)), builder(vis(pub), required, into), get(clone))]
    manager: Arc<M>,

    /// Hard upper bound of idle plus checked-out connections.
    #[fieldx(get(copy), default(10))]
    max_size: usize,

    /// The floor maintenance replenishes towards.
    #[fieldx(get(copy), default(3))]
    min_size: usize,

    /// How many connections [`init`](Self::init) opens up front.
    #[fieldx(get(copy), default(5))]
    initial_size: usize,

    #[fieldx(get(copy), default(Duration::from_secs(5)))]
    acquire_timeout: Duration,

    #[fieldx(get(copy), default(Duration::from_secs(1)))]
    validation_timeout: Duration,

    /// Idle connections older than this are closed by maintenance unless that would take the pool below
    /// `min_size`.
    #[fieldx(get(copy), default(Duration::from_secs(300)))]
    idle_timeout: Duration,

    #[fieldx(get(copy), default(Duration::from_secs(60)))]
    maintenance_interval: Duration,

    /// Attempts to open a connection before an acquisition gives up. Attempt `n` is followed by a `retry_backoff * n`
    /// pause.
    #[fieldx(get(copy), default(3))]
    connect_attempts: u32,

    #[fieldx(get(copy), default(Duration::from_secs(1)))]
    retry_backoff: Duration,

    #[fieldx(lazy, private, get(clone), builder(off))]
    semaphore: Arc<Semaphore>,

    #[fieldx(builder(off), default(Mutex::new(PoolState::default())))]
    state: Mutex<PoolState<M::Connection>>,

    #[fieldx(builder(off), default(PoolCounters::default()))]
    counters: PoolCounters,

    #[fieldx(private, clearer, lock, get, set, builder(off))]
    maintenance_task: JoinHandle<()>,
}

impl<M> ConnectionPool<M>
where
    M: ConnectionManager,
{
    fn build_semaphore(&self) -> Arc<Semaphore> {
        Arc::new(Semaphore::new(self.max_size()))
    }

    #[inline]
    fn floor(&self) -> usize {
        self.min_size().min(self.max_size())
    }

    /// Open the initial connections and start the maintenance cycle.
    ///
    /// Failing to reach the storage here is logged, not fatal: acquisitions will keep trying to connect.
    pub async fn init(&self) {
        let opened = self.replenish(self.initial_size().min(self.max_size())).await;
        info!(opened, max_size = self.max_size(), min_size = self.min_size(), "connection pool initialized");
        self.start_maintenance();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            idle:      state.idle.len(),
            active:    state.active,
            total:     state.idle.len() + state.active,
            created:   self.counters.created.load(Ordering::Relaxed),
            discarded: self.counters.discarded.load(Ordering::Relaxed),
            waits:     self.counters.waits.load(Ordering::Relaxed),
            timeouts:  self.counters.timeouts.load(Ordering::Relaxed),
        }
    }

    /// Acquire a connection, waiting no longer than the configured `acquire_timeout`.
    pub async fn acquire(&self) -> Result<PoolConnection<M>> {
        self.acquire_within(self.acquire_timeout()).await
    }

    /// Acquire a connection, waiting at most `timeout` for a slot to free up.
    ///
    /// An idle connection is validated before it is handed out; one that fails validation is closed and a fresh
    /// connection is opened in the same slot.
    #[instrument(level = "trace", skip(self))]
    pub async fn acquire_within(&self, timeout: Duration) -> Result<PoolConnection<M>> {
        let deadline = Instant::now() + timeout;
        let semaphore = self.semaphore();

        let permit = match semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => return Err(StoreError::PoolClosed),
            Err(TryAcquireError::NoPermits) => {
                self.counters.waits.fetch_add(1, Ordering::Relaxed);
                match tokio::time::timeout_at(deadline, semaphore.acquire_owned()).await {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_)) => return Err(StoreError::PoolClosed),
                    Err(_) => {
                        self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                        warn!(?timeout, max_size = self.max_size(), "connection pool exhausted");
                        return Err(StoreError::PoolExhausted(timeout));
                    }
                }
            }
        };

        let (slot, idle) = self.reserve_slot(permit)?;

        let conn = match idle {
            Some(conn) => self.revalidate(conn, deadline, timeout).await?,
            None => self.open(deadline, timeout).await?,
        };

        Ok(PoolConnection::new(slot, conn))
    }

    // Count a slot as active and grab the longest-idle connection, if any. The returned guard gives the slot back if
    // the acquisition is abandoned halfway.
    fn reserve_slot(
        &self,
        permit: OwnedSemaphorePermit,
    ) -> Result<(SlotGuard<M>, Option<PooledConnection<M::Connection>>)> {
        let pool = self.myself().ok_or(StoreError::PoolClosed)?;
        let mut state = self.state.lock();
        if state.closed {
            return Err(StoreError::PoolClosed);
        }
        state.active += 1;
        let idle = state.idle.pop_front();
        drop(state);

        Ok((SlotGuard::new(pool, permit), idle))
    }

    // Reserve a slot for a connection that does not exist yet, provided the pool is still below `target`. Idle
    // connections are left alone.
    fn reserve_fresh_slot(&self, permit: OwnedSemaphorePermit, target: usize) -> Option<SlotGuard<M>> {
        let pool = self.myself()?;
        let mut state = self.state.lock();
        if state.closed || state.idle.len() + state.active >= target.min(self.max_size()) {
            return None;
        }
        state.active += 1;
        drop(state);

        Some(SlotGuard::new(pool, permit))
    }

    async fn revalidate(
        &self,
        mut conn: PooledConnection<M::Connection>,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<PooledConnection<M::Connection>> {
        if self.validate(&mut conn).await {
            return Ok(conn);
        }
        debug!(conn_id = conn.id, "idle connection failed validation, replacing it");
        self.close_connection(conn).await;
        self.open(deadline, timeout).await
    }

    async fn validate(&self, conn: &mut PooledConnection<M::Connection>) -> bool {
        if !conn.valid {
            return false;
        }
        let manager = self.manager();
        conn.valid = tokio::time::timeout(self.validation_timeout(), manager.is_valid(&mut conn.conn))
            .await
            .unwrap_or(false);
        conn.valid
    }

    async fn open(&self, deadline: Instant, timeout: Duration) -> Result<PooledConnection<M::Connection>> {
        let attempts = self.connect_attempts().max(1);
        let manager = self.manager();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let err = match tokio::time::timeout_at(deadline, manager.connect()).await {
                Ok(Ok(conn)) => {
                    let id = self.counters.next_id.fetch_add(1, Ordering::Relaxed);
                    self.counters.created.fetch_add(1, Ordering::Relaxed);
                    debug!(conn_id = id, attempt, "opened database connection");
                    return Ok(PooledConnection::new(id, conn));
                }
                Ok(Err(err)) => err,
                Err(_) => {
                    self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                    return Err(StoreError::PoolExhausted(timeout));
                }
            };

            let backoff = self.retry_backoff() * attempt;
            if attempt >= attempts || Instant::now() + backoff >= deadline {
                warn!(attempt, error = %err, "giving up on opening a database connection");
                return Err(err);
            }

            warn!(attempt, error = %err, ?backoff, "database connection attempt failed, retrying");
            tokio::time::sleep(backoff).await;
        }
    }

    async fn close_connection(&self, conn: PooledConnection<M::Connection>) {
        self.counters.discarded.fetch_add(1, Ordering::Relaxed);
        debug!(conn_id = conn.id, uses = conn.use_count, "closing database connection");
        self.manager().close(conn.conn).await;
    }

    // Return a checked-out connection. Both counters move under one lock so the connection is never counted twice.
    async fn check_in(&self, mut conn: PooledConnection<M::Connection>, validate: bool) -> bool {
        let keep = !self.is_closed() && (!validate || self.validate(&mut conn).await);

        let rejected = {
            let mut state = self.state.lock();
            state.active -= 1;
            if keep && !state.closed {
                conn.last_used_at = Instant::now();
                state.idle.push_back(conn);
                None
            }
            else {
                Some(conn)
            }
        };

        if let Some(conn) = rejected {
            self.close_connection(conn).await;
            false
        }
        else {
            true
        }
    }

    // Open connections until idle + active reaches `target`. Every new connection takes a checkout slot while it is
    // being opened, so refill stops when all permits are taken and never pushes the pool past `max_size`.
    async fn replenish(&self, target: usize) -> usize {
        let mut opened = 0;
        loop {
            let Ok(permit) = self.semaphore().try_acquire_owned()
            else {
                break;
            };
            let Some(slot) = self.reserve_fresh_slot(permit, target)
            else {
                break;
            };

            let timeout = self.acquire_timeout();
            match self.open(Instant::now() + timeout, timeout).await {
                Ok(conn) => {
                    if PoolConnection::new(slot, conn).check_in_unvalidated().await {
                        opened += 1;
                    }
                    else {
                        break;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "failed to replenish the connection pool");
                    break;
                }
            }
        }
        opened
    }

    /// One maintenance pass: close connections idle for longer than `idle_timeout` while keeping at least `min_size`
    /// idle ones, then top the pool up to `min_size`.
    #[instrument(level = "trace", skip(self))]
    pub async fn maintain(&self) {
        let now = Instant::now();
        let floor = self.floor();
        let idle_timeout = self.idle_timeout();

        let evicted = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            let mut kept = VecDeque::with_capacity(state.idle.len());
            let mut evicted = Vec::new();
            while let Some(conn) = state.idle.pop_front() {
                let remaining = state.idle.len() + kept.len();
                if conn.idle_for(now) > idle_timeout && remaining >= floor {
                    evicted.push(conn);
                }
                else {
                    kept.push_back(conn);
                }
            }
            state.idle = kept;
            evicted
        };

        let evicted_count = evicted.len();
        for conn in evicted {
            self.close_connection(conn).await;
        }

        let opened = self.replenish(floor).await;
        let stats = self.stats();
        info!(
            idle = stats.idle,
            active = stats.active,
            total = stats.total,
            evicted = evicted_count,
            opened,
            timeouts = stats.timeouts,
            "connection pool maintenance"
        );
    }

    fn start_maintenance(&self) {
        if self.maintenance_task().as_ref().map_or(true, |t| t.is_finished()) {
            let Some(myself) = self.myself()
            else {
                return;
            };
            let pool = Arc::downgrade(&myself);
            let period = self.maintenance_interval();

            self.set_maintenance_task(tokio::spawn(async move {
                let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let Some(pool) = pool.upgrade()
                    else {
                        break;
                    };
                    if pool.is_closed() {
                        break;
                    }
                    pool.maintain().await;
                }
                debug!("connection pool maintenance stopped");
            }));
        }
    }

    /// Stop maintenance, refuse further acquisitions, close every idle connection. Connections still checked out are
    /// closed when they come back.
    pub async fn close(&self) {
        if let Some(task) = self.clear_maintenance_task() {
            task.abort();
            let _ = task.await;
        }

        self.semaphore().close();

        let idle = {
            let mut state = self.state.lock();
            state.closed = true;
            std::mem::take(&mut state.idle)
        };

        let closed = idle.len();
        for conn in idle {
            self.close_connection(conn).await;
        }

        info!(closed, "connection pool closed");
    }
}

impl<M> Debug for ConnectionPool<M>
where
    M: ConnectionManager,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("ConnectionPool")
            .field("max_size", &self.max_size())
            .field("min_size", &self.min_size())
            .field("idle", &stats.idle)
            .field("active", &stats.active)
            .finish()
    }
}

// One reserved checkout slot: a semaphore permit plus its share of the active count. Unless settled, dropping it
// gives the active count back; the permit goes back with it.
struct SlotGuard<M>
where
    M: ConnectionManager,
{
    pool:    Arc<ConnectionPool<M>>,
    // Set once the active count has been decremented on this guard's behalf.
    settled: bool,
    conn_id: Option<u64>,
    _permit: OwnedSemaphorePermit,
}

impl<M> SlotGuard<M>
where
    M: ConnectionManager,
{
    fn new(pool: Arc<ConnectionPool<M>>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            pool,
            settled: false,
            conn_id: None,
            _permit: permit,
        }
    }
}

impl<M> Drop for SlotGuard<M>
where
    M: ConnectionManager,
{
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.pool.state.lock().active -= 1;
        if let Some(conn_id) = self.conn_id {
            self.pool.counters.discarded.fetch_add(1, Ordering::Relaxed);
            debug!(conn_id, "connection dropped by its borrower, discarding");
        }
    }
}

/// A checked-out connection.
///
/// Hand it back with [`release`](Self::release). Dropping it instead is how a borrower reports that something went
/// wrong while using it: the connection is discarded rather than returned, and its slot is freed.
pub struct PoolConnection<M>
where
    M: ConnectionManager,
{
    slot: SlotGuard<M>,
    conn: PooledConnection<M::Connection>,
}

impl<M> PoolConnection<M>
where
    M: ConnectionManager,
{
    fn new(mut slot: SlotGuard<M>, mut conn: PooledConnection<M::Connection>) -> Self {
        conn.mark_used();
        slot.conn_id = Some(conn.id);
        Self { slot, conn }
    }

    pub fn id(&self) -> u64 {
        self.conn.id()
    }

    pub fn use_count(&self) -> u64 {
        self.conn.use_count()
    }

    /// Flag the connection as unusable; [`release`](Self::release) will then close it instead of pooling it.
    pub fn mark_invalid(&mut self) {
        self.conn.valid = false;
    }

    /// Return the connection to the pool if it still validates, close it otherwise.
    pub async fn release(self) {
        let Self { mut slot, conn } = self;
        slot.settled = true;
        let pool = Arc::clone(&slot.pool);
        pool.check_in(conn, true).await;
    }

    /// Close the connection and free the slot without trying to pool it.
    pub async fn discard(self) {
        let Self { mut slot, conn } = self;
        slot.pool.state.lock().active -= 1;
        slot.settled = true;
        let pool = Arc::clone(&slot.pool);
        pool.close_connection(conn).await;
    }

    async fn check_in_unvalidated(self) -> bool {
        let Self { mut slot, conn } = self;
        slot.settled = true;
        let pool = Arc::clone(&slot.pool);
        pool.check_in(conn, false).await
    }
}

impl<M> Deref for PoolConnection<M>
where
    M: ConnectionManager,
{
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        &self.conn.conn
    }
}

impl<M> DerefMut for PoolConnection<M>
where
    M: ConnectionManager,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn.conn
    }
}

impl<M> Debug for PoolConnection<M>
where
    M: ConnectionManager,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolConnection")
            .field("id", &self.conn.id)
            .finish()
    }
}
