use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use fieldx_plus::fx_plus;
use parking_lot::Mutex;
use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::error::Result;
use crate::error::StoreError;
use crate::pool::ConnectionPool;
use crate::pool::PoolConnection;
use crate::traits::ConnectionManager;
use crate::traits::FlushObserver;
use crate::traits::ProfileStorage;
use crate::types::FieldSet;
use crate::types::FieldValue;
use crate::types::ProfileField;
use crate::types::ProfileKey;

// Pending fields of a single key. Flushing one key only locks this record, never the whole pending map, so writers of
// other keys are not held up by a slow upsert.
#[derive(Debug, Default)]
struct PendingWriteSet {
    fields:     Mutex<FieldSet>,
    // Serializes flushes of the key: a flush that starts while another is in flight waits for it.
    flush_lock: tokio::sync::Mutex<()>,
    failures:   AtomicU32,
}

#[derive(Debug)]
enum FlushOutcome {
    Empty,
    Written,
    Requeued(StoreError),
    Dropped(StoreError),
    // No connection could be had; the fields stay pending.
    Unreachable(StoreError),
}

/// Summary of one flush pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Keys successfully upserted.
    pub written:  usize,
    /// Keys whose write failed and stay pending for the next pass.
    pub requeued: usize,
    /// Keys whose fields were rejected by the storage as malformed and discarded.
    pub dropped:  usize,
}

/// Buffers field writes per profile and turns them into periodic upserts.
///
/// Within a coalescing window only the last value of a field is written. A background flusher starts with the first
/// enqueued write and drains the buffer every `flush_interval`; it goes away again once nothing is pending. Reaching
/// `max_pending` buffered keys schedules an early flush.
///
/// A failed write is not lost: its fields stay pending and are retried by the next pass, unless a newer value for the
/// same field arrives first.
#[fx_plus(
    parent,
    no_new,
    default(off),
    sync,
    builder(
        doc("Builder object of [`WriteCoalescer`].", "", "See [`WriteCoalescer::builder()`] method."),
        method_doc("Implement builder pattern for [`WriteCoalescer`]."),
    )
)]
pub struct WriteCoalescer<M>
where
    M: ConnectionManager,
{
    #[fieldx(vis(pub(crate)), builder(vis(pub), required, into), get(clone))]
    pool: Arc<ConnectionPool<M>>,

    #[fieldx(get(copy), default(1_000))]
    max_pending: usize,

    /// The delay between two consecutive flushes. A manually requested flush resets the timer.
    #[fieldx(get(copy), set, default(Duration::from_secs(60)))]
    flush_interval: Duration,

    #[fieldx(builder(off), default(Mutex::new(HashMap::new())))]
    pending: Mutex<HashMap<ProfileKey, Arc<PendingWriteSet>>>,

    #[fieldx(builder(off), default(RwLock::new(None)))]
    observer: RwLock<Option<Arc<dyn FlushObserver>>>,

    // Changed only under the `pending` lock.
    #[fieldx(builder(off), default(AtomicBool::new(false)))]
    monitoring: AtomicBool,

    #[fieldx(builder(off), default(AtomicBool::new(false)))]
    early_flush: AtomicBool,

    #[fieldx(builder(off), default(AtomicBool::new(false)))]
    closed: AtomicBool,

    #[fieldx(private, clearer, lock, get, set, builder(off))]
    flusher_task: tokio::task::JoinHandle<()>,

    #[fieldx(lock, private, get(copy), set, builder(off), default(Instant::now()))]
    last_flush: Instant,
}

impl<M> WriteCoalescer<M>
where
    M: ConnectionManager,
{
    pub fn set_observer(&self, observer: Arc<dyn FlushObserver>) {
        *self.observer.write() = Some(observer);
    }

    fn observer(&self) -> Option<Arc<dyn FlushObserver>> {
        self.observer.read().clone()
    }

    /// Buffer a field write. A later write of the same field before the next flush replaces this one.
    pub fn enqueue(&self, key: ProfileKey, field: ProfileField, value: FieldValue) {
        let (pending_count, start_monitor) = {
            let mut pending = self.pending.lock();
            pending.entry(key).or_default().fields.lock().insert(field, value);
            (pending.len(), !self.monitoring.swap(true, Ordering::AcqRel))
        };

        if self.closed.load(Ordering::Acquire) {
            warn!(%field, "write enqueued after the coalescer was closed; it will only be written by an explicit flush");
            return;
        }

        if pending_count >= self.max_pending() && !self.early_flush.swap(true, Ordering::AcqRel) {
            debug!(pending_count, "pending writes threshold reached, flushing early");
            self.spawn_flush();
        }

        if start_monitor {
            self.start_flusher();
        }
    }

    /// Keys with buffered writes.
    pub fn pending_keys(&self) -> Vec<ProfileKey> {
        self.pending
            .lock()
            .iter()
            .filter(|(_, set)| !set.fields.lock().is_empty())
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Buffered fields of the key, empty if none.
    pub fn pending_for(&self, key: &ProfileKey) -> FieldSet {
        let set = self.pending.lock().get(key).cloned();
        set.map(|set| set.fields.lock().clone()).unwrap_or_default()
    }

    pub fn has_pending(&self) -> bool {
        self.pending.lock().values().any(|set| !set.fields.lock().is_empty())
    }

    /// Flush every pending key. With `synchronous` the call returns once each key has been written or re-queued;
    /// otherwise the flush runs in the background and an empty report is returned.
    pub async fn flush_all(&self, synchronous: bool) -> FlushReport {
        if synchronous {
            self.flush_pending().await
        }
        else {
            self.spawn_flush();
            FlushReport::default()
        }
    }

    /// Flush a single key. With `synchronous` the call returns once every field enqueued for the key before the call
    /// has reached the storage, or with the error that prevented it; the fields then stay pending.
    pub async fn flush_one(&self, key: &ProfileKey, synchronous: bool) -> Result<()> {
        if synchronous {
            return self.flush_single(key).await;
        }

        if let Some(myself) = self.myself() {
            let key = key.clone();
            tokio::spawn(async move {
                if let Err(err) = myself.flush_single(&key).await {
                    debug!(%key, error = %err, "background flush of a single key failed");
                }
            });
        }
        Ok(())
    }

    /// Stop the background flusher and write out everything still pending.
    pub async fn close(&self) -> FlushReport {
        self.closed.store(true, Ordering::Release);
        let report = self.flush_pending().await;
        if let Some(flusher) = self.clear_flusher_task() {
            flusher.abort();
            let _ = flusher.await;
        }
        if report.requeued > 0 {
            error!(requeued = report.requeued, "closing with profile writes that could not be stored");
        }
        report
    }

    async fn flush_single(&self, key: &ProfileKey) -> Result<()> {
        let set = self.pending.lock().get(key).cloned();
        let Some(set) = set
        else {
            return Ok(());
        };

        let mut conn = None;
        let outcome = self.flush_key(key, &set, &mut conn).await;
        if let Some(conn) = conn {
            conn.release().await;
        }

        match outcome {
            FlushOutcome::Requeued(err) | FlushOutcome::Dropped(err) | FlushOutcome::Unreachable(err) => Err(err),
            FlushOutcome::Empty | FlushOutcome::Written => Ok(()),
        }
    }

    #[instrument(level = "debug", skip(self))]
    async fn flush_pending(&self) -> FlushReport {
        let sets: Vec<(ProfileKey, Arc<PendingWriteSet>)> = self
            .pending
            .lock()
            .iter()
            .map(|(key, set)| (key.clone(), Arc::clone(set)))
            .collect();

        let mut report = FlushReport::default();
        // One connection serves the whole pass unless a write breaks it.
        let mut conn = None;

        let mut sets = sets.into_iter();
        while let Some((key, set)) = sets.next() {
            match self.flush_key(&key, &set, &mut conn).await {
                FlushOutcome::Empty => (),
                FlushOutcome::Written => report.written += 1,
                FlushOutcome::Requeued(_) => report.requeued += 1,
                FlushOutcome::Dropped(_) => report.dropped += 1,
                FlushOutcome::Unreachable(err) => {
                    // The storage cannot be reached; the rest of the pass waits for the next cycle.
                    report.requeued += 1;
                    let mut skipped = 0;
                    for (key, set) in sets.by_ref() {
                        if set.fields.lock().is_empty() {
                            continue;
                        }
                        set.failures.fetch_add(1, Ordering::Relaxed);
                        self.notify_error(&key, &err).await;
                        skipped += 1;
                    }
                    report.requeued += skipped;
                    warn!(skipped, error = %err, "storage unreachable, flush pass cut short");
                }
            }
        }

        if let Some(conn) = conn {
            conn.release().await;
        }

        self.set_last_flush(Instant::now());

        if report.written + report.requeued + report.dropped > 0 {
            info!(
                written = report.written,
                requeued = report.requeued,
                dropped = report.dropped,
                "flushed pending profile writes"
            );
            if let Some(observer) = self.observer() {
                observer.on_flush(report.written, report.requeued).await;
            }
        }

        report
    }

    // The flushed fields are only removed from the set after the write succeeds, and only those whose value has not
    // been replaced meanwhile. A flush that is cancelled halfway therefore leaves the set as it was.
    async fn flush_key(
        &self,
        key: &ProfileKey,
        set: &Arc<PendingWriteSet>,
        conn: &mut Option<PoolConnection<M>>,
    ) -> FlushOutcome {
        let _flushing = set.flush_lock.lock().await;

        let snapshot = set.fields.lock().clone();
        if snapshot.is_empty() {
            self.forget_if_empty(key, set);
            return FlushOutcome::Empty;
        }

        if conn.is_none() {
            match self.pool().acquire().await {
                Ok(acquired) => *conn = Some(acquired),
                Err(err) => {
                    return match self.write_failed(key, set, err).await {
                        FlushOutcome::Requeued(err) => FlushOutcome::Unreachable(err),
                        outcome => outcome,
                    }
                }
            }
        }

        let result = match conn.as_mut() {
            Some(c) => c.upsert_fields(key, &snapshot).await,
            None => Err(StoreError::PoolClosed),
        };

        match result {
            Ok(()) => {
                set.failures.store(0, Ordering::Relaxed);
                self.settle(key, set, &snapshot);
                debug!(%key, fields = snapshot.len(), "profile written");
                FlushOutcome::Written
            }
            Err(err) => {
                if let Some(broken) = conn.take() {
                    broken.discard().await;
                }
                if err.is_retriable() {
                    self.write_failed(key, set, err).await
                }
                else {
                    self.settle(key, set, &snapshot);
                    error!(%key, error = %err, fields = ?snapshot, "profile write rejected, discarding its fields");
                    self.notify_error(key, &err).await;
                    FlushOutcome::Dropped(err)
                }
            }
        }
    }

    async fn write_failed(&self, key: &ProfileKey, set: &PendingWriteSet, err: StoreError) -> FlushOutcome {
        let attempts = set.failures.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(%key, attempts, error = %err, "profile write failed, keeping it for the next flush");
        self.notify_error(key, &err).await;
        FlushOutcome::Requeued(err)
    }

    async fn notify_error(&self, key: &ProfileKey, err: &StoreError) {
        if let Some(observer) = self.observer() {
            observer.on_write_error(key, err).await;
        }
    }

    fn settle(&self, key: &ProfileKey, set: &Arc<PendingWriteSet>, written: &FieldSet) {
        set.fields.lock().retain(|field, value| written.get(field) != Some(value));
        self.forget_if_empty(key, set);
    }

    fn forget_if_empty(&self, key: &ProfileKey, set: &Arc<PendingWriteSet>) {
        let mut pending = self.pending.lock();
        if set.fields.lock().is_empty() && pending.get(key).is_some_and(|s| Arc::ptr_eq(s, set)) {
            pending.remove(key);
        }
    }

    fn spawn_flush(&self) {
        if let Some(myself) = self.myself() {
            tokio::spawn(async move {
                myself.flush_pending().await;
                myself.early_flush.store(false, Ordering::Release);
            });
        }
    }

    fn start_flusher(&self) {
        if let Some(myself) = self.myself() {
            self.set_flusher_task(tokio::spawn(async move { myself.monitor_pending().await }));
        }
    }

    async fn monitor_pending(&self) {
        debug!("starting pending writes monitor");
        loop {
            {
                let pending = self.pending.lock();
                if pending.is_empty() || self.closed.load(Ordering::Acquire) {
                    self.monitoring.store(false, Ordering::Release);
                    debug!("stopping pending writes monitor, nothing left to write");
                    break;
                }
            }

            let remaining = self.flush_interval().saturating_sub(self.last_flush().elapsed());
            if remaining.is_zero() {
                self.flush_pending().await;
                debug!("pending writes flushed by timeout");
            }
            else {
                tokio::time::sleep(remaining).await;
            }
        }
    }
}

impl<M> Debug for WriteCoalescer<M>
where
    M: ConnectionManager,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteCoalescer")
            .field("pending", &self.pending.lock().len())
            .field("flush_interval", &self.flush_interval())
            .finish()
    }
}
