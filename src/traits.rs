use async_trait::async_trait;

use crate::error::Result;
use crate::error::StoreError;
use crate::profile::Profile;
use crate::types::FieldSet;
use crate::types::LedgerEntry;
use crate::types::LedgerKind;
use crate::types::ProfileKey;

/// Opens, probes and closes physical connections for a [`ConnectionPool`](crate::pool::ConnectionPool).
#[async_trait]
pub trait ConnectionManager: Send + Sync + 'static {
    type Connection: ProfileStorage;

    async fn connect(&self) -> Result<Self::Connection>;

    /// Cheap liveness probe. The pool bounds it with its validation timeout and treats a timeout as failure.
    async fn is_valid(&self, conn: &mut Self::Connection) -> bool;

    async fn close(&self, conn: Self::Connection) {
        drop(conn);
    }
}

/// Profile queries a single physical connection can run.
///
/// A connection is only ever used by one borrower at a time, hence `&mut self`.
#[async_trait]
pub trait ProfileStorage: Send + 'static {
    /// `Ok(None)` means the account has no stored row yet; this is not an error.
    async fn load_profile(&mut self, key: &ProfileKey) -> Result<Option<Profile>>;

    /// Insert-or-update covering only the given fields.
    async fn upsert_fields(&mut self, key: &ProfileKey, fields: &FieldSet) -> Result<()>;

    async fn ledger_amounts(&mut self, key: &ProfileKey, kind: LedgerKind) -> Result<Vec<f64>>;

    async fn append_ledger(&mut self, entry: &LedgerEntry) -> Result<()>;
}

/// Hooks into the write coalescer's flush cycle. All methods default to no-ops.
#[async_trait]
pub trait FlushObserver: Send + Sync + 'static {
    /// Called after a flush pass with the number of keys written and the number re-queued.
    async fn on_flush(&self, _written: usize, _requeued: usize) {}
    async fn on_write_error(&self, _key: &ProfileKey, _error: &StoreError) {}
}
