use std::time::Duration;

use thiserror::Error;

use crate::types::ProfileField;

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// Errors produced by the pool, the coalescer, and the storage backends.
///
/// The type is `Clone` because a single-flight recomputation hands the same outcome to every caller waiting on it.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// No connection became available within the acquisition timeout. Retriable.
    #[error("connection pool exhausted: no connection available within {0:?}")]
    PoolExhausted(Duration),

    #[error("connection pool is closed")]
    PoolClosed,

    #[error("failed to open a database connection: {0}")]
    Connect(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("cannot encode or decode field '{field}': {message}")]
    Codec { field: ProfileField, message: String },

    #[error("field '{field}' expects {expected} value")]
    FieldType { field: ProfileField, expected: &'static str },

    #[error("failed to build {0}")]
    Build(String),
}

impl StoreError {
    /// Exhaustion and storage-level failures may succeed if the operation is repeated later.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::PoolExhausted(_) | Self::Connect(_) | Self::Query(_))
    }

    pub fn query<S: ToString>(msg: S) -> Self {
        Self::Query(msg.to_string())
    }

    pub fn connect<S: ToString>(msg: S) -> Self {
        Self::Connect(msg.to_string())
    }
}

#[cfg(feature = "db")]
impl From<sea_orm::DbErr> for StoreError {
    fn from(err: sea_orm::DbErr) -> Self {
        match err {
            sea_orm::DbErr::Conn(e) => Self::Connect(e.to_string()),
            e => Self::Query(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_classification() {
        assert!(StoreError::PoolExhausted(Duration::from_secs(5)).is_retriable());
        assert!(StoreError::query("boom").is_retriable());
        assert!(!StoreError::PoolClosed.is_retriable());
        assert!(!StoreError::FieldType {
            field:    ProfileField::Balance,
            expected: "an integer",
        }
        .is_retriable());
    }
}
