use std::time::Duration;

use async_trait::async_trait;
use sea_orm::sea_query::OnConflict;
use sea_orm::ActiveModelTrait;
use sea_orm::ActiveValue::Set;
use sea_orm::ColumnTrait;
use sea_orm::ConnectOptions;
use sea_orm::ConnectionTrait;
use sea_orm::DatabaseBackend;
use sea_orm::DatabaseConnection;
use sea_orm::EntityTrait;
use sea_orm::QueryFilter;
use sea_orm::QuerySelect;
use sea_orm_migration::MigratorTrait;
use tracing::debug;
use tracing::instrument;
use tracing::warn;

use crate::db::entity::ledger;
use crate::db::entity::profile;
use crate::db::migrations::Migrator;
use crate::error::Result;
use crate::error::StoreError;
use crate::profile::Profile;
use crate::traits::ConnectionManager;
use crate::traits::ProfileStorage;
use crate::types::FieldSet;
use crate::types::FieldValue;
use crate::types::LedgerEntry;
use crate::types::LedgerKind;
use crate::types::ProfileField;
use crate::types::ProfileKey;

/// Opens single-connection sea-orm handles to a SQL database.
///
/// ```ignore
/// let manager = SqlConnectionManager::new("postgres://game:secret@db/profiles");
/// manager.setup_schema().await?;
/// let pool = ConnectionPool::builder().manager(manager).build()?;
/// ```
#[derive(Debug, Clone)]
pub struct SqlConnectionManager {
    url:             String,
    connect_timeout: Duration,
}

impl SqlConnectionManager {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url:             url.into(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn open(&self) -> Result<DatabaseConnection> {
        let mut opts = ConnectOptions::new(self.url.clone());
        opts.max_connections(1)
            .min_connections(1)
            .connect_timeout(self.connect_timeout)
            .sqlx_logging(false);

        let db = sea_orm::Database::connect(opts)
            .await
            .inspect_err(|e| warn!(error = %e, "error connecting to the profile database"))?;

        if db.get_database_backend() == DatabaseBackend::Sqlite {
            db.execute_unprepared("PRAGMA journal_mode=WAL;").await?;
            db.execute_unprepared("PRAGMA synchronous=NORMAL;").await?;
            db.execute_unprepared("PRAGMA busy_timeout=5000;").await?;
        }

        Ok(db)
    }

    /// Create the tables if they do not exist yet.
    pub async fn setup_schema(&self) -> Result<()> {
        let db = self.open().await?;
        Migrator::up(&db, None).await?;
        if let Err(err) = db.close().await {
            debug!(error = %err, "closing the migration connection failed");
        }
        Ok(())
    }
}

#[async_trait]
impl ConnectionManager for SqlConnectionManager {
    type Connection = SqlConnection;

    async fn connect(&self) -> Result<SqlConnection> {
        Ok(SqlConnection { db: self.open().await? })
    }

    async fn is_valid(&self, conn: &mut SqlConnection) -> bool {
        conn.db.ping().await.is_ok()
    }

    async fn close(&self, conn: SqlConnection) {
        if let Err(err) = conn.db.close().await {
            debug!(error = %err, "closing a database connection failed");
        }
    }
}

/// One physical SQL connection.
#[derive(Debug)]
pub struct SqlConnection {
    db: DatabaseConnection,
}

impl SqlConnection {
    pub fn database(&self) -> &DatabaseConnection {
        &self.db
    }
}

fn encode(field: ProfileField, value: &FieldValue) -> Result<sea_orm::Value> {
    Ok(match value {
        FieldValue::Integer(v) => (*v).into(),
        FieldValue::Text(v) => v.clone().into(),
        FieldValue::List(v) => serde_json::to_string(v)
            .map_err(|e| StoreError::Codec {
                field,
                message: e.to_string(),
            })?
            .into(),
    })
}

#[async_trait]
impl ProfileStorage for SqlConnection {
    #[instrument(level = "trace", skip(self))]
    async fn load_profile(&mut self, key: &ProfileKey) -> Result<Option<Profile>> {
        profile::Entity::find_by_id(key.as_str())
            .one(&self.db)
            .await?
            .map(Profile::try_from)
            .transpose()
    }

    #[instrument(level = "trace", skip(self, fields))]
    async fn upsert_fields(&mut self, key: &ProfileKey, fields: &FieldSet) -> Result<()> {
        // Reject mistyped values before they reach the table.
        Profile::new_default(key.clone()).apply_all(fields)?;

        let mut row = profile::ActiveModel {
            profile_key: Set(key.to_string()),
            updated_at: Set(chrono::Utc::now().timestamp_millis()),
            ..Default::default()
        };
        let mut columns = Vec::with_capacity(fields.len() + 1);
        for (field, value) in fields {
            let column = profile::Column::of(*field);
            row.set(column, encode(*field, value)?);
            columns.push(column);
        }
        columns.push(profile::Column::UpdatedAt);

        profile::Entity::insert(row)
            .on_conflict(
                OnConflict::column(profile::Column::ProfileKey)
                    .update_columns(columns)
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;

        Ok(())
    }

    #[instrument(level = "trace", skip(self))]
    async fn ledger_amounts(&mut self, key: &ProfileKey, kind: LedgerKind) -> Result<Vec<f64>> {
        Ok(ledger::Entity::find()
            .select_only()
            .column(ledger::Column::Amount)
            .filter(ledger::Column::ProfileKey.eq(key.as_str()))
            .filter(ledger::Column::Kind.eq(kind.as_ref()))
            .into_tuple::<f64>()
            .all(&self.db)
            .await?)
    }

    #[instrument(level = "trace", skip(self))]
    async fn append_ledger(&mut self, entry: &LedgerEntry) -> Result<()> {
        let row = ledger::ActiveModel {
            profile_key: Set(entry.key.to_string()),
            kind: Set(entry.kind.to_string()),
            amount: Set(entry.amount),
            recorded_at: Set(entry.recorded_at),
            ..Default::default()
        };
        ledger::Entity::insert(row).exec_without_returning(&self.db).await?;
        Ok(())
    }
}
