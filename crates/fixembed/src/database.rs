use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::error::{StoreError, StoreResult};
use crate::retry::RetryPolicy;
use crate::service::{ENABLED_SERVICES_KEY, ServiceSet};

const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

/// Durable shadow of the state cache. Each write commits on its own.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn load_channel_states(&self) -> StoreResult<Vec<(u64, bool)>>;

    /// `None` when nothing has been stored yet.
    async fn load_enabled_services(&self) -> StoreResult<Option<ServiceSet>>;

    async fn save_channel_state(&self, channel_id: u64, enabled: bool) -> StoreResult<()>;

    async fn save_enabled_services(&self, services: &ServiceSet) -> StoreResult<()>;
}

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    retry: RetryPolicy,
}

/// Options for opening the SQLite file.
#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    pub path: String,
    pub pool_size: u32,
    /// How long SQLite itself waits on a lock before reporting busy.
    pub busy_timeout: Duration,
    pub retry: RetryPolicy,
}

/// Create both tables if they don't exist. The layout matches databases
/// written by earlier releases, so an existing `fixembed_data.db` loads as-is.
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS channel_states (channel_id INTEGER PRIMARY KEY, state BOOLEAN)",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE TABLE IF NOT EXISTS settings (key TEXT PRIMARY KEY, value TEXT)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Busy/locked conditions and pool starvation clear up on their own; every
/// other database error is permanent for the operation that hit it.
pub fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => db
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .is_some_and(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED)),
        _ => false,
    }
}

impl Database {
    pub async fn connect(options: &DatabaseOptions) -> Result<Self> {
        let connect_options = SqliteConnectOptions::new()
            .filename(&options.path)
            .create_if_missing(true)
            .busy_timeout(options.busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(options.pool_size)
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open SQLite database {}", options.path))?;

        tracing::info!(
            path = %options.path,
            pool_size = options.pool_size,
            "Database connection pool initialized"
        );

        create_schema(&pool).await?;

        Ok(Self::with_pool(pool, options.retry))
    }

    /// Wrap an existing pool. [`create_schema`] must already have run.
    pub fn with_pool(pool: SqlitePool, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }

    /// Health check: verify the database connection is alive
    pub async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn load_settings(&self) -> StoreResult<Vec<(String, String)>> {
        let rows = sqlx::query("SELECT key, value FROM settings")
            .fetch_all(&self.pool)
            .await?;

        let mut settings = Vec::with_capacity(rows.len());
        for row in rows {
            let key: String = row.try_get("key")?;
            let value: Option<String> = row.try_get("value")?;
            settings.push((key, value.unwrap_or_default()));
        }
        Ok(settings)
    }

    pub async fn upsert_setting(&self, key: &str, value: &str) -> StoreResult<()> {
        self.retry
            .run(is_transient, || {
                sqlx::query(
                    "INSERT INTO settings (key, value) VALUES (?, ?) \
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                )
                .bind(key)
                .bind(value)
                .execute(&self.pool)
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SettingsStore for Database {
    async fn load_channel_states(&self) -> StoreResult<Vec<(u64, bool)>> {
        let rows = sqlx::query("SELECT channel_id, state FROM channel_states")
            .fetch_all(&self.pool)
            .await?;

        let mut states = Vec::with_capacity(rows.len());
        for row in rows {
            let channel_id: i64 = row.try_get("channel_id")?;
            // NULL state never came from a toggle; treat it like a missing row.
            let state: Option<bool> = row.try_get("state")?;
            states.push((channel_id as u64, state.unwrap_or(true)));
        }
        Ok(states)
    }

    async fn load_enabled_services(&self) -> StoreResult<Option<ServiceSet>> {
        let mut found = None;
        for (key, value) in self.load_settings().await? {
            if key != ENABLED_SERVICES_KEY {
                tracing::debug!(key = %key, "Ignoring unrecognized settings row");
                continue;
            }
            let services = ServiceSet::decode(&value).map_err(|source| StoreError::InvalidSetting {
                key: key.clone(),
                source,
            })?;
            found = Some(services);
        }
        Ok(found)
    }

    async fn save_channel_state(&self, channel_id: u64, enabled: bool) -> StoreResult<()> {
        self.retry
            .run(is_transient, || {
                sqlx::query(
                    "INSERT INTO channel_states (channel_id, state) VALUES (?, ?) \
                     ON CONFLICT(channel_id) DO UPDATE SET state = excluded.state",
                )
                .bind(channel_id as i64)
                .bind(enabled)
                .execute(&self.pool)
            })
            .await?;
        Ok(())
    }

    async fn save_enabled_services(&self, services: &ServiceSet) -> StoreResult<()> {
        self.upsert_setting(ENABLED_SERVICES_KEY, &services.encode())
            .await
    }
}
