//! # Gateway persistence
//!
//! All tables live in one SQLite database reached through a shared
//! [`SqlitePool`]. Plain reads and single-statement writes go through the
//! [`Database`] methods; multi-statement flows that need row-lock semantics
//! (proxy reservation, transcription jobs, IP calls) open a transaction with
//! [`Database::begin_locked`] and call the `*_tx` functions of each table
//! module with the transaction's connection. Worker queues are stored here
//! too, see [`queue`].

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::{debug, error, info};

use crate::config::DatabaseConfig;
use crate::error::Result;

pub mod blocked;
pub mod calls;
pub mod endpoints;
pub mod events;
pub mod ipcalls;
pub mod media;
pub mod proxy;
pub mod queue;
pub mod raw_messages;
pub mod schema;
pub mod transcription;

/// Handle to the gateway database
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Connect and create the schema.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        info!("🗄️ Initializing gateway database at {}", config.url);

        let options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await
            .map_err(|e| {
                error!("❌ Failed to open database {}: {}", config.url, e);
                e
            })?;

        let db = Self { pool };
        db.initialize_schema().await?;
        info!("✅ Gateway database ready");
        Ok(db)
    }

    /// Connect to a database file, using defaults for everything else.
    pub async fn connect_url(url: &str) -> Result<Self> {
        let config = DatabaseConfig {
            url: url.to_string(),
            ..Default::default()
        };
        Self::connect(&config).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn initialize_schema(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        schema::create_all(&mut conn).await?;
        Ok(())
    }

    /// Begin a transaction.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    /// Begin a transaction that immediately holds the write lock.
    ///
    /// `lock_sql` must be a no-op `UPDATE` over the rows being protected
    /// (for example `SET x = x WHERE org = ?`). Running it first takes the
    /// database write lock before any read, so concurrent transactions over
    /// the same rows queue behind each other on the busy timeout rather than
    /// failing with a stale snapshot.
    pub async fn begin_locked(
        &self,
        lock_sql: &str,
        key: &str,
    ) -> Result<Transaction<'static, Sqlite>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(lock_sql).bind(key).execute(&mut *tx).await?;
        Ok(tx)
    }

    /// Check that the database answers
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await.map_err(|e| {
            error!("❌ Database health check failed: {}", e);
            e
        })?;
        debug!("💚 Database health check passed");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Convert a stored id back to the unsigned form used by the API.
pub(crate) fn id_from_db(id: i64) -> u64 {
    id as u64
}

/// Ids are 63-bit so the cast never changes sign.
pub(crate) fn id_to_db(id: u64) -> i64 {
    id as i64
}
