//! `PostgreSQL` processed-message ledger for Steadfast.
//!
//! This crate implements the `Ledger` trait from `steadfast-core` on a single
//! `processed_messages` table:
//!
//! - `event_id` is `UNIQUE`, so concurrent workers recording the same event
//!   resolve to one row (`ON CONFLICT DO NOTHING`)
//! - `processed_at` is indexed for eviction by age
//! - Migrations are embedded with `sqlx::migrate!`
//!
//! # Example
//!
//! ```no_run
//! use steadfast_postgres::PostgresLedger;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let ledger = PostgresLedger::connect("postgres://localhost/steadfast", 10).await?;
//! ledger.migrate().await?;
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use steadfast_core::ledger::{Ledger, LedgerError, ProcessedMessage, RecordOutcome};
use uuid::Uuid;

/// `PostgreSQL`-backed ledger.
#[derive(Clone, Debug)]
pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect with a pool of at most `max_connections`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Connection`] if the database is unreachable.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, LedgerError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(|e| LedgerError::Connection(format!("Failed to connect to PostgreSQL: {e}")))?;

        tracing::info!(max_connections, "Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Run the embedded migrations.
    ///
    /// Migrations applied to the same database by other components are
    /// tolerated, so the ledger can share a database with the application.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Query`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), LedgerError> {
        let mut migrator = sqlx::migrate!("./migrations");
        migrator.set_ignore_missing(true);
        migrator
            .run(&self.pool)
            .await
            .map_err(|e| LedgerError::Query(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn map_error(error: &sqlx::Error) -> LedgerError {
    match error {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            LedgerError::Connection(error.to_string())
        }
        _ => LedgerError::Query(error.to_string()),
    }
}

impl Ledger for PostgresLedger {
    fn exists(
        &self,
        event_id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<bool, LedgerError>> + Send + '_>> {
        Box::pin(async move {
            let (exists,): (bool,) = sqlx::query_as(
                "SELECT EXISTS(SELECT 1 FROM processed_messages WHERE event_id = $1)",
            )
            .bind(event_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_error(&e))?;
            Ok(exists)
        })
    }

    fn record(
        &self,
        message: &ProcessedMessage,
    ) -> Pin<Box<dyn Future<Output = Result<RecordOutcome, LedgerError>> + Send + '_>> {
        let message = message.clone();
        Box::pin(async move {
            let result = sqlx::query(
                r"
                INSERT INTO processed_messages (event_id, event_type, processed_at)
                VALUES ($1, $2, $3)
                ON CONFLICT (event_id) DO NOTHING
                ",
            )
            .bind(message.event_id)
            .bind(&message.event_type)
            .bind(message.processed_at)
            .execute(&self.pool)
            .await
            .map_err(|e| map_error(&e))?;

            if result.rows_affected() == 0 {
                tracing::debug!(event_id = %message.event_id, "Event already recorded");
                Ok(RecordOutcome::AlreadyRecorded)
            } else {
                metrics::counter!("ledger_records_total", "event_type" => message.event_type.clone())
                    .increment(1);
                Ok(RecordOutcome::Inserted)
            }
        })
    }

    fn evict_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, LedgerError>> + Send + '_>> {
        Box::pin(async move {
            let result = sqlx::query("DELETE FROM processed_messages WHERE processed_at < $1")
                .bind(cutoff)
                .execute(&self.pool)
                .await
                .map_err(|e| map_error(&e))?;
            Ok(result.rows_affected())
        })
    }
}
