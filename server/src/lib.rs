//! Task server built on Steadfast.
//!
//! A small task API showing the reliability layer end to end:
//!
//! ```text
//! POST /api/tasks ─▶ IdempotencyGate ─▶ tasks table ─▶ EventProducer ─▶ task_events
//!                                                                        │
//!          task_notifications ◀─ NotificationHandler ◀─ EventWorker ◀────┘
//!                                                            │
//!                                                 processed_messages ledger
//! ```
//!
//! The binary in `main.rs` wires the Redis cache, the Redpanda broker and
//! the `PostgreSQL` ledger into these modules.

pub mod api;
pub mod config;
pub mod notifications;
pub mod tasks;

pub use api::{AppState, build_router};
pub use config::{Config, ConfigError};

/// Run the application's embedded migrations.
///
/// Tolerates migrations applied by the ledger to the same database.
///
/// # Errors
///
/// Returns the migration error if a migration fails.
pub async fn migrate(pool: &sqlx::PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    let mut migrator = sqlx::migrate!("./migrations");
    migrator.set_ignore_missing(true);
    migrator.run(pool).await
}
