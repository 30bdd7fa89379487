//! Embedded database migrations
//!
//! Safe to run on every startup; already-applied migrations are skipped.

use sqlx::migrate::MigrateError;
use sqlx::PgPool;

/// Migrator with all schema migrations embedded.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Apply all pending migrations.
pub async fn run(pool: &PgPool) -> Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}
