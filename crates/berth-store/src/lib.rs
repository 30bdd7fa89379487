//! PostgreSQL persistence for the Berth control plane
//!
//! Hand-written queries against the four-table schema; the store
//! contract lives in `berth-core`'s seam traits. Uniqueness violations
//! (SQLSTATE 23505) surface as `AlreadyExists` so the reconciler can
//! absorb duplicate events.

#![deny(missing_docs)]

pub mod audit;
pub mod instances;
pub mod migrations;
pub mod networks;

use sqlx::PgPool;

/// PostgreSQL-backed store implementing the `berth-core` seams.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a store over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Whether an sqlx error is a Postgres unique-key violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505")
    )
}
