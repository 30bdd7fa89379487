//! Append-only audit log persistence

use async_trait::async_trait;

use berth_common::Error;
use berth_core::domain::AuditEntry;
use berth_core::store::AuditStore;

use crate::PgStore;

#[async_trait]
impl AuditStore for PgStore {
    async fn append(&self, entry: &AuditEntry) -> Result<(), Error> {
        sqlx::query(
            r#"
            INSERT INTO instance_logs (instance_id, log_type, message, data_json, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(entry.instance_id)
        .bind(entry.kind.as_str())
        .bind(&entry.message)
        .bind(&entry.data_json)
        .bind(entry.created_at)
        .execute(self.pool())
        .await?;

        Ok(())
    }
}
