//! Network binding persistence

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use tracing::debug;

use berth_common::Error;
use berth_core::domain::{NetworkBinding, Protocol};
use berth_core::store::NetworkStore;

use crate::PgStore;

#[derive(Debug, FromRow)]
struct BindingRow {
    instance_id: i64,
    port: i32,
    service_name: String,
    service_port: i32,
    external_port: Option<i32>,
    ingress_name: Option<String>,
    protocol: String,
    access_url: String,
    enabled: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<BindingRow> for NetworkBinding {
    type Error = Error;

    fn try_from(row: BindingRow) -> Result<Self, Error> {
        let protocol = Protocol::parse(&row.protocol).map_err(|_| {
            Error::internal_with_context(
                "store",
                format!(
                    "binding ({}, {}) has invalid protocol {:?}",
                    row.instance_id, row.port, row.protocol
                ),
            )
        })?;
        Ok(NetworkBinding {
            instance_id: row.instance_id,
            port: row.port as u16,
            service_name: row.service_name,
            service_port: row.service_port as u16,
            external_port: row.external_port.map(|p| p as u16),
            ingress_name: row.ingress_name,
            protocol,
            access_url: row.access_url,
            enabled: row.enabled,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[async_trait]
impl NetworkStore for PgStore {
    async fn create_binding(&self, binding: &NetworkBinding) -> Result<(), Error> {
        sqlx::query(
            r#"
            INSERT INTO instance_network
                (instance_id, port, service_name, service_port, external_port,
                 ingress_name, protocol, access_url, enabled, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW(), NOW())
            "#,
        )
        .bind(binding.instance_id)
        .bind(i32::from(binding.port))
        .bind(&binding.service_name)
        .bind(i32::from(binding.service_port))
        .bind(binding.external_port.map(i32::from))
        .bind(&binding.ingress_name)
        .bind(binding.protocol.as_str())
        .bind(&binding.access_url)
        .bind(binding.enabled)
        .execute(self.pool())
        .await?;

        debug!(
            instance_id = binding.instance_id,
            port = binding.port,
            "network binding persisted"
        );
        Ok(())
    }

    async fn update_binding(&self, binding: &NetworkBinding) -> Result<(), Error> {
        let result = sqlx::query(
            r#"
            UPDATE instance_network
            SET service_name = $3, service_port = $4, external_port = $5,
                ingress_name = $6, protocol = $7, access_url = $8,
                enabled = $9, updated_at = NOW()
            WHERE instance_id = $1 AND port = $2
            "#,
        )
        .bind(binding.instance_id)
        .bind(i32::from(binding.port))
        .bind(&binding.service_name)
        .bind(i32::from(binding.service_port))
        .bind(binding.external_port.map(i32::from))
        .bind(&binding.ingress_name)
        .bind(binding.protocol.as_str())
        .bind(&binding.access_url)
        .bind(binding.enabled)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!(
                "binding ({}, {})",
                binding.instance_id, binding.port
            )));
        }
        Ok(())
    }

    async fn delete_binding(&self, instance_id: i64, port: u16) -> Result<(), Error> {
        let result = sqlx::query(
            "DELETE FROM instance_network WHERE instance_id = $1 AND port = $2",
        )
        .bind(instance_id)
        .bind(i32::from(port))
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!(
                "binding ({instance_id}, {port})"
            )));
        }
        Ok(())
    }

    async fn get_binding(
        &self,
        instance_id: i64,
        port: u16,
    ) -> Result<Option<NetworkBinding>, Error> {
        let row = sqlx::query_as::<_, BindingRow>(
            r#"
            SELECT instance_id, port, service_name, service_port, external_port,
                   ingress_name, protocol, access_url, enabled, created_at, updated_at
            FROM instance_network
            WHERE instance_id = $1 AND port = $2
            "#,
        )
        .bind(instance_id)
        .bind(i32::from(port))
        .fetch_optional(self.pool())
        .await?;

        row.map(NetworkBinding::try_from).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(protocol: &str) -> BindingRow {
        BindingRow {
            instance_id: 1,
            port: 8080,
            service_name: "instance-1-8080".to_string(),
            service_port: 8080,
            external_port: None,
            ingress_name: Some("ingress-1-8080".to_string()),
            protocol: protocol.to_string(),
            access_url: "http://apps.example.com/tenantA/1/8080".to_string(),
            enabled: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn binding_row_converts() {
        let binding = NetworkBinding::try_from(row("HTTP")).unwrap();
        assert_eq!(binding.protocol, Protocol::Http);
        assert_eq!(binding.port, 8080);
        assert_eq!(binding.ingress_name.as_deref(), Some("ingress-1-8080"));
    }

    #[test]
    fn binding_row_with_garbage_protocol_is_internal_error() {
        let err = NetworkBinding::try_from(row("SPDY")).unwrap_err();
        assert!(matches!(err, Error::Internal { .. }));
    }
}
