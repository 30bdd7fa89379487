//! Instance and spec persistence

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, QueryBuilder};
use tracing::debug;

use berth_common::Error;
use berth_core::domain::{InstanceSpec, ListFilter, Resource};
use berth_core::store::InstanceStore;

use crate::{is_unique_violation, PgStore};

#[derive(Debug, FromRow)]
struct InstanceRow {
    instance_id: i64,
    name: String,
    user_id: String,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<InstanceRow> for Resource {
    fn from(row: InstanceRow) -> Self {
        Resource {
            instance_id: row.instance_id,
            name: row.name,
            user_id: row.user_id,
            status: row.status,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct SpecRow {
    instance_id: i64,
    user_id: String,
    name: String,
    cpu: i32,
    memory: i32,
    gpu: Option<i32>,
    image: String,
    config_json: Option<serde_json::Value>,
}

impl From<SpecRow> for InstanceSpec {
    fn from(row: SpecRow) -> Self {
        InstanceSpec {
            instance_id: row.instance_id,
            user_id: row.user_id,
            name: row.name,
            cpu: row.cpu.max(0) as u32,
            memory: row.memory.max(0) as u32,
            gpu: row.gpu.unwrap_or(0).max(0) as u32,
            image: row.image,
            config_json: row.config_json,
        }
    }
}

#[async_trait]
impl InstanceStore for PgStore {
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<(), Error> {
        let mut tx = self.pool().begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO instance (instance_id, user_id, name, status, created_at, updated_at)
            VALUES ($1, $2, $3, 'CREATING', NOW(), NOW())
            "#,
        )
        .bind(spec.instance_id)
        .bind(&spec.user_id)
        .bind(&spec.name)
        .execute(&mut *tx)
        .await;

        if let Err(e) = inserted {
            if is_unique_violation(&e) {
                return Err(Error::already_exists(format!(
                    "instance {}",
                    spec.instance_id
                )));
            }
            return Err(e.into());
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO instance_spec (instance_id, cpu, memory, gpu, image, config_json)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(spec.instance_id)
        .bind(spec.cpu as i32)
        .bind(spec.memory as i32)
        .bind(if spec.gpu > 0 { Some(spec.gpu as i32) } else { None })
        .bind(&spec.image)
        .bind(&spec.config_json)
        .execute(&mut *tx)
        .await;

        if let Err(e) = inserted {
            if is_unique_violation(&e) {
                return Err(Error::already_exists(format!(
                    "instance {}",
                    spec.instance_id
                )));
            }
            return Err(e.into());
        }

        tx.commit().await?;
        debug!(instance_id = spec.instance_id, "instance persisted");
        Ok(())
    }

    async fn get_resource(&self, instance_id: i64) -> Result<Option<Resource>, Error> {
        let row = sqlx::query_as::<_, InstanceRow>(
            r#"
            SELECT instance_id, name, user_id, status, created_at, updated_at
            FROM instance
            WHERE instance_id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(instance_id)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.map(Resource::from))
    }

    async fn list_resources(&self, filter: &ListFilter) -> Result<Vec<Resource>, Error> {
        let mut qb = QueryBuilder::new(
            "SELECT instance_id, name, user_id, status, created_at, updated_at \
             FROM instance WHERE deleted_at IS NULL",
        );

        if let Some(user_id) = &filter.user_id {
            qb.push(" AND user_id = ").push_bind(user_id);
        }
        if let Some(status) = filter.status.as_deref().filter(|s| !s.is_empty()) {
            qb.push(" AND status = ").push_bind(status.to_string());
        }
        if let Some(start) = filter.start {
            qb.push(" AND created_at >= ").push_bind(start);
        }
        if let Some(end) = filter.end {
            qb.push(" AND created_at <= ").push_bind(end);
        }
        qb.push(" ORDER BY created_at DESC");

        let rows: Vec<InstanceRow> = qb.build_query_as().fetch_all(self.pool()).await?;
        Ok(rows.into_iter().map(Resource::from).collect())
    }

    async fn list_specs(
        &self,
        instance_ids: &[i64],
    ) -> Result<HashMap<i64, InstanceSpec>, Error> {
        if instance_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let rows = sqlx::query_as::<_, SpecRow>(
            r#"
            SELECT s.instance_id, i.user_id, i.name, s.cpu, s.memory, s.gpu, s.image, s.config_json
            FROM instance_spec s
            JOIN instance i ON i.instance_id = s.instance_id
            WHERE s.instance_id = ANY($1)
            "#,
        )
        .bind(instance_ids)
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| (row.instance_id, InstanceSpec::from(row)))
            .collect())
    }
}
