//! Persistence seams
//!
//! The store contract is defined by its operations, not by any record
//! type; `berth-store` provides the PostgreSQL implementation. The traits
//! are mocked in tests.

use std::collections::HashMap;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use berth_common::Error;

use crate::domain::{AuditEntry, InstanceSpec, ListFilter, NetworkBinding, Resource};

/// Instance identity + spec persistence.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Insert the instance row (status CREATING) and its spec in one
    /// transaction. A duplicate `instance_id` is an
    /// [`Error::AlreadyExists`].
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<(), Error>;

    /// Fetch a single non-deleted instance; `None` when missing.
    async fn get_resource(&self, instance_id: i64) -> Result<Option<Resource>, Error>;

    /// List non-deleted instances matching the filter, newest first.
    async fn list_resources(&self, filter: &ListFilter) -> Result<Vec<Resource>, Error>;

    /// Bulk-fetch specs keyed by instance id.
    async fn list_specs(&self, instance_ids: &[i64])
        -> Result<HashMap<i64, InstanceSpec>, Error>;
}

/// Per-port network binding persistence.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NetworkStore: Send + Sync {
    /// Insert a binding row.
    async fn create_binding(&self, binding: &NetworkBinding) -> Result<(), Error>;

    /// Update an existing binding; zero affected rows is
    /// [`Error::NotFound`].
    async fn update_binding(&self, binding: &NetworkBinding) -> Result<(), Error>;

    /// Delete one binding; zero affected rows is [`Error::NotFound`].
    async fn delete_binding(&self, instance_id: i64, port: u16) -> Result<(), Error>;

    /// Fetch one binding; `None` when missing.
    async fn get_binding(
        &self,
        instance_id: i64,
        port: u16,
    ) -> Result<Option<NetworkBinding>, Error>;
}

/// Append-only audit log.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Append one record. Never updates, never deletes.
    async fn append(&self, entry: &AuditEntry) -> Result<(), Error>;
}
