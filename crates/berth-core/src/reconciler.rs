//! Instance lifecycle reconciler
//!
//! Consumes broker events and projects them onto the store and the
//! cluster. Only `INSTANCE_CREATED` carries semantics today; the other
//! event types are reserved hooks.
//!
//! The create flow is idempotent end to end: a duplicate event hits the
//! store's uniqueness check and is absorbed as success, which makes a
//! broker redelivery after a cluster-side failure safe.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use berth_common::Error;
use berth_proto::{framing, Event, EventType};

use crate::cluster::ClusterApi;
use crate::domain::{AuditEntry, AuditKind, InstanceSpec};
use crate::store::{AuditStore, InstanceStore};

/// Lifecycle event handler.
pub struct Reconciler {
    instances: Arc<dyn InstanceStore>,
    cluster: Arc<dyn ClusterApi>,
    audit: Arc<dyn AuditStore>,
}

impl Reconciler {
    /// Create a reconciler over the given seams.
    pub fn new(
        instances: Arc<dyn InstanceStore>,
        cluster: Arc<dyn ClusterApi>,
        audit: Arc<dyn AuditStore>,
    ) -> Self {
        Self {
            instances,
            cluster,
            audit,
        }
    }

    /// Decode one broker delivery and dispatch it.
    ///
    /// Malformed frames are an [`Error::InvalidArgument`]; the consumer
    /// drops those instead of requeueing.
    pub async fn handle_message(&self, body: &[u8]) -> Result<(), Error> {
        let event = framing::decode_event(body)
            .map_err(|e| Error::invalid_argument(format!("malformed event frame: {e}")))?;
        self.handle_event(event).await
    }

    /// Dispatch a decoded lifecycle event.
    pub async fn handle_event(&self, event: Event) -> Result<(), Error> {
        if event.instance_id == 0 {
            return Err(Error::invalid_argument(
                "invalid event: instance_id is required",
            ));
        }

        let event_type = EventType::try_from(event.event_type)
            .map_err(|_| Error::invalid_argument(format!("unknown event type {}", event.event_type)))?;

        match event_type {
            EventType::InstanceCreated => self.handle_instance_created(event).await,
            EventType::Unspecified => Err(Error::invalid_argument("event type is required")),
            // Reserved hooks; semantics intentionally undefined for now.
            other => {
                debug!(
                    event_type = other.as_str_name(),
                    instance_id = event.instance_id,
                    "no handler for event type"
                );
                Ok(())
            }
        }
    }

    async fn handle_instance_created(&self, event: Event) -> Result<(), Error> {
        let Some(event_spec) = event.spec else {
            return Err(Error::invalid_argument(
                "spec is required for INSTANCE_CREATED event",
            ));
        };

        let spec = InstanceSpec {
            instance_id: event.instance_id,
            user_id: event.user_id,
            name: event.name,
            cpu: event_spec.cpus,
            memory: event_spec.memory_mb,
            gpu: event_spec.gpu,
            image: event_spec.image,
            config_json: None,
        };

        info!(
            instance_id = spec.instance_id,
            user_id = %spec.user_id,
            image = %spec.image,
            "creating instance"
        );

        match self.instances.create_instance(&spec).await {
            Ok(()) => {}
            Err(e) if e.is_already_exists() => {
                info!(
                    instance_id = spec.instance_id,
                    "instance already exists, absorbing duplicate event"
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        self.cluster.ensure_namespace(&spec.user_id).await?;
        self.cluster.create_workload(&spec).await?;

        self.audit
            .append(&AuditEntry {
                instance_id: spec.instance_id,
                kind: AuditKind::Create,
                message: "Instance created".to_string(),
                data_json: serde_json::json!({
                    "cpu": spec.cpu,
                    "memory": spec.memory,
                    "gpu": spec.gpu,
                }),
                created_at: Utc::now(),
            })
            .await?;

        Ok(())
    }
}
