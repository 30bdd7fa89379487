//! Port-exposure engine
//!
//! Per (instance, port, protocol), provisions the cluster-side network
//! objects plus a persisted binding, with compensating rollback on
//! partial failure:
//!
//! - TCP/UDP: cluster-internal service, an allocated external port, an
//!   entry in the ingress controller's protocol port map, and a port on
//!   its LoadBalancer service.
//! - HTTP: cluster-internal service plus an ingress.
//!
//! All L4 mutations (the port counter, the port map, the LoadBalancer
//! service) go through one engine-owned mutex; the cluster's optimistic
//! concurrency is not enough against concurrent batches in-process.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use berth_common::{Error, LB_ADDRESS_PLACEHOLDER};

use crate::cluster::ClusterApi;
use crate::domain::{AuditEntry, AuditKind, NetworkBinding, Protocol};
use crate::store::{AuditStore, InstanceStore, NetworkStore};

/// One element of a `SetInstancePort` batch, as received on the wire.
#[derive(Debug, Clone)]
pub struct PortRequest {
    /// Container port
    pub port: u32,
    /// Protocol name; empty defaults to HTTP
    pub protocol: String,
    /// Ingress host for HTTP exposure; empty falls back to the
    /// configured default domain
    pub ingress_domain: String,
}

/// Per-element outcome of a batch.
#[derive(Debug)]
pub struct PortOutcome {
    /// The requested container port
    pub port: u32,
    /// Access URL on success, the element's error otherwise
    pub result: Result<String, Error>,
}

/// Monotonic external-port allocator bounded by the configured range.
///
/// Ports are never returned to the pool on close; the counter only moves
/// forward. Process-local only - restarts begin again at the range start.
struct PortAllocator {
    next: u32,
    end: u32,
}

impl PortAllocator {
    fn new(start: u16, end: u16) -> Self {
        Self {
            next: u32::from(start),
            end: u32::from(end),
        }
    }

    fn allocate(&mut self) -> Option<u16> {
        if self.next > self.end {
            return None;
        }
        let port = self.next as u16;
        self.next += 1;
        Some(port)
    }
}

/// Transactional orchestrator for opening and closing instance ports.
pub struct PortEngine {
    instances: Arc<dyn InstanceStore>,
    networks: Arc<dyn NetworkStore>,
    audit: Arc<dyn AuditStore>,
    cluster: Arc<dyn ClusterApi>,
    /// Serializes the allocator and every shared ingress-controller
    /// mutation.
    l4: Mutex<PortAllocator>,
    default_ingress_domain: String,
}

impl PortEngine {
    /// Create an engine with the given external-port range and default
    /// ingress domain.
    pub fn new(
        instances: Arc<dyn InstanceStore>,
        networks: Arc<dyn NetworkStore>,
        audit: Arc<dyn AuditStore>,
        cluster: Arc<dyn ClusterApi>,
        port_range: (u16, u16),
        default_ingress_domain: String,
    ) -> Self {
        Self {
            instances,
            networks,
            audit,
            cluster,
            l4: Mutex::new(PortAllocator::new(port_range.0, port_range.1)),
            default_ingress_domain,
        }
    }

    /// Open or close a batch of ports on one instance.
    ///
    /// The instance is resolved once; a missing instance fails the whole
    /// batch before any element is touched. Elements are processed
    /// sequentially and report independent outcomes.
    pub async fn set_instance_port(
        &self,
        instance_id: i64,
        requests: Vec<PortRequest>,
        open: bool,
    ) -> Result<Vec<PortOutcome>, Error> {
        let resource = self
            .instances
            .get_resource(instance_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("instance {instance_id}")))?;

        let namespace = resource.user_id;
        if namespace.is_empty() {
            return Err(Error::failed_precondition(format!(
                "instance {instance_id} has no tenant namespace"
            )));
        }

        let mut outcomes = Vec::with_capacity(requests.len());
        for request in requests {
            let port = request.port;
            let result = if open {
                self.open_port(instance_id, &namespace, &request).await
            } else {
                self.close_port(instance_id, &namespace, &request)
                    .await
                    .map(|()| String::new())
            };
            outcomes.push(PortOutcome { port, result });
        }
        Ok(outcomes)
    }

    fn validate(&self, request: &PortRequest) -> Result<(u16, Protocol, String), Error> {
        if request.port == 0 || request.port > u32::from(u16::MAX) {
            return Err(Error::invalid_argument(format!(
                "port {} out of range [1, 65535]",
                request.port
            )));
        }
        let protocol = Protocol::parse(&request.protocol)?;
        let mut domain = request.ingress_domain.clone();
        if domain.is_empty() {
            domain = self.default_ingress_domain.clone();
        }
        if protocol == Protocol::Http && domain.is_empty() {
            return Err(Error::invalid_argument(
                "ingress_domain is required for HTTP exposure",
            ));
        }
        Ok((request.port as u16, protocol, domain))
    }

    async fn open_port(
        &self,
        instance_id: i64,
        namespace: &str,
        request: &PortRequest,
    ) -> Result<String, Error> {
        let (port, protocol, domain) = self.validate(request)?;

        // A disabled row survives from an earlier close that never
        // finished; refresh it in place instead of inserting a duplicate.
        let refresh = match self.networks.get_binding(instance_id, port).await? {
            Some(existing) if existing.enabled => {
                info!(instance_id, port, "port already opened, returning existing URL");
                return Ok(existing.access_url);
            }
            Some(_) => true,
            None => false,
        };

        let opened = if protocol.is_l4() {
            self.open_l4(instance_id, namespace, port, protocol, refresh)
                .await?
        } else {
            self.open_http(instance_id, namespace, port, &domain, refresh)
                .await?
        };

        if let Err(e) = self
            .audit
            .append(&AuditEntry {
                instance_id,
                kind: AuditKind::PortOpened,
                message: format!("Port {port} opened with protocol {}", protocol.as_str()),
                data_json: serde_json::json!({
                    "port": port,
                    "protocol": protocol.as_str(),
                    "access_url": opened,
                }),
                created_at: Utc::now(),
            })
            .await
        {
            warn!(instance_id, port, error = %e, "failed to write PORT_OPENED audit record");
        }

        info!(instance_id, port, access_url = %opened, "port opened");
        Ok(opened)
    }

    /// TCP/UDP exposure. Only the shared pieces - the counter, the port
    /// map, and the LoadBalancer service - sit behind the L4 lock; the
    /// per-instance service, the address read, and the binding write
    /// run outside it.
    async fn open_l4(
        &self,
        instance_id: i64,
        namespace: &str,
        port: u16,
        protocol: Protocol,
        refresh: bool,
    ) -> Result<String, Error> {
        let service_name = self
            .cluster
            .create_service(namespace, instance_id, port, protocol)
            .await?;

        let external_port = match self
            .provision_l4_entries(namespace, &service_name, port, protocol)
            .await
        {
            Ok(external_port) => external_port,
            Err(e) => {
                self.rollback_service(namespace, &service_name).await;
                return Err(e);
            }
        };

        let lb = match self.cluster.lb_address().await {
            Ok(addr) => addr,
            Err(e) => {
                warn!(error = %e, "failed to read LoadBalancer address, using placeholder");
                LB_ADDRESS_PLACEHOLDER.to_string()
            }
        };
        let access_url = format!("{lb}:{external_port}");

        let binding = NetworkBinding {
            instance_id,
            port,
            service_name: service_name.clone(),
            service_port: port,
            external_port: Some(external_port),
            ingress_name: None,
            protocol,
            access_url: access_url.clone(),
            enabled: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        if let Err(e) = self.persist_binding(&binding, refresh).await {
            {
                let _allocator = self.l4.lock().await;
                self.rollback_lb_port(protocol, external_port).await;
                self.rollback_l4_entry(protocol, external_port).await;
            }
            self.rollback_service(namespace, &service_name).await;
            return Err(e);
        }

        Ok(access_url)
    }

    /// Allocate an external port and publish it to the shared
    /// ingress-controller objects, all under the L4 lock. The counter is
    /// not rewound on failure; burned ports stay burned.
    async fn provision_l4_entries(
        &self,
        namespace: &str,
        service_name: &str,
        port: u16,
        protocol: Protocol,
    ) -> Result<u16, Error> {
        let mut allocator = self.l4.lock().await;

        let Some(external_port) = allocator.allocate() else {
            return Err(Error::resource_exhausted("external port range exhausted"));
        };

        self.cluster
            .add_l4_entry(protocol, external_port, namespace, service_name, port)
            .await?;

        if let Err(e) = self.cluster.add_lb_port(protocol, external_port).await {
            self.rollback_l4_entry(protocol, external_port).await;
            return Err(e);
        }

        Ok(external_port)
    }

    async fn open_http(
        &self,
        instance_id: i64,
        namespace: &str,
        port: u16,
        domain: &str,
        refresh: bool,
    ) -> Result<String, Error> {
        let service_name = self
            .cluster
            .create_service(namespace, instance_id, port, Protocol::Http)
            .await?;

        let (ingress_name, access_url) = match self
            .cluster
            .create_ingress(namespace, instance_id, port, &service_name, domain)
            .await
        {
            Ok(created) => created,
            Err(e) => {
                self.rollback_service(namespace, &service_name).await;
                return Err(e);
            }
        };

        let binding = NetworkBinding {
            instance_id,
            port,
            service_name: service_name.clone(),
            service_port: port,
            external_port: None,
            ingress_name: Some(ingress_name.clone()),
            protocol: Protocol::Http,
            access_url: access_url.clone(),
            enabled: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        if let Err(e) = self.persist_binding(&binding, refresh).await {
            self.rollback_ingress(namespace, &ingress_name).await;
            self.rollback_service(namespace, &service_name).await;
            return Err(e);
        }

        Ok(access_url)
    }

    async fn persist_binding(&self, binding: &NetworkBinding, refresh: bool) -> Result<(), Error> {
        if refresh {
            self.networks.update_binding(binding).await
        } else {
            self.networks.create_binding(binding).await
        }
    }

    async fn close_port(
        &self,
        instance_id: i64,
        namespace: &str,
        request: &PortRequest,
    ) -> Result<(), Error> {
        if request.port == 0 || request.port > u32::from(u16::MAX) {
            return Err(Error::invalid_argument(format!(
                "port {} out of range [1, 65535]",
                request.port
            )));
        }
        let port = request.port as u16;

        let Some(binding) = self.networks.get_binding(instance_id, port).await? else {
            info!(instance_id, port, "port not found, already closed");
            return Ok(());
        };

        if let Err(e) = self
            .cluster
            .delete_service(namespace, &binding.service_name)
            .await
        {
            warn!(service = %binding.service_name, error = %e, "failed to delete service, continuing");
        }

        if let Some(ingress_name) = &binding.ingress_name {
            if let Err(e) = self.cluster.delete_ingress(namespace, ingress_name).await {
                warn!(ingress = %ingress_name, error = %e, "failed to delete ingress, continuing");
            }
        }

        if let Some(external_port) = binding.external_port {
            let _allocator = self.l4.lock().await;
            if let Err(e) = self
                .cluster
                .remove_l4_entry(binding.protocol, external_port)
                .await
            {
                warn!(external_port, error = %e, "failed to remove port map entry, continuing");
            }
            if let Err(e) = self
                .cluster
                .remove_lb_port(binding.protocol, external_port)
                .await
            {
                warn!(external_port, error = %e, "failed to remove LoadBalancer port, continuing");
            }
        }

        self.networks.delete_binding(instance_id, port).await?;

        if let Err(e) = self
            .audit
            .append(&AuditEntry {
                instance_id,
                kind: AuditKind::PortClosed,
                message: format!("Port {port} closed"),
                data_json: serde_json::json!({ "port": port }),
                created_at: Utc::now(),
            })
            .await
        {
            warn!(instance_id, port, error = %e, "failed to write PORT_CLOSED audit record");
        }

        info!(instance_id, port, "port closed");
        Ok(())
    }

    // Compensation helpers. Errors are logged but never mask the original
    // failure; the cluster deletes already treat missing objects as
    // success.

    async fn rollback_service(&self, namespace: &str, name: &str) {
        if let Err(e) = self.cluster.delete_service(namespace, name).await {
            warn!(service = %name, error = %e, "rollback: failed to delete service");
        }
    }

    async fn rollback_ingress(&self, namespace: &str, name: &str) {
        if let Err(e) = self.cluster.delete_ingress(namespace, name).await {
            warn!(ingress = %name, error = %e, "rollback: failed to delete ingress");
        }
    }

    async fn rollback_l4_entry(&self, protocol: Protocol, external_port: u16) {
        if let Err(e) = self.cluster.remove_l4_entry(protocol, external_port).await {
            warn!(external_port, error = %e, "rollback: failed to remove port map entry");
        }
    }

    async fn rollback_lb_port(&self, protocol: Protocol, external_port: u16) {
        if let Err(e) = self.cluster.remove_lb_port(protocol, external_port).await {
            warn!(external_port, error = %e, "rollback: failed to remove LoadBalancer port");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mockall::predicate::eq;

    use crate::cluster::MockClusterApi;
    use crate::domain::Resource;
    use crate::store::{MockAuditStore, MockInstanceStore, MockNetworkStore};

    fn tenant_resource(instance_id: i64) -> Resource {
        Resource {
            instance_id,
            name: "x".to_string(),
            user_id: "tenantA".to_string(),
            status: "CREATING".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn instances_with(instance_id: i64) -> MockInstanceStore {
        let mut instances = MockInstanceStore::new();
        instances
            .expect_get_resource()
            .with(eq(instance_id))
            .returning(move |id| Ok(Some(tenant_resource(id))));
        instances
    }

    fn quiet_audit() -> MockAuditStore {
        let mut audit = MockAuditStore::new();
        audit.expect_append().returning(|_| Ok(()));
        audit
    }

    fn engine(
        instances: MockInstanceStore,
        networks: MockNetworkStore,
        audit: MockAuditStore,
        cluster: MockClusterApi,
        range: (u16, u16),
    ) -> PortEngine {
        PortEngine::new(
            Arc::new(instances),
            Arc::new(networks),
            Arc::new(audit),
            Arc::new(cluster),
            range,
            "demo.localtest.me".to_string(),
        )
    }

    fn http_request(port: u32) -> PortRequest {
        PortRequest {
            port,
            protocol: "HTTP".to_string(),
            ingress_domain: "apps.example.com".to_string(),
        }
    }

    fn tcp_request(port: u32) -> PortRequest {
        PortRequest {
            port,
            protocol: "TCP".to_string(),
            ingress_domain: String::new(),
        }
    }

    #[tokio::test]
    async fn http_open_creates_service_ingress_and_binding() {
        let mut networks = MockNetworkStore::new();
        networks
            .expect_get_binding()
            .with(eq(1), eq(8080u16))
            .returning(|_, _| Ok(None));
        networks
            .expect_create_binding()
            .withf(|b| {
                b.instance_id == 1
                    && b.port == 8080
                    && b.ingress_name.as_deref() == Some("ingress-1-8080")
                    && b.external_port.is_none()
                    && b.enabled
            })
            .times(1)
            .returning(|_| Ok(()));

        let mut cluster = MockClusterApi::new();
        cluster
            .expect_create_service()
            .withf(|ns, id, port, proto| {
                ns == "tenantA" && *id == 1 && *port == 8080 && *proto == Protocol::Http
            })
            .times(1)
            .returning(|_, id, port, _| Ok(format!("instance-{id}-{port}")));
        cluster
            .expect_create_ingress()
            .withf(|ns, id, port, svc, domain| {
                ns == "tenantA"
                    && *id == 1
                    && *port == 8080
                    && svc == "instance-1-8080"
                    && domain == "apps.example.com"
            })
            .times(1)
            .returning(|ns, id, port, _, domain| {
                Ok((
                    format!("ingress-{id}-{port}"),
                    format!("http://{domain}/{ns}/{id}/{port}"),
                ))
            });

        let engine = engine(
            instances_with(1),
            networks,
            quiet_audit(),
            cluster,
            (30000, 32767),
        );
        let outcomes = engine
            .set_instance_port(1, vec![http_request(8080)], true)
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(
            outcomes[0].result.as_deref().unwrap(),
            "http://apps.example.com/tenantA/1/8080"
        );
    }

    #[tokio::test]
    async fn open_is_idempotent_when_binding_enabled() {
        let mut networks = MockNetworkStore::new();
        networks.expect_get_binding().returning(|id, port| {
            Ok(Some(NetworkBinding {
                instance_id: id,
                port,
                service_name: format!("instance-{id}-{port}"),
                service_port: port,
                external_port: None,
                ingress_name: Some(format!("ingress-{id}-{port}")),
                protocol: Protocol::Http,
                access_url: "http://apps.example.com/tenantA/1/8080".to_string(),
                enabled: true,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            }))
        });

        // No cluster expectations: a call would panic.
        let engine = engine(
            instances_with(1),
            networks,
            MockAuditStore::new(),
            MockClusterApi::new(),
            (30000, 32767),
        );
        let outcomes = engine
            .set_instance_port(1, vec![http_request(8080)], true)
            .await
            .unwrap();
        assert_eq!(
            outcomes[0].result.as_deref().unwrap(),
            "http://apps.example.com/tenantA/1/8080"
        );
    }

    #[tokio::test]
    async fn reopening_a_disabled_binding_updates_in_place() {
        let mut networks = MockNetworkStore::new();
        networks.expect_get_binding().returning(|id, port| {
            Ok(Some(NetworkBinding {
                instance_id: id,
                port,
                service_name: format!("instance-{id}-{port}"),
                service_port: port,
                external_port: None,
                ingress_name: Some(format!("ingress-{id}-{port}")),
                protocol: Protocol::Http,
                access_url: "http://stale".to_string(),
                enabled: false,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            }))
        });
        networks
            .expect_update_binding()
            .withf(|b| b.enabled && b.access_url != "http://stale")
            .times(1)
            .returning(|_| Ok(()));

        let mut cluster = MockClusterApi::new();
        cluster
            .expect_create_service()
            .returning(|_, id, port, _| Ok(format!("instance-{id}-{port}")));
        cluster
            .expect_create_ingress()
            .returning(|ns, id, port, _, domain| {
                Ok((
                    format!("ingress-{id}-{port}"),
                    format!("http://{domain}/{ns}/{id}/{port}"),
                ))
            });

        let engine = engine(
            instances_with(1),
            networks,
            quiet_audit(),
            cluster,
            (30000, 32767),
        );
        let outcomes = engine
            .set_instance_port(1, vec![http_request(8080)], true)
            .await
            .unwrap();
        assert!(outcomes[0].result.is_ok());
    }

    #[tokio::test]
    async fn missing_instance_fails_the_whole_batch() {
        let mut instances = MockInstanceStore::new();
        instances.expect_get_resource().returning(|_| Ok(None));

        let engine = engine(
            instances,
            MockNetworkStore::new(),
            MockAuditStore::new(),
            MockClusterApi::new(),
            (30000, 32767),
        );
        let err = engine
            .set_instance_port(42, vec![http_request(8080)], true)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn ingress_failure_rolls_back_the_service() {
        let mut networks = MockNetworkStore::new();
        networks.expect_get_binding().returning(|_, _| Ok(None));

        let mut cluster = MockClusterApi::new();
        cluster
            .expect_create_service()
            .times(1)
            .returning(|_, id, port, _| Ok(format!("instance-{id}-{port}")));
        cluster
            .expect_create_ingress()
            .times(1)
            .returning(|_, _, _, _, _| Err(Error::internal("webhook denied")));
        cluster
            .expect_delete_service()
            .with(eq("tenantA"), eq("instance-1-8080"))
            .times(1)
            .returning(|_, _| Ok(()));

        let engine = engine(
            instances_with(1),
            networks,
            MockAuditStore::new(),
            cluster,
            (30000, 32767),
        );
        let outcomes = engine
            .set_instance_port(1, vec![http_request(8080)], true)
            .await
            .unwrap();
        assert!(outcomes[0].result.is_err());
    }

    #[tokio::test]
    async fn binding_failure_rolls_back_ingress_and_service() {
        let mut networks = MockNetworkStore::new();
        networks.expect_get_binding().returning(|_, _| Ok(None));
        networks
            .expect_create_binding()
            .times(1)
            .returning(|_| Err(Error::internal("db down")));

        let mut cluster = MockClusterApi::new();
        cluster
            .expect_create_service()
            .times(1)
            .returning(|_, id, port, _| Ok(format!("instance-{id}-{port}")));
        cluster
            .expect_create_ingress()
            .times(1)
            .returning(|ns, id, port, _, domain| {
                Ok((
                    format!("ingress-{id}-{port}"),
                    format!("http://{domain}/{ns}/{id}/{port}"),
                ))
            });
        cluster
            .expect_delete_ingress()
            .with(eq("tenantA"), eq("ingress-1-8080"))
            .times(1)
            .returning(|_, _| Ok(()));
        cluster
            .expect_delete_service()
            .with(eq("tenantA"), eq("instance-1-8080"))
            .times(1)
            .returning(|_, _| Ok(()));

        let engine = engine(
            instances_with(1),
            networks,
            MockAuditStore::new(),
            cluster,
            (30000, 32767),
        );
        let outcomes = engine
            .set_instance_port(1, vec![http_request(8080)], true)
            .await
            .unwrap();
        assert!(outcomes[0].result.is_err());
    }

    #[tokio::test]
    async fn tcp_open_allocates_external_port_and_builds_url() {
        let mut networks = MockNetworkStore::new();
        networks.expect_get_binding().returning(|_, _| Ok(None));
        networks
            .expect_create_binding()
            .withf(|b| b.external_port == Some(30000) && b.ingress_name.is_none())
            .times(1)
            .returning(|_| Ok(()));

        let mut cluster = MockClusterApi::new();
        cluster
            .expect_create_service()
            .withf(|_, _, _, proto| *proto == Protocol::Tcp)
            .times(1)
            .returning(|_, id, port, _| Ok(format!("instance-{id}-{port}")));
        cluster
            .expect_add_l4_entry()
            .withf(|proto, ext, ns, svc, port| {
                *proto == Protocol::Tcp
                    && *ext == 30000
                    && ns == "tenantA"
                    && svc == "instance-1-3306"
                    && *port == 3306
            })
            .times(1)
            .returning(|_, _, _, _, _| Ok(()));
        cluster
            .expect_add_lb_port()
            .with(eq(Protocol::Tcp), eq(30000u16))
            .times(1)
            .returning(|_, _| Ok(()));
        cluster
            .expect_lb_address()
            .times(1)
            .returning(|| Ok("203.0.113.7".to_string()));

        let engine = engine(
            instances_with(1),
            networks,
            quiet_audit(),
            cluster,
            (30000, 30000),
        );
        let outcomes = engine
            .set_instance_port(1, vec![tcp_request(3306)], true)
            .await
            .unwrap();
        assert_eq!(outcomes[0].result.as_deref().unwrap(), "203.0.113.7:30000");
    }

    #[tokio::test]
    async fn exhausted_range_compensates_and_reports_resource_exhausted() {
        // Range of exactly one port, two opens for distinct instances.
        let mut instances = MockInstanceStore::new();
        instances
            .expect_get_resource()
            .returning(|id| Ok(Some(tenant_resource(id))));

        let mut networks = MockNetworkStore::new();
        networks.expect_get_binding().returning(|_, _| Ok(None));
        networks
            .expect_create_binding()
            .times(1)
            .returning(|_| Ok(()));

        let mut cluster = MockClusterApi::new();
        cluster
            .expect_create_service()
            .times(2)
            .returning(|_, id, port, _| Ok(format!("instance-{id}-{port}")));
        cluster
            .expect_add_l4_entry()
            .times(1)
            .returning(|_, _, _, _, _| Ok(()));
        cluster
            .expect_add_lb_port()
            .times(1)
            .returning(|_, _| Ok(()));
        cluster
            .expect_lb_address()
            .times(1)
            .returning(|| Ok("203.0.113.7".to_string()));
        // Second open: the freshly created service is compensated away.
        cluster
            .expect_delete_service()
            .with(eq("tenantA"), eq("instance-2-3306"))
            .times(1)
            .returning(|_, _| Ok(()));

        let engine = engine(instances, networks, quiet_audit(), cluster, (30000, 30000));

        let first = engine
            .set_instance_port(1, vec![tcp_request(3306)], true)
            .await
            .unwrap();
        assert_eq!(first[0].result.as_deref().unwrap(), "203.0.113.7:30000");

        let second = engine
            .set_instance_port(2, vec![tcp_request(3306)], true)
            .await
            .unwrap();
        let err = second[0].result.as_ref().unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted { .. }));
    }

    #[tokio::test]
    async fn lb_address_failure_falls_back_to_placeholder() {
        let mut networks = MockNetworkStore::new();
        networks.expect_get_binding().returning(|_, _| Ok(None));
        networks
            .expect_create_binding()
            .times(1)
            .returning(|_| Ok(()));

        let mut cluster = MockClusterApi::new();
        cluster
            .expect_create_service()
            .returning(|_, id, port, _| Ok(format!("instance-{id}-{port}")));
        cluster
            .expect_add_l4_entry()
            .returning(|_, _, _, _, _| Ok(()));
        cluster.expect_add_lb_port().returning(|_, _| Ok(()));
        cluster
            .expect_lb_address()
            .returning(|| Err(Error::not_found("LoadBalancer address")));

        let engine = engine(
            instances_with(1),
            networks,
            quiet_audit(),
            cluster,
            (30000, 32767),
        );
        let outcomes = engine
            .set_instance_port(1, vec![tcp_request(3306)], true)
            .await
            .unwrap();
        assert_eq!(
            outcomes[0].result.as_deref().unwrap(),
            "<ingress-lb-ip>:30000"
        );
    }

    #[tokio::test]
    async fn lb_port_failure_unwinds_in_reverse_order() {
        let mut networks = MockNetworkStore::new();
        networks.expect_get_binding().returning(|_, _| Ok(None));

        let mut cluster = MockClusterApi::new();
        cluster
            .expect_create_service()
            .returning(|_, id, port, _| Ok(format!("instance-{id}-{port}")));
        cluster
            .expect_add_l4_entry()
            .returning(|_, _, _, _, _| Ok(()));
        cluster
            .expect_add_lb_port()
            .times(1)
            .returning(|_, _| Err(Error::internal("conflict")));
        cluster
            .expect_remove_l4_entry()
            .with(eq(Protocol::Tcp), eq(30000u16))
            .times(1)
            .returning(|_, _| Ok(()));
        cluster
            .expect_delete_service()
            .with(eq("tenantA"), eq("instance-1-3306"))
            .times(1)
            .returning(|_, _| Ok(()));

        let engine = engine(
            instances_with(1),
            networks,
            MockAuditStore::new(),
            cluster,
            (30000, 32767),
        );
        let outcomes = engine
            .set_instance_port(1, vec![tcp_request(3306)], true)
            .await
            .unwrap();
        assert!(outcomes[0].result.is_err());
    }

    #[tokio::test]
    async fn close_removes_http_objects_and_binding() {
        let mut networks = MockNetworkStore::new();
        networks.expect_get_binding().returning(|id, port| {
            Ok(Some(NetworkBinding {
                instance_id: id,
                port,
                service_name: format!("instance-{id}-{port}"),
                service_port: port,
                external_port: None,
                ingress_name: Some(format!("ingress-{id}-{port}")),
                protocol: Protocol::Http,
                access_url: "http://apps.example.com/tenantA/1/8080".to_string(),
                enabled: true,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            }))
        });
        networks
            .expect_delete_binding()
            .with(eq(1), eq(8080u16))
            .times(1)
            .returning(|_, _| Ok(()));

        let mut cluster = MockClusterApi::new();
        cluster
            .expect_delete_service()
            .with(eq("tenantA"), eq("instance-1-8080"))
            .times(1)
            .returning(|_, _| Ok(()));
        cluster
            .expect_delete_ingress()
            .with(eq("tenantA"), eq("ingress-1-8080"))
            .times(1)
            .returning(|_, _| Ok(()));

        let engine = engine(
            instances_with(1),
            networks,
            quiet_audit(),
            cluster,
            (30000, 32767),
        );
        let outcomes = engine
            .set_instance_port(1, vec![http_request(8080)], false)
            .await
            .unwrap();
        assert!(outcomes[0].result.is_ok());
    }

    #[tokio::test]
    async fn close_removes_l4_entries() {
        let mut networks = MockNetworkStore::new();
        networks.expect_get_binding().returning(|id, port| {
            Ok(Some(NetworkBinding {
                instance_id: id,
                port,
                service_name: format!("instance-{id}-{port}"),
                service_port: port,
                external_port: Some(30000),
                ingress_name: None,
                protocol: Protocol::Tcp,
                access_url: "203.0.113.7:30000".to_string(),
                enabled: true,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            }))
        });
        networks
            .expect_delete_binding()
            .times(1)
            .returning(|_, _| Ok(()));

        let mut cluster = MockClusterApi::new();
        cluster
            .expect_delete_service()
            .times(1)
            .returning(|_, _| Ok(()));
        cluster
            .expect_remove_l4_entry()
            .with(eq(Protocol::Tcp), eq(30000u16))
            .times(1)
            .returning(|_, _| Ok(()));
        cluster
            .expect_remove_lb_port()
            .with(eq(Protocol::Tcp), eq(30000u16))
            .times(1)
            .returning(|_, _| Ok(()));

        let engine = engine(
            instances_with(1),
            networks,
            quiet_audit(),
            cluster,
            (30000, 32767),
        );
        let outcomes = engine
            .set_instance_port(1, vec![tcp_request(3306)], false)
            .await
            .unwrap();
        assert!(outcomes[0].result.is_ok());
    }

    #[tokio::test]
    async fn close_of_unknown_port_is_idempotent() {
        let mut networks = MockNetworkStore::new();
        networks.expect_get_binding().returning(|_, _| Ok(None));

        let engine = engine(
            instances_with(1),
            networks,
            MockAuditStore::new(),
            MockClusterApi::new(),
            (30000, 32767),
        );
        let outcomes = engine
            .set_instance_port(1, vec![http_request(8080)], false)
            .await
            .unwrap();
        assert!(outcomes[0].result.is_ok());
    }

    #[tokio::test]
    async fn invalid_elements_fail_without_touching_the_cluster() {
        let engine = engine(
            instances_with(1),
            MockNetworkStore::new(),
            MockAuditStore::new(),
            MockClusterApi::new(),
            (30000, 32767),
        );

        let outcomes = engine
            .set_instance_port(
                1,
                vec![
                    PortRequest {
                        port: 0,
                        protocol: "TCP".to_string(),
                        ingress_domain: String::new(),
                    },
                    PortRequest {
                        port: 70000,
                        protocol: "TCP".to_string(),
                        ingress_domain: String::new(),
                    },
                    PortRequest {
                        port: 8080,
                        protocol: "SCTP".to_string(),
                        ingress_domain: String::new(),
                    },
                ],
                true,
            )
            .await
            .unwrap();

        assert!(outcomes.iter().all(|o| o.result.is_err()));
    }

    #[tokio::test]
    async fn http_with_no_domain_uses_the_configured_default() {
        let mut networks = MockNetworkStore::new();
        networks.expect_get_binding().returning(|_, _| Ok(None));
        networks
            .expect_create_binding()
            .times(1)
            .returning(|_| Ok(()));

        let mut cluster = MockClusterApi::new();
        cluster
            .expect_create_service()
            .returning(|_, id, port, _| Ok(format!("instance-{id}-{port}")));
        cluster
            .expect_create_ingress()
            .withf(|_, _, _, _, domain| domain == "demo.localtest.me")
            .times(1)
            .returning(|ns, id, port, _, domain| {
                Ok((
                    format!("ingress-{id}-{port}"),
                    format!("http://{domain}/{ns}/{id}/{port}"),
                ))
            });

        let engine = engine(
            instances_with(1),
            networks,
            quiet_audit(),
            cluster,
            (30000, 32767),
        );
        let outcomes = engine
            .set_instance_port(
                1,
                vec![PortRequest {
                    port: 8080,
                    protocol: String::new(),
                    ingress_domain: String::new(),
                }],
                true,
            )
            .await
            .unwrap();
        assert_eq!(
            outcomes[0].result.as_deref().unwrap(),
            "http://demo.localtest.me/tenantA/1/8080"
        );
    }
}
