//! Cluster seam
//!
//! Everything the engine needs from Kubernetes, expressed as idempotent
//! operations: repeated create of the same name is `AlreadyExists`,
//! repeated delete of a missing object succeeds. `berth-kube` provides
//! the implementation.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::sync::mpsc;

use berth_common::Error;

use crate::domain::{ExecInput, ExecOptions, ExecOutput, InstanceSpec, Protocol};

/// Cluster-side operations used by the reconciler, the port-exposure
/// engine, and the exec bridge.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Ensure the tenant namespace exists, creating it with the
    /// `user-namespace` / `managed-by` labels when missing.
    async fn ensure_namespace(&self, namespace: &str) -> Result<(), Error>;

    /// Create the instance workload (one-replica Deployment) in the
    /// tenant namespace.
    async fn create_workload(&self, spec: &InstanceSpec) -> Result<(), Error>;

    /// Create the cluster-internal service `instance-{id}-{port}`
    /// selecting the instance's pods. Returns the service name.
    async fn create_service(
        &self,
        namespace: &str,
        instance_id: i64,
        port: u16,
        protocol: Protocol,
    ) -> Result<String, Error>;

    /// Delete a service; missing objects succeed.
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Create the ingress `ingress-{id}-{port}` for HTTP exposure.
    /// Returns the ingress name and the access URL.
    async fn create_ingress(
        &self,
        namespace: &str,
        instance_id: i64,
        port: u16,
        service_name: &str,
        ingress_domain: &str,
    ) -> Result<(String, String), Error>;

    /// Delete an ingress; missing objects succeed.
    async fn delete_ingress(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Add `external_port -> namespace/service:port` to the ingress
    /// controller's protocol-specific port map.
    async fn add_l4_entry(
        &self,
        protocol: Protocol,
        external_port: u16,
        namespace: &str,
        service_name: &str,
        port: u16,
    ) -> Result<(), Error>;

    /// Remove an entry from the protocol-specific port map; missing
    /// entries succeed.
    async fn remove_l4_entry(&self, protocol: Protocol, external_port: u16) -> Result<(), Error>;

    /// Add the `{proto}-{external_port}` port to the controller's
    /// LoadBalancer service.
    async fn add_lb_port(&self, protocol: Protocol, external_port: u16) -> Result<(), Error>;

    /// Remove a port from the LoadBalancer service; missing ports
    /// succeed.
    async fn remove_lb_port(&self, protocol: Protocol, external_port: u16) -> Result<(), Error>;

    /// Read the LoadBalancer's external address (IP, or hostname when no
    /// IP is published).
    async fn lb_address(&self) -> Result<String, Error>;

    /// Open an exec channel to the instance's container and relay frames
    /// until the session ends.
    ///
    /// Errors before the channel opens (pod missing, exec refused) are
    /// returned; once streaming begins, failures are reported through
    /// `output` as an Error frame followed by the session's single Exit
    /// frame, and the call returns `Ok`.
    async fn stream_exec(
        &self,
        opts: ExecOptions,
        input: mpsc::Receiver<ExecInput>,
        output: mpsc::Sender<ExecOutput>,
    ) -> Result<(), Error>;
}
