//! Kubernetes cluster adapter
//!
//! Implements the `berth-core` cluster seam: tenant namespaces, instance
//! workloads, service/ingress exposure, the shared ingress-nginx
//! configuration, and the exec channel.
//!
//! Idempotency contract: repeated create of the same name surfaces as
//! `AlreadyExists`; repeated delete of a missing object succeeds.

#![deny(missing_docs)]

pub mod client;
mod exec;
mod network;
mod workload;

use async_trait::async_trait;
use kube::Client;
use tokio::sync::mpsc;

use berth_common::Error;
use berth_core::cluster::ClusterApi;
use berth_core::domain::{ExecInput, ExecOptions, ExecOutput, InstanceSpec, Protocol};

pub use client::create_client;

/// Where the shared ingress-nginx controller lives.
#[derive(Debug, Clone)]
pub struct IngressSettings {
    /// Namespace holding the controller and its port-map ConfigMaps
    pub namespace: String,
    /// Name of the controller's LoadBalancer service
    pub lb_service: String,
}

impl Default for IngressSettings {
    fn default() -> Self {
        Self {
            namespace: berth_common::DEFAULT_INGRESS_NGINX_NAMESPACE.to_string(),
            lb_service: berth_common::DEFAULT_INGRESS_NGINX_LB_SERVICE.to_string(),
        }
    }
}

/// Cluster adapter over a kube client.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    settings: IngressSettings,
}

impl KubeCluster {
    /// Create an adapter with the given ingress-controller settings.
    pub fn new(client: Client, settings: IngressSettings) -> Self {
        Self { client, settings }
    }
}

/// Map a create failure, classifying 409 as a duplicate name.
pub(crate) fn map_create_error(err: kube::Error, what: String) -> Error {
    match err {
        kube::Error::Api(ae) if ae.code == 409 => Error::already_exists(what),
        e => e.into(),
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn ensure_namespace(&self, namespace: &str) -> Result<(), Error> {
        self.ensure_namespace(namespace).await
    }

    async fn create_workload(&self, spec: &InstanceSpec) -> Result<(), Error> {
        self.create_workload(spec).await
    }

    async fn create_service(
        &self,
        namespace: &str,
        instance_id: i64,
        port: u16,
        protocol: Protocol,
    ) -> Result<String, Error> {
        self.create_service(namespace, instance_id, port, protocol)
            .await
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.delete_service(namespace, name).await
    }

    async fn create_ingress(
        &self,
        namespace: &str,
        instance_id: i64,
        port: u16,
        service_name: &str,
        ingress_domain: &str,
    ) -> Result<(String, String), Error> {
        self.create_ingress(namespace, instance_id, port, service_name, ingress_domain)
            .await
    }

    async fn delete_ingress(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.delete_ingress(namespace, name).await
    }

    async fn add_l4_entry(
        &self,
        protocol: Protocol,
        external_port: u16,
        namespace: &str,
        service_name: &str,
        port: u16,
    ) -> Result<(), Error> {
        self.add_l4_entry(protocol, external_port, namespace, service_name, port)
            .await
    }

    async fn remove_l4_entry(&self, protocol: Protocol, external_port: u16) -> Result<(), Error> {
        self.remove_l4_entry(protocol, external_port).await
    }

    async fn add_lb_port(&self, protocol: Protocol, external_port: u16) -> Result<(), Error> {
        self.add_lb_port(protocol, external_port).await
    }

    async fn remove_lb_port(&self, protocol: Protocol, external_port: u16) -> Result<(), Error> {
        self.remove_lb_port(protocol, external_port).await
    }

    async fn lb_address(&self) -> Result<String, Error> {
        self.lb_address().await
    }

    async fn stream_exec(
        &self,
        opts: ExecOptions,
        input: mpsc::Receiver<ExecInput>,
        output: mpsc::Sender<ExecOutput>,
    ) -> Result<(), Error> {
        exec::stream_exec(self.client.clone(), opts, input, output).await
    }
}
