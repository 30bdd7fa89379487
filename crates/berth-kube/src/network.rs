//! Network exposure objects
//!
//! Cluster-internal services, ingresses, and the shared ingress-nginx
//! configuration (protocol port maps plus the controller's LoadBalancer
//! service). The shared objects are mutated read-modify-write; the
//! engine serializes callers, the apiserver's resourceVersion check
//! catches everyone else.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ConfigMap, Service, ServicePort, ServiceSpec};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, DeleteParams, ObjectMeta, PostParams};
use tracing::{debug, info};

use berth_common::{Error, APP_INSTANCE, LABEL_APP, LABEL_INSTANCE_ID};
use berth_core::domain::Protocol;

use crate::{map_create_error, KubeCluster};

/// Rewrite annotation so the backend sees paths rooted at `/`.
const REWRITE_ANNOTATION: &str = "nginx.ingress.kubernetes.io/rewrite-target";

/// Name of the controller's port-map ConfigMap for a protocol.
fn port_map_name(protocol: Protocol) -> &'static str {
    match protocol {
        Protocol::Udp => "udp-services",
        _ => "tcp-services",
    }
}

/// `namespace/service:port` target format used by ingress-nginx port maps.
fn l4_target(namespace: &str, service_name: &str, port: u16) -> String {
    format!("{namespace}/{service_name}:{port}")
}

/// Name of an LB port entry: `{proto}-{external_port}`.
fn lb_port_name(protocol: Protocol, external_port: u16) -> String {
    format!("{}-{}", protocol.as_lower(), external_port)
}

/// Build the cluster-internal service for one instance port.
pub(crate) fn build_service(
    namespace: &str,
    instance_id: i64,
    port: u16,
    protocol: Protocol,
) -> Service {
    let name = format!("instance-{instance_id}-{port}");
    // Kubernetes only knows L4 protocols; HTTP services carry TCP.
    let wire_protocol = match protocol {
        Protocol::Udp => "UDP",
        _ => "TCP",
    };

    Service {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                LABEL_INSTANCE_ID.to_string(),
                instance_id.to_string(),
            )])),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(BTreeMap::from([
                (LABEL_INSTANCE_ID.to_string(), instance_id.to_string()),
                (LABEL_APP.to_string(), APP_INSTANCE.to_string()),
            ])),
            ports: Some(vec![ServicePort {
                name: Some(format!("{}-{}", protocol.as_lower(), port)),
                port: i32::from(port),
                target_port: Some(IntOrString::Int(i32::from(port))),
                protocol: Some(wire_protocol.to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    }
}

/// Build the ingress for HTTP exposure. Returns the object and the
/// user-facing access URL.
pub(crate) fn build_ingress(
    namespace: &str,
    instance_id: i64,
    port: u16,
    service_name: &str,
    ingress_domain: &str,
) -> (Ingress, String) {
    let name = format!("ingress-{instance_id}-{port}");
    let path = format!("/{namespace}/{instance_id}/{port}");
    let access_url = format!("http://{ingress_domain}{path}");

    let ingress = Ingress {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace.to_string()),
            annotations: Some(BTreeMap::from([(
                REWRITE_ANNOTATION.to_string(),
                "/".to_string(),
            )])),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            rules: Some(vec![IngressRule {
                host: Some(ingress_domain.to_string()),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some(path),
                        path_type: "Prefix".to_string(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: service_name.to_string(),
                                port: Some(ServiceBackendPort {
                                    number: Some(i32::from(port)),
                                    name: None,
                                }),
                            }),
                            resource: None,
                        },
                    }],
                }),
            }]),
            ..Default::default()
        }),
        status: None,
    };

    (ingress, access_url)
}

impl KubeCluster {
    pub(crate) async fn create_service(
        &self,
        namespace: &str,
        instance_id: i64,
        port: u16,
        protocol: Protocol,
    ) -> Result<String, Error> {
        let service = build_service(namespace, instance_id, port, protocol);
        let name = service
            .metadata
            .name
            .clone()
            .unwrap_or_else(|| format!("instance-{instance_id}-{port}"));

        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), &service)
            .await
            .map_err(|e| map_create_error(e, format!("service {name}")))?;

        info!(namespace, service = %name, "service created");
        Ok(name)
    }

    pub(crate) async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub(crate) async fn create_ingress(
        &self,
        namespace: &str,
        instance_id: i64,
        port: u16,
        service_name: &str,
        ingress_domain: &str,
    ) -> Result<(String, String), Error> {
        let (ingress, access_url) =
            build_ingress(namespace, instance_id, port, service_name, ingress_domain);
        let name = ingress
            .metadata
            .name
            .clone()
            .unwrap_or_else(|| format!("ingress-{instance_id}-{port}"));

        let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), &ingress)
            .await
            .map_err(|e| map_create_error(e, format!("ingress {name}")))?;

        info!(namespace, ingress = %name, host = %ingress_domain, "ingress created");
        Ok((name, access_url))
    }

    pub(crate) async fn delete_ingress(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub(crate) async fn add_l4_entry(
        &self,
        protocol: Protocol,
        external_port: u16,
        namespace: &str,
        service_name: &str,
        port: u16,
    ) -> Result<(), Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.settings.namespace);
        let map_name = port_map_name(protocol);
        let key = external_port.to_string();
        let target = l4_target(namespace, service_name, port);

        match api.get(map_name).await {
            Ok(mut cm) => {
                cm.data
                    .get_or_insert_with(BTreeMap::new)
                    .insert(key, target);
                api.replace(map_name, &PostParams::default(), &cm).await?;
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                let cm = ConfigMap {
                    metadata: ObjectMeta {
                        name: Some(map_name.to_string()),
                        namespace: Some(self.settings.namespace.clone()),
                        ..Default::default()
                    },
                    data: Some(BTreeMap::from([(key, target)])),
                    ..Default::default()
                };
                api.create(&PostParams::default(), &cm).await?;
            }
            Err(e) => return Err(e.into()),
        }

        debug!(external_port, map = map_name, "port map entry added");
        Ok(())
    }

    pub(crate) async fn remove_l4_entry(
        &self,
        protocol: Protocol,
        external_port: u16,
    ) -> Result<(), Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.settings.namespace);
        let map_name = port_map_name(protocol);
        let key = external_port.to_string();

        let mut cm = match api.get(map_name).await {
            Ok(cm) => cm,
            Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let removed = cm
            .data
            .as_mut()
            .map(|data| data.remove(&key).is_some())
            .unwrap_or(false);
        if !removed {
            return Ok(());
        }

        api.replace(map_name, &PostParams::default(), &cm).await?;
        debug!(external_port, map = map_name, "port map entry removed");
        Ok(())
    }

    pub(crate) async fn add_lb_port(
        &self,
        protocol: Protocol,
        external_port: u16,
    ) -> Result<(), Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), &self.settings.namespace);
        let mut svc = api.get(&self.settings.lb_service).await?;

        let port_name = lb_port_name(protocol, external_port);
        let ports = svc
            .spec
            .get_or_insert_with(Default::default)
            .ports
            .get_or_insert_with(Vec::new);
        if ports.iter().any(|p| p.name.as_deref() == Some(&port_name)) {
            return Ok(());
        }

        let wire_protocol = match protocol {
            Protocol::Udp => "UDP",
            _ => "TCP",
        };
        ports.push(ServicePort {
            name: Some(port_name),
            port: i32::from(external_port),
            target_port: Some(IntOrString::Int(i32::from(external_port))),
            protocol: Some(wire_protocol.to_string()),
            ..Default::default()
        });

        api.replace(&self.settings.lb_service, &PostParams::default(), &svc)
            .await?;
        debug!(external_port, "LoadBalancer port added");
        Ok(())
    }

    pub(crate) async fn remove_lb_port(
        &self,
        protocol: Protocol,
        external_port: u16,
    ) -> Result<(), Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), &self.settings.namespace);
        let mut svc = match api.get(&self.settings.lb_service).await {
            Ok(svc) => svc,
            Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let port_name = lb_port_name(protocol, external_port);
        let Some(ports) = svc.spec.as_mut().and_then(|s| s.ports.as_mut()) else {
            return Ok(());
        };
        let before = ports.len();
        ports.retain(|p| p.name.as_deref() != Some(&port_name));
        if ports.len() == before {
            return Ok(());
        }

        api.replace(&self.settings.lb_service, &PostParams::default(), &svc)
            .await?;
        debug!(external_port, "LoadBalancer port removed");
        Ok(())
    }

    pub(crate) async fn lb_address(&self) -> Result<String, Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), &self.settings.namespace);
        let svc = api.get(&self.settings.lb_service).await?;

        svc.status
            .and_then(|s| s.load_balancer)
            .and_then(|lb| lb.ingress)
            .and_then(|entries| entries.into_iter().next())
            .and_then(|entry| entry.ip.or(entry.hostname))
            .ok_or_else(|| Error::not_found("LoadBalancer address"))
    }
}
