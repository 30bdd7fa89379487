//! Tenant namespaces and instance workloads
//!
//! Each instance materializes as a one-replica Deployment in the tenant
//! namespace. The container runs a shell that traps TERM and waits, so
//! there is always a long-running process to exec into.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, Namespace, PodSpec, PodTemplateSpec, ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{Api, ObjectMeta, PostParams};
use tracing::{info, warn};

use berth_common::{Error, APP_INSTANCE, LABEL_APP, LABEL_INSTANCE_ID, LABEL_USER_ID};
use berth_core::domain::InstanceSpec;

use crate::{map_create_error, KubeCluster};

/// Accelerator catalog: GPU classifier to node-selector label. Every
/// entry requests one device.
fn gpu_label(gpu: u32) -> Option<&'static str> {
    match gpu {
        1 => Some("nvidia-tesla-v100"),
        2 => Some("nvidia-tesla-a100"),
        3 => Some("nvidia-tesla-h100"),
        4 => Some("nvidia-tesla-t4"),
        5 => Some("nvidia-geforce-rtx3090"),
        6 => Some("nvidia-geforce-rtx4060m"),
        _ => None,
    }
}

/// Shell kept in the foreground so the container never exits on its own.
const HOLD_COMMAND: &str = "trap : TERM INT; sleep infinity & wait";

/// Build the Deployment for an instance.
pub(crate) fn build_deployment(spec: &InstanceSpec) -> Deployment {
    let name = spec.instance_id.to_string();

    let mut cpu_milli = i64::from(spec.cpu) * 1000;
    if cpu_milli <= 0 {
        warn!(
            instance_id = spec.instance_id,
            "cpu not provided, falling back to 1 core"
        );
        cpu_milli = 1000;
    }
    let mut mem_bytes = i64::from(spec.memory) * 1024 * 1024;
    if mem_bytes <= 0 {
        warn!(
            instance_id = spec.instance_id,
            "memory not provided, falling back to 512Mi"
        );
        mem_bytes = 512 * 1024 * 1024;
    }

    let mut resources = BTreeMap::from([
        ("cpu".to_string(), Quantity(format!("{cpu_milli}m"))),
        ("memory".to_string(), Quantity(mem_bytes.to_string())),
    ]);

    let mut node_selector = None;
    if spec.gpu > 0 {
        if let Some(label) = gpu_label(spec.gpu) {
            resources.insert("nvidia.com/gpu".to_string(), Quantity("1".to_string()));
            node_selector = Some(BTreeMap::from([(
                "accelerator".to_string(),
                label.to_string(),
            )]));
        } else {
            warn!(
                instance_id = spec.instance_id,
                gpu = spec.gpu,
                "unknown GPU classifier, scheduling without accelerator"
            );
        }
    }

    let labels = BTreeMap::from([
        (LABEL_INSTANCE_ID.to_string(), name.clone()),
        (LABEL_APP.to_string(), APP_INSTANCE.to_string()),
        (LABEL_USER_ID.to_string(), spec.user_id.clone()),
    ]);

    Deployment {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(spec.user_id.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(BTreeMap::from([(
                    LABEL_INSTANCE_ID.to_string(),
                    name.clone(),
                )])),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name,
                        image: Some(spec.image.clone()),
                        command: Some(vec![
                            "/bin/sh".to_string(),
                            "-c".to_string(),
                            HOLD_COMMAND.to_string(),
                        ]),
                        resources: Some(ResourceRequirements {
                            requests: Some(resources.clone()),
                            limits: Some(resources),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }],
                    node_selector,
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

impl KubeCluster {
    /// Ensure the tenant namespace exists.
    ///
    /// A not-found on get followed by an already-exists on create is not
    /// an error: someone else won the race.
    pub(crate) async fn ensure_namespace(&self, namespace: &str) -> Result<(), Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());

        match api.get(namespace).await {
            Ok(_) => return Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(e.into()),
        }

        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(namespace.to_string()),
                labels: Some(BTreeMap::from([
                    ("user-namespace".to_string(), "true".to_string()),
                    ("managed-by".to_string(), "resource-service".to_string()),
                ])),
                ..Default::default()
            },
            ..Default::default()
        };

        match api.create(&PostParams::default(), &ns).await {
            Ok(_) => {
                info!(namespace, "tenant namespace created");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Create the instance's Deployment in the tenant namespace.
    pub(crate) async fn create_workload(&self, spec: &InstanceSpec) -> Result<(), Error> {
        let deployment = build_deployment(spec);
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &spec.user_id);

        info!(
            instance_id = spec.instance_id,
            namespace = %spec.user_id,
            image = %spec.image,
            "creating workload"
        );

        api.create(&PostParams::default(), &deployment)
            .await
            .map_err(|e| map_create_error(e, format!("workload {}", spec.instance_id)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(cpu: u32, memory: u32, gpu: u32) -> InstanceSpec {
        InstanceSpec {
            instance_id: 1,
            user_id: "tenantA".to_string(),
            name: "x".to_string(),
            cpu,
            memory,
            gpu,
            image: "alpine:3".to_string(),
            config_json: None,
        }
    }

    fn container_requests(deployment: &Deployment) -> &BTreeMap<String, Quantity> {
        deployment
            .spec
            .as_ref()
            .unwrap()
            .template
            .spec
            .as_ref()
            .unwrap()
            .containers[0]
            .resources
            .as_ref()
            .unwrap()
            .requests
            .as_ref()
            .unwrap()
    }

    #[test]
    fn deployment_pins_one_replica_named_by_instance() {
        let deployment = build_deployment(&spec(2, 1024, 0));
        assert_eq!(deployment.metadata.name.as_deref(), Some("1"));
        assert_eq!(deployment.metadata.namespace.as_deref(), Some("tenantA"));
        assert_eq!(deployment.spec.as_ref().unwrap().replicas, Some(1));

        let container = &deployment.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0];
        assert_eq!(container.name, "1");
        assert_eq!(container.image.as_deref(), Some("alpine:3"));
        assert_eq!(
            container.command.as_ref().unwrap()[2],
            "trap : TERM INT; sleep infinity & wait"
        );
    }

    #[test]
    fn resources_are_millicores_and_bytes() {
        let deployment = build_deployment(&spec(2, 1024, 0));
        let requests = container_requests(&deployment);
        assert_eq!(requests["cpu"].0, "2000m");
        assert_eq!(requests["memory"].0, "1073741824");
    }

    #[test]
    fn zero_resources_fall_back() {
        let deployment = build_deployment(&spec(0, 0, 0));
        let requests = container_requests(&deployment);
        assert_eq!(requests["cpu"].0, "1000m");
        assert_eq!(requests["memory"].0, (512u64 * 1024 * 1024).to_string());
    }

    #[test]
    fn pod_labels_carry_instance_app_and_tenant() {
        let deployment = build_deployment(&spec(2, 1024, 0));
        let labels = deployment
            .spec
            .as_ref()
            .unwrap()
            .template
            .metadata
            .as_ref()
            .unwrap()
            .labels
            .as_ref()
            .unwrap();
        assert_eq!(labels["instance-id"], "1");
        assert_eq!(labels["app"], "instance");
        assert_eq!(labels["user-id"], "tenantA");
    }

    #[test]
    fn gpu_request_adds_device_and_node_selector() {
        let deployment = build_deployment(&spec(2, 1024, 2));
        let requests = container_requests(&deployment);
        assert_eq!(requests["nvidia.com/gpu"].0, "1");

        let node_selector = deployment
            .spec
            .as_ref()
            .unwrap()
            .template
            .spec
            .as_ref()
            .unwrap()
            .node_selector
            .as_ref()
            .unwrap();
        assert_eq!(node_selector["accelerator"], "nvidia-tesla-a100");
    }

    #[test]
    fn unknown_gpu_classifier_schedules_without_accelerator() {
        let deployment = build_deployment(&spec(2, 1024, 99));
        let requests = container_requests(&deployment);
        assert!(!requests.contains_key("nvidia.com/gpu"));
        assert!(deployment
            .spec
            .as_ref()
            .unwrap()
            .template
            .spec
            .as_ref()
            .unwrap()
            .node_selector
            .is_none());
    }

    #[test]
    fn gpu_catalog_covers_the_six_models() {
        assert_eq!(gpu_label(1), Some("nvidia-tesla-v100"));
        assert_eq!(gpu_label(4), Some("nvidia-tesla-t4"));
        assert_eq!(gpu_label(6), Some("nvidia-geforce-rtx4060m"));
        assert_eq!(gpu_label(0), None);
        assert_eq!(gpu_label(7), None);
    }
}
