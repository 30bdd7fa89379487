//! Exec session setup
//!
//! Resolves an Init frame to a concrete exec target (tenant namespace,
//! container name) and hands the frame channels to the cluster seam.
//! Both directions are bounded; a slow reader blocks the writer and the
//! transport's flow control carries the pressure the rest of the way.

use std::sync::Arc;

use tokio::sync::mpsc;

use berth_common::Error;

use crate::cluster::ClusterApi;
use crate::domain::{ExecInput, ExecOptions, ExecOutput};
use crate::store::InstanceStore;

/// Capacity of the frame queues in both directions.
pub const FRAME_QUEUE_CAPACITY: usize = 10;

/// Bridges a client stream to a cluster-side exec channel.
pub struct ExecBridge {
    instances: Arc<dyn InstanceStore>,
    cluster: Arc<dyn ClusterApi>,
}

impl ExecBridge {
    /// Create a bridge over the given seams.
    pub fn new(instances: Arc<dyn InstanceStore>, cluster: Arc<dyn ClusterApi>) -> Self {
        Self { instances, cluster }
    }

    /// Validate an Init frame and resolve the exec target.
    ///
    /// Fails with `InvalidArgument` on a malformed Init, `NotFound` when
    /// the instance does not exist, and `FailedPrecondition` when the
    /// instance has no tenant namespace. No cluster call is made here.
    pub async fn resolve(
        &self,
        instance_id: i64,
        command: &[String],
        tty: bool,
        container_name: &str,
    ) -> Result<ExecOptions, Error> {
        if instance_id == 0 {
            return Err(Error::invalid_argument("instance_id is required"));
        }
        if command.is_empty() {
            return Err(Error::invalid_argument("command is required"));
        }

        let resource = self
            .instances
            .get_resource(instance_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("instance {instance_id}")))?;

        if resource.user_id.is_empty() {
            return Err(Error::failed_precondition(format!(
                "instance {instance_id} has no tenant namespace"
            )));
        }

        // The workload's container is named after the instance.
        let container_name = if container_name.is_empty() {
            instance_id.to_string()
        } else {
            container_name.to_string()
        };

        Ok(ExecOptions {
            namespace: resource.user_id,
            instance_id,
            container_name,
            command: command.to_vec(),
            tty,
        })
    }

    /// Run the session: discover the pod and relay frames until the
    /// cluster-side call completes.
    ///
    /// Errors are only returned before the exec channel opens; once
    /// streaming starts, the cluster seam reports failures through the
    /// output channel and the session's single Exit frame.
    pub async fn run(
        &self,
        opts: ExecOptions,
        input: mpsc::Receiver<ExecInput>,
        output: mpsc::Sender<ExecOutput>,
    ) -> Result<(), Error> {
        self.cluster.stream_exec(opts, input, output).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::cluster::MockClusterApi;
    use crate::domain::Resource;
    use crate::store::MockInstanceStore;

    fn command() -> Vec<String> {
        vec!["/bin/sh".to_string()]
    }

    fn bridge(instances: MockInstanceStore, cluster: MockClusterApi) -> ExecBridge {
        ExecBridge::new(Arc::new(instances), Arc::new(cluster))
    }

    #[tokio::test]
    async fn resolve_derives_namespace_and_container_name() {
        let mut instances = MockInstanceStore::new();
        instances.expect_get_resource().returning(|id| {
            Ok(Some(Resource {
                instance_id: id,
                name: "x".to_string(),
                user_id: "tenantA".to_string(),
                status: "RUNNING".to_string(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            }))
        });

        let bridge = bridge(instances, MockClusterApi::new());
        let opts = bridge.resolve(1, &command(), false, "").await.unwrap();
        assert_eq!(opts.namespace, "tenantA");
        assert_eq!(opts.container_name, "1");
        assert!(!opts.tty);
    }

    #[tokio::test]
    async fn resolve_keeps_an_explicit_container_name() {
        let mut instances = MockInstanceStore::new();
        instances.expect_get_resource().returning(|id| {
            Ok(Some(Resource {
                instance_id: id,
                name: "x".to_string(),
                user_id: "tenantA".to_string(),
                status: "RUNNING".to_string(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            }))
        });

        let bridge = bridge(instances, MockClusterApi::new());
        let opts = bridge.resolve(1, &command(), true, "sidecar").await.unwrap();
        assert_eq!(opts.container_name, "sidecar");
        assert!(opts.tty);
    }

    #[tokio::test]
    async fn missing_instance_fails_before_any_cluster_call() {
        let mut instances = MockInstanceStore::new();
        instances.expect_get_resource().returning(|_| Ok(None));

        // No cluster expectations: a call would panic.
        let bridge = bridge(instances, MockClusterApi::new());
        let err = bridge.resolve(999, &command(), false, "").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn zero_instance_id_is_invalid() {
        let bridge = bridge(MockInstanceStore::new(), MockClusterApi::new());
        let err = bridge.resolve(0, &command(), false, "").await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn empty_command_is_invalid() {
        let bridge = bridge(MockInstanceStore::new(), MockClusterApi::new());
        let err = bridge.resolve(1, &[], false, "").await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn empty_tenant_is_a_failed_precondition() {
        let mut instances = MockInstanceStore::new();
        instances.expect_get_resource().returning(|id| {
            Ok(Some(Resource {
                instance_id: id,
                name: "x".to_string(),
                user_id: String::new(),
                status: "RUNNING".to_string(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            }))
        });

        let bridge = bridge(instances, MockClusterApi::new());
        let err = bridge.resolve(1, &command(), false, "").await.unwrap_err();
        assert!(matches!(err, Error::FailedPrecondition { .. }));
    }

    #[tokio::test]
    async fn run_relays_frames_through_the_cluster_seam() {
        let mut instances = MockInstanceStore::new();
        instances.expect_get_resource().returning(|id| {
            Ok(Some(Resource {
                instance_id: id,
                name: "x".to_string(),
                user_id: "tenantA".to_string(),
                status: "RUNNING".to_string(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            }))
        });

        let mut cluster = MockClusterApi::new();
        cluster
            .expect_stream_exec()
            .withf(|opts, _, _| opts.namespace == "tenantA" && opts.container_name == "1")
            .times(1)
            .returning(|_, _, output| {
                tokio::spawn(async move {
                    let _ = output
                        .send(ExecOutput::Data {
                            stream: crate::domain::ExecStream::Stdout,
                            data: b"hello\n".to_vec(),
                        })
                        .await;
                    let _ = output.send(ExecOutput::Exit(0)).await;
                });
                Ok(())
            });

        let bridge = bridge(instances, cluster);
        let opts = bridge.resolve(1, &command(), false, "").await.unwrap();

        let (_input_tx, input_rx) = mpsc::channel(FRAME_QUEUE_CAPACITY);
        let (output_tx, mut output_rx) = mpsc::channel(FRAME_QUEUE_CAPACITY);
        bridge.run(opts, input_rx, output_tx).await.unwrap();

        let first = output_rx.recv().await.unwrap();
        assert!(matches!(first, ExecOutput::Data { .. }));
        let second = output_rx.recv().await.unwrap();
        assert_eq!(second, ExecOutput::Exit(0));
    }
}
