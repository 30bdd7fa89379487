//! gRPC service implementation
//!
//! Thin translation layer between the protobuf surface and the engine:
//! filters and field masks for `ListResources`, batch fan-out for
//! `SetInstancePort`, and the frame pumps for `ExecContainer`.

use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};

use berth_core::domain::{ExecInput, ExecOutput, ListFilter};
use berth_core::exec::FRAME_QUEUE_CAPACITY;
use berth_core::store::InstanceStore;
use berth_core::{ExecBridge, PortEngine, PortRequest};
use berth_proto::resource_service_server::ResourceService;
use berth_proto::{
    exec_request, exec_response, ExecExit, ExecRequest, ExecResponse, ListResourcesReply,
    ListResourcesRequest, PortResult, Resource, ResourceSpec, SetInstancePortReply,
    SetInstancePortRequest,
};

/// The control plane's RPC surface.
pub struct ResourceServer {
    instances: Arc<dyn InstanceStore>,
    ports: Arc<PortEngine>,
    exec: Arc<ExecBridge>,
}

impl ResourceServer {
    /// Create the service over the engine components.
    pub fn new(
        instances: Arc<dyn InstanceStore>,
        ports: Arc<PortEngine>,
        exec: Arc<ExecBridge>,
    ) -> Self {
        Self {
            instances,
            ports,
            exec,
        }
    }
}

fn to_timestamp(dt: DateTime<Utc>) -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: dt.timestamp(),
        nanos: dt.timestamp_subsec_nanos() as i32,
    }
}

fn from_timestamp(ts: &prost_types::Timestamp) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(ts.seconds, ts.nanos.max(0) as u32)
}

/// Restrict a resource to the masked fields. Accepts both snake_case and
/// camelCase paths; an unknown path rejects the request.
fn apply_resource_field_mask(resource: &Resource, paths: &[String]) -> Result<Resource, Status> {
    let mut out = Resource::default();
    for path in paths {
        match path.as_str() {
            "instance_id" | "instanceId" => out.instance_id = resource.instance_id,
            "name" => out.name.clone_from(&resource.name),
            "user_id" | "userId" => out.user_id.clone_from(&resource.user_id),
            "type" => out.r#type.clone_from(&resource.r#type),
            "created_at" | "createdAt" => out.created_at.clone_from(&resource.created_at),
            "updated_at" | "updatedAt" => out.updated_at.clone_from(&resource.updated_at),
            _ => {
                return Err(Status::invalid_argument(format!(
                    "INVALID_FIELD_MASK: unknown path {path}"
                )))
            }
        }
    }
    Ok(out)
}

fn json_to_value(value: serde_json::Value) -> prost_types::Value {
    use prost_types::value::Kind;

    let kind = match value {
        serde_json::Value::Null => Kind::NullValue(0),
        serde_json::Value::Bool(b) => Kind::BoolValue(b),
        serde_json::Value::Number(n) => Kind::NumberValue(n.as_f64().unwrap_or(0.0)),
        serde_json::Value::String(s) => Kind::StringValue(s),
        serde_json::Value::Array(items) => Kind::ListValue(prost_types::ListValue {
            values: items.into_iter().map(json_to_value).collect(),
        }),
        serde_json::Value::Object(map) => Kind::StructValue(prost_types::Struct {
            fields: map
                .into_iter()
                .map(|(k, v)| (k, json_to_value(v)))
                .collect(),
        }),
    };
    prost_types::Value { kind: Some(kind) }
}

/// Convert an opaque config payload into the reply's struct form. Only
/// JSON objects carry over; anything else is dropped.
fn json_to_struct(value: serde_json::Value) -> Option<prost_types::Struct> {
    match value {
        serde_json::Value::Object(map) => Some(prost_types::Struct {
            fields: map
                .into_iter()
                .map(|(k, v)| (k, json_to_value(v)))
                .collect(),
        }),
        _ => None,
    }
}

type ExecFrames = Pin<Box<dyn Stream<Item = Result<ExecResponse, Status>> + Send + 'static>>;

#[tonic::async_trait]
impl ResourceService for ResourceServer {
    async fn list_resources(
        &self,
        request: Request<ListResourcesRequest>,
    ) -> Result<Response<ListResourcesReply>, Status> {
        let request = request.into_inner();

        let filter = ListFilter {
            user_id: request.user_id.clone(),
            status: request.r#type.clone(),
            start: request.start.as_ref().and_then(from_timestamp),
            end: request.end.as_ref().and_then(from_timestamp),
        };

        debug!(
            user_id = ?filter.user_id,
            status = ?filter.status,
            "listing resources"
        );

        let resources = self
            .instances
            .list_resources(&filter)
            .await
            .map_err(Status::from)?;

        let mask_paths: &[String] = request
            .field_mask
            .as_ref()
            .map(|mask| mask.paths.as_slice())
            .unwrap_or(&[]);

        let mut reply = ListResourcesReply::default();
        let mut instance_ids = Vec::with_capacity(resources.len());
        for resource in &resources {
            instance_ids.push(resource.instance_id);
            let item = Resource {
                instance_id: resource.instance_id,
                name: resource.name.clone(),
                user_id: resource.user_id.clone(),
                r#type: resource.status.clone(),
                created_at: Some(to_timestamp(resource.created_at)),
                updated_at: Some(to_timestamp(resource.updated_at)),
            };
            let item = if mask_paths.is_empty() {
                item
            } else {
                apply_resource_field_mask(&item, mask_paths)?
            };
            reply.resources.push(item);
        }

        let specs = self
            .instances
            .list_specs(&instance_ids)
            .await
            .map_err(Status::from)?;
        for (instance_id, spec) in specs {
            reply.specs.insert(
                instance_id.to_string(),
                ResourceSpec {
                    instance_id,
                    cpu_cores: spec.cpu,
                    memory_size: spec.memory,
                    gpu: spec.gpu,
                    image: spec.image,
                    custom_config: spec.config_json.and_then(json_to_struct),
                },
            );
        }

        Ok(Response::new(reply))
    }

    async fn set_instance_port(
        &self,
        request: Request<SetInstancePortRequest>,
    ) -> Result<Response<SetInstancePortReply>, Status> {
        let request = request.into_inner();

        info!(
            instance_id = request.instance_id,
            open = request.open,
            ports = request.port_configs.len(),
            "setting instance ports"
        );

        let elements = request
            .port_configs
            .into_iter()
            .map(|config| PortRequest {
                port: config.port,
                protocol: config.protocol,
                ingress_domain: config.ingress_domain,
            })
            .collect();

        let outcomes = self
            .ports
            .set_instance_port(request.instance_id, elements, request.open)
            .await
            .map_err(Status::from)?;

        let mut reply = SetInstancePortReply {
            success: true,
            ..Default::default()
        };
        for outcome in outcomes {
            let result = match outcome.result {
                Ok(access_url) => PortResult {
                    port: outcome.port,
                    success: true,
                    access_url,
                    error: String::new(),
                },
                Err(e) => {
                    reply.success = false;
                    PortResult {
                        port: outcome.port,
                        success: false,
                        access_url: String::new(),
                        error: e.to_string(),
                    }
                }
            };
            reply.results.push(result);
        }
        reply.message = if reply.success {
            "ok".to_string()
        } else {
            "one or more ports failed".to_string()
        };

        Ok(Response::new(reply))
    }

    type ExecContainerStream = ExecFrames;

    async fn exec_container(
        &self,
        request: Request<Streaming<ExecRequest>>,
    ) -> Result<Response<Self::ExecContainerStream>, Status> {
        let mut inbound = request.into_inner();

        let first = match inbound.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(status)) => return Err(status),
            None => return Err(Status::invalid_argument("expected Init frame")),
        };
        let Some(exec_request::Frame::Init(init)) = first.frame else {
            return Err(Status::invalid_argument("first frame must be Init"));
        };

        let opts = self
            .exec
            .resolve(init.instance_id, &init.command, init.tty, &init.container_name)
            .await
            .map_err(Status::from)?;

        info!(
            instance_id = init.instance_id,
            namespace = %opts.namespace,
            tty = init.tty,
            "starting exec session"
        );

        let (input_tx, input_rx) = mpsc::channel(FRAME_QUEUE_CAPACITY);
        let (output_tx, mut output_rx) = mpsc::channel(FRAME_QUEUE_CAPACITY);
        let (frame_tx, frame_rx) = mpsc::channel::<Result<ExecResponse, Status>>(FRAME_QUEUE_CAPACITY);

        // Input flow: client frames into the session's input queue.
        tokio::spawn(async move {
            while let Some(frame) = inbound.next().await {
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!(error = %e, "exec inbound stream error");
                        break;
                    }
                };
                let input = match frame.frame {
                    Some(exec_request::Frame::Input(input)) => ExecInput::Stdin(input.data),
                    Some(exec_request::Frame::Resize(resize)) => ExecInput::Resize {
                        rows: resize.rows as u16,
                        cols: resize.cols as u16,
                    },
                    Some(exec_request::Frame::Init(_)) => {
                        warn!("ignoring duplicate Init frame");
                        continue;
                    }
                    None => continue,
                };
                if input_tx.send(input).await.is_err() {
                    break;
                }
            }
        });

        // Output flow: session frames onto the wire.
        let pump_tx = frame_tx.clone();
        tokio::spawn(async move {
            while let Some(output) = output_rx.recv().await {
                let frame = match output {
                    ExecOutput::Data { stream, data } => exec_response::Frame::Output(
                        berth_proto::ExecOutput {
                            stream: stream.as_str().to_string(),
                            data,
                        },
                    ),
                    ExecOutput::Error(message) => exec_response::Frame::Error(message),
                    ExecOutput::Exit(code) => exec_response::Frame::Exit(ExecExit { code }),
                };
                if pump_tx
                    .send(Ok(ExecResponse { frame: Some(frame) }))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        // Completion flow: failures before the channel opens close the
        // stream with a status instead of frames.
        let exec = self.exec.clone();
        tokio::spawn(async move {
            if let Err(e) = exec.run(opts, input_rx, output_tx).await {
                let _ = frame_tx.send(Err(Status::from(e))).await;
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(frame_rx))))
    }
}
