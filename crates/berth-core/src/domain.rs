//! Domain types shared across the control plane

use berth_common::Error;
use chrono::{DateTime, Utc};

/// Declared shape of an instance: identity plus requested resources.
///
/// Created from an `INSTANCE_CREATED` event and persisted alongside the
/// instance row in one transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceSpec {
    /// Globally unique 64-bit identifier
    pub instance_id: i64,
    /// Owning tenant; doubles as the cluster namespace name
    pub user_id: String,
    /// Display name
    pub name: String,
    /// Requested CPU cores
    pub cpu: u32,
    /// Requested memory in MiB
    pub memory: u32,
    /// GPU catalog entry (0 = none)
    pub gpu: u32,
    /// Container image reference
    pub image: String,
    /// Opaque structured payload
    pub config_json: Option<serde_json::Value>,
}

/// Read model for listing instances.
#[derive(Debug, Clone)]
pub struct Resource {
    /// Instance identifier
    pub instance_id: i64,
    /// Display name
    pub name: String,
    /// Owning tenant
    pub user_id: String,
    /// Current status (CREATING | RUNNING | STOPPED | DELETED)
    pub status: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
}

/// Optional filters for listing resources.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    /// Restrict to one tenant
    pub user_id: Option<String>,
    /// Restrict to one status
    pub status: Option<String>,
    /// Creation-time window start (inclusive)
    pub start: Option<DateTime<Utc>>,
    /// Creation-time window end (inclusive)
    pub end: Option<DateTime<Utc>>,
}

/// Exposure protocol for a network binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// L4 exposure through the ingress controller's TCP port map
    Tcp,
    /// L4 exposure through the ingress controller's UDP port map
    Udp,
    /// L7 exposure through an Ingress
    Http,
}

impl Protocol {
    /// Canonical wire name (TCP | UDP | HTTP)
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Http => "HTTP",
        }
    }

    /// Lowercase name used in cluster-side port names
    pub fn as_lower(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Http => "http",
        }
    }

    /// Whether this protocol is exposed at L4 (external port + port map)
    pub fn is_l4(&self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Udp)
    }

    /// Parse a wire name; the empty string defaults to HTTP.
    pub fn parse(s: &str) -> Result<Self, Error> {
        match s {
            "" | "HTTP" => Ok(Protocol::Http),
            "TCP" => Ok(Protocol::Tcp),
            "UDP" => Ok(Protocol::Udp),
            other => Err(Error::invalid_argument(format!(
                "invalid protocol {other:?}, must be TCP/UDP/HTTP"
            ))),
        }
    }
}

/// Persisted record tying an instance port to its cluster-side network
/// path.
///
/// Exactly one of `external_port` / `ingress_name` is set, determined by
/// the protocol: L4 bindings carry the allocated external port, HTTP
/// bindings carry the ingress name.
#[derive(Debug, Clone)]
pub struct NetworkBinding {
    /// Owning instance
    pub instance_id: i64,
    /// Container port
    pub port: u16,
    /// Cluster-internal service name
    pub service_name: String,
    /// Port exposed by the service
    pub service_port: u16,
    /// External port on the ingress controller (TCP/UDP only)
    pub external_port: Option<u16>,
    /// Ingress object name (HTTP only)
    pub ingress_name: Option<String>,
    /// Exposure protocol
    pub protocol: Protocol,
    /// User-facing access address
    pub access_url: String,
    /// Whether the binding is live
    pub enabled: bool,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
}

/// Kinds of audit records written by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditKind {
    /// Instance created
    Create,
    /// Port opened
    PortOpened,
    /// Port closed
    PortClosed,
}

impl AuditKind {
    /// Persisted log_type value
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::Create => "CREATE",
            AuditKind::PortOpened => "PORT_OPENED",
            AuditKind::PortClosed => "PORT_CLOSED",
        }
    }
}

/// Append-only audit record.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    /// Referenced instance
    pub instance_id: i64,
    /// Record kind
    pub kind: AuditKind,
    /// Human-readable summary
    pub message: String,
    /// Structured payload
    pub data_json: serde_json::Value,
    /// Record time
    pub created_at: DateTime<Utc>,
}

/// Options for opening a cluster-side exec channel.
#[derive(Debug, Clone)]
pub struct ExecOptions {
    /// Tenant namespace
    pub namespace: String,
    /// Instance whose pod is targeted
    pub instance_id: i64,
    /// Container to exec into
    pub container_name: String,
    /// Command and arguments
    pub command: Vec<String>,
    /// Whether to allocate a TTY
    pub tty: bool,
}

/// Client-to-cluster frames for an exec session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecInput {
    /// Bytes for the container's stdin
    Stdin(Vec<u8>),
    /// Terminal resize event
    Resize {
        /// New row count
        rows: u16,
        /// New column count
        cols: u16,
    },
}

/// Which standard stream an output chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStream {
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
}

impl ExecStream {
    /// Wire name ("stdout" / "stderr")
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecStream::Stdout => "stdout",
            ExecStream::Stderr => "stderr",
        }
    }
}

/// Cluster-to-client frames for an exec session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutput {
    /// Output bytes from one of the standard streams
    Data {
        /// Source stream
        stream: ExecStream,
        /// Chunk contents (cloned out of the read buffer)
        data: Vec<u8>,
    },
    /// Error report; followed by an Exit frame
    Error(String),
    /// Session termination; sent exactly once
    Exit(i32),
}
