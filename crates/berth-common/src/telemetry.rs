//! Tracing initialization
//!
//! Structured logging with an env-filter; `RUST_LOG` overrides the
//! default directive set. Every emitted line carries a `service` field
//! identifying its origin.

use std::fmt::Write as _;

use thiserror::Error;
use tracing_subscriber::field::RecordFields;
use tracing_subscriber::fmt::format::{DefaultFields, Writer};
use tracing_subscriber::fmt::FormatFields;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Errors that can occur during telemetry initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Failed to initialize tracing subscriber
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Field formatter that stamps the service name onto every record
/// before the event's own fields.
struct ServiceFields {
    service_name: String,
    inner: DefaultFields,
}

impl<'writer> FormatFields<'writer> for ServiceFields {
    fn format_fields<R: RecordFields>(
        &self,
        mut writer: Writer<'writer>,
        fields: R,
    ) -> std::fmt::Result {
        write!(writer, "service={} ", self.service_name)?;
        self.inner.format_fields(writer, fields)
    }
}

/// Initialize the tracing subscriber.
///
/// Call once from `main` before any other work. Uses `RUST_LOG` when
/// set, otherwise a default filter that keeps our crates at debug and
/// the HTTP stack quiet. `service_name` is attached to every log line.
pub fn init(service_name: impl Into<String>) -> Result<(), TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,berth=debug,kube=info,tower=warn,hyper=warn"));

    let fmt_layer = tracing_subscriber::fmt::layer().fmt_fields(ServiceFields {
        service_name: service_name.into(),
        inner: DefaultFields::new(),
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| TelemetryError::SubscriberInit(e.to_string()))
}
