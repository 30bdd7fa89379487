//! Common types for Berth: errors, telemetry, and shared constants

#![deny(missing_docs)]

pub mod error;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Default bind address for the gRPC-over-QUIC server
pub const DEFAULT_GRPC_ADDR: &str = "0.0.0.0:9000";

/// ALPN protocol identifier advertised on the QUIC listener
pub const ALPN_GRPC_QUIC: &[u8] = b"grpc-quic";

/// Default ingress host used for HTTP port exposure
pub const DEFAULT_INGRESS_DOMAIN: &str = "demo.localtest.me";

/// Namespace holding the ingress-nginx controller
pub const DEFAULT_INGRESS_NGINX_NAMESPACE: &str = "ingress-nginx";

/// Name of the ingress-nginx controller's LoadBalancer service
pub const DEFAULT_INGRESS_NGINX_LB_SERVICE: &str = "ingress-nginx-controller";

/// First external port handed out for TCP/UDP exposure
pub const DEFAULT_PORT_RANGE_START: u16 = 30000;

/// Last external port handed out for TCP/UDP exposure
pub const DEFAULT_PORT_RANGE_END: u16 = 32767;

/// Placeholder access host when the LoadBalancer address cannot be read
pub const LB_ADDRESS_PLACEHOLDER: &str = "<ingress-lb-ip>";

/// Pod label carrying the instance identifier
pub const LABEL_INSTANCE_ID: &str = "instance-id";

/// Pod label selecting instance workloads
pub const LABEL_APP: &str = "app";

/// Value of the `app` label on instance pods
pub const APP_INSTANCE: &str = "instance";

/// Pod label carrying the owning tenant
pub const LABEL_USER_ID: &str = "user-id";

/// Install the default crypto provider for rustls.
///
/// Must be called before creating any TLS endpoint (QUIC listener, kube
/// client). Safe to call multiple times - subsequent calls are no-ops.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}
