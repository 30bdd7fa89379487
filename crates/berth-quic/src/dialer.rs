//! QUIC dialer and the tonic connector built on it

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use hyper_util::rt::TokioIo;
use quinn::{ClientConfig, Endpoint};
use tracing::debug;

use berth_common::ALPN_GRPC_QUIC;

use crate::conn::QuicConn;
use crate::TransportError;

/// TLS trust configuration for the dialer.
#[derive(Debug, Clone)]
pub struct QuicDialerConfig {
    /// Server name for TLS verification
    pub server_name: String,
    /// Trust exactly this CA (PEM); `None` uses the webpki roots
    pub ca_pem: Option<Vec<u8>>,
    /// Skip certificate verification (development only!)
    pub dangerous_skip_cert_verification: bool,
}

impl Default for QuicDialerConfig {
    fn default() -> Self {
        Self {
            server_name: "localhost".to_string(),
            ca_pem: None,
            dangerous_skip_cert_verification: false,
        }
    }
}

/// Dials QUIC endpoints and opens the long-lived stream synchronously.
pub struct QuicDialer {
    endpoint: Endpoint,
    server_name: String,
}

impl QuicDialer {
    /// Create a dialer with the given trust configuration, advertising
    /// the `grpc-quic` ALPN identifier.
    pub fn new(config: QuicDialerConfig) -> Result<Self, TransportError> {
        let crypto = if config.dangerous_skip_cert_verification {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(SkipServerVerification::new()))
                .with_no_client_auth()
        } else if let Some(ca_pem) = &config.ca_pem {
            let mut roots = rustls::RootCertStore::empty();
            for cert in rustls_pemfile::certs(&mut ca_pem.as_slice()) {
                let cert =
                    cert.map_err(|e| TransportError::Tls(format!("failed to parse CA: {e}")))?;
                roots
                    .add(cert)
                    .map_err(|e| TransportError::Tls(e.to_string()))?;
            }
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        } else {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        };

        let mut crypto = crypto;
        crypto.alpn_protocols = vec![ALPN_GRPC_QUIC.to_vec()];

        let client_config = ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
                .map_err(|e| TransportError::Tls(e.to_string()))?,
        ));

        let mut endpoint = Endpoint::client("0.0.0.0:0".parse().expect("static addr"))?;
        endpoint.set_default_client_config(client_config);

        Ok(Self {
            endpoint,
            server_name: config.server_name,
        })
    }

    /// Dial the endpoint and open the stream-conn.
    pub async fn connect(&self, addr: SocketAddr) -> Result<QuicConn, TransportError> {
        let connection = self.endpoint.connect(addr, &self.server_name)?.await?;
        debug!(%addr, "QUIC connection established");

        let (send, recv) = connection.open_bi().await?;
        Ok(QuicConn::new(connection, send, recv))
    }
}

type ConnectorFuture =
    Pin<Box<dyn Future<Output = Result<TokioIo<QuicConn>, TransportError>> + Send>>;

/// Connector for `tonic::transport::Endpoint::connect_with_connector`:
/// every gRPC channel dial becomes a QUIC connect plus stream open.
pub fn grpc_connector(
    dialer: Arc<QuicDialer>,
    addr: SocketAddr,
) -> impl tower::Service<
    tonic::transport::Uri,
    Response = TokioIo<QuicConn>,
    Error = TransportError,
    Future = ConnectorFuture,
> + Clone {
    tower::service_fn(move |_uri: tonic::transport::Uri| -> ConnectorFuture {
        let dialer = dialer.clone();
        Box::pin(async move { Ok(TokioIo::new(dialer.connect(addr).await?)) })
    })
}

/// Certificate verifier that skips all verification (development only!)
#[derive(Debug)]
struct SkipServerVerification(Arc<rustls::crypto::CryptoProvider>);

impl SkipServerVerification {
    fn new() -> Self {
        Self(Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
