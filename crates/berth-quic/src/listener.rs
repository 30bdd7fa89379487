//! QUIC listener yielding stream-conns

use std::net::SocketAddr;
use std::sync::Arc;

use futures::Stream;
use quinn::{Endpoint, ServerConfig};
use tracing::{debug, info, warn};

use berth_common::ALPN_GRPC_QUIC;

use crate::conn::QuicConn;
use crate::TransportError;

/// Accepts QUIC connections and wraps each with its first client-opened
/// bidirectional stream.
pub struct QuicListener {
    endpoint: Endpoint,
}

impl QuicListener {
    /// Bind a QUIC endpoint with the given PEM certificate chain and
    /// private key, advertising the `grpc-quic` ALPN identifier.
    pub fn bind(addr: SocketAddr, cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, TransportError> {
        let certs = rustls_pemfile::certs(&mut &*cert_pem)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TransportError::Tls(format!("failed to parse certificates: {e}")))?;
        if certs.is_empty() {
            return Err(TransportError::Tls("no certificates found".to_string()));
        }
        let key = rustls_pemfile::private_key(&mut &*key_pem)
            .map_err(|e| TransportError::Tls(format!("failed to parse private key: {e}")))?
            .ok_or_else(|| TransportError::Tls("no private key found".to_string()))?;

        let mut crypto = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        crypto.alpn_protocols = vec![ALPN_GRPC_QUIC.to_vec()];

        let server_config = ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(crypto)
                .map_err(|e| TransportError::Tls(e.to_string()))?,
        ));

        let endpoint = Endpoint::server(server_config, addr)?;
        info!(%addr, "QUIC listener bound");

        Ok(Self { endpoint })
    }

    /// The bound local address.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Accept the next stream-conn: the connection, then its first
    /// bidirectional stream. A connection whose stream-accept fails is
    /// closed with code 0.
    ///
    /// Returns `None` once the endpoint is closed.
    pub async fn accept(&self) -> Option<Result<QuicConn, TransportError>> {
        let incoming = self.endpoint.accept().await?;

        let conn = async {
            let connection = incoming.await?;
            debug!(remote = %connection.remote_address(), "accepted QUIC connection");

            match connection.accept_bi().await {
                Ok((send, recv)) => Ok(QuicConn::new(connection, send, recv)),
                Err(e) => {
                    connection.close(0u32.into(), b"");
                    Err(e.into())
                }
            }
        }
        .await;

        Some(conn)
    }

    /// Adapt the listener into the connection stream tonic serves over.
    ///
    /// Individual handshake failures are logged and skipped rather than
    /// terminating the server.
    pub fn incoming(self) -> impl Stream<Item = Result<QuicConn, TransportError>> {
        futures::stream::unfold(self, |listener| async move {
            loop {
                match listener.accept().await {
                    None => return None,
                    Some(Ok(conn)) => return Some((Ok(conn), listener)),
                    Some(Err(e)) => {
                        warn!(error = %e, "failed to accept stream-conn");
                        continue;
                    }
                }
            }
        })
    }

    /// Close the endpoint; in-flight accepts resolve to `None`.
    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"server closing");
    }
}
