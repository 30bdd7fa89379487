//! QUIC transport adapter
//!
//! Presents a QUIC connection plus one long-lived bidirectional stream
//! as a byte-oriented, deadline-aware connection (a "stream-conn") so an
//! off-the-shelf gRPC stack can speak over QUIC with TLS as the sole
//! handshake:
//!
//! - [`QuicListener`] accepts a connection, then its first client-opened
//!   stream, and yields stream-conns to tonic's `serve_with_incoming`.
//! - [`QuicDialer`] dials an endpoint and opens the stream synchronously.
//! - [`QuicConn`] carries the already-authenticated identity to handlers
//!   through its connect info (`quic-tls`, `/quic/1.0.0`); there is no
//!   second handshake on the stream.

#![deny(missing_docs)]

mod conn;
mod dialer;
mod listener;

use thiserror::Error;

pub use conn::{QuicConn, QuicConnectInfo, AUTH_TYPE_QUIC_TLS, PROTOCOL_VERSION};
pub use dialer::{grpc_connector, QuicDialer, QuicDialerConfig};
pub use listener::QuicListener;

/// Errors from the QUIC transport adapter
#[derive(Debug, Error)]
pub enum TransportError {
    /// Endpoint bind error
    #[error("bind error: {0}")]
    Bind(#[from] std::io::Error),

    /// QUIC connection error
    #[error("connection error: {0}")]
    Connection(#[from] quinn::ConnectionError),

    /// QUIC connect error (bad address or config)
    #[error("connect error: {0}")]
    Connect(#[from] quinn::ConnectError),

    /// TLS configuration error
    #[error("TLS error: {0}")]
    Tls(String),
}
