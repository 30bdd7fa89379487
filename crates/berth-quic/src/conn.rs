//! Stream-conn: one QUIC stream presented as a byte-oriented connection

use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use quinn::{Connection, RecvStream, SendStream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tonic::transport::server::Connected;

/// Auth type reported for QUIC stream-conns: the QUIC handshake already
/// authenticated the connection.
pub const AUTH_TYPE_QUIC_TLS: &str = "quic-tls";

/// Protocol version string reported for QUIC stream-conns.
pub const PROTOCOL_VERSION: &str = "/quic/1.0.0";

/// A QUIC connection paired with one bidirectional stream.
///
/// Reads and writes delegate to the stream; shutdown finishes the stream
/// and then closes the owning connection with code 0.
pub struct QuicConn {
    connection: Connection,
    send: SendStream,
    recv: RecvStream,
}

impl QuicConn {
    pub(crate) fn new(connection: Connection, send: SendStream, recv: RecvStream) -> Self {
        Self {
            connection,
            send,
            recv,
        }
    }

    /// Remote endpoint address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.connection.remote_address()
    }
}

/// Identity a QUIC stream-conn presents to gRPC handlers.
///
/// The connection is reported as already authenticated; QUIC's
/// integrated TLS performed the handshake.
#[derive(Debug, Clone)]
pub struct QuicConnectInfo {
    /// Peer address
    pub remote_addr: SocketAddr,
    /// Security protocol tag (`quic-tls`)
    pub auth_type: &'static str,
    /// Protocol version string (`/quic/1.0.0`)
    pub protocol: &'static str,
}

impl Connected for QuicConn {
    type ConnectInfo = QuicConnectInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        QuicConnectInfo {
            remote_addr: self.remote_addr(),
            auth_type: AUTH_TYPE_QUIC_TLS,
            protocol: PROTOCOL_VERSION,
        }
    }
}

impl AsyncRead for QuicConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().recv).poll_read(cx, buf)
    }
}

impl AsyncWrite for QuicConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        AsyncWrite::poll_write(Pin::new(&mut self.get_mut().send), cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        AsyncWrite::poll_flush(Pin::new(&mut self.get_mut().send), cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let finished = AsyncWrite::poll_shutdown(Pin::new(&mut this.send), cx);
        if finished.is_ready() {
            this.connection.close(0u32.into(), b"");
        }
        finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_info_constants() {
        assert_eq!(AUTH_TYPE_QUIC_TLS, "quic-tls");
        assert_eq!(PROTOCOL_VERSION, "/quic/1.0.0");
    }
}
