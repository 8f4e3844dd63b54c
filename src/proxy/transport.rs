//! Byte streams produced by the dialers
//!
//! Every dial hands back a boxed [`TunnelStream`]. Dropping it closes the
//! underlying socket, so each error path releases its descriptor simply by
//! returning.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Trait for duplex byte streams that can carry a tunnel
pub trait TunnelStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> TunnelStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

// Lets tests call `unwrap_err()` on `Result<Tunnel, _>`
#[cfg(test)]
impl std::fmt::Debug for dyn TunnelStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TunnelStream")
    }
}

/// An open connection to the target, either direct or through a proxy
pub type Tunnel = Box<dyn TunnelStream>;

pin_project! {
    /// Replays bytes read past the end of a handshake before reading from
    /// the inner stream again.
    pub struct PrefixedStream<S> {
        prefix: Bytes,
        #[pin]
        inner: S,
    }
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }
}

impl<S: AsyncRead> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        if this.prefix.has_remaining() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix[..n]);
            this.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        this.inner.poll_read(cx, buf)
    }
}

impl<S: AsyncWrite> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

/// Box a stream, keeping any bytes that were read ahead of it
pub fn into_tunnel<S: TunnelStream>(stream: S, leftover: &[u8]) -> Tunnel {
    if leftover.is_empty() {
        Box::new(stream)
    } else {
        Box::new(PrefixedStream::new(Bytes::copy_from_slice(leftover), stream))
    }
}

/// Format `host:port`, bracketing bare IPv6 literals
pub fn format_authority(host: &str, port: u16) -> String {
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_prefixed_stream_replays_leftover_first() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut tunnel = into_tunnel(client, b"early ");

        server.write_all(b"late").await.unwrap();
        server.shutdown().await.unwrap();

        let mut out = String::new();
        tunnel.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "early late");
    }

    #[tokio::test]
    async fn test_prefixed_stream_passes_writes_through() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut tunnel = into_tunnel(client, b"x");

        tunnel.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn test_format_authority() {
        assert_eq!(format_authority("example.com", 443), "example.com:443");
        assert_eq!(format_authority("::1", 8080), "[::1]:8080");
        assert_eq!(format_authority("[::1]", 8080), "[::1]:8080");
    }
}
