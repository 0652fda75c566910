//! Transport abstraction.
//!
//! The session core only needs a reliable ordered byte stream; where it
//! comes from is the dialer's business. Production dials `*.onion:port`
//! through the local Tor SOCKS proxy; tests hand in `tokio::io::duplex`
//! pipes.

use std::io;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio_socks::tcp::Socks5Stream;
use tracing::debug;

use nocturne_shared::OnionAddr;

/// Default SOCKS endpoint of the local Tor daemon.
pub const DEFAULT_SOCKS_PROXY: &str = "127.0.0.1:9050";

pub trait Duplex: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Duplex for T {}

/// An established connection to a peer. No framing; the encrypted stream
/// layer owns all of that.
pub struct PeerStream {
    inner: Box<dyn Duplex>,
}

impl PeerStream {
    pub fn new(io: impl Duplex + 'static) -> Self {
        Self {
            inner: Box::new(io),
        }
    }

    pub fn split(self) -> (ReadHalf<Box<dyn Duplex>>, WriteHalf<Box<dyn Duplex>>) {
        tokio::io::split(self.inner)
    }
}

impl AsyncRead for PeerStream {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        std::pin::Pin::new(&mut *self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PeerStream {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<io::Result<usize>> {
        std::pin::Pin::new(&mut *self.inner).poll_write(cx, buf)
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        std::pin::Pin::new(&mut *self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        std::pin::Pin::new(&mut *self.inner).poll_shutdown(cx)
    }
}

impl std::fmt::Debug for PeerStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerStream").finish_non_exhaustive()
    }
}

/// Stream factory consumed by outgoing sessions; one dial per reconnect
/// attempt.
pub trait Dialer: Send + Sync {
    fn dial(&self, addr: &OnionAddr) -> BoxFuture<'static, io::Result<PeerStream>>;
}

/// Dials onion endpoints through a SOCKS5 proxy. The proxy resolves the
/// hostname itself, so the onion address never leaves the Tor daemon.
pub struct SocksDialer {
    proxy: String,
}

impl SocksDialer {
    pub fn new(proxy: impl Into<String>) -> Self {
        Self {
            proxy: proxy.into(),
        }
    }
}

impl Default for SocksDialer {
    fn default() -> Self {
        Self::new(DEFAULT_SOCKS_PROXY)
    }
}

impl Dialer for SocksDialer {
    fn dial(&self, addr: &OnionAddr) -> BoxFuture<'static, io::Result<PeerStream>> {
        let proxy = self.proxy.clone();
        let host = addr.socks_host();
        let port = addr.port();

        async move {
            debug!(proxy = %proxy, host = %host, port, "Dialing through SOCKS proxy");
            let stream = Socks5Stream::connect(proxy.as_str(), (host, port))
                .await
                .map_err(|e| io::Error::new(io::ErrorKind::ConnectionRefused, e))?;
            Ok(PeerStream::new(stream))
        }
        .boxed()
    }
}
