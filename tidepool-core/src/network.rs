//! Network provider abstraction over stream transports.
//!
//! Peers and supervisors open connections through this trait rather than
//! `tokio::net` directly, which keeps the peer subsystem testable against
//! in-memory or scripted transports.

use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};

/// Provider trait for creating network connections and listeners.
///
/// Single-threaded design - no Send bounds needed.
/// Clone allows sharing one provider across many peers.
#[async_trait(?Send)]
pub trait NetworkProvider: Clone {
    /// The byte-stream type produced by this provider.
    type TcpStream: AsyncRead + AsyncWrite + Unpin + 'static;
    /// The listener type produced by this provider.
    type TcpListener: TcpListenerTrait<TcpStream = Self::TcpStream> + 'static;

    /// Create a listener bound to the given address.
    ///
    /// `backlog` is the accept queue depth hint; providers that cannot
    /// honour it may ignore it.
    async fn bind(&self, addr: &str, backlog: u32) -> io::Result<Self::TcpListener>;

    /// Connect to a remote address.
    ///
    /// Connect deadlines are applied by the caller via
    /// [`TimeProvider::timeout`](crate::TimeProvider::timeout), keeping
    /// this trait free of time concerns.
    async fn connect(&self, addr: &str) -> io::Result<Self::TcpStream>;
}

/// Trait for listeners that can accept connections.
#[async_trait(?Send)]
pub trait TcpListenerTrait {
    /// The byte-stream type that this listener produces.
    type TcpStream: AsyncRead + AsyncWrite + Unpin + 'static;

    /// Accept a single incoming connection.
    ///
    /// Returns the stream and the remote address as a string.
    async fn accept(&self) -> io::Result<(Self::TcpStream, String)>;

    /// Get the local address this listener is bound to.
    fn local_addr(&self) -> io::Result<String>;
}

/// Real Tokio networking implementation.
#[derive(Debug, Clone)]
pub struct TokioNetworkProvider;

impl TokioNetworkProvider {
    /// Create a new Tokio network provider.
    pub fn new() -> Self {
        Self
    }
}

impl Default for TokioNetworkProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl NetworkProvider for TokioNetworkProvider {
    type TcpStream = tokio::net::TcpStream;
    type TcpListener = TokioTcpListener;

    async fn bind(&self, addr: &str, _backlog: u32) -> io::Result<Self::TcpListener> {
        // tokio::net::TcpListener::bind uses the platform default backlog;
        // the hint is honoured by providers that expose socket options.
        let listener = tokio::net::TcpListener::bind(addr).await?;
        Ok(TokioTcpListener { inner: listener })
    }

    async fn connect(&self, addr: &str) -> io::Result<Self::TcpStream> {
        tokio::net::TcpStream::connect(addr).await
    }
}

/// Wrapper for Tokio TcpListener to implement our trait.
#[derive(Debug)]
pub struct TokioTcpListener {
    inner: tokio::net::TcpListener,
}

#[async_trait(?Send)]
impl TcpListenerTrait for TokioTcpListener {
    type TcpStream = tokio::net::TcpStream;

    async fn accept(&self) -> io::Result<(Self::TcpStream, String)> {
        let (stream, addr) = self.inner.accept().await?;
        Ok((stream, addr.to_string()))
    }

    fn local_addr(&self) -> io::Result<String> {
        Ok(self.inner.local_addr()?.to_string())
    }
}
