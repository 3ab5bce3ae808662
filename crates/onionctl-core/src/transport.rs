//! Transport provider — opens the raw duplex byte stream for an endpoint.
//!
//! The control socket never touches `TcpStream` or `UnixStream` directly; it
//! asks a [`Connector`] for a fresh [`Transport`] each time it connects. This
//! keeps the connection state machine independent of how bytes are carried
//! and lets tests substitute in-memory pipes.

use std::path::PathBuf;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tracing::debug;

use onionctl_config::Endpoint;

use crate::BoxFuture;

/// A connected duplex byte stream.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

/// Boxed transport handed to the control socket.
pub type BoxTransport = Box<dyn Transport>;

/// Something that can open a transport to one endpoint.
///
/// Closing is done by shutting down and dropping the returned stream.
pub trait Connector: Send + Sync {
    /// The endpoint this connector opens.
    fn endpoint(&self) -> &Endpoint;

    /// Open a new transport.
    fn connect(&self) -> BoxFuture<'_, std::io::Result<BoxTransport>>;
}

/// Connects to a TCP control port.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    endpoint: Endpoint,
    address: String,
    port: u16,
}

impl TcpConnector {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        let address = address.into();
        Self {
            endpoint: Endpoint::port(address.clone(), port),
            address,
            port,
        }
    }
}

impl Connector for TcpConnector {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn connect(&self) -> BoxFuture<'_, std::io::Result<BoxTransport>> {
        Box::pin(async move {
            let stream = TcpStream::connect((self.address.as_str(), self.port)).await?;
            stream.set_nodelay(true)?;
            debug!(endpoint = %self.endpoint, "TCP transport opened");
            Ok(Box::new(stream) as BoxTransport)
        })
    }
}

/// Connects to a Unix domain control socket.
#[derive(Debug, Clone)]
pub struct UnixConnector {
    endpoint: Endpoint,
    path: PathBuf,
}

impl UnixConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            endpoint: Endpoint::socket_file(path.clone()),
            path,
        }
    }
}

impl Connector for UnixConnector {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn connect(&self) -> BoxFuture<'_, std::io::Result<BoxTransport>> {
        Box::pin(async move {
            let stream = UnixStream::connect(&self.path).await?;
            debug!(endpoint = %self.endpoint, "Unix socket transport opened");
            Ok(Box::new(stream) as BoxTransport)
        })
    }
}

/// Build the connector matching an endpoint descriptor.
pub fn connector_for(endpoint: &Endpoint) -> Box<dyn Connector> {
    match endpoint {
        Endpoint::Port { address, port } => Box::new(TcpConnector::new(address.clone(), *port)),
        Endpoint::SocketFile { path } => Box::new(UnixConnector::new(path.clone())),
    }
}
