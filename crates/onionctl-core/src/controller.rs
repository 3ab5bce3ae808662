//! Base controller — a thin façade over one owned [`ControlSocket`].
//!
//! Every operation forwards to the socket; the controller holds no state of
//! its own. Higher level controllers are built on top of this type and
//! should use the forwarding methods rather than reaching into the socket,
//! so the socket can be swapped out without callers noticing.

use std::path::PathBuf;
use std::sync::Arc;

use onionctl_config::{
    AppConfig, DEFAULT_CONTROL_ADDR, DEFAULT_CONTROL_PORT, DEFAULT_SOCKET_PATH, Endpoint,
};

use crate::error::Result;
use crate::listener::{Dispatch, StatusCallback};
use crate::message::{ControlMessage, Request};
use crate::socket::ControlSocket;

/// Controller for a tor process, wrapping exactly one control socket.
///
/// Always handed out inside an [`Arc`]; the socket keeps a weak reference
/// back to it so status listeners can tell which controller changed state.
#[derive(Debug)]
pub struct BaseController {
    socket: ControlSocket,
}

impl BaseController {
    /// Wrap a socket. The socket's owner is set to the new controller.
    pub fn new(socket: ControlSocket) -> Arc<Self> {
        Arc::new_cyclic(|weak| {
            socket.bind_owner(weak.clone());
            Self { socket }
        })
    }

    /// A controller for a TCP control port. Does not connect.
    pub fn from_port(address: impl Into<String>, port: u16) -> Result<Arc<Self>> {
        Self::from_endpoint(&Endpoint::port(address, port))
    }

    /// A controller for `127.0.0.1:9051`.
    pub fn from_port_default() -> Result<Arc<Self>> {
        Self::from_port(DEFAULT_CONTROL_ADDR, DEFAULT_CONTROL_PORT)
    }

    /// A controller for a Unix domain control socket. Does not connect.
    pub fn from_socket_file(path: impl Into<PathBuf>) -> Result<Arc<Self>> {
        Self::from_endpoint(&Endpoint::socket_file(path))
    }

    /// A controller for `/var/run/tor/control`.
    pub fn from_socket_file_default() -> Result<Arc<Self>> {
        Self::from_socket_file(DEFAULT_SOCKET_PATH)
    }

    pub fn from_endpoint(endpoint: &Endpoint) -> Result<Arc<Self>> {
        Ok(Self::new(ControlSocket::from_endpoint(endpoint)?))
    }

    pub fn from_config(config: &AppConfig) -> Result<Arc<Self>> {
        Self::from_endpoint(&config.control)
    }

    pub async fn send(&self, request: impl Into<Request>) -> Result<()> {
        self.socket.send(request).await
    }

    pub async fn recv(&self) -> Result<ControlMessage> {
        self.socket.recv().await
    }

    pub fn is_alive(&self) -> bool {
        self.socket.is_alive()
    }

    pub async fn connect(&self) -> Result<()> {
        self.socket.connect().await
    }

    pub async fn close(&self) {
        self.socket.close().await
    }

    /// The underlying socket. Prefer the forwarding methods.
    pub fn get_socket(&self) -> &ControlSocket {
        &self.socket
    }

    pub fn add_status_listener(&self, callback: StatusCallback, dispatch: Dispatch) {
        self.socket.add_status_listener(callback, dispatch)
    }

    pub fn remove_status_listener(&self, callback: &StatusCallback) -> bool {
        self.socket.remove_status_listener(callback)
    }
}
