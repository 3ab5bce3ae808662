//! Error taxonomy shared by every control-channel operation.

use onionctl_config::Endpoint;

/// Errors from the control socket, controller, and event reader.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// The transport could not be opened (refused, missing socket file,
    /// permission denied, or an endpoint that can never be reached).
    #[error("failed to connect to control endpoint {endpoint}: {source}")]
    Connection {
        endpoint: Endpoint,
        source: std::io::Error,
    },

    #[error("already connected to {0}; close the connection first")]
    AlreadyConnected(Endpoint),

    #[error("control connection is closed")]
    ConnectionClosed,

    /// A read or write failed while connected. The socket has already been
    /// closed and listeners notified by the time the caller sees this.
    #[error("control transport failed: {0}")]
    Transport(#[source] std::io::Error),

    #[error("malformed control message: {0}")]
    Protocol(String),

    #[error("invalid request: {0}")]
    InvalidMessage(String),
}

impl ControlError {
    /// Whether this error means the connection is gone.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::ConnectionClosed | Self::Transport(_))
    }
}

/// Convenience alias for control-channel results.
pub type Result<T, E = ControlError> = std::result::Result<T, E>;
