#![deny(unsafe_code)]

//! onionctl core — a client-side control channel for the tor control protocol.
//!
//! A [`ControlSocket`] owns one connection (TCP port or Unix socket file),
//! frames requests and replies, and reports connection state transitions to
//! registered status listeners. [`BaseController`] is a thin façade over one
//! socket, and [`EventReader`] splits pushed events from replies so callers
//! can run request/response exchanges while events keep flowing.
//!
//! No command vocabulary or authentication lives here; payloads are opaque.

use std::future::Future;
use std::pin::Pin;

/// A type-erased, `Send`-safe, boxed future — the standard return type for async
/// trait methods that require dynamic dispatch (`dyn Trait`).
///
/// Native `async fn` in traits produces opaque return types that are **not**
/// object-safe. Traits consumed via `Box<dyn Trait>` must return a concrete
/// `Pin<Box<dyn Future>>` instead.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Base controller façade and its endpoint constructors.
pub mod controller;
/// Control channel error taxonomy.
pub mod error;
/// Status listener registry and connection states.
pub mod listener;
/// Request framing and reply/event parsing.
pub mod message;
/// Background receive loop routing events and replies.
pub mod reader;
/// Connection state machine over one transport.
pub mod socket;
/// Transport providers for TCP ports and Unix socket files.
pub mod transport;

pub use controller::BaseController;
pub use error::{ControlError, Result};
pub use listener::{Dispatch, ListenerRegistry, State, StatusCallback, StatusChange};
pub use message::{
    ControlMessage, Divider, MAX_LINE_LEN, MAX_MESSAGE_LEN, ReplyLine, ReplyParser, Request,
};
pub use onionctl_config::Endpoint;
pub use reader::{EventHandler, EventReader};
pub use socket::ControlSocket;
pub use transport::{BoxTransport, Connector, TcpConnector, Transport, UnixConnector};
