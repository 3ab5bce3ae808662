//! Control socket — one logical connection to the daemon.
//!
//! Owns the transport, frames requests and replies, tracks liveness, and
//! tells status listeners about every transition.
//!
//! ## Locking
//!
//! ```text
//! lifecycle ──▶ writer ──▶ reader        (connect / close)
//!               writer                   (send)
//!                          reader        (recv)
//! ```
//!
//! `send` and `recv` use separate halves, so a receive loop blocked waiting
//! for the next message never holds up a request. Liveness lives in a
//! `watch` channel: flipping it to `false` wakes every task parked in `send`
//! or `recv`, which then drop their half and let `close` finish.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::SystemTime;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use onionctl_config::Endpoint;

use crate::controller::BaseController;
use crate::error::{ControlError, Result};
use crate::listener::{Dispatch, ListenerRegistry, State, StatusCallback, StatusChange};
use crate::message::{ControlMessage, MAX_LINE_LEN, ReplyParser, Request};
use crate::transport::{BoxTransport, Connector, connector_for};

/// Read side of a live connection. The partial line and parser state
/// survive a cancelled `recv`, so no bytes are lost.
struct Inbound {
    stream: BufReader<ReadHalf<BoxTransport>>,
    line: Vec<u8>,
    parser: ReplyParser,
    /// Dropping the rest of an overlong line up to its terminator.
    discarding: bool,
}

enum ReadFailure {
    /// The connection this read started on is already gone.
    Stale,
    Eof,
    Io(std::io::Error),
    Protocol(ControlError),
}

enum WriteFailure {
    Stale,
    Io(std::io::Error),
}

/// A connection to a tor control endpoint.
///
/// Created unconnected. [`connect`](Self::connect) opens the transport,
/// [`close`](Self::close) tears it down, and the socket can be connected
/// again afterwards.
pub struct ControlSocket {
    connector: Box<dyn Connector>,
    lifecycle: Mutex<()>,
    writer: Mutex<Option<WriteHalf<BoxTransport>>>,
    reader: Mutex<Option<Inbound>>,
    alive: watch::Sender<bool>,
    /// Number of successful connects so far.
    generation: AtomicU64,
    listeners: ListenerRegistry,
    owner: OnceLock<Weak<BaseController>>,
}

impl ControlSocket {
    /// Create an unconnected socket using the given transport provider.
    pub fn new(connector: impl Connector + 'static) -> Self {
        Self::with_connector(Box::new(connector))
    }

    /// Create an unconnected socket for an endpoint descriptor.
    ///
    /// Fails with [`ControlError::Connection`] if the endpoint can never be
    /// reached (non-IP address, port zero, empty path).
    pub fn from_endpoint(endpoint: &Endpoint) -> Result<Self> {
        endpoint
            .validate()
            .map_err(|e| ControlError::Connection {
                endpoint: endpoint.clone(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
            })?;
        Ok(Self::with_connector(connector_for(endpoint)))
    }

    fn with_connector(connector: Box<dyn Connector>) -> Self {
        Self {
            connector,
            lifecycle: Mutex::new(()),
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            alive: watch::Sender::new(false),
            generation: AtomicU64::new(0),
            listeners: ListenerRegistry::new(),
            owner: OnceLock::new(),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.connector.endpoint()
    }

    /// Whether the socket is currently connected. Never blocks.
    pub fn is_alive(&self) -> bool {
        *self.alive.borrow()
    }

    /// Open the transport.
    ///
    /// Listeners are told [`State::Init`] on the first connect and
    /// [`State::Reset`] on every later one.
    pub async fn connect(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_alive() {
            return Err(ControlError::AlreadyConnected(self.endpoint().clone()));
        }

        let transport = self
            .connector
            .connect()
            .await
            .map_err(|source| ControlError::Connection {
                endpoint: self.endpoint().clone(),
                source,
            })?;
        let (read, write) = tokio::io::split(transport);

        *self.writer.lock().await = Some(write);
        *self.reader.lock().await = Some(Inbound {
            stream: BufReader::new(read),
            line: Vec::new(),
            parser: ReplyParser::new(),
            discarding: false,
        });

        let previous = self.generation.fetch_add(1, Ordering::SeqCst);
        self.alive.send_replace(true);
        info!(endpoint = %self.endpoint(), "control connection established");

        self.notify(if previous == 0 {
            State::Init
        } else {
            State::Reset
        });
        Ok(())
    }

    /// Write one request.
    ///
    /// Writes are serialized: a request is fully written and flushed before
    /// the next one starts. A failed write closes the socket.
    pub async fn send(&self, request: impl Into<Request>) -> Result<()> {
        let request = request.into();
        if request.is_empty() {
            return Err(ControlError::InvalidMessage(
                "message must not be empty".to_string(),
            ));
        }

        let mut alive = self.alive.subscribe();
        if !*alive.borrow_and_update() {
            return Err(ControlError::ConnectionClosed);
        }
        let generation = self.generation.load(Ordering::SeqCst);
        let frame = request.to_wire();

        let written = tokio::select! {
            _ = wait_closed(&mut alive) => return Err(ControlError::ConnectionClosed),
            written = self.write_frame(generation, &frame) => written,
        };

        match written {
            Ok(()) => {
                debug!(bytes = frame.len(), "sent control request");
                Ok(())
            }
            Err(WriteFailure::Stale) => Err(ControlError::ConnectionClosed),
            Err(WriteFailure::Io(e)) => {
                self.close_generation(generation, &e).await;
                Err(ControlError::Transport(e))
            }
        }
    }

    async fn write_frame(&self, generation: u64, frame: &[u8]) -> Result<(), WriteFailure> {
        let mut writer = self.writer.lock().await;
        if self.generation.load(Ordering::SeqCst) != generation {
            return Err(WriteFailure::Stale);
        }
        let Some(writer) = writer.as_mut() else {
            return Err(WriteFailure::Stale);
        };
        writer.write_all(frame).await.map_err(WriteFailure::Io)?;
        writer.flush().await.map_err(WriteFailure::Io)
    }

    /// Wait for the next complete message, reply or event.
    ///
    /// Concurrent callers each receive a different message. Closing the
    /// socket from elsewhere releases every waiter with
    /// [`ControlError::ConnectionClosed`]. End of stream closes the socket.
    /// A malformed message is reported as [`ControlError::Protocol`] and
    /// leaves the connection up. Cancel safe.
    pub async fn recv(&self) -> Result<ControlMessage> {
        let mut alive = self.alive.subscribe();
        if !*alive.borrow_and_update() {
            return Err(ControlError::ConnectionClosed);
        }
        let generation = self.generation.load(Ordering::SeqCst);

        let read = tokio::select! {
            _ = wait_closed(&mut alive) => return Err(ControlError::ConnectionClosed),
            read = self.read_message(generation) => read,
        };

        match read {
            Ok(message) => {
                debug!(
                    status = message.status_code(),
                    bytes = message.raw().len(),
                    event = message.is_event(),
                    "received control message"
                );
                Ok(message)
            }
            Err(ReadFailure::Stale) => Err(ControlError::ConnectionClosed),
            Err(ReadFailure::Protocol(e)) => Err(e),
            Err(ReadFailure::Eof) => {
                let eof = std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "control connection closed by remote end",
                );
                self.close_generation(generation, &eof).await;
                Err(ControlError::ConnectionClosed)
            }
            Err(ReadFailure::Io(e)) => {
                self.close_generation(generation, &e).await;
                Err(ControlError::Transport(e))
            }
        }
    }

    async fn read_message(&self, generation: u64) -> Result<ControlMessage, ReadFailure> {
        let mut reader = self.reader.lock().await;
        if self.generation.load(Ordering::SeqCst) != generation {
            return Err(ReadFailure::Stale);
        }
        let Some(inbound) = reader.as_mut() else {
            return Err(ReadFailure::Stale);
        };

        loop {
            let budget = MAX_LINE_LEN.saturating_sub(inbound.line.len()) as u64;
            let n = (&mut inbound.stream)
                .take(budget)
                .read_until(b'\n', &mut inbound.line)
                .await
                .map_err(ReadFailure::Io)?;
            let terminated = inbound.line.ends_with(b"\n");

            if inbound.discarding {
                if n == 0 {
                    return Err(ReadFailure::Eof);
                }
                inbound.discarding = !terminated;
                inbound.line.clear();
                continue;
            }

            if !terminated {
                if inbound.line.len() < MAX_LINE_LEN {
                    return Err(ReadFailure::Eof);
                }
                inbound.line.clear();
                inbound.parser.reset();
                inbound.discarding = true;
                return Err(ReadFailure::Protocol(ControlError::Protocol(format!(
                    "line longer than {MAX_LINE_LEN} bytes"
                ))));
            }

            let parsed = inbound.parser.push_line(&inbound.line);
            inbound.line.clear();
            match parsed {
                Ok(Some(message)) => return Ok(message),
                Ok(None) => continue,
                Err(e) => return Err(ReadFailure::Protocol(e)),
            }
        }
    }

    /// Close the connection. Safe to call at any time; only an actual
    /// transition notifies listeners.
    pub async fn close(&self) {
        self.shutdown(None, None).await;
    }

    /// Close after an I/O failure, unless that connection was already
    /// replaced by a newer one.
    async fn close_generation(&self, generation: u64, cause: &std::io::Error) {
        self.shutdown(Some(generation), Some(cause)).await;
    }

    async fn shutdown(&self, generation: Option<u64>, cause: Option<&std::io::Error>) {
        let _lifecycle = self.lifecycle.lock().await;
        if !self.is_alive() {
            return;
        }
        if generation.is_some_and(|g| g != self.generation.load(Ordering::SeqCst)) {
            return;
        }

        // Wakes parked send/recv calls so the halves below become free.
        self.alive.send_replace(false);

        let writer = self.writer.lock().await.take();
        let reader = self.reader.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                debug!(error = %e, "error shutting down control transport");
            }
        }
        drop(reader);

        match cause {
            Some(cause) => warn!(
                endpoint = %self.endpoint(),
                error = %cause,
                "control connection lost"
            ),
            None => info!(endpoint = %self.endpoint(), "control connection closed"),
        }

        self.notify(State::Closed);
    }

    /// Register a status listener. See [`ListenerRegistry::add`].
    pub fn add_status_listener(&self, callback: StatusCallback, dispatch: Dispatch) {
        self.listeners.add(callback, dispatch);
    }

    /// Remove a status listener. Returns `false` if it was not registered.
    pub fn remove_status_listener(&self, callback: &StatusCallback) -> bool {
        self.listeners.remove(callback)
    }

    /// The controller that owns this socket, if any.
    pub fn owner(&self) -> Option<Arc<BaseController>> {
        self.owner.get().and_then(Weak::upgrade)
    }

    /// Record the owning controller. Only the first call has an effect.
    pub(crate) fn bind_owner(&self, owner: Weak<BaseController>) -> bool {
        self.owner.set(owner).is_ok()
    }

    fn notify(&self, state: State) {
        self.listeners.notify(&StatusChange {
            state,
            timestamp: SystemTime::now(),
            controller: self.owner(),
        });
    }
}

impl fmt::Debug for ControlSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlSocket")
            .field("endpoint", self.endpoint())
            .field("alive", &self.is_alive())
            .field("generation", &self.generation.load(Ordering::SeqCst))
            .field("listeners", &self.listeners)
            .finish()
    }
}

async fn wait_closed(alive: &mut watch::Receiver<bool>) {
    loop {
        if !*alive.borrow_and_update() {
            return;
        }
        if alive.changed().await.is_err() {
            return;
        }
    }
}
