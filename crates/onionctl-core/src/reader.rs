//! Event reader — routes pushed events away from request/response traffic.
//!
//! Replies and asynchronous events share one stream. The reader runs a
//! receive loop on its own task: `6xx` events go to a pluggable
//! [`EventHandler`], everything else is queued for whoever is waiting in
//! [`EventReader::msg`].
//!
//! ```text
//!             ┌──────────────┐  650 ...  ┌──────────────┐
//!  socket ───▶│ receive loop │──────────▶│ EventHandler │
//!             └──────┬───────┘           └──────────────┘
//!                    │ 250 ... / 5xx ...
//!             ┌──────▼───────┐
//!             │ reply queue  │──▶ msg()
//!             └──────────────┘
//! ```

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use onionctl_config::ReaderConfig;

use crate::controller::BaseController;
use crate::error::{ControlError, Result};
use crate::message::{ControlMessage, Request};

/// Receives asynchronous events.
///
/// Called on the receive loop's task; a slow handler delays delivery of
/// later replies and events.
pub trait EventHandler: Send + Sync + 'static {
    fn handle_event(&self, event: ControlMessage);
}

impl<F> EventHandler for F
where
    F: Fn(ControlMessage) + Send + Sync + 'static,
{
    fn handle_event(&self, event: ControlMessage) {
        self(event)
    }
}

/// Reply side of the reader, guarded as one unit.
struct Replies {
    queue: mpsc::Receiver<ControlMessage>,
    /// Replies still owed to `msg` calls that were cancelled after sending.
    orphaned: usize,
}

impl Replies {
    fn discard_queued(&mut self) {
        while let Ok(reply) = self.queue.try_recv() {
            self.discard(&reply);
        }
    }

    fn discard(&mut self, reply: &ControlMessage) {
        if self.orphaned > 0 {
            self.orphaned -= 1;
            debug!(
                status = reply.status_code(),
                "discarding reply to a cancelled request"
            );
        } else {
            warn!(
                status = reply.status_code(),
                "discarding reply that arrived with no request pending"
            );
        }
    }
}

/// Background receive loop plus the request/response exchange built on it.
///
/// A reader serves one connection. Start it after the controller is
/// connected; the loop ends when that connection does, and a reconnected
/// controller needs a new reader. Dropping the reader stops the loop.
pub struct EventReader {
    controller: Arc<BaseController>,
    /// Also serializes `msg` so replies pair with requests in order.
    replies: Mutex<Replies>,
    task: JoinHandle<()>,
}

impl EventReader {
    pub fn spawn(
        controller: Arc<BaseController>,
        handler: impl EventHandler,
        config: &ReaderConfig,
    ) -> Self {
        let (reply_tx, reply_rx) = mpsc::channel(config.reply_queue.max(1));
        let task = tokio::spawn(receive_loop(Arc::clone(&controller), handler, reply_tx));

        Self {
            controller,
            replies: Mutex::new(Replies {
                queue: reply_rx,
                orphaned: 0,
            }),
            task,
        }
    }

    /// Send a request and wait for its reply.
    ///
    /// Fails with [`ControlError::ConnectionClosed`] without writing anything
    /// once the receive loop has ended, and if the connection goes away
    /// before a reply arrives. Cancelling a call after its request went out
    /// is safe: the next call skips the orphaned reply.
    pub async fn msg(&self, request: impl Into<Request>) -> Result<ControlMessage> {
        let mut replies = self.replies.lock().await;
        if replies.queue.is_closed() || self.task.is_finished() {
            return Err(ControlError::ConnectionClosed);
        }
        replies.discard_queued();

        self.controller.send(request).await?;

        // Counted as orphaned until taken, so a cancelled wait leaves the
        // count right for the next caller.
        replies.orphaned += 1;
        loop {
            let reply = replies
                .queue
                .recv()
                .await
                .ok_or(ControlError::ConnectionClosed)?;
            if replies.orphaned == 1 {
                replies.orphaned = 0;
                return Ok(reply);
            }
            replies.discard(&reply);
        }
    }

    pub fn controller(&self) -> &Arc<BaseController> {
        &self.controller
    }

    /// Whether the receive loop is still running.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop the receive loop. The connection itself is left open.
    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for EventReader {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn receive_loop(
    controller: Arc<BaseController>,
    handler: impl EventHandler,
    replies: mpsc::Sender<ControlMessage>,
) {
    loop {
        match controller.recv().await {
            Ok(message) if message.is_event() => {
                let status = message.status_code().to_string();
                if catch_unwind(AssertUnwindSafe(|| handler.handle_event(message))).is_err() {
                    warn!(status = %status, "event handler panicked");
                }
            }
            Ok(message) => {
                if replies.send(message).await.is_err() {
                    break;
                }
            }
            Err(ControlError::Protocol(e)) => {
                warn!(error = %e, "skipping malformed control message");
            }
            Err(e) => {
                debug!(error = %e, "event reader stopping");
                break;
            }
        }
    }
}
