//! Status listener registry.
//!
//! Observers register a callback together with a [`Dispatch`] mode and are
//! told about every connection state transition of the owning socket.
//! Detection and reaction are decoupled: a listener that panics or blocks
//! never affects the transition that triggered it.

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

use tracing::{trace, warn};

use crate::controller::BaseController;

/// Connection state reported to status listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// First successful connection.
    Init,
    /// Connected again after having been closed.
    Reset,
    /// Connection closed, explicitly or because the transport failed.
    Closed,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Init => "init",
            Self::Reset => "reset",
            Self::Closed => "closed",
        })
    }
}

/// A single state transition as seen by a listener.
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub state: State,
    pub timestamp: SystemTime,
    /// The controller owning the socket, if it has one and it is still alive.
    pub controller: Option<Arc<BaseController>>,
}

/// Callback invoked on each transition. Identity is the `Arc` allocation,
/// so keep a clone of the `Arc` around to remove it later.
pub type StatusCallback = Arc<dyn Fn(&StatusChange) + Send + Sync>;

/// How a listener is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dispatch {
    /// On the task that detected the transition, before the transition
    /// call returns.
    Inline,
    /// On a blocking task of its own; the socket does not wait for it.
    #[default]
    Spawned,
}

struct Registration {
    callback: StatusCallback,
    dispatch: Dispatch,
}

/// Registered status listeners of one control socket.
#[derive(Default)]
pub struct ListenerRegistry {
    registrations: Mutex<Vec<Registration>>,
}

fn same_callback(a: &StatusCallback, b: &StatusCallback) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback. Registering a callback that is already present
    /// only updates its dispatch mode.
    pub fn add(&self, callback: StatusCallback, dispatch: Dispatch) {
        let mut registrations = self
            .registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match registrations
            .iter_mut()
            .find(|r| same_callback(&r.callback, &callback))
        {
            Some(existing) => existing.dispatch = dispatch,
            None => registrations.push(Registration { callback, dispatch }),
        }
    }

    /// Remove a callback. Returns `false` if it was not registered.
    pub fn remove(&self, callback: &StatusCallback) -> bool {
        let mut registrations = self
            .registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = registrations.len();
        registrations.retain(|r| !same_callback(&r.callback, callback));
        registrations.len() != before
    }

    pub fn len(&self) -> usize {
        self.registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver a transition to every registered listener.
    ///
    /// Listeners are snapshotted first and invoked without the registry lock
    /// held, so a callback may add or remove listeners.
    pub fn notify(&self, change: &StatusChange) {
        let snapshot: Vec<(StatusCallback, Dispatch)> = self
            .registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|r| (Arc::clone(&r.callback), r.dispatch))
            .collect();

        trace!(state = %change.state, listeners = snapshot.len(), "notifying status listeners");

        for (callback, dispatch) in snapshot {
            match dispatch {
                Dispatch::Inline => invoke_guarded(&callback, change),
                Dispatch::Spawned => spawn_listener(callback, change.clone()),
            }
        }
    }
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.len())
            .finish()
    }
}

fn invoke_guarded(callback: &StatusCallback, change: &StatusChange) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(change))) {
        warn!(
            state = %change.state,
            panic = panic_message(&*panic),
            "status listener panicked"
        );
    }
}

fn spawn_listener(callback: StatusCallback, change: StatusChange) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(move || invoke_guarded(&callback, &change));
        }
        Err(_) => {
            let spawned = std::thread::Builder::new()
                .name("status-listener".to_string())
                .spawn(move || invoke_guarded(&callback, &change));
            if let Err(e) = spawned {
                warn!(error = %e, "failed to spawn status listener thread");
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic>")
}
