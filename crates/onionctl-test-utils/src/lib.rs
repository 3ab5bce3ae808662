#![deny(unsafe_code)]

//! Shared test utilities for the onionctl workspace.
//!
//! Provides a scriptable fake control daemon, config builders, log capture,
//! and tracing helpers so that individual crate tests stay concise and
//! consistent.
//!
//! Add this crate as a `[dev-dependency]` in any workspace member:
//!
//! ```toml
//! [dev-dependencies]
//! onionctl-test-utils = { workspace = true }
//! ```

pub mod config;
pub mod fake_daemon;
pub mod log_capture;
pub mod tracing_setup;

pub use fake_daemon::{FakeDaemon, closed_port};
pub use log_capture::LogCapture;
