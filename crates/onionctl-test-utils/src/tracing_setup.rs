//! Tracing initialisation helpers for tests.
//!
//! Call [`init_test_tracing`] at the top of any test that wants the control
//! socket's log output captured by the test harness.
//!
//! The subscriber is initialised at most once per process, so it is safe to
//! call from every test function.

use tracing_subscriber::EnvFilter;

/// Initialise a tracing subscriber that writes to the test-harness writer
/// and respects the `RUST_LOG` environment variable, falling back to
/// `onionctl_core=debug`.
///
/// # Example
///
/// ```ignore
/// #[tokio::test]
/// async fn my_test() {
///     onionctl_test_utils::tracing_setup::init_test_tracing();
///     controller.connect().await.unwrap(); // "control connection established"
/// }
/// ```
pub fn init_test_tracing() {
    init_test_tracing_with("onionctl_core=debug");
}

/// Like [`init_test_tracing`] with an explicit fallback filter directive.
pub fn init_test_tracing_with(default_filter: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(true)
        .with_test_writer()
        .try_init();
}
