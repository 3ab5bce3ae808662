//! Configuration builders for tests.
//!
//! Use [`TestConfigBuilder`] to create customised [`AppConfig`] values without
//! repeating TOML snippets across crate boundaries.

use std::path::PathBuf;

use onionctl_config::{AppConfig, Endpoint};

/// Fluent builder for [`AppConfig`] in tests.
///
/// # Example
///
/// ```ignore
/// let config = TestConfigBuilder::new()
///     .socket_file(daemon.socket_path().unwrap())
///     .reply_queue(4)
///     .build();
/// ```
pub struct TestConfigBuilder {
    config: AppConfig,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: AppConfig::default(),
        }
    }

    pub fn port(mut self, address: &str, port: u16) -> Self {
        self.config.control = Endpoint::port(address, port);
        self
    }

    pub fn socket_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.control = Endpoint::socket_file(path);
        self
    }

    pub fn endpoint(mut self, endpoint: Endpoint) -> Self {
        self.config.control = endpoint;
        self
    }

    pub fn reply_queue(mut self, n: usize) -> Self {
        self.config.reader.reply_queue = n;
        self
    }

    /// Build and validate.
    ///
    /// # Panics
    ///
    /// If the resulting configuration does not validate.
    pub fn build(self) -> AppConfig {
        self.config
            .validate()
            .expect("test config failed validation");
        self.config
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
