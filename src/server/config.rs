//! Server configuration.

use std::fmt;
use std::time::Duration;

use crate::server::shutdown::ShutdownStrategy;

/// How long in-flight requests get to finish once shutdown begins.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// HTTP server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// The maximum number of concurrent connections.
    pub max_connections: usize,
    /// The socket read chunk size.
    pub read_buffer_size: usize,
    /// Largest request line plus headers accepted, in bytes.
    pub max_head_size: usize,
    /// Largest request body accepted, in bytes.
    pub max_body_size: usize,
    /// Grace period used by the default shutdown strategy.
    pub grace_period: Duration,
    /// Called by [`crate::HttpServer::stop`]. When `None`, the server waits
    /// for SIGINT/SIGTERM and then shuts down within `grace_period`.
    pub shutdown_strategy: Option<ShutdownStrategy>,
}

impl ServerConfig {
    /// Attach a shutdown strategy.
    pub fn with_shutdown_strategy(mut self, strategy: ShutdownStrategy) -> Self {
        self.shutdown_strategy = Some(strategy);
        self
    }

    /// Change the grace period of the default shutdown strategy.
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 1024,
            read_buffer_size: 8192,
            max_head_size: 64 * 1024,
            max_body_size: 1024 * 1024,
            grace_period: DEFAULT_GRACE_PERIOD,
            shutdown_strategy: None,
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("max_connections", &self.max_connections)
            .field("read_buffer_size", &self.read_buffer_size)
            .field("max_head_size", &self.max_head_size)
            .field("max_body_size", &self.max_body_size)
            .field("grace_period", &self.grace_period)
            .field("shutdown_strategy", &self.shutdown_strategy.as_ref().map(|_| ".."))
            .finish()
    }
}
