//! HTTP server: route table, connection handling and lifecycle.

mod response;
mod config;
mod error;
mod handler;
mod router;
mod connection;
mod shutdown;
mod http_server;
mod tests;

// Re-export public items
pub use response::{HttpResponse, StatusCode, NOT_FOUND_BODY};
pub use config::{ServerConfig, DEFAULT_GRACE_PERIOD};
pub use error::Error;
pub use handler::{HandlerFn, HandlerFuture};
pub use router::{RouteKey, Router};
pub use shutdown::{
    Immediate, ManualTrigger, OsSignals, ServerHandle, ServerState, ShutdownOutcome, ShutdownStrategy,
    ShutdownTrigger, StrategyFuture, TriggerFuture,
};
pub use http_server::HttpServer;
