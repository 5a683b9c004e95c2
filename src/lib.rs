//! A minimal HTTP router.
//!
//! Handlers are registered against an exact method and path. A request is
//! dispatched to the handler whose (method, path) pair matches it literally;
//! anything else gets `404` with the body `404 NOT FOUND`. There are no path
//! parameters, wildcards or prefix matches.
//!
//! The server runs on tokio, one task per connection, and stops through a
//! pluggable [`ShutdownStrategy`]. By default it waits for SIGINT or SIGTERM,
//! stops accepting, and gives in-flight requests five seconds to finish
//! before closing their connections.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use microrouter::{HttpResponse, HttpServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), microrouter::ServerError> {
//!     let mut server = HttpServer::new(ServerConfig::default());
//!     server.get("/login", |_req| async {
//!         Ok(HttpResponse::ok().with_body_string("Login success"))
//!     });
//!
//!     let server = Arc::new(server);
//!     let serving = tokio::spawn({
//!         let server = server.clone();
//!         async move { server.start(":8080").await }
//!     });
//!
//!     // Returns once SIGINT/SIGTERM arrives and the server has drained
//!     server.stop().await?;
//!
//!     match serving.await {
//!         Ok(Err(e)) if !e.is_server_closed() => Err(e),
//!         _ => Ok(()),
//!     }
//! }
//! ```
//!
//! ## Parsing a request by hand
//!
//! ```
//! use microrouter::parse_request;
//!
//! let request = parse_request(b"GET /search?q=rust HTTP/1.1\r\nHost: example.com\r\n\r\n").unwrap();
//! assert_eq!(request.method, "GET");
//! assert_eq!(request.path, "/search");
//! assert_eq!(request.get_query_param("q").map(String::as_str), Some("rust"));
//! ```

pub mod parser;
pub mod server;

// Re-export commonly used items for convenience
pub use parser::{parse_request, Error as ParserError, HttpRequest, HttpVersion, Method};
pub use server::{
    Error as ServerError, HttpResponse, HttpServer, Immediate, ManualTrigger, OsSignals, RouteKey, Router,
    ServerConfig, ServerHandle, ServerState, ShutdownOutcome, ShutdownStrategy, ShutdownTrigger, StatusCode,
};
