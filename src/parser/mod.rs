//! HTTP/1.x request parsing.
//!
//! The server reads a request head off the socket, hands it to
//! [`parse_head`], then reads `Content-Length` bytes of body.
//! [`parse_request`] does both in one go for buffers that already hold a
//! complete request.

mod request;
mod method;
mod version;
mod error;

// Re-export public items
pub use request::HttpRequest;
pub use method::Method;
pub use version::HttpVersion;
pub use error::Error;

pub use request::{find_head_end, parse_head, parse_request};
