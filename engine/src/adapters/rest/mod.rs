//! REST API Driving Adapter
//!
//! Exposes the supervisor through a JSON HTTP API served on a Unix socket

pub mod handlers;
pub mod router;
pub mod unix_socket;

pub use router::build_router;
pub use unix_socket::serve_on_unix_socket;
