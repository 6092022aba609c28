//! tunl client library.
//!
//! The binary is a thin CLI over [`connector::ConnectionManager`], which
//! keeps one control channel to the tunnel server alive (reconnecting with
//! backoff) and proxies forwarded requests to the local HTTP server via
//! [`forwarder::Forwarder`].

pub mod connector;
pub mod forwarder;

pub use connector::{Backoff, ClientConfig, ConnectionManager};
pub use forwarder::Forwarder;
