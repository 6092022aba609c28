//! End-to-end test support for the tunl tunnel service.
//!
//! [`TestServer`] runs a complete in-process server on ephemeral ports,
//! [`MockHttpService`] plays the local server behind the tunnel, and
//! [`TestClient`] speaks the control protocol directly so tests can drive
//! registration outcomes precisely.

pub mod harness;
pub mod mock_service;
pub mod recording;
pub mod test_client;

pub use harness::{TestServer, TestServerOptions};
pub use mock_service::{MockHttpService, RecordedRequest};
pub use recording::RecordingSink;
pub use test_client::TestClient;
