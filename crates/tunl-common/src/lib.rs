//! Shared building blocks for the tunl server and client.

pub mod id;
pub mod limits;
pub mod subdomain;

pub use id::generate_request_id;
pub use subdomain::{generate_subdomain, is_valid_subdomain, SubdomainError};
