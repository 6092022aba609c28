//! Subdomain validation and generation.
//!
//! Format and reservation checks run before any authentication so a bad
//! label never costs a user lookup.

use once_cell::sync::Lazy;
use rand::{thread_rng, Rng};
use regex::Regex;
use thiserror::Error;

/// DNS-label shape: alphanumeric edges, hyphens inside.
static LABEL_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?i)[a-z0-9]([a-z0-9-]*[a-z0-9])?$").unwrap());

/// Labels the service never allocates, to avoid colliding with
/// infrastructure hostnames.
const RESERVED: &[&str] = &[
    "www", "api", "admin", "dashboard", "app", "mail", "ftp", "localhost", "webmail", "smtp",
    "pop", "ns", "dns", "support", "help", "secure", "ssl", "vpn",
];

const MIN_LEN: usize = 3;
const MAX_LEN: usize = 63;

/// Length of generated labels, in hex characters.
const GENERATED_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum SubdomainError {
    #[error("Invalid subdomain: {0}")]
    Invalid(String),
}

/// Whether `s` is an acceptable tunnel subdomain.
pub fn is_valid_subdomain(s: &str) -> bool {
    if s.len() < MIN_LEN || s.len() > MAX_LEN {
        return false;
    }
    if !LABEL_REGEX.is_match(s) {
        return false;
    }
    let lower = s.to_ascii_lowercase();
    !RESERVED.contains(&lower.as_str())
}

/// Validate `s`, normalizing to lowercase on success.
pub fn validate(s: &str) -> Result<String, SubdomainError> {
    if is_valid_subdomain(s) {
        Ok(s.to_ascii_lowercase())
    } else {
        Err(SubdomainError::Invalid(
            s.chars().take(80).collect::<String>(),
        ))
    }
}

/// Generate a random lowercase hex label of fixed length.
pub fn generate_subdomain() -> String {
    let n: u32 = thread_rng().gen();
    format!("{n:0width$x}", width = GENERATED_LEN)
}
