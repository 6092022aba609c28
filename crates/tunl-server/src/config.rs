//! Server configuration from the environment.
//!
//! `PORT` (public edge), `CONTROL_PORT` (websocket control plane),
//! `BASE_DOMAIN`, and `HTTPS` (affects only the advertised tunnel URLs;
//! TLS itself terminates in front of this process).

use std::env;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub http_port: u16,
    pub control_port: u16,
    pub base_domain: String,
    pub https: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 3000,
            control_port: 9000,
            base_domain: "localhost:3000".to_string(),
            https: false,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            http_port: env_u16("PORT").unwrap_or(defaults.http_port),
            control_port: env_u16("CONTROL_PORT").unwrap_or(defaults.control_port),
            base_domain: env::var("BASE_DOMAIN").unwrap_or(defaults.base_domain),
            https: env::var("HTTPS")
                .map(|v| parse_bool(&v))
                .unwrap_or(defaults.https),
        }
    }
}

fn env_u16(name: &str) -> Option<u16> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

fn parse_bool(v: &str) -> bool {
    matches!(
        v.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = ServerConfig::default();
        assert_eq!(config.http_port, 3000);
        assert_eq!(config.control_port, 9000);
        assert_eq!(config.base_domain, "localhost:3000");
        assert!(!config.https);
    }

    #[test]
    fn bool_parsing_accepts_common_spellings() {
        assert!(parse_bool("1"));
        assert!(parse_bool("true"));
        assert!(parse_bool("TRUE"));
        assert!(parse_bool(" yes "));
        assert!(!parse_bool("0"));
        assert!(!parse_bool("false"));
        assert!(!parse_bool(""));
    }
}
