//! Protocol-wide constants shared by server and client.

use std::time::Duration;

/// How long the edge waits for a tunnel to answer a public request.
pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(30);

/// How long the client waits for the local server before giving up.
pub const LOCAL_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A control connection that has not registered within this window is
/// force-terminated.
pub const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum control messages per rolling second per connection.
pub const MAX_MESSAGES_PER_SECOND: u32 = 100;

/// Cap on a locally proxied response body (100 MiB).
pub const MAX_LOCAL_RESPONSE_BYTES: usize = 100 * 1024 * 1024;

/// Ping cadence on both sides of the control channel.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Client-side dead-peer threshold: no pong for this long kills the channel.
pub const PONG_DEADLINE: Duration = Duration::from_secs(90);

/// Reconnect backoff: first delay.
pub const RECONNECT_INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Reconnect backoff: growth factor per failed attempt.
pub const RECONNECT_FACTOR: f64 = 1.5;

/// Reconnect backoff: delay ceiling.
pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Cadence of the registry's idle-tunnel sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// A tunnel with no activity for this long is swept out of the registry.
pub const MAX_TUNNEL_IDLE: Duration = Duration::from_secs(60 * 60);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_are_coherent() {
        // Dead-peer window must span several heartbeats or every hiccup kills
        // the channel.
        assert!(PONG_DEADLINE >= 2 * HEARTBEAT_INTERVAL);
        assert!(RECONNECT_INITIAL_DELAY < RECONNECT_MAX_DELAY);
        assert!(RECONNECT_FACTOR > 1.0);
        assert!(MAX_TUNNEL_IDLE > SWEEP_INTERVAL);
        assert!(REGISTRATION_TIMEOUT < DEFAULT_DISPATCH_TIMEOUT);
    }
}
