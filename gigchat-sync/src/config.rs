//! Session configuration.

use std::time::Duration;

/// Exponential reconnect backoff: `base * 2^attempt`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Delay before reconnect attempt number `attempt` (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 1_u32 << attempt.min(16);
        self.base_delay
            .saturating_mul(multiplier)
            .min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}

/// Everything a chat session needs to reach the marketplace backend.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket endpoint of the push-event relay
    pub socket_url: String,
    /// Base URL of the message gateway (no trailing slash)
    pub api_base_url: String,
    /// Local user
    pub username: String,
    /// Per-request timeout for gateway calls
    pub request_timeout: Duration,
    /// Backoff between reconnect attempts
    pub reconnect: ReconnectPolicy,
    /// Buffered inbound events per subscriber
    pub event_buffer: usize,
    /// Largest inline attachment accepted for a send
    pub max_attachment_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            socket_url: "ws://127.0.0.1:4000".to_string(),
            api_base_url: "http://127.0.0.1:4000/api/gateway/v1".to_string(),
            username: String::new(),
            request_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
            event_buffer: 256,
            max_attachment_bytes: 50 * 1024 * 1024,
        }
    }
}

impl SessionConfig {
    /// Defaults with the given local user.
    pub fn for_user(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            ..Self::default()
        }
    }
}
