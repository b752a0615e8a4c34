//! Session configuration.
//!
//! Everything in [`SessionConfig`] except [`RetryPolicy`] is handed to the
//! transport untouched; this crate only checks that it is well formed.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::error::ConfigError;

/// Public signaling servers used when nothing else is configured.
pub const DEFAULT_SIGNALING: [&str; 3] = [
    "wss://y-webrtc-signaling-production.up.railway.app",
    "wss://y-webrtc-signaling.onrender.com",
    "ws://localhost:4444",
];

/// Public STUN servers used when nothing else is configured.
pub const DEFAULT_ICE_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:global.stun.twilio.com:3478",
];

const BASE_MAX_CONNS: usize = 20;
const MAX_CONNS_JITTER: u128 = 15;

/// A single NAT traversal server entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: String,
}

impl IceServer {
    pub fn new(urls: impl Into<String>) -> Self {
        Self { urls: urls.into() }
    }
}

/// Linear reconnect backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay unit; attempt `n` waits `n * base_delay`.
    #[serde(with = "duration_ms", rename = "base_delay_ms")]
    pub base_delay: Duration,
    /// Connection attempts allowed per `enter()`, the initial connection
    /// included. It counts connection errors, not reconnects: the error
    /// that reaches this count is terminal, so the default of 3 schedules
    /// at most two reconnects. See [`RetryPolicy::max_reconnects`].
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_attempts: u32) -> Self {
        Self { base_delay, max_attempts }
    }

    /// Reconnects scheduled at most per `enter()`.
    pub fn max_reconnects(&self) -> u32 {
        self.max_attempts.saturating_sub(1)
    }

    /// Backoff before reconnect attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_attempts: 3,
        }
    }
}

/// Transport and retry configuration for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Discovery/signaling endpoints (`ws://` or `wss://`).
    pub signaling: Vec<String>,
    /// Upper bound on simultaneous peer connections.
    pub max_conns: usize,
    /// Skip same-origin broadcast channel peers.
    pub filter_bc_conns: bool,
    pub ice_servers: Vec<IceServer>,
    pub retry: RetryPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            signaling: DEFAULT_SIGNALING.iter().map(|s| s.to_string()).collect(),
            max_conns: BASE_MAX_CONNS + (Uuid::new_v4().as_u128() % MAX_CONNS_JITTER) as usize,
            filter_bc_conns: true,
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(|s| IceServer::new(*s)).collect(),
            retry: RetryPolicy::default(),
        }
    }
}

impl SessionConfig {
    /// Parse a JSON document. Missing keys take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every field is well formed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.signaling.is_empty() {
            return Err(ConfigError::NoSignaling);
        }
        for endpoint in &self.signaling {
            let host = endpoint
                .strip_prefix("wss://")
                .or_else(|| endpoint.strip_prefix("ws://"));
            match host {
                Some(host) if !host.is_empty() && !host.starts_with('/') => {}
                _ => return Err(ConfigError::InvalidSignaling(endpoint.clone())),
            }
        }
        if self.max_conns == 0 {
            return Err(ConfigError::ZeroMaxConns);
        }
        for server in &self.ice_servers {
            let valid = ["stun:", "turn:", "turns:"]
                .iter()
                .any(|scheme| server.urls.len() > scheme.len() && server.urls.starts_with(scheme));
            if !valid {
                return Err(ConfigError::InvalidIceServer(server.urls.clone()));
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ZeroMaxAttempts);
        }
        Ok(())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(crate) fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SessionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.signaling.len(), 3);
        assert_eq!(config.ice_servers.len(), 2);
        assert!(config.filter_bc_conns);
        assert!((20..35).contains(&config.max_conns));
    }

    #[test]
    fn test_retry_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_attempts, 3);
    }

    #[test]
    fn test_default_policy_allows_two_reconnects() {
        assert_eq!(RetryPolicy::default().max_reconnects(), 2);
        assert_eq!(RetryPolicy::new(Duration::ZERO, 1).max_reconnects(), 0);
        assert_eq!(RetryPolicy::new(Duration::ZERO, 0).max_reconnects(), 0);
    }

    #[test]
    fn test_linear_backoff() {
        let policy = RetryPolicy::new(Duration::from_millis(250), 5);
        assert_eq!(policy.delay_for(1), Duration::from_millis(250));
        assert_eq!(policy.delay_for(2), Duration::from_millis(500));
        assert_eq!(policy.delay_for(4), Duration::from_millis(1000));
    }

    #[test]
    fn test_rejects_bad_signaling() {
        let mut config = SessionConfig::default();
        config.signaling = vec!["http://example.com".into()];
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidSignaling("http://example.com".into()))
        );

        config.signaling = vec!["wss://".into()];
        assert!(matches!(config.validate(), Err(ConfigError::InvalidSignaling(_))));

        config.signaling.clear();
        assert_eq!(config.validate(), Err(ConfigError::NoSignaling));
    }

    #[test]
    fn test_rejects_zero_limits() {
        let mut config = SessionConfig::default();
        config.max_conns = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroMaxConns));

        let mut config = SessionConfig::default();
        config.retry.max_attempts = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroMaxAttempts));
    }

    #[test]
    fn test_rejects_bad_ice_server() {
        let mut config = SessionConfig::default();
        config.ice_servers.push(IceServer::new("stun.example.com:3478"));
        assert!(matches!(config.validate(), Err(ConfigError::InvalidIceServer(_))));
    }

    #[test]
    fn test_from_json_partial() {
        let config = SessionConfig::from_json(
            r#"{ "signaling": ["ws://127.0.0.1:4444"], "max_conns": 4,
                 "retry": { "base_delay_ms": 50 } }"#,
        )
        .unwrap();
        assert_eq!(config.signaling, vec!["ws://127.0.0.1:4444".to_string()]);
        assert_eq!(config.max_conns, 4);
        assert_eq!(config.retry.base_delay, Duration::from_millis(50));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.ice_servers.len(), 2);
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(matches!(SessionConfig::from_json("{ nope"), Err(ConfigError::Parse(_))));
        assert_eq!(
            SessionConfig::from_json(r#"{ "max_conns": 0 }"#),
            Err(ConfigError::ZeroMaxConns)
        );
    }
}
