//! Error types for session configuration, transport construction and
//! document updates.
//!
//! None of these cross the transport's event-dispatch boundary: failures
//! that happen while handling a transport event are folded into
//! [`SessionState::Errored`](crate::session::SessionState::Errored) instead.

use thiserror::Error;

/// Malformed session parameters. Never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("room id must not be empty")]
    EmptyRoom,
    #[error("display name must not be empty")]
    EmptyName,
    #[error("at least one signaling endpoint is required")]
    NoSignaling,
    #[error("invalid signaling endpoint: {0}")]
    InvalidSignaling(String),
    #[error("max_conns must be greater than zero")]
    ZeroMaxConns,
    #[error("invalid ICE server url: {0}")]
    InvalidIceServer(String),
    #[error("retry max_attempts must be greater than zero")]
    ZeroMaxAttempts,
    #[error("invalid configuration: {0}")]
    Parse(String),
}

/// Failure to construct a transport instance.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Document(#[from] DocumentError),
}

/// Failure to decode or merge a CRDT update.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DocumentError {
    #[error("failed to decode update: {0}")]
    Decode(String),
    #[error("failed to apply update: {0}")]
    Apply(String),
    #[error("document is locked by another transaction: {0}")]
    Busy(String),
}

/// Errors returned synchronously by
/// [`SessionManager::enter`](crate::session::SessionManager::enter).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("no async runtime available to drive the session")]
    NoRuntime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        assert_eq!(ConfigError::EmptyName.to_string(), "display name must not be empty");
        assert_eq!(
            ConfigError::InvalidSignaling("http://x".into()).to_string(),
            "invalid signaling endpoint: http://x"
        );
    }

    #[test]
    fn test_transport_error_is_transparent_over_config() {
        let err: TransportError = ConfigError::ZeroMaxConns.into();
        assert_eq!(err.to_string(), "max_conns must be greater than zero");

        let err: SessionError = err.into();
        assert_eq!(err.to_string(), "max_conns must be greater than zero");
    }

    #[test]
    fn test_document_error_converts_to_transport_error() {
        let err: TransportError = DocumentError::Busy("write".into()).into();
        assert_eq!(err, TransportError::Document(DocumentError::Busy("write".into())));
        assert_eq!(err.to_string(), "document is locked by another transaction: write");
    }
}
