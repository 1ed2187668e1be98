//! Error types for the relay engine.

use thiserror::Error;

use crate::control::ControlError;

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Failure reported by the host network layer when it cannot redo the
/// forwarding decision for a rewritten packet.
///
/// `code` is the negative errno-style value returned by the network layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("reroute failed with code {code}")]
pub struct RerouteError {
    /// Underlying failure code.
    pub code: i32,
}

impl RerouteError {
    /// Creates a new reroute error.
    #[must_use]
    pub const fn new(code: i32) -> Self {
        Self { code }
    }
}

/// Errors that can occur in the relay engine.
#[derive(Debug, Error)]
pub enum RelayError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Packet cannot be interpreted as UDP over IPv4.
    #[error("packet error: {0}")]
    Packet(String),

    /// Forwarding decision could not be redone.
    #[error(transparent)]
    Reroute(#[from] RerouteError),

    /// Control command rejected.
    #[error("control error: {0}")]
    Control(#[from] ControlError),

    /// Start-up settings could not be loaded.
    #[error("settings error: {0}")]
    Settings(#[from] Box<figment::Error>),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl RelayError {
    /// Creates a new packet error.
    #[must_use]
    pub fn packet(msg: impl Into<String>) -> Self {
        Self::Packet(msg.into())
    }

    /// Returns true if this is a packet error.
    #[must_use]
    pub const fn is_packet(&self) -> bool {
        matches!(self, Self::Packet(_))
    }
}

impl From<figment::Error> for RelayError {
    fn from(err: figment::Error) -> Self {
        Self::Settings(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reroute_error_is_transparent() {
        let err: RelayError = RerouteError::new(-113).into();
        assert_eq!(err.to_string(), "reroute failed with code -113");
    }

    #[test]
    fn test_packet_error() {
        let err = RelayError::packet("not IPv4");
        assert!(err.is_packet());
        assert!(err.to_string().contains("not IPv4"));
    }
}
