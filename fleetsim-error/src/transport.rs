use thiserror::Error;

/// Errors raised by a device transport connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("invalid connection string: {0}")]
    InvalidConnectionString(String),

    #[error("not authorized: {0}")]
    Unauthorized(String),

    #[error("server unavailable: {0}")]
    ServerUnavailable(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("throttled (429): {0}")]
    Throttled(String),

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("operation timed out after {timeout_ms}ms: {operation}")]
    Timeout { timeout_ms: u64, operation: String },

    #[error("not connected")]
    NotConnected,

    #[error("subscription to {channel} failed: {reason}")]
    SubscriptionFailed { channel: String, reason: String },

    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Connect errors that indicate the device may have been moved to another endpoint.
    #[inline]
    pub fn indicates_failover(&self) -> bool {
        matches!(
            self,
            TransportError::Unauthorized(_)
                | TransportError::ServerUnavailable(_)
                | TransportError::Network(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failover_classes() {
        assert!(TransportError::Unauthorized("bad sas".into()).indicates_failover());
        assert!(TransportError::ServerUnavailable("".into()).indicates_failover());
        assert!(TransportError::Network("reset".into()).indicates_failover());
        assert!(!TransportError::NotConnected.indicates_failover());
        assert!(!TransportError::Timeout {
            timeout_ms: 10,
            operation: "connect".into()
        }
        .indicates_failover());
    }
}
