use thiserror::Error;

/// Failures of the register-then-poll identity provisioning protocol.
///
/// `RegistrationTimeout` is kept apart from transport level failures so callers
/// can distinguish a slow service from an unreachable one.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProvisionError {
    /// The master key was not valid base64 or the HMAC could not be keyed
    #[error("device key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("authorization token error: {0}")]
    Token(String),

    /// The service answered with a non-success status
    #[error("registration request rejected with status {status}: {reason}")]
    Request { status: u16, reason: String },

    #[error("network error: {0}")]
    Network(String),

    /// The service answered but the payload could not be understood
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("registration timed out after {attempts} poll attempts")]
    RegistrationTimeout { attempts: u32 },

    /// The operation finished without assigning the device to a hub
    #[error("device registration ended in status '{status}'")]
    Unassigned { status: String },

    #[error("registration cancelled")]
    Cancelled,
}

impl ProvisionError {
    /// Whether the service signalled throttling for this request.
    pub fn is_throttled(&self) -> bool {
        matches!(self, ProvisionError::Request { status: 429, .. })
    }
}
