//! Common error types for GSLB components.

use thiserror::Error;

/// Common errors across GSLB components
#[derive(Debug, Error)]
pub enum GslbError {
    /// Unknown backend or agent key
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input/request
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Pre-shared service token did not match any configured token
    #[error("invalid service token")]
    InvalidToken,

    /// Presented certificate does not match the pinned fingerprint
    #[error("certificate fingerprint mismatch")]
    FingerprintMismatch,

    /// Certificate is outside its validity window
    #[error("certificate expired")]
    CertificateExpired,

    /// Pinned certificate has been revoked
    #[error("certificate revoked")]
    CertificateRevoked,

    /// Certificate could not be parsed
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    /// Generic authentication failure
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// KV store operation error
    #[error("Store error: {0}")]
    Store(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Gossip transport/decoding error
    #[error("Gossip error: {0}")]
    Gossip(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GslbError {
    /// Returns the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::InvalidInput(_) => 400,
            Self::InvalidToken => 401,
            Self::FingerprintMismatch => 401,
            Self::CertificateExpired => 401,
            Self::CertificateRevoked => 403,
            Self::InvalidCertificate(_) => 400,
            Self::AuthenticationFailed(_) => 401,
            Self::Store(_) => 503,
            Self::Config(_) => 500,
            Self::Gossip(_) => 503,
            Self::Internal(_) => 500,
        }
    }

    /// Returns true if this error should be retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Gossip(_))
    }

    /// Returns true for authentication outcomes, which are terminal per attempt
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            Self::InvalidToken
                | Self::FingerprintMismatch
                | Self::CertificateExpired
                | Self::CertificateRevoked
                | Self::InvalidCertificate(_)
                | Self::AuthenticationFailed(_)
        )
    }
}

impl From<serde_json::Error> for GslbError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("serialization: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(GslbError::NotFound("web:10.0.0.1:80".into()).status_code(), 404);
        assert_eq!(GslbError::InvalidToken.status_code(), 401);
        assert_eq!(GslbError::CertificateRevoked.status_code(), 403);
        assert_eq!(GslbError::Store("down".into()).status_code(), 503);
    }

    #[test]
    fn test_auth_errors_are_terminal() {
        let err = GslbError::FingerprintMismatch;
        assert!(err.is_auth_failure());
        assert!(!err.is_retryable());
        assert!(GslbError::Store("timeout".into()).is_retryable());
    }
}
