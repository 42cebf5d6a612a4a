//! Error types for Pulsedesk
//!
//! The token/session core distinguishes five terminal outcomes on the
//! credential path. Token-validation failures are never retried; store
//! failures only surface on read-critical paths (login, access verification).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// No credential was supplied at all.
    #[error("No credential supplied")]
    Missing,

    /// Malformed, unsigned, or wrong-type token.
    #[error("Invalid token")]
    Invalid,

    /// Well-formed and correctly signed, but past its expiry.
    #[error("Token has expired")]
    Expired,

    /// Valid token for a deactivated account.
    #[error("Account is deactivated")]
    Forbidden,

    /// Unknown identifier or wrong password at login.
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// Rejected input, e.g. a too-weak replacement password.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Session store unreachable on a read-critical path.
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Stable machine-readable code for logs and wire envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Missing => "TOKEN_MISSING",
            CoreError::Invalid => "TOKEN_INVALID",
            CoreError::Expired => "TOKEN_EXPIRED",
            CoreError::Forbidden => "FORBIDDEN",
            CoreError::InvalidCredentials => "INVALID_CREDENTIALS",
            CoreError::Validation(_) => "VALIDATION_ERROR",
            CoreError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            CoreError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}
