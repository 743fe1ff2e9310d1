//! Error types for the client core.
//!
//! Every failure is classified into one of a closed set of kinds. The
//! user-visible message for a kind is a stable string independent of the
//! underlying cause; the full diagnostic detail is logged instead so that
//! sensitive values never reach the screen.

use thiserror::Error;

/// Primary error type for client operations.
#[derive(Error, Debug)]
pub enum XferError {
    /// Password or bucket-key format failed pre-flight validation.
    #[error("Invalid input: {0}")]
    InputInvalid(String),

    /// OPAQUE protocol failure or AEAD auth failure on a wrapped key.
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// The download target is file-password-protected and none was supplied.
    #[error("File password required")]
    PasswordRequired,

    /// An auth route was invoked with no live session.
    #[error("Not authenticated: {0}")]
    NotAuthenticated(String),

    /// A digest or HMAC mismatch during download verification.
    #[error("Integrity check failed: {0}")]
    Integrity(String),

    /// Network failure, non-2xx status, or malformed response.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Local filesystem or secret-service failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Cooperative cancellation observed.
    #[error("Operation cancelled")]
    Cancelled,

    /// Cryptographic primitive or invariant violation. Fatal.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl XferError {
    /// Stable user-facing message for this error kind.
    ///
    /// The strings here are intentionally independent of the underlying
    /// cause. Diagnostic context lives in the log file only.
    pub fn user_message(&self) -> &'static str {
        match self {
            XferError::InputInvalid(_) => "Invalid bucket key or password format.",
            XferError::AuthFailed(_) => "Authentication failed. Check your password.",
            XferError::PasswordRequired => "This file needs its file password.",
            XferError::NotAuthenticated(_) => "Not signed in. Open a bucket first.",
            XferError::Integrity(_) => "Failed to verify file. Try again!",
            XferError::Transport(_) => "Failed to reach the server. Try again!",
            XferError::Storage(_) => "Local storage operation failed.",
            XferError::Cancelled => "Cancelled.",
            XferError::Internal(_) => "Something went wrong. Check the logs.",
        }
    }
}

impl From<std::io::Error> for XferError {
    fn from(err: std::io::Error) -> Self {
        XferError::Storage(err.to_string())
    }
}

impl From<reqwest::Error> for XferError {
    fn from(err: reqwest::Error) -> Self {
        XferError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for XferError {
    fn from(err: serde_json::Error) -> Self {
        XferError::Transport(format!("malformed payload: {}", err))
    }
}

/// Convenience type alias for Results using XferError.
pub type Result<T> = std::result::Result<T, XferError>;
