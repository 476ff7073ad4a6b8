//! Error types for the session SDK.
//!
//! Module-specific error enum composing the taxonomy the session manager
//! exposes: fail-fast configuration errors, transport/HTTP failures carrying
//! the server body, named protocol-state errors (missing PKCE verifier),
//! synchronous mode-mismatch errors, per-tag authorization failures, and the
//! pending-operation timeout.

use serde_json::Value;
use thiserror::Error;

use crate::config::Mode;

/// Result alias used throughout the crate.
pub type IamResult<T> = Result<T, IamError>;

/// Error type for session manager operations.
#[derive(Debug, Error)]
pub enum IamError {
    /// Invalid or incomplete configuration. Raised before any network
    /// activity.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The server answered with a non-2xx status. `body` carries the parsed
    /// JSON error body when the server sent one, or the raw text otherwise,
    /// so callers can distinguish semantic failures by status and payload.
    #[error("HTTP {status}: {body}")]
    Http {
        /// Numeric response status.
        status: u16,
        /// Parsed JSON error body, or the raw text wrapped in a JSON string.
        body: Value,
    },

    /// The request never produced a response (connect error, timeout, bad
    /// URL, body read failure).
    #[error("Transport error: {0}")]
    Transport(String),

    /// An authorization code is present but no PKCE verifier exists in
    /// transient storage. This is a distinct condition from exchange failure:
    /// it indicates a stale or replayed callback (typically a page refresh),
    /// not a protocol or network fault.
    #[error(
        "Authorization code present but PKCE verifier missing from storage; \
         the callback page was likely refreshed or replayed"
    )]
    MissingVerifier,

    /// The requested operation does not exist in the active mode. This is a
    /// programmer error to be caught during integration, not recovered at
    /// runtime.
    #[error("{operation} is not available in {mode} mode")]
    NotAvailableInMode {
        /// Name of the unavailable operation.
        operation: &'static str,
        /// The mode the session manager is running in.
        mode: Mode,
    },

    /// The active session lacks the tag-scoped role required for an
    /// encryption operation. Raised before any enclave call; a single
    /// unauthorized tag rejects the whole batch.
    #[error("Session is missing the required role for tag \"{tag}\"")]
    TagUnauthorized {
        /// The data tag whose role check failed.
        tag: String,
    },

    /// A pending external operation received no matching callback within the
    /// timeout window.
    #[error("{operation} timed out waiting for the external callback")]
    Timeout {
        /// Name of the timed-out operation.
        operation: &'static str,
    },

    /// No session is established.
    #[error("Not authenticated (no active session)")]
    NotAuthenticated,

    /// A refresh was requested but the stored token set carries no refresh
    /// token.
    #[error("No refresh token available")]
    NoRefreshToken,

    /// The OIDC adapter collaborator reported a failure.
    #[error("Adapter error: {0}")]
    Adapter(String),

    /// The external-browser encryption bridge failed outside of a timeout.
    #[error("Encryption bridge error: {0}")]
    Bridge(String),

    /// JSON (de)serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<reqwest::Error> for IamError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for IamError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl IamError {
    /// Numeric HTTP status carried by this error, if any.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for error display and classification.
    use serde_json::json;

    use super::*;

    #[test]
    fn test_http_error_carries_status_and_body() {
        let err = IamError::Http { status: 403, body: json!({"error": "forbidden"}) };
        assert_eq!(err.status(), Some(403));
        assert!(err.to_string().contains("403"));
        assert!(err.to_string().contains("forbidden"));
    }

    #[test]
    fn test_missing_verifier_is_named_distinctly() {
        let err = IamError::MissingVerifier;
        let msg = err.to_string();
        assert!(msg.contains("verifier"));
        assert!(msg.contains("refreshed") || msg.contains("replayed"));
    }

    #[test]
    fn test_mode_mismatch_names_operation_and_mode() {
        let err = IamError::NotAvailableInMode { operation: "getToken", mode: Mode::Delegated };
        let msg = err.to_string();
        assert!(msg.contains("getToken"));
        assert!(msg.contains("delegated"));
    }

    #[test]
    fn test_tag_unauthorized_names_tag() {
        let err = IamError::TagUnauthorized { tag: "dob".to_string() };
        assert!(err.to_string().contains("dob"));
    }

    #[test]
    fn test_non_http_errors_have_no_status() {
        assert_eq!(IamError::NotAuthenticated.status(), None);
        assert_eq!(IamError::MissingVerifier.status(), None);
    }
}
