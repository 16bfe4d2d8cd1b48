//! Error types for request execution

use crate::request::ApiResponse;

/// Errors surfaced by the request pipeline.
///
/// `Timeout` is kept apart from `OperationFailed` so callers can treat it as
/// "state unknown, check again later" instead of a definite failure.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing or contradictory settings (no credential method, empty scopes)
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    /// The identity platform or the service rejected our token
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Status outside the caller's acceptable set and not retryable
    #[error("unexpected status {status} from {url}: {body}")]
    UnexpectedStatus {
        status: u16,
        body: String,
        url: String,
    },

    /// A retryable condition outlived the retry budget. `last` holds the final
    /// response when the last attempt got one.
    #[error("retries exhausted after {attempts} attempts: {reason}")]
    RetryExhausted {
        attempts: u32,
        reason: String,
        last: Option<Box<ApiResponse>>,
    },

    /// A long-running operation reached the `Failed` phase
    #[error("operation failed: {message}")]
    OperationFailed { message: String },

    /// The service canceled a long-running operation
    #[error("operation was canceled by the service")]
    OperationCanceled,

    /// Deadline or maximum wait exceeded
    #[error("timed out: {0}")]
    Timeout(String),

    /// The caller canceled the operation context
    #[error("operation canceled")]
    Canceled,

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether the outcome is unknown rather than failed.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::UnexpectedStatus { status, .. } => Some(*status),
            Error::RetryExhausted { last, .. } => last.as_ref().map(|r| r.status),
            _ => None,
        }
    }
}

impl From<powerplatform_auth::Error> for Error {
    fn from(err: powerplatform_auth::Error) -> Self {
        use powerplatform_auth::Error as Auth;
        match err {
            Auth::Configuration(msg) => Error::Configuration(msg),
            Auth::InvalidCredential(msg) | Auth::Io(msg) => Error::InvalidCredential(msg),
            Auth::Authentication(msg) => Error::Authentication(msg),
            Auth::Http(msg) => Error::Http(msg),
        }
    }
}

/// Result alias for API operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_timeout_is_timeout() {
        assert!(Error::Timeout("max wait".into()).is_timeout());
        assert!(!Error::OperationFailed { message: "x".into() }.is_timeout());
        assert!(!Error::Canceled.is_timeout());
    }

    #[test]
    fn auth_errors_keep_their_kind() {
        let err: Error = powerplatform_auth::Error::Configuration("no method".into()).into();
        assert!(matches!(err, Error::Configuration(_)));
        let err: Error = powerplatform_auth::Error::Io("token file".into()).into();
        assert!(matches!(err, Error::InvalidCredential(_)));
    }

    #[test]
    fn unexpected_status_reports_status() {
        let err = Error::UnexpectedStatus {
            status: 404,
            body: "{}".into(),
            url: "https://api.bap.microsoft.com/x".into(),
        };
        assert_eq!(err.status(), Some(404));
        assert!(err.to_string().contains("404"));
    }
}
