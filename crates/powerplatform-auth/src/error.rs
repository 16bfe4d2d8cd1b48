//! Error types for credential resolution and token acquisition

/// Errors from credential operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No usable credential method, or a required setting is missing
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Malformed certificate, secret, or assertion material
    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    /// The identity provider rejected the credential
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("I/O error: {0}")]
    Io(String),
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
