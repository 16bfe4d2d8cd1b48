//! Error types for the service clients

/// Errors from the typed service clients.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Api(#[from] powerplatform_api::Error),

    /// The environment exists but has no Dataverse database attached
    #[error("environment {0} has no Dataverse instance")]
    NoDataverse(String),

    /// Input rejected before any request was sent
    #[error("validation error: {0}")]
    Validation(String),

    /// A lookup that should have found something came back empty
    #[error("{0} not found")]
    NotFound(String),
}

impl Error {
    /// HTTP status carried by the underlying API error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Api(e) => e.status(),
            _ => None,
        }
    }

    /// Whether the response body of a failed call mentions `code`. A call
    /// that ran out of retries is judged by its last response.
    pub fn has_service_code(&self, code: &str) -> bool {
        match self {
            Error::Api(powerplatform_api::Error::UnexpectedStatus { body, .. }) => {
                body.contains(code)
            }
            Error::Api(powerplatform_api::Error::RetryExhausted {
                last: Some(response),
                ..
            }) => response.text().contains(code),
            _ => false,
        }
    }
}

/// Result alias for service operations.
pub type Result<T> = std::result::Result<T, Error>;
