use thiserror::Error;

/// Errors raised while handling a token request.
///
/// Every component of the pipeline returns this type unchanged; only the
/// HTTP layer translates a variant into a status code.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Malformed input: missing fields, bad grant type, unparsable scope.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Credential verification failed.
    ///
    /// Deliberately carries no detail: unknown user, wrong password and a
    /// disabled account must be indistinguishable.
    #[error("authentication failed")]
    AuthenticationFailed,
    /// The request was cancelled (client went away or deadline passed)
    /// before a token was issued.
    #[error("request cancelled")]
    Cancelled,
    /// Store unreachable, signing failure and other server-side faults.
    #[error("internal error: {0}")]
    Internal(String),
}

impl AuthError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        AuthError::InvalidRequest(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        AuthError::Internal(message.into())
    }

    /// Short, stable name of the failure kind, suitable for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            AuthError::InvalidRequest(_) => "invalid_request",
            AuthError::AuthenticationFailed => "authentication_failed",
            AuthError::Cancelled => "cancelled",
            AuthError::Internal(_) => "internal",
        }
    }
}
