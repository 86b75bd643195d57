//! Error types for credential retrieval.
//!
//! [`AuthError`] covers every way an identity exchange can fail.  Callers
//! use [`AuthError::is_retryable`] to decide whether a failed exchange is
//! worth another attempt or points at a misconfiguration.

use reqwest::StatusCode;

/// Errors that can occur while obtaining a credential.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The provider was configured with invalid parameters.
    #[error("invalid credentials configuration: {0}")]
    Config(String),

    /// The HTTP call to the identity service failed at the transport level.
    #[error("failed to reach identity service: {0}")]
    Transport(#[source] reqwest::Error),

    /// The identity service did not answer within the configured timeout.
    #[error("identity service timed out: {0}")]
    Timeout(#[source] reqwest::Error),

    /// The identity service refused the exchange.
    #[error("identity service denied the request ({status}): {message}")]
    Denied {
        /// HTTP status returned by the identity service.
        status: StatusCode,
        /// Error message extracted from the response body.
        message: String,
    },

    /// The identity service answered with an unexpected payload.
    #[error("malformed identity service response: {0}")]
    MalformedResponse(String),

    /// The caller token used to authorise the exchange could not be obtained.
    #[error("failed to obtain caller token: {message}")]
    SourceToken {
        /// HTTP status of the metadata server's answer; `None` when it was
        /// never reached.
        status: Option<StatusCode>,
        message: String,
    },

    /// The cached token expired and no refresh has succeeded since.
    #[error("cached token expired, last refresh error: {}", last_error.as_deref().unwrap_or("none"))]
    Expired {
        /// Rendering of the most recent background refresh failure.
        last_error: Option<String>,
    },

    /// JSON (de)serialisation error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<reqwest::Error> for AuthError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(e)
        } else if e.is_decode() {
            Self::MalformedResponse(e.to_string())
        } else {
            Self::Transport(e)
        }
    }
}

impl AuthError {
    /// Whether a later attempt at the same exchange could succeed.
    ///
    /// Throttling (`429`) and server-side failures (`5xx`) are transient;
    /// any other denial means the identity or scope is wrong.  The same holds
    /// for the metadata server: an unreachable server is worth retrying, a
    /// `403` or `404` from it is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout(_) | Self::Expired { .. } => true,
            Self::SourceToken { status, .. } => status.is_none_or(transient_status),
            Self::Denied { status, .. } => transient_status(*status),
            Self::Config(_) | Self::MalformedResponse(_) | Self::Serialization(_) => false,
        }
    }
}

fn transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}
