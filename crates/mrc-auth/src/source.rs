//! Caller identity for the IAM exchange.
//!
//! Impersonating a service account is itself an authenticated call: the
//! caller presents its own bearer token.  On Compute Engine / GKE that token
//! comes from the instance metadata server; elsewhere a pre-minted token can
//! be supplied directly.

use serde::Deserialize;
use tracing::debug;

use crate::error::AuthError;

/// Metadata server endpoint for the instance's default service account.
pub const DEFAULT_METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Where the caller's own token comes from.
#[derive(Clone, PartialEq, Eq)]
pub enum SourceCredentials {
    /// Fetch the token from an instance metadata server.
    MetadataServer {
        /// Full URL of the metadata token endpoint.
        url: String,
    },
    /// Use a token minted out of band (e.g. `gcloud auth print-access-token`).
    Static(String),
}

impl Default for SourceCredentials {
    fn default() -> Self {
        Self::MetadataServer {
            url: DEFAULT_METADATA_TOKEN_URL.to_string(),
        }
    }
}

impl std::fmt::Debug for SourceCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MetadataServer { url } => {
                f.debug_struct("MetadataServer").field("url", url).finish()
            }
            Self::Static(_) => f.write_str("Static(<redacted>)"),
        }
    }
}

#[derive(Deserialize)]
struct MetadataToken {
    access_token: Option<String>,
}

impl SourceCredentials {
    /// Obtain the caller's bearer token.
    pub async fn caller_token(&self, http: &reqwest::Client) -> Result<String, AuthError> {
        match self {
            Self::Static(token) if token.is_empty() => {
                Err(AuthError::Config("static caller token is empty".into()))
            }
            Self::Static(token) => Ok(token.clone()),
            Self::MetadataServer { url } => {
                debug!(url = %url, "fetching caller token from metadata server");
                let res = http
                    .get(url)
                    .header("Metadata-Flavor", "Google")
                    .send()
                    .await
                    .map_err(|e| AuthError::SourceToken {
                        status: None,
                        message: e.to_string(),
                    })?;

                let status = res.status();
                if !status.is_success() {
                    let text = res.text().await.unwrap_or_default();
                    return Err(AuthError::SourceToken {
                        status: Some(status),
                        message: format!("metadata server returned {status}: {text}"),
                    });
                }

                let body: MetadataToken = res
                    .json()
                    .await
                    .map_err(|e| AuthError::MalformedResponse(e.to_string()))?;
                body.access_token
                    .filter(|t| !t.is_empty())
                    .ok_or_else(|| {
                        AuthError::MalformedResponse("metadata response has no access_token".into())
                    })
            }
        }
    }
}
