//! IAM access-token exchange.
//!
//! Calls `generateAccessToken` on the IAM credentials service to mint a
//! short-lived token for the configured service account, and exposes the
//! result as a Redis [`Credential`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::IamConfig;
use crate::credentials::{Credential, CredentialsProvider};
use crate::error::AuthError;

/// A token minted by the IAM credentials service.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    /// Opaque bearer token.
    pub token: String,
    /// Expiry reported by the service, when it could be parsed.
    pub expire_time: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("expire_time", &self.expire_time)
            .finish()
    }
}

#[derive(Serialize)]
struct GenerateAccessTokenRequest<'a> {
    delegates: Vec<String>,
    scope: &'a [String],
    lifetime: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateAccessTokenResponse {
    access_token: Option<String>,
    expire_time: Option<String>,
}

#[derive(Deserialize)]
struct GoogleErrorEnvelope {
    error: GoogleError,
}

#[derive(Deserialize)]
struct GoogleError {
    message: String,
}

/// Exchanges a service-account identity for short-lived bearer tokens.
///
/// Every call to [`retrieve_credential`](CredentialsProvider::retrieve_credential)
/// performs one exchange; nothing is cached.  Wrap the provider in a
/// [`RefreshingProvider`](crate::RefreshingProvider) to serve many
/// connections from one token.
#[derive(Debug, Clone)]
pub struct IamTokenProvider {
    config: IamConfig,
    http: reqwest::Client,
}

impl IamTokenProvider {
    /// Validate `config` and build the HTTP client used for exchanges.
    pub fn new(config: IamConfig) -> Result<Self, AuthError> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| AuthError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { config, http })
    }

    /// The configuration this provider was built with.
    pub fn config(&self) -> &IamConfig {
        &self.config
    }

    /// URL of the `generateAccessToken` method for the configured account.
    fn method_url(&self) -> String {
        format!(
            "{}/v1/{}:generateAccessToken",
            self.config.endpoint.trim_end_matches('/'),
            self.config.resource_name()
        )
    }

    /// Mint a new access token.
    pub async fn generate_access_token(&self) -> Result<AccessToken, AuthError> {
        let caller = self.config.source.caller_token(&self.http).await?;

        let body = GenerateAccessTokenRequest {
            delegates: self
                .config
                .delegates
                .iter()
                .map(|d| crate::config::qualify_account(d))
                .collect(),
            scope: &self.config.scopes,
            lifetime: format!("{}s", self.config.lifetime.as_secs()),
        };

        debug!(
            account = %self.config.service_account,
            lifetime_secs = self.config.lifetime.as_secs(),
            "requesting access token"
        );

        let res = self
            .http
            .post(self.method_url())
            .bearer_auth(caller)
            .json(&body)
            .send()
            .await?;

        let status = res.status();
        if !status.is_success() {
            let text = res.text().await.unwrap_or_default();
            let message = serde_json::from_str::<GoogleErrorEnvelope>(&text)
                .map(|env| env.error.message)
                .unwrap_or(text);
            return Err(AuthError::Denied { status, message });
        }

        let parsed: GenerateAccessTokenResponse = serde_json::from_slice(&res.bytes().await?)
            .map_err(|e| AuthError::MalformedResponse(e.to_string()))?;

        let token = parsed
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AuthError::MalformedResponse("missing accessToken".into()))?;
        let expire_time = parsed
            .expire_time
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|t| t.with_timezone(&Utc));

        info!(
            account = %self.config.service_account,
            expire_time = ?expire_time,
            "access token issued"
        );

        Ok(AccessToken { token, expire_time })
    }
}

#[async_trait]
impl CredentialsProvider for IamTokenProvider {
    async fn retrieve_credential(&self) -> Result<Credential, AuthError> {
        let access = self.generate_access_token().await?;
        Ok(Credential::with_token(access.token))
    }
}
