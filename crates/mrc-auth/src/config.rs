//! Token provider configuration.
//!
//! [`IamConfig`] names the service account to impersonate, the scopes and
//! lifetime to request, and where the IAM credentials service lives.  It is
//! built once (from defaults, flags or environment variables) and handed to
//! [`IamTokenProvider::new`](crate::IamTokenProvider::new).

use std::time::Duration;

use crate::error::AuthError;
use crate::source::SourceCredentials;

/// Public IAM credentials endpoint.
pub const DEFAULT_IAM_ENDPOINT: &str = "https://iamcredentials.googleapis.com";

/// Scope granting access to every Google Cloud API the account may use.
pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// Placeholder identity used when no account is configured.
pub const DEFAULT_SERVICE_ACCOUNT: &str =
    "example-service-account@example-project.iam.gserviceaccount.com";

/// Longest lifetime the IAM credentials service will grant.
pub const MAX_TOKEN_LIFETIME: Duration = Duration::from_secs(12 * 3600);

const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

/// Parameters of the identity exchange.
#[derive(Debug, Clone)]
pub struct IamConfig {
    /// Service account email (or full `projects/…` resource name) to
    /// impersonate.
    pub service_account: String,
    /// OAuth scopes requested for the minted token.
    pub scopes: Vec<String>,
    /// Delegation chain, outermost first.  Usually empty.
    pub delegates: Vec<String>,
    /// Requested token lifetime.
    pub lifetime: Duration,
    /// Base URL of the IAM credentials service.
    pub endpoint: String,
    /// Identity of the caller making the exchange.
    pub source: SourceCredentials,
    /// Upper bound on a whole exchange request.
    pub request_timeout: Duration,
    /// Upper bound on establishing the HTTP connection.
    pub connect_timeout: Duration,
}

impl Default for IamConfig {
    fn default() -> Self {
        Self {
            service_account: DEFAULT_SERVICE_ACCOUNT.to_string(),
            scopes: vec![CLOUD_PLATFORM_SCOPE.to_string()],
            delegates: Vec::new(),
            lifetime: DEFAULT_TOKEN_LIFETIME,
            endpoint: DEFAULT_IAM_ENDPOINT.to_string(),
            source: SourceCredentials::default(),
            request_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl IamConfig {
    /// Build the configuration from environment variables.
    ///
    /// | Variable                    | Default                                   | Description                      |
    /// |-----------------------------|-------------------------------------------|----------------------------------|
    /// | `MRC_SERVICE_ACCOUNT`       | placeholder account                       | Account to impersonate           |
    /// | `MRC_IAM_ENDPOINT`          | `https://iamcredentials.googleapis.com`   | IAM credentials base URL         |
    /// | `MRC_TOKEN_LIFETIME_SECS`   | `3600`                                    | Requested token lifetime         |
    /// | `GOOGLE_OAUTH_ACCESS_TOKEN` | unset                                     | Static caller token              |
    /// | `MRC_METADATA_URL`          | GCE metadata token endpoint               | Caller token source when no static token |
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(account) = std::env::var("MRC_SERVICE_ACCOUNT") {
            config.service_account = account;
        }
        if let Ok(endpoint) = std::env::var("MRC_IAM_ENDPOINT") {
            config.endpoint = endpoint;
        }
        if let Some(secs) = std::env::var("MRC_TOKEN_LIFETIME_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.lifetime = Duration::from_secs(secs);
        }

        config.source = match std::env::var("GOOGLE_OAUTH_ACCESS_TOKEN") {
            Ok(token) if !token.is_empty() => SourceCredentials::Static(token),
            _ => match std::env::var("MRC_METADATA_URL") {
                Ok(url) => SourceCredentials::MetadataServer { url },
                Err(_) => SourceCredentials::default(),
            },
        };

        config
    }

    /// Full IAM resource name of the impersonated account.
    ///
    /// A bare email is expanded to `projects/-/serviceAccounts/{email}`; a
    /// value already in resource form is returned unchanged.
    pub fn resource_name(&self) -> String {
        qualify_account(&self.service_account)
    }

    /// Check the invariants the IAM service would otherwise reject remotely.
    pub fn validate(&self) -> Result<(), AuthError> {
        if self.service_account.trim().is_empty() {
            return Err(AuthError::Config("service account must not be empty".into()));
        }
        if self.scopes.is_empty() || self.scopes.iter().any(|s| s.trim().is_empty()) {
            return Err(AuthError::Config("at least one non-empty scope is required".into()));
        }
        if self.lifetime < Duration::from_secs(1) || self.lifetime > MAX_TOKEN_LIFETIME {
            return Err(AuthError::Config(format!(
                "token lifetime must be between 1s and {}s, got {}s",
                MAX_TOKEN_LIFETIME.as_secs(),
                self.lifetime.as_secs()
            )));
        }
        if self.endpoint.trim().is_empty() {
            return Err(AuthError::Config("IAM endpoint must not be empty".into()));
        }
        Ok(())
    }
}

/// Expand a service account email into its IAM resource name.
pub(crate) fn qualify_account(account: &str) -> String {
    if account.starts_with("projects/") {
        account.to_string()
    } else {
        format!("projects/-/serviceAccounts/{account}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Sets a variable for the life of the guard.
    struct EnvVar(&'static str);

    impl EnvVar {
        fn set(key: &'static str, value: &str) -> Self {
            // SAFETY: this is the only test in the crate that touches these
            // variables.
            unsafe { std::env::set_var(key, value) };
            Self(key)
        }
    }

    impl Drop for EnvVar {
        fn drop(&mut self) {
            // SAFETY: as in `set`.
            unsafe { std::env::remove_var(self.0) };
        }
    }

    #[test]
    fn defaults_match_cloud_platform_hour() {
        let cfg = IamConfig::default();
        assert_eq!(cfg.scopes, vec![CLOUD_PLATFORM_SCOPE.to_string()]);
        assert_eq!(cfg.lifetime, Duration::from_secs(3600));
        assert_eq!(cfg.endpoint, DEFAULT_IAM_ENDPOINT);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn email_is_qualified() {
        let cfg = IamConfig {
            service_account: "sa@proj.iam.gserviceaccount.com".into(),
            ..IamConfig::default()
        };
        assert_eq!(
            cfg.resource_name(),
            "projects/-/serviceAccounts/sa@proj.iam.gserviceaccount.com"
        );
    }

    #[test]
    fn resource_name_is_kept() {
        let name = "projects/-/serviceAccounts/sa@proj.iam.gserviceaccount.com";
        assert_eq!(qualify_account(name), name);
    }

    #[test]
    fn rejects_empty_account() {
        let cfg = IamConfig {
            service_account: "  ".into(),
            ..IamConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(AuthError::Config(_))));
    }

    #[test]
    fn rejects_missing_scopes() {
        let cfg = IamConfig {
            scopes: Vec::new(),
            ..IamConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(AuthError::Config(_))));
    }

    #[test]
    fn rejects_out_of_range_lifetime() {
        let too_long = IamConfig {
            lifetime: MAX_TOKEN_LIFETIME + Duration::from_secs(1),
            ..IamConfig::default()
        };
        assert!(too_long.validate().is_err());

        let zero = IamConfig {
            lifetime: Duration::ZERO,
            ..IamConfig::default()
        };
        assert!(zero.validate().is_err());
    }

    #[test]
    fn from_env_overrides_defaults() {
        let _vars = [
            EnvVar::set("MRC_SERVICE_ACCOUNT", "env-user@p.iam.gserviceaccount.com"),
            EnvVar::set("MRC_IAM_ENDPOINT", "http://127.0.0.1:4000"),
            EnvVar::set("MRC_TOKEN_LIFETIME_SECS", "900"),
            EnvVar::set("MRC_METADATA_URL", "http://127.0.0.1:4000/token"),
        ];
        let cfg = IamConfig::from_env();
        assert_eq!(cfg.service_account, "env-user@p.iam.gserviceaccount.com");
        assert_eq!(cfg.endpoint, "http://127.0.0.1:4000");
        assert_eq!(cfg.lifetime, Duration::from_secs(900));
        assert_eq!(
            cfg.source,
            SourceCredentials::MetadataServer {
                url: "http://127.0.0.1:4000/token".into()
            }
        );

        // A static caller token takes precedence over the metadata server.
        let _token = EnvVar::set("GOOGLE_OAUTH_ACCESS_TOKEN", "ya29.caller");
        assert_eq!(
            IamConfig::from_env().source,
            SourceCredentials::Static("ya29.caller".into())
        );
    }
}
