//! The write-then-read round trip.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use backoff::ExponentialBackoffBuilder;
use mrc_auth::{CredentialsProvider, IamConfig, IamTokenProvider, RefreshPolicy, RefreshingProvider};
use mrc_client::{ClientError, MrcClient, PoolConfig, TrustBundle};
use tracing::{info, warn};

/// Retry policy for token exchange and connection failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first one; zero disables retrying.
    pub retries: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(10),
        }
    }
}

/// Everything the driver needs, assembled from flags and environment.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub iam: IamConfig,
    pub pool: PoolConfig,
    pub ca_file: PathBuf,
    pub key: String,
    pub value: String,
    /// Extra generated keys to write and read back after the main round trip.
    pub verify_keys: usize,
    /// Serve connections from a background-refreshed token instead of
    /// exchanging one per connection.
    pub refresh: Option<RefreshPolicy>,
    pub retry: RetryPolicy,
}

/// What a successful run observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub key: String,
    /// `None` when the key was gone by the time it was read.
    pub value: Option<String>,
    /// `(matched, written)` for the extra keys, when any were requested.
    pub verified: Option<(usize, usize)>,
    /// Credentials the pool requested, one per connection opened.
    pub authentications: u64,
}

/// Load trust material, build the pool, `SET` then `GET` the key.
///
/// A missing or malformed trust bundle and invalid configuration fail
/// immediately.  Token exchange, connection and I/O failures are retried
/// with exponential backoff up to `retry.retries` times.
pub async fn run(config: DriverConfig) -> Result<Report> {
    let trust = TrustBundle::load(&config.ca_file)
        .with_context(|| format!("loading trust bundle {}", config.ca_file.display()))?;

    let provider = build_provider(&config).await?;
    let client = MrcClient::new(&config.pool, &trust, provider)?;
    info!(host = %config.pool.host, port = config.pool.port, "pool ready");

    let value = with_retry(config.retry, "round trip", || {
        round_trip(&client, &config.key, &config.value)
    })
    .await?;

    let verified = if config.verify_keys > 0 {
        Some(verify_keys(&client, &config).await?)
    } else {
        None
    };

    Ok(Report {
        key: config.key,
        value,
        verified,
        authentications: client.authentications(),
    })
}

async fn build_provider(config: &DriverConfig) -> Result<Arc<dyn CredentialsProvider>> {
    let iam = IamTokenProvider::new(config.iam.clone()).context("invalid IAM configuration")?;
    info!(account = %config.iam.service_account, "token provider configured");

    let Some(policy) = config.refresh else {
        return Ok(Arc::new(iam));
    };

    let refreshing = with_retry(config.retry, "initial token", || {
        let inner = iam.clone();
        async move {
            RefreshingProvider::start(inner, policy)
                .await
                .map_err(ClientError::from)
        }
    })
    .await?;
    Ok(Arc::new(refreshing))
}

async fn round_trip(
    client: &MrcClient,
    key: &str,
    value: &str,
) -> Result<Option<String>, ClientError> {
    client.set(key, value).await?;
    client.get(key).await
}

async fn verify_keys(client: &MrcClient, config: &DriverConfig) -> Result<(usize, usize)> {
    let mut matched = 0;
    for i in 0..config.verify_keys {
        let key = format!("{}:{i}", config.key);
        let expected = format!("{}-{i}", config.value);
        client.set(&key, &expected).await?;
        if client.get(&key).await?.as_deref() == Some(expected.as_str()) {
            matched += 1;
        } else {
            warn!(key, "read back a different value");
        }
    }
    Ok((matched, config.verify_keys))
}

/// Run `op`, retrying failures that [`ClientError::is_retryable`] accepts.
async fn with_retry<T, F, Fut>(policy: RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ClientError>>,
{
    let backoff = ExponentialBackoffBuilder::new()
        .with_initial_interval(policy.initial_interval)
        .with_max_interval(policy.max_interval)
        .with_multiplier(2.0)
        .with_max_elapsed_time(None)
        .build();

    let mut attempt = 0u32;
    backoff::future::retry_notify(
        backoff,
        || {
            attempt += 1;
            let fut = op();
            let last = attempt > policy.retries;
            async move {
                fut.await.map_err(|e| {
                    if e.is_retryable() && !last {
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
            }
        },
        |e: ClientError, wait: Duration| {
            warn!(error = %e, retry_in = ?wait, "{what} failed, retrying");
        },
    )
    .await
    .map_err(|e| anyhow!(e).context(format!("{what} failed")))
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};

    use mock_iam::{MockIam, MockState};
    use mock_redis::{FakeRedis, Pki};
    use mrc_auth::{AuthError, SourceCredentials};

    use super::*;

    const ACCOUNT: &str = "redis-user@test-project.iam.gserviceaccount.com";

    /// Mock IAM, a TLS Redis fake accepting its tokens, and a driver
    /// configuration pointing at both.
    struct Stack {
        iam: MockIam,
        server: FakeRedis,
        config: DriverConfig,
    }

    impl Stack {
        async fn start(iam_state: MockState) -> Self {
            let iam = MockIam::spawn(iam_state).await.unwrap();
            let pki = Pki::generate("driver").unwrap();
            let server = FakeRedis::spawn(&pki, |user, pass| {
                user == "default" && pass.starts_with("ya29.mock-")
            })
            .await
            .unwrap();

            let ca_file = std::env::temp_dir().join(format!(
                "mrc-cli-{}-{}.pem",
                std::process::id(),
                server.port()
            ));
            std::fs::write(&ca_file, &pki.ca_pem).unwrap();

            let config = DriverConfig {
                iam: IamConfig {
                    service_account: ACCOUNT.into(),
                    endpoint: iam.base_url(),
                    source: SourceCredentials::Static("caller-token".into()),
                    ..IamConfig::default()
                },
                pool: PoolConfig {
                    connection_timeout: Duration::from_millis(500),
                    ..server.pool_config()
                },
                ca_file,
                key: "key".into(),
                value: "value".into(),
                verify_keys: 0,
                refresh: None,
                retry: quick(),
            };
            Self {
                iam,
                server,
                config,
            }
        }
    }

    impl Drop for Stack {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.config.ca_file);
        }
    }

    fn quick() -> RetryPolicy {
        RetryPolicy {
            retries: 2,
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn retries_transient_failures_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = with_retry(quick(), "op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(ClientError::PoolTimeout)
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn gives_up_after_configured_retries() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(quick(), "op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ClientError::PoolTimeout) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(quick(), "op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ClientError::Credential(AuthError::Config("no scope".into()))) }
        })
        .await;
        let err = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(format!("{err:#}").contains("no scope"));
    }

    #[tokio::test]
    async fn missing_trust_bundle_is_fatal() {
        let config = DriverConfig {
            iam: IamConfig::default(),
            pool: PoolConfig::default(),
            ca_file: PathBuf::from("/nonexistent/server-ca.pem"),
            key: "key".into(),
            value: "value".into(),
            verify_keys: 0,
            refresh: None,
            retry: quick(),
        };
        let err = run(config).await.unwrap_err();
        assert!(format!("{err:#}").contains("trust bundle"));
    }

    #[tokio::test]
    async fn writes_then_reads_back_the_value() {
        let stack = Stack::start(MockState::default()).await;

        let report = run(stack.config.clone()).await.unwrap();
        assert_eq!(report.key, "key");
        assert_eq!(report.value.as_deref(), Some("value"));
        assert_eq!(report.verified, None);
        assert_eq!(report.authentications, 1);
        assert_eq!(stack.iam.issued(), 1);
        assert_eq!(stack.server.auths().len(), 1);

        // A second run against the same instance reads the same value.
        let again = run(stack.config.clone()).await.unwrap();
        assert_eq!(again.value, report.value);
    }

    #[tokio::test]
    async fn verify_keys_reports_every_match() {
        let mut stack = Stack::start(MockState::default()).await;
        stack.config.verify_keys = 5;

        let report = run(stack.config.clone()).await.unwrap();
        assert_eq!(report.verified, Some((5, 5)));
        // Serial commands reuse one pooled connection.
        assert_eq!(report.authentications, 1);
    }

    #[tokio::test]
    async fn exchange_failure_is_retried_through_the_pool() {
        let stack = Stack::start(MockState {
            fail_first: 1,
            ..MockState::default()
        })
        .await;

        let report = run(stack.config.clone()).await.unwrap();
        assert_eq!(report.value.as_deref(), Some("value"));
        // One connection attempt refused by IAM, one that got a token.
        assert_eq!(report.authentications, 2);
        assert_eq!(stack.iam.issued(), 1);
        assert_eq!(stack.server.auths().len(), 1);
    }

    #[tokio::test]
    async fn refreshing_provider_retries_the_initial_token() {
        let mut stack = Stack::start(MockState {
            fail_first: 1,
            ..MockState::default()
        })
        .await;
        stack.config.refresh = Some(RefreshPolicy::default());
        stack.config.verify_keys = 3;

        let report = run(stack.config.clone()).await.unwrap();
        assert_eq!(report.value.as_deref(), Some("value"));
        assert_eq!(report.verified, Some((3, 3)));
        assert_eq!(stack.iam.issued(), 1);
        let tokens: HashSet<_> = stack.server.auths().into_iter().map(|(_, pass)| pass).collect();
        assert_eq!(tokens.len(), 1);
    }

    #[tokio::test]
    async fn refresh_interval_beyond_lifetime_is_rejected() {
        let mut stack = Stack::start(MockState::default()).await;
        stack.config.refresh = Some(RefreshPolicy {
            refresh_after: Duration::from_secs(7200),
            lifetime: Duration::from_secs(3600),
            ..RefreshPolicy::default()
        });

        let err = run(stack.config.clone()).await.unwrap_err();
        assert!(format!("{err:#}").contains("lifetime"), "{err:#}");
        assert_eq!(stack.iam.issued(), 0);
        assert_eq!(stack.server.accepted(), 0);
    }

    #[tokio::test]
    async fn denied_account_fails_without_retrying() {
        let mut denied = HashSet::new();
        denied.insert(ACCOUNT.to_string());
        let stack = Stack::start(MockState {
            denied_accounts: denied,
            ..MockState::default()
        })
        .await;

        let err = run(stack.config.clone()).await.unwrap_err();
        assert!(format!("{err:#}").contains("denied"), "{err:#}");
        assert_eq!(stack.iam.issued(), 0);
        assert_eq!(stack.server.accepted(), 0);
    }
}
