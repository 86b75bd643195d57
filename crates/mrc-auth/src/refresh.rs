//! Background-refreshed credential cache.
//!
//! A deployment with thousands of connections needs a token for every
//! connection it opens.  Exchanging one per connection turns a reconnect
//! storm into an IAM throttling storm, so [`RefreshingProvider`] keeps a
//! single token, refreshes it from one background task, and answers
//! connection requests from memory.
//!
//! The cache is opt-in: the pool works with any [`CredentialsProvider`],
//! and the plain [`IamTokenProvider`](crate::IamTokenProvider) exchanges a
//! fresh token per connection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info};

use crate::credentials::{Credential, CredentialsProvider};
use crate::error::AuthError;

/// Timing of the background refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshPolicy {
    /// Age after which the cached token is replaced.
    pub refresh_after: Duration,
    /// How often the background task checks the token's age.  Much shorter
    /// than `refresh_after` so a failed refresh is retried many times before
    /// the token expires.
    pub check_interval: Duration,
    /// Lifetime of a token; a cached token older than this is never served.
    pub lifetime: Duration,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            refresh_after: Duration::from_secs(300),
            check_interval: Duration::from_secs(10),
            lifetime: Duration::from_secs(3600),
        }
    }
}

struct Cache {
    credential: Option<Credential>,
    refreshed_at: Option<Instant>,
    last_error: Option<String>,
}

/// Serves a cached credential refreshed by a background task.
pub struct RefreshingProvider {
    cache: Arc<RwLock<Cache>>,
    policy: RefreshPolicy,
    task: JoinHandle<()>,
}

impl RefreshingProvider {
    /// Fetch a first credential from `inner`, then keep it fresh.
    ///
    /// Fails immediately when the first exchange fails, so a broken setup
    /// surfaces at startup rather than at the first connection.
    pub async fn start<P>(inner: P, policy: RefreshPolicy) -> Result<Self, AuthError>
    where
        P: CredentialsProvider + 'static,
    {
        if policy.check_interval.is_zero() {
            return Err(AuthError::Config("refresh check interval must be non-zero".into()));
        }
        if policy.refresh_after >= policy.lifetime {
            return Err(AuthError::Config(format!(
                "refresh interval ({}s) must be shorter than the token lifetime ({}s)",
                policy.refresh_after.as_secs(),
                policy.lifetime.as_secs()
            )));
        }

        info!("fetching initial IAM token");
        let first = inner.retrieve_credential().await?;
        let cache = Arc::new(RwLock::new(Cache {
            credential: Some(first),
            refreshed_at: Some(Instant::now()),
            last_error: None,
        }));

        let task = tokio::spawn(refresh_loop(Arc::new(inner), Arc::clone(&cache), policy));

        Ok(Self {
            cache,
            policy,
            task,
        })
    }

    /// Rendering of the most recent failed refresh, cleared on success.
    pub async fn last_error(&self) -> Option<String> {
        self.cache.read().await.last_error.clone()
    }

    /// Stop the background refresh.  Cached credentials are still served
    /// until they expire.
    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for RefreshingProvider {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn refresh_loop<P>(inner: Arc<P>, cache: Arc<RwLock<Cache>>, policy: RefreshPolicy)
where
    P: CredentialsProvider + 'static,
{
    let mut ticker = tokio::time::interval(policy.check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; the credential is already fresh.
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let due = cache
            .read()
            .await
            .refreshed_at
            .is_none_or(|at| at.elapsed() >= policy.refresh_after);
        if !due {
            continue;
        }

        info!("refreshing IAM token");
        match inner.retrieve_credential().await {
            Ok(credential) => {
                let mut guard = cache.write().await;
                guard.credential = Some(credential);
                guard.refreshed_at = Some(Instant::now());
                guard.last_error = None;
            }
            Err(e) => {
                error!(error = %e, "background IAM token refresh failed");
                cache.write().await.last_error = Some(e.to_string());
            }
        }
    }
}

#[async_trait]
impl CredentialsProvider for RefreshingProvider {
    async fn retrieve_credential(&self) -> Result<Credential, AuthError> {
        let guard = self.cache.read().await;
        match (&guard.credential, guard.refreshed_at) {
            (Some(credential), Some(at)) if at.elapsed() < self.policy.lifetime => {
                Ok(credential.clone())
            }
            _ => Err(AuthError::Expired {
                last_error: guard.last_error.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
        failing: AtomicBool,
    }

    #[async_trait]
    impl CredentialsProvider for Counting {
        async fn retrieve_credential(&self) -> Result<Credential, AuthError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.failing.load(Ordering::SeqCst) {
                return Err(AuthError::SourceToken {
                    status: None,
                    message: format!("exchange {n} refused"),
                });
            }
            Ok(Credential::with_token(format!("token-{n}")))
        }
    }

    fn policy() -> RefreshPolicy {
        RefreshPolicy {
            refresh_after: Duration::from_secs(300),
            check_interval: Duration::from_secs(10),
            lifetime: Duration::from_secs(600),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn serves_cached_token_without_calling_inner() {
        let inner = Arc::new(Counting::default());
        let provider = RefreshingProvider::start(Arc::clone(&inner), policy())
            .await
            .unwrap();

        for _ in 0..5 {
            let cred = provider.retrieve_credential().await.unwrap();
            assert_eq!(cred.password, "token-1");
        }
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refreshes_after_interval() {
        let inner = Arc::new(Counting::default());
        let provider = RefreshingProvider::start(Arc::clone(&inner), policy())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(305)).await;

        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            provider.retrieve_credential().await.unwrap().password,
            "token-2"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn expires_when_refresh_keeps_failing() {
        let inner = Arc::new(Counting::default());
        let provider = RefreshingProvider::start(Arc::clone(&inner), policy())
            .await
            .unwrap();
        inner.failing.store(true, Ordering::SeqCst);

        // Still inside the lifetime: the stale token is served and the
        // failure is recorded.
        tokio::time::sleep(Duration::from_secs(350)).await;
        assert_eq!(
            provider.retrieve_credential().await.unwrap().password,
            "token-1"
        );
        assert!(provider.last_error().await.unwrap().contains("refused"));

        tokio::time::sleep(Duration::from_secs(300)).await;
        match provider.retrieve_credential().await {
            Err(AuthError::Expired { last_error }) => {
                assert!(last_error.unwrap().contains("refused"));
            }
            other => panic!("expected Expired, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failure() {
        let inner = Arc::new(Counting::default());
        let provider = RefreshingProvider::start(Arc::clone(&inner), policy())
            .await
            .unwrap();
        inner.failing.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(320)).await;
        assert!(provider.last_error().await.is_some());

        inner.failing.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(provider.last_error().await.is_none());
        assert_ne!(
            provider.retrieve_credential().await.unwrap().password,
            "token-1"
        );
    }

    #[tokio::test]
    async fn start_fails_fast() {
        let inner = Counting::default();
        inner.failing.store(true, Ordering::SeqCst);
        let result = RefreshingProvider::start(inner, policy()).await;
        assert!(matches!(result, Err(AuthError::SourceToken { .. })));
    }

    #[tokio::test]
    async fn rejects_refresh_interval_not_shorter_than_lifetime() {
        let inner = Arc::new(Counting::default());
        let policy = RefreshPolicy {
            refresh_after: Duration::from_secs(7200),
            lifetime: Duration::from_secs(3600),
            ..policy()
        };
        let result = RefreshingProvider::start(Arc::clone(&inner), policy).await;
        assert!(matches!(result, Err(AuthError::Config(ref m)) if m.contains("lifetime")));
        // Rejected before any exchange.
        assert_eq!(inner.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn drop_stops_background_task() {
        let inner = Arc::new(Counting::default());
        let provider = RefreshingProvider::start(Arc::clone(&inner), policy())
            .await
            .unwrap();
        drop(provider);

        tokio::time::sleep(Duration::from_secs(1000)).await;
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }
}
