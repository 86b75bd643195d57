//! Pooled client handle.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use bb8::{Pool, PooledConnection};
use mrc_auth::CredentialsProvider;
use tracing::{debug, info};

use crate::config::PoolConfig;
use crate::error::ClientError;
use crate::manager::{AuthenticatedConnectionManager, FailureSink};
use crate::trust::TrustBundle;

/// Connection counts reported by [`MrcClient::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Open connections, idle or checked out.
    pub connections: u32,
    /// Open connections waiting in the pool.
    pub idle_connections: u32,
}

/// A pool of IAM-authenticated TLS connections to one instance.
///
/// Cloning is cheap; clones share the same pool.
#[derive(Clone)]
pub struct MrcClient {
    pool: Pool<AuthenticatedConnectionManager>,
    authentications: Arc<AtomicU64>,
    failures: FailureSink,
}

impl std::fmt::Debug for MrcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MrcClient")
            .field("state", &self.state())
            .field("authentications", &self.authentications())
            .finish()
    }
}

impl MrcClient {
    /// Build the pool.
    ///
    /// The provider is not called and no connection is opened here unless
    /// `min_idle` is set, in which case warm-up runs in the background.
    /// Must be called from within a Tokio runtime.
    pub fn new(
        config: &PoolConfig,
        trust: &TrustBundle,
        provider: Arc<dyn CredentialsProvider>,
    ) -> Result<Self, ClientError> {
        config.validate()?;
        let manager = AuthenticatedConnectionManager::new(config, trust, provider)?;
        let authentications = manager.authentication_counter();
        let failures = FailureSink::default();

        let pool = Pool::builder()
            .max_size(config.max_size)
            .min_idle(config.min_idle)
            .idle_timeout(config.idle_timeout)
            .max_lifetime(config.max_lifetime)
            .connection_timeout(config.connection_timeout)
            .test_on_check_out(config.test_on_check_out)
            .retry_connection(false)
            .error_sink(Box::new(failures.clone()))
            .build_unchecked(manager);

        info!(
            host = %config.host,
            port = config.port,
            max_size = config.max_size,
            "connection pool configured"
        );

        Ok(Self {
            pool,
            authentications,
            failures,
        })
    }

    /// Check out a connection, opening and authenticating one if none is
    /// idle.
    ///
    /// When no connection becomes available in time, the error is the last
    /// connection failure seen while waiting (credential, TLS or `AUTH`), or
    /// [`ClientError::PoolTimeout`] if every connection was simply busy.
    pub async fn get_connection(
        &self,
    ) -> Result<PooledConnection<'_, AuthenticatedConnectionManager>, ClientError> {
        let started = Instant::now();
        self.pool.get().await.map_err(|e| match e {
            bb8::RunError::TimedOut => self
                .failures
                .take_since(started)
                .unwrap_or(ClientError::PoolTimeout),
            other => other.into(),
        })
    }

    /// `SET key value` without expiry.
    pub async fn set(&self, key: &str, value: &str) -> Result<(), ClientError> {
        let mut conn = self.get_connection().await?;
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async::<()>(&mut *conn)
            .await
            .map_err(ClientError::Command)?;
        debug!(key, "SET");
        Ok(())
    }

    /// `GET key`; `None` when the key does not exist.
    pub async fn get(&self, key: &str) -> Result<Option<String>, ClientError> {
        let mut conn = self.get_connection().await?;
        let value = redis::cmd("GET")
            .arg(key)
            .query_async::<Option<String>>(&mut *conn)
            .await
            .map_err(ClientError::Command)?;
        debug!(key, found = value.is_some(), "GET");
        Ok(value)
    }

    /// Round-trip a `PING`.
    pub async fn ping(&self) -> Result<(), ClientError> {
        let mut conn = self.get_connection().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut *conn)
            .await
            .map_err(ClientError::Command)?;
        Ok(())
    }

    /// Current connection counts.
    pub fn state(&self) -> PoolStatus {
        let state = self.pool.state();
        PoolStatus {
            connections: state.connections,
            idle_connections: state.idle_connections,
        }
    }

    /// Number of credentials the pool has requested from the provider,
    /// one per connection it tried to open.
    pub fn authentications(&self) -> u64 {
        self.authentications.load(Ordering::SeqCst)
    }
}
