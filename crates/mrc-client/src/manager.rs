//! Connection manager that authenticates every new connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mrc_auth::CredentialsProvider;
use redis::aio::{ConnectionLike, MultiplexedConnection};
use redis::{Client, Cmd, ConnectionInfo, ErrorKind, Pipeline, RedisFuture, RedisResult, Value};
use tracing::{debug, warn};

use crate::config::PoolConfig;
use crate::error::ClientError;
use crate::trust::TrustBundle;

/// Opens TLS connections to one endpoint, fetching a credential from the
/// provider for each connection it creates.
///
/// Commands sent over an established connection never touch the provider;
/// a connection keeps the identity it was opened with for its whole life.
pub struct AuthenticatedConnectionManager {
    base: ConnectionInfo,
    provider: Arc<dyn CredentialsProvider>,
    connect_timeout: Duration,
    authentications: Arc<AtomicU64>,
}

impl std::fmt::Debug for AuthenticatedConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticatedConnectionManager")
            .field("addr", &self.base.addr)
            .field("connect_timeout", &self.connect_timeout)
            .field("authentications", &self.authentications())
            .finish_non_exhaustive()
    }
}

impl AuthenticatedConnectionManager {
    /// Prepare TLS connection parameters for `config`'s endpoint.
    ///
    /// Nothing is opened here; the first connection is made by the pool.
    pub fn new(
        config: &PoolConfig,
        trust: &TrustBundle,
        provider: Arc<dyn CredentialsProvider>,
    ) -> Result<Self, ClientError> {
        let client = Client::build_with_tls(config.url(), trust.tls_certificates())
            .map_err(|e| ClientError::InvalidTrustBundle(e.to_string()))?;
        Ok(Self {
            base: client.get_connection_info().clone(),
            provider,
            connect_timeout: config.connection_timeout,
            authentications: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Number of credentials requested from the provider so far.
    pub fn authentications(&self) -> u64 {
        self.authentications.load(Ordering::SeqCst)
    }

    /// Shared handle on the authentication counter, readable after the
    /// manager has been moved into a pool.
    pub(crate) fn authentication_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.authentications)
    }
}

/// A pooled connection that remembers whether its transport has failed.
///
/// After a transport-level failure the connection is discarded on return to
/// the pool instead of being handed out again.
pub struct AuthenticatedConnection {
    inner: MultiplexedConnection,
    broken: bool,
}

impl AuthenticatedConnection {
    fn new(inner: MultiplexedConnection) -> Self {
        Self {
            inner,
            broken: false,
        }
    }

    /// Whether a command on this connection has failed at the transport level.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    fn observe<T>(&mut self, result: RedisResult<T>) -> RedisResult<T> {
        let failed = result.as_ref().is_err_and(|e| {
            e.is_io_error() || e.is_connection_dropped() || e.is_unrecoverable_error()
        });
        if failed {
            debug!("connection marked broken");
            self.broken = true;
        }
        result
    }
}

impl std::fmt::Debug for AuthenticatedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticatedConnection")
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}

impl ConnectionLike for AuthenticatedConnection {
    fn req_packed_command<'a>(&'a mut self, cmd: &'a Cmd) -> RedisFuture<'a, Value> {
        Box::pin(async move {
            let result = self.inner.req_packed_command(cmd).await;
            self.observe(result)
        })
    }

    fn req_packed_commands<'a>(
        &'a mut self,
        cmd: &'a Pipeline,
        offset: usize,
        count: usize,
    ) -> RedisFuture<'a, Vec<Value>> {
        Box::pin(async move {
            let result = self.inner.req_packed_commands(cmd, offset, count).await;
            self.observe(result)
        })
    }

    fn get_db(&self) -> i64 {
        self.inner.get_db()
    }
}

impl bb8::ManageConnection for AuthenticatedConnectionManager {
    type Connection = AuthenticatedConnection;
    type Error = ClientError;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let n = self.authentications.fetch_add(1, Ordering::SeqCst) + 1;
        let credential = self.provider.retrieve_credential().await?;

        let mut info = self.base.clone();
        info.redis.username = Some(credential.username);
        info.redis.password = Some(credential.password);
        let client = Client::open(info).map_err(ClientError::Connect)?;

        let conn = tokio::time::timeout(
            self.connect_timeout,
            client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| ClientError::ConnectTimeout(self.connect_timeout))?
        .map_err(|e| {
            warn!(error = %e, "failed to open authenticated connection");
            ClientError::Connect(e)
        })?;

        debug!(authentication = n, "opened authenticated connection");
        Ok(AuthenticatedConnection::new(conn))
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        let pong: String = redis::cmd("PING")
            .query_async(conn)
            .await
            .map_err(ClientError::Command)?;
        match pong.as_str() {
            "PONG" => Ok(()),
            _ => Err(ClientError::Command(
                (ErrorKind::ResponseError, "ping request").into(),
            )),
        }
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        conn.is_broken()
    }
}

/// Receives every connection failure the pool runs into.
///
/// `bb8` never hands a failed `connect` back to the caller waiting in
/// `get`; that caller only sees a timeout.  The sink logs each failure and
/// keeps the most recent one so the client can report the real cause.
#[derive(Debug, Clone, Default)]
pub(crate) struct FailureSink {
    last: Arc<Mutex<Option<(Instant, ClientError)>>>,
}

impl FailureSink {
    /// Take the most recent failure if it happened at or after `since`.
    pub(crate) fn take_since(&self, since: Instant) -> Option<ClientError> {
        let mut last = self.last.lock().ok()?;
        match last.take() {
            Some((at, error)) if at >= since => Some(error),
            _ => None,
        }
    }
}

impl bb8::ErrorSink<ClientError> for FailureSink {
    fn sink(&self, error: ClientError) {
        warn!(error = %error, retryable = error.is_retryable(), "pool connection error");
        if let Ok(mut last) = self.last.lock() {
            *last = Some((Instant::now(), error));
        }
    }

    fn boxed_clone(&self) -> Box<dyn bb8::ErrorSink<ClientError>> {
        Box::new(self.clone())
    }
}
