//! Client error types.
//!
//! [`ClientError`] separates startup misconfiguration (trust bundle, pool
//! settings) from runtime failures (credentials, connections, commands) so
//! the caller can decide what is worth retrying.

use std::path::PathBuf;
use std::time::Duration;

use mrc_auth::AuthError;
use redis::RedisError;

/// Error type for all client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The trust bundle file could not be read.
    #[error("failed to read trust bundle {}: {source}", path.display())]
    TrustBundleRead {
        /// Path that was read.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// The trust bundle contains no usable certificate.
    #[error("invalid trust bundle: {0}")]
    InvalidTrustBundle(String),

    /// Invalid pool or endpoint configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The credentials provider failed to produce a credential.
    #[error("failed to obtain credential: {0}")]
    Credential(#[from] AuthError),

    /// Opening or authenticating a connection failed (TLS handshake, `AUTH`).
    #[error("failed to connect to Redis: {0}")]
    Connect(#[source] RedisError),

    /// Opening a connection did not finish within the connect timeout.
    #[error("connecting to Redis timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// A command failed on an established connection.
    #[error("Redis command failed: {0}")]
    Command(#[source] RedisError),

    /// No connection became available within the pool's connection timeout.
    #[error("timed out waiting for a pooled connection")]
    PoolTimeout,
}

impl From<bb8::RunError<ClientError>> for ClientError {
    fn from(e: bb8::RunError<ClientError>) -> Self {
        match e {
            bb8::RunError::User(inner) => inner,
            bb8::RunError::TimedOut => Self::PoolTimeout,
        }
    }
}

impl ClientError {
    /// Whether the failed operation may succeed if attempted again.
    ///
    /// Trust and configuration errors are permanent.  Connection failures
    /// are retried because a new attempt also fetches a new credential.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TrustBundleRead { .. } | Self::InvalidTrustBundle(_) | Self::Config(_) => false,
            Self::Credential(e) => e.is_retryable(),
            Self::Connect(_) | Self::ConnectTimeout(_) | Self::PoolTimeout => true,
            Self::Command(e) => {
                e.is_io_error() || e.is_connection_dropped() || e.is_timeout()
            }
        }
    }
}
