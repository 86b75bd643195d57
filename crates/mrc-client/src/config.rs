//! Pool configuration.
//!
//! All values can be overridden via environment variables:
//!
//! | Variable | Default |
//! |---|---|
//! | `MRC_HOST` | `127.0.0.1` |
//! | `MRC_PORT` | `6379` |
//! | `MRC_POOL_MAX_SIZE` | `10` |
//! | `MRC_POOL_MIN_IDLE` | unset |
//! | `MRC_POOL_IDLE_TIMEOUT_SECS` | `60` |
//! | `MRC_CONNECT_TIMEOUT_SECS` | `5` |

use std::time::Duration;

use crate::error::ClientError;

/// Where to connect and how the connection pool behaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Discovery endpoint host of the instance.
    pub host: String,
    /// Discovery endpoint port.
    pub port: u16,
    /// Upper bound on open connections.
    pub max_size: u32,
    /// Idle connections the pool keeps open.  When set, the pool starts
    /// opening them in the background as soon as it is built.
    pub min_idle: Option<u32>,
    /// Idle connections above `min_idle` are closed after this long.
    pub idle_timeout: Option<Duration>,
    /// Bound on opening one connection, and on waiting for a pooled one.
    pub connection_timeout: Duration,
    /// Connections are recycled after this age, forcing a fresh token.
    pub max_lifetime: Option<Duration>,
    /// `PING` a connection before handing it out.
    pub test_on_check_out: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 6379,
            max_size: 10,
            min_idle: None,
            idle_timeout: Some(Duration::from_secs(60)),
            connection_timeout: Duration::from_secs(5),
            max_lifetime: None,
            test_on_check_out: true,
        }
    }
}

impl PoolConfig {
    /// Load from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let secs = |var: &str| std::env::var(var).ok().and_then(|v| v.parse::<u64>().ok());

        Self {
            host: std::env::var("MRC_HOST").unwrap_or(defaults.host),
            port: std::env::var("MRC_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            max_size: std::env::var("MRC_POOL_MAX_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_size),
            min_idle: std::env::var("MRC_POOL_MIN_IDLE")
                .ok()
                .and_then(|v| v.parse().ok())
                .or(defaults.min_idle),
            idle_timeout: secs("MRC_POOL_IDLE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .or(defaults.idle_timeout),
            connection_timeout: secs("MRC_CONNECT_TIMEOUT_SECS")
                .map_or(defaults.connection_timeout, Duration::from_secs),
            ..defaults
        }
    }

    /// Reject settings the pool cannot honour.
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.host.trim().is_empty() {
            return Err(ClientError::Config("host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(ClientError::Config("port must be non-zero".into()));
        }
        if self.max_size == 0 {
            return Err(ClientError::Config("max_size must be at least 1".into()));
        }
        if let Some(min_idle) = self.min_idle {
            if min_idle > self.max_size {
                return Err(ClientError::Config(format!(
                    "min_idle ({min_idle}) exceeds max_size ({})",
                    self.max_size
                )));
            }
        }
        if self.connection_timeout.is_zero() {
            return Err(ClientError::Config(
                "connection_timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// `rediss://` URL of the endpoint.  IPv6 literals are bracketed.
    pub(crate) fn url(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("rediss://[{}]:{}", self.host, self.port)
        } else {
            format!("rediss://{}:{}", self.host, self.port)
        }
    }
}
