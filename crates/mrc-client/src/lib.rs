//! # mrc-client
//!
//! A `bb8` pool of TLS connections to a Memorystore Redis Cluster instance,
//! authenticated with IAM access tokens.
//!
//! Each connection the pool opens asks a [`CredentialsProvider`] for a
//! credential and sends it in the connection's `AUTH` handshake.  The server
//! certificate is verified against the instance's CA bundle
//! ([`TrustBundle`]).
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use mrc_auth::{IamConfig, IamTokenProvider};
//! use mrc_client::{MrcClient, PoolConfig, TrustBundle};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! mrc_client::install_crypto_provider();
//! let trust = TrustBundle::load("server-ca.pem")?;
//! let provider = IamTokenProvider::new(IamConfig::from_env())?;
//! let client = MrcClient::new(&PoolConfig::from_env(), &trust, Arc::new(provider))?;
//!
//! client.set("key", "value").await?;
//! assert_eq!(client.get("key").await?.as_deref(), Some("value"));
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod manager;
pub mod trust;

pub use client::{MrcClient, PoolStatus};
pub use config::PoolConfig;
pub use error::ClientError;
pub use manager::{AuthenticatedConnection, AuthenticatedConnectionManager};
pub use mrc_auth::{Credential, CredentialsProvider};
pub use trust::{DEFAULT_CA_FILE, TrustBundle, install_crypto_provider};
