//! # mrc-auth
//!
//! IAM-issued credentials for Redis connections to a Memorystore Redis
//! Cluster ("MRC").
//!
//! The crate provides:
//!
//! * [`CredentialsProvider`]: the capability a connection pool calls
//!   whenever it authenticates a new connection.
//! * [`IamTokenProvider`]: exchanges a service-account identity for a
//!   short-lived access token on every call.
//! * [`RefreshingProvider`]: opt-in cache that refreshes one token in the
//!   background for deployments with many connections.
//! * [`AuthError`]: unified error type with retry classification.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use mrc_auth::{CredentialsProvider, IamConfig, IamTokenProvider};
//!
//! # async fn run() -> Result<(), mrc_auth::AuthError> {
//! let config = IamConfig {
//!     service_account: "redis-user@my-project.iam.gserviceaccount.com".into(),
//!     ..IamConfig::from_env()
//! };
//! let provider = IamTokenProvider::new(config)?;
//!
//! let credential = provider.retrieve_credential().await?;
//! assert_eq!(credential.username, "default");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod credentials;
pub mod error;
pub mod iam;
pub mod refresh;
pub mod source;

pub use config::{CLOUD_PLATFORM_SCOPE, DEFAULT_IAM_ENDPOINT, IamConfig};
pub use credentials::{Credential, CredentialsProvider, DEFAULT_USERNAME};
pub use error::AuthError;
pub use iam::{AccessToken, IamTokenProvider};
pub use refresh::{RefreshPolicy, RefreshingProvider};
pub use source::SourceCredentials;
