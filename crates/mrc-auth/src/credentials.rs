//! Credentials presented to the Redis server during `AUTH`.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::AuthError;

/// Username every IAM-authenticated connection presents.
///
/// The server ignores the username and authorises the bearer token alone,
/// but `AUTH` with an ACL user still needs one.
pub const DEFAULT_USERNAME: &str = "default";

/// A username / password pair obtained from a single authentication event.
///
/// * `username`: always [`DEFAULT_USERNAME`] for IAM credentials.
/// * `password`: the short-lived bearer token.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    /// ACL username sent with `AUTH`.
    pub username: String,
    /// Bearer token sent as the password.
    pub password: String,
}

impl Credential {
    /// Build a credential for the default user carrying `token`.
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            username: DEFAULT_USERNAME.to_string(),
            password: token.into(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Source of credentials for new connections.
///
/// The connection pool calls [`retrieve_credential`](Self::retrieve_credential)
/// every time it opens a connection; implementations decide whether that
/// means a network round trip or a cached value.
#[async_trait]
pub trait CredentialsProvider: Send + Sync {
    /// Produce a credential for the next authentication attempt.
    async fn retrieve_credential(&self) -> Result<Credential, AuthError>;
}

#[async_trait]
impl<P> CredentialsProvider for Arc<P>
where
    P: CredentialsProvider + ?Sized,
{
    async fn retrieve_credential(&self) -> Result<Credential, AuthError> {
        (**self).retrieve_credential().await
    }
}
