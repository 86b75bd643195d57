//! TLS trust bundle.
//!
//! The server certificate of a Memorystore instance is issued by a
//! per-instance CA that is not in any public root store, so every
//! connection verifies the server against the CA bundle downloaded for the
//! instance (`server-ca.pem`).

use std::path::Path;
use std::sync::Arc;

use redis::TlsCertificates;
use rustls::RootCertStore;
use tracing::info;

use crate::error::ClientError;

/// Default location of the instance CA bundle.
pub const DEFAULT_CA_FILE: &str = "server-ca.pem";

/// An immutable set of PEM-encoded certificate authorities.
///
/// Loaded once at startup and shared read-only by every pooled connection.
#[derive(Debug, Clone)]
pub struct TrustBundle {
    pem: Arc<[u8]>,
    certificates: usize,
}

impl TrustBundle {
    /// Read and parse a PEM bundle from `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let path = path.as_ref();
        let pem = std::fs::read(path).map_err(|source| ClientError::TrustBundleRead {
            path: path.to_path_buf(),
            source,
        })?;
        let bundle = Self::from_pem(pem)?;
        info!(path = %path.display(), certificates = bundle.certificates, "trust bundle loaded");
        Ok(bundle)
    }

    /// Parse an in-memory PEM bundle.
    ///
    /// Every certificate block must parse and be usable as a trust anchor;
    /// a bundle without any certificate is rejected.
    pub fn from_pem(pem: impl Into<Vec<u8>>) -> Result<Self, ClientError> {
        let pem: Vec<u8> = pem.into();
        let mut roots = RootCertStore::empty();
        let mut reader = pem.as_slice();

        for cert in rustls_pemfile::certs(&mut reader) {
            let cert = cert.map_err(|e| ClientError::InvalidTrustBundle(e.to_string()))?;
            roots
                .add(cert)
                .map_err(|e| ClientError::InvalidTrustBundle(e.to_string()))?;
        }

        if roots.is_empty() {
            return Err(ClientError::InvalidTrustBundle(
                "no PEM certificate found".into(),
            ));
        }

        Ok(Self {
            pem: pem.into(),
            certificates: roots.len(),
        })
    }

    /// Raw PEM bytes.
    pub fn pem(&self) -> &[u8] {
        &self.pem
    }

    /// Number of certificates in the bundle.
    pub fn len(&self) -> usize {
        self.certificates
    }

    /// Always `false`: an empty bundle cannot be constructed.
    pub fn is_empty(&self) -> bool {
        self.certificates == 0
    }

    /// Root configuration handed to the Redis client.
    pub(crate) fn tls_certificates(&self) -> TlsCertificates {
        TlsCertificates {
            client_tls: None,
            root_cert: Some(self.pem.to_vec()),
        }
    }
}

/// Install the `ring` crypto provider as the process default.
///
/// The Redis client builds its TLS configuration from the process default
/// provider; calling this more than once is harmless.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}
