//! In-process TLS Redis fake.
//!
//! Speaks enough RESP2 for the client's connection handshake and for
//! `PING`, `SET` and `GET`.  Every `AUTH` is recorded and checked by a
//! caller-supplied validator; commands before a successful `AUTH` get
//! `-NOAUTH`.  Certificates come from [`Pki`], a throwaway CA with a
//! `127.0.0.1` server certificate.
//!
//! Live sessions can be torn down with [`FakeRedis::drop_sessions`], the
//! way a server closes idle or expired connections.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mrc_auth::AuthError;
use mrc_client::{ClientError, Credential, CredentialsProvider, PoolConfig, TrustBundle};
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

/// Errors setting up the fake.
#[derive(Debug, thiserror::Error)]
pub enum MockError {
    #[error("certificate generation failed: {0}")]
    Certificate(#[from] rcgen::Error),

    #[error("TLS configuration failed: {0}")]
    Tls(#[from] rustls::Error),

    #[error("trust bundle rejected: {0}")]
    Trust(#[from] ClientError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Certificates
// ---------------------------------------------------------------------------

/// A CA and a `127.0.0.1` server certificate it signed.
pub struct Pki {
    /// PEM of the CA certificate; what a client trusts.
    pub ca_pem: String,
    chain: Vec<CertificateDer<'static>>,
    key_der: Vec<u8>,
}

impl Pki {
    /// Generate a fresh CA named after `name` and a leaf for `127.0.0.1`.
    pub fn generate(name: &str) -> Result<Self, MockError> {
        let ca_key = KeyPair::generate()?;
        let mut ca_params = CertificateParams::new(Vec::<String>::new())?;
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params
            .distinguished_name
            .push(DnType::CommonName, format!("{name} CA"));
        ca_params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        let ca_cert = ca_params.self_signed(&ca_key)?;

        let leaf_key = KeyPair::generate()?;
        let mut leaf_params = CertificateParams::new(Vec::<String>::new())?;
        leaf_params.subject_alt_names = vec![SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST))];
        leaf_params
            .distinguished_name
            .push(DnType::CommonName, format!("{name} server"));
        leaf_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let leaf_cert = leaf_params.signed_by(&leaf_key, &ca_cert, &ca_key)?;

        Ok(Self {
            ca_pem: ca_cert.pem(),
            chain: vec![leaf_cert.der().clone()],
            key_der: leaf_key.serialize_der(),
        })
    }

    /// The CA as a client-side trust bundle.
    pub fn trust_bundle(&self) -> Result<TrustBundle, MockError> {
        Ok(TrustBundle::from_pem(self.ca_pem.clone())?)
    }

    fn acceptor(&self) -> Result<TlsAcceptor, MockError> {
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone()));
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(self.chain.clone(), key)?;
        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

// ---------------------------------------------------------------------------
// Server state
// ---------------------------------------------------------------------------

type Validator = Box<dyn Fn(&str, &str) -> bool + Send + Sync>;

struct ServerState {
    validate: Validator,
    data: Mutex<HashMap<String, String>>,
    auths: Mutex<Vec<(String, String)>>,
    live: Mutex<Vec<AbortHandle>>,
    accepted: AtomicUsize,
    sessions: AtomicUsize,
}

impl ServerState {
    fn new(validate: Validator) -> Self {
        Self {
            validate,
            data: Mutex::new(HashMap::new()),
            auths: Mutex::new(Vec::new()),
            live: Mutex::new(Vec::new()),
            accepted: AtomicUsize::new(0),
            sessions: AtomicUsize::new(0),
        }
    }

    fn reply(&self, args: &[String], authenticated: &mut bool) -> String {
        let Some(name) = args.first().map(|a| a.to_ascii_uppercase()) else {
            return "-ERR empty command\r\n".into();
        };

        if name == "AUTH" {
            let (user, pass) = match args {
                [_, pass] => ("default", pass.as_str()),
                [_, user, pass] => (user.as_str(), pass.as_str()),
                _ => return "-ERR wrong number of arguments for 'auth' command\r\n".into(),
            };
            if let Ok(mut auths) = self.auths.lock() {
                auths.push((user.to_string(), pass.to_string()));
            }
            if (self.validate)(user, pass) {
                *authenticated = true;
                return "+OK\r\n".into();
            }
            return "-WRONGPASS invalid username-password pair or user is disabled.\r\n".into();
        }

        if !*authenticated {
            return "-NOAUTH Authentication required.\r\n".into();
        }

        match (name.as_str(), args) {
            ("PING", _) => "+PONG\r\n".into(),
            ("CLIENT" | "SELECT", _) => "+OK\r\n".into(),
            ("SET", [_, key, value, ..]) => {
                if let Ok(mut data) = self.data.lock() {
                    data.insert(key.clone(), value.clone());
                }
                "+OK\r\n".into()
            }
            ("GET", [_, key]) => match self.data.lock().ok().and_then(|d| d.get(key).cloned()) {
                Some(value) => format!("${}\r\n{value}\r\n", value.len()),
                None => "$-1\r\n".into(),
            },
            _ => format!("-ERR unknown command '{name}'\r\n"),
        }
    }
}

// ---------------------------------------------------------------------------
// Fake server
// ---------------------------------------------------------------------------

/// A TLS RESP server bound to `127.0.0.1:0`.
///
/// The accept loop and every session are aborted when the handle is dropped.
pub struct FakeRedis {
    addr: SocketAddr,
    state: Arc<ServerState>,
    task: JoinHandle<()>,
}

impl FakeRedis {
    /// Start serving with `pki`'s server certificate.  `validate` decides
    /// which `(username, password)` pairs `AUTH` accepts.
    pub async fn spawn(
        pki: &Pki,
        validate: impl Fn(&str, &str) -> bool + Send + Sync + 'static,
    ) -> Result<Self, MockError> {
        mrc_client::install_crypto_provider();
        let acceptor = pki.acceptor()?;
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(ServerState::new(Box::new(validate)));

        let shared = Arc::clone(&state);
        let task = tokio::spawn(async move {
            while let Ok((tcp, peer)) = listener.accept().await {
                shared.accepted.fetch_add(1, Ordering::SeqCst);
                let acceptor = acceptor.clone();
                let state = Arc::clone(&shared);
                let session = tokio::spawn(async move {
                    match acceptor.accept(tcp).await {
                        Ok(tls) => {
                            state.sessions.fetch_add(1, Ordering::SeqCst);
                            if let Err(e) = serve(tls, state).await {
                                debug!(%peer, error = %e, "session ended");
                            }
                        }
                        Err(e) => debug!(%peer, error = %e, "TLS handshake failed"),
                    }
                });
                if let Ok(mut live) = shared.live.lock() {
                    live.retain(|h| !h.is_finished());
                    live.push(session.abort_handle());
                }
            }
        });

        info!(%addr, "fake Redis listening");
        Ok(Self { addr, state, task })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// TCP connections accepted, including failed handshakes.
    pub fn accepted(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    /// TLS sessions established.
    pub fn sessions(&self) -> usize {
        self.state.sessions.load(Ordering::SeqCst)
    }

    /// Every `(username, password)` pair received in `AUTH`.
    pub fn auths(&self) -> Vec<(String, String)> {
        self.state
            .auths
            .lock()
            .map(|a| a.clone())
            .unwrap_or_default()
    }

    /// Close every open session without a reply, keeping stored data and
    /// the listener.  Returns how many sessions were closed.
    pub fn drop_sessions(&self) -> usize {
        let Ok(mut live) = self.state.live.lock() else {
            return 0;
        };
        let mut closed = 0;
        for session in live.drain(..) {
            if !session.is_finished() {
                session.abort();
                closed += 1;
            }
        }
        info!(closed, "dropped live sessions");
        closed
    }

    /// Pool settings pointing at this server, sized for tests.
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            host: "127.0.0.1".into(),
            port: self.port(),
            max_size: 4,
            min_idle: None,
            connection_timeout: Duration::from_secs(2),
            ..PoolConfig::default()
        }
    }
}

impl Drop for FakeRedis {
    fn drop(&mut self) {
        self.task.abort();
        self.drop_sessions();
    }
}

async fn serve(
    stream: tokio_rustls::server::TlsStream<TcpStream>,
    state: Arc<ServerState>,
) -> std::io::Result<()> {
    let (read, mut write) = tokio::io::split(stream);
    let mut read = BufReader::new(read);
    let mut authenticated = false;

    while let Some(args) = read_command(&mut read).await? {
        let reply = state.reply(&args, &mut authenticated);
        write.write_all(reply.as_bytes()).await?;
        write.flush().await?;
    }
    Ok(())
}

async fn read_line<R: AsyncBufReadExt + Unpin>(read: &mut R) -> std::io::Result<Option<String>> {
    let mut line = String::new();
    if read.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches("\r\n").to_string()))
}

fn invalid(msg: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg.to_string())
}

/// Read one RESP array of bulk strings.
async fn read_command<R: AsyncBufReadExt + Unpin>(
    read: &mut R,
) -> std::io::Result<Option<Vec<String>>> {
    let Some(header) = read_line(read).await? else {
        return Ok(None);
    };
    let count: usize = header
        .strip_prefix('*')
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| invalid("expected array"))?;

    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        let len: usize = read_line(read)
            .await?
            .as_deref()
            .and_then(|l| l.strip_prefix('$'))
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| invalid("expected bulk string"))?;
        let mut buf = vec![0; len + 2];
        read.read_exact(&mut buf).await?;
        buf.truncate(len);
        args.push(String::from_utf8(buf).map_err(|_| invalid("non-utf8 argument"))?);
    }
    Ok(Some(args))
}

// ---------------------------------------------------------------------------
// Credential providers
// ---------------------------------------------------------------------------

/// Hands out `token-1`, `token-2`, ... and counts calls.
#[derive(Default)]
pub struct CountingProvider {
    pub calls: AtomicUsize,
    /// Fail every call with an unreachable-metadata-server error.
    pub failing: bool,
}

impl CountingProvider {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialsProvider for CountingProvider {
    async fn retrieve_credential(&self) -> Result<Credential, AuthError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.failing {
            return Err(AuthError::SourceToken {
                status: None,
                message: "metadata server unreachable".into(),
            });
        }
        Ok(Credential::with_token(format!("token-{n}")))
    }
}

/// Validator accepting what [`CountingProvider`] hands out.
pub fn accepts_counting_tokens(user: &str, pass: &str) -> bool {
    user == "default" && pass.starts_with("token-")
}
