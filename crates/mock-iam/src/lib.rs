//! Mock IAM credentials service.
//!
//! Serves the two endpoints an IAM token exchange touches:
//!
//! * `POST /v1/projects/{project}/serviceAccounts/{account}:generateAccessToken`
//!   mints a short-lived access token for the impersonated account.
//! * `GET /computeMetadata/v1/instance/service-accounts/default/token`
//!   hands out the caller's own token, like the instance metadata server.
//!
//! Behaviour is driven by [`MockState`]; counters and the last request are
//! observable through [`MockIam`] so tests can assert on what was sent.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Path of the metadata token endpoint.
pub const METADATA_TOKEN_PATH: &str = "/computeMetadata/v1/instance/service-accounts/default/token";

const GENERATE_SUFFIX: &str = ":generateAccessToken";

// ---------------------------------------------------------------------------
// Configuration and shared state
// ---------------------------------------------------------------------------

/// Static behaviour of the mock.
#[derive(Debug, Clone, Default)]
pub struct MockState {
    /// Bearer token callers must present; any token is accepted when `None`.
    pub required_caller_token: Option<String>,
    /// Account emails for which the exchange is refused with `403`.
    pub denied_accounts: HashSet<String>,
    /// Token returned for every exchange instead of a generated one.
    pub fixed_token: Option<String>,
    /// Answer `200` with a body lacking `accessToken`.
    pub malformed: bool,
    /// Refuse this many exchanges with `503` before serving any.
    pub fail_first: u64,
}

/// Body of a `generateAccessToken` call as the mock recorded it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RecordedRequest {
    /// Resource name the token was requested for.
    #[serde(skip)]
    pub name: String,
    /// Delegation chain.
    #[serde(default)]
    pub delegates: Vec<String>,
    /// Requested scopes.
    #[serde(default)]
    pub scope: Vec<String>,
    /// Requested lifetime in protobuf JSON form (`"3600s"`).
    #[serde(default)]
    pub lifetime: Option<String>,
}

/// State shared across all handlers.
#[derive(Debug, Default)]
pub struct Shared {
    config: MockState,
    issued: AtomicU64,
    attempts: AtomicU64,
    unavailable: AtomicBool,
    last_request: Mutex<Option<RecordedRequest>>,
}

impl Shared {
    /// Wrap a [`MockState`] for use as router state.
    pub fn new(config: MockState) -> Arc<Self> {
        Arc::new(Self {
            config,
            ..Self::default()
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateAccessTokenResponse {
    access_token: String,
    expire_time: String,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the mock's router around `shared`.
pub fn app(shared: Arc<Shared>) -> Router {
    Router::new()
        .route(
            "/v1/projects/{project}/serviceAccounts/{target}",
            post(generate_access_token),
        )
        .route(METADATA_TOKEN_PATH, get(metadata_token))
        .with_state(shared)
}

/// Google API error envelope.
fn google_error(status: StatusCode, reason: &str, message: &str) -> Response {
    (
        status,
        Json(json!({
            "error": {
                "code": status.as_u16(),
                "message": message,
                "status": reason,
            }
        })),
    )
        .into_response()
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Parse a protobuf JSON duration of whole seconds (`"3600s"`).
fn parse_lifetime(raw: &str) -> Option<i64> {
    raw.strip_suffix('s')?.parse::<i64>().ok().filter(|s| *s > 0)
}

/// `POST /v1/projects/{project}/serviceAccounts/{account}:generateAccessToken`
async fn generate_access_token(
    State(shared): State<Arc<Shared>>,
    Path((project, target)): Path<(String, String)>,
    headers: HeaderMap,
    Json(mut req): Json<RecordedRequest>,
) -> Response {
    let Some(account) = target.strip_suffix(GENERATE_SUFFIX) else {
        return google_error(StatusCode::NOT_FOUND, "NOT_FOUND", "unknown method");
    };
    req.name = format!("projects/{project}/serviceAccounts/{account}");
    info!(account = %account, scopes = ?req.scope, "generateAccessToken request");

    if let Ok(mut last) = shared.last_request.lock() {
        *last = Some(req.clone());
    }

    let Some(caller) = bearer(&headers) else {
        return google_error(
            StatusCode::UNAUTHORIZED,
            "UNAUTHENTICATED",
            "Request is missing required authentication credential.",
        );
    };
    if let Some(required) = &shared.config.required_caller_token {
        if caller != required.as_str() {
            return google_error(
                StatusCode::UNAUTHORIZED,
                "UNAUTHENTICATED",
                "Request had invalid authentication credentials.",
            );
        }
    }

    let attempt = shared.attempts.fetch_add(1, Ordering::SeqCst);
    if shared.unavailable.load(Ordering::SeqCst) || attempt < shared.config.fail_first {
        warn!(attempt, "mock is unavailable, refusing exchange");
        return google_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "UNAVAILABLE",
            "The service is currently unavailable.",
        );
    }

    if shared.config.denied_accounts.contains(account) {
        return google_error(
            StatusCode::FORBIDDEN,
            "PERMISSION_DENIED",
            "Permission 'iam.serviceAccounts.getAccessToken' denied on resource (or it may not exist).",
        );
    }

    if req.scope.is_empty() {
        return google_error(
            StatusCode::BAD_REQUEST,
            "INVALID_ARGUMENT",
            "Scope required.",
        );
    }

    let lifetime_secs = match req.lifetime.as_deref() {
        None => 3600,
        Some(raw) => match parse_lifetime(raw) {
            Some(secs) => secs,
            None => {
                return google_error(
                    StatusCode::BAD_REQUEST,
                    "INVALID_ARGUMENT",
                    &format!("Invalid value at 'lifetime' ({raw})"),
                );
            }
        },
    };

    if shared.config.malformed {
        return (StatusCode::OK, Json(json!({ "expireTime": "soon" }))).into_response();
    }

    let n = shared.issued.fetch_add(1, Ordering::SeqCst) + 1;
    let access_token = shared
        .config
        .fixed_token
        .clone()
        .unwrap_or_else(|| format!("ya29.mock-{n}-{}", uuid::Uuid::new_v4().simple()));
    let expire_time = (Utc::now() + chrono::Duration::seconds(lifetime_secs))
        .to_rfc3339_opts(SecondsFormat::Secs, true);

    Json(GenerateAccessTokenResponse {
        access_token,
        expire_time,
    })
    .into_response()
}

/// `GET /computeMetadata/v1/instance/service-accounts/default/token`
async fn metadata_token(State(shared): State<Arc<Shared>>, headers: HeaderMap) -> Response {
    let flavored = headers
        .get("metadata-flavor")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == "Google");
    if !flavored {
        return (StatusCode::FORBIDDEN, "Missing Metadata-Flavor:Google header.").into_response();
    }

    let access_token = shared
        .config
        .required_caller_token
        .clone()
        .unwrap_or_else(|| format!("ya29.metadata-{}", uuid::Uuid::new_v4().simple()));

    Json(json!({
        "access_token": access_token,
        "expires_in": 3599,
        "token_type": "Bearer",
    }))
    .into_response()
}

// ---------------------------------------------------------------------------
// In-process server handle
// ---------------------------------------------------------------------------

/// A running mock bound to an ephemeral local port.
///
/// The server task is aborted when the handle is dropped.
pub struct MockIam {
    addr: SocketAddr,
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl MockIam {
    /// Start the mock on `127.0.0.1:0`.
    pub async fn spawn(config: MockState) -> std::io::Result<Self> {
        let shared = Shared::new(config);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let router = app(Arc::clone(&shared));
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                warn!(error = %e, "mock IAM server stopped");
            }
        });
        Ok(Self { addr, shared, task })
    }

    /// Base URL to use as the IAM endpoint.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Full URL of the metadata token endpoint.
    pub fn metadata_token_url(&self) -> String {
        format!("{}{METADATA_TOKEN_PATH}", self.base_url())
    }

    /// Number of access tokens minted so far.
    pub fn issued(&self) -> u64 {
        self.shared.issued.load(Ordering::SeqCst)
    }

    /// Make every subsequent exchange fail with `503` (or recover).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.shared.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// The most recent `generateAccessToken` body.
    pub fn last_request(&self) -> Option<RecordedRequest> {
        self.shared
            .last_request
            .lock()
            .ok()
            .and_then(|last| last.clone())
    }
}

impl Drop for MockIam {
    fn drop(&mut self) {
        self.task.abort();
    }
}
