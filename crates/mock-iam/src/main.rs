//! Standalone mock IAM credentials service for local runs of `mrc-cli`.
//!
//! Point the driver at it with `--iam-endpoint http://localhost:4000` and
//! `--metadata-url http://localhost:4000/computeMetadata/v1/instance/service-accounts/default/token`.

use mock_iam::{MockState, Shared, app};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let port: u16 = std::env::var("MOCK_IAM_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(4000);

    let mut state = MockState::default();
    if let Ok(denied) = std::env::var("MOCK_IAM_DENIED_ACCOUNTS") {
        state.denied_accounts = denied
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
    }

    let router = app(Shared::new(state));

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(address = %addr, "mock IAM listening");
    axum::serve(listener, router).await?;
    Ok(())
}
