mod driver;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use mrc_auth::{CLOUD_PLATFORM_SCOPE, IamConfig, RefreshPolicy, SourceCredentials};
use mrc_client::{DEFAULT_CA_FILE, PoolConfig};
use tracing::{error, info};

use driver::{DriverConfig, RetryPolicy};

/// Flags override the environment, which overrides built-in defaults.
/// Unset flags fall back to `IamConfig::from_env` and `PoolConfig::from_env`
/// (`MRC_SERVICE_ACCOUNT`, `MRC_TOKEN_LIFETIME_SECS`, `MRC_IAM_ENDPOINT`,
/// `MRC_METADATA_URL`, `GOOGLE_OAUTH_ACCESS_TOKEN`, `MRC_HOST`, `MRC_PORT`,
/// `MRC_POOL_MAX_SIZE`, `MRC_POOL_MIN_IDLE`, `MRC_POOL_IDLE_TIMEOUT_SECS`,
/// `MRC_CONNECT_TIMEOUT_SECS`).
#[derive(Parser, Debug)]
#[command(name = "mrc-cli")]
#[command(about = "Write a key to Memorystore Redis Cluster over TLS with an IAM token, then read it back")]
struct Args {
    /// Service account to impersonate [env: MRC_SERVICE_ACCOUNT].
    #[arg(short = 'a', long)]
    account: Option<String>,

    /// Requested token lifetime, e.g. `1h` or `15m` [default: 1h, env:
    /// MRC_TOKEN_LIFETIME_SECS].
    #[arg(short = 'd', long, value_parser = humantime::parse_duration)]
    lifetime: Option<Duration>,

    /// OAuth scope to request; repeat for several.
    #[arg(long = "scope", default_value = CLOUD_PLATFORM_SCOPE)]
    scopes: Vec<String>,

    /// Delegate in the impersonation chain; repeat for several.
    #[arg(long = "delegate")]
    delegates: Vec<String>,

    /// IAM credentials base URL [env: MRC_IAM_ENDPOINT].
    #[arg(long)]
    iam_endpoint: Option<String>,

    /// Metadata server token URL used to authenticate the exchange
    /// [env: MRC_METADATA_URL].
    #[arg(long)]
    metadata_url: Option<String>,

    /// Caller token to use instead of asking the metadata server
    /// [env: GOOGLE_OAUTH_ACCESS_TOKEN].
    #[arg(long)]
    caller_token: Option<String>,

    /// [default: 127.0.0.1, env: MRC_HOST]
    #[arg(long)]
    host: Option<String>,

    /// [default: 6379, env: MRC_PORT]
    #[arg(long)]
    port: Option<u16>,

    /// PEM bundle of the instance's server CA.
    #[arg(long, default_value = DEFAULT_CA_FILE)]
    ca_file: PathBuf,

    #[arg(long, default_value = "key")]
    key: String,

    #[arg(long, default_value = "value")]
    value: String,

    /// [default: 10, env: MRC_POOL_MAX_SIZE]
    #[arg(long)]
    pool_size: Option<u32>,

    /// Idle connections to keep open; the pool warms them in the background
    /// [env: MRC_POOL_MIN_IDLE].
    #[arg(long)]
    min_idle: Option<u32>,

    /// [default: 60s, env: MRC_POOL_IDLE_TIMEOUT_SECS]
    #[arg(long, value_parser = humantime::parse_duration)]
    idle_timeout: Option<Duration>,

    /// [default: 5s, env: MRC_CONNECT_TIMEOUT_SECS]
    #[arg(long, value_parser = humantime::parse_duration)]
    connect_timeout: Option<Duration>,

    /// Refresh one shared token at this interval instead of exchanging a
    /// token for every connection.
    #[arg(long, value_parser = humantime::parse_duration)]
    refresh_interval: Option<Duration>,

    /// After the round trip, write and read back this many generated keys.
    #[arg(long, default_value_t = 0)]
    verify_keys: usize,

    /// Retries for token exchange and connection failures.
    #[arg(long, default_value_t = 3)]
    retries: u32,
}

impl Args {
    /// Layer the flags over configuration read from the environment.
    fn into_config(self) -> DriverConfig {
        self.into_config_over(IamConfig::from_env(), PoolConfig::from_env())
    }

    fn into_config_over(self, mut iam: IamConfig, mut pool: PoolConfig) -> DriverConfig {
        if let Some(token) = self.caller_token {
            iam.source = SourceCredentials::Static(token);
        } else if let Some(url) = self.metadata_url {
            iam.source = SourceCredentials::MetadataServer { url };
        }
        if let Some(account) = self.account {
            iam.service_account = account;
        }
        if let Some(lifetime) = self.lifetime {
            iam.lifetime = lifetime;
        }
        if let Some(endpoint) = self.iam_endpoint {
            iam.endpoint = endpoint;
        }
        iam.scopes = self.scopes;
        iam.delegates = self.delegates;

        if let Some(host) = self.host {
            pool.host = host;
        }
        pool.port = self.port.unwrap_or(pool.port);
        pool.max_size = self.pool_size.unwrap_or(pool.max_size);
        pool.min_idle = self.min_idle.or(pool.min_idle);
        pool.idle_timeout = self.idle_timeout.or(pool.idle_timeout);
        pool.connection_timeout = self.connect_timeout.unwrap_or(pool.connection_timeout);

        let refresh = self.refresh_interval.map(|interval| {
            let defaults = RefreshPolicy::default();
            RefreshPolicy {
                refresh_after: interval,
                check_interval: defaults.check_interval.min(interval),
                lifetime: iam.lifetime,
            }
        });

        DriverConfig {
            iam,
            pool,
            ca_file: self.ca_file,
            key: self.key,
            value: self.value,
            verify_keys: self.verify_keys,
            refresh,
            retry: RetryPolicy {
                retries: self.retries,
                ..RetryPolicy::default()
            },
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    mrc_client::install_crypto_provider();
    let config = Args::parse().into_config();

    match driver::run(config).await {
        Ok(report) => {
            println!(
                "Got the value for key: {}, which is {}",
                report.key,
                report.value.as_deref().unwrap_or("nil")
            );
            if let Some((matched, written)) = report.verified {
                println!("Verified {matched}/{written} keys");
            }
            info!(authentications = report.authentications, "done");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
