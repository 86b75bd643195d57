use std::error::Error as _;
use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use mock_iam::{MockIam, MockState};
use mock_redis::{CountingProvider, FakeRedis, Pki, accepts_counting_tokens};
use mrc_auth::{IamConfig, IamTokenProvider, RefreshPolicy, RefreshingProvider, SourceCredentials};
use mrc_client::{ClientError, MrcClient, PoolConfig};

async fn fake_with_counting_provider() -> (Pki, FakeRedis, Arc<CountingProvider>, MrcClient) {
    fake_with_pool(|config| config).await
}

async fn fake_with_pool(
    tune: impl FnOnce(PoolConfig) -> PoolConfig,
) -> (Pki, FakeRedis, Arc<CountingProvider>, MrcClient) {
    let pki = Pki::generate("mrc").unwrap();
    let server = FakeRedis::spawn(&pki, accepts_counting_tokens).await.unwrap();
    let provider = Arc::new(CountingProvider::default());
    let client = MrcClient::new(
        &tune(server.pool_config()),
        &pki.trust_bundle().unwrap(),
        provider.clone(),
    )
    .unwrap();
    (pki, server, provider, client)
}

/// Whether the failure chain bottoms out in rustls refusing the server
/// certificate as signed by an unknown CA.
fn rejected_as_unknown_issuer(err: &ClientError) -> bool {
    let mut next: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = next {
        let tls = e
            .downcast_ref::<std::io::Error>()
            .and_then(std::io::Error::get_ref)
            .and_then(|inner| inner.downcast_ref::<rustls::Error>());
        if let Some(tls) = tls {
            return matches!(
                tls,
                rustls::Error::InvalidCertificate(rustls::CertificateError::UnknownIssuer)
            );
        }
        next = e.source();
    }
    false
}

#[tokio::test]
async fn set_then_get_round_trips() {
    let (_pki, _server, _provider, client) = fake_with_counting_provider().await;

    client.set("key", "value").await.unwrap();
    assert_eq!(client.get("key").await.unwrap().as_deref(), Some("value"));
}

#[tokio::test]
async fn repeated_set_keeps_last_value() {
    let (_pki, _server, _provider, client) = fake_with_counting_provider().await;

    client.set("key", "value").await.unwrap();
    client.set("key", "value").await.unwrap();
    assert_eq!(client.get("key").await.unwrap().as_deref(), Some("value"));

    client.set("key", "other").await.unwrap();
    assert_eq!(client.get("key").await.unwrap().as_deref(), Some("other"));
}

#[tokio::test]
async fn missing_key_reads_as_none() {
    let (_pki, _server, _provider, client) = fake_with_counting_provider().await;
    assert_eq!(client.get("absent").await.unwrap(), None);
}

#[tokio::test]
async fn provider_is_not_called_before_first_use() {
    let (_pki, server, provider, client) = fake_with_counting_provider().await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(provider.calls(), 0);
    assert_eq!(client.authentications(), 0);
    assert_eq!(server.accepted(), 0);

    client.ping().await.unwrap();
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn credential_is_fetched_per_connection_not_per_command() {
    let (_pki, server, provider, client) = fake_with_counting_provider().await;

    for i in 0..10 {
        client.set(&format!("k{i}"), "v").await.unwrap();
        client.get(&format!("k{i}")).await.unwrap();
    }
    assert_eq!(provider.calls(), 1);
    assert_eq!(server.auths().len(), 1);

    // Three simultaneous checkouts force two more connections.
    let held = try_join_all((0..3).map(|_| client.get_connection()))
        .await
        .unwrap();
    assert_eq!(client.state().connections, 3);
    drop(held);

    assert_eq!(client.authentications(), 3);
    let auths = server.auths();
    assert_eq!(auths.len(), 3);
    for (user, pass) in &auths {
        assert_eq!(user, "default");
        assert!(pass.starts_with("token-"));
    }

    client.get("k0").await.unwrap();
    assert_eq!(provider.calls(), 3);
}

#[tokio::test]
async fn closed_connection_is_replaced_with_a_fresh_credential() {
    let (_pki, server, provider, client) = fake_with_counting_provider().await;

    client.set("key", "value").await.unwrap();
    assert_eq!(client.authentications(), 1);

    assert_eq!(server.drop_sessions(), 1);
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The check-out PING finds the dead connection; the pool opens another.
    assert_eq!(client.get("key").await.unwrap().as_deref(), Some("value"));
    assert_eq!(client.authentications(), 2);
    assert_eq!(provider.calls(), 2);
    assert_eq!(server.auths().len(), 2);
    assert_eq!(client.state().connections, 1);
}

#[tokio::test]
async fn broken_connection_is_discarded_without_checkout_ping() {
    let (_pki, server, provider, client) = fake_with_pool(|config| PoolConfig {
        test_on_check_out: false,
        ..config
    })
    .await;

    client.set("key", "value").await.unwrap();
    server.drop_sessions();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Nothing pings the connection first, so one command sees the failure.
    let err = client.get("key").await.unwrap_err();
    assert!(matches!(err, ClientError::Command(_)), "got {err:?}");
    assert!(err.is_retryable());
    assert_eq!(client.state().connections, 0);

    assert_eq!(client.get("key").await.unwrap().as_deref(), Some("value"));
    assert_eq!(client.authentications(), 2);
    assert_eq!(provider.calls(), 2);
}

#[tokio::test]
async fn untrusted_server_receives_no_credential() {
    let pki = Pki::generate("mrc").unwrap();
    let server = FakeRedis::spawn(&pki, accepts_counting_tokens).await.unwrap();
    let other = Pki::generate("impostor").unwrap();
    let client = MrcClient::new(
        &server.pool_config(),
        &other.trust_bundle().unwrap(),
        Arc::new(CountingProvider::default()),
    )
    .unwrap();

    let err = client.set("key", "value").await.unwrap_err();
    assert!(matches!(err, ClientError::Connect(_)), "got {err:?}");
    assert!(rejected_as_unknown_issuer(&err), "not a certificate failure: {err:?}");
    assert!(server.accepted() >= 1);
    assert!(server.auths().is_empty());
    assert_eq!(server.sessions(), 0);
}

#[tokio::test]
async fn provider_failure_prevents_connection() {
    let pki = Pki::generate("mrc").unwrap();
    let server = FakeRedis::spawn(&pki, accepts_counting_tokens).await.unwrap();
    let provider = Arc::new(CountingProvider {
        failing: true,
        ..CountingProvider::default()
    });
    let client = MrcClient::new(&server.pool_config(), &pki.trust_bundle().unwrap(), provider).unwrap();

    let err = client.get("key").await.unwrap_err();
    assert!(matches!(err, ClientError::Credential(_)), "got {err:?}");
    assert!(err.is_retryable());
    assert_eq!(server.accepted(), 0);
}

#[tokio::test]
async fn rejected_token_fails_the_connection() {
    let pki = Pki::generate("mrc").unwrap();
    let server = FakeRedis::spawn(&pki, |_, _| false).await.unwrap();
    let client = MrcClient::new(
        &server.pool_config(),
        &pki.trust_bundle().unwrap(),
        Arc::new(CountingProvider::default()),
    )
    .unwrap();

    let err = client.set("key", "value").await.unwrap_err();
    assert!(matches!(err, ClientError::Connect(_)), "got {err:?}");
    assert!(err.is_retryable());
    assert_eq!(server.auths().len(), 1);
    assert_eq!(client.state().connections, 0);
}

#[tokio::test]
async fn exhausted_pool_times_out() {
    let pki = Pki::generate("mrc").unwrap();
    let server = FakeRedis::spawn(&pki, accepts_counting_tokens).await.unwrap();
    let config = PoolConfig {
        max_size: 1,
        connection_timeout: Duration::from_millis(300),
        ..server.pool_config()
    };
    let client = MrcClient::new(
        &config,
        &pki.trust_bundle().unwrap(),
        Arc::new(CountingProvider::default()),
    )
    .unwrap();

    let held = client.get_connection().await.unwrap();
    let err = client.get("key").await.unwrap_err();
    assert!(matches!(err, ClientError::PoolTimeout), "got {err:?}");
    drop(held);

    assert_eq!(client.get("key").await.unwrap(), None);
}

#[tokio::test]
async fn invalid_pool_config_is_rejected() {
    let pki = Pki::generate("mrc").unwrap();
    let config = PoolConfig {
        max_size: 0,
        ..PoolConfig::default()
    };
    let err = MrcClient::new(
        &config,
        &pki.trust_bundle().unwrap(),
        Arc::new(CountingProvider::default()),
    )
    .unwrap_err();
    assert!(matches!(err, ClientError::Config(_)));
}

#[tokio::test]
async fn iam_tokens_authenticate_connections() {
    let iam = MockIam::spawn(MockState::default()).await.unwrap();
    let pki = Pki::generate("mrc").unwrap();
    let server =
        FakeRedis::spawn(&pki, |user, pass| user == "default" && pass.starts_with("ya29.mock-"))
            .await
            .unwrap();
    let provider = IamTokenProvider::new(IamConfig {
        service_account: "redis-user@test-project.iam.gserviceaccount.com".into(),
        endpoint: iam.base_url(),
        source: SourceCredentials::Static("caller-token".into()),
        ..IamConfig::default()
    })
    .unwrap();
    let client = MrcClient::new(&server.pool_config(), &pki.trust_bundle().unwrap(), Arc::new(provider)).unwrap();

    client.set("key", "value").await.unwrap();
    assert_eq!(client.get("key").await.unwrap().as_deref(), Some("value"));
    assert_eq!(iam.issued(), 1);
}

#[tokio::test]
async fn refreshing_provider_shares_one_token_across_connections() {
    let iam = MockIam::spawn(MockState::default()).await.unwrap();
    let pki = Pki::generate("mrc").unwrap();
    let server =
        FakeRedis::spawn(&pki, |_, pass| pass.starts_with("ya29.mock-")).await.unwrap();
    let inner = IamTokenProvider::new(IamConfig {
        service_account: "redis-user@test-project.iam.gserviceaccount.com".into(),
        endpoint: iam.base_url(),
        source: SourceCredentials::Static("caller-token".into()),
        ..IamConfig::default()
    })
    .unwrap();
    let provider = RefreshingProvider::start(inner, RefreshPolicy::default())
        .await
        .unwrap();
    let client = MrcClient::new(&server.pool_config(), &pki.trust_bundle().unwrap(), Arc::new(provider)).unwrap();

    let held = try_join_all((0..3).map(|_| client.get_connection()))
        .await
        .unwrap();
    drop(held);

    assert_eq!(iam.issued(), 1);
    let auths = server.auths();
    assert_eq!(auths.len(), 3);
    assert!(auths.iter().all(|(_, pass)| *pass == auths[0].1));
}
