//! Fail-closed trust verification: a client must refuse to open against
//! an endpoint whose certificate chain it cannot verify, on every
//! transport variant, with no way to downgrade the check.

use hublink::testing::{CertProfile, TestHub};
use hublink::{
    ClientOptions, ConnectionState, Message, Protocol, ServiceClient, ServiceError, TrustConfig,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

async fn refuses_untrusted_chain(protocol: Protocol) {
    init_tracing();
    let hub = TestHub::start_with(CertProfile::UntrustedRoot).await.expect("hub");

    // hub.trust_config() is the system roots here; the hub's freshly
    // generated CA is not among them.
    let client = ServiceClient::with_options(
        &hub.connection_string(protocol),
        protocol,
        ClientOptions::default().with_trust(hub.trust_config()),
    )
    .expect("client");

    let err = client.open().await.unwrap_err();
    assert!(
        matches!(err, ServiceError::CertificateTrust(_)),
        "expected a certificate trust failure, got {err:?}"
    );
    assert_eq!(client.state().await, ConnectionState::Faulted);

    // No application data ever moved.
    assert!(hub.received("11").is_empty());

    // The faulted client is unusable from here on.
    let err = client.send("11", Message::from("adsf")).await.unwrap_err();
    assert!(matches!(err, ServiceError::InvalidState(_)));
}

#[tokio::test]
async fn direct_client_rejects_untrusted_root() {
    refuses_untrusted_chain(Protocol::Direct).await;
}

#[tokio::test]
async fn websocket_client_rejects_untrusted_root() {
    refuses_untrusted_chain(Protocol::WebSocket).await;
}

async fn refuses_wrong_hostname(protocol: Protocol) {
    init_tracing();
    let hub = TestHub::start_with(CertProfile::WrongHostname).await.expect("hub");

    // The CA itself is trusted; the end-entity certificate just names a
    // different host than the one we dialed.
    let client = ServiceClient::with_options(
        &hub.connection_string(protocol),
        protocol,
        ClientOptions::default().with_trust(hub.trust_config()),
    )
    .expect("client");

    let err = client.open().await.unwrap_err();
    assert!(
        matches!(err, ServiceError::CertificateTrust(_)),
        "expected a certificate trust failure, got {err:?}"
    );
    assert_eq!(client.state().await, ConnectionState::Faulted);
}

#[tokio::test]
async fn direct_client_rejects_certificate_for_wrong_hostname() {
    refuses_wrong_hostname(Protocol::Direct).await;
}

#[tokio::test]
async fn websocket_client_rejects_certificate_for_wrong_hostname() {
    refuses_wrong_hostname(Protocol::WebSocket).await;
}

#[tokio::test]
async fn trusted_private_ca_is_accepted() {
    init_tracing();
    let hub = TestHub::start().await.expect("hub");

    let client = ServiceClient::with_options(
        &hub.connection_string(Protocol::Direct),
        Protocol::Direct,
        ClientOptions::default().with_trust(hub.trust_config()),
    )
    .expect("client");

    client.open().await.expect("open against trusted chain");
    assert_eq!(client.state().await, ConnectionState::Open);
    client.close().await.expect("close");
}

#[tokio::test]
async fn empty_trust_store_is_a_configuration_error() {
    init_tracing();
    let err = ServiceClient::with_options(
        "HostName=localhost;SharedAccessKeyName=service;SharedAccessKey=c2VjcmV0",
        Protocol::Direct,
        ClientOptions::default().with_trust(TrustConfig::with_root_certs(Vec::new())),
    )
    .unwrap_err();
    assert!(matches!(err, ServiceError::Configuration(_)));
}
