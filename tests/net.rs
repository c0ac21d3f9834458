//! TLS listener and identity tests over real loopback handshakes.

mod common;

use common::TestPki;
use fleetrpc::net::identity::IdentityExtractor;
use fleetrpc::net::session::{ListenerSettings, TlsListener};
use fleetrpc::net::tls::{TlsConfig, TlsServerBuilder, TlsVersion};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;

async fn bind(pki: &TestPki, handshake_timeout: Duration) -> (TlsListener, watch::Sender<bool>) {
    let tls = TlsServerBuilder::from_config(&TlsConfig::new(&pki.cert_path, &pki.key_path, &pki.ca_path))
        .unwrap()
        .build()
        .unwrap();
    let mut settings = ListenerSettings::new("test", "127.0.0.1:0".parse().unwrap());
    settings.handshake_timeout = handshake_timeout;
    let listener = TlsListener::bind(settings, tls.config()).await.unwrap();
    let (tx, _rx) = watch::channel(false);
    (listener, tx)
}

// ============================================================================
// Handshake and session
// ============================================================================

#[tokio::test]
async fn accepted_stream_carries_client_identity() {
    let pki = TestPki::new();
    let (listener, shutdown) = bind(&pki, Duration::from_secs(5)).await;
    let addr = listener.local_addr();
    let mut incoming = listener.spawn(shutdown.subscribe());

    let identity = pki.client("carol", &["ops", "net-admins"], Some(&["Fleet.GetVmInfo"]));
    let client = async {
        let mut stream = pki.connect(addr, Some(&identity)).await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        stream.read_exact(&mut reply).await.unwrap();
        reply
    };
    let server = async {
        let mut stream = incoming.next().await.unwrap();
        let auth = IdentityExtractor::extract(Some(stream.session())).unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        stream.write_all(b"pong").await.unwrap();
        stream.flush().await.unwrap();
        (auth, buf)
    };
    let (reply, (auth, request)) = tokio::join!(client, server);

    assert_eq!(auth.username, "carol");
    assert!(auth.is_member_of("net-admins"));
    assert!(auth.permits("Fleet", "GetVmInfo"));
    assert!(!auth.permits("Fleet", "DestroyVm"));
    assert_eq!(&request, b"ping");
    assert_eq!(&reply, b"pong");
}

#[tokio::test]
async fn client_without_certificate_never_arrives() {
    let pki = TestPki::new();
    let (listener, shutdown) = bind(&pki, Duration::from_secs(5)).await;
    let addr = listener.local_addr();
    let metrics = listener.metrics();
    let mut incoming = listener.spawn(shutdown.subscribe());

    if let Ok(mut stream) = pki.connect(addr, None).await {
        let _ = stream.write_all(b"hello").await;
        let mut buf = [0u8; 1];
        let _ = stream.read(&mut buf).await;
    }

    let next = tokio::time::timeout(Duration::from_millis(300), incoming.next()).await;
    assert!(next.is_err(), "unauthenticated connection was accepted");
    assert_eq!(metrics.handshake_failures(), 1);
}

#[tokio::test]
async fn stalled_handshake_times_out() {
    let pki = TestPki::new();
    let (listener, shutdown) = bind(&pki, Duration::from_millis(100)).await;
    let addr = listener.local_addr();
    let metrics = listener.metrics();
    let _incoming = listener.spawn(shutdown.subscribe());

    let _idle = tokio::net::TcpStream::connect(addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(metrics.handshake_failures(), 1);
    assert_eq!(metrics.accepted(), 0);
}

#[tokio::test]
async fn shutdown_closes_incoming() {
    let pki = TestPki::new();
    let (listener, shutdown) = bind(&pki, Duration::from_secs(5)).await;
    let mut incoming = listener.spawn(shutdown.subscribe());
    shutdown.send(true).unwrap();
    let next = tokio::time::timeout(Duration::from_secs(2), incoming.next()).await.unwrap();
    assert!(next.is_none());
}

// ============================================================================
// Protocol versions
// ============================================================================

#[tokio::test]
async fn tls13_minimum_still_accepts_modern_clients() {
    let pki = TestPki::new();
    let tls = TlsServerBuilder::from_config(
        &TlsConfig::new(&pki.cert_path, &pki.key_path, &pki.ca_path).with_min_version(TlsVersion::Tls13),
    )
    .unwrap()
    .build()
    .unwrap();
    let listener = TlsListener::bind(ListenerSettings::new("test", "127.0.0.1:0".parse().unwrap()), tls.config())
        .await
        .unwrap();
    let addr = listener.local_addr();
    let (shutdown, _rx) = watch::channel(false);
    let mut incoming = listener.spawn(shutdown.subscribe());

    let identity = pki.client("dave", &[], None);
    let (client, accepted) = tokio::join!(pki.connect(addr, Some(&identity)), incoming.next());
    let stream = accepted.unwrap();
    assert!(stream.session().peer_certificates().is_some());
    assert_eq!(
        client.unwrap().get_ref().1.protocol_version(),
        Some(rustls::ProtocolVersion::TLSv1_3)
    );
}
