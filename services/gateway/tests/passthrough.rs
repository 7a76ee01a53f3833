
use std::net::SocketAddr;
use std::time::Duration;

use bridge_gateway::proxy::{ExchangeResult, IdlePolicy};
use harness::{eventually, gateway_config, tls_client_connect, GatewayHandle, TcpEchoBackend, TlsBackend};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

async fn roundtrip(stream: &mut TcpStream, payload: &[u8]) -> Vec<u8> {
    stream.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    timeout(Duration::from_secs(2), stream.read_exact(&mut buf))
        .await
        .expect("echo timed out")
        .unwrap();
    buf
}

/// True once the gateway has closed `stream` (EOF or reset).
async fn closed_by_gateway(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 16];
    matches!(
        timeout(Duration::from_secs(2), stream.read(&mut buf)).await,
        Ok(Ok(0)) | Ok(Err(_))
    )
}

async fn dead_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

#[tokio::test]
async fn bytes_echoed_through_gateway_and_logged_on_close() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let gateway = GatewayHandle::spawn(gateway_config(backend.addr), 4).await.unwrap();

    let mut client = TcpStream::connect(gateway.listen_addr).await.unwrap();
    assert_eq!(roundtrip(&mut client, b"hello").await, b"hello");
    drop(client);

    let telemetry = gateway.telemetry.clone();
    assert!(eventually(|| {
        let telemetry = telemetry.clone();
        async move { telemetry.recent().await.len() == 1 }
    })
    .await);

    let entry = &gateway.telemetry.recent().await[0];
    assert_eq!(entry.bytes_in, 5);
    assert_eq!(entry.bytes_out, 5);
    assert_eq!(entry.result, ExchangeResult::Success);
    assert_eq!(entry.source_address, "127.0.0.1".parse::<std::net::IpAddr>().unwrap());

    let pool = gateway.pool.clone();
    assert!(eventually(|| {
        let pool = pool.clone();
        async move { pool.available() == 4 }
    })
    .await);
}

#[tokio::test]
async fn consecutive_exchanges_on_one_connection_logged_separately() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let gateway = GatewayHandle::spawn(gateway_config(backend.addr), 4).await.unwrap();

    let mut client = TcpStream::connect(gateway.listen_addr).await.unwrap();
    roundtrip(&mut client, b"first").await;
    roundtrip(&mut client, b"second!").await;
    drop(client);

    let telemetry = gateway.telemetry.clone();
    assert!(eventually(|| {
        let telemetry = telemetry.clone();
        async move { telemetry.recent().await.len() == 2 }
    })
    .await);

    // Most recent first.
    let entries = gateway.telemetry.recent().await;
    assert_eq!((entries[0].bytes_in, entries[0].bytes_out), (7, 7));
    assert_eq!((entries[1].bytes_in, entries[1].bytes_out), (5, 5));
}

#[tokio::test]
async fn tls_relayed_opaquely() {
    let backend = TlsBackend::spawn("backend.local", "backend-marker").await.unwrap();
    let gateway = GatewayHandle::spawn(gateway_config(backend.addr), 4).await.unwrap();

    // The client completes a handshake with the backend's own certificate,
    // so the gateway cannot have touched the record stream.
    let mut tls = tls_client_connect(gateway.listen_addr, "backend.local", &backend.cert.cert_der)
        .await
        .unwrap();
    tls.write_all(b"ping").await.unwrap();
    tls.flush().await.unwrap();

    let mut buf = vec![0u8; backend.marker.len()];
    timeout(Duration::from_secs(2), tls.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(buf, backend.marker.as_bytes());
}

#[tokio::test]
async fn connection_over_capacity_rejected_without_backend_connect() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let gateway = GatewayHandle::spawn(gateway_config(backend.addr), 1).await.unwrap();

    let mut first = TcpStream::connect(gateway.listen_addr).await.unwrap();
    roundtrip(&mut first, b"hold").await;
    assert_eq!(backend.connection_count(), 1);

    let mut second = TcpStream::connect(gateway.listen_addr).await.unwrap();
    assert!(closed_by_gateway(&mut second).await);
    assert_eq!(backend.connection_count(), 1);
    assert_eq!(gateway.stats().connections_rejected, 1);

    // Freeing the slot admits the next client.
    drop(first);
    let pool = gateway.pool.clone();
    assert!(eventually(|| {
        let pool = pool.clone();
        async move { pool.available() == 1 }
    })
    .await);

    let mut third = TcpStream::connect(gateway.listen_addr).await.unwrap();
    assert_eq!(roundtrip(&mut third, b"again").await, b"again");
    assert_eq!(backend.connection_count(), 2);
}

#[tokio::test]
async fn idle_connection_times_out_and_logs_timeout() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let mut config = gateway_config(backend.addr);
    config.idle = IdlePolicy::new(Duration::from_millis(200));
    let gateway = GatewayHandle::spawn(config, 4).await.unwrap();

    let mut client = TcpStream::connect(gateway.listen_addr).await.unwrap();
    roundtrip(&mut client, b"tick").await;

    assert!(closed_by_gateway(&mut client).await);

    // Outcome counters are bumped after the final telemetry write.
    let stats = gateway.stats.clone();
    assert!(eventually(|| {
        let stats = stats.clone();
        async move { stats.snapshot().timed_out == 1 }
    })
    .await);
    assert_eq!(gateway.telemetry.recent().await[0].result, ExchangeResult::Timeout);
    // Failed exchanges never feed the average.
    assert_eq!(gateway.telemetry.average().await.sample_count, 0);
}

#[tokio::test]
async fn unreachable_backend_releases_slot_without_telemetry() {
    let gateway = GatewayHandle::spawn(gateway_config(dead_addr().await), 1).await.unwrap();

    let mut client = TcpStream::connect(gateway.listen_addr).await.unwrap();
    assert!(closed_by_gateway(&mut client).await);

    let pool = gateway.pool.clone();
    assert!(eventually(|| {
        let pool = pool.clone();
        async move { pool.available() == 1 }
    })
    .await);
    assert!(gateway.telemetry.recent().await.is_empty());

    // The single slot came back, so the next client is admitted again.
    let mut again = TcpStream::connect(gateway.listen_addr).await.unwrap();
    assert!(closed_by_gateway(&mut again).await);

    let stats = gateway.stats.clone();
    assert!(eventually(|| {
        let stats = stats.clone();
        async move { stats.snapshot().errored == 2 }
    })
    .await);
    let snapshot = gateway.stats();
    assert_eq!(snapshot.connections_accepted, 2);
    assert_eq!(snapshot.connections_rejected, 0);
    assert_eq!(snapshot.backend_failed, 2);
}
