
use std::time::Duration;

use bridge_gateway::proxy::{BackendVerification, ExchangeResult, ForwardingMode, TerminationConfig};
use harness::{
    eventually, gateway_config, read_response, tls_client_connect, GatewayHandle, HttpsBackend, TestCert,
    CHUNKED_BODY,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const GATEWAY_NAME: &str = "gateway.local";

async fn terminating_gateway(
    backend: &HttpsBackend,
    verification: BackendVerification,
) -> (GatewayHandle, TestCert) {
    let cert = TestCert::generate(GATEWAY_NAME);
    let mut config = gateway_config(backend.addr);
    config.mode = ForwardingMode::Terminating(TerminationConfig {
        cert_pem: cert.cert_pem.clone(),
        key_pem: cert.key_pem.clone(),
        backend_verification: verification,
        backend_server_name: "backend.local".to_string(),
    });
    let gateway = GatewayHandle::spawn(config, 4).await.unwrap();
    (gateway, cert)
}

#[tokio::test]
async fn request_reframed_without_accept_encoding() {
    let backend = HttpsBackend::spawn("backend.local").await.unwrap();
    let (gateway, cert) = terminating_gateway(&backend, BackendVerification::Insecure).await;

    let mut tls = tls_client_connect(gateway.listen_addr, GATEWAY_NAME, &cert.cert_der)
        .await
        .unwrap();
    // Sent in two pieces; the backend must still see one whole request.
    tls.write_all(b"GET /api/meters/aggregates HTTP/1.1\r\nHost: gateway.local\r\nAccept-Enc")
        .await
        .unwrap();
    tls.flush().await.unwrap();
    tls.write_all(b"oding: gzip, deflate\r\nAccept: application/json\r\n\r\n")
        .await
        .unwrap();
    tls.flush().await.unwrap();

    let response = read_response(&mut tls).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.ends_with("{\"path\":\"/api/meters/aggregates\"}"));

    let recorded = backend.recorded().await;
    assert_eq!(recorded.len(), 1);
    assert_eq!(
        recorded[0],
        "GET /api/meters/aggregates HTTP/1.1\r\nHost: gateway.local\r\nAccept: application/json\r\n\r\n"
    );
}

#[tokio::test]
async fn chunked_response_relayed_whole() {
    let backend = HttpsBackend::spawn("backend.local").await.unwrap();
    let (gateway, cert) = terminating_gateway(&backend, BackendVerification::Insecure).await;

    let mut tls = tls_client_connect(gateway.listen_addr, GATEWAY_NAME, &cert.cert_der)
        .await
        .unwrap();
    tls.write_all(b"GET /chunked HTTP/1.1\r\nHost: gateway.local\r\n\r\n")
        .await
        .unwrap();
    tls.flush().await.unwrap();

    let response = read_response(&mut tls).await.unwrap();
    assert!(response.contains("Transfer-Encoding: chunked"));
    assert!(response.ends_with(CHUNKED_BODY));
}

#[tokio::test]
async fn keep_alive_exchanges_logged_as_success() {
    let backend = HttpsBackend::spawn("backend.local").await.unwrap();
    let (gateway, cert) = terminating_gateway(&backend, BackendVerification::Insecure).await;

    let mut tls = tls_client_connect(gateway.listen_addr, GATEWAY_NAME, &cert.cert_der)
        .await
        .unwrap();
    for path in ["/api/status", "/api/system_status/soe"] {
        let request = format!("GET {path} HTTP/1.1\r\nHost: gateway.local\r\n\r\n");
        tls.write_all(request.as_bytes()).await.unwrap();
        tls.flush().await.unwrap();
        let response = read_response(&mut tls).await.unwrap();
        assert!(response.ends_with(&format!("{{\"path\":\"{path}\"}}")));
    }

    // Both exchanges are logged while the connection is still open.
    let telemetry = gateway.telemetry.clone();
    assert!(eventually(|| {
        let telemetry = telemetry.clone();
        async move { telemetry.recent().await.len() == 2 }
    })
    .await);

    let entries = gateway.telemetry.recent().await;
    assert!(entries.iter().all(|e| e.result == ExchangeResult::Success));
    assert_eq!(entries[1].bytes_in, "GET /api/status HTTP/1.1\r\nHost: gateway.local\r\n\r\n".len() as u64);
    assert!(entries[0].bytes_out > 0);
    // Loopback TTFB can round to 0 ms, which the average skips.
    let timed = entries.iter().filter(|e| e.ttfb_ms > 0).count();
    assert_eq!(gateway.telemetry.average().await.sample_count as usize, timed);

    tls.shutdown().await.unwrap();
    drop(tls);
    let stats = gateway.stats.clone();
    assert!(eventually(|| {
        let stats = stats.clone();
        async move { stats.snapshot().completed == 1 }
    })
    .await);
    // Nothing was left open when the client went away.
    assert_eq!(gateway.telemetry.recent().await.len(), 2);
}

#[tokio::test]
async fn backend_verified_against_configured_ca() {
    let backend = HttpsBackend::spawn("backend.local").await.unwrap();
    let (gateway, cert) = terminating_gateway(
        &backend,
        BackendVerification::CaPem(backend.cert.cert_pem.clone()),
    )
    .await;

    let mut tls = tls_client_connect(gateway.listen_addr, GATEWAY_NAME, &cert.cert_der)
        .await
        .unwrap();
    tls.write_all(b"GET /ok HTTP/1.1\r\n\r\n").await.unwrap();
    tls.flush().await.unwrap();
    assert!(read_response(&mut tls).await.unwrap().ends_with("{\"path\":\"/ok\"}"));
}

#[tokio::test]
async fn untrusted_backend_aborts_connection() {
    let backend = HttpsBackend::spawn("backend.local").await.unwrap();
    // A self-signed backend is not in the web PKI.
    let (gateway, cert) = terminating_gateway(&backend, BackendVerification::WebPki).await;

    let mut tls = tls_client_connect(gateway.listen_addr, GATEWAY_NAME, &cert.cert_der)
        .await
        .unwrap();
    let _ = tls.write_all(b"GET / HTTP/1.1\r\n\r\n").await;
    let _ = tls.flush().await;

    let mut buf = [0u8; 64];
    let read = tokio::time::timeout(Duration::from_secs(3), tls.read(&mut buf))
        .await
        .unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));

    let stats = gateway.stats.clone();
    assert!(eventually(|| {
        let stats = stats.clone();
        async move { stats.snapshot().errored == 1 }
    })
    .await);
    assert!(backend.recorded().await.is_empty());
    assert!(gateway.telemetry.recent().await.is_empty());
}
