//! End-to-end tests for HTTP/2 tunnel streams over loopback

use bytes::Bytes;
use dbtunnel_transport_h2::{
    H2Config, H2Connector, H2Listener, H2Request, TransportError, TunnelTarget,
};
use http::{Method, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn tunnel_request(target: &TunnelTarget) -> http::Request<()> {
    http::Request::builder()
        .method(Method::POST)
        .uri(target.uri().clone())
        .body(())
        .unwrap()
}

/// Serve one connection, handing each request to `handler`.
fn spawn_server<F>(listener: H2Listener, handler: F)
where
    F: Fn(H2Request) + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let incoming = listener.accept().await.unwrap();
        let mut conn = incoming.handshake().await.unwrap();
        while let Some(result) = conn.accept().await {
            match result {
                Ok(request) => handler(request),
                Err(_) => break,
            }
        }
    });
}

/// Accept the tunnel and echo every byte back on the response body.
fn echo_handler(request: H2Request) {
    assert_eq!(request.method(), Method::POST);
    let stream = request.accept().unwrap();
    tokio::spawn(async move {
        let (mut reader, mut writer) = stream.into_split();
        let mut buf = vec![0u8; 8192];
        loop {
            let n = reader.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n]).await.unwrap();
        }
        writer.shutdown().await.unwrap();
    });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_h2c_tunnel_echo() {
    init_tracing();

    let listener = H2Listener::new(
        "127.0.0.1:0".parse().unwrap(),
        Arc::new(H2Config::server_cleartext()),
    )
    .unwrap();
    let addr = listener.local_addr().unwrap();
    spawn_server(listener, echo_handler);

    let target = TunnelTarget::parse(&format!("http://{addr}/")).unwrap();
    let connector = H2Connector::new(Arc::new(H2Config::client_cleartext())).unwrap();
    let conn = connector.connect(&target).await.unwrap();
    let stream = conn.open_tunnel(tunnel_request(&target)).await.unwrap();
    let (mut reader, mut writer) = stream.into_split();

    // Larger than the default stream window so flow control has to kick in.
    let payload: Vec<u8> = (0..3 * 1024 * 1024u32).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();

    let write_task = tokio::spawn(async move {
        for chunk in payload.chunks(16 * 1024) {
            writer.write_all(chunk).await.unwrap();
        }
        writer.shutdown().await.unwrap();
    });

    let mut received = Vec::with_capacity(expected.len());
    tokio::time::timeout(Duration::from_secs(10), reader.read_to_end(&mut received))
        .await
        .expect("echo timed out")
        .unwrap();
    write_task.await.unwrap();

    assert_eq!(received.len(), expected.len());
    assert!(received == expected, "echoed bytes differ");
}

#[tokio::test]
async fn test_rejected_tunnel_returns_status() {
    init_tracing();

    let listener = H2Listener::new(
        "127.0.0.1:0".parse().unwrap(),
        Arc::new(H2Config::server_cleartext()),
    )
    .unwrap();
    let addr = listener.local_addr().unwrap();
    spawn_server(listener, |request| {
        request
            .reject(StatusCode::FORBIDDEN, Bytes::from_static(b"denied\n"))
            .unwrap();
    });

    let target = TunnelTarget::parse(&format!("http://{addr}/")).unwrap();
    let connector = H2Connector::new(Arc::new(H2Config::client_cleartext())).unwrap();
    let conn = connector.connect(&target).await.unwrap();

    let err = conn.open_tunnel(tunnel_request(&target)).await.unwrap_err();
    match err {
        TransportError::UnexpectedStatus(status) => assert_eq!(status, StatusCode::FORBIDDEN),
        other => panic!("expected UnexpectedStatus, got {other:?}"),
    }
}

#[tokio::test]
async fn test_server_sees_request_headers() {
    init_tracing();

    let listener = H2Listener::new(
        "127.0.0.1:0".parse().unwrap(),
        Arc::new(H2Config::server_cleartext()),
    )
    .unwrap();
    let addr = listener.local_addr().unwrap();

    let (tx, rx) = tokio::sync::oneshot::channel();
    let tx = std::sync::Mutex::new(Some(tx));
    spawn_server(listener, move |request| {
        let auth = request
            .headers()
            .get(http::header::AUTHORIZATION)
            .map(|v| v.to_str().unwrap().to_string());
        if let Some(tx) = tx.lock().unwrap().take() {
            let _ = tx.send((request.uri().path().to_string(), auth));
        }
        request.reject(StatusCode::NO_CONTENT, Bytes::new()).unwrap();
    });

    let target = TunnelTarget::parse(&format!("http://{addr}/db")).unwrap();
    let connector = H2Connector::new(Arc::new(H2Config::client_cleartext())).unwrap();
    let conn = connector.connect(&target).await.unwrap();

    let request = http::Request::builder()
        .method(Method::POST)
        .uri(target.uri().clone())
        .header(http::header::AUTHORIZATION, "Bearer abc")
        .body(())
        .unwrap();
    // 204 is a success status, so the tunnel opens and immediately ends.
    let stream = conn.open_tunnel(request).await.unwrap();
    let (mut reader, _writer) = stream.into_split();
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await.unwrap();
    assert!(buf.is_empty());

    let (path, auth) = rx.await.unwrap();
    assert_eq!(path, "/db");
    assert_eq!(auth.as_deref(), Some("Bearer abc"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tls_tunnel_with_private_root() {
    init_tracing();

    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let cert_path = dir.path().join("cert.pem");
    let key_path = dir.path().join("key.pem");
    std::fs::write(&cert_path, cert.pem()).unwrap();
    std::fs::write(&key_path, key_pair.serialize_pem()).unwrap();

    let listener = H2Listener::new(
        "127.0.0.1:0".parse().unwrap(),
        Arc::new(H2Config::server_tls(&cert_path, &key_path)),
    )
    .unwrap();
    let port = listener.local_addr().unwrap().port();
    spawn_server(listener, echo_handler);

    let target = TunnelTarget::parse(&format!("https://localhost:{port}/")).unwrap();
    let client_config = H2Config::client_default().with_root_cert(cert.der().to_vec());
    let connector = H2Connector::new(Arc::new(client_config)).unwrap();
    let conn = connector.connect(&target).await.unwrap();
    let stream = conn.open_tunnel(tunnel_request(&target)).await.unwrap();
    let (mut reader, mut writer) = stream.into_split();

    writer.write_all(b"SELECT 1;").await.unwrap();
    let mut buf = [0u8; 9];
    tokio::time::timeout(Duration::from_secs(5), reader.read_exact(&mut buf))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(&buf, b"SELECT 1;");
}

#[tokio::test]
async fn test_tls_client_rejects_unknown_certificate() {
    init_tracing();

    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let cert_path = dir.path().join("cert.pem");
    let key_path = dir.path().join("key.pem");
    std::fs::write(&cert_path, cert.pem()).unwrap();
    std::fs::write(&key_path, key_pair.serialize_pem()).unwrap();

    let listener = H2Listener::new(
        "127.0.0.1:0".parse().unwrap(),
        Arc::new(H2Config::server_tls(&cert_path, &key_path)),
    )
    .unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        if let Ok(incoming) = listener.accept().await {
            let _ = incoming.handshake().await;
        }
    });

    let target = TunnelTarget::parse(&format!("https://localhost:{port}/")).unwrap();
    let connector = H2Connector::new(Arc::new(H2Config::client_default())).unwrap();
    let err = connector.connect(&target).await.unwrap_err();
    assert!(matches!(err, TransportError::TlsError(_)));
}
