//! Inbound capture: the ingress reverse proxy forwards to the app and
//! emits test cases with detected noise.

use std::sync::Arc;

use parrot_match::InMemoryMockStore;
use parrot_model::{Mode, OutgoingOptions};
use parrot_proxy::orchestrator::ingress;
use parrot_proxy::{ProxyConfig, Session};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn captures_one_test_case_per_exchange() {
    // The "application": answers a fixed JSON body with a timestamp field.
    let app_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let app_addr = app_listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut conn, _)) = app_listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let n = conn.read(&mut buf).await.unwrap_or(0);
                if n == 0 {
                    return;
                }
                let body = br#"{"status":"ok","at":"2024-06-30T12:00:00Z"}"#;
                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = conn.write_all(head.as_bytes()).await;
                let _ = conn.write_all(body).await;
            });
        }
    });

    let (tc_tx, mut tc_rx) = mpsc::channel(8);
    let session = Arc::new(Session {
        id: 0,
        mode: Mode::Record,
        store: Arc::new(InMemoryMockStore::new()),
        mock_tx: None,
        testcase_tx: Some(tc_tx),
        opts: OutgoingOptions::default(),
        token: CancellationToken::new(),
    });

    let handle = ingress::start(
        "127.0.0.1:0".parse().unwrap(),
        app_addr,
        Arc::clone(&session),
        ProxyConfig::default(),
    )
    .await
    .unwrap();
    let ingress_addr = handle.local_addr();

    // A caller hits the app through the capture proxy.
    let mut caller = TcpStream::connect(ingress_addr).await.unwrap();
    caller
        .write_all(b"GET /status HTTP/1.1\r\nHost: app\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    caller.read_to_end(&mut response).await.unwrap();
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 200 OK"));
    assert!(text.contains(r#""status":"ok""#));

    let tc = tc_rx.recv().await.expect("one test case captured");
    assert_eq!(tc.req.method, "GET");
    assert_eq!(tc.req.url, "http://app/status");
    assert_eq!(tc.resp.status_code, 200);
    assert!(
        tc.noise.contains(&"body.at".to_string()),
        "timestamp field must be tagged as noise, got {:?}",
        tc.noise
    );
    assert!(tc.curl.contains("curl --request GET"));

    handle.shutdown().await;
}
