//! Full listener path over loopback: redirect-table lookup, protocol
//! sniffing, replay dispatch, and entry release on close.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parrot_match::{InMemoryMockStore, MockStore};
use parrot_model::{
    HttpReq, HttpResp, HttpSpec, Mock, MockSpec, Mode, OutgoingOptions, Payload,
};
use parrot_proxy::{Proxy, ProxyConfig, Session, Sessions};
use parrot_redirect::RedirectTable;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpSocket;
use tokio_util::sync::CancellationToken;

fn ping_mock() -> Mock {
    Mock {
        version: parrot_model::API_VERSION.to_string(),
        name: "mock-ping".into(),
        metadata: BTreeMap::new(),
        created: 0,
        spec: MockSpec::Http(HttpSpec {
            req: HttpReq {
                method: "GET".into(),
                proto_major: 1,
                proto_minor: 1,
                url: "http://svc/ping".into(),
                url_params: BTreeMap::new(),
                header: BTreeMap::from([("Host".to_string(), "svc".to_string())]),
                body: Payload::empty(),
            },
            resp: HttpResp {
                status_code: 200,
                status_message: "OK".into(),
                proto_major: 1,
                proto_minor: 1,
                header: BTreeMap::new(),
                body: Payload::from_bytes(b"pong"),
            },
            curl: String::new(),
        }),
    }
}

#[tokio::test]
async fn replayed_connection_via_listener_releases_its_entry() {
    let store = Arc::new(InMemoryMockStore::new());
    store.insert_filtered(ping_mock());

    let sessions = Arc::new(Sessions::new());
    let table = Arc::new(RedirectTable::new());
    let token = CancellationToken::new();
    sessions.register(Arc::new(Session {
        id: 7,
        mode: Mode::Test,
        store,
        mock_tx: None,
        testcase_tx: None,
        opts: OutgoingOptions::default(),
        token: token.clone(),
    }));

    let mut cfg = ProxyConfig::default();
    cfg.listen_addr = "127.0.0.1:0".parse().unwrap();
    let proxy = Proxy::start(cfg, Arc::clone(&sessions), Arc::clone(&table))
        .await
        .unwrap();
    let proxy_addr = proxy.local_addr();

    // Pre-bind so the source port is known before the proxy sees the
    // connection, the way the tracer publishes entries on connect exit.
    let socket = TcpSocket::new_v4().unwrap();
    socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let src_port = socket.local_addr().unwrap().port();
    table.insert(
        src_port,
        7,
        "10.0.0.9".parse().unwrap(),
        80,
    );

    let mut client = socket.connect(proxy_addr).await.unwrap();
    client
        .write_all(b"GET /ping HTTP/1.1\r\nHost: svc\r\n\r\n")
        .await
        .unwrap();

    let mut response = vec![0u8; 1024];
    let n = client.read(&mut response).await.unwrap();
    let text = String::from_utf8_lossy(&response[..n]);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "got: {text}");
    assert!(text.contains("pong"));

    drop(client);

    // Close path must release the redirect entry.
    let mut released = false;
    for _ in 0..50 {
        if table.is_empty() {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(released, "redirect entry leaked after connection close");

    proxy.shutdown().await;
}

#[tokio::test]
async fn unredirected_connection_is_closed() {
    let sessions = Arc::new(Sessions::new());
    let table = Arc::new(RedirectTable::new());

    let mut cfg = ProxyConfig::default();
    cfg.listen_addr = "127.0.0.1:0".parse().unwrap();
    let proxy = Proxy::start(cfg, sessions, table).await.unwrap();

    // No table entry for this source port: hard close.
    let mut client = tokio::net::TcpStream::connect(proxy.local_addr())
        .await
        .unwrap();
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .expect("proxy must close unredirected connections promptly")
        .unwrap_or(0);
    assert_eq!(n, 0, "no bytes are served to unknown connections");

    proxy.shutdown().await;
}
