//! End-to-end HTTP replay over in-memory streams: the handler answers from
//! the store, never dialing upstream.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parrot_match::{InMemoryMockStore, MockStore};
use parrot_model::{
    HttpReq, HttpResp, HttpSpec, Mock, MockSpec, Mode, OutgoingOptions, Payload,
};
use parrot_proxy::{http, ProxyConfig, Session};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

fn ping_mock(name: &str, body: &str) -> Mock {
    Mock {
        version: parrot_model::API_VERSION.to_string(),
        name: name.into(),
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
                header: BTreeMap::from([(
                    "Content-Type".to_string(),
                    "text/plain".to_string(),
                )]),
                body: Payload::from_bytes(body.as_bytes()),
            },
            curl: String::new(),
        }),
    }
}

fn session(store: Arc<InMemoryMockStore>) -> Arc<Session> {
    Arc::new(Session {
        id: 0,
        mode: Mode::Test,
        store,
        mock_tx: None,
        testcase_tx: None,
        opts: OutgoingOptions::default(),
        token: CancellationToken::new(),
    })
}

fn dest() -> SocketAddr {
    "10.0.0.9:80".parse().unwrap()
}

async fn drive_replay(
    store: Arc<InMemoryMockStore>,
    request: &'static [u8],
) -> Vec<u8> {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let session = session(store);
    let cfg = ProxyConfig::default();
    let token = session.token.clone();

    let handler = tokio::spawn(async move {
        let _ = http::replay(server_io, dest(), None, &session, &token, &cfg, None).await;
    });

    let mut client = client_io;
    client.write_all(request).await.unwrap();
    client.flush().await.unwrap();

    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = client.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
        // One response per test request; stop once the body arrived.
        if let Some(head_end) = out.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&out[..head_end]);
            if let Some(len) = head
                .lines()
                .find_map(|l| l.strip_prefix("Content-Length: "))
                .and_then(|v| v.trim().parse::<usize>().ok())
            {
                if out.len() >= head_end + 4 + len {
                    break;
                }
            }
        }
    }
    drop(client);
    let _ = handler.await;
    out
}

#[tokio::test]
async fn recorded_get_is_served_and_consumed() {
    let store = Arc::new(InMemoryMockStore::new());
    store.insert_filtered(ping_mock("mock-0", "pong"));

    let wire = drive_replay(
        Arc::clone(&store),
        b"GET /ping HTTP/1.1\r\nHost: svc\r\n\r\n",
    )
    .await;

    let text = String::from_utf8_lossy(&wire);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "got: {text}");
    let body = &text[text.find("\r\n\r\n").unwrap() + 4..];
    assert!(body.contains("pong"));
    assert!(store.list_filtered().is_empty(), "mock must be consumed");
}

#[tokio::test]
async fn miss_gets_a_bodyless_502() {
    let store = Arc::new(InMemoryMockStore::new());
    store.insert_filtered(ping_mock("mock-0", "pong"));

    // Different path: structural layer leaves nothing.
    let wire = drive_replay(
        Arc::clone(&store),
        b"GET /health HTTP/1.1\r\nHost: svc\r\n\r\n",
    )
    .await;

    let text = String::from_utf8_lossy(&wire);
    assert!(text.starts_with("HTTP/1.1 502 Bad Gateway\r\n"), "got: {text}");
    assert!(text.contains("Content-Length: 0"));
    assert_eq!(store.list_filtered().len(), 1, "mock must survive a miss");
}

#[tokio::test]
async fn schema_match_prefers_key_subset() {
    let store = Arc::new(InMemoryMockStore::new());

    let mut a = ping_mock("subset", "a");
    if let MockSpec::Http(spec) = &mut a.spec {
        spec.req.method = "POST".into();
        spec.req.url = "http://svc/users".into();
        spec.req.header.insert("Content-Type".into(), "application/json".into());
        spec.req.header.insert("Content-Length".into(), "12".into());
        spec.req.body = Payload::from_bytes(br#"{"user":"a"}"#);
    }
    let mut b = ping_mock("superset", "b");
    if let MockSpec::Http(spec) = &mut b.spec {
        spec.req.method = "POST".into();
        spec.req.url = "http://svc/users".into();
        spec.req.header.insert("Content-Type".into(), "application/json".into());
        spec.req.header.insert("Content-Length".into(), "20".into());
        spec.req.body = Payload::from_bytes(br#"{"user":"b","opt":1}"#);
    }
    store.insert_filtered(a);
    store.insert_filtered(b);

    let wire = drive_replay(
        Arc::clone(&store),
        b"POST /users HTTP/1.1\r\nHost: svc\r\nContent-Type: application/json\r\nContent-Length: 12\r\n\r\n{\"user\":\"x\"}",
    )
    .await;

    let text = String::from_utf8_lossy(&wire);
    let body = &text[text.find("\r\n\r\n").unwrap() + 4..];
    assert!(body.contains('a'), "schema layer must pick the subset mock");
    let remaining = store.list_filtered();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].name, "superset");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_mock_thirty_two_racers() {
    let store = Arc::new(InMemoryMockStore::new());
    store.insert_filtered(ping_mock("contested", "pong"));

    let mut handles = Vec::new();
    for _ in 0..32 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            let wire =
                drive_replay(store, b"GET /ping HTTP/1.1\r\nHost: svc\r\n\r\n").await;
            let text = String::from_utf8_lossy(&wire);
            text.starts_with("HTTP/1.1 200")
        }));
    }

    let mut successes = 0;
    let mut misses = 0;
    for handle in handles {
        if handle.await.unwrap() {
            successes += 1;
        } else {
            misses += 1;
        }
    }
    assert_eq!(successes, 1, "exactly one racer may win the mock");
    assert_eq!(misses, 31);
    assert!(store.list_filtered().is_empty());
}
