//! Record a generic byte-stream exchange, then replay the captured mock to
//! a fresh client and compare what it sees.

use std::sync::Arc;

use parrot_match::{InMemoryMockStore, MockStore};
use parrot_model::{Mock, MockKind, Mode, OutgoingOptions};
use parrot_proxy::{generic, Session};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn record_session(mock_tx: mpsc::Sender<Mock>) -> Arc<Session> {
    Arc::new(Session {
        id: 0,
        mode: Mode::Record,
        store: Arc::new(InMemoryMockStore::new()),
        mock_tx: Some(mock_tx),
        testcase_tx: None,
        opts: OutgoingOptions::default(),
        token: CancellationToken::new(),
    })
}

fn replay_session(store: Arc<InMemoryMockStore>) -> Arc<Session> {
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

#[tokio::test]
async fn record_then_replay_byte_stream() {
    // ---- Record: app <-> scripted upstream.
    let (mock_tx, mut mock_rx) = mpsc::channel(8);
    let session = record_session(mock_tx);
    let token = session.token.clone();

    let (app_io, client_io) = tokio::io::duplex(4096);
    let (upstream_io, server_io) = tokio::io::duplex(4096);

    // The scripted dependency: expects "STATS\n", answers "42\n".
    let upstream_task = tokio::spawn(async move {
        let mut server = server_io;
        let mut buf = [0u8; 6];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"STATS\n");
        server.write_all(b"42\n").await.unwrap();
        server.flush().await.unwrap();
    });

    let record_task = tokio::spawn(async move {
        let _ = generic::record(client_io, upstream_io, &session, &token).await;
    });

    let mut app = app_io;
    app.write_all(b"STATS\n").await.unwrap();
    app.flush().await.unwrap();
    let mut answer = [0u8; 3];
    app.read_exact(&mut answer).await.unwrap();
    assert_eq!(&answer, b"42\n");
    drop(app);

    upstream_task.await.unwrap();
    record_task.await.unwrap();

    let mock = mock_rx.recv().await.expect("one generic mock captured");
    assert_eq!(mock.kind(), MockKind::Generic);
    let spec = mock.as_generic().unwrap();
    assert_eq!(spec.requests().count(), 1);
    assert_eq!(spec.responses().count(), 1);

    // ---- Replay against the captured mock; no upstream exists.
    let store = Arc::new(InMemoryMockStore::new());
    store.insert_filtered(mock);
    let session = replay_session(Arc::clone(&store));
    let token = session.token.clone();

    let (app_io, client_io) = tokio::io::duplex(4096);
    let replay_task = tokio::spawn(async move {
        let dest = "10.0.0.9:9999".parse().unwrap();
        let _ = generic::replay(client_io, dest, &session, &token).await;
    });

    let mut app = app_io;
    app.write_all(b"STATS\n").await.unwrap();
    app.flush().await.unwrap();
    let mut answer = [0u8; 3];
    app.read_exact(&mut answer).await.unwrap();
    assert_eq!(&answer, b"42\n");
    drop(app);

    replay_task.await.unwrap();
    assert!(store.list_filtered().is_empty(), "replay consumes the mock");
}

#[tokio::test]
async fn near_miss_uses_fuzzy_and_consumes_in_order() {
    use parrot_model::{Direction, GenericFrame, GenericSpec, MockSpec, Payload};
    use std::collections::BTreeMap;

    let frames = |req: &[u8], resp: &[u8]| GenericSpec {
        frames: vec![
            GenericFrame {
                direction: Direction::Client,
                payload: Payload::from_bytes(req),
                read_delay_ns: 0,
            },
            GenericFrame {
                direction: Direction::Server,
                payload: Payload::from_bytes(resp),
                read_delay_ns: 0,
            },
        ],
    };
    let mk = |name: &str, req: &[u8], resp: &[u8]| Mock {
        version: parrot_model::API_VERSION.to_string(),
        name: name.into(),
        metadata: BTreeMap::new(),
        created: 0,
        spec: MockSpec::Generic(frames(req, resp)),
    };

    // Binary requests differing by one byte.
    let base: Vec<u8> = vec![0x90, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11];
    let mut tweaked = base.clone();
    tweaked[11] = 0xee;

    let store = Arc::new(InMemoryMockStore::new());
    store.insert_filtered(mk("exact", &base, b"first"));
    store.insert_filtered(mk("close", &tweaked, b"second"));

    for expected in [b"first".as_slice(), b"second".as_slice()] {
        let session = replay_session(Arc::clone(&store));
        let token = session.token.clone();
        let (app_io, client_io) = tokio::io::duplex(4096);
        let request = base.clone();

        let replay_task = tokio::spawn(async move {
            let dest = "10.0.0.9:9999".parse().unwrap();
            let _ = generic::replay(client_io, dest, &session, &token).await;
        });

        let mut app = app_io;
        app.write_all(&request).await.unwrap();
        app.flush().await.unwrap();
        let mut answer = vec![0u8; expected.len()];
        app.read_exact(&mut answer).await.unwrap();
        assert_eq!(answer, expected.to_vec());
        drop(app);
        replay_task.await.unwrap();
    }

    assert!(store.list_filtered().is_empty());
}
