use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use parrot_match::MockStore;
use parrot_model::{Mock, Mode, OutgoingOptions, TestCase};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One instrumented application instance. Sessions are mutually
/// independent and outlive individual connections.
pub struct Session {
    pub id: u64,
    pub mode: Mode,
    pub store: Arc<dyn MockStore>,
    /// Captured outbound calls (record mode).
    pub mock_tx: Option<mpsc::Sender<Mock>>,
    /// Captured inbound calls (record mode).
    pub testcase_tx: Option<mpsc::Sender<TestCase>>,
    pub opts: OutgoingOptions,
    /// Root of the cancellation tree; every connection handler works under
    /// a child of this token.
    pub token: CancellationToken,
}

impl Session {
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }
}

/// Registry keyed by application id. One writer per id; lookups happen on
/// every accepted connection.
#[derive(Default)]
pub struct Sessions {
    inner: RwLock<HashMap<u64, Arc<Session>>>,
}

impl Sessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session: Arc<Session>) {
        self.inner
            .write()
            .expect("session registry poisoned")
            .insert(session.id, session);
    }

    pub fn get(&self, id: u64) -> Option<Arc<Session>> {
        self.inner
            .read()
            .expect("session registry poisoned")
            .get(&id)
            .cloned()
    }

    pub fn remove(&self, id: u64) -> Option<Arc<Session>> {
        self.inner
            .write()
            .expect("session registry poisoned")
            .remove(&id)
    }
}
