//! MySQL handler. Server speaks first, so record mode opens upstream before
//! touching the client; replay serves the whole connection — handshake
//! included — from mocks.

pub mod io;
pub mod matching;
mod record;
mod replay;

pub use record::record;
pub use replay::replay;

use parrot_match::MockStore;
use parrot_model::MockKind;

/// Metadata marker distinguishing reusable connection-phase mocks from
/// single-use command mocks.
pub const CONFIG_MOCK_TYPE: &str = "config";

/// Replay classification: a server-speaks-first connection is MySQL iff a
/// handshake template is loaded.
pub fn has_handshake_mock(store: &dyn MockStore) -> bool {
    store
        .list_unfiltered()
        .iter()
        .any(|m| m.kind() == MockKind::MySql)
}
