//! Shared artifact model for the parrot capture/replay engine.
//!
//! Everything that crosses a crate boundary lives here: captured mocks and
//! test cases, the redirected-destination address record, per-session
//! options, and the stop-reason taxonomy the orchestrator reports.

pub mod addr;
pub mod error;
pub mod generic;
pub mod http;
pub mod mock;
pub mod opts;
pub mod payload;
pub mod testcase;

pub use addr::NetworkAddress;
pub use error::{AppError, AppErrorKind};
pub use generic::{Direction, GenericFrame, GenericSpec};
pub use http::{HeaderMap, HttpReq, HttpResp, HttpSpec};
pub use mock::{Mock, MockKind, MockSpec, MySqlSpec};
pub use opts::{DstCfg, OutgoingOptions};
pub use payload::{Payload, PayloadEncoding};
pub use testcase::TestCase;

use serde::{Deserialize, Serialize};

/// Artifact schema version stamped on every emitted mock and test case.
pub const API_VERSION: &str = "parrot.io/v1beta1";

/// Session mode: `Record` relays to the real destination and captures both
/// sides; `Test` answers from the mock store and never dials upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    Record,
    Test,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Record => write!(f, "record"),
            Mode::Test => write!(f, "test"),
        }
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "record" => Ok(Mode::Record),
            "test" | "replay" => Ok(Mode::Test),
            other => Err(format!("unknown mode {other:?} (expected record|test)")),
        }
    }
}
