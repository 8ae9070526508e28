use serde::{Deserialize, Serialize};

use crate::http::{HttpReq, HttpResp};

/// A captured inbound call to the application under test. HTTP-shaped; the
/// `noise` paths mark response values that must be ignored when the replayed
/// response is compared against this record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub version: String,
    pub name: String,
    pub created: i64,
    pub req: HttpReq,
    pub resp: HttpResp,
    /// Dotted paths into the response (`header.Date`, `body.ts`) whose
    /// values differ run to run.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub noise: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub curl: String,
}
