use std::collections::BTreeSet;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Where a handler should dial in record mode, resolved per connection by
/// the listener from the redirector's lookup. In replay mode no data moves
/// through it, but handlers may still need the address to echo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DstCfg {
    pub addr: SocketAddr,
    /// TLS server name when the upstream leg must be TLS. `None` means a
    /// plaintext upstream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
}

/// Per-session options recognized by the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingOptions {
    /// Command-phase idle deadline factor: MySQL reads time out after
    /// `2s * sql_delay`.
    pub sql_delay: u64,
    /// MySQL only: on a replay miss, proxy the command to the real upstream
    /// instead of failing the connection.
    pub fallback_on_miss: bool,
    /// Upstream ports whose connections bypass interception entirely.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub passthrough_ports: BTreeSet<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst_cfg: Option<DstCfg>,
}

impl Default for OutgoingOptions {
    fn default() -> Self {
        Self {
            sql_delay: 5,
            fallback_on_miss: false,
            passthrough_ports: BTreeSet::new(),
            dst_cfg: None,
        }
    }
}
