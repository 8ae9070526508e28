use std::collections::BTreeMap;

use parrot_mysql::PacketBundle;
use serde::{Deserialize, Serialize};

use crate::generic::GenericSpec;
use crate::http::HttpSpec;

/// A captured outbound call: one request/response exchange (HTTP), one
/// connection phase or command exchange (MySQL), or one whole connection
/// (generic). Immutable once emitted by the recorder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mock {
    pub version: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    /// Unix seconds at capture time.
    pub created: i64,
    pub spec: MockSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum MockSpec {
    #[serde(rename = "Http")]
    Http(HttpSpec),
    #[serde(rename = "MySQL")]
    MySql(MySqlSpec),
    #[serde(rename = "Generic")]
    Generic(GenericSpec),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockKind {
    Http,
    MySql,
    Generic,
}

impl std::fmt::Display for MockKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MockKind::Http => write!(f, "Http"),
            MockKind::MySql => write!(f, "MySQL"),
            MockKind::Generic => write!(f, "Generic"),
        }
    }
}

impl Mock {
    pub fn kind(&self) -> MockKind {
        match &self.spec {
            MockSpec::Http(_) => MockKind::Http,
            MockSpec::MySql(_) => MockKind::MySql,
            MockSpec::Generic(_) => MockKind::Generic,
        }
    }

    pub fn as_http(&self) -> Option<&HttpSpec> {
        match &self.spec {
            MockSpec::Http(spec) => Some(spec),
            _ => None,
        }
    }

    pub fn as_mysql(&self) -> Option<&MySqlSpec> {
        match &self.spec {
            MockSpec::MySql(spec) => Some(spec),
            _ => None,
        }
    }

    pub fn as_generic(&self) -> Option<&GenericSpec> {
        match &self.spec {
            MockSpec::Generic(spec) => Some(spec),
            _ => None,
        }
    }
}

/// MySQL exchange: the request-side and response-side packet bundles of one
/// handshake or one command, in wire order with their recorded headers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MySqlSpec {
    pub requests: Vec<PacketBundle>,
    pub responses: Vec<PacketBundle>,
}
