use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::payload::Payload;

/// Header map with multi-values folded into a single comma-joined value,
/// matching how the capture pipeline stores them.
pub type HeaderMap = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpReq {
    pub method: String,
    pub proto_major: u8,
    pub proto_minor: u8,
    /// Full URL as the client sent it (origin-form path for plain proxying,
    /// scheme://host/path once the Host header is folded in).
    pub url: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub url_params: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub header: HeaderMap,
    #[serde(default, skip_serializing_if = "Payload::is_empty")]
    pub body: Payload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResp {
    pub status_code: u16,
    pub status_message: String,
    pub proto_major: u8,
    pub proto_minor: u8,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub header: HeaderMap,
    /// Body after transparent content-decoding (gzip is undone for capture;
    /// the original bytes still reached the client).
    #[serde(default, skip_serializing_if = "Payload::is_empty")]
    pub body: Payload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpSpec {
    pub req: HttpReq,
    pub resp: HttpResp,
    /// Human-readable reconstruction of the request.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub curl: String,
}

impl HttpReq {
    /// Path component of `url`, without query string.
    pub fn path(&self) -> &str {
        let rest = match self.url.find("://") {
            Some(idx) => {
                let after = &self.url[idx + 3..];
                match after.find('/') {
                    Some(slash) => &after[slash..],
                    None => "/",
                }
            }
            None => self.url.as_str(),
        };
        match rest.find('?') {
            Some(q) => &rest[..q],
            None => rest,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn req(url: &str) -> HttpReq {
        HttpReq {
            method: "GET".into(),
            proto_major: 1,
            proto_minor: 1,
            url: url.into(),
            url_params: BTreeMap::new(),
            header: HeaderMap::new(),
            body: Payload::empty(),
        }
    }

    #[test]
    fn path_extraction() {
        assert_eq!(req("/ping").path(), "/ping");
        assert_eq!(req("/ping?x=1").path(), "/ping");
        assert_eq!(req("http://svc/ping").path(), "/ping");
        assert_eq!(req("http://svc/ping?x=1&y=2").path(), "/ping");
        assert_eq!(req("http://svc").path(), "/");
    }
}
