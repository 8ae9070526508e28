//! HTTP handler: record forwards and captures full exchanges; replay
//! synthesizes responses from matched mocks without touching upstream.

pub mod curl;
pub mod matching;
pub mod noise;
pub mod parse;
mod record;
mod replay;

pub use record::record;
pub use replay::replay;

use std::collections::BTreeMap;
use std::io::{Read as _, Write as _};
use std::net::SocketAddr;

use parrot_model::{HeaderMap, HttpReq, Payload};

use self::parse::{header_value, RawRequest};

/// Fold repeated header names into one comma-joined value, as the artifact
/// format stores them.
pub(crate) fn fold_headers(headers: &[(String, String)]) -> HeaderMap {
    let mut out = BTreeMap::new();
    for (key, value) in headers {
        out.entry(key.clone())
            .and_modify(|existing: &mut String| {
                existing.push(',');
                existing.push_str(value);
            })
            .or_insert_with(|| value.clone());
    }
    out
}

pub(crate) fn parse_query(target: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    if let Some((_, query)) = target.split_once('?') {
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            out.insert(key.to_string(), value.to_string());
        }
    }
    out
}

/// Full request URL as captured: scheme from the TLS state, host from the
/// Host header (falling back to the original destination).
pub(crate) fn request_url(
    req: &RawRequest,
    dest: SocketAddr,
    tls_host: Option<&str>,
) -> String {
    if req.target.starts_with("http://") || req.target.starts_with("https://") {
        return req.target.clone();
    }
    let scheme = if tls_host.is_some() { "https" } else { "http" };
    let host = header_value(&req.headers, "Host")
        .map(str::to_string)
        .or_else(|| tls_host.map(str::to_string))
        .unwrap_or_else(|| dest.to_string());
    format!("{scheme}://{host}{}", req.target)
}

pub(crate) fn build_http_req(
    req: &RawRequest,
    dest: SocketAddr,
    tls_host: Option<&str>,
) -> HttpReq {
    HttpReq {
        method: req.method.clone(),
        proto_major: req.proto_major,
        proto_minor: req.proto_minor,
        url: request_url(req, dest, tls_host),
        url_params: parse_query(&req.target),
        header: fold_headers(&req.headers),
        body: Payload::from_bytes(&req.body),
    }
}

pub(crate) fn gzip_decode(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = flate2::read::GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

pub(crate) fn gzip_encode(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder =
        flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

/// `Connection: close` on either side ends the keep-alive loop.
pub(crate) fn wants_close(headers: &[(String, String)], proto_minor: u8) -> bool {
    match header_value(headers, "Connection") {
        Some(value) => value.eq_ignore_ascii_case("close"),
        None => proto_minor == 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn folds_repeated_headers() {
        let headers = vec![
            ("Set-Cookie".to_string(), "a=1".to_string()),
            ("Set-Cookie".to_string(), "b=2".to_string()),
            ("Host".to_string(), "svc".to_string()),
        ];
        let folded = fold_headers(&headers);
        assert_eq!(folded["Set-Cookie"], "a=1,b=2");
        assert_eq!(folded["Host"], "svc");
    }

    #[test]
    fn query_parsing() {
        let q = parse_query("/search?q=x&limit=10&flag");
        assert_eq!(q["q"], "x");
        assert_eq!(q["limit"], "10");
        assert_eq!(q["flag"], "");
        assert!(parse_query("/plain").is_empty());
    }

    #[test]
    fn gzip_roundtrip() {
        let original = b"pong pong pong pong";
        let packed = gzip_encode(original).unwrap();
        assert_ne!(packed, original.to_vec());
        assert_eq!(gzip_decode(&packed).unwrap(), original.to_vec());
    }

    #[test]
    fn close_semantics_by_version() {
        assert!(wants_close(&[], 0));
        assert!(!wants_close(&[], 1));
        assert!(wants_close(
            &[("Connection".to_string(), "close".to_string())],
            1
        ));
        assert!(!wants_close(
            &[("Connection".to_string(), "keep-alive".to_string())],
            0
        ));
    }
}
