//! Human-readable curl reconstruction of a captured request.

use parrot_model::HttpReq;

pub fn to_curl(req: &HttpReq) -> String {
    let mut out = String::from("curl --request ");
    out.push_str(&req.method);
    out.push_str(" \\\n  --url ");
    out.push_str(&shell_quote(&req.url));
    for (key, value) in &req.header {
        // Hop-by-hop framing is curl's business, not the reader's.
        if key.eq_ignore_ascii_case("content-length") {
            continue;
        }
        out.push_str(" \\\n  --header ");
        out.push_str(&shell_quote(&format!("{key}: {value}")));
    }
    if !req.body.is_empty() {
        if let Some(bytes) = req.body.to_bytes() {
            if let Ok(text) = std::str::from_utf8(&bytes) {
                out.push_str(" \\\n  --data ");
                out.push_str(&shell_quote(text));
            }
        }
    }
    out
}

fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parrot_model::Payload;
    use std::collections::BTreeMap;

    #[test]
    fn curl_includes_method_url_headers_body() {
        let req = HttpReq {
            method: "POST".into(),
            proto_major: 1,
            proto_minor: 1,
            url: "http://svc/api".into(),
            url_params: BTreeMap::new(),
            header: BTreeMap::from([
                ("Content-Type".to_string(), "application/json".to_string()),
                ("Content-Length".to_string(), "13".to_string()),
            ]),
            body: Payload::from_bytes(br#"{"user":"it's"}"#),
        };
        let curl = to_curl(&req);
        assert!(curl.starts_with("curl --request POST"));
        assert!(curl.contains("--url 'http://svc/api'"));
        assert!(curl.contains("Content-Type: application/json"));
        assert!(!curl.contains("Content-Length"));
        assert!(curl.contains(r#"{"user":"it'\''s"}"#));
    }
}
