//! Noise-candidate detection: response values that look like timestamps
//! will differ on every run, so the recorder tags their dotted paths for
//! the comparison layer to ignore.

use serde_json::Value;

use parrot_model::HttpResp;

/// Headers whose values are timestamps by definition.
const DATED_HEADERS: &[&str] = &["date", "expires", "last-modified", "retry-after", "age"];

pub fn detect_noise_fields(resp: &HttpResp) -> Vec<String> {
    let mut noise = Vec::new();

    for (key, value) in &resp.header {
        let lower = key.to_ascii_lowercase();
        if DATED_HEADERS.contains(&lower.as_str()) || looks_like_timestamp(value) {
            noise.push(format!("header.{key}"));
        }
    }

    if let Some(bytes) = resp.body.to_bytes() {
        if let Ok(json) = serde_json::from_slice::<Value>(&bytes) {
            walk(&json, "body", &mut noise);
        }
    }

    noise
}

fn walk(value: &Value, path: &str, noise: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                walk(child, &format!("{path}.{key}"), noise);
            }
        }
        Value::Array(items) => {
            // One tag covers the whole column; the masker applies the
            // remaining path to every element.
            if let Some(first) = items.first() {
                walk(first, path, noise);
            }
        }
        Value::String(text) => {
            if looks_like_timestamp(text) && !noise.iter().any(|n| n == path) {
                noise.push(path.to_string());
            }
        }
        _ => {}
    }
}

/// RFC3339, RFC2822, and the common date/datetime shapes.
pub fn looks_like_timestamp(text: &str) -> bool {
    let text = text.trim();
    if text.len() < 8 || text.len() > 40 {
        return false;
    }
    if chrono::DateTime::parse_from_rfc3339(text).is_ok() {
        return true;
    }
    if chrono::DateTime::parse_from_rfc2822(text).is_ok() {
        return true;
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if chrono::NaiveDateTime::parse_from_str(text, format).is_ok() {
            return true;
        }
    }
    chrono::NaiveDate::parse_from_str(text, "%Y-%m-%d").is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use parrot_model::Payload;
    use std::collections::BTreeMap;

    #[test]
    fn timestamp_shapes() {
        assert!(looks_like_timestamp("2024-06-30T12:00:00Z"));
        assert!(looks_like_timestamp("2024-06-30T12:00:00+02:00"));
        assert!(looks_like_timestamp("Sun, 30 Jun 2024 12:00:00 GMT"));
        assert!(looks_like_timestamp("2024-06-30 12:00:00"));
        assert!(looks_like_timestamp("2024-06-30"));
        assert!(!looks_like_timestamp("pong"));
        assert!(!looks_like_timestamp("12345"));
        assert!(!looks_like_timestamp("not 2024 a date"));
    }

    #[test]
    fn detects_header_and_body_paths() {
        let resp = HttpResp {
            status_code: 200,
            status_message: "OK".into(),
            proto_major: 1,
            proto_minor: 1,
            header: BTreeMap::from([
                ("Date".to_string(), "Sun, 30 Jun 2024 12:00:00 GMT".to_string()),
                ("Content-Type".to_string(), "application/json".to_string()),
            ]),
            body: Payload::from_bytes(
                br#"{"id":7,"created_at":"2024-06-30T12:00:00Z","nested":{"seen":"2024-06-29"},"items":[{"ts":"2024-06-30T00:00:00Z"}]}"#,
            ),
        };
        let noise = detect_noise_fields(&resp);
        assert!(noise.contains(&"header.Date".to_string()));
        assert!(noise.contains(&"body.created_at".to_string()));
        assert!(noise.contains(&"body.nested.seen".to_string()));
        assert!(noise.contains(&"body.items.ts".to_string()));
        assert!(!noise.iter().any(|n| n == "body.id"));
        assert!(!noise.iter().any(|n| n.contains("Content-Type")));
    }
}
