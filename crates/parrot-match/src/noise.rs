//! Noise-tolerant response comparison.
//!
//! A test case carries dotted paths (`header.Date`, `body.data.ts`) whose
//! values change run to run. Comparison masks exactly those paths; removing
//! a path from the noise list makes the difference count again.

use parrot_model::HttpResp;
use serde_json::Value;

/// Compare a replayed response against the recorded one, ignoring values at
/// the given noise paths.
pub fn response_matches_with_noise(
    expected: &HttpResp,
    actual: &HttpResp,
    noise: &[String],
) -> bool {
    if expected.status_code != actual.status_code {
        return false;
    }

    let header_noise: Vec<&str> = noise
        .iter()
        .filter_map(|n| n.strip_prefix("header."))
        .collect();
    let noise_all_headers = noise.iter().any(|n| n == "header");
    if !noise_all_headers && !headers_match(expected, actual, &header_noise) {
        return false;
    }

    if noise.iter().any(|n| n == "body") {
        return true;
    }
    let body_noise: Vec<&str> = noise
        .iter()
        .filter_map(|n| n.strip_prefix("body."))
        .collect();
    bodies_match(expected, actual, &body_noise)
}

fn headers_match(expected: &HttpResp, actual: &HttpResp, noise: &[&str]) -> bool {
    let ignored = |key: &str| noise.iter().any(|n| n.eq_ignore_ascii_case(key));
    for (key, value) in &expected.header {
        if ignored(key) {
            continue;
        }
        let found = actual
            .header
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v);
        if found != Some(value) {
            return false;
        }
    }
    for key in actual.header.keys() {
        if ignored(key) {
            continue;
        }
        if !expected
            .header
            .keys()
            .any(|k| k.eq_ignore_ascii_case(key))
        {
            return false;
        }
    }
    true
}

fn bodies_match(expected: &HttpResp, actual: &HttpResp, noise: &[&str]) -> bool {
    let expected_bytes = expected.body.to_bytes().unwrap_or_default();
    let actual_bytes = actual.body.to_bytes().unwrap_or_default();

    let expected_json: Option<Value> = serde_json::from_slice(&expected_bytes).ok();
    let actual_json: Option<Value> = serde_json::from_slice(&actual_bytes).ok();

    match (expected_json, actual_json) {
        (Some(mut e), Some(mut a)) => {
            for path in noise {
                mask_path(&mut e, path);
                mask_path(&mut a, path);
            }
            e == a
        }
        // Non-JSON bodies only tolerate body-level noise, handled above.
        _ => expected_bytes == actual_bytes,
    }
}

/// Null out the value at a dotted path; arrays apply the remaining path to
/// each element.
fn mask_path(value: &mut Value, path: &str) {
    fn inner(value: &mut Value, segments: &[&str]) {
        let Some((head, rest)) = segments.split_first() else {
            return;
        };
        match value {
            Value::Object(map) => {
                if let Some(child) = map.get_mut(*head) {
                    if rest.is_empty() {
                        *child = Value::Null;
                    } else {
                        inner(child, rest);
                    }
                }
            }
            Value::Array(items) => {
                for item in items {
                    inner(item, segments);
                }
            }
            _ => {}
        }
    }
    let segments: Vec<&str> = path.split('.').collect();
    inner(value, &segments);
}

#[cfg(test)]
mod tests {
    use super::*;
    use parrot_model::Payload;
    use std::collections::BTreeMap;

    fn resp(body: &str, headers: &[(&str, &str)]) -> HttpResp {
        HttpResp {
            status_code: 200,
            status_message: "OK".into(),
            proto_major: 1,
            proto_minor: 1,
            header: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
            body: Payload::from_bytes(body.as_bytes()),
        }
    }

    #[test]
    fn noisy_body_path_is_ignored_and_required_when_removed() {
        let recorded = resp(r#"{"user":"a","ts":"2024-01-01T00:00:00Z"}"#, &[]);
        let replayed = resp(r#"{"user":"a","ts":"2024-06-30T12:00:00Z"}"#, &[]);

        let noise = vec!["body.ts".to_string()];
        assert!(response_matches_with_noise(&recorded, &replayed, &noise));
        // Same pair, path removed from noise: must no longer match.
        assert!(!response_matches_with_noise(&recorded, &replayed, &[]));
    }

    #[test]
    fn header_noise_is_case_insensitive() {
        let recorded = resp("{}", &[("Date", "Mon, 01 Jan 2024 00:00:00 GMT")]);
        let replayed = resp("{}", &[("date", "Sun, 30 Jun 2024 12:00:00 GMT")]);
        let noise = vec!["header.date".to_string()];
        assert!(response_matches_with_noise(&recorded, &replayed, &noise));
        assert!(!response_matches_with_noise(&recorded, &replayed, &[]));
    }

    #[test]
    fn status_is_never_noise() {
        let mut replayed = resp("{}", &[]);
        replayed.status_code = 500;
        let recorded = resp("{}", &[]);
        let noise = vec!["body".to_string(), "header".to_string()];
        assert!(!response_matches_with_noise(&recorded, &replayed, &noise));
    }

    #[test]
    fn nested_and_array_paths() {
        let recorded = resp(r#"{"items":[{"id":1,"at":"x"},{"id":2,"at":"y"}]}"#, &[]);
        let replayed = resp(r#"{"items":[{"id":1,"at":"p"},{"id":2,"at":"q"}]}"#, &[]);
        let noise = vec!["body.items.at".to_string()];
        assert!(response_matches_with_noise(&recorded, &replayed, &noise));
        assert!(!response_matches_with_noise(&recorded, &replayed, &[]));
    }
}
