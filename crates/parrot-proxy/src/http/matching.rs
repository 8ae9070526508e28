//! HTTP request-to-mock matching: structural pre-filter, JSON schema
//! layer, fuzzy fallback. At most one mock is selected and consumed.

use std::collections::BTreeSet;
use std::sync::Arc;

use parrot_match::{adaptive_k, is_ascii_printable, jaccard_similarity, levenshtein, shingles, MockStore};
use parrot_model::{HttpSpec, Mock, MockKind};
use tracing::debug;

pub struct MatchParams<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub header_keys: BTreeSet<String>,
    pub query_keys: BTreeSet<String>,
    pub body: &'a [u8],
}

impl MatchParams<'_> {
    fn body_is_json(&self) -> bool {
        serde_json::from_slice::<serde_json::Value>(self.body).is_ok()
    }
}

/// Select and consume one HTTP mock for the request, or `None` when the
/// structural layer leaves nothing. A lost delete race retries against a
/// fresh snapshot.
pub fn match_request(params: &MatchParams<'_>, store: &dyn MockStore) -> Option<Arc<Mock>> {
    let req_is_json = params.body_is_json();

    loop {
        let snapshot = store.list_filtered();
        let eligible: Vec<(Arc<Mock>, &HttpSpec)> = snapshot
            .iter()
            .filter(|m| m.kind() == MockKind::Http)
            .filter_map(|m| m.as_http().map(|spec| (Arc::clone(m), spec)))
            .filter(|(_, spec)| structural_eq(params, spec, req_is_json))
            .collect();

        if eligible.is_empty() {
            return None;
        }

        // Schema layer: JSON bodies match by top-level key shape.
        if req_is_json {
            if let Ok(req_json) =
                serde_json::from_slice::<serde_json::Value>(params.body)
            {
                for (mock, spec) in &eligible {
                    if schema_match(spec, &req_json) {
                        if store.delete_filtered(mock) {
                            debug!(mock = %mock.name, "schema match");
                            return Some(Arc::clone(mock));
                        }
                        // Lost the race; start over with a fresh snapshot.
                        continue;
                    }
                }
            }
        }

        let (winner, _) = fuzzy_pick(&eligible, params.body);
        if store.delete_filtered(&winner) {
            debug!(mock = %winner.name, "fuzzy match");
            return Some(winner);
        }
        // Another matcher consumed our pick; retry.
    }
}

fn structural_eq(params: &MatchParams<'_>, spec: &HttpSpec, req_is_json: bool) -> bool {
    if spec.req.method != params.method {
        return false;
    }
    if spec.req.path() != params.path {
        return false;
    }

    let mock_body = spec.req.body.to_bytes().unwrap_or_default();
    let mock_is_json = serde_json::from_slice::<serde_json::Value>(&mock_body).is_ok();
    if mock_is_json != req_is_json {
        return false;
    }

    let mock_header_keys: BTreeSet<String> = spec
        .req
        .header
        .keys()
        .map(|k| k.to_ascii_lowercase())
        .collect();
    if mock_header_keys != params.header_keys {
        return false;
    }

    let mock_query_keys: BTreeSet<String> = spec.req.url_params.keys().cloned().collect();
    mock_query_keys == params.query_keys
}

/// Every top-level key of the mock's body must exist in the request body;
/// values are not compared.
fn schema_match(spec: &HttpSpec, req_json: &serde_json::Value) -> bool {
    let mock_body = spec.req.body.to_bytes().unwrap_or_default();
    let Ok(mock_json) = serde_json::from_slice::<serde_json::Value>(&mock_body) else {
        return false;
    };
    match (mock_json.as_object(), req_json.as_object()) {
        (Some(mock_map), Some(req_map)) => mock_map.keys().all(|k| req_map.contains_key(k)),
        _ => false,
    }
}

/// Exact bytes win; then Levenshtein for printable-ASCII bodies; Jaccard
/// over adaptive k-shingles otherwise. Always yields a winner.
fn fuzzy_pick(
    eligible: &[(Arc<Mock>, &HttpSpec)],
    req_body: &[u8],
) -> (Arc<Mock>, f64) {
    for (mock, spec) in eligible {
        let mock_body = spec.req.body.to_bytes().unwrap_or_default();
        if mock_body == req_body {
            return (Arc::clone(mock), 1.0);
        }
    }

    if is_ascii_printable(req_body) {
        let mut best: Option<(usize, &Arc<Mock>)> = None;
        for (mock, spec) in eligible {
            let mock_body = spec.req.body.to_bytes().unwrap_or_default();
            if !is_ascii_printable(&mock_body) {
                continue;
            }
            let dist = levenshtein(req_body, &mock_body);
            if best.map_or(true, |(b, _)| dist < b) {
                best = Some((dist, mock));
            }
        }
        if let Some((dist, mock)) = best {
            return (Arc::clone(mock), 1.0 / (1.0 + dist as f64));
        }
    }

    let k = adaptive_k(req_body.len(), 3, 8, 5);
    let req_shingles = shingles(req_body, k);
    let mut best_idx = 0;
    let mut best_sim = -1.0;
    for (idx, (_, spec)) in eligible.iter().enumerate() {
        let mock_body = spec.req.body.to_bytes().unwrap_or_default();
        let sim = jaccard_similarity(&req_shingles, &shingles(&mock_body, k));
        if sim > best_sim {
            best_sim = sim;
            best_idx = idx;
        }
    }
    (Arc::clone(&eligible[best_idx].0), best_sim)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parrot_match::InMemoryMockStore;
    use parrot_model::{HttpReq, HttpResp, MockSpec, Payload};
    use std::collections::BTreeMap;

    fn http_mock(name: &str, method: &str, url: &str, body: &[u8]) -> Mock {
        Mock {
            version: parrot_model::API_VERSION.to_string(),
            name: name.into(),
            metadata: BTreeMap::new(),
            created: 0,
            spec: MockSpec::Http(HttpSpec {
                req: HttpReq {
                    method: method.into(),
                    proto_major: 1,
                    proto_minor: 1,
                    url: url.into(),
                    url_params: BTreeMap::new(),
                    header: BTreeMap::new(),
                    body: Payload::from_bytes(body),
                },
                resp: HttpResp {
                    status_code: 200,
                    status_message: "OK".into(),
                    proto_major: 1,
                    proto_minor: 1,
                    header: BTreeMap::new(),
                    body: Payload::from_bytes(b"ok"),
                },
                curl: String::new(),
            }),
        }
    }

    fn params<'a>(method: &'a str, path: &'a str, body: &'a [u8]) -> MatchParams<'a> {
        MatchParams {
            method,
            path,
            header_keys: BTreeSet::new(),
            query_keys: BTreeSet::new(),
            body,
        }
    }

    #[test]
    fn structural_mismatch_is_no_match() {
        let store = InMemoryMockStore::new();
        store.insert_filtered(http_mock("m", "GET", "http://svc/ping", b""));

        assert!(match_request(&params("POST", "/ping", b""), &store).is_none());
        assert!(match_request(&params("GET", "/other", b""), &store).is_none());
        // The mock is still there.
        assert_eq!(store.list_filtered().len(), 1);
    }

    #[test]
    fn exact_match_consumes_the_mock() {
        let store = InMemoryMockStore::new();
        store.insert_filtered(http_mock("m", "GET", "http://svc/ping", b""));

        let hit = match_request(&params("GET", "/ping", b""), &store).unwrap();
        assert_eq!(hit.name, "m");
        assert!(store.list_filtered().is_empty());
        assert!(match_request(&params("GET", "/ping", b""), &store).is_none());
    }

    #[test]
    fn schema_layer_picks_key_subset() {
        let store = InMemoryMockStore::new();
        store.insert_filtered(http_mock("a", "POST", "http://svc/u", br#"{"user":"a"}"#));
        store.insert_filtered(http_mock(
            "b",
            "POST",
            "http://svc/u",
            br#"{"user":"b","opt":1}"#,
        ));

        // {"user":"x"} matches mock "a": its keys are a subset.
        let hit = match_request(&params("POST", "/u", br#"{"user":"x"}"#), &store).unwrap();
        assert_eq!(hit.name, "a");
        assert_eq!(store.list_filtered().len(), 1);
    }

    #[test]
    fn levenshtein_breaks_ties_for_text() {
        let store = InMemoryMockStore::new();
        store.insert_filtered(http_mock("near", "POST", "http://svc/t", b"hello worlx"));
        store.insert_filtered(http_mock("far", "POST", "http://svc/t", b"zzzzzzzzzzz"));

        let hit = match_request(&params("POST", "/t", b"hello world"), &store).unwrap();
        assert_eq!(hit.name, "near");
    }

    #[test]
    fn binary_bodies_fall_back_to_jaccard() {
        let near: Vec<u8> = (0u8..32).collect();
        let mut near_tweaked = near.clone();
        near_tweaked[31] = 0xff;
        let far: Vec<u8> = (128u8..160).collect();

        let store = InMemoryMockStore::new();
        store.insert_filtered(http_mock("near", "POST", "http://svc/b", &near_tweaked));
        store.insert_filtered(http_mock("far", "POST", "http://svc/b", &far));

        let hit = match_request(&params("POST", "/b", &near), &store).unwrap();
        assert_eq!(hit.name, "near");
    }

    #[test]
    fn concurrent_matchers_get_at_most_one_each() {
        use std::sync::Arc as StdArc;
        let store = StdArc::new(InMemoryMockStore::new());
        store.insert_filtered(http_mock("only", "GET", "http://svc/race", b""));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = StdArc::clone(&store);
            handles.push(std::thread::spawn(move || {
                match_request(&params("GET", "/race", b""), store.as_ref()).is_some()
            }));
        }
        let wins = handles
            .into_iter()
            .map(|h| usize::from(h.join().unwrap()))
            .sum::<usize>();
        assert_eq!(wins, 1);
        assert!(store.list_filtered().is_empty());
    }
}
