use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use parrot_model::{Mock, TestCase};

/// Per-session mock catalog.
///
/// "Filtered" mocks are single-use: a successful match consumes one.
/// "Unfiltered" mocks are reusable templates (handshakes, public keys) that
/// live until explicitly deleted. A mock is in one set or the other, never
/// both.
pub trait MockStore: Send + Sync {
    /// Snapshot of the consumable set. Mutation during iteration of the
    /// returned vector is fine; the snapshot does not change under you.
    fn list_filtered(&self) -> Vec<Arc<Mock>>;
    fn list_unfiltered(&self) -> Vec<Arc<Mock>>;
    /// Remove a specific mock; `true` means this caller removed it. Two
    /// racers on the same mock see exactly one `true`.
    fn delete_filtered(&self, mock: &Arc<Mock>) -> bool;
    fn delete_unfiltered(&self, mock: &Arc<Mock>) -> bool;
    fn insert_filtered(&self, mock: Mock);
    fn insert_unfiltered(&self, mock: Mock);
}

/// Store for captured inbound test cases, grouped into named test sets.
pub trait TestStore: Send + Sync {
    fn insert_test_case(&self, tc: TestCase, test_set_id: &str);
    fn list_all_test_set_ids(&self) -> Vec<String>;
    fn read_test_set(&self, test_set_id: &str) -> Vec<TestCase>;
}

/// The in-memory implementation every replay session uses; loaded from the
/// storage layer at session start.
#[derive(Debug, Default)]
pub struct InMemoryMockStore {
    filtered: Mutex<Vec<Arc<Mock>>>,
    unfiltered: Mutex<Vec<Arc<Mock>>>,
}

impl InMemoryMockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mocks(filtered: Vec<Mock>, unfiltered: Vec<Mock>) -> Self {
        Self {
            filtered: Mutex::new(filtered.into_iter().map(Arc::new).collect()),
            unfiltered: Mutex::new(unfiltered.into_iter().map(Arc::new).collect()),
        }
    }
}

fn delete_by_identity(set: &Mutex<Vec<Arc<Mock>>>, mock: &Arc<Mock>) -> bool {
    let mut set = set.lock().expect("mock store poisoned");
    match set.iter().position(|m| Arc::ptr_eq(m, mock)) {
        Some(idx) => {
            set.remove(idx);
            true
        }
        None => false,
    }
}

impl MockStore for InMemoryMockStore {
    fn list_filtered(&self) -> Vec<Arc<Mock>> {
        self.filtered.lock().expect("mock store poisoned").clone()
    }

    fn list_unfiltered(&self) -> Vec<Arc<Mock>> {
        self.unfiltered.lock().expect("mock store poisoned").clone()
    }

    fn delete_filtered(&self, mock: &Arc<Mock>) -> bool {
        delete_by_identity(&self.filtered, mock)
    }

    fn delete_unfiltered(&self, mock: &Arc<Mock>) -> bool {
        delete_by_identity(&self.unfiltered, mock)
    }

    fn insert_filtered(&self, mock: Mock) {
        self.filtered
            .lock()
            .expect("mock store poisoned")
            .push(Arc::new(mock));
    }

    fn insert_unfiltered(&self, mock: Mock) {
        self.unfiltered
            .lock()
            .expect("mock store poisoned")
            .push(Arc::new(mock));
    }
}

#[derive(Debug, Default)]
pub struct InMemoryTestStore {
    sets: Mutex<BTreeMap<String, Vec<TestCase>>>,
}

impl InMemoryTestStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TestStore for InMemoryTestStore {
    fn insert_test_case(&self, tc: TestCase, test_set_id: &str) {
        self.sets
            .lock()
            .expect("test store poisoned")
            .entry(test_set_id.to_string())
            .or_default()
            .push(tc);
    }

    fn list_all_test_set_ids(&self) -> Vec<String> {
        self.sets
            .lock()
            .expect("test store poisoned")
            .keys()
            .cloned()
            .collect()
    }

    fn read_test_set(&self, test_set_id: &str) -> Vec<TestCase> {
        self.sets
            .lock()
            .expect("test store poisoned")
            .get(test_set_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parrot_model::{GenericSpec, MockSpec};
    use std::collections::BTreeMap;

    fn mock(name: &str) -> Mock {
        Mock {
            version: parrot_model::API_VERSION.to_string(),
            name: name.into(),
            metadata: BTreeMap::new(),
            created: 0,
            spec: MockSpec::Generic(GenericSpec::default()),
        }
    }

    #[test]
    fn snapshot_is_stable_under_mutation() {
        let store = InMemoryMockStore::new();
        store.insert_filtered(mock("a"));
        store.insert_filtered(mock("b"));

        let snapshot = store.list_filtered();
        store.insert_filtered(mock("c"));
        assert_eq!(snapshot.len(), 2);
        assert_eq!(store.list_filtered().len(), 3);
    }

    #[test]
    fn delete_is_by_identity_not_equality() {
        let store = InMemoryMockStore::new();
        store.insert_filtered(mock("dup"));
        store.insert_filtered(mock("dup"));

        let snapshot = store.list_filtered();
        assert!(store.delete_filtered(&snapshot[0]));
        // The identical-looking sibling is untouched.
        assert_eq!(store.list_filtered().len(), 1);
        assert!(!store.delete_filtered(&snapshot[0]));
        assert!(store.delete_filtered(&snapshot[1]));
    }

    #[test]
    fn concurrent_deletes_have_one_winner() {
        let store = Arc::new(InMemoryMockStore::new());
        store.insert_filtered(mock("contested"));
        let target = store.list_filtered().remove(0);

        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = Arc::clone(&store);
            let target = Arc::clone(&target);
            handles.push(std::thread::spawn(move || store.delete_filtered(&target)));
        }
        let wins: usize = handles
            .into_iter()
            .map(|h| usize::from(h.join().unwrap()))
            .sum();
        assert_eq!(wins, 1);
        assert!(store.list_filtered().is_empty());
    }

    #[test]
    fn filtered_and_unfiltered_are_disjoint() {
        let store = InMemoryMockStore::new();
        store.insert_unfiltered(mock("handshake"));
        assert!(store.list_filtered().is_empty());
        let snapshot = store.list_unfiltered();
        assert!(!store.delete_filtered(&snapshot[0]));
        assert!(store.delete_unfiltered(&snapshot[0]));
    }

    #[test]
    fn test_store_grouping() {
        let store = InMemoryTestStore::new();
        let tc = TestCase {
            version: parrot_model::API_VERSION.to_string(),
            name: "test-1".into(),
            created: 0,
            req: parrot_model::HttpReq {
                method: "GET".into(),
                proto_major: 1,
                proto_minor: 1,
                url: "/ping".into(),
                url_params: BTreeMap::new(),
                header: BTreeMap::new(),
                body: parrot_model::Payload::empty(),
            },
            resp: parrot_model::HttpResp {
                status_code: 200,
                status_message: "OK".into(),
                proto_major: 1,
                proto_minor: 1,
                header: BTreeMap::new(),
                body: parrot_model::Payload::empty(),
            },
            noise: Vec::new(),
            curl: String::new(),
        };
        store.insert_test_case(tc.clone(), "set-1");
        store.insert_test_case(tc, "set-1");
        assert_eq!(store.list_all_test_set_ids(), vec!["set-1".to_string()]);
        assert_eq!(store.read_test_set("set-1").len(), 2);
        assert!(store.read_test_set("other").is_empty());
    }
}
