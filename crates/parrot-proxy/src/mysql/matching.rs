//! Command-phase matching: packet type first, then the per-command
//! discipline (exact SQL, statement id + parameter tuple, field equality).

use std::sync::Arc;

use parrot_match::MockStore;
use parrot_model::{Mock, MockKind};
use parrot_mysql::bundle::{PacketBundle, PacketPayload};
use tracing::debug;

/// Select and consume the mock answering `req`. `None` only when no stored
/// command has the same packet type (the structural layer).
pub fn match_command(req: &PacketBundle, store: &dyn MockStore) -> Option<Arc<Mock>> {
    loop {
        let snapshot = store.list_filtered();
        let mut saw_type = false;

        for mock in snapshot.iter().filter(|m| m.kind() == MockKind::MySql) {
            let Some(spec) = mock.as_mysql() else {
                continue;
            };
            let Some(recorded) = spec.requests.first() else {
                continue;
            };
            if recorded.kind() != req.kind() {
                continue;
            }
            saw_type = true;
            if !command_eq(&recorded.payload, &req.payload) {
                continue;
            }
            if store.delete_filtered(mock) {
                debug!(mock = %mock.name, kind = req.kind(), "mysql command matched");
                return Some(Arc::clone(mock));
            }
            // Lost the consume race; restart on a fresh snapshot.
            break;
        }

        if !saw_type {
            return None;
        }
        // A candidate of the right type existed but none compared equal:
        // that is a genuine no-match, not a race.
        let raced = snapshot
            .iter()
            .filter(|m| m.kind() == MockKind::MySql)
            .any(|m| {
                m.as_mysql()
                    .and_then(|s| s.requests.first())
                    .is_some_and(|r| r.kind() == req.kind() && command_eq(&r.payload, &req.payload))
            });
        if !raced {
            return None;
        }
    }
}

fn command_eq(recorded: &PacketPayload, actual: &PacketPayload) -> bool {
    match (recorded, actual) {
        // SQL text is compared exactly, case-sensitive.
        (PacketPayload::Query(a), PacketPayload::Query(b)) => a.query == b.query,
        (PacketPayload::StmtPrepare(a), PacketPayload::StmtPrepare(b)) => a.query == b.query,
        (PacketPayload::StmtExecute(a), PacketPayload::StmtExecute(b)) => {
            a.statement_id == b.statement_id && a.param_fingerprint() == b.param_fingerprint()
        }
        (PacketPayload::StmtClose(a), PacketPayload::StmtClose(b)) => {
            a.statement_id == b.statement_id
        }
        (PacketPayload::StmtReset(a), PacketPayload::StmtReset(b)) => {
            a.statement_id == b.statement_id
        }
        (PacketPayload::StmtSendLongData(a), PacketPayload::StmtSendLongData(b)) => {
            a.statement_id == b.statement_id && a.param_id == b.param_id && a.data == b.data
        }
        (PacketPayload::InitDb(a), PacketPayload::InitDb(b)) => a.schema == b.schema,
        (PacketPayload::Quit, PacketPayload::Quit) => true,
        (PacketPayload::Ping, PacketPayload::Ping) => true,
        (PacketPayload::Raw { data: a }, PacketPayload::Raw { data: b }) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parrot_match::InMemoryMockStore;
    use parrot_model::{MockSpec, MySqlSpec};
    use parrot_mysql::command::{QueryPacket, StmtExecutePacket};
    use parrot_mysql::PacketHeader;
    use std::collections::BTreeMap;

    fn bundle(payload: PacketPayload) -> PacketBundle {
        PacketBundle::new(PacketHeader { length: 0, seq_id: 0 }, payload)
    }

    fn mysql_mock(name: &str, req: PacketBundle) -> Mock {
        Mock {
            version: parrot_model::API_VERSION.to_string(),
            name: name.into(),
            metadata: BTreeMap::new(),
            created: 0,
            spec: MockSpec::MySql(MySqlSpec {
                requests: vec![req],
                responses: Vec::new(),
            }),
        }
    }

    fn query(q: &str) -> PacketBundle {
        bundle(PacketPayload::Query(QueryPacket { query: q.into() }))
    }

    #[test]
    fn query_text_is_case_sensitive_exact() {
        let store = InMemoryMockStore::new();
        store.insert_filtered(mysql_mock("m", query("SELECT 1")));

        assert!(match_command(&query("select 1"), &store).is_none());
        assert_eq!(store.list_filtered().len(), 1);
        assert!(match_command(&query("SELECT 1"), &store).is_some());
        assert!(store.list_filtered().is_empty());
    }

    #[test]
    fn wrong_packet_type_is_structural_no_match() {
        let store = InMemoryMockStore::new();
        store.insert_filtered(mysql_mock("m", query("SELECT 1")));
        let ping = bundle(PacketPayload::Ping);
        assert!(match_command(&ping, &store).is_none());
    }

    #[test]
    fn execute_matches_by_stmt_id_and_params() {
        let exec = |id: u32, value: &[u8]| {
            bundle(PacketPayload::StmtExecute(StmtExecutePacket {
                statement_id: id,
                flags: 0,
                iteration_count: 1,
                null_bitmap: vec![0],
                new_params_bind_flag: 1,
                parameters: vec![parrot_mysql::command::BoundParameter {
                    param_type: 0xfd,
                    unsigned: false,
                    value: value.to_vec(),
                }],
            }))
        };

        let store = InMemoryMockStore::new();
        store.insert_filtered(mysql_mock("m", exec(1, b"\x05hello")));

        assert!(match_command(&exec(1, b"\x05world"), &store).is_none());
        assert!(match_command(&exec(2, b"\x05hello"), &store).is_none());
        assert!(match_command(&exec(1, b"\x05hello"), &store).is_some());
    }

    #[test]
    fn no_response_commands_still_consume() {
        let close = bundle(PacketPayload::StmtClose(
            parrot_mysql::command::StmtClosePacket { statement_id: 4 },
        ));
        let store = InMemoryMockStore::new();
        store.insert_filtered(mysql_mock("m", close.clone()));

        assert!(match_command(&close, &store).is_some());
        assert!(store.list_filtered().is_empty());
    }
}
