//! Per-connection decode state.

use std::collections::HashMap;

use crate::handshake::HandshakeV10;
use crate::resultset::StmtPrepareOk;
use crate::{CACHING_SHA2_PASSWORD, CLIENT_PROTOCOL_41};

/// State one MySQL connection accumulates as packets flow. Passed by
/// reference through the handler; nothing connection-scoped lives in
/// globals.
#[derive(Debug, Clone)]
pub struct ConnContext {
    /// Command byte of the last client packet, used to interpret the next
    /// server payload.
    pub last_command: Option<u8>,
    /// The server greeting is the decode key for everything after it
    /// (capabilities, scramble, initial auth plugin).
    pub server_greeting: Option<HandshakeV10>,
    /// Capabilities the client actually negotiated in its handshake
    /// response; the effective set is the intersection with the server's.
    pub client_capabilities: Option<u32>,
    /// Active auth plugin; updated by AuthSwitchRequest.
    pub plugin_name: String,
    /// statement id -> prepare response, for decoding COM_STMT_EXECUTE.
    pub prepared_statements: HashMap<u32, StmtPrepareOk>,
}

impl Default for ConnContext {
    fn default() -> Self {
        Self {
            last_command: None,
            server_greeting: None,
            client_capabilities: None,
            plugin_name: CACHING_SHA2_PASSWORD.to_string(),
            prepared_statements: HashMap::new(),
        }
    }
}

impl ConnContext {
    /// Capabilities in effect for status-packet layouts. Defaults to
    /// protocol-4.1 when the handshake was never observed (replay of a
    /// command-phase-only transcript).
    pub fn capabilities(&self) -> u32 {
        let server = self
            .server_greeting
            .as_ref()
            .map(|g| g.capability_flags)
            .unwrap_or(u32::MAX);
        let client = self.client_capabilities.unwrap_or(u32::MAX);
        let effective = server & client;
        if effective == u32::MAX {
            CLIENT_PROTOCOL_41
        } else {
            effective
        }
    }

    pub fn remember_greeting(&mut self, greeting: HandshakeV10) {
        if !greeting.auth_plugin_name.is_empty() {
            self.plugin_name = greeting.auth_plugin_name.clone();
        }
        self.server_greeting = Some(greeting);
    }

    pub fn remember_prepare(&mut self, ok: StmtPrepareOk) {
        self.prepared_statements.insert(ok.statement_id, ok);
    }
}
