//! MySQL client/server wire codec.
//!
//! Pure byte-slice encode/decode with no I/O: the proxy reads whole framed
//! packets off the socket and hands payloads here. Decoding the command
//! phase is stateful (the meaning of a server payload depends on the last
//! client command and on prepared-statement metadata), so decode entry
//! points take a per-connection [`ConnContext`].
//!
//! Wire reference: https://dev.mysql.com/doc/dev/mysql-server/latest/

pub mod auth;
pub mod buf;
pub mod bundle;
pub mod command;
pub mod context;
pub mod handshake;
pub mod packet;
pub mod resultset;
pub mod rowscols;
pub mod status;

pub use bundle::{PacketBundle, PacketPayload, RawPacket};
pub use context::ConnContext;
pub use packet::{Packet, PacketHeader, MAX_PAYLOAD_LEN};

use thiserror::Error;

// Capability flags (subset the codec branches on).
pub const CLIENT_CONNECT_WITH_DB: u32 = 0x0000_0008;
pub const CLIENT_LOCAL_FILES: u32 = 0x0000_0080;
pub const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
pub const CLIENT_SSL: u32 = 0x0000_0800;
pub const CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;
pub const CLIENT_PLUGIN_AUTH: u32 = 0x0008_0000;
pub const CLIENT_CONNECT_ATTRS: u32 = 0x0010_0000;
pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 0x0020_0000;
pub const CLIENT_SESSION_TRACK: u32 = 0x0080_0000;
pub const CLIENT_DEPRECATE_EOF: u32 = 0x0100_0000;

// Command bytes.
pub const COM_QUIT: u8 = 0x01;
pub const COM_INIT_DB: u8 = 0x02;
pub const COM_QUERY: u8 = 0x03;
pub const COM_STATISTICS: u8 = 0x09;
pub const COM_PING: u8 = 0x0e;
pub const COM_CHANGE_USER: u8 = 0x11;
pub const COM_STMT_PREPARE: u8 = 0x16;
pub const COM_STMT_EXECUTE: u8 = 0x17;
pub const COM_STMT_SEND_LONG_DATA: u8 = 0x18;
pub const COM_STMT_CLOSE: u8 = 0x19;
pub const COM_STMT_RESET: u8 = 0x1a;
pub const COM_STMT_FETCH: u8 = 0x1c;

// Auth plugin names.
pub const NATIVE_PASSWORD: &str = "mysql_native_password";
pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";
pub const SHA256_PASSWORD: &str = "sha256_password";

// caching_sha2_password sub-states carried in a one-byte AuthMoreData.
pub const FAST_AUTH_SUCCESS: u8 = 0x03;
pub const PERFORM_FULL_AUTHENTICATION: u8 = 0x04;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("packet too short: need {need} bytes, have {have}")]
    TooShort { need: usize, have: usize },
    #[error("frame truncated: header says {expected} payload bytes, have {have}")]
    Truncated { expected: usize, have: usize },
    #[error("unexpected tag byte 0x{tag:02x} for {context}")]
    UnexpectedTag { tag: u8, context: &'static str },
    #[error("unknown command byte 0x{command:02x}")]
    UnknownCommand { command: u8 },
    #[error("missing string terminator in {context}")]
    MissingNul { context: &'static str },
    #[error("invalid utf-8 in {context}")]
    InvalidUtf8 { context: &'static str },
    #[error("unknown prepared statement id {statement_id}")]
    UnknownStatement { statement_id: u32 },
    #[error("COM_STMT_EXECUTE for statement {statement_id} rebinds without parameter types")]
    MissingParamTypes { statement_id: u32 },
    #[error("unsupported column type 0x{column_type:02x} in binary row")]
    UnsupportedColumnType { column_type: u8 },
    #[error("payload exceeds the single-frame limit ({len} bytes)")]
    Oversize { len: usize },
    #[error("{context}: trailing {len} unread bytes")]
    TrailingBytes { context: &'static str, len: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("payload exceeds the single-frame limit ({len} bytes)")]
    Oversize { len: usize },
    #[error("cannot encode {context}: {reason}")]
    Unencodable {
        context: &'static str,
        reason: &'static str,
    },
}

/// serde adapter: `Vec<u8>` as standard base64.
pub(crate) mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Vec<u8>, ser: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(bytes).serialize(ser)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(de)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}
