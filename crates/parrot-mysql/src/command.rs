//! Command-phase client packets.

use serde::{Deserialize, Serialize};

use crate::buf::{Reader, Writer};
use crate::rowscols::read_param_value;
use crate::{
    b64, ConnContext, DecodeError, COM_INIT_DB, COM_PING, COM_QUERY, COM_QUIT, COM_STMT_CLOSE,
    COM_STMT_EXECUTE, COM_STMT_PREPARE, COM_STMT_RESET, COM_STMT_SEND_LONG_DATA,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryPacket {
    pub query: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StmtPreparePacket {
    pub query: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundParameter {
    pub param_type: u8,
    pub unsigned: bool,
    /// Raw encoded value bytes (length prefix included where the type has
    /// one); NULL parameters have no bytes and are covered by the bitmap.
    #[serde(default, with = "b64", skip_serializing_if = "Vec::is_empty")]
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StmtExecutePacket {
    pub statement_id: u32,
    pub flags: u8,
    pub iteration_count: u32,
    #[serde(default, with = "b64", skip_serializing_if = "Vec::is_empty")]
    pub null_bitmap: Vec<u8>,
    pub new_params_bind_flag: u8,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<BoundParameter>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StmtClosePacket {
    pub statement_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StmtResetPacket {
    pub statement_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StmtSendLongDataPacket {
    pub statement_id: u32,
    pub param_id: u16,
    #[serde(with = "b64")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitDbPacket {
    pub schema: String,
}

impl QueryPacket {
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        expect_command(payload, COM_QUERY)?;
        Ok(Self {
            query: String::from_utf8_lossy(&payload[1..]).into_owned(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![COM_QUERY];
        out.extend_from_slice(self.query.as_bytes());
        out
    }
}

impl StmtPreparePacket {
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        expect_command(payload, COM_STMT_PREPARE)?;
        Ok(Self {
            query: String::from_utf8_lossy(&payload[1..]).into_owned(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![COM_STMT_PREPARE];
        out.extend_from_slice(self.query.as_bytes());
        out
    }
}

impl StmtExecutePacket {
    /// Decoding needs the prepared statement's parameter count, remembered
    /// from the `COM_STMT_PREPARE` response on this connection.
    pub fn decode(payload: &[u8], ctx: &ConnContext) -> Result<Self, DecodeError> {
        expect_command(payload, COM_STMT_EXECUTE)?;
        let mut r = Reader::new(&payload[1..]);
        let statement_id = r.u32_le()?;
        let flags = r.u8()?;
        let iteration_count = r.u32_le()?;

        let num_params = ctx
            .prepared_statements
            .get(&statement_id)
            .map(|ok| ok.num_params)
            .ok_or(DecodeError::UnknownStatement { statement_id })?;

        let mut null_bitmap = Vec::new();
        let mut new_params_bind_flag = 0;
        let mut parameters = Vec::new();
        if num_params > 0 {
            null_bitmap = r.bytes((usize::from(num_params) + 7) / 8)?.to_vec();
            new_params_bind_flag = r.u8()?;
            let mut types = Vec::with_capacity(usize::from(num_params));
            if new_params_bind_flag == 1 {
                for _ in 0..num_params {
                    let ty = r.u8()?;
                    let unsigned = r.u8()? & 0x80 != 0;
                    types.push((ty, unsigned));
                }
            } else {
                // Types were bound on a previous execute; without them the
                // value bytes cannot be sized.
                return Err(DecodeError::MissingParamTypes { statement_id });
            }
            for (idx, (ty, unsigned)) in types.iter().enumerate() {
                let is_null = null_bitmap[idx / 8] & (1 << (idx % 8)) != 0;
                let value = if is_null {
                    Vec::new()
                } else {
                    read_param_value(&mut r, *ty)?
                };
                parameters.push(BoundParameter {
                    param_type: *ty,
                    unsigned: *unsigned,
                    value,
                });
            }
        }
        r.finish("COM_STMT_EXECUTE")?;

        Ok(Self {
            statement_id,
            flags,
            iteration_count,
            null_bitmap,
            new_params_bind_flag,
            parameters,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.u8(COM_STMT_EXECUTE);
        w.u32_le(self.statement_id);
        w.u8(self.flags);
        w.u32_le(self.iteration_count);
        if !self.parameters.is_empty() {
            w.bytes(&self.null_bitmap);
            w.u8(self.new_params_bind_flag);
            if self.new_params_bind_flag == 1 {
                for p in &self.parameters {
                    w.u8(p.param_type);
                    w.u8(if p.unsigned { 0x80 } else { 0 });
                }
            }
            for p in &self.parameters {
                w.bytes(&p.value);
            }
        }
        w.into_vec()
    }

    /// The marshalled parameter tuple used for matching: type byte,
    /// signedness, and raw value bytes of every parameter in order.
    pub fn param_fingerprint(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for p in &self.parameters {
            out.push(p.param_type);
            out.push(u8::from(p.unsigned));
            out.extend_from_slice(&(p.value.len() as u32).to_le_bytes());
            out.extend_from_slice(&p.value);
        }
        out
    }
}

impl StmtClosePacket {
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        expect_command(payload, COM_STMT_CLOSE)?;
        let mut r = Reader::new(&payload[1..]);
        let statement_id = r.u32_le()?;
        r.finish("COM_STMT_CLOSE")?;
        Ok(Self { statement_id })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.u8(COM_STMT_CLOSE);
        w.u32_le(self.statement_id);
        w.into_vec()
    }
}

impl StmtResetPacket {
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        expect_command(payload, COM_STMT_RESET)?;
        let mut r = Reader::new(&payload[1..]);
        let statement_id = r.u32_le()?;
        r.finish("COM_STMT_RESET")?;
        Ok(Self { statement_id })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.u8(COM_STMT_RESET);
        w.u32_le(self.statement_id);
        w.into_vec()
    }
}

impl StmtSendLongDataPacket {
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        expect_command(payload, COM_STMT_SEND_LONG_DATA)?;
        let mut r = Reader::new(&payload[1..]);
        let statement_id = r.u32_le()?;
        let param_id = r.u16_le()?;
        let data = r.rest().to_vec();
        Ok(Self {
            statement_id,
            param_id,
            data,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.u8(COM_STMT_SEND_LONG_DATA);
        w.u32_le(self.statement_id);
        w.u16_le(self.param_id);
        w.bytes(&self.data);
        w.into_vec()
    }
}

impl InitDbPacket {
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        expect_command(payload, COM_INIT_DB)?;
        Ok(Self {
            schema: String::from_utf8_lossy(&payload[1..]).into_owned(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![COM_INIT_DB];
        out.extend_from_slice(self.schema.as_bytes());
        out
    }
}

/// Commands the server never answers; the recorder skips the response read
/// and the replayer still consumes a mock for them.
pub fn is_no_response_command(command: u8) -> bool {
    matches!(command, COM_STMT_CLOSE | COM_STMT_SEND_LONG_DATA)
}

pub fn command_name(command: u8) -> &'static str {
    match command {
        COM_QUIT => "COM_QUIT",
        COM_INIT_DB => "COM_INIT_DB",
        COM_QUERY => "COM_QUERY",
        COM_PING => "COM_PING",
        COM_STMT_PREPARE => "COM_STMT_PREPARE",
        COM_STMT_EXECUTE => "COM_STMT_EXECUTE",
        COM_STMT_SEND_LONG_DATA => "COM_STMT_SEND_LONG_DATA",
        COM_STMT_CLOSE => "COM_STMT_CLOSE",
        COM_STMT_RESET => "COM_STMT_RESET",
        crate::COM_CHANGE_USER => "COM_CHANGE_USER",
        crate::COM_STMT_FETCH => "COM_STMT_FETCH",
        crate::COM_STATISTICS => "COM_STATISTICS",
        _ => "COM_UNKNOWN",
    }
}

fn expect_command(payload: &[u8], command: u8) -> Result<(), DecodeError> {
    match payload.first() {
        Some(&tag) if tag == command => Ok(()),
        Some(&tag) => Err(DecodeError::UnexpectedTag {
            tag,
            context: command_name(command),
        }),
        None => Err(DecodeError::TooShort { need: 1, have: 0 }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resultset::StmtPrepareOk;
    use crate::PacketHeader;
    use pretty_assertions::assert_eq;

    fn ctx_with_stmt(statement_id: u32, num_params: u16) -> ConnContext {
        let mut ctx = ConnContext::default();
        ctx.prepared_statements.insert(
            statement_id,
            StmtPrepareOk {
                header: PacketHeader { length: 0, seq_id: 1 },
                status: 0,
                statement_id,
                num_columns: 1,
                num_params,
                warning_count: 0,
                param_defs: Vec::new(),
                eof_after_params: None,
                column_defs: Vec::new(),
                eof_after_columns: None,
            },
        );
        ctx
    }

    #[test]
    fn query_roundtrip() {
        let q = QueryPacket {
            query: "SELECT 1".into(),
        };
        let wire = q.encode();
        assert_eq!(wire[0], COM_QUERY);
        assert_eq!(QueryPacket::decode(&wire).unwrap(), q);
    }

    #[test]
    fn execute_roundtrip_with_string_param() {
        let exec = StmtExecutePacket {
            statement_id: 1,
            flags: 0,
            iteration_count: 1,
            null_bitmap: vec![0x00],
            new_params_bind_flag: 1,
            parameters: vec![BoundParameter {
                param_type: 0xfd, // VAR_STRING
                unsigned: false,
                value: {
                    let mut v = vec![5u8];
                    v.extend_from_slice(b"hello");
                    v
                },
            }],
        };
        let wire = exec.encode();
        let ctx = ctx_with_stmt(1, 1);
        let back = StmtExecutePacket::decode(&wire, &ctx).unwrap();
        assert_eq!(back, exec);
        assert_eq!(back.encode(), wire);
    }

    #[test]
    fn execute_null_param() {
        let exec = StmtExecutePacket {
            statement_id: 3,
            flags: 0,
            iteration_count: 1,
            null_bitmap: vec![0x01],
            new_params_bind_flag: 1,
            parameters: vec![BoundParameter {
                param_type: crate::rowscols::TYPE_LONG,
                unsigned: false,
                value: Vec::new(),
            }],
        };
        let wire = exec.encode();
        let ctx = ctx_with_stmt(3, 1);
        assert_eq!(StmtExecutePacket::decode(&wire, &ctx).unwrap(), exec);
    }

    #[test]
    fn execute_unknown_statement_errors() {
        let exec = StmtExecutePacket {
            statement_id: 9,
            flags: 0,
            iteration_count: 1,
            null_bitmap: Vec::new(),
            new_params_bind_flag: 0,
            parameters: Vec::new(),
        };
        let wire = exec.encode();
        let ctx = ConnContext::default();
        assert!(matches!(
            StmtExecutePacket::decode(&wire, &ctx),
            Err(DecodeError::UnknownStatement { statement_id: 9 })
        ));
    }

    #[test]
    fn fingerprints_differ_by_value() {
        let mk = |val: &[u8]| StmtExecutePacket {
            statement_id: 1,
            flags: 0,
            iteration_count: 1,
            null_bitmap: vec![0],
            new_params_bind_flag: 1,
            parameters: vec![BoundParameter {
                param_type: 0xfd,
                unsigned: false,
                value: val.to_vec(),
            }],
        };
        assert_ne!(
            mk(b"\x05hello").param_fingerprint(),
            mk(b"\x05world").param_fingerprint()
        );
    }

    #[test]
    fn no_response_commands() {
        assert!(is_no_response_command(COM_STMT_CLOSE));
        assert!(is_no_response_command(COM_STMT_SEND_LONG_DATA));
        assert!(!is_no_response_command(COM_QUERY));
    }
}
