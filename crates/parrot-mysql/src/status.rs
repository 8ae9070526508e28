//! Generic server response packets: OK, ERR, EOF.

use serde::{Deserialize, Serialize};

use crate::buf::{Reader, Writer};
use crate::{b64, DecodeError, CLIENT_PROTOCOL_41};

/// OK packet (0x00, or 0xFE "EOF-OK" when DEPRECATE_EOF is on).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OkPacket {
    pub header: u8,
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
    /// Human-readable info plus any session-track blob, kept raw.
    #[serde(default, with = "b64", skip_serializing_if = "Vec::is_empty")]
    pub info: Vec<u8>,
}

impl OkPacket {
    pub fn decode(payload: &[u8], capabilities: u32) -> Result<Self, DecodeError> {
        let mut r = Reader::new(payload);
        let header = r.u8()?;
        if header != 0x00 && header != 0xfe {
            return Err(DecodeError::UnexpectedTag {
                tag: header,
                context: "OK packet",
            });
        }
        let affected_rows = r.lenenc_u64()?;
        let last_insert_id = r.lenenc_u64()?;
        let (status_flags, warnings) = if capabilities & CLIENT_PROTOCOL_41 != 0 {
            (r.u16_le()?, r.u16_le()?)
        } else {
            (0, 0)
        };
        let info = r.rest().to_vec();
        Ok(Self {
            header,
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
            info,
        })
    }

    pub fn encode(&self, capabilities: u32) -> Vec<u8> {
        let mut w = Writer::new();
        w.u8(self.header);
        w.lenenc_u64(self.affected_rows);
        w.lenenc_u64(self.last_insert_id);
        if capabilities & CLIENT_PROTOCOL_41 != 0 {
            w.u16_le(self.status_flags);
            w.u16_le(self.warnings);
        }
        w.bytes(&self.info);
        w.into_vec()
    }
}

/// ERR packet (0xFF).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrPacket {
    pub error_code: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sql_state: String,
    pub message: String,
}

impl ErrPacket {
    pub fn decode(payload: &[u8], capabilities: u32) -> Result<Self, DecodeError> {
        let mut r = Reader::new(payload);
        let tag = r.u8()?;
        if tag != 0xff {
            return Err(DecodeError::UnexpectedTag {
                tag,
                context: "ERR packet",
            });
        }
        let error_code = r.u16_le()?;
        let sql_state = if capabilities & CLIENT_PROTOCOL_41 != 0 && r.peek_u8() == Some(b'#') {
            let _marker = r.u8()?;
            let raw = r.bytes(5)?;
            std::str::from_utf8(raw)
                .map_err(|_| DecodeError::InvalidUtf8 { context: "sql state" })?
                .to_owned()
        } else {
            String::new()
        };
        let message = String::from_utf8_lossy(r.rest()).into_owned();
        Ok(Self {
            error_code,
            sql_state,
            message,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.u8(0xff);
        w.u16_le(self.error_code);
        if !self.sql_state.is_empty() {
            w.u8(b'#');
            w.bytes(self.sql_state.as_bytes());
        }
        w.bytes(self.message.as_bytes());
        w.into_vec()
    }
}

/// EOF packet (0xFE with payload shorter than 9 bytes).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EofPacket {
    pub warnings: u16,
    pub status_flags: u16,
}

impl EofPacket {
    pub fn decode(payload: &[u8], capabilities: u32) -> Result<Self, DecodeError> {
        let mut r = Reader::new(payload);
        let tag = r.u8()?;
        if tag != 0xfe {
            return Err(DecodeError::UnexpectedTag {
                tag,
                context: "EOF packet",
            });
        }
        let (warnings, status_flags) = if capabilities & CLIENT_PROTOCOL_41 != 0 {
            (r.u16_le()?, r.u16_le()?)
        } else {
            (0, 0)
        };
        r.finish("EOF packet")?;
        Ok(Self {
            warnings,
            status_flags,
        })
    }

    pub fn encode(&self, capabilities: u32) -> Vec<u8> {
        let mut w = Writer::new();
        w.u8(0xfe);
        if capabilities & CLIENT_PROTOCOL_41 != 0 {
            w.u16_le(self.warnings);
            w.u16_le(self.status_flags);
        }
        w.into_vec()
    }
}

/// Distinguish 0xFE meanings: EOF packets are strictly shorter than 9 bytes.
pub fn is_eof_payload(payload: &[u8]) -> bool {
    payload.first() == Some(&0xfe) && payload.len() < 9
}

pub fn is_ok_payload(payload: &[u8]) -> bool {
    payload.first() == Some(&0x00) || (payload.first() == Some(&0xfe) && payload.len() >= 9)
}

pub fn is_err_payload(payload: &[u8]) -> bool {
    payload.first() == Some(&0xff)
}
