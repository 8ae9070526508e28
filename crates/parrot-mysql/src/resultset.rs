//! Multi-packet server responses: result sets and the COM_STMT_PREPARE
//! response.
//!
//! These structures aggregate a whole wire sequence (column count, column
//! definitions, EOFs, rows, terminator) while preserving every recorded
//! frame header, so `encode_packets` reproduces the transcript the client
//! originally saw.

use serde::{Deserialize, Serialize};

use crate::buf::{Reader, Writer};
use crate::bundle::RawPacket;
use crate::packet::{encode_frame, Packet, PacketHeader};
use crate::rowscols::{BinaryRow, ColumnDef, TextRow};
use crate::{DecodeError, EncodeError};

/// `COM_QUERY` / `COM_STMT_EXECUTE` response when the statement produces
/// rows. `rows_binary` is used for the binary protocol, `rows_text`
/// otherwise; exactly one is non-empty for a non-empty result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultSet {
    /// Header of the column-count packet.
    pub header: PacketHeader,
    pub column_count: u64,
    pub columns: Vec<ColumnDef>,
    /// EOF between column definitions and rows, absent with DEPRECATE_EOF.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eof_after_columns: Option<RawPacket>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rows_text: Vec<TextRow>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rows_binary: Vec<BinaryRow>,
    /// Final EOF (or OK with DEPRECATE_EOF), raw.
    pub terminator: RawPacket,
}

impl ResultSet {
    /// Decode the column-count packet that opens a result set.
    pub fn decode_column_count(pkt: &Packet) -> Result<u64, DecodeError> {
        let mut r = Reader::new(&pkt.payload);
        let count = r.lenenc_u64()?;
        r.finish("result set column count")?;
        Ok(count)
    }

    /// Re-emit the full packet sequence with recorded sequence ids.
    pub fn encode_packets(&self) -> Result<Vec<Vec<u8>>, EncodeError> {
        let mut out = Vec::new();
        let mut w = Writer::new();
        w.lenenc_u64(self.column_count);
        out.push(encode_frame(self.header.seq_id, &w.into_vec())?);
        for col in &self.columns {
            out.push(encode_frame(col.header.seq_id, &col.encode_payload())?);
        }
        if let Some(eof) = &self.eof_after_columns {
            out.push(eof.encode()?);
        }
        for row in &self.rows_text {
            out.push(encode_frame(row.header.seq_id, &row.encode_payload())?);
        }
        for row in &self.rows_binary {
            out.push(encode_frame(row.header.seq_id, &row.encode_payload())?);
        }
        out.push(self.terminator.encode()?);
        Ok(out)
    }
}

/// `COM_STMT_PREPARE` response: the leading OK, then `num_params` parameter
/// definitions (+EOF), then `num_columns` column definitions (+EOF).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StmtPrepareOk {
    pub header: PacketHeader,
    pub status: u8,
    pub statement_id: u32,
    pub num_columns: u16,
    pub num_params: u16,
    pub warning_count: u16,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub param_defs: Vec<ColumnDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eof_after_params: Option<RawPacket>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub column_defs: Vec<ColumnDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eof_after_columns: Option<RawPacket>,
}

impl StmtPrepareOk {
    /// Decode the leading packet of the prepare response (`status = 0x00`).
    /// Definitions and EOFs are appended by the caller as it reads them.
    pub fn decode_first(pkt: &Packet) -> Result<Self, DecodeError> {
        let mut r = Reader::new(&pkt.payload);
        let status = r.u8()?;
        if status != 0x00 {
            return Err(DecodeError::UnexpectedTag {
                tag: status,
                context: "COM_STMT_PREPARE_OK status",
            });
        }
        let statement_id = r.u32_le()?;
        let num_columns = r.u16_le()?;
        let num_params = r.u16_le()?;
        let _filler = r.u8()?;
        let warning_count = r.u16_le()?;
        // 8.0.x may append a metadata-follows byte; preserved via re-encode
        // of the fixed 12-byte form only, so reject the long form loudly.
        r.finish("COM_STMT_PREPARE_OK")?;

        Ok(Self {
            header: pkt.header,
            status,
            statement_id,
            num_columns,
            num_params,
            warning_count,
            param_defs: Vec::new(),
            eof_after_params: None,
            column_defs: Vec::new(),
            eof_after_columns: None,
        })
    }

    fn encode_first_payload(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.u8(self.status);
        w.u32_le(self.statement_id);
        w.u16_le(self.num_columns);
        w.u16_le(self.num_params);
        w.u8(0);
        w.u16_le(self.warning_count);
        w.into_vec()
    }

    pub fn encode_packets(&self) -> Result<Vec<Vec<u8>>, EncodeError> {
        let mut out = Vec::new();
        out.push(encode_frame(self.header.seq_id, &self.encode_first_payload())?);
        for def in &self.param_defs {
            out.push(encode_frame(def.header.seq_id, &def.encode_payload())?);
        }
        if let Some(eof) = &self.eof_after_params {
            out.push(eof.encode()?);
        }
        for def in &self.column_defs {
            out.push(encode_frame(def.header.seq_id, &def.encode_payload())?);
        }
        if let Some(eof) = &self.eof_after_columns {
            out.push(eof.encode()?);
        }
        Ok(out)
    }
}

/// `LOCAL INFILE` request (0xFB + filename). The exchange that follows is
/// captured as raw packets; no structured decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalInfileRequest {
    pub filename: String,
}

impl LocalInfileRequest {
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(payload);
        let tag = r.u8()?;
        if tag != 0xfb {
            return Err(DecodeError::UnexpectedTag {
                tag,
                context: "LOCAL INFILE request",
            });
        }
        Ok(Self {
            filename: String::from_utf8_lossy(r.rest()).into_owned(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0xfb];
        out.extend_from_slice(self.filename.as_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rowscols::TextValue;
    use crate::status::EofPacket;
    use crate::CLIENT_PROTOCOL_41;
    use pretty_assertions::assert_eq;

    fn raw_eof(seq_id: u8) -> RawPacket {
        let payload = EofPacket {
            warnings: 0,
            status_flags: 0x0002,
        }
        .encode(CLIENT_PROTOCOL_41);
        RawPacket {
            header: PacketHeader {
                length: payload.len() as u32,
                seq_id,
            },
            payload,
        }
    }

    #[test]
    fn text_result_set_packet_sequence() {
        let col = ColumnDef {
            header: PacketHeader { length: 0, seq_id: 2 },
            catalog: "def".into(),
            schema: String::new(),
            table: String::new(),
            org_table: String::new(),
            name: "hello".into(),
            org_name: String::new(),
            character_set: 0xff,
            column_length: 5,
            column_type: 0xfd,
            flags: 0,
            decimals: 0,
        };
        let rs = ResultSet {
            header: PacketHeader { length: 1, seq_id: 1 },
            column_count: 1,
            columns: vec![col],
            eof_after_columns: Some(raw_eof(3)),
            rows_text: vec![TextRow {
                header: PacketHeader { length: 0, seq_id: 4 },
                values: vec![TextValue::Value(b"hello".to_vec())],
            }],
            rows_binary: Vec::new(),
            terminator: raw_eof(5),
        };

        let packets = rs.encode_packets().unwrap();
        assert_eq!(packets.len(), 4);
        // Sequence ids preserved: 1, 2, 3(EOF), 4(row), 5(EOF).
        let seqs: Vec<u8> = packets.iter().map(|p| p[3]).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        // Column-count packet body is the lenenc count.
        assert_eq!(&packets[0][4..], &[1][..]);
    }

    #[test]
    fn prepare_ok_roundtrip_first_packet() {
        let ok = StmtPrepareOk {
            header: PacketHeader { length: 12, seq_id: 1 },
            status: 0,
            statement_id: 1,
            num_columns: 1,
            num_params: 1,
            warning_count: 0,
            param_defs: Vec::new(),
            eof_after_params: None,
            column_defs: Vec::new(),
            eof_after_columns: None,
        };
        let payload = ok.encode_first_payload();
        let pkt = Packet::new(1, payload);
        let back = StmtPrepareOk::decode_first(&pkt).unwrap();
        assert_eq!(back.statement_id, 1);
        assert_eq!(back.num_params, 1);
        assert_eq!(back.num_columns, 1);
    }

    #[test]
    fn local_infile_roundtrip() {
        let req = LocalInfileRequest {
            filename: "/tmp/data.csv".into(),
        };
        let wire = req.encode();
        assert_eq!(LocalInfileRequest::decode(&wire).unwrap(), req);
    }
}
