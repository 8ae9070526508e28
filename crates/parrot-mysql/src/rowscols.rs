//! Column definitions and result-set rows (text and binary protocol).
//!
//! Every decoded structure keeps its recorded frame header and, for binary
//! values, the raw value bytes, so replay re-emits the exact recorded wire
//! image with the exact sequence ids.

use serde::{Deserialize, Serialize};

use crate::buf::{Reader, Writer};
use crate::packet::{Packet, PacketHeader};
use crate::{b64, DecodeError};

// Column type bytes the binary codec needs to size values.
pub const TYPE_TINY: u8 = 0x01;
pub const TYPE_SHORT: u8 = 0x02;
pub const TYPE_LONG: u8 = 0x03;
pub const TYPE_FLOAT: u8 = 0x04;
pub const TYPE_DOUBLE: u8 = 0x05;
pub const TYPE_NULL: u8 = 0x06;
pub const TYPE_TIMESTAMP: u8 = 0x07;
pub const TYPE_LONGLONG: u8 = 0x08;
pub const TYPE_INT24: u8 = 0x09;
pub const TYPE_DATE: u8 = 0x0a;
pub const TYPE_TIME: u8 = 0x0b;
pub const TYPE_DATETIME: u8 = 0x0c;
pub const TYPE_YEAR: u8 = 0x0d;

/// `ColumnDefinition41`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub header: PacketHeader,
    pub catalog: String,
    pub schema: String,
    pub table: String,
    pub org_table: String,
    pub name: String,
    pub org_name: String,
    pub character_set: u16,
    pub column_length: u32,
    pub column_type: u8,
    pub flags: u16,
    pub decimals: u8,
}

impl ColumnDef {
    pub fn decode(pkt: &Packet) -> Result<Self, DecodeError> {
        let mut r = Reader::new(&pkt.payload);
        let catalog = r.lenenc_str("column catalog")?;
        let schema = r.lenenc_str("column schema")?;
        let table = r.lenenc_str("column table")?;
        let org_table = r.lenenc_str("column org_table")?;
        let name = r.lenenc_str("column name")?;
        let org_name = r.lenenc_str("column org_name")?;
        let fixed_len = r.lenenc_u64()?;
        if fixed_len != 0x0c {
            return Err(DecodeError::UnexpectedTag {
                tag: fixed_len as u8,
                context: "column definition fixed-length field",
            });
        }
        let character_set = r.u16_le()?;
        let column_length = r.u32_le()?;
        let column_type = r.u8()?;
        let flags = r.u16_le()?;
        let decimals = r.u8()?;
        let _filler = r.bytes(2)?;
        r.finish("ColumnDefinition41")?;

        Ok(Self {
            header: pkt.header,
            catalog,
            schema,
            table,
            org_table,
            name,
            org_name,
            character_set,
            column_length,
            column_type,
            flags,
            decimals,
        })
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.lenenc_bytes(self.catalog.as_bytes());
        w.lenenc_bytes(self.schema.as_bytes());
        w.lenenc_bytes(self.table.as_bytes());
        w.lenenc_bytes(self.org_table.as_bytes());
        w.lenenc_bytes(self.name.as_bytes());
        w.lenenc_bytes(self.org_name.as_bytes());
        w.lenenc_u64(0x0c);
        w.u16_le(self.character_set);
        w.u32_le(self.column_length);
        w.u8(self.column_type);
        w.u16_le(self.flags);
        w.u8(self.decimals);
        w.bytes(&[0, 0]);
        w.into_vec()
    }
}

/// One value in a text-protocol row: NULL or raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TextValue {
    Null,
    Value(#[serde(with = "b64")] Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextRow {
    pub header: PacketHeader,
    pub values: Vec<TextValue>,
}

impl TextRow {
    pub fn decode(pkt: &Packet, column_count: usize) -> Result<Self, DecodeError> {
        let mut r = Reader::new(&pkt.payload);
        let mut values = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            if r.peek_u8() == Some(0xfb) {
                let _ = r.u8()?;
                values.push(TextValue::Null);
            } else {
                values.push(TextValue::Value(r.lenenc_bytes()?.to_vec()));
            }
        }
        r.finish("text row")?;
        Ok(Self {
            header: pkt.header,
            values,
        })
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut w = Writer::new();
        for v in &self.values {
            match v {
                TextValue::Null => w.u8(0xfb),
                TextValue::Value(bytes) => w.lenenc_bytes(bytes),
            }
        }
        w.into_vec()
    }
}

/// One row of a binary-protocol result set. Values keep their raw encoded
/// bytes; the null bitmap is stored as captured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryRow {
    pub header: PacketHeader,
    #[serde(with = "b64")]
    pub null_bitmap: Vec<u8>,
    /// Raw value bytes per non-NULL column, wire order.
    pub values: Vec<BinaryValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryValue {
    pub column_type: u8,
    #[serde(with = "b64")]
    pub value: Vec<u8>,
}

impl BinaryRow {
    pub fn decode(pkt: &Packet, columns: &[ColumnDef]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(&pkt.payload);
        let tag = r.u8()?;
        if tag != 0x00 {
            return Err(DecodeError::UnexpectedTag {
                tag,
                context: "binary row header",
            });
        }
        // Result-set null bitmap has a 2-bit offset.
        let bitmap_len = (columns.len() + 7 + 2) / 8;
        let null_bitmap = r.bytes(bitmap_len)?.to_vec();

        let mut values = Vec::new();
        for (idx, col) in columns.iter().enumerate() {
            let bit = idx + 2;
            let is_null = null_bitmap[bit / 8] & (1 << (bit % 8)) != 0;
            if is_null {
                continue;
            }
            let raw = read_binary_value(&mut r, col.column_type)?;
            values.push(BinaryValue {
                column_type: col.column_type,
                value: raw,
            });
        }
        r.finish("binary row")?;
        Ok(Self {
            header: pkt.header,
            null_bitmap,
            values,
        })
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(0x00);
        out.extend_from_slice(&self.null_bitmap);
        for v in &self.values {
            out.extend_from_slice(&v.value);
        }
        out
    }
}

/// Read one binary value, returning the *raw encoded bytes* (length prefix
/// included where the type has one).
fn read_binary_value(r: &mut Reader<'_>, column_type: u8) -> Result<Vec<u8>, DecodeError> {
    match column_type {
        TYPE_NULL => Ok(Vec::new()),
        TYPE_TINY => Ok(r.bytes(1)?.to_vec()),
        TYPE_SHORT | TYPE_YEAR => Ok(r.bytes(2)?.to_vec()),
        TYPE_LONG | TYPE_INT24 | TYPE_FLOAT => Ok(r.bytes(4)?.to_vec()),
        TYPE_LONGLONG | TYPE_DOUBLE => Ok(r.bytes(8)?.to_vec()),
        TYPE_DATE | TYPE_DATETIME | TYPE_TIMESTAMP | TYPE_TIME => {
            let len = r.u8()? as usize;
            let mut raw = vec![len as u8];
            raw.extend_from_slice(r.bytes(len)?);
            Ok(raw)
        }
        // Everything else is a length-encoded blob.
        _ => {
            let body = r.lenenc_bytes()?.to_vec();
            let mut w = Writer::new();
            w.lenenc_bytes(&body);
            Ok(w.into_vec())
        }
    }
}

/// Read one bound parameter value of a `COM_STMT_EXECUTE`, raw bytes.
pub fn read_param_value(r: &mut Reader<'_>, param_type: u8) -> Result<Vec<u8>, DecodeError> {
    read_binary_value(r, param_type)
}
