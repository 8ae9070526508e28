//! Decoded packets as stored in mock artifacts.
//!
//! Every supported packet is one variant of [`PacketPayload`]; handlers
//! pattern-match instead of downcasting. A bundle keeps the recorded frame
//! header so replay can re-frame with the recorded sequence id (lengths are
//! recomputed from the payload).

use serde::{Deserialize, Serialize};

use crate::auth::{AuthMoreData, AuthSwitchRequest, AuthSwitchResponse};
use crate::command::{
    InitDbPacket, QueryPacket, StmtClosePacket, StmtExecutePacket, StmtPreparePacket,
    StmtResetPacket, StmtSendLongDataPacket,
};
use crate::handshake::{HandshakeResponse41, HandshakeV10, SslRequest};
use crate::packet::{encode_frame, Packet, PacketHeader};
use crate::resultset::{LocalInfileRequest, ResultSet, StmtPrepareOk};
use crate::status::{EofPacket, ErrPacket, OkPacket};
use crate::{
    b64, ConnContext, DecodeError, EncodeError, COM_CHANGE_USER, COM_INIT_DB, COM_PING,
    COM_QUERY, COM_QUIT, COM_STMT_CLOSE, COM_STMT_EXECUTE, COM_STMT_PREPARE, COM_STMT_RESET,
    COM_STMT_SEND_LONG_DATA,
};

/// A packet that is stored undecoded (unknown command, LOCAL INFILE data,
/// auth blobs that differ per run).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPacket {
    pub header: PacketHeader,
    #[serde(with = "b64")]
    pub payload: Vec<u8>,
}

impl RawPacket {
    pub fn from_packet(pkt: &Packet) -> Self {
        Self {
            header: pkt.header,
            payload: pkt.payload.clone(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        encode_frame(self.header.seq_id, &self.payload)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PacketPayload {
    // Connection phase.
    HandshakeV10(HandshakeV10),
    HandshakeResponse41(HandshakeResponse41),
    SslRequest(SslRequest),
    AuthSwitchRequest(AuthSwitchRequest),
    AuthMoreData(AuthMoreData),
    AuthSwitchResponse(AuthSwitchResponse),
    PublicKeyRequest,
    /// RSA-encrypted password during full auth; bytes differ per run
    /// because of the server nonce, matched by sequence id only.
    EncryptedPassword {
        #[serde(with = "b64")]
        data: Vec<u8>,
    },

    // Status packets.
    Ok(OkPacket),
    Err(ErrPacket),
    Eof(EofPacket),

    // Command phase, client side.
    Query(QueryPacket),
    StmtPrepare(StmtPreparePacket),
    StmtExecute(StmtExecutePacket),
    StmtClose(StmtClosePacket),
    StmtReset(StmtResetPacket),
    StmtSendLongData(StmtSendLongDataPacket),
    InitDb(InitDbPacket),
    Quit,
    Ping,
    /// Declared unsupported; carried raw so the caller can reject it.
    ChangeUser {
        #[serde(with = "b64")]
        data: Vec<u8>,
    },

    // Command phase, server side.
    StmtPrepareOk(StmtPrepareOk),
    ResultSet(ResultSet),
    LocalInfileRequest(LocalInfileRequest),

    /// Fallback: anything the codec does not model, byte-preserved.
    Raw {
        #[serde(with = "b64")]
        data: Vec<u8>,
    },
}

impl PacketPayload {
    /// Stable name used for logging and for the packet-type structural
    /// match layer.
    pub fn kind(&self) -> &'static str {
        match self {
            PacketPayload::HandshakeV10(_) => "HandshakeV10",
            PacketPayload::HandshakeResponse41(_) => "HandshakeResponse41",
            PacketPayload::SslRequest(_) => "SSLRequest",
            PacketPayload::AuthSwitchRequest(_) => "AuthSwitchRequest",
            PacketPayload::AuthMoreData(_) => "AuthMoreData",
            PacketPayload::AuthSwitchResponse(_) => "AuthSwitchResponse",
            PacketPayload::PublicKeyRequest => "PublicKeyRequest",
            PacketPayload::EncryptedPassword { .. } => "EncryptedPassword",
            PacketPayload::Ok(_) => "OK",
            PacketPayload::Err(_) => "ERR",
            PacketPayload::Eof(_) => "EOF",
            PacketPayload::Query(_) => "COM_QUERY",
            PacketPayload::StmtPrepare(_) => "COM_STMT_PREPARE",
            PacketPayload::StmtExecute(_) => "COM_STMT_EXECUTE",
            PacketPayload::StmtClose(_) => "COM_STMT_CLOSE",
            PacketPayload::StmtReset(_) => "COM_STMT_RESET",
            PacketPayload::StmtSendLongData(_) => "COM_STMT_SEND_LONG_DATA",
            PacketPayload::InitDb(_) => "COM_INIT_DB",
            PacketPayload::Quit => "COM_QUIT",
            PacketPayload::Ping => "COM_PING",
            PacketPayload::ChangeUser { .. } => "COM_CHANGE_USER",
            PacketPayload::StmtPrepareOk(_) => "COM_STMT_PREPARE_OK",
            PacketPayload::ResultSet(_) => "ResultSet",
            PacketPayload::LocalInfileRequest(_) => "LocalInfileRequest",
            PacketPayload::Raw { .. } => "Raw",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketBundle {
    pub header: PacketHeader,
    pub payload: PacketPayload,
}

impl PacketBundle {
    pub fn new(header: PacketHeader, payload: PacketPayload) -> Self {
        Self { header, payload }
    }

    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }

    /// Decode a client command-phase packet. `ctx.last_command` is updated
    /// so subsequent server payloads can be interpreted.
    pub fn decode_command(pkt: &Packet, ctx: &mut ConnContext) -> Result<Self, DecodeError> {
        let command = *pkt.payload.first().ok_or(DecodeError::TooShort {
            need: 1,
            have: 0,
        })?;
        let payload = match command {
            COM_QUERY => PacketPayload::Query(QueryPacket::decode(&pkt.payload)?),
            COM_STMT_PREPARE => {
                PacketPayload::StmtPrepare(StmtPreparePacket::decode(&pkt.payload)?)
            }
            COM_STMT_EXECUTE => {
                PacketPayload::StmtExecute(StmtExecutePacket::decode(&pkt.payload, ctx)?)
            }
            COM_STMT_CLOSE => PacketPayload::StmtClose(StmtClosePacket::decode(&pkt.payload)?),
            COM_STMT_RESET => PacketPayload::StmtReset(StmtResetPacket::decode(&pkt.payload)?),
            COM_STMT_SEND_LONG_DATA => {
                PacketPayload::StmtSendLongData(StmtSendLongDataPacket::decode(&pkt.payload)?)
            }
            COM_INIT_DB => PacketPayload::InitDb(InitDbPacket::decode(&pkt.payload)?),
            COM_QUIT => PacketPayload::Quit,
            COM_PING => PacketPayload::Ping,
            COM_CHANGE_USER => PacketPayload::ChangeUser {
                data: pkt.payload.clone(),
            },
            _ => PacketPayload::Raw {
                data: pkt.payload.clone(),
            },
        };
        ctx.last_command = Some(command);
        Ok(Self {
            header: pkt.header,
            payload,
        })
    }

    /// Serialize back to wire frames: recorded sequence ids, recomputed
    /// lengths. Multi-packet payloads (result sets, prepare responses)
    /// expand to their full sequence.
    pub fn encode(&self, ctx: &ConnContext) -> Result<Vec<Vec<u8>>, EncodeError> {
        let caps = ctx.capabilities();
        let seq = self.header.seq_id;
        let single = |payload: Vec<u8>| -> Result<Vec<Vec<u8>>, EncodeError> {
            Ok(vec![encode_frame(seq, &payload)?])
        };
        match &self.payload {
            PacketPayload::HandshakeV10(p) => single(p.encode()?),
            PacketPayload::HandshakeResponse41(p) => single(p.encode()?),
            PacketPayload::SslRequest(p) => single(p.encode()),
            PacketPayload::AuthSwitchRequest(p) => single(p.encode()),
            PacketPayload::AuthMoreData(p) => single(p.encode()),
            PacketPayload::AuthSwitchResponse(p) => single(p.data.clone()),
            PacketPayload::PublicKeyRequest => single(vec![0x02]),
            PacketPayload::EncryptedPassword { data } => single(data.clone()),
            PacketPayload::Ok(p) => single(p.encode(caps)),
            PacketPayload::Err(p) => single(p.encode()),
            PacketPayload::Eof(p) => single(p.encode(caps)),
            PacketPayload::Query(p) => single(p.encode()),
            PacketPayload::StmtPrepare(p) => single(p.encode()),
            PacketPayload::StmtExecute(p) => single(p.encode()),
            PacketPayload::StmtClose(p) => single(p.encode()),
            PacketPayload::StmtReset(p) => single(p.encode()),
            PacketPayload::StmtSendLongData(p) => single(p.encode()),
            PacketPayload::InitDb(p) => single(p.encode()),
            PacketPayload::Quit => single(vec![COM_QUIT]),
            PacketPayload::Ping => single(vec![COM_PING]),
            PacketPayload::ChangeUser { data } => single(data.clone()),
            PacketPayload::StmtPrepareOk(p) => p.encode_packets(),
            PacketPayload::ResultSet(p) => p.encode_packets(),
            PacketPayload::LocalInfileRequest(p) => single(p.encode()),
            PacketPayload::Raw { data } => single(data.clone()),
        }
    }
}
