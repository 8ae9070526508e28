//! Packet framing: `[len: u24 LE][seq: u8][payload]`.

use serde::{Deserialize, Serialize};

use crate::{DecodeError, EncodeError};

/// Largest payload a single frame can carry.
pub const MAX_PAYLOAD_LEN: usize = 0xff_ffff;

pub const HEADER_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketHeader {
    pub length: u32,
    pub seq_id: u8,
}

/// One framed packet as read off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(seq_id: u8, payload: Vec<u8>) -> Self {
        Self {
            header: PacketHeader {
                length: payload.len() as u32,
                seq_id,
            },
            payload,
        }
    }

    /// Parse one packet from the front of `buf`, returning it and the number
    /// of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Packet, usize), DecodeError> {
        if buf.len() < HEADER_LEN {
            return Err(DecodeError::TooShort {
                need: HEADER_LEN,
                have: buf.len(),
            });
        }
        let length = u32::from_le_bytes([buf[0], buf[1], buf[2], 0]);
        let seq_id = buf[3];
        let total = HEADER_LEN + length as usize;
        if buf.len() < total {
            return Err(DecodeError::Truncated {
                expected: length as usize,
                have: buf.len() - HEADER_LEN,
            });
        }
        Ok((
            Packet {
                header: PacketHeader { length, seq_id },
                payload: buf[HEADER_LEN..total].to_vec(),
            },
            total,
        ))
    }

    /// Serialize with the recorded header. The recorded length is trusted
    /// only when it matches the payload; a re-encoded payload whose size
    /// changed gets a recomputed length (sequence id always preserved).
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        encode_frame(self.header.seq_id, &self.payload)
    }
}

/// Frame `payload` with a freshly computed length and the given sequence id.
pub fn encode_frame(seq_id: u8, payload: &[u8]) -> Result<Vec<u8>, EncodeError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(EncodeError::Oversize { len: payload.len() });
    }
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes()[..3]);
    out.push(seq_id);
    out.extend_from_slice(payload);
    Ok(out)
}

/// Split a buffer of concatenated frames into packets. Errors if the buffer
/// ends mid-frame.
pub fn split_packets(mut buf: &[u8]) -> Result<Vec<Packet>, DecodeError> {
    let mut out = Vec::new();
    while !buf.is_empty() {
        let (pkt, used) = Packet::decode(buf)?;
        buf = &buf[used..];
        out.push(pkt);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn frame_roundtrip() {
        let pkt = Packet::new(3, vec![0x03, b'S', b'E', b'L']);
        let wire = pkt.encode().unwrap();
        assert_eq!(wire[..4], [4, 0, 0, 3]);
        let (back, used) = Packet::decode(&wire).unwrap();
        assert_eq!(used, wire.len());
        assert_eq!(back, pkt);
    }

    #[test]
    fn split_multiple() {
        let mut wire = Packet::new(0, vec![1]).encode().unwrap();
        wire.extend(Packet::new(1, vec![2, 3]).encode().unwrap());
        let pkts = split_packets(&wire).unwrap();
        assert_eq!(pkts.len(), 2);
        assert_eq!(pkts[0].payload, vec![1]);
        assert_eq!(pkts[1].header.seq_id, 1);
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let wire = Packet::new(0, vec![1, 2, 3, 4]).encode().unwrap();
        assert!(matches!(
            Packet::decode(&wire[..6]),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn empty_payload_frames() {
        // COM_STMT_CLOSE-style zero-length payloads never occur, but empty
        // auth-switch responses do.
        let pkt = Packet::new(5, Vec::new());
        let wire = pkt.encode().unwrap();
        assert_eq!(wire, vec![0, 0, 0, 5]);
        let (back, _) = Packet::decode(&wire).unwrap();
        assert_eq!(back, pkt);
    }
}
