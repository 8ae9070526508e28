//! Connection-phase packets: the server greeting and the client's reply.

use serde::{Deserialize, Serialize};

use crate::buf::{Reader, Writer};
use crate::{
    b64, DecodeError, EncodeError, CLIENT_CONNECT_ATTRS, CLIENT_CONNECT_WITH_DB,
    CLIENT_PLUGIN_AUTH, CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA, CLIENT_PROTOCOL_41,
    CLIENT_SECURE_CONNECTION, CLIENT_SSL,
};

/// Server greeting (`Protocol::HandshakeV10`). MySQL speaks first; this is
/// the first packet on every connection and the key for decoding everything
/// after it (capabilities, auth plugin).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeV10 {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    /// Scramble: part 1 (8 bytes) and part 2 concatenated, exactly as sent
    /// (including any trailing NUL the server chose to emit).
    #[serde(with = "b64")]
    pub auth_plugin_data: Vec<u8>,
    pub capability_flags: u32,
    pub character_set: u8,
    pub status_flags: u16,
    pub auth_plugin_name: String,
}

impl HandshakeV10 {
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(payload);
        let protocol_version = r.u8()?;
        if protocol_version != 0x0a {
            return Err(DecodeError::UnexpectedTag {
                tag: protocol_version,
                context: "HandshakeV10 protocol version",
            });
        }
        let server_version = r.nul_str("server version")?;
        let connection_id = r.u32_le()?;
        let part1 = r.bytes(8)?.to_vec();
        let _filler = r.u8()?;
        let cap_low = r.u16_le()?;
        let character_set = r.u8()?;
        let status_flags = r.u16_le()?;
        let cap_high = r.u16_le()?;
        let capability_flags = u32::from(cap_low) | (u32::from(cap_high) << 16);
        let auth_data_len = r.u8()?;
        let _reserved = r.bytes(10)?;

        let mut auth_plugin_data = part1;
        if capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            let part2_len = std::cmp::max(13, auth_data_len.saturating_sub(8) as usize);
            auth_plugin_data.extend_from_slice(r.bytes(part2_len)?);
        } else if capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            auth_plugin_data.extend_from_slice(r.bytes(13)?);
        }

        let auth_plugin_name = if capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            r.nul_str("auth plugin name")?
        } else {
            String::new()
        };
        r.finish("HandshakeV10")?;

        Ok(Self {
            protocol_version,
            server_version,
            connection_id,
            auth_plugin_data,
            capability_flags,
            character_set,
            status_flags,
            auth_plugin_name,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        if self.auth_plugin_data.len() < 8 {
            return Err(EncodeError::Unencodable {
                context: "HandshakeV10",
                reason: "auth plugin data shorter than the 8-byte scramble prefix",
            });
        }
        let mut w = Writer::new();
        w.u8(self.protocol_version);
        w.nul_str(&self.server_version);
        w.u32_le(self.connection_id);
        w.bytes(&self.auth_plugin_data[..8]);
        w.u8(0); // filler
        w.u16_le((self.capability_flags & 0xffff) as u16);
        w.u8(self.character_set);
        w.u16_le(self.status_flags);
        w.u16_le((self.capability_flags >> 16) as u16);
        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            w.u8(self.auth_plugin_data.len() as u8);
        } else {
            w.u8(0);
        }
        w.bytes(&[0u8; 10]); // reserved
        if self.capability_flags & (CLIENT_PLUGIN_AUTH | CLIENT_SECURE_CONNECTION) != 0 {
            w.bytes(&self.auth_plugin_data[8..]);
        }
        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            w.nul_str(&self.auth_plugin_name);
        }
        Ok(w.into_vec())
    }
}

/// Client reply (`HandshakeResponse41`), or just its 32-byte prefix when the
/// client asks for TLS first (`SSLRequest`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse41 {
    pub capability_flags: u32,
    pub max_packet_size: u32,
    pub character_set: u8,
    pub username: String,
    #[serde(with = "b64")]
    pub auth_response: Vec<u8>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub database: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub auth_plugin_name: String,
    /// Raw connect attributes blob, kept opaque for byte-exact re-encode.
    #[serde(default, with = "b64", skip_serializing_if = "Vec::is_empty")]
    pub connect_attrs: Vec<u8>,
}

impl HandshakeResponse41 {
    pub fn requests_ssl(&self) -> bool {
        self.capability_flags & CLIENT_SSL != 0
    }

    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(payload);
        let capability_flags = r.u32_le()?;
        if capability_flags & CLIENT_PROTOCOL_41 == 0 {
            return Err(DecodeError::UnexpectedTag {
                tag: 0,
                context: "HandshakeResponse without CLIENT_PROTOCOL_41",
            });
        }
        let max_packet_size = r.u32_le()?;
        let character_set = r.u8()?;
        let _filler = r.bytes(23)?;

        let username = r.nul_str("username")?;
        let auth_response = if capability_flags & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            r.lenenc_bytes()?.to_vec()
        } else {
            let len = r.u8()? as usize;
            r.bytes(len)?.to_vec()
        };
        let database = if capability_flags & CLIENT_CONNECT_WITH_DB != 0 {
            r.nul_str("database")?
        } else {
            String::new()
        };
        let auth_plugin_name = if capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            r.nul_str("auth plugin name")?
        } else {
            String::new()
        };
        let connect_attrs = if capability_flags & CLIENT_CONNECT_ATTRS != 0 {
            r.rest().to_vec()
        } else {
            Vec::new()
        };
        r.finish("HandshakeResponse41")?;

        Ok(Self {
            capability_flags,
            max_packet_size,
            character_set,
            username,
            auth_response,
            database,
            auth_plugin_name,
            connect_attrs,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let mut w = Writer::new();
        w.u32_le(self.capability_flags);
        w.u32_le(self.max_packet_size);
        w.u8(self.character_set);
        w.bytes(&[0u8; 23]);
        w.nul_str(&self.username);
        if self.capability_flags & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            w.lenenc_bytes(&self.auth_response);
        } else {
            w.u8(self.auth_response.len() as u8);
            w.bytes(&self.auth_response);
        }
        if self.capability_flags & CLIENT_CONNECT_WITH_DB != 0 {
            w.nul_str(&self.database);
        }
        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            w.nul_str(&self.auth_plugin_name);
        }
        if self.capability_flags & CLIENT_CONNECT_ATTRS != 0 {
            w.bytes(&self.connect_attrs);
        }
        Ok(w.into_vec())
    }
}

/// The 32-byte `SSLRequest` prefix a client sends before upgrading to TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SslRequest {
    pub capability_flags: u32,
    pub max_packet_size: u32,
    pub character_set: u8,
}

impl SslRequest {
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(payload);
        let capability_flags = r.u32_le()?;
        let max_packet_size = r.u32_le()?;
        let character_set = r.u8()?;
        let _filler = r.bytes(23)?;
        r.finish("SSLRequest")?;
        Ok(Self {
            capability_flags,
            max_packet_size,
            character_set,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.u32_le(self.capability_flags);
        w.u32_le(self.max_packet_size);
        w.u8(self.character_set);
        w.bytes(&[0u8; 23]);
        w.into_vec()
    }
}

/// A handshake-response payload is an `SSLRequest` iff it is exactly the
/// 32-byte prefix with `CLIENT_SSL` set.
pub fn is_ssl_request(payload: &[u8]) -> bool {
    payload.len() == 32 && {
        let flags = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        flags & CLIENT_SSL != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_greeting() -> HandshakeV10 {
        HandshakeV10 {
            protocol_version: 0x0a,
            server_version: "8.0.36".into(),
            connection_id: 42,
            auth_plugin_data: {
                let mut d = (1u8..=20).collect::<Vec<_>>();
                d.push(0);
                d
            },
            capability_flags: CLIENT_PROTOCOL_41
                | CLIENT_PLUGIN_AUTH
                | CLIENT_SECURE_CONNECTION
                | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA,
            character_set: 0xff,
            status_flags: 0x0002,
            auth_plugin_name: "caching_sha2_password".into(),
        }
    }

    #[test]
    fn handshake_v10_roundtrip() {
        let hs = sample_greeting();
        let wire = hs.encode().unwrap();
        let back = HandshakeV10::decode(&wire).unwrap();
        assert_eq!(back, hs);
        // Re-encode must be byte identical.
        assert_eq!(back.encode().unwrap(), wire);
    }

    #[test]
    fn handshake_response_roundtrip() {
        let resp = HandshakeResponse41 {
            capability_flags: CLIENT_PROTOCOL_41
                | CLIENT_PLUGIN_AUTH
                | CLIENT_SECURE_CONNECTION
                | CLIENT_CONNECT_WITH_DB,
            max_packet_size: 1 << 24,
            character_set: 0xff,
            username: "app".into(),
            auth_response: vec![0xaa; 20],
            database: "orders".into(),
            auth_plugin_name: "mysql_native_password".into(),
            connect_attrs: Vec::new(),
        };
        let wire = resp.encode().unwrap();
        let back = HandshakeResponse41::decode(&wire).unwrap();
        assert_eq!(back, resp);
        assert_eq!(back.encode().unwrap(), wire);
    }

    #[test]
    fn ssl_request_detection() {
        let req = SslRequest {
            capability_flags: CLIENT_PROTOCOL_41 | CLIENT_SSL,
            max_packet_size: 1 << 24,
            character_set: 0xff,
        };
        let wire = req.encode();
        assert!(is_ssl_request(&wire));
        assert_eq!(SslRequest::decode(&wire).unwrap(), req);

        let full = HandshakeResponse41 {
            capability_flags: CLIENT_PROTOCOL_41,
            max_packet_size: 0,
            character_set: 8,
            username: "u".into(),
            auth_response: Vec::new(),
            database: String::new(),
            auth_plugin_name: String::new(),
            connect_attrs: Vec::new(),
        }
        .encode()
        .unwrap();
        assert!(!is_ssl_request(&full));
    }
}
