//! Post-handshake authentication packets.

use serde::{Deserialize, Serialize};

use crate::buf::{Reader, Writer};
use crate::{b64, DecodeError, FAST_AUTH_SUCCESS, PERFORM_FULL_AUTHENTICATION};

/// Server asks the client to restart auth with a different plugin (0xFE with
/// a payload long enough to not be an EOF).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSwitchRequest {
    pub plugin_name: String,
    #[serde(with = "b64")]
    pub plugin_data: Vec<u8>,
}

impl AuthSwitchRequest {
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(payload);
        let tag = r.u8()?;
        if tag != 0xfe {
            return Err(DecodeError::UnexpectedTag {
                tag,
                context: "AuthSwitchRequest",
            });
        }
        let plugin_name = r.nul_str("auth switch plugin name")?;
        let plugin_data = r.rest().to_vec();
        Ok(Self {
            plugin_name,
            plugin_data,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.u8(0xfe);
        w.nul_str(&self.plugin_name);
        w.bytes(&self.plugin_data);
        w.into_vec()
    }
}

/// Extra auth data from the server (0x01). For caching_sha2_password a
/// single data byte selects the sub-state; during full auth it carries the
/// server's RSA public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthMoreData {
    #[serde(with = "b64")]
    pub data: Vec<u8>,
}

impl AuthMoreData {
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(payload);
        let tag = r.u8()?;
        if tag != 0x01 {
            return Err(DecodeError::UnexpectedTag {
                tag,
                context: "AuthMoreData",
            });
        }
        Ok(Self {
            data: r.rest().to_vec(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.data.len());
        out.push(0x01);
        out.extend_from_slice(&self.data);
        out
    }

    /// caching_sha2_password sub-state, when this is the one-byte selector.
    pub fn caching_sha2_state(&self) -> Option<CachingSha2State> {
        match self.data.as_slice() {
            [FAST_AUTH_SUCCESS] => Some(CachingSha2State::FastAuthSuccess),
            [PERFORM_FULL_AUTHENTICATION] => Some(CachingSha2State::PerformFullAuthentication),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachingSha2State {
    FastAuthSuccess,
    PerformFullAuthentication,
}

/// Client's answer to an auth switch: opaque plugin-specific bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSwitchResponse {
    #[serde(with = "b64")]
    pub data: Vec<u8>,
}

/// In caching_sha2 full auth over plaintext, the client requests the
/// server's public key with a single 0x02 byte.
pub fn is_public_key_request(payload: &[u8]) -> bool {
    payload == [0x02]
}
