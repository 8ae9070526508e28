use base64::Engine as _;
use serde::{Deserialize, Serialize};

/// A byte string that serializes as UTF-8 when it can and base64 otherwise.
///
/// Captured traffic is arbitrary bytes but the artifacts must stay readable
/// for the common textual case, so the encoding is chosen per payload and
/// recorded alongside the data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub encoding: PayloadEncoding,
    pub data: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadEncoding {
    Utf8,
    Base64,
}

impl Payload {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        match std::str::from_utf8(bytes) {
            Ok(text) => Payload {
                encoding: PayloadEncoding::Utf8,
                data: text.to_string(),
            },
            Err(_) => Payload {
                encoding: PayloadEncoding::Base64,
                data: base64::engine::general_purpose::STANDARD.encode(bytes),
            },
        }
    }

    pub fn empty() -> Self {
        Payload {
            encoding: PayloadEncoding::Utf8,
            data: String::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Decode back to raw bytes. Base64 payloads written by this crate always
    /// decode; hand-edited artifacts may not, hence the `Option`.
    pub fn to_bytes(&self) -> Option<Vec<u8>> {
        match self.encoding {
            PayloadEncoding::Utf8 => Some(self.data.as_bytes().to_vec()),
            PayloadEncoding::Base64 => base64::engine::general_purpose::STANDARD
                .decode(&self.data)
                .ok(),
        }
    }
}

impl Default for Payload {
    fn default() -> Self {
        Payload::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn utf8_roundtrip() {
        let p = Payload::from_bytes(b"SELECT 1");
        assert_eq!(p.encoding, PayloadEncoding::Utf8);
        assert_eq!(p.to_bytes().unwrap(), b"SELECT 1".to_vec());
    }

    #[test]
    fn binary_roundtrip() {
        let raw = [0x00u8, 0xff, 0x16, 0x03, 0x01];
        let p = Payload::from_bytes(&raw);
        assert_eq!(p.encoding, PayloadEncoding::Base64);
        assert_eq!(p.to_bytes().unwrap(), raw.to_vec());
    }
}
