//! Protocol classification from the first few bytes of a connection.

/// Protocols the proxy speaks natively; everything else is `Generic`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http,
    Tls,
    MySql,
    Generic,
}

const HTTP_PREFIXES: &[&[u8]] = &[
    b"GET ", b"POST ", b"PUT ", b"HEAD ", b"DELETE ", b"PATCH ", b"OPTIONS ", b"HTTP/",
];

pub fn is_http_prefix(buf: &[u8]) -> bool {
    HTTP_PREFIXES
        .iter()
        .any(|prefix| starts_with_partial(buf, prefix))
}

// A short peek that is a prefix of the token still counts; the handler
// reads the full request line anyway.
fn starts_with_partial(buf: &[u8], token: &[u8]) -> bool {
    if buf.len() >= token.len() {
        buf.starts_with(token)
    } else {
        !buf.is_empty() && token.starts_with(buf)
    }
}

/// TLS handshake record: content type 0x16, version major 0x03.
pub fn is_tls_client_hello(buf: &[u8]) -> bool {
    buf.len() >= 2 && buf[0] == 0x16 && buf[1] == 0x03
}

/// A server-first greeting that frames as a MySQL packet with sequence id 0
/// and a HandshakeV10 payload (protocol version 0x0a).
pub fn is_mysql_greeting(buf: &[u8]) -> bool {
    if buf.len() < 5 {
        return false;
    }
    let length = u32::from_le_bytes([buf[0], buf[1], buf[2], 0]) as usize;
    let seq = buf[3];
    let tag = buf[4];
    seq == 0 && tag == 0x0a && length >= 1
}

/// Classify a client-first byte prefix.
pub fn classify(buf: &[u8]) -> Protocol {
    if is_tls_client_hello(buf) {
        Protocol::Tls
    } else if is_http_prefix(buf) {
        Protocol::Http
    } else {
        Protocol::Generic
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_verbs_classify() {
        for req in [
            "GET /x HTTP/1.1",
            "POST / HTTP/1.1",
            "DELETE /y HTTP/1.1",
            "OPTIONS * HTTP/1.1",
            "HTTP/1.1 200 OK",
        ] {
            assert_eq!(classify(req.as_bytes()), Protocol::Http, "{req}");
        }
    }

    #[test]
    fn tls_hello_classifies() {
        assert_eq!(classify(&[0x16, 0x03, 0x01, 0x02, 0x00]), Protocol::Tls);
    }

    #[test]
    fn binary_junk_is_generic() {
        assert_eq!(classify(&[0x00, 0x01, 0x02]), Protocol::Generic);
        assert_eq!(classify(b"REDIS*1\r\n"), Protocol::Generic);
    }

    #[test]
    fn mysql_greeting_detection() {
        // 74-byte handshake, seq 0, protocol version 0x0a.
        let mut greeting = vec![74, 0, 0, 0, 0x0a];
        greeting.extend_from_slice(b"8.0.36\0");
        assert!(is_mysql_greeting(&greeting));
        assert!(!is_mysql_greeting(b"GET / HTTP/1.1"));
        // Wrong sequence id.
        assert!(!is_mysql_greeting(&[10, 0, 0, 1, 0x0a]));
    }
}
