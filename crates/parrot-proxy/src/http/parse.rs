//! HTTP/1.x message framing.
//!
//! The recorder forwards the exact bytes it read, so every parsed message
//! keeps its raw wire image (`raw`) alongside the decoded head and body.
//! Chunked bodies are de-framed for capture; the raw image keeps the chunk
//! framing.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};

#[derive(Debug, Clone)]
pub struct RawRequest {
    pub method: String,
    pub target: String,
    pub proto_major: u8,
    pub proto_minor: u8,
    /// Header fields in arrival order, names as sent.
    pub headers: Vec<(String, String)>,
    /// Decoded body (chunked framing removed).
    pub body: Vec<u8>,
    /// Exact bytes consumed for this message.
    pub raw: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status_code: u16,
    pub reason: String,
    pub proto_major: u8,
    pub proto_minor: u8,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub raw: Vec<u8>,
}

pub fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

/// Buffered reader that remembers every byte it consumed.
pub struct MessageReader<'a, S> {
    stream: &'a mut S,
    buf: Vec<u8>,
    pos: usize,
    raw: Vec<u8>,
    /// Inactivity limit per read once the message has started (the
    /// inter-chunk timeout). The wait for the first byte is unbounded;
    /// idle keep-alive connections are closed by cancellation, not here.
    read_timeout: Duration,
    started: bool,
}

impl<'a, S: AsyncRead + Unpin> MessageReader<'a, S> {
    pub fn new(stream: &'a mut S, read_timeout: Duration) -> Self {
        Self {
            stream,
            buf: Vec::new(),
            pos: 0,
            raw: Vec::new(),
            read_timeout,
            started: false,
        }
    }

    async fn fill(&mut self) -> io::Result<usize> {
        let mut chunk = [0u8; 8 * 1024];
        let n = if self.started {
            tokio::time::timeout(self.read_timeout, self.stream.read(&mut chunk))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "http read timed out"))??
        } else {
            self.stream.read(&mut chunk).await?
        };
        if n > 0 {
            self.started = true;
        }
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    fn take(&mut self, n: usize) -> Vec<u8> {
        let out = self.buf[self.pos..self.pos + n].to_vec();
        self.pos += n;
        self.raw.extend_from_slice(&out);
        out
    }

    fn available(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Consume through the next CRLF, returning the line without it.
    async fn read_line(&mut self) -> io::Result<Vec<u8>> {
        loop {
            if let Some(idx) = find_crlf(&self.buf[self.pos..]) {
                let line = self.take(idx + 2);
                return Ok(line[..idx].to_vec());
            }
            if self.fill().await? == 0 {
                return Err(invalid("eof mid-line"));
            }
        }
    }

    async fn read_exact_bytes(&mut self, n: usize) -> io::Result<Vec<u8>> {
        while self.available() < n {
            if self.fill().await? == 0 {
                return Err(invalid("eof mid-body"));
            }
        }
        Ok(self.take(n))
    }

    async fn read_to_eof(&mut self) -> io::Result<Vec<u8>> {
        loop {
            if self.fill().await? == 0 {
                let n = self.available();
                return Ok(self.take(n));
            }
        }
    }

    /// True at clean EOF before any byte of a new message.
    async fn at_eof(&mut self) -> io::Result<bool> {
        if self.available() > 0 {
            return Ok(false);
        }
        Ok(self.fill().await? == 0)
    }

    async fn read_headers(&mut self) -> io::Result<Vec<(String, String)>> {
        let mut headers = Vec::new();
        loop {
            let line = self.read_line().await?;
            if line.is_empty() {
                return Ok(headers);
            }
            let text = String::from_utf8(line).map_err(|_| invalid("non-utf8 header"))?;
            let (name, value) = text
                .split_once(':')
                .ok_or_else(|| invalid("header without colon"))?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    /// De-framed chunked body; trailers are consumed into `raw`.
    async fn read_chunked(&mut self) -> io::Result<Vec<u8>> {
        let mut body = Vec::new();
        loop {
            let size_line = self.read_line().await?;
            let size_text = std::str::from_utf8(&size_line)
                .map_err(|_| invalid("non-utf8 chunk size"))?;
            let size_text = size_text.split(';').next().unwrap_or("").trim();
            let size = usize::from_str_radix(size_text, 16)
                .map_err(|_| invalid("bad chunk size"))?;
            if size == 0 {
                // Trailer section up to the final blank line.
                loop {
                    let line = self.read_line().await?;
                    if line.is_empty() {
                        return Ok(body);
                    }
                }
            }
            let chunk = self.read_exact_bytes(size).await?;
            body.extend_from_slice(&chunk);
            let crlf = self.read_exact_bytes(2).await?;
            if crlf != b"\r\n" {
                return Err(invalid("chunk not CRLF-terminated"));
            }
        }
    }

    async fn read_body(
        &mut self,
        headers: &[(String, String)],
        allow_eof_body: bool,
    ) -> io::Result<Vec<u8>> {
        if header_value(headers, "Transfer-Encoding")
            .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
        {
            return self.read_chunked().await;
        }
        if let Some(len) = header_value(headers, "Content-Length") {
            let len: usize = len.trim().parse().map_err(|_| invalid("bad content-length"))?;
            return self.read_exact_bytes(len).await;
        }
        if allow_eof_body {
            return self.read_to_eof().await;
        }
        Ok(Vec::new())
    }

    fn into_raw(self) -> Vec<u8> {
        self.raw
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn parse_version(text: &str) -> io::Result<(u8, u8)> {
    let rest = text
        .strip_prefix("HTTP/")
        .ok_or_else(|| invalid("bad http version"))?;
    let (major, minor) = rest.split_once('.').ok_or_else(|| invalid("bad http version"))?;
    Ok((
        major.parse().map_err(|_| invalid("bad http version"))?,
        minor.parse().map_err(|_| invalid("bad http version"))?,
    ))
}

/// Read one request; `Ok(None)` on clean EOF (keep-alive peer went away).
pub async fn read_request<S>(
    stream: &mut S,
    read_timeout: Duration,
) -> io::Result<Option<RawRequest>>
where
    S: AsyncRead + Unpin,
{
    let mut reader = MessageReader::new(stream, read_timeout);
    if reader.at_eof().await? {
        return Ok(None);
    }

    let line = reader.read_line().await?;
    let text = String::from_utf8(line).map_err(|_| invalid("non-utf8 request line"))?;
    let mut parts = text.split_whitespace();
    let method = parts.next().ok_or_else(|| invalid("empty request line"))?;
    let target = parts.next().ok_or_else(|| invalid("request line without target"))?;
    let version = parts.next().ok_or_else(|| invalid("request line without version"))?;
    let (proto_major, proto_minor) = parse_version(version)?;

    let headers = reader.read_headers().await?;
    let body = reader.read_body(&headers, false).await?;

    Ok(Some(RawRequest {
        method: method.to_string(),
        target: target.to_string(),
        proto_major,
        proto_minor,
        headers,
        body,
        raw: reader.into_raw(),
    }))
}

/// Read one response. `head_request` suppresses the body; 1xx/204/304 never
/// carry one.
pub async fn read_response<S>(
    stream: &mut S,
    head_request: bool,
    read_timeout: Duration,
) -> io::Result<RawResponse>
where
    S: AsyncRead + Unpin,
{
    let mut reader = MessageReader::new(stream, read_timeout);
    let line = reader.read_line().await?;
    let text = String::from_utf8(line).map_err(|_| invalid("non-utf8 status line"))?;

    let mut parts = text.splitn(3, ' ');
    let version = parts.next().ok_or_else(|| invalid("empty status line"))?;
    let (proto_major, proto_minor) = parse_version(version)?;
    let status_code: u16 = parts
        .next()
        .ok_or_else(|| invalid("status line without code"))?
        .parse()
        .map_err(|_| invalid("bad status code"))?;
    let reason = parts.next().unwrap_or("").to_string();

    let headers = reader.read_headers().await?;
    let bodyless =
        head_request || (100..200).contains(&status_code) || status_code == 204 || status_code == 304;
    let body = if bodyless {
        Vec::new()
    } else {
        let has_framing = header_value(&headers, "Content-Length").is_some()
            || header_value(&headers, "Transfer-Encoding").is_some();
        reader.read_body(&headers, !has_framing).await?
    };

    Ok(RawResponse {
        status_code,
        reason,
        proto_major,
        proto_minor,
        headers,
        body,
        raw: reader.into_raw(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::io::AsyncWriteExt;

    const TIMEOUT: Duration = Duration::from_secs(5);

    async fn feed(bytes: &'static [u8]) -> tokio::io::DuplexStream {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        server.write_all(bytes).await.unwrap();
        drop(server);
        client
    }

    #[tokio::test]
    async fn request_with_content_length() {
        let mut stream =
            feed(b"POST /api HTTP/1.1\r\nHost: svc\r\nContent-Length: 5\r\n\r\nhello").await;
        let req = read_request(&mut stream, TIMEOUT).await.unwrap().unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.target, "/api");
        assert_eq!(req.proto_minor, 1);
        assert_eq!(req.body, b"hello");
        assert_eq!(header_value(&req.headers, "host"), Some("svc"));
        assert_eq!(
            req.raw,
            b"POST /api HTTP/1.1\r\nHost: svc\r\nContent-Length: 5\r\n\r\nhello".to_vec()
        );
    }

    #[tokio::test]
    async fn clean_eof_yields_none() {
        let mut stream = feed(b"").await;
        assert!(read_request(&mut stream, TIMEOUT).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn chunked_response_is_deframed_but_raw_keeps_framing() {
        let wire = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let mut stream = feed(wire).await;
        let resp = read_response(&mut stream, false, TIMEOUT).await.unwrap();
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.body, b"hello world");
        assert_eq!(resp.raw, wire.to_vec());
    }

    #[tokio::test]
    async fn response_without_framing_reads_to_eof() {
        let mut stream = feed(b"HTTP/1.0 200 OK\r\n\r\nstreamed").await;
        let resp = read_response(&mut stream, false, TIMEOUT).await.unwrap();
        assert_eq!(resp.body, b"streamed");
        assert_eq!(resp.proto_minor, 0);
    }

    #[tokio::test]
    async fn head_response_has_no_body() {
        let mut stream = feed(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n").await;
        let resp = read_response(&mut stream, true, TIMEOUT).await.unwrap();
        assert!(resp.body.is_empty());
    }

    #[tokio::test]
    async fn stalled_chunk_times_out() {
        let (client, mut server) = tokio::io::duplex(1024);
        server
            .write_all(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhel")
            .await
            .unwrap();
        // Keep the writer open but silent; the inter-chunk timeout fires.
        let mut client = client;
        let err = read_response(&mut client, false, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        drop(server);
    }
}
