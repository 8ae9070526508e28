//! Client-stream abstraction with lookahead.
//!
//! Protocol classification needs a few bytes before any handler consumes
//! them, and a TLS upgrade mid-connection must not lose buffered
//! plaintext. `PeekStream` wraps any byte stream with a replay buffer and
//! itself implements `AsyncRead + AsyncWrite`, so TLS-upgraded streams wrap
//! back into a `PeekStream` and keep the same interface.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// Marker for boxed bidirectional streams.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

pub type BoxedStream = Box<dyn ByteStream>;

pub struct PeekStream<S> {
    inner: S,
    buffer: Vec<u8>,
    /// Bytes of `buffer` already handed to `poll_read`.
    consumed: usize,
}

impl<S: AsyncRead + AsyncWrite + Send + Unpin> PeekStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            consumed: 0,
        }
    }

    /// Return at least `n` buffered bytes without consuming them, reading
    /// from the underlying stream as needed. Returns fewer on EOF.
    pub async fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        while self.pending().len() < n {
            let mut chunk = [0u8; 4096];
            let read = self.inner.read(&mut chunk).await?;
            if read == 0 {
                break;
            }
            self.buffer.extend_from_slice(&chunk[..read]);
        }
        Ok(self.pending())
    }

    fn pending(&self) -> &[u8] {
        &self.buffer[self.consumed..]
    }

    pub fn into_inner(self) -> (S, Vec<u8>) {
        let unread = self.buffer[self.consumed..].to_vec();
        (self.inner, unread)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.consumed < self.buffer.len() {
            let available = self.buffer.len() - self.consumed;
            let take = available.min(buf.remaining());
            buf.put_slice(&self.buffer[self.consumed..self.consumed + take]);
            self.consumed += take;
            if self.consumed == self.buffer.len() {
                self.buffer.clear();
                self.consumed = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn peek_then_read_returns_same_bytes() {
        let (client, mut server) = tokio::io::duplex(64);
        server.write_all(b"GET /ping HTTP/1.1\r\n").await.unwrap();

        let mut stream = PeekStream::new(client);
        let prefix = stream.peek(8).await.unwrap();
        assert_eq!(&prefix[..8], b"GET /pin");
        // Peeking again does not consume.
        let prefix = stream.peek(4).await.unwrap();
        assert_eq!(&prefix[..4], b"GET ");

        let mut out = vec![0u8; 20];
        stream.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"GET /ping HTTP/1.1\r\n");
    }

    #[tokio::test]
    async fn peek_short_on_eof() {
        let (client, server) = tokio::io::duplex(64);
        drop(server);
        let mut stream = PeekStream::new(client);
        let prefix = stream.peek(8).await.unwrap();
        assert!(prefix.is_empty());
    }

    #[tokio::test]
    async fn writes_pass_through() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut stream = PeekStream::new(client);
        stream.write_all(b"hello").await.unwrap();
        stream.flush().await.unwrap();
        let mut out = [0u8; 5];
        server.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"hello");
    }
}
