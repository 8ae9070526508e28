use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Unix seconds now, for artifact `created` stamps.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

static MOCK_COUNTER: AtomicU64 = AtomicU64::new(0);
static TESTCASE_COUNTER: AtomicU64 = AtomicU64::new(0);

pub fn next_mock_name() -> String {
    format!("mock-{}", MOCK_COUNTER.fetch_add(1, Ordering::Relaxed))
}

pub fn next_testcase_name() -> String {
    format!("test-{}", TESTCASE_COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// One buffered read, cancellable. `Ok(empty)` is EOF.
pub async fn read_chunk<S>(
    stream: &mut S,
    token: &CancellationToken,
) -> std::io::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 16 * 1024];
    tokio::select! {
        _ = token.cancelled() => Err(std::io::Error::new(
            std::io::ErrorKind::Interrupted,
            "session cancelled",
        )),
        read = stream.read(&mut buf) => {
            let n = read?;
            buf.truncate(n);
            Ok(buf)
        }
    }
}

/// Shuttle bytes both ways until either side closes or the token fires.
/// Used for passthrough ports; nothing is captured.
pub async fn shuttle<A, B>(
    mut client: A,
    mut upstream: B,
    token: &CancellationToken,
) -> std::io::Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    tokio::select! {
        _ = token.cancelled() => Ok(()),
        res = tokio::io::copy_bidirectional(&mut client, &mut upstream) => {
            let _ = client.shutdown().await;
            let _ = upstream.shutdown().await;
            res.map(|_| ())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_names_are_unique() {
        let a = next_mock_name();
        let b = next_mock_name();
        assert_ne!(a, b);
        assert!(a.starts_with("mock-"));
    }

    #[tokio::test]
    async fn read_chunk_respects_cancellation() {
        let (client, _server) = tokio::io::duplex(16);
        let token = CancellationToken::new();
        token.cancel();
        let mut client = client;
        let err = read_chunk(&mut client, &token).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::Interrupted);
    }

    #[tokio::test]
    async fn read_chunk_eof() {
        let (client, server) = tokio::io::duplex(16);
        drop(server);
        let mut client = client;
        let token = CancellationToken::new();
        let chunk = read_chunk(&mut client, &token).await.unwrap();
        assert!(chunk.is_empty());
    }
}
