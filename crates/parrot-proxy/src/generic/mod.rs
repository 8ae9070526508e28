//! Generic handler for unclassified byte streams: direction-tagged frame
//! capture on record, frame-scripted playback on replay.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use parrot_match::{adaptive_k, is_ascii_printable, jaccard_similarity, levenshtein, shingles, MockStore};
use parrot_model::{
    Direction, GenericFrame, GenericSpec, Mock, MockKind, MockSpec, Payload,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::session::Session;
use crate::util;

/// Replay pacing never sleeps longer than this, however long the recorded
/// gap was.
const MAX_REPLAY_DELAY: Duration = Duration::from_secs(1);

/// Record an unclassified connection: shuttle bytes both ways, keeping
/// every read as a frame with its direction and inter-frame delay.
pub async fn record<C, U>(
    mut client: C,
    mut upstream: U,
    session: &Arc<Session>,
    token: &CancellationToken,
) -> anyhow::Result<()>
where
    C: AsyncRead + AsyncWrite + Send + Unpin,
    U: AsyncRead + AsyncWrite + Send + Unpin,
{
    let mut frames: Vec<GenericFrame> = Vec::new();
    let mut last_frame_at = tokio::time::Instant::now();
    let mut client_buf = vec![0u8; 16 * 1024];
    let mut upstream_buf = vec![0u8; 16 * 1024];

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            read = client.read(&mut client_buf) => {
                let n = read?;
                if n == 0 {
                    break;
                }
                upstream.write_all(&client_buf[..n]).await?;
                upstream.flush().await?;
                push_frame(&mut frames, Direction::Client, &client_buf[..n], &mut last_frame_at);
            }
            read = upstream.read(&mut upstream_buf) => {
                let n = read?;
                if n == 0 {
                    break;
                }
                client.write_all(&upstream_buf[..n]).await?;
                client.flush().await?;
                push_frame(&mut frames, Direction::Server, &upstream_buf[..n], &mut last_frame_at);
            }
        }
    }

    let _ = client.shutdown().await;
    let _ = upstream.shutdown().await;

    if frames.is_empty() {
        return Ok(());
    }

    let mock = Mock {
        version: parrot_model::API_VERSION.to_string(),
        name: util::next_mock_name(),
        metadata: Default::default(),
        created: util::unix_now(),
        spec: MockSpec::Generic(GenericSpec { frames }),
    };
    if let Some(tx) = &session.mock_tx {
        if tx.send(mock).await.is_err() {
            warn!("mock channel closed; generic capture dropped");
        }
    }
    Ok(())
}

fn push_frame(
    frames: &mut Vec<GenericFrame>,
    direction: Direction,
    data: &[u8],
    last_frame_at: &mut tokio::time::Instant,
) {
    let now = tokio::time::Instant::now();
    let delay = now.duration_since(*last_frame_at);
    *last_frame_at = now;
    frames.push(GenericFrame {
        direction,
        payload: Payload::from_bytes(data),
        read_delay_ns: delay.as_nanos().min(u128::from(u64::MAX)) as u64,
    });
}

/// Replay: select a recorded connection by its first client frame, then
/// play the frame script — writing server frames, reading client frames —
/// until the mock is exhausted. Repeats for further requests on the same
/// connection.
pub async fn replay<C>(
    mut client: C,
    dest: std::net::SocketAddr,
    session: &Arc<Session>,
    token: &CancellationToken,
) -> anyhow::Result<()>
where
    C: AsyncRead + AsyncWrite + Send + Unpin,
{
    loop {
        let has_candidates = session
            .store
            .list_filtered()
            .iter()
            .any(|m| m.kind() == MockKind::Generic);
        if !has_candidates {
            debug!(%dest, "no generic mocks left; closing");
            break;
        }

        // A server-first recording opens with a server frame and needs no
        // initial read.
        let server_first = session
            .store
            .list_filtered()
            .iter()
            .filter_map(|m| m.as_generic())
            .filter_map(|spec| spec.frames.first())
            .all(|f| f.direction == Direction::Server);

        let initial = if server_first {
            Vec::new()
        } else {
            let chunk = util::read_chunk(&mut client, token)
                .await
                .context("read initial generic request")?;
            if chunk.is_empty() {
                break;
            }
            chunk
        };

        let Some(mock) = select_mock(&initial, session.store.as_ref()) else {
            debug!("no matching generic mock");
            break;
        };
        let spec = mock.as_generic().expect("matcher returned non-generic mock");
        play_frames(&mut client, spec, &initial, token).await?;
    }

    let _ = client.shutdown().await;
    Ok(())
}

/// Exact first-frame equality wins; otherwise the fuzzy fallback
/// (Levenshtein for printable payloads, Jaccard shingles for binary).
fn select_mock(initial: &[u8], store: &dyn MockStore) -> Option<Arc<Mock>> {
    loop {
        let snapshot = store.list_filtered();
        let candidates: Vec<(Arc<Mock>, Vec<u8>)> = snapshot
            .iter()
            .filter(|m| m.kind() == MockKind::Generic)
            .filter_map(|m| {
                let spec = m.as_generic()?;
                let first_client = spec
                    .requests()
                    .next()
                    .and_then(|f| f.payload.to_bytes())
                    .unwrap_or_default();
                Some((Arc::clone(m), first_client))
            })
            .collect();
        if candidates.is_empty() {
            return None;
        }

        if let Some((mock, _)) = candidates.iter().find(|(_, body)| body == initial) {
            if store.delete_filtered(mock) {
                return Some(Arc::clone(mock));
            }
            continue;
        }

        let winner = if is_ascii_printable(initial) {
            candidates
                .iter()
                .filter(|(_, body)| is_ascii_printable(body))
                .min_by_key(|(_, body)| levenshtein(initial, body))
                .map(|(m, _)| Arc::clone(m))
        } else {
            None
        };
        let winner = winner.unwrap_or_else(|| {
            let k = adaptive_k(initial.len(), 3, 8, 5);
            let initial_shingles = shingles(initial, k);
            let mut best = 0usize;
            let mut best_sim = -1.0f64;
            for (idx, (_, body)) in candidates.iter().enumerate() {
                let sim = jaccard_similarity(&initial_shingles, &shingles(body, k));
                if sim > best_sim {
                    best_sim = sim;
                    best = idx;
                }
            }
            Arc::clone(&candidates[best].0)
        });

        if store.delete_filtered(&winner) {
            return Some(winner);
        }
    }
}

async fn play_frames<C>(
    client: &mut C,
    spec: &GenericSpec,
    initial: &[u8],
    token: &CancellationToken,
) -> anyhow::Result<()>
where
    C: AsyncRead + AsyncWrite + Send + Unpin,
{
    let mut consumed_initial = initial.is_empty();
    for frame in &spec.frames {
        match frame.direction {
            Direction::Server => {
                let delay = Duration::from_nanos(frame.read_delay_ns).min(MAX_REPLAY_DELAY);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let bytes = frame.payload.to_bytes().unwrap_or_default();
                client.write_all(&bytes).await?;
                client.flush().await?;
            }
            Direction::Client => {
                if !consumed_initial {
                    // The first client frame was consumed for matching.
                    consumed_initial = true;
                    continue;
                }
                let chunk = util::read_chunk(client, token).await?;
                if chunk.is_empty() {
                    debug!("client closed mid-script");
                    return Ok(());
                }
                let expected = frame.payload.to_bytes().unwrap_or_default();
                if chunk != expected {
                    debug!(
                        got = chunk.len(),
                        expected = expected.len(),
                        "generic frame differs from recording; continuing"
                    );
                }
            }
        }
    }
    Ok(())
}
