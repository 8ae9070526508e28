//! Whole-packet socket I/O. Handlers never read partial frames.

use std::io;
use std::time::Duration;

use parrot_mysql::packet::{Packet, HEADER_LEN};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Read one framed packet. `Ok(None)` is a clean EOF at a packet boundary;
/// EOF mid-frame is an error.
pub async fn read_packet<S>(
    stream: &mut S,
    token: &CancellationToken,
) -> io::Result<Option<Packet>>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    let read_header = async {
        match stream.read_exact(&mut header).await {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
            Err(err) => Err(err),
        }
    };
    let got_header = tokio::select! {
        _ = token.cancelled() => {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "session cancelled"))
        }
        res = read_header => res?,
    };
    if !got_header {
        return Ok(None);
    }

    let length = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
    let seq_id = header[3];
    let mut payload = vec![0u8; length];
    tokio::select! {
        _ = token.cancelled() => {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "session cancelled"))
        }
        res = stream.read_exact(&mut payload) => { res?; }
    }
    Ok(Some(Packet::new(seq_id, payload)))
}

/// Like [`read_packet`] but with an idle deadline on the first header byte;
/// expiry reads as a clean EOF, which closes the connection quietly.
pub async fn read_packet_deadline<S>(
    stream: &mut S,
    token: &CancellationToken,
    deadline: Duration,
) -> io::Result<Option<Packet>>
where
    S: AsyncRead + Unpin,
{
    match tokio::time::timeout(deadline, read_packet(stream, token)).await {
        Ok(result) => result,
        Err(_elapsed) => Ok(None),
    }
}

pub async fn write_frame<S>(stream: &mut S, frame: &[u8]) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(frame).await?;
    stream.flush().await
}

pub async fn write_frames<S>(stream: &mut S, frames: &[Vec<u8>]) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    for frame in frames {
        stream.write_all(frame).await?;
    }
    stream.flush().await
}
