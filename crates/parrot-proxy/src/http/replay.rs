use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use parrot_model::HttpSpec;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ProxyConfig;
use crate::session::Session;
use crate::tls::CertAuthority;

use super::matching::{match_request, MatchParams};
use super::parse::{read_request, read_response, RawRequest};
use super::{gzip_encode, wants_close};

const NO_MATCH_RESPONSE: &[u8] =
    b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// Replay mode: answer each request from the mock store. Upstream is only
/// dialed when the session opts into fallback-on-miss.
pub async fn replay<C>(
    mut client: C,
    dest: SocketAddr,
    tls_host: Option<String>,
    session: &Arc<Session>,
    token: &CancellationToken,
    cfg: &ProxyConfig,
    tls: Option<&CertAuthority>,
) -> anyhow::Result<()>
where
    C: AsyncRead + AsyncWrite + Send + Unpin,
{
    loop {
        let req = tokio::select! {
            _ = token.cancelled() => break,
            req = read_request(&mut client, cfg.chunk_timeout) => req,
        };
        let req = match req {
            Ok(Some(req)) => req,
            Ok(None) => break,
            Err(err) => {
                debug!("http replay connection ended: {err}");
                break;
            }
        };

        let path = req.target.split('?').next().unwrap_or("/").to_string();
        let header_keys: BTreeSet<String> = req
            .headers
            .iter()
            .map(|(k, _)| k.to_ascii_lowercase())
            .collect();
        let query_keys: BTreeSet<String> = super::parse_query(&req.target)
            .keys()
            .cloned()
            .collect();
        let params = MatchParams {
            method: &req.method,
            path: &path,
            header_keys,
            query_keys,
            body: &req.body,
        };

        match match_request(&params, session.store.as_ref()) {
            Some(mock) => {
                let spec = mock.as_http().expect("matcher returned non-http mock");
                let wire = synthesize_response(spec)?;
                client.write_all(&wire).await?;
                client.flush().await?;
                if wants_close(&req.headers, req.proto_minor) {
                    break;
                }
            }
            None if session.opts.fallback_on_miss => {
                debug!(target = %req.target, "no mock; proxying to upstream");
                proxy_through(&mut client, &req, dest, tls_host.as_deref(), cfg, tls).await?;
            }
            None => {
                warn!(method = %req.method, target = %req.target, "no matching http mock");
                client.write_all(NO_MATCH_RESPONSE).await?;
                client.flush().await?;
                break;
            }
        }
    }
    let _ = client.shutdown().await;
    Ok(())
}

/// Wire form of a recorded response: status line, recorded headers with
/// recomputed framing, body re-compressed when it was recorded compressed.
pub(crate) fn synthesize_response(spec: &HttpSpec) -> anyhow::Result<Vec<u8>> {
    let resp = &spec.resp;
    let mut body = resp.body.to_bytes().unwrap_or_default();

    let gzipped = resp
        .header
        .iter()
        .any(|(k, v)| k.eq_ignore_ascii_case("content-encoding") && v.eq_ignore_ascii_case("gzip"));
    if gzipped {
        body = gzip_encode(&body).context("re-gzip recorded body")?;
    }

    let mut head = format!(
        "HTTP/{}.{} {} {}\r\n",
        resp.proto_major, resp.proto_minor, resp.status_code, resp.status_message
    );
    for (key, value) in &resp.header {
        // Framing is recomputed below; the recorded values may describe a
        // chunked stream that no longer exists.
        if key.eq_ignore_ascii_case("content-length")
            || key.eq_ignore_ascii_case("transfer-encoding")
        {
            continue;
        }
        head.push_str(key);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));

    let mut wire = head.into_bytes();
    wire.extend_from_slice(&body);
    Ok(wire)
}

/// fallback_on_miss: one pass-through exchange against the real upstream.
async fn proxy_through<C>(
    client: &mut C,
    req: &RawRequest,
    dest: SocketAddr,
    tls_host: Option<&str>,
    cfg: &ProxyConfig,
    tls: Option<&CertAuthority>,
) -> anyhow::Result<()>
where
    C: AsyncRead + AsyncWrite + Send + Unpin,
{
    let head = req.method == "HEAD";
    match (tls_host, tls) {
        (Some(host), Some(tls)) => {
            let mut upstream = tls.connect_upstream(dest, host).await?;
            upstream.write_all(&req.raw).await?;
            upstream.flush().await?;
            let resp = read_response(&mut upstream, head, cfg.chunk_timeout).await?;
            client.write_all(&resp.raw).await?;
        }
        _ => {
            let mut upstream = TcpStream::connect(dest)
                .await
                .with_context(|| format!("fallback dial {dest}"))?;
            upstream.write_all(&req.raw).await?;
            upstream.flush().await?;
            let resp = read_response(&mut upstream, head, cfg.chunk_timeout).await?;
            client.write_all(&resp.raw).await?;
        }
    }
    client.flush().await?;
    Ok(())
}
