use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use parrot_model::{HttpResp, HttpSpec, Mock, MockSpec, Payload};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ProxyConfig;
use crate::session::Session;
use crate::util;

use super::parse::{header_value, read_request, read_response};
use super::{build_http_req, curl, fold_headers, gzip_decode, noise, wants_close};

/// Record mode: relay every exchange on this connection to the real
/// destination and emit one mock per request/response pair.
pub async fn record<C, U>(
    mut client: C,
    mut upstream: U,
    dest: SocketAddr,
    tls_host: Option<String>,
    session: &Arc<Session>,
    token: &CancellationToken,
    cfg: &ProxyConfig,
) -> anyhow::Result<()>
where
    C: AsyncRead + AsyncWrite + Send + Unpin,
    U: AsyncRead + AsyncWrite + Send + Unpin,
{
    loop {
        let exchange = tokio::select! {
            _ = token.cancelled() => break,
            res = record_one(
                &mut client,
                &mut upstream,
                dest,
                tls_host.as_deref(),
                session,
                cfg,
            ) => res,
        };
        match exchange {
            Ok(Exchange::Close) => break,
            Ok(Exchange::KeepAlive) => continue,
            Err(err) => {
                // First-request EOF is the normal close of an idle
                // keep-alive connection.
                if err.downcast_ref::<std::io::Error>().is_some() {
                    debug!("http record connection ended: {err:#}");
                    break;
                }
                return Err(err);
            }
        }
    }
    let _ = client.shutdown().await;
    let _ = upstream.shutdown().await;
    Ok(())
}

enum Exchange {
    KeepAlive,
    Close,
}

async fn record_one<C, U>(
    client: &mut C,
    upstream: &mut U,
    dest: SocketAddr,
    tls_host: Option<&str>,
    session: &Arc<Session>,
    cfg: &ProxyConfig,
) -> anyhow::Result<Exchange>
where
    C: AsyncRead + AsyncWrite + Send + Unpin,
    U: AsyncRead + AsyncWrite + Send + Unpin,
{
    let Some(req) = read_request(client, cfg.chunk_timeout).await? else {
        return Ok(Exchange::Close);
    };

    // Forward the exact bytes we read; the parse is for the artifact only.
    upstream
        .write_all(&req.raw)
        .await
        .context("forward request upstream")?;
    upstream.flush().await?;

    let resp = read_response(upstream, req.method == "HEAD", cfg.chunk_timeout)
        .await
        .context("read upstream response")?;

    client
        .write_all(&resp.raw)
        .await
        .context("relay response to client")?;
    client.flush().await?;

    // Capture with the body transparently un-gzipped; the client already
    // got the original compressed bytes.
    let mut body = resp.body.clone();
    let gzipped = header_value(&resp.headers, "Content-Encoding")
        .is_some_and(|v| v.eq_ignore_ascii_case("gzip"));
    if gzipped {
        match gzip_decode(&resp.body) {
            Ok(decoded) => body = decoded,
            Err(err) => warn!("gzip decode failed; capturing raw body: {err}"),
        }
    }

    let http_req = build_http_req(&req, dest, tls_host);
    let http_resp = HttpResp {
        status_code: resp.status_code,
        status_message: resp.reason.clone(),
        proto_major: resp.proto_major,
        proto_minor: resp.proto_minor,
        header: fold_headers(&resp.headers),
        body: Payload::from_bytes(&body),
    };

    let noise_fields = noise::detect_noise_fields(&http_resp);
    let mut metadata = BTreeMap::new();
    metadata.insert("type".to_string(), "HttpClient".to_string());
    metadata.insert("operation".to_string(), req.method.clone());
    if !noise_fields.is_empty() {
        metadata.insert("noise".to_string(), noise_fields.join(","));
    }

    let curl_text = curl::to_curl(&http_req);
    let mock = Mock {
        version: parrot_model::API_VERSION.to_string(),
        name: util::next_mock_name(),
        metadata,
        created: util::unix_now(),
        spec: MockSpec::Http(HttpSpec {
            req: http_req,
            resp: http_resp,
            curl: curl_text,
        }),
    };

    if let Some(tx) = &session.mock_tx {
        if tx.send(mock).await.is_err() {
            warn!("mock channel closed; capture dropped");
        }
    }

    if wants_close(&req.headers, req.proto_minor) || wants_close(&resp.headers, resp.proto_minor)
    {
        return Ok(Exchange::Close);
    }
    Ok(Exchange::KeepAlive)
}
