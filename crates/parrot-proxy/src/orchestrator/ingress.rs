//! Inbound capture: a reverse proxy in front of the application that
//! records every API call as a test case while forwarding it unchanged.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use parrot_model::{HttpResp, Payload, TestCase};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::http::parse::{header_value, read_request, read_response};
use crate::http::{build_http_req, curl, fold_headers, gzip_decode, noise, wants_close};
use crate::session::Session;
use crate::util;

pub struct IngressHandle {
    addr: SocketAddr,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl IngressHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn shutdown(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for IngressHandle {
    fn drop(&mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Listen on `listen`, forward to the app at `app_addr`, and emit a
/// `TestCase` per exchange into the session's channel.
pub async fn start(
    listen: SocketAddr,
    app_addr: SocketAddr,
    session: Arc<Session>,
    cfg: ProxyConfig,
) -> anyhow::Result<IngressHandle> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("bind ingress listener on {listen}"))?;
    let addr = listener.local_addr()?;
    info!(%addr, app = %app_addr, "ingress capture listening");

    let token = session.token.child_token();
    let accept_token = token.clone();
    let task = tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = accept_token.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, _) = match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    warn!("ingress accept failed: {err}");
                    continue;
                }
            };
            let session = Arc::clone(&session);
            let cfg = cfg.clone();
            let conn_token = accept_token.child_token();
            tokio::spawn(async move {
                if let Err(err) =
                    handle_connection(stream, app_addr, session, cfg, conn_token).await
                {
                    debug!("ingress connection ended: {err:#}");
                }
            });
        }
    });

    Ok(IngressHandle {
        addr,
        token,
        task: Some(task),
    })
}

async fn handle_connection(
    mut client: TcpStream,
    app_addr: SocketAddr,
    session: Arc<Session>,
    cfg: ProxyConfig,
    token: CancellationToken,
) -> anyhow::Result<()> {
    let mut app = TcpStream::connect(app_addr)
        .await
        .with_context(|| format!("dial app at {app_addr}"))?;

    loop {
        let req = tokio::select! {
            _ = token.cancelled() => break,
            req = read_request(&mut client, cfg.chunk_timeout) => req,
        };
        let Some(req) = (match req {
            Ok(req) => req,
            Err(err) => {
                debug!("ingress read ended: {err}");
                break;
            }
        }) else {
            break;
        };

        app.write_all(&req.raw).await?;
        app.flush().await?;

        let resp = read_response(&mut app, req.method == "HEAD", cfg.chunk_timeout)
            .await
            .context("read app response")?;
        client.write_all(&resp.raw).await?;
        client.flush().await?;

        let mut body = resp.body.clone();
        if header_value(&resp.headers, "Content-Encoding")
            .is_some_and(|v| v.eq_ignore_ascii_case("gzip"))
        {
            if let Ok(decoded) = gzip_decode(&resp.body) {
                body = decoded;
            }
        }

        let http_req = build_http_req(&req, app_addr, None);
        let http_resp = HttpResp {
            status_code: resp.status_code,
            status_message: resp.reason.clone(),
            proto_major: resp.proto_major,
            proto_minor: resp.proto_minor,
            header: fold_headers(&resp.headers),
            body: Payload::from_bytes(&body),
        };
        let noise = noise::detect_noise_fields(&http_resp);
        let curl_text = curl::to_curl(&http_req);

        let tc = TestCase {
            version: parrot_model::API_VERSION.to_string(),
            name: util::next_testcase_name(),
            created: util::unix_now(),
            req: http_req,
            resp: http_resp,
            noise,
            curl: curl_text,
        };
        if let Some(tx) = &session.testcase_tx {
            if tx.send(tc).await.is_err() {
                warn!("testcase channel closed; capture dropped");
            }
        }

        if wants_close(&req.headers, req.proto_minor)
            || wants_close(&resp.headers, resp.proto_minor)
        {
            break;
        }
    }

    let _ = client.shutdown().await;
    let _ = app.shutdown().await;
    Ok(())
}
