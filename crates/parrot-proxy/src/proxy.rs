//! The proxy listener: accept a redirected connection, find out where it
//! was really going, classify the protocol, and hand it to a handler.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use parrot_model::Mode;
use parrot_redirect::RedirectTable;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::config::ProxyConfig;
use crate::session::{Session, Sessions};
use crate::sniff::{self, Protocol};
use crate::stream::PeekStream;
use crate::tls::CertAuthority;
use crate::{generic, http, mysql, util};

pub struct Proxy {
    pub cfg: ProxyConfig,
    pub sessions: Arc<Sessions>,
    pub table: Arc<RedirectTable>,
    pub tls: Arc<CertAuthority>,
}

pub struct ProxyHandle {
    addr: SocketAddr,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ProxyHandle {
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

impl Drop for ProxyHandle {
    fn drop(&mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Proxy {
    pub async fn start(
        cfg: ProxyConfig,
        sessions: Arc<Sessions>,
        table: Arc<RedirectTable>,
    ) -> anyhow::Result<ProxyHandle> {
        let listener = TcpListener::bind(cfg.listen_addr)
            .await
            .with_context(|| format!("bind proxy listener on {}", cfg.listen_addr))?;
        let addr = listener.local_addr()?;
        info!(%addr, "proxy listening");

        let tls = Arc::new(
            CertAuthority::load_or_generate(cfg.ca_cert_path.as_deref(), cfg.ca_key_path.as_deref())
                .context("initialise TLS certificate authority")?,
        );

        let token = CancellationToken::new();
        let proxy = Arc::new(Proxy {
            cfg,
            sessions,
            table,
            tls,
        });

        let accept_token = token.clone();
        let task = tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = accept_token.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!("accept failed: {err}");
                        continue;
                    }
                };
                let proxy = Arc::clone(&proxy);
                tokio::spawn(async move {
                    proxy.dispatch(stream, peer).await;
                });
            }
        });

        Ok(ProxyHandle {
            addr,
            token,
            task: Some(task),
        })
    }

    async fn dispatch(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let src_port = peer.port();
        let dest = match self.table.lookup(src_port) {
            Ok(dest) => dest,
            Err(err) => {
                // Connection from outside the monitored namespace.
                warn!(src_port, "closing unredirected connection: {err}");
                return;
            }
        };
        let Some(session) = self.sessions.get(dest.app_id) else {
            warn!(src_port, app_id = dest.app_id, "no session for connection");
            self.table.release(src_port);
            return;
        };

        let span = tracing::info_span!(
            "conn",
            src_port,
            dest = %dest.socket_addr(),
            mode = %session.mode
        );
        let result = self
            .handle_connection(stream, dest.socket_addr(), &session)
            .instrument(span)
            .await;
        if let Err(err) = result {
            debug!(src_port, "connection ended with error: {err:#}");
        }

        // Every close path releases the redirect entry.
        self.table.release(src_port);
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        dest: SocketAddr,
        session: &Arc<Session>,
    ) -> anyhow::Result<()> {
        let token = session.child_token();

        if session.opts.passthrough_ports.contains(&dest.port()) {
            debug!(%dest, "passthrough port; shuttling untouched");
            let upstream = TcpStream::connect(dest).await?;
            return util::shuttle(stream, upstream, &token).await.map_err(Into::into);
        }

        let mut client = PeekStream::new(stream);

        // Client-first protocols announce themselves within the sniff
        // window; silence means a server-speaks-first protocol.
        let prefix = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            peeked = tokio::time::timeout(self.cfg.sniff_timeout, client.peek(8)) => {
                match peeked {
                    Ok(bytes) => bytes?.to_vec(),
                    Err(_elapsed) => Vec::new(),
                }
            }
        };

        if prefix.is_empty() {
            return self.handle_server_first(client, dest, session, token).await;
        }

        match sniff::classify(&prefix) {
            Protocol::Tls => self.handle_tls(client, dest, session, token).await,
            Protocol::Http => match session.mode {
                Mode::Record => {
                    let upstream = TcpStream::connect(dest).await?;
                    http::record(client, upstream, dest, None, session, &token, &self.cfg).await
                }
                Mode::Test => {
                    http::replay(
                        client,
                        dest,
                        None,
                        session,
                        &token,
                        &self.cfg,
                        Some(self.tls.as_ref()),
                    )
                    .await
                }
            },
            Protocol::Generic | Protocol::MySql => match session.mode {
                Mode::Record => {
                    let upstream = TcpStream::connect(dest).await?;
                    generic::record(client, upstream, session, &token).await
                }
                Mode::Test => generic::replay(client, dest, session, &token).await,
            },
        }
    }

    /// TLS ClientHello from the app: terminate with a per-SNI certificate,
    /// then classify the plaintext.
    async fn handle_tls(
        &self,
        client: PeekStream<TcpStream>,
        dest: SocketAddr,
        session: &Arc<Session>,
        token: CancellationToken,
    ) -> anyhow::Result<()> {
        let (tls_client, sni) = self.tls.terminate(client).await?;
        let host = sni.unwrap_or_else(|| dest.ip().to_string());
        debug!(%host, "tls terminated");

        let mut client = PeekStream::new(tls_client);
        let prefix = client.peek(8).await?.to_vec();

        match sniff::classify(&prefix) {
            Protocol::Http => match session.mode {
                Mode::Record => {
                    let upstream = self.tls.connect_upstream(dest, &host).await?;
                    http::record(client, upstream, dest, Some(host), session, &token, &self.cfg)
                        .await
                }
                Mode::Test => {
                    http::replay(
                        client,
                        dest,
                        Some(host),
                        session,
                        &token,
                        &self.cfg,
                        Some(self.tls.as_ref()),
                    )
                    .await
                }
            },
            _ => match session.mode {
                Mode::Record => {
                    let upstream = self.tls.connect_upstream(dest, &host).await?;
                    generic::record(client, upstream, session, &token).await
                }
                Mode::Test => generic::replay(client, dest, session, &token).await,
            },
        }
    }

    /// Nothing from the client: the upstream speaks first. MySQL is the
    /// modelled case; anything else degrades to generic capture.
    async fn handle_server_first(
        &self,
        client: PeekStream<TcpStream>,
        dest: SocketAddr,
        session: &Arc<Session>,
        token: CancellationToken,
    ) -> anyhow::Result<()> {
        match session.mode {
            Mode::Record => {
                let upstream = TcpStream::connect(dest)
                    .await
                    .with_context(|| format!("dial upstream {dest}"))?;
                let mut upstream = PeekStream::new(upstream);
                let greeting = upstream.peek(5).await?.to_vec();
                if sniff::is_mysql_greeting(&greeting) {
                    mysql::record(client, upstream, dest, session, &token, &self.tls).await
                } else {
                    generic::record(client, upstream, session, &token).await
                }
            }
            Mode::Test => {
                // No upstream to ask; the mock catalog decides.
                if mysql::has_handshake_mock(session.store.as_ref()) {
                    mysql::replay(client, session, &token, &self.tls).await
                } else {
                    generic::replay(client, dest, session, &token).await
                }
            }
        }
    }
}
