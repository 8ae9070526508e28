//! Replay mode: serve the recorded handshake and answer every command from
//! the mock store. No upstream is contacted unless fallback-on-miss is set.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _};
use parrot_match::MockStore;
use parrot_model::{Mock, MockKind};
use parrot_mysql::auth::CachingSha2State;
use parrot_mysql::bundle::{PacketBundle, PacketPayload};
use parrot_mysql::handshake::{is_ssl_request, HandshakeResponse41};
use parrot_mysql::packet::Packet;
use parrot_mysql::status::ErrPacket;
use parrot_mysql::{
    ConnContext, PacketHeader, COM_CHANGE_USER, COM_QUIT,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::session::Session;
use crate::tls::CertAuthority;

use super::io::{read_packet, read_packet_deadline, write_frame, write_frames};
use super::matching::match_command;

pub async fn replay<C>(
    client: C,
    session: &Arc<Session>,
    token: &CancellationToken,
    tls: &CertAuthority,
) -> anyhow::Result<()>
where
    C: AsyncRead + AsyncWrite + Send + Unpin,
{
    let store = session.store.as_ref();
    let handshake_mock = first_handshake_mock(store)
        .context("no mysql handshake mock loaded for replay")?;

    let mut ctx = ConnContext::default();
    replay_connection(client, session, token, tls, &handshake_mock, &mut ctx).await
}

fn first_handshake_mock(store: &dyn MockStore) -> Option<Arc<Mock>> {
    store
        .list_unfiltered()
        .into_iter()
        .filter(|m| m.kind() == MockKind::MySql)
        .min_by_key(|m| m.created)
}

async fn replay_connection<C>(
    mut client: C,
    session: &Arc<Session>,
    token: &CancellationToken,
    tls: &CertAuthority,
    handshake_mock: &Arc<Mock>,
    ctx: &mut ConnContext,
) -> anyhow::Result<()>
where
    C: AsyncRead + AsyncWrite + Send + Unpin,
{
    let spec = handshake_mock
        .as_mysql()
        .context("handshake mock is not mysql")?;
    let responses = &spec.responses;
    let requests = &spec.requests;

    // Greeting from the recording, re-framed with the recorded sequence id.
    let Some(greeting_bundle) = responses.first() else {
        bail!("handshake mock has no responses");
    };
    let PacketPayload::HandshakeV10(greeting) = &greeting_bundle.payload else {
        bail!("first recorded response is not HandshakeV10");
    };
    ctx.remember_greeting(greeting.clone());
    write_frames(&mut client, &greeting_bundle.encode(ctx)?).await?;

    // Client's reply; possibly an SSLRequest first.
    let reply = read_packet(&mut client, token)
        .await?
        .context("client closed during replayed handshake")?;

    if is_ssl_request(&reply.payload) {
        let recorded_ssl = requests
            .iter()
            .any(|r| matches!(r.payload, PacketPayload::SslRequest(_)));
        if !recorded_ssl {
            bail!("client requested SSL but the recording is plaintext");
        }
        let (tls_client, _sni) = tls.terminate(client).await?;
        let mut client = tls_client;
        let hs_pkt = read_packet(&mut client, token)
            .await?
            .context("client closed after SSL upgrade")?;
        let hs = HandshakeResponse41::decode(&hs_pkt.payload)?;
        finish_handshake_and_commands(client, session, token, handshake_mock, ctx, hs).await
    } else {
        let hs = HandshakeResponse41::decode(&reply.payload)?;
        finish_handshake_and_commands(client, session, token, handshake_mock, ctx, hs).await
    }
}

async fn finish_handshake_and_commands<C>(
    mut client: C,
    session: &Arc<Session>,
    token: &CancellationToken,
    handshake_mock: &Arc<Mock>,
    ctx: &mut ConnContext,
    hs: HandshakeResponse41,
) -> anyhow::Result<()>
where
    C: AsyncRead + AsyncWrite + Send + Unpin,
{
    let spec = handshake_mock.as_mysql().expect("checked mysql");
    let recorded_hs = spec
        .requests
        .iter()
        .find_map(|r| match &r.payload {
            PacketPayload::HandshakeResponse41(h) => Some(h),
            _ => None,
        })
        .context("recording has no HandshakeResponse41")?;

    // Identity must line up; scrambled auth bytes never will, so they are
    // not compared.
    if hs.username != recorded_hs.username {
        bail!(
            "handshake username mismatch: got {:?}, recorded {:?}",
            hs.username,
            recorded_hs.username
        );
    }
    if hs.auth_plugin_name != recorded_hs.auth_plugin_name {
        bail!(
            "auth plugin mismatch: got {:?}, recorded {:?}",
            hs.auth_plugin_name,
            recorded_hs.auth_plugin_name
        );
    }
    if hs.capability_flags != recorded_hs.capability_flags {
        debug!(
            got = format_args!("{:#x}", hs.capability_flags),
            recorded = format_args!("{:#x}", recorded_hs.capability_flags),
            "client capabilities differ from recording"
        );
    }
    ctx.client_capabilities = Some(hs.capability_flags);
    if !hs.auth_plugin_name.is_empty() {
        ctx.plugin_name = hs.auth_plugin_name.clone();
    }

    simulate_auth(&mut client, session, token, handshake_mock, ctx).await?;

    command_phase(client, session, token, ctx).await
}

/// Walk the recorded auth exchange: write server bundles, read the client
/// packets between them, matching per-run-variable blobs by sequence id.
async fn simulate_auth<C>(
    client: &mut C,
    session: &Arc<Session>,
    token: &CancellationToken,
    handshake_mock: &Arc<Mock>,
    ctx: &mut ConnContext,
) -> anyhow::Result<()>
where
    C: AsyncRead + AsyncWrite + Send + Unpin,
{
    let spec = handshake_mock.as_mysql().expect("checked mysql");
    // Cursors: responses[0] (greeting) is done; requests hold the
    // handshake response (and SSLRequest) before any auth packet.
    let mut resp_idx = 1;
    let mut req_idx = spec
        .requests
        .iter()
        .position(|r| {
            !matches!(
                r.payload,
                PacketPayload::SslRequest(_) | PacketPayload::HandshakeResponse41(_)
            )
        })
        .unwrap_or(spec.requests.len());
    let mut full_auth_done = false;

    while resp_idx < spec.responses.len() {
        let bundle = &spec.responses[resp_idx];
        write_frames(client, &bundle.encode(ctx)?).await?;
        resp_idx += 1;

        match &bundle.payload {
            PacketPayload::Ok(_) | PacketPayload::Err(_) => break,
            PacketPayload::AuthSwitchRequest(switch) => {
                ctx.plugin_name = switch.plugin_name.clone();
                let reply = read_packet(client, token)
                    .await?
                    .context("client closed during auth switch")?;
                expect_request_seq(spec, &mut req_idx, &reply, "auth switch response")?;
            }
            PacketPayload::AuthMoreData(more) => {
                match more.caching_sha2_state() {
                    Some(CachingSha2State::FastAuthSuccess) => {
                        // Final OK/ERR follows immediately in the recording.
                    }
                    Some(CachingSha2State::PerformFullAuthentication) => {
                        let client_pkt = read_packet(client, token)
                            .await?
                            .context("client closed during full auth")?;
                        if parrot_mysql::auth::is_public_key_request(&client_pkt.payload) {
                            expect_request_kind(
                                spec,
                                &mut req_idx,
                                "PublicKeyRequest",
                            )?;
                            // Serve the recorded public key, then expect the
                            // encrypted password.
                            let key_bundle = spec
                                .responses
                                .get(resp_idx)
                                .context("recording missing public key response")?;
                            write_frames(client, &key_bundle.encode(ctx)?).await?;
                            resp_idx += 1;

                            let pass_pkt = read_packet(client, token)
                                .await?
                                .context("client closed sending encrypted password")?;
                            expect_request_seq(
                                spec,
                                &mut req_idx,
                                &pass_pkt,
                                "encrypted password",
                            )?;
                        } else {
                            // TLS path: the password came directly.
                            expect_request_seq(
                                spec,
                                &mut req_idx,
                                &client_pkt,
                                "password",
                            )?;
                        }
                        full_auth_done = true;
                    }
                    None => {}
                }
            }
            other => {
                warn!(kind = other.kind(), "unexpected packet in recorded auth");
            }
        }
    }

    // Full auth happens only on a cold server cache; afterwards every
    // connection fast-auths, so the template must not be offered again.
    if full_auth_done {
        if !session.store.delete_unfiltered(handshake_mock) {
            warn!("failed to retire full-auth handshake mock");
        }
    }

    debug!("replayed handshake complete");
    Ok(())
}

/// The per-run-variable client packets (scrambles, encrypted passwords)
/// match by sequence id alone.
fn expect_request_seq(
    spec: &parrot_model::MySqlSpec,
    req_idx: &mut usize,
    actual: &Packet,
    what: &str,
) -> anyhow::Result<()> {
    let recorded = spec
        .requests
        .get(*req_idx)
        .with_context(|| format!("recording missing {what}"))?;
    if recorded.header.seq_id != actual.header.seq_id {
        bail!(
            "{what} sequence id mismatch: got {}, recorded {}",
            actual.header.seq_id,
            recorded.header.seq_id
        );
    }
    *req_idx += 1;
    Ok(())
}

fn expect_request_kind(
    spec: &parrot_model::MySqlSpec,
    req_idx: &mut usize,
    kind: &str,
) -> anyhow::Result<()> {
    let recorded = spec
        .requests
        .get(*req_idx)
        .with_context(|| format!("recording missing {kind}"))?;
    if recorded.kind() != kind {
        bail!("expected recorded {kind}, found {}", recorded.kind());
    }
    *req_idx += 1;
    Ok(())
}

async fn command_phase<C>(
    mut client: C,
    session: &Arc<Session>,
    token: &CancellationToken,
    ctx: &mut ConnContext,
) -> anyhow::Result<()>
where
    C: AsyncRead + AsyncWrite + Send + Unpin,
{
    let deadline = Duration::from_secs(2 * session.opts.sql_delay.max(1));

    loop {
        let Some(cmd_pkt) = read_packet_deadline(&mut client, token, deadline).await? else {
            debug!("mysql replay client idle or closed");
            return Ok(());
        };

        let command_byte = cmd_pkt.payload.first().copied().unwrap_or(0);
        if command_byte == COM_CHANGE_USER {
            // Unsupported by contract: answer with ERR and drop the
            // connection rather than corrupt the statement map.
            let err = ErrPacket {
                error_code: 1047,
                sql_state: "08S01".into(),
                message: "COM_CHANGE_USER is not supported under replay".into(),
            };
            let bundle = PacketBundle::new(
                PacketHeader { length: 0, seq_id: cmd_pkt.header.seq_id.wrapping_add(1) },
                PacketPayload::Err(err),
            );
            write_frames(&mut client, &bundle.encode(ctx)?).await?;
            return Ok(());
        }

        let req = match PacketBundle::decode_command(&cmd_pkt, ctx) {
            Ok(req) => req,
            Err(err) => {
                warn!("undecodable command in replay ({err}); matching raw");
                ctx.last_command = Some(command_byte);
                PacketBundle::new(
                    cmd_pkt.header,
                    PacketPayload::Raw {
                        data: cmd_pkt.payload.clone(),
                    },
                )
            }
        };

        if command_byte == COM_QUIT {
            // Consume the recorded quit if present; either way the
            // connection is done.
            let _ = match_command(&req, session.store.as_ref());
            return Ok(());
        }

        let Some(mock) = match_command(&req, session.store.as_ref()) else {
            if session.opts.fallback_on_miss {
                return fallback_passthrough(client, session, cmd_pkt).await;
            }
            warn!(kind = req.kind(), "no matching mysql mock");
            let err = ErrPacket {
                error_code: 1105,
                sql_state: "HY000".into(),
                message: format!("parrot: no recorded response for {}", req.kind()),
            };
            let bundle = PacketBundle::new(
                PacketHeader { length: 0, seq_id: cmd_pkt.header.seq_id.wrapping_add(1) },
                PacketPayload::Err(err),
            );
            write_frames(&mut client, &bundle.encode(ctx)?).await?;
            return Ok(());
        };

        let spec = mock.as_mysql().expect("matcher returned non-mysql mock");
        if parrot_mysql::command::is_no_response_command(command_byte) {
            continue;
        }

        for resp in &spec.responses {
            // Re-learn prepared statements while serving them so later
            // executes on this connection decode.
            if let PacketPayload::StmtPrepareOk(ok) = &resp.payload {
                ctx.remember_prepare(ok.clone());
            }
            write_frames(&mut client, &resp.encode(ctx)?).await?;
        }
    }
}

/// fallback_on_miss: hand the rest of the connection to the real upstream,
/// starting with the unmatched command frame.
async fn fallback_passthrough<C>(
    mut client: C,
    session: &Arc<Session>,
    cmd_pkt: Packet,
) -> anyhow::Result<()>
where
    C: AsyncRead + AsyncWrite + Send + Unpin,
{
    let Some(dst) = session.opts.dst_cfg.clone() else {
        bail!("fallback_on_miss set but no destination config available");
    };
    debug!(addr = %dst.addr, "mysql fallback passthrough");
    let mut upstream = tokio::net::TcpStream::connect(dst.addr)
        .await
        .with_context(|| format!("fallback dial {}", dst.addr))?;
    write_frame(&mut upstream, &cmd_pkt.encode()?).await?;
    crate::util::shuttle(&mut client, &mut upstream, &session.token)
        .await
        .map_err(Into::into)
}
