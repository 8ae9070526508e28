//! Record mode: relay packets between client and server, decoding as they
//! pass, and emit one mock for the handshake plus one per command.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _};
use parrot_model::{Mock, MockSpec, MySqlSpec};
use parrot_mysql::auth::{AuthMoreData, AuthSwitchRequest, AuthSwitchResponse, CachingSha2State};
use parrot_mysql::bundle::{PacketBundle, PacketPayload};
use parrot_mysql::handshake::{is_ssl_request, HandshakeResponse41, HandshakeV10, SslRequest};
use parrot_mysql::packet::Packet;
use parrot_mysql::resultset::{LocalInfileRequest, ResultSet, StmtPrepareOk};
use parrot_mysql::rowscols::{BinaryRow, ColumnDef, TextRow};
use parrot_mysql::status::{is_eof_payload, is_err_payload, is_ok_payload, EofPacket, ErrPacket, OkPacket};
use parrot_mysql::{
    auth, ConnContext, CLIENT_DEPRECATE_EOF, COM_CHANGE_USER, COM_QUERY, COM_QUIT,
    COM_STMT_EXECUTE, COM_STMT_PREPARE,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::session::Session;
use crate::tls::CertAuthority;
use crate::util;

use super::io::{read_packet, read_packet_deadline, write_frame};
use super::CONFIG_MOCK_TYPE;

pub async fn record<C, U>(
    mut client: C,
    mut upstream: U,
    dest: SocketAddr,
    session: &Arc<Session>,
    token: &CancellationToken,
    tls: &CertAuthority,
) -> anyhow::Result<()>
where
    C: AsyncRead + AsyncWrite + Send + Unpin,
    U: AsyncRead + AsyncWrite + Send + Unpin,
{
    let mut ctx = ConnContext::default();
    let mut requests: Vec<PacketBundle> = Vec::new();
    let mut responses: Vec<PacketBundle> = Vec::new();

    // Server greeting first.
    let greeting_pkt = read_packet(&mut upstream, token)
        .await?
        .context("upstream closed before greeting")?;
    write_frame(&mut client, &greeting_pkt.encode()?).await?;

    let greeting = HandshakeV10::decode(&greeting_pkt.payload)
        .context("decode HandshakeV10 greeting")?;
    ctx.remember_greeting(greeting.clone());
    responses.push(PacketBundle::new(
        greeting_pkt.header,
        PacketPayload::HandshakeV10(greeting),
    ));

    // Client reply: either the full handshake response or an SSLRequest.
    let reply_pkt = read_packet(&mut client, token)
        .await?
        .context("client closed during handshake")?;
    write_frame(&mut upstream, &reply_pkt.encode()?).await?;

    if is_ssl_request(&reply_pkt.payload) {
        let ssl = SslRequest::decode(&reply_pkt.payload)?;
        ctx.client_capabilities = Some(ssl.capability_flags);
        requests.push(PacketBundle::new(
            reply_pkt.header,
            PacketPayload::SslRequest(ssl),
        ));

        // Both legs go TLS before the next packet.
        let (tls_client, _sni) = tls.terminate(client).await?;
        let tls_upstream = tls
            .upgrade_upstream(upstream, &dest.ip().to_string())
            .await?;
        debug!("mysql connection upgraded to TLS on both legs");

        let mut client = tls_client;
        let mut upstream = tls_upstream;

        let hs_pkt = read_packet(&mut client, token)
            .await?
            .context("client closed after SSL upgrade")?;
        write_frame(&mut upstream, &hs_pkt.encode()?).await?;
        let hs = HandshakeResponse41::decode(&hs_pkt.payload)
            .context("decode HandshakeResponse41 after SSL upgrade")?;
        ctx.client_capabilities = Some(hs.capability_flags);
        if !hs.auth_plugin_name.is_empty() {
            ctx.plugin_name = hs.auth_plugin_name.clone();
        }
        requests.push(PacketBundle::new(
            hs_pkt.header,
            PacketPayload::HandshakeResponse41(hs),
        ));

        finish(
            client, upstream, session, token, ctx, requests, responses,
        )
        .await
    } else {
        let hs = HandshakeResponse41::decode(&reply_pkt.payload)
            .context("decode HandshakeResponse41")?;
        ctx.client_capabilities = Some(hs.capability_flags);
        if !hs.auth_plugin_name.is_empty() {
            ctx.plugin_name = hs.auth_plugin_name.clone();
        }
        requests.push(PacketBundle::new(
            reply_pkt.header,
            PacketPayload::HandshakeResponse41(hs),
        ));

        finish(
            client, upstream, session, token, ctx, requests, responses,
        )
        .await
    }
}

/// Post-handshake-response recording; stream types are fixed by now (plain
/// or TLS on both legs).
async fn finish<C, U>(
    mut client: C,
    mut upstream: U,
    session: &Arc<Session>,
    token: &CancellationToken,
    mut ctx: ConnContext,
    mut requests: Vec<PacketBundle>,
    mut responses: Vec<PacketBundle>,
) -> anyhow::Result<()>
where
    C: AsyncRead + AsyncWrite + Send + Unpin,
    U: AsyncRead + AsyncWrite + Send + Unpin,
{
    record_auth(
        &mut client,
        &mut upstream,
        token,
        &mut ctx,
        &mut requests,
        &mut responses,
    )
    .await
    .context("record auth exchange")?;

    emit_mock(session, requests, responses, true).await;

    command_phase(client, upstream, session, token, ctx).await
}

/// Drive the auth sub-state machine until the server settles on OK/ERR,
/// appending every packet to the handshake transcript.
async fn record_auth<C, U>(
    client: &mut C,
    upstream: &mut U,
    token: &CancellationToken,
    ctx: &mut ConnContext,
    requests: &mut Vec<PacketBundle>,
    responses: &mut Vec<PacketBundle>,
) -> anyhow::Result<()>
where
    C: AsyncRead + AsyncWrite + Send + Unpin,
    U: AsyncRead + AsyncWrite + Send + Unpin,
{
    loop {
        let server_pkt = read_packet(upstream, token)
            .await?
            .context("upstream closed during auth")?;
        write_frame(client, &server_pkt.encode()?).await?;
        let payload = &server_pkt.payload;

        if is_err_payload(payload) {
            let err = ErrPacket::decode(payload, ctx.capabilities())?;
            responses.push(PacketBundle::new(server_pkt.header, PacketPayload::Err(err)));
            return Ok(());
        }
        if is_ok_payload(payload) {
            let ok = OkPacket::decode(payload, ctx.capabilities())?;
            responses.push(PacketBundle::new(server_pkt.header, PacketPayload::Ok(ok)));
            return Ok(());
        }

        match payload.first().copied() {
            Some(0xfe) => {
                // Auth switch: restart with the server's chosen plugin.
                let switch = AuthSwitchRequest::decode(payload)?;
                ctx.plugin_name = switch.plugin_name.clone();
                responses.push(PacketBundle::new(
                    server_pkt.header,
                    PacketPayload::AuthSwitchRequest(switch),
                ));

                let reply = read_packet(client, token)
                    .await?
                    .context("client closed during auth switch")?;
                write_frame(upstream, &reply.encode()?).await?;
                requests.push(PacketBundle::new(
                    reply.header,
                    PacketPayload::AuthSwitchResponse(AuthSwitchResponse {
                        data: reply.payload.clone(),
                    }),
                ));
            }
            Some(0x01) => {
                let more = AuthMoreData::decode(payload)?;
                let state = more.caching_sha2_state();
                responses.push(PacketBundle::new(
                    server_pkt.header,
                    PacketPayload::AuthMoreData(more),
                ));

                match state {
                    Some(CachingSha2State::FastAuthSuccess) => {
                        // Next server packet is the final OK/ERR.
                    }
                    Some(CachingSha2State::PerformFullAuthentication) => {
                        record_full_auth(client, upstream, token, requests, responses).await?;
                    }
                    None => {
                        // Mid-flight public key or plugin blob; nothing to
                        // read from the client yet.
                    }
                }
            }
            _ => {
                warn!("unexpected auth packet from server; capturing raw");
                responses.push(PacketBundle::new(
                    server_pkt.header,
                    PacketPayload::Raw {
                        data: payload.clone(),
                    },
                ));
                return Ok(());
            }
        }
    }
}

/// caching_sha2 full auth: over plaintext the client fetches the server's
/// RSA key and sends the password encrypted; over TLS it just sends the
/// password. Either way the bytes differ per run.
async fn record_full_auth<C, U>(
    client: &mut C,
    upstream: &mut U,
    token: &CancellationToken,
    requests: &mut Vec<PacketBundle>,
    responses: &mut Vec<PacketBundle>,
) -> anyhow::Result<()>
where
    C: AsyncRead + AsyncWrite + Send + Unpin,
    U: AsyncRead + AsyncWrite + Send + Unpin,
{
    let client_pkt = read_packet(client, token)
        .await?
        .context("client closed during full auth")?;
    write_frame(upstream, &client_pkt.encode()?).await?;

    if auth::is_public_key_request(&client_pkt.payload) {
        requests.push(PacketBundle::new(
            client_pkt.header,
            PacketPayload::PublicKeyRequest,
        ));

        let key_pkt = read_packet(upstream, token)
            .await?
            .context("upstream closed sending public key")?;
        write_frame(client, &key_pkt.encode()?).await?;
        let key = AuthMoreData::decode(&key_pkt.payload).context("decode public key packet")?;
        responses.push(PacketBundle::new(
            key_pkt.header,
            PacketPayload::AuthMoreData(key),
        ));

        let pass_pkt = read_packet(client, token)
            .await?
            .context("client closed sending encrypted password")?;
        write_frame(upstream, &pass_pkt.encode()?).await?;
        requests.push(PacketBundle::new(
            pass_pkt.header,
            PacketPayload::EncryptedPassword {
                data: pass_pkt.payload,
            },
        ));
    } else {
        // TLS leg: plaintext password straight away.
        requests.push(PacketBundle::new(
            client_pkt.header,
            PacketPayload::EncryptedPassword {
                data: client_pkt.payload,
            },
        ));
    }
    Ok(())
}

async fn command_phase<C, U>(
    mut client: C,
    mut upstream: U,
    session: &Arc<Session>,
    token: &CancellationToken,
    mut ctx: ConnContext,
) -> anyhow::Result<()>
where
    C: AsyncRead + AsyncWrite + Send + Unpin,
    U: AsyncRead + AsyncWrite + Send + Unpin,
{
    let deadline = Duration::from_secs(2 * session.opts.sql_delay.max(1));

    loop {
        let Some(cmd_pkt) = read_packet_deadline(&mut client, token, deadline).await? else {
            debug!("mysql client idle or closed; ending command phase");
            return Ok(());
        };
        write_frame(&mut upstream, &cmd_pkt.encode()?).await?;

        let command_byte = cmd_pkt.payload.first().copied().unwrap_or(0);
        if command_byte == COM_CHANGE_USER {
            // Declared unsupported: relay but never mock, since it would
            // invalidate the per-connection statement map.
            warn!("COM_CHANGE_USER observed; relaying without capture");
            let resp = read_packet(&mut upstream, token)
                .await?
                .context("upstream closed answering COM_CHANGE_USER")?;
            write_frame(&mut client, &resp.encode()?).await?;
            continue;
        }

        let req = match PacketBundle::decode_command(&cmd_pkt, &mut ctx) {
            Ok(req) => req,
            Err(err) => {
                warn!("undecodable client command ({err}); capturing raw");
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
            emit_mock(session, vec![req], Vec::new(), false).await;
            return Ok(());
        }

        if parrot_mysql::command::is_no_response_command(command_byte) {
            emit_mock(session, vec![req], Vec::new(), false).await;
            continue;
        }

        let resp = read_command_response(&mut client, &mut upstream, token, &mut ctx)
            .await
            .context("record command response")?;
        emit_mock(session, vec![req], vec![resp], false).await;
    }
}

/// Read (and forward) one full command response, which may span many
/// packets for result sets and prepare responses.
async fn read_command_response<C, U>(
    client: &mut C,
    upstream: &mut U,
    token: &CancellationToken,
    ctx: &mut ConnContext,
) -> anyhow::Result<PacketBundle>
where
    C: AsyncRead + AsyncWrite + Send + Unpin,
    U: AsyncRead + AsyncWrite + Send + Unpin,
{
    let first = forward_server_packet(client, upstream, token).await?;
    let payload = &first.payload;
    let caps = ctx.capabilities();

    if is_err_payload(payload) {
        let err = ErrPacket::decode(payload, caps)?;
        return Ok(PacketBundle::new(first.header, PacketPayload::Err(err)));
    }

    match ctx.last_command {
        Some(COM_STMT_PREPARE) if payload.first() == Some(&0x00) => {
            let mut ok = StmtPrepareOk::decode_first(&first)?;
            let deprecate_eof = caps & CLIENT_DEPRECATE_EOF != 0;

            for _ in 0..ok.num_params {
                let pkt = forward_server_packet(client, upstream, token).await?;
                ok.param_defs.push(ColumnDef::decode(&pkt)?);
            }
            if ok.num_params > 0 && !deprecate_eof {
                let pkt = forward_server_packet(client, upstream, token).await?;
                ok.eof_after_params = Some(raw(&pkt));
            }
            for _ in 0..ok.num_columns {
                let pkt = forward_server_packet(client, upstream, token).await?;
                ok.column_defs.push(ColumnDef::decode(&pkt)?);
            }
            if ok.num_columns > 0 && !deprecate_eof {
                let pkt = forward_server_packet(client, upstream, token).await?;
                ok.eof_after_columns = Some(raw(&pkt));
            }

            ctx.remember_prepare(ok.clone());
            Ok(PacketBundle::new(
                first.header,
                PacketPayload::StmtPrepareOk(ok),
            ))
        }
        Some(COM_QUERY) | Some(COM_STMT_EXECUTE) => {
            if is_ok_payload(payload) {
                let ok = OkPacket::decode(payload, caps)?;
                return Ok(PacketBundle::new(first.header, PacketPayload::Ok(ok)));
            }
            if payload.first() == Some(&0xfb) {
                let infile = LocalInfileRequest::decode(payload)?;
                relay_local_infile(client, upstream, token).await?;
                return Ok(PacketBundle::new(
                    first.header,
                    PacketPayload::LocalInfileRequest(infile),
                ));
            }
            read_result_set(client, upstream, token, ctx, first).await
        }
        _ => {
            if is_ok_payload(payload) {
                let ok = OkPacket::decode(payload, caps)?;
                return Ok(PacketBundle::new(first.header, PacketPayload::Ok(ok)));
            }
            if is_eof_payload(payload) {
                let eof = EofPacket::decode(payload, caps)?;
                return Ok(PacketBundle::new(first.header, PacketPayload::Eof(eof)));
            }
            Ok(PacketBundle::new(
                first.header,
                PacketPayload::Raw {
                    data: payload.clone(),
                },
            ))
        }
    }
}

async fn read_result_set<C, U>(
    client: &mut C,
    upstream: &mut U,
    token: &CancellationToken,
    ctx: &mut ConnContext,
    first: Packet,
) -> anyhow::Result<PacketBundle>
where
    C: AsyncRead + AsyncWrite + Send + Unpin,
    U: AsyncRead + AsyncWrite + Send + Unpin,
{
    let caps = ctx.capabilities();
    let deprecate_eof = caps & CLIENT_DEPRECATE_EOF != 0;
    let binary = ctx.last_command == Some(COM_STMT_EXECUTE);

    let column_count = ResultSet::decode_column_count(&first)?;
    let mut rs = ResultSet {
        header: first.header,
        column_count,
        columns: Vec::with_capacity(column_count as usize),
        eof_after_columns: None,
        rows_text: Vec::new(),
        rows_binary: Vec::new(),
        terminator: raw(&first), // placeholder, replaced below
    };

    for _ in 0..column_count {
        let pkt = forward_server_packet(client, upstream, token).await?;
        rs.columns.push(ColumnDef::decode(&pkt)?);
    }
    if !deprecate_eof {
        let pkt = forward_server_packet(client, upstream, token).await?;
        rs.eof_after_columns = Some(raw(&pkt));
    }

    loop {
        let pkt = forward_server_packet(client, upstream, token).await?;
        let terminal = if deprecate_eof {
            pkt.payload.first() == Some(&0xfe)
        } else {
            is_eof_payload(&pkt.payload) || is_err_payload(&pkt.payload)
        };
        if terminal {
            rs.terminator = raw(&pkt);
            break;
        }
        if binary {
            rs.rows_binary.push(BinaryRow::decode(&pkt, &rs.columns)?);
        } else {
            rs.rows_text.push(TextRow::decode(&pkt, rs.columns.len())?);
        }
    }

    Ok(PacketBundle::new(rs.header, PacketPayload::ResultSet(rs)))
}

/// `LOCAL INFILE`: the client streams file packets terminated by an empty
/// one, then the server answers. All relayed, none decoded.
async fn relay_local_infile<C, U>(
    client: &mut C,
    upstream: &mut U,
    token: &CancellationToken,
) -> anyhow::Result<()>
where
    C: AsyncRead + AsyncWrite + Send + Unpin,
    U: AsyncRead + AsyncWrite + Send + Unpin,
{
    loop {
        let pkt = read_packet(client, token)
            .await?
            .context("client closed during LOCAL INFILE")?;
        let empty = pkt.payload.is_empty();
        write_frame(upstream, &pkt.encode()?).await?;
        if empty {
            break;
        }
    }
    let resp = read_packet(upstream, token)
        .await?
        .context("upstream closed finishing LOCAL INFILE")?;
    write_frame(client, &resp.encode()?).await?;
    Ok(())
}

async fn forward_server_packet<C, U>(
    client: &mut C,
    upstream: &mut U,
    token: &CancellationToken,
) -> anyhow::Result<Packet>
where
    C: AsyncRead + AsyncWrite + Send + Unpin,
    U: AsyncRead + AsyncWrite + Send + Unpin,
{
    let Some(pkt) = read_packet(upstream, token).await? else {
        bail!("upstream closed mid-response");
    };
    write_frame(client, &pkt.encode()?).await?;
    Ok(pkt)
}

fn raw(pkt: &Packet) -> parrot_mysql::bundle::RawPacket {
    parrot_mysql::bundle::RawPacket::from_packet(pkt)
}

async fn emit_mock(
    session: &Arc<Session>,
    requests: Vec<PacketBundle>,
    responses: Vec<PacketBundle>,
    config: bool,
) {
    let mut metadata = BTreeMap::new();
    if config {
        metadata.insert("type".to_string(), CONFIG_MOCK_TYPE.to_string());
    }
    let mock = Mock {
        version: parrot_model::API_VERSION.to_string(),
        name: util::next_mock_name(),
        metadata,
        created: util::unix_now(),
        spec: MockSpec::MySql(MySqlSpec {
            requests,
            responses,
        }),
    };
    if let Some(tx) = &session.mock_tx {
        if tx.send(mock).await.is_err() {
            warn!("mock channel closed; mysql capture dropped");
        }
    }
}
