use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use parrot_match::{InMemoryMockStore, InMemoryTestStore};
use parrot_model::{AppErrorKind, Mode, OutgoingOptions};
use parrot_proxy::orchestrator::{run_session, IngressPlan, SessionPlan};
use parrot_proxy::ProxyConfig;
use tokio_util::sync::CancellationToken;

struct CliArgs {
    mode: Mode,
    bind: Option<SocketAddr>,
    ingress: Option<(SocketAddr, SocketAddr)>,
    sql_delay: Option<u64>,
    fallback_on_miss: bool,
    passthrough_ports: Vec<u16>,
    test_set: String,
    app_cmd: Vec<String>,
}

const USAGE: &str = "Usage: parrot <record|test> [options] -- <command> [args...]\n\
\n\
Options:\n\
\t--bind <ip:port>\t\tProxy listen address (env: PARROT_PROXY_LISTEN_ADDR)\n\
\t--ingress <listen>:<app>\tCapture inbound calls by proxying listen addr to the app addr\n\
\t--sql-delay <seconds>\t\tMySQL idle factor (read deadline is 2s * this)\n\
\t--fallback-on-miss\t\tProxy unmatched replay traffic to the real upstream\n\
\t--passthrough <port>\t\tNever intercept this upstream port (repeatable)\n\
\t--test-set <id>\t\t\tTest-set id for captured test cases (default: test-set-0)";

fn parse_args() -> Result<CliArgs, String> {
    let mut args = std::env::args().skip(1).peekable();

    let mode = match args.next().as_deref() {
        Some("record") => Mode::Record,
        Some("test") | Some("replay") => Mode::Test,
        Some("--help") | Some("-h") => {
            println!("{USAGE}");
            std::process::exit(0);
        }
        Some(other) => return Err(format!("unknown mode {other:?} (expected record|test)")),
        None => return Err("missing mode (record|test)".to_string()),
    };

    let mut out = CliArgs {
        mode,
        bind: None,
        ingress: None,
        sql_delay: None,
        fallback_on_miss: false,
        passthrough_ports: Vec::new(),
        test_set: "test-set-0".to_string(),
        app_cmd: Vec::new(),
    };

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--" => {
                out.app_cmd = args.collect();
                break;
            }
            "--bind" => {
                let value = args.next().ok_or("--bind requires a value")?;
                out.bind =
                    Some(SocketAddr::from_str(&value).map_err(|_| {
                        format!("invalid --bind value {value:?}")
                    })?);
            }
            "--ingress" => {
                let value = args.next().ok_or("--ingress requires listen:app")?;
                // Split "127.0.0.1:8080:127.0.0.1:8081" at the middle colon
                // pair boundary.
                let parts: Vec<&str> = value.splitn(4, ':').collect();
                if parts.len() != 4 {
                    return Err(format!(
                        "invalid --ingress value {value:?} (expected listenIp:listenPort:appIp:appPort)"
                    ));
                }
                let listen = format!("{}:{}", parts[0], parts[1]);
                let app = format!("{}:{}", parts[2], parts[3]);
                out.ingress = Some((
                    SocketAddr::from_str(&listen)
                        .map_err(|_| format!("invalid ingress listen addr {listen:?}"))?,
                    SocketAddr::from_str(&app)
                        .map_err(|_| format!("invalid ingress app addr {app:?}"))?,
                ));
            }
            "--sql-delay" => {
                let value = args.next().ok_or("--sql-delay requires a value")?;
                out.sql_delay =
                    Some(value.parse().map_err(|_| {
                        format!("invalid --sql-delay value {value:?}")
                    })?);
            }
            "--fallback-on-miss" => out.fallback_on_miss = true,
            "--passthrough" => {
                let value = args.next().ok_or("--passthrough requires a port")?;
                out.passthrough_ports.push(
                    value
                        .parse()
                        .map_err(|_| format!("invalid --passthrough port {value:?}"))?,
                );
            }
            "--test-set" => {
                out.test_set = args.next().ok_or("--test-set requires a value")?;
            }
            "--help" | "-h" => {
                println!("{USAGE}");
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument {other:?}")),
        }
    }

    if out.app_cmd.is_empty() {
        return Err("missing app command after --".to_string());
    }
    Ok(out)
}

fn build_runtime() -> std::io::Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(n) = std::env::var("PARROT_TOKIO_WORKER_THREADS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|n| *n > 0)
    {
        builder.worker_threads(n);
    }
    builder.enable_all().build()
}

fn main() -> std::io::Result<()> {
    build_runtime()?.block_on(async_main())
}

async fn async_main() -> std::io::Result<()> {
    let cli = match parse_args() {
        Ok(cli) => cli,
        Err(err) => {
            eprintln!("error: {err}");
            eprintln!("Run with --help for usage.");
            std::process::exit(2);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut proxy_cfg = ProxyConfig::from_env();
    if let Some(bind) = cli.bind {
        proxy_cfg.listen_addr = bind;
    }

    let mut opts = OutgoingOptions::default();
    if let Some(sql_delay) = cli.sql_delay {
        opts.sql_delay = sql_delay;
    }
    opts.fallback_on_miss = cli.fallback_on_miss;
    opts.passthrough_ports = cli.passthrough_ports.iter().copied().collect();

    let plan = SessionPlan {
        app_id: 0,
        mode: cli.mode,
        app_cmd: cli.app_cmd,
        opts,
        proxy_cfg,
        ingress: cli
            .ingress
            .map(|(listen, app_addr)| IngressPlan { listen, app_addr }),
        test_set_id: cli.test_set,
    };

    // The storage layer is external; the in-memory stores here hold a
    // single session's artifacts for the lifetime of the process.
    let mock_store = Arc::new(InMemoryMockStore::new());
    let test_store = Arc::new(InMemoryTestStore::new());

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let sigterm = async {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(err) => {
                    tracing::warn!("failed to install SIGTERM handler: {err}");
                    std::future::pending::<()>().await;
                }
            }
        };
        #[cfg(not(unix))]
        let sigterm = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm => {}
        }
        tracing::info!("shutdown signal received");
        signal_token.cancel();
    });

    let stop = run_session(plan, mock_store, test_store, shutdown).await;
    match stop.kind {
        AppErrorKind::AppStopped | AppErrorKind::CtxCanceled => {
            tracing::info!("{stop}");
            Ok(())
        }
        _ => {
            tracing::error!("{stop}");
            std::process::exit(1);
        }
    }
}
