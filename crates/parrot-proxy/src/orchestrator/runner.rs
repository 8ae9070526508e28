//! The session runner: one call drives a whole record or replay session
//! and reports why it stopped.

use std::net::SocketAddr;
use std::sync::Arc;

use parrot_match::{MockStore, TestStore};
use parrot_model::{AppError, AppErrorKind, Mock, Mode, OutgoingOptions};
use parrot_redirect::RedirectTable;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::ProxyConfig;
use crate::mysql::CONFIG_MOCK_TYPE;
use crate::proxy::Proxy;
use crate::session::{Session, Sessions};

use super::ingress;

/// Everything needed to run one session.
pub struct SessionPlan {
    pub app_id: u64,
    pub mode: Mode,
    /// Program and arguments of the application under test.
    pub app_cmd: Vec<String>,
    pub opts: OutgoingOptions,
    pub proxy_cfg: ProxyConfig,
    /// Record mode: capture inbound calls by proxying `ingress_listen` to
    /// the app's real port.
    pub ingress: Option<IngressPlan>,
    pub test_set_id: String,
}

pub struct IngressPlan {
    pub listen: SocketAddr,
    pub app_addr: SocketAddr,
}

/// Run the session to completion. The returned error kind is the stop
/// reason; `CtxCanceled` and `AppStopped` are normal ends.
pub async fn run_session(
    plan: SessionPlan,
    mock_store: Arc<dyn MockStore>,
    test_store: Arc<dyn TestStore>,
    shutdown: CancellationToken,
) -> AppError {
    match run_inner(plan, mock_store, test_store, shutdown).await {
        Ok(stop) => stop,
        Err(err) => err,
    }
}

async fn run_inner(
    plan: SessionPlan,
    mock_store: Arc<dyn MockStore>,
    test_store: Arc<dyn TestStore>,
    shutdown: CancellationToken,
) -> Result<AppError, AppError> {
    let sessions = Arc::new(Sessions::new());
    let table = Arc::new(RedirectTable::new());
    let token = shutdown.child_token();

    // Capture channels; storage drains them as the handlers produce.
    let (mock_tx, mut mock_rx) = mpsc::channel::<Mock>(plan.proxy_cfg.mock_buffer);
    let (tc_tx, mut tc_rx) = mpsc::channel(plan.proxy_cfg.testcase_buffer);

    let recording = plan.mode == Mode::Record;
    let session = Arc::new(Session {
        id: plan.app_id,
        mode: plan.mode,
        store: Arc::clone(&mock_store),
        mock_tx: recording.then(|| mock_tx.clone()),
        testcase_tx: recording.then(|| tc_tx.clone()),
        opts: plan.opts.clone(),
        token: token.clone(),
    });
    sessions.register(Arc::clone(&session));
    drop((mock_tx, tc_tx));

    let drain_mocks = {
        let store = Arc::clone(&mock_store);
        tokio::spawn(async move {
            while let Some(mock) = mock_rx.recv().await {
                let config = mock
                    .metadata
                    .get("type")
                    .is_some_and(|t| t == CONFIG_MOCK_TYPE);
                if config {
                    store.insert_unfiltered(mock);
                } else {
                    store.insert_filtered(mock);
                }
            }
        })
    };
    let drain_tests = {
        let store = Arc::clone(&test_store);
        let test_set_id = plan.test_set_id.clone();
        tokio::spawn(async move {
            while let Some(tc) = tc_rx.recv().await {
                store.insert_test_case(tc, &test_set_id);
            }
        })
    };

    let proxy = Proxy::start(plan.proxy_cfg.clone(), Arc::clone(&sessions), Arc::clone(&table))
        .await
        .map_err(|err| AppError::internal(format!("start proxy: {err:#}")))?;
    let proxy_addr = proxy.local_addr();

    let ingress_handle = match (&plan.ingress, recording) {
        (Some(ingress_plan), true) => Some(
            ingress::start(
                ingress_plan.listen,
                ingress_plan.app_addr,
                Arc::clone(&session),
                plan.proxy_cfg.clone(),
            )
            .await
            .map_err(|err| AppError::internal(format!("start ingress capture: {err:#}")))?,
        ),
        _ => None,
    };

    // Launch the app under the redirector and wait for either its exit or
    // cancellation.
    let stop = run_app(&plan, proxy_addr, Arc::clone(&table), &token).await;

    // Teardown: cancellation propagates handler -> socket close ->
    // redirector release; the purge catches anything a crashed handler
    // left behind.
    token.cancel();
    if let Some(handle) = ingress_handle {
        handle.shutdown().await;
    }
    proxy.shutdown().await;
    table.purge_app(plan.app_id);
    sessions.remove(plan.app_id);
    // The local session Arc holds capture senders; the drains only finish
    // once every sender is gone.
    drop(session);
    let _ = drain_mocks.await;
    let _ = drain_tests.await;

    info!(stop = ?stop.kind, "session finished");
    Ok(stop)
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
async fn run_app(
    plan: &SessionPlan,
    proxy_addr: SocketAddr,
    table: Arc<RedirectTable>,
    token: &CancellationToken,
) -> AppError {
    use parrot_redirect::{RedirectCfg, Redirector};

    let Some((program, args)) = plan.app_cmd.split_first() else {
        return AppError::new(AppErrorKind::CommandError, "empty app command");
    };

    let proxy_v4 = match proxy_addr {
        SocketAddr::V4(v4) => v4,
        SocketAddr::V6(_) => {
            return AppError::internal("proxy must listen on IPv4 for redirection")
        }
    };
    let cfg = RedirectCfg {
        app_id: plan.app_id,
        proxy_v4,
        proxy_v6: None,
        dns_loopback: plan.proxy_cfg.dns_loopback,
        passthrough_ports: plan.opts.passthrough_ports.clone(),
    };

    let program = program.clone();
    let args = args.to_vec();
    let launch =
        tokio::task::spawn_blocking(move || Redirector::launch(&program, &args, cfg, table));
    let handle = match launch.await {
        Ok(Ok(handle)) => handle,
        Ok(Err(err)) => {
            return AppError::new(AppErrorKind::CommandError, format!("launch app: {err}"))
        }
        Err(err) => return AppError::internal(format!("launch task panicked: {err}")),
    };

    let root_pid = handle.root_pid();
    info!(pid = root_pid, "application launched under redirection");

    let mut join = tokio::task::spawn_blocking(move || handle.join());
    tokio::select! {
        _ = token.cancelled() => {
            // Dropping the join future does not stop the tracer; the
            // process tree dies with the session.
            parrot_redirect::kill_root(root_pid);
            match join.await {
                Ok(_) => AppError::new(AppErrorKind::CtxCanceled, "session cancelled"),
                Err(err) => AppError::internal(format!("tracer join failed: {err}")),
            }
        }
        exit = &mut join => match exit {
            Ok(0) => AppError::new(AppErrorKind::AppStopped, "application exited"),
            Ok(127) => AppError::new(AppErrorKind::CommandError, "command not found"),
            Ok(code) => AppError::new(
                AppErrorKind::Unexpected,
                format!("application exited with code {code}"),
            ),
            Err(err) => AppError::internal(format!("tracer join failed: {err}")),
        }
    }
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
async fn run_app(
    plan: &SessionPlan,
    _proxy_addr: SocketAddr,
    _table: Arc<RedirectTable>,
    token: &CancellationToken,
) -> AppError {
    tracing::warn!(
        app = ?plan.app_cmd,
        "connect redirection requires x86_64 linux; running without an instrumented app"
    );
    token.cancelled().await;
    AppError::new(AppErrorKind::CtxCanceled, "session cancelled")
}
