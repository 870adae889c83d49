use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;

use mirror_core::{config, MemoryServer, MirrorConfig, RemoteAdapter, Servers, Side};
use mirror_sync::{Dispatcher, SyncEngine};

use crate::error::{io_err, DaemonError};
use crate::http::FtrackHttpAdapter;
use crate::paths::{run_dir, socket_path};
use crate::protocol::{DaemonCommand, DaemonRequest, DaemonResponse};

/// Where the daemon's two servers come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// The configured ftrack servers over HTTP.
    #[default]
    Ftrack,
    /// Two empty in-process servers, for exercising the daemon itself.
    Memory,
}

/// What the control socket needs to answer `status`.
#[derive(Clone)]
struct StatusContext {
    home: PathBuf,
    backend: Backend,
    started_at_unix: u64,
    engine: Arc<SyncEngine>,
}

/// Load config and `.env` files, start logging, and block the current thread
/// on the daemon until it exits.
pub fn start_blocking(home: &Path, backend: Backend) -> Result<(), DaemonError> {
    let env_files = config::load_env_files_at(home);
    let config = config::load_at(home)?;
    init_tracing(config.log.json);
    for path in env_files {
        tracing::debug!(path = %path.display(), "loaded environment file");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf(), config, backend))
}

/// Run the dispatcher, maintenance loop, control socket, and signal handler
/// until one of them requests shutdown.
pub async fn run(home: PathBuf, config: MirrorConfig, backend: Backend) -> Result<(), DaemonError> {
    ensure_runtime_dirs(&home)?;

    let servers = build_servers(&config, backend)?;
    let engine = Arc::new(SyncEngine::new(servers, config.sync.clone()));
    let dispatcher = Arc::new(Dispatcher::new(engine.clone()));
    let status = StatusContext {
        home: home.clone(),
        backend,
        started_at_unix: unix_seconds_now(),
        engine: engine.clone(),
    };
    tracing::info!(
        backend = ?backend,
        echo_ttl_secs = engine.settings().echo_ttl_secs,
        "starting trackmirror daemon",
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let dispatcher_handle = {
        let shutdown = shutdown_tx.clone();
        let rx = shutdown.subscribe();
        tokio::spawn(async move {
            let result = dispatcher.run(rx).await.map_err(DaemonError::from);
            let _ = shutdown.send(());
            result
        })
    };

    let maintenance_handle = {
        let shutdown = shutdown_tx.clone();
        let rx = shutdown.subscribe();
        let engine = engine.clone();
        tokio::spawn(async move {
            let result = maintenance_task(engine, rx).await;
            let _ = shutdown.send(());
            result
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let rx = shutdown.subscribe();
        tokio::spawn(async move {
            let result = socket_server_task(status, shutdown.clone(), rx).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        let rx = shutdown.subscribe();
        tokio::spawn(async move { signal_task(shutdown, rx).await })
    };

    let (dispatcher_result, maintenance_result, socket_result, signal_result) = tokio::join!(
        dispatcher_handle,
        maintenance_handle,
        socket_handle,
        signal_handle
    );

    handle_join("dispatcher", dispatcher_result)?;
    handle_join("maintenance", maintenance_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("signal_handler", signal_result)?;
    tracing::info!("trackmirror daemon stopped");
    Ok(())
}

fn build_servers(config: &MirrorConfig, backend: Backend) -> Result<Servers, DaemonError> {
    let adapter = |side: Side| -> Result<Arc<dyn RemoteAdapter>, DaemonError> {
        let adapter: Arc<dyn RemoteAdapter> = match backend {
            Backend::Memory => MemoryServer::new(side),
            Backend::Ftrack => {
                let server = config.servers.get(side);
                let credentials = server.credentials(side)?;
                tracing::info!(
                    server = %side,
                    url = %credentials.url,
                    user = %credentials.api_user,
                    "connecting",
                );
                Arc::new(FtrackHttpAdapter::new(
                    side,
                    credentials,
                    server.timeout(),
                    config.poll.clone(),
                ))
            }
        };
        Ok(adapter)
    };
    Ok(Servers::new(adapter(Side::Undark)?, adapter(Side::Pbv)?)?)
}

/// Periodic echo sweep and counters log.
async fn maintenance_task(
    engine: Arc<SyncEngine>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut sweep = tokio::time::interval(engine.settings().sweep_interval());
    let mut stats = tokio::time::interval(engine.settings().stats_interval());
    // Both intervals fire immediately; skip that first tick.
    sweep.tick().await;
    stats.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = sweep.tick() => {
                let removed = engine.echo().sweep();
                if removed > 0 {
                    tracing::debug!(
                        removed,
                        remaining = engine.echo().len(),
                        "swept expired echo entries",
                    );
                }
            }
            _ = stats.tick() => log_counters(&engine),
        }
    }

    log_counters(&engine);
    Ok(())
}

fn log_counters(engine: &SyncEngine) {
    for (handler, counters) in engine.stats().snapshot() {
        tracing::info!(
            handler = %handler,
            applied = counters.applied,
            suppressed = counters.suppressed,
            skipped = counters.skipped,
            failed = counters.failed,
            retried = counters.retried,
            "sync counters",
        );
    }
    tracing::info!(echo_entries = engine.echo().len(), "echo suppressor");
}

async fn signal_task(
    shutdown: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .map_err(|e| io_err("SIGTERM handler", e))?;
    tokio::select! {
        _ = shutdown_rx.recv() => Ok(()),
        _ = terminate.recv() => {
            tracing::info!("received SIGTERM, shutting down daemon");
            let _ = shutdown.send(());
            Ok(())
        }
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => {
                    tracing::info!("received ctrl-c, shutting down daemon");
                    let _ = shutdown.send(());
                    Ok(())
                }
                Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
            }
        }
    }
}

async fn socket_server_task(
    status: StatusContext,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let socket = socket_path(&status.home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::info!(socket = %socket.display(), "control socket listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let status = status.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, status, shutdown_tx).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    status: StatusContext,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("control socket", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request: DaemonRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let response = match request.cmd {
            DaemonCommand::Status => DaemonResponse::ok(build_status_payload(&status)),
            DaemonCommand::Stop => {
                tracing::info!("stop requested over control socket");
                let _ = shutdown_tx.send(());
                DaemonResponse::ok(json!({ "stopping": true }))
            }
        };

        write_response(&mut writer, &response).await?;
        if request.cmd == DaemonCommand::Stop {
            break;
        }
    }

    Ok(())
}

fn build_status_payload(status: &StatusContext) -> Value {
    let engine = &status.engine;
    let uptime_secs = unix_seconds_now().saturating_sub(status.started_at_unix);
    json!({
        "running": true,
        "backend": status.backend,
        "started_at_unix": status.started_at_unix,
        "uptime_secs": uptime_secs,
        "echo_entries": engine.echo().len(),
        "echo_ttl_secs": engine.echo().ttl().as_secs(),
        "active_locks": engine.locks().active(),
        "counters": engine.stats().snapshot(),
        "socket": socket_path(&status.home).display().to_string(),
    })
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn ensure_runtime_dirs(home: &Path) -> Result<(), DaemonError> {
    let run = run_dir(home);
    if !run.exists() {
        fs::create_dir_all(&run).map_err(|e| io_err(&run, e))?;
        set_dir_permissions(&run)?;
    }
    Ok(())
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let mut line = serde_json::to_vec(response)?;
    line.push(b'\n');
    writer.write_all(&line).await.map_err(|e| io_err("control socket", e))?;
    writer.flush().await.map_err(|e| io_err("control socket", e))
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

fn unix_seconds_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Install the global subscriber once. `RUST_LOG` overrides the `info`
/// default; `json` switches to one JSON object per line.
pub fn init_tracing(json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(filter).with_target(false);
    let _ = if json {
        builder.json().flatten_event(true).try_init()
    } else {
        builder.try_init()
    };
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use mirror_core::{EntityKind, EntityRef, SyncSettings};
    use mirror_sync::HandlerKind;
    use tempfile::TempDir;
    use tokio::time::advance;

    fn memory_engine(settings: SyncSettings) -> Arc<SyncEngine> {
        let servers = Servers::new(MemoryServer::new(Side::Undark), MemoryServer::new(Side::Pbv))
            .expect("servers");
        Arc::new(SyncEngine::new(servers, settings))
    }

    #[tokio::test]
    async fn status_payload_reports_counters_and_echo_entries() {
        let home = TempDir::new().expect("home");
        let engine = memory_engine(SyncSettings::default());
        engine.record_write(&EntityRef::new(Side::Pbv, EntityKind::Note, "n1"));
        engine.stats().applied(HandlerKind::Note);
        engine.stats().suppressed(HandlerKind::Note);

        let status = StatusContext {
            home: home.path().to_path_buf(),
            backend: Backend::Memory,
            started_at_unix: unix_seconds_now(),
            engine,
        };
        let payload = build_status_payload(&status);

        assert_eq!(payload["running"], json!(true));
        assert_eq!(payload["backend"], json!("memory"));
        assert_eq!(payload["echo_entries"], json!(1));
        assert_eq!(payload["echo_ttl_secs"], json!(60));
        assert_eq!(payload["counters"]["note"]["applied"], json!(1));
        assert_eq!(payload["counters"]["note"]["suppressed"], json!(1));
        assert_eq!(payload["counters"]["version"]["applied"], json!(0));
        assert!(payload["socket"]
            .as_str()
            .expect("socket")
            .ends_with(".trackmirror/run/daemon.sock"));
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn maintenance_sweeps_expired_echo_entries() {
        let mut settings = SyncSettings::default();
        settings.echo_ttl_secs = 5;
        settings.sweep_interval_secs = 10;
        let engine = memory_engine(settings);
        engine.record_write(&EntityRef::new(Side::Undark, EntityKind::Task, "t1"));

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(maintenance_task(engine.clone(), shutdown_rx));
        tokio::task::yield_now().await;

        advance(Duration::from_secs(11)).await;
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        assert!(engine.echo().is_empty());

        shutdown_tx.send(()).expect("shutdown");
        task.await.expect("join").expect("maintenance");
    }

    #[test]
    fn stale_socket_is_removed_before_bind() {
        let home = TempDir::new().expect("home");
        let socket = home.path().join("daemon.sock");
        fs::write(&socket, b"").expect("stale file");
        prepare_socket_for_bind(&socket).expect("prepare");
        assert!(!socket.exists());
    }

    #[test]
    fn missing_credentials_fail_before_start() {
        let mut config = MirrorConfig::default();
        config.servers.pbv.url_env = Some("TRACKMIRROR_TEST_UNSET_URL".to_string());
        let err = build_servers(&config, Backend::Ftrack).unwrap_err();
        assert!(matches!(err, DaemonError::Config(_)), "{err:?}");
    }
}
