mod config;

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use futures_util::SinkExt;
use liboutpost::{
    AgentHandler, IsolationCoordinator, ScriptService, SensitiveValueMasker, ShellRunner,
    WorkspaceCleaner, WorkspaceFactory,
};
use outpost_protocol::{ErrorCode, MAX_JSON_LINE_BYTES, PROTOCOL_VERSION, Request, Response};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{Args, RuntimeConfig, load_runtime_config, print_help};

type Handler = AgentHandler<ShellRunner>;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "outpost_agent=info,liboutpost=info".into()),
        )
        .init();

    let args = Args::parse()?;
    if args.help {
        print_help();
        return Ok(());
    }
    let cfg = load_runtime_config(&args)?;
    ensure_private_dir(&cfg.runtime_dir)?;
    ensure_private_dir(&cfg.work_dir)?;
    if let Some(parent) = cfg.socket_path.parent() {
        fs::create_dir_all(parent)?;
    }
    remove_stale_socket(&cfg.socket_path)?;

    let listener = UnixListener::bind(&cfg.socket_path)
        .with_context(|| format!("failed to bind {}", cfg.socket_path.display()))?;
    fs::set_permissions(&cfg.socket_path, fs::Permissions::from_mode(0o600))?;
    fs::write(&cfg.pid_file, std::process::id().to_string())?;

    info!(
        "outpost-agent started pid={} socket={} work_dir={} protocol_version={}",
        std::process::id(),
        cfg.socket_path.display(),
        cfg.work_dir.display(),
        PROTOCOL_VERSION
    );

    let masker = Arc::new(
        SensitiveValueMasker::new(cfg.sensitive_values.iter())
            .context("invalid sensitive_values")?,
    );
    let service = Arc::new(ScriptService::new(
        WorkspaceFactory::new(&cfg.work_dir, masker),
        Arc::new(IsolationCoordinator::new()),
        Arc::new(ShellRunner::default()),
    ));
    let handler = Arc::new(AgentHandler::new(Arc::clone(&service), cfg.kubernetes));

    let cleaner_shutdown = CancellationToken::new();
    let cleaner_task = tokio::spawn({
        let cleaner = WorkspaceCleaner::new(Arc::clone(&service), cfg.workspace_max_age);
        let interval = cfg.cleaner_interval;
        let shutdown = cleaner_shutdown.clone();
        async move { cleaner.run(interval, shutdown).await }
    });

    let active_connections: Arc<RwLock<Vec<JoinHandle<()>>>> = Arc::new(RwLock::new(Vec::new()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(wait_for_signals(shutdown_tx.clone()));

    let accept_result = accept_loop(
        listener,
        handler,
        cfg.clone(),
        shutdown_rx,
        Arc::clone(&active_connections),
    )
    .await;

    cleaner_shutdown.cancel();
    let _ = cleaner_task.await;
    for handle in active_connections.write().await.drain(..) {
        handle.abort();
    }

    let _ = fs::remove_file(&cfg.socket_path);
    let _ = fs::remove_file(&cfg.pid_file);

    accept_result
}

async fn wait_for_signals(shutdown_tx: watch::Sender<bool>) {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            warn!("failed to install SIGTERM handler: {err}");
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown_tx.send_replace(true);
            }
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt received"),
        _ = terminate.recv() => info!("terminate received"),
    }
    shutdown_tx.send_replace(true);
}

async fn accept_loop(
    listener: UnixListener,
    handler: Arc<Handler>,
    cfg: RuntimeConfig,
    mut shutdown_rx: watch::Receiver<bool>,
    active_connections: Arc<RwLock<Vec<JoinHandle<()>>>>,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("shutdown requested, stopping accept loop");
                    break;
                }
            }
            accepted = listener.accept() => {
                let (stream, _) = match accepted {
                    Ok(v) => v,
                    Err(err) => {
                        warn!("accept failed: {err}");
                        continue;
                    }
                };

                if let Err(err) = verify_peer_uid(&stream, cfg.allowed_uid) {
                    warn!("rejected peer: {err}");
                    continue;
                }

                let handle = tokio::spawn(handle_connection(
                    stream,
                    Arc::clone(&handler),
                    cfg.outbound_queue,
                ));
                let mut connections = active_connections.write().await;
                connections.retain(|handle| !handle.is_finished());
                connections.push(handle);
            }
        }
    }

    Ok(())
}

async fn handle_connection(stream: UnixStream, handler: Arc<Handler>, outbound_queue: usize) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(
        read_half,
        LinesCodec::new_with_max_length(MAX_JSON_LINE_BYTES),
    );

    let (out_tx, mut out_rx) = mpsc::channel::<Response>(outbound_queue);
    let mut writer = FramedWrite::new(
        write_half,
        LinesCodec::new_with_max_length(MAX_JSON_LINE_BYTES),
    );

    let writer_task = tokio::spawn(async move {
        while let Some(resp) = out_rx.recv().await {
            let line = match serde_json::to_string(&resp) {
                Ok(line) => line,
                Err(err) => {
                    error!("failed to encode response: {err}");
                    continue;
                }
            };

            if let Err(err) = writer.send(line).await {
                warn!("socket write failed: {err}");
                break;
            }
        }
    });

    if enqueue_response(&out_tx, Response::hello()).is_err() {
        writer_task.abort();
        return;
    }

    loop {
        let line = match futures_util::StreamExt::next(&mut reader).await {
            Some(Ok(line)) => line,
            Some(Err(err)) => {
                warn!("socket read failed: {err}");
                break;
            }
            None => break,
        };

        let response = match serde_json::from_str::<Request>(&line) {
            Ok(req) => handler.handle(req).await,
            Err(err) => Response::error(ErrorCode::InvalidRequest, format!("invalid request: {err}")),
        };
        if let Err(err) = enqueue_response(&out_tx, response) {
            warn!("dropping connection: {err}");
            break;
        }
    }

    drop(out_tx);
    let _ = writer_task.await;
}

fn enqueue_response(out_tx: &mpsc::Sender<Response>, response: Response) -> Result<()> {
    match out_tx.try_send(response) {
        Ok(()) => Ok(()),
        Err(mpsc::error::TrySendError::Full(_)) => Err(anyhow!("client outbound queue full")),
        Err(mpsc::error::TrySendError::Closed(_)) => Err(anyhow!("connection closed")),
    }
}

fn ensure_private_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("failed to create {}", path.display()))?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
    Ok(())
}

fn remove_stale_socket(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path)
            .with_context(|| format!("failed to remove stale socket {}", path.display()))?;
    }
    Ok(())
}

fn verify_peer_uid(stream: &UnixStream, expected_uid: u32) -> Result<()> {
    let creds = stream
        .peer_cred()
        .context("failed to query peer credentials")?;
    let uid = creds.uid();
    if uid != expected_uid {
        return Err(anyhow!(
            "peer uid {uid} is not allowed (expected {expected_uid})"
        ));
    }
    Ok(())
}
