//! Daemon assembly: election, store, services, background tasks, serve.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::api::{build_router, AppState};
use crate::config::ConfigService;
use crate::consult::ConsultationOrchestrator;
use crate::conversations::ConversationService;
use crate::hub::EventHub;
use crate::lifecycle::{self, DaemonLock, Election, LockGuard, IDLE_TIMEOUT};
use crate::paths::DaemonPaths;
use crate::rag::{EmbedClient, RagPipeline};
use crate::store::{legacy, Store};

const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Run the daemon to completion. Returns Ok when another instance already
/// holds the lock (after printing its port) or after a clean shutdown.
pub async fn run_daemon(paths: DaemonPaths) -> anyhow::Result<()> {
    let (port, token) = match lifecycle::elect(&paths)? {
        Election::AlreadyRunning(lock) => {
            println!("daemon already running on port {}", lock.port);
            return Ok(());
        }
        Election::Won { port, token } => (port, token),
    };

    let store = Arc::new(Store::open(&paths.db_file())?);
    let hub = Arc::new(EventHub::new());
    let config = Arc::new(ConfigService::new(Arc::clone(&store), Arc::clone(&hub)));
    // Credentials in a legacy config must pass through the config service
    // so they land sealed, the same as a live write.
    if let Err(e) = legacy::import_legacy(&paths, &store, &config) {
        warn!("legacy import failed: {}", e);
    }
    let conversations = Arc::new(ConversationService::new(
        Arc::clone(&store),
        Arc::clone(&config),
        Arc::clone(&hub),
    ));
    let rag = Arc::new(RagPipeline::new(
        Arc::clone(&store),
        EmbedClient::from_env(),
    ));
    let orchestrator = Arc::new(ConsultationOrchestrator::new(
        Arc::clone(&conversations),
        Arc::clone(&config),
        Arc::clone(&rag),
    ));

    // Bind before writing the lock so the advertised port is really ours.
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
    let lock = DaemonLock {
        pid: std::process::id(),
        port,
        started_at: Utc::now(),
        token: token.clone(),
    };
    lifecycle::write_lock(&paths, &lock)?;
    let _lock_guard = LockGuard::new(paths.clone());
    info!("daemon listening on 127.0.0.1:{}", port);

    match config.load() {
        Ok(cfg) if cfg.auto_open_web_ui => open_web_ui(port),
        Ok(_) => {}
        Err(e) => warn!("config load at startup failed: {}", e),
    }

    let state = AppState {
        store: Arc::clone(&store),
        config,
        conversations: Arc::clone(&conversations),
        orchestrator,
        rag,
        hub: Arc::clone(&hub),
        token: Arc::new(token),
        started_at: Instant::now(),
        webui_dir: paths.webui_dir(),
    };
    let app = build_router(state);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // One sweep at startup, then the 60s loop.
    if let Err(e) = conversations.sweep_stale() {
        warn!("startup sweep failed: {}", e);
    }
    tokio::spawn(Arc::clone(&conversations).run_sweeper(shutdown_rx.clone()));
    tokio::spawn(run_idle_timer(Arc::clone(&hub), shutdown_tx.clone()));

    let mut signal_rx = shutdown_rx.clone();
    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        tokio::select! {
            _ = wait_for_signal() => {
                info!("shutdown signal received");
            }
            _ = signal_rx.changed() => {
                info!("idle timeout reached, shutting down");
            }
        }
    });

    if let Err(e) = serve.await {
        error!("server error: {}", e);
    }
    let _ = shutdown_tx.send(true);

    // The last store handle checkpoints the WAL on drop; the guard removes
    // the lock file.
    drop(store);
    info!("daemon stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).expect("SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Best-effort browser launch for the UI; failures are not the daemon's
/// problem.
fn open_web_ui(port: u16) {
    let url = format!("http://127.0.0.1:{}/", port);
    #[cfg(target_os = "macos")]
    let opener = "open";
    #[cfg(not(target_os = "macos"))]
    let opener = "xdg-open";
    if let Err(e) = std::process::Command::new(opener)
        .arg(&url)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
    {
        warn!("could not open {}: {}", url, e);
    }
}

/// Shut the daemon down after 30 idle minutes. The timer only runs while
/// the connected-client count sits at zero; any connection rearms it.
async fn run_idle_timer(hub: Arc<EventHub>, shutdown_tx: watch::Sender<bool>) {
    let mut idle_since: Option<Instant> = Some(Instant::now());
    let mut ticker = tokio::time::interval(IDLE_CHECK_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if shutdown_tx.is_closed() {
            return;
        }
        if hub.client_count() > 0 {
            idle_since = None;
            continue;
        }
        let since = *idle_since.get_or_insert_with(Instant::now);
        if since.elapsed() >= IDLE_TIMEOUT {
            info!("no clients for {} minutes, idling out", IDLE_TIMEOUT.as_secs() / 60);
            let _ = shutdown_tx.send(true);
            return;
        }
    }
}
