//! svd: the supervisor daemon
//!
//! Loads process definitions, runs the supervision tick loop and serves the
//! control API on a Unix socket until SIGINT, SIGTERM or `POST /shutdown`.

#[path = "daemon/config.rs"]
mod config;

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use config::DaemonConfig;
use sv_engine::adapters::rest::build_router;
use sv_engine::adapters::rest::unix_socket::{bind_unix_socket, serve_listener};
use sv_engine::application::Supervisor;
use sv_engine::infrastructure::{SysinfoMetrics, TokioProcessExecutor};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let config = DaemonConfig::from_env();
    init_tracing(&config)?;
    config.validate()?;

    info!(
        socket = %config.socket,
        config = ?config.config_path(),
        tick_ms = config.tick_interval.as_millis() as u64,
        "Starting svd"
    );

    let supervisor = Arc::new(Supervisor::new(
        Arc::new(TokioProcessExecutor::new()),
        Arc::new(SysinfoMetrics::new()),
    ));

    if let Some(path) = config.config_path() {
        let names = supervisor.load(&path).await.map_err(|e| {
            error!(path = %path.display(), error = %e, "Failed to load configuration");
            e
        })?;
        info!(processes = ?names, "Processes registered");
    }

    let listener = bind_unix_socket(&config.socket).map_err(|e| {
        error!(socket = %config.socket, error = %e, "Failed to bind control socket");
        e
    })?;

    let sigint = signal(SignalKind::interrupt())?;
    let sigterm = signal(SignalKind::terminate())?;
    let signals = tokio::spawn(shutdown_on_signal(supervisor.clone(), sigint, sigterm));

    let ticker = {
        let supervisor = supervisor.clone();
        let period = config.tick_interval;
        tokio::spawn(async move { supervisor.run(period).await })
    };

    let token = supervisor.shutdown_token();
    let result = serve_listener(
        listener,
        &config.socket,
        build_router(supervisor.clone()),
        async move { token.cancelled().await },
    )
    .await;

    if let Err(ref e) = result {
        error!(error = %e, "Control API failed");
    }

    // Covers the server exiting on its own
    supervisor.shutdown().await;
    signals.abort();
    if let Err(e) = ticker.await {
        error!(error = %e, "Supervision loop panicked");
    }

    info!("svd stopped");
    result
}

async fn shutdown_on_signal(supervisor: Arc<Supervisor>, mut sigint: Signal, mut sigterm: Signal) {
    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }
    supervisor.shutdown().await;
}

fn init_tracing(config: &DaemonConfig) -> std::io::Result<()> {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match config.log_file {
        Some(ref path) => {
            if let Some(parent) = Path::new(path).parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.init(),
    }
    Ok(())
}
