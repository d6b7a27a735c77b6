use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use bulwark::config::{BulwarkConfig, LogFormat, LoggingConfig};
use bulwark::http::{router, AppState, HttpServer};
use bulwark::ratelimit::connect_store;

/// Rate-limited admission in front of an HTTP application.
#[derive(Debug, Parser)]
#[command(name = "bulwark", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long, env = "BULWARK_CONFIG")]
    config: Option<PathBuf>,

    /// Override the listen address
    #[arg(short, long)]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = BulwarkConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }

    init_tracing(&config.logging);

    info!("Starting Bulwark");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    config.validate()?;
    info!(
        listen_addr = %config.server.listen_addr,
        backend = ?config.store.backend,
        "Configuration loaded"
    );

    let store = connect_store(&config.store).await?;
    let state = AppState::from_config(&config, store).await?;
    info!(stages = ?state.pipeline.stage_names(), "Pipeline ready");

    let app = router(state, &config.auth.login_path);
    let server = HttpServer::new(config.server.listen_addr, app);

    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Bulwark stopped");
    Ok(())
}

/// `RUST_LOG` wins over the configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Resolve on Ctrl+C or SIGTERM. A handler that cannot be installed is logged
/// and never fires, so the other one still shuts the server down.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Ctrl+C received, draining connections"),
        _ = terminate => info!("SIGTERM received, draining connections"),
    }
}
