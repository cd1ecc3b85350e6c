use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use incident_api::{router, AppState};
use incident_core::AppConfig;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "incident-api", about = "Incident resolution REST service")]
struct Args {
    /// TOML config file. Missing files fall back to defaults.
    #[arg(long, env = "INCIDENT_CONFIG", default_value = "incident.toml")]
    config: PathBuf,

    /// Overrides `server.bind` from the config file.
    #[arg(long)]
    bind: Option<String>,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut config = AppConfig::load(Some(&args.config))?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    let bind = config.server.bind.clone();

    let state = tokio::task::spawn_blocking(move || AppState::from_config(config)).await??;
    let app = router(Arc::new(state));

    let listener = TcpListener::bind(&bind).await?;
    info!("Starting incident API on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
