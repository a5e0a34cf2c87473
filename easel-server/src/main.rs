use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use easel_core::{
    ArtifactCache, DeviceMap, HistoryStore, HubProvisioner, Orchestrator, RegistryEngineProvider,
    ResourceTier, Settings,
};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod error;

#[derive(Parser, Debug)]
#[command(author, version, about = "Easel image generation server")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Host address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Settings file; defaults apply if it does not exist
    #[arg(long, default_value = "easel.toml")]
    config: PathBuf,

    /// History database
    #[arg(long, default_value = "easel-history.sqlite")]
    database: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "easel_server=info,easel_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::load(&args.config)?;
    let tier = ResourceTier::detect();

    let history = HistoryStore::open(&args.database)
        .await
        .with_context(|| format!("opening history at {}", args.database.display()))?;

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(RegistryEngineProvider::new(DeviceMap::from_cpu_flag(
            args.cpu,
        ))),
        Arc::new(HubProvisioner::new(tier.quantized())),
        history.clone(),
        settings,
        tier,
    ));
    let thumbnails = ArtifactCache::with_default_limits(Arc::new(history.clone()));
    let state = Arc::new(api::AppState::new(
        orchestrator,
        thumbnails,
        args.config.clone(),
    ));

    let app = api::router(state);

    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", args.host, args.port))?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "Started server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    history.close().await;
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    tracing::info!("Received Ctrl-C, shutting down");
}
