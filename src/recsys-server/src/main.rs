//! Recommendation serving plane: tenant-scoped ranking, merchandising rules,
//! bandit policy selection and decision auditing behind one HTTP API.

use clap::Parser;
use recsys_api::{parse_tenant, ApiServer, AppState};
use recsys_core::config::AppConfig;
use recsys_store::MemoryStore;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "recsys-server")]
#[command(about = "Multi-tenant recommendation serving and experimentation plane")]
#[command(version)]
struct Cli {
    /// Bind address (overrides config)
    #[arg(long, env = "RECSYS__API__HOST")]
    host: Option<String>,

    /// HTTP port (overrides config)
    #[arg(long, env = "RECSYS__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// Prometheus scrape port (overrides config)
    #[arg(long, env = "RECSYS__METRICS__PORT")]
    metrics_port: Option<u16>,

    /// Load the demo catalog into the default tenant
    #[arg(long, default_value_t = false)]
    seed_demo: bool,
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "recsys_server=info,recsys_api=info,tower_http=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("recsys-server starting up");

    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(host) = cli.host {
        config.api.host = host;
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    if let Some(port) = cli.metrics_port {
        config.metrics.port = port;
    }
    if cli.seed_demo {
        config.seed_demo = true;
    }

    info!(
        namespace = %config.default_namespace,
        default_tenant = %config.default_tenant,
        http_port = config.api.http_port,
        metrics_port = config.metrics.port,
        bandit = %config.bandit.algorithm,
        "Configuration loaded"
    );

    let store = Arc::new(MemoryStore::new());
    if config.seed_demo {
        let tenant = parse_tenant(&config.default_tenant);
        store.seed_demo(tenant, &config.default_namespace);
        info!(%tenant, namespace = %config.default_namespace, "Demo catalog seeded");
    }

    let state = AppState::build(&config, store).await?;
    let recorder = state.recorder.clone();
    let exposure = state.exposure.clone();
    let server = ApiServer::new(config, state);

    if let Err(e) = server.start_metrics() {
        error!(error = %e, "Failed to start metrics exporter");
    }

    info!("recsys-server is ready to serve traffic");
    server.start_http(shutdown_signal()).await?;

    if let Some(recorder) = recorder {
        recorder.shutdown().await;
    }
    if let Some(exposure) = exposure {
        exposure.shutdown().await;
    }
    info!("recsys-server stopped");
    Ok(())
}
