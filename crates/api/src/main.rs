//! Traffic Inference Gateway - Main Entry Point

use std::path::PathBuf;

use api::config::{AppConfig, BackendKind};
use api::{init_logging, run_server};
use clap::{Parser, ValueEnum};
use tracing::info;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendArg {
    Ort,
    Mock,
}

impl From<BackendArg> for BackendKind {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Ort => BackendKind::Ort,
            BackendArg::Mock => BackendKind::Mock,
        }
    }
}

/// Batched plate detection over live video sources
#[derive(Debug, Parser)]
#[command(name = "traffic-gateway", version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Configuration file (TOML)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Bind address, overrides the configuration
    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    /// Model backend
    #[arg(long, value_enum)]
    backend: Option<BackendArg>,

    /// Log filter when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(backend) = args.backend {
        config.engine.backend = backend.into();
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    init_logging(&config.logging);

    info!("=== Traffic Inference Gateway v{} ===", env!("CARGO_PKG_VERSION"));
    info!(
        "Backend {:?}, detector '{}' at {}, devices {:?}",
        config.engine.backend,
        config.engine.detector_model,
        config.engine.precision,
        config.engine.devices
    );

    run_server(config).await
}
