use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use marionette_core::manifest::Manifest;
use marionette_host::{demo, server};

#[derive(Parser, Debug)]
#[command(name = "marionette", about = "Manifest-driven invocation bridge host")]
struct Args {
    /// Port the WebSocket host listens on
    #[arg(long, default_value_t = 3055)]
    port: u16,

    /// Manifest file to validate invoker coverage against. Without one the
    /// built-in demo manifest is used.
    #[arg(long)]
    manifest: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    tracing::info!("Starting bridge host");

    let built = demo::build();
    let engine: Arc<marionette_host::Engine> = built.engine;

    let manifest = match &args.manifest {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            let manifest = Manifest::from_json(&raw)?;
            tracing::info!(path = %path.display(), entries = manifest.len(), "Manifest loaded");
            manifest
        }
        None => built.manifest,
    };

    for entry in engine.registry().coverage_gaps(&manifest) {
        tracing::warn!(id = %entry.id, "Manifest entry has no registered invoker");
    }

    let config = server::ServerConfig {
        port: args.port,
        ..Default::default()
    };
    let handle = server::start(config, engine).await?;
    tracing::info!(port = handle.port, "Bridge host ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    Ok(())
}
