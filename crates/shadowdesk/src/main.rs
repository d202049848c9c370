//! shadowdesk: proxy session orchestrator
//!
//! Entry point. Initializes the global allocator, sets up logging on stderr,
//! loads the app config and serves RPC requests over stdin/stdout.

mod arguments;
mod rpc;

use anyhow::{Context, Result};
use arguments::Arguments;
use clap::Parser;
use shadowdesk_core::{AppConfig, HttpClient, MainService, Prober, SessionManager};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const DEFAULT_LOG_FILTER: &str = "shadowdesk=info,shadowdesk_core=info";

#[tokio::main]
async fn main() -> Result<()> {
    let args = Arguments::parse();

    let mut config = match &args.config {
        Some(path) => AppConfig::load(path)
            .with_context(|| format!("loading app config {}", path.display()))?,
        None => AppConfig::default(),
    };
    if let Some(dir) = args.runtime_dir.clone() {
        config.runtime_dir = Some(dir);
    }

    // stdout carries RPC replies, so logs go to stderr
    let directive = args
        .log
        .clone()
        .or_else(|| config.log_filter.clone())
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    info!("shadowdesk {} starting", env!("CARGO_PKG_VERSION"));

    let runtime = config.runtime();
    runtime
        .ensure()
        .await
        .with_context(|| format!("preparing runtime directory {}", runtime.root().display()))?;
    info!("Runtime directory: {}", runtime.root().display());

    let launcher = Arc::new(config.launcher(&runtime));
    let manager = SessionManager::new(launcher, runtime, config.client_options());
    let service = MainService::new(
        Arc::new(manager),
        Arc::new(Prober::new(config.probe_options())),
        Arc::new(HttpClient::new(config.fetch_options())),
    );

    rpc::serve(Arc::new(service)).await?;

    info!("shadowdesk shutting down");
    Ok(())
}
