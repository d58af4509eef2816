use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use iia_core::{DeviceMap, FluxConfig, FluxEngine, Orchestrator};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

mod gallery;
mod host;
mod overlay;
mod routes;
mod staging;
#[cfg(test)]
mod testing;

use host::{Host, LoadIntent};

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "IIA inference host")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long, env = "IIA_CPU")]
    cpu: bool,

    /// Model to load at startup
    #[arg(long, env = "IIA_MODEL")]
    model: Option<PathBuf>,

    /// VAE for the startup model; omit for the engine default
    #[arg(long, env = "IIA_VAE")]
    vae: Option<PathBuf>,

    /// Engine threads used when a load intent does not specify them
    #[arg(long, env = "IIA_THREADS", default_value_t = default_threads())]
    threads: usize,

    /// Host address to bind the server to
    #[arg(long, env = "IIA_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, env = "IIA_PORT", default_value_t = 8000)]
    port: u16,

    /// Directory under which generated images are saved
    #[arg(long, env = "IIA_OUTPUT_DIR", default_value = ".")]
    output_dir: PathBuf,

    /// Directory picked documents are staged into before loading
    #[arg(long, env = "IIA_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Default log level; RUST_LOG overrides it
    #[arg(long, env = "IIA_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Show the overlay immediately
    #[arg(long)]
    show_overlay: bool,
}

fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(4)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {e}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("stop signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(
                    args.log_level
                        .parse::<LevelFilter>()
                        .unwrap_or(LevelFilter::INFO)
                        .into(),
                )
                .from_env_lossy(),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let device_map = if args.cpu {
        DeviceMap::ForceCpu
    } else {
        DeviceMap::default()
    };
    let engine = FluxEngine::new(FluxConfig {
        device_map,
        ..FluxConfig::default()
    });
    let orchestrator = Orchestrator::new(engine).context("failed to start engine worker")?;
    let host = Arc::new(Host::new(orchestrator, args.cache_dir, args.threads));
    let gallery = gallery::spawn(host.orchestrator().subscribe(), args.output_dir);

    if args.show_overlay {
        host.show_overlay();
    }
    if let Some(model_path) = args.model {
        let intent = LoadIntent {
            model_path,
            vae_path: args.vae,
            threads: None,
            stage: false,
        };
        match host.load(intent).await {
            Ok(status) => info!("startup model: {status}"),
            Err(e) => warn!("startup model not loaded: {e}"),
        }
    }

    // --- Build axum router with shared state ---
    let app = routes::router(host.clone());

    // --- Start the server ---
    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    info!("started server on {}", listener.local_addr()?);
    let served = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await;

    // Unload unconditionally, also when serving failed.
    host.stop().await;
    drop(host);
    if tokio::time::timeout(Duration::from_secs(5), gallery)
        .await
        .is_err()
    {
        warn!("gallery did not finish saving before exit");
    }

    served.context("server loop failed")
}
