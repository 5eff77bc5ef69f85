//! Spanline collector
//!
//! Run with: cargo run -- --config spanline.yaml
//!
//! Environment variables:
//! - SPANLINE_CONFIG: Configuration file, when `--config` is not given (default: spanline.yaml)
//! - RUST_LOG: Log filter, overrides `service.telemetry.logs.level`
//!
//! Any `${VAR}` or `${VAR:-default}` in the configuration file is replaced
//! from the environment before parsing, which is how sink addresses are
//! supplied.

use spanline::pipeline::{Config, Service};
use spanline::telemetry::init_logging;

const DEFAULT_CONFIG: &str = "spanline.yaml";

fn config_path(args: &[String]) -> Result<String, String> {
    match args {
        [] => Ok(std::env::var("SPANLINE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG.to_string())),
        [flag, path] if flag == "--config" => Ok(path.clone()),
        [arg] if arg.starts_with("--config=") => Ok(arg["--config=".len()..].to_string()),
        _ => Err(format!("usage: spanline [--config <path>], got {:?}", args)),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
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
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let path = config_path(&args)?;
    let config = Config::load(&path)?;
    init_logging(&config.service.telemetry.logs)?;

    tracing::info!("Spanline configuration:");
    tracing::info!("  Config file: {}", path);
    tracing::info!("  Receivers: {}", config.receivers.len());
    tracing::info!("  Exporters: {}", config.exporters.len());
    tracing::info!("  Pipelines: {}", config.service.pipelines.len());

    let service = Service::start(&config).await?;
    for listener in service.listeners() {
        tracing::info!(
            "  {} ({}) listening on {}",
            listener.component,
            listener.protocol,
            listener.addr
        );
    }

    shutdown_signal().await;
    service.shutdown().await;
    Ok(())
}
