//! ddnssd binary entry point.

use clap::Parser;
use ddnssd::{telemetry, Config};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// DNS-SD record publisher for local containers.
#[derive(Parser, Debug)]
#[command(name = "ddnssd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML).
    #[arg(short, long, default_value = "ddnssd.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration; the file is optional so an env-only deployment
    // (DDNSSD_* variables) works.
    let config: Config = config::Config::builder()
        .add_source(config::File::from(args.config.clone()).required(false))
        .add_source(
            config::Environment::with_prefix("DDNSSD")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()?;

    // Initialize telemetry
    telemetry::init(&config.telemetry).map_err(|e| e as Box<dyn std::error::Error>)?;

    info!(
        config_file = %args.config.display(),
        base_domain = %config.daemon.base_domain,
        hostname = %config.daemon.hostname,
        docker_host = %config.daemon.docker_host,
        backends = config.backends.len(),
        "Starting ddnssd"
    );

    // Setup graceful shutdown
    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    let result = ddnssd::run(config, shutdown).await;

    if let Err(e) = result {
        error!("ddnssd error: {}", e);
        return Err(e.into());
    }

    info!("ddnssd shutdown complete");
    Ok(())
}

/// Cancel the token on SIGTERM or SIGINT.
async fn watch_signals(shutdown: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to install SIGTERM handler: {}", e);
            return;
        }
    };
    let mut int = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to install SIGINT handler: {}", e);
            return;
        }
    };

    tokio::select! {
        _ = term.recv() => info!("received SIGTERM"),
        _ = int.recv() => info!("received SIGINT"),
    }
    shutdown.cancel();
}
