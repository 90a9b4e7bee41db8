//! camrelay
//!
//! Restreams camera pages as multipart HTTP streams.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::{error, info};

use camrelay::capture::backend_from_config;
use camrelay::config::Config;
use camrelay::logging::init_logging;
use camrelay::placeholder::Placeholders;
use camrelay::supervisor::{Relay, SupervisorError, EXIT_ADDR_IN_USE};

fn main() -> Result<()> {
    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return Ok(());
    }

    let config_path = match args.iter().position(|a| a == "--config" || a == "-c") {
        Some(index) => Some(
            args.get(index + 1)
                .map(PathBuf::from)
                .context("--config needs a path")?,
        ),
        None => None,
    };

    let guard = init_logging()?;
    info!("camrelay {} starting...", env!("CARGO_PKG_VERSION"));

    let config = Config::load(config_path)?;
    info!("Configuration loaded from {:?}", config.config_path());

    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(run(config));
    drop(runtime);

    match result {
        Ok(()) => Ok(()),
        Err(e) => match e.downcast_ref::<SupervisorError>() {
            Some(SupervisorError::AddrInUse { .. }) => {
                error!("{}", e);
                eprintln!("camrelay: {e}");
                drop(guard);
                std::process::exit(EXIT_ADDR_IN_USE);
            }
            _ => Err(e),
        },
    }
}

async fn run(config: Config) -> Result<()> {
    let backend = backend_from_config(&config.render).context("Failed to set up render backend")?;
    let placeholders = Placeholders::load(&config.placeholders).await;

    let bound = Relay::new(config, backend, placeholders).bind().await?;
    let running = bound.start();
    info!("Serving on http://{}", running.local_addr());

    let shutdown = running.shutdown_token();
    ctrlc::set_handler(move || {
        info!("Ctrl+C received, shutting down...");
        shutdown.cancel();
    })?;

    running.wait().await;
    Ok(())
}

fn print_help() {
    println!("camrelay - restream rendered camera pages over HTTP");
    println!();
    println!("USAGE:");
    println!("    camrelay [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help             Print this help message");
    println!("    -c, --config <PATH>    Configuration file (default: platform config dir)");
    println!();
    println!("ENVIRONMENT:");
    println!("    CAMRELAY_CONFIG        Configuration file, if --config is not given");
    println!("    CAMRELAY_LOG_PATH      Log directory");
    println!("    RUST_LOG               Set log level (e.g., debug, info, warn)");
}
