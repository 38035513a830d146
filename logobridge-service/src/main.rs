//! Runs the logobridge engine from a JSON configuration file

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use logobridge::config::Config;
use logobridge::engine::Engine;
use logobridge::error::{ConfigError, StartError};
use logobridge::memory::MemoryController;
use logobridge::transport::mqtt::MqttTransportFactory;

#[derive(Debug, thiserror::Error)]
enum Error {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("unable to start: {0}")]
    Start(#[from] StartError),
    #[error("unable to wait for shutdown signal: {0}")]
    Signal(#[from] std::io::Error),
}

#[derive(Parser)]
#[command(name = "logobridge-service")]
#[command(about = "Bridges the local variable memory of LOGO! controllers to an MQTT broker")]
#[command(version)]
struct Cli {
    #[arg(short = 'c', long, default_value = "config.json", help = "path of the JSON configuration file")]
    config: PathBuf,

    #[arg(short = 'l', long, default_value = "info", help = "log level used when RUST_LOG is not set")]
    log_level: String,

    #[arg(long, help = "use an in-memory controller instead of connecting to the configured controllers")]
    simulate: bool,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_str()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if let Err(err) = run(cli).await {
        tracing::error!("{}", err);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Error> {
    tracing::info!("reading configuration from {}", cli.config.display());
    let config = Config::from_file(&cli.config)?;
    config.validate()?;

    let transports = MqttTransportFactory::default();
    let engine = if cli.simulate {
        tracing::warn!("simulating controllers in memory");
        Engine::start_with(&config, |_, _| MemoryController::new(), &transports)?
    } else {
        Engine::start(&config, &transports)?
    };

    tracing::info!("running, press Ctrl-C to stop");
    let result = tokio::signal::ctrl_c().await;

    tracing::info!("stopping");
    engine.stop().await;
    result?;
    Ok(())
}
