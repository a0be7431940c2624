use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use omnibase_zenoh_runtime::config::RuntimeConfig;

/// Four-wheel holonomic base runtime
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// TOML config file; built-in defaults when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Force the simulated actuator
    #[arg(long)]
    sim: bool,

    /// Motor bridge serial port, overrides the config
    #[arg(short, long)]
    port: Option<String>,
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match RuntimeConfig::load(path) {
            Ok(config) => {
                info!("Loaded config from {}", path.display());
                config
            }
            Err(e) => {
                eprintln!("Config error: {}", e);
                std::process::exit(1);
            }
        },
        None => RuntimeConfig::default(),
    };
    if let Some(port) = args.port {
        config.motor.port = Some(port);
    }

    if let Err(e) = omnibase_zenoh_runtime::runtime::run(config, args.sim).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}
