//! perpx execution bot - entry point.

use anyhow::Result;
use clap::Parser;
use tracing::info;

/// Leveraged-position execution engine
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via PERPX_CONFIG env var)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    perpx_telemetry::init_logging()?;

    info!("Starting perpx-bot v{}", env!("CARGO_PKG_VERSION"));

    // CLI arg > PERPX_CONFIG env var > default
    let config_path = args
        .config
        .or_else(|| std::env::var("PERPX_CONFIG").ok())
        .unwrap_or_else(|| "config/default.toml".to_string());

    info!(config_path = %config_path, "Loading configuration");
    let config = perpx_bot::AppConfig::from_file(&config_path)?;
    info!(
        chain_id = config.chain.expected_chain_id,
        rpc_url = %config.chain.rpc_url,
        "Configuration loaded"
    );

    let app = perpx_bot::Application::new(config)?;

    info!("Running preflight validation...");
    app.run_preflight().await?;
    app.recover()?;

    app.run().await?;

    Ok(())
}
