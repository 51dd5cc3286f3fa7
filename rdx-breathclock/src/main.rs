use anyhow::Result;
use breathclock::{ENGINE_NAME, VERSION};
use breathclock::config::BreathConfig;
use breathclock::prelude::*;
use clap::Parser;
use colored::Colorize;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Breathclock engine daemon
#[derive(Parser, Debug)]
#[command(name = "breathd")]
#[command(version, about, long_about = None)]
struct Args {
    /// TOML config file layered over the defaults
    #[arg(short, long, env = "BREATH_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Initialize structured logging. RUST_LOG overrides the default level.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    // 2. Load defaults, the optional TOML file and BREATH__* overrides.
    let config = BreathConfig::load(args.config.as_deref())?;
    info!(bind = %config.server.bind, config = ?args.config, "Configuration loaded");
    println!(
        "{} v{} on {}",
        ENGINE_NAME.cyan().bold(),
        VERSION,
        config.server.bind.as_str().yellow()
    );

    // 3. Start the tracker and broadcaster and serve until Ctrl+C.
    let engine = BreathEngine::new(config)?;
    engine.run().await?;

    Ok(())
}
