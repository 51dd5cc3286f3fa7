//! `breath-scheduler`: consumes a running `breathd` stream and dispatches
//! rituals.

use anyhow::{Context, Result};
use breathclock::config::BreathConfig;
use breathclock::scheduler::{ActionRegistry, Scheduler, ScriptRunner, StreamClient};
use clap::Parser;
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Ritual scheduler for a running breathd stream
#[derive(Parser, Debug)]
#[command(name = "breath-scheduler")]
#[command(version, about, long_about = None)]
struct Args {
    /// TOML config file layered over the defaults
    #[arg(short, long, env = "BREATH_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let config = BreathConfig::load(args.config.as_deref())?;
    let table = config.phase_table()?;
    let registry = ActionRegistry::from_config(&config.scheduler, &table)
        .context("action registry is invalid")?;

    let mut scheduler = Scheduler::new(registry, ScriptRunner::new(), &config.scheduler);
    let client = StreamClient::new(&config.scheduler);
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    let mut task = tokio::spawn(async move {
        client.run(&mut scheduler, shutdown_rx).await;
        scheduler.report()
    });

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Shutdown signal received");
            shutdown_tx.send(()).ok();
        }
        joined = &mut task => {
            // The client only returns after shutdown, so this is a panic.
            joined?;
            return Ok(());
        }
    }

    let report = task.await?;
    info!(
        dispatched = report.stats.dispatched,
        skipped_by_memo = report.stats.skipped_by_memo,
        failed = report.stats.failed,
        throttled = report.stats.throttled,
        "Scheduler stopped"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn args_are_well_formed() {
        Args::command().debug_assert();
    }

    #[test]
    fn config_flag_takes_long_and_short_forms() {
        let args = Args::try_parse_from(["breath-scheduler", "--config", "a.toml"]).unwrap();
        assert_eq!(args.config, Some(PathBuf::from("a.toml")));
        let args = Args::try_parse_from(["breath-scheduler", "-c", "b.toml"]).unwrap();
        assert_eq!(args.config, Some(PathBuf::from("b.toml")));
    }
}
