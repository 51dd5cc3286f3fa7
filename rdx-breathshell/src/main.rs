use anyhow::Result;
use breathclock::config::BreathConfig;
use breathclock::prelude::*;
use breathclock::scheduler::SchedulerStats;
use breathclock::{ENGINE_NAME, VERSION as LIB_VERSION};
use clap::Parser;
use colored::Colorize;
use rustyline::highlight::Highlighter;
use rustyline::Editor;
use rustyline_derive::{Completer, Helper, Hinter, Validator};
use std::borrow::Cow;
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::info;
use tracing_subscriber::EnvFilter;

const SHELL_VERSION: &str = env!("CARGO_PKG_VERSION");

const LOGO: &str = r"
   ___                 __  __       __         __
  / _ )_______ ___ _  / /_/ /  ____/ /__  ____/ /__
 / _  / __/ -_) _ `/ / __/ _ \/ __/ / _ \/ __/  '_/
/____/_/  \__/\_,_/  \__/_//_/\__/_/\___/\__/_/\_\
";

const WATCH_OFF: u8 = 0;
const WATCH_CHANGES: u8 = 1;
const WATCH_ALL: u8 = 2;

/// A custom helper struct for rustyline that enables syntax highlighting.
#[derive(Completer, Helper, Hinter, Validator)]
struct ShellHighlighter;

impl Highlighter for ShellHighlighter {
    fn highlight<'l>(&self, line: &'l str, _pos: usize) -> Cow<'l, str> {
        if let Some((command, rest)) = line.split_once(' ') {
            Cow::Owned(format!("{} {}", command.yellow().bold(), rest.yellow()))
        } else {
            Cow::Owned(line.yellow().bold().to_string())
        }
    }
    fn highlight_char(&self, _line: &str, _pos: usize, _forced: bool) -> bool {
        true
    }
}

fn print_banner() {
    if env::var("QUIET_MODE").is_ok() {
        return;
    }
    println!("{}", LOGO.cyan());
    let rule = "-".repeat(60);
    println!("{}", rule.dimmed());
    println!(
        "          Shell   v{:<8} Library   v{:<8}",
        SHELL_VERSION, LIB_VERSION
    );
    println!(
        "{}",
        "    Distributed under the MIT OR Apache-2.0 license.".dimmed()
    );
    println!("{}", rule.dimmed());
}

/// Prints stream events while watching is on.
async fn spawn_event_listener(engine: &BreathEngine, mode: Arc<AtomicU8>) -> Result<()> {
    let mut subscription = engine.broadcaster().subscribe().await?;
    tokio::spawn(async move {
        while let Some(event) = subscription.next().await {
            let show = match mode.load(Ordering::Relaxed) {
                WATCH_ALL => true,
                WATCH_CHANGES => !matches!(event.kind, EventKind::Heartbeat | EventKind::Keepalive),
                _ => false,
            };
            if show {
                println!("<-- [{}] {}", event.kind.to_string().green(), event.payload);
            }
        }
    });
    Ok(())
}

/// A scheduler running inside the shell against the shell's own stream.
struct SchedulerHandle {
    shutdown: broadcast::Sender<()>,
    report: watch::Receiver<SchedulerReport>,
    task: JoinHandle<()>,
}

fn start_scheduler(config: &BreathConfig, stream_url: String) -> Result<SchedulerHandle> {
    let registry = ActionRegistry::from_config(&config.scheduler, &config.phase_table()?)?;
    let mut scheduler = Scheduler::new(registry, ScriptRunner::new(), &config.scheduler);
    let report = scheduler.watch();
    let client = StreamClient::with_url(stream_url, config.scheduler.reconnect_delay());
    let (shutdown, shutdown_rx) = broadcast::channel(1);
    let task = tokio::spawn(async move { client.run(&mut scheduler, shutdown_rx).await });
    Ok(SchedulerHandle {
        shutdown,
        report,
        task,
    })
}

fn print_report(report: &SchedulerReport) {
    let SchedulerStats {
        dispatched,
        skipped_by_memo,
        failed,
        throttled,
    } = report.stats;
    println!(
        "--> Scheduler {}: dispatched {}, skipped by memo {}, failed {}, throttled {}",
        report.state.to_string().cyan(),
        dispatched,
        skipped_by_memo,
        failed,
        throttled
    );
}

fn parse_flag(arg: Option<&&str>) -> Option<bool> {
    match arg.copied() {
        Some("on" | "true" | "1") => Some(true),
        Some("off" | "false" | "0") => Some(false),
        _ => None,
    }
}

fn print_view(snapshot: &Snapshot) {
    let view = StateView::from(snapshot);
    println!(
        "--> phase {} ({:.1}%), usage {:.2}, climate {}",
        view.phase.cyan(),
        view.phase_progress * 100.0,
        view.usage,
        view.climate
    );
}

/// Interactive operator shell for the Breathclock engine
#[derive(Parser, Debug)]
#[command(name = "breathshell")]
#[command(version, about, long_about = None)]
struct Args {
    /// TOML config file layered over the defaults
    #[arg(short, long, env = "BREATH_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    print_banner();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let config = BreathConfig::load(args.config.as_deref())?;
    let engine = BreathEngine::new(config)?;

    let listener = engine.bind().await?;
    let stream_url = format!("http://{}/stream", listener.local_addr()?);
    info!("Serving {} at {}", ENGINE_NAME.cyan(), stream_url);
    {
        let engine = engine.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.serve(listener).await {
                eprintln!("\nServer stopped with an error: {}", e);
            }
        });
    }

    let watch_mode = Arc::new(AtomicU8::new(WATCH_OFF));
    spawn_event_listener(&engine, watch_mode.clone()).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut scheduler: Option<SchedulerHandle> = None;

    let mut rl = Editor::new()?;
    rl.set_helper(Some(ShellHighlighter));

    println!("{} is running. Type 'help' for commands or 'exit' to quit.", ENGINE_NAME.cyan());

    loop {
        let prompt = format!("{}", ">> ".cyan().bold());
        let line = match rl.readline(&prompt) {
            Ok(line) => line,
            Err(_) => {
                println!("Exiting breathshell...");
                break;
            }
        };
        rl.add_history_entry(line.as_str())?;
        let args = line.split_whitespace().collect::<Vec<_>>();
        let Some(command) = args.first() else {
            continue;
        };
        let tracker = engine.tracker();

        match *command {
            "state" => print_view(&tracker.snapshot().await?),
            "usage" => match args.get(1).map(|s| s.parse::<f64>()) {
                Some(Ok(x)) => println!("--> usage is now {:.2}", tracker.set_usage(x).await?),
                _ => println!("Usage: usage <NUMBER>"),
            },
            "climate" => match args.get(1) {
                Some(value) => {
                    let climate = tracker.set_climate(*value).await?;
                    if climate.as_str() == *value {
                        println!("--> climate is now {}", climate);
                    } else {
                        println!("--> '{}' rejected, climate stays {}", value, climate);
                    }
                }
                None => println!("Usage: climate <clear|suspicious|restricted>"),
            },
            "drift" => match parse_flag(args.get(1)) {
                Some(flag) => {
                    tracker.mark_drift(flag).await?;
                    println!("--> drift flag set to {}", flag);
                }
                None => println!("Usage: drift <on|off>"),
            },
            "caesura" => match parse_flag(args.get(1)) {
                Some(flag) => {
                    tracker.mark_caesura(flag).await?;
                    println!("--> caesura flag set to {}", flag);
                }
                None => println!("Usage: caesura <on|off>"),
            },
            "reset" => {
                let snapshot = tracker.reset().await?;
                println!("--> Cycle restarted.");
                print_view(&snapshot);
            }
            "status" => {
                let status = engine.broadcaster().status().await?;
                println!("{}", serde_json::to_string_pretty(&status)?);
            }
            "inject" => match (args.get(1), args.get(2)) {
                (Some(event), Some(_)) => {
                    let raw = args[2..].join(" ");
                    match serde_json::from_str(&raw) {
                        Ok(data) => {
                            let count = engine
                                .broadcaster()
                                .relay(ExternalEnvelope::now(*event, data))
                                .await?;
                            println!("--> Relayed '{}' to {} listener(s).", event, count);
                        }
                        Err(e) => println!("Error: data is not valid JSON: {}", e),
                    }
                }
                _ => println!("Usage: inject <EVENT> <JSON>"),
            },
            "test" => {
                let data = serde_json::json!({ "message": "breathclock test event" });
                let count = engine
                    .broadcaster()
                    .relay(ExternalEnvelope::now("smoke_test", data))
                    .await?;
                println!("--> Test event sent to {} listener(s).", count);
            }
            "watch" => match args.get(1).copied() {
                Some("all") => {
                    watch_mode.store(WATCH_ALL, Ordering::Relaxed);
                    println!("--> Printing every stream event.");
                }
                Some("off") => {
                    watch_mode.store(WATCH_OFF, Ordering::Relaxed);
                    println!("--> Stopped printing stream events.");
                }
                _ => {
                    watch_mode.store(WATCH_CHANGES, Ordering::Relaxed);
                    println!("--> Printing change events (try 'watch all' or 'watch off').");
                }
            },
            "scheduler" => match args.get(1).copied() {
                Some("start") if scheduler.is_some() => println!("--> Scheduler already running."),
                Some("start") => match start_scheduler(engine.config(), stream_url.clone()) {
                    Ok(handle) => {
                        scheduler = Some(handle);
                        println!("--> Scheduler started against {}", stream_url);
                    }
                    Err(e) => println!("Error: {}", e),
                },
                Some("stop") => match scheduler.take() {
                    Some(handle) => {
                        handle.shutdown.send(()).ok();
                        handle.task.await.ok();
                        print_report(&handle.report.borrow());
                    }
                    None => println!("--> Scheduler is not running."),
                },
                _ => match &scheduler {
                    Some(handle) => print_report(&handle.report.borrow()),
                    None => println!("--> Scheduler is not running. Try 'scheduler start'."),
                },
            },
            "help" => {
                println!("Available commands:");
                println!("  state                 - Shows phase, progress, usage and climate.");
                println!("  usage <X>             - Sets usage (clamped to [0, 1]).");
                println!("  climate <V>           - Sets climate: clear, suspicious or restricted.");
                println!("  drift <on|off>        - Sets the drift flag.");
                println!("  caesura <on|off>      - Sets the caesura flag.");
                println!("  reset                 - Restarts the cycle from now.");
                println!("  status                - Shows broadcaster status.");
                println!("  inject <E> <JSON>     - Relays an external event.");
                println!("  test                  - Sends a smoke-test event.");
                println!("  watch [all|off]       - Prints stream events.");
                println!("  scheduler [start|stop] - Runs rituals in-process, or shows counters.");
                println!("  exit                  - Quits the shell.");
            }
            "exit" => break,
            _ => println!("Unknown command: '{}'. Type 'help'.", line),
        }
    }

    if let Some(handle) = scheduler.take() {
        handle.shutdown.send(()).ok();
        handle.task.await.ok();
    }
    engine.shutdown();
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
    fn config_flag_is_read() {
        let args = Args::try_parse_from(["breathshell", "--config", "shell.toml"]).unwrap();
        assert_eq!(args.config, Some(PathBuf::from("shell.toml")));
    }
}
