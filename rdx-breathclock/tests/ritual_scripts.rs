#![cfg(unix)]

use breathclock::config::{ActionConfig, BreathConfig, Crossing, TriggerKind, TriggerValue};
use breathclock::events::StreamEvent;
use breathclock::scheduler::{ActionRegistry, Scheduler, ScriptRunner};
use breathclock::state::{Climate, PhaseTable, Snapshot};
use chrono::Utc;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

fn write_script(dir: &Path, name: &str, body: &str) {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

fn action(id: &str, trigger: TriggerKind, value: &str, timeout_secs: Option<u64>) -> ActionConfig {
    ActionConfig {
        id: id.to_string(),
        trigger,
        value: TriggerValue::Text(value.to_string()),
        script: PathBuf::from(format!("{id}.sh")),
        timeout_secs,
        direction: Crossing::Both,
    }
}

fn heartbeat(phase: &str, climate: Climate) -> StreamEvent {
    StreamEvent::heartbeat(&Snapshot {
        phase: phase.to_string(),
        phase_progress: 0.2,
        usage: 0.5,
        climate,
        drift: false,
        caesura: false,
        epoch: Utc::now(),
    })
}

fn scheduler(dir: &Path) -> Scheduler<ScriptRunner> {
    write_script(dir, "stall.sh", "exec sleep 10");
    write_script(dir, "shutters.sh", r#"echo "$PHASE|$CLIMATE|$USAGE|$TRIGGER" > shutters.out"#);

    let mut config = BreathConfig::default().scheduler;
    config.script_dir = dir.to_path_buf();
    config.actions = vec![
        action("stall", TriggerKind::Phase, "exhale", Some(1)),
        action("shutters", TriggerKind::Climate, "restricted", None),
    ];
    let registry = ActionRegistry::from_config(&config, &PhaseTable::default()).unwrap();
    Scheduler::new(registry, ScriptRunner::new(), &config)
}

#[tokio::test]
async fn timed_out_action_is_killed_and_the_next_frame_proceeds() {
    let dir = tempfile::tempdir().unwrap();
    let mut scheduler = scheduler(dir.path());

    let started = Instant::now();
    scheduler.handle_event(&heartbeat("exhale", Climate::Clear)).await;
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(scheduler.report().stats.failed, 1);
    assert_eq!(scheduler.report().stats.dispatched, 0);

    scheduler.handle_event(&heartbeat("exhale", Climate::Restricted)).await;
    assert_eq!(scheduler.report().stats.dispatched, 1);
    let out = std::fs::read_to_string(dir.path().join("shutters.out")).unwrap();
    assert_eq!(out.trim(), "exhale|restricted|0.5|climate");
}

#[tokio::test]
async fn archival_action_appends_to_the_archive_log() {
    let dir = tempfile::tempdir().unwrap();
    let mut scheduler = scheduler(dir.path());

    scheduler.handle_event(&heartbeat("return", Climate::Clear)).await;
    assert_eq!(scheduler.report().stats.dispatched, 1);

    let log = std::fs::read_to_string(dir.path().join("archive.log")).unwrap();
    let line: serde_json::Value = serde_json::from_str(log.lines().next().unwrap()).unwrap();
    assert_eq!(line["phase"], "return");
    assert_eq!(line["climate"], "clear");
    assert_eq!(line["context"]["phase"], "return");
}
