use breathclock::config::{ActionConfig, BreathConfig, Crossing, TriggerKind, TriggerValue};
use breathclock::error::ActionError;
use breathclock::events::StreamEvent;
use breathclock::scheduler::{
    ActionDescriptor, ActionEnv, ActionOutcome, ActionRegistry, ActionRunner, ConnectionState,
    Scheduler, SchedulerReport, StreamClient,
};
use breathclock::state::{Climate, PhaseTable, Snapshot};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Clone, Default)]
struct RecordingRunner {
    calls: Arc<Mutex<Vec<String>>>,
}

impl ActionRunner for RecordingRunner {
    async fn run(
        &self,
        action: &ActionDescriptor,
        _env: &ActionEnv,
    ) -> Result<ActionOutcome, ActionError> {
        self.calls.lock().unwrap().push(action.action_id.clone());
        Ok(ActionOutcome {
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
            elapsed: Duration::ZERO,
        })
    }
}

fn scheduler(dir: &std::path::Path, runner: RecordingRunner) -> Scheduler<RecordingRunner> {
    let mut config = BreathConfig::default().scheduler;
    config.script_dir = dir.to_path_buf();
    for (id, trigger, value) in [
        ("cool_down", TriggerKind::Usage, TriggerValue::Number(0.30)),
        ("lantern", TriggerKind::Phase, TriggerValue::Text("exhale".into())),
    ] {
        std::fs::write(dir.join(format!("{id}.sh")), "#!/bin/sh\n").unwrap();
        config.actions.push(ActionConfig {
            id: id.to_string(),
            trigger,
            value,
            script: PathBuf::from(format!("{id}.sh")),
            timeout_secs: None,
            direction: Crossing::Both,
        });
    }
    let registry = ActionRegistry::from_config(&config, &PhaseTable::default()).unwrap();
    Scheduler::new(registry, runner, &config)
}

fn snapshot(phase: &str, usage: f64) -> Snapshot {
    Snapshot {
        phase: phase.to_string(),
        phase_progress: 0.5,
        usage,
        climate: Climate::Clear,
        drift: false,
        caesura: false,
        epoch: Utc::now(),
    }
}

fn stream_body() -> String {
    [
        StreamEvent::heartbeat(&snapshot("hold", 0.25)).to_frame(),
        "event: heartbeat\ndata: {broken\n\n".to_string(),
        ": a comment frame\n\n".to_string(),
        StreamEvent::usage_update(&snapshot("hold", 0.42), 0.25).to_frame(),
        StreamEvent::heartbeat(&snapshot("hold", 0.42)).to_frame(),
        StreamEvent::heartbeat(&snapshot("exhale", 0.42)).to_frame(),
        StreamEvent::phase_update(&snapshot("exhale", 0.42), "hold").to_frame(),
    ]
    .concat()
}

async fn wait_for(
    rx: &mut watch::Receiver<SchedulerReport>,
    done: impl Fn(&SchedulerReport) -> bool,
) -> SchedulerReport {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let report = *rx.borrow_and_update();
            if done(&report) {
                return report;
            }
            rx.changed().await.unwrap();
        }
    })
    .await
    .expect("scheduler did not reach the expected state")
}

#[tokio::test]
async fn memo_prevents_double_dispatch_across_paths_and_reconnects() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/stream"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(stream_body()),
        )
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let runner = RecordingRunner::default();
    let mut scheduler = scheduler(dir.path(), runner.clone());
    let mut reports = scheduler.watch();
    let client = StreamClient::with_url(format!("{}/stream", server.uri()), Duration::from_millis(50));
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let task = tokio::spawn(async move {
        client.run(&mut scheduler, shutdown_rx).await;
        scheduler.report()
    });

    // The first connection dispatches twice and hits the memo once. Every
    // later replay of the same frames only hits the memo.
    let report = wait_for(&mut reports, |r| r.stats.skipped_by_memo >= 5).await;
    assert_eq!(report.stats.dispatched, 2);
    assert_eq!(report.stats.failed, 0);

    shutdown_tx.send(()).unwrap();
    let report = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.state, ConnectionState::Disconnected);
    assert_eq!(*runner.calls.lock().unwrap(), vec!["cool_down", "lantern"]);
    assert!(server.received_requests().await.unwrap().len() >= 2);
}

#[tokio::test]
async fn unreachable_stream_is_retried_until_shutdown() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}/stream", listener.local_addr().unwrap());
    drop(listener);

    let dir = tempfile::tempdir().unwrap();
    let mut scheduler = scheduler(dir.path(), RecordingRunner::default());
    let client = StreamClient::with_url(url, Duration::from_millis(20));
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let task = tokio::spawn(async move {
        client.run(&mut scheduler, shutdown_rx).await;
        scheduler.report()
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!task.is_finished());
    shutdown_tx.send(()).unwrap();

    let report = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.state, ConnectionState::Disconnected);
    assert_eq!(report.stats.dispatched, 0);
}
