//! Runs ritual scripts as child processes.

use crate::config::TriggerKind;
use crate::error::ActionError;
use crate::scheduler::registry::ActionDescriptor;
use serde_json::Value;
use std::future::Future;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::time;
use tracing::{debug, warn};

const MAX_CAPTURE_BYTES: usize = 64 * 1024;
const ERROR_TAIL_BYTES: usize = 2 * 1024;
const REAP_GRACE: Duration = Duration::from_secs(2);

/// What a script is told about the transition that started it.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionEnv {
    pub phase: String,
    pub climate: String,
    pub usage: f64,
    pub trigger: TriggerKind,
    pub context: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionOutcome {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl ActionOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Turns a non-zero exit into an error carrying the tail of stderr.
    pub fn check(self) -> Result<Self, ActionError> {
        if self.success() {
            Ok(self)
        } else {
            Err(ActionError::NonZeroExit {
                code: self.exit_code,
                stderr: tail(&self.stderr, ERROR_TAIL_BYTES).to_string(),
            })
        }
    }
}

/// The last `max` bytes of `s`, cut on a char boundary.
fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

/// Executes one action. The scheduler is generic over this so tests can
/// record dispatches instead of spawning processes.
pub trait ActionRunner: Send + Sync {
    fn run(
        &self,
        action: &ActionDescriptor,
        env: &ActionEnv,
    ) -> impl Future<Output = Result<ActionOutcome, ActionError>> + Send;
}

/// Kills the child's whole process group on drop unless disarmed, so a
/// cancelled or timed-out action leaves nothing running behind it.
struct ProcessGroupGuard {
    child: Child,
    armed: bool,
}

impl ProcessGroupGuard {
    fn new(child: Child) -> Self {
        Self { child, armed: true }
    }

    /// Sends SIGKILL to the group and reaps the leader.
    async fn kill(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;
        kill_group(&mut self.child);
        if let Err(e) = self.child.wait().await {
            debug!(%e, "Reaping killed action failed");
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if self.armed {
            kill_group(&mut self.child);
            let _ = self.child.try_wait();
        }
    }
}

#[cfg(unix)]
fn kill_group(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: plain syscall on a pid we spawned as a session leader.
        let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
        if rc == 0 {
            return;
        }
    }
    let _ = child.start_kill();
}

#[cfg(not(unix))]
fn kill_group(child: &mut Child) {
    let _ = child.start_kill();
}

/// Starts the child as the leader of a new session so its descendants share
/// one process group. On Linux the child also dies with this process.
#[cfg(unix)]
fn set_new_session(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    // SAFETY: only async-signal-safe calls run between fork and exec.
    unsafe {
        cmd.as_std_mut().pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            #[cfg(target_os = "linux")]
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn set_new_session(_cmd: &mut Command) {}

/// Spawns the action's script directly, with the transition in its
/// environment and a hard timeout.
#[derive(Debug, Clone, Default)]
pub struct ScriptRunner;

impl ScriptRunner {
    pub fn new() -> Self {
        Self
    }
}

impl ActionRunner for ScriptRunner {
    async fn run(
        &self,
        action: &ActionDescriptor,
        env: &ActionEnv,
    ) -> Result<ActionOutcome, ActionError> {
        let started = Instant::now();
        // The child runs in the script's directory, so a relative path must
        // be anchored first.
        let program = std::env::current_dir()
            .map(|cwd| cwd.join(&action.script))
            .unwrap_or_else(|_| action.script.clone());
        let mut cmd = Command::new(&program);
        cmd.env("PHASE", &env.phase)
            .env("CLIMATE", &env.climate)
            .env("USAGE", env.usage.to_string())
            .env("TRIGGER", env.trigger.as_str())
            .env("CONTEXT", env.context.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = action.script.parent().filter(|d| !d.as_os_str().is_empty()) {
            cmd.current_dir(dir);
        }
        set_new_session(&mut cmd);

        let mut child = cmd.spawn().map_err(|source| ActionError::Spawn {
            path: action.script.clone(),
            source,
        })?;
        let stdout = child.stdout.take().map(|s| tokio::spawn(read_limited(s)));
        let stderr = child.stderr.take().map(|s| tokio::spawn(read_limited(s)));
        let mut guard = ProcessGroupGuard::new(child);

        let status = match time::timeout(action.timeout, guard.child.wait()).await {
            Ok(status) => {
                guard.disarm();
                status.map_err(ActionError::Wait)?
            }
            Err(_) => {
                guard.kill().await;
                let stderr = join_output(stderr).await;
                warn!(
                    action = %action.action_id,
                    timeout = ?action.timeout,
                    stderr = %tail(&stderr, ERROR_TAIL_BYTES),
                    "Action timed out, process group killed"
                );
                return Err(ActionError::Timeout(action.timeout));
            }
        };

        let stdout = join_output(stdout).await;
        let stderr = join_output(stderr).await;
        Ok(ActionOutcome {
            exit_code: status.code(),
            stdout,
            stderr,
            elapsed: started.elapsed(),
        })
    }
}

async fn read_limited<R: AsyncRead + Unpin>(reader: R) -> Vec<u8> {
    let mut buf = Vec::new();
    let _ = reader
        .take(MAX_CAPTURE_BYTES as u64)
        .read_to_end(&mut buf)
        .await;
    buf
}

async fn join_output(task: Option<tokio::task::JoinHandle<Vec<u8>>>) -> String {
    let Some(task) = task else {
        return String::new();
    };
    match time::timeout(REAP_GRACE, task).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).trim_end().to_string(),
        _ => String::new(),
    }
}
