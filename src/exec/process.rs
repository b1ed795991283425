//! Supervised child processes
//!
//! A supervised process runs in its own task. The caller gets a handle that
//! reports state changes through a watch channel and can cancel the child.
//! Unexpected exits are restarted in place until the failure threshold is
//! crossed inside the failure window; then the exit is reported as fatal.

use crate::core::errors::ConvoyError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// What to run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    /// Redirect stdout to this file; otherwise lines go to the log at debug level
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
}

impl ProcessSpec {
    pub fn new(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
            stdout: None,
            stderr: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs(mut self, env: BTreeMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn stdout(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout = Some(path.into());
        self
    }

    pub fn stderr(mut self, path: impl Into<PathBuf>) -> Self {
        self.stderr = Some(path.into());
        self
    }

    async fn command(&self) -> std::io::Result<Command> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        match &self.stdout {
            Some(path) => cmd.stdout(Stdio::from(log_file(path).await?)),
            None => cmd.stdout(Stdio::piped()),
        };
        match &self.stderr {
            Some(path) => cmd.stderr(Stdio::from(log_file(path).await?)),
            None => cmd.stderr(Stdio::piped()),
        };
        Ok(cmd)
    }
}

/// Truncated output file, parent directories created as needed
async fn log_file(path: &Path) -> std::io::Result<std::fs::File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(tokio::fs::File::create(path).await?.into_std().await)
}

/// Deadline and failure escalation for one supervised process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisionPolicy {
    /// Kill and report `TimedOut` if the child has not succeeded by then
    pub deadline: Option<Duration>,
    /// Unexpected exits inside `failure_window` that make the failure fatal
    pub max_failures: u32,
    pub failure_window: Duration,
    pub restart_delay: Duration,
}

impl Default for SupervisionPolicy {
    fn default() -> Self {
        Self {
            deadline: None,
            max_failures: 1,
            failure_window: Duration::from_secs(60),
            restart_delay: Duration::from_millis(100),
        }
    }
}

impl SupervisionPolicy {
    /// Run once, fail on the first unexpected exit
    pub fn once() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_failures(mut self, max_failures: u32, window: Duration) -> Self {
        self.max_failures = max_failures.max(1);
        self.failure_window = window;
        self
    }

    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }
}

/// Final outcome of a supervised process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExitStatus {
    Succeeded,
    Failed { code: Option<i32>, failures: u32 },
    TimedOut,
    Cancelled,
    SpawnFailed { message: String },
}

impl ExitStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// Error describing a non-successful exit of `process`
    pub fn to_error(&self, process: &str) -> Option<ConvoyError> {
        match self {
            Self::Succeeded => None,
            other => Some(ConvoyError::process_failure(process, other.to_string())),
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed { code: Some(code), failures } => {
                write!(f, "exited with code {} ({} failures)", code, failures)
            }
            Self::Failed { code: None, failures } => {
                write!(f, "terminated by signal ({} failures)", failures)
            }
            Self::TimedOut => write!(f, "timed out"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::SpawnFailed { message } => write!(f, "failed to spawn: {}", message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    Starting,
    Running { pid: Option<u32>, restarts: u32 },
    Exited(ExitStatus),
}

/// Handle to a supervised process. Clones observe and control the same child.
#[derive(Clone)]
pub struct ProcessHandle {
    name: String,
    state_rx: watch::Receiver<ProcessState>,
    cancel_tx: Arc<watch::Sender<bool>>,
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("name", &self.name)
            .field("state", &*self.state_rx.borrow())
            .finish()
    }
}

impl ProcessHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ProcessState {
        self.state_rx.borrow().clone()
    }

    pub fn is_finished(&self) -> bool {
        matches!(*self.state_rx.borrow(), ProcessState::Exited(_))
    }

    /// Resolves once the child is spawned (or never could be)
    pub async fn started(&self) -> ProcessState {
        let mut rx = self.state_rx.clone();
        let result = rx
            .wait_for(|s| !matches!(s, ProcessState::Starting))
            .await
            .map(|state| state.clone());
        match result {
            Ok(state) => state,
            Err(_) => rx.borrow().clone(),
        }
    }

    /// Resolves with the final exit status
    pub async fn on_exit(&self) -> ExitStatus {
        let mut rx = self.state_rx.clone();
        let result = rx
            .wait_for(|s| matches!(s, ProcessState::Exited(_)))
            .await
            .map(|state| state.clone());
        match result {
            Ok(ProcessState::Exited(status)) => status,
            _ => ExitStatus::Failed { code: None, failures: 0 },
        }
    }

    /// Cooperative cancellation: the child is killed and `Cancelled` reported
    pub fn kill(&self) {
        self.cancel_tx.send_replace(true);
    }
}

/// Launches supervised children
pub struct SupervisedProcess;

impl SupervisedProcess {
    /// Start `spec` under `policy`; returns immediately
    pub fn launch(spec: ProcessSpec, policy: SupervisionPolicy) -> ProcessHandle {
        let (state_tx, state_rx) = watch::channel(ProcessState::Starting);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let name = spec.name.clone();
        tokio::spawn(supervise(spec, policy, state_tx, cancel_rx));
        ProcessHandle {
            name,
            state_rx,
            cancel_tx: Arc::new(cancel_tx),
        }
    }
}

enum Wake {
    Exited(std::io::Result<std::process::ExitStatus>),
    Deadline,
    Cancelled,
}

async fn supervise(
    spec: ProcessSpec,
    policy: SupervisionPolicy,
    state_tx: watch::Sender<ProcessState>,
    mut cancel_rx: watch::Receiver<bool>,
) {
    let deadline_at = policy.deadline.map(|d| Instant::now() + d);
    let mut failures: VecDeque<Instant> = VecDeque::new();
    let mut restarts = 0u32;

    loop {
        if *cancel_rx.borrow() {
            state_tx.send_replace(ProcessState::Exited(ExitStatus::Cancelled));
            return;
        }

        let mut child = match spawn(&spec).await {
            Ok(child) => child,
            Err(e) => {
                warn!(process = %spec.name, error = %e, "Failed to spawn process");
                state_tx.send_replace(ProcessState::Exited(ExitStatus::SpawnFailed {
                    message: e.to_string(),
                }));
                return;
            }
        };
        let pid = child.id();
        info!(process = %spec.name, pid = ?pid, restarts, "Process started");
        state_tx.send_replace(ProcessState::Running { pid, restarts });

        let wake = tokio::select! {
            status = child.wait() => Wake::Exited(status),
            _ = deadline_elapsed(deadline_at) => Wake::Deadline,
            _ = cancelled(&mut cancel_rx) => Wake::Cancelled,
        };

        let status = match wake {
            Wake::Deadline => {
                warn!(process = %spec.name, "Process exceeded its deadline, killing");
                let _ = child.kill().await;
                ExitStatus::TimedOut
            }
            Wake::Cancelled => {
                info!(process = %spec.name, "Process cancelled, killing");
                let _ = child.kill().await;
                ExitStatus::Cancelled
            }
            Wake::Exited(Ok(status)) if status.success() => {
                info!(process = %spec.name, "Process completed");
                ExitStatus::Succeeded
            }
            Wake::Exited(result) => {
                let code = result.as_ref().ok().and_then(|s| s.code());
                let now = Instant::now();
                while failures
                    .front()
                    .map(|t| now.duration_since(*t) > policy.failure_window)
                    .unwrap_or(false)
                {
                    failures.pop_front();
                }
                failures.push_back(now);
                let count = failures.len() as u32;
                if count >= policy.max_failures {
                    warn!(process = %spec.name, code = ?code, failures = count, "Process failed");
                    ExitStatus::Failed { code, failures: count }
                } else {
                    warn!(
                        process = %spec.name,
                        code = ?code,
                        failures = count,
                        threshold = policy.max_failures,
                        "Process exited unexpectedly, restarting"
                    );
                    restarts += 1;
                    let resumed = tokio::select! {
                        _ = tokio::time::sleep(policy.restart_delay) => None,
                        _ = deadline_elapsed(deadline_at) => Some(ExitStatus::TimedOut),
                        _ = cancelled(&mut cancel_rx) => Some(ExitStatus::Cancelled),
                    };
                    match resumed {
                        None => continue,
                        Some(status) => status,
                    }
                }
            }
        };

        state_tx.send_replace(ProcessState::Exited(status));
        return;
    }
}

async fn spawn(spec: &ProcessSpec) -> std::io::Result<Child> {
    let mut child = spec.command().await?.spawn()?;
    if let Some(out) = child.stdout.take() {
        forward_lines(spec.name.clone(), "stdout", out);
    }
    if let Some(err) = child.stderr.take() {
        forward_lines(spec.name.clone(), "stderr", err);
    }
    Ok(child)
}

fn forward_lines<R>(process: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(process = %process, stream, "{}", line);
        }
    });
}

async fn deadline_elapsed(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => futures::future::pending::<()>().await,
    }
}

/// Completes when cancellation is requested; never completes if the handle is gone
pub(crate) async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            futures::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(name: &str, script: &str) -> ProcessSpec {
        ProcessSpec::new(name, "sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn test_success_reported() {
        let handle = SupervisedProcess::launch(sh("ok", "exit 0"), SupervisionPolicy::once());
        assert_eq!(handle.on_exit().await, ExitStatus::Succeeded);
        assert!(handle.is_finished());
    }

    #[tokio::test]
    async fn test_failure_threshold_restarts_then_fails() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("runs");
        let script = format!("echo x >> {}; exit 3", counter.display());
        let policy = SupervisionPolicy::once()
            .with_failures(3, Duration::from_secs(30))
            .with_restart_delay(Duration::from_millis(10));

        let handle = SupervisedProcess::launch(sh("flaky", &script), policy);
        assert_eq!(
            handle.on_exit().await,
            ExitStatus::Failed { code: Some(3), failures: 3 }
        );
        let runs = std::fs::read_to_string(&counter).unwrap();
        assert_eq!(runs.lines().count(), 3);
    }

    #[tokio::test]
    async fn test_deadline_kills_process() {
        let policy = SupervisionPolicy::once().with_deadline(Duration::from_millis(200));
        let started = std::time::Instant::now();
        let handle = SupervisedProcess::launch(sh("slow", "sleep 30"), policy);
        assert_eq!(handle.on_exit().await, ExitStatus::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_kill_cancels() {
        let handle = SupervisedProcess::launch(sh("daemon", "sleep 30"), SupervisionPolicy::once());
        assert!(matches!(handle.started().await, ProcessState::Running { .. }));
        handle.kill();
        assert_eq!(handle.on_exit().await, ExitStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_output_redirected_into_new_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("slot").join("logs");
        let spec = sh("chatty", "echo out; echo err >&2")
            .stdout(logs.join("out.txt"))
            .stderr(logs.join("err.txt"));

        let handle = SupervisedProcess::launch(spec, SupervisionPolicy::once());
        assert_eq!(handle.on_exit().await, ExitStatus::Succeeded);
        assert_eq!(std::fs::read_to_string(logs.join("out.txt")).unwrap(), "out\n");
        assert_eq!(std::fs::read_to_string(logs.join("err.txt")).unwrap(), "err\n");
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let spec = ProcessSpec::new("missing", "/nonexistent/definitely-not-here");
        let handle = SupervisedProcess::launch(spec, SupervisionPolicy::once());
        assert!(matches!(handle.on_exit().await, ExitStatus::SpawnFailed { .. }));
    }
}
