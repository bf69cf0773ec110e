//! Command and container executors: spawn a child process, pump its output, enforce a
//! timeout, and report the exit code.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use uworker_core::WorkerError;

const CALLBACK_INTERVAL: Duration = Duration::from_secs(60);

/// A handle to the task the output callback spawned for one emission. Mid-stream emissions
/// let this run in the background; the final emission of a run is awaited by the caller so
/// that a terminal status report never races ahead of the last `update_output`.
pub type EmitHandle = tokio::task::JoinHandle<()>;

/// Result of a completed `execute` call.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionOutcome {
    pub exit_code: i32,
    pub processing_time: Duration,
}

struct OutputState {
    buffer: String,
    last_emitted: Option<String>,
    last_emit_at: Instant,
}

impl OutputState {
    fn new() -> Self {
        Self {
            buffer: String::new(),
            last_emitted: None,
            last_emit_at: Instant::now() - CALLBACK_INTERVAL,
        }
    }

    fn append(&mut self, stream: &str, line: &str) {
        self.buffer
            .push_str(&format!("{} - {}: {}\n", Utc::now().to_rfc3339(), stream, line));
    }

    fn maybe_emit(&mut self, callback: &(dyn Fn(String) -> EmitHandle + Send + Sync)) {
        if self.last_emit_at.elapsed() < CALLBACK_INTERVAL {
            return;
        }
        if self.last_emitted.as_deref() == Some(self.buffer.as_str()) {
            return;
        }
        let _ = callback(self.buffer.clone());
        self.last_emitted = Some(self.buffer.clone());
        self.last_emit_at = Instant::now();
    }

    fn force_emit(&mut self, callback: &(dyn Fn(String) -> EmitHandle + Send + Sync)) -> EmitHandle {
        let handle = callback(self.buffer.clone());
        self.last_emitted = Some(self.buffer.clone());
        self.last_emit_at = Instant::now();
        handle
    }
}

/// Spawns a child process from a fixed base command plus per-call arguments, pumping its
/// combined stdout/stderr to a caller-supplied callback.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    process_name: String,
    base_cmd: Vec<String>,
}

impl CommandExecutor {
    pub fn new(process_name: impl Into<String>, base_cmd: Vec<String>) -> Self {
        Self {
            process_name: process_name.into(),
            base_cmd,
        }
    }

    /// Tokenize a whitespace-separated command string, the shape the coordinator hands out
    /// via `UWORKER_JOB_CMD`.
    pub fn from_command_line(process_name: impl Into<String>, cmd: &str) -> Self {
        Self::new(process_name, cmd.split_whitespace().map(str::to_string).collect())
    }

    pub async fn execute(
        &self,
        args: &[String],
        output_callback: impl Fn(String) -> EmitHandle + Send + Sync + 'static,
        timeout: Option<u64>,
        kill_after: u64,
        in_docker: bool,
    ) -> Result<ExecutionOutcome, WorkerError> {
        let mut cmd_argv = self.base_cmd.clone();
        cmd_argv.extend(args.iter().cloned());

        if let Some(secs) = timeout {
            if secs == 0 {
                return Err(WorkerError::InvalidArgument(format!(
                    "timeout must be a positive integer, timeout={secs}"
                )));
            }
            let mut wrapped = vec![
                "timeout".to_string(),
                format!("--kill-after={kill_after}"),
                secs.to_string(),
            ];
            wrapped.extend(cmd_argv);
            cmd_argv = wrapped;
        }

        let start = Instant::now();
        let mut child = Command::new(&cmd_argv[0])
            .args(&cmd_argv[1..])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| {
                WorkerError::Executor(format!("failed to spawn {}: {err}", self.process_name))
            })?;

        tracing::info!(
            process = %self.process_name,
            pid = child.id(),
            argv = ?cmd_argv,
            "process started"
        );

        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let state = Arc::new(Mutex::new(OutputState::new()));
        let callback: Arc<dyn Fn(String) -> EmitHandle + Send + Sync> = Arc::new(output_callback);
        let process_name = self.process_name.clone();

        let stdout_task = tokio::spawn(pump_stream(
            stdout,
            "STDOUT",
            state.clone(),
            callback.clone(),
            process_name.clone(),
        ));
        let stderr_task = tokio::spawn(pump_stream(
            stderr,
            "STDERR",
            state.clone(),
            callback.clone(),
            process_name.clone(),
        ));

        let status = child.wait().await.map_err(|err| {
            WorkerError::Executor(format!("failed to wait on {}: {err}", self.process_name))
        })?;
        let pid = child.id();

        let _ = stdout_task.await;
        let _ = stderr_task.await;

        if in_docker {
            if let Some(pid) = pid {
                reap_orphans(pid).await;
            }
        }

        let exit_code = status.code().unwrap_or(match status_signal(&status) {
            Some(sig) => 128 + sig,
            None => -1,
        });
        let killed = timeout.is_some() && matches!(exit_code, 124 | 137);

        let mut guard = state.lock();
        if killed {
            let msg = format!(
                "Killed {} process after timeout of {} seconds",
                self.process_name,
                timeout.unwrap()
            );
            guard.append("EXECUTOR", &msg);
            tracing::warn!(process = %self.process_name, "{}", msg);
        }
        let exit_msg = format!("{} process exited with code {}", self.process_name, exit_code);
        guard.append("EXECUTOR", &exit_msg);
        if exit_code == 0 {
            tracing::info!(process = %self.process_name, "{}", exit_msg);
        } else {
            tracing::warn!(process = %self.process_name, "{}", exit_msg);
        }
        let final_emit = guard.force_emit(callback.as_ref());
        drop(guard);

        // The terminal status report must never be posted before this last output post lands,
        // so unlike the throttled mid-stream emits above, this one is awaited rather than
        // left to run in the background.
        if let Err(err) = final_emit.await {
            tracing::warn!(process = %self.process_name, error = %err, "final output callback task panicked");
        }

        Ok(ExecutionOutcome {
            exit_code,
            processing_time: start.elapsed(),
        })
    }
}

#[cfg(unix)]
fn status_signal(status: &std::process::ExitStatus) -> Option<i32> {
    std::os::unix::process::ExitStatusExt::signal(status)
}

#[cfg(not(unix))]
fn status_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

async fn pump_stream(
    stream: impl tokio::io::AsyncRead + Unpin,
    stream_name: &'static str,
    state: Arc<Mutex<OutputState>>,
    callback: Arc<dyn Fn(String) -> EmitHandle + Send + Sync>,
    process_name: String,
) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                {
                    let mut guard = state.lock();
                    guard.append(stream_name, &line);
                    guard.maybe_emit(callback.as_ref());
                }
                if !line.trim().is_empty() {
                    tracing::info!(process = %process_name, stream = stream_name, "{}", line.trim());
                }
            }
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(process = %process_name, stream = stream_name, error = %err, "read error");
                break;
            }
        }
    }
}

/// Reap orphaned descendants left behind because the agent is PID 1 in its container and the
/// kernel never assigns them a new reaper. Ignores ECHILD/ESRCH (nothing left to reap).
async fn reap_orphans(child_pid: u32) {
    tokio::task::spawn_blocking(move || {
        use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
        use nix::unistd::Pid;

        loop {
            match waitpid(None, Some(WaitPidFlag::empty())) {
                Ok(WaitStatus::Exited(pid, code)) => {
                    tracing::info!(pid = pid.as_raw(), code, "reaped child");
                    if pid == Pid::from_raw(child_pid as i32) {
                        break;
                    }
                }
                Ok(WaitStatus::Signaled(pid, sig, _)) => {
                    tracing::info!(pid = pid.as_raw(), ?sig, "reaped signaled child");
                    if pid == Pid::from_raw(child_pid as i32) {
                        break;
                    }
                }
                Ok(_) => continue,
                Err(nix::errno::Errno::ECHILD) | Err(nix::errno::Errno::ESRCH) => break,
                Err(err) => {
                    tracing::warn!(error = %err, "waitpid failed while reaping orphans");
                    break;
                }
            }
        }
    })
    .await
    .ok();
}

/// Specialization of [`CommandExecutor`] that ensures an image is present before running it.
pub struct ContainerExecutor {
    inner: CommandExecutor,
    image_url: String,
    runtime_cli: String,
}

impl ContainerExecutor {
    pub fn new(
        process_name: impl Into<String>,
        runtime_cli: impl Into<String>,
        image_url: impl Into<String>,
        environment: &std::collections::HashMap<String, String>,
        auto_remove: bool,
        network: Option<&str>,
    ) -> Self {
        let runtime_cli = runtime_cli.into();
        let image_url = image_url.into();

        let mut cmd = vec![runtime_cli.clone(), "run".to_string(), "-i".to_string()];
        if auto_remove {
            cmd.push("--rm".to_string());
        }
        if let Some(network) = network {
            cmd.push(format!("--network={network}"));
        }
        for (k, v) in environment {
            cmd.push("-e".to_string());
            cmd.push(format!("\"{k}={v}\""));
        }
        cmd.push(image_url.clone());

        Self {
            inner: CommandExecutor::new(process_name, cmd),
            image_url,
            runtime_cli,
        }
    }

    pub async fn execute(
        &self,
        args: &[String],
        output_callback: impl Fn(String) -> EmitHandle + Send + Sync + 'static,
        timeout: Option<u64>,
        kill_after: u64,
    ) -> Result<ExecutionOutcome, WorkerError> {
        let callback: Arc<dyn Fn(String) -> EmitHandle + Send + Sync> = Arc::new(output_callback);
        let pull_code = self.pull_image(callback.clone()).await?;
        if pull_code != 0 {
            return Ok(ExecutionOutcome {
                exit_code: pull_code,
                processing_time: Duration::ZERO,
            });
        }
        self.inner
            .execute(args, move |text| callback(text), timeout, kill_after, false)
            .await
    }

    async fn pull_image(
        &self,
        callback: Arc<dyn Fn(String) -> EmitHandle + Send + Sync>,
    ) -> Result<i32, WorkerError> {
        if self.image_exists(callback.clone()).await? {
            return Ok(0);
        }
        let puller = CommandExecutor::new(
            "Pull image",
            vec![self.runtime_cli.clone(), "pull".to_string()],
        );
        let outcome = puller
            .execute(
                &[self.image_url.clone()],
                move |text| callback(text),
                None,
                5,
                false,
            )
            .await?;
        Ok(outcome.exit_code)
    }

    async fn image_exists(
        &self,
        _callback: Arc<dyn Fn(String) -> EmitHandle + Send + Sync>,
    ) -> Result<bool, WorkerError> {
        let checker = CommandExecutor::new(
            "Image exists",
            vec![self.runtime_cli.clone(), "images".to_string(), "-q".to_string()],
        );
        let found = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let found_writer = found.clone();
        let outcome = checker
            .execute(
                &[self.image_url.clone()],
                move |text| {
                    let present = text
                        .lines()
                        .filter(|line| !line.contains("EXECUTOR"))
                        .any(|line| !line.trim().is_empty());
                    if present {
                        found_writer.store(true, std::sync::atomic::Ordering::SeqCst);
                    }
                    tokio::spawn(async {})
                },
                None,
                5,
                false,
            )
            .await?;
        if outcome.exit_code != 0 {
            return Err(WorkerError::Executor(format!(
                "could not check if image {} exists, exit code: {}",
                self.image_url, outcome.exit_code
            )));
        }
        Ok(found.load(std::sync::atomic::Ordering::SeqCst))
    }
}
