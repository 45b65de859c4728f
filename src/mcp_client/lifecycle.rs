//! Server process lifecycle management.
//!
//! Spawns stdio server processes, verifies they survive their startup grace
//! period, keeps their stderr drained into the log, and terminates them on
//! shutdown (SIGTERM, bounded wait, then kill).

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use super::config::{ServerConfig, ServerTransport};
use super::errors::McpError;

/// Maximum stderr captured into a startup failure message.
const STDERR_CAPTURE_LIMIT: usize = 2000;

/// How long to wait for a dead process's stderr to drain.
const STDERR_READ_TIMEOUT: Duration = Duration::from_millis(500);

// ─── ManagedProcess ──────────────────────────────────────────────────────────

/// The pipe halves handed to the stdio transport.
pub struct StdioPipes {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

/// A running stdio server process.
pub struct ManagedProcess {
    name: String,
    child: Child,
}

impl ManagedProcess {
    /// Check if the process is still running.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Terminate, wait up to `timeout`, then kill.
    pub async fn shutdown(&mut self, timeout: Duration) {
        if !self.is_alive() {
            return;
        }

        if !send_terminate(&mut self.child) {
            tracing::debug!(server = %self.name, "terminate signal not delivered");
        }

        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(server = %self.name, %status, "server process exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(server = %self.name, error = %e, "failed to reap server process");
            }
            Err(_) => {
                tracing::warn!(
                    server = %self.name,
                    timeout_ms = timeout.as_millis() as u64,
                    "server ignored terminate, killing"
                );
                if let Err(e) = self.child.kill().await {
                    tracing::warn!(server = %self.name, error = %e, "failed to kill server process");
                }
            }
        }
    }
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match child.id() {
        Some(pid) => kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok(),
        None => false,
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) -> bool {
    child.start_kill().is_ok()
}

// ─── Spawning ────────────────────────────────────────────────────────────────

/// Spawn a stdio server and confirm it survives `startup_grace`.
///
/// A process that exits during the grace period is reported as
/// `SpawnFailed` with its captured stderr. The returned process is killed if
/// dropped without an explicit shutdown.
pub async fn spawn_process(
    config: &ServerConfig,
    startup_grace: Duration,
) -> Result<(ManagedProcess, StdioPipes), McpError> {
    let name = config.name.as_str();
    let ServerTransport::Stdio {
        command,
        args,
        env,
        cwd,
    } = &config.transport
    else {
        return Err(McpError::config(format!(
            "server '{name}' is not a stdio server"
        )));
    };

    let mut cmd = Command::new(command);
    cmd.args(args);
    for (key, value) in env {
        cmd.env(key, value);
    }
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    #[cfg(target_os = "windows")]
    {
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
        name: name.to_string(),
        reason: format!("'{command}': {e}"),
    })?;

    let stdin = child.stdin.take().ok_or_else(|| McpError::SpawnFailed {
        name: name.to_string(),
        reason: "failed to capture stdin".into(),
    })?;
    let stdout = child.stdout.take().ok_or_else(|| McpError::SpawnFailed {
        name: name.to_string(),
        reason: "failed to capture stdout".into(),
    })?;
    let stderr = child.stderr.take();

    tokio::time::sleep(startup_grace).await;

    match child.try_wait() {
        Ok(None) => {}
        Ok(Some(status)) => {
            let stderr_ctx = read_stderr_on_failure(stderr).await;
            if !stderr_ctx.is_empty() {
                tracing::warn!(server = name, stderr = %stderr_ctx, "server stderr captured on failure");
            }
            return Err(McpError::SpawnFailed {
                name: name.to_string(),
                reason: format!(
                    "exited during startup ({status}){}",
                    format_stderr_suffix(&stderr_ctx)
                ),
            });
        }
        Err(e) => {
            return Err(McpError::SpawnFailed {
                name: name.to_string(),
                reason: format!("failed to poll process: {e}"),
            });
        }
    }

    if let Some(stderr) = stderr {
        drain_stderr(name.to_string(), stderr);
    }

    tracing::info!(server = name, pid = ?child.id(), command = %command, "started MCP server process");

    Ok((
        ManagedProcess {
            name: name.to_string(),
            child,
        },
        StdioPipes { stdin, stdout },
    ))
}

/// Forward a running server's stderr into the log so the pipe never fills.
fn drain_stderr(server: String, stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(server = %server, line = %line, "server stderr");
        }
    });
}

/// Read whatever a failed process left on stderr, truncated.
async fn read_stderr_on_failure(stderr: Option<ChildStderr>) -> String {
    let Some(mut stderr) = stderr else {
        return String::new();
    };

    let mut buf = String::new();
    match tokio::time::timeout(STDERR_READ_TIMEOUT, stderr.read_to_string(&mut buf)).await {
        Ok(Ok(_)) => {
            if buf.len() > STDERR_CAPTURE_LIMIT {
                let mut cut = STDERR_CAPTURE_LIMIT;
                while !buf.is_char_boundary(cut) {
                    cut -= 1;
                }
                buf.truncate(cut);
                buf.push_str("...(truncated)");
            }
            buf
        }
        _ => String::new(),
    }
}

fn format_stderr_suffix(stderr: &str) -> String {
    if stderr.trim().is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", stderr.trim())
    }
}

// ─── ProcessSupervisor ───────────────────────────────────────────────────────

/// Tracks every stdio server process this client started.
pub struct ProcessSupervisor {
    processes: Mutex<HashMap<String, ManagedProcess>>,
    startup_grace: Duration,
    shutdown_timeout: Duration,
}

impl ProcessSupervisor {
    pub fn new(startup_grace: Duration, shutdown_timeout: Duration) -> Self {
        Self {
            processes: Mutex::new(HashMap::new()),
            startup_grace,
            shutdown_timeout,
        }
    }

    /// Start `config`'s process, replacing any previous one for that server.
    pub async fn spawn(&self, config: &ServerConfig) -> Result<StdioPipes, McpError> {
        let previous = self.processes.lock().await.remove(&config.name);
        if let Some(mut old) = previous {
            old.shutdown(self.shutdown_timeout).await;
        }

        let (process, pipes) = spawn_process(config, self.startup_grace).await?;
        self.processes
            .lock()
            .await
            .insert(config.name.clone(), process);
        Ok(pipes)
    }

    /// Whether a tracked process for `name` is still running.
    pub async fn is_alive(&self, name: &str) -> bool {
        self.processes
            .lock()
            .await
            .get_mut(name)
            .is_some_and(ManagedProcess::is_alive)
    }

    /// Names of servers with a tracked, running process.
    pub async fn running(&self) -> Vec<String> {
        let mut processes = self.processes.lock().await;
        let mut names: Vec<String> = processes
            .iter_mut()
            .filter_map(|(name, p)| p.is_alive().then(|| name.clone()))
            .collect();
        names.sort();
        names
    }

    /// Stop one server's process.
    pub async fn shutdown(&self, name: &str) {
        let process = self.processes.lock().await.remove(name);
        if let Some(mut process) = process {
            process.shutdown(self.shutdown_timeout).await;
        }
    }

    /// Stop every tracked process.
    pub async fn shutdown_all(&self) {
        let processes: Vec<ManagedProcess> =
            self.processes.lock().await.drain().map(|(_, p)| p).collect();

        let timeout = self.shutdown_timeout;
        futures::future::join_all(processes.into_iter().map(|mut p| async move {
            p.shutdown(timeout).await;
        }))
        .await;
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
