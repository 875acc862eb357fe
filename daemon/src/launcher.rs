//! Worker process launching.
//!
//! Assembling a command line ([`LaunchSpec`]) is kept apart from spawning it
//! ([`WorkerLauncher`]) so each can be tested on its own.

use crate::descriptor::GroupDescriptor;
use crate::error::{Error, Result};
use crate::id::GroupId;
use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Environment variable carrying the daemon's control socket path.
pub const ENV_CONTROL_SOCKET: &str = "ACTIVD_CONTROL_SOCKET";

/// Environment variable carrying the directory for worker sockets.
pub const ENV_RUNTIME_DIR: &str = "ACTIVD_RUNTIME_DIR";

/// Daemon-wide settings every worker launch starts from.
#[derive(Debug, Clone)]
pub struct WorkerDefaults {
    /// Worker program used when a group has no command override
    pub program: PathBuf,
    /// Pass-through options given to every worker
    pub options: Vec<String>,
    /// Socket workers report back on
    pub control_socket: PathBuf,
    /// Directory workers bind their own sockets in
    pub runtime_dir: PathBuf,
}

/// A fully assembled worker command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl LaunchSpec {
    /// Build the command line for a group.
    ///
    /// The group's command override replaces the program; its options follow
    /// the global pass-through options and its environment is applied last.
    pub fn for_group(defaults: &WorkerDefaults, descriptor: &GroupDescriptor) -> Self {
        let override_env = descriptor.command_environment.as_ref();

        let program = override_env
            .and_then(|env| env.command.clone())
            .unwrap_or_else(|| defaults.program.clone());

        let mut args = defaults.options.clone();
        if let Some(env) = override_env {
            args.extend(env.options.iter().cloned());
        }

        let mut env = BTreeMap::new();
        env.insert(
            ENV_CONTROL_SOCKET.to_string(),
            defaults.control_socket.display().to_string(),
        );
        env.insert(
            ENV_RUNTIME_DIR.to_string(),
            defaults.runtime_dir.display().to_string(),
        );
        if let Some(override_env) = override_env {
            env.extend(override_env.environment.clone());
        }

        Self { program, args, env }
    }
}

/// Startup data written to a fresh worker's stdin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handoff {
    pub group_id: GroupId,
    pub descriptor: GroupDescriptor,
    pub incarnation: u64,
}

impl Handoff {
    /// Write the three handoff values, one JSON document per line, and flush.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> std::io::Result<()> {
        for line in [
            serde_json::to_string(&self.group_id)?,
            serde_json::to_string(&self.descriptor)?,
            serde_json::to_string(&self.incarnation)?,
        ] {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
        }
        writer.flush().await
    }

    /// Read the handoff as written by [`Handoff::write_to`].
    pub async fn read_from<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            group_id: read_json_line(reader).await?,
            descriptor: read_json_line(reader).await?,
            incarnation: read_json_line(reader).await?,
        })
    }
}

async fn read_json_line<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncBufRead + Unpin,
    T: serde::de::DeserializeOwned,
{
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Err(Error::Other("handoff ended early".to_string()));
    }
    Ok(serde_json::from_str(line.trim())?)
}

/// Exit status of a worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitStatus {
    /// Process ID
    pub pid: Option<u32>,
    /// Exit code (if exited normally)
    pub code: Option<i32>,
    /// Signal (if killed by signal)
    pub signal: Option<i32>,
}

impl ExitStatus {
    /// Check if the process exited successfully.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Handle on a spawned worker.
///
/// Dropping the handle detaches from the process without killing it.
#[derive(Debug)]
pub struct WorkerProcess {
    pid: Option<u32>,
    kill: Option<oneshot::Sender<()>>,
    exit: Option<oneshot::Receiver<ExitStatus>>,
}

impl WorkerProcess {
    /// Wrap a process whose reaper listens on `kill` and reports on `exit`.
    pub fn new(
        pid: Option<u32>,
        kill: oneshot::Sender<()>,
        exit: oneshot::Receiver<ExitStatus>,
    ) -> Self {
        Self {
            pid,
            kill: Some(kill),
            exit: Some(exit),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Ask the process to terminate. Returns false if it was already asked
    /// or has already been reaped.
    pub fn kill(&mut self) -> bool {
        let Some(kill) = self.kill.take() else {
            return false;
        };

        // Signal right away so a daemon exiting next still stops the worker
        if let Some(pid) = self.pid {
            if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!(pid = pid, error = %e, "SIGTERM failed");
            }
        }
        kill.send(()).is_ok()
    }

    /// Take the exit notification. Only the first caller gets it.
    pub fn take_exit(&mut self) -> Option<oneshot::Receiver<ExitStatus>> {
        self.exit.take()
    }
}

/// Spawns worker processes.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Spawn a worker for `spec` and hand it `handoff` on stdin.
    async fn launch(&self, spec: &LaunchSpec, handoff: &Handoff) -> Result<WorkerProcess>;
}

/// Launches workers as OS processes.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    /// Time between SIGTERM and SIGKILL
    grace: Duration,
}

impl ProcessLauncher {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }
}

impl Default for ProcessLauncher {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, spec: &LaunchSpec, handoff: &Handoff) -> Result<WorkerProcess> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::ProcessSpawnFailed(format!("{}: {}", spec.program.display(), e)))?;
        let pid = child.id();
        let group = handoff.group_id;

        info!(group = %group, pid = ?pid, program = %spec.program.display(), "Spawned worker");

        // Keep the pipes drained so the worker never blocks on output
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, group, pid, false));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, group, pid, true));
        }

        let written = match child.stdin.take() {
            Some(mut stdin) => handoff.write_to(&mut stdin).await,
            None => Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "worker stdin unavailable",
            )),
        };
        if let Err(e) = written {
            let _ = child.kill().await;
            return Err(Error::ProcessSpawnFailed(format!(
                "{}: handoff failed: {}",
                spec.program.display(),
                e
            )));
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(reap(child, pid, self.grace, kill_rx, exit_tx));

        Ok(WorkerProcess::new(pid, kill_tx, exit_rx))
    }
}

/// Forward a worker's output stream into the log.
async fn forward_output<R: AsyncRead + Unpin>(stream: R, group: GroupId, pid: Option<u32>, stderr: bool) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if stderr => warn!(group = %group, pid = ?pid, "{}", line),
            Ok(Some(line)) => info!(group = %group, pid = ?pid, "{}", line),
            Ok(None) => break,
            Err(e) => {
                debug!(group = %group, error = %e, "Worker output stream failed");
                break;
            }
        }
    }
}

/// Own the child until it exits, escalating to SIGKILL when asked to stop.
async fn reap(
    mut child: Child,
    pid: Option<u32>,
    grace: Duration,
    mut kill_rx: oneshot::Receiver<()>,
    exit_tx: oneshot::Sender<ExitStatus>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        Ok(()) = &mut kill_rx => {
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    warn!(pid = ?pid, "Worker didn't exit in time, sending SIGKILL");
                    let _ = child.start_kill();
                    child.wait().await
                }
            }
        }
    };

    let status = match status {
        Ok(status) => to_exit_status(pid, status),
        Err(e) => {
            warn!(pid = ?pid, error = %e, "Failed to wait for worker");
            ExitStatus {
                pid,
                code: None,
                signal: None,
            }
        }
    };

    debug!(pid = ?pid, code = ?status.code, signal = ?status.signal, "Worker exited");
    let _ = exit_tx.send(status);
}

fn to_exit_status(pid: Option<u32>, status: std::process::ExitStatus) -> ExitStatus {
    use std::os::unix::process::ExitStatusExt;

    ExitStatus {
        pid,
        code: status.code(),
        signal: status.signal(),
    }
}
