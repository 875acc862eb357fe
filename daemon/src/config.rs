//! Daemon configuration.

use crate::error::{Error, Result};
use crate::launcher::WorkerDefaults;
use crate::supervisor::SupervisorSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default path for the control socket
pub const DEFAULT_CONTROL_SOCKET: &str = "/run/activd/control.sock";

/// Default directory for the journal
pub const DEFAULT_STATE_DIR: &str = "/var/lib/activd";

/// Default directory for worker sockets
pub const DEFAULT_RUNTIME_DIR: &str = "/run/activd/workers";

/// Name of the bundled worker binary
pub const WORKER_BINARY: &str = "activd-worker";

/// Daemon configuration, usually loaded from a TOML file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Control socket path
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    /// Directory holding the snapshot and delta files
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Directory workers bind their sockets in
    #[serde(default = "default_runtime_dir")]
    pub runtime_dir: PathBuf,
    /// Deltas written between snapshots
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval: usize,
    /// How long to wait for a worker to check in
    #[serde(default = "default_group_start_timeout")]
    #[serde(with = "duration_ms")]
    pub group_start_timeout: Duration,
    /// Upper bound on groups starting at once
    #[serde(default = "default_max_concurrent_starts")]
    pub max_concurrent_starts: usize,
    /// Worker program for groups without a command override
    #[serde(default)]
    pub worker_program: Option<PathBuf>,
    /// Options passed verbatim to every worker
    #[serde(default)]
    pub worker_options: Vec<String>,
    /// Log every group and object transition
    #[serde(default)]
    pub monitor: bool,
    /// Kill workers that miss the start timeout
    #[serde(default)]
    pub kill_on_start_timeout: bool,
    /// Time between SIGTERM and SIGKILL when stopping a worker
    #[serde(default = "default_shutdown_grace")]
    #[serde(with = "duration_ms")]
    pub shutdown_grace: Duration,
}

fn default_socket_path() -> PathBuf {
    PathBuf::from(DEFAULT_CONTROL_SOCKET)
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(DEFAULT_STATE_DIR)
}

fn default_runtime_dir() -> PathBuf {
    PathBuf::from(DEFAULT_RUNTIME_DIR)
}

fn default_snapshot_interval() -> usize {
    200
}

fn default_group_start_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_max_concurrent_starts() -> usize {
    3
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(5)
}

/// Durations as whole milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            state_dir: default_state_dir(),
            runtime_dir: default_runtime_dir(),
            snapshot_interval: default_snapshot_interval(),
            group_start_timeout: default_group_start_timeout(),
            max_concurrent_starts: default_max_concurrent_starts(),
            worker_program: None,
            worker_options: Vec::new(),
            monitor: false,
            kill_on_start_timeout: false,
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: DaemonConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the daemon cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.snapshot_interval == 0 {
            return Err(Error::Config("snapshot_interval must be at least 1".to_string()));
        }
        if self.max_concurrent_starts == 0 {
            return Err(Error::Config(
                "max_concurrent_starts must be at least 1".to_string(),
            ));
        }
        if self.group_start_timeout.is_zero() {
            return Err(Error::Config("group_start_timeout must be positive".to_string()));
        }
        Ok(())
    }

    /// Worker program, defaulting to `activd-worker` next to the running binary.
    pub fn worker_program(&self) -> PathBuf {
        if let Some(program) = &self.worker_program {
            return program.clone();
        }
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(WORKER_BINARY)))
            .unwrap_or_else(|| PathBuf::from(WORKER_BINARY))
    }

    pub fn worker_defaults(&self) -> WorkerDefaults {
        WorkerDefaults {
            program: self.worker_program(),
            options: self.worker_options.clone(),
            control_socket: self.socket_path.clone(),
            runtime_dir: self.runtime_dir.clone(),
        }
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            start_timeout: self.group_start_timeout,
            max_concurrent_starts: self.max_concurrent_starts,
            kill_on_start_timeout: self.kill_on_start_timeout,
        }
    }
}
