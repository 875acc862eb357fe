//! Worker process supervision.
//!
//! The supervisor starts one worker per group on demand and blocks the
//! caller until the worker checks in (or the start timeout passes). Every
//! start bumps the group's incarnation; check-ins and exits carrying an older
//! incarnation are ignored.

use crate::descriptor::{GroupDescriptor, GroupState};
use crate::error::{Error, Result};
use crate::id::GroupId;
use crate::instantiator::Instantiator;
use crate::launcher::{ExitStatus, Handoff, LaunchSpec, WorkerDefaults, WorkerLauncher, WorkerProcess};
use crate::registry::GroupInfo;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, error, info, warn};

/// Tunables for worker starts.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// How long `ensure_active` waits for a worker to check in
    pub start_timeout: Duration,
    /// Upper bound on workers starting at the same time
    pub max_concurrent_starts: usize,
    /// Kill a worker that missed its start timeout instead of leaving it running
    pub kill_on_start_timeout: bool,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(60),
            max_concurrent_starts: 3,
            kill_on_start_timeout: false,
        }
    }
}

/// A worker process went away.
#[derive(Debug, Clone)]
pub struct ExitEvent {
    pub group_id: GroupId,
    pub incarnation: u64,
    pub status: ExitStatus,
}

/// Starts and tracks worker processes.
pub struct Supervisor {
    launcher: Arc<dyn WorkerLauncher>,
    defaults: WorkerDefaults,
    settings: SupervisorSettings,
    start_gate: Semaphore,
    exits: mpsc::UnboundedSender<ExitEvent>,
}

impl Supervisor {
    /// Create a supervisor. Worker exits are reported on the returned receiver.
    pub fn new(
        launcher: Arc<dyn WorkerLauncher>,
        defaults: WorkerDefaults,
        settings: SupervisorSettings,
    ) -> (Self, mpsc::UnboundedReceiver<ExitEvent>) {
        let (exits, exit_rx) = mpsc::unbounded_channel();
        let start_gate = Semaphore::new(settings.max_concurrent_starts.max(1));
        (
            Self {
                launcher,
                defaults,
                settings,
                start_gate,
                exits,
            },
            exit_rx,
        )
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    /// Return the live worker's capability, starting a worker if there is none.
    ///
    /// Concurrent callers for the same group share one start: the second
    /// caller waits on the group's start lock and then finds it active.
    pub async fn ensure_active(
        &self,
        group: &GroupInfo,
        descriptor: &GroupDescriptor,
    ) -> Result<(Arc<dyn Instantiator>, u64)> {
        let _start = group.start_lock.lock().await;
        if let Some(live) = group.live().await {
            return Ok(live);
        }

        let _permit = self
            .start_gate
            .acquire()
            .await
            .map_err(|_| Error::ShuttingDown)?;

        let spec = LaunchSpec::for_group(&self.defaults, descriptor);
        let (wake_tx, wake_rx) = oneshot::channel();
        let incarnation = {
            let mut runtime = group.runtime.lock().await;
            if runtime.unconfirmed.take().is_some() {
                warn!(group = %group.id(), incarnation = runtime.incarnation, "Abandoning worker that never checked in");
            }
            runtime.incarnation += 1;
            runtime.state = GroupState::Starting;
            runtime.waiter = Some(wake_tx);
            runtime.incarnation
        };

        info!(group = %group.id(), incarnation, program = %spec.program.display(), "Starting group");

        let handoff = Handoff {
            group_id: group.id(),
            descriptor: descriptor.clone(),
            incarnation,
        };
        let mut process = match self.launcher.launch(&spec, &handoff).await {
            Ok(process) => process,
            Err(e) => {
                error!(group = %group.id(), incarnation, error = %e, "Failed to launch worker");
                let mut runtime = group.runtime.lock().await;
                if runtime.incarnation == incarnation {
                    runtime.waiter = None;
                    runtime.state = runtime.dormant_state();
                }
                return Err(e);
            }
        };
        self.watch_exit(group.id(), incarnation, &mut process);

        {
            let mut runtime = group.runtime.lock().await;
            let current = runtime.incarnation == incarnation;
            let starting = matches!(runtime.state, GroupState::Starting | GroupState::Active);
            if self.is_closed() || !current || !starting {
                // Torn down while the launch was in flight; nobody else will stop it
                warn!(group = %group.id(), incarnation, "Start abandoned during launch, killing worker");
                process.kill();
                if current {
                    runtime.waiter = None;
                }
                return Err(self.abandoned(group.id()));
            }

            // The worker may have checked in before launch returned
            if runtime.state == GroupState::Active {
                runtime.process = Some(process);
            } else {
                runtime.unconfirmed = Some(process);
            }
        }

        let woken = tokio::time::timeout(self.settings.start_timeout, wake_rx).await;

        let mut runtime = group.runtime.lock().await;
        if runtime.incarnation == incarnation && runtime.state == GroupState::Active {
            if let Some(instantiator) = &runtime.instantiator {
                return Ok((Arc::clone(instantiator), incarnation));
            }
        }

        runtime.waiter = None;
        match woken {
            Err(_) => {
                warn!(
                    group = %group.id(),
                    incarnation,
                    timeout = ?self.settings.start_timeout,
                    "Worker did not check in before the start timeout"
                );
                if runtime.incarnation == incarnation {
                    if self.settings.kill_on_start_timeout {
                        if let Some(mut process) = runtime.unconfirmed.take() {
                            process.kill();
                        }
                    }
                    if runtime.state == GroupState::Starting {
                        runtime.state = runtime.dormant_state();
                    }
                }
                Err(Error::StartTimeout {
                    group: group.id(),
                    timeout: self.settings.start_timeout,
                })
            }
            Ok(_) => Err(self.abandoned(group.id())),
        }
    }

    /// Refuse new starts. Starts already past the gate abandon their worker.
    pub fn close(&self) {
        self.start_gate.close();
    }

    pub fn is_closed(&self) -> bool {
        self.start_gate.is_closed()
    }

    /// Error for a start whose waiter was dropped before the worker checked in.
    fn abandoned(&self, group: GroupId) -> Error {
        if self.is_closed() {
            return Error::ShuttingDown;
        }
        Error::ProcessSpawnFailed(format!(
            "start of group {} was abandoned before the worker checked in",
            group
        ))
    }

    /// Record a worker check-in.
    ///
    /// Returns `Ok(false)` for a stale incarnation (or a worker the daemon no
    /// longer tracks) and [`Error::AlreadyActive`] if the group already has a
    /// live worker.
    pub async fn group_became_active(
        &self,
        group: &GroupInfo,
        instantiator: Arc<dyn Instantiator>,
        incarnation: u64,
    ) -> Result<bool> {
        let mut runtime = group.runtime.lock().await;

        if runtime.incarnation != incarnation {
            debug!(
                group = %group.id(),
                reported = incarnation,
                current = runtime.incarnation,
                "Ignoring stale check-in"
            );
            return Ok(false);
        }
        if runtime.state == GroupState::Active {
            return Err(Error::AlreadyActive(group.id()));
        }

        let waiter = runtime.waiter.take();
        if waiter.is_none() && runtime.unconfirmed.is_none() {
            debug!(group = %group.id(), incarnation, "Check-in from untracked worker");
            return Ok(false);
        }

        if waiter.is_none() {
            info!(group = %group.id(), incarnation, "Late check-in after start timeout");
        }
        runtime.process = runtime.unconfirmed.take();
        runtime.instantiator = Some(instantiator);
        runtime.state = GroupState::Active;
        runtime.started_at = Some(Utc::now());

        if let Some(waiter) = waiter {
            let _ = waiter.send(());
        }
        info!(group = %group.id(), incarnation, "Group active");
        Ok(true)
    }

    /// Drop a group's worker. With `incarnation` set, only that worker is
    /// affected. Returns whether the group was active.
    pub async fn tear_down(&self, group: &GroupInfo, incarnation: Option<u64>, kill: bool) -> bool {
        let mut runtime = group.runtime.lock().await;

        if let Some(incarnation) = incarnation {
            if incarnation != runtime.incarnation {
                return false;
            }
        }

        let was_active = runtime.state == GroupState::Active;
        // Dropping the waiter wakes a blocked starter with an error
        runtime.waiter = None;
        runtime.instantiator = None;

        let processes = [runtime.process.take(), runtime.unconfirmed.take()];
        for mut process in processes.into_iter().flatten() {
            if kill {
                process.kill();
            }
        }

        runtime.state = runtime.dormant_state();
        if was_active {
            info!(group = %group.id(), incarnation = runtime.incarnation, "Group inactive");
        }
        was_active
    }

    fn watch_exit(&self, group_id: GroupId, incarnation: u64, process: &mut WorkerProcess) {
        let Some(exit) = process.take_exit() else {
            return;
        };
        let exits = self.exits.clone();
        tokio::spawn(async move {
            if let Ok(status) = exit.await {
                let _ = exits.send(ExitEvent {
                    group_id,
                    incarnation,
                    status,
                });
            }
        });
    }
}
