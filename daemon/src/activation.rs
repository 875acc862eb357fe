//! Activation protocol.
//!
//! [`Activator`] is the daemon's front door: every control-plane operation
//! and every worker callback lands here. It combines the [`Registry`] (what
//! exists), the [`Supervisor`] (which workers are running) and the
//! [`Monitor`] (who wants to hear about it).

use crate::descriptor::{GroupDescriptor, GroupState, GroupStatus, Handle, ObjectDescriptor};
use crate::error::{Error, Result};
use crate::id::{GroupId, ObjectId};
use crate::instantiator::Instantiator;
use crate::monitor::Monitor;
use crate::registry::{ActivationTarget, GroupInfo, Registry};
use crate::supervisor::{ExitEvent, Supervisor};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Serves control-plane operations and worker callbacks.
pub struct Activator {
    registry: Registry,
    supervisor: Supervisor,
    monitor: Arc<dyn Monitor>,
    shutting_down: AtomicBool,
}

impl Activator {
    /// Build an activator and start watching worker exits.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        registry: Registry,
        supervisor: Supervisor,
        exits: mpsc::UnboundedReceiver<ExitEvent>,
        monitor: Arc<dyn Monitor>,
    ) -> Arc<Self> {
        let activator = Arc::new(Self {
            registry,
            supervisor,
            monitor,
            shutting_down: AtomicBool::new(false),
        });
        tokio::spawn(watch_exits(Arc::downgrade(&activator), exits));
        activator
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub async fn register_group(&self, descriptor: GroupDescriptor) -> Result<GroupId> {
        let id = self.registry.register_group(descriptor.clone()).await?;
        info!(group = %id, class = %descriptor.class_name, "Registered group");
        self.monitor.group_registered(id, &descriptor);
        Ok(id)
    }

    /// Remove a group and its objects. A running worker is left alone.
    pub async fn unregister_group(&self, id: GroupId) -> Result<()> {
        let removed = self.registry.unregister_group(id).await?;

        for object in &removed.objects {
            self.monitor.object_unregistered(object.id);
        }
        if let Some(pid) = removed.info.pid().await {
            warn!(group = %id, pid, "Unregistered group still has a running worker");
        }

        info!(group = %id, objects = removed.objects.len(), "Unregistered group");
        self.monitor.group_unregistered(id);
        Ok(())
    }

    pub async fn register_object(&self, descriptor: ObjectDescriptor) -> Result<ObjectId> {
        let id = self.registry.register_object(descriptor.clone()).await?;
        info!(object = %id, group = %descriptor.group_id, class = %descriptor.class_name, "Registered object");
        self.monitor.object_registered(id, &descriptor);
        Ok(id)
    }

    pub async fn unregister_object(&self, id: ObjectId) -> Result<()> {
        let removed = self.registry.unregister_object(id).await?;
        info!(object = %id, group = %removed.descriptor.group_id, "Unregistered object");
        self.monitor.object_unregistered(id);
        Ok(())
    }

    pub async fn group_descriptor(&self, id: GroupId) -> Result<GroupDescriptor> {
        self.registry.group_descriptor(id).await
    }

    /// Replace a group descriptor. A running worker keeps the old one until
    /// it is restarted.
    pub async fn set_group_descriptor(
        &self,
        id: GroupId,
        descriptor: GroupDescriptor,
    ) -> Result<GroupDescriptor> {
        self.registry.set_group_descriptor(id, descriptor).await
    }

    pub async fn object_descriptor(&self, id: ObjectId) -> Result<ObjectDescriptor> {
        self.registry.object_descriptor(id).await
    }

    pub async fn set_object_descriptor(
        &self,
        id: ObjectId,
        descriptor: ObjectDescriptor,
    ) -> Result<ObjectDescriptor> {
        self.registry.set_object_descriptor(id, descriptor).await
    }

    /// Return a live handle for an object, starting its group if needed.
    ///
    /// Calls for the same object are single-flight: a second caller waits
    /// for the first and then gets the cached handle. `force` skips the cache
    /// and asks the worker again.
    pub async fn activate(&self, id: ObjectId, force: bool) -> Result<Handle> {
        if self.is_shutting_down() {
            return Err(Error::ShuttingDown);
        }

        let object = self.registry.object_info(id).await?;
        let _flight = object.begin_activation().await;

        if !force {
            if let Some(handle) = object.cached().await {
                debug!(object = %id, "Returning cached activation");
                return Ok(handle);
            }
        }
        if self.is_shutting_down() {
            return Err(Error::ShuttingDown);
        }

        // Look up again: the object may have been unregistered while we waited
        let target = self.registry.activation_target(id).await?;

        match self.instantiate(&target).await {
            Ok(handle) => {
                info!(
                    object = %id,
                    group = %target.group_id,
                    incarnation = handle.incarnation,
                    "Activated object"
                );
                target.object.set_activated(handle.clone()).await;
                self.monitor.object_activated(id);
                Ok(handle)
            }
            Err(e @ (Error::UnknownGroup(_)
            | Error::UnknownObject(_)
            | Error::ShuttingDown
            | Error::Persistence(_))) => Err(e),
            Err(e) => {
                warn!(object = %id, group = %target.group_id, error = %e, "Activation failed");
                Err(Error::activation_failed(format!("object {}", id), e))
            }
        }
    }

    /// Start the group if needed and ask its worker for the object, restarting
    /// the group once if the worker turns out to be gone.
    async fn instantiate(&self, target: &ActivationTarget) -> Result<Handle> {
        let (instantiator, incarnation) = self
            .supervisor
            .ensure_active(&target.group, &target.group_descriptor)
            .await?;

        match self.create(target, instantiator.as_ref(), incarnation).await {
            Err(e) if e.is_connectivity() => {
                warn!(
                    group = %target.group_id,
                    incarnation,
                    error = %e,
                    "Worker unreachable, restarting group"
                );
                self.handle_death(target.group_id, &target.group, incarnation)
                    .await;

                let (instantiator, incarnation) = self
                    .supervisor
                    .ensure_active(&target.group, &target.group_descriptor)
                    .await?;
                self.create(target, instantiator.as_ref(), incarnation).await
            }
            other => other,
        }
    }

    async fn create(
        &self,
        target: &ActivationTarget,
        instantiator: &dyn Instantiator,
        incarnation: u64,
    ) -> Result<Handle> {
        if target.descriptor.group_id != target.group_id {
            return Err(Error::GroupMismatch {
                object: target.object_id,
                expected: target.group_id,
                actual: target.descriptor.group_id,
            });
        }

        let mut handle = instantiator
            .create(target.object_id, &target.descriptor)
            .await?;

        if handle.group_id != target.group_id {
            return Err(Error::GroupMismatch {
                object: target.object_id,
                expected: target.group_id,
                actual: handle.group_id,
            });
        }
        handle.incarnation = incarnation;
        Ok(handle)
    }

    /// Kill a worker that stopped answering and forget everything it held.
    async fn handle_death(&self, id: GroupId, group: &GroupInfo, incarnation: u64) {
        if self.supervisor.tear_down(group, Some(incarnation), true).await {
            self.deactivate_objects(id).await;
            self.monitor.group_deactivated(id);
        }
    }

    async fn deactivate_objects(&self, id: GroupId) {
        let objects = match self.registry.objects_in_group(id).await {
            Ok(objects) => objects,
            Err(_) => return,
        };
        for object in objects {
            if object.info.mark_inactive().await {
                self.monitor.object_deactivated(object.id);
            }
        }
    }

    /// Worker callback: the worker for `id` is up and serving.
    ///
    /// Returns false when the check-in was stale and ignored.
    pub async fn group_became_active(
        &self,
        id: GroupId,
        instantiator: Arc<dyn Instantiator>,
        incarnation: u64,
    ) -> Result<bool> {
        let (_, group) = self.registry.group(id).await?;
        let activated = self
            .supervisor
            .group_became_active(&group, instantiator, incarnation)
            .await?;
        if activated {
            self.monitor.group_activated(id, incarnation);
        }
        Ok(activated)
    }

    /// Worker callback: the worker for `id` is going away.
    pub async fn group_became_inactive(&self, id: GroupId, incarnation: u64) -> Result<bool> {
        let (_, group) = self.registry.group(id).await?;
        if !self.supervisor.tear_down(&group, Some(incarnation), false).await {
            debug!(group = %id, incarnation, "Ignoring inactive report");
            return Ok(false);
        }
        self.deactivate_objects(id).await;
        self.monitor.group_deactivated(id);
        Ok(true)
    }

    /// Worker callback: an object came alive inside its worker.
    pub async fn object_became_active(&self, id: ObjectId) -> Result<()> {
        let object = self.registry.object_info(id).await?;
        if object.mark_active().await {
            self.monitor.object_activated(id);
        }
        Ok(())
    }

    /// Worker callback: an object went away inside its worker.
    pub async fn object_became_inactive(&self, id: ObjectId) -> Result<()> {
        let object = self.registry.object_info(id).await?;
        if object.mark_inactive().await {
            self.monitor.object_deactivated(id);
        }
        Ok(())
    }

    async fn process_exited(self: &Arc<Self>, event: ExitEvent) {
        let ExitEvent {
            group_id,
            incarnation,
            status,
        } = event;

        let Ok((descriptor, group)) = self.registry.group(group_id).await else {
            debug!(group = %group_id, "Worker of unregistered group exited");
            return;
        };

        info!(
            group = %group_id,
            incarnation,
            pid = ?status.pid,
            code = ?status.code,
            signal = ?status.signal,
            "Worker exited"
        );

        // Only a worker that was serving when it died counts as a crash
        if !self.supervisor.tear_down(&group, Some(incarnation), false).await {
            return;
        }
        self.deactivate_objects(group_id).await;
        self.monitor.group_deactivated(group_id);

        if descriptor.restart_on_crash && !self.is_shutting_down() {
            warn!(group = %group_id, incarnation, "Worker crashed, restarting group");
            let activator = Arc::clone(self);
            tokio::spawn(async move { activator.restart_group(group_id).await });
        }
    }

    /// Start a group again and re-activate its restartable objects.
    async fn restart_group(&self, id: GroupId) {
        let objects = match self.registry.objects_in_group(id).await {
            Ok(objects) => objects,
            Err(e) => {
                debug!(group = %id, error = %e, "Group gone before restart");
                return;
            }
        };

        let restartable: Vec<_> = objects
            .into_iter()
            .filter(|object| object.descriptor.restart)
            .map(|object| object.id)
            .collect();

        if restartable.is_empty() {
            let result = match self.registry.group(id).await {
                Ok((descriptor, group)) => self
                    .supervisor
                    .ensure_active(&group, &descriptor)
                    .await
                    .map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                error!(group = %id, error = %e, "Failed to restart group");
            }
            return;
        }

        for object in restartable {
            if let Err(e) = self.activate(object, false).await {
                error!(group = %id, object = %object, error = %e, "Failed to restart object");
            }
        }
    }

    /// Activate every object flagged for restart. Returns how many came up.
    pub async fn restart_services(self: &Arc<Self>) -> usize {
        let objects = self.registry.restartable_objects().await;
        if objects.is_empty() {
            return 0;
        }
        info!(count = objects.len(), "Restarting services");

        let mut tasks = JoinSet::new();
        for id in objects {
            let activator = Arc::clone(self);
            tasks.spawn(async move { (id, activator.activate(id, false).await) });
        }

        let mut started = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(_))) => started += 1,
                Ok((id, Err(e))) => error!(object = %id, error = %e, "Failed to restart service"),
                Err(e) => error!(error = %e, "Restart task failed"),
            }
        }
        started
    }

    /// Report on every registered group.
    pub async fn status(&self) -> Vec<GroupStatus> {
        let mut report = Vec::new();

        for group in self.registry.groups().await {
            let mut active_objects = 0;
            if let Ok(objects) = self.registry.objects_in_group(group.id).await {
                for object in objects {
                    if object.info.is_active().await {
                        active_objects += 1;
                    }
                }
            }

            let runtime = group.info.runtime.lock().await;
            report.push(GroupStatus {
                group_id: group.id,
                class_name: group.descriptor.class_name.clone(),
                state: runtime.state,
                incarnation: runtime.incarnation,
                pid: runtime
                    .process
                    .as_ref()
                    .or(runtime.unconfirmed.as_ref())
                    .and_then(|p| p.pid()),
                objects: group.objects,
                active_objects,
                started_at: runtime.started_at.filter(|_| runtime.state == GroupState::Active),
            });
        }

        report.sort_by(|a, b| {
            a.class_name
                .cmp(&b.class_name)
                .then(a.group_id.cmp(&b.group_id))
        });
        report
    }

    /// Stop every worker and refuse further activations.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down, stopping all workers");
        // Close before tearing down so a launch still in flight kills its own worker
        self.supervisor.close();

        for group in self.registry.groups().await {
            if self.supervisor.tear_down(&group.info, None, true).await {
                self.deactivate_objects(group.id).await;
                self.monitor.group_deactivated(group.id);
            }
        }

        if let Err(e) = self.registry.write_snapshot().await {
            error!(error = %e, "Failed to write final snapshot");
        }
    }
}

async fn watch_exits(activator: Weak<Activator>, mut exits: mpsc::UnboundedReceiver<ExitEvent>) {
    while let Some(event) = exits.recv().await {
        let Some(activator) = activator.upgrade() else {
            break;
        };
        activator.process_exited(event).await;
    }
}
