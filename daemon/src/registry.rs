//! Registry of groups and objects.
//!
//! The registry owns the two top-level maps and the journal behind one
//! global lock. Each group and object also carries a runtime record
//! ([`GroupInfo`], [`ObjectInfo`]) with its own locks, shared out as `Arc`s so
//! activation never holds the global lock while waiting on a worker.

use crate::descriptor::{GroupDescriptor, GroupState, Handle, ObjectDescriptor};
use crate::error::{Error, Result};
use crate::id::{GroupId, ObjectId};
use crate::instantiator::Instantiator;
use crate::journal::{Delta, Journal, Snapshot};
use crate::launcher::WorkerProcess;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

/// Mutable runtime fields of a group.
pub(crate) struct GroupRuntime {
    /// Bumped on every worker start
    pub(crate) incarnation: u64,
    pub(crate) state: GroupState,
    /// Live worker's instantiation capability
    pub(crate) instantiator: Option<Arc<dyn Instantiator>>,
    /// Live worker process
    pub(crate) process: Option<WorkerProcess>,
    /// Spawned worker that has not checked in yet
    pub(crate) unconfirmed: Option<WorkerProcess>,
    /// Wakes the caller blocked in `ensure_active`
    pub(crate) waiter: Option<oneshot::Sender<()>>,
    /// When the current worker became active
    pub(crate) started_at: Option<DateTime<Utc>>,
}

impl GroupRuntime {
    /// State to fall back to when a worker goes away.
    pub(crate) fn dormant_state(&self) -> GroupState {
        if self.started_at.is_some() {
            GroupState::Inactive
        } else {
            GroupState::Registered
        }
    }
}

/// Runtime record for one group.
pub struct GroupInfo {
    id: GroupId,
    /// Held across a whole worker start
    pub(crate) start_lock: Mutex<()>,
    pub(crate) runtime: Mutex<GroupRuntime>,
}

impl std::fmt::Debug for GroupInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupInfo").field("id", &self.id).finish_non_exhaustive()
    }
}

impl GroupInfo {
    fn new(id: GroupId) -> Self {
        Self {
            id,
            start_lock: Mutex::new(()),
            runtime: Mutex::new(GroupRuntime {
                incarnation: 0,
                state: GroupState::Registered,
                instantiator: None,
                process: None,
                unconfirmed: None,
                waiter: None,
                started_at: None,
            }),
        }
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub async fn state(&self) -> GroupState {
        self.runtime.lock().await.state
    }

    pub async fn incarnation(&self) -> u64 {
        self.runtime.lock().await.incarnation
    }

    pub async fn is_active(&self) -> bool {
        self.state().await == GroupState::Active
    }

    /// PID of the worker process, if one is tracked.
    pub async fn pid(&self) -> Option<u32> {
        let runtime = self.runtime.lock().await;
        runtime
            .process
            .as_ref()
            .or(runtime.unconfirmed.as_ref())
            .and_then(|p| p.pid())
    }

    /// Instantiation capability and incarnation of a live worker.
    pub(crate) async fn live(&self) -> Option<(Arc<dyn Instantiator>, u64)> {
        let runtime = self.runtime.lock().await;
        match (&runtime.state, &runtime.instantiator) {
            (GroupState::Active, Some(instantiator)) => {
                Some((Arc::clone(instantiator), runtime.incarnation))
            }
            _ => None,
        }
    }
}

/// Mutable runtime fields of an object.
#[derive(Debug, Default)]
struct ObjectRuntime {
    active: bool,
    cached: Option<Handle>,
}

/// Runtime record for one object.
#[derive(Debug)]
pub struct ObjectInfo {
    id: ObjectId,
    /// Serializes activation of this object
    flight: Mutex<()>,
    runtime: Mutex<ObjectRuntime>,
}

impl ObjectInfo {
    fn new(id: ObjectId) -> Self {
        Self {
            id,
            flight: Mutex::new(()),
            runtime: Mutex::new(ObjectRuntime::default()),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Enter the single-flight section for this object.
    pub async fn begin_activation(&self) -> MutexGuard<'_, ()> {
        self.flight.lock().await
    }

    pub async fn is_active(&self) -> bool {
        self.runtime.lock().await.active
    }

    /// Cached activation result, valid only while the object is active.
    pub async fn cached(&self) -> Option<Handle> {
        let runtime = self.runtime.lock().await;
        if runtime.active {
            runtime.cached.clone()
        } else {
            None
        }
    }

    /// Record a successful activation.
    pub async fn set_activated(&self, handle: Handle) {
        let mut runtime = self.runtime.lock().await;
        runtime.active = true;
        runtime.cached = Some(handle);
    }

    /// Mark active without a result (worker-reported). Returns whether it changed.
    pub async fn mark_active(&self) -> bool {
        let mut runtime = self.runtime.lock().await;
        !std::mem::replace(&mut runtime.active, true)
    }

    /// Mark inactive and drop the cached result. Returns whether it changed.
    pub async fn mark_inactive(&self) -> bool {
        let mut runtime = self.runtime.lock().await;
        runtime.cached = None;
        std::mem::replace(&mut runtime.active, false)
    }
}

/// Everything `activate` needs about an object and its group.
pub struct ActivationTarget {
    pub object_id: ObjectId,
    pub descriptor: ObjectDescriptor,
    pub object: Arc<ObjectInfo>,
    /// Group the object was bound to at registration
    pub group_id: GroupId,
    pub group_descriptor: GroupDescriptor,
    pub group: Arc<GroupInfo>,
}

/// A registered object as seen from its group.
#[derive(Debug)]
pub struct ObjectRef {
    pub id: ObjectId,
    pub descriptor: ObjectDescriptor,
    pub info: Arc<ObjectInfo>,
}

/// A registered group.
pub struct GroupRef {
    pub id: GroupId,
    pub descriptor: GroupDescriptor,
    pub info: Arc<GroupInfo>,
    pub objects: usize,
}

/// Objects removed together with their group.
#[derive(Debug)]
pub struct RemovedGroup {
    pub info: Arc<GroupInfo>,
    pub objects: Vec<ObjectRef>,
}

struct GroupEntry {
    descriptor: GroupDescriptor,
    objects: BTreeSet<ObjectId>,
    info: Arc<GroupInfo>,
}

struct ObjectEntry {
    /// Binding fixed at registration
    group_id: GroupId,
    descriptor: ObjectDescriptor,
    info: Arc<ObjectInfo>,
}

struct RegistryState {
    groups: HashMap<GroupId, GroupEntry>,
    objects: HashMap<ObjectId, ObjectEntry>,
    journal: Journal,
}

fn snapshot_of(
    groups: &HashMap<GroupId, GroupEntry>,
    objects: &HashMap<ObjectId, ObjectEntry>,
) -> Snapshot {
    Snapshot {
        groups: groups
            .iter()
            .map(|(id, entry)| (*id, entry.descriptor.clone()))
            .collect(),
        objects: objects
            .iter()
            .map(|(id, entry)| (*id, entry.descriptor.clone()))
            .collect(),
    }
}

impl RegistryState {
    fn snapshot(&self) -> Snapshot {
        snapshot_of(&self.groups, &self.objects)
    }

    /// Journal a mutation that has already been applied to the maps.
    fn record(&mut self, delta: Delta) -> Result<()> {
        let RegistryState {
            groups,
            objects,
            journal,
        } = self;
        journal.append(&delta, || snapshot_of(groups, objects))
    }

    fn put_group(&mut self, id: GroupId, descriptor: GroupDescriptor) -> Option<GroupDescriptor> {
        match self.groups.get_mut(&id) {
            Some(entry) => Some(std::mem::replace(&mut entry.descriptor, descriptor)),
            None => {
                self.groups.insert(
                    id,
                    GroupEntry {
                        descriptor,
                        objects: BTreeSet::new(),
                        info: Arc::new(GroupInfo::new(id)),
                    },
                );
                None
            }
        }
    }

    fn remove_group(&mut self, id: GroupId) -> Option<RemovedGroup> {
        let entry = self.groups.remove(&id)?;
        let objects = entry
            .objects
            .iter()
            .filter_map(|object_id| {
                self.objects.remove(object_id).map(|object| ObjectRef {
                    id: *object_id,
                    descriptor: object.descriptor,
                    info: object.info,
                })
            })
            .collect();
        Some(RemovedGroup {
            info: entry.info,
            objects,
        })
    }

    fn put_object(&mut self, id: ObjectId, descriptor: ObjectDescriptor) -> Result<()> {
        let group_id = descriptor.group_id;

        // An existing object keeps its binding, whatever the new descriptor names
        if let Some(entry) = self.objects.get_mut(&id) {
            if entry.group_id != group_id {
                return Err(Error::GroupMismatch {
                    object: id,
                    expected: entry.group_id,
                    actual: group_id,
                });
            }
            entry.descriptor = descriptor;
            return Ok(());
        }

        let group = self
            .groups
            .get_mut(&group_id)
            .ok_or(Error::UnknownGroup(group_id))?;
        group.objects.insert(id);
        self.objects.insert(
            id,
            ObjectEntry {
                group_id,
                descriptor,
                info: Arc::new(ObjectInfo::new(id)),
            },
        );
        Ok(())
    }

    fn remove_object(&mut self, id: ObjectId) -> Option<ObjectEntry> {
        let entry = self.objects.remove(&id)?;
        if let Some(group) = self.groups.get_mut(&entry.group_id) {
            group.objects.remove(&id);
        }
        Some(entry)
    }

    /// Apply a replayed delta without journaling it.
    fn apply(&mut self, delta: Delta) -> Result<()> {
        match delta {
            Delta::PutGroup { id, descriptor } => {
                self.put_group(id, descriptor);
            }
            Delta::RemoveGroup { id } => {
                self.remove_group(id);
            }
            Delta::PutObject { id, descriptor } => match self.put_object(id, descriptor) {
                Err(Error::UnknownGroup(group)) => {
                    warn!(object = %id, group = %group, "Dropping object of unknown group");
                }
                other => other?,
            },
            Delta::RemoveObject { id } => {
                self.remove_object(id);
            }
        }
        Ok(())
    }

    fn restore(&mut self) -> Result<()> {
        self.journal.begin_restore();
        let result = self
            .journal
            .replay()
            .and_then(|deltas| deltas.into_iter().try_for_each(|delta| self.apply(delta)));
        self.journal.finish_restore();
        result
    }
}

/// The authoritative set of registered groups and objects.
pub struct Registry {
    state: Mutex<RegistryState>,
}

impl Registry {
    /// Open the registry, restoring whatever the journal in `dir` holds.
    ///
    /// A journal that cannot be read is logged and the registry starts empty.
    /// Failing to write the compacted snapshot afterwards is an error.
    pub fn open(dir: impl Into<PathBuf>, snapshot_interval: usize) -> Result<Self> {
        let mut state = RegistryState {
            groups: HashMap::new(),
            objects: HashMap::new(),
            journal: Journal::new(dir, snapshot_interval),
        };

        match state.restore() {
            Ok(()) => info!(
                groups = state.groups.len(),
                objects = state.objects.len(),
                dir = %state.journal.dir().display(),
                "Restored registry"
            ),
            Err(e) => {
                error!(error = %e, "Failed to restore registry, starting empty");
                state.groups.clear();
                state.objects.clear();
                if let Err(e) = state.journal.quarantine() {
                    warn!(error = %e, "Failed to move unreadable journal aside");
                }
            }
        }

        // Compact: fold the replayed deltas into a fresh snapshot
        let snapshot = state.snapshot();
        state.journal.write_snapshot(&snapshot)?;

        Ok(Self {
            state: Mutex::new(state),
        })
    }

    /// Register a group under a fresh id.
    pub async fn register_group(&self, descriptor: GroupDescriptor) -> Result<GroupId> {
        let mut state = self.state.lock().await;

        let id = GroupId::new();
        if state.groups.contains_key(&id) {
            return Err(Error::AlreadyRegistered(id));
        }

        state.put_group(id, descriptor.clone());
        state.record(Delta::PutGroup { id, descriptor })?;

        debug!(group = %id, "Registered group");
        Ok(id)
    }

    /// Register an object with an existing group.
    pub async fn register_object(&self, descriptor: ObjectDescriptor) -> Result<ObjectId> {
        let mut state = self.state.lock().await;

        let id = ObjectId::new();
        state.put_object(id, descriptor.clone())?;
        state.record(Delta::PutObject { id, descriptor })?;

        debug!(object = %id, "Registered object");
        Ok(id)
    }

    /// Remove a group and every object it owns.
    pub async fn unregister_group(&self, id: GroupId) -> Result<RemovedGroup> {
        let mut state = self.state.lock().await;

        let removed = state.remove_group(id).ok_or(Error::UnknownGroup(id))?;
        state.record(Delta::RemoveGroup { id })?;

        debug!(group = %id, objects = removed.objects.len(), "Unregistered group");
        Ok(removed)
    }

    /// Remove one object.
    pub async fn unregister_object(&self, id: ObjectId) -> Result<ObjectRef> {
        let mut state = self.state.lock().await;

        let entry = state.remove_object(id).ok_or(Error::UnknownObject(id))?;
        state.record(Delta::RemoveObject { id })?;

        debug!(object = %id, "Unregistered object");
        Ok(ObjectRef {
            id,
            descriptor: entry.descriptor,
            info: entry.info,
        })
    }

    pub async fn group_descriptor(&self, id: GroupId) -> Result<GroupDescriptor> {
        let state = self.state.lock().await;
        state
            .groups
            .get(&id)
            .map(|entry| entry.descriptor.clone())
            .ok_or(Error::UnknownGroup(id))
    }

    pub async fn object_descriptor(&self, id: ObjectId) -> Result<ObjectDescriptor> {
        let state = self.state.lock().await;
        state
            .objects
            .get(&id)
            .map(|entry| entry.descriptor.clone())
            .ok_or(Error::UnknownObject(id))
    }

    /// Replace a group descriptor, returning the previous one.
    pub async fn set_group_descriptor(
        &self,
        id: GroupId,
        descriptor: GroupDescriptor,
    ) -> Result<GroupDescriptor> {
        let mut state = self.state.lock().await;

        if !state.groups.contains_key(&id) {
            return Err(Error::UnknownGroup(id));
        }
        let old = state
            .put_group(id, descriptor.clone())
            .ok_or(Error::UnknownGroup(id))?;
        state.record(Delta::PutGroup { id, descriptor })?;
        Ok(old)
    }

    /// Replace an object descriptor, returning the previous one.
    ///
    /// The new descriptor must name the group the object is bound to.
    pub async fn set_object_descriptor(
        &self,
        id: ObjectId,
        descriptor: ObjectDescriptor,
    ) -> Result<ObjectDescriptor> {
        let mut state = self.state.lock().await;

        let old = state
            .objects
            .get(&id)
            .map(|entry| entry.descriptor.clone())
            .ok_or(Error::UnknownObject(id))?;
        state.put_object(id, descriptor.clone())?;
        state.record(Delta::PutObject { id, descriptor })?;
        Ok(old)
    }

    /// Runtime record of an object.
    pub async fn object_info(&self, id: ObjectId) -> Result<Arc<ObjectInfo>> {
        let state = self.state.lock().await;
        state
            .objects
            .get(&id)
            .map(|entry| Arc::clone(&entry.info))
            .ok_or(Error::UnknownObject(id))
    }

    /// Descriptor and runtime record of a group.
    pub async fn group(&self, id: GroupId) -> Result<(GroupDescriptor, Arc<GroupInfo>)> {
        let state = self.state.lock().await;
        state
            .groups
            .get(&id)
            .map(|entry| (entry.descriptor.clone(), Arc::clone(&entry.info)))
            .ok_or(Error::UnknownGroup(id))
    }

    /// Resolve an object and its owning group for activation.
    pub async fn activation_target(&self, id: ObjectId) -> Result<ActivationTarget> {
        let state = self.state.lock().await;

        let object = state.objects.get(&id).ok_or(Error::UnknownObject(id))?;
        let group = state
            .groups
            .get(&object.group_id)
            .ok_or(Error::UnknownGroup(object.group_id))?;

        Ok(ActivationTarget {
            object_id: id,
            descriptor: object.descriptor.clone(),
            object: Arc::clone(&object.info),
            group_id: object.group_id,
            group_descriptor: group.descriptor.clone(),
            group: Arc::clone(&group.info),
        })
    }

    /// Objects owned by a group.
    pub async fn objects_in_group(&self, id: GroupId) -> Result<Vec<ObjectRef>> {
        let state = self.state.lock().await;
        let group = state.groups.get(&id).ok_or(Error::UnknownGroup(id))?;

        Ok(group
            .objects
            .iter()
            .filter_map(|object_id| {
                state.objects.get(object_id).map(|entry| ObjectRef {
                    id: *object_id,
                    descriptor: entry.descriptor.clone(),
                    info: Arc::clone(&entry.info),
                })
            })
            .collect())
    }

    /// Every registered group.
    pub async fn groups(&self) -> Vec<GroupRef> {
        let state = self.state.lock().await;
        state
            .groups
            .iter()
            .map(|(id, entry)| GroupRef {
                id: *id,
                descriptor: entry.descriptor.clone(),
                info: Arc::clone(&entry.info),
                objects: entry.objects.len(),
            })
            .collect()
    }

    /// Objects flagged for eager activation.
    pub async fn restartable_objects(&self) -> Vec<ObjectId> {
        let state = self.state.lock().await;
        state
            .objects
            .iter()
            .filter(|(_, entry)| entry.descriptor.restart)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Current descriptor contents.
    pub async fn snapshot(&self) -> Snapshot {
        self.state.lock().await.snapshot()
    }

    /// Write a snapshot now and truncate the delta log.
    pub async fn write_snapshot(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let snapshot = state.snapshot();
        state.journal.write_snapshot(&snapshot)
    }
}
