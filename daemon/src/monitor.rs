//! Observer notified of every group and object transition.
//!
//! Monitors are informational only. Calls are made inline and must return
//! quickly; nothing the daemon does depends on them.

use crate::descriptor::{GroupDescriptor, ObjectDescriptor};
use crate::id::{GroupId, ObjectId};
use tracing::info;

/// Transition observer. Every method defaults to a no-op.
pub trait Monitor: Send + Sync {
    fn group_registered(&self, _id: GroupId, _descriptor: &GroupDescriptor) {}
    fn group_activated(&self, _id: GroupId, _incarnation: u64) {}
    fn group_deactivated(&self, _id: GroupId) {}
    fn group_unregistered(&self, _id: GroupId) {}
    fn object_registered(&self, _id: ObjectId, _descriptor: &ObjectDescriptor) {}
    fn object_activated(&self, _id: ObjectId) {}
    fn object_deactivated(&self, _id: ObjectId) {}
    fn object_unregistered(&self, _id: ObjectId) {}
}

/// Monitor that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMonitor;

impl Monitor for NoopMonitor {}

/// Monitor that logs every transition.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMonitor;

impl Monitor for LogMonitor {
    fn group_registered(&self, id: GroupId, descriptor: &GroupDescriptor) {
        info!(target: "activd::monitor", group = %id, class = %descriptor.class_name, "group registered");
    }

    fn group_activated(&self, id: GroupId, incarnation: u64) {
        info!(target: "activd::monitor", group = %id, incarnation, "group activated");
    }

    fn group_deactivated(&self, id: GroupId) {
        info!(target: "activd::monitor", group = %id, "group deactivated");
    }

    fn group_unregistered(&self, id: GroupId) {
        info!(target: "activd::monitor", group = %id, "group unregistered");
    }

    fn object_registered(&self, id: ObjectId, descriptor: &ObjectDescriptor) {
        info!(
            target: "activd::monitor",
            object = %id,
            group = %descriptor.group_id,
            class = %descriptor.class_name,
            "object registered"
        );
    }

    fn object_activated(&self, id: ObjectId) {
        info!(target: "activd::monitor", object = %id, "object activated");
    }

    fn object_deactivated(&self, id: ObjectId) {
        info!(target: "activd::monitor", object = %id, "object deactivated");
    }

    fn object_unregistered(&self, id: ObjectId) {
        info!(target: "activd::monitor", object = %id, "object unregistered");
    }
}
