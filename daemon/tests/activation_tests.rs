//! Scenario tests for the activation protocol.
//!
//! Workers are simulated: a fake launcher reports each launch on a channel
//! and a background task checks the "worker" in with a fake instantiator.

use activd_daemon::journal::DELTA_FILE;
use activd_daemon::{
    Activator, Error, ExitStatus, GroupDescriptor, GroupId, GroupState, Handle, Handoff,
    Instantiator, LaunchSpec, Monitor, NoopMonitor, ObjectDescriptor, ObjectId, Registry, Result,
    Supervisor, SupervisorSettings, WorkerDefaults, WorkerLauncher, WorkerProcess,
};
use assert_matches::assert_matches;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{mpsc, oneshot, Semaphore};

/// One simulated worker launch
struct Launch {
    handoff: Handoff,
    exit: oneshot::Sender<ExitStatus>,
    kill: oneshot::Receiver<()>,
}

struct FakeLauncher {
    launches: mpsc::UnboundedSender<Launch>,
    fail: AtomicBool,
}

#[async_trait]
impl WorkerLauncher for FakeLauncher {
    async fn launch(&self, _spec: &LaunchSpec, handoff: &Handoff) -> Result<WorkerProcess> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::ProcessSpawnFailed("no such program".to_string()));
        }
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let _ = self.launches.send(Launch {
            handoff: handoff.clone(),
            exit: exit_tx,
            kill: kill_rx,
        });
        Ok(WorkerProcess::new(None, kill_tx, exit_rx))
    }
}

/// Instantiator of one simulated worker
struct FakeInstantiator {
    incarnation: u64,
    creates: AtomicUsize,
    reachable: AtomicBool,
    failure: Option<String>,
}

#[async_trait]
impl Instantiator for FakeInstantiator {
    async fn create(&self, object_id: ObjectId, descriptor: &ObjectDescriptor) -> Result<Handle> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(Error::Unreachable("connection refused".to_string()));
        }
        if let Some(message) = &self.failure {
            return Err(Error::Instantiation(message.clone()));
        }
        let count = self.creates.fetch_add(1, Ordering::SeqCst) + 1;
        // Let concurrent callers pile up behind the first
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(Handle {
            object_id,
            group_id: descriptor.group_id,
            incarnation: self.incarnation,
            reference: format!("{}-{}-{}", descriptor.class_name, self.incarnation, count),
        })
    }
}

/// How newly launched workers behave
#[derive(Default)]
struct Behavior {
    /// Never check in
    silent: AtomicBool,
    unreachable: AtomicBool,
    failure: Mutex<Option<String>>,
}

/// A worker that has checked in
struct Worker {
    handoff: Handoff,
    instantiator: Arc<FakeInstantiator>,
    exit: oneshot::Sender<ExitStatus>,
    kill: oneshot::Receiver<()>,
}

#[derive(Default)]
struct RecordingMonitor {
    events: Mutex<Vec<String>>,
}

impl RecordingMonitor {
    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl Monitor for RecordingMonitor {
    fn group_registered(&self, id: GroupId, _descriptor: &GroupDescriptor) {
        self.record(format!("group_registered {}", id));
    }
    fn group_activated(&self, id: GroupId, incarnation: u64) {
        self.record(format!("group_activated {} {}", id, incarnation));
    }
    fn group_deactivated(&self, id: GroupId) {
        self.record(format!("group_deactivated {}", id));
    }
    fn group_unregistered(&self, id: GroupId) {
        self.record(format!("group_unregistered {}", id));
    }
    fn object_registered(&self, id: ObjectId, _descriptor: &ObjectDescriptor) {
        self.record(format!("object_registered {}", id));
    }
    fn object_activated(&self, id: ObjectId) {
        self.record(format!("object_activated {}", id));
    }
    fn object_deactivated(&self, id: ObjectId) {
        self.record(format!("object_deactivated {}", id));
    }
    fn object_unregistered(&self, id: ObjectId) {
        self.record(format!("object_unregistered {}", id));
    }
}

struct Harness {
    activator: Arc<Activator>,
    launcher: Arc<FakeLauncher>,
    behavior: Arc<Behavior>,
    monitor: Arc<RecordingMonitor>,
    workers: mpsc::UnboundedReceiver<Worker>,
    launches: Arc<AtomicUsize>,
    _dir: TempDir,
}

fn settings(start_timeout: Duration) -> SupervisorSettings {
    SupervisorSettings {
        start_timeout,
        max_concurrent_starts: 3,
        kill_on_start_timeout: false,
    }
}

fn harness() -> Harness {
    harness_with(settings(Duration::from_secs(5)))
}

fn harness_with(settings: SupervisorSettings) -> Harness {
    let dir = TempDir::new().unwrap();
    let registry = Registry::open(dir.path(), 50).unwrap();

    let (launch_tx, mut launch_rx) = mpsc::unbounded_channel();
    let launcher = Arc::new(FakeLauncher {
        launches: launch_tx,
        fail: AtomicBool::new(false),
    });
    let defaults = WorkerDefaults {
        program: PathBuf::from("activd-worker"),
        options: Vec::new(),
        control_socket: dir.path().join("control.sock"),
        runtime_dir: dir.path().join("run"),
    };
    let (supervisor, exits) = Supervisor::new(launcher.clone(), defaults, settings);
    let monitor = Arc::new(RecordingMonitor::default());
    let activator = Activator::new(registry, supervisor, exits, monitor.clone());

    let behavior = Arc::new(Behavior::default());
    let launches = Arc::new(AtomicUsize::new(0));
    let (worker_tx, workers) = mpsc::unbounded_channel();
    {
        let activator = Arc::clone(&activator);
        let behavior = Arc::clone(&behavior);
        let launches = Arc::clone(&launches);
        tokio::spawn(async move {
            while let Some(launch) = launch_rx.recv().await {
                launches.fetch_add(1, Ordering::SeqCst);
                let instantiator = Arc::new(FakeInstantiator {
                    incarnation: launch.handoff.incarnation,
                    creates: AtomicUsize::new(0),
                    reachable: AtomicBool::new(!behavior.unreachable.load(Ordering::SeqCst)),
                    failure: behavior.failure.lock().unwrap().clone(),
                });
                if !behavior.silent.load(Ordering::SeqCst) {
                    activator
                        .group_became_active(
                            launch.handoff.group_id,
                            instantiator.clone(),
                            launch.handoff.incarnation,
                        )
                        .await
                        .unwrap();
                }
                let _ = worker_tx.send(Worker {
                    handoff: launch.handoff,
                    instantiator,
                    exit: launch.exit,
                    kill: launch.kill,
                });
            }
        });
    }

    Harness {
        activator,
        launcher,
        behavior,
        monitor,
        workers,
        launches,
        _dir: dir,
    }
}

impl Harness {
    async fn register(&self, restart: bool) -> (GroupId, ObjectId) {
        let group = self
            .activator
            .register_group(GroupDescriptor::new("Group").with_restart_on_crash(restart))
            .await
            .unwrap();
        let object = self
            .activator
            .register_object(ObjectDescriptor::new(group, "Counter").with_restart(restart))
            .await
            .unwrap();
        (group, object)
    }

    async fn next_worker(&mut self) -> Worker {
        tokio::time::timeout(Duration::from_secs(5), self.workers.recv())
            .await
            .expect("no worker launched")
            .expect("launcher gone")
    }

    async fn group_state(&self, id: GroupId) -> GroupState {
        let (_, info) = self.activator.registry().group(id).await.unwrap();
        info.state().await
    }

    async fn wait_for_state(&self, id: GroupId, state: GroupState) {
        for _ in 0..500 {
            if self.group_state(id).await == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("group {} never reached {}", id, state);
    }
}

fn crashed() -> ExitStatus {
    ExitStatus {
        pid: None,
        code: None,
        signal: Some(9),
    }
}

mod persistence {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_recovery_from_snapshot_and_deltas() {
        let tmp = TempDir::new().unwrap();
        let d1 = GroupDescriptor::new("Group").with_data("d1");

        let (group, o1, o2) = {
            let registry = Registry::open(tmp.path(), 1000).unwrap();
            let group = registry.register_group(d1.clone()).await.unwrap();
            let o1 = registry
                .register_object(ObjectDescriptor::new(group, "First"))
                .await
                .unwrap();
            registry.write_snapshot().await.unwrap();
            let o2 = registry
                .register_object(ObjectDescriptor::new(group, "Second"))
                .await
                .unwrap();
            // Dropped without a shutdown: O2 only lives in the delta log
            (group, o1, o2)
        };
        let deltas = std::fs::read_to_string(tmp.path().join(DELTA_FILE)).unwrap();
        assert_eq!(deltas.lines().count(), 1);

        let registry = Registry::open(tmp.path(), 1000).unwrap();
        assert_eq!(registry.group_descriptor(group).await.unwrap(), d1);
        assert_eq!(
            registry.object_descriptor(o1).await.unwrap().class_name,
            "First"
        );
        assert_eq!(
            registry.object_descriptor(o2).await.unwrap().class_name,
            "Second"
        );
    }

    #[tokio::test]
    async fn test_torn_final_delta_is_ignored() {
        let tmp = TempDir::new().unwrap();
        let group = {
            let registry = Registry::open(tmp.path(), 1000).unwrap();
            registry
                .register_group(GroupDescriptor::new("Group"))
                .await
                .unwrap()
        };

        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(tmp.path().join(DELTA_FILE))
            .unwrap();
        file.write_all(b"{\"op\":\"put_obj").unwrap();
        drop(file);

        let registry = Registry::open(tmp.path(), 1000).unwrap();
        assert!(registry.group_descriptor(group).await.is_ok());
        assert_eq!(registry.snapshot().await.objects.len(), 0);
    }

    #[tokio::test]
    async fn test_snapshot_interval_compacts_deltas() {
        let tmp = TempDir::new().unwrap();
        let registry = Registry::open(tmp.path(), 3).unwrap();
        for i in 0..3 {
            registry
                .register_group(GroupDescriptor::new(format!("G{}", i)))
                .await
                .unwrap();
        }

        let deltas = std::fs::read_to_string(tmp.path().join(DELTA_FILE)).unwrap();
        assert!(deltas.is_empty());

        let restored = Registry::open(tmp.path(), 3).unwrap();
        assert_eq!(restored.snapshot().await.groups.len(), 3);
    }
}

mod activation {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_activate_starts_group_once() {
        let mut h = harness();
        let (group, object) = h.register(false).await;

        let handle = h.activator.activate(object, false).await.unwrap();
        assert_eq!(handle.group_id, group);
        assert_eq!(handle.incarnation, 1);
        assert_eq!(h.group_state(group).await, GroupState::Active);

        let worker = h.next_worker().await;
        assert_eq!(worker.handoff.group_id, group);
        assert_eq!(worker.handoff.descriptor.class_name, "Group");

        // Cached: no second create, no second launch
        let again = h.activator.activate(object, false).await.unwrap();
        assert_eq!(again, handle);
        assert_eq!(worker.instantiator.creates.load(Ordering::SeqCst), 1);
        assert_eq!(h.launches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_activations_are_single_flight() {
        let mut h = harness();
        let (_, object) = h.register(false).await;

        let calls: Vec<_> = (0..8)
            .map(|_| {
                let activator = Arc::clone(&h.activator);
                tokio::spawn(async move { activator.activate(object, false).await })
            })
            .collect();

        let mut handles = Vec::new();
        for call in calls {
            handles.push(call.await.unwrap().unwrap());
        }

        assert!(handles.windows(2).all(|pair| pair[0] == pair[1]));
        let worker = h.next_worker().await;
        assert_eq!(worker.instantiator.creates.load(Ordering::SeqCst), 1);
        assert_eq!(h.launches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_objects_share_one_worker() {
        let mut h = harness();
        let (group, first) = h.register(false).await;
        let second = h
            .activator
            .register_object(ObjectDescriptor::new(group, "Other"))
            .await
            .unwrap();

        h.activator.activate(first, false).await.unwrap();
        h.activator.activate(second, false).await.unwrap();

        let worker = h.next_worker().await;
        assert_eq!(worker.instantiator.creates.load(Ordering::SeqCst), 2);
        assert_eq!(h.launches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_force_skips_cache() {
        let mut h = harness();
        let (_, object) = h.register(false).await;

        let first = h.activator.activate(object, false).await.unwrap();
        let forced = h.activator.activate(object, true).await.unwrap();
        assert_ne!(first.reference, forced.reference);

        let worker = h.next_worker().await;
        assert_eq!(worker.instantiator.creates.load(Ordering::SeqCst), 2);
        assert_eq!(h.launches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_ids_are_rejected() {
        let h = harness();
        let group = GroupId::new();
        let object = ObjectId::new();

        assert_matches!(h.activator.activate(object, false).await, Err(Error::UnknownObject(id)) if id == object);
        assert_matches!(h.activator.group_descriptor(group).await, Err(Error::UnknownGroup(_)));
        assert_matches!(h.activator.object_descriptor(object).await, Err(Error::UnknownObject(_)));
        assert_matches!(h.activator.unregister_group(group).await, Err(Error::UnknownGroup(_)));
        assert_matches!(h.activator.unregister_object(object).await, Err(Error::UnknownObject(_)));
    }

    #[tokio::test]
    async fn test_unregistered_object_cannot_be_activated() {
        let h = harness();
        let (group, object) = h.register(false).await;

        h.activator.unregister_group(group).await.unwrap();
        assert_matches!(h.activator.activate(object, false).await, Err(Error::UnknownObject(_)));
        assert_matches!(h.activator.object_descriptor(object).await, Err(Error::UnknownObject(_)));
    }

    #[tokio::test]
    async fn test_worker_failure_is_wrapped() {
        let h = harness();
        *h.behavior.failure.lock().unwrap() = Some("constructor threw".to_string());
        let (_, object) = h.register(false).await;

        let err = h.activator.activate(object, false).await.unwrap_err();
        match err {
            Error::ActivationFailed { cause, .. } => {
                assert_matches!(*cause, Error::Instantiation(ref message) if message == "constructor threw");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // Application errors do not restart the worker
        assert_eq!(h.launches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_wrapped() {
        let h = harness();
        h.launcher.fail.store(true, Ordering::SeqCst);
        let (group, object) = h.register(false).await;

        let err = h.activator.activate(object, false).await.unwrap_err();
        assert_matches!(err, Error::ActivationFailed { ref cause, .. } if matches!(**cause, Error::ProcessSpawnFailed(_)));
        assert_eq!(h.group_state(group).await, GroupState::Registered);

        // A later attempt can still succeed
        h.launcher.fail.store(false, Ordering::SeqCst);
        let handle = h.activator.activate(object, false).await.unwrap();
        assert_eq!(handle.incarnation, 2);
    }

    #[tokio::test]
    async fn test_object_inactive_clears_cache() {
        let mut h = harness();
        let (_, object) = h.register(false).await;

        h.activator.activate(object, false).await.unwrap();
        h.activator.object_became_inactive(object).await.unwrap();
        h.activator.activate(object, false).await.unwrap();

        let worker = h.next_worker().await;
        assert_eq!(worker.instantiator.creates.load(Ordering::SeqCst), 2);
    }
}

mod supervision {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_start_timeout_leaves_group_restartable() {
        let mut h = harness_with(settings(Duration::from_millis(100)));
        h.behavior.silent.store(true, Ordering::SeqCst);
        let (group, object) = h.register(false).await;

        let err = h.activator.activate(object, false).await.unwrap_err();
        assert_matches!(err, Error::ActivationFailed { ref cause, .. } if matches!(**cause, Error::StartTimeout { .. }));
        assert_eq!(h.group_state(group).await, GroupState::Registered);

        // The timed-out worker was left running
        let mut silent = h.next_worker().await;
        assert!(silent.kill.try_recv().is_err());

        h.behavior.silent.store(false, Ordering::SeqCst);
        let handle = h.activator.activate(object, false).await.unwrap();
        assert_eq!(handle.incarnation, 2);

        // The first worker checking in now is stale
        let accepted = h
            .activator
            .group_became_active(group, silent.instantiator.clone(), silent.handoff.incarnation)
            .await
            .unwrap();
        assert!(!accepted);
    }

    #[tokio::test]
    async fn test_kill_on_start_timeout() {
        let mut h = harness_with(SupervisorSettings {
            kill_on_start_timeout: true,
            ..settings(Duration::from_millis(100))
        });
        h.behavior.silent.store(true, Ordering::SeqCst);
        let (_, object) = h.register(false).await;

        assert!(h.activator.activate(object, false).await.is_err());
        let mut worker = h.next_worker().await;
        assert!(worker.kill.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_late_check_in_activates_group() {
        let mut h = harness_with(settings(Duration::from_millis(100)));
        h.behavior.silent.store(true, Ordering::SeqCst);
        let (group, object) = h.register(false).await;

        assert!(h.activator.activate(object, false).await.is_err());
        let late = h.next_worker().await;

        let accepted = h
            .activator
            .group_became_active(group, late.instantiator.clone(), late.handoff.incarnation)
            .await
            .unwrap();
        assert!(accepted);
        assert_eq!(h.group_state(group).await, GroupState::Active);

        let handle = h.activator.activate(object, false).await.unwrap();
        assert_eq!(handle.incarnation, 1);
        assert_eq!(h.launches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_incarnation_is_ignored() {
        let mut h = harness();
        let (group, object) = h.register(false).await;
        h.activator.activate(object, false).await.unwrap();
        let live = h.next_worker().await;

        let impostor = Arc::new(FakeInstantiator {
            incarnation: 0,
            creates: AtomicUsize::new(0),
            reachable: AtomicBool::new(true),
            failure: None,
        });
        let accepted = h
            .activator
            .group_became_active(group, impostor.clone(), 0)
            .await
            .unwrap();
        assert!(!accepted);

        assert_matches!(
            h.activator
                .group_became_active(group, impostor.clone(), live.handoff.incarnation)
                .await,
            Err(Error::AlreadyActive(_))
        );

        h.activator.activate(object, true).await.unwrap();
        assert_eq!(impostor.creates.load(Ordering::SeqCst), 0);
        assert_eq!(live.instantiator.creates.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_worker_exit_restarts_on_next_activation() {
        let mut h = harness();
        let (group, object) = h.register(false).await;

        let first = h.activator.activate(object, false).await.unwrap();
        let worker = h.next_worker().await;
        worker.exit.send(crashed()).unwrap();
        h.wait_for_state(group, GroupState::Inactive).await;

        let second = h.activator.activate(object, false).await.unwrap();
        assert_eq!(first.incarnation, 1);
        assert_eq!(second.incarnation, 2);
        assert_eq!(h.launches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unreachable_worker_is_restarted_once() {
        let mut h = harness();
        let (group, object) = h.register(false).await;

        h.activator.activate(object, false).await.unwrap();
        let mut dead = h.next_worker().await;
        dead.instantiator.reachable.store(false, Ordering::SeqCst);

        let handle = h.activator.activate(object, true).await.unwrap();
        assert_eq!(handle.incarnation, 2);
        assert!(dead.kill.try_recv().is_ok());

        let replacement = h.next_worker().await;
        assert_eq!(replacement.handoff.incarnation, 2);
        assert_eq!(replacement.instantiator.creates.load(Ordering::SeqCst), 1);
        assert_eq!(h.group_state(group).await, GroupState::Active);
    }

    #[tokio::test]
    async fn test_unreachable_after_restart_fails() {
        let mut h = harness();
        let (_, object) = h.register(false).await;

        h.activator.activate(object, false).await.unwrap();
        let dead = h.next_worker().await;
        dead.instantiator.reachable.store(false, Ordering::SeqCst);
        h.behavior.unreachable.store(true, Ordering::SeqCst);

        let err = h.activator.activate(object, true).await.unwrap_err();
        assert_matches!(err, Error::ActivationFailed { ref cause, .. } if matches!(**cause, Error::Unreachable(_)));
        assert_eq!(h.launches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_crashed_group_restarts_flagged_objects() {
        let mut h = harness();
        let (group, object) = h.register(true).await;

        h.activator.activate(object, false).await.unwrap();
        let worker = h.next_worker().await;
        worker.exit.send(crashed()).unwrap();

        let replacement = h.next_worker().await;
        assert_eq!(replacement.handoff.incarnation, 2);
        h.wait_for_state(group, GroupState::Active).await;

        for _ in 0..500 {
            if replacement.instantiator.creates.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(replacement.instantiator.creates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_group_inactive_report_is_not_a_crash() {
        let mut h = harness();
        let (group, object) = h.register(true).await;

        h.activator.activate(object, false).await.unwrap();
        let worker = h.next_worker().await;

        assert!(h
            .activator
            .group_became_inactive(group, worker.handoff.incarnation)
            .await
            .unwrap());
        worker
            .exit
            .send(ExitStatus {
                pid: None,
                code: Some(0),
                signal: None,
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.group_state(group).await, GroupState::Inactive);
        assert_eq!(h.launches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unregister_leaves_worker_running() {
        let mut h = harness();
        let (group, object) = h.register(false).await;

        h.activator.activate(object, false).await.unwrap();
        let mut worker = h.next_worker().await;

        h.activator.unregister_group(group).await.unwrap();
        assert!(worker.kill.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_restart_services_activates_flagged_objects() {
        let mut h = harness();
        h.register(true).await;
        h.register(false).await;

        assert_eq!(h.activator.restart_services().await, 1);
        h.next_worker().await;
        assert_eq!(h.launches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_kills_workers_and_rejects_activation() {
        let mut h = harness();
        let (group, object) = h.register(false).await;

        h.activator.activate(object, false).await.unwrap();
        let mut worker = h.next_worker().await;

        h.activator.shutdown().await;
        assert!(worker.kill.try_recv().is_ok());
        assert_eq!(h.group_state(group).await, GroupState::Inactive);
        assert_matches!(h.activator.activate(object, false).await, Err(Error::ShuttingDown));
    }

    /// Holds every launch until the test releases it.
    struct GatedLauncher {
        entered: mpsc::UnboundedSender<()>,
        release: Semaphore,
        kills: Mutex<Vec<oneshot::Receiver<()>>>,
    }

    #[async_trait]
    impl WorkerLauncher for GatedLauncher {
        async fn launch(&self, _spec: &LaunchSpec, _handoff: &Handoff) -> Result<WorkerProcess> {
            let _ = self.entered.send(());
            self.release.acquire().await.unwrap().forget();

            let (kill_tx, kill_rx) = oneshot::channel();
            let (_exit_tx, exit_rx) = oneshot::channel();
            self.kills.lock().unwrap().push(kill_rx);
            Ok(WorkerProcess::new(None, kill_tx, exit_rx))
        }
    }

    #[tokio::test]
    async fn test_shutdown_during_launch_kills_new_worker() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::open(dir.path(), 50).unwrap();
        let (entered_tx, mut entered) = mpsc::unbounded_channel();
        let launcher = Arc::new(GatedLauncher {
            entered: entered_tx,
            release: Semaphore::new(0),
            kills: Mutex::new(Vec::new()),
        });
        let defaults = WorkerDefaults {
            program: PathBuf::from("activd-worker"),
            options: Vec::new(),
            control_socket: dir.path().join("control.sock"),
            runtime_dir: dir.path().join("run"),
        };
        let (supervisor, exits) =
            Supervisor::new(launcher.clone(), defaults, settings(Duration::from_secs(5)));
        let activator = Activator::new(registry, supervisor, exits, Arc::new(NoopMonitor));

        let group = activator
            .register_group(GroupDescriptor::new("Group"))
            .await
            .unwrap();
        let object = activator
            .register_object(ObjectDescriptor::new(group, "Counter"))
            .await
            .unwrap();

        let pending = {
            let activator = Arc::clone(&activator);
            tokio::spawn(async move { activator.activate(object, false).await })
        };
        entered.recv().await.unwrap();

        activator.shutdown().await;
        launcher.release.add_permits(1);

        let result = tokio::time::timeout(Duration::from_secs(5), pending)
            .await
            .expect("activation did not finish")
            .unwrap();
        assert_matches!(result, Err(Error::ShuttingDown));

        let mut kill = launcher.kills.lock().unwrap().pop().unwrap();
        assert!(kill.try_recv().is_ok());

        let (_, info) = activator.registry().group(group).await.unwrap();
        assert_eq!(info.pid().await, None);
        assert!(!info.is_active().await);
    }

    #[tokio::test]
    async fn test_status_reports_groups() {
        let h = harness();
        let (group, object) = h.register(false).await;
        h.register(false).await;

        h.activator.activate(object, false).await.unwrap();

        let status = h.activator.status().await;
        assert_eq!(status.len(), 2);
        let active = status.iter().find(|s| s.group_id == group).unwrap();
        assert_eq!(active.state, GroupState::Active);
        assert_eq!(active.incarnation, 1);
        assert_eq!(active.objects, 1);
        assert_eq!(active.active_objects, 1);
        assert!(active.started_at.is_some());
    }
}

mod monitoring {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_monitor_sees_transitions() {
        let mut h = harness();
        let (group, object) = h.register(false).await;

        h.activator.activate(object, false).await.unwrap();
        let worker = h.next_worker().await;
        worker.exit.send(crashed()).unwrap();
        h.wait_for_state(group, GroupState::Inactive).await;
        h.activator.unregister_group(group).await.unwrap();

        assert_eq!(
            h.monitor.events(),
            vec![
                format!("group_registered {}", group),
                format!("object_registered {}", object),
                format!("group_activated {} 1", group),
                format!("object_activated {}", object),
                format!("object_deactivated {}", object),
                format!("group_deactivated {}", group),
                format!("object_unregistered {}", object),
                format!("group_unregistered {}", group),
            ]
        );
    }
}
