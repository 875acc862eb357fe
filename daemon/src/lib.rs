//! Activation daemon.
//!
//! Keeps a durable registry of activatable objects and the groups that host
//! them, starts one worker process per group on demand, and hands out
//! handles to live object instances. It handles:
//!
//! - Registration of groups and objects, journaled to disk and restored on start
//! - Single-flight activation of objects
//! - Worker process supervision with incarnation-checked callbacks
//! - Restart of a group whose worker died or stopped answering
//! - A JSON-over-Unix-socket control interface
//!
//! # Architecture
//!
//! - **Registry**: descriptors plus runtime records, backed by the journal
//! - **Supervisor**: spawns workers and waits for them to check in
//! - **Activator**: the activation protocol and worker callbacks
//! - **Daemon**: control socket and signal handling
//! - **Worker**: the default worker runtime
//!
//! # Example
//!
//! ```no_run
//! use activd_daemon::{Daemon, DaemonConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let daemon = Daemon::new(DaemonConfig::default())?;
//!     daemon.run().await?;
//!     Ok(())
//! }
//! ```

pub mod activation;
pub mod config;
pub mod control;
pub mod daemon;
pub mod descriptor;
pub mod error;
pub mod id;
pub mod instantiator;
pub mod journal;
pub mod launcher;
pub mod monitor;
pub mod registry;
pub mod supervisor;
pub mod worker;

// Re-export main types
pub use activation::Activator;
pub use config::DaemonConfig;
pub use control::{ControlClient, ControlCommand, ControlResponse, ControlServer};
pub use daemon::Daemon;
pub use descriptor::{
    CommandEnvironment, GroupDescriptor, GroupState, GroupStatus, Handle, ObjectDescriptor,
};
pub use error::{Error, ErrorKind, Result};
pub use id::{GroupId, ObjectId};
pub use instantiator::{Instantiator, SocketInstantiator};
pub use launcher::{ExitStatus, Handoff, LaunchSpec, ProcessLauncher, WorkerDefaults, WorkerLauncher, WorkerProcess};
pub use monitor::{LogMonitor, Monitor, NoopMonitor};
pub use registry::Registry;
pub use supervisor::{Supervisor, SupervisorSettings};
pub use worker::{FactoryRegistry, Worker};
