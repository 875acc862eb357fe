//! Descriptor and status types for groups and objects.

use crate::id::{GroupId, ObjectId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Execution-environment override for a group's worker process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEnvironment {
    /// Program to run instead of the default worker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<PathBuf>,
    /// Extra arguments, appended after the global pass-through options
    #[serde(default)]
    pub options: Vec<String>,
    /// Extra environment variables
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

/// Describes how to bring up a group's worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDescriptor {
    /// Implementation class the worker instantiates itself as
    pub class_name: String,
    /// Where the worker finds the implementation code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Opaque construction data handed to the worker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// Optional command override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_environment: Option<CommandEnvironment>,
    /// Restart the worker when it dies unexpectedly
    #[serde(default)]
    pub restart_on_crash: bool,
}

impl GroupDescriptor {
    /// Create a group descriptor with only a class name.
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            location: None,
            data: None,
            command_environment: None,
            restart_on_crash: false,
        }
    }

    /// Set the code location.
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Set the construction data.
    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Set the command override.
    pub fn with_command_environment(mut self, env: CommandEnvironment) -> Self {
        self.command_environment = Some(env);
        self
    }

    /// Set the restart-on-crash flag.
    pub fn with_restart_on_crash(mut self, restart: bool) -> Self {
        self.restart_on_crash = restart;
        self
    }

    /// Load a group descriptor from a TOML file.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }
}

/// Describes an activatable object and the group that hosts it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectDescriptor {
    /// Owning group
    pub group_id: GroupId,
    /// Implementation class the worker instantiates
    pub class_name: String,
    /// Where the worker finds the implementation code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Opaque construction data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// Activate eagerly when the daemon or the group restarts
    #[serde(default)]
    pub restart: bool,
}

impl ObjectDescriptor {
    /// Create an object descriptor for a group.
    pub fn new(group_id: GroupId, class_name: impl Into<String>) -> Self {
        Self {
            group_id,
            class_name: class_name.into(),
            location: None,
            data: None,
            restart: false,
        }
    }

    /// Set the code location.
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Set the construction data.
    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Set the restart flag.
    pub fn with_restart(mut self, restart: bool) -> Self {
        self.restart = restart;
        self
    }

    /// Load an object descriptor from a TOML file.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }
}

/// Result of a successful activation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handle {
    /// Activated object
    pub object_id: ObjectId,
    /// Group hosting the instance
    pub group_id: GroupId,
    /// Worker incarnation that created the instance
    pub incarnation: u64,
    /// Worker-defined reference to the live instance
    pub reference: String,
}

/// Lifecycle state of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupState {
    /// Registered, never started
    Registered,
    /// Worker spawned, waiting for it to check in
    Starting,
    /// Worker is live
    Active,
    /// Worker was live and is gone
    Inactive,
}

impl std::fmt::Display for GroupState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GroupState::Registered => write!(f, "registered"),
            GroupState::Starting => write!(f, "starting"),
            GroupState::Active => write!(f, "active"),
            GroupState::Inactive => write!(f, "inactive"),
        }
    }
}

/// Group status information for display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupStatus {
    /// Group id
    pub group_id: GroupId,
    /// Implementation class
    pub class_name: String,
    /// Current state
    pub state: GroupState,
    /// Current incarnation
    pub incarnation: u64,
    /// Worker PID
    pub pid: Option<u32>,
    /// Number of registered objects
    pub objects: usize,
    /// Number of objects with a live instance
    pub active_objects: usize,
    /// When the current worker became active
    pub started_at: Option<DateTime<Utc>>,
}
