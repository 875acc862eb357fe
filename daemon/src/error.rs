//! Error types for the activation daemon.

use crate::id::{GroupId, ObjectId};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Result type alias for daemon operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the activation daemon.
#[derive(Error, Debug)]
pub enum Error {
    /// No group registered under this id
    #[error("Unknown group: {0}")]
    UnknownGroup(GroupId),

    /// No object registered under this id
    #[error("Unknown object: {0}")]
    UnknownObject(ObjectId),

    /// Group id already present in the registry
    #[error("Group already registered: {0}")]
    AlreadyRegistered(GroupId),

    /// Group reported active while the registry already holds it as active
    #[error("Group already active: {0}")]
    AlreadyActive(GroupId),

    /// Object descriptor names a different group than the one it belongs to
    #[error("Object {object} belongs to group {expected}, not {actual}")]
    GroupMismatch {
        object: ObjectId,
        expected: GroupId,
        actual: GroupId,
    },

    /// Activation could not be completed
    #[error("Activation failed for {target}: {cause}")]
    ActivationFailed {
        target: String,
        #[source]
        cause: Box<Error>,
    },

    /// Worker did not check in within the start timeout
    #[error("Group {group} did not become active within {timeout:?}")]
    StartTimeout { group: GroupId, timeout: Duration },

    /// Process spawn error
    #[error("Failed to spawn process: {0}")]
    ProcessSpawnFailed(String),

    /// The worker could not be reached
    #[error("Worker unreachable: {0}")]
    Unreachable(String),

    /// The worker's own instantiation logic failed
    #[error("Instantiation failed: {0}")]
    Instantiation(String),

    /// Journal write failed during normal operation
    #[error("Persistence failure: {0}")]
    Persistence(#[source] std::io::Error),

    /// Daemon is shutting down
    #[error("Daemon is shutting down")]
    ShuttingDown,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Error reported by a remote daemon
    #[error("{kind}: {message}")]
    Remote { kind: ErrorKind, message: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// Nix error
    #[error("System error: {0}")]
    Nix(#[from] nix::Error),

    /// Anything else
    #[error("{0}")]
    Other(String),
}

/// Wire-level classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    UnknownGroup,
    UnknownObject,
    AlreadyRegistered,
    AlreadyActive,
    GroupMismatch,
    ActivationFailed,
    Persistence,
    ShuttingDown,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::UnknownGroup => write!(f, "unknown group"),
            ErrorKind::UnknownObject => write!(f, "unknown object"),
            ErrorKind::AlreadyRegistered => write!(f, "already registered"),
            ErrorKind::AlreadyActive => write!(f, "already active"),
            ErrorKind::GroupMismatch => write!(f, "group mismatch"),
            ErrorKind::ActivationFailed => write!(f, "activation failed"),
            ErrorKind::Persistence => write!(f, "persistence failure"),
            ErrorKind::ShuttingDown => write!(f, "shutting down"),
            ErrorKind::Internal => write!(f, "internal error"),
        }
    }
}

impl Error {
    /// Wrap a lower-level failure as an activation failure.
    pub fn activation_failed(target: impl std::fmt::Display, cause: Error) -> Self {
        match cause {
            // Never double-wrap
            Error::ActivationFailed { .. } => cause,
            cause => Error::ActivationFailed {
                target: target.to_string(),
                cause: Box::new(cause),
            },
        }
    }

    /// Whether this is a connectivity-class failure (the callee is gone).
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Error::Unreachable(_))
    }

    /// Whether the daemon can no longer guarantee durability after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Persistence(_))
    }

    /// Classification used on the control socket.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::UnknownGroup(_) => ErrorKind::UnknownGroup,
            Error::UnknownObject(_) => ErrorKind::UnknownObject,
            Error::AlreadyRegistered(_) => ErrorKind::AlreadyRegistered,
            Error::AlreadyActive(_) => ErrorKind::AlreadyActive,
            Error::GroupMismatch { .. } => ErrorKind::GroupMismatch,
            Error::ActivationFailed { .. }
            | Error::StartTimeout { .. }
            | Error::ProcessSpawnFailed(_)
            | Error::Unreachable(_)
            | Error::Instantiation(_) => ErrorKind::ActivationFailed,
            Error::Persistence(_) => ErrorKind::Persistence,
            Error::ShuttingDown => ErrorKind::ShuttingDown,
            Error::Remote { kind, .. } => *kind,
            _ => ErrorKind::Internal,
        }
    }
}
