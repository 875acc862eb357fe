//! Control socket for talking to a running daemon.
//!
//! Clients (the `activd` CLI) and workers (their callbacks) both speak one
//! JSON document per line over a Unix domain socket: one command in, one
//! response out, then the connection is closed.

use crate::activation::Activator;
use crate::descriptor::{GroupDescriptor, GroupStatus, Handle, ObjectDescriptor};
use crate::error::{Error, ErrorKind, Result};
use crate::id::{GroupId, ObjectId};
use crate::instantiator::SocketInstantiator;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

/// Commands accepted on the control socket
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlCommand {
    /// Register a group
    RegisterGroup { descriptor: GroupDescriptor },
    /// Remove a group and its objects
    UnregisterGroup { group_id: GroupId },
    /// Read a group descriptor
    GetGroupDescriptor { group_id: GroupId },
    /// Replace a group descriptor
    SetGroupDescriptor {
        group_id: GroupId,
        descriptor: GroupDescriptor,
    },
    /// Register an object
    RegisterObject { descriptor: ObjectDescriptor },
    /// Remove an object
    UnregisterObject { object_id: ObjectId },
    /// Read an object descriptor
    GetObjectDescriptor { object_id: ObjectId },
    /// Replace an object descriptor
    SetObjectDescriptor {
        object_id: ObjectId,
        descriptor: ObjectDescriptor,
    },
    /// Get a live handle for an object
    Activate { object_id: ObjectId, force: bool },
    /// Report on every group
    Status,
    /// Stop all workers and exit
    Shutdown,
    /// Ping to check if the daemon is responding
    Ping,
    /// Worker callback: serving on `endpoint`
    GroupBecameActive {
        group_id: GroupId,
        endpoint: PathBuf,
        incarnation: u64,
    },
    /// Worker callback: about to exit
    GroupBecameInactive { group_id: GroupId, incarnation: u64 },
    /// Worker callback: object instantiated
    ObjectBecameActive { object_id: ObjectId },
    /// Worker callback: object dropped
    ObjectBecameInactive { object_id: ObjectId },
}

/// Responses from the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlResponse {
    /// Command succeeded with nothing to return
    Ok,
    GroupId { group_id: GroupId },
    ObjectId { object_id: ObjectId },
    GroupDescriptor { descriptor: GroupDescriptor },
    ObjectDescriptor { descriptor: ObjectDescriptor },
    Handle { handle: Handle },
    Status { groups: Vec<GroupStatus> },
    /// Pong response
    Pong,
    /// Command failed
    Error { kind: ErrorKind, message: String },
}

impl From<&Error> for ControlResponse {
    fn from(error: &Error) -> Self {
        ControlResponse::Error {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

impl ControlResponse {
    /// Turn an `Error` response back into an [`Error`].
    fn into_error(self) -> Error {
        match self {
            ControlResponse::Error { kind, message } => Error::Remote { kind, message },
            other => Error::Other(format!("Unexpected response: {:?}", other)),
        }
    }
}

/// Run one command against the daemon.
pub async fn dispatch(activator: &Arc<Activator>, command: ControlCommand) -> Result<ControlResponse> {
    let response = match command {
        ControlCommand::RegisterGroup { descriptor } => ControlResponse::GroupId {
            group_id: activator.register_group(descriptor).await?,
        },
        ControlCommand::UnregisterGroup { group_id } => {
            activator.unregister_group(group_id).await?;
            ControlResponse::Ok
        }
        ControlCommand::GetGroupDescriptor { group_id } => ControlResponse::GroupDescriptor {
            descriptor: activator.group_descriptor(group_id).await?,
        },
        ControlCommand::SetGroupDescriptor {
            group_id,
            descriptor,
        } => ControlResponse::GroupDescriptor {
            descriptor: activator.set_group_descriptor(group_id, descriptor).await?,
        },
        ControlCommand::RegisterObject { descriptor } => ControlResponse::ObjectId {
            object_id: activator.register_object(descriptor).await?,
        },
        ControlCommand::UnregisterObject { object_id } => {
            activator.unregister_object(object_id).await?;
            ControlResponse::Ok
        }
        ControlCommand::GetObjectDescriptor { object_id } => ControlResponse::ObjectDescriptor {
            descriptor: activator.object_descriptor(object_id).await?,
        },
        ControlCommand::SetObjectDescriptor {
            object_id,
            descriptor,
        } => ControlResponse::ObjectDescriptor {
            descriptor: activator.set_object_descriptor(object_id, descriptor).await?,
        },
        ControlCommand::Activate { object_id, force } => ControlResponse::Handle {
            handle: activator.activate(object_id, force).await?,
        },
        ControlCommand::Status => ControlResponse::Status {
            groups: activator.status().await,
        },
        ControlCommand::Shutdown => {
            activator.shutdown().await;
            ControlResponse::Ok
        }
        ControlCommand::Ping => ControlResponse::Pong,
        ControlCommand::GroupBecameActive {
            group_id,
            endpoint,
            incarnation,
        } => {
            let instantiator = Arc::new(SocketInstantiator::new(endpoint));
            activator
                .group_became_active(group_id, instantiator, incarnation)
                .await?;
            ControlResponse::Ok
        }
        ControlCommand::GroupBecameInactive {
            group_id,
            incarnation,
        } => {
            activator.group_became_inactive(group_id, incarnation).await?;
            ControlResponse::Ok
        }
        ControlCommand::ObjectBecameActive { object_id } => {
            activator.object_became_active(object_id).await?;
            ControlResponse::Ok
        }
        ControlCommand::ObjectBecameInactive { object_id } => {
            activator.object_became_inactive(object_id).await?;
            ControlResponse::Ok
        }
    };
    Ok(response)
}

/// Control socket server (runs in the daemon)
pub struct ControlServer {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
}

impl ControlServer {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            listener: None,
        }
    }

    /// Start listening for connections
    pub async fn start(&mut self) -> Result<()> {
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Remove a socket left behind by an unclean exit
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        info!(path = %self.socket_path.display(), "Control socket listening");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o660);
            std::fs::set_permissions(&self.socket_path, permissions)?;
        }

        self.listener = Some(listener);
        Ok(())
    }

    /// Accept a single connection
    pub async fn accept(&self) -> Result<UnixStream> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| Error::Other("Control server not started".to_string()))?;

        let (stream, _addr) = listener.accept().await?;
        debug!("Accepted control connection");
        Ok(stream)
    }

    /// Read a command from a stream
    pub async fn read_command(stream: &mut UnixStream) -> Result<ControlCommand> {
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(Error::Other("Connection closed before a command".to_string()));
        }

        let command: ControlCommand = serde_json::from_str(line.trim())
            .map_err(|e| Error::Other(format!("Failed to parse command: {}", e)))?;

        debug!(command = ?command, "Received control command");
        Ok(command)
    }

    /// Write a response to a stream
    pub async fn write_response(stream: &mut UnixStream, response: &ControlResponse) -> Result<()> {
        let json = serde_json::to_string(response)?;

        stream.write_all(json.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;

        debug!(response = ?response, "Sent control response");
        Ok(())
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        if self.listener.is_some() && self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(error = %e, "Failed to remove control socket");
            }
        }
    }
}

/// Control socket client (used by the CLI and by workers)
#[derive(Debug, Clone)]
pub struct ControlClient {
    socket_path: PathBuf,
}

impl ControlClient {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    /// Check if the control socket exists
    pub fn is_available(&self) -> bool {
        self.socket_path.exists()
    }

    /// Connect to the daemon
    pub async fn connect(&self) -> Result<UnixStream> {
        if !self.socket_path.exists() {
            return Err(Error::Other(format!(
                "Control socket not found at {}. Is the daemon running?",
                self.socket_path.display()
            )));
        }

        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            Error::Other(format!(
                "Failed to connect to control socket: {}. Is the daemon running?",
                e
            ))
        })?;

        debug!("Connected to control socket");
        Ok(stream)
    }

    /// Send a command and receive a response
    pub async fn send_command(&self, command: ControlCommand) -> Result<ControlResponse> {
        let mut stream = self.connect().await?;

        let json = serde_json::to_string(&command)?;
        stream.write_all(json.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;

        let mut reader = BufReader::new(&mut stream);
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(Error::Other("Daemon closed the connection".to_string()));
        }

        let response: ControlResponse = serde_json::from_str(line.trim())
            .map_err(|e| Error::Other(format!("Failed to parse response: {}", e)))?;

        Ok(response)
    }

    /// Send a command that has nothing to return
    async fn send_ok(&self, command: ControlCommand) -> Result<()> {
        match self.send_command(command).await? {
            ControlResponse::Ok => Ok(()),
            other => Err(other.into_error()),
        }
    }

    pub async fn register_group(&self, descriptor: GroupDescriptor) -> Result<GroupId> {
        match self
            .send_command(ControlCommand::RegisterGroup { descriptor })
            .await?
        {
            ControlResponse::GroupId { group_id } => Ok(group_id),
            other => Err(other.into_error()),
        }
    }

    pub async fn unregister_group(&self, group_id: GroupId) -> Result<()> {
        self.send_ok(ControlCommand::UnregisterGroup { group_id })
            .await
    }

    pub async fn group_descriptor(&self, group_id: GroupId) -> Result<GroupDescriptor> {
        match self
            .send_command(ControlCommand::GetGroupDescriptor { group_id })
            .await?
        {
            ControlResponse::GroupDescriptor { descriptor } => Ok(descriptor),
            other => Err(other.into_error()),
        }
    }

    pub async fn set_group_descriptor(
        &self,
        group_id: GroupId,
        descriptor: GroupDescriptor,
    ) -> Result<GroupDescriptor> {
        match self
            .send_command(ControlCommand::SetGroupDescriptor {
                group_id,
                descriptor,
            })
            .await?
        {
            ControlResponse::GroupDescriptor { descriptor } => Ok(descriptor),
            other => Err(other.into_error()),
        }
    }

    pub async fn register_object(&self, descriptor: ObjectDescriptor) -> Result<ObjectId> {
        match self
            .send_command(ControlCommand::RegisterObject { descriptor })
            .await?
        {
            ControlResponse::ObjectId { object_id } => Ok(object_id),
            other => Err(other.into_error()),
        }
    }

    pub async fn unregister_object(&self, object_id: ObjectId) -> Result<()> {
        self.send_ok(ControlCommand::UnregisterObject { object_id })
            .await
    }

    pub async fn object_descriptor(&self, object_id: ObjectId) -> Result<ObjectDescriptor> {
        match self
            .send_command(ControlCommand::GetObjectDescriptor { object_id })
            .await?
        {
            ControlResponse::ObjectDescriptor { descriptor } => Ok(descriptor),
            other => Err(other.into_error()),
        }
    }

    pub async fn set_object_descriptor(
        &self,
        object_id: ObjectId,
        descriptor: ObjectDescriptor,
    ) -> Result<ObjectDescriptor> {
        match self
            .send_command(ControlCommand::SetObjectDescriptor {
                object_id,
                descriptor,
            })
            .await?
        {
            ControlResponse::ObjectDescriptor { descriptor } => Ok(descriptor),
            other => Err(other.into_error()),
        }
    }

    pub async fn activate(&self, object_id: ObjectId, force: bool) -> Result<Handle> {
        match self
            .send_command(ControlCommand::Activate { object_id, force })
            .await?
        {
            ControlResponse::Handle { handle } => Ok(handle),
            other => Err(other.into_error()),
        }
    }

    pub async fn status(&self) -> Result<Vec<GroupStatus>> {
        match self.send_command(ControlCommand::Status).await? {
            ControlResponse::Status { groups } => Ok(groups),
            other => Err(other.into_error()),
        }
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send_ok(ControlCommand::Shutdown).await
    }

    pub async fn ping(&self) -> Result<bool> {
        match self.send_command(ControlCommand::Ping).await {
            Ok(ControlResponse::Pong) => Ok(true),
            Ok(_) => Ok(false),
            Err(_) => Ok(false),
        }
    }

    pub async fn group_became_active(
        &self,
        group_id: GroupId,
        endpoint: impl AsRef<Path>,
        incarnation: u64,
    ) -> Result<()> {
        self.send_ok(ControlCommand::GroupBecameActive {
            group_id,
            endpoint: endpoint.as_ref().to_path_buf(),
            incarnation,
        })
        .await
    }

    pub async fn group_became_inactive(&self, group_id: GroupId, incarnation: u64) -> Result<()> {
        self.send_ok(ControlCommand::GroupBecameInactive {
            group_id,
            incarnation,
        })
        .await
    }

    pub async fn object_became_active(&self, object_id: ObjectId) -> Result<()> {
        self.send_ok(ControlCommand::ObjectBecameActive { object_id })
            .await
    }

    pub async fn object_became_inactive(&self, object_id: ObjectId) -> Result<()> {
        self.send_ok(ControlCommand::ObjectBecameInactive { object_id })
            .await
    }
}
