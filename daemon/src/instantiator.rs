//! Instantiation capability exposed by a live worker.
//!
//! The daemon never knows how a worker creates objects; it only holds an
//! [`Instantiator`] for each live group and asks it for instances.

use crate::descriptor::{Handle, ObjectDescriptor};
use crate::error::{Error, Result};
use crate::id::ObjectId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::debug;

/// Capability to create objects inside a worker.
///
/// Implementations report a vanished worker as [`Error::Unreachable`] and a
/// failure of the worker's own construction logic as
/// [`Error::Instantiation`].
#[async_trait]
pub trait Instantiator: Send + Sync {
    /// Create (or look up) the live instance of an object.
    async fn create(&self, object_id: ObjectId, descriptor: &ObjectDescriptor) -> Result<Handle>;
}

/// Requests served on a worker's socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkerRequest {
    /// Instantiate an object
    Create {
        object_id: ObjectId,
        descriptor: ObjectDescriptor,
    },
    /// Liveness check
    Ping,
}

/// Responses from a worker's socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkerResponse {
    /// Object created
    Created { handle: Handle },
    /// Construction failed inside the worker
    Error { message: String },
    /// Pong response
    Pong,
}

/// Instantiator that talks to a worker over its Unix socket.
#[derive(Debug, Clone)]
pub struct SocketInstantiator {
    endpoint: PathBuf,
}

impl SocketInstantiator {
    pub fn new(endpoint: impl AsRef<Path>) -> Self {
        Self {
            endpoint: endpoint.as_ref().to_path_buf(),
        }
    }

    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }

    async fn request(&self, request: &WorkerRequest) -> Result<WorkerResponse> {
        let unreachable = |e: std::io::Error| {
            Error::Unreachable(format!("{}: {}", self.endpoint.display(), e))
        };

        let mut stream = UnixStream::connect(&self.endpoint)
            .await
            .map_err(unreachable)?;

        let json = serde_json::to_string(request)?;
        stream.write_all(json.as_bytes()).await.map_err(unreachable)?;
        stream.write_all(b"\n").await.map_err(unreachable)?;
        stream.flush().await.map_err(unreachable)?;

        let mut reader = BufReader::new(&mut stream);
        let mut line = String::new();
        let read = reader.read_line(&mut line).await.map_err(unreachable)?;
        if read == 0 {
            return Err(Error::Unreachable(format!(
                "{}: connection closed before reply",
                self.endpoint.display()
            )));
        }

        Ok(serde_json::from_str(line.trim())?)
    }

    /// Check that the worker answers.
    pub async fn ping(&self) -> bool {
        matches!(self.request(&WorkerRequest::Ping).await, Ok(WorkerResponse::Pong))
    }
}

#[async_trait]
impl Instantiator for SocketInstantiator {
    async fn create(&self, object_id: ObjectId, descriptor: &ObjectDescriptor) -> Result<Handle> {
        let request = WorkerRequest::Create {
            object_id,
            descriptor: descriptor.clone(),
        };

        match self.request(&request).await? {
            WorkerResponse::Created { handle } => {
                debug!(object = %object_id, reference = %handle.reference, "Worker created object");
                Ok(handle)
            }
            WorkerResponse::Error { message } => Err(Error::Instantiation(message)),
            WorkerResponse::Pong => Err(Error::Other("unexpected pong from worker".to_string())),
        }
    }
}
