//! Default worker runtime.
//!
//! A worker hosts the objects of one group. It learns who it is from the
//! handoff on stdin, serves `Create` requests on its own socket, and reports
//! its lifecycle back to the daemon over the control socket.

use crate::control::ControlClient;
use crate::descriptor::{Handle, ObjectDescriptor};
use crate::error::{Error, Result};
use crate::id::ObjectId;
use crate::instantiator::{WorkerRequest, WorkerResponse};
use crate::launcher::Handoff;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Constructor for one class of object. Returns the instance's reference.
pub type Factory = Box<dyn Fn(ObjectId, &ObjectDescriptor) -> Result<String> + Send + Sync>;

/// Maps class names to constructors.
#[derive(Default)]
pub struct FactoryRegistry {
    factories: HashMap<String, Factory>,
    fallback: Option<Factory>,
}

impl FactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the constructor for `class_name`, replacing any earlier one.
    pub fn register<F>(&mut self, class_name: impl Into<String>, factory: F)
    where
        F: Fn(ObjectId, &ObjectDescriptor) -> Result<String> + Send + Sync + 'static,
    {
        self.factories.insert(class_name.into(), Box::new(factory));
    }

    /// Constructor used for classes with no registered factory.
    pub fn with_fallback<F>(mut self, factory: F) -> Self
    where
        F: Fn(ObjectId, &ObjectDescriptor) -> Result<String> + Send + Sync + 'static,
    {
        self.fallback = Some(Box::new(factory));
        self
    }

    pub fn contains(&self, class_name: &str) -> bool {
        self.factories.contains_key(class_name)
    }

    pub fn create(&self, object_id: ObjectId, descriptor: &ObjectDescriptor) -> Result<String> {
        let factory = self
            .factories
            .get(&descriptor.class_name)
            .or(self.fallback.as_ref())
            .ok_or_else(|| {
                Error::Instantiation(format!("no factory for class {}", descriptor.class_name))
            })?;
        factory(object_id, descriptor)
    }
}

/// Socket path a worker binds for a given handoff.
pub fn socket_path(runtime_dir: &Path, handoff: &Handoff) -> PathBuf {
    runtime_dir.join(format!("{}-{}.sock", handoff.group_id, handoff.incarnation))
}

/// One running worker.
pub struct Worker {
    handoff: Handoff,
    factories: FactoryRegistry,
    daemon: ControlClient,
    socket_path: PathBuf,
    /// Instances created so far, by object
    instances: Mutex<HashMap<ObjectId, Handle>>,
}

impl Worker {
    pub fn new(
        handoff: Handoff,
        factories: FactoryRegistry,
        control_socket: impl AsRef<Path>,
        runtime_dir: impl AsRef<Path>,
    ) -> Self {
        let socket_path = socket_path(runtime_dir.as_ref(), &handoff);
        Self {
            handoff,
            factories,
            daemon: ControlClient::new(control_socket),
            socket_path,
            instances: Mutex::new(HashMap::new()),
        }
    }

    pub fn handoff(&self) -> &Handoff {
        &self.handoff
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Create an object, or return the instance created earlier.
    pub async fn create(&self, object_id: ObjectId, descriptor: &ObjectDescriptor) -> Result<Handle> {
        if descriptor.group_id != self.handoff.group_id {
            return Err(Error::GroupMismatch {
                object: object_id,
                expected: self.handoff.group_id,
                actual: descriptor.group_id,
            });
        }

        let handle = {
            let mut instances = self.instances.lock().await;
            if let Some(handle) = instances.get(&object_id) {
                return Ok(handle.clone());
            }

            let reference = self.factories.create(object_id, descriptor)?;
            let handle = Handle {
                object_id,
                group_id: self.handoff.group_id,
                incarnation: self.handoff.incarnation,
                reference,
            };
            instances.insert(object_id, handle.clone());
            handle
        };

        info!(object = %object_id, class = %descriptor.class_name, "Created object");
        if let Err(e) = self.daemon.object_became_active(object_id).await {
            warn!(object = %object_id, error = %e, "Failed to report object");
        }
        Ok(handle)
    }

    pub async fn handle(&self, request: WorkerRequest) -> WorkerResponse {
        match request {
            WorkerRequest::Create {
                object_id,
                descriptor,
            } => match self.create(object_id, &descriptor).await {
                Ok(handle) => WorkerResponse::Created { handle },
                Err(e) => WorkerResponse::Error {
                    message: e.to_string(),
                },
            },
            WorkerRequest::Ping => WorkerResponse::Pong,
        }
    }

    /// Bind the worker socket, check in with the daemon and serve until
    /// SIGTERM or SIGINT.
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        let listener = self.bind()?;
        let group_id = self.handoff.group_id;
        let incarnation = self.handoff.incarnation;

        self.daemon
            .group_became_active(group_id, &self.socket_path, incarnation)
            .await?;
        info!(group = %group_id, incarnation, socket = %self.socket_path.display(), "Worker active");

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let worker = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(e) = worker.serve_connection(stream).await {
                                debug!(error = %e, "Worker connection failed");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "Failed to accept connection"),
                },

                _ = sigterm.recv() => {
                    info!("Received SIGTERM, stopping worker");
                    break;
                }

                _ = sigint.recv() => {
                    info!("Received SIGINT, stopping worker");
                    break;
                }
            }
        }

        if let Err(e) = self.daemon.group_became_inactive(group_id, incarnation).await {
            warn!(error = %e, "Failed to report shutdown to daemon");
        }
        drop(listener);
        let _ = std::fs::remove_file(&self.socket_path);
        Ok(())
    }

    fn bind(&self) -> Result<UnixListener> {
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }
        Ok(UnixListener::bind(&self.socket_path)?)
    }

    async fn serve_connection(&self, mut stream: UnixStream) -> Result<()> {
        let mut reader = BufReader::new(&mut stream);
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }

        let response = match serde_json::from_str::<WorkerRequest>(line.trim()) {
            Ok(request) => self.handle(request).await,
            Err(e) => WorkerResponse::Error {
                message: format!("Failed to parse request: {}", e),
            },
        };

        let json = serde_json::to_string(&response)?;
        stream.write_all(json.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;
        Ok(())
    }
}
