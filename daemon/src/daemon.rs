//! Daemon core: wiring and the main event loop.

use crate::activation::Activator;
use crate::config::DaemonConfig;
use crate::control::{dispatch, ControlCommand, ControlResponse, ControlServer};
use crate::error::{Error, Result};
use crate::launcher::{ProcessLauncher, WorkerLauncher};
use crate::monitor::{LogMonitor, Monitor, NoopMonitor};
use crate::registry::Registry;
use crate::supervisor::Supervisor;
use std::sync::Arc;
use tokio::net::UnixStream;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// The activation daemon.
pub struct Daemon {
    config: DaemonConfig,
    activator: Arc<Activator>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Daemon {
    /// Restore the registry and build a daemon that spawns real worker
    /// processes. Must be called from within a tokio runtime.
    pub fn new(config: DaemonConfig) -> Result<Self> {
        let launcher = Arc::new(ProcessLauncher::new(config.shutdown_grace));
        let monitor: Arc<dyn Monitor> = if config.monitor {
            Arc::new(LogMonitor)
        } else {
            Arc::new(NoopMonitor)
        };
        Self::with_launcher(config, launcher, monitor)
    }

    /// Build a daemon around a custom launcher and monitor.
    pub fn with_launcher(
        config: DaemonConfig,
        launcher: Arc<dyn WorkerLauncher>,
        monitor: Arc<dyn Monitor>,
    ) -> Result<Self> {
        config.validate()?;

        let registry = Registry::open(&config.state_dir, config.snapshot_interval)?;
        let (supervisor, exits) = Supervisor::new(
            launcher,
            config.worker_defaults(),
            config.supervisor_settings(),
        );
        let activator = Activator::new(registry, supervisor, exits, monitor);
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            activator,
            shutdown_tx,
        })
    }

    pub fn activator(&self) -> Arc<Activator> {
        Arc::clone(&self.activator)
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// Ask a running event loop to stop.
    pub fn request_shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .map_err(|_| Error::Other("Daemon is not running".to_string()))?;
        Ok(())
    }

    /// Serve the control socket until shutdown.
    pub async fn run(&self) -> Result<()> {
        std::fs::create_dir_all(&self.config.runtime_dir)?;

        let mut server = ControlServer::new(&self.config.socket_path);
        server.start().await?;

        // Bring flagged objects back without holding up the socket
        let activator = Arc::clone(&self.activator);
        tokio::spawn(async move {
            let started = activator.restart_services().await;
            debug!(started, "Restart of flagged objects finished");
        });

        self.event_loop(&server).await
    }

    async fn event_loop(&self, server: &ControlServer) -> Result<()> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        info!(socket = %server.socket_path().display(), "Activation daemon ready");

        loop {
            tokio::select! {
                accepted = server.accept() => match accepted {
                    Ok(stream) => {
                        let activator = Arc::clone(&self.activator);
                        let shutdown_tx = self.shutdown_tx.clone();
                        tokio::spawn(handle_connection(activator, stream, shutdown_tx));
                    }
                    Err(e) => warn!(error = %e, "Failed to accept control connection"),
                },

                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down");
                    break;
                }

                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down");
                    break;
                }

                _ = shutdown_rx.recv() => {
                    info!("Shutdown requested");
                    break;
                }
            }
        }

        self.activator.shutdown().await;
        Ok(())
    }
}

async fn handle_connection(
    activator: Arc<Activator>,
    mut stream: UnixStream,
    shutdown_tx: broadcast::Sender<()>,
) {
    let command = match ControlServer::read_command(&mut stream).await {
        Ok(command) => command,
        Err(e) => {
            debug!(error = %e, "Bad control request");
            let _ = ControlServer::write_response(&mut stream, &ControlResponse::from(&e)).await;
            return;
        }
    };

    let stop = matches!(command, ControlCommand::Shutdown);
    let response = match dispatch(&activator, command).await {
        Ok(response) => response,
        Err(e) if e.is_fatal() => {
            error!(error = %e, "Journal write failed, registry durability lost; exiting");
            let _ = ControlServer::write_response(&mut stream, &ControlResponse::from(&e)).await;
            std::process::exit(1);
        }
        Err(e) => ControlResponse::from(&e),
    };

    if let Err(e) = ControlServer::write_response(&mut stream, &response).await {
        debug!(error = %e, "Client went away before the response");
    }
    if stop {
        let _ = shutdown_tx.send(());
    }
}
