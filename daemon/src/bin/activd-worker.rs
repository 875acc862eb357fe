//! Default worker process.
//!
//! Spawned by the activation daemon, one per group. Objects of classes with
//! no registered factory get a generic instance that records its class and
//! initialization data.

use activd_daemon::launcher::{ENV_CONTROL_SOCKET, ENV_RUNTIME_DIR};
use activd_daemon::{FactoryRegistry, Handoff, Worker};
use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // stdout and stderr both end up in the daemon's log
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .init();

    let control_socket = std::env::var_os(ENV_CONTROL_SOCKET)
        .map(PathBuf::from)
        .with_context(|| format!("{} is not set", ENV_CONTROL_SOCKET))?;
    let runtime_dir = std::env::var_os(ENV_RUNTIME_DIR)
        .map(PathBuf::from)
        .with_context(|| format!("{} is not set", ENV_RUNTIME_DIR))?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let handoff = Handoff::read_from(&mut stdin)
        .await
        .context("Failed to read handoff from stdin")?;
    drop(stdin);

    let options: Vec<String> = std::env::args().skip(1).collect();
    info!(
        group = %handoff.group_id,
        class = %handoff.descriptor.class_name,
        incarnation = handoff.incarnation,
        options = ?options,
        "Worker starting"
    );

    let factories = FactoryRegistry::new().with_fallback(|id, descriptor| {
        Ok(match &descriptor.data {
            Some(data) => format!("{}:{}?{}", descriptor.class_name, id, data),
            None => format!("{}:{}", descriptor.class_name, id),
        })
    });

    let worker = Arc::new(Worker::new(handoff, factories, control_socket, runtime_dir));
    worker.serve().await?;
    Ok(())
}
