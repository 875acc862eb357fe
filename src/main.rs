//! Activation daemon command-line front end.
//!
//! `activd run` starts the daemon; every other subcommand talks to a running
//! daemon over its control socket.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use daemon::config::DEFAULT_CONTROL_SOCKET;
use daemon::{
    CommandEnvironment, ControlClient, Daemon, DaemonConfig, GroupDescriptor, GroupId, GroupStatus,
    ObjectDescriptor, ObjectId,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Activation daemon - starts object groups in worker processes on demand
#[derive(Parser, Debug)]
#[command(name = "activd", author, version, about, long_about = None)]
struct Cli {
    /// Control socket of the daemon
    #[arg(long, env = "ACTIVD_SOCKET", global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the daemon (default)
    Run(RunArgs),
    /// Ask a running daemon to stop its workers and exit
    Stop,
    /// Check whether the daemon is responding
    Ping,
    /// Show every group and its worker
    Status,
    /// Register a group
    RegisterGroup(GroupArgs),
    /// Register an object with a group
    RegisterObject {
        /// Owning group
        group: GroupId,
        #[command(flatten)]
        object: ObjectArgs,
    },
    /// Remove a group and all its objects
    UnregisterGroup { group: GroupId },
    /// Remove an object
    UnregisterObject { object: ObjectId },
    /// Print a group descriptor
    DescribeGroup { group: GroupId },
    /// Print an object descriptor
    DescribeObject { object: ObjectId },
    /// Replace a group descriptor
    SetGroup {
        group: GroupId,
        #[command(flatten)]
        descriptor: GroupArgs,
    },
    /// Replace an object descriptor
    SetObject {
        object: ObjectId,
        /// Owning group (must be the group the object was registered with)
        group: GroupId,
        #[command(flatten)]
        descriptor: ObjectArgs,
    },
    /// Activate an object and print its handle
    Activate {
        object: ObjectId,
        /// Ask the worker again even if a live handle is cached
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for the registry journal
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Log every group and object transition
    #[arg(long)]
    monitor: bool,

    /// Worker program for groups without a command override
    #[arg(long)]
    worker_program: Option<PathBuf>,

    /// Option passed verbatim to every worker (repeatable)
    #[arg(long = "worker-option", allow_hyphen_values = true)]
    worker_options: Vec<String>,
}

#[derive(Args, Debug)]
struct GroupArgs {
    /// Read the descriptor from a TOML file
    #[arg(long, conflicts_with = "class")]
    file: Option<PathBuf>,

    /// Class name of the group
    #[arg(long)]
    class: Option<String>,

    /// Where the class can be found
    #[arg(long)]
    location: Option<String>,

    /// Initialization data handed to the worker
    #[arg(long)]
    data: Option<String>,

    /// Worker program override
    #[arg(long)]
    command: Option<PathBuf>,

    /// Extra worker option (repeatable)
    #[arg(long = "option", allow_hyphen_values = true)]
    options: Vec<String>,

    /// Worker environment variable as KEY=VALUE (repeatable)
    #[arg(long = "env")]
    environment: Vec<String>,

    /// Restart the group when its worker crashes
    #[arg(long)]
    restart_on_crash: bool,
}

#[derive(Args, Debug)]
struct ObjectArgs {
    /// Read the descriptor from a TOML file
    #[arg(long, conflicts_with = "class")]
    file: Option<PathBuf>,

    /// Class name of the object
    #[arg(long)]
    class: Option<String>,

    /// Where the class can be found
    #[arg(long)]
    location: Option<String>,

    /// Initialization data for the object
    #[arg(long)]
    data: Option<String>,

    /// Activate the object whenever the daemon starts
    #[arg(long)]
    restart: bool,
}

impl GroupArgs {
    fn into_descriptor(self) -> Result<GroupDescriptor> {
        if let Some(file) = self.file {
            return GroupDescriptor::from_file(&file)
                .with_context(|| format!("Failed to read {}", file.display()));
        }

        let class = self.class.context("--class or --file is required")?;
        let mut descriptor = GroupDescriptor::new(class).with_restart_on_crash(self.restart_on_crash);
        if let Some(location) = self.location {
            descriptor = descriptor.with_location(location);
        }
        if let Some(data) = self.data {
            descriptor = descriptor.with_data(data);
        }

        if self.command.is_some() || !self.options.is_empty() || !self.environment.is_empty() {
            let mut environment = BTreeMap::new();
            for pair in &self.environment {
                let Some((key, value)) = pair.split_once('=') else {
                    bail!("Invalid environment entry {:?}, expected KEY=VALUE", pair);
                };
                environment.insert(key.to_string(), value.to_string());
            }
            descriptor = descriptor.with_command_environment(CommandEnvironment {
                command: self.command,
                options: self.options,
                environment,
            });
        }
        Ok(descriptor)
    }
}

impl ObjectArgs {
    fn into_descriptor(self, group: GroupId) -> Result<ObjectDescriptor> {
        if let Some(file) = self.file {
            let descriptor = ObjectDescriptor::from_file(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            if descriptor.group_id != group {
                bail!(
                    "{} names group {}, not {}",
                    file.display(),
                    descriptor.group_id,
                    group
                );
            }
            return Ok(descriptor);
        }

        let class = self.class.context("--class or --file is required")?;
        let mut descriptor = ObjectDescriptor::new(group, class).with_restart(self.restart);
        if let Some(location) = self.location {
            descriptor = descriptor.with_location(location);
        }
        if let Some(data) = self.data {
            descriptor = descriptor.with_data(data);
        }
        Ok(descriptor)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let socket = cli.socket.clone();
    let client = || ControlClient::new(socket.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_CONTROL_SOCKET)));

    match cli.command {
        None => run_daemon(cli.socket, RunArgs::default()).await?,
        Some(Commands::Run(args)) => run_daemon(cli.socket, args).await?,

        Some(Commands::Stop) => {
            client().shutdown().await?;
            println!("Daemon stopping");
        }

        Some(Commands::Ping) => {
            if client().ping().await? {
                println!("pong");
            } else {
                bail!("Daemon is not responding");
            }
        }

        Some(Commands::Status) => {
            let groups = client().status().await?;
            if groups.is_empty() {
                println!("No groups registered");
            }
            for status in &groups {
                print_status(status);
                println!();
            }
        }

        Some(Commands::RegisterGroup(args)) => {
            let id = client().register_group(args.into_descriptor()?).await?;
            println!("{}", id);
        }

        Some(Commands::RegisterObject { group, object }) => {
            let id = client()
                .register_object(object.into_descriptor(group)?)
                .await?;
            println!("{}", id);
        }

        Some(Commands::UnregisterGroup { group }) => {
            client().unregister_group(group).await?;
            println!("Unregistered group {}", group);
        }

        Some(Commands::UnregisterObject { object }) => {
            client().unregister_object(object).await?;
            println!("Unregistered object {}", object);
        }

        Some(Commands::DescribeGroup { group }) => {
            let descriptor = client().group_descriptor(group).await?;
            println!("{}", serde_json::to_string_pretty(&descriptor)?);
        }

        Some(Commands::DescribeObject { object }) => {
            let descriptor = client().object_descriptor(object).await?;
            println!("{}", serde_json::to_string_pretty(&descriptor)?);
        }

        Some(Commands::SetGroup { group, descriptor }) => {
            let old = client()
                .set_group_descriptor(group, descriptor.into_descriptor()?)
                .await?;
            println!("{}", serde_json::to_string_pretty(&old)?);
        }

        Some(Commands::SetObject {
            object,
            group,
            descriptor,
        }) => {
            let old = client()
                .set_object_descriptor(object, descriptor.into_descriptor(group)?)
                .await?;
            println!("{}", serde_json::to_string_pretty(&old)?);
        }

        Some(Commands::Activate { object, force }) => {
            let handle = client().activate(object, force).await?;
            println!("{}", serde_json::to_string_pretty(&handle)?);
        }
    }

    Ok(())
}

/// Run the daemon in the foreground.
async fn run_daemon(socket: Option<PathBuf>, args: RunArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => DaemonConfig::from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => DaemonConfig::default(),
    };

    // Flags win over the file
    if let Some(socket) = socket {
        config.socket_path = socket;
    }
    if let Some(state_dir) = args.state_dir {
        config.state_dir = state_dir;
    }
    if args.monitor {
        config.monitor = true;
    }
    if let Some(program) = args.worker_program {
        config.worker_program = Some(program);
    }
    config.worker_options.extend(args.worker_options);

    info!(
        socket = %config.socket_path.display(),
        state_dir = %config.state_dir.display(),
        "Starting activation daemon"
    );

    let daemon = Daemon::new(config)?;
    daemon.run().await?;
    Ok(())
}

fn print_status(status: &GroupStatus) {
    println!("● {} ({})", status.group_id, status.class_name);
    println!("   State: {}", status.state);
    println!("   Incarnation: {}", status.incarnation);

    if let Some(pid) = status.pid {
        println!("   PID: {}", pid);
    }
    if let Some(started_at) = status.started_at {
        println!("   Active since: {}", started_at.to_rfc3339());
    }
    println!(
        "   Objects: {} ({} active)",
        status.objects, status.active_objects
    );
}
