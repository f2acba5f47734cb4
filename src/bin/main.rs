//! container-reconcile CLI

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use container_reconcile::command::SystemRunner;
use container_reconcile::engine::EngineConfig;
use container_reconcile::init::{HostInitAdapter, HostInitConfig};
use container_reconcile::{Action, Controller, DesiredContainerSpec, DockerEngine, RegistryLogin};

#[derive(Parser)]
#[command(name = "container-reconcile")]
#[command(about = "Converge a declared Docker container to the requested state")]
#[command(version)]
struct Cli {
    /// Engine API socket, DOCKER_HOST or the platform default when omitted
    #[arg(long, global = true)]
    docker_host: Option<String>,

    /// Upper bound in seconds for a single engine call
    #[arg(long, global = true, default_value = "60")]
    engine_timeout: u64,

    /// Upper bound in seconds for `wait`, unbounded when omitted
    #[arg(long, global = true)]
    wait_timeout: Option<u64>,

    /// Filesystem root for service unit files
    #[arg(long, global = true, default_value = "/")]
    init_root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct SpecArgs {
    /// JSON container declaration
    #[arg(short, long)]
    spec: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Create and start the container unless it is running
    Run(SpecArgs),
    /// Start an existing container
    Start(SpecArgs),
    /// Stop a running container
    Stop(SpecArgs),
    /// Kill a running container
    Kill(SpecArgs),
    /// Restart an existing container
    Restart(SpecArgs),
    /// Remove the container, stopping it first
    Remove(SpecArgs),
    /// Remove and run again from scratch
    Redeploy(SpecArgs),
    /// Block until the container exits
    Wait(SpecArgs),
    /// Snapshot the container to an image
    Commit(SpecArgs),
    /// Write the container filesystem to the declared destination
    Export(SpecArgs),
    /// Copy the declared source path out to the declared destination
    Cp(SpecArgs),
    /// Log in to a registry, reading the password from stdin
    Login {
        /// Registry server, Docker Hub when omitted
        #[arg(long)]
        server: Option<String>,
        #[arg(short, long)]
        username: String,
        /// Docker binary that performs the login
        #[arg(long, default_value = "docker")]
        docker: String,
        /// Seconds before the login attempt is abandoned
        #[arg(long, default_value = "60")]
        cmd_timeout: u64,
    },
}

impl Commands {
    fn action(&self) -> Option<(Action, &Path)> {
        let (action, args) = match self {
            Commands::Run(args) => (Action::Run, args),
            Commands::Start(args) => (Action::Start, args),
            Commands::Stop(args) => (Action::Stop, args),
            Commands::Kill(args) => (Action::Kill, args),
            Commands::Restart(args) => (Action::Restart, args),
            Commands::Remove(args) => (Action::Remove, args),
            Commands::Redeploy(args) => (Action::Redeploy, args),
            Commands::Wait(args) => (Action::Wait, args),
            Commands::Commit(args) => (Action::Commit, args),
            Commands::Export(args) => (Action::Export, args),
            Commands::Cp(args) => (Action::Cp, args),
            Commands::Login { .. } => return None,
        };
        Some((action, args.spec.as_path()))
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("container_reconcile=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Commands::Login { server, username, docker, cmd_timeout } = &cli.command {
        return cmd_login(server.as_deref(), username, docker, *cmd_timeout);
    }

    let mut engine_config = EngineConfig::new().timeout(Duration::from_secs(cli.engine_timeout));
    if let Some(host) = &cli.docker_host {
        engine_config = engine_config.host(host.as_str());
    }
    if let Some(wait_timeout) = cli.wait_timeout {
        engine_config = engine_config.wait_timeout(Duration::from_secs(wait_timeout));
    }

    if let Some((action, spec)) = cli.command.action() {
        cmd_reconcile(action, spec, engine_config, &cli.init_root)?;
    }

    Ok(())
}

fn cmd_reconcile(
    action: Action,
    spec_path: &Path,
    engine_config: EngineConfig,
    init_root: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let spec: DesiredContainerSpec = serde_json::from_str(&std::fs::read_to_string(spec_path)?)?;

    let init_config = HostInitConfig::new()
        .root(init_root)
        .timeout(spec.command_timeout());
    let controller = Controller::new(
        DockerEngine::with_config(engine_config)?,
        HostInitAdapter::new(init_config),
    );

    let outcome = controller.reconcile(action, &spec)?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

fn cmd_login(
    server: Option<&str>,
    username: &str,
    docker: &str,
    cmd_timeout: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut password = String::new();
    std::io::stdin().lock().read_line(&mut password)?;

    let mut login = RegistryLogin::new(username, password.trim_end_matches(['\r', '\n'])).cmd_timeout(cmd_timeout);
    if let Some(server) = server {
        login = login.server(server);
    }

    login.login(&SystemRunner, docker)?;
    println!("Login succeeded");
    Ok(())
}
