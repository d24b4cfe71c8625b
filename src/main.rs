mod cluster;
mod config;
mod deploy;
mod distribute;
mod exec;
mod setup;
mod verify;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use exec::Executor;

#[derive(Parser)]
#[command(name = "kubestrap")]
#[command(about = "Cluster Bootstrap Layer - CLI tool for bootstrapping a kubeadm test cluster", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Prepare a host and apply a cluster role
    Setup {
        /// Role to apply
        #[arg(value_enum)]
        role: RoleArg,
        /// Join command for the worker role (falls back to JOIN_COMMAND in .env)
        join_command: Option<String>,
        /// Run against a remote host instead of this machine
        #[arg(long, short = 'H')]
        host: Option<String>,
    },
    /// Bootstrap the full cluster: distribute, init master, join worker
    Cluster,
    /// Sync the project tree and binary to one host
    Distribute {
        /// Hostname to distribute to
        host: String,
    },
    /// Deploy the demo application and the control/measurement stack
    Deploy,
    /// Await rollouts and probe the frontend
    Verify,
}

#[derive(Clone, Copy, ValueEnum)]
enum RoleArg {
    Master,
    Worker,
}

impl From<RoleArg> for setup::Role {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Master => setup::Role::Master,
            RoleArg::Worker => setup::Role::Worker,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_root = std::env::current_dir().context("Cannot resolve the working directory")?;
    let config = config::load(&project_root)?;

    match cli.command {
        Commands::Setup {
            role,
            join_command,
            host,
        } => {
            // Remote sessions land in the login home, so the installer gets
            // an explicit project root to resolve manifest paths against.
            let (executor, working_root) = match host {
                Some(ref host) => (
                    Executor::remote(&config.ssh_target(host)),
                    config.remote_path.clone(),
                ),
                None => (
                    Executor::Local,
                    config.project_root.to_string_lossy().into_owned(),
                ),
            };
            setup::run(
                &executor,
                role.into(),
                join_command.as_deref(),
                &config,
                &working_root,
            )?;
        }
        Commands::Cluster => {
            cluster::bootstrap(&config)?;
        }
        Commands::Distribute { host } => {
            distribute::distribute(&host, &config)?;
        }
        Commands::Deploy => {
            deploy::deploy(&config)?;
            verify::verify(&config)?;
        }
        Commands::Verify => {
            verify::verify(&config)?;
        }
    }

    Ok(())
}
