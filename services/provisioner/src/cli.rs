//! CLI commands.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use vmprov::{MachineConfig, NatNetwork, Provisioner};

/// vmprov - provision VirtualBox machines from gold images.
#[derive(Debug, Parser)]
#[command(name = "vmprov")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Manage machines.
    Machine(MachineCommand),

    /// Manage NAT networks.
    Natnet(NatNetCommand),
}

#[derive(Debug, Args)]
struct MachineCommand {
    #[command(subcommand)]
    command: MachineSubcommand,
}

#[derive(Debug, Subcommand)]
enum MachineSubcommand {
    /// Create a machine from a JSON configuration and wait until it is ready.
    Create(ConfigArgs),

    /// Show the observed state of a machine.
    Read(IdArgs),

    /// Report whether a machine exists.
    Exists(IdArgs),

    /// Re-apply a JSON configuration to an existing machine.
    Update(UpdateArgs),

    /// Power off, unregister and delete a machine.
    Delete(IdArgs),
}

#[derive(Debug, Args)]
struct ConfigArgs {
    /// Path to the machine configuration (JSON).
    #[arg(long)]
    config: PathBuf,
}

#[derive(Debug, Args)]
struct IdArgs {
    /// Machine UUID (or name).
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
struct UpdateArgs {
    /// Machine UUID (or name).
    #[arg(long)]
    id: String,

    /// Path to the machine configuration (JSON).
    #[arg(long)]
    config: PathBuf,
}

#[derive(Debug, Args)]
struct NatNetCommand {
    #[command(subcommand)]
    command: NatNetSubcommand,
}

#[derive(Debug, Subcommand)]
enum NatNetSubcommand {
    /// Create a NAT network.
    Create(NatNetArgs),

    /// Show a NAT network.
    Read(NameArgs),

    /// Change the CIDR or DHCP setting of a NAT network.
    Update(NatNetArgs),

    /// Remove a NAT network.
    Delete(NameArgs),
}

#[derive(Debug, Args)]
struct NatNetArgs {
    /// Network name.
    #[arg(long)]
    name: String,

    /// IPv4 CIDR, e.g. 10.0.3.0/24.
    #[arg(long)]
    network: String,

    /// Enable the DHCP server.
    #[arg(long)]
    dhcp: bool,
}

impl NatNetArgs {
    fn to_network(&self) -> NatNetwork {
        NatNetwork {
            name: self.name.clone(),
            network: self.network.clone(),
            dhcp: self.dhcp,
        }
    }
}

#[derive(Debug, Args)]
struct NameArgs {
    /// Network name.
    #[arg(long)]
    name: String,
}

#[derive(Serialize)]
struct ExistsOutput<'a> {
    id: &'a str,
    exists: bool,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn load_config(path: &Path) -> Result<MachineConfig> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

impl Cli {
    pub async fn run(self, provisioner: &Provisioner, cancel: &CancellationToken) -> Result<()> {
        match self.command {
            Commands::Machine(cmd) => cmd.run(provisioner, cancel).await,
            Commands::Natnet(cmd) => cmd.run(provisioner, cancel).await,
        }
    }
}

impl MachineCommand {
    async fn run(self, provisioner: &Provisioner, cancel: &CancellationToken) -> Result<()> {
        match self.command {
            MachineSubcommand::Create(args) => {
                let config = load_config(&args.config).await?;
                let machine = provisioner.create(&config, cancel).await?;
                print_json(&machine)
            }
            MachineSubcommand::Read(args) => {
                let machine = provisioner.read(&args.id, cancel).await?;
                print_json(&machine)
            }
            MachineSubcommand::Exists(args) => {
                let exists = provisioner.exists(&args.id, cancel).await?;
                print_json(&ExistsOutput {
                    id: &args.id,
                    exists,
                })
            }
            MachineSubcommand::Update(args) => {
                let config = load_config(&args.config).await?;
                let machine = provisioner.update(&args.id, &config, cancel).await?;
                print_json(&machine)
            }
            MachineSubcommand::Delete(args) => {
                provisioner.delete(&args.id, cancel).await?;
                Ok(())
            }
        }
    }
}

impl NatNetCommand {
    async fn run(self, provisioner: &Provisioner, cancel: &CancellationToken) -> Result<()> {
        match self.command {
            NatNetSubcommand::Create(args) => {
                let network = provisioner
                    .create_nat_network(&args.to_network(), cancel)
                    .await?;
                print_json(&network)
            }
            NatNetSubcommand::Read(args) => {
                let network = provisioner.read_nat_network(&args.name, cancel).await?;
                print_json(&network)
            }
            NatNetSubcommand::Update(args) => {
                let network = provisioner
                    .update_nat_network(&args.to_network(), cancel)
                    .await?;
                print_json(&network)
            }
            NatNetSubcommand::Delete(args) => {
                provisioner.delete_nat_network(&args.name, cancel).await?;
                Ok(())
            }
        }
    }
}
