//! Lifecycle controller.
//!
//! Composes the image store, disk assembler, mapper, network reconciler and
//! convergence poller into the create/read/update/delete operations for
//! machines, plus CRUD for NAT networks.
//!
//! ## Create flow
//!
//! ```text
//! validate ─► prepare image ─► gather disks ─► create record ─► clone/attach
//!     ─► apply settings ─► start ─► wait for network ─► read back
//! ```
//!
//! Nothing is rolled back when a step fails; the machine UUID is logged as
//! soon as the record exists so a partial machine can be found and removed.
//! Cancellation is checked between steps.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vmprov_converge::{wait_for, Observation, Observe, WaitError, WaitSpec};

use crate::command::CommandRunner;
use crate::disk::{self, new_disk_lock, DiskAssembler, DiskError};
use crate::hypervisor::{Hypervisor, HypervisorError, NatNetwork, Nic, USER_DATA_KEY};
use crate::image::{ImageError, ImageSource, ImageStore};
use crate::machine::{ConnectionInfo, MachineConfig, ObservedMachine};
use crate::mapper::{self, MapperError, NativeConfig};
use crate::network::{self, NetworkError};

/// Readiness wait timings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyTimings {
    pub delay: Duration,
    pub min_interval: Duration,
    pub timeout: Duration,
    pub not_found_checks: u32,
}

impl Default for ReadyTimings {
    fn default() -> Self {
        Self {
            delay: vmprov_converge::DEFAULT_DELAY,
            min_interval: vmprov_converge::DEFAULT_MIN_INTERVAL,
            timeout: vmprov_converge::DEFAULT_TIMEOUT,
            not_found_checks: vmprov_converge::DEFAULT_NOT_FOUND_CHECKS,
        }
    }
}

impl ReadyTimings {
    pub fn wait_spec(&self, target: &[&str], pending: &[&str]) -> WaitSpec {
        WaitSpec::new(target.iter().copied(), pending.iter().copied())
            .with_delay(self.delay)
            .with_min_interval(self.min_interval)
            .with_timeout(self.timeout)
            .with_not_found_checks(self.not_found_checks)
    }
}

/// Paths and timings for a [`Provisioner`].
#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    /// Root holding `gold/` and `machine/`.
    pub base_dir: PathBuf,

    /// Where remote images are downloaded.
    pub download_dir: PathBuf,

    pub ready: ReadyTimings,
}

impl ProvisionerConfig {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            download_dir: PathBuf::from("."),
            ready: ReadyTimings::default(),
        }
    }

    pub fn gold_dir(&self) -> PathBuf {
        self.base_dir.join("gold")
    }

    pub fn machine_dir(&self) -> PathBuf {
        self.base_dir.join("machine")
    }
}

/// Lifecycle errors.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("invalid machine configuration: {0}")]
    Config(#[from] MapperError),

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error(transparent)]
    Disk(#[from] DiskError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),

    #[error(transparent)]
    Wait(Box<WaitError<ProvisionError>>),

    #[error("invalid NAT network CIDR '{0}'")]
    InvalidCidr(String),

    #[error("machine {0} disappeared while being provisioned")]
    Vanished(String),

    #[error("{0} cancelled")]
    Cancelled(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<WaitError<ProvisionError>> for ProvisionError {
    fn from(e: WaitError<ProvisionError>) -> Self {
        Self::Wait(Box::new(e))
    }
}

fn checkpoint(cancel: &CancellationToken, operation: &'static str) -> Result<(), ProvisionError> {
    if cancel.is_cancelled() {
        warn!(operation, "Operation cancelled");
        return Err(ProvisionError::Cancelled(operation));
    }
    Ok(())
}

/// Check an IPv4 CIDR such as `10.0.3.0/24`.
fn validate_cidr(cidr: &str) -> Result<(), ProvisionError> {
    let invalid = || ProvisionError::InvalidCidr(cidr.to_string());
    let (addr, prefix) = cidr.split_once('/').ok_or_else(invalid)?;
    addr.parse::<Ipv4Addr>().map_err(|_| invalid())?;
    match prefix.parse::<u8>() {
        Ok(p) if p <= 32 => Ok(()),
        _ => Err(invalid()),
    }
}

/// Orchestrates machine and NAT network lifecycles.
pub struct Provisioner {
    config: ProvisionerConfig,
    hypervisor: Arc<dyn Hypervisor>,
    images: ImageStore,
    disks: DiskAssembler,
}

impl Provisioner {
    /// Create a provisioner. One disk lock is shared by image unpacking and
    /// disk cloning.
    pub fn new(
        config: ProvisionerConfig,
        hypervisor: Arc<dyn Hypervisor>,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self, ProvisionError> {
        let disk_lock = new_disk_lock();
        let images = ImageStore::new(
            config.gold_dir(),
            config.download_dir.clone(),
            runner,
            disk_lock.clone(),
        )?;
        let disks = DiskAssembler::new(Arc::clone(&hypervisor), disk_lock);

        Ok(Self {
            config,
            hypervisor,
            images,
            disks,
        })
    }

    pub fn config(&self) -> &ProvisionerConfig {
        &self.config
    }

    /// Provision a new machine and wait until it is reachable.
    pub async fn create(
        &self,
        config: &MachineConfig,
        cancel: &CancellationToken,
    ) -> Result<ObservedMachine, ProvisionError> {
        // Everything that can be rejected locally is checked before the
        // hypervisor is touched.
        let native = mapper::to_native(config)?;
        let source = ImageSource::from_config(config)?;
        checkpoint(cancel, "create")?;

        info!(name = %config.name, image = %config.image, "Creating machine");

        let gold = self.images.prepare(&source).await?;
        let gold_disks = disk::gather_disks(&gold).await?;
        checkpoint(cancel, "create")?;

        let machine_dir = self.config.machine_dir();
        tokio::fs::create_dir_all(&machine_dir).await?;
        let created = self
            .hypervisor
            .create_machine(&config.name, &machine_dir)
            .await?;
        info!(name = %config.name, machine_id = %created.uuid, "Machine record created");

        let cloned = self.disks.clone_all(&gold_disks, created.dir()).await?;
        let optical: Vec<PathBuf> = config.optical_disks.iter().map(PathBuf::from).collect();
        self.disks
            .attach_all(&created.uuid, created.dir(), &cloned, &optical)
            .await?;
        checkpoint(cancel, "create")?;

        self.apply(&created.uuid, &native).await?;
        self.hypervisor.start_machine(&created.uuid).await?;
        info!(machine_id = %created.uuid, "Machine started");

        self.wait_ready(&created.uuid, &native.settings.nics, cancel)
            .await?;

        self.read(&created.uuid, cancel)
            .await?
            .ok_or(ProvisionError::Vanished(created.uuid))
    }

    /// Refresh a machine. `None` means it no longer exists.
    pub async fn read(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<ObservedMachine>, ProvisionError> {
        checkpoint(cancel, "read")?;
        self.refresh(id).await
    }

    /// Re-apply the full configuration to an existing machine.
    ///
    /// The machine is powered off (waiting until the hypervisor reports it
    /// so), reconfigured, started again and waited on like a fresh machine.
    pub async fn update(
        &self,
        id: &str,
        config: &MachineConfig,
        cancel: &CancellationToken,
    ) -> Result<ObservedMachine, ProvisionError> {
        let native = mapper::to_native(config)?;
        checkpoint(cancel, "update")?;

        let machine = self.hypervisor.get_machine(id).await?;
        info!(machine_id = %machine.uuid, state = %machine.state, "Updating machine");

        if machine.state.holds_session() {
            self.hypervisor.poweroff_machine(&machine.uuid).await?;
            let spec = self
                .config
                .ready
                .wait_spec(&["poweroff"], &["running", "paused", "stopping"])
                .with_delay(Duration::ZERO);
            wait_for(self, &machine.uuid, "status", &spec, cancel).await?;
        }
        checkpoint(cancel, "update")?;

        self.apply(&machine.uuid, &native).await?;
        if native.user_data.is_none()
            && self
                .hypervisor
                .get_extra_data(&machine.uuid, USER_DATA_KEY)
                .await?
                .is_some()
        {
            // An empty value removes the key.
            self.hypervisor
                .set_extra_data(&machine.uuid, USER_DATA_KEY, "")
                .await?;
        }

        self.hypervisor.start_machine(&machine.uuid).await?;
        self.wait_ready(&machine.uuid, &native.settings.nics, cancel)
            .await?;

        self.read(&machine.uuid, cancel)
            .await?
            .ok_or(ProvisionError::Vanished(machine.uuid))
    }

    /// Unregister a machine and delete its files. Deleting a machine that is
    /// already gone succeeds.
    pub async fn delete(&self, id: &str, cancel: &CancellationToken) -> Result<(), ProvisionError> {
        checkpoint(cancel, "delete")?;

        let machine = match self.hypervisor.get_machine(id).await {
            Ok(machine) => machine,
            Err(e) if e.is_not_found() => {
                info!(machine_id = %id, "Machine already deleted");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if machine.state.holds_session() {
            self.hypervisor.poweroff_machine(&machine.uuid).await?;
        }
        self.hypervisor.delete_machine(&machine.uuid).await?;

        info!(machine_id = %machine.uuid, name = %machine.name, "Machine deleted");
        Ok(())
    }

    pub async fn exists(&self, id: &str, cancel: &CancellationToken) -> Result<bool, ProvisionError> {
        checkpoint(cancel, "exists")?;
        match self.hypervisor.get_machine(id).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn create_nat_network(
        &self,
        network: &NatNetwork,
        cancel: &CancellationToken,
    ) -> Result<NatNetwork, ProvisionError> {
        validate_cidr(&network.network)?;
        checkpoint(cancel, "create NAT network")?;

        self.hypervisor.create_nat_network(network).await?;
        self.hypervisor
            .get_nat_network(&network.name)
            .await?
            .ok_or_else(|| HypervisorError::NatNetworkNotFound(network.name.clone()).into())
    }

    pub async fn read_nat_network(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<NatNetwork>, ProvisionError> {
        checkpoint(cancel, "read NAT network")?;
        Ok(self.hypervisor.get_nat_network(name).await?)
    }

    pub async fn update_nat_network(
        &self,
        network: &NatNetwork,
        cancel: &CancellationToken,
    ) -> Result<NatNetwork, ProvisionError> {
        validate_cidr(&network.network)?;
        checkpoint(cancel, "update NAT network")?;

        if self.hypervisor.get_nat_network(&network.name).await?.is_none() {
            return Err(HypervisorError::NatNetworkNotFound(network.name.clone()).into());
        }
        self.hypervisor.modify_nat_network(network).await?;
        info!(name = %network.name, network = %network.network, dhcp = network.dhcp, "NAT network updated");
        Ok(network.clone())
    }

    pub async fn delete_nat_network(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ProvisionError> {
        checkpoint(cancel, "delete NAT network")?;

        if self.hypervisor.get_nat_network(name).await?.is_none() {
            return Err(HypervisorError::NatNetworkNotFound(name.to_string()).into());
        }
        self.hypervisor.remove_nat_network(name).await?;
        info!(name = %name, "NAT network deleted");
        Ok(())
    }

    async fn apply(&self, id: &str, native: &NativeConfig) -> Result<(), ProvisionError> {
        self.hypervisor.modify_machine(id, &native.settings).await?;
        if let Some(user_data) = &native.user_data {
            self.hypervisor
                .set_extra_data(id, USER_DATA_KEY, user_data)
                .await?;
        }
        debug!(
            machine_id = %id,
            cpus = native.settings.cpus,
            memory_mib = native.settings.memory_mib,
            nics = native.settings.nics.len(),
            "Machine settings applied"
        );
        Ok(())
    }

    /// Wait until the first non-NAT adapter has an IPv4 address. Machines
    /// with only NAT adapters are ready as soon as they start.
    async fn wait_ready(
        &self,
        id: &str,
        nics: &[Nic],
        cancel: &CancellationToken,
    ) -> Result<(), ProvisionError> {
        let Some(attribute) = network::readiness_attribute(nics) else {
            debug!(machine_id = %id, "No routable adapter, skipping readiness wait");
            return Ok(());
        };

        let spec = self.config.ready.wait_spec(&["yes"], &["no"]);
        let converged = wait_for(self, id, &attribute, &spec, cancel).await?;
        info!(
            machine_id = %id,
            host = ?converged.entity.connection.as_ref().map(|c| &c.host),
            "Machine is ready"
        );
        Ok(())
    }

    async fn refresh(&self, id: &str) -> Result<Option<ObservedMachine>, ProvisionError> {
        let machine = match self.hypervisor.get_machine(id).await {
            Ok(machine) => machine,
            Err(e) if e.is_not_found() => {
                info!(machine_id = %id, "Machine not found");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let user_data = self
            .hypervisor
            .get_extra_data(&machine.uuid, USER_DATA_KEY)
            .await?;
        let network = network::native_to_declared(self.hypervisor.as_ref(), &machine).await?;
        let connection = network::connection_host(&machine.nics, &network).map(ConnectionInfo::ssh);

        let mut observed = mapper::from_native(&machine, user_data, network);
        observed.connection = connection;
        Ok(Some(observed))
    }
}

#[async_trait]
impl Observe for Provisioner {
    type Entity = ObservedMachine;
    type Error = ProvisionError;

    async fn observe(
        &self,
        resource: &str,
        attribute: &str,
    ) -> Result<Observation<ObservedMachine>, ProvisionError> {
        Ok(match self.refresh(resource).await? {
            None => Observation::NotFound,
            Some(machine) => {
                let value = machine.attribute(attribute);
                Observation::Found {
                    entity: machine,
                    value,
                }
            }
        })
    }
}
