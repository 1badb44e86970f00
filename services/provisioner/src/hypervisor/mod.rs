//! Hypervisor control surface.
//!
//! [`Hypervisor`] is a typed view of the hypervisor's imperative object
//! model: machine records, storage, media, guest properties, extra data and
//! NAT networks. [`VBoxManage`] implements it by shelling out through a
//! [`CommandRunner`](crate::command::CommandRunner); [`MockHypervisor`]
//! keeps everything in memory for tests and development.

mod mock;
mod types;
mod vboxmanage;

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

use crate::command::CommandError;

pub use mock::MockHypervisor;
pub use types::{
    BootDevice, CreatedMachine, DriveType, MachineSettings, MachineState, NatNetwork,
    NativeMachine, Nic, NicHardware, NicNetwork, StorageAttachment, StorageController,
    VirtFeature,
};
pub use vboxmanage::VBoxManage;

/// Extra-data key holding the declared user data.
pub const USER_DATA_KEY: &str = "user_data";

/// Errors from hypervisor operations.
#[derive(Debug, Error)]
pub enum HypervisorError {
    #[error("machine {0} not found")]
    MachineNotFound(String),

    #[error("NAT network {0} not found")]
    NatNetworkNotFound(String),

    #[error("{command}: {message}")]
    Rejected { command: String, message: String },

    #[error("unexpected output from {command}: {reason}")]
    Parse { command: String, reason: String },

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HypervisorError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::MachineNotFound(_) | Self::NatNetworkNotFound(_)
        )
    }
}

/// Hypervisor operations used by the provisioner.
///
/// Machines are addressed by UUID or name; the provisioner always passes
/// the UUID once it has one.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Create and register an empty machine under `base_folder/<name>`.
    async fn create_machine(
        &self,
        name: &str,
        base_folder: &Path,
    ) -> Result<CreatedMachine, HypervisorError>;

    /// Read a machine record. Fails with `MachineNotFound` if unregistered.
    async fn get_machine(&self, id: &str) -> Result<NativeMachine, HypervisorError>;

    /// Apply the full settings to a powered-off machine.
    async fn modify_machine(
        &self,
        id: &str,
        settings: &MachineSettings,
    ) -> Result<(), HypervisorError>;

    async fn set_extra_data(&self, id: &str, key: &str, value: &str)
        -> Result<(), HypervisorError>;

    async fn get_extra_data(&self, id: &str, key: &str) -> Result<Option<String>, HypervisorError>;

    /// Boot headless.
    async fn start_machine(&self, id: &str) -> Result<(), HypervisorError>;

    /// Hard power off.
    async fn poweroff_machine(&self, id: &str) -> Result<(), HypervisorError>;

    /// Unregister and delete all files of the machine.
    async fn delete_machine(&self, id: &str) -> Result<(), HypervisorError>;

    /// Give a disk image a fresh UUID so clones of it do not collide.
    async fn set_disk_uuid(&self, disk: &Path) -> Result<(), HypervisorError>;

    async fn clone_disk(&self, src: &Path, dst: &Path) -> Result<(), HypervisorError>;

    async fn add_storage_controller(
        &self,
        id: &str,
        controller: &StorageController,
    ) -> Result<(), HypervisorError>;

    async fn attach_storage(
        &self,
        id: &str,
        controller: &str,
        attachment: &StorageAttachment,
    ) -> Result<(), HypervisorError>;

    /// Read a guest property; `None` when the guest has not set it.
    async fn guest_property(&self, id: &str, key: &str) -> Result<Option<String>, HypervisorError>;

    async fn create_nat_network(&self, network: &NatNetwork) -> Result<(), HypervisorError>;

    /// `None` when no NAT network has that name.
    async fn get_nat_network(&self, name: &str) -> Result<Option<NatNetwork>, HypervisorError>;

    async fn modify_nat_network(&self, network: &NatNetwork) -> Result<(), HypervisorError>;

    async fn remove_nat_network(&self, name: &str) -> Result<(), HypervisorError>;
}
