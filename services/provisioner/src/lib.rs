//! vmprov Provisioner Library
//!
//! Provisions VirtualBox machines from gold disk images and reconciles them
//! against a declared configuration. The hypervisor itself is driven through
//! its command-line interface.
//!
//! ## Architecture
//!
//! ```text
//! Provisioner (lifecycle)
//! ├── ImageStore      (resolve, verify, unpack gold images)
//! ├── DiskAssembler   (clone and attach disks)
//! ├── mapper          (declared config <-> machine settings)
//! ├── network         (adapters, guest-reported state)
//! └── vmprov_converge (waits for eventually-consistent attributes)
//! ```
//!
//! Everything below the lifecycle talks to the hypervisor through the
//! [`Hypervisor`] trait: [`VBoxManage`] in production, [`MockHypervisor`] in
//! tests.
//!
//! ## Modules
//!
//! - `command`: argument-vector execution
//! - `hypervisor`: typed hypervisor operations and the VBoxManage backend
//! - `image`: gold image acquisition
//! - `disk`: disk discovery, cloning and attachment
//! - `lifecycle`: create/read/update/delete orchestration

pub mod command;
pub mod disk;
pub mod error;
pub mod hypervisor;
pub mod image;
pub mod lifecycle;
pub mod machine;
pub mod mapper;
pub mod network;

// Exposed for the binary and integration tests
pub mod config;

// Re-export commonly used types
pub use command::{CommandRunner, MockRunner, ProcessRunner};
pub use error::MultiError;
pub use hypervisor::{Hypervisor, MockHypervisor, NatNetwork, VBoxManage};
pub use lifecycle::{ProvisionError, Provisioner, ProvisionerConfig, ReadyTimings};
pub use machine::{MachineConfig, NetworkAdapterConfig, NetworkObservation, ObservedMachine};
