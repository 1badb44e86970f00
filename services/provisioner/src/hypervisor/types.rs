//! Native object model of the hypervisor.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Attachment mode of a network adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NicNetwork {
    Nat,
    Bridged,
    HostOnly,
    Internal,
    Generic,
    NatNetwork,
}

impl NicNetwork {
    /// Modes that only work with a named host-side interface.
    pub fn requires_host_interface(self) -> bool {
        matches!(self, Self::Bridged | Self::HostOnly | Self::NatNetwork)
    }
}

/// Emulated network adapter hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NicHardware {
    AmdPcNetPciII,
    AmdPcNetFastIII,
    IntelPro1000MtDesktop,
    IntelPro1000TServer,
    #[default]
    IntelPro1000MtServer,
    VirtIo,
}

/// A network adapter slot of a machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nic {
    pub network: NicNetwork,
    pub hardware: NicHardware,
    /// Host interface, internal network or NAT network name, depending on mode.
    pub host_interface: String,
    /// Assigned by the hypervisor; empty when writing.
    pub mac_address: String,
}

/// Boot slot device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BootDevice {
    #[default]
    None,
    Floppy,
    Dvd,
    Disk,
    Net,
}

impl BootDevice {
    pub const SLOTS: usize = 4;

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Floppy => "floppy",
            Self::Dvd => "dvd",
            Self::Disk => "disk",
            Self::Net => "net",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Self::None),
            "floppy" => Some(Self::Floppy),
            "dvd" => Some(Self::Dvd),
            "disk" => Some(Self::Disk),
            "net" => Some(Self::Net),
            _ => None,
        }
    }
}

impl fmt::Display for BootDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Power state reported by the hypervisor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MachineState {
    PowerOff,
    Running,
    Paused,
    Saved,
    Aborted,
    /// Any other state, kept verbatim.
    Other(String),
}

impl MachineState {
    pub fn parse(s: &str) -> Self {
        match s {
            "poweroff" => Self::PowerOff,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "saved" => Self::Saved,
            "aborted" => Self::Aborted,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::PowerOff => "poweroff",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Saved => "saved",
            Self::Aborted => "aborted",
            Self::Other(s) => s,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Whether a live session holds the machine lock. Such a machine must be
    /// powered off before it can be modified or unregistered.
    pub fn holds_session(&self) -> bool {
        match self {
            Self::Running | Self::Paused => true,
            Self::Other(s) => matches!(s.as_str(), "stuck" | "gurumeditation"),
            _ => false,
        }
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hardware virtualization switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VirtFeature {
    Acpi,
    IoApic,
    RtcUseUtc,
    Pae,
    HwVirtEx,
    NestedPaging,
    LargePages,
    LongMode,
    VtxVpid,
    VtxUx,
}

impl VirtFeature {
    pub const ALL: [VirtFeature; 10] = [
        Self::Acpi,
        Self::IoApic,
        Self::RtcUseUtc,
        Self::Pae,
        Self::HwVirtEx,
        Self::NestedPaging,
        Self::LargePages,
        Self::LongMode,
        Self::VtxVpid,
        Self::VtxUx,
    ];
}

/// Full settings applied to a machine record in one go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineSettings {
    pub os_type: String,
    pub cpus: u32,
    pub memory_mib: u64,
    pub vram_mib: u64,
    pub features: Vec<VirtFeature>,
    pub boot_order: [BootDevice; BootDevice::SLOTS],
    pub nics: Vec<Nic>,
}

/// A freshly registered machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedMachine {
    pub uuid: String,
    pub settings_file: PathBuf,
}

impl CreatedMachine {
    /// Directory holding the machine's settings and private disks.
    pub fn dir(&self) -> &Path {
        self.settings_file.parent().unwrap_or(Path::new("."))
    }
}

/// A machine record as read back from the hypervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeMachine {
    pub uuid: String,
    pub name: String,
    pub settings_file: PathBuf,
    pub state: MachineState,
    pub cpus: u32,
    pub memory_mib: u64,
    pub vram_mib: u64,
    pub boot_order: Vec<BootDevice>,
    pub nics: Vec<Nic>,
}

impl NativeMachine {
    pub fn dir(&self) -> &Path {
        self.settings_file.parent().unwrap_or(Path::new("."))
    }
}

/// Storage controller definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageController {
    pub name: String,
    pub bus: String,
    pub chipset: String,
    pub port_count: u32,
    pub host_io_cache: bool,
    pub bootable: bool,
}

impl StorageController {
    /// The single SATA controller every provisioned machine gets.
    pub fn sata(port_count: u32) -> Self {
        Self {
            name: "SATA".to_string(),
            bus: "sata".to_string(),
            chipset: "IntelAhci".to_string(),
            port_count,
            host_io_cache: true,
            bootable: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveType {
    Hdd,
    Dvd,
}

impl DriveType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hdd => "hdd",
            Self::Dvd => "dvddrive",
        }
    }
}

/// A medium attached to a controller port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageAttachment {
    pub port: u32,
    pub device: u32,
    pub drive: DriveType,
    pub medium: PathBuf,
}

/// A host-level NAT network shared by machines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatNetwork {
    pub name: String,
    /// IPv4 CIDR, e.g. `10.0.2.0/24`.
    pub network: String,
    pub dhcp: bool,
}
