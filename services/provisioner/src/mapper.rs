//! Translation between declared machine configuration and hypervisor settings.

use bytesize::ByteSize;
use thiserror::Error;

use crate::hypervisor::{BootDevice, MachineSettings, NativeMachine, VirtFeature};
use crate::machine::{MachineConfig, NetworkObservation, ObservedMachine};
use crate::network::{self, NetworkError};

/// Guest OS type every machine is registered with.
pub const OS_TYPE: &str = "Linux_64";

/// Video memory, fixed.
pub const VRAM_MIB: u64 = 20;

const MIB: u64 = 1024 * 1024;

/// Boot order applied before declared entries overwrite it slot by slot.
pub const DEFAULT_BOOT_ORDER: [BootDevice; BootDevice::SLOTS] = [
    BootDevice::Disk,
    BootDevice::None,
    BootDevice::None,
    BootDevice::None,
];

#[derive(Debug, Error)]
pub enum MapperError {
    #[error("invalid memory size '{value}': {reason}")]
    InvalidMemory { value: String, reason: String },

    #[error("boot order lists {0} devices, at most 4 are allowed")]
    TooManyBootDevices(usize),

    #[error("invalid boot device '{0}' (expected none, floppy, dvd, disk or net)")]
    InvalidBootDevice(String),

    #[error(transparent)]
    Network(#[from] NetworkError),
}

/// Hypervisor-side form of a declared machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeConfig {
    pub settings: MachineSettings,
    /// Stored as extra data when non-empty.
    pub user_data: Option<String>,
}

/// Parse a human-readable size into whole MiB, rounding down.
pub fn parse_memory_mib(value: &str) -> Result<u64, MapperError> {
    let size: ByteSize = value
        .trim()
        .parse()
        .map_err(|reason: String| MapperError::InvalidMemory {
            value: value.to_string(),
            reason,
        })?;

    let mib = size.as_u64() / MIB;
    if mib == 0 {
        return Err(MapperError::InvalidMemory {
            value: value.to_string(),
            reason: "must be at least 1 MiB".to_string(),
        });
    }
    Ok(mib)
}

/// Lowercase IEC rendering, e.g. `512.0 mib` or `1.0 gib`.
pub fn humanize_memory(mib: u64) -> String {
    ByteSize::mib(mib).display().iec().to_string().to_lowercase()
}

fn boot_order(declared: &[String]) -> Result<[BootDevice; BootDevice::SLOTS], MapperError> {
    if declared.len() > BootDevice::SLOTS {
        return Err(MapperError::TooManyBootDevices(declared.len()));
    }

    let mut order = DEFAULT_BOOT_ORDER;
    for (slot, name) in declared.iter().enumerate() {
        order[slot] = BootDevice::parse(name)
            .ok_or_else(|| MapperError::InvalidBootDevice(name.clone()))?;
    }
    Ok(order)
}

/// Map a declared configuration onto hypervisor settings.
///
/// Pure: nothing is sent to the hypervisor, so every configuration error
/// surfaces before any machine is created.
pub fn to_native(config: &MachineConfig) -> Result<NativeConfig, MapperError> {
    let memory_mib = parse_memory_mib(&config.memory)?;
    let boot_order = boot_order(&config.boot_order)?;
    let nics = network::declared_to_native(&config.network_adapter)?;

    Ok(NativeConfig {
        settings: MachineSettings {
            os_type: OS_TYPE.to_string(),
            cpus: config.cpus,
            memory_mib,
            vram_mib: VRAM_MIB,
            features: VirtFeature::ALL.to_vec(),
            boot_order,
            nics,
        },
        user_data: (!config.user_data.is_empty()).then(|| config.user_data.clone()),
    })
}

/// Build the observed view of a machine record.
///
/// Connection info is left unset; the caller fills it from the network
/// observation once the machine is known to be reachable.
pub fn from_native(
    machine: &NativeMachine,
    user_data: Option<String>,
    network: NetworkObservation,
) -> ObservedMachine {
    ObservedMachine {
        id: machine.uuid.clone(),
        name: machine.name.clone(),
        cpus: machine.cpus,
        memory: humanize_memory(machine.memory_mib),
        user_data: user_data.unwrap_or_default(),
        boot_order: machine
            .boot_order
            .iter()
            .map(|device| device.as_str().to_string())
            .collect(),
        status: machine.state.as_str().to_string(),
        network,
        connection: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::{MachineState, NicNetwork};
    use crate::machine::NetworkAdapterConfig;
    use rstest::rstest;
    use std::path::PathBuf;

    #[rstest]
    #[case("512mib", 512)]
    #[case("512MiB", 512)]
    #[case("1 GiB", 1024)]
    #[case("2gib", 2048)]
    #[case("1536 MiB", 1536)]
    fn test_parse_memory(#[case] value: &str, #[case] mib: u64) {
        assert_eq!(parse_memory_mib(value).unwrap(), mib);
    }

    #[rstest]
    #[case("lots")]
    #[case("")]
    #[case("512kib")]
    fn test_parse_memory_rejects(#[case] value: &str) {
        assert!(matches!(
            parse_memory_mib(value),
            Err(MapperError::InvalidMemory { .. })
        ));
    }

    #[rstest]
    #[case(512, "512.0 mib")]
    #[case(1024, "1.0 gib")]
    #[case(2048, "2.0 gib")]
    fn test_humanize_memory(#[case] mib: u64, #[case] expected: &str) {
        assert_eq!(humanize_memory(mib), expected);
    }

    #[test]
    fn test_defaults() {
        let native = to_native(&MachineConfig::new("web", "/images/ubuntu.tar")).unwrap();

        assert_eq!(native.settings.os_type, "Linux_64");
        assert_eq!(native.settings.cpus, 2);
        assert_eq!(native.settings.memory_mib, 512);
        assert_eq!(native.settings.vram_mib, 20);
        assert_eq!(native.settings.features.len(), VirtFeature::ALL.len());
        assert_eq!(native.settings.boot_order, DEFAULT_BOOT_ORDER);
        assert!(native.settings.nics.is_empty());
        assert_eq!(native.user_data, None);
    }

    #[test]
    fn test_boot_order_overwrites_leading_slots() {
        let mut config = MachineConfig::new("web", "/images/ubuntu.tar");
        config.boot_order = vec!["net".to_string(), "dvd".to_string()];

        let native = to_native(&config).unwrap();
        assert_eq!(
            native.settings.boot_order,
            [
                BootDevice::Net,
                BootDevice::Dvd,
                BootDevice::None,
                BootDevice::None
            ]
        );
    }

    #[test]
    fn test_boot_order_limits() {
        let mut config = MachineConfig::new("web", "/images/ubuntu.tar");
        config.boot_order = vec!["disk".to_string(); 5];
        assert!(matches!(
            to_native(&config),
            Err(MapperError::TooManyBootDevices(5))
        ));

        config.boot_order = vec!["usb".to_string()];
        assert!(matches!(
            to_native(&config),
            Err(MapperError::InvalidBootDevice(ref d)) if d == "usb"
        ));
    }

    #[test]
    fn test_network_errors_surface() {
        let mut config = MachineConfig::new("web", "/images/ubuntu.tar");
        config.network_adapter = vec![NetworkAdapterConfig::new("bridged")];

        assert!(matches!(to_native(&config), Err(MapperError::Network(_))));
    }

    #[test]
    fn test_round_trip_through_native() {
        let mut config = MachineConfig::new("web", "/images/ubuntu.tar");
        config.cpus = 4;
        config.memory = "1024mib".to_string();
        config.user_data = "#cloud-config".to_string();
        config.network_adapter = vec![
            NetworkAdapterConfig::new("nat"),
            NetworkAdapterConfig::new("hostonly").with_host_interface("vboxnet0"),
        ];

        let native = to_native(&config).unwrap();
        let machine = NativeMachine {
            uuid: "uuid-1".to_string(),
            name: config.name.clone(),
            settings_file: PathBuf::from("/machines/web/web.vbox"),
            state: MachineState::PowerOff,
            cpus: native.settings.cpus,
            memory_mib: native.settings.memory_mib,
            vram_mib: native.settings.vram_mib,
            boot_order: native.settings.boot_order.to_vec(),
            nics: native.settings.nics.clone(),
        };

        let observed = from_native(&machine, native.user_data, NetworkObservation::NotYetConverged);

        assert_eq!(observed.cpus, 4);
        assert_eq!(observed.memory, "1.0 gib");
        assert_eq!(observed.user_data, "#cloud-config");
        assert_eq!(observed.status, "poweroff");
        assert_eq!(observed.boot_order, vec!["disk", "none", "none", "none"]);
        assert_eq!(machine.nics[1].network, NicNetwork::HostOnly);
        assert_eq!(observed.connection, None);
    }
}
