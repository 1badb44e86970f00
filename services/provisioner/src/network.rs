//! Network adapter reconciliation.
//!
//! On write, declared adapters become hypervisor NICs, with every invalid
//! adapter reported in one aggregate error. On read, hypervisor NICs are
//! correlated with what the guest reports about its interfaces. Guest
//! interfaces are not numbered like hypervisor slots, so the correlation key
//! is the MAC address.

use std::collections::HashMap;

use thiserror::Error;
use tracing::{debug, trace};

use crate::error::MultiError;
use crate::hypervisor::{Hypervisor, HypervisorError, NativeMachine, Nic, NicHardware, NicNetwork};
use crate::machine::{Availability, NetworkAdapterConfig, NetworkObservation, ObservedAdapter};

const GUEST_NET_COUNT: &str = "/VirtualBox/GuestInfo/Net/Count";

/// Declared name of each network mode.
const NETWORK_NAMES: [(&str, NicNetwork); 6] = [
    ("bridged", NicNetwork::Bridged),
    ("nat", NicNetwork::Nat),
    ("hostonly", NicNetwork::HostOnly),
    ("internal", NicNetwork::Internal),
    ("generic", NicNetwork::Generic),
    ("natnetwork", NicNetwork::NatNetwork),
];

/// Declared name of each adapter model.
const DEVICE_NAMES: [(&str, NicHardware); 6] = [
    ("PCIII", NicHardware::AmdPcNetPciII),
    ("FASTIII", NicHardware::AmdPcNetFastIII),
    ("IntelPro1000MTDesktop", NicHardware::IntelPro1000MtDesktop),
    ("IntelPro1000TServer", NicHardware::IntelPro1000TServer),
    ("IntelPro1000MTServer", NicHardware::IntelPro1000MtServer),
    ("VirtIO", NicHardware::VirtIo),
];

pub fn network_from_name(name: &str) -> Option<NicNetwork> {
    NETWORK_NAMES
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, network)| *network)
}

pub fn network_name(network: NicNetwork) -> &'static str {
    NETWORK_NAMES
        .iter()
        .find(|(_, n)| *n == network)
        .map(|(name, _)| *name)
        .unwrap_or("")
}

pub fn device_from_name(name: &str) -> Option<NicHardware> {
    DEVICE_NAMES
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, device)| *device)
}

pub fn device_name(device: NicHardware) -> &'static str {
    DEVICE_NAMES
        .iter()
        .find(|(_, d)| *d == device)
        .map(|(name, _)| *name)
        .unwrap_or("")
}

/// A problem with one declared adapter.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("network adapter #{index}: invalid network type '{value}'")]
    InvalidType { index: usize, value: String },

    #[error("network adapter #{index}: invalid device '{value}'")]
    InvalidDevice { index: usize, value: String },

    #[error("network adapter #{index}: 'host_interface' must be set for {network} adapters")]
    MissingHostInterface { index: usize, network: String },
}

impl AdapterError {
    pub fn index(&self) -> usize {
        match self {
            Self::InvalidType { index, .. }
            | Self::InvalidDevice { index, .. }
            | Self::MissingHostInterface { index, .. } => *index,
        }
    }
}

/// A failed guest-property read for one guest interface.
#[derive(Debug, Error)]
#[error("guest interface #{index}: reading {key}: {source}")]
pub struct GuestPropertyError {
    pub index: usize,
    pub key: String,
    #[source]
    pub source: HypervisorError,
}

/// Errors from network reconciliation.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("invalid network adapters: {0}")]
    Config(MultiError<AdapterError>),

    #[error("reading guest network state: {0}")]
    Guest(MultiError<GuestPropertyError>),

    #[error("guest reported an invalid interface count '{0}'")]
    InvalidCount(String),

    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),
}

/// Convert declared adapters into hypervisor NICs, keeping their order.
pub fn declared_to_native(adapters: &[NetworkAdapterConfig]) -> Result<Vec<Nic>, NetworkError> {
    let mut nics = Vec::with_capacity(adapters.len());
    let mut errors = MultiError::new();

    for (index, adapter) in adapters.iter().enumerate() {
        let network = network_from_name(&adapter.network);
        if network.is_none() {
            errors.push(AdapterError::InvalidType {
                index,
                value: adapter.network.clone(),
            });
        }

        let hardware = if adapter.device.is_empty() {
            Some(NicHardware::default())
        } else {
            device_from_name(&adapter.device)
        };
        if hardware.is_none() {
            errors.push(AdapterError::InvalidDevice {
                index,
                value: adapter.device.clone(),
            });
        }

        if let Some(network) = network {
            if network.requires_host_interface() && adapter.host_interface.trim().is_empty() {
                errors.push(AdapterError::MissingHostInterface {
                    index,
                    network: adapter.network.clone(),
                });
            }
        }

        if let (Some(network), Some(hardware)) = (network, hardware) {
            trace!(index, network = ?network, hardware = ?hardware, "Network adapter");
            nics.push(Nic {
                network,
                hardware,
                host_interface: adapter.host_interface.trim().to_string(),
                mac_address: String::new(),
            });
        }
    }

    errors.into_result().map_err(NetworkError::Config)?;
    Ok(nics)
}

/// Uppercase hex digits only, so `08:00:27:a1:b2:c3` matches `080027A1B2C3`.
pub fn normalize_mac(mac: &str) -> String {
    mac.chars()
        .filter(char::is_ascii_hexdigit)
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

fn observed(nic: &Nic, status: &str, ipv4: &str) -> ObservedAdapter {
    ObservedAdapter {
        network: network_name(nic.network).to_string(),
        device: device_name(nic.hardware).to_string(),
        host_interface: nic.host_interface.clone(),
        mac_address: nic.mac_address.clone(),
        status: status.to_string(),
        ipv4_address: ipv4.to_string(),
        ipv4_address_available: if ipv4.is_empty() {
            Availability::No
        } else {
            Availability::Yes
        },
    }
}

struct GuestInterface {
    status: String,
    ipv4: String,
}

enum GuestRead {
    Value(String),
    Missing,
}

async fn read_guest(
    hypervisor: &dyn Hypervisor,
    machine_id: &str,
    index: usize,
    field: &str,
) -> Result<GuestRead, GuestPropertyError> {
    let key = format!("/VirtualBox/GuestInfo/Net/{index}/{field}");
    match hypervisor.guest_property(machine_id, &key).await {
        Ok(Some(value)) => Ok(GuestRead::Value(value)),
        Ok(None) => Ok(GuestRead::Missing),
        Err(source) => Err(GuestPropertyError { index, key, source }),
    }
}

/// Observe the runtime state of every configured adapter.
///
/// A machine that is not running reports each adapter as `down` without
/// asking the guest. A running machine whose guest has not yet reported
/// enough to match every adapter yields [`NetworkObservation::NotYetConverged`].
pub async fn native_to_declared(
    hypervisor: &dyn Hypervisor,
    machine: &NativeMachine,
) -> Result<NetworkObservation, NetworkError> {
    if !machine.state.is_running() {
        return Ok(NetworkObservation::Reported(
            machine
                .nics
                .iter()
                .map(|nic| observed(nic, "down", ""))
                .collect(),
        ));
    }

    let count = match hypervisor.guest_property(&machine.uuid, GUEST_NET_COUNT).await? {
        None => {
            debug!(machine_id = %machine.uuid, "Guest has not reported its interfaces yet");
            return Ok(NetworkObservation::NotYetConverged);
        }
        Some(raw) => raw
            .trim()
            .parse::<usize>()
            .map_err(|_| NetworkError::InvalidCount(raw.clone()))?,
    };

    if count < machine.nics.len() {
        debug!(
            machine_id = %machine.uuid,
            reported = count,
            configured = machine.nics.len(),
            "Guest reports fewer interfaces than configured"
        );
        return Ok(NetworkObservation::NotYetConverged);
    }

    let mut guest: HashMap<String, GuestInterface> = HashMap::new();
    let mut errors = MultiError::new();

    for index in 0..count {
        let mac = match read_guest(hypervisor, &machine.uuid, index, "MAC").await {
            Ok(GuestRead::Value(mac)) if !mac.is_empty() => mac,
            Ok(_) => return Ok(NetworkObservation::NotYetConverged),
            Err(e) => {
                errors.push(e);
                continue;
            }
        };

        let status = match read_guest(hypervisor, &machine.uuid, index, "Status").await {
            Ok(GuestRead::Value(status)) if !status.is_empty() => status.to_lowercase(),
            Ok(_) => return Ok(NetworkObservation::NotYetConverged),
            Err(e) => {
                errors.push(e);
                continue;
            }
        };

        let ipv4 = match read_guest(hypervisor, &machine.uuid, index, "V4/IP").await {
            Ok(GuestRead::Value(ip)) => ip,
            Ok(GuestRead::Missing) => return Ok(NetworkObservation::NotYetConverged),
            Err(e) => {
                errors.push(e);
                continue;
            }
        };

        guest.insert(normalize_mac(&mac), GuestInterface { status, ipv4 });
    }

    errors.into_result().map_err(NetworkError::Guest)?;

    let mut adapters = Vec::with_capacity(machine.nics.len());
    for nic in &machine.nics {
        match guest.get(&normalize_mac(&nic.mac_address)) {
            Some(iface) => adapters.push(observed(nic, &iface.status, &iface.ipv4)),
            None => {
                debug!(
                    machine_id = %machine.uuid,
                    mac = %nic.mac_address,
                    "Configured adapter not reported by guest yet"
                );
                return Ok(NetworkObservation::NotYetConverged);
            }
        }
    }

    Ok(NetworkObservation::Reported(adapters))
}

/// Attribute path that signals the machine is reachable: IPv4 availability
/// of the first adapter not in plain NAT mode. `None` if every adapter is NAT.
pub fn readiness_attribute(nics: &[Nic]) -> Option<String> {
    nics.iter()
        .position(|nic| nic.network != NicNetwork::Nat)
        .map(|index| format!("network_adapter.{index}.ipv4_address_available"))
}

/// IPv4 address of the first non-NAT adapter that has one.
pub fn connection_host(nics: &[Nic], observation: &NetworkObservation) -> Option<String> {
    nics.iter()
        .zip(observation.adapters())
        .filter(|(nic, _)| nic.network != NicNetwork::Nat)
        .find(|(_, adapter)| {
            adapter.ipv4_address_available == Availability::Yes && !adapter.ipv4_address.is_empty()
        })
        .map(|(_, adapter)| adapter.ipv4_address.clone())
}
