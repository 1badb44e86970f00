//! Declared and observed machine models.
//!
//! [`MachineConfig`] is what the caller asks for; [`ObservedMachine`] is
//! what a read reports back. Both are plain serde types so the binary can
//! take and print them as JSON.

use serde::{Deserialize, Serialize};

/// Declared machine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineConfig {
    pub name: String,

    /// Local path or `http(s)://` URL of the gold image archive.
    pub image: String,

    /// ISO images copied next to the machine and attached as DVD drives.
    #[serde(default)]
    pub optical_disks: Vec<String>,

    #[serde(default = "default_cpus")]
    pub cpus: u32,

    /// Human-readable size, e.g. `512mib` or `2 GiB`.
    #[serde(default = "default_memory")]
    pub memory: String,

    #[serde(default)]
    pub user_data: String,

    #[serde(default)]
    pub checksum: Option<String>,

    #[serde(default)]
    pub checksum_type: Option<String>,

    #[serde(default)]
    pub network_adapter: Vec<NetworkAdapterConfig>,

    /// Up to four of `none`, `floppy`, `dvd`, `disk`, `net`.
    #[serde(default)]
    pub boot_order: Vec<String>,
}

fn default_cpus() -> u32 {
    2
}

fn default_memory() -> String {
    "512mib".to_string()
}

fn default_device() -> String {
    "IntelPro1000MTServer".to_string()
}

impl MachineConfig {
    /// A configuration with every optional field at its default.
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            optical_disks: Vec::new(),
            cpus: default_cpus(),
            memory: default_memory(),
            user_data: String::new(),
            checksum: None,
            checksum_type: None,
            network_adapter: Vec::new(),
            boot_order: Vec::new(),
        }
    }
}

/// Declared network adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAdapterConfig {
    /// `nat`, `bridged`, `hostonly`, `internal`, `generic` or `natnetwork`.
    #[serde(rename = "type")]
    pub network: String,

    #[serde(default = "default_device")]
    pub device: String,

    #[serde(default)]
    pub host_interface: String,
}

impl NetworkAdapterConfig {
    pub fn new(network: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            device: default_device(),
            host_interface: String::new(),
        }
    }

    pub fn with_host_interface(mut self, host_interface: impl Into<String>) -> Self {
        self.host_interface = host_interface.into();
        self
    }
}

/// Whether the guest has reported an IPv4 address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Availability {
    Yes,
    No,
}

impl Availability {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Yes => "yes",
            Self::No => "no",
        }
    }
}

/// One adapter as observed on a running (or stopped) machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedAdapter {
    #[serde(rename = "type")]
    pub network: String,
    pub device: String,
    pub host_interface: String,
    pub mac_address: String,
    pub status: String,
    pub ipv4_address: String,
    pub ipv4_address_available: Availability,
}

impl ObservedAdapter {
    fn field(&self, name: &str) -> Option<String> {
        let value: &str = match name {
            "type" => &self.network,
            "device" => &self.device,
            "host_interface" => &self.host_interface,
            "mac_address" => &self.mac_address,
            "status" => &self.status,
            "ipv4_address" => &self.ipv4_address,
            "ipv4_address_available" => self.ipv4_address_available.as_str(),
            _ => return None,
        };
        Some(value.to_string())
    }
}

/// Runtime network state of a machine.
///
/// `NotYetConverged` means the guest has not reported enough to correlate
/// adapters; it says nothing about the adapters being down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "adapters", rename_all = "snake_case")]
pub enum NetworkObservation {
    Reported(Vec<ObservedAdapter>),
    NotYetConverged,
}

impl NetworkObservation {
    pub fn adapters(&self) -> &[ObservedAdapter] {
        match self {
            Self::Reported(adapters) => adapters,
            Self::NotYetConverged => &[],
        }
    }
}

/// How to reach the machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    #[serde(rename = "type")]
    pub kind: String,
    pub host: String,
}

impl ConnectionInfo {
    pub fn ssh(host: impl Into<String>) -> Self {
        Self {
            kind: "ssh".to_string(),
            host: host.into(),
        }
    }
}

/// Everything a read reports about a machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedMachine {
    /// Hypervisor-assigned machine UUID.
    pub id: String,
    pub name: String,
    pub cpus: u32,
    pub memory: String,
    pub user_data: String,
    pub boot_order: Vec<String>,
    pub status: String,
    pub network: NetworkObservation,
    pub connection: Option<ConnectionInfo>,
}

impl ObservedMachine {
    /// Look up an attribute by path, e.g. `status` or
    /// `network_adapter.1.ipv4_address_available`.
    ///
    /// Returns `None` for unknown paths and for adapter fields while the
    /// network has not converged.
    pub fn attribute(&self, path: &str) -> Option<String> {
        match path {
            "id" => return Some(self.id.clone()),
            "name" => return Some(self.name.clone()),
            "cpus" => return Some(self.cpus.to_string()),
            "memory" => return Some(self.memory.clone()),
            "user_data" => return Some(self.user_data.clone()),
            "status" => return Some(self.status.clone()),
            _ => {}
        }

        let rest = path.strip_prefix("network_adapter.")?;
        let (index, field) = rest.split_once('.')?;
        let index: usize = index.parse().ok()?;
        self.network.adapters().get(index)?.field(field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(ip: &str) -> ObservedAdapter {
        ObservedAdapter {
            network: "hostonly".to_string(),
            device: "IntelPro1000MTServer".to_string(),
            host_interface: "vboxnet0".to_string(),
            mac_address: "080027000001".to_string(),
            status: "up".to_string(),
            ipv4_address: ip.to_string(),
            ipv4_address_available: if ip.is_empty() {
                Availability::No
            } else {
                Availability::Yes
            },
        }
    }

    fn observed(network: NetworkObservation) -> ObservedMachine {
        ObservedMachine {
            id: "uuid-1".to_string(),
            name: "web".to_string(),
            cpus: 2,
            memory: "512.0 mib".to_string(),
            user_data: String::new(),
            boot_order: vec!["disk".to_string()],
            status: "running".to_string(),
            network,
            connection: None,
        }
    }

    #[test]
    fn test_config_defaults_from_json() {
        let config: MachineConfig = serde_json::from_str(
            r#"{"name":"web","image":"ubuntu.tar.xz","network_adapter":[{"type":"nat"}]}"#,
        )
        .unwrap();

        assert_eq!(config.cpus, 2);
        assert_eq!(config.memory, "512mib");
        assert_eq!(config.network_adapter[0].device, "IntelPro1000MTServer");
        assert!(config.optical_disks.is_empty());
        assert_eq!(config, {
            let mut expected = MachineConfig::new("web", "ubuntu.tar.xz");
            expected.network_adapter = vec![NetworkAdapterConfig::new("nat")];
            expected
        });
    }

    #[test]
    fn test_attribute_paths() {
        let machine = observed(NetworkObservation::Reported(vec![adapter("192.168.56.101")]));

        assert_eq!(machine.attribute("status").as_deref(), Some("running"));
        assert_eq!(
            machine
                .attribute("network_adapter.0.ipv4_address_available")
                .as_deref(),
            Some("yes")
        );
        assert_eq!(
            machine.attribute("network_adapter.0.ipv4_address").as_deref(),
            Some("192.168.56.101")
        );
        assert_eq!(machine.attribute("network_adapter.1.status"), None);
        assert_eq!(machine.attribute("network_adapter.0.bogus"), None);
        assert_eq!(machine.attribute("nonsense"), None);
    }

    #[test]
    fn test_attribute_absent_until_converged() {
        let machine = observed(NetworkObservation::NotYetConverged);
        assert_eq!(
            machine.attribute("network_adapter.0.ipv4_address_available"),
            None
        );
    }

    #[test]
    fn test_network_observation_json_shape() {
        let json = serde_json::to_value(NetworkObservation::NotYetConverged).unwrap();
        assert_eq!(json, serde_json::json!({"state": "not_yet_converged"}));

        let json = serde_json::to_value(NetworkObservation::Reported(vec![adapter("")])).unwrap();
        assert_eq!(json["state"], "reported");
        assert_eq!(json["adapters"][0]["ipv4_address_available"], "no");
        assert_eq!(json["adapters"][0]["type"], "hostonly");
    }
}
