//! In-memory hypervisor for tests and development.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::{debug, info};
use uuid::Uuid;

use super::types::{
    BootDevice, CreatedMachine, MachineSettings, MachineState, NatNetwork, NativeMachine, Nic,
    NicNetwork, StorageAttachment, StorageController,
};
use super::{Hypervisor, HypervisorError};

const GUEST_NET_PREFIX: &str = "/VirtualBox/GuestInfo/Net/";

#[derive(Debug, Clone)]
struct MockMachine {
    record: NativeMachine,
    extra_data: HashMap<String, String>,
    controllers: Vec<StorageController>,
    attachments: Vec<StorageAttachment>,
    /// Guest network reads left before the guest reports its adapters.
    boot_reads_left: u32,
}

/// Mock hypervisor.
///
/// Machines live in memory. Disk clones copy the file so callers see real
/// artifacts on disk. A started machine's guest reports every adapter as up
/// with a synthetic IPv4 address after a configurable number of reads.
pub struct MockHypervisor {
    machines: Mutex<HashMap<String, MockMachine>>,
    nat_networks: Mutex<BTreeMap<String, NatNetwork>>,
    calls: Mutex<Vec<String>>,
    boot_reads: u32,
    mac_counter: AtomicU64,
}

impl MockHypervisor {
    /// Create a mock whose guests report their network on the first read.
    pub fn new() -> Self {
        Self {
            machines: Mutex::new(HashMap::new()),
            nat_networks: Mutex::new(BTreeMap::new()),
            calls: Mutex::new(Vec::new()),
            boot_reads: 0,
            mac_counter: AtomicU64::new(1),
        }
    }

    /// Guests stay silent for `reads` network-count reads after each boot.
    pub fn with_boot_delay(mut self, reads: u32) -> Self {
        self.boot_reads = reads;
        self
    }

    /// Operations performed so far, as `"<operation> <target>"`.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn machine_count(&self) -> usize {
        lock(&self.machines).len()
    }

    pub fn attachments(&self, id: &str) -> Vec<StorageAttachment> {
        let machines = lock(&self.machines);
        find(&machines, id)
            .map(|m| m.attachments.clone())
            .unwrap_or_default()
    }

    pub fn controllers(&self, id: &str) -> Vec<StorageController> {
        let machines = lock(&self.machines);
        find(&machines, id)
            .map(|m| m.controllers.clone())
            .unwrap_or_default()
    }

    /// Force a power state, as if changed outside the provisioner.
    pub fn set_state(&self, id: &str, state: MachineState) {
        let mut machines = lock(&self.machines);
        if let Some(machine) = find_mut(&mut machines, id) {
            machine.record.state = state;
        }
    }

    fn record(&self, call: String) {
        debug!(call = %call, "[MOCK] Hypervisor call");
        lock(&self.calls).push(call);
    }

    fn next_mac(&self) -> String {
        let n = self.mac_counter.fetch_add(1, Ordering::SeqCst);
        format!("080027{:06X}", n & 0xFF_FFFF)
    }

    fn with_machine<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut MockMachine) -> Result<T, HypervisorError>,
    ) -> Result<T, HypervisorError> {
        let mut machines = lock(&self.machines);
        let machine = find_mut(&mut machines, id)
            .ok_or_else(|| HypervisorError::MachineNotFound(id.to_string()))?;
        f(machine)
    }
}

impl Default for MockHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn find<'a>(machines: &'a HashMap<String, MockMachine>, id: &str) -> Option<&'a MockMachine> {
    machines
        .get(id)
        .or_else(|| machines.values().find(|m| m.record.name == id))
}

fn find_mut<'a>(
    machines: &'a mut HashMap<String, MockMachine>,
    id: &str,
) -> Option<&'a mut MockMachine> {
    let key = find(machines, id).map(|m| m.record.uuid.clone())?;
    machines.get_mut(&key)
}

fn rejected(command: &str, message: impl Into<String>) -> HypervisorError {
    HypervisorError::Rejected {
        command: command.to_string(),
        message: message.into(),
    }
}

/// Synthetic guest address of adapter `index`.
fn guest_ipv4(index: usize, nic: &Nic) -> String {
    match nic.network {
        NicNetwork::Nat => "10.0.2.15".to_string(),
        _ => format!("192.168.56.{}", 101 + index),
    }
}

#[async_trait]
impl Hypervisor for MockHypervisor {
    async fn create_machine(
        &self,
        name: &str,
        base_folder: &Path,
    ) -> Result<CreatedMachine, HypervisorError> {
        self.record(format!("create_machine {name}"));

        let exists = find(&lock(&self.machines), name).is_some();
        if exists {
            return Err(rejected(
                "createvm",
                format!("Machine settings file for '{name}' already exists"),
            ));
        }

        let dir = base_folder.join(name);
        tokio::fs::create_dir_all(&dir).await?;
        let settings_file = dir.join(format!("{name}.vbox"));
        tokio::fs::write(&settings_file, b"").await?;

        let uuid = Uuid::new_v4().to_string();
        let machine = MockMachine {
            record: NativeMachine {
                uuid: uuid.clone(),
                name: name.to_string(),
                settings_file: settings_file.clone(),
                state: MachineState::PowerOff,
                cpus: 1,
                memory_mib: 128,
                vram_mib: 8,
                boot_order: vec![
                    BootDevice::Floppy,
                    BootDevice::Dvd,
                    BootDevice::Disk,
                    BootDevice::None,
                ],
                nics: Vec::new(),
            },
            extra_data: HashMap::new(),
            controllers: Vec::new(),
            attachments: Vec::new(),
            boot_reads_left: 0,
        };
        lock(&self.machines).insert(uuid.clone(), machine);

        info!(name = %name, uuid = %uuid, "[MOCK] Machine registered");
        Ok(CreatedMachine {
            uuid,
            settings_file,
        })
    }

    async fn get_machine(&self, id: &str) -> Result<NativeMachine, HypervisorError> {
        let machines = lock(&self.machines);
        find(&machines, id)
            .map(|m| m.record.clone())
            .ok_or_else(|| HypervisorError::MachineNotFound(id.to_string()))
    }

    async fn modify_machine(
        &self,
        id: &str,
        settings: &MachineSettings,
    ) -> Result<(), HypervisorError> {
        self.record(format!("modify_machine {id}"));

        let mut macs: Vec<String> = Vec::new();
        let existing = self.with_machine(id, |m| {
            if m.record.state.holds_session() {
                return Err(rejected("modifyvm", "The machine is locked for a session"));
            }
            Ok(m.record
                .nics
                .iter()
                .map(|n| n.mac_address.clone())
                .collect::<Vec<_>>())
        })?;
        for i in 0..settings.nics.len() {
            macs.push(match existing.get(i) {
                Some(mac) if !mac.is_empty() => mac.clone(),
                _ => self.next_mac(),
            });
        }

        self.with_machine(id, |m| {
            m.record.cpus = settings.cpus;
            m.record.memory_mib = settings.memory_mib;
            m.record.vram_mib = settings.vram_mib;
            m.record.boot_order = settings.boot_order.to_vec();
            m.record.nics = settings
                .nics
                .iter()
                .zip(macs)
                .map(|(nic, mac)| Nic {
                    mac_address: mac,
                    ..nic.clone()
                })
                .collect();
            Ok(())
        })
    }

    async fn set_extra_data(
        &self,
        id: &str,
        key: &str,
        value: &str,
    ) -> Result<(), HypervisorError> {
        self.record(format!("set_extra_data {id} {key}"));
        self.with_machine(id, |m| {
            m.extra_data.insert(key.to_string(), value.to_string());
            Ok(())
        })
    }

    async fn get_extra_data(&self, id: &str, key: &str) -> Result<Option<String>, HypervisorError> {
        self.with_machine(id, |m| Ok(m.extra_data.get(key).cloned()))
    }

    async fn start_machine(&self, id: &str) -> Result<(), HypervisorError> {
        self.record(format!("start_machine {id}"));
        let boot_reads = self.boot_reads;
        self.with_machine(id, |m| {
            if m.record.state.is_running() {
                return Err(rejected("startvm", "The machine is already running"));
            }
            m.record.state = MachineState::Running;
            m.boot_reads_left = boot_reads;
            Ok(())
        })
    }

    async fn poweroff_machine(&self, id: &str) -> Result<(), HypervisorError> {
        self.record(format!("poweroff_machine {id}"));
        self.with_machine(id, |m| {
            if !m.record.state.holds_session() {
                return Err(rejected("controlvm", "Machine is not currently running"));
            }
            m.record.state = MachineState::PowerOff;
            Ok(())
        })
    }

    async fn delete_machine(&self, id: &str) -> Result<(), HypervisorError> {
        self.record(format!("delete_machine {id}"));

        let dir = {
            let mut machines = lock(&self.machines);
            let machine = find(&machines, id)
                .ok_or_else(|| HypervisorError::MachineNotFound(id.to_string()))?;
            if machine.record.state.holds_session() {
                return Err(rejected(
                    "unregistervm",
                    "Cannot unregister the machine because it is locked",
                ));
            }
            let key = machine.record.uuid.clone();
            machines
                .remove(&key)
                .map(|m| m.record.dir().to_path_buf())
        };

        if let Some(dir) = dir {
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn set_disk_uuid(&self, disk: &Path) -> Result<(), HypervisorError> {
        self.record(format!("set_disk_uuid {}", disk.display()));
        if tokio::fs::metadata(disk).await.is_err() {
            return Err(rejected(
                "internalcommands sethduuid",
                format!("Could not open {}", disk.display()),
            ));
        }
        Ok(())
    }

    async fn clone_disk(&self, src: &Path, dst: &Path) -> Result<(), HypervisorError> {
        self.record(format!("clone_disk {} {}", src.display(), dst.display()));
        if tokio::fs::metadata(dst).await.is_ok() {
            return Err(rejected(
                "clonemedium",
                format!("Cannot create {}: file exists", dst.display()),
            ));
        }
        tokio::fs::copy(src, dst).await?;
        Ok(())
    }

    async fn add_storage_controller(
        &self,
        id: &str,
        controller: &StorageController,
    ) -> Result<(), HypervisorError> {
        self.record(format!("add_storage_controller {id} {}", controller.name));
        self.with_machine(id, |m| {
            m.controllers.push(controller.clone());
            Ok(())
        })
    }

    async fn attach_storage(
        &self,
        id: &str,
        controller: &str,
        attachment: &StorageAttachment,
    ) -> Result<(), HypervisorError> {
        self.record(format!(
            "attach_storage {id} {controller} {} {}",
            attachment.port,
            attachment.medium.display()
        ));
        self.with_machine(id, |m| {
            let ctl = m
                .controllers
                .iter()
                .find(|c| c.name == controller)
                .ok_or_else(|| rejected("storageattach", format!("No controller '{controller}'")))?;
            if attachment.port >= ctl.port_count {
                return Err(rejected(
                    "storageattach",
                    format!("Port {} out of range (0-{})", attachment.port, ctl.port_count.saturating_sub(1)),
                ));
            }
            m.attachments.push(attachment.clone());
            Ok(())
        })
    }

    async fn guest_property(&self, id: &str, key: &str) -> Result<Option<String>, HypervisorError> {
        self.with_machine(id, |m| {
            if !m.record.state.is_running() {
                return Ok(None);
            }
            let Some(rest) = key.strip_prefix(GUEST_NET_PREFIX) else {
                return Ok(None);
            };

            if rest == "Count" {
                if m.boot_reads_left > 0 {
                    m.boot_reads_left -= 1;
                    return Ok(None);
                }
                return Ok(Some(m.record.nics.len().to_string()));
            }
            if m.boot_reads_left > 0 {
                return Ok(None);
            }

            let Some((index, field)) = rest.split_once('/') else {
                return Ok(None);
            };
            let Some((index, nic)) = index
                .parse::<usize>()
                .ok()
                .and_then(|i| m.record.nics.get(i).map(|nic| (i, nic)))
            else {
                return Ok(None);
            };

            Ok(match field {
                "MAC" => Some(nic.mac_address.clone()),
                "Status" => Some("Up".to_string()),
                "V4/IP" => Some(guest_ipv4(index, nic)),
                _ => None,
            })
        })
    }

    async fn create_nat_network(&self, network: &NatNetwork) -> Result<(), HypervisorError> {
        self.record(format!("create_nat_network {}", network.name));
        let mut networks = lock(&self.nat_networks);
        if networks.contains_key(&network.name) {
            return Err(rejected(
                "natnetwork add",
                format!("NATNetwork server already exists: {}", network.name),
            ));
        }
        networks.insert(network.name.clone(), network.clone());
        Ok(())
    }

    async fn get_nat_network(&self, name: &str) -> Result<Option<NatNetwork>, HypervisorError> {
        Ok(lock(&self.nat_networks).get(name).cloned())
    }

    async fn modify_nat_network(&self, network: &NatNetwork) -> Result<(), HypervisorError> {
        self.record(format!("modify_nat_network {}", network.name));
        let mut networks = lock(&self.nat_networks);
        match networks.get_mut(&network.name) {
            Some(existing) => {
                *existing = network.clone();
                Ok(())
            }
            None => Err(HypervisorError::NatNetworkNotFound(network.name.clone())),
        }
    }

    async fn remove_nat_network(&self, name: &str) -> Result<(), HypervisorError> {
        self.record(format!("remove_nat_network {name}"));
        lock(&self.nat_networks)
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| HypervisorError::NatNetworkNotFound(name.to_string()))
    }
}
