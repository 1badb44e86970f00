//! `VBoxManage` command-line backend.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::types::{
    BootDevice, CreatedMachine, MachineSettings, MachineState, NatNetwork, NativeMachine, Nic,
    NicHardware, NicNetwork, StorageAttachment, StorageController, VirtFeature,
};
use super::{Hypervisor, HypervisorError};
use crate::command::{render, CommandOutput, CommandRunner};

/// Adapter slots addressed on write and scanned on read.
const MAX_NICS: usize = 8;

const ERROR_PREFIX: &str = "VBoxManage: error:";

const NOT_FOUND_MARKERS: [&str; 2] = ["Could not find a registered machine", "VBOX_E_OBJECT_NOT_FOUND"];

const NETWORK_TOKENS: [(NicNetwork, &str); 6] = [
    (NicNetwork::Nat, "nat"),
    (NicNetwork::Bridged, "bridged"),
    (NicNetwork::HostOnly, "hostonly"),
    (NicNetwork::Internal, "intnet"),
    (NicNetwork::Generic, "generic"),
    (NicNetwork::NatNetwork, "natnetwork"),
];

const HARDWARE_TOKENS: [(NicHardware, &str); 6] = [
    (NicHardware::AmdPcNetPciII, "Am79C970A"),
    (NicHardware::AmdPcNetFastIII, "Am79C973"),
    (NicHardware::IntelPro1000MtDesktop, "82540EM"),
    (NicHardware::IntelPro1000TServer, "82543GC"),
    (NicHardware::IntelPro1000MtServer, "82545EM"),
    (NicHardware::VirtIo, "virtio"),
];

fn network_token(network: NicNetwork) -> &'static str {
    NETWORK_TOKENS
        .iter()
        .find(|(n, _)| *n == network)
        .map(|(_, token)| *token)
        .unwrap_or("null")
}

fn network_from_token(token: &str) -> Option<NicNetwork> {
    NETWORK_TOKENS
        .iter()
        .find(|(_, t)| *t == token)
        .map(|(n, _)| *n)
}

fn hardware_token(hardware: NicHardware) -> &'static str {
    HARDWARE_TOKENS
        .iter()
        .find(|(h, _)| *h == hardware)
        .map(|(_, token)| *token)
        .unwrap_or("82545EM")
}

fn hardware_from_token(token: &str) -> Option<NicHardware> {
    HARDWARE_TOKENS
        .iter()
        .find(|(_, t)| *t == token)
        .map(|(h, _)| *h)
}

fn feature_flag(feature: VirtFeature) -> &'static str {
    match feature {
        VirtFeature::Acpi => "--acpi",
        VirtFeature::IoApic => "--ioapic",
        VirtFeature::RtcUseUtc => "--rtcuseutc",
        VirtFeature::Pae => "--pae",
        VirtFeature::HwVirtEx => "--hwvirtex",
        VirtFeature::NestedPaging => "--nestedpaging",
        VirtFeature::LargePages => "--largepages",
        VirtFeature::LongMode => "--longmode",
        VirtFeature::VtxVpid => "--vtxvpid",
        VirtFeature::VtxUx => "--vtxux",
    }
}

/// Machine-readable key carrying the host-side name for a mode, if any.
fn host_interface_key(network: NicNetwork) -> Option<&'static str> {
    match network {
        NicNetwork::Bridged => Some("bridgeadapter"),
        NicNetwork::HostOnly => Some("hostonlyadapter"),
        NicNetwork::NatNetwork => Some("nat-network"),
        NicNetwork::Internal => Some("intnet"),
        NicNetwork::Nat | NicNetwork::Generic => None,
    }
}

fn on_off(flag: bool) -> &'static str {
    if flag {
        "on"
    } else {
        "off"
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn args<const N: usize>(list: [&str; N]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

/// Hypervisor backed by the `VBoxManage` CLI.
pub struct VBoxManage {
    program: String,
    runner: Arc<dyn CommandRunner>,
}

impl VBoxManage {
    pub const DEFAULT_PROGRAM: &'static str = "VBoxManage";

    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self::with_program(Self::DEFAULT_PROGRAM, runner)
    }

    pub fn with_program(program: impl Into<String>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            program: program.into(),
            runner,
        }
    }

    /// Run a subcommand, failing on a non-zero exit or any reported error line.
    async fn exec(&self, args: Vec<String>) -> Result<CommandOutput, HypervisorError> {
        let output = self.runner.run(&self.program, &args).await?;

        let errors: Vec<&str> = output
            .stderr
            .lines()
            .filter_map(|line| line.trim().strip_prefix(ERROR_PREFIX))
            .map(str::trim)
            .collect();

        if output.success() && errors.is_empty() {
            return Ok(output);
        }

        let message = if !errors.is_empty() {
            errors.join("; ")
        } else if !output.stderr.trim().is_empty() {
            output.stderr.trim().to_string()
        } else {
            match output.status {
                Some(code) => format!("exit status {code}"),
                None => "terminated by signal".to_string(),
            }
        };

        Err(HypervisorError::Rejected {
            command: render(&self.program, &args),
            message,
        })
    }
}

#[async_trait]
impl Hypervisor for VBoxManage {
    async fn create_machine(
        &self,
        name: &str,
        base_folder: &Path,
    ) -> Result<CreatedMachine, HypervisorError> {
        let mut argv = args(["createvm", "--name", name, "--basefolder"]);
        argv.push(path_arg(base_folder));
        argv.push("--register".to_string());

        let command = render(&self.program, &argv);
        let output = self.exec(argv).await?;
        let created = parse_created(&command, &output.stdout)?;

        info!(name = %name, uuid = %created.uuid, "Machine registered");
        Ok(created)
    }

    async fn get_machine(&self, id: &str) -> Result<NativeMachine, HypervisorError> {
        let argv = args(["showvminfo", id, "--machinereadable"]);
        let command = render(&self.program, &argv);

        let output = match self.exec(argv).await {
            Ok(output) => output,
            Err(HypervisorError::Rejected { message, .. })
                if NOT_FOUND_MARKERS.iter().any(|m| message.contains(m)) =>
            {
                return Err(HypervisorError::MachineNotFound(id.to_string()));
            }
            Err(e) => return Err(e),
        };

        parse_machine(&command, &parse_machine_readable(&output.stdout))
    }

    async fn modify_machine(
        &self,
        id: &str,
        settings: &MachineSettings,
    ) -> Result<(), HypervisorError> {
        debug!(machine_id = %id, cpus = settings.cpus, memory_mib = settings.memory_mib, "Modifying machine");
        self.exec(modify_args(id, settings)).await?;
        Ok(())
    }

    async fn set_extra_data(
        &self,
        id: &str,
        key: &str,
        value: &str,
    ) -> Result<(), HypervisorError> {
        self.exec(args(["setextradata", id, key, value])).await?;
        Ok(())
    }

    async fn get_extra_data(&self, id: &str, key: &str) -> Result<Option<String>, HypervisorError> {
        let argv = args(["getextradata", id, key]);
        let command = render(&self.program, &argv);
        let output = self.exec(argv).await?;
        parse_value(&command, &output.stdout)
    }

    async fn start_machine(&self, id: &str) -> Result<(), HypervisorError> {
        info!(machine_id = %id, "Starting machine");
        self.exec(args(["startvm", id, "--type", "headless"])).await?;
        Ok(())
    }

    async fn poweroff_machine(&self, id: &str) -> Result<(), HypervisorError> {
        info!(machine_id = %id, "Powering off machine");
        self.exec(args(["controlvm", id, "poweroff"])).await?;
        Ok(())
    }

    async fn delete_machine(&self, id: &str) -> Result<(), HypervisorError> {
        info!(machine_id = %id, "Deleting machine");
        self.exec(args(["unregistervm", id, "--delete"])).await?;
        Ok(())
    }

    async fn set_disk_uuid(&self, disk: &Path) -> Result<(), HypervisorError> {
        let mut argv = args(["internalcommands", "sethduuid"]);
        argv.push(path_arg(disk));
        self.exec(argv).await?;
        Ok(())
    }

    async fn clone_disk(&self, src: &Path, dst: &Path) -> Result<(), HypervisorError> {
        let mut argv = args(["clonemedium", "disk"]);
        argv.push(path_arg(src));
        argv.push(path_arg(dst));
        self.exec(argv).await?;
        Ok(())
    }

    async fn add_storage_controller(
        &self,
        id: &str,
        controller: &StorageController,
    ) -> Result<(), HypervisorError> {
        let port_count = controller.port_count.to_string();
        self.exec(args([
            "storagectl",
            id,
            "--name",
            &controller.name,
            "--add",
            &controller.bus,
            "--controller",
            &controller.chipset,
            "--portcount",
            &port_count,
            "--hostiocache",
            on_off(controller.host_io_cache),
            "--bootable",
            on_off(controller.bootable),
        ]))
        .await?;
        Ok(())
    }

    async fn attach_storage(
        &self,
        id: &str,
        controller: &str,
        attachment: &StorageAttachment,
    ) -> Result<(), HypervisorError> {
        let port = attachment.port.to_string();
        let device = attachment.device.to_string();
        let mut argv = args([
            "storageattach",
            id,
            "--storagectl",
            controller,
            "--port",
            &port,
            "--device",
            &device,
            "--type",
            attachment.drive.as_str(),
            "--medium",
        ]);
        argv.push(path_arg(&attachment.medium));
        self.exec(argv).await?;
        Ok(())
    }

    async fn guest_property(&self, id: &str, key: &str) -> Result<Option<String>, HypervisorError> {
        let argv = args(["guestproperty", "get", id, key]);
        let command = render(&self.program, &argv);
        let output = self.exec(argv).await?;
        parse_value(&command, &output.stdout)
    }

    async fn create_nat_network(&self, network: &NatNetwork) -> Result<(), HypervisorError> {
        info!(name = %network.name, network = %network.network, "Creating NAT network");
        self.exec(args([
            "natnetwork",
            "add",
            "--netname",
            &network.name,
            "--network",
            &network.network,
            "--enable",
            "--dhcp",
            on_off(network.dhcp),
        ]))
        .await?;
        Ok(())
    }

    async fn get_nat_network(&self, name: &str) -> Result<Option<NatNetwork>, HypervisorError> {
        let output = self.exec(args(["natnetwork", "list"])).await?;
        Ok(parse_nat_networks(&output.stdout)
            .into_iter()
            .find(|n| n.name == name))
    }

    async fn modify_nat_network(&self, network: &NatNetwork) -> Result<(), HypervisorError> {
        self.exec(args([
            "natnetwork",
            "modify",
            "--netname",
            &network.name,
            "--network",
            &network.network,
            "--dhcp",
            on_off(network.dhcp),
        ]))
        .await?;
        Ok(())
    }

    async fn remove_nat_network(&self, name: &str) -> Result<(), HypervisorError> {
        info!(name = %name, "Removing NAT network");
        self.exec(args(["natnetwork", "remove", "--netname", name]))
            .await?;
        Ok(())
    }
}

/// `modifyvm` argument vector applying every setting, unused NIC slots cleared.
fn modify_args(id: &str, settings: &MachineSettings) -> Vec<String> {
    let mut argv = args([
        "modifyvm",
        id,
        "--ostype",
        &settings.os_type,
        "--cpus",
        &settings.cpus.to_string(),
        "--memory",
        &settings.memory_mib.to_string(),
        "--vram",
        &settings.vram_mib.to_string(),
    ]);

    for feature in VirtFeature::ALL {
        argv.push(feature_flag(feature).to_string());
        argv.push(on_off(settings.features.contains(&feature)).to_string());
    }

    for (i, device) in settings.boot_order.iter().enumerate() {
        argv.push(format!("--boot{}", i + 1));
        argv.push(device.as_str().to_string());
    }

    for (i, nic) in settings.nics.iter().enumerate() {
        let slot = i + 1;
        argv.push(format!("--nic{slot}"));
        argv.push(network_token(nic.network).to_string());
        argv.push(format!("--nictype{slot}"));
        argv.push(hardware_token(nic.hardware).to_string());

        if let Some(key) = host_interface_key(nic.network) {
            if !nic.host_interface.is_empty() {
                argv.push(format!("--{key}{slot}"));
                argv.push(nic.host_interface.clone());
            }
        }
    }

    for slot in settings.nics.len() + 1..=MAX_NICS {
        argv.push(format!("--nic{slot}"));
        argv.push("none".to_string());
    }

    argv
}

/// Parse `key="value"` lines of `--machinereadable` output.
fn parse_machine_readable(stdout: &str) -> HashMap<String, String> {
    stdout
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| {
            (
                key.trim().trim_matches('"').to_string(),
                value.trim().trim_matches('"').to_string(),
            )
        })
        .collect()
}

fn parse_machine(
    command: &str,
    props: &HashMap<String, String>,
) -> Result<NativeMachine, HypervisorError> {
    let parse_error = |reason: String| HypervisorError::Parse {
        command: command.to_string(),
        reason,
    };
    let required = |key: &str| {
        props
            .get(key)
            .cloned()
            .ok_or_else(|| parse_error(format!("missing '{key}'")))
    };
    let number = |key: &str| -> Result<u64, HypervisorError> {
        let raw = required(key)?;
        raw.parse()
            .map_err(|_| parse_error(format!("'{key}' is not a number: {raw}")))
    };

    let boot_order = (1..=BootDevice::SLOTS)
        .map(|slot| {
            props
                .get(&format!("boot{slot}"))
                .and_then(|v| BootDevice::parse(v))
                .unwrap_or_default()
        })
        .collect();

    let mut nics = Vec::new();
    for slot in 1..=MAX_NICS {
        let token = match props.get(&format!("nic{slot}")) {
            None => break,
            Some(token) if token == "none" => break,
            Some(token) => token,
        };
        let network = network_from_token(token)
            .ok_or_else(|| parse_error(format!("unknown network mode '{token}' on nic{slot}")))?;
        let hardware = match props.get(&format!("nictype{slot}")) {
            Some(token) => hardware_from_token(token).ok_or_else(|| {
                parse_error(format!("unknown adapter type '{token}' on nic{slot}"))
            })?,
            None => NicHardware::default(),
        };
        let host_interface = host_interface_key(network)
            .and_then(|key| props.get(&format!("{key}{slot}")))
            .cloned()
            .unwrap_or_default();
        let mac_address = props
            .get(&format!("macaddress{slot}"))
            .cloned()
            .unwrap_or_default();

        nics.push(Nic {
            network,
            hardware,
            host_interface,
            mac_address,
        });
    }

    let cpus = number("cpus")?;
    let cpus =
        u32::try_from(cpus).map_err(|_| parse_error(format!("'cpus' out of range: {cpus}")))?;

    Ok(NativeMachine {
        uuid: required("UUID")?,
        name: required("name")?,
        settings_file: PathBuf::from(props.get("CfgFile").cloned().unwrap_or_default()),
        state: MachineState::parse(props.get("VMState").map(String::as_str).unwrap_or("")),
        cpus,
        memory_mib: number("memory")?,
        vram_mib: props.get("vram").and_then(|v| v.parse().ok()).unwrap_or(0),
        boot_order,
        nics,
    })
}

/// Parse the `createvm` report.
fn parse_created(command: &str, stdout: &str) -> Result<CreatedMachine, HypervisorError> {
    let mut uuid = None;
    let mut settings_file = None;

    for line in stdout.lines() {
        if let Some(rest) = line.strip_prefix("UUID:") {
            uuid = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("Settings file:") {
            settings_file = Some(PathBuf::from(rest.trim().trim_matches('\'')));
        }
    }

    match (uuid, settings_file) {
        (Some(uuid), Some(settings_file)) => Ok(CreatedMachine {
            uuid,
            settings_file,
        }),
        _ => Err(HypervisorError::Parse {
            command: command.to_string(),
            reason: "missing UUID or settings file".to_string(),
        }),
    }
}

/// Parse `Value: x` / `No value set!` answers.
///
/// The value is kept byte for byte apart from the single newline the CLI
/// appends, so user data with surrounding whitespace reads back unchanged.
fn parse_value(command: &str, stdout: &str) -> Result<Option<String>, HypervisorError> {
    let body = stdout
        .strip_suffix("\r\n")
        .or_else(|| stdout.strip_suffix('\n'))
        .unwrap_or(stdout);
    if let Some(value) = body.strip_prefix("Value: ") {
        return Ok(Some(value.to_string()));
    }
    if body.trim_start().starts_with("No value set") {
        return Ok(None);
    }
    Err(HypervisorError::Parse {
        command: command.to_string(),
        reason: format!("expected a value, got '{}'", body.trim()),
    })
}

/// Parse `natnetwork list`. Accepts both the `Name:` and older
/// `NetworkName:` record headers.
fn parse_nat_networks(stdout: &str) -> Vec<NatNetwork> {
    let mut networks = Vec::new();
    let mut current: Option<NatNetwork> = None;

    for line in stdout.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "Name" | "NetworkName" => {
                if let Some(done) = current.take() {
                    networks.push(done);
                }
                current = Some(NatNetwork {
                    name: value.to_string(),
                    network: String::new(),
                    dhcp: false,
                });
            }
            "Network" => {
                if let Some(net) = current.as_mut() {
                    net.network = value.to_string();
                }
            }
            "DHCP Enabled" | "DHCP Server" | "DHCP" => {
                if let Some(net) = current.as_mut() {
                    net.dhcp = value.eq_ignore_ascii_case("yes");
                }
            }
            _ => {}
        }
    }

    if let Some(done) = current {
        networks.push(done);
    }
    networks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandOutput, MockRunner};
    use crate::hypervisor::DriveType;

    const SHOWVMINFO: &str = r#"name="web"
groups="/"
ostype="Ubuntu (64-bit)"
UUID="5b1d7a3e-2f4c-4b8e-9a0d-3c6e1f2a7b90"
CfgFile="/home/me/.vmprov/machine/web/web.vbox"
memory=1024
vram=20
cpus=4
boot1="disk"
boot2="dvd"
boot3="none"
boot4="none"
VMState="running"
VMStateChangeTime="2026-10-19T09:12:44.000000000"
nic1="nat"
nictype1="82545EM"
macaddress1="080027A1B2C3"
cableconnected1="on"
nic2="bridged"
nictype2="virtio"
macaddress2="080027D4E5F6"
bridgeadapter2="en0"
nic3="none"
nic4="none"
"#;

    fn setup() -> (Arc<MockRunner>, VBoxManage) {
        let runner = Arc::new(MockRunner::new());
        let vbox = VBoxManage::new(runner.clone());
        (runner, vbox)
    }

    #[tokio::test]
    async fn test_get_machine_parses_machine_readable() {
        let (runner, vbox) = setup();
        runner.push(CommandOutput::ok(SHOWVMINFO));

        let machine = vbox.get_machine("web").await.unwrap();

        assert_eq!(machine.uuid, "5b1d7a3e-2f4c-4b8e-9a0d-3c6e1f2a7b90");
        assert_eq!(machine.name, "web");
        assert_eq!(machine.state, MachineState::Running);
        assert_eq!(machine.cpus, 4);
        assert_eq!(machine.memory_mib, 1024);
        assert_eq!(machine.vram_mib, 20);
        assert_eq!(machine.dir(), Path::new("/home/me/.vmprov/machine/web"));
        assert_eq!(
            machine.boot_order,
            vec![BootDevice::Disk, BootDevice::Dvd, BootDevice::None, BootDevice::None]
        );
        assert_eq!(machine.nics.len(), 2);
        assert_eq!(machine.nics[0].network, NicNetwork::Nat);
        assert_eq!(machine.nics[0].hardware, NicHardware::IntelPro1000MtServer);
        assert_eq!(machine.nics[0].mac_address, "080027A1B2C3");
        assert_eq!(machine.nics[1].network, NicNetwork::Bridged);
        assert_eq!(machine.nics[1].hardware, NicHardware::VirtIo);
        assert_eq!(machine.nics[1].host_interface, "en0");

        assert_eq!(
            runner.command_lines(),
            vec!["VBoxManage showvminfo web --machinereadable"]
        );
    }

    #[tokio::test]
    async fn test_get_machine_not_found() {
        let (runner, vbox) = setup();
        runner.push(CommandOutput::failed(
            1,
            "VBoxManage: error: Could not find a registered machine named 'ghost'\n\
             VBoxManage: error: Details: code VBOX_E_OBJECT_NOT_FOUND (0x80bb0001)\n",
        ));

        let err = vbox.get_machine("ghost").await.unwrap_err();
        assert!(matches!(err, HypervisorError::MachineNotFound(ref id) if id == "ghost"));
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_error_line_fails_even_with_zero_exit() {
        let (runner, vbox) = setup();
        runner.push(CommandOutput {
            status: Some(0),
            stdout: String::new(),
            stderr: "VBoxManage: error: The machine is locked\n".to_string(),
        });

        let err = vbox.start_machine("web").await.unwrap_err();
        match err {
            HypervisorError::Rejected { command, message } => {
                assert_eq!(command, "VBoxManage startvm web --type headless");
                assert_eq!(message, "The machine is locked");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_create_machine_parses_report() {
        let (runner, vbox) = setup();
        runner.push(CommandOutput::ok(
            "Virtual machine 'web' is created and registered.\n\
             UUID: 0f6c1c4e-8d0b-4a52-9f3c-5e2b7d9a1c11\n\
             Settings file: '/base/machine/web/web.vbox'\n",
        ));

        let created = vbox
            .create_machine("web", Path::new("/base/machine"))
            .await
            .unwrap();

        assert_eq!(created.uuid, "0f6c1c4e-8d0b-4a52-9f3c-5e2b7d9a1c11");
        assert_eq!(created.dir(), Path::new("/base/machine/web"));
        assert_eq!(
            runner.command_lines(),
            vec!["VBoxManage createvm --name web --basefolder /base/machine --register"]
        );
    }

    #[tokio::test]
    async fn test_guest_property_values() {
        let (runner, vbox) = setup();
        runner.push(CommandOutput::ok("Value: 2\n"));
        runner.push(CommandOutput::ok("No value set!\n"));

        let count = vbox
            .guest_property("web", "/VirtualBox/GuestInfo/Net/Count")
            .await
            .unwrap();
        let ip = vbox
            .guest_property("web", "/VirtualBox/GuestInfo/Net/0/V4/IP")
            .await
            .unwrap();

        assert_eq!(count.as_deref(), Some("2"));
        assert_eq!(ip, None);
        assert_eq!(
            runner.command_lines()[0],
            "VBoxManage guestproperty get web /VirtualBox/GuestInfo/Net/Count"
        );
    }

    #[tokio::test]
    async fn test_extra_data_keeps_surrounding_whitespace() {
        let (runner, vbox) = setup();
        runner.push(CommandOutput::ok("Value:   indented\nhostname: web\n\n"));

        let value = vbox.get_extra_data("web", "vmprov/user_data").await.unwrap();

        assert_eq!(value.as_deref(), Some("  indented\nhostname: web\n"));
    }

    #[tokio::test]
    async fn test_get_machine_rejects_out_of_range_cpus() {
        let (runner, vbox) = setup();
        runner.push(CommandOutput::ok(
            SHOWVMINFO.replace("cpus=4", "cpus=4294967296"),
        ));

        let err = vbox.get_machine("web").await.unwrap_err();

        assert!(matches!(err, HypervisorError::Parse { ref reason, .. } if reason.contains("cpus")));
    }

    #[test]
    fn test_modify_args() {
        let settings = MachineSettings {
            os_type: "Linux_64".to_string(),
            cpus: 2,
            memory_mib: 512,
            vram_mib: 20,
            features: VirtFeature::ALL.to_vec(),
            boot_order: [BootDevice::Disk, BootDevice::None, BootDevice::None, BootDevice::None],
            nics: vec![
                Nic {
                    network: NicNetwork::Nat,
                    hardware: NicHardware::IntelPro1000MtServer,
                    host_interface: String::new(),
                    mac_address: String::new(),
                },
                Nic {
                    network: NicNetwork::HostOnly,
                    hardware: NicHardware::VirtIo,
                    host_interface: "vboxnet0".to_string(),
                    mac_address: String::new(),
                },
            ],
        };

        let line = modify_args("web", &settings).join(" ");

        assert!(line.starts_with("modifyvm web --ostype Linux_64 --cpus 2 --memory 512 --vram 20"));
        assert!(line.contains("--acpi on"));
        assert!(line.contains("--vtxux on"));
        assert!(line.contains("--boot1 disk --boot2 none --boot3 none --boot4 none"));
        assert!(line.contains("--nic1 nat --nictype1 82545EM --nic2 hostonly --nictype2 virtio --hostonlyadapter2 vboxnet0"));
        assert!(line.ends_with("--nic8 none"));
        assert!(line.contains("--nic3 none"));
    }

    #[test]
    fn test_modify_args_turns_off_missing_features() {
        let settings = MachineSettings {
            os_type: "Linux_64".to_string(),
            cpus: 1,
            memory_mib: 256,
            vram_mib: 20,
            features: vec![VirtFeature::Acpi],
            boot_order: [BootDevice::None; BootDevice::SLOTS],
            nics: Vec::new(),
        };

        let line = modify_args("web", &settings).join(" ");
        assert!(line.contains("--acpi on"));
        assert!(line.contains("--pae off"));
        assert!(line.contains("--nic1 none"));
    }

    #[tokio::test]
    async fn test_storage_commands() {
        let (runner, vbox) = setup();

        vbox.add_storage_controller("web", &StorageController::sata(3))
            .await
            .unwrap();
        vbox.attach_storage(
            "web",
            "SATA",
            &StorageAttachment {
                port: 1,
                device: 0,
                drive: DriveType::Dvd,
                medium: PathBuf::from("/m/seed.iso"),
            },
        )
        .await
        .unwrap();

        assert_eq!(
            runner.command_lines(),
            vec![
                "VBoxManage storagectl web --name SATA --add sata --controller IntelAhci --portcount 3 --hostiocache on --bootable on",
                "VBoxManage storageattach web --storagectl SATA --port 1 --device 0 --type dvddrive --medium /m/seed.iso",
            ]
        );
    }

    #[test]
    fn test_parse_nat_networks() {
        let current = "NAT Networks:\n\n\
            Name:        lab\n\
            Network:     10.0.9.0/24\n\
            Gateway:     10.0.9.1\n\
            DHCP Server: Yes\n\
            IPv6:        No\n\
            Enabled:     Yes\n\n\
            Name:        quiet\n\
            Network:     10.0.8.0/24\n\
            DHCP Server: No\n\n\
            2 networks found\n";

        let networks = parse_nat_networks(current);
        assert_eq!(
            networks,
            vec![
                NatNetwork {
                    name: "lab".to_string(),
                    network: "10.0.9.0/24".to_string(),
                    dhcp: true,
                },
                NatNetwork {
                    name: "quiet".to_string(),
                    network: "10.0.8.0/24".to_string(),
                    dhcp: false,
                },
            ]
        );

        let legacy = "NetworkName:    NatNetwork\nIP:             10.0.2.1\nNetwork:        10.0.2.0/24\nDHCP Enabled:   Yes\n";
        let networks = parse_nat_networks(legacy);
        assert_eq!(networks.len(), 1);
        assert_eq!(networks[0].name, "NatNetwork");
        assert!(networks[0].dhcp);
    }

    #[tokio::test]
    async fn test_get_nat_network_absent() {
        let (runner, vbox) = setup();
        runner.push(CommandOutput::ok("NAT Networks:\n\n0 networks found\n"));

        assert_eq!(vbox.get_nat_network("lab").await.unwrap(), None);
    }

    #[test]
    fn test_token_tables_are_bijective() {
        for (network, token) in NETWORK_TOKENS {
            assert_eq!(network_from_token(token), Some(network));
            assert_eq!(network_token(network), token);
        }
        for (hardware, token) in HARDWARE_TOKENS {
            assert_eq!(hardware_from_token(token), Some(hardware));
            assert_eq!(hardware_token(hardware), token);
        }
    }
}
