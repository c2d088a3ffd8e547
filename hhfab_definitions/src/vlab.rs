#![allow(non_snake_case)]

use crate::ports::{api_port, ssh_port, vm_uuid};
use crate::wiring::Wiring;
use crate::Result;

/// What a VM is for
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum VmType {
    Control,
    Server,
    Switch,
    Gateway,
    External,
}

/// Resources handed to QEMU
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct VmSize {
    pub cpu: u32,
    /// MB
    pub ram: u32,
    /// GB
    pub disk: u32,
}

impl VmSize {
    pub fn for_type(t: &VmType) -> VmSize {
        match t {
            VmType::Control => VmSize { cpu: 6, ram: 6144, disk: 100 },
            VmType::Gateway => VmSize { cpu: 6, ram: 6144, disk: 50 },
            VmType::Switch => VmSize { cpu: 4, ram: 5120, disk: 50 },
            VmType::Server | VmType::External => VmSize { cpu: 2, ram: 768, disk: 10 },
        }
    }
}

/// A structured NIC descriptor
///
/// The QEMU argument generator is the only place these become argv; nothing
/// else carries hypervisor fragments around.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub enum Nic {
    /// User-mode network with the VM's ssh endpoint forwarded to a host
    /// port, and the kubernetes api too on controls
    UserNet {
        sshPort: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        apiPort: Option<u16>,
    },
    /// TAP enslaved to the management bridge, by pool index
    TapBridged { tap: usize, mac: String },
    /// Host PCI device handed through whole
    PciPassthrough { bdf: String },
}

/// One VM of the vlab
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct Vm {
    pub name: String,
    pub kind: VmType,
    pub id: u32,
    pub size: VmSize,
    pub nics: Vec<Nic>,
}

impl Vm {
    pub fn uuid(&self) -> String {
        vm_uuid(self.id)
    }

    pub fn ssh_port(&self) -> u16 {
        ssh_port(self.id)
    }
}

/// Everything the host needs to run the vlab
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct VlabPlan {
    /// TAPs the bridge pool must hold
    pub tapCount: usize,
    /// PCI BDFs bound to the passthrough driver
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub passthroughs: Vec<String>,
    /// Authorized public key injected into every VM
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub authorizedKey: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vms: Vec<Vm>,
}

impl VlabPlan {
    pub fn get(&self, name: &str) -> Option<&Vm> {
        self.vms.iter().find(|v| v.name == name)
    }

    pub fn controls(&self) -> Vec<&Vm> {
        self.vms.iter().filter(|v| v.kind == VmType::Control).collect()
    }
}

fn node_mac(id: u32) -> String {
    format!("0c:20:12:01:{:02x}:00", id)
}

/// Derive the VM fleet from a frozen wiring
///
/// IDs are handed out in a fixed order (controls, gateways, switches,
/// servers) so ssh ports and UUIDs are reproducible across runs against
/// the same wiring.
pub fn plan(w: &Wiring, passthroughs: &[String], authorized_key: &str) -> Result<VlabPlan> {
    let mut vms = vec![];
    let mut id: u32 = 0;
    let mut passthrough_pool = passthroughs.iter();

    let mut push = |vms: &mut Vec<Vm>, id: &mut u32, name: String, kind: VmType, mac: Option<String>, extra: Vec<Nic>| {
        let size = VmSize::for_type(&kind);
        let api = if kind == VmType::Control { Some(api_port(*id)) } else { None };
        let mut nics = vec![
            Nic::UserNet { sshPort: ssh_port(*id), apiPort: api },
            Nic::TapBridged { tap: *id as usize, mac: mac.unwrap_or_else(|| node_mac(*id)) },
        ];
        nics.extend(extra);
        vms.push(Vm { name, kind, id: *id, size, nics });
        *id += 1;
    };

    let mut names: Vec<String> = w.controlNodes.iter().map(|n| n.name.clone()).collect();
    names.sort();
    for name in names {
        push(&mut vms, &mut id, name, VmType::Control, None, vec![]);
    }

    let mut names: Vec<String> = w.gateway_nodes().iter().map(|n| n.name.clone()).collect();
    names.sort();
    for name in names {
        push(&mut vms, &mut id, name, VmType::Gateway, None, vec![]);
    }

    // switches in hydration order: spines first, then by name
    let mut sw: Vec<(bool, String, Option<String>)> = w
        .switches
        .iter()
        .map(|s| (!s.is_spine(), s.name.clone(), s.bootMAC.clone()))
        .collect();
    sw.sort();
    for (_, name, mac) in sw {
        let extra = match passthrough_pool.next() {
            Some(bdf) => vec![Nic::PciPassthrough { bdf: bdf.clone() }],
            None => vec![],
        };
        push(&mut vms, &mut id, name, VmType::Switch, mac, extra);
    }

    let mut names: Vec<String> = w.servers.iter().map(|s| s.name.clone()).collect();
    names.sort();
    for name in names {
        push(&mut vms, &mut id, name, VmType::Server, None, vec![]);
    }

    Ok(VlabPlan {
        tapCount: vms.len(),
        passthroughs: passthroughs.to_vec(),
        authorizedKey: authorized_key.to_string(),
        vms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{build, BuildOpts};
    use crate::config::FabConfig;
    use crate::ports::VM_UUID_PREFIX;

    #[test]
    fn plan_order_is_stable() {
        let cfg = FabConfig::default();
        let w = build(&cfg, &BuildOpts::default()).unwrap();
        let p = plan(&w, &[], "ssh-ed25519 AAAA test").unwrap();

        assert_eq!(p.vms[0].name, "control-01");
        assert_eq!(p.vms[0].kind, VmType::Control);
        assert_eq!(p.vms[0].id, 0);
        // spines before leaves
        assert_eq!(p.vms[1].name, "spine-01");
        assert_eq!(p.vms[2].name, "spine-02");
        assert_eq!(p.vms[3].name, "leaf-01");

        assert_eq!(p.tapCount, p.vms.len());
        for v in &p.vms {
            assert_eq!(v.ssh_port(), 22000 + v.id as u16);
            assert!(v.uuid().starts_with(VM_UUID_PREFIX));
        }
    }

    #[test]
    fn switch_mgmt_nic_uses_boot_mac() {
        let cfg = FabConfig::default();
        let w = build(&cfg, &BuildOpts::default()).unwrap();
        let boot = w.switches[0].bootMAC.clone().unwrap();
        let p = plan(&w, &[], "").unwrap();
        let vm = p.get(&w.switches[0].name).unwrap();
        let has = vm.nics.iter().any(|n| matches!(n, Nic::TapBridged { mac, .. } if *mac == boot));
        assert!(has);
    }

    #[test]
    fn passthroughs_land_on_switches() {
        let cfg = FabConfig::default();
        let w = build(&cfg, &BuildOpts::default()).unwrap();
        let p = plan(&w, &["0000:01:00.0".into()], "").unwrap();
        let spine = p.get("spine-01").unwrap();
        assert!(spine.nics.iter().any(|n| matches!(n, Nic::PciPassthrough { .. })));
        let control = p.get("control-01").unwrap();
        assert!(!control.nics.iter().any(|n| matches!(n, Nic::PciPassthrough { .. })));
    }
}
