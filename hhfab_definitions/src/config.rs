#![allow(non_snake_case)]

use std::fs::File;
use std::io::prelude::*;
use std::net::Ipv4Addr;
use std::path::Path;

use ipnetwork::Ipv4Network;

use super::Result;

// ----------------------------------------------------------------------------------

/// Mode the fabric is wired in
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum FabricMode {
    /// Standard clos: spines on top, server leaves below
    SpineLeaf,
    /// Two MCLAG leaves and nothing else
    CollapsedCore,
}

impl Default for FabricMode {
    fn default() -> Self {
        FabricMode::SpineLeaf
    }
}

/// How control/gateway node images are produced and booted
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum BuildMode {
    /// Pre-built install USB image copied next to an empty os disk
    Usb,
    /// Pre-built install ISO attached as a CD-ROM
    Iso,
    /// No pre-built media; ignition passed via fw_cfg
    Manual,
}

impl Default for BuildMode {
    fn default() -> Self {
        BuildMode::Usb
    }
}

/// Management network parameters
///
/// The VIP is always the second address of the subnet; the four addresses
/// after it are reserved. Allocation starts at VIP+5 and must stay below
/// dhcpStart.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ManagementConfig {
    /// Management subnet for all nodes and switches
    pub subnet: Ipv4Network,
    /// First address handed out by the management DHCP server
    pub dhcpStart: Ipv4Addr,
}

impl Default for ManagementConfig {
    fn default() -> Self {
        ManagementConfig {
            subnet: "172.30.1.0/24".parse().unwrap(),
            dhcpStart: "172.30.1.100".parse().unwrap(),
        }
    }
}

impl ManagementConfig {
    /// Control node VIP - second address of the management subnet
    pub fn vip(&self) -> Ipv4Addr {
        self.subnet.nth(1).expect("management subnet has a second address")
    }

    /// First address hydration may hand out
    pub fn allocationStart(&self) -> Ipv4Addr {
        self.subnet.nth(6).expect("management subnet can hold the reserved block")
    }
}

// ----------------------------------------------------------------------------------

fn default_fabric_subnet() -> Ipv4Network {
    "172.30.136.0/22".parse().unwrap()
}
fn default_protocol_subnet() -> Ipv4Network {
    "172.30.140.0/22".parse().unwrap()
}
fn default_vtep_subnet() -> Ipv4Network {
    "172.30.144.0/22".parse().unwrap()
}
fn default_dummy_subnet() -> Ipv4Network {
    "172.30.148.0/24".parse().unwrap()
}
fn default_spine_asn() -> u32 {
    65100
}
fn default_leaf_asn_start() -> u32 {
    65101
}
fn default_leaf_asn_end() -> u32 {
    65999
}
fn default_gateway_asn() -> u32 {
    65534
}
fn default_fabric_mtu() -> u32 {
    9100
}
fn default_pci_bridges() -> u32 {
    2
}
fn default_true() -> bool {
    true
}

/// Main fabricator configuration, serializable from fab.yaml
///
/// Everything hydration and the vlab runtime need to know about the fabric
/// that is not part of the wiring itself. All subnets and ranges carry
/// defaults so a bare `fab.yaml` is enough to get a vlab up.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct FabConfig {
    /// Fabric wiring mode
    #[serde(default)]
    pub fabricMode: FabricMode,

    /// Management network
    #[serde(default)]
    pub management: ManagementConfig,

    /// Subnet the fabric link /31 pairs are carved out of
    #[serde(default = "default_fabric_subnet")]
    pub fabricSubnet: Ipv4Network,

    /// Subnet the per-device protocol /32s are carved out of
    #[serde(default = "default_protocol_subnet")]
    pub protocolSubnet: Ipv4Network,

    /// Subnet the per-device VTEP /32s are carved out of
    #[serde(default = "default_vtep_subnet")]
    pub vtepSubnet: Ipv4Network,

    /// Subnet the node dummy-interface /31s are carved out of (at least a /24)
    #[serde(default = "default_dummy_subnet")]
    pub dummySubnet: Ipv4Network,

    /// ASN shared by all spines
    #[serde(default = "default_spine_asn")]
    pub spineASN: u32,

    /// First ASN handed to a leaf
    #[serde(default = "default_leaf_asn_start")]
    pub leafASNStart: u32,

    /// Last ASN a leaf may carry
    #[serde(default = "default_leaf_asn_end")]
    pub leafASNEnd: u32,

    /// ASN assigned to gateways
    #[serde(default = "default_gateway_asn")]
    pub gatewayASN: u32,

    /// MTU set on hydrated gateway interfaces
    #[serde(default = "default_fabric_mtu")]
    pub fabricMTU: u32,

    /// Whether collapsed-core leaves still get VTEP IPs
    ///
    /// Older switch profiles predate VTEPs in collapsed-core; this is
    /// configuration, not an invariant.
    #[serde(default = "default_true")]
    pub collapsedCoreVTEP: bool,

    /// How control/gateway nodes are installed
    #[serde(default)]
    pub buildMode: BuildMode,

    /// Number of PCI bridges inserted before the NIC arguments
    #[serde(default = "default_pci_bridges")]
    pub pciBridges: u32,

    /// Version pins for the artifacts a vlab run materializes
    #[serde(default)]
    pub artifacts: ArtifactVersions,
}

impl Default for FabConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("default fab config parses")
    }
}

impl FabConfig {
    /// Read fab.yaml from a work directory
    pub fn read_from(dir: &Path) -> Result<FabConfig> {
        let mpath = dir.join("fab.yaml");
        trace!("Using config in {}", mpath.display());
        if !mpath.exists() {
            bail!("Config file {} does not exist", mpath.display())
        }
        let mut f = File::open(&mpath)?;
        let mut data = String::new();
        f.read_to_string(&mut data)?;
        let conf: FabConfig = serde_yaml::from_str(&data)?;
        Ok(conf)
    }

    /// Read fab.yaml in pwd
    pub fn read() -> Result<FabConfig> {
        FabConfig::read_from(Path::new("."))
    }

    /// Cheap sanity of the config itself, before any wiring is considered
    pub fn verify(&self) -> Result<()> {
        if self.management.subnet.prefix() > 28 {
            bail!("management subnet {} cannot hold the VIP and its reserved block", self.management.subnet);
        }
        if !self.management.subnet.contains(self.management.dhcpStart) {
            bail!("dhcpStart {} is outside the management subnet {}", self.management.dhcpStart, self.management.subnet);
        }
        if u32::from(self.management.dhcpStart) <= u32::from(self.management.allocationStart()) {
            bail!("dhcpStart {} leaves no room for allocations after the VIP block", self.management.dhcpStart);
        }
        if self.dummySubnet.prefix() > 24 {
            bail!("dummy subnet {} must be at least a /24", self.dummySubnet);
        }
        if self.leafASNStart > self.leafASNEnd {
            bail!("leaf ASN range [{}, {}] is empty", self.leafASNStart, self.leafASNEnd);
        }
        if self.spineASN >= self.leafASNStart && self.spineASN <= self.leafASNEnd {
            bail!("spine ASN {} overlaps the leaf range [{}, {}]", self.spineASN, self.leafASNStart, self.leafASNEnd);
        }
        if self.fabricSubnet.prefix() % 2 == 1 {
            // /31 pairs are carved two addresses at a time; an odd prefix is
            // legal but worth flagging early when it cannot hold a single pair
            if self.fabricSubnet.size() < 2 {
                bail!("fabric subnet {} cannot hold a single /31 pair", self.fabricSubnet);
            }
        }
        Ok(())
    }
}

/// Version pins for the vlab artifacts
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ArtifactVersions {
    /// Node OS image family (controls, gateways, servers, externals)
    #[serde(default = "default_flatcar_version")]
    pub flatcar: String,
    /// Virtual switch image family
    #[serde(default = "default_switch_version")]
    pub switchImage: String,
    /// Helper tools bundle (hhnet, container images)
    #[serde(default = "default_tools_version")]
    pub tools: String,
}

fn default_flatcar_version() -> String {
    "v3815.2.0".into()
}
fn default_switch_version() -> String {
    "v0.3.0".into()
}
fn default_tools_version() -> String {
    "v0.8.0".into()
}

impl Default for ArtifactVersions {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("default artifact versions parse")
    }
}

// ----------------------------------------------------------------------------------

/// Artifact registry coordinates from .registry.yaml
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct RegistryConfig {
    /// Registry host, e.g. ghcr.io
    pub repo: String,
    /// Path prefix all artifact references share
    pub prefix: String,
}

impl RegistryConfig {
    pub fn read_from(dir: &Path) -> Result<RegistryConfig> {
        let mpath = dir.join(".registry.yaml");
        if !mpath.exists() {
            bail!("Registry file {} does not exist", mpath.display())
        }
        let mut f = File::open(&mpath)?;
        let mut data = String::new();
        f.read_to_string(&mut data)?;
        Ok(serde_yaml::from_str(&data)?)
    }

    /// Full reference for a named artifact
    pub fn reference(&self, name: &str, version: &str) -> String {
        format!("{}/{}/{}:{}", self.repo, self.prefix, name, version)
    }
}

#[cfg(test)]
mod tests {
    use super::FabConfig;

    #[test]
    fn default_config_verifies() {
        let cfg = FabConfig::default();
        assert!(cfg.verify().is_ok());
        assert_eq!(cfg.management.vip().to_string(), "172.30.1.1");
        assert_eq!(cfg.management.allocationStart().to_string(), "172.30.1.6");
    }

    #[test]
    fn bad_ranges_caught() {
        let mut cfg = FabConfig::default();
        cfg.leafASNStart = 66000;
        assert!(cfg.verify().is_err());

        let mut cfg = FabConfig::default();
        cfg.dummySubnet = "172.30.148.0/28".parse().unwrap();
        assert!(cfg.verify().is_err());

        let mut cfg = FabConfig::default();
        cfg.spineASN = 65200;
        assert!(cfg.verify().is_err());
    }
}
