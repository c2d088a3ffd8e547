#![allow(non_snake_case)]

use std::fs::File;
use std::io::prelude::*;
use std::path::Path;

use walkdir::WalkDir;

use super::{ErrorKind, Result, ResultExt};

mod switch;
pub use self::switch::{
    Redundancy, RedundancyKind, Switch, SwitchGroup, SwitchRole, PDU_OUTLET_ANNOTATION,
};

mod server;
pub use self::server::Server;

mod connection;
pub use self::connection::{
    device_of, Connection, FabricLink, GatewayLink, MeshLink, RoutedSide, ServerLink,
    StaticExternalLink, StaticExternalSide, SwitchLink,
};

mod node;
pub use self::node::{BgpNeighbor, ControlNode, FabNode, FabRole, Gateway, GatewayInterface};

mod vpc;
pub use self::vpc::{ExternalPeering, PeeringPermit, Vpc, VpcAttachment, VpcPeering, VpcSubnet};

/// A contiguous VLAN id range
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct VlanRange {
    pub from: u16,
    pub to: u16,
}

/// VLAN namespace VPC subnets draw their ids from
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct VlanNamespace {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ranges: Vec<VlanRange>,
}

/// IPv4 namespace VPC subnets draw their prefixes from
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct Ipv4Namespace {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subnets: Vec<String>,
}

/// Anything that lives in the wiring store under a unique name
pub trait Named {
    const KIND: &'static str;
    fn object_name(&self) -> String;
}

macro_rules! named {
    ($t:ty, $kind:expr) => {
        impl Named for $t {
            const KIND: &'static str = $kind;
            fn object_name(&self) -> String {
                self.name.clone()
            }
        }
    };
}

named!(VlanNamespace, "VLANNamespace");
named!(Ipv4Namespace, "IPv4Namespace");
named!(SwitchGroup, "SwitchGroup");
named!(Switch, "Switch");
named!(Server, "Server");
named!(ControlNode, "ControlNode");
named!(FabNode, "FabNode");
named!(Gateway, "Gateway");
named!(Vpc, "VPC");

impl Named for Connection {
    const KIND: &'static str = "Connection";
    fn object_name(&self) -> String {
        self.name()
    }
}
impl Named for VpcAttachment {
    const KIND: &'static str = "VPCAttachment";
    fn object_name(&self) -> String {
        self.name()
    }
}
impl Named for VpcPeering {
    const KIND: &'static str = "VPCPeering";
    fn object_name(&self) -> String {
        self.name()
    }
}
impl Named for ExternalPeering {
    const KIND: &'static str = "ExternalPeering";
    fn object_name(&self) -> String {
        self.name()
    }
}

/// Typed repository over one kind in the store
///
/// Hydration and validation go through this rather than poking the vectors
/// so the access pattern stays uniform across kinds.
pub trait Objects<T: Named> {
    fn objects(&self) -> &Vec<T>;
    fn objects_mut(&mut self) -> &mut Vec<T>;

    fn list(&self) -> &[T] {
        self.objects().as_slice()
    }

    fn get(&self, name: &str) -> Option<&T> {
        self.objects().iter().find(|o| o.object_name() == name)
    }

    fn get_mut(&mut self, name: &str) -> Option<&mut T> {
        self.objects_mut().iter_mut().find(|o| o.object_name() == name)
    }

    /// Append an object; duplicate names are a wiring defect
    fn create(&mut self, obj: T) -> Result<()> {
        let name = obj.object_name();
        if self.get(&name).is_some() {
            return Err(ErrorKind::DuplicateObject(T::KIND.into(), name).into());
        }
        self.objects_mut().push(obj);
        Ok(())
    }

    fn delete(&mut self, name: &str) -> Option<T> {
        let idx = self.objects().iter().position(|o| o.object_name() == name)?;
        Some(self.objects_mut().remove(idx))
    }
}

macro_rules! store {
    ($t:ty, $field:ident) => {
        impl Objects<$t> for Wiring {
            fn objects(&self) -> &Vec<$t> {
                &self.$field
            }
            fn objects_mut(&mut self) -> &mut Vec<$t> {
                &mut self.$field
            }
        }
    };
}

/// The in-memory wiring store
///
/// Owns every declarative entity for the run. Objects are created by the
/// builder or loaded from YAML, mutated only by hydration, and frozen
/// thereafter. Insertion order is preserved and observable.
#[derive(Default, Clone, Debug)]
pub struct Wiring {
    pub vlanNamespaces: Vec<VlanNamespace>,
    pub ipv4Namespaces: Vec<Ipv4Namespace>,
    pub switchGroups: Vec<SwitchGroup>,
    pub switches: Vec<Switch>,
    pub servers: Vec<Server>,
    pub connections: Vec<Connection>,
    pub controlNodes: Vec<ControlNode>,
    pub fabNodes: Vec<FabNode>,
    pub gateways: Vec<Gateway>,
    pub vpcs: Vec<Vpc>,
    pub attachments: Vec<VpcAttachment>,
    pub peerings: Vec<VpcPeering>,
    pub externalPeerings: Vec<ExternalPeering>,
}

store!(VlanNamespace, vlanNamespaces);
store!(Ipv4Namespace, ipv4Namespaces);
store!(SwitchGroup, switchGroups);
store!(Switch, switches);
store!(Server, servers);
store!(Connection, connections);
store!(ControlNode, controlNodes);
store!(FabNode, fabNodes);
store!(Gateway, gateways);
store!(Vpc, vpcs);
store!(VpcAttachment, attachments);
store!(VpcPeering, peerings);
store!(ExternalPeering, externalPeerings);

impl Wiring {
    pub fn new() -> Self {
        Default::default()
    }

    /// Leaves in stored order
    pub fn leaves(&self) -> Vec<&Switch> {
        self.switches.iter().filter(|s| s.is_leaf()).collect()
    }

    /// Spines in stored order
    pub fn spines(&self) -> Vec<&Switch> {
        self.switches.iter().filter(|s| s.is_spine()).collect()
    }

    /// Gateway-role fab nodes in stored order
    pub fn gateway_nodes(&self) -> Vec<&FabNode> {
        self.fabNodes.iter().filter(|n| n.is_gateway()).collect()
    }

    /// Load a wiring from every include/*.yaml fragment under a directory
    ///
    /// Fragments are read in lexical order so the resulting store order is
    /// reproducible.
    pub fn load_dir(dir: &Path) -> Result<Wiring> {
        let mut files: Vec<_> = WalkDir::new(dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| {
                e.path().extension().map(|x| x == "yaml" || x == "yml").unwrap_or(false)
            })
            .map(|e| e.path().to_path_buf())
            .collect();
        files.sort();

        let mut w = Wiring::new();
        for f in files {
            debug!("Loading wiring fragment from {}", f.display());
            let mut data = String::new();
            File::open(&f)?.read_to_string(&mut data)?;
            super::crds::append_yaml(&mut w, &data)
                .chain_err(|| format!("in wiring fragment {}", f.display()))?;
        }
        Ok(w)
    }

    /// Parse a wiring from a single multi-document YAML stream
    pub fn from_yaml(data: &str) -> Result<Wiring> {
        let mut w = Wiring::new();
        super::crds::append_yaml(&mut w, data)?;
        Ok(w)
    }

    /// Serialize the whole store as a multi-document YAML stream
    ///
    /// Documents come out grouped by kind in stored order; two identical
    /// stores serialize byte-for-byte identically.
    pub fn to_yaml(&self) -> Result<String> {
        super::crds::to_yaml(self)
    }
}
