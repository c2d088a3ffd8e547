#![allow(non_snake_case)]

use std::collections::BTreeMap;

/// A subnet inside a VPC
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct VpcSubnet {
    /// CIDR of the subnet
    pub subnet: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan: Option<u16>,
    #[serde(default)]
    pub isolated: bool,
    #[serde(default)]
    pub restricted: bool,
}

/// A virtual private cloud on the fabric
///
/// ```yaml
/// name: vpc-01
/// subnets:
///   default:
///     subnet: 10.0.1.0/24
///     vlan: 1001
/// ```
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct Vpc {
    pub name: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub subnets: BTreeMap<String, VpcSubnet>,

    /// Groups of subnet names permitted to talk to each other despite
    /// isolation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permit: Vec<Vec<String>>,
}

/// Binding of a VPC subnet to a server-facing connection
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct VpcAttachment {
    /// Connection name, e.g. `server-01--mclag--leaf-01--leaf-02`
    pub connection: String,
    /// Subnet reference as `{vpc}/{subnet}`
    pub subnet: String,
}

impl VpcAttachment {
    pub fn name(&self) -> String {
        format!("{}--{}", self.connection, self.subnet.replace('/', "--"))
    }

    pub fn vpc(&self) -> &str {
        self.subnet.splitn(2, '/').next().unwrap_or(&self.subnet)
    }
}

/// Subnet filters on one side of a VPC peering
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PeeringPermit {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vpc1Subnets: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vpc2Subnets: Vec<String>,
}

/// VPC-to-VPC peering
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct VpcPeering {
    pub vpc1: String,
    pub vpc2: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permit: Vec<PeeringPermit>,
}

impl VpcPeering {
    pub fn name(&self) -> String {
        format!("{}--{}", self.vpc1, self.vpc2)
    }
}

/// VPC-to-external peering with prefix filters
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct ExternalPeering {
    pub vpc: String,
    pub external: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vpcSubnets: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub externalPrefixes: Vec<String>,
}

impl ExternalPeering {
    pub fn name(&self) -> String {
        format!("{}--{}", self.vpc, self.external)
    }
}
