#![allow(non_snake_case)]

use std::collections::BTreeMap;

/// A control node VM running the fabric control plane
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct ControlNode {
    pub name: String,

    /// Management address (address/bits), hydrated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managementIP: Option<String>,

    /// Dummy-interface /31 from the dummy subnet, hydrated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dummyIP: Option<String>,
}

/// Roles a fab node can carry
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum FabRole {
    Gateway,
}

/// A non-control node managed by the fabricator (currently only gateways)
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct FabNode {
    pub name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<FabRole>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managementIP: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dummyIP: Option<String>,
}

impl FabNode {
    pub fn is_gateway(&self) -> bool {
        self.roles.contains(&FabRole::Gateway)
    }
}

/// A hydrated interface on a gateway
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct GatewayInterface {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default)]
    pub mtu: u32,
}

/// A BGP session the gateway keeps towards a switch
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BgpNeighbor {
    pub ip: String,
    pub asn: u32,
}

/// The gateway's routing identity
///
/// Interfaces and neighbors are appended by hydration while it walks the
/// gateway connections, pointing each neighbor at the switch side of the
/// /31.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct Gateway {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asn: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocolIP: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vtepIP: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vtepMAC: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub interfaces: BTreeMap<String, GatewayInterface>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub neighbors: Vec<BgpNeighbor>,
}
