#![allow(non_snake_case)]

use std::collections::BTreeMap;

/// Annotation carrying the switch's PDU outlet URL
pub const PDU_OUTLET_ANNOTATION: &str = "hhfab.io/pdu-outlet";

/// Role a switch plays in the fabric
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum SwitchRole {
    Spine,
    ServerLeaf,
}

impl Default for SwitchRole {
    fn default() -> Self {
        SwitchRole::ServerLeaf
    }
}

/// Leaf redundancy flavour
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum RedundancyKind {
    Mclag,
    Eslag,
}

/// Redundancy group membership for a leaf
///
/// ```yaml
/// redundancy:
///   group: mclag-1
///   kind: mclag
/// ```
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Redundancy {
    pub group: String,
    pub kind: RedundancyKind,
}

/// A switch in the wiring
///
/// Network attributes (managementIP, protocolIP, vtepIP, asn) are left
/// unset by the builder and filled in by hydration. IPs are stored in
/// `address/bits` form.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct Switch {
    pub name: String,

    #[serde(default)]
    pub role: SwitchRole,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redundancy: Option<Redundancy>,

    /// Switch profile, e.g. the virtual switch image family
    #[serde(default)]
    pub profile: String,

    /// MAC the switch boots with on the management network
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootMAC: Option<String>,

    /// Management address inside the management subnet (address/bits)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managementIP: Option<String>,

    /// Routing control plane loopback (/32)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocolIP: Option<String>,

    /// VXLAN tunnel endpoint (/32, leaves only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vtepIP: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asn: Option<u32>,

    /// Front-panel ports assigned so far, in allocation order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,

    /// Free-form annotations (PDU outlet URLs and the like)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Switch {
    pub fn is_spine(&self) -> bool {
        self.role == SwitchRole::Spine
    }

    pub fn is_leaf(&self) -> bool {
        self.role == SwitchRole::ServerLeaf
    }

    pub fn redundancy_kind(&self) -> Option<&RedundancyKind> {
        self.redundancy.as_ref().map(|r| &r.kind)
    }
}

/// A named group leaves can reference from their redundancy block
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct SwitchGroup {
    pub name: String,
}
