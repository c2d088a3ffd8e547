#![allow(non_snake_case)]

/// Device half of a port name like `leaf-01/E1/4` or `server-02/enp2s1`
pub fn device_of(port: &str) -> &str {
    port.splitn(2, '/').next().unwrap_or(port)
}

/// A link between two switch ports
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SwitchLink {
    pub switch1: String,
    pub switch2: String,
}

/// A link between a server NIC and a switch port
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ServerLink {
    pub server: String,
    pub switch: String,
}

/// One endpoint of a routed fabric-family link
///
/// The ip is a /31 half in `address/31` form; hydration assigns it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct RoutedSide {
    pub port: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

impl RoutedSide {
    pub fn new(port: String) -> Self {
        RoutedSide { port, ip: None }
    }
}

/// A spine-to-leaf fabric link
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FabricLink {
    pub spine: RoutedSide,
    pub leaf: RoutedSide,
}

/// A leaf-to-leaf mesh link
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MeshLink {
    pub leaf1: RoutedSide,
    pub leaf2: RoutedSide,
}

/// A switch-to-gateway link
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct GatewayLink {
    pub switch: RoutedSide,
    pub gateway: RoutedSide,
}

/// BGP-less traffic towards an external peer on a specific switch port
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StaticExternalLink {
    pub switch: StaticExternalSide,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StaticExternalSide {
    pub port: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan: Option<u16>,
    /// Prefixes reachable behind the external
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subnets: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nextHop: Option<String>,
}

/// A connection between two endpoints of the wiring
///
/// Modelled as a proper sum - exactly one variant, dispatched exhaustively
/// at every use site. The YAML form is externally tagged:
///
/// ```yaml
/// fabric:
///   links:
///     - spine: {port: spine-01/E1/1}
///       leaf: {port: leaf-01/E1/49}
/// ```
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub enum Connection {
    MclagDomain {
        sessionLinks: Vec<SwitchLink>,
        peerLinks: Vec<SwitchLink>,
    },
    Mclag {
        links: Vec<ServerLink>,
    },
    Eslag {
        links: Vec<ServerLink>,
    },
    Unbundled {
        link: ServerLink,
    },
    Bundled {
        links: Vec<ServerLink>,
    },
    Fabric {
        links: Vec<FabricLink>,
    },
    Mesh {
        links: Vec<MeshLink>,
    },
    Gateway {
        links: Vec<GatewayLink>,
    },
    VpcLoopback {
        links: Vec<SwitchLink>,
    },
    StaticExternal {
        link: StaticExternalLink,
    },
}

impl Connection {
    /// Deterministic name derived from the endpoint devices
    ///
    /// Hydration sorts connections by this, and VPC attachments reference
    /// it, so the scheme must stay stable.
    pub fn name(&self) -> String {
        match self {
            Connection::MclagDomain { sessionLinks, peerLinks } => {
                let l = sessionLinks.first().or_else(|| peerLinks.first());
                match l {
                    Some(l) => format!("{}--mclag-domain--{}", device_of(&l.switch1), device_of(&l.switch2)),
                    None => "unnamed--mclag-domain".into(),
                }
            }
            Connection::Mclag { links } => Self::server_name("mclag", links),
            Connection::Eslag { links } => Self::server_name("eslag", links),
            Connection::Bundled { links } => Self::server_name("bundled", links),
            Connection::Unbundled { link } => {
                format!("{}--unbundled--{}", device_of(&link.server), device_of(&link.switch))
            }
            Connection::Fabric { links } => match links.first() {
                Some(l) => format!("{}--fabric--{}", device_of(&l.spine.port), device_of(&l.leaf.port)),
                None => "unnamed--fabric".into(),
            },
            Connection::Mesh { links } => match links.first() {
                Some(l) => format!("{}--mesh--{}", device_of(&l.leaf1.port), device_of(&l.leaf2.port)),
                None => "unnamed--mesh".into(),
            },
            Connection::Gateway { links } => match links.first() {
                Some(l) => format!("{}--gateway--{}", device_of(&l.switch.port), device_of(&l.gateway.port)),
                None => "unnamed--gateway".into(),
            },
            Connection::VpcLoopback { links } => match links.first() {
                Some(l) => format!("{}--vpc-loopback", device_of(&l.switch1)),
                None => "unnamed--vpc-loopback".into(),
            },
            Connection::StaticExternal { link } => {
                format!("{}--static-external", device_of(&link.switch.port))
            }
        }
    }

    fn server_name(kind: &str, links: &[ServerLink]) -> String {
        match links.first() {
            Some(first) => {
                let mut name = format!("{}--{}", device_of(&first.server), kind);
                for l in links {
                    name.push_str("--");
                    name.push_str(device_of(&l.switch));
                }
                name
            }
            None => format!("unnamed--{}", kind),
        }
    }

    /// All switch devices this connection touches
    pub fn switch_devices(&self) -> Vec<String> {
        let mut out = vec![];
        match self {
            Connection::MclagDomain { sessionLinks, peerLinks } => {
                for l in sessionLinks.iter().chain(peerLinks) {
                    out.push(device_of(&l.switch1).to_string());
                    out.push(device_of(&l.switch2).to_string());
                }
            }
            Connection::Mclag { links } | Connection::Eslag { links } | Connection::Bundled { links } => {
                for l in links {
                    out.push(device_of(&l.switch).to_string());
                }
            }
            Connection::Unbundled { link } => out.push(device_of(&link.switch).to_string()),
            Connection::Fabric { links } => {
                for l in links {
                    out.push(device_of(&l.spine.port).to_string());
                    out.push(device_of(&l.leaf.port).to_string());
                }
            }
            Connection::Mesh { links } => {
                for l in links {
                    out.push(device_of(&l.leaf1.port).to_string());
                    out.push(device_of(&l.leaf2.port).to_string());
                }
            }
            Connection::Gateway { links } => {
                for l in links {
                    out.push(device_of(&l.switch.port).to_string());
                }
            }
            Connection::VpcLoopback { links } => {
                for l in links {
                    out.push(device_of(&l.switch1).to_string());
                }
            }
            Connection::StaticExternal { link } => out.push(device_of(&link.switch.port).to_string()),
        }
        out.sort();
        out.dedup();
        out
    }

    /// Server device for server-facing variants
    pub fn server_device(&self) -> Option<String> {
        match self {
            Connection::Mclag { links } | Connection::Eslag { links } | Connection::Bundled { links } => {
                links.first().map(|l| device_of(&l.server).to_string())
            }
            Connection::Unbundled { link } => Some(device_of(&link.server).to_string()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slink(server: &str, switch: &str) -> ServerLink {
        ServerLink { server: server.into(), switch: switch.into() }
    }

    #[test]
    fn names_are_stable() {
        let c = Connection::Mclag {
            links: vec![slink("server-01/enp2s1", "leaf-01/E1/1"), slink("server-01/enp2s2", "leaf-02/E1/1")],
        };
        assert_eq!(c.name(), "server-01--mclag--leaf-01--leaf-02");

        let c = Connection::Fabric {
            links: vec![FabricLink {
                spine: RoutedSide::new("spine-01/E1/1".into()),
                leaf: RoutedSide::new("leaf-01/E1/49".into()),
            }],
        };
        assert_eq!(c.name(), "spine-01--fabric--leaf-01");
        assert_eq!(c.switch_devices(), vec!["leaf-01".to_string(), "spine-01".to_string()]);
    }

    #[test]
    fn yaml_tag_shape() {
        let c = Connection::Unbundled { link: slink("server-03/enp2s1", "leaf-05/E1/1") };
        let y = serde_yaml::to_string(&c).unwrap();
        assert!(y.contains("unbundled:"));
        let back: Connection = serde_yaml::from_str(&y).unwrap();
        assert_eq!(back, c);
    }
}
