#![allow(non_snake_case)]

use crate::config::{FabConfig, FabricMode};
use crate::ports::{switch_mac, PortAllocator};
use crate::wiring::{
    Connection, ControlNode, FabNode, FabRole, FabricLink, Gateway, GatewayLink, Ipv4Namespace,
    Objects, Redundancy, RedundancyKind, RoutedSide, Server, ServerLink, Switch, SwitchGroup,
    SwitchLink, SwitchRole, VlanNamespace, VlanRange, Wiring,
};
use crate::Result;

/// High-level topology knobs
///
/// Zero means "use the default" for every count; the builder settles
/// defaults before emitting anything.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct BuildOpts {
    #[serde(default)]
    pub spines: usize,
    /// Links per spine-leaf pair
    #[serde(default)]
    pub fabricLinks: usize,
    #[serde(default)]
    pub mclagLeafs: usize,
    /// ESLAG group sizes as `n1,n2,..`
    #[serde(default)]
    pub eslagLeafGroups: String,
    #[serde(default)]
    pub orphanLeafs: usize,
    #[serde(default)]
    pub mclagSessionLinks: usize,
    #[serde(default)]
    pub mclagPeerLinks: usize,
    /// Loopback port pairs per leaf
    #[serde(default)]
    pub vpcLoopbacks: usize,
    /// Servers per MCLAG pair
    #[serde(default)]
    pub mclagServers: usize,
    /// Servers per ESLAG group
    #[serde(default)]
    pub eslagServers: usize,
    /// Unbundled servers per orphan leaf / MCLAG pair
    #[serde(default)]
    pub unbundledServers: usize,
    /// Bundled servers per orphan leaf / MCLAG pair
    #[serde(default)]
    pub bundledServers: usize,
    #[serde(default)]
    pub gateway: bool,
    /// How many spines the gateway uplinks to
    #[serde(default)]
    pub gatewayUplinks: usize,
}

impl BuildOpts {
    /// Settle defaults the way `hhfab init` documents them
    fn settle(&self, mode: &FabricMode) -> BuildOpts {
        let mut o = self.clone();
        let no_leaves =
            o.mclagLeafs == 0 && o.eslagLeafGroups.trim().is_empty() && o.orphanLeafs == 0;
        match mode {
            FabricMode::SpineLeaf => {
                if o.spines == 0 {
                    o.spines = 2;
                }
                if o.fabricLinks == 0 {
                    o.fabricLinks = 2;
                }
                if no_leaves {
                    o.mclagLeafs = 2;
                    o.eslagLeafGroups = "2".into();
                    o.orphanLeafs = 1;
                }
            }
            FabricMode::CollapsedCore => {
                // collapsed-core is exactly one MCLAG pair
                o.spines = 0;
                o.fabricLinks = 0;
                if no_leaves {
                    o.mclagLeafs = 2;
                }
                o.gateway = false;
            }
        }
        if o.mclagSessionLinks == 0 {
            o.mclagSessionLinks = 2;
        }
        if o.mclagPeerLinks == 0 {
            o.mclagPeerLinks = 2;
        }
        if o.vpcLoopbacks == 0 {
            o.vpcLoopbacks = 2;
        }
        if o.mclagServers == 0 {
            o.mclagServers = 2;
        }
        if o.eslagServers == 0 {
            o.eslagServers = 2;
        }
        if o.unbundledServers == 0 {
            o.unbundledServers = 1;
        }
        if o.bundledServers == 0 {
            o.bundledServers = 1;
        }
        if o.gateway && o.gatewayUplinks == 0 {
            o.gatewayUplinks = 2;
        }
        o
    }

    fn eslag_groups(&self) -> Result<Vec<usize>> {
        let mut out = vec![];
        for part in self.eslagLeafGroups.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let g: usize = part.parse()?;
            if g < 2 || g > 4 {
                bail!("ESLAG group size {} is outside 2..=4", g);
            }
            out.push(g);
        }
        Ok(out)
    }
}

/// Builder state while the wiring is being emitted
struct Emitter {
    w: Wiring,
    pa: PortAllocator,
    next_leaf: usize,
    next_server: usize,
    switch_count: u32,
}

impl Emitter {
    fn switch_port(&mut self, name: &str) -> Result<String> {
        let p = self.pa.next_switch_port(name)?;
        if let Some(s) = Objects::<Switch>::get_mut(&mut self.w, name) {
            s.ports.push(p.clone());
        }
        Ok(p)
    }

    fn server_port(&mut self, name: &str) -> String {
        let p = self.pa.next_server_port(name);
        if let Some(s) = Objects::<Server>::get_mut(&mut self.w, name) {
            s.ports.push(p.clone());
        }
        p
    }

    fn emit_switch(&mut self, name: &str, role: SwitchRole, redundancy: Option<Redundancy>) -> Result<()> {
        let sw = Switch {
            name: name.into(),
            role,
            redundancy,
            profile: "vs".into(),
            bootMAC: Some(switch_mac(self.switch_count)),
            ..Default::default()
        };
        self.switch_count += 1;
        self.w.create(sw)
    }

    fn emit_leaf(&mut self, redundancy: Option<Redundancy>) -> Result<String> {
        let name = format!("leaf-{:02}", self.next_leaf);
        self.next_leaf += 1;
        self.emit_switch(&name, SwitchRole::ServerLeaf, redundancy)?;
        Ok(name)
    }

    fn emit_server(&mut self, description: String) -> Result<String> {
        let name = format!("server-{:02}", self.next_server);
        self.next_server += 1;
        self.w.create(Server { name: name.clone(), description, ..Default::default() })?;
        Ok(name)
    }

    /// One server attached to each leaf in `leaves`, one NIC per leaf
    fn emit_lag_server(&mut self, leaves: &[String], kind: &RedundancyKind) -> Result<()> {
        let desc = match kind {
            RedundancyKind::Mclag => format!("MCLAG attached to {}", leaves.join(" and ")),
            RedundancyKind::Eslag => format!("ESLAG attached to {}", leaves.join(" and ")),
        };
        let server = self.emit_server(desc)?;
        let mut links = vec![];
        for leaf in leaves {
            links.push(ServerLink {
                server: self.server_port(&server),
                switch: self.switch_port(leaf)?,
            });
        }
        let conn = match kind {
            RedundancyKind::Mclag => Connection::Mclag { links },
            RedundancyKind::Eslag => Connection::Eslag { links },
        };
        self.w.create(conn)
    }

    fn emit_unbundled_server(&mut self, leaf: &str) -> Result<()> {
        let server = self.emit_server(format!("Unbundled attached to {}", leaf))?;
        let link = ServerLink {
            server: self.server_port(&server),
            switch: self.switch_port(leaf)?,
        };
        self.w.create(Connection::Unbundled { link })
    }

    fn emit_bundled_server(&mut self, leaf: &str) -> Result<()> {
        let server = self.emit_server(format!("Bundled attached to {}", leaf))?;
        let mut links = vec![];
        for _ in 0..2 {
            links.push(ServerLink {
                server: self.server_port(&server),
                switch: self.switch_port(leaf)?,
            });
        }
        self.w.create(Connection::Bundled { links })
    }
}

/// Synthesize a wiring from high-level knobs
///
/// Objects are emitted in a fixed order so later objects can reference
/// earlier allocations; the order is observable through port assignment.
pub fn build(cfg: &FabConfig, opts: &BuildOpts) -> Result<Wiring> {
    let o = opts.settle(&cfg.fabricMode);
    if o.mclagLeafs % 2 != 0 {
        bail!("mclagLeafs {} must be even", o.mclagLeafs);
    }
    let eslag = o.eslag_groups()?;
    if cfg.fabricMode == FabricMode::CollapsedCore && (!eslag.is_empty() || o.orphanLeafs > 0) {
        bail!("collapsed-core supports MCLAG leaves only");
    }

    let mut e = Emitter {
        w: Wiring::new(),
        pa: PortAllocator::new(),
        next_leaf: 1,
        next_server: 1,
        switch_count: 0,
    };

    // default namespaces first so everything else can reference them
    e.w.create(VlanNamespace {
        name: "default".into(),
        ranges: vec![VlanRange { from: 1000, to: 2999 }],
    })?;
    e.w.create(Ipv4Namespace {
        name: "default".into(),
        subnets: vec!["10.0.0.0/16".into()],
    })?;
    e.w.create(SwitchGroup { name: "group-01".into() })?;

    e.w.create(ControlNode { name: "control-01".into(), ..Default::default() })?;
    if o.gateway {
        e.w.create(FabNode {
            name: "gw-01".into(),
            roles: vec![FabRole::Gateway],
            ..Default::default()
        })?;
        e.w.create(Gateway { name: "gw-01".into(), ..Default::default() })?;
    }

    // MCLAG pairs with their domain, then their servers
    for i in 1..=(o.mclagLeafs / 2) {
        let group = format!("mclag-{}", i);
        e.w.create(SwitchGroup { name: group.clone() })?;
        let red = Redundancy { group: group.clone(), kind: RedundancyKind::Mclag };
        let l1 = e.emit_leaf(Some(red.clone()))?;
        let l2 = e.emit_leaf(Some(red))?;

        let mut sessionLinks = vec![];
        for _ in 0..o.mclagSessionLinks {
            sessionLinks.push(SwitchLink {
                switch1: e.switch_port(&l1)?,
                switch2: e.switch_port(&l2)?,
            });
        }
        let mut peerLinks = vec![];
        for _ in 0..o.mclagPeerLinks {
            peerLinks.push(SwitchLink {
                switch1: e.switch_port(&l1)?,
                switch2: e.switch_port(&l2)?,
            });
        }
        e.w.create(Connection::MclagDomain { sessionLinks, peerLinks })?;

        let pair = vec![l1.clone(), l2.clone()];
        for _ in 0..o.mclagServers {
            e.emit_lag_server(&pair, &RedundancyKind::Mclag)?;
        }
        for _ in 0..o.unbundledServers {
            e.emit_unbundled_server(&l1)?;
        }
        for _ in 0..o.bundledServers {
            e.emit_bundled_server(&l2)?;
        }
    }

    // ESLAG groups
    for (j, g) in eslag.iter().enumerate() {
        let group = format!("eslag-{}", j + 1);
        e.w.create(SwitchGroup { name: group.clone() })?;
        let red = Redundancy { group: group.clone(), kind: RedundancyKind::Eslag };
        let mut members = vec![];
        for _ in 0..*g {
            members.push(e.emit_leaf(Some(red.clone()))?);
        }
        for _ in 0..o.eslagServers {
            e.emit_lag_server(&members, &RedundancyKind::Eslag)?;
        }
        e.emit_unbundled_server(&members[0])?;
        if *g > 1 {
            e.emit_bundled_server(&members[1])?;
        }
    }

    // orphans
    for _ in 0..o.orphanLeafs {
        let leaf = e.emit_leaf(None)?;
        for _ in 0..o.unbundledServers {
            e.emit_unbundled_server(&leaf)?;
        }
        for _ in 0..o.bundledServers {
            e.emit_bundled_server(&leaf)?;
        }
    }

    // spines and their fabric (and gateway) connections
    let leaves: Vec<String> = e.w.leaves().iter().map(|s| s.name.clone()).collect();
    for i in 1..=o.spines {
        let spine = format!("spine-{:02}", i);
        e.emit_switch(&spine, SwitchRole::Spine, None)?;
        for leaf in &leaves {
            let mut links = vec![];
            for _ in 0..o.fabricLinks {
                links.push(FabricLink {
                    spine: RoutedSide::new(e.switch_port(&spine)?),
                    leaf: RoutedSide::new(e.switch_port(leaf)?),
                });
            }
            e.w.create(Connection::Fabric { links })?;
        }
        if o.gateway && i <= o.gatewayUplinks {
            let links = vec![GatewayLink {
                switch: RoutedSide::new(e.switch_port(&spine)?),
                gateway: RoutedSide::new(e.server_port("gw-01")),
            }];
            e.w.create(Connection::Gateway { links })?;
        }
    }

    // loopback pairs so VPC traffic can hairpin on a single leaf
    for leaf in &leaves {
        let mut links = vec![];
        for _ in 0..o.vpcLoopbacks {
            links.push(SwitchLink {
                switch1: e.switch_port(leaf)?,
                switch2: e.switch_port(leaf)?,
            });
        }
        e.w.create(Connection::VpcLoopback { links })?;
    }

    info!(
        "Built wiring: {} switches, {} servers, {} connections",
        e.w.switches.len(),
        e.w.servers.len(),
        e.w.connections.len()
    );
    Ok(e.w)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wiring::RedundancyKind;

    #[test]
    fn builder_defaults_spine_leaf() {
        let cfg = FabConfig::default();
        let w = build(&cfg, &BuildOpts::default()).unwrap();

        let spines: Vec<_> = w.spines().iter().map(|s| s.name.clone()).collect();
        assert_eq!(spines, vec!["spine-01", "spine-02"]);

        let leaves: Vec<_> = w.leaves().iter().map(|s| s.name.clone()).collect();
        assert_eq!(leaves, vec!["leaf-01", "leaf-02", "leaf-03", "leaf-04", "leaf-05"]);

        // leaf-01/02 MCLAG, leaf-03/04 ESLAG, leaf-05 orphan
        for n in &["leaf-01", "leaf-02"] {
            let s = Objects::<Switch>::get(&w, n).unwrap();
            assert_eq!(s.redundancy.as_ref().unwrap().kind, RedundancyKind::Mclag);
            assert_eq!(s.redundancy.as_ref().unwrap().group, "mclag-1");
        }
        for n in &["leaf-03", "leaf-04"] {
            let s = Objects::<Switch>::get(&w, n).unwrap();
            assert_eq!(s.redundancy.as_ref().unwrap().kind, RedundancyKind::Eslag);
        }
        assert!(Objects::<Switch>::get(&w, "leaf-05").unwrap().redundancy.is_none());

        // MCLAG domain carries 2 session + 2 peer links
        let domain = w
            .connections
            .iter()
            .find_map(|c| match c {
                Connection::MclagDomain { sessionLinks, peerLinks } => {
                    Some((sessionLinks.len(), peerLinks.len()))
                }
                _ => None,
            })
            .unwrap();
        assert_eq!(domain, (2, 2));

        // every spine-leaf pair has one fabric connection with 2 links
        let fabrics: Vec<_> = w
            .connections
            .iter()
            .filter_map(|c| match c {
                Connection::Fabric { links } => Some(links.len()),
                _ => None,
            })
            .collect();
        assert_eq!(fabrics.len(), 2 * 5);
        assert!(fabrics.iter().all(|&n| n == 2));

        // two loopback pairs per leaf
        let loops: Vec<_> = w
            .connections
            .iter()
            .filter_map(|c| match c {
                Connection::VpcLoopback { links } => Some(links.len()),
                _ => None,
            })
            .collect();
        assert_eq!(loops.len(), 5);
        assert!(loops.iter().all(|&n| n == 2));

        // default namespaces
        assert_eq!(w.vlanNamespaces[0].ranges[0].from, 1000);
        assert_eq!(w.vlanNamespaces[0].ranges[0].to, 2999);
        assert_eq!(w.ipv4Namespaces[0].subnets, vec!["10.0.0.0/16"]);
    }

    #[test]
    fn builder_no_duplicate_ports() {
        let cfg = FabConfig::default();
        let w = build(&cfg, &BuildOpts::default()).unwrap();
        for s in &w.switches {
            let mut seen = std::collections::BTreeSet::new();
            for p in &s.ports {
                assert!(seen.insert(p.clone()), "duplicate port {}", p);
            }
        }
    }

    #[test]
    fn builder_collapsed_core() {
        let mut cfg = FabConfig::default();
        cfg.fabricMode = FabricMode::CollapsedCore;
        let w = build(&cfg, &BuildOpts::default()).unwrap();
        assert!(w.spines().is_empty());
        assert_eq!(w.leaves().len(), 2);
        assert!(w.connections.iter().all(|c| !matches!(c, Connection::Fabric { .. })));
    }

    #[test]
    fn builder_gateway_uplinks() {
        let cfg = FabConfig::default();
        let mut opts = BuildOpts::default();
        opts.gateway = true;
        let w = build(&cfg, &opts).unwrap();
        let gws: Vec<_> = w
            .connections
            .iter()
            .filter(|c| matches!(c, Connection::Gateway { .. }))
            .collect();
        assert_eq!(gws.len(), 2); // default gatewayUplinks
        assert_eq!(w.gateway_nodes().len(), 1);
    }

    #[test]
    fn builder_odd_mclag_rejected() {
        let cfg = FabConfig::default();
        let mut opts = BuildOpts::default();
        opts.mclagLeafs = 3;
        assert!(build(&cfg, &opts).is_err());
    }
}
