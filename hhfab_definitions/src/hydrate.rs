#![allow(non_snake_case)]

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;

use crate::config::{FabConfig, FabricMode};
use crate::wiring::{
    Connection, Gateway, GatewayInterface, BgpNeighbor, Objects, RedundancyKind, Switch, Wiring,
    device_of,
};
use crate::{ErrorKind, Result};

/// MAC every hydrated gateway VTEP carries
pub const GATEWAY_VTEP_MAC: &str = "0c:20:12:ff:00:01";

/// How much of the wiring already carries network attributes
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HydrationStatus {
    /// Every field requiring a value is empty
    None,
    /// Some fields set, some empty - ambiguous
    Partial,
    /// Every field requiring a value is set
    Full,
}

/// What to do about the detected status
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HydrateMode {
    /// Expect a fully hydrated wiring, fail otherwise
    Never,
    /// Hydrate an empty wiring, accept a full one, reject a partial one
    IfNotPresent,
    /// Re-hydrate unconditionally
    Override,
}

impl Default for HydrateMode {
    fn default() -> Self {
        HydrateMode::IfNotPresent
    }
}

fn parse_prefixed(owner: &str, field: &str, s: &str) -> Result<(Ipv4Addr, u8)> {
    let mut it = s.splitn(2, '/');
    let addr = it.next().unwrap_or("");
    let bits = it
        .next()
        .ok_or_else(|| ErrorKind::InvalidWiring(owner.into(), format!("{} '{}' has no prefix length", field, s)))?;
    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|_| ErrorKind::InvalidWiring(owner.into(), format!("{} '{}' is not an address", field, s)))?;
    let bits: u8 = bits
        .parse()
        .map_err(|_| ErrorKind::InvalidWiring(owner.into(), format!("{} '{}' has a bad prefix length", field, s)))?;
    Ok((addr, bits))
}

fn invalid(owner: &str, reason: String) -> crate::Error {
    ErrorKind::InvalidWiring(owner.into(), reason).into()
}

/// Field walker shared by status detection and validation
///
/// Counts every field that requires a value and how many are empty, and
/// cross-checks every value that is present. Structural invariants that do
/// not depend on hydration (group sizes, collapsed-core shape) are checked
/// unconditionally.
struct Audit<'a> {
    cfg: &'a FabConfig,
    total: usize,
    missing: usize,
    mgmt_seen: BTreeMap<Ipv4Addr, String>,
    dummy_seen: BTreeMap<Ipv4Addr, String>,
    proto_seen: BTreeMap<Ipv4Addr, String>,
    vtep_seen: BTreeMap<Ipv4Addr, String>,
    fabric_seen: BTreeMap<Ipv4Addr, String>,
}

impl<'a> Audit<'a> {
    fn new(cfg: &'a FabConfig) -> Self {
        Audit {
            cfg,
            total: 0,
            missing: 0,
            mgmt_seen: BTreeMap::new(),
            dummy_seen: BTreeMap::new(),
            proto_seen: BTreeMap::new(),
            vtep_seen: BTreeMap::new(),
            fabric_seen: BTreeMap::new(),
        }
    }

    fn field(&mut self, present: bool) {
        self.total += 1;
        if !present {
            self.missing += 1;
        }
    }

    fn check_mgmt(&mut self, owner: &str, val: &str) -> Result<()> {
        let (addr, bits) = parse_prefixed(owner, "managementIP", val)?;
        let subnet = self.cfg.management.subnet;
        if bits != subnet.prefix() {
            return Err(invalid(owner, format!("managementIP {} does not carry /{}", val, subnet.prefix())));
        }
        if !subnet.contains(addr) {
            return Err(invalid(owner, format!("managementIP {} is outside {}", val, subnet)));
        }
        if u32::from(addr) >= u32::from(self.cfg.management.dhcpStart) {
            return Err(invalid(owner, format!("managementIP {} is not below dhcpStart {}", val, self.cfg.management.dhcpStart)));
        }
        if u32::from(addr) < u32::from(self.cfg.management.allocationStart()) {
            return Err(invalid(owner, format!("managementIP {} is inside the VIP reserved block", val)));
        }
        if let Some(prev) = self.mgmt_seen.insert(addr, owner.to_string()) {
            return Err(invalid(owner, format!("managementIP {} already used by {}", addr, prev)));
        }
        Ok(())
    }

    fn check_dummy(&mut self, owner: &str, val: &str) -> Result<()> {
        let (addr, bits) = parse_prefixed(owner, "dummyIP", val)?;
        if bits != 31 {
            return Err(invalid(owner, format!("dummyIP {} is not a /31", val)));
        }
        if !self.cfg.dummySubnet.contains(addr) {
            return Err(invalid(owner, format!("dummyIP {} is outside {}", val, self.cfg.dummySubnet)));
        }
        if u32::from(addr) & 1 != 0 {
            return Err(invalid(owner, format!("dummyIP {} is not /31-aligned", val)));
        }
        if let Some(prev) = self.dummy_seen.insert(addr, owner.to_string()) {
            return Err(invalid(owner, format!("dummyIP {} overlaps {}", addr, prev)));
        }
        Ok(())
    }

    fn check_proto(&mut self, owner: &str, val: &str) -> Result<()> {
        let (addr, bits) = parse_prefixed(owner, "protocolIP", val)?;
        if bits != 32 {
            return Err(invalid(owner, format!("protocolIP {} is not a /32", val)));
        }
        if !self.cfg.protocolSubnet.contains(addr) {
            return Err(invalid(owner, format!("protocolIP {} is outside {}", val, self.cfg.protocolSubnet)));
        }
        if let Some(prev) = self.proto_seen.insert(addr, owner.to_string()) {
            return Err(invalid(owner, format!("protocolIP {} already used by {}", addr, prev)));
        }
        Ok(())
    }

    fn check_vtep(&mut self, owner: &str, val: &str, w: &Wiring) -> Result<()> {
        let (addr, bits) = parse_prefixed(owner, "vtepIP", val)?;
        if bits != 32 {
            return Err(invalid(owner, format!("vtepIP {} is not a /32", val)));
        }
        if !self.cfg.vtepSubnet.contains(addr) {
            return Err(invalid(owner, format!("vtepIP {} is outside {}", val, self.cfg.vtepSubnet)));
        }
        if let Some(prev) = self.vtep_seen.insert(addr, owner.to_string()) {
            // the one legal share: both members of one MCLAG pair
            if !same_mclag_group(w, owner, &prev) {
                return Err(invalid(owner, format!("vtepIP {} already used by {}", addr, prev)));
            }
        }
        Ok(())
    }

    fn check_fabric_half(&mut self, owner: &str, val: &str) -> Result<Ipv4Addr> {
        let (addr, bits) = parse_prefixed(owner, "link ip", val)?;
        if bits != 31 {
            return Err(invalid(owner, format!("link ip {} is not a /31", val)));
        }
        if !self.cfg.fabricSubnet.contains(addr) {
            return Err(invalid(owner, format!("link ip {} is outside {}", val, self.cfg.fabricSubnet)));
        }
        if let Some(prev) = self.fabric_seen.insert(addr, owner.to_string()) {
            return Err(invalid(owner, format!("link ip {} already used in {}", addr, prev)));
        }
        Ok(addr)
    }

    fn check_pair(&mut self, owner: &str, a: &Option<String>, b: &Option<String>) -> Result<()> {
        self.field(a.is_some());
        self.field(b.is_some());
        let (a, b) = match (a, b) {
            (Some(a), Some(b)) => (a, b),
            _ => return Ok(()),
        };
        let a = self.check_fabric_half(owner, a)?;
        let b = self.check_fabric_half(owner, b)?;
        if u32::from(a) & !1 != u32::from(b) & !1 {
            return Err(invalid(owner, format!("{} and {} are not halves of one /31", a, b)));
        }
        Ok(())
    }
}

fn same_mclag_group(w: &Wiring, a: &str, b: &str) -> bool {
    let ga = Objects::<Switch>::get(w, a).and_then(|s| s.redundancy.clone());
    let gb = Objects::<Switch>::get(w, b).and_then(|s| s.redundancy.clone());
    match (ga, gb) {
        (Some(ga), Some(gb)) => {
            ga.kind == RedundancyKind::Mclag && gb.kind == RedundancyKind::Mclag && ga.group == gb.group
        }
        _ => false,
    }
}

fn vtep_wanted(cfg: &FabConfig) -> bool {
    cfg.fabricMode != FabricMode::CollapsedCore || cfg.collapsedCoreVTEP
}

/// Structural invariants that hold hydrated or not
fn audit_shape(w: &Wiring, cfg: &FabConfig) -> Result<()> {
    use regex::Regex;
    let name_re = Regex::new(r"^[0-9a-z][0-9a-z\-]{0,49}$").unwrap();
    for name in w
        .switches
        .iter()
        .map(|s| &s.name)
        .chain(w.servers.iter().map(|s| &s.name))
        .chain(w.controlNodes.iter().map(|n| &n.name))
        .chain(w.fabNodes.iter().map(|n| &n.name))
        .chain(w.gateways.iter().map(|g| &g.name))
    {
        if !name_re.is_match(name) {
            return Err(invalid(name, "name must be short, lowercase and dash separated".into()));
        }
    }

    // redundancy group sizes
    let mut groups: BTreeMap<String, (RedundancyKind, usize)> = BTreeMap::new();
    for s in &w.switches {
        if let Some(r) = &s.redundancy {
            let e = groups.entry(r.group.clone()).or_insert((r.kind.clone(), 0));
            if e.0 != r.kind {
                return Err(invalid(&s.name, format!("group {} mixes redundancy kinds", r.group)));
            }
            e.1 += 1;
        }
    }
    for (g, (kind, n)) in &groups {
        match kind {
            RedundancyKind::Mclag if *n != 2 => {
                return Err(invalid(g, format!("MCLAG group has {} members, expected 2", n)));
            }
            RedundancyKind::Eslag if *n < 2 || *n > 4 => {
                return Err(invalid(g, format!("ESLAG group has {} members, expected 2..=4", n)));
            }
            _ => {}
        }
    }

    if cfg.fabricMode == FabricMode::CollapsedCore {
        if !w.spines().is_empty() {
            bail!("collapsed-core wiring cannot contain spines");
        }
        if w.connections.iter().any(|c| matches!(c, Connection::Fabric { .. })) {
            bail!("collapsed-core wiring cannot contain fabric connections");
        }
        for s in w.leaves() {
            match s.redundancy_kind() {
                Some(RedundancyKind::Mclag) => {}
                Some(RedundancyKind::Eslag) => {
                    return Err(invalid(&s.name, "collapsed-core does not support ESLAG".into()));
                }
                None => {
                    return Err(invalid(&s.name, "collapsed-core does not support orphan leaves".into()));
                }
            }
        }
    }
    Ok(())
}

fn audit(w: &Wiring, cfg: &FabConfig) -> Result<(usize, usize)> {
    audit_shape(w, cfg)?;
    let mut a = Audit::new(cfg);

    for n in &w.controlNodes {
        a.field(n.managementIP.is_some());
        if let Some(v) = &n.managementIP {
            a.check_mgmt(&n.name, v)?;
        }
        a.field(n.dummyIP.is_some());
        if let Some(v) = &n.dummyIP {
            a.check_dummy(&n.name, v)?;
        }
    }
    for n in &w.fabNodes {
        a.field(n.managementIP.is_some());
        if let Some(v) = &n.managementIP {
            a.check_mgmt(&n.name, v)?;
        }
        a.field(n.dummyIP.is_some());
        if let Some(v) = &n.dummyIP {
            a.check_dummy(&n.name, v)?;
        }
    }

    // group -> (asn, vtep) for symmetry checking
    let mut mclag: BTreeMap<String, (Option<u32>, Option<String>)> = BTreeMap::new();
    for s in &w.switches {
        a.field(s.managementIP.is_some());
        if let Some(v) = &s.managementIP {
            a.check_mgmt(&s.name, v)?;
        }
        a.field(s.protocolIP.is_some());
        if let Some(v) = &s.protocolIP {
            a.check_proto(&s.name, v)?;
        }
        a.field(s.asn.is_some());
        if let Some(asn) = s.asn {
            if s.is_spine() {
                if asn != cfg.spineASN {
                    return Err(invalid(&s.name, format!("spine carries ASN {}, expected {}", asn, cfg.spineASN)));
                }
            } else if asn < cfg.leafASNStart || asn > cfg.leafASNEnd {
                return Err(invalid(&s.name, format!("leaf ASN {} outside [{}, {}]", asn, cfg.leafASNStart, cfg.leafASNEnd)));
            }
        }
        if s.is_leaf() && vtep_wanted(cfg) {
            a.field(s.vtepIP.is_some());
        }
        if let Some(v) = &s.vtepIP {
            if s.is_spine() {
                return Err(invalid(&s.name, "spines do not carry VTEP IPs".into()));
            }
            a.check_vtep(&s.name, v, w)?;
        }
        if let Some(r) = &s.redundancy {
            if r.kind == RedundancyKind::Mclag {
                let e = mclag.entry(r.group.clone()).or_insert((s.asn, s.vtepIP.clone()));
                if s.asn.is_some() && e.0.is_some() && e.0 != s.asn {
                    return Err(invalid(&s.name, format!("MCLAG pair {} disagrees on ASN", r.group)));
                }
                if s.vtepIP.is_some() && e.1.is_some() && e.1 != s.vtepIP {
                    return Err(invalid(&s.name, format!("MCLAG pair {} disagrees on VTEP IP", r.group)));
                }
            }
        }
    }

    for c in &w.connections {
        let name = c.name();
        match c {
            Connection::Fabric { links } => {
                for l in links {
                    a.check_pair(&name, &l.spine.ip, &l.leaf.ip)?;
                }
            }
            Connection::Mesh { links } => {
                for l in links {
                    a.check_pair(&name, &l.leaf1.ip, &l.leaf2.ip)?;
                }
            }
            Connection::Gateway { links } => {
                for l in links {
                    a.check_pair(&name, &l.switch.ip, &l.gateway.ip)?;
                }
            }
            _ => {}
        }
    }

    // expected gateway interfaces/neighbors come from the gateway connections
    let mut gw_ifaces: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for c in &w.connections {
        if let Connection::Gateway { links } = c {
            for l in links {
                let dev = device_of(&l.gateway.port).to_string();
                let nic = l.gateway.port.splitn(2, '/').nth(1).unwrap_or("").to_string();
                gw_ifaces.entry(dev).or_insert_with(Vec::new).push(nic);
            }
        }
    }
    for g in &w.gateways {
        a.field(g.asn.is_some());
        if let Some(asn) = g.asn {
            if asn != cfg.gatewayASN {
                return Err(invalid(&g.name, format!("gateway carries ASN {}, expected {}", asn, cfg.gatewayASN)));
            }
        }
        a.field(g.protocolIP.is_some());
        if let Some(v) = &g.protocolIP {
            a.check_proto(&g.name, v)?;
        }
        a.field(g.vtepIP.is_some());
        if let Some(v) = &g.vtepIP {
            a.check_vtep(&g.name, v, w)?;
        }
        a.field(g.vtepMAC.is_some());

        let expected = gw_ifaces.get(&g.name).cloned().unwrap_or_default();
        for nic in &expected {
            let set = g.interfaces.get(nic).map(|i| i.ip.is_some()).unwrap_or(false);
            a.field(set);
        }
        a.total += expected.len();
        a.missing += expected.len().saturating_sub(g.neighbors.len());
        for n in &g.neighbors {
            let _: Ipv4Addr = n
                .ip
                .parse()
                .map_err(|_| invalid(&g.name, format!("neighbor ip '{}' is not an address", n.ip)))?;
        }
    }

    Ok((a.total, a.missing))
}

/// Detect how hydrated a wiring is, cross-checking every present value
pub fn get_hydration(w: &Wiring, cfg: &FabConfig) -> Result<HydrationStatus> {
    let (total, missing) = audit(w, cfg)?;
    trace!("hydration fields: {} total, {} missing", total, missing);
    Ok(if missing == 0 {
        HydrationStatus::Full
    } else if missing == total {
        HydrationStatus::None
    } else {
        HydrationStatus::Partial
    })
}

/// Fabric-wide validation of a hydrated wiring
pub fn validate(w: &Wiring, cfg: &FabConfig) -> Result<()> {
    cfg.verify()?;
    match get_hydration(w, cfg)? {
        HydrationStatus::Full => Ok(()),
        s => Err(ErrorKind::HydrationFailure(format!("wiring is not fully hydrated: {:?}", s)).into()),
    }
}

fn wipe(w: &mut Wiring) {
    for n in &mut w.controlNodes {
        n.managementIP = None;
        n.dummyIP = None;
    }
    for n in &mut w.fabNodes {
        n.managementIP = None;
        n.dummyIP = None;
    }
    for s in &mut w.switches {
        s.managementIP = None;
        s.protocolIP = None;
        s.vtepIP = None;
        s.asn = None;
    }
    for c in &mut w.connections {
        match c {
            Connection::Fabric { links } => {
                for l in links {
                    l.spine.ip = None;
                    l.leaf.ip = None;
                }
            }
            Connection::Mesh { links } => {
                for l in links {
                    l.leaf1.ip = None;
                    l.leaf2.ip = None;
                }
            }
            Connection::Gateway { links } => {
                for l in links {
                    l.switch.ip = None;
                    l.gateway.ip = None;
                }
            }
            _ => {}
        }
    }
    for g in &mut w.gateways {
        g.asn = None;
        g.protocolIP = None;
        g.vtepIP = None;
        g.vtepMAC = None;
        g.interfaces.clear();
        g.neighbors.clear();
    }
}

/// Sequential address cursor over a subnet
struct Cursor {
    subnet: Ipv4Network,
    next: u32,
    what: &'static str,
}

impl Cursor {
    fn new(subnet: Ipv4Network, start: u32, what: &'static str) -> Self {
        Cursor { subnet, next: start, what }
    }

    fn take(&mut self) -> Result<Ipv4Addr> {
        let addr = self
            .subnet
            .nth(self.next)
            .ok_or_else(|| ErrorKind::HydrationFailure(format!("{} subnet {} exhausted", self.what, self.subnet)))?;
        self.next += 1;
        Ok(addr)
    }
}

fn allocate(w: &mut Wiring, cfg: &FabConfig) -> Result<()> {
    let mgmt_bits = cfg.management.subnet.prefix();
    let mut mgmt = Cursor::new(cfg.management.subnet, 6, "management");
    let mut dummy = Cursor::new(cfg.dummySubnet, 0, "dummy");
    let mut proto = Cursor::new(cfg.protocolSubnet, 0, "protocol");
    let mut vtep = Cursor::new(cfg.vtepSubnet, 0, "vtep");
    let mut fabric = Cursor::new(cfg.fabricSubnet, 0, "fabric");
    let mut next_asn = cfg.leafASNStart;

    let take_mgmt = |mgmt: &mut Cursor| -> Result<String> {
        let addr = mgmt.take()?;
        if u32::from(addr) >= u32::from(cfg.management.dhcpStart) {
            return Err(ErrorKind::HydrationFailure(format!(
                "management allocations ran into dhcpStart {}",
                cfg.management.dhcpStart
            ))
            .into());
        }
        Ok(format!("{}/{}", addr, mgmt_bits))
    };
    // dummy interfaces take whole /31s: two addresses a pop
    let take_dummy = |dummy: &mut Cursor| -> Result<String> {
        let addr = dummy.take()?;
        dummy.take()?;
        Ok(format!("{}/31", addr))
    };

    // 1. control nodes, then gateway nodes, by name
    let mut names: Vec<String> = w.controlNodes.iter().map(|n| n.name.clone()).collect();
    names.sort();
    for name in names {
        let mip = take_mgmt(&mut mgmt)?;
        let dip = take_dummy(&mut dummy)?;
        let n = Objects::<crate::wiring::ControlNode>::get_mut(w, &name).unwrap();
        n.managementIP = Some(mip);
        n.dummyIP = Some(dip);
    }
    let mut names: Vec<String> = w.fabNodes.iter().map(|n| n.name.clone()).collect();
    names.sort();
    for name in names {
        let mip = take_mgmt(&mut mgmt)?;
        let dip = take_dummy(&mut dummy)?;
        let n = Objects::<crate::wiring::FabNode>::get_mut(w, &name).unwrap();
        n.managementIP = Some(mip);
        n.dummyIP = Some(dip);
    }

    // 2. switches, spines first then by name
    let mut sw_names: Vec<(bool, String)> =
        w.switches.iter().map(|s| (!s.is_spine(), s.name.clone())).collect();
    sw_names.sort();
    let mut mclag_pairs: BTreeMap<String, (u32, Option<String>)> = BTreeMap::new();
    for (_, name) in sw_names {
        let mip = take_mgmt(&mut mgmt)?;
        let pip = format!("{}/32", proto.take()?);
        let (is_spine, red) = {
            let s = Objects::<Switch>::get(w, &name).unwrap();
            (s.is_spine(), s.redundancy.clone())
        };
        let (asn, vtep_ip) = if is_spine {
            (cfg.spineASN, None)
        } else {
            let shared = red
                .as_ref()
                .filter(|r| r.kind == RedundancyKind::Mclag)
                .and_then(|r| mclag_pairs.get(&r.group).cloned());
            match shared {
                // second member of the pair rides along, counters stay put
                Some((asn, vip)) => (asn, vip),
                None => {
                    if next_asn > cfg.leafASNEnd {
                        return Err(ErrorKind::HydrationFailure("leaf ASN range exhausted".into()).into());
                    }
                    let asn = next_asn;
                    next_asn += 1;
                    let vip = if vtep_wanted(cfg) {
                        Some(format!("{}/32", vtep.take()?))
                    } else {
                        None
                    };
                    if let Some(r) = red.as_ref().filter(|r| r.kind == RedundancyKind::Mclag) {
                        mclag_pairs.insert(r.group.clone(), (asn, vip.clone()));
                    }
                    (asn, vip)
                }
            }
        };
        let s = Objects::<Switch>::get_mut(w, &name).unwrap();
        s.managementIP = Some(mip);
        s.protocolIP = Some(pip);
        s.asn = Some(asn);
        s.vtepIP = vtep_ip;
    }

    // 3. connection links, by connection name
    let mut order: Vec<(String, usize)> =
        w.connections.iter().enumerate().map(|(i, c)| (c.name(), i)).collect();
    order.sort();
    // gateway updates applied after the walk to keep the borrows simple
    let mut gw_updates: Vec<(String, String, String, BgpNeighbor)> = vec![];
    for (_, idx) in order {
        // first address to the spine/leaf1/switch side, second to the other
        let pair = |fabric: &mut Cursor| -> Result<(String, String)> {
            let a = fabric.take()?;
            let b = fabric.take()?;
            Ok((format!("{}/31", a), format!("{}/31", b)))
        };
        match &mut w.connections[idx] {
            Connection::Fabric { links } => {
                for l in links {
                    let (a, b) = pair(&mut fabric)?;
                    l.spine.ip = Some(a);
                    l.leaf.ip = Some(b);
                }
            }
            Connection::Mesh { links } => {
                for l in links {
                    let (a, b) = pair(&mut fabric)?;
                    l.leaf1.ip = Some(a);
                    l.leaf2.ip = Some(b);
                }
            }
            Connection::Gateway { links } => {
                for l in links {
                    let (a, b) = pair(&mut fabric)?;
                    l.switch.ip = Some(a.clone());
                    l.gateway.ip = Some(b.clone());
                    let gw = device_of(&l.gateway.port).to_string();
                    let nic = l.gateway.port.splitn(2, '/').nth(1).unwrap_or("").to_string();
                    let switch_addr = a.splitn(2, '/').next().unwrap_or("").to_string();
                    gw_updates.push((gw, nic, b, BgpNeighbor { ip: switch_addr, asn: 0 }));
                }
            }
            _ => {}
        }
    }
    for (gw, nic, ip, mut neighbor) in gw_updates {
        // the neighbor speaks from the switch side of the /31
        let peer = w
            .connections
            .iter()
            .find_map(|c| match c {
                Connection::Gateway { links } => links.iter().find_map(|l| {
                    if l.gateway.ip.as_deref() == Some(ip.as_str()) {
                        Some(device_of(&l.switch.port).to_string())
                    } else {
                        None
                    }
                }),
                _ => None,
            })
            .ok_or_else(|| ErrorKind::HydrationFailure(format!("gateway link {} lost its switch side", ip)))?;
        let peer_asn = Objects::<Switch>::get(w, &peer)
            .and_then(|s| s.asn)
            .ok_or_else(|| ErrorKind::UnknownObject("Switch".into(), peer.clone()))?;
        neighbor.asn = peer_asn;
        let g = Objects::<Gateway>::get_mut(w, &gw)
            .ok_or_else(|| ErrorKind::UnknownObject("Gateway".into(), gw.clone()))?;
        g.interfaces.insert(nic, GatewayInterface { ip: Some(ip), mtu: cfg.fabricMTU });
        g.neighbors.push(neighbor);
    }

    // 4. gateway identities
    let mut names: Vec<String> = w.gateways.iter().map(|g| g.name.clone()).collect();
    names.sort();
    for name in names {
        let pip = format!("{}/32", proto.take()?);
        let vip = format!("{}/32", vtep.take()?);
        let g = Objects::<Gateway>::get_mut(w, &name).unwrap();
        g.asn = Some(cfg.gatewayASN);
        g.protocolIP = Some(pip);
        g.vtepIP = Some(vip);
        g.vtepMAC = Some(GATEWAY_VTEP_MAC.into());
    }

    Ok(())
}

/// Fill in every missing network attribute of the wiring
///
/// Deterministic: two runs against the same input wiring produce identical
/// outputs. The wiring is frozen for the rest of the run afterwards.
pub fn hydrate(w: &mut Wiring, cfg: &FabConfig, mode: HydrateMode) -> Result<()> {
    cfg.verify()?;
    match mode {
        HydrateMode::Never => {
            let status = get_hydration(w, cfg)?;
            if status != HydrationStatus::Full {
                return Err(ErrorKind::HydrationFailure(format!(
                    "wiring is {:?} and hydration mode is never",
                    status
                ))
                .into());
            }
            return Ok(());
        }
        HydrateMode::IfNotPresent => match get_hydration(w, cfg)? {
            HydrationStatus::Full => return Ok(()),
            HydrationStatus::Partial => {
                return Err(ErrorKind::HydrationFailure(
                    "wiring is partially hydrated; refusing to guess the rest".into(),
                )
                .into());
            }
            HydrationStatus::None => {}
        },
        HydrateMode::Override => {
            wipe(w);
        }
    }

    allocate(w, cfg)?;
    let status = get_hydration(w, cfg)?;
    if status != HydrationStatus::Full {
        return Err(ErrorKind::HydrationFailure(format!("wiring is {:?} after hydration", status)).into());
    }
    validate(w, cfg)?;
    info!(
        "Hydrated wiring: {} switches, {} nodes",
        w.switches.len(),
        w.controlNodes.len() + w.fabNodes.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{build, BuildOpts};
    use crate::config::FabConfig;
    use crate::wiring::ControlNode;

    fn built(cfg: &FabConfig) -> Wiring {
        build(cfg, &BuildOpts::default()).unwrap()
    }

    #[test]
    fn status_detection() {
        let cfg = FabConfig::default();
        let mut w = built(&cfg);
        assert_eq!(get_hydration(&w, &cfg).unwrap(), HydrationStatus::None);

        hydrate(&mut w, &cfg, HydrateMode::IfNotPresent).unwrap();
        assert_eq!(get_hydration(&w, &cfg).unwrap(), HydrationStatus::Full);

        // poke a hole and it turns partial, which if-not-present refuses
        Objects::<Switch>::get_mut(&mut w, "leaf-01").unwrap().asn = None;
        assert_eq!(get_hydration(&w, &cfg).unwrap(), HydrationStatus::Partial);
        assert!(hydrate(&mut w.clone(), &cfg, HydrateMode::IfNotPresent).is_err());
        assert!(hydrate(&mut w.clone(), &cfg, HydrateMode::Never).is_err());

        // but override refills everything
        hydrate(&mut w, &cfg, HydrateMode::Override).unwrap();
        assert_eq!(get_hydration(&w, &cfg).unwrap(), HydrationStatus::Full);
    }

    #[test]
    fn hydration_is_deterministic() {
        let cfg = FabConfig::default();
        let base = built(&cfg);

        let mut one = base.clone();
        hydrate(&mut one, &cfg, HydrateMode::IfNotPresent).unwrap();
        let mut two = base.clone();
        hydrate(&mut two, &cfg, HydrateMode::IfNotPresent).unwrap();
        assert_eq!(one.to_yaml().unwrap(), two.to_yaml().unwrap());

        // override on an already hydrated wiring lands on the same bytes
        let mut three = one.clone();
        hydrate(&mut three, &cfg, HydrateMode::Override).unwrap();
        assert_eq!(one.to_yaml().unwrap(), three.to_yaml().unwrap());
    }

    #[test]
    fn collapsed_core_addresses() {
        let mut cfg = FabConfig::default();
        cfg.fabricMode = FabricMode::CollapsedCore;
        cfg.management.dhcpStart = "172.30.1.10".parse().unwrap();
        let mut w = built(&cfg);
        hydrate(&mut w, &cfg, HydrateMode::IfNotPresent).unwrap();

        let c = Objects::<ControlNode>::get(&w, "control-01").unwrap();
        assert_eq!(c.managementIP.as_deref(), Some("172.30.1.6/24"));
        let l1 = Objects::<Switch>::get(&w, "leaf-01").unwrap();
        let l2 = Objects::<Switch>::get(&w, "leaf-02").unwrap();
        assert_eq!(l1.managementIP.as_deref(), Some("172.30.1.7/24"));
        assert_eq!(l2.managementIP.as_deref(), Some("172.30.1.8/24"));
        assert_eq!(l1.asn, l2.asn);
        // VTEPs stay on in collapsed-core unless configured away
        assert!(l1.vtepIP.is_some());
        assert_eq!(l1.vtepIP, l2.vtepIP);

        let mut cfg2 = cfg.clone();
        cfg2.collapsedCoreVTEP = false;
        let mut w2 = built(&cfg2);
        hydrate(&mut w2, &cfg2, HydrateMode::IfNotPresent).unwrap();
        assert!(Objects::<Switch>::get(&w2, "leaf-01").unwrap().vtepIP.is_none());
    }

    #[test]
    fn fabric_pairs_walk_the_subnet() {
        let cfg = FabConfig::default();
        let mut opts = BuildOpts::default();
        opts.spines = 1;
        opts.mclagLeafs = 2;
        opts.eslagLeafGroups = " ".into();
        opts.orphanLeafs = 0;
        // two fabric connections with two links each
        let mut w = build(&cfg, &opts).unwrap();
        hydrate(&mut w, &cfg, HydrateMode::IfNotPresent).unwrap();

        let mut ips = vec![];
        for c in &w.connections {
            if let Connection::Fabric { links } = c {
                for l in links {
                    ips.push((l.spine.ip.clone().unwrap(), l.leaf.ip.clone().unwrap()));
                }
            }
        }
        assert_eq!(ips.len(), 4);
        assert_eq!(ips[0], ("172.30.136.0/31".to_string(), "172.30.136.1/31".to_string()));
        assert_eq!(ips[1], ("172.30.136.2/31".to_string(), "172.30.136.3/31".to_string()));
        assert_eq!(ips[2], ("172.30.136.4/31".to_string(), "172.30.136.5/31".to_string()));
        assert_eq!(ips[3], ("172.30.136.6/31".to_string(), "172.30.136.7/31".to_string()));
    }

    #[test]
    fn mclag_pair_shares_asn_and_vtep() {
        let cfg = FabConfig::default();
        let mut w = built(&cfg);
        hydrate(&mut w, &cfg, HydrateMode::IfNotPresent).unwrap();

        let l1 = Objects::<Switch>::get(&w, "leaf-01").unwrap().clone();
        let l2 = Objects::<Switch>::get(&w, "leaf-02").unwrap().clone();
        assert_eq!(l1.asn, l2.asn);
        assert_eq!(l1.vtepIP, l2.vtepIP);

        // the counter does not advance twice for the pair: the next new
        // leaf is exactly one ASN further on
        let l3 = Objects::<Switch>::get(&w, "leaf-03").unwrap().clone();
        assert_eq!(l3.asn.unwrap(), l1.asn.unwrap() + 1);
        assert_ne!(l3.vtepIP, l1.vtepIP);
    }

    #[test]
    fn gateway_neighbors_point_at_switch_halves() {
        let cfg = FabConfig::default();
        let mut opts = BuildOpts::default();
        opts.gateway = true;
        let mut w = build(&cfg, &opts).unwrap();
        hydrate(&mut w, &cfg, HydrateMode::IfNotPresent).unwrap();

        let g = Objects::<Gateway>::get(&w, "gw-01").unwrap();
        assert_eq!(g.asn, Some(cfg.gatewayASN));
        assert_eq!(g.vtepMAC.as_deref(), Some(GATEWAY_VTEP_MAC));
        assert_eq!(g.neighbors.len(), 2);
        for n in &g.neighbors {
            assert_eq!(n.asn, cfg.spineASN);
        }
        assert_eq!(g.interfaces.len(), 2);
        for i in g.interfaces.values() {
            assert!(i.ip.is_some());
            assert_eq!(i.mtu, cfg.fabricMTU);
        }
    }

    #[test]
    fn duplicate_management_ip_rejected() {
        let cfg = FabConfig::default();
        let mut w = built(&cfg);
        hydrate(&mut w, &cfg, HydrateMode::IfNotPresent).unwrap();
        let ip = Objects::<Switch>::get(&w, "leaf-01").unwrap().managementIP.clone();
        Objects::<Switch>::get_mut(&mut w, "leaf-02").unwrap().managementIP = ip;
        assert!(get_hydration(&w, &cfg).is_err());
    }

    #[test]
    fn fabric_half_reuse_rejected() {
        let cfg = FabConfig::default();
        let mut w = built(&cfg);
        hydrate(&mut w, &cfg, HydrateMode::IfNotPresent).unwrap();
        // steal the first fabric ip and reuse it on another link
        let mut stolen = None;
        for c in &mut w.connections {
            if let Connection::Fabric { links } = c {
                match stolen {
                    None => stolen = links[0].spine.ip.clone(),
                    Some(ref ip) => {
                        links[0].spine.ip = Some(ip.clone());
                        break;
                    }
                }
            }
        }
        assert!(get_hydration(&w, &cfg).is_err());
    }
}
