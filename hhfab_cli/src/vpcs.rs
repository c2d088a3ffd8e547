use std::collections::BTreeMap;
use std::path::Path;

use hhfab_definitions::wiring::{
    Connection, StaticExternalLink, StaticExternalSide, Vpc, VpcAttachment, VpcPeering, VpcSubnet,
};
use hhfab_definitions::{VlabPlan, Wiring};

use crate::kubectl;
use crate::ssh;
use crate::workspace::Workspace;
use crate::Result;

/// Namespace VPC objects land in
const VPC_NS: &str = "default";

// The static-external scenario re-wires one server into a BGP-less
// external. Addressing is fixed by convention.
const SE_SWITCH_IP: &str = "172.31.255.1/24";
const SE_SERVER_IP: &str = "172.31.255.5/24";
const SE_NEXT_HOP: &str = "172.31.255.5";
const SE_PREFIX: &str = "10.199.0.0/24";
const SE_PROBE: &str = "10.199.0.100";

/// The server-facing connection a server hangs off, if any
pub fn server_connection(wiring: &Wiring, server: &str) -> Option<String> {
    wiring
        .connections
        .iter()
        .find(|c| c.server_device().as_deref() == Some(server))
        .map(|c| c.name())
}

/// Servers that can take a VPC attachment, with their connections, sorted
fn attachable(wiring: &Wiring) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = wiring
        .servers
        .iter()
        .filter_map(|s| server_connection(wiring, &s.name).map(|c| (s.name.clone(), c)))
        .collect();
    out.sort();
    out
}

/// VPC name for the i-th attachable server (1-based)
fn vpc_name(i: usize) -> String {
    format!("vpc-{:02}", i)
}

/// Create one VPC per server and attach it to the server's connection
///
/// vpc-01 gets 10.0.1.0/24 on vlan 1001, vpc-02 the next of each, and so
/// on; deterministic so reruns apply the same objects.
pub async fn setup_vpcs(ws: &Workspace, wiring: &Wiring) -> Result<()> {
    let kubeconfig = ws.kubeconfig();
    let targets = attachable(wiring);
    if targets.is_empty() {
        bail!("no server-facing connections to attach VPCs to");
    }
    for (i, (server, conn)) in targets.iter().enumerate() {
        let idx = i + 1;
        let name = vpc_name(idx);
        let mut subnets = BTreeMap::new();
        subnets.insert(
            "default".to_string(),
            VpcSubnet {
                subnet: format!("10.0.{}.0/24", idx),
                vlan: Some(1000 + idx as u16),
                isolated: false,
                restricted: false,
            },
        );
        let vpc = Vpc { name: name.clone(), subnets, permit: vec![] };
        info!("Creating {} for {} on {}", name, server, conn);
        kubectl::apply_resource(&kubeconfig, VPC_NS, vpc).await?;

        let att = VpcAttachment { connection: conn.clone(), subnet: format!("{}/default", name) };
        kubectl::apply_resource(&kubeconfig, VPC_NS, att).await?;
    }
    Ok(())
}

/// Peer VPCs pairwise: vpc-01 with vpc-02, vpc-03 with vpc-04, ..
pub async fn setup_peerings(ws: &Workspace, wiring: &Wiring) -> Result<()> {
    let kubeconfig = ws.kubeconfig();
    let n = attachable(wiring).len();
    if n < 2 {
        bail!("need at least two attached VPCs to peer");
    }
    let mut i = 1;
    while i + 1 <= n {
        let peering = VpcPeering { vpc1: vpc_name(i), vpc2: vpc_name(i + 1), permit: vec![] };
        info!("Peering {} with {}", peering.vpc1, peering.vpc2);
        kubectl::apply_resource(&kubeconfig, VPC_NS, peering).await?;
        i += 2;
    }
    Ok(())
}

/// Whether two attached servers should reach each other
///
/// One VPC per server, so reachability is exactly "their VPCs are peered
/// pairwise".
fn expect_reachable(i: usize, j: usize) -> bool {
    // 1-based pair buddies: (1,2), (3,4), ..
    (i.min(j) % 2 == 1) && (i.max(j) == i.min(j) + 1)
}

/// Ping every attached server from every other and compare against the
/// peering expectations
pub async fn test_connectivity(
    ws: &Workspace,
    plan: &VlabPlan,
    wiring: &Wiring,
    key: &Path,
) -> Result<()> {
    let targets = attachable(wiring);
    // ask each server what address its VPC NIC got
    let mut addrs: Vec<(usize, String, String)> = vec![];
    for (i, (server, _)) in targets.iter().enumerate() {
        let t = ssh::target_for(plan, wiring, server)?;
        let out = t.exec_via_client(key, "/opt/bin/hhnet ip").await?;
        let addr = out.trim().to_string();
        if addr.is_empty() {
            bail!("{} reported no VPC address", server);
        }
        addrs.push((i + 1, server.clone(), addr));
    }

    let mut failures = vec![];
    for (i, from, _) in &addrs {
        let t = ssh::target_for(plan, wiring, from)?;
        for (j, to, addr) in &addrs {
            if i == j {
                continue;
            }
            let expected = expect_reachable(*i, *j);
            let cmd = format!("ping -c 3 -W 2 {} >/dev/null 2>&1 && echo up || echo down", addr);
            let out = t.exec_via_client(key, &cmd).await?;
            let up = out.trim() == "up";
            if up != expected {
                failures.push(format!(
                    "{} -> {} ({}): got {}, expected {}",
                    from,
                    to,
                    addr,
                    if up { "reachable" } else { "unreachable" },
                    if expected { "reachable" } else { "unreachable" }
                ));
            } else {
                debug!("{} -> {}: {} as expected", from, to, if up { "up" } else { "down" });
            }
        }
    }
    if !failures.is_empty() {
        bail!("connectivity expectations failed:\n  {}", failures.join("\n  "));
    }
    info!("Connectivity matches peering expectations across {} servers", addrs.len());
    Ok(())
}

/// Pick the server the static-external scenario sacrifices
///
/// An explicit name wins; otherwise the first unbundled server on a
/// non-MCLAG leaf. Description sniffing is deliberately not used.
fn pick_external_server(wiring: &Wiring, explicit: Option<&str>) -> Result<(String, String)> {
    if let Some(name) = explicit {
        for c in &wiring.connections {
            if let Connection::Unbundled { link } = c {
                if c.server_device().as_deref() == Some(name) {
                    return Ok((name.to_string(), link.switch.clone()));
                }
            }
        }
        bail!("{} has no unbundled connection to re-wire", name);
    }
    for c in &wiring.connections {
        if let Connection::Unbundled { link } = c {
            let sw = hhfab_definitions::wiring::device_of(&link.switch);
            let mclag = wiring
                .switches
                .iter()
                .find(|s| s.name == sw)
                .and_then(|s| s.redundancy.as_ref())
                .map(|r| r.kind == hhfab_definitions::wiring::RedundancyKind::Mclag)
                .unwrap_or(false);
            if !mclag {
                let server = c.server_device().expect("unbundled has a server");
                return Ok((server, link.switch.clone()));
            }
        }
    }
    bail!("no unbundled server on a non-MCLAG leaf to use as a static external")
}

/// The static-external release scenario
///
/// Temporarily re-wires one server into a BGP-less external: the switch
/// port gets a StaticExternal connection, the server answers on the probe
/// prefix, and a VPC peered against the external must reach it. Everything
/// is undone afterwards.
pub async fn static_external_test(
    ws: &Workspace,
    plan: &VlabPlan,
    wiring: &Wiring,
    key: &Path,
    explicit: Option<&str>,
) -> Result<()> {
    let kubeconfig = ws.kubeconfig();
    let (server, switch_port) = pick_external_server(wiring, explicit)?;
    let conn_name = server_connection(wiring, &server).expect("picked server has a connection");
    info!("Re-wiring {} (port {}) into a static external", server, switch_port);

    // the old attachment has to go before the port changes personality
    let old_attachment = format!("{}--{}--default", conn_name, vpc_for_server(wiring, &server));
    kubectl::delete_resource(&kubeconfig, VPC_NS, "VPCAttachment", &old_attachment).await?;
    kubectl::delete_resource(&kubeconfig, VPC_NS, "Connection", &conn_name).await?;

    let se = Connection::StaticExternal {
        link: StaticExternalLink {
            switch: StaticExternalSide {
                port: switch_port.clone(),
                ip: Some(SE_SWITCH_IP.into()),
                vlan: None,
                subnets: vec![SE_PREFIX.into()],
                nextHop: Some(SE_NEXT_HOP.into()),
            },
        },
    };
    let se_name = se.name();
    let res = run_static_external(ws, plan, wiring, key, &server, se).await;

    // teardown is part of the test contract either way
    info!("Restoring {} to its VPC attachment", server);
    let _ = kubectl::delete_resource(&kubeconfig, VPC_NS, "Connection", &se_name).await;
    if let Some(t) = ssh::target_for(plan, wiring, &server).ok() {
        let _ = t.exec_via_client(key, "sudo /opt/bin/hhnet cleanup").await;
    }
    res
}

fn vpc_for_server(wiring: &Wiring, server: &str) -> String {
    let idx = attachable(wiring)
        .iter()
        .position(|(s, _)| s == server)
        .map(|i| i + 1)
        .unwrap_or(1);
    vpc_name(idx)
}

async fn run_static_external(
    ws: &Workspace,
    plan: &VlabPlan,
    wiring: &Wiring,
    key: &Path,
    server: &str,
    se: Connection,
) -> Result<()> {
    let kubeconfig = ws.kubeconfig();
    let se_name = se.name();
    kubectl::apply_resource(&kubeconfig, VPC_NS, se).await?;

    // the server now plays the external: static address plus the probe
    // prefix answered locally
    let t = ssh::target_for(plan, wiring, server)?;
    t.exec_via_client(key, &format!("sudo /opt/bin/hhnet static {} {}", SE_SERVER_IP, SE_PROBE))
        .await?;

    // peer the first VPC against it
    let peering = hhfab_definitions::wiring::ExternalPeering {
        vpc: vpc_name(1),
        external: se_name.clone(),
        vpcSubnets: vec!["default".into()],
        externalPrefixes: vec![SE_PREFIX.into()],
    };
    let peering_name = peering.name();
    kubectl::apply_resource(&kubeconfig, VPC_NS, peering).await?;

    // and the probe must answer from inside that VPC
    let (probe_from, _) = attachable(wiring)
        .into_iter()
        .find(|(s, _)| s != server)
        .ok_or("no second server to probe from")?;
    let t = ssh::target_for(plan, wiring, &probe_from)?;
    let cmd = format!("ping -c 3 -W 2 {} >/dev/null 2>&1 && echo up || echo down", SE_PROBE);
    let out = t.exec_via_client(key, &cmd).await?;
    if out.trim() != "up" {
        bail!("{} cannot reach the static external probe {}", probe_from, SE_PROBE);
    }
    let _ = kubectl::delete_resource(&kubeconfig, VPC_NS, "ExternalPeering", &peering_name).await;
    info!("Static external scenario passed via {}", server);
    Ok(())
}

/// The full release test suite
pub async fn release_test(
    ws: &Workspace,
    plan: &VlabPlan,
    wiring: &Wiring,
    key: &Path,
    external_server: Option<&str>,
) -> Result<()> {
    setup_vpcs(ws, wiring).await?;
    setup_peerings(ws, wiring).await?;
    test_connectivity(ws, plan, wiring, key).await?;
    static_external_test(ws, plan, wiring, key, external_server).await?;
    Ok(())
}

/// Print a fabric-wide inspection summary
pub async fn inspect(ws: &Workspace, wiring: &Wiring) -> Result<()> {
    let kubeconfig = ws.kubeconfig();
    println!("{:<12} {:<12} {:<10} {:<18}", "SWITCH", "ROLE", "ASN", "MANAGEMENT");
    for s in &wiring.switches {
        println!(
            "{:<12} {:<12} {:<10} {:<18}",
            s.name,
            format!("{:?}", s.role).to_lowercase(),
            s.asn.map(|a| a.to_string()).unwrap_or_else(|| "-".into()),
            s.managementIP.clone().unwrap_or_else(|| "-".into()),
        );
    }
    let nodes = kubectl::list_names(&kubeconfig, "", "nodes").await?;
    println!("cluster nodes: {}", nodes.join(", "));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hhfab_definitions::builder::{build, BuildOpts};
    use hhfab_definitions::FabConfig;

    #[test]
    fn attachable_servers_are_sorted_with_connections() {
        let w = build(&FabConfig::default(), &BuildOpts::default()).unwrap();
        let a = attachable(&w);
        assert!(!a.is_empty());
        let names: Vec<_> = a.iter().map(|(s, _)| s.clone()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        for (server, conn) in &a {
            assert!(conn.contains(server.as_str()));
        }
    }

    #[test]
    fn reachability_expectation_is_pairwise() {
        assert!(expect_reachable(1, 2));
        assert!(expect_reachable(2, 1));
        assert!(expect_reachable(3, 4));
        assert!(!expect_reachable(2, 3));
        assert!(!expect_reachable(1, 3));
        assert!(!expect_reachable(1, 4));
    }

    #[test]
    fn external_pick_avoids_mclag() {
        let w = build(&FabConfig::default(), &BuildOpts::default()).unwrap();
        let (server, port) = pick_external_server(&w, None).unwrap();
        let sw = hhfab_definitions::wiring::device_of(&port).to_string();
        let s = w.switches.iter().find(|s| s.name == sw).unwrap();
        let is_mclag = s
            .redundancy
            .as_ref()
            .map(|r| r.kind == hhfab_definitions::wiring::RedundancyKind::Mclag)
            .unwrap_or(false);
        assert!(!is_mclag, "picked {} on MCLAG leaf {}", server, sw);
    }

    #[test]
    fn explicit_external_pick_validated() {
        let w = build(&FabConfig::default(), &BuildOpts::default()).unwrap();
        // server-01 is MCLAG attached, not unbundled
        assert!(pick_external_server(&w, Some("server-01")).is_err());
    }
}
