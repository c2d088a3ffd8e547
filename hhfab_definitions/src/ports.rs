use std::collections::BTreeMap;

use super::{ErrorKind, Result};

/// Fixed marker every vlab VM UUID starts with
///
/// Stale QEMU processes from prior runs are recognised by this prefix on
/// their `-uuid` argument.
pub const VM_UUID_PREFIX: &str = "77374a6a-0000-4aea-b105-";

/// UUID handed to QEMU for a VM id
pub fn vm_uuid(id: u32) -> String {
    format!("{}{:012}", VM_UUID_PREFIX, id)
}

/// Host TCP port the VM's ssh endpoint is forwarded to
///
/// Stable for the lifetime of a run so partial re-runs attach to the same
/// rendezvous.
pub fn ssh_port(id: u32) -> u16 {
    22000 + (id as u16)
}

/// Host TCP port a control VM's kubernetes api is forwarded to
pub fn api_port(id: u32) -> u16 {
    6443 + (id as u16)
}

/// Stable management MAC for a switch index
pub fn switch_mac(idx: u32) -> String {
    format!("0c:20:12:fe:{:02x}:00", idx)
}

/// Deterministic port name allocator
///
/// Downstream identity of every link and NIC must be reproducible given the
/// builder's call order, so this is a plain per-device counter with no
/// reuse.
#[derive(Default, Debug, Clone)]
pub struct PortAllocator {
    switch_last: BTreeMap<String, u32>,
    server_last: BTreeMap<String, u32>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Default::default()
    }

    /// Next front-panel port on a switch, as `{switch}/E1/{k}`
    ///
    /// k runs 1..=48 one by one, then 52, 56, .. 76 (breakout groups),
    /// then the switch is out of ports.
    pub fn next_switch_port(&mut self, switch: &str) -> Result<String> {
        let last = self.switch_last.entry(switch.to_string()).or_insert(0);
        let next = if *last < 48 { *last + 1 } else { *last + 4 };
        if next > 76 {
            return Err(ErrorKind::PortsExhausted(switch.to_string()).into());
        }
        *last = next;
        Ok(format!("{}/E1/{}", switch, next))
    }

    /// Next NIC on a server, as `{server}/enp2s{k}`
    pub fn next_server_port(&mut self, server: &str) -> String {
        let last = self.server_last.entry(server.to_string()).or_insert(0);
        *last += 1;
        format!("{}/enp2s{}", server, last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn switch_port_sequence() {
        let mut pa = PortAllocator::new();
        let mut seen = std::collections::BTreeSet::new();
        // 1..=48 one by one
        for k in 1..=48 {
            let p = pa.next_switch_port("leaf-01").unwrap();
            assert_eq!(p, format!("leaf-01/E1/{}", k));
            assert!(seen.insert(p));
        }
        // then fours until 76
        for k in &[52, 56, 60, 64, 68, 72, 76] {
            let p = pa.next_switch_port("leaf-01").unwrap();
            assert_eq!(p, format!("leaf-01/E1/{}", k));
            assert!(seen.insert(p));
        }
        // and then nothing
        assert!(pa.next_switch_port("leaf-01").is_err());
        // other switches unaffected
        assert_eq!(pa.next_switch_port("leaf-02").unwrap(), "leaf-02/E1/1");
    }

    #[test]
    fn server_port_sequence() {
        let mut pa = PortAllocator::new();
        assert_eq!(pa.next_server_port("server-01"), "server-01/enp2s1");
        assert_eq!(pa.next_server_port("server-01"), "server-01/enp2s2");
        assert_eq!(pa.next_server_port("server-02"), "server-02/enp2s1");
    }

    #[test]
    fn stable_identifiers() {
        assert_eq!(ssh_port(0), 22000);
        assert_eq!(ssh_port(7), 22007);
        assert_eq!(vm_uuid(3), format!("{}000000000003", VM_UUID_PREFIX));
        assert_eq!(switch_mac(16), "0c:20:12:fe:10:00");
    }
}
