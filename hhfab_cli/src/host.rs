use std::fs;
use std::io::ErrorKind as IoKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::TryStreamExt;
use rtnetlink::packet::rtnl::link::nlas::Nla;
use tokio::process::Command;

use hhfab_definitions::ports::VM_UUID_PREFIX;

use crate::{ErrorKind, Result, ResultExt};

/// The one management bridge a vlab host carries
pub const BRIDGE_NAME: &str = "hhvlab";
/// Prefix of every pooled TAP, suffixed with its index
pub const TAP_PREFIX: &str = "hhtap";
/// Driver PCI devices are handed to for passthrough
pub const PASSTHROUGH_DRIVER: &str = "vfio-pci";
/// Hypervisor binary stale detection matches on
pub const HYPERVISOR: &str = "qemu-system-x86_64";

// ---------------------------------------------------------------------------
// bridge + tap pool

async fn find_link(handle: &rtnetlink::Handle, name: &str) -> Result<Option<u32>> {
    let mut links = handle.link().get().execute();
    while let Some(msg) = links.try_next().await? {
        for nla in &msg.nlas {
            if let Nla::IfName(n) = nla {
                if n == name {
                    return Ok(Some(msg.header.index));
                }
            }
        }
    }
    Ok(None)
}

/// All pooled taps present on the host, as (index-in-pool, link index)
async fn find_taps(handle: &rtnetlink::Handle) -> Result<Vec<(usize, u32)>> {
    use regex::Regex;
    let re = Regex::new(&format!(r"^{}(\d+)$", TAP_PREFIX)).unwrap();
    let mut out = vec![];
    let mut links = handle.link().get().execute();
    while let Some(msg) = links.try_next().await? {
        for nla in &msg.nlas {
            if let Nla::IfName(n) = nla {
                if let Some(caps) = re.captures(n) {
                    out.push((caps[1].parse::<usize>()?, msg.header.index));
                }
            }
        }
    }
    out.sort();
    Ok(out)
}

/// Create a persistent TAP device via /dev/net/tun
///
/// rtnetlink cannot create tuntap links, so this is the one raw ioctl in
/// the provisioner.
fn create_tap(name: &str) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
    const TUNSETPERSIST: libc::c_ulong = 0x4004_54cb;
    const IFF_TAP: libc::c_short = 0x0002;
    const IFF_NO_PI: libc::c_short = 0x1000;

    #[repr(C)]
    struct IfReq {
        name: [u8; libc::IFNAMSIZ],
        flags: libc::c_short,
        pad: [u8; 22],
    }

    if name.len() >= libc::IFNAMSIZ {
        bail!("tap name {} is too long", name);
    }
    let f = fs::OpenOptions::new().read(true).write(true).open("/dev/net/tun")?;
    let mut req = IfReq { name: [0; libc::IFNAMSIZ], flags: IFF_TAP | IFF_NO_PI, pad: [0; 22] };
    req.name[..name.len()].copy_from_slice(name.as_bytes());

    // SAFETY: req outlives both ioctls and matches the kernel ABI
    unsafe {
        if libc::ioctl(f.as_raw_fd(), TUNSETIFF, &mut req) < 0 {
            return Err(std::io::Error::last_os_error()).chain_err(|| ErrorKind::HostProvisioning(format!("tap create {}", name)));
        }
        if libc::ioctl(f.as_raw_fd(), TUNSETPERSIST, 1) < 0 {
            return Err(std::io::Error::last_os_error()).chain_err(|| ErrorKind::HostProvisioning(format!("tap persist {}", name)));
        }
    }
    Ok(())
}

/// Reconcile the bridge and its TAP pool to hold exactly `count` taps
///
/// Idempotent: a second run with the same count changes nothing. A count
/// of zero tears the whole pool and the bridge down.
pub async fn prepare_taps(count: usize) -> Result<()> {
    let (conn, handle, _) = rtnetlink::new_connection()?;
    tokio::spawn(conn);

    let bridge = find_link(&handle, BRIDGE_NAME).await?;

    if count == 0 {
        for (idx, link) in find_taps(&handle).await? {
            debug!("Deleting tap {}{}", TAP_PREFIX, idx);
            handle.link().del(link).execute().await?;
        }
        if let Some(idx) = bridge {
            info!("Deleting bridge {}", BRIDGE_NAME);
            handle.link().del(idx).execute().await?;
        }
        return Ok(());
    }

    let bridge = match bridge {
        Some(idx) => idx,
        None => {
            info!("Creating bridge {}", BRIDGE_NAME);
            handle.link().add().bridge(BRIDGE_NAME.to_string()).execute().await?;
            find_link(&handle, BRIDGE_NAME)
                .await?
                .ok_or_else(|| ErrorKind::HostProvisioning("bridge create".into()))?
        }
    };
    handle.link().set(bridge).up().execute().await?;

    // prune anything beyond the pool size
    for (idx, link) in find_taps(&handle).await? {
        if idx >= count {
            debug!("Deleting excess tap {}{}", TAP_PREFIX, idx);
            handle.link().del(link).execute().await?;
        }
    }

    for idx in 0..count {
        let name = format!("{}{}", TAP_PREFIX, idx);
        if find_link(&handle, &name).await?.is_none() {
            debug!("Creating tap {}", name);
            create_tap(&name)?;
        }
        let link = find_link(&handle, &name)
            .await?
            .ok_or_else(|| ErrorKind::HostProvisioning(format!("tap {} lookup", name)))?;
        // down, enslave, then up so the bridge picks it up cleanly
        handle.link().set(link).down().execute().await?;
        handle.link().set(link).master(bridge).execute().await?;
        handle.link().set(link).up().execute().await?;
    }
    info!("Bridge {} holds {} taps", BRIDGE_NAME, count);
    Ok(())
}

// ---------------------------------------------------------------------------
// pci passthrough

fn sysfs_device(bdf: &str) -> PathBuf {
    Path::new("/sys/bus/pci/devices").join(bdf)
}

fn sysfs_driver() -> PathBuf {
    Path::new("/sys/bus/pci/drivers").join(PASSTHROUGH_DRIVER)
}

fn read_id(bdf: &str, what: &str) -> Result<String> {
    let raw = fs::read_to_string(sysfs_device(bdf).join(what))?;
    Ok(raw.trim().trim_start_matches("0x").to_string())
}

fn bind_once(bdf: &str) -> Result<()> {
    let dev = sysfs_device(bdf);
    if !dev.exists() {
        bail!("pci device {} does not exist", bdf);
    }

    // unbind whatever driver holds it, unless it is already ours
    let driver = dev.join("driver");
    if let Ok(target) = fs::read_link(&driver) {
        if target.file_name().map(|f| f == PASSTHROUGH_DRIVER).unwrap_or(false) {
            return Ok(());
        }
        debug!("Unbinding {} from {:?}", bdf, target.file_name().unwrap_or_default());
        fs::write(driver.join("unbind"), bdf)?;
    }

    let vendor = read_id(bdf, "vendor")?;
    let device = read_id(bdf, "device")?;
    // new_id rejects ids it already knows; that is fine
    if let Err(e) = fs::write(sysfs_driver().join("new_id"), format!("{} {}", vendor, device)) {
        if e.kind() != IoKind::AlreadyExists {
            debug!("new_id for {} {}: {}", vendor, device, e);
        }
    }
    if let Err(e) = fs::write(sysfs_driver().join("bind"), bdf) {
        debug!("bind for {}: {}", bdf, e);
    }

    if !sysfs_driver().join(bdf).exists() {
        bail!("{} not yet under {}", bdf, PASSTHROUGH_DRIVER);
    }
    Ok(())
}

/// Bind each device to the passthrough driver
///
/// Loads the driver module if needed and retries each device up to 6 times
/// with 500ms pauses; final success is the sysfs entry existing under the
/// driver.
pub async fn bind_devices(devices: &[String]) -> Result<()> {
    if devices.is_empty() {
        return Ok(());
    }
    if !sysfs_driver().exists() {
        info!("Loading {} module", PASSTHROUGH_DRIVER);
        let s = Command::new("modprobe").arg(PASSTHROUGH_DRIVER).status().await?;
        if !s.success() {
            bail!("modprobe {} failed: {}", PASSTHROUGH_DRIVER, s.code().unwrap_or(1001));
        }
    }

    for bdf in devices {
        let mut last = None;
        let mut bound = false;
        for attempt in 1..=6 {
            match bind_once(bdf) {
                Ok(()) => {
                    debug!("{} bound to {} (attempt {})", bdf, PASSTHROUGH_DRIVER, attempt);
                    bound = true;
                    break;
                }
                Err(e) => {
                    trace!("bind attempt {} for {}: {}", attempt, bdf, e);
                    last = Some(e);
                    tokio::time::delay_for(Duration::from_millis(500)).await;
                }
            }
        }
        if !bound {
            let e = last.unwrap_or_else(|| ErrorKind::HostProvisioning(format!("bind {}", bdf)).into());
            return Err(e).chain_err(|| ErrorKind::HostProvisioning(format!("passthrough bind {}", bdf)));
        }
        info!("{} bound to {}", bdf, PASSTHROUGH_DRIVER);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// stale vms

/// A leftover QEMU process from a prior run
#[derive(Debug, Clone, PartialEq)]
pub struct StaleVm {
    pub pid: i32,
    pub name: String,
    pub uuid: String,
}

/// Match one process argv against the vlab launch template
///
/// The launcher always produces `{hypervisor} -name <name> -uuid <uuid>..`
/// and every vlab uuid starts with the project marker, so this is both
/// necessary and sufficient.
pub fn match_stale(pid: i32, argv: &[String]) -> Option<StaleVm> {
    if argv.len() < 5 {
        return None;
    }
    let exe = argv[0].rsplit('/').next().unwrap_or(&argv[0]);
    if exe != HYPERVISOR || argv[1] != "-name" || argv[3] != "-uuid" {
        return None;
    }
    if !argv[4].starts_with(VM_UUID_PREFIX) {
        return None;
    }
    Some(StaleVm { pid, name: argv[2].clone(), uuid: argv[4].clone() })
}

/// All stale vlab VMs currently running
pub fn find_stale_vms() -> Result<Vec<StaleVm>> {
    let mut out = vec![];
    for p in procfs::process::all_processes()? {
        let argv = match p.cmdline() {
            Ok(a) => a,
            Err(_) => continue, // raced with exit or not ours to read
        };
        if let Some(sv) = match_stale(p.pid, &argv) {
            out.push(sv);
        }
    }
    Ok(out)
}

/// SIGKILL every stale vlab VM, returning what was killed
pub fn kill_stale_vms() -> Result<Vec<StaleVm>> {
    let stale = find_stale_vms()?;
    for vm in &stale {
        warn!("Killing stale VM {} (pid {})", vm.name, vm.pid);
        // SAFETY: plain kill(2) on a pid we just enumerated
        unsafe {
            libc::kill(vm.pid, libc::SIGKILL);
        }
    }
    Ok(stale)
}

// ---------------------------------------------------------------------------
// privileged helper re-entry

/// Re-invoke our own binary as root for one helper verb
///
/// The helper verbs are the IPC boundary: `prepare-taps`, `bind-devices`
/// and `kill-stale-vms` map one to one onto the operations above.
pub async fn privileged(own_bin: &Path, verb: &str, args: &[String]) -> Result<()> {
    debug!("sudo {} {} {}", own_bin.display(), verb, args.join(" "));
    let s = Command::new("sudo")
        .arg(own_bin)
        .arg(verb)
        .args(args)
        .status()
        .await?;
    if !s.success() {
        return Err(ErrorKind::HostProvisioning(format!("{} (exit {})", verb, s.code().unwrap_or(1001))).into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn stale_template_match() {
        let uuid = format!("{}000000000004", VM_UUID_PREFIX);
        let a = argv(&["/usr/bin/qemu-system-x86_64", "-name", "leaf-01", "-uuid", &uuid, "-m", "5120"]);
        let m = match_stale(42, &a).unwrap();
        assert_eq!(m.name, "leaf-01");
        assert_eq!(m.pid, 42);

        // wrong uuid prefix is somebody else's VM
        let a = argv(&["qemu-system-x86_64", "-name", "leaf-01", "-uuid", "11111111-2222-3333-4444-000000000004"]);
        assert!(match_stale(1, &a).is_none());

        // wrong hypervisor
        let a = argv(&["qemu-system-aarch64", "-name", "leaf-01", "-uuid", &uuid]);
        assert!(match_stale(1, &a).is_none());

        // argv not shaped like the launch template
        let a = argv(&["qemu-system-x86_64", "-m", "512", "-uuid", &uuid]);
        assert!(match_stale(1, &a).is_none());
        assert!(match_stale(1, &argv(&["qemu-system-x86_64"])).is_none());
    }
}
