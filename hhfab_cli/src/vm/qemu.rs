use std::fs::File;
use std::io::Read;
use std::path::Path;

use hhfab_definitions::{BuildMode, Nic, Vm, VmType};

use crate::host::TAP_PREFIX;
use crate::workspace::VmDirs;
use crate::Result;

/// qcow2 files start with `QFI\xfb`
const QCOW2_MAGIC: [u8; 4] = [0x51, 0x46, 0x49, 0xfb];

/// fw_cfg name the guest reads its install ignition from
const FW_CFG_IGNITION: &str = "opt/org.flatcar-linux/config";

/// Detect the pflash drive format from the file's magic bytes
pub fn pflash_format(path: &Path) -> Result<&'static str> {
    let mut magic = [0u8; 4];
    let mut f = File::open(path)?;
    // short firmware files are raw by definition
    let n = f.read(&mut magic)?;
    Ok(if n == 4 && magic == QCOW2_MAGIC { "qcow2" } else { "raw" })
}

fn is_node(vm: &Vm) -> bool {
    vm.kind == VmType::Control || vm.kind == VmType::Gateway
}

/// The deterministic QEMU argument list for one VM
///
/// Everything here is position-stable given the same VM and build mode so
/// stale detection and re-runs can rely on the argv shape. `-name` and
/// `-uuid` lead because stale detection matches on them.
pub fn args(vm: &Vm, dirs: &VmDirs, build_mode: &BuildMode, pci_bridges: u32) -> Result<Vec<String>> {
    let mut a: Vec<String> = vec![
        "-name".into(),
        vm.name.clone(),
        "-uuid".into(),
        vm.uuid(),
        "-m".into(),
        format!("{}M", vm.size.ram),
        "-machine".into(),
        "q35,accel=kvm,smm=on".into(),
        "-cpu".into(),
        "host".into(),
        "-smp".into(),
        vm.size.cpu.to_string(),
        "-object".into(),
        "rng-random,filename=/dev/urandom,id=rng0".into(),
        "-device".into(),
        "virtio-rng-pci,rng=rng0".into(),
        "-drive".into(),
        format!("file={},if=virtio", dirs.os_img().display()),
    ];

    // EFI pflash pair, format sniffed per file
    let code_fmt = pflash_format(&dirs.efi_code())?;
    let vars_fmt = pflash_format(&dirs.efi_vars())?;
    a.push("-drive".into());
    a.push(format!("if=pflash,file={},format={},readonly=on", dirs.efi_code().display(), code_fmt));
    a.push("-drive".into());
    a.push(format!("if=pflash,file={},format={}", dirs.efi_vars().display(), vars_fmt));

    a.push("-display".into());
    a.push("none".into());

    // serial over a unix socket with a logfile mirror
    a.push("-chardev".into());
    a.push(format!(
        "socket,id=serial,path={},server,nowait,logfile={}",
        dirs.serial_sock().display(),
        dirs.serial_log().display()
    ));
    a.push("-serial".into());
    a.push("chardev:serial".into());

    a.push("-monitor".into());
    a.push(format!("unix:{},server,nowait", dirs.monitor_sock().display()));
    a.push("-qmp".into());
    a.push(format!("unix:{},server,nowait", dirs.qmp_sock().display()));

    a.push("-global".into());
    a.push("ICH9-LPC.disable_s3=1".into());

    // install media for control/gateway image builds
    if is_node(vm) {
        match build_mode {
            BuildMode::Usb => {
                a.push("-drive".into());
                a.push(format!("file={},if=virtio", dirs.usb_img().display()));
            }
            BuildMode::Iso => {
                a.push("-device".into());
                a.push("virtio-scsi-pci,id=scsi0".into());
                a.push("-drive".into());
                a.push(format!("file={},media=cdrom,if=none,id=cd0", dirs.usb_iso().display()));
                a.push("-device".into());
                a.push("scsi-cd,drive=cd0".into());
            }
            BuildMode::Manual => {
                a.push("-fw_cfg".into());
                a.push(format!("name={},file={}", FW_CFG_IGNITION, dirs.ignition().display()));
            }
        }
    }

    for i in 1..=pci_bridges {
        a.push("-device".into());
        a.push(format!("pci-bridge,chassis_nr={},id=pci.{}", i, i));
    }

    for (n, nic) in vm.nics.iter().enumerate() {
        match nic {
            Nic::UserNet { sshPort, apiPort } => {
                let mut netdev = format!("user,id=eth{},hostfwd=tcp:127.0.0.1:{}-:22", n, sshPort);
                if let Some(api) = apiPort {
                    netdev.push_str(&format!(",hostfwd=tcp:127.0.0.1:{}-:6443", api));
                }
                a.push("-netdev".into());
                a.push(netdev);
                a.push("-device".into());
                a.push(format!("virtio-net-pci,netdev=eth{}", n));
            }
            Nic::TapBridged { tap, mac } => {
                a.push("-netdev".into());
                a.push(format!("tap,id=eth{},ifname={}{},script=no,downscript=no", n, TAP_PREFIX, tap));
                a.push("-device".into());
                a.push(format!("virtio-net-pci,netdev=eth{},mac={}", n, mac));
            }
            Nic::PciPassthrough { bdf } => {
                a.push("-device".into());
                a.push(format!("vfio-pci,host={}", bdf));
            }
        }
    }

    Ok(a)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::Workspace;
    use hhfab_definitions::vlab::VmSize;
    use std::fs;

    fn scratch_vm(kind: VmType) -> (Vm, VmDirs, std::path::PathBuf) {
        let root = std::env::temp_dir().join(format!("hhfab-qemu-test-{}", uuid::Uuid::new_v4()));
        let ws = Workspace::new(&root);
        let vm = Vm {
            name: "control-01".into(),
            kind: kind.clone(),
            id: 0,
            size: VmSize::for_type(&kind),
            nics: vec![
                Nic::UserNet { sshPort: 22000, apiPort: Some(6443) },
                Nic::TapBridged { tap: 0, mac: "0c:20:12:01:00:00".into() },
            ],
        };
        let dirs = VmDirs::new(&ws, &vm.name);
        fs::create_dir_all(dirs.dir()).unwrap();
        // qcow2 code, raw vars
        fs::write(dirs.efi_code(), [0x51, 0x46, 0x49, 0xfb, 0, 0, 0, 1]).unwrap();
        fs::write(dirs.efi_vars(), b"raw firmware variables").unwrap();
        (vm, dirs, root)
    }

    #[test]
    fn magic_detection() {
        let (_, dirs, root) = scratch_vm(VmType::Control);
        assert_eq!(pflash_format(&dirs.efi_code()).unwrap(), "qcow2");
        assert_eq!(pflash_format(&dirs.efi_vars()).unwrap(), "raw");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn argv_is_deterministic_and_leads_with_identity() {
        let (vm, dirs, root) = scratch_vm(VmType::Control);
        let a = args(&vm, &dirs, &BuildMode::Usb, 2).unwrap();
        let b = args(&vm, &dirs, &BuildMode::Usb, 2).unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0], "-name");
        assert_eq!(a[1], "control-01");
        assert_eq!(a[2], "-uuid");
        assert!(a[3].ends_with("000000000000"));
        // both forwards on the usernet
        let netdev = a.iter().find(|s| s.starts_with("user,id=eth0")).unwrap();
        assert!(netdev.contains("hostfwd=tcp:127.0.0.1:22000-:22"));
        assert!(netdev.contains("hostfwd=tcp:127.0.0.1:6443-:6443"));
        // two bridges inserted before nics
        assert!(a.iter().any(|s| s == "pci-bridge,chassis_nr=2,id=pci.2"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn build_mode_media() {
        let (vm, dirs, root) = scratch_vm(VmType::Control);
        let usb = args(&vm, &dirs, &BuildMode::Usb, 0).unwrap();
        assert!(usb.iter().any(|s| s.contains("usb.img")));
        assert!(!usb.iter().any(|s| s.starts_with("name=opt/org.flatcar")));

        let iso = args(&vm, &dirs, &BuildMode::Iso, 0).unwrap();
        assert!(iso.iter().any(|s| s.contains("usb.iso")));
        assert!(iso.iter().any(|s| s == "virtio-scsi-pci,id=scsi0"));

        let manual = args(&vm, &dirs, &BuildMode::Manual, 0).unwrap();
        assert!(manual.iter().any(|s| s.starts_with(&format!("name={}", FW_CFG_IGNITION))));
        assert!(!manual.iter().any(|s| s.contains("usb.img")));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn server_gets_no_install_media() {
        let (mut vm, dirs, root) = scratch_vm(VmType::Server);
        vm.kind = VmType::Server;
        let a = args(&vm, &dirs, &BuildMode::Usb, 0).unwrap();
        assert!(!a.iter().any(|s| s.contains("usb.img")));
        let _ = fs::remove_dir_all(root);
    }
}
