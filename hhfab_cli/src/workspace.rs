use std::fs;
use std::path::{Path, PathBuf};

use crate::Result;

/// The work directory layout everything else navigates by
///
/// ```text
/// fab.yaml             fabricator configuration
/// .registry.yaml       artifact registry coordinates
/// include/*.yaml       wiring fragments
/// result/              generated install artifacts
/// vlab/                runtime state (kubeconfig, vms/{name}/...)
/// show-tech-output/    diagnostics collected on failure
/// ```
#[derive(Clone, Debug)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: &Path) -> Workspace {
        Workspace { root: root.to_path_buf() }
    }

    pub fn current() -> Workspace {
        Workspace::new(Path::new("."))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn include_dir(&self) -> PathBuf {
        self.root.join("include")
    }

    pub fn result_dir(&self) -> PathBuf {
        self.root.join("result")
    }

    pub fn vlab_dir(&self) -> PathBuf {
        self.root.join("vlab")
    }

    pub fn kubeconfig(&self) -> PathBuf {
        self.vlab_dir().join("kubeconfig")
    }

    pub fn vms_dir(&self) -> PathBuf {
        self.vlab_dir().join("vms")
    }

    pub fn vm_dir(&self, name: &str) -> PathBuf {
        self.vms_dir().join(name)
    }

    pub fn showtech_dir(&self) -> PathBuf {
        self.root.join("show-tech-output")
    }

    /// Install archive for a node, `{nodeType}--{name}--install.tgz`
    pub fn install_archive(&self, node_type: &str, name: &str) -> PathBuf {
        self.result_dir().join(format!("{}--{}--install.tgz", node_type, name))
    }

    /// Pre-built install media for a node
    pub fn install_usb(&self, name: &str) -> PathBuf {
        self.result_dir().join(format!("{}--install-usb.img", name))
    }

    pub fn install_iso(&self, name: &str) -> PathBuf {
        self.result_dir().join(format!("{}--install.iso", name))
    }

    pub fn install_ignition(&self, name: &str) -> PathBuf {
        self.result_dir().join(format!("{}--install.ign", name))
    }

    /// Create the runtime directories a run needs
    pub fn prepare(&self) -> Result<()> {
        fs::create_dir_all(self.vms_dir())?;
        fs::create_dir_all(self.result_dir())?;
        fs::create_dir_all(self.showtech_dir())?;
        Ok(())
    }
}

/// Paths inside one VM's directory
#[derive(Clone, Debug)]
pub struct VmDirs {
    dir: PathBuf,
}

impl VmDirs {
    pub fn new(ws: &Workspace, vm: &str) -> VmDirs {
        VmDirs { dir: ws.vm_dir(vm) }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn os_img(&self) -> PathBuf {
        self.dir.join("os.img")
    }

    pub fn efi_code(&self) -> PathBuf {
        self.dir.join("efi_code.fd")
    }

    pub fn efi_vars(&self) -> PathBuf {
        self.dir.join("efi_vars.fd")
    }

    pub fn usb_img(&self) -> PathBuf {
        self.dir.join("usb.img")
    }

    pub fn usb_iso(&self) -> PathBuf {
        self.dir.join("usb.iso")
    }

    pub fn serial_log(&self) -> PathBuf {
        self.dir.join("serial.log")
    }

    pub fn serial_sock(&self) -> PathBuf {
        self.dir.join("serial.sock")
    }

    pub fn monitor_sock(&self) -> PathBuf {
        self.dir.join("mon.sock")
    }

    pub fn qmp_sock(&self) -> PathBuf {
        self.dir.join("qmp.sock")
    }

    pub fn butane(&self) -> PathBuf {
        self.dir.join("butane.yaml")
    }

    pub fn ignition(&self) -> PathBuf {
        self.dir.join("ignition.json")
    }

    /// True when the images from a prior run can be reused
    pub fn has_images(&self) -> bool {
        self.os_img().is_file() && self.efi_code().is_file() && self.efi_vars().is_file()
    }
}
