use std::fs::{self, File};
use std::io::Write;

use flate2::write::GzEncoder;
use flate2::Compression;

use hhfab_definitions::{FabConfig, Vm, VmType, VlabPlan, Wiring};

use crate::vm::ignition;
use crate::workspace::{VmDirs, Workspace};
use crate::Result;

/// Install recipe dropped into every node archive
///
/// The body is the collaborator contract: `./recipe install` runs the
/// fabric installer and leaves the marker; `./recipe upgrade` the same in
/// upgrade mode.
const RECIPE: &str = r#"#!/usr/bin/env bash
set -euo pipefail
verb="${1:-install}"
exec /opt/hhfab-install/run "$verb"
"#;

/// Write the hydrated wiring into include/wiring.yaml
pub fn write_wiring(ws: &Workspace, wiring: &Wiring) -> Result<()> {
    fs::create_dir_all(ws.include_dir())?;
    let path = ws.include_dir().join("wiring.yaml");
    fs::write(&path, wiring.to_yaml()?)?;
    info!("Wrote wiring to {}", path.display());
    Ok(())
}

fn node_type(vm: &Vm) -> Option<&'static str> {
    match vm.kind {
        VmType::Control => Some("control"),
        VmType::Gateway => Some("gateway"),
        _ => None,
    }
}

/// Produce the per-node install archives and ignition bundles
///
/// `result/{nodeType}--{name}--install.tgz` with the recipe and the node's
/// fab config, plus `result/{name}--install.ign` for image builds.
pub fn build_artifacts(ws: &Workspace, cfg: &FabConfig, plan: &VlabPlan, pubkey: &str) -> Result<()> {
    fs::create_dir_all(ws.result_dir())?;

    for vm in &plan.vms {
        let nt = match node_type(vm) {
            Some(nt) => nt,
            None => continue,
        };

        // the archive: recipe + fab config the installer consumes
        let path = ws.install_archive(nt, &vm.name);
        let f = File::create(&path)?;
        let enc = GzEncoder::new(f, Compression::default());
        let mut tarball = tar::Builder::new(enc);

        append_file(&mut tarball, "recipe", RECIPE.as_bytes(), 0o755)?;
        let fabconf = serde_yaml::to_string(cfg)?;
        append_file(&mut tarball, "fab.yaml", fabconf.as_bytes(), 0o644)?;
        tarball.into_inner()?.finish()?;
        info!("Wrote {}", path.display());

        // the node ignition bundle, reused by fw_cfg in manual builds
        let dirs = VmDirs::new(ws, &vm.name);
        fs::create_dir_all(dirs.dir())?;
        ignition::write(vm, &dirs, pubkey, None)?;
        fs::copy(dirs.ignition(), ws.install_ignition(&vm.name))?;
    }
    Ok(())
}

fn append_file<W: Write>(tarball: &mut tar::Builder<W>, name: &str, data: &[u8], mode: u32) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(data.len() as u64);
    header.set_mode(mode);
    header.set_cksum();
    tarball.append(&header, data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use hhfab_definitions::builder::{build, BuildOpts};
    use hhfab_definitions::vlab::plan;

    #[test]
    fn archives_written_for_nodes_only() {
        let root = std::env::temp_dir().join(format!("hhfab-gen-test-{}", uuid::Uuid::new_v4()));
        let ws = Workspace::new(&root);
        let cfg = FabConfig::default();
        let w = build(&cfg, &BuildOpts::default()).unwrap();
        let p = plan(&w, &[], "key").unwrap();

        build_artifacts(&ws, &cfg, &p, "ssh-ed25519 AAAA").unwrap();

        let control = ws.install_archive("control", "control-01");
        assert!(control.is_file());
        // servers get no archive
        assert!(!ws.install_archive("server", "server-01").exists());
        // and the ignition bundle exists
        assert!(ws.install_ignition("control-01").is_file());

        // the archive round-trips with the recipe inside
        let f = File::open(control).unwrap();
        let mut ar = tar::Archive::new(GzDecoder::new(f));
        let names: Vec<String> = ar
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        assert!(names.contains(&"recipe".to_string()));
        assert!(names.contains(&"fab.yaml".to_string()));
        let _ = fs::remove_dir_all(root);
    }
}
