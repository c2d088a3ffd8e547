use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use hhfab_definitions::{VlabPlan, VmType, Wiring};

use crate::ssh;
use crate::workspace::Workspace;
use crate::Result;

/// Command run on nodes and servers to produce the diagnostic bundle
///
/// The script body is an opaque asset installed with the node; the core
/// only relies on it printing the bundle to stdout.
const NODE_SHOW_TECH: &str = "sudo /opt/bin/show-tech 2>&1 || true";
/// Switch equivalent, via the NOS cli
const SWITCH_SHOW_TECH: &str = "show-tech 2>&1 || true";

async fn collect_one(
    target: ssh::SshTarget,
    cmd: &'static str,
    key: &Path,
    out: &Path,
) -> Result<()> {
    let text = target.exec_via_client(key, cmd).await?;
    fs::write(out, text)?;
    Ok(())
}

/// Collect show-tech from every entity, best effort
///
/// Runs on every failure path and must never itself be fatal; returns how
/// many bundles landed.
pub async fn collect_all(ws: &Workspace, plan: &VlabPlan, wiring: &Wiring, key: &Path) -> usize {
    let dir = ws.showtech_dir();
    if let Err(e) = fs::create_dir_all(&dir) {
        warn!("cannot create {}: {}", dir.display(), e);
        return 0;
    }

    let collected = Arc::new(Mutex::new(0usize));
    let mut tasks = vec![];

    let mut entities: Vec<(String, &'static str)> = vec![];
    for vm in &plan.vms {
        match vm.kind {
            VmType::Switch => {} // reached through the wiring below
            _ => entities.push((vm.name.clone(), NODE_SHOW_TECH)),
        }
    }
    for sw in &wiring.switches {
        entities.push((sw.name.clone(), SWITCH_SHOW_TECH));
    }

    for (name, cmd) in entities {
        let target = match ssh::target_for(plan, wiring, &name) {
            Ok(t) => t,
            Err(e) => {
                debug!("no ssh route to {} for show-tech: {}", name, e);
                continue;
            }
        };
        let out = dir.join(format!("{}-show-tech.log", name));
        let key = key.to_path_buf();
        let collected = collected.clone();
        tasks.push(async move {
            match collect_one(target, cmd, &key, &out).await {
                Ok(()) => {
                    *collected.lock().expect("show-tech counter") += 1;
                }
                Err(e) => warn!("show-tech from {} failed: {}", name, e),
            }
        });
    }

    futures::future::join_all(tasks).await;
    let n = *collected.lock().expect("show-tech counter");
    info!("Collected {} show-tech bundles into {}", n, dir.display());
    n
}
