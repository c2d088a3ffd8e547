use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_timer::Delay;

use hhfab_definitions::{BuildMode, FabConfig, Vm, VmType};

use crate::artifacts::Cache;
use crate::kubectl;
use crate::ssh::Session;
use crate::workspace::Workspace;
use crate::{ErrorKind, Result};

/// Fixed path of the install marker on control/gateway nodes
pub const INSTALL_MARKER: &str = "/opt/hhfab-install/marker";
/// The only marker value that means the node finished installing
pub const MARKER_COMPLETE: &str = "complete";

/// Namespace the fabricator control plane lives in
const FAB_NS: &str = "fab";

/// Network helper every server VM gets; the guest-side contract for vpc
/// address queries and the static-external re-wiring
const HHNET: &str = include_str!("../../assets/hhnet");

const INSTALL_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const NODE_SSH_WAIT: Duration = Duration::from_secs(40 * 60);
const SERVER_SSH_WAIT: Duration = Duration::from_secs(10 * 60);

/// What the install marker tells us to do
#[derive(Debug, Clone, PartialEq)]
pub enum MarkerAction {
    /// No marker: this node has never installed, run it
    Install,
    /// Marker says complete: accept as installed
    AlreadyInstalled,
}

/// The install-marker gate
///
/// A marker that exists but is not the complete sentinel means a prior
/// attempt died mid-install; the node state is unknown and retrying
/// blindly would make it worse, so that fails immediately.
pub fn marker_gate(node: &str, marker: Option<&str>) -> Result<MarkerAction> {
    match marker {
        None => Ok(MarkerAction::Install),
        Some(m) if m.trim() == MARKER_COMPLETE => Ok(MarkerAction::AlreadyInstalled),
        Some(m) => Err(ErrorKind::MarkerDirty(node.into(), m.trim().into()).into()),
    }
}

/// Rewrite the api server address in a downloaded kubeconfig to the
/// forwarded loopback port
pub fn rewrite_kubeconfig(raw: &str, api_port: u16) -> String {
    use regex::Regex;
    let re = Regex::new(r"server: https://\S+").unwrap();
    re.replace_all(raw, format!("server: https://127.0.0.1:{}", api_port).as_str())
        .to_string()
}

/// Shared context for all post-processing tasks
pub struct PostCtx {
    pub ws: Workspace,
    pub cfg: FabConfig,
    pub cache: Arc<Cache>,
    pub key: PathBuf,
    pub auto_upgrade: bool,
    pub cancel: Arc<AtomicBool>,
}

fn connect(vm: &Vm, key: &Path, deadline: Duration, cancel: &AtomicBool) -> Result<Session> {
    let sess = Session::wait_connect(&vm.name, vm.ssh_port(), "core", key, deadline, cancel)?;
    // guard against ssh port mixups before touching anything
    let hostname = sess.exec_ok("hostname")?;
    if hostname.trim() != vm.name {
        bail!("expected {} on port {}, found '{}'", vm.name, vm.ssh_port(), hostname.trim());
    }
    Ok(sess)
}

fn server_post(sess: &Session, tools: &Path) -> Result<()> {
    sess.upload_bytes(HHNET.as_bytes(), "/tmp/hhnet", 0o755)?;
    sess.exec_ok("sudo mkdir -p /opt/bin && sudo mv /tmp/hhnet /opt/bin/hhnet && sudo chmod 755 /opt/bin/hhnet")?;

    // toolbox container image goes into both runtimes present on the guest
    let image = tools.join("toolbox.tar");
    if image.is_file() {
        sess.upload(&image, "/tmp/toolbox.tar", 0o644)?;
        sess.exec_ok("sudo ctr image import /tmp/toolbox.tar")?;
        sess.exec_ok("sudo docker load -i /tmp/toolbox.tar")?;
        sess.exec_ok("rm -f /tmp/toolbox.tar")?;
    } else {
        debug!("no toolbox image in the tools artifact, skipping import");
    }
    Ok(())
}

fn poll_marker(sess: &Session, node: &str, cancel: &AtomicBool) -> Result<()> {
    info!("Waiting for {} to finish installing", node);
    loop {
        if cancel.load(Ordering::Relaxed) {
            bail!("cancelled while waiting for install on {}", node);
        }
        if let Some(m) = sess.read_file(INSTALL_MARKER)? {
            if m.trim() == MARKER_COMPLETE {
                return Ok(());
            }
            trace!("{} marker: {}", node, m.trim());
        }
        std::thread::sleep(Duration::from_secs(5));
    }
}

/// The node install coordinator
///
/// absent -> uploaded -> extracted -> installed, gated by the marker. One
/// shot; the serial-console reinstall path owns retries.
fn install_node(
    sess: &Session,
    archive: &Path,
    node: &str,
    upgrade: bool,
    cancel: &AtomicBool,
) -> Result<()> {
    match marker_gate(node, sess.read_file(INSTALL_MARKER)?.as_deref())? {
        MarkerAction::AlreadyInstalled => {
            debug!("{} already installed", node);
            return Ok(());
        }
        MarkerAction::Install => {}
    }
    if cancel.load(Ordering::Relaxed) {
        bail!("cancelled before install on {}", node);
    }

    info!("Uploading install archive to {}", node);
    sess.upload(archive, "/tmp/install.tgz", 0o644)?;
    sess.exec_ok("mkdir -p /tmp/install && tar xzf /tmp/install.tgz -C /tmp/install")?;

    let verb = if upgrade { "upgrade" } else { "install" };
    info!("Running {} on {}", verb, node);
    let node_tag = node.to_string();
    let code = sess.exec_stream(&format!("cd /tmp/install && sudo ./recipe {}", verb), |line| {
        debug!("{} {}: {}", node_tag, verb, line);
    })?;
    if code != 0 {
        return Err(ErrorKind::InstallFailed(node.into()).into());
    }

    match sess.read_file(INSTALL_MARKER)?.as_deref().map(str::trim) {
        Some(MARKER_COMPLETE) => Ok(()),
        other => bail!("{} finished {} but marker reads {:?}", node, verb, other),
    }
}

fn control_post(sess: &Session, ctx: &PostCtx, vm: &Vm) -> Result<()> {
    info!("Fetching kubeconfig from {}", vm.name);
    let raw = sess.exec_ok("sudo cat /etc/kubernetes/admin.conf")?;
    let api_port = hhfab_definitions::ports::api_port(vm.id);
    std::fs::write(ctx.ws.kubeconfig(), rewrite_kubeconfig(&raw, api_port))?;
    Ok(())
}

async fn wait_fabricator(ctx: &PostCtx, node: &str) -> Result<()> {
    info!("Waiting for the Fabricator resource via {}", node);
    loop {
        if ctx.cancel.load(Ordering::Relaxed) {
            bail!("cancelled while waiting for the Fabricator resource");
        }
        match kubectl::resource_exists(&ctx.ws.kubeconfig(), FAB_NS, "fabricators", "fabricator").await {
            Ok(true) => return Ok(()),
            Ok(false) => trace!("no Fabricator resource yet"),
            Err(e) => trace!("fabricator poll: {}", e),
        }
        Delay::new(Duration::from_secs(15)).await;
    }
}

/// Post-process one VM after QEMU is up
///
/// Runs in parallel with the QEMU wait; everything blocking happens on the
/// blocking pool so the supervisor loop stays responsive.
pub async fn run(ctx: Arc<PostCtx>, vm: Vm) -> Result<()> {
    // switches install through the fabric control plane, not over ssh
    if vm.kind == VmType::Switch {
        return Ok(());
    }

    let deadline = match vm.kind {
        VmType::Control | VmType::Gateway => NODE_SSH_WAIT,
        _ => SERVER_SSH_WAIT,
    };

    let is_node = vm.kind == VmType::Control || vm.kind == VmType::Gateway;
    let image_build = ctx.cfg.buildMode != BuildMode::Manual;
    let node_type = match vm.kind {
        VmType::Control => "control",
        VmType::Gateway => "gateway",
        _ => "server",
    };
    let archive = ctx.ws.install_archive(node_type, &vm.name);

    // tools artifact for server imports, resolved before going blocking
    let tools_dir = if vm.kind == VmType::Server || vm.kind == VmType::External {
        Some(
            ctx.cache
                .with_artifact("vlab-tools", &ctx.cfg.artifacts.tools, |d| Ok(d.to_path_buf()))
                .await?,
        )
    } else {
        None
    };

    let c = ctx.clone();
    let vm2 = vm.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let sess = connect(&vm2, &c.key, deadline, &c.cancel)?;
        match vm2.kind {
            VmType::Server | VmType::External => {
                server_post(&sess, tools_dir.as_ref().expect("tools resolved for servers"))
            }
            VmType::Control | VmType::Gateway => {
                if c.cfg.buildMode == BuildMode::Manual || c.auto_upgrade {
                    install_node(&sess, &archive, &vm2.name, c.auto_upgrade, &c.cancel)
                } else {
                    // image-based install runs on its own; watch the marker
                    poll_marker(&sess, &vm2.name, &c.cancel)
                }
            }
            VmType::Switch => unreachable!("switches return early"),
        }
    })
    .await??;

    if is_node && image_build {
        // the marker was either polled or verified above; nothing more
        trace!("{} image install verified", vm.name);
    }

    if vm.kind == VmType::Control {
        let c = ctx.clone();
        let vm2 = vm.clone();
        let key = ctx.key.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let sess = connect(&vm2, &key, Duration::from_secs(60), &c.cancel)?;
            control_post(&sess, &c, &vm2)
        })
        .await??;

        wait_fabricator(&ctx, &vm.name).await?;

        // best effort support dump for later debugging
        let c = ctx.clone();
        let vm2 = vm.clone();
        let _ = tokio::task::spawn_blocking(move || -> Result<()> {
            let sess = connect(&vm2, &c.key, Duration::from_secs(60), &c.cancel)?;
            sess.exec_ok("sudo /opt/bin/support-dump || true")?;
            Ok(())
        })
        .await?;
    }

    info!("Post-processing of {} done", vm.name);
    Ok(())
}

/// Hard wall-clock guard around an install-capable post-process
pub async fn run_with_timeout(ctx: Arc<PostCtx>, vm: Vm) -> Result<()> {
    let name = vm.name.clone();
    match tokio::time::timeout(NODE_SSH_WAIT + INSTALL_TIMEOUT, run(ctx, vm)).await {
        Ok(res) => res,
        Err(_) => Err(ErrorKind::VmRuntime(format!("{} post-processing timed out", name)).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_gate_states() {
        // absent: install
        assert_eq!(marker_gate("control-01", None).unwrap(), MarkerAction::Install);
        // complete: accept
        assert_eq!(
            marker_gate("control-01", Some("complete\n")).unwrap(),
            MarkerAction::AlreadyInstalled
        );
        // anything else: fail without retry
        let err = marker_gate("control-01", Some("installing fabric")).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("control-01"));
        assert!(msg.contains("installing fabric"));
    }

    #[test]
    fn kubeconfig_rewritten_to_forwarded_port() {
        let raw = "clusters:\n- cluster:\n    server: https://172.30.1.6:6443\n  name: fab\n";
        let out = rewrite_kubeconfig(raw, 6443);
        assert!(out.contains("server: https://127.0.0.1:6443"));
        assert!(!out.contains("172.30.1.6"));
    }
}
