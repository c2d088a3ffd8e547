use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_timer::Delay;
use tokio::process::Command;

use hhfab_definitions::{BuildMode, FabConfig, Vm, VmType, VlabPlan, Wiring};

use crate::artifacts::{ArtifactFile, Cache};
use crate::host;
use crate::onready::{self, OnReadyCmd, OnReadyCtx};
use crate::pdu::PduCreds;
use crate::showtech;
use crate::ssh;
use crate::workspace::{VmDirs, Workspace};
use crate::{kubeapi, Error, ErrorKind, Result, ResultExt};

pub mod ignition;
pub mod postprocess;
pub mod qemu;

/// Artifact families the supervisor materializes images from
const FLATCAR_ARTIFACT: &str = "flatcar-vlab";
const SWITCH_ARTIFACT: &str = "switch-vs";

/// Grace between cancellation and the forced exit
const CANCEL_GRACE: Duration = Duration::from_secs(15);

/// Runtime options for a vlab run
#[derive(Clone, Debug, Default)]
pub struct VlabOpts {
    /// Abort the whole group on the first VM failure
    pub failFast: bool,
    /// Kill leftover VMs from prior runs instead of refusing to start
    pub killStale: bool,
    /// Run the installer in upgrade mode on installed nodes
    pub autoUpgrade: bool,
    /// Ordered post-ready commands; any entry implies fail-fast
    pub onReady: Vec<OnReadyCmd>,
    /// Hard reset mode for switch-reinstall
    pub hardReset: bool,
    /// Pinned server for the static-external scenario
    pub externalServer: Option<String>,
    /// Console-scripting program for switch reinstalls
    pub consoleProgram: Option<PathBuf>,
    /// Running under a CI environment indicator
    pub ci: bool,
    /// Our own binary, for privileged helper re-entry
    pub ownBin: PathBuf,
    /// PDU credentials (from the environment, read by the loader)
    pub pduCreds: Option<PduCreds>,
}

impl VlabOpts {
    fn effective_fail_fast(&self) -> bool {
        self.failFast || !self.onReady.is_empty()
    }
}

/// Materialize one VM's directory: images, firmware, media, ignition
async fn prepare_vm(
    ws: &Workspace,
    cache: &Cache,
    cfg: &FabConfig,
    vm: &Vm,
    pubkey: &str,
) -> Result<()> {
    let dirs = VmDirs::new(ws, &vm.name);
    std::fs::create_dir_all(dirs.dir())?;

    if dirs.has_images() {
        debug!("Reusing images for {}", vm.name);
    } else {
        let is_node = vm.kind == VmType::Control || vm.kind == VmType::Gateway;
        let image_build = is_node && cfg.buildMode != BuildMode::Manual;

        let (artifact, version, os_source) = match vm.kind {
            VmType::Switch => (SWITCH_ARTIFACT, cfg.artifacts.switchImage.as_str(), "onie-kvm.img"),
            _ => (FLATCAR_ARTIFACT, cfg.artifacts.flatcar.as_str(), "flatcar.img"),
        };
        let mut files = vec![
            ArtifactFile::new("efi_code.fd", "efi_code.fd"),
            ArtifactFile::new("efi_vars.fd", "efi_vars.fd"),
        ];
        if !image_build {
            files.push(ArtifactFile::new(os_source, "os.img"));
        }
        cache.materialize(dirs.dir(), artifact, version, &files).await?;

        if image_build {
            // installer media boots and writes the real os; start blank
            run_tool(
                "qemu-img",
                &["create", "-f", "qcow2", &dirs.os_img().display().to_string(), &format!("{}G", vm.size.disk)],
            )
            .await?;
            match cfg.buildMode {
                BuildMode::Usb => {
                    std::fs::copy(ws.install_usb(&vm.name), dirs.usb_img())?;
                }
                BuildMode::Iso => {
                    std::fs::copy(ws.install_iso(&vm.name), dirs.usb_iso())?;
                }
                BuildMode::Manual => unreachable!("image_build excludes manual"),
            }
        } else if is_node {
            // manual installs run inside the fetched image; give it room
            run_tool(
                "qemu-img",
                &["resize", &dirs.os_img().display().to_string(), &format!("{}G", vm.size.disk)],
            )
            .await?;
        }
    }

    match vm.kind {
        VmType::Server => ignition::write(vm, &dirs, pubkey, None)?,
        VmType::External => {
            let plan = ignition::ExternalPlan {
                vrfs: vec!["default".into()],
                nics: vec!["enp2s1".into()],
            };
            ignition::write(vm, &dirs, pubkey, Some(&plan))?;
        }
        VmType::Control | VmType::Gateway if cfg.buildMode == BuildMode::Manual => {
            // fw_cfg wants the node ignition in the VM dir too
            std::fs::copy(ws.install_ignition(&vm.name), dirs.ignition())?;
        }
        _ => {}
    }
    Ok(())
}

async fn run_tool(tool: &str, args: &[&str]) -> Result<()> {
    debug!("{} {}", tool, args.join(" "));
    let s = Command::new(tool).args(args).status().await?;
    if !s.success() {
        bail!("{} {} failed: {}", tool, args.join(" "), s.code().unwrap_or(1001));
    }
    Ok(())
}

/// Launch one VM and supervise the process until exit or cancellation
async fn run_qemu(ws: Workspace, cfg: FabConfig, vm: Vm, cancel: Arc<AtomicBool>) -> Result<()> {
    let dirs = VmDirs::new(&ws, &vm.name);
    let qemu = which::which(host::HYPERVISOR).map_err(|_| format!("{} not found on PATH", host::HYPERVISOR))?;
    let argv = qemu::args(&vm, &dirs, &cfg.buildMode, cfg.pciBridges)?;
    info!("Starting VM {} (id {})", vm.name, vm.id);
    trace!("{} {}", qemu.display(), argv.join(" "));

    let mut child = Command::new(qemu).args(&argv).spawn()?;
    loop {
        tokio::select! {
            status = &mut child => {
                let status = status?;
                if cancel.load(Ordering::Relaxed) {
                    debug!("{} exited during shutdown", vm.name);
                    return Ok(());
                }
                // VMs run until the group winds down; any exit before that
                // is a failure, zero or not
                return Err(ErrorKind::VmRuntime(format!(
                    "{} exited unexpectedly ({})", vm.name, status
                )).into());
            }
            _ = Delay::new(Duration::from_millis(500)) => {
                if cancel.load(Ordering::Relaxed) {
                    debug!("Killing {}", vm.name);
                    let _ = child.kill();
                }
            }
        }
    }
}

/// Wait for the cluster, then run the on-ready pipeline
async fn waiter(ctx: OnReadyCtx, cmds: Vec<OnReadyCmd>) -> Result<()> {
    // the kubeconfig appears once the first control node installs
    while !ctx.ws.kubeconfig().is_file() {
        if ctx.cancel.load(Ordering::Relaxed) {
            bail!("cancelled before the kubeconfig appeared");
        }
        Delay::new(Duration::from_secs(5)).await;
    }

    let expected = {
        let mut set: std::collections::BTreeSet<String> =
            ctx.wiring.controlNodes.iter().map(|n| n.name.clone()).collect();
        for n in ctx.wiring.gateway_nodes() {
            set.insert(n.name.clone());
        }
        set
    };
    kubeapi::wait_ready(&ctx.ws.kubeconfig(), &expected, None, &ctx.cancel).await?;
    onready::run(&cmds, &ctx).await
}

/// Bring the whole vlab up and run it to completion
///
/// One task per VM, one post-processor per VM, one waiter coordinating
/// readiness and the on-ready pipeline. A fail-fast failure cancels the
/// group; everyone else observes the flag and winds down within the grace
/// period.
pub async fn up(
    ws: Workspace,
    cfg: FabConfig,
    wiring: Wiring,
    plan: VlabPlan,
    opts: VlabOpts,
) -> Result<()> {
    ws.prepare()?;
    let (key, pubkey) = ssh::ensure_keypair(&ws)?;

    // host resources first: taps, passthrough, stale VM sweep
    host::privileged(&opts.ownBin, "prepare-taps", &[plan.tapCount.to_string()]).await?;
    if !plan.passthroughs.is_empty() {
        host::privileged(&opts.ownBin, "bind-devices", &plan.passthroughs).await?;
    }
    let stale = host::find_stale_vms()?;
    if !stale.is_empty() {
        if opts.killStale {
            host::privileged(&opts.ownBin, "kill-stale-vms", &[]).await?;
        } else {
            let pids: Vec<String> = stale.iter().map(|s| format!("{} ({})", s.name, s.pid)).collect();
            bail!("stale VMs from a prior run: {}; re-run with --kill-stale", pids.join(", "));
        }
    }

    let registry = hhfab_definitions::RegistryConfig::read_from(ws.root())?;
    let cache = Arc::new(Cache::new(Cache::default_dir()?, registry));
    for vm in &plan.vms {
        prepare_vm(&ws, &cache, &cfg, vm, &pubkey).await?;
    }

    let cancel = Arc::new(AtomicBool::new(false));
    let fail_fast = opts.effective_fail_fast();

    // SIGINT/SIGTERM cancels the run; a grace period later we are gone
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            warn!("Interrupt: cancelling the run");
            cancel.store(true, Ordering::Relaxed);
            Delay::new(CANCEL_GRACE).await;
            warn!("Grace period over, forcing exit");
            std::process::exit(2);
        });
    }

    let post_ctx = Arc::new(postprocess::PostCtx {
        ws: ws.clone(),
        cfg: cfg.clone(),
        cache: cache.clone(),
        key: key.clone(),
        auto_upgrade: opts.autoUpgrade,
        cancel: cancel.clone(),
    });

    let errors: Arc<Mutex<Vec<(String, Error)>>> = Arc::new(Mutex::new(vec![]));
    let clean_exit = Arc::new(AtomicBool::new(false));
    let diag = Arc::new(DiagCtx {
        ws: ws.clone(),
        plan: plan.clone(),
        wiring: wiring.clone(),
        key: key.clone(),
        swept: AtomicBool::new(false),
    });
    let mut tasks = vec![];

    // a task per VM and a post-processor per VM
    for vm in plan.vms.clone() {
        let cancel2 = cancel.clone();
        let errors2 = errors.clone();
        let ws2 = ws.clone();
        let cfg2 = cfg.clone();
        let name = vm.name.clone();
        tasks.push(tokio::spawn(task_wrapper(
            format!("vm {}", name),
            run_qemu(ws2, cfg2, vm, cancel2.clone()),
            fail_fast,
            cancel2,
            errors2,
            diag.clone(),
        )));
    }
    for vm in plan.vms.clone() {
        let cancel2 = cancel.clone();
        let errors2 = errors.clone();
        let name = vm.name.clone();
        tasks.push(tokio::spawn(task_wrapper(
            format!("post {}", name),
            postprocess::run_with_timeout(post_ctx.clone(), vm),
            fail_fast,
            cancel2,
            errors2,
            diag.clone(),
        )));
    }

    // the waiter: readiness then the on-ready pipeline
    {
        let ctx = OnReadyCtx {
            ws: ws.clone(),
            plan: plan.clone(),
            wiring: wiring.clone(),
            key: key.clone(),
            console_program: opts
                .consoleProgram
                .clone()
                .unwrap_or_else(|| PathBuf::from("hhfab-switch-install")),
            pdu_creds: opts.pduCreds.clone(),
            switch_creds: None,
            hard_reset: opts.hardReset,
            external_server: opts.externalServer.clone(),
            ci: opts.ci,
            cancel: cancel.clone(),
        };
        let cmds = opts.onReady.clone();
        let cancel2 = cancel.clone();
        let errors2 = errors.clone();
        let clean2 = clean_exit.clone();
        tasks.push(tokio::spawn(async move {
            match waiter(ctx, cmds).await {
                Ok(()) => {}
                Err(e) => {
                    if let ErrorKind::OnReadyExit = e.kind() {
                        info!("On-ready pipeline requested shutdown");
                        clean2.store(true, Ordering::Relaxed);
                        cancel2.store(true, Ordering::Relaxed);
                    } else {
                        error!("waiter failed: {}", e);
                        errors2.lock().expect("error list").push(("waiter".into(), e));
                        cancel2.store(true, Ordering::Relaxed); // on-ready is always fail-fast
                    }
                }
            }
        }));
    }

    futures::future::join_all(tasks).await;

    let errors = Arc::try_unwrap(errors)
        .map(|m| m.into_inner().expect("error list"))
        .unwrap_or_default();
    if !errors.is_empty() {
        // diagnostics were already collected by the failing tasks; report
        // everything, propagate the first
        for (who, e) in &errors {
            warn!("{}: {}", who, e);
        }
        let (who, first) = errors.into_iter().next().expect("non-empty");
        return Err(first).chain_err(|| ErrorKind::VmRuntime(who));
    }
    if clean_exit.load(Ordering::Relaxed) {
        info!("vlab shut down cleanly");
    }
    Ok(())
}

/// Everything a failure path needs to sweep diagnostics
struct DiagCtx {
    ws: Workspace,
    plan: VlabPlan,
    wiring: Wiring,
    key: PathBuf,
    swept: AtomicBool,
}

impl DiagCtx {
    /// Best-effort sweep, at most once per run
    async fn sweep(&self) {
        if self.swept.swap(true, Ordering::Relaxed) {
            return;
        }
        showtech::collect_all(&self.ws, &self.plan, &self.wiring, &self.key).await;
    }
}

/// Uniform failure semantics for group tasks
///
/// A fail-fast error cancels the group; otherwise the error is swallowed
/// after the diagnostic sweep. Either way the evidence lands in the logs
/// and the show-tech directory.
async fn task_wrapper(
    name: String,
    fut: impl std::future::Future<Output = Result<()>>,
    fail_fast: bool,
    cancel: Arc<AtomicBool>,
    errors: Arc<Mutex<Vec<(String, Error)>>>,
    diag: Arc<DiagCtx>,
) {
    match fut.await {
        Ok(()) => {}
        Err(e) => {
            if cancel.load(Ordering::Relaxed) {
                debug!("{} failed during shutdown: {}", name, e);
                return;
            }
            error!("{} failed: {}", name, e);
            diag.sweep().await;
            if fail_fast {
                errors.lock().expect("error list").push((name, e));
                cancel.store(true, Ordering::Relaxed);
            }
        }
    }
}

/// Collect diagnostics across the fleet, used by failure paths and the CLI
pub async fn collect_diagnostics(
    ws: &Workspace,
    plan: &VlabPlan,
    wiring: &Wiring,
) -> Result<usize> {
    let (key, _) = ssh::ensure_keypair(ws)?;
    Ok(showtech::collect_all(ws, plan, wiring, &key).await)
}
