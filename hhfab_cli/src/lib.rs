#![recursion_limit = "1024"]
#![allow(renamed_and_removed_lints)]
#![allow(non_snake_case)]

#[macro_use]
extern crate serde_derive;
extern crate serde_yaml;
#[macro_use]
extern crate serde_json;
extern crate serde;

#[macro_use]
extern crate log;

extern crate chrono;
extern crate dirs;
extern crate flate2;
extern crate futures;
extern crate futures_timer;
extern crate k8s_openapi;
extern crate kube;
extern crate libc;
extern crate procfs;
extern crate regex;
extern crate reqwest;
extern crate rtnetlink;
extern crate semver;
extern crate ssh2;
extern crate tar;
extern crate tera;
extern crate url;
extern crate uuid;
extern crate which;

#[macro_use]
extern crate error_chain;
error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }
    links {}
    foreign_links {
        Fmt(::std::fmt::Error);
        Io(::std::io::Error) #[cfg(unix)];
        Int(::std::num::ParseIntError);
        Mani(hhfab_definitions::Error);
        SerdeY(serde_yaml::Error);
        SerdeJ(serde_json::Error);
        Tmpl(tera::Error);
        Reqe(reqwest::Error);
        UrlP(url::ParseError);
        Ssh(ssh2::Error);
        Netlink(rtnetlink::Error);
        Proc(procfs::ProcError);
        Time(::std::time::SystemTimeError);
        Join(tokio::task::JoinError);
    }
    errors {
        KubeError(e: kube::Error) {
            description("kube api interaction failed")
            display("kube api: {}", e)
        }
        HostProvisioning(op: String) {
            description("host provisioning step failed")
            display("host provisioning failed during {}", &op)
        }
        ArtifactFetch(reference: String) {
            description("artifact could not be fetched")
            display("failed to fetch artifact {}", &reference)
        }
        VmRuntime(vm: String) {
            description("vm exited or failed post-processing")
            display("vm {} failed", &vm)
        }
        InstallFailed(node: String) {
            description("node install did not complete")
            display("install on {} failed", &node)
        }
        MarkerDirty(node: String, marker: String) {
            description("install marker left by a prior attempt")
            display("{} has install marker '{}' from a prior attempt; node state unknown", &node, &marker)
        }
        SshTimeout(target: String, secs: u64) {
            description("ssh endpoint never became reachable")
            display("{} not reachable over ssh within {}s", &target, secs)
        }
        Readiness(detail: String) {
            description("expected nodes never became Ready")
            display("readiness wait failed: {}", &detail)
        }
        Reinstall(switch: String, kind: String) {
            description("switch reinstall failed")
            display("reinstall of {} failed: {}", &switch, &kind)
        }
        OnReady(cmd: String) {
            description("on-ready command failed")
            display("on-ready command {} failed", &cmd)
        }
        OnReadyExit {
            description("on-ready exit requested")
            display("on-ready exit requested")
        }
    }
}

extern crate hhfab_definitions;
pub use hhfab_definitions::{
    builder, hydrate, BuildOpts, Connection, FabConfig, HydrateMode, Nic, PortAllocator,
    RegistryConfig, Vm, VmType, VlabPlan, Wiring,
};

/// Workspace directory layout
pub mod workspace;
pub use crate::workspace::Workspace;

/// Host bridge/TAP/PCI/stale-VM provisioning
pub mod host;

/// Content-addressed artifact cache facade
pub mod artifacts;

/// SSH access routing and session helpers
pub mod ssh;

/// PDU outlet control
pub mod pdu;

/// Switch reinstall driver with PDU escalation
pub mod reinstall;

/// A small CLI kubectl interface against the vlab kubeconfig
pub mod kubectl;

/// Typed readiness waiting against the cluster api
pub mod kubeapi;

/// Best-effort diagnostic collection
pub mod showtech;

/// VPC, attachment and peering flows plus release tests
pub mod vpcs;

/// The on-ready workflow engine
pub mod onready;

/// VM fleet supervision
pub mod vm;

/// Install artifact and wiring generation
pub mod generate;

/// Smart initialiser with safety
///
/// Allows hhfab calls to work from anywhere if we know where the work
/// directory is.
pub fn init() -> Result<()> {
    use std::env;
    use std::path::Path;

    if let Ok(wdir) = env::var("HHFAB_WORK_DIR") {
        let pth = Path::new(&wdir);
        if !pth.is_dir() {
            bail!("HHFAB_WORK_DIR must exist");
        }
        env::set_current_dir(pth)?;
    }
    Ok(())
}
