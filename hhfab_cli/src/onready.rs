use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use futures_timer::Delay;

use hhfab_definitions::wiring::PDU_OUTLET_ANNOTATION;
use hhfab_definitions::{VlabPlan, Wiring};

use crate::pdu::{self, PduCreds};
use crate::reinstall::{self, ConsoleScript, PduPower, ReinstallOpts};
use crate::workspace::Workspace;
use crate::{kubeapi, showtech, vpcs, Error, ErrorKind, Result, ResultExt};

/// Commands the engine knows how to run once the fabric is Ready
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OnReadyCmd {
    Exit,
    SetupVpcs,
    SetupPeerings,
    SwitchReinstall,
    TestConnectivity,
    Wait,
    Inspect,
    ReleaseTest,
}

impl FromStr for OnReadyCmd {
    type Err = Error;

    fn from_str(s: &str) -> Result<OnReadyCmd> {
        Ok(match s {
            "exit" => OnReadyCmd::Exit,
            "setup-vpcs" => OnReadyCmd::SetupVpcs,
            "setup-peerings" => OnReadyCmd::SetupPeerings,
            "switch-reinstall" => OnReadyCmd::SwitchReinstall,
            "test-connectivity" => OnReadyCmd::TestConnectivity,
            "wait" => OnReadyCmd::Wait,
            "inspect" => OnReadyCmd::Inspect,
            "release-test" => OnReadyCmd::ReleaseTest,
            other => bail!("unknown on-ready command '{}'", other),
        })
    }
}

impl fmt::Display for OnReadyCmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OnReadyCmd::Exit => "exit",
            OnReadyCmd::SetupVpcs => "setup-vpcs",
            OnReadyCmd::SetupPeerings => "setup-peerings",
            OnReadyCmd::SwitchReinstall => "switch-reinstall",
            OnReadyCmd::TestConnectivity => "test-connectivity",
            OnReadyCmd::Wait => "wait",
            OnReadyCmd::Inspect => "inspect",
            OnReadyCmd::ReleaseTest => "release-test",
        };
        write!(f, "{}", s)
    }
}

/// Everything the on-ready pipeline runs against
pub struct OnReadyCtx {
    pub ws: Workspace,
    pub plan: VlabPlan,
    pub wiring: Wiring,
    pub key: PathBuf,
    /// Console-scripting program for switch reinstalls
    pub console_program: PathBuf,
    pub pdu_creds: Option<PduCreds>,
    pub switch_creds: Option<(String, String)>,
    pub hard_reset: bool,
    /// Server used by the static-external scenario, if pinned
    pub external_server: Option<String>,
    /// GITHUB_ACTIONS environment: exit hard instead of unwinding
    pub ci: bool,
    pub cancel: Arc<AtomicBool>,
}

impl OnReadyCtx {
    fn expected_nodes(&self) -> std::collections::BTreeSet<String> {
        let mut set: std::collections::BTreeSet<String> =
            self.wiring.controlNodes.iter().map(|n| n.name.clone()).collect();
        for n in self.wiring.gateway_nodes() {
            set.insert(n.name.clone());
        }
        set
    }
}

async fn dispatch(cmd: OnReadyCmd, ctx: &OnReadyCtx) -> Result<()> {
    match cmd {
        OnReadyCmd::Exit => {
            info!("On-ready exit requested");
            if ctx.ci {
                // CI runners hang on our residual tasks otherwise
                std::process::exit(0);
            }
            Err(ErrorKind::OnReadyExit.into())
        }
        OnReadyCmd::SetupVpcs => vpcs::setup_vpcs(&ctx.ws, &ctx.wiring).await,
        OnReadyCmd::SetupPeerings => vpcs::setup_peerings(&ctx.ws, &ctx.wiring).await,
        OnReadyCmd::TestConnectivity => {
            vpcs::test_connectivity(&ctx.ws, &ctx.plan, &ctx.wiring, &ctx.key).await
        }
        OnReadyCmd::Inspect => vpcs::inspect(&ctx.ws, &ctx.wiring).await,
        OnReadyCmd::ReleaseTest => {
            vpcs::release_test(
                &ctx.ws,
                &ctx.plan,
                &ctx.wiring,
                &ctx.key,
                ctx.external_server.as_deref(),
            )
            .await
        }
        OnReadyCmd::Wait => {
            // a plain settle: give the fabric a beat, then re-require
            // readiness
            Delay::new(Duration::from_secs(10)).await;
            kubeapi::wait_ready(
                &ctx.ws.kubeconfig(),
                &ctx.expected_nodes(),
                Some(Duration::from_secs(10 * 60)),
                &ctx.cancel,
            )
            .await
        }
        OnReadyCmd::SwitchReinstall => {
            let switches: Vec<String> = ctx.wiring.switches.iter().map(|s| s.name.clone()).collect();
            let mut outlets = BTreeMap::new();
            for s in &ctx.wiring.switches {
                if let Some(raw) = s.annotations.get(PDU_OUTLET_ANNOTATION) {
                    outlets.insert(s.name.clone(), pdu::parse_outlet_url(raw)?);
                }
            }
            let runner = Arc::new(ConsoleScript {
                program: ctx.console_program.clone(),
                credentials: ctx.switch_creds.clone(),
                wait_ready: true,
            });
            let power = Arc::new(PduPower {
                outlets,
                creds: ctx.pdu_creds.clone().unwrap_or_default(),
            });
            let opts = ReinstallOpts { hard_reset: ctx.hard_reset, ..Default::default() };
            reinstall::reinstall(switches, runner, power, opts, ctx.cancel.clone()).await
        }
    }
}

/// Run the ordered on-ready command list
///
/// Strictly sequential; any command in the list implies fail-fast, so the
/// first failure collects diagnostics and returns. The Exit sentinel
/// propagates up without being treated as a failure.
pub async fn run(cmds: &[OnReadyCmd], ctx: &OnReadyCtx) -> Result<()> {
    for cmd in cmds {
        info!("Running on-ready command: {}", cmd);
        match dispatch(*cmd, ctx).await {
            Ok(()) => debug!("on-ready {} done", cmd),
            Err(e) => {
                if let ErrorKind::OnReadyExit = e.kind() {
                    return Err(e);
                }
                error!("on-ready {} failed: {}", cmd, e);
                showtech::collect_all(&ctx.ws, &ctx.plan, &ctx.wiring, &ctx.key).await;
                return Err(e).chain_err(|| ErrorKind::OnReady(cmd.to_string()));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_parsing() {
        assert_eq!("setup-vpcs".parse::<OnReadyCmd>().unwrap(), OnReadyCmd::SetupVpcs);
        assert_eq!("exit".parse::<OnReadyCmd>().unwrap(), OnReadyCmd::Exit);
        assert_eq!("release-test".parse::<OnReadyCmd>().unwrap(), OnReadyCmd::ReleaseTest);
        assert!("reticulate-splines".parse::<OnReadyCmd>().is_err());
        // round trip
        for c in &[
            OnReadyCmd::Exit,
            OnReadyCmd::SetupVpcs,
            OnReadyCmd::SetupPeerings,
            OnReadyCmd::SwitchReinstall,
            OnReadyCmd::TestConnectivity,
            OnReadyCmd::Wait,
            OnReadyCmd::Inspect,
            OnReadyCmd::ReleaseTest,
        ] {
            assert_eq!(c.to_string().parse::<OnReadyCmd>().unwrap(), *c);
        }
    }
}
