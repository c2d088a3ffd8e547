use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::pdu::{self, Outlet, PduCreds, PduVerb};
use crate::{Error, ErrorKind, Result};

/// What a console-script exit code means
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExitKind {
    Console,
    Login,
    Install,
    Helper,
    Unknown,
    Other(i32),
}

impl ExitKind {
    pub fn from_code(code: i32) -> ExitKind {
        match code {
            1 => ExitKind::Console,
            2 => ExitKind::Login,
            3 => ExitKind::Install,
            4 => ExitKind::Helper,
            5 => ExitKind::Unknown,
            c => ExitKind::Other(c),
        }
    }
}

impl fmt::Display for ExitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitKind::Console => write!(f, "Console"),
            ExitKind::Login => write!(f, "Login"),
            ExitKind::Install => write!(f, "Install"),
            ExitKind::Helper => write!(f, "Helper"),
            ExitKind::Unknown => write!(f, "Unknown"),
            ExitKind::Other(c) => write!(f, "exit {}", c),
        }
    }
}

/// Runs the console-scripting program once for one switch
///
/// The script itself is an opaque asset; the core only holds this
/// path-and-exit-code contract.
pub trait ConsoleRunner: Send + Sync {
    fn run(&self, switch: &str) -> Result<i32>;
}

/// The real console script child process
pub struct ConsoleScript {
    pub program: PathBuf,
    pub credentials: Option<(String, String)>,
    pub wait_ready: bool,
}

impl ConsoleRunner for ConsoleScript {
    fn run(&self, switch: &str) -> Result<i32> {
        let mut cmd = std::process::Command::new(&self.program);
        cmd.arg(switch);
        if let Some((user, pass)) = &self.credentials {
            cmd.arg("--username").arg(user).arg("--password").arg(pass);
        }
        if self.wait_ready {
            cmd.arg("--wait-ready");
        }
        debug!("running console script for {}", switch);
        let status = cmd.status()?;
        // a signal death carries no code; report it as unknown
        Ok(status.code().unwrap_or(5))
    }
}

/// Power-cycles one switch's outlet
pub trait PowerControl: Send + Sync {
    fn cycle(&self, switch: &str) -> Result<()>;
}

/// PDU-backed power control using per-switch outlet annotations
pub struct PduPower {
    pub outlets: BTreeMap<String, Outlet>,
    pub creds: PduCreds,
}

impl PowerControl for PduPower {
    fn cycle(&self, switch: &str) -> Result<()> {
        let outlet = self
            .outlets
            .get(switch)
            .ok_or_else(|| format!("no PDU outlet annotated for {}", switch))?;
        pdu::power(outlet, PduVerb::Cycle, &self.creds)
    }
}

#[derive(Clone)]
pub struct ReinstallOpts {
    /// Power-cycle the whole set right after kicking the scripts off
    pub hard_reset: bool,
    /// Per-switch wall clock budget
    pub deadline: Duration,
    /// Backoff base; sleeps are base * 2^(attempt-1)
    pub backoff: Duration,
}

impl Default for ReinstallOpts {
    fn default() -> Self {
        ReinstallOpts {
            hard_reset: false,
            deadline: Duration::from_secs(30 * 60),
            backoff: Duration::from_secs(1),
        }
    }
}

const MAX_ATTEMPTS: u32 = 3;

fn backoff_wait(d: Duration, started: Instant, deadline: Duration, cancel: &AtomicBool) -> bool {
    let step = Duration::from_millis(50).min(d);
    let until = Instant::now() + d;
    while Instant::now() < until {
        if cancel.load(Ordering::Relaxed) || started.elapsed() > deadline {
            return false;
        }
        std::thread::sleep(step);
    }
    !cancel.load(Ordering::Relaxed) && started.elapsed() <= deadline
}

/// Retry loop for one switch
///
/// Up to three attempts. A Console failure gets the outlet power-cycled
/// before the retry; every failure gets base * 2^(attempt-1) of backoff. A
/// cancelled context or a passed deadline stops the retrying. An in-flight
/// global hard-reset cycle is deliberately ignored here: once a switch's
/// loop is running it makes its own power decisions.
pub fn reinstall_one(
    switch: &str,
    runner: &dyn ConsoleRunner,
    power: &dyn PowerControl,
    opts: &ReinstallOpts,
    cancel: &AtomicBool,
) -> Result<()> {
    let started = Instant::now();
    for attempt in 1..=MAX_ATTEMPTS {
        if cancel.load(Ordering::Relaxed) {
            bail!("cancelled while reinstalling {}", switch);
        }
        let code = runner.run(switch)?;
        if code == 0 {
            info!("Reinstalled {} (attempt {})", switch, attempt);
            return Ok(());
        }
        let kind = ExitKind::from_code(code);
        warn!("Reinstall of {} attempt {} failed: {}", switch, attempt, kind);
        if attempt == MAX_ATTEMPTS {
            return Err(ErrorKind::Reinstall(switch.into(), kind.to_string()).into());
        }
        if kind == ExitKind::Console {
            // a wedged console usually needs the power yanked
            if let Err(e) = power.cycle(switch) {
                warn!("PDU cycle for {} failed: {}", switch, e);
            }
        }
        let sleep = opts.backoff * 2u32.pow(attempt - 1);
        debug!("Backing off {:?} before retrying {}", sleep, switch);
        if !backoff_wait(sleep, started, opts.deadline, cancel) {
            return Err(ErrorKind::Reinstall(switch.into(), format!("{} (gave up: deadline)", kind)).into());
        }
    }
    unreachable!("attempt loop returns")
}

/// Reinstall a set of switches in parallel
///
/// Failures are collected rather than short-circuiting, then joined into
/// one aggregate error naming every switch that gave up.
pub async fn reinstall(
    switches: Vec<String>,
    runner: Arc<dyn ConsoleRunner>,
    power: Arc<dyn PowerControl>,
    opts: ReinstallOpts,
    cancel: Arc<AtomicBool>,
) -> Result<()> {
    let errors: Arc<Mutex<Vec<(String, Error)>>> = Arc::new(Mutex::new(vec![]));
    let mut tasks = vec![];
    for switch in switches.clone() {
        let runner = runner.clone();
        let power = power.clone();
        let opts = opts.clone();
        let cancel = cancel.clone();
        let errors = errors.clone();
        tasks.push(tokio::task::spawn_blocking(move || {
            if let Err(e) = reinstall_one(&switch, runner.as_ref(), power.as_ref(), &opts, &cancel) {
                errors.lock().expect("reinstall error list").push((switch, e));
            }
        }));
    }

    if opts.hard_reset {
        // scripts are already waiting on their consoles; yank everything
        tokio::time::delay_for(Duration::from_secs(1)).await;
        let mut cycles = vec![];
        for switch in switches {
            let power = power.clone();
            cycles.push(tokio::task::spawn_blocking(move || {
                if let Err(e) = power.cycle(&switch) {
                    warn!("hard reset cycle for {} failed: {}", switch, e);
                }
            }));
        }
        futures::future::join_all(cycles).await;
    }

    futures::future::join_all(tasks).await;

    let errors = Arc::try_unwrap(errors)
        .map(|m| m.into_inner().expect("reinstall error list"))
        .unwrap_or_default();
    if errors.is_empty() {
        return Ok(());
    }
    let summary = errors
        .iter()
        .map(|(s, e)| format!("{}: {}", s, e))
        .collect::<Vec<_>>()
        .join("; ");
    Err(ErrorKind::Reinstall(format!("{} switches", errors.len()), summary).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Scripted exit codes per switch, consumed one per attempt
    struct MockRunner {
        codes: Mutex<HashMap<String, Vec<i32>>>,
        attempts: Mutex<Vec<String>>,
    }

    impl MockRunner {
        fn new(codes: Vec<(&str, Vec<i32>)>) -> MockRunner {
            MockRunner {
                codes: Mutex::new(codes.into_iter().map(|(k, v)| (k.to_string(), v)).collect()),
                attempts: Mutex::new(vec![]),
            }
        }
    }

    impl ConsoleRunner for MockRunner {
        fn run(&self, switch: &str) -> Result<i32> {
            self.attempts.lock().unwrap().push(switch.to_string());
            let mut codes = self.codes.lock().unwrap();
            let list = codes.get_mut(switch).expect("scripted switch");
            Ok(if list.is_empty() { 0 } else { list.remove(0) })
        }
    }

    struct MockPower {
        cycles: Mutex<Vec<String>>,
    }

    impl MockPower {
        fn new() -> MockPower {
            MockPower { cycles: Mutex::new(vec![]) }
        }
    }

    impl PowerControl for MockPower {
        fn cycle(&self, switch: &str) -> Result<()> {
            self.cycles.lock().unwrap().push(switch.to_string());
            Ok(())
        }
    }

    fn fast_opts() -> ReinstallOpts {
        ReinstallOpts { backoff: Duration::from_millis(1), ..Default::default() }
    }

    #[test]
    fn console_failure_cycles_and_retries_three_times() {
        let runner = MockRunner::new(vec![("leaf-01", vec![1, 1, 1])]);
        let power = MockPower::new();
        let cancel = AtomicBool::new(false);
        let err = reinstall_one("leaf-01", &runner, &power, &fast_opts(), &cancel).unwrap_err();
        assert!(err.to_string().contains("Console"));
        // exactly three attempts, power cycled before the second and third
        assert_eq!(runner.attempts.lock().unwrap().len(), 3);
        assert_eq!(power.cycles.lock().unwrap().len(), 2);
    }

    #[test]
    fn non_console_failure_backs_off_without_cycle() {
        let runner = MockRunner::new(vec![("leaf-01", vec![3, 0])]);
        let power = MockPower::new();
        let cancel = AtomicBool::new(false);
        reinstall_one("leaf-01", &runner, &power, &fast_opts(), &cancel).unwrap();
        assert_eq!(runner.attempts.lock().unwrap().len(), 2);
        assert!(power.cycles.lock().unwrap().is_empty());
    }

    #[test]
    fn success_on_first_attempt_touches_nothing() {
        let runner = MockRunner::new(vec![("leaf-01", vec![0])]);
        let power = MockPower::new();
        let cancel = AtomicBool::new(false);
        reinstall_one("leaf-01", &runner, &power, &fast_opts(), &cancel).unwrap();
        assert_eq!(runner.attempts.lock().unwrap().len(), 1);
        assert!(power.cycles.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn aggregate_names_only_the_failed_switch() {
        // A keeps failing on console, B and C succeed first try
        let runner = Arc::new(MockRunner::new(vec![
            ("leaf-01", vec![1, 1, 1]),
            ("leaf-02", vec![0]),
            ("leaf-03", vec![0]),
        ]));
        let power = Arc::new(MockPower::new());
        let cancel = Arc::new(AtomicBool::new(false));
        let err = reinstall(
            vec!["leaf-01".into(), "leaf-02".into(), "leaf-03".into()],
            runner.clone(),
            power.clone(),
            fast_opts(),
            cancel,
        )
        .await
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("leaf-01"));
        assert!(msg.contains("Console"));
        assert!(!msg.contains("leaf-02"));
        assert!(!msg.contains("leaf-03"));
        // only leaf-01 was ever cycled
        let cycles = power.cycles.lock().unwrap();
        assert!(cycles.iter().all(|s| s == "leaf-01"));
    }

    #[test]
    fn exit_code_taxonomy() {
        assert_eq!(ExitKind::from_code(1), ExitKind::Console);
        assert_eq!(ExitKind::from_code(2), ExitKind::Login);
        assert_eq!(ExitKind::from_code(3), ExitKind::Install);
        assert_eq!(ExitKind::from_code(4), ExitKind::Helper);
        assert_eq!(ExitKind::from_code(5), ExitKind::Unknown);
        assert_eq!(ExitKind::from_code(42), ExitKind::Other(42));
        assert_eq!(ExitKind::Other(42).to_string(), "exit 42");
    }
}
