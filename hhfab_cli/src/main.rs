#[macro_use]
extern crate clap;
#[macro_use]
extern crate log;
#[macro_use]
extern crate error_chain;
extern crate loggerv;
extern crate libc;

extern crate hhfab;

use hhfab::*;

use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use std::path::PathBuf;
use std::process;

fn print_error_debug(e: &Error) {
    use std::env;
    // print causes of error if present
    if let Ok(_) = env::var("CI") {
        // only print debug implementation rather than unwinding
        warn!("{:?}", e);
    } else {
        // normal case - unwind the error chain
        for e in e.iter().skip(1) {
            warn!("caused by: {}", e);
        }
    }
}

fn main() {
    let app = App::new("hhfab")
        .version(crate_version!())
        .setting(AppSettings::VersionlessSubcommands)
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .setting(AppSettings::ColoredHelp)
        .setting(AppSettings::DeriveDisplayOrder)
        .global_settings(&[AppSettings::ColoredHelp])
        .about("Virtual fabric labs, right meow")
        .arg(Arg::with_name("verbose")
            .short("v")
            .multiple(true)
            .help("Increase verbosity"))
        .arg(Arg::with_name("debug")
            .short("d")
            .long("debug")
            .help("Adds line numbers to log statements"))

        .subcommand(SubCommand::with_name("build")
            .about("Synthesize and hydrate a wiring, then bake install artifacts")
            .arg(Arg::with_name("spines")
                .long("spines")
                .takes_value(true)
                .help("Number of spines (default 2)"))
            .arg(Arg::with_name("fabric-links")
                .long("fabric-links")
                .takes_value(true)
                .help("Links per spine-leaf pair (default 2)"))
            .arg(Arg::with_name("mclag-leafs")
                .long("mclag-leafs")
                .takes_value(true)
                .help("MCLAG leaves, must be even"))
            .arg(Arg::with_name("eslag-leaf-groups")
                .long("eslag-leaf-groups")
                .takes_value(true)
                .help("ESLAG group sizes as n1,n2,.."))
            .arg(Arg::with_name("orphan-leafs")
                .long("orphan-leafs")
                .takes_value(true)
                .help("Leaves without redundancy"))
            .arg(Arg::with_name("mclag-session-links")
                .long("mclag-session-links")
                .takes_value(true))
            .arg(Arg::with_name("mclag-peer-links")
                .long("mclag-peer-links")
                .takes_value(true))
            .arg(Arg::with_name("vpc-loopbacks")
                .long("vpc-loopbacks")
                .takes_value(true))
            .arg(Arg::with_name("gateway")
                .long("gateway")
                .help("Wire a gateway node in"))
            .arg(Arg::with_name("gateway-uplinks")
                .long("gateway-uplinks")
                .takes_value(true)
                .help("Spines the gateway uplinks to (default 2)")))

        .subcommand(SubCommand::with_name("validate")
            .about("Validate the wiring against the fabric invariants"))

        .subcommand(SubCommand::with_name("hydrate")
            .about("Fill in missing network attributes in the wiring")
            .arg(Arg::with_name("mode")
                .long("mode")
                .takes_value(true)
                .possible_values(&["never", "if-not-present", "override"])
                .help("Hydration mode (default if-not-present)")))

        .subcommand(SubCommand::with_name("wiring")
            .about("Print the hydrated wiring as YAML"))

        .subcommand(SubCommand::with_name("vlab")
            .setting(AppSettings::SubcommandRequiredElseHelp)
            .about("Run and interact with the virtual lab")
            .subcommand(SubCommand::with_name("up")
                .about("Bring the vlab up and run it to completion")
                .arg(Arg::with_name("kill-stale")
                    .long("kill-stale")
                    .help("Kill leftover VMs from prior runs"))
                .arg(Arg::with_name("fail-fast")
                    .long("fail-fast")
                    .help("Abort the whole run on the first VM failure"))
                .arg(Arg::with_name("auto-upgrade")
                    .long("auto-upgrade")
                    .help("Run installers in upgrade mode on installed nodes"))
                .arg(Arg::with_name("hard-reset")
                    .long("hard-reset")
                    .help("Power-cycle all switches when reinstalling"))
                .arg(Arg::with_name("ready")
                    .long("ready")
                    .takes_value(true)
                    .multiple(true)
                    .number_of_values(1)
                    .help("On-ready command to run after the fabric is Ready (repeatable)"))
                .arg(Arg::with_name("external-server")
                    .long("external-server")
                    .takes_value(true)
                    .help("Server to sacrifice for the static-external scenario"))
                .arg(Arg::with_name("console-program")
                    .long("console-program")
                    .takes_value(true)
                    .help("Console-scripting program for switch reinstalls"))
                .arg(Arg::with_name("passthrough")
                    .long("passthrough")
                    .takes_value(true)
                    .multiple(true)
                    .number_of_values(1)
                    .help("PCI BDF to hand through to switch VMs (repeatable)")))
            .subcommand(SubCommand::with_name("ssh")
                .about("SSH into a vlab entity")
                .arg(Arg::with_name("name")
                    .required(true)
                    .help("VM, switch or gateway name"))
                .setting(AppSettings::TrailingVarArg)
                .arg(Arg::with_name("cmd").multiple(true)))
            .subcommand(SubCommand::with_name("serial")
                .about("Attach to a VM's serial console")
                .arg(Arg::with_name("name")
                    .required(true)
                    .help("VM name")))
            .subcommand(SubCommand::with_name("serial-log")
                .about("Print a VM's serial log")
                .arg(Arg::with_name("name")
                    .required(true)
                    .help("VM name")))
            .subcommand(SubCommand::with_name("show-tech")
                .about("Collect diagnostics from every entity")))

        // privileged helper verbs, re-entered via sudo (hidden)
        .subcommand(SubCommand::with_name("prepare-taps")
            .setting(AppSettings::Hidden)
            .arg(Arg::with_name("count").required(true))
            .about("Reconcile the management bridge and TAP pool"))
        .subcommand(SubCommand::with_name("bind-devices")
            .setting(AppSettings::Hidden)
            .arg(Arg::with_name("devices").multiple(true))
            .about("Bind PCI devices to the passthrough driver"))
        .subcommand(SubCommand::with_name("kill-stale-vms")
            .setting(AppSettings::Hidden)
            .about("SIGKILL leftover vlab VMs"));

    // arg parse
    let args = app.get_matches();
    let name = args.subcommand_name().unwrap();
    let _ = run(&args).map_err(|e| {
        error!("{} error: {}", name, e);
        print_error_debug(&e);
        process::exit(1);
    });
    process::exit(0);
}

fn run(args: &ArgMatches) -> Result<()> {
    // initialise deps and set log default - always show INFO messages (+1)
    loggerv::Logger::new()
        .verbosity(args.occurrences_of("verbose") + 1)
        .module_path(true)
        .line_numbers(args.is_present("debug"))
        .init()
        .unwrap();
    hhfab::init()?;

    // Ignore SIGPIPE errors to avoid having to use let _ = write! everywhere
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }

    let mut rt = tokio::runtime::Runtime::new()?;
    rt.block_on(dispatch_commands(args))
}

/// The top-level configuration loader; the only place env vars are read
struct Env {
    own_bin: PathBuf,
    ci: bool,
    pdu_creds: Option<pdu::PduCreds>,
}

fn load_env() -> Env {
    use std::env;
    let own_bin = env::var("HHFAB_BIN")
        .map(PathBuf::from)
        .or_else(|_| env::current_exe())
        .unwrap_or_else(|_| PathBuf::from("hhfab"));
    // children re-enter through the same binary
    env::set_var("HHFAB_BIN", &own_bin);
    Env {
        own_bin,
        ci: env::var("GITHUB_ACTIONS").map(|v| v == "true").unwrap_or(false),
        pdu_creds: pdu::PduCreds::from_env(),
    }
}

fn count_arg(args: &ArgMatches, name: &str) -> Result<usize> {
    Ok(args.value_of(name).unwrap_or("0").parse()?)
}

fn load_wiring(ws: &workspace::Workspace) -> Result<Wiring> {
    Ok(Wiring::load_dir(&ws.include_dir())?)
}

/// Dispatch clap arguments to hhfab handlers
async fn dispatch_commands(args: &ArgMatches<'_>) -> Result<()> {
    // privileged helper verbs first; they run as root with no workspace
    if let Some(a) = args.subcommand_matches("prepare-taps") {
        let count: usize = a.value_of("count").unwrap().parse()?;
        return host::prepare_taps(count).await;
    }
    if let Some(a) = args.subcommand_matches("bind-devices") {
        let devices: Vec<String> = a
            .values_of("devices")
            .map(|v| v.map(String::from).collect())
            .unwrap_or_default();
        return host::bind_devices(&devices).await;
    }
    if args.subcommand_matches("kill-stale-vms").is_some() {
        let killed = host::kill_stale_vms()?;
        info!("Killed {} stale VMs", killed.len());
        return Ok(());
    }

    // everything else runs inside a workspace with a valid fab.yaml
    let ws = workspace::Workspace::current();
    let conf = FabConfig::read()?;
    conf.verify()?;

    if let Some(a) = args.subcommand_matches("build") {
        let opts = BuildOpts {
            spines: count_arg(a, "spines")?,
            fabricLinks: count_arg(a, "fabric-links")?,
            mclagLeafs: count_arg(a, "mclag-leafs")?,
            eslagLeafGroups: a.value_of("eslag-leaf-groups").unwrap_or("").into(),
            orphanLeafs: count_arg(a, "orphan-leafs")?,
            mclagSessionLinks: count_arg(a, "mclag-session-links")?,
            mclagPeerLinks: count_arg(a, "mclag-peer-links")?,
            vpcLoopbacks: count_arg(a, "vpc-loopbacks")?,
            gateway: a.is_present("gateway"),
            gatewayUplinks: count_arg(a, "gateway-uplinks")?,
            ..Default::default()
        };
        let mut wiring = builder::build(&conf, &opts)?;
        hydrate::hydrate(&mut wiring, &conf, HydrateMode::IfNotPresent)?;
        generate::write_wiring(&ws, &wiring)?;
        let plan = hhfab_definitions::vlab::plan(&wiring, &[], "")?;
        let (_, pubkey) = ssh::ensure_keypair(&ws)?;
        return generate::build_artifacts(&ws, &conf, &plan, &pubkey);
    }

    if args.subcommand_matches("validate").is_some() {
        let wiring = load_wiring(&ws)?;
        let status = hydrate::get_hydration(&wiring, &conf)?;
        info!("Wiring hydration status: {:?}", status);
        return Ok(hydrate::validate(&wiring, &conf)?);
    }

    if let Some(a) = args.subcommand_matches("hydrate") {
        let mode = match a.value_of("mode").unwrap_or("if-not-present") {
            "never" => HydrateMode::Never,
            "override" => HydrateMode::Override,
            _ => HydrateMode::IfNotPresent,
        };
        let mut wiring = load_wiring(&ws)?;
        hydrate::hydrate(&mut wiring, &conf, mode)?;
        return generate::write_wiring(&ws, &wiring);
    }

    if args.subcommand_matches("wiring").is_some() {
        let mut wiring = load_wiring(&ws)?;
        hydrate::hydrate(&mut wiring, &conf, HydrateMode::IfNotPresent)?;
        print!("{}", wiring.to_yaml()?);
        return Ok(());
    }

    if let Some(a) = args.subcommand_matches("vlab") {
        // vlab commands want a hydrated wiring and the derived plan
        let mut wiring = load_wiring(&ws)?;
        hydrate::hydrate(&mut wiring, &conf, HydrateMode::IfNotPresent)?;

        if let Some(b) = a.subcommand_matches("up") {
            let env = load_env();
            let passthroughs: Vec<String> = b
                .values_of("passthrough")
                .map(|v| v.map(String::from).collect())
                .unwrap_or_default();
            let (_, pubkey) = ssh::ensure_keypair(&ws)?;
            let plan = hhfab_definitions::vlab::plan(&wiring, &passthroughs, &pubkey)?;

            let mut ready = vec![];
            if let Some(cmds) = b.values_of("ready") {
                for c in cmds {
                    ready.push(c.parse::<onready::OnReadyCmd>()?);
                }
            }
            let opts = vm::VlabOpts {
                failFast: b.is_present("fail-fast"),
                killStale: b.is_present("kill-stale"),
                autoUpgrade: b.is_present("auto-upgrade"),
                hardReset: b.is_present("hard-reset"),
                onReady: ready,
                externalServer: b.value_of("external-server").map(String::from),
                consoleProgram: b.value_of("console-program").map(PathBuf::from),
                ci: env.ci,
                ownBin: env.own_bin,
                pduCreds: env.pdu_creds,
            };
            return vm::up(ws, conf, wiring, plan, opts).await;
        }

        let plan = hhfab_definitions::vlab::plan(&wiring, &[], "")?;

        if let Some(b) = a.subcommand_matches("ssh") {
            let name = b.value_of("name").unwrap();
            let cmd = b
                .values_of("cmd")
                .map(|v| v.map(String::from).collect::<Vec<_>>());
            let (key, _) = ssh::ensure_keypair(&ws)?;
            let target = ssh::target_for(&plan, &wiring, name)?;
            return target.interactive(&key, cmd).await;
        }

        if let Some(b) = a.subcommand_matches("serial") {
            let name = b.value_of("name").unwrap();
            let sock = workspace::VmDirs::new(&ws, name).serial_sock();
            if !sock.exists() {
                bail!("no serial socket for {}; is the vlab running?", name);
            }
            // raw serial goes through a local relay tool
            let s = tokio::process::Command::new("socat")
                .arg("-,raw,echo=0,escape=0x1d")
                .arg(format!("UNIX-CONNECT:{}", sock.display()))
                .status()
                .await?;
            if !s.success() {
                bail!("socat exited {}", s.code().unwrap_or(1001));
            }
            return Ok(());
        }

        if let Some(b) = a.subcommand_matches("serial-log") {
            let name = b.value_of("name").unwrap();
            let log = workspace::VmDirs::new(&ws, name).serial_log();
            if !log.is_file() {
                bail!("no serial log for {}", name);
            }
            print!("{}", std::fs::read_to_string(log)?);
            return Ok(());
        }

        if a.subcommand_matches("show-tech").is_some() {
            let n = vm::collect_diagnostics(&ws, &plan, &wiring).await?;
            info!("Collected {} bundles", n);
            return Ok(());
        }
    }

    unreachable!("Subcommand valid, but not implemented");
}
