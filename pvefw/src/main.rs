use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};

use std::io;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use pvefw_lib::firewall::{Firewall, Paths};
use pvefw_lib::inventory::VmConfigDir;
use pvefw_lib::iptables_ops::RealIptablesOps;
use pvefw_lib::{firewall, lock, logging, reconcile};

mod cli;

const SLEEP_SLICE: Duration = Duration::from_millis(250);

fn main() {
    let args = cli::parse();

    let debug = matches!(args.command, cli::Command::Start { debug: true, .. });
    logging::init(debug);

    match run(args) {
        Ok(()) => (),
        Err(exitcode::OK) => (),
        Err(code) => process::exit(code),
    }
}

fn run(args: cli::Cli) -> Result<(), exitcode::ExitCode> {
    match args.command {
        cli::Command::Start { interval, .. } => daemon(&args, interval),
        cli::Command::Stop {} => stop(&args.pidfile),
        cli::Command::Compile { verbose } => compile(&args, verbose),
        cli::Command::Status { json } => status(&args, json),
    }
}

fn build_firewall(args: &cli::Cli) -> Firewall {
    let paths = Paths {
        config_dir: args.config_dir.clone(),
        host_fw: args.host_fw.clone(),
        bridge_nf_dir: PathBuf::from(firewall::BRIDGE_NF_DIR),
    };
    Firewall::new(
        paths,
        Box::new(VmConfigDir::new(&args.vm_config_dir)),
        Box::new(RealIptablesOps),
    )
}

fn with_lock<T>(
    args: &cli::Cli,
    f: impl FnOnce() -> Result<T, firewall::Error>,
) -> Result<T, exitcode::ExitCode> {
    lock::lock_file(&args.lockfile, lock::LOCK_TIMEOUT, f)
        .map_err(|error| {
            tracing::error!(%error, "unable to take the firewall lock");
            exitcode::TEMPFAIL
        })?
        .map_err(|error| {
            tracing::error!(%error, "firewall operation failed");
            exitcode::SOFTWARE
        })
}

fn compile(args: &cli::Cli, verbose: bool) -> Result<(), exitcode::ExitCode> {
    let fw = build_firewall(args);
    let (changed, script) = with_lock(args, || {
        let (ruleset, plan) = fw.plan()?;
        let script = verbose.then(|| reconcile::emit_restore_script(&ruleset, &plan));
        Ok((reconcile::has_changes(&plan), script))
    })?;

    if let Some(script) = script {
        print!("{script}");
    }
    if changed {
        println!("detected changes");
    } else {
        println!("no changes");
    }
    Ok(())
}

fn status(args: &cli::Cli, json: bool) -> Result<(), exitcode::ExitCode> {
    let fw = build_firewall(args);
    let report = with_lock(args, || Ok(fw.status()))?;

    if json {
        match serde_json::to_string_pretty(&report) {
            Ok(s) => println!("{s}"),
            Err(e) => eprintln!("Error serializing status to JSON: {e}"),
        }
    } else {
        println!("status: {}", report.status);
        match report.changes {
            Some(true) => println!("changes: detected"),
            Some(false) => println!("changes: none"),
            None => {}
        }
    }
    Ok(())
}

fn stop(pidfile: &std::path::Path) -> Result<(), exitcode::ExitCode> {
    let content = match std::fs::read_to_string(pidfile) {
        Ok(content) => content,
        Err(error) if error.kind() == io::ErrorKind::NotFound => {
            println!("not running");
            return Ok(());
        }
        Err(error) => {
            tracing::error!(%error, "unable to read pid file");
            return Err(exitcode::IOERR);
        }
    };
    let pid: i32 = content.trim().parse().map_err(|_| {
        tracing::error!(path = %pidfile.display(), "malformed pid file");
        exitcode::DATAERR
    })?;

    if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
        let error = io::Error::last_os_error();
        if error.raw_os_error() == Some(libc::ESRCH) {
            let _ = std::fs::remove_file(pidfile);
            println!("not running");
            return Ok(());
        }
        tracing::error!(%error, pid, "unable to signal daemon");
        return Err(exitcode::NOPERM);
    }
    println!("stopping");
    Ok(())
}

fn daemon(args: &cli::Cli, interval: Duration) -> Result<(), exitcode::ExitCode> {
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting {}",
        env!("CARGO_PKG_NAME")
    );

    std::fs::write(&args.pidfile, process::id().to_string()).map_err(|error| {
        tracing::error!(error = ?error, "error writing pid file");
        exitcode::IOERR
    })?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let force_cycle = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM, SIGQUIT] {
        signal_hook::flag::register(signal, Arc::clone(&shutdown)).map_err(|error| {
            tracing::error!(%error, signal, "error setting up signal handler");
            exitcode::IOERR
        })?;
    }
    signal_hook::flag::register(SIGHUP, Arc::clone(&force_cycle)).map_err(|error| {
        tracing::error!(%error, "error setting up SIGHUP handler");
        exitcode::IOERR
    })?;

    let fw = build_firewall(args);

    tracing::info!("entering main daemon loop");
    while !shutdown.load(Ordering::Relaxed) {
        force_cycle.store(false, Ordering::Relaxed);

        match lock::lock_file(&args.lockfile, lock::LOCK_TIMEOUT, || fw.cycle()) {
            Ok(Ok(_)) => {}
            Ok(Err(error)) => tracing::error!(%error, "reconcile cycle failed"),
            // another invocation holds the lock; retry on the next tick
            Err(error) => tracing::warn!(%error, "skipping cycle"),
        }

        let deadline = Instant::now() + interval;
        while Instant::now() < deadline
            && !shutdown.load(Ordering::Relaxed)
            && !force_cycle.load(Ordering::Relaxed)
        {
            thread::sleep(SLEEP_SLICE);
        }
    }

    tracing::info!("initiate shutdown");
    match lock::lock_file(&args.lockfile, lock::LOCK_TIMEOUT, || fw.clear()) {
        Ok(Ok(())) => {}
        Ok(Err(error)) => tracing::error!(%error, "error clearing firewall rules"),
        Err(error) => tracing::error!(%error, "unable to take the firewall lock for shutdown"),
    }
    let _ = std::fs::remove_file(&args.pidfile);
    Ok(())
}
