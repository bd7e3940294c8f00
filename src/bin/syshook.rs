//! `syshook`: forks and traces a command, driving `syshook`'s core
//! engine with either a pure-observation policy or a chroot-style
//! path-redirecting policy.
//!
//! This binary owns the step/observe/policy/step driver loop; its flag
//! surface is deliberately small and isn't part of the library's tested
//! contract.

use std::ffi::CString;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use syshook::observation::State;
use syshook::policy::{ChrootPolicy, PassthroughPolicy, Policy};
use syshook::tracer::{PtraceTracer, Tracer};
use syshook::{Catalog, Observation, TraceError};

#[derive(Parser)]
#[clap(name = "syshook", about = "ptrace-based syscall interception and rewriting engine")]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Traces `cmd` and logs every syscall it issues, unaltered.
    Trace {
        cmd: String,
        args: Vec<String>,
    },
    /// Traces `cmd`, redirecting path-based syscalls under `root`.
    Chroot {
        #[clap(long)]
        root: PathBuf,
        cmd: String,
        args: Vec<String>,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Trace { cmd, args } => {
            let argv = build_argv(&cmd, &args)?;
            run(&argv, PassthroughPolicy::default())
        }
        Command::Chroot { root, cmd, args } => {
            let argv = build_argv(&cmd, &args)?;
            let cwd = std::env::current_dir().context("resolving current directory")?;
            run(&argv, ChrootPolicy::new(root, cwd))
        }
    }
}

fn build_argv(cmd: &str, args: &[String]) -> Result<Vec<CString>> {
    let mut argv = Vec::with_capacity(args.len() + 1);
    argv.push(CString::new(cmd.as_bytes()).context("command contains a NUL byte")?);
    for a in args {
        argv.push(CString::new(a.as_bytes()).context("argument contains a NUL byte")?);
    }
    Ok(argv)
}

/// step -> construct/entry -> policy -> step -> update/exit -> policy ->
/// step, until the tracee is gone.
fn run(argv: &[CString], mut policy: impl Policy) -> Result<()> {
    let tracer = PtraceTracer::spawn(argv).context("spawning traced child")?;
    let catalog = Catalog::load();

    loop {
        if let Err(e) = tracer.step_to_syscall() {
            return exit_cleanly(e);
        }
        let mut obs = match Observation::enter(&tracer, &catalog) {
            Ok(o) => o,
            Err(e) => return exit_cleanly(e),
        };
        if let Err(e) = policy.on_entry(&tracer, &mut obs) {
            return exit_cleanly(e);
        }

        if let Err(e) = tracer.step_to_syscall() {
            return exit_cleanly(e);
        }
        debug_assert_eq!(obs.state, State::Entering);
        if let Err(e) = obs.update(&tracer, &catalog) {
            return exit_cleanly(e);
        }
        if let Err(e) = policy.on_exit(&tracer, &mut obs) {
            return exit_cleanly(e);
        }
    }
}

/// `ChildGone` is the expected, successful end of the loop — the tracee
/// ran to completion (or was killed) and there's nothing left to trace.
/// Any other error is an unexpected collaborator failure.
fn exit_cleanly(err: TraceError) -> Result<()> {
    match err {
        TraceError::ChildGone(pid) => {
            log::info!("tracee {} exited; ending trace", pid);
            Ok(())
        }
        other => Err(other.into()),
    }
}
