//! The `Tracer` collaborator contract, plus the concrete `PtraceTracer`
//! that exercises it against a real child process via `nix::sys::ptrace`.

use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use std::convert::TryInto;
use std::ffi::CString;

use crate::error::{TraceError, TraceResult};
use crate::registers::{Reg, Registers};

/// Upper bound on the number of words `read_string` will scan before
/// giving up; guards against an unterminated pointer wedging the tracer.
const MAX_STRING_WORDS: usize = 4096;

/// The minimal set of kernel-tracing operations the core depends on.
///
/// One tracee is handled at a time and every method here is synchronous
/// and blocking: there is no internal parallelism, and operations on a
/// given tracee must not be issued concurrently. A `Tracer` does not own
/// process spawning or signal routing — those live outside the core, in
/// whatever drives it (the `PtraceTracer` reference implementation bundles
/// a `spawn` helper for convenience, but the trait itself stays to
/// read/write register + memory + step).
pub trait Tracer {
    /// The pid this tracer is attached to.
    fn pid(&self) -> Pid;

    /// Resumes the tracee until the next syscall-entry or syscall-exit
    /// stop.
    fn step_to_syscall(&self) -> TraceResult<()>;

    fn get_registers(&self) -> TraceResult<Registers>;
    fn set_registers(&self, regs: Registers) -> TraceResult<()>;

    /// Convenience single-field accessor, implemented over the full
    /// register exchange.
    fn get_register(&self, reg: Reg) -> TraceResult<u64> {
        Ok(self.get_registers()?.get(reg))
    }

    /// Convenience single-field mutator, implemented as read-modify-write
    /// over the full register exchange.
    fn set_register(&self, reg: Reg, value: u64) -> TraceResult<()> {
        let mut regs = self.get_registers()?;
        regs.set(reg, value);
        self.set_registers(regs)
    }

    fn read_word(&self, addr: u64) -> TraceResult<[u8; 8]>;
    fn write_word(&self, addr: u64, word: [u8; 8]) -> TraceResult<()>;

    /// Reads a NUL-terminated byte string starting at `addr`, word at a
    /// time, stopping at (and excluding) the first NUL byte found.
    fn read_string(&self, addr: u64) -> TraceResult<Vec<u8>> {
        let mut out = Vec::new();
        let mut cur = addr;
        for _ in 0..MAX_STRING_WORDS {
            let word = self.read_word(cur)?;
            if let Some(nul_at) = word.iter().position(|&b| b == 0) {
                out.extend_from_slice(&word[..nul_at]);
                return Ok(out);
            }
            out.extend_from_slice(&word);
            cur += 8;
        }
        Err(TraceError::DecodeError(format!(
            "read_string: no NUL within {} words of {:#x}",
            MAX_STRING_WORDS, addr
        )))
    }

    /// Reads `len` bytes starting at `addr`, composed from whole-word
    /// reads. A partial failure mid-buffer is not rolled back; callers
    /// must not assume atomicity.
    fn read_bytes(&self, addr: u64, len: usize) -> TraceResult<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        let mut cur = addr;
        while out.len() < len {
            let word = self.read_word(cur)?;
            out.extend_from_slice(&word);
            cur += 8;
        }
        out.truncate(len);
        Ok(out)
    }

    /// Writes `bytes` starting at `addr`. The final partial word is
    /// read-modify-written so bytes past the buffer's end aren't clobbered.
    fn write_bytes(&self, addr: u64, bytes: &[u8]) -> TraceResult<()> {
        let mut cur = addr;
        let mut chunks = bytes.chunks_exact(8);
        for chunk in &mut chunks {
            let word: [u8; 8] = chunk.try_into().unwrap();
            self.write_word(cur, word)?;
            cur += 8;
        }
        let rem = chunks.remainder();
        if !rem.is_empty() {
            let mut word = self.read_word(cur)?;
            word[..rem.len()].copy_from_slice(rem);
            self.write_word(cur, word)?;
        }
        Ok(())
    }
}

/// `Tracer` backed by `PTRACE_GETREGS`/`PTRACE_SETREGS`, `PTRACE_PEEKDATA`/
/// `PTRACE_POKEDATA`, and `PTRACE_SYSCALL`, via `nix::sys::ptrace`.
pub struct PtraceTracer {
    pid: Pid,
}

impl PtraceTracer {
    /// Wraps an already-traced, currently-stopped pid (e.g. one that
    /// called `PTRACE_TRACEME` then `execvp`'d and is stopped at the
    /// resulting `SIGTRAP`). Sets `PTRACE_O_TRACESYSGOOD` so subsequent
    /// syscall stops are unambiguously distinguishable from other traps.
    pub fn attach(pid: Pid) -> TraceResult<PtraceTracer> {
        ptrace::setoptions(pid, ptrace::Options::PTRACE_O_TRACESYSGOOD)
            .map_err(TraceError::TracerDenied)?;
        Ok(PtraceTracer { pid })
    }

    /// Forks, has the child request tracing via `PTRACE_TRACEME`, then
    /// `execvp`s `argv[0]` with `argv`. Returns a tracer for the child,
    /// stopped at its post-exec `SIGTRAP`. This is the out-of-scope
    /// "process spawning" collaborator made concrete for the shipped
    /// binary; the `Tracer` trait itself does not require it.
    pub fn spawn(argv: &[CString]) -> TraceResult<PtraceTracer> {
        use nix::sys::wait::WaitPidFlag;
        use nix::unistd::{execvp, fork, ForkResult};

        let prog = argv.first().ok_or_else(|| {
            TraceError::HijackPrecondition("spawn: empty argv".to_string())
        })?;

        // SAFETY: the child performs only async-signal-safe operations
        // (ptrace(2), execvp(2)) between fork and exec.
        match unsafe { fork() }.map_err(TraceError::TracerDenied)? {
            ForkResult::Child => {
                ptrace::traceme().expect("PTRACE_TRACEME");
                let _ = execvp(prog, argv);
                // execvp only returns on failure.
                std::process::exit(127);
            }
            ForkResult::Parent { child } => {
                match waitpid(child, Some(WaitPidFlag::WSTOPPED))
                    .map_err(TraceError::TracerDenied)?
                {
                    WaitStatus::Stopped(p, Signal::SIGTRAP) if p == child => {
                        PtraceTracer::attach(child)
                    }
                    other => Err(TraceError::DecodeError(format!(
                        "unexpected status waiting for traced child's exec stop: {:?}",
                        other
                    ))),
                }
            }
        }
    }
}

impl Tracer for PtraceTracer {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn step_to_syscall(&self) -> TraceResult<()> {
        ptrace::syscall(self.pid, None).map_err(TraceError::TracerDenied)?;
        match waitpid(self.pid, None).map_err(TraceError::TracerDenied)? {
            WaitStatus::Exited(p, _) | WaitStatus::Signaled(p, _, _) if p == self.pid => {
                Err(TraceError::ChildGone(self.pid.as_raw()))
            }
            WaitStatus::PtraceSyscall(p) if p == self.pid => Ok(()),
            // A plain SIGTRAP here (not PtraceSyscall) can happen on some
            // kernels without PTRACE_O_TRACESYSGOOD; treat it the same.
            WaitStatus::Stopped(p, Signal::SIGTRAP) if p == self.pid => Ok(()),
            WaitStatus::Stopped(p, sig) if p == self.pid => {
                // A non-syscall signal was delivered; forward it and keep
                // waiting for the syscall stop.
                ptrace::syscall(self.pid, Some(sig)).map_err(TraceError::TracerDenied)?;
                self.step_to_syscall()
            }
            other => Err(TraceError::DecodeError(format!(
                "unexpected wait status: {:?}",
                other
            ))),
        }
    }

    fn get_registers(&self) -> TraceResult<Registers> {
        ptrace::getregs(self.pid)
            .map(Registers::from)
            .map_err(TraceError::TracerDenied)
    }

    fn set_registers(&self, regs: Registers) -> TraceResult<()> {
        ptrace::setregs(self.pid, regs.into()).map_err(TraceError::TracerDenied)
    }

    fn read_word(&self, addr: u64) -> TraceResult<[u8; 8]> {
        let word = ptrace::read(self.pid, addr as ptrace::AddressType)
            .map_err(TraceError::TracerDenied)?;
        Ok((word as u64).to_ne_bytes())
    }

    fn write_word(&self, addr: u64, word: [u8; 8]) -> TraceResult<()> {
        let data = u64::from_ne_bytes(word) as i64;
        unsafe {
            ptrace::write(self.pid, addr as ptrace::AddressType, data as *mut _)
                .map_err(TraceError::TracerDenied)
        }
    }
}
