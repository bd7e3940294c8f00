//! The `Policy` collaborator contract, plus two reference
//! implementations: a pure-observation `PassthroughPolicy` and a
//! `ChrootPolicy` that redirects path arguments under a shadow root and
//! synthesizes `getdents` listings from it.
//!
//! Neither implementation is part of the core's tested contract — they
//! exist so the shipped binary has something to drive end to end.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::catalog::ArgTag;
use crate::dirent;
use crate::error::TraceResult;
use crate::observation::Observation;
use crate::tracer::Tracer;

/// The two hooks a shadow-filesystem (or any other) policy implements.
/// The core invokes these and otherwise does not inspect what they did —
/// it only calls the argument methods (`hijack_*`/`restore*`) the policy
/// chose to call.
pub trait Policy {
    fn on_entry<T: Tracer + ?Sized>(&mut self, tracer: &T, obs: &mut Observation) -> TraceResult<()>;
    fn on_exit<T: Tracer + ?Sized>(&mut self, tracer: &T, obs: &mut Observation) -> TraceResult<()>;
}

/// Observes every syscall without altering anything; logs entry/exit at
/// debug level. The "do nothing" policy used by the plain `trace`
/// subcommand.
#[derive(Default)]
pub struct PassthroughPolicy;

impl Policy for PassthroughPolicy {
    fn on_entry<T: Tracer + ?Sized>(&mut self, _tracer: &T, obs: &mut Observation) -> TraceResult<()> {
        if obs.is_unknown() {
            debug!("syscall {} (unrecognized, orig_rax={})", obs.name, obs.entry_regs.syscall_no());
        } else {
            let args = obs
                .args
                .iter()
                .map(|a| format!("{}={}", a.name, a))
                .collect::<Vec<_>>()
                .join(", ");
            debug!("{}({})", obs.name, args);
        }
        Ok(())
    }

    fn on_exit<T: Tracer + ?Sized>(&mut self, _tracer: &T, obs: &mut Observation) -> TraceResult<()> {
        if let Some(ret) = obs.ret() {
            debug!("{} = {}", obs.name, ret);
        }
        Ok(())
    }
}

/// Redirects path-typed arguments for path-based syscalls into a shadow
/// tree rooted at `root`, and synthesizes `getdents` results from the
/// shadow tree's real directory listing.
///
/// This mirrors a typical sandboxing or virtualized-filesystem overlay
/// use case. It is deliberately simple — no
/// symlink-loop handling, no permission translation — since it exists to
/// exercise the core's hijack/restore surface, not to be a production
/// chroot.
pub struct ChrootPolicy {
    root: PathBuf,
    cwd: PathBuf,
    /// `fd -> shadow directory path` for fds opened (or `openat`'d) under
    /// the shadow root, so a later `getdents` on that fd knows which
    /// directory to list.
    open_dirs: HashMap<i64, PathBuf>,
}

impl ChrootPolicy {
    pub fn new(root: impl Into<PathBuf>, cwd: impl Into<PathBuf>) -> ChrootPolicy {
        ChrootPolicy {
            root: root.into(),
            cwd: cwd.into(),
            open_dirs: HashMap::new(),
        }
    }

    fn path_syscalls() -> &'static [&'static str] {
        &[
            "open", "openat", "stat", "newstat", "fstatat", "newfstatat", "lstat", "newlstat",
            "unlink", "unlinkat", "access", "faccessat", "chdir", "rename", "renameat", "mkdir",
            "mkdirat", "chmod", "fchmodat", "creat", "chown", "fchownat", "truncate", "rmdir",
            "readlink", "readlinkat", "getxattr",
        ]
    }
}

impl Policy for ChrootPolicy {
    fn on_entry<T: Tracer + ?Sized>(&mut self, tracer: &T, obs: &mut Observation) -> TraceResult<()> {
        if Self::path_syscalls().contains(&obs.name.as_str()) {
            // Find every f_path-typed argument and redirect it under the
            // shadow root. There's at most one per schema in this
            // catalog (rename/renameat's two path args would each be
            // redirected independently if this policy were extended to
            // them).
            let redirected: Vec<(usize, PathBuf)> = obs
                .args
                .iter()
                .enumerate()
                .filter(|(_, a)| a.tag == ArgTag::FPath)
                .map(|(i, a)| (i, a.chroot(&self.root, &self.cwd)))
                .collect();
            for (i, shadow) in redirected {
                let shown = shadow.to_string_lossy().into_owned();
                info!("{}: redirecting path arg {} -> {}", obs.name, i, shown);
                obs.args[i].hijack_str(tracer, &shown)?;
            }
        }
        Ok(())
    }

    fn on_exit<T: Tracer + ?Sized>(&mut self, tracer: &T, obs: &mut Observation) -> TraceResult<()> {
        // Restore every hijacked path argument regardless of outcome —
        // a hijack must be balanced by exactly one restore.
        if Self::path_syscalls().contains(&obs.name.as_str()) {
            let targets: Vec<usize> = obs
                .args
                .iter()
                .enumerate()
                .filter(|(_, a)| a.tag == ArgTag::FPath)
                .map(|(i, _)| i)
                .collect();
            for i in targets {
                obs.args[i].restore(tracer)?;
            }
        }

        match obs.name.as_str() {
            "open" | "openat" => self.track_opened_dir(tracer, obs)?,
            "getdents" | "getdents64" => self.synthesize_getdents(tracer, obs)?,
            "close" => {
                if let Some(fd) = obs.arg("fd") {
                    self.open_dirs.remove(&(fd.raw as i64));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

impl ChrootPolicy {
    fn track_opened_dir<T: Tracer + ?Sized>(&mut self, _tracer: &T, obs: &Observation) -> TraceResult<()> {
        let path = match obs.arg("path") {
            Some(p) => p,
            None => return Ok(()),
        };
        let shadow = path.chroot(&self.root, &self.cwd);
        if !shadow.is_dir() {
            return Ok(());
        }
        if let Some(ret) = obs.ret() {
            if ret.ok() {
                self.open_dirs.insert(ret.raw as i64, shadow);
            }
        }
        Ok(())
    }

    fn synthesize_getdents<T: Tracer + ?Sized>(&mut self, tracer: &T, obs: &mut Observation) -> TraceResult<()> {
        let fd = match obs.arg("fd") {
            Some(a) => a.raw as i64,
            None => return Ok(()),
        };
        let dir = match self.open_dirs.get(&fd) {
            Some(d) => d.clone(),
            None => return Ok(()),
        };
        let entries = dirent::list_dir(&dir)?;
        let blob = dirent::pack_all(&entries);
        let dirp_idx = obs.args.iter().position(|a| a.tag == ArgTag::FDirp);
        if let Some(idx) = dirp_idx {
            obs.args[idx].restore_dirp(tracer, &blob)?;
        }
        Ok(())
    }
}

/// Resolves a path argument's shadow location the way [`ChrootPolicy`]
/// does, exposed standalone for tests and other callers that want the
/// mapping without constructing a full policy.
pub fn shadow_path(arg_path: &Path, root: &Path, cwd: &Path) -> PathBuf {
    let normalized = if arg_path.is_absolute() {
        arg_path.to_path_buf()
    } else {
        cwd.join(arg_path)
    };
    let relative = normalized.strip_prefix("/").unwrap_or(&normalized);
    root.join(relative)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::catalog::Catalog;
    use crate::registers::{Reg, Registers};
    use crate::tracer::mock::MockTracer;

    #[test]
    fn passthrough_does_not_touch_registers() {
        let catalog = Catalog::load();
        let mut regs = Registers::default();
        regs.orig_rax = 2;
        regs.rdi = 0x1000;
        let tracer = MockTracer::new(regs);
        tracer.seed(0x1000, b"/etc/hosts\0");
        let mut obs = Observation::enter(&tracer, &catalog).unwrap();
        let before = tracer.get_registers().unwrap();

        let mut policy = PassthroughPolicy::default();
        policy.on_entry(&tracer, &mut obs).unwrap();
        tracer.set_register(Reg::rax, 3).unwrap();
        obs.update(&tracer, &catalog).unwrap();
        policy.on_exit(&tracer, &mut obs).unwrap();

        let mut after = tracer.get_registers().unwrap();
        after.rax = before.rax;
        assert_eq!(before.rdi, after.rdi);
    }

    #[test]
    fn chroot_policy_redirects_and_restores_path_arg() {
        let catalog = Catalog::load();
        let mut regs = Registers::default();
        regs.orig_rax = 2; // open
        regs.rdi = 0x2000;
        regs.rsp = 0x7fff_0000;
        let tracer = MockTracer::new(regs);
        tracer.seed(0x2000, b"/a/b\0");
        let mut obs = Observation::enter(&tracer, &catalog).unwrap();

        let mut policy = ChrootPolicy::new("/shadow", "/");
        policy.on_entry(&tracer, &mut obs).unwrap();

        let redirected = tracer.get_register(Reg::rdi).unwrap();
        assert_ne!(redirected, 0x2000);
        let bytes = tracer.read_string(redirected).unwrap();
        assert_eq!(bytes, b"/shadow/a/b");

        tracer.set_register(Reg::rax, 5).unwrap();
        obs.update(&tracer, &catalog).unwrap();
        policy.on_exit(&tracer, &mut obs).unwrap();

        assert_eq!(tracer.get_register(Reg::rdi).unwrap(), 0x2000);
    }

    #[test]
    fn shadow_path_strips_leading_slash() {
        let p = shadow_path(Path::new("/a/b"), Path::new("/shadow"), Path::new("/"));
        assert_eq!(p, Path::new("/shadow/a/b"));
    }
}
