//! The typed argument model: one variant per syscall-argument "shape"
//! (path, flag, mode, fd, ...), each knowing how to decode itself off a
//! register/tracee-memory pair and, where it makes sense, how to hijack
//! and restore itself.

use std::fmt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;

use crate::catalog::{ArgTag, Descriptor, MAX_PATH};
use crate::error::{TraceError, TraceResult};
use crate::flags;
use crate::registers::Reg;
use crate::tracer::Tracer;

/// Which register (or scratch slot) an argument was sourced from, plus
/// enough to recompute its value for hijack/restore. `seq` is 0-based for
/// positional arguments, `-1` for the return slot.
#[derive(Copy, Clone, Debug)]
pub struct ArgSite {
    pub seq: i32,
    pub reg: Reg,
}

impl ArgSite {
    fn scratch_addr(&self, rsp: u64) -> u64 {
        rsp - (MAX_PATH as u64) * (self.seq as u64 + 1)
    }
}

/// `fcntl(2)` command numbers this crate knows a symbolic name for.
fn fcntl_cmd_name(cmd: i64) -> &'static str {
    match cmd as i32 {
        libc::F_DUPFD => "F_DUPFD",
        libc::F_DUPFD_CLOEXEC => "F_DUPFD_CLOEXEC",
        libc::F_GETFD => "F_GETFD",
        libc::F_SETFD => "F_SETFD",
        libc::F_GETFL => "F_GETFL",
        libc::F_SETFL => "F_SETFL",
        libc::F_GETLK => "F_GETLK",
        libc::F_SETLK => "F_SETLK",
        libc::F_SETLKW => "F_SETLKW",
        libc::F_GETOWN => "F_GETOWN",
        libc::F_SETOWN => "F_SETOWN",
        _ => "F_UNKNOWN",
    }
}

/// Formats an errno-style return value the way `err`/`f_fd` display it:
/// the canonical `E*` symbol for small negative magnitudes, hex for
/// anything implausibly large to be an errno, decimal otherwise.
fn errno_display(v: i64) -> String {
    if v >= 0 {
        if v > 0xFFFF {
            return format!("{:#x}", v);
        }
        return v.to_string();
    }
    let mag = -v;
    if mag > 0xFFFF {
        return format!("{:#x}", v);
    }
    match Errno::from_i32(mag as i32) {
        Errno::UnknownErrno => format!("{:#x}", v),
        known => format!("{:?}", known),
    }
}

/// One decoded syscall argument (or the return value). The tag drives
/// decode/display/hijack/restore with a single dispatch — no string
/// comparisons once the catalog has resolved a tag.
#[derive(Clone, Debug)]
pub struct Arg {
    pub name: String,
    pub tag: ArgTag,
    pub site: ArgSite,
    /// The raw machine word as last decoded (a pointer for `str`-typed
    /// args, the value itself otherwise).
    pub raw: u64,
    /// For `str`-typed args, the dereferenced bytes (no trailing NUL).
    pub bytes: Option<Vec<u8>>,
    /// Declared buffer capacity for `f_dirp`, taken from a sibling
    /// `f_size`/`f_len` argument at construction time.
    pub capacity: Option<u64>,
    /// Whether a sibling `f_flag` argument carried `O_CREAT` (or no
    /// sibling `f_flag` existed at all) — gates `f_mode` decoding.
    pub mode_applies: bool,
    /// Pre-hijack register value, populated by `hijack`, consumed by
    /// `restore`.
    old: Option<u64>,
}

impl Arg {
    /// Decodes one argument (or the return value, `seq == -1`) out of
    /// live tracee state. `sibling_flag`/`sibling_size` carry just enough
    /// neighboring-argument context to resolve `f_mode`/`f_dirp`'s
    /// dependent semantics.
    pub fn decode<T: Tracer + ?Sized>(
        tracer: &T,
        desc: &Descriptor,
        site: ArgSite,
        sibling_flag: Option<i64>,
        sibling_size: Option<u64>,
    ) -> TraceResult<Arg> {
        let raw = tracer.get_register(site.reg)?;
        let mut arg = Arg {
            name: desc.name.clone(),
            tag: desc.tag,
            site,
            raw,
            bytes: None,
            capacity: None,
            mode_applies: true,
            old: None,
        };
        if desc.tag.is_str() {
            arg.bytes = Some(tracer.read_string(raw)?);
        }
        match desc.tag {
            ArgTag::FDirp => arg.capacity = sibling_size,
            ArgTag::FMode => {
                arg.mode_applies = match sibling_flag {
                    Some(flags) => flags::has_creat(flags as libc::c_int),
                    None => true,
                };
            }
            _ => {}
        }
        Ok(arg)
    }

    /// `true` when a size-returning or error-returning argument denotes
    /// success: `== 0` for `err`, `>= 0` for `serr` and `f_fd`.
    pub fn ok(&self) -> bool {
        match self.tag {
            ArgTag::Err => (self.raw as i64) == 0,
            ArgTag::SErr | ArgTag::FFd => (self.raw as i64) >= 0,
            _ => true,
        }
    }

    /// The dereferenced string, if this is a `str`-typed arg.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        self.bytes.as_deref()
    }

    pub fn as_path(&self) -> Option<&Path> {
        self.bytes
            .as_deref()
            .map(|b| Path::new(std::str::from_utf8(b).unwrap_or_default()))
    }

    /// `f_path`: does the path exist (as seen from this process, not the
    /// tracee's)?
    pub fn exists(&self) -> bool {
        self.as_path().map(|p| p.exists()).unwrap_or(false)
    }

    /// `f_path`: is it a directory?
    pub fn is_dir(&self) -> bool {
        self.as_path().map(|p| p.is_dir()).unwrap_or(false)
    }

    /// `f_path`: resolves a possibly-relative path against `cwd`.
    pub fn normpath(&self, cwd: &Path) -> PathBuf {
        match self.as_path() {
            Some(p) if p.is_absolute() => p.to_path_buf(),
            Some(p) => cwd.join(p),
            None => cwd.to_path_buf(),
        }
    }

    /// `f_path`: rewrites the normalized path underneath `root`, the way
    /// a chroot-overlay policy redirects syscall targets into a shadow
    /// tree. Strips any leading `/` from the normalized path before
    /// joining so `root.join(normalized)` can't escape `root`.
    pub fn chroot(&self, root: &Path, cwd: &Path) -> PathBuf {
        let normalized = self.normpath(cwd);
        let relative = normalized.strip_prefix("/").unwrap_or(&normalized);
        root.join(relative)
    }

    /// Entry-time rewrite of an integer-typed argument: saves the live
    /// register value, writes `new` in its place.
    pub fn hijack_int<T: Tracer + ?Sized>(&mut self, tracer: &T, new: u64) -> TraceResult<()> {
        if self.tag.is_str() {
            return Err(TraceError::HijackPrecondition(format!(
                "hijack_int called on str-typed arg {:?}",
                self.name
            )));
        }
        let old = tracer.get_register(self.site.reg)?;
        tracer.set_register(self.site.reg, new)?;
        self.old = Some(old);
        self.raw = new;
        Ok(())
    }

    /// Entry-time rewrite of a string-typed argument: materializes `new`
    /// (NUL-terminated) at a per-argument scratch slot below the
    /// tracee's stack pointer, then points the source register at it.
    pub fn hijack_str<T: Tracer + ?Sized>(&mut self, tracer: &T, new: &str) -> TraceResult<()> {
        if !self.tag.is_str() {
            return Err(TraceError::HijackPrecondition(format!(
                "hijack_str called on int-typed arg {:?}",
                self.name
            )));
        }
        if new.len() >= MAX_PATH - 1 {
            return Err(TraceError::HijackPrecondition(format!(
                "hijacked path {:?} ({} bytes) exceeds MAX_PATH-1",
                new,
                new.len()
            )));
        }
        let rsp = tracer.get_register(Reg::rsp)?;
        let scratch = self.site.scratch_addr(rsp);
        let mut payload = new.as_bytes().to_vec();
        payload.push(0);
        tracer.write_bytes(scratch, &payload)?;

        let old = tracer.get_register(self.site.reg)?;
        tracer.set_register(self.site.reg, scratch)?;
        self.old = Some(old);
        self.raw = scratch;
        self.bytes = Some(new.as_bytes().to_vec());
        Ok(())
    }

    /// Exit-time restore of an int/str-typed argument: writes the saved
    /// pre-hijack register value back.
    pub fn restore<T: Tracer + ?Sized>(&mut self, tracer: &T) -> TraceResult<()> {
        let old = self.old.take().ok_or_else(|| {
            TraceError::HijackPrecondition(format!(
                "restore called on arg {:?} with no saved hijack state",
                self.name
            ))
        })?;
        tracer.set_register(self.site.reg, old)?;
        self.raw = old;
        Ok(())
    }

    /// `err`-specific restore: replaces the decoded error word and only
    /// touches the register when `new` differs from what's already
    /// there (idempotent).
    pub fn restore_err<T: Tracer + ?Sized>(&mut self, tracer: &T, new: i64) -> TraceResult<()> {
        if self.tag != ArgTag::Err && self.tag != ArgTag::SErr {
            return Err(TraceError::HijackPrecondition(format!(
                "restore_err called on non-error arg {:?}",
                self.name
            )));
        }
        if self.raw as i64 != new {
            tracer.set_register(self.site.reg, new as u64)?;
            self.raw = new as u64;
        }
        Ok(())
    }

    /// `f_dirp` restore: overwrites the output buffer with `blob` and
    /// sets `rax` to its length. `blob` must not exceed the declared
    /// capacity.
    pub fn restore_dirp<T: Tracer + ?Sized>(&mut self, tracer: &T, blob: &[u8]) -> TraceResult<()> {
        if self.tag != ArgTag::FDirp {
            return Err(TraceError::HijackPrecondition(format!(
                "restore_dirp called on non-dirp arg {:?}",
                self.name
            )));
        }
        if let Some(cap) = self.capacity {
            if blob.len() as u64 > cap {
                return Err(TraceError::HijackPrecondition(format!(
                    "dirp restore blob ({} bytes) exceeds declared capacity ({})",
                    blob.len(),
                    cap
                )));
            }
        }
        tracer.write_bytes(self.raw, blob)?;
        tracer.set_register(Reg::rax, blob.len() as u64)?;
        Ok(())
    }

    /// `f_sysc`: neutralizes the pending syscall ahead of its exit by
    /// giving the kernel an invalid number, so it errors out without
    /// side effects. This is the only pre-exit use of this pseudo-arg;
    /// restore itself is a no-op.
    pub fn neutralize_syscall<T: Tracer + ?Sized>(tracer: &T) -> TraceResult<()> {
        tracer.set_register(Reg::orig_rax, u64::MAX)
    }
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = self.raw as i64;
        match self.tag {
            ArgTag::Err => {
                if v == 0 {
                    write!(f, "ok")
                } else {
                    write!(f, "{}", errno_display(v))
                }
            }
            ArgTag::SErr => {
                if v >= 0 {
                    write!(f, "{}", v)
                } else {
                    write!(f, "{}", errno_display(v))
                }
            }
            ArgTag::Ptr | ArgTag::FPtr => write!(f, "{:#x}", self.raw),
            ArgTag::FInt | ArgTag::FSize | ArgTag::FLen => write!(f, "{}", self.raw),
            ArgTag::FCstr => write!(f, "{:?}", String::from_utf8_lossy(self.bytes.as_deref().unwrap_or(b""))),
            ArgTag::FDirp => write!(f, "{:#x}", self.raw),
            ArgTag::FFd => {
                if v < 0 {
                    write!(f, "{}", errno_display(v))
                } else {
                    write!(f, "{}", v)
                }
            }
            ArgTag::FPath => write!(f, "{:?}", String::from_utf8_lossy(self.bytes.as_deref().unwrap_or(b""))),
            ArgTag::FFlag => write!(f, "{}", flags::display(self.raw as libc::c_int)),
            ArgTag::FMode => {
                if self.mode_applies {
                    write!(f, "{:#o}", self.raw & 0o7777)
                } else {
                    write!(f, "-")
                }
            }
            ArgTag::AtFd => {
                if v == libc::AT_FDCWD as i64 {
                    write!(f, "AT_FDCWD")
                } else if v < 0 {
                    write!(f, "{}", errno_display(v))
                } else {
                    write!(f, "{}", v)
                }
            }
            ArgTag::FStatp => write!(f, "{:#x}", self.raw),
            ArgTag::FFcntlCmd => write!(f, "{}", fcntl_cmd_name(v)),
            ArgTag::FSysc => write!(f, "{}", self.raw),
        }
    }
}
