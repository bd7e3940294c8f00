//! The syscall observation object: binds one entry/exit pair of ptrace
//! stops to a tracee, decoding arguments on entry and the return value
//! (plus any out-parameters) on exit.

use std::collections::HashMap;

use log::warn;

use crate::args::{Arg, ArgSite};
use crate::catalog::{ArgTag, Catalog, Schema, UNKNOWN_SYSCALL};
use crate::error::{TraceError, TraceResult};
use crate::registers::{arg_register, Reg, Registers};
use crate::tracer::Tracer;

/// Where in its lifecycle an [`Observation`] currently is. Transitions
/// monotonically `Entering -> Exiting` exactly once, via [`Observation::update`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum State {
    Entering,
    Exiting,
}

/// One syscall event on a tracee: the decoded entry arguments, and, once
/// [`update`](Observation::update) has run, the decoded return value.
///
/// Construction happens at a syscall-entry stop; `update()` runs once, at
/// the matching syscall-exit stop; the caller discards the value after
/// inspecting it.
pub struct Observation {
    /// Registers as they were at the entry stop. Never mutated in place —
    /// hijacks go through the tracer, to avoid drift between decoded args
    /// and live register state.
    pub entry_regs: Registers,
    /// Registers as they were at the matching exit stop. Present only
    /// once `state == Exiting`.
    pub exit_regs: Option<Registers>,
    pub name: String,
    pub state: State,
    pub args: Vec<Arg>,
    by_name: HashMap<String, usize>,
    /// The return value, decoded by `update()`. `None` in `Entering`.
    pub ret: Option<Arg>,
    /// Set by `update()` when the exit stop's `orig_rax` disagreed with
    /// the entry stop's — advisory only.
    pub inconsistent: bool,
}

impl Observation {
    /// Constructs an observation at a syscall-entry stop: snapshots
    /// registers, resolves the syscall name, and decodes every argument
    /// the schema declares.
    pub fn enter<T: Tracer + ?Sized>(tracer: &T, catalog: &Catalog) -> TraceResult<Observation> {
        let entry_regs = tracer.get_registers()?;
        let name = catalog.name_for(entry_regs.syscall_no()).to_string();
        let schema = catalog.schema_for(&name);
        let args = Self::decode_args(tracer, &schema)?;

        let mut by_name = HashMap::new();
        for (i, arg) in args.iter().enumerate() {
            by_name.insert(arg.name.clone(), i);
            by_name.insert(format!("arg{}", i), i);
        }

        Ok(Observation {
            entry_regs,
            exit_regs: None,
            name,
            state: State::Entering,
            args,
            by_name,
            ret: None,
            inconsistent: false,
        })
    }

    fn decode_args<T: Tracer + ?Sized>(tracer: &T, schema: &Schema) -> TraceResult<Vec<Arg>> {
        // First pass: peek every descriptor's raw register value so
        // FMode/FDirp can resolve their sibling dependency regardless of
        // declaration order, without re-reading registers mid-decode.
        let mut raw_by_seq = Vec::with_capacity(schema.args.len());
        for (seq, desc) in schema.args.iter().enumerate() {
            let reg = arg_register(seq as i32).expect("schema longer than available arg registers");
            raw_by_seq.push((desc.tag, tracer.get_register(reg)?));
        }
        let sibling_flag = raw_by_seq
            .iter()
            .find(|(tag, _)| *tag == ArgTag::FFlag)
            .map(|(_, v)| *v as i64);
        let sibling_size = raw_by_seq
            .iter()
            .find(|(tag, _)| *tag == ArgTag::FSize || *tag == ArgTag::FLen)
            .map(|(_, v)| *v);

        let mut args = Vec::with_capacity(schema.args.len());
        for (seq, desc) in schema.args.iter().enumerate() {
            let reg = arg_register(seq as i32).unwrap();
            let site = ArgSite { seq: seq as i32, reg };
            args.push(Arg::decode(tracer, desc, site, sibling_flag, sibling_size)?);
        }
        Ok(args)
    }

    /// Sentinel index meaning "the return value", so the return's schema
    /// alias and `args[]` can share one `by_name` map.
    const RET_SLOT: usize = usize::MAX;

    /// Looks up a decoded argument (or the return value, once decoded) by
    /// its schema-declared name or its positional alias (`arg0`,
    /// `arg1`, ...).
    pub fn arg(&self, name: &str) -> Option<&Arg> {
        match self.by_name.get(name) {
            Some(&Self::RET_SLOT) => self.ret.as_ref(),
            Some(&i) => Some(&self.args[i]),
            None => None,
        }
    }

    pub fn arg_mut(&mut self, name: &str) -> Option<&mut Arg> {
        match self.by_name.get(name).copied() {
            Some(Self::RET_SLOT) => self.ret.as_mut(),
            Some(i) => Some(&mut self.args[i]),
            None => None,
        }
    }

    /// Updates this observation at the matching syscall-exit stop:
    /// snapshots registers again, decodes the return value, and flips
    /// `state` to `Exiting`. Runs exactly once.
    pub fn update<T: Tracer + ?Sized>(&mut self, tracer: &T, catalog: &Catalog) -> TraceResult<()> {
        if self.state != State::Entering {
            return Err(TraceError::InvalidState(format!(
                "update() called on observation already in state {:?}",
                self.state
            )));
        }
        let exit_regs = tracer.get_registers()?;
        if exit_regs.syscall_no() != self.entry_regs.syscall_no() {
            self.inconsistent = true;
            warn!(
                "syscall {:?} (pid {:?}): orig_rax changed between entry ({}) and exit ({}); \
                 treating as advisory, decoding return from exit-time state",
                self.name,
                tracer.pid(),
                self.entry_regs.syscall_no(),
                exit_regs.syscall_no(),
            );
        }

        let ret_desc = catalog.schema_for(&self.name).ret_or_default();
        let ret_site = ArgSite { seq: -1, reg: Reg::rax };
        let ret = Arg::decode(tracer, &ret_desc, ret_site, None, None)?;

        // Exposed both as `ret` and under the schema's declared local
        // name, with the later write winning on a name collision (e.g. a
        // `fd` return aliasing an `fd` arg).
        self.by_name.insert(ret_desc.name.clone(), Self::RET_SLOT);
        self.by_name.insert("ret".to_string(), Self::RET_SLOT);
        self.ret = Some(ret);
        self.exit_regs = Some(exit_regs);
        self.state = State::Exiting;
        Ok(())
    }

    /// The decoded return value. `None` while `state == Entering`.
    pub fn ret(&self) -> Option<&Arg> {
        self.ret.as_ref()
    }

    pub fn is_unknown(&self) -> bool {
        self.name == UNKNOWN_SYSCALL
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::catalog::Catalog;
    use crate::registers::Registers;
    use crate::tracer::mock::MockTracer;

    fn open_regs(flags: i32) -> Registers {
        let mut r = Registers::default();
        r.orig_rax = 2; // open
        r.rdi = 0x6000;
        r.rsi = flags as u64;
        r.rdx = 0o644;
        r
    }

    #[test]
    fn open_entry_decodes_path_flag_mode() {
        let catalog = Catalog::load();
        let regs = open_regs(libc::O_RDONLY);
        let tracer = MockTracer::new(regs);
        tracer.seed(0x6000, b"/etc/hosts\0");

        let obs = Observation::enter(&tracer, &catalog).unwrap();
        assert_eq!(obs.name, "open");
        assert_eq!(obs.state, State::Entering);
        assert_eq!(obs.args.len(), 3);
        assert_eq!(obs.arg("path").unwrap().as_bytes(), Some(&b"/etc/hosts"[..]));
        assert_eq!(format!("{}", obs.arg("flag").unwrap()), "O_RDONLY");
        assert_eq!(format!("{}", obs.arg("mode").unwrap()), "-");
        assert_eq!(obs.arg("arg0").unwrap().as_bytes(), Some(&b"/etc/hosts"[..]));
        assert!(obs.ret().is_none());
    }

    #[test]
    fn open_exit_decodes_fd_return() {
        let catalog = Catalog::load();
        let regs = open_regs(libc::O_RDONLY);
        let tracer = MockTracer::new(regs);
        tracer.seed(0x6000, b"/etc/hosts\0");
        let mut obs = Observation::enter(&tracer, &catalog).unwrap();

        tracer.set_register(Reg::rax, 5).unwrap();
        obs.update(&tracer, &catalog).unwrap();

        assert_eq!(obs.state, State::Exiting);
        assert_eq!(format!("{}", obs.ret().unwrap()), "5");
        assert!(!obs.inconsistent);
    }

    #[test]
    fn unknown_syscall_has_no_args_and_err_return() {
        let catalog = Catalog::load();
        let mut regs = Registers::default();
        regs.orig_rax = 999_999;
        let tracer = MockTracer::new(regs);

        let mut obs = Observation::enter(&tracer, &catalog).unwrap();
        assert!(obs.is_unknown());
        assert!(obs.args.is_empty());

        tracer.set_register(Reg::rax, (-38i64) as u64).unwrap(); // ENOSYS
        obs.update(&tracer, &catalog).unwrap();
        assert_eq!(format!("{}", obs.ret().unwrap()), "ENOSYS");
    }

    #[test]
    fn inconsistent_orig_rax_is_advisory_not_fatal() {
        let catalog = Catalog::load();
        let regs = open_regs(libc::O_RDONLY);
        let tracer = MockTracer::new(regs);
        tracer.seed(0x6000, b"/etc/hosts\0");
        let mut obs = Observation::enter(&tracer, &catalog).unwrap();

        tracer.set_register(Reg::orig_rax, 59).unwrap();
        tracer.set_register(Reg::rax, 0).unwrap();
        obs.update(&tracer, &catalog).unwrap();

        assert!(obs.inconsistent);
        assert_eq!(obs.state, State::Exiting);
    }

    #[test]
    fn double_update_is_rejected() {
        let catalog = Catalog::load();
        let regs = open_regs(libc::O_RDONLY);
        let tracer = MockTracer::new(regs);
        tracer.seed(0x6000, b"/etc/hosts\0");
        let mut obs = Observation::enter(&tracer, &catalog).unwrap();
        obs.update(&tracer, &catalog).unwrap();
        assert!(obs.update(&tracer, &catalog).is_err());
    }

    #[test]
    fn getdents_dirp_carries_declared_capacity() {
        let catalog = Catalog::load();
        let mut regs = Registers::default();
        regs.orig_rax = 78; // getdents
        regs.rdi = 7;
        regs.rsi = 0x8000;
        regs.rdx = 4096;
        let tracer = MockTracer::new(regs);

        let obs = Observation::enter(&tracer, &catalog).unwrap();
        assert_eq!(obs.arg("dirp").unwrap().capacity, Some(4096));
    }
}
