//! x86-64 general purpose register snapshot.
//!
//! The field order below matches `libc::user_regs_struct` / the kernel's
//! `struct user_regs_struct` exactly, so a `Registers` value can be
//! exchanged byte-for-byte with `PTRACE_GETREGS`/`PTRACE_SETREGS`.

use libc::user_regs_struct;

/// Names of the 27 general purpose registers the kernel exposes to a
/// tracer, in ABI order.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[allow(non_camel_case_types)]
pub enum Reg {
    r15,
    r14,
    r13,
    r12,
    rbp,
    rbx,
    r11,
    r10,
    r9,
    r8,
    rax,
    rcx,
    rdx,
    rsi,
    rdi,
    orig_rax,
    rip,
    cs,
    eflags,
    rsp,
    ss,
    fs_base,
    gs_base,
    ds,
    es,
    fs,
    gs,
}

/// Positional syscall-argument registers, in calling-convention order.
pub const ARG_REGS: [Reg; 6] = [Reg::rdi, Reg::rsi, Reg::rdx, Reg::r10, Reg::r8, Reg::r9];

/// Returns the register holding argument `seq` (0-based), or `None` for
/// the return slot (`seq == -1`, which lives in `rax` and is read via
/// [`Reg::rax`] directly).
pub fn arg_register(seq: i32) -> Option<Reg> {
    if seq < 0 {
        None
    } else {
        ARG_REGS.get(seq as usize).copied()
    }
}

/// A snapshot of a tracee's general purpose registers.
///
/// `#[repr(C)]` and field-for-field layout compatible with
/// `libc::user_regs_struct`, which is what `PTRACE_GETREGS`/`PTRACE_SETREGS`
/// populate.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Registers {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub orig_rax: u64,
    pub rip: u64,
    pub cs: u64,
    pub eflags: u64,
    pub rsp: u64,
    pub ss: u64,
    pub fs_base: u64,
    pub gs_base: u64,
    pub ds: u64,
    pub es: u64,
    pub fs: u64,
    pub gs: u64,
}

impl Registers {
    /// Reads the field named by `reg`.
    pub fn get(&self, reg: Reg) -> u64 {
        match reg {
            Reg::r15 => self.r15,
            Reg::r14 => self.r14,
            Reg::r13 => self.r13,
            Reg::r12 => self.r12,
            Reg::rbp => self.rbp,
            Reg::rbx => self.rbx,
            Reg::r11 => self.r11,
            Reg::r10 => self.r10,
            Reg::r9 => self.r9,
            Reg::r8 => self.r8,
            Reg::rax => self.rax,
            Reg::rcx => self.rcx,
            Reg::rdx => self.rdx,
            Reg::rsi => self.rsi,
            Reg::rdi => self.rdi,
            Reg::orig_rax => self.orig_rax,
            Reg::rip => self.rip,
            Reg::cs => self.cs,
            Reg::eflags => self.eflags,
            Reg::rsp => self.rsp,
            Reg::ss => self.ss,
            Reg::fs_base => self.fs_base,
            Reg::gs_base => self.gs_base,
            Reg::ds => self.ds,
            Reg::es => self.es,
            Reg::fs => self.fs,
            Reg::gs => self.gs,
        }
    }

    /// Writes the field named by `reg`.
    pub fn set(&mut self, reg: Reg, value: u64) {
        match reg {
            Reg::r15 => self.r15 = value,
            Reg::r14 => self.r14 = value,
            Reg::r13 => self.r13 = value,
            Reg::r12 => self.r12 = value,
            Reg::rbp => self.rbp = value,
            Reg::rbx => self.rbx = value,
            Reg::r11 => self.r11 = value,
            Reg::r10 => self.r10 = value,
            Reg::r9 => self.r9 = value,
            Reg::r8 => self.r8 = value,
            Reg::rax => self.rax = value,
            Reg::rcx => self.rcx = value,
            Reg::rdx => self.rdx = value,
            Reg::rsi => self.rsi = value,
            Reg::rdi => self.rdi = value,
            Reg::orig_rax => self.orig_rax = value,
            Reg::rip => self.rip = value,
            Reg::cs => self.cs = value,
            Reg::eflags => self.eflags = value,
            Reg::rsp => self.rsp = value,
            Reg::ss => self.ss = value,
            Reg::fs_base => self.fs_base = value,
            Reg::gs_base => self.gs_base = value,
            Reg::ds => self.ds = value,
            Reg::es => self.es = value,
            Reg::fs => self.fs = value,
            Reg::gs => self.gs = value,
        }
    }

    /// The syscall number latched at entry (`orig_rax`), as the kernel
    /// gives it to us: signed so that `-1`/`N/A` sentinels round-trip.
    pub fn syscall_no(&self) -> i64 {
        self.orig_rax as i64
    }
}

impl From<user_regs_struct> for Registers {
    fn from(r: user_regs_struct) -> Self {
        // SAFETY: both types are #[repr(C)] records of 27 u64 fields in
        // identical ABI order.
        unsafe { std::mem::transmute(r) }
    }
}

impl From<Registers> for user_regs_struct {
    fn from(r: Registers) -> Self {
        unsafe { std::mem::transmute(r) }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn get_set_round_trip() {
        let mut regs = Registers::default();
        regs.set(Reg::rdi, 42);
        regs.set(Reg::orig_rax, 257);
        assert_eq!(regs.get(Reg::rdi), 42);
        assert_eq!(regs.get(Reg::orig_rax), 257);
        assert_eq!(regs.syscall_no(), 257);
    }

    #[test]
    fn arg_register_mapping() {
        assert_eq!(arg_register(0), Some(Reg::rdi));
        assert_eq!(arg_register(1), Some(Reg::rsi));
        assert_eq!(arg_register(2), Some(Reg::rdx));
        assert_eq!(arg_register(3), Some(Reg::r10));
        assert_eq!(arg_register(4), Some(Reg::r8));
        assert_eq!(arg_register(5), Some(Reg::r9));
        assert_eq!(arg_register(-1), None);
    }

    #[test]
    fn layout_matches_libc_user_regs_struct() {
        assert_eq!(
            std::mem::size_of::<Registers>(),
            std::mem::size_of::<user_regs_struct>()
        );
    }
}
