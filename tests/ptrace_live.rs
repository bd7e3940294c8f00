//! End-to-end exercise of `PtraceTracer` against a real child process.
//!
//! Needs an environment that allows `ptrace(2)` (CAP_SYS_PTRACE or a
//! permissive Yama `ptrace_scope`); under a sandbox that denies it the
//! test logs and returns early rather than failing.

use std::ffi::CString;

use syshook::catalog::Catalog;
use syshook::observation::Observation;
use syshook::tracer::{PtraceTracer, Tracer};

fn spawn_true() -> Option<PtraceTracer> {
    let argv = vec![CString::new("/bin/true").unwrap()];
    match PtraceTracer::spawn(&argv) {
        Ok(t) => Some(t),
        Err(e) => {
            eprintln!("skipping live ptrace test: {}", e);
            None
        }
    }
}

#[test]
fn traces_bin_true_to_completion() {
    let tracer = match spawn_true() {
        Some(t) => t,
        None => return,
    };
    let catalog = Catalog::load();
    let mut syscalls_seen = 0usize;

    loop {
        if tracer.step_to_syscall().is_err() {
            break;
        }
        let mut obs = match Observation::enter(&tracer, &catalog) {
            Ok(o) => o,
            Err(_) => break,
        };
        if tracer.step_to_syscall().is_err() {
            break;
        }
        if obs.update(&tracer, &catalog).is_err() {
            break;
        }
        syscalls_seen += 1;
        if syscalls_seen > 10_000 {
            panic!("/bin/true issued more than 10000 syscalls; something's wrong");
        }
    }

    assert!(syscalls_seen > 0, "expected at least one traced syscall from /bin/true");
}

#[test]
fn open_etc_hostname_is_observed_with_decoded_path() {
    let argv = vec![
        CString::new("/bin/cat").unwrap(),
        CString::new("/etc/hostname").unwrap(),
    ];
    let tracer = match PtraceTracer::spawn(&argv) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("skipping live ptrace test: {}", e);
            return;
        }
    };
    let catalog = Catalog::load();
    let mut saw_hostname_open = false;

    loop {
        if tracer.step_to_syscall().is_err() {
            break;
        }
        let mut obs = match Observation::enter(&tracer, &catalog) {
            Ok(o) => o,
            Err(_) => break,
        };
        if (obs.name == "open" || obs.name == "openat") && !obs.is_unknown() {
            if let Some(path) = obs.arg("path") {
                if path.as_bytes() == Some(&b"/etc/hostname"[..]) {
                    saw_hostname_open = true;
                }
            }
        }
        if tracer.step_to_syscall().is_err() {
            break;
        }
        if obs.update(&tracer, &catalog).is_err() {
            break;
        }
    }

    assert!(saw_hostname_open, "expected to observe an open/openat of /etc/hostname");
}
