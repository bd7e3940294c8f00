//! Error types for the core tracing/rewriting engine.

use thiserror::Error;

/// Everything that can go wrong while driving a tracee.
#[derive(Debug, Error)]
pub enum TraceError {
    /// The tracee vanished (exited, was killed, or was detached) while a
    /// tracer primitive was in flight.
    #[error("tracee {0} is gone")]
    ChildGone(libc::pid_t),

    /// The kernel refused a ptrace request.
    #[error("tracer operation denied")]
    TracerDenied(#[from] nix::Error),

    /// A `read_string`/dirent-blob decode could not make sense of the
    /// bytes it was given.
    #[error("decode error: {0}")]
    DecodeError(String),

    /// A hijack/restore precondition (string too long, wrong seq, no
    /// saved value to restore) was violated by the caller. These are
    /// programmer bugs, not runtime conditions.
    #[error("hijack precondition violated: {0}")]
    HijackPrecondition(String),

    /// An observation method was called out of the ENTERING -> EXITING
    /// sequence it's only valid in.
    #[error("invalid observation state: {0}")]
    InvalidState(String),
}

pub type TraceResult<T> = Result<T, TraceError>;
