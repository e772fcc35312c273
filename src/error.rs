use std::io;
use std::path::PathBuf;

use nix::errno::Errno;
use nix::unistd::Pid;

pub type Result<T> = std::result::Result<T, Error>;

/// Return an [`Error::Internal`] from the enclosing function.
///
/// Internal errors represent broken invariants of the engine itself, not
/// reportable tracee conditions.
macro_rules! internal_error {
    ($($arg:tt)*) => {
        return Err($crate::error::Error::Internal(format!($($arg)*)))
    };
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not attach to tracee = {pid}")]
    Attach { pid: Pid, source: Errno },

    #[error("could not spawn tracee: {msg}")]
    Spawn { msg: String },

    #[error("tracee = {pid} is not in the expected post-spawn trap stop: {reason}")]
    TraceePrecondition { pid: Pid, reason: String },

    #[error("ptrace {op} failed for tracee = {tid}")]
    Ptrace {
        op: &'static str,
        tid: Pid,
        source: Errno,
    },

    #[error("tracee = {pid} died mid-operation")]
    TraceeDied { pid: Pid },

    #[error("error waiting on tracee = {tid}")]
    Wait { tid: Pid, source: Errno },

    #[error("could not read tracee memory at {addr:#x}")]
    MemoryRead { addr: u64, source: io::Error },

    #[error("could not write tracee memory at {addr:#x}")]
    MemoryWrite { addr: u64, source: io::Error },

    #[error("could not access register state of tracee = {tid}: {op}")]
    RegisterAccess {
        op: &'static str,
        tid: Pid,
        source: Errno,
    },

    #[error("breakpoint already installed at {addr:#x}")]
    BreakpointExists { addr: u64 },

    #[error("could not read procfs entry {}", path.display())]
    Procfs { path: PathBuf, source: io::Error },

    #[error("input/output error")]
    InputOutput(#[from] io::Error),

    #[error("unexpected internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True iff the error indicates the tracee vanished mid-operation.
    pub fn tracee_died(&self) -> bool {
        matches!(self, Error::TraceeDied { .. })
    }
}

/// Rewrite `ESRCH` from a tracing call into [`Error::TraceeDied`].
///
/// A tracee can exit between any two ptrace requests. When it does, the
/// kernel answers `ESRCH`, which deserves a distinct variant so callers can
/// tell "the target went away" apart from a real request failure.
pub(crate) trait ResultExt<T> {
    fn died_if_esrch(self, op: &'static str, tid: Pid) -> Result<T>;
}

impl<T> ResultExt<T> for std::result::Result<T, Errno> {
    fn died_if_esrch(self, op: &'static str, tid: Pid) -> Result<T> {
        self.map_err(|source| match source {
            Errno::ESRCH => Error::TraceeDied { pid: tid },
            source => Error::Ptrace { op, tid, source },
        })
    }
}
