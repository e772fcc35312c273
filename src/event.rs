//! Debug events delivered by the [`Process`](crate::Process) event pump.

use std::fmt;

use nix::unistd::Pid;

/// Extra signal info, such as its cause.
pub type Siginfo = libc::siginfo_t;

/// Classification of a drained wait status.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EventKind {
    /// The thread exited normally.
    Exited,

    /// The thread was terminated by a signal.
    Terminated,

    /// The thread stopped (signal delivery, trap, or ptrace event).
    Stopped,

    Unknown,
}

/// One kernel status change, as observed by the event pump.
#[derive(Clone, Copy)]
pub struct Event {
    /// Signal info for trap stops, when the kernel would give it to us.
    pub siginfo: Option<Siginfo>,

    /// Process the event belongs to.
    pub pid: Pid,

    /// Thread that changed state.
    pub tid: Pid,

    /// Raw `wait(2)` status word.
    pub status: i32,

    pub kind: EventKind,
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_struct("Event");
        dbg.field("pid", &self.pid)
            .field("tid", &self.tid)
            .field("status", &format_args!("{:#x}", self.status))
            .field("kind", &self.kind);

        // `siginfo_t` has no `Debug` impl; show the discriminating fields.
        if let Some(si) = &self.siginfo {
            dbg.field("si_signo", &si.si_signo).field("si_code", &si.si_code);
        }

        dbg.finish()
    }
}

/// Verdict returned by the event callback, directing what the pump does with
/// the stopped thread next.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EventStatus {
    /// Leave the thread stopped; the caller will instigate the next event.
    Stop,

    /// The event has been addressed, resume the thread.
    Continue,

    /// The event has been addressed, single-step the thread.
    ContinueStep,

    /// The event was a breakpoint that has been accounted for; resume.
    ContinueBreakPoint,

    /// Resume and re-deliver the signal to the tracee unmodified.
    ExceptionNotHandled,

    /// Pass the event to the next handler; the pump treats this as
    /// [`EventStatus::Continue`].
    NextHandler,
}
