//! A debugger engine for native x86/x86-64 processes on Linux.
//!
//! Remora wraps the kernel's tracing facility into four layers: a
//! [`Session`] that owns the signal arrangement and acquires a target by
//! [`attach`](Session::attach) or [`spawn`](Session::spawn); a [`Process`]
//! that tracks the target's threads, patches software [`Breakpoint`]s, and
//! pumps debug events; a [`Thread`] per traced task with a small
//! Running/Stopped state machine; and a [`Context`] register snapshot with
//! typed [`RegisterRef`] views over both bitness variants, including the
//! x87/SSE/AVX/AVX-512 extended state.
//!
//! The engine is cooperative and single-threaded: the caller drives the
//! event pump, inspects or edits the target between pumps, and decides per
//! event whether the thread resumes, steps, or stays stopped.
//!
//! ```no_run
//! use std::time::Duration;
//! use remora::{EventStatus, Session};
//!
//! # fn main() -> remora::Result<()> {
//! let mut session = Session::new()?;
//! let process = session.spawn(None, &["/bin/true"], None::<&[&str]>)?;
//!
//! process.resume()?;
//! while process.next_debug_event(Duration::from_millis(100), |event| {
//!     println!("{event:?}");
//!     EventStatus::Continue
//! })? {}
//! # Ok(())
//! # }
//! ```

#[macro_use]
pub mod error;

pub mod breakpoint;
pub mod context;
pub mod event;
pub mod process;
pub mod procfs;
pub mod register_ref;
pub mod session;
pub mod thread;

#[doc(inline)]
pub use error::{Error, Result};

#[doc(inline)]
pub use breakpoint::{Breakpoint, BreakpointKind, MemoryAccess};

#[doc(inline)]
pub use context::{Context, RegisterId, Registers};

#[doc(inline)]
pub use event::{Event, EventKind, EventStatus, Siginfo};

#[doc(inline)]
pub use process::Process;

#[doc(inline)]
pub use procfs::{Permissions, Region};

#[doc(inline)]
pub use register_ref::RegisterRef;

#[doc(inline)]
pub use session::Session;

#[doc(inline)]
pub use thread::Thread;

pub use nix::unistd::Pid;

/// POSIX signal.
pub use nix::sys::signal::Signal;
