//! The debugger session: signal-mask setup/teardown and target acquisition
//! by attach or spawn-and-trace.

use std::ffi::{CStr, CString, OsStr};
use std::num::NonZeroUsize;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use nix::errno::Errno;
use nix::sys::mman::{self, MapFlags, ProtFlags};
use nix::sys::personality::{self, Persona};
use nix::sys::ptrace;
use nix::sys::signal::{sigprocmask, SigSet, Signal, SigmaskHow};
use nix::unistd::{fork, ForkResult, Pid};
use tracing::info;

use crate::error::{Error, Result};
use crate::process::{AttachMode, Process};

/// A debugger session.
///
/// Construction blocks `SIGCHLD` process-wide so child status changes can
/// only be claimed synchronously by the event pump; dropping the session
/// restores the previous mask. One session per debugger process — the
/// behavior of nested sessions is unspecified.
pub struct Session {
    process: Option<Process>,
    prev_mask: SigSet,
    disable_lazy_binding: bool,
    disable_aslr: bool,
}

impl Session {
    /// Mask `SIGCHLD`, recording the prior mask. No other side effects.
    pub fn new() -> Result<Self> {
        let mut mask = SigSet::empty();
        mask.add(Signal::SIGCHLD);

        let mut prev_mask = SigSet::empty();
        sigprocmask(SigmaskHow::SIG_BLOCK, Some(&mask), Some(&mut prev_mask))
            .map_err(|errno| Error::Internal(format!("sigprocmask: {errno}")))?;

        Ok(Self {
            process: None,
            prev_mask,
            disable_lazy_binding: false,
            disable_aslr: false,
        })
    }

    /// Have the next spawn set `LD_BIND_NOW=1` in the child, forcing eager
    /// symbol resolution.
    pub fn set_disable_lazy_binding(&mut self, value: bool) {
        self.disable_lazy_binding = value;
    }

    /// Have the next spawn disable address-space randomization in the
    /// child.
    pub fn set_disable_aslr(&mut self, value: bool) {
        self.disable_aslr = value;
    }

    pub fn process(&self) -> Option<&Process> {
        self.process.as_ref()
    }

    pub fn process_mut(&mut self) -> Option<&mut Process> {
        self.process.as_mut()
    }

    /// Attach to the running process `pid`, taking ownership of every one
    /// of its threads. A previously owned process is detached first.
    pub fn attach(&mut self, pid: Pid) -> Result<&mut Process> {
        self.process = None;

        let process = Process::new(pid, AttachMode::Attach)?;
        Ok(self.process.insert(process))
    }

    /// Fork and exec `argv` under tracing.
    ///
    /// The child applies the session's lazy-binding and ASLR flags,
    /// requests tracing of itself, optionally changes to `cwd`, and execs
    /// `argv[0]` with `envp` (or the inherited environment). Any pre-exec
    /// failure is reported through a shared diagnostic page and surfaced
    /// here as [`Error::Spawn`] carrying the child's own message.
    pub fn spawn(
        &mut self,
        cwd: Option<&Path>,
        argv: &[impl AsRef<OsStr>],
        envp: Option<&[impl AsRef<OsStr>]>,
    ) -> Result<&mut Process> {
        if argv.is_empty() {
            return Err(Error::Spawn {
                msg: "empty argument vector".into(),
            });
        }

        // Everything that allocates happens before the fork; the child
        // only dereferences prepared pointers. The `CString` storage must
        // stay alive until the exec, so the pointer tables borrow from
        // locals that outlive the fork below.
        let argv = to_cstrings(argv)?;
        let argv_ptrs = exec_ptr_table(&argv);

        let envp = envp.map(to_cstrings).transpose()?;
        let envp_ptrs = envp.as_ref().map(|vars| exec_ptr_table(vars));

        let cwd = cwd
            .map(|p| CString::new(p.as_os_str().as_bytes()))
            .transpose()
            .map_err(|_| Error::Spawn {
                msg: "working directory contains an interior NUL byte".into(),
            })?;

        let page = DiagnosticPage::new()?;

        // SAFETY: the child's post-fork path sticks to async-signal-safe
        // calls and prepared pointers, then execs or aborts.
        match unsafe { fork() }.map_err(|errno| Error::Spawn {
            msg: format!("fork: {errno}"),
        })? {
            ForkResult::Child => {
                if self.disable_lazy_binding {
                    const LD_BIND_NOW: &CStr = c"LD_BIND_NOW";
                    const ONE: &CStr = c"1";

                    let res = unsafe { libc::setenv(LD_BIND_NOW.as_ptr(), ONE.as_ptr(), 1) };
                    if res == -1 {
                        page.fail("failed to disable lazy binding", Errno::last());
                    }
                }

                if self.disable_aslr {
                    let persona = match personality::get() {
                        Ok(persona) => persona,
                        Err(errno) => page.fail("failed to get current personality", errno),
                    };

                    if let Err(errno) = personality::set(persona | Persona::ADDR_NO_RANDOMIZE) {
                        page.fail("failed to disable ASLR", errno);
                    }
                }

                if let Err(errno) = ptrace::traceme() {
                    page.fail("failed to enable tracing", errno);
                }

                if let Some(cwd) = &cwd {
                    if unsafe { libc::chdir(cwd.as_ptr()) } == -1 {
                        page.fail("failed to change working directory", Errno::last());
                    }
                }

                // Raw exec: the nix wrappers heap-allocate argument
                // vectors, which is not async-signal-safe.
                unsafe {
                    match &envp_ptrs {
                        Some(envp) => {
                            libc::execve(argv_ptrs[0], argv_ptrs.as_ptr(), envp.as_ptr())
                        }
                        None => libc::execv(argv_ptrs[0], argv_ptrs.as_ptr()),
                    };
                }

                // Only reachable when the exec itself failed.
                page.fail("failed to exec", Errno::last());
            }
            ForkResult::Parent { child } => {
                info!(pid = child.as_raw(), "spawned tracee");

                let process = Process::new(child, AttachMode::NoAttach)?;
                self.check_spawn_precondition(&process, child, &page)?;

                Ok(self.process.insert(process))
            }
        }
    }

    /// The freshly spawned child must be sitting in a `SIGTRAP` stop from
    /// its exec; anything else becomes a typed error.
    fn check_spawn_precondition(
        &self,
        process: &Process,
        child: Pid,
        page: &DiagnosticPage,
    ) -> Result<()> {
        let Some(thread) = process.find_thread(child) else {
            internal_error!("spawned process {child} has no initial thread");
        };

        if thread.is_exited() {
            return Err(Error::TraceePrecondition {
                pid: child,
                reason: format!(
                    "the child unexpectedly exited with code {}",
                    thread.exit_status()
                ),
            });
        }

        if thread.is_signaled() {
            // Aborts that happened before the traceme land here rather
            // than as a stop; the diagnostic page still has the story.
            if thread.signal_status() == libc::SIGABRT {
                return Err(Error::Spawn { msg: page.message() });
            }

            return Err(Error::TraceePrecondition {
                pid: child,
                reason: format!(
                    "the child was unexpectedly killed by signal {}",
                    thread.signal_status()
                ),
            });
        }

        if thread.is_stopped() && thread.stop_status() == libc::SIGABRT {
            return Err(Error::Spawn { msg: page.message() });
        }

        if !thread.is_stopped() || thread.stop_status() != libc::SIGTRAP {
            return Err(Error::TraceePrecondition {
                pid: child,
                reason: format!("stopped by signal {} instead of SIGTRAP", thread.stop_status()),
            });
        }

        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Release the process first so its teardown still runs with the
        // session's signal arrangement in place.
        self.process = None;

        let _ = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&self.prev_mask), None);
    }
}

fn to_cstrings(items: &[impl AsRef<OsStr>]) -> Result<Vec<CString>> {
    items
        .iter()
        .map(|item| CString::new(item.as_ref().as_bytes()))
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| Error::Spawn {
            msg: "argument contains an interior NUL byte".into(),
        })
}

/// One shared anonymous page the child writes its pre-exec failure message
/// into. Unmapped on every exit path from `spawn`.
struct DiagnosticPage {
    ptr: std::ptr::NonNull<libc::c_void>,
}

impl DiagnosticPage {
    const SIZE: usize = 4096;

    fn new() -> Result<Self> {
        // SAFETY: fresh anonymous mapping, unmapped only in Drop.
        let ptr = unsafe {
            mman::mmap_anonymous(
                None,
                NonZeroUsize::new(Self::SIZE).unwrap(),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED | MapFlags::MAP_ANONYMOUS,
            )
        }
        .map_err(|errno| Error::Internal(format!("mmap: {errno}")))?;

        Ok(Self { ptr })
    }

    /// Child side: record `phase` and the errno description, then abort.
    /// The abort is deliberate: the parent detects `SIGABRT` and reads the
    /// message back. Writes bytes by hand; no formatting machinery.
    fn fail(&self, phase: &str, errno: Errno) -> ! {
        // SAFETY: the page is ours and at least SIZE bytes.
        let buf = unsafe {
            std::slice::from_raw_parts_mut(self.ptr.as_ptr().cast::<u8>(), Self::SIZE)
        };

        let mut n = 0;
        append(buf, &mut n, phase.as_bytes());
        append(buf, &mut n, b": ");
        append(buf, &mut n, errno.desc().as_bytes());
        buf[n] = 0;

        unsafe { libc::abort() }
    }

    /// Parent side: the NUL-terminated message, if any.
    fn message(&self) -> String {
        // SAFETY: the page is ours and at least SIZE bytes.
        let buf =
            unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().cast::<u8>(), Self::SIZE) };

        let len = buf.iter().position(|&b| b == 0).unwrap_or(0);
        if len == 0 {
            return "the child aborted before exec".into();
        }

        String::from_utf8_lossy(&buf[..len]).into_owned()
    }
}

impl Drop for DiagnosticPage {
    fn drop(&mut self) {
        // SAFETY: mapping created in `new` with the same length.
        let _ = unsafe { mman::munmap(self.ptr, Self::SIZE) };
    }
}

fn append(buf: &mut [u8], n: &mut usize, bytes: &[u8]) {
    for &b in bytes {
        if *n < buf.len() - 1 {
            buf[*n] = b;
            *n += 1;
        }
    }
}

/// Flatten strings into the NUL-terminated pointer table the `execv(2)`
/// family expects. The pointers borrow the given `CString`s; the caller
/// keeps that storage alive until the exec happens.
fn exec_ptr_table(strings: &[CString]) -> Vec<*const libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn current_mask() -> SigSet {
        let mut mask = SigSet::empty();
        sigprocmask(SigmaskHow::SIG_BLOCK, None, Some(&mut mask)).unwrap();
        mask
    }

    #[test]
    fn sigchld_mask_is_scoped_to_the_session() {
        let before = current_mask().contains(Signal::SIGCHLD);

        {
            let _session = Session::new().unwrap();
            assert!(current_mask().contains(Signal::SIGCHLD));
        }

        assert_eq!(current_mask().contains(Signal::SIGCHLD), before);
    }

    #[test]
    fn spawn_rejects_empty_argv() {
        let mut session = Session::new().unwrap();
        let argv: &[&str] = &[];

        let err = session.spawn(None, argv, None::<&[&str]>).unwrap_err();
        assert!(matches!(err, Error::Spawn { .. }));
    }
}
