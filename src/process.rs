//! The traced process: thread tracking, memory access, the breakpoint
//! table, and the debug-event pump.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::mem;
use std::ptr;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tracing::{debug, info, trace, warn};

use crate::breakpoint::{Breakpoint, BreakpointKind, MemoryAccess};
use crate::error::{Error, Result, ResultExt};
use crate::event::{Event, EventKind, EventStatus};
use crate::procfs::{self, Region};
use crate::thread::{State, Thread, ThreadFlags};

/// How a [`Process`] takes ownership of its target.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum AttachMode {
    /// Attach to every thread of a running process.
    Attach,

    /// Adopt a freshly spawned child that arranged its own tracing.
    NoAttach,
}

/// A traced process: the thread table, the breakpoint table, and random
/// access to target memory.
///
/// Not thread-safe; drive a `Process` (and everything it owns) from a
/// single thread.
#[derive(Debug)]
pub struct Process {
    pid: Pid,
    mem: fs::File,
    threads: BTreeMap<i32, Thread>,
    breakpoints: BTreeMap<u64, Breakpoint>,

    /// Default target of `step`/`stop`: a key into the thread table, never
    /// a second owner. Cleared or re-pointed as threads come and go.
    active_thread: Option<i32>,

    /// Last observed digest of `/proc/<pid>/maps`.
    map_hash: u64,
}

impl Process {
    pub(crate) fn new(pid: Pid, mode: AttachMode) -> Result<Self> {
        let mut threads = BTreeMap::new();
        let mut active_thread = None;

        match mode {
            AttachMode::Attach => {
                // Threads can appear while we are attaching; iterate to a
                // fixed point over the enumeration.
                let mut first_round = true;
                loop {
                    let tids = match procfs::threads(pid) {
                        Ok(tids) => tids,
                        Err(err) if first_round => return Err(err),
                        // The target went away mid-attach; keep whatever we
                        // already hold.
                        Err(_) => break,
                    };
                    first_round = false;

                    let mut inserted = false;
                    for tid in tids {
                        if threads.contains_key(&tid.as_raw()) {
                            continue;
                        }

                        let flags = ThreadFlags::ATTACH | ThreadFlags::EXIT_KILL;
                        let thread = match Thread::new(pid, tid, flags) {
                            Ok(thread) => thread,
                            // The thread exited between enumeration and
                            // attach.
                            Err(Error::Attach {
                                source: Errno::ESRCH,
                                ..
                            })
                            | Err(Error::TraceeDied { .. }) => continue,
                            Err(err) => return Err(err),
                        };

                        if active_thread.is_none() {
                            active_thread = Some(tid.as_raw());
                        }

                        threads.insert(tid.as_raw(), thread);
                        inserted = true;
                    }

                    if !inserted {
                        break;
                    }
                }
            }
            AttachMode::NoAttach => {
                let thread = Thread::new(pid, pid, ThreadFlags::EXIT_KILL)?;
                threads.insert(pid.as_raw(), thread);
                active_thread = Some(pid.as_raw());
            }
        }

        let mem = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(format!("/proc/{pid}/mem"))?;

        info!(pid = pid.as_raw(), threads = threads.len(), "tracking process");

        Ok(Self {
            pid,
            mem,
            threads,
            breakpoints: BTreeMap::new(),
            active_thread,
            map_hash: 0,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// The thread currently targeted by default for `step`/`stop`.
    pub fn active_thread(&self) -> Option<Pid> {
        self.active_thread.map(Pid::from_raw)
    }

    pub fn threads(&self) -> impl Iterator<Item = &Thread> {
        self.threads.values()
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    pub fn find_thread(&self, tid: Pid) -> Option<&Thread> {
        self.threads.get(&tid.as_raw())
    }

    pub fn find_thread_mut(&mut self, tid: Pid) -> Option<&mut Thread> {
        self.threads.get_mut(&tid.as_raw())
    }

    /// Read target memory at `address` through `/proc/<pid>/mem`.
    ///
    /// Bytes shadowed by an installed breakpoint are replaced with the
    /// saved originals, so reads never observe trap opcodes.
    pub fn read_memory(&self, address: u64, buffer: &mut [u8]) -> Result<usize> {
        if buffer.is_empty() {
            return Ok(0);
        }

        use std::os::unix::fs::FileExt;

        let n = self
            .mem
            .read_at(buffer, address)
            .map_err(|source| Error::MemoryRead { addr: address, source })?;

        filter_breakpoints(&self.breakpoints, address, &mut buffer[..n]);

        Ok(n)
    }

    /// Write target memory at `address` through `/proc/<pid>/mem`.
    ///
    /// No breakpoint filtering is applied: a write overlapping an installed
    /// breakpoint replaces the trap bytes and leaves the breakpoint's saved
    /// copy stale. Remove and re-add the breakpoint around such writes.
    pub fn write_memory(&self, address: u64, buffer: &[u8]) -> Result<usize> {
        if buffer.is_empty() {
            return Ok(0);
        }

        use std::os::unix::fs::FileExt;

        self.mem
            .write_at(buffer, address)
            .map_err(|source| Error::MemoryWrite { addr: address, source })
    }

    /// Read target memory a word at a time via `PTRACE_PEEKDATA`.
    ///
    /// Unfiltered. A vanished tracee (`ESRCH`) reads as zero bytes.
    pub fn read_memory_ptrace(&self, address: u64, buffer: &mut [u8]) -> Result<usize> {
        const WORD: usize = mem::size_of::<libc::c_long>();

        let mut addr = address;
        let mut total = 0;

        while total < buffer.len() {
            let word = match ptrace::read(self.pid, addr as ptrace::AddressType) {
                Ok(word) => word,
                Err(Errno::ESRCH) => return Ok(0),
                Err(errno) => {
                    return Err(Error::MemoryRead {
                        addr,
                        source: io::Error::from_raw_os_error(errno as i32),
                    })
                }
            };

            let count = (buffer.len() - total).min(WORD);
            buffer[total..total + count].copy_from_slice(&word.to_ne_bytes()[..count]);

            addr += count as u64;
            total += count;
        }

        Ok(total)
    }

    /// Write target memory a word at a time via `PTRACE_POKEDATA`.
    ///
    /// A trailing partial word is read-modify-written. A vanished tracee
    /// (`ESRCH`) on the read half writes zero bytes.
    pub fn write_memory_ptrace(&self, address: u64, buffer: &[u8]) -> Result<usize> {
        const WORD: usize = mem::size_of::<libc::c_long>();

        let mut addr = address;
        let mut total = 0;

        while total < buffer.len() {
            let count = (buffer.len() - total).min(WORD);

            let mut data = [0u8; WORD];
            data[..count].copy_from_slice(&buffer[total..total + count]);

            if count < WORD {
                match ptrace::read(self.pid, addr as ptrace::AddressType) {
                    Ok(word) => data[count..].copy_from_slice(&word.to_ne_bytes()[count..]),
                    Err(Errno::ESRCH) => return Ok(0),
                    Err(errno) => {
                        return Err(Error::MemoryRead {
                            addr,
                            source: io::Error::from_raw_os_error(errno as i32),
                        })
                    }
                }
            }

            let word = libc::c_long::from_ne_bytes(data);
            ptrace::write(self.pid, addr as ptrace::AddressType, word).map_err(|errno| {
                Error::MemoryWrite {
                    addr,
                    source: io::Error::from_raw_os_error(errno as i32),
                }
            })?;

            addr += count as u64;
            total += count;
        }

        Ok(total)
    }

    /// Step the active thread one instruction. With no active thread, any
    /// stopped thread is promoted and stepped.
    pub fn step(&mut self) -> Result<()> {
        if self.active_thread.is_none() {
            self.active_thread = self
                .threads
                .iter()
                .find(|(_, thread)| thread.state == State::Stopped)
                .map(|(&tid, _)| tid);
        }

        let Some(tid) = self.active_thread else {
            internal_error!("no stopped thread to step");
        };

        match self.threads.get_mut(&tid) {
            Some(thread) => thread.step(),
            None => internal_error!("active thread {tid} is not in the thread table"),
        }
    }

    /// Resume every stopped thread.
    pub fn resume(&mut self) -> Result<()> {
        for thread in self.threads.values_mut() {
            if thread.state == State::Stopped {
                thread.resume()?;
            }
        }

        Ok(())
    }

    /// Stop the active thread, else any running thread. One explicit stop
    /// is enough to halt the process: the event pump handles the rest.
    pub fn stop(&self) -> Result<()> {
        if let Some(thread) = self.active_thread.and_then(|tid| self.threads.get(&tid)) {
            if thread.state == State::Running {
                return thread.stop();
            }
        }

        for thread in self.threads.values() {
            if thread.state == State::Running {
                return thread.stop();
            }
        }

        Ok(())
    }

    /// Terminate the target process.
    pub fn kill(&self) -> Result<()> {
        ptrace::kill(self.pid).died_if_esrch("PTRACE_KILL", self.pid)
    }

    /// Detach from the target: restore all breakpoint bytes, then detach
    /// every thread. Best effort; a half-dead tracee does not abort the
    /// teardown.
    pub fn detach(&mut self) {
        let mut breakpoints = mem::take(&mut self.breakpoints);
        for bp in breakpoints.values_mut() {
            if let Err(err) = bp.disable(&*self) {
                warn!(addr = bp.address(), %err, "could not restore breakpoint bytes");
            }
        }

        self.active_thread = None;

        for thread in self.threads.values_mut() {
            thread.detach();
        }
        self.threads.clear();
    }

    /// Install a breakpoint at `address`. Adding at an occupied address is
    /// rejected.
    pub fn add_breakpoint(&mut self, address: u64) -> Result<()> {
        self.add_breakpoint_with_kind(address, BreakpointKind::default())
    }

    pub fn add_breakpoint_with_kind(&mut self, address: u64, kind: BreakpointKind) -> Result<()> {
        if self.breakpoints.contains_key(&address) {
            return Err(Error::BreakpointExists { addr: address });
        }

        let mut bp = Breakpoint::new(address, kind);
        bp.enable(&*self)?;
        self.breakpoints.insert(address, bp);

        Ok(())
    }

    /// Remove the breakpoint at `address`, restoring the original bytes.
    /// No-op for an unknown address.
    pub fn remove_breakpoint(&mut self, address: u64) -> Result<()> {
        let Some(mut bp) = self.breakpoints.remove(&address) else {
            return Ok(());
        };

        bp.disable(&*self)
    }

    pub fn find_breakpoint(&self, address: u64) -> Option<&Breakpoint> {
        self.breakpoints.get(&address)
    }

    pub fn breakpoints(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints.values()
    }

    /// Find a breakpoint whose installed instruction *ends* at `address`:
    /// after the trap executes, the PC sits just past the instruction.
    pub fn search_breakpoint(&self, address: u64) -> Option<&Breakpoint> {
        self.search_breakpoint_key(address)
            .and_then(|addr| self.breakpoints.get(&addr))
    }

    fn search_breakpoint_key(&self, address: u64) -> Option<u64> {
        for size in Breakpoint::MIN_SIZE..=Breakpoint::MAX_SIZE {
            let addr = address.wrapping_sub(size as u64);
            if let Some(bp) = self.breakpoints.get(&addr) {
                if bp.size() == size {
                    return Some(addr);
                }
            }
        }

        None
    }

    /// Memory regions of the target, parsed fresh from procfs.
    pub fn regions(&self) -> Result<Vec<Region>> {
        procfs::regions(self.pid)
    }

    /// Re-hash the target's memory map; true when it changed since the
    /// previous call. Callers use this to avoid re-parsing regions.
    pub fn memory_map_changed(&mut self) -> bool {
        let digest = procfs::hash_regions(self.pid);
        let changed = digest != self.map_hash;
        self.map_hash = digest;
        changed
    }

    /// Wait up to `timeout` for the next debug event, then drain every
    /// pending status change, delivering one [`Event`] per change to
    /// `callback`.
    ///
    /// The callback's [`EventStatus`] directs what happens to the stopped
    /// thread: resume, single-step, or stay stopped. Returns `false` when
    /// the wait timed out, `true` after a drain.
    ///
    /// The pump stops at most the one thread that produced an event; an
    /// all-stop policy (halting every thread on the first event of a pump)
    /// would layer on top of this.
    pub fn next_debug_event<F>(&mut self, timeout: Duration, mut callback: F) -> Result<bool>
    where
        F: FnMut(&Event) -> EventStatus,
    {
        if !wait_for_sigchld(timeout) {
            return Ok(false);
        }

        let mut first_stop = true;

        loop {
            let mut wstatus = 0;
            let tid = unsafe { libc::waitpid(-1, &mut wstatus, libc::WNOHANG | libc::__WALL) };

            if tid == -1 {
                warn!(errno = %Errno::last(), "waitpid failed mid-drain");
                break;
            }

            if tid == 0 {
                break;
            }

            let Some(thread) = self.threads.get_mut(&tid) else {
                debug!(tid, "status change for untraced thread, ignoring");
                continue;
            };

            thread.wstatus = wstatus;
            thread.state = State::Stopped;

            if libc::WIFEXITED(wstatus) {
                debug!(tid, code = libc::WEXITSTATUS(wstatus), "thread exited");

                callback(&self.event(tid, wstatus, EventKind::Exited));

                self.threads.remove(&tid);
                if self.active_thread == Some(tid) {
                    self.active_thread = self.threads.keys().next().copied();
                }
                continue;
            }

            if libc::WIFCONTINUED(wstatus) {
                continue;
            }

            if libc::WIFSIGNALED(wstatus) {
                debug!(tid, sig = libc::WTERMSIG(wstatus), "thread terminated by signal");

                if first_stop {
                    self.active_thread = Some(tid);
                    first_stop = false;
                }

                callback(&self.event(tid, wstatus, EventKind::Terminated));
                continue;
            }

            if libc::WIFSTOPPED(wstatus) {
                if first_stop {
                    self.active_thread = Some(tid);
                    first_stop = false;
                }

                let ip = match self.threads[&tid].instruction_pointer() {
                    Ok(ip) => ip,
                    Err(err) => {
                        warn!(tid, %err, "could not read stopped thread's pc");
                        0
                    }
                };

                trace!(tid, ip = %format_args!("{ip:#x}"), sig = libc::WSTOPSIG(wstatus), "stop");

                let mut event = self.event(tid, wstatus, EventKind::Stopped);

                if is_trap_event(wstatus) {
                    match ptrace::getsiginfo(Pid::from_raw(tid)) {
                        Ok(siginfo) => event.siginfo = Some(siginfo),
                        Err(err) => debug!(tid, %err, "PTRACE_GETSIGINFO failed"),
                    }

                    if is_exit_trace_event(wstatus) {
                        // The thread is about to exit; beyond the heads-up,
                        // this is an ordinary trap event.
                    } else if is_clone_event(wstatus) {
                        self.track_cloned_thread(tid);
                    } else if let Some(addr) = self.search_breakpoint_key(ip) {
                        // The trap byte advanced the PC past the
                        // instruction; rewind onto the breakpoint address.
                        let bp = self.breakpoints.get_mut(&addr).expect("searched key");
                        bp.hit();
                        let size = bp.size() as u64;

                        debug!(tid, addr = %format_args!("{addr:#x}"), "breakpoint hit");

                        if let Err(err) = self.threads[&tid].set_instruction_pointer(ip - size) {
                            warn!(tid, %err, "could not rewind pc over breakpoint");
                        }
                    }
                } else if let Some(bp) = self.breakpoints.get_mut(&ip) {
                    // A breakpoint kind whose instruction does not advance
                    // the PC; no rewind needed.
                    bp.hit();
                    debug!(tid, addr = %format_args!("{ip:#x}"), "breakpoint hit (non-advancing)");
                }

                let verdict = callback(&event);
                self.apply_event_status(tid, verdict, wstatus);
                continue;
            }

            // Every waitpid status is one of the classes above.
            internal_error!("unclassifiable wait status {wstatus:#x} for thread {tid}");
        }

        Ok(true)
    }

    fn event(&self, tid: i32, wstatus: i32, kind: EventKind) -> Event {
        Event {
            siginfo: None,
            pid: self.pid,
            tid: Pid::from_raw(tid),
            status: wstatus,
            kind,
        }
    }

    /// A clone was reported: adopt the new thread (already trace-stopped),
    /// record it as stopped, and set it running.
    fn track_cloned_thread(&mut self, tid: i32) {
        let message = match ptrace::getevent(Pid::from_raw(tid)) {
            Ok(message) => message,
            Err(err) => {
                debug!(tid, %err, "PTRACE_GETEVENTMSG failed for clone event");
                return;
            }
        };

        let new_tid = Pid::from_raw(message as u32 as i32);

        match Thread::new(self.pid, new_tid, ThreadFlags::EXIT_KILL) {
            Ok(mut thread) => {
                info!(tid = new_tid.as_raw(), "tracking cloned thread");

                thread.wstatus = 0;
                if let Err(err) = thread.resume() {
                    warn!(tid = new_tid.as_raw(), %err, "could not start cloned thread");
                }

                self.threads.insert(new_tid.as_raw(), thread);
            }
            Err(err) => warn!(tid = new_tid.as_raw(), %err, "could not adopt cloned thread"),
        }
    }

    /// Act on the callback's verdict for a stopped thread. Continuation
    /// failures are logged, not raised: the drain always runs to
    /// completion.
    fn apply_event_status(&mut self, tid: i32, verdict: EventStatus, wstatus: i32) {
        let Some(thread) = self.threads.get_mut(&tid) else {
            return;
        };

        let res = match verdict {
            EventStatus::Stop => Ok(()),
            EventStatus::Continue | EventStatus::ContinueBreakPoint | EventStatus::NextHandler => {
                thread.resume()
            }
            EventStatus::ContinueStep => thread.step(),
            EventStatus::ExceptionNotHandled => {
                // Re-deliver the stopping signal, except for trap stops
                // (the trap was ours, not the tracee's).
                let signal = if is_trap_event(wstatus) {
                    None
                } else {
                    Signal::try_from(libc::WSTOPSIG(wstatus)).ok()
                };

                match signal {
                    Some(signal) => thread.resume_with_signal(signal),
                    None => thread.resume(),
                }
            }
        };

        if let Err(err) = res {
            warn!(tid, %err, "could not apply event verdict");
        }
    }
}

impl MemoryAccess for Process {
    fn read_memory(&self, addr: u64, buf: &mut [u8]) -> Result<usize> {
        Process::read_memory(self, addr, buf)
    }

    fn write_memory(&self, addr: u64, buf: &[u8]) -> Result<usize> {
        Process::write_memory(self, addr, buf)
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Replace any bytes of `buffer` that are shadowed by an installed
/// breakpoint with the saved original bytes.
fn filter_breakpoints(breakpoints: &BTreeMap<u64, Breakpoint>, address: u64, buffer: &mut [u8]) {
    let end = address.saturating_add(buffer.len() as u64);

    for (&bp_addr, bp) in breakpoints {
        for (i, &saved) in bp.saved_bytes().iter().enumerate() {
            let byte_addr = bp_addr.wrapping_add(i as u64);
            if byte_addr >= address && byte_addr < end {
                buffer[(byte_addr - address) as usize] = saved;
            }
        }
    }
}

/// Block (if not already blocked) and wait up to `timeout` for `SIGCHLD`.
fn wait_for_sigchld(timeout: Duration) -> bool {
    let mut mask = unsafe { mem::zeroed::<libc::sigset_t>() };

    // SIGCHLD must be blocked for sigtimedwait to claim it; the session
    // arranges that, but re-asserting here keeps the pump self-contained.
    unsafe {
        libc::sigemptyset(&mut mask);
        libc::sigaddset(&mut mask, libc::SIGCHLD);
        libc::sigprocmask(libc::SIG_BLOCK, &mask, ptr::null_mut());
    }

    let ts = libc::timespec {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_nsec: timeout.subsec_nanos() as libc::c_long,
    };

    let sig = unsafe { libc::sigtimedwait(&mask, ptr::null_mut(), &ts) };
    sig == libc::SIGCHLD
}

fn is_clone_event(status: i32) -> bool {
    status >> 8 == (libc::SIGTRAP | (libc::PTRACE_EVENT_CLONE << 8))
}

fn is_exit_trace_event(status: i32) -> bool {
    status >> 8 == (libc::SIGTRAP | (libc::PTRACE_EVENT_EXIT << 8))
}

fn is_trap_event(status: i32) -> bool {
    libc::WIFSTOPPED(status) && libc::WSTOPSIG(status) == libc::SIGTRAP
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breakpoint::BreakpointKind;

    fn installed(addr: u64, kind: BreakpointKind, saved: &[u8]) -> Breakpoint {
        struct Flat(std::cell::RefCell<Vec<u8>>, u64);

        impl MemoryAccess for Flat {
            fn read_memory(&self, addr: u64, buf: &mut [u8]) -> Result<usize> {
                let off = (addr - self.1) as usize;
                buf.copy_from_slice(&self.0.borrow()[off..off + buf.len()]);
                Ok(buf.len())
            }

            fn write_memory(&self, addr: u64, buf: &[u8]) -> Result<usize> {
                let off = (addr - self.1) as usize;
                self.0.borrow_mut()[off..off + buf.len()].copy_from_slice(buf);
                Ok(buf.len())
            }
        }

        let mem = Flat(std::cell::RefCell::new(saved.to_vec()), addr);
        let mut bp = Breakpoint::new(addr, kind);
        bp.enable(&mem).unwrap();
        bp
    }

    #[test]
    fn filter_replaces_shadowed_bytes() {
        let mut bps = BTreeMap::new();
        bps.insert(0x1004, installed(0x1004, BreakpointKind::Int3, &[0xaa]));

        let mut buffer = [0xccu8; 8];
        filter_breakpoints(&bps, 0x1000, &mut buffer);

        assert_eq!(buffer, [0xcc, 0xcc, 0xcc, 0xcc, 0xaa, 0xcc, 0xcc, 0xcc]);
    }

    #[test]
    fn filter_handles_straddling_reads() {
        let mut bps = BTreeMap::new();
        bps.insert(0x0fff, installed(0x0fff, BreakpointKind::Ud2, &[0x11, 0x22]));

        // Read starts one byte into the two-byte breakpoint: only the
        // overlapping byte is rewritten.
        let mut buffer = [0u8; 4];
        filter_breakpoints(&bps, 0x1000, &mut buffer);
        assert_eq!(buffer, [0x22, 0, 0, 0]);

        // Read ends one byte into the breakpoint.
        let mut buffer = [0u8; 4];
        filter_breakpoints(&bps, 0x0ffc, &mut buffer);
        assert_eq!(buffer, [0, 0, 0, 0x11]);
    }

    #[test]
    fn filter_leaves_untouched_reads_alone() {
        let mut bps = BTreeMap::new();
        bps.insert(0x2000, installed(0x2000, BreakpointKind::Int3, &[0x55]));

        let mut buffer = [1u8, 2, 3, 4];
        filter_breakpoints(&bps, 0x3000, &mut buffer);
        assert_eq!(buffer, [1, 2, 3, 4]);
    }

    #[test]
    fn trap_status_classifiers() {
        // WIFSTOPPED statuses encode `(sig << 8) | 0x7f`.
        let trap = (libc::SIGTRAP << 8) | 0x7f;
        assert!(is_trap_event(trap));
        assert!(!is_clone_event(trap));
        assert!(!is_exit_trace_event(trap));

        let clone = ((libc::SIGTRAP | (libc::PTRACE_EVENT_CLONE << 8)) << 8) | 0x7f;
        assert!(is_clone_event(clone));
        assert!(is_trap_event(clone));
        assert!(!is_exit_trace_event(clone));

        let exit = ((libc::SIGTRAP | (libc::PTRACE_EVENT_EXIT << 8)) << 8) | 0x7f;
        assert!(is_exit_trace_event(exit));
        assert!(!is_clone_event(exit));

        let sigstop = (libc::SIGSTOP << 8) | 0x7f;
        assert!(!is_trap_event(sigstop));

        // An exited status is nothing of the sort.
        let exited = 0;
        assert!(!is_trap_event(exited));
        assert!(libc::WIFEXITED(exited));
    }
}
