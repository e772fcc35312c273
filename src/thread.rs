//! Per-thread tracing state and register access.
//!
//! A [`Thread`] wraps one traced task: a small Running/Stopped state machine
//! over the ptrace continuation requests, plus typed access to the thread's
//! register banks (general-purpose, extended state, hardware debug
//! registers, segment bases).

use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tracing::trace;

use crate::context::{
    Context, Registers, UserRegsX86, UserRegsX86_64, GP_BUFFER_SIZE, XSAVE_BUFFER_SIZE, XsaveImage,
};
use crate::error::{Error, Result, ResultExt};

#[cfg(target_arch = "x86")]
use crate::context::RegisterId;

bitflags::bitflags! {
    /// Construction behavior for a [`Thread`].
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub(crate) struct ThreadFlags: u32 {
        /// Issue `PTRACE_ATTACH`; without this the task is assumed to be
        /// already traced and stopping (a fresh spawn or a reported clone).
        const ATTACH = 1 << 0;

        /// Ask the kernel to kill the tracee if the tracer exits.
        const EXIT_KILL = 1 << 1;
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum State {
    Running,
    Stopped,
}

/// Linux constants defined in `include/uapi/linux/elf.h`.
const NT_PRSTATUS: libc::c_int = 0x1;
#[cfg(target_arch = "x86")]
const NT_PRFPREG: libc::c_int = 0x2;
const NT_X86_XSTATE: libc::c_int = 0x202;

/// One traced task of the target process.
///
/// Operations that submit a continuation (`step`, `resume`) require the
/// thread to be Stopped and leave it Running; `stop` and `kill` require
/// Running. Register access requires Stopped. Violations are programming
/// errors, guarded by debug assertions.
#[derive(Debug)]
pub struct Thread {
    pub(crate) pid: Pid,
    pub(crate) tid: Pid,
    pub(crate) wstatus: i32,
    pub(crate) state: State,
    is_64_bit: bool,
    detached: bool,
}

impl Thread {
    /// Attach to (or adopt) `tid` and synchronously wait for its initial
    /// stop, then set the trace options and detect the thread's bitness.
    pub(crate) fn new(pid: Pid, tid: Pid, flags: ThreadFlags) -> Result<Self> {
        if flags.contains(ThreadFlags::ATTACH) {
            ptrace::attach(tid).map_err(|source| Error::Attach { pid: tid, source })?;
        }

        let mut thread = Self {
            pid,
            tid,
            wstatus: 0,
            state: State::Running,
            is_64_bit: false,
            detached: false,
        };

        thread.wait()?;

        // A task that died before (or instead of) stopping has no options
        // to set and no registers to size; keep it so the caller can
        // inspect the terminal status.
        if libc::WIFSTOPPED(thread.wstatus) {
            let mut options = ptrace::Options::PTRACE_O_TRACECLONE
                | ptrace::Options::PTRACE_O_TRACEFORK
                | ptrace::Options::PTRACE_O_TRACEEXIT;
            if flags.contains(ThreadFlags::EXIT_KILL) {
                options |= ptrace::Options::PTRACE_O_EXITKILL;
            }

            ptrace::setoptions(tid, options).died_if_esrch("PTRACE_SETOPTIONS", tid)?;

            thread.is_64_bit = thread.detect_64_bit()?;
        }

        Ok(thread)
    }

    pub fn tid(&self) -> Pid {
        self.tid
    }

    /// The raw `wait(2)` status of the last observed state change.
    pub fn wait_status(&self) -> i32 {
        self.wstatus
    }

    /// Bitness of the thread, detected from its register-set size.
    pub fn is_64_bit(&self) -> bool {
        self.is_64_bit
    }

    /// One synchronous wait for this thread's next state change.
    pub fn wait(&mut self) -> Result<()> {
        debug_assert_eq!(self.state, State::Running);

        let mut status = 0;
        let res = unsafe { libc::waitpid(self.tid.as_raw(), &mut status, libc::__WALL) };
        if res == -1 {
            return Err(Error::Wait {
                tid: self.tid,
                source: Errno::last(),
            });
        }

        self.wstatus = status;
        self.state = State::Stopped;
        Ok(())
    }

    /// Detach the kernel tracing relation. Idempotent; errors are ignored
    /// because the tracee may already be gone.
    pub fn detach(&mut self) {
        if self.detached {
            return;
        }

        if let Err(err) = ptrace::detach(self.tid, None) {
            trace!(tid = self.tid.as_raw(), %err, "detach failed, tracee likely gone");
        }

        self.detached = true;
    }

    /// Execute one instruction. A debug event follows when the thread stops
    /// again.
    pub fn step(&mut self) -> Result<()> {
        debug_assert_eq!(self.state, State::Stopped);

        ptrace::step(self.tid, None).died_if_esrch("PTRACE_SINGLESTEP", self.tid)?;
        self.state = State::Running;
        Ok(())
    }

    /// Resume execution.
    pub fn resume(&mut self) -> Result<()> {
        debug_assert_eq!(self.state, State::Stopped);

        ptrace::cont(self.tid, None).died_if_esrch("PTRACE_CONT", self.tid)?;
        self.state = State::Running;
        Ok(())
    }

    /// Resume execution, delivering `signal` to the tracee.
    pub fn resume_with_signal(&mut self, signal: Signal) -> Result<()> {
        debug_assert_eq!(self.state, State::Stopped);

        ptrace::cont(self.tid, signal).died_if_esrch("PTRACE_CONT", self.tid)?;
        self.state = State::Running;
        Ok(())
    }

    /// Ask a running thread to stop. The stop is asynchronous: it completes
    /// with a debug event carrying `SIGSTOP`.
    pub fn stop(&self) -> Result<()> {
        debug_assert_eq!(self.state, State::Running);
        self.tgkill(libc::SIGSTOP)
    }

    /// Terminate the thread.
    pub fn kill(&self) -> Result<()> {
        debug_assert_eq!(self.state, State::Running);
        self.tgkill(libc::SIGKILL)
    }

    fn tgkill(&self, signal: libc::c_int) -> Result<()> {
        let res = unsafe { libc::tgkill(self.pid.as_raw(), self.tid.as_raw(), signal) };
        Errno::result(res)
            .map(drop)
            .died_if_esrch("tgkill", self.tid)
    }

    pub fn is_exited(&self) -> bool {
        debug_assert_eq!(self.state, State::Stopped);
        libc::WIFEXITED(self.wstatus)
    }

    pub fn is_signaled(&self) -> bool {
        debug_assert_eq!(self.state, State::Stopped);
        libc::WIFSIGNALED(self.wstatus)
    }

    pub fn is_stopped(&self) -> bool {
        debug_assert_eq!(self.state, State::Stopped);
        libc::WIFSTOPPED(self.wstatus)
    }

    pub fn is_continued(&self) -> bool {
        debug_assert_eq!(self.state, State::Stopped);
        libc::WIFCONTINUED(self.wstatus)
    }

    /// Exit code, for an exited thread.
    pub fn exit_status(&self) -> i32 {
        debug_assert_eq!(self.state, State::Stopped);
        libc::WEXITSTATUS(self.wstatus)
    }

    /// Terminating signal number, for a signaled thread.
    pub fn signal_status(&self) -> i32 {
        debug_assert_eq!(self.state, State::Stopped);
        libc::WTERMSIG(self.wstatus)
    }

    /// Stop signal number, for a stopped thread.
    pub fn stop_status(&self) -> i32 {
        debug_assert_eq!(self.state, State::Stopped);
        libc::WSTOPSIG(self.wstatus)
    }

    /// Snapshot the thread's full register state.
    pub fn context(&self) -> Result<Context> {
        let mut ctx = Context::new_64();
        self.get_context(&mut ctx)?;
        Ok(ctx)
    }

    /// Fill `ctx` from the thread's register banks.
    pub fn get_context(&self, ctx: &mut Context) -> Result<()> {
        debug_assert_eq!(self.state, State::Stopped);

        ctx.is_64_bit = self.is_64_bit;
        ctx.populated = true;

        self.get_registers(ctx)?;
        self.get_xstate(ctx)?;
        self.get_debug_registers(ctx)?;
        self.get_segment_bases(ctx)?;

        Ok(())
    }

    /// Commit `ctx` back to the thread's register banks.
    pub fn set_context(&self, ctx: &Context) -> Result<()> {
        debug_assert_eq!(self.state, State::Stopped);

        self.set_registers(ctx)?;
        self.set_xstate(ctx)?;
        self.set_debug_registers(ctx)?;

        Ok(())
    }

    fn reg_err(&self, op: &'static str) -> impl FnOnce(Errno) -> Error + '_ {
        move |source| Error::RegisterAccess {
            op,
            tid: self.tid,
            source,
        }
    }

    /// Distinguish a 64-bit from a 32-bit thread by the length the kernel
    /// reports for its `NT_PRSTATUS` register set.
    fn detect_64_bit(&self) -> Result<bool> {
        debug_assert_eq!(self.state, State::Stopped);

        let mut buffer = [0u8; GP_BUFFER_SIZE];
        let len = self
            .getregset(NT_PRSTATUS, buffer.as_mut_ptr().cast(), buffer.len())
            .map_err(self.reg_err("PTRACE_GETREGSET(NT_PRSTATUS)"))?;

        match len {
            l if l == std::mem::size_of::<UserRegsX86_64>() => Ok(true),
            l if l == std::mem::size_of::<UserRegsX86>() => Ok(false),
            other => internal_error!("unknown register set length: {other}"),
        }
    }

    fn getregset(&self, set: libc::c_int, buf: *mut libc::c_void, len: usize) -> nix::Result<usize> {
        let mut iov = libc::iovec {
            iov_base: buf,
            iov_len: len,
        };

        // SAFETY: the kernel fills at most `iov_len` bytes of `buf` and
        // reports the written length back through the iovec.
        let res = unsafe {
            libc::ptrace(
                libc::PTRACE_GETREGSET,
                self.tid.as_raw(),
                set as usize,
                &mut iov as *mut libc::iovec,
            )
        };

        Errno::result(res).map(|_| iov.iov_len)
    }

    fn setregset(&self, set: libc::c_int, buf: *const libc::c_void, len: usize) -> nix::Result<()> {
        let mut iov = libc::iovec {
            iov_base: buf as *mut libc::c_void,
            iov_len: len,
        };

        // SAFETY: the kernel reads at most `iov_len` bytes from `buf`.
        let res = unsafe {
            libc::ptrace(
                libc::PTRACE_SETREGSET,
                self.tid.as_raw(),
                set as usize,
                &mut iov as *mut libc::iovec,
            )
        };

        Errno::result(res).map(drop)
    }

    /// GP bank, 64-bit debugger: `PTRACE_GETREGS` always yields the 64-bit
    /// layout, even for a 32-bit thread. (`NT_PRSTATUS` would mis-size for
    /// a 32-bit thread, so it is reserved for bitness detection here.)
    #[cfg(target_arch = "x86_64")]
    fn get_registers(&self, ctx: &mut Context) -> Result<()> {
        let mut gp = UserRegsX86_64::default();

        // SAFETY: `UserRegsX86_64` mirrors the kernel's x86-64
        // `user_regs_struct` layout (statically size-asserted).
        let res = unsafe {
            libc::ptrace(
                libc::PTRACE_GETREGS,
                self.tid.as_raw(),
                0usize,
                &mut gp as *mut UserRegsX86_64,
            )
        };
        Errno::result(res).map_err(self.reg_err("PTRACE_GETREGS"))?;

        ctx.regs = Registers::X86_64 { gp, debug: [0; 8] };
        Ok(())
    }

    /// GP bank, 32-bit debugger: `NT_PRSTATUS` with an iovec sized for the
    /// thread's bitness.
    #[cfg(target_arch = "x86")]
    fn get_registers(&self, ctx: &mut Context) -> Result<()> {
        if self.is_64_bit {
            let mut gp = UserRegsX86_64::default();
            self.getregset(
                NT_PRSTATUS,
                (&mut gp as *mut UserRegsX86_64).cast(),
                std::mem::size_of::<UserRegsX86_64>(),
            )
            .map_err(self.reg_err("PTRACE_GETREGSET(NT_PRSTATUS)"))?;
            ctx.regs = Registers::X86_64 { gp, debug: [0; 8] };
        } else {
            let mut gp = UserRegsX86::default();
            self.getregset(
                NT_PRSTATUS,
                (&mut gp as *mut UserRegsX86).cast(),
                std::mem::size_of::<UserRegsX86>(),
            )
            .map_err(self.reg_err("PTRACE_GETREGSET(NT_PRSTATUS)"))?;
            ctx.regs = Registers::X86 {
                gp,
                debug: [0; 8],
                fs_base: 0,
                gs_base: 0,
            };
        }

        Ok(())
    }

    #[cfg(target_arch = "x86_64")]
    fn set_registers(&self, ctx: &Context) -> Result<()> {
        let gp = match &ctx.regs {
            Registers::X86_64 { gp, .. } => gp,
            Registers::X86 { .. } => {
                internal_error!("32-bit register storage on a 64-bit debugger")
            }
        };

        // SAFETY: see `get_registers`; the kernel reads the struct.
        let res = unsafe {
            libc::ptrace(
                libc::PTRACE_SETREGS,
                self.tid.as_raw(),
                0usize,
                gp as *const UserRegsX86_64,
            )
        };
        Errno::result(res).map_err(self.reg_err("PTRACE_SETREGS"))?;

        Ok(())
    }

    #[cfg(target_arch = "x86")]
    fn set_registers(&self, ctx: &Context) -> Result<()> {
        match &ctx.regs {
            Registers::X86_64 { gp, .. } => self
                .setregset(
                    NT_PRSTATUS,
                    (gp as *const UserRegsX86_64).cast(),
                    std::mem::size_of::<UserRegsX86_64>(),
                )
                .map_err(self.reg_err("PTRACE_SETREGSET(NT_PRSTATUS)")),
            Registers::X86 { gp, .. } => self
                .setregset(
                    NT_PRSTATUS,
                    (gp as *const UserRegsX86).cast(),
                    std::mem::size_of::<UserRegsX86>(),
                )
                .map_err(self.reg_err("PTRACE_SETREGSET(NT_PRSTATUS)")),
        }
    }

    /// Extended-state bank via `NT_X86_XSTATE`, decoded into the context's
    /// sub-banks. The raw image is preserved on the context so a later
    /// write-back does not clobber components we do not model.
    #[cfg(target_arch = "x86_64")]
    fn get_xstate(&self, ctx: &mut Context) -> Result<()> {
        let mut image = XsaveImage::default();
        let len = self
            .getregset(
                NT_X86_XSTATE,
                image.data.as_mut_ptr().cast(),
                XSAVE_BUFFER_SIZE,
            )
            .map_err(self.reg_err("PTRACE_GETREGSET(NT_X86_XSTATE)"))?;

        ctx.decode_xsave(&image.data[..len]);
        ctx.xsave = image;
        ctx.xsave_len = len;
        Ok(())
    }

    /// 32-bit debugger path: modern `NT_X86_XSTATE`, with a fallback to the
    /// legacy FP-extended request on kernels (or CPUs) without xsave.
    #[cfg(target_arch = "x86")]
    fn get_xstate(&self, ctx: &mut Context) -> Result<()> {
        const PTRACE_GETFPXREGS: libc::c_uint = 18;

        let mut image = XsaveImage::default();
        match self.getregset(
            NT_X86_XSTATE,
            image.data.as_mut_ptr().cast(),
            XSAVE_BUFFER_SIZE,
        ) {
            Ok(len) => {
                ctx.decode_xsave(&image.data[..len]);
                ctx.xsave = image;
                ctx.xsave_len = len;
                Ok(())
            }
            Err(_) => {
                let mut fx = [0u8; 512];
                // SAFETY: the kernel fills the 512-byte FXSAVE image.
                let res = unsafe {
                    libc::ptrace(
                        PTRACE_GETFPXREGS,
                        self.tid.as_raw(),
                        0usize,
                        fx.as_mut_ptr(),
                    )
                };
                Errno::result(res).map_err(self.reg_err("PTRACE_GETFPXREGS"))?;

                ctx.decode_fxsave(&fx);
                ctx.xsave.data[..512].copy_from_slice(&fx);
                ctx.xsave_len = 0;
                Ok(())
            }
        }
    }

    /// Re-encode the decoded banks into the preserved raw image and write
    /// it back.
    fn set_xstate(&self, ctx: &Context) -> Result<()> {
        if ctx.xsave_len == 0 {
            // No modern image was retrieved; nothing to write back.
            return Ok(());
        }

        let mut image = ctx.xsave;
        ctx.encode_xsave(&mut image.data[..ctx.xsave_len]);

        self.setregset(
            NT_X86_XSTATE,
            image.data.as_ptr().cast(),
            ctx.xsave_len,
        )
        .map_err(self.reg_err("PTRACE_SETREGSET(NT_X86_XSTATE)"))
    }

    /// Debug-register bank, one user-area word per slot.
    fn get_debug_registers(&self, ctx: &mut Context) -> Result<()> {
        for i in 0..8 {
            let value = self.peek_user(debugreg_offset(i))?;

            match &mut ctx.regs {
                Registers::X86_64 { debug, .. } => debug[i] = value,
                Registers::X86 { debug, .. } => debug[i] = value as u32,
            }
        }

        Ok(())
    }

    fn set_debug_registers(&self, ctx: &Context) -> Result<()> {
        for i in 0..8 {
            // Slots 4 and 5 are reserved; the kernel refuses writes.
            if i == 4 || i == 5 {
                continue;
            }

            let value = match &ctx.regs {
                Registers::X86_64 { debug, .. } => debug[i],
                Registers::X86 { debug, .. } => u64::from(debug[i]),
            };

            self.poke_user(debugreg_offset(i), value)?;
        }

        Ok(())
    }

    /// On a 64-bit debugger, FS/GS bases arrive with the GP bank.
    #[cfg(target_arch = "x86_64")]
    fn get_segment_bases(&self, _ctx: &mut Context) -> Result<()> {
        Ok(())
    }

    /// On a 32-bit debugger, translate the FS/GS selectors of a 32-bit
    /// thread into linear bases via the thread's GDT entries.
    #[cfg(target_arch = "x86")]
    fn get_segment_bases(&self, ctx: &mut Context) -> Result<()> {
        if ctx.is_64_bit() {
            return Ok(());
        }

        let fs = ctx.get(RegisterId::Fs).map_or(0, |r| r.get::<u16>());
        let gs = ctx.get(RegisterId::Gs).map_or(0, |r| r.get::<u16>());

        let fs_base = self.segment_base(fs)?;
        let gs_base = self.segment_base(gs)?;

        if let Registers::X86 {
            fs_base: fb,
            gs_base: gb,
            ..
        } = &mut ctx.regs
        {
            *fb = fs_base;
            *gb = gs_base;
        }

        Ok(())
    }

    #[cfg(target_arch = "x86")]
    fn segment_base(&self, selector: u16) -> Result<u32> {
        const PTRACE_GET_THREAD_AREA: libc::c_uint = 25;
        const LDT_ENTRY_SIZE: u16 = 8;

        // Mirrors `struct user_desc` from asm/ldt.h; only the base matters
        // here.
        #[repr(C)]
        #[derive(Default)]
        struct UserDesc {
            entry_number: u32,
            base_addr: u32,
            limit: u32,
            flags: u32,
        }

        if selector == 0 {
            return Ok(0);
        }

        // An LDT selector does not name a thread-area entry.
        if selector & 0x4 != 0 {
            return Ok(0);
        }

        let mut desc = UserDesc::default();

        // SAFETY: the kernel fills the descriptor for the given GDT index.
        let res = unsafe {
            libc::ptrace(
                PTRACE_GET_THREAD_AREA,
                self.tid.as_raw(),
                (selector / LDT_ENTRY_SIZE) as usize,
                &mut desc as *mut UserDesc,
            )
        };
        Errno::result(res).map_err(self.reg_err("PTRACE_GET_THREAD_AREA"))?;

        Ok(desc.base_addr)
    }

    /// Read the program counter without a full context round-trip.
    #[cfg(target_arch = "x86_64")]
    pub fn instruction_pointer(&self) -> Result<u64> {
        debug_assert_eq!(self.state, State::Stopped);
        self.peek_user(rip_user_offset())
    }

    /// Write the program counter without a full context round-trip.
    #[cfg(target_arch = "x86_64")]
    pub fn set_instruction_pointer(&self, ip: u64) -> Result<()> {
        debug_assert_eq!(self.state, State::Stopped);
        self.poke_user(rip_user_offset(), ip)
    }

    /// On a 32-bit debugger, user-area words are 32 bits and would truncate
    /// a 64-bit thread's PC; go through the full register set instead.
    #[cfg(target_arch = "x86")]
    pub fn instruction_pointer(&self) -> Result<u64> {
        let mut ctx = Context::new_64();
        self.get_context(&mut ctx)?;

        match ctx.get(RegisterId::Xip) {
            Some(r) => Ok(r.get::<u64>()),
            None => internal_error!("context without an instruction pointer"),
        }
    }

    #[cfg(target_arch = "x86")]
    pub fn set_instruction_pointer(&self, ip: u64) -> Result<()> {
        let mut ctx = Context::new_64();
        self.get_context(&mut ctx)?;

        match ctx.get(RegisterId::Xip) {
            Some(mut r) => r.set(ip),
            None => internal_error!("context without an instruction pointer"),
        }

        self.set_context(&ctx)
    }

    fn peek_user(&self, off: u64) -> Result<u64> {
        // A successful peek may legitimately return -1, so the only failure
        // signal is errno.
        Errno::clear();

        // SAFETY: `off` is not used as a pointer by the kernel; it indexes
        // the virtual `user` area.
        let data = unsafe {
            libc::ptrace(libc::PTRACE_PEEKUSER, self.tid.as_raw(), off, 0usize)
        };

        if data == -1 {
            let errno = Errno::last_raw();
            if errno != 0 {
                return Err(Error::RegisterAccess {
                    op: "PTRACE_PEEKUSER",
                    tid: self.tid,
                    source: Errno::from_raw(errno),
                });
            }
        }

        Ok(data as u64)
    }

    fn poke_user(&self, off: u64, data: u64) -> Result<()> {
        // SAFETY: as in `peek_user`, `off` indexes the virtual user area.
        let res = unsafe {
            libc::ptrace(libc::PTRACE_POKEUSER, self.tid.as_raw(), off, data)
        };

        Errno::result(res)
            .map(drop)
            .map_err(self.reg_err("PTRACE_POKEUSER"))
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        self.detach();
    }
}

fn debugreg_offset(i: usize) -> u64 {
    (memoffset::offset_of!(libc::user, u_debugreg) + i * std::mem::size_of::<libc::c_ulong>())
        as u64
}

#[cfg(target_arch = "x86_64")]
fn rip_user_offset() -> u64 {
    (memoffset::offset_of!(libc::user, regs) + memoffset::offset_of!(libc::user_regs_struct, rip))
        as u64
}
