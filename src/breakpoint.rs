//! Software breakpoints: a short trap instruction patched over target
//! memory, with the original bytes saved for transparent read-back and
//! restore.

use std::io;

use crate::error::{Error, Result};

/// The minimum capability a breakpoint needs from its owning process.
///
/// Keeping this a trait (instead of a back-pointer to the full process)
/// avoids an ownership cycle and lets the byte-patching logic be exercised
/// against a mock target.
pub trait MemoryAccess {
    /// Read bytes at `addr`, returning how many were read.
    fn read_memory(&self, addr: u64, buf: &mut [u8]) -> Result<usize>;

    /// Write bytes at `addr`, returning how many were written.
    fn write_memory(&self, addr: u64, buf: &[u8]) -> Result<usize>;
}

/// The instruction patched in at the breakpoint address.
///
/// All of these raise a signal when executed; they differ in which signal,
/// whether the instruction advances the PC, and how detectable they are by
/// anti-debug code.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum BreakpointKind {
    /// `int3`, the conventional choice.
    #[default]
    Int3,
    /// `int1` (icebp).
    Int1,
    /// `hlt`, privileged in user mode.
    Hlt,
    /// `cli`, privileged in user mode.
    Cli,
    /// `sti`, privileged in user mode.
    Sti,
    /// `insb`, privileged by IOPL.
    Insb,
    /// `insd`, privileged by IOPL.
    Insd,
    /// `outsb`, privileged by IOPL.
    Outsb,
    /// `outsd`, privileged by IOPL.
    Outsd,
    /// `ud2`, guaranteed undefined opcode.
    Ud2,
    /// `ud0`, undefined opcode.
    Ud0,
}

impl BreakpointKind {
    /// The instruction bytes for this breakpoint kind.
    pub fn bytes(self) -> &'static [u8] {
        match self {
            BreakpointKind::Int3 => &[0xcc],
            BreakpointKind::Int1 => &[0xf1],
            BreakpointKind::Hlt => &[0xf4],
            BreakpointKind::Cli => &[0xfa],
            BreakpointKind::Sti => &[0xfb],
            BreakpointKind::Insb => &[0x6c],
            BreakpointKind::Insd => &[0x6d],
            BreakpointKind::Outsb => &[0x6e],
            BreakpointKind::Outsd => &[0x6f],
            BreakpointKind::Ud2 => &[0x0f, 0x0b],
            BreakpointKind::Ud0 => &[0x0f, 0xff],
        }
    }
}

/// One software breakpoint.
///
/// While enabled, target memory at `[address, address + size)` holds the
/// trap instruction and `saved` holds the original bytes; while disabled,
/// the target holds `saved`.
#[derive(Clone, Debug)]
pub struct Breakpoint {
    address: u64,
    kind: BreakpointKind,
    saved: [u8; Self::MAX_SIZE],
    installed: [u8; Self::MAX_SIZE],
    size: usize,
    enabled: bool,
    hit_count: u64,
}

impl Breakpoint {
    /// Smallest trap instruction in the kind table.
    pub const MIN_SIZE: usize = 1;

    /// Largest trap instruction in the kind table.
    pub const MAX_SIZE: usize = 2;

    /// A disabled breakpoint at `address`. Nothing is written to the target
    /// until [`enable`](Self::enable).
    pub fn new(address: u64, kind: BreakpointKind) -> Self {
        let mut installed = [0u8; Self::MAX_SIZE];
        let bytes = kind.bytes();
        installed[..bytes.len()].copy_from_slice(bytes);

        Self {
            address,
            kind,
            saved: [0; Self::MAX_SIZE],
            installed,
            size: bytes.len(),
            enabled: false,
            hit_count: 0,
        }
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn kind(&self) -> BreakpointKind {
        self.kind
    }

    /// Width of the installed instruction in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn hit_count(&self) -> u64 {
        self.hit_count
    }

    /// The original target bytes shadowed by the trap instruction.
    pub fn saved_bytes(&self) -> &[u8] {
        &self.saved[..self.size]
    }

    /// The trap instruction bytes.
    pub fn installed_bytes(&self) -> &[u8] {
        &self.installed[..self.size]
    }

    /// Back up the original bytes and patch in the trap instruction.
    /// No-op when already enabled.
    pub fn enable(&mut self, mem: &dyn MemoryAccess) -> Result<()> {
        if self.enabled {
            return Ok(());
        }

        let n = mem.read_memory(self.address, &mut self.saved[..self.size])?;
        if n < self.size {
            return Err(short_io(self.address, self.size, n, true));
        }

        let n = mem.write_memory(self.address, &self.installed[..self.size])?;
        if n < self.size {
            return Err(short_io(self.address, self.size, n, false));
        }

        self.enabled = true;
        Ok(())
    }

    /// Restore the original bytes. No-op when not enabled.
    pub fn disable(&mut self, mem: &dyn MemoryAccess) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let n = mem.write_memory(self.address, &self.saved[..self.size])?;
        if n < self.size {
            return Err(short_io(self.address, self.size, n, false));
        }

        self.enabled = false;
        Ok(())
    }

    /// Record one hit.
    pub fn hit(&mut self) {
        self.hit_count += 1;
    }
}

fn short_io(addr: u64, want: usize, got: usize, read: bool) -> Error {
    let source = io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("{got} of {want} bytes"),
    );

    if read {
        Error::MemoryRead { addr, source }
    } else {
        Error::MemoryWrite { addr, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    /// A tiny fake target: a flat page of memory starting at `base`.
    struct MockMemory {
        base: u64,
        bytes: RefCell<Vec<u8>>,
    }

    impl MockMemory {
        fn new(base: u64, bytes: &[u8]) -> Self {
            Self {
                base,
                bytes: RefCell::new(bytes.to_vec()),
            }
        }

        fn at(&self, addr: u64, n: usize) -> Vec<u8> {
            let off = (addr - self.base) as usize;
            self.bytes.borrow()[off..off + n].to_vec()
        }
    }

    impl MemoryAccess for MockMemory {
        fn read_memory(&self, addr: u64, buf: &mut [u8]) -> Result<usize> {
            let off = (addr - self.base) as usize;
            let mem = self.bytes.borrow();
            let n = buf.len().min(mem.len() - off);
            buf[..n].copy_from_slice(&mem[off..off + n]);
            Ok(n)
        }

        fn write_memory(&self, addr: u64, buf: &[u8]) -> Result<usize> {
            let off = (addr - self.base) as usize;
            let mut mem = self.bytes.borrow_mut();
            mem[off..off + buf.len()].copy_from_slice(buf);
            Ok(buf.len())
        }
    }

    #[test]
    fn enable_patches_and_disable_restores() {
        let mem = MockMemory::new(0x1000, &[0x55, 0x48, 0x89, 0xe5]);
        let mut bp = Breakpoint::new(0x1001, BreakpointKind::Int3);

        bp.enable(&mem).unwrap();
        assert!(bp.is_enabled());
        assert_eq!(mem.at(0x1001, 1), [0xcc]);
        assert_eq!(bp.saved_bytes(), [0x48]);

        bp.disable(&mem).unwrap();
        assert!(!bp.is_enabled());
        assert_eq!(mem.at(0x1000, 4), [0x55, 0x48, 0x89, 0xe5]);
    }

    #[test]
    fn two_byte_kind_patches_both_bytes() {
        let mem = MockMemory::new(0x2000, &[0x31, 0xc0, 0xc3, 0x90]);
        let mut bp = Breakpoint::new(0x2000, BreakpointKind::Ud2);

        assert_eq!(bp.size(), 2);

        bp.enable(&mem).unwrap();
        assert_eq!(mem.at(0x2000, 2), [0x0f, 0x0b]);
        assert_eq!(bp.saved_bytes(), [0x31, 0xc0]);

        bp.disable(&mem).unwrap();
        assert_eq!(mem.at(0x2000, 4), [0x31, 0xc0, 0xc3, 0x90]);
    }

    #[test]
    fn enable_and_disable_are_idempotent() {
        let mem = MockMemory::new(0x1000, &[0x90, 0x90]);
        let mut bp = Breakpoint::new(0x1000, BreakpointKind::default());

        bp.enable(&mem).unwrap();
        bp.enable(&mem).unwrap();
        assert_eq!(bp.saved_bytes(), [0x90]);

        bp.disable(&mem).unwrap();
        bp.disable(&mem).unwrap();
        assert_eq!(mem.at(0x1000, 1), [0x90]);
    }

    #[test]
    fn breakpoint_over_a_trap_byte_restores_identically() {
        // The instruction at the target is already the trap instruction.
        let mem = MockMemory::new(0x3000, &[0xcc, 0x90]);
        let mut bp = Breakpoint::new(0x3000, BreakpointKind::Int3);

        bp.enable(&mem).unwrap();
        assert_eq!(bp.saved_bytes(), [0xcc]);
        bp.disable(&mem).unwrap();
        assert_eq!(mem.at(0x3000, 2), [0xcc, 0x90]);
    }

    #[test]
    fn hits_accumulate() {
        let mut bp = Breakpoint::new(0, BreakpointKind::Int3);
        assert_eq!(bp.hit_count(), 0);
        bp.hit();
        bp.hit();
        assert_eq!(bp.hit_count(), 2);
    }

    #[test]
    fn kind_table_matches_the_opcode_map() {
        use BreakpointKind::*;

        let table: &[(BreakpointKind, &[u8])] = &[
            (Int3, &[0xcc]),
            (Int1, &[0xf1]),
            (Hlt, &[0xf4]),
            (Cli, &[0xfa]),
            (Sti, &[0xfb]),
            (Insb, &[0x6c]),
            (Insd, &[0x6d]),
            (Outsb, &[0x6e]),
            (Outsd, &[0x6f]),
            (Ud2, &[0x0f, 0x0b]),
            (Ud0, &[0x0f, 0xff]),
        ];

        for (kind, bytes) in table {
            assert_eq!(kind.bytes(), *bytes);
            assert!(kind.bytes().len() >= Breakpoint::MIN_SIZE);
            assert!(kind.bytes().len() <= Breakpoint::MAX_SIZE);
        }
    }
}
