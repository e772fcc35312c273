//! Register snapshots of a stopped thread.
//!
//! A [`Context`] carries one bitness variant of the general-purpose register
//! file plus the decoded extended state (x87, SSE/AVX/AVX-512) and the
//! hardware debug registers. Individual registers are accessed through
//! [`Context::get`], which hands out a [`RegisterRef`] view selected by
//! [`RegisterId`] — including sub-register aliases (`EAX` inside `RAX`,
//! `XMM0` inside `ZMM0`) and the size-generic `XAX`/`XIP`/`XSP`/`XFLAGS`
//! family that resolves per the context's bitness.
//!
//! A context is a snapshot: mutating it changes nothing in the tracee until
//! it is committed with [`Thread::set_context`](crate::Thread::set_context).

use crate::register_ref::RegisterRef;

/// Identifies one register (or register alias) of an x86/x86-64 thread.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[allow(missing_docs)]
pub enum RegisterId {
    OrigEax,

    // Segment selectors and bases.
    Gs,
    Fs,
    Es,
    Ds,
    Cs,
    Ss,
    FsBase,
    GsBase,

    // Hardware debug registers.
    Dr0,
    Dr1,
    Dr2,
    Dr3,
    Dr4,
    Dr5,
    Dr6,
    Dr7,

    Eflags,
    Rflags,

    // 32-bit GP file and its 16/8-bit aliases.
    Eax,
    Ax,
    Ah,
    Al,
    Ebx,
    Bx,
    Bh,
    Bl,
    Ecx,
    Cx,
    Ch,
    Cl,
    Edx,
    Dx,
    Dh,
    Dl,
    Edi,
    Di,
    Esi,
    Si,
    Ebp,
    Bp,
    Esp,
    Sp,
    Eip,

    // 64-bit GP file and the r8..r15 families.
    OrigRax,
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Sil,
    Rdi,
    Dil,
    Rbp,
    Bpl,
    Rsp,
    Spl,
    Rip,
    R8,
    R8d,
    R8w,
    R8b,
    R9,
    R9d,
    R9w,
    R9b,
    R10,
    R10d,
    R10w,
    R10b,
    R11,
    R11d,
    R11w,
    R11b,
    R12,
    R12d,
    R12w,
    R12b,
    R13,
    R13d,
    R13w,
    R13b,
    R14,
    R14d,
    R14w,
    R14b,
    R15,
    R15d,
    R15w,
    R15b,

    // x87 stack and control words.
    St0,
    St1,
    St2,
    St3,
    St4,
    St5,
    St6,
    St7,

    /// Control word.
    Cwd,
    /// Status word.
    Swd,
    /// Tag word.
    Ftw,
    /// Last instruction opcode.
    Fop,
    /// Last instruction pointer offset.
    Fip,
    /// Last operand pointer offset.
    Fdp,
    Mxcsr,
    MxcsrMask,

    // MMX aliases of the x87 stack.
    Mm0,
    Mm1,
    Mm2,
    Mm3,
    Mm4,
    Mm5,
    Mm6,
    Mm7,

    // SIMD file at each width.
    Xmm0,
    Xmm1,
    Xmm2,
    Xmm3,
    Xmm4,
    Xmm5,
    Xmm6,
    Xmm7,
    Xmm8,
    Xmm9,
    Xmm10,
    Xmm11,
    Xmm12,
    Xmm13,
    Xmm14,
    Xmm15,
    Ymm0,
    Ymm1,
    Ymm2,
    Ymm3,
    Ymm4,
    Ymm5,
    Ymm6,
    Ymm7,
    Ymm8,
    Ymm9,
    Ymm10,
    Ymm11,
    Ymm12,
    Ymm13,
    Ymm14,
    Ymm15,
    Zmm0,
    Zmm1,
    Zmm2,
    Zmm3,
    Zmm4,
    Zmm5,
    Zmm6,
    Zmm7,
    Zmm8,
    Zmm9,
    Zmm10,
    Zmm11,
    Zmm12,
    Zmm13,
    Zmm14,
    Zmm15,
    Zmm16,
    Zmm17,
    Zmm18,
    Zmm19,
    Zmm20,
    Zmm21,
    Zmm22,
    Zmm23,
    Zmm24,
    Zmm25,
    Zmm26,
    Zmm27,
    Zmm28,
    Zmm29,
    Zmm30,
    Zmm31,

    // Size-generic aliases, resolved per the context's bitness.
    Xax,
    Xcx,
    Xdx,
    Xsi,
    Xdi,
    Xip,
    Xsp,
    Xflags,
}

/// Mirror of the kernel's 64-bit `user_regs_struct`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
#[allow(missing_docs)]
pub struct UserRegsX86_64 {
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
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
    pub fs_base: u64,
    pub gs_base: u64,
    pub ds: u64,
    pub es: u64,
    pub fs: u64,
    pub gs: u64,
}

/// Mirror of the kernel's 32-bit `user_regs_struct`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
#[allow(missing_docs)]
pub struct UserRegsX86 {
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub eax: u32,
    pub ds: u32,
    pub es: u32,
    pub fs: u32,
    pub gs: u32,
    pub orig_eax: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u32,
}

const _: () = assert!(std::mem::size_of::<UserRegsX86_64>() == 216);
const _: () = assert!(std::mem::size_of::<UserRegsX86>() == 68);

/// One x87 stack register: an 80-bit value stored in a 16-byte lane.
#[derive(Clone, Copy, Debug, Default)]
pub struct X87Register {
    pub data: [u8; 16],
}

/// One unified SIMD lane, wide enough for a full ZMM register. XMM aliases
/// the low 16 bytes, YMM the low 32.
#[derive(Clone, Copy)]
pub struct SimdRegister {
    pub data: [u8; 64],
}

impl Default for SimdRegister {
    fn default() -> Self {
        Self { data: [0; 64] }
    }
}

/// Decoded x87 bank of the xsave area.
#[derive(Clone, Debug, Default)]
pub struct X87State {
    pub registers: [X87Register; 8],
    pub inst_ptr_offset: u64,
    pub data_ptr_offset: u64,
    pub inst_ptr_selector: u16,
    pub data_ptr_selector: u16,
    pub control_word: u16,
    pub status_word: u16,
    pub tag_word: u16,
    pub opcode: u16,
    /// Whether the tracee had live x87 state when the snapshot was taken.
    pub filled: bool,
}

/// Decoded SIMD bank of the xsave area: 32 unified 64-byte lanes.
#[derive(Clone)]
pub struct SimdState {
    pub registers: [SimdRegister; 32],
    pub mxcsr: u32,
    pub mxcsr_mask: u32,
    pub sse_filled: bool,
    pub avx_filled: bool,
    pub zmm_filled: bool,
}

impl Default for SimdState {
    fn default() -> Self {
        Self {
            registers: [SimdRegister::default(); 32],
            mxcsr: 0,
            mxcsr_mask: 0,
            sse_filled: false,
            avx_filled: false,
            zmm_filled: false,
        }
    }
}

/// The decoded extended-state banks common to both bitness variants.
#[derive(Clone, Default)]
pub struct ExtendedState {
    pub x87: X87State,
    pub simd: SimdState,
}

/// The general-purpose register file, tagged by storage layout.
///
/// On a 64-bit debugger the kernel always presents the 64-bit layout, even
/// for a 32-bit tracee; the 32-bit layout appears when a 32-bit debugger
/// retrieves `NT_PRSTATUS` for a 32-bit thread.
#[derive(Clone, Debug)]
pub enum Registers {
    X86_64 {
        gp: UserRegsX86_64,
        debug: [u64; 8],
    },
    X86 {
        gp: UserRegsX86,
        debug: [u32; 8],
        fs_base: u32,
        gs_base: u32,
    },
}

/// Size of the buffer needed to hold either GP layout, for sizing
/// `NT_PRSTATUS` register-set requests.
pub(crate) const GP_BUFFER_SIZE: usize = std::mem::size_of::<UserRegsX86_64>();

pub(crate) const XSAVE_BUFFER_SIZE: usize = 4096;

/// Raw xsave image as the kernel handed it to us. Preserved so that writing
/// a context back does not clobber components we never decoded.
#[repr(C, align(64))]
#[derive(Clone, Copy)]
pub(crate) struct XsaveImage {
    pub(crate) data: [u8; XSAVE_BUFFER_SIZE],
}

impl Default for XsaveImage {
    fn default() -> Self {
        Self { data: [0; XSAVE_BUFFER_SIZE] }
    }
}

// xsave component bits, per the SDM.
const XFEATURE_X87: u64 = 1 << 0;
const XFEATURE_SSE: u64 = 1 << 1;
const XFEATURE_AVX: u64 = 1 << 2;
const XFEATURE_OPMASK: u64 = 1 << 5;
const XFEATURE_ZMM_HI256: u64 = 1 << 6;
const XFEATURE_HI16_ZMM: u64 = 1 << 7;
const XFEATURE_AVX512: u64 = XFEATURE_OPMASK | XFEATURE_ZMM_HI256 | XFEATURE_HI16_ZMM;

// Fixed offsets inside the xsave image: the 512-byte legacy region, the
// header's component bitvector, then the standard-format component areas.
const XSAVE_ST_SPACE_OFFSET: usize = 32;
const XSAVE_XMM_SPACE_OFFSET: usize = 160;
const XSAVE_XSTATE_BV_OFFSET: usize = 512;
const XSAVE_YMM_HI128_OFFSET: usize = 576;
const XSAVE_ZMM_HI256_OFFSET: usize = 1152;
const XSAVE_HI16_ZMM_OFFSET: usize = 1664;

const MXCSR_DEFAULT: u32 = 0x1f80;
const TAG_WORD_EMPTY: u16 = 0xffff;

/// Register snapshot of one stopped thread.
#[derive(Clone)]
pub struct Context {
    pub(crate) regs: Registers,
    pub(crate) xstate: ExtendedState,
    pub(crate) xsave: XsaveImage,
    pub(crate) xsave_len: usize,
    pub(crate) is_64_bit: bool,
    pub(crate) populated: bool,
}

impl Default for Context {
    fn default() -> Self {
        Self::new_64()
    }
}

impl Context {
    /// An empty context with 64-bit register storage.
    pub fn new_64() -> Self {
        Self {
            regs: Registers::X86_64 {
                gp: UserRegsX86_64::default(),
                debug: [0; 8],
            },
            xstate: ExtendedState::default(),
            xsave: XsaveImage::default(),
            xsave_len: 0,
            is_64_bit: true,
            populated: false,
        }
    }

    /// An empty context with 32-bit register storage.
    pub fn new_32() -> Self {
        Self {
            regs: Registers::X86 {
                gp: UserRegsX86::default(),
                debug: [0; 8],
                fs_base: 0,
                gs_base: 0,
            },
            xstate: ExtendedState::default(),
            xsave: XsaveImage::default(),
            xsave_len: 0,
            is_64_bit: false,
            populated: false,
        }
    }

    /// Bitness of the thread this snapshot was taken from.
    pub fn is_64_bit(&self) -> bool {
        self.is_64_bit
    }

    /// Whether the snapshot has been filled in from a live thread.
    pub fn is_populated(&self) -> bool {
        self.populated
    }

    pub fn registers(&self) -> &Registers {
        &self.regs
    }

    pub fn extended_state(&self) -> &ExtendedState {
        &self.xstate
    }

    /// A mutable view of `id`, or `None` when the register does not exist in
    /// this context's layout (e.g. `R8` in a 32-bit register file).
    pub fn get(&mut self, id: RegisterId) -> Option<RegisterRef<'_>> {
        match self.regs {
            Registers::X86_64 { .. } => self.get_64(id),
            Registers::X86 { .. } => self.get_32(id),
        }
    }

    fn get_64(&mut self, id: RegisterId) -> Option<RegisterRef<'_>> {
        use RegisterId::*;

        let (gp, debug) = match &mut self.regs {
            Registers::X86_64 { gp, debug } => (gp, debug),
            Registers::X86 { .. } => unreachable!("64-bit lookup on 32-bit storage"),
        };
        let xstate = &mut self.xstate;

        let r = match id {
            // Segment selectors and bases.
            Cs => reg("cs", &mut gp.cs),
            Ds => reg("ds", &mut gp.ds),
            Es => reg("es", &mut gp.es),
            Fs => reg("fs", &mut gp.fs),
            Gs => reg("gs", &mut gp.gs),
            Ss => reg("ss", &mut gp.ss),
            FsBase => reg("fs_base", &mut gp.fs_base),
            GsBase => reg("gs_base", &mut gp.gs_base),

            // Size-generic aliases resolve to the 64-bit file.
            Xax => reg("rax", &mut gp.rax),
            Xcx => reg("rcx", &mut gp.rcx),
            Xdx => reg("rdx", &mut gp.rdx),
            Xsi => reg("rsi", &mut gp.rsi),
            Xdi => reg("rdi", &mut gp.rdi),
            Xip => reg("rip", &mut gp.rip),
            Xsp => reg("rsp", &mut gp.rsp),
            Xflags => reg("rflags", &mut gp.rflags),

            // 64-bit GP file.
            R15 => reg("r15", &mut gp.r15),
            R14 => reg("r14", &mut gp.r14),
            R13 => reg("r13", &mut gp.r13),
            R12 => reg("r12", &mut gp.r12),
            R11 => reg("r11", &mut gp.r11),
            R10 => reg("r10", &mut gp.r10),
            R9 => reg("r9", &mut gp.r9),
            R8 => reg("r8", &mut gp.r8),
            Rbp => reg("rbp", &mut gp.rbp),
            Rbx => reg("rbx", &mut gp.rbx),
            Rax => reg("rax", &mut gp.rax),
            Rcx => reg("rcx", &mut gp.rcx),
            Rdx => reg("rdx", &mut gp.rdx),
            Rsi => reg("rsi", &mut gp.rsi),
            Rdi => reg("rdi", &mut gp.rdi),
            Rip => reg("rip", &mut gp.rip),
            Rsp => reg("rsp", &mut gp.rsp),
            Rflags => reg("rflags", &mut gp.rflags),
            OrigRax => reg("orig_rax", &mut gp.orig_rax),

            // 32-bit aliases.
            Eax => reg_at("eax", &mut gp.rax, 4, 0),
            Ebx => reg_at("ebx", &mut gp.rbx, 4, 0),
            Ecx => reg_at("ecx", &mut gp.rcx, 4, 0),
            Edx => reg_at("edx", &mut gp.rdx, 4, 0),
            Esi => reg_at("esi", &mut gp.rsi, 4, 0),
            Edi => reg_at("edi", &mut gp.rdi, 4, 0),
            Eip => reg_at("eip", &mut gp.rip, 4, 0),
            Esp => reg_at("esp", &mut gp.rsp, 4, 0),
            Ebp => reg_at("ebp", &mut gp.rbp, 4, 0),
            R8d => reg_at("r8d", &mut gp.r8, 4, 0),
            R9d => reg_at("r9d", &mut gp.r9, 4, 0),
            R10d => reg_at("r10d", &mut gp.r10, 4, 0),
            R11d => reg_at("r11d", &mut gp.r11, 4, 0),
            R12d => reg_at("r12d", &mut gp.r12, 4, 0),
            R13d => reg_at("r13d", &mut gp.r13, 4, 0),
            R14d => reg_at("r14d", &mut gp.r14, 4, 0),
            R15d => reg_at("r15d", &mut gp.r15, 4, 0),
            Eflags => reg_at("eflags", &mut gp.rflags, 4, 0),
            OrigEax => reg_at("orig_eax", &mut gp.orig_rax, 4, 0),

            // 16-bit aliases.
            Ax => reg_at("ax", &mut gp.rax, 2, 0),
            Bx => reg_at("bx", &mut gp.rbx, 2, 0),
            Cx => reg_at("cx", &mut gp.rcx, 2, 0),
            Dx => reg_at("dx", &mut gp.rdx, 2, 0),
            Si => reg_at("si", &mut gp.rsi, 2, 0),
            Di => reg_at("di", &mut gp.rdi, 2, 0),
            Bp => reg_at("bp", &mut gp.rbp, 2, 0),
            Sp => reg_at("sp", &mut gp.rsp, 2, 0),
            R8w => reg_at("r8w", &mut gp.r8, 2, 0),
            R9w => reg_at("r9w", &mut gp.r9, 2, 0),
            R10w => reg_at("r10w", &mut gp.r10, 2, 0),
            R11w => reg_at("r11w", &mut gp.r11, 2, 0),
            R12w => reg_at("r12w", &mut gp.r12, 2, 0),
            R13w => reg_at("r13w", &mut gp.r13, 2, 0),
            R14w => reg_at("r14w", &mut gp.r14, 2, 0),
            R15w => reg_at("r15w", &mut gp.r15, 2, 0),

            // 8-bit aliases; the AH family views byte 1.
            Al => reg_at("al", &mut gp.rax, 1, 0),
            Bl => reg_at("bl", &mut gp.rbx, 1, 0),
            Cl => reg_at("cl", &mut gp.rcx, 1, 0),
            Dl => reg_at("dl", &mut gp.rdx, 1, 0),
            Ah => reg_at("ah", &mut gp.rax, 1, 1),
            Bh => reg_at("bh", &mut gp.rbx, 1, 1),
            Ch => reg_at("ch", &mut gp.rcx, 1, 1),
            Dh => reg_at("dh", &mut gp.rdx, 1, 1),
            Sil => reg_at("sil", &mut gp.rsi, 1, 0),
            Dil => reg_at("dil", &mut gp.rdi, 1, 0),
            Bpl => reg_at("bpl", &mut gp.rbp, 1, 0),
            Spl => reg_at("spl", &mut gp.rsp, 1, 0),
            R8b => reg_at("r8b", &mut gp.r8, 1, 0),
            R9b => reg_at("r9b", &mut gp.r9, 1, 0),
            R10b => reg_at("r10b", &mut gp.r10, 1, 0),
            R11b => reg_at("r11b", &mut gp.r11, 1, 0),
            R12b => reg_at("r12b", &mut gp.r12, 1, 0),
            R13b => reg_at("r13b", &mut gp.r13, 1, 0),
            R14b => reg_at("r14b", &mut gp.r14, 1, 0),
            R15b => reg_at("r15b", &mut gp.r15, 1, 0),

            // Debug registers.
            Dr0 => reg("dr0", &mut debug[0]),
            Dr1 => reg("dr1", &mut debug[1]),
            Dr2 => reg("dr2", &mut debug[2]),
            Dr3 => reg("dr3", &mut debug[3]),
            Dr4 => reg("dr4", &mut debug[4]),
            Dr5 => reg("dr5", &mut debug[5]),
            Dr6 => reg("dr6", &mut debug[6]),
            Dr7 => reg("dr7", &mut debug[7]),

            _ => return xstate_ref(xstate, id, true),
        };

        Some(r)
    }

    fn get_32(&mut self, id: RegisterId) -> Option<RegisterRef<'_>> {
        use RegisterId::*;

        let (gp, debug, fs_base, gs_base) = match &mut self.regs {
            Registers::X86 { gp, debug, fs_base, gs_base } => (gp, debug, fs_base, gs_base),
            Registers::X86_64 { .. } => unreachable!("32-bit lookup on 64-bit storage"),
        };
        let xstate = &mut self.xstate;

        let r = match id {
            Eax => reg("eax", &mut gp.eax),
            Ebx => reg("ebx", &mut gp.ebx),
            Ecx => reg("ecx", &mut gp.ecx),
            Edx => reg("edx", &mut gp.edx),
            Esi => reg("esi", &mut gp.esi),
            Edi => reg("edi", &mut gp.edi),
            Ebp => reg("ebp", &mut gp.ebp),
            Esp => reg("esp", &mut gp.esp),
            Eip => reg("eip", &mut gp.eip),
            Eflags => reg("eflags", &mut gp.eflags),
            OrigEax => reg("orig_eax", &mut gp.orig_eax),

            Cs => reg("cs", &mut gp.cs),
            Ss => reg("ss", &mut gp.ss),
            Ds => reg("ds", &mut gp.ds),
            Es => reg("es", &mut gp.es),
            Fs => reg("fs", &mut gp.fs),
            Gs => reg("gs", &mut gp.gs),
            FsBase => reg("fs_base", fs_base),
            GsBase => reg("gs_base", gs_base),

            // 16-bit aliases.
            Ax => reg_at("ax", &mut gp.eax, 2, 0),
            Bx => reg_at("bx", &mut gp.ebx, 2, 0),
            Cx => reg_at("cx", &mut gp.ecx, 2, 0),
            Dx => reg_at("dx", &mut gp.edx, 2, 0),
            Si => reg_at("si", &mut gp.esi, 2, 0),
            Di => reg_at("di", &mut gp.edi, 2, 0),
            Bp => reg_at("bp", &mut gp.ebp, 2, 0),
            Sp => reg_at("sp", &mut gp.esp, 2, 0),

            // 8-bit aliases.
            Al => reg_at("al", &mut gp.eax, 1, 0),
            Bl => reg_at("bl", &mut gp.ebx, 1, 0),
            Cl => reg_at("cl", &mut gp.ecx, 1, 0),
            Dl => reg_at("dl", &mut gp.edx, 1, 0),
            Ah => reg_at("ah", &mut gp.eax, 1, 1),
            Bh => reg_at("bh", &mut gp.ebx, 1, 1),
            Ch => reg_at("ch", &mut gp.ecx, 1, 1),
            Dh => reg_at("dh", &mut gp.edx, 1, 1),

            // Debug registers.
            Dr0 => reg("dr0", &mut debug[0]),
            Dr1 => reg("dr1", &mut debug[1]),
            Dr2 => reg("dr2", &mut debug[2]),
            Dr3 => reg("dr3", &mut debug[3]),
            Dr4 => reg("dr4", &mut debug[4]),
            Dr5 => reg("dr5", &mut debug[5]),
            Dr6 => reg("dr6", &mut debug[6]),
            Dr7 => reg("dr7", &mut debug[7]),

            // Size-generic aliases resolve to the 32-bit file.
            Xax => reg("eax", &mut gp.eax),
            Xcx => reg("ecx", &mut gp.ecx),
            Xdx => reg("edx", &mut gp.edx),
            Xsi => reg("esi", &mut gp.esi),
            Xdi => reg("edi", &mut gp.edi),
            Xip => reg("eip", &mut gp.eip),
            Xsp => reg("esp", &mut gp.esp),
            Xflags => reg("eflags", &mut gp.eflags),

            _ => return xstate_ref(xstate, id, false),
        };

        Some(r)
    }

    /// Parse a raw xsave image into the extended-state banks.
    ///
    /// Components whose bit is clear in the header's `xstate_bv` are
    /// materialized as architectural defaults: the kernel may leave a bit
    /// clear simply because the tracee never touched that component.
    pub fn decode_xsave(&mut self, raw: &[u8]) {
        self.xstate = ExtendedState::default();

        if raw.len() < XSAVE_XSTATE_BV_OFFSET + 8 {
            return;
        }

        let xstate_bv = read_u64(raw, XSAVE_XSTATE_BV_OFFSET);
        let lanes = if self.is_64_bit { 16 } else { 8 };

        let x87 = &mut self.xstate.x87;
        if xstate_bv & XFEATURE_X87 != 0 {
            x87.control_word = read_u16(raw, 0);
            x87.status_word = read_u16(raw, 2);
            x87.tag_word = read_u16(raw, 4);
            x87.opcode = read_u16(raw, 6);
            x87.inst_ptr_offset = read_u64(raw, 8);
            x87.data_ptr_offset = read_u64(raw, 16);
            for (i, st) in x87.registers.iter_mut().enumerate() {
                let off = XSAVE_ST_SPACE_OFFSET + i * 16;
                st.data.copy_from_slice(&raw[off..off + 16]);
            }
            x87.filled = true;
        } else {
            x87.tag_word = TAG_WORD_EMPTY;
            x87.control_word = read_u16(raw, 0);
        }

        let simd = &mut self.xstate.simd;
        if xstate_bv & XFEATURE_SSE != 0 {
            simd.mxcsr = read_u32(raw, 24);
            simd.mxcsr_mask = read_u32(raw, 28);
            for i in 0..lanes {
                let off = XSAVE_XMM_SPACE_OFFSET + i * 16;
                simd.registers[i].data[..16].copy_from_slice(&raw[off..off + 16]);
            }
            simd.sse_filled = true;
        } else {
            simd.mxcsr = MXCSR_DEFAULT;
        }

        if xstate_bv & XFEATURE_AVX != 0 && raw.len() >= XSAVE_YMM_HI128_OFFSET + lanes * 16 {
            for i in 0..lanes {
                let off = XSAVE_YMM_HI128_OFFSET + i * 16;
                simd.registers[i].data[16..32].copy_from_slice(&raw[off..off + 16]);
            }
            simd.avx_filled = true;
        }

        if self.is_64_bit
            && xstate_bv & XFEATURE_AVX512 == XFEATURE_AVX512
            && raw.len() >= XSAVE_HI16_ZMM_OFFSET + 16 * 64
        {
            for i in 0..16 {
                let off = XSAVE_ZMM_HI256_OFFSET + i * 32;
                simd.registers[i].data[32..64].copy_from_slice(&raw[off..off + 32]);
            }
            for i in 0..16 {
                let off = XSAVE_HI16_ZMM_OFFSET + i * 64;
                simd.registers[16 + i].data.copy_from_slice(&raw[off..off + 64]);
            }
            simd.zmm_filled = true;
        }
    }

    /// Write the extended-state banks back into a raw xsave image, setting
    /// the component bits for the banks we carry. Components we never
    /// decoded keep whatever bytes the image already has.
    pub fn encode_xsave(&self, raw: &mut [u8]) {
        if raw.len() < XSAVE_XSTATE_BV_OFFSET + 8 {
            return;
        }

        let mut xstate_bv = read_u64(raw, XSAVE_XSTATE_BV_OFFSET);
        let lanes = if self.is_64_bit { 16 } else { 8 };

        let x87 = &self.xstate.x87;
        write_u16(raw, 0, x87.control_word);
        write_u16(raw, 2, x87.status_word);
        write_u16(raw, 4, x87.tag_word);
        write_u16(raw, 6, x87.opcode);
        write_u64(raw, 8, x87.inst_ptr_offset);
        write_u64(raw, 16, x87.data_ptr_offset);
        for (i, st) in x87.registers.iter().enumerate() {
            let off = XSAVE_ST_SPACE_OFFSET + i * 16;
            raw[off..off + 16].copy_from_slice(&st.data);
        }
        if x87.filled {
            xstate_bv |= XFEATURE_X87;
        }

        let simd = &self.xstate.simd;
        write_u32(raw, 24, simd.mxcsr);
        write_u32(raw, 28, simd.mxcsr_mask);
        for i in 0..lanes {
            let off = XSAVE_XMM_SPACE_OFFSET + i * 16;
            raw[off..off + 16].copy_from_slice(&simd.registers[i].data[..16]);
        }
        if simd.sse_filled {
            xstate_bv |= XFEATURE_SSE;
        }

        if simd.avx_filled && raw.len() >= XSAVE_YMM_HI128_OFFSET + lanes * 16 {
            for i in 0..lanes {
                let off = XSAVE_YMM_HI128_OFFSET + i * 16;
                raw[off..off + 16].copy_from_slice(&simd.registers[i].data[16..32]);
            }
            xstate_bv |= XFEATURE_AVX;
        }

        if self.is_64_bit && simd.zmm_filled && raw.len() >= XSAVE_HI16_ZMM_OFFSET + 16 * 64 {
            for i in 0..16 {
                let off = XSAVE_ZMM_HI256_OFFSET + i * 32;
                raw[off..off + 32].copy_from_slice(&simd.registers[i].data[32..64]);
            }
            for i in 0..16 {
                let off = XSAVE_HI16_ZMM_OFFSET + i * 64;
                raw[off..off + 64].copy_from_slice(&simd.registers[16 + i].data);
            }
            xstate_bv |= XFEATURE_AVX512;
        }

        write_u64(raw, XSAVE_XSTATE_BV_OFFSET, xstate_bv);
    }

    /// Parse a legacy 512-byte FXSAVE image (the `PTRACE_GETFPXREGS`
    /// fallback for 32-bit threads). There is no component header; the x87
    /// and SSE banks are taken as present.
    pub fn decode_fxsave(&mut self, raw: &[u8]) {
        self.xstate = ExtendedState::default();

        if raw.len() < XSAVE_XMM_SPACE_OFFSET + 8 * 16 {
            return;
        }

        let x87 = &mut self.xstate.x87;
        x87.control_word = read_u16(raw, 0);
        x87.status_word = read_u16(raw, 2);
        x87.tag_word = read_u16(raw, 4);
        x87.opcode = read_u16(raw, 6);
        x87.inst_ptr_offset = u64::from(read_u32(raw, 8));
        x87.inst_ptr_selector = read_u16(raw, 12);
        x87.data_ptr_offset = u64::from(read_u32(raw, 16));
        x87.data_ptr_selector = read_u16(raw, 20);
        for (i, st) in x87.registers.iter_mut().enumerate() {
            let off = XSAVE_ST_SPACE_OFFSET + i * 16;
            st.data.copy_from_slice(&raw[off..off + 16]);
        }
        x87.filled = true;

        let simd = &mut self.xstate.simd;
        simd.mxcsr = read_u32(raw, 24);
        simd.mxcsr_mask = read_u32(raw, 28);
        for i in 0..8 {
            let off = XSAVE_XMM_SPACE_OFFSET + i * 16;
            simd.registers[i].data[..16].copy_from_slice(&raw[off..off + 16]);
        }
        simd.sse_filled = true;
    }
}

fn xstate_ref(xstate: &mut ExtendedState, id: RegisterId, is_64_bit: bool) -> Option<RegisterRef<'_>> {
    use RegisterId::*;

    let r = match id {
        St0 | St1 | St2 | St3 | St4 | St5 | St6 | St7 => {
            let i = id as usize - St0 as usize;
            reg_at(ST_NAMES[i], &mut xstate.x87.registers[i].data, 16, 0)
        }
        Mm0 | Mm1 | Mm2 | Mm3 | Mm4 | Mm5 | Mm6 | Mm7 => {
            let i = id as usize - Mm0 as usize;
            reg_at(MM_NAMES[i], &mut xstate.x87.registers[i].data, 8, 0)
        }

        Cwd => reg("cwd", &mut xstate.x87.control_word),
        Swd => reg("swd", &mut xstate.x87.status_word),
        Ftw => reg("ftw", &mut xstate.x87.tag_word),
        Fop => reg("fop", &mut xstate.x87.opcode),
        Fip => reg("fip", &mut xstate.x87.inst_ptr_offset),
        Fdp => reg("fdp", &mut xstate.x87.data_ptr_offset),
        Mxcsr => reg("mxcsr", &mut xstate.simd.mxcsr),
        MxcsrMask => reg("mxcsr_mask", &mut xstate.simd.mxcsr_mask),

        _ => {
            let (names, base, width, count): (&[&'static str], RegisterId, usize, usize) =
                if (Xmm0..=Xmm15).contains(&id) {
                    (&XMM_NAMES, Xmm0, 16, if is_64_bit { 16 } else { 8 })
                } else if (Ymm0..=Ymm15).contains(&id) {
                    (&YMM_NAMES, Ymm0, 32, if is_64_bit { 16 } else { 8 })
                } else if (Zmm0..=Zmm31).contains(&id) {
                    if !is_64_bit {
                        return None;
                    }
                    (&ZMM_NAMES, Zmm0, 64, 32)
                } else {
                    return None;
                };

            let i = id as usize - base as usize;
            if i >= count {
                return None;
            }

            reg_at(names[i], &mut xstate.simd.registers[i].data, width, 0)
        }
    };

    Some(r)
}

const ST_NAMES: [&str; 8] = ["st0", "st1", "st2", "st3", "st4", "st5", "st6", "st7"];
const MM_NAMES: [&str; 8] = ["mm0", "mm1", "mm2", "mm3", "mm4", "mm5", "mm6", "mm7"];

const XMM_NAMES: [&str; 16] = [
    "xmm0", "xmm1", "xmm2", "xmm3", "xmm4", "xmm5", "xmm6", "xmm7", "xmm8", "xmm9", "xmm10",
    "xmm11", "xmm12", "xmm13", "xmm14", "xmm15",
];

const YMM_NAMES: [&str; 16] = [
    "ymm0", "ymm1", "ymm2", "ymm3", "ymm4", "ymm5", "ymm6", "ymm7", "ymm8", "ymm9", "ymm10",
    "ymm11", "ymm12", "ymm13", "ymm14", "ymm15",
];

const ZMM_NAMES: [&str; 32] = [
    "zmm0", "zmm1", "zmm2", "zmm3", "zmm4", "zmm5", "zmm6", "zmm7", "zmm8", "zmm9", "zmm10",
    "zmm11", "zmm12", "zmm13", "zmm14", "zmm15", "zmm16", "zmm17", "zmm18", "zmm19", "zmm20",
    "zmm21", "zmm22", "zmm23", "zmm24", "zmm25", "zmm26", "zmm27", "zmm28", "zmm29", "zmm30",
    "zmm31",
];

/// Marker for field types that may be viewed as raw bytes: plain unsigned
/// integers and byte arrays of the register structs, with no padding and no
/// invalid bit patterns.
trait RawField: Copy {}

impl RawField for u16 {}
impl RawField for u32 {}
impl RawField for u64 {}
impl RawField for [u8; 16] {}
impl RawField for [u8; 64] {}

fn bytes_of_mut<T: RawField>(field: &mut T) -> &mut [u8] {
    // SAFETY: `T` is a padding-free plain-data field (see `RawField`); any
    // byte pattern is a valid value, so handing out a byte view for reads
    // and writes is sound. The lifetime is inherited from the borrow.
    unsafe {
        std::slice::from_raw_parts_mut((field as *mut T).cast::<u8>(), std::mem::size_of::<T>())
    }
}

fn reg<'a, T: RawField>(name: &'static str, field: &'a mut T) -> RegisterRef<'a> {
    RegisterRef::new(name, bytes_of_mut(field))
}

fn reg_at<'a, T: RawField>(
    name: &'static str,
    field: &'a mut T,
    size: usize,
    offset: usize,
) -> RegisterRef<'a> {
    let bytes = bytes_of_mut(field);
    RegisterRef::new(name, &mut bytes[offset..offset + size])
}

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(buf[off..off + 2].try_into().unwrap())
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

fn read_u64(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}

fn write_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

fn write_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn write_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use RegisterId::*;

    #[test]
    fn gp_aliases_overlay_the_full_register() {
        let mut ctx = Context::new_64();

        ctx.get(Rax).unwrap().set(0x1122_3344_5566_7788u64);

        assert_eq!(ctx.get(Eax).unwrap().get::<u32>(), 0x5566_7788);
        assert_eq!(ctx.get(Ax).unwrap().get::<u16>(), 0x7788);
        assert_eq!(ctx.get(Ah).unwrap().get::<u8>(), 0x77);
        assert_eq!(ctx.get(Al).unwrap().get::<u8>(), 0x88);
    }

    #[test]
    fn narrow_alias_write_zeroes_only_its_view() {
        let mut ctx = Context::new_64();

        ctx.get(Rbx).unwrap().set(0xffff_ffff_ffff_ffffu64);
        ctx.get(Ebx).unwrap().set(0x1u32);

        // The 32-bit view is zero-extended within itself; the untouched
        // upper half of RBX stays as it was.
        assert_eq!(ctx.get(Rbx).unwrap().get::<u64>(), 0xffff_ffff_0000_0001);
    }

    #[test]
    fn size_generic_aliases_follow_bitness() {
        let mut ctx = Context::new_64();
        ctx.get(Rip).unwrap().set(0xdead_beefu64);
        assert_eq!(ctx.get(Xip).unwrap().get::<u64>(), 0xdead_beef);
        assert_eq!(ctx.get(Xip).unwrap().name(), "rip");

        let mut ctx = Context::new_32();
        ctx.get(Eip).unwrap().set(0x0804_8000u32);
        assert_eq!(ctx.get(Xip).unwrap().get::<u64>(), 0x0804_8000);
        assert_eq!(ctx.get(Xip).unwrap().name(), "eip");
    }

    #[test]
    fn registers_missing_from_the_32_bit_file_resolve_to_none() {
        let mut ctx = Context::new_32();

        assert!(ctx.get(R8).is_none());
        assert!(ctx.get(Rax).is_none());
        assert!(ctx.get(Zmm0).is_none());
        assert!(ctx.get(Xmm7).is_some());
        assert!(ctx.get(Xmm8).is_none());
    }

    #[test]
    fn simd_aliases_overlap_and_zero_extend() {
        let mut ctx = Context::new_64();

        ctx.get(Zmm3).unwrap().set(u128::MAX);
        ctx.get(Xmm3).unwrap().set(0xaabbu16);

        // Writing through the 16-byte alias zeroes the alias' bytes only.
        let zmm = ctx.get(Zmm3).unwrap();
        assert_eq!(zmm.get::<u128>(), 0xaabb);
        assert_eq!(zmm.bytes()[16..].iter().copied().max(), Some(0));

        ctx.get(Ymm3).unwrap().set(1u8);
        assert_eq!(ctx.get(Xmm3).unwrap().get::<u128>(), 1);
    }

    #[test]
    fn high_byte_alias_views_byte_one() {
        let mut ctx = Context::new_64();

        ctx.get(Ah).unwrap().set(0x7fu8);
        assert_eq!(ctx.get(Rax).unwrap().get::<u64>(), 0x7f00);
    }

    fn xsave_image() -> Vec<u8> {
        vec![0u8; 2688]
    }

    #[test]
    fn decode_xsave_materializes_defaults_for_clear_bits() {
        let mut raw = xsave_image();
        write_u16(&mut raw, 0, 0x037f);
        // xstate_bv stays zero: nothing touched yet (lazy save).

        let mut ctx = Context::new_64();
        ctx.decode_xsave(&raw);

        let xs = ctx.extended_state();
        assert!(!xs.x87.filled);
        assert_eq!(xs.x87.tag_word, 0xffff);
        assert_eq!(xs.x87.control_word, 0x037f);
        assert!(!xs.simd.sse_filled);
        assert_eq!(xs.simd.mxcsr, 0x1f80);
        assert!(xs.simd.registers.iter().all(|r| r.data == [0; 64]));
    }

    #[test]
    fn decode_xsave_x87_and_sse_banks() {
        let mut raw = xsave_image();
        write_u64(&mut raw, XSAVE_XSTATE_BV_OFFSET, XFEATURE_X87 | XFEATURE_SSE);
        write_u16(&mut raw, 0, 0x037f);
        write_u16(&mut raw, 2, 0x1234);
        write_u16(&mut raw, 4, 0x5678);
        write_u32(&mut raw, 24, 0x1fa0);
        raw[XSAVE_ST_SPACE_OFFSET] = 0x99;
        raw[XSAVE_XMM_SPACE_OFFSET + 5 * 16] = 0x42;

        let mut ctx = Context::new_64();
        ctx.decode_xsave(&raw);

        let xs = ctx.extended_state();
        assert!(xs.x87.filled);
        assert_eq!(xs.x87.status_word, 0x1234);
        assert_eq!(xs.x87.tag_word, 0x5678);
        assert_eq!(xs.x87.registers[0].data[0], 0x99);
        assert!(xs.simd.sse_filled);
        assert_eq!(xs.simd.mxcsr, 0x1fa0);
        assert_eq!(xs.simd.registers[5].data[0], 0x42);
        // SSE decode zeroes the upper lane bytes.
        assert!(xs.simd.registers[5].data[16..].iter().all(|&b| b == 0));
    }

    #[test]
    fn decode_xsave_avx_upper_halves() {
        let mut raw = xsave_image();
        write_u64(&mut raw, XSAVE_XSTATE_BV_OFFSET, XFEATURE_SSE | XFEATURE_AVX);
        raw[XSAVE_YMM_HI128_OFFSET + 2 * 16] = 0x11;

        let mut ctx = Context::new_64();
        ctx.decode_xsave(&raw);

        assert!(ctx.extended_state().simd.avx_filled);
        assert_eq!(ctx.extended_state().simd.registers[2].data[16], 0x11);

        // And through the register view: byte 16 of YMM2.
        assert_eq!(ctx.get(Ymm2).unwrap().get::<u128>(), 0);
        assert_eq!(ctx.get(Ymm2).unwrap().bytes()[16], 0x11);
    }

    #[test]
    fn decode_xsave_avx512_lanes() {
        let mut raw = xsave_image();
        write_u64(
            &mut raw,
            XSAVE_XSTATE_BV_OFFSET,
            XFEATURE_SSE | XFEATURE_AVX | XFEATURE_AVX512,
        );
        raw[XSAVE_ZMM_HI256_OFFSET] = 0xaa; // byte 32 of zmm0
        raw[XSAVE_HI16_ZMM_OFFSET + 64] = 0xbb; // byte 0 of zmm17

        let mut ctx = Context::new_64();
        ctx.decode_xsave(&raw);

        assert!(ctx.extended_state().simd.zmm_filled);
        assert_eq!(ctx.get(Zmm0).unwrap().bytes()[32], 0xaa);
        assert_eq!(ctx.get(Zmm17).unwrap().bytes()[0], 0xbb);
    }

    #[test]
    fn decode_xsave_32_bit_covers_eight_lanes() {
        let mut raw = xsave_image();
        write_u64(&mut raw, XSAVE_XSTATE_BV_OFFSET, XFEATURE_SSE);
        raw[XSAVE_XMM_SPACE_OFFSET + 7 * 16] = 0x07;
        raw[XSAVE_XMM_SPACE_OFFSET + 8 * 16] = 0x08;

        let mut ctx = Context::new_32();
        ctx.decode_xsave(&raw);

        assert_eq!(ctx.extended_state().simd.registers[7].data[0], 0x07);
        // Lane 8 does not exist for a 32-bit thread.
        assert_eq!(ctx.extended_state().simd.registers[8].data[0], 0);
    }

    #[test]
    fn encode_xsave_round_trips_through_decode() {
        let mut ctx = Context::new_64();
        ctx.get(St2).unwrap().set(0x1122_3344u32);
        ctx.get(Xmm1).unwrap().set(0xdead_beefu32);
        ctx.xstate.x87.filled = true;
        ctx.xstate.x87.control_word = 0x037f;
        ctx.xstate.simd.sse_filled = true;
        ctx.xstate.simd.mxcsr = 0x1f80;

        let mut raw = xsave_image();
        ctx.encode_xsave(&mut raw);

        let bv = read_u64(&raw, XSAVE_XSTATE_BV_OFFSET);
        assert_eq!(bv, XFEATURE_X87 | XFEATURE_SSE);

        let mut back = Context::new_64();
        back.decode_xsave(&raw);
        assert_eq!(back.get(St2).unwrap().get::<u32>(), 0x1122_3344);
        assert_eq!(back.get(Xmm1).unwrap().get::<u32>(), 0xdead_beef);
        assert_eq!(back.xstate.x87.control_word, 0x037f);
    }

    #[test]
    fn decode_fxsave_fills_legacy_banks() {
        let mut raw = vec![0u8; 512];
        write_u16(&mut raw, 0, 0x037f);
        write_u32(&mut raw, 24, 0x1f80);
        raw[XSAVE_XMM_SPACE_OFFSET + 16] = 0x21;

        let mut ctx = Context::new_32();
        ctx.decode_fxsave(&raw);

        assert!(ctx.extended_state().x87.filled);
        assert!(ctx.extended_state().simd.sse_filled);
        assert_eq!(ctx.get(Xmm1).unwrap().get::<u8>(), 0x21);
    }

    #[test]
    fn mmx_aliases_the_low_half_of_st() {
        let mut ctx = Context::new_64();

        ctx.get(St0).unwrap().set(0xffff_ffff_ffff_ffff_ffffu128);
        assert_eq!(ctx.get(Mm0).unwrap().size(), 8);
        assert_eq!(ctx.get(Mm0).unwrap().get::<u64>(), u64::MAX);
    }
}
