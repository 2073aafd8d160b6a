//! Instruction operands.

use super::reg::{ArchReg, VirtualRegister};
use crate::cfg::BlockId;
use crate::AppPc;
use bitflags::bitflags;

bitflags! {
    /// How an instruction acts on an operand.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct OperandFlags: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const COND_READ = 1 << 2;
        const COND_WRITE = 1 << 3;
    }
}

impl OperandFlags {
    pub const RW: Self = Self::READ.union(Self::WRITE);

    pub fn is_read(self) -> bool {
        self.intersects(Self::READ | Self::COND_READ)
    }

    pub fn is_write(self) -> bool {
        self.intersects(Self::WRITE | Self::COND_WRITE)
    }

    pub fn is_conditional_write(self) -> bool {
        self.contains(Self::COND_WRITE)
    }
}

/// Segment override carried by memory and pointer operands. `CS`/`DS`/
/// `ES`/`SS` are all zero in long mode and are normalized away at decode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SegmentReg {
    #[default]
    None,
    Fs,
    Gs,
}

impl SegmentReg {
    pub fn from_arch(code: ArchReg) -> Self {
        match code {
            ArchReg::SegFs => SegmentReg::Fs,
            ArchReg::SegGs => SegmentReg::Gs,
            _ => SegmentReg::None,
        }
    }

    /// The legacy prefix byte selecting this segment.
    pub fn prefix_byte(self) -> Option<u8> {
        match self {
            SegmentReg::None => None,
            SegmentReg::Fs => Some(0x64),
            SegmentReg::Gs => Some(0x65),
        }
    }
}

/// A compound memory reference: `[base + index * scale + disp]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct MemOperand {
    pub base: VirtualRegister,
    pub index: VirtualRegister,
    pub scale: u8,
    pub disp: i32,
}

/// Where a control-flow instruction goes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BranchTarget {
    /// A known program counter (application or cache).
    Pc(usize),
    /// A label somewhere in the current instruction list.
    Label(LabelId),
    /// A block in the current trace; resolved once blocks have encoded
    /// addresses.
    Block(BlockId),
}

/// Identifies a label statement within a trace.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LabelId(pub u32);

/// The value part of an operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperandKind {
    /// A register, or a simple `[reg]` dereference when the operand is a
    /// memory operand (`is_memory` set).
    Register(VirtualRegister),
    /// An immediate, sign-extended to 64 bits.
    Immediate(i64),
    /// A compound memory reference.
    Memory(MemOperand),
    /// A memory reference through a hard-coded 64-bit address. At encode
    /// time this becomes RIP-relative when the displacement fits.
    Pointer(u64),
    /// A branch displacement.
    Branch(BranchTarget),
}

/// One operand of an [`super::Inst`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Operand {
    pub kind: OperandKind,
    pub flags: OperandFlags,
    /// Operand width in bits; 0 when unknown.
    pub width: u16,
    pub segment: SegmentReg,
    /// The allocator may not substitute this operand.
    pub is_sticky: bool,
    /// Appears in the instruction text (vs. implicit/suppressed).
    pub is_explicit: bool,
    /// `Register` kind, but the operand dereferences the register.
    pub is_memory: bool,
    /// Compound memory operand (`Memory` kind) rather than `[reg]`.
    pub is_compound: bool,
    /// Address generation only; no memory access (`LEA`).
    pub is_effective_address: bool,
    /// Treat a write as a full definition even when the byte mask alone
    /// would make it a read-modify-write.
    pub is_definition: bool,
}

impl Operand {
    fn with_kind(kind: OperandKind, flags: OperandFlags, width: u16) -> Self {
        Self {
            kind,
            flags,
            width,
            segment: SegmentReg::None,
            is_sticky: false,
            is_explicit: true,
            is_memory: false,
            is_compound: false,
            is_effective_address: false,
            is_definition: false,
        }
    }

    /// A direct register operand.
    pub fn reg(reg: VirtualRegister, flags: OperandFlags) -> Self {
        Self::with_kind(OperandKind::Register(reg), flags, reg.bit_width())
    }

    /// A `[reg]` memory operand of `width` bits.
    pub fn mem_reg(base: VirtualRegister, flags: OperandFlags, width: u16) -> Self {
        let mut op = Self::with_kind(OperandKind::Register(base), flags, width);
        op.is_memory = true;
        op
    }

    /// A compound memory operand of `width` bits.
    pub fn mem(mem: MemOperand, flags: OperandFlags, width: u16) -> Self {
        let mut op = Self::with_kind(OperandKind::Memory(mem), flags, width);
        op.is_memory = true;
        op.is_compound = true;
        op
    }

    /// A `[rsp + disp]` operand of `width` bits.
    pub fn base_disp(base: VirtualRegister, disp: i32, flags: OperandFlags, width: u16) -> Self {
        Self::mem(
            MemOperand {
                base,
                index: VirtualRegister::invalid(),
                scale: 1,
                disp,
            },
            flags,
            width,
        )
    }

    /// An immediate operand.
    pub fn imm(val: i64, width: u16) -> Self {
        Self::with_kind(OperandKind::Immediate(val), OperandFlags::READ, width)
    }

    /// A memory operand at an absolute address.
    pub fn pointer(addr: u64, flags: OperandFlags, width: u16) -> Self {
        let mut op = Self::with_kind(OperandKind::Pointer(addr), flags, width);
        op.is_memory = true;
        op
    }

    /// A branch to a known pc.
    pub fn branch_pc(pc: AppPc) -> Self {
        Self::with_kind(
            OperandKind::Branch(BranchTarget::Pc(pc)),
            OperandFlags::READ,
            64,
        )
    }

    /// A branch to a label.
    pub fn branch_label(label: LabelId) -> Self {
        Self::with_kind(
            OperandKind::Branch(BranchTarget::Label(label)),
            OperandFlags::READ,
            64,
        )
    }

    /// A branch to a trace block.
    pub fn branch_block(block: BlockId) -> Self {
        Self::with_kind(
            OperandKind::Branch(BranchTarget::Block(block)),
            OperandFlags::READ,
            64,
        )
    }

    pub fn is_register(&self) -> bool {
        matches!(self.kind, OperandKind::Register(_)) && !self.is_memory
    }

    pub fn is_immediate(&self) -> bool {
        matches!(self.kind, OperandKind::Immediate(_))
    }

    pub fn is_memory(&self) -> bool {
        self.is_memory
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self.kind, OperandKind::Pointer(_))
    }

    pub fn is_branch(&self) -> bool {
        matches!(self.kind, OperandKind::Branch(_))
    }

    /// The register named by a register or `[reg]` operand.
    pub fn register(&self) -> VirtualRegister {
        match self.kind {
            OperandKind::Register(r) => r,
            _ => panic!("not a register operand"),
        }
    }

    pub fn immediate(&self) -> i64 {
        match self.kind {
            OperandKind::Immediate(v) => v,
            _ => panic!("not an immediate operand"),
        }
    }

    pub fn branch_target(&self) -> BranchTarget {
        match self.kind {
            OperandKind::Branch(t) => t,
            _ => panic!("not a branch operand"),
        }
    }

    /// All registers named by this operand, for register-set visits.
    pub fn visit_regs(&self, mut f: impl FnMut(VirtualRegister)) {
        match self.kind {
            OperandKind::Register(r) => f(r),
            OperandKind::Memory(m) => {
                if m.base.is_valid() {
                    f(m.base);
                }
                if m.index.is_valid() {
                    f(m.index);
                }
            }
            _ => {}
        }
    }

    /// Rewrite every register named by this operand.
    pub fn map_regs(&mut self, mut f: impl FnMut(VirtualRegister) -> VirtualRegister) {
        match &mut self.kind {
            OperandKind::Register(r) => *r = f(*r),
            OperandKind::Memory(m) => {
                if m.base.is_valid() {
                    m.base = f(m.base);
                }
                if m.index.is_valid() {
                    m.index = f(m.index);
                }
            }
            _ => {}
        }
    }
}

// Operands are copied around freely; keep them small enough that the
// operand list of a typical instruction stays inline.
const _: () = assert!(std::mem::size_of::<Operand>() <= 48);
