//! The mutable instruction IR.
//!
//! Instructions are decoded into this form, mangled in place, and encoded
//! back out. An instruction list also carries zero-width pseudo-entries
//! ([`Stmt::Label`] and [`Stmt::Annot`]) that never produce bytes.

use super::layout::RawEncoding;
use super::operand::{BranchTarget, LabelId, Operand, OperandKind};
use super::reg::VirtualRegister;
use crate::{AppPc, CachePc};
use bitflags::bitflags;
use smallvec::SmallVec;

/// Condition codes in hardware encoding order (`0x70 + cc` short jumps).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    O = 0,
    No = 1,
    B = 2,
    Nb = 3,
    Z = 4,
    Nz = 5,
    Be = 6,
    Nbe = 7,
    S = 8,
    Ns = 9,
    P = 10,
    Np = 11,
    L = 12,
    Nl = 13,
    Le = 14,
    Nle = 15,
}

impl Cond {
    pub fn code(self) -> u8 {
        self as u8
    }

    /// The negated condition.
    pub fn negate(self) -> Self {
        Self::from_code(self.code() ^ 1)
    }

    pub fn from_code(code: u8) -> Self {
        use Cond::*;
        const TABLE: [Cond; 16] = [
            O, No, B, Nb, Z, Nz, Be, Nbe, S, Ns, P, Np, L, Nl, Le, Nle,
        ];
        TABLE[usize::from(code & 15)]
    }

    fn from_suffix(s: &str) -> Option<Self> {
        use Cond::*;
        Some(match s {
            "o" => O,
            "no" => No,
            "b" | "c" | "nae" => B,
            "nb" | "nc" | "ae" => Nb,
            "z" | "e" => Z,
            "nz" | "ne" => Nz,
            "be" | "na" => Be,
            "nbe" | "a" => Nbe,
            "s" => S,
            "ns" => Ns,
            "p" | "pe" => P,
            "np" | "po" => Np,
            "l" | "nge" => L,
            "nl" | "ge" => Nl,
            "le" | "ng" => Le,
            "nle" | "g" => Nle,
            _ => return None,
        })
    }
}

/// Instruction classes the translator reasons about. Anything else is
/// `Other` and passes through on its original bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum IClass {
    #[default]
    Invalid,
    Mov,
    MovSeg,
    Movzx,
    Lea,
    Push,
    Pop,
    Pushf,
    Popf,
    Call,
    CallFar,
    Jmp,
    JmpFar,
    Jcc(Cond),
    Jrcxz,
    Jecxz,
    Loop,
    Loope,
    Loopne,
    Ret,
    RetFar,
    Iret,
    Syscall,
    Sysret,
    Int,
    Int3,
    Ud2,
    Hlt,
    Swapgs,
    Xbegin,
    Xend,
    Xabort,
    Xtest,
    Xlat,
    Enter,
    Leave,
    Cli,
    Sti,
    Nop,
    Test,
    Xchg,
    Add,
    Sub,
    Inc,
    Dec,
    Other,
}

impl IClass {
    /// Classify a capstone mnemonic. Prefix words (`lock`, `rep`, …) are
    /// carried separately, so only the final token matters.
    pub fn from_mnemonic(mnemonic: &str) -> Self {
        use IClass::*;
        let m = mnemonic.split_whitespace().last().unwrap_or("");
        if let Some(stripped) = m.strip_prefix('j') {
            match stripped {
                "mp" => return Jmp,
                "rcxz" => return Jrcxz,
                "ecxz" => return Jecxz,
                _ => {
                    if let Some(cond) = Cond::from_suffix(stripped) {
                        return Jcc(cond);
                    }
                }
            }
        }
        match m {
            "mov" | "movabs" => Mov,
            "movzx" => Movzx,
            "lea" => Lea,
            "push" => Push,
            "pop" => Pop,
            "pushf" | "pushfq" => Pushf,
            "popf" | "popfq" => Popf,
            "call" => Call,
            "lcall" => CallFar,
            "ljmp" => JmpFar,
            "loop" => Loop,
            "loope" => Loope,
            "loopne" => Loopne,
            "ret" | "retq" => Ret,
            "retf" | "lret" => RetFar,
            "iret" | "iretd" | "iretq" => Iret,
            "syscall" => Syscall,
            "sysret" | "sysretq" => Sysret,
            "int" => Int,
            "int3" => Int3,
            "ud2" => Ud2,
            "hlt" => Hlt,
            "swapgs" => Swapgs,
            "xbegin" => Xbegin,
            "xend" => Xend,
            "xabort" => Xabort,
            "xtest" => Xtest,
            "xlat" | "xlatb" => Xlat,
            "enter" => Enter,
            "leave" => Leave,
            "cli" => Cli,
            "sti" => Sti,
            "nop" => Nop,
            "test" => Test,
            "xchg" => Xchg,
            "add" => Add,
            "sub" => Sub,
            "inc" => Inc,
            "dec" => Dec,
            _ => Other,
        }
    }

    /// Decoding cannot continue past these.
    pub fn ends_decoding(self) -> bool {
        use IClass::*;
        matches!(
            self,
            Ud2 | Hlt | Swapgs | Sysret | Xbegin | Xend | Xabort | Xtest
        )
    }
}

/// Control-flow category of an instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Category {
    #[default]
    None,
    Call,
    Ret,
    CondBr,
    UncondBr,
    Interrupt,
    Syscall,
    Sysret,
    Nop,
}

impl Category {
    pub fn of(iclass: IClass) -> Self {
        use IClass::*;
        match iclass {
            Call | CallFar => Category::Call,
            Ret | RetFar | Iret => Category::Ret,
            Jcc(_) | Jrcxz | Jecxz | Loop | Loope | Loopne => Category::CondBr,
            Jmp | JmpFar => Category::UncondBr,
            Int | Int3 => Category::Interrupt,
            IClass::Syscall => Category::Syscall,
            IClass::Sysret => Category::Sysret,
            IClass::Nop => Category::Nop,
            _ => Category::None,
        }
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct InstFlags: u16 {
        const PREFIX_REP = 1 << 0;
        const PREFIX_REPNE = 1 << 1;
        const PREFIX_LOCK = 1 << 2;
        const READS_STACK_POINTER = 1 << 3;
        const WRITES_STACK_POINTER = 1 << 4;
        const ANALYZED_STACK_USAGE = 1 << 5;
        const IS_ATOMIC = 1 << 6;
        const IS_SAVE_RESTORE = 1 << 7;
        const IS_STICKY = 1 << 8;
        const IS_STACK_BLIND = 1 << 9;
        const DONT_ENCODE = 1 << 10;
        const IS_TAIL_CALL = 1 << 11;
        const USES_LEGACY_REGS = 1 << 12;
        /// Some operand was rewritten after decode; the original bytes
        /// no longer encode this instruction.
        const OPERANDS_MODIFIED = 1 << 13;
        /// Carries a pc-relative operand that must be re-resolved at its
        /// encoded location.
        const NEEDS_RELOCATION = 1 << 14;
    }
}

/// Upper bound on operands an instruction can carry.
pub const MAX_NUM_OPERANDS: usize = 11;

/// One machine instruction in the IR.
#[derive(Clone, Debug, Default)]
pub struct Inst {
    pub iclass: IClass,
    pub category: Category,
    /// The decoder's refined instruction id (capstone's), for diagnostics
    /// and special-casing; 0 for synthesized instructions.
    pub iform: u32,
    pub ops: SmallVec<[Operand; 4]>,
    /// Effective operand width in bits; 0 when unknown.
    pub effective_operand_width: u16,
    pub decoded_pc: Option<AppPc>,
    pub decoded_length: u8,
    pub encoded_pc: Option<CachePc>,
    pub encoded_length: u8,
    /// Original bytes and their field layout, present on decoded
    /// instructions. Re-encoding reuses these wherever possible.
    pub raw: Option<RawEncoding>,
    pub flags: InstFlags,
}

impl Inst {
    pub fn new(iclass: IClass) -> Self {
        Self {
            iclass,
            category: Category::of(iclass),
            ..Self::default()
        }
    }

    pub fn is_function_call(&self) -> bool {
        self.category == Category::Call
    }

    pub fn is_function_return(&self) -> bool {
        matches!(self.iclass, IClass::Ret | IClass::RetFar)
    }

    pub fn is_conditional_jump(&self) -> bool {
        self.category == Category::CondBr
    }

    pub fn is_unconditional_jump(&self) -> bool {
        self.category == Category::UncondBr
    }

    pub fn is_jump(&self) -> bool {
        self.is_conditional_jump() || self.is_unconditional_jump()
    }

    /// A control-flow instruction that ends a block. Interrupts and
    /// system calls come back to the next instruction, so they do not
    /// terminate anything.
    pub fn is_cti(&self) -> bool {
        !matches!(
            self.category,
            Category::None | Category::Nop | Category::Interrupt | Category::Syscall
        )
    }

    /// Does a control-flow instruction target something not expressible
    /// as a program counter (register or memory operand)?
    pub fn has_indirect_target(&self) -> bool {
        if !self.is_cti() {
            return false;
        }
        if self.is_function_return() || matches!(self.category, Category::Syscall | Category::Sysret)
        {
            return true;
        }
        match self.ops.first() {
            Some(op) => !op.is_branch(),
            None => true,
        }
    }

    /// The pc a direct branch goes to, if its target is still a pc.
    pub fn branch_target_pc(&self) -> Option<AppPc> {
        match self.ops.first()?.kind {
            OperandKind::Branch(BranchTarget::Pc(pc)) => Some(pc),
            _ => None,
        }
    }

    /// Point the branch at a pc.
    pub fn set_branch_target_pc(&mut self, pc: usize) {
        self.ops[0] = Operand::branch_pc(pc);
    }

    /// Point the branch at a label.
    pub fn set_branch_target_label(&mut self, label: LabelId) {
        self.ops[0] = Operand::branch_label(label);
    }

    pub fn is_sticky(&self) -> bool {
        self.flags.contains(InstFlags::IS_STICKY)
    }

    pub fn is_stack_blind(&self) -> bool {
        self.flags.contains(InstFlags::IS_STACK_BLIND)
    }

    pub fn is_save_restore(&self) -> bool {
        self.flags.contains(InstFlags::IS_SAVE_RESTORE)
    }

    pub fn will_be_encoded(&self) -> bool {
        !self.flags.contains(InstFlags::DONT_ENCODE)
    }

    pub fn reads_from_stack_pointer(&self) -> bool {
        self.ensure_stack_analysis();
        self.flags.contains(InstFlags::READS_STACK_POINTER)
    }

    pub fn writes_to_stack_pointer(&self) -> bool {
        self.ensure_stack_analysis();
        self.flags.contains(InstFlags::WRITES_STACK_POINTER)
    }

    fn ensure_stack_analysis(&self) {
        debug_assert!(
            self.flags.contains(InstFlags::ANALYZED_STACK_USAGE),
            "stack usage queried before analysis: {self:?}"
        );
    }

    /// Recompute the stack-pointer usage bits from the operands and the
    /// instruction class. Must be re-run after operand mutation.
    pub fn analyze_stack_usage(&mut self) {
        use IClass::*;
        self.flags.remove(InstFlags::READS_STACK_POINTER | InstFlags::WRITES_STACK_POINTER);
        self.flags.insert(InstFlags::ANALYZED_STACK_USAGE);
        if self.is_stack_blind() {
            return;
        }
        let (mut reads, mut writes) = match self.iclass {
            Push | Pop | Pushf | Popf | Call | CallFar | Ret | RetFar | Iret | Enter | Leave => {
                (true, true)
            }
            _ => (false, false),
        };
        for op in &self.ops {
            match op.kind {
                OperandKind::Register(r) if r.is_stack_pointer() => {
                    if op.is_memory() {
                        reads = true;
                    } else {
                        if op.flags.is_read() {
                            reads = true;
                        }
                        if op.flags.is_write() {
                            writes = true;
                        }
                    }
                }
                OperandKind::Memory(m)
                    if m.base.is_stack_pointer() || m.index.is_stack_pointer() =>
                {
                    reads = true;
                }
                _ => {}
            }
        }
        // LEA of the stack pointer writes it without reading memory.
        if self.iclass == Lea {
            if let Some(dst) = self.ops.first() {
                if dst.is_register() && dst.register().is_stack_pointer() {
                    writes = true;
                }
            }
        }
        if reads {
            self.flags.insert(InstFlags::READS_STACK_POINTER);
        }
        if writes {
            self.flags.insert(InstFlags::WRITES_STACK_POINTER);
        }
    }

    /// Does this instruction move the stack pointer by a statically known
    /// amount?
    pub fn shifts_stack_pointer(&self) -> bool {
        self.stack_pointer_shift_amount().is_some()
    }

    /// The statically known stack-pointer shift, in bytes. Positive
    /// shifts shrink the stack (`pop`), negative grow it (`push`).
    ///
    /// Meaningful only after early mangling, which removes `ENTER` and
    /// `LEAVE`.
    pub fn stack_pointer_shift_amount(&self) -> Option<i32> {
        use IClass::*;
        let op_bytes = i32::from(if self.effective_operand_width != 0 {
            self.effective_operand_width / 8
        } else {
            8
        });
        match self.iclass {
            Push | Pushf => Some(-op_bytes),
            Pop | Popf => Some(op_bytes),
            Call => Some(-8),
            Ret => {
                let imm = match self.ops.first() {
                    Some(op) if op.is_immediate() => op.immediate() as i32,
                    _ => 0,
                };
                Some(8 + imm)
            }
            Lea => {
                // `LEA RSP, [RSP + k]` is the canonical mangled shift.
                let dst = self.ops.first()?;
                if !dst.is_register() || !dst.register().is_stack_pointer() {
                    return None;
                }
                match self.ops.get(1)?.kind {
                    OperandKind::Memory(m)
                        if m.base.is_stack_pointer() && !m.index.is_valid() =>
                    {
                        Some(m.disp)
                    }
                    _ => None,
                }
            }
            _ => None,
        }
    }

    /// Does this instruction change interrupt deliverability?
    pub fn changes_interrupt_state(&self) -> bool {
        matches!(
            self.iclass,
            IClass::Cli | IClass::Sti | IClass::Popf
        )
    }

    /// Invalidate cached per-operand analyses after mutating operands.
    pub fn touch_operands(&mut self) {
        self.flags.remove(InstFlags::ANALYZED_STACK_USAGE);
        self.flags.insert(InstFlags::OPERANDS_MODIFIED);
    }

    /// Visit every register named by any operand.
    pub fn visit_regs(&self, mut f: impl FnMut(VirtualRegister)) {
        for op in &self.ops {
            op.visit_regs(&mut f);
        }
    }
}

/// The destination an `UpdateEncodedAddress` annotation writes to: the
/// address of an `AtomicUsize` owned by an edge structure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EncodedAddrSink(pub usize);

/// Pseudo-instructions: zero bytes of code, but semantic weight in the
/// pipeline.
#[derive(Clone, Debug, PartialEq)]
pub enum Annotation {
    /// The stack pointer is not trustworthy until re-established.
    InvalidStack,
    /// An instruction nearby may enable or disable interrupts; flag
    /// save/restore must not straddle this point.
    InterruptStateChange,
    /// At commit, store the current encoded pc into the sink.
    UpdateEncodedAddress(EncodedAddrSink),
}

/// One entry in a block's instruction list.
#[derive(Clone, Debug)]
pub enum Stmt {
    Native(Inst),
    Label(LabelId),
    Annot(Annotation),
}

impl Stmt {
    pub fn native(&self) -> Option<&Inst> {
        match self {
            Stmt::Native(inst) => Some(inst),
            _ => None,
        }
    }

    pub fn native_mut(&mut self) -> Option<&mut Inst> {
        match self {
            Stmt::Native(inst) => Some(inst),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mnemonic_classification() {
        assert_eq!(IClass::from_mnemonic("mov"), IClass::Mov);
        assert_eq!(IClass::from_mnemonic("lock add"), IClass::Add);
        assert_eq!(IClass::from_mnemonic("je"), IClass::Jcc(Cond::Z));
        assert_eq!(IClass::from_mnemonic("jnz"), IClass::Jcc(Cond::Nz));
        assert_eq!(IClass::from_mnemonic("jrcxz"), IClass::Jrcxz);
        assert_eq!(IClass::from_mnemonic("jmp"), IClass::Jmp);
        assert_eq!(IClass::from_mnemonic("fld"), IClass::Other);
    }

    #[test]
    fn condition_negation_flips_the_low_bit() {
        assert_eq!(Cond::Z.negate(), Cond::Nz);
        assert_eq!(Cond::Nbe.negate(), Cond::Be);
        assert_eq!(Cond::L.negate(), Cond::Nl);
    }

    #[test]
    fn push_shifts_down_pop_shifts_up() {
        let mut push = Inst::new(IClass::Push);
        push.effective_operand_width = 64;
        assert_eq!(push.stack_pointer_shift_amount(), Some(-8));
        let mut pop = Inst::new(IClass::Pop);
        pop.effective_operand_width = 64;
        assert_eq!(pop.stack_pointer_shift_amount(), Some(8));
    }
}
