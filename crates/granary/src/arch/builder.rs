//! Constructors for synthesized instructions.
//!
//! Manglers and the edge generators build replacement instructions with
//! these helpers rather than spelling out operand lists. Every
//! constructor leaves the instruction fully analyzed.

use super::inst::{Cond, IClass, Inst, InstFlags};
use super::operand::{BranchTarget, MemOperand, Operand, OperandFlags};
use super::reg::VirtualRegister;
use super::{immediate_width_bits, ADDRESS_WIDTH_BITS, GPR_WIDTH_BITS};
use smallvec::smallvec;

fn inst(iclass: IClass, ops: smallvec::SmallVec<[Operand; 4]>, width: u16) -> Inst {
    let mut inst = Inst::new(iclass);
    inst.ops = ops;
    inst.effective_operand_width = width;
    inst.analyze_stack_usage();
    inst
}

/// `MOV dst, src` between registers.
pub fn mov_r_r(dst: VirtualRegister, src: VirtualRegister) -> Inst {
    inst(
        IClass::Mov,
        smallvec![
            Operand::reg(dst, OperandFlags::WRITE),
            Operand::reg(src, OperandFlags::READ),
        ],
        dst.bit_width(),
    )
}

/// `MOV dst, mem` load through an arbitrary memory operand.
pub fn mov_r_mem(dst: VirtualRegister, mut mem: Operand) -> Inst {
    mem.flags = OperandFlags::READ;
    mem.width = dst.bit_width();
    inst(
        IClass::Mov,
        smallvec![Operand::reg(dst, OperandFlags::WRITE), mem],
        dst.bit_width(),
    )
}

/// `MOV mem, src` store through an arbitrary memory operand.
pub fn mov_mem_r(mut mem: Operand, src: VirtualRegister) -> Inst {
    mem.flags = OperandFlags::WRITE;
    mem.width = src.bit_width();
    inst(
        IClass::Mov,
        smallvec![mem, Operand::reg(src, OperandFlags::READ)],
        src.bit_width(),
    )
}

/// `MOV mem, imm` store of an immediate sized to the operand width.
pub fn mov_mem_imm(mut mem: Operand, imm: i64, width: u16) -> Inst {
    mem.flags = OperandFlags::WRITE;
    mem.width = width;
    inst(
        IClass::Mov,
        smallvec![mem, Operand::imm(imm, width.min(32))],
        width,
    )
}

/// `MOV dst, imm`. Wide immediates use the 64-bit form; narrow ones are
/// shortened to the 32-bit zero-extending form.
pub fn mov_r_imm(mut dst: VirtualRegister, imm: u64) -> Inst {
    let imm_width = immediate_width_bits(imm);
    if imm_width <= 32 && u32::try_from(imm).is_ok() {
        dst.widen(4);
        inst(
            IClass::Mov,
            smallvec![
                Operand::reg(dst, OperandFlags::WRITE),
                Operand::imm(imm as i64, 32),
            ],
            32,
        )
    } else {
        inst(
            IClass::Mov,
            smallvec![
                Operand::reg(dst, OperandFlags::WRITE),
                Operand::imm(imm as i64, 64),
            ],
            64,
        )
    }
}

/// `MOV r16, seg`.
pub fn mov_r16_seg(dst: VirtualRegister, seg: VirtualRegister) -> Inst {
    let mut seg_op = Operand::reg(seg, OperandFlags::READ);
    seg_op.is_sticky = true;
    inst(
        IClass::MovSeg,
        smallvec![Operand::reg(dst, OperandFlags::WRITE), seg_op],
        16,
    )
}

/// `MOV seg, r16`.
pub fn mov_seg_r16(seg: VirtualRegister, src: VirtualRegister) -> Inst {
    let mut seg_op = Operand::reg(seg, OperandFlags::WRITE);
    seg_op.is_sticky = true;
    inst(
        IClass::MovSeg,
        smallvec![seg_op, Operand::reg(src, OperandFlags::READ)],
        16,
    )
}

/// `MOVZX dst, src` where `src` is a narrower register view.
pub fn movzx_r_r(dst: VirtualRegister, src: VirtualRegister) -> Inst {
    inst(
        IClass::Movzx,
        smallvec![
            Operand::reg(dst, OperandFlags::WRITE),
            Operand::reg(src, OperandFlags::READ),
        ],
        dst.bit_width(),
    )
}

/// `LEA dst, [mem]`.
pub fn lea(dst: VirtualRegister, mem: MemOperand) -> Inst {
    let mut mem_op = Operand::mem(mem, OperandFlags::READ, ADDRESS_WIDTH_BITS);
    mem_op.is_effective_address = true;
    mem_op.segment = super::operand::SegmentReg::None;
    inst(
        IClass::Lea,
        smallvec![Operand::reg(dst, OperandFlags::WRITE), mem_op],
        GPR_WIDTH_BITS,
    )
}

/// `LEA dst, [base + disp]`.
pub fn lea_base_disp(dst: VirtualRegister, base: VirtualRegister, disp: i32) -> Inst {
    lea(
        dst,
        MemOperand {
            base,
            index: VirtualRegister::invalid(),
            scale: 1,
            disp,
        },
    )
}

/// `LEA dst, [base + index]`.
pub fn lea_base_index(dst: VirtualRegister, base: VirtualRegister, index: VirtualRegister) -> Inst {
    lea(
        dst,
        MemOperand {
            base,
            index,
            scale: 1,
            disp: 0,
        },
    )
}

/// `LEA RSP, [RSP + disp]`: the canonical stack shift.
pub fn lea_rsp_disp(disp: i32) -> Inst {
    lea_base_disp(VirtualRegister::stack_pointer(), VirtualRegister::stack_pointer(), disp)
}

/// `PUSH reg`.
pub fn push_r(reg: VirtualRegister) -> Inst {
    let mut i = inst(
        IClass::Push,
        smallvec![Operand::reg(reg, OperandFlags::READ)],
        GPR_WIDTH_BITS,
    );
    i.analyze_stack_usage();
    i
}

/// `PUSH imm` (sign-extended to 64 bits by hardware).
pub fn push_imm(imm: i32) -> Inst {
    inst(
        IClass::Push,
        smallvec![Operand::imm(i64::from(imm), 32)],
        ADDRESS_WIDTH_BITS,
    )
}

/// `PUSH mem`.
pub fn push_mem(mut mem: Operand) -> Inst {
    mem.flags = OperandFlags::READ;
    mem.width = GPR_WIDTH_BITS;
    inst(IClass::Push, smallvec![mem], GPR_WIDTH_BITS)
}

/// `POP reg`.
pub fn pop_r(reg: VirtualRegister) -> Inst {
    inst(
        IClass::Pop,
        smallvec![Operand::reg(reg, OperandFlags::WRITE)],
        GPR_WIDTH_BITS,
    )
}

/// `PUSHFQ`.
pub fn pushfq() -> Inst {
    inst(IClass::Pushf, smallvec![], GPR_WIDTH_BITS)
}

/// `POPFQ`.
pub fn popfq() -> Inst {
    inst(IClass::Popf, smallvec![], GPR_WIDTH_BITS)
}

/// `CALL rel32` to a fixed target.
pub fn call_rel(target: usize) -> Inst {
    inst(
        IClass::Call,
        smallvec![Operand::branch_pc(target)],
        ADDRESS_WIDTH_BITS,
    )
}

/// `CALL reg`.
pub fn call_r(reg: VirtualRegister) -> Inst {
    inst(
        IClass::Call,
        smallvec![Operand::reg(reg, OperandFlags::READ)],
        ADDRESS_WIDTH_BITS,
    )
}

/// `CALL [addr]`: indirect through a 64-bit cell at `addr`.
pub fn call_mem_abs(addr: usize) -> Inst {
    inst(
        IClass::Call,
        smallvec![Operand::pointer(addr as u64, OperandFlags::READ, 64)],
        ADDRESS_WIDTH_BITS,
    )
}

/// `JMP` to a branch target.
pub fn jmp(target: BranchTarget) -> Inst {
    let op = match target {
        BranchTarget::Pc(pc) => Operand::branch_pc(pc),
        BranchTarget::Label(l) => Operand::branch_label(l),
        BranchTarget::Block(b) => Operand::branch_block(b),
    };
    inst(IClass::Jmp, smallvec![op], ADDRESS_WIDTH_BITS)
}

/// `JMP rel32` to a fixed pc.
pub fn jmp_rel(target: usize) -> Inst {
    jmp(BranchTarget::Pc(target))
}

/// `JMP reg`.
pub fn jmp_r(reg: VirtualRegister) -> Inst {
    inst(
        IClass::Jmp,
        smallvec![Operand::reg(reg, OperandFlags::READ)],
        ADDRESS_WIDTH_BITS,
    )
}

/// `JMP [addr]`: indirect through a 64-bit cell at `addr`.
pub fn jmp_mem_abs(addr: usize) -> Inst {
    inst(
        IClass::Jmp,
        smallvec![Operand::pointer(addr as u64, OperandFlags::READ, 64)],
        ADDRESS_WIDTH_BITS,
    )
}

/// `JMP [base + disp]`.
pub fn jmp_mem(base: VirtualRegister, disp: i32) -> Inst {
    let mem = Operand::base_disp(base, disp, OperandFlags::READ, 64);
    inst(IClass::Jmp, smallvec![mem], ADDRESS_WIDTH_BITS)
}

/// `Jcc` to a branch target.
pub fn jcc(cond: Cond, target: BranchTarget) -> Inst {
    let op = match target {
        BranchTarget::Pc(pc) => Operand::branch_pc(pc),
        BranchTarget::Label(l) => Operand::branch_label(l),
        BranchTarget::Block(b) => Operand::branch_block(b),
    };
    inst(IClass::Jcc(cond), smallvec![op], ADDRESS_WIDTH_BITS)
}

/// `JRCXZ` to a label (8-bit displacement only).
pub fn jrcxz(target: BranchTarget) -> Inst {
    let op = match target {
        BranchTarget::Pc(pc) => Operand::branch_pc(pc),
        BranchTarget::Label(l) => Operand::branch_label(l),
        BranchTarget::Block(b) => Operand::branch_block(b),
    };
    inst(IClass::Jrcxz, smallvec![op], ADDRESS_WIDTH_BITS)
}

/// `RET`.
pub fn ret() -> Inst {
    inst(IClass::Ret, smallvec![], ADDRESS_WIDTH_BITS)
}

/// `UD2`: stops speculative decode past an indirect jump.
pub fn ud2() -> Inst {
    inst(IClass::Ud2, smallvec![], 0)
}

/// `NOP`.
pub fn nop() -> Inst {
    inst(IClass::Nop, smallvec![], 0)
}

/// `CLI`.
pub fn cli() -> Inst {
    inst(IClass::Cli, smallvec![], 0)
}

/// `STI`.
pub fn sti() -> Inst {
    inst(IClass::Sti, smallvec![], 0)
}

/// `TEST reg, reg`.
pub fn test_r_r(a: VirtualRegister, b: VirtualRegister) -> Inst {
    inst(
        IClass::Test,
        smallvec![
            Operand::reg(a, OperandFlags::READ),
            Operand::reg(b, OperandFlags::READ),
        ],
        a.bit_width(),
    )
}

/// `XCHG mem, reg`.
pub fn xchg_mem_r(mut mem: Operand, reg: VirtualRegister) -> Inst {
    mem.flags = OperandFlags::RW;
    mem.width = reg.bit_width();
    let mut i = inst(
        IClass::Xchg,
        smallvec![mem, Operand::reg(reg, OperandFlags::RW)],
        reg.bit_width(),
    );
    i.flags.insert(InstFlags::IS_ATOMIC);
    i
}

/// An instruction carried as literal bytes. Used for the handful of
/// fixed trampoline instructions the encoder has no builder for.
pub fn raw_bytes(bytes: &[u8]) -> Inst {
    use crate::arch::layout::RawEncoding;
    let mut inst = Inst::new(IClass::Other);
    inst.raw = Some(RawEncoding {
        bytes: smallvec::SmallVec::from_slice(bytes),
        layout: None,
        fields: smallvec::SmallVec::new(),
    });
    inst.analyze_stack_usage();
    inst
}

/// Mark an instruction stack-blind: it really touches the stack but the
/// slot allocator must look away.
pub fn stack_blind(mut inst: Inst) -> Inst {
    inst.flags.insert(InstFlags::IS_STACK_BLIND);
    inst.flags.remove(InstFlags::ANALYZED_STACK_USAGE);
    inst.analyze_stack_usage();
    inst
}

/// Mark an instruction sticky: later passes may not remove or rewrite it.
pub fn sticky(mut inst: Inst) -> Inst {
    inst.flags.insert(InstFlags::IS_STICKY);
    inst
}
