//! Late mangling: post-allocation rewriting of control flow and far
//! operands.
//!
//! Runs after trace construction, once the rough location of the encoded
//! code (the cache arenas) is known. Branches whose targets cannot be
//! reached with a 32-bit displacement are routed through owned
//! native-address cells; loop instructions lose their 8-bit displacement
//! restriction through a small trampoline; absolute memory operands too
//! wide for a displacement are loaded into a register first.

use super::builder;
use super::inst::{IClass, Inst, Stmt};
use super::operand::{BranchTarget, Operand, OperandFlags, OperandKind, SegmentReg};
use super::{immediate_width_bits, GPR_WIDTH_BYTES};
use crate::cfg::{Block, BlockId, Trace};
use crate::metadata::CacheMetaData;
use log::trace;

/// What late mangling needs from the translation context.
pub trait LateMangleEnv {
    /// Can code placed in the cache reach `target` with a rel32?
    fn is_reachable(&self, target: usize) -> bool;

    /// Allocate an owned 8-byte cell holding `value`, returning its
    /// address. The cell outlives the translated code and is always
    /// rip-reachable from it.
    fn alloc_native_address(&mut self, value: usize) -> usize;
}

/// Late-mangle one decoded block of `trace`.
pub fn mangle_block(trace: &mut Trace, id: BlockId, env: &mut dyn LateMangleEnv) {
    // Take the block out of the arena so labels can still be minted.
    let Some(mut block) = take_decoded(trace, id) else {
        return;
    };

    let old = std::mem::take(&mut block.stmts);
    let mut out = Vec::with_capacity(old.len());
    for stmt in old {
        match stmt {
            Stmt::Native(mut inst) => {
                resolve_block_targets(trace, &mut inst);
                if inst.is_cti() && inst.ops.first().map(|op| op.is_branch()).unwrap_or(false) {
                    mangle_direct_cti(trace, env, &mut block.meta, &mut out, inst);
                } else {
                    relativize_mem_ops(env, &mut block.meta, &mut out, &mut inst);
                    out.push(Stmt::Native(inst));
                }
            }
            other => out.push(other),
        }
    }
    block.stmts = out;

    put_decoded(trace, id, block);
}

/// Convert an unspecialized return into an indirect jump so it flows
/// through the indirect-edge machinery. Used when the return's metadata
/// is in use.
pub fn mangle_indirect_return(trace: &mut Trace, id: BlockId) {
    let Some(mut block) = take_decoded(trace, id) else {
        return;
    };
    if let Some(Stmt::Native(inst)) = block.stmts.last() {
        if inst.iclass == IClass::Ret {
            let shift = inst.stack_pointer_shift_amount().unwrap_or(8);
            let target = trace.alloc_virtual_register(GPR_WIDTH_BYTES);
            block.stmts.pop();
            if shift == 8 {
                let mut pop = builder::pop_r(target);
                pop.effective_operand_width = super::ADDRESS_WIDTH_BITS;
                block.stmts.push(Stmt::Native(pop));
            } else {
                // `RET imm16` releases extra bytes beyond the address.
                let rsp = super::reg::VirtualRegister::stack_pointer();
                let top = Operand::base_disp(rsp, 0, OperandFlags::READ, 64);
                block.stmts.push(Stmt::Native(builder::mov_r_mem(target, top)));
                block.stmts.push(Stmt::Native(builder::lea_rsp_disp(shift)));
            }
            block.stmts.push(Stmt::Native(builder::jmp_r(target)));
        }
    }
    put_decoded(trace, id, block);
}

fn take_decoded(trace: &mut Trace, id: BlockId) -> Option<crate::cfg::DecodedBlock> {
    let placeholder = Block::Return { uses_meta: false };
    match std::mem::replace(trace.block_mut(id), placeholder) {
        Block::Decoded(b) => Some(b),
        Block::Compensation(b) => Some(b),
        other => {
            *trace.block_mut(id) = other;
            None
        }
    }
}

fn put_decoded(trace: &mut Trace, id: BlockId, block: crate::cfg::DecodedBlock) {
    *trace.block_mut(id) = Block::Decoded(block);
}

/// Branches to native or already-cached blocks learn their concrete
/// target pcs; everything else keeps its block reference.
fn resolve_block_targets(trace: &Trace, inst: &mut Inst) {
    let Some(op) = inst.ops.first_mut() else {
        return;
    };
    if let OperandKind::Branch(BranchTarget::Block(id)) = op.kind {
        match trace.block(id) {
            Block::Native { target } => *op = Operand::branch_pc(*target),
            Block::Cached { start_pc, .. } => *op = Operand::branch_pc(*start_pc),
            _ => {}
        }
    }
}

fn is_loop_family(iclass: IClass) -> bool {
    matches!(
        iclass,
        IClass::Jrcxz | IClass::Jecxz | IClass::Loop | IClass::Loope | IClass::Loopne
    )
}

fn mangle_direct_cti(
    trace: &mut Trace,
    env: &mut dyn LateMangleEnv,
    meta: &mut crate::metadata::Meta,
    out: &mut Vec<Stmt>,
    mut inst: Inst,
) {
    let target = inst.branch_target_pc();
    let far = target.map(|pc| !env.is_reachable(pc)).unwrap_or(false);

    if is_loop_family(inst.iclass) {
        // The 8-bit displacement cannot reach another block, so bounce
        // through a pair of near jumps:
        //     jmp  try_loop
        // do_loop:
        //     jmp  <target>
        // try_loop:
        //     loop do_loop
        let do_loop = trace.alloc_label();
        let try_loop = trace.alloc_label();
        out.push(Stmt::Native(builder::jmp(BranchTarget::Label(try_loop))));
        out.push(Stmt::Label(do_loop));
        let inner_target = inst.ops[0].branch_target();
        let mut inner = builder::jmp(inner_target);
        if far {
            indirect_through_cell(env, meta, &mut inner, target.unwrap());
            out.push(Stmt::Native(inner));
            out.push(Stmt::Native(builder::ud2()));
        } else {
            out.push(Stmt::Native(inner));
        }
        out.push(Stmt::Label(try_loop));
        inst.set_branch_target_label(do_loop);
        out.push(Stmt::Native(inst));
        return;
    }

    if !far {
        out.push(Stmt::Native(inst));
        return;
    }
    let target = target.expect("far implies a pc target");
    trace!("relativize far branch to {target:#x}");

    match inst.iclass {
        IClass::Call => {
            indirect_through_cell(env, meta, &mut inst, target);
            out.push(Stmt::Native(inst));
        }
        IClass::Jmp => {
            indirect_through_cell(env, meta, &mut inst, target);
            out.push(Stmt::Native(inst));
            // Keep the front end from running ahead into whatever
            // follows the indirect jump.
            out.push(Stmt::Native(builder::ud2()));
        }
        IClass::Jcc(cond) => {
            // Negate the condition over a rewritten indirect jump.
            let skip = trace.alloc_label();
            out.push(Stmt::Native(builder::jcc(
                cond.negate(),
                BranchTarget::Label(skip),
            )));
            indirect_through_cell(env, meta, &mut inst, target);
            inst.iclass = IClass::Jmp;
            inst.category = super::inst::Category::UncondBr;
            out.push(Stmt::Native(inst));
            out.push(Stmt::Native(builder::ud2()));
            out.push(Stmt::Label(skip));
        }
        _ => unreachable!("far target on unexpected branch: {inst:?}"),
    }
}

/// Rewrite a direct branch into an indirect one through an owned
/// 8-byte cell holding the target.
fn indirect_through_cell(
    env: &mut dyn LateMangleEnv,
    meta: &mut crate::metadata::Meta,
    inst: &mut Inst,
    target: usize,
) {
    let cell = env.alloc_native_address(target);
    meta.get_mut::<CacheMetaData>().native_addresses.push(cell);
    inst.ops[0] = Operand::pointer(cell as u64, OperandFlags::READ, 64);
    inst.flags.insert(super::inst::InstFlags::IS_STICKY);
    inst.touch_operands();
    inst.analyze_stack_usage();
}

/// Absolute memory operands whose addresses exceed a sign-extended
/// disp32 and are not rip-reachable get loaded into a register first;
/// a LEA of such a pointer is just a constant load.
fn relativize_mem_ops(
    env: &mut dyn LateMangleEnv,
    _meta: &mut crate::metadata::Meta,
    out: &mut Vec<Stmt>,
    inst: &mut Inst,
) {
    let mut fix: Option<(usize, u64)> = None;
    for (i, op) in inst.ops.iter().enumerate() {
        if let OperandKind::Pointer(addr) = op.kind {
            if op.segment != SegmentReg::None {
                continue;
            }
            if immediate_width_bits(addr) > 32 && !env.is_reachable(addr as usize) {
                fix = Some((i, addr));
                break;
            }
        }
    }
    let Some((i, addr)) = fix else {
        return;
    };

    if inst.iclass == IClass::Lea {
        // The address computation has a known answer.
        let dst = inst.ops[0].register();
        let decoded_pc = inst.decoded_pc;
        *inst = builder::mov_r_imm(dst, addr);
        inst.decoded_pc = decoded_pc;
        return;
    }

    // Load the address into a scratch register for scheduling. The
    // per-instruction pool is free again by this point.
    let addr_reg = super::reg::VirtualRegister::virtual_reg(14, GPR_WIDTH_BYTES);
    out.push(Stmt::Native(builder::mov_r_imm(addr_reg, addr)));
    let old = inst.ops[i];
    let mut new_op = Operand::mem_reg(addr_reg, old.flags, old.width);
    new_op.is_effective_address = old.is_effective_address;
    inst.ops[i] = new_op;
    inst.touch_operands();
    inst.analyze_stack_usage();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::DecodedBlock;
    use crate::metadata::{standard_manager, Meta};

    struct TestEnv {
        cells: Vec<Box<u64>>,
    }

    impl LateMangleEnv for TestEnv {
        fn is_reachable(&self, target: usize) -> bool {
            target < 0x8000_0000
        }

        fn alloc_native_address(&mut self, value: usize) -> usize {
            self.cells.push(Box::new(value as u64));
            self.cells.last().unwrap().as_ref() as *const u64 as usize
        }
    }

    fn run(stmts: Vec<Stmt>) -> (Vec<Stmt>, TestEnv) {
        let mgr = standard_manager();
        let mut trace = Trace::new();
        let mut block = DecodedBlock::new(0x1000, Meta::allocate(&mgr));
        block.stmts = stmts;
        let id = trace.add_block(Block::Decoded(block));
        let mut env = TestEnv { cells: Vec::new() };
        mangle_block(&mut trace, id, &mut env);
        let block = match trace.block(id) {
            Block::Decoded(b) => b.stmts.clone(),
            _ => unreachable!(),
        };
        (block, env)
    }

    #[test]
    fn near_branches_pass_through() {
        let (stmts, _) = run(vec![Stmt::Native(builder::jmp_rel(0x2000))]);
        assert_eq!(stmts.len(), 1);
    }

    #[test]
    fn far_jump_goes_through_a_cell_with_ud2() {
        let (stmts, env) = run(vec![Stmt::Native(builder::jmp_rel(0x9_0000_0000))]);
        let insts: Vec<_> = stmts.iter().filter_map(|s| s.native()).collect();
        assert_eq!(insts.len(), 2);
        assert_eq!(insts[0].iclass, IClass::Jmp);
        assert!(insts[0].ops[0].is_pointer());
        assert_eq!(insts[1].iclass, IClass::Ud2);
        assert_eq!(*env.cells[0], 0x9_0000_0000u64);
    }

    #[test]
    fn far_conditional_negates_over_an_indirect() {
        use crate::arch::inst::Cond;
        let (stmts, _) = run(vec![Stmt::Native(builder::jcc(
            Cond::Z,
            BranchTarget::Pc(0x9_0000_0000),
        ))]);
        let insts: Vec<_> = stmts.iter().filter_map(|s| s.native()).collect();
        assert_eq!(insts[0].iclass, IClass::Jcc(Cond::Nz));
        assert_eq!(insts[1].iclass, IClass::Jmp);
        assert!(insts[1].ops[0].is_pointer());
        assert_eq!(insts[2].iclass, IClass::Ud2);
        // And the skip label lands after everything.
        assert!(matches!(stmts.last(), Some(Stmt::Label(_))));
    }

    #[test]
    fn loops_bounce_through_a_trampoline() {
        let mut lp = Inst::new(IClass::Loop);
        lp.ops.push(Operand::branch_pc(0x2000));
        lp.analyze_stack_usage();
        let (stmts, _) = run(vec![Stmt::Native(lp)]);
        let insts: Vec<_> = stmts.iter().filter_map(|s| s.native()).collect();
        assert_eq!(insts.len(), 3);
        assert_eq!(insts[0].iclass, IClass::Jmp); // to try_loop
        assert_eq!(insts[1].iclass, IClass::Jmp); // to the target
        assert_eq!(insts[2].iclass, IClass::Loop); // back to do_loop
        assert!(matches!(
            insts[2].ops[0].kind,
            OperandKind::Branch(BranchTarget::Label(_))
        ));
    }

    #[test]
    fn wide_absolute_loads_go_through_a_register() {
        // A load through an absolute 64-bit pointer.
        let mut load = builder::mov_r_mem(
            super::super::reg::VirtualRegister::from_name("rbx"),
            Operand::pointer(0x9_0000_0000, OperandFlags::READ, 64),
        );
        load.raw = None;
        let (stmts, _) = run(vec![Stmt::Native(load)]);
        let insts: Vec<_> = stmts.iter().filter_map(|s| s.native()).collect();
        assert_eq!(insts.len(), 2);
        assert_eq!(insts[0].iclass, IClass::Mov);
        assert!(insts[0].ops[1].is_immediate());
        assert!(insts[1].ops[1].is_memory() && !insts[1].ops[1].is_pointer());
    }
}
