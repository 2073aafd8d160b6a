//! Making spill slots concrete, and keeping the stack transparent.
//!
//! After register assignment, abstract slots appear as memory operands
//! whose base register is in the reserved virtual-slot category. For a
//! block whose stack is valid, slots become `[RSP + n*8]` below a stack
//! adjustment established on entry, and every stack-relative instruction
//! inside the adjusted region is rewritten so the application cannot
//! observe the shift. For a block whose stack cannot be trusted, slots
//! go to the segment-addressed area instead and the stack is left
//! untouched.

use crate::arch::builder;
use crate::arch::inst::{Annotation, IClass, Inst, Stmt};
use crate::arch::operand::{Operand, OperandKind};
use crate::arch::reg::VirtualRegister;
use crate::arch::slot::{slot_mem_operand, SlotCategory};
use crate::cfg::DecodedBlock;
use crate::metadata::StackMetaData;
use log::trace;

/// Rewrite `block`'s abstract slots; `num_slots` comes from register
/// allocation.
pub fn allocate_slots(block: &mut DecodedBlock, num_slots: usize) {
    let stack_valid =
        block.meta.get::<StackMetaData>().is_stack_valid() && !has_invalid_stack(block);
    if num_slots == 0 {
        return;
    }
    if stack_valid {
        adjust_valid_stack(block, num_slots);
    } else {
        use_segment_slots(block);
    }
}

fn has_invalid_stack(block: &DecodedBlock) -> bool {
    block
        .stmts
        .iter()
        .any(|s| matches!(s, Stmt::Annot(Annotation::InvalidStack)))
}

fn is_spill_slot(op: &Operand) -> bool {
    match op.kind {
        OperandKind::Register(r) => op.is_memory() && r.is_virtual_slot(),
        _ => false,
    }
}

fn slot_number(op: &Operand) -> usize {
    match op.kind {
        OperandKind::Register(r) => usize::from(r.reg_num),
        _ => unreachable!(),
    }
}

/// Replace slots with segment-relative storage; the native stack is not
/// moved.
fn use_segment_slots(block: &mut DecodedBlock) {
    for stmt in &mut block.stmts {
        let Some(inst) = stmt.native_mut() else {
            continue;
        };
        if !matches!(inst.iclass, IClass::Mov | IClass::Xchg) {
            continue;
        }
        for op in &mut inst.ops {
            if is_spill_slot(op) {
                let mut slot = slot_mem_operand(
                    SlotCategory::VirtualRegister,
                    slot_number(op),
                    op.width,
                );
                slot.flags = op.flags;
                *op = slot;
            }
        }
        inst.touch_operands();
        inst.analyze_stack_usage();
    }
}

/// The emulated push depth of a block: how far below the entry stack
/// pointer the application's own pushes reach before the terminator.
fn max_push_depth(block: &DecodedBlock) -> i32 {
    let mut cum = 0i32;
    let mut depth = 0i32;
    for stmt in &block.stmts {
        let Some(inst) = stmt.native() else {
            continue;
        };
        if inst.is_cti() {
            break;
        }
        if inst.is_stack_blind() {
            continue;
        }
        if let Some(shift) = inst.stack_pointer_shift_amount() {
            cum += shift;
            depth = depth.max(-cum);
        }
    }
    depth
}

/// Shift the stack down on entry, rewrite everything inside the region,
/// and shift back before control leaves.
fn adjust_valid_stack(block: &mut DecodedBlock, num_slots: usize) {
    let frame = (num_slots as i32) * 8 + max_push_depth(block);
    trace!(
        "stack frame of {frame} bytes for block at {:#x}",
        block.app_pc
    );
    let old = std::mem::take(&mut block.stmts);
    let mut out = Vec::with_capacity(old.len() + 2);
    out.push(Stmt::Native(builder::stack_blind(builder::lea_rsp_disp(
        -frame,
    ))));

    // `offset` is the distance from the real stack pointer up to the
    // emulated (application) one; the region ends by shifting it away.
    // `real_shift` tracks every real stack movement after the frame was
    // established (edge-code pushes, the unwind itself), because spill
    // slots are frame-relative and their `[RSP + ..]` operands must
    // follow the stack pointer around.
    //
    // The unwind happens at the first control transfer out of the
    // region, or just before the first stack-blind stack motion: edge
    // code lays its own values below the stack pointer and expects the
    // application stack to already be settled underneath them.
    let mut offset = frame;
    let mut real_shift = 0i32;
    let mut adjusted = true;
    for stmt in old {
        let mut inst = match stmt {
            Stmt::Native(inst) => inst,
            other => {
                out.push(other);
                continue;
            }
        };
        let blind_stack_motion =
            inst.is_stack_blind() && inst.stack_pointer_shift_amount().is_some();
        if adjusted && (inst.is_cti() || blind_stack_motion) && !inst.is_save_restore() {
            // Leaving the region: make the real stack pointer agree
            // with the emulated one.
            if offset != 0 {
                out.push(Stmt::Native(builder::stack_blind(builder::lea_rsp_disp(
                    offset,
                ))));
                real_shift += offset;
            }
            adjusted = false;
        }
        if !adjusted || inst.is_stack_blind() {
            // Outside the region (or blind inside it) only spill-slot
            // references are rewritten; everything else is literal.
            if let Some(shift) = inst.stack_pointer_shift_amount() {
                if inst.is_stack_blind() || !adjusted {
                    real_shift += shift;
                }
            }
            rewrite_slot_refs(&mut inst, real_shift);
            out.push(Stmt::Native(inst));
            continue;
        }
        rewrite_adjusted(&mut out, &mut inst, &mut offset, real_shift);
    }
    if adjusted && offset != 0 {
        out.push(Stmt::Native(builder::stack_blind(builder::lea_rsp_disp(
            offset,
        ))));
    }
    block.stmts = out;
}

/// Rewrite any abstract slot operands of `inst` to concrete
/// frame-relative addresses, given the real stack movement since the
/// frame was established.
fn rewrite_slot_refs(inst: &mut Inst, real_shift: i32) {
    if !matches!(inst.iclass, IClass::Mov | IClass::Xchg) {
        return;
    }
    let rsp = VirtualRegister::stack_pointer();
    let mut rewrote = false;
    for op in &mut inst.ops {
        if is_spill_slot(op) {
            let n = slot_number(op);
            let mut concrete =
                Operand::base_disp(rsp, (n as i32) * 8 - real_shift, op.flags, op.width);
            concrete.width = op.width;
            *op = concrete;
            rewrote = true;
        }
    }
    if rewrote {
        inst.touch_operands();
        inst.analyze_stack_usage();
    }
}

/// Rewrite one instruction within the adjusted region, appending the
/// result (possibly several instructions) to `out`. `real_shift` is
/// the real stack movement since the frame was established, which
/// shifts where the slots sit relative to the current stack pointer.
fn rewrite_adjusted(out: &mut Vec<Stmt>, inst: &mut Inst, offset: &mut i32, real_shift: i32) {
    use IClass::*;
    let rsp = VirtualRegister::stack_pointer();
    match inst.iclass {
        Push => {
            let size = i32::from(inst.effective_operand_width / 8).max(2);
            let slot = Operand::base_disp(
                rsp,
                *offset - size,
                crate::arch::operand::OperandFlags::WRITE,
                inst.effective_operand_width,
            );
            let op = inst.ops[0];
            let mut store = if op.is_register() {
                builder::mov_mem_r(slot, op.register())
            } else if op.is_immediate() {
                builder::mov_mem_imm(slot, op.immediate(), inst.effective_operand_width)
            } else {
                unreachable!("push through memory survived early mangling");
            };
            store.decoded_pc = inst.decoded_pc;
            out.push(Stmt::Native(store));
            *offset -= size;
        }
        Pop => {
            let size = i32::from(inst.effective_operand_width / 8).max(2);
            let op = inst.ops[0];
            assert!(op.is_register(), "pop through memory survived early mangling");
            let slot = Operand::base_disp(
                rsp,
                *offset,
                crate::arch::operand::OperandFlags::READ,
                inst.effective_operand_width,
            );
            let mut load = builder::mov_r_mem(op.register(), slot);
            load.decoded_pc = inst.decoded_pc;
            out.push(Stmt::Native(load));
            *offset += size;
        }
        Pushf => {
            if inst.is_sticky() {
                out.push(Stmt::Native(inst.clone()));
                return;
            }
            // Let the flags push hit the real stack, then move the
            // value up into the emulated slot.
            let flag_reg = inst.ops[0].register();
            let width = inst.effective_operand_width;
            inst.ops.clear();
            inst.touch_operands();
            inst.analyze_stack_usage();
            out.push(Stmt::Native(inst.clone()));
            out.push(Stmt::Native(builder::stack_blind(builder::pop_r(flag_reg))));
            let slot = Operand::base_disp(
                rsp,
                *offset - 8,
                crate::arch::operand::OperandFlags::WRITE,
                width,
            );
            out.push(Stmt::Native(builder::mov_mem_r(slot, flag_reg)));
            *offset -= 8;
        }
        Popf => {
            // Replay the emulated flags slot onto the real stack so the
            // pop sees it.
            let slot = Operand::base_disp(
                rsp,
                *offset,
                crate::arch::operand::OperandFlags::READ,
                inst.effective_operand_width,
            );
            out.push(Stmt::Native(builder::stack_blind(builder::push_mem(slot))));
            out.push(Stmt::Native(inst.clone()));
            *offset += 8;
        }
        Mov | Xchg => {
            let mut rewrote_slot = false;
            for op in &mut inst.ops {
                if is_spill_slot(op) {
                    let n = slot_number(op);
                    let mut concrete = Operand::base_disp(
                        rsp,
                        (n as i32) * 8 - real_shift,
                        op.flags,
                        crate::arch::GPR_WIDTH_BITS,
                    );
                    concrete.width = op.width;
                    *op = concrete;
                    rewrote_slot = true;
                }
            }
            if !rewrote_slot {
                adjust_mem_ops(inst, *offset);
            }
            inst.touch_operands();
            inst.analyze_stack_usage();
            out.push(Stmt::Native(inst.clone()));
        }
        Lea => {
            let dst_is_sp = inst.ops[0].is_register() && inst.ops[0].register().is_stack_pointer();
            if dst_is_sp {
                // A mangled stack shift: fold it into the running
                // offset and drop the instruction.
                let shift = inst.stack_pointer_shift_amount().unwrap_or(0);
                *offset += shift;
                out.push(Stmt::Native(builder::nop()));
            } else {
                adjust_mem_ops(inst, *offset);
                inst.touch_operands();
                inst.analyze_stack_usage();
                out.push(Stmt::Native(inst.clone()));
            }
        }
        Add | Sub | Inc | Dec => {
            let writes_sp = inst.ops[0].is_register() && inst.ops[0].register().is_stack_pointer();
            if writes_sp {
                // Approximate the flags; the arithmetic itself is
                // already folded into the stack analysis. AF and PF are
                // knowingly lossy here.
                if matches!(inst.iclass, Add | Sub) {
                    if let Some(op) = inst.ops.get(1) {
                        if op.is_immediate() {
                            let imm = op.immediate() as i32;
                            *offset += if inst.iclass == Add { imm } else { -imm };
                        }
                    }
                }
                let mut test = builder::test_r_r(rsp, rsp);
                test.decoded_pc = inst.decoded_pc;
                out.push(Stmt::Native(test));
            } else {
                adjust_mem_ops(inst, *offset);
                inst.touch_operands();
                inst.analyze_stack_usage();
                out.push(Stmt::Native(inst.clone()));
            }
        }
        _ => {
            adjust_mem_ops(inst, *offset);
            inst.touch_operands();
            inst.analyze_stack_usage();
            out.push(Stmt::Native(inst.clone()));
        }
    }
}

/// Shift stack-relative memory operands by the current adjustment.
fn adjust_mem_ops(inst: &mut Inst, offset: i32) {
    if offset == 0 {
        return;
    }
    let rsp = VirtualRegister::stack_pointer();
    for op in &mut inst.ops {
        if !op.is_explicit || op.is_pointer() {
            continue;
        }
        let is_memory = op.is_memory();
        match &mut op.kind {
            OperandKind::Memory(mem) if is_memory => {
                debug_assert!(!mem.index.is_stack_pointer());
                if mem.base.is_stack_pointer() {
                    mem.disp += offset;
                }
            }
            OperandKind::Register(r) if is_memory && r.is_stack_pointer() => {
                let width = op.width;
                let flags = op.flags;
                *op = Operand::base_disp(rsp, offset, flags, width);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::alloc::slot_operand;
    use crate::metadata::{standard_manager, Meta};

    fn valid_stack_block(stmts: Vec<Stmt>) -> DecodedBlock {
        let mgr = standard_manager();
        let mut meta = Meta::allocate(&mgr);
        meta.get_mut::<StackMetaData>().mark_stack_as_valid();
        let mut block = DecodedBlock::new(0x1000, meta);
        block.stmts = stmts;
        block
    }

    fn natives(block: &DecodedBlock) -> Vec<&Inst> {
        block.stmts.iter().filter_map(|s| s.native()).collect()
    }

    fn rax() -> VirtualRegister {
        VirtualRegister::from_name("rax")
    }

    #[test]
    fn valid_stack_gets_a_frame_and_concrete_slots() {
        let stmts = vec![
            Stmt::Native(builder::mov_mem_r(slot_operand(0), rax())),
            Stmt::Native(builder::mov_r_mem(rax(), slot_operand(0))),
            Stmt::Native(builder::ret()),
        ];
        let mut block = valid_stack_block(stmts);
        allocate_slots(&mut block, 1);
        let insts = natives(&block);
        // Frame entry, two movs, frame exit, ret.
        assert_eq!(insts[0].iclass, IClass::Lea);
        assert_eq!(insts[0].stack_pointer_shift_amount(), Some(-8));
        let store = insts[1];
        match store.ops[0].kind {
            OperandKind::Memory(m) => {
                assert!(m.base.is_stack_pointer());
                assert_eq!(m.disp, 0);
            }
            _ => panic!("slot not rewritten"),
        }
        let exit = insts[3];
        assert_eq!(exit.stack_pointer_shift_amount(), Some(8));
        assert_eq!(insts[4].iclass, IClass::Ret);
    }

    #[test]
    fn pushes_become_stores_above_the_slots() {
        let mut push = builder::push_r(rax());
        push.effective_operand_width = 64;
        let stmts = vec![
            Stmt::Native(builder::mov_mem_r(slot_operand(0), rax())),
            Stmt::Native(push),
            Stmt::Native(builder::ret()),
        ];
        let mut block = valid_stack_block(stmts);
        allocate_slots(&mut block, 1);
        let insts = natives(&block);
        // frame = 8 (slot) + 8 (push depth) = 16.
        assert_eq!(insts[0].stack_pointer_shift_amount(), Some(-16));
        // The push became a store at [rsp + 16 - 8].
        let store = insts[2];
        assert_eq!(store.iclass, IClass::Mov);
        match store.ops[0].kind {
            OperandKind::Memory(m) => assert_eq!(m.disp, 8),
            _ => panic!("push not rewritten"),
        }
        // Exit restores by offset = 16 - 8.
        let exit = insts[3];
        assert_eq!(exit.stack_pointer_shift_amount(), Some(8));
    }

    #[test]
    fn stack_reads_are_shifted() {
        // mov rbx, [rsp + 0x20] inside an adjusted region.
        let load = builder::mov_r_mem(
            VirtualRegister::from_name("rbx"),
            Operand::base_disp(
                VirtualRegister::stack_pointer(),
                0x20,
                crate::arch::operand::OperandFlags::READ,
                64,
            ),
        );
        let stmts = vec![
            Stmt::Native(builder::mov_mem_r(slot_operand(0), rax())),
            Stmt::Native(load),
            Stmt::Native(builder::ret()),
        ];
        let mut block = valid_stack_block(stmts);
        allocate_slots(&mut block, 1);
        let insts = natives(&block);
        match insts[2].ops[1].kind {
            OperandKind::Memory(m) => assert_eq!(m.disp, 0x20 + 8),
            _ => panic!("memory operand lost"),
        }
    }

    #[test]
    fn invalid_stack_uses_segment_slots() {
        let mgr = standard_manager();
        let meta = Meta::allocate(&mgr); // no stack hint
        let mut block = DecodedBlock::new(0x1000, meta);
        block.stmts = vec![
            Stmt::Native(builder::mov_mem_r(slot_operand(0), rax())),
            Stmt::Native(builder::ret()),
        ];
        allocate_slots(&mut block, 1);
        let insts = natives(&block);
        assert_eq!(insts.len(), 2);
        let store = insts[0];
        assert!(store.ops[0].is_pointer());
        assert_ne!(
            store.ops[0].segment,
            crate::arch::operand::SegmentReg::None
        );
    }
}
