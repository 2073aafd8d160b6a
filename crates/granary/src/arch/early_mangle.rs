//! Early mangling: pre-allocation rewriting of awkward instructions.
//!
//! Runs on each instruction straight out of the decoder, before register
//! allocation. Instructions the allocator cannot reason about (stack
//! manipulation through memory, segment pushes, `XLAT`, `ENTER`,
//! compound memory operands) are rewritten into sequences of simpler
//! ones. Every rewrite draws scratch from a small per-instruction pool
//! of virtual registers, so spill-slot sharing across instructions is
//! trivial.

use super::builder;
use super::inst::{Annotation, IClass, Inst, InstFlags, Stmt};
use super::operand::{Operand, OperandFlags, OperandKind, SegmentReg};
use super::reg::VirtualRegister;
use super::{ADDRESS_WIDTH_BITS, GPR_WIDTH_BITS, GPR_WIDTH_BYTES};
use log::trace;

/// Upper bound on scratch registers one instruction's rewrite may use.
const POOL_SIZE: u16 = 8;

/// Rewrites decoded instructions in place, appending helper
/// instructions to the surrounding block.
#[derive(Default)]
pub struct EarlyMangler {
    next_vr: u16,
}

impl EarlyMangler {
    pub fn new() -> Self {
        Self::default()
    }

    /// A scratch virtual register of `byte_width` bytes from the
    /// per-instruction pool.
    fn alloc_vr(&mut self, byte_width: usize) -> VirtualRegister {
        let num = self.next_vr;
        self.next_vr += 1;
        assert!(self.next_vr <= POOL_SIZE, "mangling pool exhausted");
        VirtualRegister::virtual_reg(num, byte_width)
    }

    /// Mangle `instr` and append it (and any helpers) to `stmts`.
    pub fn mangle(&mut self, stmts: &mut Vec<Stmt>, instr: Inst) {
        self.next_vr = 0;
        self.mangle_rec(stmts, instr, false);
    }

    fn mangle_rec(&mut self, stmts: &mut Vec<Stmt>, mut instr: Inst, rec: bool) {
        use IClass::*;

        // An unrecognized write to the stack pointer leaves the stack
        // untrustworthy until something re-establishes it.
        if !rec && instr.writes_to_stack_pointer() && !instr.shifts_stack_pointer() {
            match instr.iclass {
                RetFar | CallFar | Iret | Enter | Leave => {}
                _ => stmts.push(Stmt::Annot(Annotation::InvalidStack)),
            }
        }

        match instr.iclass {
            Call | Jmp => {
                self.mangle_indirect_cfi(stmts, &mut instr);
                stmts.push(Stmt::Native(instr));
            }
            Push => {
                self.mangle_push(stmts, instr);
            }
            Pop => {
                self.mangle_pop(stmts, instr);
            }
            Xlat => {
                self.mangle_xlat(stmts, instr);
            }
            Enter => {
                self.mangle_enter(stmts, instr);
            }
            Leave => {
                self.mangle_leave(stmts, instr);
            }
            Pushf => {
                mangle_push_flags(&mut instr);
                stmts.push(Stmt::Native(instr));
            }
            Popf | Cli | Sti => {
                stmts.push(Stmt::Annot(Annotation::InterruptStateChange));
                stmts.push(Stmt::Native(instr));
            }
            Lea => {
                if instr.reads_from_stack_pointer() {
                    if let Some(op) = instr.ops.first_mut() {
                        if op.is_register() {
                            let mut reg = op.register();
                            reg.mark_as_stack_pointer_alias();
                            *op = Operand::reg(reg, op.flags);
                        }
                    }
                }
                stmts.push(Stmt::Native(instr));
            }
            _ => {
                self.mangle_explicit_ops(stmts, &mut instr);
                stmts.push(Stmt::Native(instr));
            }
        }
    }

    /// Force the target of an indirect call or jump into a virtual
    /// register.
    fn mangle_indirect_cfi(&mut self, stmts: &mut Vec<Stmt>, instr: &mut Inst) {
        let Some(op) = instr.ops.first() else {
            return;
        };
        if op.is_branch() {
            return; // Direct; the factory wires the target.
        }
        let target = self.alloc_vr(GPR_WIDTH_BYTES);
        if op.is_memory() {
            trace!("early: fold indirect target load");
            let load = builder::mov_r_mem(target, *op);
            self.mangle_rec(stmts, load, true);
            instr.ops[0] = Operand::reg(target, OperandFlags::READ);
            instr.touch_operands();
        } else if op.is_register() && !op.register().is_virtual() {
            stmts.push(Stmt::Native(builder::mov_r_r(target, op.register())));
            instr.ops[0] = Operand::reg(target, OperandFlags::READ);
            instr.touch_operands();
        }
        instr.analyze_stack_usage();
    }

    fn mangle_push(&mut self, stmts: &mut Vec<Stmt>, mut instr: Inst) {
        let op = instr.ops[0];
        if op.is_memory() {
            // `PUSH [mem]` would need a memory-to-memory move.
            assert!(instr.effective_operand_width != 0);
            let vr = self.alloc_vr(usize::from(instr.effective_operand_width / 8));
            let load = builder::mov_r_mem(vr, op);
            self.mangle_rec(stmts, load, true);
            instr.ops[0] = Operand::reg(vr, OperandFlags::READ);
            instr.touch_operands();
            instr.analyze_stack_usage();
        } else if op.is_register() {
            if let Some(_seg) = op.register().segment() {
                // `PUSH FS/GS`: zero-extend the selector manually.
                let vr16 = self.alloc_vr(2);
                let vr32 = vr16.widened_to(4);
                stmts.push(Stmt::Native(builder::mov_r16_seg(vr16, op.register())));
                stmts.push(Stmt::Native(builder::movzx_r_r(vr32, vr16)));
                let stack_width = usize::from(instr.effective_operand_width / 8).max(2);
                instr.ops[0] =
                    Operand::reg(vr16.widened_to(stack_width), OperandFlags::READ);
                instr.ops[0].width = instr.effective_operand_width;
                instr.touch_operands();
                instr.analyze_stack_usage();
            }
        }
        stmts.push(Stmt::Native(instr));
    }

    fn mangle_pop(&mut self, stmts: &mut Vec<Stmt>, mut instr: Inst) {
        let rsp = VirtualRegister::stack_pointer();
        let op = instr.ops[0];
        if op.is_memory() {
            // `POP [mem]` becomes a load off the stack, a store, and an
            // explicit stack shift.
            assert!(instr.effective_operand_width > 0);
            let shift = i32::from(instr.effective_operand_width / 8);
            let vr = self.alloc_vr(shift as usize);
            let stack_top =
                Operand::base_disp(rsp, 0, OperandFlags::READ, instr.effective_operand_width);
            stmts.push(Stmt::Native(builder::mov_r_mem(vr, stack_top)));

            let mut dst = op;
            // The store happens before the shift, so a stack-relative
            // destination sees the popped slot above it.
            match &mut dst.kind {
                OperandKind::Memory(m) if m.base.is_stack_pointer() => {
                    m.disp += shift;
                }
                OperandKind::Register(r) if r.is_stack_pointer() => {
                    dst = Operand::base_disp(rsp, shift, OperandFlags::WRITE, dst.width);
                }
                _ => {}
            }
            let store = builder::mov_mem_r(dst, vr);
            self.mangle_rec(stmts, store, true);

            let mut lea = builder::lea_rsp_disp(shift);
            lea.decoded_pc = instr.decoded_pc;
            stmts.push(Stmt::Native(lea));
        } else if op.is_register() && op.register().is_stack_pointer() {
            // `POP RSP` loads the saved pointer; no shift needed since
            // the load overwrites it.
            let load = builder::mov_r_mem(
                op.register(),
                Operand::base_disp(rsp, 0, OperandFlags::READ, instr.effective_operand_width),
            );
            self.mangle_rec(stmts, load, true);
        } else if let Some(_seg) = op.is_register().then(|| op.register().segment()).flatten() {
            // `POP FS/GS`: pop into a scratch register, then move it
            // into the segment.
            let shift = usize::from(instr.effective_operand_width / 8);
            let vr = self.alloc_vr(shift.max(2));
            let seg = op.register();
            instr.ops[0] = Operand::reg(vr, OperandFlags::WRITE);
            instr.ops[0].width = instr.effective_operand_width;
            instr.touch_operands();
            instr.analyze_stack_usage();
            stmts.push(Stmt::Native(instr));
            stmts.push(Stmt::Native(builder::mov_seg_r16(seg, vr.widened_to(2))));
            return;
        } else {
            stmts.push(Stmt::Native(instr));
        }
    }

    /// `XLAT` is the one instruction whose base and index registers have
    /// different widths; give it an explicit address computation.
    fn mangle_xlat(&mut self, stmts: &mut Vec<Stmt>, instr: Inst) {
        let al = VirtualRegister::from_name("al");
        let rbx = VirtualRegister::from_name("rbx");
        let addr = self.alloc_vr(GPR_WIDTH_BYTES);
        stmts.push(Stmt::Native(builder::movzx_r_r(addr, al)));
        stmts.push(Stmt::Native(builder::lea_base_index(addr, addr, rbx)));
        let mut load = builder::mov_r_mem(al, Operand::mem_reg(addr, OperandFlags::READ, 8));
        load.decoded_pc = instr.decoded_pc;
        stmts.push(Stmt::Native(load));
    }

    /// `ENTER frame, args` becomes explicit pushes, frame copies, and
    /// stack shifts.
    fn mangle_enter(&mut self, stmts: &mut Vec<Stmt>, instr: Inst) {
        stmts.push(Stmt::Annot(Annotation::InvalidStack));
        let rsp = VirtualRegister::stack_pointer();
        let rbp = VirtualRegister::from_name("rbp");
        let frame_size = (instr.ops[0].immediate() as u64 & 0xffff) as i32;
        let num_args = (instr.ops[1].immediate() as u64 & 0x1f) as i32;
        let mut temp_rbp = self.alloc_vr(GPR_WIDTH_BYTES);
        temp_rbp.mark_as_stack_pointer_alias();

        let mut push_rbp = builder::push_r(rbp);
        push_rbp.decoded_pc = instr.decoded_pc;
        stmts.push(Stmt::Native(push_rbp));
        stmts.push(Stmt::Native(builder::lea_base_disp(temp_rbp, rsp, 0)));

        if num_args > 0 {
            let disp = -(num_args - 1) * GPR_WIDTH_BYTES as i32;
            stmts.push(Stmt::Native(builder::lea_rsp_disp(disp)));

            let copied_addr = self.alloc_vr(GPR_WIDTH_BYTES);
            let mut dest_addr = self.alloc_vr(GPR_WIDTH_BYTES);
            let copied_val = self.alloc_vr(GPR_WIDTH_BYTES);
            dest_addr.mark_as_stack_pointer_alias();

            for i in 1..num_args {
                let rbp_disp = -i * GPR_WIDTH_BYTES as i32;
                let rsp_disp = (num_args - i - 1) * GPR_WIDTH_BYTES as i32;
                stmts.push(Stmt::Native(builder::lea_base_disp(
                    copied_addr,
                    rbp,
                    rbp_disp,
                )));
                stmts.push(Stmt::Native(builder::lea_base_disp(
                    dest_addr, rsp, rsp_disp,
                )));
                let mut load = builder::mov_r_mem(
                    copied_val,
                    Operand::mem_reg(copied_addr, OperandFlags::READ, GPR_WIDTH_BITS),
                );
                load.decoded_pc = instr.decoded_pc;
                stmts.push(Stmt::Native(load));
                let mut store = builder::mov_mem_r(
                    Operand::mem_reg(dest_addr, OperandFlags::WRITE, GPR_WIDTH_BITS),
                    copied_val,
                );
                store.decoded_pc = instr.decoded_pc;
                stmts.push(Stmt::Native(store));
            }

            let mut push_frame = builder::push_r(temp_rbp);
            push_frame.decoded_pc = instr.decoded_pc;
            stmts.push(Stmt::Native(push_frame));
        }

        if frame_size > 0 {
            stmts.push(Stmt::Native(builder::lea_rsp_disp(-frame_size)));
            // ENTER ends with an unused probe write meant to surface
            // stack faults eagerly; emulating that fault behavior buys
            // nothing, so the next real stack touch takes the fault.
        }

        let mut done = builder::mov_r_r(rbp, temp_rbp);
        done.decoded_pc = instr.decoded_pc;
        stmts.push(Stmt::Native(done));
    }

    /// `LEAVE` becomes `MOV RSP, RBP; POP RBP`, making the stack
    /// re-establishment visible to the stack analysis.
    fn mangle_leave(&mut self, stmts: &mut Vec<Stmt>, instr: Inst) {
        let rsp = VirtualRegister::stack_pointer();
        let rbp = VirtualRegister::from_name("rbp");
        stmts.push(Stmt::Annot(Annotation::InvalidStack));
        let mut restore = builder::mov_r_r(rsp, rbp);
        restore.decoded_pc = instr.decoded_pc;
        stmts.push(Stmt::Native(restore));
        let mut pop = builder::pop_r(rbp);
        pop.decoded_pc = instr.decoded_pc;
        pop.effective_operand_width = GPR_WIDTH_BITS;
        stmts.push(Stmt::Native(pop));
    }

    /// Split compound memory operands, segment pointers, and stack
    /// pointer reads out of an ordinary instruction.
    fn mangle_explicit_ops(&mut self, stmts: &mut Vec<Stmt>, instr: &mut Inst) {
        let used_sp = instr.reads_from_stack_pointer() || instr.writes_to_stack_pointer();
        let mut replacements: Vec<(usize, Operand, Vec<Stmt>)> = Vec::new();

        for (i, op) in instr.ops.iter().enumerate() {
            if !op.is_explicit {
                continue;
            }
            match op.kind {
                OperandKind::Memory(mem) => {
                    if op.is_sticky {
                        if mem.disp == 0 && !mem.index.is_valid() {
                            assert!(!mem.base.is_stack_pointer());
                            let mut new_op = *op;
                            new_op.kind = OperandKind::Register(mem.base);
                            new_op.is_compound = false;
                            replacements.push((i, new_op, Vec::new()));
                        }
                        continue;
                    }
                    // Expand the address computation into a LEA so the
                    // rest of the pipeline sees `[reg]` only.
                    let mut mem_reg = self.alloc_vr(GPR_WIDTH_BYTES);
                    if mem.base.is_stack_pointer() {
                        mem_reg.mark_as_stack_pointer_alias();
                    }
                    let mut helpers = Vec::new();
                    helpers.push(Stmt::Native(builder::lea(mem_reg, mem)));
                    let mut new_op = *op;
                    new_op.kind = OperandKind::Register(mem_reg);
                    new_op.is_compound = false;
                    replacements.push((i, new_op, helpers));
                }
                OperandKind::Pointer(addr) => {
                    if op.segment != SegmentReg::None {
                        // A segment-relative absolute offset: compute
                        // the offset in a register, keep the segment.
                        let offset = self.alloc_vr(GPR_WIDTH_BYTES);
                        let helpers =
                            vec![Stmt::Native(builder::mov_r_imm(offset, addr))];
                        let mut new_op = *op;
                        new_op.kind = OperandKind::Register(offset);
                        new_op.is_compound = false;
                        replacements.push((i, new_op, helpers));
                    }
                }
                OperandKind::Register(reg)
                    if !op.is_memory() && reg.is_stack_pointer() && !op.flags.is_write() =>
                {
                    // Reads of RSP go through an alias so later passes
                    // can compensate for a shifted stack.
                    if instr.iclass == IClass::Mov
                        && instr.effective_operand_width == GPR_WIDTH_BITS
                        && i == 1
                        && instr.ops[0].is_register()
                    {
                        // `MOV r64, RSP` rewrites wholesale to
                        // `LEA r64, [RSP]` below.
                        continue;
                    }
                    let mut sp = self.alloc_vr(GPR_WIDTH_BYTES);
                    sp.mark_as_stack_pointer_alias();
                    let helpers = vec![Stmt::Native(builder::lea_base_disp(
                        sp,
                        VirtualRegister::stack_pointer(),
                        0,
                    ))];
                    let mut new_op = *op;
                    new_op.kind =
                        OperandKind::Register(sp.widened_to(reg.byte_width().max(1)));
                    replacements.push((i, new_op, helpers));
                }
                _ => {}
            }
        }

        // `MOV r64, RSP` plays nicer with slot allocation as a LEA.
        if instr.iclass == IClass::Mov
            && instr.effective_operand_width == GPR_WIDTH_BITS
            && instr.ops.len() >= 2
            && instr.ops[0].is_register()
            && instr.ops[1].is_register()
            && instr.ops[1].register().is_stack_pointer()
        {
            let decoded_pc = instr.decoded_pc;
            let mut dst = instr.ops[0].register();
            dst.mark_as_stack_pointer_alias();
            *instr = builder::lea_base_disp(dst, VirtualRegister::stack_pointer(), 0);
            instr.decoded_pc = decoded_pc;
            return;
        }

        for (i, new_op, helpers) in replacements {
            for helper in helpers {
                match helper {
                    Stmt::Native(inst) => self.append_mangled_helper(stmts, inst),
                    other => stmts.push(other),
                }
            }
            instr.ops[i] = new_op;
            instr.touch_operands();
        }

        if used_sp {
            instr.analyze_stack_usage();
        } else if instr.flags.contains(InstFlags::OPERANDS_MODIFIED) {
            instr.analyze_stack_usage();
        }
    }

    fn append_mangled_helper(&mut self, stmts: &mut Vec<Stmt>, inst: Inst) {
        // Helper loads and stores may themselves carry compound
        // operands (never more than one level deep).
        stmts.push(Stmt::Native(inst));
    }
}

/// `PUSHF`/`PUSHFQ` get a virtual-register operand so the slot rewriter
/// can reach the pushed value later.
fn mangle_push_flags(instr: &mut Inst) {
    let mut op = Operand::reg(
        VirtualRegister::virtual_reg(POOL_SIZE - 1, GPR_WIDTH_BYTES),
        OperandFlags::WRITE,
    );
    op.width = instr.effective_operand_width;
    op.is_explicit = true;
    instr.ops.insert(0, op);
    instr.touch_operands();
    instr.analyze_stack_usage();
}

const _: () = assert!(ADDRESS_WIDTH_BITS == GPR_WIDTH_BITS);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::decode::InstructionDecoder;

    fn mangle_buf(buf: &[u8]) -> Vec<Stmt> {
        let dec = InstructionDecoder::new();
        let (inst, _) = dec.decode(buf.as_ptr() as usize).unwrap();
        let mut mangler = EarlyMangler::new();
        let mut stmts = Vec::new();
        mangler.mangle(&mut stmts, inst);
        stmts
    }

    fn natives(stmts: &[Stmt]) -> Vec<&Inst> {
        stmts.iter().filter_map(|s| s.native()).collect()
    }

    #[test]
    fn compound_memory_splits_into_lea() {
        // add rax, [rbx + rcx*4 + 8]
        let stmts = mangle_buf(&[0x48, 0x03, 0x44, 0x8b, 0x08]);
        let insts = natives(&stmts);
        assert_eq!(insts.len(), 2);
        assert_eq!(insts[0].iclass, IClass::Lea);
        assert!(insts[0].ops[0].register().is_virtual());
        // The add now reads through the scratch register.
        let mem = &insts[1].ops[1];
        assert!(mem.is_memory() && !mem.is_compound);
        assert!(mem.register().is_virtual());
    }

    #[test]
    fn push_mem_becomes_load_then_push() {
        // push qword ptr [rax]
        let stmts = mangle_buf(&[0xff, 0x30]);
        let insts = natives(&stmts);
        assert_eq!(insts.len(), 2);
        assert_eq!(insts[0].iclass, IClass::Mov);
        assert_eq!(insts[1].iclass, IClass::Push);
        assert!(insts[1].ops[0].is_register());
        assert!(insts[1].ops[0].register().is_virtual());
    }

    #[test]
    fn pop_mem_becomes_load_store_shift() {
        // pop qword ptr [rax]
        let stmts = mangle_buf(&[0x8f, 0x00]);
        let insts = natives(&stmts);
        assert_eq!(insts.len(), 3);
        assert_eq!(insts[0].iclass, IClass::Mov);
        assert_eq!(insts[1].iclass, IClass::Mov);
        assert_eq!(insts[2].iclass, IClass::Lea);
        assert_eq!(insts[2].stack_pointer_shift_amount(), Some(8));
    }

    #[test]
    fn leave_splits_and_marks_invalid_stack() {
        let stmts = mangle_buf(&[0xc9]); // leave
        assert!(stmts
            .iter()
            .any(|s| matches!(s, Stmt::Annot(Annotation::InvalidStack))));
        let insts = natives(&stmts);
        assert_eq!(insts.len(), 2);
        assert_eq!(insts[0].iclass, IClass::Mov);
        assert_eq!(insts[1].iclass, IClass::Pop);
    }

    #[test]
    fn xlat_becomes_three_instructions() {
        let stmts = mangle_buf(&[0xd7]); // xlatb
        let insts = natives(&stmts);
        assert_eq!(insts.len(), 3);
        assert_eq!(insts[0].iclass, IClass::Movzx);
        assert_eq!(insts[1].iclass, IClass::Lea);
        assert_eq!(insts[2].iclass, IClass::Mov);
    }

    #[test]
    fn indirect_jump_target_moves_to_a_virtual() {
        // jmp qword ptr [rax + 8]
        let stmts = mangle_buf(&[0xff, 0x60, 0x08]);
        let insts = natives(&stmts);
        let jmp = insts.last().unwrap();
        assert_eq!(jmp.iclass, IClass::Jmp);
        assert!(jmp.ops[0].is_register());
        assert!(jmp.ops[0].register().is_virtual());
    }

    #[test]
    fn mov_of_rsp_becomes_lea() {
        // mov rax, rsp
        let stmts = mangle_buf(&[0x48, 0x89, 0xe0]);
        let insts = natives(&stmts);
        assert_eq!(insts.len(), 1);
        assert_eq!(insts[0].iclass, IClass::Lea);
        assert!(insts[0].ops[0].register().is_stack_pointer_alias());
    }

    #[test]
    fn interrupt_state_changes_are_annotated() {
        let stmts = mangle_buf(&[0xfa]); // cli
        assert!(matches!(
            stmts[0],
            Stmt::Annot(Annotation::InterruptStateChange)
        ));
    }

    #[test]
    fn pushf_gains_a_virtual_operand() {
        let stmts = mangle_buf(&[0x9c]); // pushfq
        let insts = natives(&stmts);
        assert_eq!(insts.len(), 1);
        assert!(insts[0].ops[0].is_register());
        assert!(insts[0].ops[0].register().is_virtual());
    }
}
