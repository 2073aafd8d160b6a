//! Assigning architectural registers to virtual registers.
//!
//! Allocation is per block. For each virtual register the allocator
//! finds the span of statements it lives across, then looks for an
//! architectural register that is dead across the whole span: not named
//! by any instruction in it, and not live out of it. When one exists the
//! substitution is free. Otherwise a register is stolen and its
//! application value parked in an abstract spill slot around the span;
//! the slot becomes concrete in the slot-allocation pass.

use super::regset::{LiveRegisterSet, UsedRegisterSet, NUM_SCHEDULABLE_GPRS};
use crate::arch::builder;
use crate::arch::inst::{Inst, InstFlags, Stmt};
use crate::arch::operand::{Operand, OperandFlags};
use crate::arch::reg::{RegKind, VirtualRegister};
use crate::cfg::DecodedBlock;
use log::trace;
use std::collections::HashMap;

/// Preference order for scratch registers: caller-saved first, and the
/// REX-free half before the extended half so legacy-restricted spans
/// still have options.
const PREFERRED: [&str; 14] = [
    "rax", "rcx", "rdx", "rsi", "rdi", "r8", "r9", "r10", "r11", "rbx", "rbp", "r12", "r13", "r14",
];

/// Identity of a virtual register within a block.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
struct VrKey {
    kind: RegKind,
    num: u16,
}

#[derive(Clone, Copy, Debug)]
struct VrSpan {
    first: usize,
    last: usize,
    restricted: bool,
}

/// What allocation decided for a block.
#[derive(Debug, Default)]
pub struct BlockAllocation {
    /// Number of spill slots the rewritten block uses.
    pub num_slots: usize,
}

/// Allocate every virtual register in `block`.
pub fn allocate_block(block: &mut DecodedBlock) -> BlockAllocation {
    let spans = collect_spans(block);
    if spans.is_empty() {
        return BlockAllocation::default();
    }

    let used = per_stmt_used(block);
    let live_before = per_stmt_live(block);

    // Assign in span order so overlap conflicts resolve by position.
    let mut order: Vec<(&VrKey, &VrSpan)> = spans.iter().collect();
    order.sort_by_key(|(_, span)| (span.first, span.last));

    let mut assignments: HashMap<VrKey, VirtualRegister> = HashMap::new();
    let mut spills: Vec<(VrKey, VirtualRegister, usize, usize, usize)> = Vec::new();
    let mut num_slots = 0usize;
    let mut taken: Vec<(VrSpan, u16)> = Vec::new();

    for (&key, &span) in order {
        let candidate = |num: u16| -> bool {
            // Never collide with another virtual register's span.
            !taken
                .iter()
                .any(|(s, n)| *n == num && spans_overlap(*s, span))
        };
        let usable = |num: u16| -> bool {
            if span.restricted {
                let hw = if num < 4 { num } else { num + 1 };
                if hw >= 8 {
                    return false;
                }
            }
            if !candidate(num) {
                return false;
            }
            // Not named by any instruction in the span.
            (span.first..=span.last).all(|i| !used[i].is_used(num))
        };

        // First choice: a register also dead past the span, so no spill
        // is needed.
        let dead_after = |num: u16| {
            live_before
                .get(span.last + 1)
                .map(|l| !l.is_live(num))
                .unwrap_or(false)
        };
        let pick_num = PREFERRED
            .iter()
            .map(|name| VirtualRegister::from_name(name).reg_num)
            .find(|&num| usable(num) && dead_after(num))
            .or_else(|| {
                PREFERRED
                    .iter()
                    .map(|name| VirtualRegister::from_name(name).reg_num)
                    .find(|&num| usable(num))
                    .map(|num| {
                        let slot = num_slots;
                        num_slots += 1;
                        spills.push((key, arch_gpr(num), span.first, span.last, slot));
                        num
                    })
            });

        let Some(num) = pick_num else {
            panic!("out of schedulable registers in block at {:#x}", block.app_pc);
        };
        trace!("vr {key:?} -> gpr {num} over [{}, {}]", span.first, span.last);
        taken.push((span, num));
        assignments.insert(key, arch_gpr(num));
    }

    // Substitute assignments into every operand.
    for stmt in &mut block.stmts {
        let Some(inst) = stmt.native_mut() else {
            continue;
        };
        let mut changed = false;
        for op in &mut inst.ops {
            op.map_regs(|reg| {
                if let Some(&arch) = assignments.get(&VrKey {
                    kind: reg.kind,
                    num: reg.reg_num,
                }) {
                    changed = true;
                    let mut out = arch.widened_to(reg.byte_width().max(1));
                    if reg.is_stack_pointer_alias() {
                        out.mark_as_stack_pointer_alias();
                    }
                    out
                } else {
                    reg
                }
            });
        }
        if changed {
            inst.touch_operands();
            inst.analyze_stack_usage();
        }
    }

    // Splice save/restore pairs around the spans they protect. The
    // whole list is rebuilt so overlapping spans cannot skew indices.
    if !spills.is_empty() {
        let mut saves: HashMap<usize, Vec<Inst>> = HashMap::new();
        let mut restores: HashMap<usize, Vec<Inst>> = HashMap::new();
        for (_, reg, first, last, slot) in spills {
            let slot_op = slot_operand(slot);
            let mut save = builder::mov_mem_r(slot_op, reg);
            save.flags.insert(InstFlags::IS_SAVE_RESTORE);
            let mut restore = builder::mov_r_mem(reg, slot_op);
            restore.flags.insert(InstFlags::IS_SAVE_RESTORE);
            saves.entry(first).or_default().push(save);
            restores.entry(last).or_default().push(restore);
        }
        let old = std::mem::take(&mut block.stmts);
        for (i, stmt) in old.into_iter().enumerate() {
            for save in saves.remove(&i).unwrap_or_default() {
                block.stmts.push(Stmt::Native(save));
            }
            block.stmts.push(stmt);
            for restore in restores.remove(&i).unwrap_or_default() {
                block.stmts.push(Stmt::Native(restore));
            }
        }
    }

    BlockAllocation { num_slots }
}

fn arch_gpr(num: u16) -> VirtualRegister {
    let hw = if num < 4 { num } else { num + 1 };
    VirtualRegister::from_hw_enc(hw as u8)
}

/// An abstract spill-slot memory operand; the slot pass rewrites it to
/// a concrete stack or segment location.
pub fn slot_operand(slot: usize) -> Operand {
    Operand::mem_reg(
        VirtualRegister::slot(slot as u16),
        OperandFlags::RW,
        crate::arch::GPR_WIDTH_BITS,
    )
}

fn spans_overlap(a: VrSpan, b: VrSpan) -> bool {
    a.first <= b.last && b.first <= a.last
}

fn is_allocatable(reg: VirtualRegister) -> bool {
    matches!(
        reg.kind,
        RegKind::TemporaryVirtual | RegKind::GenericVirtual
    )
}

fn collect_spans(block: &DecodedBlock) -> HashMap<VrKey, VrSpan> {
    let mut spans: HashMap<VrKey, VrSpan> = HashMap::new();
    for (i, stmt) in block.stmts.iter().enumerate() {
        let Some(inst) = stmt.native() else {
            continue;
        };
        let restricted = inst.flags.contains(InstFlags::USES_LEGACY_REGS);
        inst.visit_regs(|reg| {
            if !is_allocatable(reg) {
                return;
            }
            let key = VrKey {
                kind: reg.kind,
                num: reg.reg_num,
            };
            spans
                .entry(key)
                .and_modify(|span| {
                    span.last = i;
                    span.restricted |= restricted;
                })
                .or_insert(VrSpan {
                    first: i,
                    last: i,
                    restricted,
                });
        });
    }
    spans
}

/// Registers named by each statement.
fn per_stmt_used(block: &DecodedBlock) -> Vec<UsedRegisterSet> {
    block
        .stmts
        .iter()
        .map(|stmt| {
            let mut used = UsedRegisterSet::new();
            if let Some(inst) = stmt.native() {
                used.visit(inst);
            }
            used
        })
        .collect()
}

/// `live_before[i]`: architectural registers whose application values
/// are needed at entry to statement `i`. Index `len` is the block exit,
/// where everything is assumed live.
fn per_stmt_live(block: &DecodedBlock) -> Vec<LiveRegisterSet> {
    let n = block.stmts.len();
    let mut live = vec![LiveRegisterSet::default(); n + 1];
    live[n] = LiveRegisterSet::everything();
    let mut current = LiveRegisterSet::everything();
    for i in (0..n).rev() {
        if let Some(inst) = block.stmts[i].native() {
            current.visit(inst);
        }
        live[i] = current;
    }
    live
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::DecodedBlock;
    use crate::metadata::{standard_manager, Meta};

    fn block_with(stmts: Vec<Stmt>) -> DecodedBlock {
        let mgr = standard_manager();
        let mut block = DecodedBlock::new(0x1000, Meta::allocate(&mgr));
        block.stmts = stmts;
        block
    }

    fn vr(num: u16) -> VirtualRegister {
        VirtualRegister::virtual_reg(num, 8)
    }

    fn no_virtuals_left(block: &DecodedBlock) -> bool {
        block.stmts.iter().all(|stmt| {
            stmt.native().map_or(true, |inst| {
                let mut clean = true;
                inst.visit_regs(|reg| clean &= !reg.is_virtual());
                clean
            })
        })
    }

    #[test]
    fn dead_register_is_stolen_for_free() {
        // mov rax, 1 kills rax; the vr afterwards can have anything
        // that is then redefined. Write rbx at the end so something is
        // provably dead.
        let stmts = vec![
            Stmt::Native(builder::mov_r_imm(vr(0), 7)),
            Stmt::Native(builder::mov_r_r(
                VirtualRegister::from_name("rax"),
                vr(0),
            )),
            Stmt::Native(builder::mov_r_imm(VirtualRegister::from_name("rcx"), 0)),
        ];
        let mut block = block_with(stmts);
        let alloc = allocate_block(&mut block);
        assert!(no_virtuals_left(&block));
        // rcx is redefined after the span, so the vr fit without a
        // spill.
        assert_eq!(alloc.num_slots, 0);
    }

    #[test]
    fn conflicting_spans_get_distinct_registers() {
        let stmts = vec![
            Stmt::Native(builder::mov_r_imm(vr(0), 1)),
            Stmt::Native(builder::mov_r_imm(vr(1), 2)),
            Stmt::Native(builder::mov_r_r(vr(0), vr(1))),
            Stmt::Native(builder::mov_r_imm(VirtualRegister::from_name("rax"), 0)),
            Stmt::Native(builder::mov_r_imm(VirtualRegister::from_name("rcx"), 0)),
        ];
        let mut block = block_with(stmts);
        allocate_block(&mut block);
        assert!(no_virtuals_left(&block));
        // The two registers assigned to the overlapping vrs must
        // differ; check via the mov in the middle.
        let mov = block.stmts[2].native().unwrap();
        assert_ne!(
            mov.ops[0].register().reg_num,
            mov.ops[1].register().reg_num
        );
    }

    #[test]
    fn live_through_register_gets_spilled() {
        // Nothing dies in this block, so the vr must steal a register
        // and park its value in a slot.
        let stmts = vec![
            Stmt::Native(builder::mov_r_imm(vr(0), 1)),
            Stmt::Native(builder::push_r(vr(0))),
        ];
        let mut block = block_with(stmts);
        let alloc = allocate_block(&mut block);
        assert!(no_virtuals_left(&block));
        assert_eq!(alloc.num_slots, 1);
        // A save before and a restore after bracket the span.
        let saves: Vec<_> = block
            .stmts
            .iter()
            .filter_map(|s| s.native())
            .filter(|i| i.flags.contains(InstFlags::IS_SAVE_RESTORE))
            .collect();
        assert_eq!(saves.len(), 2);
        assert!(saves[0].ops[0].is_memory());
        assert!(saves[1].ops[1].is_memory());
    }
}
