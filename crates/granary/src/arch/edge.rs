//! Generated edge code: entry trampolines, direct-edge stubs, in-edge
//! sequences, and out-edge instantiation.
//!
//! Everything here is emitted with the stage-then-commit encoder pair
//! straight into the edge cache, except the in-edge sequence, which is
//! built as IR inside the referring block so its scratch register
//! participates in allocation.

use super::builder;
use super::encode::{EncodeKind, InstructionEncoder, NoTargets};
use super::inst::{Annotation, EncodedAddrSink, Inst, InstFlags, Stmt};
use super::operand::BranchTarget;
use super::reg::VirtualRegister;
use crate::edge::{DirectEdge, IndirectEdge, INDIRECT_TARGET_REG, OUT_EDGE_PC_OFFSET};
use crate::{CachePc, REDZONE_SIZE};
use std::sync::atomic::Ordering;

/// Upper bounds on the generated sequences, used to size allocations.
pub const DIRECT_EDGE_CODE_SIZE: usize = 64;
pub const EDGE_ENTRY_CODE_SIZE: usize = 128;
pub const OUT_EDGE_CODE_SIZE: usize = 64;

/// Encode `inst` at `*pc` with a stage/commit pair, advancing `*pc`.
fn enc(inst: &mut Inst, pc: &mut CachePc) {
    let staged = InstructionEncoder::new(EncodeKind::Staged);
    staged.encode(inst, *pc, &NoTargets);
    let commit = InstructionEncoder::new(EncodeKind::Commit);
    commit.encode_next(inst, pc, &NoTargets);
}

fn reg(name: &str) -> VirtualRegister {
    VirtualRegister::from_name(name)
}

/// Registers the entry trampolines preserve around the call into the
/// translator: everything the C ABI lets a callee clobber, minus the
/// ones the surrounding stub code manages itself.
const CALLER_SAVED: [&str; 8] = ["rax", "rcx", "rdx", "rsi", "r8", "r9", "r10", "r11"];

/// Bring the stack to the 16-byte alignment the ABI demands before a
/// call into compiled code; the frame pointer carries the old value.
fn emit_stack_align(pc: &mut CachePc) {
    enc(&mut builder::push_r(reg("rbp")), pc);
    enc(&mut builder::mov_r_r(reg("rbp"), VirtualRegister::stack_pointer()), pc);
    // and rsp, -16
    enc(&mut builder::raw_bytes(&[0x48, 0x83, 0xe4, 0xf0]), pc);
}

fn emit_stack_unalign(pc: &mut CachePc) {
    enc(
        &mut builder::mov_r_r(VirtualRegister::stack_pointer(), reg("rbp")),
        pc,
    );
    enc(&mut builder::pop_r(reg("rbp")), pc);
}

#[cfg(feature = "kernel")]
fn emit_enter_private_stack(pc: &mut CachePc) {
    use super::slot::{slot_mem_operand, SlotCategory};
    enc(&mut builder::cli(), pc);
    enc(
        &mut builder::xchg_mem_r(
            slot_mem_operand(SlotCategory::PrivateStack, 0, 64),
            VirtualRegister::stack_pointer(),
        ),
        pc,
    );
}

#[cfg(feature = "kernel")]
fn emit_leave_private_stack(pc: &mut CachePc) {
    use super::slot::{slot_mem_operand, SlotCategory};
    enc(
        &mut builder::xchg_mem_r(
            slot_mem_operand(SlotCategory::PrivateStack, 0, 64),
            VirtualRegister::stack_pointer(),
        ),
        pc,
    );
}

#[cfg(not(feature = "kernel"))]
fn emit_enter_private_stack(_pc: &mut CachePc) {}

#[cfg(not(feature = "kernel"))]
fn emit_leave_private_stack(_pc: &mut CachePc) {}

/// Generate the shared direct-edge entry trampoline at `pc`.
///
/// On entry `%rdi` holds the `DirectEdge` (pushed there by the stub).
/// The trampoline saves what the translator might clobber, passes the
/// context in `%rsi`, and calls the function whose address sits in the
/// 8-byte cell at `entry_fn_cell`.
pub fn generate_direct_edge_entry_code(
    context_addr: usize,
    entry_fn_cell: usize,
    mut pc: CachePc,
) -> CachePc {
    let start = pc;
    let mut pushf = builder::pushfq();
    pushf.effective_operand_width = 64;
    enc(&mut pushf, &mut pc);
    emit_enter_private_stack(&mut pc);
    for name in CALLER_SAVED {
        enc(&mut builder::push_r(reg(name)), &mut pc);
    }
    emit_stack_align(&mut pc);
    enc(
        &mut builder::mov_r_imm(reg("rsi"), context_addr as u64),
        &mut pc,
    );
    enc(&mut builder::call_mem_abs(entry_fn_cell), &mut pc);
    emit_stack_unalign(&mut pc);
    for name in CALLER_SAVED.iter().rev() {
        enc(&mut builder::pop_r(reg(name)), &mut pc);
    }
    emit_leave_private_stack(&mut pc);
    let mut popf = builder::popfq();
    popf.effective_operand_width = 64;
    enc(&mut popf, &mut pc);
    let mut ret = builder::ret();
    ret.effective_operand_width = 64;
    enc(&mut ret, &mut pc);
    assert!(pc - start <= EDGE_ENTRY_CODE_SIZE);
    pc
}

/// Generate the shared indirect-edge entry trampoline at `pc`.
///
/// On entry `%rdi` holds the `IndirectEdge` and `%rcx` the runtime
/// branch target. The translator is called as
/// `fn(edge, context, target)`; afterwards control re-enters the (now
/// extended) compare chain.
pub fn generate_indirect_edge_entry_code(
    context_addr: usize,
    entry_fn_cell: usize,
    mut pc: CachePc,
) -> CachePc {
    let start = pc;
    let mut pushf = builder::pushfq();
    pushf.effective_operand_width = 64;
    enc(&mut pushf, &mut pc);
    emit_enter_private_stack(&mut pc);
    for name in CALLER_SAVED {
        enc(&mut builder::push_r(reg(name)), &mut pc);
    }
    // The target rides in from the chain bottom in %rcx; pass it as the
    // third argument.
    enc(&mut builder::mov_r_r(reg("rdx"), reg("rcx")), &mut pc);
    emit_stack_align(&mut pc);
    enc(
        &mut builder::mov_r_imm(reg("rsi"), context_addr as u64),
        &mut pc,
    );
    enc(&mut builder::call_mem_abs(entry_fn_cell), &mut pc);
    emit_stack_unalign(&mut pc);
    for name in CALLER_SAVED.iter().rev() {
        enc(&mut builder::pop_r(reg(name)), &mut pc);
    }
    emit_leave_private_stack(&mut pc);
    let mut popf = builder::popfq();
    popf.effective_operand_width = 64;
    enc(&mut popf, &mut pc);
    // Retry the lookup through the freshly instantiated chain.
    enc(&mut builder::jmp_mem(reg("rdi"), OUT_EDGE_PC_OFFSET), &mut pc);
    enc(&mut builder::ud2(), &mut pc);
    assert!(pc - start <= EDGE_ENTRY_CODE_SIZE);
    pc
}

/// Generate a direct edge's stub at `pc` and initialize the edge's
/// slots to the fallback path.
pub fn generate_direct_edge_code(
    edge: &DirectEdge,
    edge_entry_code: CachePc,
    mut pc: CachePc,
    target_stack_valid: bool,
) -> CachePc {
    let start = pc;
    edge.edge_code.store(start, Ordering::Relaxed);

    // First execution falls through into the translator; later ones go
    // straight to the translation, making the cache effectively
    // append-only when nothing ever needs patching.
    enc(&mut builder::jmp_mem_abs(edge.entry_target_addr()), &mut pc);
    edge.entry_target.store(pc, Ordering::Release);

    let shift_redzone = REDZONE_SIZE != 0 && !target_stack_valid;
    if shift_redzone {
        enc(&mut builder::lea_rsp_disp(-REDZONE_SIZE), &mut pc);
    }

    // Borrow the first argument register for the edge pointer.
    enc(&mut builder::push_r(reg("rdi")), &mut pc);
    enc(
        &mut builder::mov_r_imm(reg("rdi"), edge as *const DirectEdge as u64),
        &mut pc,
    );
    enc(&mut builder::call_rel(edge_entry_code), &mut pc);
    enc(&mut builder::pop_r(reg("rdi")), &mut pc);

    if shift_redzone {
        enc(&mut builder::lea_rsp_disp(REDZONE_SIZE), &mut pc);
    }

    // Racing threads bounce back into the fallback until a winner has
    // published the translation into `exit_target`.
    edge.exit_target
        .store(edge.entry_target.load(Ordering::Relaxed), Ordering::Release);
    enc(&mut builder::jmp_mem_abs(edge.exit_target_addr()), &mut pc);
    enc(&mut builder::ud2(), &mut pc);

    assert!(pc - start <= DIRECT_EDGE_CODE_SIZE);
    pc
}

/// Build the in-edge IR for an indirect branch whose (virtual) target
/// register is `target`. The sequence replaces the branch itself; it
/// stashes the target in the chain's fixed register, saves what the
/// out-edge exit path restores, and dives into the compare chain.
pub fn emit_indirect_in_edge(
    stmts: &mut Vec<Stmt>,
    edge: &IndirectEdge,
    target: VirtualRegister,
    indirect_entry_code: CachePc,
) {
    let rdx = reg(INDIRECT_TARGET_REG);
    let rcx = reg("rcx");
    let rdi = reg("rdi");
    let edge_addr = edge as *const IndirectEdge as usize;

    stmts.push(Stmt::Annot(Annotation::UpdateEncodedAddress(
        EncodedAddrSink(&edge.in_edge_pc as *const _ as usize),
    )));
    if edge.shifts_redzone {
        stmts.push(Stmt::Native(builder::stack_blind(builder::lea_rsp_disp(
            -REDZONE_SIZE,
        ))));
    }
    // The chain always compares against %rdx; stash the app's value
    // and move the target over.
    stmts.push(Stmt::Native(builder::stack_blind(builder::push_r(rdx))));
    stmts.push(Stmt::Native(builder::mov_r_r(rdx, target)));
    stmts.push(Stmt::Native(builder::stack_blind(builder::push_r(rcx))));
    stmts.push(Stmt::Native(builder::stack_blind(builder::push_r(rdi))));
    stmts.push(Stmt::Native(builder::mov_r_imm(rdi, edge_addr as u64)));
    let mut dive = builder::jmp_mem(rdi, OUT_EDGE_PC_OFFSET);
    dive.flags.insert(InstFlags::IS_STICKY | InstFlags::IS_STACK_BLIND);
    stmts.push(Stmt::Native(dive));

    // The chain bottom: hand the target to the translator. New
    // out-edges miss to whatever `out_edge_pc` pointed at before them,
    // so the first instantiation misses straight back here.
    stmts.push(Stmt::Annot(Annotation::UpdateEncodedAddress(
        EncodedAddrSink(edge.out_edge_pc_addr()),
    )));
    stmts.push(Stmt::Annot(Annotation::UpdateEncodedAddress(
        EncodedAddrSink(&edge.out_edge_template as *const _ as usize),
    )));
    stmts.push(Stmt::Native(builder::mov_r_r(rcx, rdx)));
    let mut to_granary = builder::jmp_rel(indirect_entry_code);
    to_granary.flags.insert(InstFlags::IS_STICKY | InstFlags::IS_STACK_BLIND);
    stmts.push(Stmt::Native(to_granary));
    stmts.push(Stmt::Native(builder::ud2()));
}

/// Instantiate an out-edge for `(app_pc -> cache_pc)` at `pc` in the
/// edge cache, linking it at the head of the edge's compare chain.
///
/// The comparison uses a cancellation: `%rcx` is loaded with the
/// negated `app_pc` and added to the runtime target, so a zero result
/// (caught by `JRCXZ`) means a hit.
///
/// Must be called with the edge's lock held.
pub fn instantiate_indirect_edge(
    edge: &IndirectEdge,
    app_pc: usize,
    cache_pc: CachePc,
    mut pc: CachePc,
) -> CachePc {
    debug_assert!(edge.lock.try_lock().is_err(), "edge lock not held");
    let start = pc;
    let rdx = reg(INDIRECT_TARGET_REG);
    let rcx = reg("rcx");
    let rdi = reg("rdi");
    let miss_target = edge.out_edge_pc.load(Ordering::Relaxed);

    enc(
        &mut builder::mov_r_imm(rcx, (app_pc as u64).wrapping_neg()),
        &mut pc,
    );
    enc(&mut builder::lea_base_index(rcx, rcx, rdx), &mut pc);
    // jrcxz +2 skips the miss jump (always 5 bytes, rel32).
    let hit_pc = pc + 2 + 5;
    let mut jrcxz = builder::jrcxz(BranchTarget::Pc(hit_pc));
    enc(&mut jrcxz, &mut pc);
    enc(&mut builder::jmp_rel(miss_target), &mut pc);

    // Hit: restore what the in-edge saved and leave for the block.
    enc(&mut builder::pop_r(rdi), &mut pc);
    enc(&mut builder::pop_r(rcx), &mut pc);
    enc(&mut builder::pop_r(rdx), &mut pc);
    if edge.shifts_redzone {
        enc(&mut builder::lea_rsp_disp(REDZONE_SIZE), &mut pc);
    }
    enc(&mut builder::jmp_rel(cache_pc), &mut pc);

    assert!(pc - start <= OUT_EDGE_CODE_SIZE);
    // Publish last: readers that load the old head keep working, ones
    // that see the new head find fully written bytes.
    edge.out_edge_pc.store(start, Ordering::Release);
    pc
}

/// Patch a direct branch (`JMP`/`CALL` rel32 or `Jcc` rel32) at
/// `patch_pc` so it targets `dest` without the stub detour. Done with a
/// single fenced store; concurrent executors see the old or new
/// displacement, nothing in between.
pub fn patch_direct_branch(patch_pc: CachePc, dest: CachePc) -> bool {
    let opcode = unsafe { *(patch_pc as *const u8) };
    let (disp_off, len) = match opcode {
        0xe8 | 0xe9 => (1usize, 5usize),
        0x0f => (2, 6),
        _ => return false,
    };
    let disp64 = (dest as i64) - (patch_pc + len) as i64;
    let Ok(disp) = i32::try_from(disp64) else {
        return false;
    };
    // The four displacement bytes must sit within one aligned qword for
    // the atomic store.
    let first = patch_pc + disp_off;
    if (first & !7) != ((first + 3) & !7) {
        return false;
    }
    let aligned = first & !7;
    let cell = unsafe { &*(aligned as *const std::sync::atomic::AtomicU64) };
    let mut word = cell.load(Ordering::Relaxed).to_le_bytes();
    word[first - aligned..first - aligned + 4].copy_from_slice(&disp.to_le_bytes());
    std::sync::atomic::fence(Ordering::SeqCst);
    cell.store(u64::from_le_bytes(word), Ordering::SeqCst);
    std::sync::atomic::fence(Ordering::SeqCst);
    true
}

