//! Trampolines that carry the machine state into instrumentation code.
//!
//! A *context callback* hands the tool a pointer to the saved register
//! file; an *outline callback* passes explicit arguments in the ABI
//! registers and saves only what the call would clobber beyond them.

use super::builder;
use super::encode::{EncodeKind, InstructionEncoder, NoTargets};
use super::inst::{Inst, Stmt};
use super::operand::{Operand, OperandFlags};
use super::reg::VirtualRegister;
use crate::cfg::Trace;
use crate::{CachePc, REDZONE_SIZE};

/// Upper bound on a generated trampoline.
pub const CONTEXT_CALL_CODE_SIZE: usize = 128;

/// The saved register file a context callback receives. The field
/// order matches the trampoline's push order (last push at the lowest
/// address).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct MachineContext {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,
}

/// Push order for the full register file; pushing `%rax` first puts it
/// at the highest address, matching [`MachineContext`].
const CONTEXT_PUSH_ORDER: [&str; 15] = [
    "rax", "rcx", "rdx", "rbx", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12", "r13", "r14",
    "r15",
];

/// Registers an outline callback must preserve itself: caller-saved
/// registers that are not argument registers.
const OUTLINE_SAVED: [&str; 4] = ["rax", "r10", "r11", "rbx"];

/// A generated trampoline around a tool function.
pub struct Callback {
    /// The tool function the trampoline calls.
    pub callback: usize,
    /// Entry point of the generated wrapper.
    pub wrapped_callback: CachePc,
}

fn enc(inst: &mut Inst, pc: &mut CachePc) {
    let staged = InstructionEncoder::new(EncodeKind::Staged);
    staged.encode(inst, *pc, &NoTargets);
    let commit = InstructionEncoder::new(EncodeKind::Commit);
    commit.encode_next(inst, pc, &NoTargets);
}

fn reg(name: &str) -> VirtualRegister {
    VirtualRegister::from_name(name)
}

fn emit_redzone_shift(pc: &mut CachePc, direction: i32) {
    if REDZONE_SIZE != 0 {
        enc(&mut builder::lea_rsp_disp(direction * REDZONE_SIZE), pc);
    }
}

fn emit_aligned_call(pc: &mut CachePc, target_cell: usize) {
    enc(&mut builder::push_r(reg("rbp")), pc);
    enc(
        &mut builder::mov_r_r(reg("rbp"), VirtualRegister::stack_pointer()),
        pc,
    );
    enc(&mut builder::raw_bytes(&[0x48, 0x83, 0xe4, 0xf0]), pc); // and rsp, -16
    enc(&mut builder::call_mem_abs(target_cell), pc);
    enc(
        &mut builder::mov_r_r(VirtualRegister::stack_pointer(), reg("rbp")),
        pc,
    );
    enc(&mut builder::pop_r(reg("rbp")), pc);
}

/// Generate a context-callback trampoline at `pc`: save flags and the
/// whole register file, pass a `MachineContext*` as the first argument,
/// call the tool, restore everything.
///
/// `func_cell` is an owned 8-byte cell holding the tool function's
/// address.
pub fn generate_context_callback(func: usize, func_cell: usize, mut pc: CachePc) -> (Callback, CachePc) {
    let start = pc;
    emit_redzone_shift(&mut pc, -1);
    let mut pushf = builder::pushfq();
    pushf.effective_operand_width = 64;
    enc(&mut pushf, &mut pc);
    for name in CONTEXT_PUSH_ORDER {
        enc(&mut builder::push_r(reg(name)), &mut pc);
    }
    // The saved registers are the MachineContext; its address is the
    // first argument.
    enc(
        &mut builder::lea_base_disp(reg("rdi"), VirtualRegister::stack_pointer(), 0),
        &mut pc,
    );
    emit_aligned_call(&mut pc, func_cell);
    for name in CONTEXT_PUSH_ORDER.iter().rev() {
        enc(&mut builder::pop_r(reg(name)), &mut pc);
    }
    let mut popf = builder::popfq();
    popf.effective_operand_width = 64;
    enc(&mut popf, &mut pc);
    emit_redzone_shift(&mut pc, 1);
    let mut ret = builder::ret();
    ret.effective_operand_width = 64;
    enc(&mut ret, &mut pc);
    assert!(pc - start <= CONTEXT_CALL_CODE_SIZE);
    (
        Callback {
            callback: func,
            wrapped_callback: start,
        },
        pc,
    )
}

/// Generate an outline-callback trampoline at `pc`. Argument registers
/// are *not* saved: their current values are the arguments.
pub fn generate_outline_callback(func: usize, func_cell: usize, mut pc: CachePc) -> (Callback, CachePc) {
    let start = pc;
    emit_redzone_shift(&mut pc, -1);
    let mut pushf = builder::pushfq();
    pushf.effective_operand_width = 64;
    enc(&mut pushf, &mut pc);
    for name in OUTLINE_SAVED {
        enc(&mut builder::push_r(reg(name)), &mut pc);
    }
    emit_aligned_call(&mut pc, func_cell);
    for name in OUTLINE_SAVED.iter().rev() {
        enc(&mut builder::pop_r(reg(name)), &mut pc);
    }
    let mut popf = builder::popfq();
    popf.effective_operand_width = 64;
    enc(&mut popf, &mut pc);
    emit_redzone_shift(&mut pc, 1);
    let mut ret = builder::ret();
    ret.effective_operand_width = 64;
    enc(&mut ret, &mut pc);
    assert!(pc - start <= CONTEXT_CALL_CODE_SIZE);
    (
        Callback {
            callback: func,
            wrapped_callback: start,
        },
        pc,
    )
}

/// The ABI argument registers, in order.
const ARG_REGS: [&str; 6] = ["rdi", "rsi", "rdx", "rcx", "r8", "r9"];

/// Materialize outline-callback arguments in two steps: first copy each
/// source operand into a scratch virtual register, then move the
/// scratches into the argument registers. A source that itself names an
/// argument register is therefore read before anything clobbers it.
pub fn materialize_callback_args(trace: &mut Trace, args: &[Operand]) -> Vec<Stmt> {
    assert!(args.len() <= ARG_REGS.len(), "too many callback arguments");
    let mut stmts = Vec::new();
    let mut scratches = Vec::new();
    for arg in args {
        let vr = trace.alloc_virtual_register(8);
        let inst = if arg.is_immediate() {
            builder::mov_r_imm(vr, arg.immediate() as u64)
        } else if arg.is_memory() {
            builder::mov_r_mem(vr, *arg)
        } else {
            builder::mov_r_r(vr, arg.register().widened_to(8))
        };
        stmts.push(Stmt::Native(inst));
        scratches.push(vr);
    }
    for (vr, name) in scratches.into_iter().zip(ARG_REGS) {
        let mut arch = reg(name);
        arch.widen(8);
        stmts.push(Stmt::Native(builder::mov_r_r(arch, vr)));
    }
    stmts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argument_materialization_is_two_phase() {
        let mut trace = Trace::new();
        let args = [
            Operand::reg(reg("rdi"), OperandFlags::READ),
            Operand::reg(reg("rsi"), OperandFlags::READ),
        ];
        let stmts = materialize_callback_args(&mut trace, &args);
        let insts: Vec<_> = stmts.iter().filter_map(|s| s.native()).collect();
        assert_eq!(insts.len(), 4);
        // Copies into scratches first...
        assert!(insts[0].ops[0].register().is_virtual());
        assert!(insts[1].ops[0].register().is_virtual());
        // ...then scratches into the argument registers, so %rsi (the
        // second source) was read before %rdi (the first target) was
        // written.
        assert!(!insts[2].ops[0].register().is_virtual());
        assert!(insts[2].ops[1].register().is_virtual());
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn context_callback_round_trips_registers() {
        use crate::cache::CodeCache;
        use crate::os::memory::allocate_code_pages;
        use std::sync::atomic::{AtomicU64, Ordering};

        static SEEN_RBX: AtomicU64 = AtomicU64::new(0);

        unsafe extern "sysv64" fn tool(ctx: *mut MachineContext) {
            SEEN_RBX.store((*ctx).rbx, Ordering::SeqCst);
            (*ctx).rax = 0x5a5a;
        }

        let base = allocate_code_pages(1);
        let cache = CodeCache::new(base, 1);
        let code = cache.allocate_block(CONTEXT_CALL_CODE_SIZE + 16);
        let cell = code + CONTEXT_CALL_CODE_SIZE;
        unsafe { (cell as *mut u64).write(tool as usize as u64) };
        let (cb, _) = generate_context_callback(tool as usize, cell, code);

        // Call the trampoline with a known %rbx and observe the tool's
        // view and its write-back through the context.
        let out: u64;
        let seen_rax: u64;
        unsafe {
            std::arch::asm!(
                "push rbx",
                "mov rbx, 0x1234",
                "call {tramp}",
                "mov {out}, rbx",
                "pop rbx",
                tramp = in(reg) cb.wrapped_callback,
                out = out(reg) out,
                out("rax") seen_rax,
                lateout("rcx") _,
                lateout("rdx") _,
                lateout("rsi") _,
                lateout("rdi") _,
                lateout("r8") _,
                lateout("r9") _,
                lateout("r10") _,
                lateout("r11") _,
            );
        }
        assert_eq!(SEEN_RBX.load(Ordering::SeqCst), 0x1234);
        assert_eq!(out, 0x1234);
        // The write into the saved context materialized on return.
        assert_eq!(seen_rax, 0x5a5a);
        crate::os::memory::free_pages(base, 1);
    }
}
