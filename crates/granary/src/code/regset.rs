//! Bitsets over the fifteen schedulable general-purpose registers.

use crate::arch::inst::{Inst, InstFlags};
use crate::arch::operand::OperandKind;
use crate::arch::reg::{RegKind, VirtualRegister};

/// Number of schedulable GPRs (all sixteen minus `%rsp`).
pub const NUM_SCHEDULABLE_GPRS: u16 = 15;

/// A set of schedulable GPRs, indexed by `ArchGpr` register number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct GprSet(u16);

impl GprSet {
    pub fn empty() -> Self {
        Self(0)
    }

    pub fn all() -> Self {
        Self((1 << NUM_SCHEDULABLE_GPRS) - 1)
    }

    pub fn insert_num(&mut self, num: u16) {
        debug_assert!(num < NUM_SCHEDULABLE_GPRS);
        self.0 |= 1 << num;
    }

    pub fn remove_num(&mut self, num: u16) {
        debug_assert!(num < NUM_SCHEDULABLE_GPRS);
        self.0 &= !(1 << num);
    }

    pub fn contains_num(&self, num: u16) -> bool {
        self.0 & (1 << num) != 0
    }

    pub fn union_with(&mut self, other: GprSet) {
        self.0 |= other.0;
    }

    pub fn iter_nums(&self) -> impl Iterator<Item = u16> + '_ {
        let bits = self.0;
        (0..NUM_SCHEDULABLE_GPRS).filter(move |n| bits & (1 << n) != 0)
    }
}

fn gpr_num(reg: VirtualRegister) -> Option<u16> {
    (reg.kind == RegKind::ArchGpr).then_some(reg.reg_num)
}

/// Registers named anywhere by a run of instructions. Used to keep the
/// allocator away from registers an instruction touches.
#[derive(Clone, Copy, Debug, Default)]
pub struct UsedRegisterSet(pub GprSet);

impl UsedRegisterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark every register the instruction names, compound-memory base
    /// and index included.
    pub fn visit(&mut self, inst: &Inst) {
        inst.visit_regs(|reg| {
            if let Some(num) = gpr_num(reg) {
                self.0.insert_num(num);
            }
        });
        self.revive_restricted_registers(inst);
    }

    /// Registers an instruction's encoding constraints take away from
    /// the scheduler: a legacy high-byte reference (`%ah`..`%bh`)
    /// cannot coexist with a REX prefix, so the REX-only registers all
    /// become off limits.
    pub fn revive_restricted_registers(&mut self, inst: &Inst) {
        if inst.flags.contains(InstFlags::USES_LEGACY_REGS) {
            // Register numbers skip %rsp: numbers 7 and up are the
            // REX-extended %r8..%r15.
            for num in 7..NUM_SCHEDULABLE_GPRS {
                self.0.insert_num(num);
            }
        }
    }

    pub fn is_used(&self, num: u16) -> bool {
        self.0.contains_num(num)
    }
}

/// Backward-flow liveness over the schedulable GPRs.
///
/// Conditional writes and partial writes revive; unconditional full
/// writes kill.
#[derive(Clone, Copy, Debug, Default)]
pub struct LiveRegisterSet(pub GprSet);

impl LiveRegisterSet {
    pub fn everything() -> Self {
        Self(GprSet::all())
    }

    pub fn revive(&mut self, reg: VirtualRegister) {
        if let Some(num) = gpr_num(reg) {
            self.0.insert_num(num);
        }
    }

    pub fn kill(&mut self, reg: VirtualRegister) {
        if let Some(num) = gpr_num(reg) {
            self.0.remove_num(num);
        }
    }

    pub fn is_live(&self, num: u16) -> bool {
        self.0.contains_num(num)
    }

    /// Flow one instruction backwards through the set.
    pub fn visit(&mut self, inst: &Inst) {
        // Kill the unconditional full definitions first, then revive
        // everything read, so a register both read and written stays
        // live above the instruction.
        for op in &inst.ops {
            if let OperandKind::Register(reg) = op.kind {
                if op.is_memory() {
                    continue;
                }
                let full_write = op.flags.is_write()
                    && !op.flags.is_conditional_write()
                    && (!reg.preserves_bytes_on_write() || op.is_definition);
                if full_write && !op.flags.is_read() {
                    self.kill(reg);
                }
            }
        }
        for op in &inst.ops {
            match op.kind {
                OperandKind::Register(reg) => {
                    if op.is_memory() {
                        self.revive(reg);
                    } else if op.flags.is_read()
                        || op.flags.is_conditional_write()
                        || reg.preserves_bytes_on_write()
                    {
                        self.revive(reg);
                    }
                }
                OperandKind::Memory(mem) => {
                    if mem.base.is_valid() {
                        self.revive(mem.base);
                    }
                    if mem.index.is_valid() {
                        self.revive(mem.index);
                    }
                }
                _ => {}
            }
        }
        // Legacy references pin the REX-extended half as if read.
        if inst.flags.contains(InstFlags::USES_LEGACY_REGS) {
            for num in 7..NUM_SCHEDULABLE_GPRS {
                self.0.insert_num(num);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::builder;
    use crate::arch::reg::VirtualRegister;

    fn num(name: &str) -> u16 {
        VirtualRegister::from_name(name).reg_num
    }

    #[test]
    fn full_writes_kill_reads_revive() {
        let mut live = LiveRegisterSet::default();
        live.revive(VirtualRegister::from_name("rax"));
        live.revive(VirtualRegister::from_name("rbx"));
        // mov rax, rcx: kills rax, revives rcx.
        let inst = builder::mov_r_r(
            VirtualRegister::from_name("rax"),
            VirtualRegister::from_name("rcx"),
        );
        live.visit(&inst);
        assert!(!live.is_live(num("rax")));
        assert!(live.is_live(num("rcx")));
        assert!(live.is_live(num("rbx")));
    }

    #[test]
    fn partial_writes_revive() {
        let mut live = LiveRegisterSet::default();
        // mov al, cl writes one byte of rax and so also reads it.
        let inst = builder::mov_r_r(
            VirtualRegister::from_name("al"),
            VirtualRegister::from_name("cl"),
        );
        live.visit(&inst);
        assert!(live.is_live(num("rax")));
    }

    #[test]
    fn thirty_two_bit_write_is_a_full_definition() {
        let mut live = LiveRegisterSet::default();
        live.revive(VirtualRegister::from_name("rax"));
        let inst = builder::mov_r_r(
            VirtualRegister::from_name("eax"),
            VirtualRegister::from_name("ecx"),
        );
        live.visit(&inst);
        assert!(!live.is_live(num("rax")));
    }

    #[test]
    fn used_set_sees_memory_operands() {
        let mut used = UsedRegisterSet::new();
        let inst = builder::lea_base_index(
            VirtualRegister::from_name("rax"),
            VirtualRegister::from_name("rbx"),
            VirtualRegister::from_name("rcx"),
        );
        used.visit(&inst);
        assert!(used.is_used(num("rax")));
        assert!(used.is_used(num("rbx")));
        assert!(used.is_used(num("rcx")));
        assert!(!used.is_used(num("rdx")));
    }
}
