//! Kernel exception tables and recovery probes.
//!
//! The kernel publishes, per module, a sorted array of
//! `(fault_rel32, fixup_rel32)` pairs. When a translated instruction's
//! original pc has an entry, the load or store may legitimately fault,
//! and execution resumes at the fixup. The translator wraps such
//! instructions in a probe that performs the access through a fixed
//! trampoline, then branches to the recovery pc if the trampoline
//! reports a fault through its `%rcx` 0/1 convention.

use crate::arch::builder;
use crate::arch::inst::{Inst, Stmt};
use crate::arch::operand::LabelId;
use crate::AppPc;

/// One exception-table entry, as laid out by the kernel: both fields
/// are relative to the entry's own address.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct ExceptionTableEntry {
    pub fault_addr_rel32: i32,
    pub fixup_addr_rel32: i32,
}

/// Recovery information for a faultable instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Recovery {
    pub fixup_pc: AppPc,
    /// An extended entry: the trampoline also materializes an error
    /// code, and the real recovery pc is offset by the sentinel.
    pub is_error_entry: bool,
}

/// A module's exception table.
pub struct ExceptionTable<'a> {
    entries: &'a [ExceptionTableEntry],
    /// Threshold distinguishing extended (error-producing) entries.
    /// This is an OS-version-dependent heuristic, so it is carried as
    /// data rather than hard-coded.
    error_sentinel: i64,
}

/// The default sentinel for the kernels this was built against.
pub const DEFAULT_ERROR_SENTINEL: i64 = 0x7fff_fff0 - 4;

impl<'a> ExceptionTable<'a> {
    pub fn new(entries: &'a [ExceptionTableEntry], error_sentinel: i64) -> Self {
        debug_assert!(entries.windows(2).all(|w| {
            entry_fault_pc(&w[0]) <= entry_fault_pc(&w[1])
        }));
        Self {
            entries,
            error_sentinel,
        }
    }

    /// Binary-search for a recovery entry covering `fault_pc`.
    pub fn find_recovery(&self, fault_pc: AppPc) -> Option<Recovery> {
        let idx = self
            .entries
            .binary_search_by_key(&fault_pc, entry_fault_pc)
            .ok()?;
        let entry = &self.entries[idx];
        let fixup_pc = entry_fixup_pc(entry);
        let delta = fixup_pc as i64 - entry_fault_pc(entry) as i64;
        if delta >= self.error_sentinel {
            Some(Recovery {
                fixup_pc: (fixup_pc as i64 - self.error_sentinel - 4) as usize,
                is_error_entry: true,
            })
        } else {
            Some(Recovery {
                fixup_pc,
                is_error_entry: false,
            })
        }
    }
}

fn entry_fault_pc(entry: &ExceptionTableEntry) -> AppPc {
    let base = entry as *const ExceptionTableEntry as usize;
    (base as i64 + i64::from(entry.fault_addr_rel32)) as usize
}

fn entry_fixup_pc(entry: &ExceptionTableEntry) -> AppPc {
    let base = entry as *const ExceptionTableEntry as usize + 4;
    (base as i64 + i64::from(entry.fixup_addr_rel32)) as usize
}

/// Access widths the uaccess trampolines come in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessWidth {
    B8,
    B16,
    B32,
    B64,
}

impl AccessWidth {
    pub fn from_bits(bits: u16) -> Self {
        match bits {
            8 => AccessWidth::B8,
            16 => AccessWidth::B16,
            32 => AccessWidth::B32,
            _ => AccessWidth::B64,
        }
    }

    fn index(self) -> usize {
        match self {
            AccessWidth::B8 => 0,
            AccessWidth::B16 => 1,
            AccessWidth::B32 => 2,
            AccessWidth::B64 => 3,
        }
    }
}

/// Addresses of the fixed `granary_uaccess_*` trampolines, indexed by
/// `{read, write, read_error, write_error} x {8, 16, 32, 64}`.
#[derive(Clone, Copy, Debug, Default)]
pub struct UaccessTrampolines {
    pub read: [usize; 4],
    pub write: [usize; 4],
    pub read_error: [usize; 4],
    pub write_error: [usize; 4],
}

impl UaccessTrampolines {
    fn select(&self, is_write: bool, is_error: bool, width: AccessWidth) -> usize {
        let table = match (is_write, is_error) {
            (false, false) => &self.read,
            (true, false) => &self.write,
            (false, true) => &self.read_error,
            (true, true) => &self.write_error,
        };
        table[width.index()]
    }
}

/// Wrap a faultable load/store in a recovery probe:
///
/// 1. the probed instruction's scratch register is saved,
/// 2. the matching trampoline performs the access,
/// 3. `%rcx` is zero on success, so a `JRCXZ` skips the recovery
///    branch,
/// 4. the scratch register is restored on both paths.
///
/// Returns the statements to place before the instruction and the jump
/// taken to the recovery pc; the caller splices them around `inst` and
/// resolves `continue_label`.
pub fn build_uaccess_probe(
    inst: &Inst,
    recovery: Recovery,
    trampolines: &UaccessTrampolines,
    is_write: bool,
    scratch_save_slot: crate::arch::VirtualRegister,
    continue_label: LabelId,
) -> Vec<Stmt> {
    use crate::arch::operand::BranchTarget;

    let width = AccessWidth::from_bits(inst.effective_operand_width.max(8));
    let target = trampolines.select(is_write, recovery.is_error_entry, width);
    let rcx = crate::arch::VirtualRegister::from_name("rcx");

    let mut stmts = Vec::new();
    // Preserve %rcx around the trampoline's status convention.
    stmts.push(Stmt::Native(builder::mov_r_r(scratch_save_slot, rcx)));
    stmts.push(Stmt::Native(builder::call_rel(target)));
    let mut restore = builder::mov_r_r(rcx, scratch_save_slot);
    restore.flags.insert(crate::arch::inst::InstFlags::IS_SAVE_RESTORE);
    // Fault status is in %rcx: zero means the access went through.
    stmts.push(Stmt::Native(builder::jrcxz(BranchTarget::Label(
        continue_label,
    ))));
    stmts.push(Stmt::Native(restore.clone()));
    stmts.push(Stmt::Native(builder::jmp_rel(recovery.fixup_pc)));
    stmts.push(Stmt::Label(continue_label));
    stmts.push(Stmt::Native(restore));
    stmts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with(deltas: &[(i32, i32)]) -> Vec<ExceptionTableEntry> {
        deltas
            .iter()
            .map(|&(fault, fixup)| ExceptionTableEntry {
                fault_addr_rel32: fault,
                fixup_addr_rel32: fixup,
            })
            .collect()
    }

    #[test]
    fn lookup_finds_exact_fault_pc() {
        let entries = table_with(&[(0x100, 0x200), (0x300, 0x400)]);
        // Entries must be sorted by absolute fault pc; with equal deltas
        // per entry the array order already is.
        let table = ExceptionTable::new(&entries, DEFAULT_ERROR_SENTINEL);
        let fault0 = entry_fault_pc(&entries[0]);
        let rec = table.find_recovery(fault0).expect("entry found");
        assert!(!rec.is_error_entry);
        assert_eq!(rec.fixup_pc, entry_fixup_pc(&entries[0]));
        assert!(table.find_recovery(fault0 + 1).is_none());
    }

    #[test]
    fn error_entries_are_rebased() {
        let sentinel = DEFAULT_ERROR_SENTINEL;
        // Craft a fixup far enough above its fault to be an extended
        // entry.
        let entries = table_with(&[(0, (sentinel + 4 + 0x10) as i32)]);
        let table = ExceptionTable::new(&entries, sentinel);
        let fault = entry_fault_pc(&entries[0]);
        let rec = table.find_recovery(fault).expect("entry found");
        assert!(rec.is_error_entry);
        assert_eq!(rec.fixup_pc, entry_fixup_pc(&entries[0]) - sentinel as usize - 4);
    }
}
