//! Segment-addressed spill slots.
//!
//! When a block's stack cannot be trusted, spill slots live in a
//! per-thread (user, `%fs`) or per-CPU (kernel, `%gs`) area at fixed
//! offsets, reached with segment-relative addressing. No locking is
//! needed; the OS guarantees each thread/core sees its own area.

use super::operand::{Operand, OperandFlags, SegmentReg};

/// Slot categories within the segment area.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotCategory {
    /// Scratch storage for virtual registers.
    VirtualRegister,
    /// The saved application stack pointer while on the private stack.
    PrivateStack,
}

/// Byte offset of a slot within the segment area.
pub fn slot_offset(category: SlotCategory, slot: usize) -> i32 {
    match category {
        SlotCategory::PrivateStack => 0x80,
        SlotCategory::VirtualRegister => 0x100 + (slot as i32) * 8,
    }
}

/// In-kernel spill slots use `%gs` (per-CPU); user mode uses `%fs`
/// (per-thread).
fn slot_segment() -> SegmentReg {
    if cfg!(feature = "kernel") {
        SegmentReg::Gs
    } else {
        SegmentReg::Fs
    }
}

/// A segment-relative memory operand for a slot.
pub fn slot_mem_operand(category: SlotCategory, slot: usize, width_bits: u16) -> Operand {
    let mut op = Operand::pointer(
        slot_offset(category, slot) as u64,
        OperandFlags::RW,
        width_bits,
    );
    op.segment = slot_segment();
    op
}
