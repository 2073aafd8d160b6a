//! Edge bookkeeping structures.
//!
//! Generated stub code refers to these records by the absolute
//! addresses of their fields, so they are allocated from the context's
//! pinned data arena (which is mapped next to the code caches, keeping
//! every field rip-reachable) and never move.

use crate::metadata::Meta;
use std::sync::atomic::AtomicUsize;
use std::sync::Mutex;

/// A patchable link from a direct branch to its translation.
///
/// The stub's opening instruction is `JMP [&entry_target]`; until the
/// destination is translated the slot holds the fallback path, so the
/// first execution falls through into the translator. Patching is one
/// aligned 8-byte store per slot, with no intermediate states visible.
#[repr(C)]
pub struct DirectEdge {
    /// Where the stub's first jump goes. Initialized to the fallback
    /// path just past the jump itself.
    pub entry_target: AtomicUsize,
    /// Where the fallback path jumps after asking for a translation.
    /// Initialized to the fallback itself, so racing threads spin into
    /// the translator until one wins.
    pub exit_target: AtomicUsize,
    /// The stub's first instruction.
    pub edge_code: AtomicUsize,
    /// Encoded address of the branch that targets this stub; patched
    /// to jump straight to the translation once it exists.
    pub patch_instruction: AtomicUsize,
    /// Metadata describing the destination block; taken by the
    /// translator on first entry.
    pub dest_meta: Mutex<Option<Meta>>,
}

impl DirectEdge {
    pub fn new(dest_meta: Meta) -> Self {
        Self {
            entry_target: AtomicUsize::new(0),
            exit_target: AtomicUsize::new(0),
            edge_code: AtomicUsize::new(0),
            patch_instruction: AtomicUsize::new(0),
            dest_meta: Mutex::new(Some(dest_meta)),
        }
    }

    /// Address of the slot the stub's opening jump reads.
    pub fn entry_target_addr(&self) -> usize {
        &self.entry_target as *const AtomicUsize as usize
    }

    /// Address of the slot the fallback's closing jump reads.
    pub fn exit_target_addr(&self) -> usize {
        &self.exit_target as *const AtomicUsize as usize
    }
}

/// Which architectural register carries the runtime target through an
/// indirect edge's compare chain.
pub const INDIRECT_TARGET_REG: &str = "rdx";

/// Byte offset of `out_edge_pc` within [`IndirectEdge`]; the in-edge
/// code jumps through `[RDI + OUT_EDGE_PC_OFFSET]`.
pub const OUT_EDGE_PC_OFFSET: i32 = 0;

/// Lazily extended machinery turning one indirect branch into a chain
/// of `(app_pc -> cache_pc)` comparisons.
#[repr(C)]
pub struct IndirectEdge {
    /// Head of the compare chain. Readers follow it with a plain load;
    /// the instantiator publishes a new head last, after the clone's
    /// bytes are in place.
    pub out_edge_pc: AtomicUsize,
    /// Where the chain bottoms out (the hand-off into the translator);
    /// new clones miss to the previous head.
    pub out_edge_template: AtomicUsize,
    /// Encoded address of the in-edge code in the block cache.
    pub in_edge_pc: AtomicUsize,
    /// Shape facts an instantiated out-edge must reproduce.
    pub shifts_redzone: bool,
    /// Serializes template instantiation.
    pub lock: Mutex<()>,
    /// Metadata template for translations requested through this edge.
    pub meta_template: Mutex<Option<Meta>>,
}

impl IndirectEdge {
    pub fn new(meta_template: Meta, shifts_redzone: bool) -> Self {
        Self {
            out_edge_pc: AtomicUsize::new(0),
            out_edge_template: AtomicUsize::new(0),
            in_edge_pc: AtomicUsize::new(0),
            shifts_redzone,
            lock: Mutex::new(()),
            meta_template: Mutex::new(Some(meta_template)),
        }
    }

    pub fn out_edge_pc_addr(&self) -> usize {
        &self.out_edge_pc as *const AtomicUsize as usize
    }
}

const _: () = {
    // The in-edge code hard-codes the offset of `out_edge_pc`.
    assert!(std::mem::offset_of!(IndirectEdge, out_edge_pc) == OUT_EDGE_PC_OFFSET as usize);
    assert!(std::mem::offset_of!(DirectEdge, entry_target) == 0);
};
