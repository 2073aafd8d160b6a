//! The trace arena.

use super::block::{Block, BlockId, DecodedBlock};
use crate::arch::operand::LabelId;
use crate::arch::reg::{RegKind, VirtualRegister};
use crate::AppPc;

/// A locally built control-flow graph of blocks being translated
/// together. Owns every block; all cross-references are [`BlockId`]s.
pub struct Trace {
    blocks: Vec<Block>,
    entry: Option<BlockId>,
    next_label: u32,
    next_vr: u16,
}

impl Default for Trace {
    fn default() -> Self {
        Self::new()
    }
}

impl Trace {
    pub fn new() -> Self {
        Self {
            blocks: Vec::new(),
            entry: None,
            // Trace-level virtual registers live above the manglers'
            // small per-instruction pools.
            next_vr: 256,
            next_label: 0,
        }
    }

    pub fn add_block(&mut self, block: Block) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(block);
        if self.entry.is_none() {
            self.entry = Some(id);
        }
        id
    }

    pub fn set_entry(&mut self, id: BlockId) {
        self.entry = Some(id);
    }

    pub fn entry(&self) -> BlockId {
        self.entry.expect("trace has no entry block")
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0 as usize]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.0 as usize]
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn ids(&self) -> impl Iterator<Item = BlockId> {
        (0..self.blocks.len() as u32).map(BlockId)
    }

    /// The entry block, which must be decoded.
    pub fn entry_block(&self) -> &DecodedBlock {
        self.block(self.entry())
            .as_decoded()
            .expect("entry block is not decoded")
    }

    /// Find a decoded block for `app_pc` whose metadata can serve.
    pub fn find_decoded(&self, app_pc: AppPc) -> Option<BlockId> {
        self.ids().find(|&id| match self.block(id) {
            Block::Decoded(b) => b.app_pc == app_pc,
            _ => false,
        })
    }

    /// A fresh label for branch targets within this trace.
    pub fn alloc_label(&mut self) -> LabelId {
        let id = LabelId(self.next_label);
        self.next_label += 1;
        id
    }

    /// A fresh trace-scoped virtual register of `byte_width` bytes.
    pub fn alloc_virtual_register(&mut self, byte_width: usize) -> VirtualRegister {
        let num = self.next_vr;
        self.next_vr += 1;
        let mut reg = VirtualRegister::virtual_reg(num, byte_width);
        reg.kind = RegKind::GenericVirtual;
        reg
    }
}
