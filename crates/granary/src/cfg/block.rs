//! Blocks of a trace.

use crate::arch::inst::Stmt;
use crate::arch::operand::{BranchTarget, OperandKind};
use crate::metadata::Meta;
use crate::{AppPc, CachePc};

/// Identifies a block within its trace. Blocks refer to one another by
/// id, never by pointer; the trace's arena owns them all.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockId(pub u32);

/// How a direct block wants to be materialized. The order is strictness:
/// when two requests conflict the finer (greater) one wins.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Request {
    /// Leave it unmaterialized; it becomes an edge stub.
    #[default]
    Later,
    /// Use the index or an existing trace block before decoding.
    CheckIndexAndTrace,
    /// Use an existing trace block before decoding.
    CheckTrace,
    /// Decode it now regardless.
    Now,
    /// Materialize to the native target.
    Native,
    /// No materialization may happen.
    Denied,
}

/// A block whose instructions have been decoded into the trace.
pub struct DecodedBlock {
    pub app_pc: AppPc,
    pub meta: Meta,
    pub stmts: Vec<Stmt>,
    /// Successor that is not named by a branch operand: the indirect or
    /// return block the terminator transfers to.
    pub out_block: Option<BlockId>,
    /// Filled in during encoding.
    pub encoded_pc: Option<CachePc>,
    pub encoded_size: usize,
}

impl DecodedBlock {
    pub fn new(app_pc: AppPc, meta: Meta) -> Self {
        Self {
            app_pc,
            meta,
            stmts: Vec::new(),
            out_block: None,
            encoded_pc: None,
            encoded_size: 0,
        }
    }

    /// Ids of the blocks this block's branches reference.
    pub fn successors(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.stmts.iter().filter_map(|stmt| {
            let inst = stmt.native()?;
            match inst.ops.first()?.kind {
                OperandKind::Branch(BranchTarget::Block(id)) => Some(id),
                _ => None,
            }
        })
    }
}

/// A node of the trace.
pub enum Block {
    /// Instructions decoded and owned by this trace.
    Decoded(DecodedBlock),
    /// Already translated; `start_pc` points into the code cache.
    Cached {
        app_pc: AppPc,
        start_pc: CachePc,
        meta: Meta,
    },
    /// A direct target not yet materialized.
    Direct {
        target: AppPc,
        meta: Meta,
        request: Request,
    },
    /// An indirect target known only at run time.
    Indirect { meta_template: Meta },
    /// A function-return target.
    Return { uses_meta: bool },
    /// Execution continues in native code.
    Native { target: AppPc },
    /// A synthetic block splicing a metadata adaptation into control
    /// flow: it jumps directly on to `target` under adapted metadata.
    Compensation(DecodedBlock),
}

impl Block {
    pub fn app_pc(&self) -> Option<AppPc> {
        match self {
            Block::Decoded(b) | Block::Compensation(b) => Some(b.app_pc),
            Block::Cached { app_pc, .. } => Some(*app_pc),
            Block::Direct { target, .. } | Block::Native { target } => Some(*target),
            _ => None,
        }
    }

    pub fn as_decoded(&self) -> Option<&DecodedBlock> {
        match self {
            Block::Decoded(b) | Block::Compensation(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_decoded_mut(&mut self) -> Option<&mut DecodedBlock> {
        match self {
            Block::Decoded(b) | Block::Compensation(b) => Some(b),
            _ => None,
        }
    }
}
