//! The translator: decode, mangle, allocate, encode, patch.
//!
//! `translate_meta` is the single entry point. It consults the index,
//! builds and instruments a trace, and drives the pipeline:
//!
//! 1.  materialize blocks until no requests remain;
//! 2.  late-mangle every decoded block;
//! 3.  expand indirect terminators into in-edge code;
//! 4.  allocate registers and rewrite spill slots;
//! 5.  create direct-edge stubs for unresolved successors;
//! 6.  stage-encode to size the cache allocation;
//! 7.  re-stage at the allocated addresses, fixing labels;
//! 8.  commit-encode under a cache transaction;
//! 9.  wire edge patch pointers;
//! 10. record cache addresses in metadata and index the entry block.

use crate::arch::encode::{EncodeKind, InstructionEncoder, TargetResolver};
use crate::arch::inst::{Annotation, InstFlags, Stmt};
use crate::arch::late_mangle::{self, LateMangleEnv};
use crate::arch::operand::{BranchTarget, LabelId, OperandKind};
use crate::arch::edge as arch_edge;
use crate::cfg::{Block, BlockFactory, BlockId, Trace};
use crate::context::Context;
use crate::metadata::{CacheMetaData, Meta, UnificationStatus};
use crate::CachePc;
use log::{debug, trace};
use std::collections::HashMap;
use thiserror::Error;

/// Whether the stack at a translation entry behaves like a call stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetStackValidity {
    Valid,
    Unknown,
}

/// Failures a caller can observe. Everything else in the pipeline is an
/// invariant violation and aborts.
#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("nothing decodable at {0:#x}")]
    Undecodable(usize),
}

pub type TranslateResult<T> = Result<T, TranslateError>;

/// Drives tool instrumentation over a trace. Tools are out of scope
/// here, so instrumenting means materializing blocks until the trace is
/// closed.
pub struct BinaryInstrumenter<'env> {
    factory: BlockFactory<'env>,
}

impl<'env> BinaryInstrumenter<'env> {
    pub fn new(ctx: &'env Context) -> Self {
        Self {
            factory: BlockFactory::new(ctx),
        }
    }

    /// Instrument a trace rooted at a direct translation request.
    pub fn instrument_direct(&mut self, trace: &mut Trace, meta: Meta) -> BlockId {
        let entry = self.factory.materialize_initial_block(trace, meta);
        while self.factory.materialize_requests(trace) {}
        entry
    }
}

/// Translate the block `meta` describes. Idempotent: a second request
/// for equal metadata returns the indexed translation without touching
/// the block arena.
pub fn translate_meta(ctx: &Context, meta: Meta) -> CachePc {
    let response = ctx.index.request(&meta);
    if response.status == UnificationStatus::Accept {
        if let Some(found) = response.meta {
            let pc = found.get::<CacheMetaData>().start_pc;
            if pc != 0 {
                trace!("translation served from the index: {pc:#x}");
                return pc;
            }
        }
    }

    let mut trace = Trace::new();
    let mut instrumenter = BinaryInstrumenter::new(ctx);
    let entry = instrumenter.instrument_direct(&mut trace, meta);
    let entry_pc = compile(ctx, &mut trace, entry);

    // Publish the entry block for future requests.
    if let Some(block) = trace.block(entry).as_decoded() {
        let entry_meta = block.meta.clone();
        if ctx.index.request(&entry_meta).status != UnificationStatus::Accept {
            ctx.index.insert(entry_meta);
        }
    }
    entry_pc
}

struct TranslationEnv<'a> {
    ctx: &'a Context,
}

impl LateMangleEnv for TranslationEnv<'_> {
    fn is_reachable(&self, target: usize) -> bool {
        self.ctx.is_reachable(target)
    }

    fn alloc_native_address(&mut self, value: usize) -> usize {
        self.ctx.data.alloc_cell(value as u64)
    }
}

struct TraceResolver {
    labels: HashMap<LabelId, CachePc>,
    blocks: HashMap<BlockId, CachePc>,
}

impl TargetResolver for TraceResolver {
    fn label_pc(&self, label: LabelId) -> Option<CachePc> {
        self.labels.get(&label).copied()
    }

    fn block_pc(&self, block: BlockId) -> Option<CachePc> {
        self.blocks.get(&block).copied()
    }
}

/// Compile a closed trace into the code cache; returns the entry
/// block's cache pc.
pub fn compile(ctx: &Context, trace: &mut Trace, entry: BlockId) -> CachePc {
    let mut env = TranslationEnv { ctx };

    // Late mangling.
    for id in trace.ids().collect::<Vec<_>>() {
        late_mangle::mangle_block(trace, id, &mut env);
    }

    // Indirect terminators become in-edge code, while their scratch
    // registers can still be allocated.
    expand_indirect_edges(ctx, trace);

    // Register allocation and spill slots, per block.
    for id in trace.ids().collect::<Vec<_>>() {
        let Some(block) = trace.block_mut(id).as_decoded_mut() else {
            continue;
        };
        let allocation = crate::code::alloc::allocate_block(block);
        crate::code::slots::allocate_slots(block, allocation.num_slots);
    }

    // Direct-edge stubs for every unresolved direct successor.
    let direct_edges = build_direct_edges(ctx, trace);

    // Stage once to learn the total size.
    let mut resolver = TraceResolver {
        labels: HashMap::new(),
        blocks: HashMap::new(),
    };
    let staged = InstructionEncoder::new(EncodeKind::Staged);
    let mut total = 0usize;
    for id in trace.ids().collect::<Vec<_>>() {
        let Some(block) = trace.block_mut(id).as_decoded_mut() else {
            continue;
        };
        let mut pc = ctx.block_cache.base();
        let start = pc;
        for stmt in &mut block.stmts {
            if let Stmt::Native(inst) = stmt {
                staged.encode_next(inst, &mut pc, &resolver);
            }
        }
        block.encoded_size = pc - start;
        total += block.encoded_size;
    }
    assert!(total > 0, "empty trace");

    // Allocate, then stage again at the real addresses so labels and
    // rip-relative operands are exact.
    let base = ctx.block_cache.allocate_block(total);
    debug!("trace of {total} bytes at {base:#x}");
    let mut pc = base;
    for id in trace.ids().collect::<Vec<_>>() {
        // Blocks that produce no bytes resolve to other addresses.
        let block_pc = match trace.block(id) {
            Block::Decoded(_) | Block::Compensation(_) => None,
            Block::Native { target } => Some(*target),
            Block::Cached { start_pc, .. } => Some(*start_pc),
            Block::Direct { .. } => direct_edges.get(&id).map(|(stub, _)| *stub),
            _ => None,
        };
        if let Some(block_pc) = block_pc {
            resolver.blocks.insert(id, block_pc);
            continue;
        }
        let Some(block) = trace.block_mut(id).as_decoded_mut() else {
            continue;
        };
        block.encoded_pc = Some(pc);
        resolver.blocks.insert(id, pc);
        for stmt in &mut block.stmts {
            match stmt {
                Stmt::Native(inst) => staged.encode_next(inst, &mut pc, &resolver),
                Stmt::Label(label) => {
                    resolver.labels.insert(*label, pc);
                }
                Stmt::Annot(_) => {}
            }
        }
    }
    assert_eq!(pc - base, total, "staging drifted between passes");

    // Commit under a write transaction on the fresh range.
    {
        let _tx = ctx.block_cache.begin_transaction(base, base + total);
        let commit = InstructionEncoder::new(EncodeKind::Commit);
        let mut pc = base;
        for id in trace.ids().collect::<Vec<_>>() {
            let Some(block) = trace.block_mut(id).as_decoded_mut() else {
                continue;
            };
            for stmt in &mut block.stmts {
                match stmt {
                    Stmt::Native(inst) => {
                        let at = pc;
                        commit.encode_next(inst, &mut pc, &resolver);
                        debug_assert_eq!(
                            at + usize::from(inst.encoded_length),
                            pc,
                            "encoding must be contiguous"
                        );
                    }
                    Stmt::Label(label) => {
                        debug_assert_eq!(resolver.labels[label], pc);
                    }
                    Stmt::Annot(Annotation::UpdateEncodedAddress(sink)) => {
                        let cell =
                            unsafe { &*(sink.0 as *const std::sync::atomic::AtomicUsize) };
                        cell.store(pc, std::sync::atomic::Ordering::Release);
                    }
                    Stmt::Annot(_) => {}
                }
            }
        }
    }

    // Wire each direct edge's patch pointer to the branch that uses it.
    for (&id, &(_, edge)) in &direct_edges {
        let edge = unsafe { &*edge };
        'outer: for bid in trace.ids().collect::<Vec<_>>() {
            let Some(block) = trace.block(bid).as_decoded() else {
                continue;
            };
            for stmt in &block.stmts {
                let Some(inst) = stmt.native() else { continue };
                if let Some(op) = inst.ops.first() {
                    if let OperandKind::Branch(BranchTarget::Block(b)) = op.kind {
                        if b == id {
                            if let Some(at) = inst.encoded_pc {
                                edge.patch_instruction
                                    .store(at, std::sync::atomic::Ordering::Release);
                            }
                            break 'outer;
                        }
                    }
                }
            }
        }
    }

    // Record where every block landed.
    for id in trace.ids().collect::<Vec<_>>() {
        let Some(block) = trace.block_mut(id).as_decoded_mut() else {
            continue;
        };
        let encoded = block.encoded_pc.expect("decoded block was encoded");
        block.meta.get_mut::<CacheMetaData>().start_pc = encoded;
    }

    resolver.blocks[&entry]
}

/// Replace each indirect terminator with in-edge code bound to a fresh
/// `IndirectEdge`.
fn expand_indirect_edges(ctx: &Context, trace: &mut Trace) {
    let ids: Vec<BlockId> = trace.ids().collect();
    for id in ids {
        let out_block = match trace.block(id).as_decoded() {
            Some(block) => block.out_block,
            None => continue,
        };
        let Some(out_id) = out_block else { continue };
        let meta_template = match trace.block(out_id) {
            Block::Indirect { meta_template } => meta_template.clone(),
            _ => continue,
        };
        let Some(block) = trace.block_mut(id).as_decoded_mut() else {
            continue;
        };
        // The terminator is the indirect jump the early mangler left
        // with a register target.
        let Some(Stmt::Native(jmp)) = block.stmts.pop() else {
            panic!("indirect block without a terminator");
        };
        assert!(
            jmp.ops.first().map(|op| op.is_register()).unwrap_or(false),
            "indirect terminator target must be a register: {jmp:?}"
        );
        let target = jmp.ops[0].register();
        let is_call_like = jmp.flags.contains(InstFlags::IS_TAIL_CALL);
        let shifts_redzone = crate::REDZONE_SIZE != 0 && !is_call_like;
        let edge = ctx.allocate_indirect_edge(meta_template, shifts_redzone);
        arch_edge::emit_indirect_in_edge(
            &mut block.stmts,
            edge,
            target,
            ctx.indirect_edge_entry(),
        );
    }
}

/// Create stubs for every referenced, unmaterialized direct block.
fn build_direct_edges(
    ctx: &Context,
    trace: &mut Trace,
) -> HashMap<BlockId, (CachePc, *const crate::edge::DirectEdge)> {
    let mut referenced: Vec<BlockId> = Vec::new();
    for id in trace.ids() {
        let Some(block) = trace.block(id).as_decoded() else {
            continue;
        };
        for succ in block.successors() {
            if matches!(trace.block(succ), Block::Direct { .. }) && !referenced.contains(&succ) {
                referenced.push(succ);
            }
        }
    }

    let mut edges = HashMap::new();
    for id in referenced {
        let (meta, stack_valid) = match trace.block(id) {
            Block::Direct { meta, .. } => (
                meta.clone(),
                meta.get::<crate::metadata::StackMetaData>().is_stack_valid(),
            ),
            _ => continue,
        };
        let edge = ctx.allocate_direct_edge(meta);
        let code = ctx
            .edge_cache
            .allocate_block(arch_edge::DIRECT_EDGE_CODE_SIZE);
        let _tx = ctx
            .edge_cache
            .begin_transaction(code, code + arch_edge::DIRECT_EDGE_CODE_SIZE);
        arch_edge::generate_direct_edge_code(edge, ctx.direct_edge_entry(), code, stack_valid);
        trace!("direct edge stub at {code:#x}");
        edges.insert(id, (code, edge as *const _));
    }
    edges
}
