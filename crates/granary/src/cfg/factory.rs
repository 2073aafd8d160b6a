//! Block materialization.
//!
//! The factory decodes blocks into a trace and services materialization
//! requests against `Direct` successors. Requests carry a strategy; when
//! strategies conflict, the finer one (greater in the [`Request`] order)
//! wins. A materialization round first tries an existing trace block,
//! then the code cache index, then decodes fresh.

use super::block::{Block, BlockId, DecodedBlock, Request};
use super::trace::Trace;
use crate::arch::builder;
use crate::arch::decode::InstructionDecoder;
use crate::arch::early_mangle::EarlyMangler;
use crate::arch::inst::{IClass, Inst, InstFlags, Stmt};
use crate::arch::operand::BranchTarget;
use crate::index::IndexFindResponse;
use crate::metadata::{AppMetaData, CacheMetaData, Meta, StackMetaData, UnificationStatus};
use crate::AppPc;
use log::{debug, trace};

/// Longest run of instructions one block will hold.
const MAX_BLOCK_INSTRUCTIONS: usize = 256;

/// What the factory needs from its surroundings.
pub trait FactoryEnv {
    /// A fresh metadata record whose `AppMetaData` names `app_pc`.
    fn allocate_meta(&self, app_pc: AppPc) -> Meta;

    /// Query the code cache index.
    fn index_request(&self, meta: &Meta) -> IndexFindResponse;
}

/// Decodes and materializes blocks for one trace.
pub struct BlockFactory<'env> {
    env: &'env dyn FactoryEnv,
    decoder: InstructionDecoder,
    mangler: EarlyMangler,
}

impl<'env> BlockFactory<'env> {
    pub fn new(env: &'env dyn FactoryEnv) -> Self {
        Self {
            env,
            decoder: InstructionDecoder::new(),
            mangler: EarlyMangler::new(),
        }
    }

    /// Record a materialization request against a direct block. Finer
    /// strategies win over coarser ones.
    pub fn request_block(&mut self, trace: &mut Trace, id: BlockId, strategy: Request) {
        if let Block::Direct { request, .. } = trace.block_mut(id) {
            *request = (*request).max(strategy);
        }
    }

    /// Decode the trace's entry block for `meta`.
    pub fn materialize_initial_block(&mut self, trace: &mut Trace, meta: Meta) -> BlockId {
        let app_pc = meta.get::<AppMetaData>().start_pc;
        let block = self.decode_block(trace, app_pc, meta);
        let id = trace.add_block(Block::Decoded(block));
        trace.set_entry(id);
        id
    }

    /// Run one materialization round over all direct blocks. Returns
    /// true if anything was decoded, in which case new requests may
    /// exist and another round is warranted.
    pub fn materialize_requests(&mut self, trace: &mut Trace) -> bool {
        let mut progressed = false;
        let mut next = 0u32;
        while (next as usize) < trace.num_blocks() {
            let id = BlockId(next);
            next += 1;
            let (target, meta, request) = match trace.block(id) {
                Block::Direct {
                    target,
                    meta,
                    request,
                } if !matches!(request, Request::Later | Request::Denied) => {
                    (*target, meta.clone(), *request)
                }
                _ => continue,
            };
            progressed |= self.materialize_direct(trace, id, target, meta, request);
        }
        progressed
    }

    fn materialize_direct(
        &mut self,
        trace: &mut Trace,
        id: BlockId,
        target: AppPc,
        meta: Meta,
        request: Request,
    ) -> bool {
        debug!("materialize {target:#x} with {request:?}");
        if request == Request::Native {
            *trace.block_mut(id) = Block::Native { target };
            return false;
        }

        // Prefer a block already decoded into this trace.
        if matches!(request, Request::CheckTrace | Request::CheckIndexAndTrace) {
            if let Some(found) = trace.find_decoded(target) {
                redirect(trace, id, found);
                return false;
            }
        }

        // Then ask the index.
        if request == Request::CheckIndexAndTrace {
            let response = self.env.index_request(&meta);
            match response.status {
                UnificationStatus::Accept => {
                    let found = response.meta.expect("accept carries a record");
                    let start_pc = found.get::<CacheMetaData>().start_pc;
                    if start_pc != 0 {
                        *trace.block_mut(id) = Block::Cached {
                            app_pc: target,
                            start_pc,
                            meta: found,
                        };
                        return false;
                    }
                }
                UnificationStatus::Adapt => {
                    // Splice in a compensation block that jumps onward
                    // under the adapted metadata; the next round finds
                    // an exact match for it.
                    let adapted = response.meta.expect("adapt carries a record");
                    let fresh = trace.add_block(Block::Direct {
                        target,
                        meta: adapted.clone(),
                        request: Request::CheckIndexAndTrace,
                    });
                    let mut comp = DecodedBlock::new(target, adapted);
                    comp.stmts
                        .push(Stmt::Native(builder::jmp(BranchTarget::Block(fresh))));
                    *trace.block_mut(id) = Block::Compensation(comp);
                    return true;
                }
                UnificationStatus::Reject => {}
            }
        }

        // Decode fresh.
        let block = self.decode_block(trace, target, meta);
        *trace.block_mut(id) = Block::Decoded(block);
        true
    }

    /// Decode a run of instructions starting at `app_pc`, early-mangling
    /// each, and wire up successor blocks for the terminator.
    fn decode_block(&mut self, trace: &mut Trace, app_pc: AppPc, meta: Meta) -> DecodedBlock {
        trace!("decode block at {app_pc:#x}");
        let stack_is_valid = meta.get::<StackMetaData>().is_stack_valid();
        let mut block = DecodedBlock::new(app_pc, meta);
        let mut pc = app_pc;

        for _ in 0..MAX_BLOCK_INSTRUCTIONS {
            let Some((inst, next_pc)) = self.decoder.decode(pc) else {
                // Undecodable bytes: hand control back to native code.
                block
                    .stmts
                    .push(Stmt::Native(builder::jmp_rel(pc)));
                let native = trace.add_block(Block::Native { target: pc });
                block.out_block = Some(native);
                return block;
            };

            let Some(next_pc) = next_pc else {
                // UD2, HLT and friends: translation stops here; the
                // instruction itself still runs.
                self.mangler.mangle(&mut block.stmts, inst);
                return block;
            };

            if inst.is_cti() {
                self.terminate_block(trace, &mut block, inst, next_pc, stack_is_valid);
                return block;
            }

            self.mangler.mangle(&mut block.stmts, inst);
            pc = next_pc;
        }

        // Ran off the end of the budget: synthesize a jump to the rest.
        let rest = self.direct_successor(trace, pc, stack_is_valid);
        block
            .stmts
            .push(Stmt::Native(builder::jmp(BranchTarget::Block(rest))));
        block
    }

    /// Create a `Direct` successor block for `target`.
    fn direct_successor(&self, trace: &mut Trace, target: AppPc, stack_valid: bool) -> BlockId {
        let mut meta = self.env.allocate_meta(target);
        if stack_valid {
            meta.get_mut::<StackMetaData>().mark_stack_as_valid();
        }
        trace.add_block(Block::Direct {
            target,
            meta,
            request: Request::Later,
        })
    }

    /// Handle a block-terminating control-flow instruction.
    fn terminate_block(
        &mut self,
        trace: &mut Trace,
        block: &mut DecodedBlock,
        inst: Inst,
        next_pc: AppPc,
        stack_valid: bool,
    ) {
        use IClass::*;
        match inst.iclass {
            Ret => {
                block.stmts.push(Stmt::Native(inst));
                let ret = trace.add_block(Block::Return { uses_meta: false });
                block.out_block = Some(ret);
            }
            RetFar | Iret => {
                // Execute natively; control leaves our supervision.
                block.stmts.push(Stmt::Native(inst));
            }
            Jmp => {
                if let Some(target) = inst.branch_target_pc() {
                    let succ = self.direct_successor(trace, target, stack_valid);
                    let mut inst = inst;
                    inst.ops[0] = crate::arch::operand::Operand::branch_block(succ);
                    block.stmts.push(Stmt::Native(inst));
                } else {
                    // Indirect jump: the early mangler moves the target
                    // into a virtual register.
                    self.mangler.mangle(&mut block.stmts, inst);
                    let succ = self.indirect_successor(trace, stack_valid, false);
                    block.out_block = Some(succ);
                }
            }
            Call => {
                // Calls are emulated: push the native return address so
                // returns stay transparent, then jump to the callee.
                push_return_address(block, next_pc);
                if let Some(target) = inst.branch_target_pc() {
                    let succ = self.direct_successor(trace, target, true);
                    let mut jmp = builder::jmp(BranchTarget::Block(succ));
                    jmp.decoded_pc = inst.decoded_pc;
                    jmp.flags.insert(InstFlags::IS_TAIL_CALL);
                    block.stmts.push(Stmt::Native(jmp));
                } else {
                    let mut inst = inst;
                    inst.iclass = Jmp;
                    inst.category = crate::arch::inst::Category::UncondBr;
                    inst.flags.insert(InstFlags::IS_TAIL_CALL);
                    self.mangler.mangle(&mut block.stmts, inst);
                    let succ = self.indirect_successor(trace, stack_valid, true);
                    block.out_block = Some(succ);
                }
            }
            CallFar | JmpFar => {
                // Far control flow executes natively on its original
                // bytes.
                self.mangler.mangle(&mut block.stmts, inst);
            }
            Jcc(_) | Jrcxz | Jecxz | Loop | Loope | Loopne => {
                let target = inst
                    .branch_target_pc()
                    .expect("conditional branches are direct");
                let taken = self.direct_successor(trace, target, stack_valid);
                let mut inst = inst;
                inst.ops[0] = crate::arch::operand::Operand::branch_block(taken);
                block.stmts.push(Stmt::Native(inst));
                let fall = self.direct_successor(trace, next_pc, stack_valid);
                block
                    .stmts
                    .push(Stmt::Native(builder::jmp(BranchTarget::Block(fall))));
            }
            _ => unreachable!("not a block terminator: {inst:?}"),
        }
    }

    fn indirect_successor(&self, trace: &mut Trace, stack_valid: bool, is_call: bool) -> BlockId {
        let mut template = self.env.allocate_meta(0);
        if stack_valid || is_call {
            template.get_mut::<StackMetaData>().mark_stack_as_valid();
        }
        trace.add_block(Block::Indirect {
            meta_template: template,
        })
    }

}

/// Scratch register number for wide return addresses, kept out of the
/// manglers' per-instruction pool.
const RET_ADDR_VR: u16 = 15;

/// Push the native return address of an emulated call.
fn push_return_address(block: &mut DecodedBlock, ret: AppPc) {
    if let Ok(ret32) = i32::try_from(ret as i64) {
        let mut push = builder::push_imm(ret32);
        push.effective_operand_width = crate::arch::ADDRESS_WIDTH_BITS;
        block.stmts.push(Stmt::Native(push));
    } else {
        let vr = crate::arch::VirtualRegister::virtual_reg(RET_ADDR_VR, 8);
        block
            .stmts
            .push(Stmt::Native(builder::mov_r_imm(vr, ret as u64)));
        let mut push = builder::push_r(vr);
        push.effective_operand_width = crate::arch::ADDRESS_WIDTH_BITS;
        block.stmts.push(Stmt::Native(push));
    }
}

/// Rewrite every reference to `from` so it points at `to`.
fn redirect(trace: &mut Trace, from: BlockId, to: BlockId) {
    for id in trace.ids().collect::<Vec<_>>() {
        let Some(block) = trace.block_mut(id).as_decoded_mut() else {
            continue;
        };
        for stmt in &mut block.stmts {
            let Some(inst) = stmt.native_mut() else {
                continue;
            };
            if let Some(op) = inst.ops.first_mut() {
                if let crate::arch::operand::OperandKind::Branch(BranchTarget::Block(b)) = op.kind {
                    if b == from {
                        *op = crate::arch::operand::Operand::branch_block(to);
                    }
                }
            }
        }
        if block.out_block == Some(from) {
            block.out_block = Some(to);
        }
    }
    // The forwarded block no longer materializes.
    if let Block::Direct { request, .. } = trace.block_mut(from) {
        *request = Request::Denied;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{standard_manager, MetaDataManager};
    use std::sync::Arc;

    struct TestEnv {
        mgr: Arc<MetaDataManager>,
    }

    impl FactoryEnv for TestEnv {
        fn allocate_meta(&self, app_pc: AppPc) -> Meta {
            let mut meta = Meta::allocate(&self.mgr);
            meta.get_mut::<AppMetaData>().start_pc = app_pc;
            meta
        }

        fn index_request(&self, _meta: &Meta) -> IndexFindResponse {
            IndexFindResponse {
                status: UnificationStatus::Reject,
                meta: None,
            }
        }
    }

    fn env() -> TestEnv {
        TestEnv {
            mgr: standard_manager(),
        }
    }

    fn entry_block(env: &TestEnv, code: &[u8]) -> (Trace, BlockId) {
        let mut trace = Trace::new();
        let mut factory = BlockFactory::new(env);
        let meta = env.allocate_meta(code.as_ptr() as usize);
        let id = factory.materialize_initial_block(&mut trace, meta);
        (trace, id)
    }

    #[test]
    fn straight_line_code_ends_with_a_return_block() {
        let env = env();
        // mov eax, 7; ret
        let code = [0xb8, 0x07, 0x00, 0x00, 0x00, 0xc3];
        let (trace, id) = entry_block(&env, &code);
        let block = trace.block(id).as_decoded().unwrap();
        assert!(block.out_block.is_some());
        assert!(matches!(
            trace.block(block.out_block.unwrap()),
            Block::Return { .. }
        ));
    }

    #[test]
    fn conditional_branch_gets_two_direct_successors() {
        let env = env();
        // jz +2; ret ; (target) ret
        let code = [0x74, 0x01, 0xc3, 0xc3];
        let (trace, id) = entry_block(&env, &code);
        let block = trace.block(id).as_decoded().unwrap();
        let succs: Vec<_> = block.successors().collect();
        assert_eq!(succs.len(), 2);
        for s in succs {
            assert!(matches!(trace.block(s), Block::Direct { .. }));
        }
    }

    #[test]
    fn direct_call_pushes_native_return_address() {
        let env = env();
        // call +0 (to next instruction); ret
        let code = [0xe8, 0x00, 0x00, 0x00, 0x00, 0xc3];
        let (trace, id) = entry_block(&env, &code);
        let block = trace.block(id).as_decoded().unwrap();
        let insts: Vec<_> = block.stmts.iter().filter_map(|s| s.native()).collect();
        let ret_addr = code.as_ptr() as usize + 5;
        // The return address materializes either as a push immediate or
        // through a scratch register, depending on reachability.
        let materialized = insts.iter().any(|inst| {
            inst.ops
                .iter()
                .any(|op| op.is_immediate() && op.immediate() == ret_addr as i64)
        });
        assert!(materialized, "return address not pushed");
        let last = insts.last().unwrap();
        assert_eq!(last.iclass, IClass::Jmp);
        assert!(last.flags.contains(InstFlags::IS_TAIL_CALL));
    }

    #[test]
    fn later_requests_do_not_materialize() {
        let env = env();
        let code = [0xeb, 0x00, 0xc3]; // jmp +0; ret
        let (mut trace, _) = entry_block(&env, &code);
        let mut factory = BlockFactory::new(&env);
        assert!(!factory.materialize_requests(&mut trace));
    }

    #[test]
    fn now_requests_decode_in_place() {
        let env = env();
        let code = [0xeb, 0x00, 0xc3]; // jmp +0; (target) ret
        let (mut trace, id) = entry_block(&env, &code);
        let succ = {
            let block = trace.block(id).as_decoded().unwrap();
            block.successors().next().unwrap()
        };
        let mut factory = BlockFactory::new(&env);
        factory.request_block(&mut trace, succ, Request::Now);
        assert!(factory.materialize_requests(&mut trace));
        assert!(trace.block(succ).as_decoded().is_some());
    }

    #[test]
    fn check_trace_reuses_an_existing_block() {
        let env = env();
        // Entry: jmp back to itself.
        let code = [0xeb, 0xfe];
        let (mut trace, id) = entry_block(&env, &code);
        let succ = {
            let block = trace.block(id).as_decoded().unwrap();
            block.successors().next().unwrap()
        };
        let mut factory = BlockFactory::new(&env);
        factory.request_block(&mut trace, succ, Request::CheckTrace);
        factory.materialize_requests(&mut trace);
        // The self-loop now targets the entry block itself.
        let block = trace.block(id).as_decoded().unwrap();
        assert_eq!(block.successors().next(), Some(id));
    }
}
