//! Encoding the IR back into machine code.
//!
//! Encoding runs in two passes. The *staged* pass computes every
//! instruction's length and assigns encoded pcs without writing memory;
//! the *commit* pass writes bytes and demands that every branch target
//! resolve and reach. A third mode commits at most eight bytes with a
//! single fenced store, for patching an instruction out from under
//! concurrent execution.
//!
//! Decoded instructions that were never rewritten emit on their original
//! bytes. Rewritten ones keep their prefixes and opcode but regenerate
//! the ModR/M, SIB and displacement fields from the current operands.
//! Synthesized instructions are emitted from a small fixed opcode table.

use super::inst::{IClass, Inst, InstFlags};
use super::layout::{Field, InstLayout, RawEncoding};
use super::operand::{BranchTarget, LabelId, Operand, OperandKind, SegmentReg};
use super::reg::VirtualRegister;
use super::{is_near, MAX_INSTRUCTION_BYTES};
use crate::cfg::BlockId;
use crate::CachePc;
use granary_asm::{
    emit_modrm_reg, emit_modrm_rip_disp, emit_modrm_sib_disp, CodeSink, CountingSink, MemorySink,
    RexPrefix,
};
use std::sync::atomic::{fence, AtomicU64, Ordering};

/// How an encoding pass treats memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncodeKind {
    /// Compute lengths only; nothing is written.
    Staged,
    /// Write bytes; all targets must resolve and reach.
    Commit,
    /// Write at most eight bytes with a single fenced aligned store.
    CommitAtomic,
}

/// Resolves label and block branch targets to encoded addresses.
pub trait TargetResolver {
    fn label_pc(&self, label: LabelId) -> Option<CachePc>;
    fn block_pc(&self, block: BlockId) -> Option<CachePc>;
}

/// Resolver for instruction streams with no labels or block references.
pub struct NoTargets;

impl TargetResolver for NoTargets {
    fn label_pc(&self, _: LabelId) -> Option<CachePc> {
        None
    }
    fn block_pc(&self, _: BlockId) -> Option<CachePc> {
        None
    }
}

/// Encodes IR instructions at given cache addresses.
pub struct InstructionEncoder {
    kind: EncodeKind,
}

impl InstructionEncoder {
    pub fn new(kind: EncodeKind) -> Self {
        Self { kind }
    }

    /// Encode `inst` at `pc`, recording `encoded_pc`/`encoded_length` on
    /// the instruction. Returns the pc just past the instruction.
    pub fn encode(&self, inst: &mut Inst, pc: CachePc, resolver: &dyn TargetResolver) -> CachePc {
        if !inst.will_be_encoded() {
            inst.encoded_pc = Some(pc);
            inst.encoded_length = 0;
            return pc;
        }
        inst.encoded_pc = Some(pc);

        let committing = self.kind != EncodeKind::Staged;
        if committing {
            assert!(inst.encoded_length > 0, "commit before staging: {inst:?}");
        }

        // Measure first. Every path's length is independent of the final
        // displacement values, so staging and commit always agree.
        let mut counter = CountingSink::new();
        emit(inst, pc, resolver, &mut counter, false);
        let len = counter.offset();
        assert!(len <= MAX_INSTRUCTION_BYTES, "overlong encoding: {inst:?}");
        if committing {
            assert_eq!(
                usize::from(inst.encoded_length),
                len,
                "length drifted between staging and commit: {inst:?}"
            );
        }
        inst.encoded_length = len as u8;

        match self.kind {
            EncodeKind::Staged => {}
            EncodeKind::Commit => {
                let mut sink = unsafe { MemorySink::new(pc as *mut u8) };
                emit(inst, pc, resolver, &mut sink, true);
            }
            EncodeKind::CommitAtomic => {
                let mut buf = Vec::with_capacity(16);
                emit(inst, pc, resolver, &mut buf, true);
                atomic_commit(pc, &buf);
            }
        }
        pc + len
    }

    /// Encode and advance `pc`.
    pub fn encode_next(&self, inst: &mut Inst, pc: &mut CachePc, resolver: &dyn TargetResolver) {
        *pc = self.encode(inst, *pc, resolver);
    }
}

/// Branch classes re-synthesized at their new location; every other
/// control transfer (far, system) emits on its original bytes.
fn synthesizable_cti(iclass: IClass) -> bool {
    use IClass::*;
    matches!(
        iclass,
        Call | Jmp | Jcc(_) | Jrcxz | Jecxz | Loop | Loope | Loopne | Ret
    )
}

fn emit(
    inst: &Inst,
    pc: CachePc,
    resolver: &dyn TargetResolver,
    sink: &mut impl CodeSink,
    strict: bool,
) {
    let Some(raw) = &inst.raw else {
        emit_synth(inst, pc, resolver, sink, strict);
        return;
    };
    if synthesizable_cti(inst.iclass) && inst.is_cti() {
        emit_synth(inst, pc, resolver, sink, strict);
        return;
    }
    let needs_rewrite = inst
        .flags
        .intersects(InstFlags::OPERANDS_MODIFIED | InstFlags::NEEDS_RELOCATION);
    if needs_rewrite {
        match raw.layout {
            Some(layout) => {
                emit_from_layout(inst, raw, &layout, pc, sink);
                return;
            }
            None => {
                assert!(
                    !inst.flags.contains(InstFlags::NEEDS_RELOCATION),
                    "unrelocatable pc-relative instruction: {inst:?}"
                );
                // Operands of unrewritable instructions stay sticky, so
                // the original bytes are still authoritative.
            }
        }
    }
    for &b in raw.bytes.iter() {
        sink.put1(b);
    }
}

/// Emit a synthesized (or re-targeted branch) instruction from the fixed
/// opcode table.
fn emit_synth(
    inst: &Inst,
    pc: CachePc,
    resolver: &dyn TargetResolver,
    sink: &mut impl CodeSink,
    strict: bool,
) {
    use IClass::*;
    match inst.iclass {
        Mov => emit_mov(inst, pc, sink),
        MovSeg => emit_mov_seg(inst, sink),
        Movzx => emit_movzx(inst, sink),
        Lea => emit_lea(inst, pc, sink),
        Push => emit_push(inst, pc, sink),
        Pop => emit_pop(inst, sink),
        Pushf => sink.put1(0x9c),
        Popf => sink.put1(0x9d),
        Call | Jmp => emit_call_jmp(inst, pc, resolver, sink, strict),
        Jcc(cond) => {
            let target = resolve(inst, resolver, strict);
            sink.put1(0x0f);
            sink.put1(0x80 + cond.code());
            let disp = branch_disp(target, pc, 6, strict);
            sink.put4(disp as u32);
        }
        Jrcxz | Jecxz | Loop | Loope | Loopne => {
            let opcode = match inst.iclass {
                Jrcxz | Jecxz => 0xe3,
                Loop => 0xe2,
                Loope => 0xe1,
                _ => 0xe0,
            };
            let mut len = 2;
            if inst.iclass == Jecxz {
                sink.put1(0x67);
                len = 3;
            }
            let target = resolve(inst, resolver, strict);
            let disp = branch_disp(target, pc, len, strict);
            if strict {
                assert!(
                    i8::try_from(disp).is_ok(),
                    "short branch target out of range: {inst:?}"
                );
            }
            sink.put1(opcode);
            sink.put1(disp as u8);
        }
        Ret => match inst.ops.first() {
            Some(op) if op.is_immediate() => {
                sink.put1(0xc2);
                sink.put2(op.immediate() as u16);
            }
            _ => sink.put1(0xc3),
        },
        Ud2 => {
            sink.put1(0x0f);
            sink.put1(0x0b);
        }
        Nop => sink.put1(0x90),
        Cli => sink.put1(0xfa),
        Sti => sink.put1(0xfb),
        Int3 => sink.put1(0xcc),
        Int => {
            sink.put1(0xcd);
            sink.put1(inst.ops[0].immediate() as u8);
        }
        Hlt => sink.put1(0xf4),
        Test => emit_test(inst, sink),
        Xchg => emit_xchg(inst, pc, sink),
        _ => unreachable!("cannot synthesize encoding for {inst:?}"),
    }
}

/// Replace up to eight bytes of live code with one aligned store,
/// bracketed by full fences.
fn atomic_commit(pc: CachePc, bytes: &[u8]) {
    assert!(bytes.len() <= 8, "atomic commit limited to 8 bytes");
    let aligned = pc & !7usize;
    let shift = pc - aligned;
    assert!(shift + bytes.len() <= 8, "atomic commit straddles qwords");
    let cell = unsafe { &*(aligned as *const AtomicU64) };
    let mut word = cell.load(Ordering::Relaxed).to_le_bytes();
    word[shift..shift + bytes.len()].copy_from_slice(bytes);
    fence(Ordering::SeqCst);
    cell.store(u64::from_le_bytes(word), Ordering::SeqCst);
    fence(Ordering::SeqCst);
}

fn resolve(inst: &Inst, resolver: &dyn TargetResolver, strict: bool) -> Option<usize> {
    let target = match inst.ops.first() {
        Some(op) if op.is_branch() => op.branch_target(),
        _ => return None,
    };
    let pc = match target {
        BranchTarget::Pc(pc) => Some(pc),
        BranchTarget::Label(l) => resolver.label_pc(l),
        BranchTarget::Block(b) => resolver.block_pc(b),
    };
    if strict {
        assert!(pc.is_some(), "unresolved branch target at commit: {inst:?}");
    }
    pc
}

fn branch_disp(target: Option<usize>, pc: CachePc, inst_len: usize, strict: bool) -> i32 {
    let Some(target) = target else {
        return 0;
    };
    let next = pc + inst_len;
    let disp64 = (target as i64).wrapping_sub(next as i64);
    let disp = disp64 as i32;
    if strict {
        assert_eq!(
            i64::from(disp),
            disp64,
            "branch target unreachable from {pc:#x}"
        );
    }
    disp
}

fn enc_of(reg: VirtualRegister) -> u8 {
    if reg.num_bytes == 1 {
        reg.hw_enc8()
    } else {
        reg.hw_enc()
    }
}

/// Emit prefix + opcode + ModR/M for a two-register form.
fn emit_rr(
    sink: &mut impl CodeSink,
    opcode: &[u8],
    width_bits: u16,
    reg_g: VirtualRegister,
    reg_e: VirtualRegister,
) {
    if width_bits == 16 {
        sink.put1(0x66);
    }
    let g = enc_of(reg_g);
    let e = enc_of(reg_e);
    let mut rex = if width_bits == 64 {
        RexPrefix::with_w()
    } else {
        RexPrefix::without_w()
    };
    rex = rex.reg(g).base(e);
    if width_bits == 8 {
        if !reg_g.is_legacy() {
            rex = rex.force_for_8bit(g);
        }
        if !reg_e.is_legacy() {
            rex = rex.force_for_8bit(e);
        }
    }
    rex.emit(sink);
    for &b in opcode {
        sink.put1(b);
    }
    emit_modrm_reg(sink, g, e);
}

/// The rm-side shapes an operand can lower to.
enum RmForm {
    Reg(u8),
    Mem {
        base: Option<u8>,
        index: Option<u8>,
        scale: u8,
        disp: i32,
    },
    Rip {
        target: usize,
    },
}

impl RmForm {
    /// Lower a memory-ish operand. `pc` decides rip-relative
    /// reachability.
    fn of(op: &Operand, pc: CachePc) -> Self {
        match op.kind {
            OperandKind::Register(r) if op.is_memory() => RmForm::Mem {
                base: Some(r.hw_enc()),
                index: None,
                scale: 1,
                disp: 0,
            },
            OperandKind::Register(r) => RmForm::Reg(enc_of(r)),
            OperandKind::Memory(m) => RmForm::Mem {
                base: m.base.is_valid().then(|| m.base.hw_enc()),
                index: m.index.is_valid().then(|| m.index.hw_enc()),
                scale: m.scale,
                disp: m.disp,
            },
            OperandKind::Pointer(addr) => {
                if op.segment == SegmentReg::None && is_near(pc, addr as usize) {
                    RmForm::Rip {
                        target: addr as usize,
                    }
                } else {
                    assert!(
                        i64::from(addr as i32) == addr as i64,
                        "absolute operand needs mangling: {addr:#x}"
                    );
                    RmForm::Mem {
                        base: None,
                        index: None,
                        scale: 1,
                        disp: addr as i32,
                    }
                }
            }
            _ => panic!("not an rm-encodable operand"),
        }
    }

    /// The REX extension bits (B, X) this form needs.
    fn bx_bits(&self) -> (u8, u8) {
        match self {
            RmForm::Reg(e) => ((e >> 3) & 1, 0),
            RmForm::Mem { base, index, .. } => (
                base.map(|b| (b >> 3) & 1).unwrap_or(0),
                index.map(|x| (x >> 3) & 1).unwrap_or(0),
            ),
            RmForm::Rip { .. } => (0, 0),
        }
    }

    /// Emit the ModR/M, SIB and displacement bytes. For rip-relative
    /// forms, `pc` and `imm_len` fix up the end-relative displacement.
    fn emit(&self, sink: &mut impl CodeSink, enc_g: u8, pc: CachePc, imm_len: usize) {
        match *self {
            RmForm::Reg(e) => emit_modrm_reg(sink, enc_g, e),
            RmForm::Mem {
                base,
                index,
                scale,
                disp,
            } => emit_modrm_sib_disp(sink, enc_g, base, index, scale, disp),
            RmForm::Rip { target } => {
                let end = pc + sink.offset() + 1 + 4 + imm_len;
                let disp = (target as i64).wrapping_sub(end as i64) as i32;
                emit_modrm_rip_disp(sink, enc_g, disp);
            }
        }
    }
}

/// Emit prefix + opcode + rm-side for a `reg/extension, mem` form.
#[allow(clippy::too_many_arguments)]
fn emit_rm(
    sink: &mut impl CodeSink,
    opcode: &[u8],
    width_bits: u16,
    enc_g: u8,
    g_is_byte_reg: bool,
    mem: &Operand,
    pc: CachePc,
    imm_len: usize,
    rex_w_override: Option<bool>,
) {
    if let Some(prefix) = mem.segment.prefix_byte() {
        sink.put1(prefix);
    }
    if width_bits == 16 {
        sink.put1(0x66);
    }
    let rex_w = rex_w_override.unwrap_or(width_bits == 64);
    let mut rex = if rex_w {
        RexPrefix::with_w()
    } else {
        RexPrefix::without_w()
    };
    rex = rex.reg(enc_g);
    if g_is_byte_reg {
        rex = rex.force_for_8bit(enc_g);
    }

    let rm = RmForm::of(mem, pc);
    let (b, x) = rm.bx_bits();
    if b != 0 {
        rex = rex.base(b << 3);
    }
    if x != 0 {
        rex = rex.index(x << 3);
    }
    rex.emit(sink);
    for &byte in opcode {
        sink.put1(byte);
    }
    rm.emit(sink, enc_g, pc, imm_len);
}

fn emit_mov(inst: &Inst, pc: CachePc, sink: &mut impl CodeSink) {
    let dst = &inst.ops[0];
    let src = &inst.ops[1];
    match (&dst.kind, &src.kind) {
        (OperandKind::Register(d), OperandKind::Register(s))
            if !dst.is_memory() && !src.is_memory() =>
        {
            let opcode: &[u8] = if d.num_bytes == 1 { &[0x88] } else { &[0x89] };
            emit_rr(sink, opcode, d.bit_width(), *s, *d);
        }
        (OperandKind::Register(d), OperandKind::Immediate(v)) if !dst.is_memory() => {
            emit_mov_r_imm(*d, *v, sink);
        }
        (OperandKind::Register(d), _) if !dst.is_memory() => {
            let d = *d;
            let opcode: &[u8] = if d.num_bytes == 1 { &[0x8a] } else { &[0x8b] };
            emit_rm(
                sink,
                opcode,
                d.bit_width(),
                enc_of(d),
                d.num_bytes == 1 && !d.is_legacy(),
                src,
                pc,
                0,
                None,
            );
        }
        (_, OperandKind::Register(s)) if !src.is_memory() => {
            let s = *s;
            let opcode: &[u8] = if s.num_bytes == 1 { &[0x88] } else { &[0x89] };
            emit_rm(
                sink,
                opcode,
                s.bit_width(),
                enc_of(s),
                s.num_bytes == 1 && !s.is_legacy(),
                dst,
                pc,
                0,
                None,
            );
        }
        (_, OperandKind::Immediate(v)) => {
            let width = dst.width.max(8);
            let (opcode, imm_len): (&[u8], usize) = match width {
                8 => (&[0xc6], 1),
                16 => (&[0xc7], 2),
                _ => (&[0xc7], 4),
            };
            emit_rm(sink, opcode, width, 0, false, dst, pc, imm_len, None);
            match imm_len {
                1 => sink.put1(*v as u8),
                2 => sink.put2(*v as u16),
                _ => sink.put4(*v as u32),
            }
        }
        _ => unreachable!("unsupported mov shape: {inst:?}"),
    }
}

fn emit_mov_r_imm(d: VirtualRegister, v: i64, sink: &mut impl CodeSink) {
    match d.num_bytes {
        8 => {
            if i32::try_from(v).is_ok() {
                // REX.W C7 /0 id, sign-extended.
                RexPrefix::with_w().base(d.hw_enc()).emit(sink);
                sink.put1(0xc7);
                emit_modrm_reg(sink, 0, d.hw_enc());
                sink.put4(v as u32);
            } else {
                RexPrefix::with_w().base(d.hw_enc()).emit(sink);
                sink.put1(0xb8 + (d.hw_enc() & 7));
                sink.put8(v as u64);
            }
        }
        4 => {
            RexPrefix::without_w().base(d.hw_enc()).emit(sink);
            sink.put1(0xb8 + (d.hw_enc() & 7));
            sink.put4(v as u32);
        }
        2 => {
            sink.put1(0x66);
            RexPrefix::without_w().base(d.hw_enc()).emit(sink);
            sink.put1(0xb8 + (d.hw_enc() & 7));
            sink.put2(v as u16);
        }
        _ => {
            let e = enc_of(d);
            let mut rex = RexPrefix::without_w().base(e);
            if !d.is_legacy() {
                rex = rex.force_for_8bit(e);
            }
            rex.emit(sink);
            sink.put1(0xb0 + (e & 7));
            sink.put1(v as u8);
        }
    }
}

fn emit_mov_seg(inst: &Inst, sink: &mut impl CodeSink) {
    use super::reg::ArchReg;
    let (seg, gpr, opcode) = if inst.ops[0].register().segment().is_some() {
        (inst.ops[0].register(), inst.ops[1].register(), 0x8eu8)
    } else {
        (inst.ops[1].register(), inst.ops[0].register(), 0x8cu8)
    };
    let seg_enc = match seg.segment() {
        Some(ArchReg::SegEs) => 0,
        Some(ArchReg::SegCs) => 1,
        Some(ArchReg::SegSs) => 2,
        Some(ArchReg::SegDs) => 3,
        Some(ArchReg::SegFs) => 4,
        Some(ArchReg::SegGs) => 5,
        _ => unreachable!("not a segment register"),
    };
    sink.put1(0x66);
    RexPrefix::without_w().base(gpr.hw_enc()).emit(sink);
    sink.put1(opcode);
    emit_modrm_reg(sink, seg_enc, gpr.hw_enc());
}

fn emit_movzx(inst: &Inst, sink: &mut impl CodeSink) {
    let dst = inst.ops[0].register();
    let src = inst.ops[1].register();
    let opcode: &[u8] = if src.num_bytes == 1 {
        &[0x0f, 0xb6]
    } else {
        &[0x0f, 0xb7]
    };
    emit_rr(sink, opcode, dst.bit_width(), dst, src);
}

fn emit_lea(inst: &Inst, pc: CachePc, sink: &mut impl CodeSink) {
    let dst = inst.ops[0].register();
    emit_rm(
        sink,
        &[0x8d],
        dst.bit_width(),
        dst.hw_enc(),
        false,
        &inst.ops[1],
        pc,
        0,
        None,
    );
}

fn emit_push(inst: &Inst, pc: CachePc, sink: &mut impl CodeSink) {
    let op = &inst.ops[0];
    match op.kind {
        OperandKind::Register(r) if !op.is_memory() => {
            RexPrefix::without_w().base(r.hw_enc()).emit(sink);
            sink.put1(0x50 + (r.hw_enc() & 7));
        }
        OperandKind::Immediate(v) => {
            sink.put1(0x68);
            sink.put4(v as u32);
        }
        _ => {
            // push [mem]: FF /6, 64-bit without REX.W.
            emit_rm(sink, &[0xff], 64, 6, false, op, pc, 0, Some(false));
        }
    }
}

fn emit_pop(inst: &Inst, sink: &mut impl CodeSink) {
    let r = inst.ops[0].register();
    RexPrefix::without_w().base(r.hw_enc()).emit(sink);
    sink.put1(0x58 + (r.hw_enc() & 7));
}

fn emit_call_jmp(
    inst: &Inst,
    pc: CachePc,
    resolver: &dyn TargetResolver,
    sink: &mut impl CodeSink,
    strict: bool,
) {
    let is_call = inst.iclass == IClass::Call;
    let op = &inst.ops[0];
    match op.kind {
        OperandKind::Branch(_) => {
            let target = resolve(inst, resolver, strict);
            sink.put1(if is_call { 0xe8 } else { 0xe9 });
            let disp = branch_disp(target, pc, 5, strict);
            sink.put4(disp as u32);
        }
        OperandKind::Register(r) if !op.is_memory() => {
            RexPrefix::without_w().base(r.hw_enc()).emit(sink);
            sink.put1(0xff);
            emit_modrm_reg(sink, if is_call { 2 } else { 4 }, r.hw_enc());
        }
        _ => {
            emit_rm(
                sink,
                &[0xff],
                64,
                if is_call { 2 } else { 4 },
                false,
                op,
                pc,
                0,
                Some(false),
            );
        }
    }
}

fn emit_test(inst: &Inst, sink: &mut impl CodeSink) {
    let a = inst.ops[0].register();
    let b = inst.ops[1].register();
    let opcode: &[u8] = if a.num_bytes == 1 { &[0x84] } else { &[0x85] };
    emit_rr(sink, opcode, a.bit_width(), b, a);
}

fn emit_xchg(inst: &Inst, pc: CachePc, sink: &mut impl CodeSink) {
    let (mem, reg) = if inst.ops[0].is_memory() {
        (&inst.ops[0], inst.ops[1].register())
    } else {
        (&inst.ops[1], inst.ops[0].register())
    };
    let opcode: &[u8] = if reg.num_bytes == 1 { &[0x86] } else { &[0x87] };
    emit_rm(
        sink,
        opcode,
        reg.bit_width(),
        enc_of(reg),
        reg.num_bytes == 1 && !reg.is_legacy(),
        mem,
        pc,
        0,
        None,
    );
}

/// Re-emit a decoded instruction whose operands were rewritten: original
/// prefixes and opcode, fresh ModR/M, SIB and displacement, original
/// immediate bytes.
fn emit_from_layout(
    inst: &Inst,
    raw: &RawEncoding,
    layout: &InstLayout,
    pc: CachePc,
    sink: &mut impl CodeSink,
) {
    let bytes = &raw.bytes;

    // Legacy prefixes, minus any segment override; the segment rides on
    // the operand now.
    let mut segment = SegmentReg::None;
    for op in &inst.ops {
        if op.is_memory() && op.segment != SegmentReg::None {
            segment = op.segment;
        }
    }
    for &b in &bytes[..usize::from(layout.legacy_prefix_len)] {
        if b == 0x64 || b == 0x65 {
            continue;
        }
        sink.put1(b);
    }
    if let Some(prefix) = segment.prefix_byte() {
        sink.put1(prefix);
    }

    // Reg-field encoding, rm-side operand, and any opcode-embedded
    // register, from the recorded fields.
    let orig_modrm = layout.modrm_byte(bytes);
    let mut enc_g = orig_modrm
        .map(|m| ((m >> 3) & 7) | (layout.rex_r(bytes) << 3))
        .unwrap_or(0);
    let mut rm_op: Option<&Operand> = None;
    let mut opcode_low3: Option<u8> = None;
    for (i, op) in inst.ops.iter().enumerate() {
        match raw.fields.get(i).copied().unwrap_or(Field::None) {
            Field::ModRmReg => enc_g = enc_of(op.register()),
            Field::ModRmRm => rm_op = Some(op),
            Field::OpcodeLow3 => opcode_low3 = Some(enc_of(op.register())),
            _ => {}
        }
    }

    let rm_form = rm_op.map(|op| RmForm::of(op, pc));
    let (b_bit, x_bit) = match (&rm_form, opcode_low3) {
        (Some(form), _) => form.bx_bits(),
        (None, Some(e)) => ((e >> 3) & 1, 0),
        // Nothing claims the rm side: keep the original extension bits
        // so a re-emitted ModR/M still names the same registers.
        (None, None) => (layout.rex_b(bytes), layout.rex_x(bytes)),
    };

    if let Some((vex_off, vex_len)) = layout.vex {
        emit_patched_vex(bytes, vex_off, vex_len, (enc_g >> 3) & 1, b_bit, x_bit, sink);
    } else {
        let rex_w = layout.rex.map(|r| r & 8 != 0).unwrap_or(false);
        let mut rex = if rex_w {
            RexPrefix::with_w()
        } else {
            RexPrefix::without_w()
        };
        rex = rex.reg(enc_g).base(b_bit << 3).index(x_bit << 3);
        // A bare REX (0x40) on the original means some byte register
        // needed it; keep forcing it.
        if layout.rex == Some(0x40) {
            rex = rex.force_for_8bit(4);
        }
        // A byte register newly placed in the rm slot may demand one too.
        if let Some(RmForm::Reg(e)) = &rm_form {
            if let Some(op) = rm_op {
                let r = op.register();
                if r.num_bytes == 1 && !r.is_legacy() {
                    rex = rex.force_for_8bit(*e);
                }
            }
        }
        rex.emit(sink);
    }

    // Opcode bytes, patching a +r register if there is one.
    let op_start = usize::from(layout.opcode_start);
    let op_end = op_start + usize::from(layout.opcode_len);
    for (i, &b) in bytes[op_start..op_end].iter().enumerate() {
        if i + 1 == usize::from(layout.opcode_len) {
            if let Some(e) = opcode_low3 {
                sink.put1((b & !7) | (e & 7));
                continue;
            }
        }
        sink.put1(b);
    }

    // ModR/M, SIB, displacement.
    let imm_len = usize::from(layout.imm_len);
    match rm_form {
        Some(form) => form.emit(sink, enc_g, pc, imm_len),
        None => {
            // No operand claims the rm side; re-emit the original bytes
            // with only the reg field patched.
            if let Some(modrm_off) = layout.modrm {
                let m = bytes[usize::from(modrm_off)];
                sink.put1((m & !0x38) | ((enc_g & 7) << 3));
                if let Some(sib_off) = layout.sib {
                    sink.put1(bytes[usize::from(sib_off)]);
                }
                let d0 = usize::from(layout.disp_start);
                for &b in &bytes[d0..d0 + usize::from(layout.disp_len)] {
                    sink.put1(b);
                }
            }
        }
    }

    // Immediate bytes ride along unchanged.
    let imm0 = usize::from(layout.imm_start);
    for &b in &bytes[imm0..imm0 + imm_len] {
        sink.put1(b);
    }
}

/// Copy a VEX prefix, replacing its (inverted) R/X/B extension bits.
fn emit_patched_vex(
    bytes: &[u8],
    vex_off: u8,
    vex_len: u8,
    r_bit: u8,
    b_bit: u8,
    x_bit: u8,
    sink: &mut impl CodeSink,
) {
    let off = usize::from(vex_off);
    match vex_len {
        2 => {
            assert!(
                b_bit == 0 && x_bit == 0,
                "2-byte VEX cannot extend base/index registers"
            );
            sink.put1(bytes[off]);
            let b1 = (bytes[off + 1] & 0x7f) | ((!r_bit & 1) << 7);
            sink.put1(b1);
        }
        3 => {
            sink.put1(bytes[off]);
            let b1 = (bytes[off + 1] & 0x1f)
                | ((!r_bit & 1) << 7)
                | ((!x_bit & 1) << 6)
                | ((!b_bit & 1) << 5);
            sink.put1(b1);
            sink.put1(bytes[off + 2]);
        }
        _ => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::builder;
    use crate::arch::reg::VirtualRegister;

    fn encode_one(mut inst: Inst) -> Vec<u8> {
        let staged = InstructionEncoder::new(EncodeKind::Staged);
        let mut buf = vec![0u8; 16];
        let pc = buf.as_ptr() as usize;
        staged.encode(&mut inst, pc, &NoTargets);
        let commit = InstructionEncoder::new(EncodeKind::Commit);
        let end = commit.encode(&mut inst, pc, &NoTargets);
        buf.truncate(end - pc);
        buf
    }

    fn r(name: &str) -> VirtualRegister {
        VirtualRegister::from_name(name)
    }

    #[test]
    fn encodes_mov_r_r() {
        assert_eq!(
            encode_one(builder::mov_r_r(r("rax"), r("rbx"))),
            vec![0x48, 0x89, 0xd8]
        );
        assert_eq!(
            encode_one(builder::mov_r_r(r("r8"), r("rcx"))),
            vec![0x49, 0x89, 0xc8]
        );
    }

    #[test]
    fn encodes_push_pop() {
        assert_eq!(encode_one(builder::push_r(r("rbp"))), vec![0x55]);
        assert_eq!(encode_one(builder::push_r(r("r12"))), vec![0x41, 0x54]);
        assert_eq!(encode_one(builder::pop_r(r("rdi"))), vec![0x5f]);
    }

    #[test]
    fn encodes_lea_rsp_shift() {
        assert_eq!(
            encode_one(builder::lea_rsp_disp(-8)),
            vec![0x48, 0x8d, 0x64, 0x24, 0xf8]
        );
    }

    #[test]
    fn encodes_mov_imm_forms() {
        assert_eq!(
            encode_one(builder::mov_r_imm(r("rax"), 1)),
            vec![0xb8, 0x01, 0x00, 0x00, 0x00]
        );
        assert_eq!(
            encode_one(builder::mov_r_imm(r("rax"), 0x1122_3344_5566_7788)),
            vec![0x48, 0xb8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );
    }

    #[test]
    fn encodes_direct_branches() {
        let mut buf = vec![0u8; 16];
        let pc = buf.as_ptr() as usize;
        let target = pc + 0x20;
        let mut inst = builder::jmp_rel(target);
        let staged = InstructionEncoder::new(EncodeKind::Staged);
        staged.encode(&mut inst, pc, &NoTargets);
        assert_eq!(inst.encoded_length, 5);
        let commit = InstructionEncoder::new(EncodeKind::Commit);
        let end = commit.encode(&mut inst, pc, &NoTargets);
        buf.truncate(end - pc);
        assert_eq!(buf, vec![0xe9, 0x1b, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn encodes_ud2_and_ret() {
        assert_eq!(encode_one(builder::ud2()), vec![0x0f, 0x0b]);
        assert_eq!(encode_one(builder::ret()), vec![0xc3]);
    }

    #[test]
    fn encodes_test_rsp_rsp() {
        let rsp = VirtualRegister::stack_pointer();
        assert_eq!(
            encode_one(builder::test_r_r(rsp, rsp)),
            vec![0x48, 0x85, 0xe4]
        );
    }

    #[test]
    fn decode_then_reencode_with_substituted_base() {
        // add rax, [rbx + rcx*2 + 8], then pretend the mangler replaced
        // the memory operand with [r11].
        use crate::arch::decode::InstructionDecoder;
        let code = [0x48, 0x03, 0x44, 0x4b, 0x08];
        let dec = InstructionDecoder::new();
        let (mut inst, _) = dec.decode(code.as_ptr() as usize).unwrap();
        let mem_idx = inst
            .ops
            .iter()
            .position(|op| op.is_memory())
            .expect("has a memory operand");
        inst.ops[mem_idx] = Operand::mem_reg(
            r("r11"),
            inst.ops[mem_idx].flags,
            inst.ops[mem_idx].width,
        );
        inst.touch_operands();
        inst.analyze_stack_usage();
        let bytes = encode_one(inst);
        // add rax, [r11] = 49 03 03
        assert_eq!(bytes, vec![0x49, 0x03, 0x03]);
    }
}
