//! Decoding application instructions into the IR.
//!
//! The heavy lifting of instruction recognition is done by capstone; this
//! module converts its operand report into the mutable IR, normalizes the
//! operand forms the manglers expect, and records the byte layout needed
//! to re-encode rewritten instructions.

use super::inst::{Category, IClass, Inst, InstFlags};
use super::layout::{self, Field, InstLayout, RawEncoding};
use super::operand::{MemOperand, Operand, OperandFlags, OperandKind, SegmentReg};
use super::reg::{ArchReg, RegKind, VirtualRegister};
use super::MAX_INSTRUCTION_BYTES;
use crate::{AppPc, PAGE_SIZE};
use capstone::arch::x86::X86OperandType;
use capstone::arch::{ArchDetail, BuildsCapstone, DetailsArchInsn};
use capstone::{Capstone, InsnDetail, RegAccessType, RegId};
use smallvec::SmallVec;

/// Decodes one instruction at a time from application memory.
pub struct InstructionDecoder {
    cs: Capstone,
}

impl Default for InstructionDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl InstructionDecoder {
    /// Build a 64-bit decoder with operand detail enabled.
    ///
    /// # Panics
    ///
    /// Panics if the decode library cannot be initialized; nothing can
    /// proceed without it.
    pub fn new() -> Self {
        let cs = Capstone::new()
            .x86()
            .mode(capstone::arch::x86::ArchMode::Mode64)
            .detail(true)
            .build()
            .expect("failed to initialize instruction decoder");
        Self { cs }
    }

    /// Decode at `*pc`, advancing `*pc` to the next instruction. Returns
    /// `false` when translation cannot continue past the decoded
    /// instruction (or nothing could be decoded).
    pub fn decode_next(&self, instr: &mut Inst, pc: &mut AppPc) -> bool {
        match self.decode_internal(*pc) {
            Some((inst, next_pc)) => {
                *instr = inst;
                match next_pc {
                    Some(next) => {
                        *pc = next;
                        true
                    }
                    None => false,
                }
            }
            None => false,
        }
    }

    /// Decode the instruction at `pc`. The second element is the next
    /// pc, or `None` when decoding must stop at this instruction.
    pub fn decode(&self, pc: AppPc) -> Option<(Inst, Option<AppPc>)> {
        self.decode_internal(pc)
    }

    fn decode_internal(&self, mut pc: AppPc) -> Option<(Inst, Option<AppPc>)> {
        loop {
            let inst = self.decode_one(pc)?;
            let next_pc = pc + usize::from(inst.decoded_length);

            // Plain nops are dropped from the stream.
            if inst.category == Category::Nop {
                pc = next_pc;
                continue;
            }

            // A conditional jump to the next instruction is a nop too.
            if inst.is_conditional_jump() && inst.branch_target_pc() == Some(next_pc) {
                pc = next_pc;
                continue;
            }

            if inst.iclass.ends_decoding() {
                return Some((inst, None));
            }
            return Some((inst, Some(next_pc)));
        }
    }

    /// Decode exactly one instruction at `pc`, converting it to the IR.
    fn decode_one(&self, pc: AppPc) -> Option<Inst> {
        let bytes = read_instruction_bytes(pc);
        let insns = match self.cs.disasm_count(bytes, pc as u64, 1) {
            Ok(insns) => insns,
            Err(_) => return None,
        };
        let insn = insns.iter().next()?;
        let detail = self.cs.insn_detail(&insn).ok()?;
        let mnemonic = insn.mnemonic().unwrap_or("");
        let mut inst = Inst::new(IClass::from_mnemonic(mnemonic));
        inst.iform = insn.id().0;
        inst.decoded_pc = Some(pc);
        inst.decoded_length = insn.bytes().len() as u8;

        let raw_bytes: SmallVec<[u8; 16]> = SmallVec::from_slice(insn.bytes());
        self.convert_prefixes(&mut inst, &detail);
        let next_pc = pc + insn.bytes().len();
        self.convert_operands(&mut inst, &detail, next_pc);
        self.append_implicit_regs(&mut inst, &detail);
        self.finish_widths(&mut inst, &detail);

        let raw = classify_layout(&inst, raw_bytes);
        inst.raw = Some(raw);
        inst.analyze_stack_usage();
        Some(inst)
    }

    fn convert_prefixes(&self, inst: &mut Inst, detail: &InsnDetail<'_>) {
        let arch = detail.arch_detail();
        let Some(x86) = arch_x86(&arch) else {
            return;
        };
        let prefixes = x86.prefix();
        match prefixes[0] {
            0xf0 => inst.flags.insert(InstFlags::PREFIX_LOCK),
            0xf2 => inst.flags.insert(InstFlags::PREFIX_REPNE),
            0xf3 => inst.flags.insert(InstFlags::PREFIX_REP),
            _ => {}
        }
        if inst.flags.contains(InstFlags::PREFIX_LOCK) {
            inst.flags.insert(InstFlags::IS_ATOMIC);
        }
        if inst.iclass == IClass::Xchg {
            inst.flags.insert(InstFlags::IS_ATOMIC);
        }
    }

    fn convert_operands(&self, inst: &mut Inst, detail: &InsnDetail<'_>, next_pc: AppPc) {
        let arch = detail.arch_detail();
        let Some(x86) = arch_x86(&arch) else {
            return;
        };
        // Only branch-like classes carry their target as an immediate;
        // a `RET imm16` immediate is a stack adjustment.
        let is_cti = matches!(
            inst.category,
            Category::CondBr | Category::UncondBr | Category::Call
        ) || inst.iclass == IClass::Xbegin;
        let mem_is_sticky = inst
            .flags
            .intersects(InstFlags::PREFIX_REP | InstFlags::PREFIX_REPNE)
            || inst.iclass == IClass::Xlat;

        for op in x86.operands() {
            let flags = access_flags(op.access);
            let width = u16::from(op.size) * 8;
            let converted = match op.op_type {
                X86OperandType::Reg(reg_id) => {
                    let reg = self.convert_reg(reg_id);
                    if reg.is_legacy() {
                        inst.flags.insert(InstFlags::USES_LEGACY_REGS);
                    }
                    let mut op = Operand::reg(reg, flags);
                    op.width = width;
                    Some(op)
                }
                X86OperandType::Imm(val) => {
                    if is_cti {
                        // Relative branches decode with their absolute
                        // target in the immediate.
                        Some(Operand::branch_pc(val as usize))
                    } else {
                        Some(Operand::imm(val, width))
                    }
                }
                X86OperandType::Mem(mem) => {
                    Some(self.convert_mem(inst, &mem, flags, width, next_pc, mem_is_sticky))
                }
                _ => None,
            };
            if let Some(op) = converted {
                inst.ops.push(op);
            }
        }
    }

    fn convert_reg(&self, reg_id: RegId) -> VirtualRegister {
        match self.cs.reg_name(reg_id) {
            Some(name) => VirtualRegister::from_name(&name),
            None => VirtualRegister::invalid(),
        }
    }

    fn convert_mem(
        &self,
        inst: &mut Inst,
        mem: &capstone::arch::x86::X86OpMem,
        flags: OperandFlags,
        width: u16,
        next_pc: AppPc,
        mem_is_sticky: bool,
    ) -> Operand {
        let is_lea = inst.iclass == IClass::Lea;
        let base_id = mem.base();
        let index_id = mem.index();
        let disp = mem.disp();
        let scale = mem.scale().unsigned_abs() as u8;

        // In long mode only %fs and %gs carry a nonzero segment base, and
        // an address computation (LEA) never consults the segment at all.
        let mut segment = match self.cs.reg_name(mem.segment()).as_deref() {
            Some("fs") => SegmentReg::Fs,
            Some("gs") => SegmentReg::Gs,
            _ => SegmentReg::None,
        };
        if is_lea {
            segment = SegmentReg::None;
        }

        let base = if base_id.0 != 0 {
            self.convert_reg(base_id)
        } else {
            VirtualRegister::invalid()
        };
        let index = if index_id.0 != 0 {
            self.convert_reg(index_id)
        } else {
            VirtualRegister::invalid()
        };

        // A rip-based reference has a fully known absolute address.
        if base.is_valid()
            && base.kind == RegKind::UnschedulableArch
            && !index.is_valid()
            && is_rip_name(self.cs.reg_name(base_id).as_deref())
        {
            let addr = (next_pc as i64).wrapping_add(disp) as u64;
            let mut op = Operand::pointer(addr, flags, width);
            op.is_effective_address = is_lea;
            inst.flags.insert(InstFlags::NEEDS_RELOCATION);
            return op;
        }

        let mut op = if !base.is_valid() && !index.is_valid() {
            // Hard-coded address, possibly segment-relative.
            Operand::pointer(disp as u64, flags, width)
        } else if !base.is_valid() && disp == 0 && scale <= 1 && !index.is_stack_pointer() {
            Operand::mem_reg(index, flags, width)
        } else if !index.is_valid() && disp == 0 && !base.is_stack_pointer() {
            Operand::mem_reg(base, flags, width)
        } else {
            Operand::mem(
                MemOperand {
                    base,
                    index,
                    scale: scale.max(1),
                    disp: disp as i32,
                },
                flags,
                width,
            )
        };
        op.segment = segment;
        op.is_sticky = mem_is_sticky;
        op.is_effective_address = is_lea;
        op
    }

    /// Record the implicitly read/written registers as non-explicit
    /// operands so the register sets see them.
    fn append_implicit_regs(&self, inst: &mut Inst, detail: &InsnDetail<'_>) {
        let mut add = |inst: &mut Inst, id: RegId, flags: OperandFlags| {
            let reg = self.convert_reg(id);
            if !reg.is_valid() {
                return;
            }
            // Skip registers already named explicitly.
            let already = inst.ops.iter().any(|op| match op.kind {
                OperandKind::Register(r) => {
                    r.kind == reg.kind && r.reg_num == reg.reg_num && !op.is_memory
                }
                _ => false,
            });
            if already {
                return;
            }
            let mut op = Operand::reg(reg, flags);
            op.is_explicit = false;
            op.is_sticky = true;
            inst.ops.push(op);
        };
        for id in detail.regs_read() {
            add(inst, *id, OperandFlags::READ);
        }
        for id in detail.regs_write() {
            add(inst, *id, OperandFlags::WRITE);
        }
    }

    fn finish_widths(&self, inst: &mut Inst, detail: &InsnDetail<'_>) {
        use IClass::*;
        let arch = detail.arch_detail();
        let has_operand_size_prefix = arch_x86(&arch)
            .map(|x86| x86.prefix().contains(&0x66))
            .unwrap_or(false);
        inst.effective_operand_width = match inst.iclass {
            Push | Pop | Pushf | Popf | Call | Ret => {
                if has_operand_size_prefix {
                    16
                } else {
                    64
                }
            }
            _ => inst
                .ops
                .iter()
                .filter(|op| op.is_explicit)
                .map(|op| op.width)
                .max()
                .unwrap_or(0),
        };
        // Sign-extended push immediates widen to the stack slot size.
        if inst.iclass == Push {
            if let Some(op) = inst.ops.first_mut() {
                if op.is_immediate() {
                    op.width = inst.effective_operand_width;
                }
            }
        }
    }
}

fn arch_x86<'a>(arch: &'a ArchDetail<'_>) -> Option<&'a capstone::arch::x86::X86InsnDetail<'a>> {
    match arch {
        ArchDetail::X86Detail(x86) => Some(x86),
        _ => None,
    }
}

fn is_rip_name(name: Option<&str>) -> bool {
    matches!(name, Some("rip") | Some("eip") | Some("ip"))
}

fn access_flags(access: Option<RegAccessType>) -> OperandFlags {
    match access {
        Some(RegAccessType::ReadOnly) => OperandFlags::READ,
        Some(RegAccessType::WriteOnly) => OperandFlags::WRITE,
        Some(RegAccessType::ReadWrite) => OperandFlags::RW,
        // Without a report, assume the worst on both sides.
        None => OperandFlags::RW,
    }
}

/// Read up to 15 bytes at `pc`, stopping at a page boundary when the
/// tail of the mapping might be unreadable. The caller guarantees `pc`
/// itself is mapped code.
fn read_instruction_bytes<'a>(pc: AppPc) -> &'a [u8] {
    let to_page_end = PAGE_SIZE - (pc & (PAGE_SIZE - 1));
    let len = MAX_INSTRUCTION_BYTES.min(to_page_end.max(1));
    unsafe { std::slice::from_raw_parts(pc as *const u8, len) }
}

/// Work out the byte layout and per-operand encoded fields, verifying the
/// parse against the decoded operands. Instructions that cannot be
/// verified keep `layout: None` and emit on their original bytes only.
fn classify_layout(inst: &Inst, bytes: SmallVec<[u8; 16]>) -> RawEncoding {
    let mut raw = RawEncoding {
        bytes,
        layout: None,
        fields: SmallVec::new(),
    };
    raw.fields.resize(inst.ops.len(), Field::None);

    let has_mem = inst
        .ops
        .iter()
        .any(|op| op.is_explicit && (op.is_memory() || op.is_pointer()));
    let explicit_regs: Vec<(usize, VirtualRegister)> = inst
        .ops
        .iter()
        .enumerate()
        .filter(|(_, op)| op.is_explicit && op.is_register())
        .map(|(i, op)| (i, op.register()))
        .collect();

    // Branches and no-operand instructions are re-synthesized when they
    // change; their layout never matters.
    if inst.is_cti() {
        return raw;
    }

    // First try the ModR/M interpretation.
    if let Some(layout) = layout::scan(&raw.bytes, true) {
        if verify_modrm_layout(inst, &raw.bytes, &layout, &mut raw.fields, has_mem) {
            raw.layout = Some(layout);
            return raw;
        }
    }
    raw.fields.clear();
    raw.fields.resize(inst.ops.len(), Field::None);

    // Then the no-ModR/M interpretation: a single register folded into
    // the opcode byte, or pure-immediate forms.
    if has_mem {
        return raw;
    }
    if let Some(layout) = layout::scan(&raw.bytes, false) {
        let opcode_last =
            raw.bytes[usize::from(layout.opcode_start + layout.opcode_len - 1)];
        let rex_b = layout.rex_b(&raw.bytes);
        let mut ok = true;
        for &(i, reg) in &explicit_regs {
            if reg.is_arch_gpr() || reg.is_stack_pointer() {
                let enc = (opcode_last & 7) | (rex_b << 3);
                if !reg.is_legacy() && reg.kind == RegKind::ArchGpr && reg.hw_enc() == enc {
                    raw.fields[i] = Field::OpcodeLow3;
                } else {
                    ok = false;
                }
            }
        }
        if ok && explicit_regs.len() <= 1 {
            raw.layout = Some(layout);
        }
    }
    raw
}

/// Check a ModR/M-form layout against the decoded operands, assigning
/// encoded fields along the way.
fn verify_modrm_layout(
    inst: &Inst,
    bytes: &[u8],
    layout: &InstLayout,
    fields: &mut SmallVec<[Field; 4]>,
    has_mem: bool,
) -> bool {
    let Some(modrm) = layout.modrm_byte(bytes) else {
        return false;
    };
    let m0d = modrm >> 6;
    let rm = modrm & 7;
    let reg_enc = ((modrm >> 3) & 7) | (layout.rex_r(bytes) << 3);
    let rex_b = layout.rex_b(bytes);
    let rex_x = layout.rex_x(bytes);

    let mut rm_claimed = false;
    let mut reg_claimed = false;

    for (i, op) in inst.ops.iter().enumerate() {
        if !op.is_explicit {
            continue;
        }
        match op.kind {
            OperandKind::Memory(mem) => {
                if m0d == 0b11 || !verify_mem(bytes, layout, m0d, rm, rex_b, rex_x, &mem) {
                    return false;
                }
                fields[i] = Field::ModRmRm;
                rm_claimed = true;
            }
            OperandKind::Register(r) if op.is_memory() => {
                // Simple `[reg]` operand.
                if m0d == 0b11 {
                    return false;
                }
                let mem = MemOperand {
                    base: r,
                    index: VirtualRegister::invalid(),
                    scale: 1,
                    disp: 0,
                };
                if !verify_mem(bytes, layout, m0d, rm, rex_b, rex_x, &mem) {
                    return false;
                }
                fields[i] = Field::ModRmRm;
                rm_claimed = true;
            }
            OperandKind::Pointer(_) => {
                // Either rip-relative or an absolute disp32; both live in
                // the rm encoding with a 4-byte displacement.
                if m0d == 0b11 || layout.disp_len != 4 {
                    return false;
                }
                fields[i] = Field::ModRmRm;
                rm_claimed = true;
            }
            OperandKind::Register(r) => {
                let enc = if r.num_bytes == 1 {
                    hw_enc8_checked(r)
                } else {
                    hw_enc_checked(r)
                };
                let Some(enc) = enc else {
                    continue;
                };
                if !reg_claimed && enc == reg_enc {
                    fields[i] = Field::ModRmReg;
                    reg_claimed = true;
                } else if !rm_claimed && m0d == 0b11 && enc == (rm | (rex_b << 3)) {
                    fields[i] = Field::ModRmRm;
                    rm_claimed = true;
                }
                // Otherwise an implicit-style operand (e.g. %rax in a
                // one-byte form); leave unlocatable.
            }
            OperandKind::Immediate(_) => {
                fields[i] = Field::Imm;
            }
            OperandKind::Branch(_) => return false,
        }
    }

    if has_mem && !rm_claimed {
        return false;
    }
    true
}

fn hw_enc_checked(r: VirtualRegister) -> Option<u8> {
    if r.is_arch_gpr() || r.is_stack_pointer() {
        Some(r.hw_enc())
    } else {
        None
    }
}

fn hw_enc8_checked(r: VirtualRegister) -> Option<u8> {
    if r.is_legacy() {
        Some(r.hw_enc() + 4)
    } else {
        hw_enc_checked(r)
    }
}

/// Decode the memory operand named by a ModR/M byte and compare it with
/// what the decode library reported.
fn verify_mem(
    bytes: &[u8],
    layout: &InstLayout,
    m0d: u8,
    rm: u8,
    rex_b: u8,
    rex_x: u8,
    expect: &MemOperand,
) -> bool {
    let disp = layout.disp_value(bytes).unwrap_or(0);
    let (base, index, scale): (Option<u8>, Option<u8>, u8) = if rm == 0b100 {
        let Some(sib_off) = layout.sib else {
            return false;
        };
        let sib = bytes[usize::from(sib_off)];
        let sib_base = sib & 7;
        let sib_index = (sib >> 3) & 7;
        let base = if sib_base == 0b101 && m0d == 0b00 {
            None
        } else {
            Some(sib_base | (rex_b << 3))
        };
        let index = if sib_index == 0b100 && rex_x == 0 {
            None
        } else {
            Some(sib_index | (rex_x << 3))
        };
        (base, index, 1u8 << (sib >> 6))
    } else if m0d == 0b00 && rm == 0b101 {
        return false; // rip-relative; handled as Pointer.
    } else {
        (Some(rm | (rex_b << 3)), None, 1)
    };

    let expect_base = if expect.base.is_valid() {
        hw_enc_checked(expect.base)
    } else {
        None
    };
    let expect_index = if expect.index.is_valid() {
        hw_enc_checked(expect.index)
    } else {
        None
    };
    if expect.base.is_valid() && expect_base.is_none() {
        return false;
    }
    if expect.index.is_valid() && expect_index.is_none() {
        return false;
    }

    base == expect_base
        && index == expect_index
        && (index.is_none() || scale == expect.scale)
        && disp == expect.disp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::inst::Cond;

    fn decode_buf(buf: &[u8]) -> Inst {
        let dec = InstructionDecoder::new();
        let (inst, _) = dec.decode(buf.as_ptr() as usize).expect("decodes");
        inst
    }

    #[test]
    fn decodes_simple_mov() {
        // mov rax, rbx
        let inst = decode_buf(&[0x48, 0x89, 0xd8, 0xcc]);
        assert_eq!(inst.iclass, IClass::Mov);
        assert_eq!(inst.decoded_length, 3);
        let dst = inst.ops[0].register();
        assert_eq!(dst.hw_enc(), granary_asm::reg::RAX);
        assert!(inst.ops[0].flags.is_write());
        assert!(inst.ops[1].flags.is_read());
    }

    #[test]
    fn skips_nops() {
        // nop; nop; mov eax, 1
        let inst = decode_buf(&[0x90, 0x90, 0xb8, 0x01, 0x00, 0x00, 0x00]);
        assert_eq!(inst.iclass, IClass::Mov);
    }

    #[test]
    fn conditional_jump_to_next_is_a_nop() {
        // je +0; mov eax, 1
        let inst = decode_buf(&[0x74, 0x00, 0xb8, 0x01, 0x00, 0x00, 0x00]);
        assert_eq!(inst.iclass, IClass::Mov);
    }

    #[test]
    fn hard_stops_end_decoding() {
        let dec = InstructionDecoder::new();
        let buf = [0x0f, 0x0b]; // ud2
        let (inst, next) = dec.decode(buf.as_ptr() as usize).unwrap();
        assert_eq!(inst.iclass, IClass::Ud2);
        assert!(next.is_none());
    }

    #[test]
    fn relative_branch_becomes_absolute_target() {
        let buf = [0x74, 0x10, 0xcc]; // je +0x10
        let dec = InstructionDecoder::new();
        let (inst, _) = dec.decode(buf.as_ptr() as usize).unwrap();
        assert_eq!(inst.iclass, IClass::Jcc(Cond::Z));
        let target = inst.branch_target_pc().unwrap();
        assert_eq!(target, buf.as_ptr() as usize + 2 + 0x10);
    }

    #[test]
    fn rip_relative_memory_becomes_pointer() {
        // mov rax, [rip + 0x100]
        let buf = [0x48, 0x8b, 0x05, 0x00, 0x01, 0x00, 0x00];
        let dec = InstructionDecoder::new();
        let (inst, _) = dec.decode(buf.as_ptr() as usize).unwrap();
        let op = &inst.ops[1];
        assert!(op.is_pointer());
        match op.kind {
            OperandKind::Pointer(addr) => {
                assert_eq!(addr as usize, buf.as_ptr() as usize + 7 + 0x100);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn compound_memory_stays_compound() {
        // mov rax, [rbx + rcx*4 + 8]
        let buf = [0x48, 0x8b, 0x44, 0x8b, 0x08];
        let inst = decode_buf(&buf);
        let op = &inst.ops[1];
        assert!(op.is_compound);
        match op.kind {
            OperandKind::Memory(m) => {
                assert_eq!(m.scale, 4);
                assert_eq!(m.disp, 8);
            }
            _ => unreachable!(),
        }
        // And the layout must have verified.
        assert!(inst.raw.as_ref().unwrap().layout.is_some());
    }

    #[test]
    fn simple_base_memory_simplifies() {
        // mov rax, [rbx]
        let inst = decode_buf(&[0x48, 0x8b, 0x03]);
        let op = &inst.ops[1];
        assert!(op.is_memory() && !op.is_compound);
    }

    #[test]
    fn push_tracks_the_stack_pointer() {
        let mut inst = decode_buf(&[0x55]); // push rbp
        inst.analyze_stack_usage();
        assert!(inst.writes_to_stack_pointer());
        assert_eq!(inst.effective_operand_width, 64);
    }

    #[test]
    fn segment_memory_keeps_fs() {
        // mov rax, fs:[0x28]
        let buf = [0x64, 0x48, 0x8b, 0x04, 0x25, 0x28, 0x00, 0x00, 0x00];
        let inst = decode_buf(&buf);
        let op = &inst.ops[1];
        assert_eq!(op.segment, SegmentReg::Fs);
        assert!(op.is_pointer());
    }
}
