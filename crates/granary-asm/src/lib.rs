//! Emission primitives for x64 machine code.
//!
//! This crate knows how to lay down the byte-level pieces of an x64
//! instruction: legacy prefixes, REX bytes, ModR/M and SIB bytes,
//! displacements and immediates. It knows nothing about instruction
//! selection or operands in the IR sense; the translator drives it with
//! already-resolved hardware register encodings.

mod rex;
mod sink;

pub mod reg;

pub use rex::{encode_modrm, encode_sib, Disp, RexPrefix};
pub use sink::{CodeSink, CountingSink, MemorySink};

/// Emit the ModR/M, optional SIB, and displacement bytes for a memory
/// operand of the form `[base + index * scale + disp]`.
///
/// `enc_g` is the hardware encoding of the register (or opcode extension)
/// in the reg field. `scale` is the literal multiplier (1, 2, 4 or 8).
///
/// # Panics
///
/// Panics if `index` is `%rsp` (not encodable as an index register) or if
/// `scale` is not a power of two in `1..=8`.
pub fn emit_modrm_sib_disp(
    sink: &mut impl CodeSink,
    enc_g: u8,
    base: Option<u8>,
    index: Option<u8>,
    scale: u8,
    disp: i32,
) {
    let scale_bits = match scale {
        1 => 0b00,
        2 => 0b01,
        4 => 0b10,
        8 => 0b11,
        _ => panic!("invalid scale: {scale}"),
    };
    match (base, index) {
        (Some(base), None) => {
            let mut disp = Disp::new(disp);
            let base_low3 = base & 7;
            if base_low3 == reg::RSP {
                // A base of rsp/r12 demands a SIB byte with the index
                // field set to the no-index encoding 0b100.
                sink.put1(encode_modrm(disp.m0d(), enc_g & 7, 0b100));
                sink.put1(0b00_100_100);
                disp.emit(sink);
            } else {
                if base_low3 == reg::RBP {
                    // rbp/r13 with mod=00 means rip-relative, so a zero
                    // displacement must be made explicit.
                    disp.force_imm8();
                }
                sink.put1(encode_modrm(disp.m0d(), enc_g & 7, base_low3));
                disp.emit(sink);
            }
        }
        (Some(base), Some(index)) => {
            // r12 is fine as an index (REX.X disambiguates); only the
            // literal rsp encoding is unusable.
            assert_ne!(index, reg::RSP, "%rsp cannot index");
            let mut disp = Disp::new(disp);
            if base & 7 == reg::RBP {
                disp.force_imm8();
            }
            sink.put1(encode_modrm(disp.m0d(), enc_g & 7, 0b100));
            sink.put1(encode_sib(scale_bits, index & 7, base & 7));
            disp.emit(sink);
        }
        (None, Some(index)) => {
            assert_ne!(index, reg::RSP, "%rsp cannot index");
            // No base: mod=00, rm=100, SIB base=101, disp32 mandatory.
            sink.put1(encode_modrm(0b00, enc_g & 7, 0b100));
            sink.put1(encode_sib(scale_bits, index & 7, 0b101));
            sink.put4(disp as u32);
        }
        (None, None) => {
            // Absolute disp32, still through a SIB byte so it is not
            // mistaken for rip-relative.
            sink.put1(encode_modrm(0b00, enc_g & 7, 0b100));
            sink.put1(encode_sib(0b00, 0b100, 0b101));
            sink.put4(disp as u32);
        }
    }
}

/// Emit the ModR/M and displacement bytes of a rip-relative operand. The
/// 32-bit displacement is relative to the end of the instruction; when the
/// caller has bytes (e.g. an immediate) following the displacement it must
/// fold their length into `disp` itself.
pub fn emit_modrm_rip_disp(sink: &mut impl CodeSink, enc_g: u8, disp: i32) {
    sink.put1(encode_modrm(0b00, enc_g & 7, 0b101));
    sink.put4(disp as u32);
}

/// Emit a ModR/M byte for a direct register operand (`mod == 0b11`).
pub fn emit_modrm_reg(sink: &mut impl CodeSink, enc_g: u8, enc_e: u8) {
    sink.put1(encode_modrm(0b11, enc_g & 7, enc_e & 7));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emitted(f: impl FnOnce(&mut Vec<u8>)) -> Vec<u8> {
        let mut sink = Vec::new();
        f(&mut sink);
        sink
    }

    #[test]
    fn base_only_forms() {
        // [rax]
        assert_eq!(
            emitted(|s| emit_modrm_sib_disp(s, 0, Some(reg::RAX), None, 1, 0)),
            vec![0x00]
        );
        // [rbp] needs an explicit zero disp8.
        assert_eq!(
            emitted(|s| emit_modrm_sib_disp(s, 0, Some(reg::RBP), None, 1, 0)),
            vec![0x45, 0x00]
        );
        // [rsp] needs a SIB byte.
        assert_eq!(
            emitted(|s| emit_modrm_sib_disp(s, 0, Some(reg::RSP), None, 1, 0)),
            vec![0x04, 0x24]
        );
        // [r13] shares rbp's low bits and the same special case.
        assert_eq!(
            emitted(|s| emit_modrm_sib_disp(s, 0, Some(reg::R13), None, 1, 0)),
            vec![0x45, 0x00]
        );
    }

    #[test]
    fn displacement_classing() {
        // [rax + 0x10] takes a disp8.
        assert_eq!(
            emitted(|s| emit_modrm_sib_disp(s, 1, Some(reg::RAX), None, 1, 0x10)),
            vec![0x48, 0x10]
        );
        // [rax + 0x1000] takes a disp32.
        assert_eq!(
            emitted(|s| emit_modrm_sib_disp(s, 1, Some(reg::RAX), None, 1, 0x1000)),
            vec![0x88, 0x00, 0x10, 0x00, 0x00]
        );
    }

    #[test]
    fn sib_forms() {
        // [rax + rcx*4 + 4]
        assert_eq!(
            emitted(|s| emit_modrm_sib_disp(s, 0, Some(reg::RAX), Some(reg::RCX), 4, 4)),
            vec![0x44, 0x88, 0x04]
        );
        // [rcx*2] with no base forces a disp32.
        assert_eq!(
            emitted(|s| emit_modrm_sib_disp(s, 0, None, Some(reg::RCX), 2, 0)),
            vec![0x04, 0x4d, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    #[should_panic]
    fn rsp_cannot_be_an_index() {
        let mut sink = Vec::new();
        emit_modrm_sib_disp(&mut sink, 0, Some(reg::RAX), Some(reg::RSP), 1, 0);
    }
}
