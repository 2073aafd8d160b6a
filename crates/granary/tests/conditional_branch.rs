//! Every conditional branch, taken and not taken, through the
//! translator. Each stub compares its two arguments, branches on a
//! condition, and returns 1 when the branch was taken; translated code
//! must agree with native execution over a grid of inputs.

#![cfg(all(target_arch = "x86_64", target_os = "linux"))]

mod common;

use common::{call1, call2, init_logging, AppCode};
use granary::translate::TargetStackValidity;
use granary::Context;

/// Build `cmp rdi, rsi; j<cc> taken; mov eax,0; ret; taken: mov eax,1;
/// ret` for condition code `cc`.
fn cc_stub(cc: u8) -> Vec<u8> {
    vec![
        0x48, 0x39, 0xf7, // cmp rdi, rsi
        0x70 + cc, 0x06, // jcc +6
        0xb8, 0x00, 0x00, 0x00, 0x00, // mov eax, 0
        0xc3, // ret
        0xb8, 0x01, 0x00, 0x00, 0x00, // mov eax, 1
        0xc3, // ret
    ]
}

#[test]
fn all_sixteen_condition_codes() {
    init_logging();
    let inputs: [(u64, u64); 6] = [
        (0, 0),
        (1, 2),
        (2, 1),
        (u64::MAX, 1),
        (1, u64::MAX),
        (0x8000_0000_0000_0000, 1),
    ];
    for cc in 0u8..16 {
        let app = AppCode::load(&cc_stub(cc));
        let ctx = Context::new();
        let entry = ctx.translate(app.pc(), TargetStackValidity::Valid);
        for &(a, b) in &inputs {
            let native = call2(app.pc(), a, b);
            let translated = call2(entry, a, b);
            assert_eq!(native, translated, "cc={cc} a={a:#x} b={b:#x}");
        }
    }
}

#[test]
fn jrcxz_and_jecxz() {
    init_logging();
    // mov rcx, rdi; jrcxz zero; mov eax,0; ret; zero: mov eax,1; ret
    let jrcxz: &[u8] = &[
        0x48, 0x89, 0xf9, // mov rcx, rdi
        0xe3, 0x06, // jrcxz +6
        0xb8, 0x00, 0x00, 0x00, 0x00, // mov eax, 0
        0xc3, // ret
        0xb8, 0x01, 0x00, 0x00, 0x00, // mov eax, 1
        0xc3, // ret
    ];
    let app = AppCode::load(jrcxz);
    let ctx = Context::new();
    let entry = ctx.translate(app.pc(), TargetStackValidity::Valid);
    assert_eq!(call1(entry, 0), 1);
    assert_eq!(call1(entry, 1), 0);
    assert_eq!(call1(entry, u64::MAX), 0);
    // jecxz looks at the low half only.
    let jecxz: &[u8] = &[
        0x48, 0x89, 0xf9, // mov rcx, rdi
        0x67, 0xe3, 0x06, // jecxz +6
        0xb8, 0x00, 0x00, 0x00, 0x00, // mov eax, 0
        0xc3, // ret
        0xb8, 0x01, 0x00, 0x00, 0x00, // mov eax, 1
        0xc3, // ret
    ];
    let app = AppCode::load(jecxz);
    let ctx = Context::new();
    let entry = ctx.translate(app.pc(), TargetStackValidity::Valid);
    assert_eq!(call1(entry, 0), 1);
    assert_eq!(call1(entry, 0x1_0000_0000), 1);
    assert_eq!(call1(entry, 1), 0);
}

#[test]
fn loop_variants() {
    init_logging();
    // loope: count equal bytes... keep it simple: loop with an
    // always-clear ZF exercises loopne; an always-set ZF exercises
    // loope.
    for (opcode, zf_set, expect_iters) in [
        (0xe2u8, false, 5u64), // loop: unconditional on flags
        (0xe1, true, 5),       // loope: continues while ZF
        (0xe0, false, 5),      // loopne: continues while !ZF
    ] {
        let code: Vec<u8> = vec![
            0x48, 0x89, 0xf9, // mov rcx, rdi
            0x31, 0xc0, // xor eax, eax   (sets ZF)
            0xff, 0xc0, // .l: inc eax    (clears ZF)
            if zf_set { 0x83 } else { 0x90 },
            if zf_set { 0xf8 } else { 0x90 },
            if zf_set { 0x00 } else { 0x90 }, // cmp eax, 0 / nops
            opcode, 0xf9, // loopcc .l (back to the inc)
            0xc3, // ret
        ];
        let app = AppCode::load(&code);
        let ctx = Context::new();
        let entry = ctx.translate(app.pc(), TargetStackValidity::Valid);
        let native = call1(app.pc(), expect_iters);
        let translated = call1(entry, expect_iters);
        assert_eq!(native, translated, "opcode {opcode:#x}");
    }
}
