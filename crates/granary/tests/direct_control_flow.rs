//! End-to-end translation of hand-assembled functions with direct
//! control flow: straight-line code, conditional branches, recursion,
//! loops, and tail calls all run from the code cache and must behave
//! exactly like the native code.

#![cfg(all(target_arch = "x86_64", target_os = "linux"))]

mod common;

use common::{call1, call2, call7, init_logging, AppCode};
use granary::translate::TargetStackValidity;
use granary::Context;

/// `fib(n)`, recursive, argument in `%edi`.
const FIB: &[u8] = &[
    0x83, 0xff, 0x02, // cmp edi, 2
    0x72, 0x1a, // jb .base (+0x1a -> 0x1f)
    0x57, // push rdi
    0xff, 0xcf, // dec edi
    0xe8, 0xf3, 0xff, 0xff, 0xff, // call fib
    0x5f, // pop rdi
    0x50, // push rax
    0x83, 0xef, 0x02, // sub edi, 2
    0xe8, 0xe9, 0xff, 0xff, 0xff, // call fib
    0x5a, // pop rdx
    0x48, 0x01, 0xd0, // add rax, rdx
    0xc3, // ret
    0x0f, 0x1f, 0x00, // nop padding
    0x89, 0xf8, // .base: mov eax, edi
    0xc3, // ret
];

/// `fact(n)`, iterative, argument in `%edi`.
const FACT: &[u8] = &[
    0xb8, 0x01, 0x00, 0x00, 0x00, // mov eax, 1
    0x83, 0xff, 0x01, // cmp edi, 1
    0x76, 0x0a, // jbe .done
    0x0f, 0xaf, 0xc7, // .loop: imul eax, edi
    0xff, 0xcf, // dec edi
    0x83, 0xff, 0x01, // cmp edi, 1
    0x77, 0xf6, // ja .loop
    0xc3, // .done: ret
];

#[test]
fn recursive_fibonacci() {
    init_logging();
    let app = AppCode::load(FIB);
    let ctx = Context::new();
    let entry = ctx.translate(app.pc(), TargetStackValidity::Valid);
    let expect = [0u64, 1, 1, 2, 3, 5, 8, 13, 21, 34];
    for (n, &want) in expect.iter().enumerate() {
        assert_eq!(call1(entry, n as u64), want, "fib({n})");
    }
}

#[test]
fn iterative_factorial() {
    init_logging();
    let app = AppCode::load(FACT);
    let ctx = Context::new();
    let entry = ctx.translate(app.pc(), TargetStackValidity::Valid);
    let expect = [1u64, 1, 2, 6, 24, 120, 720, 5040, 40320, 362880];
    for (n, &want) in expect.iter().enumerate() {
        assert_eq!(call1(entry, n as u64), want, "fact({n})");
    }
}

#[test]
fn translation_is_idempotent() {
    init_logging();
    let app = AppCode::load(FACT);
    let ctx = Context::new();
    let first = ctx.translate(app.pc(), TargetStackValidity::Valid);
    let used = ctx.block_cache.bytes_allocated();
    let second = ctx.translate(app.pc(), TargetStackValidity::Valid);
    assert_eq!(first, second);
    assert_eq!(
        used,
        ctx.block_cache.bytes_allocated(),
        "second request must not grow the block arena"
    );
}

#[test]
fn tail_call_keeps_the_frame_flat() {
    init_logging();
    // entry: jmp helper; helper: lea rax, [rsp]; ret
    // The helper leaks the callee-side stack pointer so the test can
    // confirm the tail call added no frame.
    let code: &[u8] = &[
        0xe9, 0x03, 0x00, 0x00, 0x00, // jmp +3 (helper)
        0xcc, 0xcc, 0xcc, // padding
        0x48, 0x8d, 0x04, 0x24, // helper: lea rax, [rsp]
        0xc3, // ret
    ];
    let app = AppCode::load(code);
    let ctx = Context::new();

    let native_sp = call1(app.pc(), 0);
    let entry = ctx.translate(app.pc(), TargetStackValidity::Valid);
    let translated_sp = call1(entry, 0);
    // Same call depth natively and translated: the jump must not have
    // pushed anything.
    assert_eq!(native_sp, translated_sp);
}

#[test]
fn loop_instruction_counts_iterations() {
    init_logging();
    // Returns its argument by counting down with LOOP.
    let code: &[u8] = &[
        0x89, 0xf9, // mov ecx, edi
        0x31, 0xc0, // xor eax, eax
        0xff, 0xc0, // .l: inc eax
        0xe2, 0xfc, // loop .l
        0xc3, // ret
    ];
    let app = AppCode::load(code);
    let ctx = Context::new();
    let entry = ctx.translate(app.pc(), TargetStackValidity::Valid);
    for n in 1..=17u64 {
        assert_eq!(call1(entry, n), n, "loop count {n}");
    }
}

#[test]
fn stack_arguments_stay_visible() {
    init_logging();
    // Sums six register arguments and one stack argument; the stack
    // read exercises the adjusted-region rewriting.
    let code: &[u8] = &[
        0x8d, 0x04, 0x37, // lea eax, [rdi + rsi]
        0x01, 0xd0, // add eax, edx
        0x01, 0xc8, // add eax, ecx
        0x44, 0x01, 0xc0, // add eax, r8d
        0x44, 0x01, 0xc8, // add eax, r9d
        0x03, 0x44, 0x24, 0x08, // add eax, [rsp + 8]
        0xc3, // ret
    ];
    let app = AppCode::load(code);
    let ctx = Context::new();
    let entry = ctx.translate(app.pc(), TargetStackValidity::Valid);
    assert_eq!(call7(app.pc(), [3, 3, 3, 0, 0, 0], 0), 9);
    assert_eq!(call7(entry, [3, 3, 3, 0, 0, 0], 0), 9);
    assert_eq!(call7(entry, [3, 3, 3, 3, 3, 3], 18 - 15), 21);
    assert_eq!(call7(entry, [1, 2, 3, 4, 5, 6], 7), 28);
}

#[test]
fn conditional_calls_both_ways() {
    init_logging();
    // max(a, b) via cmp/jae.
    let code: &[u8] = &[
        0x48, 0x39, 0xf7, // cmp rdi, rsi
        0x73, 0x04, // jae +4
        0x48, 0x89, 0xf0, // mov rax, rsi
        0xc3, // ret
        0x48, 0x89, 0xf8, // mov rax, rdi
        0xc3, // ret
    ];
    let app = AppCode::load(code);
    let ctx = Context::new();
    let entry = ctx.translate(app.pc(), TargetStackValidity::Valid);
    assert_eq!(call2(entry, 3, 9), 9);
    assert_eq!(call2(entry, 9, 3), 9);
    assert_eq!(call2(entry, 5, 5), 5);
}
