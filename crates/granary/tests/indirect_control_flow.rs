//! Indirect branches through the out-edge machinery: the first
//! execution takes the translator path, later executions hit the
//! materialized compare chain, and new targets extend it.

#![cfg(all(target_arch = "x86_64", target_os = "linux"))]

mod common;

use common::{call2, init_logging, AppCode};
use granary::translate::TargetStackValidity;
use granary::Context;

#[test]
fn indirect_jump_resolves_and_caches() {
    init_logging();
    // entry: jmp rsi    (the second argument is the target)
    // t1:    mov eax, 99; ret
    // t2:    lea eax, [rdi + 1]; ret
    let code: &[u8] = &[
        0xff, 0xe6, // jmp rsi
        0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, // pad
        0xb8, 0x63, 0x00, 0x00, 0x00, // t1 (+8): mov eax, 99
        0xc3, // ret
        0xcc, 0xcc, // pad
        0x8d, 0x47, 0x01, // t2 (+16): lea eax, [rdi + 1]
        0xc3, // ret
    ];
    let app = AppCode::load(code);
    let ctx = Context::new();
    let entry = ctx.translate(app.pc(), TargetStackValidity::Valid);

    let t1 = app.at(8) as u64;
    let t2 = app.at(16) as u64;

    // First hit goes through the translator...
    assert_eq!(call2(entry, 0, t1), 99);
    // ...subsequent hits ride the compare chain.
    assert_eq!(call2(entry, 0, t1), 99);
    assert_eq!(call2(entry, 7, t1), 99);

    // A different runtime target extends the chain.
    assert_eq!(call2(entry, 7, t2), 8);
    assert_eq!(call2(entry, 41, t2), 42);
    assert_eq!(call2(entry, 0, t1), 99);
}

#[test]
fn indirect_call_through_memory() {
    init_logging();
    // A function-pointer call: the pointer cell rides in %rsi.
    //   entry: call qword ptr [rsi]
    //          add eax, 1000
    //          ret
    //   f (+16): lea eax, [rdi + 5]; ret
    let code: &[u8] = &[
        0xff, 0x16, // call [rsi]
        0x05, 0xe8, 0x03, 0x00, 0x00, // add eax, 1000
        0xc3, // ret
        0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, // pad
        0x8d, 0x47, 0x05, // f: lea eax, [rdi + 5]
        0xc3, // ret
    ];
    let app = AppCode::load(code);
    let ctx = Context::new();
    let entry = ctx.translate(app.pc(), TargetStackValidity::Valid);

    let f = app.at(16) as u64;
    let cell = Box::new(f);
    let cell_addr = cell.as_ref() as *const u64 as u64;

    // The callee returns rdi + 5; the (native) return lands back in the
    // caller, which adds 1000.
    assert_eq!(call2(entry, 3, cell_addr), 1008);
    assert_eq!(call2(entry, 10, cell_addr), 1015);
}
