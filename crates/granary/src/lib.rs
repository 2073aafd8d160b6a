//! Granary: a dynamic binary translation core for x86-64.
//!
//! Granary takes over execution of running machine code by decoding it,
//! one basic block at a time, into a mutable instruction IR; rewriting the
//! instructions the register allocator cannot reason about; assigning
//! architectural registers to the virtual registers introduced along the
//! way; and encoding the result into an executable code cache. Blocks in
//! the cache are chained together by small *edge* stubs that patch
//! themselves out of the hot path once their targets are translated.
//!
//! The main entry point is [`Context`]: build one with
//! [`Context::new`], then ask it to [`Context::translate`] an application
//! program counter. The returned cache address can be executed in place
//! of the original code.

pub mod arch;
pub mod cache;
pub mod cfg;
pub mod code;
pub mod context;
pub mod edge;
pub mod index;
pub mod metadata;
pub mod opts;
pub mod os;
pub mod translate;

pub use context::Context;
pub use opts::Options;
pub use translate::{TranslateError, TranslateResult};

/// Address of an instruction in the original application code.
pub type AppPc = usize;

/// Address of an instruction in Granary's code cache.
pub type CachePc = usize;

/// Native page granularity assumed by the cache and the OS layer.
pub const PAGE_SIZE: usize = 4096;

/// Bytes of stack below `%rsp` that the System V ABI reserves for leaf
/// functions. Generated code steps past this before borrowing the stack.
pub const REDZONE_SIZE: i32 = 128;
