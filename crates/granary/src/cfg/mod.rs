//! Traces: small, locally built control-flow graphs of blocks under
//! translation.

pub mod block;
pub mod factory;
pub mod trace;

pub use block::{Block, BlockId, DecodedBlock, Request};
pub use factory::{BlockFactory, FactoryEnv};
pub use trace::Trace;
