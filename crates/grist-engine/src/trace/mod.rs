//! Blocks and the local control-flow graph
//!
//! The trace (LCFG) is the unit of translation: a directed multigraph of
//! blocks rooted at an entry block, explored on demand by the block
//! factory. Blocks are arena-allocated; every successor reference is a
//! [`BlockId`] index, which makes back-edges natural.

pub mod block;
pub mod factory;
#[allow(clippy::module_inception)]
pub mod trace;

pub use block::{Block, BlockId, CachedBlock, CompensationBlock, DecodedBlock, FutureBlock, NativeBlock, ReturnBlock};
pub use factory::BlockFactory;
pub use trace::Trace;
