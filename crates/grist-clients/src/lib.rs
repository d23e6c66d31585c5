//! Sample instrumentation clients
//!
//! Small clients exercising the translator's plug-in surface: a block
//! execution counter (injected code + mutable metadata), a memory-operand
//! tracer (pure analysis), and the transparent-return opt-in (indexable
//! metadata driving return specialisation).

pub mod count_blocks;
pub mod memop;
pub mod transparent_rets;

pub use count_blocks::CountBlocks;
pub use memop::MemOpTracer;
pub use transparent_rets::TransparentReturns;
