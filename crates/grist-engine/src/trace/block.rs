//! Block variants
//!
//! A block is one node of the trace. Only `Decoded` blocks own
//! instructions; the other variants are placeholders describing how
//! control leaves the trace (future translations, cached code, native
//! code, return sets) or synthesised glue (compensation).

use std::fmt;

use crate::ir::Instr;
use crate::meta::MetaRef;

/// Index of a block within its trace's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub u32);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", self.0)
    }
}

/// A block whose instructions were decoded (and possibly instrumented).
#[derive(Debug)]
pub struct DecodedBlock {
    pub start_pc: u64,
    pub meta: MetaRef,
    /// Owned instruction list; the fragment builder destructively re-homes
    /// these.
    pub instrs: Vec<Instr>,
    /// Trace generation this block was added in.
    pub generation: u32,
}

/// Placeholder for a control-transfer target whose translation does not
/// yet exist (direct: the destination PC is known; indirect: it is only
/// known at runtime).
#[derive(Debug)]
pub struct FutureBlock {
    /// Destination PC for direct futures; zero for indirect ones.
    pub start_pc: u64,
    pub meta: MetaRef,
}

/// A specialised indirect block representing a function return target set.
/// Without metadata the return uses an identity translation; metadata
/// opts the return into edge-based specialisation.
#[derive(Debug)]
pub struct ReturnBlock {
    pub meta: Option<MetaRef>,
}

/// A block already present in the code cache.
#[derive(Debug)]
pub struct CachedBlock {
    pub cache_pc: u64,
    pub meta: MetaRef,
}

/// An address the system has chosen not to translate; execution leaves the
/// cache here.
#[derive(Debug)]
pub struct NativeBlock {
    pub start_pc: u64,
}

/// A synthesised block gluing entry-point (or adapted-register) state onto
/// a target block.
#[derive(Debug)]
pub struct CompensationBlock {
    pub target: BlockId,
    pub meta: MetaRef,
    pub instrs: Vec<Instr>,
}

/// One trace node.
#[derive(Debug)]
pub enum Block {
    Decoded(DecodedBlock),
    DirectFuture(FutureBlock),
    IndirectFuture(FutureBlock),
    Return(ReturnBlock),
    Cached(CachedBlock),
    Native(NativeBlock),
    Compensation(CompensationBlock),
}

impl Block {
    /// The application start PC, where one exists.
    pub fn start_pc(&self) -> Option<u64> {
        match self {
            Block::Decoded(block) => Some(block.start_pc),
            Block::DirectFuture(block) => Some(block.start_pc),
            Block::Native(block) => Some(block.start_pc),
            Block::Cached(block) => Some(block.meta.start_pc()),
            _ => None,
        }
    }

    /// The block's metadata, where one exists.
    pub fn meta(&self) -> Option<&MetaRef> {
        match self {
            Block::Decoded(block) => Some(&block.meta),
            Block::DirectFuture(block) | Block::IndirectFuture(block) => Some(&block.meta),
            Block::Return(block) => block.meta.as_ref(),
            Block::Cached(block) => Some(&block.meta),
            Block::Compensation(block) => Some(&block.meta),
            Block::Native(_) => None,
        }
    }

    /// The decoded payload, if this is a decoded block.
    pub fn as_decoded(&self) -> Option<&DecodedBlock> {
        match self {
            Block::Decoded(block) => Some(block),
            _ => None,
        }
    }

    /// Mutable decoded payload.
    pub fn as_decoded_mut(&mut self) -> Option<&mut DecodedBlock> {
        match self {
            Block::Decoded(block) => Some(block),
            _ => None,
        }
    }
}
