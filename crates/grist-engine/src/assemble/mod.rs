//! The assemble pipeline
//!
//! Lowers a fragment graph to encoded bytes in the code cache, in fixed
//! pass order: relativise PC-relative operands, save/restore flags around
//! instrumentation, schedule virtual registers, allocate spill slots, add
//! connecting jumps, then encode in two passes (stage for exact lengths,
//! commit into one contiguous allocation).

pub mod encode;
pub mod flags;
pub mod jumps;
pub mod relativize;
pub mod schedule;
pub mod slots;

use crate::cache::{CacheError, CodeCache};
use crate::fragment::FragmentList;
use crate::trace::Trace;

/// Error lowering a trace. Fatal for the current translation only: the
/// caller discards the trace and falls back to a native exit at the entry
/// PC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AssembleError {
    /// Register pressure cannot be satisfied with the available slots.
    #[error("virtual register scheduling exhausted {0} slots")]
    SlotExhaustion(u16),
    /// An operand cannot be expressed in any encodable form.
    #[error("unencodable instruction during {0}")]
    Unencodable(&'static str),
    /// The code cache cannot back the encoded trace.
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Tracks spill-slot handouts across the passes; indices are dense and
/// bounded by the per-thread slot table size.
#[derive(Debug)]
pub struct SlotAlloc {
    next: u16,
    limit: u16,
}

impl SlotAlloc {
    pub fn new(limit: u16) -> SlotAlloc {
        SlotAlloc { next: 0, limit }
    }

    pub fn alloc(&mut self) -> Result<u16, AssembleError> {
        if self.next >= self.limit {
            return Err(AssembleError::SlotExhaustion(self.limit));
        }
        let slot = self.next;
        self.next += 1;
        Ok(slot)
    }

    pub fn in_use(&self) -> u16 {
        self.next
    }

    pub fn limit(&self) -> u16 {
        self.limit
    }
}

/// Which successor edges control can actually traverse, indexed
/// fall-through / branch. Pointer-mediated terminators (indirect jumps,
/// ret dispatch, absolute stub jumps) traverse neither: their graph edges
/// are structural.
pub(crate) fn traversed_edges(frags: &FragmentList, id: crate::fragment::FragId) -> [bool; 2] {
    use crate::ir::{OperandKind, Target};
    let Some(code) = frags.node(id).fragment.as_code() else { return [false, false] };
    let Some(at) = code.branch_instr else { return [true, false] };
    let Some(native) = code.instrs[at].as_native() else { return [true, false] };
    match native.class {
        grist_x86::OpClass::Ret => [false, false],
        grist_x86::OpClass::Jmp => {
            let pointer = matches!(native.target(), Some(Target::CachePc(_)))
                || native
                    .explicit_ops()
                    .first()
                    .is_some_and(|op| matches!(op.kind, OperandKind::Mem(_) | OperandKind::Reg(_)));
            if pointer {
                [false, false]
            } else {
                [false, true]
            }
        }
        grist_x86::OpClass::Jcc => [true, true],
        _ => [true, true],
    }
}

/// The encoded result of one trace.
#[derive(Debug, Clone, Copy)]
pub struct Assembled {
    /// Cache address of the entry fragment.
    pub cache_pc: u64,
    /// Total encoded length.
    pub len: usize,
}

/// Run the full pipeline over a fragment graph.
pub fn assemble(
    trace: &mut Trace,
    frags: &mut FragmentList,
    cache: &CodeCache,
    slot_limit: u16,
) -> Result<Assembled, AssembleError> {
    let estimator_pc = cache.estimator_pc()?;
    let mut slot_alloc = SlotAlloc::new(slot_limit);

    relativize::relativize(trace, frags, estimator_pc);
    flags::save_and_restore_flags(frags, &mut slot_alloc)?;
    schedule::schedule_registers(frags, &mut slot_alloc)?;
    slots::allocate_slots(frags, &slot_alloc)?;
    jumps::add_connecting_jumps(frags);
    encode::encode_frags(frags, cache, estimator_pc)
}
