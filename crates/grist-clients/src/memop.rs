//! Memory-operand tracer
//!
//! A pure-analysis client: walks every decoded block and records how many
//! explicit memory-writing operands it contains, both in a mutable
//! metadata slot and in a client-side table keyed by start PC. No code is
//! injected.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use grist_engine::client::Client;
use grist_engine::ir::OperandKind;
use grist_engine::meta::{CompareMode, MetaError, MetaId, MetaKind, MetaRegistry};
use grist_engine::trace::{BlockId, Trace};
use grist_engine::InitReason;

/// Counts explicit memory writes per block.
#[derive(Default)]
pub struct MemOpTracer {
    writes_id: Mutex<Option<MetaId>>,
    writes: Mutex<FxHashMap<u64, u64>>,
}

impl MemOpTracer {
    pub fn new() -> MemOpTracer {
        MemOpTracer::default()
    }

    /// Memory-writing operands observed in the block at `start_pc`.
    pub fn writes_in(&self, start_pc: u64) -> u64 {
        self.writes.lock().get(&start_pc).copied().unwrap_or(0)
    }
}

impl Client for MemOpTracer {
    fn on_init(&self, _reason: InitReason, registry: &mut MetaRegistry) -> Result<(), MetaError> {
        let id = registry.register("memop.writes", MetaKind::Mutable, CompareMode::Exact, 0)?;
        *self.writes_id.lock() = Some(id);
        Ok(())
    }

    fn on_instrument_block(&self, trace: &mut Trace, block: BlockId) {
        let Some(decoded) = trace.block(block).as_decoded() else { return };
        let mut count = 0u64;
        for instr in &decoded.instrs {
            let Some(native) = instr.as_native() else { continue };
            if !native.is_app {
                continue;
            }
            for op in native.explicit_ops() {
                if matches!(op.kind, OperandKind::Mem(_)) && op.action.writes() {
                    count += 1;
                }
            }
        }
        if let Some(id) = *self.writes_id.lock() {
            if let Some(cell) = decoded.meta.mutable(id) {
                cell.store(count, std::sync::atomic::Ordering::Relaxed);
            }
        }
        self.writes.lock().insert(decoded.start_pc, count);
    }
}
