//! Block execution counter
//!
//! Registers a mutable metadata descriptor holding a per-block execution
//! count, and injects a `lock add qword [counter], 1` at the head of every
//! decoded block. The counter cell is the block's own metadata slot, so
//! the count survives for as long as the translation does.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use grist_engine::client::Client;
use grist_engine::ir::{
    Action, Instr, Instruction, MemOperand, Operand, OperandKind, VirtReg,
};
use grist_engine::meta::{CompareMode, MetaError, MetaId, MetaKind, MetaRef, MetaRegistry};
use grist_engine::trace::{BlockId, Trace};
use grist_engine::InitReason;
use grist_x86::OpClass;

/// The execution-counting client.
#[derive(Default)]
pub struct CountBlocks {
    counter_id: Mutex<Option<MetaId>>,
    /// Blocks seen at instrumentation time, for later inspection.
    blocks: Mutex<FxHashMap<u64, MetaRef>>,
}

impl CountBlocks {
    pub fn new() -> CountBlocks {
        CountBlocks::default()
    }

    /// Executions recorded for the block at `start_pc`.
    pub fn executions(&self, start_pc: u64) -> u64 {
        let id = self.counter_id.lock().expect("client initialised");
        self.blocks
            .lock()
            .get(&start_pc)
            .and_then(|meta| meta.mutable(id))
            .map(|cell| cell.load(std::sync::atomic::Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Number of distinct blocks instrumented.
    pub fn blocks_seen(&self) -> usize {
        self.blocks.lock().len()
    }
}

impl Client for CountBlocks {
    fn on_init(&self, _reason: InitReason, registry: &mut MetaRegistry) -> Result<(), MetaError> {
        let id = registry.register("count_blocks.execs", MetaKind::Mutable, CompareMode::Exact, 0)?;
        *self.counter_id.lock() = Some(id);
        Ok(())
    }

    fn on_instrument_block(&self, trace: &mut Trace, block: BlockId) {
        let Some(id) = *self.counter_id.lock() else { return };
        let Some(decoded) = trace.block(block).as_decoded() else { return };
        let meta = decoded.meta.clone();
        let Some(cell) = meta.mutable(id) else { return };
        let cell_addr = cell as *const _ as u64;
        self.blocks.lock().insert(decoded.start_pc, meta.clone());

        // mov v, &cell ; lock add qword [v], 1
        let v = trace.alloc_virt_reg();
        let load = Instruction::mov_ri(v, cell_addr as i64);
        let mut bump = Instruction::synthesised(OpClass::Add, 64);
        bump.push_explicit(Operand::explicit(
            OperandKind::Mem(MemOperand::Indirect { base: v }),
            64,
            Action::ReadWrite,
        ));
        bump.push_explicit(Operand::explicit(OperandKind::Imm(1), 64, Action::Read));
        bump.push_implicit(Operand::explicit(OperandKind::Reg(VirtReg::Flags), 8, Action::Write));
        bump.prefixes.lock = true;
        bump.is_atomic = true;

        let decoded = trace.block_mut(block).as_decoded_mut().expect("decoded block");
        // After the block-begin annotation, before any application
        // instruction.
        decoded.instrs.insert(1, Instr::Native(Box::new(bump)));
        decoded.instrs.insert(1, Instr::Native(Box::new(load)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grist_engine::meta::MetaRegistry;
    use grist_engine::trace::{Block, DecodedBlock};
    use grist_engine::ir::Annotation;

    #[test]
    fn test_injects_counter_bump() {
        let client = CountBlocks::new();
        let mut registry = MetaRegistry::new();
        client.on_init(InitReason::Program, &mut registry).unwrap();

        let mut trace = Trace::new();
        let meta = MetaRef::new(registry.new_meta(0x1000));
        let block = trace.add_block(Block::Decoded(DecodedBlock {
            start_pc: 0x1000,
            meta,
            instrs: vec![Instr::Annotation(Annotation::BlockBegin)],
            generation: 0,
        }));

        client.on_instrument_block(&mut trace, block);

        let decoded = trace.block(block).as_decoded().unwrap();
        assert_eq!(decoded.instrs.len(), 3);
        let load = decoded.instrs[1].as_native().unwrap();
        assert_eq!(load.class, OpClass::Mov);
        let bump = decoded.instrs[2].as_native().unwrap();
        assert_eq!(bump.class, OpClass::Add);
        assert!(bump.prefixes.lock);
        assert!(bump.is_atomic);
        assert!(!bump.is_app);
        assert_eq!(client.blocks_seen(), 1);
        assert_eq!(client.executions(0x1000), 0);
    }
}
