//! Block factory
//!
//! The factory materialises blocks on demand: it decodes straight-line
//! instruction runs up to the first control-transfer, classifies the
//! terminator's successors into the block taxonomy, and links everything
//! into the trace. Taken targets of direct transfers become future blocks
//! (translated lazily through edge code) unless the cache index already
//! accepts them or the trace already contains the target; fall-throughs
//! are decoded eagerly, up to the trace's block limit.

use std::collections::VecDeque;

use rustc_hash::FxHashMap;

use grist_x86::Category;

use crate::cache::{CacheIndex, Lookup};
use crate::decode::{CodeSource, InstructionDecoder};
use crate::ir::{Annotation, Instr, Instruction, Target};
use crate::meta::{BlockMeta, MetaId, MetaRef, MetaRegistry};
use crate::trace::block::{
    Block, BlockId, CachedBlock, CompensationBlock, DecodedBlock, FutureBlock, NativeBlock, ReturnBlock,
};
use crate::trace::Trace;

/// Builds a trace by materialising blocks on demand.
pub struct BlockFactory<'a> {
    index: &'a CacheIndex,
    registry: &'a MetaRegistry,
    decoder: InstructionDecoder<'a>,
    trace: Trace,
    pending: VecDeque<(BlockId, u64, MetaRef)>,
    by_pc: FxHashMap<u64, BlockId>,
    max_blocks: usize,
    /// Descriptor whose non-zero value opts a block's returns into
    /// edge-based specialisation; identity translation otherwise.
    return_specialization: Option<MetaId>,
}

impl<'a> BlockFactory<'a> {
    pub fn new(
        index: &'a CacheIndex,
        registry: &'a MetaRegistry,
        source: &'a dyn CodeSource,
        max_blocks: usize,
    ) -> BlockFactory<'a> {
        BlockFactory {
            index,
            registry,
            decoder: InstructionDecoder::new(source),
            trace: Trace::new(),
            pending: VecDeque::new(),
            by_pc: FxHashMap::default(),
            max_blocks: max_blocks.max(1),
            return_specialization: registry.id("ret.specialize"),
        }
    }

    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    pub fn trace_mut(&mut self) -> &mut Trace {
        &mut self.trace
    }

    pub fn into_trace(self) -> Trace {
        debug_assert!(self.pending.is_empty());
        self.trace
    }

    /// Request the block for `(pc, meta)` and decode everything pending.
    pub fn request_block(&mut self, pc: u64, meta: BlockMeta) -> BlockId {
        let id = self.request_lazy(pc, meta);
        self.drain();
        id
    }

    /// Request a block without draining; used internally for successors.
    fn request_lazy(&mut self, pc: u64, meta: BlockMeta) -> BlockId {
        if let Some(&existing) = self.by_pc.get(&pc) {
            return existing;
        }
        let roots_trace = self.trace.block_count() == 0;
        match self.index.lookup(self.registry, &meta) {
            Lookup::Accept { cache_pc, meta } => {
                self.trace.add_block(Block::Cached(CachedBlock { cache_pc, meta }))
            }
            Lookup::Adapt { cache_pc, meta: cached_meta } => {
                let cached = self.trace.add_block(Block::Cached(CachedBlock { cache_pc, meta: cached_meta }));
                let comp = self.trace.add_block(Block::Compensation(CompensationBlock {
                    target: cached,
                    meta: MetaRef::new(meta),
                    instrs: Vec::new(),
                }));
                if roots_trace {
                    // The shim, not the adapted translation, roots the
                    // trace.
                    self.trace.set_entry(comp);
                }
                comp
            }
            Lookup::Miss => {
                let meta = MetaRef::new(meta);
                let generation = self.trace.generation();
                let id = self.trace.add_block(Block::Decoded(DecodedBlock {
                    start_pc: pc,
                    meta: meta.clone(),
                    instrs: vec![Instr::Annotation(Annotation::BlockBegin)],
                    generation,
                }));
                self.by_pc.insert(pc, id);
                self.pending.push_back((id, pc, meta));
                id
            }
        }
    }

    /// Add a direct-future placeholder for a target the trace will not
    /// decode this round.
    pub fn request_future(&mut self, pc: u64, meta: BlockMeta) -> BlockId {
        self.trace.add_block(Block::DirectFuture(FutureBlock { start_pc: pc, meta: MetaRef::new(meta) }))
    }

    /// Replace a direct-future block with a materialised translation
    /// (cached, or freshly decoded). Client control-flow instrumentation
    /// calls this to expand successors; it is a no-op on other variants.
    pub fn materialize(&mut self, id: BlockId) {
        let (pc, meta) = match self.trace.block(id) {
            Block::DirectFuture(future) => (future.start_pc, future.meta.clone()),
            _ => return,
        };
        if let Some(&existing) = self.by_pc.get(&pc) {
            // Already decoded in this trace; collapse the future onto it.
            if existing != id {
                let (start_pc, block_meta) = match self.trace.block(existing) {
                    Block::Decoded(block) => (block.start_pc, block.meta.clone()),
                    _ => return,
                };
                debug_assert_eq!(start_pc, pc);
                self.trace.replace_block(
                    id,
                    Block::Compensation(CompensationBlock {
                        target: existing,
                        meta: block_meta,
                        instrs: Vec::new(),
                    }),
                );
            }
            return;
        }
        match self.index.lookup(self.registry, &meta) {
            Lookup::Accept { cache_pc, meta } => {
                self.trace.replace_block(id, Block::Cached(CachedBlock { cache_pc, meta }));
            }
            _ => {
                let generation = self.trace.generation();
                self.trace.replace_block(
                    id,
                    Block::Decoded(DecodedBlock {
                        start_pc: pc,
                        meta: meta.clone(),
                        instrs: vec![Instr::Annotation(Annotation::BlockBegin)],
                        generation,
                    }),
                );
                self.by_pc.insert(pc, id);
                self.pending.push_back((id, pc, meta));
                self.drain();
            }
        }
    }

    /// Replace a future block with a native block: the client (or policy)
    /// has decided execution should leave the cache at this target.
    pub fn make_native(&mut self, id: BlockId) {
        if let Block::DirectFuture(future) = self.trace.block(id) {
            let start_pc = future.start_pc;
            self.trace.replace_block(id, Block::Native(NativeBlock { start_pc }));
        }
    }

    /// Decode every pending block.
    fn drain(&mut self) {
        while let Some((id, pc, meta)) = self.pending.pop_front() {
            let instrs = self.decode_block(pc, &meta);
            if let Block::Decoded(block) = self.trace.block_mut(id) {
                block.instrs = instrs;
            }
        }
    }

    /// Decode one block from `pc` to its terminator and classify the
    /// successors. Returns the complete instruction list.
    fn decode_block(&mut self, start_pc: u64, meta: &MetaRef) -> Vec<Instr> {
        let mut instrs = vec![Instr::Annotation(Annotation::BlockBegin)];
        let mut pc = start_pc;

        loop {
            let (mut instruction, next_pc) = match self.decoder.decode_next(pc) {
                Ok(decoded) => decoded,
                Err(error) => {
                    // Do not follow this path: exit to native at the
                    // faulting PC.
                    tracing::debug!(pc, %error, "decode failed; terminating block natively");
                    let native = self.trace.add_block(Block::Native(NativeBlock { start_pc: pc }));
                    instrs.push(Instr::Native(Box::new(Instruction::jmp_block(native))));
                    return instrs;
                }
            };

            let category = instruction.category;
            if !category.is_control_flow() {
                instrs.push(Instr::Native(Box::new(instruction)));
                pc = next_pc;
                continue;
            }

            match category {
                Category::DirectJump => {
                    let target = self.branch_target(&instruction);
                    let block = self.resolve_direct(target, meta);
                    instruction.set_target(Target::Block(block));
                    instrs.push(Instr::Native(Box::new(instruction)));
                }
                Category::ConditionalJump => {
                    let target = self.branch_target(&instruction);
                    let block = self.resolve_direct(target, meta);
                    instruction.set_target(Target::Block(block));
                    instrs.push(Instr::Native(Box::new(instruction)));
                    self.append_fallthrough(&mut instrs, next_pc, meta);
                }
                Category::DirectCall => {
                    let target = self.branch_target(&instruction);
                    let block = self.resolve_direct(target, meta);
                    instruction.set_target(Target::Block(block));
                    instrs.push(Instr::Native(Box::new(instruction)));
                    self.append_fallthrough(&mut instrs, next_pc, meta);
                }
                Category::IndirectJump => {
                    let block = self.indirect_target(meta);
                    instruction.push_implicit(crate::ir::Operand::explicit(
                        crate::ir::OperandKind::BranchTarget(Target::Block(block)),
                        64,
                        crate::ir::Action::Read,
                    ));
                    instrs.push(Instr::Native(Box::new(instruction)));
                }
                Category::IndirectCall => {
                    let block = self.indirect_target(meta);
                    instruction.push_implicit(crate::ir::Operand::explicit(
                        crate::ir::OperandKind::BranchTarget(Target::Block(block)),
                        64,
                        crate::ir::Action::Read,
                    ));
                    instrs.push(Instr::Native(Box::new(instruction)));
                    self.append_fallthrough(&mut instrs, next_pc, meta);
                }
                Category::Ret => {
                    let block = self.return_target(meta);
                    instruction.push_implicit(crate::ir::Operand::explicit(
                        crate::ir::OperandKind::BranchTarget(Target::Block(block)),
                        64,
                        crate::ir::Action::Read,
                    ));
                    instrs.push(Instr::Native(Box::new(instruction)));
                }
                Category::Syscall | Category::Interrupt => {
                    // Control may not reliably return to the cache; run the
                    // instruction, then leave at the next PC.
                    instrs.push(Instr::Native(Box::new(instruction)));
                    let native = self.trace.add_block(Block::Native(NativeBlock { start_pc: next_pc }));
                    instrs.push(Instr::Native(Box::new(Instruction::jmp_block(native))));
                }
                Category::Normal => unreachable!("non-CTI handled above"),
            }
            return instrs;
        }
    }

    fn branch_target(&self, instruction: &Instruction) -> u64 {
        match instruction.target() {
            Some(Target::AppPc(pc)) => pc,
            other => unreachable!("direct CTI without an app target: {other:?}"),
        }
    }

    /// Resolve the taken target of a direct transfer.
    fn resolve_direct(&mut self, target_pc: u64, src_meta: &MetaRef) -> BlockId {
        if let Some(&existing) = self.by_pc.get(&target_pc) {
            return existing;
        }
        let meta = src_meta.duplicate_for(target_pc);
        match self.index.lookup(self.registry, &meta) {
            Lookup::Accept { cache_pc, meta } => {
                self.trace.add_block(Block::Cached(CachedBlock { cache_pc, meta }))
            }
            Lookup::Adapt { cache_pc, meta: cached_meta } => {
                let cached = self.trace.add_block(Block::Cached(CachedBlock { cache_pc, meta: cached_meta }));
                self.trace.add_block(Block::Compensation(CompensationBlock {
                    target: cached,
                    meta: MetaRef::new(meta),
                    instrs: Vec::new(),
                }))
            }
            Lookup::Miss => {
                self.trace.add_block(Block::DirectFuture(FutureBlock {
                    start_pc: target_pc,
                    meta: MetaRef::new(meta),
                }))
            }
        }
    }

    /// The shared-template indirect successor.
    fn indirect_target(&mut self, src_meta: &MetaRef) -> BlockId {
        let template = src_meta.duplicate_for(0);
        self.trace
            .add_block(Block::IndirectFuture(FutureBlock { start_pc: 0, meta: MetaRef::new(template) }))
    }

    /// The return successor: identity translation unless the block's
    /// metadata opts into specialisation.
    fn return_target(&mut self, src_meta: &MetaRef) -> BlockId {
        let meta = match self.return_specialization {
            Some(id) if src_meta.get(id) != 0 => Some(MetaRef::new(src_meta.duplicate_for(0))),
            _ => None,
        };
        self.trace.add_block(Block::Return(ReturnBlock { meta }))
    }

    /// Terminate a block with a jump to its decoded fall-through (or to a
    /// future block once the trace's block limit is reached).
    fn append_fallthrough(&mut self, instrs: &mut Vec<Instr>, next_pc: u64, meta: &MetaRef) {
        let fallthrough = if self.by_pc.len() < self.max_blocks {
            self.request_lazy(next_pc, meta.duplicate_for(next_pc))
        } else {
            let future_meta = meta.duplicate_for(next_pc);
            self.trace.add_block(Block::DirectFuture(FutureBlock {
                start_pc: next_pc,
                meta: MetaRef::new(future_meta),
            }))
        };
        instrs.push(Instr::Native(Box::new(Instruction::jmp_block(fallthrough))));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::SliceSource;
    use crate::ir::OperandKind;
    use crate::meta::MetaRegistry;

    fn emit_mov_rax_imm(code: &mut Vec<u8>, value: i32) {
        code.extend_from_slice(&[0x48, 0xC7, 0xC0]);
        code.extend_from_slice(&value.to_le_bytes());
    }

    fn factory_for<'a>(
        index: &'a CacheIndex,
        registry: &'a MetaRegistry,
        source: &'a SliceSource,
    ) -> BlockFactory<'a> {
        BlockFactory::new(index, registry, source, 64)
    }

    fn decoded_native_count(trace: &Trace, id: BlockId) -> usize {
        trace
            .block(id)
            .as_decoded()
            .unwrap()
            .instrs
            .iter()
            .filter(|instr| instr.as_native().is_some_and(|native| native.decoded_pc.is_some()))
            .count()
    }

    #[test]
    fn test_straight_line_block_ends_at_ret() {
        let mut code = Vec::new();
        emit_mov_rax_imm(&mut code, 42);
        code.push(0xC3); // ret
        let mut source = SliceSource::new();
        source.map(0x1000, code);

        let index = CacheIndex::new();
        let registry = MetaRegistry::new();
        let mut factory = factory_for(&index, &registry, &source);
        let entry = factory.request_block(0x1000, registry.new_meta(0x1000));
        let trace = factory.into_trace();

        assert_eq!(trace.entry(), entry);
        let block = trace.block(entry).as_decoded().unwrap();
        assert_eq!(block.start_pc, 0x1000);
        assert_eq!(block.meta.start_pc(), 0x1000);
        // mov + ret.
        assert_eq!(decoded_native_count(&trace, entry), 2);
        // Exactly one terminator, and it is last.
        let natives: Vec<_> =
            block.instrs.iter().filter_map(|instr| instr.as_native()).collect();
        assert!(natives.last().unwrap().is_cti());
        assert_eq!(natives.iter().filter(|n| n.is_cti()).count(), 1);
        // The ret resolved to a Return block with identity (no) metadata.
        let target = natives.last().unwrap().target().unwrap();
        match target {
            Target::Block(id) => {
                assert!(matches!(trace.block(id), Block::Return(ReturnBlock { meta: None })));
            }
            other => panic!("unexpected target {other:?}"),
        }
    }

    #[test]
    fn test_conditional_branch_decodes_fallthrough() {
        // 0x1000: jne +2 (to 0x1004); 0x1002: jmp -4 (to 0x1000); 0x1004: ret
        let mut source = SliceSource::new();
        source.map(0x1000, vec![0x75, 0x02, 0xEB, 0xFC, 0xC3]);

        let index = CacheIndex::new();
        let registry = MetaRegistry::new();
        let mut factory = factory_for(&index, &registry, &source);
        let entry = factory.request_block(0x1000, registry.new_meta(0x1000));
        let trace = factory.into_trace();

        let block = trace.block(entry).as_decoded().unwrap();
        let natives: Vec<_> = block.instrs.iter().filter_map(|instr| instr.as_native()).collect();
        // jne + synthetic jmp to the decoded fall-through.
        assert_eq!(natives.len(), 2);
        let taken = match natives[0].target().unwrap() {
            Target::Block(id) => id,
            other => panic!("unexpected {other:?}"),
        };
        // The taken side (0x1004) is not decoded eagerly.
        assert!(matches!(trace.block(taken), Block::DirectFuture(_)));

        let fallthrough = match natives[1].target().unwrap() {
            Target::Block(id) => id,
            other => panic!("unexpected {other:?}"),
        };
        // The fall-through block at 0x1002 is decoded, and its jmp back to
        // 0x1000 closes onto the entry block (a back-edge).
        let ft = trace.block(fallthrough).as_decoded().unwrap();
        assert_eq!(ft.start_pc, 0x1002);
        let back = ft.instrs.iter().filter_map(|instr| instr.as_native()).last().unwrap();
        assert_eq!(back.target(), Some(Target::Block(entry)));
    }

    #[test]
    fn test_cached_target_resolves_to_cached_block() {
        let mut source = SliceSource::new();
        // jmp +0 → 0x2005, then unreachable.
        source.map(0x2000, vec![0xE9, 0x00, 0x00, 0x00, 0x00]);

        let index = CacheIndex::new();
        let registry = MetaRegistry::new();
        // Pretend 0x2005 is already translated.
        index.insert(&registry, MetaRef::new(registry.new_meta(0x2005)), 0xBEEF);

        let mut factory = factory_for(&index, &registry, &source);
        let entry = factory.request_block(0x2000, registry.new_meta(0x2000));
        let trace = factory.into_trace();

        let block = trace.block(entry).as_decoded().unwrap();
        let jmp = block.instrs.iter().filter_map(|instr| instr.as_native()).last().unwrap();
        match jmp.target().unwrap() {
            Target::Block(id) => match trace.block(id) {
                Block::Cached(cached) => assert_eq!(cached.cache_pc, 0xBEEF),
                other => panic!("expected cached block, got {other:?}"),
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_indirect_call_gets_future_and_fallthrough() {
        let mut source = SliceSource::new();
        source.map(0x3000, vec![0xFF, 0xD0, 0xC3]); // call rax; ret

        let index = CacheIndex::new();
        let registry = MetaRegistry::new();
        let mut factory = factory_for(&index, &registry, &source);
        let entry = factory.request_block(0x3000, registry.new_meta(0x3000));
        let trace = factory.into_trace();

        let block = trace.block(entry).as_decoded().unwrap();
        let natives: Vec<_> = block.instrs.iter().filter_map(|instr| instr.as_native()).collect();
        let call = natives[0];
        assert_eq!(call.category, Category::IndirectCall);
        // The implicit successor operand is sticky and points at an
        // indirect future.
        let target_op = call
            .operands
            .iter()
            .find(|op| matches!(op.kind, OperandKind::BranchTarget(_)))
            .unwrap();
        assert!(target_op.sticky);
        match target_op.as_target().unwrap() {
            Target::Block(id) => assert!(matches!(trace.block(id), Block::IndirectFuture(_))),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_syscall_exits_to_native() {
        let mut source = SliceSource::new();
        source.map(0x4000, vec![0x0F, 0x05, 0xC3]); // syscall; ret

        let index = CacheIndex::new();
        let registry = MetaRegistry::new();
        let mut factory = factory_for(&index, &registry, &source);
        let entry = factory.request_block(0x4000, registry.new_meta(0x4000));
        let trace = factory.into_trace();

        let block = trace.block(entry).as_decoded().unwrap();
        let natives: Vec<_> = block.instrs.iter().filter_map(|instr| instr.as_native()).collect();
        assert_eq!(natives[0].class, grist_x86::OpClass::Syscall);
        match natives[1].target().unwrap() {
            Target::Block(id) => match trace.block(id) {
                Block::Native(native) => assert_eq!(native.start_pc, 0x4002),
                other => panic!("expected native, got {other:?}"),
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decode_failure_produces_native_exit() {
        let mut source = SliceSource::new();
        source.map(0x5000, vec![0x90, 0x06]); // nop; invalid

        let index = CacheIndex::new();
        let registry = MetaRegistry::new();
        let mut factory = factory_for(&index, &registry, &source);
        let entry = factory.request_block(0x5000, registry.new_meta(0x5000));
        let trace = factory.into_trace();

        let block = trace.block(entry).as_decoded().unwrap();
        let last = block.instrs.iter().filter_map(|instr| instr.as_native()).last().unwrap();
        match last.target().unwrap() {
            Target::Block(id) => match trace.block(id) {
                Block::Native(native) => assert_eq!(native.start_pc, 0x5001),
                other => panic!("expected native, got {other:?}"),
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_materialize_future() {
        let mut source = SliceSource::new();
        source.map(0x6000, vec![0xEB, 0x03, 0x90, 0x90, 0x90, 0xC3]); // jmp +3; ...; 0x6005: ret

        let index = CacheIndex::new();
        let registry = MetaRegistry::new();
        let mut factory = factory_for(&index, &registry, &source);
        let entry = factory.request_block(0x6000, registry.new_meta(0x6000));

        let taken = {
            let trace = factory.trace();
            let block = trace.block(entry).as_decoded().unwrap();
            let jmp = block.instrs.iter().filter_map(|instr| instr.as_native()).last().unwrap();
            match jmp.target().unwrap() {
                Target::Block(id) => id,
                other => panic!("unexpected {other:?}"),
            }
        };
        assert!(matches!(factory.trace().block(taken), Block::DirectFuture(_)));

        factory.materialize(taken);
        let block = factory.trace().block(taken).as_decoded().unwrap();
        assert_eq!(block.start_pc, 0x6005);
    }

    #[test]
    fn test_make_native() {
        let index = CacheIndex::new();
        let registry = MetaRegistry::new();
        let source = SliceSource::new();
        let mut factory = factory_for(&index, &registry, &source);
        let future = factory.request_future(0x7000, registry.new_meta(0x7000));
        factory.make_native(future);
        assert!(matches!(factory.trace().block(future), Block::Native(_)));
    }
}
