//! The process-wide context
//!
//! Owns everything that would otherwise be a global: the code caches, the
//! block-metadata index, the client and metadata registries, and the edge
//! lists. `translate` is the single entry into the pipeline: decode →
//! instrument → fragment → assemble → publish → (lazily) patch.
//!
//! Contexts are handed out as `Arc`s because edge stubs embed a raw
//! pointer back to their context; the allocation address must outlive
//! every stub.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::assemble;
use crate::cache::{CacheError, CacheIndex, CodeCache, Lookup};
use crate::client::{Client, ClientError, ClientRegistry, InitReason};
use crate::decode::{CodeSource, NativeSource};
use crate::edge::{
    emit_direct_edge, emit_indirect_edge, DirectEdge, EdgeHost, IndirectEdge,
};
use crate::fragment::FragmentBuilder;
use crate::meta::{BlockMeta, MetaError, MetaRef, MetaRegistry};
use crate::trace::BlockFactory;

/// Tunables for one context.
#[derive(Debug, Clone, Copy)]
pub struct Options {
    /// Pages per block-cache slab.
    pub cache_slab_pages: usize,
    /// Pages per edge-cache slab.
    pub edge_slab_pages: usize,
    /// Executions after which a direct edge's entry jump is
    /// short-circuited to the destination.
    pub patch_threshold: u32,
    /// Buckets per indirect-edge target table (power of two).
    pub indirect_buckets: usize,
    /// Per-thread spill-slot table size.
    pub slot_count: u16,
    /// Blocks eagerly decoded per trace before fall-throughs degrade to
    /// future blocks.
    pub max_trace_blocks: usize,
    /// Instrumentation rounds per trace before settling.
    pub max_instrument_rounds: u32,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            cache_slab_pages: 8,
            edge_slab_pages: 2,
            patch_threshold: 8,
            indirect_buckets: 512,
            slot_count: 32,
            max_trace_blocks: 16,
            max_instrument_rounds: 8,
        }
    }
}

/// Error surfaced by `translate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TranslateError {
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Process-wide translator state.
pub struct Context {
    options: Options,
    registry: RwLock<MetaRegistry>,
    clients: RwLock<ClientRegistry>,
    source: Box<dyn CodeSource + Send + Sync>,
    block_cache: CodeCache,
    edge_cache: CodeCache,
    index: CacheIndex,
    direct_edges: Mutex<Vec<Arc<DirectEdge>>>,
    indirect_edges: Mutex<Vec<Arc<IndirectEdge>>>,
    native_exits: Mutex<FxHashMap<u64, u64>>,
    log: Mutex<String>,
    started: AtomicBool,
}

impl Context {
    /// A context reading application code directly from process memory.
    pub fn new(options: Options) -> Arc<Context> {
        Context::with_source(options, Box::new(NativeSource))
    }

    /// A context reading application code through an explicit source
    /// (tests model partially mapped code this way).
    pub fn with_source(options: Options, source: Box<dyn CodeSource + Send + Sync>) -> Arc<Context> {
        Arc::new(Context {
            options,
            registry: RwLock::new(MetaRegistry::new()),
            clients: RwLock::new(ClientRegistry::new()),
            source,
            block_cache: CodeCache::new(options.cache_slab_pages),
            edge_cache: CodeCache::new(options.edge_slab_pages),
            index: CacheIndex::new(),
            direct_edges: Mutex::new(Vec::new()),
            indirect_edges: Mutex::new(Vec::new()),
            native_exits: Mutex::new(FxHashMap::default()),
            log: Mutex::new(String::new()),
            started: AtomicBool::new(false),
        })
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Register an instrumentation client. Fails once translation has
    /// started.
    pub fn register_client(&self, name: &str, client: Box<dyn Client>) -> Result<(), ClientError> {
        if self.started.load(Ordering::Acquire) {
            return Err(ClientError::RegistrationClosed);
        }
        self.clients.write().register(name, client)
    }

    /// Run every client's init hook (clients register metadata here).
    pub fn init_clients(&self, reason: InitReason) -> Result<(), MetaError> {
        let clients = self.clients.read();
        let mut registry = self.registry.write();
        for (name, client) in clients.iter() {
            tracing::debug!(name, ?reason, "client init");
            client.on_init(reason, &mut registry)?;
        }
        Ok(())
    }

    /// Run every client's exit hook.
    pub fn exit_clients(&self, reason: InitReason) {
        for (_, client) in self.clients.read().iter() {
            client.on_exit(reason);
        }
    }

    /// Append to the context log (drained by the command channel).
    pub fn log(&self, line: &str) {
        let mut log = self.log.lock();
        log.push_str(line);
        log.push('\n');
    }

    /// Drain the context log.
    pub fn drain_log(&self) -> String {
        std::mem::take(&mut *self.log.lock())
    }

    /// The cache index (exposed for instrumentation and tests).
    pub fn index(&self) -> &CacheIndex {
        &self.index
    }

    /// Live direct edges.
    pub fn direct_edges(&self) -> Vec<Arc<DirectEdge>> {
        self.direct_edges.lock().clone()
    }

    /// Live indirect edges.
    pub fn indirect_edges(&self) -> Vec<Arc<IndirectEdge>> {
        self.indirect_edges.lock().clone()
    }

    /// Translate the block at `app_pc` and return its cache PC.
    pub fn translate(&self, app_pc: u64) -> Result<u64, TranslateError> {
        let meta = {
            self.start();
            self.registry.read().new_meta(app_pc)
        };
        self.translate_meta(meta)
    }

    /// Translate for explicit metadata (edge resolution path).
    pub fn translate_meta(&self, meta: BlockMeta) -> Result<u64, TranslateError> {
        self.start();
        let registry = self.registry.read();

        if let Lookup::Accept { cache_pc, .. } = self.index.lookup(&registry, &meta) {
            return Ok(cache_pc);
        }

        let app_pc = meta.start_pc();
        let mut factory =
            BlockFactory::new(&self.index, &registry, &*self.source, self.options.max_trace_blocks);
        let entry = factory.request_block(app_pc, meta);

        // A cached (or adapted) hit at the entry needs no new encoding.
        match factory.trace().block(entry) {
            crate::trace::Block::Cached(cached) => return Ok(cached.cache_pc),
            _ => {}
        }

        // Instrumentation, iterated to fixed point. Each round instruments
        // the blocks added in the previous round (tracked by generation),
        // then lets clients materialise further successors.
        {
            let clients = self.clients.read();
            if !clients.is_empty() {
                for _ in 0..self.options.max_instrument_rounds {
                    let generation = factory.trace().generation();
                    let decoded: Vec<_> = factory
                        .trace()
                        .blocks()
                        .filter_map(|(id, block)| match block {
                            crate::trace::Block::Decoded(decoded)
                                if decoded.generation == generation =>
                            {
                                Some(id)
                            }
                            _ => None,
                        })
                        .collect();
                    for id in decoded {
                        for (_, client) in clients.iter() {
                            client.on_instrument_block(factory.trace_mut(), id);
                        }
                    }
                    // Blocks materialised from here on belong to the next
                    // round.
                    factory.trace_mut().bump_generation();
                    let before = factory.trace().block_count();
                    for (_, client) in clients.iter() {
                        client.on_instrument_control_flow(&mut factory);
                    }
                    if factory.trace().block_count() == before {
                        break;
                    }
                }
            }
        }

        let mut trace = factory.into_trace();
        let entry_meta = trace
            .block(entry)
            .meta()
            .cloned()
            .unwrap_or_else(|| MetaRef::new(registry.new_meta(app_pc)));

        let mut frags = FragmentBuilder::new(&mut trace, self).build();

        match assemble::assemble(&mut trace, &mut frags, &self.block_cache, self.options.slot_count) {
            Ok(assembled) => {
                // Insertion arbitrates duplicate translations: a racing
                // winner's cache PC is adopted and ours is discarded.
                let published = self.index.insert(&registry, entry_meta, assembled.cache_pc);
                tracing::debug!(app_pc, cache_pc = published, "translation published");
                Ok(published)
            }
            Err(error) => {
                // The trace is discarded; execution continues natively at
                // the entry PC.
                tracing::warn!(app_pc, %error, "translation discarded");
                self.log(&format!("translate {app_pc:#x} failed: {error}"));
                Ok(self.native_exit(app_pc)?)
            }
        }
    }

    /// Translate an entry point into instrumented execution: a
    /// compensation block is glued in front of the block at `app_pc`, and
    /// clients fill it with entry-point state transfer.
    pub fn translate_entry_point(
        &self,
        app_pc: u64,
        kind: crate::client::EntryPointKind,
        category: u32,
    ) -> Result<u64, TranslateError> {
        self.start();
        let registry = self.registry.read();
        let meta = registry.new_meta(app_pc);

        let mut factory =
            BlockFactory::new(&self.index, &registry, &*self.source, self.options.max_trace_blocks);
        let entry = factory.request_block(app_pc, meta);
        let comp_meta = MetaRef::new(registry.new_meta(app_pc));
        let comp = factory.trace_mut().add_block(crate::trace::Block::Compensation(
            crate::trace::CompensationBlock { target: entry, meta: comp_meta.clone(), instrs: Vec::new() },
        ));
        factory.trace_mut().set_entry(comp);

        {
            let clients = self.clients.read();
            for (_, client) in clients.iter() {
                client.on_instrument_entry_point(&mut factory, comp, kind, category);
            }
        }

        let mut trace = factory.into_trace();
        let mut frags = FragmentBuilder::new(&mut trace, self).build();
        match assemble::assemble(&mut trace, &mut frags, &self.block_cache, self.options.slot_count) {
            Ok(assembled) => {
                tracing::debug!(app_pc, ?kind, cache_pc = assembled.cache_pc, "entry point translated");
                Ok(assembled.cache_pc)
            }
            Err(error) => {
                tracing::warn!(app_pc, %error, "entry-point translation discarded");
                Ok(self.native_exit(app_pc)?)
            }
        }
    }

    /// Host notification that application code was overwritten or
    /// unloaded: stale the overlapping translations and re-point their
    /// future executions at native exits.
    pub fn invalidate(&self, app_pc: u64, len: u64) -> Result<(), TranslateError> {
        let stale = self.index.invalidate_range(app_pc, len);
        if stale.is_empty() {
            return Ok(());
        }
        tracing::debug!(app_pc, len, blocks = stale.len(), "invalidated");
        // Any direct edge resolved into the stale range is re-pointed at a
        // native exit for the same application PC; unresolved edges will
        // translate freshly and miss the stale index entries.
        let edges: Vec<Arc<DirectEdge>> = self.direct_edges.lock().clone();
        for edge in edges {
            let exit = edge.exit_target();
            if let Some(&(stale_app, _)) = stale.iter().find(|&&(_, cache)| cache == exit) {
                let native = self.native_exit(stale_app)?;
                edge.publish_exit(native);
                edge.publish_entry(native);
            }
        }
        Ok(())
    }

    /// A 14-byte `jmp [rip+0]; dq app_pc` trampoline leaving the cache,
    /// deduplicated per target.
    pub fn native_exit(&self, app_pc: u64) -> Result<u64, CacheError> {
        let mut exits = self.native_exits.lock();
        if let Some(&pc) = exits.get(&app_pc) {
            return Ok(pc);
        }
        let pc = self.block_cache.allocate(14)?;
        let mut bytes = vec![0xFF, 0x25, 0x00, 0x00, 0x00, 0x00];
        bytes.extend_from_slice(&app_pc.to_le_bytes());
        // Safety: fresh 14-byte allocation.
        unsafe { crate::cache::write_code(pc, &bytes) };
        exits.insert(app_pc, pc);
        Ok(pc)
    }

    fn start(&self) {
        if !self.started.swap(true, Ordering::AcqRel) {
            self.registry.write().seal();
        }
    }

    fn as_host(&self) -> usize {
        self as *const Context as usize
    }
}

impl EdgeHost for Context {
    fn allocate_direct_edge(
        &self,
        source_meta: Option<MetaRef>,
        dest_meta: MetaRef,
    ) -> Result<Arc<DirectEdge>, CacheError> {
        let edge = emit_direct_edge(
            &self.edge_cache,
            source_meta,
            dest_meta,
            direct_edge_entry,
            self.as_host(),
            self.options.patch_threshold,
        )?;
        self.direct_edges.lock().push(edge.clone());
        Ok(edge)
    }

    fn allocate_indirect_edge(&self, template_meta: MetaRef) -> Result<Arc<IndirectEdge>, CacheError> {
        let edge = emit_indirect_edge(
            &self.edge_cache,
            template_meta,
            indirect_edge_entry,
            self.as_host(),
            self.options.indirect_buckets,
        )?;
        self.indirect_edges.lock().push(edge.clone());
        Ok(edge)
    }
}

/// Direct-edge slow path, called from stub code with the application state
/// saved. Translates the destination (or adopts a concurrent winner),
/// publishes `exit_target`, counts the execution, and short-circuits
/// `entry_target` past the patch threshold.
///
/// # Safety
/// `edge` must be a live `DirectEdge` whose host is a live `Context`.
pub unsafe extern "C" fn direct_edge_entry(edge: *const DirectEdge) {
    let edge = &*edge;
    let ctx = &*(edge.host as *const Context);

    let result = catch_unwind(AssertUnwindSafe(|| {
        let dest_meta = edge.dest_meta.lock().clone();
        let target = match dest_meta {
            Some(meta) => {
                let resolved = match ctx.translate_meta(meta.duplicate()) {
                    Ok(pc) => Ok(pc),
                    Err(_) => ctx.native_exit(meta.start_pc()).map_err(TranslateError::from),
                };
                if resolved.is_ok() {
                    *edge.dest_meta.lock() = None;
                }
                resolved
            }
            // Already resolved by a racing thread: republish its value.
            None => Ok(edge.exit_target()),
        };
        if let Ok(target) = target {
            edge.publish_exit(target);
            let count = edge.record_execution();
            if count >= edge.patch_threshold {
                edge.publish_entry(edge.exit_target());
            }
        }
    }));
    if result.is_err() {
        // Never unwind into generated code. Leave the edge unpatched; the
        // stub will re-enter on the next execution.
        tracing::error!("panic in direct edge entrypoint");
    }
}

/// Indirect-edge miss path: resolve `target_pc`, teach the edge's table,
/// and return the cache PC the stub dispatches to.
///
/// # Safety
/// `edge` must be a live `IndirectEdge` whose host is a live `Context`.
pub unsafe extern "C" fn indirect_edge_entry(edge: *const IndirectEdge, target_pc: u64) -> u64 {
    let edge = &*edge;
    let ctx = &*(edge.host as *const Context);

    let result = catch_unwind(AssertUnwindSafe(|| {
        let meta = edge.template_meta.duplicate_for(target_pc);
        let cache_pc = match ctx.translate_meta(meta) {
            Ok(pc) => pc,
            Err(_) => ctx.native_exit(target_pc)?,
        };
        edge.insert(target_pc, cache_pc);
        Ok::<u64, CacheError>(cache_pc)
    }));
    match result {
        Ok(Ok(pc)) => pc,
        _ => {
            tracing::error!(target_pc, "indirect edge resolution failed");
            // Fall back to native execution of the target.
            ctx.native_exit(target_pc).unwrap_or(target_pc)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::SliceSource;

    fn context_with_code(base: u64, bytes: Vec<u8>) -> Arc<Context> {
        let mut source = SliceSource::new();
        source.map(base, bytes);
        Context::with_source(Options::default(), Box::new(source))
    }

    #[test]
    fn test_translate_straight_line() {
        // mov rax, 42 ; ret
        let mut code = vec![0x48, 0xC7, 0xC0];
        code.extend_from_slice(&42i32.to_le_bytes());
        code.push(0xC3);
        let ctx = context_with_code(0x1000, code);

        let cache_pc = ctx.translate(0x1000).unwrap();
        assert_ne!(cache_pc, 0);
        // Published: a second request returns the same translation.
        assert_eq!(ctx.translate(0x1000).unwrap(), cache_pc);
        assert_eq!(ctx.index().live_entries(), 1);
    }

    #[test]
    fn test_translate_decode_failure_is_contained() {
        // nop; then bytes the codec rejects.
        let ctx = context_with_code(0x2000, vec![0x90, 0x06]);
        let cache_pc = ctx.translate(0x2000).unwrap();
        assert_ne!(cache_pc, 0);
    }

    #[test]
    fn test_native_exit_trampoline_shape() {
        let ctx = context_with_code(0x3000, vec![0xC3]);
        let pc = ctx.native_exit(0x1122334455667788).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(pc as *const u8, 14) };
        assert_eq!(&bytes[..6], &[0xFF, 0x25, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(u64::from_le_bytes(bytes[6..14].try_into().unwrap()), 0x1122334455667788);
        // Deduplicated.
        assert_eq!(ctx.native_exit(0x1122334455667788).unwrap(), pc);
    }

    #[test]
    fn test_invalidate_stales_index() {
        let mut code = vec![0x48, 0xC7, 0xC0];
        code.extend_from_slice(&7i32.to_le_bytes());
        code.push(0xC3);
        let ctx = context_with_code(0x4000, code);
        let first = ctx.translate(0x4000).unwrap();
        ctx.invalidate(0x4000, 0x100).unwrap();
        assert_eq!(ctx.index().live_entries(), 0);
        // Retranslation produces a fresh block.
        let second = ctx.translate(0x4000).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_registration_closes_at_first_translation() {
        struct Nop;
        impl Client for Nop {}
        let ctx = context_with_code(0x5000, vec![0xC3]);
        ctx.register_client("early", Box::new(Nop)).unwrap();
        ctx.translate(0x5000).unwrap();
        assert!(matches!(
            ctx.register_client("late", Box::new(Nop)),
            Err(ClientError::RegistrationClosed)
        ));
    }

    #[test]
    fn test_entry_point_translation_runs_compensation_hook() {
        use crate::client::EntryPointKind;
        use std::sync::atomic::{AtomicU32, Ordering};

        #[derive(Default)]
        struct EntryProbe(AtomicU32);
        impl Client for EntryProbe {
            fn on_instrument_entry_point(
                &self,
                factory: &mut crate::trace::BlockFactory<'_>,
                compensation: crate::trace::BlockId,
                kind: EntryPointKind,
                _category: u32,
            ) {
                assert_eq!(kind, EntryPointKind::UserAttach);
                assert!(matches!(
                    factory.trace().block(compensation),
                    crate::trace::Block::Compensation(_)
                ));
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let ctx = context_with_code(0x7000, vec![0xC3]);
        let probe = std::sync::Arc::new(EntryProbe::default());
        struct Fwd(std::sync::Arc<EntryProbe>);
        impl Client for Fwd {
            fn on_instrument_entry_point(
                &self,
                factory: &mut crate::trace::BlockFactory<'_>,
                compensation: crate::trace::BlockId,
                kind: EntryPointKind,
                category: u32,
            ) {
                self.0.on_instrument_entry_point(factory, compensation, kind, category)
            }
        }
        ctx.register_client("probe", Box::new(Fwd(probe.clone()))).unwrap();

        let pc = ctx.translate_entry_point(0x7000, EntryPointKind::UserAttach, 0).unwrap();
        assert_ne!(pc, 0);
        assert_eq!(probe.0.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_translation_with_call_allocates_direct_edge() {
        // call +0 (to 0x6005) ; ret ; target: ret
        let mut code = vec![0xE8, 0x00, 0x00, 0x00, 0x00, 0xC3];
        code.push(0xC3); // 0x6006, unused
        let ctx = context_with_code(0x6000, code);
        ctx.translate(0x6000).unwrap();
        let edges = ctx.direct_edges();
        assert_eq!(edges.len(), 1);
        let edge = &edges[0];
        // Unpatched: both slots still point into the stub.
        assert!(edge.is_unpatched());
        assert_eq!(edge.executions(), 0);
    }
}
