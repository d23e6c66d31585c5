//! Client integration scenarios
//!
//! Runs the sample clients through a full translate(-and-execute) cycle.

use std::sync::Arc;

use grist_clients::{CountBlocks, MemOpTracer, TransparentReturns};
use grist_engine::cache::{write_code, CodeCache};
use grist_engine::decode::SliceSource;
use grist_engine::{Context, InitReason, Options};

fn load_app(cache: &CodeCache, bytes: &[u8]) -> u64 {
    let pc = cache.allocate(bytes.len()).unwrap();
    unsafe { write_code(pc, bytes) };
    pc
}

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
#[test]
fn test_count_blocks_counts_executions() {
    let app = CodeCache::new(2);
    // mov rax, 7 ; ret
    let mut code = vec![0x48, 0xC7, 0xC0];
    code.extend_from_slice(&7i32.to_le_bytes());
    code.push(0xC3);
    let app_pc = load_app(&app, &code);

    let counter = Arc::new(CountBlocks::new());
    let ctx = Context::new(Options::default());
    ctx.register_client("count_blocks", Box::new(SharedCounter(counter.clone()))).unwrap();
    ctx.init_clients(InitReason::Program).unwrap();

    let thread = grist_engine::Thread::new(32);
    thread.activate().unwrap();

    let cache_pc = ctx.translate(app_pc).unwrap();
    assert_eq!(counter.blocks_seen(), 1);
    assert_eq!(counter.executions(app_pc), 0);

    let f: extern "C" fn() -> u64 = unsafe { std::mem::transmute(cache_pc) };
    assert_eq!(f(), 7);
    assert_eq!(counter.executions(app_pc), 1);
    assert_eq!(f(), 7);
    assert_eq!(counter.executions(app_pc), 2);
}

/// Forwarding wrapper so the test keeps a handle on the client after
/// handing ownership to the context.
struct SharedCounter(Arc<CountBlocks>);

impl grist_engine::Client for SharedCounter {
    fn on_init(
        &self,
        reason: InitReason,
        registry: &mut grist_engine::meta::MetaRegistry,
    ) -> Result<(), grist_engine::meta::MetaError> {
        self.0.on_init(reason, registry)
    }

    fn on_instrument_block(
        &self,
        trace: &mut grist_engine::trace::Trace,
        block: grist_engine::trace::BlockId,
    ) {
        self.0.on_instrument_block(trace, block)
    }
}

#[test]
fn test_memop_tracer_counts_explicit_writes() {
    // mov [rdi], rax ; ret — one explicit memory write.
    let base = 0x9000u64;
    let mut source = SliceSource::new();
    source.map(base, vec![0x48, 0x89, 0x07, 0xC3]);

    let tracer = Arc::new(MemOpTracer::new());
    let ctx = Context::with_source(Options::default(), Box::new(source));
    ctx.register_client("memop", Box::new(SharedTracer(tracer.clone()))).unwrap();
    ctx.init_clients(InitReason::Program).unwrap();

    ctx.translate(base).unwrap();
    assert_eq!(tracer.writes_in(base), 1);
}

struct SharedTracer(Arc<MemOpTracer>);

impl grist_engine::Client for SharedTracer {
    fn on_init(
        &self,
        reason: InitReason,
        registry: &mut grist_engine::meta::MetaRegistry,
    ) -> Result<(), grist_engine::meta::MetaError> {
        self.0.on_init(reason, registry)
    }

    fn on_instrument_block(
        &self,
        trace: &mut grist_engine::trace::Trace,
        block: grist_engine::trace::BlockId,
    ) {
        self.0.on_instrument_block(trace, block)
    }
}

#[test]
fn test_transparent_returns_specialise_through_indirect_edge() {
    // A bare ret: with the client, the return is specialised and the
    // translation allocates indirect-edge dispatch for it.
    let base = 0xA000u64;
    let mut source = SliceSource::new();
    source.map(base, vec![0xC3]);

    let ctx = Context::with_source(Options::default(), Box::new(source));
    ctx.register_client("transparent_rets", Box::new(TransparentReturns::new())).unwrap();
    ctx.init_clients(InitReason::Program).unwrap();

    ctx.translate(base).unwrap();
    assert_eq!(ctx.indirect_edges().len(), 1);

    // Without the client, the identity translation needs no edge.
    let mut source = SliceSource::new();
    source.map(base, vec![0xC3]);
    let plain = Context::with_source(Options::default(), Box::new(source));
    plain.translate(base).unwrap();
    assert!(plain.indirect_edges().is_empty());
}
