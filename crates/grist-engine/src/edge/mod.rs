//! Edge management
//!
//! Edges are the lazily patched trampolines that resolve cross-block
//! control transfers. A *direct* edge is a small stub whose two pointer
//! slots converge on the destination's cache PC: `exit_target` as soon as
//! the destination is translated, `entry_target` once the execution
//! counter passes the patch threshold. An *indirect* edge owns a
//! fixed-size hash table from application PCs to cache PCs, probed inline
//! by generated code and filled by the miss stub.
//!
//! Publication of either slot is an aligned pointer-width store with
//! release semantics; the stub's indirect jump is the acquire side.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use grist_x86::{Gpr, Insn, Mem, OpClass, Operands};

use crate::cache::{CacheError, CodeCache};
use crate::meta::MetaRef;

/// Caller-saved GPRs spilled by edge stubs, in push order.
const STUB_SAVED: [Gpr; 9] =
    [Gpr::Rax, Gpr::Rcx, Gpr::Rdx, Gpr::Rsi, Gpr::Rdi, Gpr::R8, Gpr::R9, Gpr::R10, Gpr::R11];

/// The scratch register that carries the target application PC into
/// indirect-edge dispatch.
pub const INDIRECT_TARGET_REG: Gpr = Gpr::R11;

/// A direct edge: one untranslated direct control transfer.
#[derive(Debug)]
pub struct DirectEdge {
    /// The stub's entry PC; predecessor blocks branch here.
    pub edge_code: u64,
    /// Address of the stub's first instruction, the patchable entry jump.
    pub patch_instruction: u64,
    /// Addresses of the two in-cache pointer slots.
    entry_slot: u64,
    exit_slot: u64,
    /// Executions of the stub-mediated slow path.
    num_executions: AtomicU32,
    num_execution_overflows: AtomicU32,
    /// Executions after which `entry_target` short-circuits the stub.
    pub patch_threshold: u32,
    /// Metadata of the predecessor block, if known.
    pub source_meta: Option<MetaRef>,
    /// Metadata of the block to translate. Taken (left `None`) once the
    /// destination is resolved; the cache index owns it from then on.
    pub dest_meta: Mutex<Option<MetaRef>>,
    /// Opaque host pointer handed back to the edge entrypoint.
    pub host: usize,
}

// Safety: slot publication is atomic; everything else is lock-protected
// or immutable after construction.
unsafe impl Send for DirectEdge {}
unsafe impl Sync for DirectEdge {}

impl DirectEdge {
    fn entry_cell(&self) -> &AtomicU64 {
        // Safety: the slot is an aligned qword inside a live cache slab.
        unsafe { AtomicU64::from_ptr(self.entry_slot as *mut u64) }
    }

    fn exit_cell(&self) -> &AtomicU64 {
        // Safety: as above.
        unsafe { AtomicU64::from_ptr(self.exit_slot as *mut u64) }
    }

    /// Current entry target (the stub's internal path until patched).
    pub fn entry_target(&self) -> u64 {
        self.entry_cell().load(Ordering::Acquire)
    }

    /// Current exit target.
    pub fn exit_target(&self) -> u64 {
        self.exit_cell().load(Ordering::Acquire)
    }

    /// Publish the destination's cache PC into `exit_target`. Idempotent:
    /// racing publishers write the same resolved value.
    pub fn publish_exit(&self, cache_pc: u64) {
        self.exit_cell().store(cache_pc, Ordering::Release);
    }

    /// Short-circuit the stub entirely.
    pub fn publish_entry(&self, cache_pc: u64) {
        self.entry_cell().store(cache_pc, Ordering::Release);
    }

    /// Record one stub-mediated execution; returns the new count.
    pub fn record_execution(&self) -> u32 {
        let prior = self.num_executions.fetch_add(1, Ordering::Relaxed);
        if prior == u32::MAX {
            self.num_execution_overflows.fetch_add(1, Ordering::Relaxed);
        }
        prior.wrapping_add(1)
    }

    pub fn executions(&self) -> u32 {
        self.num_executions.load(Ordering::Relaxed)
    }

    pub fn execution_overflows(&self) -> u32 {
        self.num_execution_overflows.load(Ordering::Relaxed)
    }

    /// Whether the entry jump still routes through the stub.
    pub fn is_unpatched(&self) -> bool {
        self.entry_target() == self.edge_code || self.entry_target() == self.exit_slot_initial()
    }

    fn exit_slot_initial(&self) -> u64 {
        self.patch_instruction + DIRECT_STUB_HEAD
    }
}

/// One bucket of an indirect edge's target table. Keys are written once
/// (value first, then key, both release), so a reader that matches a key
/// always observes the paired value; a zero key is the stable terminator.
#[derive(Debug)]
struct Bucket {
    key: AtomicU64,
    value: AtomicU64,
}

/// Byte size of one bucket as generated probe code sees it.
pub const BUCKET_BYTES: u64 = 16;

/// An indirect edge: runtime-dispatched control transfers sharing one
/// destination metadata template.
#[derive(Debug)]
pub struct IndirectEdge {
    /// Destination metadata template for targets discovered at runtime.
    pub template_meta: MetaRef,
    /// Miss-path stub: saves state, calls the translator, dispatches.
    pub miss_stub: u64,
    /// Opaque host pointer handed back to the edge entrypoint.
    pub host: usize,
    table: Box<[Bucket]>,
    insert_lock: Mutex<()>,
}

impl IndirectEdge {
    /// Base address of the bucket table, embedded into probe code.
    pub fn table_base(&self) -> u64 {
        self.table.as_ptr() as u64
    }

    /// Bucket-index mask, embedded into probe code.
    pub fn bucket_mask(&self) -> u64 {
        self.table.len() as u64 - 1
    }

    fn bucket(&self, app_pc: u64) -> &Bucket {
        &self.table[(app_pc & self.bucket_mask()) as usize]
    }

    /// Lock-free reader probe, mirroring the generated fast path.
    pub fn lookup(&self, app_pc: u64) -> Option<u64> {
        let bucket = self.bucket(app_pc);
        if bucket.key.load(Ordering::Acquire) == app_pc {
            Some(bucket.value.load(Ordering::Acquire))
        } else {
            None
        }
    }

    /// Insert a resolved target under the writer lock. Buckets are
    /// write-once: a colliding key leaves the table unchanged (that target
    /// keeps taking the miss path). Returns whether the pair is present
    /// after the call.
    pub fn insert(&self, app_pc: u64, cache_pc: u64) -> bool {
        debug_assert_ne!(app_pc, 0, "zero is the terminator key");
        let _guard = self.insert_lock.lock();
        let bucket = self.bucket(app_pc);
        match bucket.key.load(Ordering::Acquire) {
            0 => {
                bucket.value.store(cache_pc, Ordering::Release);
                bucket.key.store(app_pc, Ordering::Release);
                true
            }
            existing => existing == app_pc,
        }
    }
}

/// Allocation host for edges: implemented by the context, consumed by the
/// fragment builder.
pub trait EdgeHost {
    fn allocate_direct_edge(&self, source_meta: Option<MetaRef>, dest_meta: MetaRef)
        -> Result<Arc<DirectEdge>, CacheError>;
    fn allocate_indirect_edge(&self, template_meta: MetaRef) -> Result<Arc<IndirectEdge>, CacheError>;
}

/// Rust signature of the direct-edge entrypoint called from stub code.
pub type DirectEntryFn = unsafe extern "C" fn(edge: *const DirectEdge);

/// Rust signature of the indirect-edge entrypoint: resolves `target_pc`
/// and returns the cache PC the stub dispatches to.
pub type IndirectEntryFn = unsafe extern "C" fn(edge: *const IndirectEdge, target_pc: u64) -> u64;

/// Offset from the stub base to the translator path (the target of the
/// unpatched entry slot).
const DIRECT_STUB_HEAD: u64 = 6; // jmp [rip+disp32]

struct StubAsm {
    bytes: Vec<u8>,
}

impl StubAsm {
    fn new() -> StubAsm {
        StubAsm { bytes: Vec::new() }
    }

    fn emit(&mut self, insn: Insn) {
        grist_x86::encode(&insn, &mut self.bytes).expect("stub instruction encodes");
    }

    fn len(&self) -> usize {
        self.bytes.len()
    }

    /// `jmp [rip+disp]` whose slot lives at `slot_offset` within the stub.
    fn jmp_slot(&mut self, slot_offset: i64) {
        let disp = slot_offset - (self.len() as i64 + 6);
        self.emit(Insn::new(OpClass::Jmp, 64, Operands::Mem(Mem::rip(disp as i32))));
    }

    /// `movabs reg, imm64`, always in the 10-byte form so stub layout does
    /// not depend on pointer values.
    fn mov_abs(&mut self, reg: Gpr, imm: u64) {
        self.bytes.push(0x48 | if reg.needs_rex_bit() { 0x01 } else { 0x00 });
        self.bytes.push(0xB8 | reg.low_bits());
        self.bytes.extend_from_slice(&imm.to_le_bytes());
    }

    /// Save flags and the caller-saved registers.
    fn save_app_state(&mut self) {
        self.emit(Insn::new(OpClass::Pushf, 64, Operands::None));
        for reg in STUB_SAVED {
            self.emit(Insn::new(OpClass::Push, 64, Operands::Reg(reg)));
        }
    }

    fn restore_app_state(&mut self) {
        for reg in STUB_SAVED.iter().rev() {
            self.emit(Insn::new(OpClass::Pop, 64, Operands::Reg(*reg)));
        }
        self.emit(Insn::new(OpClass::Popf, 64, Operands::None));
    }

    /// Realign the stack and call `entry_fn`. The caller has already
    /// loaded the argument registers.
    fn aligned_call(&mut self, entry_fn: u64) {
        // mov rax, rsp; and rsp, -16; push rax; sub rsp, 8
        self.emit(Insn::new(OpClass::Mov, 64, Operands::RegReg { dst: Gpr::Rax, src: Gpr::Rsp }));
        self.emit(Insn::new(OpClass::And, 64, Operands::RegImm { reg: Gpr::Rsp, imm: -16 }));
        self.emit(Insn::new(OpClass::Push, 64, Operands::Reg(Gpr::Rax)));
        self.emit(Insn::new(OpClass::Sub, 64, Operands::RegImm { reg: Gpr::Rsp, imm: 8 }));
        self.mov_abs(Gpr::Rax, entry_fn);
        self.emit(Insn::new(OpClass::Call, 64, Operands::Reg(Gpr::Rax)));
        self.emit(Insn::new(OpClass::Add, 64, Operands::RegImm { reg: Gpr::Rsp, imm: 8 }));
        self.emit(Insn::new(OpClass::Pop, 64, Operands::Reg(Gpr::Rsp)));
    }
}

/// Generate a direct-edge stub and its edge record.
///
/// Stub shape:
/// ```text
/// jmp [entry_target]        ; initially targets the next instruction
/// <save flags + caller-saved>
/// mov rdi, &edge ; call entry_fn ; (translates, patches exit_target)
/// <restore>
/// jmp [exit_target]         ; initially points back into the stub
/// ud2
/// entry_target: dq ; exit_target: dq
/// ```
pub fn emit_direct_edge(
    cache: &CodeCache,
    source_meta: Option<MetaRef>,
    dest_meta: MetaRef,
    entry_fn: DirectEntryFn,
    host: usize,
    patch_threshold: u32,
) -> Result<Arc<DirectEdge>, CacheError> {
    // Stage once against offset zero to learn the body length, then place
    // the two pointer slots after the body.
    let staged = direct_stub_body(0, entry_fn as usize as u64, 0, 0);
    let slots_offset = (staged.len() + 7) & !7;
    let total = slots_offset + 16;

    let stub_pc = cache.allocate(total)?;
    let entry_slot = stub_pc + slots_offset as u64;
    let exit_slot = entry_slot + 8;

    let edge = Arc::new(DirectEdge {
        edge_code: stub_pc,
        patch_instruction: stub_pc,
        entry_slot,
        exit_slot,
        num_executions: AtomicU32::new(0),
        num_execution_overflows: AtomicU32::new(0),
        patch_threshold,
        source_meta,
        dest_meta: Mutex::new(Some(dest_meta)),
        host,
    });

    let mut bytes =
        direct_stub_body(slots_offset as i64, entry_fn as usize as u64, Arc::as_ptr(&edge) as u64, stub_pc);
    bytes.resize(slots_offset, 0xCC);
    let translator_path = stub_pc + DIRECT_STUB_HEAD;
    bytes.extend_from_slice(&translator_path.to_le_bytes()); // entry_target
    bytes.extend_from_slice(&translator_path.to_le_bytes()); // exit_target

    // Safety: `stub_pc` names a fresh allocation of `total` bytes.
    unsafe { crate::cache::write_code(stub_pc, &bytes) };
    tracing::debug!(stub_pc, "direct edge stub emitted");
    Ok(edge)
}

fn direct_stub_body(slots_offset: i64, entry_fn: u64, edge_ptr: u64, _stub_pc: u64) -> Vec<u8> {
    let mut asm = StubAsm::new();
    asm.jmp_slot(slots_offset); // jmp [entry_target]
    debug_assert_eq!(asm.len() as u64, DIRECT_STUB_HEAD);
    asm.save_app_state();
    asm.mov_abs(Gpr::Rdi, edge_ptr);
    asm.aligned_call(entry_fn);
    asm.restore_app_state();
    asm.jmp_slot(slots_offset + 8); // jmp [exit_target]
    asm.emit(Insn::new(OpClass::Ud2, 64, Operands::None));
    asm.bytes
}

/// Generate an indirect edge: its bucket table and miss stub.
///
/// The miss path's out-edge code reserves a result slot on the stack,
/// saves the application's dispatch register, and enters the stub with the
/// target application PC in [`INDIRECT_TARGET_REG`]:
///
/// ```text
/// (out-miss)   lea rsp, [rsp-8]   ; result slot
///              push r11           ; application r11
///              mov r11, <target>
///              jmp miss_stub
/// (stub)       <save flags + caller-saved>
///              mov rdi, &edge ; mov rsi, r11 ; call entry_fn → rax
///              mov [result slot], rax
///              <restore> ; pop r11 ; ret    ; dispatches through the slot
/// ```
pub fn emit_indirect_edge(
    cache: &CodeCache,
    template_meta: MetaRef,
    entry_fn: IndirectEntryFn,
    host: usize,
    buckets: usize,
) -> Result<Arc<IndirectEdge>, CacheError> {
    debug_assert!(buckets.is_power_of_two());
    let table = (0..buckets)
        .map(|_| Bucket { key: AtomicU64::new(0), value: AtomicU64::new(0) })
        .collect::<Vec<_>>()
        .into_boxed_slice();

    let mut asm = StubAsm::new();
    asm.save_app_state();
    asm.mov_abs(Gpr::Rdi, 0); // edge pointer, patched below
    let edge_ptr_patch = asm.len() - 8;
    asm.emit(Insn::new(
        OpClass::Mov,
        64,
        Operands::RegReg { dst: Gpr::Rsi, src: INDIRECT_TARGET_REG },
    ));
    asm.aligned_call(entry_fn as usize as u64);
    // rax holds the resolved cache PC; park it in the result slot above
    // the saved state: flags + 9 registers + the saved r11 = 11 qwords.
    asm.emit(Insn::new(
        OpClass::Mov,
        64,
        Operands::MemReg { mem: Mem::base_disp(Gpr::Rsp, 8 * 11), reg: Gpr::Rax },
    ));
    asm.restore_app_state();
    asm.emit(Insn::new(OpClass::Pop, 64, Operands::Reg(INDIRECT_TARGET_REG)));
    asm.emit(Insn::new(OpClass::Ret, 64, Operands::None));

    let stub_pc = cache.allocate(asm.len())?;
    let edge = Arc::new(IndirectEdge {
        template_meta,
        miss_stub: stub_pc,
        host,
        table,
        insert_lock: Mutex::new(()),
    });

    let mut bytes = asm.bytes;
    let edge_ptr = Arc::as_ptr(&edge) as u64;
    bytes[edge_ptr_patch..edge_ptr_patch + 8].copy_from_slice(&edge_ptr.to_le_bytes());
    // Safety: fresh allocation of exactly `bytes.len()` bytes.
    unsafe { crate::cache::write_code(stub_pc, &bytes) };
    tracing::debug!(stub_pc, buckets, "indirect edge emitted");
    Ok(edge)
}
