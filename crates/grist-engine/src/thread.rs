//! Thread handles
//!
//! There is no hidden thread-local state in the core: every entry point
//! that needs per-thread storage takes an explicit [`Thread`], which owns
//! the thread's spill-slot table and a private stack region. Slot access
//! from generated code goes through the GS segment; `activate` points the
//! segment base at this thread's table. One reserved cell past the spill
//! slots holds the private stack top, so entry shims can find this
//! thread's stack through the same segment base.

use std::sync::atomic::{AtomicU64, Ordering};

/// Default private stack size.
const PRIVATE_STACK_BYTES: usize = 64 * 1024;

/// Per-thread translator state.
pub struct Thread {
    /// `slot_count` spill slots, then the reserved stack-top cell.
    slots: Box<[AtomicU64]>,
    /// Stored as qwords to keep the stack top 8-aligned.
    private_stack: Box<[u64]>,
}

impl Thread {
    /// A thread handle with `slot_count` spill slots.
    pub fn new(slot_count: u16) -> Thread {
        let slots = (0..slot_count.max(1) as usize + 1)
            .map(|_| AtomicU64::new(0))
            .collect::<Vec<_>>();
        let thread = Thread {
            slots: slots.into_boxed_slice(),
            private_stack: vec![0u64; PRIVATE_STACK_BYTES / 8].into_boxed_slice(),
        };
        thread.slots[thread.slots.len() - 1].store(thread.private_stack_top(), Ordering::Relaxed);
        thread
    }

    /// Number of spill slots in the table (the reserved stack-top cell is
    /// not counted).
    pub fn slot_count(&self) -> u16 {
        self.slots.len() as u16 - 1
    }

    /// Base address of the slot table (what the GS base must point at).
    pub fn slot_table_base(&self) -> u64 {
        self.slots.as_ptr() as u64
    }

    /// Read a spill slot; used by instrumentation that mirrors
    /// generated-code state back into Rust.
    pub fn slot(&self, index: u16) -> u64 {
        debug_assert!(index < self.slot_count());
        self.slots[index as usize].load(Ordering::Relaxed)
    }

    /// Segment-relative byte offset of the reserved stack-top cell.
    pub fn stack_top_offset(&self) -> i32 {
        8 * self.slot_count() as i32
    }

    /// Top of the private stack region (stacks grow down). Also published
    /// through the reserved table cell at [`Thread::stack_top_offset`].
    pub fn private_stack_top(&self) -> u64 {
        self.private_stack.as_ptr() as u64 + (self.private_stack.len() * 8) as u64
    }

    /// Point this CPU's GS base at the thread's slot table so generated
    /// `gs:`-relative slot accesses resolve here. Must be called on the
    /// thread that will execute cached code.
    #[cfg(target_os = "linux")]
    pub fn activate(&self) -> std::io::Result<()> {
        const ARCH_SET_GS: libc::c_int = 0x1001;
        // Safety: setting the GS base to a live, owned allocation; user
        // space does not otherwise use GS on this target.
        let rc = unsafe {
            libc::syscall(libc::SYS_arch_prctl, ARCH_SET_GS, self.slot_table_base())
        };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    pub fn activate(&self) -> std::io::Result<()> {
        Err(std::io::Error::new(std::io::ErrorKind::Unsupported, "no segment-base control"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_owns_slots() {
        let thread = Thread::new(32);
        assert_eq!(thread.slot_count(), 32);
        assert_ne!(thread.slot_table_base(), 0);
        assert_eq!(thread.slot(0), 0);
    }

    #[test]
    fn test_private_stack_region() {
        let thread = Thread::new(4);
        let top = thread.private_stack_top();
        assert_eq!(
            top - thread.private_stack.as_ptr() as u64,
            PRIVATE_STACK_BYTES as u64
        );
        assert_eq!(top % 8, 0);
    }

    #[test]
    fn test_stack_top_published_through_table() {
        let thread = Thread::new(4);
        assert_eq!(thread.stack_top_offset(), 32);
        let cell = &thread.slots[thread.slot_count() as usize];
        assert_eq!(cell.load(Ordering::Relaxed), thread.private_stack_top());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_activate_sets_gs_base() {
        let thread = Thread::new(8);
        thread.activate().unwrap();
        // Write through gs:0 from assembly would need generated code; the
        // syscall succeeding is the observable contract here.
    }
}
