//! Virtual registers
//!
//! A [`VirtReg`] names a storage location in the IR: a native GPR, the
//! flags register, a synthetic virtual register introduced during
//! instrumentation, or an allocated spill slot. Native identity is stable
//! across lowering; virtual identity is scoped to one trace.

use std::fmt;

use grist_x86::Gpr;

/// A register as seen by the IR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VirtReg {
    /// A native general-purpose register.
    Native(Gpr),
    /// The arithmetic flags register.
    Flags,
    /// A virtual register allocated from the trace's counter.
    Virt(u16),
    /// An allocated spill slot, after scheduling.
    Slot(u16),
}

impl VirtReg {
    /// The native register, if this is one.
    pub fn as_native(self) -> Option<Gpr> {
        match self {
            VirtReg::Native(gpr) => Some(gpr),
            _ => None,
        }
    }

    /// Whether this register is (or is pinned to) the stack pointer.
    pub fn aliases_stack_pointer(self) -> bool {
        matches!(self, VirtReg::Native(Gpr::Rsp))
    }

    /// Whether this is a synthetic virtual register.
    pub fn is_virtual(self) -> bool {
        matches!(self, VirtReg::Virt(_))
    }
}

impl fmt::Display for VirtReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VirtReg::Native(gpr) => write!(f, "{gpr}"),
            VirtReg::Flags => write!(f, "flags"),
            VirtReg::Virt(n) => write!(f, "v{n}"),
            VirtReg::Slot(n) => write!(f, "slot{n}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_pointer_alias() {
        assert!(VirtReg::Native(Gpr::Rsp).aliases_stack_pointer());
        assert!(!VirtReg::Native(Gpr::Rbp).aliases_stack_pointer());
        assert!(!VirtReg::Virt(0).aliases_stack_pointer());
    }

    #[test]
    fn test_display() {
        assert_eq!(VirtReg::Native(Gpr::Rax).to_string(), "rax");
        assert_eq!(VirtReg::Virt(3).to_string(), "v3");
        assert_eq!(VirtReg::Slot(1).to_string(), "slot1");
    }
}
