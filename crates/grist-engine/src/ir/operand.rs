//! Instruction operands
//!
//! Operands are a sum type over registers, memory references, immediates,
//! branch targets and local labels. The shared fields (bit width, access
//! action, stickiness) live alongside the variant tag; `sticky` marks
//! operands that clients must not rewrite, which is set for the implicit
//! operands of an instruction.

use grist_x86::Seg;

use crate::ir::instr::LabelId;
use crate::ir::reg::VirtReg;
use crate::trace::BlockId;

/// How an operand is accessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Read,
    Write,
    ReadWrite,
}

impl Action {
    /// Whether the access reads the location.
    pub fn reads(self) -> bool {
        matches!(self, Action::Read | Action::ReadWrite)
    }

    /// Whether the access writes the location.
    pub fn writes(self) -> bool {
        matches!(self, Action::Write | Action::ReadWrite)
    }
}

/// A memory reference. The variants mirror the addressing forms the
/// decoder distinguishes; PC-relative references store the *resolved
/// absolute* target and are turned back into displacements at encode time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemOperand {
    /// Plain register-indirect access.
    Indirect { base: VirtReg },
    /// Compound `base + index*scale + disp` access.
    Compound { base: Option<VirtReg>, index: Option<(VirtReg, u8)>, disp: i32 },
    /// Absolute pointer.
    Absolute(u64),
    /// RIP-relative access, resolved to its absolute target at decode time.
    PcRelative { target: u64 },
    /// Segment-based access (thread/CPU-private storage).
    Segmented { seg: Seg, base: Option<VirtReg>, disp: i32 },
}

impl MemOperand {
    /// Registers this reference reads for address computation.
    pub fn regs(&self) -> impl Iterator<Item = VirtReg> + '_ {
        let (a, b) = match self {
            MemOperand::Indirect { base } => (Some(*base), None),
            MemOperand::Compound { base, index, .. } => (*base, index.map(|(reg, _)| reg)),
            MemOperand::Segmented { base, .. } => (*base, None),
            _ => (None, None),
        };
        a.into_iter().chain(b)
    }

    /// Rewrite one address register in place. Returns true if it occurred.
    pub fn replace_reg(&mut self, from: VirtReg, to: VirtReg) -> bool {
        let mut hit = false;
        match self {
            MemOperand::Indirect { base } => {
                if *base == from {
                    *base = to;
                    hit = true;
                }
            }
            MemOperand::Compound { base, index, .. } => {
                if *base == Some(from) {
                    *base = Some(to);
                    hit = true;
                }
                if let Some((reg, _)) = index {
                    if *reg == from {
                        *reg = to;
                        hit = true;
                    }
                }
            }
            MemOperand::Segmented { base, .. } => {
                if *base == Some(from) {
                    *base = Some(to);
                    hit = true;
                }
            }
            _ => {}
        }
        hit
    }

    /// Whether the reference dereferences the application stack pointer.
    pub fn uses_stack_pointer(&self) -> bool {
        self.regs().any(|reg| reg.aliases_stack_pointer())
    }
}

/// A control-transfer target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// An application address, before the factory resolves it.
    AppPc(u64),
    /// A block in the current trace.
    Block(BlockId),
    /// A local label inside the block's instruction list.
    Label(LabelId),
    /// A fragment, used by connecting jumps added after layout.
    Frag(crate::fragment::FragId),
    /// An already-encoded cache address.
    CachePc(u64),
}

/// Operand payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    Reg(VirtReg),
    Mem(MemOperand),
    Imm(i64),
    BranchTarget(Target),
    Label(LabelId),
}

/// One operand: variant payload plus the shared width/action/sticky fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operand {
    pub kind: OperandKind,
    /// Access width in bits.
    pub width: u8,
    pub action: Action,
    /// Set for implicit operands; clients must not rewrite sticky operands.
    pub sticky: bool,
}

impl Operand {
    /// An explicit (client-visible) operand.
    pub fn explicit(kind: OperandKind, width: u8, action: Action) -> Operand {
        Operand { kind, width, action, sticky: false }
    }

    /// An implicit operand, marked sticky.
    pub fn implicit(kind: OperandKind, width: u8, action: Action) -> Operand {
        Operand { kind, width, action, sticky: true }
    }

    /// A 64-bit register operand.
    pub fn reg(reg: VirtReg, action: Action) -> Operand {
        Operand::explicit(OperandKind::Reg(reg), 64, action)
    }

    /// The register, if this is a register operand.
    pub fn as_reg(&self) -> Option<VirtReg> {
        match self.kind {
            OperandKind::Reg(reg) => Some(reg),
            _ => None,
        }
    }

    /// The branch target, if this is a branch-target operand.
    pub fn as_target(&self) -> Option<Target> {
        match self.kind {
            OperandKind::BranchTarget(target) => Some(target),
            _ => None,
        }
    }

    /// All registers this operand touches (a memory operand's address
    /// registers are reads regardless of the operand's action).
    pub fn regs(&self) -> impl Iterator<Item = VirtReg> + '_ {
        let direct = match self.kind {
            OperandKind::Reg(reg) => Some(reg),
            _ => None,
        };
        let mem = match &self.kind {
            OperandKind::Mem(mem) => Some(mem.regs()),
            _ => None,
        };
        direct.into_iter().chain(mem.into_iter().flatten())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grist_x86::Gpr;

    #[test]
    fn test_action() {
        assert!(Action::Read.reads());
        assert!(!Action::Read.writes());
        assert!(Action::ReadWrite.reads() && Action::ReadWrite.writes());
    }

    #[test]
    fn test_mem_regs() {
        let mem = MemOperand::Compound {
            base: Some(VirtReg::Native(Gpr::Rbx)),
            index: Some((VirtReg::Virt(1), 4)),
            disp: 8,
        };
        let regs: Vec<_> = mem.regs().collect();
        assert_eq!(regs, vec![VirtReg::Native(Gpr::Rbx), VirtReg::Virt(1)]);
        assert!(!mem.uses_stack_pointer());

        let stack = MemOperand::Indirect { base: VirtReg::Native(Gpr::Rsp) };
        assert!(stack.uses_stack_pointer());
    }

    #[test]
    fn test_replace_reg() {
        let mut mem = MemOperand::Indirect { base: VirtReg::Virt(0) };
        assert!(mem.replace_reg(VirtReg::Virt(0), VirtReg::Native(Gpr::Rax)));
        assert_eq!(mem, MemOperand::Indirect { base: VirtReg::Native(Gpr::Rax) });
        assert!(!mem.replace_reg(VirtReg::Virt(0), VirtReg::Native(Gpr::Rbx)));
    }

    #[test]
    fn test_operand_regs_includes_address_registers() {
        let op = Operand::explicit(
            OperandKind::Mem(MemOperand::Indirect { base: VirtReg::Native(Gpr::Rdi) }),
            64,
            Action::Write,
        );
        let regs: Vec<_> = op.regs().collect();
        assert_eq!(regs, vec![VirtReg::Native(Gpr::Rdi)]);
    }
}
