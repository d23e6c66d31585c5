//! IR instructions
//!
//! An [`Instr`] is one element of a block's (or fragment's) instruction
//! list: a lifted or synthesised native instruction, a translator
//! annotation, or a local label. Native instructions carry the full operand
//! vector, explicit operands first.

use smallvec::SmallVec;

use grist_x86::{Category, Cc, Gpr, OpClass, Prefixes};

use crate::ir::operand::{Action, MemOperand, Operand, OperandKind, Target};
use crate::ir::reg::VirtReg;

/// Fixed capacity of the operand vector.
pub const MAX_OPERANDS: usize = 11;

/// A local label, scoped to one trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LabelId(pub u32);

/// Translator annotations threaded through instruction lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Annotation {
    /// Marks the head of a decoded block.
    BlockBegin,
    /// The stack pointer points at a well-behaved call stack from here on.
    ValidStack,
    /// The stack pointer is not usable from here on.
    UndefinedStack,
    /// Stack contents above the pointer are unknown; split and stop
    /// forward propagation of validity.
    UnknownStackAbove,
    /// Stack contents below the pointer are about to be accessed.
    UnknownStackBelow,
    /// The following instruction materialises a return address.
    ReturnAddress,
    /// Client hint: split before the next flag-modifying instruction.
    FlagSplitHint,
    /// Client-requested early end of the current block.
    EndBlock,
}

/// One list element.
#[derive(Debug, Clone)]
pub enum Instr {
    Native(Box<Instruction>),
    Annotation(Annotation),
    Label(LabelId),
}

impl Instr {
    /// The native instruction, if this is one.
    pub fn as_native(&self) -> Option<&Instruction> {
        match self {
            Instr::Native(instruction) => Some(instruction),
            _ => None,
        }
    }

    /// Mutable access to the native instruction, if this is one.
    pub fn as_native_mut(&mut self) -> Option<&mut Instruction> {
        match self {
            Instr::Native(instruction) => Some(instruction),
            _ => None,
        }
    }
}

/// A lifted or synthesised native instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    /// Opcode class.
    pub class: OpClass,
    /// Condition code for `Jcc`/`Setcc`.
    pub cc: Option<Cc>,
    /// Control-flow category recorded at decode time.
    pub category: Category,
    /// Application address this was decoded from; `None` if synthesised.
    pub decoded_pc: Option<u64>,
    /// Decoded length in bytes (rel8 branches are normalised to their
    /// rel32 length so size estimates never shrink).
    pub decoded_len: u8,
    /// Operand vector, explicit operands first.
    pub operands: SmallVec<[Operand; MAX_OPERANDS]>,
    /// Number of leading explicit operands.
    pub num_explicit: u8,
    /// Decoded prefix state.
    pub prefixes: Prefixes,
    /// Effective operand width in bits.
    pub opsize: u8,
    /// Whether the instruction is atomic (`lock`-prefixed or implicitly so).
    pub is_atomic: bool,
    /// Cached stack-pointer analysis.
    pub writes_sp: bool,
    /// Whether this is an original application instruction (false for
    /// everything synthesised by clients or the translator).
    pub is_app: bool,
}

impl Instruction {
    /// A synthesised instruction with no operands yet.
    pub fn synthesised(class: OpClass, opsize: u8) -> Instruction {
        Instruction {
            class,
            cc: None,
            category: Category::Normal,
            decoded_pc: None,
            decoded_len: 0,
            operands: SmallVec::new(),
            num_explicit: 0,
            prefixes: Prefixes::default(),
            opsize,
            is_atomic: false,
            writes_sp: false,
            is_app: false,
        }
    }

    /// Append an explicit operand. Explicit operands must be added before
    /// any implicit one.
    pub fn push_explicit(&mut self, op: Operand) {
        debug_assert_eq!(self.num_explicit as usize, self.operands.len());
        debug_assert!(self.operands.len() < MAX_OPERANDS);
        self.operands.push(op);
        self.num_explicit += 1;
    }

    /// Append an implicit (sticky) operand.
    pub fn push_implicit(&mut self, mut op: Operand) {
        debug_assert!(self.operands.len() < MAX_OPERANDS);
        op.sticky = true;
        self.operands.push(op);
    }

    /// The explicit operands.
    pub fn explicit_ops(&self) -> &[Operand] {
        &self.operands[..self.num_explicit as usize]
    }

    /// Whether this instruction writes the arithmetic flags.
    pub fn writes_flags(&self) -> bool {
        self.class.writes_flags()
    }

    /// Whether this instruction reads the arithmetic flags.
    pub fn reads_flags(&self) -> bool {
        self.class.reads_flags()
    }

    /// Whether this instruction can change interrupt delivery.
    pub fn changes_interrupt_state(&self) -> bool {
        self.class.changes_interrupt_state()
    }

    /// Whether this is a control-flow instruction (including local
    /// branches to labels).
    pub fn is_cti(&self) -> bool {
        self.category.is_control_flow()
    }

    /// Whether this is a branch to a local label.
    pub fn is_local_branch(&self) -> bool {
        matches!(self.category, Category::DirectJump | Category::ConditionalJump)
            && matches!(self.target(), Some(Target::Label(_)))
    }

    /// The branch target, if any operand carries one.
    pub fn target(&self) -> Option<Target> {
        self.operands.iter().find_map(|op| op.as_target())
    }

    /// Rewrite the branch-target operand.
    pub fn set_target(&mut self, target: Target) {
        for op in &mut self.operands {
            if matches!(op.kind, OperandKind::BranchTarget(_)) {
                op.kind = OperandKind::BranchTarget(target);
                return;
            }
        }
        debug_assert!(false, "no branch-target operand to rewrite");
    }

    /// Visit every register use with its access action. Address registers
    /// of memory operands are visited as reads.
    pub fn for_each_reg(&self, mut visit: impl FnMut(VirtReg, Action)) {
        for op in &self.operands {
            match &op.kind {
                OperandKind::Reg(reg) => visit(*reg, op.action),
                OperandKind::Mem(mem) => {
                    for reg in mem.regs() {
                        visit(reg, Action::Read);
                    }
                }
                _ => {}
            }
        }
    }

    /// Rewrite every occurrence of a register, in register and memory
    /// operands alike. Returns the number of rewrites.
    pub fn replace_reg(&mut self, from: VirtReg, to: VirtReg) -> usize {
        let mut count = 0;
        for op in &mut self.operands {
            match &mut op.kind {
                OperandKind::Reg(reg) if *reg == from => {
                    *reg = to;
                    count += 1;
                }
                OperandKind::Mem(mem) => {
                    if mem.replace_reg(from, to) {
                        count += 1;
                    }
                }
                _ => {}
            }
        }
        count
    }

    // ---- synthesis helpers used by clients and lowering passes ----

    /// `mov dst, src` (64-bit).
    pub fn mov_rr(dst: VirtReg, src: VirtReg) -> Instruction {
        let mut instruction = Instruction::synthesised(OpClass::Mov, 64);
        instruction.push_explicit(Operand::reg(dst, Action::Write));
        instruction.push_explicit(Operand::reg(src, Action::Read));
        instruction
    }

    /// `mov dst, imm` (64-bit; encodes as `movabs` when needed).
    pub fn mov_ri(dst: VirtReg, imm: i64) -> Instruction {
        let mut instruction = Instruction::synthesised(OpClass::Mov, 64);
        instruction.push_explicit(Operand::reg(dst, Action::Write));
        instruction.push_explicit(Operand::explicit(OperandKind::Imm(imm), 64, Action::Read));
        instruction
    }

    /// `mov dst, [mem]` (64-bit).
    pub fn mov_rm(dst: VirtReg, mem: MemOperand) -> Instruction {
        let mut instruction = Instruction::synthesised(OpClass::Mov, 64);
        instruction.push_explicit(Operand::reg(dst, Action::Write));
        instruction.push_explicit(Operand::explicit(OperandKind::Mem(mem), 64, Action::Read));
        instruction
    }

    /// `mov [mem], src` (64-bit).
    pub fn mov_mr(mem: MemOperand, src: VirtReg) -> Instruction {
        let mut instruction = Instruction::synthesised(OpClass::Mov, 64);
        instruction.push_explicit(Operand::explicit(OperandKind::Mem(mem), 64, Action::Write));
        instruction.push_explicit(Operand::reg(src, Action::Read));
        instruction
    }

    /// `push reg`.
    pub fn push_reg(reg: VirtReg) -> Instruction {
        let mut instruction = Instruction::synthesised(OpClass::Push, 64);
        instruction.push_explicit(Operand::reg(reg, Action::Read));
        instruction.add_stack_effect(Action::Write);
        instruction
    }

    /// `push [mem]`.
    pub fn push_mem(mem: MemOperand) -> Instruction {
        let mut instruction = Instruction::synthesised(OpClass::Push, 64);
        instruction.push_explicit(Operand::explicit(OperandKind::Mem(mem), 64, Action::Read));
        instruction.add_stack_effect(Action::Write);
        instruction
    }

    /// `pop reg`.
    pub fn pop_reg(reg: VirtReg) -> Instruction {
        let mut instruction = Instruction::synthesised(OpClass::Pop, 64);
        instruction.push_explicit(Operand::reg(reg, Action::Write));
        instruction.add_stack_effect(Action::Read);
        instruction
    }

    /// `lahf` (loads SF/ZF/AF/PF/CF into AH).
    pub fn lahf() -> Instruction {
        let mut instruction = Instruction::synthesised(OpClass::Lahf, 8);
        instruction.push_implicit(Operand::explicit(
            OperandKind::Reg(VirtReg::Native(Gpr::Rax)),
            16,
            Action::Write,
        ));
        instruction.push_implicit(Operand::explicit(OperandKind::Reg(VirtReg::Flags), 8, Action::Read));
        instruction
    }

    /// `sahf` (stores AH into SF/ZF/AF/PF/CF).
    pub fn sahf() -> Instruction {
        let mut instruction = Instruction::synthesised(OpClass::Sahf, 8);
        instruction.push_implicit(Operand::explicit(
            OperandKind::Reg(VirtReg::Native(Gpr::Rax)),
            16,
            Action::Read,
        ));
        instruction.push_implicit(Operand::explicit(OperandKind::Reg(VirtReg::Flags), 8, Action::Write));
        instruction
    }

    /// `seto al` (materialises OF).
    pub fn seto_al() -> Instruction {
        let mut instruction = Instruction::synthesised(OpClass::Setcc, 8);
        instruction.cc = Some(Cc::O);
        instruction.push_explicit(Operand::explicit(
            OperandKind::Reg(VirtReg::Native(Gpr::Rax)),
            8,
            Action::Write,
        ));
        instruction.push_implicit(Operand::explicit(OperandKind::Reg(VirtReg::Flags), 8, Action::Read));
        instruction
    }

    /// `add al, imm8` (used to recover OF before `sahf`).
    pub fn add_al(imm: i8) -> Instruction {
        let mut instruction = Instruction::synthesised(OpClass::Add, 8);
        instruction.push_explicit(Operand::explicit(
            OperandKind::Reg(VirtReg::Native(Gpr::Rax)),
            8,
            Action::ReadWrite,
        ));
        instruction.push_explicit(Operand::explicit(OperandKind::Imm(imm as i64), 8, Action::Read));
        instruction.push_implicit(Operand::explicit(OperandKind::Reg(VirtReg::Flags), 8, Action::Write));
        instruction
    }

    /// `jmp label` (local).
    pub fn jmp_label(label: LabelId) -> Instruction {
        let mut instruction = Instruction::synthesised(OpClass::Jmp, 64);
        instruction.category = Category::DirectJump;
        instruction.push_explicit(Operand::explicit(
            OperandKind::BranchTarget(Target::Label(label)),
            64,
            Action::Read,
        ));
        instruction
    }

    /// `lea dst, [mem]` — address arithmetic without touching the flags.
    pub fn lea(dst: VirtReg, mem: MemOperand) -> Instruction {
        let mut instruction = Instruction::synthesised(OpClass::Lea, 64);
        instruction.push_explicit(Operand::reg(dst, Action::Write));
        instruction.push_explicit(Operand::explicit(OperandKind::Mem(mem), 64, Action::Read));
        instruction
    }

    /// `and reg, imm` (64-bit).
    pub fn and_ri(reg: VirtReg, imm: i64) -> Instruction {
        let mut instruction = Instruction::synthesised(OpClass::And, 64);
        instruction.push_explicit(Operand::reg(reg, Action::ReadWrite));
        instruction.push_explicit(Operand::explicit(OperandKind::Imm(imm), 64, Action::Read));
        instruction.push_implicit(Operand::explicit(OperandKind::Reg(VirtReg::Flags), 8, Action::Write));
        instruction
    }

    /// `mov dst, <address of label>`; the immediate resolves to the
    /// label's cache address at commit time.
    pub fn mov_label_addr(dst: VirtReg, label: LabelId) -> Instruction {
        let mut instruction = Instruction::synthesised(OpClass::Mov, 64);
        instruction.push_explicit(Operand::reg(dst, Action::Write));
        instruction.push_explicit(Operand::explicit(
            OperandKind::BranchTarget(Target::Label(label)),
            64,
            Action::Read,
        ));
        instruction
    }

    /// `jmp` to an already-encoded cache address.
    pub fn jmp_cache(cache_pc: u64) -> Instruction {
        let mut instruction = Instruction::synthesised(OpClass::Jmp, 64);
        instruction.category = Category::DirectJump;
        instruction.push_explicit(Operand::explicit(
            OperandKind::BranchTarget(Target::CachePc(cache_pc)),
            64,
            Action::Read,
        ));
        instruction
    }

    /// `jmp` to another block of the trace. Marked as application code:
    /// it stands in for the application's own fall-through control flow.
    pub fn jmp_block(block: crate::trace::BlockId) -> Instruction {
        let mut instruction = Instruction::synthesised(OpClass::Jmp, 64);
        instruction.category = Category::DirectJump;
        instruction.is_app = true;
        instruction.push_explicit(Operand::explicit(
            OperandKind::BranchTarget(Target::Block(block)),
            64,
            Action::Read,
        ));
        instruction
    }

    /// `jcc label` (local).
    pub fn jcc_label(cc: Cc, label: LabelId) -> Instruction {
        let mut instruction = Instruction::synthesised(OpClass::Jcc, 64);
        instruction.cc = Some(cc);
        instruction.category = Category::ConditionalJump;
        instruction.push_explicit(Operand::explicit(
            OperandKind::BranchTarget(Target::Label(label)),
            64,
            Action::Read,
        ));
        instruction.push_implicit(Operand::explicit(OperandKind::Reg(VirtReg::Flags), 8, Action::Read));
        instruction
    }

    /// `jmp [mem]`.
    pub fn jmp_mem(mem: MemOperand) -> Instruction {
        let mut instruction = Instruction::synthesised(OpClass::Jmp, 64);
        instruction.category = Category::IndirectJump;
        instruction.push_explicit(Operand::explicit(OperandKind::Mem(mem), 64, Action::Read));
        instruction
    }

    /// `cmp a, b` (64-bit registers).
    pub fn cmp_rr(a: VirtReg, b: VirtReg) -> Instruction {
        let mut instruction = Instruction::synthesised(OpClass::Cmp, 64);
        instruction.push_explicit(Operand::reg(a, Action::Read));
        instruction.push_explicit(Operand::reg(b, Action::Read));
        instruction.push_implicit(Operand::explicit(OperandKind::Reg(VirtReg::Flags), 8, Action::Write));
        instruction
    }

    /// `cmp reg, [mem]` (64-bit).
    pub fn cmp_rm(reg: VirtReg, mem: MemOperand) -> Instruction {
        let mut instruction = Instruction::synthesised(OpClass::Cmp, 64);
        instruction.push_explicit(Operand::reg(reg, Action::Read));
        instruction.push_explicit(Operand::explicit(OperandKind::Mem(mem), 64, Action::Read));
        instruction.push_implicit(Operand::explicit(OperandKind::Reg(VirtReg::Flags), 8, Action::Write));
        instruction
    }

    /// The implicit stack-pointer and stack-memory effect of push/pop-like
    /// instructions.
    fn add_stack_effect(&mut self, mem_action: Action) {
        self.push_implicit(Operand::explicit(
            OperandKind::Reg(VirtReg::Native(Gpr::Rsp)),
            64,
            Action::ReadWrite,
        ));
        self.push_implicit(Operand::explicit(
            OperandKind::Mem(MemOperand::Indirect { base: VirtReg::Native(Gpr::Rsp) }),
            64,
            mem_action,
        ));
        self.writes_sp = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_before_implicit() {
        let push = Instruction::push_reg(VirtReg::Native(Gpr::Rdi));
        assert_eq!(push.num_explicit, 1);
        assert!(push.num_explicit as usize <= push.operands.len());
        assert!(!push.operands[0].sticky);
        assert!(push.operands[1..].iter().all(|op| op.sticky));
        assert!(push.writes_sp);
    }

    #[test]
    fn test_replace_reg() {
        let mut mov = Instruction::mov_rm(
            VirtReg::Virt(0),
            MemOperand::Indirect { base: VirtReg::Virt(1) },
        );
        assert_eq!(mov.replace_reg(VirtReg::Virt(1), VirtReg::Native(Gpr::Rcx)), 1);
        assert_eq!(mov.replace_reg(VirtReg::Virt(0), VirtReg::Native(Gpr::Rax)), 1);
        let regs: Vec<_> = {
            let mut regs = Vec::new();
            mov.for_each_reg(|reg, _| regs.push(reg));
            regs
        };
        assert_eq!(regs, vec![VirtReg::Native(Gpr::Rax), VirtReg::Native(Gpr::Rcx)]);
    }

    #[test]
    fn test_local_branch_detection() {
        let jmp = Instruction::jmp_label(LabelId(0));
        assert!(jmp.is_cti());
        assert!(jmp.is_local_branch());

        let mut far = Instruction::jmp_label(LabelId(0));
        far.set_target(Target::AppPc(0x1000));
        assert!(!far.is_local_branch());
    }

    #[test]
    fn test_flag_sequence_effects() {
        assert!(Instruction::lahf().reads_flags());
        assert!(Instruction::sahf().writes_flags());
        assert!(Instruction::seto_al().reads_flags());
        assert!(Instruction::add_al(0x7F).writes_flags());
        assert!(!Instruction::mov_rr(VirtReg::Virt(0), VirtReg::Virt(1)).writes_flags());
    }
}
