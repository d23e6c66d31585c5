//! Typed x86-64 instruction records
//!
//! An [`Insn`] is the machine-level view of one instruction: opcode class,
//! decoded prefixes, effective operand size, and typed operands. Relative
//! branch displacements are kept relative here; resolving them against a
//! program counter is the consumer's job.

use std::fmt;

use crate::reg::Gpr;

/// Opcode classes covered by the codec.
///
/// One class per mnemonic family; addressing forms are carried by
/// [`Operands`], condition codes by [`Insn::cc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpClass {
    Add,
    Or,
    Adc,
    Sbb,
    And,
    Sub,
    Xor,
    Cmp,
    Mov,
    Lea,
    Test,
    Xchg,
    Push,
    Pop,
    Pushf,
    Popf,
    Lahf,
    Sahf,
    Setcc,
    Inc,
    Dec,
    Neg,
    Not,
    Imul,
    Jmp,
    Jcc,
    Call,
    Ret,
    Nop,
    Ud2,
    Int3,
    Int,
    Syscall,
    Cli,
    Sti,
}

impl OpClass {
    /// Whether this class writes the arithmetic flags.
    pub fn writes_flags(self) -> bool {
        matches!(
            self,
            OpClass::Add
                | OpClass::Or
                | OpClass::Adc
                | OpClass::Sbb
                | OpClass::And
                | OpClass::Sub
                | OpClass::Xor
                | OpClass::Cmp
                | OpClass::Test
                | OpClass::Inc
                | OpClass::Dec
                | OpClass::Neg
                | OpClass::Imul
                | OpClass::Sahf
                | OpClass::Popf
        )
    }

    /// Whether this class reads the arithmetic flags.
    pub fn reads_flags(self) -> bool {
        matches!(
            self,
            OpClass::Adc | OpClass::Sbb | OpClass::Jcc | OpClass::Setcc | OpClass::Lahf | OpClass::Pushf
        )
    }

    /// Whether this class implicitly moves the stack pointer.
    pub fn implicitly_writes_rsp(self) -> bool {
        matches!(
            self,
            OpClass::Push | OpClass::Pop | OpClass::Pushf | OpClass::Popf | OpClass::Call | OpClass::Ret
        )
    }

    /// Whether this class can change interrupt delivery on the current CPU.
    pub fn changes_interrupt_state(self) -> bool {
        matches!(self, OpClass::Cli | OpClass::Sti | OpClass::Popf)
    }
}

/// Control-flow category of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    /// Straight-line computation.
    Normal,
    /// Unconditional PC-relative jump.
    DirectJump,
    /// Conditional PC-relative jump.
    ConditionalJump,
    /// PC-relative call.
    DirectCall,
    /// Jump through a register or memory operand.
    IndirectJump,
    /// Call through a register or memory operand.
    IndirectCall,
    /// Function return.
    Ret,
    /// System call entry.
    Syscall,
    /// Software interrupt or trap.
    Interrupt,
}

impl Category {
    /// Whether the category transfers control away from the fall-through.
    pub fn is_control_flow(self) -> bool {
        !matches!(self, Category::Normal)
    }
}

/// Condition codes, in hardware encoding order (the `cc` nibble).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cc {
    O,
    No,
    B,
    Ae,
    E,
    Ne,
    Be,
    A,
    S,
    Ns,
    P,
    Np,
    L,
    Ge,
    Le,
    G,
}

impl Cc {
    /// All condition codes in encoding order.
    pub const ALL: [Cc; 16] = [
        Cc::O,
        Cc::No,
        Cc::B,
        Cc::Ae,
        Cc::E,
        Cc::Ne,
        Cc::Be,
        Cc::A,
        Cc::S,
        Cc::Ns,
        Cc::P,
        Cc::Np,
        Cc::L,
        Cc::Ge,
        Cc::Le,
        Cc::G,
    ];

    /// The encoding nibble.
    pub fn index(self) -> u8 {
        self as u8
    }

    /// Condition code for an encoding nibble.
    pub fn from_index(index: u8) -> Option<Cc> {
        Cc::ALL.get(index as usize).copied()
    }
}

/// Segment override prefixes meaningful in 64-bit mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Seg {
    Fs,
    Gs,
}

impl Seg {
    /// The prefix byte.
    pub fn prefix_byte(self) -> u8 {
        match self {
            Seg::Fs => 0x64,
            Seg::Gs => 0x65,
        }
    }
}

/// Decoded prefix state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Prefixes {
    /// `lock` (F0).
    pub lock: bool,
    /// `rep`/`repe` (F3).
    pub rep: bool,
    /// `repne` (F2).
    pub repne: bool,
    /// Segment override.
    pub seg: Option<Seg>,
    /// Branch hint from a 2E/3E prefix on a conditional jump:
    /// `Some(true)` = taken, `Some(false)` = not taken.
    pub branch_hint: Option<bool>,
}

/// A memory operand: `seg:[base + index*scale + disp]`, or RIP-relative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mem {
    /// Base register, absent for absolute and RIP-relative forms.
    pub base: Option<Gpr>,
    /// Index register and scale (1, 2, 4 or 8).
    pub index: Option<(Gpr, u8)>,
    /// Displacement, sign-extended.
    pub disp: i32,
    /// True for `[rip + disp32]` addressing.
    pub rip_relative: bool,
    /// Segment override applying to this access.
    pub seg: Option<Seg>,
}

impl Mem {
    /// Plain register-indirect access.
    pub fn base(base: Gpr) -> Mem {
        Mem { base: Some(base), index: None, disp: 0, rip_relative: false, seg: None }
    }

    /// Base-plus-displacement access.
    pub fn base_disp(base: Gpr, disp: i32) -> Mem {
        Mem { base: Some(base), index: None, disp, rip_relative: false, seg: None }
    }

    /// RIP-relative access.
    pub fn rip(disp: i32) -> Mem {
        Mem { base: None, index: None, disp, rip_relative: true, seg: None }
    }

    /// Absolute disp32 access (no base, no index), optionally segment-based.
    pub fn absolute(disp: i32, seg: Option<Seg>) -> Mem {
        Mem { base: None, index: None, disp, rip_relative: false, seg }
    }
}

/// Typed operands, one variant per addressing form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operands {
    /// No explicit operands (`ret`, `nop`, `lahf`, ...).
    None,
    /// One register (`push r`, `pop r`, `inc r`, `setcc r8`, ...).
    Reg(Gpr),
    /// Register destination, register source.
    RegReg { dst: Gpr, src: Gpr },
    /// Register destination, memory source.
    RegMem { reg: Gpr, mem: Mem },
    /// Memory destination, register source.
    MemReg { mem: Mem, reg: Gpr },
    /// Register destination, immediate source.
    RegImm { reg: Gpr, imm: i64 },
    /// Memory destination, immediate source.
    MemImm { mem: Mem, imm: i64 },
    /// One immediate (`push imm`, `int imm8`, `ret imm16`).
    Imm(i64),
    /// One memory operand (`push [m]`, `inc [m]`, `call [m]`, ...).
    Mem(Mem),
    /// PC-relative displacement (`jmp`, `jcc`, `call`), with the encoded
    /// displacement width in bits (8 or 32).
    Rel { disp: i32, width: u8 },
}

/// One decoded (or to-be-encoded) machine instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Insn {
    /// Opcode class.
    pub class: OpClass,
    /// Condition code, for `Jcc`/`Setcc`.
    pub cc: Option<Cc>,
    /// Decoded prefixes.
    pub prefixes: Prefixes,
    /// Effective operand size in bits (8, 16, 32 or 64).
    pub opsize: u8,
    /// Typed operands.
    pub operands: Operands,
    /// Total encoded length in bytes. Set by the decoder; ignored by the
    /// encoder (which reports the length it produced).
    pub len: u8,
}

impl Insn {
    /// A fresh record with no prefixes and the given class/operands.
    pub fn new(class: OpClass, opsize: u8, operands: Operands) -> Insn {
        Insn { class, cc: None, prefixes: Prefixes::default(), opsize, operands, len: 0 }
    }

    /// A conditional instruction (`jcc` / `setcc`).
    pub fn with_cc(class: OpClass, cc: Cc, opsize: u8, operands: Operands) -> Insn {
        Insn { class, cc: Some(cc), prefixes: Prefixes::default(), opsize, operands, len: 0 }
    }

    /// Control-flow category, derived from class and operand form.
    pub fn category(&self) -> Category {
        match self.class {
            OpClass::Jmp => match self.operands {
                Operands::Rel { .. } => Category::DirectJump,
                _ => Category::IndirectJump,
            },
            OpClass::Jcc => Category::ConditionalJump,
            OpClass::Call => match self.operands {
                Operands::Rel { .. } => Category::DirectCall,
                _ => Category::IndirectCall,
            },
            OpClass::Ret => Category::Ret,
            OpClass::Syscall => Category::Syscall,
            OpClass::Int | OpClass::Int3 | OpClass::Ud2 => Category::Interrupt,
            _ => Category::Normal,
        }
    }

    /// Whether the instruction moves the stack pointer, either implicitly
    /// (push/pop/call/ret) or by naming RSP as a written register operand.
    pub fn writes_stack_pointer(&self) -> bool {
        if self.class.implicitly_writes_rsp() {
            return true;
        }
        match self.operands {
            Operands::Reg(reg) => {
                reg == Gpr::Rsp
                    && matches!(
                        self.class,
                        OpClass::Inc | OpClass::Dec | OpClass::Neg | OpClass::Not
                    )
            }
            Operands::RegReg { dst, .. }
            | Operands::RegMem { reg: dst, .. }
            | Operands::RegImm { reg: dst, .. } => {
                dst == Gpr::Rsp && !matches!(self.class, OpClass::Cmp | OpClass::Test)
            }
            _ => false,
        }
    }

    /// The two semantic comparison keys: everything except the encoded
    /// length, which legitimately differs between an original encoding and
    /// a canonical re-encoding.
    pub fn semantically_eq(&self, other: &Insn) -> bool {
        self.class == other.class
            && self.cc == other.cc
            && self.prefixes == other.prefixes
            && self.opsize == other.opsize
            && self.operands == other.operands
    }
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.class)?;
        if let Some(cc) = self.cc {
            write!(f, ".{:?}", cc)?;
        }
        write!(f, "/{} {:?}", self.opsize, self.operands)
    }
}
