//! General-purpose register identifiers
//!
//! Registers are identified by their hardware encoding index (0..=15). The
//! translator widens and narrows accesses by pairing a `Gpr` with a width at
//! the use site; there is no separate id space for `eax`/`ax`/`al`.

use std::fmt;

/// A native general-purpose register, in hardware encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Gpr {
    Rax,
    Rcx,
    Rdx,
    Rbx,
    Rsp,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

impl Gpr {
    /// All sixteen registers, in encoding order.
    pub const ALL: [Gpr; 16] = [
        Gpr::Rax,
        Gpr::Rcx,
        Gpr::Rdx,
        Gpr::Rbx,
        Gpr::Rsp,
        Gpr::Rbp,
        Gpr::Rsi,
        Gpr::Rdi,
        Gpr::R8,
        Gpr::R9,
        Gpr::R10,
        Gpr::R11,
        Gpr::R12,
        Gpr::R13,
        Gpr::R14,
        Gpr::R15,
    ];

    /// Hardware encoding index (0..=15).
    pub fn index(self) -> u8 {
        self as u8
    }

    /// Register for a hardware encoding index.
    pub fn from_index(index: u8) -> Option<Gpr> {
        Gpr::ALL.get(index as usize).copied()
    }

    /// Low three bits of the encoding (the ModRM/SIB field value).
    pub fn low_bits(self) -> u8 {
        self.index() & 0x7
    }

    /// Whether addressing this register requires a REX extension bit.
    pub fn needs_rex_bit(self) -> bool {
        self.index() >= 8
    }

    /// 64-bit register name.
    pub fn name(self) -> &'static str {
        match self {
            Gpr::Rax => "rax",
            Gpr::Rcx => "rcx",
            Gpr::Rdx => "rdx",
            Gpr::Rbx => "rbx",
            Gpr::Rsp => "rsp",
            Gpr::Rbp => "rbp",
            Gpr::Rsi => "rsi",
            Gpr::Rdi => "rdi",
            Gpr::R8 => "r8",
            Gpr::R9 => "r9",
            Gpr::R10 => "r10",
            Gpr::R11 => "r11",
            Gpr::R12 => "r12",
            Gpr::R13 => "r13",
            Gpr::R14 => "r14",
            Gpr::R15 => "r15",
        }
    }
}

impl fmt::Display for Gpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
