//! x86-64 instruction records and byte-level codec
//!
//! This crate is the machine-code end of the translator: it turns raw bytes
//! into typed [`Insn`] records and typed records back into bytes. It covers
//! the general-purpose subset a binary translator manipulates (moves, ALU
//! ops, stack ops, control transfers, flag materialisation) rather than the
//! whole ISA; anything outside the subset decodes to an error, which callers
//! treat as "leave this code native".
//!
//! Decoding is pure: it reads from a caller-supplied byte window and never
//! touches process memory itself. Encoding appends to a caller-supplied
//! buffer and returns the number of bytes written.

pub mod decode;
pub mod encode;
pub mod insn;
pub mod reg;

pub use decode::{decode, DecodeError, MAX_INSN_LEN};
pub use encode::{encode, EncodeError};
pub use insn::{Category, Cc, Insn, Mem, OpClass, Operands, Prefixes, Seg};
pub use reg::Gpr;
