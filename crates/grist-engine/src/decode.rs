//! Instruction decoding and IR lifting
//!
//! Drives the machine codec at an application PC and lifts the result into
//! the typed IR: explicit operands are constructed from the machine form,
//! implicit operands are appended sticky, and PC-relative operands are
//! resolved once to absolute targets (the original relativity is
//! reconstituted at encode time).
//!
//! Bytes are read through a [`CodeSource`], so tests can model partially
//! mapped code. A full-width fetch that would cross a readability boundary
//! is retried against the shorter window, which is how instructions
//! straddling an unreadable page decode successfully.

use grist_x86::{self as x86, Gpr, Mem, OpClass, Operands};

use crate::ir::{Action, Instruction, MemOperand, Operand, OperandKind, Target, VirtReg};

/// Error decoding at an application PC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The codec rejected the byte stream. Callers do not follow this
    /// path; they produce a native block at the faulting PC.
    #[error("invalid instruction at {pc:#x}")]
    InvalidInstruction { pc: u64 },
    /// Nothing readable at the PC.
    #[error("unreadable code at {pc:#x}")]
    Unreadable { pc: u64 },
}

/// A source of application code bytes.
pub trait CodeSource {
    /// Copy up to `buf.len()` readable bytes starting at `pc` into `buf`;
    /// returns the number of bytes copied. Short reads mean the remainder
    /// is not readable at this point.
    fn read(&self, pc: u64, buf: &mut [u8]) -> usize;
}

/// A `CodeSource` over explicit in-memory regions; the test and user-space
/// embedding vehicle.
#[derive(Debug, Default)]
pub struct SliceSource {
    regions: Vec<(u64, Vec<u8>)>,
}

impl SliceSource {
    pub fn new() -> SliceSource {
        SliceSource::default()
    }

    /// Map `bytes` at `base`. Regions may be adjacent; they must not
    /// overlap.
    pub fn map(&mut self, base: u64, bytes: Vec<u8>) {
        self.regions.push((base, bytes));
    }

    fn byte_at(&self, pc: u64) -> Option<u8> {
        for (base, bytes) in &self.regions {
            if pc >= *base && pc < *base + bytes.len() as u64 {
                return Some(bytes[(pc - base) as usize]);
            }
        }
        None
    }
}

impl CodeSource for SliceSource {
    fn read(&self, pc: u64, buf: &mut [u8]) -> usize {
        for (i, slot) in buf.iter_mut().enumerate() {
            match self.byte_at(pc + i as u64) {
                Some(byte) => *slot = byte,
                None => return i,
            }
        }
        buf.len()
    }
}

/// A `CodeSource` that reads process memory directly. The initial window
/// stops at a page boundary; the decoder's probe only reaches into the next
/// page when an instruction genuinely continues there.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeSource;

const PAGE_SIZE: u64 = 4096;

impl CodeSource for NativeSource {
    fn read(&self, pc: u64, buf: &mut [u8]) -> usize {
        let to_page_end = (PAGE_SIZE - pc % PAGE_SIZE) as usize;
        let len = buf.len().min(to_page_end.max(1));
        // Safety: the caller asserts `pc` addresses mapped code; the window
        // is capped at the page holding `pc`, and the probe protocol only
        // re-reads past it mid-instruction.
        unsafe {
            std::ptr::copy_nonoverlapping(pc as *const u8, buf.as_mut_ptr(), len);
        }
        len
    }
}

/// Decodes instructions at application PCs and lifts them into the IR.
pub struct InstructionDecoder<'a> {
    source: &'a dyn CodeSource,
}

impl<'a> InstructionDecoder<'a> {
    pub fn new(source: &'a dyn CodeSource) -> InstructionDecoder<'a> {
        InstructionDecoder { source }
    }

    /// Decode one instruction at `pc`.
    pub fn decode(&self, pc: u64) -> Result<Instruction, DecodeError> {
        self.decode_next(pc).map(|(instruction, _)| instruction)
    }

    /// Decode one instruction at `pc` and return the next PC.
    pub fn decode_next(&self, pc: u64) -> Result<(Instruction, u64), DecodeError> {
        let mut window = [0u8; x86::MAX_INSN_LEN];
        let available = self.source.read(pc, &mut window);
        if available == 0 {
            return Err(DecodeError::Unreadable { pc });
        }

        let insn = match x86::decode(&window[..available]) {
            Ok(insn) => insn,
            Err(x86::DecodeError::Truncated(_)) if available < window.len() => {
                // The instruction continues past the readable window; fetch
                // the straddling tail and retry once.
                let more = self.source.read(pc + available as u64, &mut window[available..]);
                if more == 0 {
                    return Err(DecodeError::InvalidInstruction { pc });
                }
                x86::decode(&window[..available + more])
                    .map_err(|_| DecodeError::InvalidInstruction { pc })?
            }
            Err(_) => return Err(DecodeError::InvalidInstruction { pc }),
        };

        let next_pc = pc + insn.len as u64;
        tracing::trace!(pc, class = ?insn.class, len = insn.len, "decoded");
        Ok((lift(pc, &insn), next_pc))
    }
}

/// Lift a machine record into an IR instruction at `pc`.
fn lift(pc: u64, insn: &x86::Insn) -> Instruction {
    let mut out = Instruction {
        class: insn.class,
        cc: insn.cc,
        category: insn.category(),
        decoded_pc: Some(pc),
        decoded_len: normalised_len(insn),
        operands: Default::default(),
        num_explicit: 0,
        prefixes: insn.prefixes,
        opsize: insn.opsize,
        is_atomic: insn.prefixes.lock,
        writes_sp: insn.writes_stack_pointer(),
        is_app: true,
    };

    let next_pc = pc + insn.len as u64;
    let width = insn.opsize;

    match insn.operands {
        Operands::None => {}
        Operands::Reg(reg) => {
            out.push_explicit(Operand::explicit(
                OperandKind::Reg(VirtReg::Native(reg)),
                width,
                single_reg_action(insn.class),
            ));
        }
        Operands::RegReg { dst, src } => {
            let (dst_action, src_action) = two_op_actions(insn.class);
            out.push_explicit(Operand::explicit(OperandKind::Reg(VirtReg::Native(dst)), width, dst_action));
            out.push_explicit(Operand::explicit(OperandKind::Reg(VirtReg::Native(src)), width, src_action));
        }
        Operands::RegMem { reg, mem } => {
            let (reg_action, _) = two_op_actions(insn.class);
            out.push_explicit(Operand::explicit(OperandKind::Reg(VirtReg::Native(reg)), width, reg_action));
            out.push_explicit(Operand::explicit(
                OperandKind::Mem(lift_mem(&mem, next_pc)),
                width,
                Action::Read,
            ));
        }
        Operands::MemReg { mem, reg } => {
            let (mem_action, reg_action) = two_op_actions(insn.class);
            out.push_explicit(Operand::explicit(
                OperandKind::Mem(lift_mem(&mem, next_pc)),
                width,
                mem_action,
            ));
            out.push_explicit(Operand::explicit(OperandKind::Reg(VirtReg::Native(reg)), width, reg_action));
        }
        Operands::RegImm { reg, imm } => {
            let (dst_action, _) = two_op_actions(insn.class);
            out.push_explicit(Operand::explicit(OperandKind::Reg(VirtReg::Native(reg)), width, dst_action));
            out.push_explicit(Operand::explicit(OperandKind::Imm(imm), width, Action::Read));
        }
        Operands::MemImm { mem, imm } => {
            let (mem_action, _) = two_op_actions(insn.class);
            out.push_explicit(Operand::explicit(
                OperandKind::Mem(lift_mem(&mem, next_pc)),
                width,
                mem_action,
            ));
            out.push_explicit(Operand::explicit(OperandKind::Imm(imm), width, Action::Read));
        }
        Operands::Imm(imm) => {
            out.push_explicit(Operand::explicit(OperandKind::Imm(imm), width, Action::Read));
        }
        Operands::Mem(mem) => {
            out.push_explicit(Operand::explicit(
                OperandKind::Mem(lift_mem(&mem, next_pc)),
                width,
                single_mem_action(insn.class),
            ));
        }
        Operands::Rel { disp, .. } => {
            // Resolved once; the IR stores the absolute target.
            let target = next_pc.wrapping_add(disp as i64 as u64);
            out.push_explicit(Operand::explicit(
                OperandKind::BranchTarget(Target::AppPc(target)),
                64,
                Action::Read,
            ));
        }
    }

    add_implicit_operands(&mut out);
    out
}

/// Branches are widened to their rel32 form so later size estimates can
/// only grow an instruction, never shrink it.
fn normalised_len(insn: &x86::Insn) -> u8 {
    match insn.operands {
        Operands::Rel { width: 8, .. } => {
            let rel32_body = if insn.class == OpClass::Jcc { 6 } else { 5 };
            insn.len - 2 + rel32_body
        }
        _ => insn.len,
    }
}

fn lift_mem(mem: &Mem, next_pc: u64) -> MemOperand {
    if mem.rip_relative {
        return MemOperand::PcRelative { target: next_pc.wrapping_add(mem.disp as i64 as u64) };
    }
    if let Some(seg) = mem.seg {
        return MemOperand::Segmented {
            seg,
            base: mem.base.map(VirtReg::Native),
            disp: mem.disp,
        };
    }
    match (mem.base, mem.index) {
        (None, None) => MemOperand::Absolute(mem.disp as i64 as u64),
        (Some(base), None) if mem.disp == 0 => MemOperand::Indirect { base: VirtReg::Native(base) },
        (base, index) => MemOperand::Compound {
            base: base.map(VirtReg::Native),
            index: index.map(|(reg, scale)| (VirtReg::Native(reg), scale)),
            disp: mem.disp,
        },
    }
}

/// Access action of a lone register/memory operand.
fn single_reg_action(class: OpClass) -> Action {
    match class {
        OpClass::Push | OpClass::Jmp | OpClass::Call => Action::Read,
        OpClass::Pop | OpClass::Setcc => Action::Write,
        _ => Action::ReadWrite,
    }
}

fn single_mem_action(class: OpClass) -> Action {
    match class {
        OpClass::Push | OpClass::Jmp | OpClass::Call => Action::Read,
        OpClass::Pop | OpClass::Setcc => Action::Write,
        _ => Action::ReadWrite,
    }
}

/// Access actions for (destination-side, source-side) of two-operand forms.
fn two_op_actions(class: OpClass) -> (Action, Action) {
    match class {
        OpClass::Mov | OpClass::Lea => (Action::Write, Action::Read),
        OpClass::Cmp | OpClass::Test => (Action::Read, Action::Read),
        OpClass::Xchg => (Action::ReadWrite, Action::ReadWrite),
        _ => (Action::ReadWrite, Action::Read),
    }
}

/// Append the sticky implicit operands of an instruction: flags effects,
/// stack-pointer effects, and the architectural clobbers of `syscall`.
fn add_implicit_operands(out: &mut Instruction) {
    let class = out.class;

    match (class.reads_flags(), class.writes_flags()) {
        (true, true) => {
            out.push_implicit(Operand::explicit(OperandKind::Reg(VirtReg::Flags), 8, Action::ReadWrite));
        }
        (true, false) => {
            out.push_implicit(Operand::explicit(OperandKind::Reg(VirtReg::Flags), 8, Action::Read));
        }
        (false, true) => {
            out.push_implicit(Operand::explicit(OperandKind::Reg(VirtReg::Flags), 8, Action::Write));
        }
        (false, false) => {}
    }

    if class.implicitly_writes_rsp() {
        let mem_action = match class {
            OpClass::Push | OpClass::Pushf | OpClass::Call => Action::Write,
            _ => Action::Read,
        };
        out.push_implicit(Operand::explicit(
            OperandKind::Reg(VirtReg::Native(Gpr::Rsp)),
            64,
            Action::ReadWrite,
        ));
        out.push_implicit(Operand::explicit(
            OperandKind::Mem(MemOperand::Indirect { base: VirtReg::Native(Gpr::Rsp) }),
            64,
            mem_action,
        ));
    }

    match class {
        OpClass::Lahf => {
            out.push_implicit(Operand::explicit(
                OperandKind::Reg(VirtReg::Native(Gpr::Rax)),
                16,
                Action::Write,
            ));
        }
        OpClass::Sahf => {
            out.push_implicit(Operand::explicit(
                OperandKind::Reg(VirtReg::Native(Gpr::Rax)),
                16,
                Action::Read,
            ));
        }
        OpClass::Syscall => {
            out.push_implicit(Operand::explicit(
                OperandKind::Reg(VirtReg::Native(Gpr::Rax)),
                64,
                Action::ReadWrite,
            ));
            out.push_implicit(Operand::explicit(
                OperandKind::Reg(VirtReg::Native(Gpr::Rcx)),
                64,
                Action::Write,
            ));
            out.push_implicit(Operand::explicit(
                OperandKind::Reg(VirtReg::Native(Gpr::R11)),
                64,
                Action::Write,
            ));
        }
        _ => {}
    }
}
