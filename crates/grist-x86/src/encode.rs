//! Byte encoder
//!
//! Encodes one [`Insn`] record, appending to a caller-supplied buffer.
//! The encoder picks one canonical encoding per operand form; re-decoding
//! its output yields a record equal to the input in every semantic field
//! (the encoded length may differ from a decoded original).

use crate::insn::{Insn, Mem, OpClass, Operands};
use crate::reg::Gpr;

/// Error encoding a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    /// The operand combination has no encoding for this class.
    #[error("unencodable operand combination for {0:?}")]
    BadOperands(OpClass),
    /// An immediate or displacement does not fit its encoded width.
    #[error("immediate out of range for {0:?}")]
    ImmRange(OpClass),
}

/// Encode `insn`, appending to `out`. Returns the number of bytes written.
pub fn encode(insn: &Insn, out: &mut Vec<u8>) -> Result<usize, EncodeError> {
    let start = out.len();
    Encoder { insn, out }.run()?;
    Ok(out.len() - start)
}

struct Encoder<'a> {
    insn: &'a Insn,
    out: &'a mut Vec<u8>,
}

/// REX accumulator. `force` is set when a byte-width uniform register
/// (spl/bpl/sil/dil) needs a bare 0x40 prefix.
#[derive(Default, Clone, Copy)]
struct Rex {
    w: bool,
    r: bool,
    x: bool,
    b: bool,
    force: bool,
}

impl Rex {
    fn byte(self) -> Option<u8> {
        if self.w || self.r || self.x || self.b || self.force {
            Some(0x40
                | (self.w as u8) << 3
                | (self.r as u8) << 2
                | (self.x as u8) << 1
                | self.b as u8)
        } else {
            None
        }
    }
}

impl<'a> Encoder<'a> {
    fn put(&mut self, byte: u8) {
        self.out.push(byte);
    }

    fn put_i32(&mut self, value: i32) {
        self.out.extend_from_slice(&value.to_le_bytes());
    }

    fn opsize(&self) -> u8 {
        self.insn.opsize
    }

    /// Whether this class defaults to 64-bit operands in long mode (so
    /// REX.W is never emitted for it).
    fn defaults_to_64(&self) -> bool {
        matches!(
            self.insn.class,
            OpClass::Push
                | OpClass::Pop
                | OpClass::Pushf
                | OpClass::Popf
                | OpClass::Call
                | OpClass::Jmp
                | OpClass::Jcc
                | OpClass::Ret
        )
    }

    fn class_err(&self) -> EncodeError {
        EncodeError::BadOperands(self.insn.class)
    }

    /// Fold a register into the REX accumulator for a ModRM `reg`/`rm`/
    /// opcode-embedded position.
    fn fold_reg(&self, rex: &mut Rex, reg: Gpr, position: RegPos) {
        match position {
            RegPos::Reg => rex.r |= reg.needs_rex_bit(),
            RegPos::Rm => rex.b |= reg.needs_rex_bit(),
            RegPos::Index => rex.x |= reg.needs_rex_bit(),
        }
        if self.opsize() == 8 && (4..8).contains(&reg.index()) {
            // spl/bpl/sil/dil need a REX prefix to avoid the high-byte ids.
            rex.force = true;
        }
    }

    fn fold_mem(&self, rex: &mut Rex, mem: &Mem) {
        if let Some(base) = mem.base {
            rex.b |= base.needs_rex_bit();
        }
        if let Some((index, _)) = mem.index {
            rex.x |= index.needs_rex_bit();
        }
    }

    /// Legacy prefixes, then REX. Must run before the opcode bytes.
    fn prefixes(&mut self, seg: Option<crate::insn::Seg>, rex: Rex) {
        let p = self.insn.prefixes;
        if p.lock {
            self.put(0xF0);
        }
        if p.repne {
            self.put(0xF2);
        }
        if p.rep {
            self.put(0xF3);
        }
        if let Some(taken) = p.branch_hint {
            self.put(if taken { 0x3E } else { 0x2E });
        }
        if let Some(seg) = seg.or(p.seg) {
            self.put(seg.prefix_byte());
        }
        if self.opsize() == 16 {
            self.put(0x66);
        }
        if let Some(byte) = rex.byte() {
            self.put(byte);
        }
    }

    /// ModRM (+ SIB + displacement) with a register in the `reg` field and
    /// a register in the `r/m` field.
    fn modrm_reg_reg(&mut self, reg_field: u8, rm: Gpr) {
        self.put(0b11 << 6 | (reg_field & 7) << 3 | rm.low_bits());
    }

    /// ModRM (+ SIB + displacement) with a memory operand in `r/m`.
    fn modrm_mem(&mut self, reg_field: u8, mem: &Mem) -> Result<(), EncodeError> {
        let reg_field = (reg_field & 7) << 3;

        if mem.rip_relative {
            self.put(reg_field | 0b101);
            self.put_i32(mem.disp);
            return Ok(());
        }

        match (mem.base, mem.index) {
            (None, None) => {
                // Absolute disp32: SIB with no base, no index.
                self.put(reg_field | 0b100);
                self.put(0x25);
                self.put_i32(mem.disp);
            }
            (Some(base), None) if base.low_bits() != 0b100 => {
                self.modrm_disp(reg_field, base.low_bits(), base, mem.disp, false)?;
            }
            (Some(base), None) => {
                // rsp/r12 base always takes a SIB byte.
                self.modrm_disp(reg_field, 0b100, base, mem.disp, true)?;
                // SIB emitted inside modrm_disp.
            }
            (base, Some((index, scale))) => {
                if index.index() == 0b100 {
                    // rsp cannot be an index register.
                    return Err(self.class_err());
                }
                let ss = match scale {
                    1 => 0u8,
                    2 => 1,
                    4 => 2,
                    8 => 3,
                    _ => return Err(self.class_err()),
                };
                let (md, base_bits) = match base {
                    None => (0b00, 0b101),
                    Some(b) => {
                        let md = Self::disp_mode(b, mem.disp);
                        (md, b.low_bits())
                    }
                };
                self.put((md << 6) | reg_field | 0b100);
                self.put((ss << 6) | (index.low_bits() << 3) | base_bits);
                match (md, base) {
                    (0b00, None) => self.put_i32(mem.disp),
                    (0b00, Some(_)) => {}
                    (0b01, _) => self.put(mem.disp as i8 as u8),
                    _ => self.put_i32(mem.disp),
                }
            }
        }
        Ok(())
    }

    /// Displacement mode bits for a base register.
    fn disp_mode(base: Gpr, disp: i32) -> u8 {
        if disp == 0 && base.low_bits() != 0b101 {
            0b00
        } else if i8::try_from(disp).is_ok() {
            0b01
        } else {
            0b10
        }
    }

    fn modrm_disp(
        &mut self,
        reg_field: u8,
        rm_bits: u8,
        base: Gpr,
        disp: i32,
        sib: bool,
    ) -> Result<(), EncodeError> {
        let md = Self::disp_mode(base, disp);
        self.put((md << 6) | reg_field | rm_bits);
        if sib {
            // No index: index field = 100.
            self.put(0b100 << 3 | base.low_bits());
        }
        match md {
            0b00 => {}
            0b01 => self.put(disp as i8 as u8),
            _ => self.put_i32(disp),
        }
        Ok(())
    }

    /// Immediate at the instruction's effective width (imm32 max for 64-bit).
    fn imm_for_opsize(&mut self, imm: i64) -> Result<(), EncodeError> {
        match self.opsize() {
            8 => {
                let v = i8::try_from(imm).map_err(|_| EncodeError::ImmRange(self.insn.class))?;
                self.put(v as u8);
            }
            16 => {
                let v = i16::try_from(imm).map_err(|_| EncodeError::ImmRange(self.insn.class))?;
                self.out.extend_from_slice(&v.to_le_bytes());
            }
            _ => {
                let v = i32::try_from(imm).map_err(|_| EncodeError::ImmRange(self.insn.class))?;
                self.put_i32(v);
            }
        }
        Ok(())
    }

    fn run(mut self) -> Result<(), EncodeError> {
        use OpClass::*;
        match self.insn.class {
            Add | Or | Adc | Sbb | And | Sub | Xor | Cmp => self.group1(),
            Mov => self.mov(),
            Lea => self.lea(),
            Test => self.test(),
            Xchg => self.xchg(),
            Push => self.push(),
            Pop => self.pop(),
            Pushf => self.fixed(&[0x9C]),
            Popf => self.fixed(&[0x9D]),
            Lahf => self.fixed(&[0x9F]),
            Sahf => self.fixed(&[0x9E]),
            Setcc => self.setcc(),
            Inc | Dec => self.inc_dec(),
            Neg | Not => self.neg_not(),
            Imul => self.imul(),
            Jmp => self.jmp(),
            Jcc => self.jcc(),
            Call => self.call(),
            Ret => self.ret(),
            Nop => self.fixed(&[0x90]),
            Ud2 => self.fixed(&[0x0F, 0x0B]),
            Int3 => self.fixed(&[0xCC]),
            Int => self.int(),
            Syscall => self.fixed(&[0x0F, 0x05]),
            Cli => self.fixed(&[0xFA]),
            Sti => self.fixed(&[0xFB]),
        }
    }

    fn fixed(&mut self, bytes: &[u8]) -> Result<(), EncodeError> {
        if self.insn.operands != Operands::None {
            return Err(self.class_err());
        }
        self.prefixes(None, Rex::default());
        self.out.extend_from_slice(bytes);
        Ok(())
    }

    fn rex_w(&self) -> Rex {
        Rex { w: self.opsize() == 64 && !self.defaults_to_64(), ..Rex::default() }
    }

    /// Group-1 ALU instruction (add/or/adc/sbb/and/sub/xor/cmp).
    fn group1(&mut self) -> Result<(), EncodeError> {
        let op = match self.insn.class {
            OpClass::Add => 0u8,
            OpClass::Or => 1,
            OpClass::Adc => 2,
            OpClass::Sbb => 3,
            OpClass::And => 4,
            OpClass::Sub => 5,
            OpClass::Xor => 6,
            OpClass::Cmp => 7,
            _ => unreachable!(),
        };
        let byte_width = self.opsize() == 8;
        match self.insn.operands {
            Operands::RegReg { dst, src } => {
                let mut rex = self.rex_w();
                self.fold_reg(&mut rex, src, RegPos::Reg);
                self.fold_reg(&mut rex, dst, RegPos::Rm);
                self.prefixes(None, rex);
                self.put((op << 3) | if byte_width { 0x00 } else { 0x01 });
                self.modrm_reg_reg(src.low_bits(), dst);
            }
            Operands::MemReg { mem, reg } => {
                let mut rex = self.rex_w();
                self.fold_reg(&mut rex, reg, RegPos::Reg);
                self.fold_mem(&mut rex, &mem);
                self.prefixes(mem.seg, rex);
                self.put((op << 3) | if byte_width { 0x00 } else { 0x01 });
                self.modrm_mem(reg.low_bits(), &mem)?;
            }
            Operands::RegMem { reg, mem } => {
                let mut rex = self.rex_w();
                self.fold_reg(&mut rex, reg, RegPos::Reg);
                self.fold_mem(&mut rex, &mem);
                self.prefixes(mem.seg, rex);
                self.put((op << 3) | if byte_width { 0x02 } else { 0x03 });
                self.modrm_mem(reg.low_bits(), &mem)?;
            }
            Operands::RegImm { reg, imm } => {
                let mut rex = self.rex_w();
                self.fold_reg(&mut rex, reg, RegPos::Rm);
                self.prefixes(None, rex);
                self.put(self.group1_imm_opcode(imm)?);
                self.modrm_reg_reg(op, reg);
                self.group1_imm_value(imm)?;
            }
            Operands::MemImm { mem, imm } => {
                let mut rex = self.rex_w();
                self.fold_mem(&mut rex, &mem);
                self.prefixes(mem.seg, rex);
                self.put(self.group1_imm_opcode(imm)?);
                self.modrm_mem(op, &mem)?;
                self.group1_imm_value(imm)?;
            }
            _ => return Err(self.class_err()),
        }
        Ok(())
    }

    /// Opcode byte for a group-1 immediate form, preferring the
    /// sign-extended imm8 form when the value fits.
    fn group1_imm_opcode(&self, imm: i64) -> Result<u8, EncodeError> {
        if self.opsize() == 8 {
            i8::try_from(imm).map_err(|_| EncodeError::ImmRange(self.insn.class))?;
            Ok(0x80)
        } else if i8::try_from(imm).is_ok() {
            Ok(0x83)
        } else {
            Ok(0x81)
        }
    }

    fn group1_imm_value(&mut self, imm: i64) -> Result<(), EncodeError> {
        if self.opsize() == 8 || i8::try_from(imm).is_ok() {
            let v = i8::try_from(imm).map_err(|_| EncodeError::ImmRange(self.insn.class))?;
            self.put(v as u8);
            Ok(())
        } else {
            self.imm_for_opsize(imm)
        }
    }

    fn mov(&mut self) -> Result<(), EncodeError> {
        let byte_width = self.opsize() == 8;
        match self.insn.operands {
            Operands::RegReg { dst, src } => {
                let mut rex = self.rex_w();
                self.fold_reg(&mut rex, src, RegPos::Reg);
                self.fold_reg(&mut rex, dst, RegPos::Rm);
                self.prefixes(None, rex);
                self.put(if byte_width { 0x88 } else { 0x89 });
                self.modrm_reg_reg(src.low_bits(), dst);
            }
            Operands::MemReg { mem, reg } => {
                let mut rex = self.rex_w();
                self.fold_reg(&mut rex, reg, RegPos::Reg);
                self.fold_mem(&mut rex, &mem);
                self.prefixes(mem.seg, rex);
                self.put(if byte_width { 0x88 } else { 0x89 });
                self.modrm_mem(reg.low_bits(), &mem)?;
            }
            Operands::RegMem { reg, mem } => {
                let mut rex = self.rex_w();
                self.fold_reg(&mut rex, reg, RegPos::Reg);
                self.fold_mem(&mut rex, &mem);
                self.prefixes(mem.seg, rex);
                self.put(if byte_width { 0x8A } else { 0x8B });
                self.modrm_mem(reg.low_bits(), &mem)?;
            }
            Operands::RegImm { reg, imm } => {
                if self.opsize() == 64 && i32::try_from(imm).is_err() {
                    // movabs r64, imm64.
                    let mut rex = Rex { w: true, ..Rex::default() };
                    self.fold_reg(&mut rex, reg, RegPos::Rm);
                    self.prefixes(None, rex);
                    self.put(0xB8 | reg.low_bits());
                    self.out.extend_from_slice(&imm.to_le_bytes());
                } else {
                    let mut rex = self.rex_w();
                    self.fold_reg(&mut rex, reg, RegPos::Rm);
                    self.prefixes(None, rex);
                    self.put(if byte_width { 0xC6 } else { 0xC7 });
                    self.modrm_reg_reg(0, reg);
                    self.imm_for_opsize(imm)?;
                }
            }
            Operands::MemImm { mem, imm } => {
                let mut rex = self.rex_w();
                self.fold_mem(&mut rex, &mem);
                self.prefixes(mem.seg, rex);
                self.put(if byte_width { 0xC6 } else { 0xC7 });
                self.modrm_mem(0, &mem)?;
                self.imm_for_opsize(imm)?;
            }
            _ => return Err(self.class_err()),
        }
        Ok(())
    }

    fn lea(&mut self) -> Result<(), EncodeError> {
        match self.insn.operands {
            Operands::RegMem { reg, mem } => {
                let mut rex = self.rex_w();
                self.fold_reg(&mut rex, reg, RegPos::Reg);
                self.fold_mem(&mut rex, &mem);
                // lea ignores segment overrides; none emitted.
                self.prefixes(None, rex);
                self.put(0x8D);
                self.modrm_mem(reg.low_bits(), &mem)
            }
            _ => Err(self.class_err()),
        }
    }

    fn test(&mut self) -> Result<(), EncodeError> {
        let byte_width = self.opsize() == 8;
        match self.insn.operands {
            Operands::RegReg { dst, src } => {
                let mut rex = self.rex_w();
                self.fold_reg(&mut rex, src, RegPos::Reg);
                self.fold_reg(&mut rex, dst, RegPos::Rm);
                self.prefixes(None, rex);
                self.put(if byte_width { 0x84 } else { 0x85 });
                self.modrm_reg_reg(src.low_bits(), dst);
            }
            Operands::MemReg { mem, reg } => {
                let mut rex = self.rex_w();
                self.fold_reg(&mut rex, reg, RegPos::Reg);
                self.fold_mem(&mut rex, &mem);
                self.prefixes(mem.seg, rex);
                self.put(if byte_width { 0x84 } else { 0x85 });
                self.modrm_mem(reg.low_bits(), &mem)?;
            }
            Operands::RegImm { reg, imm } => {
                let mut rex = self.rex_w();
                self.fold_reg(&mut rex, reg, RegPos::Rm);
                self.prefixes(None, rex);
                self.put(if byte_width { 0xF6 } else { 0xF7 });
                self.modrm_reg_reg(0, reg);
                self.imm_for_opsize(imm)?;
            }
            Operands::MemImm { mem, imm } => {
                let mut rex = self.rex_w();
                self.fold_mem(&mut rex, &mem);
                self.prefixes(mem.seg, rex);
                self.put(if byte_width { 0xF6 } else { 0xF7 });
                self.modrm_mem(0, &mem)?;
                self.imm_for_opsize(imm)?;
            }
            _ => return Err(self.class_err()),
        }
        Ok(())
    }

    fn xchg(&mut self) -> Result<(), EncodeError> {
        let byte_width = self.opsize() == 8;
        match self.insn.operands {
            Operands::RegReg { dst, src } => {
                let mut rex = self.rex_w();
                self.fold_reg(&mut rex, src, RegPos::Reg);
                self.fold_reg(&mut rex, dst, RegPos::Rm);
                self.prefixes(None, rex);
                self.put(if byte_width { 0x86 } else { 0x87 });
                self.modrm_reg_reg(src.low_bits(), dst);
            }
            Operands::MemReg { mem, reg } => {
                let mut rex = self.rex_w();
                self.fold_reg(&mut rex, reg, RegPos::Reg);
                self.fold_mem(&mut rex, &mem);
                self.prefixes(mem.seg, rex);
                self.put(if byte_width { 0x86 } else { 0x87 });
                self.modrm_mem(reg.low_bits(), &mem)?;
            }
            _ => return Err(self.class_err()),
        }
        Ok(())
    }

    fn push(&mut self) -> Result<(), EncodeError> {
        match self.insn.operands {
            Operands::Reg(reg) => {
                let rex = Rex { b: reg.needs_rex_bit(), ..Rex::default() };
                self.prefixes(None, rex);
                self.put(0x50 | reg.low_bits());
            }
            Operands::Imm(imm) => {
                self.prefixes(None, Rex::default());
                if let Ok(v) = i8::try_from(imm) {
                    self.put(0x6A);
                    self.put(v as u8);
                } else {
                    let v = i32::try_from(imm).map_err(|_| EncodeError::ImmRange(OpClass::Push))?;
                    self.put(0x68);
                    self.put_i32(v);
                }
            }
            Operands::Mem(mem) => {
                let mut rex = Rex::default();
                self.fold_mem(&mut rex, &mem);
                self.prefixes(mem.seg, rex);
                self.put(0xFF);
                self.modrm_mem(6, &mem)?;
            }
            _ => return Err(self.class_err()),
        }
        Ok(())
    }

    fn pop(&mut self) -> Result<(), EncodeError> {
        match self.insn.operands {
            Operands::Reg(reg) => {
                let rex = Rex { b: reg.needs_rex_bit(), ..Rex::default() };
                self.prefixes(None, rex);
                self.put(0x58 | reg.low_bits());
            }
            Operands::Mem(mem) => {
                let mut rex = Rex::default();
                self.fold_mem(&mut rex, &mem);
                self.prefixes(mem.seg, rex);
                self.put(0x8F);
                self.modrm_mem(0, &mem)?;
            }
            _ => return Err(self.class_err()),
        }
        Ok(())
    }

    fn setcc(&mut self) -> Result<(), EncodeError> {
        let cc = self.insn.cc.ok_or(self.class_err())?;
        match self.insn.operands {
            Operands::Reg(reg) => {
                let mut rex = Rex::default();
                self.fold_reg(&mut rex, reg, RegPos::Rm);
                self.prefixes(None, rex);
                self.put(0x0F);
                self.put(0x90 | cc.index());
                self.modrm_reg_reg(0, reg);
            }
            Operands::Mem(mem) => {
                let mut rex = Rex::default();
                self.fold_mem(&mut rex, &mem);
                self.prefixes(mem.seg, rex);
                self.put(0x0F);
                self.put(0x90 | cc.index());
                self.modrm_mem(0, &mem)?;
            }
            _ => return Err(self.class_err()),
        }
        Ok(())
    }

    fn inc_dec(&mut self) -> Result<(), EncodeError> {
        let ext = if self.insn.class == OpClass::Inc { 0 } else { 1 };
        let byte_width = self.opsize() == 8;
        let opcode = if byte_width { 0xFE } else { 0xFF };
        match self.insn.operands {
            Operands::Reg(reg) => {
                let mut rex = self.rex_w();
                self.fold_reg(&mut rex, reg, RegPos::Rm);
                self.prefixes(None, rex);
                self.put(opcode);
                self.modrm_reg_reg(ext, reg);
            }
            Operands::Mem(mem) => {
                let mut rex = self.rex_w();
                self.fold_mem(&mut rex, &mem);
                self.prefixes(mem.seg, rex);
                self.put(opcode);
                self.modrm_mem(ext, &mem)?;
            }
            _ => return Err(self.class_err()),
        }
        Ok(())
    }

    fn neg_not(&mut self) -> Result<(), EncodeError> {
        let ext = if self.insn.class == OpClass::Not { 2 } else { 3 };
        let byte_width = self.opsize() == 8;
        let opcode = if byte_width { 0xF6 } else { 0xF7 };
        match self.insn.operands {
            Operands::Reg(reg) => {
                let mut rex = self.rex_w();
                self.fold_reg(&mut rex, reg, RegPos::Rm);
                self.prefixes(None, rex);
                self.put(opcode);
                self.modrm_reg_reg(ext, reg);
            }
            Operands::Mem(mem) => {
                let mut rex = self.rex_w();
                self.fold_mem(&mut rex, &mem);
                self.prefixes(mem.seg, rex);
                self.put(opcode);
                self.modrm_mem(ext, &mem)?;
            }
            _ => return Err(self.class_err()),
        }
        Ok(())
    }

    fn imul(&mut self) -> Result<(), EncodeError> {
        match self.insn.operands {
            Operands::RegReg { dst, src } => {
                let mut rex = self.rex_w();
                self.fold_reg(&mut rex, dst, RegPos::Reg);
                self.fold_reg(&mut rex, src, RegPos::Rm);
                self.prefixes(None, rex);
                self.put(0x0F);
                self.put(0xAF);
                self.modrm_reg_reg(dst.low_bits(), src);
            }
            Operands::RegMem { reg, mem } => {
                let mut rex = self.rex_w();
                self.fold_reg(&mut rex, reg, RegPos::Reg);
                self.fold_mem(&mut rex, &mem);
                self.prefixes(mem.seg, rex);
                self.put(0x0F);
                self.put(0xAF);
                self.modrm_mem(reg.low_bits(), &mem)?;
            }
            _ => return Err(self.class_err()),
        }
        Ok(())
    }

    fn jmp(&mut self) -> Result<(), EncodeError> {
        match self.insn.operands {
            Operands::Rel { disp, width: 8 } => {
                let v = i8::try_from(disp).map_err(|_| EncodeError::ImmRange(OpClass::Jmp))?;
                self.prefixes(None, Rex::default());
                self.put(0xEB);
                self.put(v as u8);
            }
            Operands::Rel { disp, .. } => {
                self.prefixes(None, Rex::default());
                self.put(0xE9);
                self.put_i32(disp);
            }
            Operands::Reg(reg) => {
                let rex = Rex { b: reg.needs_rex_bit(), ..Rex::default() };
                self.prefixes(None, rex);
                self.put(0xFF);
                self.modrm_reg_reg(4, reg);
            }
            Operands::Mem(mem) => {
                let mut rex = Rex::default();
                self.fold_mem(&mut rex, &mem);
                self.prefixes(mem.seg, rex);
                self.put(0xFF);
                self.modrm_mem(4, &mem)?;
            }
            _ => return Err(self.class_err()),
        }
        Ok(())
    }

    fn jcc(&mut self) -> Result<(), EncodeError> {
        let cc = self.insn.cc.ok_or(self.class_err())?;
        match self.insn.operands {
            Operands::Rel { disp, width: 8 } => {
                let v = i8::try_from(disp).map_err(|_| EncodeError::ImmRange(OpClass::Jcc))?;
                self.prefixes(None, Rex::default());
                self.put(0x70 | cc.index());
                self.put(v as u8);
            }
            Operands::Rel { disp, .. } => {
                self.prefixes(None, Rex::default());
                self.put(0x0F);
                self.put(0x80 | cc.index());
                self.put_i32(disp);
            }
            _ => return Err(self.class_err()),
        }
        Ok(())
    }

    fn call(&mut self) -> Result<(), EncodeError> {
        match self.insn.operands {
            Operands::Rel { disp, .. } => {
                self.prefixes(None, Rex::default());
                self.put(0xE8);
                self.put_i32(disp);
            }
            Operands::Reg(reg) => {
                let rex = Rex { b: reg.needs_rex_bit(), ..Rex::default() };
                self.prefixes(None, rex);
                self.put(0xFF);
                self.modrm_reg_reg(2, reg);
            }
            Operands::Mem(mem) => {
                let mut rex = Rex::default();
                self.fold_mem(&mut rex, &mem);
                self.prefixes(mem.seg, rex);
                self.put(0xFF);
                self.modrm_mem(2, &mem)?;
            }
            _ => return Err(self.class_err()),
        }
        Ok(())
    }

    fn ret(&mut self) -> Result<(), EncodeError> {
        match self.insn.operands {
            Operands::None => {
                self.prefixes(None, Rex::default());
                self.put(0xC3);
            }
            Operands::Imm(imm) => {
                let v = u16::try_from(imm).map_err(|_| EncodeError::ImmRange(OpClass::Ret))?;
                self.prefixes(None, Rex::default());
                self.put(0xC2);
                self.out.extend_from_slice(&v.to_le_bytes());
            }
            _ => return Err(self.class_err()),
        }
        Ok(())
    }

    fn int(&mut self) -> Result<(), EncodeError> {
        match self.insn.operands {
            Operands::Imm(imm) => {
                let v = u8::try_from(imm).map_err(|_| EncodeError::ImmRange(OpClass::Int))?;
                self.prefixes(None, Rex::default());
                self.put(0xCD);
                self.put(v);
            }
            _ => return Err(self.class_err()),
        }
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum RegPos {
    Reg,
    Rm,
    Index,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::decode;
    use crate::insn::{Cc, Seg};

    fn round_trip(insn: Insn) {
        let mut bytes = Vec::new();
        encode(&insn, &mut bytes).unwrap();
        let back = decode(&bytes).unwrap();
        assert!(insn.semantically_eq(&back), "in: {insn}\nbytes: {bytes:02x?}\nout: {back}");
        assert_eq!(back.len as usize, bytes.len());
    }

    #[test]
    fn test_round_trip_moves() {
        round_trip(Insn::new(OpClass::Mov, 64, Operands::RegReg { dst: Gpr::Rdx, src: Gpr::Rdi }));
        round_trip(Insn::new(OpClass::Mov, 64, Operands::RegImm { reg: Gpr::R11, imm: 0x7766554433221100 }));
        round_trip(Insn::new(OpClass::Mov, 64, Operands::RegImm { reg: Gpr::Rax, imm: -1 }));
        round_trip(Insn::new(OpClass::Mov, 32, Operands::RegImm { reg: Gpr::Rbx, imm: 0x1000 }));
        round_trip(Insn::new(
            OpClass::Mov,
            64,
            Operands::RegMem { reg: Gpr::Rax, mem: Mem::rip(0x10) },
        ));
        round_trip(Insn::new(
            OpClass::Mov,
            64,
            Operands::MemReg { mem: Mem::base_disp(Gpr::Rsp, 8), reg: Gpr::Rcx },
        ));
        round_trip(Insn::new(
            OpClass::Mov,
            64,
            Operands::MemReg { mem: Mem::base_disp(Gpr::R13, 0), reg: Gpr::Rcx },
        ));
        round_trip(Insn::new(OpClass::Mov, 8, Operands::RegReg { dst: Gpr::Rsi, src: Gpr::Rax }));
    }

    #[test]
    fn test_round_trip_alu() {
        round_trip(Insn::new(OpClass::Add, 64, Operands::RegImm { reg: Gpr::Rsp, imm: 8 }));
        round_trip(Insn::new(OpClass::Add, 64, Operands::RegImm { reg: Gpr::Rax, imm: 0x1234567 }));
        round_trip(Insn::new(OpClass::Sub, 64, Operands::RegReg { dst: Gpr::R9, src: Gpr::R10 }));
        round_trip(Insn::new(
            OpClass::Cmp,
            64,
            Operands::RegMem { reg: Gpr::Rdi, mem: Mem::base(Gpr::Rsi) },
        ));
        round_trip(Insn::new(OpClass::Xor, 32, Operands::RegReg { dst: Gpr::Rax, src: Gpr::Rax }));
        round_trip(Insn::new(OpClass::And, 64, Operands::RegImm { reg: Gpr::Rsp, imm: -16 }));
        round_trip(Insn::new(OpClass::Add, 8, Operands::RegImm { reg: Gpr::Rax, imm: 0x7F }));
        round_trip(Insn::new(
            OpClass::Add,
            64,
            Operands::MemImm { mem: Mem::base(Gpr::Rbx), imm: 1 },
        ));
    }

    #[test]
    fn test_round_trip_memory_forms() {
        // SIB with index.
        round_trip(Insn::new(
            OpClass::Mov,
            64,
            Operands::RegMem {
                reg: Gpr::Rax,
                mem: Mem {
                    base: Some(Gpr::Rbx),
                    index: Some((Gpr::Rcx, 4)),
                    disp: 8,
                    rip_relative: false,
                    seg: None,
                },
            },
        ));
        // Index but no base.
        round_trip(Insn::new(
            OpClass::Lea,
            64,
            Operands::RegMem {
                reg: Gpr::Rdx,
                mem: Mem {
                    base: None,
                    index: Some((Gpr::R12, 8)),
                    disp: 0x40,
                    rip_relative: false,
                    seg: None,
                },
            },
        ));
        // Absolute with gs override.
        round_trip(Insn::new(
            OpClass::Mov,
            64,
            Operands::RegMem { reg: Gpr::Rax, mem: Mem::absolute(0x10, Some(Seg::Gs)) },
        ));
        // rsp-based (forces SIB), r12-based (same low bits).
        round_trip(Insn::new(
            OpClass::Mov,
            64,
            Operands::RegMem { reg: Gpr::Rbp, mem: Mem::base_disp(Gpr::Rsp, 0x80) },
        ));
        round_trip(Insn::new(
            OpClass::Mov,
            64,
            Operands::RegMem { reg: Gpr::Rbp, mem: Mem::base(Gpr::R12) },
        ));
    }

    #[test]
    fn test_round_trip_stack_ops() {
        for reg in Gpr::ALL {
            round_trip(Insn::new(OpClass::Push, 64, Operands::Reg(reg)));
            round_trip(Insn::new(OpClass::Pop, 64, Operands::Reg(reg)));
        }
        round_trip(Insn::new(OpClass::Push, 64, Operands::Imm(0x12)));
        round_trip(Insn::new(OpClass::Push, 64, Operands::Imm(0x1234)));
        round_trip(Insn::new(OpClass::Push, 64, Operands::Mem(Mem::base(Gpr::Rbx))));
        round_trip(Insn::new(OpClass::Pushf, 64, Operands::None));
        round_trip(Insn::new(OpClass::Popf, 64, Operands::None));
    }

    #[test]
    fn test_round_trip_control_flow() {
        round_trip(Insn::new(OpClass::Jmp, 64, Operands::Rel { disp: -2, width: 8 }));
        round_trip(Insn::new(OpClass::Jmp, 64, Operands::Rel { disp: 0x1000, width: 32 }));
        round_trip(Insn::with_cc(OpClass::Jcc, Cc::Ne, 64, Operands::Rel { disp: -6, width: 8 }));
        round_trip(Insn::with_cc(OpClass::Jcc, Cc::E, 64, Operands::Rel { disp: 0x100, width: 32 }));
        round_trip(Insn::new(OpClass::Call, 64, Operands::Rel { disp: 0x10, width: 32 }));
        round_trip(Insn::new(OpClass::Call, 64, Operands::Reg(Gpr::Rax)));
        round_trip(Insn::new(OpClass::Jmp, 64, Operands::Mem(Mem::rip(0))));
        round_trip(Insn::new(OpClass::Jmp, 64, Operands::Reg(Gpr::R11)));
        round_trip(Insn::new(OpClass::Ret, 64, Operands::None));
        round_trip(Insn::new(OpClass::Ret, 64, Operands::Imm(16)));
    }

    #[test]
    fn test_round_trip_flag_ops() {
        round_trip(Insn::new(OpClass::Lahf, 8, Operands::None));
        round_trip(Insn::new(OpClass::Sahf, 8, Operands::None));
        round_trip(Insn::with_cc(OpClass::Setcc, Cc::O, 8, Operands::Reg(Gpr::Rax)));
        round_trip(Insn::with_cc(OpClass::Setcc, Cc::Ne, 8, Operands::Reg(Gpr::R9)));
    }

    #[test]
    fn test_round_trip_misc() {
        round_trip(Insn::new(OpClass::Nop, 32, Operands::None));
        round_trip(Insn::new(OpClass::Ud2, 64, Operands::None));
        round_trip(Insn::new(OpClass::Int3, 8, Operands::None));
        round_trip(Insn::new(OpClass::Int, 8, Operands::Imm(0x80)));
        round_trip(Insn::new(OpClass::Syscall, 64, Operands::None));
        round_trip(Insn::new(OpClass::Cli, 8, Operands::None));
        round_trip(Insn::new(OpClass::Sti, 8, Operands::None));
        round_trip(Insn::new(OpClass::Inc, 64, Operands::Reg(Gpr::Rax)));
        round_trip(Insn::new(OpClass::Dec, 64, Operands::Mem(Mem::base(Gpr::Rdi))));
        round_trip(Insn::new(OpClass::Neg, 64, Operands::Reg(Gpr::Rcx)));
        round_trip(Insn::new(OpClass::Imul, 64, Operands::RegReg { dst: Gpr::Rax, src: Gpr::Rbx }));
    }

    #[test]
    fn test_round_trip_lock_prefix() {
        let mut insn = Insn::new(
            OpClass::Add,
            64,
            Operands::MemImm { mem: Mem::base(Gpr::Rbx), imm: 1 },
        );
        insn.prefixes.lock = true;
        round_trip(insn);
    }

    #[test]
    fn test_expected_bytes() {
        let mut bytes = Vec::new();
        encode(&Insn::new(OpClass::Push, 64, Operands::Reg(Gpr::Rdi)), &mut bytes).unwrap();
        assert_eq!(bytes, [0x57]);

        bytes.clear();
        encode(&Insn::new(OpClass::Ret, 64, Operands::None), &mut bytes).unwrap();
        assert_eq!(bytes, [0xC3]);

        bytes.clear();
        encode(
            &Insn::new(OpClass::Mov, 64, Operands::RegReg { dst: Gpr::Rdx, src: Gpr::Rdi }),
            &mut bytes,
        )
        .unwrap();
        assert_eq!(bytes, [0x48, 0x89, 0xFA]);

        bytes.clear();
        encode(&Insn::new(OpClass::Jmp, 64, Operands::Mem(Mem::rip(0))), &mut bytes).unwrap();
        assert_eq!(bytes, [0xFF, 0x25, 0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_rel8_overflow_rejected() {
        let insn = Insn::new(OpClass::Jmp, 64, Operands::Rel { disp: 0x1000, width: 8 });
        let mut bytes = Vec::new();
        assert_eq!(encode(&insn, &mut bytes), Err(EncodeError::ImmRange(OpClass::Jmp)));
    }
}
