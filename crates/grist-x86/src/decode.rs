//! Byte decoder
//!
//! Decodes one instruction from a byte window. The decoder never reads past
//! the window it is given: a window that ends mid-instruction produces
//! [`DecodeError::Truncated`], which callers use to drive the
//! page-boundary length probe.

use crate::insn::{Cc, Insn, Mem, OpClass, Operands, Prefixes, Seg};
use crate::reg::Gpr;

/// Longest legal x86-64 instruction.
pub const MAX_INSN_LEN: usize = 15;

/// Error decoding a byte window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The opcode byte does not name an instruction the codec covers.
    #[error("invalid or unsupported opcode byte {byte:#04x} at offset {offset}")]
    InvalidOpcode { byte: u8, offset: usize },
    /// The window ended before the instruction did.
    #[error("instruction truncated at offset {0}")]
    Truncated(usize),
    /// A form the codec deliberately does not model.
    #[error("unsupported encoding at offset {offset}: {what}")]
    Unsupported { offset: usize, what: &'static str },
}

/// Decode one instruction from the start of `bytes`.
pub fn decode(bytes: &[u8]) -> Result<Insn, DecodeError> {
    Decoder::new(bytes).run()
}

/// Either side of a ModRM `r/m` field.
enum RegOrMem {
    Reg(Gpr),
    Mem(Mem),
}

struct Decoder<'a> {
    bytes: &'a [u8],
    pos: usize,
    prefixes: Prefixes,
    rex: u8,
    has_rex: bool,
    opsize_66: bool,
    hint: Option<bool>,
}

impl<'a> Decoder<'a> {
    fn new(bytes: &'a [u8]) -> Decoder<'a> {
        Decoder {
            bytes,
            pos: 0,
            prefixes: Prefixes::default(),
            rex: 0,
            has_rex: false,
            opsize_66: false,
            hint: None,
        }
    }

    fn peek(&self) -> Result<u8, DecodeError> {
        self.bytes.get(self.pos).copied().ok_or(DecodeError::Truncated(self.pos))
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        let b = self.peek()?;
        self.pos += 1;
        Ok(b)
    }

    fn i8(&mut self) -> Result<i8, DecodeError> {
        Ok(self.u8()? as i8)
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        if self.pos + 2 > self.bytes.len() {
            return Err(DecodeError::Truncated(self.pos));
        }
        let v = u16::from_le_bytes([self.bytes[self.pos], self.bytes[self.pos + 1]]);
        self.pos += 2;
        Ok(v)
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        if self.pos + 4 > self.bytes.len() {
            return Err(DecodeError::Truncated(self.pos));
        }
        let v = i32::from_le_bytes([
            self.bytes[self.pos],
            self.bytes[self.pos + 1],
            self.bytes[self.pos + 2],
            self.bytes[self.pos + 3],
        ]);
        self.pos += 4;
        Ok(v)
    }

    fn i64(&mut self) -> Result<i64, DecodeError> {
        if self.pos + 8 > self.bytes.len() {
            return Err(DecodeError::Truncated(self.pos));
        }
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.bytes[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(i64::from_le_bytes(raw))
    }

    fn rex_w(&self) -> bool {
        self.rex & 0x8 != 0
    }

    fn rex_r(&self) -> u8 {
        (self.rex >> 2) & 1
    }

    fn rex_x(&self) -> u8 {
        (self.rex >> 1) & 1
    }

    fn rex_b(&self) -> u8 {
        self.rex & 1
    }

    /// Effective operand size for a non-byte instruction.
    fn opsize(&self) -> u8 {
        if self.rex_w() {
            64
        } else if self.opsize_66 {
            16
        } else {
            32
        }
    }

    /// General-purpose register from a 3-bit field plus a REX extension bit.
    fn gpr(&self, low: u8, ext: u8) -> Gpr {
        // from_index cannot fail for a 4-bit value.
        Gpr::from_index((ext << 3) | low).unwrap()
    }

    /// Byte-width register. High-byte registers (ah..bh, selected by ids
    /// 4..=7 without REX) are outside the model.
    fn gpr8(&self, low: u8, ext: u8) -> Result<Gpr, DecodeError> {
        let id = (ext << 3) | low;
        if !self.has_rex && (4..8).contains(&id) {
            return Err(DecodeError::Unsupported { offset: self.pos, what: "high-byte register" });
        }
        Ok(Gpr::from_index(id).unwrap())
    }

    fn read_modrm(&mut self) -> Result<(u8, u8, u8), DecodeError> {
        let byte = self.u8()?;
        Ok((byte >> 6, (byte >> 3) & 7, byte & 7))
    }

    /// Decode the `r/m` side of a ModRM byte.
    fn rm_operand(&mut self, md: u8, rm: u8, byte_width: bool) -> Result<RegOrMem, DecodeError> {
        if md == 0b11 {
            let reg = if byte_width { self.gpr8(rm, self.rex_b())? } else { self.gpr(rm, self.rex_b()) };
            return Ok(RegOrMem::Reg(reg));
        }

        let mut base = None;
        let mut index = None;
        let mut rip_relative = false;
        let disp;

        if rm == 0b100 {
            // SIB byte.
            let sib = self.u8()?;
            let scale = 1u8 << (sib >> 6);
            let index_id = ((sib >> 3) & 7) | (self.rex_x() << 3);
            let base_id = (sib & 7) | (self.rex_b() << 3);
            if index_id != 0b0100 {
                index = Some((Gpr::from_index(index_id).unwrap(), scale));
            }
            if (sib & 7) == 0b101 && md == 0b00 {
                // No base; disp32 follows.
                disp = self.i32()?;
            } else {
                base = Some(Gpr::from_index(base_id).unwrap());
                disp = match md {
                    0b01 => self.i8()? as i32,
                    0b10 => self.i32()?,
                    _ => 0,
                };
            }
        } else if rm == 0b101 && md == 0b00 {
            // RIP-relative.
            rip_relative = true;
            disp = self.i32()?;
        } else {
            base = Some(self.gpr(rm, self.rex_b()));
            disp = match md {
                0b01 => self.i8()? as i32,
                0b10 => self.i32()?,
                _ => 0,
            };
        }

        Ok(RegOrMem::Mem(Mem { base, index, disp, rip_relative, seg: self.prefixes.seg }))
    }

    /// `op r/m, r` or `op r, r/m` with the register side in `reg`.
    fn rm_reg(&mut self, byte_width: bool) -> Result<(RegOrMem, Gpr), DecodeError> {
        let (md, reg, rm) = self.read_modrm()?;
        let reg = if byte_width { self.gpr8(reg, self.rex_r())? } else { self.gpr(reg, self.rex_r()) };
        let rm = self.rm_operand(md, rm, byte_width)?;
        Ok((rm, reg))
    }

    fn finish(mut self, class: OpClass, cc: Option<Cc>, opsize: u8, operands: Operands) -> Insn {
        if class == OpClass::Jcc {
            self.prefixes.branch_hint = self.hint;
        }
        Insn { class, cc, prefixes: self.prefixes, opsize, operands, len: self.pos as u8 }
    }

    fn run(mut self) -> Result<Insn, DecodeError> {
        // Legacy prefixes, in any order.
        loop {
            match self.peek()? {
                0x66 => {
                    self.opsize_66 = true;
                    self.pos += 1;
                }
                0xF0 => {
                    self.prefixes.lock = true;
                    self.pos += 1;
                }
                0xF2 => {
                    self.prefixes.repne = true;
                    self.pos += 1;
                }
                0xF3 => {
                    self.prefixes.rep = true;
                    self.pos += 1;
                }
                0x2E => {
                    self.hint = Some(false);
                    self.pos += 1;
                }
                0x3E => {
                    self.hint = Some(true);
                    self.pos += 1;
                }
                0x26 | 0x36 => {
                    // es/ss overrides are ignored in 64-bit mode.
                    self.pos += 1;
                }
                0x64 => {
                    self.prefixes.seg = Some(Seg::Fs);
                    self.pos += 1;
                }
                0x65 => {
                    self.prefixes.seg = Some(Seg::Gs);
                    self.pos += 1;
                }
                _ => break,
            }
            if self.pos > MAX_INSN_LEN {
                return Err(DecodeError::Unsupported { offset: self.pos, what: "prefix run too long" });
            }
        }

        // REX, which must immediately precede the opcode.
        if (0x40..=0x4F).contains(&self.peek()?) {
            self.rex = self.u8()? & 0x0F;
            self.has_rex = true;
        }

        let opcode_offset = self.pos;
        let opcode = self.u8()?;

        if opcode == 0x0F {
            return self.run_0f(opcode_offset);
        }

        // Group-1 ALU family: 0x00..=0x3B in the (op << 3) | form layout.
        const GROUP1: [OpClass; 8] = [
            OpClass::Add,
            OpClass::Or,
            OpClass::Adc,
            OpClass::Sbb,
            OpClass::And,
            OpClass::Sub,
            OpClass::Xor,
            OpClass::Cmp,
        ];
        if opcode < 0x40 {
            let class = GROUP1[(opcode >> 3) as usize];
            match opcode & 7 {
                0 => {
                    let (rm, reg) = self.rm_reg(true)?;
                    let operands = match rm {
                        RegOrMem::Reg(dst) => Operands::RegReg { dst, src: reg },
                        RegOrMem::Mem(mem) => Operands::MemReg { mem, reg },
                    };
                    return Ok(self.finish(class, None, 8, operands));
                }
                1 => {
                    let opsize = self.opsize();
                    let (rm, reg) = self.rm_reg(false)?;
                    let operands = match rm {
                        RegOrMem::Reg(dst) => Operands::RegReg { dst, src: reg },
                        RegOrMem::Mem(mem) => Operands::MemReg { mem, reg },
                    };
                    return Ok(self.finish(class, None, opsize, operands));
                }
                2 => {
                    let (rm, reg) = self.rm_reg(true)?;
                    let operands = match rm {
                        RegOrMem::Reg(src) => Operands::RegReg { dst: reg, src },
                        RegOrMem::Mem(mem) => Operands::RegMem { reg, mem },
                    };
                    return Ok(self.finish(class, None, 8, operands));
                }
                3 => {
                    let opsize = self.opsize();
                    let (rm, reg) = self.rm_reg(false)?;
                    let operands = match rm {
                        RegOrMem::Reg(src) => Operands::RegReg { dst: reg, src },
                        RegOrMem::Mem(mem) => Operands::RegMem { reg, mem },
                    };
                    return Ok(self.finish(class, None, opsize, operands));
                }
                4 => {
                    let imm = self.i8()? as i64;
                    return Ok(self.finish(class, None, 8, Operands::RegImm { reg: Gpr::Rax, imm }));
                }
                5 => {
                    let opsize = self.opsize();
                    let imm = if opsize == 16 { self.u16()? as i16 as i64 } else { self.i32()? as i64 };
                    return Ok(self.finish(class, None, opsize, Operands::RegImm { reg: Gpr::Rax, imm }));
                }
                _ => {
                    return Err(DecodeError::InvalidOpcode { byte: opcode, offset: opcode_offset });
                }
            }
        }

        match opcode {
            // push/pop r64: default 64-bit operand size in long mode.
            0x50..=0x57 => {
                let reg = self.gpr(opcode & 7, self.rex_b());
                Ok(self.finish(OpClass::Push, None, 64, Operands::Reg(reg)))
            }
            0x58..=0x5F => {
                let reg = self.gpr(opcode & 7, self.rex_b());
                Ok(self.finish(OpClass::Pop, None, 64, Operands::Reg(reg)))
            }

            0x68 => {
                let imm = self.i32()? as i64;
                Ok(self.finish(OpClass::Push, None, 64, Operands::Imm(imm)))
            }
            0x6A => {
                let imm = self.i8()? as i64;
                Ok(self.finish(OpClass::Push, None, 64, Operands::Imm(imm)))
            }

            0x70..=0x7F => {
                let cc = Cc::from_index(opcode & 0xF).unwrap();
                let disp = self.i8()? as i32;
                Ok(self.finish(OpClass::Jcc, Some(cc), 64, Operands::Rel { disp, width: 8 }))
            }

            // Group-1 immediate forms.
            0x80 | 0x81 | 0x83 => {
                let byte_width = opcode == 0x80;
                let opsize = if byte_width { 8 } else { self.opsize() };
                let (md, ext, rm) = self.read_modrm()?;
                let class = GROUP1[ext as usize];
                let rm = self.rm_operand(md, rm, byte_width)?;
                let imm = match opcode {
                    0x80 | 0x83 => self.i8()? as i64,
                    _ if opsize == 16 => self.u16()? as i16 as i64,
                    _ => self.i32()? as i64,
                };
                let operands = match rm {
                    RegOrMem::Reg(reg) => Operands::RegImm { reg, imm },
                    RegOrMem::Mem(mem) => Operands::MemImm { mem, imm },
                };
                Ok(self.finish(class, None, opsize, operands))
            }

            0x84 | 0x85 => {
                let byte_width = opcode == 0x84;
                let opsize = if byte_width { 8 } else { self.opsize() };
                let (rm, reg) = self.rm_reg(byte_width)?;
                let operands = match rm {
                    RegOrMem::Reg(dst) => Operands::RegReg { dst, src: reg },
                    RegOrMem::Mem(mem) => Operands::MemReg { mem, reg },
                };
                Ok(self.finish(OpClass::Test, None, opsize, operands))
            }

            0x86 | 0x87 => {
                let byte_width = opcode == 0x86;
                let opsize = if byte_width { 8 } else { self.opsize() };
                let (rm, reg) = self.rm_reg(byte_width)?;
                let operands = match rm {
                    RegOrMem::Reg(dst) => Operands::RegReg { dst, src: reg },
                    RegOrMem::Mem(mem) => Operands::MemReg { mem, reg },
                };
                Ok(self.finish(OpClass::Xchg, None, opsize, operands))
            }

            0x88 | 0x89 | 0x8A | 0x8B => {
                let byte_width = opcode & 1 == 0;
                let opsize = if byte_width { 8 } else { self.opsize() };
                let (rm, reg) = self.rm_reg(byte_width)?;
                let to_reg = opcode & 2 != 0;
                let operands = match (rm, to_reg) {
                    (RegOrMem::Reg(other), false) => Operands::RegReg { dst: other, src: reg },
                    (RegOrMem::Reg(other), true) => Operands::RegReg { dst: reg, src: other },
                    (RegOrMem::Mem(mem), false) => Operands::MemReg { mem, reg },
                    (RegOrMem::Mem(mem), true) => Operands::RegMem { reg, mem },
                };
                Ok(self.finish(OpClass::Mov, None, opsize, operands))
            }

            0x8D => {
                let opsize = self.opsize();
                let (rm, reg) = self.rm_reg(false)?;
                match rm {
                    RegOrMem::Mem(mem) => {
                        Ok(self.finish(OpClass::Lea, None, opsize, Operands::RegMem { reg, mem }))
                    }
                    RegOrMem::Reg(_) => {
                        Err(DecodeError::Unsupported { offset: opcode_offset, what: "lea with register r/m" })
                    }
                }
            }

            0x8F => {
                let (md, ext, rm) = self.read_modrm()?;
                if ext != 0 {
                    return Err(DecodeError::InvalidOpcode { byte: opcode, offset: opcode_offset });
                }
                match self.rm_operand(md, rm, false)? {
                    RegOrMem::Reg(reg) => Ok(self.finish(OpClass::Pop, None, 64, Operands::Reg(reg))),
                    RegOrMem::Mem(mem) => Ok(self.finish(OpClass::Pop, None, 64, Operands::Mem(mem))),
                }
            }

            0x90 => {
                if self.rex_b() != 0 {
                    let reg = self.gpr(0, 1);
                    let opsize = self.opsize();
                    Ok(self.finish(OpClass::Xchg, None, opsize, Operands::RegReg { dst: Gpr::Rax, src: reg }))
                } else {
                    let opsize = self.opsize();
                    Ok(self.finish(OpClass::Nop, None, opsize, Operands::None))
                }
            }
            0x91..=0x97 => {
                let opsize = self.opsize();
                let reg = self.gpr(opcode & 7, self.rex_b());
                Ok(self.finish(OpClass::Xchg, None, opsize, Operands::RegReg { dst: Gpr::Rax, src: reg }))
            }

            0x9C => Ok(self.finish(OpClass::Pushf, None, 64, Operands::None)),
            0x9D => Ok(self.finish(OpClass::Popf, None, 64, Operands::None)),
            0x9E => Ok(self.finish(OpClass::Sahf, None, 8, Operands::None)),
            0x9F => Ok(self.finish(OpClass::Lahf, None, 8, Operands::None)),

            0xA8 => {
                let imm = self.i8()? as i64;
                Ok(self.finish(OpClass::Test, None, 8, Operands::RegImm { reg: Gpr::Rax, imm }))
            }
            0xA9 => {
                let opsize = self.opsize();
                let imm = if opsize == 16 { self.u16()? as i16 as i64 } else { self.i32()? as i64 };
                Ok(self.finish(OpClass::Test, None, opsize, Operands::RegImm { reg: Gpr::Rax, imm }))
            }

            0xB0..=0xB7 => {
                let reg = self.gpr8(opcode & 7, self.rex_b())?;
                let imm = self.i8()? as i64;
                Ok(self.finish(OpClass::Mov, None, 8, Operands::RegImm { reg, imm }))
            }
            0xB8..=0xBF => {
                let reg = self.gpr(opcode & 7, self.rex_b());
                let opsize = self.opsize();
                let imm = match opsize {
                    64 => self.i64()?,
                    16 => self.u16()? as i16 as i64,
                    _ => self.i32()? as i64,
                };
                Ok(self.finish(OpClass::Mov, None, opsize, Operands::RegImm { reg, imm }))
            }

            0xC2 => {
                let imm = self.u16()? as i64;
                Ok(self.finish(OpClass::Ret, None, 64, Operands::Imm(imm)))
            }
            0xC3 => Ok(self.finish(OpClass::Ret, None, 64, Operands::None)),

            0xC6 | 0xC7 => {
                let byte_width = opcode == 0xC6;
                let opsize = if byte_width { 8 } else { self.opsize() };
                let (md, ext, rm) = self.read_modrm()?;
                if ext != 0 {
                    return Err(DecodeError::InvalidOpcode { byte: opcode, offset: opcode_offset });
                }
                let rm = self.rm_operand(md, rm, byte_width)?;
                let imm = if byte_width {
                    self.i8()? as i64
                } else if opsize == 16 {
                    self.u16()? as i16 as i64
                } else {
                    self.i32()? as i64
                };
                let operands = match rm {
                    RegOrMem::Reg(reg) => Operands::RegImm { reg, imm },
                    RegOrMem::Mem(mem) => Operands::MemImm { mem, imm },
                };
                Ok(self.finish(OpClass::Mov, None, opsize, operands))
            }

            0xCC => Ok(self.finish(OpClass::Int3, None, 8, Operands::None)),
            0xCD => {
                let imm = self.u8()? as i64;
                Ok(self.finish(OpClass::Int, None, 8, Operands::Imm(imm)))
            }

            0xE8 => {
                let disp = self.i32()?;
                Ok(self.finish(OpClass::Call, None, 64, Operands::Rel { disp, width: 32 }))
            }
            0xE9 => {
                let disp = self.i32()?;
                Ok(self.finish(OpClass::Jmp, None, 64, Operands::Rel { disp, width: 32 }))
            }
            0xEB => {
                let disp = self.i8()? as i32;
                Ok(self.finish(OpClass::Jmp, None, 64, Operands::Rel { disp, width: 8 }))
            }

            0xF6 | 0xF7 => {
                let byte_width = opcode == 0xF6;
                let opsize = if byte_width { 8 } else { self.opsize() };
                let (md, ext, rm) = self.read_modrm()?;
                let rm = self.rm_operand(md, rm, byte_width)?;
                match ext {
                    0 => {
                        let imm = if byte_width {
                            self.i8()? as i64
                        } else if opsize == 16 {
                            self.u16()? as i16 as i64
                        } else {
                            self.i32()? as i64
                        };
                        let operands = match rm {
                            RegOrMem::Reg(reg) => Operands::RegImm { reg, imm },
                            RegOrMem::Mem(mem) => Operands::MemImm { mem, imm },
                        };
                        Ok(self.finish(OpClass::Test, None, opsize, operands))
                    }
                    2 | 3 => {
                        let class = if ext == 2 { OpClass::Not } else { OpClass::Neg };
                        let operands = match rm {
                            RegOrMem::Reg(reg) => Operands::Reg(reg),
                            RegOrMem::Mem(mem) => Operands::Mem(mem),
                        };
                        Ok(self.finish(class, None, opsize, operands))
                    }
                    _ => Err(DecodeError::Unsupported { offset: opcode_offset, what: "mul/div group" }),
                }
            }

            0xFA => Ok(self.finish(OpClass::Cli, None, 8, Operands::None)),
            0xFB => Ok(self.finish(OpClass::Sti, None, 8, Operands::None)),

            0xFE => {
                let (md, ext, rm) = self.read_modrm()?;
                let class = match ext {
                    0 => OpClass::Inc,
                    1 => OpClass::Dec,
                    _ => return Err(DecodeError::InvalidOpcode { byte: opcode, offset: opcode_offset }),
                };
                let operands = match self.rm_operand(md, rm, true)? {
                    RegOrMem::Reg(reg) => Operands::Reg(reg),
                    RegOrMem::Mem(mem) => Operands::Mem(mem),
                };
                Ok(self.finish(class, None, 8, operands))
            }

            0xFF => {
                let (md, ext, rm) = self.read_modrm()?;
                match ext {
                    0 | 1 => {
                        let opsize = self.opsize();
                        let class = if ext == 0 { OpClass::Inc } else { OpClass::Dec };
                        let operands = match self.rm_operand(md, rm, false)? {
                            RegOrMem::Reg(reg) => Operands::Reg(reg),
                            RegOrMem::Mem(mem) => Operands::Mem(mem),
                        };
                        Ok(self.finish(class, None, opsize, operands))
                    }
                    2 | 4 => {
                        let class = if ext == 2 { OpClass::Call } else { OpClass::Jmp };
                        let operands = match self.rm_operand(md, rm, false)? {
                            RegOrMem::Reg(reg) => Operands::Reg(reg),
                            RegOrMem::Mem(mem) => Operands::Mem(mem),
                        };
                        Ok(self.finish(class, None, 64, operands))
                    }
                    6 => {
                        let operands = match self.rm_operand(md, rm, false)? {
                            RegOrMem::Reg(reg) => Operands::Reg(reg),
                            RegOrMem::Mem(mem) => Operands::Mem(mem),
                        };
                        Ok(self.finish(OpClass::Push, None, 64, operands))
                    }
                    _ => Err(DecodeError::Unsupported { offset: opcode_offset, what: "far call/jmp group" }),
                }
            }

            _ => Err(DecodeError::InvalidOpcode { byte: opcode, offset: opcode_offset }),
        }
    }

    fn run_0f(mut self, opcode_offset: usize) -> Result<Insn, DecodeError> {
        let opcode = self.u8()?;
        match opcode {
            0x05 => Ok(self.finish(OpClass::Syscall, None, 64, Operands::None)),
            0x0B => Ok(self.finish(OpClass::Ud2, None, 64, Operands::None)),

            0x1F => {
                // Multi-byte nop: consumes a ModRM-form operand.
                let opsize = self.opsize();
                let (md, _ext, rm) = self.read_modrm()?;
                let _ = self.rm_operand(md, rm, false)?;
                Ok(self.finish(OpClass::Nop, None, opsize, Operands::None))
            }

            0x80..=0x8F => {
                let cc = Cc::from_index(opcode & 0xF).unwrap();
                let disp = self.i32()?;
                Ok(self.finish(OpClass::Jcc, Some(cc), 64, Operands::Rel { disp, width: 32 }))
            }

            0x90..=0x9F => {
                let cc = Cc::from_index(opcode & 0xF).unwrap();
                let (md, _ext, rm) = self.read_modrm()?;
                let operands = match self.rm_operand(md, rm, true)? {
                    RegOrMem::Reg(reg) => Operands::Reg(reg),
                    RegOrMem::Mem(mem) => Operands::Mem(mem),
                };
                Ok(self.finish(OpClass::Setcc, Some(cc), 8, operands))
            }

            0xAF => {
                let opsize = self.opsize();
                let (rm, reg) = self.rm_reg(false)?;
                let operands = match rm {
                    RegOrMem::Reg(src) => Operands::RegReg { dst: reg, src },
                    RegOrMem::Mem(mem) => Operands::RegMem { reg, mem },
                };
                Ok(self.finish(OpClass::Imul, None, opsize, operands))
            }

            _ => Err(DecodeError::InvalidOpcode { byte: opcode, offset: opcode_offset }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insn::Category;

    #[test]
    fn test_decode_push_pop() {
        let insn = decode(&[0x57]).unwrap(); // push rdi
        assert_eq!(insn.class, OpClass::Push);
        assert_eq!(insn.operands, Operands::Reg(Gpr::Rdi));
        assert_eq!(insn.len, 1);

        let insn = decode(&[0x41, 0x58]).unwrap(); // pop r8
        assert_eq!(insn.class, OpClass::Pop);
        assert_eq!(insn.operands, Operands::Reg(Gpr::R8));
        assert_eq!(insn.len, 2);
    }

    #[test]
    fn test_decode_mov_reg_reg() {
        // mov rdx, rdi => REX.W 89 FA (mov r/m64, r64)
        let insn = decode(&[0x48, 0x89, 0xFA]).unwrap();
        assert_eq!(insn.class, OpClass::Mov);
        assert_eq!(insn.opsize, 64);
        assert_eq!(insn.operands, Operands::RegReg { dst: Gpr::Rdx, src: Gpr::Rdi });
    }

    #[test]
    fn test_decode_movabs() {
        // mov rax, 0x1122334455667788
        let mut bytes = vec![0x48, 0xB8];
        bytes.extend_from_slice(&0x1122334455667788i64.to_le_bytes());
        let insn = decode(&bytes).unwrap();
        assert_eq!(insn.class, OpClass::Mov);
        assert_eq!(insn.opsize, 64);
        assert_eq!(insn.operands, Operands::RegImm { reg: Gpr::Rax, imm: 0x1122334455667788 });
        assert_eq!(insn.len, 10);
    }

    #[test]
    fn test_decode_rip_relative_load() {
        // mov rax, [rip + 0x10] => 48 8B 05 10 00 00 00
        let insn = decode(&[0x48, 0x8B, 0x05, 0x10, 0x00, 0x00, 0x00]).unwrap();
        assert_eq!(insn.class, OpClass::Mov);
        match insn.operands {
            Operands::RegMem { reg, mem } => {
                assert_eq!(reg, Gpr::Rax);
                assert!(mem.rip_relative);
                assert_eq!(mem.disp, 0x10);
            }
            other => panic!("expected RegMem, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_sib() {
        // mov rax, [rbx + rcx*4 + 8] => 48 8B 44 8B 08
        let insn = decode(&[0x48, 0x8B, 0x44, 0x8B, 0x08]).unwrap();
        match insn.operands {
            Operands::RegMem { reg, mem } => {
                assert_eq!(reg, Gpr::Rax);
                assert_eq!(mem.base, Some(Gpr::Rbx));
                assert_eq!(mem.index, Some((Gpr::Rcx, 4)));
                assert_eq!(mem.disp, 8);
            }
            other => panic!("expected RegMem, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_jcc_rel8_and_rel32() {
        // jne -6
        let insn = decode(&[0x75, 0xFA]).unwrap();
        assert_eq!(insn.class, OpClass::Jcc);
        assert_eq!(insn.cc, Some(Cc::Ne));
        assert_eq!(insn.operands, Operands::Rel { disp: -6, width: 8 });

        // jz +0x100 (0F 84 00 01 00 00)
        let insn = decode(&[0x0F, 0x84, 0x00, 0x01, 0x00, 0x00]).unwrap();
        assert_eq!(insn.cc, Some(Cc::E));
        assert_eq!(insn.operands, Operands::Rel { disp: 0x100, width: 32 });
    }

    #[test]
    fn test_decode_call_and_ret() {
        let insn = decode(&[0xE8, 0x05, 0x00, 0x00, 0x00]).unwrap();
        assert_eq!(insn.class, OpClass::Call);
        assert_eq!(insn.category(), Category::DirectCall);

        let insn = decode(&[0xC3]).unwrap();
        assert_eq!(insn.class, OpClass::Ret);
        assert_eq!(insn.category(), Category::Ret);

        // call rax => FF D0
        let insn = decode(&[0xFF, 0xD0]).unwrap();
        assert_eq!(insn.category(), Category::IndirectCall);
        assert_eq!(insn.operands, Operands::Reg(Gpr::Rax));
    }

    #[test]
    fn test_decode_lock_prefix() {
        // lock add [rbx], eax => F0 01 03
        let insn = decode(&[0xF0, 0x01, 0x03]).unwrap();
        assert!(insn.prefixes.lock);
        assert_eq!(insn.class, OpClass::Add);
        assert_eq!(insn.operands, Operands::MemReg { mem: Mem::base(Gpr::Rbx), reg: Gpr::Rax });
    }

    #[test]
    fn test_decode_seg_prefix() {
        // mov rax, gs:[0x10] => 65 48 8B 04 25 10 00 00 00
        let insn = decode(&[0x65, 0x48, 0x8B, 0x04, 0x25, 0x10, 0x00, 0x00, 0x00]).unwrap();
        match insn.operands {
            Operands::RegMem { mem, .. } => {
                assert_eq!(mem.seg, Some(Seg::Gs));
                assert_eq!(mem.base, None);
                assert_eq!(mem.disp, 0x10);
            }
            other => panic!("expected RegMem, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_truncated() {
        // mov rax, imm64 cut short after 4 immediate bytes.
        let bytes = [0x48, 0xB8, 0x11, 0x22, 0x33, 0x44];
        assert!(matches!(decode(&bytes), Err(DecodeError::Truncated(_))));
        // Bare REX with nothing after it.
        assert!(matches!(decode(&[0x48]), Err(DecodeError::Truncated(_))));
    }

    #[test]
    fn test_decode_invalid() {
        assert!(matches!(decode(&[0x06]), Err(DecodeError::InvalidOpcode { .. })));
    }

    #[test]
    fn test_decode_flag_materialisation_ops() {
        assert_eq!(decode(&[0x9F]).unwrap().class, OpClass::Lahf);
        assert_eq!(decode(&[0x9E]).unwrap().class, OpClass::Sahf);
        // seto al => 0F 90 C0
        let insn = decode(&[0x0F, 0x90, 0xC0]).unwrap();
        assert_eq!(insn.class, OpClass::Setcc);
        assert_eq!(insn.cc, Some(Cc::O));
        assert_eq!(insn.operands, Operands::Reg(Gpr::Rax));
        // add al, 0x7f => 04 7F
        let insn = decode(&[0x04, 0x7F]).unwrap();
        assert_eq!(insn.class, OpClass::Add);
        assert_eq!(insn.opsize, 8);
        assert_eq!(insn.operands, Operands::RegImm { reg: Gpr::Rax, imm: 0x7F });
    }

    #[test]
    fn test_decode_high_byte_reg_rejected() {
        // mov ah, al => 88 C4 (no REX): high-byte registers are not modelled.
        assert!(matches!(decode(&[0x88, 0xC4]), Err(DecodeError::Unsupported { .. })));
        // With REX it's spl: 40 88 C4.
        let insn = decode(&[0x40, 0x88, 0xC4]).unwrap();
        assert_eq!(insn.operands, Operands::RegReg { dst: Gpr::Rsp, src: Gpr::Rax });
    }

    #[test]
    fn test_decode_interrupt_state_ops() {
        assert_eq!(decode(&[0xFA]).unwrap().class, OpClass::Cli);
        assert_eq!(decode(&[0xFB]).unwrap().class, OpClass::Sti);
        assert!(OpClass::Cli.changes_interrupt_state());
    }
}
