//! Two-pass encoding
//!
//! The *stage* pass writes every fragment into scratch memory against the
//! estimator PC to learn exact lengths and label offsets. The *commit*
//! pass allocates one contiguous cache region of the summed length and
//! re-emits, resolving every label, fragment displacement, and PC-relative
//! reference against the final cache address.
//!
//! Branch instructions use fixed-width (rel32) forms, so staged lengths
//! cannot shrink at commit. Exit fragments emit a 14-byte absolute
//! trampoline (`jmp [rip+0]; dq target`), which keeps every in-trace
//! branch a local rel32 regardless of where stubs, cached blocks, or
//! native code live.

use rustc_hash::FxHashMap;

use grist_x86::{self as x86, OpClass};

use crate::assemble::{Assembled, AssembleError};
use crate::cache::CodeCache;
use crate::fragment::{FragId, Fragment, FragmentList, SUCC_BRANCH};
use crate::ir::{Instr, Instruction, LabelId, MemOperand, OperandKind, Target, VirtReg};

/// Offsets learned by the stage pass.
#[derive(Debug, Default)]
struct Layout {
    frag_offsets: Vec<usize>,
    labels: FxHashMap<LabelId, usize>,
    total: usize,
}

/// Encode the fragment graph and publish the bytes into the cache.
pub fn encode_frags(
    frags: &FragmentList,
    cache: &CodeCache,
    estimator_pc: u64,
) -> Result<Assembled, AssembleError> {
    // Stage: learn the layout against the estimator PC.
    let mut layout = Layout { frag_offsets: vec![0; frags.len()], ..Layout::default() };
    let mut scratch = Vec::new();
    emit_all(frags, estimator_pc, None, &mut layout, &mut scratch)?;
    layout.total = scratch.len();

    // Commit: one contiguous allocation, final bytes.
    let cache_pc = cache.allocate(layout.total)?;
    let mut bytes = Vec::with_capacity(layout.total);
    let mut commit_layout = Layout { frag_offsets: vec![0; frags.len()], ..Layout::default() };
    emit_all(frags, cache_pc, Some(&layout), &mut commit_layout, &mut bytes)?;
    debug_assert_eq!(bytes.len(), layout.total);

    // Safety: `cache_pc` names a fresh allocation of `layout.total` bytes.
    unsafe { crate::cache::write_code(cache_pc, &bytes) };
    tracing::debug!(cache_pc, len = bytes.len(), "trace encoded");
    Ok(Assembled { cache_pc, len: bytes.len() })
}

fn emit_all(
    frags: &FragmentList,
    base: u64,
    resolved: Option<&Layout>,
    layout: &mut Layout,
    out: &mut Vec<u8>,
) -> Result<(), AssembleError> {
    for id in frags.ids() {
        layout.frag_offsets[id.0 as usize] = out.len();
        match &frags.node(id).fragment {
            Fragment::Exit(exit) => {
                // jmp [rip+0]; dq target.
                out.extend_from_slice(&[0xFF, 0x25, 0x00, 0x00, 0x00, 0x00]);
                out.extend_from_slice(&exit.target_pc.to_le_bytes());
            }
            Fragment::Code(code) => {
                for (index, instr) in code.instrs.iter().enumerate() {
                    match instr {
                        Instr::Label(label) => {
                            layout.labels.insert(*label, out.len());
                        }
                        Instr::Annotation(_) => {}
                        Instr::Native(native) => {
                            let branch_succ = (code.branch_instr == Some(index))
                                .then(|| frags.node(id).successors[SUCC_BRANCH])
                                .flatten();
                            emit_instr(native, base, resolved, out, branch_succ)?;
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

/// Resolve a branch/immediate target to an offset within the region.
fn resolve_target(
    target: Target,
    branch_succ: Option<FragId>,
    resolved: Option<&Layout>,
) -> usize {
    let Some(layout) = resolved else { return 0 };
    match (branch_succ, target) {
        // The fragment's terminator always follows the graph edge.
        (Some(succ), _) => layout.frag_offsets[succ.0 as usize],
        (None, Target::Frag(frag)) => layout.frag_offsets[frag.0 as usize],
        (None, Target::Label(label)) => {
            *layout.labels.get(&label).expect("label emitted by a fragment")
        }
        (None, other) => unreachable!("unresolved branch target {other:?}"),
    }
}

fn emit_instr(
    native: &Instruction,
    base: u64,
    resolved: Option<&Layout>,
    out: &mut Vec<u8>,
    branch_succ: Option<FragId>,
) -> Result<(), AssembleError> {
    // Control transfers that resolve within the region use fixed rel32
    // forms; absolute cache targets go through an inline pointer.
    match native.class {
        OpClass::Jmp | OpClass::Jcc | OpClass::Call => match native.target() {
            Some(Target::CachePc(pc)) => {
                debug_assert_eq!(native.class, OpClass::Jmp);
                out.extend_from_slice(&[0xFF, 0x25, 0x00, 0x00, 0x00, 0x00]);
                out.extend_from_slice(&pc.to_le_bytes());
                return Ok(());
            }
            Some(target) => {
                let target_offset = resolve_target(target, branch_succ, resolved);
                let insn_len: usize = match native.class {
                    OpClass::Jmp => 5,
                    OpClass::Jcc => 6,
                    _ => 5,
                };
                let disp = target_offset as i64 - (out.len() + insn_len) as i64;
                let disp = i32::try_from(disp).map_err(|_| AssembleError::Unencodable("branch"))?;
                match native.class {
                    OpClass::Jmp => {
                        out.push(0xE9);
                        out.extend_from_slice(&disp.to_le_bytes());
                    }
                    OpClass::Jcc => {
                        let cc = native.cc.ok_or(AssembleError::Unencodable("jcc"))?;
                        out.push(0x0F);
                        out.push(0x80 | cc.index());
                        out.extend_from_slice(&disp.to_le_bytes());
                    }
                    _ => {
                        out.push(0xE8);
                        out.extend_from_slice(&disp.to_le_bytes());
                    }
                }
                return Ok(());
            }
            None => {} // Indirect: falls through to machine lowering.
        },
        OpClass::Mov => {
            // A label-address immediate always takes the movabs form, so
            // its length is value-independent.
            if let Some(OperandKind::BranchTarget(target)) =
                native.operands.get(1).map(|op| op.kind)
            {
                let dst = native.operands[0]
                    .as_reg()
                    .and_then(VirtReg::as_native)
                    .ok_or(AssembleError::Unencodable("label address"))?;
                let value = base + resolve_target(target, None, resolved) as u64;
                out.push(0x48 | if dst.needs_rex_bit() { 1 } else { 0 });
                out.push(0xB8 | dst.low_bits());
                out.extend_from_slice(&value.to_le_bytes());
                return Ok(());
            }
        }
        _ => {}
    }

    // General machine lowering.
    let mut insn = to_machine(native)?;

    // PC-relative data references: compute the final displacement from the
    // instruction's end.
    if let Some(target) = pc_relative_target(native) {
        // Lengths of RIP-relative forms do not depend on the displacement.
        let mut probe = insn;
        set_rip_disp(&mut probe, 0);
        let mut tmp = Vec::new();
        let len = x86::encode(&probe, &mut tmp).map_err(|_| AssembleError::Unencodable("rip"))?;
        let disp = target as i64 - (base as i64 + (out.len() + len) as i64);
        let disp = i32::try_from(disp).map_err(|_| AssembleError::Unencodable("rip reach"))?;
        set_rip_disp(&mut insn, disp);
    }

    x86::encode(&insn, out).map_err(|_| AssembleError::Unencodable("machine form"))?;
    Ok(())
}

fn pc_relative_target(native: &Instruction) -> Option<u64> {
    native.operands.iter().find_map(|op| match op.kind {
        OperandKind::Mem(MemOperand::PcRelative { target }) => Some(target),
        _ => None,
    })
}

fn set_rip_disp(insn: &mut x86::Insn, disp: i32) {
    let patch = |mem: &mut x86::Mem| {
        if mem.rip_relative {
            mem.disp = disp;
        }
    };
    match &mut insn.operands {
        x86::Operands::RegMem { mem, .. }
        | x86::Operands::MemReg { mem, .. }
        | x86::Operands::MemImm { mem, .. }
        | x86::Operands::Mem(mem) => patch(mem),
        _ => {}
    }
}

/// Lower an IR instruction to its machine record. All register operands
/// must be native by now; anything else is a scheduling bug surfaced as an
/// encoding failure.
fn to_machine(native: &Instruction) -> Result<x86::Insn, AssembleError> {
    let gpr = |reg: VirtReg| reg.as_native().ok_or(AssembleError::Unencodable("virtual register"));

    let mem = |mem: &MemOperand| -> Result<x86::Mem, AssembleError> {
        Ok(match *mem {
            MemOperand::Indirect { base } => x86::Mem::base(gpr(base)?),
            MemOperand::Compound { base, index, disp } => x86::Mem {
                base: base.map(gpr).transpose()?,
                index: index.map(|(reg, scale)| Ok::<_, AssembleError>((gpr(reg)?, scale))).transpose()?,
                disp,
                rip_relative: false,
                seg: None,
            },
            MemOperand::Absolute(addr) => {
                let disp =
                    i32::try_from(addr as i64).map_err(|_| AssembleError::Unencodable("absolute"))?;
                x86::Mem::absolute(disp, None)
            }
            MemOperand::PcRelative { .. } => x86::Mem::rip(0),
            MemOperand::Segmented { seg, base, disp } => x86::Mem {
                base: base.map(gpr).transpose()?,
                index: None,
                disp,
                rip_relative: false,
                seg: Some(seg),
            },
        })
    };

    let ops = native.explicit_ops();
    let operands = match ops {
        [] => x86::Operands::None,
        [a] => match &a.kind {
            OperandKind::Reg(reg) => x86::Operands::Reg(gpr(*reg)?),
            OperandKind::Mem(m) => x86::Operands::Mem(mem(m)?),
            OperandKind::Imm(imm) => x86::Operands::Imm(*imm),
            _ => return Err(AssembleError::Unencodable("operand form")),
        },
        [a, b] => match (&a.kind, &b.kind) {
            (OperandKind::Reg(dst), OperandKind::Reg(src)) => {
                x86::Operands::RegReg { dst: gpr(*dst)?, src: gpr(*src)? }
            }
            (OperandKind::Reg(reg), OperandKind::Mem(m)) => {
                x86::Operands::RegMem { reg: gpr(*reg)?, mem: mem(m)? }
            }
            (OperandKind::Mem(m), OperandKind::Reg(reg)) => {
                x86::Operands::MemReg { mem: mem(m)?, reg: gpr(*reg)? }
            }
            (OperandKind::Reg(reg), OperandKind::Imm(imm)) => {
                x86::Operands::RegImm { reg: gpr(*reg)?, imm: *imm }
            }
            (OperandKind::Mem(m), OperandKind::Imm(imm)) => {
                x86::Operands::MemImm { mem: mem(m)?, imm: *imm }
            }
            _ => return Err(AssembleError::Unencodable("operand form")),
        },
        _ => return Err(AssembleError::Unencodable("operand count")),
    };

    Ok(x86::Insn {
        class: native.class,
        cc: native.cc,
        prefixes: native.prefixes,
        opsize: native.opsize,
        operands,
        len: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::{
        CodeFragment, ExitFragment, ExitKind, FragAttrs, StackStatus, SUCC_FALL_THROUGH,
    };
    use grist_x86::Gpr;

    fn code_frag(frags: &mut FragmentList, instrs: Vec<Instr>) -> FragId {
        frags.append(Fragment::Code(CodeFragment {
            instrs,
            attrs: FragAttrs::default(),
            stack: StackStatus::default(),
            branch_instr: None,
        }))
    }

    fn read_cache(pc: u64, len: usize) -> Vec<u8> {
        unsafe { std::slice::from_raw_parts(pc as *const u8, len) }.to_vec()
    }

    #[test]
    fn test_exit_fragment_trampoline() {
        let cache = CodeCache::new(1);
        let mut frags = FragmentList::new();
        frags.append(Fragment::Exit(ExitFragment {
            kind: ExitKind::Native,
            target_pc: 0x1122334455667788,
            block_meta: None,
            direct_edge: None,
            indirect_edge: None,
        }));
        let estimator = cache.estimator_pc().unwrap();
        let assembled = encode_frags(&frags, &cache, estimator).unwrap();
        let bytes = read_cache(assembled.cache_pc, assembled.len);
        assert_eq!(&bytes[..6], &[0xFF, 0x25, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(u64::from_le_bytes(bytes[6..14].try_into().unwrap()), 0x1122334455667788);
    }

    #[test]
    fn test_straight_line_bytes() {
        let cache = CodeCache::new(1);
        let mut frags = FragmentList::new();
        let mut ret = Instruction::synthesised(OpClass::Ret, 64);
        ret.category = grist_x86::Category::Ret;
        code_frag(
            &mut frags,
            vec![
                Instr::Label(LabelId(0)),
                Instr::Native(Box::new(Instruction::mov_rr(
                    VirtReg::Native(Gpr::Rdx),
                    VirtReg::Native(Gpr::Rdi),
                ))),
                Instr::Native(Box::new(ret)),
            ],
        );
        let estimator = cache.estimator_pc().unwrap();
        let assembled = encode_frags(&frags, &cache, estimator).unwrap();
        let bytes = read_cache(assembled.cache_pc, assembled.len);
        assert_eq!(bytes, vec![0x48, 0x89, 0xFA, 0xC3]);
    }

    #[test]
    fn test_branch_resolves_to_successor_fragment() {
        let cache = CodeCache::new(1);
        let mut frags = FragmentList::new();
        // frag0: jcc → frag2 (branch succ), falls through to frag1.
        let jcc = Instruction::jcc_label(grist_x86::Cc::E, LabelId(9));
        let a = code_frag(&mut frags, vec![Instr::Native(Box::new(jcc))]);
        frags.code_mut(a).branch_instr = Some(0);
        let b = code_frag(&mut frags, vec![Instr::Native(Box::new(Instruction::mov_rr(
            VirtReg::Native(Gpr::Rax),
            VirtReg::Native(Gpr::Rbx),
        )))]);
        let mut ret = Instruction::synthesised(OpClass::Ret, 64);
        ret.category = grist_x86::Category::Ret;
        let c = code_frag(&mut frags, vec![Instr::Native(Box::new(ret))]);
        frags.node_mut(a).successors[SUCC_FALL_THROUGH] = Some(b);
        frags.node_mut(a).successors[SUCC_BRANCH] = Some(c);

        let estimator = cache.estimator_pc().unwrap();
        let assembled = encode_frags(&frags, &cache, estimator).unwrap();
        let bytes = read_cache(assembled.cache_pc, assembled.len);
        // jz rel32 (6 bytes) over the 3-byte mov to the ret.
        assert_eq!(bytes[0], 0x0F);
        assert_eq!(bytes[1], 0x84);
        let disp = i32::from_le_bytes(bytes[2..6].try_into().unwrap());
        assert_eq!(disp, 3);
    }

    #[test]
    fn test_label_address_materialisation() {
        let cache = CodeCache::new(1);
        let mut frags = FragmentList::new();
        // movabs rax, &label ; label: ret
        let a = code_frag(
            &mut frags,
            vec![Instr::Native(Box::new(Instruction::mov_label_addr(
                VirtReg::Native(Gpr::Rax),
                LabelId(0),
            )))],
        );
        let mut ret = Instruction::synthesised(OpClass::Ret, 64);
        ret.category = grist_x86::Category::Ret;
        let b = code_frag(&mut frags, vec![Instr::Label(LabelId(0)), Instr::Native(Box::new(ret))]);
        frags.node_mut(a).successors[SUCC_FALL_THROUGH] = Some(b);

        let estimator = cache.estimator_pc().unwrap();
        let assembled = encode_frags(&frags, &cache, estimator).unwrap();
        let bytes = read_cache(assembled.cache_pc, assembled.len);
        assert_eq!(bytes[0], 0x48);
        assert_eq!(bytes[1], 0xB8);
        let imm = u64::from_le_bytes(bytes[2..10].try_into().unwrap());
        // The label sits right after the 10-byte movabs.
        assert_eq!(imm, assembled.cache_pc + 10);
        assert_eq!(bytes[10], 0xC3);
    }

    #[test]
    fn test_rip_relative_recomputed_against_commit_pc() {
        let cache = CodeCache::new(1);
        // A data byte placed in the cache itself, so the displacement is
        // known-reachable.
        let data_pc = cache.allocate(8).unwrap();
        unsafe { crate::cache::write_code(data_pc, &0xDEu64.to_le_bytes()) };

        let mut frags = FragmentList::new();
        let mut load = Instruction::mov_rm(
            VirtReg::Native(Gpr::Rax),
            MemOperand::PcRelative { target: data_pc },
        );
        load.is_app = true;
        let mut ret = Instruction::synthesised(OpClass::Ret, 64);
        ret.category = grist_x86::Category::Ret;
        code_frag(&mut frags, vec![Instr::Native(Box::new(load)), Instr::Native(Box::new(ret))]);

        let estimator = cache.estimator_pc().unwrap();
        let assembled = encode_frags(&frags, &cache, estimator).unwrap();
        let bytes = read_cache(assembled.cache_pc, assembled.len);
        // mov rax, [rip+disp]: 48 8B 05 <disp32>.
        assert_eq!(&bytes[..3], &[0x48, 0x8B, 0x05]);
        let disp = i32::from_le_bytes(bytes[3..7].try_into().unwrap()) as i64;
        assert_eq!(assembled.cache_pc as i64 + 7 + disp, data_pc as i64);
    }

    #[test]
    fn test_connecting_jump_targets_fragment() {
        let cache = CodeCache::new(1);
        let mut frags = FragmentList::new();
        let mut jump = Instruction::jmp_label(LabelId(0));
        let a = code_frag(&mut frags, Vec::new());
        let _b = code_frag(&mut frags, vec![Instr::Native(Box::new(Instruction::mov_rr(
            VirtReg::Native(Gpr::Rax),
            VirtReg::Native(Gpr::Rax),
        )))]);
        let mut ret = Instruction::synthesised(OpClass::Ret, 64);
        ret.category = grist_x86::Category::Ret;
        let c = code_frag(&mut frags, vec![Instr::Native(Box::new(ret))]);
        jump.set_target(Target::Frag(c));
        frags.code_mut(a).instrs.push(Instr::Native(Box::new(jump)));

        let estimator = cache.estimator_pc().unwrap();
        let assembled = encode_frags(&frags, &cache, estimator).unwrap();
        let bytes = read_cache(assembled.cache_pc, assembled.len);
        // jmp rel32 over the 3-byte mov.
        assert_eq!(bytes[0], 0xE9);
        let disp = i32::from_le_bytes(bytes[1..5].try_into().unwrap());
        assert_eq!(disp, 3);
    }

    #[test]
    fn test_stage_commit_lengths_agree() {
        // Value-dependent forms (imm widths) must be stable between the
        // two passes; encode a mix and simply check it round-trips through
        // the cache without length drift.
        let cache = CodeCache::new(1);
        let mut frags = FragmentList::new();
        let mut push = Instruction::push_reg(VirtReg::Native(Gpr::Rdi));
        push.is_app = true;
        let mut instrs = vec![
            Instr::Native(Box::new(push)),
            Instr::Native(Box::new(Instruction::mov_ri(VirtReg::Native(Gpr::Rax), 0x11223344556677))),
            Instr::Native(Box::new(Instruction::mov_ri(VirtReg::Native(Gpr::Rcx), 5))),
            Instr::Native(Box::new(Instruction::and_ri(VirtReg::Native(Gpr::Rcx), 7))),
        ];
        let mut ret = Instruction::synthesised(OpClass::Ret, 64);
        ret.category = grist_x86::Category::Ret;
        instrs.push(Instr::Native(Box::new(ret)));
        code_frag(&mut frags, instrs);

        let estimator = cache.estimator_pc().unwrap();
        let assembled = encode_frags(&frags, &cache, estimator).unwrap();
        // push (1) + movabs (10) + mov imm32 (7) + and imm8 (4) + ret (1).
        assert_eq!(assembled.len, 23);
    }
}
