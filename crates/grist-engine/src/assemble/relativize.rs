//! Relativisation
//!
//! Every PC-relative memory operand was resolved to an absolute target at
//! decode time. Before encoding, each one is checked against the cache's
//! estimator PC: targets within rel32 reach (minus a safety margin for
//! slab drift) stay RIP-relative and get their displacement recomputed at
//! commit; targets out of reach are lowered to a load-immediate of the
//! absolute address through a fresh virtual register.

use crate::fragment::FragmentList;
use crate::ir::{Instr, Instruction, MemOperand, OperandKind};
use crate::trace::Trace;

/// Safety margin between the estimator PC and the committed PC: commit can
/// land in a later slab than the estimate.
const REACH_MARGIN: i64 = 1 << 24;

const REL32_MAX: i64 = i32::MAX as i64 - REACH_MARGIN;
const REL32_MIN: i64 = i32::MIN as i64 + REACH_MARGIN;

/// Whether `target` is rel32-reachable from code placed near `from`.
pub fn in_reach(from: u64, target: u64) -> bool {
    let delta = target.wrapping_sub(from) as i64;
    (REL32_MIN..=REL32_MAX).contains(&delta)
}

/// Relativise every code fragment in the graph.
pub fn relativize(trace: &mut Trace, frags: &mut FragmentList, estimator_pc: u64) {
    for id in frags.ids().collect::<Vec<_>>() {
        let Some(code) = frags.node_mut(id).fragment.as_code_mut() else { continue };

        let mut pos = 0;
        while pos < code.instrs.len() {
            let Instr::Native(native) = &mut code.instrs[pos] else {
                pos += 1;
                continue;
            };

            let mut oversize_target = None;
            for op in &native.operands {
                if let OperandKind::Mem(MemOperand::PcRelative { target }) = op.kind {
                    if !in_reach(estimator_pc, target) {
                        oversize_target = Some(target);
                    }
                }
            }
            let Some(target) = oversize_target else {
                pos += 1;
                continue;
            };

            // Out of rel32 reach: lower to movabs + register-indirect.
            let scratch = trace.alloc_virt_reg();
            tracing::debug!(target, ?scratch, "relativising oversize displacement");
            if native.class == grist_x86::OpClass::Lea {
                // The address *is* the result; no dereference.
                let dst = native.operands[0].as_reg().expect("lea destination");
                let replacement = Instruction::mov_ri(dst, target as i64);
                code.instrs[pos] = Instr::Native(Box::new(replacement));
                pos += 1;
                continue;
            }

            for op in &mut native.operands {
                if let OperandKind::Mem(mem @ MemOperand::PcRelative { .. }) = &mut op.kind {
                    *mem = MemOperand::Indirect { base: scratch };
                }
            }
            let load = Instruction::mov_ri(scratch, target as i64);
            code.instrs.insert(pos, Instr::Native(Box::new(load)));
            if let Some(branch) = code.branch_instr {
                if branch >= pos {
                    code.branch_instr = Some(branch + 1);
                }
            }
            pos += 2;
        }
    }
}
