//! Virtual-register scheduling
//!
//! Partitions are first coarsened along traversed edges between fragments
//! that allow it (same block, no CFI boundary); each partition is then
//! scheduled independently. Every virtual register is backed by a native
//! GPR that no instruction in the partition references; the backed GPR's
//! application value is saved to a slot on entry to the partition and
//! restored at every exit from the live range. Victims are preferred
//! caller-saved first. RSP is never allocated, so a virtual register can
//! never coincide with the stack pointer.
//!
//! When the partition references so many GPRs that no backing registers
//! remain, scheduling fails: the whole trace is discarded and the caller
//! emits a native block instead.

use rustc_hash::{FxHashMap, FxHashSet};

use grist_x86::Gpr;

use crate::assemble::{traversed_edges, AssembleError, SlotAlloc};
use crate::fragment::{
    CodeFragment, FragAttrs, FragId, Fragment, FragmentList, StackStatus, SUCC_FALL_THROUGH,
};
use crate::ir::{Instr, Instruction, VirtReg};
use crate::meta::MetaRef;

/// Backing-register preference: caller-saved first, then callee-saved.
/// RSP is excluded outright.
const PREFERENCE: [Gpr; 15] = [
    Gpr::Rax,
    Gpr::Rcx,
    Gpr::Rdx,
    Gpr::Rsi,
    Gpr::Rdi,
    Gpr::R8,
    Gpr::R9,
    Gpr::R10,
    Gpr::R11,
    Gpr::Rbx,
    Gpr::Rbp,
    Gpr::R12,
    Gpr::R13,
    Gpr::R14,
    Gpr::R15,
];

/// Assign every virtual register a backing native GPR, with slot-backed
/// save/restore of the GPR's application value around the partition.
pub fn schedule_registers(
    frags: &mut FragmentList,
    slots: &mut SlotAlloc,
) -> Result<(), AssembleError> {
    coarsen_partitions(frags);

    // Group code fragments by partition root, in deterministic order.
    let ids: Vec<FragId> = frags.ids().collect();
    let mut members: FxHashMap<FragId, Vec<FragId>> = FxHashMap::default();
    for &id in &ids {
        if frags.node(id).fragment.as_code().is_some() {
            let root = frags.partition(id);
            members.entry(root).or_default().push(id);
        }
    }
    let mut roots: Vec<FragId> = members.keys().copied().collect();
    roots.sort_by_key(|root| root.0);

    for root in roots {
        let frag_ids = &members[&root];
        schedule_partition(frags, slots, frag_ids)?;
    }
    Ok(())
}

/// Union fragments along traversed edges where both sides permit it and
/// share block identity, so block-local virtual registers span their
/// block's fragments.
fn coarsen_partitions(frags: &mut FragmentList) {
    for id in frags.ids().collect::<Vec<_>>() {
        let Some(code) = frags.node(id).fragment.as_code() else { continue };
        if !code.attrs.can_add_to_partition {
            continue;
        }
        let meta = code.attrs.block_meta.clone();
        let traversed = traversed_edges(frags, id);
        for slot in 0..2 {
            if !traversed[slot] {
                continue;
            }
            let Some(succ) = frags.node(id).successors[slot] else { continue };
            let Some(succ_code) = frags.node(succ).fragment.as_code() else { continue };
            if !succ_code.attrs.can_add_to_partition {
                continue;
            }
            let same_block = match (&meta, &succ_code.attrs.block_meta) {
                (Some(a), Some(b)) => MetaRef::ptr_eq(a, b),
                _ => false,
            };
            if same_block {
                frags.union_partitions(id, succ);
            }
        }
    }
}

fn schedule_partition(
    frags: &mut FragmentList,
    slots: &mut SlotAlloc,
    frag_ids: &[FragId],
) -> Result<(), AssembleError> {
    // Which virtual registers live here, and which GPRs are referenced.
    let mut vregs: Vec<VirtReg> = Vec::new();
    let mut used: FxHashSet<Gpr> = FxHashSet::default();
    for &id in frag_ids {
        for instr in &frags.code(id).instrs {
            if let Some(native) = instr.as_native() {
                native.for_each_reg(|reg, _| match reg {
                    VirtReg::Native(gpr) => {
                        used.insert(gpr);
                    }
                    VirtReg::Virt(_) => {
                        if !vregs.contains(&reg) {
                            vregs.push(reg);
                        }
                    }
                    VirtReg::Slot(_) | VirtReg::Flags => {}
                });
            }
        }
    }
    if vregs.is_empty() {
        return Ok(());
    }

    let candidates: Vec<Gpr> =
        PREFERENCE.iter().copied().filter(|gpr| !used.contains(gpr)).collect();
    if candidates.len() < vregs.len() {
        tracing::debug!(
            vregs = vregs.len(),
            free = candidates.len(),
            "register pressure unsatisfiable"
        );
        return Err(AssembleError::SlotExhaustion(slots.limit()));
    }

    // Assign and rewrite.
    let assignment: Vec<(VirtReg, Gpr)> = vregs.into_iter().zip(candidates).collect();
    for &id in frag_ids {
        for instr in &mut frags.code_mut(id).instrs {
            if let Some(native) = instr.as_native_mut() {
                for &(vreg, gpr) in &assignment {
                    native.replace_reg(vreg, VirtReg::Native(gpr));
                }
            }
        }
    }

    // One slot per backing register.
    let mut backing: Vec<(Gpr, u16)> = Vec::new();
    for &(_, gpr) in &assignment {
        backing.push((gpr, slots.alloc()?));
    }

    let in_partition: FxHashSet<FragId> = frag_ids.iter().copied().collect();

    // Saves: on every traversed edge entering the partition, and inline at
    // the head when the partition roots the graph.
    for id in frags.ids().collect::<Vec<_>>() {
        if in_partition.contains(&id) {
            continue;
        }
        let traversed = traversed_edges(frags, id);
        for slot in 0..2 {
            if !traversed[slot] {
                continue;
            }
            let Some(succ) = frags.node(id).successors[slot] else { continue };
            if !in_partition.contains(&succ) {
                continue;
            }
            let save = append_fixup_fragment(frags, save_instrs(&backing), succ);
            frags.node_mut(id).successors[slot] = Some(save);
        }
    }
    if in_partition.contains(&FragId(0)) {
        let code = frags.code_mut(FragId(0));
        let at = if matches!(code.instrs.first(), Some(Instr::Label(_))) { 1 } else { 0 };
        let seq = save_instrs(&backing);
        let len = seq.len();
        for (offset, instr) in seq.into_iter().enumerate() {
            code.instrs.insert(at + offset, instr);
        }
        if let Some(branch) = code.branch_instr {
            code.branch_instr = Some(branch + len);
        }
    }

    // Restores: on traversed edges leaving the partition, and inline
    // before pointer-mediated exits.
    for &id in frag_ids {
        if crate::assemble::flags::leaves_through_pointer(frags, id) {
            let code = frags.code_mut(id);
            let at = code.branch_instr.expect("pointer exit has a branch");
            let seq = restore_instrs(&backing);
            let len = seq.len();
            for (offset, instr) in seq.into_iter().enumerate() {
                code.instrs.insert(at + offset, instr);
            }
            code.branch_instr = Some(at + len);
            continue;
        }
        let traversed = traversed_edges(frags, id);
        for slot in 0..2 {
            if !traversed[slot] {
                continue;
            }
            let Some(succ) = frags.node(id).successors[slot] else { continue };
            if in_partition.contains(&succ) {
                continue;
            }
            let restore = append_fixup_fragment(frags, restore_instrs(&backing), succ);
            frags.node_mut(id).successors[slot] = Some(restore);
        }
    }

    Ok(())
}

fn save_instrs(backing: &[(Gpr, u16)]) -> Vec<Instr> {
    backing
        .iter()
        .map(|&(gpr, slot)| {
            Instr::Native(Box::new(Instruction::mov_rr(VirtReg::Slot(slot), VirtReg::Native(gpr))))
        })
        .collect()
}

fn restore_instrs(backing: &[(Gpr, u16)]) -> Vec<Instr> {
    backing
        .iter()
        .map(|&(gpr, slot)| {
            Instr::Native(Box::new(Instruction::mov_rr(VirtReg::Native(gpr), VirtReg::Slot(slot))))
        })
        .collect()
}

fn append_fixup_fragment(frags: &mut FragmentList, instrs: Vec<Instr>, to: FragId) -> FragId {
    let code = CodeFragment {
        instrs,
        attrs: FragAttrs {
            has_native_instrs: true,
            can_add_to_partition: false,
            ..FragAttrs::default()
        },
        stack: StackStatus::default(),
        branch_instr: None,
    };
    let id = frags.append(Fragment::Code(code));
    frags.node_mut(id).successors[SUCC_FALL_THROUGH] = Some(to);
    id
}
