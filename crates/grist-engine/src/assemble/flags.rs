//! Flag save/restore
//!
//! A dataflow pass over the fragment graph. Instrumentation fragments that
//! write the arithmetic flags are grouped into regions (connected runs of
//! instrumentation fragments); wherever application flags are live across
//! such a region, a save is inserted on every entry edge and a restore on
//! every exit edge. Fragments that leave the region through an indirect
//! jump restore inline, before the jump.
//!
//! The materialisation uses LAHF/SETO into a spilled RAX, and
//! `ADD AL, 0x7F` + SAHF to rebuild OF and the low flags; the two staging
//! slots come from the scheduler's slot space, never the application stack
//! directly.

use crate::assemble::{AssembleError, SlotAlloc};
use crate::fragment::{
    CodeFragment, FragId, Fragment, FragmentList, StackStatus, SUCC_FALL_THROUGH,
};
use crate::ir::{Instr, Instruction, OperandKind, Target, VirtReg};

/// Insert saves/restores where instrumentation flag writes would clobber
/// live application flags.
pub fn save_and_restore_flags(
    frags: &mut FragmentList,
    slots: &mut SlotAlloc,
) -> Result<(), AssembleError> {
    let n = frags.len();

    // Per-fragment gen (reads flags before writing them) and kill
    // (writes flags anywhere).
    let mut gen = vec![false; n];
    let mut kill = vec![false; n];
    for id in frags.ids() {
        if let Some(code) = frags.node(id).fragment.as_code() {
            let mut wrote = false;
            for instr in &code.instrs {
                if let Some(native) = instr.as_native() {
                    if native.reads_flags() && !wrote {
                        gen[id.0 as usize] = true;
                    }
                    if native.writes_flags() {
                        wrote = true;
                    }
                }
            }
            kill[id.0 as usize] = wrote;
        }
    }

    // Backward liveness to fixpoint. Exit fragments conservatively read
    // the flags (the application continues there).
    let mut live_in = vec![false; n];
    for id in frags.ids() {
        if frags.node(id).fragment.as_exit().is_some() {
            live_in[id.0 as usize] = true;
        }
    }
    loop {
        let mut changed = false;
        for index in (0..n).rev() {
            let id = FragId(index as u32);
            if frags.node(id).fragment.as_exit().is_some() {
                continue;
            }
            // Pointer-mediated exits (indirect dispatch, ret) continue at
            // unknown application code: conservatively flag-live.
            let live_out = leaves_through_pointer(frags, id)
                || frags.node(id).successors.iter().flatten().any(|succ| live_in[succ.0 as usize]);
            let next = gen[index] || (live_out && !kill[index]);
            if next != live_in[index] {
                live_in[index] = next;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    // Group instrumentation fragments into regions along edges whose both
    // ends are instrumentation code.
    let is_inst = |frags: &FragmentList, id: FragId| {
        frags
            .node(id)
            .fragment
            .as_code()
            .is_some_and(|code| !code.attrs.is_app_code && code.attrs.has_native_instrs)
    };
    let mut region = (0..n as u32).map(FragId).collect::<Vec<_>>();
    // Union-find root; `None` for fragments added after region analysis.
    fn find(region: &mut [FragId], id: FragId) -> Option<usize> {
        if id.0 as usize >= region.len() {
            return None;
        }
        let mut current = id;
        while region[current.0 as usize] != current {
            let parent = region[current.0 as usize];
            region[current.0 as usize] = region[parent.0 as usize];
            current = region[parent.0 as usize];
        }
        Some(current.0 as usize)
    }
    for id in frags.ids() {
        if !is_inst(frags, id) {
            continue;
        }
        for succ in frags.node(id).successors.iter().flatten().copied().collect::<Vec<_>>() {
            if is_inst(frags, succ) {
                let a = find(&mut region, id).expect("analysed fragment");
                let b = find(&mut region, succ).expect("analysed fragment");
                if a != b {
                    region[b] = FragId(a as u32);
                }
            }
        }
    }

    // A region needs bracketing when it writes the flags and application
    // flags are live at some exit from it.
    let mut region_writes = vec![false; n];
    let mut region_live_out = vec![false; n];
    for id in frags.ids() {
        if !is_inst(frags, id) {
            continue;
        }
        let root = find(&mut region, id).expect("analysed fragment");
        if frags.code(id).attrs.modifies_flags {
            region_writes[root] = true;
        }
        for succ in frags.node(id).successors.iter().flatten() {
            let same = is_inst(frags, *succ) && find(&mut region, *succ) == Some(root);
            if !same && live_in[succ.0 as usize] {
                region_live_out[root] = true;
            }
        }
        if leaves_through_pointer(frags, id) {
            // Dispatches to unknown application code.
            region_live_out[root] = true;
        }
    }

    let needs_bracket = |frags: &FragmentList, region: &mut Vec<FragId>, id: FragId| {
        if !is_inst(frags, id) {
            return false;
        }
        match find(region, id) {
            Some(root) => region_writes[root] && region_live_out[root],
            None => false,
        }
    };

    // Nothing to do for most traces.
    let any = frags
        .ids()
        .any(|id| needs_bracket(frags, &mut region, id));
    if !any {
        return Ok(());
    }

    let slot_rax = slots.alloc()?;
    let slot_flags = slots.alloc()?;

    // Restores: on every region-leaving edge where flags are live, or
    // inline before a pointer-mediated exit.
    for id in frags.ids().collect::<Vec<_>>() {
        if !needs_bracket(frags, &mut region, id) {
            continue;
        }
        let root = find(&mut region, id).expect("analysed fragment");

        if leaves_through_pointer(frags, id) {
            let code = frags.code_mut(id);
            let at = code.branch_instr.expect("pointer exit has a branch");
            let seq = restore_seq(slot_rax, slot_flags);
            let len = seq.len();
            for (offset, instr) in seq.into_iter().enumerate() {
                code.instrs.insert(at + offset, instr);
            }
            code.branch_instr = Some(at + len);
            continue;
        }

        let traversed = crate::assemble::traversed_edges(frags, id);
        for slot in 0..2 {
            let Some(succ) = frags.node(id).successors[slot] else { continue };
            if !traversed[slot] {
                continue;
            }
            let same_region = is_inst(frags, succ) && find(&mut region, succ) == Some(root);
            let succ_live = live_in.get(succ.0 as usize).copied().unwrap_or(true);
            if same_region || !succ_live {
                continue;
            }
            let restore = append_seq_fragment(frags, restore_seq(slot_rax, slot_flags), succ);
            frags.node_mut(id).successors[slot] = Some(restore);
        }
    }

    // Saves: on every edge entering the region from outside (and at the
    // head of a region that roots the graph).
    for id in frags.ids().collect::<Vec<_>>() {
        let entering: Vec<(FragId, usize)> = frags
            .ids()
            .flat_map(|pred| {
                let traversed = crate::assemble::traversed_edges(frags, pred);
                frags.node(pred).successors.iter().enumerate().filter_map(move |(slot, succ)| {
                    (*succ == Some(id) && traversed[slot]).then_some((pred, slot))
                })
            })
            .collect();
        if !needs_bracket(frags, &mut region, id) {
            continue;
        }
        let root = find(&mut region, id).expect("analysed fragment");
        for (pred, slot) in entering {
            let from_same = is_inst(frags, pred) && find(&mut region, pred) == Some(root);
            if from_same {
                continue;
            }
            let save = append_seq_fragment(frags, save_seq(slot_rax, slot_flags), id);
            frags.node_mut(pred).successors[slot] = Some(save);
        }
        if id == FragId(0) {
            // The region roots the graph: save at the head, after the
            // label.
            let code = frags.code_mut(id);
            let at = if matches!(code.instrs.first(), Some(Instr::Label(_))) { 1 } else { 0 };
            for (offset, instr) in save_seq(slot_rax, slot_flags).into_iter().enumerate() {
                code.instrs.insert(at + offset, instr);
            }
            if let Some(branch) = code.branch_instr {
                code.branch_instr = Some(branch + 5);
            }
        }
    }

    Ok(())
}

/// Whether a fragment's terminator leaves through a pointer (indirect
/// jump, ret dispatch, or absolute cache address) rather than a graph
/// edge.
pub(crate) fn leaves_through_pointer(frags: &FragmentList, id: FragId) -> bool {
    let Some(code) = frags.node(id).fragment.as_code() else { return false };
    let Some(at) = code.branch_instr else { return false };
    let Some(native) = code.instrs[at].as_native() else { return false };
    match native.class {
        grist_x86::OpClass::Jmp => {
            matches!(native.target(), Some(Target::CachePc(_)))
                || native
                    .explicit_ops()
                    .first()
                    .is_some_and(|op| matches!(op.kind, OperandKind::Mem(_) | OperandKind::Reg(_)))
        }
        grist_x86::OpClass::Ret => true,
        _ => false,
    }
}

/// Spill RAX, materialise the flags into AX (LAHF + SETO), park them in a
/// slot, and restore RAX.
fn save_seq(slot_rax: u16, slot_flags: u16) -> Vec<Instr> {
    let rax = VirtReg::Native(grist_x86::Gpr::Rax);
    vec![
        Instr::Native(Box::new(Instruction::mov_rr(VirtReg::Slot(slot_rax), rax))),
        Instr::Native(Box::new(Instruction::lahf())),
        Instr::Native(Box::new(Instruction::seto_al())),
        Instr::Native(Box::new(Instruction::mov_rr(VirtReg::Slot(slot_flags), rax))),
        Instr::Native(Box::new(Instruction::mov_rr(rax, VirtReg::Slot(slot_rax)))),
    ]
}

/// Reload the saved flags and rebuild OF (`ADD AL, 0x7F`) before SAHF.
fn restore_seq(slot_rax: u16, slot_flags: u16) -> Vec<Instr> {
    let rax = VirtReg::Native(grist_x86::Gpr::Rax);
    vec![
        Instr::Native(Box::new(Instruction::mov_rr(VirtReg::Slot(slot_rax), rax))),
        Instr::Native(Box::new(Instruction::mov_rr(rax, VirtReg::Slot(slot_flags)))),
        Instr::Native(Box::new(Instruction::add_al(0x7F))),
        Instr::Native(Box::new(Instruction::sahf())),
        Instr::Native(Box::new(Instruction::mov_rr(rax, VirtReg::Slot(slot_rax)))),
    ]
}

/// Append a save/restore fragment between `…` and `to`.
fn append_seq_fragment(frags: &mut FragmentList, instrs: Vec<Instr>, to: FragId) -> FragId {
    let code = CodeFragment {
        instrs,
        attrs: crate::fragment::FragAttrs {
            has_native_instrs: true,
            can_add_to_partition: false,
            ..Default::default()
        },
        stack: StackStatus::default(),
        branch_instr: None,
    };
    let id = frags.append(Fragment::Code(code));
    frags.node_mut(id).successors[SUCC_FALL_THROUGH] = Some(to);
    id
}
