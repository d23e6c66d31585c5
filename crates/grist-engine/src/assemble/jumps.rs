//! Connecting jumps
//!
//! Layout order is fragment-list order. Wherever a fragment's control
//! falls off its end but its fall-through successor is not the next
//! fragment in layout, a direct jump is synthesised; jumps to the
//! immediately following fragment are elided.

use crate::assemble::traversed_edges;
use crate::fragment::{FragId, FragmentList, SUCC_FALL_THROUGH};
use crate::ir::{Instr, Instruction, Target};

/// Synthesise the jumps that stitch non-adjacent fall-throughs together.
pub fn add_connecting_jumps(frags: &mut FragmentList) {
    for id in frags.ids().collect::<Vec<_>>() {
        if frags.node(id).fragment.as_code().is_none() {
            continue;
        }
        if !traversed_edges(frags, id)[SUCC_FALL_THROUGH] {
            continue;
        }
        let Some(succ) = frags.node(id).successors[SUCC_FALL_THROUGH] else { continue };
        if succ == FragId(id.0 + 1) {
            // Natural fall-through.
            continue;
        }
        let mut jump = Instruction::jmp_label(crate::ir::LabelId(0));
        jump.set_target(Target::Frag(succ));
        frags.code_mut(id).instrs.push(Instr::Native(Box::new(jump)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::{CodeFragment, FragAttrs, Fragment, StackStatus};
    use grist_x86::OpClass;

    fn empty_frag(frags: &mut FragmentList) -> FragId {
        frags.append(Fragment::Code(CodeFragment {
            instrs: Vec::new(),
            attrs: FragAttrs::default(),
            stack: StackStatus::default(),
            branch_instr: None,
        }))
    }

    #[test]
    fn test_adjacent_fall_through_elided() {
        let mut frags = FragmentList::new();
        let a = empty_frag(&mut frags);
        let b = empty_frag(&mut frags);
        frags.node_mut(a).successors[SUCC_FALL_THROUGH] = Some(b);
        add_connecting_jumps(&mut frags);
        assert!(frags.code(a).instrs.is_empty());
    }

    #[test]
    fn test_non_adjacent_fall_through_gets_jump() {
        let mut frags = FragmentList::new();
        let a = empty_frag(&mut frags);
        let _b = empty_frag(&mut frags);
        let c = empty_frag(&mut frags);
        frags.node_mut(a).successors[SUCC_FALL_THROUGH] = Some(c);
        add_connecting_jumps(&mut frags);
        let code = frags.code(a);
        assert_eq!(code.instrs.len(), 1);
        let native = code.instrs[0].as_native().unwrap();
        assert_eq!(native.class, OpClass::Jmp);
        assert_eq!(native.target(), Some(Target::Frag(c)));
    }

    #[test]
    fn test_unconditional_terminator_needs_no_jump() {
        let mut frags = FragmentList::new();
        let a = empty_frag(&mut frags);
        let _b = empty_frag(&mut frags);
        let c = empty_frag(&mut frags);
        // a ends in ret; its (structural) fall-through is not emitted.
        let mut ret = Instruction::synthesised(OpClass::Ret, 64);
        ret.category = grist_x86::Category::Ret;
        frags.code_mut(a).instrs.push(Instr::Native(Box::new(ret)));
        frags.code_mut(a).branch_instr = Some(0);
        frags.node_mut(a).successors[SUCC_FALL_THROUGH] = Some(c);
        add_connecting_jumps(&mut frags);
        assert_eq!(frags.code(a).instrs.len(), 1);
    }
}
