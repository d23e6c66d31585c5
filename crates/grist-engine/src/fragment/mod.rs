//! Fragments
//!
//! A fragment is a straight-line instruction run with at most two
//! successors (fall-through and branch). The fragment builder re-splits
//! instrumented blocks at every semantic boundary — control flow, labels,
//! flag-classification changes, stack-validity changes, interrupt-state
//! changes — so the downstream passes can reason about each fragment in
//! isolation.

pub mod builder;

use std::sync::Arc;

use crate::edge::{DirectEdge, IndirectEdge};
use crate::ir::Instr;
use crate::meta::MetaRef;

pub use builder::FragmentBuilder;

/// Index of a fragment within the list's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragId(pub u32);

/// Successor slot indices.
pub const SUCC_FALL_THROUGH: usize = 0;
pub const SUCC_BRANCH: usize = 1;

/// How control leaves the cache at an exit fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Resume at an untranslated application PC.
    Native,
    /// Enter a direct-edge stub.
    FutureBlockDirect,
    /// Enter indirect-edge dispatch.
    FutureBlockIndirect,
    /// Tail into a known cached block.
    ExistingBlock,
}

/// Inferred stack-pointer validity across a fragment.
#[derive(Debug, Clone, Copy, Default)]
pub struct StackStatus {
    pub is_checked: bool,
    pub is_valid: bool,
    pub disallow_forward_propagation: bool,
}

/// Fragment attributes consulted by the assemble passes.
#[derive(Debug, Clone, Default)]
pub struct FragAttrs {
    /// Head fragment of a block.
    pub is_block_head: bool,
    /// Metadata of the block this fragment came from.
    pub block_meta: Option<MetaRef>,
    /// Contains at least one original instruction that writes the flags or
    /// the stack pointer (vs. instrumentation-only).
    pub is_app_code: bool,
    /// Some instruction in the fragment writes the flags.
    pub modifies_flags: bool,
    /// A prior instruction hinted at a split before the next flag write.
    pub has_flag_split_hint: bool,
    /// Contains at least one native (non-annotation) instruction.
    pub has_native_instrs: bool,
    /// May be unioned into a neighbour's partition.
    pub can_add_to_partition: bool,
    /// The fragment's branch targets edge code.
    pub branches_to_edge_code: bool,
    /// This fragment *is* indirect in-edge code.
    pub is_in_edge_code: bool,
}

impl FragAttrs {
    fn new() -> FragAttrs {
        FragAttrs { can_add_to_partition: true, ..FragAttrs::default() }
    }
}

/// A fragment holding IR instructions.
#[derive(Debug)]
pub struct CodeFragment {
    pub instrs: Vec<Instr>,
    pub attrs: FragAttrs,
    pub stack: StackStatus,
    /// Index into `instrs` of the branch instruction, if any.
    pub branch_instr: Option<usize>,
}

impl CodeFragment {
    fn new() -> CodeFragment {
        CodeFragment { instrs: Vec::new(), attrs: FragAttrs::new(), stack: StackStatus::default(), branch_instr: None }
    }
}

/// A fragment pointing at already-encoded (or native) code.
#[derive(Debug)]
pub struct ExitFragment {
    pub kind: ExitKind,
    /// Native app PC, cached PC, or edge stub PC, by kind.
    pub target_pc: u64,
    pub block_meta: Option<MetaRef>,
    pub direct_edge: Option<Arc<DirectEdge>>,
    pub indirect_edge: Option<Arc<IndirectEdge>>,
}

/// One fragment.
#[derive(Debug)]
pub enum Fragment {
    Code(CodeFragment),
    Exit(ExitFragment),
}

impl Fragment {
    pub fn as_code(&self) -> Option<&CodeFragment> {
        match self {
            Fragment::Code(code) => Some(code),
            _ => None,
        }
    }

    pub fn as_code_mut(&mut self) -> Option<&mut CodeFragment> {
        match self {
            Fragment::Code(code) => Some(code),
            _ => None,
        }
    }

    pub fn as_exit(&self) -> Option<&ExitFragment> {
        match self {
            Fragment::Exit(exit) => Some(exit),
            _ => None,
        }
    }
}

/// Arena node: the fragment plus graph links and its union-find parent.
#[derive(Debug)]
pub struct FragNode {
    pub fragment: Fragment,
    pub successors: [Option<FragId>; 2],
    partition_parent: FragId,
}

/// The fragment graph, in layout (creation) order.
#[derive(Debug, Default)]
pub struct FragmentList {
    nodes: Vec<FragNode>,
}

impl FragmentList {
    pub fn new() -> FragmentList {
        FragmentList { nodes: Vec::new() }
    }

    pub fn append(&mut self, fragment: Fragment) -> FragId {
        let id = FragId(self.nodes.len() as u32);
        self.nodes.push(FragNode { fragment, successors: [None, None], partition_parent: id });
        id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = FragId> {
        (0..self.nodes.len() as u32).map(FragId)
    }

    pub fn node(&self, id: FragId) -> &FragNode {
        &self.nodes[id.0 as usize]
    }

    pub fn node_mut(&mut self, id: FragId) -> &mut FragNode {
        &mut self.nodes[id.0 as usize]
    }

    pub fn code(&self, id: FragId) -> &CodeFragment {
        self.nodes[id.0 as usize].fragment.as_code().expect("code fragment")
    }

    pub fn code_mut(&mut self, id: FragId) -> &mut CodeFragment {
        self.nodes[id.0 as usize].fragment.as_code_mut().expect("code fragment")
    }

    /// Union-find root of a fragment's partition, with path halving.
    pub fn partition(&mut self, id: FragId) -> FragId {
        let mut current = id;
        loop {
            let parent = self.nodes[current.0 as usize].partition_parent;
            if parent == current {
                return current;
            }
            let grand = self.nodes[parent.0 as usize].partition_parent;
            self.nodes[current.0 as usize].partition_parent = grand;
            current = grand;
        }
    }

    /// Partition root without mutation (no path compression).
    pub fn partition_of(&self, id: FragId) -> FragId {
        let mut current = id;
        loop {
            let parent = self.nodes[current.0 as usize].partition_parent;
            if parent == current {
                return current;
            }
            current = parent;
        }
    }

    /// Merge two fragments' partitions.
    pub fn union_partitions(&mut self, a: FragId, b: FragId) {
        let root_a = self.partition(a);
        let root_b = self.partition(b);
        if root_a != root_b {
            self.nodes[root_b.0 as usize].partition_parent = root_a;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_code() -> Fragment {
        Fragment::Code(CodeFragment::new())
    }

    #[test]
    fn test_arena_append() {
        let mut frags = FragmentList::new();
        let a = frags.append(empty_code());
        let b = frags.append(empty_code());
        assert_eq!(a, FragId(0));
        assert_eq!(b, FragId(1));
        assert_eq!(frags.len(), 2);
    }

    #[test]
    fn test_partition_union_find() {
        let mut frags = FragmentList::new();
        let a = frags.append(empty_code());
        let b = frags.append(empty_code());
        let c = frags.append(empty_code());
        assert_ne!(frags.partition(a), frags.partition(b));

        frags.union_partitions(a, b);
        assert_eq!(frags.partition(a), frags.partition(b));
        assert_ne!(frags.partition(a), frags.partition(c));

        frags.union_partitions(b, c);
        assert_eq!(frags.partition(a), frags.partition(c));
        assert_eq!(frags.partition_of(c), frags.partition_of(a));
    }
}
