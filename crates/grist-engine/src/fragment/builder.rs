//! Fragment list construction
//!
//! Re-splits the trace's instrumented blocks into fragments. A fragment
//! ends at: any control-flow instruction; any label (assumed branch
//! target); a flag-usage transition that would mix application and
//! instrumentation flag writes; a stack-validity change; an instruction
//! that changes interrupt delivery.
//!
//! Fragments contain either application or instrumentation instructions,
//! never a flag-modifying mix: an instrumentation fragment converts to
//! application on first append of a qualifying original instruction only
//! while no instrumentation instruction in it has modified the flags.
//! This lets the flag save/restore pass reason fragment-locally.
//!
//! The builder does not fail: every edge case maps to an exit fragment
//! that leaves the cache.

use rustc_hash::FxHashMap;

use grist_x86::{Category, OpClass};

use crate::edge::{EdgeHost, INDIRECT_TARGET_REG};
use crate::fragment::{
    CodeFragment, ExitFragment, ExitKind, FragId, Fragment, FragmentList, StackStatus,
    SUCC_BRANCH, SUCC_FALL_THROUGH,
};
use crate::ir::{Annotation, Instr, Instruction, LabelId, MemOperand, OperandKind, Target, VirtReg};
use crate::meta::MetaRef;
use crate::trace::{Block, BlockId, Trace};

/// Builds the fragment graph for one trace.
pub struct FragmentBuilder<'a> {
    trace: &'a mut Trace,
    edges: &'a dyn EdgeHost,
    frags: FragmentList,
    /// Head fragment (or exit fragment) per block.
    block_frag: FxHashMap<BlockId, FragId>,
    /// Fragment owning each label.
    label_frag: FxHashMap<LabelId, FragId>,
    /// Taken instruction lists, per decoded block.
    slots: FxHashMap<BlockId, Vec<Option<Instr>>>,
    /// Label positions within their block's list.
    label_pos: FxHashMap<LabelId, (BlockId, usize)>,
}

impl<'a> FragmentBuilder<'a> {
    pub fn new(trace: &'a mut Trace, edges: &'a dyn EdgeHost) -> FragmentBuilder<'a> {
        FragmentBuilder {
            trace,
            edges,
            frags: FragmentList::new(),
            block_frag: FxHashMap::default(),
            label_frag: FxHashMap::default(),
            slots: FxHashMap::default(),
            label_pos: FxHashMap::default(),
        }
    }

    /// Build the fragment list, rooted at the trace's entry block.
    pub fn build(mut self) -> FragmentList {
        let entry = self.trace.entry();
        self.fragment_for_block(entry);
        self.frags
    }

    // ---- fragment creation helpers ----

    fn append_code(&mut self, code: CodeFragment) -> FragId {
        self.frags.append(Fragment::Code(code))
    }

    fn append_exit(&mut self, exit: ExitFragment) -> FragId {
        self.frags.append(Fragment::Exit(exit))
    }

    /// A fresh empty fragment beginning with a new label.
    fn make_empty_label_frag(&mut self, meta: Option<MetaRef>) -> FragId {
        let label = self.trace.alloc_label();
        let mut code = CodeFragment::new();
        code.attrs.block_meta = meta;
        code.instrs.push(Instr::Label(label));
        let id = self.append_code(code);
        self.label_frag.insert(label, id);
        id
    }

    fn set_fall_through(&mut self, frag: FragId, succ: FragId) {
        self.frags.node_mut(frag).successors[SUCC_FALL_THROUGH] = Some(succ);
    }

    fn set_branch(&mut self, frag: FragId, succ: FragId) {
        self.frags.node_mut(frag).successors[SUCC_BRANCH] = Some(succ);
    }

    /// The label heading a code fragment.
    fn head_label(&self, frag: FragId) -> LabelId {
        match self.frags.code(frag).instrs.first() {
            Some(Instr::Label(label)) => *label,
            _ => unreachable!("code fragments begin with a label"),
        }
    }

    // ---- per-block entry points ----

    /// The fragment a block is entered through, creating it on demand.
    fn fragment_for_block(&mut self, block_id: BlockId) -> FragId {
        if let Some(&frag) = self.block_frag.get(&block_id) {
            return frag;
        }
        let frag = match self.trace.block(block_id) {
            Block::Decoded(_) => self.build_decoded(block_id),
            Block::Native(native) => {
                let pc = native.start_pc;
                let frag = self.append_exit(ExitFragment {
                    kind: ExitKind::Native,
                    target_pc: pc,
                    block_meta: None,
                    direct_edge: None,
                    indirect_edge: None,
                });
                self.block_frag.insert(block_id, frag);
                frag
            }
            Block::Cached(cached) => {
                let (pc, meta) = (cached.cache_pc, cached.meta.clone());
                let frag = self.append_exit(ExitFragment {
                    kind: ExitKind::ExistingBlock,
                    target_pc: pc,
                    block_meta: Some(meta),
                    direct_edge: None,
                    indirect_edge: None,
                });
                self.block_frag.insert(block_id, frag);
                frag
            }
            Block::DirectFuture(future) => {
                let (pc, meta) = (future.start_pc, future.meta.clone());
                let frag = self.build_direct_edge(pc, meta);
                self.block_frag.insert(block_id, frag);
                frag
            }
            Block::Compensation(_) => self.build_compensation(block_id),
            Block::IndirectFuture(_) | Block::Return(_) => {
                unreachable!("indirect successors are resolved at their CFI")
            }
        };
        frag
    }

    /// Direct-edge exit fragment (or a native exit if the edge cannot be
    /// allocated).
    fn build_direct_edge(&mut self, dest_pc: u64, dest_meta: MetaRef) -> FragId {
        match self.edges.allocate_direct_edge(None, dest_meta.clone()) {
            Ok(edge) => self.append_exit(ExitFragment {
                kind: ExitKind::FutureBlockDirect,
                target_pc: edge.edge_code,
                block_meta: Some(dest_meta),
                direct_edge: Some(edge),
                indirect_edge: None,
            }),
            Err(error) => {
                tracing::warn!(%error, dest_pc, "direct edge allocation failed; exiting natively");
                self.append_exit(ExitFragment {
                    kind: ExitKind::Native,
                    target_pc: dest_pc,
                    block_meta: None,
                    direct_edge: None,
                    indirect_edge: None,
                })
            }
        }
    }

    fn build_compensation(&mut self, block_id: BlockId) -> FragId {
        let (target, meta, instrs) = match self.trace.block_mut(block_id) {
            Block::Compensation(comp) => {
                (comp.target, comp.meta.clone(), std::mem::take(&mut comp.instrs))
            }
            _ => unreachable!(),
        };
        let frag = self.make_empty_label_frag(Some(meta));
        self.frags.code_mut(frag).attrs.is_block_head = true;
        self.block_frag.insert(block_id, frag);
        for instr in instrs {
            if let Instr::Native(native) = instr {
                self.append_native(frag, *native);
            }
        }
        let target_frag = self.fragment_for_block(target);
        self.set_fall_through(frag, target_frag);
        frag
    }

    /// Head fragment for a decoded block: take ownership of the block's
    /// instructions and extend.
    fn build_decoded(&mut self, block_id: BlockId) -> FragId {
        let (meta, instrs) = {
            let block = self.trace.block_mut(block_id).as_decoded_mut().expect("decoded");
            (block.meta.clone(), std::mem::take(&mut block.instrs))
        };

        let slots: Vec<Option<Instr>> = instrs.into_iter().map(Some).collect();
        for (pos, slot) in slots.iter().enumerate() {
            if let Some(Instr::Label(label)) = slot {
                self.label_pos.insert(*label, (block_id, pos));
            }
        }
        self.slots.insert(block_id, slots);

        let frag = self.make_empty_label_frag(Some(meta));
        self.frags.code_mut(frag).attrs.is_block_head = true;
        self.block_frag.insert(block_id, frag);
        self.extend(frag, block_id, 0);
        frag
    }

    // ---- the extension walk ----

    fn take_slot(&mut self, block: BlockId, pos: usize) -> Option<Instr> {
        self.slots.get_mut(&block)?.get_mut(pos)?.take()
    }

    fn peek_is_label(&self, block: BlockId, pos: usize) -> Option<LabelId> {
        match self.slots.get(&block)?.get(pos)? {
            Some(Instr::Label(label)) => Some(*label),
            _ => None,
        }
    }

    /// Extend `frag` with the block's instructions from `pos` onward.
    fn extend(&mut self, frag: FragId, block: BlockId, pos: usize) {
        let mut frag = frag;
        let mut pos = pos;
        loop {
            // Labels stop extension without being consumed here; they are
            // owned by (or will seed) their own fragment.
            if let Some(label) = self.peek_is_label(block, pos) {
                self.split_at_label(frag, block, pos, label);
                return;
            }
            let Some(instr) = self.take_slot(block, pos) else { return };
            match instr {
                Instr::Label(_) => unreachable!("labels handled by peek"),
                Instr::Annotation(annotation) => {
                    match self.handle_annotation(frag, block, pos, annotation) {
                        AnnotationFlow::Continue => pos += 1,
                        AnnotationFlow::Stop => return,
                    }
                }
                Instr::Native(native) => {
                    let native = *native;
                    if native.changes_interrupt_state() {
                        self.split_at_interrupt_change(frag, block, pos, native);
                        return;
                    }
                    if native.is_local_branch() {
                        self.split_at_branch(frag, block, pos, native);
                        return;
                    }
                    if native.is_cti()
                        && !matches!(native.category, Category::Syscall | Category::Interrupt)
                    {
                        self.split_at_cfi(frag, block, pos, native);
                        return;
                    }
                    frag = self.append_native(frag, native);
                    pos += 1;
                }
            }
        }
    }

    fn handle_annotation(
        &mut self,
        frag: FragId,
        block: BlockId,
        pos: usize,
        annotation: Annotation,
    ) -> AnnotationFlow {
        match annotation {
            Annotation::BlockBegin => AnnotationFlow::Continue,
            Annotation::ValidStack => {
                let code = self.frags.code(frag);
                if code.stack.is_checked && !code.stack.is_valid && code.attrs.has_native_instrs {
                    self.split_with_stack(frag, block, pos + 1, true);
                    AnnotationFlow::Stop
                } else {
                    let code = self.frags.code_mut(frag);
                    code.stack.is_checked = true;
                    code.stack.is_valid = true;
                    AnnotationFlow::Continue
                }
            }
            Annotation::UndefinedStack => {
                let code = self.frags.code(frag);
                if (code.stack.is_checked && code.stack.is_valid) || code.attrs.has_native_instrs {
                    self.split_with_stack(frag, block, pos + 1, false);
                    AnnotationFlow::Stop
                } else {
                    let code = self.frags.code_mut(frag);
                    code.stack.is_checked = true;
                    code.stack.is_valid = false;
                    AnnotationFlow::Continue
                }
            }
            Annotation::UnknownStackAbove => {
                let code = self.frags.code_mut(frag);
                code.stack.is_checked = true;
                code.stack.is_valid = false;
                self.split_plain(frag, block, pos + 1);
                AnnotationFlow::Stop
            }
            Annotation::UnknownStackBelow => {
                self.frags.code_mut(frag).stack.disallow_forward_propagation = true;
                self.split_plain(frag, block, pos + 1);
                AnnotationFlow::Stop
            }
            Annotation::ReturnAddress => {
                self.frags.code_mut(frag).instrs.push(Instr::Annotation(annotation));
                AnnotationFlow::Continue
            }
            Annotation::FlagSplitHint => {
                self.frags.code_mut(frag).attrs.has_flag_split_hint = true;
                AnnotationFlow::Continue
            }
            Annotation::EndBlock => {
                self.split_plain(frag, block, pos + 1);
                AnnotationFlow::Stop
            }
        }
    }

    fn split_plain(&mut self, frag: FragId, block: BlockId, pos: usize) {
        let meta = self.frags.code(frag).attrs.block_meta.clone();
        let succ = self.make_empty_label_frag(meta);
        self.set_fall_through(frag, succ);
        self.extend(succ, block, pos);
    }

    fn split_with_stack(&mut self, frag: FragId, block: BlockId, pos: usize, stack_is_valid: bool) {
        let meta = self.frags.code(frag).attrs.block_meta.clone();
        let succ = self.make_empty_label_frag(meta);
        self.frags.code_mut(succ).stack = StackStatus {
            is_checked: true,
            is_valid: stack_is_valid,
            disallow_forward_propagation: false,
        };
        self.set_fall_through(frag, succ);
        self.extend(succ, block, pos);
    }

    /// Isolate an interrupt-state-changing instruction in its own,
    /// partition-pinned fragment.
    fn split_at_interrupt_change(
        &mut self,
        frag: FragId,
        block: BlockId,
        pos: usize,
        native: Instruction,
    ) {
        let mut frag = frag;
        if self.frags.code(frag).attrs.has_native_instrs {
            let meta = self.frags.code(frag).attrs.block_meta.clone();
            let succ = self.make_empty_label_frag(meta);
            self.set_fall_through(frag, succ);
            frag = succ;
        }
        self.frags.code_mut(frag).attrs.can_add_to_partition = false;
        let frag = self.append_native(frag, native);
        self.split_plain(frag, block, pos + 1);
    }

    // ---- appending with flag-classification splits ----

    /// Whether appending this instruction converts the fragment into
    /// application code. Control transfers that go through edge code are
    /// excluded so flag save/restore can span from the fragment into the
    /// edge.
    fn instr_makes_frag_app(&self, native: &Instruction) -> bool {
        if !native.is_app {
            return false;
        }
        match native.category {
            Category::IndirectCall | Category::IndirectJump => return false,
            Category::Ret => {
                // Specialised returns use edge code; unspecialised returns
                // are identity-translated and stay application code.
                if let Some(Target::Block(block)) = native.target() {
                    if matches!(self.trace.block(block), Block::Return(ret) if ret.meta.is_some()) {
                        return false;
                    }
                }
            }
            _ => {}
        }
        native.writes_sp || native.reads_flags() || native.writes_flags()
    }

    /// Append one native instruction, splitting first when mixing it in
    /// would break the fragment's flag classification.
    fn append_native(&mut self, frag: FragId, native: Instruction) -> FragId {
        let modifies_flags = native.writes_flags();
        let makes_app = self.instr_makes_frag_app(&native);

        let mut frag = frag;
        let code = self.frags.code(frag);
        let mut split = false;
        if code.attrs.is_app_code {
            // Instrumentation flag-write landing in an application
            // fragment.
            if modifies_flags && !makes_app {
                split = true;
            }
        } else if makes_app {
            // Application instruction landing in an instrumentation
            // fragment that already modified the flags.
            if code.attrs.modifies_flags {
                split = true;
            }
        } else if code.attrs.has_flag_split_hint && modifies_flags {
            if !code.attrs.modifies_flags {
                self.frags.code_mut(frag).attrs.is_app_code = true;
            }
            split = true;
        }

        if split {
            let meta = self.frags.code(frag).attrs.block_meta.clone();
            let succ = self.make_empty_label_frag(meta);
            self.set_fall_through(frag, succ);
            frag = succ;
        }

        let code = self.frags.code_mut(frag);
        code.attrs.has_native_instrs = true;
        if makes_app {
            code.attrs.is_app_code = true;
        }
        if modifies_flags {
            code.attrs.modifies_flags = true;
        }
        code.instrs.push(Instr::Native(Box::new(native)));
        frag
    }

    // ---- label and local-branch splits ----

    fn split_at_label(&mut self, frag: FragId, block: BlockId, pos: usize, label: LabelId) {
        if let Some(&existing) = self.label_frag.get(&label) {
            // Already seeded by an earlier branch: that fragment owns the
            // label and has consumed its tail. Link and stop.
            self.take_slot(block, pos);
            self.set_fall_through(frag, existing);
            return;
        }

        let block_meta = match self.trace.block(block) {
            Block::Decoded(decoded) => Some(decoded.meta.clone()),
            _ => None,
        };
        let code = self.frags.code(frag);
        let same_meta = match (&code.attrs.block_meta, &block_meta) {
            (Some(a), Some(b)) => MetaRef::ptr_eq(a, b),
            (None, _) => true,
            _ => false,
        };

        if code.attrs.has_native_instrs || (code.attrs.is_block_head && !same_meta) {
            // New successor fragment owning the label.
            self.take_slot(block, pos);
            let mut succ_code = CodeFragment::new();
            succ_code.attrs.block_meta = block_meta;
            succ_code.instrs.push(Instr::Label(label));
            let succ = self.append_code(succ_code);
            self.label_frag.insert(label, succ);
            self.set_fall_through(frag, succ);
            self.extend(succ, block, pos + 1);
        } else {
            // Extend the current fragment in place.
            self.take_slot(block, pos);
            let code = self.frags.code_mut(frag);
            code.attrs.block_meta = block_meta;
            code.instrs.push(Instr::Label(label));
            self.label_frag.insert(label, frag);
            self.extend(frag, block, pos + 1);
        }
    }

    /// Fragment owning `label`, seeding (and eagerly extending) it when it
    /// has not been reached yet.
    fn get_or_make_label_frag(&mut self, block: BlockId, label: LabelId) -> FragId {
        if let Some(&frag) = self.label_frag.get(&label) {
            return frag;
        }
        let (label_block, label_position) =
            *self.label_pos.get(&label).expect("local branch targets a known label");
        debug_assert_eq!(label_block, block);
        self.take_slot(block, label_position);
        let block_meta = match self.trace.block(block) {
            Block::Decoded(decoded) => Some(decoded.meta.clone()),
            _ => None,
        };
        let mut code = CodeFragment::new();
        code.attrs.block_meta = block_meta;
        code.instrs.push(Instr::Label(label));
        let frag = self.append_code(code);
        self.label_frag.insert(label, frag);
        self.extend(frag, block, label_position + 1);
        frag
    }

    fn split_at_branch(&mut self, frag: FragId, block: BlockId, pos: usize, branch: Instruction) {
        let label = match branch.target() {
            Some(Target::Label(label)) => label,
            other => unreachable!("local branch without label target: {other:?}"),
        };

        if branch.class == OpClass::Jcc {
            let frag = self.append_native(frag, branch);
            {
                let code = self.frags.code_mut(frag);
                code.branch_instr = Some(code.instrs.len() - 1);
            }
            let meta = self.frags.code(frag).attrs.block_meta.clone();
            let succ = self.make_empty_label_frag(meta);
            self.set_fall_through(frag, succ);
            self.extend(succ, block, pos + 1);
            let target = self.get_or_make_label_frag(block, label);
            self.set_branch(frag, target);
            return;
        }

        // Unconditional local jump.
        if self.frags.code(frag).attrs.has_native_instrs || self.label_frag.contains_key(&label) {
            let target = self.get_or_make_label_frag(block, label);
            self.set_fall_through(frag, target);
        } else {
            // Convert the empty fragment into the target fragment.
            let (label_block, label_position) =
                *self.label_pos.get(&label).expect("local branch targets a known label");
            debug_assert_eq!(label_block, block);
            self.take_slot(block, label_position);
            let code = self.frags.code_mut(frag);
            code.instrs.push(Instr::Label(label));
            self.label_frag.insert(label, frag);
            self.extend(frag, block, label_position + 1);
        }
    }

    // ---- non-local control flow ----

    fn split_at_cfi(&mut self, frag: FragId, block: BlockId, pos: usize, cfi: Instruction) {
        let target_block = match cfi.target() {
            Some(Target::Block(id)) => id,
            other => unreachable!("non-local CFI without block target: {other:?}"),
        };

        enum Resolved {
            Code(FragId),
            Exit { frag: FragId, direct_edge: bool },
            Indirect,
            IdentityReturn,
        }

        let resolved = match self.trace.block(target_block) {
            Block::Decoded(_) | Block::Compensation(_) => {
                Resolved::Code(self.fragment_for_block(target_block))
            }
            Block::Native(_) | Block::Cached(_) => {
                Resolved::Exit { frag: self.fragment_for_block(target_block), direct_edge: false }
            }
            Block::DirectFuture(_) => {
                let frag = self.fragment_for_block(target_block);
                let direct_edge = matches!(
                    self.frags.node(frag).fragment.as_exit(),
                    Some(exit) if exit.kind == ExitKind::FutureBlockDirect
                );
                Resolved::Exit { frag, direct_edge }
            }
            Block::IndirectFuture(_) => Resolved::Indirect,
            Block::Return(ret) => {
                if ret.meta.is_some() {
                    Resolved::Indirect
                } else {
                    Resolved::IdentityReturn
                }
            }
        };

        match resolved {
            Resolved::Code(target) => {
                if cfi.category == Category::DirectJump {
                    // Direct jump to translated code: no instruction
                    // needed; the connecting-jump pass materialises one if
                    // layout demands.
                    self.set_fall_through(frag, target);
                    return;
                }
                if cfi.category == Category::DirectCall {
                    self.mangled_direct_call(frag, block, pos, cfi, target, false);
                    return;
                }
                // Conditional jump into translated code (e.g. a loop
                // back-edge): the CFI sits in a fragment of its own.
                let frag = self.append_cfi(frag, cfi, false, false);
                self.set_branch(frag, target);
                self.fall_through_after_cfi(frag, block, pos);
            }
            Resolved::Exit { frag: target, direct_edge } => {
                match cfi.category {
                    Category::DirectCall => {
                        self.mangled_direct_call(frag, block, pos, cfi, target, direct_edge);
                    }
                    Category::DirectJump => {
                        let frag = self.append_cfi(frag, cfi, direct_edge, false);
                        self.set_branch(frag, target);
                        // No fall-through.
                    }
                    Category::ConditionalJump => {
                        let frag = self.append_cfi(frag, cfi, direct_edge, false);
                        self.set_branch(frag, target);
                        self.fall_through_after_cfi(frag, block, pos);
                    }
                    other => unreachable!("unexpected CFI category {other:?}"),
                }
            }
            Resolved::Indirect => {
                self.indirect_transfer(frag, block, pos, cfi, target_block);
            }
            Resolved::IdentityReturn => {
                // Unspecialised return: identity translation, no edge
                // code, no successors.
                let frag = self.append_cfi(frag, cfi, false, false);
                let _ = frag;
            }
        }
    }

    /// Append a CFI, isolating it in its own fragment unless it may share
    /// its predecessor's partition or the predecessor is still empty.
    fn append_cfi(
        &mut self,
        frag: FragId,
        cfi: Instruction,
        targets_edge_code: bool,
        can_add_to_partition: bool,
    ) -> FragId {
        let makes_stack_valid = matches!(cfi.class, OpClass::Call | OpClass::Ret);
        let force_add = !self.frags.code(frag).attrs.has_native_instrs;

        let mut frag = frag;
        if !can_add_to_partition && !force_add {
            let meta = self.frags.code(frag).attrs.block_meta.clone();
            let succ = self.make_empty_label_frag(meta);
            self.set_fall_through(frag, succ);
            frag = succ;
        }

        let frag = self.append_native(frag, cfi);
        let code = self.frags.code_mut(frag);
        if makes_stack_valid {
            code.stack.is_checked = true;
            code.stack.is_valid = true;
        }
        code.attrs.can_add_to_partition = can_add_to_partition;
        if targets_edge_code {
            code.attrs.branches_to_edge_code = true;
        }
        code.branch_instr = Some(code.instrs.len() - 1);
        frag
    }

    /// The post-CFI fall-through fragment (for calls and conditional
    /// jumps), which must not join the CFI's partition.
    fn fall_through_after_cfi(&mut self, frag: FragId, block: BlockId, pos: usize) -> FragId {
        let meta = self.frags.code(frag).attrs.block_meta.clone();
        let succ = self.make_empty_label_frag(meta);
        self.frags.code_mut(succ).attrs.can_add_to_partition = false;
        self.set_fall_through(frag, succ);
        self.extend(succ, block, pos + 1);
        succ
    }

    /// Lower a direct call into push-of-return-address plus jump, so the
    /// pushed return address is a cache address independent of fragment
    /// layout.
    fn mangled_direct_call(
        &mut self,
        frag: FragId,
        block: BlockId,
        pos: usize,
        cfi: Instruction,
        target: FragId,
        targets_direct_edge: bool,
    ) {
        // Fall-through continuation first; its head label is the return
        // address.
        let meta = self.frags.code(frag).attrs.block_meta.clone();
        let ret_frag = self.make_empty_label_frag(meta.clone());
        self.frags.code_mut(ret_frag).attrs.can_add_to_partition = false;
        let ret_label = self.head_label(ret_frag);

        let v_ra = self.trace.alloc_virt_reg();
        let mut frag = frag;
        self.frags.code_mut(frag).instrs.push(Instr::Annotation(Annotation::ReturnAddress));
        frag = self.append_native(frag, Instruction::mov_label_addr(v_ra, ret_label));
        frag = self.append_native(frag, Instruction::push_reg(v_ra));

        let mut jump = Instruction::jmp_block(BlockId(0));
        jump.set_target(cfi.target().expect("direct call target"));
        let frag = self.append_cfi(frag, jump, targets_direct_edge, false);
        // The call discipline: the stack now looks like a C-style call
        // stack.
        {
            let code = self.frags.code_mut(frag);
            code.stack.is_checked = true;
            code.stack.is_valid = true;
        }
        self.set_branch(frag, target);
        self.set_fall_through(frag, ret_frag);
        self.extend(ret_frag, block, pos + 1);
    }

    /// Lower an indirect transfer (call/jump through a register or memory,
    /// or a specialised return) into target materialisation plus the
    /// four-fragment indirect-edge machinery.
    fn indirect_transfer(
        &mut self,
        frag: FragId,
        block: BlockId,
        pos: usize,
        cfi: Instruction,
        target_block: BlockId,
    ) {
        let dest_meta = match self.trace.block(target_block).meta() {
            Some(meta) => meta.clone(),
            None => unreachable!("indirect future without metadata"),
        };

        let edge = match self.edges.allocate_indirect_edge(dest_meta.clone()) {
            Ok(edge) => edge,
            Err(error) => {
                // Leave the cache and re-run the transfer natively.
                let native_pc = cfi.decoded_pc.unwrap_or_default();
                tracing::warn!(%error, native_pc, "indirect edge allocation failed; exiting natively");
                let exit = self.append_exit(ExitFragment {
                    kind: ExitKind::Native,
                    target_pc: native_pc,
                    block_meta: None,
                    direct_edge: None,
                    indirect_edge: None,
                });
                self.set_fall_through(frag, exit);
                return;
            }
        };

        let is_call = cfi.category == Category::IndirectCall;
        let is_ret = cfi.category == Category::Ret;
        let meta = self.frags.code(frag).attrs.block_meta.clone();

        // Return-address discipline for calls.
        let ret_frag = if is_call {
            let ret_frag = self.make_empty_label_frag(meta.clone());
            self.frags.code_mut(ret_frag).attrs.can_add_to_partition = false;
            Some(ret_frag)
        } else {
            None
        };

        // Materialise the runtime target into a virtual register.
        let v_target = self.trace.alloc_virt_reg();
        let mut frag = frag;
        if let Some(ret_frag) = ret_frag {
            let ret_label = self.head_label(ret_frag);
            let v_ra = self.trace.alloc_virt_reg();
            self.frags.code_mut(frag).instrs.push(Instr::Annotation(Annotation::ReturnAddress));
            frag = self.append_native(frag, Instruction::mov_label_addr(v_ra, ret_label));
            frag = self.append_native(frag, Instruction::push_reg(v_ra));
        }
        if is_ret {
            frag = self.append_native(frag, Instruction::pop_reg(v_target));
            // `ret imm16` releases callee-popped arguments.
            if let Some(OperandKind::Imm(imm)) = cfi.explicit_ops().first().map(|op| op.kind) {
                frag = self.append_native(
                    frag,
                    Instruction::lea(
                        VirtReg::Native(grist_x86::Gpr::Rsp),
                        MemOperand::Compound {
                            base: Some(VirtReg::Native(grist_x86::Gpr::Rsp)),
                            index: None,
                            disp: imm as i32,
                        },
                    ),
                );
            }
        } else {
            let target_op = cfi.explicit_ops().first().expect("indirect CFI operand");
            frag = match target_op.kind {
                OperandKind::Reg(reg) => self.append_native(frag, Instruction::mov_rr(v_target, reg)),
                OperandKind::Mem(mem) => self.append_native(frag, Instruction::mov_rm(v_target, mem)),
                other => unreachable!("indirect CFI through {other:?}"),
            };
        }

        // The jump into in-edge code; it may share the predecessor's
        // partition so virtual registers span the boundary.
        let (in_edge, hit, miss, exit) = self.build_indirect_frags(&edge, v_target, dest_meta, frag);
        let in_label = self.head_label(in_edge);
        let jump = Instruction::jmp_label(in_label);
        let frag = self.append_cfi(frag, jump, true, true);
        if is_call || is_ret {
            let code = self.frags.code_mut(frag);
            code.stack.is_checked = true;
            code.stack.is_valid = true;
        }
        self.set_branch(frag, in_edge);
        self.frags.union_partitions(frag, in_edge);
        self.frags.union_partitions(in_edge, miss);
        self.frags.union_partitions(in_edge, hit);
        let _ = exit;

        if let Some(ret_frag) = ret_frag {
            self.set_fall_through(frag, ret_frag);
            self.extend(ret_frag, block, pos + 1);
        }
    }

    /// The in / out-miss / out-hit / exit fragments of one indirect edge:
    ///
    /// - in: inline table probe, branching to out-hit on a key match;
    /// - out-miss: park the target in the dispatch register and enter the
    ///   miss stub (which re-dispatches after translation);
    /// - out-hit: jump through the bucket's cache PC;
    /// - exit: the encoded miss-stub reference.
    fn build_indirect_frags(
        &mut self,
        edge: &std::sync::Arc<crate::edge::IndirectEdge>,
        v_target: VirtReg,
        dest_meta: MetaRef,
        pred: FragId,
    ) -> (FragId, FragId, FragId, FragId) {
        let pred_stack = self.frags.code(pred).stack;

        let edge_frag = |builder: &mut Self, is_in_edge: bool| {
            let frag = builder.make_empty_label_frag(Some(dest_meta.clone()));
            let code = builder.frags.code_mut(frag);
            code.attrs.is_in_edge_code = is_in_edge;
            code.attrs.has_native_instrs = true;
            code.attrs.can_add_to_partition = true;
            code.stack.is_checked = pred_stack.is_checked;
            code.stack.is_valid = pred_stack.is_valid;
            frag
        };

        let in_edge = edge_frag(self, true);
        let miss = edge_frag(self, false);
        let hit = edge_frag(self, false);

        let exit = self.append_exit(ExitFragment {
            kind: ExitKind::FutureBlockIndirect,
            target_pc: edge.miss_stub,
            block_meta: Some(dest_meta),
            direct_edge: None,
            indirect_edge: Some(edge.clone()),
        });

        // in: bucket = table + (target & mask) * 16; probe the key.
        let v_index = self.trace.alloc_virt_reg();
        let v_entry = self.trace.alloc_virt_reg();
        let hit_label = self.head_label(hit);
        {
            let mask = edge.bucket_mask() as i64;
            let table = edge.table_base() as i64;
            let push = |builder: &mut Self, instruction: Instruction| {
                builder.frags.code_mut(in_edge).instrs.push(Instr::Native(Box::new(instruction)));
            };
            push(self, Instruction::mov_rr(v_index, v_target));
            push(self, Instruction::and_ri(v_index, mask));
            push(self, Instruction::mov_ri(v_entry, table));
            push(
                self,
                Instruction::lea(
                    v_entry,
                    MemOperand::Compound { base: Some(v_entry), index: Some((v_index, 8)), disp: 0 },
                ),
            );
            push(
                self,
                Instruction::lea(
                    v_entry,
                    MemOperand::Compound { base: Some(v_entry), index: Some((v_index, 8)), disp: 0 },
                ),
            );
            push(
                self,
                Instruction::cmp_rm(v_target, MemOperand::Indirect { base: v_entry }),
            );
            push(self, Instruction::jcc_label(grist_x86::Cc::E, hit_label));
            let code = self.frags.code_mut(in_edge);
            code.attrs.modifies_flags = true;
            code.branch_instr = Some(code.instrs.len() - 1);
        }
        self.set_fall_through(in_edge, miss);
        self.set_branch(in_edge, hit);

        // out-miss: reserve the stub's result slot, preserve the dispatch
        // register's application value, and enter the stub.
        {
            let rsp = VirtReg::Native(grist_x86::Gpr::Rsp);
            let code = self.frags.code_mut(miss);
            code.instrs.push(Instr::Native(Box::new(Instruction::lea(
                rsp,
                MemOperand::Compound { base: Some(rsp), index: None, disp: -8 },
            ))));
            code.instrs.push(Instr::Native(Box::new(Instruction::push_reg(VirtReg::Native(
                INDIRECT_TARGET_REG,
            )))));
            code.instrs.push(Instr::Native(Box::new(Instruction::mov_rr(
                VirtReg::Native(INDIRECT_TARGET_REG),
                v_target,
            ))));
            code.instrs.push(Instr::Native(Box::new(Instruction::jmp_cache(edge.miss_stub))));
            code.branch_instr = Some(code.instrs.len() - 1);
        }
        self.set_branch(miss, hit);

        // out-hit: dispatch through the bucket's value slot. Push-then-ret
        // (rather than an indirect jmp) so register restores can sit
        // between the bucket read and the transfer.
        {
            let code = self.frags.code_mut(hit);
            code.instrs.push(Instr::Native(Box::new(Instruction::push_mem(MemOperand::Compound {
                base: Some(v_entry),
                index: None,
                disp: 8,
            }))));
            let mut dispatch = Instruction::synthesised(OpClass::Ret, 64);
            dispatch.category = Category::Ret;
            code.instrs.push(Instr::Native(Box::new(dispatch)));
            code.branch_instr = Some(code.instrs.len() - 1);
        }
        self.set_fall_through(hit, exit);
        self.set_branch(hit, miss);

        (in_edge, hit, miss, exit)
    }
}

enum AnnotationFlow {
    Continue,
    Stop,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::cache::{CacheError, CodeCache};
    use crate::edge::{emit_direct_edge, emit_indirect_edge, DirectEdge, IndirectEdge};
    use crate::ir::Action;
    use crate::meta::MetaRegistry;
    use crate::trace::{DecodedBlock, FutureBlock, ReturnBlock};

    unsafe extern "C" fn nop_direct(_edge: *const DirectEdge) {}
    unsafe extern "C" fn nop_indirect(_edge: *const IndirectEdge, _pc: u64) -> u64 {
        0
    }

    struct TestEdges {
        cache: CodeCache,
    }

    impl TestEdges {
        fn new() -> TestEdges {
            TestEdges { cache: CodeCache::new(1) }
        }
    }

    impl EdgeHost for TestEdges {
        fn allocate_direct_edge(
            &self,
            source_meta: Option<MetaRef>,
            dest_meta: MetaRef,
        ) -> Result<Arc<DirectEdge>, CacheError> {
            emit_direct_edge(&self.cache, source_meta, dest_meta, nop_direct, 0, 16)
        }

        fn allocate_indirect_edge(&self, template: MetaRef) -> Result<Arc<IndirectEdge>, CacheError> {
            emit_indirect_edge(&self.cache, template, nop_indirect, 0, 8)
        }
    }

    fn decoded_block(trace: &mut Trace, registry: &MetaRegistry, pc: u64, instrs: Vec<Instr>) -> BlockId {
        let meta = MetaRef::new(registry.new_meta(pc));
        trace.add_block(Block::Decoded(DecodedBlock { start_pc: pc, meta, instrs, generation: 0 }))
    }

    /// Every code fragment either has no flag-writing instructions, or all
    /// of its flag writers share one app/instrumentation classification.
    fn assert_flag_classification(frags: &FragmentList) {
        for id in frags.ids() {
            let Some(code) = frags.node(id).fragment.as_code() else { continue };
            let mut app_writes = 0;
            let mut inst_writes = 0;
            for instr in &code.instrs {
                if let Some(native) = instr.as_native() {
                    if native.writes_flags() {
                        if native.is_app {
                            app_writes += 1;
                        } else {
                            inst_writes += 1;
                        }
                    }
                }
            }
            assert!(
                app_writes == 0 || inst_writes == 0,
                "fragment {id:?} mixes app and instrumentation flag writers"
            );
        }
    }

    #[test]
    fn test_straight_line_identity_return() {
        let registry = MetaRegistry::new();
        let edges = TestEdges::new();

        // add rax, rbx ; ret (identity translation).
        let mut trace = Trace::new();
        let block = decoded_block(&mut trace, &registry, 0x1000, vec![Instr::Annotation(Annotation::BlockBegin)]);
        let ret_block = trace.add_block(Block::Return(ReturnBlock { meta: None }));
        let mut add = Instruction::cmp_rr(VirtReg::Native(grist_x86::Gpr::Rax), VirtReg::Native(grist_x86::Gpr::Rbx));
        add.class = OpClass::Add;
        add.is_app = true;
        let mut ret = Instruction::synthesised(OpClass::Ret, 64);
        ret.category = Category::Ret;
        ret.is_app = true;
        ret.push_implicit(crate::ir::Operand::explicit(
            OperandKind::BranchTarget(Target::Block(ret_block)),
            64,
            Action::Read,
        ));
        if let Block::Decoded(decoded) = trace.block_mut(block) {
            decoded.instrs.push(Instr::Native(Box::new(add)));
            decoded.instrs.push(Instr::Native(Box::new(ret)));
        }

        let frags = FragmentBuilder::new(&mut trace, &edges).build();
        assert_flag_classification(&frags);

        // Head fragment: block head, app code, and the ret has no
        // successors.
        let head = frags.node(FragId(0));
        let head_code = head.fragment.as_code().unwrap();
        assert!(head_code.attrs.is_block_head);
        assert!(head_code.attrs.is_app_code);
        assert!(head_code.attrs.modifies_flags);
        // Identity return: stack became valid, no successors, branch set.
        let last = frags
            .ids()
            .filter(|id| frags.node(*id).fragment.as_code().is_some())
            .last()
            .unwrap();
        let last_node = frags.node(last);
        let last_code = last_node.fragment.as_code().unwrap();
        assert!(last_code.stack.is_valid);
        assert!(last_code.branch_instr.is_some());
        assert_eq!(last_node.successors, [None, None]);
    }

    #[test]
    fn test_instrumentation_flag_write_splits_app_fragment() {
        let registry = MetaRegistry::new();
        let edges = TestEdges::new();
        let mut trace = Trace::new();

        let block = decoded_block(&mut trace, &registry, 0x2000, vec![Instr::Annotation(Annotation::BlockBegin)]);
        let ret_block = trace.add_block(Block::Return(ReturnBlock { meta: None }));

        // App flag writer, then an instrumentation flag writer, then ret.
        let mut app_add = Instruction::and_ri(VirtReg::Native(grist_x86::Gpr::Rax), 1);
        app_add.is_app = true;
        app_add.decoded_pc = Some(0x2000);
        let inst_add = Instruction::and_ri(VirtReg::Virt(0), 0xFF); // is_app = false
        let mut ret = Instruction::synthesised(OpClass::Ret, 64);
        ret.category = Category::Ret;
        ret.is_app = true;
        ret.push_implicit(crate::ir::Operand::explicit(
            OperandKind::BranchTarget(Target::Block(ret_block)),
            64,
            Action::Read,
        ));
        if let Block::Decoded(decoded) = trace.block_mut(block) {
            decoded.instrs.push(Instr::Native(Box::new(app_add)));
            decoded.instrs.push(Instr::Native(Box::new(inst_add)));
            decoded.instrs.push(Instr::Native(Box::new(ret)));
        }

        let frags = FragmentBuilder::new(&mut trace, &edges).build();
        assert_flag_classification(&frags);
        // The instrumentation flag write forced a split: more than one
        // code fragment with native instructions.
        let native_frags = frags
            .ids()
            .filter(|id| {
                frags
                    .node(*id)
                    .fragment
                    .as_code()
                    .is_some_and(|code| code.attrs.has_native_instrs)
            })
            .count();
        assert!(native_frags >= 2, "expected a classification split");
    }

    #[test]
    fn test_direct_future_becomes_edge_exit() {
        let registry = MetaRegistry::new();
        let edges = TestEdges::new();
        let mut trace = Trace::new();

        let block = decoded_block(&mut trace, &registry, 0x3000, vec![Instr::Annotation(Annotation::BlockBegin)]);
        let future = trace.add_block(Block::DirectFuture(FutureBlock {
            start_pc: 0x4000,
            meta: MetaRef::new(registry.new_meta(0x4000)),
        }));
        let mut jmp = Instruction::jmp_block(future);
        jmp.decoded_pc = Some(0x3000);
        if let Block::Decoded(decoded) = trace.block_mut(block) {
            decoded.instrs.push(Instr::Native(Box::new(jmp)));
        }

        let frags = FragmentBuilder::new(&mut trace, &edges).build();
        let exits: Vec<_> = frags
            .ids()
            .filter_map(|id| frags.node(id).fragment.as_exit())
            .collect();
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].kind, ExitKind::FutureBlockDirect);
        assert!(exits[0].direct_edge.is_some());
        // The branching fragment records that it targets edge code.
        let brancher = frags
            .ids()
            .find(|id| {
                frags
                    .node(*id)
                    .fragment
                    .as_code()
                    .is_some_and(|code| code.attrs.branches_to_edge_code)
            })
            .expect("a fragment branches to edge code");
        let _ = brancher;
    }

    #[test]
    fn test_indirect_call_topology() {
        let registry = MetaRegistry::new();
        let edges = TestEdges::new();
        let mut trace = Trace::new();

        let block = decoded_block(&mut trace, &registry, 0x5000, vec![Instr::Annotation(Annotation::BlockBegin)]);
        let indirect = trace.add_block(Block::IndirectFuture(FutureBlock {
            start_pc: 0,
            meta: MetaRef::new(registry.new_meta(0)),
        }));

        // call rax, lifted shape.
        let mut call = Instruction::synthesised(OpClass::Call, 64);
        call.category = Category::IndirectCall;
        call.is_app = true;
        call.decoded_pc = Some(0x5000);
        call.push_explicit(crate::ir::Operand::reg(VirtReg::Native(grist_x86::Gpr::Rax), Action::Read));
        call.push_implicit(crate::ir::Operand::explicit(
            OperandKind::BranchTarget(Target::Block(indirect)),
            64,
            Action::Read,
        ));
        let ret_block = trace.add_block(Block::Return(ReturnBlock { meta: None }));
        let mut ret = Instruction::synthesised(OpClass::Ret, 64);
        ret.category = Category::Ret;
        ret.is_app = true;
        ret.push_implicit(crate::ir::Operand::explicit(
            OperandKind::BranchTarget(Target::Block(ret_block)),
            64,
            Action::Read,
        ));
        if let Block::Decoded(decoded) = trace.block_mut(block) {
            decoded.instrs.push(Instr::Native(Box::new(call)));
            decoded.instrs.push(Instr::Native(Box::new(ret)));
        }

        let mut builder = FragmentBuilder::new(&mut trace, &edges);
        let entry = builder.trace.entry();
        builder.fragment_for_block(entry);
        let mut frags = builder.frags;

        // Find the in-edge fragment and verify the four-fragment topology.
        let in_edge = frags
            .ids()
            .find(|id| {
                frags
                    .node(*id)
                    .fragment
                    .as_code()
                    .is_some_and(|code| code.attrs.is_in_edge_code)
            })
            .expect("in-edge fragment");
        let [ft, br] = frags.node(in_edge).successors;
        let (miss, hit) = (ft.unwrap(), br.unwrap());

        // hit → {fall-through: exit, branch: miss}
        let hit_succ = frags.node(hit).successors;
        let exit = hit_succ[SUCC_FALL_THROUGH].unwrap();
        assert_eq!(hit_succ[SUCC_BRANCH], Some(miss));
        assert_eq!(
            frags.node(exit).fragment.as_exit().unwrap().kind,
            ExitKind::FutureBlockIndirect
        );

        // miss → {branch: hit}
        assert_eq!(frags.node(miss).successors[SUCC_BRANCH], Some(hit));

        // The in-edge shares a partition with the fragment that branches
        // to it, so virtual registers live across the boundary.
        let brancher = frags
            .ids()
            .find(|id| frags.node(*id).successors[SUCC_BRANCH] == Some(in_edge))
            .expect("branch into in-edge");
        assert_eq!(frags.partition(brancher), frags.partition(in_edge));
        assert_eq!(frags.partition(in_edge), frags.partition(hit));
        assert_eq!(frags.partition(in_edge), frags.partition(miss));

        assert_flag_classification(&frags);
    }

    #[test]
    fn test_stack_annotation_splits() {
        let registry = MetaRegistry::new();
        let edges = TestEdges::new();
        let mut trace = Trace::new();

        let block = decoded_block(&mut trace, &registry, 0x6000, vec![Instr::Annotation(Annotation::BlockBegin)]);
        let ret_block = trace.add_block(Block::Return(ReturnBlock { meta: None }));

        let mut mov = Instruction::mov_rr(VirtReg::Native(grist_x86::Gpr::Rax), VirtReg::Native(grist_x86::Gpr::Rbx));
        mov.is_app = true;
        let mut ret = Instruction::synthesised(OpClass::Ret, 64);
        ret.category = Category::Ret;
        ret.is_app = true;
        ret.push_implicit(crate::ir::Operand::explicit(
            OperandKind::BranchTarget(Target::Block(ret_block)),
            64,
            Action::Read,
        ));
        if let Block::Decoded(decoded) = trace.block_mut(block) {
            decoded.instrs.push(Instr::Annotation(Annotation::UndefinedStack));
            decoded.instrs.push(Instr::Native(Box::new(mov)));
            decoded.instrs.push(Instr::Annotation(Annotation::ValidStack));
            decoded.instrs.push(Instr::Native(Box::new(ret)));
        }

        let frags = FragmentBuilder::new(&mut trace, &edges).build();

        // The head fragment absorbed the first annotation (no native
        // instructions yet) and is marked invalid.
        let head = frags.node(FragId(0)).fragment.as_code().unwrap();
        assert!(head.stack.is_checked);
        assert!(!head.stack.is_valid);
        // The later ValidStack annotation forced a split into a
        // valid-stack fragment.
        let valid_frag = frags.ids().filter_map(|id| frags.node(id).fragment.as_code()).any(|code| {
            code.stack.is_checked && code.stack.is_valid
        });
        assert!(valid_frag, "expected a stack-validity split");
    }
}
