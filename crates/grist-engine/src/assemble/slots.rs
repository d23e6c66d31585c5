//! Slot allocation
//!
//! Rewrites every slot-register operand into a concrete memory reference.
//! A fragment whose stack is checked-valid and which never moves the
//! stack pointer gets red-zone slots below RSP; every other fragment gets
//! thread-private slots addressed through the GS segment (the host points
//! the segment base at the thread's slot table).

use grist_x86::{Gpr, Seg};

use crate::assemble::{AssembleError, SlotAlloc};
use crate::fragment::FragmentList;
use crate::ir::{MemOperand, OperandKind, VirtReg};

/// Byte offset of slot `i` within the thread-private slot table.
pub fn thread_slot_offset(slot: u16) -> i32 {
    8 * slot as i32
}

/// Red-zone offset of slot `i` from the stack pointer.
pub fn stack_slot_offset(slot: u16) -> i32 {
    -8 * (slot as i32 + 1)
}

/// Map slot indices to stack or thread-private storage.
pub fn allocate_slots(frags: &mut FragmentList, slots: &SlotAlloc) -> Result<(), AssembleError> {
    for id in frags.ids().collect::<Vec<_>>() {
        let Some(code) = frags.node_mut(id).fragment.as_code_mut() else { continue };

        let moves_sp = code.instrs.iter().any(|instr| {
            instr.as_native().is_some_and(|native| {
                native.writes_sp
                    || native.operands.first().is_some_and(|op| {
                        op.action.writes() && op.as_reg() == Some(VirtReg::Native(Gpr::Rsp))
                    })
            })
        });
        let use_stack = code.stack.is_checked && code.stack.is_valid && !moves_sp;

        for instr in &mut code.instrs {
            let Some(native) = instr.as_native_mut() else { continue };
            for op in &mut native.operands {
                let OperandKind::Reg(VirtReg::Slot(slot)) = op.kind else { continue };
                if slot >= slots.limit() {
                    return Err(AssembleError::SlotExhaustion(slots.limit()));
                }
                op.kind = if use_stack {
                    OperandKind::Mem(MemOperand::Compound {
                        base: Some(VirtReg::Native(Gpr::Rsp)),
                        index: None,
                        disp: stack_slot_offset(slot),
                    })
                } else {
                    OperandKind::Mem(MemOperand::Segmented {
                        seg: Seg::Gs,
                        base: None,
                        disp: thread_slot_offset(slot),
                    })
                };
            }
        }
    }
    Ok(())
}
