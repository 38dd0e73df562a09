//! Writeback unit.
//!
//! Consumes completion slots, writes results into the physical register
//! file, marks scoreboard entries ready, and notifies the reorder buffer so
//! fully-written macro-ops become commit-ready. A slot whose instruction
//! cannot write back yet (a store-conditional still resolving) is held by
//! stalling that completion buffer, which also back-pressures the load/store
//! queue's delivery into it.

use crate::isa::InsnRef;
use crate::pipeline::buffer::PipelineBuffer;
use crate::pipeline::dispatch::DispatchIssueUnit;
use crate::pipeline::rob::ReorderBuffer;
use crate::regfile::RegisterFileSet;

/// The writeback unit.
pub struct WritebackUnit {
    instructions_written: u64,
}

impl WritebackUnit {
    /// Creates a writeback unit.
    pub fn new() -> Self {
        Self {
            instructions_written: 0,
        }
    }

    /// Processes every completion slot head.
    pub fn tick(
        &mut self,
        completion_slots: &mut [PipelineBuffer<InsnRef>],
        regfile: &mut RegisterFileSet,
        dispatch: &mut DispatchIssueUnit,
        rob: &mut ReorderBuffer,
    ) {
        for slot in completion_slots.iter_mut() {
            let Some(uop) = slot.head_slots()[0].clone() else {
                slot.stall(false);
                continue;
            };

            if uop.borrow().flushed {
                slot.head_slots()[0] = None;
                slot.stall(false);
                continue;
            }

            if !Self::can_writeback(&uop) {
                // Hold the slot; the stall also blocks new deliveries into it.
                slot.stall(true);
                continue;
            }
            slot.stall(false);

            let insn_id = {
                let mut insn = uop.borrow_mut();
                insn.waiting_commit = true;
                insn.instruction_id
            };
            {
                let insn = uop.borrow();
                for (reg, value) in insn.destinations.iter().zip(insn.results.iter()) {
                    regfile.set(*reg, *value);
                    dispatch.set_register_ready(*reg);
                }
            }
            rob.commit_micro_ops(insn_id);

            self.instructions_written += 1;
            slot.head_slots()[0] = None;
        }
    }

    /// An instruction may write back once its results are final.
    ///
    /// A store-conditional passes through twice: once after execution (no
    /// result yet, nothing written) and again after its write requests have
    /// resolved. The second pass is held until the memory interface has
    /// reported the outcome.
    fn can_writeback(uop: &InsnRef) -> bool {
        let insn = uop.borrow();
        !(insn.is_store_cond && insn.waiting_commit && !insn.is_cond_result_ready())
    }

    /// Total instructions written back.
    pub fn instructions_written(&self) -> u64 {
        self.instructions_written
    }
}

impl Default for WritebackUnit {
    fn default() -> Self {
        Self::new()
    }
}
