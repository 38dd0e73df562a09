//! Decode unit.
//!
//! Unpacks fetched macro-ops into a micro-op stream for rename. Decode also
//! catches the case where the predictor marked a non-branch as taken (a
//! stale target-buffer alias): the instruction itself is kept, everything
//! younger is dropped, and fetch is redirected to the fall-through address.

use std::collections::VecDeque;

use crate::isa::{InsnRef, MacroOp};
use crate::pipeline::buffer::PipelineBuffer;

/// The decode unit.
pub struct DecodeUnit {
    micro_ops: VecDeque<InsnRef>,
    should_flush: bool,
    flush_addr: u64,
    early_flushes: u64,
}

impl DecodeUnit {
    /// Creates a decode unit.
    pub fn new() -> Self {
        Self {
            micro_ops: VecDeque::new(),
            should_flush: false,
            flush_addr: 0,
            early_flushes: 0,
        }
    }

    /// Moves micro-ops from the fetch buffer toward rename.
    pub fn tick(
        &mut self,
        input: &mut PipelineBuffer<MacroOp>,
        output: &mut PipelineBuffer<InsnRef>,
    ) {
        self.should_flush = false;

        if output.is_stalled() {
            input.stall(true);
            return;
        }

        for slot in input.head_slots() {
            if let Some(macro_op) = slot.take() {
                self.micro_ops.extend(macro_op);
            }
        }

        for slot in 0..output.width() {
            if output.tail_slots()[slot].is_some() {
                continue;
            }
            let Some(uop) = self.micro_ops.pop_front() else {
                break;
            };

            let early_flush = {
                let insn = uop.borrow();
                !insn.is_branch && insn.prediction.taken
            };
            output.tail_slots()[slot] = Some(uop.clone());

            if early_flush {
                // Mispredicted non-branch: drop everything younger and
                // re-steer fetch to the fall-through.
                self.should_flush = true;
                self.flush_addr = uop.borrow().address + 4;
                self.early_flushes += 1;
                self.micro_ops.clear();
                break;
            }
        }

        // Back-pressure fetch when the internal queue runs long.
        input.stall(self.micro_ops.len() > 2 * output.width());
    }

    /// Drops buffered micro-ops. Called on flush.
    pub fn purge_flushed(&mut self) {
        self.micro_ops.clear();
        self.should_flush = false;
    }

    /// An early flush was requested this cycle.
    pub fn should_flush(&self) -> bool {
        self.should_flush
    }

    /// Fall-through address to resume from.
    pub fn flush_address(&self) -> u64 {
        self.flush_addr
    }

    /// Early flushes requested so far.
    pub fn early_flushes(&self) -> u64 {
        self.early_flushes
    }
}

impl Default for DecodeUnit {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::{groups, insn_ref, BranchPrediction, Instruction, Opcode};

    fn uop(addr: u64) -> InsnRef {
        insn_ref(Instruction::new(Opcode::Addi, groups::INT_SIMPLE, addr))
    }

    #[test]
    fn test_transfers_micro_ops() {
        let mut decode = DecodeUnit::new();
        let mut input: PipelineBuffer<MacroOp> = PipelineBuffer::new(2);
        let mut output: PipelineBuffer<InsnRef> = PipelineBuffer::new(2);

        input.tail_slots()[0] = Some(vec![uop(0)]);
        input.tail_slots()[1] = Some(vec![uop(4)]);
        input.tick();

        decode.tick(&mut input, &mut output);
        output.tick();
        assert!(output.head_slots()[0].is_some());
        assert!(output.head_slots()[1].is_some());
    }

    #[test]
    fn test_stalled_output_stalls_input() {
        let mut decode = DecodeUnit::new();
        let mut input: PipelineBuffer<MacroOp> = PipelineBuffer::new(1);
        let mut output: PipelineBuffer<InsnRef> = PipelineBuffer::new(1);

        output.stall(true);
        decode.tick(&mut input, &mut output);
        assert!(input.is_stalled());
    }

    #[test]
    fn test_early_flush_on_taken_non_branch() {
        let mut decode = DecodeUnit::new();
        let mut input: PipelineBuffer<MacroOp> = PipelineBuffer::new(2);
        let mut output: PipelineBuffer<InsnRef> = PipelineBuffer::new(2);

        let misattributed = uop(0x100);
        misattributed.borrow_mut().prediction = BranchPrediction {
            taken: true,
            target: 0x40,
        };
        input.tail_slots()[0] = Some(vec![misattributed]);
        input.tail_slots()[1] = Some(vec![uop(0x104)]);
        input.tick();

        decode.tick(&mut input, &mut output);
        assert!(decode.should_flush());
        assert_eq!(decode.flush_address(), 0x104);
        assert_eq!(decode.early_flushes(), 1);

        output.tick();
        // The instruction itself survives; the younger one was dropped.
        assert!(output.head_slots()[0].is_some());
        assert!(output.head_slots()[1].is_none());
    }

    #[test]
    fn test_purge_clears_queue() {
        let mut decode = DecodeUnit::new();
        let mut input: PipelineBuffer<MacroOp> = PipelineBuffer::new(1);
        let mut output: PipelineBuffer<InsnRef> = PipelineBuffer::new(1);

        input.tail_slots()[0] = Some(vec![uop(0), uop(4), uop(8)]);
        input.tick();
        decode.tick(&mut input, &mut output);
        decode.purge_flushed();

        output.fill_empty();
        decode.tick(&mut input, &mut output);
        assert!(output.tail_slots()[0].is_none());
    }
}
