//! Execution unit.
//!
//! One per issue port. Accepts the instruction at the head of its issue
//! buffer, models execution latency and throughput, and on completion runs
//! the operation: arithmetic forwards its results and heads to writeback,
//! loads hand off to the load/store queue, stores latch their data, and
//! branches resolve against their prediction and report flushes.

use std::collections::VecDeque;

use crate::branch::BranchPredictor;
use crate::isa::{Architecture, InsnRef};
use crate::pipeline::buffer::PipelineBuffer;
use crate::pipeline::dispatch::DispatchIssueUnit;
use crate::pipeline::lsq::LoadStoreQueue;

struct InFlight {
    insn: InsnRef,
    ready_at: u64,
}

/// A single execution pipe.
pub struct ExecutionUnit {
    pipeline: VecDeque<InFlight>,
    pipelined: bool,
    blocking_groups: Vec<u16>,
    /// No new instruction is accepted before this tick.
    stall_until: u64,
    ticks: u64,

    should_flush: bool,
    flush_insn_id: u64,
    flush_pc: u64,

    branches_executed: u64,
    branch_mispredicts: u64,
}

impl ExecutionUnit {
    /// Creates an execution unit.
    pub fn new(pipelined: bool, blocking_groups: Vec<u16>) -> Self {
        Self {
            pipeline: VecDeque::new(),
            pipelined,
            blocking_groups,
            stall_until: 0,
            ticks: 0,
            should_flush: false,
            flush_insn_id: 0,
            flush_pc: 0,
            branches_executed: 0,
            branch_mispredicts: 0,
        }
    }

    /// Advances the unit one cycle.
    pub fn tick(
        &mut self,
        input: &mut PipelineBuffer<InsnRef>,
        output: &mut PipelineBuffer<InsnRef>,
        lsq: &mut LoadStoreQueue,
        dispatch: &mut DispatchIssueUnit,
        predictor: &mut dyn BranchPredictor,
        arch: &dyn Architecture,
    ) {
        self.ticks += 1;
        self.should_flush = false;

        // Accept a new instruction if the throughput gate permits.
        if self.ticks >= self.stall_until {
            input.stall(false);
            if let Some(uop) = input.head_slots()[0].take() {
                if uop.borrow().flushed {
                    // Dropped on observation.
                } else {
                    let (latency, stall_cycles, group) = {
                        let insn = uop.borrow();
                        (insn.latency as u64, insn.stall_cycles as u64, insn.group)
                    };
                    let ready_at = self.ticks + latency - 1;
                    let blocking =
                        !self.pipelined || self.blocking_groups.contains(&group);
                    self.stall_until = if blocking {
                        ready_at + 1
                    } else {
                        self.ticks + stall_cycles
                    };
                    self.pipeline.push_back(InFlight {
                        insn: uop,
                        ready_at,
                    });
                }
            }
        } else {
            input.stall(true);
        }

        // Complete the oldest instruction whose latency has elapsed.
        let done = self
            .pipeline
            .front()
            .map(|head| head.ready_at <= self.ticks)
            .unwrap_or(false);
        if done {
            let head = self.pipeline.pop_front().unwrap();
            if !head.insn.borrow().flushed {
                self.execute(head.insn, output, lsq, dispatch, predictor, arch);
            }
        }
    }

    /// Runs one instruction's operation and routes the outcome.
    fn execute(
        &mut self,
        uop: InsnRef,
        output: &mut PipelineBuffer<InsnRef>,
        lsq: &mut LoadStoreQueue,
        dispatch: &mut DispatchIssueUnit,
        predictor: &mut dyn BranchPredictor,
        arch: &dyn Architecture,
    ) {
        debug_assert!(uop.borrow().can_execute());

        let is_load = uop.borrow().is_load;
        if is_load {
            // Address generation; the LSQ owns the rest of the load's life.
            uop.borrow_mut().generate_addresses();
            lsq.start_load(&uop);
            return;
        }

        let is_store = uop.borrow().is_store;
        if is_store {
            uop.borrow_mut().generate_addresses();
        }
        uop.borrow_mut().execute();
        if uop.borrow().is_store_data {
            lsq.supply_store_data(&uop);
        }

        let is_branch = uop.borrow().is_branch;
        if is_branch {
            let (address, taken, target, mispredicted, insn_id) = {
                let insn = uop.borrow();
                (
                    insn.address,
                    insn.branch_taken.unwrap_or(false),
                    insn.branch_address,
                    insn.was_mispredicted(),
                    insn.instruction_id,
                )
            };
            self.branches_executed += 1;
            predictor.update(address, taken, target);
            if mispredicted {
                self.branch_mispredicts += 1;
                self.should_flush = true;
                self.flush_insn_id = insn_id;
                self.flush_pc = target;
            }
        }

        if !uop.borrow().results.is_empty() {
            dispatch.forward_operands(&uop, arch);
        }
        output.tail_slots()[0] = Some(uop);
    }

    /// Removes flushed instructions from the internal pipe.
    pub fn purge_flushed(&mut self) {
        self.pipeline.retain(|entry| !entry.insn.borrow().flushed);
    }

    /// A misprediction was resolved this cycle.
    pub fn should_flush(&self) -> bool {
        self.should_flush
    }

    /// Macro-op id of the instruction that requested the flush.
    pub fn flush_insn_id(&self) -> u64 {
        self.flush_insn_id
    }

    /// Address execution resumes from after the flush.
    pub fn flush_address(&self) -> u64 {
        self.flush_pc
    }

    /// Branches resolved on this unit.
    pub fn branches_executed(&self) -> u64 {
        self.branches_executed
    }

    /// Mispredicted branches resolved on this unit.
    pub fn branch_mispredicts(&self) -> u64 {
        self.branch_mispredicts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::StaticPredictor;
    use crate::common::{Register, RegisterValue};
    use crate::config::Config;
    use crate::isa::rv64::Rv64Architecture;
    use crate::isa::{groups, insn_ref, Instruction, Opcode};
    use crate::pipeline::lsq::CompletionOrder;

    fn fixture() -> (
        ExecutionUnit,
        PipelineBuffer<InsnRef>,
        PipelineBuffer<InsnRef>,
        LoadStoreQueue,
        DispatchIssueUnit,
        StaticPredictor,
        Rv64Architecture,
    ) {
        let config = Config::default().with_default_units();
        (
            ExecutionUnit::new(true, Vec::new()),
            PipelineBuffer::new(1),
            PipelineBuffer::new(1),
            LoadStoreQueue::new_split(8, 8, 1, CompletionOrder::OutOfOrder),
            DispatchIssueUnit::new(&config),
            StaticPredictor,
            Rv64Architecture::new(&config),
        )
    }

    fn supplied_add(seq: u64, latency: u16) -> InsnRef {
        let mut insn = Instruction::new(Opcode::Add, groups::INT_SIMPLE, seq * 4);
        insn.sequence_id = seq;
        insn.latency = latency;
        insn.stall_cycles = 1;
        insn.add_source(Register::general(1));
        insn.add_source(Register::general(2));
        insn.supply_operand(0, RegisterValue::from_u64(20));
        insn.supply_operand(1, RegisterValue::from_u64(22));
        insn.destinations.push(Register::general(40));
        insn_ref(insn)
    }

    fn tick(
        eu: &mut ExecutionUnit,
        input: &mut PipelineBuffer<InsnRef>,
        output: &mut PipelineBuffer<InsnRef>,
        lsq: &mut LoadStoreQueue,
        dispatch: &mut DispatchIssueUnit,
        predictor: &mut StaticPredictor,
        arch: &Rv64Architecture,
    ) {
        eu.tick(input, output, lsq, dispatch, predictor, arch);
        input.tick();
        output.tick();
    }

    #[test]
    fn test_single_cycle_op_completes_same_tick() {
        let (mut eu, mut input, mut output, mut lsq, mut dispatch, mut pred, arch) = fixture();
        input.tail_slots()[0] = Some(supplied_add(1, 1));
        input.tick();

        tick(&mut eu, &mut input, &mut output, &mut lsq, &mut dispatch, &mut pred, &arch);
        let done = output.head_slots()[0].take().unwrap();
        assert!(done.borrow().executed);
        assert_eq!(done.borrow().results[0].as_u64(), 42);
    }

    #[test]
    fn test_latency_delays_completion() {
        let (mut eu, mut input, mut output, mut lsq, mut dispatch, mut pred, arch) = fixture();
        input.tail_slots()[0] = Some(supplied_add(1, 3));
        input.tick();

        for _ in 0..2 {
            tick(&mut eu, &mut input, &mut output, &mut lsq, &mut dispatch, &mut pred, &arch);
            assert!(output.head_slots()[0].is_none());
        }
        tick(&mut eu, &mut input, &mut output, &mut lsq, &mut dispatch, &mut pred, &arch);
        assert!(output.head_slots()[0].is_some());
    }

    #[test]
    fn test_non_pipelined_unit_stalls_input() {
        let config = Config::default().with_default_units();
        let mut eu = ExecutionUnit::new(false, Vec::new());
        let mut input = PipelineBuffer::new(1);
        let mut output = PipelineBuffer::new(1);
        let mut lsq = LoadStoreQueue::new_split(8, 8, 1, CompletionOrder::OutOfOrder);
        let mut dispatch = DispatchIssueUnit::new(&config);
        let mut pred = StaticPredictor;
        let arch = Rv64Architecture::new(&config);

        input.tail_slots()[0] = Some(supplied_add(1, 4));
        input.tick();
        tick(&mut eu, &mut input, &mut output, &mut lsq, &mut dispatch, &mut pred, &arch);
        // Busy for the remaining three cycles of the operation.
        input.tail_slots()[0] = Some(supplied_add(2, 4));
        tick(&mut eu, &mut input, &mut output, &mut lsq, &mut dispatch, &mut pred, &arch);
        assert!(input.is_stalled());
    }

    #[test]
    fn test_mispredicted_branch_reports_flush() {
        let (mut eu, mut input, mut output, mut lsq, mut dispatch, mut pred, arch) = fixture();
        let branch = insn_ref({
            let mut insn = Instruction::new(Opcode::Beq, groups::BRANCH, 0x100);
            insn.instruction_id = 9;
            insn.is_branch = true;
            insn.imm = 0x40;
            insn.add_source(Register::general(1));
            insn.add_source(Register::general(2));
            insn.supply_operand(0, RegisterValue::from_u64(5));
            insn.supply_operand(1, RegisterValue::from_u64(5));
            insn
        });
        input.tail_slots()[0] = Some(branch);
        input.tick();

        tick(&mut eu, &mut input, &mut output, &mut lsq, &mut dispatch, &mut pred, &arch);
        assert!(eu.should_flush());
        assert_eq!(eu.flush_insn_id(), 9);
        assert_eq!(eu.flush_address(), 0x140);
        assert_eq!(eu.branches_executed(), 1);
        assert_eq!(eu.branch_mispredicts(), 1);
    }

    #[test]
    fn test_load_hands_off_to_lsq() {
        let (mut eu, mut input, mut output, mut lsq, mut dispatch, mut pred, arch) = fixture();
        let load = insn_ref({
            let mut insn = Instruction::new(Opcode::Ld, groups::LOAD, 0);
            insn.sequence_id = 3;
            insn.is_load = true;
            insn.mem_size = 8;
            insn.add_source(Register::general(10));
            insn.supply_operand(0, RegisterValue::from_u64(0x40));
            insn
        });
        lsq.add_load(&load);
        input.tail_slots()[0] = Some(load.clone());
        input.tick();

        tick(&mut eu, &mut input, &mut output, &mut lsq, &mut dispatch, &mut pred, &arch);
        // No writeback entry: the LSQ completes loads.
        assert!(output.head_slots()[0].is_none());
        assert_eq!(load.borrow().addresses[0].vaddr, 0x40);
    }

    #[test]
    fn test_flushed_instruction_dropped() {
        let (mut eu, mut input, mut output, mut lsq, mut dispatch, mut pred, arch) = fixture();
        let uop = supplied_add(1, 1);
        uop.borrow_mut().set_flushed();
        input.tail_slots()[0] = Some(uop);
        input.tick();

        tick(&mut eu, &mut input, &mut output, &mut lsq, &mut dispatch, &mut pred, &arch);
        assert!(output.head_slots()[0].is_none());
    }
}
