//! Reorder buffer.
//!
//! An in-order queue of in-flight instructions. Instructions enter at rename
//! (acquiring their sequence id), retire from the head once commit-ready, and
//! are flushed youngest-first on misprediction, violation, or exception. The
//! head store is the commit point at which memory-order violations are
//! detected. The ROB also watches committed branches for tight loops and
//! reports the boundary address to the fetch unit once.

use std::collections::VecDeque;

use crate::isa::InsnRef;
use crate::pipeline::lsq::LoadStoreQueue;
use crate::pipeline::rat::RegisterAliasTable;

/// A committed branch outcome tracked for loop detection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct LatestBranch {
    address: u64,
    taken: bool,
    target: u64,
}

/// The outcome of one commit walk.
#[derive(Default)]
pub struct CommitOutcome {
    /// Number of instructions retired this cycle.
    pub committed: usize,
    /// An instruction whose fault must now be raised to the core.
    pub exception: Option<InsnRef>,
    /// A detected loop boundary to send to the fetch unit.
    pub loop_boundary: Option<u64>,
}

/// The reorder buffer.
pub struct ReorderBuffer {
    buffer: VecDeque<InsnRef>,
    max_size: usize,
    next_sequence_id: u64,

    should_flush: bool,
    flush_after_insn_id: u64,
    flush_pc: u64,

    /// The head store has issued its write requests and awaits commit-ready.
    started_store: bool,

    branch_counter: (LatestBranch, u64),
    loop_detected: bool,
    loop_detection_threshold: u16,

    instructions_committed: u64,
    load_violations: u64,
}

impl ReorderBuffer {
    /// Creates a reorder buffer with the given capacity and loop threshold.
    pub fn new(max_size: usize, loop_detection_threshold: u16) -> Self {
        Self {
            buffer: VecDeque::with_capacity(max_size),
            max_size,
            next_sequence_id: 0,
            should_flush: false,
            flush_after_insn_id: 0,
            flush_pc: 0,
            started_store: false,
            branch_counter: (LatestBranch::default(), 0),
            loop_detected: false,
            loop_detection_threshold,
            instructions_committed: 0,
            load_violations: 0,
        }
    }

    /// Current occupancy.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// True when no instructions are in flight.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Free entries remaining.
    pub fn free_space(&self) -> usize {
        self.max_size - self.buffer.len()
    }

    /// Reserves a slot for `insn`, assigning its sequence id. Insertion
    /// order is program order.
    pub fn reserve(&mut self, insn: &InsnRef) {
        debug_assert!(self.buffer.len() < self.max_size);
        insn.borrow_mut().sequence_id = self.next_sequence_id;
        self.next_sequence_id += 1;
        self.buffer.push_back(insn.clone());
    }

    /// Promotes every micro-op of macro-op `insn_id` to commit-ready once all
    /// of them have written back, so partial macro-ops never retire.
    pub fn commit_micro_ops(&mut self, insn_id: u64) {
        let mut all_waiting = true;
        for entry in &self.buffer {
            let insn = entry.borrow();
            if insn.instruction_id == insn_id && !insn.waiting_commit {
                all_waiting = false;
                break;
            }
        }
        if !all_waiting {
            return;
        }
        for entry in &self.buffer {
            let mut insn = entry.borrow_mut();
            if insn.instruction_id == insn_id {
                insn.commit_ready = true;
            }
        }
    }

    /// Commits up to `max_commit` instructions from the head.
    ///
    /// A store at the head first issues its write requests (`start_store`)
    /// and waits for the memory interface to re-mark it commit-ready; its
    /// retirement then runs the violation scan. A faulted instruction stops
    /// the walk and is handed back for exception processing.
    pub fn commit(
        &mut self,
        max_commit: usize,
        rat: &mut RegisterAliasTable,
        lsq: &mut LoadStoreQueue,
    ) -> CommitOutcome {
        self.should_flush = false;
        let mut outcome = CommitOutcome::default();
        let max_commits = max_commit.min(self.buffer.len());

        for _ in 0..max_commits {
            let uop = self.buffer[0].clone();
            if !uop.borrow().commit_ready {
                break;
            }

            if uop.borrow().exception_encountered() {
                outcome.exception = Some(uop.clone());
                self.buffer.pop_front();
                outcome.committed += 1;
                return outcome;
            }

            let (is_store, is_load, has_addresses) = {
                let insn = uop.borrow();
                (insn.is_store, insn.is_load, !insn.addresses.is_empty())
            };

            if is_store && has_addresses {
                if !self.started_store {
                    // Issue the write requests; commit-ready clears until the
                    // memory interface has accepted every packet.
                    lsq.start_store(&uop);
                    self.started_store = true;
                }
                if !uop.borrow().commit_ready {
                    break;
                }
            }

            for reg in &uop.borrow().destinations {
                rat.commit(*reg);
            }

            if is_store {
                self.started_store = false;
                let violation = lsq.commit_store(&uop);
                if violation {
                    let load = lsq
                        .violating_load()
                        .expect("violation reported without a load");
                    let load = load.borrow();
                    self.should_flush = true;
                    self.flush_after_insn_id = load.instruction_id - 1;
                    self.flush_pc = load.address;
                    self.load_violations += 1;

                    self.buffer.pop_front();
                    outcome.committed += 1;
                    self.instructions_committed += 1;
                    return outcome;
                }
            } else if is_load {
                lsq.commit_load(&uop);
            }

            if uop.borrow().is_branch {
                self.track_branch(&uop, &mut outcome);
            }

            self.buffer.pop_front();
            outcome.committed += 1;
            self.instructions_committed += 1;
        }

        outcome
    }

    /// Compares a committed branch against the tracked tuple; a threshold of
    /// consecutive identical outcomes reports the loop boundary once.
    fn track_branch(&mut self, uop: &InsnRef, outcome: &mut CommitOutcome) {
        let insn = uop.borrow();
        let branch = LatestBranch {
            address: insn.address,
            taken: insn.branch_taken.unwrap_or(false),
            target: insn.branch_address,
        };
        if branch == self.branch_counter.0 {
            self.branch_counter.1 += 1;
        } else {
            // Any mismatch resets the run.
            self.branch_counter = (branch, 1);
        }
        if self.branch_counter.1 >= self.loop_detection_threshold as u64 && !self.loop_detected {
            self.loop_detected = true;
            outcome.loop_boundary = Some(branch.address);
        }
    }

    /// Flushes every instruction with `instruction_id > after_insn_id`,
    /// youngest first, rewinding their register allocations.
    pub fn flush(&mut self, after_insn_id: u64, rat: &mut RegisterAliasTable) {
        while let Some(uop) = self.buffer.back() {
            if uop.borrow().instruction_id <= after_insn_id {
                break;
            }
            let uop = self.buffer.pop_back().unwrap();
            let mut insn = uop.borrow_mut();
            // Rewind in reverse allocation order so the history unwinds.
            for reg in insn.destinations.iter().rev() {
                rat.rewind(*reg);
            }
            insn.set_flushed();
        }
        self.started_store = false;
        self.loop_detected = false;
        self.branch_counter = (LatestBranch::default(), 0);
    }

    /// A memory-order violation was discovered in the most recent commit.
    pub fn should_flush(&self) -> bool {
        self.should_flush
    }

    /// Instruction address to resume from after the violation flush.
    pub fn flush_address(&self) -> u64 {
        self.flush_pc
    }

    /// Youngest instruction id that survives the violation flush.
    pub fn flush_insn_id(&self) -> u64 {
        self.flush_after_insn_id
    }

    /// Total instructions retired.
    pub fn instructions_committed(&self) -> u64 {
        self.instructions_committed
    }

    /// Loads flagged as memory-order violations.
    pub fn load_violations(&self) -> u64 {
        self.load_violations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Register, RegisterBank};
    use crate::config::RegisterSet;
    use crate::isa::{groups, insn_ref, Instruction, Opcode};
    use crate::pipeline::lsq::{CompletionOrder, LoadStoreQueue};

    const ARCH: [u16; RegisterBank::COUNT] = [32, 32, 8, 1, 8, 8];

    fn rat() -> RegisterAliasTable {
        RegisterAliasTable::new(&ARCH, &RegisterSet::default())
    }

    fn lsq() -> LoadStoreQueue {
        LoadStoreQueue::new_split(16, 16, 1, CompletionOrder::OutOfOrder)
    }

    fn simple_insn(insn_id: u64) -> InsnRef {
        let mut insn = Instruction::new(Opcode::Addi, groups::INT_SIMPLE, insn_id * 4);
        insn.instruction_id = insn_id;
        insn_ref(insn)
    }

    #[test]
    fn test_reserve_assigns_monotonic_sequence_ids() {
        let mut rob = ReorderBuffer::new(8, 5);
        let a = simple_insn(0);
        let b = simple_insn(1);
        rob.reserve(&a);
        rob.reserve(&b);
        assert!(a.borrow().sequence_id < b.borrow().sequence_id);
        assert_eq!(rob.free_space(), 6);
    }

    #[test]
    fn test_commit_stops_at_unready_head() {
        let mut rob = ReorderBuffer::new(8, 5);
        let (mut rat, mut lsq) = (rat(), lsq());
        let a = simple_insn(0);
        let b = simple_insn(1);
        rob.reserve(&a);
        rob.reserve(&b);
        // b ready, a not: in-order retirement commits nothing.
        b.borrow_mut().commit_ready = true;
        let outcome = rob.commit(4, &mut rat, &mut lsq);
        assert_eq!(outcome.committed, 0);

        a.borrow_mut().commit_ready = true;
        let outcome = rob.commit(4, &mut rat, &mut lsq);
        assert_eq!(outcome.committed, 2);
        assert!(rob.is_empty());
    }

    #[test]
    fn test_commit_width_respected() {
        let mut rob = ReorderBuffer::new(8, 5);
        let (mut rat, mut lsq) = (rat(), lsq());
        for i in 0..4 {
            let insn = simple_insn(i);
            insn.borrow_mut().commit_ready = true;
            rob.reserve(&insn);
        }
        let outcome = rob.commit(2, &mut rat, &mut lsq);
        assert_eq!(outcome.committed, 2);
        assert_eq!(rob.len(), 2);
    }

    #[test]
    fn test_exception_stops_commit() {
        let mut rob = ReorderBuffer::new(8, 5);
        let (mut rat, mut lsq) = (rat(), lsq());
        let a = simple_insn(0);
        a.borrow_mut().commit_ready = true;
        a.borrow_mut().exception = Some(crate::common::Fault::SyscallRequest);
        let b = simple_insn(1);
        b.borrow_mut().commit_ready = true;
        rob.reserve(&a);
        rob.reserve(&b);

        let outcome = rob.commit(4, &mut rat, &mut lsq);
        assert!(outcome.exception.is_some());
        assert_eq!(outcome.committed, 1);
        assert_eq!(rob.len(), 1);
    }

    #[test]
    fn test_commit_frees_rat_history() {
        let mut rob = ReorderBuffer::new(8, 5);
        let (mut rat, mut lsq) = (rat(), lsq());
        let free_before = rat.free_count(RegisterBank::General);

        let insn = simple_insn(0);
        let phys = rat.allocate(Register::general(5)).unwrap();
        insn.borrow_mut().destinations.push(phys);
        insn.borrow_mut().commit_ready = true;
        rob.reserve(&insn);

        rob.commit(1, &mut rat, &mut lsq);
        assert_eq!(rat.free_count(RegisterBank::General), free_before);
    }

    #[test]
    fn test_flush_rewinds_youngest_first() {
        let mut rob = ReorderBuffer::new(8, 5);
        let mut rat = rat();
        let arch5 = Register::general(5);
        let original = rat.get_mapping(arch5);

        for i in 0..3 {
            let insn = simple_insn(i);
            let phys = rat.allocate(arch5).unwrap();
            insn.borrow_mut().destinations.push(phys);
            rob.reserve(&insn);
        }

        // Keep only instruction 0.
        rob.flush(0, &mut rat);
        assert_eq!(rob.len(), 1);
        // Mapping reverted to instruction 0's allocation, not the original.
        assert_ne!(rat.get_mapping(arch5), original);
    }

    #[test]
    fn test_flush_marks_instructions() {
        let mut rob = ReorderBuffer::new(8, 5);
        let mut rat = rat();
        let a = simple_insn(0);
        let b = simple_insn(1);
        rob.reserve(&a);
        rob.reserve(&b);

        rob.flush(0, &mut rat);
        assert!(!a.borrow().flushed);
        assert!(b.borrow().flushed);
    }

    #[test]
    fn test_loop_detection_fires_once() {
        let mut rob = ReorderBuffer::new(8, 3);
        let (mut rat, mut lsq) = (rat(), lsq());
        let mut boundary = None;

        for i in 0..5 {
            let mut insn = Instruction::new(Opcode::Beq, groups::BRANCH, 0x100);
            insn.instruction_id = i;
            insn.is_branch = true;
            insn.branch_taken = Some(true);
            insn.branch_address = 0x80;
            insn.commit_ready = true;
            let insn = insn_ref(insn);
            rob.reserve(&insn);
            let outcome = rob.commit(1, &mut rat, &mut lsq);
            if outcome.loop_boundary.is_some() {
                assert!(boundary.is_none(), "boundary reported twice");
                boundary = outcome.loop_boundary;
            }
        }
        assert_eq!(boundary, Some(0x100));
    }

    #[test]
    fn test_loop_counter_resets_on_mismatch() {
        let mut rob = ReorderBuffer::new(8, 3);
        let (mut rat, mut lsq) = (rat(), lsq());

        let mut commit_branch = |rob: &mut ReorderBuffer, id: u64, taken: bool| {
            let mut insn = Instruction::new(Opcode::Beq, groups::BRANCH, 0x100);
            insn.instruction_id = id;
            insn.is_branch = true;
            insn.branch_taken = Some(taken);
            insn.branch_address = 0x80;
            insn.commit_ready = true;
            let insn = insn_ref(insn);
            rob.reserve(&insn);
            rob.commit(1, &mut rat, &mut lsq).loop_boundary
        };

        assert!(commit_branch(&mut rob, 0, true).is_none());
        assert!(commit_branch(&mut rob, 1, true).is_none());
        // Direction change resets the run.
        assert!(commit_branch(&mut rob, 2, false).is_none());
        assert!(commit_branch(&mut rob, 3, true).is_none());
        assert!(commit_branch(&mut rob, 4, true).is_none());
        assert!(commit_branch(&mut rob, 5, true).is_some());
    }

    #[test]
    fn test_micro_op_grouping_promotes_together() {
        let mut rob = ReorderBuffer::new(8, 5);
        let a = simple_insn(7);
        let b = simple_insn(7);
        b.borrow_mut().micro_op_index = 1;
        rob.reserve(&a);
        rob.reserve(&b);

        a.borrow_mut().waiting_commit = true;
        rob.commit_micro_ops(7);
        assert!(!a.borrow().commit_ready);

        b.borrow_mut().waiting_commit = true;
        rob.commit_micro_ops(7);
        assert!(a.borrow().commit_ready && b.borrow().commit_ready);
    }
}
