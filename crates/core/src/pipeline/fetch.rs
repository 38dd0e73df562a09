//! Fetch unit.
//!
//! Requests aligned blocks from the memory interface, predecodes them into
//! macro-ops, attaches branch predictions, and redirects itself on predicted
//! taken branches. A loop boundary reported by the reorder buffer arms the
//! loop buffer: once the boundary branch is fetched again, the body is
//! recorded and subsequently replayed without touching memory.

use std::collections::VecDeque;

use crate::branch::BranchPredictor;
use crate::common::{down_align, MemoryAccessTarget};
use crate::isa::{Architecture, MacroOp};
use crate::memory::Mmu;
use crate::pipeline::buffer::PipelineBuffer;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LoopBufferState {
    /// No boundary registered.
    Idle,
    /// Boundary registered; waiting to see the boundary branch.
    Waiting,
    /// Recording the loop body.
    Filling,
    /// Replaying the recorded body.
    Supplying,
}

/// The fetch unit.
pub struct FetchUnit {
    pc: u64,
    program_length: u64,
    fetch_block_size: u16,
    paused: bool,
    halted: bool,
    /// Block address of the outstanding fetch request, if any.
    expected_block: Option<u64>,

    loop_buffer: VecDeque<(u64, u32)>,
    loop_buffer_size: u16,
    loop_state: LoopBufferState,
    loop_boundary: u64,
    supply_index: usize,

    branch_stalls: u64,
}

impl FetchUnit {
    /// Creates a fetch unit.
    pub fn new(fetch_block_size: u16, loop_buffer_size: u16) -> Self {
        Self {
            pc: 0,
            program_length: 0,
            fetch_block_size,
            paused: false,
            halted: false,
            expected_block: None,
            loop_buffer: VecDeque::new(),
            loop_buffer_size,
            loop_state: LoopBufferState::Idle,
            loop_boundary: 0,
            supply_index: 0,
            branch_stalls: 0,
        }
    }

    /// Predecodes completed fetch blocks into the output buffer.
    pub fn tick(
        &mut self,
        output: &mut PipelineBuffer<MacroOp>,
        mmu: &mut Mmu,
        arch: &mut dyn Architecture,
        predictor: &mut dyn BranchPredictor,
    ) {
        if output.is_stalled() || self.paused {
            return;
        }

        if self.loop_state == LoopBufferState::Supplying {
            self.supply_from_loop_buffer(output, arch, predictor);
            return;
        }

        if self.halted {
            mmu.clear_completed_instr_reads();
            return;
        }

        let results: Vec<_> = mmu.completed_instr_reads().to_vec();
        mmu.clear_completed_instr_reads();

        for result in results {
            if Some(result.target.vaddr) != self.expected_block {
                // Stale response from before a redirect.
                continue;
            }
            self.expected_block = None;
            if result.data.is_empty() {
                // Fetch beyond backed memory; stop requesting.
                self.halted = true;
                return;
            }
            self.consume_block(result.target.vaddr, result.data.as_bytes(), output, arch, predictor);
        }
    }

    /// Decodes instruction words from one fetched block until the output
    /// fills, the block ends, or a predicted-taken branch redirects fetch.
    fn consume_block(
        &mut self,
        block_addr: u64,
        data: &[u8],
        output: &mut PipelineBuffer<MacroOp>,
        arch: &mut dyn Architecture,
        predictor: &mut dyn BranchPredictor,
    ) {
        for slot in 0..output.width() {
            if output.tail_slots()[slot].is_some() {
                continue;
            }
            if self.halted || self.pc < block_addr {
                break;
            }
            let offset = (self.pc - block_addr) as usize;
            if offset + 4 > data.len() {
                break;
            }
            let word = u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap());
            let addr = self.pc;

            let macro_op = arch.predecode(word, addr);
            let mut predicted_taken = None;
            for uop in &macro_op {
                let is_branch = uop.borrow().is_branch;
                if is_branch {
                    let prediction = predictor.predict(addr, &uop.borrow());
                    uop.borrow_mut().prediction = prediction;
                    if prediction.taken {
                        predicted_taken = Some(prediction.target);
                    }
                }
            }

            self.record_for_loop_buffer(addr, word);
            output.tail_slots()[slot] = Some(macro_op);

            if let Some(target) = predicted_taken {
                // Redirect; the rest of the block is unusable this cycle.
                self.pc = target;
                self.branch_stalls += 1;
                break;
            }
            self.pc += 4;
            if self.pc >= self.program_length {
                self.halted = true;
                break;
            }
        }
    }

    /// Replays recorded loop iterations without memory requests.
    fn supply_from_loop_buffer(
        &mut self,
        output: &mut PipelineBuffer<MacroOp>,
        arch: &mut dyn Architecture,
        predictor: &mut dyn BranchPredictor,
    ) {
        for slot in 0..output.width() {
            if output.tail_slots()[slot].is_some() {
                continue;
            }
            let Some(&(addr, word)) = self.loop_buffer.get(self.supply_index) else {
                break;
            };
            let macro_op = arch.predecode(word, addr);
            for uop in &macro_op {
                let is_branch = uop.borrow().is_branch;
                if is_branch {
                    let prediction = predictor.predict(addr, &uop.borrow());
                    uop.borrow_mut().prediction = prediction;
                }
            }
            output.tail_slots()[slot] = Some(macro_op);
            self.supply_index = (self.supply_index + 1) % self.loop_buffer.len();
        }
    }

    /// Tracks fetched instructions through the loop buffer state machine.
    fn record_for_loop_buffer(&mut self, addr: u64, word: u32) {
        match self.loop_state {
            LoopBufferState::Idle | LoopBufferState::Supplying => {}
            LoopBufferState::Waiting => {
                if addr == self.loop_boundary {
                    // The next fetch starts the loop body.
                    self.loop_state = LoopBufferState::Filling;
                    self.loop_buffer.clear();
                }
            }
            LoopBufferState::Filling => {
                self.loop_buffer.push_back((addr, word));
                if addr == self.loop_boundary {
                    self.loop_state = LoopBufferState::Supplying;
                    self.supply_index = 0;
                } else if self.loop_buffer.len() > self.loop_buffer_size as usize {
                    // Body too large to replay.
                    self.loop_state = LoopBufferState::Idle;
                    self.loop_buffer.clear();
                }
            }
        }
    }

    /// Requests the block containing the current PC, if none is outstanding.
    pub fn request_from_pc(&mut self, mmu: &mut Mmu) {
        if self.paused
            || self.halted
            || self.loop_state == LoopBufferState::Supplying
            || self.expected_block.is_some()
        {
            return;
        }
        let block = down_align(self.pc, self.fetch_block_size as u64);
        self.expected_block = Some(block);
        mmu.request_instr_read(MemoryAccessTarget::new(block, self.fetch_block_size));
    }

    /// Registers a loop boundary reported by the reorder buffer.
    pub fn register_loop_boundary(&mut self, addr: u64) {
        self.loop_boundary = addr;
        self.loop_state = LoopBufferState::Waiting;
        self.loop_buffer.clear();
    }

    /// Discards the loop buffer and disarms detection. Called on flush.
    pub fn flush_loop_buffer(&mut self) {
        self.loop_state = LoopBufferState::Idle;
        self.loop_buffer.clear();
        self.supply_index = 0;
    }

    /// Redirects fetch to `addr`, discarding any outstanding request.
    pub fn update_pc(&mut self, addr: u64) {
        self.pc = addr;
        self.expected_block = None;
        self.halted = self.pc >= self.program_length;
    }

    /// Sets the byte length of the scheduled program.
    pub fn set_program_length(&mut self, length: u64) {
        self.program_length = length;
        self.halted = self.pc >= self.program_length;
    }

    /// Stops fetching and PC updates (context switch drain).
    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Resumes fetching.
    pub fn unpause(&mut self) {
        self.paused = false;
    }

    /// Current fetch PC.
    pub fn pc(&self) -> u64 {
        self.pc
    }

    /// Cycles lost to predicted-taken branch redirects.
    pub fn branch_stalls(&self) -> u64 {
        self.branch_stalls
    }
}
