//! The out-of-order core.
//!
//! Owns every structural unit and drives one simulated cycle per `tick()`.
//! Units communicate exclusively through the pipeline buffers and the shared
//! structures owned here (register file, alias table, reorder buffer,
//! load/store queue, MMU). Ticks are single-threaded and deterministic.

use crate::branch::BranchPredictor;
use crate::common::{ConfigError, Register, RegisterBank, RegisterValue};
use crate::config::{Config, RegisterSet, SimulationMode};
use crate::isa::{ArchRegisterSource, Architecture, ExceptionHandler, InsnRef, MacroOp};
use crate::memory::{MemoryInterface, Mmu, PageTable};
use crate::pipeline::{
    BalancedPortAllocator, CompletionOrder, DecodeUnit, DispatchIssueUnit, ExecutionUnit,
    FetchUnit, LoadStoreQueue, PipelineBuffer, PortAllocator, RegisterAliasTable, RenameUnit,
    ReorderBuffer, WritebackUnit,
};
use crate::regfile::RegisterFileSet;
use crate::stats::{percentage, ratio, StatsTable};

/// Lifecycle state of the core.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoreStatus {
    /// Running a scheduled context.
    Executing,
    /// Draining the pipeline ahead of a context switch.
    Switching,
    /// No context scheduled.
    Idle,
    /// Stopped; either fatal or a program exit.
    Halted,
}

/// A schedulable execution context.
#[derive(Clone, Debug)]
pub struct CpuContext {
    /// Thread id.
    pub tid: u64,
    /// Entry program counter.
    pub pc: u64,
    /// Program image length in bytes.
    pub program_byte_length: u64,
    /// Architectural register values, per bank.
    pub register_file: Vec<Vec<RegisterValue>>,
}

/// Architectural register view mapped through the alias table.
struct MappedRegisters<'a> {
    rat: &'a RegisterAliasTable,
    regfile: &'a RegisterFileSet,
}

impl ArchRegisterSource for MappedRegisters<'_> {
    fn read(&self, reg: Register) -> RegisterValue {
        self.regfile.get(self.rat.get_mapping(reg))
    }
}

/// The out-of-order core.
pub struct Core {
    arch: Box<dyn Architecture>,
    predictor: Box<dyn BranchPredictor>,

    regfile: RegisterFileSet,
    rat: RegisterAliasTable,
    mmu: Mmu,

    fetch_to_decode: PipelineBuffer<MacroOp>,
    decode_to_rename: PipelineBuffer<InsnRef>,
    rename_to_dispatch: PipelineBuffer<InsnRef>,
    issue_ports: Vec<PipelineBuffer<InsnRef>>,
    /// Execution-unit slots first, then the LSQ's slots.
    completion_slots: Vec<PipelineBuffer<InsnRef>>,
    eu_count: usize,

    fetch: FetchUnit,
    decode: DecodeUnit,
    rename: RenameUnit,
    dispatch: DispatchIssueUnit,
    execution_units: Vec<ExecutionUnit>,
    writeback: WritebackUnit,
    lsq: LoadStoreQueue,
    rob: ReorderBuffer,
    port_allocator: BalancedPortAllocator,

    arch_reg_counts: [u16; RegisterBank::COUNT],
    register_set: RegisterSet,
    commit_width: usize,
    trace: bool,

    status: CoreStatus,
    ticks: u64,
    proc_ticks: u64,
    idle_ticks: u64,
    flushes: u64,
    context_switches: u64,

    exception_insn: Option<InsnRef>,
    exception_handler: Option<Box<dyn ExceptionHandler>>,
    exit_code: Option<u64>,
    tid: u64,
}

impl Core {
    /// Builds a core from a validated configuration and its collaborators.
    pub fn new(
        config: &Config,
        arch: Box<dyn Architecture>,
        predictor: Box<dyn BranchPredictor>,
        backend: Box<dyn MemoryInterface>,
        page_table: Box<dyn PageTable>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        if config.core.simulation_mode != SimulationMode::OutOfOrder {
            return Err(ConfigError::Invalid {
                key: "Core.Simulation-Mode",
                reason: "this core implements the outoforder model".to_string(),
            });
        }

        let frontend_width = config.pipeline_widths.frontend;
        let eu_count = config.execution_units.len();
        let lsq_completion = config.pipeline_widths.lsq_completion;

        let arch_reg_counts = arch.architectural_register_counts();
        let mut regfile = RegisterFileSet::new(&config.register_set);
        let rat = RegisterAliasTable::new(&arch_reg_counts, &config.register_set);

        for (reg, value) in arch.initial_state() {
            regfile.set(rat.get_mapping(reg), value);
        }

        let execution_units = config
            .execution_units
            .iter()
            .map(|eu| ExecutionUnit::new(eu.pipelined, eu.blocking_groups.clone()))
            .collect();

        Ok(Self {
            mmu: Mmu::new(config, backend, page_table),
            arch,
            predictor,
            regfile,
            rat,
            fetch_to_decode: PipelineBuffer::new(frontend_width),
            decode_to_rename: PipelineBuffer::new(frontend_width),
            rename_to_dispatch: PipelineBuffer::new(frontend_width),
            issue_ports: (0..eu_count).map(|_| PipelineBuffer::new(1)).collect(),
            completion_slots: (0..eu_count + lsq_completion)
                .map(|_| PipelineBuffer::new(1))
                .collect(),
            eu_count,
            fetch: FetchUnit::new(
                config.fetch.fetch_block_size,
                config.fetch.loop_buffer_size,
            ),
            decode: DecodeUnit::new(),
            rename: RenameUnit::new(),
            dispatch: DispatchIssueUnit::new(config),
            execution_units,
            writeback: WritebackUnit::new(),
            lsq: LoadStoreQueue::new_split(
                config.queue_sizes.load,
                config.queue_sizes.store,
                config.lsq_memory_interface.access_latency,
                CompletionOrder::OutOfOrder,
            ),
            rob: ReorderBuffer::new(
                config.queue_sizes.rob,
                config.fetch.loop_detection_threshold,
            ),
            port_allocator: BalancedPortAllocator::new(eu_count),
            arch_reg_counts,
            register_set: config.register_set.clone(),
            commit_width: config.pipeline_widths.commit,
            trace: config.core.trace,
            status: CoreStatus::Idle,
            ticks: 0,
            proc_ticks: 0,
            idle_ticks: 0,
            flushes: 0,
            context_switches: 0,
            exception_insn: None,
            exception_handler: None,
            exit_code: None,
            tid: 0,
        })
    }

    /// Advances the core one simulated cycle.
    pub fn tick(&mut self) {
        self.ticks += 1;
        self.arch.update_system_timer(&mut self.regfile, self.ticks);

        match self.status {
            CoreStatus::Idle => {
                self.idle_ticks += 1;
                return;
            }
            CoreStatus::Halted => return,
            CoreStatus::Switching => {
                // Wait for the pipeline to drain before parking.
                if self.fetch_to_decode.is_empty()
                    && self.decode_to_rename.is_empty()
                    && self.rename_to_dispatch.is_empty()
                    && !self.mmu.has_pending_requests()
                    && self.rob.is_empty()
                    && self.exception_insn.is_none()
                {
                    self.fetch.flush_loop_buffer();
                    self.decode.purge_flushed();
                    self.dispatch.purge_flushed(&mut self.port_allocator);
                    self.status = CoreStatus::Idle;
                    return;
                }
            }
            CoreStatus::Executing => {}
        }

        self.proc_ticks += 1;

        if self.exception_insn.is_some() {
            // Keep memory draining while the handler waits on it.
            self.mmu.tick();
            self.process_exception();
            return;
        }

        self.port_allocator.tick();

        // Writeback first so dispatch reads an up-to-date scoreboard.
        self.writeback.tick(
            &mut self.completion_slots,
            &mut self.regfile,
            &mut self.dispatch,
            &mut self.rob,
        );

        self.fetch.tick(
            &mut self.fetch_to_decode,
            &mut self.mmu,
            self.arch.as_mut(),
            self.predictor.as_mut(),
        );
        self.decode
            .tick(&mut self.fetch_to_decode, &mut self.decode_to_rename);
        self.rename.tick(
            &mut self.decode_to_rename,
            &mut self.rename_to_dispatch,
            &mut self.rob,
            &mut self.rat,
            &mut self.lsq,
        );
        self.dispatch.tick(
            &mut self.rename_to_dispatch,
            &self.regfile,
            &mut self.port_allocator,
        );

        {
            let Core {
                execution_units,
                issue_ports,
                completion_slots,
                lsq,
                dispatch,
                predictor,
                arch,
                mmu,
                eu_count,
                ..
            } = self;
            for (i, eu) in execution_units.iter_mut().enumerate() {
                eu.tick(
                    &mut issue_ports[i],
                    &mut completion_slots[i],
                    lsq,
                    dispatch,
                    predictor.as_mut(),
                    arch.as_ref(),
                );
            }
            lsq.tick(
                mmu,
                &mut completion_slots[*eu_count..],
                dispatch,
                arch.as_ref(),
            );
        }

        self.mmu.tick();

        // Late issue pass so newly woken instructions leave this cycle.
        self.dispatch
            .issue(&mut self.issue_ports, &mut self.port_allocator);

        // Buffer ticks commit every tail written this cycle.
        self.fetch_to_decode.tick();
        self.decode_to_rename.tick();
        self.rename_to_dispatch.tick();
        for port in &mut self.issue_ports {
            port.tick();
        }
        for slot in &mut self.completion_slots {
            slot.tick();
        }

        let outcome = self
            .rob
            .commit(self.commit_width, &mut self.rat, &mut self.lsq);
        if self.trace && outcome.committed > 0 {
            eprintln!("CM  retired {} (total {})", outcome.committed, self.rob.instructions_committed());
        }
        if let Some(boundary) = outcome.loop_boundary {
            self.fetch.register_loop_boundary(boundary);
        }
        if let Some(insn) = outcome.exception {
            self.raise_exception(insn);
        }

        if self.exception_insn.is_some() {
            self.handle_exception();
            self.fetch.request_from_pc(&mut self.mmu);
            return;
        }

        self.flush_if_needed();
        self.fetch.request_from_pc(&mut self.mmu);
    }

    /// Arbitrates this cycle's flush requests; the globally oldest wins.
    fn flush_if_needed(&mut self) {
        let mut eu_flush = false;
        let mut lowest_insn_id = 0;
        let mut target_address = 0;
        for eu in &self.execution_units {
            if eu.should_flush() && (!eu_flush || eu.flush_insn_id() < lowest_insn_id) {
                eu_flush = true;
                lowest_insn_id = eu.flush_insn_id();
                target_address = eu.flush_address();
            }
        }

        if eu_flush || self.rob.should_flush() {
            if self.rob.should_flush()
                && (!eu_flush || self.rob.flush_insn_id() < lowest_insn_id)
            {
                lowest_insn_id = self.rob.flush_insn_id();
                target_address = self.rob.flush_address();
            }

            if self.trace {
                eprintln!(
                    "EX  flush after insn {} -> {:#x}",
                    lowest_insn_id, target_address
                );
            }

            self.fetch.flush_loop_buffer();
            self.fetch.update_pc(target_address);
            self.fetch_to_decode.fill_empty();
            self.fetch_to_decode.stall(false);
            self.decode_to_rename.fill_empty();
            self.decode_to_rename.stall(false);
            self.rename_to_dispatch.fill_empty();
            self.rename_to_dispatch.stall(false);

            self.rob.flush(lowest_insn_id, &mut self.rat);
            self.decode.purge_flushed();
            self.dispatch.purge_flushed(&mut self.port_allocator);
            self.lsq.purge_flushed();
            for eu in &mut self.execution_units {
                eu.purge_flushed();
            }

            // Completion slots keep entries at or before the flush point.
            let clear_stale = |entry: &mut Option<InsnRef>| {
                let stale = entry
                    .as_ref()
                    .map(|uop| uop.borrow().instruction_id > lowest_insn_id)
                    .unwrap_or(false);
                if stale {
                    *entry = None;
                }
            };
            for slot in &mut self.completion_slots {
                slot.head_slots().iter_mut().for_each(clear_stale);
                slot.tail_slots().iter_mut().for_each(clear_stale);
            }

            // An exception from an instruction past the flush point dies
            // with it.
            let cancel = self
                .exception_insn
                .as_ref()
                .map(|uop| uop.borrow().instruction_id > lowest_insn_id)
                .unwrap_or(false);
            if cancel {
                self.exception_insn = None;
            }

            self.flushes += 1;
        } else if self.decode.should_flush() {
            self.fetch.flush_loop_buffer();
            self.fetch.update_pc(self.decode.flush_address());
            self.fetch_to_decode.fill_empty();
            self.fetch_to_decode.stall(false);
            self.flushes += 1;
        }
    }

    /// Registers a faulted instruction, keeping the oldest if several race.
    fn raise_exception(&mut self, insn: InsnRef) {
        let replace = self
            .exception_insn
            .as_ref()
            .map(|existing| insn.borrow().sequence_id < existing.borrow().sequence_id)
            .unwrap_or(true);
        if replace {
            self.exception_insn = Some(insn);
        }
    }

    /// Flushes everything younger than the faulting instruction and starts
    /// its handler.
    fn handle_exception(&mut self) {
        let insn = self
            .exception_insn
            .clone()
            .expect("handle_exception without a raised exception");

        self.fetch_to_decode.fill_empty();
        self.fetch_to_decode.stall(false);
        self.decode_to_rename.fill_empty();
        self.decode_to_rename.stall(false);
        self.rename_to_dispatch.fill_empty();
        self.rename_to_dispatch.stall(false);

        // Commit state must be current before the handler inspects it.
        self.rob.flush(insn.borrow().instruction_id, &mut self.rat);
        self.decode.purge_flushed();
        self.dispatch.purge_flushed(&mut self.port_allocator);
        self.lsq.purge_flushed();
        for eu in &mut self.execution_units {
            eu.purge_flushed();
        }

        self.exception_handler = Some(self.arch.handle_exception(&insn));
        self.process_exception();
    }

    /// Runs the exception handler; may span several ticks while memory
    /// drains or the handler works.
    fn process_exception(&mut self) {
        debug_assert!(self.exception_insn.is_some());
        if self.mmu.has_pending_requests() {
            return;
        }

        let mut handler = self
            .exception_handler
            .take()
            .expect("exception raised without a handler");
        let done = handler.tick(&MappedRegisters {
            rat: &self.rat,
            regfile: &self.regfile,
        });
        if !done {
            self.exception_handler = Some(handler);
            return;
        }

        let result = handler.result();
        if result.fatal {
            eprintln!("halting due to fatal exception");
            self.status = CoreStatus::Halted;
        } else {
            self.fetch.flush_loop_buffer();
            self.fetch.update_pc(result.instruction_address);
            for (reg, value) in &result.state_change.registers {
                self.regfile.set(self.rat.get_mapping(*reg), *value);
            }
            for (target, value) in &result.state_change.memory {
                self.mmu.request_untimed_write(*target, *value);
            }
            if let Some(code) = result.exit_code {
                self.exit_code = Some(code);
                self.status = CoreStatus::Halted;
            } else if result.idle_after_syscall {
                self.dispatch.purge_flushed(&mut self.port_allocator);
                self.status = CoreStatus::Idle;
                self.context_switches += 1;
            }
        }

        self.exception_insn = None;
    }

    /// Installs a context and begins executing it.
    pub fn schedule(&mut self, context: CpuContext) {
        self.rat.reset(&self.arch_reg_counts, &self.register_set);
        self.tid = context.tid;
        self.mmu.set_tid(context.tid);
        self.mmu.clear_completed_instr_reads();
        self.fetch.set_program_length(context.program_byte_length);
        self.fetch.update_pc(context.pc);

        for (bank_index, values) in context.register_file.iter().enumerate() {
            let bank = RegisterBank::ALL[bank_index];
            for (tag, value) in values.iter().enumerate() {
                let reg = Register::new(bank, tag as u16);
                self.regfile.set(self.rat.get_mapping(reg), *value);
            }
        }

        self.status = CoreStatus::Executing;
        self.proc_ticks = 0;
        self.fetch.unpause();
        self.fetch.request_from_pc(&mut self.mmu);
    }

    /// Requests a context switch. Returns true and begins draining unless an
    /// exception is mid-flight.
    pub fn interrupt(&mut self) -> bool {
        if self.exception_insn.is_none() {
            self.status = CoreStatus::Switching;
            self.context_switches += 1;
            self.fetch.pause();
            return true;
        }
        false
    }

    /// Snapshots the current context.
    pub fn current_context(&self) -> CpuContext {
        let pc = match &self.exception_insn {
            Some(insn) => insn.borrow().address + 4,
            None => self.fetch.pc(),
        };
        let register_file = RegisterBank::ALL
            .iter()
            .enumerate()
            .map(|(bank_index, bank)| {
                (0..self.arch_reg_counts[bank_index])
                    .map(|tag| self.read_arch_register(Register::new(*bank, tag)))
                    .collect()
            })
            .collect();
        CpuContext {
            tid: self.tid,
            pc,
            program_byte_length: 0,
            register_file,
        }
    }

    /// Reads an architectural register through the current mapping.
    pub fn read_arch_register(&self, reg: Register) -> RegisterValue {
        self.regfile.get(self.rat.get_mapping(reg))
    }

    /// Writes an architectural register through the current mapping. Used by
    /// drivers to seed state before running.
    pub fn write_arch_register(&mut self, reg: Register, value: RegisterValue) {
        self.regfile.set(self.rat.get_mapping(reg), value);
    }

    /// Current lifecycle state.
    pub fn status(&self) -> CoreStatus {
        self.status
    }

    /// Exit status requested by the program, if any.
    pub fn exit_code(&self) -> Option<u64> {
        self.exit_code
    }

    /// Total instructions retired.
    pub fn instructions_retired(&self) -> u64 {
        self.rob.instructions_committed()
    }

    /// Cycles simulated.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Cycles spent executing the current context.
    pub fn proc_ticks(&self) -> u64 {
        self.proc_ticks
    }

    /// Thread id of the current context.
    pub fn tid(&self) -> u64 {
        self.tid
    }

    /// The MMU has data packets in flight.
    pub fn has_pending_memory_requests(&self) -> bool {
        self.mmu.has_pending_requests()
    }

    /// True once every inter-stage buffer is empty.
    pub fn pipeline_empty(&self) -> bool {
        self.fetch_to_decode.is_empty()
            && self.decode_to_rename.is_empty()
            && self.rename_to_dispatch.is_empty()
    }

    /// Enumerates the statistics table.
    pub fn stats(&self) -> StatsTable {
        let retired = self.rob.instructions_committed();
        let branches_executed: u64 = self
            .execution_units
            .iter()
            .map(|eu| eu.branches_executed())
            .sum();
        let branch_mispredicts: u64 = self
            .execution_units
            .iter()
            .map(|eu| eu.branch_mispredicts())
            .sum();

        vec![
            ("cycles".to_string(), self.ticks.to_string()),
            ("retired".to_string(), retired.to_string()),
            ("ipc".to_string(), ratio(retired, self.ticks)),
            ("flushes".to_string(), self.flushes.to_string()),
            (
                "fetch.branchStalls".to_string(),
                self.fetch.branch_stalls().to_string(),
            ),
            (
                "decode.earlyFlushes".to_string(),
                self.decode.early_flushes().to_string(),
            ),
            (
                "rename.allocationStalls".to_string(),
                self.rename.allocation_stalls().to_string(),
            ),
            (
                "rename.robStalls".to_string(),
                self.rename.rob_stalls().to_string(),
            ),
            (
                "rename.lqStalls".to_string(),
                self.rename.lq_stalls().to_string(),
            ),
            (
                "rename.sqStalls".to_string(),
                self.rename.sq_stalls().to_string(),
            ),
            (
                "dispatch.rsStalls".to_string(),
                self.dispatch.rs_stalls().to_string(),
            ),
            (
                "issue.frontendStalls".to_string(),
                self.dispatch.frontend_stalls().to_string(),
            ),
            (
                "issue.backendStalls".to_string(),
                self.dispatch.backend_stalls().to_string(),
            ),
            (
                "issue.portBusyStalls".to_string(),
                self.dispatch.port_busy_stalls().to_string(),
            ),
            (
                "branch.executed".to_string(),
                branches_executed.to_string(),
            ),
            (
                "branch.mispredict".to_string(),
                branch_mispredicts.to_string(),
            ),
            (
                "branch.missrate".to_string(),
                percentage(branch_mispredicts, branches_executed),
            ),
            (
                "lsq.loadViolations".to_string(),
                self.rob.load_violations().to_string(),
            ),
            ("idle.ticks".to_string(), self.idle_ticks.to_string()),
            (
                "context.switches".to_string(),
                self.context_switches.to_string(),
            ),
        ]
    }
}
