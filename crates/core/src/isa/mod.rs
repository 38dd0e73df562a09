//! Instruction model and architecture collaborator interfaces.
//!
//! The pipeline consumes already-decoded instructions. This module defines:
//! 1. **`Instruction`:** The fundamental unit flowing through every stage,
//!    shared between structures via [`InsnRef`].
//! 2. **`Architecture`:** The predecode / execution-info / exception-handling
//!    collaborator the core compiles against.
//! 3. **Instruction groups:** Coarse opcode classes used for port routing,
//!    latency lookup, and forwarding policy.

/// The bundled RV64I-subset architecture.
pub mod rv64;

use std::cell::RefCell;
use std::rc::Rc;

use crate::common::{Fault, MemoryAccessTarget, Register, RegisterValue};
use crate::regfile::RegisterFileSet;

/// Shared handle to an in-flight instruction.
///
/// Instructions are held simultaneously by pipeline buffers, the reorder
/// buffer, and the load/store queue; the last share is dropped at retirement
/// or flush. The core is single-threaded, so `Rc<RefCell<..>>` is sufficient.
pub type InsnRef = Rc<RefCell<Instruction>>;

/// A macro-op: the micro-op expansion of one architectural instruction.
pub type MacroOp = Vec<InsnRef>;

/// Coarse instruction groups used for port routing and latency lookup.
pub mod groups {
    /// Simple integer arithmetic and logic.
    pub const INT_SIMPLE: u16 = 0;
    /// Integer multiply.
    pub const INT_MUL: u16 = 1;
    /// Integer divide.
    pub const INT_DIV: u16 = 2;
    /// Memory loads.
    pub const LOAD: u16 = 3;
    /// Memory stores.
    pub const STORE: u16 = 4;
    /// Branches and jumps.
    pub const BRANCH: u16 = 5;
    /// System operations (environment calls).
    pub const SYSTEM: u16 = 6;
}

/// Demo-architecture operation selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Opcode {
    /// Add immediate.
    Addi,
    /// Register add.
    Add,
    /// Register subtract.
    Sub,
    /// Register multiply.
    Mul,
    /// Register divide (signed).
    Div,
    /// Branch if equal.
    Beq,
    /// Branch if not equal.
    Bne,
    /// Jump and link.
    Jal,
    /// Load doubleword.
    Ld,
    /// Store doubleword.
    Sd,
    /// Load-reserved doubleword.
    LrD,
    /// Store-conditional doubleword.
    ScD,
    /// Environment call.
    Ecall,
    /// Placeholder for an instruction that raised a predecode fault.
    Invalid,
}

/// A branch direction/target prediction attached at fetch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BranchPrediction {
    /// Predicted taken?
    pub taken: bool,
    /// Predicted target address (meaningful when `taken`).
    pub target: u64,
}

/// Static execution parameters resolved from configuration.
#[derive(Clone, Debug, Default)]
pub struct ExecutionInfo {
    /// Execution latency in cycles.
    pub latency: u16,
    /// Minimum cycles between successive executions on one pipe.
    pub stall_cycles: u16,
    /// Issue ports able to execute this instruction.
    pub supported_ports: Vec<u8>,
}

/// The fundamental unit flowing through the pipeline.
#[derive(Clone, Debug)]
pub struct Instruction {
    /// Macro-op id, assigned at decode in program order.
    pub instruction_id: u64,
    /// Position within the macro-op expansion.
    pub micro_op_index: u8,
    /// Unique monotonic id, assigned at rename.
    pub sequence_id: u64,
    /// Instruction address.
    pub address: u64,

    /// Operation selector.
    pub opcode: Opcode,
    /// Instruction group (port routing, latency, forwarding).
    pub group: u16,
    /// Execution latency in cycles.
    pub latency: u16,
    /// Minimum cycles between successive executions on one pipe.
    pub stall_cycles: u16,
    /// Issue ports able to execute this instruction.
    pub supported_ports: Vec<u8>,

    /// This instruction reads memory.
    pub is_load: bool,
    /// This instruction writes memory.
    pub is_store: bool,
    /// This micro-op generates the store address.
    pub is_store_address: bool,
    /// This micro-op supplies the store data.
    pub is_store_data: bool,
    /// Store-conditional operation.
    pub is_store_cond: bool,
    /// Load-reserved operation.
    pub is_load_reserved: bool,
    /// Branch or jump.
    pub is_branch: bool,

    /// Source registers; architectural until rename, physical after.
    pub source_registers: Vec<Register>,
    /// Supplied operand values, parallel to `source_registers`.
    pub operands: Vec<Option<RegisterValue>>,
    /// Sign-extended immediate.
    pub imm: i64,
    /// Destination registers; architectural until rename, physical after.
    pub destinations: Vec<Register>,
    /// Result values, parallel to `destinations` once executed.
    pub results: Vec<RegisterValue>,

    /// Generated memory access targets (loads/stores, after address gen).
    pub addresses: Vec<MemoryAccessTarget>,
    /// Memory data supplied back to a load, parallel to `addresses`.
    pub supplied_data: Vec<Option<RegisterValue>>,
    /// Data this store will write, parallel to `addresses`.
    pub store_data: Vec<RegisterValue>,
    /// Access width in bytes for memory operations.
    pub mem_size: u16,

    /// Prediction attached at fetch.
    pub prediction: BranchPrediction,
    /// Resolved branch direction, once executed.
    pub branch_taken: Option<bool>,
    /// Resolved branch target (or fall-through) address.
    pub branch_address: u64,

    /// Cancelled by a pipeline flush; dropped on next observation.
    pub flushed: bool,
    /// Execution semantics have run.
    pub executed: bool,
    /// Eligible for retirement at the ROB head.
    pub commit_ready: bool,
    /// Written back; macro-op grouping promotes this to `commit_ready`.
    pub waiting_commit: bool,
    /// Fault raised by decode or execute, surfaced at retirement.
    pub exception: Option<Fault>,
    /// Outcome of a store-conditional, supplied by the memory interface.
    pub cond_store_result: Option<bool>,
}

impl Instruction {
    /// Creates a blank instruction for the given opcode/group at an address.
    pub fn new(opcode: Opcode, group: u16, address: u64) -> Self {
        Self {
            instruction_id: 0,
            micro_op_index: 0,
            sequence_id: 0,
            address,
            opcode,
            group,
            latency: 1,
            stall_cycles: 1,
            supported_ports: Vec::new(),
            is_load: false,
            is_store: false,
            is_store_address: false,
            is_store_data: false,
            is_store_cond: false,
            is_load_reserved: false,
            is_branch: false,
            source_registers: Vec::new(),
            operands: Vec::new(),
            imm: 0,
            destinations: Vec::new(),
            results: Vec::new(),
            addresses: Vec::new(),
            supplied_data: Vec::new(),
            store_data: Vec::new(),
            mem_size: 0,
            prediction: BranchPrediction::default(),
            branch_taken: None,
            branch_address: 0,
            flushed: false,
            executed: false,
            commit_ready: false,
            waiting_commit: false,
            exception: None,
            cond_store_result: None,
        }
    }

    /// Adds a source register with an unsupplied operand slot.
    pub fn add_source(&mut self, reg: Register) {
        self.source_registers.push(reg);
        self.operands.push(None);
    }

    /// True if operand `index` has been supplied.
    #[inline]
    pub fn is_operand_ready(&self, index: usize) -> bool {
        self.operands[index].is_some()
    }

    /// Supplies a value for operand `index`.
    pub fn supply_operand(&mut self, index: usize, value: RegisterValue) {
        debug_assert!(self.operands[index].is_none());
        self.operands[index] = Some(value);
    }

    /// True once every operand has been supplied.
    pub fn can_execute(&self) -> bool {
        self.operands.iter().all(Option::is_some)
    }

    /// Reads a supplied operand as a u64. Panics in debug if unsupplied.
    fn operand_u64(&self, index: usize) -> u64 {
        self.operands[index]
            .as_ref()
            .map(RegisterValue::as_u64)
            .unwrap_or(0)
    }

    /// Computes the memory access targets for a load or store.
    ///
    /// Targets are derived from the first operand plus the immediate; the
    /// slot bookkeeping for supplied data is sized alongside.
    pub fn generate_addresses(&mut self) -> &[MemoryAccessTarget] {
        if !(self.is_load || self.is_store) {
            return &self.addresses;
        }
        if self.addresses.is_empty() {
            let base = self.operand_u64(0);
            let vaddr = base.wrapping_add(self.imm as u64);
            self.addresses.push(MemoryAccessTarget::new(vaddr, self.mem_size));
            self.supplied_data.push(None);
        }
        &self.addresses
    }

    /// Supplies memory data for the target starting at `addr`.
    ///
    /// An empty value signals a data abort; the instruction records the fault
    /// and will surface it at retirement.
    pub fn supply_data(&mut self, addr: u64, value: RegisterValue) {
        for (i, target) in self.addresses.iter().enumerate() {
            if target.vaddr == addr {
                if value.is_empty() {
                    self.exception = Some(Fault::DataAbort(addr));
                    // Mark the slot filled so the load can drain.
                    self.supplied_data[i] = Some(RegisterValue::zeroed(target.size));
                } else {
                    self.supplied_data[i] = Some(value);
                }
                return;
            }
        }
        debug_assert!(false, "supplied data for unknown address {:#x}", addr);
    }

    /// True once every generated address has received its data.
    pub fn has_all_data(&self) -> bool {
        !self.addresses.is_empty() && self.supplied_data.iter().all(Option::is_some)
    }

    /// The data this store will write, parallel to its addresses.
    pub fn data(&self) -> &[RegisterValue] {
        &self.store_data
    }

    /// Records the outcome of a store-conditional once all write responses
    /// have arrived, and makes the instruction eligible for writeback.
    pub fn update_cond_store_result(&mut self, success: bool) {
        debug_assert!(self.is_store_cond);
        self.cond_store_result = Some(success);
        if !self.destinations.is_empty() {
            self.results = vec![RegisterValue::from_u64(if success { 0 } else { 1 })];
        }
    }

    /// True once a store-conditional knows its outcome.
    pub fn is_cond_result_ready(&self) -> bool {
        self.cond_store_result.is_some()
    }

    /// Runs the execution semantics for this instruction.
    ///
    /// Arithmetic consumes supplied operands; loads consume supplied memory
    /// data; stores latch their write data; branches resolve direction and
    /// target.
    pub fn execute(&mut self) {
        debug_assert!(!self.executed);
        self.executed = true;
        match self.opcode {
            Opcode::Addi => {
                let v = self.operand_u64(0).wrapping_add(self.imm as u64);
                self.results = vec![RegisterValue::from_u64(v)];
            }
            Opcode::Add => {
                let v = self.operand_u64(0).wrapping_add(self.operand_u64(1));
                self.results = vec![RegisterValue::from_u64(v)];
            }
            Opcode::Sub => {
                let v = self.operand_u64(0).wrapping_sub(self.operand_u64(1));
                self.results = vec![RegisterValue::from_u64(v)];
            }
            Opcode::Mul => {
                let v = self.operand_u64(0).wrapping_mul(self.operand_u64(1));
                self.results = vec![RegisterValue::from_u64(v)];
            }
            Opcode::Div => {
                let a = self.operand_u64(0) as i64;
                let b = self.operand_u64(1) as i64;
                let v = if b == 0 { -1i64 } else { a.wrapping_div(b) };
                self.results = vec![RegisterValue::from_u64(v as u64)];
            }
            Opcode::Beq | Opcode::Bne => {
                let equal = self.operand_u64(0) == self.operand_u64(1);
                let taken = if self.opcode == Opcode::Beq { equal } else { !equal };
                self.branch_taken = Some(taken);
                self.branch_address = if taken {
                    self.address.wrapping_add(self.imm as u64)
                } else {
                    self.address.wrapping_add(4)
                };
            }
            Opcode::Jal => {
                self.branch_taken = Some(true);
                self.branch_address = self.address.wrapping_add(self.imm as u64);
                if !self.destinations.is_empty() {
                    self.results = vec![RegisterValue::from_u64(self.address.wrapping_add(4))];
                }
            }
            Opcode::Ld | Opcode::LrD => {
                debug_assert!(self.has_all_data());
                let mut merged = RegisterValue::empty();
                for chunk in self.supplied_data.iter().flatten() {
                    merged.append(chunk);
                }
                self.results = vec![merged];
            }
            Opcode::Sd | Opcode::ScD => {
                // Latch the value to be written, one element per target.
                let value = self.operand_u64(1);
                self.store_data = self
                    .addresses
                    .iter()
                    .map(|_| RegisterValue::from_u64(value))
                    .collect();
            }
            Opcode::Ecall => {
                self.exception = Some(Fault::SyscallRequest);
            }
            Opcode::Invalid => {
                // The fault was attached at predecode; nothing to compute.
            }
        }
        if self.destinations.is_empty() {
            // A dropped x0 destination discards the result.
            self.results.clear();
        }
    }

    /// True if the resolved branch outcome disagrees with the prediction.
    pub fn was_mispredicted(&self) -> bool {
        debug_assert!(self.is_branch && self.branch_taken.is_some());
        let taken = self.branch_taken.unwrap_or(false);
        if taken != self.prediction.taken {
            return true;
        }
        taken && self.branch_address != self.prediction.target
    }

    /// Marks this instruction as cancelled by a flush.
    pub fn set_flushed(&mut self) {
        self.flushed = true;
    }

    /// A fault has been recorded on this instruction.
    #[inline]
    pub fn exception_encountered(&self) -> bool {
        self.exception.is_some()
    }
}

/// Wraps an instruction into a shared handle.
pub fn insn_ref(insn: Instruction) -> InsnRef {
    Rc::new(RefCell::new(insn))
}

/// Read-only view of the architectural register state, handed to exception
/// handlers instead of the whole core.
pub trait ArchRegisterSource {
    /// Reads the current architectural value of `reg`.
    fn read(&self, reg: Register) -> RegisterValue;
}

/// State mutations an exception handler wants applied on completion.
#[derive(Clone, Debug, Default)]
pub struct StateChange {
    /// Architectural register writes to apply.
    pub registers: Vec<(Register, RegisterValue)>,
    /// Memory writes to apply (untimed, no bandwidth accounting).
    pub memory: Vec<(MemoryAccessTarget, RegisterValue)>,
}

/// The outcome of handling an exception.
#[derive(Clone, Debug, Default)]
pub struct ExceptionResult {
    /// Unrecoverable; the core halts.
    pub fatal: bool,
    /// Address execution should resume from.
    pub instruction_address: u64,
    /// Register/memory changes to apply before resuming.
    pub state_change: StateChange,
    /// The core should idle after applying the result (syscall-driven
    /// context switch).
    pub idle_after_syscall: bool,
    /// Program requested termination with this status.
    pub exit_code: Option<u64>,
}

/// An in-progress exception resolution. May take multiple ticks.
pub trait ExceptionHandler {
    /// Advances the handler one tick. Returns true once the result is ready.
    fn tick(&mut self, regs: &dyn ArchRegisterSource) -> bool;

    /// The outcome; valid once `tick` has returned true.
    fn result(&self) -> ExceptionResult;
}

/// The architecture collaborator the core compiles against.
pub trait Architecture {
    /// Architectural register count per bank, indexed by bank.
    fn architectural_register_counts(&self) -> [u16; crate::common::RegisterBank::COUNT];

    /// Decodes one instruction word at `addr` into its micro-op expansion.
    ///
    /// Invalid encodings and misaligned addresses yield a single exception
    /// micro-op that carries the fault to retirement.
    fn predecode(&mut self, encoding: u32, addr: u64) -> MacroOp;

    /// Fills latency, throughput, and supported ports on a decoded micro-op
    /// from the configured execution tables.
    fn annotate(&self, insn: &mut Instruction);

    /// Forwarding latency between a producer and consumer group.
    ///
    /// `0` permits same-cycle forwarding, a positive value delays the
    /// wake-up, and `-1` forbids forwarding entirely (the consumer reads the
    /// register file once the value commits to it).
    fn forward_latency(&self, producer_group: u16, consumer_group: u16) -> i8;

    /// Initial architectural register state for a fresh context.
    fn initial_state(&self) -> Vec<(Register, RegisterValue)>;

    /// Refreshes system timer registers with the current cycle count.
    fn update_system_timer(&self, regfile: &mut RegisterFileSet, ticks: u64);

    /// Builds an exception handler for a faulted instruction.
    fn handle_exception(&self, insn: &InsnRef) -> Box<dyn ExceptionHandler>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::RegisterBank;

    fn add_insn() -> Instruction {
        let mut insn = Instruction::new(Opcode::Add, groups::INT_SIMPLE, 0x100);
        insn.add_source(Register::general(1));
        insn.add_source(Register::general(2));
        insn.destinations.push(Register::general(3));
        insn
    }

    #[test]
    fn test_operand_supply_gates_execution() {
        let mut insn = add_insn();
        assert!(!insn.can_execute());
        insn.supply_operand(0, RegisterValue::from_u64(40));
        assert!(!insn.can_execute());
        insn.supply_operand(1, RegisterValue::from_u64(2));
        assert!(insn.can_execute());

        insn.execute();
        assert_eq!(insn.results[0].as_u64(), 42);
    }

    #[test]
    fn test_branch_resolution_and_misprediction() {
        let mut insn = Instruction::new(Opcode::Beq, groups::BRANCH, 0x1000);
        insn.is_branch = true;
        insn.imm = 16;
        insn.add_source(Register::general(1));
        insn.add_source(Register::general(2));
        insn.supply_operand(0, RegisterValue::from_u64(7));
        insn.supply_operand(1, RegisterValue::from_u64(7));

        insn.execute();
        assert_eq!(insn.branch_taken, Some(true));
        assert_eq!(insn.branch_address, 0x1010);
        // Predicted not-taken, so this is a misprediction.
        assert!(insn.was_mispredicted());
    }

    #[test]
    fn test_load_data_reassembly() {
        let mut insn = Instruction::new(Opcode::Ld, groups::LOAD, 0);
        insn.is_load = true;
        insn.mem_size = 8;
        insn.add_source(Register::general(10));
        insn.supply_operand(0, RegisterValue::from_u64(0x200));
        insn.generate_addresses();
        assert_eq!(insn.addresses[0].vaddr, 0x200);

        insn.supply_data(0x200, RegisterValue::from_u64(0xDEAD));
        assert!(insn.has_all_data());
        insn.execute();
        assert_eq!(insn.results[0].as_u64(), 0xDEAD);
    }

    #[test]
    fn test_empty_data_marks_abort() {
        let mut insn = Instruction::new(Opcode::Ld, groups::LOAD, 0);
        insn.is_load = true;
        insn.mem_size = 8;
        insn.add_source(Register::new(RegisterBank::General, 10));
        insn.supply_operand(0, RegisterValue::from_u64(0x300));
        insn.generate_addresses();

        insn.supply_data(0x300, RegisterValue::empty());
        assert!(insn.has_all_data());
        assert_eq!(insn.exception, Some(Fault::DataAbort(0x300)));
    }

    #[test]
    fn test_cond_store_result() {
        let mut insn = Instruction::new(Opcode::ScD, groups::STORE, 0);
        insn.is_store = true;
        insn.is_store_cond = true;
        insn.destinations.push(Register::general(6));
        assert!(!insn.is_cond_result_ready());
        insn.update_cond_store_result(true);
        assert!(insn.is_cond_result_ready());
        assert_eq!(insn.results[0].as_u64(), 0);
    }
}
