//! RV64I-subset architecture.
//!
//! A compact RISC-V integer subset sufficient to drive the pipeline:
//! ADDI, ADD, SUB, MUL, DIV, BEQ, BNE, JAL, LD, SD, LR.D, SC.D, ECALL.
//! Decoded templates are cached per core; entries are immutable once built.

use std::collections::HashMap;

use crate::common::{Fault, Register, RegisterValue};
use crate::config::Config;
use crate::isa::{
    groups, insn_ref, ArchRegisterSource, Architecture, ExceptionHandler, ExceptionResult,
    ExecutionInfo, Instruction, InsnRef, MacroOp, Opcode, StateChange,
};
use crate::regfile::RegisterFileSet;

/// System register 0: the cycle timer updated by the core every tick.
pub const SYSREG_TIMER: u16 = 0;

/// Syscall number for process exit.
const SYSCALL_EXIT: u64 = 93;
/// Syscall number for getpid.
const SYSCALL_GETPID: u64 = 172;

/// The bundled RV64I-subset architecture collaborator.
pub struct Rv64Architecture {
    /// Per-group execution parameters, resolved from config.
    exec_info: HashMap<u16, ExecutionInfo>,
    /// Per-opcode port overrides, resolved from config.
    opcode_ports: HashMap<String, Vec<u8>>,
    /// Decode cache: raw encoding to immutable decoded template.
    decode_cache: HashMap<u32, Instruction>,
    /// Next macro-op id, assigned in program order at decode.
    next_instruction_id: u64,
    /// Matrix register rows, derived from the streaming vector length.
    matrix_rows: u16,
}

impl Rv64Architecture {
    /// Builds the architecture, resolving execution tables from `config`.
    pub fn new(config: &Config) -> Self {
        let mut exec_info: HashMap<u16, ExecutionInfo> = HashMap::new();

        // Port support per group comes from the port routing table.
        for (port, port_config) in config.ports.iter().enumerate() {
            for &group in &port_config.instruction_group_support {
                exec_info
                    .entry(group)
                    .or_insert_with(|| ExecutionInfo {
                        latency: 1,
                        stall_cycles: 1,
                        supported_ports: Vec::new(),
                    })
                    .supported_ports
                    .push(port as u8);
            }
        }

        // Latency/throughput overrides.
        for entry in &config.latencies {
            for &group in &entry.instruction_groups {
                if let Some(info) = exec_info.get_mut(&group) {
                    info.latency = entry.execution_latency.max(1);
                    info.stall_cycles = entry.execution_throughput.max(1);
                }
            }
        }

        let mut opcode_ports: HashMap<String, Vec<u8>> = HashMap::new();
        for (port, port_config) in config.ports.iter().enumerate() {
            for opcode in &port_config.instruction_opcode_support {
                opcode_ports
                    .entry(opcode.clone())
                    .or_default()
                    .push(port as u8);
            }
        }

        // Each matrix row covers 64 bits of the streaming vector.
        let matrix_rows = (config.core.streaming_vector_length / 64).max(1) as u16;

        Self {
            exec_info,
            opcode_ports,
            decode_cache: HashMap::new(),
            next_instruction_id: 0,
            matrix_rows,
        }
    }

    /// Decodes one instruction word into a template, or an `Invalid` template
    /// carrying the illegal-instruction fault.
    fn decode(encoding: u32) -> Instruction {
        let opcode_bits = encoding & 0x7F;
        let rd = ((encoding >> 7) & 0x1F) as u16;
        let funct3 = (encoding >> 12) & 0x7;
        let rs1 = ((encoding >> 15) & 0x1F) as u16;
        let rs2 = ((encoding >> 20) & 0x1F) as u16;
        let funct7 = encoding >> 25;

        let i_imm = ((encoding as i32) >> 20) as i64;
        let s_imm = ((((encoding >> 25) << 5) | ((encoding >> 7) & 0x1F)) as i32) << 20 >> 20;
        let b_imm = {
            let imm = ((encoding >> 31) << 12)
                | (((encoding >> 7) & 1) << 11)
                | (((encoding >> 25) & 0x3F) << 5)
                | (((encoding >> 8) & 0xF) << 1);
            ((imm as i32) << 19 >> 19) as i64
        };
        let j_imm = {
            let imm = ((encoding >> 31) << 20)
                | (((encoding >> 12) & 0xFF) << 12)
                | (((encoding >> 20) & 1) << 11)
                | (((encoding >> 21) & 0x3FF) << 1);
            ((imm as i32) << 11 >> 11) as i64
        };

        match (opcode_bits, funct3, funct7) {
            (0x13, 0, _) => {
                let mut insn = Instruction::new(Opcode::Addi, groups::INT_SIMPLE, 0);
                insn.add_source(Register::general(rs1));
                insn.imm = i_imm;
                if rd != 0 {
                    insn.destinations.push(Register::general(rd));
                }
                insn
            }
            (0x33, 0, 0x00) | (0x33, 0, 0x20) | (0x33, 0, 0x01) | (0x33, 4, 0x01) => {
                let (op, group) = match (funct3, funct7) {
                    (0, 0x00) => (Opcode::Add, groups::INT_SIMPLE),
                    (0, 0x20) => (Opcode::Sub, groups::INT_SIMPLE),
                    (0, 0x01) => (Opcode::Mul, groups::INT_MUL),
                    _ => (Opcode::Div, groups::INT_DIV),
                };
                let mut insn = Instruction::new(op, group, 0);
                insn.add_source(Register::general(rs1));
                insn.add_source(Register::general(rs2));
                if rd != 0 {
                    insn.destinations.push(Register::general(rd));
                }
                insn
            }
            (0x63, 0, _) | (0x63, 1, _) => {
                let op = if funct3 == 0 { Opcode::Beq } else { Opcode::Bne };
                let mut insn = Instruction::new(op, groups::BRANCH, 0);
                insn.is_branch = true;
                insn.add_source(Register::general(rs1));
                insn.add_source(Register::general(rs2));
                insn.imm = b_imm;
                insn
            }
            (0x6F, _, _) => {
                let mut insn = Instruction::new(Opcode::Jal, groups::BRANCH, 0);
                insn.is_branch = true;
                insn.imm = j_imm;
                if rd != 0 {
                    insn.destinations.push(Register::general(rd));
                }
                insn
            }
            (0x03, 3, _) => {
                let mut insn = Instruction::new(Opcode::Ld, groups::LOAD, 0);
                insn.is_load = true;
                insn.mem_size = 8;
                insn.add_source(Register::general(rs1));
                insn.imm = i_imm;
                if rd != 0 {
                    insn.destinations.push(Register::general(rd));
                }
                insn
            }
            (0x23, 3, _) => {
                let mut insn = Instruction::new(Opcode::Sd, groups::STORE, 0);
                insn.is_store = true;
                insn.is_store_address = true;
                insn.is_store_data = true;
                insn.mem_size = 8;
                insn.add_source(Register::general(rs1));
                insn.add_source(Register::general(rs2));
                insn.imm = s_imm as i64;
                insn
            }
            (0x2F, 3, _) if funct7 >> 2 == 0x02 && rs2 == 0 => {
                let mut insn = Instruction::new(Opcode::LrD, groups::LOAD, 0);
                insn.is_load = true;
                insn.is_load_reserved = true;
                insn.mem_size = 8;
                insn.add_source(Register::general(rs1));
                if rd != 0 {
                    insn.destinations.push(Register::general(rd));
                }
                insn
            }
            (0x2F, 3, _) if funct7 >> 2 == 0x03 => {
                let mut insn = Instruction::new(Opcode::ScD, groups::STORE, 0);
                insn.is_store = true;
                insn.is_store_address = true;
                insn.is_store_data = true;
                insn.is_store_cond = true;
                insn.mem_size = 8;
                insn.add_source(Register::general(rs1));
                insn.add_source(Register::general(rs2));
                if rd != 0 {
                    insn.destinations.push(Register::general(rd));
                }
                insn
            }
            (0x73, 0, _) if encoding == 0x0000_0073 => {
                Instruction::new(Opcode::Ecall, groups::SYSTEM, 0)
            }
            _ => {
                let mut insn = Instruction::new(Opcode::Invalid, groups::INT_SIMPLE, 0);
                insn.exception = Some(Fault::IllegalInstruction(encoding));
                insn
            }
        }
    }
}

impl Architecture for Rv64Architecture {
    fn architectural_register_counts(&self) -> [u16; crate::common::RegisterBank::COUNT] {
        // General, float, predicate, flags, system, matrix.
        [32, 32, 8, 1, 8, self.matrix_rows]
    }

    fn predecode(&mut self, encoding: u32, addr: u64) -> MacroOp {
        let instruction_id = self.next_instruction_id;
        self.next_instruction_id += 1;

        let mut insn = if addr % 4 != 0 {
            let mut bad = Instruction::new(Opcode::Invalid, groups::INT_SIMPLE, 0);
            bad.exception = Some(Fault::MisalignedPc(addr));
            bad
        } else {
            self.decode_cache
                .entry(encoding)
                .or_insert_with(|| Self::decode(encoding))
                .clone()
        };

        insn.address = addr;
        insn.instruction_id = instruction_id;
        insn.micro_op_index = 0;
        self.annotate(&mut insn);
        vec![insn_ref(insn)]
    }

    fn annotate(&self, insn: &mut Instruction) {
        if let Some(info) = self.exec_info.get(&insn.group) {
            insn.latency = info.latency;
            insn.stall_cycles = info.stall_cycles;
            insn.supported_ports = info.supported_ports.clone();
        }
        if let Some(ports) = self.opcode_ports.get(&format!("{:?}", insn.opcode)) {
            insn.supported_ports = ports.clone();
        }
    }

    fn forward_latency(&self, producer_group: u16, _consumer_group: u16) -> i8 {
        match producer_group {
            // Divide results come from the register file only.
            groups::INT_DIV => -1,
            // Multiplies forward a cycle late.
            groups::INT_MUL => 1,
            _ => 0,
        }
    }

    fn initial_state(&self) -> Vec<(Register, RegisterValue)> {
        vec![(Register::system(SYSREG_TIMER), RegisterValue::from_u64(0))]
    }

    fn update_system_timer(&self, regfile: &mut RegisterFileSet, ticks: u64) {
        regfile.set(Register::system(SYSREG_TIMER), RegisterValue::from_u64(ticks));
    }

    fn handle_exception(&self, insn: &InsnRef) -> Box<dyn ExceptionHandler> {
        let insn = insn.borrow();
        Box::new(Rv64ExceptionHandler {
            fault: insn.exception.clone().unwrap_or(Fault::SyscallRequest),
            address: insn.address,
            done: false,
            result: ExceptionResult::default(),
        })
    }
}

/// Resolves faults for the RV64 subset: syscalls become state changes or an
/// exit, everything else is fatal.
struct Rv64ExceptionHandler {
    fault: Fault,
    address: u64,
    done: bool,
    result: ExceptionResult,
}

impl ExceptionHandler for Rv64ExceptionHandler {
    fn tick(&mut self, regs: &dyn ArchRegisterSource) -> bool {
        if self.done {
            return true;
        }
        self.result = match self.fault {
            Fault::SyscallRequest => {
                let number = regs.read(Register::general(17)).as_u64();
                let arg0 = regs.read(Register::general(10)).as_u64();
                match number {
                    SYSCALL_EXIT => ExceptionResult {
                        fatal: false,
                        instruction_address: self.address + 4,
                        state_change: StateChange::default(),
                        idle_after_syscall: false,
                        exit_code: Some(arg0),
                    },
                    SYSCALL_GETPID => ExceptionResult {
                        fatal: false,
                        instruction_address: self.address + 4,
                        state_change: StateChange {
                            registers: vec![(Register::general(10), RegisterValue::from_u64(1))],
                            memory: Vec::new(),
                        },
                        idle_after_syscall: false,
                        exit_code: None,
                    },
                    _ => ExceptionResult {
                        fatal: true,
                        ..ExceptionResult::default()
                    },
                }
            }
            _ => ExceptionResult {
                fatal: true,
                ..ExceptionResult::default()
            },
        };
        self.done = true;
        true
    }

    fn result(&self) -> ExceptionResult {
        debug_assert!(self.done);
        self.result.clone()
    }
}

/// Instruction word encoders for tests and demo programs.
pub mod asm {
    /// `addi rd, rs1, imm`
    pub fn addi(rd: u32, rs1: u32, imm: i32) -> u32 {
        ((imm as u32) << 20) | (rs1 << 15) | (rd << 7) | 0x13
    }

    /// `add rd, rs1, rs2`
    pub fn add(rd: u32, rs1: u32, rs2: u32) -> u32 {
        (rs2 << 20) | (rs1 << 15) | (rd << 7) | 0x33
    }

    /// `sub rd, rs1, rs2`
    pub fn sub(rd: u32, rs1: u32, rs2: u32) -> u32 {
        (0x20 << 25) | (rs2 << 20) | (rs1 << 15) | (rd << 7) | 0x33
    }

    /// `mul rd, rs1, rs2`
    pub fn mul(rd: u32, rs1: u32, rs2: u32) -> u32 {
        (0x01 << 25) | (rs2 << 20) | (rs1 << 15) | (rd << 7) | 0x33
    }

    /// `div rd, rs1, rs2`
    pub fn div(rd: u32, rs1: u32, rs2: u32) -> u32 {
        (0x01 << 25) | (rs2 << 20) | (4 << 12) | (rs1 << 15) | (rd << 7) | 0x33
    }

    /// Encodes a B-type immediate into the branch instruction layout.
    fn b_type(imm: i32, rs1: u32, rs2: u32, funct3: u32) -> u32 {
        let imm = imm as u32;
        (((imm >> 12) & 1) << 31)
            | (((imm >> 5) & 0x3F) << 25)
            | (rs2 << 20)
            | (rs1 << 15)
            | (funct3 << 12)
            | (((imm >> 1) & 0xF) << 8)
            | (((imm >> 11) & 1) << 7)
            | 0x63
    }

    /// `beq rs1, rs2, offset`
    pub fn beq(rs1: u32, rs2: u32, offset: i32) -> u32 {
        b_type(offset, rs1, rs2, 0)
    }

    /// `bne rs1, rs2, offset`
    pub fn bne(rs1: u32, rs2: u32, offset: i32) -> u32 {
        b_type(offset, rs1, rs2, 1)
    }

    /// `jal rd, offset`
    pub fn jal(rd: u32, offset: i32) -> u32 {
        let imm = offset as u32;
        (((imm >> 20) & 1) << 31)
            | (((imm >> 1) & 0x3FF) << 21)
            | (((imm >> 11) & 1) << 20)
            | (((imm >> 12) & 0xFF) << 12)
            | (rd << 7)
            | 0x6F
    }

    /// `ld rd, imm(rs1)`
    pub fn ld(rd: u32, rs1: u32, imm: i32) -> u32 {
        ((imm as u32) << 20) | (rs1 << 15) | (3 << 12) | (rd << 7) | 0x03
    }

    /// `sd rs2, imm(rs1)`
    pub fn sd(rs2: u32, rs1: u32, imm: i32) -> u32 {
        let imm = imm as u32;
        (((imm >> 5) & 0x7F) << 25)
            | (rs2 << 20)
            | (rs1 << 15)
            | (3 << 12)
            | ((imm & 0x1F) << 7)
            | 0x23
    }

    /// `lr.d rd, (rs1)`
    pub fn lr_d(rd: u32, rs1: u32) -> u32 {
        (0x02 << 27) | (rs1 << 15) | (3 << 12) | (rd << 7) | 0x2F
    }

    /// `sc.d rd, rs2, (rs1)`
    pub fn sc_d(rd: u32, rs1: u32, rs2: u32) -> u32 {
        (0x03 << 27) | (rs2 << 20) | (rs1 << 15) | (3 << 12) | (rd << 7) | 0x2F
    }

    /// `ecall`
    pub fn ecall() -> u32 {
        0x0000_0073
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::RegisterBank;

    fn arch() -> Rv64Architecture {
        Rv64Architecture::new(&Config::default().with_default_units())
    }

    #[test]
    fn test_decode_addi() {
        let mut arch = arch();
        let uops = arch.predecode(asm::addi(5, 0, 42), 0x1000);
        assert_eq!(uops.len(), 1);
        let insn = uops[0].borrow();
        assert_eq!(insn.opcode, Opcode::Addi);
        assert_eq!(insn.imm, 42);
        assert_eq!(insn.destinations, vec![Register::general(5)]);
        assert_eq!(insn.address, 0x1000);
        assert!(!insn.supported_ports.is_empty());
    }

    #[test]
    fn test_decode_negative_branch_offset() {
        let mut arch = arch();
        let uops = arch.predecode(asm::bne(1, 2, -8), 0x1000);
        let insn = uops[0].borrow();
        assert_eq!(insn.opcode, Opcode::Bne);
        assert_eq!(insn.imm, -8);
        assert!(insn.is_branch);
    }

    #[test]
    fn test_decode_store_flags() {
        let mut arch = arch();
        let uops = arch.predecode(asm::sd(5, 10, 0x18), 0);
        let insn = uops[0].borrow();
        assert_eq!(insn.opcode, Opcode::Sd);
        assert!(insn.is_store && insn.is_store_address && insn.is_store_data);
        assert_eq!(insn.imm, 0x18);
    }

    #[test]
    fn test_decode_atomics() {
        let mut arch = arch();
        let lr = arch.predecode(asm::lr_d(5, 10), 0);
        assert!(lr[0].borrow().is_load_reserved);
        let sc = arch.predecode(asm::sc_d(6, 10, 5), 4);
        let sc = sc[0].borrow();
        assert!(sc.is_store_cond);
        assert_eq!(sc.destinations, vec![Register::general(6)]);
    }

    #[test]
    fn test_illegal_encoding_yields_exception_uop() {
        let mut arch = arch();
        let uops = arch.predecode(0xFFFF_FFFF, 0);
        let insn = uops[0].borrow();
        assert_eq!(insn.exception, Some(Fault::IllegalInstruction(0xFFFF_FFFF)));
    }

    #[test]
    fn test_misaligned_pc_yields_exception_uop() {
        let mut arch = arch();
        let uops = arch.predecode(asm::addi(1, 0, 1), 0x1002);
        assert_eq!(uops[0].borrow().exception, Some(Fault::MisalignedPc(0x1002)));
    }

    #[test]
    fn test_instruction_ids_are_program_order() {
        let mut arch = arch();
        let a = arch.predecode(asm::addi(1, 0, 1), 0);
        let b = arch.predecode(asm::addi(2, 0, 2), 4);
        assert!(a[0].borrow().instruction_id < b[0].borrow().instruction_id);
    }

    #[test]
    fn test_decode_cache_reuses_templates() {
        let mut arch = arch();
        arch.predecode(asm::add(3, 1, 2), 0);
        arch.predecode(asm::add(3, 1, 2), 8);
        assert_eq!(arch.decode_cache.len(), 1);
    }

    #[test]
    fn test_x0_destination_dropped() {
        let mut arch = arch();
        let uops = arch.predecode(asm::jal(0, 16), 0);
        assert!(uops[0].borrow().destinations.is_empty());
    }

    #[test]
    fn test_opcode_port_override() {
        let mut config = Config::default().with_default_units();
        config.ports[1].instruction_opcode_support = vec!["Mul".to_string()];
        let mut arch = Rv64Architecture::new(&config);
        let uops = arch.predecode(asm::mul(3, 1, 2), 0);
        assert_eq!(uops[0].borrow().supported_ports, vec![1]);
    }

    #[test]
    fn test_exit_syscall_handler() {
        struct Regs;
        impl ArchRegisterSource for Regs {
            fn read(&self, reg: Register) -> RegisterValue {
                match (reg.bank, reg.tag) {
                    (RegisterBank::General, 17) => RegisterValue::from_u64(93),
                    (RegisterBank::General, 10) => RegisterValue::from_u64(7),
                    _ => RegisterValue::from_u64(0),
                }
            }
        }

        let arch = arch();
        let mut insn = Instruction::new(Opcode::Ecall, groups::SYSTEM, 0x40);
        insn.exception = Some(Fault::SyscallRequest);
        let handle = insn_ref(insn);
        let mut handler = arch.handle_exception(&handle);
        assert!(handler.tick(&Regs));
        let result = handler.result();
        assert!(!result.fatal);
        assert_eq!(result.exit_code, Some(7));
    }
}
