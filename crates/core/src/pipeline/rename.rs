//! Rename unit.
//!
//! A pure in-order transform over the decode output: source operands take
//! their current physical mapping, destinations receive fresh physical tags,
//! and the instruction is reserved in the reorder buffer (acquiring its
//! sequence id) and, for memory operations, the load/store queue. Any
//! shortage (ROB space, queue space, free tags) stalls the input and bumps
//! the matching counter.

use crate::common::{Register, RegisterBank, RegisterValue};
use crate::isa::InsnRef;
use crate::pipeline::buffer::PipelineBuffer;
use crate::pipeline::lsq::LoadStoreQueue;
use crate::pipeline::rat::RegisterAliasTable;
use crate::pipeline::rob::ReorderBuffer;

/// The rename unit.
pub struct RenameUnit {
    allocation_stalls: [u64; RegisterBank::COUNT],
    rob_stalls: u64,
    lq_stalls: u64,
    sq_stalls: u64,
}

impl RenameUnit {
    /// Creates a rename unit.
    pub fn new() -> Self {
        Self {
            allocation_stalls: [0; RegisterBank::COUNT],
            rob_stalls: 0,
            lq_stalls: 0,
            sq_stalls: 0,
        }
    }

    /// Renames the instructions at the head of the input buffer.
    pub fn tick(
        &mut self,
        input: &mut PipelineBuffer<InsnRef>,
        output: &mut PipelineBuffer<InsnRef>,
        rob: &mut ReorderBuffer,
        rat: &mut RegisterAliasTable,
        lsq: &mut LoadStoreQueue,
    ) {
        if output.is_stalled() {
            input.stall(true);
            return;
        }
        input.stall(false);

        for slot in 0..input.width() {
            let Some(uop) = input.head_slots()[slot].clone() else {
                continue;
            };

            if rob.free_space() == 0 {
                self.rob_stalls += 1;
                input.stall(true);
                return;
            }
            let (is_load, is_store) = {
                let insn = uop.borrow();
                (insn.is_load, insn.is_store)
            };
            if is_load && lsq.load_space() == 0 {
                self.lq_stalls += 1;
                input.stall(true);
                return;
            }
            if is_store && lsq.store_space() == 0 {
                self.sq_stalls += 1;
                input.stall(true);
                return;
            }

            // All destination banks must have a free tag before any
            // allocation happens, so a stall never leaves partial renames.
            {
                let insn = uop.borrow();
                let mut needed = [0usize; RegisterBank::COUNT];
                for reg in &insn.destinations {
                    needed[reg.bank.index()] += 1;
                }
                for bank in RegisterBank::ALL {
                    if needed[bank.index()] > rat.free_count(bank) {
                        self.allocation_stalls[bank.index()] += 1;
                        input.stall(true);
                        return;
                    }
                }
            }

            {
                let mut insn = uop.borrow_mut();
                for i in 0..insn.source_registers.len() {
                    let reg = insn.source_registers[i];
                    if reg.bank == RegisterBank::General && reg.tag == 0 {
                        // Hardwired zero: supply directly, skip renaming.
                        if !insn.is_operand_ready(i) {
                            insn.supply_operand(i, RegisterValue::from_u64(0));
                        }
                        continue;
                    }
                    insn.source_registers[i] = rat.get_mapping(reg);
                }

                for i in 0..insn.destinations.len() {
                    let arch_reg = insn.destinations[i];
                    let phys = rat
                        .allocate(arch_reg)
                        .expect("free-tag availability checked above");
                    insn.destinations[i] = phys;
                }
            }

            rob.reserve(&uop);
            if is_load {
                lsq.add_load(&uop);
            }
            if is_store {
                lsq.add_store(&uop);
            }

            output.tail_slots()[slot] = Some(uop);
            input.head_slots()[slot] = None;
        }
    }

    /// Cycles stalled on destination-tag exhaustion, per bank.
    pub fn allocation_stalls(&self) -> u64 {
        self.allocation_stalls.iter().sum()
    }

    /// Cycles stalled on reorder buffer capacity.
    pub fn rob_stalls(&self) -> u64 {
        self.rob_stalls
    }

    /// Cycles stalled on load queue capacity.
    pub fn lq_stalls(&self) -> u64 {
        self.lq_stalls
    }

    /// Cycles stalled on store queue capacity.
    pub fn sq_stalls(&self) -> u64 {
        self.sq_stalls
    }
}

impl Default for RenameUnit {
    fn default() -> Self {
        Self::new()
    }
}
