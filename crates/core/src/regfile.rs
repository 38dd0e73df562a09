//! Physical register file banks.
//!
//! One value bank per [`RegisterBank`], sized from the configured physical
//! register counts. Written by the writeback unit (and the exception path),
//! read by dispatch/issue; the single-threaded tick order guarantees those
//! never interleave within a cycle.

use crate::common::{Register, RegisterBank, RegisterValue};
use crate::config::RegisterSet;

/// Typed banks of register values.
pub struct RegisterFileSet {
    banks: Vec<Vec<RegisterValue>>,
}

impl RegisterFileSet {
    /// Creates banks sized from the configured physical register counts.
    pub fn new(register_set: &RegisterSet) -> Self {
        let banks = (0..RegisterBank::COUNT)
            .map(|i| vec![RegisterValue::from_u64(0); register_set.count_for(i) as usize])
            .collect();
        Self { banks }
    }

    /// Reads the value of a register.
    pub fn get(&self, reg: Register) -> RegisterValue {
        self.banks[reg.bank.index()][reg.tag as usize]
    }

    /// Writes the value of a register.
    pub fn set(&mut self, reg: Register, value: RegisterValue) {
        self.banks[reg.bank.index()][reg.tag as usize] = value;
    }

    /// Number of physical registers in a bank.
    pub fn bank_size(&self, bank: RegisterBank) -> usize {
        self.banks[bank.index()].len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_round_trip() {
        let mut regfile = RegisterFileSet::new(&RegisterSet::default());
        let reg = Register::general(17);
        regfile.set(reg, RegisterValue::from_u64(0xABCD));
        assert_eq!(regfile.get(reg).as_u64(), 0xABCD);
    }

    #[test]
    fn test_banks_sized_from_config() {
        let mut set = RegisterSet::default();
        set.general_count = 48;
        let regfile = RegisterFileSet::new(&set);
        assert_eq!(regfile.bank_size(RegisterBank::General), 48);
    }
}
