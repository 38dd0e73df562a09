//! Register alias table.
//!
//! Maps architectural registers to physical tags, tracks the free list per
//! bank, and keeps a rename history so mappings can be rewound during a
//! flush. Every physical tag is in exactly one of: the free list, the
//! current mapping, or the history.

use std::collections::VecDeque;

use crate::common::{Register, RegisterBank};
use crate::config::RegisterSet;

/// One recorded rename, kept until its instruction commits or is rewound.
#[derive(Clone, Copy, Debug)]
struct Rename {
    /// Architectural register that was renamed.
    arch_tag: u16,
    /// Physical tag allocated by the rename.
    phys_tag: u16,
    /// Physical tag the architectural register mapped to before.
    prev_phys: u16,
}

struct Bank {
    /// Architectural tag to current physical tag.
    mapping: Vec<u16>,
    /// Free physical tags.
    free: VecDeque<u16>,
    /// Renames in program order; front is oldest.
    history: VecDeque<Rename>,
}

/// The register alias table.
pub struct RegisterAliasTable {
    banks: Vec<Bank>,
}

impl RegisterAliasTable {
    /// Builds a table where each bank's architectural registers 0..N map to
    /// physical tags 0..N and the remaining physical tags are free.
    ///
    /// `arch_counts[bank]` gives the architectural register count per bank;
    /// physical counts come from the register set config.
    pub fn new(arch_counts: &[u16; RegisterBank::COUNT], register_set: &RegisterSet) -> Self {
        let banks = (0..RegisterBank::COUNT)
            .map(|i| {
                let arch = arch_counts[i];
                let phys = register_set.count_for(i);
                debug_assert!(phys >= arch, "physical bank smaller than architectural");
                Bank {
                    mapping: (0..arch).collect(),
                    free: (arch..phys).collect(),
                    history: VecDeque::new(),
                }
            })
            .collect();
        Self { banks }
    }

    /// Resets all mappings and history. Used when scheduling a new context.
    pub fn reset(&mut self, arch_counts: &[u16; RegisterBank::COUNT], register_set: &RegisterSet) {
        *self = Self::new(arch_counts, register_set);
    }

    /// The number of free physical tags in a bank.
    pub fn free_count(&self, bank: RegisterBank) -> usize {
        self.banks[bank.index()].free.len()
    }

    /// The current physical mapping of an architectural register.
    pub fn get_mapping(&self, arch_reg: Register) -> Register {
        let bank = &self.banks[arch_reg.bank.index()];
        Register::new(arch_reg.bank, bank.mapping[arch_reg.tag as usize])
    }

    /// Allocates a fresh physical tag for a destination write to `arch_reg`,
    /// recording the prior mapping for rewind. Returns `None` when the bank's
    /// free list is empty; the caller stalls.
    pub fn allocate(&mut self, arch_reg: Register) -> Option<Register> {
        let bank = &mut self.banks[arch_reg.bank.index()];
        let phys_tag = bank.free.pop_front()?;
        let prev_phys = bank.mapping[arch_reg.tag as usize];
        bank.history.push_back(Rename {
            arch_tag: arch_reg.tag,
            phys_tag,
            prev_phys,
        });
        bank.mapping[arch_reg.tag as usize] = phys_tag;
        Some(Register::new(arch_reg.bank, phys_tag))
    }

    /// Commits the rename that produced `phys_reg`: the oldest matching
    /// history entry is retired and the previous physical tag is freed.
    pub fn commit(&mut self, phys_reg: Register) {
        let bank = &mut self.banks[phys_reg.bank.index()];
        let pos = bank
            .history
            .iter()
            .position(|r| r.phys_tag == phys_reg.tag);
        debug_assert!(pos.is_some(), "commit of unknown rename {}", phys_reg);
        if let Some(pos) = pos {
            let rename = bank.history.remove(pos).unwrap();
            bank.free.push_back(rename.prev_phys);
        }
    }

    /// Rewinds the rename that produced `phys_reg`: the mapping reverts to
    /// the previous physical tag and the allocated tag returns to the free
    /// list. Flushes call this youngest-first so the history unwinds in
    /// order.
    pub fn rewind(&mut self, phys_reg: Register) {
        let bank = &mut self.banks[phys_reg.bank.index()];
        debug_assert!(
            bank.history
                .back()
                .map(|r| r.phys_tag == phys_reg.tag)
                .unwrap_or(false),
            "rewind out of order for {}",
            phys_reg
        );
        if let Some(rename) = bank.history.pop_back() {
            bank.mapping[rename.arch_tag as usize] = rename.prev_phys;
            bank.free.push_back(rename.phys_tag);
        }
    }

    /// Counts every physical tag accounted for in a bank: free list plus
    /// current mapping plus retained history entries.
    #[cfg(test)]
    fn accounted_tags(&self, bank: RegisterBank) -> usize {
        let bank = &self.banks[bank.index()];
        bank.free.len() + bank.mapping.len() + bank.history.len()
    }
}
