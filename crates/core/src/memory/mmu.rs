//! Memory management unit.
//!
//! The pipeline-facing memory proxy: admits load/store instructions under
//! per-cycle request caps, fragments their accesses on cache-line boundaries,
//! drives translation, meters issued packets against byte bandwidth, and
//! reassembles split responses before handing data back to the instruction.

use std::collections::{HashMap, VecDeque};

use crate::common::{down_align, MemoryAccessTarget, RegisterValue};
use crate::config::{Config, SimulationMode};
use crate::isa::InsnRef;
use crate::memory::backend::MemoryInterface;
use crate::memory::packet::MemPacket;
use crate::memory::pagetable::{PageTable, Translation};

/// A completed instruction-fetch read.
#[derive(Clone, Debug)]
pub struct InstrReadResult {
    /// The fetched region.
    pub target: MemoryAccessTarget,
    /// Fetched bytes; empty on fault.
    pub data: RegisterValue,
}

struct LoadTracker {
    insn: InsnRef,
    packets_remaining: u16,
}

struct StoreTracker {
    insn: InsnRef,
    packets_remaining: u16,
    failed: bool,
}

/// The memory management unit.
pub struct Mmu {
    cache_line_width: u64,
    load_bandwidth: u64,
    store_bandwidth: u64,
    request_limit: usize,
    load_request_limit: usize,
    store_request_limit: usize,
    exclusive: bool,

    /// Admitted instructions whose packets have not all been issued yet.
    /// Front-to-back order is admission order.
    pending_loads: VecDeque<Vec<MemPacket>>,
    pending_stores: VecDeque<Vec<MemPacket>>,

    /// Data packets in flight (issued or parked), excluding instruction reads.
    pending_data_requests: u64,

    requested_loads: HashMap<u64, LoadTracker>,
    requested_stores: HashMap<u64, StoreTracker>,

    /// Read responses awaiting reassembly: seq id -> order id -> split slots.
    read_responses: HashMap<u64, HashMap<u16, Vec<Option<MemPacket>>>>,

    /// Requests parked on an unresolved translation, keyed by vaddr.
    pending_translations: HashMap<u64, Vec<MemPacket>>,

    completed_instr_reads: Vec<InstrReadResult>,

    backend: Box<dyn MemoryInterface>,
    page_table: Box<dyn PageTable>,
    tid: u64,
}

impl Mmu {
    /// Builds the MMU from config, a backend port, and a page table.
    ///
    /// Emulation mode lifts every bandwidth and request limit so each
    /// instruction is serviced in a single cycle.
    pub fn new(
        config: &Config,
        backend: Box<dyn MemoryInterface>,
        page_table: Box<dyn PageTable>,
    ) -> Self {
        let lsq = &config.lsq_memory_interface;
        let emulation = config.core.simulation_mode == SimulationMode::Emulation;
        Self {
            cache_line_width: config.memory_hierarchy.cache_line_width,
            load_bandwidth: if emulation { u64::MAX } else { lsq.load_bandwidth },
            store_bandwidth: if emulation { u64::MAX } else { lsq.store_bandwidth },
            request_limit: if emulation {
                usize::MAX
            } else {
                lsq.permitted_requests_per_cycle
            },
            load_request_limit: if emulation {
                usize::MAX
            } else {
                lsq.permitted_loads_per_cycle
            },
            store_request_limit: if emulation {
                usize::MAX
            } else {
                lsq.permitted_stores_per_cycle
            },
            exclusive: if emulation { true } else { lsq.exclusive },
            pending_loads: VecDeque::new(),
            pending_stores: VecDeque::new(),
            pending_data_requests: 0,
            requested_loads: HashMap::new(),
            requested_stores: HashMap::new(),
            read_responses: HashMap::new(),
            pending_translations: HashMap::new(),
            completed_instr_reads: Vec::new(),
            backend,
            page_table,
            tid: 0,
        }
    }

    /// Advances the MMU one cycle: issues admitted packets within the byte
    /// bandwidth for each type, ticks the backend, and handles responses.
    pub fn tick(&mut self) {
        if self.exclusive {
            // Exclusive access: serve whichever type currently holds
            // instructions. Admission guarantees they never coexist.
            let is_store = !self.pending_stores.is_empty();
            self.process_requests(is_store);
        } else {
            // Stores first, same as the LSQ's tie-break.
            self.process_requests(true);
            self.process_requests(false);
        }

        self.backend.tick();
        for response in self.backend.drain_responses() {
            self.handle_response(response);
        }
    }

    /// Admits a load instruction's accesses. Returns false when a cap would
    /// be violated; the LSQ retries next cycle.
    pub fn request_read(&mut self, uop: &InsnRef) -> bool {
        if self.exclusive && !self.pending_stores.is_empty() {
            return false;
        }
        if !self.exclusive
            && self.pending_loads.len() + self.pending_stores.len() >= self.request_limit
        {
            return false;
        }
        if self.pending_loads.len() >= self.load_request_limit {
            return false;
        }

        let (seq_id, targets, atomic) = {
            let insn = uop.borrow();
            (
                insn.sequence_id,
                insn.addresses.clone(),
                insn.is_load_reserved,
            )
        };

        let mut packets = Vec::new();
        for (order_id, target) in targets.iter().enumerate() {
            let splits = self.split_read(target, seq_id, order_id as u16);
            self.read_responses
                .entry(seq_id)
                .or_default()
                .insert(order_id as u16, vec![None; splits.len()]);
            packets.extend(splits);
        }
        if atomic {
            for pkt in &mut packets {
                pkt.atomic = true;
            }
        }

        self.pending_data_requests += packets.len() as u64;
        self.requested_loads.insert(
            seq_id,
            LoadTracker {
                insn: uop.clone(),
                packets_remaining: packets.len() as u16,
            },
        );
        self.pending_loads.push_back(packets);
        true
    }

    /// Admits a store instruction's accesses with their data. Returns false
    /// when a cap would be violated.
    pub fn request_write(&mut self, uop: &InsnRef, data: &[RegisterValue]) -> bool {
        if self.exclusive && !self.pending_loads.is_empty() {
            return false;
        }
        if !self.exclusive
            && self.pending_loads.len() + self.pending_stores.len() >= self.request_limit
        {
            return false;
        }
        if self.pending_stores.len() >= self.store_request_limit {
            return false;
        }

        let (seq_id, targets, atomic) = {
            let insn = uop.borrow();
            (insn.sequence_id, insn.addresses.clone(), insn.is_store_cond)
        };
        debug_assert_eq!(
            data.len(),
            targets.len(),
            "store data and address counts differ"
        );

        let mut packets = Vec::new();
        for (order_id, (target, value)) in targets.iter().zip(data).enumerate() {
            packets.extend(self.split_write(target, value, seq_id, order_id as u16));
        }
        if atomic {
            for pkt in &mut packets {
                pkt.atomic = true;
            }
        }

        self.pending_data_requests += packets.len() as u64;
        self.requested_stores.insert(
            seq_id,
            StoreTracker {
                insn: uop.clone(),
                packets_remaining: packets.len() as u16,
                failed: false,
            },
        );
        self.pending_stores.push_back(packets);
        true
    }

    /// Writes a region directly, bypassing admission and bandwidth. Used by
    /// the exception path to apply handler state changes.
    pub fn request_untimed_write(&mut self, target: MemoryAccessTarget, data: RegisterValue) {
        let packets = self.split_write(&target, &data, 0, 0);
        self.pending_data_requests += packets.len() as u64;
        for mut pkt in packets {
            pkt.untimed = true;
            self.issue_request(pkt);
        }
    }

    /// Requests an instruction-fetch read. Must be cache-line aligned.
    pub fn request_instr_read(&mut self, target: MemoryAccessTarget) {
        debug_assert!(
            down_align(target.vaddr, self.cache_line_width)
                == down_align(target.vaddr + target.size as u64 - 1, self.cache_line_width),
            "instruction reads may not cross a cache line"
        );
        let mut pkt = MemPacket::read_request(target.vaddr, target.size, 0, 0, self.tid);
        pkt.untimed = true;
        pkt.instr_read = true;
        self.issue_request(pkt);
    }

    /// Completed instruction-fetch reads, in arrival order.
    pub fn completed_instr_reads(&self) -> &[InstrReadResult] {
        &self.completed_instr_reads
    }

    /// Clears the completed instruction-read list.
    pub fn clear_completed_instr_reads(&mut self) {
        self.completed_instr_reads.clear();
    }

    /// Re-issues requests parked on a now-resolved translation.
    pub fn supply_delayed_translation(&mut self, vaddr: u64, paddr: u64) {
        if let Some(parked) = self.pending_translations.remove(&vaddr) {
            for mut pkt in parked {
                pkt.paddr = paddr;
                self.backend.send(pkt);
            }
        }
    }

    /// True while any data packet is in flight.
    pub fn has_pending_requests(&self) -> bool {
        self.pending_data_requests != 0
    }

    /// Sets the thread id stamped on outgoing requests.
    pub fn set_tid(&mut self, tid: u64) {
        self.tid = tid;
    }

    /// Issues packets of the chosen type until the byte bandwidth runs out.
    fn process_requests(&mut self, is_store: bool) {
        let bandwidth_limit = if is_store {
            self.store_bandwidth
        } else {
            self.load_bandwidth
        };
        let mut bandwidth_used: u64 = 0;

        loop {
            // Detach the next packet before issuing so the queue borrow does
            // not live across the issue call.
            let detached = {
                let queue = if is_store {
                    &mut self.pending_stores
                } else {
                    &mut self.pending_loads
                };
                match queue.front_mut() {
                    None => return,
                    Some(packets) if packets.is_empty() => {
                        queue.pop_front();
                        continue;
                    }
                    Some(packets) => {
                        if bandwidth_used + packets[0].size as u64 > bandwidth_limit {
                            // Bandwidth exhausted for this cycle.
                            return;
                        }
                        let pkt = packets.remove(0);
                        let last_of_insn = packets.is_empty();
                        if last_of_insn {
                            queue.pop_front();
                        }
                        (pkt, last_of_insn)
                    }
                }
            };

            let (pkt, last_of_insn) = detached;
            bandwidth_used += pkt.size as u64;
            let seq_id = pkt.insn_seq_id;
            self.issue_request(pkt);

            if is_store && last_of_insn {
                // Non-conditional stores become commit-ready once their final
                // packet has been issued; conditional stores wait for the
                // write responses.
                let non_cond = self
                    .requested_stores
                    .get(&seq_id)
                    .map(|t| !t.insn.borrow().is_store_cond)
                    .unwrap_or(false);
                if non_cond {
                    if let Some(tracker) = self.requested_stores.remove(&seq_id) {
                        tracker.insn.borrow_mut().commit_ready = true;
                    }
                }
            }
        }
    }

    /// Translates and forwards one packet, or resolves its fault.
    fn issue_request(&mut self, mut packet: MemPacket) {
        match self.page_table.translate(packet.vaddr, self.tid) {
            Translation::DataAbort => {
                packet.faulty = true;
                // No memory access; the fault travels back up immediately.
                let response = packet.into_response();
                self.handle_response(response);
            }
            Translation::Pending => {
                self.pending_translations
                    .entry(packet.vaddr)
                    .or_default()
                    .push(packet);
            }
            Translation::Ignored => {
                packet.ignored = true;
                self.backend.send(packet);
            }
            Translation::Mapped(paddr) => {
                packet.paddr = paddr;
                self.backend.send(packet);
            }
        }
    }

    /// Receives one completed packet from the backend.
    fn handle_response(&mut self, packet: MemPacket) {
        if packet.instr_read {
            let data = if packet.faulty || packet.ignored {
                RegisterValue::empty()
            } else {
                packet.payload
            };
            self.completed_instr_reads.push(InstrReadResult {
                target: MemoryAccessTarget::new(packet.vaddr, packet.size),
                data,
            });
            return;
        }

        debug_assert!(self.pending_data_requests > 0);
        self.pending_data_requests -= 1;
        let seq_id = packet.insn_seq_id;

        if packet.is_read() {
            let order = packet.order_id;
            let split = packet.split_id as usize;
            if let Some(slots) = self
                .read_responses
                .get_mut(&seq_id)
                .and_then(|orders| orders.get_mut(&order))
            {
                slots[split] = Some(packet);
            }
            let done = match self.requested_loads.get_mut(&seq_id) {
                Some(tracker) => {
                    tracker.packets_remaining -= 1;
                    tracker.packets_remaining == 0
                }
                None => {
                    debug_assert!(false, "read response for unknown load {}", seq_id);
                    false
                }
            };
            if done {
                self.supply_load_data(seq_id);
            }
        } else {
            // Untimed state-change writes carry no tracker; drop silently.
            let Some(tracker) = self.requested_stores.get_mut(&seq_id) else {
                return;
            };
            tracker.packets_remaining -= 1;
            if packet.failed || packet.faulty {
                tracker.failed = true;
            }
            if tracker.packets_remaining == 0 {
                let tracker = self.requested_stores.remove(&seq_id).unwrap();
                if tracker.insn.borrow().is_store_cond {
                    tracker
                        .insn
                        .borrow_mut()
                        .update_cond_store_result(!tracker.failed);
                }
            }
        }
    }

    /// Reassembles all responses for a load and supplies the data.
    fn supply_load_data(&mut self, seq_id: u64) {
        let tracker = self
            .requested_loads
            .remove(&seq_id)
            .expect("load tracker missing at reassembly");
        let orders = self
            .read_responses
            .remove(&seq_id)
            .expect("read responses missing at reassembly");

        let mut order_ids: Vec<u16> = orders.keys().copied().collect();
        order_ids.sort_unstable();

        let mut insn = tracker.insn.borrow_mut();
        for order in order_ids {
            let splits = &orders[&order];
            let addr = splits[0]
                .as_ref()
                .map(|p| p.vaddr)
                .expect("first split missing");
            let mut merged = RegisterValue::empty();
            let mut faulty = false;
            for slot in splits {
                let pkt = slot.as_ref().expect("split missing at reassembly");
                if pkt.faulty {
                    faulty = true;
                    break;
                }
                // Ignored regions read back as zero-filled data.
                if pkt.ignored {
                    merged.append(&RegisterValue::zeroed(pkt.size));
                } else {
                    merged.append(&pkt.payload);
                }
            }
            if faulty {
                insn.supply_data(addr, RegisterValue::empty());
            } else {
                insn.supply_data(addr, merged);
            }
        }
        debug_assert!(insn.has_all_data());
    }

    /// Splits a read target on cache-line boundaries.
    fn split_read(&self, target: &MemoryAccessTarget, seq_id: u64, order_id: u16) -> Vec<MemPacket> {
        let mut packets = Vec::new();
        let mut next_addr = target.vaddr;
        let mut remaining = target.size as u64;
        let mut split_id = 0;
        while remaining != 0 {
            let line_end = down_align(next_addr, self.cache_line_width) + self.cache_line_width;
            let region = (line_end - next_addr).min(remaining) as u16;
            let mut pkt = MemPacket::read_request(next_addr, region, seq_id, order_id, self.tid);
            pkt.split_id = split_id;
            packets.push(pkt);
            next_addr += region as u64;
            remaining -= region as u64;
            split_id += 1;
        }
        packets
    }

    /// Splits a write target and its payload on cache-line boundaries.
    fn split_write(
        &self,
        target: &MemoryAccessTarget,
        data: &RegisterValue,
        seq_id: u64,
        order_id: u16,
    ) -> Vec<MemPacket> {
        let bytes = data.as_bytes();
        let mut packets = Vec::new();
        let mut next_addr = target.vaddr;
        let mut offset = 0usize;
        let mut remaining = target.size as u64;
        let mut split_id = 0;
        while remaining != 0 {
            let line_end = down_align(next_addr, self.cache_line_width) + self.cache_line_width;
            let region = (line_end - next_addr).min(remaining) as u16;
            let payload = RegisterValue::from_bytes(&bytes[offset..offset + region as usize]);
            let mut pkt =
                MemPacket::write_request(next_addr, region, seq_id, order_id, self.tid, payload);
            pkt.split_id = split_id;
            packets.push(pkt);
            next_addr += region as u64;
            offset += region as usize;
            remaining -= region as u64;
            split_id += 1;
        }
        packets
    }
}
