//! Dispatch and issue.
//!
//! Dispatch reads head slots from rename, allocates an issue port and a
//! reservation station entry, reads ready operands (scoreboard-gated), and
//! parks unsatisfied operands in a per-register dependency matrix. Issue pops
//! the oldest ready instruction per port into its execution pipe. Results
//! forwarded at writeback wake dependents with a per-group latency: zero is
//! same-cycle, positive schedules a timed wake-up, and negative forbids
//! forwarding (the dependent reads the register file once the scoreboard
//! clears).

use std::collections::HashSet;

use crate::config::Config;
use crate::common::Register;
use crate::isa::{Architecture, InsnRef};
use crate::pipeline::buffer::PipelineBuffer;
use crate::pipeline::ports::PortAllocator;
use crate::regfile::RegisterFileSet;

/// An operand waiting on an in-flight producer.
struct DependencyEntry {
    insn: InsnRef,
    port: u8,
    operand_index: usize,
}

struct RsPort {
    issue_port: u8,
    ready: std::collections::VecDeque<InsnRef>,
}

struct ReservationStation {
    capacity: usize,
    dispatch_rate: usize,
    current_size: usize,
    ports: Vec<RsPort>,
}

/// The dispatch/issue unit.
pub struct DispatchIssueUnit {
    /// Per-bank, per-physical-tag ready bits.
    scoreboard: Vec<Vec<bool>>,
    /// Per-bank, per-physical-tag waiting entries.
    dependency_matrix: Vec<Vec<Vec<DependencyEntry>>>,
    reservation_stations: Vec<ReservationStation>,
    /// Issue port index to (station, station-port) mapping.
    port_mapping: Vec<(usize, usize)>,
    /// Timed wake-ups: (due tick, entry, value).
    waiting: Vec<(u64, DependencyEntry, crate::common::RegisterValue)>,
    /// Forwarding-forbidden entries serviced from the register file.
    permanent_wait: Vec<DependencyEntry>,
    /// Per-station dispatches made this cycle.
    dispatches: Vec<usize>,
    ticks: u64,

    rs_stalls: u64,
    frontend_stalls: u64,
    backend_stalls: u64,
    port_busy_stalls: u64,
}

impl DispatchIssueUnit {
    /// Builds the unit from the configured register counts and reservation
    /// station arrangement.
    pub fn new(config: &Config) -> Self {
        let scoreboard: Vec<Vec<bool>> = (0..crate::common::RegisterBank::COUNT)
            .map(|i| vec![true; config.register_set.count_for(i) as usize])
            .collect();
        let dependency_matrix = scoreboard
            .iter()
            .map(|bank| {
                let mut lists = Vec::new();
                lists.resize_with(bank.len(), Vec::new);
                lists
            })
            .collect();

        let mut port_mapping = vec![(0usize, 0usize); config.ports.len()];
        let mut reservation_stations = Vec::new();
        for (rs_index, rs_config) in config.reservation_stations.iter().enumerate() {
            let mut ports = Vec::new();
            for (station_port, &issue_port) in rs_config.ports.iter().enumerate() {
                port_mapping[issue_port as usize] = (rs_index, station_port);
                ports.push(RsPort {
                    issue_port,
                    ready: std::collections::VecDeque::new(),
                });
            }
            reservation_stations.push(ReservationStation {
                capacity: rs_config.size,
                dispatch_rate: rs_config.dispatch_rate,
                current_size: 0,
                ports,
            });
        }

        let station_count = reservation_stations.len();
        Self {
            scoreboard,
            dependency_matrix,
            reservation_stations,
            port_mapping,
            waiting: Vec::new(),
            permanent_wait: Vec::new(),
            dispatches: vec![0; station_count],
            ticks: 0,
            rs_stalls: 0,
            frontend_stalls: 0,
            backend_stalls: 0,
            port_busy_stalls: 0,
        }
    }

    /// Advances timed wake-ups, services register-file waits, and dispatches
    /// from the rename output buffer.
    pub fn tick(
        &mut self,
        input: &mut PipelineBuffer<InsnRef>,
        regfile: &RegisterFileSet,
        allocator: &mut dyn PortAllocator,
    ) {
        input.stall(false);
        self.ticks += 1;
        self.dispatches.iter_mut().for_each(|d| *d = 0);

        // Timed wake-ups whose cycle has arrived supply their value.
        let due: Vec<usize> = self
            .waiting
            .iter()
            .enumerate()
            .filter(|(_, (tick, _, _))| *tick == self.ticks)
            .map(|(i, _)| i)
            .collect();
        for index in due.into_iter().rev() {
            let (_, entry, value) = self.waiting.swap_remove(index);
            entry
                .insn
                .borrow_mut()
                .supply_operand(entry.operand_index, value);
            self.enqueue_if_ready(&entry);
        }

        // Forwarding-forbidden entries read the register file once their
        // producer's scoreboard bit is set.
        let mut index = 0;
        while index < self.permanent_wait.len() {
            let entry = &self.permanent_wait[index];
            let reg = entry.insn.borrow().source_registers[entry.operand_index];
            if self.scoreboard[reg.bank.index()][reg.tag as usize] {
                let entry = self.permanent_wait.swap_remove(index);
                entry
                    .insn
                    .borrow_mut()
                    .supply_operand(entry.operand_index, regfile.get(reg));
                self.enqueue_if_ready(&entry);
            } else {
                index += 1;
            }
        }

        self.dispatch(input, regfile, allocator);
    }

    /// Dispatches instructions from the head of the rename output buffer.
    fn dispatch(
        &mut self,
        input: &mut PipelineBuffer<InsnRef>,
        regfile: &RegisterFileSet,
        allocator: &mut dyn PortAllocator,
    ) {
        for slot in 0..input.width() {
            let Some(uop) = input.head_slots()[slot].clone() else {
                continue;
            };

            if uop.borrow().exception_encountered() {
                // Fault already attached: mark ready to retire and drop from
                // the pipeline; the ROB surfaces it at the head.
                uop.borrow_mut().commit_ready = true;
                input.head_slots()[slot] = None;
                continue;
            }

            let supported_ports = uop.borrow().supported_ports.clone();
            let port = allocator.allocate(&supported_ports);
            let (rs_index, rs_port) = self.port_mapping[port as usize];
            let station = &self.reservation_stations[rs_index];

            if station.current_size == station.capacity
                || self.dispatches[rs_index] == station.dispatch_rate
            {
                allocator.deallocate(port);
                input.stall(true);
                self.rs_stalls += 1;
                return;
            }

            // Operand read: supply everything the scoreboard says is ready,
            // park the rest in the dependency matrix.
            let mut ready = true;
            {
                let mut insn = uop.borrow_mut();
                for i in 0..insn.source_registers.len() {
                    if insn.is_operand_ready(i) {
                        continue;
                    }
                    let reg = insn.source_registers[i];
                    if self.scoreboard[reg.bank.index()][reg.tag as usize] {
                        insn.supply_operand(i, regfile.get(reg));
                    } else {
                        self.dependency_matrix[reg.bank.index()][reg.tag as usize].push(
                            DependencyEntry {
                                insn: uop.clone(),
                                port,
                                operand_index: i,
                            },
                        );
                        ready = false;
                    }
                }

                for reg in &insn.destinations {
                    self.scoreboard[reg.bank.index()][reg.tag as usize] = false;
                }
            }

            self.dispatches[rs_index] += 1;
            self.reservation_stations[rs_index].current_size += 1;

            if ready {
                self.reservation_stations[rs_index].ports[rs_port]
                    .ready
                    .push_back(uop);
            }

            input.head_slots()[slot] = None;
        }
    }

    /// Issues the oldest ready instruction on each unblocked port.
    pub fn issue(
        &mut self,
        issue_ports: &mut [PipelineBuffer<InsnRef>],
        allocator: &mut dyn PortAllocator,
    ) {
        let mut issued = 0;
        for port in 0..issue_ports.len() {
            let (rs_index, rs_port) = self.port_mapping[port];
            let queue = &mut self.reservation_stations[rs_index].ports[rs_port].ready;

            if issue_ports[port].is_stalled() {
                if !queue.is_empty() {
                    self.port_busy_stalls += 1;
                }
                continue;
            }

            if let Some(uop) = queue.pop_front() {
                issue_ports[port].tail_slots()[0] = Some(uop);
                allocator.issued(port as u8);
                issued += 1;
                debug_assert!(self.reservation_stations[rs_index].current_size > 0);
                self.reservation_stations[rs_index].current_size -= 1;
            }
        }

        if issued == 0 {
            if self
                .reservation_stations
                .iter()
                .any(|rs| rs.current_size != 0)
            {
                self.backend_stalls += 1;
            } else {
                self.frontend_stalls += 1;
            }
        }
    }

    /// Forwards a completed instruction's results to its dependents and
    /// marks its destinations ready.
    pub fn forward_operands(&mut self, insn: &InsnRef, arch: &dyn Architecture) {
        let (destinations, results, producer_group) = {
            let borrowed = insn.borrow();
            (
                borrowed.destinations.clone(),
                borrowed.results.clone(),
                borrowed.group,
            )
        };
        debug_assert_eq!(destinations.len(), results.len());

        for (reg, value) in destinations.iter().zip(results) {
            self.scoreboard[reg.bank.index()][reg.tag as usize] = true;

            let dependents =
                std::mem::take(&mut self.dependency_matrix[reg.bank.index()][reg.tag as usize]);
            for entry in dependents {
                let consumer_group = entry.insn.borrow().group;
                let latency = arch.forward_latency(producer_group, consumer_group);
                if latency == 0 {
                    entry
                        .insn
                        .borrow_mut()
                        .supply_operand(entry.operand_index, value);
                    self.enqueue_if_ready(&entry);
                } else if latency < 0 {
                    // No forwarding path: serviced from the register file.
                    self.permanent_wait.push(entry);
                } else {
                    self.waiting
                        .push((self.ticks + latency as u64, entry, value));
                }
            }
        }
    }

    /// Marks one physical register ready (writeback without forwarding).
    pub fn set_register_ready(&mut self, reg: Register) {
        self.scoreboard[reg.bank.index()][reg.tag as usize] = true;
    }

    /// Removes flushed instructions from ready queues, the dependency
    /// matrix, and both wait lists. Each flushed instruction's port is
    /// released exactly once.
    pub fn purge_flushed(&mut self, allocator: &mut dyn PortAllocator) {
        // Ready queues: occupants are disjoint from the wait structures.
        for station in &mut self.reservation_stations {
            for port in &mut station.ports {
                let before = port.ready.len();
                port.ready.retain(|uop| {
                    let flushed = uop.borrow().flushed;
                    if flushed {
                        allocator.deallocate(port.issue_port);
                    }
                    !flushed
                });
                station.current_size -= before - port.ready.len();
            }
        }

        // Wait structures: one instruction may hold several operand entries;
        // deallocate its port and shrink its station only once.
        let mut seen: HashSet<u64> = HashSet::new();
        let mut flushed_per_station = vec![0usize; self.reservation_stations.len()];

        let port_mapping = &self.port_mapping;
        let mut note = |entry: &DependencyEntry| {
            let insn = entry.insn.borrow();
            if insn.flushed {
                if seen.insert(insn.sequence_id) {
                    allocator.deallocate(entry.port);
                    flushed_per_station[port_mapping[entry.port as usize].0] += 1;
                }
                true
            } else {
                false
            }
        };

        for bank in &mut self.dependency_matrix {
            for list in bank.iter_mut() {
                list.retain(|entry| !note(entry));
            }
        }
        self.waiting.retain(|(_, entry, _)| !note(entry));
        self.permanent_wait.retain(|entry| !note(entry));

        for (rs_index, count) in flushed_per_station.iter().enumerate() {
            debug_assert!(self.reservation_stations[rs_index].current_size >= *count);
            self.reservation_stations[rs_index].current_size -= count;
        }
    }

    /// Pushes an entry's instruction to its ready queue once executable.
    fn enqueue_if_ready(&mut self, entry: &DependencyEntry) {
        if entry.insn.borrow().can_execute() {
            let (rs_index, rs_port) = self.port_mapping[entry.port as usize];
            self.reservation_stations[rs_index].ports[rs_port]
                .ready
                .push_back(entry.insn.clone());
        }
    }

    /// Cycles stalled because a reservation station was full.
    pub fn rs_stalls(&self) -> u64 {
        self.rs_stalls
    }

    /// Cycles with zero issue and empty reservation stations.
    pub fn frontend_stalls(&self) -> u64 {
        self.frontend_stalls
    }

    /// Cycles with zero issue but occupied reservation stations.
    pub fn backend_stalls(&self) -> u64 {
        self.backend_stalls
    }

    /// Ready instructions blocked by a stalled downstream port.
    pub fn port_busy_stalls(&self) -> u64 {
        self.port_busy_stalls
    }
}
