//! Load/store queue.
//!
//! Orders in-flight memory operations, detects store-to-load address
//! conflicts before issue, schedules requests into the MMU under its
//! admission back-pressure, and scans for memory-order violations when a
//! store commits. Completed loads deliver their results through dedicated
//! completion slots, preserving program order when configured to.

use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::common::RegisterValue;
use crate::isa::{Architecture, InsnRef};
use crate::memory::Mmu;
use crate::pipeline::buffer::PipelineBuffer;
use crate::pipeline::dispatch::DispatchIssueUnit;

/// Order in which completed memory operations reach the completion slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionOrder {
    /// Completion slots are reserved at issue, so delivery is program order.
    InOrder,
    /// Completion slots are filled in execution order.
    OutOfOrder,
}

/// The load/store queue.
pub struct LoadStoreQueue {
    load_queue: VecDeque<InsnRef>,
    /// Stores paired with their accumulated data, in program order.
    store_queue: VecDeque<(InsnRef, Vec<RegisterValue>)>,

    combined: bool,
    max_combined: usize,
    max_load: usize,
    max_store: usize,

    /// Loads that have requested memory, keyed by sequence id.
    requested_loads: HashMap<u64, InsnRef>,
    /// Loads blocked on an older overlapping store, keyed by the store's
    /// sequence id.
    confliction_map: HashMap<u64, Vec<InsnRef>>,

    /// Requests scheduled for a future cycle, keyed by due cycle.
    request_load_queue: BTreeMap<u64, Vec<InsnRef>>,
    request_store_queue: BTreeMap<u64, Vec<InsnRef>>,

    /// Completed operations awaiting a completion slot.
    completed_requests: VecDeque<InsnRef>,

    /// An in-flight store-conditional awaiting its result.
    requested_cond_store: Option<InsnRef>,

    violating_load: Option<InsnRef>,

    tick_counter: u64,
    access_latency: u64,
    completion_order: CompletionOrder,
}

impl LoadStoreQueue {
    /// Creates a combined queue with a single shared capacity.
    pub fn new_combined(
        max_combined: usize,
        access_latency: u64,
        completion_order: CompletionOrder,
    ) -> Self {
        let mut lsq = Self::new_split(0, 0, access_latency, completion_order);
        lsq.combined = true;
        lsq.max_combined = max_combined;
        lsq
    }

    /// Creates split load/store queues with independent capacities.
    pub fn new_split(
        max_load: usize,
        max_store: usize,
        access_latency: u64,
        completion_order: CompletionOrder,
    ) -> Self {
        Self {
            load_queue: VecDeque::new(),
            store_queue: VecDeque::new(),
            combined: false,
            max_combined: 0,
            max_load,
            max_store,
            requested_loads: HashMap::new(),
            confliction_map: HashMap::new(),
            request_load_queue: BTreeMap::new(),
            request_store_queue: BTreeMap::new(),
            completed_requests: VecDeque::new(),
            requested_cond_store: None,
            violating_load: None,
            tick_counter: 0,
            access_latency,
            completion_order,
        }
    }

    /// Free slots available to a load.
    pub fn load_space(&self) -> usize {
        if self.combined {
            self.combined_space()
        } else {
            self.max_load - self.load_queue.len()
        }
    }

    /// Free slots available to a store.
    pub fn store_space(&self) -> usize {
        if self.combined {
            self.combined_space()
        } else {
            self.max_store - self.store_queue.len()
        }
    }

    /// Free slots across both queues.
    pub fn total_space(&self) -> usize {
        if self.combined {
            self.combined_space()
        } else {
            self.load_space() + self.store_space()
        }
    }

    fn combined_space(&self) -> usize {
        self.max_combined - self.load_queue.len() - self.store_queue.len()
    }

    /// Enqueues a renamed load in program order.
    pub fn add_load(&mut self, insn: &InsnRef) {
        self.load_queue.push_back(insn.clone());
    }

    /// Enqueues a renamed store in program order.
    pub fn add_store(&mut self, insn: &InsnRef) {
        self.store_queue.push_back((insn.clone(), Vec::new()));
    }

    /// Begins a load whose addresses have been generated.
    ///
    /// A load overlapping an older in-queue store parks in the confliction
    /// map until that store commits; otherwise its request is scheduled
    /// `access_latency` cycles out.
    pub fn start_load(&mut self, insn: &InsnRef) {
        let (seq_id, addresses_empty) = {
            let borrowed = insn.borrow();
            (borrowed.sequence_id, borrowed.addresses.is_empty())
        };

        if addresses_empty {
            // No memory access required; execute and complete immediately.
            insn.borrow_mut().execute();
            self.completed_requests.push_back(insn.clone());
            return;
        }

        // In-order completion reserves its slot now to preserve program order.
        if self.completion_order == CompletionOrder::InOrder {
            self.completed_requests.push_back(insn.clone());
        }

        // Walk stores youngest-first looking for an older address overlap.
        for (store, _) in self.store_queue.iter().rev() {
            let store_borrowed = store.borrow();
            if store_borrowed.sequence_id >= seq_id {
                continue;
            }
            let load_borrowed = insn.borrow();
            let overlap = store_borrowed.addresses.iter().any(|st| {
                load_borrowed.addresses.iter().any(|ld| st.overlaps(ld))
            });
            if overlap {
                self.confliction_map
                    .entry(store_borrowed.sequence_id)
                    .or_default()
                    .push(insn.clone());
                return;
            }
        }

        self.request_load_queue
            .entry(self.tick_counter + self.access_latency)
            .or_default()
            .push(insn.clone());
        self.requested_loads.insert(seq_id, insn.clone());
    }

    /// Attaches produced data to the store-queue entry matching the
    /// store-data micro-op's macro identity.
    pub fn supply_store_data(&mut self, insn: &InsnRef) {
        let borrowed = insn.borrow();
        if !borrowed.is_store_data {
            return;
        }
        let macro_id = borrowed.instruction_id;
        let micro_index = borrowed.micro_op_index;
        let data = borrowed.data().to_vec();
        drop(borrowed);

        for (entry, slot) in self.store_queue.iter_mut() {
            let e = entry.borrow();
            if e.instruction_id == macro_id && e.micro_op_index == micro_index {
                drop(e);
                *slot = data;
                break;
            }
        }
    }

    /// Issues the write requests for the store at the front of the store
    /// queue. Called when the store reaches the reorder buffer head.
    pub fn start_store(&mut self, uop: &InsnRef) {
        let data = self
            .store_queue
            .front()
            .map(|(_, data)| data.clone())
            .unwrap_or_default();

        {
            let mut insn = uop.borrow_mut();
            if insn.addresses.is_empty() {
                return;
            }
            // Commit-ready clears until the memory interface has accepted
            // every packet for this store.
            insn.commit_ready = false;
            debug_assert_eq!(
                insn.addresses.len(),
                data.len(),
                "store addresses and data items differ"
            );
            insn.store_data = data;
        }

        self.request_store_queue
            .entry(self.tick_counter)
            .or_default()
            .push(uop.clone());

        let (is_cond, result_ready) = {
            let insn = uop.borrow();
            (insn.is_store_cond, insn.is_cond_result_ready())
        };
        if is_cond && !result_ready {
            debug_assert!(
                self.requested_cond_store.is_none(),
                "second conditional store issued while one is in flight"
            );
            self.requested_cond_store = Some(uop.clone());
            if self.completion_order == CompletionOrder::InOrder {
                self.completed_requests.push_back(uop.clone());
            }
        }
    }

    /// Retires the store at the front of the store queue, scanning every
    /// in-flight load younger than it for an address overlap. Returns true
    /// when a violation was found; `violating_load` identifies the oldest.
    pub fn commit_store(&mut self, uop: &InsnRef) -> bool {
        debug_assert!(!self.store_queue.is_empty());
        debug_assert_eq!(
            self.store_queue.front().unwrap().0.borrow().sequence_id,
            uop.borrow().sequence_id,
            "committed store not at the front of the store queue"
        );

        let store = uop.borrow();
        if store.addresses.is_empty() {
            drop(store);
            self.store_queue.pop_front();
            return false;
        }

        self.violating_load = None;
        for load in self.requested_loads.values() {
            let load_borrowed = load.borrow();
            // Track only the oldest violating load.
            if let Some(existing) = &self.violating_load {
                if load_borrowed.sequence_id > existing.borrow().sequence_id {
                    continue;
                }
            }
            if load_borrowed.sequence_id == store.sequence_id {
                continue;
            }
            if load_borrowed.sequence_id < store.sequence_id {
                continue;
            }
            let overlap = store.addresses.iter().any(|st| {
                load_borrowed.addresses.iter().any(|ld| st.overlaps(ld))
            });
            if overlap {
                drop(load_borrowed);
                self.violating_load = Some(load.clone());
            }
        }
        let store_seq = store.sequence_id;
        drop(store);

        // Loads parked on this store can now be scheduled.
        if let Some(blocked) = self.confliction_map.remove(&store_seq) {
            for load in blocked {
                let seq = load.borrow().sequence_id;
                self.request_load_queue
                    .entry(self.tick_counter + 1 + self.access_latency)
                    .or_default()
                    .push(load.clone());
                self.requested_loads.insert(seq, load);
            }
        }

        self.store_queue.pop_front();
        self.violating_load.is_some()
    }

    /// Retires the load at the front of the load queue.
    pub fn commit_load(&mut self, uop: &InsnRef) {
        debug_assert!(!self.load_queue.is_empty());
        debug_assert_eq!(
            self.load_queue.front().unwrap().borrow().sequence_id,
            uop.borrow().sequence_id,
            "committed load not at the front of the load queue"
        );
        if let Some(front) = self.load_queue.pop_front() {
            self.requested_loads.remove(&front.borrow().sequence_id);
        }
    }

    /// The oldest load flagged by the most recent `commit_store`.
    pub fn violating_load(&self) -> Option<InsnRef> {
        self.violating_load.clone()
    }

    /// Removes flushed instructions from every internal structure.
    pub fn purge_flushed(&mut self) {
        let requested_loads = &mut self.requested_loads;
        self.load_queue.retain(|insn| {
            if insn.borrow().flushed {
                requested_loads.remove(&insn.borrow().sequence_id);
                false
            } else {
                true
            }
        });

        // A flushed store invalidates every load blocked on it; those loads
        // are younger and therefore flushed as well.
        let confliction_map = &mut self.confliction_map;
        self.store_queue.retain(|(insn, _)| {
            if insn.borrow().flushed {
                confliction_map.remove(&insn.borrow().sequence_id);
                false
            } else {
                true
            }
        });

        for blocked in self.confliction_map.values_mut() {
            blocked.retain(|insn| !insn.borrow().flushed);
        }

        self.request_load_queue.retain(|_, insns| {
            insns.retain(|insn| !insn.borrow().flushed);
            !insns.is_empty()
        });
        self.request_store_queue.retain(|_, insns| {
            insns.retain(|insn| !insn.borrow().flushed);
            !insns.is_empty()
        });

        let cond_flushed = self
            .requested_cond_store
            .as_ref()
            .map(|cond| cond.borrow().flushed)
            .unwrap_or(false);
        if cond_flushed {
            self.requested_cond_store = None;
        }
    }

    /// Advances the queue one cycle: sends due requests to the MMU under its
    /// back-pressure, executes loads whose data has arrived, and drains
    /// completed operations into the completion slots.
    pub fn tick(
        &mut self,
        mmu: &mut Mmu,
        completion_slots: &mut [PipelineBuffer<InsnRef>],
        dispatch: &mut DispatchIssueUnit,
        arch: &dyn Architecture,
    ) {
        self.tick_counter += 1;

        self.send_due_requests(mmu);

        // A completed conditional store joins the completion queue once its
        // result is known (out-of-order mode; in-order reserved at start).
        if self.completion_order == CompletionOrder::OutOfOrder {
            let resolved = self
                .requested_cond_store
                .as_ref()
                .map(|cond| cond.borrow().is_cond_result_ready())
                .unwrap_or(false);
            if resolved {
                let cond = self.requested_cond_store.take().unwrap();
                self.completed_requests.push_back(cond);
            }
        }

        // Execute loads whose data has fully arrived.
        let ready: Vec<InsnRef> = self
            .requested_loads
            .values()
            .filter(|insn| {
                let insn = insn.borrow();
                insn.has_all_data() && !insn.executed
            })
            .cloned()
            .collect();
        for insn in ready {
            insn.borrow_mut().execute();
            if insn.borrow().is_store_data {
                // Load+store compound operations forward loaded data onward.
                self.supply_store_data(&insn);
            }
            if self.completion_order == CompletionOrder::OutOfOrder {
                self.completed_requests.push_back(insn);
            }
        }

        self.drain_completed(completion_slots, dispatch, arch);
    }

    /// Sends requests whose due cycle has arrived, interleaving loads and
    /// stores by schedule order. Stores win due-cycle ties. MMU admission
    /// returning false stops that type for the cycle without stopping the
    /// other.
    fn send_due_requests(&mut self, mmu: &mut Mmu) {
        let mut exceeded = [false, false]; // [loads, stores]

        loop {
            let earliest_load = if exceeded[0] {
                None
            } else {
                self.request_load_queue.keys().next().copied()
            };
            let earliest_store = if exceeded[1] {
                None
            } else {
                self.request_store_queue.keys().next().copied()
            };

            let choose_load = match (earliest_load, earliest_store) {
                (Some(load_due), Some(store_due)) => load_due < store_due,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (None, None) => break,
            };
            let due = if choose_load {
                earliest_load.unwrap()
            } else {
                earliest_store.unwrap()
            };
            if due > self.tick_counter {
                break;
            }

            let queue = if choose_load {
                &mut self.request_load_queue
            } else {
                &mut self.request_store_queue
            };
            let insns = queue.get_mut(&due).unwrap();
            while let Some(insn) = insns.first() {
                let accepted = if choose_load {
                    mmu.request_read(insn)
                } else {
                    let data = insn.borrow().store_data.clone();
                    mmu.request_write(insn, &data)
                };
                if accepted {
                    insns.remove(0);
                } else {
                    exceeded[if choose_load { 0 } else { 1 }] = true;
                    break;
                }
            }
            if insns.is_empty() {
                queue.remove(&due);
            }
        }
    }

    /// Drains completed operations into completion slots in queue order,
    /// skipping flushed instructions and stalled slots.
    fn drain_completed(
        &mut self,
        completion_slots: &mut [PipelineBuffer<InsnRef>],
        dispatch: &mut DispatchIssueUnit,
        arch: &dyn Architecture,
    ) {
        let mut slot = 0;
        while !self.completed_requests.is_empty() && slot < completion_slots.len() {
            if completion_slots[slot].is_stalled() {
                slot += 1;
                continue;
            }

            let insn = self.completed_requests.front().unwrap().clone();
            if insn.borrow().flushed {
                self.completed_requests.pop_front();
                continue;
            }
            {
                let borrowed = insn.borrow();
                // An in-order reservation may be waiting on its operation.
                if borrowed.is_load && !borrowed.executed {
                    break;
                }
                if borrowed.is_store_cond && !borrowed.is_cond_result_ready() {
                    break;
                }
            }

            dispatch.forward_operands(&insn, arch);
            completion_slots[slot].tail_slots()[0] = Some(insn);
            self.completed_requests.pop_front();
            slot += 1;
        }
    }
}
