//! Memory backend port.
//!
//! The MMU sends request packets into a [`MemoryInterface`] and pulls
//! completed response packets back each tick. A backend may reorder across
//! distinct sequence ids, but within one (sequence id, order id) pair every
//! split must eventually be delivered.

use std::collections::VecDeque;

use crate::common::RegisterValue;
use crate::memory::packet::{MemPacket, PacketKind};

/// The asynchronous port at the back of the MMU.
pub trait MemoryInterface {
    /// Accepts a request packet.
    fn send(&mut self, packet: MemPacket);

    /// Advances the backend one cycle.
    fn tick(&mut self);

    /// Removes and returns every response that has completed.
    fn drain_responses(&mut self) -> Vec<MemPacket>;
}

/// A flat memory with a fixed response latency.
pub struct FixedLatencyMemory {
    data: Vec<u8>,
    latency: u64,
    now: u64,
    in_flight: VecDeque<(u64, MemPacket)>,
}

impl FixedLatencyMemory {
    /// Creates `size` bytes of zeroed memory answering after `latency` cycles.
    pub fn new(size: usize, latency: u64) -> Self {
        Self {
            data: vec![0; size],
            latency,
            now: 0,
            in_flight: VecDeque::new(),
        }
    }

    /// Copies an image into memory at `addr`. Used by loaders and tests.
    pub fn load_image(&mut self, addr: u64, image: &[u8]) {
        let start = addr as usize;
        self.data[start..start + image.len()].copy_from_slice(image);
    }

    /// Reads raw bytes back out. Used by tests to inspect committed stores.
    pub fn peek(&self, addr: u64, size: usize) -> &[u8] {
        &self.data[addr as usize..addr as usize + size]
    }

    fn complete(&mut self, packet: MemPacket) -> MemPacket {
        let mut response = packet.into_response();
        if response.ignored {
            // Masked region: reads return no data, writes are dropped.
            if response.kind == PacketKind::ReadResponse {
                response.payload = RegisterValue::empty();
            }
            return response;
        }
        let start = response.paddr as usize;
        let end = start + response.size as usize;
        if end > self.data.len() {
            response.faulty = true;
            return response;
        }
        match response.kind {
            PacketKind::ReadResponse => {
                response.payload = RegisterValue::from_bytes(&self.data[start..end]);
            }
            PacketKind::WriteResponse => {
                self.data[start..end].copy_from_slice(response.payload.as_bytes());
            }
            _ => unreachable!(),
        }
        response
    }
}

impl MemoryInterface for FixedLatencyMemory {
    fn send(&mut self, packet: MemPacket) {
        let ready_at = if packet.untimed {
            self.now
        } else {
            self.now + self.latency
        };
        self.in_flight.push_back((ready_at, packet));
    }

    fn tick(&mut self) {
        self.now += 1;
    }

    fn drain_responses(&mut self) -> Vec<MemPacket> {
        let mut done = Vec::new();
        let mut remaining = VecDeque::new();
        while let Some((ready_at, packet)) = self.in_flight.pop_front() {
            if ready_at <= self.now {
                done.push(packet);
            } else {
                remaining.push_back((ready_at, packet));
            }
        }
        self.in_flight = remaining;
        done.into_iter().map(|p| self.complete(p)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_pkt(addr: u64, size: u16) -> MemPacket {
        let mut pkt = MemPacket::read_request(addr, size, 1, 0, 0);
        pkt.paddr = addr;
        pkt
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let mut mem = FixedLatencyMemory::new(0x100, 1);
        let mut write = MemPacket::write_request(0x10, 8, 1, 0, 0, RegisterValue::from_u64(0xFEED));
        write.paddr = 0x10;
        mem.send(write);
        mem.tick();
        let responses = mem.drain_responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].kind, PacketKind::WriteResponse);

        mem.send(read_pkt(0x10, 8));
        mem.tick();
        let responses = mem.drain_responses();
        assert_eq!(responses[0].payload.as_u64(), 0xFEED);
    }

    #[test]
    fn test_latency_delays_response() {
        let mut mem = FixedLatencyMemory::new(0x100, 3);
        mem.send(read_pkt(0, 8));
        mem.tick();
        assert!(mem.drain_responses().is_empty());
        mem.tick();
        assert!(mem.drain_responses().is_empty());
        mem.tick();
        assert_eq!(mem.drain_responses().len(), 1);
    }

    #[test]
    fn test_untimed_completes_same_tick() {
        let mut mem = FixedLatencyMemory::new(0x100, 5);
        let mut pkt = read_pkt(0, 8);
        pkt.untimed = true;
        mem.send(pkt);
        assert_eq!(mem.drain_responses().len(), 1);
    }

    #[test]
    fn test_ignored_read_returns_no_data() {
        let mut mem = FixedLatencyMemory::new(0x100, 1);
        let mut pkt = read_pkt(0x20, 8);
        pkt.ignored = true;
        mem.send(pkt);
        mem.tick();
        let responses = mem.drain_responses();
        assert!(responses[0].payload.is_empty());
    }

    #[test]
    fn test_out_of_range_faults() {
        let mut mem = FixedLatencyMemory::new(0x20, 1);
        mem.send(read_pkt(0x40, 8));
        mem.tick();
        assert!(mem.drain_responses()[0].faulty);
    }
}
