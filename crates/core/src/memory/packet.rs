//! Memory request and response packets.
//!
//! One packet carries at most one cache line's worth of data. Accesses that
//! cross a line boundary are split into multiple packets sharing an order id,
//! distinguished by split id, and reassembled on response.

use crate::common::RegisterValue;

/// Direction and phase of a packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketKind {
    /// Read request.
    ReadRequest,
    /// Write request.
    WriteRequest,
    /// Read response (payload valid).
    ReadResponse,
    /// Write response.
    WriteResponse,
}

/// A memory request or response.
#[derive(Clone, Debug)]
pub struct MemPacket {
    /// Virtual address of this packet's region.
    pub vaddr: u64,
    /// Physical address, filled by translation.
    pub paddr: u64,
    /// Region size in bytes.
    pub size: u16,
    /// Direction and phase.
    pub kind: PacketKind,
    /// Sequence id of the owning instruction.
    pub insn_seq_id: u64,
    /// Index of the access target within the instruction.
    pub order_id: u16,
    /// Index of this split within the access target.
    pub split_id: u16,
    /// Thread id the request belongs to.
    pub tid: u64,
    /// Write payload or read response data.
    pub payload: RegisterValue,
    /// Part of an atomic (load-reserved / store-conditional) operation.
    pub atomic: bool,
    /// Instruction fetch read.
    pub instr_read: bool,
    /// Translation or access faulted; no data.
    pub faulty: bool,
    /// Translation says this region is masked; reads return no data, writes
    /// are dropped.
    pub ignored: bool,
    /// Bypasses bandwidth accounting and latency (exception-path writes,
    /// instruction fetches).
    pub untimed: bool,
    /// The backing write failed (store-conditional lost its reservation).
    pub failed: bool,
}

impl MemPacket {
    /// Creates a read request packet.
    pub fn read_request(vaddr: u64, size: u16, insn_seq_id: u64, order_id: u16, tid: u64) -> Self {
        Self::new(PacketKind::ReadRequest, vaddr, size, insn_seq_id, order_id, tid)
    }

    /// Creates a write request packet carrying `payload`.
    pub fn write_request(
        vaddr: u64,
        size: u16,
        insn_seq_id: u64,
        order_id: u16,
        tid: u64,
        payload: RegisterValue,
    ) -> Self {
        let mut pkt = Self::new(PacketKind::WriteRequest, vaddr, size, insn_seq_id, order_id, tid);
        pkt.payload = payload;
        pkt
    }

    fn new(kind: PacketKind, vaddr: u64, size: u16, insn_seq_id: u64, order_id: u16, tid: u64) -> Self {
        Self {
            vaddr,
            paddr: 0,
            size,
            kind,
            insn_seq_id,
            order_id,
            split_id: 0,
            tid,
            payload: RegisterValue::empty(),
            atomic: false,
            instr_read: false,
            faulty: false,
            ignored: false,
            untimed: false,
            failed: false,
        }
    }

    /// True for read requests and responses.
    #[inline]
    pub fn is_read(&self) -> bool {
        matches!(self.kind, PacketKind::ReadRequest | PacketKind::ReadResponse)
    }

    /// True for write requests and responses.
    #[inline]
    pub fn is_write(&self) -> bool {
        matches!(self.kind, PacketKind::WriteRequest | PacketKind::WriteResponse)
    }

    /// Converts a request into its response form in place.
    pub fn into_response(mut self) -> Self {
        self.kind = match self.kind {
            PacketKind::ReadRequest | PacketKind::ReadResponse => PacketKind::ReadResponse,
            PacketKind::WriteRequest | PacketKind::WriteResponse => PacketKind::WriteResponse,
        };
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_to_response() {
        let pkt = MemPacket::read_request(0x100, 8, 1, 0, 0);
        assert!(pkt.is_read());
        let resp = pkt.into_response();
        assert_eq!(resp.kind, PacketKind::ReadResponse);
        assert!(resp.is_read());
    }

    #[test]
    fn test_write_carries_payload() {
        let pkt = MemPacket::write_request(0x40, 4, 2, 0, 0, RegisterValue::from_bytes(&[1, 2, 3, 4]));
        assert!(pkt.is_write());
        assert_eq!(pkt.payload.as_bytes(), &[1, 2, 3, 4]);
    }
}
