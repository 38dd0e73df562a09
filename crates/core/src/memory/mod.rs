//! Pipeline-facing memory subsystem.
//!
//! The MMU fragments accesses on cache-line boundaries, enforces per-cycle
//! bandwidth and request limits, drives address translation, and reassembles
//! split responses. The backend behind it is a pluggable port that is free to
//! reorder across instructions but must deliver every split of one access.

/// Memory backend port and the fixed-latency reference implementation.
pub mod backend;
/// The memory management unit.
pub mod mmu;
/// Memory request/response packets.
pub mod packet;
/// Virtual-to-physical translation interface.
pub mod pagetable;

pub use backend::{FixedLatencyMemory, MemoryInterface};
pub use mmu::Mmu;
pub use packet::{MemPacket, PacketKind};
pub use pagetable::{IdentityPageTable, PageTable, Translation};
