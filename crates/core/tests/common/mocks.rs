use mockall::mock;

use ooo_core::memory::packet::MemPacket;
use ooo_core::memory::{FixedLatencyMemory, MemoryInterface, PageTable, Translation};

mock! {
    pub PageTable {}
    impl PageTable for PageTable {
        fn translate(&mut self, vaddr: u64, tid: u64) -> Translation;
    }
}

/// Wraps a real memory and fails write packets at configured addresses.
/// Used to force store-conditional failures.
pub struct FailingWriteMemory {
    inner: FixedLatencyMemory,
    fail_addrs: Vec<u64>,
}

impl FailingWriteMemory {
    pub fn new(inner: FixedLatencyMemory, fail_addrs: Vec<u64>) -> Self {
        Self { inner, fail_addrs }
    }
}

impl MemoryInterface for FailingWriteMemory {
    fn send(&mut self, mut packet: MemPacket) {
        if packet.is_write() && self.fail_addrs.contains(&packet.vaddr) {
            packet.failed = true;
        }
        self.inner.send(packet);
    }

    fn tick(&mut self) {
        self.inner.tick();
    }

    fn drain_responses(&mut self) -> Vec<MemPacket> {
        self.inner.drain_responses()
    }
}
