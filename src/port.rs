//! Memory port: adapts a PE's 8-byte load/store interface to the cache's
//! retry-on-miss contract.

use std::sync::Arc;

use crate::cache::Cache;
use crate::commons::Addr;

/// What a PE needs from the memory system.
pub trait MemoryPort {
    fn load64(&mut self, addr: u64) -> u64;
    fn store64(&mut self, addr: u64, val: u64);
}

/// Port backed by a MESI L1 cache. A missing line makes the cache emit a bus
/// transaction whose data response is delivered before `load`/`store`
/// returns, so the retry loop settles on the next attempt.
pub struct MesiMemoryPort {
    cache: Arc<Cache>,
    loads: u64,
    stores: u64,
}

impl MesiMemoryPort {
    pub fn new(cache: Arc<Cache>) -> Self {
        MesiMemoryPort {
            cache,
            loads: 0,
            stores: 0,
        }
    }

    pub fn loads(&self) -> u64 {
        self.loads
    }

    pub fn stores(&self) -> u64 {
        self.stores
    }
}

impl MemoryPort for MesiMemoryPort {
    fn load64(&mut self, addr: u64) -> u64 {
        self.loads += 1;
        loop {
            if let Some(val) = self.cache.load(Addr(addr)) {
                return val;
            }
        }
    }

    fn store64(&mut self, addr: u64, val: u64) {
        self.stores += 1;
        while !self.cache.store(Addr(addr), val) {}
    }
}
