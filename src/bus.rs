//! Snooping interconnect: a single serialised bus connecting the L1 caches
//! to the shared backing memory. Every transaction runs to completion under
//! one reentrant lock, so snoops, write-backs, and the data response of a
//! transaction are all visible before the next one starts.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, error};
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard, RwLock};

use crate::cache::Cache;
use crate::commons::{Addr, BusSignal, BusTransaction, LINE_SIZE};
use crate::memory::SharedMemory;

/// Hook invoked between bus events; the interactive stepper implements it.
pub trait BusObserver: Send + Sync {
    fn pause(&self, signal: BusSignal, caches: &[Arc<Cache>], shm: &SharedMemory);
}

pub struct Bus {
    shm: Arc<SharedMemory>,
    /// The serialisation point. Reentrant: snoop handlers emit Flush while
    /// their triggering transaction still holds the lock.
    lock: ReentrantMutex<()>,
    caches: RwLock<Vec<Arc<Cache>>>,
    /// Most recent write-back per line base, consulted before memory on
    /// BusRd/BusRdX.
    staging: Mutex<HashMap<u64, [u8; LINE_SIZE]>>,
    observer: Mutex<Option<Arc<dyn BusObserver>>>,
}

impl Bus {
    pub fn new(shm: Arc<SharedMemory>) -> Arc<Self> {
        Arc::new(Bus {
            shm,
            lock: ReentrantMutex::new(()),
            caches: RwLock::new(Vec::new()),
            staging: Mutex::new(HashMap::new()),
            observer: Mutex::new(None),
        })
    }

    pub fn connect(self: &Arc<Self>, cache: Arc<Cache>) {
        cache.attach_bus(self);
        self.caches.write().push(cache);
    }

    pub fn set_observer(&self, observer: Arc<dyn BusObserver>) {
        *self.observer.lock() = Some(observer);
    }

    /// Hold the bus across a multi-step cache operation (the S→M upgrade
    /// writes its line only after its BusUpgr has been snooped).
    pub fn serialize(&self) -> ReentrantMutexGuard<'_, ()> {
        self.lock.lock()
    }

    pub fn emit(&self, t: BusTransaction) {
        let _serial = self.lock.lock();
        debug!("bus: {} @{} from PE{}", t.signal, t.addr, t.src_pe);
        match t.signal {
            BusSignal::Flush => {
                let Some(payload) = t.payload else {
                    error!("bus: Flush @{} without payload dropped", t.addr);
                    return;
                };
                let base = t.addr.line_base();
                self.staging.lock().insert(base.0, payload);
                if let Err(e) = self.shm.write(base.0, &payload, LINE_SIZE, Some(t.src_pe)) {
                    error!("bus: write-back @{base} failed: {e}");
                }
                self.pause(BusSignal::Flush);
            }
            BusSignal::Inv | BusSignal::BusUpgr => {
                self.snoop_others(&t);
                self.pause(t.signal);
            }
            BusSignal::BusRd | BusSignal::BusRdX => {
                self.snoop_others(&t);
                // decided after the snoops: a Modified peer has just
                // downgraded to Shared and still counts as a sharer
                let shared =
                    t.signal == BusSignal::BusRd && self.any_other_has_line(t.src_pe, t.addr);
                let line = self.fetch_line(t.addr.line_base(), t.src_pe);
                self.pause(t.signal);
                let src = self
                    .caches
                    .read()
                    .iter()
                    .find(|c| c.pe_id() == t.src_pe)
                    .cloned();
                if let Some(src) = src {
                    src.on_data_response(t.addr, &line, shared);
                }
            }
        }
    }

    fn snoop_others(&self, t: &BusTransaction) {
        for cache in self.caches.read().iter() {
            if cache.pe_id() == t.src_pe {
                continue;
            }
            cache.on_snoop(t);
        }
    }

    fn any_other_has_line(&self, except_pe: usize, addr: Addr) -> bool {
        self.caches
            .read()
            .iter()
            .any(|c| c.pe_id() != except_pe && c.has_line(addr))
    }

    /// Source a full line: staged write-back data wins over memory.
    fn fetch_line(&self, base: Addr, requester: usize) -> [u8; LINE_SIZE] {
        if let Some(line) = self.staging.lock().remove(&base.0) {
            return line;
        }
        match self.shm.read(base.0, LINE_SIZE, Some(requester)) {
            Ok(bytes) => {
                let mut line = [0u8; LINE_SIZE];
                line.copy_from_slice(&bytes);
                line
            }
            Err(e) => {
                // a cache asking for an unbacked line is a programming error
                error!("bus: line fetch @{base} failed: {e}");
                [0u8; LINE_SIZE]
            }
        }
    }

    fn pause(&self, signal: BusSignal) {
        let observer = self.observer.lock().clone();
        if let Some(observer) = observer {
            let caches = self.caches.read().clone();
            observer.pause(signal, &caches, &self.shm);
        }
    }
}
