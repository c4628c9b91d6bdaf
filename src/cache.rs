//! Private L1 cache with MESI coherence: 8 sets, 2 ways, 32-byte lines,
//! write-allocate and write-back. Misses emit bus transactions and report
//! retry to the caller; the interconnect installs the line synchronously
//! before the retry runs.

use std::fmt::Write as _;
use std::sync::{Arc, OnceLock, Weak};

use log::trace;
use parking_lot::Mutex;

use crate::bus::Bus;
use crate::commons::{Addr, BusSignal, BusTransaction, MesiState, LINE_SIZE, NUM_SETS, NUM_WAYS};
use crate::metrics::CacheMetrics;

#[derive(Clone, Copy)]
struct Line {
    valid: bool,
    dirty: bool,
    state: MesiState,
    tag: u64,
    data: [u8; LINE_SIZE],
}

impl Line {
    fn empty() -> Self {
        Line {
            valid: false,
            dirty: false,
            state: MesiState::Invalid,
            tag: 0,
            data: [0; LINE_SIZE],
        }
    }

    fn read8(&self, off: usize) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.data[off..off + 8]);
        u64::from_le_bytes(b)
    }

    fn write8(&mut self, off: usize, val: u64) {
        self.dirty = true;
        self.data[off..off + 8].copy_from_slice(&val.to_le_bytes());
    }
}

struct Set {
    ways: [Line; NUM_WAYS],
    /// Names the victim way (0 or 1).
    lru: u8,
}

impl Set {
    fn new() -> Self {
        Set {
            ways: [Line::empty(); NUM_WAYS],
            lru: 0,
        }
    }

    /// A line is present iff some way is valid, matches the tag, and is not I.
    fn lookup(&self, tag: u64) -> Option<usize> {
        self.ways
            .iter()
            .position(|w| w.valid && w.tag == tag && w.state != MesiState::Invalid)
    }

    fn touch(&mut self, way_mru: usize) {
        self.lru = if way_mru == 0 { 1 } else { 0 };
    }

    fn victim_way(&self) -> usize {
        self.lru as usize
    }
}

struct CacheInner {
    sets: [Set; NUM_SETS],
    metrics: CacheMetrics,
}

pub struct Cache {
    pe_id: usize,
    bus: OnceLock<Weak<Bus>>,
    inner: Mutex<CacheInner>,
}

impl Cache {
    pub fn new(pe_id: usize) -> Arc<Self> {
        Arc::new(Cache {
            pe_id,
            bus: OnceLock::new(),
            inner: Mutex::new(CacheInner {
                sets: std::array::from_fn(|_| Set::new()),
                metrics: CacheMetrics::default(),
            }),
        })
    }

    pub fn pe_id(&self) -> usize {
        self.pe_id
    }

    /// Installed by `Bus::connect`; unconnected caches simply drop their
    /// emissions, which the pure-cache unit tests rely on.
    pub(crate) fn attach_bus(&self, bus: &Arc<Bus>) {
        let _ = self.bus.set(Arc::downgrade(bus));
    }

    fn bus(&self) -> Option<Arc<Bus>> {
        self.bus.get().and_then(Weak::upgrade)
    }

    fn emit(&self, t: BusTransaction) {
        if let Some(bus) = self.bus() {
            bus.emit(t);
        }
    }

    fn emit_flush(&self, base: Addr, data: [u8; LINE_SIZE]) {
        self.inner.lock().metrics.flush += 1;
        self.emit(BusTransaction::flush(base, data, self.pe_id));
    }

    /// 8-byte load. `None` means the line was missing: a BusRd has been
    /// emitted and the caller must retry once the data response landed.
    pub fn load(&self, addr: Addr) -> Option<u64> {
        let mut inner = self.inner.lock();
        let CacheInner { sets, metrics } = &mut *inner;
        let set = &mut sets[addr.index()];
        if let Some(way) = set.lookup(addr.tag()) {
            metrics.loads += 1;
            metrics.rw_accesses += 1;
            let val = set.ways[way].read8(addr.offset());
            set.touch(way);
            return Some(val);
        }
        metrics.cache_misses += 1;
        metrics.bus_rd += 1;
        drop(inner);
        trace!("cache {}: load miss @{addr}", self.pe_id);
        self.emit(BusTransaction::new(BusSignal::BusRd, addr, self.pe_id));
        None
    }

    /// 8-byte store. `false` means write-allocate is in flight: a BusRdX has
    /// been emitted and the caller must retry.
    pub fn store(&self, addr: Addr, val: u64) -> bool {
        let mut inner = self.inner.lock();
        let CacheInner { sets, metrics } = &mut *inner;
        let set = &mut sets[addr.index()];
        let Some(way) = set.lookup(addr.tag()) else {
            metrics.cache_misses += 1;
            metrics.bus_rdx += 1;
            drop(inner);
            trace!("cache {}: store miss @{addr}", self.pe_id);
            self.emit(BusTransaction::new(BusSignal::BusRdX, addr, self.pe_id));
            return false;
        };
        match set.ways[way].state {
            MesiState::Modified => {
                set.ways[way].write8(addr.offset(), val);
                set.touch(way);
                metrics.stores += 1;
                metrics.rw_accesses += 1;
                true
            }
            MesiState::Exclusive => {
                metrics.record_transition(MesiState::Exclusive, MesiState::Modified);
                set.ways[way].state = MesiState::Modified;
                set.ways[way].write8(addr.offset(), val);
                set.touch(way);
                metrics.stores += 1;
                metrics.rw_accesses += 1;
                true
            }
            MesiState::Shared => {
                drop(inner);
                // Upgrade and write under the bus lock so no other
                // transaction lands between the BusUpgr and the write.
                let bus = self.bus();
                let _serial = bus.as_ref().map(|b| b.serialize());
                {
                    // re-check now that the bus is ours; a peer's BusRdX may
                    // have invalidated the line before we serialised
                    let mut inner = self.inner.lock();
                    let CacheInner { sets, metrics } = &mut *inner;
                    let set = &mut sets[addr.index()];
                    if set.lookup(addr.tag()).is_none() {
                        return false;
                    }
                    metrics.bus_upgr += 1;
                }
                if let Some(b) = &bus {
                    b.emit(BusTransaction::new(BusSignal::BusUpgr, addr, self.pe_id));
                }
                let mut inner = self.inner.lock();
                let CacheInner { sets, metrics } = &mut *inner;
                let set = &mut sets[addr.index()];
                let Some(way) = set.lookup(addr.tag()) else {
                    return false;
                };
                metrics.record_transition(MesiState::Shared, MesiState::Modified);
                set.ways[way].state = MesiState::Modified;
                set.ways[way].write8(addr.offset(), val);
                set.touch(way);
                metrics.stores += 1;
                metrics.rw_accesses += 1;
                true
            }
            MesiState::Invalid => false,
        }
    }

    /// Data response from the interconnect: install as S when any peer still
    /// holds the line, as E otherwise.
    pub fn on_data_response(&self, addr: Addr, line: &[u8; LINE_SIZE], shared: bool) {
        let state = if shared {
            MesiState::Shared
        } else {
            MesiState::Exclusive
        };
        self.install_line(addr, line, state);
    }

    /// Pick a way (free slot first, else LRU victim), write back a Modified
    /// victim at the victim's own line base, then fill. Runs inside the bus
    /// critical section, so the two phases cannot be interleaved.
    fn install_line(&self, addr: Addr, data: &[u8; LINE_SIZE], state: MesiState) {
        let (way, victim_flush) = {
            let mut inner = self.inner.lock();
            let CacheInner { sets, metrics } = &mut *inner;
            let set = &mut sets[addr.index()];
            let way = set
                .ways
                .iter()
                .position(|w| !w.valid || w.state == MesiState::Invalid)
                .unwrap_or_else(|| set.victim_way());
            let victim = &set.ways[way];
            let mut flush = None;
            if victim.valid && victim.state != MesiState::Invalid {
                if victim.state == MesiState::Modified {
                    flush = Some((Addr::from_parts(victim.tag, addr.index()), victim.data));
                }
                metrics.record_transition(victim.state, MesiState::Invalid);
            }
            (way, flush)
        };
        if let Some((victim_base, victim_data)) = victim_flush {
            trace!("cache {}: evicting dirty line @{victim_base}", self.pe_id);
            self.emit_flush(victim_base, victim_data);
        }
        let mut inner = self.inner.lock();
        let CacheInner { sets, metrics } = &mut *inner;
        let set = &mut sets[addr.index()];
        let line = &mut set.ways[way];
        line.valid = true;
        line.dirty = state == MesiState::Modified;
        line.state = state;
        line.tag = addr.tag();
        line.data = *data;
        metrics.record_transition(MesiState::Invalid, state);
        set.touch(way);
    }

    /// Snoop from the interconnect for a transaction issued by another PE.
    pub fn on_snoop(&self, t: &BusTransaction) {
        let mut flush = None;
        {
            let mut inner = self.inner.lock();
            let CacheInner { sets, metrics } = &mut *inner;
            let set = &mut sets[t.addr.index()];
            let ttag = t.addr.tag();
            for line in set.ways.iter_mut() {
                if !(line.valid && line.tag == ttag) {
                    continue;
                }
                match t.signal {
                    BusSignal::BusRd => match line.state {
                        MesiState::Modified => {
                            flush = Some(line.data);
                            metrics.record_transition(MesiState::Modified, MesiState::Shared);
                            line.state = MesiState::Shared;
                            line.dirty = false;
                        }
                        MesiState::Exclusive => {
                            metrics.record_transition(MesiState::Exclusive, MesiState::Shared);
                            line.state = MesiState::Shared;
                        }
                        MesiState::Shared | MesiState::Invalid => {}
                    },
                    BusSignal::BusRdX | BusSignal::Inv | BusSignal::BusUpgr => {
                        if line.state == MesiState::Modified {
                            flush = Some(line.data);
                        }
                        if line.state != MesiState::Invalid {
                            metrics.invalidations += 1;
                            metrics.record_transition(line.state, MesiState::Invalid);
                            line.state = MesiState::Invalid;
                            line.dirty = false;
                        }
                    }
                    BusSignal::Flush => {}
                }
            }
        }
        if let Some(data) = flush {
            self.emit_flush(t.addr.line_base(), data);
        }
    }

    /// Whether this cache holds a valid non-I copy of the addressed line.
    pub fn has_line(&self, addr: Addr) -> bool {
        self.inner.lock().sets[addr.index()].lookup(addr.tag()).is_some()
    }

    /// Current MESI state of the addressed line, if resident.
    pub fn state_of(&self, addr: Addr) -> Option<MesiState> {
        let inner = self.inner.lock();
        let set = &inner.sets[addr.index()];
        set.lookup(addr.tag()).map(|way| set.ways[way].state)
    }

    pub fn metrics(&self) -> CacheMetrics {
        self.inner.lock().metrics.clone()
    }

    /// Line table rendering, shown by the stepper.
    pub fn dump_state(&self) -> String {
        let inner = self.inner.lock();
        let mut s = String::new();
        let _ = writeln!(s, "cache {} (PE{}):", self.pe_id, self.pe_id);
        for (i, set) in inner.sets.iter().enumerate() {
            for (w, line) in set.ways.iter().enumerate() {
                if !line.valid {
                    continue;
                }
                let base = Addr::from_parts(line.tag, i);
                let _ = writeln!(
                    s,
                    "  set {i} way {w}: {base} state={} dirty={}",
                    line.state, line.dirty
                );
            }
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_bytes(fill: u8) -> [u8; LINE_SIZE] {
        [fill; LINE_SIZE]
    }

    #[test]
    fn load_misses_until_installed() {
        let c = Cache::new(0);
        let addr = Addr(0x100);
        assert_eq!(c.load(addr), None);
        c.on_data_response(addr, &line_bytes(0x11), false);
        assert_eq!(c.load(addr), Some(0x1111111111111111));
        assert_eq!(c.state_of(addr), Some(MesiState::Exclusive));
        let m = c.metrics();
        assert_eq!(m.cache_misses, 1);
        assert_eq!(m.bus_rd, 1);
        assert_eq!(m.loads, 1);
        assert_eq!(m.rw_accesses, 1);
    }

    #[test]
    fn store_on_exclusive_goes_modified_silently() {
        let c = Cache::new(0);
        let addr = Addr(0x40);
        c.on_data_response(addr, &line_bytes(0), false);
        assert!(c.store(addr, 0xdead));
        assert_eq!(c.state_of(addr), Some(MesiState::Modified));
        assert_eq!(c.load(addr), Some(0xdead));
        let m = c.metrics();
        assert_eq!(m.bus_upgr, 0);
        assert_eq!(m.mesi_trans[MesiState::Exclusive as usize][MesiState::Modified as usize], 1);
    }

    #[test]
    fn store_on_shared_upgrades() {
        let c = Cache::new(0);
        let addr = Addr(0x80);
        c.on_data_response(addr, &line_bytes(0), true);
        assert_eq!(c.state_of(addr), Some(MesiState::Shared));
        assert!(c.store(addr, 7));
        assert_eq!(c.state_of(addr), Some(MesiState::Modified));
        let m = c.metrics();
        assert_eq!(m.bus_upgr, 1);
        assert_eq!(m.mesi_trans[MesiState::Shared as usize][MesiState::Modified as usize], 1);
    }

    #[test]
    fn store_miss_counts_rdx() {
        let c = Cache::new(0);
        assert!(!c.store(Addr(0x200), 1));
        let m = c.metrics();
        assert_eq!(m.cache_misses, 1);
        assert_eq!(m.bus_rdx, 1);
        assert_eq!(m.stores, 0);
        assert_eq!(m.rw_accesses, 0);
    }

    #[test]
    fn snoop_busrd_downgrades_modified() {
        let c = Cache::new(0);
        let addr = Addr(0x100);
        c.on_data_response(addr, &line_bytes(0), false);
        assert!(c.store(addr, 0xbeef));
        c.on_snoop(&BusTransaction::new(BusSignal::BusRd, addr, 1));
        assert_eq!(c.state_of(addr), Some(MesiState::Shared));
        let m = c.metrics();
        assert_eq!(m.flush, 1);
        assert_eq!(m.invalidations, 0);
        assert_eq!(m.mesi_trans[MesiState::Modified as usize][MesiState::Shared as usize], 1);
    }

    #[test]
    fn snoop_rdx_invalidates_any_valid_state() {
        for (shared, from) in [(true, MesiState::Shared), (false, MesiState::Exclusive)] {
            let c = Cache::new(0);
            let addr = Addr(0x100);
            c.on_data_response(addr, &line_bytes(0), shared);
            c.on_snoop(&BusTransaction::new(BusSignal::BusRdX, addr, 1));
            assert_eq!(c.state_of(addr), None);
            let m = c.metrics();
            assert_eq!(m.invalidations, 1);
            assert_eq!(m.mesi_trans[from as usize][MesiState::Invalid as usize], 1);
        }
    }

    #[test]
    fn snoop_other_line_is_noop() {
        let c = Cache::new(0);
        let addr = Addr(0x100);
        c.on_data_response(addr, &line_bytes(0), false);
        // same set, different tag
        c.on_snoop(&BusTransaction::new(BusSignal::BusRdX, Addr(0x200), 1));
        assert_eq!(c.state_of(addr), Some(MesiState::Exclusive));
        assert_eq!(c.metrics().invalidations, 0);
    }

    #[test]
    fn install_evicts_lru_and_flushes_dirty_victim() {
        let c = Cache::new(0);
        // three tags mapping to set 0
        let (a, b, d) = (Addr(0x000), Addr(0x100), Addr(0x200));
        c.on_data_response(a, &line_bytes(1), false);
        assert!(c.store(a, 0xa1)); // way holding `a` is now M
        c.on_data_response(b, &line_bytes(2), false);
        assert!(c.load(b).is_some()); // `b` is MRU, `a` is the victim
        c.on_data_response(d, &line_bytes(3), false);
        assert_eq!(c.state_of(a), None);
        assert_eq!(c.state_of(b), Some(MesiState::Exclusive));
        assert_eq!(c.state_of(d), Some(MesiState::Exclusive));
        let m = c.metrics();
        assert_eq!(m.flush, 1);
        assert_eq!(m.mesi_trans[MesiState::Modified as usize][MesiState::Invalid as usize], 1);
    }
}
