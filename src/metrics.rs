//! Per-cache coherence metrics and the CSV export consumed by the driver.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use crate::commons::MesiState;

/// Counters kept by each cache. The transition matrix is indexed by the
/// numeric MESI states (I=0, S=1, E=2, M=3); the log keeps the same
/// transitions in arrival order.
#[derive(Clone, Default, PartialEq, Eq, Debug)]
pub struct CacheMetrics {
    pub loads: u64,
    pub stores: u64,
    pub rw_accesses: u64,
    pub cache_misses: u64,
    pub invalidations: u64,
    pub bus_rd: u64,
    pub bus_rdx: u64,
    pub bus_upgr: u64,
    pub flush: u64,
    pub mesi_trans: [[u64; 4]; 4],
    pub transitions: Vec<String>,
}

impl CacheMetrics {
    pub fn record_transition(&mut self, from: MesiState, to: MesiState) {
        self.mesi_trans[from as usize][to as usize] += 1;
        self.transitions.push(format!("MESI: {}→{}", from as u8, to as u8));
    }
}

/// Write `cache_stats.csv` in the layout the metrics tooling expects:
/// one row per cache, transition log quoted and `"; "`-joined.
pub fn write_csv<P: AsRef<Path>>(path: P, metrics: &[CacheMetrics]) -> io::Result<()> {
    let mut f = File::create(path)?;
    writeln!(
        f,
        "PE,Loads,Stores,RW_Accesses,Cache_Misses,Invalidations,BusRd,BusRdX,BusUpgr,Flush,Transitions"
    )?;
    for (pe, m) in metrics.iter().enumerate() {
        writeln!(
            f,
            "{},{},{},{},{},{},{},{},{},{},\"{}\"",
            pe,
            m.loads,
            m.stores,
            m.rw_accesses,
            m.cache_misses,
            m.invalidations,
            m.bus_rd,
            m.bus_rdx,
            m.bus_upgr,
            m.flush,
            m.transitions.join("; ")
        )?;
    }
    Ok(())
}
