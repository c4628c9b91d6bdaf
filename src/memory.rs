//! Shared backing memory: a flat 4096-byte array serving sized reads and
//! writes under a single mutex.

use std::collections::HashMap;
use std::fmt::Write as _;

use parking_lot::Mutex;
use thiserror::Error;

use crate::commons::MEM_BYTES;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemError {
    #[error("access of {size} bytes at {addr:#x} is out of range (capacity {MEM_BYTES})")]
    OutOfRange { addr: u64, size: usize },
    #[error("write payload holds {have} bytes but {need} were requested")]
    ShortPayload { have: usize, need: usize },
}

#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct PeMemStats {
    pub reads: u64,
    pub writes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

#[derive(Clone, Default, Debug)]
pub struct MemStats {
    pub total_reads: u64,
    pub total_writes: u64,
    pub per_pe: HashMap<usize, PeMemStats>,
}

struct MemInner {
    bytes: Vec<u8>,
    stats: MemStats,
}

pub struct SharedMemory {
    inner: Mutex<MemInner>,
}

impl SharedMemory {
    pub fn new() -> Self {
        SharedMemory {
            inner: Mutex::new(MemInner {
                bytes: vec![0; MEM_BYTES],
                stats: MemStats::default(),
            }),
        }
    }

    fn check_range(addr: u64, size: usize) -> Result<(), MemError> {
        if size == 0 || size > MEM_BYTES || addr > (MEM_BYTES - size) as u64 {
            return Err(MemError::OutOfRange { addr, size });
        }
        Ok(())
    }

    /// Read `size` bytes starting at `addr`. The copy and the counter update
    /// are atomic with respect to every other request.
    pub fn read(&self, addr: u64, size: usize, requester: Option<usize>) -> Result<Vec<u8>, MemError> {
        Self::check_range(addr, size)?;
        let mut inner = self.inner.lock();
        let start = addr as usize;
        let out = inner.bytes[start..start + size].to_vec();
        inner.stats.total_reads += 1;
        if let Some(pe) = requester {
            let s = inner.stats.per_pe.entry(pe).or_default();
            s.reads += 1;
            s.bytes_read += size as u64;
        }
        Ok(out)
    }

    /// Write `size` bytes from `data` at `addr`. Nothing is written on error.
    pub fn write(&self, addr: u64, data: &[u8], size: usize, requester: Option<usize>) -> Result<(), MemError> {
        Self::check_range(addr, size)?;
        if data.len() < size {
            return Err(MemError::ShortPayload {
                have: data.len(),
                need: size,
            });
        }
        let mut inner = self.inner.lock();
        let start = addr as usize;
        inner.bytes[start..start + size].copy_from_slice(&data[..size]);
        inner.stats.total_writes += 1;
        if let Some(pe) = requester {
            let s = inner.stats.per_pe.entry(pe).or_default();
            s.writes += 1;
            s.bytes_written += size as u64;
        }
        Ok(())
    }

    pub fn stats(&self) -> MemStats {
        self.inner.lock().stats.clone()
    }

    /// Human-readable counter summary, shown by the stepper.
    pub fn dump_stats(&self) -> String {
        let stats = self.stats();
        let mut s = String::new();
        let _ = writeln!(
            s,
            "shared memory: reads={} writes={}",
            stats.total_reads, stats.total_writes
        );
        let mut pes: Vec<_> = stats.per_pe.iter().collect();
        pes.sort_by_key(|(pe, _)| **pe);
        for (pe, p) in pes {
            let _ = writeln!(
                s,
                "  PE{pe}: reads={} ({} B), writes={} ({} B)",
                p.reads, p.bytes_read, p.writes, p.bytes_written
            );
        }
        s
    }
}

impl Default for SharedMemory {
    fn default() -> Self {
        Self::new()
    }
}
