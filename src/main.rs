/*
    Driver for the four-PE MESI dot-product scenario: builds the memory
    layout, runs one thread per PE against the coherent memory system, then
    reports per-cache metrics and checks the numeric result.
*/

use std::fmt::Display;
use std::process;
use std::sync::Arc;
use std::thread;

use clap::{Parser, ValueEnum};
use env_logger::Env;
use log::info;
use thiserror::Error;

use cachesim_smp::bus::Bus;
use cachesim_smp::cache::Cache;
use cachesim_smp::commons::{LINE_SIZE, MEM_BYTES, NUM_PES};
use cachesim_smp::memory::SharedMemory;
use cachesim_smp::metrics::{self, CacheMetrics};
use cachesim_smp::port::{MemoryPort, MesiMemoryPort};
use cachesim_smp::processor::{dot_product_program, Processor};
use cachesim_smp::stepper::Stepper;

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum, Debug)]
enum Mode {
    /// Run the dot product to completion.
    Dot,
    /// Same, pausing interactively between bus events.
    Demo,
}

#[derive(Parser, Debug)]
#[command(name = "cachesim-smp")]
#[command(about = "Four-PE shared-memory multiprocessor with MESI snooping coherence")]
struct Args {
    /// Execution mode
    #[arg(long, value_enum, default_value = "dot")]
    mode: Mode,

    /// Vector length for the dot product
    #[arg(long = "N", default_value_t = 248)]
    n: usize,

    /// Disable pausing in demo mode
    #[arg(long)]
    nostep: bool,
}

#[derive(Debug, Error)]
enum LayoutError {
    #[error("N must be at least {NUM_PES} so every PE gets a non-empty segment (got {0})")]
    TooShort(usize),
    #[error("vectors for N={0} do not fit: 2*{0}*8 + 4*32 > {MEM_BYTES} bytes")]
    DoesNotFit(usize),
}

/// Fixed memory layout: A at 0, B right after, the four partial slots on the
/// last four lines so each PE's output owns a full line (no false sharing).
struct Layout {
    n: usize,
    base_a: u64,
    base_b: u64,
    partials: [u64; NUM_PES],
}

impl Layout {
    fn new(n: usize) -> Result<Layout, LayoutError> {
        if n < NUM_PES {
            return Err(LayoutError::TooShort(n));
        }
        let fits = n
            .checked_mul(2 * 8)
            .is_some_and(|v| v + NUM_PES * LINE_SIZE <= MEM_BYTES);
        if !fits {
            return Err(LayoutError::DoesNotFit(n));
        }
        let base_p = (MEM_BYTES - NUM_PES * LINE_SIZE) as u64;
        let mut partials = [0u64; NUM_PES];
        for (k, p) in partials.iter_mut().enumerate() {
            *p = base_p + (k * LINE_SIZE) as u64;
        }
        Ok(Layout {
            n,
            base_a: 0,
            base_b: (n * 8) as u64,
            partials,
        })
    }

    /// Contiguous quarter segments; the last PE takes the remainder.
    fn segment(&self, k: usize) -> (u64, u64, u64, u64) {
        let chunk = self.n / NUM_PES;
        let start = (k * chunk * 8) as u64;
        let len = if k == NUM_PES - 1 {
            (self.n - (NUM_PES - 1) * chunk) as u64
        } else {
            chunk as u64
        };
        (self.base_a + start, self.base_b + start, self.partials[k], len)
    }
}

fn shm_write_f64(shm: &SharedMemory, addr: u64, v: f64) {
    shm.write(addr, &v.to_bits().to_le_bytes(), 8, None)
        .expect("layout was validated against the memory capacity");
}

fn init_vectors(shm: &SharedMemory, layout: &Layout) {
    for i in 0..layout.n {
        shm_write_f64(shm, layout.base_a + (i * 8) as u64, (i + 1) as f64);
        shm_write_f64(shm, layout.base_b + (i * 8) as u64, 0.5 * (i + 1) as f64);
    }
    for &p in &layout.partials {
        shm_write_f64(shm, p, 0.0);
    }
}

fn format_row<T: Display>(v: &[T]) -> String {
    v.iter()
        .map(|x| format!("{x:<12}"))
        .collect::<Vec<_>>()
        .join(" | ")
}

fn print_stats(metrics: &[CacheMetrics], ports: &[MesiMemoryPort]) {
    println!("\nper-cache stats");
    println!(
        "{}",
        format_row(&(0..metrics.len()).map(|i| format!("PE{i}")).collect::<Vec<_>>())
    );
    let col = |f: fn(&CacheMetrics) -> u64, name: &str| {
        println!("{}\t\t{name}", format_row(&metrics.iter().map(f).collect::<Vec<_>>()));
    };
    col(|m| m.loads, "loads");
    col(|m| m.stores, "stores");
    col(|m| m.rw_accesses, "rw accesses");
    col(|m| m.cache_misses, "cache misses");
    col(|m| m.invalidations, "invalidations");
    col(|m| m.bus_rd, "BusRd");
    col(|m| m.bus_rdx, "BusRdX");
    col(|m| m.bus_upgr, "BusUpgr");
    col(|m| m.flush, "Flush");
    println!(
        "{}\t\tport ops (loads/stores)",
        format_row(
            &ports
                .iter()
                .map(|p| format!("{}/{}", p.loads(), p.stores()))
                .collect::<Vec<_>>()
        )
    );
}

fn main() {
    let env = Env::default().filter_or("CACHESIM_LOG", "warn");
    env_logger::init_from_env(env);

    let args = Args::parse();
    let layout = match Layout::new(args.n) {
        Ok(l) => l,
        Err(e) => {
            eprintln!("bad configuration: {e}");
            process::exit(2);
        }
    };

    let shm = Arc::new(SharedMemory::new());
    init_vectors(&shm, &layout);

    let bus = Bus::new(shm.clone());
    let caches: Vec<Arc<Cache>> = (0..NUM_PES).map(Cache::new).collect();
    for cache in &caches {
        bus.connect(cache.clone());
    }

    if args.mode == Mode::Demo && !args.nostep {
        match Stepper::new() {
            Ok(stepper) => bus.set_observer(Arc::new(stepper)),
            Err(e) => {
                eprintln!("bad configuration: cannot open stepper input: {e}");
                process::exit(2);
            }
        }
    }

    let mut ports: Vec<MesiMemoryPort> = caches
        .iter()
        .map(|c| MesiMemoryPort::new(c.clone()))
        .collect();
    let mut pes: Vec<Processor> = (0..NUM_PES).map(Processor::new).collect();
    let prog = dot_product_program();
    for (k, pe) in pes.iter_mut().enumerate() {
        let (a, b, out, len) = layout.segment(k);
        info!("seg{k}: A={a} B={b} out={out} len={len}");
        pe.load_program(prog.clone());
        pe.set_segment(a, b, out, len);
    }

    thread::scope(|s| {
        for (pe, port) in pes.iter_mut().zip(ports.iter_mut()) {
            s.spawn(move || pe.run(port, 0));
        }
    });

    // read the partials back through the coherent path
    let partials: Vec<f64> = layout
        .partials
        .iter()
        .map(|&p| f64::from_bits(ports[0].load64(p)))
        .collect();
    let result: f64 = partials.iter().sum();

    let n = layout.n as f64;
    let expected = 0.5 * (n * (n + 1.0) * (2.0 * n + 1.0) / 6.0);

    println!("partials = {partials:?}");
    println!("result   = {result}");
    println!("expected = {expected}");

    let snapshots: Vec<CacheMetrics> = caches.iter().map(|c| c.metrics()).collect();
    print_stats(&snapshots, &ports);
    println!("\n{}", shm.dump_stats());

    if let Err(e) = metrics::write_csv("cache_stats.csv", &snapshots) {
        eprintln!("could not write cache_stats.csv: {e}");
    }

    if (result - expected).abs() < 1e-9 * expected.abs().max(1.0) {
        println!("PASS dot product with MESI coherence");
    } else {
        eprintln!("FAIL: result deviates from expected beyond tolerance");
        process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_rejects_fewer_elements_than_pes() {
        // a zero-length segment would wrap the PE's loop counter on DEC
        assert!(matches!(Layout::new(3), Err(LayoutError::TooShort(3))));
        assert!(matches!(Layout::new(0), Err(LayoutError::TooShort(0))));
    }

    #[test]
    fn layout_rejects_vectors_that_do_not_fit() {
        assert!(matches!(Layout::new(249), Err(LayoutError::DoesNotFit(249))));
        assert!(matches!(Layout::new(4097), Err(LayoutError::DoesNotFit(4097))));
        // the size product must not wrap around before the comparison
        assert!(matches!(
            Layout::new(usize::MAX),
            Err(LayoutError::DoesNotFit(_))
        ));
    }

    #[test]
    fn layout_accepts_the_largest_n() {
        let layout = Layout::new(248).unwrap();
        assert_eq!(layout.base_a, 0);
        assert_eq!(layout.base_b, 248 * 8);
        assert_eq!(layout.partials, [3968, 4000, 4032, 4064]);
        // vectors end exactly where the partial lines begin
        assert_eq!(layout.base_b + 248 * 8, layout.partials[0]);
    }

    #[test]
    fn last_segment_takes_the_remainder() {
        let layout = Layout::new(247).unwrap();
        let lens: Vec<u64> = (0..NUM_PES).map(|k| layout.segment(k).3).collect();
        assert_eq!(lens, vec![61, 61, 61, 64]);
        assert_eq!(lens.iter().sum::<u64>(), 247);
    }
}
