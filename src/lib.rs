//! Simulator of a small shared-memory multiprocessor: four register-machine
//! PEs with private MESI L1 caches kept coherent over a snooping bus backed
//! by one shared memory.

pub mod bus;
pub mod cache;
pub mod commons;
pub mod memory;
pub mod metrics;
pub mod port;
pub mod processor;
pub mod stepper;
