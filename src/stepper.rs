//! Interactive stepper: pauses the bus between events and dumps the state of
//! every cache and the shared memory so the protocol can be watched.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use crate::bus::BusObserver;
use crate::cache::Cache;
use crate::commons::BusSignal;
use crate::memory::SharedMemory;

pub struct Stepper {
    enabled: AtomicBool,
    editor: Mutex<DefaultEditor>,
}

impl Stepper {
    pub fn new() -> rustyline::Result<Self> {
        Ok(Stepper {
            enabled: AtomicBool::new(true),
            editor: Mutex::new(DefaultEditor::new()?),
        })
    }

    fn prompt(&self) {
        let mut editor = self.editor.lock();
        loop {
            match editor.readline("(step) ") {
                Ok(line) => match line.trim() {
                    "" => return,
                    "c" => {
                        self.enabled.store(false, Ordering::Relaxed);
                        return;
                    }
                    "q" => std::process::exit(0),
                    other => {
                        eprintln!("unknown command '{other}': Enter steps, 'c' continues without pausing, 'q' quits");
                    }
                },
                Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => {
                    std::process::exit(0);
                }
                Err(_) => {
                    // input is gone; stop pausing rather than spin
                    self.enabled.store(false, Ordering::Relaxed);
                    return;
                }
            }
        }
    }
}

impl BusObserver for Stepper {
    fn pause(&self, signal: BusSignal, caches: &[Arc<Cache>], shm: &SharedMemory) {
        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }
        println!("\n========== bus event: {signal} ==========");
        for cache in caches {
            print!("{}", cache.dump_state());
        }
        print!("{}", shm.dump_stats());
        self.prompt();
    }
}
