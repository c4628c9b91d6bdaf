//! Processing element: eight 64-bit registers, a program counter, and a
//! nine-opcode ISA whose loads and stores drive the coherence protocol.

use log::info;

use crate::port::MemoryPort;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Op {
    Load,
    Store,
    Fmul,
    Fadd,
    Inc,
    Dec,
    Jnz,
    Lea,
    Halt,
}

#[derive(Clone, Copy, Debug)]
pub struct Instr {
    pub op: Op,
    pub d: u8,
    pub a: u8,
    pub b: u8,
    pub imm: i64,
}

impl Instr {
    pub fn new(op: Op, d: u8, a: u8, b: u8, imm: i64) -> Self {
        Instr { op, d, a, b, imm }
    }
}

pub type Program = Vec<Instr>;

pub struct Processor {
    id: usize,
    pc: u64,
    regs: [u64; 8],
    prog: Program,
}

impl Processor {
    pub fn new(id: usize) -> Self {
        Processor {
            id,
            pc: 0,
            regs: [0; 8],
            prog: Vec::new(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn load_program(&mut self, prog: Program) {
        self.prog = prog;
        self.pc = 0;
    }

    /// Register convention for the dot-product loop: R0=i, R1=baseA,
    /// R2=baseB, R3=acc, R5=partial_out, R7=limit; R4/R6 scratch.
    pub fn set_segment(&mut self, base_a: u64, base_b: u64, partial_out: u64, len: u64) {
        self.regs = [0; 8];
        self.regs[1] = base_a;
        self.regs[2] = base_b;
        self.regs[3] = 0.0f64.to_bits();
        self.regs[5] = partial_out;
        self.regs[7] = len;
    }

    pub fn regs(&self) -> &[u64; 8] {
        &self.regs
    }

    /// Execute until HALT, the PC leaving the program, or `max_steps`
    /// instructions (0 = no budget).
    pub fn run(&mut self, mem: &mut dyn MemoryPort, max_steps: u64) {
        let mut steps = 0u64;
        loop {
            if !self.step(mem) {
                break;
            }
            steps += 1;
            if max_steps != 0 && steps >= max_steps {
                info!("PE{}: step budget of {max_steps} exhausted", self.id);
                break;
            }
        }
    }

    /// One instruction; false once execution has halted.
    fn step(&mut self, mem: &mut dyn MemoryPort) -> bool {
        let Some(instr) = self.prog.get(self.pc as usize).copied() else {
            return false;
        };
        let (d, a, b) = (instr.d as usize, instr.a as usize, instr.b as usize);
        match instr.op {
            Op::Halt => return false,
            Op::Load => {
                self.regs[d] = mem.load64(self.regs[a]);
                self.pc += 1;
            }
            Op::Store => {
                mem.store64(self.regs[a], self.regs[d]);
                self.pc += 1;
            }
            Op::Fmul => {
                let x = f64::from_bits(self.regs[a]);
                let y = f64::from_bits(self.regs[b]);
                self.regs[d] = (x * y).to_bits();
                self.pc += 1;
            }
            Op::Fadd => {
                let x = f64::from_bits(self.regs[a]);
                let y = f64::from_bits(self.regs[b]);
                self.regs[d] = (x + y).to_bits();
                self.pc += 1;
            }
            Op::Inc => {
                self.regs[d] = self.regs[d].wrapping_add(1);
                self.pc += 1;
            }
            Op::Dec => {
                self.regs[d] = self.regs[d].wrapping_sub(1);
                self.pc += 1;
            }
            Op::Jnz => {
                if self.regs[d] != 0 {
                    self.pc = self.pc.wrapping_add_signed(instr.imm);
                } else {
                    self.pc += 1;
                }
            }
            Op::Lea => {
                self.regs[d] = self.regs[a].wrapping_add(self.regs[b] << instr.imm);
                self.pc += 1;
            }
        }
        true
    }
}

/// The canonical partial dot-product loop: acc += A[i]*B[i] over `limit`
/// elements, then store acc at the partial slot.
pub fn dot_product_program() -> Program {
    vec![
        Instr::new(Op::Lea, 4, 1, 0, 3),  // R4 = &A[i] = R1 + (R0 << 3)
        Instr::new(Op::Lea, 6, 2, 0, 3),  // R6 = &B[i]
        Instr::new(Op::Load, 4, 4, 0, 0), // R4 = A[i]
        Instr::new(Op::Load, 6, 6, 0, 0), // R6 = B[i]
        Instr::new(Op::Fmul, 4, 4, 6, 0), // R4 = A[i] * B[i]
        Instr::new(Op::Fadd, 3, 3, 4, 0), // acc += R4
        Instr::new(Op::Inc, 0, 0, 0, 0),  // i++
        Instr::new(Op::Dec, 7, 0, 0, 0),  // limit--
        Instr::new(Op::Jnz, 7, 0, 0, -8), // loop while limit != 0
        Instr::new(Op::Store, 3, 5, 0, 0),
        Instr::new(Op::Halt, 0, 0, 0, 0),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Word-addressed scratch memory standing in for the coherent path.
    #[derive(Default)]
    struct ScratchPort {
        words: HashMap<u64, u64>,
    }

    impl MemoryPort for ScratchPort {
        fn load64(&mut self, addr: u64) -> u64 {
            self.words.get(&addr).copied().unwrap_or(0)
        }
        fn store64(&mut self, addr: u64, val: u64) {
            self.words.insert(addr, val);
        }
    }

    #[test]
    fn lea_load_store() {
        let mut mem = ScratchPort::default();
        mem.store64(0x48, 99);
        let mut pe = Processor::new(0);
        pe.load_program(vec![
            Instr::new(Op::Lea, 2, 0, 1, 3), // R2 = R0 + (R1 << 3)
            Instr::new(Op::Load, 3, 2, 0, 0),
            Instr::new(Op::Store, 3, 4, 0, 0),
            Instr::new(Op::Halt, 0, 0, 0, 0),
        ]);
        pe.regs = [0x40, 1, 0, 0, 0x80, 0, 0, 0];
        pe.run(&mut mem, 0);
        assert_eq!(pe.regs()[2], 0x48);
        assert_eq!(pe.regs()[3], 99);
        assert_eq!(mem.load64(0x80), 99);
    }

    #[test]
    fn jnz_counts_down() {
        let mut mem = ScratchPort::default();
        let mut pe = Processor::new(0);
        pe.load_program(vec![
            Instr::new(Op::Inc, 1, 0, 0, 0),
            Instr::new(Op::Dec, 0, 0, 0, 0),
            Instr::new(Op::Jnz, 0, 0, 0, -2),
            Instr::new(Op::Halt, 0, 0, 0, 0),
        ]);
        pe.regs[0] = 5;
        pe.run(&mut mem, 0);
        assert_eq!(pe.regs()[0], 0);
        assert_eq!(pe.regs()[1], 5);
    }

    #[test]
    fn fmul_fadd_reinterpret_bits() {
        let mut mem = ScratchPort::default();
        let mut pe = Processor::new(0);
        pe.load_program(vec![
            Instr::new(Op::Fmul, 2, 0, 1, 0),
            Instr::new(Op::Fadd, 3, 2, 2, 0),
            Instr::new(Op::Halt, 0, 0, 0, 0),
        ]);
        pe.regs[0] = 1.5f64.to_bits();
        pe.regs[1] = 4.0f64.to_bits();
        pe.run(&mut mem, 0);
        assert_eq!(f64::from_bits(pe.regs()[2]), 6.0);
        assert_eq!(f64::from_bits(pe.regs()[3]), 12.0);
    }

    #[test]
    fn pc_past_end_halts() {
        let mut mem = ScratchPort::default();
        let mut pe = Processor::new(0);
        pe.load_program(vec![Instr::new(Op::Inc, 0, 0, 0, 0)]);
        pe.run(&mut mem, 0);
        assert_eq!(pe.regs()[0], 1);
    }

    #[test]
    fn max_steps_bounds_execution() {
        let mut mem = ScratchPort::default();
        let mut pe = Processor::new(0);
        // endless loop: INC then jump back
        pe.load_program(vec![
            Instr::new(Op::Inc, 0, 0, 0, 0),
            Instr::new(Op::Jnz, 0, 0, 0, -1),
        ]);
        pe.run(&mut mem, 10);
        assert!(pe.regs()[0] <= 10);
        assert!(pe.regs()[0] > 0);
    }

    #[test]
    fn dot_program_over_scratch_memory() {
        let mut mem = ScratchPort::default();
        let n = 8u64;
        for i in 0..n {
            mem.store64(i * 8, ((i + 1) as f64).to_bits());
            mem.store64(0x100 + i * 8, (0.5 * (i + 1) as f64).to_bits());
        }
        let mut pe = Processor::new(0);
        pe.load_program(dot_product_program());
        pe.set_segment(0, 0x100, 0x800, n);
        pe.run(&mut mem, 0);
        // 0.5 * sum i^2 for i in 1..=8
        let expected = 0.5 * 204.0;
        assert_eq!(f64::from_bits(mem.load64(0x800)), expected);
    }
}
