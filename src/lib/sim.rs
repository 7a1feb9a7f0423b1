//! Discrete per-cycle simulation of assembled threads.
//!
//! Each thread runs in isolation against its own register file, row state
//! and memory contents. Memory is sparse: a cell exists only once written,
//! and reading a cell that was never written is itself a reportable fault.

use ahash::AHashMap;
use log::{debug, trace};

use crate::bits::Bits;
use crate::profile::{BitRange, Litter};
use crate::program::Thread;

/// Why a thread's simulation ended.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum Outcome {
    /// A stop bit was executed.
    Stopped,
    /// Execution fell off the end of the instruction list.
    ReachedEnd,
    /// The cycle budget ran out first.
    CycleBudget,
    /// A branch landed beyond the end of the program.
    Aborted,
}

/// Everything observable about one thread's run.
#[derive(Debug)]
pub struct ThreadReport {
    pub mask: u64,
    pub cycles: u64,
    pub outcome: Outcome,
    /// Sticky: set by the first faulting read and never cleared.
    pub read_error: bool,
    pub registers: Vec<u64>,
    pub diagnostics: Vec<String>,
}

/// Advance a 15-bit PRBS state by one step (x^15 + x^14 + 1).
pub fn prbs15_next(value: u64) -> u64 {
    let bit = ((value >> 14) ^ (value >> 13)) & 1;
    ((value << 1) | bit) & 0x7FFF
}

#[derive(Debug, Default, Clone)]
struct Register {
    value: u64,
    step: u64,
    prbs: bool,
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
struct MemCell {
    dq: u64,
    ecc: u8,
}

/// One pattern entry flattened for fast access during simulation.
struct Pattern {
    dq: u64,
    ecc: u8,
    dbi: u8,
}

/// Invert the DQ bytes flagged by the DBI mask.
fn apply_dbi(dq: u64, dbi: u8) -> u64 {
    let mut out = dq;
    for byte in 0..8 {
        if dbi >> byte & 1 == 1 {
            out ^= 0xFFu64 << (byte * 8);
        }
    }
    out
}

/// The low 64 bits of a bit string; pattern DQ regions are exactly 64 wide
/// on the shipped litters.
fn low64(bits: &Bits) -> u64 {
    let words = bits.words();
    let lo = words.first().copied().unwrap_or(0) as u64;
    let hi = words.get(1).copied().unwrap_or(0) as u64;
    lo | (hi << 32)
}

struct Machine<'l> {
    litter: &'l dyn Litter,
    words: Vec<Bits>,
    patterns: Vec<Pattern>,
    registers: Vec<Register>,
    reg_mask: u64,
    open_rows: AHashMap<u64, u64>,
    memory: AHashMap<(u64, u64, u64), MemCell>,
    read_error: bool,
    diagnostics: Vec<String>,
}

impl<'l> Machine<'l> {
    fn new(litter: &'l dyn Litter, thread: &Thread) -> Self {
        let words = thread
            .instructions
            .iter()
            .map(|i| i.output_bits(litter))
            .collect();
        let patterns = thread
            .patrams
            .iter()
            .map(|p| Pattern {
                dq: low64(p.dq()),
                ecc: p.ecc().get_bits(7, 0) as u8,
                dbi: p.dbi().get_bits(7, 0) as u8,
            })
            .collect();
        Self {
            litter,
            words,
            patterns,
            registers: vec![Register::default(); litter.num_registers()],
            reg_mask: (1u64 << litter.register_width()) - 1,
            open_rows: AHashMap::new(),
            memory: AHashMap::new(),
            read_error: false,
            diagnostics: Vec::new(),
        }
    }

    fn field(&self, pc: usize, range: BitRange) -> u64 {
        self.words[pc].get_bits(range.hi, range.lo)
    }

    fn reg_value(&self, pc: usize, selector: BitRange) -> u64 {
        let index = self.field(pc, selector) as usize;
        self.registers[index].value
    }

    fn fault(&mut self, cycle: u64, message: String) {
        self.read_error = true;
        self.diagnostics.push(format!("cycle {cycle}: {message}"));
    }

    /// The pattern indexed by the pattern register, wrapping modulo the
    /// table size. An empty table cannot satisfy any access.
    fn pattern(&mut self, pc: usize, channel: usize, cycle: u64) -> Option<usize> {
        if self.patterns.is_empty() {
            self.fault(cycle, "pattern access with no PATRAM entries".to_owned());
            return None;
        }
        let index = self.reg_value(pc, self.litter.pattern_field(channel));
        Some(index as usize % self.patterns.len())
    }

    /// Execute the dram command on one (phase, channel) slot.
    fn dram_slot(&mut self, pc: usize, phase: usize, channel: usize, cycle: u64) {
        let cmd = self.field(pc, self.litter.command_field(phase, channel));
        if cmd == 0 {
            return;
        }
        let bank = self.reg_value(pc, self.litter.bank_field(channel));
        if phase % 2 == 1 {
            // Row commands.
            match cmd {
                1 => {
                    let row = self.reg_value(pc, self.litter.rowcol_field(channel));
                    if let Some(open) = self.open_rows.get(&bank) {
                        self.diagnostics.push(format!(
                            "cycle {cycle}: activate of bank {bank} which already \
                             has row {open} open"
                        ));
                    }
                    trace!("cycle {cycle}: ACT bank {bank} row {row}");
                    self.open_rows.insert(bank, row);
                }
                2 => {
                    trace!("cycle {cycle}: PRE bank {bank}");
                    self.open_rows.remove(&bank);
                }
                // REF and PDE/SRX have no observable effect on this model.
                _ => {}
            }
            return;
        }
        // Column commands need an open row and a pattern.
        let col = self.reg_value(pc, self.litter.rowcol_field(channel));
        let use_dbi = self.field(pc, self.litter.use_dbi_bit()) == 1;
        match cmd {
            1 => {
                let Some(row) = self.open_rows.get(&bank).copied() else {
                    self.fault(cycle, format!("read from closed bank {bank}"));
                    return;
                };
                let Some(p) = self.pattern(pc, channel, cycle) else {
                    return;
                };
                let pattern = &self.patterns[p];
                let dq = if use_dbi {
                    apply_dbi(pattern.dq, pattern.dbi)
                } else {
                    pattern.dq
                };
                let expected = MemCell {
                    dq,
                    ecc: pattern.ecc,
                };
                match self.memory.get(&(bank, row, col)).copied() {
                    None => self.fault(
                        cycle,
                        format!(
                            "read of never-written cell bank {bank} row {row} \
                             col {col}"
                        ),
                    ),
                    Some(cell) if cell != expected => self.fault(
                        cycle,
                        format!(
                            "read mismatch at bank {bank} row {row} col {col}: \
                             got {:#018x}/{:#04x}, expected {:#018x}/{:#04x}",
                            cell.dq, cell.ecc, expected.dq, expected.ecc
                        ),
                    ),
                    Some(_) => {
                        trace!("cycle {cycle}: READ bank {bank} row {row} col {col} ok")
                    }
                }
            }
            2 => {
                let Some(row) = self.open_rows.get(&bank).copied() else {
                    self.fault(cycle, format!("write to closed bank {bank}"));
                    return;
                };
                let Some(p) = self.pattern(pc, channel, cycle) else {
                    return;
                };
                let pattern = &self.patterns[p];
                let dq = if use_dbi {
                    apply_dbi(pattern.dq, pattern.dbi)
                } else {
                    pattern.dq
                };
                trace!("cycle {cycle}: WRITE bank {bank} row {row} col {col}");
                self.memory.insert(
                    (bank, row, col),
                    MemCell {
                        dq,
                        ecc: pattern.ecc,
                    },
                );
            }
            _ => {}
        }
    }

    /// Step the registers named by the increment mask.
    fn increments(&mut self, pc: usize) {
        let mask = self.field(pc, self.litter.incr_mask());
        for (index, reg) in self.registers.iter_mut().enumerate() {
            if mask >> index & 1 == 1 {
                let next = if reg.prbs {
                    prbs15_next(reg.value)
                } else {
                    reg.value.wrapping_add(reg.step)
                };
                reg.value = next & self.reg_mask;
            }
        }
    }

    /// Perform the register load, if the instruction carries one. Loads
    /// land after increments, so a load takes effect untouched.
    fn load(&mut self, pc: usize) {
        if self.field(pc, self.litter.reg_load_en()) != 1 {
            return;
        }
        let index = self.field(pc, self.litter.reg_load_index()) as usize;
        let reg = &mut self.registers[index];
        reg.value = self.words[pc]
            .get_bits(
                self.litter.reg_load_value().hi,
                self.litter.reg_load_value().lo,
            )
            & self.reg_mask;
        reg.step = self.words[pc].get_bits(
            self.litter.reg_load_incr().hi,
            self.litter.reg_load_incr().lo,
        );
        reg.prbs = self.words[pc].get_bits(
            self.litter.reg_load_prbs().hi,
            self.litter.reg_load_prbs().lo,
        ) == 1;
        trace!(
            "load R{index} = {:#x} step {:#x} prbs {}",
            reg.value,
            reg.step,
            reg.prbs
        );
    }
}

/// Advance the program counter at the end of a cycle. A ready branch wins
/// over everything else and discards any hold still in progress; a freshly
/// enqueued branch ripens through its one-cycle delay slot; otherwise the
/// PC moves linearly unless a hold keeps the instruction occupied.
fn advance(pc: &mut usize, pending: &mut Option<(u64, bool)>, stall: &mut u64) {
    match pending.take() {
        Some((target, true)) => {
            *pc = target as usize;
            *stall = 0;
        }
        Some((target, false)) => {
            *pending = Some((target, true));
            if *stall == 0 {
                *pc += 1;
            }
        }
        None => {
            if *stall == 0 {
                *pc += 1;
            }
        }
    }
}

/// Simulate one thread to completion.
pub fn run_thread(litter: &dyn Litter, thread: &Thread) -> ThreadReport {
    let mut machine = Machine::new(litter, thread);
    let len = machine.words.len();
    let mut pc = 0usize;
    let mut cycles = 0u64;
    let mut stall = 0u64;
    let mut pending: Option<(u64, bool)> = None;
    debug!(
        "simulating thread {:#x}: {len} instruction(s), budget {}",
        thread.mask, thread.max_cycles
    );
    let outcome = loop {
        if pc > len {
            machine.diagnostics.push(format!(
                "cycle {cycles}: branch to {pc} is outside the \
                 {len}-instruction program"
            ));
            break Outcome::Aborted;
        }
        if pc == len {
            break Outcome::ReachedEnd;
        }
        if cycles >= thread.max_cycles {
            break Outcome::CycleBudget;
        }
        cycles += 1;
        if stall > 0 {
            // A held instruction occupies extra cycles after its first.
            stall -= 1;
            advance(&mut pc, &mut pending, &mut stall);
            continue;
        }
        stall = machine.field(pc, litter.hold_field());
        let stop = machine.field(pc, litter.stop_bit()) == 1;
        if machine.field(pc, litter.cke_bit()) == 1 {
            for phase in 0..litter.phases() {
                for channel in 0..litter.channels() {
                    machine.dram_slot(pc, phase, channel, cycles);
                }
            }
        }
        let mode = machine.field(pc, litter.branch_mode());
        if mode != 0 && pending.is_none() {
            let taken = match mode {
                1 => true,
                2 => machine.read_error,
                3 => !machine.read_error,
                _ => false,
            };
            if taken {
                let target = machine.field(pc, litter.branch_target());
                pending = Some((target, false));
            }
        }
        machine.increments(pc);
        machine.load(pc);
        if stop {
            break Outcome::Stopped;
        }
        advance(&mut pc, &mut pending, &mut stall);
    };
    debug!(
        "thread {:#x} finished: {outcome:?} after {cycles} cycle(s)",
        thread.mask
    );
    ThreadReport {
        mask: thread.mask,
        cycles,
        outcome,
        read_error: machine.read_error,
        registers: machine.registers.iter().map(|r| r.value).collect(),
        diagnostics: machine.diagnostics,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init_test_logging;

    #[test]
    fn prbs_sequence_properties() {
        init_test_logging();
        // The generator stays within 15 bits and never leaves a non-zero
        // orbit.
        let mut value = 1;
        for _ in 0..100 {
            value = prbs15_next(value);
            assert!(value < 1 << 15);
            assert_ne!(value, 0);
        }
        // All-zero is the one fixed point.
        assert_eq!(prbs15_next(0), 0);
    }

    #[test]
    fn prbs_full_period() {
        init_test_logging();
        let start = 0x1234;
        let mut value = prbs15_next(start);
        let mut steps = 1u64;
        while value != start {
            value = prbs15_next(value);
            steps += 1;
            assert!(steps <= 1 << 15, "orbit does not close");
        }
        assert_eq!(steps, (1 << 15) - 1);
    }

    #[test]
    fn dbi_inverts_flagged_bytes() {
        init_test_logging();
        assert_eq!(apply_dbi(0, 0x01), 0xFF);
        assert_eq!(apply_dbi(0, 0x80), 0xFF << 56);
        assert_eq!(apply_dbi(0xAAAA, 0x00), 0xAAAA);
        // Applying the same mask twice round-trips.
        let dq = 0xDEADBEEF_CAFEF00D;
        assert_eq!(apply_dbi(apply_dbi(dq, 0x5C), 0x5C), dq);
    }

    #[test]
    fn advance_honours_the_delay_slot() {
        init_test_logging();
        let mut pc = 0;
        let mut stall = 0;
        let mut pending = Some((7u64, false));
        // First boundary: the branch ripens, the next instruction runs.
        advance(&mut pc, &mut pending, &mut stall);
        assert_eq!(pc, 1);
        assert_eq!(pending, Some((7, true)));
        // Second boundary: taken.
        advance(&mut pc, &mut pending, &mut stall);
        assert_eq!(pc, 7);
        assert_eq!(pending, None);
    }

    #[test]
    fn ready_branches_outrank_holds() {
        init_test_logging();
        let mut pc = 3;
        let mut stall = 4;
        let mut pending = Some((9u64, true));
        // The branch takes and the remaining hold is discarded.
        advance(&mut pc, &mut pending, &mut stall);
        assert_eq!(pc, 9);
        assert_eq!(stall, 0);
        assert_eq!(pending, None);
        // Without a ready branch the hold keeps the PC in place.
        let mut stall = 2;
        advance(&mut pc, &mut pending, &mut stall);
        assert_eq!(pc, 9);
        assert_eq!(stall, 2);
    }
}
