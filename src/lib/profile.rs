use crate::bits::Bits;
use crate::code::Instruction;
use crate::token::Vocabulary;

/// An inclusive bit span `[hi..lo]` within an instruction word.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct BitRange {
    pub hi: usize,
    pub lo: usize,
}

impl BitRange {
    pub const fn new(hi: usize, lo: usize) -> Self {
        Self { hi, lo }
    }

    pub const fn bit(b: usize) -> Self {
        Self { hi: b, lo: b }
    }

    pub const fn width(&self) -> usize {
        self.hi - self.lo + 1
    }

    /// The same field, `by` bits higher. Used by extended litters that
    /// relocate a base litter's fields.
    pub const fn shifted(&self, by: usize) -> Self {
        Self {
            hi: self.hi + by,
            lo: self.lo + by,
        }
    }
}

/// Dram command kinds. Odd phases carry row commands, even phases column
/// commands; NOP is legal on any phase.
///
/// Power-down entry and self-refresh exit share a single variant because
/// they share an encoding in the hardware tables; the aliasing is
/// deliberate and must not be disambiguated.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum DramCmd {
    Nop,
    Act,
    Pre,
    Ref,
    PdeSrx,
    Read,
    Write,
}

impl DramCmd {
    pub fn is_row(&self) -> bool {
        matches!(self, DramCmd::Act | DramCmd::Pre | DramCmd::Ref | DramCmd::PdeSrx)
    }

    pub fn is_column(&self) -> bool {
        matches!(self, DramCmd::Read | DramCmd::Write)
    }
}

/// The capability surface one hardware generation ("litter") supplies to
/// the core: widths, the token vocabulary, field offsets, default-bit
/// policy and end-of-file trailer behaviour. The core owns no
/// architecture-specific knowledge of its own.
pub trait Litter {
    fn name(&self) -> &'static str;

    // Widths and counts.
    fn instruction_width(&self) -> usize;
    fn max_fbpas(&self) -> usize;
    /// Each FBPA contributes two lanes (subpartitions) to the thread mask.
    fn lane_mask_width(&self) -> usize {
        2 * self.max_fbpas()
    }
    fn phases(&self) -> usize;
    fn channels(&self) -> usize;
    fn has_channel_tokens(&self) -> bool {
        self.channels() > 1
    }
    fn num_registers(&self) -> usize;
    fn register_width(&self) -> usize;
    fn dq_width(&self) -> usize;
    fn ecc_width(&self) -> usize;
    fn dbi_width(&self) -> usize;

    /// Reserved words and symbols handed to the Tokenizer.
    fn vocabulary(&self) -> &Vocabulary;

    /// Default-bit policy, applied to every instruction word at output
    /// time. Defaults never override explicitly written bits.
    fn apply_defaults(&self, bits: &mut Bits);

    // Field accessors.
    fn command_field(&self, phase: usize, channel: usize) -> BitRange;
    fn command_encoding(&self, cmd: DramCmd) -> u64;
    fn bank_field(&self, channel: usize) -> BitRange;
    fn rowcol_field(&self, channel: usize) -> BitRange;
    fn pattern_field(&self, channel: usize) -> BitRange;
    fn reg_load_en(&self) -> BitRange;
    fn reg_load_index(&self) -> BitRange;
    fn reg_load_value(&self) -> BitRange;
    fn reg_load_incr(&self) -> BitRange;
    fn reg_load_prbs(&self) -> BitRange;
    fn incr_mask(&self) -> BitRange;
    fn hold_field(&self) -> BitRange;
    fn stop_bit(&self) -> BitRange;
    fn cke_bit(&self) -> BitRange;
    fn use_dbi_bit(&self) -> BitRange;
    fn ila_bit(&self) -> BitRange;
    fn cal_field(&self) -> BitRange;
    fn branch_mode(&self) -> BitRange;
    fn branch_target(&self) -> BitRange;
    /// Refresh-management control, where the generation has one.
    fn rfm_bit(&self) -> Option<BitRange> {
        None
    }

    /// Architecture-specific control bit implied by a command, e.g. a
    /// generation whose REF commands must also raise refresh management.
    /// Applied as a default, so an explicit statement still wins.
    fn command_control(
        &self,
        cmd: DramCmd,
        phase: usize,
        channel: usize,
    ) -> Option<(BitRange, u64)> {
        let _ = (cmd, phase, channel);
        None
    }

    /// Append any mandatory trailer instructions at end of file.
    fn append_trailer<'a>(&self, instructions: &mut Vec<Instruction<'a>>);
}

/// The trailer policy shared by the shipped litters: a program must end in
/// a terminal stop, and a branch must never be the last instruction (its
/// delay slot would fall off the end). Inserts a no-op landing pad after a
/// trailing branch, then a stop unless the program already ends in one.
pub fn standard_trailer<'a>(
    litter: &dyn Litter,
    instructions: &mut Vec<Instruction<'a>>,
) {
    let width = litter.instruction_width();
    let (branch_last, stops) = match instructions.last() {
        Some(last) => {
            let bits = last.output_bits(litter);
            let mode = litter.branch_mode();
            let stop = litter.stop_bit();
            (
                bits.get_bits(mode.hi, mode.lo) != 0,
                bits.get_bits(stop.hi, stop.lo) == 1,
            )
        }
        None => (false, false),
    };
    if branch_last {
        // Landing pad; all defaults.
        instructions.push(Instruction::synthetic(width));
    }
    if branch_last || !stops {
        let mut stop = Instruction::synthetic(width);
        stop.set_raw(litter.stop_bit(), 1);
        instructions.push(stop);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_range_geometry() {
        let r = BitRange::new(11, 4);
        assert_eq!(r.width(), 8);
        assert_eq!(r.shifted(24), BitRange::new(35, 28));
        assert_eq!(BitRange::bit(7).width(), 1);
    }
}
