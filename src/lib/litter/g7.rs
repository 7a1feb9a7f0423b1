use crate::bits::Bits;
use crate::code::Instruction;
use crate::profile::{standard_trailer, BitRange, DramCmd, Litter};
use crate::token::{standard_symbols, Reserved, Vocabulary};

use super::g6::{base_words, G6};

/// Each channel's command and selector block is this wide; the control
/// block sits after both channels, so every base control field moves up by
/// one stride.
const CHANNEL_STRIDE: usize = 24;

/// The extended litter: two channels, a 192-bit word, twelve FBPAs and a
/// refresh-management bit. Everything it does not change is delegated to
/// the composed base table.
pub struct G7 {
    base: G6,
    vocab: Vocabulary,
}

impl G7 {
    pub fn new() -> Self {
        let mut words = base_words();
        words.push(("CHA", Reserved::Chan(0)));
        words.push(("CHB", Reserved::Chan(1)));
        words.push(("RFM", Reserved::Rfm));
        Self {
            base: G6::new(),
            vocab: Vocabulary::new(words, standard_symbols()),
        }
    }

    fn ctrl(&self, range: BitRange) -> BitRange {
        range.shifted(CHANNEL_STRIDE)
    }
}

impl Default for G7 {
    fn default() -> Self {
        Self::new()
    }
}

impl Litter for G7 {
    fn name(&self) -> &'static str {
        "g7"
    }

    fn instruction_width(&self) -> usize {
        192
    }

    fn max_fbpas(&self) -> usize {
        12
    }

    fn phases(&self) -> usize {
        self.base.phases()
    }

    fn channels(&self) -> usize {
        2
    }

    fn num_registers(&self) -> usize {
        self.base.num_registers()
    }

    fn register_width(&self) -> usize {
        self.base.register_width()
    }

    fn dq_width(&self) -> usize {
        self.base.dq_width()
    }

    fn ecc_width(&self) -> usize {
        self.base.ecc_width()
    }

    fn dbi_width(&self) -> usize {
        self.base.dbi_width()
    }

    fn vocabulary(&self) -> &Vocabulary {
        &self.vocab
    }

    fn apply_defaults(&self, bits: &mut Bits) {
        let cke = self.cke_bit();
        bits.set_default_bits(cke.hi, cke.lo, 1);
    }

    fn command_field(&self, phase: usize, channel: usize) -> BitRange {
        debug_assert!(channel < self.channels());
        self.base
            .command_field(phase, 0)
            .shifted(CHANNEL_STRIDE * channel)
    }

    fn command_encoding(&self, cmd: DramCmd) -> u64 {
        self.base.command_encoding(cmd)
    }

    fn bank_field(&self, channel: usize) -> BitRange {
        self.base.bank_field(0).shifted(CHANNEL_STRIDE * channel)
    }

    fn rowcol_field(&self, channel: usize) -> BitRange {
        self.base.rowcol_field(0).shifted(CHANNEL_STRIDE * channel)
    }

    fn pattern_field(&self, channel: usize) -> BitRange {
        self.base.pattern_field(0).shifted(CHANNEL_STRIDE * channel)
    }

    fn reg_load_en(&self) -> BitRange {
        self.ctrl(self.base.reg_load_en())
    }

    fn reg_load_index(&self) -> BitRange {
        self.ctrl(self.base.reg_load_index())
    }

    fn reg_load_value(&self) -> BitRange {
        self.ctrl(self.base.reg_load_value())
    }

    fn reg_load_incr(&self) -> BitRange {
        self.ctrl(self.base.reg_load_incr())
    }

    fn reg_load_prbs(&self) -> BitRange {
        self.ctrl(self.base.reg_load_prbs())
    }

    fn incr_mask(&self) -> BitRange {
        self.ctrl(self.base.incr_mask())
    }

    fn hold_field(&self) -> BitRange {
        self.ctrl(self.base.hold_field())
    }

    fn stop_bit(&self) -> BitRange {
        self.ctrl(self.base.stop_bit())
    }

    fn cke_bit(&self) -> BitRange {
        self.ctrl(self.base.cke_bit())
    }

    fn use_dbi_bit(&self) -> BitRange {
        self.ctrl(self.base.use_dbi_bit())
    }

    fn ila_bit(&self) -> BitRange {
        self.ctrl(self.base.ila_bit())
    }

    fn cal_field(&self) -> BitRange {
        self.ctrl(self.base.cal_field())
    }

    fn branch_mode(&self) -> BitRange {
        self.ctrl(self.base.branch_mode())
    }

    fn branch_target(&self) -> BitRange {
        self.ctrl(self.base.branch_target())
    }

    fn rfm_bit(&self) -> Option<BitRange> {
        Some(BitRange::bit(self.branch_target().hi + 1))
    }

    /// Refresh on this generation must also raise refresh management.
    fn command_control(
        &self,
        cmd: DramCmd,
        _phase: usize,
        _channel: usize,
    ) -> Option<(BitRange, u64)> {
        match cmd {
            DramCmd::Ref => self.rfm_bit().map(|r| (r, 1)),
            _ => None,
        }
    }

    fn append_trailer<'a>(&self, instructions: &mut Vec<Instruction<'a>>) {
        standard_trailer(self, instructions);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channels_do_not_overlap() {
        let litter = G7::new();
        for phase in 0..litter.phases() {
            let a = litter.command_field(phase, 0);
            let b = litter.command_field(phase, 1);
            assert!(a.hi < b.lo);
        }
        assert!(litter.bank_field(0).hi < litter.bank_field(1).lo);
        // The control block clears both channel blocks.
        assert!(litter.reg_load_en().lo > litter.pattern_field(1).hi);
        assert!(litter.rfm_bit().unwrap().hi < litter.instruction_width());
    }

    #[test]
    fn vocabulary_extends_the_base() {
        let litter = G7::new();
        assert_eq!(litter.vocabulary().word("cha"), Some(Reserved::Chan(0)));
        assert_eq!(litter.vocabulary().word("RFM"), Some(Reserved::Rfm));
        assert_eq!(litter.vocabulary().word("LOAD"), Some(Reserved::Load));
        // The base litter knows nothing of channels.
        assert_eq!(G6::new().vocabulary().word("CHA"), None);
    }

    #[test]
    fn refresh_implies_rfm() {
        let litter = G7::new();
        let (range, value) = litter.command_control(DramCmd::Ref, 1, 0).unwrap();
        assert_eq!(Some(range), litter.rfm_bit());
        assert_eq!(value, 1);
        assert!(litter.command_control(DramCmd::Act, 1, 0).is_none());
    }
}
