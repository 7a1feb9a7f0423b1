use crate::bits::Bits;
use crate::code::Instruction;
use crate::profile::{standard_trailer, BitRange, DramCmd, Litter};
use crate::token::{standard_symbols, Reserved, Vocabulary};

/// Instruction word layout. Four 3-bit command fields, the shared register
/// selectors, then the control block. Bits 90..127 are reserved.
const CMD_BITS: usize = 3;
const BANK: BitRange = BitRange::new(15, 12);
const ROWCOL: BitRange = BitRange::new(19, 16);
const PATTERN: BitRange = BitRange::new(23, 20);
const LOAD_EN: BitRange = BitRange::bit(24);
const LOAD_INDEX: BitRange = BitRange::new(28, 25);
const LOAD_VALUE: BitRange = BitRange::new(44, 29);
const LOAD_INCR: BitRange = BitRange::new(52, 45);
const LOAD_PRBS: BitRange = BitRange::bit(53);
const INCR_MASK: BitRange = BitRange::new(69, 54);
const HOLD: BitRange = BitRange::new(73, 70);
const STOP: BitRange = BitRange::bit(74);
const CKE: BitRange = BitRange::bit(75);
const USE_DBI: BitRange = BitRange::bit(76);
const ILA: BitRange = BitRange::bit(77);
const CAL: BitRange = BitRange::new(79, 78);
const BRANCH_MODE: BitRange = BitRange::new(81, 80);
const BRANCH_TARGET: BitRange = BitRange::new(89, 82);

const MAX_FBPAS: usize = 8;

/// The base litter: 128-bit instructions, four phases on one channel,
/// sixteen 16-bit registers, 64/8/8 pattern entries.
pub struct G6 {
    fbpas: usize,
    vocab: Vocabulary,
}

impl G6 {
    pub fn new() -> Self {
        Self::with_fbpas(MAX_FBPAS)
    }

    /// Partially populated parts expose fewer FBPAs.
    pub fn with_fbpas(fbpas: usize) -> Self {
        assert!(
            (1..=MAX_FBPAS).contains(&fbpas),
            "fbpa count {fbpas} out of range"
        );
        Self {
            fbpas,
            vocab: Vocabulary::new(base_words(), standard_symbols()),
        }
    }
}

impl Default for G6 {
    fn default() -> Self {
        Self::new()
    }
}

/// Reserved words common to every generation; extended litters append.
pub(super) fn base_words() -> Vec<(&'static str, Reserved)> {
    let mut words = vec![
        ("NOP", Reserved::Nop),
        ("ACT", Reserved::Act),
        ("PRE", Reserved::Pre),
        ("REF", Reserved::Ref),
        ("PDE", Reserved::Pde),
        ("SRX", Reserved::Srx),
        ("READ", Reserved::Read),
        ("WRITE", Reserved::Write),
        ("LOAD", Reserved::Load),
        ("INCR", Reserved::Incr),
        ("PRBS", Reserved::Prbs),
        ("HOLD", Reserved::Hold),
        ("STOP", Reserved::Stop),
        ("CKE", Reserved::Cke),
        ("ILA", Reserved::Ila),
        ("CAL", Reserved::Cal),
        ("USEDBI", Reserved::UseDbi),
        ("JMP", Reserved::Jmp),
        ("JRE", Reserved::Jre),
        ("JNRE", Reserved::Jnre),
        ("SETBITS", Reserved::SetBits),
        ("PATRAM", Reserved::Patram),
        ("DQ", Reserved::Dq),
        ("ECC", Reserved::Ecc),
        ("DBI", Reserved::Dbi),
        ("FBPA", Reserved::Fbpa),
        ("MAXCYC", Reserved::MaxCyc),
    ];
    const REG_NAMES: [&str; 16] = [
        "R0", "R1", "R2", "R3", "R4", "R5", "R6", "R7", "R8", "R9", "R10",
        "R11", "R12", "R13", "R14", "R15",
    ];
    for (i, name) in REG_NAMES.iter().enumerate() {
        words.push((name, Reserved::Reg(i as u8)));
    }
    words
}

impl Litter for G6 {
    fn name(&self) -> &'static str {
        "g6"
    }

    fn instruction_width(&self) -> usize {
        128
    }

    fn max_fbpas(&self) -> usize {
        self.fbpas
    }

    fn phases(&self) -> usize {
        4
    }

    fn channels(&self) -> usize {
        1
    }

    fn num_registers(&self) -> usize {
        16
    }

    fn register_width(&self) -> usize {
        16
    }

    fn dq_width(&self) -> usize {
        64
    }

    fn ecc_width(&self) -> usize {
        8
    }

    fn dbi_width(&self) -> usize {
        8
    }

    fn vocabulary(&self) -> &Vocabulary {
        &self.vocab
    }

    /// Clock-enable idles high.
    fn apply_defaults(&self, bits: &mut Bits) {
        bits.set_default_bits(CKE.hi, CKE.lo, 1);
    }

    fn command_field(&self, phase: usize, channel: usize) -> BitRange {
        debug_assert!(phase < self.phases() && channel == 0);
        BitRange::new(CMD_BITS * phase + CMD_BITS - 1, CMD_BITS * phase)
    }

    /// Row and column commands share the numeric space; phase parity
    /// disambiguates. PDE and SRX deliberately alias.
    fn command_encoding(&self, cmd: DramCmd) -> u64 {
        match cmd {
            DramCmd::Nop => 0,
            DramCmd::Act | DramCmd::Read => 1,
            DramCmd::Pre | DramCmd::Write => 2,
            DramCmd::Ref => 3,
            DramCmd::PdeSrx => 4,
        }
    }

    fn bank_field(&self, _channel: usize) -> BitRange {
        BANK
    }

    fn rowcol_field(&self, _channel: usize) -> BitRange {
        ROWCOL
    }

    fn pattern_field(&self, _channel: usize) -> BitRange {
        PATTERN
    }

    fn reg_load_en(&self) -> BitRange {
        LOAD_EN
    }

    fn reg_load_index(&self) -> BitRange {
        LOAD_INDEX
    }

    fn reg_load_value(&self) -> BitRange {
        LOAD_VALUE
    }

    fn reg_load_incr(&self) -> BitRange {
        LOAD_INCR
    }

    fn reg_load_prbs(&self) -> BitRange {
        LOAD_PRBS
    }

    fn incr_mask(&self) -> BitRange {
        INCR_MASK
    }

    fn hold_field(&self) -> BitRange {
        HOLD
    }

    fn stop_bit(&self) -> BitRange {
        STOP
    }

    fn cke_bit(&self) -> BitRange {
        CKE
    }

    fn use_dbi_bit(&self) -> BitRange {
        USE_DBI
    }

    fn ila_bit(&self) -> BitRange {
        ILA
    }

    fn cal_field(&self) -> BitRange {
        CAL
    }

    fn branch_mode(&self) -> BitRange {
        BRANCH_MODE
    }

    fn branch_target(&self) -> BitRange {
        BRANCH_TARGET
    }

    fn append_trailer<'a>(&self, instructions: &mut Vec<Instruction<'a>>) {
        standard_trailer(self, instructions);
    }
}
