use log::trace;

use crate::bits::Bits;
use crate::error::{AsmError, DiagSink, ErrorKind};
use crate::expr::Expr;
use crate::profile::{BitRange, Litter};
use crate::token::Token;

/// One parsed opcode plus the bits it set in its own right.
///
/// Mutated only through the enclosing instruction's `update_statement`
/// while the instruction is open.
#[derive(Debug, Clone)]
pub struct Statement<'a> {
    pub token: Token<'a>,
    pub bits: Bits,
    /// Hack statements (the `SETBITS` escape hatch) are exempt from
    /// conflict checking and win at output time.
    pub is_hack: bool,
}

/// A bitfield write, remembered so a later conflict can cite its author.
#[derive(Debug, Clone)]
struct FieldWrite {
    hi: usize,
    lo: usize,
    stmt: usize,
}

/// One instruction word under construction: its statements plus two merged
/// views, one for ordinary statements and one for hack statements. The two
/// never block each other; they are reconciled by overlay at output time,
/// hack bits winning.
#[derive(Debug, Clone)]
pub struct Instruction<'a> {
    statements: Vec<Statement<'a>>,
    merged: Bits,
    hacked: Bits,
    writes: Vec<FieldWrite>,
    loaded: Option<(usize, Token<'a>)>,
    increments: Vec<(usize, Token<'a>)>,
}

impl<'a> Instruction<'a> {
    pub fn new(width: usize) -> Self {
        Self {
            statements: Vec::new(),
            merged: Bits::new(width),
            hacked: Bits::new(width),
            writes: Vec::new(),
            loaded: None,
            increments: Vec::new(),
        }
    }

    /// An instruction with no source statements, e.g. a trailer.
    pub fn synthetic(width: usize) -> Self {
        Self::new(width)
    }

    pub fn statements(&self) -> &[Statement<'a>] {
        &self.statements
    }

    /// Open a new statement within this instruction, returning its index.
    pub fn begin_statement(&mut self, token: Token<'a>, is_hack: bool) -> usize {
        let width = self.merged.len();
        self.statements.push(Statement {
            token,
            bits: Bits::new(width),
            is_hack,
        });
        self.statements.len() - 1
    }

    /// Write a bitfield on behalf of statement `stmt`.
    ///
    /// An ordinary statement may not touch bits another ordinary statement
    /// has already written, unless `allow_sharing` is set and the values
    /// agree exactly. On conflict, reports an error citing both statements
    /// and leaves the word unchanged. Hack statements bypass the check
    /// entirely and land in the separate hack view.
    pub fn update_statement(
        &mut self,
        stmt: usize,
        token: &Token<'a>,
        range: BitRange,
        value: i64,
        allow_sharing: bool,
        sink: &mut DiagSink,
    ) -> bool {
        let (hi, lo) = (range.hi, range.lo);
        let width = range.width();
        debug_assert!(width <= 32, "bitfield [{hi}:{lo}] exceeds 32 bits");
        let new = (value as u64) & (u64::MAX >> (64 - width));
        if self.statements[stmt].is_hack {
            self.hacked.set_bits(hi, lo, new);
            self.statements[stmt].bits.set_bits(hi, lo, new);
            return true;
        }
        if self.merged.any_masked(hi, lo) {
            let agrees = allow_sharing
                && self.merged.all_masked(hi, lo)
                && self.merged.get_bits(hi, lo) == new;
            if !agrees {
                let culprit = self
                    .writes
                    .iter()
                    .find(|w| w.lo <= hi && lo <= w.hi)
                    .map(|w| self.statements[w.stmt].token);
                let detail = match culprit {
                    Some(other) => format!(
                        "bits [{hi}:{lo}] conflict with '{}' at {}",
                        other.text,
                        other.location()
                    ),
                    None => format!("bits [{hi}:{lo}] are already written"),
                };
                sink.error(AsmError::new(ErrorKind::Semantic, token, detail));
                return false;
            }
        }
        self.merged.set_bits(hi, lo, new);
        self.statements[stmt].bits.set_bits(hi, lo, new);
        self.writes.push(FieldWrite { hi, lo, stmt });
        true
    }

    /// Apply an architecture-implied control bit as a default: an explicit
    /// statement write still wins.
    pub fn set_control_default(&mut self, range: BitRange, value: u64) {
        self.merged.set_default_bits(range.hi, range.lo, value);
    }

    /// Raw masked write for synthetic instructions; never conflict-checked.
    pub fn set_raw(&mut self, range: BitRange, value: u64) {
        self.merged.set_bits(range.hi, range.lo, value);
    }

    /// Note a register load, for the load/increment cross-check at close.
    pub fn record_load(&mut self, reg: usize, token: Token<'a>) {
        self.loaded = Some((reg, token));
    }

    pub fn record_increment(&mut self, reg: usize, token: Token<'a>) {
        self.increments.push((reg, token));
    }

    /// Close the instruction: no new statements may contribute afterwards.
    /// An instruction that both loads and auto-increments the same register
    /// is rejected here, citing both statements.
    pub fn close(&mut self, sink: &mut DiagSink) {
        if let Some((reg, load_token)) = &self.loaded {
            if let Some((_, incr_token)) =
                self.increments.iter().find(|(r, _)| r == reg)
            {
                sink.error(AsmError::new(
                    ErrorKind::Semantic,
                    load_token,
                    format!(
                        "register R{reg} is both loaded and incremented in one \
                         instruction (increment at {})",
                        incr_token.location()
                    ),
                ));
            }
        }
    }

    /// Post-close write used only by deferred-expression resolution; the
    /// target range was reserved with a zero placeholder at registration,
    /// so no conflict check applies.
    pub fn resolve_write(&mut self, range: BitRange, value: i64, hack: bool) {
        let width = range.width();
        let bits = (value as u64) & (u64::MAX >> (64 - width));
        trace!("resolve [{}:{}] = {bits:#x}", range.hi, range.lo);
        if hack {
            self.hacked.set_bits(range.hi, range.lo, bits);
        } else {
            self.merged.set_bits(range.hi, range.lo, bits);
        }
    }

    /// The finished word: merged statement bits, then profile defaults on
    /// the untouched bits, then hack bits overlaid on top.
    pub fn output_bits(&self, litter: &dyn Litter) -> Bits {
        let mut bits = self.merged.clone();
        litter.apply_defaults(&mut bits);
        bits.overlaid(&self.hacked)
    }

    /// Source-line annotations, one per distinct contributing line.
    pub fn lines(&self) -> Vec<String> {
        annotate(self.statements.iter().map(|s| &s.token))
    }
}

/// The three pattern-RAM regions.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum PatramRegion {
    Dq,
    Ecc,
    Dbi,
}

/// One pattern-RAM entry: DQ, ECC and DBI bits grown by appends and
/// validated against the exact architecture widths at close.
#[derive(Debug, Clone)]
pub struct Patram<'a> {
    opener: Token<'a>,
    tokens: Vec<Token<'a>>,
    dq: Bits,
    ecc: Bits,
    dbi: Bits,
}

impl<'a> Patram<'a> {
    pub fn new(opener: Token<'a>) -> Self {
        Self {
            opener,
            tokens: vec![opener],
            dq: Bits::empty(),
            ecc: Bits::empty(),
            dbi: Bits::empty(),
        }
    }

    pub fn add_token(&mut self, token: Token<'a>) {
        self.tokens.push(token);
    }

    /// Grow a region by `width` bits of `value`, returning the bit span
    /// written so a deferred expression can target it.
    pub fn append(&mut self, region: PatramRegion, width: usize, value: u64) -> BitRange {
        let bits = self.region_mut(region);
        let lo = bits.len();
        bits.append_bits(width, value);
        BitRange::new(lo + width - 1, lo)
    }

    pub fn resolve_write(&mut self, region: PatramRegion, range: BitRange, value: i64) {
        let width = range.width();
        let bits = (value as u64) & (u64::MAX >> (64 - width));
        self.region_mut(region).set_bits(range.hi, range.lo, bits);
    }

    pub fn dq(&self) -> &Bits {
        &self.dq
    }

    pub fn ecc(&self) -> &Bits {
        &self.ecc
    }

    pub fn dbi(&self) -> &Bits {
        &self.dbi
    }

    /// Validate that every region reached exactly its architecture width.
    pub fn close(&self, litter: &dyn Litter, sink: &mut DiagSink) {
        let expect = [
            ("DQ", self.dq.len(), litter.dq_width()),
            ("ECC", self.ecc.len(), litter.ecc_width()),
            ("DBI", self.dbi.len(), litter.dbi_width()),
        ];
        for (name, got, want) in expect {
            if got != want {
                sink.error(AsmError::new(
                    ErrorKind::Semantic,
                    &self.opener,
                    format!("{name} region is {got} bits, expected {want}"),
                ));
            }
        }
    }

    pub fn lines(&self) -> Vec<String> {
        annotate(self.tokens.iter())
    }

    fn region_mut(&mut self, region: PatramRegion) -> &mut Bits {
        match region {
            PatramRegion::Dq => &mut self.dq,
            PatramRegion::Ecc => &mut self.ecc,
            PatramRegion::Dbi => &mut self.dbi,
        }
    }
}

/// Where a deferred expression's value must eventually land.
#[derive(Debug, Clone)]
pub enum ExprTarget {
    Instruction {
        index: usize,
        range: BitRange,
        hack: bool,
    },
    Patram {
        index: usize,
        region: PatramRegion,
        range: BitRange,
    },
}

/// A not-yet-evaluated expression paired with its target. Exists only
/// between parsing and the end-of-file resolution pass.
#[derive(Debug, Clone)]
pub struct CodeExpression<'a> {
    pub expr: Expr<'a>,
    pub target: ExprTarget,
}

/// Collapse statement tokens into `file:line: text` annotations, one per
/// distinct source line.
fn annotate<'a, 'b>(tokens: impl Iterator<Item = &'b Token<'a>>) -> Vec<String>
where
    'a: 'b,
{
    let mut lines: Vec<String> = Vec::new();
    for t in tokens {
        let entry = format!("{}:{}: {}", t.file, t.line, t.line_text);
        if lines.last() != Some(&entry) {
            lines.push(entry);
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init_test_logging;
    use crate::token::TokenKind;

    fn tok(text: &'static str, line: u32) -> Token<'static> {
        Token {
            kind: TokenKind::Ident(text),
            text,
            file: "t.mucc",
            line_text: text,
            line,
            col: 1,
            padded: true,
        }
    }

    #[test]
    fn conflicting_writes_are_rejected() {
        init_test_logging();
        let mut sink = DiagSink::new();
        let mut instr = Instruction::new(64);
        let a = instr.begin_statement(tok("STOP", 1), false);
        let b = instr.begin_statement(tok("HOLD", 2), false);
        assert!(instr.update_statement(a, &tok("STOP", 1), BitRange::new(7, 0), 5, false, &mut sink));
        // Different value, no sharing: rejected, word untouched.
        sink.begin_statement();
        assert!(!instr.update_statement(b, &tok("HOLD", 2), BitRange::new(7, 0), 6, false, &mut sink));
        assert!(sink.has_errors());
        assert_eq!(instr.merged.get_bits(7, 0), 5);
        // The error cites the original writer.
        let (errors, _) = sink.into_parts();
        assert!(errors[0].message.contains("t.mucc:1"));
    }

    #[test]
    fn sharing_allows_agreeing_writes() {
        init_test_logging();
        let mut sink = DiagSink::new();
        let mut instr = Instruction::new(64);
        let a = instr.begin_statement(tok("READ", 1), false);
        let b = instr.begin_statement(tok("WRITE", 1), false);
        assert!(instr.update_statement(a, &tok("READ", 1), BitRange::new(3, 0), 9, true, &mut sink));
        assert!(instr.update_statement(b, &tok("WRITE", 1), BitRange::new(3, 0), 9, true, &mut sink));
        // Same range, different value: still rejected.
        sink.begin_statement();
        assert!(!instr.update_statement(b, &tok("WRITE", 1), BitRange::new(3, 0), 10, true, &mut sink));
        assert!(sink.has_errors());
    }

    #[test]
    fn hacks_bypass_conflicts_and_win_on_overlay() {
        init_test_logging();
        let mut sink = DiagSink::new();
        let mut instr = Instruction::new(64);
        let normal = instr.begin_statement(tok("HOLD", 1), false);
        let hack = instr.begin_statement(tok("SETBITS", 2), true);
        assert!(instr.update_statement(normal, &tok("HOLD", 1), BitRange::new(7, 0), 0xAA, false, &mut sink));
        assert!(instr.update_statement(hack, &tok("SETBITS", 2), BitRange::new(3, 0), 0x5, false, &mut sink));
        assert!(!sink.has_errors());
        assert_eq!(instr.merged.get_bits(7, 0), 0xAA);
        assert_eq!(instr.hacked.get_bits(3, 0), 0x5);
        let out = instr.merged.overlaid(&instr.hacked);
        assert_eq!(out.get_bits(7, 0), 0xA5);
    }

    #[test]
    fn load_and_increment_of_same_register_conflict() {
        init_test_logging();
        let mut sink = DiagSink::new();
        let mut instr = Instruction::new(64);
        instr.record_load(1, tok("LOAD", 3));
        instr.record_increment(2, tok("INCR", 4));
        instr.close(&mut sink);
        assert!(!sink.has_errors());

        instr.record_increment(1, tok("INCR", 5));
        instr.close(&mut sink);
        assert!(sink.has_errors());
        let (errors, _) = sink.into_parts();
        assert!(errors[0].message.contains("t.mucc:5"));
    }

    #[test]
    fn resolve_write_fills_the_placeholder() {
        init_test_logging();
        let mut sink = DiagSink::new();
        let mut instr = Instruction::new(64);
        let s = instr.begin_statement(tok("JMP", 1), false);
        assert!(instr.update_statement(s, &tok("JMP", 1), BitRange::new(15, 8), 0, false, &mut sink));
        instr.resolve_write(BitRange::new(15, 8), 42, false);
        assert_eq!(instr.merged.get_bits(15, 8), 42);
    }

    #[test]
    fn patram_appends_and_spans() {
        init_test_logging();
        let mut patram = Patram::new(tok("PATRAM", 1));
        let first = patram.append(PatramRegion::Dq, 32, 0xDEADBEEF);
        let second = patram.append(PatramRegion::Dq, 32, 0x12345678);
        assert_eq!(first, BitRange::new(31, 0));
        assert_eq!(second, BitRange::new(63, 32));
        assert_eq!(patram.dq().len(), 64);
        assert_eq!(patram.dq().words(), &[0xDEADBEEF, 0x12345678]);
        patram.append(PatramRegion::Ecc, 8, 0xFF);
        assert_eq!(patram.ecc().len(), 8);
    }

    #[test]
    fn annotations_collapse_per_line() {
        init_test_logging();
        let mut instr = Instruction::new(64);
        instr.begin_statement(tok("LOAD", 1), false);
        instr.begin_statement(tok("LOAD", 1), false);
        instr.begin_statement(tok("STOP", 2), false);
        assert_eq!(instr.lines().len(), 2);
    }
}
