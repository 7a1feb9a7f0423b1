use log::{debug, info, trace};
use std::collections::HashMap;

use crate::code::{CodeExpression, ExprTarget, Instruction, Patram, PatramRegion};
use crate::error::{AsmError, DiagSink, ErrorKind};
use crate::expr::{
    check_limits, parse_expression, starts_expression, Expr, LabelScope, NoLabels,
};
use crate::lexer::Tokenizer;
use crate::profile::{BitRange, DramCmd, Litter};
use crate::sim::{self, ThreadReport};
use crate::token::{Reserved, Sym, Token, TokenKind};

/// Bits appended per argument of a `DQ` statement.
const DQ_CHUNK: usize = 32;
/// Bits appended per argument of an `ECC` or `DBI` statement.
const BYTE_CHUNK: usize = 8;

/// A bound label: its index plus where it was defined, so a duplicate can
/// cite the original.
#[derive(Debug, Clone)]
pub struct LabelDef {
    pub index: i64,
    file: String,
    line: u32,
}

/// One SIMD-like lane group. A thread owns everything it needs: its code,
/// pattern entries, label table and deferred expressions, so threads can
/// be cloned during a split and simulated independently.
#[derive(Debug, Clone)]
pub struct Thread<'a> {
    /// One bit per lane; two lanes per FBPA.
    pub mask: u64,
    pub instructions: Vec<Instruction<'a>>,
    pub patrams: Vec<Patram<'a>>,
    pub labels: HashMap<String, LabelDef>,
    pub max_cycles: u64,
    /// Labels seen between statement groups, waiting for the next
    /// instruction or patram to bind to.
    pending_labels: Vec<(String, Token<'a>)>,
    defers: Vec<CodeExpression<'a>>,
}

struct ThreadScope<'t>(&'t HashMap<String, LabelDef>);

impl<'t> LabelScope for ThreadScope<'t> {
    fn lookup(&self, name: &str) -> Option<i64> {
        self.0.get(name).map(|def| def.index)
    }
}

impl<'a> Thread<'a> {
    fn new(mask: u64, max_cycles: u64) -> Self {
        Self {
            mask,
            instructions: Vec::new(),
            patrams: Vec::new(),
            labels: HashMap::new(),
            max_cycles,
            pending_labels: Vec::new(),
            defers: Vec::new(),
        }
    }

    fn define_label(
        &mut self,
        name: &str,
        token: &Token<'a>,
        index: i64,
        sink: &mut DiagSink,
    ) {
        if let Some(original) = self.labels.get(name) {
            sink.error(AsmError::new(
                ErrorKind::Semantic,
                token,
                format!(
                    "duplicate label '{name}' (first defined at {}:{})",
                    original.file, original.line
                ),
            ));
            return;
        }
        trace!("thread {:#x}: label '{name}' = {index}", self.mask);
        self.labels.insert(
            name.to_owned(),
            LabelDef {
                index,
                file: token.file.to_owned(),
                line: token.line,
            },
        );
    }

    /// Bind every buffered label to the instruction/patram now starting.
    fn bind_pending(&mut self, index: i64, sink: &mut DiagSink) {
        for (name, token) in std::mem::take(&mut self.pending_labels) {
            self.define_label(&name, &token, index, sink);
        }
    }

    /// Evaluate every deferred expression against the now-complete label
    /// table and write the results into their targets.
    fn resolve(&mut self, sink: &mut DiagSink) {
        for ce in std::mem::take(&mut self.defers) {
            let scope = ThreadScope(&self.labels);
            let value = match ce.expr.eval(&scope) {
                Ok(value) => value,
                Err(e) => {
                    sink.error(e);
                    continue;
                }
            };
            let token = ce.expr.token();
            match ce.target {
                ExprTarget::Instruction { index, range, hack } => {
                    if let Err(e) = check_limits(&token, value, range.width()) {
                        sink.error(e);
                        continue;
                    }
                    self.instructions[index].resolve_write(range, value, hack);
                }
                ExprTarget::Patram { index, region, range } => {
                    if let Err(e) = check_limits(&token, value, range.width()) {
                        sink.error(e);
                        continue;
                    }
                    self.patrams[index].resolve_write(region, range, value);
                }
            }
        }
    }
}

/// The pending-operation state machine: statements accumulate into one
/// instruction word or one patram entry until a `;` closes the group.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
enum Pending {
    None,
    Instruction,
    Patram,
}

/// A single bitfield effect of a parsed statement. Arguments are parsed
/// once into a plan and the plan is then applied to every selected thread,
/// so a statement routed to several threads reports each parse problem
/// once.
#[derive(Debug)]
enum Write<'a> {
    Field {
        range: BitRange,
        value: i64,
        allow_sharing: bool,
    },
    Defer {
        range: BitRange,
        expr: Expr<'a>,
    },
    ControlDefault {
        range: BitRange,
        value: u64,
    },
    RecordLoad(usize),
    RecordIncr(usize),
}

#[derive(Debug)]
struct Plan<'a> {
    is_hack: bool,
    writes: Vec<Write<'a>>,
}

impl<'a> Plan<'a> {
    fn new() -> Self {
        Self {
            is_hack: false,
            writes: Vec::new(),
        }
    }
}

/// An assembled (or in-assembly) program: the thread set, the active lane
/// selection that routes statements, and the litter profile that owns all
/// architecture-specific knowledge.
pub struct Program<'a> {
    litter: &'a dyn Litter,
    threads: Vec<Thread<'a>>,
    selection: u64,
    pending: Pending,
}

impl<'a> Program<'a> {
    pub fn new(litter: &'a dyn Litter, default_max_cycles: u64) -> Self {
        let full = full_mask(litter);
        Self {
            litter,
            threads: vec![Thread::new(full, default_max_cycles)],
            selection: full,
            pending: Pending::None,
        }
    }

    pub fn litter(&self) -> &'a dyn Litter {
        self.litter
    }

    pub fn threads(&self) -> &[Thread<'a>] {
        &self.threads
    }

    /// Simulate every thread independently.
    pub fn simulate(&self) -> Vec<ThreadReport> {
        self.threads
            .iter()
            .map(|thread| sim::run_thread(self.litter, thread))
            .collect()
    }

    /// Drive the whole assembly pass: consume the token stream, then run
    /// the end-of-file resolution.
    pub fn run(&mut self, tokens: &mut Tokenizer<'a>, sink: &mut DiagSink) {
        loop {
            let t = tokens.peek(0, sink);
            match t.kind {
                TokenKind::Eof => break,
                TokenKind::Sym(Sym::Semi) => {
                    tokens.advance(1);
                    self.close_group(&t, sink);
                }
                TokenKind::Ident(name) => {
                    if tokens.peek(1, sink).kind == TokenKind::Sym(Sym::Colon) {
                        tokens.advance(2);
                        self.define_label(name, t, sink);
                    } else {
                        sink.error(AsmError::new(
                            ErrorKind::Syntax,
                            &t,
                            format!(
                                "unexpected identifier '{name}'; a label needs \
                                 a ':' after it"
                            ),
                        ));
                        recover(tokens, sink);
                    }
                }
                TokenKind::Reserved(word) => self.statement(word, tokens, sink),
                // Already reported by the tokenizer.
                TokenKind::Illegal => tokens.advance(1),
                TokenKind::Sym(_) | TokenKind::Int(_) => {
                    sink.error(AsmError::new(
                        ErrorKind::Syntax,
                        &t,
                        format!("unexpected token '{}'", t.text),
                    ));
                    recover(tokens, sink);
                }
            }
        }
        let eof = tokens.peek(0, sink);
        self.finish(&eof, sink);
    }

    fn statement(
        &mut self,
        word: Reserved,
        tokens: &mut Tokenizer<'a>,
        sink: &mut DiagSink,
    ) {
        match word {
            Reserved::Fbpa | Reserved::MaxCyc => self.directive(word, tokens, sink),
            Reserved::Patram => self.open_patram(tokens, sink),
            Reserved::Dq => self.patram_part(PatramRegion::Dq, DQ_CHUNK, tokens, sink),
            Reserved::Ecc => {
                self.patram_part(PatramRegion::Ecc, BYTE_CHUNK, tokens, sink)
            }
            Reserved::Dbi => {
                self.patram_part(PatramRegion::Dbi, BYTE_CHUNK, tokens, sink)
            }
            Reserved::Reg(_) | Reserved::Chan(_) | Reserved::Prbs => {
                let t = tokens.peek(0, sink);
                sink.error(AsmError::new(
                    ErrorKind::Syntax,
                    &t,
                    format!("'{}' cannot start a statement", t.text),
                ));
                recover(tokens, sink);
            }
            _ => self.instruction_statement(word, tokens, sink),
        }
    }

    /// An opcode contributing bits to the current instruction word.
    fn instruction_statement(
        &mut self,
        word: Reserved,
        tokens: &mut Tokenizer<'a>,
        sink: &mut DiagSink,
    ) {
        let opcode = tokens.peek(0, sink);
        tokens.advance(1);
        if self.pending == Pending::Patram {
            sink.error(AsmError::new(
                ErrorKind::Syntax,
                &opcode,
                format!("'{}' is not valid inside a pattern-RAM group", opcode.text),
            ));
            recover(tokens, sink);
            return;
        }
        if self.pending == Pending::None {
            self.open_instruction(sink);
        }
        match self.parse_args(word, &opcode, tokens, sink) {
            Some(plan) => self.apply(opcode, plan, sink),
            None => recover(tokens, sink),
        }
    }

    /// Parse one statement's arguments into a thread-independent plan.
    fn parse_args(
        &self,
        word: Reserved,
        opcode: &Token<'a>,
        tokens: &mut Tokenizer<'a>,
        sink: &mut DiagSink,
    ) -> Option<Plan<'a>> {
        let litter = self.litter;
        let mut plan = Plan::new();
        match word {
            Reserved::Nop
            | Reserved::Act
            | Reserved::Pre
            | Reserved::Ref
            | Reserved::Pde
            | Reserved::Srx
            | Reserved::Read
            | Reserved::Write => {
                let cmd = match word {
                    Reserved::Nop => DramCmd::Nop,
                    Reserved::Act => DramCmd::Act,
                    Reserved::Pre => DramCmd::Pre,
                    Reserved::Ref => DramCmd::Ref,
                    Reserved::Pde | Reserved::Srx => DramCmd::PdeSrx,
                    Reserved::Read => DramCmd::Read,
                    _ => DramCmd::Write,
                };
                let channel = match tokens.peek(0, sink).kind {
                    TokenKind::Reserved(Reserved::Chan(c))
                        if litter.has_channel_tokens() =>
                    {
                        tokens.advance(1);
                        c as usize
                    }
                    _ => 0,
                };
                let (phase, phase_token) = self.constant(tokens, sink)?;
                if phase < 0 || phase >= litter.phases() as i64 {
                    sink.error(AsmError::new(
                        ErrorKind::Semantic,
                        &phase_token,
                        format!("phase {phase} out of range"),
                    ));
                    return None;
                }
                let phase = phase as usize;
                if cmd.is_row() && phase % 2 == 0 {
                    sink.error(AsmError::new(
                        ErrorKind::Semantic,
                        opcode,
                        format!("row command '{}' requires an odd phase", opcode.text),
                    ));
                    return None;
                }
                if cmd.is_column() && phase % 2 == 1 {
                    sink.error(AsmError::new(
                        ErrorKind::Semantic,
                        opcode,
                        format!(
                            "column command '{}' requires an even phase",
                            opcode.text
                        ),
                    ));
                    return None;
                }
                plan.writes.push(Write::Field {
                    range: litter.command_field(phase, channel),
                    value: litter.command_encoding(cmd) as i64,
                    allow_sharing: false,
                });
                let selectors: Vec<BitRange> = match cmd {
                    DramCmd::Act => {
                        vec![litter.bank_field(channel), litter.rowcol_field(channel)]
                    }
                    DramCmd::Pre => vec![litter.bank_field(channel)],
                    DramCmd::Read | DramCmd::Write => vec![
                        litter.bank_field(channel),
                        litter.rowcol_field(channel),
                        litter.pattern_field(channel),
                    ],
                    _ => Vec::new(),
                };
                for range in &selectors {
                    let (reg, _) = self.expect_reg(tokens, sink)?;
                    // Shared so a paired READ/WRITE agreeing on registers
                    // can coexist.
                    plan.writes.push(Write::Field {
                        range: *range,
                        value: reg as i64,
                        allow_sharing: true,
                    });
                }
                if let Some((range, value)) =
                    litter.command_control(cmd, phase, channel)
                {
                    plan.writes.push(Write::ControlDefault { range, value });
                }
            }
            Reserved::Load => {
                let (reg, _) = self.expect_reg(tokens, sink)?;
                let value = self.expression(tokens, sink)?;
                plan.writes.push(Write::Field {
                    range: litter.reg_load_en(),
                    value: 1,
                    allow_sharing: false,
                });
                plan.writes.push(Write::Field {
                    range: litter.reg_load_index(),
                    value: reg as i64,
                    allow_sharing: false,
                });
                plan.writes.push(Write::Defer {
                    range: litter.reg_load_value(),
                    expr: value,
                });
                if starts_expression(&tokens.peek(0, sink)) {
                    let incr = self.expression(tokens, sink)?;
                    plan.writes.push(Write::Defer {
                        range: litter.reg_load_incr(),
                        expr: incr,
                    });
                }
                if tokens.peek(0, sink).kind
                    == TokenKind::Reserved(Reserved::Prbs)
                {
                    tokens.advance(1);
                    plan.writes.push(Write::Field {
                        range: litter.reg_load_prbs(),
                        value: 1,
                        allow_sharing: false,
                    });
                }
                plan.writes.push(Write::RecordLoad(reg));
            }
            Reserved::Incr => {
                let (reg, _) = self.expect_reg(tokens, sink)?;
                plan.writes.push(Write::Field {
                    range: BitRange::bit(litter.incr_mask().lo + reg),
                    value: 1,
                    allow_sharing: true,
                });
                plan.writes.push(Write::RecordIncr(reg));
            }
            Reserved::Hold => {
                let expr = self.expression(tokens, sink)?;
                plan.writes.push(Write::Defer {
                    range: litter.hold_field(),
                    expr,
                });
            }
            Reserved::Stop => plan.writes.push(Write::Field {
                range: litter.stop_bit(),
                value: 1,
                allow_sharing: false,
            }),
            Reserved::Cke => {
                let expr = self.expression(tokens, sink)?;
                plan.writes.push(Write::Defer {
                    range: litter.cke_bit(),
                    expr,
                });
            }
            Reserved::Ila => plan.writes.push(Write::Field {
                range: litter.ila_bit(),
                value: 1,
                allow_sharing: false,
            }),
            Reserved::Cal => {
                let expr = self.expression(tokens, sink)?;
                plan.writes.push(Write::Defer {
                    range: litter.cal_field(),
                    expr,
                });
            }
            Reserved::UseDbi => plan.writes.push(Write::Field {
                range: litter.use_dbi_bit(),
                value: 1,
                allow_sharing: false,
            }),
            Reserved::Rfm => {
                let expr = self.expression(tokens, sink)?;
                match litter.rfm_bit() {
                    Some(range) => {
                        plan.writes.push(Write::Defer { range, expr })
                    }
                    None => {
                        sink.error(AsmError::new(
                            ErrorKind::Internal,
                            opcode,
                            "this litter has no refresh-management bit",
                        ));
                        return None;
                    }
                }
            }
            Reserved::Jmp | Reserved::Jre | Reserved::Jnre => {
                let mode = match word {
                    Reserved::Jmp => 1,
                    Reserved::Jre => 2,
                    _ => 3,
                };
                let target = self.expression(tokens, sink)?;
                plan.writes.push(Write::Field {
                    range: litter.branch_mode(),
                    value: mode,
                    allow_sharing: false,
                });
                plan.writes.push(Write::Defer {
                    range: litter.branch_target(),
                    expr: target,
                });
            }
            Reserved::SetBits => {
                plan.is_hack = true;
                let (hi, hi_token) = self.constant(tokens, sink)?;
                let (lo, lo_token) = self.constant(tokens, sink)?;
                let width = litter.instruction_width() as i64;
                if hi < 0 || hi >= width || lo < 0 || lo > hi {
                    sink.error(AsmError::new(
                        ErrorKind::Semantic,
                        &hi_token,
                        format!("bit span [{hi}:{lo}] is not valid"),
                    ));
                    return None;
                }
                if hi - lo + 1 > 32 {
                    sink.error(AsmError::new(
                        ErrorKind::Semantic,
                        &lo_token,
                        format!("bit span [{hi}:{lo}] exceeds 32 bits"),
                    ));
                    return None;
                }
                let expr = self.expression(tokens, sink)?;
                plan.writes.push(Write::Defer {
                    range: BitRange::new(hi as usize, lo as usize),
                    expr,
                });
            }
            // Routed elsewhere by `statement`.
            _ => unreachable!("'{word:?}' is not an instruction statement"),
        }
        Some(plan)
    }

    /// Apply a parsed statement to every selected thread.
    fn apply(&mut self, opcode: Token<'a>, plan: Plan<'a>, sink: &mut DiagSink) {
        let selection = self.selection;
        for thread in self
            .threads
            .iter_mut()
            .filter(|t| t.mask & selection != 0)
        {
            let Thread {
                instructions,
                defers,
                ..
            } = thread;
            let index = instructions.len() - 1;
            let instr = instructions.last_mut().expect("no open instruction");
            let stmt = instr.begin_statement(opcode, plan.is_hack);
            for write in &plan.writes {
                match write {
                    Write::Field {
                        range,
                        value,
                        allow_sharing,
                    } => {
                        instr.update_statement(
                            stmt,
                            &opcode,
                            *range,
                            *value,
                            *allow_sharing,
                            sink,
                        );
                    }
                    Write::Defer { range, expr } => {
                        // Reserve the field with a zero placeholder now;
                        // resolution bypasses conflict checks later.
                        if instr.update_statement(
                            stmt, &opcode, *range, 0, false, sink,
                        ) {
                            defers.push(CodeExpression {
                                expr: expr.clone(),
                                target: ExprTarget::Instruction {
                                    index,
                                    range: *range,
                                    hack: plan.is_hack,
                                },
                            });
                        }
                    }
                    Write::ControlDefault { range, value } => {
                        instr.set_control_default(*range, *value);
                    }
                    Write::RecordLoad(reg) => instr.record_load(*reg, opcode),
                    Write::RecordIncr(reg) => instr.record_increment(*reg, opcode),
                }
            }
        }
    }

    /// `DQ`/`ECC`/`DBI` inside a pattern-RAM group.
    fn patram_part(
        &mut self,
        region: PatramRegion,
        chunk: usize,
        tokens: &mut Tokenizer<'a>,
        sink: &mut DiagSink,
    ) {
        let opcode = tokens.peek(0, sink);
        tokens.advance(1);
        if self.pending != Pending::Patram {
            sink.error(AsmError::new(
                ErrorKind::Syntax,
                &opcode,
                format!("'{}' is only valid inside a PATRAM group", opcode.text),
            ));
            recover(tokens, sink);
            return;
        }
        let mut exprs = Vec::new();
        while starts_expression(&tokens.peek(0, sink)) {
            match parse_expression(tokens, sink) {
                Ok(expr) => exprs.push(expr),
                Err(e) => {
                    sink.error(e);
                    recover(tokens, sink);
                    return;
                }
            }
        }
        if exprs.is_empty() {
            sink.error(AsmError::new(
                ErrorKind::Syntax,
                &opcode,
                format!("'{}' needs at least one value", opcode.text),
            ));
            recover(tokens, sink);
            return;
        }
        let selection = self.selection;
        for thread in self
            .threads
            .iter_mut()
            .filter(|t| t.mask & selection != 0)
        {
            let Thread {
                patrams, defers, ..
            } = thread;
            let index = patrams.len() - 1;
            let patram = patrams.last_mut().expect("no open patram");
            patram.add_token(opcode);
            for expr in &exprs {
                let range = patram.append(region, chunk, 0);
                defers.push(CodeExpression {
                    expr: expr.clone(),
                    target: ExprTarget::Patram {
                        index,
                        region,
                        range,
                    },
                });
            }
        }
    }

    /// `FBPA e;` and `MAXCYC e;` — directives carry their own terminator
    /// and are not statement groups.
    fn directive(
        &mut self,
        word: Reserved,
        tokens: &mut Tokenizer<'a>,
        sink: &mut DiagSink,
    ) {
        let keyword = tokens.peek(0, sink);
        tokens.advance(1);
        if self.pending != Pending::None {
            sink.error(AsmError::new(
                ErrorKind::Syntax,
                &keyword,
                format!(
                    "directive '{}' is not allowed inside a statement group",
                    keyword.text
                ),
            ));
            recover(tokens, sink);
            return;
        }
        let Some((value, value_token)) = self.constant(tokens, sink) else {
            recover(tokens, sink);
            return;
        };
        let semi = tokens.peek(0, sink);
        if semi.kind == TokenKind::Sym(Sym::Semi) {
            tokens.advance(1);
        } else {
            sink.error(AsmError::new(
                ErrorKind::Syntax,
                &semi,
                format!("expected ';' after '{}' directive", keyword.text),
            ));
            recover(tokens, sink);
        }
        match word {
            Reserved::Fbpa => {
                let width = self.litter.lane_mask_width();
                if check_limits(&value_token, value, width)
                    .map_err(|e| sink.error(e))
                    .is_err()
                {
                    return;
                }
                let mask = (value as u64) & full_mask(self.litter);
                if mask == 0 {
                    sink.warning(AsmError::new(
                        ErrorKind::Semantic,
                        &value_token,
                        "lane selection is empty; following statements apply \
                         to no thread",
                    ));
                }
                self.select(mask);
            }
            Reserved::MaxCyc => {
                if value <= 0 {
                    sink.error(AsmError::new(
                        ErrorKind::Semantic,
                        &value_token,
                        format!("cycle budget {value} must be positive"),
                    ));
                    return;
                }
                let selection = self.selection;
                for thread in self
                    .threads
                    .iter_mut()
                    .filter(|t| t.mask & selection != 0)
                {
                    thread.max_cycles = value as u64;
                }
            }
            _ => unreachable!(),
        }
        sink.begin_statement();
    }

    /// Re-route statements to the lanes in `mask`, splitting any thread
    /// that straddles the boundary. Each half inherits a full copy of the
    /// original's content, so both behave identically up to this point.
    fn select(&mut self, mask: u64) {
        let mut threads = Vec::with_capacity(self.threads.len() + 1);
        for thread in std::mem::take(&mut self.threads) {
            let inside = thread.mask & mask;
            let outside = thread.mask & !mask;
            if inside == 0 || outside == 0 {
                threads.push(thread);
            } else {
                debug!(
                    "splitting thread {:#x} into {inside:#x} and {outside:#x}",
                    thread.mask
                );
                let mut selected = thread.clone();
                selected.mask = inside;
                threads.push(selected);
                let mut deselected = thread;
                deselected.mask = outside;
                threads.push(deselected);
            }
        }
        self.threads = threads;
        self.selection = mask;
    }

    fn define_label(&mut self, name: &'a str, token: Token<'a>, sink: &mut DiagSink) {
        let selection = self.selection;
        let pending = self.pending;
        for thread in self
            .threads
            .iter_mut()
            .filter(|t| t.mask & selection != 0)
        {
            match pending {
                // Inside a group the label binds to the current index.
                Pending::Instruction => {
                    let index = (thread.instructions.len() - 1) as i64;
                    thread.define_label(name, &token, index, sink);
                }
                Pending::Patram => {
                    let index = (thread.patrams.len() - 1) as i64;
                    thread.define_label(name, &token, index, sink);
                }
                // Between groups it waits for whatever starts next.
                Pending::None => {
                    thread.pending_labels.push((name.to_owned(), token));
                }
            }
        }
    }

    fn open_instruction(&mut self, sink: &mut DiagSink) {
        sink.begin_statement();
        let width = self.litter.instruction_width();
        let selection = self.selection;
        for thread in self
            .threads
            .iter_mut()
            .filter(|t| t.mask & selection != 0)
        {
            thread.instructions.push(Instruction::new(width));
            let index = (thread.instructions.len() - 1) as i64;
            thread.bind_pending(index, sink);
        }
        self.pending = Pending::Instruction;
    }

    fn open_patram(&mut self, tokens: &mut Tokenizer<'a>, sink: &mut DiagSink) {
        let opener = tokens.peek(0, sink);
        tokens.advance(1);
        if self.pending != Pending::None {
            sink.error(AsmError::new(
                ErrorKind::Syntax,
                &opener,
                "'PATRAM' is not valid inside an open statement group",
            ));
            recover(tokens, sink);
            return;
        }
        sink.begin_statement();
        let selection = self.selection;
        for thread in self
            .threads
            .iter_mut()
            .filter(|t| t.mask & selection != 0)
        {
            thread.patrams.push(Patram::new(opener));
            let index = (thread.patrams.len() - 1) as i64;
            thread.bind_pending(index, sink);
        }
        self.pending = Pending::Patram;
    }

    /// `;` closes the open group. An empty group gets a no-op instruction
    /// and a warning.
    fn close_group(&mut self, at: &Token<'a>, sink: &mut DiagSink) {
        if self.pending == Pending::None {
            sink.warning(AsmError::new(
                ErrorKind::Syntax,
                at,
                "empty statement; a no-op instruction was inserted",
            ));
            self.open_instruction(sink);
        }
        self.close_open(sink);
        sink.begin_statement();
    }

    fn close_open(&mut self, sink: &mut DiagSink) {
        let selection = self.selection;
        let litter = self.litter;
        match self.pending {
            Pending::Instruction => {
                for thread in self
                    .threads
                    .iter_mut()
                    .filter(|t| t.mask & selection != 0)
                {
                    thread
                        .instructions
                        .last_mut()
                        .expect("no open instruction")
                        .close(sink);
                }
            }
            Pending::Patram => {
                for thread in self
                    .threads
                    .iter_mut()
                    .filter(|t| t.mask & selection != 0)
                {
                    thread
                        .patrams
                        .last()
                        .expect("no open patram")
                        .close(litter, sink);
                }
            }
            Pending::None => {}
        }
        self.pending = Pending::None;
    }

    /// The end-of-file pass: reject truncated input, bind the special
    /// labels, append the litter trailer and resolve every deferred
    /// expression.
    fn finish(&mut self, eof: &Token<'a>, sink: &mut DiagSink) {
        if self.pending != Pending::None {
            sink.error(AsmError::new(
                ErrorKind::Syntax,
                eof,
                "statement group is not terminated at end of file",
            ));
            self.close_open(sink);
        }
        sink.begin_statement();
        let litter = self.litter;
        for thread in &mut self.threads {
            for (name, token) in std::mem::take(&mut thread.pending_labels) {
                sink.error(AsmError::new(
                    ErrorKind::Semantic,
                    &token,
                    format!("label '{name}' is not attached to anything"),
                ));
            }
            // `end` and `endp` are bound before the trailer, so branching
            // to `end` lands on the trailer and stops cleanly.
            let specials = [
                ("start", 0),
                ("end", thread.instructions.len() as i64),
                ("endp", thread.patrams.len() as i64),
            ];
            for (name, index) in specials {
                if !thread.labels.contains_key(name) {
                    thread.labels.insert(
                        name.to_owned(),
                        LabelDef {
                            index,
                            file: "<builtin>".to_owned(),
                            line: 0,
                        },
                    );
                }
            }
            litter.append_trailer(&mut thread.instructions);
            thread.resolve(sink);
        }
        info!(
            "assembly finished: {} thread(s), {} error(s)",
            self.threads.len(),
            sink.error_count()
        );
    }

    /// Parse an expression, reporting a parse failure into the sink.
    fn expression(
        &self,
        tokens: &mut Tokenizer<'a>,
        sink: &mut DiagSink,
    ) -> Option<Expr<'a>> {
        match parse_expression(tokens, sink) {
            Ok(expr) => Some(expr),
            Err(e) => {
                sink.error(e);
                None
            }
        }
    }

    /// Parse and immediately evaluate a constant expression; labels are
    /// not allowed in structural positions.
    fn constant(
        &self,
        tokens: &mut Tokenizer<'a>,
        sink: &mut DiagSink,
    ) -> Option<(i64, Token<'a>)> {
        let expr = self.expression(tokens, sink)?;
        let token = expr.token();
        match expr.eval(&NoLabels) {
            Ok(value) => Some((value, token)),
            Err(e) => {
                sink.error(e);
                None
            }
        }
    }

    fn expect_reg(
        &self,
        tokens: &mut Tokenizer<'a>,
        sink: &mut DiagSink,
    ) -> Option<(usize, Token<'a>)> {
        let t = tokens.peek(0, sink);
        match t.kind {
            TokenKind::Reserved(Reserved::Reg(n)) => {
                tokens.advance(1);
                Some((n as usize, t))
            }
            _ => {
                sink.error(AsmError::new(
                    ErrorKind::Syntax,
                    &t,
                    format!("expected a register, found '{}'", t.text),
                ));
                None
            }
        }
    }
}

fn full_mask(litter: &dyn Litter) -> u64 {
    (1u64 << litter.lane_mask_width()) - 1
}

/// Discard tokens up to (not including) the next statement terminator.
fn recover(tokens: &mut Tokenizer, sink: &mut DiagSink) {
    loop {
        let t = tokens.peek(0, sink);
        match t.kind {
            TokenKind::Eof | TokenKind::Sym(Sym::Semi) => break,
            _ => tokens.advance(1),
        }
    }
}
