use log::{error, warn};
use std::borrow::Cow;
use std::collections::HashSet;
use std::fmt::{self, Display, Formatter};

use crate::token::Token;

/// Diagnostic classification, ordered by pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed tokens: stray characters, overflowing integer literals.
    Lexical,
    /// Statement-level structure: unexpected tokens, malformed expressions,
    /// wrong operand counts.
    Syntax,
    /// Well-formed but meaningless: conflicting field writes, out-of-range
    /// values, label problems.
    Semantic,
    /// An internal invariant failed; the surrounding operation is abandoned.
    Internal,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Lexical => "lexical error",
            ErrorKind::Syntax => "syntax error",
            ErrorKind::Semantic => "semantic error",
            ErrorKind::Internal => "internal error",
        };
        f.write_str(name)
    }
}

/// A single diagnostic, pinned to a source location.
///
/// Locations are carried as owned strings so diagnostics outlive the source
/// buffer they were raised against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsmError {
    pub kind: ErrorKind,
    pub file: String,
    pub line: u32,
    pub col: u32,
    /// Width of the offending token, for underlining.
    pub width: usize,
    /// The full source line the token sits on.
    pub line_text: String,
    pub message: Cow<'static, str>,
}

impl AsmError {
    /// Construct a diagnostic pointing at the given token.
    pub fn new(
        kind: ErrorKind,
        token: &Token,
        message: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            kind,
            file: token.file.to_owned(),
            line: token.line,
            col: token.col,
            width: token.text.chars().count().max(1),
            line_text: token.line_text.to_owned(),
            message: message.into(),
        }
    }

    /// Location string in `file:line:col` form.
    pub fn location(&self) -> String {
        format!("{}:{}:{}", self.file, self.line, self.col)
    }
}

impl Display for AsmError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}: {}: {}",
            self.file, self.line, self.col, self.kind, self.message
        )
    }
}

pub type AsmResult<T> = Result<T, AsmError>;

/// Collects diagnostics for one assembly pass.
///
/// Recoverable problems are recorded here and assembly continues; the sink
/// is drained into the final result when the pass ends. Repeats of the same
/// message on the same line are collapsed until the next statement boundary,
/// so a statement routed to several threads reports each problem once.
#[derive(Debug, Default)]
pub struct DiagSink {
    errors: Vec<AsmError>,
    warnings: Vec<AsmError>,
    seen: HashSet<(String, u32, String)>,
}

impl DiagSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error, unless it duplicates one already recorded for this
    /// statement.
    pub fn error(&mut self, err: AsmError) {
        if self.fresh(&err) {
            error!("{}", err);
            self.errors.push(err);
        }
    }

    /// Record a warning, with the same de-duplication as `error`.
    pub fn warning(&mut self, err: AsmError) {
        if self.fresh(&err) {
            warn!("{}", err);
            self.warnings.push(err);
        }
    }

    /// Reset the de-duplication window. Called at each statement boundary:
    /// the same message on the same line is fair game again afterwards.
    pub fn begin_statement(&mut self) {
        self.seen.clear();
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Consume the sink, yielding (errors, warnings).
    pub fn into_parts(self) -> (Vec<AsmError>, Vec<AsmError>) {
        (self.errors, self.warnings)
    }

    fn fresh(&mut self, err: &AsmError) -> bool {
        self.seen
            .insert((err.file.clone(), err.line, err.message.clone().into_owned()))
    }
}

/// A failed assembly: at least one error, plus any warnings raised before
/// the failure.
#[derive(Debug)]
pub struct AssembleFailure {
    pub errors: Vec<AsmError>,
    pub warnings: Vec<AsmError>,
}

impl AssembleFailure {
    /// The first error recorded. Later errors are often knock-on effects of
    /// recovery, so this is the one worth reading first.
    pub fn first(&self) -> &AsmError {
        &self.errors[0]
    }

    pub fn error_count(&self) -> usize {
        self.errors.len()
    }
}
