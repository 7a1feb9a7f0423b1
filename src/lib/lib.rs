//! Assembler and cycle simulator for MuCC microsequencer programs.
//!
//! The library is parameterised over a [`Litter`] profile, which supplies
//! everything architecture-specific: instruction width, bitfield layout,
//! reserved-word vocabulary, default-bit policy and trailer behaviour. The
//! core implements the language, the code model and the simulator once,
//! for all litters.

mod bits;
mod code;
mod error;
mod expr;
mod json;
mod lexer;
mod litter;
mod profile;
mod program;
mod sim;
mod token;

#[cfg(test)]
mod tests;

use log::info;

use error::DiagSink;
use lexer::Tokenizer;

pub use error::{AsmError, AssembleFailure, ErrorKind};
pub use litter::{G6, G7};
pub use profile::Litter;
pub use program::{Program, Thread};
pub use sim::{Outcome, ThreadReport};

/// Knobs for an assembly pass; CLI flags map directly onto this.
#[derive(Debug, Clone)]
pub struct AssembleOptions {
    /// Silence the warning for decimal literals with a leading zero.
    pub suppress_octal_warning: bool,
    /// Simulation cycle budget for threads that never see a MAXCYC
    /// directive.
    pub default_max_cycles: u64,
}

impl Default for AssembleOptions {
    fn default() -> Self {
        Self {
            suppress_octal_warning: false,
            default_max_cycles: 10_000,
        }
    }
}

/// A successful assembly; warnings may still have been raised.
pub struct AssembleSuccess<'a> {
    pub program: Program<'a>,
    pub warnings: Vec<AsmError>,
}

/// Assemble `source` with default options.
///
/// The source must end in a newline; callers reading arbitrary files
/// should append one if missing.
pub fn assemble<'a>(
    source: &'a str,
    file: &'a str,
    litter: &'a dyn Litter,
) -> Result<AssembleSuccess<'a>, AssembleFailure> {
    assemble_with(source, file, litter, &AssembleOptions::default())
}

pub fn assemble_with<'a>(
    source: &'a str,
    file: &'a str,
    litter: &'a dyn Litter,
    options: &AssembleOptions,
) -> Result<AssembleSuccess<'a>, AssembleFailure> {
    info!("assembling {file} for litter '{}'", litter.name());
    let mut sink = DiagSink::new();
    let mut tokens = Tokenizer::new(
        source,
        file,
        litter.vocabulary(),
        options.suppress_octal_warning,
    );
    let mut program = Program::new(litter, options.default_max_cycles);
    program.run(&mut tokens, &mut sink);
    let (errors, warnings) = sink.into_parts();
    if errors.is_empty() {
        Ok(AssembleSuccess { program, warnings })
    } else {
        Err(AssembleFailure { errors, warnings })
    }
}

/// Initialise logging for tests.
#[cfg(test)]
pub fn init_test_logging() {
    use std::io::Write;

    // The logger can only be initialised once, but we don't know the order of
    // tests. Therefore we use `try_init` and ignore the result.
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("trace"),
    )
    .format(|out, record| {
        writeln!(out, "{:>7} {}", record.level(), record.args())
    })
    .is_test(true)
    .try_init();
}
