use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use colored::{Color, Colorize};
use log::{error, info, LevelFilter};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::str::FromStr;

use mucc_asm::{
    assemble_with, AsmError, AssembleOptions, Litter, Outcome, ThreadReport,
    G6, G7,
};

const INPUT_FILES: &str = "INPUT_FILES";
const LITTER: &str = "litter";
const SIMULATE: &str = "simulate";
const MAX_CYCLES: &str = "max-cycles";
const NO_OCTAL_WARNING: &str = "no-octal-warning";
const VERBOSITY: &str = "verbosity";

const OUTPUT_EXTENSION: &str = "json";

const CONTEXT_COLOR: Color = Color::BrightCyan;
const WARNING_COLOR: Color = Color::BrightYellow;
const ERROR_COLOR: Color = Color::BrightRed;
const GENERIC_ERROR_COLOR: Color = Color::Magenta;

/// An input file plus its derived output path.
#[derive(Debug)]
struct InputFile<'a> {
    path: &'a str,
    file: File,
}

impl<'a> InputFile<'a> {
    /// Write the given buffer to the output path obtained from `self.output_path`.
    fn write_output(&self, buf: &[u8]) -> io::Result<()> {
        File::create(self.output_path()).and_then(|mut file| file.write_all(buf))
    }

    /// Get the corresponding output path for the input path by changing the
    /// extension.
    fn output_path(&self) -> PathBuf {
        let mut path = PathBuf::from_str(self.path).unwrap();
        path.set_extension(OUTPUT_EXTENSION);
        path
    }
}

fn cli() -> Command {
    // Hack to make the build dirty when the toml changes.
    include_str!("../../Cargo.toml");

    clap::command!()
        .after_help(
            "Example:\n    \
                muccasm --litter g7 --sim training-loop.mucc",
        )
        .arg(
            Arg::new(INPUT_FILES)
                .help("Input assembly files.")
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new(LITTER)
                .help("The litter (hardware generation) to assemble for.")
                .short('l')
                .long("litter")
                .value_parser(["g6", "g7"])
                .default_value("g6"),
        )
        .arg(
            Arg::new(SIMULATE)
                .help("Simulate each assembled program and print per-thread reports.")
                .short('s')
                .long("sim")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new(MAX_CYCLES)
                .help(
                    "Default simulation cycle budget for threads without a \
                   MAXCYC directive.",
                )
                .long("max-cycles")
                .value_parser(value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(NO_OCTAL_WARNING)
                .help("Silence the warning for decimal literals with a leading zero.")
                .long("no-octal-warning")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new(VERBOSITY)
                .help("Specify up to three times to increase the verbosity of output.")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count)
                .value_parser(value_parser!(u8).range(..=3)),
        )
}

fn logging_format(
    formatter: &mut env_logger::fmt::Formatter,
    record: &log::Record,
) -> io::Result<()> {
    let style = formatter.default_level_style(record.level());
    writeln!(
        formatter,
        "{:>7}  {}",
        style.value(record.level()),
        record.args()
    )
}

fn init_logging(level: LevelFilter) {
    env_logger::Builder::new()
        .filter_level(level)
        .format(logging_format)
        .target(env_logger::Target::Stdout)
        .init();
}

/// Report assembly errors to the user.
#[inline]
fn report_errors(errors: &[AsmError]) {
    report(errors, "error", ERROR_COLOR)
}

/// Report assembly warnings to the user.
#[inline]
fn report_warnings(warnings: &[AsmError]) {
    report(warnings, "warning", WARNING_COLOR)
}

/// Diagnostic reporting function: location, message, then the source line
/// with the offending token underlined.
fn report(items: &[AsmError], prefix: &str, color: Color) {
    for item in items.iter() {
        let message = format!("{}: {}: {}", item.location(), prefix, item.message);
        eprintln!("{}", message.color(color));
        if item.line_text.is_empty() {
            eprintln!();
            continue;
        }
        let line_num = format!("{} | ", item.line).color(CONTEXT_COLOR);
        eprintln!("  {}{}", line_num, item.line_text);
        let pad = line_num.chars().count() + item.col.saturating_sub(1) as usize;
        let highlight = format!("{}{}", " ".repeat(pad), "^".repeat(item.width));
        eprintln!("  {}\n", highlight.color(color));
    }
}

/// Report a generic error that's not related to a specific source span.
macro_rules! report_generic_error {
    ($($args:expr),*) => {{
        let message = format!($($args),*);
        eprintln!("{}\n", message.color(GENERIC_ERROR_COLOR));
    }}
}

/// Print one thread's simulation report.
fn print_report(report: &ThreadReport) {
    let outcome = match report.outcome {
        Outcome::Stopped => "stopped",
        Outcome::ReachedEnd => "reached end",
        Outcome::CycleBudget => "cycle budget exhausted",
        Outcome::Aborted => "aborted",
    };
    println!(
        "thread {:#06x}: {} after {} cycle(s), read error: {}",
        report.mask, outcome, report.cycles, report.read_error
    );
    for (i, value) in report.registers.iter().enumerate() {
        if *value != 0 {
            println!("  R{i} = {value:#x}");
        }
    }
    for diagnostic in &report.diagnostics {
        println!("  {}", diagnostic.color(WARNING_COLOR));
    }
}

/// Main run function; returns an exit code.
fn run(args: ArgMatches) -> u8 {
    return match _run(args) {
        Some(()) => 0,
        None => 1,
    };

    fn _run(args: ArgMatches) -> Option<()> {
        // Set up logging.
        let log_level = match args.get_count(VERBOSITY) {
            0 => None,
            1 => Some(LevelFilter::Info),
            2 => Some(LevelFilter::Debug),
            3 => Some(LevelFilter::Trace),
            _ => unreachable!(),
        };
        if let Some(level) = log_level {
            init_logging(level);
        }

        // Select the litter profile.
        let g6;
        let g7;
        let litter: &dyn Litter = match args
            .get_one::<String>(LITTER)
            .map(String::as_str)
        {
            Some("g7") => {
                g7 = G7::new();
                &g7
            }
            _ => {
                g6 = G6::new();
                &g6
            }
        };

        let mut options = AssembleOptions {
            suppress_octal_warning: args.get_flag(NO_OCTAL_WARNING),
            ..Default::default()
        };
        if let Some(budget) = args.get_one::<u64>(MAX_CYCLES) {
            options.default_max_cycles = *budget;
        }
        let simulate = args.get_flag(SIMULATE);

        // Collect input files.
        let paths = args.get_many::<String>(INPUT_FILES).unwrap_or_default();
        let mut inputs: Vec<InputFile> = Vec::with_capacity(paths.len());
        for path in paths {
            let file = File::open(path)
                .map_err(|e| {
                    report_generic_error!(
                        "IO Error: Failed to open input file '{}': {}",
                        path,
                        e
                    )
                })
                .ok()?;
            info!("Opened input '{}'", path);
            inputs.push(InputFile { path, file });
        }

        let num_inputs = inputs.len();
        if num_inputs == 0 {
            eprintln!("{}", cli().render_usage());
            return Some(());
        }

        // Iterate through inputs and assemble each one independently.
        let mut all_ok = true;
        for (i, input) in inputs.iter_mut().enumerate() {
            info!(
                "Processing file {} of {} ({}).",
                i + 1,
                num_inputs,
                input.path
            );

            // Read the file's contents; the grammar requires a trailing
            // newline, so append one defensively.
            let mut source = String::new();
            input
                .file
                .read_to_string(&mut source)
                .map_err(|e| {
                    report_generic_error!(
                        "IO Error: Failed to read input file '{}': {}",
                        input.path,
                        e
                    )
                })
                .ok()?;
            if !source.ends_with('\n') {
                source.push('\n');
            }
            info!("Read file {}.", i + 1);

            let success = match assemble_with(&source, input.path, litter, &options) {
                Ok(success) => success,
                Err(failure) => {
                    error!("Assembly failed for file {}.", i + 1);
                    report_warnings(&failure.warnings);
                    report_errors(&failure.errors);
                    report_generic_error!(
                        "File '{}' failed to assemble.",
                        input.path
                    );
                    all_ok = false;
                    continue;
                }
            };
            info!("Assembled file {}.", i + 1);
            report_warnings(&success.warnings);

            // Write the output document.
            let mut doc = serde_json::to_vec_pretty(&success.program.to_json())
                .expect("document serialization cannot fail");
            doc.push(b'\n');
            input
                .write_output(&doc)
                .map_err(|e| {
                    report_generic_error!(
                        "IO Error: Failed to write output file '{}': {}",
                        input.output_path().display(),
                        e
                    )
                })
                .ok()?;
            info!("Written result for file {}.", i + 1);

            if simulate {
                for report in success.program.simulate() {
                    print_report(&report);
                }
            }
        }

        if all_ok {
            Some(())
        } else {
            None
        }
    }
}

fn main() {
    let args = cli().get_matches();
    std::process::exit(run(args).into());
}
