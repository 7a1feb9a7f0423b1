//! End-to-end tests: source text in, assembled words / simulation reports
//! out.

use ntest::timeout;

use crate::init_test_logging;
use crate::sim::Outcome;
use crate::{assemble, assemble_with, AssembleOptions, Litter, G6, G7};

fn ok<'a>(source: &'a str, litter: &'a dyn Litter) -> crate::AssembleSuccess<'a> {
    match assemble(source, "test.mucc", litter) {
        Ok(success) => success,
        Err(failure) => panic!("unexpected failure: {}", failure.first()),
    }
}

fn err(source: &str, litter: &dyn Litter) -> crate::AssembleFailure {
    match assemble(source, "test.mucc", litter) {
        Ok(_) => panic!("expected failure for {source:?}"),
        Err(failure) => failure,
    }
}

#[test]
fn load_encodes_register_fields() {
    init_test_logging();
    let litter = G6::new();
    let success = ok("LOAD R1 0x50;\nSTOP;\n", &litter);
    let thread = &success.program.threads()[0];
    assert_eq!(thread.instructions.len(), 2);
    let bits = thread.instructions[0].output_bits(&litter);
    assert_eq!(bits.get_bits(24, 24), 1, "load enable");
    assert_eq!(bits.get_bits(28, 25), 1, "load index");
    assert_eq!(bits.get_bits(44, 29), 0x50, "load value");
    // Clock-enable defaults high on every word.
    assert_eq!(bits.get_bits(75, 75), 1);
}

#[test]
fn forward_labels_resolve() {
    init_test_logging();
    let litter = G6::new();
    let success = ok("JMP done;\nNOP 0;\ndone: STOP;\n", &litter);
    let thread = &success.program.threads()[0];
    let bits = thread.instructions[0].output_bits(&litter);
    assert_eq!(bits.get_bits(81, 80), 1, "branch mode");
    assert_eq!(bits.get_bits(89, 82), 2, "branch target");
    assert_eq!(thread.labels["done"].index, 2);
}

#[test]
fn whitespace_splits_load_arguments() {
    init_test_logging();
    let litter = G6::new();
    // `1+2` is one value; `1 +2` is a value and an increment step.
    let joined = ok("LOAD R0 1+2;\nSTOP;\n", &litter);
    let bits = joined.program.threads()[0].instructions[0].output_bits(&litter);
    assert_eq!(bits.get_bits(44, 29), 3);
    assert_eq!(bits.get_bits(52, 45), 0);

    let split = ok("LOAD R0 1 +2;\nSTOP;\n", &litter);
    let bits = split.program.threads()[0].instructions[0].output_bits(&litter);
    assert_eq!(bits.get_bits(44, 29), 1);
    assert_eq!(bits.get_bits(52, 45), 2);
}

#[test]
fn lane_directive_splits_threads() {
    init_test_logging();
    let litter = G6::new();
    let success = ok(
        "FBPA 0b0011;\nLOAD R0 1;\nFBPA 0b1100;\nLOAD R0 2;\n\
         FBPA 0xFFFF;\nSTOP;\n",
        &litter,
    );
    let threads = success.program.threads();
    assert_eq!(threads.len(), 3);
    let masks: Vec<u64> = threads.iter().map(|t| t.mask).collect();
    assert!(masks.contains(&0x3));
    assert!(masks.contains(&0xC));
    assert!(masks.contains(&0xFFF0));
    for thread in threads {
        let loads = match thread.mask {
            0x3 | 0xC => 1,
            _ => 0,
        };
        // Each thread carries its own loads plus the shared STOP.
        assert_eq!(thread.instructions.len(), loads + 1);
    }
    // And the loads landed with the right values.
    let reports = success.program.simulate();
    for report in &reports {
        let expected = match report.mask {
            0x3 => 1,
            0xC => 2,
            _ => 0,
        };
        assert_eq!(report.outcome, Outcome::Stopped);
        assert_eq!(report.registers[0], expected);
    }
}

#[test]
fn load_and_increment_conflict_in_one_instruction() {
    init_test_logging();
    let litter = G6::new();
    let failure = err("LOAD R1 5 INCR R1;\nSTOP;\n", &litter);
    assert!(failure.first().message.contains("loaded and incremented"));
    // Different registers are fine.
    ok("LOAD R1 5 INCR R2;\nSTOP;\n", &litter);
}

#[test]
#[timeout(2000)]
fn simulator_applies_linear_increments() {
    init_test_logging();
    let litter = G6::new();
    let success = ok(
        "LOAD R2 10 3;\nINCR R2;\nINCR R2;\nSTOP;\n",
        &litter,
    );
    let reports = success.program.simulate();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].outcome, Outcome::Stopped);
    assert_eq!(reports[0].cycles, 4);
    assert_eq!(reports[0].registers[2], 16);
}

#[test]
#[timeout(2000)]
fn simulator_applies_prbs_increments() {
    init_test_logging();
    let litter = G6::new();
    let success = ok("LOAD R3 1 PRBS;\nINCR R3;\nSTOP;\n", &litter);
    let reports = success.program.simulate();
    assert_eq!(reports[0].registers[3], crate::sim::prbs15_next(1));
}

#[test]
fn hack_statements_overlay_without_conflict() {
    init_test_logging();
    let litter = G6::new();
    let success = ok("HOLD 3 SETBITS 71 70 0;\nSTOP;\n", &litter);
    assert!(success.warnings.is_empty());
    let bits = success.program.threads()[0].instructions[0].output_bits(&litter);
    // The hack cleared both hold bits that HOLD had set.
    assert_eq!(bits.get_bits(73, 70), 0);
}

#[test]
fn patram_regions_must_fill_exactly() {
    init_test_logging();
    let litter = G6::new();
    let success = ok("PATRAM DQ 1 2 ECC 3 DBI 4;\nSTOP;\n", &litter);
    let thread = &success.program.threads()[0];
    assert_eq!(thread.patrams.len(), 1);
    assert_eq!(thread.patrams[0].dq().words(), &[1, 2]);

    let failure = err("PATRAM DQ 1;\nSTOP;\n", &litter);
    // DQ short, ECC and DBI missing entirely.
    assert_eq!(failure.error_count(), 3);
    assert!(failure.first().message.contains("DQ region is 32 bits"));
}

#[test]
fn duplicate_and_orphan_labels_are_errors() {
    init_test_logging();
    let litter = G6::new();
    let failure = err("a: NOP 0;\na: STOP;\n", &litter);
    assert!(failure.first().message.contains("duplicate label 'a'"));

    let failure = err("STOP;\norphan:\n", &litter);
    assert!(failure.first().message.contains("orphan"));
}

#[test]
fn empty_statement_warns_and_inserts_a_noop() {
    init_test_logging();
    let litter = G6::new();
    let success = ok(";\nSTOP;\n", &litter);
    assert_eq!(success.warnings.len(), 1);
    assert!(success.warnings[0].message.contains("empty statement"));
    assert_eq!(success.program.threads()[0].instructions.len(), 2);
}

#[test]
fn trailer_pads_a_trailing_branch() {
    init_test_logging();
    let litter = G6::new();
    let success = ok("JMP 0;\n", &litter);
    let thread = &success.program.threads()[0];
    // Landing pad and synthesized stop follow the branch.
    assert_eq!(thread.instructions.len(), 3);
    let stop = litter.stop_bit();
    let last = thread.instructions[2].output_bits(&litter);
    assert_eq!(last.get_bits(stop.hi, stop.lo), 1);
    let pad = thread.instructions[1].output_bits(&litter);
    assert_eq!(pad.get_bits(stop.hi, stop.lo), 0);
    // `end` binds before the trailer.
    assert_eq!(thread.labels["end"].index, 1);
}

#[test]
fn diagnostics_deduplicate_across_threads() {
    init_test_logging();
    let litter = G6::new();
    // The conflicting statement is routed to both threads but reports once.
    let failure = err(
        "FBPA 0b0101;\nFBPA 0xFFFF;\nHOLD 1 HOLD 2;\nSTOP;\n",
        &litter,
    );
    assert_eq!(failure.error_count(), 1);
    assert!(failure.first().message.contains("conflict"));
}

#[test]
#[timeout(2000)]
fn branches_have_a_one_instruction_delay_slot() {
    init_test_logging();
    let litter = G6::new();
    let success = ok(
        "MAXCYC 100;\nLOAD R0 1;\nJMP skip;\nLOAD R0 2;\nLOAD R0 3;\n\
         skip: STOP;\n",
        &litter,
    );
    let reports = success.program.simulate();
    assert_eq!(reports[0].outcome, Outcome::Stopped);
    // The delay-slot load ran; the one after the slot did not.
    assert_eq!(reports[0].registers[0], 2);
    assert_eq!(reports[0].cycles, 4);
}

#[test]
#[timeout(2000)]
fn hold_stretches_an_instruction() {
    init_test_logging();
    let litter = G6::new();
    let success = ok("MAXCYC 100;\nHOLD 2;\nSTOP;\n", &litter);
    let reports = success.program.simulate();
    assert_eq!(reports[0].outcome, Outcome::Stopped);
    // Three cycles for the held instruction, one for the stop.
    assert_eq!(reports[0].cycles, 4);
}

#[test]
#[timeout(2000)]
fn taken_branches_cut_a_hold_short() {
    init_test_logging();
    let litter = G6::new();
    // The held instruction sits in the delay slot: it runs for one cycle,
    // then the ready branch takes, discarding the rest of the hold.
    let success = ok("MAXCYC 100;\nJMP skip;\nHOLD 5;\nskip: STOP;\n", &litter);
    let reports = success.program.simulate();
    assert_eq!(reports[0].outcome, Outcome::Stopped);
    assert_eq!(reports[0].cycles, 3);
}

#[test]
#[timeout(2000)]
fn branch_past_the_end_aborts_with_a_diagnostic() {
    init_test_logging();
    let litter = G6::new();
    let success = ok("MAXCYC 100;\nJMP 9;\nHOLD 0;\n", &litter);
    let reports = success.program.simulate();
    assert_eq!(reports[0].outcome, Outcome::Aborted);
    assert!(reports[0]
        .diagnostics
        .iter()
        .any(|d| d.contains("branch to 9 is outside")));
}

#[test]
#[timeout(2000)]
fn cycle_budget_bounds_a_spinning_program() {
    init_test_logging();
    let litter = G6::new();
    let success = ok("MAXCYC 5;\nJMP 0;\n", &litter);
    let reports = success.program.simulate();
    assert_eq!(reports[0].outcome, Outcome::CycleBudget);
    assert_eq!(reports[0].cycles, 5);
}

#[test]
#[timeout(2000)]
fn clock_enable_gates_dram_commands() {
    init_test_logging();
    let litter = G6::new();
    // With CKE low the read never reaches the (closed) bank.
    let gated = ok("LOAD R0 0;\nREAD 0 R0 R0 R0 CKE 0;\nSTOP;\n", &litter);
    let reports = gated.program.simulate();
    assert!(!reports[0].read_error);
    assert!(reports[0].diagnostics.is_empty());

    let ungated = ok("LOAD R0 0;\nREAD 0 R0 R0 R0;\nSTOP;\n", &litter);
    let reports = ungated.program.simulate();
    assert!(reports[0].read_error);
}

#[test]
#[timeout(2000)]
fn dbi_round_trips_through_memory() {
    init_test_logging();
    let litter = G6::new();
    let program = "MAXCYC 100;\nPATRAM DQ 0xFF 0 ECC 0 DBI 1;\nLOAD R0 0;\n\
                   ACT 1 R0 R0;\nWRITE 0 R0 R0 R0 USEDBI;\n\
                   READ 0 R0 R0 R0 USEDBI;\nSTOP;\n";
    let success = ok(program, &litter);
    let reports = success.program.simulate();
    assert_eq!(reports[0].outcome, Outcome::Stopped);
    assert!(!reports[0].read_error, "{:?}", reports[0].diagnostics);

    // Writing inverted but reading raw mismatches.
    let mismatched = program.replace("READ 0 R0 R0 R0 USEDBI", "READ 0 R0 R0 R0");
    let success = ok(&mismatched, &litter);
    let reports = success.program.simulate();
    assert!(reports[0].read_error);
}

#[test]
fn phase_parity_is_enforced() {
    init_test_logging();
    let litter = G6::new();
    let failure = err("LOAD R0 0;\nACT 0 R0 R0;\nSTOP;\n", &litter);
    assert!(failure.first().message.contains("odd phase"));
    let failure = err("LOAD R0 0;\nREAD 1 R0 R0 R0;\nSTOP;\n", &litter);
    assert!(failure.first().message.contains("even phase"));
    // NOP is parity-free.
    ok("NOP 0;\nNOP 1;\nSTOP;\n", &litter);
}

#[test]
fn g7_channels_and_rfm() {
    init_test_logging();
    let litter = G7::new();
    let success = ok("LOAD R0 0;\nACT CHB 1 R0 R0;\nREF 1;\nSTOP;\n", &litter);
    let thread = &success.program.threads()[0];
    let act = thread.instructions[1].output_bits(&litter);
    let cmd = litter.command_field(1, 1);
    assert_eq!(act.get_bits(cmd.hi, cmd.lo), 1);
    // Channel A's slot stayed empty.
    let cmd_a = litter.command_field(1, 0);
    assert_eq!(act.get_bits(cmd_a.hi, cmd_a.lo), 0);
    // REF implies refresh management on this generation.
    let refresh = thread.instructions[2].output_bits(&litter);
    let rfm = litter.rfm_bit().unwrap();
    assert_eq!(refresh.get_bits(rfm.hi, rfm.lo), 1);
    // G6 rejects the channel token outright.
    let failure = err("ACT CHB 1 R0 R0;\nSTOP;\n", &G6::new());
    assert!(failure.error_count() > 0);
}

#[test]
fn json_document_shape() {
    init_test_logging();
    let litter = G6::new();
    let success = ok("LOAD R1 0x50;\nSTOP;\n", &litter);
    let doc = success.program.to_json();
    assert_eq!(doc["litter"], "g6");
    let threads = doc["threads"].as_array().unwrap();
    assert_eq!(threads.len(), 1);
    assert_eq!(threads[0]["mask"], "65535");
    let instructions = threads[0]["instructions"].as_array().unwrap();
    assert_eq!(instructions.len(), 2);
    assert_eq!(instructions[0]["words"].as_array().unwrap().len(), 4);
    assert!(instructions[0]["lines"][0]
        .as_str()
        .unwrap()
        .contains("test.mucc:1"));
    let labels = threads[0]["labels"].as_object().unwrap();
    assert_eq!(labels["start"], 0);
    assert_eq!(labels["end"], 2);
}

#[test]
fn octal_warning_and_suppression() {
    init_test_logging();
    let litter = G6::new();
    let success = ok("LOAD R0 010;\nSTOP;\n", &litter);
    assert_eq!(success.warnings.len(), 1);

    let options = AssembleOptions {
        suppress_octal_warning: true,
        ..Default::default()
    };
    let success =
        assemble_with("LOAD R0 010;\nSTOP;\n", "test.mucc", &litter, &options)
            .unwrap();
    assert!(success.warnings.is_empty());
}

#[test]
fn unterminated_group_is_an_error() {
    init_test_logging();
    let litter = G6::new();
    let failure = err("STOP;\nLOAD R0 1\n", &litter);
    assert!(failure.first().message.contains("not terminated"));
}

#[test]
fn shared_selectors_allow_paired_read_write() {
    init_test_logging();
    let litter = G6::new();
    // READ and WRITE on different phases agreeing on registers coexist.
    ok("LOAD R0 0;\nREAD 0 R0 R0 R0 WRITE 2 R0 R0 R0;\nSTOP;\n", &litter);
    // Disagreeing selectors conflict.
    let failure = err(
        "LOAD R0 0;\nREAD 0 R0 R0 R0 WRITE 2 R1 R0 R0;\nSTOP;\n",
        &litter,
    );
    assert!(failure.first().message.contains("conflict"));
}
