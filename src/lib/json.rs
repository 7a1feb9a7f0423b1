//! Serialization of an assembled program to its output document.

use itertools::Itertools;
use serde_json::{json, Value};

use crate::program::Program;

impl<'a> Program<'a> {
    /// The output document: one entry per thread, each carrying its lane
    /// mask, cycle budget, annotated instruction words, pattern entries and
    /// label map. Label maps are emitted in sorted order so the document is
    /// deterministic.
    pub fn to_json(&self) -> Value {
        let litter = self.litter();
        let threads: Vec<Value> = self
            .threads()
            .iter()
            .map(|thread| {
                let instructions: Vec<Value> = thread
                    .instructions
                    .iter()
                    .map(|instr| {
                        json!({
                            "lines": instr.lines(),
                            "words": instr.output_bits(litter).words(),
                        })
                    })
                    .collect();
                let patram: Vec<Value> = thread
                    .patrams
                    .iter()
                    .map(|p| {
                        json!({
                            "lines": p.lines(),
                            "dq": p.dq().words(),
                            "ecc": p.ecc().words(),
                            "dbi": p.dbi().words(),
                        })
                    })
                    .collect();
                let labels: serde_json::Map<String, Value> = thread
                    .labels
                    .iter()
                    .sorted_by_key(|(name, _)| name.as_str())
                    .map(|(name, def)| (name.clone(), json!(def.index)))
                    .collect();
                json!({
                    "mask": thread.mask.to_string(),
                    "max_cycles": thread.max_cycles,
                    "instructions": instructions,
                    "patram": patram,
                    "labels": labels,
                })
            })
            .collect();
        json!({
            "litter": litter.name(),
            "threads": threads,
        })
    }
}
