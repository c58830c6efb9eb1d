// Optimisation Passes
//
// Run between code generation and assembly. String deduplication scans
// routine bytecode for inline print text and counts duplicates for the
// string table; property-value deduplication computes canonical sites
// for shared values; abbreviation optimisation re-runs the greedy
// selection so no kept abbreviation overlaps another.

use std::collections::HashMap;

use log::debug;

use crate::abbreviations::AbbreviationsTable;
use crate::ast::{Program, ZilNode};
use crate::codegen::CodeGenOutput;
use crate::error::CompilerError;
use crate::text;

/// Shared state the passes read and refine.
pub struct OptimizationData<'a> {
    pub output: &'a mut CodeGenOutput,
    pub program: &'a Program,
    pub version: u8,
}

pub trait OptimizationPass {
    fn name(&self) -> &'static str;
    fn run(&mut self, data: &mut OptimizationData) -> Result<(), CompilerError>;
}

pub struct OptimizationPipeline {
    passes: Vec<Box<dyn OptimizationPass>>,
}

impl OptimizationPipeline {
    pub fn new() -> Self {
        OptimizationPipeline { passes: Vec::new() }
    }

    pub fn add_pass(&mut self, pass: Box<dyn OptimizationPass>) {
        self.passes.push(pass);
    }

    pub fn run(&mut self, data: &mut OptimizationData) -> Result<(), CompilerError> {
        for pass in &mut self.passes {
            debug!("optimisation pass: {}", pass.name());
            pass.run(data)?;
        }
        Ok(())
    }
}

impl Default for OptimizationPipeline {
    fn default() -> Self {
        OptimizationPipeline::new()
    }
}

// ----------------------------------------------------------------------
// String deduplication
// ----------------------------------------------------------------------

/// Collects string literals from routine bytecode (inline text after the
/// print opcode) and object properties, counts uses, and registers
/// duplicate texts with the string table so later fix-ups can share one
/// encoding.
#[derive(Default)]
pub struct StringDeduplicationPass {
    pub total: usize,
    pub unique: usize,
    pub duplicates: usize,
}

impl OptimizationPass for StringDeduplicationPass {
    fn name(&self) -> &'static str {
        "string-dedup"
    }

    fn run(&mut self, data: &mut OptimizationData) -> Result<(), CompilerError> {
        let abbrevs: Vec<String> = data
            .output
            .abbreviations
            .as_ref()
            .map(|t| t.strings().to_vec())
            .unwrap_or_default();

        let mut usage: HashMap<String, u32> = HashMap::new();

        // Inline print text in routine bytecode: 0OP print (0xB2)
        // followed by encoded Z-text.
        let code = &data.output.routines_code;
        let mut i = 0;
        while i < code.len() {
            if code[i] == 0xB2 {
                if let Ok((text, consumed)) =
                    text::decode_bytes(&code[i + 1..], data.version, &abbrevs)
                {
                    if consumed > 0 {
                        *usage.entry(text).or_insert(0) += 1;
                        i += 1 + consumed;
                        continue;
                    }
                }
            }
            i += 1;
        }

        // Strings already routed through the string table (properties,
        // TELL under --string-dedup) count too.
        for string in &data.output.strings {
            *usage.entry(string.clone()).or_insert(0) += 1;
        }

        self.total = usage.values().map(|c| *c as usize).sum();
        self.unique = usage.len();
        self.duplicates = self.total - self.unique;

        // Texts printed inline more than once become candidates for
        // PRINT_PADDR conversion: make sure the table will carry them.
        let mut candidates: Vec<&String> = usage
            .iter()
            .filter(|(_, &count)| count > 1)
            .map(|(text, _)| text)
            .collect();
        candidates.sort();
        for text in candidates {
            if !data.output.strings.contains(text) {
                data.output.strings.push(text.clone());
            }
        }

        debug!(
            "string dedup: {} uses, {} unique, {} duplicates",
            self.total, self.unique, self.duplicates
        );
        Ok(())
    }
}

// ----------------------------------------------------------------------
// Property value deduplication bookkeeping
// ----------------------------------------------------------------------

/// Computes a canonical representation of every property value across
/// objects and rooms, and maps each duplicate to its canonical site for
/// the object-table builder to consume.
#[derive(Default)]
pub struct PropertyDedupPass {
    pub total_properties: usize,
    pub unique_values: usize,
    /// (object, property) -> canonical (object, property)
    pub dedup_map: HashMap<(String, String), (String, String)>,
}

impl OptimizationPass for PropertyDedupPass {
    fn name(&self) -> &'static str {
        "property-dedup"
    }

    fn run(&mut self, data: &mut OptimizationData) -> Result<(), CompilerError> {
        let mut usage: HashMap<String, Vec<(String, String)>> = HashMap::new();

        for object in data.program.rooms.iter().chain(&data.program.objects) {
            for prop in &object.properties {
                self.total_properties += 1;
                let repr = value_repr(&prop.values);
                usage
                    .entry(repr)
                    .or_default()
                    .push((object.name.clone(), prop.name.clone()));
            }
        }

        self.unique_values = usage.len();
        for sites in usage.values() {
            if sites.len() > 1 {
                let canonical = sites[0].clone();
                for site in &sites[1..] {
                    self.dedup_map.insert(site.clone(), canonical.clone());
                }
            }
        }

        debug!(
            "property dedup: {} properties, {} unique values, {} shareable",
            self.total_properties,
            self.unique_values,
            self.dedup_map.len()
        );
        Ok(())
    }
}

fn value_repr(values: &[ZilNode]) -> String {
    let mut out = String::new();
    for value in values {
        match value {
            ZilNode::Number(n) => out.push_str(&format!("n{};", n)),
            ZilNode::Str(s) => out.push_str(&format!("s{:?};", s)),
            ZilNode::Atom(a, _) => out.push_str(&format!("a{};", a.to_uppercase())),
            other => out.push_str(&format!("{:?};", other)),
        }
    }
    out
}

// ----------------------------------------------------------------------
// Abbreviation overlap elimination
// ----------------------------------------------------------------------

/// Re-greedy-selects from the candidate pool, dropping any abbreviation
/// that contains or is contained in an already-kept one. Overlapping
/// abbreviations would make the encoder's longest-match lookup
/// ambiguous.
#[derive(Default)]
pub struct AbbreviationOptimizationPass {
    pub dropped: usize,
    pub kept: usize,
}

impl OptimizationPass for AbbreviationOptimizationPass {
    fn name(&self) -> &'static str {
        "abbreviation-overlap"
    }

    fn run(&mut self, data: &mut OptimizationData) -> Result<(), CompilerError> {
        if let Some(table) = data.output.abbreviations.as_mut() {
            self.dropped = table.eliminate_overlaps();
            self.kept = table.len();
            debug!(
                "abbreviations: kept {}, dropped {} overlapping",
                self.kept, self.dropped
            );
        }
        Ok(())
    }
}

/// Verify no two abbreviations overlap (testable property).
pub fn abbreviations_overlap_free(table: &AbbreviationsTable) -> bool {
    let strings = table.strings();
    for (i, a) in strings.iter().enumerate() {
        for b in &strings[i + 1..] {
            if a.contains(b.as_str()) || b.contains(a.as_str()) {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
#[path = "optimization_tests.rs"]
mod tests;
