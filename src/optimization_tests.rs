// Optimisation pass tests

use super::*;
use crate::codegen::CodeGen;
use crate::lexer::tokenize;
use crate::parser::Parser;
use crate::ZVersion;

fn build(source: &str) -> (crate::codegen::CodeGenOutput, crate::ast::Program) {
    let tokens = tokenize(source, "<test>").unwrap();
    let program = Parser::new(tokens, "<test>").parse().unwrap();
    let output = CodeGen::new(ZVersion::V3, false)
        .generate(&program)
        .unwrap();
    (output, program)
}

#[test]
fn string_dedup_counts_inline_duplicates() {
    let (mut output, program) = build(
        r#"<ROUTINE GO ()
             <PRINTI "again"> <PRINTI "again"> <PRINTI "once">
             <QUIT>>"#,
    );
    let mut pass = StringDeduplicationPass::default();
    let mut data = OptimizationData {
        output: &mut output,
        program: &program,
        version: 3,
    };
    pass.run(&mut data).unwrap();

    assert_eq!(pass.total, 3);
    assert_eq!(pass.unique, 2);
    assert_eq!(pass.duplicates, 1);
    // The duplicate became a string-table candidate
    assert!(output.strings.iter().any(|s| s == "again"));
}

#[test]
fn property_dedup_maps_shared_values() {
    let (mut output, program) = build(
        r#"<OBJECT A (DESC "thing") (SIZE 5)>
           <OBJECT B (DESC "thing") (SIZE 5)>
           <ROUTINE GO () <QUIT>>"#,
    );
    let mut pass = PropertyDedupPass::default();
    let mut data = OptimizationData {
        output: &mut output,
        program: &program,
        version: 3,
    };
    pass.run(&mut data).unwrap();

    assert_eq!(pass.total_properties, 4);
    // Both property values of B map onto A's sites
    assert_eq!(pass.dedup_map.len(), 2);
    assert_eq!(
        pass.dedup_map
            .get(&("B".to_string(), "DESC".to_string()))
            .map(|c| c.0.as_str()),
        Some("A")
    );
}

#[test]
fn abbreviation_pass_keeps_clean_tables_intact() {
    let (mut output, program) = build("<ROUTINE GO () <QUIT>>");
    let mut table = crate::abbreviations::AbbreviationsTable::new();
    let corpus = vec!["the thing".to_string(); 20];
    table.analyze_strings(&corpus, crate::abbreviations::MAX_ABBREVIATIONS);
    let before = table.len();
    output.abbreviations = Some(table);

    let mut pass = AbbreviationOptimizationPass::default();
    let mut data = OptimizationData {
        output: &mut output,
        program: &program,
        version: 3,
    };
    pass.run(&mut data).unwrap();

    assert_eq!(pass.dropped, 0);
    assert_eq!(pass.kept, before);
    assert!(abbreviations_overlap_free(
        output.abbreviations.as_ref().unwrap()
    ));
}

#[test]
fn pipeline_runs_all_passes() {
    let (mut output, program) = build(r#"<ROUTINE GO () <PRINTI "x"> <QUIT>>"#);
    let mut pipeline = OptimizationPipeline::new();
    pipeline.add_pass(Box::new(StringDeduplicationPass::default()));
    pipeline.add_pass(Box::new(PropertyDedupPass::default()));
    pipeline.add_pass(Box::new(AbbreviationOptimizationPass::default()));
    let mut data = OptimizationData {
        output: &mut output,
        program: &program,
        version: 3,
    };
    pipeline.run(&mut data).unwrap();
}
