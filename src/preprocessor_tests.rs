// Preprocessor tests

use super::*;
use crate::{CompileContext, CtValue};
use std::path::Path;

fn run(source: &str, version: u8) -> (String, CompileContext) {
    let mut ctx = CompileContext::new(version);
    let result = {
        let mut pre = Preprocessor::new(&mut ctx);
        pre.preprocess(source, Path::new(".")).unwrap()
    };
    (result, ctx)
}

#[test]
fn control_characters_become_newlines() {
    assert_eq!(normalize_control_characters("A/^LB^LC"), "A\nB\nC");
}

#[test]
fn compilation_flag_is_recorded_and_removed() {
    let (out, ctx) = run("<COMPILATION-FLAG DEBUG <T>> <ROUTINE GO () <QUIT>>", 3);
    assert!(!out.contains("COMPILATION-FLAG"));
    assert_eq!(ctx.compilation_flags.get("DEBUG"), Some(&true));

    let (_, ctx) = run("<COMPILATION-FLAG BETA <>>", 3);
    assert_eq!(ctx.compilation_flags.get("BETA"), Some(&false));
}

#[test]
fn ifflag_selects_true_clause() {
    let (out, _) = run(
        "<COMPILATION-FLAG DEBUG <T>>\n<IFFLAG (DEBUG <GLOBAL D 1>) (ELSE <GLOBAL D 0>)>",
        3,
    );
    assert!(out.contains("<GLOBAL D 1>"));
    assert!(!out.contains("<GLOBAL D 0>"));
}

#[test]
fn ifflag_falls_through_to_else() {
    let (out, _) = run("<IFFLAG (MISSING <A>) (ELSE <B>)>", 3);
    assert!(!out.contains("<A>"));
    assert!(out.contains("<B>"));
}

#[test]
fn ifflag_with_in_zilch_is_left_for_the_expander() {
    let (out, _) = run("<IFFLAG (IN-ZILCH <A>) (T <B>)>", 3);
    assert!(out.contains("IFFLAG"));
}

#[test]
fn version_clause_selection() {
    let source = "<VERSION? (ZIP <GLOBAL V 3>) (EZIP <GLOBAL V 4>) (ELSE <GLOBAL V 0>)>";
    let (out, _) = run(source, 3);
    assert!(out.contains("<GLOBAL V 3>"));
    let (out, _) = run(source, 4);
    assert!(out.contains("<GLOBAL V 4>"));
    let (out, _) = run(source, 8);
    assert!(out.contains("<GLOBAL V 0>"));
}

#[test]
fn setg_values_are_tracked() {
    let (out, ctx) = run("<SETG ZORK-NUMBER 2>", 3);
    // SETG stays in the source
    assert!(out.contains("SETG"));
    assert_eq!(ctx.setg_values.get("ZORK-NUMBER"), Some(&CtValue::Int(2)));
}

#[test]
fn compile_cond_selects_on_setg_values() {
    let (out, _) = run(
        "<SETG ZORK-NUMBER 1>\n%<COND (<==? ,ZORK-NUMBER 1> '<GLOBAL A 1>) (T '<GLOBAL A 2>)>",
        3,
    );
    assert!(out.contains("<GLOBAL A 1>"));
    assert!(!out.contains("<GLOBAL A 2>"));
}

#[test]
fn compile_cond_gassigned() {
    let (out, _) = run(
        "<SETG FOO 5>\n%<COND (<GASSIGNED? FOO> '<X>) (T '<Y>)>",
        3,
    );
    assert!(out.contains("<X>"));
}

#[test]
fn compile_arithmetic() {
    let (out, _) = run("<SETG BASE 10> <CONSTANT C %<+ ,BASE 5>>", 3);
    assert!(out.contains("<CONSTANT C 15>"));

    let (out, _) = run("<CONSTANT C %<* 3 %<+ 2 2>>>", 3);
    assert!(out.contains("<CONSTANT C 12>"));

    let (out, _) = run("<CONSTANT C %<BOR 8 1>>", 3);
    assert!(out.contains("<CONSTANT C 9>"));

    let (out, _) = run("<CONSTANT C %<LSH 1 4>>", 3);
    assert!(out.contains("<CONSTANT C 16>"));
}

#[test]
fn unevaluable_compile_form_becomes_zero() {
    let (out, _) = run("<CONSTANT C %<LENGTH ,SOMETABLE>>", 3);
    assert!(out.contains("<CONSTANT C 0>"));
}

#[test]
fn unrecognised_percent_forms_survive() {
    // %<" is an escape, not a compile-time form
    let (out, _) = run("%<\"", 3);
    assert!(out.contains("%<"));
}

#[test]
fn define_forms_are_elided() {
    let (out, _) = run("<DEFINE DOUBLE (X) <* .X 2>> <ROUTINE GO () <QUIT>>", 3);
    assert!(!out.contains("DEFINE"));
    assert!(out.contains("ROUTINE"));
}

#[test]
fn parseable_defmac_survives() {
    let (out, _) = run("<DEFMAC RT () '<RTRUE>> <ROUTINE GO () <RT>>", 3);
    assert!(out.contains("DEFMAC"));
}

#[test]
fn lax_brackets_removes_extra_and_closes_missing() {
    let mut ctx = CompileContext::new(3);
    ctx.lax_brackets = true;
    let out = {
        let mut pre = Preprocessor::new(&mut ctx);
        pre.preprocess("<FOO> > <BAR", Path::new(".")).unwrap()
    };
    // The stray > is gone and the unclosed form is terminated
    let opens = out.matches('<').count();
    let closes = out.matches('>').count();
    assert_eq!(opens, closes);
}

#[test]
fn include_expansion_resolves_and_recurses() {
    let dir = std::env::temp_dir().join(format!("zilch-inc-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("inner.zil"), "<GLOBAL INNER 1>").unwrap();
    std::fs::write(
        dir.join("outer.zil"),
        "<IFILE \"inner\"> <GLOBAL OUTER 2>",
    )
    .unwrap();

    let mut ctx = CompileContext::new(3);
    let out = {
        let mut pre = Preprocessor::new(&mut ctx);
        pre.preprocess("<INSERT-FILE \"outer\" T>", &dir).unwrap()
    };
    assert!(out.contains("<GLOBAL INNER 1>"));
    assert!(out.contains("<GLOBAL OUTER 2>"));

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn missing_include_reports_searched_paths() {
    let mut ctx = CompileContext::new(3);
    let err = {
        let mut pre = Preprocessor::new(&mut ctx);
        pre.preprocess("<IFILE \"no-such-file\">", Path::new("."))
            .unwrap_err()
    };
    let message = err.to_string();
    assert!(message.contains("no-such-file"));
    assert!(message.contains("searched"));
}

#[test]
fn passes_are_idempotent() {
    let source = "<COMPILATION-FLAG DEBUG <T>> <IFFLAG (DEBUG <A>) (ELSE <B>)> <CONSTANT C %<+ 1 2>>";
    let (once, _) = run(source, 3);
    let (twice, _) = run(&once, 3);
    assert_eq!(once, twice);
}
