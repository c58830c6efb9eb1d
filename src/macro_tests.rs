// Macro expander tests

use super::*;
use crate::ast::*;
use crate::lexer::tokenize;
use crate::parser::Parser;

fn parse(source: &str) -> Program {
    let tokens = tokenize(source, "<test>").unwrap();
    Parser::new(tokens, "<test>").parse().unwrap()
}

fn expand(source: &str) -> Program {
    let mut program = parse(source);
    let mut expander = MacroExpander::new();
    expander.expand_program(&mut program).unwrap();
    program
}

#[test]
fn expands_simple_quoted_form_macro() {
    let program = expand(
        "<DEFMAC RT () '<RTRUE>>
         <ROUTINE GO () <RT>>",
    );
    let body = &program.routines[0].body;
    assert_eq!(body.len(), 1);
    assert!(body[0].is_form_named("RTRUE"));
}

#[test]
fn substitutes_parameters() {
    let program = expand(
        "<DEFMAC INC-BY ('VAR 'AMT) <FORM SET .VAR <FORM + <FORM LVAL .VAR> .AMT>>>
         <ROUTINE GO (X) <INC-BY X 2>>",
    );
    let body = &program.routines[0].body;
    let ZilNode::Form(form) = &body[0] else {
        panic!("expected SET form, got {:?}", body[0]);
    };
    assert_eq!(form.operator.atom_name(), Some("SET"));
    assert_eq!(form.operands[0].atom_name(), Some("X"));
}

#[test]
fn quasiquote_template_macro() {
    let program = expand(
        "<DEFMAC DOUBLE ('X) `<+ ~.X ~.X>>
         <ROUTINE GO () <DOUBLE 4>>",
    );
    let body = &program.routines[0].body;
    let ZilNode::Form(form) = &body[0] else {
        panic!("expected + form");
    };
    assert_eq!(form.operator.atom_name(), Some("+"));
    assert_eq!(form.operands, vec![ZilNode::Number(4), ZilNode::Number(4)]);
}

#[test]
fn tuple_parameter_collects_rest() {
    let program = expand(
        r#"<DEFMAC ALL ("ARGS" A) <FORM PROG '() !.A>>
           <ROUTINE GO () <ALL <RTRUE> <RFALSE>>>"#,
    );
    let ZilNode::Form(form) = &program.routines[0].body[0] else {
        panic!("expected PROG form");
    };
    assert_eq!(form.operator.atom_name(), Some("PROG"));
    // the quoted empty list plus the two spliced forms
    assert_eq!(form.operands.len(), 3);
}

#[test]
fn missing_required_argument_is_fatal() {
    let mut program = parse(
        "<DEFMAC TWO (A B) <FORM + .A .B>>
         <ROUTINE GO () <TWO 1>>",
    );
    let mut expander = MacroExpander::new();
    let err = expander.expand_program(&mut program).unwrap_err();
    assert!(matches!(
        err,
        crate::error::CompilerError::MacroArityMismatch(name, 2, 1) if name == "TWO"
    ));
}

#[test]
fn optional_parameter_binds_unassigned_when_missing() {
    let program = expand(
        r#"<DEFMAC MAYBE (A "OPT" B)
             <COND (<ASSIGNED? B> <FORM + .A .B>) (T <FORM + .A 0>)>>
           <ROUTINE GO () <MAYBE 1> <MAYBE 1 2>>"#,
    );
    let body = &program.routines[0].body;
    let ZilNode::Form(first) = &body[0] else {
        panic!("expected + form");
    };
    assert_eq!(first.operands[1], ZilNode::Number(0));
    let ZilNode::Form(second) = &body[1] else {
        panic!("expected + form");
    };
    assert_eq!(second.operands[1], ZilNode::Number(2));
}

#[test]
fn chtype_splice_inlines_items() {
    let program = expand(
        "<DEFMAC PAIR () <CHTYPE '(<RTRUE> <RFALSE>) SPLICE>>
         <ROUTINE GO () <PAIR>>",
    );
    let body = &program.routines[0].body;
    assert_eq!(body.len(), 2);
    assert!(body[0].is_form_named("RTRUE"));
    assert!(body[1].is_form_named("RFALSE"));
}

#[test]
fn native_operations_are_never_expanded() {
    // A macro named PRINTN must not shadow the primitive
    let program = expand(
        "<DEFMAC PRINTN ('X) '<RTRUE>>
         <ROUTINE GO () <PRINTN 5>>",
    );
    let body = &program.routines[0].body;
    assert!(body[0].is_form_named("PRINTN"));
}

#[test]
fn recursive_expansion() {
    let program = expand(
        "<DEFMAC INNER () '<RTRUE>>
         <DEFMAC OUTER () '<INNER>>
         <ROUTINE GO () <OUTER>>",
    );
    assert!(program.routines[0].body[0].is_form_named("RTRUE"));
}

#[test]
fn eval_created_globals_merge_into_program() {
    let program = expand(
        "<DEFMAC MAKE-G () <EVAL <FORM GLOBAL GENERATED 9>> ',GENERATED>
         <ROUTINE GO () <MAKE-G>>",
    );
    assert!(program.globals.iter().any(|g| g.name == "GENERATED"));
    // The call site expanded to the global reference
    assert_eq!(
        program.routines[0].body[0],
        ZilNode::GlobalVar("GENERATED".to_string())
    );
}

#[test]
fn first_definition_wins_on_eval_collisions() {
    let program = expand(
        "<GLOBAL GENERATED 1>
         <DEFMAC MAKE-G () <EVAL <FORM GLOBAL GENERATED 9>> ',GENERATED>
         <ROUTINE GO () <MAKE-G>>",
    );
    let matching: Vec<_> = program
        .globals
        .iter()
        .filter(|g| g.name == "GENERATED")
        .collect();
    assert_eq!(matching.len(), 1);
    assert_eq!(matching[0].value, Some(ZilNode::Number(1)));
}

#[test]
fn if_in_zilch_selects_argument() {
    let program = expand("<ROUTINE GO () <IF-IN-ZILCH <RTRUE>> <IFN-IN-ZILCH <RFALSE>>>");
    let body = &program.routines[0].body;
    assert!(body[0].is_form_named("RTRUE"));
    // IFN-IN-ZILCH expands to false
    assert!(body[1].is_false());
}

#[test]
fn mapf_function_macro_builds_statements() {
    let program = expand(
        r#"<DEFMAC SAY-ALL ("ARGS" A)
             <FORM PROG '()
                   !<MAPF ,LIST <FUNCTION (S) <FORM PRINTN .S>> .A>>>
           <ROUTINE GO () <SAY-ALL 1 2 3>>"#,
    );
    let ZilNode::Form(form) = &program.routines[0].body[0] else {
        panic!("expected PROG form, got {:?}", program.routines[0].body[0]);
    };
    assert_eq!(form.operator.atom_name(), Some("PROG"));
    let printns = form
        .operands
        .iter()
        .filter(|o| o.is_form_named("PRINTN"))
        .count();
    assert_eq!(printns, 3);
}
