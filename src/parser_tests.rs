// Parser tests

use super::*;
use crate::ast::*;
use crate::lexer::tokenize;

fn parse(source: &str) -> Program {
    let tokens = tokenize(source, "<test>").unwrap();
    Parser::new(tokens, "<test>").parse().unwrap()
}

#[test]
fn parses_routine_with_params_opt_and_aux() {
    let program = parse(r#"<ROUTINE FOO (A B "OPT" C "AUX" D (E 5)) <RTRUE>>"#);
    assert_eq!(program.routines.len(), 1);
    let routine = &program.routines[0];
    assert_eq!(routine.name, "FOO");
    assert_eq!(routine.required_params, vec!["A", "B"]);
    assert_eq!(routine.opt_params, vec!["C"]);
    assert_eq!(routine.aux_vars, vec!["D", "E"]);
    assert_eq!(
        routine.local_defaults.get("E"),
        Some(&ZilNode::Number(5))
    );
    assert_eq!(routine.body.len(), 1);
}

#[test]
fn parses_routine_activation() {
    let program = parse("<ROUTINE GO ACT () <RTRUE>>");
    assert_eq!(program.routines[0].activation.as_deref(), Some("ACT"));
}

#[test]
fn parses_object_properties() {
    let program = parse(
        r#"<OBJECT APPLE
            (IN KITCHEN)
            (SYNONYM APPLE FRUIT)
            (DESC "an apple")
            (FLAGS TAKEBIT EDIBLEBIT)>"#,
    );
    assert_eq!(program.objects.len(), 1);
    let object = &program.objects[0];
    assert_eq!(object.name, "APPLE");
    assert_eq!(object.properties.len(), 4);
    let desc = object.property("DESC").unwrap();
    assert_eq!(desc.values, vec![ZilNode::Str("an apple".to_string())]);
    let synonyms = object.property("SYNONYM").unwrap();
    assert_eq!(synonyms.values.len(), 2);
}

#[test]
fn rooms_are_kept_separate_from_objects() {
    let program = parse(r#"<ROOM KITCHEN (DESC "Kitchen")> <OBJECT APPLE (DESC "apple")>"#);
    assert_eq!(program.rooms.len(), 1);
    assert_eq!(program.objects.len(), 1);
}

#[test]
fn parses_global_and_constant() {
    let program = parse("<GLOBAL SCORE 0> <CONSTANT MAX-SCORE 350>");
    assert_eq!(program.globals.len(), 1);
    assert_eq!(program.globals[0].name, "SCORE");
    assert_eq!(program.globals[0].value, Some(ZilNode::Number(0)));
    assert_eq!(program.constants[0].name, "MAX-SCORE");
}

#[test]
fn parses_version_atoms() {
    assert_eq!(parse("<VERSION ZIP>").version, 3);
    assert_eq!(parse("<VERSION EZIP>").version, 4);
    assert_eq!(parse("<VERSION XZIP>").version, 5);
    assert_eq!(parse("<VERSION 8>").version, 8);
    assert!(parse("<VERSION 5>").version_explicit);
}

#[test]
fn parses_cond_clauses() {
    let program = parse(
        "<ROUTINE F () <COND (<EQUAL? ,X 1> <RTRUE>) (T <RFALSE>)>>",
    );
    let body = &program.routines[0].body;
    let ZilNode::Cond(cond) = &body[0] else {
        panic!("expected COND node, got {:?}", body[0]);
    };
    assert_eq!(cond.clauses.len(), 2);
    assert_eq!(cond.clauses[1].test.atom_name(), Some("T"));
}

#[test]
fn parses_repeat_with_bindings() {
    let program = parse("<ROUTINE F () <REPEAT ((I 0)) <SET I <+ .I 1>>>>");
    let ZilNode::Repeat(repeat) = &program.routines[0].body[0] else {
        panic!("expected REPEAT node");
    };
    assert_eq!(repeat.bindings.len(), 1);
    assert_eq!(repeat.bindings[0].0, "I");
    assert_eq!(repeat.body.len(), 1);
    assert!(repeat.exit_cond.is_none());
}

#[test]
fn sole_trailing_clause_is_repeat_body_not_exit() {
    // <REPEAT () (<FOO>)> has no statements after the parenthesised
    // clause, so it is body
    let program = parse("<ROUTINE F () <REPEAT () <BAR>>>");
    let ZilNode::Repeat(repeat) = &program.routines[0].body[0] else {
        panic!("expected REPEAT node");
    };
    assert!(repeat.exit_cond.is_none());
    assert_eq!(repeat.body.len(), 1);
}

#[test]
fn parses_syntax_with_synonyms_and_flags() {
    let program = parse("<SYNTAX TOSS (CHUCK) OBJECT (HAVE) AT OBJECT = V-TOSS PRE-TOSS>");
    let syntax = &program.syntax[0];
    assert_eq!(syntax.pattern, vec!["TOSS", "OBJECT", "AT", "OBJECT"]);
    assert_eq!(syntax.verb_synonyms, vec!["CHUCK"]);
    assert_eq!(syntax.action_routine, "V-TOSS");
    assert_eq!(syntax.preaction.as_deref(), Some("PRE-TOSS"));
    assert_eq!(syntax.object_flags.len(), 2);
    assert_eq!(syntax.object_flags[0], vec!["HAVE"]);
    assert!(syntax.object_flags[1].is_empty());
}

#[test]
fn parses_tables() {
    let program = parse("<GLOBAL T1 <TABLE 1 2 3>> <GLOBAL T2 <LTABLE (PURE) 7>>");
    let Some(ZilNode::Table(table)) = &program.globals[0].value else {
        panic!("expected table value");
    };
    assert_eq!(table.kind, TableKind::Table);
    assert_eq!(table.values.len(), 3);
    let Some(ZilNode::Table(ltable)) = &program.globals[1].value else {
        panic!("expected table value");
    };
    assert_eq!(ltable.kind, TableKind::LTable);
    assert_eq!(ltable.flags, vec!["PURE"]);
}

#[test]
fn parses_itable_with_size_and_pattern() {
    let program = parse("<GLOBAL T <ITABLE 4 (BYTE PATTERN (BYTE [REST WORD])) 0>>");
    let Some(ZilNode::Table(table)) = &program.globals[0].value else {
        panic!("expected table value");
    };
    assert_eq!(table.kind, TableKind::ITable);
    assert_eq!(table.size.as_deref(), Some(&ZilNode::Number(4)));
    assert!(table.flags.contains(&"BYTE".to_string()));
    assert_eq!(table.pattern, vec![("BYTE".to_string(), false), ("WORD".to_string(), true)]);
}

#[test]
fn parses_defmac_with_decorated_params() {
    let program = parse(r#"<DEFMAC DOUBLE ('X "OPT" Y "AUX" Z) <FORM + .X .X>>"#);
    let mac = &program.macros[0];
    assert_eq!(mac.name, "DOUBLE");
    assert_eq!(mac.params.len(), 3);
    assert!(mac.params[0].quoted);
    assert!(!mac.params[0].optional);
    assert!(mac.params[1].optional);
    assert!(mac.params[2].aux);
}

#[test]
fn parses_defmac_tuple_param() {
    let program = parse(r#"<DEFMAC LIST-ALL ("ARGS" A) <FORM LIST !.A>>"#);
    assert!(program.macros[0].params[0].tuple);
}

#[test]
fn parses_directives() {
    let program = parse(
        "<DIRECTIONS NORTH SOUTH EAST WEST>
         <BUZZ AN THE A>
         <SYNONYM NORTH N>
         <BIT-SYNONYM TAKEBIT GRABBIT>
         <PREP-SYNONYM TO TOWARD TOWARDS>
         <ORDER-OBJECTS? ROOMS-FIRST>
         <ORDER-TREE? DEFINED>
         <LONG-WORDS?>",
    );
    assert_eq!(program.directions, vec!["NORTH", "SOUTH", "EAST", "WEST"]);
    assert_eq!(program.buzz_words, vec!["AN", "THE", "A"]);
    assert_eq!(program.synonym_groups, vec![vec!["NORTH", "N"]]);
    assert_eq!(
        program.bit_synonyms,
        vec![("TAKEBIT".to_string(), "GRABBIT".to_string())]
    );
    assert_eq!(program.prep_synonyms[0].0, "TO");
    assert_eq!(program.prep_synonyms[0].1, vec!["TOWARD", "TOWARDS"]);
    assert_eq!(program.order_objects, OrderObjects::RoomsFirst);
    assert_eq!(program.order_tree, OrderTree::Defined);
    assert!(program.long_words);
}

#[test]
fn parses_tell_tokens() {
    let program = parse("<TELL-TOKENS DBL * <PRINT-DBL .X> D ,PRSO <DPRINT-PRSO>>");
    assert_eq!(program.tell_tokens.len(), 2);
    assert_eq!(program.tell_tokens[0].name, "DBL");
    assert_eq!(program.tell_tokens[0].arg_count, 1);
    assert!(program.tell_tokens[0].pattern.is_none());
    assert_eq!(program.tell_tokens[1].name, "D");
    assert_eq!(
        program.tell_tokens[1].pattern,
        Some(ZilNode::GlobalVar("PRSO".to_string()))
    );
}

#[test]
fn parses_define_globals() {
    let program = parse("<DEFINE-GLOBALS SOFT-GLOBALS (FOO 3) (BAR BYTE 250) (BAZ:FIX 7)>");
    let define = &program.define_globals[0];
    assert_eq!(define.table_name, "SOFT-GLOBALS");
    assert_eq!(define.entries.len(), 3);
    assert!(!define.entries[0].is_byte);
    assert!(define.entries[1].is_byte);
    assert_eq!(define.entries[2].adecl.as_deref(), Some("FIX"));
}

#[test]
fn parses_propdef_with_patterns() {
    let program = parse("<PROPDEF SIZE 5> <PROPDEF EXIT <> (EXIT TO R:ROOM = 1 <BYTE .R>)>");
    assert_eq!(program.propdefs.len(), 2);
    assert_eq!(program.propdefs[0].default, Some(ZilNode::Number(5)));
    assert_eq!(program.propdefs[1].patterns.len(), 1);
}

#[test]
fn parses_quasiquote_forms() {
    let program = parse("<DEFMAC M (X) `<FORM PRINTN ~.X>>");
    let body = &program.macros[0].body[0];
    assert!(matches!(body, ZilNode::Quasiquote(_)));
}

#[test]
fn collects_compile_time_ops() {
    let program = parse("<GLOBAL T <TABLE 0 0>> <ZPUT ,T 0 5> <PUTB ,T 3 1>");
    assert_eq!(program.compile_time_ops.len(), 2);
}

#[test]
fn generic_top_level_forms_are_tolerated() {
    let program = parse("<SNAME FLOYD> <GDECL (X) FIX> <ROUTINE GO () <QUIT>>");
    assert_eq!(program.routines.len(), 1);
}
