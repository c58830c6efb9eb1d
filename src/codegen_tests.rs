// Code generator tests

use super::*;
use crate::lexer::tokenize;
use crate::parser::Parser;

fn generate(source: &str) -> CodeGenOutput {
    generate_v(source, ZVersion::V3)
}

fn generate_v(source: &str, version: ZVersion) -> CodeGenOutput {
    let tokens = tokenize(source, "<test>").unwrap();
    let program = Parser::new(tokens, "<test>").parse().unwrap();
    CodeGen::new(version, false).generate(&program).unwrap()
}

fn routine_body<'a>(output: &'a CodeGenOutput, name: &str) -> &'a [u8] {
    let offset = output.routine_offsets[name];
    &output.routines_code[offset..]
}

#[test]
fn empty_quit_routine() {
    let output = generate("<ROUTINE GO () <QUIT>>");
    let code = routine_body(&output, "GO");
    // local count 0, quit, implicit rtrue
    assert_eq!(&code[..3], &[0x00, 0xBA, 0xB0]);
}

#[test]
fn go_routine_is_laid_out_first() {
    let output = generate(
        "<ROUTINE HELPER () <RTRUE>>
         <ROUTINE GO () <QUIT>>",
    );
    assert_eq!(output.routine_offsets["GO"], 0);
    assert!(output.routine_offsets["HELPER"] > 0);
}

#[test]
fn v3_header_carries_local_defaults() {
    let output = generate("<ROUTINE GO (\"AUX\" (X 7) Y) <QUIT>>");
    let code = routine_body(&output, "GO");
    assert_eq!(code[0], 2); // two locals
    assert_eq!(&code[1..3], &[0x00, 0x07]); // X defaults to 7
    assert_eq!(&code[3..5], &[0x00, 0x00]); // Y defaults to 0
    assert_eq!(code[5], 0xBA); // quit
}

#[test]
fn v5_has_no_header_defaults() {
    let output = generate_v("<ROUTINE GO (\"AUX\" (X 7)) <QUIT>>", ZVersion::V5);
    let code = routine_body(&output, "GO");
    assert_eq!(code[0], 1);
    // store local 1 <- 7, then quit
    assert_eq!(&code[1..4], &[0x0D, 0x01, 0x07]);
    assert_eq!(code[4], 0xBA);
}

#[test]
fn too_many_locals_is_fatal() {
    let source = "<ROUTINE GO (A B C D E F G H I J K L M N O P) <QUIT>>";
    let tokens = tokenize(source, "<test>").unwrap();
    let program = Parser::new(tokens, "<test>").parse().unwrap();
    let err = CodeGen::new(ZVersion::V3, false)
        .generate(&program)
        .unwrap_err();
    assert!(matches!(err, CompilerError::TooManyLocals(_, _)));
}

#[test]
fn printi_emits_inline_text() {
    let output = generate(r#"<ROUTINE GO () <PRINTI "Hi"> <QUIT>>"#);
    let code = routine_body(&output, "GO");
    assert_eq!(code[1], 0xB2); // print
    // "Hi": shift(4) H(13) i(14) -> one word with stop bit
    let word = ((code[2] as u16) << 8) | code[3] as u16;
    assert_eq!(word, 0x8000 | (4 << 10) | (13 << 5) | 14);
    assert_eq!(code[4], 0xBA);
}

#[test]
fn crlf_and_printn() {
    let output = generate("<GLOBAL X 0> <ROUTINE GO () <CRLF> <PRINTN ,X> <QUIT>>");
    let code = routine_body(&output, "GO");
    assert_eq!(code[1], 0xBB); // new_line
    assert_eq!(code[2], 0xE6); // print_num VAR form
    assert_eq!(code[3], 0xBF); // type: variable, rest omitted
    assert_eq!(code[4], 16); // global X is variable 16
}

#[test]
fn arithmetic_stores_to_stack() {
    let output = generate("<ROUTINE GO (\"AUX\" X) <SET X <+ 1 2>> <QUIT>>");
    let code = routine_body(&output, "GO");
    // header (1 local + default), add 1 2 -> stack, store X <- stack
    let body = &code[3..];
    assert_eq!(&body[..4], &[0x14, 0x01, 0x02, 0x00]);
    // store: long form 2OP 0x0D, small const var#, variable operand (stack)
    assert_eq!(&body[4..7], &[0x2D, 0x01, 0x00]);
}

#[test]
fn routine_call_gets_relocation() {
    let output = generate(
        "<ROUTINE GO () <HELPER 1> <QUIT>>
         <ROUTINE HELPER (N) <RTRUE>>",
    );
    let call_relocs: Vec<_> = output
        .code_relocations
        .iter()
        .filter(|r| {
            matches!(&r.kind, crate::relocation::RelocationKind::RoutineCall { routine } if routine == "HELPER")
        })
        .collect();
    assert_eq!(call_relocs.len(), 1);

    let code = routine_body(&output, "GO");
    // call_vs HELPER 1 -> store stack, then pop (value unused)
    assert_eq!(code[1], 0xE0);
    let reloc_at = call_relocs[0].offset;
    assert_eq!(
        &output.routines_code[reloc_at..reloc_at + 2],
        &[0xFF, 0xFF]
    );
}

#[test]
fn call_with_too_many_args_for_v3_is_fatal() {
    let source = "<ROUTINE GO () <HELPER 1 2 3 4> <QUIT>> <ROUTINE HELPER (A B C D) <RTRUE>>";
    let tokens = tokenize(source, "<test>").unwrap();
    let program = Parser::new(tokens, "<test>").parse().unwrap();
    assert!(CodeGen::new(ZVersion::V3, false).generate(&program).is_err());
}

#[test]
fn undefined_symbol_is_fatal_with_location() {
    let source = "<ROUTINE GO () <PRINTN ,NO-SUCH-GLOBAL> <QUIT>>";
    let tokens = tokenize(source, "<test>").unwrap();
    let program = Parser::new(tokens, "<test>").parse().unwrap();
    let err = CodeGen::new(ZVersion::V3, false)
        .generate(&program)
        .unwrap_err();
    assert!(matches!(err, CompilerError::UndefinedSymbol(_, _)));
}

#[test]
fn cond_compiles_to_branch_chain() {
    let output = generate(
        "<GLOBAL FLAG 0>
         <ROUTINE GO () <REPEAT () <COND (<EQUAL? ,FLAG 1> <RETURN>)>> <QUIT>>",
    );
    let code = routine_body(&output, "GO");
    let body = &code[1..];
    // je ,FLAG 1 (long form: variable + small constant)
    assert_eq!(&body[..3], &[0x41, 16, 0x01]);
    // branch on false (polarity 0) over the rtrue
    assert_eq!(body[3] & 0x80, 0);
    // true branch is an unconditional return
    assert_eq!(body[5], 0xB0);
    // loop closes with a backward jump (the last jump in the body)
    let jump_at = body.iter().rposition(|&b| b == 0x8C).unwrap();
    let offset =
        (((body[jump_at + 1] as u16) << 8) | body[jump_at + 2] as u16) as i16;
    assert!(offset < 0, "loop jump must go backward, got {}", offset);
}

#[test]
fn repeat_with_exit_condition() {
    let output = generate(
        "<GLOBAL N 0>
         <ROUTINE GO () <REPEAT () (<G? ,N 5>) <SETG N <+ ,N 1>>> <QUIT>>",
    );
    let code = routine_body(&output, "GO");
    // exit test: jg ,N 5 branching forward on true
    let body = &code[1..];
    assert_eq!(&body[..3], &[0x43, 16, 0x05]);
    assert_ne!(body[3] & 0x80, 0);
}

#[test]
fn object_symbols_resolve_to_numbers() {
    let output = generate(
        r#"<OBJECT APPLE (DESC "an apple")>
           <ROUTINE GO () <REMOVE APPLE> <QUIT>>"#,
    );
    let code = routine_body(&output, "GO");
    // remove_obj with small constant 1
    assert_eq!(&code[1..3], &[0x99, 0x01]);
}

#[test]
fn globals_block_has_240_cells_and_inits() {
    let output = generate("<GLOBAL SCORE 35> <ROUTINE GO () <QUIT>>");
    assert_eq!(output.globals_data.len(), 480);
    assert_eq!(&output.globals_data[..2], &[0x00, 35]);
}

#[test]
fn table_global_gets_base_placeholder() {
    let output = generate("<GLOBAL TBL <TABLE 10 20>> <ROUTINE GO () <QUIT>>");
    assert_eq!(output.globals_data[0], 0xFF);
    assert_eq!(
        output.global_relocations.len(),
        1,
        "table base relocation expected"
    );
    // The table payload itself: two words
    assert_eq!(output.table_data.len(), 4);
    assert_eq!(&output.table_data[..4], &[0, 10, 0, 20]);
}

#[test]
fn ltable_has_length_prefix() {
    let output = generate("<GLOBAL TBL <LTABLE 7 8>> <ROUTINE GO () <QUIT>>");
    assert_eq!(&output.table_data[..6], &[0, 2, 0, 7, 0, 8]);
}

#[test]
fn byte_itable_repeats_zero() {
    let output = generate("<GLOBAL TBL <ITABLE 3 (BYTE)>> <ROUTINE GO () <QUIT>>");
    assert_eq!(output.table_data, vec![0, 0, 0]);
}

#[test]
fn directions_claim_top_properties() {
    let output = generate(
        r#"<DIRECTIONS NORTH SOUTH EAST WEST>
           <ROOM FOREST (DESC "Forest") (NORTH TO CLEARING)>
           <ROOM CLEARING (DESC "Clearing")>
           <ROUTINE GO () <QUIT>>"#,
    );
    // NORTH is property 31 in V3; dictionary carries the direction word
    assert!(output.dictionary.contains("north"));
    let objects = &output.objects_data;
    // The NORTH exit property of FOREST holds CLEARING's object number
    let prop_addr = 31 * 2 + 2 * 9;
    let name_len = objects[prop_addr] as usize;
    let size_at = prop_addr + 1 + name_len * 2;
    assert_eq!(objects[size_at] & 0x1F, 31);
    assert_eq!(objects[size_at + 1], 2);
}

#[test]
fn synonym_properties_point_at_dictionary() {
    let output = generate(
        r#"<OBJECT APPLE (SYNONYM APPLE FRUIT) (DESC "an apple")>
           <ROUTINE GO () <QUIT>>"#,
    );
    assert!(output.dictionary.contains("apple"));
    assert!(output.dictionary.contains("fruit"));
    let synonym_relocs = output
        .object_relocations
        .iter()
        .filter(|r| {
            matches!(
                &r.kind,
                crate::relocation::RelocationKind::PropertySynonym { .. }
            )
        })
        .count();
    assert_eq!(synonym_relocs, 2);
}

#[test]
fn syntax_builds_verbs_actions_and_preactions() {
    let output = generate(
        "<SYNTAX TAKE OBJECT = V-TAKE>
         <SYNTAX DROP OBJECT = V-DROP PRE-DROP>
         <ROUTINE V-TAKE () <RTRUE>>
         <ROUTINE V-DROP () <RTRUE>>
         <ROUTINE PRE-DROP () <RTRUE>>
         <ROUTINE GO () <QUIT>>",
    );
    assert!(output.dictionary.contains("take"));
    assert!(output.dictionary.contains("drop"));
    // ACTIONS table: length word + 2 action slots; PREACTIONS mirrors it
    let action_relocs = output
        .table_relocations
        .iter()
        .filter(|r| {
            matches!(&r.kind, crate::relocation::RelocationKind::RoutineCall { .. })
        })
        .count();
    assert_eq!(action_relocs, 3); // V-TAKE, V-DROP, PRE-DROP
}

#[test]
fn tell_lowers_to_print_primitives() {
    let output = generate(
        r#"<GLOBAL SCORE 0>
           <OBJECT LAMP (DESC "lamp")>
           <ROUTINE GO () <TELL "You have " N ,SCORE " points" CR> <QUIT>>"#,
    );
    let code = routine_body(&output, "GO");
    // print ... print_num ... print ... new_line in order
    assert_eq!(code[1], 0xB2);
    assert!(code.contains(&0xE6));
    assert!(code.contains(&0xBB));
}

#[test]
fn define_globals_creates_offsets_and_table() {
    let output = generate(
        "<DEFINE-GLOBALS SOFT (ALPHA 5) (BETA BYTE 9)>
         <ROUTINE GO () <QUIT>>",
    );
    // word cell then byte cell
    assert_eq!(output.table_data, vec![0, 5, 9]);
}

#[test]
fn string_property_becomes_packed_reference() {
    let output = generate(
        r#"<OBJECT ROCK (DESC "rock") (LDESC "A rock sits here.")>
           <ROUTINE GO () <QUIT>>"#,
    );
    assert!(output
        .strings
        .iter()
        .any(|s| s == "A rock sits here."));
    assert!(output.object_relocations.iter().any(|r| {
        matches!(&r.kind, crate::relocation::RelocationKind::StringOperand { text } if text == "A rock sits here.")
    }));
}
