// Assembler tests

use super::*;
use crate::codegen::CodeGen;
use crate::lexer::tokenize;
use crate::parser::Parser;
use crate::relocation::read_word;
use crate::ZVersion;

fn assemble(source: &str, version: ZVersion) -> Vec<u8> {
    let tokens = tokenize(source, "<test>").unwrap();
    let program = Parser::new(tokens, "<test>").parse().unwrap();
    let output = CodeGen::new(version, false).generate(&program).unwrap();
    Assembler::new(version).build_story_file(output).unwrap()
}

fn checksum(story: &[u8]) -> u16 {
    story[0x40..]
        .iter()
        .fold(0u16, |acc, &b| acc.wrapping_add(b as u16))
}

#[test]
fn minimal_story_header_fields() {
    let story = assemble("<ROUTINE GO () <QUIT>>", ZVersion::V3);

    assert_eq!(story[0], 3);
    let high_mem = read_word(&story, 0x04) as usize;
    let initial_pc = read_word(&story, 0x06) as usize;
    let dict = read_word(&story, 0x08) as usize;
    let objects = read_word(&story, 0x0A) as usize;
    let globals = read_word(&story, 0x0C) as usize;
    let static_base = read_word(&story, 0x0E) as usize;

    assert_eq!(globals, 0x40);
    assert!(objects > globals);
    assert!(dict >= static_base);
    assert!(high_mem >= static_base);
    assert!(initial_pc > high_mem, "PC inside high memory");

    // The first instruction of GO is quit
    assert_eq!(story[initial_pc], 0xBA);
}

#[test]
fn checksum_and_length_match_header() {
    let story = assemble(
        r#"<GLOBAL SCORE 0>
           <ROUTINE GO () <PRINTI "Hello"> <CRLF> <QUIT>>"#,
        ZVersion::V3,
    );

    assert_eq!(read_word(&story, 0x1C), checksum(&story));
    assert_eq!(story.len() % 2, 0);
    assert_eq!(read_word(&story, 0x1A) as usize, story.len() / 2);
}

#[test]
fn v5_length_uses_divisor_four() {
    let story = assemble("<ROUTINE GO () <QUIT>>", ZVersion::V5);
    assert_eq!(story[0], 5);
    assert_eq!(story.len() % 4, 0);
    assert_eq!(read_word(&story, 0x1A) as usize, story.len() / 4);
    // V5 writes a header extension address
    assert_ne!(read_word(&story, 0x36), 0);
}

#[test]
fn v8_alignment_and_divisor() {
    let story = assemble("<ROUTINE GO () <QUIT>>", ZVersion::V8);
    let high_mem = read_word(&story, 0x04) as usize;
    assert_eq!(high_mem % 8, 0);
    assert_eq!(story.len() % 8, 0);
}

#[test]
fn serial_number_is_six_digits() {
    let story = assemble("<ROUTINE GO () <QUIT>>", ZVersion::V3);
    for &b in &story[0x12..0x18] {
        assert!(b.is_ascii_digit());
    }
}

#[test]
fn routine_call_packed_address_reaches_callee() {
    let story = assemble(
        "<ROUTINE GO () <HELPER> <QUIT>>
         <ROUTINE HELPER () <RTRUE>>",
    ZVersion::V3,
    );

    // GO starts at high memory; its body is: call_vs (0xE0), type byte,
    // packed operand, store byte.
    let high_mem = read_word(&story, 0x04) as usize;
    assert_eq!(story[high_mem], 0); // GO has no locals
    assert_eq!(story[high_mem + 1], 0xE0);
    let packed = read_word(&story, high_mem + 3) as usize;
    let callee = packed * 2;
    // Property 3: the callee's first byte is its local count
    assert_eq!(story[callee] & 0x0F, 0);
    assert_eq!(story[callee + 1], 0xB0); // rtrue body
}

#[test]
fn dictionary_lands_in_static_memory() {
    let story = assemble(
        r#"<OBJECT APPLE (SYNONYM APPLE) (DESC "an apple")>
           <ROUTINE GO () <QUIT>>"#,
        ZVersion::V3,
    );
    let dict = read_word(&story, 0x08) as usize;
    let static_base = read_word(&story, 0x0E) as usize;
    assert_eq!(dict, static_base);
    // Separator count, then entry length 7 for V3
    let sep_count = story[dict] as usize;
    assert_eq!(sep_count, 12);
    assert_eq!(story[dict + 1 + sep_count], 7);
}

#[test]
fn synonym_property_resolves_to_dictionary_entry() {
    let story = assemble(
        r#"<OBJECT APPLE (SYNONYM APPLE) (DESC "an apple")>
           <ROUTINE GO () <QUIT>>"#,
        ZVersion::V3,
    );

    let objects_addr = read_word(&story, 0x0A) as usize;
    let dict = read_word(&story, 0x08) as usize;

    // First object's property table
    let prop_ptr_at = objects_addr + 31 * 2 + 9 - 2;
    let prop_table = read_word(&story, prop_ptr_at) as usize;
    let name_len = story[prop_table] as usize;
    let mut at = prop_table + 1 + name_len * 2;

    // Walk properties looking for the synonym word address
    let mut found = false;
    while story[at] != 0 {
        let size_byte = story[at];
        let len = (size_byte >> 5) as usize + 1;
        let value = read_word(&story, at + 1) as usize;
        if value >= dict && len == 2 {
            // Points into the dictionary at an entry boundary
            let sep_count = story[dict] as usize;
            let header = 1 + sep_count + 1 + 2;
            assert_eq!((value - dict - header) % 7, 0);
            found = true;
        }
        at += 1 + len;
    }
    assert!(found, "no synonym word address in property table");
}

#[test]
fn table_base_patched_into_globals() {
    let story = assemble(
        "<GLOBAL TBL <TABLE 11 22>>
         <ROUTINE GO () <QUIT>>",
        ZVersion::V3,
    );
    let globals = read_word(&story, 0x0C) as usize;
    let table_addr = read_word(&story, globals) as usize;
    assert!(table_addr > globals);
    assert_eq!(read_word(&story, table_addr), 11);
    assert_eq!(read_word(&story, table_addr + 2), 22);
}

#[test]
fn story_too_large_suggests_higher_version() {
    // A table big enough to blow the V3 128KB cap
    let mut source = String::from("<GLOBAL BIG <ITABLE 40000>> <GLOBAL BIG2 <ITABLE 40000>> <ROUTINE GO () <QUIT>>");
    source.push('\n');
    let tokens = tokenize(&source, "<test>").unwrap();
    let program = Parser::new(tokens, "<test>").parse().unwrap();
    let output = CodeGen::new(ZVersion::V3, false).generate(&program).unwrap();
    let err = Assembler::new(ZVersion::V3)
        .build_story_file(output)
        .unwrap_err();
    assert!(matches!(err, CompilerError::StoryTooLarge(3, _, _)));
}

#[test]
fn legacy_marker_scan_reports_shrinkage() {
    // 0x8D FF FE <len16 little-endian> <text>
    let mut code = vec![0x00, 0xB4];
    code.extend_from_slice(&[0x8D, 0xFF, 0xFE, 0x02, 0x00]);
    code.extend_from_slice(b"hi");
    code.push(0xB0);
    assert_eq!(super::legacy_marker_delta(&code), 4);
}
