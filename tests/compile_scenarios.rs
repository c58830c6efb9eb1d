// End-to-end compilation scenarios: compile ZIL source strings and check
// structural properties of the emitted story files.

use zilch::relocation::read_word;
use zilch::text;
use zilch::Compiler;

fn compile(source: &str) -> Vec<u8> {
    Compiler::new(3)
        .compile_string(source, "<test>")
        .expect("compilation should succeed")
}

fn compile_v(source: &str, version: u8) -> Vec<u8> {
    Compiler::new(version)
        .compile_string(source, "<test>")
        .expect("compilation should succeed")
}

fn checksum(story: &[u8]) -> u16 {
    story[0x40..]
        .iter()
        .fold(0u16, |acc, &b| acc.wrapping_add(b as u16))
}

#[test_log::test]
fn empty_quit() {
    // A V3 file whose initial instruction is the QUIT 0OP immediately
    // after the one-byte routine header.
    let story = compile("<VERSION ZIP> <ROUTINE GO () <QUIT>>");
    assert_eq!(story[0], 3);
    let initial_pc = read_word(&story, 0x06) as usize;
    assert_eq!(story[initial_pc], 0xBA);
    let high_mem = read_word(&story, 0x04) as usize;
    assert_eq!(initial_pc, high_mem + 1);
}

#[test]
fn hello_print() {
    let story = compile(r#"<ROUTINE GO () <PRINTI "Hello"> <CRLF> <QUIT>>"#);

    let initial_pc = read_word(&story, 0x06) as usize;
    assert_eq!(story[initial_pc], 0xB2); // print

    // The inline text after the opcode decodes back to the literal
    let (decoded, consumed) = text::decode_bytes(&story[initial_pc + 1..], 3, &[]).unwrap();
    assert_eq!(decoded, "Hello");

    // Then a newline and a quit
    assert_eq!(story[initial_pc + 1 + consumed], 0xBB);
    assert_eq!(story[initial_pc + 2 + consumed], 0xBA);
}

#[test]
fn object_with_synonym() {
    let story = compile(
        r#"<OBJECT APPLE (SYNONYM APPLE FRUIT) (DESC "an apple")>
           <ROUTINE GO () <QUIT>>"#,
    );

    // Two dictionary entries
    let dict = read_word(&story, 0x08) as usize;
    let sep_count = story[dict] as usize;
    let entry_len = story[dict + 1 + sep_count] as usize;
    let word_count = read_word(&story, dict + 2 + sep_count) as usize;
    assert_eq!(word_count, 2);

    // Both entries mark nouns resolving to object 1
    let entries = dict + 4 + sep_count;
    for i in 0..2 {
        let at = entries + i * entry_len;
        let type_byte = story[at + 4];
        assert_ne!(type_byte & 0x80, 0, "noun flag");
        assert_eq!(read_word(&story, at + 5), 1, "object number");
    }

    // Property 1 of object 1 decodes to the description
    let objects_addr = read_word(&story, 0x0A) as usize;
    let prop_ptr_at = objects_addr + 31 * 2 + 9 - 2;
    let prop_table = read_word(&story, prop_ptr_at) as usize;
    let name_len = story[prop_table] as usize;

    let mut at = prop_table + 1 + name_len * 2;
    let mut desc = None;
    while story[at] != 0 {
        let size_byte = story[at];
        let number = size_byte & 0x1F;
        let len = (size_byte >> 5) as usize + 1;
        if number == 1 {
            let (text, _) = text::decode_bytes(&story[at + 1..at + 1 + len], 3, &[]).unwrap();
            desc = Some(text);
        }
        at += 1 + len;
    }
    assert_eq!(desc.as_deref(), Some("an apple"));
}

#[test]
fn properties_descend_and_terminate() {
    let story = compile(
        r#"<PROPDEF SIZE 0>
           <PROPDEF VALUE 0>
           <OBJECT THING (DESC "thing") (SIZE 5) (VALUE 10)>
           <ROUTINE GO () <QUIT>>"#,
    );
    let objects_addr = read_word(&story, 0x0A) as usize;
    let prop_ptr_at = objects_addr + 31 * 2 + 9 - 2;
    let prop_table = read_word(&story, prop_ptr_at) as usize;
    let name_len = story[prop_table] as usize;

    let mut at = prop_table + 1 + name_len * 2;
    let mut numbers = Vec::new();
    while story[at] != 0 {
        let size_byte = story[at];
        numbers.push(size_byte & 0x1F);
        at += 1 + (size_byte >> 5) as usize + 1;
    }
    assert!(numbers.windows(2).all(|w| w[0] > w[1]), "{:?}", numbers);
    assert_eq!(story[at], 0);
}

#[test]
fn repeat_with_early_exit() {
    let story = compile(
        "<GLOBAL FLAG 0>
         <ROUTINE GO () <REPEAT () <COND (<EQUAL? ,FLAG 1> <RETURN>)>>>",
    );
    let initial_pc = read_word(&story, 0x06) as usize;
    // je ,FLAG 1 / branch / rtrue
    assert_eq!(story[initial_pc], 0x41);
    assert_eq!(story[initial_pc + 1], 16);
    assert_eq!(story[initial_pc + 2], 1);
    // branch-on-false over the return
    assert_eq!(story[initial_pc + 3] & 0x80, 0);
    assert_eq!(story[initial_pc + 5], 0xB0);
}

#[test]
fn abbreviations_compress_repeated_strings() {
    // "thing" appears often enough that the abbreviation reference is
    // used; the raw Z-character run for it appears at most once (in the
    // abbreviation table's own strings).
    let mut source = String::new();
    source.push_str("<ROUTINE GO () ");
    for _ in 0..10 {
        source.push_str(r#"<PRINTI "the thing"> "#);
    }
    for _ in 0..20 {
        source.push_str(r#"<PRINTI "thing"> "#);
    }
    source.push_str("<QUIT>>");
    let story = compile(&source);

    let abbrev_addr = read_word(&story, 0x18) as usize;
    assert_ne!(abbrev_addr, 0, "abbreviation table expected");

    // Raw encoding of "thing": t h i / n g pad, stop bit on word two
    let raw: Vec<u8> = {
        let w1 = ((6 + 19) as u16) << 10 | ((6 + 7) as u16) << 5 | (6 + 8) as u16;
        let w2 = 0x8000u16 | ((6 + 13) as u16) << 10 | ((6 + 6) as u16) << 5 | 5;
        vec![
            (w1 >> 8) as u8,
            (w1 & 0xFF) as u8,
            (w2 >> 8) as u8,
            (w2 & 0xFF) as u8,
        ]
    };
    let occurrences = story
        .windows(raw.len())
        .filter(|window| *window == raw.as_slice())
        .count();
    assert!(
        occurrences <= 1,
        "raw \"thing\" run appears {} times",
        occurrences
    );
}

#[test]
fn version_bump_changes_divisor() {
    let source = "<ROUTINE GO () <QUIT>>";
    let story = compile_v(source, 5);
    assert_eq!(story[0], 5);
    assert_eq!(read_word(&story, 0x1A) as usize, story.len() / 4);

    let story = compile_v(source, 8);
    assert_eq!(story[0], 8);
    assert_eq!(read_word(&story, 0x1A) as usize, story.len() / 8);
}

#[test]
fn checksum_property_holds_for_every_compile() {
    for source in [
        "<ROUTINE GO () <QUIT>>",
        r#"<GLOBAL SCORE 0>
           <OBJECT LAMP (SYNONYM LAMP LANTERN) (DESC "brass lantern") (FLAGS TAKEBIT)>
           <ROUTINE GO () <TELL "score: " N ,SCORE CR> <QUIT>>"#,
        r#"<DIRECTIONS NORTH SOUTH>
           <ROOM CAVE (DESC "Cave") (NORTH TO PIT)>
           <ROOM PIT (DESC "Pit") (SOUTH TO CAVE)>
           <ROUTINE GO () <QUIT>>"#,
    ] {
        let story = compile(source);
        assert_eq!(read_word(&story, 0x1C), checksum(&story));
        assert_eq!(read_word(&story, 0x1A) as usize, story.len() / 2);

        let high_mem = read_word(&story, 0x04) as usize;
        assert_eq!(high_mem % 2, 0);
        let initial_pc = read_word(&story, 0x06) as usize;
        assert!(initial_pc >= high_mem);
    }
}

#[test]
fn version_directive_overrides_cli() {
    let story = Compiler::new(3)
        .compile_string("<VERSION XZIP> <ROUTINE GO () <QUIT>>", "<test>")
        .unwrap();
    assert_eq!(story[0], 5);
}

/// Recover the abbreviation expansions from an assembled story so
/// encoded strings can be decoded the way an interpreter would.
fn read_abbreviations(story: &[u8]) -> Vec<String> {
    let table = read_word(story, 0x18) as usize;
    if table == 0 {
        return Vec::new();
    }
    (0..96)
        .map(|i| {
            let word_addr = read_word(story, table + i * 2) as usize;
            if word_addr == 0 {
                return String::new();
            }
            text::decode_bytes(&story[word_addr * 2..], story[0], &[])
                .map(|(text, _)| text)
                .unwrap_or_default()
        })
        .collect()
}

#[test]
fn string_dedup_lowers_tell_to_print_paddr() {
    let mut compiler = Compiler::new(3);
    compiler.set_string_dedup(true);
    let story = compiler
        .compile_string(
            r#"<ROUTINE GO () <TELL "repeated text"> <TELL "repeated text"> <QUIT>>"#,
            "<test>",
        )
        .unwrap();

    let initial_pc = read_word(&story, 0x06) as usize;
    // Both TELLs lowered to print_paddr with the same packed operand
    assert_eq!(story[initial_pc], 0x8D);
    let first = read_word(&story, initial_pc + 1);
    assert_eq!(story[initial_pc + 3], 0x8D);
    let second = read_word(&story, initial_pc + 4);
    assert_eq!(first, second);

    // The packed address decodes to the original literal
    let expansions = read_abbreviations(&story);
    let addr = first as usize * 2;
    let (decoded, _) = text::decode_bytes(&story[addr..], 3, &expansions).unwrap();
    assert_eq!(decoded, "repeated text");
}

#[test]
fn macros_expand_through_the_pipeline() {
    let story = compile(
        "<DEFMAC HALT () '<QUIT>>
         <ROUTINE GO () <HALT>>",
    );
    let initial_pc = read_word(&story, 0x06) as usize;
    assert_eq!(story[initial_pc], 0xBA);
}

#[test]
fn dictionary_sorted_by_encoding() {
    let story = compile(
        r#"<OBJECT Z (SYNONYM ZEBRA) (DESC "z")>
           <OBJECT A (SYNONYM AARDVARK) (DESC "a")>
           <OBJECT M (SYNONYM MONGOOSE APPLE) (DESC "m")>
           <BUZZ THE AN>
           <ROUTINE GO () <QUIT>>"#,
    );
    let dict = read_word(&story, 0x08) as usize;
    let sep_count = story[dict] as usize;
    let entry_len = story[dict + 1 + sep_count] as usize;
    let count = read_word(&story, dict + 2 + sep_count) as usize;
    let entries = dict + 4 + sep_count;

    let mut previous: Option<Vec<u8>> = None;
    for i in 0..count {
        let at = entries + i * entry_len;
        let encoded = story[at..at + 4].to_vec();
        if let Some(prev) = &previous {
            assert!(prev <= &encoded, "dictionary out of order at entry {}", i);
        }
        previous = Some(encoded);
    }
}

#[test]
fn compile_errors_are_reported_not_panicked() {
    let err = Compiler::new(3)
        .compile_string("<ROUTINE GO () <NO-SUCH-THING>>", "<test>")
        .unwrap_err();
    assert!(err.to_string().contains("NO-SUCH-THING"));

    let err = Compiler::new(3)
        .compile_string("<ROUTINE GO () \"unterminated", "<test>")
        .unwrap_err();
    assert!(err.to_string().contains("unterminated"));
}
