// Lexer tests

use super::*;

fn kinds(input: &str) -> Vec<TokenKind> {
    tokenize(input, "<test>")
        .unwrap()
        .into_iter()
        .map(|t| t.kind)
        .collect()
}

#[test]
fn empty_input_yields_eof() {
    assert_eq!(kinds(""), vec![TokenKind::Eof]);
}

#[test]
fn delimiters() {
    assert_eq!(
        kinds("< > ( ) [ ]"),
        vec![
            TokenKind::LAngle,
            TokenKind::RAngle,
            TokenKind::LParen,
            TokenKind::RParen,
            TokenKind::LBracket,
            TokenKind::RBracket,
            TokenKind::Eof,
        ]
    );
}

#[test]
fn atoms_and_numbers() {
    assert_eq!(
        kinds("ROUTINE FOO-BAR 42 -17"),
        vec![
            TokenKind::Atom("ROUTINE".to_string()),
            TokenKind::Atom("FOO-BAR".to_string()),
            TokenKind::Number(42),
            TokenKind::Number(-17),
            TokenKind::Eof,
        ]
    );
}

#[test]
fn hex_and_octal_and_radix_numbers() {
    assert_eq!(
        kinds("$1A3F *777* #2 1011"),
        vec![
            TokenKind::Number(0x1A3F),
            TokenKind::Number(0o777),
            TokenKind::Number(0b1011),
            TokenKind::Eof,
        ]
    );
}

#[test]
fn dollar_atom_is_not_hex() {
    // $BUZZ starts with hex digits but continues with atom characters
    assert_eq!(
        kinds("$BUZZ"),
        vec![TokenKind::Atom("$BUZZ".to_string()), TokenKind::Eof]
    );
}

#[test]
fn atom_starting_with_digit() {
    assert_eq!(
        kinds("1ST? 2ND"),
        vec![
            TokenKind::Atom("1ST?".to_string()),
            TokenKind::Atom("2ND".to_string()),
            TokenKind::Eof,
        ]
    );
}

#[test]
fn string_literal_with_escapes() {
    assert_eq!(
        kinds(r#""hello \"world\"\n""#),
        vec![TokenKind::Str("hello \"world\"\n".to_string()), TokenKind::Eof]
    );
}

#[test]
fn unterminated_string_is_fatal() {
    assert!(tokenize("\"oops", "<test>").is_err());
}

#[test]
fn variable_prefixes() {
    assert_eq!(
        kinds(".LOC ,WINNER %.CH %,GCH"),
        vec![
            TokenKind::LocalVar("LOC".to_string()),
            TokenKind::GlobalVar("WINNER".to_string()),
            TokenKind::CharLocalVar("CH".to_string()),
            TokenKind::CharGlobalVar("GCH".to_string()),
            TokenKind::Eof,
        ]
    );
}

#[test]
fn comment_styles_are_skipped() {
    assert_eq!(
        kinds(";\"block comment\" FOO ;<FORM X Y> BAR ;word BAZ"),
        vec![
            TokenKind::Atom("FOO".to_string()),
            TokenKind::Atom("BAR".to_string()),
            TokenKind::Atom("BAZ".to_string()),
            TokenKind::Eof,
        ]
    );
}

#[test]
fn comment_form_honours_nested_brackets_and_strings() {
    assert_eq!(
        kinds(";<A <B \"unbalanced > inside\" C> D> KEEP"),
        vec![TokenKind::Atom("KEEP".to_string()), TokenKind::Eof]
    );
}

#[test]
fn semicolon_separator_inside_parens() {
    // ;WORD with no whitespace inside parens (outside angles) is the
    // ZILF synonym separator, not a comment
    let tokens = kinds("(FOO ;BAR BAZ)");
    assert_eq!(
        tokens,
        vec![
            TokenKind::LParen,
            TokenKind::Atom("FOO".to_string()),
            TokenKind::Semicolon,
            TokenKind::Atom("BAR".to_string()),
            TokenKind::Atom("BAZ".to_string()),
            TokenKind::RParen,
            TokenKind::Eof,
        ]
    );
}

#[test]
fn semicolon_inside_angles_is_comment() {
    assert_eq!(
        kinds("<FOO ;BAR BAZ>"),
        vec![
            TokenKind::LAngle,
            TokenKind::Atom("FOO".to_string()),
            TokenKind::Atom("BAZ".to_string()),
            TokenKind::RAngle,
            TokenKind::Eof,
        ]
    );
}

#[test]
fn quasiquote_operators() {
    assert_eq!(
        kinds("` ~ ~! 'X"),
        vec![
            TokenKind::Atom("`".to_string()),
            TokenKind::Atom("~".to_string()),
            TokenKind::Atom("~!".to_string()),
            TokenKind::Quote,
            TokenKind::Atom("X".to_string()),
            TokenKind::Eof,
        ]
    );
}

#[test]
fn character_literal_escape() {
    assert_eq!(
        kinds(r"!\A"),
        vec![TokenKind::Atom("!\\A".to_string()), TokenKind::Eof]
    );
}

#[test]
fn backslash_escape_in_atom() {
    assert_eq!(
        kinds(r"A?G\'S"),
        vec![TokenKind::Atom("A?G\\'S".to_string()), TokenKind::Eof]
    );
}

#[test]
fn control_character_digraphs_are_whitespace() {
    assert_eq!(
        kinds("FOO ^/L BAR"),
        vec![
            TokenKind::Atom("FOO".to_string()),
            TokenKind::Atom("BAR".to_string()),
            TokenKind::Eof,
        ]
    );
}

#[test]
fn percent_form_inside_form_becomes_zero() {
    // Unevaluated %<...> inside a form yields a 0 placeholder so the
    // surrounding form still parses
    assert_eq!(
        kinds("<CONSTANT C %<FOO 1>>"),
        vec![
            TokenKind::LAngle,
            TokenKind::Atom("CONSTANT".to_string()),
            TokenKind::Atom("C".to_string()),
            TokenKind::Number(0),
            TokenKind::RAngle,
            TokenKind::Eof,
        ]
    );
}

#[test]
fn percent_form_at_top_level_is_skipped() {
    assert_eq!(kinds("%<FOO 1> BAR"), vec![
        TokenKind::Atom("BAR".to_string()),
        TokenKind::Eof,
    ]);
}

#[test]
fn number_followed_by_comment() {
    assert_eq!(
        kinds("17;comment"),
        vec![TokenKind::Number(17), TokenKind::Eof]
    );
}

#[test]
fn positions_track_lines_and_columns() {
    let tokens = tokenize("FOO\n  BAR", "<test>").unwrap();
    assert_eq!(tokens[0].pos.line, 1);
    assert_eq!(tokens[0].pos.column, 1);
    assert_eq!(tokens[1].pos.line, 2);
    assert_eq!(tokens[1].pos.column, 3);
}
