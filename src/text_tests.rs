// Text encoding tests

use super::*;
use crate::abbreviations::AbbreviationsTable;

#[test]
fn simple_lowercase_string() {
    let encoder = ZTextEncoder::new(3);
    // "hello" = h(13) e(10) l(17) | l(17) o(20) pad(5)
    let words = encoder.encode_words("hello");
    assert_eq!(words.len(), 2);
    assert_eq!(words[0], (13 << 10) | (10 << 5) | 17);
    assert_eq!(words[1], 0x8000 | (17 << 10) | (20 << 5) | 5);
}

#[test]
fn space_is_zchar_zero() {
    let encoder = ZTextEncoder::new(3);
    let words = encoder.encode_words("a b");
    // a(6) 0 b(7), one word with the stop bit
    assert_eq!(words, vec![0x8000 | (6 << 10) | (0 << 5) | 7]);
}

#[test]
fn uppercase_uses_shift_four() {
    let encoder = ZTextEncoder::new(3);
    let words = encoder.encode_words("A");
    // shift(4) A(6) pad(5)
    assert_eq!(words, vec![0x8000 | (4 << 10) | (6 << 5) | 5]);
}

#[test]
fn punctuation_uses_shift_five() {
    let encoder = ZTextEncoder::new(3);
    let words = encoder.encode_words(".");
    // shift(5) period(A2 index 12 -> zchar 18) pad
    assert_eq!(words, vec![0x8000 | (5 << 10) | (18 << 5) | 5]);
}

#[test]
fn zscii_escape_for_exotic_characters() {
    let encoder = ZTextEncoder::new(3);
    let words = encoder.encode_words("@");
    // shift(5) escape(6) high(2) low(0): '@' is 64 = 2*32 + 0
    assert_eq!(words.len(), 2);
    assert_eq!(words[0], (5 << 10) | (6 << 5) | 2);
    assert_eq!(words[1], 0x8000 | (0 << 10) | (5 << 5) | 5);
}

#[test]
fn empty_string_is_one_padded_word() {
    let encoder = ZTextEncoder::new(3);
    assert_eq!(
        encoder.encode_words(""),
        vec![0x8000 | (5 << 10) | (5 << 5) | 5]
    );
}

#[test]
fn last_word_carries_stop_bit() {
    let encoder = ZTextEncoder::new(3);
    let words = encoder.encode_words("the quick brown fox");
    for w in &words[..words.len() - 1] {
        assert_eq!(w & 0x8000, 0);
    }
    assert_ne!(words.last().unwrap() & 0x8000, 0);
}

#[test]
fn dictionary_word_is_fixed_length() {
    let encoder = ZTextEncoder::new(3);
    assert_eq!(encoder.encode_dictionary_word("xyzzy").len(), 2);
    assert_eq!(encoder.encode_dictionary_word("lantern-of-doom").len(), 2);
    let v4 = ZTextEncoder::new(4);
    assert_eq!(v4.encode_dictionary_word("xyzzy").len(), 3);
}

#[test]
fn dictionary_words_are_case_insensitive() {
    let encoder = ZTextEncoder::new(3);
    assert_eq!(
        encoder.encode_dictionary_word("TAKE"),
        encoder.encode_dictionary_word("take")
    );
}

#[test]
fn truncated_dictionary_words_share_encoding() {
    let encoder = ZTextEncoder::new(3);
    // Both truncate to the same 6 Z-characters in V3
    assert_eq!(
        encoder.encode_dictionary_word("lantern"),
        encoder.encode_dictionary_word("lanterns")
    );
}

#[test]
fn round_trip_ascii() {
    // Property 8: encoding then decoding is the identity over the
    // supported character set
    let encoder = ZTextEncoder::new(3);
    for text in [
        "hello world",
        "The Wizard of Frobozz!",
        "a1b2c3",
        "don't panic.",
        "MIXED case With 99 Numbers?",
        "odd #chars: (a/b)",
    ] {
        let words = encoder.encode_words(text);
        let decoded = decode_words(&words, 3, &[]).unwrap();
        assert_eq!(decoded, text);
    }
}

#[test]
fn round_trip_v5() {
    let encoder = ZTextEncoder::new(5);
    let words = encoder.encode_words("Score: 10/100");
    assert_eq!(decode_words(&words, 5, &[]).unwrap(), "Score: 10/100");
}

#[test]
fn round_trip_v1_shift_locks() {
    let encoder = ZTextEncoder::new(1);
    let words = encoder.encode_words("AB cd EF");
    assert_eq!(decode_words(&words, 1, &[]).unwrap(), "AB cd EF");
}

#[test]
fn abbreviation_reference_encodes_to_two_zchars() {
    let mut table = AbbreviationsTable::new();
    let corpus = vec!["the thing".to_string(); 20];
    table.analyze_strings(&corpus, 96);
    assert!(!table.is_empty());

    let encoder = ZTextEncoder::with_abbreviations(3, &table);
    let with = encoder.encode_words("the thing");
    let without = ZTextEncoder::new(3).encode_words("the thing");
    assert!(with.len() < without.len());

    // Decoding with the table's expansions restores the text
    let expansions: Vec<String> = table.strings().to_vec();
    assert_eq!(decode_words(&with, 3, &expansions).unwrap(), "the thing");
}

#[test]
fn literal_encoding_ignores_abbreviations() {
    let mut table = AbbreviationsTable::new();
    let corpus = vec!["abcdefgh".to_string(); 20];
    table.analyze_strings(&corpus, 96);
    let encoder = ZTextEncoder::with_abbreviations(3, &table);
    assert_eq!(
        encoder.encode_words_literal("abcdefgh"),
        ZTextEncoder::new(3).encode_words("abcdefgh")
    );
}

#[test]
fn bytes_round_trip() {
    let encoder = ZTextEncoder::new(3);
    let bytes = encoder.encode_bytes("frotz");
    let (decoded, consumed) = decode_bytes(&bytes, 3, &[]).unwrap();
    assert_eq!(decoded, "frotz");
    assert_eq!(consumed, bytes.len());
}
