// Dictionary builder tests

use super::*;
use crate::ZVersion;

fn v3() -> ZVersion {
    ZVersion::V3
}

#[test]
fn header_layout() {
    let mut dict = Dictionary::new(v3());
    dict.add_word("take", WordRole::Verb);
    let data = dict.build();

    let sep_count = data[0] as usize;
    assert_eq!(sep_count, 12); // .,;:?!()[]{}
    let entry_len = data[1 + sep_count];
    assert_eq!(entry_len, 7); // 4 text + 3 data bytes in V3
    let word_count =
        ((data[2 + sep_count] as usize) << 8) | data[3 + sep_count] as usize;
    assert_eq!(word_count, 1);
}

#[test]
fn v4_entries_are_nine_bytes() {
    let mut dict = Dictionary::new(ZVersion::V4);
    dict.add_word("take", WordRole::Verb);
    let data = dict.build();
    let sep_count = data[0] as usize;
    assert_eq!(data[1 + sep_count], 9); // 6 text + 3 data
}

#[test]
fn entries_sorted_by_encoded_tuple() {
    let mut dict = Dictionary::new(v3());
    for word in ["zebra", "apple", "mango", "aardvark"] {
        dict.add_word(word, WordRole::Noun);
    }
    let data = dict.build();

    let sep_count = data[0] as usize;
    let header = 1 + sep_count + 1 + 2;
    let entry_len = 7;
    let count = 4;

    let mut previous: Option<Vec<u8>> = None;
    for i in 0..count {
        let at = header + i * entry_len;
        let encoded = data[at..at + 4].to_vec();
        if let Some(prev) = &previous {
            assert!(prev <= &encoded, "entries out of order");
        }
        previous = Some(encoded);
    }
}

#[test]
fn colliding_words_merge_with_warning() {
    let mut dict = Dictionary::new(v3());
    // Both truncate to the same 6 Z-characters in V3
    dict.add_word("lantern", WordRole::Noun);
    dict.add_word("lanterns", WordRole::Adjective);
    let data = dict.build();

    let sep_count = data[0] as usize;
    let word_count =
        ((data[2 + sep_count] as usize) << 8) | data[3 + sep_count] as usize;
    assert_eq!(word_count, 1);
    assert!(dict
        .warnings()
        .iter()
        .any(|w| w.code == "ZIL0310"));
    assert!(dict
        .warnings()
        .iter()
        .any(|w| w.code == "ZIL0311"));

    // Merged entry carries both role flags
    let header = 1 + sep_count + 1 + 2;
    let type_byte = data[header + 4];
    assert_ne!(type_byte & 0x80, 0, "noun flag");
    assert_ne!(type_byte & 0x20, 0, "adjective flag");
}

#[test]
fn verb_number_lands_in_data_bytes() {
    let mut dict = Dictionary::new(v3());
    dict.add_verb("take", 255);
    let data = dict.build();
    let sep_count = data[0] as usize;
    let header = 1 + sep_count + 1 + 2;
    let type_byte = data[header + 4];
    assert_ne!(type_byte & 0x40, 0, "verb flag");
    assert_eq!(data[header + 5], 255, "verb number");
}

#[test]
fn verb_synonym_shares_data() {
    let mut dict = Dictionary::new(v3());
    dict.add_verb("toss", 254);
    dict.add_verb_synonym("chuck", "toss");
    let data = dict.build();

    let sep_count = data[0] as usize;
    let header = 1 + sep_count + 1 + 2;
    // chuck sorts before toss; both entries carry verb number 254
    let first_data = &data[header + 4..header + 7];
    let second_data = &data[header + 7 + 4..header + 7 + 7];
    assert_eq!(first_data, second_data);
    assert_eq!(first_data[1], 254);
}

#[test]
fn direction_entries_carry_property_number() {
    let mut dict = Dictionary::new(v3());
    dict.add_direction("north", 31);
    let data = dict.build();
    let sep_count = data[0] as usize;
    let header = 1 + sep_count + 1 + 2;
    let type_byte = data[header + 4];
    assert_ne!(type_byte & 0x10, 0, "direction flag");
    assert_eq!(data[header + 5], 31);
}

#[test]
fn word_offsets_follow_sorted_order() {
    let mut dict = Dictionary::new(v3());
    dict.add_word("zebra", WordRole::Noun);
    dict.add_word("apple", WordRole::Noun);
    dict.build();

    let apple = dict.word_offset("apple").unwrap();
    let zebra = dict.word_offset("ZEBRA").unwrap();
    assert!(apple < zebra);
    assert_eq!(zebra - apple, 7);
}

#[test]
fn sibreaks_extend_separators_and_words() {
    let dict = Dictionary::with_sibreaks(v3(), "\"'");
    assert!(dict.contains("\""));
    assert!(dict.contains("'"));
}

#[test]
fn removed_words_disappear() {
    let mut dict = Dictionary::new(v3());
    dict.add_word("ghost", WordRole::Noun);
    dict.remove_word("ghost");
    assert!(!dict.contains("ghost"));
}

#[test]
fn long_words_reported_past_cap() {
    let mut dict = Dictionary::new(v3());
    dict.add_word("go", WordRole::Verb);
    dict.add_word("lanterns", WordRole::Noun);
    let long = dict.long_words(6);
    assert_eq!(long, vec!["lanterns".to_string()]);
}
