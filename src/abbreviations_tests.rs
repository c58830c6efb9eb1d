// Abbreviation selection tests

use super::*;

fn corpus(strings: &[(&str, usize)]) -> Vec<String> {
    let mut out = Vec::new();
    for (text, count) in strings {
        for _ in 0..*count {
            out.push(text.to_string());
        }
    }
    out
}

#[test]
fn selects_frequent_substrings() {
    let strings = corpus(&[("the thing", 10), ("thing", 20)]);
    let mut table = AbbreviationsTable::new();
    table.analyze_strings(&strings, MAX_ABBREVIATIONS);
    assert!(!table.is_empty());
    // Something covering "thing" made it in
    assert!(table.strings().iter().any(|s| s.contains("thing")));
}

#[test]
fn selection_rejects_overlaps() {
    let strings = corpus(&[("the quick brown fox", 30), ("the quick red fox", 30)]);
    let mut table = AbbreviationsTable::new();
    table.analyze_strings(&strings, MAX_ABBREVIATIONS);
    let kept = table.strings();
    for (i, a) in kept.iter().enumerate() {
        for b in &kept[i + 1..] {
            assert!(
                !a.contains(b.as_str()) && !b.contains(a.as_str()),
                "{:?} overlaps {:?}",
                a,
                b
            );
        }
    }
}

#[test]
fn rare_substrings_are_not_selected() {
    let strings = vec!["one occurrence only".to_string()];
    let mut table = AbbreviationsTable::new();
    table.analyze_strings(&strings, MAX_ABBREVIATIONS);
    assert!(table.is_empty());
}

#[test]
fn capped_at_limit() {
    // Lots of distinct repeated phrases
    let mut strings = Vec::new();
    for i in 0..300 {
        let phrase = format!("phrase-number-{:03}-goes-here", i);
        for _ in 0..5 {
            strings.push(phrase.clone());
        }
    }
    let mut table = AbbreviationsTable::new();
    table.analyze_strings(&strings, MAX_ABBREVIATIONS);
    assert!(table.len() <= MAX_ABBREVIATIONS);
}

#[test]
fn find_longest_prefers_longer_matches() {
    let strings = corpus(&[("abcdef", 20), ("xyz abc xyz", 20)]);
    let mut table = AbbreviationsTable::new();
    table.analyze_strings(&strings, MAX_ABBREVIATIONS);

    let text: Vec<char> = "abcdef".chars().collect();
    if let Some((idx, len)) = table.find_longest(&text, 0) {
        // Whatever matched, no shorter entry should have beaten a longer one
        for (i, abbrev) in table.strings().iter().enumerate() {
            if text.len() >= abbrev.chars().count()
                && "abcdef".starts_with(abbrev.as_str())
            {
                assert!(len >= abbrev.chars().count(), "entry {} beat the match", i);
            }
        }
        assert!(idx < table.len());
    }
}

#[test]
fn eliminate_overlaps_is_idempotent_on_clean_tables() {
    let strings = corpus(&[("the thing", 10), ("some other text", 10)]);
    let mut table = AbbreviationsTable::new();
    table.analyze_strings(&strings, MAX_ABBREVIATIONS);
    let before: Vec<String> = table.strings().to_vec();
    let dropped = table.eliminate_overlaps();
    assert_eq!(dropped, 0);
    assert_eq!(table.strings(), &before[..]);
}

#[test]
fn table_bytes_are_96_word_addresses() {
    let strings = corpus(&[("hello sailor", 10)]);
    let mut table = AbbreviationsTable::new();
    table.analyze_strings(&strings, MAX_ABBREVIATIONS);
    table.encode_strings(3);

    let bytes = table.table_bytes(0x1000);
    assert_eq!(bytes.len(), 192);
    // First entry points at the strings base as a word address
    let first = ((bytes[0] as u16) << 8) | bytes[1] as u16;
    assert_eq!(first as usize, 0x1000 / 2);
}

#[test]
fn savings_metric_shape() {
    // Long frequent substrings save more than short rare ones
    let long_frequent = super::estimated_savings("carpet cleaner", 20);
    let short_rare = super::estimated_savings("ab", 2);
    assert!(long_frequent > short_rare);
}
