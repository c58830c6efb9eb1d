// Z-Machine Dictionary Builder
//
// Collects vocabulary words with their parser roles, merges words whose
// Z-character encodings collide, and emits the dictionary table sorted by
// encoded tuple (the run-time parser binary-searches on that order).

use std::collections::HashSet;

use indexmap::IndexMap;
use lazy_static::lazy_static;
use log::{debug, warn};

use crate::text::ZTextEncoder;
use crate::ZVersion;

lazy_static! {
    /// Sentence punctuation always present in the separator list.
    static ref DEFAULT_SEPARATORS: Vec<u8> = b".,;:?!()[]{}".to_vec();
}

/// Parser roles a word can carry. A single entry's type byte unions every
/// role of every source word that merged into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WordRole {
    Noun,
    Verb,
    Adjective,
    Direction,
    Preposition,
    Buzz,
}

#[derive(Debug, Clone, Default)]
struct WordInfo {
    roles: HashSet<WordRole>,
    /// Object number for nouns/adjectives, property number for directions.
    payload: Option<u16>,
    verb_number: Option<u8>,
}

/// A warning produced while merging entries; non-fatal.
#[derive(Debug, Clone)]
pub struct DictionaryWarning {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug)]
pub struct Dictionary {
    version: ZVersion,
    separators: Vec<u8>,
    words: IndexMap<String, WordInfo>,
    verb_synonyms: IndexMap<String, String>, // synonym -> canonical verb
    warnings: Vec<DictionaryWarning>,
    /// Built lazily: word -> byte offset within the dictionary data.
    offsets: IndexMap<String, usize>,
}

impl Dictionary {
    pub fn new(version: ZVersion) -> Self {
        Self::with_sibreaks(version, "")
    }

    /// SIBREAKS characters both extend the separator list and become
    /// one-character words in their own right.
    pub fn with_sibreaks(version: ZVersion, sibreaks: &str) -> Self {
        let mut separators = DEFAULT_SEPARATORS.clone();
        let mut dict = Dictionary {
            version,
            separators: Vec::new(),
            words: IndexMap::new(),
            verb_synonyms: IndexMap::new(),
            warnings: Vec::new(),
            offsets: IndexMap::new(),
        };
        for ch in sibreaks.chars() {
            if ch.is_ascii() && !separators.contains(&(ch as u8)) {
                separators.push(ch as u8);
            }
            dict.add_word(&ch.to_string(), WordRole::Buzz);
        }
        dict.separators = separators;
        dict
    }

    fn entry(&mut self, word: &str) -> &mut WordInfo {
        let key = word.to_lowercase();
        self.words.entry(key).or_default()
    }

    pub fn add_word(&mut self, word: &str, role: WordRole) {
        self.entry(word).roles.insert(role);
    }

    /// A noun that resolves to an object.
    pub fn add_synonym(&mut self, word: &str, obj_num: u16) {
        let info = self.entry(word);
        info.roles.insert(WordRole::Noun);
        info.payload = Some(obj_num);
    }

    pub fn add_adjective(&mut self, word: &str, obj_num: u16) {
        let info = self.entry(word);
        info.roles.insert(WordRole::Adjective);
        if info.payload.is_none() {
            info.payload = Some(obj_num);
        }
    }

    /// A verb with its number (255 downward); the number lands in the data
    /// bytes so the parser can reach the syntax tables.
    pub fn add_verb(&mut self, word: &str, verb_number: u8) {
        let info = self.entry(word);
        info.roles.insert(WordRole::Verb);
        info.verb_number = Some(verb_number);
    }

    /// Verb synonyms share all data bytes with their canonical verb.
    pub fn add_verb_synonym(&mut self, synonym: &str, canonical: &str) {
        let canon_key = canonical.to_lowercase();
        let verb_number = self.words.get(&canon_key).and_then(|w| w.verb_number);
        let info = self.entry(synonym);
        info.roles.insert(WordRole::Verb);
        if info.verb_number.is_none() {
            info.verb_number = verb_number;
        }
        self.verb_synonyms
            .insert(synonym.to_lowercase(), canon_key);
    }

    /// A direction word carrying its property number.
    pub fn add_direction(&mut self, word: &str, prop_num: u8) {
        let info = self.entry(word);
        info.roles.insert(WordRole::Direction);
        info.payload = Some(prop_num as u16);
    }

    pub fn remove_word(&mut self, word: &str) {
        self.words.shift_remove(&word.to_lowercase());
        self.verb_synonyms.shift_remove(&word.to_lowercase());
    }

    pub fn contains(&self, word: &str) -> bool {
        self.words.contains_key(&word.to_lowercase())
    }

    pub fn word_count(&self) -> usize {
        self.words.len()
    }

    pub fn warnings(&self) -> &[DictionaryWarning] {
        &self.warnings
    }

    fn entry_length(&self) -> usize {
        let text_bytes = if self.version.number() <= 3 { 4 } else { 6 };
        text_bytes + 3
    }

    fn header_size(&self) -> usize {
        // separator count, separators, entry length, word count
        1 + self.separators.len() + 1 + 2
    }

    fn type_byte(roles: &HashSet<WordRole>) -> u8 {
        let mut byte = 0u8;
        let mut first_set = false;
        // Fixed precedence so merged entries are deterministic: verb, then
        // adjective, then direction claims the low "first" nibble.
        if roles.contains(&WordRole::Noun) {
            byte |= 0x80;
        }
        if roles.contains(&WordRole::Verb) {
            byte |= 0x40;
            if !first_set {
                byte |= 0x01;
                first_set = true;
            }
        }
        if roles.contains(&WordRole::Adjective) {
            byte |= 0x20;
            if !first_set {
                byte |= 0x02;
                first_set = true;
            }
        }
        if roles.contains(&WordRole::Direction) {
            byte |= 0x10;
            if !first_set {
                byte |= 0x03;
            }
        }
        if roles.contains(&WordRole::Preposition) {
            byte |= 0x08;
        }
        if roles.contains(&WordRole::Buzz) {
            byte |= 0x04;
        }
        byte
    }

    /// Merge words by encoding, sort by encoded tuple, and emit the table.
    /// Also records every word's byte offset for vocabulary fix-ups.
    pub fn build(&mut self) -> Vec<u8> {
        self.warnings.clear();
        self.offsets.clear();

        let encoder = ZTextEncoder::new(self.version.number());

        // Group source words by their encoded tuple.
        let mut groups: IndexMap<Vec<u16>, Vec<String>> = IndexMap::new();
        let mut sorted_words: Vec<&String> = self.words.keys().collect();
        sorted_words.sort();
        for word in sorted_words {
            let encoded = encoder.encode_dictionary_word(word);
            groups.entry(encoded).or_default().push(word.clone());
        }

        // The run-time binary search needs entries ordered by encoded tuple.
        let mut merged: Vec<(Vec<u16>, Vec<String>)> = groups.into_iter().collect();
        merged.sort_by(|a, b| a.0.cmp(&b.0));

        for (_, members) in merged.iter().filter(|(_, m)| m.len() > 1) {
            let colliding = members.join(", ");
            self.warnings.push(DictionaryWarning {
                code: "ZIL0310",
                message: format!(
                    "words collide (encode to the same dictionary entry): {}",
                    colliding
                ),
            });
            let first_roles = &self.words[&members[0]].roles;
            if members[1..]
                .iter()
                .any(|w| &self.words[w].roles != first_roles)
            {
                self.warnings.push(DictionaryWarning {
                    code: "ZIL0311",
                    message: format!(
                        "colliding words have different parts of speech: {}",
                        colliding
                    ),
                });
            }
        }
        for w in &self.warnings {
            warn!("[{}] {}", w.code, w.message);
        }

        let mut result = Vec::new();
        result.push(self.separators.len() as u8);
        result.extend_from_slice(&self.separators);
        result.push(self.entry_length() as u8);
        result.push((merged.len() >> 8) as u8);
        result.push((merged.len() & 0xFF) as u8);

        let header = self.header_size();
        let entry_len = self.entry_length();

        for (index, (encoded, members)) in merged.iter().enumerate() {
            let offset = header + index * entry_len;
            for member in members {
                self.offsets.insert(member.clone(), offset);
            }

            for w in encoded {
                result.push((w >> 8) as u8);
                result.push((w & 0xFF) as u8);
            }

            // Union roles and pick the first available payloads.
            let mut roles = HashSet::new();
            let mut payload = None;
            let mut verb_number = None;
            for member in members {
                let info = &self.words[member];
                roles.extend(info.roles.iter().copied());
                if payload.is_none() {
                    payload = info.payload;
                }
                if verb_number.is_none() {
                    verb_number = info.verb_number;
                }
            }
            // Verb synonyms inherit the canonical verb's number.
            if verb_number.is_none() {
                for member in members {
                    if let Some(canon) = self.verb_synonyms.get(member) {
                        if let Some(info) = self.words.get(canon) {
                            verb_number = info.verb_number;
                        }
                    }
                }
            }

            result.push(Self::type_byte(&roles));

            if roles.contains(&WordRole::Direction) {
                result.push(payload.unwrap_or(0) as u8);
                result.push(0);
            } else if let Some(vn) = verb_number {
                result.push(vn);
                result.push(0);
            } else {
                let obj = payload.unwrap_or(0);
                result.push((obj >> 8) as u8);
                result.push((obj & 0xFF) as u8);
            }
        }

        debug!(
            "dictionary: {} entries ({} source words), entry length {}",
            merged.len(),
            self.words.len(),
            entry_len
        );

        result
    }

    /// Byte offset of a word within the dictionary data. Valid after
    /// `build`; words sharing an encoding share an offset.
    pub fn word_offset(&self, word: &str) -> Option<usize> {
        self.offsets.get(&word.to_lowercase()).copied()
    }

    pub fn word_offsets(&self) -> &IndexMap<String, usize> {
        &self.offsets
    }

    /// Words longer than the encoding cap (6 chars V1-3, 9 V4+); the
    /// LONG-WORDS? table records their full text.
    pub fn long_words(&self, cap: usize) -> Vec<String> {
        self.words
            .keys()
            .filter(|w| w.chars().count() > cap)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
#[path = "dictionary_tests.rs"]
mod tests;
