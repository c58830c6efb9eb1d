// Abbreviations Table
//
// The Z-machine allows up to 96 abbreviations (32 each behind Z-characters
// 1, 2 and 3); a reference compresses to two Z-characters. Selection is
// corpus-driven: mine substrings, rank by estimated byte savings, then pick
// greedily while rejecting overlaps (an abbreviation containing or contained
// in an already-selected one would make encode-time matching ambiguous).

use std::collections::HashMap;

use log::debug;

use crate::text::ZTextEncoder;

pub const MAX_ABBREVIATIONS: usize = 96;

#[derive(Debug, Default)]
pub struct AbbreviationsTable {
    abbreviations: Vec<String>,
    lookup: HashMap<String, usize>,
    encoded: Vec<Vec<u8>>,
}

impl AbbreviationsTable {
    pub fn new() -> Self {
        AbbreviationsTable::default()
    }

    /// Mine substrings of length 2..=20 across the corpus, rank by savings,
    /// and keep the best non-overlapping candidates.
    ///
    /// `max_candidates` may exceed 96 so the later overlap-elimination pass
    /// has a pool to re-select from.
    pub fn analyze_strings(&mut self, strings: &[String], max_candidates: usize) {
        let mut counts: HashMap<&str, u32> = HashMap::new();

        for string in strings {
            let len = string.len();
            let longest = len.min(20);
            for sub_len in 2..=longest {
                for start in 0..=(len - sub_len) {
                    if !string.is_char_boundary(start) || !string.is_char_boundary(start + sub_len)
                    {
                        continue;
                    }
                    let sub = &string[start..start + sub_len];
                    if sub.trim().is_empty() {
                        continue;
                    }
                    *counts.entry(sub).or_insert(0) += 1;
                }
            }
        }

        let mut candidates: Vec<(f64, u32, &str)> = counts
            .into_iter()
            .filter(|&(_, count)| count >= 2)
            .filter_map(|(sub, count)| {
                let savings = estimated_savings(sub, count);
                if savings > 0.0 {
                    Some((savings, count, sub))
                } else {
                    None
                }
            })
            .collect();

        // Best savings first; tie-break on count then text for determinism.
        candidates.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.1.cmp(&a.1))
                .then(a.2.cmp(b.2))
        });

        self.abbreviations.clear();
        self.lookup.clear();
        self.encoded.clear();

        for (_, _, sub) in candidates {
            if self
                .abbreviations
                .iter()
                .any(|existing| overlaps(existing, sub))
            {
                continue;
            }
            self.lookup.insert(sub.to_string(), self.abbreviations.len());
            self.abbreviations.push(sub.to_string());
            if self.abbreviations.len() >= max_candidates {
                break;
            }
        }

        debug!(
            "selected {} abbreviation candidates from corpus of {} strings",
            self.abbreviations.len(),
            strings.len()
        );
    }

    /// Re-run greedy selection over the current list, dropping anything that
    /// overlaps an earlier keeper, capped at 96. Run between codegen and
    /// assembly (the candidate pool may be larger than 96 until then).
    pub fn eliminate_overlaps(&mut self) -> usize {
        let mut selected: Vec<String> = Vec::new();
        for abbrev in &self.abbreviations {
            if selected.iter().any(|kept| overlaps(kept, abbrev)) {
                continue;
            }
            selected.push(abbrev.clone());
            if selected.len() >= MAX_ABBREVIATIONS {
                break;
            }
        }

        let dropped = self.abbreviations.len() - selected.len();
        self.abbreviations = selected;
        self.lookup = self
            .abbreviations
            .iter()
            .enumerate()
            .map(|(i, s)| (s.clone(), i))
            .collect();
        self.encoded.clear();
        dropped
    }

    /// Longest abbreviation matching `text` at `start`, as (index, char count).
    pub fn find_longest(&self, text: &[char], start: usize) -> Option<(usize, usize)> {
        let mut best: Option<(usize, usize)> = None;
        for (idx, abbrev) in self.abbreviations.iter().enumerate() {
            let abbrev_chars: Vec<char> = abbrev.chars().collect();
            let len = abbrev_chars.len();
            if start + len > text.len() {
                continue;
            }
            if text[start..start + len] == abbrev_chars[..]
                && best.map_or(true, |(_, best_len)| len > best_len)
            {
                best = Some((idx, len));
            }
        }
        best
    }

    /// Encode every abbreviation string (no nested abbreviation references).
    pub fn encode_strings(&mut self, version: u8) {
        let encoder = ZTextEncoder::new(version);
        self.encoded = self
            .abbreviations
            .iter()
            .map(|a| encoder.encode_bytes_literal(a))
            .collect();
    }

    /// The 96-entry table of word addresses, given where the encoded
    /// abbreviation strings will start. Unused slots point at word 0.
    pub fn table_bytes(&self, strings_base: usize) -> Vec<u8> {
        let mut table = Vec::with_capacity(MAX_ABBREVIATIONS * 2);
        let mut addr = strings_base;

        for i in 0..MAX_ABBREVIATIONS {
            if i < self.encoded.len() {
                let word_addr = addr / 2;
                table.push((word_addr >> 8) as u8);
                table.push((word_addr & 0xFF) as u8);
                addr += self.encoded[i].len();
            } else {
                table.push(0);
                table.push(0);
            }
        }
        table
    }

    pub fn encoded_strings(&self) -> &[Vec<u8>] {
        &self.encoded
    }

    pub fn encoded_size(&self) -> usize {
        self.encoded.iter().map(|e| e.len()).sum()
    }

    pub fn strings(&self) -> &[String] {
        &self.abbreviations
    }

    pub fn index_of(&self, text: &str) -> Option<usize> {
        self.lookup.get(text).copied()
    }

    pub fn len(&self) -> usize {
        self.abbreviations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.abbreviations.is_empty()
    }
}

/// Bytes saved by abbreviating: each character costs about 0.6 bytes in
/// Z-char form, a reference costs two Z-chars (1.33 bytes), and the
/// abbreviation's own storage is paid once.
fn estimated_savings(sub: &str, count: u32) -> f64 {
    let len = sub.chars().count() as f64;
    (0.6 * len - 1.33) * count as f64 - 0.6 * len
}

fn overlaps(a: &str, b: &str) -> bool {
    a.contains(b) || b.contains(a)
}

#[cfg(test)]
#[path = "abbreviations_tests.rs"]
mod tests;
