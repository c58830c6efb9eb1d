// Z-Machine Text Encoding
//
// Converts strings to the Z-machine's packed 5-bit Z-character format and
// back. Three alphabets, shift characters, ZSCII escapes, and two-Z-char
// abbreviation references per Z-Machine Standard 1.1 section 3.

use crate::abbreviations::AbbreviationsTable;
use crate::error::CompilerError;

/// The three alphabets. Z-characters 6..=31 index into these.
pub const ALPHABET_A0: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
pub const ALPHABET_A1: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
/// A2 position 0 is the ZSCII escape (Z-char 6), position 1 is newline.
pub const ALPHABET_A2: &[u8] = b"\x00\n0123456789.,!?_#'\"/\\-:()";

const PAD_ZCHAR: u8 = 5;

/// Encodes text to Z-machine format for a given target version.
pub struct ZTextEncoder<'a> {
    version: u8,
    abbreviations: Option<&'a AbbreviationsTable>,
}

impl<'a> ZTextEncoder<'a> {
    pub fn new(version: u8) -> Self {
        ZTextEncoder {
            version,
            abbreviations: None,
        }
    }

    /// Encoder that consults an abbreviations table for two-Z-char references.
    pub fn with_abbreviations(version: u8, table: &'a AbbreviationsTable) -> Self {
        ZTextEncoder {
            version,
            abbreviations: Some(table),
        }
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    fn alphabet_index(alphabet: &[u8], ch: char) -> Option<u8> {
        if !ch.is_ascii() {
            return None;
        }
        let b = ch as u8;
        alphabet.iter().position(|&a| a == b).map(|i| i as u8)
    }

    /// V1-2 shift lock: Z-char 4 locks the next alphabet in the cycle,
    /// Z-char 5 the previous one.
    fn lock_to(target: u8, zchars: &mut Vec<u8>, current: &mut u8) {
        if *current == target {
            return;
        }
        if (*current + 1) % 3 == target {
            zchars.push(4);
        } else {
            zchars.push(5);
        }
        *current = target;
    }

    /// Convert one character to Z-characters, given the resting alphabet.
    /// V3+ uses temporary shifts (4 -> A1, 5 -> A2 for one character);
    /// V1-2 use the same codes as shift locks.
    fn push_char(&self, ch: char, zchars: &mut Vec<u8>, current: &mut u8) {
        if ch == ' ' {
            zchars.push(0);
            return;
        }

        if let Some(idx) = Self::alphabet_index(ALPHABET_A0, ch) {
            if self.version <= 2 {
                Self::lock_to(0, zchars, current);
            }
            zchars.push(6 + idx);
            return;
        }

        if let Some(idx) = Self::alphabet_index(ALPHABET_A1, ch) {
            if self.version <= 2 {
                Self::lock_to(1, zchars, current);
            } else {
                zchars.push(4);
            }
            zchars.push(6 + idx);
            return;
        }

        // A2 positions 2.. hold printable characters; position 1 is newline.
        let a2_idx = if ch == '\n' {
            Some(1u8)
        } else {
            Self::alphabet_index(&ALPHABET_A2[2..], ch).map(|i| i + 2)
        };
        if let Some(idx) = a2_idx {
            if self.version <= 2 {
                Self::lock_to(2, zchars, current);
            } else {
                zchars.push(5);
            }
            zchars.push(6 + idx);
            return;
        }

        // Outside all alphabets: ZSCII escape (A2 shift, Z-char 6, high 5, low 5)
        let code = ch as u32;
        let zscii = if code <= 0x3FF { code as u16 } else { b'?' as u16 };
        if self.version <= 2 {
            Self::lock_to(2, zchars, current);
        } else {
            zchars.push(5);
        }
        zchars.push(6);
        zchars.push(((zscii >> 5) & 0x1F) as u8);
        zchars.push((zscii & 0x1F) as u8);
    }

    /// Encode a string to raw Z-characters, consulting the abbreviations
    /// table unless `literal` is set (dictionary words and abbreviation
    /// strings themselves must never contain abbreviation references).
    fn to_zchars(&self, text: &str, literal: bool) -> Vec<u8> {
        let chars: Vec<char> = text.chars().collect();
        let mut zchars = Vec::with_capacity(chars.len() * 2);
        let mut current = 0u8;
        let mut i = 0;

        while i < chars.len() {
            if !literal {
                if let Some(table) = self.abbreviations {
                    if let Some((idx, len)) = table.find_longest(&chars, i) {
                        // Reference: first code selects the table (1..=3),
                        // second is the index within that table.
                        zchars.push(1 + (idx / 32) as u8);
                        zchars.push((idx % 32) as u8);
                        i += len;
                        continue;
                    }
                }
            }
            self.push_char(chars[i], &mut zchars, &mut current);
            i += 1;
        }

        zchars
    }

    fn pack_words(zchars: &[u8]) -> Vec<u16> {
        let mut padded = zchars.to_vec();
        while padded.len() % 3 != 0 {
            padded.push(PAD_ZCHAR);
        }
        if padded.is_empty() {
            padded.extend_from_slice(&[PAD_ZCHAR; 3]);
        }

        let mut words = Vec::with_capacity(padded.len() / 3);
        for chunk in padded.chunks(3) {
            let mut word =
                ((chunk[0] as u16) << 10) | ((chunk[1] as u16) << 5) | chunk[2] as u16;
            if words.len() == padded.len() / 3 - 1 {
                word |= 0x8000;
            }
            words.push(word);
        }
        words
    }

    /// Encode a string to 16-bit words, high bit set on the final word.
    pub fn encode_words(&self, text: &str) -> Vec<u16> {
        Self::pack_words(&self.to_zchars(text, false))
    }

    /// Encode without abbreviation references (for abbreviation strings).
    pub fn encode_words_literal(&self, text: &str) -> Vec<u16> {
        Self::pack_words(&self.to_zchars(text, true))
    }

    /// Encode a string to big-endian bytes.
    pub fn encode_bytes(&self, text: &str) -> Vec<u8> {
        words_to_bytes(&self.encode_words(text))
    }

    pub fn encode_bytes_literal(&self, text: &str) -> Vec<u8> {
        words_to_bytes(&self.encode_words_literal(text))
    }

    /// Encode a dictionary word: exactly 2 words (V1-3) or 3 words (V4+),
    /// lower-cased, truncated or padded. Abbreviations are never used.
    pub fn encode_dictionary_word(&self, word: &str) -> Vec<u16> {
        let max_words = if self.version <= 3 { 2 } else { 3 };
        let max_zchars = max_words * 3;

        let lowered = word.to_lowercase();
        let mut zchars = self.to_zchars(&lowered, true);
        zchars.truncate(max_zchars);
        while zchars.len() < max_zchars {
            zchars.push(PAD_ZCHAR);
        }

        let mut words = Vec::with_capacity(max_words);
        for chunk in zchars.chunks(3) {
            let mut word =
                ((chunk[0] as u16) << 10) | ((chunk[1] as u16) << 5) | chunk[2] as u16;
            if words.len() == max_words - 1 {
                word |= 0x8000;
            }
            words.push(word);
        }
        words
    }
}

/// Convert 16-bit words to big-endian bytes.
pub fn words_to_bytes(words: &[u16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(words.len() * 2);
    for w in words {
        out.push((w >> 8) as u8);
        out.push((w & 0xFF) as u8);
    }
    out
}

/// Split big-endian bytes of an encoded string into words, stopping after
/// the word with the termination bit. Returns the words and bytes consumed.
pub fn bytes_to_words(bytes: &[u8]) -> (Vec<u16>, usize) {
    let mut words = Vec::new();
    let mut i = 0;
    while i + 1 < bytes.len() {
        let word = ((bytes[i] as u16) << 8) | bytes[i + 1] as u16;
        words.push(word);
        i += 2;
        if word & 0x8000 != 0 {
            break;
        }
    }
    (words, i)
}

/// Decode Z-character words back into text.
///
/// `abbreviations` supplies the expansion text for abbreviation references;
/// pass an empty slice when the corpus contains none. Used by the string
/// deduplication pass and by round-trip tests.
pub fn decode_words(
    words: &[u16],
    version: u8,
    abbreviations: &[String],
) -> Result<String, CompilerError> {
    let mut zchars = Vec::with_capacity(words.len() * 3);
    for word in words {
        zchars.push(((word >> 10) & 0x1F) as u8);
        zchars.push(((word >> 5) & 0x1F) as u8);
        zchars.push((word & 0x1F) as u8);
        if word & 0x8000 != 0 {
            break;
        }
    }

    let mut out = String::new();
    let mut resting = 0u8; // V1-2 lock alphabet
    let mut shift: Option<u8> = None; // V3+ one-character shift
    let mut i = 0;

    while i < zchars.len() {
        let zc = zchars[i];
        i += 1;

        match zc {
            0 => out.push(' '),
            1..=3 => {
                // Abbreviation reference
                if i >= zchars.len() {
                    break;
                }
                let idx = 32 * (zc as usize - 1) + zchars[i] as usize;
                i += 1;
                match abbreviations.get(idx) {
                    Some(text) => out.push_str(text),
                    None => {
                        return Err(CompilerError::CodeGenError(format!(
                            "abbreviation {} referenced but not defined",
                            idx
                        )))
                    }
                }
            }
            4 => {
                if version <= 2 {
                    resting = (resting + 1) % 3;
                } else {
                    shift = Some(1);
                }
            }
            5 => {
                if version <= 2 {
                    resting = (resting + 2) % 3;
                } else {
                    shift = Some(2);
                }
            }
            _ => {
                let alphabet = shift.take().unwrap_or(resting);
                if alphabet == 2 && zc == 6 {
                    // ZSCII escape: two more Z-chars form a 10-bit code
                    if i + 1 < zchars.len() {
                        let code = ((zchars[i] as u16) << 5) | zchars[i + 1] as u16;
                        i += 2;
                        if let Some(ch) = char::from_u32(code as u32) {
                            out.push(ch);
                        }
                    } else {
                        i = zchars.len();
                    }
                } else {
                    let table = match alphabet {
                        0 => ALPHABET_A0,
                        1 => ALPHABET_A1,
                        _ => ALPHABET_A2,
                    };
                    let idx = (zc - 6) as usize;
                    if alphabet == 2 && zc == 7 {
                        out.push('\n');
                    } else if idx < table.len() {
                        out.push(table[idx] as char);
                    }
                }
            }
        }
    }

    Ok(out)
}

/// Decode an encoded string straight from story bytes.
pub fn decode_bytes(
    bytes: &[u8],
    version: u8,
    abbreviations: &[String],
) -> Result<(String, usize), CompilerError> {
    let (words, consumed) = bytes_to_words(bytes);
    Ok((decode_words(&words, version, abbreviations)?, consumed))
}

#[cfg(test)]
#[path = "text_tests.rs"]
mod tests;
