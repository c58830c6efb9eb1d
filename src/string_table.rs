// Deduplicated String Table
//
// Stores each unique string once in high memory and hands out offsets,
// absolute addresses, and packed addresses. The assembler publishes the
// base address (and the V6-7 strings offset) once layout is known.

use indexmap::IndexMap;

use crate::text::ZTextEncoder;
use crate::ZVersion;

pub struct StringTable {
    version: ZVersion,
    entries: IndexMap<String, (Vec<u8>, usize)>, // text -> (encoded, offset)
    data: Vec<u8>,
    base_address: usize,
    strings_offset: usize, // V6-7: actual offset = strings_offset * 8
}

impl StringTable {
    pub fn new(version: ZVersion) -> Self {
        StringTable {
            version,
            entries: IndexMap::new(),
            data: Vec::new(),
            base_address: 0,
            strings_offset: 0,
        }
    }

    /// Add a string (or find the existing entry). Returns the offset of its
    /// encoding relative to the table base. Every entry starts on the
    /// version's packed-address boundary.
    pub fn add_string(&mut self, text: &str, encoder: &ZTextEncoder) -> usize {
        if let Some((_, offset)) = self.entries.get(text) {
            return *offset;
        }
        let alignment = self.version.alignment();
        while self.data.len() % alignment != 0 {
            self.data.push(0);
        }
        let encoded = encoder.encode_bytes(text);
        let offset = self.data.len();
        self.data.extend_from_slice(&encoded);
        self.entries.insert(text.to_string(), (encoded, offset));
        offset
    }

    pub fn offset_of(&self, text: &str) -> Option<usize> {
        self.entries.get(text).map(|(_, off)| *off)
    }

    pub fn address_of(&self, text: &str) -> Option<usize> {
        self.offset_of(text).map(|off| self.base_address + off)
    }

    pub fn packed_address_of(&self, text: &str) -> Option<u16> {
        let addr = self.address_of(text)?;
        let packed = match self.version.number() {
            1..=3 => addr / 2,
            4 | 5 => addr / 4,
            6 | 7 => (addr - 8 * self.strings_offset) / 4,
            _ => addr / 8,
        };
        Some(packed as u16)
    }

    pub fn set_base_address(&mut self, address: usize) {
        self.base_address = address;
    }

    pub fn set_strings_offset(&mut self, offset: usize) {
        self.strings_offset = offset;
    }

    pub fn encoded_data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
