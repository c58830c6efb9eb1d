// Z-Machine Object Table Builder
//
// Objects live in an arena indexed by object number (0 is the null
// object). Each entry carries its attribute bitset, tree links, short
// name, and encoded property values; build() lays out property defaults,
// fixed-size entries, and the property tables, and translates the
// properties' relocation records to table-relative offsets.

use bitvec::prelude::*;
use log::debug;

use crate::error::CompilerError;
use crate::relocation::Relocation;
use crate::text::ZTextEncoder;
use crate::ZVersion;

/// One encoded property: number, payload bytes, and relocations whose
/// offsets are relative to the start of the payload.
#[derive(Debug, Clone)]
pub struct PropertyData {
    pub number: u8,
    pub data: Vec<u8>,
    pub relocations: Vec<Relocation>,
}

#[derive(Debug, Clone)]
pub struct ObjectEntry {
    pub name: String,
    pub short_name: String,
    pub attributes: BitVec<u8, Msb0>,
    pub parent: u16,
    pub sibling: u16,
    pub child: u16,
    pub properties: Vec<PropertyData>,
}

pub struct ObjectTable {
    version: ZVersion,
    /// Arena of objects; index 0 is object number 1.
    objects: Vec<ObjectEntry>,
    property_defaults: Vec<u16>,
}

impl ObjectTable {
    pub fn new(version: ZVersion) -> Self {
        ObjectTable {
            version,
            objects: Vec::new(),
            property_defaults: vec![0; version.max_properties() as usize],
        }
    }

    pub fn set_property_default(&mut self, prop_num: u8, value: u16) {
        let idx = prop_num as usize;
        if idx >= 1 && idx <= self.property_defaults.len() {
            self.property_defaults[idx - 1] = value;
        }
    }

    /// Add an object; returns its object number (1-based).
    pub fn add_object(
        &mut self,
        name: &str,
        short_name: &str,
        attributes: BitVec<u8, Msb0>,
        mut properties: Vec<PropertyData>,
    ) -> Result<u16, CompilerError> {
        let max_props = self.version.max_properties();
        for prop in &properties {
            if prop.number == 0 || prop.number > max_props {
                return Err(CompilerError::CodeGenError(format!(
                    "object {}: property number {} out of range 1..{}",
                    name, prop.number, max_props
                )));
            }
            let max_len = self.version.max_property_len();
            if prop.data.len() > max_len {
                return Err(CompilerError::PropertyTooLarge(
                    format!("{} of object {}", prop.number, name),
                    prop.data.len(),
                    max_len,
                ));
            }
        }

        // Property tables list entries in strictly descending number order.
        properties.sort_by(|a, b| b.number.cmp(&a.number));
        for pair in properties.windows(2) {
            if pair[0].number == pair[1].number {
                return Err(CompilerError::CodeGenError(format!(
                    "object {}: property {} defined twice",
                    name, pair[0].number
                )));
            }
        }

        self.objects.push(ObjectEntry {
            name: name.to_string(),
            short_name: short_name.to_string(),
            attributes,
            parent: 0,
            sibling: 0,
            child: 0,
            properties,
        });

        let number = self.objects.len() as u16;
        let max_objects = if self.version.number() <= 3 { 255 } else { 65535 };
        if number as usize > max_objects {
            return Err(CompilerError::CodeGenError(format!(
                "too many objects for version {} (maximum {})",
                self.version.number(),
                max_objects
            )));
        }
        Ok(number)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn object_mut(&mut self, number: u16) -> Option<&mut ObjectEntry> {
        if number == 0 {
            return None;
        }
        self.objects.get_mut(number as usize - 1)
    }

    pub fn object(&self, number: u16) -> Option<&ObjectEntry> {
        if number == 0 {
            return None;
        }
        self.objects.get(number as usize - 1)
    }

    pub fn number_of(&self, name: &str) -> Option<u16> {
        self.objects
            .iter()
            .position(|o| o.name == name)
            .map(|i| i as u16 + 1)
    }

    pub fn defaults_size(&self) -> usize {
        self.property_defaults.len() * 2
    }

    fn encode_size_bytes(&self, prop: &PropertyData, out: &mut Vec<u8>) {
        let len = prop.data.len();
        if self.version.number() <= 3 {
            out.push((32 * (len - 1)) as u8 + prop.number);
        } else if len <= 2 {
            let mut byte = prop.number;
            if len == 2 {
                byte |= 0x40;
            }
            out.push(byte);
        } else {
            out.push(0x80 | prop.number);
            out.push((len & 0x3F) as u8);
        }
    }

    fn build_property_table(
        &self,
        obj: &ObjectEntry,
        encoder: &ZTextEncoder,
        table_offset: usize,
        relocations: &mut Vec<Relocation>,
    ) -> Vec<u8> {
        let mut table = Vec::new();

        let name_words = encoder.encode_words(&obj.short_name);
        if obj.short_name.is_empty() {
            table.push(0);
        } else {
            table.push(name_words.len() as u8);
            for w in &name_words {
                table.push((w >> 8) as u8);
                table.push((w & 0xFF) as u8);
            }
        }

        for prop in &obj.properties {
            if prop.data.is_empty() {
                continue;
            }
            self.encode_size_bytes(prop, &mut table);
            let data_start = table.len();
            table.extend_from_slice(&prop.data);
            for reloc in &prop.relocations {
                relocations.push(Relocation::new(
                    reloc.kind.clone(),
                    table_offset + data_start + reloc.offset,
                ));
            }
        }

        table.push(0x00);
        table
    }

    /// Lay out defaults, object entries, and property tables. Property
    /// pointers are relative to the start of the returned data; the
    /// assembler adds the table's base address. The returned relocations
    /// are likewise relative to the data start.
    pub fn build(&self) -> (Vec<u8>, Vec<Relocation>) {
        let encoder = ZTextEncoder::new(self.version.number());
        let mut relocations = Vec::new();

        let mut result = Vec::new();
        for default in &self.property_defaults {
            result.push((default >> 8) as u8);
            result.push((default & 0xFF) as u8);
        }

        let entry_size = self.version.object_entry_size();
        let entries_start = result.len();
        let prop_tables_start = entries_start + self.objects.len() * entry_size;

        // Property tables are laid out in object order after the entries.
        let mut prop_tables = Vec::new();
        let mut prop_addr = prop_tables_start;
        let mut prop_addrs = Vec::with_capacity(self.objects.len());
        for obj in &self.objects {
            let table = self.build_property_table(obj, &encoder, prop_addr, &mut relocations);
            prop_addrs.push(prop_addr);
            prop_addr += table.len();
            prop_tables.push(table);
        }

        for (obj, &addr) in self.objects.iter().zip(&prop_addrs) {
            let attr_bytes = obj.attributes.as_raw_slice();
            if self.version.number() <= 3 {
                // 4 bytes attributes, byte-wide links, word property pointer
                for i in 0..4 {
                    result.push(attr_bytes.get(i).copied().unwrap_or(0));
                }
                result.push(obj.parent as u8);
                result.push(obj.sibling as u8);
                result.push(obj.child as u8);
            } else {
                for i in 0..6 {
                    result.push(attr_bytes.get(i).copied().unwrap_or(0));
                }
                for link in [obj.parent, obj.sibling, obj.child] {
                    result.push((link >> 8) as u8);
                    result.push((link & 0xFF) as u8);
                }
            }
            result.push((addr >> 8) as u8);
            result.push((addr & 0xFF) as u8);
        }

        for table in prop_tables {
            result.extend_from_slice(&table);
        }

        debug!(
            "object table: {} objects, {} bytes, {} property relocations",
            self.objects.len(),
            result.len(),
            relocations.len()
        );

        (result, relocations)
    }
}

/// Build an attribute bitset sized for the version with the given bits set.
pub fn attributes_from_bits(version: ZVersion, bits: &[u16]) -> BitVec<u8, Msb0> {
    let width = version.max_attributes() as usize;
    let mut attrs = bitvec![u8, Msb0; 0; width];
    for &bit in bits {
        if (bit as usize) < width {
            attrs.set(bit as usize, true);
        }
    }
    attrs
}

#[cfg(test)]
#[path = "object_table_tests.rs"]
mod tests;
