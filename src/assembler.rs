// Z-Machine Story File Assembler
//
// Lays out dynamic, static, and high memory, resolves every relocation
// kind exactly once in a fixed order, and finishes the header with the
// checksum and packed file length. The output is the complete story
// file; nothing is written to disk until the byte vector is whole.

use log::debug;

use crate::codegen::CodeGenOutput;
use crate::error::CompilerError;
use crate::relocation::{patch_word, read_word, Relocation, RelocationKind};
use crate::string_table::StringTable;
use crate::text::ZTextEncoder;
use crate::ZVersion;

const HEADER_SIZE: usize = 64;

pub struct Assembler {
    version: ZVersion,
}

struct Layout {
    globals_addr: usize,
    abbrev_addr: usize,
    objects_addr: usize,
    tables_addr: usize,
    extension_addr: usize,
    static_mem_base: usize,
    dict_addr: usize,
    high_mem_base: usize,
    routines_addr: usize,
    strings_addr: usize,
}

impl Assembler {
    pub fn new(version: ZVersion) -> Self {
        Assembler { version }
    }

    fn code_alignment(&self) -> usize {
        // V6-7 packed offsets assume the routine base is a multiple of 8.
        match self.version.number() {
            6 | 7 => 8,
            _ => self.version.alignment(),
        }
    }

    /// Assemble the complete story file.
    pub fn build_story_file(
        &mut self,
        mut output: CodeGenOutput,
    ) -> Result<Vec<u8>, CompilerError> {
        let v = self.version.number();

        // Dictionary bytes and word offsets come first: several
        // relocation kinds resolve against them.
        let dict_data = output.dictionary.build();

        // The string table holds every text referenced by packed address.
        let mut string_table = StringTable::new(self.version);
        {
            let encoder = match &output.abbreviations {
                Some(table) => ZTextEncoder::with_abbreviations(v, table),
                None => ZTextEncoder::new(v),
            };
            for text in &output.strings {
                string_table.add_string(text, &encoder);
            }
        }

        if let Some(table) = output.abbreviations.as_mut() {
            table.encode_strings(v);
        }

        // ------------------------------------------------------------------
        // Layout
        // ------------------------------------------------------------------

        let mut story = vec![0u8; HEADER_SIZE];

        let globals_addr = story.len();
        story.extend_from_slice(&output.globals_data);
        pad_to(&mut story, 2);

        // Abbreviations: the 96-entry pointer table, then the encoded
        // strings (V2+ only).
        let mut abbrev_addr = 0;
        if v >= 2 {
            if let Some(table) = &output.abbreviations {
                if !table.is_empty() {
                    abbrev_addr = story.len();
                    let strings_base = abbrev_addr + 192;
                    story.extend_from_slice(&table.table_bytes(strings_base));
                    for encoded in table.encoded_strings() {
                        story.extend_from_slice(encoded);
                    }
                    pad_to(&mut story, 2);
                }
            }
        }

        pad_to(&mut story, 2);
        let objects_addr = story.len();
        // Property-table pointers inside the object data are relative to
        // its start; rebase them now that the absolute position is known.
        rebase_property_pointers(
            &mut output.objects_data,
            output.prop_defaults_size,
            self.version.object_entry_size(),
            objects_addr,
        );
        story.extend_from_slice(&output.objects_data);
        pad_to(&mut story, 2);

        let tables_addr = story.len();
        story.extend_from_slice(&output.table_data);
        pad_to(&mut story, 2);

        // V5+ header extension table (two zero words minimum).
        let mut extension_addr = 0;
        if v >= 5 {
            extension_addr = story.len();
            story.extend_from_slice(&[0, 0, 0, 0]);
        }

        let static_mem_base = story.len();
        let dict_addr = story.len();
        story.extend_from_slice(&dict_data);

        // High memory: code alignment, V6-7 lead padding so the first
        // routine's packed address is 1.
        pad_to(&mut story, self.code_alignment());
        let high_mem_base = story.len();
        let routines_addr = if matches!(v, 6 | 7) {
            story.extend_from_slice(&[0, 0, 0, 0]);
            high_mem_base + 4
        } else {
            high_mem_base
        };

        // The legacy string-marker format (0x8D FF FE len text) shrinks
        // during resolution; account for it before placing the string
        // table. The current compiler only emits positional relocations,
        // so the delta is normally zero.
        let legacy_delta = legacy_marker_delta(&output.routines_code);
        let final_routines_len = output.routines_code.len() - legacy_delta;

        let mut strings_addr = routines_addr + final_routines_len;
        while strings_addr % self.code_alignment() != 0 {
            strings_addr += 1;
        }
        string_table.set_base_address(strings_addr);
        if matches!(v, 6 | 7) {
            string_table.set_strings_offset(high_mem_base / 8);
        }

        let layout = Layout {
            globals_addr,
            abbrev_addr,
            objects_addr,
            tables_addr,
            extension_addr,
            static_mem_base,
            dict_addr,
            high_mem_base,
            routines_addr,
            strings_addr,
        };

        // ------------------------------------------------------------------
        // Fix-up sequence
        // ------------------------------------------------------------------

        // 1-2. Table-base and dictionary-base cells in the globals block.
        self.resolve_region(
            &mut story,
            layout.globals_addr,
            &output.global_relocations,
            &layout,
            &output,
            &string_table,
            &dict_data,
        )?;

        // Relocations inside user tables (table-to-table references,
        // routine addresses in ACTIONS, vocabulary words, strings).
        self.resolve_region(
            &mut story,
            layout.tables_addr,
            &output.table_relocations,
            &layout,
            &output,
            &string_table,
            &dict_data,
        )?;

        // Property-table placeholders (SYNONYM/ADJECTIVE/VOC words,
        // packed strings, routine values).
        self.resolve_region(
            &mut story,
            layout.objects_addr,
            &output.object_relocations,
            &layout,
            &output,
            &string_table,
            &dict_data,
        )?;

        // 5-7. Legacy string markers, then the routine stream's own
        // relocations (calls, TELL strings, string operands, vocabulary).
        let mut routines = std::mem::take(&mut output.routines_code);
        if legacy_delta > 0 {
            routines = resolve_legacy_markers(&routines, &string_table)?;
        }
        let code_base = layout.routines_addr;
        story.extend_from_slice(&routines);
        self.resolve_region(
            &mut story,
            code_base,
            &output.code_relocations,
            &layout,
            &output,
            &string_table,
            &dict_data,
        )?;

        // 8. String table after the routines.
        if !string_table.is_empty() {
            pad_to(&mut story, self.code_alignment());
            debug_assert_eq!(story.len(), layout.strings_addr);
            story.extend_from_slice(string_table.encoded_data());
        }

        pad_to(&mut story, self.version.file_divisor());

        // 9. Header.
        self.write_header(&mut story, &layout, &output)?;

        // 10. Checksum and file length.
        let divisor = self.version.file_divisor();
        let max_size = 65535 * divisor;
        if story.len() > max_size {
            return Err(CompilerError::StoryTooLarge(v, story.len(), max_size));
        }
        let file_length = (story.len() / divisor) as u16;
        patch_word(&mut story, 0x1A, file_length);

        let checksum = story[HEADER_SIZE..]
            .iter()
            .fold(0u16, |acc, &b| acc.wrapping_add(b as u16));
        patch_word(&mut story, 0x1C, checksum);

        debug!(
            "story file: {} bytes, checksum 0x{:04x}, static at 0x{:04x}, high at 0x{:04x}",
            story.len(),
            checksum,
            layout.static_mem_base,
            layout.high_mem_base
        );
        Ok(story)
    }

    /// Resolve one region's relocation list against the final layout.
    /// Offsets are relative to `base` within the story buffer.
    #[allow(clippy::too_many_arguments)]
    fn resolve_region(
        &self,
        story: &mut [u8],
        base: usize,
        relocations: &[Relocation],
        layout: &Layout,
        output: &CodeGenOutput,
        string_table: &StringTable,
        _dict_data: &[u8],
    ) -> Result<(), CompilerError> {
        for reloc in relocations {
            let at = base + reloc.offset;
            let value = match &reloc.kind {
                RelocationKind::TableBase { table } => {
                    let offset = output.table_offsets.get(table).ok_or_else(|| {
                        CompilerError::CodeGenError(format!("unknown table #{}", table))
                    })?;
                    (layout.tables_addr + offset) as u16
                }
                RelocationKind::DictBase => layout.dict_addr as u16,
                RelocationKind::RoutineCall { routine } => {
                    let offset = output.routine_offsets.get(routine).ok_or_else(|| {
                        CompilerError::CodeGenError(format!("undefined routine {}", routine))
                    })?;
                    self.pack_routine(layout, *offset)
                }
                RelocationKind::PrintPaddr { text } | RelocationKind::StringOperand { text } => {
                    string_table.packed_address_of(text).ok_or_else(|| {
                        CompilerError::CodeGenError(format!(
                            "string {:?} missing from the string table",
                            text
                        ))
                    })?
                }
                RelocationKind::DictionaryWord { word }
                | RelocationKind::PropertySynonym { word }
                | RelocationKind::PropertyAdjective { word }
                | RelocationKind::PropertyVoc { word } => {
                    let offset = output.dictionary.word_offset(word).ok_or_else(|| {
                        CompilerError::CodeGenError(format!(
                            "word {:?} missing from the dictionary",
                            word
                        ))
                    })?;
                    (layout.dict_addr + offset) as u16
                }
            };
            patch_word(story, at, value);
        }
        Ok(())
    }

    fn pack_routine(&self, layout: &Layout, offset: usize) -> u16 {
        let addr = layout.routines_addr + offset;
        match self.version.number() {
            1..=3 => (addr / 2) as u16,
            4 | 5 => (addr / 4) as u16,
            6 | 7 => {
                // routines_offset = high_mem_base / 8; the 4-byte lead
                // padding puts the first routine at packed address 1.
                ((addr - layout.high_mem_base) / 4) as u16
            }
            _ => (addr / 8) as u16,
        }
    }

    fn write_header(
        &self,
        story: &mut [u8],
        layout: &Layout,
        output: &CodeGenOutput,
    ) -> Result<(), CompilerError> {
        let v = self.version.number();
        story[0x00] = v;
        story[0x01] = 0;

        patch_word(story, 0x04, layout.high_mem_base as u16);

        // Initial PC: byte address of the first instruction of the first
        // routine (V1-5/V8), or the first routine's packed address (V6-7).
        let initial_pc = if matches!(v, 6 | 7) {
            1
        } else {
            let header_len = if v <= 4 {
                let locals = story
                    .get(layout.routines_addr)
                    .map(|b| (b & 0x0F) as usize)
                    .unwrap_or(0);
                1 + locals * 2
            } else {
                1
            };
            (layout.routines_addr + header_len) as u16
        };
        patch_word(story, 0x06, initial_pc);

        patch_word(story, 0x08, layout.dict_addr as u16);
        patch_word(story, 0x0A, layout.objects_addr as u16);
        patch_word(story, 0x0C, layout.globals_addr as u16);
        patch_word(story, 0x0E, layout.static_mem_base as u16);
        patch_word(story, 0x10, 0);

        // Serial number: YYMMDD for V2+ (V1 files carry none).
        if v >= 2 {
            let serial = build_serial();
            story[0x12..0x18].copy_from_slice(&serial);
        }

        patch_word(story, 0x18, layout.abbrev_addr as u16);

        // V5+: terminating-characters table and header extension.
        if v >= 5 {
            if let Some(tchars) = output.tchars_table {
                if let Some(offset) = output.table_offsets.get(&tchars) {
                    patch_word(story, 0x2E, (layout.tables_addr + offset) as u16);
                }
            }
            patch_word(story, 0x36, layout.extension_addr as u16);
        }

        // V6-7 routine and string offsets (in units of 8 bytes).
        if matches!(v, 6 | 7) {
            patch_word(story, 0x28, (layout.high_mem_base / 8) as u16);
            patch_word(story, 0x2A, (layout.high_mem_base / 8) as u16);
        }

        let _ = layout.strings_addr;
        Ok(())
    }
}

/// Object entries carry property-table pointers relative to the object
/// data; make them absolute.
fn rebase_property_pointers(
    objects_data: &mut [u8],
    prop_defaults_size: usize,
    entry_size: usize,
    objects_addr: usize,
) {
    if objects_data.len() <= prop_defaults_size + entry_size {
        return;
    }
    let first_ptr_at = prop_defaults_size + entry_size - 2;
    let first_prop = read_word(objects_data, first_ptr_at) as usize;
    if first_prop <= prop_defaults_size || first_prop > objects_data.len() {
        return;
    }
    let count = (first_prop - prop_defaults_size) / entry_size;
    for i in 0..count {
        let at = prop_defaults_size + i * entry_size + entry_size - 2;
        let relative = read_word(objects_data, at) as usize;
        patch_word(objects_data, at, (objects_addr + relative) as u16);
    }
}

/// Byte shrinkage from legacy `0x8D FF FE <len16> <text>` markers.
fn legacy_marker_delta(routines: &[u8]) -> usize {
    let mut delta = 0;
    let mut i = 0;
    while i + 4 < routines.len() {
        if routines[i] == 0x8D && routines[i + 1] == 0xFF && routines[i + 2] == 0xFE {
            let text_len = routines[i + 3] as usize | ((routines[i + 4] as usize) << 8);
            delta += 2 + text_len;
            i += 5 + text_len;
        } else {
            i += 1;
        }
    }
    delta
}

/// Rewrite legacy markers into real print_paddr instructions. The
/// 0xFFFE sentinel after the opcode is what disambiguates a marker from
/// a legitimate print_paddr operand.
fn resolve_legacy_markers(
    routines: &[u8],
    string_table: &StringTable,
) -> Result<Vec<u8>, CompilerError> {
    let mut out = Vec::with_capacity(routines.len());
    let mut i = 0;
    while i < routines.len() {
        if i + 4 < routines.len()
            && routines[i] == 0x8D
            && routines[i + 1] == 0xFF
            && routines[i + 2] == 0xFE
        {
            let text_len = routines[i + 3] as usize | ((routines[i + 4] as usize) << 8);
            let start = i + 5;
            let end = start + text_len;
            if end > routines.len() {
                return Err(CompilerError::CodeGenError(
                    "truncated legacy string marker".to_string(),
                ));
            }
            let text = String::from_utf8_lossy(&routines[start..end]).into_owned();
            let packed = string_table.packed_address_of(&text).ok_or_else(|| {
                CompilerError::CodeGenError(format!(
                    "legacy marker string {:?} missing from the string table",
                    text
                ))
            })?;
            out.push(0x8D);
            out.push((packed >> 8) as u8);
            out.push((packed & 0xFF) as u8);
            i = end;
        } else {
            out.push(routines[i]);
            i += 1;
        }
    }
    Ok(out)
}

fn pad_to(story: &mut Vec<u8>, alignment: usize) {
    while story.len() % alignment != 0 {
        story.push(0);
    }
}

/// Today's date as YYMMDD ASCII (civil-from-days, no external clock
/// crates).
fn build_serial() -> [u8; 6] {
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let days = (secs / 86400) as i64;

    // Howard Hinnant's civil_from_days
    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = if m <= 2 { y + 1 } else { y };

    let mut serial = [b'0'; 6];
    let yy = (year % 100) as u8;
    serial[0] = b'0' + yy / 10;
    serial[1] = b'0' + yy % 10;
    serial[2] = b'0' + (m / 10) as u8;
    serial[3] = b'0' + (m % 10) as u8;
    serial[4] = b'0' + (d / 10) as u8;
    serial[5] = b'0' + (d % 10) as u8;
    serial
}

#[cfg(test)]
#[path = "assembler_tests.rs"]
mod tests;
