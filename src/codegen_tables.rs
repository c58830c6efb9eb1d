// Globals Block and User Tables
//
// TABLE/ITABLE/LTABLE payloads, the DEFINE-GLOBALS soft-globals table,
// the ACTIONS/PREACTIONS tables built from SYNTAX, the LONG-WORDS?
// table, compile-time table patching, and the global-variables block
// with its placeholder cells.

use indexmap::IndexMap;
use log::debug;

use crate::ast::*;
use crate::codegen::{CodeGen, GlobalInit, TableBuild};
use crate::error::CompilerError;
use crate::relocation::{sentinel, Relocation, RelocationKind};

impl CodeGen {
    pub(crate) fn build_user_tables(&mut self, program: &Program) -> Result<(), CompilerError> {
        // Tables bound to globals: the global's cell gets the table base.
        for global in &program.globals {
            let name = global.name.to_uppercase();
            match &global.value {
                Some(ZilNode::Table(table)) => {
                    let idx = self.register_table(table, Some(name.as_str()))?;
                    self.set_global_init(&name, GlobalInit::Table(idx));
                }
                Some(value) => {
                    let init = self.global_init_for(value);
                    self.set_global_init(&name, init);
                }
                None => {}
            }
        }

        // Tables bound to constants: the name resolves to the base address.
        for constant in &program.constants {
            if let ZilNode::Table(table) = &constant.value {
                let name = constant.name.to_uppercase();
                self.register_table(table, Some(name.as_str()))?;
            }
        }

        // Standalone top-level tables (reachable only via W?/debugging).
        for table in &program.tables {
            self.register_table(table, None)?;
        }

        for define in &program.define_globals {
            self.build_soft_globals(define)?;
        }

        self.build_action_tables(program)?;

        if program.long_words {
            self.build_long_word_table()?;
        }

        Ok(())
    }

    fn set_global_init(&mut self, name: &str, init: GlobalInit) {
        self.global_inits.insert(name.to_string(), init);
    }

    fn global_init_for(&mut self, value: &ZilNode) -> GlobalInit {
        if let Some(number) = self.const_value(value) {
            return GlobalInit::Num(number);
        }
        match value {
            ZilNode::Str(text) => {
                self.intern_string(text);
                GlobalInit::Text(text.clone())
            }
            ZilNode::Atom(name, _) => {
                let upper = name.to_uppercase();
                if self.routine_names.contains(&upper) {
                    GlobalInit::Routine(upper)
                } else if let Some(idx) = self.table_names.get(&upper) {
                    GlobalInit::Table(*idx)
                } else if upper == "VOCAB" {
                    GlobalInit::DictBase
                } else {
                    debug!("global initial value {} not resolvable, using 0", name);
                    GlobalInit::Num(0)
                }
            }
            ZilNode::GlobalVar(name) if name.eq_ignore_ascii_case("VOCAB") => GlobalInit::DictBase,
            other => {
                debug!("global initial value {:?} not resolvable, using 0", other);
                GlobalInit::Num(0)
            }
        }
    }

    /// Encode a table's payload and register it; returns the table index.
    pub(crate) fn register_table(
        &mut self,
        table: &TableNode,
        name: Option<&str>,
    ) -> Result<usize, CompilerError> {
        if let Some(name) = name {
            if let Some(existing) = self.table_names.get(name) {
                return Ok(*existing);
            }
        }

        let byte_elements = table.flags.iter().any(|f| f == "BYTE");
        let length_prefix = table.kind == TableKind::LTable
            || table.flags.iter().any(|f| f == "LENGTH");

        // Expand the element list: ITABLE repeats its values (or zero)
        // to the declared count.
        let mut elements: Vec<ZilNode> = Vec::new();
        match table.kind {
            TableKind::ITable => {
                let count = table
                    .size
                    .as_ref()
                    .and_then(|s| self.const_value(s))
                    .unwrap_or(0)
                    .max(0) as usize;
                if table.values.is_empty() {
                    elements.resize(count, ZilNode::Number(0));
                } else {
                    for _ in 0..count {
                        elements.extend(table.values.iter().cloned());
                    }
                }
            }
            _ => elements.extend(table.values.iter().cloned()),
        }

        let mut build = TableBuild::default();

        if length_prefix {
            let count = elements.len() as u16;
            if byte_elements {
                build.bytes.push((count & 0xFF) as u8);
            } else {
                build.bytes.push((count >> 8) as u8);
                build.bytes.push((count & 0xFF) as u8);
            }
        }

        for (i, element) in elements.iter().enumerate() {
            let as_byte = element_is_byte(byte_elements, &table.pattern, i);
            self.encode_table_element(element, as_byte, &mut build)?;
        }

        let idx = self.tables.len();
        if idx > 0xFF {
            return Err(CompilerError::CodeGenError(
                "too many tables (255 addressable)".to_string(),
            ));
        }
        self.tables.push(build);
        if let Some(name) = name {
            self.table_names.insert(name.to_string(), idx);
        }
        debug!(
            "table {} registered as #{} ({} bytes)",
            name.unwrap_or("<anonymous>"),
            idx,
            self.tables[idx].bytes.len()
        );
        Ok(idx)
    }

    fn encode_table_element(
        &mut self,
        element: &ZilNode,
        as_byte: bool,
        build: &mut TableBuild,
    ) -> Result<(), CompilerError> {
        // Values that need relocation are always word-sized.
        match element {
            ZilNode::Str(text) => {
                self.intern_string(text);
                build.relocations.push(Relocation::new(
                    RelocationKind::StringOperand { text: text.clone() },
                    build.bytes.len(),
                ));
                build.bytes.push((sentinel::STRING_OPERAND >> 8) as u8);
                build.bytes.push(0);
                return Ok(());
            }
            ZilNode::Atom(name, _) => {
                let upper = name.to_uppercase();
                if self.routine_names.contains(&upper) {
                    build.relocations.push(Relocation::new(
                        RelocationKind::RoutineCall { routine: upper },
                        build.bytes.len(),
                    ));
                    build.bytes.push(0xFF);
                    build.bytes.push(0xFF);
                    return Ok(());
                }
                if let Some(word) = upper.strip_prefix("W?") {
                    let word = word.to_lowercase();
                    self.dictionary
                        .add_word(&word, crate::dictionary::WordRole::Buzz);
                    build.relocations.push(Relocation::new(
                        RelocationKind::DictionaryWord { word },
                        build.bytes.len(),
                    ));
                    build.bytes.push((sentinel::VOCAB_WORD >> 8) as u8);
                    build.bytes.push(0);
                    return Ok(());
                }
                if let Some(idx) = self.table_names.get(&upper).copied() {
                    build.relocations.push(Relocation::new(
                        RelocationKind::TableBase { table: idx },
                        build.bytes.len(),
                    ));
                    build.bytes.push((sentinel::TABLE_BASE >> 8) as u8);
                    build.bytes.push(idx as u8);
                    return Ok(());
                }
            }
            ZilNode::Table(nested) => {
                let idx = self.register_table(nested, None)?;
                build.relocations.push(Relocation::new(
                    RelocationKind::TableBase { table: idx },
                    build.bytes.len(),
                ));
                build.bytes.push((sentinel::TABLE_BASE >> 8) as u8);
                build.bytes.push(idx as u8);
                return Ok(());
            }
            _ => {}
        }

        let value = self.const_value(element).ok_or_else(|| {
            CompilerError::CodeGenError(format!("cannot encode table value {:?}", element))
        })?;
        if as_byte {
            build.bytes.push((value & 0xFF) as u8);
        } else {
            build.bytes.push(((value as u16) >> 8) as u8);
            build.bytes.push((value as u16 & 0xFF) as u8);
        }
        Ok(())
    }

    /// DEFINE-GLOBALS: one addressable table of word/byte cells. The
    /// table name resolves to its base; each entry name becomes a
    /// constant holding the entry's byte offset.
    fn build_soft_globals(&mut self, define: &DefineGlobalsNode) -> Result<(), CompilerError> {
        let mut build = TableBuild::default();

        for entry in &define.entries {
            let offset = build.bytes.len();
            let value = self.const_value(&entry.value).unwrap_or(0);
            if entry.is_byte {
                build.bytes.push((value & 0xFF) as u8);
            } else {
                build.bytes.push(((value as u16) >> 8) as u8);
                build.bytes.push((value as u16 & 0xFF) as u8);
            }
            self.constants.insert(entry.name.clone(), offset as i32);
        }

        let idx = self.tables.len();
        self.tables.push(build);
        self.table_names.insert(define.table_name.clone(), idx);
        debug!(
            "soft globals table {} registered as #{} with {} entries",
            define.table_name,
            idx,
            define.entries.len()
        );
        Ok(())
    }

    /// ACTIONS and PREACTIONS: packed routine addresses indexed by
    /// action number. The assembler patches them once high memory is
    /// placed.
    fn build_action_tables(&mut self, program: &Program) -> Result<(), CompilerError> {
        if program.syntax.is_empty() {
            return Ok(());
        }

        // Pre-actions keyed by action number.
        let mut preactions: IndexMap<u16, String> = IndexMap::new();
        for syntax in &program.syntax {
            if let Some(pre) = &syntax.preaction {
                let action = syntax.action_routine.to_uppercase();
                if let Some(number) = self.action_numbers.get(&action) {
                    preactions.insert(*number, pre.to_uppercase());
                }
            }
        }

        let mut actions = TableBuild::default();
        let mut pres = TableBuild::default();
        let count = self.action_numbers.len() as u16;

        // Length-prefixed like LTABLEs.
        actions.bytes.push((count >> 8) as u8);
        actions.bytes.push((count & 0xFF) as u8);
        pres.bytes.push((count >> 8) as u8);
        pres.bytes.push((count & 0xFF) as u8);

        let action_list: Vec<(String, u16)> = self
            .action_numbers
            .iter()
            .map(|(name, number)| (name.clone(), *number))
            .collect();
        for (routine, number) in action_list {
            if !self.routine_names.contains(&routine) {
                return Err(CompilerError::CodeGenError(format!(
                    "SYNTAX action routine {} is not defined",
                    routine
                )));
            }
            actions.relocations.push(Relocation::new(
                RelocationKind::RoutineCall {
                    routine: routine.clone(),
                },
                actions.bytes.len(),
            ));
            actions.bytes.push(0xFF);
            actions.bytes.push(0xFF);

            match preactions.get(&number) {
                Some(pre) if self.routine_names.contains(pre) => {
                    pres.relocations.push(Relocation::new(
                        RelocationKind::RoutineCall {
                            routine: pre.clone(),
                        },
                        pres.bytes.len(),
                    ));
                    pres.bytes.push(0xFF);
                    pres.bytes.push(0xFF);
                }
                _ => {
                    pres.bytes.push(0);
                    pres.bytes.push(0);
                }
            }
        }

        let idx = self.tables.len();
        self.tables.push(actions);
        self.table_names.insert("ACTIONS".to_string(), idx);
        let idx = self.tables.len();
        self.tables.push(pres);
        self.table_names.insert("PREACTIONS".to_string(), idx);
        Ok(())
    }

    /// LONG-WORDS?: pairs of (dictionary entry address, packed address
    /// of the word's full text) for words past the encoding cap.
    fn build_long_word_table(&mut self) -> Result<(), CompilerError> {
        let cap = if self.version.number() <= 3 { 6 } else { 9 };
        let long_words: Vec<String> = self
            .dictionary
            .long_words(cap)
            .into_iter()
            .collect();
        if long_words.is_empty() {
            return Ok(());
        }

        let mut build = TableBuild::default();
        let count = long_words.len() as u16;
        build.bytes.push((count >> 8) as u8);
        build.bytes.push((count & 0xFF) as u8);

        for word in long_words {
            build.relocations.push(Relocation::new(
                RelocationKind::DictionaryWord { word: word.clone() },
                build.bytes.len(),
            ));
            build.bytes.push((sentinel::VOCAB_WORD >> 8) as u8);
            build.bytes.push(0);

            self.intern_string(&word);
            build.relocations.push(Relocation::new(
                RelocationKind::StringOperand { text: word.clone() },
                build.bytes.len(),
            ));
            build.bytes.push((sentinel::STRING_OPERAND >> 8) as u8);
            build.bytes.push(0);
        }

        let idx = self.tables.len();
        self.tables.push(build);
        self.table_names.insert("LONG-WORD-TABLE".to_string(), idx);
        debug!("long-word table registered as #{}", idx);
        Ok(())
    }

    /// Top-level ZPUT/PUTB forms patch table payloads before emission.
    pub(crate) fn apply_compile_time_ops(&mut self, program: &Program) -> Result<(), CompilerError> {
        for form in &program.compile_time_ops {
            let op = form
                .operator
                .atom_name()
                .map(|n| n.to_uppercase())
                .unwrap_or_default();
            if op != "ZPUT" && op != "PUTB" {
                continue;
            }
            let Some(table_name) = form
                .operands
                .first()
                .and_then(|n| match n {
                    ZilNode::Atom(a, _) => Some(a.to_uppercase()),
                    ZilNode::GlobalVar(a) => Some(a.to_uppercase()),
                    _ => None,
                })
            else {
                continue;
            };
            let Some(&table_idx) = self.table_names.get(&table_name) else {
                return Err(CompilerError::UndefinedSymbol(table_name, form.pos));
            };
            let index = form
                .operands
                .get(1)
                .and_then(|n| self.const_value(n))
                .unwrap_or(0)
                .max(0) as usize;
            let value = form
                .operands
                .get(2)
                .and_then(|n| self.const_value(n))
                .unwrap_or(0);

            let table = &mut self.tables[table_idx];
            if op == "ZPUT" {
                let at = index * 2;
                if at + 1 < table.bytes.len() {
                    table.bytes[at] = ((value as u16) >> 8) as u8;
                    table.bytes[at + 1] = (value as u16 & 0xFF) as u8;
                }
            } else {
                if index < table.bytes.len() {
                    table.bytes[index] = (value & 0xFF) as u8;
                }
            }
        }
        Ok(())
    }

    /// Concatenate every table, word-aligned, recording offsets and
    /// shifting relocations into the combined data.
    pub(crate) fn layout_tables(
        &mut self,
    ) -> (Vec<u8>, IndexMap<usize, usize>, Vec<Relocation>) {
        let mut data = Vec::new();
        let mut offsets = IndexMap::new();
        let mut relocations = Vec::new();

        for (idx, table) in self.tables.iter().enumerate() {
            if data.len() % 2 != 0 {
                data.push(0);
            }
            let base = data.len();
            offsets.insert(idx, base);
            for reloc in &table.relocations {
                relocations.push(Relocation::new(reloc.kind.clone(), base + reloc.offset));
            }
            data.extend_from_slice(&table.bytes);
        }

        (data, offsets, relocations)
    }

    /// The global-variables block: 240 cells, defined globals first with
    /// their initial values (or placeholders for addresses known only at
    /// assembly).
    pub(crate) fn build_globals_data(&mut self) -> (Vec<u8>, Vec<Relocation>) {
        let mut data = vec![0u8; 240 * 2];
        let mut relocations = Vec::new();

        let inits: Vec<(String, u8)> = self
            .globals
            .iter()
            .map(|(name, number)| (name.clone(), *number))
            .collect();

        for (name, number) in inits {
            let at = (number as usize - 16) * 2;
            match self.global_inits.get(&name) {
                Some(GlobalInit::Num(value)) => {
                    data[at] = ((*value as u16) >> 8) as u8;
                    data[at + 1] = (*value as u16 & 0xFF) as u8;
                }
                Some(GlobalInit::Table(idx)) => {
                    relocations.push(Relocation::new(
                        RelocationKind::TableBase { table: *idx },
                        at,
                    ));
                    data[at] = (sentinel::TABLE_BASE >> 8) as u8;
                    data[at + 1] = *idx as u8;
                }
                Some(GlobalInit::DictBase) => {
                    relocations.push(Relocation::new(RelocationKind::DictBase, at));
                    data[at] = (sentinel::DICT_BASE >> 8) as u8;
                    data[at + 1] = 0;
                }
                Some(GlobalInit::Routine(routine)) => {
                    relocations.push(Relocation::new(
                        RelocationKind::RoutineCall {
                            routine: routine.clone(),
                        },
                        at,
                    ));
                    data[at] = 0xFF;
                    data[at + 1] = 0xFF;
                }
                Some(GlobalInit::Text(text)) => {
                    relocations.push(Relocation::new(
                        RelocationKind::StringOperand { text: text.clone() },
                        at,
                    ));
                    data[at] = (sentinel::STRING_OPERAND >> 8) as u8;
                    data[at + 1] = 0;
                }
                None => {}
            }
        }

        (data, relocations)
    }
}

fn element_is_byte(byte_table: bool, pattern: &[(String, bool)], index: usize) -> bool {
    if let Some(spec) = pattern_type(pattern, index) {
        return spec == "BYTE";
    }
    byte_table
}

fn pattern_type(pattern: &[(String, bool)], index: usize) -> Option<String> {
    if pattern.is_empty() {
        return None;
    }
    if index < pattern.len() {
        return Some(pattern[index].0.clone());
    }
    // A REST-marked trailing group repeats for the remaining elements.
    let rest: Vec<&(String, bool)> = pattern.iter().filter(|(_, r)| *r).collect();
    if rest.is_empty() {
        return pattern.last().map(|(t, _)| t.clone());
    }
    let fixed = pattern.len() - rest.len();
    let i = (index - fixed) % rest.len();
    Some(rest[i].0.clone())
}
