// Z-Machine Code Generation
//
// Lowers routines to bytecode and owns the symbol tables the whole back
// end shares: constants, globals, objects, properties, attribute flags,
// directions, verbs, and the user-table registry. Object-table and
// dictionary construction live in codegen_objects.rs; globals block and
// user tables in codegen_tables.rs.

use std::collections::HashSet;

use indexmap::IndexMap;
use log::debug;

use crate::ast::*;
use crate::codegen_instructions::{Branch, BranchTarget, OpFamily, Operand, RoutineBuilder};
use crate::dictionary::Dictionary;
use crate::error::{CompilerError, SourcePos};
use crate::object_table::ObjectTable;
use crate::opcodes::{one_op, two_op, var, zero_op};
use crate::relocation::{sentinel, Relocation, RelocationKind};
use crate::text::ZTextEncoder;
use crate::ZVersion;

/// An operand together with the relocation its placeholder bytes need.
#[derive(Debug, Clone)]
pub struct ROperand {
    pub op: Operand,
    pub reloc: Option<RelocationKind>,
}

impl ROperand {
    fn plain(op: Operand) -> Self {
        ROperand { op, reloc: None }
    }

    fn constant(value: i32) -> Self {
        ROperand::plain(Operand::constant(value))
    }
}

/// How a global variable's initial 16-bit cell is filled.
#[derive(Debug, Clone)]
pub enum GlobalInit {
    Num(i32),
    /// Base address of a registered user table.
    Table(usize),
    /// Base address of the dictionary (the VOCAB global).
    DictBase,
    /// Packed address of a routine.
    Routine(String),
    /// Packed address of a deduplicated string.
    Text(String),
}

/// A user table after value encoding: raw bytes plus relocations
/// relative to the table's own start.
#[derive(Debug, Clone, Default)]
pub struct TableBuild {
    pub bytes: Vec<u8>,
    pub relocations: Vec<Relocation>,
}

/// Everything the assembler needs from code generation.
#[derive(Debug)]
pub struct CodeGenOutput {
    pub routines_code: Vec<u8>,
    pub routine_offsets: IndexMap<String, usize>,
    pub code_relocations: Vec<Relocation>,
    pub globals_data: Vec<u8>,
    pub global_relocations: Vec<Relocation>,
    pub objects_data: Vec<u8>,
    pub object_relocations: Vec<Relocation>,
    pub prop_defaults_size: usize,
    pub table_data: Vec<u8>,
    pub table_offsets: IndexMap<usize, usize>,
    pub table_relocations: Vec<Relocation>,
    pub dictionary: Dictionary,
    /// Texts referenced by packed address, in first-use order.
    pub strings: Vec<String>,
    pub abbreviations: Option<crate::abbreviations::AbbreviationsTable>,
    /// Index of the TCHARS table (terminating characters, header 0x2E).
    pub tchars_table: Option<usize>,
}

pub struct CodeGen {
    pub version: ZVersion,
    /// When set, TELL string literals lower to PRINT_PADDR through the
    /// deduplicated string table instead of inline PRINTI text.
    pub string_dedup: bool,

    // Symbol tables, populated by the pre-pass and read-only afterwards
    pub constants: IndexMap<String, i32>,
    pub globals: IndexMap<String, u8>,
    pub(crate) global_inits: IndexMap<String, GlobalInit>,
    pub routine_names: HashSet<String>,
    pub object_numbers: IndexMap<String, u16>,
    pub properties: IndexMap<String, u8>,
    next_property: u8,
    /// PROPDEF patterns by property name (cleared specs excluded).
    pub(crate) propdef_patterns: IndexMap<String, Vec<Vec<ZilNode>>>,
    pub flags: IndexMap<String, u16>,
    pub directions: IndexMap<String, u8>,
    pub verb_numbers: IndexMap<String, u8>,
    pub action_numbers: IndexMap<String, u16>,
    /// Verb word -> action number of its first syntax line (VERB? tests).
    pub verb_actions: IndexMap<String, u16>,
    /// Abbreviation table used when encoding inline PRINTI text; its
    /// contents are final before code generation starts.
    pub abbreviations: Option<crate::abbreviations::AbbreviationsTable>,

    pub tables: Vec<TableBuild>,
    pub table_names: IndexMap<String, usize>,

    pub dictionary: Dictionary,
    pub object_table: ObjectTable,

    // Per-routine state
    local_slots: IndexMap<String, u8>,
    loop_stack: Vec<u32>,
    current_routine: String,

    // Outputs
    routines_code: Vec<u8>,
    routine_offsets: IndexMap<String, usize>,
    code_relocations: Vec<Relocation>,
    strings: Vec<String>,
    string_set: HashSet<String>,

    tell_tokens: Vec<TellTokenDef>,
}

impl CodeGen {
    pub fn new(version: ZVersion, string_dedup: bool) -> Self {
        CodeGen {
            version,
            string_dedup,
            constants: IndexMap::new(),
            globals: IndexMap::new(),
            global_inits: IndexMap::new(),
            routine_names: HashSet::new(),
            object_numbers: IndexMap::new(),
            properties: IndexMap::new(),
            next_property: 3,
            propdef_patterns: IndexMap::new(),
            flags: IndexMap::new(),
            directions: IndexMap::new(),
            verb_numbers: IndexMap::new(),
            action_numbers: IndexMap::new(),
            verb_actions: IndexMap::new(),
            abbreviations: None,
            tables: Vec::new(),
            table_names: IndexMap::new(),
            dictionary: Dictionary::new(version),
            object_table: ObjectTable::new(version),
            local_slots: IndexMap::new(),
            loop_stack: Vec::new(),
            current_routine: String::new(),
            routines_code: Vec::new(),
            routine_offsets: IndexMap::new(),
            code_relocations: Vec::new(),
            strings: Vec::new(),
            string_set: HashSet::new(),
            tell_tokens: Vec::new(),
        }
    }

    /// Record a string referenced by packed address.
    pub fn intern_string(&mut self, text: &str) {
        if self.string_set.insert(text.to_string()) {
            self.strings.push(text.to_string());
        }
    }

    /// Run every phase over an expanded program.
    pub fn generate(mut self, program: &Program) -> Result<CodeGenOutput, CompilerError> {
        self.tell_tokens = program.tell_tokens.clone();

        self.collect_symbols(program)?;
        self.populate_dictionary(program)?;
        self.build_objects(program)?;
        self.build_user_tables(program)?;
        self.apply_compile_time_ops(program)?;
        self.emit_routines(program)?;

        let (globals_data, global_relocations) = self.build_globals_data();
        let (objects_data, object_relocations) = self.object_table.build();
        let (table_data, table_offsets, table_relocations) = self.layout_tables();
        let tchars_table = self.table_names.get("TCHARS").copied();

        Ok(CodeGenOutput {
            routines_code: self.routines_code,
            routine_offsets: self.routine_offsets,
            code_relocations: self.code_relocations,
            globals_data,
            global_relocations,
            objects_data,
            object_relocations,
            prop_defaults_size: self.object_table.defaults_size(),
            table_data,
            table_offsets,
            table_relocations,
            dictionary: self.dictionary,
            strings: self.strings,
            abbreviations: self.abbreviations,
            tchars_table,
        })
    }

    // ------------------------------------------------------------------
    // Symbol pre-pass
    // ------------------------------------------------------------------

    fn collect_symbols(&mut self, program: &Program) -> Result<(), CompilerError> {
        // Directions claim the top of the property space.
        let max_props = self.version.max_properties();
        for (i, name) in program.directions.iter().enumerate() {
            let prop = max_props as i32 - i as i32;
            if prop < 1 {
                return Err(CompilerError::CodeGenError(format!(
                    "too many directions for version {} ({} allowed)",
                    self.version.number(),
                    max_props
                )));
            }
            self.directions.insert(name.to_uppercase(), prop as u8);
        }
        if let Some(lowest) = self.directions.values().min() {
            self.constants
                .insert("LOW-DIRECTION".to_string(), *lowest as i32);
        }

        // Standard property slots; PROPDEFs and unknown properties follow.
        self.properties.insert("DESC".to_string(), 1);
        self.properties.insert("LDESC".to_string(), 2);

        for propdef in &program.propdefs {
            if program.cleared_propspecs.contains(&propdef.name) {
                continue;
            }
            if !self.properties.contains_key(&propdef.name) {
                let num = self.allocate_property(&propdef.name)?;
                debug!("PROPDEF {} -> property #{}", propdef.name, num);
            }
            if let Some(default) = &propdef.default {
                if let Some(value) = self.const_value(default) {
                    let num = self.properties[&propdef.name];
                    self.object_table.set_property_default(num, value as u16);
                }
            }
            if !propdef.patterns.is_empty() {
                self.propdef_patterns
                    .insert(propdef.name.clone(), propdef.patterns.clone());
            }
        }

        for routine in &program.routines {
            self.routine_names.insert(routine.name.to_uppercase());
        }

        // Constants: evaluate numeric values; table-valued constants are
        // registered as named tables during table building.
        for constant in &program.constants {
            let name = constant.name.to_uppercase();
            if let Some(value) = self.const_value(&constant.value) {
                self.constants.entry(name).or_insert(value);
            }
        }

        // Attribute flags: constants may pin bits, everything else is
        // assigned in first-use order. BIT-SYNONYM aliases share bits.
        for object in object_iter(program) {
            if let Some(prop) = object.property("FLAGS") {
                for value in &prop.values {
                    if let Some(flag) = value.atom_name() {
                        self.allocate_flag(&flag.to_uppercase())?;
                    }
                }
            }
        }
        for (original, alias) in &program.bit_synonyms {
            let bit = self.allocate_flag(original)?;
            self.flags.insert(alias.clone(), bit);
        }

        // Object numbering per ORDER-OBJECTS?; definition order is
        // recovered from source positions.
        let ordered = self.ordered_objects(program);
        for def in &ordered {
            let next = self.object_numbers.len() as u16 + 1;
            self.object_numbers.insert(def.name.to_uppercase(), next);
        }

        // Globals: variables 16 upward.
        for global in &program.globals {
            let name = global.name.to_uppercase();
            if self.globals.contains_key(&name) {
                continue;
            }
            let number = 16 + self.globals.len();
            if number > 255 {
                return Err(CompilerError::CodeGenError(
                    "too many global variables (240 allowed)".to_string(),
                ));
            }
            self.globals.insert(name, number as u8);
        }

        // Verb and action numbering from SYNTAX, verbs counting down
        // from 255 in first-seen order.
        for syntax in &program.syntax {
            let Some(verb) = syntax.pattern.first() else {
                continue;
            };
            let verb = verb.to_uppercase();
            if !self.verb_numbers.contains_key(&verb) {
                let number = 255 - self.verb_numbers.len();
                if number < 1 {
                    return Err(CompilerError::CodeGenError(
                        "too many verbs (255 allowed)".to_string(),
                    ));
                }
                self.verb_numbers.insert(verb.clone(), number as u8);
            }
            let action = syntax.action_routine.to_uppercase();
            if !self.action_numbers.contains_key(&action) {
                let next = self.action_numbers.len() as u16;
                self.action_numbers.insert(action.clone(), next);
            }
            let action_number = self.action_numbers[&action];
            self.verb_actions.entry(verb).or_insert(action_number);
        }

        debug!(
            "symbols: {} constants, {} globals, {} objects, {} flags, {} verbs",
            self.constants.len(),
            self.globals.len(),
            self.object_numbers.len(),
            self.flags.len(),
            self.verb_numbers.len()
        );
        Ok(())
    }

    pub(crate) fn ordered_objects<'p>(&self, program: &'p Program) -> Vec<&'p ObjectDef> {
        let mut combined: Vec<(&ObjectDef, bool)> = Vec::new();
        for room in &program.rooms {
            combined.push((room, true));
        }
        for object in &program.objects {
            combined.push((object, false));
        }
        // Source position recovers definition order across the two pools.
        combined.sort_by_key(|(def, _)| (def.pos.line, def.pos.column));

        match program.order_objects {
            OrderObjects::Defined => combined.into_iter().map(|(d, _)| d).collect(),
            OrderObjects::ReverseDefined => combined.into_iter().rev().map(|(d, _)| d).collect(),
            OrderObjects::RoomsFirst => {
                let mut out: Vec<&ObjectDef> = combined
                    .iter()
                    .filter(|(_, is_room)| *is_room)
                    .map(|(d, _)| *d)
                    .collect();
                out.extend(
                    combined
                        .iter()
                        .filter(|(_, is_room)| !*is_room)
                        .map(|(d, _)| *d),
                );
                out
            }
        }
    }

    fn allocate_property(&mut self, name: &str) -> Result<u8, CompilerError> {
        let name = name.to_uppercase();
        if let Some(num) = self.properties.get(&name) {
            return Ok(*num);
        }
        // Skip numbers the directions own.
        let lowest_direction = self.directions.values().min().copied().unwrap_or(u8::MAX);
        let mut candidate = self.next_property;
        while candidate >= lowest_direction {
            candidate += 1;
        }
        if candidate > self.version.max_properties() || candidate >= lowest_direction {
            return Err(CompilerError::CodeGenError(format!(
                "out of property numbers (1..{}) assigning {}",
                self.version.max_properties(),
                name
            )));
        }
        self.next_property = candidate + 1;
        self.properties.insert(name, candidate);
        Ok(candidate)
    }

    pub(crate) fn property_number(&mut self, name: &str) -> Result<u8, CompilerError> {
        let upper = name.to_uppercase();
        if let Some(num) = self.directions.get(&upper) {
            return Ok(*num);
        }
        self.allocate_property(&upper)
    }

    fn allocate_flag(&mut self, name: &str) -> Result<u16, CompilerError> {
        let name = name.to_uppercase();
        if let Some(bit) = self.flags.get(&name) {
            return Ok(*bit);
        }
        // A constant with the flag's name pins its bit number.
        let bit = match self.constants.get(&name) {
            Some(value) => *value as u16,
            None => {
                let used: HashSet<u16> = self.flags.values().copied().collect();
                let mut bit = 0;
                while used.contains(&bit) {
                    bit += 1;
                }
                bit
            }
        };
        let max = self.version.max_attributes();
        if bit >= max {
            return Err(CompilerError::AttributeOutOfRange(name, bit, max - 1));
        }
        self.flags.insert(name, bit);
        Ok(bit)
    }

    /// Fold an expression to a compile-time number when possible.
    pub(crate) fn const_value(&self, node: &ZilNode) -> Option<i32> {
        match node {
            ZilNode::Number(n) => Some(*n),
            ZilNode::Atom(name, _) => {
                let upper = name.to_uppercase();
                if upper == "T" {
                    return Some(1);
                }
                if let Some(v) = self.constants.get(&upper) {
                    return Some(*v);
                }
                if let Some(n) = self.object_numbers.get(&upper) {
                    return Some(*n as i32);
                }
                if let Some(p) = self.directions.get(&upper) {
                    return Some(*p as i32);
                }
                None
            }
            ZilNode::GlobalVar(name) => self.constants.get(&name.to_uppercase()).copied(),
            node if node.is_false() => Some(0),
            ZilNode::Form(form) => {
                let op = form.operator.atom_name()?.to_uppercase();
                let mut values = Vec::new();
                for operand in &form.operands {
                    values.push(self.const_value(operand)?);
                }
                match (op.as_str(), values.len()) {
                    ("+", _) => Some(values.iter().sum()),
                    ("-", 1) => Some(-values[0]),
                    ("-", _) if !values.is_empty() => {
                        Some(values[0] - values[1..].iter().sum::<i32>())
                    }
                    ("*", _) => Some(values.iter().product()),
                    ("/", 2) if values[1] != 0 => Some(values[0] / values[1]),
                    ("MOD", 2) if values[1] != 0 => Some(values[0] % values[1]),
                    ("BAND", 2) => Some(values[0] & values[1]),
                    ("BOR", 2) => Some(values[0] | values[1]),
                    ("LSH", 2) => Some(values[0].wrapping_shl(values[1].max(0) as u32)),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Routine emission
    // ------------------------------------------------------------------

    fn emit_routines(&mut self, program: &Program) -> Result<(), CompilerError> {
        // GO supplies the initial PC, so it is laid out first.
        let mut order: Vec<&RoutineNode> = Vec::new();
        for routine in &program.routines {
            if routine.name.eq_ignore_ascii_case("GO") {
                order.insert(0, routine);
            } else {
                order.push(routine);
            }
        }

        for routine in order {
            self.emit_routine(routine)?;
        }
        Ok(())
    }

    fn emit_routine(&mut self, routine: &RoutineNode) -> Result<(), CompilerError> {
        // Pass 1: discovery. Locals are parameters, then OPT parameters,
        // then AUX variables, then loop/block bindings found in the body.
        self.local_slots.clear();
        self.loop_stack.clear();
        self.current_routine = routine.name.to_uppercase();

        let mut slot = 1u8;
        let mut local_names: Vec<String> = Vec::new();
        for name in routine
            .required_params
            .iter()
            .chain(&routine.opt_params)
            .chain(&routine.aux_vars)
        {
            local_names.push(name.to_uppercase());
        }
        for stmt in &routine.body {
            collect_block_bindings(stmt, &mut local_names);
        }
        local_names.dedup();

        for name in &local_names {
            if self.local_slots.contains_key(name) {
                continue;
            }
            if slot > 15 {
                return Err(CompilerError::TooManyLocals(
                    routine.name.clone(),
                    local_names.len(),
                ));
            }
            self.local_slots.insert(name.clone(), slot);
            slot += 1;
        }
        let local_count = self.local_slots.len() as u8;

        // Alignment so the routine's packed address is exact.
        let alignment = self.version.alignment();
        while self.routines_code.len() % alignment != 0 {
            self.routines_code.push(0);
        }
        let offset = self.routines_code.len();
        self.routine_offsets
            .insert(routine.name.to_uppercase(), offset);
        debug!(
            "routine {} at code offset 0x{:04x}, {} locals",
            routine.name, offset, local_count
        );

        // Header: local count, then one 16-bit default per local (V1-4).
        self.routines_code.push(local_count);
        if self.version.number() <= 4 {
            let slots: Vec<(String, u8)> = self
                .local_slots
                .iter()
                .map(|(n, s)| (n.clone(), *s))
                .collect();
            for (name, _) in slots {
                let default = routine
                    .local_defaults
                    .get(&name)
                    .and_then(|d| self.const_value(d))
                    .unwrap_or(0);
                self.routines_code.push((default >> 8) as u8);
                self.routines_code.push((default & 0xFF) as u8);
            }
        }

        // Pass 2: lower the body.
        let mut rb = RoutineBuilder::new();

        // V5+ has no header defaults; initialise non-zero ones explicitly.
        if self.version.number() >= 5 {
            let defaults: Vec<(String, i32)> = routine
                .local_defaults
                .iter()
                .filter_map(|(name, node)| {
                    let value = self.const_value(node)?;
                    if value != 0 {
                        Some((name.to_uppercase(), value))
                    } else {
                        None
                    }
                })
                .collect();
            for (name, value) in defaults {
                if let Some(slot) = self.local_slots.get(&name).copied() {
                    rb.emit(
                        OpFamily::Op2,
                        two_op::STORE,
                        &[Operand::SmallConstant(slot), Operand::constant(value)],
                        None,
                        None,
                    )?;
                }
            }
        }

        for stmt in &routine.body {
            self.gen_stmt(stmt, &mut rb)?;
        }

        // Implicit return for routines that run off the end.
        rb.emit(OpFamily::Op0, zero_op::RTRUE, &[], None, None)?;
        rb.finish()?;

        let body_offset = self.routines_code.len();
        for reloc in rb.relocations.drain(..) {
            self.code_relocations.push(Relocation::new(
                reloc.kind,
                body_offset + reloc.offset,
            ));
        }
        self.routines_code.extend_from_slice(&rb.code);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Operand resolution
    // ------------------------------------------------------------------

    /// Resolve a node into an instruction operand, emitting code for
    /// nested forms (whose value lands on the stack).
    fn resolve_operand(
        &mut self,
        node: &ZilNode,
        rb: &mut RoutineBuilder,
    ) -> Result<ROperand, CompilerError> {
        match node {
            ZilNode::Number(n) => Ok(ROperand::constant(*n)),
            ZilNode::LocalVar(name) => {
                let slot = self.local_slot(name, node.pos())?;
                Ok(ROperand::plain(Operand::Variable(slot)))
            }
            ZilNode::GlobalVar(name) => self.resolve_global_ref(name, node.pos()),
            ZilNode::Str(text) => {
                self.intern_string(text);
                Ok(ROperand {
                    op: Operand::LargeConstant(sentinel::STRING_OPERAND),
                    reloc: Some(RelocationKind::StringOperand { text: text.clone() }),
                })
            }
            ZilNode::Atom(name, pos) => self.resolve_atom(name, *pos),
            ZilNode::Quote(inner) => self.resolve_operand(inner, rb),
            node if node.is_false() => Ok(ROperand::constant(0)),
            ZilNode::Form(_) | ZilNode::Cond(_) => {
                let op = self.gen_expr(node, rb)?;
                Ok(ROperand::plain(op))
            }
            other => Err(CompilerError::CodeGenError(format!(
                "cannot use {:?} as an operand",
                other
            ))),
        }
    }

    fn local_slot(&self, name: &str, pos: SourcePos) -> Result<u8, CompilerError> {
        self.local_slots
            .get(&name.to_uppercase())
            .copied()
            .ok_or_else(|| CompilerError::UndefinedSymbol(format!(".{}", name), pos))
    }

    fn resolve_global_ref(&mut self, name: &str, pos: SourcePos) -> Result<ROperand, CompilerError> {
        let upper = name.to_uppercase();
        if let Some(number) = self.globals.get(&upper) {
            return Ok(ROperand::plain(Operand::Variable(*number)));
        }
        // ,CONSTANT is tolerated where the constant's value is meant.
        if let Some(value) = self.constants.get(&upper) {
            return Ok(ROperand::constant(*value));
        }
        if let Some(idx) = self.table_names.get(&upper) {
            return Ok(ROperand {
                op: Operand::LargeConstant(sentinel::TABLE_BASE | (*idx as u16 & 0xFF)),
                reloc: Some(RelocationKind::TableBase { table: *idx }),
            });
        }
        if upper == "VOCAB" {
            return Ok(ROperand {
                op: Operand::LargeConstant(sentinel::DICT_BASE),
                reloc: Some(RelocationKind::DictBase),
            });
        }
        Err(CompilerError::UndefinedSymbol(format!(",{}", name), pos))
    }

    fn resolve_atom(&mut self, name: &str, pos: SourcePos) -> Result<ROperand, CompilerError> {
        let upper = name.to_uppercase();

        if upper == "T" {
            return Ok(ROperand::constant(1));
        }
        if upper == "<>" {
            return Ok(ROperand::constant(0));
        }

        // W?WORD - address of a dictionary word
        if let Some(word) = upper.strip_prefix("W?") {
            let word = word.to_lowercase();
            self.dictionary
                .add_word(&word, crate::dictionary::WordRole::Buzz);
            return Ok(ROperand {
                op: Operand::LargeConstant(sentinel::VOCAB_WORD),
                reloc: Some(RelocationKind::DictionaryWord { word }),
            });
        }

        if let Some(value) = self.constants.get(&upper) {
            return Ok(ROperand::constant(*value));
        }
        if let Some(number) = self.object_numbers.get(&upper) {
            return Ok(ROperand::constant(*number as i32));
        }
        if self.routine_names.contains(&upper) {
            return Ok(ROperand {
                op: Operand::LargeConstant(sentinel::ROUTINE_CALL),
                reloc: Some(RelocationKind::RoutineCall { routine: upper }),
            });
        }
        if let Some(bit) = self.flags.get(&upper) {
            return Ok(ROperand::constant(*bit as i32));
        }
        if let Some(prop) = self.directions.get(&upper) {
            return Ok(ROperand::constant(*prop as i32));
        }
        if let Some(prop) = self.properties.get(&upper) {
            return Ok(ROperand::constant(*prop as i32));
        }
        if let Some(idx) = self.table_names.get(&upper) {
            return Ok(ROperand {
                op: Operand::LargeConstant(sentinel::TABLE_BASE | (*idx as u16 & 0xFF)),
                reloc: Some(RelocationKind::TableBase { table: *idx }),
            });
        }
        if let Some(number) = self.globals.get(&upper) {
            // Bare atom naming a global: its variable number (GETB/PUT
            // style accesses on variables)
            return Ok(ROperand::constant(*number as i32));
        }

        Err(CompilerError::UndefinedSymbol(name.to_string(), pos))
    }

    fn emit_with_relocs(
        &mut self,
        rb: &mut RoutineBuilder,
        family: OpFamily,
        opcode: u8,
        operands: &[ROperand],
        store: Option<u8>,
        branch: Option<Branch>,
    ) -> Result<(), CompilerError> {
        let plain: Vec<Operand> = operands.iter().map(|o| o.op).collect();
        let positions = rb.emit(family, opcode, &plain, store, branch)?;
        for (operand, position) in operands.iter().zip(positions) {
            if let Some(kind) = &operand.reloc {
                rb.relocations
                    .push(Relocation::new(kind.clone(), position));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Statements and expressions
    // ------------------------------------------------------------------

    /// Lower a form for side effects; any produced value is discarded.
    pub(crate) fn gen_stmt(
        &mut self,
        node: &ZilNode,
        rb: &mut RoutineBuilder,
    ) -> Result<(), CompilerError> {
        match node {
            ZilNode::Cond(cond) => self.gen_cond(cond, rb, false).map(|_| ()),
            ZilNode::Repeat(repeat) => self.gen_repeat(repeat, rb),
            ZilNode::Form(form) => self.gen_form(form, rb, false).map(|_| ()),
            // Bare atoms / literals as statements are no-ops
            _ => Ok(()),
        }
    }

    /// Lower a node for its value; the result is returned as an operand
    /// (computed values land on the stack).
    pub(crate) fn gen_expr(
        &mut self,
        node: &ZilNode,
        rb: &mut RoutineBuilder,
    ) -> Result<Operand, CompilerError> {
        match node {
            ZilNode::Cond(cond) => {
                self.gen_cond(cond, rb, true)?;
                Ok(Operand::stack())
            }
            ZilNode::Form(form) => match self.gen_form(form, rb, true)? {
                Some(op) => Ok(op),
                None => Ok(Operand::SmallConstant(1)),
            },
            other => {
                let resolved = self.resolve_operand(other, rb)?;
                if resolved.reloc.is_some() {
                    // Placeholder operands must flow through an
                    // instruction; push through the stack.
                    self.emit_with_relocs(
                        rb,
                        OpFamily::Var,
                        var::PUSH,
                        &[resolved],
                        None,
                        None,
                    )?;
                    Ok(Operand::stack())
                } else {
                    Ok(resolved.op)
                }
            }
        }
    }

    /// Lower a form. Returns the operand holding its value when
    /// `want_value` and the form produces one.
    fn gen_form(
        &mut self,
        form: &FormNode,
        rb: &mut RoutineBuilder,
        want_value: bool,
    ) -> Result<Option<Operand>, CompilerError> {
        let Some(op_name) = form.operator.atom_name() else {
            return Err(CompilerError::CodeGenError(
                "form operator must be an atom".to_string(),
            ));
        };
        let op = op_name.to_uppercase();
        let args = &form.operands;

        // Value-producing 2OP arithmetic and table/property reads
        if let Some((family, opcode)) = store_op(&op) {
            let mut operands = Vec::with_capacity(args.len());
            for arg in args {
                operands.push(self.resolve_operand(arg, rb)?);
            }
            let expected = match family {
                OpFamily::Op2 => 2,
                OpFamily::Op1 => 1,
                _ => operands.len(),
            };
            if operands.len() != expected {
                return Err(CompilerError::CodeGenError(format!(
                    "{} takes {} operand(s), got {} at {}",
                    op,
                    expected,
                    operands.len(),
                    form.pos
                )));
            }
            self.emit_with_relocs(rb, family, opcode, &operands, Some(0), None)?;
            return Ok(Some(Operand::stack()));
        }

        // Predicates in value position produce 1 or 0
        if is_predicate(&op) {
            if want_value {
                let true_label = rb.new_label();
                let end_label = rb.new_label();
                self.gen_condition(&ZilNode::Form(form.clone()), rb, true_label, true)?;
                self.emit_with_relocs(
                    rb,
                    OpFamily::Var,
                    var::PUSH,
                    &[ROperand::constant(0)],
                    None,
                    None,
                )?;
                rb.emit_jump(end_label);
                rb.place_label(true_label);
                self.emit_with_relocs(
                    rb,
                    OpFamily::Var,
                    var::PUSH,
                    &[ROperand::constant(1)],
                    None,
                    None,
                )?;
                rb.place_label(end_label);
                return Ok(Some(Operand::stack()));
            } else {
                // Predicate as a statement: evaluate for side effects
                // (DLESS?/IGRTR? mutate), branching nowhere.
                let after = rb.new_label();
                self.gen_condition(&ZilNode::Form(form.clone()), rb, after, true)?;
                rb.place_label(after);
                return Ok(None);
            }
        }

        match op.as_str() {
            // Macro-constructed COND forms carry their clauses as lists
            "COND" => {
                let mut clauses = Vec::new();
                for arg in args {
                    if let ZilNode::List(items) = arg {
                        if let Some((test, body)) = items.split_first() {
                            clauses.push(CondClause {
                                test: test.clone(),
                                body: body.to_vec(),
                            });
                        }
                    }
                }
                let cond = CondNode {
                    clauses,
                    pos: form.pos,
                };
                self.gen_cond(&cond, rb, want_value)?;
                Ok(if want_value { Some(Operand::stack()) } else { None })
            }

            "RTRUE" => {
                rb.emit(OpFamily::Op0, zero_op::RTRUE, &[], None, None)?;
                Ok(None)
            }
            "RFALSE" => {
                rb.emit(OpFamily::Op0, zero_op::RFALSE, &[], None, None)?;
                Ok(None)
            }
            "RETURN" => {
                match args.first() {
                    None => {
                        rb.emit(OpFamily::Op0, zero_op::RTRUE, &[], None, None)?;
                    }
                    Some(value) => {
                        let operand = self.resolve_operand(value, rb)?;
                        self.emit_with_relocs(
                            rb,
                            OpFamily::Op1,
                            one_op::RET,
                            &[operand],
                            None,
                            None,
                        )?;
                    }
                }
                Ok(None)
            }
            "RSTACK" => {
                rb.emit(OpFamily::Op0, zero_op::RET_POPPED, &[], None, None)?;
                Ok(None)
            }
            "AGAIN" => {
                let target = *self.loop_stack.last().ok_or_else(|| {
                    CompilerError::CodeGenError(format!(
                        "AGAIN outside of a loop in routine {}",
                        self.current_routine
                    ))
                })?;
                rb.emit_jump(target);
                Ok(None)
            }
            "QUIT" => {
                rb.emit(OpFamily::Op0, zero_op::QUIT, &[], None, None)?;
                Ok(None)
            }
            "RESTART" => {
                rb.emit(OpFamily::Op0, zero_op::RESTART, &[], None, None)?;
                Ok(None)
            }
            "NOP" => {
                rb.emit(OpFamily::Op0, zero_op::NOP, &[], None, None)?;
                Ok(None)
            }
            "USL" => {
                rb.emit(OpFamily::Op0, zero_op::SHOW_STATUS, &[], None, None)?;
                Ok(None)
            }
            "VERIFY" | "SAVE" | "RESTORE" => {
                // Branch-form 0OPs used as statements: branch to the next
                // instruction either way.
                let opcode = match op.as_str() {
                    "VERIFY" => zero_op::VERIFY,
                    "SAVE" => zero_op::SAVE,
                    _ => zero_op::RESTORE,
                };
                let after = rb.new_label();
                rb.emit(
                    OpFamily::Op0,
                    opcode,
                    &[],
                    None,
                    Some(Branch {
                        target: BranchTarget::Label(after),
                        on_true: true,
                    }),
                )?;
                rb.place_label(after);
                Ok(None)
            }

            "SET" | "SETG" => self.gen_set(args, rb, want_value, form.pos),
            "LVAL" | "GVAL" => {
                // Macro-built variable references: <LVAL X> is .X
                let name = args
                    .first()
                    .and_then(|a| a.atom_name())
                    .ok_or_else(|| {
                        CompilerError::CodeGenError(format!("{} needs a variable name", op))
                    })?;
                let operand = if op == "LVAL" {
                    Operand::Variable(self.local_slot(name, form.pos)?)
                } else {
                    match self.resolve_global_ref(name, form.pos)? {
                        ROperand { op, reloc: None } => op,
                        resolved => {
                            self.emit_with_relocs(rb, OpFamily::Var, var::PUSH, &[resolved], None, None)?;
                            Operand::stack()
                        }
                    }
                };
                Ok(Some(operand))
            }
            "VALUE" => {
                // <VALUE var> - load a variable by number
                let operand = self.resolve_operand(
                    args.first().ok_or_else(|| {
                        CompilerError::CodeGenError("VALUE needs a variable".to_string())
                    })?,
                    rb,
                )?;
                let var_operand = match operand.op {
                    Operand::Variable(v) => Operand::SmallConstant(v),
                    other => other,
                };
                rb.emit(OpFamily::Op1, one_op::LOAD, &[var_operand], Some(0), None)?;
                Ok(Some(Operand::stack()))
            }
            "INC" | "DEC" => {
                let opcode = if op == "INC" { one_op::INC } else { one_op::DEC };
                let variable = self.variable_number_operand(args.first(), form.pos, rb)?;
                self.emit_with_relocs(rb, OpFamily::Op1, opcode, &[variable], None, None)?;
                Ok(None)
            }
            "PUSH" => {
                let operand = self.resolve_operand(
                    args.first().ok_or_else(|| {
                        CompilerError::CodeGenError("PUSH needs a value".to_string())
                    })?,
                    rb,
                )?;
                self.emit_with_relocs(rb, OpFamily::Var, var::PUSH, &[operand], None, None)?;
                Ok(Some(Operand::stack()))
            }
            "POP" => {
                // <POP var>: pull into a variable; plain <POP> discards.
                match args.first() {
                    Some(node) => {
                        let variable = self.variable_number_operand(Some(node), form.pos, rb)?;
                        self.emit_with_relocs(rb, OpFamily::Var, var::PULL, &[variable], None, None)?;
                    }
                    None => {
                        rb.emit(OpFamily::Op0, zero_op::POP, &[], None, None)?;
                    }
                }
                Ok(None)
            }

            "MOVE" => self.gen_fixed_2op(args, rb, two_op::INSERT_OBJ, "MOVE", form.pos),
            "REMOVE" => {
                let operand = self.resolve_operand(
                    args.first().ok_or_else(|| {
                        CompilerError::CodeGenError("REMOVE needs an object".to_string())
                    })?,
                    rb,
                )?;
                self.emit_with_relocs(rb, OpFamily::Op1, one_op::REMOVE_OBJ, &[operand], None, None)?;
                Ok(None)
            }
            "FSET" => self.gen_fixed_2op(args, rb, two_op::SET_ATTR, "FSET", form.pos),
            "FCLEAR" => self.gen_fixed_2op(args, rb, two_op::CLEAR_ATTR, "FCLEAR", form.pos),
            "PUTP" => {
                let mut operands = Vec::new();
                for arg in args {
                    operands.push(self.resolve_operand(arg, rb)?);
                }
                if operands.len() != 3 {
                    return Err(CompilerError::CodeGenError(format!(
                        "PUTP takes 3 operands, got {} at {}",
                        operands.len(),
                        form.pos
                    )));
                }
                self.emit_with_relocs(rb, OpFamily::Var, var::PUT_PROP, &operands, None, None)?;
                Ok(None)
            }
            "PUT" | "PUTB" | "ZPUT" => {
                let opcode = if op == "PUTB" { var::STOREB } else { var::STOREW };
                let mut operands = Vec::new();
                for arg in args {
                    operands.push(self.resolve_operand(arg, rb)?);
                }
                if operands.len() != 3 {
                    return Err(CompilerError::CodeGenError(format!(
                        "{} takes 3 operands, got {} at {}",
                        op,
                        operands.len(),
                        form.pos
                    )));
                }
                self.emit_with_relocs(rb, OpFamily::Var, opcode, &operands, None, None)?;
                Ok(None)
            }

            "PRINT" => {
                // <PRINT value> prints the string at a packed address
                let operand = self.resolve_operand(
                    args.first().ok_or_else(|| {
                        CompilerError::CodeGenError("PRINT needs a value".to_string())
                    })?,
                    rb,
                )?;
                self.emit_with_relocs(rb, OpFamily::Op1, one_op::PRINT_PADDR, &[operand], None, None)?;
                Ok(None)
            }
            "PRINTI" => {
                let text = args.first().and_then(|a| a.as_str()).ok_or_else(|| {
                    CompilerError::CodeGenError("PRINTI needs a string literal".to_string())
                })?;
                self.emit_printi(text, rb)?;
                Ok(None)
            }
            "PRINTR" => {
                let text = args.first().and_then(|a| a.as_str()).ok_or_else(|| {
                    CompilerError::CodeGenError("PRINTR needs a string literal".to_string())
                })?;
                rb.push_byte(0xB0 | zero_op::PRINT_RET);
                let encoder = self.make_encoder();
                let bytes = encoder.encode_bytes(text);
                rb.code.extend_from_slice(&bytes);
                Ok(None)
            }
            "PRINTB" | "PRINT-ADDR" => {
                let operand = self.resolve_operand(
                    args.first().ok_or_else(|| {
                        CompilerError::CodeGenError("PRINTB needs an address".to_string())
                    })?,
                    rb,
                )?;
                self.emit_with_relocs(rb, OpFamily::Op1, one_op::PRINT_ADDR, &[operand], None, None)?;
                Ok(None)
            }
            "PRINTN" => {
                let operand = self.resolve_operand(
                    args.first().ok_or_else(|| {
                        CompilerError::CodeGenError("PRINTN needs a number".to_string())
                    })?,
                    rb,
                )?;
                self.emit_with_relocs(rb, OpFamily::Var, var::PRINT_NUM, &[operand], None, None)?;
                Ok(None)
            }
            "PRINTC" => {
                let operand = self.resolve_operand(
                    args.first().ok_or_else(|| {
                        CompilerError::CodeGenError("PRINTC needs a character".to_string())
                    })?,
                    rb,
                )?;
                self.emit_with_relocs(rb, OpFamily::Var, var::PRINT_CHAR, &[operand], None, None)?;
                Ok(None)
            }
            "PRINTD" => {
                let operand = self.resolve_operand(
                    args.first().ok_or_else(|| {
                        CompilerError::CodeGenError("PRINTD needs an object".to_string())
                    })?,
                    rb,
                )?;
                self.emit_with_relocs(rb, OpFamily::Op1, one_op::PRINT_OBJ, &[operand], None, None)?;
                Ok(None)
            }
            "CRLF" => {
                rb.emit(OpFamily::Op0, zero_op::NEW_LINE, &[], None, None)?;
                Ok(None)
            }
            "TELL" => {
                self.gen_tell(args, rb)?;
                Ok(None)
            }
            "READ" => {
                let mut operands = Vec::new();
                for arg in args {
                    operands.push(self.resolve_operand(arg, rb)?);
                }
                self.emit_with_relocs(rb, OpFamily::Var, var::SREAD, &operands, None, None)?;
                Ok(None)
            }
            "RANDOM" => {
                let operand = self.resolve_operand(
                    args.first().ok_or_else(|| {
                        CompilerError::CodeGenError("RANDOM needs a range".to_string())
                    })?,
                    rb,
                )?;
                self.emit_with_relocs(rb, OpFamily::Var, var::RANDOM, &[operand], Some(0), None)?;
                Ok(Some(Operand::stack()))
            }

            "AND" | "OR" => self.gen_and_or(&op, args, rb, want_value),
            "NOT" => {
                if want_value {
                    let true_label = rb.new_label();
                    let end_label = rb.new_label();
                    self.gen_condition(
                        args.first().ok_or_else(|| {
                            CompilerError::CodeGenError("NOT needs an operand".to_string())
                        })?,
                        rb,
                        true_label,
                        false,
                    )?;
                    self.emit_with_relocs(
                        rb,
                        OpFamily::Var,
                        var::PUSH,
                        &[ROperand::constant(0)],
                        None,
                        None,
                    )?;
                    rb.emit_jump(end_label);
                    rb.place_label(true_label);
                    self.emit_with_relocs(
                        rb,
                        OpFamily::Var,
                        var::PUSH,
                        &[ROperand::constant(1)],
                        None,
                        None,
                    )?;
                    rb.place_label(end_label);
                    Ok(Some(Operand::stack()))
                } else {
                    if let Some(arg) = args.first() {
                        self.gen_stmt(arg, rb)?;
                    }
                    Ok(None)
                }
            }

            "PROG" | "BIND" => {
                self.gen_prog(args, rb, want_value)?;
                Ok(if want_value { Some(Operand::stack()) } else { None })
            }
            "APPLY" => {
                let mut operands = Vec::new();
                for arg in args {
                    operands.push(self.resolve_operand(arg, rb)?);
                }
                if operands.is_empty() {
                    return Err(CompilerError::CodeGenError(
                        "APPLY needs a routine value".to_string(),
                    ));
                }
                self.gen_call_with_operands(operands, rb, want_value)
            }

            _ => {
                // A routine call, or an unknown operator.
                if self.routine_names.contains(&op) {
                    let mut operands = Vec::with_capacity(args.len() + 1);
                    operands.push(ROperand {
                        op: Operand::LargeConstant(sentinel::ROUTINE_CALL),
                        reloc: Some(RelocationKind::RoutineCall { routine: op.clone() }),
                    });
                    for arg in args {
                        operands.push(self.resolve_operand(arg, rb)?);
                    }
                    return self.gen_call_with_operands(operands, rb, want_value);
                }
                Err(CompilerError::UndefinedSymbol(op_name.to_string(), form.pos))
            }
        }
    }

    fn make_encoder(&self) -> ZTextEncoder<'_> {
        match &self.abbreviations {
            Some(table) => ZTextEncoder::with_abbreviations(self.version.number(), table),
            None => ZTextEncoder::new(self.version.number()),
        }
    }

    fn emit_printi(&mut self, text: &str, rb: &mut RoutineBuilder) -> Result<(), CompilerError> {
        if self.string_dedup {
            self.intern_string(text);
            rb.emit_print_paddr_placeholder(text);
            return Ok(());
        }
        rb.push_byte(0xB0 | zero_op::PRINT);
        let encoder = self.make_encoder();
        let bytes = encoder.encode_bytes(text);
        rb.code.extend_from_slice(&bytes);
        Ok(())
    }

    fn variable_number_operand(
        &mut self,
        node: Option<&ZilNode>,
        pos: SourcePos,
        rb: &mut RoutineBuilder,
    ) -> Result<ROperand, CompilerError> {
        // INC/DEC/PULL take a variable *number* as a small constant.
        let node = node.ok_or_else(|| {
            CompilerError::CodeGenError("expected a variable reference".to_string())
        })?;
        let resolved = self.resolve_operand(node, rb)?;
        Ok(match resolved.op {
            Operand::Variable(v) => ROperand::plain(Operand::SmallConstant(v)),
            _ => resolved,
        })
    }

    fn gen_fixed_2op(
        &mut self,
        args: &[ZilNode],
        rb: &mut RoutineBuilder,
        opcode: u8,
        what: &str,
        pos: SourcePos,
    ) -> Result<Option<Operand>, CompilerError> {
        let mut operands = Vec::new();
        for arg in args {
            operands.push(self.resolve_operand(arg, rb)?);
        }
        if operands.len() != 2 {
            return Err(CompilerError::CodeGenError(format!(
                "{} takes 2 operands, got {} at {}",
                what,
                operands.len(),
                pos
            )));
        }
        self.emit_with_relocs(rb, OpFamily::Op2, opcode, &operands, None, None)?;
        Ok(None)
    }

    fn gen_set(
        &mut self,
        args: &[ZilNode],
        rb: &mut RoutineBuilder,
        want_value: bool,
        pos: SourcePos,
    ) -> Result<Option<Operand>, CompilerError> {
        if args.len() < 2 {
            return Err(CompilerError::CodeGenError(format!(
                "SET takes 2 operands at {}",
                pos
            )));
        }

        let variable = match &args[0] {
            ZilNode::Atom(name, _) | ZilNode::LocalVar(name) | ZilNode::GlobalVar(name) => {
                let upper = name.to_uppercase();
                if let Some(slot) = self.local_slots.get(&upper) {
                    *slot
                } else if let Some(number) = self.globals.get(&upper) {
                    *number
                } else {
                    return Err(CompilerError::UndefinedSymbol(name.clone(), pos));
                }
            }
            other => {
                return Err(CompilerError::CodeGenError(format!(
                    "SET target must be a variable, got {:?}",
                    other
                )))
            }
        };

        let value = self.resolve_operand(&args[1], rb)?;
        self.emit_with_relocs(
            rb,
            OpFamily::Op2,
            two_op::STORE,
            &[ROperand::plain(Operand::SmallConstant(variable)), value],
            None,
            None,
        )?;

        if want_value {
            rb.emit(
                OpFamily::Op1,
                one_op::LOAD,
                &[Operand::SmallConstant(variable)],
                Some(0),
                None,
            )?;
            Ok(Some(Operand::stack()))
        } else {
            Ok(None)
        }
    }

    fn gen_call_with_operands(
        &mut self,
        operands: Vec<ROperand>,
        rb: &mut RoutineBuilder,
        want_value: bool,
    ) -> Result<Option<Operand>, CompilerError> {
        let argc = operands.len() - 1;
        let v = self.version.number();

        if v <= 3 && argc > 3 {
            return Err(CompilerError::CodeGenError(format!(
                "call with {} arguments, version {} allows 3",
                argc, v
            )));
        }
        if argc > 7 {
            return Err(CompilerError::CodeGenError(format!(
                "call with {} arguments, the Z-machine allows 7",
                argc
            )));
        }

        if v >= 5 && !want_value {
            // call_vn / call_vn2
            if argc <= 3 {
                self.emit_with_relocs(rb, OpFamily::Var, var::CALL_VN, &operands, None, None)?;
            } else {
                self.emit_with_relocs(rb, OpFamily::VarDouble, var::CALL_VN2, &operands, None, None)?;
            }
            return Ok(None);
        }

        if argc <= 3 {
            self.emit_with_relocs(rb, OpFamily::Var, var::CALL_VS, &operands, Some(0), None)?;
        } else {
            self.emit_with_relocs(rb, OpFamily::VarDouble, var::CALL_VS2, &operands, Some(0), None)?;
        }

        if want_value {
            Ok(Some(Operand::stack()))
        } else {
            // The stored result is unwanted; drop it from the stack.
            rb.emit(OpFamily::Op0, zero_op::POP, &[], None, None)?;
            Ok(None)
        }
    }

    // ------------------------------------------------------------------
    // Control flow
    // ------------------------------------------------------------------

    /// COND: chain of test-and-branch-past-body sequences sharing one end
    /// label. In value context every body leaves a value on the stack.
    fn gen_cond(
        &mut self,
        cond: &CondNode,
        rb: &mut RoutineBuilder,
        want_value: bool,
    ) -> Result<(), CompilerError> {
        let end_label = rb.new_label();
        let mut saw_default = false;

        for clause in &cond.clauses {
            let is_default = matches!(
                clause.test.atom_name().map(|n| n.to_uppercase()).as_deref(),
                Some("T") | Some("ELSE") | Some("OTHERWISE")
            );

            if is_default {
                self.gen_clause_body(clause, rb, want_value)?;
                saw_default = true;
                break;
            }

            let next_clause = rb.new_label();
            self.gen_condition(&clause.test, rb, next_clause, false)?;
            self.gen_clause_body(clause, rb, want_value)?;
            rb.emit_jump(end_label);
            rb.place_label(next_clause);
        }

        if want_value && !saw_default {
            // No clause matched: the COND's value is false.
            self.emit_with_relocs(
                rb,
                OpFamily::Var,
                var::PUSH,
                &[ROperand::constant(0)],
                None,
                None,
            )?;
        }
        rb.place_label(end_label);
        Ok(())
    }

    fn gen_clause_body(
        &mut self,
        clause: &CondClause,
        rb: &mut RoutineBuilder,
        want_value: bool,
    ) -> Result<(), CompilerError> {
        if clause.body.is_empty() {
            if want_value {
                self.emit_with_relocs(
                    rb,
                    OpFamily::Var,
                    var::PUSH,
                    &[ROperand::constant(1)],
                    None,
                    None,
                )?;
            }
            return Ok(());
        }
        if let Some((last, rest)) = clause.body.split_last() {
            for stmt in rest {
                self.gen_stmt(stmt, rb)?;
            }
            if want_value {
                let value = self.gen_expr(last, rb)?;
                if value != Operand::stack() {
                    self.emit_with_relocs(
                        rb,
                        OpFamily::Var,
                        var::PUSH,
                        &[ROperand::plain(value)],
                        None,
                        None,
                    )?;
                }
            } else {
                self.gen_stmt(last, rb)?;
            }
        }
        Ok(())
    }

    /// REPEAT: bindings initialise, then label, body, unconditional jump
    /// back. An exit condition branches past the jump.
    fn gen_repeat(
        &mut self,
        repeat: &RepeatNode,
        rb: &mut RoutineBuilder,
    ) -> Result<(), CompilerError> {
        for (name, init) in &repeat.bindings {
            let slot = self.local_slot(name, repeat.pos)?;
            let value = match init {
                Some(node) => self.resolve_operand(node, rb)?,
                None => ROperand::constant(0),
            };
            self.emit_with_relocs(
                rb,
                OpFamily::Op2,
                two_op::STORE,
                &[ROperand::plain(Operand::SmallConstant(slot)), value],
                None,
                None,
            )?;
        }

        let loop_start = rb.new_label();
        let loop_end = rb.new_label();
        rb.place_label(loop_start);
        self.loop_stack.push(loop_start);

        if let Some(exit_cond) = &repeat.exit_cond {
            self.gen_condition(exit_cond, rb, loop_end, true)?;
        }
        for stmt in &repeat.body {
            self.gen_stmt(stmt, rb)?;
        }
        rb.emit_jump(loop_start);
        rb.place_label(loop_end);

        self.loop_stack.pop();
        Ok(())
    }

    fn gen_prog(
        &mut self,
        args: &[ZilNode],
        rb: &mut RoutineBuilder,
        want_value: bool,
    ) -> Result<(), CompilerError> {
        let mut body = args;

        // Leading binding list
        if let Some(ZilNode::List(bindings)) = args.first() {
            body = &args[1..];
            for binding in bindings {
                match binding {
                    ZilNode::Atom(name, pos) => {
                        let slot = self.local_slot(name, *pos)?;
                        rb.emit(
                            OpFamily::Op2,
                            two_op::STORE,
                            &[Operand::SmallConstant(slot), Operand::SmallConstant(0)],
                            None,
                            None,
                        )?;
                    }
                    ZilNode::List(pair) if pair.len() == 2 => {
                        if let Some(name) = pair[0].atom_name() {
                            let slot = self.local_slot(name, pair[0].pos())?;
                            let value = self.resolve_operand(&pair[1], rb)?;
                            self.emit_with_relocs(
                                rb,
                                OpFamily::Op2,
                                two_op::STORE,
                                &[ROperand::plain(Operand::SmallConstant(slot)), value],
                                None,
                                None,
                            )?;
                        }
                    }
                    _ => {}
                }
            }
        }

        match body.split_last() {
            None => {
                if want_value {
                    self.emit_with_relocs(
                        rb,
                        OpFamily::Var,
                        var::PUSH,
                        &[ROperand::constant(1)],
                        None,
                        None,
                    )?;
                }
            }
            Some((last, rest)) => {
                for stmt in rest {
                    self.gen_stmt(stmt, rb)?;
                }
                if want_value {
                    let value = self.gen_expr(last, rb)?;
                    if value != Operand::stack() {
                        self.emit_with_relocs(
                            rb,
                            OpFamily::Var,
                            var::PUSH,
                            &[ROperand::plain(value)],
                            None,
                            None,
                        )?;
                    }
                } else {
                    self.gen_stmt(last, rb)?;
                }
            }
        }
        Ok(())
    }

    fn gen_and_or(
        &mut self,
        op: &str,
        args: &[ZilNode],
        rb: &mut RoutineBuilder,
        want_value: bool,
    ) -> Result<Option<Operand>, CompilerError> {
        if !want_value {
            // Statement context: short-circuit over side effects.
            let end = rb.new_label();
            let is_and = op == "AND";
            for (i, arg) in args.iter().enumerate() {
                if i + 1 == args.len() {
                    self.gen_stmt(arg, rb)?;
                } else {
                    self.gen_condition(arg, rb, end, !is_and)?;
                }
            }
            rb.place_label(end);
            return Ok(None);
        }

        // Value context: 1/0 via branch structure.
        let true_label = rb.new_label();
        let end_label = rb.new_label();
        let whole = ZilNode::form(
            ZilNode::atom(op),
            args.to_vec(),
        );
        self.gen_condition(&whole, rb, true_label, true)?;
        self.emit_with_relocs(
            rb,
            OpFamily::Var,
            var::PUSH,
            &[ROperand::constant(0)],
            None,
            None,
        )?;
        rb.emit_jump(end_label);
        rb.place_label(true_label);
        self.emit_with_relocs(
            rb,
            OpFamily::Var,
            var::PUSH,
            &[ROperand::constant(1)],
            None,
            None,
        )?;
        rb.place_label(end_label);
        Ok(Some(Operand::stack()))
    }

    /// Lower a test, branching to `label` when the test's truth equals
    /// `jump_if`. Composite AND/OR/NOT recurse structurally; predicate
    /// opcodes branch natively; other values test against zero.
    pub(crate) fn gen_condition(
        &mut self,
        node: &ZilNode,
        rb: &mut RoutineBuilder,
        label: u32,
        jump_if: bool,
    ) -> Result<(), CompilerError> {
        // Constant tests fold to an unconditional jump or a fall-through.
        if let Some(value) = self.static_truth(node) {
            if value == jump_if {
                rb.emit_jump(label);
            }
            return Ok(());
        }

        if let ZilNode::Form(form) = node {
            if let Some(op) = form.operator.atom_name() {
                let op = op.to_uppercase();
                let args = &form.operands;

                match op.as_str() {
                    "NOT" => {
                        if let Some(arg) = args.first() {
                            return self.gen_condition(arg, rb, label, !jump_if);
                        }
                    }
                    "AND" => {
                        if jump_if {
                            // All must hold: fail to a local label
                            let fail = rb.new_label();
                            for (i, arg) in args.iter().enumerate() {
                                if i + 1 == args.len() {
                                    self.gen_condition(arg, rb, label, true)?;
                                } else {
                                    self.gen_condition(arg, rb, fail, false)?;
                                }
                            }
                            rb.place_label(fail);
                        } else {
                            for arg in args {
                                self.gen_condition(arg, rb, label, false)?;
                            }
                        }
                        return Ok(());
                    }
                    "OR" => {
                        if jump_if {
                            for arg in args {
                                self.gen_condition(arg, rb, label, true)?;
                            }
                        } else {
                            let ok = rb.new_label();
                            for (i, arg) in args.iter().enumerate() {
                                if i + 1 == args.len() {
                                    self.gen_condition(arg, rb, label, false)?;
                                } else {
                                    self.gen_condition(arg, rb, ok, true)?;
                                }
                            }
                            rb.place_label(ok);
                        }
                        return Ok(());
                    }
                    _ => {}
                }

                if let Some(test) = branch_op(&op) {
                    return self.gen_branch_op(test, args, rb, label, jump_if, form.pos);
                }
            }
        }

        // Generic value: branch on non-zero.
        let operand = self.resolve_operand(node, rb)?;
        self.emit_with_relocs(
            rb,
            OpFamily::Op1,
            one_op::JZ,
            &[operand],
            None,
            Some(Branch {
                target: BranchTarget::Label(label),
                on_true: !jump_if,
            }),
        )?;
        Ok(())
    }

    fn static_truth(&self, node: &ZilNode) -> Option<bool> {
        match node {
            ZilNode::Atom(name, _) => {
                let upper = name.to_uppercase();
                if upper == "T" || upper == "ELSE" || upper == "OTHERWISE" {
                    Some(true)
                } else {
                    None
                }
            }
            node if node.is_false() => Some(false),
            ZilNode::Number(n) => Some(*n != 0),
            _ => None,
        }
    }

    fn gen_branch_op(
        &mut self,
        test: BranchOp,
        args: &[ZilNode],
        rb: &mut RoutineBuilder,
        label: u32,
        jump_if: bool,
        pos: SourcePos,
    ) -> Result<(), CompilerError> {
        let branch = |on_true: bool| Branch {
            target: BranchTarget::Label(label),
            on_true,
        };

        match test {
            BranchOp::Je => {
                // EQUAL? allows 2..4 operands
                let mut operands = Vec::new();
                for arg in args {
                    operands.push(self.resolve_operand(arg, rb)?);
                }
                if operands.len() < 2 || operands.len() > 4 {
                    return Err(CompilerError::CodeGenError(format!(
                        "EQUAL? takes 2..4 operands, got {} at {}",
                        operands.len(),
                        pos
                    )));
                }
                self.emit_with_relocs(
                    rb,
                    OpFamily::Op2,
                    two_op::JE,
                    &operands,
                    None,
                    Some(branch(jump_if)),
                )?;
            }
            BranchOp::Simple2 { opcode, negate } => {
                let mut operands = Vec::new();
                for arg in args {
                    operands.push(self.resolve_operand(arg, rb)?);
                }
                if operands.len() != 2 {
                    return Err(CompilerError::CodeGenError(format!(
                        "predicate takes 2 operands, got {} at {}",
                        operands.len(),
                        pos
                    )));
                }
                self.emit_with_relocs(
                    rb,
                    OpFamily::Op2,
                    opcode,
                    &operands,
                    None,
                    Some(branch(jump_if != negate)),
                )?;
            }
            BranchOp::VarCheck { opcode } => {
                // DLESS?/IGRTR?: first operand is a variable number
                let variable = self.variable_number_operand(args.first(), pos, rb)?;
                let limit = self.resolve_operand(
                    args.get(1).ok_or_else(|| {
                        CompilerError::CodeGenError("predicate needs a limit".to_string())
                    })?,
                    rb,
                )?;
                self.emit_with_relocs(
                    rb,
                    OpFamily::Op2,
                    opcode,
                    &[variable, limit],
                    None,
                    Some(branch(jump_if)),
                )?;
            }
            BranchOp::Zero => {
                let operand = self.resolve_operand(
                    args.first().ok_or_else(|| {
                        CompilerError::CodeGenError("ZERO? needs an operand".to_string())
                    })?,
                    rb,
                )?;
                self.emit_with_relocs(
                    rb,
                    OpFamily::Op1,
                    one_op::JZ,
                    &[operand],
                    None,
                    Some(branch(jump_if)),
                )?;
            }
            BranchOp::One => {
                let operand = self.resolve_operand(
                    args.first().ok_or_else(|| {
                        CompilerError::CodeGenError("1? needs an operand".to_string())
                    })?,
                    rb,
                )?;
                self.emit_with_relocs(
                    rb,
                    OpFamily::Op2,
                    two_op::JE,
                    &[operand, ROperand::constant(1)],
                    None,
                    Some(branch(jump_if)),
                )?;
            }
            BranchOp::StoreBranch { opcode } => {
                // FIRST?/NEXT?: store the fetched object and branch on it
                let operand = self.resolve_operand(
                    args.first().ok_or_else(|| {
                        CompilerError::CodeGenError("predicate needs an object".to_string())
                    })?,
                    rb,
                )?;
                self.emit_with_relocs(
                    rb,
                    OpFamily::Op1,
                    opcode,
                    &[operand],
                    Some(0),
                    Some(branch(jump_if)),
                )?;
            }
            BranchOp::Verb => {
                // VERB? verb...: compare PRSA with the verbs' action numbers
                let prsa = self
                    .globals
                    .get("PRSA")
                    .copied()
                    .ok_or_else(|| CompilerError::UndefinedSymbol("PRSA".to_string(), pos))?;
                let mut operands = vec![ROperand::plain(Operand::Variable(prsa))];
                for arg in args.iter().take(3) {
                    let action = arg
                        .atom_name()
                        .and_then(|n| self.verb_actions.get(&n.to_uppercase()).copied())
                        .or_else(|| {
                            arg.atom_name()
                                .and_then(|n| self.action_numbers.get(&n.to_uppercase()).copied())
                        });
                    match action {
                        Some(number) => operands.push(ROperand::constant(number as i32)),
                        None => operands.push(self.resolve_operand(arg, rb)?),
                    }
                }
                self.emit_with_relocs(
                    rb,
                    OpFamily::Op2,
                    two_op::JE,
                    &operands,
                    None,
                    Some(branch(jump_if)),
                )?;
            }
            BranchOp::ZeroOp { opcode } => {
                rb.emit(OpFamily::Op0, opcode, &[], None, Some(branch(jump_if)))?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // TELL
    // ------------------------------------------------------------------

    /// TELL expands into a sequence of primitive print operations.
    fn gen_tell(&mut self, args: &[ZilNode], rb: &mut RoutineBuilder) -> Result<(), CompilerError> {
        let mut i = 0;
        while i < args.len() {
            let arg = &args[i];
            i += 1;

            match arg {
                ZilNode::Str(text) => {
                    self.emit_printi(text, rb)?;
                }
                ZilNode::CharLocalVar(name) => {
                    let slot = self.local_slot(name, arg.pos())?;
                    rb.emit(
                        OpFamily::Var,
                        var::PRINT_CHAR,
                        &[Operand::Variable(slot)],
                        None,
                        None,
                    )?;
                }
                ZilNode::CharGlobalVar(name) => {
                    let resolved = self.resolve_global_ref(name, arg.pos())?;
                    self.emit_with_relocs(rb, OpFamily::Var, var::PRINT_CHAR, &[resolved], None, None)?;
                }
                ZilNode::LocalVar(_) | ZilNode::GlobalVar(_) => {
                    // Bare variable: its value is a packed string address
                    let operand = self.resolve_operand(arg, rb)?;
                    self.emit_with_relocs(
                        rb,
                        OpFamily::Op1,
                        one_op::PRINT_PADDR,
                        &[operand],
                        None,
                        None,
                    )?;
                }
                ZilNode::Number(n) => {
                    rb.emit(
                        OpFamily::Var,
                        var::PRINT_NUM,
                        &[Operand::constant(*n)],
                        None,
                        None,
                    )?;
                }
                ZilNode::Atom(name, pos) => {
                    let token = name.to_uppercase();
                    match token.as_str() {
                        "CR" | "CRLF" => {
                            rb.emit(OpFamily::Op0, zero_op::NEW_LINE, &[], None, None)?;
                        }
                        "D" | "DESC" | "N" | "NUM" | "C" | "CHAR" | "CHR" | "B" => {
                            let operand_node = args.get(i).ok_or_else(|| {
                                CompilerError::CodeGenError(format!(
                                    "TELL {} needs an argument at {}",
                                    token, pos
                                ))
                            })?;
                            i += 1;
                            let operand = self.resolve_operand(operand_node, rb)?;
                            match token.as_str() {
                                "D" | "DESC" => self.emit_with_relocs(
                                    rb,
                                    OpFamily::Op1,
                                    one_op::PRINT_OBJ,
                                    &[operand],
                                    None,
                                    None,
                                )?,
                                "N" | "NUM" => self.emit_with_relocs(
                                    rb,
                                    OpFamily::Var,
                                    var::PRINT_NUM,
                                    &[operand],
                                    None,
                                    None,
                                )?,
                                "B" => self.emit_with_relocs(
                                    rb,
                                    OpFamily::Op1,
                                    one_op::PRINT_ADDR,
                                    &[operand],
                                    None,
                                    None,
                                )?,
                                _ => self.emit_with_relocs(
                                    rb,
                                    OpFamily::Var,
                                    var::PRINT_CHAR,
                                    &[operand],
                                    None,
                                    None,
                                )?,
                            }
                        }
                        _ => {
                            // Custom TELL token?
                            let consumed = self.gen_tell_token(&token, &args[i..], rb, *pos)?;
                            match consumed {
                                Some(n) => i += n,
                                None => {
                                    return Err(CompilerError::UndefinedSymbol(
                                        format!("TELL token {}", token),
                                        *pos,
                                    ))
                                }
                            }
                        }
                    }
                }
                ZilNode::Form(_) | ZilNode::Cond(_) => {
                    // Computed value: print as packed string address
                    let value = self.gen_expr(arg, rb)?;
                    rb.emit(OpFamily::Op1, one_op::PRINT_PADDR, &[value], None, None)?;
                }
                other => {
                    return Err(CompilerError::CodeGenError(format!(
                        "cannot TELL {:?}",
                        other
                    )))
                }
            }
        }
        Ok(())
    }

    /// Expand a TELL-TOKENS custom token. Returns the number of TELL
    /// arguments consumed, or None when the token is unknown.
    fn gen_tell_token(
        &mut self,
        token: &str,
        rest: &[ZilNode],
        rb: &mut RoutineBuilder,
        pos: SourcePos,
    ) -> Result<Option<usize>, CompilerError> {
        let defs: Vec<TellTokenDef> = self
            .tell_tokens
            .iter()
            .filter(|d| d.name == token)
            .cloned()
            .collect();
        if defs.is_empty() {
            return Ok(None);
        }

        // A pattern-specific definition beats the wildcard.
        let chosen = defs
            .iter()
            .find(|d| match &d.pattern {
                Some(pattern) => rest.first() == Some(pattern),
                None => false,
            })
            .or_else(|| defs.iter().find(|d| d.pattern.is_none()))
            .cloned();

        let Some(def) = chosen else {
            return Ok(None);
        };

        let consumed = if def.pattern.is_some() {
            1
        } else {
            def.arg_count
        };
        if rest.len() < consumed {
            return Err(CompilerError::CodeGenError(format!(
                "TELL token {} needs {} argument(s) at {}",
                token, consumed, pos
            )));
        }

        // Captured arguments substitute for .X .Y .Z .W in the expansion.
        let names = ["X", "Y", "Z", "W"];
        let mut captures: IndexMap<String, ZilNode> = IndexMap::new();
        for (i, capture) in rest[..consumed].iter().enumerate() {
            if i < names.len() {
                captures.insert(names[i].to_string(), capture.clone());
            }
        }
        let expansion = substitute_locals(&def.expansion, &captures);
        self.gen_stmt(&expansion, rb)?;
        Ok(Some(consumed))
    }
}

/// Rooms and objects together, rooms first (the shared FLAGS scan).
fn object_iter(program: &Program) -> impl Iterator<Item = &ObjectDef> {
    program.rooms.iter().chain(program.objects.iter())
}

/// Substitute .X-style locals in a TELL token expansion.
fn substitute_locals(node: &ZilNode, captures: &IndexMap<String, ZilNode>) -> ZilNode {
    match node {
        ZilNode::LocalVar(name) => match captures.get(&name.to_uppercase()) {
            Some(replacement) => replacement.clone(),
            None => node.clone(),
        },
        ZilNode::Form(form) => ZilNode::Form(FormNode {
            operator: Box::new(substitute_locals(&form.operator, captures)),
            operands: form
                .operands
                .iter()
                .map(|o| substitute_locals(o, captures))
                .collect(),
            pos: form.pos,
        }),
        ZilNode::List(items) => {
            ZilNode::List(items.iter().map(|i| substitute_locals(i, captures)).collect())
        }
        other => other.clone(),
    }
}

/// Collect REPEAT/PROG/BIND binding names so discovery can allocate
/// local slots for them.
fn collect_block_bindings(node: &ZilNode, out: &mut Vec<String>) {
    match node {
        ZilNode::Repeat(repeat) => {
            for (name, _) in &repeat.bindings {
                out.push(name.to_uppercase());
            }
            for stmt in &repeat.body {
                collect_block_bindings(stmt, out);
            }
        }
        ZilNode::Form(form) => {
            let is_block = matches!(
                form.operator.atom_name().map(|n| n.to_uppercase()).as_deref(),
                Some("PROG") | Some("BIND")
            );
            if is_block {
                if let Some(ZilNode::List(bindings)) = form.operands.first() {
                    for binding in bindings {
                        match binding {
                            ZilNode::Atom(name, _) => out.push(name.to_uppercase()),
                            ZilNode::List(pair) => {
                                if let Some(name) = pair.first().and_then(|p| p.atom_name()) {
                                    out.push(name.to_uppercase());
                                }
                            }
                            _ => {}
                        }
                    }
                }
            }
            for operand in &form.operands {
                collect_block_bindings(operand, out);
            }
        }
        ZilNode::Cond(cond) => {
            for clause in &cond.clauses {
                collect_block_bindings(&clause.test, out);
                for stmt in &clause.body {
                    collect_block_bindings(stmt, out);
                }
            }
        }
        _ => {}
    }
}

/// 2OP/1OP operations that compute a value into the store variable.
fn store_op(op: &str) -> Option<(OpFamily, u8)> {
    let entry = match op {
        "+" | "ADD" => (OpFamily::Op2, two_op::ADD),
        "-" | "SUB" => (OpFamily::Op2, two_op::SUB),
        "*" | "MUL" => (OpFamily::Op2, two_op::MUL),
        "/" | "DIV" => (OpFamily::Op2, two_op::DIV),
        "MOD" => (OpFamily::Op2, two_op::MOD),
        "BAND" | "ANDB" => (OpFamily::Op2, two_op::AND),
        "BOR" | "ORB" => (OpFamily::Op2, two_op::OR),
        "GET" | "ZGET" => (OpFamily::Op2, two_op::LOADW),
        "GETB" => (OpFamily::Op2, two_op::LOADB),
        "GETP" => (OpFamily::Op2, two_op::GET_PROP),
        "GETPT" => (OpFamily::Op2, two_op::GET_PROP_ADDR),
        "NEXTP" => (OpFamily::Op2, two_op::GET_NEXT_PROP),
        "PTSIZE" => (OpFamily::Op1, one_op::GET_PROP_LEN),
        "LOC" => (OpFamily::Op1, one_op::GET_PARENT),
        "BCOM" => (OpFamily::Op1, one_op::NOT),
        _ => return None,
    };
    Some(entry)
}

enum BranchOp {
    Je,
    Simple2 { opcode: u8, negate: bool },
    VarCheck { opcode: u8 },
    StoreBranch { opcode: u8 },
    Zero,
    One,
    Verb,
    ZeroOp { opcode: u8 },
}

fn branch_op(op: &str) -> Option<BranchOp> {
    let entry = match op {
        "EQUAL?" | "==?" | "=?" => BranchOp::Je,
        "ZERO?" | "0?" => BranchOp::Zero,
        "1?" => BranchOp::One,
        "L?" | "LESS?" => BranchOp::Simple2 {
            opcode: two_op::JL,
            negate: false,
        },
        "G?" | "GRTR?" => BranchOp::Simple2 {
            opcode: two_op::JG,
            negate: false,
        },
        // L=? is "not greater", G=? is "not less"
        "L=?" => BranchOp::Simple2 {
            opcode: two_op::JG,
            negate: true,
        },
        "G=?" => BranchOp::Simple2 {
            opcode: two_op::JL,
            negate: true,
        },
        "IN?" => BranchOp::Simple2 {
            opcode: two_op::JIN,
            negate: false,
        },
        "FSET?" => BranchOp::Simple2 {
            opcode: two_op::TEST_ATTR,
            negate: false,
        },
        "BTST" => BranchOp::Simple2 {
            opcode: two_op::TEST,
            negate: false,
        },
        "DLESS?" => BranchOp::VarCheck {
            opcode: two_op::DEC_CHK,
        },
        "IGRTR?" => BranchOp::VarCheck {
            opcode: two_op::INC_CHK,
        },
        "FIRST?" => BranchOp::StoreBranch {
            opcode: one_op::GET_CHILD,
        },
        "NEXT?" => BranchOp::StoreBranch {
            opcode: one_op::GET_SIBLING,
        },
        "VERB?" => BranchOp::Verb,
        "VERIFY" => BranchOp::ZeroOp {
            opcode: zero_op::VERIFY,
        },
        "SAVE" => BranchOp::ZeroOp {
            opcode: zero_op::SAVE,
        },
        "RESTORE" => BranchOp::ZeroOp {
            opcode: zero_op::RESTORE,
        },
        _ => return None,
    };
    Some(entry)
}

fn is_predicate(op: &str) -> bool {
    branch_op(op).is_some() && !matches!(op, "VERIFY" | "SAVE" | "RESTORE")
}

#[cfg(test)]
#[path = "codegen_tests.rs"]
mod tests;
