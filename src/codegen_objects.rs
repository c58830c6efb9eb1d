// Object and Dictionary Population
//
// Turns OBJECT/ROOM definitions into object-table entries: attribute
// bitsets from FLAGS, encoded property values (PROPDEF patterns, exit
// properties, vocabulary placeholders), tree links under the ordering
// policies, and the dictionary's vocabulary from every source that
// contributes words.

use indexmap::IndexMap;
use log::debug;

use crate::ast::*;
use crate::codegen::CodeGen;
use crate::dictionary::WordRole;
use crate::error::CompilerError;
use crate::object_table::{attributes_from_bits, PropertyData};
use crate::relocation::{sentinel, Relocation, RelocationKind};
use crate::text::ZTextEncoder;

impl CodeGen {
    // ------------------------------------------------------------------
    // Dictionary
    // ------------------------------------------------------------------

    pub(crate) fn populate_dictionary(&mut self, program: &Program) -> Result<(), CompilerError> {
        for word in &program.buzz_words {
            self.dictionary.add_word(word, WordRole::Buzz);
        }

        // Top-level SYNONYM groups: every word is a synonym of the first.
        for group in &program.synonym_groups {
            for word in group {
                if let Some(prop) = self.directions.get(&word.to_uppercase()).copied() {
                    self.dictionary.add_direction(word, prop);
                } else {
                    self.dictionary.add_word(word, WordRole::Buzz);
                }
            }
            // Direction synonyms inherit the canonical word's property.
            if let Some((first, rest)) = group.split_first() {
                if let Some(prop) = self.directions.get(&first.to_uppercase()).copied() {
                    for word in rest {
                        self.dictionary.add_direction(word, prop);
                    }
                }
            }
        }

        for (name, prop) in self.directions.clone() {
            self.dictionary.add_direction(&name, prop);
        }

        // Verbs, their SYNTAX-level synonyms, and prepositions.
        for syntax in &program.syntax {
            let Some(verb) = syntax.pattern.first() else {
                continue;
            };
            if let Some(number) = self.verb_numbers.get(&verb.to_uppercase()).copied() {
                self.dictionary.add_verb(verb, number);
                for synonym in &syntax.verb_synonyms {
                    self.dictionary.add_verb_synonym(synonym, verb);
                }
            }
            for word in &syntax.pattern[1..] {
                if !is_syntax_placeholder(word) {
                    self.dictionary.add_word(word, WordRole::Preposition);
                }
            }
        }

        for (canonical, synonyms) in &program.prep_synonyms {
            self.dictionary.add_word(canonical, WordRole::Preposition);
            for synonym in synonyms {
                self.dictionary.add_word(synonym, WordRole::Preposition);
            }
        }

        for word in &program.removed_synonyms {
            self.dictionary.remove_word(word);
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Objects
    // ------------------------------------------------------------------

    pub(crate) fn build_objects(&mut self, program: &Program) -> Result<(), CompilerError> {
        let ordered: Vec<ObjectDef> = self
            .ordered_objects(program)
            .into_iter()
            .cloned()
            .collect();

        // Parents by name, resolved to numbers after every object exists.
        let mut parents: IndexMap<String, String> = IndexMap::new();

        for def in &ordered {
            let number = self.object_numbers[&def.name.to_uppercase()];

            let mut bits = Vec::new();
            if let Some(flags) = def.property("FLAGS") {
                for value in &flags.values {
                    if let Some(flag) = value.atom_name() {
                        let bit = *self.flags.get(&flag.to_uppercase()).ok_or_else(|| {
                            CompilerError::UndefinedSymbol(flag.to_string(), value.pos())
                        })?;
                        bits.push(bit);
                    }
                }
            }
            let attributes = attributes_from_bits(self.version, &bits);

            let short_name = def
                .property("DESC")
                .and_then(|p| p.values.first())
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();

            let mut properties: Vec<PropertyData> = Vec::new();
            for prop in &def.properties {
                match prop.name.as_str() {
                    "FLAGS" => {}
                    "IN" | "LOC" => {
                        // A single atom is containment; anything else is a
                        // real property named IN (rooms use IN for exits).
                        if let [value] = prop.values.as_slice() {
                            if let Some(parent) = value.atom_name() {
                                parents
                                    .insert(def.name.to_uppercase(), parent.to_uppercase());
                                continue;
                            }
                        }
                        if let Some(encoded) = self.encode_property(def, prop, number)? {
                            properties.push(encoded);
                        }
                    }
                    _ => {
                        if let Some(encoded) = self.encode_property(def, prop, number)? {
                            properties.push(encoded);
                        }
                    }
                }
            }

            self.object_table
                .add_object(&def.name, &short_name, attributes, properties)?;
        }

        // Tree links: children attach in definition order (or reversed),
        // each parent's child pointing at the head of its sibling chain.
        let child_order: Vec<&ObjectDef> = match program.order_tree {
            OrderTree::Defined => ordered.iter().collect(),
            OrderTree::ReverseDefined => ordered.iter().rev().collect(),
        };

        let mut children: IndexMap<u16, Vec<u16>> = IndexMap::new();
        for def in child_order {
            let child = self.object_numbers[&def.name.to_uppercase()];
            if let Some(parent_name) = parents.get(&def.name.to_uppercase()) {
                let parent = *self.object_numbers.get(parent_name).ok_or_else(|| {
                    CompilerError::UndefinedSymbol(parent_name.clone(), def.pos)
                })?;
                children.entry(parent).or_default().push(child);
            }
        }

        for (parent, kids) in &children {
            for (i, &kid) in kids.iter().enumerate() {
                let sibling = kids.get(i + 1).copied().unwrap_or(0);
                if let Some(entry) = self.object_table.object_mut(kid) {
                    entry.parent = *parent;
                    entry.sibling = sibling;
                }
            }
            if let Some(first) = kids.first() {
                if let Some(entry) = self.object_table.object_mut(*parent) {
                    entry.child = *first;
                }
            }
        }

        debug!("objects: {} entries linked", ordered.len());
        Ok(())
    }

    // ------------------------------------------------------------------
    // Property encoding
    // ------------------------------------------------------------------

    fn encode_property(
        &mut self,
        def: &ObjectDef,
        prop: &PropertyDef,
        obj_number: u16,
    ) -> Result<Option<PropertyData>, CompilerError> {
        let upper = prop.name.to_uppercase();

        match upper.as_str() {
            "DESC" => {
                // The short name doubles as property 1 when it fits the
                // version's property size cap.
                let Some(text) = prop.values.first().and_then(|v| v.as_str()) else {
                    return Ok(None);
                };
                let encoder = ZTextEncoder::new(self.version.number());
                let bytes = crate::text::words_to_bytes(&encoder.encode_words(text));
                if bytes.len() > self.version.max_property_len() {
                    return Ok(None);
                }
                return Ok(Some(PropertyData {
                    number: 1,
                    data: bytes,
                    relocations: Vec::new(),
                }));
            }
            "SYNONYM" => {
                let mut data = Vec::new();
                let mut relocations = Vec::new();
                for value in &prop.values {
                    let Some(word) = property_word(value) else {
                        continue;
                    };
                    self.dictionary.add_synonym(&word, obj_number);
                    relocations.push(Relocation::new(
                        RelocationKind::PropertySynonym {
                            word: word.to_lowercase(),
                        },
                        data.len(),
                    ));
                    data.push((sentinel::PROP_SYNONYM >> 8) as u8);
                    data.push(0);
                }
                if data.is_empty() {
                    return Ok(None);
                }
                let number = self.property_number("SYNONYM")?;
                return Ok(Some(PropertyData {
                    number,
                    data,
                    relocations,
                }));
            }
            "ADJECTIVE" => {
                let mut data = Vec::new();
                let mut relocations = Vec::new();
                for value in &prop.values {
                    let Some(word) = property_word(value) else {
                        continue;
                    };
                    self.dictionary.add_adjective(&word, obj_number);
                    relocations.push(Relocation::new(
                        RelocationKind::PropertyAdjective {
                            word: word.to_lowercase(),
                        },
                        data.len(),
                    ));
                    data.push((sentinel::PROP_ADJECTIVE >> 8) as u8);
                    data.push(0);
                }
                if data.is_empty() {
                    return Ok(None);
                }
                let number = self.property_number("ADJECTIVE")?;
                return Ok(Some(PropertyData {
                    number,
                    data,
                    relocations,
                }));
            }
            "PSEUDO" => {
                // Pseudo names stay object-internal strings, not
                // dictionary entries: (string, handler) word pairs.
                let mut data = Vec::new();
                let mut relocations = Vec::new();
                for value in &prop.values {
                    match value {
                        ZilNode::Str(text) => {
                            self.intern_string(text);
                            relocations.push(Relocation::new(
                                RelocationKind::StringOperand { text: text.clone() },
                                data.len(),
                            ));
                            data.push((sentinel::STRING_OPERAND >> 8) as u8);
                            data.push(0);
                        }
                        ZilNode::Atom(name, _)
                            if self.routine_names.contains(&name.to_uppercase()) =>
                        {
                            relocations.push(Relocation::new(
                                RelocationKind::RoutineCall {
                                    routine: name.to_uppercase(),
                                },
                                data.len(),
                            ));
                            data.push(0xFF);
                            data.push(0xFF);
                        }
                        other => {
                            if let Some(v) = self.const_value(other) {
                                data.push((v >> 8) as u8);
                                data.push((v & 0xFF) as u8);
                            }
                        }
                    }
                }
                if data.is_empty() {
                    return Ok(None);
                }
                let number = self.property_number("PSEUDO")?;
                return Ok(Some(PropertyData {
                    number,
                    data,
                    relocations,
                }));
            }
            _ => {}
        }

        // Direction properties use the exit encodings.
        if let Some(direction_prop) = self.directions.get(&upper).copied() {
            return self.encode_exit_property(prop, direction_prop);
        }

        // PROPDEF patterns, when the property declares them.
        if let Some(encoded) = self.encode_with_propdef(prop)? {
            return Ok(Some(encoded));
        }

        // Generic encoding.
        let number = self.property_number(&upper)?;
        let mut data = Vec::new();
        let mut relocations = Vec::new();
        for value in &prop.values {
            self.encode_property_value(value, &mut data, &mut relocations)?;
        }
        if data.is_empty() {
            return Ok(None);
        }
        if data.len() > self.version.max_property_len() {
            return Err(CompilerError::PropertyTooLarge(
                format!("{} of object {}", prop.name, def.name),
                data.len(),
                self.version.max_property_len(),
            ));
        }
        Ok(Some(PropertyData {
            number,
            data,
            relocations,
        }))
    }

    /// One generic property value: numbers and folded constants become
    /// words, strings become packed-address placeholders, routines
    /// packed-address placeholders, objects their numbers.
    fn encode_property_value(
        &mut self,
        value: &ZilNode,
        data: &mut Vec<u8>,
        relocations: &mut Vec<Relocation>,
    ) -> Result<(), CompilerError> {
        match value {
            ZilNode::Str(text) => {
                self.intern_string(text);
                relocations.push(Relocation::new(
                    RelocationKind::StringOperand { text: text.clone() },
                    data.len(),
                ));
                data.push((sentinel::STRING_OPERAND >> 8) as u8);
                data.push(0);
            }
            ZilNode::Atom(name, pos) => {
                let upper = name.to_uppercase();
                if self.routine_names.contains(&upper) {
                    relocations.push(Relocation::new(
                        RelocationKind::RoutineCall { routine: upper },
                        data.len(),
                    ));
                    data.push(0xFF);
                    data.push(0xFF);
                } else if let Some(word) = upper.strip_prefix("W?") {
                    let word = word.to_lowercase();
                    self.dictionary.add_word(&word, WordRole::Buzz);
                    relocations.push(Relocation::new(
                        RelocationKind::PropertyVoc { word },
                        data.len(),
                    ));
                    data.push((sentinel::VOCAB_WORD >> 8) as u8);
                    data.push(0);
                } else if let Some(v) = self.const_value(value) {
                    data.push((v >> 8) as u8);
                    data.push((v & 0xFF) as u8);
                } else {
                    return Err(CompilerError::UndefinedSymbol(name.clone(), *pos));
                }
            }
            other => {
                if let Some(v) = self.const_value(other) {
                    data.push((v >> 8) as u8);
                    data.push((v & 0xFF) as u8);
                } else {
                    return Err(CompilerError::CodeGenError(format!(
                        "cannot encode property value {:?}",
                        other
                    )));
                }
            }
        }
        Ok(())
    }

    /// Exit property: (DIR TO room), (DIR PER routine), (DIR "message"),
    /// (DIR TO room IF flag-global [ELSE "message"]), (DIR SORRY "msg").
    fn encode_exit_property(
        &mut self,
        prop: &PropertyDef,
        number: u8,
    ) -> Result<Option<PropertyData>, CompilerError> {
        let mut data = Vec::new();
        let mut relocations = Vec::new();

        for value in &prop.values {
            match value {
                ZilNode::Atom(name, _) => {
                    let upper = name.to_uppercase();
                    match upper.as_str() {
                        // Keywords carry no bytes of their own
                        "TO" | "PER" | "IF" | "IS" | "ELSE" | "SORRY" | "OPEN" | "CLOSED" => {}
                        _ => {
                            if let Some(object) = self.object_numbers.get(&upper).copied() {
                                data.push((object & 0xFF) as u8);
                            } else if self.routine_names.contains(&upper) {
                                relocations.push(Relocation::new(
                                    RelocationKind::RoutineCall { routine: upper },
                                    data.len(),
                                ));
                                data.push(0xFF);
                                data.push(0xFF);
                            } else if let Some(global) = self.globals.get(&upper).copied() {
                                // IF flag-global: the global's number
                                data.push(global);
                            } else if let Some(v) = self.const_value(value) {
                                data.push((v & 0xFF) as u8);
                            } else {
                                return Err(CompilerError::UndefinedSymbol(
                                    name.clone(),
                                    value.pos(),
                                ));
                            }
                        }
                    }
                }
                ZilNode::Str(text) => {
                    self.intern_string(text);
                    relocations.push(Relocation::new(
                        RelocationKind::StringOperand { text: text.clone() },
                        data.len(),
                    ));
                    data.push((sentinel::STRING_OPERAND >> 8) as u8);
                    data.push(0);
                }
                ZilNode::GlobalVar(name) => {
                    let global = *self.globals.get(&name.to_uppercase()).ok_or_else(|| {
                        CompilerError::UndefinedSymbol(name.clone(), value.pos())
                    })?;
                    data.push(global);
                }
                other => {
                    if let Some(v) = self.const_value(other) {
                        data.push((v & 0xFF) as u8);
                    }
                }
            }
        }

        if data.is_empty() {
            return Ok(None);
        }
        Ok(Some(PropertyData {
            number,
            data,
            relocations,
        }))
    }

    /// Pattern-driven encoding from a PROPDEF declaration. Tries each
    /// pattern in order; inputs match literally or capture by name,
    /// outputs emit bytes/words/vocabulary placeholders.
    fn encode_with_propdef(
        &mut self,
        prop: &PropertyDef,
    ) -> Result<Option<PropertyData>, CompilerError> {
        let patterns: Vec<Vec<ZilNode>> = {
            let propdef = self
                .propdef_patterns
                .get(&prop.name.to_uppercase())
                .cloned();
            match propdef {
                Some(p) if !p.is_empty() => p,
                _ => return Ok(None),
            }
        };

        'pattern: for pattern in &patterns {
            let split = pattern
                .iter()
                .position(|n| n.atom_name() == Some("="));
            let Some(eq) = split else { continue };
            let inputs = &pattern[..eq];
            let outputs = &pattern[eq + 1..];

            // Input matching: first element names the property.
            let mut captures: IndexMap<String, ZilNode> = IndexMap::new();
            let mut value_index = 0usize;
            let mut optional = false;

            for input in inputs.iter().skip(1) {
                match input {
                    ZilNode::Str(marker) if marker.eq_ignore_ascii_case("OPT") => {
                        optional = true;
                    }
                    ZilNode::Str(marker) if marker.eq_ignore_ascii_case("MANY") => {
                        // The remaining values repeat the captured shape;
                        // handled by the output loop below.
                        break;
                    }
                    ZilNode::Atom(name, _) if !name.contains(':') => {
                        // Literal atom must match exactly
                        match prop.values.get(value_index) {
                            Some(v)
                                if v.atom_name()
                                    .map_or(false, |n| n.eq_ignore_ascii_case(name)) =>
                            {
                                value_index += 1;
                            }
                            None if optional => {}
                            _ => continue 'pattern,
                        }
                    }
                    ZilNode::Atom(name, _) => {
                        // NAME:TYPE capture
                        let (var, ty) = name.split_once(':').unwrap_or((name.as_str(), ""));
                        match prop.values.get(value_index) {
                            Some(v) => {
                                if !capture_matches(ty, v) {
                                    continue 'pattern;
                                }
                                captures.insert(var.to_uppercase(), v.clone());
                                value_index += 1;
                            }
                            None if optional => {}
                            None => continue 'pattern,
                        }
                    }
                    _ => continue 'pattern,
                }
            }

            // All inputs matched: emit the outputs.
            let mut data = Vec::new();
            let mut relocations = Vec::new();
            for output in outputs {
                self.emit_propdef_output(output, &captures, &mut data, &mut relocations)?;
            }

            let number = self.property_number(&prop.name)?;
            return Ok(Some(PropertyData {
                number,
                data,
                relocations,
            }));
        }

        Ok(None)
    }

    fn emit_propdef_output(
        &mut self,
        output: &ZilNode,
        captures: &IndexMap<String, ZilNode>,
        data: &mut Vec<u8>,
        relocations: &mut Vec<Relocation>,
    ) -> Result<(), CompilerError> {
        match output {
            // A bare number is the declared property length; the encoded
            // data already determines it.
            ZilNode::Number(_) => Ok(()),
            node if node.is_false() => Ok(()),
            ZilNode::List(items) => {
                // (CONST-NAME value): define a constant as a side effect
                if let (Some(name), Some(value)) = (
                    items.first().and_then(|n| n.atom_name()),
                    items.get(1).and_then(|v| self.const_value(v)),
                ) {
                    self.constants.insert(name.to_uppercase(), value);
                }
                Ok(())
            }
            ZilNode::Form(form) => {
                let Some(op) = form.operator.atom_name() else {
                    return Ok(());
                };
                let resolved = form
                    .operands
                    .first()
                    .and_then(|arg| resolve_capture(arg, captures));

                match op.to_uppercase().as_str() {
                    "WORD" => {
                        if let Some(node) = resolved {
                            if let Some(v) = self.const_value(&node) {
                                data.push((v >> 8) as u8);
                                data.push((v & 0xFF) as u8);
                            } else {
                                // Strings and routines still resolve
                                self.encode_property_value(&node, data, relocations)?;
                            }
                        }
                        Ok(())
                    }
                    "BYTE" => {
                        let value = resolved
                            .and_then(|v| self.const_value(&v))
                            .unwrap_or(0);
                        data.push((value & 0xFF) as u8);
                        Ok(())
                    }
                    "VOC" => {
                        // <VOC .VAR type>: dictionary word placeholder
                        let Some(node) = resolved else {
                            return Ok(());
                        };
                        let Some(word) = property_word(&node) else {
                            return Ok(());
                        };
                        let role = form
                            .operands
                            .get(1)
                            .and_then(|t| t.atom_name())
                            .map(|t| t.to_uppercase());
                        match role.as_deref() {
                            Some("ADJ") | Some("ADJECTIVE") => {
                                self.dictionary.add_word(&word, WordRole::Adjective)
                            }
                            Some("NOUN") | Some("OBJECT") => {
                                self.dictionary.add_word(&word, WordRole::Noun)
                            }
                            Some("PREP") | Some("PREPOSITION") => {
                                self.dictionary.add_word(&word, WordRole::Preposition)
                            }
                            Some("VERB") => self.dictionary.add_word(&word, WordRole::Verb),
                            Some("DIR") | Some("DIRECTION") => {
                                let prop = self
                                    .directions
                                    .get(&word.to_uppercase())
                                    .copied()
                                    .unwrap_or(0);
                                self.dictionary.add_direction(&word, prop);
                            }
                            _ => self.dictionary.add_word(&word, WordRole::Buzz),
                        }
                        relocations.push(Relocation::new(
                            RelocationKind::PropertyVoc {
                                word: word.to_lowercase(),
                            },
                            data.len(),
                        ));
                        data.push((sentinel::VOCAB_WORD >> 8) as u8);
                        data.push(0);
                        Ok(())
                    }
                    "ROOM" | "OBJECT" => {
                        let number = resolved
                            .and_then(|v| v.atom_name().map(|n| n.to_uppercase()))
                            .and_then(|n| self.object_numbers.get(&n).copied())
                            .unwrap_or(0);
                        data.push((number & 0xFF) as u8);
                        Ok(())
                    }
                    "GLOBAL" => {
                        let number = resolved
                            .and_then(|v| v.atom_name().map(|n| n.to_uppercase()))
                            .and_then(|n| self.globals.get(&n).copied())
                            .unwrap_or(0);
                        data.push(number);
                        Ok(())
                    }
                    "STRING" => {
                        if let Some(ZilNode::Str(text)) = resolved {
                            self.intern_string(&text);
                            relocations.push(Relocation::new(
                                RelocationKind::StringOperand { text },
                                data.len(),
                            ));
                            data.push((sentinel::STRING_OPERAND >> 8) as u8);
                            data.push(0);
                        }
                        Ok(())
                    }
                    _ => Ok(()),
                }
            }
            _ => Ok(()),
        }
    }
}

/// The word text behind a SYNONYM/ADJECTIVE/VOC property element.
fn property_word(node: &ZilNode) -> Option<String> {
    match node {
        ZilNode::Atom(name, _) => Some(name.clone()),
        ZilNode::Str(text) => Some(text.clone()),
        ZilNode::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Does a value satisfy a PROPDEF capture type?
fn capture_matches(ty: &str, value: &ZilNode) -> bool {
    match ty.to_uppercase().as_str() {
        "FIX" => matches!(value, ZilNode::Number(_)),
        "ATOM" => matches!(value, ZilNode::Atom(_, _)),
        "STRING" => matches!(value, ZilNode::Str(_)),
        "ROOM" | "OBJECT" | "GLOBAL" | "ROUTINE" => matches!(value, ZilNode::Atom(_, _)),
        // Untyped or unknown captures match anything
        _ => true,
    }
}

/// A `.VAR` in a PROPDEF output refers to a captured input.
fn resolve_capture(node: &ZilNode, captures: &IndexMap<String, ZilNode>) -> Option<ZilNode> {
    match node {
        ZilNode::LocalVar(name) => captures.get(&name.to_uppercase()).cloned(),
        other => Some(other.clone()),
    }
}

fn is_syntax_placeholder(word: &str) -> bool {
    matches!(
        word.to_uppercase().as_str(),
        "OBJECT" | "FIND" | "HAVE" | "HELD" | "CARRIED" | "ON-GROUND" | "IN-ROOM" | "TAKE"
            | "MANY" | "SEARCH" | "KLUDGEBIT"
    )
}
