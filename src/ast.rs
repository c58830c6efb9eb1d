// ZIL Abstract Syntax Tree
//
// One tagged sum for expressions plus structs for the top-level
// definitions the parser distinguishes. Nodes are created by the parser,
// rewritten in place only by the macro expander, and read-only from code
// generation onward.

use indexmap::IndexMap;

use crate::error::SourcePos;

/// Expression-level node.
#[derive(Debug, Clone, PartialEq)]
pub enum ZilNode {
    Atom(String, SourcePos),
    Number(i32),
    Str(String),
    LocalVar(String),
    GlobalVar(String),
    /// %.VAR - print the local as a character in TELL
    CharLocalVar(String),
    /// %,VAR - print the global as a character in TELL
    CharGlobalVar(String),
    /// Parenthesised list literal
    List(Vec<ZilNode>),
    Form(FormNode),
    Quote(Box<ZilNode>),
    Quasiquote(Box<ZilNode>),
    Unquote(Box<ZilNode>),
    SpliceUnquote(Box<ZilNode>),
    /// Macro expansion result whose items splice into the surrounding
    /// operand list (CHTYPE ... SPLICE).
    SpliceResult(Vec<ZilNode>),
    Cond(CondNode),
    Repeat(RepeatNode),
    Table(TableNode),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FormNode {
    pub operator: Box<ZilNode>,
    pub operands: Vec<ZilNode>,
    pub pos: SourcePos,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CondClause {
    pub test: ZilNode,
    pub body: Vec<ZilNode>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CondNode {
    pub clauses: Vec<CondClause>,
    pub pos: SourcePos,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RepeatNode {
    pub bindings: Vec<(String, Option<ZilNode>)>,
    pub exit_cond: Option<Box<ZilNode>>,
    pub body: Vec<ZilNode>,
    pub pos: SourcePos,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    Table,
    ITable,
    LTable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableNode {
    pub kind: TableKind,
    pub flags: Vec<String>,
    pub size: Option<Box<ZilNode>>,
    pub values: Vec<ZilNode>,
    /// PATTERN spec: (type name, repeats-to-end) pairs, e.g. BYTE / [REST WORD]
    pub pattern: Vec<(String, bool)>,
    pub pos: SourcePos,
}

impl ZilNode {
    pub fn atom(name: &str) -> ZilNode {
        ZilNode::Atom(name.to_string(), SourcePos::default())
    }

    pub fn form(operator: ZilNode, operands: Vec<ZilNode>) -> ZilNode {
        ZilNode::Form(FormNode {
            operator: Box::new(operator),
            operands,
            pos: SourcePos::default(),
        })
    }

    /// The empty form <>, ZIL's false.
    pub fn false_value() -> ZilNode {
        ZilNode::form(ZilNode::atom("<>"), Vec::new())
    }

    pub fn is_false(&self) -> bool {
        match self {
            ZilNode::Form(form) => {
                form.operands.is_empty() && form.operator.atom_name() == Some("<>")
            }
            _ => false,
        }
    }

    pub fn atom_name(&self) -> Option<&str> {
        match self {
            ZilNode::Atom(name, _) => Some(name),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<i32> {
        match self {
            ZilNode::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ZilNode::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn pos(&self) -> SourcePos {
        match self {
            ZilNode::Atom(_, pos) => *pos,
            ZilNode::Form(form) => form.pos,
            ZilNode::Cond(cond) => cond.pos,
            ZilNode::Repeat(repeat) => repeat.pos,
            ZilNode::Table(table) => table.pos,
            _ => SourcePos::default(),
        }
    }

    /// True when this form's operator is the given atom (case-insensitive).
    pub fn is_form_named(&self, name: &str) -> bool {
        match self {
            ZilNode::Form(form) => form
                .operator
                .atom_name()
                .map_or(false, |op| op.eq_ignore_ascii_case(name)),
            _ => false,
        }
    }
}

/// One macro parameter with its DEFMAC decorations.
#[derive(Debug, Clone, PartialEq)]
pub struct MacroParam {
    pub name: String,
    /// 'NAME - argument passed unevaluated
    pub quoted: bool,
    /// "ARGS" - collects all remaining arguments
    pub tuple: bool,
    /// after "AUX" - expansion-local variable
    pub aux: bool,
    /// after "OPT"/"OPTIONAL" - binds to the unassigned sentinel if missing
    pub optional: bool,
}

#[derive(Debug, Clone)]
pub struct MacroNode {
    pub name: String,
    pub params: Vec<MacroParam>,
    pub body: Vec<ZilNode>,
    pub pos: SourcePos,
}

#[derive(Debug, Clone)]
pub struct RoutineNode {
    pub name: String,
    pub required_params: Vec<String>,
    pub opt_params: Vec<String>,
    pub aux_vars: Vec<String>,
    pub local_defaults: IndexMap<String, ZilNode>,
    pub body: Vec<ZilNode>,
    /// Named activation for RETURN/AGAIN, e.g. <ROUTINE GO "ACT" () ...>
    pub activation: Option<String>,
    pub pos: SourcePos,
}

#[derive(Debug, Clone)]
pub struct PropertyDef {
    pub name: String,
    pub values: Vec<ZilNode>,
    pub pos: SourcePos,
}

/// OBJECT and ROOM share a shape; the program keeps them in separate
/// vectors because ORDER-OBJECTS? can number rooms first.
#[derive(Debug, Clone)]
pub struct ObjectDef {
    pub name: String,
    pub properties: Vec<PropertyDef>,
    pub pos: SourcePos,
}

impl ObjectDef {
    pub fn property(&self, name: &str) -> Option<&PropertyDef> {
        self.properties
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone)]
pub struct SyntaxNode {
    /// Pattern words: verb, prepositions, OBJECT placeholders.
    pub pattern: Vec<String>,
    pub action_routine: String,
    pub preaction: Option<String>,
    /// Parenthesised synonyms after the verb, e.g. <SYNTAX TOSS (CHUCK) ...>
    pub verb_synonyms: Vec<String>,
    /// One scope-flag list per OBJECT in the pattern.
    pub object_flags: Vec<Vec<String>>,
    pub pos: SourcePos,
}

#[derive(Debug, Clone)]
pub struct GlobalNode {
    pub name: String,
    pub value: Option<ZilNode>,
    pub pos: SourcePos,
}

#[derive(Debug, Clone)]
pub struct ConstantNode {
    pub name: String,
    pub value: ZilNode,
    pub pos: SourcePos,
}

#[derive(Debug, Clone)]
pub struct PropdefNode {
    pub name: String,
    pub default: Option<ZilNode>,
    /// Complex patterns, each a parenthesised input/=/output sequence.
    pub patterns: Vec<Vec<ZilNode>>,
    pub pos: SourcePos,
}

/// One custom TELL token. A name may have several definitions: specific
/// patterns first, a `*` wildcard as fallback.
#[derive(Debug, Clone)]
pub struct TellTokenDef {
    pub name: String,
    /// Number of `*` argument captures.
    pub arg_count: usize,
    /// A non-wildcard pattern this definition matches exactly.
    pub pattern: Option<ZilNode>,
    pub expansion: ZilNode,
}

#[derive(Debug, Clone)]
pub struct DefineGlobalEntry {
    pub name: String,
    pub value: ZilNode,
    pub is_byte: bool,
    pub adecl: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DefineGlobalsNode {
    pub table_name: String,
    pub entries: Vec<DefineGlobalEntry>,
    pub pos: SourcePos,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderObjects {
    Defined,
    RoomsFirst,
    ReverseDefined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderTree {
    Defined,
    ReverseDefined,
}

/// Everything the parser collects from one compilation unit.
#[derive(Debug, Clone)]
pub struct Program {
    pub version: u8,
    pub version_explicit: bool,
    pub routines: Vec<RoutineNode>,
    pub objects: Vec<ObjectDef>,
    pub rooms: Vec<ObjectDef>,
    pub globals: Vec<GlobalNode>,
    pub constants: Vec<ConstantNode>,
    pub propdefs: Vec<PropdefNode>,
    pub syntax: Vec<SyntaxNode>,
    pub tables: Vec<TableNode>,
    pub macros: Vec<MacroNode>,
    pub buzz_words: Vec<String>,
    /// Top-level <SYNONYM a b c>: b and c become synonyms of a.
    pub synonym_groups: Vec<Vec<String>>,
    pub removed_synonyms: Vec<String>,
    pub bit_synonyms: Vec<(String, String)>,
    pub prep_synonyms: Vec<(String, Vec<String>)>,
    pub directions: Vec<String>,
    pub tell_tokens: Vec<TellTokenDef>,
    pub order_objects: OrderObjects,
    pub order_tree: OrderTree,
    pub long_words: bool,
    pub define_globals: Vec<DefineGlobalsNode>,
    /// Top-level ZPUT/PUTB forms applied to tables before emission.
    pub compile_time_ops: Vec<FormNode>,
    /// Atoms whose PROPSPEC was cleared (their PROPDEF patterns ignored).
    pub cleared_propspecs: Vec<String>,
}

impl Default for Program {
    fn default() -> Self {
        Program {
            version: 3,
            version_explicit: false,
            routines: Vec::new(),
            objects: Vec::new(),
            rooms: Vec::new(),
            globals: Vec::new(),
            constants: Vec::new(),
            propdefs: Vec::new(),
            syntax: Vec::new(),
            tables: Vec::new(),
            macros: Vec::new(),
            buzz_words: Vec::new(),
            synonym_groups: Vec::new(),
            removed_synonyms: Vec::new(),
            bit_synonyms: Vec::new(),
            prep_synonyms: Vec::new(),
            directions: Vec::new(),
            tell_tokens: Vec::new(),
            order_objects: OrderObjects::Defined,
            order_tree: OrderTree::ReverseDefined,
            long_words: false,
            define_globals: Vec::new(),
            compile_time_ops: Vec::new(),
            cleared_propspecs: Vec::new(),
        }
    }
}

impl Program {
    pub fn new() -> Self {
        Program::default()
    }
}
