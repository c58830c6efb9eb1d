// ZIL Parser
//
// Recursive descent over the token stream. Built-in forms (ROUTINE,
// OBJECT, SYNTAX, tables, COND, REPEAT, DEFMAC, the top-level directives)
// get specialised parsers; every other <...> becomes a generic Form.

use log::debug;

use crate::ast::*;
use crate::error::{CompilerError, SourcePos};
use crate::lexer::{Token, TokenKind};

pub struct Parser {
    tokens: Vec<Token>,
    filename: String,
    pos: usize,
}

impl Parser {
    pub fn new(mut tokens: Vec<Token>, filename: &str) -> Self {
        // The lexer always terminates the stream; guard against callers
        // handing over an empty vector anyway.
        if tokens.is_empty() {
            tokens.push(Token {
                kind: TokenKind::Eof,
                pos: SourcePos::default(),
            });
        }
        Parser {
            tokens,
            filename: filename.to_string(),
            pos: 0,
        }
    }

    fn current(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn current_pos(&self) -> SourcePos {
        self.current().pos
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn error(&self, message: &str) -> CompilerError {
        CompilerError::ParseError(self.filename.clone(), message.to_string(), self.current_pos())
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> Result<Token, CompilerError> {
        if self.at(kind) {
            Ok(self.advance())
        } else {
            Err(CompilerError::ExpectedToken(
                self.filename.clone(),
                what.to_string(),
                format!("{:?}", self.current().kind),
                self.current_pos(),
            ))
        }
    }

    fn expect_atom(&mut self, what: &str) -> Result<String, CompilerError> {
        match self.current().kind.clone() {
            TokenKind::Atom(name) => {
                self.advance();
                Ok(name)
            }
            other => Err(CompilerError::ExpectedToken(
                self.filename.clone(),
                what.to_string(),
                format!("{:?}", other),
                self.current_pos(),
            )),
        }
    }

    fn at(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(&self.current().kind) == std::mem::discriminant(kind)
    }

    fn at_atom(&self, name: &str) -> bool {
        matches!(&self.current().kind, TokenKind::Atom(a) if a.eq_ignore_ascii_case(name))
    }

    /// Parse the whole token stream into a Program.
    pub fn parse(mut self) -> Result<Program, CompilerError> {
        let mut program = Program::new();

        while !self.at(&TokenKind::Eof) {
            match &self.current().kind {
                TokenKind::LAngle => self.parse_top_level(&mut program)?,
                // Stray separators between top-level forms
                TokenKind::Period | TokenKind::Comma | TokenKind::Semicolon => {
                    self.advance();
                }
                other => {
                    return Err(CompilerError::UnexpectedToken(
                        self.filename.clone(),
                        format!("{:?} at top level", other),
                        self.current_pos(),
                    ))
                }
            }
        }
        Ok(program)
    }

    fn parse_top_level(&mut self, program: &mut Program) -> Result<(), CompilerError> {
        let pos = self.current_pos();
        self.expect(&TokenKind::LAngle, "<")?;

        if self.at(&TokenKind::RAngle) {
            self.advance();
            return Ok(());
        }

        let operator = self.parse_expression()?;
        let op = operator
            .atom_name()
            .map(|n| n.to_uppercase())
            .unwrap_or_default();

        match op.as_str() {
            "ROUTINE" => {
                let routine = self.parse_routine(pos)?;
                program.routines.push(routine);
            }
            "OBJECT" => {
                let object = self.parse_object(pos)?;
                program.objects.push(object);
            }
            "ROOM" => {
                let room = self.parse_object(pos)?;
                program.rooms.push(room);
            }
            "SYNTAX" => {
                let syntax = self.parse_syntax(pos)?;
                program.syntax.push(syntax);
            }
            "VERSION" => {
                let version = self.parse_version()?;
                program.version = version;
                program.version_explicit = true;
            }
            "GLOBAL" | "SETG20" => {
                let global = self.parse_global(pos)?;
                program.globals.push(global);
            }
            "CONSTANT" => {
                let constant = self.parse_constant(pos)?;
                program.constants.push(constant);
            }
            "PROPDEF" | "PROPSPEC" => {
                let propdef = self.parse_propdef(pos)?;
                program.propdefs.push(propdef);
            }
            "DEFMAC" => {
                let mac = self.parse_defmac(pos)?;
                program.macros.push(mac);
            }
            "TABLE" => {
                if let ZilNode::Table(t) = self.parse_table(TableKind::Table, pos)? {
                    program.tables.push(t);
                }
            }
            "ITABLE" => {
                if let ZilNode::Table(t) = self.parse_table(TableKind::ITable, pos)? {
                    program.tables.push(t);
                }
            }
            "LTABLE" => {
                if let ZilNode::Table(t) = self.parse_table(TableKind::LTable, pos)? {
                    program.tables.push(t);
                }
            }
            "BUZZ" => {
                let words = self.parse_word_list()?;
                program.buzz_words.extend(words);
            }
            "SYNONYM" => {
                let words = self.parse_word_list()?;
                if !words.is_empty() {
                    program.synonym_groups.push(words);
                }
            }
            "BIT-SYNONYM" => {
                let original = self.expect_atom("original flag")?;
                while !self.at(&TokenKind::RAngle) {
                    let alias = self.expect_atom("alias flag")?;
                    program
                        .bit_synonyms
                        .push((original.to_uppercase(), alias.to_uppercase()));
                }
                self.advance();
            }
            "PREP-SYNONYM" => {
                let canonical = self.expect_atom("canonical preposition")?;
                let mut synonyms = Vec::new();
                while !self.at(&TokenKind::RAngle) {
                    synonyms.push(self.expect_atom("preposition synonym")?);
                }
                self.advance();
                program.prep_synonyms.push((canonical, synonyms));
            }
            "REMOVE-SYNONYM" => {
                while !self.at(&TokenKind::RAngle) {
                    let word = self.expect_atom("word")?;
                    program.removed_synonyms.push(word);
                }
                self.advance();
            }
            "DIRECTIONS" => {
                let names = self.parse_word_list()?;
                program.directions = names;
            }
            "TELL-TOKENS" | "ADD-TELL-TOKENS" => {
                self.parse_tell_tokens(program)?;
            }
            "ORDER-OBJECTS?" => {
                let ordering = self.expect_atom("ordering")?.to_uppercase();
                program.order_objects = match ordering.as_str() {
                    "ROOMS-FIRST" | "ROOMS-AND-LGS-FIRST" => OrderObjects::RoomsFirst,
                    "REVERSE-DEFINED" => OrderObjects::ReverseDefined,
                    _ => OrderObjects::Defined,
                };
                while !self.at(&TokenKind::RAngle) {
                    self.advance();
                }
                self.advance();
            }
            "ORDER-TREE?" => {
                let ordering = self.expect_atom("ordering")?.to_uppercase();
                program.order_tree = match ordering.as_str() {
                    "DEFINED" => OrderTree::Defined,
                    _ => OrderTree::ReverseDefined,
                };
                while !self.at(&TokenKind::RAngle) {
                    self.advance();
                }
                self.advance();
            }
            "LONG-WORDS?" => {
                program.long_words = true;
                while !self.at(&TokenKind::RAngle) {
                    self.advance();
                }
                self.advance();
            }
            "DEFINE-GLOBALS" => {
                let node = self.parse_define_globals(pos)?;
                program.define_globals.push(node);
            }
            _ => {
                // Generic form: collect operands, keep the few with
                // compile-time meaning, ignore the rest.
                let mut operands = Vec::new();
                while !self.at(&TokenKind::RAngle) {
                    if self.at(&TokenKind::Eof) {
                        return Err(self.error("unclosed form"));
                    }
                    operands.push(self.parse_expression()?);
                }
                self.advance();
                let form = FormNode {
                    operator: Box::new(operator),
                    operands,
                    pos,
                };
                match op.as_str() {
                    "ZPUT" | "PUTB" | "ZGET" | "ZREST" => {
                        program.compile_time_ops.push(form);
                    }
                    "PUTPROP" => {
                        if form.operands.len() == 2
                            && form.operands[1]
                                .atom_name()
                                .map_or(false, |n| n.eq_ignore_ascii_case("PROPSPEC"))
                        {
                            if let Some(name) = form.operands[0].atom_name() {
                                program.cleared_propspecs.push(name.to_uppercase());
                            }
                        }
                    }
                    "" | "SETG" | "GDECL" | "SNAME" | "FREQUENT-WORDS?" | "PRINC"
                    | "OR" | "AND" => {}
                    other => debug!("ignoring top-level form <{} ...>", other),
                }
            }
        }
        Ok(())
    }

    fn parse_version(&mut self) -> Result<u8, CompilerError> {
        let version = match self.current().kind.clone() {
            TokenKind::Number(n) if (1..=8).contains(&n) => {
                self.advance();
                n as u8
            }
            TokenKind::Atom(name) => {
                self.advance();
                match name.to_uppercase().as_str() {
                    "ZIP" => 3,
                    "EZIP" => 4,
                    "XZIP" => 5,
                    "YZIP" => 6,
                    other => {
                        return Err(self.error(&format!("unknown VERSION {}", other)));
                    }
                }
            }
            _ => return Err(self.error("VERSION requires a number or ZIP/EZIP/XZIP/YZIP")),
        };
        // Trailing options (TIME etc.) are tolerated and skipped
        while !self.at(&TokenKind::RAngle) {
            if self.at(&TokenKind::Eof) {
                return Err(self.error("unclosed VERSION"));
            }
            self.advance();
        }
        self.advance();
        Ok(version)
    }

    /// <ROUTINE name [activation] (params "OPT" opts "AUX" auxes) body...>
    fn parse_routine(&mut self, pos: SourcePos) -> Result<RoutineNode, CompilerError> {
        let name = self.expect_atom("routine name")?;

        let mut activation = None;
        if let TokenKind::Atom(act) = self.current().kind.clone() {
            // An atom between the name and the parameter list names the
            // activation for RETURN/AGAIN.
            self.advance();
            activation = Some(act);
        }

        let mut routine = RoutineNode {
            name,
            required_params: Vec::new(),
            opt_params: Vec::new(),
            aux_vars: Vec::new(),
            local_defaults: Default::default(),
            body: Vec::new(),
            activation,
            pos,
        };

        #[derive(PartialEq, Clone, Copy)]
        enum Mode {
            Required,
            Optional,
            Aux,
        }
        let mut mode = Mode::Required;

        if self.at(&TokenKind::LParen) {
            self.advance();
            while !self.at(&TokenKind::RParen) {
                match self.current().kind.clone() {
                    TokenKind::Str(s) => {
                        self.advance();
                        match s.to_uppercase().as_str() {
                            "AUX" | "EXTRA" => mode = Mode::Aux,
                            "OPT" | "OPTIONAL" => mode = Mode::Optional,
                            // "ARGS"/"TUPLE" collect extra call arguments;
                            // the next name is treated as an optional.
                            "ARGS" | "TUPLE" => mode = Mode::Optional,
                            "NAME" | "ACT" => {
                                // "NAME" string followed by activation atom
                                if let TokenKind::Atom(act) = self.current().kind.clone() {
                                    self.advance();
                                    routine.activation = Some(act);
                                }
                            }
                            other => {
                                return Err(self.error(&format!(
                                    "unknown parameter marker \"{}\"",
                                    other
                                )))
                            }
                        }
                    }
                    TokenKind::Atom(raw) => {
                        self.advance();
                        let name = strip_decl(&raw);
                        match mode {
                            Mode::Required => routine.required_params.push(name),
                            Mode::Optional => routine.opt_params.push(name),
                            Mode::Aux => routine.aux_vars.push(name),
                        }
                    }
                    TokenKind::Quote => {
                        // 'NAME - call-by-reference marker, name only
                        self.advance();
                        let raw = self.expect_atom("parameter name")?;
                        let name = strip_decl(&raw);
                        match mode {
                            Mode::Required => routine.required_params.push(name),
                            Mode::Optional => routine.opt_params.push(name),
                            Mode::Aux => routine.aux_vars.push(name),
                        }
                    }
                    TokenKind::LParen => {
                        // (name default)
                        self.advance();
                        let raw = self.expect_atom("parameter name")?;
                        let name = strip_decl(&raw);
                        let default = self.parse_expression()?;
                        self.expect(&TokenKind::RParen, ")")?;
                        routine.local_defaults.insert(name.clone(), default);
                        match mode {
                            Mode::Required => routine.required_params.push(name),
                            Mode::Optional => routine.opt_params.push(name),
                            Mode::Aux => routine.aux_vars.push(name),
                        }
                    }
                    _ => return Err(self.error("expected parameter name")),
                }
            }
            self.advance();
        }

        while !self.at(&TokenKind::RAngle) {
            if self.at(&TokenKind::Eof) {
                return Err(self.error("unclosed ROUTINE"));
            }
            routine.body.push(self.parse_expression()?);
        }
        self.advance();
        Ok(routine)
    }

    /// <OBJECT name (prop value...) ...> - also ROOM.
    fn parse_object(&mut self, pos: SourcePos) -> Result<ObjectDef, CompilerError> {
        let name = self.expect_atom("object name")?;
        let mut properties = Vec::new();

        while self.at(&TokenKind::LParen) {
            let prop_pos = self.current_pos();
            self.advance();
            let prop_name = self.expect_atom("property name")?;
            let mut values = Vec::new();
            while !self.at(&TokenKind::RParen) {
                if self.at(&TokenKind::Eof) {
                    return Err(self.error("unclosed property"));
                }
                values.push(self.parse_expression()?);
            }
            self.advance();
            properties.push(PropertyDef {
                name: prop_name.to_uppercase(),
                values,
                pos: prop_pos,
            });
        }

        self.expect(&TokenKind::RAngle, ">")?;
        Ok(ObjectDef {
            name,
            properties,
            pos,
        })
    }

    /// <SYNTAX verb [(syn...)] word-or-OBJECT... [(flags)...] = action [preaction]>
    fn parse_syntax(&mut self, pos: SourcePos) -> Result<SyntaxNode, CompilerError> {
        let mut syntax = SyntaxNode {
            pattern: Vec::new(),
            action_routine: String::new(),
            preaction: None,
            verb_synonyms: Vec::new(),
            object_flags: Vec::new(),
            pos,
        };

        let mut object_count = 0usize;

        while !self.at_atom("=") {
            if self.at(&TokenKind::Eof) {
                return Err(self.error("expected = in SYNTAX"));
            }
            match self.current().kind.clone() {
                TokenKind::Atom(word) => {
                    self.advance();
                    if word.eq_ignore_ascii_case("OBJECT") {
                        object_count += 1;
                        syntax.object_flags.push(Vec::new());
                    }
                    syntax.pattern.push(word.to_uppercase());
                }
                TokenKind::LParen => {
                    self.advance();
                    let mut items = Vec::new();
                    while !self.at(&TokenKind::RParen) {
                        match self.current().kind.clone() {
                            TokenKind::Atom(a) => {
                                self.advance();
                                items.push(a.to_uppercase());
                            }
                            TokenKind::Semicolon => {
                                self.advance();
                            }
                            _ => return Err(self.error("expected atom in SYNTAX list")),
                        }
                    }
                    self.advance();
                    if syntax.pattern.len() == 1 && object_count == 0 {
                        // (synonyms) straight after the verb
                        syntax.verb_synonyms.extend(items);
                    } else if object_count > 0 {
                        // Scope flags for the most recent OBJECT; a FIND
                        // list keeps its head word.
                        syntax.object_flags[object_count - 1].extend(items);
                    }
                }
                _ => return Err(self.error("unexpected token in SYNTAX pattern")),
            }
        }
        self.advance(); // =

        syntax.action_routine = self.expect_atom("action routine")?;
        if let TokenKind::Atom(pre) = self.current().kind.clone() {
            self.advance();
            syntax.preaction = Some(pre);
        }
        self.expect(&TokenKind::RAngle, ">")?;
        Ok(syntax)
    }

    fn parse_global(&mut self, pos: SourcePos) -> Result<GlobalNode, CompilerError> {
        let name = self.expect_atom("global name")?;
        let name = strip_decl(&name);
        let mut value = None;
        if !self.at(&TokenKind::RAngle) {
            value = Some(self.parse_expression()?);
        }
        // Trailing decl junk is tolerated
        while !self.at(&TokenKind::RAngle) {
            if self.at(&TokenKind::Eof) {
                return Err(self.error("unclosed GLOBAL"));
            }
            self.advance();
        }
        self.advance();
        Ok(GlobalNode { name, value, pos })
    }

    fn parse_constant(&mut self, pos: SourcePos) -> Result<ConstantNode, CompilerError> {
        let name = self.expect_atom("constant name")?;
        let name = strip_decl(&name);
        let value = self.parse_expression()?;
        while !self.at(&TokenKind::RAngle) {
            if self.at(&TokenKind::Eof) {
                return Err(self.error("unclosed CONSTANT"));
            }
            self.advance();
        }
        self.advance();
        Ok(ConstantNode { name, value, pos })
    }

    /// <PROPDEF name default (pattern)...>
    fn parse_propdef(&mut self, pos: SourcePos) -> Result<PropdefNode, CompilerError> {
        let name = self.expect_atom("property name")?;

        let mut default = None;
        if !self.at(&TokenKind::RAngle) && !self.at(&TokenKind::LParen) {
            default = Some(self.parse_expression()?);
        }

        let mut patterns = Vec::new();
        while self.at(&TokenKind::LParen) {
            if let ZilNode::List(items) = self.parse_list()? {
                patterns.push(items);
            }
        }
        self.expect(&TokenKind::RAngle, ">")?;

        Ok(PropdefNode {
            name: name.to_uppercase(),
            default,
            patterns,
            pos,
        })
    }

    /// <DEFMAC name ('x "ARGS" rest "AUX" tmp "OPT" o) body...>
    fn parse_defmac(&mut self, pos: SourcePos) -> Result<MacroNode, CompilerError> {
        let name = self.expect_atom("macro name")?;

        let mut params = Vec::new();
        let mut aux = false;
        let mut optional = false;
        let mut tuple_next = false;

        if self.at(&TokenKind::LParen) {
            self.advance();
            while !self.at(&TokenKind::RParen) {
                match self.current().kind.clone() {
                    TokenKind::Str(marker) => {
                        self.advance();
                        match marker.to_uppercase().as_str() {
                            "AUX" | "EXTRA" => {
                                aux = true;
                                optional = false;
                            }
                            "OPT" | "OPTIONAL" => {
                                optional = true;
                                aux = false;
                            }
                            "ARGS" | "TUPLE" => tuple_next = true,
                            other => {
                                return Err(self.error(&format!(
                                    "unknown macro parameter marker \"{}\"",
                                    other
                                )))
                            }
                        }
                    }
                    TokenKind::Quote => {
                        self.advance();
                        let raw = self.expect_atom("macro parameter")?;
                        params.push(MacroParam {
                            name: strip_decl(&raw).to_uppercase(),
                            quoted: true,
                            tuple: tuple_next,
                            aux,
                            optional,
                        });
                        tuple_next = false;
                    }
                    TokenKind::Atom(raw) => {
                        self.advance();
                        params.push(MacroParam {
                            name: strip_decl(&raw).to_uppercase(),
                            quoted: false,
                            tuple: tuple_next,
                            aux,
                            optional,
                        });
                        tuple_next = false;
                    }
                    TokenKind::LParen => {
                        // (name default) - default is kept only as a marker
                        self.advance();
                        let raw = self.expect_atom("macro parameter")?;
                        while !self.at(&TokenKind::RParen) {
                            if self.at(&TokenKind::Eof) {
                                return Err(self.error("unclosed macro parameter"));
                            }
                            self.parse_expression()?;
                        }
                        self.advance();
                        params.push(MacroParam {
                            name: strip_decl(&raw).to_uppercase(),
                            quoted: false,
                            tuple: false,
                            aux,
                            optional,
                        });
                    }
                    _ => return Err(self.error("expected macro parameter")),
                }
            }
            self.advance();
        }

        let mut body = Vec::new();
        while !self.at(&TokenKind::RAngle) {
            if self.at(&TokenKind::Eof) {
                return Err(self.error("unclosed DEFMAC"));
            }
            body.push(self.parse_expression()?);
        }
        self.advance();

        Ok(MacroNode {
            name: name.to_uppercase(),
            params,
            body,
            pos,
        })
    }

    /// <TELL-TOKENS TOK [* ...] <EXPANSION> ...>
    fn parse_tell_tokens(&mut self, program: &mut Program) -> Result<(), CompilerError> {
        while !self.at(&TokenKind::RAngle) {
            if self.at(&TokenKind::Eof) {
                return Err(self.error("unclosed TELL-TOKENS"));
            }

            let name = match self.current().kind.clone() {
                TokenKind::Atom(a) => {
                    self.advance();
                    a.to_uppercase()
                }
                TokenKind::Str(s) => {
                    self.advance();
                    s.to_uppercase()
                }
                _ => return Err(self.error("expected TELL token name")),
            };

            let mut arg_count = 0;
            let mut pattern = None;
            loop {
                if self.at_atom("*") {
                    self.advance();
                    arg_count += 1;
                } else if self.at(&TokenKind::LAngle) {
                    break;
                } else if matches!(
                    self.current().kind,
                    TokenKind::GlobalVar(_) | TokenKind::LocalVar(_) | TokenKind::Number(_)
                ) {
                    // A specific argument pattern, e.g. D ,PRSO <...>
                    pattern = Some(self.parse_expression()?);
                } else {
                    break;
                }
            }

            if !self.at(&TokenKind::LAngle) {
                return Err(self.error("expected TELL token expansion form"));
            }
            let expansion = self.parse_form()?;

            program.tell_tokens.push(TellTokenDef {
                name,
                arg_count,
                pattern,
                expansion,
            });
        }
        self.advance();
        Ok(())
    }

    /// <DEFINE-GLOBALS table (NAME [BYTE|WORD] value)...>
    fn parse_define_globals(&mut self, pos: SourcePos) -> Result<DefineGlobalsNode, CompilerError> {
        let table_name = self.expect_atom("table name")?.to_uppercase();
        let mut entries = Vec::new();

        while self.at(&TokenKind::LParen) {
            self.advance();
            let raw = self.expect_atom("global name")?;
            let (name, adecl) = match raw.split_once(':') {
                Some((n, d)) => (n.to_uppercase(), Some(d.to_uppercase())),
                None => (raw.to_uppercase(), None),
            };

            let mut is_byte = false;
            if self.at_atom("BYTE") {
                self.advance();
                is_byte = true;
            } else if self.at_atom("WORD") {
                self.advance();
            }

            let value = if self.at(&TokenKind::RParen) {
                ZilNode::Number(0)
            } else {
                self.parse_expression()?
            };
            while !self.at(&TokenKind::RParen) {
                if self.at(&TokenKind::Eof) {
                    return Err(self.error("unclosed DEFINE-GLOBALS entry"));
                }
                self.advance();
            }
            self.advance();

            entries.push(DefineGlobalEntry {
                name,
                value,
                is_byte,
                adecl,
            });
        }
        self.expect(&TokenKind::RAngle, ">")?;

        Ok(DefineGlobalsNode {
            table_name,
            entries,
            pos,
        })
    }

    /// Atoms up to the closing >, skipping ZILF `;` separators.
    fn parse_word_list(&mut self) -> Result<Vec<String>, CompilerError> {
        let mut words = Vec::new();
        while !self.at(&TokenKind::RAngle) {
            match self.current().kind.clone() {
                TokenKind::Atom(word) => {
                    self.advance();
                    words.push(word.to_uppercase());
                }
                TokenKind::Semicolon => {
                    self.advance();
                }
                TokenKind::Str(word) => {
                    self.advance();
                    words.push(word.to_uppercase());
                }
                TokenKind::Eof => return Err(self.error("unclosed word list")),
                _ => return Err(self.error("expected word")),
            }
        }
        self.advance();
        Ok(words)
    }

    /// One expression: atom, literal, variable, list, or form.
    pub fn parse_expression(&mut self) -> Result<ZilNode, CompilerError> {
        let pos = self.current_pos();
        match self.current().kind.clone() {
            TokenKind::LAngle => self.parse_form(),
            TokenKind::Atom(name) => {
                self.advance();
                match name.as_str() {
                    "`" => Ok(ZilNode::Quasiquote(Box::new(self.parse_expression()?))),
                    "~" => Ok(ZilNode::Unquote(Box::new(self.parse_expression()?))),
                    "~!" => Ok(ZilNode::SpliceUnquote(Box::new(self.parse_expression()?))),
                    "!" => {
                        // Splice operator: !.VAR / !<form>
                        let operand = self.parse_expression()?;
                        Ok(ZilNode::Form(FormNode {
                            operator: Box::new(ZilNode::Atom("!".to_string(), pos)),
                            operands: vec![operand],
                            pos,
                        }))
                    }
                    _ => Ok(ZilNode::Atom(name, pos)),
                }
            }
            TokenKind::Number(value) => {
                self.advance();
                Ok(ZilNode::Number(value))
            }
            TokenKind::Str(value) => {
                self.advance();
                Ok(ZilNode::Str(value))
            }
            TokenKind::LocalVar(name) => {
                self.advance();
                Ok(ZilNode::LocalVar(name))
            }
            TokenKind::GlobalVar(name) => {
                self.advance();
                Ok(ZilNode::GlobalVar(name))
            }
            TokenKind::CharLocalVar(name) => {
                self.advance();
                Ok(ZilNode::CharLocalVar(name))
            }
            TokenKind::CharGlobalVar(name) => {
                self.advance();
                Ok(ZilNode::CharGlobalVar(name))
            }
            TokenKind::Quote => {
                self.advance();
                Ok(ZilNode::Quote(Box::new(self.parse_expression()?)))
            }
            TokenKind::LParen => self.parse_list(),
            TokenKind::LBracket => {
                // Bracketed vectors are treated like lists
                self.advance();
                let mut items = Vec::new();
                while !self.at(&TokenKind::RBracket) {
                    if self.at(&TokenKind::Eof) {
                        return Err(self.error("unclosed vector"));
                    }
                    items.push(self.parse_expression()?);
                }
                self.advance();
                Ok(ZilNode::List(items))
            }
            TokenKind::Semicolon => {
                self.advance();
                Ok(ZilNode::Atom(";".to_string(), pos))
            }
            other => Err(CompilerError::UnexpectedToken(
                self.filename.clone(),
                format!("{:?} in expression", other),
                pos,
            )),
        }
    }

    fn parse_list(&mut self) -> Result<ZilNode, CompilerError> {
        self.expect(&TokenKind::LParen, "(")?;
        let mut items = Vec::new();
        while !self.at(&TokenKind::RParen) {
            if self.at(&TokenKind::Eof) {
                return Err(self.error("unclosed list"));
            }
            items.push(self.parse_expression()?);
        }
        self.advance();
        Ok(ZilNode::List(items))
    }

    fn parse_form(&mut self) -> Result<ZilNode, CompilerError> {
        let pos = self.current_pos();
        self.expect(&TokenKind::LAngle, "<")?;

        if self.at(&TokenKind::RAngle) {
            self.advance();
            return Ok(ZilNode::false_value());
        }

        let operator = self.parse_expression()?;

        if let Some(name) = operator.atom_name() {
            match name.to_uppercase().as_str() {
                "COND" => return self.parse_cond(pos),
                "REPEAT" => return self.parse_repeat(pos),
                "TABLE" => return self.parse_table(TableKind::Table, pos),
                "ITABLE" => return self.parse_table(TableKind::ITable, pos),
                "LTABLE" => return self.parse_table(TableKind::LTable, pos),
                _ => {}
            }
        }

        let mut operands = Vec::new();
        while !self.at(&TokenKind::RAngle) {
            if self.at(&TokenKind::Eof) {
                return Err(self.error("unclosed form"));
            }
            operands.push(self.parse_expression()?);
        }
        self.expect(&TokenKind::RAngle, ">")?;

        Ok(ZilNode::Form(FormNode {
            operator: Box::new(operator),
            operands,
            pos,
        }))
    }

    fn parse_cond(&mut self, pos: SourcePos) -> Result<ZilNode, CompilerError> {
        let mut clauses = Vec::new();

        while self.at(&TokenKind::LParen) {
            self.advance();
            let test = self.parse_expression()?;
            let mut body = Vec::new();
            while !self.at(&TokenKind::RParen) {
                if self.at(&TokenKind::Eof) {
                    return Err(self.error("unclosed COND clause"));
                }
                body.push(self.parse_expression()?);
            }
            self.advance();
            clauses.push(CondClause { test, body });
        }
        self.expect(&TokenKind::RAngle, ">")?;

        Ok(ZilNode::Cond(CondNode { clauses, pos }))
    }

    fn parse_repeat(&mut self, pos: SourcePos) -> Result<ZilNode, CompilerError> {
        // <REPEAT (bindings...) body...> - bindings may be empty; an
        // optional sole (condition) clause after the bindings is an exit
        // test, but only when more body follows (otherwise it is body).
        let mut bindings = Vec::new();

        if self.at(&TokenKind::LParen) {
            self.advance();
            while !self.at(&TokenKind::RParen) {
                match self.current().kind.clone() {
                    TokenKind::LParen => {
                        self.advance();
                        let name = self.expect_atom("binding name")?;
                        let init = self.parse_expression()?;
                        self.expect(&TokenKind::RParen, ")")?;
                        bindings.push((strip_decl(&name), Some(init)));
                    }
                    TokenKind::Atom(name) => {
                        self.advance();
                        bindings.push((strip_decl(&name), None));
                    }
                    _ => return Err(self.error("expected binding in REPEAT")),
                }
            }
            self.advance();
        }

        let mut exit_cond = None;
        if self.at(&TokenKind::LParen) {
            let saved = self.pos;
            self.advance();
            let candidate = self.parse_expression();
            match candidate {
                Ok(expr) if self.at(&TokenKind::RParen) => {
                    self.advance();
                    if self.at(&TokenKind::RAngle) || self.at(&TokenKind::Eof) {
                        // Sole clause was really the body; rewind.
                        self.pos = saved;
                    } else {
                        exit_cond = Some(Box::new(expr));
                    }
                }
                _ => {
                    self.pos = saved;
                }
            }
        }

        let mut body = Vec::new();
        while !self.at(&TokenKind::RAngle) {
            if self.at(&TokenKind::Eof) {
                return Err(self.error("unclosed REPEAT"));
            }
            body.push(self.parse_expression()?);
        }
        self.expect(&TokenKind::RAngle, ">")?;

        Ok(ZilNode::Repeat(RepeatNode {
            bindings,
            exit_cond,
            body,
            pos,
        }))
    }

    fn parse_table(&mut self, kind: TableKind, pos: SourcePos) -> Result<ZilNode, CompilerError> {
        let mut flags = Vec::new();
        let mut size = None;
        let mut pattern = Vec::new();

        // ITABLE/LTABLE may lead with a size (number) or NONE/BYTE/WORD
        // specifier followed by a size.
        if kind != TableKind::Table {
            match self.current().kind.clone() {
                TokenKind::Number(_) => {
                    size = Some(Box::new(self.parse_expression()?));
                }
                TokenKind::Atom(a) => {
                    let specifier = a.to_uppercase();
                    if matches!(specifier.as_str(), "NONE" | "BYTE" | "WORD") {
                        self.advance();
                        if specifier != "NONE" {
                            flags.push(specifier);
                        }
                        if matches!(self.current().kind, TokenKind::Number(_)) {
                            size = Some(Box::new(self.parse_expression()?));
                        }
                    }
                }
                _ => {}
            }
        }

        // Flag list: (BYTE), (PURE), (PATTERN (...)) etc.
        if self.at(&TokenKind::LParen) {
            self.advance();
            while !self.at(&TokenKind::RParen) {
                if self.at_atom("PATTERN") {
                    self.advance();
                    self.parse_table_pattern(&mut pattern)?;
                } else {
                    flags.push(self.expect_atom("table flag")?.to_uppercase());
                }
            }
            self.advance();
        }

        let mut values = Vec::new();
        while !self.at(&TokenKind::RAngle) {
            if self.at(&TokenKind::Eof) {
                return Err(self.error("unclosed table"));
            }
            values.push(self.parse_expression()?);
        }
        self.expect(&TokenKind::RAngle, ">")?;

        Ok(ZilNode::Table(TableNode {
            kind,
            flags,
            size,
            values,
            pattern,
            pos,
        }))
    }

    /// PATTERN (BYTE WORD [REST WORD]) - element types, [REST t] repeats.
    fn parse_table_pattern(
        &mut self,
        pattern: &mut Vec<(String, bool)>,
    ) -> Result<(), CompilerError> {
        self.expect(&TokenKind::LParen, "(")?;
        while !self.at(&TokenKind::RParen) {
            match self.current().kind.clone() {
                TokenKind::Atom(name) => {
                    self.advance();
                    pattern.push((name.to_uppercase(), false));
                }
                TokenKind::LBracket => {
                    self.advance();
                    let mut rest = false;
                    while !self.at(&TokenKind::RBracket) {
                        let name = self.expect_atom("pattern element")?.to_uppercase();
                        if name == "REST" {
                            rest = true;
                        } else {
                            pattern.push((name, rest));
                        }
                    }
                    self.advance();
                }
                _ => return Err(self.error("expected PATTERN element")),
            }
        }
        self.advance();
        Ok(())
    }
}

/// Strip an MDL type annotation: `X:FIX` names the variable X.
fn strip_decl(name: &str) -> String {
    match name.split_once(':') {
        Some((base, _)) if !base.is_empty() => base.to_string(),
        _ => name.to_string(),
    }
}

#[cfg(test)]
#[path = "parser_tests.rs"]
mod tests;
