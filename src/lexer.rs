// ZIL Lexer
//
// Tokenizes ZIL source into a linear stream over the delimiters <> () [],
// atoms, strings, numbers, and variable-prefixed tokens. Tracks angle and
// paren depth because `;` is overloaded: comment in most positions, ZILF
// synonym separator when it abuts a word inside parens but outside angles.

use crate::error::{CompilerError, SourcePos};

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Delimiters
    LAngle,
    RAngle,
    LParen,
    RParen,
    LBracket,
    RBracket,

    // Literals
    Atom(String),
    Str(String),
    Number(i32),

    // Variable prefixes
    LocalVar(String),
    GlobalVar(String),
    /// %.VAR - character-printing local (TELL)
    CharLocalVar(String),
    /// %,VAR - character-printing global (TELL)
    CharGlobalVar(String),

    // Special
    Comma,
    Period,
    Quote,
    /// `;` used as a ZILF separator inside parens
    Semicolon,
    /// `%<` form left for the parser (the preprocessor handles most)
    PercentLAngle,

    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub pos: SourcePos,
}

pub struct Lexer {
    input: Vec<char>,
    filename: String,
    pos: usize,
    line: usize,
    column: usize,
    paren_depth: i32,
    angle_depth: i32,
    tokens: Vec<Token>,
}

impl Lexer {
    pub fn new(input: &str, filename: &str) -> Self {
        Lexer {
            input: input.chars().collect(),
            filename: filename.to_string(),
            pos: 0,
            line: 1,
            column: 1,
            paren_depth: 0,
            angle_depth: 0,
            tokens: Vec::new(),
        }
    }

    fn here(&self) -> SourcePos {
        SourcePos::new(self.line, self.column)
    }

    fn peek(&self) -> Option<char> {
        self.input.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.input.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.input.get(self.pos).copied()?;
        self.pos += 1;
        if ch == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(ch)
    }

    fn push(&mut self, kind: TokenKind, pos: SourcePos) {
        self.tokens.push(Token { kind, pos });
    }

    fn is_atom_char(ch: char) -> bool {
        // % appears in umlaut-encoded atoms, : in MDL type annotations,
        // ! in atoms like ON!-INITIAL, ' in possessives (CAT'S).
        ch.is_alphanumeric() || "-_?+*/=$#;.%:&^!|'".contains(ch)
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.peek() {
            if ch.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn read_atom(&mut self) -> String {
        let mut out = String::new();
        while let Some(ch) = self.peek() {
            if Self::is_atom_char(ch) {
                out.push(self.advance().unwrap());
            } else if ch == '\\' && self.peek_at(1).map_or(false, |c| !c.is_whitespace()) {
                // Backslash escape keeps a delimiter inside the atom (A?G\'S)
                out.push(self.advance().unwrap());
                out.push(self.advance().unwrap());
            } else {
                break;
            }
        }
        out
    }

    fn read_string(&mut self) -> Result<String, CompilerError> {
        let start = self.here();
        self.advance(); // opening "
        let mut out = String::new();

        loop {
            match self.peek() {
                None => {
                    return Err(CompilerError::UnterminatedString(
                        self.filename.clone(),
                        start,
                    ))
                }
                Some('"') => {
                    self.advance();
                    return Ok(out);
                }
                Some('\\') => {
                    self.advance();
                    match self.advance() {
                        Some('n') => out.push('\n'),
                        Some('t') => out.push('\t'),
                        Some('\\') => out.push('\\'),
                        Some('"') => out.push('"'),
                        Some(ch) => out.push(ch),
                        None => {
                            return Err(CompilerError::UnterminatedString(
                                self.filename.clone(),
                                start,
                            ))
                        }
                    }
                }
                Some(_) => out.push(self.advance().unwrap()),
            }
        }
    }

    fn read_decimal(&mut self) -> i32 {
        let mut value: i64 = 0;
        let mut negative = false;
        if self.peek() == Some('-') {
            negative = true;
            self.advance();
        }
        while let Some(ch) = self.peek() {
            if let Some(d) = ch.to_digit(10) {
                value = value * 10 + d as i64;
                self.advance();
            } else {
                break;
            }
        }
        if negative {
            -value as i32
        } else {
            value as i32
        }
    }

    /// Skip a bracketed region honouring nesting and string literals.
    fn skip_balanced(&mut self, open: char, close: char) -> Result<(), CompilerError> {
        let start = self.here();
        if self.peek() != Some(open) {
            return Ok(());
        }
        self.advance();
        let mut depth = 1;

        while depth > 0 {
            match self.peek() {
                None => {
                    return Err(CompilerError::UnterminatedComment(
                        self.filename.clone(),
                        start,
                    ))
                }
                Some('"') => {
                    self.advance();
                    loop {
                        match self.peek() {
                            None => {
                                return Err(CompilerError::UnterminatedComment(
                                    self.filename.clone(),
                                    start,
                                ))
                            }
                            Some('\\') => {
                                self.advance();
                                self.advance();
                            }
                            Some('"') => {
                                self.advance();
                                break;
                            }
                            Some(_) => {
                                self.advance();
                            }
                        }
                    }
                }
                Some(ch) if ch == open => {
                    depth += 1;
                    self.advance();
                }
                Some(ch) if ch == close => {
                    depth -= 1;
                    self.advance();
                }
                Some(_) => {
                    self.advance();
                }
            }
        }
        Ok(())
    }

    /// Skip a comment starting at `;`. Handles ;"...", ;<...>, ;(...),
    /// ;[...], ;%<form>, and single-token ;word comments.
    fn skip_comment(&mut self) -> Result<(), CompilerError> {
        let start = self.here();
        self.advance(); // ;
        while matches!(self.peek(), Some(' ') | Some('\t')) {
            self.advance();
        }

        match self.peek() {
            Some('%') => {
                // MDL load-time conditional: ;%<COND ...>
                self.advance();
                while matches!(self.peek(), Some(' ') | Some('\t')) {
                    self.advance();
                }
                match self.peek() {
                    Some('<') => self.skip_balanced('<', '>')?,
                    Some('(') => self.skip_balanced('(', ')')?,
                    Some('[') => self.skip_balanced('[', ']')?,
                    _ => {}
                }
            }
            Some('"') => {
                self.advance();
                loop {
                    match self.peek() {
                        None => {
                            return Err(CompilerError::UnterminatedComment(
                                self.filename.clone(),
                                start,
                            ))
                        }
                        Some('\\') => {
                            self.advance();
                            self.advance();
                        }
                        Some('"') => {
                            self.advance();
                            break;
                        }
                        Some(_) => {
                            self.advance();
                        }
                    }
                }
            }
            Some('<') => self.skip_balanced('<', '>')?,
            Some('(') => self.skip_balanced('(', ')')?,
            Some('[') => self.skip_balanced('[', ']')?,
            _ => {
                // Comments out one token: read until whitespace or delimiter
                while let Some(ch) = self.peek() {
                    if ch.is_whitespace() || "<>()".contains(ch) {
                        break;
                    }
                    self.advance();
                }
            }
        }
        Ok(())
    }

    /// Skip a %<...> form entirely (top level) or emit a zero placeholder
    /// (inside a form) so the stream stays parseable. The preprocessor has
    /// already evaluated every form it understands.
    fn skip_percent_form(&mut self) {
        let pos = self.here();
        let inside_form = self.angle_depth > 0 || self.paren_depth > 0;
        self.advance(); // %
        self.advance(); // <
        let mut depth = 1;
        while depth > 0 {
            match self.advance() {
                None => break,
                Some('<') => depth += 1,
                Some('>') => depth -= 1,
                Some('!') => {
                    // Character literal !\X (possibly a literal bracket)
                    if self.peek() == Some('\\') {
                        self.advance();
                        self.advance();
                    } else {
                        self.advance();
                    }
                }
                Some('"') => loop {
                    match self.advance() {
                        None | Some('"') => break,
                        Some('\\') => {
                            self.advance();
                        }
                        Some(_) => {}
                    }
                },
                Some(_) => {}
            }
        }
        if inside_form {
            self.push(TokenKind::Number(0), pos);
        }
    }

    pub fn tokenize(mut self) -> Result<Vec<Token>, CompilerError> {
        while self.pos < self.input.len() {
            self.skip_whitespace();
            let Some(ch) = self.peek() else { break };
            let pos = self.here();

            // MDL control-character digraphs: ^/X, ^\X, ^<ctrl> are page
            // breaks, treated as whitespace.
            if ch == '^' {
                match self.peek_at(1) {
                    Some('/') | Some('\\') => {
                        self.advance();
                        self.advance();
                        self.advance();
                        continue;
                    }
                    Some(c) if (c as u32) < 32 => {
                        self.advance();
                        self.advance();
                        continue;
                    }
                    _ => {}
                }
            }

            if ch == ';' {
                // ;= is an atom (BUZZ words); ;WORD with no whitespace
                // inside parens but outside angles is the ZILF separator.
                let next = self.peek_at(1);
                if next == Some('=') {
                    let value = self.read_atom();
                    self.push(TokenKind::Atom(value), pos);
                } else if self.paren_depth > 0
                    && self.angle_depth == 0
                    && next.map_or(false, |c| c.is_alphanumeric())
                {
                    self.advance();
                    self.push(TokenKind::Semicolon, pos);
                } else {
                    self.skip_comment()?;
                }
                continue;
            }

            // %,VAR and %.VAR print as characters in TELL
            let mut percent_prefix = false;
            let mut ch = ch;
            if ch == '%' {
                match self.peek_at(1) {
                    Some(',') | Some('.') => {
                        percent_prefix = true;
                        self.advance();
                        ch = self.peek().unwrap();
                    }
                    Some('<') => {
                        self.skip_percent_form();
                        continue;
                    }
                    _ => {}
                }
            }

            match ch {
                '<' => {
                    self.advance();
                    self.angle_depth += 1;
                    self.push(TokenKind::LAngle, pos);
                }
                '>' => {
                    self.advance();
                    self.angle_depth -= 1;
                    self.push(TokenKind::RAngle, pos);
                }
                '(' => {
                    self.advance();
                    self.paren_depth += 1;
                    self.push(TokenKind::LParen, pos);
                }
                ')' => {
                    self.advance();
                    self.paren_depth -= 1;
                    self.push(TokenKind::RParen, pos);
                }
                '[' => {
                    self.advance();
                    self.push(TokenKind::LBracket, pos);
                }
                ']' => {
                    self.advance();
                    self.push(TokenKind::RBracket, pos);
                }
                '"' => {
                    let value = self.read_string()?;
                    self.push(TokenKind::Str(value), pos);
                }
                '.' | ',' => {
                    // Variable reference if a name follows (whitespace allowed)
                    let mut ahead = 1;
                    while matches!(self.peek_at(ahead), Some(' ') | Some('\t')) {
                        ahead += 1;
                    }
                    let starts_name = self
                        .peek_at(ahead)
                        .map_or(false, |c| c.is_alphanumeric() || "-_?".contains(c));
                    if starts_name {
                        self.advance();
                        while matches!(self.peek(), Some(' ') | Some('\t')) {
                            self.advance();
                        }
                        let name = self.read_atom();
                        let kind = match (ch, percent_prefix) {
                            ('.', false) => TokenKind::LocalVar(name),
                            ('.', true) => TokenKind::CharLocalVar(name),
                            (_, false) => TokenKind::GlobalVar(name),
                            (_, true) => TokenKind::CharGlobalVar(name),
                        };
                        self.push(kind, pos);
                    } else {
                        self.advance();
                        let kind = if ch == '.' {
                            TokenKind::Period
                        } else {
                            TokenKind::Comma
                        };
                        self.push(kind, pos);
                    }
                }
                '0'..='9' => {
                    // Digits followed by atom characters form an atom (1ST?)
                    let mut ahead = 0;
                    while self
                        .peek_at(ahead)
                        .map_or(false, |c| c.is_ascii_hexdigit())
                    {
                        ahead += 1;
                    }
                    let after = self.peek_at(ahead);
                    let is_atom = after.map_or(false, |c| {
                        Self::is_atom_char(c) && !c.is_ascii_digit() && c != ';'
                    });
                    if is_atom {
                        let value = self.read_atom();
                        self.push(TokenKind::Atom(value), pos);
                    } else {
                        let value = self.read_decimal();
                        self.push(TokenKind::Number(value), pos);
                    }
                }
                '-' if self.peek_at(1).map_or(false, |c| c.is_ascii_digit()) => {
                    let value = self.read_decimal();
                    self.push(TokenKind::Number(value), pos);
                }
                '$' if self.peek_at(1).map_or(false, |c| c.is_ascii_hexdigit()) => {
                    // $1A3F is hex unless more atom characters follow ($BUZZ)
                    let mut ahead = 1;
                    while self
                        .peek_at(ahead)
                        .map_or(false, |c| c.is_ascii_hexdigit())
                    {
                        ahead += 1;
                    }
                    let after = self.peek_at(ahead);
                    if after.map_or(false, |c| Self::is_atom_char(c) && !c.is_ascii_hexdigit()) {
                        let value = self.read_atom();
                        self.push(TokenKind::Atom(value), pos);
                    } else {
                        self.advance(); // $
                        let mut value: i64 = 0;
                        while let Some(d) = self.peek().and_then(|c| c.to_digit(16)) {
                            value = value * 16 + d as i64;
                            self.advance();
                        }
                        self.push(TokenKind::Number(value as i32), pos);
                    }
                }
                '#' => {
                    self.advance();
                    if self.peek().map_or(false, |c| c.is_ascii_digit()) {
                        // #base value - explicit radix
                        let mut base: u32 = 0;
                        while let Some(d) = self.peek().and_then(|c| c.to_digit(10)) {
                            base = base * 10 + d;
                            self.advance();
                        }
                        while matches!(self.peek(), Some(' ') | Some('\t')) {
                            self.advance();
                        }
                        let mut digits = String::new();
                        while self.peek().map_or(false, |c| c.is_alphanumeric()) {
                            digits.push(self.advance().unwrap());
                        }
                        let value = if base >= 2 && base <= 36 {
                            i32::from_str_radix(&digits, base).unwrap_or(0)
                        } else {
                            0
                        };
                        self.push(TokenKind::Number(value), pos);
                    } else {
                        // MDL type specifier like #SPLICE
                        let mut name = String::from("#");
                        if self
                            .peek()
                            .map_or(false, |c| c.is_alphabetic() || c == '-' || c == '_')
                        {
                            name.push_str(&self.read_atom());
                        }
                        self.push(TokenKind::Atom(name), pos);
                    }
                }
                '!' => {
                    self.advance();
                    match self.peek() {
                        Some('\\') => {
                            // Character literal !\X
                            let mut value = String::from("!");
                            value.push(self.advance().unwrap());
                            if let Some(c) = self.advance() {
                                value.push(c);
                            }
                            self.push(TokenKind::Atom(value), pos);
                        }
                        // Splice operators !<form>, !.VAR, !,VAR: emit the
                        // bare ! and let the parser attach the operand.
                        Some('<') | Some('.') | Some(',') => {
                            self.push(TokenKind::Atom("!".to_string()), pos);
                        }
                        Some(_) => {
                            let mut value = String::from("!");
                            value.push(self.advance().unwrap());
                            self.push(TokenKind::Atom(value), pos);
                        }
                        None => self.push(TokenKind::Atom("!".to_string()), pos),
                    }
                }
                '\\' => {
                    // Escape-prefixed atom: \. \, \,TELL
                    let mut value = String::new();
                    value.push(self.advance().unwrap());
                    if self.peek().map_or(false, |c| !c.is_whitespace()) {
                        value.push(self.advance().unwrap());
                    }
                    while self.peek().map_or(false, Self::is_atom_char) {
                        value.push(self.advance().unwrap());
                    }
                    self.push(TokenKind::Atom(value), pos);
                }
                '*' if self.peek_at(1).map_or(false, |c| c.is_ascii_digit()) => {
                    // Octal: *3777*
                    self.advance();
                    let mut digits = String::new();
                    while self.peek().map_or(false, |c| c.is_ascii_digit()) {
                        digits.push(self.advance().unwrap());
                    }
                    if self.peek() == Some('*') {
                        self.advance();
                        let value = i32::from_str_radix(&digits, 8).map_err(|_| {
                            CompilerError::LexicalError(
                                self.filename.clone(),
                                format!("invalid octal number *{}*", digits),
                                pos,
                            )
                        })?;
                        self.push(TokenKind::Number(value), pos);
                    } else {
                        let mut value = format!("*{}", digits);
                        while self.peek().map_or(false, Self::is_atom_char) {
                            value.push(self.advance().unwrap());
                        }
                        self.push(TokenKind::Atom(value), pos);
                    }
                }
                '\'' => {
                    self.advance();
                    self.push(TokenKind::Quote, pos);
                }
                '`' => {
                    self.advance();
                    self.push(TokenKind::Atom("`".to_string()), pos);
                }
                '~' => {
                    self.advance();
                    if self.peek() == Some('!') {
                        self.advance();
                        self.push(TokenKind::Atom("~!".to_string()), pos);
                    } else {
                        self.push(TokenKind::Atom("~".to_string()), pos);
                    }
                }
                '@' => {
                    // Reader-macro prefix (MAKE-PREFIX-MACRO)
                    self.advance();
                    self.push(TokenKind::Atom("@".to_string()), pos);
                }
                c if c.is_alphabetic() || "-_?+*/=$#;:|&^%".contains(c) => {
                    let value = self.read_atom();
                    if value.is_empty() {
                        self.advance();
                    } else {
                        self.push(TokenKind::Atom(value), pos);
                    }
                }
                c => {
                    return Err(CompilerError::LexicalError(
                        self.filename.clone(),
                        format!("unexpected character {:?}", c),
                        pos,
                    ));
                }
            }
        }

        let pos = self.here();
        self.push(TokenKind::Eof, pos);
        Ok(self.tokens)
    }
}

/// Tokenize a source string.
pub fn tokenize(source: &str, filename: &str) -> Result<Vec<Token>, CompilerError> {
    Lexer::new(source, filename).tokenize()
}

#[cfg(test)]
#[path = "lexer_tests.rs"]
mod tests;
