// Compiler Error Handling

use std::fmt;

/// Source location carried by front-end errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourcePos {
    pub line: usize,
    pub column: usize,
}

impl SourcePos {
    pub fn new(line: usize, column: usize) -> Self {
        SourcePos { line, column }
    }
}

impl fmt::Display for SourcePos {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

#[derive(Debug, Clone)]
pub enum CompilerError {
    // Lexical errors
    LexicalError(String, String, SourcePos), // file, message
    UnterminatedString(String, SourcePos),
    UnterminatedComment(String, SourcePos),

    // Parse errors
    ParseError(String, String, SourcePos), // file, message
    UnexpectedToken(String, String, SourcePos),
    ExpectedToken(String, String, String, SourcePos), // file, expected, found

    // Preprocessor errors
    IncludeNotFound(String, Vec<String>), // filename, every searched path

    // Macro errors
    MacroArityMismatch(String, usize, usize), // macro, required, got

    // Semantic / code generation errors
    CodeGenError(String),
    UndefinedSymbol(String, SourcePos),
    AttributeOutOfRange(String, u16, u16), // flag, bit, max
    PropertyTooLarge(String, usize, usize), // property, size, max
    TooManyLocals(String, usize),
    BranchOutOfRange(i32),

    // Layout errors
    StoryTooLarge(u8, usize, usize), // version, size, max; suggests a higher version

    // IO errors
    IoError(String),
}

impl fmt::Display for CompilerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CompilerError::LexicalError(file, msg, pos) => {
                write!(f, "{}:{}: {}", file, pos, msg)
            }
            CompilerError::UnterminatedString(file, pos) => {
                write!(f, "{}:{}: unterminated string literal", file, pos)
            }
            CompilerError::UnterminatedComment(file, pos) => {
                write!(f, "{}:{}: unterminated comment", file, pos)
            }
            CompilerError::ParseError(file, msg, pos) => {
                write!(f, "{}:{}: {}", file, pos, msg)
            }
            CompilerError::UnexpectedToken(file, tok, pos) => {
                write!(f, "{}:{}: unexpected token {}", file, pos, tok)
            }
            CompilerError::ExpectedToken(file, expected, found, pos) => {
                write!(f, "{}:{}: expected {}, found {}", file, pos, expected, found)
            }
            CompilerError::IncludeNotFound(name, searched) => {
                write!(f, "include file not found: {} (searched: ", name)?;
                for (i, p) in searched.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", p)?;
                }
                write!(f, ")")
            }
            CompilerError::MacroArityMismatch(name, required, got) => {
                write!(
                    f,
                    "macro {} requires {} argument(s), but got {}",
                    name, required, got
                )
            }
            CompilerError::CodeGenError(msg) => {
                write!(f, "code generation error: {}", msg)
            }
            CompilerError::UndefinedSymbol(name, pos) => {
                write!(f, "{}: undefined symbol {}", pos, name)
            }
            CompilerError::AttributeOutOfRange(flag, bit, max) => {
                write!(
                    f,
                    "attribute {} uses bit {} but this version allows 0..{}",
                    flag, bit, max
                )
            }
            CompilerError::PropertyTooLarge(prop, size, max) => {
                write!(
                    f,
                    "property {} is {} bytes, maximum for this version is {}",
                    prop, size, max
                )
            }
            CompilerError::TooManyLocals(routine, count) => {
                write!(
                    f,
                    "routine {} declares {} locals, the Z-machine allows 15",
                    routine, count
                )
            }
            CompilerError::BranchOutOfRange(offset) => {
                write!(f, "branch offset {} exceeds the +/-8191 range", offset)
            }
            CompilerError::StoryTooLarge(version, size, max) => {
                write!(
                    f,
                    "story file too large for version {}: {} bytes, maximum is {} ({}KB); \
                     try compiling with a higher -v",
                    version,
                    size,
                    max,
                    max / 1024
                )
            }
            CompilerError::IoError(msg) => {
                write!(f, "io error: {}", msg)
            }
        }
    }
}

impl std::error::Error for CompilerError {}

impl From<std::io::Error> for CompilerError {
    fn from(err: std::io::Error) -> Self {
        CompilerError::IoError(err.to_string())
    }
}
