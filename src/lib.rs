// ZIL Compiler
// Compiles ZIL (Zork Implementation Language) source to Z-machine story
// files, versions 3 through 8.

pub mod abbreviations;
pub mod assembler;
pub mod ast;
pub mod codegen;
pub mod codegen_instructions;
mod codegen_objects;
mod codegen_tables;
pub mod dictionary;
pub mod error;
pub mod eval;
pub mod lexer;
pub mod macro_expander;
pub mod object_table;
pub mod opcodes;
pub mod optimization;
pub mod parser;
pub mod preprocessor;
pub mod relocation;
pub mod string_table;
pub mod text;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use log::debug;

use crate::ast::{Program, ZilNode};
use crate::error::CompilerError;

/// Z-machine target version. Versions differ in address packing, table
/// widths, and opcode availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZVersion {
    V1,
    V2,
    V3,
    V4,
    V5,
    V6,
    V7,
    V8,
}

impl ZVersion {
    pub fn from_number(n: u8) -> Option<ZVersion> {
        Some(match n {
            1 => ZVersion::V1,
            2 => ZVersion::V2,
            3 => ZVersion::V3,
            4 => ZVersion::V4,
            5 => ZVersion::V5,
            6 => ZVersion::V6,
            7 => ZVersion::V7,
            8 => ZVersion::V8,
            _ => return None,
        })
    }

    pub fn number(&self) -> u8 {
        match self {
            ZVersion::V1 => 1,
            ZVersion::V2 => 2,
            ZVersion::V3 => 3,
            ZVersion::V4 => 4,
            ZVersion::V5 => 5,
            ZVersion::V6 => 6,
            ZVersion::V7 => 7,
            ZVersion::V8 => 8,
        }
    }

    /// Alignment of packed code and string addresses.
    pub fn alignment(&self) -> usize {
        match self.number() {
            1..=3 => 2,
            4..=7 => 4,
            _ => 8,
        }
    }

    /// Divisor for the header's file-length field.
    pub fn file_divisor(&self) -> usize {
        match self.number() {
            1..=3 => 2,
            4 | 5 => 4,
            _ => 8,
        }
    }

    pub fn max_properties(&self) -> u8 {
        if self.number() <= 3 {
            31
        } else {
            63
        }
    }

    pub fn max_attributes(&self) -> u16 {
        if self.number() <= 3 {
            32
        } else {
            48
        }
    }

    pub fn object_entry_size(&self) -> usize {
        if self.number() <= 3 {
            9
        } else {
            14
        }
    }

    pub fn max_property_len(&self) -> usize {
        if self.number() <= 3 {
            8
        } else {
            64
        }
    }
}

impl fmt::Display for ZVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "v{}", self.number())
    }
}

/// A compile-time value tracked from SETG directives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtValue {
    Int(i32),
    True,
    False,
}

/// Per-compilation state threaded through the phases. Each phase owns
/// its sub-state here; nothing is shared between compilations.
#[derive(Debug, Clone)]
pub struct CompileContext {
    pub version: u8,
    pub compilation_flags: IndexMap<String, bool>,
    pub setg_values: IndexMap<String, CtValue>,
    pub include_paths: Vec<PathBuf>,
    pub lax_brackets: bool,
    pub string_dedup: bool,
}

impl CompileContext {
    pub fn new(version: u8) -> Self {
        CompileContext {
            version,
            compilation_flags: IndexMap::new(),
            setg_values: IndexMap::new(),
            include_paths: Vec::new(),
            lax_brackets: false,
            string_dedup: false,
        }
    }
}

/// The compiler: strictly pipeline-ordered, single-threaded, one source
/// tree in, one story file out.
pub struct Compiler {
    ctx: CompileContext,
}

impl Compiler {
    pub fn new(version: u8) -> Self {
        Compiler {
            ctx: CompileContext::new(version),
        }
    }

    pub fn with_context(ctx: CompileContext) -> Self {
        Compiler { ctx }
    }

    pub fn set_include_paths(&mut self, paths: Vec<PathBuf>) {
        self.ctx.include_paths = paths;
    }

    pub fn set_lax_brackets(&mut self, lax: bool) {
        self.ctx.lax_brackets = lax;
    }

    pub fn set_string_dedup(&mut self, dedup: bool) {
        self.ctx.string_dedup = dedup;
    }

    /// Compile a source file and write the story file next to it (or to
    /// `output_path`).
    pub fn compile_file(
        &mut self,
        input_path: &Path,
        output_path: Option<&Path>,
    ) -> Result<PathBuf, CompilerError> {
        let source = fs::read_to_string(input_path)?;
        let story = self.compile_string(&source, &input_path.display().to_string())?;

        let output = match output_path {
            Some(path) => path.to_path_buf(),
            None => input_path.with_extension(format!("z{}", self.ctx.version)),
        };
        fs::write(&output, &story)?;
        debug!("wrote {} bytes to {}", story.len(), output.display());
        Ok(output)
    }

    /// Compile a root file plus extra files concatenated after it.
    pub fn compile_file_multi(
        &mut self,
        main_file: &Path,
        included: &[PathBuf],
    ) -> Result<Vec<u8>, CompilerError> {
        let mut source = fs::read_to_string(main_file)?;
        for path in included {
            debug!("including {}", path.display());
            source.push_str(&format!(
                "\n\n;\"=== Included from {} ===\" \n\n",
                path.display()
            ));
            source.push_str(&fs::read_to_string(path)?);
        }
        self.compile_string(&source, &main_file.display().to_string())
    }

    /// The full pipeline: preprocess, lex, parse, expand macros, select
    /// abbreviations, generate code, optimise, assemble.
    pub fn compile_string(
        &mut self,
        source: &str,
        filename: &str,
    ) -> Result<Vec<u8>, CompilerError> {
        let base_dir = Path::new(filename)
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        debug!("preprocessing {}", filename);
        let mut preprocessor = preprocessor::Preprocessor::new(&mut self.ctx);
        let source = preprocessor.preprocess(source, &base_dir)?;

        debug!("lexing");
        let tokens = lexer::tokenize(&source, filename)?;
        debug!("{} tokens", tokens.len());

        debug!("parsing");
        let mut program = parser::Parser::new(tokens, filename).parse()?;
        debug!(
            "{} routines, {} objects, {} rooms, {} globals, {} macros",
            program.routines.len(),
            program.objects.len(),
            program.rooms.len(),
            program.globals.len(),
            program.macros.len()
        );

        if !program.macros.is_empty() {
            debug!("expanding macros");
            let mut expander = macro_expander::MacroExpander::new();
            expander.evaluator.compilation_flags = self.ctx.compilation_flags.clone();
            expander.expand_program(&mut program)?;
        }

        // A VERSION directive in source overrides the requested version.
        if program.version_explicit {
            self.ctx.version = program.version;
        }
        let version = ZVersion::from_number(self.ctx.version).ok_or_else(|| {
            CompilerError::CodeGenError(format!("unsupported version {}", self.ctx.version))
        })?;
        debug!("target version {}", version);

        // Abbreviation selection (V2+): corpus-driven, overlap-free,
        // capped at 96 so the encoder can use the table immediately.
        let abbreviations = if version.number() >= 2 {
            let corpus = collect_strings(&program);
            debug!("abbreviation corpus: {} strings", corpus.len());
            let mut table = abbreviations::AbbreviationsTable::new();
            table.analyze_strings(&corpus, abbreviations::MAX_ABBREVIATIONS);
            if table.is_empty() {
                None
            } else {
                Some(table)
            }
        } else {
            None
        };

        debug!("generating code");
        let mut codegen = codegen::CodeGen::new(version, self.ctx.string_dedup);
        codegen.abbreviations = abbreviations;
        let mut output = codegen.generate(&program)?;

        debug!("running optimisation passes");
        let mut pipeline = optimization::OptimizationPipeline::new();
        pipeline.add_pass(Box::new(optimization::StringDeduplicationPass::default()));
        pipeline.add_pass(Box::new(optimization::PropertyDedupPass::default()));
        pipeline.add_pass(Box::new(
            optimization::AbbreviationOptimizationPass::default(),
        ));
        let mut data = optimization::OptimizationData {
            output: &mut output,
            program: &program,
            version: version.number(),
        };
        pipeline.run(&mut data)?;

        debug!("assembling story file");
        let mut assembler = assembler::Assembler::new(version);
        assembler.build_story_file(output)
    }
}

/// Collect every string literal in the program for abbreviation
/// selection: object and room properties, routine bodies, globals,
/// constants, and table payloads.
fn collect_strings(program: &Program) -> Vec<String> {
    let mut out = Vec::new();

    for object in program.objects.iter().chain(&program.rooms) {
        for prop in &object.properties {
            for value in &prop.values {
                collect_strings_from_node(value, &mut out);
            }
        }
    }
    for routine in &program.routines {
        for stmt in &routine.body {
            collect_strings_from_node(stmt, &mut out);
        }
    }
    for global in &program.globals {
        if let Some(value) = &global.value {
            collect_strings_from_node(value, &mut out);
        }
    }
    for constant in &program.constants {
        collect_strings_from_node(&constant.value, &mut out);
    }
    for table in &program.tables {
        for value in &table.values {
            collect_strings_from_node(value, &mut out);
        }
    }

    out
}

fn collect_strings_from_node(node: &ZilNode, out: &mut Vec<String>) {
    match node {
        ZilNode::Str(text) => out.push(text.clone()),
        ZilNode::Form(form) => {
            for operand in &form.operands {
                collect_strings_from_node(operand, out);
            }
        }
        ZilNode::List(items) | ZilNode::SpliceResult(items) => {
            for item in items {
                collect_strings_from_node(item, out);
            }
        }
        ZilNode::Cond(cond) => {
            for clause in &cond.clauses {
                collect_strings_from_node(&clause.test, out);
                for stmt in &clause.body {
                    collect_strings_from_node(stmt, out);
                }
            }
        }
        ZilNode::Repeat(repeat) => {
            for stmt in &repeat.body {
                collect_strings_from_node(stmt, out);
            }
        }
        ZilNode::Table(table) => {
            for value in &table.values {
                collect_strings_from_node(value, out);
            }
        }
        ZilNode::Quote(inner)
        | ZilNode::Quasiquote(inner)
        | ZilNode::Unquote(inner)
        | ZilNode::SpliceUnquote(inner) => collect_strings_from_node(inner, out),
        _ => {}
    }
}
