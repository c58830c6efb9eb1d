// ZIL Text Preprocessor
//
// Raw-source passes that run before the lexer: include expansion,
// control-character normalisation, COMPILATION-FLAG extraction, IFFLAG and
// VERSION? clause selection, %<...> compile-time evaluation against the
// SETG map, elision of MDL definitions the downstream stages cannot
// consume, and the opt-in lax bracket repair. Each pass is idempotent on
// its own output.

use std::fs;
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::CompilerError;
use crate::CompileContext;
use crate::CtValue;

/// Operators that mark a %<...> form as compile-time. Anything else after
/// %< (e.g. the %<" literal-quote escape) is left untouched.
const COMPILE_OPS: &[&str] = &[
    "+", "-", "*", "/", "MOD", "BAND", "BOR", "LSH", "ASCII", "LENGTH", "COND", "OR", "AND",
    "NOT", "EQUAL?", "==?", "N==?", "G?", "L?", "GASSIGNED?", "ASSIGNED?", "TYPE?", "EMPTY?",
    "NTH", "REST", "MAPF", "MAPR", "ILIST", "IVECTOR", "ITABLE", "STRING", "BYTE", "FORM",
    "CHTYPE", "PARSE", "UNPARSE", "SPNAME", "PNAME",
];

pub struct Preprocessor<'a> {
    ctx: &'a mut CompileContext,
}

impl<'a> Preprocessor<'a> {
    pub fn new(ctx: &'a mut CompileContext) -> Self {
        Preprocessor { ctx }
    }

    /// Run every pass in order.
    pub fn preprocess(&mut self, source: &str, base_dir: &Path) -> Result<String, CompilerError> {
        let source = normalize_control_characters(source);
        let source = self.expand_includes(&source, base_dir)?;
        self.collect_setg_values(&source);
        let source = self.extract_compilation_flags(&source);
        let source = self.process_ifflag(&source);
        let source = self.process_version_cond(&source);
        let source = self.process_compile_cond(&source);
        let source = self.process_compile_arithmetic(&source);
        let source = self.elide_mdl_definitions(&source);
        let source = if self.ctx.lax_brackets {
            self.fix_lax_brackets(&source)
        } else {
            source
        };
        Ok(source)
    }

    /// Expand <IFILE "name"> and <INSERT-FILE "name" ...> recursively.
    /// Resolution order: the including file's directory, then each
    /// configured search path, trying the given name and its lower-case
    /// variant, with and without the .zil extension.
    pub fn expand_includes(
        &mut self,
        source: &str,
        base_dir: &Path,
    ) -> Result<String, CompilerError> {
        let bytes = source.as_bytes();
        let mut out = Vec::with_capacity(bytes.len());
        let mut pos = 0;

        loop {
            let found = match (
                find_form(bytes, pos, "IFILE"),
                find_form(bytes, pos, "INSERT-FILE"),
            ) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            let Some(start) = found else {
                out.extend_from_slice(&bytes[pos..]);
                break;
            };
            let Some(end) = extract_balanced(bytes, start) else {
                out.extend_from_slice(&bytes[pos..start + 1]);
                pos = start + 1;
                continue;
            };

            out.extend_from_slice(&bytes[pos..start]);
            let form = String::from_utf8_lossy(&bytes[start..end]).into_owned();

            // Pull the quoted filename out of the form; extra arguments
            // (the T in INSERT-FILE) are ignored.
            let name = match form.find('"') {
                Some(q1) => match form[q1 + 1..].find('"') {
                    Some(q2) => form[q1 + 1..q1 + 1 + q2].to_string(),
                    None => String::new(),
                },
                None => String::new(),
            };

            if name.is_empty() {
                // Malformed include; drop the form.
                pos = end;
                continue;
            }

            let (path, searched) = self.resolve_include(&name, base_dir);
            let Some(path) = path else {
                return Err(CompilerError::IncludeNotFound(name, searched));
            };

            debug!("including file {}", path.display());
            let content = fs::read_to_string(&path)?;
            let content = normalize_control_characters(&content);
            let parent = path.parent().unwrap_or(base_dir).to_path_buf();
            let expanded = self.expand_includes(&content, &parent)?;
            out.extend_from_slice(expanded.as_bytes());
            pos = end;
        }

        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    fn resolve_include(&self, name: &str, base_dir: &Path) -> (Option<PathBuf>, Vec<String>) {
        let mut names = vec![name.to_string(), name.to_lowercase()];
        if !name.to_lowercase().ends_with(".zil") {
            names.push(format!("{}.zil", name));
            names.push(format!("{}.zil", name.to_lowercase()));
        }

        let mut dirs = vec![base_dir.to_path_buf()];
        dirs.extend(self.ctx.include_paths.iter().cloned());

        let mut searched = Vec::new();
        for dir in &dirs {
            for candidate_name in &names {
                let candidate = dir.join(candidate_name);
                if candidate.is_file() {
                    return (Some(candidate), searched);
                }
                searched.push(candidate.display().to_string());
            }
        }
        (None, searched)
    }

    /// Record <SETG NAME value> assignments (value: number, T, or <>) so
    /// %<COND> and %<arith> can resolve ,NAME references. The SETG forms
    /// stay in the source.
    fn collect_setg_values(&mut self, source: &str) {
        let bytes = source.as_bytes();
        let mut pos = 0;
        while let Some(start) = find_form(bytes, pos, "SETG") {
            let Some(end) = extract_balanced(bytes, start) else {
                pos = start + 1;
                continue;
            };
            let inner = String::from_utf8_lossy(&bytes[start + 1..end - 1]).into_owned();
            let mut parts = inner.split_whitespace();
            parts.next(); // SETG
            if let Some(name) = parts.next() {
                let name = name.to_uppercase();
                match parts.next() {
                    Some("T") => {
                        self.ctx.setg_values.insert(name, CtValue::True);
                    }
                    Some("<>") => {
                        self.ctx.setg_values.insert(name, CtValue::False);
                    }
                    Some(v) => {
                        if let Ok(n) = v.parse::<i32>() {
                            self.ctx.setg_values.insert(name, CtValue::Int(n));
                        }
                    }
                    None => {}
                }
            }
            pos = end;
        }
    }

    /// <COMPILATION-FLAG NAME <T>> records a flag and is removed.
    fn extract_compilation_flags(&mut self, source: &str) -> String {
        let bytes = source.as_bytes();
        let mut out = Vec::with_capacity(bytes.len());
        let mut pos = 0;

        while let Some(start) = find_form(bytes, pos, "COMPILATION-FLAG") {
            let Some(end) = extract_balanced(bytes, start) else {
                out.extend_from_slice(&bytes[pos..start + 1]);
                pos = start + 1;
                continue;
            };
            out.extend_from_slice(&bytes[pos..start]);

            let inner = String::from_utf8_lossy(&bytes[start + 1..end - 1]).into_owned();
            let mut parts = inner.split_whitespace();
            parts.next(); // COMPILATION-FLAG
            if let Some(name) = parts.next() {
                let rest: String = parts.collect::<Vec<_>>().join(" ");
                let value = matches!(rest.trim(), "<T>" | "<TRUE>");
                debug!("compilation flag {} = {}", name, value);
                self.ctx
                    .compilation_flags
                    .insert(name.to_uppercase(), value);
            }
            pos = end;
        }
        out.extend_from_slice(&bytes[pos..]);
        String::from_utf8_lossy(&out).into_owned()
    }

    /// <IFFLAG (FLAG body...) (ELSE body...)>: keep only the selected body.
    fn process_ifflag(&mut self, source: &str) -> String {
        let bytes = source.as_bytes();
        let mut out = Vec::with_capacity(bytes.len());
        let mut pos = 0;

        while let Some(start) = find_form(bytes, pos, "IFFLAG") {
            let Some(end) = extract_balanced(bytes, start) else {
                out.extend_from_slice(&bytes[pos..start + 1]);
                pos = start + 1;
                continue;
            };
            out.extend_from_slice(&bytes[pos..start]);

            let inner = String::from_utf8_lossy(&bytes[start + 1..end - 1]).into_owned();
            let body = inner
                .trim_start()
                .get("IFFLAG".len()..)
                .unwrap_or("")
                .trim()
                .to_string();

            let clauses = parse_cond_clauses(&body);

            // IN-ZILCH clauses belong to the macro expander's evaluator;
            // leave the whole form alone for it.
            if clauses
                .iter()
                .any(|(head, _)| head.eq_ignore_ascii_case("IN-ZILCH"))
            {
                out.extend_from_slice(&bytes[start..end]);
                pos = end;
                continue;
            }

            let mut selected = String::new();
            for (head, rest) in clauses {
                let head_upper = head.to_uppercase();
                let matches = head_upper == "ELSE"
                    || head_upper == "T"
                    || self
                        .ctx
                        .compilation_flags
                        .get(&head_upper)
                        .copied()
                        .unwrap_or(false);
                if matches {
                    selected = rest;
                    break;
                }
            }
            out.extend_from_slice(selected.as_bytes());
            pos = end;
        }
        out.extend_from_slice(&bytes[pos..]);
        String::from_utf8_lossy(&out).into_owned()
    }

    /// <VERSION? (ZIP ...) (EZIP ...) (XZIP ...) (ELSE ...)>, with or
    /// without the % reader prefix. ZIP is V3, EZIP V4, XZIP V5.
    fn process_version_cond(&mut self, source: &str) -> String {
        let bytes = source.as_bytes();
        let mut out = Vec::with_capacity(bytes.len());
        let mut pos = 0;

        while let Some(start) = find_form(bytes, pos, "VERSION?") {
            // Swallow a % immediately before the form.
            let mut copy_end = start;
            if start > 0 && bytes[start - 1] == b'%' {
                copy_end = start - 1;
            }
            let Some(end) = extract_balanced(bytes, start) else {
                out.extend_from_slice(&bytes[pos..start + 1]);
                pos = start + 1;
                continue;
            };
            out.extend_from_slice(&bytes[pos..copy_end]);

            let inner = String::from_utf8_lossy(&bytes[start + 1..end - 1]).into_owned();
            let body = inner
                .trim_start()
                .get("VERSION?".len()..)
                .unwrap_or("")
                .trim()
                .to_string();

            let mut selected = String::new();
            for (head, rest) in parse_cond_clauses(&body) {
                let head_upper = head.to_uppercase();
                let matches = match head_upper.as_str() {
                    "ZIP" => self.ctx.version == 3,
                    "EZIP" => self.ctx.version == 4,
                    "XZIP" => self.ctx.version == 5,
                    "YZIP" => self.ctx.version == 6,
                    "ELSE" | "T" => true,
                    _ => false,
                };
                if matches {
                    selected = rest;
                    break;
                }
            }
            out.extend_from_slice(selected.as_bytes());
            pos = end;
        }
        out.extend_from_slice(&bytes[pos..]);
        String::from_utf8_lossy(&out).into_owned()
    }

    /// %<COND clause...>: pick the first clause whose test evaluates truthy
    /// and splice its body (stripped of a leading quote) into the source.
    fn process_compile_cond(&mut self, source: &str) -> String {
        let bytes = source.as_bytes();
        let mut out = Vec::with_capacity(bytes.len());
        let mut pos = 0;

        loop {
            let Some(start) = find_percent_form(bytes, pos, Some("COND")) else {
                out.extend_from_slice(&bytes[pos..]);
                break;
            };
            let Some(end) = extract_balanced(bytes, start + 1) else {
                out.extend_from_slice(&bytes[pos..start + 1]);
                pos = start + 1;
                continue;
            };
            out.extend_from_slice(&bytes[pos..start]);

            let inner = String::from_utf8_lossy(&bytes[start + 2..end - 1]).into_owned();
            let body = inner
                .trim_start()
                .get("COND".len()..)
                .unwrap_or("")
                .trim()
                .to_string();

            let mut selected = String::new();
            for (test, rest) in parse_cond_clauses(&body) {
                if self.evaluate_compile_test(&test) {
                    let trimmed = rest.trim();
                    selected = trimmed.strip_prefix('\'').unwrap_or(trimmed).to_string();
                    break;
                }
            }
            out.extend_from_slice(selected.as_bytes());
            pos = end;
        }
        String::from_utf8_lossy(&out).into_owned()
    }

    /// The tiny test evaluator for %<COND>: T, <>, <==? ,VAR n>,
    /// <GASSIGNED? NAME> against the SETG map.
    fn evaluate_compile_test(&self, test: &str) -> bool {
        let test = test.trim();
        if test.eq_ignore_ascii_case("T") {
            return true;
        }
        if test == "<>" {
            return false;
        }

        let inner = match test.strip_prefix('<').and_then(|t| t.strip_suffix('>')) {
            Some(inner) => inner.trim(),
            None => return false,
        };
        let mut parts = inner.split_whitespace();
        match parts.next().map(|s| s.to_uppercase()) {
            Some(op) if op == "GASSIGNED?" => parts
                .next()
                .map(|name| self.ctx.setg_values.contains_key(&name.to_uppercase()))
                .unwrap_or(false),
            Some(op) if op == "==?" || op == "EQUAL?" => {
                let var = parts.next().and_then(|v| v.strip_prefix(','));
                let value = parts.next().and_then(|v| v.parse::<i32>().ok());
                match (var, value) {
                    (Some(var), Some(value)) => {
                        match self.ctx.setg_values.get(&var.to_uppercase()) {
                            Some(CtValue::Int(n)) => *n == value,
                            _ => false,
                        }
                    }
                    _ => false,
                }
            }
            _ => false,
        }
    }

    /// %<op args...> compile-time arithmetic. Whitelisted operators
    /// evaluate over numbers, ,GLOBAL references from the SETG map, and
    /// nested %<...> forms. Recognised-but-unevaluable operators become a
    /// zero placeholder so parsing stays viable.
    fn process_compile_arithmetic(&mut self, source: &str) -> String {
        let bytes = source.as_bytes();
        let mut out = Vec::with_capacity(bytes.len());
        let mut pos = 0;

        loop {
            let Some(start) = find_percent_form(bytes, pos, None) else {
                out.extend_from_slice(&bytes[pos..]);
                break;
            };

            // Check the operator against the compile-op list.
            let mut op_start = start + 2;
            while op_start < bytes.len() && (bytes[op_start] == b' ' || bytes[op_start] == b'\t') {
                op_start += 1;
            }
            let lookahead_end = (op_start + 20).min(bytes.len());
            let lookahead =
                String::from_utf8_lossy(&bytes[op_start..lookahead_end]).to_uppercase();
            let is_compile_form = COMPILE_OPS.iter().any(|op| {
                lookahead.starts_with(op)
                    && lookahead
                        .as_bytes()
                        .get(op.len())
                        .map_or(true, |&c| !(c as char).is_alphanumeric())
            });

            if !is_compile_form {
                out.extend_from_slice(&bytes[pos..start + 2]);
                pos = start + 2;
                continue;
            }

            let Some(end) = extract_balanced(bytes, start + 1) else {
                out.extend_from_slice(&bytes[pos..start + 1]);
                pos = start + 1;
                continue;
            };
            out.extend_from_slice(&bytes[pos..start]);

            let content = String::from_utf8_lossy(&bytes[start + 1..end]).into_owned();
            match self.evaluate_compile_expr(&content) {
                Some(value) => out.extend_from_slice(value.to_string().as_bytes()),
                // Unevaluable: zero placeholder keeps the parse viable.
                None => out.push(b'0'),
            }
            pos = end;
        }
        String::from_utf8_lossy(&out).into_owned()
    }

    /// Evaluate `<op args...>` where op is one of the arithmetic ops.
    fn evaluate_compile_expr(&self, content: &str) -> Option<i32> {
        let inner = content
            .trim()
            .strip_prefix('<')?
            .strip_suffix('>')?
            .trim();
        let (op, args_str) = match inner.split_once(char::is_whitespace) {
            Some((op, rest)) => (op.to_uppercase(), rest),
            None => (inner.to_uppercase(), ""),
        };

        let args = self.parse_compile_args(args_str)?;
        match op.as_str() {
            "+" => Some(args.iter().sum()),
            "-" => match args.len() {
                0 => None,
                1 => Some(-args[0]),
                _ => Some(args[0] - args[1..].iter().sum::<i32>()),
            },
            "*" => Some(args.iter().product()),
            "/" => {
                if args.len() >= 2 && args[1] != 0 {
                    Some(args[0].wrapping_div(args[1]))
                } else {
                    Some(0)
                }
            }
            "MOD" => {
                if args.len() >= 2 && args[1] != 0 {
                    Some(args[0] % args[1])
                } else {
                    Some(0)
                }
            }
            "BAND" => {
                if args.len() >= 2 {
                    Some(args.iter().skip(1).fold(args[0], |a, b| a & b))
                } else {
                    None
                }
            }
            "BOR" => {
                if args.len() >= 2 {
                    Some(args.iter().skip(1).fold(args[0], |a, b| a | b))
                } else {
                    None
                }
            }
            "LSH" => {
                if args.len() >= 2 {
                    Some(args[0].wrapping_shl(args[1].max(0) as u32))
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Arguments: numbers, ,GLOBAL references, nested %<...> forms.
    fn parse_compile_args(&self, args_str: &str) -> Option<Vec<i32>> {
        let bytes = args_str.as_bytes();
        let mut args = Vec::new();
        let mut pos = 0;

        while pos < bytes.len() {
            while pos < bytes.len() && (bytes[pos] as char).is_whitespace() {
                pos += 1;
            }
            if pos >= bytes.len() {
                break;
            }

            match bytes[pos] {
                b',' => {
                    pos += 1;
                    let start = pos;
                    while pos < bytes.len()
                        && ((bytes[pos] as char).is_alphanumeric()
                            || matches!(bytes[pos], b'-' | b'_' | b'?'))
                    {
                        pos += 1;
                    }
                    let name =
                        String::from_utf8_lossy(&bytes[start..pos]).to_uppercase();
                    match self.ctx.setg_values.get(&name) {
                        Some(CtValue::Int(n)) => args.push(*n),
                        Some(CtValue::True) => args.push(1),
                        Some(CtValue::False) => args.push(0),
                        None => return None,
                    }
                }
                b'0'..=b'9' => {
                    let start = pos;
                    while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                        pos += 1;
                    }
                    let text = std::str::from_utf8(&bytes[start..pos]).ok()?;
                    args.push(text.parse().ok()?);
                }
                b'-' if bytes.get(pos + 1).map_or(false, |c| c.is_ascii_digit()) => {
                    let start = pos;
                    pos += 1;
                    while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                        pos += 1;
                    }
                    let text = std::str::from_utf8(&bytes[start..pos]).ok()?;
                    args.push(text.parse().ok()?);
                }
                b'%' if bytes.get(pos + 1) == Some(&b'<') => {
                    let end = extract_balanced(bytes, pos + 1)?;
                    let nested = std::str::from_utf8(&bytes[pos + 1..end]).ok()?;
                    args.push(self.evaluate_compile_expr(nested)?);
                    pos = end;
                }
                _ => return None,
            }
        }

        if args.is_empty() {
            None
        } else {
            Some(args)
        }
    }

    /// Remove <DEFINE ...> forms (MDL load-time functions the compiler
    /// cannot consume) and any <DEFMAC ...> form that does not survive a
    /// lex-and-parse probe. Parseable DEFMAC forms flow on to the macro
    /// expander.
    fn elide_mdl_definitions(&mut self, source: &str) -> String {
        let bytes = source.as_bytes();
        let mut out = Vec::with_capacity(bytes.len());
        let mut pos = 0;

        loop {
            let define = find_form(bytes, pos, "DEFINE");
            let defmac = find_form(bytes, pos, "DEFMAC");
            let (start, is_defmac) = match (define, defmac) {
                (Some(d), Some(m)) if m < d => (m, true),
                (Some(d), _) => (d, false),
                (None, Some(m)) => (m, true),
                (None, None) => {
                    out.extend_from_slice(&bytes[pos..]);
                    break;
                }
            };

            let Some(end) = extract_balanced(bytes, start) else {
                out.extend_from_slice(&bytes[pos..start + 1]);
                pos = start + 1;
                continue;
            };
            out.extend_from_slice(&bytes[pos..start]);

            let form = String::from_utf8_lossy(&bytes[start..end]).into_owned();
            if is_defmac && self.defmac_parses(&form) {
                out.extend_from_slice(form.as_bytes());
            } else {
                debug!(
                    "eliding {} definition ({} bytes)",
                    if is_defmac { "DEFMAC" } else { "DEFINE" },
                    end - start
                );
            }
            pos = end;
        }
        String::from_utf8_lossy(&out).into_owned()
    }

    /// Probe whether a DEFMAC form survives lexing and parsing on its own.
    fn defmac_parses(&self, form: &str) -> bool {
        let tokens = match crate::lexer::tokenize(form, "<defmac>") {
            Ok(tokens) => tokens,
            Err(_) => return false,
        };
        crate::parser::Parser::new(tokens, "<defmac>")
            .parse()
            .is_ok()
    }

    /// Opt-in repair for historical sources with unbalanced angle
    /// brackets: drop extraneous `>` and close unterminated forms at EOF.
    /// Strings and comment forms are skipped, not repaired.
    fn fix_lax_brackets(&mut self, source: &str) -> String {
        let bytes = source.as_bytes();
        let mut out = Vec::with_capacity(bytes.len());
        let mut depth = 0usize;
        let mut removed = 0usize;
        let mut i = 0;

        while i < bytes.len() {
            let ch = bytes[i];
            match ch {
                b'"' => {
                    out.push(ch);
                    i += 1;
                    while i < bytes.len() && bytes[i] != b'"' {
                        if bytes[i] == b'\\' && i + 1 < bytes.len() {
                            out.push(bytes[i]);
                            i += 1;
                        }
                        out.push(bytes[i]);
                        i += 1;
                    }
                    if i < bytes.len() {
                        out.push(bytes[i]);
                        i += 1;
                    }
                }
                b';' if i + 1 < bytes.len() && matches!(bytes[i + 1], b'<' | b'[' | b'"') => {
                    // Copy the comment form verbatim; its brackets are
                    // outside the repair scope.
                    out.push(ch);
                    i += 1;
                    let (open, close) = match bytes[i] {
                        b'<' => (b'<', b'>'),
                        b'[' => (b'[', b']'),
                        _ => {
                            out.push(bytes[i]);
                            i += 1;
                            while i < bytes.len() && bytes[i] != b'"' {
                                if bytes[i] == b'\\' && i + 1 < bytes.len() {
                                    out.push(bytes[i]);
                                    i += 1;
                                }
                                out.push(bytes[i]);
                                i += 1;
                            }
                            if i < bytes.len() {
                                out.push(bytes[i]);
                                i += 1;
                            }
                            continue;
                        }
                    };
                    out.push(bytes[i]);
                    i += 1;
                    let mut comment_depth = 1;
                    while i < bytes.len() && comment_depth > 0 {
                        if bytes[i] == open {
                            comment_depth += 1;
                        } else if bytes[i] == close {
                            comment_depth -= 1;
                        }
                        out.push(bytes[i]);
                        i += 1;
                    }
                }
                b'<' => {
                    depth += 1;
                    out.push(ch);
                    i += 1;
                }
                b'>' => {
                    if depth > 0 {
                        depth -= 1;
                        out.push(ch);
                    } else {
                        removed += 1;
                    }
                    i += 1;
                }
                _ => {
                    out.push(ch);
                    i += 1;
                }
            }
        }

        if removed > 0 {
            debug!("lax brackets: removed {} extraneous '>'", removed);
        }
        if depth > 0 {
            debug!("lax brackets: closing {} unterminated forms at EOF", depth);
            out.push(b'\n');
            for _ in 0..depth {
                out.push(b'>');
            }
        }
        String::from_utf8_lossy(&out).into_owned()
    }
}

/// Replace the /^L and ^L form-feed markers with newlines.
pub fn normalize_control_characters(source: &str) -> String {
    source.replace("/^L", "\n").replace("^L", "\n")
}

/// Find `<KEYWORD ` (case-insensitive, whitespace tolerated after `<`)
/// outside string literals; returns the index of the `<`.
fn find_form(bytes: &[u8], from: usize, keyword: &str) -> Option<usize> {
    let upper = keyword.as_bytes();
    let mut i = from;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => {
                i += 1;
                while i < bytes.len() && bytes[i] != b'"' {
                    if bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
                i += 1;
            }
            b'<' => {
                let mut j = i + 1;
                while j < bytes.len() && (bytes[j] == b' ' || bytes[j] == b'\t') {
                    j += 1;
                }
                if j + upper.len() <= bytes.len()
                    && bytes[j..j + upper.len()].eq_ignore_ascii_case(upper)
                {
                    let after = bytes.get(j + upper.len()).copied();
                    let terminated = match after {
                        None => true,
                        Some(c) => c.is_ascii_whitespace() || c == b'>' || c == b'"',
                    };
                    if terminated {
                        return Some(i);
                    }
                }
                i += 1;
            }
            _ => i += 1,
        }
    }
    None
}

/// Find `%<` (optionally `%<KEYWORD`) outside strings; returns the index
/// of the `%`.
fn find_percent_form(bytes: &[u8], from: usize, keyword: Option<&str>) -> Option<usize> {
    let mut i = from;
    while i + 1 < bytes.len() {
        match bytes[i] {
            b'"' => {
                i += 1;
                while i < bytes.len() && bytes[i] != b'"' {
                    if bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
                i += 1;
            }
            b'%' if bytes[i + 1] == b'<' => match keyword {
                None => return Some(i),
                Some(kw) => {
                    let mut j = i + 2;
                    while j < bytes.len() && (bytes[j] == b' ' || bytes[j] == b'\t') {
                        j += 1;
                    }
                    let kb = kw.as_bytes();
                    if j + kb.len() <= bytes.len()
                        && bytes[j..j + kb.len()].eq_ignore_ascii_case(kb)
                        && bytes
                            .get(j + kb.len())
                            .map_or(true, |&c| c.is_ascii_whitespace())
                    {
                        return Some(i);
                    }
                    i += 2;
                }
            },
            _ => i += 1,
        }
    }
    None
}

/// From a `<` at `start`, find the matching `>` honouring nesting and
/// string literals. Returns the exclusive end index.
fn extract_balanced(bytes: &[u8], start: usize) -> Option<usize> {
    if bytes.get(start) != Some(&b'<') {
        return None;
    }
    let mut depth = 1;
    let mut i = start + 1;
    while i < bytes.len() && depth > 0 {
        match bytes[i] {
            b'"' => {
                i += 1;
                while i < bytes.len() && bytes[i] != b'"' {
                    if bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
                i += 1;
            }
            b'<' => {
                depth += 1;
                i += 1;
            }
            b'>' => {
                depth -= 1;
                i += 1;
            }
            _ => i += 1,
        }
    }
    if depth == 0 {
        Some(i)
    } else {
        None
    }
}

/// Parse COND-style clauses `(test result...)`; the test is the first
/// complete s-expression of the group.
fn parse_cond_clauses(body: &str) -> Vec<(String, String)> {
    let bytes = body.as_bytes();
    let mut clauses = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        while pos < bytes.len() && (bytes[pos] as char).is_whitespace() {
            pos += 1;
        }
        if pos >= bytes.len() || bytes[pos] != b'(' {
            break;
        }

        let start = pos + 1;
        let mut depth = 1;
        pos += 1;
        while pos < bytes.len() && depth > 0 {
            match bytes[pos] {
                b'"' => {
                    pos += 1;
                    while pos < bytes.len() && bytes[pos] != b'"' {
                        if bytes[pos] == b'\\' {
                            pos += 1;
                        }
                        pos += 1;
                    }
                }
                b'(' => depth += 1,
                b')' => depth -= 1,
                _ => {}
            }
            pos += 1;
        }
        if depth != 0 {
            break;
        }

        let content = String::from_utf8_lossy(&bytes[start..pos - 1]).into_owned();
        let (test, rest) = split_first_sexpr(&content);
        clauses.push((test, rest));
    }
    clauses
}

/// Split text into its first s-expression and the remainder.
fn split_first_sexpr(text: &str) -> (String, String) {
    let text = text.trim();
    let bytes = text.as_bytes();
    if bytes.is_empty() {
        return (String::new(), String::new());
    }

    let (open, close) = match bytes[0] {
        b'<' => (b'<', b'>'),
        b'(' => (b'(', b')'),
        _ => {
            return match text.split_once(char::is_whitespace) {
                Some((first, rest)) => (first.to_string(), rest.trim().to_string()),
                None => (text.to_string(), String::new()),
            };
        }
    };

    let mut depth = 1;
    let mut i = 1;
    while i < bytes.len() && depth > 0 {
        match bytes[i] {
            b'"' => {
                i += 1;
                while i < bytes.len() && bytes[i] != b'"' {
                    if bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
            }
            c if c == open => depth += 1,
            c if c == close => depth -= 1,
            _ => {}
        }
        i += 1;
    }
    if depth == 0 {
        (
            text[..i].to_string(),
            text.get(i..).unwrap_or("").trim().to_string(),
        )
    } else {
        (text.to_string(), String::new())
    }
}

#[cfg(test)]
#[path = "preprocessor_tests.rs"]
mod tests;
