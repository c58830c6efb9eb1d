// ZIL Macro Expansion
//
// Registers DEFMAC bodies and expands call sites recursively. Parameter
// references are substituted (including inside quasi-quotes), embedded
// compile-time constructs are run through the MDL evaluator, and
// CHTYPE ... SPLICE results are inlined into the surrounding operand
// list. A short allowlist of operators is never expanded so the code
// generator can keep recognising them.

use std::collections::HashSet;

use indexmap::IndexMap;
use lazy_static::lazy_static;
use log::debug;

use crate::ast::*;
use crate::error::CompilerError;
use crate::eval::{Env, Evaluator, Signal, Value};

lazy_static! {
    /// Operations the code generator handles natively; user macros with
    /// these names are never expanded.
    static ref NATIVE_OPERATIONS: HashSet<&'static str> = {
        let mut set = HashSet::new();
        for name in [
            "PRINT", "PRINTI", "CRLF", "PRINTN", "PRINTD", "PRINTC", "COND", "REPEAT", "PROG",
            "BIND", "DO", "MAP", "MAPF", "MAPR", "VERB?", "DLESS?", "IGRTR?", "EQUAL?", "FSET?",
            "IN?", "OBJECT", "ROOM",
        ] {
            set.insert(name);
        }
        set
    };
}

const MAX_EXPANSION_DEPTH: usize = 64;

pub struct MacroExpander {
    macros: IndexMap<String, MacroNode>,
    pub evaluator: Evaluator,
    depth: usize,
}

impl MacroExpander {
    pub fn new() -> Self {
        MacroExpander {
            macros: IndexMap::new(),
            evaluator: Evaluator::new(),
            depth: 0,
        }
    }

    pub fn define_macro(&mut self, mac: MacroNode) {
        debug!("registered macro {}", mac.name);
        self.macros.insert(mac.name.to_uppercase(), mac);
    }

    pub fn is_macro(&self, name: &str) -> bool {
        self.macros.contains_key(&name.to_uppercase())
    }

    /// Expand every macro call in the program, then merge definitions
    /// created by EVAL during expansion (first definition wins on name
    /// collisions).
    pub fn expand_program(&mut self, program: &mut Program) -> Result<(), CompilerError> {
        for mac in &program.macros {
            self.define_macro(mac.clone());
        }
        if self.macros.is_empty() {
            return Ok(());
        }

        self.evaluator.in_zilch = true;

        for routine in &mut program.routines {
            let mut new_body = Vec::new();
            for stmt in std::mem::take(&mut routine.body) {
                let expanded = self.expand_recursive(stmt)?;
                inline_into(&mut new_body, expanded);
            }
            routine.body = new_body;

            for (_, default) in routine.local_defaults.iter_mut() {
                let expanded = self.expand_recursive(default.clone())?;
                *default = expanded;
            }
        }

        for object in program.objects.iter_mut().chain(program.rooms.iter_mut()) {
            for prop in &mut object.properties {
                let mut new_values = Vec::new();
                for value in std::mem::take(&mut prop.values) {
                    let expanded = self.expand_recursive(value)?;
                    inline_into(&mut new_values, expanded);
                }
                prop.values = new_values;
            }
        }

        for global in &mut program.globals {
            if let Some(value) = global.value.take() {
                global.value = Some(self.expand_recursive(value)?);
            }
        }
        for constant in &mut program.constants {
            let value = std::mem::replace(&mut constant.value, ZilNode::Number(0));
            constant.value = self.expand_recursive(value)?;
        }
        for token in &mut program.tell_tokens {
            let expansion = std::mem::replace(&mut token.expansion, ZilNode::Number(0));
            token.expansion = self.expand_recursive(expansion)?;
        }

        // Merge EVAL-created definitions; first-wins on collisions.
        let existing: HashSet<String> = program.globals.iter().map(|g| g.name.clone()).collect();
        for global in self.evaluator.pending_globals.drain(..) {
            if !existing.contains(&global.name)
                && !program.globals.iter().any(|g| g.name == global.name)
            {
                program.globals.push(global);
            }
        }
        let existing: HashSet<String> =
            program.constants.iter().map(|c| c.name.clone()).collect();
        for constant in self.evaluator.pending_constants.drain(..) {
            if !existing.contains(&constant.name)
                && !program.constants.iter().any(|c| c.name == constant.name)
            {
                program.constants.push(constant);
            }
        }

        Ok(())
    }

    /// Recursively expand macros inside a node.
    pub fn expand_recursive(&mut self, node: ZilNode) -> Result<ZilNode, CompilerError> {
        if self.depth > MAX_EXPANSION_DEPTH {
            return Err(CompilerError::CodeGenError(
                "macro expansion depth exceeded (possible recursive macro)".to_string(),
            ));
        }

        match node {
            ZilNode::Form(form) => {
                if let Some(op) = form.operator.atom_name() {
                    let upper = op.to_uppercase();
                    if NATIVE_OPERATIONS.contains(upper.as_str()) {
                        // Never expanded, but operands still are.
                        let mut operands = Vec::new();
                        for operand in form.operands {
                            let expanded = self.expand_recursive(operand)?;
                            inline_into(&mut operands, expanded);
                        }
                        return Ok(ZilNode::Form(FormNode {
                            operator: form.operator,
                            operands,
                            pos: form.pos,
                        }));
                    }
                }

                if let Some(expanded) = self.expand_call(&form)? {
                    self.depth += 1;
                    let result = self.expand_recursive(expanded);
                    self.depth -= 1;
                    return result;
                }

                let operator = self.expand_recursive(*form.operator)?;
                let mut operands = Vec::new();
                for operand in form.operands {
                    let expanded = self.expand_recursive(operand)?;
                    inline_into(&mut operands, expanded);
                }
                Ok(ZilNode::Form(FormNode {
                    operator: Box::new(operator),
                    operands,
                    pos: form.pos,
                }))
            }
            ZilNode::Cond(cond) => {
                let mut clauses = Vec::new();
                for clause in cond.clauses {
                    let test = self.expand_recursive(clause.test)?;
                    let mut body = Vec::new();
                    for stmt in clause.body {
                        let expanded = self.expand_recursive(stmt)?;
                        inline_into(&mut body, expanded);
                    }
                    clauses.push(CondClause { test, body });
                }
                Ok(ZilNode::Cond(CondNode {
                    clauses,
                    pos: cond.pos,
                }))
            }
            ZilNode::Repeat(repeat) => {
                let exit_cond = match repeat.exit_cond {
                    Some(cond) => Some(Box::new(self.expand_recursive(*cond)?)),
                    None => None,
                };
                let mut body = Vec::new();
                for stmt in repeat.body {
                    let expanded = self.expand_recursive(stmt)?;
                    inline_into(&mut body, expanded);
                }
                Ok(ZilNode::Repeat(RepeatNode {
                    bindings: repeat.bindings,
                    exit_cond,
                    body,
                    pos: repeat.pos,
                }))
            }
            ZilNode::List(items) => {
                let mut out = Vec::new();
                for item in items {
                    let expanded = self.expand_recursive(item)?;
                    inline_into(&mut out, expanded);
                }
                Ok(ZilNode::List(out))
            }
            ZilNode::Quasiquote(inner) => Ok(ZilNode::Quasiquote(Box::new(
                self.expand_recursive(*inner)?,
            ))),
            ZilNode::Unquote(inner) => {
                Ok(ZilNode::Unquote(Box::new(self.expand_recursive(*inner)?)))
            }
            ZilNode::SpliceUnquote(inner) => Ok(ZilNode::SpliceUnquote(Box::new(
                self.expand_recursive(*inner)?,
            ))),
            other => Ok(other),
        }
    }

    /// Expand one form if its operator names a macro. Returns None when
    /// the form is not a macro call.
    pub fn expand_call(&mut self, form: &FormNode) -> Result<Option<ZilNode>, CompilerError> {
        let Some(name) = form.operator.atom_name() else {
            return Ok(None);
        };
        let upper = name.to_uppercase();

        // Conditional-compilation builtins
        if upper == "IF-IN-ZILCH" {
            return Ok(Some(
                form.operands
                    .first()
                    .cloned()
                    .unwrap_or_else(ZilNode::false_value),
            ));
        }
        if upper == "IFN-IN-ZILCH" {
            return Ok(Some(ZilNode::false_value()));
        }

        let Some(mac) = self.macros.get(&upper).cloned() else {
            return Ok(None);
        };

        // Arity: quoted/plain params are required, tuple absorbs the rest,
        // aux and optional are not counted.
        let required = mac
            .params
            .iter()
            .filter(|p| !p.tuple && !p.aux && !p.optional)
            .count();
        if form.operands.len() < required {
            return Err(CompilerError::MacroArityMismatch(
                mac.name.clone(),
                required,
                form.operands.len(),
            ));
        }

        let mut bindings = self.bind_parameters(&mac, &form.operands);

        // Substitute parameters through the body, then run compile-time
        // constructs. The last body expression's result is the expansion.
        let mut result = ZilNode::SpliceResult(Vec::new());
        let mut results = Vec::new();
        for stmt in &mac.body {
            let substituted = self.substitute(stmt, &bindings);
            let evaluated = self.evaluate_mdl(substituted, &mut bindings);
            results.push(evaluated);
        }
        // The expansion is the last value-producing body expression;
        // side-effect-only results (empty splices) are skipped.
        if let Some(last) = results.into_iter().rev().find(|n| {
            !matches!(n, ZilNode::SpliceResult(items) if items.is_empty())
        }) {
            result = last;
        }

        Ok(Some(finish_expansion(result)))
    }

    fn bind_parameters(&self, mac: &MacroNode, args: &[ZilNode]) -> Env {
        let mut bindings = Env::new();
        let mut index = 0;

        for param in &mac.params {
            if param.tuple {
                let rest: Vec<Value> = args[index.min(args.len())..]
                    .iter()
                    .map(Value::from_node)
                    .collect();
                index = args.len();
                bindings.insert(param.name.clone(), Value::List(rest));
            } else if param.aux {
                bindings.insert(param.name.clone(), Value::Unassigned);
            } else if param.optional {
                if index < args.len() {
                    bindings.insert(param.name.clone(), Value::from_node(&args[index]));
                    index += 1;
                } else {
                    bindings.insert(param.name.clone(), Value::Unassigned);
                }
            } else {
                if index < args.len() {
                    bindings.insert(param.name.clone(), Value::from_node(&args[index]));
                    index += 1;
                } else {
                    bindings.insert(param.name.clone(), Value::Unassigned);
                }
            }
        }
        bindings
    }

    /// Substitute bound parameters through a macro body. `.NAME` becomes
    /// a copy of the bound value; `!.NAME` splices a bound list into the
    /// surrounding operand list; quasi-quotes preserve literal structure.
    fn substitute(&mut self, node: &ZilNode, bindings: &Env) -> ZilNode {
        match node {
            ZilNode::Quasiquote(inner) => self.qq_substitute(inner, bindings),
            ZilNode::Unquote(inner) | ZilNode::SpliceUnquote(inner) => {
                self.substitute(inner, bindings)
            }
            ZilNode::LocalVar(name) => match bindings.get(&name.to_uppercase()) {
                Some(Value::Unassigned) | None => node.clone(),
                Some(value) => value.clone().into_node(),
            },
            ZilNode::Form(form) => {
                let operator = self.substitute(&form.operator, bindings);
                let mut operands = Vec::new();
                for operand in &form.operands {
                    if let Some(inner) = splice_operand(operand) {
                        self.splice_into(&mut operands, inner, bindings);
                        continue;
                    }
                    operands.push(self.substitute(operand, bindings));
                }
                ZilNode::Form(FormNode {
                    operator: Box::new(operator),
                    operands,
                    pos: form.pos,
                })
            }
            ZilNode::List(items) => {
                let mut out = Vec::new();
                for item in items {
                    if let Some(inner) = splice_operand(item) {
                        self.splice_into(&mut out, inner, bindings);
                        continue;
                    }
                    out.push(self.substitute(item, bindings));
                }
                ZilNode::List(out)
            }
            ZilNode::Cond(cond) => ZilNode::Cond(CondNode {
                clauses: cond
                    .clauses
                    .iter()
                    .map(|c| CondClause {
                        test: self.substitute(&c.test, bindings),
                        body: c.body.iter().map(|b| self.substitute(b, bindings)).collect(),
                    })
                    .collect(),
                pos: cond.pos,
            }),
            ZilNode::Repeat(repeat) => ZilNode::Repeat(RepeatNode {
                bindings: repeat.bindings.clone(),
                exit_cond: repeat
                    .exit_cond
                    .as_ref()
                    .map(|c| Box::new(self.substitute(c, bindings))),
                body: repeat
                    .body
                    .iter()
                    .map(|b| self.substitute(b, bindings))
                    .collect(),
                pos: repeat.pos,
            }),
            ZilNode::Quote(inner) => ZilNode::Quote(Box::new(self.substitute(inner, bindings))),
            other => other.clone(),
        }
    }

    /// `!X` splice: a bound list's items inline directly; anything else
    /// (e.g. `!<MAPF ...>`) is substituted, evaluated, and its list
    /// result inlined.
    fn splice_into(&mut self, out: &mut Vec<ZilNode>, inner: &ZilNode, bindings: &Env) {
        if let ZilNode::LocalVar(name) = inner {
            match bindings.get(&name.to_uppercase()) {
                Some(Value::List(items)) => {
                    for item in items {
                        out.push(item.clone().into_node());
                    }
                    return;
                }
                Some(Value::Unassigned) | None => return,
                Some(value) => {
                    out.push(value.clone().into_node());
                    return;
                }
            }
        }

        let substituted = self.substitute(inner, bindings);
        let mut env = bindings.clone();
        match self.evaluator.evaluate(&substituted, &mut env) {
            Ok(Value::List(items)) => {
                for item in items {
                    out.push(item.into_node());
                }
            }
            Ok(Value::Node(ZilNode::List(items))) => out.extend(items),
            Ok(Value::Unassigned) => {}
            Ok(value) => out.push(value.into_node()),
            Err(_) => out.push(substituted),
        }
    }

    /// Inside a quasi-quote only Unquote/SpliceUnquote nodes are live.
    fn qq_substitute(&mut self, node: &ZilNode, bindings: &Env) -> ZilNode {
        match node {
            ZilNode::Unquote(inner) => self.substitute(inner, bindings),
            ZilNode::Quasiquote(inner) => {
                // Nested template keeps one level of quoting.
                ZilNode::Quasiquote(Box::new(self.qq_substitute(inner, bindings)))
            }
            ZilNode::Form(form) => {
                let operator = self.qq_substitute(&form.operator, bindings);
                let mut operands = Vec::new();
                for operand in &form.operands {
                    self.qq_splice_into(&mut operands, operand, bindings);
                }
                ZilNode::Form(FormNode {
                    operator: Box::new(operator),
                    operands,
                    pos: form.pos,
                })
            }
            ZilNode::List(items) => {
                let mut out = Vec::new();
                for item in items {
                    self.qq_splice_into(&mut out, item, bindings);
                }
                ZilNode::List(out)
            }
            other => other.clone(),
        }
    }

    fn qq_splice_into(&mut self, out: &mut Vec<ZilNode>, node: &ZilNode, bindings: &Env) {
        if let ZilNode::SpliceUnquote(inner) = node {
            let substituted = self.substitute(inner, bindings);
            // Evaluate so MAPF results etc. can be spliced.
            let mut env = bindings.clone();
            match self.evaluator.evaluate(&substituted, &mut env) {
                Ok(Value::List(items)) => {
                    for item in items {
                        out.push(item.into_node());
                    }
                }
                Ok(Value::Node(ZilNode::List(items))) => out.extend(items),
                Ok(Value::Unassigned) => {}
                Ok(value) => out.push(value.into_node()),
                Err(_) => out.push(substituted),
            }
        } else {
            out.push(self.qq_substitute(node, bindings));
        }
    }

    /// Run compile-time constructs (COND, EVAL, IFFLAG, MAPF/MAPR with
    /// FUNCTION) through the evaluator; other forms only recurse.
    fn evaluate_mdl(&mut self, node: ZilNode, env: &mut Env) -> ZilNode {
        match &node {
            ZilNode::Cond(_) => {
                return match self.evaluator.evaluate(&node, env) {
                    Ok(value) => {
                        let result = value.into_node();
                        if matches!(result, ZilNode::Form(_) | ZilNode::Cond(_)) {
                            self.evaluate_mdl(result, env)
                        } else {
                            result
                        }
                    }
                    Err(_) => node,
                };
            }
            ZilNode::Form(form) => {
                if let Some(op) = form.operator.atom_name() {
                    let upper = op.to_uppercase();
                    match upper.as_str() {
                        "COND" | "EVAL" | "IFFLAG" | "FORM" => {
                            return match self.evaluator.evaluate(&node, env) {
                                Ok(Value::Unassigned) => ZilNode::SpliceResult(Vec::new()),
                                Ok(value) => convert_eval_result(value),
                                Err(_) => node,
                            };
                        }
                        "MAPF" | "MAPR" => {
                            let has_function = form
                                .operands
                                .iter()
                                .any(|o| o.is_form_named("FUNCTION"));
                            if has_function {
                                return match self.evaluator.evaluate(&node, env) {
                                    Ok(value) => convert_eval_result(value),
                                    Err(Signal::Stop) | Err(Signal::Ret(_)) => {
                                        ZilNode::SpliceResult(Vec::new())
                                    }
                                };
                            }
                        }
                        _ => {}
                    }
                }
            }
            _ => return node,
        }

        // Recurse into operands of ordinary forms.
        if let ZilNode::Form(form) = node {
            let mut operands = Vec::new();
            for operand in form.operands {
                let evaluated = self.evaluate_mdl(operand, env);
                inline_into(&mut operands, evaluated);
            }
            ZilNode::Form(FormNode {
                operator: form.operator,
                operands,
                pos: form.pos,
            })
        } else {
            node
        }
    }
}

impl Default for MacroExpander {
    fn default() -> Self {
        MacroExpander::new()
    }
}

/// `!X` parses as a Form with operator `!` and one operand; return the
/// operand when the node has that shape.
fn splice_operand(node: &ZilNode) -> Option<&ZilNode> {
    if let ZilNode::Form(form) = node {
        if form.operator.atom_name() == Some("!") && form.operands.len() == 1 {
            return Some(&form.operands[0]);
        }
    }
    None
}

/// Append an expansion result, inlining SpliceResult items.
fn inline_into(out: &mut Vec<ZilNode>, node: ZilNode) {
    match node {
        ZilNode::SpliceResult(items) => out.extend(items),
        other => out.push(other),
    }
}

/// Convert an evaluator result into an AST node the way macro bodies
/// expect: lists whose head is an atom become forms, longer mixed lists
/// become a PROG sequence.
fn convert_eval_result(value: Value) -> ZilNode {
    match value {
        Value::List(items) => {
            if items.is_empty() {
                return ZilNode::false_value();
            }
            let nodes: Vec<ZilNode> = items.into_iter().map(Value::into_node).collect();
            if nodes.len() == 1 {
                return nodes.into_iter().next().unwrap();
            }
            if matches!(nodes[0], ZilNode::Atom(_, _)) {
                let mut iter = nodes.into_iter();
                let operator = iter.next().unwrap();
                return ZilNode::form(operator, iter.collect());
            }
            let mut operands = vec![ZilNode::List(Vec::new())];
            operands.extend(nodes);
            ZilNode::form(ZilNode::atom("PROG"), operands)
        }
        other => other.into_node(),
    }
}

/// Post-process a macro's expansion: unwrap a final QUOTE, and turn
/// CHTYPE ... SPLICE into a SpliceResult whose items inline at the call
/// site.
fn finish_expansion(node: ZilNode) -> ZilNode {
    // 'X and <QUOTE X> both mean the literal X
    let node = match node {
        ZilNode::Quote(inner) => *inner,
        ZilNode::Form(form)
            if form.operator.atom_name().map(|n| n.to_uppercase()) == Some("QUOTE".into())
                && form.operands.len() == 1 =>
        {
            form.operands.into_iter().next().unwrap()
        }
        other => other,
    };

    if let ZilNode::Form(form) = &node {
        if form.operator.atom_name().map(|n| n.to_uppercase()) == Some("CHTYPE".into())
            && form.operands.len() >= 2
        {
            let is_splice = form.operands[1]
                .atom_name()
                .map_or(false, |n| n.eq_ignore_ascii_case("SPLICE"));
            if is_splice {
                let items = match &form.operands[0] {
                    ZilNode::List(items) => items.clone(),
                    ZilNode::Quote(inner) => match &**inner {
                        ZilNode::List(items) => items.clone(),
                        ZilNode::Form(f) => {
                            let mut items = vec![(*f.operator).clone()];
                            items.extend(f.operands.iter().cloned());
                            items
                        }
                        other => vec![other.clone()],
                    },
                    other => vec![other.clone()],
                };
                return ZilNode::SpliceResult(items);
            }
        }
    }
    node
}

#[cfg(test)]
#[path = "macro_tests.rs"]
mod tests;
