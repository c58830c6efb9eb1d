// Compile-Time MDL Evaluator
//
// A small meta-interpreter the macro expander uses to run the subset of
// MDL that ZIL macros lean on: MAPF/MAPR with FUNCTION closures, COND,
// FORM construction, list surgery, EVAL of GLOBAL/CONSTANT definitions,
// and IFFLAG. Unknown operators evaluate to themselves so the form is
// deferred to run time; evaluation failures never abort the compile.

use indexmap::IndexMap;
use log::debug;

use crate::ast::*;
use crate::error::SourcePos;

/// MAPSTOP/MAPRET are iteration signals, not errors; they propagate as
/// the Err side of an evaluation so `?` carries them to the MAPF loop.
#[derive(Debug, Clone)]
pub enum Signal {
    Stop,
    Ret(Vec<Value>),
}

pub type EvalResult = Result<Value, Signal>;

/// The evaluator's value domain.
#[derive(Debug, Clone)]
pub enum Value {
    Int(i32),
    Bool(bool),
    Str(String),
    Node(ZilNode),
    List(Vec<Value>),
    Closure(Box<Closure>),
    /// Sentinel for missing optional parameters; ASSIGNED? tests it.
    Unassigned,
}

/// A FUNCTION form closed over its environment by value. MAPF applies one
/// closure repeatedly, so mutations to the captured environment persist
/// across iterations (TELL-style accumulator macros rely on that).
#[derive(Debug, Clone)]
pub struct Closure {
    pub params: Vec<String>,
    pub aux: Vec<String>,
    pub body: Vec<ZilNode>,
    pub env: Env,
}

pub type Env = IndexMap<String, Value>;

impl Value {
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::Unassigned => false,
            Value::Node(node) => match node {
                ZilNode::Atom(name, _) => !name.eq_ignore_ascii_case("FALSE"),
                _ => !node.is_false(),
            },
            Value::Closure(_) => true,
        }
    }

    pub fn from_node(node: &ZilNode) -> Value {
        match node {
            ZilNode::Number(n) => Value::Int(*n),
            ZilNode::Str(s) => Value::Str(s.clone()),
            other => Value::Node(other.clone()),
        }
    }

    /// Convert back to AST for splicing into macro output.
    pub fn into_node(self) -> ZilNode {
        match self {
            Value::Int(n) => ZilNode::Number(n),
            Value::Bool(true) => ZilNode::atom("T"),
            Value::Bool(false) | Value::Unassigned => ZilNode::false_value(),
            Value::Str(s) => ZilNode::Str(s),
            Value::Node(node) => node,
            Value::List(items) => {
                ZilNode::List(items.into_iter().map(Value::into_node).collect())
            }
            Value::Closure(_) => ZilNode::false_value(),
        }
    }
}

pub struct Evaluator {
    /// GLOBALs created via EVAL during expansion; merged by the expander.
    pub pending_globals: Vec<GlobalNode>,
    /// CONSTANTs created via EVAL during expansion.
    pub pending_constants: Vec<ConstantNode>,
    /// True while expanding for Z-machine code generation (IFFLAG IN-ZILCH).
    pub in_zilch: bool,
    pub compilation_flags: IndexMap<String, bool>,
}

impl Evaluator {
    pub fn new() -> Self {
        Evaluator {
            pending_globals: Vec::new(),
            pending_constants: Vec::new(),
            in_zilch: false,
            compilation_flags: IndexMap::new(),
        }
    }

    pub fn evaluate(&mut self, node: &ZilNode, env: &mut Env) -> EvalResult {
        match node {
            ZilNode::Atom(name, _) => {
                let upper = name.to_uppercase();
                if upper == "T" {
                    return Ok(Value::Bool(true));
                }
                if upper == "FALSE" {
                    return Ok(Value::Bool(false));
                }
                match env.get(&upper) {
                    Some(v) => Ok(v.clone()),
                    None => Ok(Value::Node(node.clone())),
                }
            }
            ZilNode::LocalVar(name) => match env.get(&name.to_uppercase()) {
                Some(v) => Ok(v.clone()),
                None => Ok(Value::Unassigned),
            },
            ZilNode::GlobalVar(name) => match env.get(&name.to_uppercase()) {
                Some(v) => Ok(v.clone()),
                None => Ok(Value::Node(node.clone())),
            },
            ZilNode::Number(n) => Ok(Value::Int(*n)),
            ZilNode::Str(s) => Ok(Value::Str(s.clone())),
            ZilNode::Quote(inner) => Ok(Value::Node((**inner).clone())),
            ZilNode::Quasiquote(inner) => self.expand_quasiquote(inner, env),
            ZilNode::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.evaluate(item, env)?);
                }
                Ok(Value::List(values))
            }
            ZilNode::Form(form) => self.evaluate_form(form, env),
            ZilNode::Cond(cond) => self.eval_cond_clauses(&cond.clauses, env),
            other => Ok(Value::Node(other.clone())),
        }
    }

    fn evaluate_form(&mut self, form: &FormNode, env: &mut Env) -> EvalResult {
        let Some(op) = form.operator.atom_name() else {
            return Ok(Value::Node(ZilNode::Form(form.clone())));
        };
        let op = op.to_uppercase();
        let args = &form.operands;

        match op.as_str() {
            "QUOTE" => Ok(args
                .first()
                .map(|a| Value::Node(a.clone()))
                .unwrap_or(Value::Unassigned)),
            "MAPF" => self.eval_mapf(args, env),
            "MAPR" => self.eval_mapr(args, env),
            "FUNCTION" => Ok(self.make_closure(args, env)),
            "COND" => {
                // COND may arrive as a generic form when constructed by
                // FORM; clauses are then lists.
                let mut clauses = Vec::new();
                for arg in args {
                    match arg {
                        ZilNode::List(items) if !items.is_empty() => clauses.push(CondClause {
                            test: items[0].clone(),
                            body: items[1..].to_vec(),
                        }),
                        ZilNode::Form(f) => clauses.push(CondClause {
                            test: (*f.operator).clone(),
                            body: f.operands.clone(),
                        }),
                        _ => {}
                    }
                }
                self.eval_cond_clauses(&clauses, env)
            }
            "SET" | "SETG" => self.eval_set(args, env),
            "NTH" => self.eval_nth(args, env),
            "REST" => self.eval_rest(args, env),
            "EMPTY?" => {
                let value = match args.first() {
                    Some(a) => self.evaluate(a, env)?,
                    None => return Ok(Value::Bool(true)),
                };
                Ok(Value::Bool(match value {
                    Value::List(items) => items.is_empty(),
                    Value::Str(s) => s.is_empty(),
                    Value::Unassigned => true,
                    _ => false,
                }))
            }
            "LENGTH" => {
                let value = match args.first() {
                    Some(a) => self.evaluate(a, env)?,
                    None => return Ok(Value::Int(0)),
                };
                Ok(Value::Int(match value {
                    Value::List(items) => items.len() as i32,
                    Value::Str(s) => s.chars().count() as i32,
                    _ => 0,
                }))
            }
            "TYPE?" => self.eval_type(args, env),
            "SPNAME" | "PNAME" => {
                let value = match args.first() {
                    Some(a) => self.evaluate(a, env)?,
                    None => return Ok(Value::Str(String::new())),
                };
                Ok(Value::Str(match value {
                    Value::Node(ZilNode::Atom(name, _)) => name.to_uppercase(),
                    Value::Str(s) => s.to_uppercase(),
                    _ => String::new(),
                }))
            }
            "=?" | "EQUAL?" => {
                let result = self.eval_string_equal(args, env)?;
                Ok(Value::Bool(result))
            }
            "==?" => {
                let result = self.eval_identity_equal(args, env)?;
                Ok(Value::Bool(result))
            }
            "N==?" => {
                let result = self.eval_identity_equal(args, env)?;
                Ok(Value::Bool(!result))
            }
            "OR" => {
                for arg in args {
                    let value = self.evaluate(arg, env)?;
                    if value.is_truthy() {
                        return Ok(value);
                    }
                }
                Ok(Value::Bool(false))
            }
            "AND" => {
                let mut last = Value::Bool(true);
                for arg in args {
                    let value = self.evaluate(arg, env)?;
                    if !value.is_truthy() {
                        return Ok(Value::Bool(false));
                    }
                    last = value;
                }
                Ok(last)
            }
            "NOT" => {
                let value = match args.first() {
                    Some(a) => self.evaluate(a, env)?,
                    None => return Ok(Value::Bool(true)),
                };
                Ok(Value::Bool(!value.is_truthy()))
            }
            "MAPRET" => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.evaluate(arg, env)?);
                }
                Err(Signal::Ret(values))
            }
            "MAPSTOP" => Err(Signal::Stop),
            "FORM" => self.eval_form_constructor(args, env),
            "LIST" => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.evaluate(arg, env)?);
                }
                Ok(Value::List(values))
            }
            "GVAL" => match args.first().and_then(|a| a.atom_name()) {
                Some(name) => {
                    let upper = name.to_uppercase();
                    match env.get(&upper) {
                        Some(v) => Ok(v.clone()),
                        None => Ok(Value::Node(ZilNode::GlobalVar(upper))),
                    }
                }
                None => Ok(Value::Unassigned),
            },
            "LVAL" => match args.first().and_then(|a| a.atom_name()) {
                Some(name) => Ok(env
                    .get(&name.to_uppercase())
                    .cloned()
                    .unwrap_or(Value::Unassigned)),
                None => Ok(Value::Unassigned),
            },
            "PARSE" => {
                let value = match args.first() {
                    Some(a) => self.evaluate(a, env)?,
                    None => return Ok(Value::Node(ZilNode::atom(""))),
                };
                Ok(Value::Node(match value {
                    Value::Str(s) => ZilNode::atom(&s),
                    Value::Node(n) => n,
                    other => ZilNode::atom(&format!("{:?}", other)),
                }))
            }
            "STRING" => {
                let mut out = String::new();
                for arg in args {
                    match self.evaluate(arg, env)? {
                        Value::Str(s) => out.push_str(&s),
                        Value::Node(ZilNode::Atom(name, _)) => out.push_str(&name),
                        Value::Int(n) => out.push_str(&n.to_string()),
                        _ => {}
                    }
                }
                Ok(Value::Str(out))
            }
            "ERROR" => {
                debug!("compile-time ERROR form ignored during macro expansion");
                Ok(Value::Unassigned)
            }
            "ASSIGNED?" => {
                let name = match args.first() {
                    Some(ZilNode::Atom(n, _)) => n.to_uppercase(),
                    Some(ZilNode::LocalVar(n)) => n.to_uppercase(),
                    _ => return Ok(Value::Bool(false)),
                };
                Ok(Value::Bool(matches!(
                    env.get(&name),
                    Some(v) if !matches!(v, Value::Unassigned)
                )))
            }
            "EVAL" => self.eval_eval(args, env),
            "IFFLAG" => self.eval_ifflag(args, env),
            _ => Ok(Value::Node(ZilNode::Form(form.clone()))),
        }
    }

    /// <MAPF collector function source...>: apply the function to each
    /// element (or repeatedly with no source) and collect the results.
    fn eval_mapf(&mut self, args: &[ZilNode], env: &mut Env) -> EvalResult {
        if args.len() < 2 {
            return Ok(Value::List(Vec::new()));
        }
        let _collector = self.evaluate(&args[0], env)?;
        let func = self.evaluate(&args[1], env)?;

        let mut results = Vec::new();

        if args.len() == 2 {
            // No source: call until MAPSTOP
            if let Value::Closure(mut closure) = func {
                loop {
                    match self.apply_closure(&mut closure, &[]) {
                        Ok(value) => push_result(&mut results, value),
                        Err(Signal::Stop) => break,
                        Err(Signal::Ret(values)) => results.extend(values),
                    }
                }
            }
            return Ok(Value::List(results));
        }

        let source = self.evaluate(&args[2], env)?;
        let items = match source {
            Value::List(items) => items,
            Value::Node(ZilNode::List(nodes)) => {
                nodes.iter().map(Value::from_node).collect()
            }
            other => vec![other],
        };

        if let Value::Closure(mut closure) = func {
            for item in items {
                match self.apply_closure(&mut closure, &[item]) {
                    Ok(value) => push_result(&mut results, value),
                    Err(Signal::Stop) => break,
                    Err(Signal::Ret(values)) => results.extend(values),
                }
            }
        } else {
            results = items;
        }
        Ok(Value::List(results))
    }

    /// <MAPR collector function source...>: like MAPF over list tails;
    /// yields the last truthy result.
    fn eval_mapr(&mut self, args: &[ZilNode], env: &mut Env) -> EvalResult {
        if args.len() < 2 {
            return Ok(Value::Unassigned);
        }
        let _collector = self.evaluate(&args[0], env)?;
        let func = self.evaluate(&args[1], env)?;
        let source = match args.get(2) {
            Some(a) => self.evaluate(a, env)?,
            None => Value::List(Vec::new()),
        };
        let items = match source {
            Value::List(items) => items,
            Value::Node(ZilNode::List(nodes)) => {
                nodes.iter().map(Value::from_node).collect()
            }
            other => vec![other],
        };

        let mut result = Value::Unassigned;
        if let Value::Closure(mut closure) = func {
            for i in 0..items.len() {
                let rest = Value::List(items[i..].to_vec());
                match self.apply_closure(&mut closure, &[rest]) {
                    Ok(value) => {
                        if value.is_truthy() {
                            result = value;
                        }
                    }
                    Err(Signal::Stop) => break,
                    Err(Signal::Ret(mut values)) => {
                        if let Some(last) = values.pop() {
                            result = last;
                        }
                    }
                }
            }
        }
        Ok(result)
    }

    /// <FUNCTION (params... "AUX" locals...) body...> builds a closure
    /// capturing the current environment by value.
    fn make_closure(&mut self, args: &[ZilNode], env: &Env) -> Value {
        let mut params = Vec::new();
        let mut aux = Vec::new();
        let mut in_aux = false;
        let mut body_start = 0;

        if let Some(first) = args.first() {
            body_start = 1;
            let spec_items: Vec<&ZilNode> = match first {
                ZilNode::List(items) => items.iter().collect(),
                ZilNode::Form(form) => std::iter::once(&*form.operator)
                    .chain(form.operands.iter())
                    .collect(),
                _ => {
                    body_start = 0;
                    Vec::new()
                }
            };
            for item in spec_items {
                match item {
                    ZilNode::Str(s) if s.eq_ignore_ascii_case("AUX") => in_aux = true,
                    ZilNode::Atom(name, _) => {
                        let upper = name.to_uppercase();
                        if upper == "\"AUX\"" || upper == "AUX" {
                            in_aux = true;
                        } else if in_aux {
                            aux.push(upper);
                        } else {
                            params.push(upper);
                        }
                    }
                    ZilNode::Quote(inner) => {
                        if let Some(name) = inner.atom_name() {
                            if in_aux {
                                aux.push(name.to_uppercase());
                            } else {
                                params.push(name.to_uppercase());
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        Value::Closure(Box::new(Closure {
            params,
            aux,
            body: args[body_start..].to_vec(),
            env: env.clone(),
        }))
    }

    pub fn apply_closure(&mut self, closure: &mut Closure, args: &[Value]) -> EvalResult {
        for (i, param) in closure.params.iter().enumerate() {
            let value = args.get(i).cloned().unwrap_or(Value::Unassigned);
            closure.env.insert(param.clone(), value);
        }
        for var in &closure.aux {
            closure.env.entry(var.clone()).or_insert(Value::Unassigned);
        }

        let body = closure.body.clone();
        let mut result = Value::Unassigned;
        for stmt in &body {
            result = self.evaluate(stmt, &mut closure.env)?;
        }
        Ok(result)
    }

    fn eval_cond_clauses(&mut self, clauses: &[CondClause], env: &mut Env) -> EvalResult {
        for clause in clauses {
            let truthy = match clause.test.atom_name().map(|n| n.to_uppercase()) {
                Some(name) if matches!(name.as_str(), "T" | "ELSE" | "OTHERWISE") => true,
                _ => self.evaluate(&clause.test, env)?.is_truthy(),
            };
            if truthy {
                let mut result = Value::Unassigned;
                for expr in &clause.body {
                    result = self.evaluate(expr, env)?;
                }
                return Ok(result);
            }
        }
        Ok(Value::Unassigned)
    }

    fn eval_set(&mut self, args: &[ZilNode], env: &mut Env) -> EvalResult {
        if args.len() < 2 {
            return Ok(Value::Unassigned);
        }
        let name = match &args[0] {
            ZilNode::Atom(n, _) => n.to_uppercase(),
            ZilNode::LocalVar(n) | ZilNode::GlobalVar(n) => n.to_uppercase(),
            _ => return Ok(Value::Unassigned),
        };
        let value = self.evaluate(&args[1], env)?;
        env.insert(name, value.clone());
        Ok(value)
    }

    fn eval_nth(&mut self, args: &[ZilNode], env: &mut Env) -> EvalResult {
        if args.len() < 2 {
            return Ok(Value::Unassigned);
        }
        let list = self.evaluate(&args[0], env)?;
        let n = self.evaluate(&args[1], env)?;
        if let (Value::List(items), Value::Int(n)) = (list, n) {
            // MDL indexes from 1
            let idx = n - 1;
            if idx >= 0 && (idx as usize) < items.len() {
                return Ok(items[idx as usize].clone());
            }
        }
        Ok(Value::Unassigned)
    }

    fn eval_rest(&mut self, args: &[ZilNode], env: &mut Env) -> EvalResult {
        let list = match args.first() {
            Some(a) => self.evaluate(a, env)?,
            None => return Ok(Value::List(Vec::new())),
        };
        let n = match args.get(1) {
            Some(a) => match self.evaluate(a, env)? {
                Value::Int(n) if n >= 0 => n as usize,
                _ => 1,
            },
            None => 1,
        };
        match list {
            Value::List(items) => Ok(Value::List(items.into_iter().skip(n).collect())),
            Value::Str(s) => Ok(Value::Str(s.chars().skip(n).collect())),
            _ => Ok(Value::List(Vec::new())),
        }
    }

    fn eval_type(&mut self, args: &[ZilNode], env: &mut Env) -> EvalResult {
        if args.len() < 2 {
            return Ok(Value::Bool(false));
        }
        let value = self.evaluate(&args[0], env)?;
        for type_arg in &args[1..] {
            let Some(type_name) = type_arg.atom_name() else {
                continue;
            };
            let matches = match type_name.to_uppercase().as_str() {
                "ATOM" => matches!(&value, Value::Node(ZilNode::Atom(_, _))),
                "STRING" | "ZSTRING" => {
                    matches!(&value, Value::Str(_) | Value::Node(ZilNode::Str(_)))
                }
                "FIX" => matches!(&value, Value::Int(_)),
                "LIST" => matches!(&value, Value::List(_) | Value::Node(ZilNode::List(_))),
                "FORM" => matches!(&value, Value::Node(ZilNode::Form(_))),
                "LVAL" => matches!(&value, Value::Node(ZilNode::LocalVar(_))),
                "GVAL" => matches!(&value, Value::Node(ZilNode::GlobalVar(_))),
                _ => false,
            };
            if matches {
                return Ok(Value::Bool(true));
            }
        }
        Ok(Value::Bool(false))
    }

    fn eval_string_equal(&mut self, args: &[ZilNode], env: &mut Env) -> Result<bool, Signal> {
        if args.len() < 2 {
            return Ok(false);
        }
        let a = self.evaluate(&args[0], env)?;
        let b = self.evaluate(&args[1], env)?;
        Ok(value_text(&a).eq_ignore_ascii_case(&value_text(&b)))
    }

    fn eval_identity_equal(&mut self, args: &[ZilNode], env: &mut Env) -> Result<bool, Signal> {
        if args.len() < 2 {
            return Ok(false);
        }
        let a = self.evaluate(&args[0], env)?;
        let b = self.evaluate(&args[1], env)?;
        Ok(match (&a, &b) {
            (Value::Int(x), Value::Int(y)) => x == y,
            (Value::Bool(x), Value::Bool(y)) => x == y,
            (Value::Str(x), Value::Str(y)) => x == y,
            (Value::Node(ZilNode::Atom(x, _)), Value::Node(ZilNode::Atom(y, _))) => {
                x.eq_ignore_ascii_case(y)
            }
            _ => false,
        })
    }

    /// <FORM op arg...>: build a new form from evaluated pieces. List
    /// results splice their items into the operand list.
    fn eval_form_constructor(&mut self, args: &[ZilNode], env: &mut Env) -> EvalResult {
        if args.is_empty() {
            return Ok(Value::Node(ZilNode::false_value()));
        }

        let operator_value = self.evaluate(&args[0], env)?;
        let operator = match operator_value {
            Value::Node(node) => node,
            Value::Str(s) => ZilNode::atom(&s),
            Value::Int(n) => ZilNode::Number(n),
            other => ZilNode::atom(&value_text(&other)),
        };

        let mut operands = Vec::new();
        for arg in &args[1..] {
            match self.evaluate(arg, env)? {
                Value::List(items) => {
                    for item in items {
                        operands.push(item.into_node());
                    }
                }
                Value::Unassigned => {}
                value => operands.push(value.into_node()),
            }
        }

        Ok(Value::Node(ZilNode::Form(FormNode {
            operator: Box::new(operator),
            operands,
            pos: SourcePos::default(),
        })))
    }

    /// <EVAL <FORM GLOBAL ...>>: executing a GLOBAL or CONSTANT definition
    /// registers it as a pending top-level definition (merged once by the
    /// expander); anything else just evaluates.
    fn eval_eval(&mut self, args: &[ZilNode], env: &mut Env) -> EvalResult {
        let Some(first) = args.first() else {
            return Ok(Value::Unassigned);
        };
        let value = self.evaluate(first, env)?;

        if let Value::Node(ZilNode::Form(form)) = &value {
            if let Some(op) = form.operator.atom_name() {
                match op.to_uppercase().as_str() {
                    "GLOBAL" => {
                        if let Some(name) = form.operands.first().and_then(|n| n.atom_name()) {
                            let init = match form.operands.get(1) {
                                Some(v) => Some(self.evaluate(v, env)?.into_node()),
                                None => None,
                            };
                            debug!("EVAL created global {}", name);
                            self.pending_globals.push(GlobalNode {
                                name: name.to_uppercase(),
                                value: init,
                                pos: form.pos,
                            });
                            return Ok(Value::Unassigned);
                        }
                    }
                    "CONSTANT" => {
                        if form.operands.len() >= 2 {
                            if let Some(name) = form.operands[0].atom_name() {
                                let val = self.evaluate(&form.operands[1], env)?.into_node();
                                debug!("EVAL created constant {}", name);
                                self.pending_constants.push(ConstantNode {
                                    name: name.to_uppercase(),
                                    value: val,
                                    pos: form.pos,
                                });
                                return Ok(Value::Unassigned);
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        Ok(value)
    }

    /// <IFFLAG (FLAG expr) ... (T default)>: first set flag wins.
    /// IN-ZILCH reflects whether we are expanding for code generation.
    fn eval_ifflag(&mut self, args: &[ZilNode], env: &mut Env) -> EvalResult {
        for clause in args {
            let (flag_node, exprs): (&ZilNode, &[ZilNode]) = match clause {
                ZilNode::List(items) if !items.is_empty() => (&items[0], &items[1..]),
                ZilNode::Form(form) => (&form.operator, &form.operands),
                _ => continue,
            };

            let selected = match flag_node.atom_name().map(|n| n.to_uppercase()) {
                Some(name) => match name.as_str() {
                    "T" | "ELSE" => true,
                    "IN-ZILCH" => self.in_zilch,
                    other => self.compilation_flags.get(other).copied().unwrap_or(false),
                },
                None => false,
            };

            if selected {
                let mut result = Value::Unassigned;
                for expr in exprs {
                    result = self.evaluate(expr, env)?;
                }
                return Ok(result);
            }
        }
        Ok(Value::Unassigned)
    }

    /// Quasiquote template: literal substructure is preserved; Unquote
    /// evaluates; SpliceUnquote evaluates and inlines list items.
    fn expand_quasiquote(&mut self, node: &ZilNode, env: &mut Env) -> EvalResult {
        match node {
            ZilNode::Unquote(inner) => self.evaluate(inner, env),
            ZilNode::Quasiquote(inner) => {
                // Nested template: one level deeper, re-wrap
                let expanded = self.expand_quasiquote(inner, env)?;
                Ok(Value::Node(ZilNode::Quasiquote(Box::new(
                    expanded.into_node(),
                ))))
            }
            ZilNode::Form(form) => {
                let operator = self.expand_quasiquote(&form.operator, env)?.into_node();
                let mut operands = Vec::new();
                for op in &form.operands {
                    if let ZilNode::SpliceUnquote(inner) = op {
                        match self.evaluate(inner, env)? {
                            Value::List(items) => {
                                for item in items {
                                    operands.push(item.into_node());
                                }
                            }
                            Value::Node(ZilNode::List(items)) => operands.extend(items),
                            value => operands.push(value.into_node()),
                        }
                    } else {
                        operands.push(self.expand_quasiquote(op, env)?.into_node());
                    }
                }
                Ok(Value::Node(ZilNode::Form(FormNode {
                    operator: Box::new(operator),
                    operands,
                    pos: form.pos,
                })))
            }
            ZilNode::List(items) => {
                let mut out = Vec::new();
                for item in items {
                    if let ZilNode::SpliceUnquote(inner) = item {
                        match self.evaluate(inner, env)? {
                            Value::List(values) => {
                                for v in values {
                                    out.push(v.into_node());
                                }
                            }
                            Value::Node(ZilNode::List(nodes)) => out.extend(nodes),
                            value => out.push(value.into_node()),
                        }
                    } else {
                        out.push(self.expand_quasiquote(item, env)?.into_node());
                    }
                }
                Ok(Value::Node(ZilNode::List(out)))
            }
            other => Ok(Value::Node(other.clone())),
        }
    }
}

impl Default for Evaluator {
    fn default() -> Self {
        Evaluator::new()
    }
}

fn push_result(results: &mut Vec<Value>, value: Value) {
    match value {
        Value::Unassigned => {}
        Value::List(items) => results.extend(items),
        other => results.push(other),
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::Str(s) => s.clone(),
        Value::Int(n) => n.to_string(),
        Value::Bool(b) => if *b { "T" } else { "FALSE" }.to_string(),
        Value::Node(ZilNode::Atom(name, _)) => name.clone(),
        Value::Node(ZilNode::Str(s)) => s.clone(),
        other => format!("{:?}", other),
    }
}

#[cfg(test)]
#[path = "eval_tests.rs"]
mod tests;
