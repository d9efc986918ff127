//! Allow-list tree-walking evaluator.
//!
//! Only the documented environment is bindable: `context`, `memory`,
//! `llm_query`, `FINAL`, a fixed set of pure builtins, and whatever the
//! program defines itself. Every other name raises a violation carrying the
//! offending name. The evaluator polls the wall-clock deadline at statement
//! and loop boundaries.

use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use std::time::Instant;

use super::ast::*;
use super::error::SandboxError;
use super::value::{compare_values, values_equal, Function, Value};
use crate::error::ErrorKind;

/// Maximum user-function call depth.
const MAX_CALL_DEPTH: usize = 64;
/// Maximum number of elements `range` will materialize.
const MAX_RANGE_LEN: i64 = 10_000_000;

const BUILTIN_FNS: &[&str] = &[
    "len", "range", "enumerate", "min", "max", "sum", "sorted", "str", "int", "float", "bool",
    "list", "dict", "llm_query", "FINAL",
];

/// Host capabilities reachable from inside a program. `llm_query` blocks the
/// interpreter until the nested agent invocation resolves.
pub trait SandboxHost {
    fn llm_query(&mut self, prompt: String) -> Result<String, HostError>;
}

/// A failure reported by the host; aborts the program with its kind.
#[derive(Debug, Clone)]
pub struct HostError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Non-local exits: either the program produced its result via `FINAL`, or
/// it failed.
pub(crate) enum Signal {
    Final(String),
    Error(SandboxError),
}

impl From<SandboxError> for Signal {
    fn from(e: SandboxError) -> Self {
        Signal::Error(e)
    }
}

/// Statement-level control flow.
enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

type ExecResult<T> = Result<T, Signal>;

pub(crate) struct Interpreter<'h> {
    globals: HashMap<String, Value>,
    frames: Vec<HashMap<String, Value>>,
    host: &'h mut dyn SandboxHost,
    deadline: Instant,
    call_depth: usize,
}

impl<'h> Interpreter<'h> {
    pub fn new(
        context: &str,
        memory_in: &HashMap<String, serde_json::Value>,
        host: &'h mut dyn SandboxHost,
        deadline: Instant,
    ) -> Self {
        let memory_entries: BTreeMap<String, Value> = memory_in
            .iter()
            .map(|(k, v)| (k.clone(), Value::from_json(v)))
            .collect();

        let mut globals = HashMap::new();
        globals.insert("context".to_string(), Value::str(context));
        globals.insert("memory".to_string(), Value::dict(memory_entries));

        Self {
            globals,
            frames: Vec::new(),
            host,
            deadline,
            call_depth: 0,
        }
    }

    /// Export the (possibly mutated) memory mapping. Reads the live
    /// `memory` binding so a full rebind (`memory = {...}`) is captured the
    /// same way per-key mutation is.
    pub fn memory_snapshot(&self) -> HashMap<String, serde_json::Value> {
        match self.globals.get("memory") {
            Some(Value::Dict(d)) => d
                .borrow()
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
            _ => HashMap::new(),
        }
    }

    pub fn run(&mut self, stmts: &[Stmt]) -> Result<(), Signal> {
        self.exec_block(stmts)?;
        Ok(())
    }

    fn check_deadline(&self) -> Result<(), Signal> {
        if Instant::now() >= self.deadline {
            return Err(SandboxError::Timeout.into());
        }
        Ok(())
    }

    fn runtime(&self, line: usize, message: impl Into<String>) -> SandboxError {
        SandboxError::Runtime {
            line,
            message: message.into(),
        }
    }

    fn exec_block(&mut self, stmts: &[Stmt]) -> ExecResult<Flow> {
        for stmt in stmts {
            self.check_deadline()?;
            match self.exec_stmt(stmt)? {
                Flow::Normal => {}
                other => return Ok(other),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, stmt: &Stmt) -> ExecResult<Flow> {
        let line = stmt.line;
        match &stmt.kind {
            StmtKind::Assign { target, value } => {
                let value = self.eval(value, line)?;
                self.assign(target, value, line)?;
                Ok(Flow::Normal)
            }
            StmtKind::AugAssign { target, op, value } => {
                let current = match target {
                    AssignTarget::Name(name) => self.lookup(name, line)?,
                    AssignTarget::Index { obj, index } => {
                        let obj_v = self.eval(obj, line)?;
                        let index_v = self.eval(index, line)?;
                        self.index_value(&obj_v, &index_v, line)?
                    }
                };
                let rhs = self.eval(value, line)?;
                let result = self.binary_op(*op, &current, &rhs, line)?;
                self.assign(target, result, line)?;
                Ok(Flow::Normal)
            }
            StmtKind::Expr(expr) => {
                self.eval(expr, line)?;
                Ok(Flow::Normal)
            }
            StmtKind::If { branches, orelse } => {
                for (cond, body) in branches {
                    if self.eval(cond, line)?.truthy() {
                        return self.exec_block(body);
                    }
                }
                self.exec_block(orelse)
            }
            StmtKind::For { vars, iter, body } => {
                let items = self.iterable_items(iter, line)?;
                for item in items {
                    self.check_deadline()?;
                    self.bind_loop_vars(vars, item, line)?;
                    match self.exec_block(body)? {
                        Flow::Normal | Flow::Continue => {}
                        Flow::Break => break,
                        Flow::Return(v) => return Ok(Flow::Return(v)),
                    }
                }
                Ok(Flow::Normal)
            }
            StmtKind::While { cond, body } => {
                while self.eval(cond, line)?.truthy() {
                    self.check_deadline()?;
                    match self.exec_block(body)? {
                        Flow::Normal | Flow::Continue => {}
                        Flow::Break => break,
                        Flow::Return(v) => return Ok(Flow::Return(v)),
                    }
                }
                Ok(Flow::Normal)
            }
            StmtKind::FuncDef { name, params, body } => {
                let func = Value::Function(Rc::new(Function {
                    name: name.clone(),
                    params: params.clone(),
                    body: body.clone(),
                }));
                self.bind(name.clone(), func);
                Ok(Flow::Normal)
            }
            StmtKind::Return(value) => {
                if self.frames.is_empty() {
                    return Err(self.runtime(line, "'return' outside function").into());
                }
                let v = match value {
                    Some(expr) => self.eval(expr, line)?,
                    None => Value::Null,
                };
                Ok(Flow::Return(v))
            }
            StmtKind::Break => Ok(Flow::Break),
            StmtKind::Continue => Ok(Flow::Continue),
            StmtKind::Pass => Ok(Flow::Normal),
        }
    }

    fn bind_loop_vars(&mut self, vars: &[String], item: Value, line: usize) -> ExecResult<()> {
        if vars.len() == 1 {
            self.bind(vars[0].clone(), item);
            return Ok(());
        }
        match &item {
            Value::List(items) => {
                let items = items.borrow();
                if items.len() != vars.len() {
                    return Err(self
                        .runtime(
                            line,
                            format!(
                                "cannot unpack {} values into {} names",
                                items.len(),
                                vars.len()
                            ),
                        )
                        .into());
                }
                for (var, value) in vars.iter().zip(items.iter()) {
                    self.bind(var.clone(), value.clone());
                }
                Ok(())
            }
            other => Err(self
                .runtime(
                    line,
                    format!("cannot unpack {} into {} names", other.type_name(), vars.len()),
                )
                .into()),
        }
    }

    fn iterable_items(&mut self, iter: &Expr, line: usize) -> ExecResult<Vec<Value>> {
        let value = self.eval(iter, line)?;
        match &value {
            Value::List(items) => Ok(items.borrow().clone()),
            Value::Str(s) => Ok(s.chars().map(|c| Value::str(c.to_string())).collect()),
            Value::Dict(d) => Ok(d.borrow().keys().map(Value::str).collect()),
            other => Err(self
                .runtime(line, format!("{} object is not iterable", other.type_name()))
                .into()),
        }
    }

    // Name binding and resolution.

    fn bind(&mut self, name: String, value: Value) {
        if let Some(frame) = self.frames.last_mut() {
            frame.insert(name, value);
        } else {
            self.globals.insert(name, value);
        }
    }

    fn lookup(&self, name: &str, line: usize) -> ExecResult<Value> {
        if let Some(frame) = self.frames.last() {
            if let Some(v) = frame.get(name) {
                return Ok(v.clone());
            }
        }
        if let Some(v) = self.globals.get(name) {
            return Ok(v.clone());
        }
        if BUILTIN_FNS.contains(&name) {
            return Err(self
                .runtime(
                    line,
                    format!("builtin '{}' may only be called, not referenced", name),
                )
                .into());
        }
        Err(SandboxError::Violation {
            name: name.to_string(),
        }
        .into())
    }

    fn assign(&mut self, target: &AssignTarget, value: Value, line: usize) -> ExecResult<()> {
        match target {
            AssignTarget::Name(name) => {
                if name == "context" || BUILTIN_FNS.contains(&name.as_str()) {
                    return Err(self.runtime(line, format!("cannot rebind '{}'", name)).into());
                }
                self.bind(name.clone(), value);
                Ok(())
            }
            AssignTarget::Index { obj, index } => {
                let obj_v = self.eval(obj, line)?;
                let index_v = self.eval(index, line)?;
                match (&obj_v, &index_v) {
                    (Value::List(items), Value::Int(i)) => {
                        let mut items = items.borrow_mut();
                        let len = items.len() as i64;
                        let idx = if *i < 0 { i + len } else { *i };
                        if idx < 0 || idx >= len {
                            return Err(self
                                .runtime(line, format!("list index out of range: {}", i))
                                .into());
                        }
                        items[idx as usize] = value;
                        Ok(())
                    }
                    (Value::Dict(entries), Value::Str(key)) => {
                        entries.borrow_mut().insert(key.to_string(), value);
                        Ok(())
                    }
                    (obj, idx) => Err(self
                        .runtime(
                            line,
                            format!("cannot assign to {}[{}]", obj.type_name(), idx.type_name()),
                        )
                        .into()),
                }
            }
        }
    }

    // Expressions.

    fn eval(&mut self, expr: &Expr, line: usize) -> ExecResult<Value> {
        match expr {
            Expr::Null => Ok(Value::Null),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Int(i) => Ok(Value::Int(*i)),
            Expr::Float(f) => Ok(Value::Float(*f)),
            Expr::Str(s) => Ok(Value::str(s)),
            Expr::Name(name) => self.lookup(name, line),
            Expr::FString(parts) => {
                let mut out = String::new();
                for part in parts {
                    match part {
                        FStringPart::Text(text) => out.push_str(text),
                        FStringPart::Expr(expr) => {
                            let v = self.eval(expr, line)?;
                            out.push_str(&v.display());
                        }
                    }
                }
                Ok(Value::str(out))
            }
            Expr::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval(item, line)?);
                }
                Ok(Value::list(values))
            }
            Expr::Dict(entries) => {
                let mut map = BTreeMap::new();
                for (key, value) in entries {
                    let key_v = self.eval(key, line)?;
                    let key_s = match key_v {
                        Value::Str(s) => s.to_string(),
                        other => {
                            return Err(self
                                .runtime(
                                    line,
                                    format!(
                                        "dict keys must be strings, got {}",
                                        other.type_name()
                                    ),
                                )
                                .into())
                        }
                    };
                    map.insert(key_s, self.eval(value, line)?);
                }
                Ok(Value::dict(map))
            }
            Expr::Unary { op, operand } => {
                let v = self.eval(operand, line)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!v.truthy())),
                    UnaryOp::Neg => match v {
                        Value::Int(i) => Ok(Value::Int(-i)),
                        Value::Float(f) => Ok(Value::Float(-f)),
                        other => Err(self
                            .runtime(
                                line,
                                format!("bad operand type for unary -: {}", other.type_name()),
                            )
                            .into()),
                    },
                }
            }
            Expr::Binary { op, left, right } => {
                let l = self.eval(left, line)?;
                let r = self.eval(right, line)?;
                self.binary_op(*op, &l, &r, line)
            }
            Expr::BoolOp { op, left, right } => {
                let l = self.eval(left, line)?;
                match op {
                    BoolOp::And => {
                        if !l.truthy() {
                            Ok(l)
                        } else {
                            self.eval(right, line)
                        }
                    }
                    BoolOp::Or => {
                        if l.truthy() {
                            Ok(l)
                        } else {
                            self.eval(right, line)
                        }
                    }
                }
            }
            Expr::Compare { op, left, right } => {
                let l = self.eval(left, line)?;
                let r = self.eval(right, line)?;
                self.compare_op(*op, &l, &r, line)
            }
            Expr::Call { func, args } => self.call(func, args, line),
            Expr::Method { obj, name, args } => {
                let obj_v = self.eval(obj, line)?;
                let mut arg_vs = Vec::with_capacity(args.len());
                for arg in args {
                    arg_vs.push(self.eval(arg, line)?);
                }
                self.call_method(&obj_v, name, arg_vs, line)
            }
            Expr::Index { obj, index } => {
                let obj_v = self.eval(obj, line)?;
                let index_v = self.eval(index, line)?;
                self.index_value(&obj_v, &index_v, line)
            }
            Expr::Slice { obj, start, stop } => {
                let obj_v = self.eval(obj, line)?;
                let start_v = match start {
                    Some(e) => Some(self.eval_int(e, line)?),
                    None => None,
                };
                let stop_v = match stop {
                    Some(e) => Some(self.eval_int(e, line)?),
                    None => None,
                };
                self.slice_value(&obj_v, start_v, stop_v, line)
            }
        }
    }

    fn eval_int(&mut self, expr: &Expr, line: usize) -> ExecResult<i64> {
        match self.eval(expr, line)? {
            Value::Int(i) => Ok(i),
            other => Err(self
                .runtime(
                    line,
                    format!("slice indices must be integers, got {}", other.type_name()),
                )
                .into()),
        }
    }

    fn binary_op(&self, op: BinOp, l: &Value, r: &Value, line: usize) -> ExecResult<Value> {
        use BinOp::*;
        match (op, l, r) {
            (Add, Value::Str(a), Value::Str(b)) => Ok(Value::str(format!("{}{}", a, b))),
            (Add, Value::List(a), Value::List(b)) => {
                let mut items = a.borrow().clone();
                items.extend(b.borrow().iter().cloned());
                Ok(Value::list(items))
            }
            (_, Value::Int(a), Value::Int(b)) => self.int_op(op, *a, *b, line),
            (_, Value::Float(a), Value::Float(b)) => self.float_op(op, *a, *b, line),
            (_, Value::Int(a), Value::Float(b)) => self.float_op(op, *a as f64, *b, line),
            (_, Value::Float(a), Value::Int(b)) => self.float_op(op, *a, *b as f64, line),
            _ => Err(self
                .runtime(
                    line,
                    format!(
                        "unsupported operand types for {}: {} and {}",
                        op_symbol(op),
                        l.type_name(),
                        r.type_name()
                    ),
                )
                .into()),
        }
    }

    fn int_op(&self, op: BinOp, a: i64, b: i64, line: usize) -> ExecResult<Value> {
        use BinOp::*;
        match op {
            Add => Ok(Value::Int(a.wrapping_add(b))),
            Sub => Ok(Value::Int(a.wrapping_sub(b))),
            Mul => Ok(Value::Int(a.wrapping_mul(b))),
            Div => {
                if b == 0 {
                    Err(self.runtime(line, "division by zero").into())
                } else {
                    Ok(Value::Float(a as f64 / b as f64))
                }
            }
            FloorDiv => {
                if b == 0 {
                    Err(self.runtime(line, "division by zero").into())
                } else {
                    Ok(Value::Int(a.div_euclid(b)))
                }
            }
            Mod => {
                if b == 0 {
                    Err(self.runtime(line, "modulo by zero").into())
                } else {
                    Ok(Value::Int(a.rem_euclid(b)))
                }
            }
        }
    }

    fn float_op(&self, op: BinOp, a: f64, b: f64, line: usize) -> ExecResult<Value> {
        use BinOp::*;
        match op {
            Add => Ok(Value::Float(a + b)),
            Sub => Ok(Value::Float(a - b)),
            Mul => Ok(Value::Float(a * b)),
            Div => {
                if b == 0.0 {
                    Err(self.runtime(line, "division by zero").into())
                } else {
                    Ok(Value::Float(a / b))
                }
            }
            FloorDiv => {
                if b == 0.0 {
                    Err(self.runtime(line, "division by zero").into())
                } else {
                    Ok(Value::Float((a / b).floor()))
                }
            }
            Mod => {
                if b == 0.0 {
                    Err(self.runtime(line, "modulo by zero").into())
                } else {
                    Ok(Value::Float(a.rem_euclid(b)))
                }
            }
        }
    }

    fn compare_op(&self, op: CmpOp, l: &Value, r: &Value, line: usize) -> ExecResult<Value> {
        use CmpOp::*;
        let result = match op {
            Eq => values_equal(l, r),
            Ne => !values_equal(l, r),
            In | NotIn => {
                let contains = self.contains(r, l, line)?;
                if op == In {
                    contains
                } else {
                    !contains
                }
            }
            Lt | Le | Gt | Ge => {
                let ordering = compare_values(l, r).ok_or_else(|| {
                    Signal::from(self.runtime(
                        line,
                        format!("cannot compare {} and {}", l.type_name(), r.type_name()),
                    ))
                })?;
                match op {
                    Lt => ordering.is_lt(),
                    Le => ordering.is_le(),
                    Gt => ordering.is_gt(),
                    Ge => ordering.is_ge(),
                    _ => unreachable!(),
                }
            }
        };
        Ok(Value::Bool(result))
    }

    fn contains(&self, container: &Value, needle: &Value, line: usize) -> ExecResult<bool> {
        match (container, needle) {
            (Value::Str(s), Value::Str(sub)) => Ok(s.contains(sub.as_ref())),
            (Value::List(items), needle) => {
                Ok(items.borrow().iter().any(|v| values_equal(v, needle)))
            }
            (Value::Dict(entries), Value::Str(key)) => {
                Ok(entries.borrow().contains_key(key.as_ref()))
            }
            (container, _) => Err(self
                .runtime(
                    line,
                    format!("membership test unsupported on {}", container.type_name()),
                )
                .into()),
        }
    }

    fn index_value(&self, obj: &Value, index: &Value, line: usize) -> ExecResult<Value> {
        match (obj, index) {
            (Value::Str(s), Value::Int(i)) => {
                let chars: Vec<char> = s.chars().collect();
                let len = chars.len() as i64;
                let idx = if *i < 0 { i + len } else { *i };
                if idx < 0 || idx >= len {
                    return Err(self
                        .runtime(line, format!("string index out of range: {}", i))
                        .into());
                }
                Ok(Value::str(chars[idx as usize].to_string()))
            }
            (Value::List(items), Value::Int(i)) => {
                let items = items.borrow();
                let len = items.len() as i64;
                let idx = if *i < 0 { i + len } else { *i };
                if idx < 0 || idx >= len {
                    return Err(self
                        .runtime(line, format!("list index out of range: {}", i))
                        .into());
                }
                Ok(items[idx as usize].clone())
            }
            (Value::Dict(entries), Value::Str(key)) => {
                entries.borrow().get(key.as_ref()).cloned().ok_or_else(|| {
                    Signal::from(self.runtime(line, format!("key not found: '{}'", key)))
                })
            }
            (obj, idx) => Err(self
                .runtime(
                    line,
                    format!("cannot index {} with {}", obj.type_name(), idx.type_name()),
                )
                .into()),
        }
    }

    fn slice_value(
        &self,
        obj: &Value,
        start: Option<i64>,
        stop: Option<i64>,
        line: usize,
    ) -> ExecResult<Value> {
        fn bounds(len: usize, start: Option<i64>, stop: Option<i64>) -> (usize, usize) {
            let len = len as i64;
            let clamp = |v: i64| -> i64 {
                let v = if v < 0 { v + len } else { v };
                v.clamp(0, len)
            };
            let lo = clamp(start.unwrap_or(0));
            let hi = clamp(stop.unwrap_or(len));
            (lo as usize, hi.max(lo) as usize)
        }
        match obj {
            Value::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                let (lo, hi) = bounds(chars.len(), start, stop);
                Ok(Value::str(chars[lo..hi].iter().collect::<String>()))
            }
            Value::List(items) => {
                let items = items.borrow();
                let (lo, hi) = bounds(items.len(), start, stop);
                Ok(Value::list(items[lo..hi].to_vec()))
            }
            other => Err(self
                .runtime(line, format!("{} object cannot be sliced", other.type_name()))
                .into()),
        }
    }

    // Calls.

    fn call(&mut self, func: &str, args: &[Expr], line: usize) -> ExecResult<Value> {
        let user_func = self
            .frames
            .last()
            .and_then(|f| f.get(func))
            .or_else(|| self.globals.get(func))
            .cloned();
        if let Some(Value::Function(function)) = user_func {
            let mut arg_vs = Vec::with_capacity(args.len());
            for arg in args {
                arg_vs.push(self.eval(arg, line)?);
            }
            return self.call_function(&function, arg_vs, line);
        }

        let mut arg_vs = Vec::with_capacity(args.len());
        for arg in args {
            arg_vs.push(self.eval(arg, line)?);
        }
        match func {
            "FINAL" => {
                let value = arg_vs
                    .first()
                    .ok_or_else(|| Signal::from(self.runtime(line, "FINAL requires a value")))?;
                Err(Signal::Final(value.display()))
            }
            "llm_query" => {
                let prompt = match arg_vs.first() {
                    Some(Value::Str(s)) => s.to_string(),
                    Some(other) => other.display(),
                    None => {
                        return Err(self.runtime(line, "llm_query requires a prompt").into())
                    }
                };
                match self.host.llm_query(prompt) {
                    Ok(text) => Ok(Value::str(text)),
                    Err(HostError { kind, message }) => {
                        Err(SandboxError::Host { kind, message }.into())
                    }
                }
            }
            "len" => self.builtin_len(&arg_vs, line),
            "range" => self.builtin_range(&arg_vs, line),
            "enumerate" => self.builtin_enumerate(&arg_vs, line),
            "min" => self.builtin_min_max(&arg_vs, line, true),
            "max" => self.builtin_min_max(&arg_vs, line, false),
            "sum" => self.builtin_sum(&arg_vs, line),
            "sorted" => self.builtin_sorted(&arg_vs, line),
            "str" => Ok(Value::str(
                arg_vs.first().map(|v| v.display()).unwrap_or_default(),
            )),
            "int" => self.builtin_int(&arg_vs, line),
            "float" => self.builtin_float(&arg_vs, line),
            "bool" => Ok(Value::Bool(
                arg_vs.first().map(|v| v.truthy()).unwrap_or(false),
            )),
            "list" => self.builtin_list(&arg_vs, line),
            "dict" => self.builtin_dict(&arg_vs, line),
            other => Err(SandboxError::Violation {
                name: other.to_string(),
            }
            .into()),
        }
    }

    fn call_function(
        &mut self,
        function: &Rc<Function>,
        args: Vec<Value>,
        line: usize,
    ) -> ExecResult<Value> {
        if args.len() != function.params.len() {
            return Err(self
                .runtime(
                    line,
                    format!(
                        "{}() takes {} arguments, got {}",
                        function.name,
                        function.params.len(),
                        args.len()
                    ),
                )
                .into());
        }
        if self.call_depth >= MAX_CALL_DEPTH {
            return Err(self.runtime(line, "maximum call depth exceeded").into());
        }
        let mut frame = HashMap::new();
        for (param, value) in function.params.iter().zip(args) {
            frame.insert(param.clone(), value);
        }
        self.frames.push(frame);
        self.call_depth += 1;
        let result = self.exec_block(&function.body);
        self.call_depth -= 1;
        self.frames.pop();
        match result? {
            Flow::Return(v) => Ok(v),
            _ => Ok(Value::Null),
        }
    }

    fn call_method(
        &mut self,
        obj: &Value,
        name: &str,
        args: Vec<Value>,
        line: usize,
    ) -> ExecResult<Value> {
        match obj {
            Value::Str(s) => self.string_method(s, name, args, line),
            Value::List(items) => match name {
                "append" => {
                    let value = args.into_iter().next().ok_or_else(|| {
                        Signal::from(self.runtime(line, "append requires a value"))
                    })?;
                    items.borrow_mut().push(value);
                    Ok(Value::Null)
                }
                other => {
                    Err(self.runtime(line, format!("unknown list method: {}", other)).into())
                }
            },
            Value::Dict(entries) => match name {
                "get" => {
                    let key = match args.first() {
                        Some(Value::Str(k)) => k.to_string(),
                        _ => {
                            return Err(self
                                .runtime(line, "dict.get requires a string key")
                                .into())
                        }
                    };
                    let default = args.get(1).cloned().unwrap_or(Value::Null);
                    Ok(entries.borrow().get(&key).cloned().unwrap_or(default))
                }
                "keys" => Ok(Value::list(
                    entries.borrow().keys().map(Value::str).collect(),
                )),
                "values" => Ok(Value::list(entries.borrow().values().cloned().collect())),
                "items" => Ok(Value::list(
                    entries
                        .borrow()
                        .iter()
                        .map(|(k, v)| Value::list(vec![Value::str(k), v.clone()]))
                        .collect(),
                )),
                other => {
                    Err(self.runtime(line, format!("unknown dict method: {}", other)).into())
                }
            },
            other => Err(self
                .runtime(
                    line,
                    format!("{} object has no method '{}'", other.type_name(), name),
                )
                .into()),
        }
    }

    fn string_method(
        &self,
        s: &Rc<str>,
        name: &str,
        args: Vec<Value>,
        line: usize,
    ) -> ExecResult<Value> {
        let str_arg = |i: usize| -> Option<String> {
            match args.get(i) {
                Some(Value::Str(v)) => Some(v.to_string()),
                _ => None,
            }
        };
        match name {
            "split" => {
                let parts: Vec<Value> = match str_arg(0) {
                    Some(sep) => s.split(sep.as_str()).map(Value::str).collect(),
                    None => s.split_whitespace().map(Value::str).collect(),
                };
                Ok(Value::list(parts))
            }
            "join" => match args.first() {
                Some(Value::List(items)) => {
                    let mut parts = Vec::new();
                    for item in items.borrow().iter() {
                        match item {
                            Value::Str(part) => parts.push(part.to_string()),
                            other => {
                                return Err(self
                                    .runtime(
                                        line,
                                        format!(
                                            "join requires a list of strings, got {}",
                                            other.type_name()
                                        ),
                                    )
                                    .into())
                            }
                        }
                    }
                    Ok(Value::str(parts.join(s.as_ref())))
                }
                _ => Err(self.runtime(line, "join requires a list argument").into()),
            },
            "strip" => Ok(Value::str(s.trim())),
            "upper" => Ok(Value::str(s.to_uppercase())),
            "lower" => Ok(Value::str(s.to_lowercase())),
            "find" => {
                let needle = str_arg(0).ok_or_else(|| {
                    Signal::from(self.runtime(line, "find requires a string"))
                })?;
                match s.find(&needle) {
                    // Byte offset converted to a character offset.
                    Some(byte_idx) => Ok(Value::Int(s[..byte_idx].chars().count() as i64)),
                    None => Ok(Value::Int(-1)),
                }
            }
            "replace" => {
                let from = str_arg(0).ok_or_else(|| {
                    Signal::from(self.runtime(line, "replace requires two strings"))
                })?;
                let to = str_arg(1).ok_or_else(|| {
                    Signal::from(self.runtime(line, "replace requires two strings"))
                })?;
                Ok(Value::str(s.replace(&from, &to)))
            }
            "startswith" => {
                let prefix = str_arg(0).ok_or_else(|| {
                    Signal::from(self.runtime(line, "startswith requires a string"))
                })?;
                Ok(Value::Bool(s.starts_with(&prefix)))
            }
            "endswith" => {
                let suffix = str_arg(0).ok_or_else(|| {
                    Signal::from(self.runtime(line, "endswith requires a string"))
                })?;
                Ok(Value::Bool(s.ends_with(&suffix)))
            }
            other => {
                Err(self.runtime(line, format!("unknown string method: {}", other)).into())
            }
        }
    }

    // Builtins.

    fn builtin_len(&self, args: &[Value], line: usize) -> ExecResult<Value> {
        match args.first() {
            Some(Value::Str(s)) => Ok(Value::Int(s.chars().count() as i64)),
            Some(Value::List(items)) => Ok(Value::Int(items.borrow().len() as i64)),
            Some(Value::Dict(entries)) => Ok(Value::Int(entries.borrow().len() as i64)),
            Some(other) => Err(self
                .runtime(
                    line,
                    format!("object of type {} has no len()", other.type_name()),
                )
                .into()),
            None => Err(self.runtime(line, "len requires an argument").into()),
        }
    }

    fn builtin_range(&self, args: &[Value], line: usize) -> ExecResult<Value> {
        let as_int = |v: &Value| -> Option<i64> {
            match v {
                Value::Int(i) => Some(*i),
                _ => None,
            }
        };
        let ints: Option<Vec<i64>> = args.iter().map(as_int).collect();
        let ints = ints.ok_or_else(|| {
            Signal::from(self.runtime(line, "range requires integer arguments"))
        })?;
        let (start, stop, step) = match ints.len() {
            1 => (0, ints[0], 1),
            2 => (ints[0], ints[1], 1),
            3 => (ints[0], ints[1], ints[2]),
            _ => return Err(self.runtime(line, "range takes 1 to 3 arguments").into()),
        };
        if step == 0 {
            return Err(self.runtime(line, "range step must not be zero").into());
        }
        let span = if step > 0 { stop - start } else { start - stop };
        let count = if span <= 0 {
            0
        } else {
            (span + step.abs() - 1) / step.abs()
        };
        if count > MAX_RANGE_LEN {
            return Err(self
                .runtime(line, format!("range result too large: {}", count))
                .into());
        }
        let mut items = Vec::with_capacity(count as usize);
        let mut v = start;
        while (step > 0 && v < stop) || (step < 0 && v > stop) {
            items.push(Value::Int(v));
            v += step;
        }
        Ok(Value::list(items))
    }

    fn builtin_enumerate(&mut self, args: &[Value], line: usize) -> ExecResult<Value> {
        let items = match args.first() {
            Some(Value::List(items)) => items.borrow().clone(),
            Some(Value::Str(s)) => s.chars().map(|c| Value::str(c.to_string())).collect(),
            Some(other) => {
                return Err(self
                    .runtime(line, format!("{} object is not iterable", other.type_name()))
                    .into())
            }
            None => return Err(self.runtime(line, "enumerate requires an argument").into()),
        };
        Ok(Value::list(
            items
                .into_iter()
                .enumerate()
                .map(|(i, v)| Value::list(vec![Value::Int(i as i64), v]))
                .collect(),
        ))
    }

    fn builtin_min_max(&self, args: &[Value], line: usize, take_min: bool) -> ExecResult<Value> {
        let candidates: Vec<Value> = match args {
            [Value::List(items)] => items.borrow().clone(),
            _ if args.len() >= 2 => args.to_vec(),
            _ => {
                return Err(self
                    .runtime(line, "min/max require a list or at least two arguments")
                    .into())
            }
        };
        if candidates.is_empty() {
            return Err(self.runtime(line, "min/max of empty sequence").into());
        }
        let mut best = candidates[0].clone();
        for candidate in &candidates[1..] {
            let ordering = compare_values(candidate, &best).ok_or_else(|| {
                Signal::from(self.runtime(line, "cannot compare values of differing types"))
            })?;
            if (take_min && ordering.is_lt()) || (!take_min && ordering.is_gt()) {
                best = candidate.clone();
            }
        }
        Ok(best)
    }

    fn builtin_sum(&self, args: &[Value], line: usize) -> ExecResult<Value> {
        let items = match args.first() {
            Some(Value::List(items)) => items.borrow().clone(),
            _ => return Err(self.runtime(line, "sum requires a list").into()),
        };
        let mut int_total: i64 = 0;
        let mut float_total: f64 = 0.0;
        let mut saw_float = false;
        for item in &items {
            match item {
                Value::Int(i) => int_total = int_total.wrapping_add(*i),
                Value::Float(f) => {
                    saw_float = true;
                    float_total += f;
                }
                other => {
                    return Err(self
                        .runtime(line, format!("sum requires numbers, got {}", other.type_name()))
                        .into())
                }
            }
        }
        if saw_float {
            Ok(Value::Float(float_total + int_total as f64))
        } else {
            Ok(Value::Int(int_total))
        }
    }

    fn builtin_sorted(&self, args: &[Value], line: usize) -> ExecResult<Value> {
        let mut items = match args.first() {
            Some(Value::List(items)) => items.borrow().clone(),
            Some(Value::Str(s)) => s.chars().map(|c| Value::str(c.to_string())).collect(),
            _ => return Err(self.runtime(line, "sorted requires a list or string").into()),
        };
        let mut failed = false;
        items.sort_by(|a, b| {
            compare_values(a, b).unwrap_or_else(|| {
                failed = true;
                std::cmp::Ordering::Equal
            })
        });
        if failed {
            return Err(self
                .runtime(line, "cannot sort values of differing types")
                .into());
        }
        Ok(Value::list(items))
    }

    fn builtin_int(&self, args: &[Value], line: usize) -> ExecResult<Value> {
        match args.first() {
            Some(Value::Int(i)) => Ok(Value::Int(*i)),
            Some(Value::Float(f)) => Ok(Value::Int(*f as i64)),
            Some(Value::Bool(b)) => Ok(Value::Int(*b as i64)),
            Some(Value::Str(s)) => s.trim().parse::<i64>().map(Value::Int).map_err(|_| {
                Signal::from(self.runtime(line, format!("invalid int literal: '{}'", s)))
            }),
            Some(other) => Err(self
                .runtime(line, format!("cannot convert {} to int", other.type_name()))
                .into()),
            None => Ok(Value::Int(0)),
        }
    }

    fn builtin_float(&self, args: &[Value], line: usize) -> ExecResult<Value> {
        match args.first() {
            Some(Value::Int(i)) => Ok(Value::Float(*i as f64)),
            Some(Value::Float(f)) => Ok(Value::Float(*f)),
            Some(Value::Bool(b)) => Ok(Value::Float(*b as i64 as f64)),
            Some(Value::Str(s)) => s.trim().parse::<f64>().map(Value::Float).map_err(|_| {
                Signal::from(self.runtime(line, format!("invalid float literal: '{}'", s)))
            }),
            Some(other) => Err(self
                .runtime(line, format!("cannot convert {} to float", other.type_name()))
                .into()),
            None => Ok(Value::Float(0.0)),
        }
    }

    fn builtin_list(&self, args: &[Value], line: usize) -> ExecResult<Value> {
        match args.first() {
            None => Ok(Value::list(Vec::new())),
            Some(Value::List(items)) => Ok(Value::list(items.borrow().clone())),
            Some(Value::Str(s)) => Ok(Value::list(
                s.chars().map(|c| Value::str(c.to_string())).collect(),
            )),
            Some(Value::Dict(entries)) => Ok(Value::list(
                entries.borrow().keys().map(Value::str).collect(),
            )),
            Some(other) => Err(self
                .runtime(line, format!("cannot convert {} to list", other.type_name()))
                .into()),
        }
    }

    fn builtin_dict(&self, args: &[Value], line: usize) -> ExecResult<Value> {
        match args.first() {
            None => Ok(Value::dict(BTreeMap::new())),
            Some(Value::Dict(entries)) => Ok(Value::dict(entries.borrow().clone())),
            Some(other) => Err(self
                .runtime(line, format!("cannot convert {} to dict", other.type_name()))
                .into()),
        }
    }
}

fn op_symbol(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "+",
        BinOp::Sub => "-",
        BinOp::Mul => "*",
        BinOp::Div => "/",
        BinOp::FloorDiv => "//",
        BinOp::Mod => "%",
    }
}
