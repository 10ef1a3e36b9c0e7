//! Tree-walking evaluator.
//!
//! Single-threaded cooperative: every host call is an await point, and the
//! wall-clock budget is checked at statement and loop boundaries.

use std::collections::HashMap;
use std::time::Instant;

use futures_util::future::BoxFuture;

use crate::apis::ScriptHost;
use crate::ast::*;
use crate::error::{Result, ScriptError};
use crate::value::{ScriptFunction, ScriptValue};

/// Hard cap on user-function call depth.
const MAX_CALL_DEPTH: usize = 64;
/// Cap on range() materialization.
const MAX_RANGE: i64 = 1_000_000;
/// Budget check cadence (cheap ops between clock reads).
const OPS_PER_CLOCK_CHECK: u64 = 1024;

pub struct Interpreter<'h> {
    host: &'h dyn ScriptHost,
    deadline: Instant,
    timeout_secs: u64,
    ops: u64,
    call_depth: usize,
}

/// Name scopes: module globals plus one local frame per active call.
pub struct Env {
    pub globals: HashMap<String, ScriptValue>,
    locals: Vec<HashMap<String, ScriptValue>>,
}

impl Env {
    pub fn new(globals: HashMap<String, ScriptValue>) -> Self {
        Self {
            globals,
            locals: Vec::new(),
        }
    }

    fn lookup(&self, name: &str) -> Option<&ScriptValue> {
        if let Some(frame) = self.locals.last() {
            if let Some(v) = frame.get(name) {
                return Some(v);
            }
        }
        self.globals.get(name)
    }

    fn assign(&mut self, name: &str, value: ScriptValue) {
        if let Some(frame) = self.locals.last_mut() {
            frame.insert(name.to_string(), value);
        } else {
            self.globals.insert(name.to_string(), value);
        }
    }
}

/// How a statement sequence finished.
enum Flow {
    Normal,
    Break,
    Continue,
    Return(ScriptValue),
}

impl<'h> Interpreter<'h> {
    pub fn new(host: &'h dyn ScriptHost, timeout_secs: u64) -> Self {
        Self {
            host,
            deadline: Instant::now() + std::time::Duration::from_secs(timeout_secs),
            timeout_secs,
            ops: 0,
            call_depth: 0,
        }
    }

    /// Run a program. The value of the last top-level expression statement
    /// is the script's return value.
    pub async fn run(&mut self, program: &Program, env: &mut Env) -> Result<ScriptValue> {
        let mut last = ScriptValue::None;
        for stmt in &program.body {
            if let Stmt::Expr { expr, .. } = stmt {
                last = self.eval(expr, env).await?;
            } else {
                match self.exec_stmt(stmt, env).await? {
                    Flow::Normal => {}
                    // parser rejects return/break/continue at top level
                    _ => unreachable!("control flow escaped a function body"),
                }
            }
        }
        Ok(last)
    }

    fn check_budget(&mut self) -> Result<()> {
        self.ops += 1;
        if self.ops % OPS_PER_CLOCK_CHECK == 0 && Instant::now() >= self.deadline {
            return Err(ScriptError::Timeout {
                seconds: self.timeout_secs,
            });
        }
        Ok(())
    }

    /// Forced clock read, used at loop boundaries where a slow host call
    /// may have consumed the budget since the last sampled check.
    fn check_deadline(&self) -> Result<()> {
        if Instant::now() >= self.deadline {
            return Err(ScriptError::Timeout {
                seconds: self.timeout_secs,
            });
        }
        Ok(())
    }

    fn exec_stmt<'a>(
        &'a mut self,
        stmt: &'a Stmt,
        env: &'a mut Env,
    ) -> BoxFuture<'a, Result<Flow>> {
        Box::pin(async move {
            self.check_budget()?;
            match stmt {
                Stmt::Pass => Ok(Flow::Normal),
                Stmt::Expr { expr, .. } => {
                    self.eval(expr, env).await?;
                    Ok(Flow::Normal)
                }
                Stmt::Assign {
                    target,
                    augmented,
                    value,
                    line,
                } => {
                    let rhs = self.eval(value, env).await?;
                    match target {
                        AssignTarget::Name(name) => {
                            let new = if *augmented {
                                let current = env.lookup(name).cloned().ok_or_else(|| {
                                    ScriptError::exec(format!(
                                        "line {line}: name '{name}' is not defined"
                                    ))
                                })?;
                                binary_op(BinOp::Add, &current, &rhs)?
                            } else {
                                rhs
                            };
                            env.assign(name, new);
                        }
                        AssignTarget::Index { object, index } => {
                            let idx = self.eval(index, env).await?;
                            let rhs = if *augmented {
                                let container = self.eval(object, env).await?;
                                let current = index_value(&container, &idx)?;
                                binary_op(BinOp::Add, &current, &rhs)?
                            } else {
                                rhs
                            };
                            self.assign_into(object, idx, rhs, env).await?;
                        }
                    }
                    Ok(Flow::Normal)
                }
                Stmt::Def {
                    name,
                    params,
                    body,
                    ..
                } => {
                    env.assign(
                        name,
                        ScriptValue::Function(ScriptFunction {
                            name: name.clone(),
                            params: params.clone(),
                            body: body.clone(),
                        }),
                    );
                    Ok(Flow::Normal)
                }
                Stmt::Return { value, .. } => {
                    let v = match value {
                        Some(expr) => self.eval(expr, env).await?,
                        None => ScriptValue::None,
                    };
                    Ok(Flow::Return(v))
                }
                Stmt::Break { .. } => Ok(Flow::Break),
                Stmt::Continue { .. } => Ok(Flow::Continue),
                Stmt::If {
                    branches,
                    else_body,
                    ..
                } => {
                    for (condition, body) in branches {
                        if self.eval(condition, env).await?.truthy() {
                            return self.exec_block(body, env).await;
                        }
                    }
                    if let Some(body) = else_body {
                        return self.exec_block(body, env).await;
                    }
                    Ok(Flow::Normal)
                }
                Stmt::For {
                    var,
                    iterable,
                    body,
                    line,
                } => {
                    let items = match self.eval(iterable, env).await? {
                        ScriptValue::List(items) => items,
                        ScriptValue::Str(s) => s
                            .chars()
                            .map(|c| ScriptValue::Str(c.to_string()))
                            .collect(),
                        ScriptValue::Dict(entries) => entries
                            .into_iter()
                            .map(|(k, _)| ScriptValue::Str(k))
                            .collect(),
                        other => {
                            return Err(ScriptError::exec(format!(
                                "line {line}: cannot iterate over {}",
                                other.type_name()
                            )))
                        }
                    };
                    for item in items {
                        self.check_deadline()?;
                        env.assign(var, item);
                        match self.exec_block(body, env).await? {
                            Flow::Normal | Flow::Continue => {}
                            Flow::Break => break,
                            ret @ Flow::Return(_) => return Ok(ret),
                        }
                    }
                    Ok(Flow::Normal)
                }
            }
        })
    }

    async fn exec_block(&mut self, body: &[Stmt], env: &mut Env) -> Result<Flow> {
        for stmt in body {
            match self.exec_stmt(stmt, env).await? {
                Flow::Normal => {}
                other => return Ok(other),
            }
        }
        Ok(Flow::Normal)
    }

    /// `obj[idx] = value` where obj must resolve to a name holding a
    /// list/dict (nested index targets resolve recursively).
    fn assign_into<'a>(
        &'a mut self,
        object: &'a Expr,
        idx: ScriptValue,
        value: ScriptValue,
        env: &'a mut Env,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            match object {
                Expr::Name(name) => {
                    let mut container = env.lookup(name).cloned().ok_or_else(|| {
                        ScriptError::exec(format!("name '{name}' is not defined"))
                    })?;
                    set_index(&mut container, &idx, value)?;
                    env.assign(name, container);
                    Ok(())
                }
                Expr::Index {
                    object: inner,
                    index,
                } => {
                    // Rebuild the inner container with the mutation applied.
                    let inner_idx = self.eval(index, env).await?;
                    let outer = self.eval(inner, env).await?;
                    let mut container = index_value(&outer, &inner_idx)?;
                    set_index(&mut container, &idx, value)?;
                    self.assign_into(inner, inner_idx, container, env).await
                }
                _ => Err(ScriptError::exec(
                    "index assignment target must be a variable",
                )),
            }
        })
    }

    pub fn eval<'a>(
        &'a mut self,
        expr: &'a Expr,
        env: &'a mut Env,
    ) -> BoxFuture<'a, Result<ScriptValue>> {
        Box::pin(async move {
            self.check_budget()?;
            match expr {
                Expr::None => Ok(ScriptValue::None),
                Expr::Bool(b) => Ok(ScriptValue::Bool(*b)),
                Expr::Int(n) => Ok(ScriptValue::Int(*n)),
                Expr::Float(f) => Ok(ScriptValue::Float(*f)),
                Expr::Str(s) => Ok(ScriptValue::Str(s.clone())),
                Expr::Name(name) => env.lookup(name).cloned().ok_or_else(|| {
                    ScriptError::exec(format!("name '{name}' is not defined"))
                }),
                Expr::List(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        out.push(self.eval(item, env).await?);
                    }
                    Ok(ScriptValue::List(out))
                }
                Expr::Dict(entries) => {
                    let mut out: Vec<(String, ScriptValue)> = Vec::with_capacity(entries.len());
                    for (key_expr, value_expr) in entries {
                        let key = match self.eval(key_expr, env).await? {
                            ScriptValue::Str(s) => s,
                            other => {
                                return Err(ScriptError::exec(format!(
                                    "dict keys must be strings, got {}",
                                    other.type_name()
                                )))
                            }
                        };
                        let value = self.eval(value_expr, env).await?;
                        if let Some(slot) = out.iter_mut().find(|(k, _)| *k == key) {
                            slot.1 = value;
                        } else {
                            out.push((key, value));
                        }
                    }
                    Ok(ScriptValue::Dict(out))
                }
                Expr::Unary { op, operand } => {
                    let v = self.eval(operand, env).await?;
                    match op {
                        UnaryOp::Not => Ok(ScriptValue::Bool(!v.truthy())),
                        UnaryOp::Neg => match v {
                            ScriptValue::Int(n) => Ok(ScriptValue::Int(-n)),
                            ScriptValue::Float(f) => Ok(ScriptValue::Float(-f)),
                            other => Err(ScriptError::exec(format!(
                                "cannot negate {}",
                                other.type_name()
                            ))),
                        },
                    }
                }
                Expr::Binary { op, left, right } => {
                    let l = self.eval(left, env).await?;
                    let r = self.eval(right, env).await?;
                    binary_op(*op, &l, &r)
                }
                Expr::Compare { op, left, right } => {
                    let l = self.eval(left, env).await?;
                    let r = self.eval(right, env).await?;
                    compare_op(*op, &l, &r)
                }
                Expr::BoolOp { op, left, right } => {
                    let l = self.eval(left, env).await?;
                    match op {
                        BoolOp::And => {
                            if !l.truthy() {
                                Ok(l)
                            } else {
                                self.eval(right, env).await
                            }
                        }
                        BoolOp::Or => {
                            if l.truthy() {
                                Ok(l)
                            } else {
                                self.eval(right, env).await
                            }
                        }
                    }
                }
                Expr::Conditional {
                    condition,
                    then,
                    otherwise,
                } => {
                    if self.eval(condition, env).await?.truthy() {
                        self.eval(then, env).await
                    } else {
                        self.eval(otherwise, env).await
                    }
                }
                Expr::Index { object, index } => {
                    let container = self.eval(object, env).await?;
                    let idx = self.eval(index, env).await?;
                    index_value(&container, &idx)
                }
                Expr::Call {
                    func,
                    args,
                    kwargs,
                    line,
                } => {
                    let mut arg_values = Vec::with_capacity(args.len());
                    for arg in args {
                        arg_values.push(self.eval(arg, env).await?);
                    }
                    let mut kwarg_values = Vec::with_capacity(kwargs.len());
                    for (name, expr) in kwargs {
                        kwarg_values.push((name.clone(), self.eval(expr, env).await?));
                    }
                    self.call(func, arg_values, kwarg_values, env, *line).await
                }
            }
        })
    }

    async fn call(
        &mut self,
        func: &str,
        args: Vec<ScriptValue>,
        kwargs: Vec<(String, ScriptValue)>,
        env: &mut Env,
        line: usize,
    ) -> Result<ScriptValue> {
        // 1. User-defined functions shadow everything.
        if let Some(ScriptValue::Function(function)) = env.lookup(func).cloned() {
            return self.call_function(&function, args, kwargs, env, line).await;
        }

        // 2. Pure builtins.
        if let Some(result) = self.call_builtin(func, &args, &kwargs)? {
            return Ok(result);
        }

        // 3. Sandbox APIs (tools_*, attachment_get, wake_llm) and direct
        //    tool-name sugar — all routed through the host, which enforces
        //    the allow/deny policy.
        self.host
            .call(func, args, kwargs)
            .await?
            .ok_or_else(|| ScriptError::exec(format!("line {line}: name '{func}' is not defined")))
    }

    async fn call_function(
        &mut self,
        function: &ScriptFunction,
        args: Vec<ScriptValue>,
        kwargs: Vec<(String, ScriptValue)>,
        env: &mut Env,
        line: usize,
    ) -> Result<ScriptValue> {
        if self.call_depth >= MAX_CALL_DEPTH {
            return Err(ScriptError::exec(format!(
                "line {line}: maximum call depth ({MAX_CALL_DEPTH}) exceeded"
            )));
        }
        if args.len() > function.params.len() {
            return Err(ScriptError::exec(format!(
                "line {line}: {}() takes at most {} arguments, got {}",
                function.name,
                function.params.len(),
                args.len()
            )));
        }

        let mut frame: HashMap<String, ScriptValue> = HashMap::new();
        let mut args_iter = args.into_iter();
        for param in &function.params {
            if let Some(value) = args_iter.next() {
                frame.insert(param.name.clone(), value);
            }
        }
        for (name, value) in kwargs {
            if !function.params.iter().any(|p| p.name == name) {
                return Err(ScriptError::exec(format!(
                    "line {line}: {}() got an unexpected keyword argument '{name}'",
                    function.name
                )));
            }
            frame.insert(name, value);
        }
        // Defaults for anything still unbound.
        let unbound: Vec<Param> = function
            .params
            .iter()
            .filter(|p| !frame.contains_key(&p.name))
            .cloned()
            .collect();
        for param in unbound {
            match &param.default {
                Some(default) => {
                    let value = self.eval(default, env).await?;
                    frame.insert(param.name.clone(), value);
                }
                None => {
                    return Err(ScriptError::exec(format!(
                        "line {line}: {}() missing required argument '{}'",
                        function.name, param.name
                    )))
                }
            }
        }

        env.locals.push(frame);
        self.call_depth += 1;
        let result = self.exec_block(&function.body, env).await;
        self.call_depth -= 1;
        env.locals.pop();

        match result? {
            Flow::Return(v) => Ok(v),
            _ => Ok(ScriptValue::None),
        }
    }

    /// Pure builtins. Returns `Ok(None)` when `name` is not a builtin.
    fn call_builtin(
        &mut self,
        name: &str,
        args: &[ScriptValue],
        kwargs: &[(String, ScriptValue)],
    ) -> Result<Option<ScriptValue>> {
        if !kwargs.is_empty() && BUILTINS.contains(&name) {
            return Err(ScriptError::exec(format!(
                "{name}() does not accept keyword arguments"
            )));
        }

        let one = |args: &[ScriptValue]| -> Result<ScriptValue> {
            if args.len() != 1 {
                return Err(ScriptError::exec(format!(
                    "{name}() takes exactly one argument"
                )));
            }
            Ok(args[0].clone())
        };

        let value = match name {
            "len" => {
                let v = one(args)?;
                let n = match &v {
                    ScriptValue::Str(s) => s.chars().count(),
                    ScriptValue::List(items) => items.len(),
                    ScriptValue::Dict(entries) => entries.len(),
                    other => {
                        return Err(ScriptError::exec(format!(
                            "len() of {}",
                            other.type_name()
                        )))
                    }
                };
                ScriptValue::Int(n as i64)
            }
            "bool" => ScriptValue::Bool(one(args)?.truthy()),
            "int" => match one(args)? {
                ScriptValue::Int(n) => ScriptValue::Int(n),
                ScriptValue::Float(f) => ScriptValue::Int(f.trunc() as i64),
                ScriptValue::Bool(b) => ScriptValue::Int(b as i64),
                ScriptValue::Str(s) => ScriptValue::Int(
                    s.trim()
                        .parse()
                        .map_err(|_| ScriptError::exec(format!("invalid int literal: {s:?}")))?,
                ),
                other => {
                    return Err(ScriptError::exec(format!(
                        "int() of {}",
                        other.type_name()
                    )))
                }
            },
            "float" => match one(args)? {
                ScriptValue::Int(n) => ScriptValue::Float(n as f64),
                ScriptValue::Float(f) => ScriptValue::Float(f),
                ScriptValue::Str(s) => ScriptValue::Float(
                    s.trim()
                        .parse()
                        .map_err(|_| ScriptError::exec(format!("invalid float literal: {s:?}")))?,
                ),
                other => {
                    return Err(ScriptError::exec(format!(
                        "float() of {}",
                        other.type_name()
                    )))
                }
            },
            "str" => ScriptValue::Str(one(args)?.to_display_string()),
            "list" => match one(args)? {
                ScriptValue::List(items) => ScriptValue::List(items),
                ScriptValue::Str(s) => ScriptValue::List(
                    s.chars().map(|c| ScriptValue::Str(c.to_string())).collect(),
                ),
                ScriptValue::Dict(entries) => ScriptValue::List(
                    entries.into_iter().map(|(k, _)| ScriptValue::Str(k)).collect(),
                ),
                other => {
                    return Err(ScriptError::exec(format!(
                        "list() of {}",
                        other.type_name()
                    )))
                }
            },
            "dict" => match args.len() {
                0 => ScriptValue::Dict(Vec::new()),
                _ => match one(args)? {
                    ScriptValue::Dict(entries) => ScriptValue::Dict(entries),
                    other => {
                        return Err(ScriptError::exec(format!(
                            "dict() of {}",
                            other.type_name()
                        )))
                    }
                },
            },
            "type" => ScriptValue::Str(one(args)?.type_name().to_string()),
            "range" => {
                let (start, stop, step) = match args {
                    [ScriptValue::Int(stop)] => (0, *stop, 1),
                    [ScriptValue::Int(start), ScriptValue::Int(stop)] => (*start, *stop, 1),
                    [ScriptValue::Int(start), ScriptValue::Int(stop), ScriptValue::Int(step)] => {
                        (*start, *stop, *step)
                    }
                    _ => return Err(ScriptError::exec("range() takes 1-3 integer arguments")),
                };
                if step == 0 {
                    return Err(ScriptError::exec("range() step cannot be zero"));
                }
                let mut items = Vec::new();
                let mut i = start;
                while (step > 0 && i < stop) || (step < 0 && i > stop) {
                    items.push(ScriptValue::Int(i));
                    if items.len() as i64 > MAX_RANGE {
                        return Err(ScriptError::exec("range() result too large"));
                    }
                    i += step;
                }
                ScriptValue::List(items)
            }
            "sorted" => {
                let ScriptValue::List(mut items) = one(args)? else {
                    return Err(ScriptError::exec("sorted() takes a list"));
                };
                let mut error = None;
                items.sort_by(|a, b| match a.compare(b) {
                    Ok(ordering) => ordering,
                    Err(e) => {
                        error.get_or_insert(e);
                        std::cmp::Ordering::Equal
                    }
                });
                if let Some(e) = error {
                    return Err(e);
                }
                ScriptValue::List(items)
            }
            "reversed" => {
                let ScriptValue::List(mut items) = one(args)? else {
                    return Err(ScriptError::exec("reversed() takes a list"));
                };
                items.reverse();
                ScriptValue::List(items)
            }
            "enumerate" => {
                let ScriptValue::List(items) = one(args)? else {
                    return Err(ScriptError::exec("enumerate() takes a list"));
                };
                ScriptValue::List(
                    items
                        .into_iter()
                        .enumerate()
                        .map(|(i, v)| ScriptValue::List(vec![ScriptValue::Int(i as i64), v]))
                        .collect(),
                )
            }
            "zip" => {
                let lists: Vec<&Vec<ScriptValue>> = args
                    .iter()
                    .map(|a| match a {
                        ScriptValue::List(items) => Ok(items),
                        other => Err(ScriptError::exec(format!(
                            "zip() arguments must be lists, got {}",
                            other.type_name()
                        ))),
                    })
                    .collect::<Result<_>>()?;
                let shortest = lists.iter().map(|l| l.len()).min().unwrap_or(0);
                ScriptValue::List(
                    (0..shortest)
                        .map(|i| {
                            ScriptValue::List(lists.iter().map(|l| l[i].clone()).collect())
                        })
                        .collect(),
                )
            }
            "all" => {
                let ScriptValue::List(items) = one(args)? else {
                    return Err(ScriptError::exec("all() takes a list"));
                };
                ScriptValue::Bool(items.iter().all(|v| v.truthy()))
            }
            "any" => {
                let ScriptValue::List(items) = one(args)? else {
                    return Err(ScriptError::exec("any() takes a list"));
                };
                ScriptValue::Bool(items.iter().any(|v| v.truthy()))
            }
            "max" | "min" => {
                let items: Vec<ScriptValue> = match args {
                    [ScriptValue::List(items)] => items.clone(),
                    [] => return Err(ScriptError::exec(format!("{name}() needs arguments"))),
                    _ => args.to_vec(),
                };
                if items.is_empty() {
                    return Err(ScriptError::exec(format!("{name}() of empty sequence")));
                }
                let mut best = items[0].clone();
                for item in &items[1..] {
                    let ordering = item.compare(&best)?;
                    let better = if name == "max" {
                        ordering == std::cmp::Ordering::Greater
                    } else {
                        ordering == std::cmp::Ordering::Less
                    };
                    if better {
                        best = item.clone();
                    }
                }
                best
            }
            "json_encode" => {
                let json = one(args)?.to_json()?;
                ScriptValue::Str(serde_json::to_string(&json).map_err(|e| {
                    ScriptError::exec(format!("json_encode failed: {e}"))
                })?)
            }
            "json_decode" => {
                let ScriptValue::Str(s) = one(args)? else {
                    return Err(ScriptError::exec("json_decode() takes a string"));
                };
                let json: serde_json::Value = serde_json::from_str(&s)
                    .map_err(|e| ScriptError::exec(format!("json_decode failed: {e}")))?;
                ScriptValue::from_json(&json)
            }
            "print" => {
                let text = args
                    .iter()
                    .map(|v| v.to_display_string())
                    .collect::<Vec<_>>()
                    .join(" ");
                self.host.print(&text);
                ScriptValue::None
            }
            "fail" => {
                let message = args
                    .iter()
                    .map(|v| v.to_display_string())
                    .collect::<Vec<_>>()
                    .join(" ");
                return Err(ScriptError::exec(if message.is_empty() {
                    "fail() called".to_string()
                } else {
                    message
                }));
            }
            _ => return Ok(None),
        };
        Ok(Some(value))
    }
}

const BUILTINS: &[&str] = &[
    "len", "bool", "int", "float", "str", "list", "dict", "type", "range", "sorted",
    "reversed", "enumerate", "zip", "all", "any", "max", "min", "json_encode",
    "json_decode", "print", "fail",
];

fn binary_op(op: BinOp, l: &ScriptValue, r: &ScriptValue) -> Result<ScriptValue> {
    use ScriptValue::*;
    let type_err = || {
        ScriptError::exec(format!(
            "unsupported operand types: {} {:?} {}",
            l.type_name(),
            op,
            r.type_name()
        ))
    };

    Ok(match (op, l, r) {
        (BinOp::Add, Int(a), Int(b)) => {
            Int(a.checked_add(*b).ok_or_else(|| ScriptError::exec("integer overflow"))?)
        }
        (BinOp::Add, Str(a), Str(b)) => Str(format!("{a}{b}")),
        (BinOp::Add, List(a), List(b)) => {
            let mut out = a.clone();
            out.extend(b.iter().cloned());
            List(out)
        }
        (BinOp::Sub, Int(a), Int(b)) => {
            Int(a.checked_sub(*b).ok_or_else(|| ScriptError::exec("integer overflow"))?)
        }
        (BinOp::Mul, Int(a), Int(b)) => {
            Int(a.checked_mul(*b).ok_or_else(|| ScriptError::exec("integer overflow"))?)
        }
        (BinOp::Mul, Str(s), Int(n)) | (BinOp::Mul, Int(n), Str(s)) => {
            if *n < 0 || *n > 100_000 {
                return Err(ScriptError::exec("string repetition count out of range"));
            }
            Str(s.repeat(*n as usize))
        }
        (BinOp::Div, _, _) => {
            let (a, b) = (as_float(l).ok_or_else(type_err)?, as_float(r).ok_or_else(type_err)?);
            if b == 0.0 {
                return Err(ScriptError::exec("division by zero"));
            }
            Float(a / b)
        }
        (BinOp::FloorDiv, Int(a), Int(b)) => {
            if *b == 0 {
                return Err(ScriptError::exec("integer division by zero"));
            }
            // Floor toward negative infinity — Rust's `/` truncates toward
            // zero, which disagrees with the dialect's `//` whenever the
            // operand signs differ (7 // -2 must be -4, not -3).
            let q = a
                .checked_div(*b)
                .ok_or_else(|| ScriptError::exec("integer overflow"))?;
            let r = a % b;
            Int(if r != 0 && (r < 0) != (*b < 0) { q - 1 } else { q })
        }
        (BinOp::FloorDiv, _, _) => {
            let (a, b) = (as_float(l).ok_or_else(type_err)?, as_float(r).ok_or_else(type_err)?);
            if b == 0.0 {
                return Err(ScriptError::exec("division by zero"));
            }
            Float((a / b).floor())
        }
        (BinOp::Mod, Int(a), Int(b)) => {
            if *b == 0 {
                return Err(ScriptError::exec("modulo by zero"));
            }
            // Result takes the divisor's sign (5 % -3 is -1, -5 % 3 is 1).
            let r = a
                .checked_rem(*b)
                .ok_or_else(|| ScriptError::exec("integer overflow"))?;
            Int(if r != 0 && (r < 0) != (*b < 0) { r + b } else { r })
        }
        (BinOp::Pow, Int(a), Int(b)) if *b >= 0 => {
            let exp = u32::try_from(*b)
                .map_err(|_| ScriptError::exec("exponent too large"))?;
            Int(a.checked_pow(exp).ok_or_else(|| ScriptError::exec("integer overflow"))?)
        }
        // Mixed / float arithmetic.
        (BinOp::Add, _, _) | (BinOp::Sub, _, _) | (BinOp::Mul, _, _) | (BinOp::Mod, _, _)
        | (BinOp::Pow, _, _) => {
            let (a, b) = (as_float(l).ok_or_else(type_err)?, as_float(r).ok_or_else(type_err)?);
            match op {
                BinOp::Add => Float(a + b),
                BinOp::Sub => Float(a - b),
                BinOp::Mul => Float(a * b),
                BinOp::Mod => {
                    if b == 0.0 {
                        return Err(ScriptError::exec("modulo by zero"));
                    }
                    // Same divisor-sign rule as the integer arm.
                    let r = a % b;
                    Float(if r != 0.0 && (r < 0.0) != (b < 0.0) { r + b } else { r })
                }
                BinOp::Pow => Float(a.powf(b)),
                _ => unreachable!(),
            }
        }
    })
}

fn as_float(v: &ScriptValue) -> Option<f64> {
    match v {
        ScriptValue::Int(n) => Some(*n as f64),
        ScriptValue::Float(f) => Some(*f),
        _ => None,
    }
}

fn compare_op(op: CmpOp, l: &ScriptValue, r: &ScriptValue) -> Result<ScriptValue> {
    let result = match op {
        CmpOp::Eq => l.eq_value(r),
        CmpOp::NotEq => !l.eq_value(r),
        CmpOp::Lt => l.compare(r)? == std::cmp::Ordering::Less,
        CmpOp::LtEq => l.compare(r)? != std::cmp::Ordering::Greater,
        CmpOp::Gt => l.compare(r)? == std::cmp::Ordering::Greater,
        CmpOp::GtEq => l.compare(r)? != std::cmp::Ordering::Less,
        CmpOp::In | CmpOp::NotIn => {
            let contains = match r {
                ScriptValue::List(items) => items.iter().any(|item| item.eq_value(l)),
                ScriptValue::Dict(entries) => match l {
                    ScriptValue::Str(key) => entries.iter().any(|(k, _)| k == key),
                    _ => false,
                },
                ScriptValue::Str(haystack) => match l {
                    ScriptValue::Str(needle) => haystack.contains(needle.as_str()),
                    _ => {
                        return Err(ScriptError::exec(
                            "'in <string>' requires a string operand",
                        ))
                    }
                },
                other => {
                    return Err(ScriptError::exec(format!(
                        "'in' not supported for {}",
                        other.type_name()
                    )))
                }
            };
            if op == CmpOp::In {
                contains
            } else {
                !contains
            }
        }
    };
    Ok(ScriptValue::Bool(result))
}

fn index_value(container: &ScriptValue, idx: &ScriptValue) -> Result<ScriptValue> {
    match (container, idx) {
        (ScriptValue::List(items), ScriptValue::Int(i)) => {
            let index = normalize_index(*i, items.len())?;
            Ok(items[index].clone())
        }
        (ScriptValue::Str(s), ScriptValue::Int(i)) => {
            let chars: Vec<char> = s.chars().collect();
            let index = normalize_index(*i, chars.len())?;
            Ok(ScriptValue::Str(chars[index].to_string()))
        }
        (ScriptValue::Dict(entries), ScriptValue::Str(key)) => entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| ScriptError::exec(format!("key not found: {key:?}"))),
        (container, idx) => Err(ScriptError::exec(format!(
            "cannot index {} with {}",
            container.type_name(),
            idx.type_name()
        ))),
    }
}

fn set_index(container: &mut ScriptValue, idx: &ScriptValue, value: ScriptValue) -> Result<()> {
    match (container, idx) {
        (ScriptValue::List(items), ScriptValue::Int(i)) => {
            let index = normalize_index(*i, items.len())?;
            items[index] = value;
            Ok(())
        }
        (ScriptValue::Dict(entries), ScriptValue::Str(key)) => {
            if let Some(slot) = entries.iter_mut().find(|(k, _)| k == key) {
                slot.1 = value;
            } else {
                entries.push((key.clone(), value));
            }
            Ok(())
        }
        (container, idx) => Err(ScriptError::exec(format!(
            "cannot assign into {} with {} index",
            container.type_name(),
            idx.type_name()
        ))),
    }
}

fn normalize_index(i: i64, len: usize) -> Result<usize> {
    let idx = if i < 0 { i + len as i64 } else { i };
    if idx < 0 || idx as usize >= len {
        return Err(ScriptError::exec(format!(
            "index {i} out of range for length {len}"
        )));
    }
    Ok(idx as usize)
}
