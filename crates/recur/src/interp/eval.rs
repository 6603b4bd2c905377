use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use super::{ALLOWED_MODULES, ExecError};
use super::ast::*;
use super::modules;
use super::parser::parse;
use super::value::{Key, Value};

/// Budgets enforced while code runs. The deadline is cooperative (checked
/// between operations); the `cancel` flag lets the sandbox stop a detached
/// worker after a hard timeout fires.
#[derive(Clone)]
pub struct Limits {
    pub deadline: Instant,
    pub timeout_ms: u64,
    pub cancel: Arc<AtomicBool>,
    pub memory_cap: u64,
    pub output_cap_bytes: usize,
    pub output_cap_lines: usize,
}

/// Everything one execution produced, including the final variable
/// bindings for session persistence.
pub struct RunOutcome {
    pub stdout: String,
    pub truncated: bool,
    pub error: Option<ExecError>,
    pub vars: BTreeMap<String, Value>,
    pub memory_peak: u64,
}

/// Run a code fragment against a variable snapshot. Parse and import
/// screening happen before any statement executes.
pub fn run(code: &str, globals: BTreeMap<String, Value>, limits: Limits) -> RunOutcome {
    let base_bytes: u64 = globals.values().map(|v| v.approx_bytes()).sum();
    let mut interp = Interp {
        globals,
        locals: Vec::new(),
        out: String::new(),
        out_lines: 0,
        truncated: false,
        ops: 0,
        alloc_bytes: base_bytes,
        call_depth: 0,
        limits,
    };

    let stmts = match parse(code) {
        Ok(stmts) => stmts,
        Err(err) => return interp.into_outcome(Some(err)),
    };
    if let Err(err) = screen_imports(&stmts) {
        return interp.into_outcome(Some(err));
    }

    let mut error = None;
    for stmt in &stmts {
        match interp.exec_stmt(stmt) {
            Ok(Flow::Normal) => {}
            Ok(Flow::Return(_)) | Ok(Flow::Break) | Ok(Flow::Continue) => {
                error = Some(ExecError::Runtime(
                    "SyntaxError: control-flow statement outside loop or function".into(),
                ));
                break;
            }
            Err(err) => {
                error = Some(err);
                break;
            }
        }
    }
    interp.into_outcome(error)
}

/// Walk every statement (including nested blocks) and reject any import
/// outside the allowlist before execution begins.
fn screen_imports(stmts: &[Stmt]) -> Result<(), ExecError> {
    for stmt in stmts {
        match stmt {
            Stmt::Import { module, .. } => {
                if !ALLOWED_MODULES.contains(&module.as_str()) {
                    return Err(ExecError::Security {
                        module: Some(module.clone()),
                        operation: None,
                    });
                }
            }
            Stmt::If {
                branches,
                else_body,
            } => {
                for (_, body) in branches {
                    screen_imports(body)?;
                }
                screen_imports(else_body)?;
            }
            Stmt::While { body, .. } | Stmt::For { body, .. } => screen_imports(body)?,
            Stmt::Def(def) => screen_imports(&def.body)?,
            _ => {}
        }
    }
    Ok(())
}

enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

const MAX_CALL_DEPTH: usize = 64;
const TICK_MASK: u64 = 0x3F;

pub struct Interp {
    globals: BTreeMap<String, Value>,
    locals: Vec<BTreeMap<String, Value>>,
    out: String,
    out_lines: usize,
    truncated: bool,
    ops: u64,
    alloc_bytes: u64,
    call_depth: usize,
    limits: Limits,
}

impl Interp {
    fn into_outcome(self, error: Option<ExecError>) -> RunOutcome {
        RunOutcome {
            stdout: self.out,
            truncated: self.truncated,
            error,
            vars: self.globals,
            memory_peak: self.alloc_bytes,
        }
    }

    /// One accounting tick. Deadline and cancellation are checked every 64
    /// ops to keep the clock read off the hot path.
    fn tick(&mut self) -> Result<(), ExecError> {
        self.ops += 1;
        if self.ops & TICK_MASK == 0
            && (self.limits.cancel.load(Ordering::Relaxed)
                || Instant::now() >= self.limits.deadline)
        {
            return Err(ExecError::Timeout {
                timeout_ms: self.limits.timeout_ms,
            });
        }
        Ok(())
    }

    fn charge(&mut self, bytes: u64) -> Result<(), ExecError> {
        self.alloc_bytes = self.alloc_bytes.saturating_add(bytes);
        if self.alloc_bytes > self.limits.memory_cap {
            return Err(ExecError::ResourceExceeded(format!(
                "memory cap of {} bytes exceeded",
                self.limits.memory_cap
            )));
        }
        Ok(())
    }

    fn emit(&mut self, text: &str) {
        if self.truncated {
            return;
        }
        for ch in text.chars() {
            if self.out.len() >= self.limits.output_cap_bytes
                || self.out_lines >= self.limits.output_cap_lines
            {
                self.truncated = true;
                return;
            }
            if ch == '\n' {
                self.out_lines += 1;
            }
            self.out.push(ch);
        }
    }

    // --- Name resolution ---

    fn lookup(&self, name: &str) -> Option<&Value> {
        if let Some(scope) = self.locals.last()
            && let Some(value) = scope.get(name)
        {
            return Some(value);
        }
        self.globals.get(name)
    }

    fn bind(&mut self, name: &str, value: Value) {
        match self.locals.last_mut() {
            Some(scope) => {
                scope.insert(name.to_string(), value);
            }
            None => {
                self.globals.insert(name.to_string(), value);
            }
        }
    }

    fn lookup_mut(&mut self, name: &str) -> Option<&mut Value> {
        if self
            .locals
            .last()
            .is_some_and(|scope| scope.contains_key(name))
        {
            return self.locals.last_mut().and_then(|scope| scope.get_mut(name));
        }
        self.globals.get_mut(name)
    }

    // --- Statements ---

    fn exec_block(&mut self, stmts: &[Stmt]) -> Result<Flow, ExecError> {
        for stmt in stmts {
            match self.exec_stmt(stmt)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, stmt: &Stmt) -> Result<Flow, ExecError> {
        self.tick()?;
        match stmt {
            Stmt::Import { module, alias } => {
                let name = ALLOWED_MODULES
                    .iter()
                    .copied()
                    .find(|m| *m == module.as_str())
                    .ok_or_else(|| ExecError::Security {
                        module: Some(module.clone()),
                        operation: None,
                    })?;
                let bind_as = alias.as_deref().unwrap_or(module);
                self.bind(bind_as, Value::Module(name));
                Ok(Flow::Normal)
            }
            Stmt::Assign { target, value } => {
                let value = self.eval_expr(value)?;
                self.assign(target, value)?;
                Ok(Flow::Normal)
            }
            Stmt::AugAssign { target, op, value } => {
                let current = match target {
                    Target::Name(name) => self
                        .lookup(name)
                        .cloned()
                        .ok_or_else(|| name_error(name))?,
                    Target::Index { obj, index } => {
                        let container = self.eval_expr(obj)?;
                        let idx = self.eval_expr(index)?;
                        index_value(&container, &idx)?
                    }
                };
                let rhs = self.eval_expr(value)?;
                let binop = match op {
                    AugOp::Add => BinOp::Add,
                    AugOp::Sub => BinOp::Sub,
                    AugOp::Mul => BinOp::Mul,
                    AugOp::Div => BinOp::Div,
                };
                let result = self.binary(binop, current, rhs)?;
                self.assign(target, result)?;
                Ok(Flow::Normal)
            }
            Stmt::Expr(expr) => {
                self.eval_expr(expr)?;
                Ok(Flow::Normal)
            }
            Stmt::If {
                branches,
                else_body,
            } => {
                for (cond, body) in branches {
                    if self.eval_expr(cond)?.truthy() {
                        return self.exec_block(body);
                    }
                }
                self.exec_block(else_body)
            }
            Stmt::While { cond, body } => {
                loop {
                    self.tick()?;
                    if !self.eval_expr(cond)?.truthy() {
                        break;
                    }
                    match self.exec_block(body)? {
                        Flow::Break => break,
                        Flow::Continue | Flow::Normal => {}
                        flow @ Flow::Return(_) => return Ok(flow),
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::For {
                vars,
                iterable,
                body,
            } => {
                let items = self.iterate(iterable)?;
                for item in items {
                    self.tick()?;
                    self.bind_loop_vars(vars, item)?;
                    match self.exec_block(body)? {
                        Flow::Break => break,
                        Flow::Continue | Flow::Normal => {}
                        flow @ Flow::Return(_) => return Ok(flow),
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::Def(def) => {
                self.bind(&def.name, Value::Function(Arc::new(def.clone())));
                Ok(Flow::Normal)
            }
            Stmt::Return(value) => {
                if self.call_depth == 0 {
                    return Err(ExecError::Runtime(
                        "SyntaxError: 'return' outside function".into(),
                    ));
                }
                let value = match value {
                    Some(expr) => self.eval_expr(expr)?,
                    None => Value::None,
                };
                Ok(Flow::Return(value))
            }
            Stmt::Break => Ok(Flow::Break),
            Stmt::Continue => Ok(Flow::Continue),
            Stmt::Pass => Ok(Flow::Normal),
        }
    }

    fn bind_loop_vars(&mut self, vars: &[String], item: Value) -> Result<(), ExecError> {
        if vars.len() == 1 {
            self.bind(&vars[0], item);
            return Ok(());
        }
        match item {
            Value::List(items) if items.len() == vars.len() => {
                for (name, value) in vars.iter().zip(items) {
                    self.bind(name, value);
                }
                Ok(())
            }
            other => Err(ExecError::Runtime(format!(
                "ValueError: cannot unpack {} into {} names",
                other.type_name(),
                vars.len()
            ))),
        }
    }

    fn iterate(&mut self, iterable: &Expr) -> Result<Vec<Value>, ExecError> {
        let value = self.eval_expr(iterable)?;
        iterable_items(value)
    }

    fn assign(&mut self, target: &Target, value: Value) -> Result<(), ExecError> {
        match target {
            Target::Name(name) => {
                self.bind(name, value);
                Ok(())
            }
            Target::Index { obj, index } => {
                let idx = self.eval_expr(index)?;
                let container = self.place_mut(obj)?;
                match container {
                    Value::List(items) => {
                        let i = normalize_index(&idx, items.len())?;
                        items[i] = value;
                        Ok(())
                    }
                    Value::Dict(map) => {
                        let key = Key::from_value(&idx).ok_or_else(|| {
                            ExecError::Runtime(format!(
                                "TypeError: unhashable dict key: {}",
                                idx.type_name()
                            ))
                        })?;
                        map.insert(key, value);
                        Ok(())
                    }
                    other => Err(ExecError::Runtime(format!(
                        "TypeError: '{}' does not support item assignment",
                        other.type_name()
                    ))),
                }
            }
        }
    }

    /// Resolve an expression to a mutable storage slot. Only name-rooted
    /// index chains are places; anything else is a temporary.
    fn place_mut(&mut self, expr: &Expr) -> Result<&mut Value, ExecError> {
        match expr {
            Expr::Name(name) => {
                if self.lookup(name).is_none() {
                    return Err(name_error(name));
                }
                Ok(self.lookup_mut(name).expect("binding checked above"))
            }
            Expr::Index { obj, index } => {
                let idx = self.eval_expr(index)?;
                let container = self.place_mut(obj)?;
                match container {
                    Value::List(items) => {
                        let len = items.len();
                        let i = normalize_index(&idx, len)?;
                        Ok(&mut items[i])
                    }
                    Value::Dict(map) => {
                        let key = Key::from_value(&idx).ok_or_else(|| {
                            ExecError::Runtime("TypeError: unhashable dict key".into())
                        })?;
                        map.get_mut(&key)
                            .ok_or_else(|| ExecError::Runtime(format!("KeyError: {key}")))
                    }
                    other => Err(ExecError::Runtime(format!(
                        "TypeError: '{}' is not subscriptable",
                        other.type_name()
                    ))),
                }
            }
            _ => Err(ExecError::Runtime(
                "TypeError: expression is not assignable".into(),
            )),
        }
    }

    fn is_place(&self, expr: &Expr) -> bool {
        match expr {
            Expr::Name(_) => true,
            Expr::Index { obj, .. } => self.is_place(obj),
            _ => false,
        }
    }

    // --- Expressions ---

    fn eval_expr(&mut self, expr: &Expr) -> Result<Value, ExecError> {
        self.tick()?;
        match expr {
            Expr::None => Ok(Value::None),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Int(n) => Ok(Value::Int(*n)),
            Expr::Float(x) => Ok(Value::Float(*x)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Name(name) => self.lookup(name).cloned().ok_or_else(|| name_error(name)),
            Expr::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    let value = self.eval_expr(item)?;
                    self.charge(8 + value.approx_bytes())?;
                    values.push(value);
                }
                Ok(Value::List(values))
            }
            Expr::Dict(pairs) => {
                let mut map = BTreeMap::new();
                for (key_expr, value_expr) in pairs {
                    let key_value = self.eval_expr(key_expr)?;
                    let key = Key::from_value(&key_value).ok_or_else(|| {
                        ExecError::Runtime(format!(
                            "TypeError: unhashable dict key: {}",
                            key_value.type_name()
                        ))
                    })?;
                    let value = self.eval_expr(value_expr)?;
                    self.charge(16 + value.approx_bytes())?;
                    map.insert(key, value);
                }
                Ok(Value::Dict(map))
            }
            Expr::Binary { op, left, right } => match op {
                BinOp::And => {
                    let lhs = self.eval_expr(left)?;
                    if !lhs.truthy() {
                        return Ok(lhs);
                    }
                    self.eval_expr(right)
                }
                BinOp::Or => {
                    let lhs = self.eval_expr(left)?;
                    if lhs.truthy() {
                        return Ok(lhs);
                    }
                    self.eval_expr(right)
                }
                _ => {
                    let lhs = self.eval_expr(left)?;
                    let rhs = self.eval_expr(right)?;
                    self.binary(*op, lhs, rhs)
                }
            },
            Expr::Unary { op, operand } => {
                let value = self.eval_expr(operand)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!value.truthy())),
                    UnaryOp::Neg => match value {
                        Value::Int(n) => n
                            .checked_neg()
                            .map(Value::Int)
                            .ok_or_else(|| ExecError::Runtime("OverflowError".into())),
                        Value::Float(x) => Ok(Value::Float(-x)),
                        other => Err(ExecError::Runtime(format!(
                            "TypeError: bad operand type for unary -: '{}'",
                            other.type_name()
                        ))),
                    },
                }
            }
            Expr::Conditional { cond, then, other } => {
                if self.eval_expr(cond)?.truthy() {
                    self.eval_expr(then)
                } else {
                    self.eval_expr(other)
                }
            }
            Expr::Call { func, args } => self.eval_call(func, args),
            Expr::Attr { obj, name } => {
                let value = self.eval_expr(obj)?;
                match value {
                    Value::Module(module) => modules::module_attr(module, name).ok_or_else(|| {
                        ExecError::Runtime(format!(
                            "AttributeError: module '{module}' has no attribute '{name}'"
                        ))
                    }),
                    other => Err(ExecError::Runtime(format!(
                        "AttributeError: '{}' attribute '{name}' must be called",
                        other.type_name()
                    ))),
                }
            }
            Expr::Index { obj, index } => {
                let container = self.eval_expr(obj)?;
                let idx = self.eval_expr(index)?;
                index_value(&container, &idx)
            }
            Expr::Slice { obj, start, stop } => {
                let container = self.eval_expr(obj)?;
                let start = match start {
                    Some(expr) => Some(self.eval_expr(expr)?),
                    None => None,
                };
                let stop = match stop {
                    Some(expr) => Some(self.eval_expr(expr)?),
                    None => None,
                };
                slice_value(&container, start, stop)
            }
            Expr::ListComp {
                element,
                var,
                iterable,
                cond,
            } => {
                let items = self.iterate(iterable)?;
                let mut out = Vec::new();
                for item in items {
                    self.tick()?;
                    self.bind(var, item);
                    if let Some(cond) = cond
                        && !self.eval_expr(cond)?.truthy()
                    {
                        continue;
                    }
                    let value = self.eval_expr(element)?;
                    self.charge(8 + value.approx_bytes())?;
                    out.push(value);
                }
                Ok(Value::List(out))
            }
        }
    }

    fn eval_call(&mut self, func: &Expr, args: &[Expr]) -> Result<Value, ExecError> {
        let mut arg_values = Vec::with_capacity(args.len());
        for arg in args {
            arg_values.push(self.eval_expr(arg)?);
        }

        match func {
            Expr::Attr { obj, name } => {
                // Module function?
                if let Expr::Name(obj_name) = &**obj
                    && let Some(Value::Module(module)) = self.lookup(obj_name)
                {
                    let module = *module;
                    let result = modules::call_module_fn(module, name, arg_values)?;
                    self.charge(result.approx_bytes())?;
                    return Ok(result);
                }
                // Method on a mutable place keeps mutations.
                if self.is_place(obj) {
                    let place = self.place_mut(obj)?;
                    let result = call_method(place, name, arg_values)?;
                    self.charge(result.approx_bytes())?;
                    return Ok(result);
                }
                // Method on a temporary: mutations are discarded.
                let mut temp = self.eval_expr(obj)?;
                let result = call_method(&mut temp, name, arg_values)?;
                self.charge(result.approx_bytes())?;
                Ok(result)
            }
            Expr::Name(name) => {
                if let Some(value) = self.lookup(name).cloned() {
                    match value {
                        Value::Function(def) => return self.call_function(&def, arg_values),
                        Value::Module(_) => {
                            return Err(ExecError::Runtime(format!(
                                "TypeError: module '{name}' is not callable"
                            )));
                        }
                        _ => {
                            return Err(ExecError::Runtime(format!(
                                "TypeError: '{name}' is not callable"
                            )));
                        }
                    }
                }
                self.call_builtin(name, arg_values)
            }
            other => {
                let value = self.eval_expr(other)?;
                match value {
                    Value::Function(def) => self.call_function(&def, arg_values),
                    other => Err(ExecError::Runtime(format!(
                        "TypeError: '{}' object is not callable",
                        other.type_name()
                    ))),
                }
            }
        }
    }

    fn call_function(&mut self, def: &FunctionDef, args: Vec<Value>) -> Result<Value, ExecError> {
        if args.len() != def.params.len() {
            return Err(ExecError::Runtime(format!(
                "TypeError: {}() takes {} argument(s), got {}",
                def.name,
                def.params.len(),
                args.len()
            )));
        }
        if self.call_depth >= MAX_CALL_DEPTH {
            return Err(ExecError::Runtime(
                "RecursionError: maximum call depth exceeded".into(),
            ));
        }

        let mut scope = BTreeMap::new();
        for (param, value) in def.params.iter().zip(args) {
            scope.insert(param.clone(), value);
        }
        self.locals.push(scope);
        self.call_depth += 1;

        let result = self.exec_block(&def.body);

        self.call_depth -= 1;
        self.locals.pop();

        match result? {
            Flow::Return(value) => Ok(value),
            Flow::Normal => Ok(Value::None),
            Flow::Break | Flow::Continue => Err(ExecError::Runtime(
                "SyntaxError: loop control outside loop".into(),
            )),
        }
    }

    fn call_builtin(&mut self, name: &str, mut args: Vec<Value>) -> Result<Value, ExecError> {
        let result = match name {
            "print" => {
                let text = args
                    .iter()
                    .map(|v| v.to_display())
                    .collect::<Vec<_>>()
                    .join(" ");
                self.emit(&text);
                self.emit("\n");
                Value::None
            }
            "len" => {
                expect_args(name, &args, 1)?;
                match &args[0] {
                    Value::Str(s) => Value::Int(s.chars().count() as i64),
                    Value::List(items) => Value::Int(items.len() as i64),
                    Value::Dict(map) => Value::Int(map.len() as i64),
                    other => {
                        return Err(ExecError::Runtime(format!(
                            "TypeError: object of type '{}' has no len()",
                            other.type_name()
                        )));
                    }
                }
            }
            "range" => {
                let (start, stop, step) = match args.len() {
                    1 => (0, int_arg(name, &args[0])?, 1),
                    2 => (int_arg(name, &args[0])?, int_arg(name, &args[1])?, 1),
                    3 => (
                        int_arg(name, &args[0])?,
                        int_arg(name, &args[1])?,
                        int_arg(name, &args[2])?,
                    ),
                    n => {
                        return Err(ExecError::Runtime(format!(
                            "TypeError: range() takes 1 to 3 arguments, got {n}"
                        )));
                    }
                };
                if step == 0 {
                    return Err(ExecError::Runtime(
                        "ValueError: range() step must not be zero".into(),
                    ));
                }
                let count = if step > 0 {
                    (stop.saturating_sub(start).max(0) as u64).div_ceil(step as u64)
                } else {
                    (start.saturating_sub(stop).max(0) as u64)
                        .div_ceil(step.unsigned_abs())
                };
                self.charge(count.saturating_mul(16))?;
                let mut items = Vec::with_capacity(count as usize);
                let mut current = start;
                while (step > 0 && current < stop) || (step < 0 && current > stop) {
                    items.push(Value::Int(current));
                    current = current.saturating_add(step);
                }
                Value::List(items)
            }
            "sum" => {
                expect_args(name, &args, 1)?;
                let items = iterable_items(args.remove(0))?;
                let mut int_acc: i64 = 0;
                let mut float_acc = 0.0;
                let mut is_float = false;
                for item in items {
                    match item {
                        Value::Int(n) => {
                            int_acc = int_acc.checked_add(n).ok_or_else(|| {
                                ExecError::Runtime("OverflowError: sum too large".into())
                            })?;
                        }
                        Value::Float(x) => {
                            is_float = true;
                            float_acc += x;
                        }
                        Value::Bool(b) => int_acc += i64::from(b),
                        other => {
                            return Err(ExecError::Runtime(format!(
                                "TypeError: unsupported operand for sum: '{}'",
                                other.type_name()
                            )));
                        }
                    }
                }
                if is_float {
                    Value::Float(float_acc + int_acc as f64)
                } else {
                    Value::Int(int_acc)
                }
            }
            "min" | "max" => {
                let items = if args.len() == 1 {
                    iterable_items(args.remove(0))?
                } else {
                    args
                };
                if items.is_empty() {
                    return Err(ExecError::Runtime(format!(
                        "ValueError: {name}() arg is an empty sequence"
                    )));
                }
                let mut best = items[0].clone();
                for item in &items[1..] {
                    let ord = item.cmp_value(&best).ok_or_else(|| {
                        ExecError::Runtime("TypeError: values are not comparable".into())
                    })?;
                    let take = if name == "min" {
                        ord == std::cmp::Ordering::Less
                    } else {
                        ord == std::cmp::Ordering::Greater
                    };
                    if take {
                        best = item.clone();
                    }
                }
                best
            }
            "abs" => {
                expect_args(name, &args, 1)?;
                match &args[0] {
                    Value::Int(n) => Value::Int(n.checked_abs().ok_or_else(|| {
                        ExecError::Runtime("OverflowError".into())
                    })?),
                    Value::Float(x) => Value::Float(x.abs()),
                    other => {
                        return Err(ExecError::Runtime(format!(
                            "TypeError: bad operand type for abs(): '{}'",
                            other.type_name()
                        )));
                    }
                }
            }
            "round" => {
                let digits = match args.len() {
                    1 => 0,
                    2 => int_arg(name, &args[1])?,
                    n => {
                        return Err(ExecError::Runtime(format!(
                            "TypeError: round() takes 1 or 2 arguments, got {n}"
                        )));
                    }
                };
                match &args[0] {
                    Value::Int(n) => Value::Int(*n),
                    Value::Float(x) => {
                        let factor = 10f64.powi(digits as i32);
                        let rounded = (x * factor).round() / factor;
                        if digits <= 0 {
                            Value::Int(rounded as i64)
                        } else {
                            Value::Float(rounded)
                        }
                    }
                    other => {
                        return Err(ExecError::Runtime(format!(
                            "TypeError: round() expects a number, got '{}'",
                            other.type_name()
                        )));
                    }
                }
            }
            "sorted" => {
                expect_args(name, &args, 1)?;
                let mut items = iterable_items(args.remove(0))?;
                let mut failed = false;
                items.sort_by(|a, b| {
                    a.cmp_value(b).unwrap_or_else(|| {
                        failed = true;
                        std::cmp::Ordering::Equal
                    })
                });
                if failed {
                    return Err(ExecError::Runtime(
                        "TypeError: values are not comparable".into(),
                    ));
                }
                Value::List(items)
            }
            "reversed" => {
                expect_args(name, &args, 1)?;
                let mut items = iterable_items(args.remove(0))?;
                items.reverse();
                Value::List(items)
            }
            "enumerate" => {
                let start = match args.len() {
                    1 => 0,
                    2 => int_arg(name, &args[1])?,
                    n => {
                        return Err(ExecError::Runtime(format!(
                            "TypeError: enumerate() takes 1 or 2 arguments, got {n}"
                        )));
                    }
                };
                let items = iterable_items(args.swap_remove(0))?;
                Value::List(
                    items
                        .into_iter()
                        .enumerate()
                        .map(|(i, v)| Value::List(vec![Value::Int(start + i as i64), v]))
                        .collect(),
                )
            }
            "zip" => {
                expect_args(name, &args, 2)?;
                let right = iterable_items(args.pop().expect("checked len"))?;
                let left = iterable_items(args.pop().expect("checked len"))?;
                Value::List(
                    left.into_iter()
                        .zip(right)
                        .map(|(a, b)| Value::List(vec![a, b]))
                        .collect(),
                )
            }
            "str" => {
                expect_args(name, &args, 1)?;
                Value::Str(args[0].to_display())
            }
            "repr" => {
                expect_args(name, &args, 1)?;
                Value::Str(args[0].to_repr())
            }
            "int" => {
                expect_args(name, &args, 1)?;
                match &args[0] {
                    Value::Int(n) => Value::Int(*n),
                    Value::Float(x) => Value::Int(x.trunc() as i64),
                    Value::Bool(b) => Value::Int(i64::from(*b)),
                    Value::Str(s) => Value::Int(s.trim().parse::<i64>().map_err(|_| {
                        ExecError::Runtime(format!(
                            "ValueError: invalid literal for int(): '{s}'"
                        ))
                    })?),
                    other => {
                        return Err(ExecError::Runtime(format!(
                            "TypeError: int() argument must be a number or string, not '{}'",
                            other.type_name()
                        )));
                    }
                }
            }
            "float" => {
                expect_args(name, &args, 1)?;
                match &args[0] {
                    Value::Int(n) => Value::Float(*n as f64),
                    Value::Float(x) => Value::Float(*x),
                    Value::Bool(b) => Value::Float(f64::from(*b)),
                    Value::Str(s) => Value::Float(s.trim().parse::<f64>().map_err(|_| {
                        ExecError::Runtime(format!(
                            "ValueError: could not convert string to float: '{s}'"
                        ))
                    })?),
                    other => {
                        return Err(ExecError::Runtime(format!(
                            "TypeError: float() argument must be a number or string, not '{}'",
                            other.type_name()
                        )));
                    }
                }
            }
            "bool" => {
                expect_args(name, &args, 1)?;
                Value::Bool(args[0].truthy())
            }
            "list" => {
                expect_args(name, &args, 1)?;
                Value::List(iterable_items(args.remove(0))?)
            }
            "dict" => {
                expect_args(name, &args, 1)?;
                match args.remove(0) {
                    value @ Value::Dict(_) => value,
                    other => {
                        return Err(ExecError::Runtime(format!(
                            "TypeError: dict() expects a dict, got '{}'",
                            other.type_name()
                        )));
                    }
                }
            }
            "any" | "all" => {
                expect_args(name, &args, 1)?;
                let items = iterable_items(args.remove(0))?;
                if name == "any" {
                    Value::Bool(items.iter().any(|v| v.truthy()))
                } else {
                    Value::Bool(items.iter().all(|v| v.truthy()))
                }
            }
            "type" => {
                expect_args(name, &args, 1)?;
                Value::Str(args[0].type_name().to_string())
            }
            _ => return Err(name_error(name)),
        };
        self.charge(result.approx_bytes())?;
        Ok(result)
    }

    fn binary(&mut self, op: BinOp, lhs: Value, rhs: Value) -> Result<Value, ExecError> {
        use BinOp::*;
        match op {
            Eq => return Ok(Value::Bool(lhs.eq_value(&rhs))),
            Ne => return Ok(Value::Bool(!lhs.eq_value(&rhs))),
            Lt | Le | Gt | Ge => {
                let ord = lhs.cmp_value(&rhs).ok_or_else(|| {
                    ExecError::Runtime(format!(
                        "TypeError: comparison not supported between '{}' and '{}'",
                        lhs.type_name(),
                        rhs.type_name()
                    ))
                })?;
                let result = match op {
                    Lt => ord == std::cmp::Ordering::Less,
                    Le => ord != std::cmp::Ordering::Greater,
                    Gt => ord == std::cmp::Ordering::Greater,
                    Ge => ord != std::cmp::Ordering::Less,
                    _ => unreachable!(),
                };
                return Ok(Value::Bool(result));
            }
            In | NotIn => {
                let contained = contains(&rhs, &lhs)?;
                return Ok(Value::Bool(if op == In { contained } else { !contained }));
            }
            _ => {}
        }

        let result = match (op, lhs, rhs) {
            (Add, Value::Str(a), Value::Str(b)) => {
                self.charge((a.len() + b.len()) as u64)?;
                Value::Str(a + &b)
            }
            (Add, Value::List(mut a), Value::List(b)) => {
                self.charge(Value::List(b.clone()).approx_bytes())?;
                a.extend(b);
                Value::List(a)
            }
            (Mul, Value::Str(s), Value::Int(n)) | (Mul, Value::Int(n), Value::Str(s)) => {
                let n = n.max(0) as usize;
                self.charge((s.len() as u64).saturating_mul(n as u64))?;
                Value::Str(s.repeat(n))
            }
            (Mul, Value::List(items), Value::Int(n)) | (Mul, Value::Int(n), Value::List(items)) => {
                let n = n.max(0) as usize;
                let base = Value::List(items.clone()).approx_bytes();
                self.charge(base.saturating_mul(n as u64))?;
                let mut out = Vec::with_capacity(items.len() * n);
                for _ in 0..n {
                    out.extend(items.iter().cloned());
                }
                Value::List(out)
            }
            (op, lhs, rhs) => numeric_binary(op, &lhs, &rhs)?,
        };
        Ok(result)
    }
}

fn expect_args(name: &str, args: &[Value], expected: usize) -> Result<(), ExecError> {
    if args.len() != expected {
        return Err(ExecError::Runtime(format!(
            "TypeError: {name}() takes {expected} argument(s), got {}",
            args.len()
        )));
    }
    Ok(())
}

fn int_arg(context: &str, value: &Value) -> Result<i64, ExecError> {
    match value {
        Value::Int(n) => Ok(*n),
        Value::Bool(b) => Ok(i64::from(*b)),
        other => Err(ExecError::Runtime(format!(
            "TypeError: {context}() expects an integer, got '{}'",
            other.type_name()
        ))),
    }
}

fn name_error(name: &str) -> ExecError {
    ExecError::Runtime(format!("NameError: name '{name}' is not defined"))
}

fn iterable_items(value: Value) -> Result<Vec<Value>, ExecError> {
    match value {
        Value::List(items) => Ok(items),
        Value::Str(s) => Ok(s.chars().map(|c| Value::Str(c.to_string())).collect()),
        Value::Dict(map) => Ok(map.keys().map(|k| k.to_value()).collect()),
        other => Err(ExecError::Runtime(format!(
            "TypeError: '{}' object is not iterable",
            other.type_name()
        ))),
    }
}

fn normalize_index(idx: &Value, len: usize) -> Result<usize, ExecError> {
    let i = match idx {
        Value::Int(n) => *n,
        other => {
            return Err(ExecError::Runtime(format!(
                "TypeError: indices must be integers, not '{}'",
                other.type_name()
            )));
        }
    };
    let adjusted = if i < 0 { i + len as i64 } else { i };
    if adjusted < 0 || adjusted as usize >= len {
        return Err(ExecError::Runtime("IndexError: index out of range".into()));
    }
    Ok(adjusted as usize)
}

fn index_value(container: &Value, idx: &Value) -> Result<Value, ExecError> {
    match container {
        Value::List(items) => {
            let i = normalize_index(idx, items.len())?;
            Ok(items[i].clone())
        }
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let i = normalize_index(idx, chars.len())?;
            Ok(Value::Str(chars[i].to_string()))
        }
        Value::Dict(map) => {
            let key = Key::from_value(idx).ok_or_else(|| {
                ExecError::Runtime(format!(
                    "TypeError: unhashable dict key: {}",
                    idx.type_name()
                ))
            })?;
            map.get(&key)
                .cloned()
                .ok_or_else(|| ExecError::Runtime(format!("KeyError: {key}")))
        }
        other => Err(ExecError::Runtime(format!(
            "TypeError: '{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

fn slice_bounds(
    start: Option<Value>,
    stop: Option<Value>,
    len: usize,
) -> Result<(usize, usize), ExecError> {
    let resolve = |value: Option<Value>, default: i64| -> Result<i64, ExecError> {
        match value {
            None => Ok(default),
            Some(Value::Int(n)) => Ok(n),
            Some(other) => Err(ExecError::Runtime(format!(
                "TypeError: slice indices must be integers, not '{}'",
                other.type_name()
            ))),
        }
    };
    let len_i = len as i64;
    let clamp = |i: i64| -> usize {
        let adjusted = if i < 0 { i + len_i } else { i };
        adjusted.clamp(0, len_i) as usize
    };
    let start = clamp(resolve(start, 0)?);
    let stop = clamp(resolve(stop, len_i)?);
    Ok((start, stop.max(start)))
}

fn slice_value(
    container: &Value,
    start: Option<Value>,
    stop: Option<Value>,
) -> Result<Value, ExecError> {
    match container {
        Value::List(items) => {
            let (a, b) = slice_bounds(start, stop, items.len())?;
            Ok(Value::List(items[a..b].to_vec()))
        }
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let (a, b) = slice_bounds(start, stop, chars.len())?;
            Ok(Value::Str(chars[a..b].iter().collect()))
        }
        other => Err(ExecError::Runtime(format!(
            "TypeError: '{}' object is not sliceable",
            other.type_name()
        ))),
    }
}

fn contains(container: &Value, needle: &Value) -> Result<bool, ExecError> {
    match container {
        Value::List(items) => Ok(items.iter().any(|v| v.eq_value(needle))),
        Value::Dict(map) => Ok(Key::from_value(needle)
            .map(|key| map.contains_key(&key))
            .unwrap_or(false)),
        Value::Str(s) => match needle {
            Value::Str(sub) => Ok(s.contains(sub.as_str())),
            other => Err(ExecError::Runtime(format!(
                "TypeError: 'in <string>' requires string, got '{}'",
                other.type_name()
            ))),
        },
        other => Err(ExecError::Runtime(format!(
            "TypeError: argument of type '{}' is not a container",
            other.type_name()
        ))),
    }
}

fn numeric_binary(op: BinOp, lhs: &Value, rhs: &Value) -> Result<Value, ExecError> {
    use BinOp::*;

    let type_err = || {
        ExecError::Runtime(format!(
            "TypeError: unsupported operand types: '{}' and '{}'",
            lhs.type_name(),
            rhs.type_name()
        ))
    };

    let as_pair = || -> Option<(f64, f64, bool)> {
        let coerce = |v: &Value| match v {
            Value::Int(n) => Some((*n as f64, true)),
            Value::Float(x) => Some((*x, false)),
            Value::Bool(b) => Some((f64::from(*b), true)),
            _ => None,
        };
        let (a, a_int) = coerce(lhs)?;
        let (b, b_int) = coerce(rhs)?;
        Some((a, b, a_int && b_int))
    };

    let int_pair = || -> Option<(i64, i64)> {
        let coerce = |v: &Value| match v {
            Value::Int(n) => Some(*n),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        };
        Some((coerce(lhs)?, coerce(rhs)?))
    };

    match op {
        Add | Sub | Mul => {
            if let Some((a, b)) = int_pair() {
                let result = match op {
                    Add => a.checked_add(b),
                    Sub => a.checked_sub(b),
                    Mul => a.checked_mul(b),
                    _ => unreachable!(),
                };
                return result
                    .map(Value::Int)
                    .ok_or_else(|| ExecError::Runtime("OverflowError: integer overflow".into()));
            }
            let (a, b, _) = as_pair().ok_or_else(type_err)?;
            let result = match op {
                Add => a + b,
                Sub => a - b,
                Mul => a * b,
                _ => unreachable!(),
            };
            Ok(Value::Float(result))
        }
        Div => {
            let (a, b, _) = as_pair().ok_or_else(type_err)?;
            if b == 0.0 {
                return Err(ExecError::Runtime(
                    "ZeroDivisionError: division by zero".into(),
                ));
            }
            Ok(Value::Float(a / b))
        }
        FloorDiv => {
            if let Some((a, b)) = int_pair() {
                if b == 0 {
                    return Err(ExecError::Runtime(
                        "ZeroDivisionError: integer division by zero".into(),
                    ));
                }
                return Ok(Value::Int(a.div_euclid(b)));
            }
            let (a, b, _) = as_pair().ok_or_else(type_err)?;
            if b == 0.0 {
                return Err(ExecError::Runtime(
                    "ZeroDivisionError: division by zero".into(),
                ));
            }
            Ok(Value::Float((a / b).floor()))
        }
        Mod => {
            if let Some((a, b)) = int_pair() {
                if b == 0 {
                    return Err(ExecError::Runtime(
                        "ZeroDivisionError: modulo by zero".into(),
                    ));
                }
                return Ok(Value::Int(a.rem_euclid(b)));
            }
            let (a, b, _) = as_pair().ok_or_else(type_err)?;
            if b == 0.0 {
                return Err(ExecError::Runtime(
                    "ZeroDivisionError: modulo by zero".into(),
                ));
            }
            Ok(Value::Float(a - b * (a / b).floor()))
        }
        Pow => {
            if let Some((a, b)) = int_pair()
                && b >= 0
            {
                let exp = u32::try_from(b)
                    .map_err(|_| ExecError::Runtime("OverflowError: exponent too large".into()))?;
                return a
                    .checked_pow(exp)
                    .map(Value::Int)
                    .ok_or_else(|| ExecError::Runtime("OverflowError: integer overflow".into()));
            }
            let (a, b, _) = as_pair().ok_or_else(type_err)?;
            Ok(Value::Float(a.powf(b)))
        }
        _ => Err(type_err()),
    }
}

/// Built-in methods on values. Mutating methods receive the value behind
/// its storage slot when the receiver is a name or index place.
fn call_method(receiver: &mut Value, name: &str, args: Vec<Value>) -> Result<Value, ExecError> {
    match receiver {
        Value::Str(s) => str_method(s, name, args),
        Value::List(items) => list_method(items, name, args),
        Value::Dict(map) => dict_method(map, name, args),
        Value::Timestamp(ts) => match name {
            "isoformat" => Ok(Value::Str(ts.to_rfc3339())),
            "timestamp" => Ok(Value::Float(ts.timestamp_micros() as f64 / 1e6)),
            _ => Err(ExecError::Runtime(format!(
                "AttributeError: 'timestamp' object has no method '{name}'"
            ))),
        },
        other => Err(ExecError::Runtime(format!(
            "AttributeError: '{}' object has no method '{name}'",
            other.type_name()
        ))),
    }
}

fn str_arg(context: &str, value: &Value) -> Result<String, ExecError> {
    match value {
        Value::Str(s) => Ok(s.clone()),
        other => Err(ExecError::Runtime(format!(
            "TypeError: {context} expects a string, got '{}'",
            other.type_name()
        ))),
    }
}

fn str_method(s: &str, name: &str, args: Vec<Value>) -> Result<Value, ExecError> {
    let no_args = |args: &[Value]| -> Result<(), ExecError> {
        if !args.is_empty() {
            return Err(ExecError::Runtime(format!(
                "TypeError: str.{name}() takes no arguments"
            )));
        }
        Ok(())
    };
    match name {
        "upper" => {
            no_args(&args)?;
            Ok(Value::Str(s.to_uppercase()))
        }
        "lower" => {
            no_args(&args)?;
            Ok(Value::Str(s.to_lowercase()))
        }
        "strip" => {
            no_args(&args)?;
            Ok(Value::Str(s.trim().to_string()))
        }
        "lstrip" => {
            no_args(&args)?;
            Ok(Value::Str(s.trim_start().to_string()))
        }
        "rstrip" => {
            no_args(&args)?;
            Ok(Value::Str(s.trim_end().to_string()))
        }
        "title" => {
            no_args(&args)?;
            let mut out = String::with_capacity(s.len());
            let mut at_word_start = true;
            for c in s.chars() {
                if at_word_start {
                    out.extend(c.to_uppercase());
                } else {
                    out.extend(c.to_lowercase());
                }
                at_word_start = !c.is_alphanumeric();
            }
            Ok(Value::Str(out))
        }
        "capitalize" => {
            no_args(&args)?;
            let mut chars = s.chars();
            let out = match chars.next() {
                Some(first) => {
                    first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
                }
                None => String::new(),
            };
            Ok(Value::Str(out))
        }
        "split" => {
            let parts: Vec<Value> = match args.len() {
                0 => s
                    .split_whitespace()
                    .map(|p| Value::Str(p.to_string()))
                    .collect(),
                1 => {
                    let sep = str_arg("str.split()", &args[0])?;
                    s.split(sep.as_str())
                        .map(|p| Value::Str(p.to_string()))
                        .collect()
                }
                n => {
                    return Err(ExecError::Runtime(format!(
                        "TypeError: str.split() takes 0 or 1 arguments, got {n}"
                    )));
                }
            };
            Ok(Value::List(parts))
        }
        "splitlines" => {
            no_args(&args)?;
            Ok(Value::List(
                s.lines().map(|l| Value::Str(l.to_string())).collect(),
            ))
        }
        "join" => {
            expect_args("str.join", &args, 1)?;
            let items = match &args[0] {
                Value::List(items) => items,
                other => {
                    return Err(ExecError::Runtime(format!(
                        "TypeError: str.join() expects a list, got '{}'",
                        other.type_name()
                    )));
                }
            };
            let mut parts = Vec::with_capacity(items.len());
            for item in items {
                parts.push(str_arg("str.join()", item)?);
            }
            Ok(Value::Str(parts.join(s)))
        }
        "replace" => {
            expect_args("str.replace", &args, 2)?;
            let from = str_arg("str.replace()", &args[0])?;
            let to = str_arg("str.replace()", &args[1])?;
            Ok(Value::Str(s.replace(&from, &to)))
        }
        "startswith" => {
            expect_args("str.startswith", &args, 1)?;
            Ok(Value::Bool(
                s.starts_with(&str_arg("str.startswith()", &args[0])?),
            ))
        }
        "endswith" => {
            expect_args("str.endswith", &args, 1)?;
            Ok(Value::Bool(
                s.ends_with(&str_arg("str.endswith()", &args[0])?),
            ))
        }
        "find" => {
            expect_args("str.find", &args, 1)?;
            let needle = str_arg("str.find()", &args[0])?;
            Ok(Value::Int(match s.find(&needle) {
                Some(byte_idx) => s[..byte_idx].chars().count() as i64,
                None => -1,
            }))
        }
        "count" => {
            expect_args("str.count", &args, 1)?;
            let needle = str_arg("str.count()", &args[0])?;
            if needle.is_empty() {
                return Ok(Value::Int(s.chars().count() as i64 + 1));
            }
            Ok(Value::Int(s.matches(&needle).count() as i64))
        }
        "isdigit" => {
            no_args(&args)?;
            Ok(Value::Bool(
                !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()),
            ))
        }
        "isalpha" => {
            no_args(&args)?;
            Ok(Value::Bool(!s.is_empty() && s.chars().all(|c| c.is_alphabetic())))
        }
        "zfill" => {
            expect_args("str.zfill", &args, 1)?;
            let width = int_arg("str.zfill", &args[0])?.max(0) as usize;
            let len = s.chars().count();
            if len >= width {
                return Ok(Value::Str(s.to_string()));
            }
            Ok(Value::Str("0".repeat(width - len) + s))
        }
        _ => Err(ExecError::Runtime(format!(
            "AttributeError: 'str' object has no method '{name}'"
        ))),
    }
}

fn list_method(items: &mut Vec<Value>, name: &str, mut args: Vec<Value>) -> Result<Value, ExecError> {
    match name {
        "append" => {
            expect_args("list.append", &args, 1)?;
            items.push(args.remove(0));
            Ok(Value::None)
        }
        "extend" => {
            expect_args("list.extend", &args, 1)?;
            items.extend(iterable_items(args.remove(0))?);
            Ok(Value::None)
        }
        "insert" => {
            expect_args("list.insert", &args, 2)?;
            let idx = int_arg("list.insert", &args[0])?;
            let pos = idx.clamp(0, items.len() as i64) as usize;
            items.insert(pos, args.remove(1));
            Ok(Value::None)
        }
        "pop" => {
            let idx = match args.len() {
                0 => items.len() as i64 - 1,
                1 => int_arg("list.pop", &args[0])?,
                n => {
                    return Err(ExecError::Runtime(format!(
                        "TypeError: list.pop() takes 0 or 1 arguments, got {n}"
                    )));
                }
            };
            if items.is_empty() {
                return Err(ExecError::Runtime(
                    "IndexError: pop from empty list".into(),
                ));
            }
            let i = normalize_index(&Value::Int(idx), items.len())?;
            Ok(items.remove(i))
        }
        "remove" => {
            expect_args("list.remove", &args, 1)?;
            let needle = &args[0];
            match items.iter().position(|v| v.eq_value(needle)) {
                Some(i) => {
                    items.remove(i);
                    Ok(Value::None)
                }
                None => Err(ExecError::Runtime(
                    "ValueError: list.remove(x): x not in list".into(),
                )),
            }
        }
        "index" => {
            expect_args("list.index", &args, 1)?;
            let needle = &args[0];
            items
                .iter()
                .position(|v| v.eq_value(needle))
                .map(|i| Value::Int(i as i64))
                .ok_or_else(|| ExecError::Runtime("ValueError: value not in list".into()))
        }
        "count" => {
            expect_args("list.count", &args, 1)?;
            let needle = &args[0];
            Ok(Value::Int(
                items.iter().filter(|v| v.eq_value(needle)).count() as i64,
            ))
        }
        "sort" => {
            if !args.is_empty() {
                return Err(ExecError::Runtime(
                    "TypeError: list.sort() takes no arguments".into(),
                ));
            }
            let mut failed = false;
            items.sort_by(|a, b| {
                a.cmp_value(b).unwrap_or_else(|| {
                    failed = true;
                    std::cmp::Ordering::Equal
                })
            });
            if failed {
                return Err(ExecError::Runtime(
                    "TypeError: values are not comparable".into(),
                ));
            }
            Ok(Value::None)
        }
        "reverse" => {
            if !args.is_empty() {
                return Err(ExecError::Runtime(
                    "TypeError: list.reverse() takes no arguments".into(),
                ));
            }
            items.reverse();
            Ok(Value::None)
        }
        "clear" => {
            items.clear();
            Ok(Value::None)
        }
        "copy" => Ok(Value::List(items.clone())),
        _ => Err(ExecError::Runtime(format!(
            "AttributeError: 'list' object has no method '{name}'"
        ))),
    }
}

fn dict_method(
    map: &mut BTreeMap<Key, Value>,
    name: &str,
    mut args: Vec<Value>,
) -> Result<Value, ExecError> {
    let key_of = |value: &Value| {
        Key::from_value(value)
            .ok_or_else(|| ExecError::Runtime("TypeError: unhashable dict key".into()))
    };
    match name {
        "get" => {
            let default = match args.len() {
                1 => Value::None,
                2 => args.remove(1),
                n => {
                    return Err(ExecError::Runtime(format!(
                        "TypeError: dict.get() takes 1 or 2 arguments, got {n}"
                    )));
                }
            };
            let key = key_of(&args[0])?;
            Ok(map.get(&key).cloned().unwrap_or(default))
        }
        "keys" => Ok(Value::List(map.keys().map(|k| k.to_value()).collect())),
        "values" => Ok(Value::List(map.values().cloned().collect())),
        "items" => Ok(Value::List(
            map.iter()
                .map(|(k, v)| Value::List(vec![k.to_value(), v.clone()]))
                .collect(),
        )),
        "pop" => {
            let default = match args.len() {
                1 => None,
                2 => Some(args.remove(1)),
                n => {
                    return Err(ExecError::Runtime(format!(
                        "TypeError: dict.pop() takes 1 or 2 arguments, got {n}"
                    )));
                }
            };
            let key = key_of(&args[0])?;
            match map.remove(&key) {
                Some(value) => Ok(value),
                None => default
                    .ok_or_else(|| ExecError::Runtime(format!("KeyError: {key}"))),
            }
        }
        "update" => {
            expect_args("dict.update", &args, 1)?;
            match args.remove(0) {
                Value::Dict(other) => {
                    map.extend(other);
                    Ok(Value::None)
                }
                other => Err(ExecError::Runtime(format!(
                    "TypeError: dict.update() expects a dict, got '{}'",
                    other.type_name()
                ))),
            }
        }
        "clear" => {
            map.clear();
            Ok(Value::None)
        }
        "copy" => Ok(Value::Dict(map.clone())),
        _ => Err(ExecError::Runtime(format!(
            "AttributeError: 'dict' object has no method '{name}'"
        ))),
    }
}
