//! Tree-walking interpreter for cell source.
//!
//! Cells are parsed with `syn` as the body of a block and evaluated directly
//! from the AST. Top-level `let` bindings become the cell's contribution to
//! the namespace; they are only handed back to the caller when the cell
//! finishes without error.

use std::time::{Duration, Instant};

use quote::ToTokens;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use syn::punctuated::Punctuated;
use syn::spanned::Spanned;
use syn::{
    BinOp, Block, Expr, ExprBinary, ExprForLoop, ExprIf, ExprLoop, ExprMatch, ExprRange,
    ExprWhile, Lit, Local, Macro, Member, Pat, RangeLimits, Stmt, Token, UnOp,
};

use super::error::ExecError;
use super::format;
use super::namespace::Namespace;
use super::value::Value;
use crate::execute::AbortHandle;

/// Granularity at which `sleep_ms` re-checks for interruption.
const SLEEP_POLL: Duration = Duration::from_millis(5);

/// Limits applied while executing cells.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, serde::Serialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Captured stdout beyond this many bytes is dropped.
    pub max_stdout_bytes: usize,
    /// Largest range or repeat expression that may be materialized.
    pub max_range_len: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_stdout_bytes: 64 * 1024,
            max_range_len: 1_000_000,
        }
    }
}

/// Outcome of executing one cell.
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    /// Output value on success (`None` when the cell ends in a statement or
    /// evaluates to `()`), or the error that stopped the cell.
    pub result: Result<Option<Value>, ExecError>,
    /// Top-level bindings, sorted by name. Empty unless `result` is `Ok`.
    pub bindings: Vec<(String, Value)>,
    /// Text printed by the cell.
    pub stdout: String,
}

/// Parse cell source into a block.
pub fn parse_cell(source: &str) -> Result<Block, ExecError> {
    syn::parse_str::<Block>(&format!("{{\n{source}\n}}")).map_err(|e| ExecError::syntax(&e))
}

/// Execute cell source against the namespace.
///
/// The namespace is only read; committing bindings is up to the caller.
pub fn execute(
    source: &str,
    globals: &Namespace,
    abort: &AbortHandle,
    config: &RuntimeConfig,
) -> Execution {
    let block = match parse_cell(source) {
        Ok(block) => block,
        Err(e) => {
            return Execution {
                result: Err(e),
                bindings: Vec::new(),
                stdout: String::new(),
            };
        }
    };

    let mut interp = Interpreter {
        globals,
        abort,
        config,
        scopes: vec![FxHashMap::default()],
        stdout: String::new(),
        stdout_truncated: false,
    };

    let result = match interp.eval_stmts(&block.stmts) {
        Ok(value) => Ok((!value.is_unit()).then_some(value)),
        Err(Unwind::Error(e)) => Err(e),
        Err(Unwind::Break(_)) => Err(ExecError::unsupported("`break` outside of a loop")),
        Err(Unwind::Continue) => Err(ExecError::unsupported("`continue` outside of a loop")),
    };

    let bindings = if result.is_ok() {
        let mut bindings: Vec<(String, Value)> =
            interp.scopes.pop().unwrap_or_default().into_iter().collect();
        bindings.sort_by(|a, b| a.0.cmp(&b.0));
        bindings
    } else {
        Vec::new()
    };

    Execution {
        result,
        bindings,
        stdout: interp.stdout,
    }
}

/// Non-local control flow while evaluating.
enum Unwind {
    Break(Value),
    Continue,
    Error(ExecError),
}

impl From<ExecError> for Unwind {
    fn from(e: ExecError) -> Self {
        Unwind::Error(e)
    }
}

type Flow<T> = std::result::Result<T, Unwind>;

struct Interpreter<'a> {
    globals: &'a Namespace,
    abort: &'a AbortHandle,
    config: &'a RuntimeConfig,
    /// Innermost scope last; `scopes[0]` is the cell's top level.
    scopes: Vec<FxHashMap<String, Value>>,
    stdout: String,
    stdout_truncated: bool,
}

impl Interpreter<'_> {
    fn check_abort(&self) -> Result<(), ExecError> {
        if self.abort.is_aborted() {
            Err(ExecError::interrupted())
        } else {
            Ok(())
        }
    }

    fn eval_stmts(&mut self, stmts: &[Stmt]) -> Flow<Value> {
        let mut last = Value::Unit;
        for (i, stmt) in stmts.iter().enumerate() {
            self.check_abort()?;
            let is_last = i + 1 == stmts.len();
            last = Value::Unit;
            match stmt {
                Stmt::Local(local) => self.eval_local(local)?,
                Stmt::Item(item) => {
                    return Err(ExecError::unsupported(
                        "items (`fn`, `struct`, `use`, ...) are not supported in cells",
                    )
                    .at(item.span())
                    .into());
                }
                Stmt::Expr(expr, semi) => {
                    let value = self.eval(expr)?;
                    if is_last && semi.is_none() {
                        last = value;
                    }
                }
                Stmt::Macro(stmt) => {
                    let value = self.eval_macro(&stmt.mac).map_err(|u| at(u, stmt.span()))?;
                    if is_last && stmt.semi_token.is_none() {
                        last = value;
                    }
                }
            }
        }
        Ok(last)
    }

    fn eval_local(&mut self, local: &Local) -> Flow<()> {
        let value = match &local.init {
            Some(init) if init.diverge.is_some() => {
                return Err(ExecError::unsupported("`let ... else` is not supported")
                    .at(local.span())
                    .into());
            }
            Some(init) => self.eval(&init.expr)?,
            None => Value::Unit,
        };
        self.bind_pattern(&local.pat, value)
            .map_err(|e| e.at(local.span()).into())
    }

    fn define(&mut self, name: String, value: Value) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name, value);
        }
    }

    fn lookup(&self, name: &str) -> Result<Value, ExecError> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(name))
            .or_else(|| self.globals.get(name))
            .cloned()
            .ok_or_else(|| ExecError::name(format!("name `{name}` is not defined")))
    }

    fn local_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.scopes
            .iter_mut()
            .rev()
            .find_map(|scope| scope.get_mut(name))
    }

    fn in_scope(
        &mut self,
        bindings: Vec<(String, Value)>,
        f: impl FnOnce(&mut Self) -> Flow<Value>,
    ) -> Flow<Value> {
        self.scopes.push(bindings.into_iter().collect());
        let result = f(self);
        self.scopes.pop();
        result
    }

    fn eval_block(&mut self, block: &Block) -> Flow<Value> {
        self.in_scope(Vec::new(), |this| this.eval_stmts(&block.stmts))
    }

    fn eval(&mut self, expr: &Expr) -> Flow<Value> {
        self.eval_inner(expr).map_err(|u| at(u, expr.span()))
    }

    fn eval_inner(&mut self, expr: &Expr) -> Flow<Value> {
        match expr {
            Expr::Lit(e) => Ok(lit_value(&e.lit)?),
            Expr::Path(e) => match (&e.qself, e.path.get_ident()) {
                (None, Some(ident)) => Ok(self.lookup(&ident.to_string())?),
                _ => Err(unsupported_expr(expr)),
            },
            Expr::Paren(e) => self.eval(&e.expr),
            Expr::Group(e) => self.eval(&e.expr),
            Expr::Reference(e) => self.eval(&e.expr),
            Expr::Unary(e) => {
                let value = self.eval(&e.expr)?;
                Ok(unary(&e.op, value)?)
            }
            Expr::Binary(e) => self.eval_binary(e),
            Expr::Assign(e) => {
                let value = self.eval(&e.right)?;
                self.assign(&e.left, value)?;
                Ok(Value::Unit)
            }
            Expr::Array(e) => {
                let items = e
                    .elems
                    .iter()
                    .map(|item| self.eval(item))
                    .collect::<Flow<Vec<_>>>()?;
                Ok(Value::List(items))
            }
            Expr::Repeat(e) => {
                let item = self.eval(&e.expr)?;
                let len = self.eval(&e.len)?.as_int()?;
                let len = self.checked_len(len)?;
                Ok(Value::List(vec![item; len]))
            }
            Expr::Tuple(e) if e.elems.is_empty() => Ok(Value::Unit),
            Expr::Tuple(e) => {
                let items = e
                    .elems
                    .iter()
                    .map(|item| self.eval(item))
                    .collect::<Flow<Vec<_>>>()?;
                Ok(Value::Tuple(items))
            }
            Expr::Index(e) => {
                let base = self.eval(&e.expr)?;
                let index = self.eval(&e.index)?;
                Ok(base.index(&index)?)
            }
            Expr::Field(e) => {
                let base = self.eval(&e.base)?;
                match (&e.member, base) {
                    (Member::Unnamed(index), Value::Tuple(items)) => items
                        .get(index.index as usize)
                        .cloned()
                        .ok_or_else(|| {
                            ExecError::index(format!("tuple has no field {}", index.index)).into()
                        }),
                    (_, base) => Err(ExecError::type_error(format!(
                        "no field `{}` on {}",
                        e.member.to_token_stream(),
                        base.type_name()
                    ))
                    .into()),
                }
            }
            Expr::If(e) => self.eval_if(e),
            Expr::Match(e) => self.eval_match(e),
            Expr::Block(e) => self.eval_block(&e.block),
            Expr::Loop(e) => self.eval_loop(e),
            Expr::While(e) => self.eval_while(e),
            Expr::ForLoop(e) => self.eval_for(e),
            Expr::Break(e) => {
                let value = match &e.expr {
                    Some(value) => self.eval(value)?,
                    None => Value::Unit,
                };
                Err(Unwind::Break(value))
            }
            Expr::Continue(_) => Err(Unwind::Continue),
            Expr::Call(e) => {
                let name = match &*e.func {
                    Expr::Path(p) if p.qself.is_none() => p.path.get_ident().map(|i| i.to_string()),
                    _ => None,
                };
                let Some(name) = name else {
                    return Err(unsupported_expr(expr));
                };
                let args = e
                    .args
                    .iter()
                    .map(|arg| self.eval(arg))
                    .collect::<Flow<Vec<_>>>()?;
                self.call_builtin(&name, args)
            }
            Expr::MethodCall(e) => {
                let receiver = self.eval(&e.receiver)?;
                let args = e
                    .args
                    .iter()
                    .map(|arg| self.eval(arg))
                    .collect::<Flow<Vec<_>>>()?;
                Ok(receiver.call_method(&e.method.to_string(), args)?)
            }
            Expr::Macro(e) => self.eval_macro(&e.mac),
            Expr::Range(e) => self.materialize_range(e),
            Expr::Cast(e) => {
                let value = self.eval(&e.expr)?;
                Ok(cast(value, &e.ty.to_token_stream().to_string())?)
            }
            _ => Err(unsupported_expr(expr)),
        }
    }

    fn eval_binary(&mut self, e: &ExprBinary) -> Flow<Value> {
        match &e.op {
            BinOp::And(_) => {
                if !self.eval(&e.left)?.as_bool()? {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(self.eval(&e.right)?.as_bool()?))
            }
            BinOp::Or(_) => {
                if self.eval(&e.left)?.as_bool()? {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(self.eval(&e.right)?.as_bool()?))
            }
            op if is_compound_assign(op) => {
                let current = self.eval(&e.left)?;
                let rhs = self.eval(&e.right)?;
                let updated = Value::binary(op, current, rhs)?;
                self.assign(&e.left, updated)?;
                Ok(Value::Unit)
            }
            op => {
                let lhs = self.eval(&e.left)?;
                let rhs = self.eval(&e.right)?;
                Ok(Value::binary(op, lhs, rhs)?)
            }
        }
    }

    /// Assign to a name (or list element) bound by this cell.
    fn assign(&mut self, target: &Expr, value: Value) -> Flow<()> {
        match target {
            Expr::Paren(p) => self.assign(&p.expr, value),
            Expr::Path(p) if p.qself.is_none() && p.path.get_ident().is_some() => {
                let name = p.path.get_ident().map(|i| i.to_string()).unwrap_or_default();
                if let Some(slot) = self.local_mut(&name) {
                    *slot = value;
                    return Ok(());
                }
                if self.globals.contains(&name) {
                    Err(ExecError::name(format!(
                        "cannot assign to `{name}`: it is defined by another cell"
                    ))
                    .into())
                } else {
                    Err(ExecError::name(format!("name `{name}` is not defined")).into())
                }
            }
            Expr::Index(ix) => {
                let index = self.eval(&ix.index)?.as_int()?;
                let Expr::Path(base) = &*ix.expr else {
                    return Err(ExecError::unsupported("invalid assignment target").into());
                };
                let name = base
                    .path
                    .get_ident()
                    .map(|i| i.to_string())
                    .unwrap_or_default();
                match self.local_mut(&name) {
                    Some(Value::List(items)) => {
                        let len = items.len();
                        let slot = usize::try_from(index)
                            .ok()
                            .and_then(|i| items.get_mut(i))
                            .ok_or_else(|| {
                                ExecError::index(format!(
                                    "index {index} out of range for length {len}"
                                ))
                            })?;
                        *slot = value;
                        Ok(())
                    }
                    Some(other) => Err(ExecError::type_error(format!(
                        "cannot assign into {}",
                        other.type_name()
                    ))
                    .into()),
                    None => Err(ExecError::name(format!(
                        "cannot assign to `{name}`: not bound by this cell"
                    ))
                    .into()),
                }
            }
            _ => Err(ExecError::unsupported("invalid assignment target").into()),
        }
    }

    /// Bind an irrefutable pattern in the innermost scope.
    fn bind_pattern(&mut self, pat: &Pat, value: Value) -> Result<(), ExecError> {
        match pat {
            Pat::Ident(p) if p.subpat.is_none() => {
                self.define(p.ident.to_string(), value);
                Ok(())
            }
            Pat::Type(p) => self.bind_pattern(&p.pat, value),
            Pat::Paren(p) => self.bind_pattern(&p.pat, value),
            Pat::Reference(p) => self.bind_pattern(&p.pat, value),
            Pat::Wild(_) => Ok(()),
            Pat::Tuple(p) => self.bind_elems(p.elems.iter(), value),
            Pat::Slice(p) => self.bind_elems(p.elems.iter(), value),
            other => Err(ExecError::unsupported(format!(
                "unsupported pattern `{}`",
                other.to_token_stream()
            ))),
        }
    }

    fn bind_elems<'p>(
        &mut self,
        pats: impl ExactSizeIterator<Item = &'p Pat>,
        value: Value,
    ) -> Result<(), ExecError> {
        let items = value.into_items()?;
        if items.len() != pats.len() {
            return Err(ExecError::type_error(format!(
                "expected {} elements, found {}",
                pats.len(),
                items.len()
            )));
        }
        for (pat, item) in pats.zip(items) {
            self.bind_pattern(pat, item)?;
        }
        Ok(())
    }

    /// Test a refutable pattern, collecting bindings on success.
    fn match_pattern(
        &mut self,
        pat: &Pat,
        value: &Value,
        bindings: &mut Vec<(String, Value)>,
    ) -> Flow<bool> {
        match pat {
            Pat::Wild(_) => Ok(true),
            Pat::Ident(p) => {
                if let Some((_, sub)) = &p.subpat {
                    if !self.match_pattern(sub, value, bindings)? {
                        return Ok(false);
                    }
                }
                bindings.push((p.ident.to_string(), value.clone()));
                Ok(true)
            }
            Pat::Lit(lit) => Ok(lit_value(&lit.lit)?.loose_eq(value)),
            Pat::Range(range) => {
                let (start, end, inclusive) = self.range_bounds(range)?;
                let v = value.as_int()?;
                let above = start.is_none_or(|s| v >= s);
                let below = match end {
                    Some(e) if inclusive => v <= e,
                    Some(e) => v < e,
                    None => true,
                };
                Ok(above && below)
            }
            Pat::Or(p) => {
                for case in &p.cases {
                    let mut case_bindings = Vec::new();
                    if self.match_pattern(case, value, &mut case_bindings)? {
                        bindings.extend(case_bindings);
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Pat::Tuple(p) => {
                let items = match value {
                    Value::Tuple(items) | Value::List(items) => items,
                    _ => return Ok(false),
                };
                if items.len() != p.elems.len() {
                    return Ok(false);
                }
                for (pat, item) in p.elems.iter().zip(items) {
                    if !self.match_pattern(pat, item, bindings)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Pat::Paren(p) => self.match_pattern(&p.pat, value, bindings),
            other => Err(ExecError::unsupported(format!(
                "unsupported pattern `{}`",
                other.to_token_stream()
            ))
            .into()),
        }
    }

    /// Evaluate an `if`/`while` condition. `Some(bindings)` means the branch is taken.
    fn eval_condition(&mut self, cond: &Expr) -> Flow<Option<Vec<(String, Value)>>> {
        if let Expr::Let(l) = cond {
            let value = self.eval(&l.expr)?;
            let mut bindings = Vec::new();
            let matched = self.match_pattern(&l.pat, &value, &mut bindings)?;
            return Ok(matched.then_some(bindings));
        }
        Ok(self.eval(cond)?.as_bool()?.then(Vec::new))
    }

    fn eval_if(&mut self, e: &ExprIf) -> Flow<Value> {
        match self.eval_condition(&e.cond)? {
            Some(bindings) => self.in_scope(bindings, |this| this.eval_block(&e.then_branch)),
            None => match &e.else_branch {
                Some((_, otherwise)) => self.eval(otherwise),
                None => Ok(Value::Unit),
            },
        }
    }

    fn eval_match(&mut self, e: &ExprMatch) -> Flow<Value> {
        let value = self.eval(&e.expr)?;
        for arm in &e.arms {
            let mut bindings = Vec::new();
            if !self.match_pattern(&arm.pat, &value, &mut bindings)? {
                continue;
            }
            self.scopes.push(bindings.into_iter().collect());
            let guard = match &arm.guard {
                Some((_, guard)) => self
                    .eval(guard)
                    .and_then(|v| v.as_bool().map_err(Unwind::from)),
                None => Ok(true),
            };
            let result = match guard {
                Ok(true) => Some(self.eval(&arm.body)),
                Ok(false) => None,
                Err(e) => Some(Err(e)),
            };
            self.scopes.pop();
            if let Some(result) = result {
                return result;
            }
        }
        Err(ExecError::panic(format!("no match arm matches {}", value.debug_repr())).into())
    }

    fn eval_loop(&mut self, e: &ExprLoop) -> Flow<Value> {
        loop {
            self.check_abort()?;
            match self.eval_block(&e.body) {
                Ok(_) | Err(Unwind::Continue) => {}
                Err(Unwind::Break(value)) => return Ok(value),
                Err(err) => return Err(err),
            }
        }
    }

    fn eval_while(&mut self, e: &ExprWhile) -> Flow<Value> {
        loop {
            self.check_abort()?;
            let Some(bindings) = self.eval_condition(&e.cond)? else {
                break;
            };
            match self.in_scope(bindings, |this| this.eval_block(&e.body)) {
                Ok(_) | Err(Unwind::Continue) => {}
                Err(Unwind::Break(_)) => break,
                Err(err) => return Err(err),
            }
        }
        Ok(Value::Unit)
    }

    fn eval_for(&mut self, e: &ExprForLoop) -> Flow<Value> {
        // Integer ranges are walked lazily so `for i in 0..` can run until interrupted.
        if let Expr::Range(range) = &*e.expr {
            let (start, end, inclusive) = self.range_bounds(range)?;
            let Some(mut i) = start else {
                return Err(ExecError::unsupported("cannot iterate a range without a start").into());
            };
            loop {
                match end {
                    Some(end) if inclusive && i > end => break,
                    Some(end) if !inclusive && i >= end => break,
                    _ => {}
                }
                if !self.run_iteration(e, Value::Int(i))? {
                    break;
                }
                match i.checked_add(1) {
                    Some(next) => i = next,
                    None => break,
                }
            }
            return Ok(Value::Unit);
        }

        let items = self.eval(&e.expr)?.into_items()?;
        for item in items {
            if !self.run_iteration(e, item)? {
                break;
            }
        }
        Ok(Value::Unit)
    }

    /// Run one loop body. Returns `false` when the loop should stop.
    fn run_iteration(&mut self, e: &ExprForLoop, item: Value) -> Flow<bool> {
        self.check_abort()?;
        self.scopes.push(FxHashMap::default());
        let result = self
            .bind_pattern(&e.pat, item)
            .map_err(Unwind::from)
            .and_then(|()| self.eval_block(&e.body));
        self.scopes.pop();
        match result {
            Ok(_) | Err(Unwind::Continue) => Ok(true),
            Err(Unwind::Break(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn range_bounds(&mut self, range: &ExprRange) -> Flow<(Option<i64>, Option<i64>, bool)> {
        let start = match &range.start {
            Some(start) => Some(self.eval(start)?.as_int()?),
            None => None,
        };
        let end = match &range.end {
            Some(end) => Some(self.eval(end)?.as_int()?),
            None => None,
        };
        Ok((start, end, matches!(range.limits, RangeLimits::Closed(_))))
    }

    fn materialize_range(&mut self, range: &ExprRange) -> Flow<Value> {
        let (Some(start), Some(end), inclusive) = self.range_bounds(range)? else {
            return Err(ExecError::unsupported("only bounded ranges can be used as values").into());
        };
        let end = if inclusive { end.saturating_add(1) } else { end };
        let len = self.checked_len(end.saturating_sub(start).max(0))?;
        Ok(Value::List((0..len as i64).map(|k| Value::Int(start + k)).collect()))
    }

    fn checked_len(&self, len: i64) -> Result<usize, ExecError> {
        let len = usize::try_from(len)
            .map_err(|_| ExecError::arithmetic(format!("invalid length {len}")))?;
        if len > self.config.max_range_len {
            return Err(ExecError::unsupported(format!(
                "sequence of {len} elements exceeds the limit of {}",
                self.config.max_range_len
            )));
        }
        Ok(len)
    }

    fn call_builtin(&mut self, name: &str, args: Vec<Value>) -> Flow<Value> {
        match name {
            "sleep_ms" => {
                let [ms] = <[Value; 1]>::try_from(args)
                    .map_err(|_| ExecError::type_error("`sleep_ms` takes 1 argument"))?;
                self.sleep(ms.as_int()?.max(0) as u64)?;
                Ok(Value::Unit)
            }
            "min" | "max" => {
                let [lhs, rhs] = <[Value; 2]>::try_from(args)
                    .map_err(|_| ExecError::type_error(format!("`{name}` takes 2 arguments")))?;
                Ok(lhs.call_method(name, vec![rhs])?)
            }
            other => Err(ExecError::name(format!("function `{other}` is not defined")).into()),
        }
    }

    fn sleep(&self, ms: u64) -> Result<(), ExecError> {
        let deadline = Instant::now() + Duration::from_millis(ms);
        loop {
            self.check_abort()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep(SLEEP_POLL.min(deadline - now));
        }
    }

    fn eval_macro(&mut self, mac: &Macro) -> Flow<Value> {
        let name = mac
            .path
            .segments
            .last()
            .map(|s| s.ident.to_string())
            .unwrap_or_default();

        match name.as_str() {
            "println" | "print" | "eprintln" | "eprint" => {
                let mut text = if mac.tokens.is_empty() {
                    String::new()
                } else {
                    self.format_macro(mac)?
                };
                if name.ends_with("ln") {
                    text.push('\n');
                }
                self.write_stdout(&text);
                Ok(Value::Unit)
            }
            "format" => Ok(Value::Str(self.format_macro(mac)?)),
            "panic" => {
                let message = if mac.tokens.is_empty() {
                    "explicit panic".to_string()
                } else {
                    self.format_macro(mac)?
                };
                Err(ExecError::panic(message).into())
            }
            "vec" => {
                let tokens = &mac.tokens;
                let array: Expr = syn::parse2(quote::quote!([#tokens]))
                    .map_err(|e| ExecError::syntax(&e))?;
                self.eval(&array)
            }
            "assert" => {
                let args = macro_args(mac)?;
                let Some((cond, rest)) = args.split_first() else {
                    return Err(ExecError::type_error("`assert!` needs a condition").into());
                };
                if self.eval(cond)?.as_bool()? {
                    return Ok(Value::Unit);
                }
                let message = if rest.is_empty() {
                    format!("assertion failed: {}", cond.to_token_stream())
                } else {
                    self.format_args(rest)?
                };
                Err(ExecError::panic(message).into())
            }
            "assert_eq" | "assert_ne" => {
                let args = macro_args(mac)?;
                if args.len() < 2 {
                    let message = format!("`{name}!` needs two operands");
                    return Err(ExecError::type_error(message).into());
                }
                let left = self.eval(&args[0])?;
                let right = self.eval(&args[1])?;
                let expect_equal = name == "assert_eq";
                if left.loose_eq(&right) == expect_equal {
                    return Ok(Value::Unit);
                }
                let op = if expect_equal { "==" } else { "!=" };
                let mut message = format!(
                    "assertion `left {op} right` failed\n  left: {}\n right: {}",
                    left.debug_repr(),
                    right.debug_repr()
                );
                if args.len() > 2 {
                    message = format!("{}: {message}", self.format_args(&args[2..])?);
                }
                Err(ExecError::panic(message).into())
            }
            other => {
                let message = format!("macro `{other}!` is not supported");
                Err(ExecError::unsupported(message).into())
            }
        }
    }

    fn format_macro(&mut self, mac: &Macro) -> Flow<String> {
        let args = macro_args(mac)?;
        self.format_args(&args)
    }

    fn format_args(&mut self, args: &[Expr]) -> Flow<String> {
        let Some((template, rest)) = args.split_first() else {
            return Err(ExecError::type_error("missing format string").into());
        };
        let Expr::Lit(syn::ExprLit {
            lit: Lit::Str(template),
            ..
        }) = template
        else {
            return Err(ExecError::unsupported("format argument must be a string literal").into());
        };
        let pieces = format::parse(&template.value())?;

        let mut positional = Vec::new();
        let mut named = FxHashMap::default();
        for arg in rest {
            match named_arg(arg) {
                Some((name, expr)) => {
                    let value = self.eval(expr)?;
                    named.insert(name, value);
                }
                None => positional.push(self.eval(arg)?),
            }
        }

        let rendered = format::render(&pieces, &positional, |name| match named.get(name) {
            Some(value) => Ok(value.clone()),
            None => self.lookup(name),
        })?;
        Ok(rendered)
    }

    fn write_stdout(&mut self, text: &str) {
        if self.stdout_truncated {
            return;
        }
        let remaining = self.config.max_stdout_bytes.saturating_sub(self.stdout.len());
        if text.len() <= remaining {
            self.stdout.push_str(text);
            return;
        }
        let mut cut = remaining;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        self.stdout.push_str(&text[..cut]);
        self.stdout.push_str("\n[output truncated]\n");
        self.stdout_truncated = true;
    }
}

/// Attach a source line to an error unwinding out of `span`.
fn at(unwind: Unwind, span: proc_macro2::Span) -> Unwind {
    match unwind {
        Unwind::Error(e) => Unwind::Error(e.at(span)),
        other => other,
    }
}

fn unsupported_expr(expr: &Expr) -> Unwind {
    ExecError::unsupported(format!("unsupported expression `{}`", expr.to_token_stream())).into()
}

fn macro_args(mac: &Macro) -> Result<Vec<Expr>, ExecError> {
    mac.parse_body_with(Punctuated::<Expr, Token![,]>::parse_terminated)
        .map(|args| args.into_iter().collect())
        .map_err(|e| ExecError::syntax(&e))
}

/// `name = expr` inside a format macro.
fn named_arg(arg: &Expr) -> Option<(String, &Expr)> {
    let Expr::Assign(assign) = arg else {
        return None;
    };
    let Expr::Path(path) = &*assign.left else {
        return None;
    };
    let ident = path.path.get_ident()?;
    Some((ident.to_string(), &assign.right))
}

fn is_compound_assign(op: &BinOp) -> bool {
    matches!(
        op,
        BinOp::AddAssign(_)
            | BinOp::SubAssign(_)
            | BinOp::MulAssign(_)
            | BinOp::DivAssign(_)
            | BinOp::RemAssign(_)
            | BinOp::BitXorAssign(_)
            | BinOp::BitAndAssign(_)
            | BinOp::BitOrAssign(_)
            | BinOp::ShlAssign(_)
            | BinOp::ShrAssign(_)
    )
}

fn lit_value(lit: &Lit) -> Result<Value, ExecError> {
    match lit {
        Lit::Str(s) => Ok(Value::Str(s.value())),
        Lit::Char(c) => Ok(Value::Str(c.value().to_string())),
        Lit::Int(i) => i
            .base10_parse::<i64>()
            .map(Value::Int)
            .map_err(|e| ExecError::syntax(&e)),
        Lit::Float(f) => f
            .base10_parse::<f64>()
            .map(Value::Float)
            .map_err(|e| ExecError::syntax(&e)),
        Lit::Bool(b) => Ok(Value::Bool(b.value)),
        other => Err(ExecError::unsupported(format!(
            "unsupported literal `{}`",
            other.to_token_stream()
        ))),
    }
}

fn unary(op: &UnOp, value: Value) -> Result<Value, ExecError> {
    match (op, value) {
        (UnOp::Neg(_), Value::Int(i)) => i
            .checked_neg()
            .map(Value::Int)
            .ok_or_else(|| ExecError::arithmetic("attempt to negate with overflow")),
        (UnOp::Neg(_), Value::Float(f)) => Ok(Value::Float(-f)),
        (UnOp::Not(_), Value::Bool(b)) => Ok(Value::Bool(!b)),
        (UnOp::Not(_), Value::Int(i)) => Ok(Value::Int(!i)),
        (UnOp::Deref(_), value) => Ok(value),
        (op, value) => Err(ExecError::type_error(format!(
            "cannot apply unary `{}` to {}",
            op.to_token_stream(),
            value.type_name()
        ))),
    }
}

fn cast(value: Value, ty: &str) -> Result<Value, ExecError> {
    match (ty, value) {
        ("f64" | "f32", Value::Int(i)) => Ok(Value::Float(i as f64)),
        ("f64" | "f32", Value::Float(f)) => Ok(Value::Float(f)),
        (
            "i64" | "i32" | "i16" | "i8" | "u64" | "u32" | "u16" | "u8" | "usize" | "isize",
            value,
        ) => match value {
            Value::Int(i) => Ok(Value::Int(i)),
            Value::Float(f) => Ok(Value::Int(f as i64)),
            Value::Bool(b) => Ok(Value::Int(i64::from(b))),
            other => Err(ExecError::type_error(format!(
                "cannot cast {} as {ty}",
                other.type_name()
            ))),
        },
        (ty, other) => Err(ExecError::type_error(format!(
            "cannot cast {} as {ty}",
            other.type_name()
        ))),
    }
}
