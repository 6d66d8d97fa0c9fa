//! Static analysis of cell source: which names a cell binds and which it reads.

use std::collections::BTreeSet;

use rustc_hash::FxHashSet;
use syn::punctuated::Punctuated;
use syn::visit::{self, Visit};
use syn::{
    Expr, ExprClosure, ExprForLoop, ExprIf, ExprPath, ExprWhile, Lit, Local, Macro, Pat, Token,
};

use crate::runtime::{ExecError, format, parse_cell};

/// Names bound at the top level of a cell and free names it reads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Analysis {
    pub defs: BTreeSet<String>,
    pub refs: BTreeSet<String>,
}

/// Analyze cell source.
///
/// A name counts as a ref when it is read before any binding of it is in
/// scope, so `let x = x + 1;` both reads and defines `x`.
pub fn analyze(source: &str) -> Result<Analysis, ExecError> {
    let block = parse_cell(source)?;
    let mut visitor = ScopeVisitor {
        scopes: vec![FxHashSet::default()],
        refs: BTreeSet::new(),
    };
    for stmt in &block.stmts {
        visitor.visit_stmt(stmt);
    }
    let defs = visitor
        .scopes
        .into_iter()
        .next()
        .unwrap_or_default()
        .into_iter()
        .collect();
    Ok(Analysis {
        defs,
        refs: visitor.refs,
    })
}

struct ScopeVisitor {
    scopes: Vec<FxHashSet<String>>,
    refs: BTreeSet<String>,
}

impl ScopeVisitor {
    fn is_bound(&self, name: &str) -> bool {
        self.scopes.iter().any(|scope| scope.contains(name))
    }

    fn read(&mut self, name: String) {
        if !self.is_bound(&name) {
            self.refs.insert(name);
        }
    }

    fn bind(&mut self, pat: &Pat) {
        let mut names = Vec::new();
        pattern_names(pat, &mut names);
        if let Some(scope) = self.scopes.last_mut() {
            scope.extend(names);
        }
    }

    fn scoped(&mut self, f: impl FnOnce(&mut Self)) {
        self.scopes.push(FxHashSet::default());
        f(self);
        self.scopes.pop();
    }
}

impl<'ast> Visit<'ast> for ScopeVisitor {
    fn visit_block(&mut self, block: &'ast syn::Block) {
        self.scoped(|this| visit::visit_block(this, block));
    }

    fn visit_local(&mut self, local: &'ast Local) {
        if let Some(init) = &local.init {
            self.visit_expr(&init.expr);
            if let Some((_, diverge)) = &init.diverge {
                self.visit_expr(diverge);
            }
        }
        self.bind(&local.pat);
    }

    fn visit_expr_path(&mut self, path: &'ast ExprPath) {
        if path.qself.is_none() {
            if let Some(ident) = path.path.get_ident() {
                self.read(ident.to_string());
            }
        }
    }

    fn visit_expr_call(&mut self, call: &'ast syn::ExprCall) {
        // Built-in callees are not variables.
        if !matches!(&*call.func, Expr::Path(_)) {
            self.visit_expr(&call.func);
        }
        for arg in &call.args {
            self.visit_expr(arg);
        }
    }

    fn visit_expr_if(&mut self, expr: &'ast ExprIf) {
        match &*expr.cond {
            Expr::Let(cond) => {
                self.visit_expr(&cond.expr);
                self.scoped(|this| {
                    this.bind(&cond.pat);
                    this.visit_block(&expr.then_branch);
                });
            }
            cond => {
                self.visit_expr(cond);
                self.visit_block(&expr.then_branch);
            }
        }
        if let Some((_, otherwise)) = &expr.else_branch {
            self.visit_expr(otherwise);
        }
    }

    fn visit_expr_while(&mut self, expr: &'ast ExprWhile) {
        match &*expr.cond {
            Expr::Let(cond) => {
                self.visit_expr(&cond.expr);
                self.scoped(|this| {
                    this.bind(&cond.pat);
                    this.visit_block(&expr.body);
                });
            }
            cond => {
                self.visit_expr(cond);
                self.visit_block(&expr.body);
            }
        }
    }

    fn visit_expr_for_loop(&mut self, expr: &'ast ExprForLoop) {
        self.visit_expr(&expr.expr);
        self.scoped(|this| {
            this.bind(&expr.pat);
            this.visit_block(&expr.body);
        });
    }

    fn visit_arm(&mut self, arm: &'ast syn::Arm) {
        self.scoped(|this| {
            this.bind(&arm.pat);
            if let Some((_, guard)) = &arm.guard {
                this.visit_expr(guard);
            }
            this.visit_expr(&arm.body);
        });
    }

    fn visit_expr_closure(&mut self, closure: &'ast ExprClosure) {
        self.scoped(|this| {
            for input in &closure.inputs {
                this.bind(input);
            }
            this.visit_expr(&closure.body);
        });
    }

    fn visit_macro(&mut self, mac: &'ast Macro) {
        let name = mac
            .path
            .segments
            .last()
            .map(|s| s.ident.to_string())
            .unwrap_or_default();

        if name == "vec" {
            let tokens = &mac.tokens;
            if let Ok(array) = syn::parse2::<Expr>(quote::quote!([#tokens])) {
                self.visit_expr(&array);
            }
            return;
        }

        let Ok(args) = mac.parse_body_with(Punctuated::<Expr, Token![,]>::parse_terminated) else {
            return;
        };
        let template_at = match name.as_str() {
            "println" | "print" | "eprintln" | "eprint" | "format" | "panic" => Some(0),
            "assert" => Some(1),
            "assert_eq" | "assert_ne" => Some(2),
            _ => None,
        };
        let named: FxHashSet<String> = args.iter().filter_map(named_arg).collect();

        for (i, arg) in args.iter().enumerate() {
            match arg {
                Expr::Lit(syn::ExprLit {
                    lit: Lit::Str(template),
                    ..
                }) if template_at == Some(i) => {
                    for captured in format::captured_names(&template.value()) {
                        if !named.contains(&captured) {
                            self.read(captured);
                        }
                    }
                }
                // `name = expr` only reads the right-hand side.
                Expr::Assign(assign) if template_at.is_some_and(|t| i > t) => {
                    self.visit_expr(&assign.right)
                }
                other => self.visit_expr(other),
            }
        }
    }
}

fn named_arg(arg: &Expr) -> Option<String> {
    let Expr::Assign(assign) = arg else {
        return None;
    };
    let Expr::Path(path) = &*assign.left else {
        return None;
    };
    path.path.get_ident().map(|ident| ident.to_string())
}

/// Identifiers bound by a pattern.
fn pattern_names(pat: &Pat, out: &mut Vec<String>) {
    match pat {
        Pat::Ident(p) => {
            out.push(p.ident.to_string());
            if let Some((_, sub)) = &p.subpat {
                pattern_names(sub, out);
            }
        }
        Pat::Type(p) => pattern_names(&p.pat, out),
        Pat::Paren(p) => pattern_names(&p.pat, out),
        Pat::Reference(p) => pattern_names(&p.pat, out),
        Pat::Tuple(p) => p.elems.iter().for_each(|pat| pattern_names(pat, out)),
        Pat::Slice(p) => p.elems.iter().for_each(|pat| pattern_names(pat, out)),
        Pat::TupleStruct(p) => p.elems.iter().for_each(|pat| pattern_names(pat, out)),
        Pat::Or(p) => p.cases.iter().for_each(|pat| pattern_names(pat, out)),
        _ => {}
    }
}
