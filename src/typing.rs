// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Constraint-based type checker.
//!
//! Every application contributes one `arg < param` constraint per argument.
//! Constraints are simplified eagerly; a constraint whose parameter side is
//! flexible (`f T`) and still mentions variables is kept as a residual and
//! revisited whenever new bindings appear. A constraint that simplifies to
//! absurdity aborts checking with `RE_TYPE_ERROR`.

use crate::ast::*;
use crate::builtins;
use crate::error::RuleError;
use crate::parser::SymbolTable;
use crate::types::*;
use crate::*;

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{bail, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sat {
    Taut,
    Cont,
    Absurd,
}

impl Sat {
    fn and(self, other: Sat) -> Sat {
        match (self, other) {
            (Sat::Absurd, _) | (_, Sat::Absurd) => Sat::Absurd,
            (Sat::Cont, _) | (_, Sat::Cont) => Sat::Cont,
            _ => Sat::Taut,
        }
    }
}

#[derive(Debug, Clone)]
struct Constraint {
    a: ExprType,
    b: ExprType,
    node: NodeId,
}

/// Signature used for functions the checker knows nothing about. They may be
/// rules defined in another rule base or host functions.
fn unknown_signature() -> ExprType {
    ExprType::Func {
        params: vec![ExprType::Io(IoTag::Dynamic, Box::new(ExprType::Dynamic))],
        ret: Box::new(ExprType::Dynamic),
        arity: Arity::Star,
    }
}

/// Result type of a rule's `: type` annotation.
fn annotated_result(ty: &ExprType) -> ExprType {
    match ty {
        ExprType::Func { params, ret, .. } if params.is_empty() => (**ret).clone(),
        ExprType::Func { ret, .. } => (**ret).clone(),
        t => t.clone(),
    }
}

fn split_base(a: &ExprType, b: &ExprType, flex: bool) -> bool {
    a == b || (flex && *a == ExprType::Int && *b == ExprType::Double)
}

/// Keep the bounds on each side that have a compatible partner on the other.
fn do_narrow(
    l: &[ExprType],
    r: &[ExprType],
    flex: bool,
) -> (Vec<ExprType>, Vec<ExprType>) {
    let nl = l
        .iter()
        .filter(|a| r.iter().any(|b| split_base(a, b, flex)))
        .cloned()
        .collect();
    let nr = r
        .iter()
        .filter(|b| l.iter().any(|a| split_base(a, b, flex)))
        .cloned()
        .collect();
    (nl, nr)
}

fn bounds_or_all(bounds: &[ExprType]) -> Vec<ExprType> {
    if bounds.is_empty() {
        ExprType::all_base()
    } else {
        bounds.to_vec()
    }
}

fn is_free_var(t: &ExprType) -> bool {
    matches!(t, ExprType::Var { bounds, .. } if bounds.is_empty())
}

pub struct TypeChecker<'a> {
    ast: &'a mut Ast,
    symbols: &'a SymbolTable,
    rule_sigs: BTreeMap<Rc<str>, ExprType>,
    signatures: BTreeMap<&'static str, ExprType>,

    env: BTreeMap<u32, ExprType>,
    var_types: BTreeMap<Rc<str>, ExprType>,
    constraints: Vec<Constraint>,
    visited: Vec<NodeId>,
    next_var: u32,
}

impl<'a> TypeChecker<'a> {
    pub fn new(ast: &'a mut Ast, symbols: &'a SymbolTable, rules: &RuleSet) -> Self {
        let rule_sigs = Self::rule_signatures(ast, rules);
        Self {
            ast,
            symbols,
            rule_sigs,
            signatures: BTreeMap::new(),
            env: BTreeMap::new(),
            var_types: BTreeMap::new(),
            constraints: vec![],
            visited: vec![],
            next_var: 0,
        }
    }

    // Rules whose head carries type annotations get a signature at call
    // sites. Their parameters are read and written back.
    fn rule_signatures(ast: &Ast, rules: &RuleSet) -> BTreeMap<Rc<str>, ExprType> {
        let mut sigs = BTreeMap::new();
        for desc in rules.iter() {
            let (name, params, ret) = match &ast[desc.node] {
                Node::Rule {
                    name, params, ret, ..
                }
                | Node::FuncRule {
                    name, params, ret, ..
                } => (name, params, ret),
                _ => continue,
            };
            if sigs.contains_key(name) {
                continue;
            }
            let param_types: Vec<Option<ExprType>> = params
                .iter()
                .map(|p| match &ast[*p] {
                    Node::Param { ty, .. } => ty.clone(),
                    _ => None,
                })
                .collect();
            if ret.is_none() && param_types.iter().all(|t| t.is_none()) {
                continue;
            }
            let ret = match ret.map(|r| &ast[r]) {
                Some(Node::TypeAnnot { ty, .. }) => annotated_result(ty),
                _ => ExprType::Dynamic,
            };
            let params = param_types
                .into_iter()
                .map(|t| ExprType::Io(IoTag::Dynamic, Box::new(t.unwrap_or(ExprType::Dynamic))))
                .collect();
            sigs.insert(
                name.clone(),
                ExprType::Func {
                    params,
                    ret: Box::new(ret),
                    arity: Arity::Once,
                },
            );
        }
        sigs
    }

    fn reset(&mut self) {
        self.env.clear();
        self.var_types.clear();
        self.constraints.clear();
        self.visited.clear();
    }

    fn fresh(&mut self) -> ExprType {
        self.next_var += 1;
        ExprType::var(self.next_var)
    }

    fn fresh_bounded(&mut self, bounds: Vec<ExprType>) -> ExprType {
        self.next_var += 1;
        ExprType::Var {
            id: self.next_var,
            bounds,
        }
    }

    fn instantiate(&mut self, t: &ExprType) -> ExprType {
        let next = &mut self.next_var;
        t.instantiate(&mut || {
            *next += 1;
            *next
        })
    }

    fn type_error(&self, node: NodeId, msg: &str) -> anyhow::Error {
        RuleError::Type(self.ast.span(node).message("error", msg)).into()
    }

    /// Instantiated signature of `name`.
    fn signature_of(&mut self, name: &str) -> Result<ExprType> {
        let t = if let Some(b) = builtins::BUILTINS.get(name) {
            match self.signatures.get(b.signature) {
                Some(t) => t.clone(),
                None => {
                    let t = parse_signature(b.signature)?;
                    self.signatures.insert(b.signature, t.clone());
                    t
                }
            }
        } else if let Some(t) = self.symbols.constructors.get(name) {
            t.clone()
        } else if let Some(t) = self.symbols.externs.get(name) {
            t.clone()
        } else if let Some(t) = self.rule_sigs.get(name) {
            t.clone()
        } else {
            unknown_signature()
        };
        Ok(self.instantiate(&t))
    }

    // ---------------------------------------------------------------
    // Solver
    // ---------------------------------------------------------------

    fn deref(&self, t: &ExprType) -> ExprType {
        let mut t = t.clone();
        while let ExprType::Var { id, .. } = &t {
            match self.env.get(id) {
                Some(bound) => t = bound.clone(),
                None => break,
            }
        }
        t
    }

    /// Substitute every bound variable, recursively.
    pub fn resolve(&self, t: &ExprType) -> ExprType {
        use ExprType::*;
        match self.deref(t) {
            Cons { name, args } => Cons {
                name,
                args: args.iter().map(|a| self.resolve(a)).collect(),
            },
            Tuple(elems) => Tuple(elems.iter().map(|a| self.resolve(a)).collect()),
            Func { params, ret, arity } => Func {
                params: params.iter().map(|a| self.resolve(a)).collect(),
                ret: Box::new(self.resolve(&ret)),
                arity,
            },
            Flex(t) => Flex(Box::new(self.resolve(&t))),
            Fixed(a, b) => Fixed(Box::new(self.resolve(&a)), Box::new(self.resolve(&b))),
            Io(tag, t) => Io(tag, Box::new(self.resolve(&t))),
            t => t,
        }
    }

    fn bind(&mut self, var: &ExprType, t: ExprType) {
        if let ExprType::Var { id, .. } = var {
            self.env.insert(*id, t);
        }
    }

    fn simplify(&mut self) -> Result<()> {
        loop {
            let before = self.env.len();
            let pending = core::mem::take(&mut self.constraints);
            let mut residual = vec![];
            for c in pending {
                if self.simplify_locally(&c.a, &c.b, false, c.node, &mut residual) == Sat::Absurd
                {
                    let msg = format!(
                        "unsolvable typing constraint {} < {}",
                        self.resolve(&c.a),
                        self.resolve(&c.b)
                    );
                    return Err(self.type_error(c.node, &msg));
                }
            }
            self.constraints = residual;
            if self.env.len() == before {
                return Ok(());
            }
        }
    }

    fn simplify_locally(
        &mut self,
        a: &ExprType,
        b: &ExprType,
        flex: bool,
        node: NodeId,
        residual: &mut Vec<Constraint>,
    ) -> Sat {
        use ExprType::*;
        let (b, flex) = match b.payload() {
            Flex(t) => (t.as_ref(), true),
            Fixed(t, _) => (t.as_ref(), flex),
            t => (t, flex),
        };
        let a = self.deref(a.payload());
        let b = self.deref(b);

        match (&a, &b) {
            (Dynamic, _) | (_, Dynamic) => Sat::Taut,
            _ if a.is_base() && b.is_base() => {
                if split_base(&a, &b, flex) {
                    Sat::Taut
                } else {
                    Sat::Absurd
                }
            }
            (Var { .. }, Var { .. }) => {
                self.narrow(a.clone(), b.clone(), flex, node, residual)
            }
            (Var { .. }, t) if t.is_base() => {
                self.simplify_l(a.clone(), b.clone(), flex, node, residual)
            }
            (t, Var { .. }) if t.is_base() => {
                self.simplify_r(a.clone(), b.clone(), flex, node, residual)
            }
            (Var { .. }, Cons { .. } | Tuple(_)) => {
                self.split_var(&a, &b, true, flex, node, residual)
            }
            (Cons { .. } | Tuple(_), Var { .. }) => {
                self.split_var(&b, &a, false, flex, node, residual)
            }
            (Cons { .. }, Cons { .. }) | (Tuple(_), Tuple(_)) => {
                self.split_composite(&a, &b, flex, node, residual)
            }
            (
                Func {
                    params: pa, ret: ra, ..
                },
                Func {
                    params: pb, ret: rb, ..
                },
            ) if pa.len() == pb.len() => {
                let mut sat = Sat::Taut;
                for (x, y) in pa.iter().zip(pb.iter()) {
                    sat = sat.and(self.simplify_locally(x, y, flex, node, residual));
                }
                sat.and(self.simplify_locally(ra, rb, flex, node, residual))
            }
            _ if a == b => Sat::Taut,
            _ => Sat::Absurd,
        }
    }

    fn narrow(
        &mut self,
        a: ExprType,
        b: ExprType,
        flex: bool,
        node: NodeId,
        residual: &mut Vec<Constraint>,
    ) -> Sat {
        let (
            ExprType::Var {
                id: ia, bounds: ba, ..
            },
            ExprType::Var {
                id: ib, bounds: bb, ..
            },
        ) = (&a, &b)
        else {
            return Sat::Absurd;
        };
        if ia == ib {
            return Sat::Taut;
        }
        if !ba.is_empty() && !bb.is_empty() {
            let (nl, nr) = do_narrow(ba, bb, flex);
            if nl.is_empty() || nr.is_empty() {
                return Sat::Absurd;
            }
            let an = self.create_type(&a, nl);
            let bn = self.create_type(&b, nr);
            self.create_simple(an, bn, flex, node, residual)
        } else {
            self.create_simple(a, b, flex, node, residual)
        }
    }

    // Variable on the left, base type on the right.
    fn simplify_l(
        &mut self,
        a: ExprType,
        b: ExprType,
        flex: bool,
        node: NodeId,
        residual: &mut Vec<Constraint>,
    ) -> Sat {
        let ExprType::Var { bounds, .. } = &a else {
            return Sat::Absurd;
        };
        let nl: Vec<ExprType> = bounds_or_all(bounds)
            .into_iter()
            .filter(|l| split_base(l, &b, flex))
            .collect();
        if nl.is_empty() {
            return Sat::Absurd;
        }
        let an = self.create_type(&a, nl);
        if an == a {
            return Sat::Taut;
        }
        self.create_simple(an, b, flex, node, residual)
    }

    // Base type on the left, variable on the right.
    fn simplify_r(
        &mut self,
        a: ExprType,
        b: ExprType,
        flex: bool,
        node: NodeId,
        residual: &mut Vec<Constraint>,
    ) -> Sat {
        let ExprType::Var { bounds, .. } = &b else {
            return Sat::Absurd;
        };
        let nr: Vec<ExprType> = bounds_or_all(bounds)
            .into_iter()
            .filter(|r| split_base(&a, r, flex))
            .collect();
        if nr.is_empty() {
            return Sat::Absurd;
        }
        let bn = self.create_type(&b, nr);
        if bn == b {
            return Sat::Taut;
        }
        self.create_simple(a, bn, flex, node, residual)
    }

    /// Restrict variable `t` to the bounds `nc`, binding it when they differ
    /// from its current bounds.
    fn create_type(&mut self, t: &ExprType, nc: Vec<ExprType>) -> ExprType {
        let ExprType::Var { bounds, .. } = t else {
            return t.clone();
        };
        if nc.len() == bounds.len() {
            return t.clone();
        }
        let narrowed = if nc.len() == 1 {
            nc[0].clone()
        } else {
            self.fresh_bounded(nc)
        };
        self.bind(t, narrowed.clone());
        narrowed
    }

    fn create_simple(
        &mut self,
        a: ExprType,
        b: ExprType,
        flex: bool,
        node: NodeId,
        residual: &mut Vec<Constraint>,
    ) -> Sat {
        if a.is_base() && b.is_base() {
            return Sat::Taut;
        }
        if flex {
            residual.push(Constraint {
                a,
                b: ExprType::Flex(Box::new(b)),
                node,
            });
            return Sat::Cont;
        }
        if is_free_var(&a) || b.is_base() {
            self.bind(&a, b);
        } else if is_free_var(&b) || a.is_base() {
            self.bind(&b, a);
        } else {
            self.bind(&a, b);
        }
        Sat::Taut
    }

    fn split_var(
        &mut self,
        var: &ExprType,
        composite: &ExprType,
        var_on_left: bool,
        flex: bool,
        node: NodeId,
        residual: &mut Vec<Constraint>,
    ) -> Sat {
        let ExprType::Var { id, bounds } = var else {
            return Sat::Absurd;
        };
        // A variable restricted to base types cannot stand for a composite.
        if !bounds.is_empty() || self.resolve(composite).occurs(*id) {
            return Sat::Absurd;
        }
        let shape = match composite {
            ExprType::Cons { name, args } => ExprType::Cons {
                name: name.clone(),
                args: args.iter().map(|_| self.fresh()).collect(),
            },
            ExprType::Tuple(elems) => ExprType::Tuple(elems.iter().map(|_| self.fresh()).collect()),
            _ => return Sat::Absurd,
        };
        self.bind(var, shape.clone());
        if var_on_left {
            self.split_composite(&shape, composite, flex, node, residual)
        } else {
            self.split_composite(composite, &shape, flex, node, residual)
        }
    }

    fn split_composite(
        &mut self,
        a: &ExprType,
        b: &ExprType,
        flex: bool,
        node: NodeId,
        residual: &mut Vec<Constraint>,
    ) -> Sat {
        let (xs, ys) = match (a, b) {
            (
                ExprType::Cons { name: na, args: xs },
                ExprType::Cons { name: nb, args: ys },
            ) if na == nb => (xs, ys),
            (ExprType::Tuple(xs), ExprType::Tuple(ys)) => (xs, ys),
            _ => return Sat::Absurd,
        };
        if xs.len() != ys.len() {
            return Sat::Absurd;
        }
        let mut sat = Sat::Taut;
        for (x, y) in xs.iter().zip(ys.iter()) {
            sat = sat.and(self.simplify_locally(x, y, flex, node, residual));
            if sat == Sat::Absurd {
                break;
            }
        }
        sat
    }

    // ---------------------------------------------------------------
    // Constraint generation
    // ---------------------------------------------------------------

    fn is_pattern(&self, id: NodeId) -> bool {
        match &self.ast[id] {
            Node::Var { .. }
            | Node::Int { .. }
            | Node::Double { .. }
            | Node::Bool { .. }
            | Node::Str { .. } => true,
            Node::Tuple { items, .. } => items.iter().all(|i| self.is_pattern(*i)),
            Node::App { func, args, .. } => {
                self.symbols.constructors.contains_key(func)
                    && args.iter().all(|a| self.is_pattern(*a))
            }
            _ => false,
        }
    }

    fn ensure_pattern(&self, id: NodeId) -> Result<()> {
        if !self.is_pattern(id) {
            bail!(self.type_error(id, "expecting a pattern"));
        }
        Ok(())
    }

    fn type_expr(&mut self, id: NodeId) -> Result<ExprType> {
        let node = self.ast[id].clone();
        let t = match &node {
            Node::Int { .. } => ExprType::Int,
            Node::Double { .. } => ExprType::Double,
            Node::Bool { .. } => ExprType::Bool,
            Node::Str { .. } => ExprType::String,
            Node::Path { .. } => ExprType::Path,
            Node::Var {
                name,
                scope: VarScope::Local,
                ..
            } => match self.var_types.get(name) {
                Some(t) => t.clone(),
                None => {
                    let t = self.fresh();
                    self.var_types.insert(name.clone(), t.clone());
                    t
                }
            },
            Node::Var { .. } => ExprType::Dynamic,
            Node::Tuple { items, .. } => {
                let mut elems = vec![];
                for i in items {
                    elems.push(self.type_expr(*i)?);
                }
                ExprType::Tuple(elems)
            }
            Node::Actions { items, .. } => {
                let mut last = ExprType::Int;
                for i in items {
                    last = self.type_expr(*i)?;
                }
                last
            }
            Node::ActionsWithRecovery {
                actions, recovery, ..
            } => {
                let t = self.type_expr(*actions)?;
                self.type_expr(*recovery)?;
                t
            }
            Node::App { func, args, .. } => self.type_app(id, func, args)?,
            Node::Match {
                scrutinee, clauses, ..
            } => self.type_match(*scrutinee, clauses)?,
            Node::Query { conds, .. } => {
                for c in conds {
                    if let Node::QueryCond { alts, .. } = self.ast[*c].clone() {
                        for v in alts.iter().flat_map(|a| a.values.iter()) {
                            self.type_expr(*v)?;
                        }
                    }
                }
                ExprType::Dynamic
            }
            _ => bail!(self.type_error(id, "unexpected declaration in expression")),
        };
        self.ast.set_type(id, t.clone());
        self.visited.push(id);
        Ok(t)
    }

    fn expand_params(
        &self,
        id: NodeId,
        func: &str,
        params: &[ExprType],
        arity: Arity,
        count: usize,
    ) -> Result<Vec<ExprType>> {
        let n = params.len();
        let ok = match arity {
            Arity::Once => count == n,
            Arity::Optional => count + 1 >= n && count <= n,
            Arity::Star => count + 1 >= n,
            Arity::Plus => count >= n,
        };
        if !ok {
            let msg = match arity {
                Arity::Once => format!("`{func}` expects {n} arguments, got {count}"),
                _ => "unsolvable vararg typing constraint".to_string(),
            };
            bail!(self.type_error(id, &msg));
        }
        let mut expanded: Vec<ExprType> = params.iter().take(count).cloned().collect();
        if let Some(last) = params.last() {
            while expanded.len() < count {
                expanded.push(last.clone());
            }
        }
        Ok(expanded)
    }

    fn type_app(&mut self, id: NodeId, func: &Rc<str>, args: &[NodeId]) -> Result<ExprType> {
        match func.as_ref() {
            "foreach" | "foreach2" => return self.type_foreach(id, func, args),
            "assign" | "let" => {
                if let Some(p) = args.first() {
                    self.ensure_pattern(*p)?;
                }
            }
            _ => (),
        }

        let (params, ret, arity) = match self.signature_of(func)? {
            ExprType::Func { params, ret, arity } => (params, ret, arity),
            t => (vec![], Box::new(t), Arity::Once),
        };
        let params = self.expand_params(id, func, &params, arity, args.len())?;

        for (arg, param) in args.iter().zip(params.iter()) {
            let t = self.type_expr(*arg)?;
            let expected = param.payload().clone();
            self.ast.set_coercion(*arg, expected.clone());
            self.constraints.push(Constraint {
                a: t,
                b: expected,
                node: *arg,
            });
            self.simplify()?;
        }

        Ok(match *ret {
            ExprType::Dynamic => self.fresh(),
            t => t,
        })
    }

    fn element_type(&self, t: &ExprType) -> ExprType {
        match self.resolve(t) {
            ExprType::Cons { name, args } if name.as_ref() == LIST && args.len() == 1 => {
                args[0].clone()
            }
            ExprType::String => ExprType::String,
            _ => ExprType::Dynamic,
        }
    }

    // The loop variable takes the element type inside the body only.
    fn type_foreach(&mut self, id: NodeId, func: &str, args: &[NodeId]) -> Result<ExprType> {
        let (var, collection, body) = match (func, args) {
            ("foreach", [var, body @ ..]) => (*var, *var, body),
            ("foreach2", [var, list, body @ ..]) => (*var, *list, body),
            _ => bail!(self.type_error(id, &format!("malformed `{func}`"))),
        };
        let Node::Var {
            name,
            scope: VarScope::Local,
            ..
        } = self.ast[var].clone()
        else {
            bail!(self.type_error(var, "expecting a local variable"));
        };

        let coll = self.type_expr(collection)?;
        let elem = self.element_type(&coll);
        let saved = self.var_types.insert(name.clone(), elem.clone());
        self.ast.set_type(var, elem);
        self.visited.push(var);

        let result = body.iter().try_for_each(|b| self.type_expr(*b).map(|_| ()));
        match saved {
            Some(t) => {
                self.var_types.insert(name, t);
            }
            None => {
                self.var_types.remove(&name);
            }
        }
        result?;
        Ok(ExprType::Int)
    }

    fn type_match(&mut self, scrutinee: NodeId, clauses: &[NodeId]) -> Result<ExprType> {
        let s = self.type_expr(scrutinee)?;
        let result = self.fresh();
        for c in clauses {
            let Node::Clause { pattern, body, .. } = self.ast[*c].clone() else {
                bail!(self.type_error(*c, "expecting a match clause"));
            };
            self.ensure_pattern(pattern)?;
            let p = self.type_expr(pattern)?;
            self.constraints.push(Constraint {
                a: s.clone(),
                b: p,
                node: pattern,
            });
            let b = self.type_expr(body)?;
            self.constraints.push(Constraint {
                a: b,
                b: result.clone(),
                node: body,
            });
            self.simplify()?;
            self.ast.set_type(*c, result.clone());
            self.visited.push(*c);
        }
        Ok(result)
    }

    fn bind_params(&mut self, params: &[NodeId]) {
        for p in params {
            if let Node::Param { name, ty, .. } = self.ast[*p].clone() {
                let t = match ty {
                    Some(t) => self.instantiate(&t),
                    None => self.fresh(),
                };
                self.var_types.insert(name, t.clone());
                self.ast.set_type(*p, t);
                self.visited.push(*p);
            }
        }
    }

    fn ensure_condition(&mut self, cond: NodeId, t: ExprType) -> Result<()> {
        match self.deref(&t) {
            ExprType::Bool | ExprType::Dynamic => Ok(()),
            ExprType::Var { .. } => {
                self.constraints.push(Constraint {
                    a: t,
                    b: ExprType::Bool,
                    node: cond,
                });
                self.simplify()
            }
            other => {
                let msg = format!("unsolvable typing constraint {other} < boolean");
                Err(self.type_error(cond, &msg))
            }
        }
    }

    // Write solved types and coercions back onto the nodes visited.
    fn post_process(&mut self) {
        let visited = core::mem::take(&mut self.visited);
        for id in visited {
            if let Some(t) = self.ast.type_of(id).cloned() {
                let t = self.resolve(&t);
                self.ast.set_type(id, t);
            }
            if let Some(t) = self.ast.coercion(id).cloned() {
                let t = self.resolve(&t);
                self.ast.set_coercion(id, t);
            }
        }
    }

    /// Type-check one relational or function rule.
    pub fn check_rule(&mut self, node: NodeId) -> Result<()> {
        self.reset();
        match self.ast[node].clone() {
            Node::Rule {
                params,
                cond,
                actions,
                recovery,
                ..
            } => {
                self.bind_params(&params);
                let c = self.type_expr(cond)?;
                self.ensure_condition(cond, c)?;
                self.type_expr(actions)?;
                self.type_expr(recovery)?;
            }
            Node::FuncRule {
                params,
                body,
                recovery,
                ret,
                ..
            } => {
                self.bind_params(&params);
                let t = self.type_expr(body)?;
                if let Some(Node::TypeAnnot { ty, .. }) = ret.map(|r| self.ast[r].clone()) {
                    let expected = annotated_result(&ty);
                    let expected = self.instantiate(&expected);
                    self.constraints.push(Constraint {
                        a: t,
                        b: expected,
                        node: body,
                    });
                    self.simplify()?;
                }
                self.type_expr(recovery)?;
            }
            _ => return Ok(()),
        }
        self.simplify()?;
        self.post_process();
        Ok(())
    }

    /// Type-check a free-standing term, such as action text evaluated at
    /// runtime.
    pub fn check_term(&mut self, node: NodeId) -> Result<ExprType> {
        self.reset();
        let t = self.type_expr(node)?;
        self.simplify()?;
        let t = self.resolve(&t);
        self.post_process();
        Ok(t)
    }
}

fn check_redefinitions(ast: &Ast, rules: &RuleSet, symbols: &SymbolTable) -> Result<()> {
    let mut funcs = BTreeSet::new();
    for desc in rules.iter() {
        let (name, is_func) = match &ast[desc.node] {
            Node::Rule { name, .. } => (name, false),
            Node::FuncRule { name, .. } => (name, true),
            _ => continue,
        };
        let span = ast.span(desc.node);
        if builtins::BUILTINS.contains_key(name.as_ref()) {
            let msg = format!("redefinition of builtin function `{name}`");
            bail!(RuleError::Redefinition(span.message("error", &msg)));
        }
        if symbols.constructors.contains_key(name) {
            let msg = format!("redefinition of constructor `{name}`");
            bail!(RuleError::Redefinition(span.message("error", &msg)));
        }
        if is_func && !funcs.insert(name.clone()) {
            let msg = format!("redefinition of function `{name}`");
            bail!(RuleError::Redefinition(span.message("error", &msg)));
        }
    }
    Ok(())
}

/// Check every rule of `rules` not yet marked as typed.
pub fn type_check(ast: &mut Ast, rules: &mut RuleSet, symbols: &SymbolTable) -> Result<()> {
    check_redefinitions(ast, rules, symbols)?;
    let mut checker = TypeChecker::new(ast, symbols, rules);
    for desc in rules.rules.iter_mut() {
        if desc.typed || !matches!(desc.kind, RuleKind::Rel | RuleKind::Func) {
            continue;
        }
        checker.check_rule(desc.node)?;
        desc.typed = true;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::{Dialect, Source};
    use crate::parser;

    fn check(text: &str) -> Result<Ast> {
        let source = Source::from_contents("<test>".to_string(), text.to_string())?;
        let mut ast = Ast::new();
        let mut symbols = SymbolTable::new();
        let descs = parser::parse_rule_base(&source, Dialect::Auto, &mut symbols, &mut ast)?;
        let mut rules = RuleSet { rules: descs };
        type_check(&mut ast, &mut rules, &symbols)?;
        assert!(rules
            .iter()
            .filter(|d| matches!(d.kind, RuleKind::Rel | RuleKind::Func))
            .all(|d| d.typed));
        Ok(ast)
    }

    fn error_code(text: &str) -> i32 {
        match check(text) {
            Ok(_) => 0,
            Err(e) => RuleError::from_anyhow(&e).code(),
        }
    }

    #[test]
    fn every_builtin_signature_parses() -> Result<()> {
        for (name, b) in builtins::BUILTINS.iter() {
            if let Err(e) = parse_signature(b.signature) {
                bail!("signature of `{name}` does not parse: {e}");
            }
        }
        Ok(())
    }

    #[test]
    fn increment_and_print() -> Result<()> {
        check(r#"test(*X) { *Y = *X + 1; writeLine("stdout", *Y); }"#)?;
        Ok(())
    }

    #[test]
    fn string_compared_with_integer() {
        let err = check(r#"test { if ("a" == 1) then { writeLine("stdout", "x"); } }"#)
            .err()
            .map(|e| e.to_string())
            .unwrap_or_default();
        assert!(err.contains("unsolvable typing constraint"), "{err}");
        assert!(err.contains("integer") && err.contains("string"), "{err}");
    }

    #[test]
    fn integer_widens_to_double() -> Result<()> {
        check(r#"test { *d = 1.5 + 2; writeLine("stdout", str(*d)); }"#)?;
        Ok(())
    }

    #[test]
    fn optional_arity_is_enforced() {
        let code = error_code(r#"test { fail(1, 2); }"#);
        assert_eq!(code, crate::error::codes::RE_TYPE_ERROR);
    }

    #[test]
    fn non_boolean_condition() {
        let code = error_code(r#"test { on "yes" { nop; } }"#);
        assert_eq!(code, crate::error::codes::RE_TYPE_ERROR);
    }

    #[test]
    fn builtin_redefinition() {
        let code = error_code(r#"writeLine(*a, *b) { nop; }"#);
        assert_eq!(code, crate::error::codes::RE_FUNCTION_REDEFINITION);
    }

    #[test]
    fn function_rule_defined_twice() {
        let code = error_code("f(*x) = *x + 1\nf(*x) = *x + 2\n");
        assert_eq!(code, crate::error::codes::RE_FUNCTION_REDEFINITION);
    }

    #[test]
    fn extern_then_definition_is_allowed() -> Result<()> {
        check("f : integer -> integer\nf(*x) = *x + 1\n")?;
        Ok(())
    }

    #[test]
    fn loop_variable_takes_element_type() -> Result<()> {
        let ast = check(r#"test { foreach (*I in list(1, 2, 3)) { *J = *I + 1; } }"#)?;
        let ints = ast
            .nodes()
            .iter()
            .filter(|(id, n)| {
                matches!(n, Node::Var { name, .. } if name.as_ref() == "I")
                    && ast.type_of(*id) == Some(&ExprType::Int)
            })
            .count();
        assert_eq!(ints, 2);
        Ok(())
    }

    #[test]
    fn coercion_recorded_for_flex_parameter() -> Result<()> {
        let ast = check(r#"test { *d = 1.5 + 2; }"#)?;
        let two = ast
            .nodes()
            .iter()
            .find(|(_, n)| matches!(n, Node::Int { value: 2, .. }))
            .map(|(id, _)| id);
        let Some(two) = two else {
            bail!("literal not found");
        };
        assert_eq!(
            ast.coercion(two),
            Some(&ExprType::Flex(Box::new(ExprType::Double)))
        );
        Ok(())
    }
}
