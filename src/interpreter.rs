// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

pub mod iterables;

use crate::ast::*;
use crate::builtins::{self, Builtin};
use crate::catalog::Catalog;
use crate::config::EngineConfig;
use crate::env::{Env, Scoped, SessionState};
use crate::error::{codes, ErrorChain, RuleError};
use crate::index::IndexEntry;
use crate::lexer::{Source, Span};
use crate::parser::{self, Parser};
use crate::rule_base::CompiledRuleBase;
use crate::types::{parse_signature, ExprType, IoTag};
use crate::typing::TypeChecker;
use crate::value::Value;
use crate::*;

use std::collections::HashMap;

use anyhow::Result;
use tracing::{debug, trace};

/// Non-local exits of evaluation.
#[derive(Debug)]
pub enum Interrupt {
    /// `break`: ends the innermost loop.
    Break,
    /// `succeed`: ends the current rule successfully.
    Succeed,
    Error(anyhow::Error),
}

impl From<anyhow::Error> for Interrupt {
    fn from(e: anyhow::Error) -> Self {
        Interrupt::Error(e)
    }
}

impl From<RuleError> for Interrupt {
    fn from(e: RuleError) -> Self {
        Interrupt::Error(e.into())
    }
}

impl Interrupt {
    /// The coded error an interrupt amounts to when it escapes a rule.
    pub fn to_rule_error(&self) -> RuleError {
        match self {
            Interrupt::Error(e) => RuleError::from_anyhow(e),
            Interrupt::Break => RuleError::ActionFailed {
                code: codes::BREAK_ACTION_ENCOUNTERED,
                msg: "break outside of a loop".to_string(),
            },
            Interrupt::Succeed => RuleError::Runtime("succeed outside of a rule".to_string()),
        }
    }
}

pub type EvalResult = Result<Value, Interrupt>;

pub struct Interpreter<'a> {
    base: Rc<CompiledRuleBase>,
    /// Arena of the code being evaluated: the rule base's, or that of text
    /// passed to `eval`.
    ast: Rc<Ast>,
    env: Env,
    catalog: &'a mut dyn Catalog,
    config: EngineConfig,
    errors: ErrorChain,
    cut: bool,
    all_next: bool,
    all_nested: bool,
    depth: usize,
    signatures: HashMap<&'static str, Rc<ExprType>>,
    state: SessionState,
}

impl Scoped for Interpreter<'_> {
    fn env_mut(&mut self) -> &mut Env {
        &mut self.env
    }
}

fn action_items(ast: &Ast, id: NodeId) -> Vec<NodeId> {
    match &ast[id] {
        Node::Actions { items, .. } => items.clone(),
        _ => vec![id],
    }
}

fn tag_at(sig: &ExprType, idx: usize) -> IoTag {
    match sig {
        ExprType::Func { params, .. } => params
            .get(idx)
            .or(params.last())
            .map(|p| p.io_tag())
            .unwrap_or(IoTag::Input),
        _ => IoTag::Input,
    }
}

fn dynamic_type_error(t: &ExprType, v: &Value) -> anyhow::Error {
    RuleError::DynamicType(format!(
        "dynamically typed value `{v}` of type {} is not compatible with {t}",
        v.type_name()
    ))
    .into()
}

fn coercion_error(t: &ExprType, v: &Value) -> anyhow::Error {
    RuleError::DynamicCoercion(format!(
        "cannot coerce `{v}` of type {} to {t}",
        v.type_name()
    ))
    .into()
}

/// Check that `v` is usable where `t` is expected.
fn check_value(t: &ExprType, v: Value) -> Result<Value> {
    use ExprType as T;
    let ok = matches!(
        (t, &v),
        (T::Int, Value::Int(_))
            | (T::Double, Value::Int(_) | Value::Double(_))
            | (T::Bool, Value::Bool(_))
            | (
                T::String | T::Path,
                Value::String(_) | Value::Path(_)
            )
            | (T::Time, Value::Time(_) | Value::Int(_))
    );
    match ok {
        true => Ok(v),
        false => Err(dynamic_type_error(t, &v)),
    }
}

/// Convert `v` to the base type `t`.
fn convert_value(t: &ExprType, v: Value) -> Result<Value> {
    use ExprType as T;
    if !t.is_base() {
        return Ok(v);
    }
    Ok(match (t, v) {
        (T::Double, Value::Int(i)) => Value::Double(i as f64),
        (T::Double, Value::Time(s)) => Value::Double(s as f64),
        (T::Double, Value::String(s)) => match s.trim().parse::<f64>() {
            Ok(d) => Value::Double(d),
            Err(_) => return Err(coercion_error(t, &Value::String(s))),
        },
        (T::Int, Value::Double(d)) => Value::Int(d as i64),
        (T::Int, Value::String(s)) => match s.trim().parse::<i64>() {
            Ok(i) => Value::Int(i),
            Err(_) => return Err(coercion_error(t, &Value::String(s))),
        },
        (T::Bool, Value::String(s)) => match s.as_ref() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => return Err(coercion_error(t, &Value::String(s))),
        },
        (T::String, Value::Path(p)) => Value::String(p),
        (T::String, v @ (Value::Int(_) | Value::Double(_) | Value::Bool(_))) => {
            Value::from(v.to_string())
        }
        (T::Path, Value::String(s)) => Value::Path(s),
        (T::Time, Value::Int(i)) => Value::Time(i),
        (t, v) => check_value(t, v)?,
    })
}

/// Apply the coercion recorded for an argument by the type checker.
pub fn coerce_value(t: &ExprType, v: Value) -> Result<Value> {
    match t {
        ExprType::Flex(inner) => convert_value(inner, v),
        ExprType::Fixed(_, to) => convert_value(to, v),
        t if t.is_base() => check_value(t, v),
        _ => Ok(v),
    }
}

impl<'a> Interpreter<'a> {
    pub fn new(base: Rc<CompiledRuleBase>, catalog: &'a mut dyn Catalog, config: &EngineConfig) -> Self {
        Self {
            ast: base.ast.clone(),
            base,
            env: Env::new(config.region_limit, config.compaction_threshold),
            catalog,
            config: config.clone(),
            errors: ErrorChain::new(),
            cut: false,
            all_next: false,
            all_nested: false,
            depth: 0,
            signatures: HashMap::new(),
            state: SessionState::default(),
        }
    }

    pub fn with_state(mut self, state: SessionState) -> Self {
        self.state = state;
        self
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut SessionState {
        &mut self.state
    }

    pub fn take_state(&mut self) -> SessionState {
        core::mem::take(&mut self.state)
    }

    pub fn env(&self) -> &Env {
        &self.env
    }

    pub fn env_mut(&mut self) -> &mut Env {
        &mut self.env
    }

    pub fn catalog(&mut self) -> &mut dyn Catalog {
        &mut *self.catalog
    }

    /// Arena of the code currently being evaluated.
    pub fn ast(&self) -> Rc<Ast> {
        self.ast.clone()
    }

    pub fn span(&self, id: NodeId) -> Span {
        self.ast.span(id)
    }

    pub fn take_errors(&mut self) -> ErrorChain {
        core::mem::take(&mut self.errors)
    }

    pub fn set_cut(&mut self) {
        self.cut = true;
    }

    /// Make the next rule application run every matching rule. With
    /// `nested`, rule applications inside those rules do as well.
    pub fn request_all_rules(&mut self, nested: bool) -> (bool, bool) {
        let saved = (self.all_next, self.all_nested);
        self.all_next = true;
        self.all_nested = self.all_nested || nested;
        saved
    }

    pub fn restore_all_rules(&mut self, saved: (bool, bool)) {
        (self.all_next, self.all_nested) = saved;
    }

    pub fn eval(&mut self, id: NodeId) -> EvalResult {
        let ast = self.ast.clone();
        match &ast[id] {
            Node::Int { value, .. } => Ok(Value::Int(*value)),
            Node::Double { value, .. } => Ok(Value::Double(*value)),
            Node::Bool { value, .. } => Ok(Value::Bool(*value)),
            Node::Str { value, .. } => Ok(Value::String(value.clone())),
            Node::Path { value, .. } => Ok(Value::Path(value.clone())),
            Node::Var {
                name,
                scope: VarScope::Local,
                ..
            } => match self.env.lookup(name) {
                Some(v) => Ok(v.clone()),
                None => Err(RuleError::UnboundLocal(name.to_string()).into()),
            },
            Node::Var { name, .. } => match self.env.session(name) {
                Some(v) => Ok(v.clone()),
                None => Err(RuleError::UnboundSession(name.to_string()).into()),
            },
            Node::Tuple { items, .. } => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval(*item)?);
                }
                Ok(Value::Tuple(Rc::new(values)))
            }
            Node::Actions { items, .. } => self.exec_items(items, &[]),
            Node::ActionsWithRecovery {
                actions, recovery, ..
            } => self.exec_actions(*actions, *recovery),
            Node::App { func, args, .. } => self.eval_app(id, func, args),
            Node::Match {
                scrutinee, clauses, ..
            } => self.eval_match(*scrutinee, clauses),
            _ => Err(RuleError::Runtime(
                self.span(id)
                    .message("error", "declaration cannot be evaluated"),
            )
            .into()),
        }
    }

    pub fn eval_bool(&mut self, id: NodeId) -> Result<bool, Interrupt> {
        match self.eval(id)? {
            Value::Bool(b) => Ok(b),
            v => Err(dynamic_type_error(&ExprType::Bool, &v).into()),
        }
    }

    /// Run an action sequence. When action `i` fails, recovery actions
    /// `min(i, len - 1)` down to `0` run before the error propagates.
    pub fn exec_actions(&mut self, actions: NodeId, recovery: NodeId) -> EvalResult {
        let ast = self.ast.clone();
        let items = action_items(&ast, actions);
        let recovery = action_items(&ast, recovery);
        self.exec_items(&items, &recovery)
    }

    fn exec_items(&mut self, items: &[NodeId], recovery: &[NodeId]) -> EvalResult {
        let mut last = Value::Int(0);
        for (i, item) in items.iter().enumerate() {
            match self.eval(*item) {
                Ok(v) => last = v,
                Err(Interrupt::Error(e)) => {
                    let code = RuleError::from_anyhow(&e).code();
                    if code != codes::RETRY_WITHOUT_RECOVERY && !recovery.is_empty() {
                        let start = i.min(recovery.len() - 1);
                        for r in recovery[..=start].iter().rev() {
                            if let Err(Interrupt::Error(re)) = self.eval(*r) {
                                let re = RuleError::from_anyhow(&re);
                                self.errors.push(re.code(), format!("recovery action failed: {re}"));
                            }
                        }
                    }
                    return Err(Interrupt::Error(e));
                }
                Err(other) => return Err(other),
            }
        }
        Ok(last)
    }

    fn builtin_signature(&mut self, name: &'static str, b: &Builtin) -> Result<Rc<ExprType>> {
        if let Some(sig) = self.signatures.get(name) {
            return Ok(sig.clone());
        }
        let sig = Rc::new(parse_signature(b.signature)?);
        self.signatures.insert(name, sig.clone());
        Ok(sig)
    }

    /// Coerce an evaluated argument as recorded by the type checker.
    pub fn coerce(&self, arg: NodeId, v: Value) -> Result<Value> {
        match self.ast.coercion(arg) {
            Some(t) => coerce_value(t, v),
            None => Ok(v),
        }
    }

    fn call_builtin(
        &mut self,
        id: NodeId,
        name: &'static str,
        b: &'static Builtin,
        args: &[NodeId],
    ) -> EvalResult {
        let sig = self.builtin_signature(name, b)?;
        let mut values = Vec::with_capacity(args.len());
        for (i, a) in args.iter().enumerate() {
            let v = match tag_at(&sig, i) {
                IoTag::Expression | IoTag::Actions | IoTag::Output => Value::Unit,
                IoTag::Input | IoTag::Dynamic => {
                    let v = self.eval(*a)?;
                    self.coerce(*a, v)?
                }
            };
            values.push(v);
        }
        let span = self.span(id);
        let result = (b.func)(self, &span, args, &mut values)?;
        for (i, (a, v)) in args.iter().zip(values).enumerate() {
            if matches!(tag_at(&sig, i), IoTag::Output | IoTag::Dynamic) && v != Value::Unit {
                if let Node::Var { .. } = &self.ast[*a] {
                    self.assign_var(*a, v)?;
                }
            }
        }
        Ok(result)
    }

    fn eval_app(&mut self, id: NodeId, func: &Rc<str>, args: &[NodeId]) -> EvalResult {
        if let Some((name, b)) = builtins::BUILTINS.get_key_value(func.as_ref()) {
            return self.call_builtin(id, *name, b, args);
        }

        if self.base.symbols.constructors.contains_key(func) {
            let mut values = Vec::with_capacity(args.len());
            for a in args {
                values.push(self.eval(*a)?);
            }
            return Ok(Value::Cons {
                name: func.clone(),
                args: Rc::new(values),
            });
        }

        // Unbound variables are passed as empty values so that rules and
        // host functions can use them as output parameters.
        let ast = self.ast.clone();
        let mut values = Vec::with_capacity(args.len());
        for a in args {
            let v = match &ast[*a] {
                Node::Var {
                    name,
                    scope: VarScope::Local,
                    ..
                } => self.env.lookup(name).cloned().unwrap_or(Value::Unit),
                Node::Var { name, .. } => self.env.session(name).cloned().unwrap_or(Value::Unit),
                _ => {
                    let v = self.eval(*a)?;
                    self.coerce(*a, v)?
                }
            };
            values.push(v);
        }

        let result = if self.base.index.contains(func) {
            self.apply_rules(func, &mut values)?
        } else {
            match self.catalog.call(func, &mut values)? {
                Some(v) => v,
                None => return Err(RuleError::NoRuleFound(func.to_string()).into()),
            }
        };

        for (a, v) in args.iter().zip(values) {
            if matches!(ast[*a], Node::Var { .. }) && v != Value::Unit {
                self.assign_var(*a, v)?;
            }
        }
        Ok(result)
    }

    /// Assign to the variable node `target`.
    pub fn assign_var(&mut self, target: NodeId, value: Value) -> Result<()> {
        let ast = self.ast.clone();
        match &ast[target] {
            Node::Var {
                name,
                scope: VarScope::Local,
                ..
            } => self.env.update(name, value),
            Node::Var { name, .. } => self.env.set_session(name, value),
            _ => Err(RuleError::PatternNotMatched(self.span(target).message(
                "error",
                "expecting a variable",
            ))
            .into()),
        }
    }

    /// Match `value` against `pattern`, binding its variables. With `define`
    /// the variables are bound in the innermost scope; otherwise existing
    /// bindings are updated.
    pub fn bind_pattern(&mut self, pattern: NodeId, value: &Value, define: bool) -> Result<bool> {
        let ast = self.ast.clone();
        let items_match = |me: &mut Self, items: &[NodeId], values: &[Value]| -> Result<bool> {
            if items.len() != values.len() {
                return Ok(false);
            }
            for (p, v) in items.iter().zip(values) {
                if !me.bind_pattern(*p, v, define)? {
                    return Ok(false);
                }
            }
            Ok(true)
        };
        match &ast[pattern] {
            Node::Var {
                name,
                scope: VarScope::Local,
                ..
            } => {
                match define {
                    true => self.env.define(name, value.clone())?,
                    false => self.env.update(name, value.clone())?,
                }
                Ok(true)
            }
            Node::Var { name, .. } => {
                self.env.set_session(name, value.clone())?;
                Ok(true)
            }
            Node::Tuple { items, .. } => match value {
                Value::Tuple(values) => items_match(self, items, values.as_slice()),
                _ => Ok(false),
            },
            Node::App { func, args, .. } if self.base.symbols.constructors.contains_key(func) => {
                match value {
                    Value::Cons { name, args: values } if name == func => {
                        items_match(self, args, values.as_slice())
                    }
                    _ => Ok(false),
                }
            }
            Node::Int { value: i, .. } => Ok(value.loose_eq(&Value::Int(*i))),
            Node::Double { value: d, .. } => Ok(value.loose_eq(&Value::Double(*d))),
            Node::Bool { value: b, .. } => Ok(*value == Value::Bool(*b)),
            Node::Str { value: s, .. } => Ok(value.loose_eq(&Value::String(s.clone()))),
            _ => Err(RuleError::PatternNotMatched(
                self.span(pattern).message("error", "unsupported pattern"),
            )
            .into()),
        }
    }

    /// Evaluate `body` in a new scope.
    pub fn scoped<F>(&mut self, f: F) -> EvalResult
    where
        F: FnOnce(&mut Self) -> EvalResult,
    {
        self.env.push_scope();
        let r = f(self);
        self.env.pop_scope();
        r
    }

    fn eval_match(&mut self, scrutinee: NodeId, clauses: &[NodeId]) -> EvalResult {
        let value = self.eval(scrutinee)?;
        let ast = self.ast.clone();
        for clause in clauses {
            let Node::Clause { pattern, body, .. } = &ast[*clause] else {
                continue;
            };
            let (pattern, body) = (*pattern, *body);
            let mut matched = false;
            let r = self.scoped(|me| {
                matched = me.bind_pattern(pattern, &value, true)?;
                match matched {
                    true => me.eval(body),
                    false => Ok(Value::Unit),
                }
            });
            if matched {
                return r;
            }
            r?;
        }
        Err(RuleError::PatternNotMatched(
            self.span(scrutinee)
                .message("error", &format!("no clause matches `{value}`")),
        )
        .into())
    }

    /// Value of the shared left-hand side of a secondary-indexed name, with
    /// the parameters bound to `args`.
    fn secondary_key(&mut self, lhs: NodeId, params: &[Rc<str>], args: &[Value]) -> Result<Option<Rc<str>>, Interrupt> {
        if params.len() != args.len() {
            return Ok(None);
        }
        self.env.push_frame();
        let prev = core::mem::replace(&mut self.ast, self.base.ast.clone());
        let r = (|| -> Result<Value, Interrupt> {
            for (p, v) in params.iter().zip(args) {
                self.env.define(p, v.clone())?;
            }
            self.eval(lhs)
        })();
        self.ast = prev;
        self.env.pop_frame();
        Ok(Some(r?.to_string().into()))
    }

    /// Apply the rules named `name` to `args`, writing parameter values back
    /// into `args` on success.
    pub fn apply_rules(&mut self, name: &str, args: &mut [Value]) -> EvalResult {
        if self.depth >= self.config.max_call_depth {
            return Err(RuleError::Runtime(format!(
                "maximum call depth of {} exceeded applying `{name}`",
                self.config.max_call_depth
            ))
            .into());
        }
        let all = core::mem::take(&mut self.all_next) || self.all_nested;
        let base = self.base.clone();
        let key = match base.index.entry(name) {
            Some(IndexEntry::Secondary(ci)) => self.secondary_key(ci.lhs, &ci.params, args)?,
            _ => None,
        };

        let mut cursor = 0;
        let mut applied = false;
        let mut last_error: Option<Interrupt> = None;
        while let Some(c) = base.index.find_next_candidate(name, cursor, key.as_deref()) {
            cursor = c.cursor;
            if base.params(c.rule).len() != args.len() {
                continue;
            }
            let logging = self.config.logging && base.logging_enabled(c.rule);
            if logging {
                debug!(rule = name, candidate = c.rule, "applying rule");
            }
            let saved_cut = core::mem::replace(&mut self.cut, false);
            self.depth += 1;
            let r = self.try_rule(&base, c.rule, args);
            self.depth -= 1;
            let cut = core::mem::replace(&mut self.cut, saved_cut);
            match r {
                Ok(Some(v)) => {
                    if logging {
                        trace!(rule = name, "rule succeeded");
                    }
                    if !all {
                        return Ok(v);
                    }
                    applied = true;
                }
                Ok(None) => (),
                Err(e) => {
                    let err = e.to_rule_error();
                    self.errors.push(err.code(), format!("{name}: {err}"));
                    if logging {
                        debug!(rule = name, code = err.code(), "rule failed");
                    }
                    if cut {
                        return Err(RuleError::Cut.into());
                    }
                    if all {
                        return Err(e);
                    }
                    last_error = Some(e);
                }
            }
        }
        match (applied, last_error) {
            (true, _) => Ok(Value::Int(0)),
            (false, Some(e)) => Err(e),
            (false, None) => Err(RuleError::NoRuleFound(name.to_string()).into()),
        }
    }

    /// Run one rule. `Ok(None)` when its condition does not hold.
    fn try_rule(&mut self, base: &Rc<CompiledRuleBase>, rule: usize, args: &mut [Value]) -> Result<Option<Value>, Interrupt> {
        let params = base.params(rule);
        self.env.push_frame();
        let prev = core::mem::replace(&mut self.ast, base.ast.clone());
        let r = self.run_rule_body(base, rule, &params, args);
        self.ast = prev;
        self.env.pop_frame();
        r
    }

    fn run_rule_body(
        &mut self,
        base: &Rc<CompiledRuleBase>,
        rule: usize,
        params: &[Rc<str>],
        args: &mut [Value],
    ) -> Result<Option<Value>, Interrupt> {
        for (p, v) in params.iter().zip(args.iter()) {
            self.env.define(p, v.clone())?;
        }
        let node = base.rules.rules[rule].node;
        let value = match &base.ast[node] {
            Node::Rule {
                cond,
                actions,
                recovery,
                ..
            } => {
                if !self.eval_bool(*cond)? {
                    return Ok(None);
                }
                match self.exec_actions(*actions, *recovery) {
                    Ok(_) | Err(Interrupt::Succeed) => Value::Int(0),
                    Err(e) => return Err(e),
                }
            }
            Node::FuncRule { body, recovery, .. } => match self.eval(*body) {
                Ok(v) => v,
                Err(Interrupt::Error(e)) => {
                    if let Err(Interrupt::Error(re)) = self.eval(*recovery) {
                        let re = RuleError::from_anyhow(&re);
                        self.errors.push(re.code(), format!("recovery action failed: {re}"));
                    }
                    return Err(Interrupt::Error(e));
                }
                Err(e) => return Err(e),
            },
            _ => return Ok(None),
        };
        for (p, slot) in params.iter().zip(args.iter_mut()) {
            if let Some(v) = self.env.lookup(p) {
                *slot = v.clone();
            }
        }
        Ok(Some(value))
    }

    /// Number of parameters of the first rule named `name`.
    pub fn rule_arity(&self, name: &str) -> Option<usize> {
        let idx = *self.base.index.rules(name).first()?;
        Some(self.base.params(idx).len())
    }

    pub fn rule_names(&self, tier: Tier) -> Vec<Rc<str>> {
        self.base.names_in_tier(tier)
    }

    fn runtime_source(&self, text: &str) -> Result<Source> {
        if text.len() > self.config.max_rule_text {
            return Err(RuleError::BufferOverflow {
                size: text.len(),
                limit: self.config.max_rule_text,
            }
            .into());
        }
        Source::from_contents("<eval>".to_string(), text.to_string())
    }

    /// Evaluate with `ast` as the current arena.
    fn run_in<F>(&mut self, ast: Rc<Ast>, f: F) -> EvalResult
    where
        F: FnOnce(&mut Self) -> EvalResult,
    {
        let prev = core::mem::replace(&mut self.ast, ast);
        let r = f(self);
        self.ast = prev;
        r
    }

    /// Parse, check and run an action sequence given as text.
    pub fn eval_text(&mut self, text: &str) -> EvalResult {
        let source = self.runtime_source(text)?;
        let mut ast = Ast::with_limit(self.config.region_limit);
        let (actions, recovery) = {
            let mut parser = Parser::new(&source, &mut ast)?;
            parser.parse_action_text()?
        };
        let base = self.base.clone();
        {
            let rules = RuleSet::default();
            let mut checker = TypeChecker::new(&mut ast, &base.symbols, &rules);
            checker.check_term(actions)?;
            checker.check_term(recovery)?;
        }
        self.run_in(Rc::new(ast), |me| me.exec_actions(actions, recovery))
    }

    /// Parse, check and evaluate a single term given as text.
    pub fn eval_term_text(&mut self, text: &str) -> EvalResult {
        let source = self.runtime_source(text)?;
        let mut ast = Ast::with_limit(self.config.region_limit);
        let term = parser::parse_term(&source, &mut ast)?;
        let base = self.base.clone();
        {
            let rules = RuleSet::default();
            let mut checker = TypeChecker::new(&mut ast, &base.symbols, &rules);
            checker.check_term(term)?;
        }
        self.run_in(Rc::new(ast), |me| me.eval(term))
    }
}
