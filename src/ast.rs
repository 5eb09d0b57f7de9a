// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::lexer::*;
use crate::region::*;
use crate::types::ExprType;
use crate::*;

use core::fmt::Write as _;
use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

pub type NodeId = Id<Node>;

/// Location of a node: index of its source within the owning `Ast` and the
/// byte range it covers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pos {
    pub src: u32,
    pub start: u32,
    pub end: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VarScope {
    Local,
    Session,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryAlt {
    pub op: Rc<str>,
    pub values: Vec<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Node {
    Int {
        pos: Pos,
        value: i64,
    },
    Double {
        pos: Pos,
        value: f64,
    },
    Bool {
        pos: Pos,
        value: bool,
    },
    Str {
        pos: Pos,
        value: Rc<str>,
    },
    Path {
        pos: Pos,
        value: Rc<str>,
    },
    Var {
        pos: Pos,
        name: Rc<str>,
        scope: VarScope,
    },
    App {
        pos: Pos,
        func: Rc<str>,
        args: Vec<NodeId>,
    },
    Tuple {
        pos: Pos,
        items: Vec<NodeId>,
    },
    Actions {
        pos: Pos,
        items: Vec<NodeId>,
    },
    /// A braced action block used as a value. Both children are `Actions`
    /// of equal length.
    ActionsWithRecovery {
        pos: Pos,
        actions: NodeId,
        recovery: NodeId,
    },
    Rule {
        pos: Pos,
        name: Rc<str>,
        params: Vec<NodeId>,
        cond: NodeId,
        actions: NodeId,
        recovery: NodeId,
        metadata: Vec<NodeId>,
        ret: Option<NodeId>,
        id: Option<i64>,
    },
    FuncRule {
        pos: Pos,
        name: Rc<str>,
        params: Vec<NodeId>,
        body: NodeId,
        recovery: NodeId,
        metadata: Vec<NodeId>,
        ret: Option<NodeId>,
    },
    Data {
        pos: Pos,
        name: Rc<str>,
        params: Vec<Rc<str>>,
        constructors: Vec<NodeId>,
    },
    Constructor {
        pos: Pos,
        name: Rc<str>,
        ty: ExprType,
    },
    Extern {
        pos: Pos,
        name: Rc<str>,
        ty: ExprType,
    },
    Query {
        pos: Pos,
        cols: Vec<NodeId>,
        conds: Vec<NodeId>,
    },
    /// `name`, or `count(name)`, `sum(name)`, `order(name)`, `order_desc(name)`.
    Column {
        pos: Pos,
        func: Option<Rc<str>>,
        name: Rc<str>,
    },
    QueryCond {
        pos: Pos,
        column: NodeId,
        junction: Option<Rc<str>>,
        alts: Vec<QueryAlt>,
    },
    Match {
        pos: Pos,
        scrutinee: NodeId,
        clauses: Vec<NodeId>,
    },
    Clause {
        pos: Pos,
        pattern: NodeId,
        body: NodeId,
    },
    Metadata {
        pos: Pos,
        attr: Rc<str>,
        value: Rc<str>,
        unit: Rc<str>,
    },
    Param {
        pos: Pos,
        name: Rc<str>,
        ty: Option<ExprType>,
    },
    TypeAnnot {
        pos: Pos,
        ty: ExprType,
    },
}

impl Node {
    pub fn pos(&self) -> Pos {
        use Node::*;
        match self {
            Int { pos, .. }
            | Double { pos, .. }
            | Bool { pos, .. }
            | Str { pos, .. }
            | Path { pos, .. }
            | Var { pos, .. }
            | App { pos, .. }
            | Tuple { pos, .. }
            | Actions { pos, .. }
            | ActionsWithRecovery { pos, .. }
            | Rule { pos, .. }
            | FuncRule { pos, .. }
            | Data { pos, .. }
            | Constructor { pos, .. }
            | Extern { pos, .. }
            | Query { pos, .. }
            | Column { pos, .. }
            | QueryCond { pos, .. }
            | Match { pos, .. }
            | Clause { pos, .. }
            | Metadata { pos, .. }
            | Param { pos, .. }
            | TypeAnnot { pos, .. } => *pos,
        }
    }

    /// Child handles in evaluation order.
    pub fn children(&self) -> Vec<NodeId> {
        use Node::*;
        match self {
            App { args: items, .. }
            | Tuple { items, .. }
            | Actions { items, .. }
            | Data {
                constructors: items,
                ..
            } => items.clone(),
            ActionsWithRecovery {
                actions, recovery, ..
            } => vec![*actions, *recovery],
            Rule {
                params,
                cond,
                actions,
                recovery,
                metadata,
                ret,
                ..
            } => {
                let mut v = params.clone();
                v.extend([*cond, *actions, *recovery]);
                v.extend(metadata.iter().copied());
                v.extend(ret.iter().copied());
                v
            }
            FuncRule {
                params,
                body,
                recovery,
                metadata,
                ret,
                ..
            } => {
                let mut v = params.clone();
                v.extend([*body, *recovery]);
                v.extend(metadata.iter().copied());
                v.extend(ret.iter().copied());
                v
            }
            Query { cols, conds, .. } => cols.iter().chain(conds.iter()).copied().collect(),
            QueryCond { column, alts, .. } => {
                let mut v = vec![*column];
                for a in alts {
                    v.extend(a.values.iter().copied());
                }
                v
            }
            Match {
                scrutinee, clauses, ..
            } => {
                let mut v = vec![*scrutinee];
                v.extend(clauses.iter().copied());
                v
            }
            Clause { pattern, body, .. } => vec![*pattern, *body],
            _ => vec![],
        }
    }
}

fn rc_len(s: &Rc<str>) -> usize {
    s.len()
}

impl Footprint for Node {
    fn footprint(&self) -> usize {
        use Node::*;
        let base = core::mem::size_of::<Node>();
        let ids = self.children().len() * core::mem::size_of::<NodeId>();
        let text = match self {
            Str { value, .. } | Path { value, .. } => rc_len(value),
            Var { name, .. }
            | Rule { name, .. }
            | FuncRule { name, .. }
            | Constructor { name, .. }
            | Extern { name, .. }
            | Column { name, .. }
            | Param { name, .. } => rc_len(name),
            App { func, .. } => rc_len(func),
            Data { name, params, .. } => rc_len(name) + params.iter().map(rc_len).sum::<usize>(),
            Metadata {
                attr, value, unit, ..
            } => rc_len(attr) + rc_len(value) + rc_len(unit),
            _ => 0,
        };
        base + ids + text
    }
}

impl Relocate for Node {
    fn relocate(&self, map: &mut dyn FnMut(NodeId) -> Result<NodeId>) -> Result<Self> {
        use Node::*;
        let all = relocate_all;
        Ok(match self {
            App { pos, func, args } => App {
                pos: *pos,
                func: func.clone(),
                args: all(args, map)?,
            },
            Tuple { pos, items } => Tuple {
                pos: *pos,
                items: all(items, map)?,
            },
            Actions { pos, items } => Actions {
                pos: *pos,
                items: all(items, map)?,
            },
            ActionsWithRecovery {
                pos,
                actions,
                recovery,
            } => ActionsWithRecovery {
                pos: *pos,
                actions: map(*actions)?,
                recovery: map(*recovery)?,
            },
            Rule {
                pos,
                name,
                params,
                cond,
                actions,
                recovery,
                metadata,
                ret,
                id,
            } => Rule {
                pos: *pos,
                name: name.clone(),
                params: all(params, map)?,
                cond: map(*cond)?,
                actions: map(*actions)?,
                recovery: map(*recovery)?,
                metadata: all(metadata, map)?,
                ret: ret.map(&mut *map).transpose()?,
                id: *id,
            },
            FuncRule {
                pos,
                name,
                params,
                body,
                recovery,
                metadata,
                ret,
            } => FuncRule {
                pos: *pos,
                name: name.clone(),
                params: all(params, map)?,
                body: map(*body)?,
                recovery: map(*recovery)?,
                metadata: all(metadata, map)?,
                ret: ret.map(&mut *map).transpose()?,
            },
            Data {
                pos,
                name,
                params,
                constructors,
            } => Data {
                pos: *pos,
                name: name.clone(),
                params: params.clone(),
                constructors: all(constructors, map)?,
            },
            Query { pos, cols, conds } => Query {
                pos: *pos,
                cols: all(cols, map)?,
                conds: all(conds, map)?,
            },
            QueryCond {
                pos,
                column,
                junction,
                alts,
            } => QueryCond {
                pos: *pos,
                column: map(*column)?,
                junction: junction.clone(),
                alts: alts
                    .iter()
                    .map(|a| {
                        Ok(QueryAlt {
                            op: a.op.clone(),
                            values: all(&a.values, map)?,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?,
            },
            Match {
                pos,
                scrutinee,
                clauses,
            } => Match {
                pos: *pos,
                scrutinee: map(*scrutinee)?,
                clauses: all(clauses, map)?,
            },
            Clause { pos, pattern, body } => Clause {
                pos: *pos,
                pattern: map(*pattern)?,
                body: map(*body)?,
            },
            leaf => leaf.clone(),
        })
    }
}

fn relocate_all(
    ids: &[NodeId],
    map: &mut dyn FnMut(NodeId) -> Result<NodeId>,
) -> Result<Vec<NodeId>> {
    ids.iter().map(|c| map(*c)).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleKind {
    Rel,
    Func,
    Data,
    Constructor,
    Extern,
}

/// Precedence class of a rule. Higher tiers are tried first.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Tier {
    Core,
    #[default]
    Application,
    Extension,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDesc {
    pub kind: RuleKind,
    pub node: NodeId,
    pub typed: bool,
    pub tier: Tier,
}

/// Ordered, appendable collection of rule descriptors.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct RuleSet {
    pub rules: Vec<RuleDesc>,
}

impl RuleSet {
    pub fn push(&mut self, desc: RuleDesc) -> usize {
        self.rules.push(desc);
        self.rules.len() - 1
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RuleDesc> {
        self.rules.iter()
    }
}

/// Node arena together with the sources the nodes point into and the
/// per-node annotations computed by the type checker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Ast {
    sources: Vec<Source>,
    nodes: Region<Node>,
    types: Vec<Option<ExprType>>,
    coercions: BTreeMap<u32, ExprType>,
}

impl core::ops::Index<NodeId> for Ast {
    type Output = Node;

    fn index(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }
}

impl Ast {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            nodes: Region::with_limit(limit),
            ..Self::default()
        }
    }

    /// An empty arena sharing this one's source table, for parsing into
    /// before promotion.
    pub fn scratch(&self) -> Ast {
        Ast {
            sources: self.sources.clone(),
            nodes: Region::with_limit(self.nodes.limit()),
            ..Ast::default()
        }
    }

    pub fn add_source(&mut self, source: &Source) -> u32 {
        if let Some(idx) = self.sources.iter().position(|s| s == source) {
            return idx as u32;
        }
        self.sources.push(source.clone());
        self.sources.len() as u32 - 1
    }

    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    pub fn nodes(&self) -> &Region<Node> {
        &self.nodes
    }

    pub fn alloc(&mut self, node: Node) -> Result<NodeId> {
        self.nodes.alloc(node)
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn span(&self, id: NodeId) -> Span {
        self.pos_span(self.nodes[id].pos())
    }

    pub fn pos_span(&self, pos: Pos) -> Span {
        match self.sources.get(pos.src as usize) {
            Some(s) => s.span(pos.start, pos.end),
            // Nodes built without a source, e.g. by the interpreter.
            None => Source::default().span(0, 0),
        }
    }

    pub fn type_of(&self, id: NodeId) -> Option<&ExprType> {
        self.types.get(id.index()).and_then(|t| t.as_ref())
    }

    pub fn set_type(&mut self, id: NodeId, ty: ExprType) {
        if self.types.len() <= id.index() {
            self.types.resize(id.index() + 1, None);
        }
        self.types[id.index()] = Some(ty);
    }

    pub fn coercion(&self, id: NodeId) -> Option<&ExprType> {
        self.coercions.get(&(id.index() as u32))
    }

    pub fn set_coercion(&mut self, id: NodeId, ty: ExprType) {
        self.coercions.insert(id.index() as u32, ty);
    }

    /// Deep-copy the subtree `id` of `src` into `self`. `self` must share
    /// `src`'s source table prefix, as arenas from `scratch` do.
    pub fn promote_from(&mut self, src: &Ast, id: NodeId) -> Result<NodeId> {
        if src.sources.len() > self.sources.len() {
            self.sources = src.sources.clone();
        }
        let new_id = promote(&src.nodes, id, &mut self.nodes)?;
        self.copy_annotations(src, id, new_id);
        Ok(new_id)
    }

    fn copy_annotations(&mut self, src: &Ast, from: NodeId, to: NodeId) {
        if let Some(t) = src.type_of(from) {
            self.set_type(to, t.clone());
        }
        if let Some(t) = src.coercion(from) {
            self.set_coercion(to, t.clone());
        }
        for (a, b) in src[from].children().into_iter().zip(self[to].children()) {
            self.copy_annotations(src, a, b);
        }
    }

    /// Position-free rendering of a subtree, used to compare trees
    /// structurally.
    pub fn dump(&self, id: NodeId) -> String {
        let mut s = String::new();
        self.dump_into(id, &mut s);
        s
    }

    fn dump_list(&self, ids: &[NodeId], s: &mut String) {
        for c in ids {
            s.push(' ');
            self.dump_into(*c, s);
        }
    }

    fn dump_into(&self, id: NodeId, s: &mut String) {
        use Node::*;
        let _ = match &self[id] {
            Int { value, .. } => write!(s, "{value}"),
            Double { value, .. } => write!(s, "{value:?}"),
            Bool { value, .. } => write!(s, "{value}"),
            Str { value, .. } => write!(s, "{value:?}"),
            Path { value, .. } => write!(s, "(path {value})"),
            Var {
                name,
                scope: VarScope::Local,
                ..
            } => write!(s, "*{name}"),
            Var { name, .. } => write!(s, "${name}"),
            App { func, args, .. } => {
                s.push('(');
                s.push_str(func);
                self.dump_list(args, s);
                s.push(')');
                Ok(())
            }
            Tuple { items, .. } => {
                s.push_str("(tuple");
                self.dump_list(items, s);
                s.push(')');
                Ok(())
            }
            Actions { items, .. } => {
                s.push_str("(actions");
                self.dump_list(items, s);
                s.push(')');
                Ok(())
            }
            ActionsWithRecovery {
                actions, recovery, ..
            } => {
                s.push_str("(block");
                self.dump_list(&[*actions, *recovery], s);
                s.push(')');
                Ok(())
            }
            Rule {
                name,
                params,
                cond,
                actions,
                recovery,
                metadata,
                ret,
                id,
                ..
            } => {
                let _ = write!(s, "(rule {name} (params");
                self.dump_list(params, s);
                s.push(')');
                if let Some(r) = ret {
                    self.dump_list(&[*r], s);
                }
                self.dump_list(&[*cond, *actions, *recovery], s);
                self.dump_list(metadata, s);
                if let Some(id) = id {
                    let _ = write!(s, " (id {id})");
                }
                s.push(')');
                Ok(())
            }
            FuncRule {
                name,
                params,
                body,
                recovery,
                metadata,
                ret,
                ..
            } => {
                let _ = write!(s, "(func {name} (params");
                self.dump_list(params, s);
                s.push(')');
                if let Some(r) = ret {
                    self.dump_list(&[*r], s);
                }
                self.dump_list(&[*body, *recovery], s);
                self.dump_list(metadata, s);
                s.push(')');
                Ok(())
            }
            Data {
                name,
                params,
                constructors,
                ..
            } => {
                let _ = write!(s, "(data {name} {params:?}");
                self.dump_list(constructors, s);
                s.push(')');
                Ok(())
            }
            Constructor { name, ty, .. } => write!(s, "(constructor {name} : {ty})"),
            Extern { name, ty, .. } => write!(s, "(extern {name} : {ty})"),
            Query { cols, conds, .. } => {
                s.push_str("(select");
                self.dump_list(cols, s);
                s.push_str(" where");
                self.dump_list(conds, s);
                s.push(')');
                Ok(())
            }
            Column { func: Some(f), name, .. } => write!(s, "({f} {name})"),
            Column { name, .. } => write!(s, "{name}"),
            QueryCond {
                column,
                junction,
                alts,
                ..
            } => {
                s.push_str("(cond");
                self.dump_list(&[*column], s);
                for (i, a) in alts.iter().enumerate() {
                    if i > 0 {
                        let _ = write!(s, " {}", junction.as_deref().unwrap_or("||"));
                    }
                    let _ = write!(s, " {}", a.op);
                    self.dump_list(&a.values, s);
                }
                s.push(')');
                Ok(())
            }
            Match {
                scrutinee, clauses, ..
            } => {
                s.push_str("(match");
                self.dump_list(&[*scrutinee], s);
                self.dump_list(clauses, s);
                s.push(')');
                Ok(())
            }
            Clause { pattern, body, .. } => {
                s.push_str("(=>");
                self.dump_list(&[*pattern, *body], s);
                s.push(')');
                Ok(())
            }
            Metadata {
                attr, value, unit, ..
            } => write!(s, "(@ {attr:?} {value:?} {unit:?})"),
            Param { name, ty: Some(t), .. } => write!(s, "*{name}:{t}"),
            Param { name, .. } => write!(s, "*{name}"),
            TypeAnnot { ty, .. } => write!(s, "(: {ty})"),
        };
    }
}

/// Render a declaration or rule back to block-dialect source text.
pub fn render(ast: &Ast, id: NodeId) -> String {
    let mut r = Renderer {
        ast,
        out: String::new(),
        indent: 0,
    };
    r.top(id);
    r.out
}

struct Renderer<'a> {
    ast: &'a Ast,
    out: String,
    indent: usize,
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\0' => out.push_str("\\0"),
            '*' | '$'
                if chars
                    .peek()
                    .is_some_and(|n| *n == '_' || n.is_ascii_alphabetic()) =>
            {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

impl Renderer<'_> {
    fn newline(&mut self) {
        self.out.push('\n');
        for _ in 0..self.indent {
            self.out.push_str("    ");
        }
    }

    fn top(&mut self, id: NodeId) {
        use Node::*;
        match &self.ast[id] {
            Rule {
                name,
                params,
                cond,
                actions,
                recovery,
                metadata,
                ret,
                ..
            } => {
                self.head(name, params, *ret);
                self.out.push_str(" {");
                self.indent += 1;
                let unconditional = matches!(self.ast[*cond], Bool { value: true, .. });
                if unconditional {
                    self.action_lines(*actions, *recovery);
                    self.indent -= 1;
                    self.newline();
                    self.out.push('}');
                } else {
                    self.newline();
                    self.out.push_str("on ");
                    self.term(*cond);
                    self.out.push_str(" {");
                    self.indent += 1;
                    self.action_lines(*actions, *recovery);
                    self.indent -= 1;
                    self.newline();
                    self.out.push('}');
                    self.metadata(metadata);
                    self.indent -= 1;
                    self.newline();
                    self.out.push('}');
                    self.out.push('\n');
                    return;
                }
                self.metadata(metadata);
            }
            FuncRule {
                name,
                params,
                body,
                recovery,
                metadata,
                ret,
                ..
            } => {
                self.head(name, params, *ret);
                self.out.push_str(" = ");
                self.term(*body);
                if !self.is_nop(*recovery) {
                    self.out.push_str(" ::: ");
                    self.term(*recovery);
                }
                self.metadata(metadata);
            }
            Data {
                name,
                params,
                constructors,
                ..
            } => {
                self.out.push_str("data ");
                self.out.push_str(name);
                if !params.is_empty() {
                    self.out.push('(');
                    self.out.push_str(&params.join(", "));
                    self.out.push(')');
                }
                if !constructors.is_empty() {
                    self.out.push_str(" =");
                    for c in constructors {
                        if let Constructor { name, ty, .. } = &self.ast[*c] {
                            let _ = write!(self.out, " | {name} : {ty}");
                        }
                    }
                }
            }
            Constructor { name, ty, .. } => {
                let _ = write!(self.out, "constructor {name} : {ty}");
            }
            Extern { name, ty, .. } => {
                let _ = write!(self.out, "{name} : {ty}");
            }
            _ => self.term(id),
        }
        self.out.push('\n');
    }

    fn head(&mut self, name: &str, params: &[NodeId], ret: Option<NodeId>) {
        self.out.push_str(name);
        self.out.push('(');
        for (i, p) in params.iter().enumerate() {
            if i > 0 {
                self.out.push_str(", ");
            }
            if let Node::Param { name, ty, .. } = &self.ast[*p] {
                self.out.push('*');
                self.out.push_str(name);
                if let Some(t) = ty {
                    let _ = write!(self.out, ":{t}");
                }
            }
        }
        self.out.push(')');
        if let Some(r) = ret {
            if let Node::TypeAnnot { ty, .. } = &self.ast[r] {
                let _ = write!(self.out, " : {ty}");
            }
        }
    }

    fn metadata(&mut self, metadata: &[NodeId]) {
        for m in metadata {
            if let Node::Metadata {
                attr, value, unit, ..
            } = &self.ast[*m]
            {
                let _ = write!(self.out, " @({}, {}", quote(attr), quote(value));
                if !unit.is_empty() {
                    let _ = write!(self.out, ", {}", quote(unit));
                }
                self.out.push(')');
            }
        }
    }

    fn is_nop(&self, id: NodeId) -> bool {
        matches!(&self.ast[id], Node::App { func, args, .. } if func.as_ref() == "nop" && args.is_empty())
    }

    fn action_items(&self, id: NodeId) -> Vec<NodeId> {
        match &self.ast[id] {
            Node::Actions { items, .. } => items.clone(),
            _ => vec![id],
        }
    }

    fn action_lines(&mut self, actions: NodeId, recovery: NodeId) {
        let acts = self.action_items(actions);
        let recs = self.action_items(recovery);
        for (i, a) in acts.iter().enumerate() {
            self.newline();
            self.term(*a);
            if let Some(r) = recs.get(i) {
                if !self.is_nop(*r) {
                    self.out.push_str(" ::: ");
                    self.term(*r);
                }
            }
            self.out.push(';');
        }
    }

    fn block(&mut self, actions: NodeId, recovery: NodeId) {
        self.out.push('{');
        self.indent += 1;
        self.action_lines(actions, recovery);
        self.indent -= 1;
        self.newline();
        self.out.push('}');
    }

    fn args(&mut self, args: &[NodeId]) {
        self.out.push('(');
        for (i, a) in args.iter().enumerate() {
            if i > 0 {
                self.out.push_str(", ");
            }
            self.term(*a);
        }
        self.out.push(')');
    }

    fn term(&mut self, id: NodeId) {
        use Node::*;
        match &self.ast[id] {
            Int { value, .. } => {
                let _ = write!(self.out, "{value}");
            }
            Double { value, .. } => {
                let _ = write!(self.out, "{value:?}");
            }
            Bool { value, .. } => {
                let _ = write!(self.out, "{value}");
            }
            Str { value, .. } => self.out.push_str(&quote(value)),
            Path { value, .. } => self.out.push_str(value),
            Var {
                name,
                scope: VarScope::Local,
                ..
            } => {
                let _ = write!(self.out, "*{name}");
            }
            Var { name, .. } => {
                let _ = write!(self.out, "${name}");
            }
            Tuple { items, .. } => self.args(items),
            Actions { .. } => {
                let items = self.action_items(id);
                self.out.push('{');
                self.indent += 1;
                for a in items {
                    self.newline();
                    self.term(a);
                    self.out.push(';');
                }
                self.indent -= 1;
                self.newline();
                self.out.push('}');
            }
            ActionsWithRecovery {
                actions, recovery, ..
            } => self.block(*actions, *recovery),
            Query { cols, conds, .. } => {
                self.out.push_str("select ");
                for (i, c) in cols.iter().enumerate() {
                    if i > 0 {
                        self.out.push_str(", ");
                    }
                    self.term(*c);
                }
                if !conds.is_empty() {
                    self.out.push_str(" where ");
                    for (i, c) in conds.iter().enumerate() {
                        if i > 0 {
                            self.out.push_str(" and ");
                        }
                        self.term(*c);
                    }
                }
            }
            Column { func: Some(f), name, .. } => {
                let _ = write!(self.out, "{f}({name})");
            }
            Column { name, .. } => self.out.push_str(name),
            QueryCond {
                column,
                junction,
                alts,
                ..
            } => {
                self.term(*column);
                for (i, a) in alts.iter().enumerate() {
                    if i > 0 {
                        let _ = write!(self.out, " {}", junction.as_deref().unwrap_or("||"));
                    }
                    let _ = write!(self.out, " {}", a.op);
                    for v in &a.values {
                        self.out.push(' ');
                        self.term(*v);
                    }
                }
            }
            Match {
                scrutinee, clauses, ..
            } => {
                self.out.push_str("(match ");
                self.term(*scrutinee);
                self.out.push_str(" with");
                for c in clauses {
                    if let Clause { pattern, body, .. } = &self.ast[*c] {
                        self.out.push_str(" | ");
                        self.term(*pattern);
                        self.out.push_str(" => ");
                        self.term(*body);
                    }
                }
                self.out.push(')');
            }
            App { func, args, .. } => self.app(func, args),
            other => {
                // Declarations only appear at the top level.
                let _ = write!(self.out, "{other:?}");
            }
        }
    }

    fn app(&mut self, func: &str, args: &[NodeId]) {
        match (func, args) {
            ("neg", [x]) => {
                self.out.push_str("(- ");
                self.term(*x);
                self.out.push(')');
            }
            ("assign", [l, r]) => {
                self.term(*l);
                self.out.push_str(" = ");
                self.term(*r);
            }
            ("if", [c, t, e, tr, er]) => {
                self.out.push_str("if (");
                self.term(*c);
                self.out.push_str(") then ");
                self.block(*t, *tr);
                self.out.push_str(" else ");
                self.block(*e, *er);
            }
            ("if2", [c, t, e, _, _]) => {
                self.out.push_str("(if ");
                self.term(*c);
                self.out.push_str(" then ");
                self.term(*t);
                self.out.push_str(" else ");
                self.term(*e);
                self.out.push(')');
            }
            ("while", [c, body, reco]) => {
                self.out.push_str("while (");
                self.term(*c);
                self.out.push_str(") ");
                self.block(*body, *reco);
            }
            ("foreach", [v, body, reco]) => {
                self.out.push_str("foreach (");
                self.term(*v);
                self.out.push_str(") ");
                self.block(*body, *reco);
            }
            ("foreach2", [v, list, body, reco]) => {
                self.out.push_str("foreach (");
                self.term(*v);
                self.out.push_str(" in ");
                self.term(*list);
                self.out.push_str(") ");
                self.block(*body, *reco);
            }
            ("for", [init, cond, step, body, reco]) => {
                self.out.push_str("for (");
                self.term(*init);
                self.out.push_str("; ");
                self.term(*cond);
                self.out.push_str("; ");
                self.term(*step);
                self.out.push_str(") ");
                self.block(*body, *reco);
            }
            ("let", [p, e, b]) => {
                self.out.push_str("(let ");
                self.term(*p);
                self.out.push_str(" = ");
                self.term(*e);
                self.out.push_str(" in ");
                self.term(*b);
                self.out.push(')');
            }
            ("query", [q]) => self.term(*q),
            ("path", [p]) => {
                // Interpolated path: rendered as an explicit conversion.
                self.out.push_str("path");
                self.args(&[*p]);
            }
            (op, [l, r]) if binary_op(op).is_some() => {
                self.out.push('(');
                self.term(*l);
                let _ = write!(self.out, " {op} ");
                self.term(*r);
                self.out.push(')');
            }
            (op, [x]) if unary_op(op).is_some() => {
                let _ = write!(self.out, "({op} ");
                self.term(*x);
                self.out.push(')');
            }
            (name, []) => self.out.push_str(name),
            (name, args) => {
                self.out.push_str(name);
                self.args(args);
            }
        }
    }
}
