// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::ast::*;
use crate::error::RuleError;
use crate::lexer::*;
use crate::types::{ExprType, TypeParser};
use crate::*;

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Declarations visible to every rule of a rule base, collected while
/// parsing so that later rules may refer to earlier ones and vice versa.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct SymbolTable {
    pub constructors: BTreeMap<Rc<str>, ExprType>,
    pub externs: BTreeMap<Rc<str>, ExprType>,
    /// Data type name to number of type parameters.
    pub data_types: BTreeMap<Rc<str>, usize>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }
}

const KEYWORDS: &[&str] = &[
    "if",
    "then",
    "else",
    "while",
    "whileExec",
    "foreach",
    "forEachExec",
    "for",
    "forExec",
    "remote",
    "delay",
    "let",
    "in",
    "match",
    "with",
    "select",
    "SELECT",
    "where",
    "WHERE",
    "on",
    "ON",
    "or",
    "OR",
    "oron",
    "ORON",
    "data",
    "constructor",
];

const UNMATCHED: u32 = u32::MAX;

#[derive(Clone)]
struct State<'source> {
    lexer: Lexer<'source>,
    tok: Token,
    end: u32,
}

pub struct Parser<'a, 'source> {
    source: &'source Source,
    lexer: Lexer<'source>,
    tok: Token,
    end: u32,
    src: u32,
    dialect: Dialect,
    tier: Tier,
    include_dir: Option<PathBuf>,
    /// Files being parsed, outermost first. An `@include` of any of them is
    /// a cycle.
    includes: Vec<PathBuf>,
    max_text: usize,
    ast: &'a mut Ast,
    furthest: Option<(u32, String)>,
}

fn canonical(file: &str) -> PathBuf {
    let path = PathBuf::from(file);
    std::fs::canonicalize(&path).unwrap_or(path)
}

impl<'a, 'source> Parser<'a, 'source> {
    pub fn new(source: &'source Source, ast: &'a mut Ast) -> Result<Self> {
        let mut lexer = Lexer::new(source);
        let tok = lexer.next_token()?;
        let src = ast.add_source(source);
        Ok(Self {
            source,
            lexer,
            tok,
            end: 0,
            src,
            dialect: Dialect::Auto,
            tier: Tier::default(),
            include_dir: None,
            includes: if source.is_synthesized() {
                vec![]
            } else {
                vec![canonical(source.file())]
            },
            max_text: usize::MAX,
            ast,
            furthest: None,
        })
    }

    pub fn set_dialect(&mut self, dialect: Dialect) -> Result<()> {
        self.dialect = dialect;
        self.switch_lexer(dialect)
    }

    pub fn set_tier(&mut self, tier: Tier) {
        self.tier = tier;
    }

    /// Directory searched by `@include name`.
    pub fn set_include_dir(&mut self, dir: PathBuf) {
        self.include_dir = Some(dir);
    }

    /// Size limit applied to each included file.
    pub fn set_max_text(&mut self, limit: usize) {
        self.max_text = limit;
    }

    fn switch_lexer(&mut self, dialect: Dialect) -> Result<()> {
        if self.lexer.dialect() != dialect {
            self.lexer.set_dialect(dialect);
            self.lexer.resync(self.tok.span.start as usize);
            self.tok = self.lexer.next_token()?;
        }
        Ok(())
    }

    fn save(&self) -> State<'source> {
        State {
            lexer: self.lexer.clone(),
            tok: self.tok.clone(),
            end: self.end,
        }
    }

    fn restore(&mut self, state: State<'source>) {
        self.lexer = state.lexer;
        self.tok = state.tok;
        self.end = state.end;
    }

    fn record(&mut self, offset: u32, msg: String) {
        let further = match &self.furthest {
            Some((o, _)) => offset >= *o,
            None => true,
        };
        if further {
            self.furthest = Some((offset, msg));
        }
    }

    fn fail(&mut self, msg: &str) -> anyhow::Error {
        let text = self.tok.span.message("error", msg);
        self.record(self.tok.span.start, text.clone());
        RuleError::Parse(text).into()
    }

    fn unmatched(&mut self, open: &Token) -> anyhow::Error {
        let text = open
            .span
            .message("error", &format!("unmatched `{}`", open.span.text()));
        self.record(UNMATCHED, text.clone());
        RuleError::Parse(text).into()
    }

    /// The error to report once every alternative has failed.
    fn furthest_error(&mut self, fallback: anyhow::Error) -> anyhow::Error {
        match self.furthest.take() {
            Some((_, msg)) => RuleError::Parse(msg).into(),
            None => fallback,
        }
    }

    fn next_token(&mut self) -> Result<()> {
        self.end = self.tok.span.end;
        match self.lexer.next_token() {
            Ok(tok) => {
                self.tok = tok;
                Ok(())
            }
            Err(e) => {
                let offset = self.lexer.offset() as u32;
                self.record(offset, e.to_string());
                Err(e)
            }
        }
    }

    fn is(&self, text: &str) -> bool {
        self.tok.is(text)
    }

    fn is_any(&self, texts: &[&str]) -> bool {
        texts.iter().any(|t| self.tok.is(t))
    }

    /// Whether the last consumed token was a closing brace.
    fn after_brace(&self) -> bool {
        self.source
            .contents()
            .get(..self.end as usize)
            .is_some_and(|t| t.ends_with('}'))
    }

    fn expect(&mut self, text: &str, context: &str) -> Result<()> {
        if self.is(text) {
            self.next_token()
        } else {
            Err(self.fail(&format!("expecting `{text}` {context}")))
        }
    }

    fn pos(&self, start: u32) -> Pos {
        Pos {
            src: self.src,
            start,
            end: core::cmp::max(self.end, start),
        }
    }

    fn alloc(&mut self, node: Node) -> Result<NodeId> {
        self.ast.alloc(node)
    }

    fn app(&mut self, start: u32, func: &str, args: Vec<NodeId>) -> Result<NodeId> {
        let pos = self.pos(start);
        self.alloc(Node::App {
            pos,
            func: func.into(),
            args,
        })
    }

    fn nop(&mut self) -> Result<NodeId> {
        let start = self.tok.span.start;
        let pos = Pos {
            src: self.src,
            start,
            end: start,
        };
        self.alloc(Node::App {
            pos,
            func: "nop".into(),
            args: vec![],
        })
    }

    fn actions_node(&mut self, start: u32, items: Vec<NodeId>) -> Result<NodeId> {
        let pos = self.pos(start);
        self.alloc(Node::Actions { pos, items })
    }

    fn parse_type_with(
        &mut self,
        f: impl FnOnce(&mut TypeParser<'_, 'source>) -> Result<ExprType>,
    ) -> Result<ExprType> {
        self.lexer.resync(self.tok.span.start as usize);
        let result: Result<ExprType> = (|| {
            let mut tp = TypeParser::new(&mut self.lexer)?;
            let t = f(&mut tp)?;
            tp.finish();
            Ok(t)
        })();
        match result {
            Ok(t) => {
                self.tok = self.lexer.next_token()?;
                self.end = self.tok.span.start;
                Ok(t)
            }
            Err(e) => {
                let offset = self.lexer.offset() as u32;
                self.record(offset, e.to_string());
                Err(e)
            }
        }
    }

    // ---------------------------------------------------------------
    // Rule base
    // ---------------------------------------------------------------

    /// Parse every declaration and rule of the source.
    pub fn parse_rule_base(&mut self, symbols: &mut SymbolTable) -> Result<Vec<RuleDesc>> {
        let mut rules = vec![];
        loop {
            self.furthest = None;
            if self.tok.kind == TokenKind::Eof {
                break;
            }
            if self.is("@") {
                self.parse_directive(symbols, &mut rules)?;
                continue;
            }
            match self.parse_rule(symbols) {
                Ok(mut r) => rules.append(&mut r),
                Err(e) => return Err(self.furthest_error(e)),
            }
        }
        Ok(rules)
    }

    fn parse_directive(
        &mut self,
        symbols: &mut SymbolTable,
        rules: &mut Vec<RuleDesc>,
    ) -> Result<()> {
        self.expect("@", "")?;
        match self.tok.text.as_ref() {
            "backwardCompatible" => {
                self.next_token()?;
                let dialect = match self.tok.text.as_ref() {
                    "true" => Dialect::Legacy,
                    "false" => Dialect::Block,
                    "auto" => Dialect::Auto,
                    _ => bail!(self.fail("expecting true, false or auto")),
                };
                self.next_token()?;
                self.set_dialect(dialect)
            }
            "include" => {
                self.next_token()?;
                if !matches!(self.tok.kind, TokenKind::Ident | TokenKind::Str) {
                    bail!(self.fail("expecting rule base name"));
                }
                let name = self.tok.text.clone();
                let Some(dir) = self.include_dir.clone() else {
                    bail!(self.fail("@include requires a rule base directory"));
                };
                let path = dir.join(format!("{name}.re"));
                let source = match Source::from_file(&path) {
                    Ok(s) => s,
                    Err(e) => bail!(self.fail(&format!("cannot include `{name}`: {e}"))),
                };
                if self.includes.contains(&canonical(source.file())) {
                    bail!(self.fail(&format!("circular @include of `{name}`")));
                }
                let size = source.contents().len();
                if size > self.max_text {
                    bail!(RuleError::BufferOverflow {
                        size,
                        limit: self.max_text,
                    });
                }
                self.next_token()?;
                let mut includes = self.includes.clone();
                includes.push(canonical(source.file()));
                let mut parser = Parser::new(&source, &mut *self.ast)?;
                parser.include_dir = Some(dir);
                parser.includes = includes;
                parser.max_text = self.max_text;
                parser.tier = self.tier;
                parser.set_dialect(self.dialect)?;
                let mut included = parser.parse_rule_base(symbols)?;
                rules.append(&mut included);
                Ok(())
            }
            _ => Err(self.fail("unknown directive")),
        }
    }

    fn desc(&self, kind: RuleKind, node: NodeId) -> RuleDesc {
        RuleDesc {
            kind,
            node,
            typed: false,
            tier: self.tier,
        }
    }

    fn parse_rule(&mut self, symbols: &mut SymbolTable) -> Result<Vec<RuleDesc>> {
        if self.is("data") {
            return self.parse_data(symbols);
        }
        if self.is("constructor") {
            return self.parse_constructor_decl(symbols);
        }

        // `name : type` declares an external function.
        let state = self.save();
        match self.parse_extern(symbols) {
            Ok(Some(r)) => return Ok(vec![r]),
            Ok(None) => self.restore(state),
            Err(e) => {
                if matches!(
                    e.downcast_ref::<RuleError>(),
                    Some(RuleError::Redefinition(_))
                ) {
                    return Err(e);
                }
                self.restore(state)
            }
        }

        let start = self.tok.span.start;
        let (name, params, ret) = self.parse_rule_name()?;

        if self.is("|") || self.is("||") {
            if self.dialect == Dialect::Block {
                return self.parse_pipe_rule(start, name, params, ret, false);
            }
            let saved = self.lexer.dialect();
            self.switch_lexer(Dialect::Legacy)?;
            let r = self.parse_pipe_rule(start, name, params, ret, true);
            self.switch_lexer(saved)?;
            return r;
        }

        if self.dialect == Dialect::Legacy {
            bail!(self.fail("expecting `|` after rule name"));
        }

        if self.is("=") {
            self.next_token()?;
            let body = self.parse_term(0)?;
            let recovery = if self.is(":::") {
                self.next_token()?;
                self.parse_term(0)?
            } else {
                self.nop()?
            };
            let metadata = self.parse_metadata()?;
            if self.is(";") {
                self.next_token()?;
            }
            let pos = self.pos(start);
            let node = self.alloc(Node::FuncRule {
                pos,
                name,
                params,
                body,
                recovery,
                metadata,
                ret,
            })?;
            return Ok(vec![self.desc(RuleKind::Func, node)]);
        }

        if !self.is("{") {
            bail!(self.fail("expecting `{`, `=` or `|` after rule name"));
        }
        let open = self.tok.clone();
        self.next_token()?;

        let mut rules = vec![];
        loop {
            if self.tok.kind == TokenKind::Eof {
                bail!(self.unmatched(&open));
            }
            let clause_start = self.tok.span.start;
            if self.is_any(&["on", "ON", "oron", "ORON"]) {
                self.next_token()?;
                let cond = self.parse_term(0)?;
                let (actions, recovery, metadata) = self.parse_clause_body()?;
                let node = self.rule_node(
                    clause_start,
                    &name,
                    &params,
                    ret,
                    cond,
                    actions,
                    recovery,
                    metadata,
                )?;
                rules.push(self.desc(RuleKind::Rel, node));
            } else if self.is_any(&["or", "OR"]) {
                self.next_token()?;
                let cond = self.bool_node(true)?;
                let (actions, recovery, metadata) = self.parse_clause_body()?;
                let node = self.rule_node(
                    clause_start,
                    &name,
                    &params,
                    ret,
                    cond,
                    actions,
                    recovery,
                    metadata,
                )?;
                rules.push(self.desc(RuleKind::Rel, node));
            } else if !rules.is_empty() {
                self.expect("}", "to close rule")?;
                break;
            } else {
                let cond = self.bool_node(true)?;
                let (actions, recovery) = self.parse_actions(&open)?;
                self.expect("}", "to close rule")?;
                let metadata = self.parse_metadata()?;
                let node =
                    self.rule_node(start, &name, &params, ret, cond, actions, recovery, metadata)?;
                rules.push(self.desc(RuleKind::Rel, node));
                break;
            }
        }
        Ok(rules)
    }

    fn parse_clause_body(&mut self) -> Result<(NodeId, NodeId, Vec<NodeId>)> {
        if !self.is("{") {
            bail!(self.fail("expecting `{`"));
        }
        let open = self.tok.clone();
        self.next_token()?;
        let (actions, recovery) = self.parse_actions(&open)?;
        self.expect("}", "to close actions")?;
        let metadata = self.parse_metadata()?;
        Ok((actions, recovery, metadata))
    }

    fn bool_node(&mut self, value: bool) -> Result<NodeId> {
        let start = self.tok.span.start;
        let pos = Pos {
            src: self.src,
            start,
            end: start,
        };
        self.alloc(Node::Bool { pos, value })
    }

    #[allow(clippy::too_many_arguments)]
    fn rule_node(
        &mut self,
        start: u32,
        name: &Rc<str>,
        params: &[NodeId],
        ret: Option<NodeId>,
        cond: NodeId,
        actions: NodeId,
        recovery: NodeId,
        metadata: Vec<NodeId>,
    ) -> Result<NodeId> {
        let id = metadata.iter().find_map(|m| match &self.ast[*m] {
            Node::Metadata { attr, value, .. } if attr.as_ref() == "id" => value.parse().ok(),
            _ => None,
        });
        let pos = self.pos(start);
        self.alloc(Node::Rule {
            pos,
            name: name.clone(),
            params: params.to_vec(),
            cond,
            actions,
            recovery,
            metadata,
            ret,
            id,
        })
    }

    fn parse_rule_name(&mut self) -> Result<(Rc<str>, Vec<NodeId>, Option<NodeId>)> {
        if self.tok.kind != TokenKind::Ident {
            bail!(self.fail("expecting rule name"));
        }
        let name = self.tok.text.clone();
        self.next_token()?;

        let mut params = vec![];
        if self.is("(") {
            self.next_token()?;
            if self.is(")") {
                self.next_token()?;
            } else {
                loop {
                    let start = self.tok.span.start;
                    if self.tok.kind != TokenKind::LocalVar {
                        bail!(self.fail("expecting parameter"));
                    }
                    let pname = self.tok.text.clone();
                    self.next_token()?;
                    let ty = if self.is(":") {
                        self.next_token()?;
                        Some(self.parse_type_with(|tp| tp.parse_product(false))?)
                    } else {
                        None
                    };
                    let pos = self.pos(start);
                    params.push(self.alloc(Node::Param {
                        pos,
                        name: pname,
                        ty,
                    })?);
                    if self.is(",") {
                        self.next_token()?;
                    } else {
                        self.expect(")", "to close parameter list")?;
                        break;
                    }
                }
            }
        }

        let ret = if self.is(":") {
            self.next_token()?;
            let start = self.tok.span.start;
            let ty = self.parse_type_with(|tp| tp.parse_func_type())?;
            let pos = self.pos(start);
            Some(self.alloc(Node::TypeAnnot { pos, ty })?)
        } else {
            None
        };
        Ok((name, params, ret))
    }

    fn parse_metadata(&mut self) -> Result<Vec<NodeId>> {
        let mut metadata = vec![];
        while self.is("@") {
            let start = self.tok.span.start;
            self.next_token()?;
            self.expect("(", "to start metadata")?;
            let mut fields = vec![];
            loop {
                if self.tok.kind != TokenKind::Str {
                    bail!(self.fail("expecting string in metadata"));
                }
                fields.push(self.tok.text.clone());
                self.next_token()?;
                if self.is(",") && fields.len() < 3 {
                    self.next_token()?;
                } else {
                    break;
                }
            }
            self.expect(")", "to close metadata")?;
            if fields.len() < 2 {
                bail!(self.fail("metadata needs an attribute and a value"));
            }
            let unit = fields.get(2).cloned().unwrap_or_else(|| "".into());
            let pos = self.pos(start);
            metadata.push(self.alloc(Node::Metadata {
                pos,
                attr: fields[0].clone(),
                value: fields[1].clone(),
                unit,
            })?);
        }
        Ok(metadata)
    }

    fn parse_data(&mut self, symbols: &mut SymbolTable) -> Result<Vec<RuleDesc>> {
        let start = self.tok.span.start;
        self.expect("data", "")?;
        if self.tok.kind != TokenKind::Ident {
            bail!(self.fail("expecting data type name"));
        }
        let name = self.tok.text.clone();
        self.next_token()?;
        let mut params = vec![];
        if self.is("(") {
            self.next_token()?;
            while !self.is(")") {
                if self.tok.kind != TokenKind::Ident {
                    bail!(self.fail("expecting type parameter"));
                }
                params.push(self.tok.text.clone());
                self.next_token()?;
                if self.is(",") {
                    self.next_token()?;
                }
            }
            self.next_token()?;
        }
        symbols.data_types.insert(name.clone(), params.len());

        let mut constructors = vec![];
        if self.is("=") {
            self.next_token()?;
            if self.is("|") {
                self.next_token()?;
            }
            loop {
                let cons = self.parse_constructor(symbols)?;
                constructors.push(cons);
                if self.is("|") {
                    self.next_token()?;
                } else {
                    break;
                }
            }
        }
        if self.is(";") {
            self.next_token()?;
        }
        let pos = self.pos(start);
        let node = self.alloc(Node::Data {
            pos,
            name,
            params,
            constructors: constructors.clone(),
        })?;
        let mut rules = vec![self.desc(RuleKind::Data, node)];
        for c in constructors {
            rules.push(self.desc(RuleKind::Constructor, c));
        }
        Ok(rules)
    }

    fn parse_constructor_decl(&mut self, symbols: &mut SymbolTable) -> Result<Vec<RuleDesc>> {
        self.expect("constructor", "")?;
        let node = self.parse_constructor(symbols)?;
        Ok(vec![self.desc(RuleKind::Constructor, node)])
    }

    fn redefinition(&mut self, span: &Span, name: &str) -> anyhow::Error {
        RuleError::Redefinition(span.message("error", &format!("redefinition of `{name}`"))).into()
    }

    fn parse_constructor(&mut self, symbols: &mut SymbolTable) -> Result<NodeId> {
        let start = self.tok.span.start;
        let name_tok = self.tok.clone();
        if name_tok.kind != TokenKind::Ident {
            bail!(self.fail("expecting constructor name"));
        }
        self.next_token()?;
        self.expect(":", "after constructor name")?;
        let ty = self.parse_type_with(|tp| tp.parse_func_type())?;
        let name = name_tok.text.clone();
        if symbols.constructors.contains_key(&name) || symbols.externs.contains_key(&name) {
            bail!(self.redefinition(&name_tok.span, &name));
        }
        symbols.constructors.insert(name.clone(), ty.clone());
        let pos = self.pos(start);
        self.alloc(Node::Constructor { pos, name, ty })
    }

    fn parse_extern(&mut self, symbols: &mut SymbolTable) -> Result<Option<RuleDesc>> {
        let start = self.tok.span.start;
        let name_tok = self.tok.clone();
        if name_tok.kind != TokenKind::Ident || !self.lexer.peek_token()?.is(":") {
            return Ok(None);
        }
        self.next_token()?;
        self.next_token()?;
        let ty = self.parse_type_with(|tp| tp.parse_func_type())?;
        if self.is_any(&["{", "=", "|", "||"]) {
            // A nullary rule with a declared result type.
            return Ok(None);
        }
        let name = name_tok.text.clone();
        if symbols.externs.contains_key(&name) || symbols.constructors.contains_key(&name) {
            bail!(self.redefinition(&name_tok.span, &name));
        }
        if self.is(";") {
            self.next_token()?;
        }
        symbols.externs.insert(name.clone(), ty.clone());
        let pos = self.pos(start);
        let node = self.alloc(Node::Extern { pos, name, ty })?;
        Ok(Some(self.desc(RuleKind::Extern, node)))
    }

    // head | cond | actions | recovery [| id]
    fn parse_pipe_rule(
        &mut self,
        start: u32,
        name: Rc<str>,
        params: Vec<NodeId>,
        ret: Option<NodeId>,
        legacy: bool,
    ) -> Result<Vec<RuleDesc>> {
        self.expect("|", "after rule name")?;
        let cond = if self.is("|") {
            self.bool_node(true)?
        } else if legacy {
            self.parse_bc_expr(0)?
        } else {
            self.parse_term(0)?
        };
        self.expect("|", "after rule condition")?;
        let actions = self.parse_pipe_actions(legacy)?;
        self.expect("|", "after rule actions")?;
        let recovery = self.parse_pipe_actions(legacy)?;

        let mut metadata = vec![];
        if self.is("|") {
            let id_start = self.tok.span.start;
            self.next_token()?;
            if self.tok.kind != TokenKind::Int {
                bail!(self.fail("expecting rule id"));
            }
            let value = self.tok.text.clone();
            self.next_token()?;
            let pos = self.pos(id_start);
            metadata.push(self.alloc(Node::Metadata {
                pos,
                attr: "id".into(),
                value,
                unit: "".into(),
            })?);
        }
        let node = self.rule_node(
            start, &name, &params, ret, cond, actions, recovery, metadata,
        )?;
        Ok(vec![self.desc(RuleKind::Rel, node)])
    }

    /// `a1 ## a2 ## ...`
    fn parse_pipe_actions(&mut self, legacy: bool) -> Result<NodeId> {
        let start = self.tok.span.start;
        let mut items = vec![];
        loop {
            let item = if legacy {
                self.parse_bc_term()?
            } else {
                self.parse_term(0)?
            };
            items.push(item);
            if self.is("##") {
                self.next_token()?;
            } else {
                break;
            }
        }
        self.actions_node(start, items)
    }

    // ---------------------------------------------------------------
    // Block syntax
    // ---------------------------------------------------------------

    /// Actions up to (not including) the closing brace matching `open`,
    /// each optionally followed by `::: recovery`.
    fn parse_actions(&mut self, open: &Token) -> Result<(NodeId, NodeId)> {
        let start = self.tok.span.start;
        let mut items = vec![];
        let mut recovery = vec![];
        loop {
            if self.tok.kind == TokenKind::Eof {
                bail!(self.unmatched(open));
            }
            if self.is("}") {
                break;
            }
            items.push(self.parse_term(0)?);
            if self.is(":::") {
                self.next_token()?;
                recovery.push(self.parse_term(0)?);
            } else {
                recovery.push(self.nop()?);
            }
            if self.is(";") {
                self.next_token()?;
            }
        }
        let actions = self.actions_node(start, items)?;
        let recovery = self.actions_node(start, recovery)?;
        Ok((actions, recovery))
    }

    fn parse_braced_actions(&mut self) -> Result<(NodeId, NodeId)> {
        if !self.is("{") {
            bail!(self.fail("expecting `{`"));
        }
        let open = self.tok.clone();
        self.next_token()?;
        let r = self.parse_actions(&open)?;
        self.expect("}", "to close actions")?;
        Ok(r)
    }

    /// Precedence climbing over the binary operator table.
    pub fn parse_term(&mut self, prec: u8) -> Result<NodeId> {
        let start = self.tok.span.start;
        let mut lhs = self.parse_value()?;
        loop {
            if self.tok.kind != TokenKind::Op {
                break;
            }
            let Some(op) = binary_op(&self.tok.text) else {
                break;
            };
            if prec >= op.prec {
                break;
            }
            let func = if op.text == "=" { "assign" } else { op.text };
            self.next_token()?;
            let rhs = self.parse_term(op.prec)?;
            lhs = self.app(start, func, vec![lhs, rhs])?;
        }
        Ok(lhs)
    }

    fn parse_value(&mut self) -> Result<NodeId> {
        let start = self.tok.span.start;
        let tok = self.tok.clone();
        match tok.kind {
            TokenKind::LocalVar | TokenKind::SessionVar => {
                self.next_token()?;
                let scope = if tok.kind == TokenKind::LocalVar {
                    VarScope::Local
                } else {
                    VarScope::Session
                };
                let pos = self.pos(start);
                self.alloc(Node::Var {
                    pos,
                    name: tok.text.clone(),
                    scope,
                })
            }
            TokenKind::Int => {
                let value = match tok.text.parse::<i64>() {
                    Ok(v) => v,
                    Err(_) => bail!(self.fail("integer out of range")),
                };
                self.next_token()?;
                let pos = self.pos(start);
                self.alloc(Node::Int { pos, value })
            }
            TokenKind::Double => {
                let value = match tok.text.parse::<f64>() {
                    Ok(v) => v,
                    Err(_) => bail!(self.fail("invalid double")),
                };
                self.next_token()?;
                let pos = self.pos(start);
                self.alloc(Node::Double { pos, value })
            }
            TokenKind::Bool => {
                self.next_token()?;
                let pos = self.pos(start);
                self.alloc(Node::Bool {
                    pos,
                    value: tok.text.as_ref() == "true",
                })
            }
            TokenKind::Str | TokenKind::RawStr => {
                self.next_token()?;
                self.string_expression(&tok)
            }
            TokenKind::Punct if tok.is("(") => {
                self.next_token()?;
                if self.is(")") {
                    self.next_token()?;
                    let pos = self.pos(start);
                    return self.alloc(Node::Tuple { pos, items: vec![] });
                }
                let mut items = vec![self.parse_term(0)?];
                while self.is(",") {
                    self.next_token()?;
                    items.push(self.parse_term(0)?);
                }
                self.expect(")", "to close parenthesized term")?;
                if items.len() == 1 {
                    return Ok(items[0]);
                }
                let pos = self.pos(start);
                self.alloc(Node::Tuple { pos, items })
            }
            TokenKind::Punct if tok.is("{") => {
                let (actions, recovery) = self.parse_braced_actions()?;
                let pos = self.pos(start);
                self.alloc(Node::ActionsWithRecovery {
                    pos,
                    actions,
                    recovery,
                })
            }
            TokenKind::Op if tok.is("/") => self.parse_path(),
            TokenKind::Op => {
                let Some(op) = unary_op(&tok.text) else {
                    bail!(self.fail("unexpected operator"));
                };
                self.next_token()?;
                let arg = self.parse_term(op.prec)?;
                let func = if op.text == "-" { "neg" } else { op.text };
                self.app(start, func, vec![arg])
            }
            TokenKind::Ident => self.parse_ident_value(),
            TokenKind::Eof => Err(self.fail("unexpected end of input")),
            _ => Err(self.fail("unexpected token")),
        }
    }

    fn parse_path(&mut self) -> Result<NodeId> {
        let start = self.tok.span.start;
        self.lexer.resync(start as usize);
        let tok = self.lexer.next_path_token()?;
        self.tok = tok.clone();
        self.next_token()?;
        if tok.vars.is_empty() {
            let pos = self.pos(start);
            return self.alloc(Node::Path {
                pos,
                value: tok.text.clone(),
            });
        }
        let s = self.string_expression(&tok)?;
        self.app(start, "path", vec![s])
    }

    /// Desugar `"a*x b"` into `"a" ++ str(*x) ++ " b"`.
    fn string_expression(&mut self, tok: &Token) -> Result<NodeId> {
        let start = tok.span.start;
        let pos = Pos {
            src: self.src,
            start,
            end: tok.span.end,
        };
        let text = tok.text.as_ref();
        let mut parts = vec![];
        let mut last = 0usize;
        for (vs, ve) in &tok.vars {
            let (vs, ve) = (*vs as usize, *ve as usize);
            if vs > last {
                parts.push(self.alloc(Node::Str {
                    pos,
                    value: text[last..vs].into(),
                })?);
            }
            let scope = if text[vs..].starts_with('*') {
                VarScope::Local
            } else {
                VarScope::Session
            };
            let var = self.alloc(Node::Var {
                pos,
                name: text[vs + 1..ve].into(),
                scope,
            })?;
            parts.push(self.alloc(Node::App {
                pos,
                func: "str".into(),
                args: vec![var],
            })?);
            last = ve;
        }
        if last < text.len() || parts.is_empty() {
            parts.push(self.alloc(Node::Str {
                pos,
                value: text[last..].into(),
            })?);
        }
        let mut iter = parts.into_iter();
        let mut acc = match iter.next() {
            Some(p) => p,
            None => bail!(self.fail("empty string expression")),
        };
        for p in iter {
            acc = self.alloc(Node::App {
                pos,
                func: "++".into(),
                args: vec![acc, p],
            })?;
        }
        Ok(acc)
    }

    fn parse_ident_value(&mut self) -> Result<NodeId> {
        let start = self.tok.span.start;
        let name = self.tok.text.clone();
        match name.as_ref() {
            "if" => return self.parse_if(),
            "while" | "whileExec" => {
                self.next_token()?;
                self.expect("(", "after while")?;
                let cond = self.parse_term(0)?;
                self.expect(")", "to close while condition")?;
                let (body, reco) = self.parse_braced_actions()?;
                return self.app(start, "while", vec![cond, body, reco]);
            }
            "foreach" | "forEachExec" => {
                self.next_token()?;
                self.expect("(", "after foreach")?;
                let var = self.parse_local_var()?;
                if self.is("in") {
                    self.next_token()?;
                    let list = self.parse_term(0)?;
                    self.expect(")", "to close foreach")?;
                    let (body, reco) = self.parse_braced_actions()?;
                    return self.app(start, "foreach2", vec![var, list, body, reco]);
                }
                self.expect(")", "to close foreach")?;
                let (body, reco) = self.parse_braced_actions()?;
                return self.app(start, "foreach", vec![var, body, reco]);
            }
            "for" | "forExec" => {
                self.next_token()?;
                self.expect("(", "after for")?;
                let init = self.parse_term(0)?;
                self.expect(";", "after for initializer")?;
                let cond = self.parse_term(0)?;
                self.expect(";", "after for condition")?;
                let step = self.parse_term(0)?;
                self.expect(")", "to close for")?;
                let (body, reco) = self.parse_braced_actions()?;
                return self.app(start, "for", vec![init, cond, step, body, reco]);
            }
            "remote" => {
                self.next_token()?;
                self.expect("(", "after remote")?;
                let host = self.parse_term(0)?;
                self.expect(",", "after remote host")?;
                let hint = self.parse_term(0)?;
                self.expect(")", "to close remote")?;
                let (text, empty) = self.parse_quoted_actions()?;
                return self.app(start, "remoteExec", vec![host, hint, text, empty]);
            }
            "delay" => {
                self.next_token()?;
                self.expect("(", "after delay")?;
                let hint = self.parse_term(0)?;
                self.expect(")", "to close delay")?;
                let (text, empty) = self.parse_quoted_actions()?;
                return self.app(start, "delayExec", vec![hint, text, empty]);
            }
            "let" => {
                self.next_token()?;
                let pattern = self.parse_term(2)?;
                self.expect("=", "in let")?;
                let value = self.parse_term(0)?;
                self.expect("in", "in let")?;
                let body = self.parse_term(0)?;
                return self.app(start, "let", vec![pattern, value, body]);
            }
            "match" => return self.parse_match(),
            "select" | "SELECT" => return self.parse_query(),
            _ => (),
        }
        if KEYWORDS.contains(&name.as_ref()) {
            bail!(self.fail(&format!("unexpected keyword `{name}`")));
        }
        self.next_token()?;
        let mut args = vec![];
        if self.is("(") {
            self.next_token()?;
            if !self.is(")") {
                loop {
                    args.push(self.parse_term(0)?);
                    if self.is(",") {
                        self.next_token()?;
                    } else {
                        break;
                    }
                }
            }
            self.expect(")", "to close argument list")?;
        }
        self.app(start, &name, args)
    }

    fn parse_local_var(&mut self) -> Result<NodeId> {
        let start = self.tok.span.start;
        if self.tok.kind != TokenKind::LocalVar {
            bail!(self.fail("expecting local variable"));
        }
        let name = self.tok.text.clone();
        self.next_token()?;
        let pos = self.pos(start);
        self.alloc(Node::Var {
            pos,
            name,
            scope: VarScope::Local,
        })
    }

    // The action text of `remote`/`delay` is shipped verbatim.
    fn parse_quoted_actions(&mut self) -> Result<(NodeId, NodeId)> {
        if !self.is("{") {
            bail!(self.fail("expecting `{`"));
        }
        let open = self.tok.clone();
        self.next_token()?;
        let text_start = open.span.end;
        self.parse_actions(&open)?;
        let text_end = self.tok.span.start;
        self.expect("}", "to close actions")?;
        let text = self.source.contents()[text_start as usize..text_end as usize].trim();
        let pos = self.pos(text_start);
        let text = self.alloc(Node::Str {
            pos,
            value: text.into(),
        })?;
        let empty = self.alloc(Node::Str {
            pos,
            value: "".into(),
        })?;
        Ok((text, empty))
    }

    fn parse_if(&mut self) -> Result<NodeId> {
        let start = self.tok.span.start;
        self.expect("if", "")?;

        // if (cond) [then] { .. } [else { .. } | else if ..]
        let state = self.save();
        match self.parse_if_block(start) {
            Ok(node) => return Ok(node),
            Err(_) => self.restore(state),
        }

        // if cond then expr else expr
        let cond = self.parse_term(0)?;
        self.expect("then", "in if expression")?;
        let then = self.parse_term(0)?;
        let then_reco = self.nop()?;
        self.expect("else", "in if expression")?;
        let otherwise = self.parse_term(0)?;
        let else_reco = self.nop()?;
        self.app(start, "if2", vec![cond, then, otherwise, then_reco, else_reco])
    }

    fn parse_if_block(&mut self, start: u32) -> Result<NodeId> {
        self.expect("(", "after if")?;
        let cond = self.parse_term(0)?;
        self.expect(")", "to close if condition")?;
        if self.is("then") {
            self.next_token()?;
        }
        let (then, then_reco) = self.parse_braced_actions()?;
        let (otherwise, else_reco) = if self.is("else") {
            self.next_token()?;
            if self.is("if") {
                let else_start = self.tok.span.start;
                let nested = self.parse_term(0)?;
                let a = self.actions_node(else_start, vec![nested])?;
                let nop = self.nop()?;
                let r = self.actions_node(else_start, vec![nop])?;
                (a, r)
            } else {
                self.parse_braced_actions()?
            }
        } else {
            let here = self.end;
            let nop = self.nop()?;
            let a = self.actions_node(here, vec![nop])?;
            let nop = self.nop()?;
            let r = self.actions_node(here, vec![nop])?;
            (a, r)
        };
        self.app(start, "if", vec![cond, then, otherwise, then_reco, else_reco])
    }

    fn parse_match(&mut self) -> Result<NodeId> {
        let start = self.tok.span.start;
        self.expect("match", "")?;
        let scrutinee = self.parse_term(2)?;
        self.expect("with", "in match")?;
        if self.is("|") {
            self.next_token()?;
        }
        let mut clauses = vec![];
        loop {
            let clause_start = self.tok.span.start;
            let pattern = self.parse_term(0)?;
            self.expect("=>", "in match clause")?;
            let body = self.parse_term(0)?;
            let pos = self.pos(clause_start);
            clauses.push(self.alloc(Node::Clause { pos, pattern, body })?);
            if self.is("|") {
                self.next_token()?;
            } else {
                break;
            }
        }
        let pos = self.pos(start);
        self.alloc(Node::Match {
            pos,
            scrutinee,
            clauses,
        })
    }

    fn is_word(&self, word: &str) -> bool {
        self.tok.kind == TokenKind::Ident && self.tok.text.eq_ignore_ascii_case(word)
    }

    fn parse_query(&mut self) -> Result<NodeId> {
        let start = self.tok.span.start;
        self.next_token()?;
        let mut cols = vec![];
        loop {
            cols.push(self.parse_column()?);
            if self.is(",") {
                self.next_token()?;
            } else {
                break;
            }
        }
        let mut conds = vec![];
        if self.is_word("where") {
            self.next_token()?;
            loop {
                conds.push(self.parse_query_cond()?);
                if self.is_word("and") {
                    self.next_token()?;
                } else {
                    break;
                }
            }
        }
        let pos = self.pos(start);
        let q = self.alloc(Node::Query { pos, cols, conds })?;
        self.app(start, "query", vec![q])
    }

    fn parse_column(&mut self) -> Result<NodeId> {
        let start = self.tok.span.start;
        if self.tok.kind != TokenKind::Ident {
            bail!(self.fail("expecting column name"));
        }
        let word = self.tok.text.to_ascii_lowercase();
        let func = match word.as_str() {
            "count" | "sum" | "order" | "order_desc" => Some(word.clone()),
            "order_asc" => Some("order".to_string()),
            _ => None,
        };
        if let Some(func) = func {
            if self.lexer.peek_token()?.is("(") {
                self.next_token()?;
                self.next_token()?;
                if self.tok.kind != TokenKind::Ident {
                    bail!(self.fail("expecting column name"));
                }
                let name = self.tok.text.clone();
                self.next_token()?;
                self.expect(")", "to close column function")?;
                let pos = self.pos(start);
                return self.alloc(Node::Column {
                    pos,
                    func: Some(func.into()),
                    name,
                });
            }
        }
        let name = self.tok.text.clone();
        self.next_token()?;
        let pos = self.pos(start);
        self.alloc(Node::Column {
            pos,
            func: None,
            name,
        })
    }

    fn parse_query_cond(&mut self) -> Result<NodeId> {
        let start = self.tok.span.start;
        let column = self.parse_column()?;
        let mut junction: Option<Rc<str>> = None;
        let mut alts = vec![];
        loop {
            let op: &str = if self.is_any(&["=", "=="]) {
                "="
            } else if self.is_any(&["<>", "!="]) {
                "<>"
            } else if self.is_any(&[">", "<", ">=", "<="]) {
                match self.tok.text.as_ref() {
                    ">" => ">",
                    "<" => "<",
                    ">=" => ">=",
                    _ => "<=",
                }
            } else if self.is_word("in") {
                "in"
            } else if self.is_word("between") {
                "between"
            } else if self.is("like") || self.is_word("like") {
                "like"
            } else if self.is("not like") {
                "not like"
            } else if self.is_word("not") {
                self.next_token()?;
                if !(self.is("like") || self.is_word("like")) {
                    bail!(self.fail("expecting `like` after `not`"));
                }
                "not like"
            } else {
                bail!(self.fail("expecting query condition operator"));
            };
            self.next_token()?;
            let mut values = vec![self.parse_value()?];
            if op == "between" {
                values.push(self.parse_value()?);
            }
            alts.push(QueryAlt {
                op: op.into(),
                values,
            });
            let next = if self.is("||") {
                "||"
            } else if self.is("&&") {
                "&&"
            } else {
                break;
            };
            if junction.as_deref().is_some_and(|j| j != next) {
                bail!(self.fail("cannot mix `||` and `&&` in one query condition"));
            }
            junction = Some(next.into());
            self.next_token()?;
        }
        let pos = self.pos(start);
        self.alloc(Node::QueryCond {
            pos,
            column,
            junction,
            alts,
        })
    }

    // ---------------------------------------------------------------
    // Legacy syntax
    // ---------------------------------------------------------------

    fn parse_bc_value(&mut self) -> Result<NodeId> {
        match self.tok.kind {
            TokenKind::LocalVar
            | TokenKind::SessionVar
            | TokenKind::Int
            | TokenKind::Double
            | TokenKind::Bool => self.parse_value(),
            _ => Err(self.fail("expecting variable or number")),
        }
    }

    fn wrap(&mut self, func: &str, arg: NodeId) -> Result<NodeId> {
        let pos = self.ast[arg].pos();
        self.alloc(Node::App {
            pos,
            func: func.into(),
            args: vec![arg],
        })
    }

    /// Legacy condition: an operand, optionally followed by one binary
    /// operator whose operands are converted to the operator's domain.
    fn parse_bc_expr(&mut self, level: u8) -> Result<NodeId> {
        let start = self.tok.span.start;
        let lhs = if level == 0 && self.tok.kind == TokenKind::Ident {
            self.parse_bc_term()?
        } else if self.is("(") {
            self.next_token()?;
            let e = self.parse_bc_expr(level)?;
            self.expect(")", "to close expression")?;
            e
        } else {
            self.parse_bc_value()?
        };

        if self.tok.kind != TokenKind::Op {
            return Ok(lhs);
        }
        let Some(op) = binary_op(&self.tok.text) else {
            return Ok(lhs);
        };
        let func = op.text;
        self.next_token()?;
        let (lhs, rhs) = match func {
            "like" | "not like" | "==" | "!=" => {
                let l = self.wrap("str", lhs)?;
                let r = self.parse_bc_argument()?;
                (l, r)
            }
            "+" | "-" | "*" | "/" | "<" | "<=" | ">" | ">=" => {
                let l = self.wrap("double", lhs)?;
                let r = self.parse_bc_expr(1)?;
                (l, self.wrap("double", r)?)
            }
            "%%" | "&&" => {
                let l = self.wrap("bool", lhs)?;
                let r = self.parse_bc_expr(1)?;
                (l, self.wrap("bool", r)?)
            }
            _ => {
                let l = self.wrap("str", lhs)?;
                let r = self.parse_bc_expr(1)?;
                (l, self.wrap("str", r)?)
            }
        };
        self.app(start, func, vec![lhs, rhs])
    }

    /// Raw legacy argument: a lone variable, or verbatim text treated as an
    /// interpolated string.
    fn parse_bc_argument(&mut self) -> Result<NodeId> {
        if self.tok.kind == TokenKind::LocalVar {
            let peek = self.lexer.peek_token()?;
            if peek.is(",") || peek.is("|") || peek.is(")") {
                return self.parse_value();
            }
        }
        self.lexer.resync(self.tok.span.start as usize);
        let tok = match self.lexer.read_raw_argument() {
            Ok(t) => t,
            Err(e) => {
                self.record(self.tok.span.start, e.to_string());
                return Err(e);
            }
        };
        self.tok = tok.clone();
        self.next_token()?;
        self.string_expression(&tok)
    }

    fn parse_bc_actions(&mut self) -> Result<NodeId> {
        let start = self.tok.span.start;
        let mut items = vec![self.parse_bc_term()?];
        while self.is("##") {
            self.next_token()?;
            items.push(self.parse_bc_term()?);
        }
        self.actions_node(start, items)
    }

    fn parse_bc_term(&mut self) -> Result<NodeId> {
        let start = self.tok.span.start;
        if self.tok.kind != TokenKind::Ident {
            bail!(self.fail("expecting action"));
        }
        let name = self.tok.text.clone();
        match name.as_ref() {
            "ifExec" => {
                self.next_token()?;
                self.expect("(", "after ifExec")?;
                let cond = self.parse_bc_expr(0)?;
                self.expect(",", "in ifExec")?;
                let then = self.parse_bc_actions()?;
                self.expect(",", "in ifExec")?;
                let then_reco = self.parse_bc_actions()?;
                self.expect(",", "in ifExec")?;
                let otherwise = self.parse_bc_actions()?;
                self.expect(",", "in ifExec")?;
                let else_reco = self.parse_bc_actions()?;
                self.expect(")", "to close ifExec")?;
                self.app(start, "if", vec![cond, then, otherwise, then_reco, else_reco])
            }
            "whileExec" => {
                self.next_token()?;
                self.expect("(", "after whileExec")?;
                let cond = self.parse_bc_expr(0)?;
                self.expect(",", "in whileExec")?;
                let body = self.parse_bc_actions()?;
                self.expect(",", "in whileExec")?;
                let reco = self.parse_bc_actions()?;
                self.expect(")", "to close whileExec")?;
                self.app(start, "while", vec![cond, body, reco])
            }
            "forEachExec" => {
                self.next_token()?;
                self.expect("(", "after forEachExec")?;
                let var = self.parse_local_var()?;
                self.expect(",", "in forEachExec")?;
                let body = self.parse_bc_actions()?;
                self.expect(",", "in forEachExec")?;
                let reco = self.parse_bc_actions()?;
                self.expect(")", "to close forEachExec")?;
                self.app(start, "foreach", vec![var, body, reco])
            }
            "forExec" => {
                self.next_token()?;
                self.expect("(", "after forExec")?;
                let init = self.parse_term(0)?;
                self.expect(",", "in forExec")?;
                let cond = self.parse_term(0)?;
                self.expect(",", "in forExec")?;
                let step = self.parse_term(0)?;
                self.expect(",", "in forExec")?;
                let body = self.parse_bc_actions()?;
                self.expect(",", "in forExec")?;
                let reco = self.parse_bc_actions()?;
                self.expect(")", "to close forExec")?;
                self.app(start, "for", vec![init, cond, step, body, reco])
            }
            "assign" => {
                self.next_token()?;
                self.expect("(", "after assign")?;
                let var = self.parse_local_var()?;
                self.expect(",", "in assign")?;
                let state = self.save();
                let value = match self.parse_bc_expr(1) {
                    Ok(v) if self.is(")") => v,
                    _ => {
                        self.restore(state);
                        self.parse_bc_argument()?
                    }
                };
                self.expect(")", "to close assign")?;
                self.app(start, "assign", vec![var, value])
            }
            "breakExec" => {
                self.next_token()?;
                self.app(start, "break", vec![])
            }
            "delayExec" => {
                self.next_token()?;
                self.expect("(", "after delayExec")?;
                let hint = self.parse_bc_argument()?;
                self.expect(",", "in delayExec")?;
                let actions = self.parse_raw_string()?;
                self.expect(",", "in delayExec")?;
                let reco = self.parse_raw_string()?;
                self.expect(")", "to close delayExec")?;
                self.app(start, "delayExec", vec![hint, actions, reco])
            }
            "remoteExec" => {
                self.next_token()?;
                self.expect("(", "after remoteExec")?;
                let host = self.parse_bc_argument()?;
                self.expect(",", "in remoteExec")?;
                let hint = self.parse_bc_argument()?;
                self.expect(",", "in remoteExec")?;
                let actions = self.parse_raw_string()?;
                self.expect(",", "in remoteExec")?;
                let reco = self.parse_raw_string()?;
                self.expect(")", "to close remoteExec")?;
                self.app(start, "remoteExec", vec![host, hint, actions, reco])
            }
            _ => {
                self.next_token()?;
                let mut args = vec![];
                if self.is("(") {
                    self.next_token()?;
                    if !self.is(")") {
                        loop {
                            args.push(self.parse_bc_argument()?);
                            if self.is(",") {
                                self.next_token()?;
                            } else {
                                break;
                            }
                        }
                    }
                    self.expect(")", "to close argument list")?;
                }
                self.app(start, &name, args)
            }
        }
    }

    fn parse_raw_string(&mut self) -> Result<NodeId> {
        self.lexer.resync(self.tok.span.start as usize);
        let tok = self.lexer.read_raw_argument()?;
        self.tok = tok.clone();
        self.next_token()?;
        let pos = self.pos(tok.span.start);
        self.alloc(Node::Str {
            pos,
            value: tok.text.clone(),
        })
    }

    // ---------------------------------------------------------------
    // Entry points for runtime text
    // ---------------------------------------------------------------

    /// Parse the whole source as a single term.
    pub fn parse_whole_term(&mut self) -> Result<NodeId> {
        let term = match self.parse_term(0) {
            Ok(t) => t,
            Err(e) => return Err(self.furthest_error(e)),
        };
        if self.tok.kind != TokenKind::Eof {
            let msg = self.tok.span.message("error", "unparsed suffix");
            bail!(RuleError::UnparsedSuffix(msg));
        }
        Ok(term)
    }

    /// Parse the whole source as an action sequence. Block syntax
    /// (`a ::: r; b`) and legacy syntax (`a ## b`) are both accepted.
    pub fn parse_action_text(&mut self) -> Result<(NodeId, NodeId)> {
        let state = self.save();
        let start = self.tok.span.start;
        let block = (|| -> Result<(NodeId, NodeId)> {
            let mut items = vec![];
            let mut recovery = vec![];
            while self.tok.kind != TokenKind::Eof {
                items.push(self.parse_term(0)?);
                if self.is(":::") {
                    self.next_token()?;
                    recovery.push(self.parse_term(0)?);
                } else {
                    recovery.push(self.nop()?);
                }
                if self.is(";") {
                    self.next_token()?;
                } else if self.tok.kind != TokenKind::Eof && !self.after_brace() {
                    bail!(self.fail("expecting `;` between actions"));
                }
            }
            let a = self.actions_node(start, items)?;
            let r = self.actions_node(start, recovery)?;
            Ok((a, r))
        })();
        match block {
            Ok(r) => Ok(r),
            Err(e) => {
                self.restore(state);
                self.switch_lexer(Dialect::Legacy)?;
                let legacy = (|| -> Result<(NodeId, NodeId)> {
                    let a = self.parse_bc_actions()?;
                    if self.tok.kind != TokenKind::Eof {
                        bail!(self.fail("unparsed suffix"));
                    }
                    let nop = self.nop()?;
                    let r = self.actions_node(start, vec![nop])?;
                    Ok((a, r))
                })();
                legacy.map_err(|_| self.furthest_error(e))
            }
        }
    }
}

/// Parse a rule base source into `ast`.
pub fn parse_rule_base(
    source: &Source,
    dialect: Dialect,
    symbols: &mut SymbolTable,
    ast: &mut Ast,
) -> Result<Vec<RuleDesc>> {
    let mut parser = Parser::new(source, ast)?;
    parser.set_dialect(dialect)?;
    parser.parse_rule_base(symbols)
}

/// Parse a source consisting of one term.
pub fn parse_term(source: &Source, ast: &mut Ast) -> Result<NodeId> {
    let mut parser = Parser::new(source, ast)?;
    parser.set_dialect(Dialect::Block)?;
    parser.parse_whole_term()
}
