// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::lexer::*;
use crate::*;

use std::collections::BTreeMap;
use core::fmt;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// How an argument is passed to a function parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IoTag {
    /// Evaluated before the call.
    Input,
    /// Not evaluated; the result is written back to the argument variable.
    Output,
    /// Passed unevaluated as an expression.
    Expression,
    /// Passed unevaluated as an action sequence.
    Actions,
    /// Evaluated, and written back when the argument is a variable.
    Dynamic,
}

/// Variadic marker of the last parameter.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Arity {
    #[default]
    Once,
    /// `?`: zero or one extra argument.
    Optional,
    /// `*`: any number of extra arguments.
    Star,
    /// `+`: at least one extra argument.
    Plus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExprType {
    Int,
    Double,
    Bool,
    String,
    Path,
    Time,
    Dynamic,
    Type,
    Unit,
    /// Type variable. A non-empty `bounds` restricts it to one of the listed
    /// base types.
    Var {
        id: u32,
        bounds: Vec<ExprType>,
    },
    /// Constructed type: `list`, user data types and backquoted external types.
    Cons {
        name: Rc<str>,
        args: Vec<ExprType>,
    },
    Tuple(Vec<ExprType>),
    Func {
        params: Vec<ExprType>,
        ret: Box<ExprType>,
        arity: Arity,
    },
    /// Accepts any type coercible to the inner one.
    Flex(Box<ExprType>),
    /// Accepts the first type, coerced to the second.
    Fixed(Box<ExprType>, Box<ExprType>),
    Io(IoTag, Box<ExprType>),
}

pub const LIST: &str = "list";

impl ExprType {
    pub fn list(elem: ExprType) -> ExprType {
        ExprType::Cons {
            name: LIST.into(),
            args: vec![elem],
        }
    }

    pub fn var(id: u32) -> ExprType {
        ExprType::Var { id, bounds: vec![] }
    }

    pub fn is_base(&self) -> bool {
        matches!(
            self,
            ExprType::Int
                | ExprType::Double
                | ExprType::Bool
                | ExprType::String
                | ExprType::Path
                | ExprType::Time
                | ExprType::Type
        )
    }

    /// The base types an unbounded variable may stand for.
    pub fn all_base() -> Vec<ExprType> {
        vec![
            ExprType::Int,
            ExprType::Double,
            ExprType::Bool,
            ExprType::String,
            ExprType::Path,
            ExprType::Time,
        ]
    }

    pub fn io_tag(&self) -> IoTag {
        match self {
            ExprType::Io(tag, _) => *tag,
            _ => IoTag::Input,
        }
    }

    /// Strip the io tag.
    pub fn payload(&self) -> &ExprType {
        match self {
            ExprType::Io(_, t) => t,
            t => t,
        }
    }

    /// Copy with every variable renamed to a fresh one. Occurrences of the
    /// same variable map to the same fresh variable.
    pub fn instantiate(&self, fresh: &mut dyn FnMut() -> u32) -> ExprType {
        let mut map = BTreeMap::new();
        self.rename(&mut map, fresh)
    }

    fn rename(&self, map: &mut BTreeMap<u32, u32>, fresh: &mut dyn FnMut() -> u32) -> ExprType {
        use ExprType::*;
        match self {
            Var { id, bounds } => {
                let id = *map.entry(*id).or_insert_with(|| fresh());
                Var {
                    id,
                    bounds: bounds.clone(),
                }
            }
            Cons { name, args } => Cons {
                name: name.clone(),
                args: args.iter().map(|a| a.rename(map, fresh)).collect(),
            },
            Tuple(elems) => Tuple(elems.iter().map(|a| a.rename(map, fresh)).collect()),
            Func { params, ret, arity } => Func {
                params: params.iter().map(|a| a.rename(map, fresh)).collect(),
                ret: Box::new(ret.rename(map, fresh)),
                arity: *arity,
            },
            Flex(t) => Flex(Box::new(t.rename(map, fresh))),
            Fixed(a, b) => Fixed(Box::new(a.rename(map, fresh)), Box::new(b.rename(map, fresh))),
            Io(tag, t) => Io(*tag, Box::new(t.rename(map, fresh))),
            t => t.clone(),
        }
    }

    /// True if variable `id` occurs in `self`.
    pub fn occurs(&self, id: u32) -> bool {
        use ExprType::*;
        match self {
            Var { id: v, .. } => *v == id,
            Cons { args, .. } | Tuple(args) => args.iter().any(|a| a.occurs(id)),
            Func { params, ret, .. } => params.iter().any(|a| a.occurs(id)) || ret.occurs(id),
            Flex(t) | Io(_, t) => t.occurs(id),
            Fixed(a, b) => a.occurs(id) || b.occurs(id),
            _ => false,
        }
    }
}

impl fmt::Display for ExprType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use ExprType::*;
        match self {
            Int => write!(f, "integer"),
            Double => write!(f, "double"),
            Bool => write!(f, "boolean"),
            String => write!(f, "string"),
            Path => write!(f, "path"),
            Time => write!(f, "time"),
            Dynamic => write!(f, "?"),
            Type => write!(f, "type"),
            Unit => write!(f, "unit"),
            Var { id, bounds } if bounds.is_empty() => write!(f, "X{id}"),
            Var { id, bounds } => {
                write!(f, "X{id} {{")?;
                for (i, b) in bounds.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{b}")?;
                }
                write!(f, "}}")
            }
            Cons { name, args } if name.as_ref() == LIST && args.len() == 1 => {
                write!(f, "list {}", args[0])
            }
            Cons { name, args } if args.is_empty() => write!(f, "{name}"),
            Cons { name, args } => {
                write!(f, "{name}(")?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{a}")?;
                }
                write!(f, ")")
            }
            Tuple(elems) => {
                write!(f, "<")?;
                for (i, a) in elems.iter().enumerate() {
                    if i > 0 {
                        write!(f, " * ")?;
                    }
                    write!(f, "{a}")?;
                }
                write!(f, ">")
            }
            Func { params, ret, arity } => {
                for (i, a) in params.iter().enumerate() {
                    if i > 0 {
                        write!(f, " * ")?;
                    }
                    write!(f, "{a}")?;
                }
                match arity {
                    Arity::Once => (),
                    Arity::Optional => write!(f, "?")?,
                    Arity::Star => write!(f, "*")?,
                    Arity::Plus => write!(f, "+")?,
                }
                write!(f, " -> {ret}")
            }
            Flex(t) => write!(f, "f {t}"),
            Fixed(a, b) => write!(f, "f {a} => {b}"),
            Io(tag, t) => {
                let p = match tag {
                    IoTag::Input => "i",
                    IoTag::Output => "o",
                    IoTag::Expression => "e",
                    IoTag::Actions => "a",
                    IoTag::Dynamic => "d",
                };
                write!(f, "{p} {t}")
            }
        }
    }
}

/// Parser for the type language used by builtin signatures and annotations:
///
/// ```text
/// forall X in {integer double}, f X * f X -> X
/// e boolean * a ? * a ? -> ?
/// string * ? -> integer
/// ```
pub struct TypeParser<'a, 'source> {
    lexer: &'a mut Lexer<'source>,
    tok: Token,
    vars: BTreeMap<Rc<str>, ExprType>,
    next_var: u32,
}

impl<'a, 'source> TypeParser<'a, 'source> {
    pub fn new(lexer: &'a mut Lexer<'source>) -> Result<Self> {
        let tok = lexer.next_token()?;
        Ok(Self {
            lexer,
            tok,
            vars: BTreeMap::new(),
            next_var: 0,
        })
    }

    /// Hand the unconsumed lookahead back to the lexer.
    pub fn finish(self) {
        self.lexer.push_back(self.tok);
    }

    fn next_token(&mut self) -> Result<()> {
        self.tok = self.lexer.next_token()?;
        Ok(())
    }

    fn peek_is(&mut self, text: &str) -> Result<bool> {
        Ok(self.lexer.peek_token()?.is(text))
    }

    fn expect(&mut self, text: &str, context: &str) -> Result<()> {
        if self.tok.is(text) {
            self.next_token()
        } else {
            Err(self.error(&format!("expecting `{text}` {context}")))
        }
    }

    fn error(&self, msg: &str) -> anyhow::Error {
        let span = &self.tok.span;
        span.source.parse_error(span.line, span.col, msg)
    }

    fn fresh_var(&mut self, bounds: Vec<ExprType>) -> ExprType {
        self.next_var += 1;
        ExprType::Var {
            id: self.next_var,
            bounds,
        }
    }

    fn is_var_name(tok: &Token) -> bool {
        match tok.kind {
            TokenKind::Int => true,
            TokenKind::Ident => tok.text.starts_with(|c: char| c.is_ascii_uppercase()),
            _ => false,
        }
    }

    fn parse_type_set(&mut self) -> Result<Vec<ExprType>> {
        self.expect("{", "to start a type set")?;
        let mut bounds = vec![];
        while !self.tok.is("}") {
            if self.tok.kind == TokenKind::Eof {
                bail!(self.error("unterminated type set"));
            }
            bounds.push(self.parse_atom()?);
        }
        self.next_token()?;
        Ok(bounds)
    }

    /// A single type without `*` products.
    pub fn parse_atom(&mut self) -> Result<ExprType> {
        let tok = self.tok.clone();
        if tok.kind == TokenKind::Backquoted {
            self.next_token()?;
            return Ok(ExprType::Cons {
                name: tok.text.clone(),
                args: vec![],
            });
        }
        if Self::is_var_name(&tok) {
            self.next_token()?;
            if let Some(v) = self.vars.get(&tok.text) {
                return Ok(v.clone());
            }
            let bounds = if self.tok.is("{") {
                self.parse_type_set()?
            } else {
                vec![]
            };
            let v = self.fresh_var(bounds);
            self.vars.insert(tok.text.clone(), v.clone());
            return Ok(v);
        }
        if !matches!(tok.kind, TokenKind::Ident | TokenKind::Punct | TokenKind::Op) {
            bail!(self.error("expecting type"));
        }

        let simple = match tok.text.as_ref() {
            "?" => Some(ExprType::Dynamic),
            "integer" | "int" => Some(ExprType::Int),
            "double" => Some(ExprType::Double),
            "boolean" | "bool" => Some(ExprType::Bool),
            "time" => Some(ExprType::Time),
            "string" => Some(ExprType::String),
            "path" => Some(ExprType::Path),
            "unit" => Some(ExprType::Unit),
            "type" | "set" => Some(ExprType::Type),
            _ => None,
        };
        if let Some(t) = simple {
            self.next_token()?;
            return Ok(t);
        }

        let io = match tok.text.as_ref() {
            "input" | "i" => Some(IoTag::Input),
            "output" | "o" => Some(IoTag::Output),
            "expression" | "e" => Some(IoTag::Expression),
            "actions" | "a" => Some(IoTag::Actions),
            "dynamic" | "d" => Some(IoTag::Dynamic),
            _ => None,
        };
        if let Some(tag) = io {
            self.next_token()?;
            let inner = self.parse_atom()?;
            return Ok(match (tag, inner) {
                // `i o T` is read and written.
                (IoTag::Input, ExprType::Io(IoTag::Output, t)) => ExprType::Io(IoTag::Dynamic, t),
                (tag, ExprType::Io(_, t)) => ExprType::Io(tag, t),
                (tag, t) => ExprType::Io(tag, Box::new(t)),
            });
        }

        match tok.text.as_ref() {
            "list" => {
                self.next_token()?;
                Ok(ExprType::list(self.parse_atom()?))
            }
            "f" => {
                self.next_token()?;
                let from = self.parse_atom()?;
                if self.tok.is("=>") {
                    self.next_token()?;
                    let to = self.parse_atom()?;
                    Ok(ExprType::Fixed(Box::new(from), Box::new(to)))
                } else {
                    Ok(ExprType::Flex(Box::new(from)))
                }
            }
            "(" => {
                self.next_token()?;
                let t = self.parse_product(false)?;
                self.expect(")", "to close type")?;
                Ok(t)
            }
            "<" => {
                self.next_token()?;
                let t = self.parse_product(true)?;
                self.expect(">", "to close tuple type")?;
                Ok(t)
            }
            _ if tok.kind == TokenKind::Ident => {
                self.next_token()?;
                let mut args = vec![];
                if self.tok.is("(") {
                    self.next_token()?;
                    loop {
                        args.push(self.parse_atom()?);
                        if self.tok.is(",") {
                            self.next_token()?;
                        } else {
                            break;
                        }
                    }
                    self.expect(")", "to close type arguments")?;
                }
                Ok(ExprType::Cons {
                    name: tok.text.clone(),
                    args,
                })
            }
            _ => bail!(self.error("expecting type")),
        }
    }

    fn at_type_end(&self) -> bool {
        self.tok.kind == TokenKind::Eof
            || self.tok.is("->")
            || self.tok.is("=>")
            || self.tok.is(")")
            || self.tok.is(">")
    }

    /// `T1 * T2 * ...`. A single element is returned as is unless `lifted`.
    pub fn parse_product(&mut self, lifted: bool) -> Result<ExprType> {
        let mut elems = vec![];
        if !self.at_type_end() {
            loop {
                if self.tok.is("forall") {
                    self.next_token()?;
                    let name = self.tok.clone();
                    if !Self::is_var_name(&name) {
                        bail!(self.error("expecting type variable"));
                    }
                    self.next_token()?;
                    let bounds = if self.tok.is("in") {
                        self.next_token()?;
                        self.parse_type_set()?
                    } else {
                        vec![]
                    };
                    let v = self.fresh_var(bounds);
                    self.vars.insert(name.text.clone(), v);
                    self.expect(",", "after forall")?;
                    continue;
                }

                elems.push(self.parse_atom()?);
                if self.tok.is("*") && !self.peek_is("->")? {
                    self.next_token()?;
                    continue;
                }
                break;
            }
        }
        if elems.len() == 1 && !lifted {
            Ok(elems.remove(0))
        } else if elems.is_empty() && !lifted {
            Ok(ExprType::Unit)
        } else {
            Ok(ExprType::Tuple(elems))
        }
    }

    /// `params [*|+|?] -> ret`, or a bare type meaning a nullary function.
    pub fn parse_func_type(&mut self) -> Result<ExprType> {
        let params = self.parse_product(true)?;
        let arity = match self.tok.text.as_ref() {
            "*" if self.tok.kind == TokenKind::Op => Arity::Star,
            "+" if self.tok.kind == TokenKind::Op => Arity::Plus,
            "?" if self.tok.kind == TokenKind::Punct => Arity::Optional,
            _ => Arity::Once,
        };
        if arity != Arity::Once {
            self.next_token()?;
        }
        let params = match params {
            ExprType::Tuple(p) => p,
            t => vec![t],
        };
        if !self.tok.is("->") {
            if arity == Arity::Once && params.len() == 1 {
                return Ok(ExprType::Func {
                    params: vec![],
                    ret: Box::new(params.into_iter().next().unwrap_or(ExprType::Unit)),
                    arity,
                });
            }
            bail!(self.error("expecting `->` in function type"));
        }
        self.next_token()?;
        let ret = self.parse_product(false)?;
        Ok(ExprType::Func {
            params,
            ret: Box::new(ret),
            arity,
        })
    }
}

/// Parse a complete function signature such as `forall X, X* -> list X`.
pub fn parse_signature(text: &str) -> Result<ExprType> {
    let source = Source::from_contents("<signature>".to_string(), text.to_string())?;
    let mut lexer = Lexer::new(&source);
    lexer.set_dialect(Dialect::Block);
    let mut parser = TypeParser::new(&mut lexer)?;
    let t = parser.parse_func_type()?;
    if parser.tok.kind != TokenKind::Eof {
        bail!(parser.error("unexpected text after signature"));
    }
    Ok(t)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_forall() -> Result<()> {
        let t = parse_signature("forall X in {integer double}, f X * f X->X")?;
        let ExprType::Func { params, ret, arity } = t else {
            bail!("not a function type");
        };
        assert_eq!(arity, Arity::Once);
        assert_eq!(params.len(), 2);
        let ExprType::Flex(x) = &params[0] else {
            bail!("expected flex");
        };
        assert_eq!(
            **x,
            ExprType::Var {
                id: 1,
                bounds: vec![ExprType::Int, ExprType::Double]
            }
        );
        assert_eq!(*ret, **x);
        Ok(())
    }

    #[test]
    fn star_and_io_tags() -> Result<()> {
        let t = parse_signature("forall X, X*->list X")?;
        assert!(matches!(t, ExprType::Func { arity: Arity::Star, ref params, .. } if params.len() == 1));

        let t = parse_signature("e ? * o string->integer")?;
        let ExprType::Func { params, .. } = t else {
            bail!("not a function type");
        };
        assert_eq!(params[0].io_tag(), IoTag::Expression);
        assert_eq!(params[1].io_tag(), IoTag::Output);
        assert_eq!(*params[1].payload(), ExprType::String);
        Ok(())
    }

    #[test]
    fn numbered_vars_are_shared() -> Result<()> {
        let t = parse_signature("e 0 * e f 0->integer")?;
        let ExprType::Func { params, .. } = t else {
            bail!("not a function type");
        };
        let ExprType::Io(_, flex) = &params[1] else {
            bail!("expected io");
        };
        assert_eq!(**flex, ExprType::Flex(Box::new(params[0].payload().clone())));
        Ok(())
    }

    #[test]
    fn instantiate_renames_consistently() -> Result<()> {
        let t = parse_signature("forall X, X * X -> X")?;
        let mut next = 100;
        let t = t.instantiate(&mut || {
            next += 1;
            next
        });
        assert_eq!(t.to_string(), "X101 * X101 -> X101");
        Ok(())
    }
}
