// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::error::RuleError;
use crate::*;

use core::cmp;
use core::fmt::{self, Debug, Formatter};
use std::collections::VecDeque;

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Clone)]
struct SourceInternal {
    pub file: String,
    pub contents: String,
    pub lines: Vec<(u32, u32)>,
}

/// Rule text together with the name of its origin.
///
/// Files are identified by their path. Text synthesized at runtime (for
/// example by `eval` or the command line) uses a name in angle brackets such
/// as `<string>`.
#[derive(Clone)]
pub struct Source {
    src: Rc<SourceInternal>,
}

impl cmp::PartialEq for Source {
    fn eq(&self, other: &Source) -> bool {
        Rc::ptr_eq(&self.src, &other.src)
            || (self.src.file == other.src.file && self.src.contents == other.src.contents)
    }
}

impl cmp::Eq for Source {}

impl Debug for Source {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        self.src.file.fmt(f)
    }
}

impl Default for Source {
    fn default() -> Self {
        Self {
            src: Rc::new(SourceInternal {
                file: "<generated>".to_string(),
                contents: String::new(),
                lines: vec![(0, 0)],
            }),
        }
    }
}

impl Serialize for Source {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (&self.src.file, &self.src.contents).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Source {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (file, contents) = <(String, String)>::deserialize(deserializer)?;
        Source::from_contents(file, contents).map_err(serde::de::Error::custom)
    }
}

impl Source {
    pub fn from_contents(file: String, contents: String) -> Result<Source> {
        let max_size = u32::MAX as usize - 2; // Account for rows, cols possibly starting at 1, EOF etc.
        if contents.len() > max_size {
            bail!(RuleError::BufferOverflow {
                size: contents.len(),
                limit: max_size
            });
        }
        let mut lines = vec![];
        let mut prev_ch = ' ';
        let mut prev_pos = 0u32;
        let mut start = 0u32;
        for (i, ch) in contents.char_indices() {
            if ch == '\n' {
                let end = match prev_ch {
                    '\r' => prev_pos,
                    _ => i as u32,
                };
                lines.push((start, end));
                start = i as u32 + 1;
            }
            prev_ch = ch;
            prev_pos = i as u32;
        }

        if (start as usize) < contents.len() || contents.is_empty() {
            lines.push((start, contents.len() as u32));
        } else {
            let s = contents.len() as u32;
            lines.push((s, s));
        }
        Ok(Self {
            src: Rc::new(SourceInternal {
                file,
                contents,
                lines,
            }),
        })
    }

    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Source> {
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => bail!(RuleError::FileStat(format!(
                "Failed to read {}. {e}",
                path.as_ref().display()
            ))),
        };
        Self::from_contents(path.as_ref().to_string_lossy().to_string(), contents)
    }

    pub fn file(&self) -> &String {
        &self.src.file
    }

    pub fn contents(&self) -> &String {
        &self.src.contents
    }

    /// True for text that did not come from a file.
    pub fn is_synthesized(&self) -> bool {
        self.src.file.starts_with('<')
    }

    pub fn line(&self, idx: u32) -> &str {
        let idx = idx as usize;
        if idx < self.src.lines.len() {
            let (start, end) = self.src.lines[idx];
            &self.src.contents[start as usize..end as usize]
        } else {
            ""
        }
    }

    /// 1-based line and column of a byte offset.
    pub fn line_col(&self, offset: u32) -> (u32, u32) {
        let lines = &self.src.lines;
        let idx = match lines.binary_search_by(|(start, _)| start.cmp(&offset)) {
            Ok(i) => i,
            Err(0) => 0,
            Err(i) => i - 1,
        };
        let start = lines.get(idx).map(|l| l.0).unwrap_or(0) as usize;
        let offset = cmp::min(offset as usize, self.src.contents.len());
        let col = self
            .src
            .contents
            .get(start..offset)
            .map(|s| s.chars().count())
            .unwrap_or(0);
        (idx as u32 + 1, col as u32 + 1)
    }

    pub fn span(&self, start: u32, end: u32) -> Span {
        let (line, col) = self.line_col(start);
        Span {
            source: self.clone(),
            line,
            col,
            start,
            end,
        }
    }

    pub fn message(&self, line: u32, col: u32, kind: &str, msg: &str) -> String {
        if line as usize > self.src.lines.len() {
            return format!("{}: invalid line {} specified", self.src.file, line);
        }

        let line_str = format!("{line}");
        let line_num_width = line_str.len() + 1;
        let col_spaces = col.saturating_sub(1) as usize;

        format!(
            "\n--> {}:{}:{}\n{:<line_num_width$}|\n\
		{:<line_num_width$}| {}\n\
		{:<line_num_width$}| {:<col_spaces$}^\n\
		{}: {}",
            self.src.file,
            line,
            col,
            "",
            line,
            self.line(line.saturating_sub(1)),
            "",
            "",
            kind,
            msg
        )
    }

    pub fn error(&self, line: u32, col: u32, msg: &str) -> anyhow::Error {
        anyhow!(self.message(line, col, "error", msg))
    }

    /// A parse error carrying the `RE_PARSER_ERROR` status.
    pub fn parse_error(&self, line: u32, col: u32, msg: &str) -> anyhow::Error {
        RuleError::Parse(self.message(line, col, "error", msg)).into()
    }
}

#[derive(Clone)]
pub struct Span {
    pub source: Source,
    pub line: u32,
    pub col: u32,
    pub start: u32,
    pub end: u32,
}

impl Span {
    pub fn text(&self) -> &str {
        &self.source.contents()[self.start as usize..self.end as usize]
    }

    pub fn message(&self, kind: &str, msg: &str) -> String {
        self.source.message(self.line, self.col, kind, msg)
    }

    pub fn error(&self, msg: &str) -> anyhow::Error {
        self.source.error(self.line, self.col, msg)
    }
}

impl Debug for Span {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        let t = self.text().escape_debug().to_string();
        let max = 32;
        let (txt, trailer) = if t.len() > max {
            (&t[0..max], "...")
        } else {
            (t.as_str(), "")
        };

        f.write_fmt(format_args!(
            "{}:{}:{}:{}, \"{}{}\"",
            self.line, self.col, self.start, self.end, txt, trailer
        ))
    }
}

/// Surface syntax of a rule file.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// Decide per rule: braces or `=` select the block syntax, `|` the legacy one.
    #[default]
    Auto,
    Block,
    Legacy,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TokenKind {
    Ident,
    Op,
    Int,
    Double,
    Bool,
    Str,
    RawStr,
    LocalVar,
    SessionVar,
    Path,
    Backquoted,
    Punct,
    Eof,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
    /// Decoded text: escapes resolved, quotes and sigils stripped.
    pub text: Rc<str>,
    /// Byte ranges within `text` of `*name` / `$name` references embedded in
    /// a string or path literal. Each range includes the sigil.
    pub vars: Vec<(u32, u32)>,
}

impl Token {
    pub fn is(&self, text: &str) -> bool {
        !matches!(
            self.kind,
            TokenKind::Str | TokenKind::RawStr | TokenKind::Backquoted | TokenKind::Path
        ) && self.span.text() == text
    }
}

pub struct Operator {
    pub text: &'static str,
    pub arity: u8,
    pub prec: u8,
}

const fn op(text: &'static str, arity: u8, prec: u8) -> Operator {
    Operator { text, arity, prec }
}

/// Operator table. Entries sharing a prefix are ordered longest first so that
/// a linear scan yields the greedy match.
pub const OPERATORS: &[Operator] = &[
    op("not like regex", 2, 4),
    op("like regex", 2, 4),
    op("not like", 2, 4),
    op("like", 2, 4),
    op("floor", 1, 10),
    op("ceiling", 1, 10),
    op("log", 1, 10),
    op("exp", 1, 10),
    op("abs", 1, 10),
    op("++", 2, 6),
    op("&&", 2, 3),
    op("%%", 2, 2),
    op("||", 2, 2),
    op("<=", 2, 5),
    op(">=", 2, 5),
    op("==", 2, 4),
    op("!=", 2, 4),
    op("^^", 2, 8),
    op("-", 1, 10),
    op("-", 2, 6),
    op("+", 2, 6),
    op("*", 2, 7),
    op("/", 2, 7),
    op("%", 2, 7),
    op("<", 2, 5),
    op(">", 2, 5),
    op("!", 1, 10),
    op("^", 2, 8),
    op(".", 2, 8),
    op("=", 2, 1),
];

/// Precedence of the implicit application operator `f(..)`.
pub const APP_PREC: u8 = 20;

pub fn binary_op(text: &str) -> Option<&'static Operator> {
    OPERATORS.iter().find(|o| o.arity == 2 && o.text == text)
}

pub fn unary_op(text: &str) -> Option<&'static Operator> {
    OPERATORS.iter().find(|o| o.arity == 1 && o.text == text)
}

const PUNCT_MULTI: &[&str] = &[":::", "->", "=>", "<>", ":"];

#[derive(Clone)]
pub struct Lexer<'source> {
    source: Source,
    text: &'source str,
    pos: usize,
    queue: VecDeque<Token>,
    dialect: Dialect,
}

fn is_ident_start(ch: char) -> bool {
    ch == '_' || ch.is_ascii_alphabetic()
}

fn is_ident_char(ch: char) -> bool {
    ch == '_' || ch.is_ascii_alphanumeric()
}

impl<'source> Lexer<'source> {
    pub fn new(source: &'source Source) -> Self {
        Self {
            source: source.clone(),
            text: source.contents().as_str(),
            pos: 0,
            queue: VecDeque::new(),
            dialect: Dialect::Auto,
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Switch the dialect. Already queued tokens are discarded and rescanned.
    pub fn set_dialect(&mut self, dialect: Dialect) {
        if self.dialect != dialect {
            self.dialect = dialect;
            if let Some(tok) = self.queue.front() {
                let offset = tok.span.start as usize;
                self.resync(offset);
            }
        }
    }

    /// Byte offset of the next token to be produced.
    pub fn offset(&self) -> usize {
        match self.queue.front() {
            Some(t) => t.span.start as usize,
            None => self.pos,
        }
    }

    /// Rescan from an earlier byte offset, discarding lookahead.
    pub fn resync(&mut self, offset: usize) {
        self.queue.clear();
        self.pos = cmp::min(offset, self.text.len());
    }

    pub fn push_back(&mut self, token: Token) {
        if token.kind != TokenKind::Eof || self.queue.is_empty() {
            self.queue.push_front(token);
        }
    }

    pub fn peek_token(&mut self) -> Result<Token> {
        let tok = self.next_token()?;
        self.push_back(tok.clone());
        Ok(tok)
    }

    fn peek(&self) -> char {
        self.text[self.pos..].chars().next().unwrap_or('\x00')
    }

    fn peekahead(&self, n: usize) -> char {
        self.text[self.pos..].chars().nth(n).unwrap_or('\x00')
    }

    fn advance(&mut self) -> char {
        let ch = self.peek();
        if ch != '\x00' {
            self.pos += ch.len_utf8();
        }
        ch
    }

    fn error_at(&self, offset: usize, msg: &str) -> anyhow::Error {
        let (line, col) = self.source.line_col(offset as u32);
        self.source.parse_error(line, col, msg)
    }

    fn token(&self, kind: TokenKind, start: usize, text: Rc<str>) -> Token {
        Token {
            kind,
            span: self.source.span(start as u32, self.pos as u32),
            text,
            vars: vec![],
        }
    }

    fn skip_ws(&mut self) {
        loop {
            match self.peek() {
                ' ' | '\t' | '\r' | '\n' => {
                    self.pos += 1;
                }
                '#' if self.dialect == Dialect::Legacy && self.peekahead(1) == '#' => break,
                '#' => {
                    while !matches!(self.peek(), '\n' | '\x00') {
                        self.advance();
                    }
                }
                _ => break,
            }
        }
    }

    fn read_ident(&mut self, start: usize) -> Token {
        while is_ident_char(self.peek()) {
            self.pos += 1;
        }
        let text = &self.text[start..self.pos];
        let kind = match text {
            "true" | "false" => TokenKind::Bool,
            _ => TokenKind::Ident,
        };
        self.token(kind, start, text.into())
    }

    fn read_var(&mut self, start: usize, kind: TokenKind) -> Token {
        self.pos += 1;
        while is_ident_char(self.peek()) {
            self.pos += 1;
        }
        let name = &self.text[start + 1..self.pos];
        self.token(kind, start, name.into())
    }

    fn read_number(&mut self, start: usize) -> Result<Token> {
        while self.peek().is_ascii_digit() {
            self.pos += 1;
        }
        let mut kind = TokenKind::Int;
        if self.peek() == '.' && self.peekahead(1).is_ascii_digit() {
            kind = TokenKind::Double;
            self.pos += 1;
            while self.peek().is_ascii_digit() {
                self.pos += 1;
            }
        }
        if is_ident_start(self.peek()) {
            return Err(self.error_at(self.pos, "invalid number"));
        }
        let text = &self.text[start..self.pos];
        Ok(self.token(kind, start, text.into()))
    }

    // Decodes a quoted string, recording embedded variable references.
    fn read_string(&mut self, start: usize, quote: char) -> Result<Token> {
        self.pos += 1;
        let mut text = String::new();
        let mut vars = vec![];
        loop {
            match self.advance() {
                '\x00' => return Err(self.error_at(start, &format!("unmatched {quote}"))),
                ch if ch == quote => break,
                '\\' => match self.advance() {
                    '\x00' => return Err(self.error_at(start, &format!("unmatched {quote}"))),
                    'n' => text.push('\n'),
                    't' => text.push('\t'),
                    'r' => text.push('\r'),
                    '0' => text.push('\0'),
                    ch => text.push(ch),
                },
                ch @ ('*' | '$') if is_ident_start(self.peek()) => {
                    let var_start = text.len() as u32;
                    text.push(ch);
                    while is_ident_char(self.peek()) {
                        text.push(self.advance());
                    }
                    vars.push((var_start, text.len() as u32));
                }
                ch => text.push(ch),
            }
        }
        let mut tok = self.token(TokenKind::Str, start, text.into());
        tok.vars = vars;
        Ok(tok)
    }

    fn read_raw_string(&mut self, start: usize) -> Result<Token> {
        self.pos += 2;
        match self.text[self.pos..].find("``") {
            Some(len) => {
                let text: Rc<str> = self.text[self.pos..self.pos + len].into();
                self.pos += len + 2;
                Ok(self.token(TokenKind::RawStr, start, text))
            }
            None => Err(self.error_at(start, "unmatched ``")),
        }
    }

    fn read_backquoted(&mut self, start: usize) -> Result<Token> {
        self.pos += 1;
        let mut text = String::new();
        loop {
            match self.advance() {
                '\x00' => return Err(self.error_at(start, "unmatched `")),
                '`' => break,
                '\\' => text.push(self.advance()),
                ch => text.push(ch),
            }
        }
        Ok(self.token(TokenKind::Backquoted, start, text.into()))
    }

    fn read_path(&mut self, start: usize) -> Token {
        let mut text = String::new();
        let mut vars = vec![];
        loop {
            match self.peek() {
                ')' | ',' | ';' | ' ' | '\t' | '\r' | '\n' | '\x00' => break,
                ch @ ('*' | '$') if is_ident_start(self.peekahead(1)) => {
                    self.advance();
                    let var_start = text.len() as u32;
                    text.push(ch);
                    while is_ident_char(self.peek()) {
                        text.push(self.advance());
                    }
                    vars.push((var_start, text.len() as u32));
                }
                _ => text.push(self.advance()),
            }
        }
        let mut tok = self.token(TokenKind::Path, start, text.into());
        tok.vars = vars;
        tok
    }

    fn read_op(&mut self, start: usize) -> Option<Token> {
        let rest = &self.text[start..];
        for op in OPERATORS {
            if !rest.starts_with(op.text) {
                continue;
            }
            if op.text == "||" && self.dialect == Dialect::Legacy {
                continue;
            }
            let alpha = op.text.starts_with(|c: char| c.is_ascii_alphabetic());
            if alpha && rest[op.text.len()..].starts_with(is_ident_char) {
                continue;
            }
            self.pos = start + op.text.len();
            return Some(self.token(TokenKind::Op, start, op.text.into()));
        }
        None
    }

    /// Produce the next token, honoring pushed back tokens first.
    pub fn next_token(&mut self) -> Result<Token> {
        if let Some(tok) = self.queue.pop_front() {
            return Ok(tok);
        }
        self.scan()
    }

    /// Produce the next token recognizing a path literal if one starts here.
    pub fn next_path_token(&mut self) -> Result<Token> {
        if let Some(tok) = self.queue.front() {
            let offset = tok.span.start as usize;
            self.resync(offset);
        }
        self.skip_ws();
        let start = self.pos;
        if self.peek() == '/' {
            return Ok(self.read_path(start));
        }
        self.scan()
    }

    /// Raw text of a legacy action argument. A quoted argument is decoded
    /// like a string literal. Otherwise everything up to the next `,`, `|`
    /// or `)` outside parentheses is taken verbatim, trailing space trimmed.
    pub fn read_raw_argument(&mut self) -> Result<Token> {
        self.queue.clear();
        self.skip_ws();
        let start = self.pos;
        match self.peek() {
            '\x00' => {
                return Err(self.error_at(
                    start,
                    "reached the end of stream while parsing an action argument",
                ))
            }
            q @ ('"' | '\'') => {
                let tok = self.read_string(start, q)?;
                self.skip_ws();
                return Ok(tok);
            }
            _ => (),
        }

        let mut depth = 0usize;
        let mut text = String::new();
        let mut vars = vec![];
        loop {
            match self.peek() {
                '\x00' => break,
                '(' => depth += 1,
                ')' if depth == 0 => break,
                ')' => depth -= 1,
                ',' | '|' if depth == 0 => break,
                ch @ ('*' | '$') if is_ident_start(self.peekahead(1)) => {
                    self.advance();
                    let var_start = text.len() as u32;
                    text.push(ch);
                    while is_ident_char(self.peek()) {
                        text.push(self.advance());
                    }
                    vars.push((var_start, text.len() as u32));
                    continue;
                }
                _ => (),
            }
            text.push(self.advance());
        }
        let trimmed = text.trim_end().len();
        text.truncate(trimmed);
        vars.retain(|(_, e)| *e as usize <= trimmed);
        let mut tok = self.token(TokenKind::Str, start, text.into());
        tok.vars = vars;
        Ok(tok)
    }

    fn scan(&mut self) -> Result<Token> {
        self.skip_ws();
        let start = self.pos;
        let chr = self.peek();
        let rest = &self.text[start..];

        match chr {
            '\x00' => Ok(self.token(TokenKind::Eof, start, "".into())),
            '*' if is_ident_start(self.peekahead(1)) => {
                Ok(self.read_var(start, TokenKind::LocalVar))
            }
            '$' if is_ident_start(self.peekahead(1)) => {
                Ok(self.read_var(start, TokenKind::SessionVar))
            }
            '"' | '\'' => self.read_string(start, chr),
            '`' if self.peekahead(1) == '`' => self.read_raw_string(start),
            '`' => self.read_backquoted(start),
            '#' => {
                // Only reachable in the legacy dialect.
                self.pos += 2;
                Ok(self.token(TokenKind::Punct, start, "##".into()))
            }
            _ if chr.is_ascii_digit() => self.read_number(start),
            _ => {
                if let Some(p) = PUNCT_MULTI.iter().find(|p| rest.starts_with(*p)) {
                    self.pos += p.len();
                    return Ok(self.token(TokenKind::Punct, start, (*p).into()));
                }
                if let Some(tok) = self.read_op(start) {
                    return Ok(tok);
                }
                match chr {
                    '{' | '}' | '[' | ']' | '(' | ')' | ',' | '@' | ';' | '?' | '|' => {
                        self.pos += 1;
                        Ok(self.token(TokenKind::Punct, start, chr.to_string().into()))
                    }
                    _ if is_ident_start(chr) || chr == '~' => {
                        self.pos += 1;
                        Ok(self.read_ident(start))
                    }
                    _ => Err(self.error_at(start, "invalid character")),
                }
            }
        }
    }
}
