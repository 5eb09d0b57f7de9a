// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::ast::NodeId;
use crate::builtins::utils::{ensure_args_count, ensure_int, ensure_string};
use crate::builtins::{add, BuiltinTable};
use crate::error::RuleError;
use crate::interpreter::{EvalResult, Interpreter};
use crate::lexer::Span;
use crate::value::Value;
use crate::*;

use anyhow::Result;

pub fn register(m: &mut BuiltinTable) {
    add(m, "++", "f string * f string->string", concat);
    add(m, "like", "string * string->boolean", like);
    add(m, "not like", "string * string->boolean", not_like);
    #[cfg(feature = "regex")]
    {
        add(m, "like regex", "string * string->boolean", like_regex);
        add(m, "not like regex", "string * string->boolean", not_like_regex);
    }
    add(m, "triml", "string * string->string", triml);
    add(m, "trimr", "string * string->string", trimr);
    add(m, "strlen", "string->integer", strlen);
    add(m, "substr", "string * integer * integer->string", substr);
    add(m, "split", "string * string -> list string", split);
}

fn two_strings(span: &Span, fcn: &str, args: &[Value]) -> Result<(Rc<str>, Rc<str>)> {
    ensure_args_count(fcn, args, 2)?;
    Ok((
        ensure_string(span, fcn, &args[0])?,
        ensure_string(span, fcn, &args[1])?,
    ))
}

fn concat(_: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    let (a, b) = two_strings(span, "++", args)?;
    let mut s = String::with_capacity(a.len() + b.len());
    s.push_str(&a);
    s.push_str(&b);
    Ok(Value::from(s))
}

/// Match `text` against `pattern`, where `*` stands for any sequence of
/// characters and every other character for itself.
pub fn wildcard_match(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();
    let (mut t, mut p) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while t < text.len() {
        if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, t));
            p += 1;
        } else if p < pattern.len() && pattern[p] == text[t] {
            p += 1;
            t += 1;
        } else if let Some((sp, st)) = star {
            // Let the last star absorb one more character.
            p = sp + 1;
            t = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|c| *c == '*')
}

fn like(_: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    let (text, pattern) = two_strings(span, "like", args)?;
    Ok(Value::Bool(wildcard_match(&text, &pattern)))
}

fn not_like(_: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    let (text, pattern) = two_strings(span, "not like", args)?;
    Ok(Value::Bool(!wildcard_match(&text, &pattern)))
}

/// The whole of `text` must match.
#[cfg(feature = "regex")]
fn regex_match(span: &Span, text: &str, pattern: &str) -> Result<bool> {
    match regex::Regex::new(&format!("^(?:{pattern})$")) {
        Ok(re) => Ok(re.is_match(text)),
        Err(e) => Err(RuleError::UnsupportedOp(
            span.message("error", &format!("invalid regular expression `{pattern}`: {e}")),
        )
        .into()),
    }
}

#[cfg(feature = "regex")]
fn like_regex(_: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    let (text, pattern) = two_strings(span, "like regex", args)?;
    Ok(Value::Bool(regex_match(span, &text, &pattern)?))
}

#[cfg(feature = "regex")]
fn not_like_regex(_: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    let (text, pattern) = two_strings(span, "not like regex", args)?;
    Ok(Value::Bool(!regex_match(span, &text, &pattern)?))
}

/// Text after the first occurrence of the delimiter.
fn triml(_: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    let (s, delim) = two_strings(span, "triml", args)?;
    Ok(match s.find(delim.as_ref()) {
        Some(i) => Value::from(&s[i + delim.len()..]),
        None => Value::String(s),
    })
}

/// Text before the last occurrence of the delimiter.
fn trimr(_: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    let (s, delim) = two_strings(span, "trimr", args)?;
    if delim.is_empty() {
        return Ok(Value::String(s));
    }
    Ok(match s.rfind(delim.as_ref()) {
        Some(i) => Value::from(&s[..i]),
        None => Value::String(s),
    })
}

fn strlen(_: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    ensure_args_count("strlen", args, 1)?;
    let s = ensure_string(span, "strlen", &args[0])?;
    Ok(Value::from(s.len()))
}

/// Bytes `start..finish` of a string.
fn substr(_: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    ensure_args_count("substr", args, 3)?;
    let s = ensure_string(span, "substr", &args[0])?;
    let start = ensure_int(span, "substr", &args[1])?;
    let finish = ensure_int(span, "substr", &args[2])?;
    let range = usize::try_from(start)
        .ok()
        .zip(usize::try_from(finish).ok())
        .filter(|(a, b)| a <= b);
    match range.and_then(|(a, b)| s.get(a..b)) {
        Some(sub) => Ok(Value::from(sub)),
        None => Err(RuleError::Runtime(span.message(
            "error",
            &format!("invalid substr index {start}..{finish} of a string of length {}", s.len()),
        ))
        .into()),
    }
}

/// Split at any of the delimiter characters, dropping empty pieces.
fn split(_: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    let (s, delims) = two_strings(span, "split", args)?;
    let parts: Vec<Value> = s
        .split(|c: char| delims.contains(c))
        .filter(|p| !p.is_empty())
        .map(Value::from)
        .collect();
    Ok(Value::from(parts))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcards() {
        assert!(wildcard_match("/zone/home/a.txt", "/zone/*"));
        assert!(wildcard_match("abc", "a*c"));
        assert!(wildcard_match("ac", "a*c"));
        assert!(wildcard_match("", "*"));
        assert!(!wildcard_match("abd", "a*c"));
        assert!(!wildcard_match("a.c", "abc"));
        assert!(wildcard_match("aXbYc", "a*b*c"));
        assert!(!wildcard_match("abcX", "a*c"));
    }
}
