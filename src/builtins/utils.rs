// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::error::RuleError;
use crate::lexer::Span;
use crate::value::Value;
use crate::*;

use anyhow::{bail, Result};

pub fn ensure_args_count(fcn: &str, args: &[Value], expected: usize) -> Result<()> {
    if args.len() != expected {
        bail!(RuleError::ArgCountMismatch {
            name: fcn.to_string(),
            expected,
            actual: args.len(),
        });
    }
    Ok(())
}

pub fn ensure_min_args(span: &Span, fcn: &str, args: &[Value], min: usize) -> Result<()> {
    if args.len() < min {
        bail!(RuleError::UnsupportedOp(span.message(
            "error",
            &format!("`{fcn}` expects at least {min} arguments")
        )));
    }
    Ok(())
}

fn unexpected(span: &Span, fcn: &str, kind: &str, v: &Value) -> anyhow::Error {
    RuleError::UnsupportedOp(span.message(
        "error",
        &format!(
            "`{fcn}` expects {kind} argument. Got {} `{v}` instead",
            v.type_name()
        ),
    ))
    .into()
}

pub fn ensure_int(span: &Span, fcn: &str, v: &Value) -> Result<i64> {
    match v {
        Value::Int(i) => Ok(*i),
        _ => Err(unexpected(span, fcn, "integer", v)),
    }
}

/// Numeric argument, integers widened.
pub fn ensure_numeric(span: &Span, fcn: &str, v: &Value) -> Result<f64> {
    match v {
        Value::Int(i) => Ok(*i as f64),
        Value::Double(d) => Ok(*d),
        _ => Err(unexpected(span, fcn, "numeric", v)),
    }
}

pub fn ensure_bool(span: &Span, fcn: &str, v: &Value) -> Result<bool> {
    match v {
        Value::Bool(b) => Ok(*b),
        _ => Err(unexpected(span, fcn, "boolean", v)),
    }
}

/// Text of a string or path argument.
pub fn ensure_string(span: &Span, fcn: &str, v: &Value) -> Result<Rc<str>> {
    match v {
        Value::String(s) | Value::Path(s) => Ok(s.clone()),
        _ => Err(unexpected(span, fcn, "string", v)),
    }
}

pub fn ensure_list(span: &Span, fcn: &str, v: &Value) -> Result<Rc<Vec<Value>>> {
    match v {
        Value::List(items) => Ok(items.clone()),
        _ => Err(unexpected(span, fcn, "list", v)),
    }
}

/// Position in a list, rejecting negative and out-of-range indices.
pub fn ensure_index(span: &Span, fcn: &str, len: usize, idx: i64) -> Result<usize> {
    match usize::try_from(idx) {
        Ok(i) if i < len => Ok(i),
        _ => bail!(RuleError::Runtime(span.message(
            "error",
            &format!("`{fcn}`: index {idx} out of range for list of size {len}")
        ))),
    }
}
