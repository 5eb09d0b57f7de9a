// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::ast::NodeId;
use crate::builtins::utils::{ensure_args_count, ensure_string};
use crate::builtins::{add, BuiltinTable};
use crate::error::RuleError;
use crate::interpreter::{EvalResult, Interpreter};
use crate::lexer::Span;
use crate::value::Value;

pub fn register(m: &mut BuiltinTable) {
    add(m, "str", "?->string", to_string);
    add(m, "int", "0{integer string double}->integer", to_int);
    add(m, "double", "f 0{string double time}->double", to_double);
    add(m, "bool", "0{boolean integer string double}->boolean", to_bool);
    add(m, "type", "forall X, X->string", type_of);
    add(m, "arity", "string->integer", arity);
}

fn cannot_convert(span: &Span, v: &Value, to: &str) -> RuleError {
    RuleError::UnsupportedOp(span.message(
        "error",
        &format!("cannot convert {} `{v}` to {to}", v.type_name()),
    ))
}

fn to_string(_: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    ensure_args_count("str", args, 1)?;
    match &args[0] {
        Value::String(s) => Ok(Value::String(s.clone())),
        Value::Unit | Value::Rows(_) => Err(cannot_convert(span, &args[0], "string").into()),
        v => Ok(Value::from(v.to_string())),
    }
}

fn to_int(_: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    ensure_args_count("int", args, 1)?;
    match &args[0] {
        Value::Int(i) => Ok(Value::Int(*i)),
        Value::Double(d) => Ok(Value::Int(*d as i64)),
        Value::String(s) => {
            let s = s.trim();
            match (s.parse::<i64>(), s.parse::<f64>()) {
                (Ok(i), _) => Ok(Value::Int(i)),
                (_, Ok(d)) => Ok(Value::Int(d as i64)),
                _ => Err(cannot_convert(span, &args[0], "integer").into()),
            }
        }
        v => Err(cannot_convert(span, v, "integer").into()),
    }
}

fn to_double(_: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    ensure_args_count("double", args, 1)?;
    match &args[0] {
        Value::Double(d) => Ok(Value::Double(*d)),
        Value::Int(i) => Ok(Value::Double(*i as f64)),
        Value::Time(t) => Ok(Value::Double(*t as f64)),
        Value::String(s) => match s.trim().parse::<f64>() {
            Ok(d) => Ok(Value::Double(d)),
            Err(_) => Err(cannot_convert(span, &args[0], "double").into()),
        },
        v => Err(cannot_convert(span, v, "double").into()),
    }
}

fn to_bool(_: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    ensure_args_count("bool", args, 1)?;
    match &args[0] {
        Value::Bool(b) => Ok(Value::Bool(*b)),
        Value::Int(i) => Ok(Value::Bool(*i != 0)),
        Value::Double(d) => Ok(Value::Bool(*d as i64 != 0)),
        Value::String(s) => match s.as_ref() {
            "true" | "1" => Ok(Value::Bool(true)),
            "false" | "0" => Ok(Value::Bool(false)),
            _ => Err(cannot_convert(span, &args[0], "boolean").into()),
        },
        v => Err(cannot_convert(span, v, "boolean").into()),
    }
}

fn type_of(_: &mut Interpreter<'_>, _: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    ensure_args_count("type", args, 1)?;
    Ok(Value::from(args[0].type_name()))
}

/// Number of parameters of the named rule.
fn arity(interp: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    ensure_args_count("arity", args, 1)?;
    let name = ensure_string(span, "arity", &args[0])?;
    match interp.rule_arity(&name) {
        Some(n) => Ok(Value::from(n)),
        None => Err(RuleError::Runtime(
            span.message("error", &format!("no rule named `{name}`")),
        )
        .into()),
    }
}
