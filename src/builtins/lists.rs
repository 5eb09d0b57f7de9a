// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::ast::{Node, NodeId};
use crate::builtins::utils::{ensure_args_count, ensure_index, ensure_int, ensure_list, ensure_string};
use crate::builtins::{add, BuiltinTable};
use crate::error::RuleError;
use crate::interpreter::{EvalResult, Interpreter};
use crate::lexer::Span;
use crate::value::Value;
use crate::*;

pub fn register(m: &mut BuiltinTable) {
    add(m, "list", "forall X, X*->list X", list);
    add(m, "elem", "forall X, list X * integer->X", elem);
    add(m, "setelem", "forall X, list X * integer * X->list X", setelem);
    add(m, "hd", "forall X, list X->X", hd);
    add(m, "tl", "forall X, list X->list X", tl);
    add(m, "cons", "forall X, X * list X->list X", cons);
    add(m, "size", "forall X, list X->integer", size);
    add(m, ".", "? * e ?->string", field);
}

fn list(_: &mut Interpreter<'_>, _: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    Ok(Value::from(args.to_vec()))
}

/// Element `idx` of a list or of a host array.
fn elem(_: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    ensure_args_count("elem", args, 2)?;
    let idx = ensure_int(span, "elem", &args[1])?;
    Ok(match &args[0] {
        Value::IntArray(a) => Value::Int(a[ensure_index(span, "elem", a.len(), idx)?]),
        Value::StrArray(a) => Value::String(a[ensure_index(span, "elem", a.len(), idx)?].clone()),
        Value::Rows(r) => {
            let i = ensure_index(span, "elem", r.rows.len(), idx)?;
            r.row(i).unwrap_or(Value::Unit)
        }
        v => {
            let items = ensure_list(span, "elem", v)?;
            items[ensure_index(span, "elem", items.len(), idx)?].clone()
        }
    })
}

fn setelem(_: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    ensure_args_count("setelem", args, 3)?;
    let items = ensure_list(span, "setelem", &args[0])?;
    let idx = ensure_int(span, "setelem", &args[1])?;
    let i = ensure_index(span, "setelem", items.len(), idx)?;
    let mut items = items.as_ref().clone();
    items[i] = args[2].clone();
    Ok(Value::from(items))
}

fn hd(_: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    ensure_args_count("hd", args, 1)?;
    let items = ensure_list(span, "hd", &args[0])?;
    match items.first() {
        Some(v) => Ok(v.clone()),
        None => Err(RuleError::Runtime(span.message("error", "hd: empty list")).into()),
    }
}

fn tl(_: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    ensure_args_count("tl", args, 1)?;
    let items = ensure_list(span, "tl", &args[0])?;
    match items.split_first() {
        Some((_, rest)) => Ok(Value::from(rest.to_vec())),
        None => Err(RuleError::Runtime(span.message("error", "tl: empty list")).into()),
    }
}

fn cons(_: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    ensure_args_count("cons", args, 2)?;
    let rest = ensure_list(span, "cons", &args[1])?;
    let mut items = Vec::with_capacity(rest.len() + 1);
    items.push(args[0].clone());
    items.extend(rest.iter().cloned());
    Ok(Value::List(Rc::new(items)))
}

fn size(_: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    ensure_args_count("size", args, 1)?;
    let n = match &args[0] {
        Value::IntArray(a) => a.len(),
        Value::StrArray(a) => a.len(),
        Value::Rows(r) => r.rows.len(),
        Value::KeyValue(m) => m.len(),
        v => ensure_list(span, "size", v)?.len(),
    };
    Ok(Value::from(n))
}

/// `*kvp.KEY`: the value stored under `KEY`, as a string. The key is either
/// a bare name or an expression yielding a string.
fn field(interp: &mut Interpreter<'_>, span: &Span, params: &[NodeId], args: &mut [Value]) -> EvalResult {
    ensure_args_count(".", args, 2)?;
    let ast = interp.ast();
    let key = match &ast[params[1]] {
        Node::App { func, args, .. } if args.is_empty() => func.clone(),
        _ => {
            let k = interp.eval(params[1])?;
            ensure_string(span, ".", &k)?
        }
    };
    let Value::KeyValue(map) = &args[0] else {
        return Err(RuleError::DynamicType(span.message(
            "error",
            &format!("`.` expects a key-value structure, got {}", args[0].type_name()),
        ))
        .into());
    };
    match map.get(&key) {
        Some(v) => Ok(Value::from(v.to_string())),
        None => Err(RuleError::Runtime(span.message("error", &format!("unmatched key {key}"))).into()),
    }
}
