// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::ast::NodeId;
use crate::builtins::utils::{ensure_args_count, ensure_bool, ensure_int, ensure_min_args, ensure_numeric};
use crate::builtins::{add, BuiltinTable};
use crate::error::RuleError;
use crate::interpreter::{EvalResult, Interpreter};
use crate::lexer::Span;
use crate::value::Value;

use core::cmp::Ordering;

use anyhow::{bail, Result};

pub fn register(m: &mut BuiltinTable) {
    add(m, "+", "forall X in {integer double}, f X * f X->X", plus);
    add(m, "-", "forall X in {integer double}, f X * f X->X", minus);
    add(m, "*", "forall X in {integer double}, f X * f X->X", multiply);
    add(m, "/", "forall X in {integer double}, f X * f X->?", divide);
    add(m, "%", "integer * integer->integer", modulo);
    add(m, "neg", "forall X in {integer double}, X-> X", negate);
    add(m, "^", "f double * f double->double", power);
    add(m, "^^", "f double * f double->double", root);
    add(m, "log", "f double->double", log);
    add(m, "exp", "f double->double", exp);
    add(m, "floor", "f double->double", floor);
    add(m, "ceiling", "f double->double", ceiling);
    add(m, "abs", "f double->double", abs);
    add(m, "max", "f double+->double", max);
    add(m, "min", "f double+->double", min);
    add(m, "average", "f double+->double", average);

    add(m, "!", "boolean->boolean", not);
    add(m, "&&", "boolean * boolean->boolean", and);
    add(m, "||", "boolean * boolean->boolean", or);
    add(m, "%%", "boolean * boolean->boolean", or);

    add(m, "==", "forall X in {integer double boolean string time path}, f X * f X->boolean", eq);
    add(m, "!=", "forall X in {integer double boolean string time path}, f X * f X->boolean", ne);
    add(m, ">", "forall X in {integer double string time}, f X * f X->boolean", gt);
    add(m, "<", "forall X in {integer double string time}, f X * f X->boolean", lt);
    add(m, ">=", "forall X in {integer double string time}, f X * f X->boolean", ge);
    add(m, "<=", "forall X in {integer double string time}, f X * f X->boolean", le);
}

#[derive(Clone, Copy)]
enum ArithOp {
    Add,
    Sub,
    Mul,
}

fn arith(span: &Span, op: ArithOp, fcn: &str, args: &[Value]) -> Result<Value> {
    ensure_args_count(fcn, args, 2)?;
    if let (Value::Int(a), Value::Int(b)) = (&args[0], &args[1]) {
        let r = match op {
            ArithOp::Add => a.checked_add(*b),
            ArithOp::Sub => a.checked_sub(*b),
            ArithOp::Mul => a.checked_mul(*b),
        };
        return match r {
            Some(r) => Ok(Value::Int(r)),
            None => bail!(RuleError::Runtime(span.message("error", "integer overflow"))),
        };
    }
    let a = ensure_numeric(span, fcn, &args[0])?;
    let b = ensure_numeric(span, fcn, &args[1])?;
    Ok(Value::Double(match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
    }))
}

fn plus(_: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    Ok(arith(span, ArithOp::Add, "+", args)?)
}

fn minus(_: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    Ok(arith(span, ArithOp::Sub, "-", args)?)
}

fn multiply(_: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    Ok(arith(span, ArithOp::Mul, "*", args)?)
}

/// Division always yields a double.
fn divide(_: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    ensure_args_count("/", args, 2)?;
    let a = ensure_numeric(span, "/", &args[0])?;
    let b = ensure_numeric(span, "/", &args[1])?;
    if b == 0.0 {
        return Err(RuleError::DivisionByZero.into());
    }
    Ok(Value::Double(a / b))
}

fn modulo(_: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    ensure_args_count("%", args, 2)?;
    let a = ensure_int(span, "%", &args[0])?;
    let b = ensure_int(span, "%", &args[1])?;
    if b == 0 {
        return Err(RuleError::DivisionByZero.into());
    }
    // The only overflowing case, i64::MIN % -1, is 0.
    Ok(Value::Int(a.wrapping_rem(b)))
}

fn negate(_: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    ensure_args_count("neg", args, 1)?;
    match &args[0] {
        Value::Int(i) => Ok(Value::Int(i.wrapping_neg())),
        v => Ok(Value::Double(-ensure_numeric(span, "neg", v)?)),
    }
}

fn binary_double(span: &Span, fcn: &str, args: &[Value]) -> Result<(f64, f64)> {
    ensure_args_count(fcn, args, 2)?;
    Ok((
        ensure_numeric(span, fcn, &args[0])?,
        ensure_numeric(span, fcn, &args[1])?,
    ))
}

fn power(_: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    let (a, b) = binary_double(span, "^", args)?;
    Ok(Value::Double(a.powf(b)))
}

fn root(_: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    let (a, b) = binary_double(span, "^^", args)?;
    if b == 0.0 {
        return Err(RuleError::DivisionByZero.into());
    }
    Ok(Value::Double(a.powf(1.0 / b)))
}

fn unary_double(span: &Span, fcn: &str, args: &[Value], f: fn(f64) -> f64) -> EvalResult {
    ensure_args_count(fcn, args, 1)?;
    Ok(Value::Double(f(ensure_numeric(span, fcn, &args[0])?)))
}

fn log(_: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    unary_double(span, "log", args, f64::ln)
}

fn exp(_: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    unary_double(span, "exp", args, f64::exp)
}

fn floor(_: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    unary_double(span, "floor", args, f64::floor)
}

fn ceiling(_: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    unary_double(span, "ceiling", args, f64::ceil)
}

fn abs(_: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    unary_double(span, "abs", args, f64::abs)
}

fn numbers(span: &Span, fcn: &str, args: &[Value]) -> Result<Vec<f64>> {
    ensure_min_args(span, fcn, args, 1)?;
    args.iter().map(|a| ensure_numeric(span, fcn, a)).collect()
}

fn max(_: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    let xs = numbers(span, "max", args)?;
    Ok(Value::Double(xs.into_iter().fold(f64::NEG_INFINITY, f64::max)))
}

fn min(_: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    let xs = numbers(span, "min", args)?;
    Ok(Value::Double(xs.into_iter().fold(f64::INFINITY, f64::min)))
}

fn average(_: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    let xs = numbers(span, "average", args)?;
    Ok(Value::Double(xs.iter().sum::<f64>() / xs.len() as f64))
}

fn not(_: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    ensure_args_count("!", args, 1)?;
    Ok(Value::Bool(!ensure_bool(span, "!", &args[0])?))
}

fn and(_: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    ensure_args_count("&&", args, 2)?;
    let a = ensure_bool(span, "&&", &args[0])?;
    let b = ensure_bool(span, "&&", &args[1])?;
    Ok(Value::Bool(a && b))
}

fn or(_: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    ensure_args_count("||", args, 2)?;
    let a = ensure_bool(span, "||", &args[0])?;
    let b = ensure_bool(span, "||", &args[1])?;
    Ok(Value::Bool(a || b))
}

/// Order two operands of the same kind. Integers and doubles mix.
fn compare(span: &Span, fcn: &str, args: &[Value]) -> Result<Ordering> {
    ensure_args_count(fcn, args, 2)?;
    let (a, b) = (&args[0], &args[1]);
    let comparable = matches!(
        (a, b),
        (Value::Int(_) | Value::Double(_), Value::Int(_) | Value::Double(_))
            | (Value::String(_) | Value::Path(_), Value::String(_) | Value::Path(_))
            | (Value::Time(_), Value::Time(_))
            | (Value::Bool(_), Value::Bool(_))
    );
    if !comparable {
        bail!(RuleError::DynamicType(span.message(
            "error",
            &format!(
                "type error: comparing between {} and {}",
                a.type_name(),
                b.type_name()
            )
        )));
    }
    a.compare(b)
}

fn eq(_: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    Ok(Value::Bool(compare(span, "==", args)? == Ordering::Equal))
}

fn ne(_: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    Ok(Value::Bool(compare(span, "!=", args)? != Ordering::Equal))
}

fn gt(_: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    Ok(Value::Bool(compare(span, ">", args)? == Ordering::Greater))
}

fn lt(_: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    Ok(Value::Bool(compare(span, "<", args)? == Ordering::Less))
}

fn ge(_: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    Ok(Value::Bool(compare(span, ">=", args)? != Ordering::Less))
}

fn le(_: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    Ok(Value::Bool(compare(span, "<=", args)? != Ordering::Greater))
}
