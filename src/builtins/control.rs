// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::ast::NodeId;
use crate::builtins::utils::{ensure_args_count, ensure_int, ensure_string};
use crate::builtins::{add, BuiltinTable};
use crate::error::{codes, RuleError};
use crate::interpreter::iterables::iterable_for;
use crate::interpreter::{EvalResult, Interpreter, Interrupt};
use crate::lexer::Span;
use crate::value::Value;

pub fn register(m: &mut BuiltinTable) {
    add(m, "if", "e boolean * a ? * a ? * a ? * a ?->?", if_);
    add(m, "if2", "e boolean * e 0 * e 0 * e ? * e ?->0", if2);
    add(m, "while", "e boolean * a ? * a ?->?", while_);
    add(m, "for", "e ? * e boolean * e ? * a ? * a ?->?", for_);
    add(m, "foreach", "e list 0 * a ? * a ?->?", foreach);
    add(m, "foreach2", "forall X, e X * e list X * a ? * a ?->?", foreach2);
    add(m, "let", "e 0 * e f 0 * e 1->1", let_);
    add(m, "assign", "e 0 * e f 0->integer", assign);
    add(m, "do", "e ?->?", do_);
    add(m, "break", "->integer", break_);
    add(m, "succeed", "->integer", succeed);
    add(m, "fail", "integer ?->integer", fail);
    add(m, "failmsg", "integer * string->integer", failmsg);
    add(m, "cut", "->integer", cut);
    add(m, "nop", "->integer", nop);
    add(m, "errorcode", "e ?->integer", errorcode);
    add(m, "errormsg", "e ? * o string->integer", errormsg);
    add(m, "getstdout", "e ? * o string ->integer", getstdout);
    add(m, "getstderr", "e ? * o string ->integer", getstderr);
    add(m, "eval", "string->?", eval);
    add(m, "evalrule", "string->?", evalrule);
    add(
        m,
        "applyAllRules",
        "e ? * f 0{integer string} => integer * f 1{integer string} => integer->?",
        apply_all_rules,
    );
}

fn if_(interp: &mut Interpreter<'_>, _: &Span, params: &[NodeId], args: &mut [Value]) -> EvalResult {
    ensure_args_count("if", args, 5)?;
    match interp.eval_bool(params[0])? {
        true => interp.exec_actions(params[1], params[3]),
        false => interp.exec_actions(params[2], params[4]),
    }
}

fn if2(interp: &mut Interpreter<'_>, _: &Span, params: &[NodeId], args: &mut [Value]) -> EvalResult {
    ensure_args_count("if2", args, 5)?;
    match interp.eval_bool(params[0])? {
        true => interp.eval(params[1]),
        false => interp.eval(params[2]),
    }
}

fn while_(interp: &mut Interpreter<'_>, _: &Span, params: &[NodeId], args: &mut [Value]) -> EvalResult {
    ensure_args_count("while", args, 3)?;
    while interp.eval_bool(params[0])? {
        match interp.exec_actions(params[1], params[2]) {
            Ok(_) => (),
            Err(Interrupt::Break) => break,
            Err(e) => return Err(e),
        }
        interp.env_mut().compact_if_needed()?;
    }
    Ok(Value::Int(0))
}

fn for_(interp: &mut Interpreter<'_>, _: &Span, params: &[NodeId], args: &mut [Value]) -> EvalResult {
    ensure_args_count("for", args, 5)?;
    interp.eval(params[0])?;
    while interp.eval_bool(params[1])? {
        match interp.exec_actions(params[3], params[4]) {
            Ok(_) => (),
            Err(Interrupt::Break) => break,
            Err(e) => return Err(e),
        }
        interp.eval(params[2])?;
        interp.env_mut().compact_if_needed()?;
    }
    Ok(Value::Int(0))
}

/// `foreach(*X) { .. }`: iterate over the current value of `*X`.
fn foreach(interp: &mut Interpreter<'_>, _: &Span, params: &[NodeId], args: &mut [Value]) -> EvalResult {
    ensure_args_count("foreach", args, 3)?;
    let subject = interp.eval(params[0])?;
    let mut iterable = iterable_for(&subject)?;
    interp.iterate(params[0], iterable.as_mut(), params[1], params[2])
}

/// `foreach(*X in e) { .. }`.
fn foreach2(interp: &mut Interpreter<'_>, _: &Span, params: &[NodeId], args: &mut [Value]) -> EvalResult {
    ensure_args_count("foreach2", args, 4)?;
    let subject = interp.eval(params[1])?;
    let mut iterable = iterable_for(&subject)?;
    interp.iterate(params[0], iterable.as_mut(), params[2], params[3])
}

fn let_(interp: &mut Interpreter<'_>, span: &Span, params: &[NodeId], args: &mut [Value]) -> EvalResult {
    ensure_args_count("let", args, 3)?;
    let value = interp.eval(params[1])?;
    let value = interp.coerce(params[1], value)?;
    let (pattern, body) = (params[0], params[2]);
    interp.scoped(|me| {
        if !me.bind_pattern(pattern, &value, true)? {
            return Err(RuleError::PatternNotMatched(
                span.message("error", &format!("`{value}` does not match the pattern")),
            )
            .into());
        }
        me.eval(body)
    })
}

fn assign(interp: &mut Interpreter<'_>, span: &Span, params: &[NodeId], args: &mut [Value]) -> EvalResult {
    ensure_args_count("assign", args, 2)?;
    let value = interp.eval(params[1])?;
    let value = interp.coerce(params[1], value)?;
    if !interp.bind_pattern(params[0], &value, false)? {
        return Err(RuleError::PatternNotMatched(
            span.message("error", &format!("`{value}` does not match the pattern")),
        )
        .into());
    }
    Ok(Value::Int(0))
}

fn do_(interp: &mut Interpreter<'_>, _: &Span, params: &[NodeId], args: &mut [Value]) -> EvalResult {
    ensure_args_count("do", args, 1)?;
    interp.eval(params[0])
}

fn break_(_: &mut Interpreter<'_>, _: &Span, _: &[NodeId], _: &mut [Value]) -> EvalResult {
    Err(Interrupt::Break)
}

fn succeed(_: &mut Interpreter<'_>, _: &Span, _: &[NodeId], _: &mut [Value]) -> EvalResult {
    Err(Interrupt::Succeed)
}

/// Error code argument of `fail` and `failmsg`.
fn error_code(span: &Span, fcn: &str, v: &Value) -> anyhow::Result<i32> {
    let code = ensure_int(span, fcn, v)?;
    match i32::try_from(code) {
        Ok(code) => Ok(code),
        Err(_) => Err(RuleError::DynamicType(
            span.message("error", &format!("`{fcn}` error code {code} is out of range")),
        )
        .into()),
    }
}

fn fail(_: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    let code = match args.first() {
        Some(v) => error_code(span, "fail", v)?,
        None => codes::ACTION_FAILED,
    };
    Err(RuleError::ActionFailed {
        code,
        msg: "fail action encountered".to_string(),
    }
    .into())
}

fn failmsg(_: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    ensure_args_count("failmsg", args, 2)?;
    let code = error_code(span, "failmsg", &args[0])?;
    let msg = ensure_string(span, "failmsg", &args[1])?;
    Err(RuleError::ActionFailed {
        code,
        msg: msg.to_string(),
    }
    .into())
}

fn cut(interp: &mut Interpreter<'_>, _: &Span, _: &[NodeId], _: &mut [Value]) -> EvalResult {
    interp.set_cut();
    Ok(Value::Int(0))
}

fn nop(_: &mut Interpreter<'_>, _: &Span, _: &[NodeId], _: &mut [Value]) -> EvalResult {
    Ok(Value::Int(0))
}

/// Evaluate `node`, turning an error into its code and message.
fn capture(interp: &mut Interpreter<'_>, node: NodeId) -> Result<(i32, String), Interrupt> {
    match interp.eval(node) {
        Ok(_) => Ok((0, String::new())),
        Err(Interrupt::Error(e)) => {
            let err = RuleError::from_anyhow(&e);
            Ok((err.code(), err.to_string()))
        }
        Err(other) => Err(other),
    }
}

fn errorcode(interp: &mut Interpreter<'_>, _: &Span, params: &[NodeId], args: &mut [Value]) -> EvalResult {
    ensure_args_count("errorcode", args, 1)?;
    let (code, _) = capture(interp, params[0])?;
    Ok(Value::from(code))
}

fn errormsg(interp: &mut Interpreter<'_>, _: &Span, params: &[NodeId], args: &mut [Value]) -> EvalResult {
    ensure_args_count("errormsg", args, 2)?;
    let (code, msg) = capture(interp, params[0])?;
    args[1] = Value::from(msg);
    Ok(Value::from(code))
}

fn captured_output(
    interp: &mut Interpreter<'_>,
    stream: &str,
    params: &[NodeId],
    args: &mut [Value],
) -> EvalResult {
    let read = |interp: &Interpreter<'_>| match stream {
        "stdout" => interp.env().stdout(),
        _ => interp.env().stderr(),
    };
    let before = read(&*interp).len();
    let (code, _) = capture(interp, params[0])?;
    let after = read(&*interp);
    args[1] = Value::from(after.get(before..).unwrap_or_default());
    Ok(Value::from(code))
}

fn getstdout(interp: &mut Interpreter<'_>, _: &Span, params: &[NodeId], args: &mut [Value]) -> EvalResult {
    ensure_args_count("getstdout", args, 2)?;
    captured_output(interp, "stdout", params, args)
}

fn getstderr(interp: &mut Interpreter<'_>, _: &Span, params: &[NodeId], args: &mut [Value]) -> EvalResult {
    ensure_args_count("getstderr", args, 2)?;
    captured_output(interp, "stderr", params, args)
}

fn eval(interp: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    ensure_args_count("eval", args, 1)?;
    let text = ensure_string(span, "eval", &args[0])?;
    interp.eval_text(&text)
}

fn evalrule(interp: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    ensure_args_count("evalrule", args, 1)?;
    let text = ensure_string(span, "evalrule", &args[0])?;
    interp.eval_term_text(&text)
}

/// `applyAllRules(call, all, save)`: apply every rule that matches `call`.
/// When `all` is 1 the same holds for rule applications inside them.
fn apply_all_rules(
    interp: &mut Interpreter<'_>,
    span: &Span,
    params: &[NodeId],
    args: &mut [Value],
) -> EvalResult {
    ensure_args_count("applyAllRules", args, 3)?;
    let nested = ensure_int(span, "applyAllRules", &args[1])? == 1;
    let saved = interp.request_all_rules(nested);
    let r = interp.eval(params[0]);
    interp.restore_all_rules(saved);
    r
}
