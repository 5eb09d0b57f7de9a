// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::ast::{NodeId, Tier};
use crate::builtins::utils::{ensure_args_count, ensure_string};
use crate::builtins::{add, BuiltinTable};
use crate::error::RuleError;
use crate::interpreter::{EvalResult, Interpreter};
use crate::lexer::Span;
use crate::value::Value;
use crate::*;

use tracing::info;

pub fn register(m: &mut BuiltinTable) {
    add(m, "writeLine", "string * ?->integer", write_line);
    add(m, "writeString", "string * ?->integer", write_string);
    add(m, "lmsg", "string->integer", lmsg);
    add(m, "listvars", "->string", listvars);
    add(m, "listcorerules", "->list string", listcorerules);
    add(m, "listapprules", "->list string", listapprules);
    add(m, "listextrules", "->list string", listextrules);
    add(m, "getGlobalSessionId", "->string", get_global_session_id);
    add(m, "setGlobalSessionId", "string->integer", set_global_session_id);
    add(m, "temporaryStorage", "->?", temporary_storage);
}

/// Write `text` to `stdout`, `stderr` or the server log.
fn write_to(interp: &mut Interpreter<'_>, span: &Span, target: &str, text: &str) -> EvalResult {
    match target {
        "serverLog" => {
            info!(target: "rulebase::rules", "{}", text.trim_end_matches('\n'));
        }
        "stdout" | "stderr" => interp.env_mut().write_out(target, text)?,
        _ => {
            return Err(RuleError::UnsupportedOp(
                span.message("error", &format!("unknown output target `{target}`")),
            )
            .into())
        }
    }
    Ok(Value::Int(0))
}

fn write_line(interp: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    ensure_args_count("writeLine", args, 2)?;
    let target = ensure_string(span, "writeLine", &args[0])?;
    let text = format!("{}\n", args[1]);
    write_to(interp, span, &target, &text)
}

fn write_string(interp: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    ensure_args_count("writeString", args, 2)?;
    let target = ensure_string(span, "writeString", &args[0])?;
    let text = args[1].to_string();
    write_to(interp, span, &target, &text)
}

fn lmsg(_: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    ensure_args_count("lmsg", args, 1)?;
    let msg = ensure_string(span, "lmsg", &args[0])?;
    info!(target: "rulebase::lmsg", "{msg}");
    Ok(Value::Int(0))
}

/// `name=value` for every visible variable, one per line.
fn listvars(interp: &mut Interpreter<'_>, _: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    ensure_args_count("listvars", args, 0)?;
    let env = interp.env();
    let mut out = String::new();
    for name in env.names() {
        let value = match name.strip_prefix('$') {
            Some(session) => env.session(session),
            None => env.lookup(&name),
        };
        if let Some(v) = value {
            out.push_str(&format!("{name}={v}\n"));
        }
    }
    Ok(Value::from(out))
}

fn rule_list(interp: &Interpreter<'_>, tier: Tier) -> Value {
    let names: Vec<Value> = interp
        .rule_names(tier)
        .into_iter()
        .map(Value::String)
        .collect();
    Value::List(Rc::new(names))
}

fn listcorerules(interp: &mut Interpreter<'_>, _: &Span, _: &[NodeId], _: &mut [Value]) -> EvalResult {
    Ok(rule_list(interp, Tier::Core))
}

fn listapprules(interp: &mut Interpreter<'_>, _: &Span, _: &[NodeId], _: &mut [Value]) -> EvalResult {
    Ok(rule_list(interp, Tier::Application))
}

fn listextrules(interp: &mut Interpreter<'_>, _: &Span, _: &[NodeId], _: &mut [Value]) -> EvalResult {
    Ok(rule_list(interp, Tier::Extension))
}

fn get_global_session_id(interp: &mut Interpreter<'_>, _: &Span, _: &[NodeId], _: &mut [Value]) -> EvalResult {
    Ok(Value::from(interp.state().global_session_id.as_str()))
}

fn set_global_session_id(
    interp: &mut Interpreter<'_>,
    span: &Span,
    _: &[NodeId],
    args: &mut [Value],
) -> EvalResult {
    ensure_args_count("setGlobalSessionId", args, 1)?;
    let id = ensure_string(span, "setGlobalSessionId", &args[0])?;
    interp.state_mut().global_session_id = id.to_string();
    Ok(Value::Int(0))
}

/// Snapshot of the context's temporary storage.
fn temporary_storage(interp: &mut Interpreter<'_>, _: &Span, _: &[NodeId], _: &mut [Value]) -> EvalResult {
    Ok(Value::KeyValue(Rc::new(interp.state().temporary.clone())))
}
