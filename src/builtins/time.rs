// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::ast::NodeId;
use crate::builtins::utils::{ensure_args_count, ensure_string};
use crate::builtins::{add, BuiltinTable};
use crate::error::RuleError;
use crate::interpreter::{EvalResult, Interpreter};
use crate::lexer::Span;
use crate::value::Value;

use core::fmt::Write;

use anyhow::{bail, Result};
use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

/// Format used by `timestr` and `datetime`.
pub const DEFAULT_FORMAT: &str = "%Y-%m-%d.%H:%M:%S";

pub fn register(m: &mut BuiltinTable) {
    add(m, "time", "->time", time);
    add(m, "timestr", "time->string", timestr);
    add(m, "timestrf", "time * string->string", timestrf);
    add(m, "datetime", "0{string integer double}->time", datetime);
    add(m, "datetimef", "string * string->time", datetimef);
}

fn check_format(span: &Span, fcn: &str, format: &str) -> Result<()> {
    if StrftimeItems::new(format).any(|i| matches!(i, Item::Error)) {
        bail!(RuleError::UnsupportedOp(
            span.message("error", &format!("`{fcn}`: invalid time format `{format}`"))
        ));
    }
    Ok(())
}

fn ensure_time(span: &Span, fcn: &str, v: &Value) -> Result<i64> {
    match v {
        Value::Time(t) | Value::Int(t) => Ok(*t),
        _ => bail!(RuleError::UnsupportedOp(span.message(
            "error",
            &format!("`{fcn}` expects time argument. Got {} `{v}` instead", v.type_name())
        ))),
    }
}

/// Render seconds since the epoch, in UTC.
pub fn format_time(span: &Span, fcn: &str, secs: i64, format: &str) -> Result<String> {
    check_format(span, fcn, format)?;
    let Some(dt) = DateTime::<Utc>::from_timestamp(secs, 0) else {
        bail!(RuleError::Runtime(
            span.message("error", &format!("`{fcn}`: time {secs} out of range"))
        ));
    };
    let mut out = String::new();
    if write!(out, "{}", dt.format(format)).is_err() {
        bail!(RuleError::Runtime(
            span.message("error", &format!("`{fcn}`: cannot format time {secs}"))
        ));
    }
    Ok(out)
}

/// Parse `text` as a UTC date-time. Formats without a time of day give
/// midnight.
pub fn parse_time(span: &Span, fcn: &str, text: &str, format: &str) -> Result<i64> {
    check_format(span, fcn, format)?;
    let text = text.trim();
    if let Ok(dt) = NaiveDateTime::parse_from_str(text, format) {
        return Ok(dt.and_utc().timestamp());
    }
    match NaiveDate::parse_from_str(text, format)
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
    {
        Some(dt) => Ok(dt.and_utc().timestamp()),
        None => bail!(RuleError::UnsupportedOp(span.message(
            "error",
            &format!("`{fcn}`: `{text}` does not match time format `{format}`")
        ))),
    }
}

fn time(_: &mut Interpreter<'_>, _: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    ensure_args_count("time", args, 0)?;
    Ok(Value::Time(Utc::now().timestamp()))
}

fn timestr(_: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    ensure_args_count("timestr", args, 1)?;
    let secs = ensure_time(span, "timestr", &args[0])?;
    Ok(Value::from(format_time(span, "timestr", secs, DEFAULT_FORMAT)?))
}

fn timestrf(_: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    ensure_args_count("timestrf", args, 2)?;
    let secs = ensure_time(span, "timestrf", &args[0])?;
    let format = ensure_string(span, "timestrf", &args[1])?;
    Ok(Value::from(format_time(span, "timestrf", secs, &format)?))
}

/// A string in the default format, or seconds since the epoch.
fn datetime(_: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    ensure_args_count("datetime", args, 1)?;
    Ok(Value::Time(match &args[0] {
        Value::Int(i) | Value::Time(i) => *i,
        Value::Double(d) => *d as i64,
        v => {
            let text = ensure_string(span, "datetime", v)?;
            parse_time(span, "datetime", &text, DEFAULT_FORMAT)?
        }
    }))
}

fn datetimef(_: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    ensure_args_count("datetimef", args, 2)?;
    let text = ensure_string(span, "datetimef", &args[0])?;
    let format = ensure_string(span, "datetimef", &args[1])?;
    Ok(Value::Time(parse_time(span, "datetimef", &text, &format)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Source;

    fn span() -> Result<Span> {
        let source = Source::from_contents("<time>".to_string(), "x".to_string())?;
        Ok(source.span(0, 1))
    }

    #[test]
    fn default_format_round_trips() -> Result<()> {
        let span = span()?;
        let text = format_time(&span, "timestr", 86_400 + 3_661, DEFAULT_FORMAT)?;
        assert_eq!(text, "1970-01-02.01:01:01");
        assert_eq!(parse_time(&span, "datetime", &text, DEFAULT_FORMAT)?, 90_061);
        Ok(())
    }

    #[test]
    fn date_only_formats_give_midnight() -> Result<()> {
        let span = span()?;
        assert_eq!(parse_time(&span, "datetimef", "1970-01-03", "%Y-%m-%d")?, 172_800);
        Ok(())
    }

    #[test]
    fn malformed_input_is_rejected() -> Result<()> {
        let span = span()?;
        assert!(parse_time(&span, "datetimef", "yesterday", "%Y-%m-%d").is_err());
        assert!(format_time(&span, "timestrf", 0, "%Q%").is_err());
        Ok(())
    }
}
