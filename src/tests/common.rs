// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Shared helpers for the YAML-driven suites.

use crate::value::Value;
use crate::*;

use std::sync::Once;

use anyhow::{bail, Result};

static LOGGING: Once = Once::new();

/// Route `tracing` events to the test output. `RULEBASE_LOG` selects the
/// level.
pub fn init_test_logging() {
    LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_env("RULEBASE_LOG"))
            .with_test_writer()
            .try_init();
    });
}

/// Convert a value written in a test case.
///
/// Integers, floats, booleans and strings map to the scalar kinds and
/// sequences to lists. A mapping with the single key `time!` is a time value.
pub fn process_value(v: &serde_yaml::Value) -> Result<Value> {
    use serde_yaml::Value as Y;
    Ok(match v {
        Y::Bool(b) => Value::Bool(*b),
        Y::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => Value::Int(i),
            (None, Some(d)) => Value::Double(d),
            _ => bail!("unsupported number {n}"),
        },
        Y::String(s) => Value::from(s.as_str()),
        Y::Sequence(items) => {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                values.push(process_value(item)?);
            }
            Value::List(Rc::new(values))
        }
        Y::Mapping(m) if m.len() == 1 => match m.get("time!").and_then(|t| t.as_i64()) {
            Some(t) => Value::Time(t),
            None => bail!("unsupported mapping {m:?}"),
        },
        _ => bail!("unsupported test value {v:?}"),
    })
}

/// Read the case file at `path`, relative to the crate root.
pub fn read_cases<T: serde::de::DeserializeOwned>(path: &str) -> Result<T> {
    let yaml = std::fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&yaml)?)
}
