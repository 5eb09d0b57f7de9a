// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::ast::Tier;
use crate::cache::{BuildCount, MemorySegment, RuleCache};
use crate::tests::common::{init_test_logging, process_value, read_cases};
use crate::value::Value;
use crate::*;

use anyhow::{bail, Result};
use indexmap::IndexMap;
use serde::Deserialize;
use test_generator::test_resources;

#[derive(Debug, Deserialize)]
struct TestCase {
    note: String,
    #[serde(default)]
    rules: String,
    /// Hook to apply, with `bindings` as its arguments and session values.
    hook: Option<String>,
    #[serde(default)]
    bindings: IndexMap<String, serde_yaml::Value>,
    /// Action text to run.
    eval: Option<String>,
    /// Expression to evaluate.
    term: Option<String>,

    #[serde(default)]
    want_status: i32,
    want_stdout: Option<String>,
    want_stderr: Option<String>,
    want_value: Option<serde_yaml::Value>,
    want_bindings: Option<IndexMap<String, serde_yaml::Value>>,
    want_error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct YamlTest {
    cases: Vec<TestCase>,
}

fn context() -> EngineContext {
    let config = EngineConfig::default();
    let cache = RuleCache::new(
        config.clone(),
        Box::new(MemorySegment::new()),
        Rc::new(BuildCount::default()),
    );
    EngineContext::with_cache(config, cache)
}

fn check_output(case: &TestCase, stdout: &str, stderr: &str) {
    if let Some(expected) = &case.want_stdout {
        assert_eq!(stdout, expected, "{}: stdout", case.note);
    }
    if let Some(expected) = &case.want_stderr {
        assert_eq!(stderr, expected, "{}: stderr", case.note);
    }
}

fn run_hook(ctx: &mut EngineContext, case: &TestCase, hook: &str) -> Result<()> {
    let mut bindings = vec![];
    for (label, v) in &case.bindings {
        bindings.push(Binding::new(label, process_value(v)?));
    }
    let outcome = ctx.apply_hook(hook, &mut bindings);
    assert_eq!(outcome.status, case.want_status, "{}: {}", case.note, outcome.errors);
    check_output(case, &outcome.stdout, &outcome.stderr);

    if let Some(expected) = &case.want_error {
        let chain = outcome.errors.to_string();
        assert!(chain.contains(expected.as_str()), "{}: {chain}", case.note);
    }
    if let Some(want) = &case.want_bindings {
        for (label, v) in want {
            let Some(b) = bindings.iter().find(|b| &b.label == label) else {
                bail!("{}: no binding `{label}`", case.note);
            };
            assert_eq!(b.value, process_value(v)?, "{}: {label}", case.note);
        }
    }
    Ok(())
}

fn check_result(case: &TestCase, r: Result<Value>) -> Result<()> {
    match (r, &case.want_error) {
        (Ok(v), None) => {
            if let Some(want) = &case.want_value {
                assert_eq!(v, process_value(want)?, "{}", case.note);
            }
        }
        (Ok(v), Some(_)) => bail!("{}: expected an error, got {v}", case.note),
        (Err(e), None) => bail!("{}: {e}", case.note),
        (Err(e), Some(expected)) => {
            let msg = e.to_string();
            assert!(msg.contains(expected.as_str()), "{}: {msg}", case.note);
            let code = crate::error::RuleError::from_anyhow(&e).code();
            if case.want_status != 0 {
                assert_eq!(code, case.want_status, "{}", case.note);
            }
        }
    }
    Ok(())
}

fn run_case(case: &TestCase) -> Result<()> {
    let mut ctx = context();
    if !case.rules.is_empty() {
        ctx.add_rules(&case.rules, Tier::Core)?;
    }
    if let Some(hook) = &case.hook {
        run_hook(&mut ctx, case, hook)?;
    }
    if let Some(text) = &case.eval {
        let r = ctx.eval(text);
        if let Ok(evaluation) = &r {
            check_output(case, &evaluation.stdout, &evaluation.stderr);
        }
        check_result(case, r.map(|e| e.value))?;
    }
    if let Some(text) = &case.term {
        check_result(case, ctx.eval_term(text))?;
    }
    Ok(())
}

fn yaml_test(file: &str) -> Result<()> {
    init_test_logging();
    let test: YamlTest = read_cases(file)?;
    for case in &test.cases {
        print!("case {} ", case.note);
        run_case(case)?;
        println!("passed");
    }
    Ok(())
}

#[test_resources("tests/interpreter/cases/*.yaml")]
fn run(path: &str) {
    yaml_test(path).unwrap()
}
