// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::error::RuleError;
use crate::lexer::Source;
use crate::tests::common::read_cases;
use crate::*;

use anyhow::{bail, Result};
use serde::Deserialize;
use test_generator::test_resources;

#[derive(Debug, Deserialize)]
struct TestCase {
    note: String,
    source: String,
    error: Option<String>,
    code: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct YamlTest {
    cases: Vec<TestCase>,
}

fn yaml_test(file: &str) -> Result<()> {
    let test: YamlTest = read_cases(file)?;
    let config = EngineConfig::default();
    for case in test.cases {
        print!("case {} ", case.note);
        let source = Source::from_contents("case.re".to_string(), case.source.clone())?;
        match (CompiledRuleBase::from_source(&source, &config), &case.error) {
            (Ok(_), None) => (),
            (Ok(_), Some(_)) => bail!("{}: expected a type error", case.note),
            (Err(e), None) => bail!("{}: {e}", case.note),
            (Err(e), Some(expected)) => {
                let msg = e.to_string();
                assert!(msg.contains(expected.as_str()), "{}: {msg}", case.note);
                if let Some(code) = case.code {
                    assert_eq!(RuleError::from_anyhow(&e).code(), code, "{}", case.note);
                }
            }
        }
        println!("passed");
    }
    Ok(())
}

#[test_resources("tests/typing/cases/*.yaml")]
fn run(path: &str) {
    yaml_test(path).unwrap()
}
