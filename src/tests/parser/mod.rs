// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::ast::*;
use crate::error::RuleError;
use crate::lexer::*;
use crate::parser::*;
use crate::tests::common::read_cases;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use serde::Deserialize;
use test_generator::test_resources;

#[derive(Debug, Deserialize)]
struct TestCase {
    note: String,
    source: String,
    #[serde(default)]
    dialect: Dialect,
    /// Structural dump of every parsed rule, in order.
    rules: Option<Vec<String>>,
    /// Fragments that must occur in the dump of the first rule.
    contains: Option<Vec<String>>,
    error: Option<String>,
    /// Line reported by the parse error.
    error_line: Option<u32>,
    /// Error code, when not a plain parse error.
    code: Option<i32>,
    /// Rule base files, by name, available to `@include`.
    files: Option<BTreeMap<String, String>>,
    /// Size limit for included files.
    max_text: Option<usize>,
}

#[derive(Clone, Copy)]
struct Options<'a> {
    dialect: Dialect,
    include_dir: Option<&'a Path>,
    max_text: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct YamlTest {
    cases: Vec<TestCase>,
}

fn parse_into(source: &Source, options: Options, ast: &mut Ast) -> Result<Vec<RuleDesc>> {
    let mut symbols = SymbolTable::new();
    let mut parser = Parser::new(source, ast)?;
    parser.set_dialect(options.dialect)?;
    if let Some(dir) = options.include_dir {
        parser.set_include_dir(dir.to_path_buf());
    }
    if let Some(limit) = options.max_text {
        parser.set_max_text(limit);
    }
    parser.parse_rule_base(&mut symbols)
}

fn parse(file: &str, text: &str, options: Options) -> Result<Vec<String>> {
    let source = Source::from_contents(file.to_string(), text.to_string())?;
    let mut ast = Ast::new();
    let descs = parse_into(&source, options, &mut ast)?;
    Ok(descs.iter().map(|d| ast.dump(d.node)).collect())
}

/// Render the parsed rules back to text and parse that again. Included
/// rules are rendered in place of the directive.
fn round_trip(text: &str, options: Options) -> Result<Vec<String>> {
    let source = Source::from_contents("case.re".to_string(), text.to_string())?;
    let mut ast = Ast::new();
    let descs = parse_into(&source, options, &mut ast)?;
    let rendered: String = descs.iter().map(|d| render(&ast, d.node)).collect();
    let plain = Options {
        dialect: Dialect::Auto,
        include_dir: None,
        max_text: None,
    };
    match parse("rendered.re", &rendered, plain) {
        Ok(dumps) => Ok(dumps),
        Err(e) => bail!("rendered text does not parse:\n{rendered}\n{e}"),
    }
}

/// Write the case's files to a fresh directory.
fn write_files(case: &TestCase) -> Result<Option<PathBuf>> {
    let Some(files) = &case.files else {
        return Ok(None);
    };
    let slug: String = case
        .note
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let dir = std::env::temp_dir().join(format!("rulebase-parser-{}-{slug}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir)?;
    for (name, text) in files {
        fs::write(dir.join(format!("{name}.re")), text)?;
    }
    Ok(Some(dir))
}

fn yaml_test(file: &str) -> Result<()> {
    let test: YamlTest = read_cases(file)?;
    for case in test.cases {
        print!("case {} ", case.note);
        let dir = write_files(&case)?;
        let options = Options {
            dialect: case.dialect,
            include_dir: dir.as_deref(),
            max_text: case.max_text,
        };
        let result = parse("case.re", &case.source, options);
        match result {
            Ok(dumps) => {
                if case.error.is_some() {
                    bail!("{}: expected an error, got {dumps:?}", case.note);
                }
                if let Some(expected) = &case.rules {
                    assert_eq!(&dumps, expected, "{}", case.note);
                }
                if let Some(fragments) = &case.contains {
                    let first = dumps.first().cloned().unwrap_or_default();
                    for f in fragments {
                        assert!(first.contains(f.as_str()), "{}: `{f}` not in {first}", case.note);
                    }
                }
                assert_eq!(round_trip(&case.source, options)?, dumps, "{}", case.note);
            }
            Err(e) => {
                let msg = e.to_string();
                let Some(expected) = &case.error else {
                    bail!("{}: {msg}", case.note);
                };
                assert!(msg.contains(expected.as_str()), "{}: {msg}", case.note);
                assert_eq!(
                    RuleError::from_anyhow(&e).code(),
                    case.code.unwrap_or(crate::error::codes::RE_PARSER_ERROR),
                    "{}",
                    case.note
                );
                if let Some(line) = case.error_line {
                    let at = format!("case.re:{line}:");
                    assert!(msg.contains(&at), "{}: expected line {line} in {msg}", case.note);
                }
            }
        }
        if let Some(dir) = dir {
            let _ = fs::remove_dir_all(dir);
        }
        println!("passed");
    }
    Ok(())
}

#[test_resources("tests/parser/cases/*.yaml")]
fn run(path: &str) {
    yaml_test(path).unwrap()
}
