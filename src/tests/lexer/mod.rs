// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::lexer::*;
use crate::tests::common::read_cases;

use anyhow::{bail, Result};
use serde::Deserialize;
use test_generator::test_resources;

#[derive(Debug, Deserialize)]
struct TestCase {
    note: String,
    source: String,
    #[serde(default)]
    dialect: Dialect,
    /// `Kind text` per token, Eof excluded.
    tokens: Option<Vec<String>>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct YamlTest {
    cases: Vec<TestCase>,
}

fn lex(case: &TestCase) -> Result<Vec<String>> {
    let source = Source::from_contents("case.re".to_string(), case.source.clone())?;
    let mut lexer = Lexer::new(&source);
    lexer.set_dialect(case.dialect);
    let mut tokens = vec![];
    loop {
        let tok = lexer.next_token()?;
        if tok.kind == TokenKind::Eof {
            break;
        }
        // The span must cover the token's source text.
        let (line, col) = source.line_col(tok.span.start);
        assert_eq!((tok.span.line, tok.span.col), (line, col), "{}", case.note);
        tokens.push(format!("{:?} {}", tok.kind, tok.text));
    }
    Ok(tokens)
}

fn yaml_test(file: &str) -> Result<()> {
    let test: YamlTest = read_cases(file)?;
    for case in test.cases {
        print!("case {} ", case.note);
        match (lex(&case), &case.tokens, &case.error) {
            (Ok(actual), Some(expected), None) => assert_eq!(&actual, expected, "{}", case.note),
            (Err(e), None, Some(expected)) => {
                let msg = e.to_string();
                assert!(msg.contains(expected.as_str()), "{}: {msg}", case.note);
            }
            (Ok(actual), _, Some(_)) => bail!("{}: expected an error, got {actual:?}", case.note),
            (Err(e), _, None) => bail!("{}: {e}", case.note),
            _ => bail!("{}: specify either tokens or error", case.note),
        }
        println!("passed");
    }
    Ok(())
}

#[test_resources("tests/lexer/cases/*.yaml")]
fn run(path: &str) {
    yaml_test(path).unwrap()
}
