// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::Result;
use rulebase::*;

fn context() -> EngineContext {
    let config = EngineConfig::default();
    let cache = RuleCache::new(config.clone(), Box::new(MemorySegment::new()), Rc::new(NoCount));
    EngineContext::with_cache(config, cache)
}

const INCREMENT: &str = r#"
test(*X) {
  *Y = *X + 1;
  writeLine("stdout", *Y);
}
"#;

#[test]
fn increment_and_print() -> Result<()> {
    let mut ctx = context();
    ctx.add_rules(INCREMENT, Tier::Core)?;
    let mut bindings = [Binding::new("*X", 5)];
    let outcome = ctx.apply_hook("test", &mut bindings);
    assert_eq!(outcome.status, 0);
    assert_eq!(outcome.stdout, "6\n");
    assert!(outcome.errors.is_empty());
    Ok(())
}

#[test]
fn repeated_hooks_give_identical_outcomes() -> Result<()> {
    let mut ctx = context();
    ctx.add_rules(INCREMENT, Tier::Core)?;
    let mut first = [Binding::new("*X", 1)];
    let mut second = first.clone();
    let a = ctx.apply_hook("test", &mut first);
    let b = ctx.apply_hook("test", &mut second);
    assert_eq!(a, b);
    assert_eq!(first, second);
    Ok(())
}

#[test]
fn output_is_not_shared_between_hooks() -> Result<()> {
    let mut ctx = context();
    ctx.add_rules(INCREMENT, Tier::Core)?;
    ctx.apply_hook("test", &mut [Binding::new("*X", 1)]);
    let outcome = ctx.apply_hook("test", &mut [Binding::new("*X", 2)]);
    assert_eq!(outcome.stdout, "3\n");
    Ok(())
}

#[test]
fn rejected_rules_leave_the_rule_base_unchanged() -> Result<()> {
    let mut ctx = context();
    ctx.add_rules(INCREMENT, Tier::Core)?;
    let before = ctx.rule_base().rules().len();

    let err = ctx.add_rules("broken { *x = ; }", Tier::Application).err();
    let code = err.map(|e| RuleError::from_anyhow(&e).code());
    assert_eq!(code, Some(codes::RE_PARSER_ERROR));

    let err = ctx
        .add_rules(r#"typed { if ("a" == 1) then { nop; } }"#, Tier::Application)
        .err();
    let code = err.map(|e| RuleError::from_anyhow(&e).code());
    assert_eq!(code, Some(codes::RE_TYPE_ERROR));

    assert_eq!(ctx.rule_base().rules().len(), before);
    let outcome = ctx.apply_hook("test", &mut [Binding::new("*X", 1)]);
    assert_eq!(outcome.stdout, "2\n");
    Ok(())
}

#[test]
fn rules_are_listed_per_tier() -> Result<()> {
    let mut ctx = context();
    ctx.add_rules(INCREMENT, Tier::Core)?;
    ctx.add_rules("site { nop; }", Tier::Application)?;
    assert_eq!(
        ctx.eval_term("listapprules()")?,
        Value::from(vec![Value::from("site")])
    );
    assert_eq!(
        ctx.eval_term("listcorerules()")?,
        Value::from(vec![Value::from("test")])
    );
    Ok(())
}

#[test]
fn query_rows_are_iterated() -> Result<()> {
    let mut catalog = MemoryCatalog::new();
    catalog.add_record(&[("DATA_NAME", "c.txt".into()), ("DATA_SIZE", Value::Int(20))]);
    catalog.add_record(&[("DATA_NAME", "b.dat".into()), ("DATA_SIZE", Value::Int(30))]);
    catalog.add_record(&[("DATA_NAME", "a.txt".into()), ("DATA_SIZE", Value::Int(10))]);

    let mut ctx = context();
    ctx.set_catalog(Box::new(catalog));
    ctx.add_rules(
        r#"
names {
  foreach (*row in select order(DATA_NAME) where DATA_NAME like '%.txt') {
    writeLine("stdout", *row.DATA_NAME);
  }
}
"#,
        Tier::Core,
    )?;
    let outcome = ctx.apply_hook("names", &mut []);
    assert_eq!(outcome.status, 0, "{}", outcome.errors);
    assert_eq!(outcome.stdout, "a.txt\nc.txt\n");
    Ok(())
}

fn double_it(args: &mut [Value]) -> Result<Value> {
    match args.first() {
        Some(Value::Int(i)) => Ok(Value::Int(i * 2)),
        _ => anyhow::bail!("hostDouble expects an integer"),
    }
}

#[test]
fn unknown_functions_reach_the_catalog() -> Result<()> {
    let mut catalog = MemoryCatalog::new();
    catalog.add_function("hostDouble", double_it);
    let mut ctx = context();
    ctx.set_catalog(Box::new(catalog));
    assert_eq!(ctx.eval_term("hostDouble(4)")?, Value::Int(8));

    let err = ctx.eval_term("hostTriple(4)").err();
    let code = err.map(|e| RuleError::from_anyhow(&e).code());
    assert_eq!(code, Some(codes::NO_RULE_FOUND));
    Ok(())
}

/// Catalog that records deferred requests where the test can see them.
#[derive(Default, Clone)]
struct Recorder {
    scheduled: Rc<RefCell<Vec<(String, String)>>>,
}

impl Catalog for Recorder {
    fn query(&mut self, _request: &QueryRequest) -> Result<Rows> {
        Ok(Rows::default())
    }

    fn list_collection(&mut self, _path: &str) -> Result<Vec<CollectionEntry>> {
        Ok(vec![])
    }

    fn delay(&mut self, hint: &str, actions: &str, _recovery: &str) -> Result<i32> {
        self.scheduled
            .borrow_mut()
            .push((hint.to_string(), actions.to_string()));
        Ok(0)
    }
}

#[test]
fn delayed_actions_are_handed_to_the_catalog() -> Result<()> {
    let recorder = Recorder::default();
    let mut ctx = context();
    ctx.set_catalog(Box::new(recorder.clone()));
    ctx.add_rules(
        r#"
later {
  delay("<PLUSET>1m</PLUSET>") { writeLine("serverLog", "later"); }
}
"#,
        Tier::Core,
    )?;
    let outcome = ctx.apply_hook("later", &mut []);
    assert_eq!(outcome.status, 0, "{}", outcome.errors);
    assert_eq!(
        recorder.scheduled.borrow().as_slice(),
        &[(
            "<PLUSET>1m</PLUSET>".to_string(),
            r#"writeLine("serverLog", "later");"#.to_string()
        )]
    );
    Ok(())
}

#[test]
fn failed_hook_reports_the_error_chain() -> Result<()> {
    let mut ctx = context();
    ctx.add_rules("r { failmsg(-99, \"custom failure\"); }", Tier::Core)?;
    let outcome = ctx.apply_hook("r", &mut []);
    assert_eq!(outcome.status, -99);
    let chain = outcome.errors.to_string();
    assert!(chain.contains("custom failure"), "{chain}");
    assert_eq!(outcome.errors.last_code(), Some(-99));
    Ok(())
}
