use std::hint::black_box;

use rulebase::{Binding, CompiledRuleBase, EngineConfig, EngineContext, Tier, Value};

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

fn context_with_rules(rules: &str) -> EngineContext {
    let mut ctx = EngineContext::new(EngineConfig::default());
    ctx.add_rules(rules, Tier::Core).unwrap();
    ctx
}

fn apply(ctx: &mut EngineContext, hook: &str, x: i64) -> Value {
    let mut bindings = [Binding::new("*X", black_box(x))];
    let outcome = ctx.apply_hook(hook, &mut bindings);
    assert_eq!(outcome.status, 0);
    bindings[0].value.clone()
}

fn simple_rules(c: &mut Criterion) {
    c.bench_function("arithmetic in one rule", |b| {
        let mut ctx = context_with_rules("inc(*X) { *X = *X + 1; }");
        b.iter(|| assert_eq!(apply(&mut ctx, "inc", 41), Value::from(42)))
    });

    c.bench_function("pure function call", |b| {
        let mut ctx = context_with_rules(
            r#"
            square(*n) = *n * *n
            sq(*X) { *X = square(*X); }
            "#,
        );
        b.iter(|| assert_eq!(apply(&mut ctx, "sq", 12), Value::from(144)))
    });
}

fn rule_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch over candidate rules");
    for n in [1usize, 10, 100] {
        let mut rules = String::new();
        for i in 0..n {
            rules.push_str(&format!("pick(*X) {{ on (*X == {i}) {{ *X = {i} * 2; }} }}\n"));
        }
        let mut ctx = context_with_rules(&rules);
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, n| {
            let last = (*n - 1) as i64;
            b.iter(|| assert_eq!(apply(&mut ctx, "pick", last), Value::from(last * 2)))
        });
    }
    group.finish();
}

fn loops(c: &mut Criterion) {
    c.bench_function("while loop of 1000 iterations", |b| {
        let mut ctx = context_with_rules(
            r#"
            count(*X) {
                *I = 0;
                while (*I < 1000) { *I = *I + 1; }
                *X = *I;
            }
            "#,
        );
        b.iter(|| assert_eq!(apply(&mut ctx, "count", 0), Value::from(1000)))
    });
}

fn compile(c: &mut Criterion) {
    let mut rules = String::new();
    for i in 0..200 {
        rules.push_str(&format!(
            "rule{i}(*X) {{ if (*X > {i}) then {{ *X = *X - 1; }} else {{ writeLine(\"serverLog\", *X); }} }}\n"
        ));
    }
    let config = EngineConfig::default();
    c.bench_function("compile 200 rules", |b| {
        b.iter(|| {
            let source = rulebase::unstable::Source::from_contents("bench.re".to_string(), rules.clone()).unwrap();
            black_box(CompiledRuleBase::from_source(&source, &config).unwrap())
        })
    });
}

criterion_group!(benches, simple_rules, rule_dispatch, loops, compile);
criterion_main!(benches);
