// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::ast::Tier;
use crate::cache::RuleCache;
use crate::catalog::{Catalog, MemoryCatalog};
use crate::config::EngineConfig;
use crate::env::SessionState;
use crate::error::ErrorChain;
use crate::interpreter::{EvalResult, Interpreter, Interrupt};
use crate::rule_base::CompiledRuleBase;
use crate::value::Value;
use crate::*;

use anyhow::Result;
use tracing::{debug, info};

/// A labeled value exchanged with a hook.
///
/// Labels starting with `$` name session variables. Other labels, with or
/// without a leading `*`, name the arguments of the hook, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub label: String,
    pub value: Value,
}

impl Binding {
    pub fn new(label: &str, value: impl Into<Value>) -> Self {
        Self {
            label: label.to_string(),
            value: value.into(),
        }
    }

    fn session_name(&self) -> Option<&str> {
        self.label.strip_prefix('$')
    }

    fn local_name(&self) -> &str {
        self.label.strip_prefix('*').unwrap_or(&self.label)
    }
}

/// Result of one hook invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HookOutcome {
    /// 0 on success, otherwise the code of the error that ended the hook.
    pub status: i32,
    pub errors: ErrorChain,
    pub stdout: String,
    pub stderr: String,
}

/// Value and captured output of evaluated text.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub value: Value,
    pub stdout: String,
    pub stderr: String,
}

/// The rule engine of one worker.
///
/// Holds the configuration, the rule-base cache, the active rule base, the
/// session state that survives between hooks and the data catalog that
/// builtins consult.
pub struct EngineContext {
    config: EngineConfig,
    cache: RuleCache,
    base: Rc<CompiledRuleBase>,
    state: SessionState,
    catalog: Box<dyn Catalog>,
}

impl EngineContext {
    /// A context with no rules, a cache configured by `config` and an
    /// empty in-memory catalog.
    pub fn new(config: EngineConfig) -> Self {
        let cache = RuleCache::from_config(&config);
        Self::with_cache(config, cache)
    }

    pub fn with_cache(config: EngineConfig, cache: RuleCache) -> Self {
        Self {
            config,
            cache,
            base: Rc::new(CompiledRuleBase::default()),
            state: SessionState::default(),
            catalog: Box::new(MemoryCatalog::new()),
        }
    }

    pub fn set_catalog(&mut self, catalog: Box<dyn Catalog>) {
        self.catalog = catalog;
    }

    pub fn catalog_mut(&mut self) -> &mut dyn Catalog {
        self.catalog.as_mut()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn rule_base(&self) -> &Rc<CompiledRuleBase> {
        &self.base
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Make the rule base of `set_id` active, compiling it unless the
    /// cache already holds an up-to-date copy.
    pub fn load(&mut self, set_id: &str) -> Result<()> {
        self.base = self.cache.load(set_id)?;
        info!(set_id, rules = self.base.rules().len(), "rule base loaded");
        Ok(())
    }

    /// Compile `text` and append its rules to the active rule base. On
    /// error the active rule base is unchanged.
    pub fn add_rules(&mut self, text: &str, tier: Tier) -> Result<usize> {
        Rc::make_mut(&mut self.base).add_rules(text, tier, &self.config)
    }

    fn run<F>(&mut self, f: F) -> (EvalResult, Interpreter<'_>)
    where
        F: FnOnce(&mut Interpreter<'_>) -> EvalResult,
    {
        let state = core::mem::take(&mut self.state);
        let mut interp =
            Interpreter::new(self.base.clone(), self.catalog.as_mut(), &self.config).with_state(state);
        let r = f(&mut interp);
        (r, interp)
    }

    /// Run an action sequence given as text, such as
    /// `writeLine("stdout", 1 + 2)`.
    pub fn eval(&mut self, text: &str) -> Result<Evaluation> {
        let (r, mut interp) = self.run(|interp| interp.eval_text(text));
        let stdout = interp.env().stdout();
        let stderr = interp.env().stderr();
        let state = interp.take_state();
        drop(interp);
        self.state = state;
        Ok(Evaluation {
            value: into_result(r)?,
            stdout,
            stderr,
        })
    }

    /// Evaluate a single expression given as text.
    pub fn eval_term(&mut self, text: &str) -> Result<Value> {
        let (r, mut interp) = self.run(|interp| interp.eval_term_text(text));
        let state = interp.take_state();
        drop(interp);
        self.state = state;
        into_result(r)
    }

    /// Apply the rules of hook `name`.
    ///
    /// Every binding is visible as a global for the duration of the call.
    /// Non-session bindings are also passed as arguments, and receive the
    /// final values of the corresponding rule parameters. Session bindings
    /// receive the final values of their session variables.
    pub fn apply_hook(&mut self, name: &str, bindings: &mut [Binding]) -> HookOutcome {
        debug!(hook = name, bindings = bindings.len(), "applying hook");
        let mut args: Vec<Value> = bindings
            .iter()
            .filter(|b| b.session_name().is_none())
            .map(|b| b.value.clone())
            .collect();

        let (r, mut interp) = self.run(|interp| {
            for b in bindings.iter() {
                match b.session_name() {
                    Some(s) => interp.env_mut().set_session(s, b.value.clone())?,
                    None => interp.env_mut().define_global(b.local_name(), b.value.clone())?,
                }
            }
            interp.apply_rules(name, &mut args)
        });

        let mut outcome = HookOutcome {
            stdout: interp.env().stdout(),
            stderr: interp.env().stderr(),
            ..HookOutcome::default()
        };
        let mut positional = args.into_iter();
        for b in bindings.iter_mut() {
            match b.session_name() {
                Some(s) => {
                    if let Some(v) = interp.env().session(s) {
                        b.value = v.clone();
                    }
                }
                None => {
                    if let Some(v) = positional.next() {
                        b.value = v;
                    }
                }
            }
        }
        outcome.errors = interp.take_errors();
        let state = interp.take_state();
        drop(interp);
        self.state = state;

        match r {
            Ok(_) | Err(Interrupt::Succeed) => outcome.status = 0,
            Err(e) => {
                let err = e.to_rule_error();
                outcome.status = err.code();
                if outcome.errors.last_code() != Some(err.code()) {
                    outcome.errors.push(err.code(), err.to_string());
                }
                debug!(hook = name, status = outcome.status, "hook failed");
            }
        }
        outcome
    }
}

fn into_result(r: EvalResult) -> Result<Value> {
    match r {
        Ok(v) => Ok(v),
        Err(Interrupt::Error(e)) => Err(e),
        Err(Interrupt::Succeed) => Ok(Value::Int(0)),
        Err(e @ Interrupt::Break) => Err(e.to_rule_error().into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{BuildCount, MemorySegment};

    fn context() -> EngineContext {
        let config = EngineConfig::default();
        let cache = RuleCache::new(config.clone(), Box::new(MemorySegment::new()), Rc::new(BuildCount::default()));
        EngineContext::with_cache(config, cache)
    }

    #[test]
    fn hook_writes_back_arguments() -> Result<()> {
        let mut ctx = context();
        ctx.add_rules("twice(*X) { *X = *X * 2; }", Tier::Core)?;
        let mut bindings = [Binding::new("*X", 21)];
        let outcome = ctx.apply_hook("twice", &mut bindings);
        assert_eq!(outcome.status, 0);
        assert_eq!(bindings[0].value, Value::Int(42));
        Ok(())
    }

    #[test]
    fn session_bindings_are_read_back() -> Result<()> {
        let mut ctx = context();
        ctx.add_rules("tag { $userName = $userName ++ \"!\"; }", Tier::Application)?;
        let mut bindings = [Binding::new("$userName", "rods")];
        let outcome = ctx.apply_hook("tag", &mut bindings);
        assert_eq!(outcome.status, 0);
        assert_eq!(bindings[0].value, Value::from("rods!"));
        Ok(())
    }

    #[test]
    fn missing_hook_reports_no_rule_found() {
        let mut ctx = context();
        let outcome = ctx.apply_hook("absent", &mut []);
        assert_eq!(outcome.status, crate::error::codes::NO_RULE_FOUND);
        assert!(!outcome.errors.is_empty());
    }

    #[test]
    fn session_id_survives_evaluations() -> Result<()> {
        let mut ctx = context();
        ctx.eval("setGlobalSessionId(\"abc\")")?;
        assert_eq!(ctx.eval_term("getGlobalSessionId()")?, Value::from("abc"));
        Ok(())
    }
}
