// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Lexical environments.
//!
//! Values live in an append-only `Region`; scopes map names to handles into
//! it. Frame 0 is the process-global scope: it holds session variables
//! (stored under `$name`) and the `ruleExecOut` buffers. Each rule call pushes
//! a frame; lookups search the current frame and then the global scope.

use crate::region::{promote, Id, Region};
use crate::value::Value;
use crate::*;

use core::ops::{Deref, DerefMut};
use std::collections::BTreeMap;

use anyhow::Result;
use indexmap::IndexSet;
use tracing::debug;

type Scope = BTreeMap<Rc<str>, Id<Value>>;

pub const RULE_EXEC_OUT: &str = "ruleExecOut";

/// State kept across evaluations of one engine context.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub global_session_id: String,
    /// Backing store of `temporaryStorage`.
    pub temporary: BTreeMap<Rc<str>, Value>,
}

#[derive(Debug)]
pub struct Env {
    values: Region<Value>,
    compaction_threshold: usize,
    global: Scope,
    frames: Vec<Vec<Scope>>,
}

impl Default for Env {
    fn default() -> Self {
        Self::new(usize::MAX, usize::MAX)
    }
}

fn session_key(name: &str) -> Rc<str> {
    format!("${name}").into()
}

impl Env {
    pub fn new(region_limit: usize, compaction_threshold: usize) -> Self {
        Self {
            values: Region::with_limit(region_limit),
            compaction_threshold,
            global: Scope::new(),
            frames: vec![],
        }
    }

    fn current(&mut self) -> &mut Scope {
        match self.frames.last_mut().and_then(|f| f.last_mut()) {
            Some(scope) => scope,
            None => &mut self.global,
        }
    }

    fn find(&self, name: &str) -> Option<Id<Value>> {
        if let Some(frame) = self.frames.last() {
            for scope in frame.iter().rev() {
                if let Some(id) = scope.get(name) {
                    return Some(*id);
                }
            }
        }
        self.global.get(name).copied()
    }

    /// Enter a rule body. Locals of the caller become invisible.
    pub fn push_frame(&mut self) {
        self.frames.push(vec![Scope::new()]);
    }

    pub fn pop_frame(&mut self) {
        self.frames.pop();
    }

    pub fn push_scope(&mut self) {
        match self.frames.last_mut() {
            Some(frame) => frame.push(Scope::new()),
            None => self.frames.push(vec![Scope::new()]),
        }
    }

    pub fn pop_scope(&mut self) {
        if let Some(frame) = self.frames.last_mut() {
            frame.pop();
            if frame.is_empty() {
                self.frames.pop();
            }
        }
    }

    /// Bind `name` in the innermost scope.
    pub fn define(&mut self, name: &str, value: Value) -> Result<()> {
        let id = self.values.alloc(value)?;
        self.current().insert(name.into(), id);
        Ok(())
    }

    /// Rebind `name` in the scope that holds it, or define it in the
    /// innermost scope when it is unbound.
    pub fn update(&mut self, name: &str, value: Value) -> Result<()> {
        let id = self.values.alloc(value)?;
        if let Some(frame) = self.frames.last_mut() {
            for scope in frame.iter_mut().rev() {
                if let Some(slot) = scope.get_mut(name) {
                    *slot = id;
                    return Ok(());
                }
            }
        }
        if let Some(slot) = self.global.get_mut(name) {
            *slot = id;
            return Ok(());
        }
        self.current().insert(name.into(), id);
        Ok(())
    }

    /// Remove the innermost binding of `name`.
    pub fn unset(&mut self, name: &str) {
        if let Some(frame) = self.frames.last_mut() {
            for scope in frame.iter_mut().rev() {
                if scope.remove(name).is_some() {
                    return;
                }
            }
        }
        self.global.remove(name);
    }

    pub fn lookup(&self, name: &str) -> Option<&Value> {
        self.find(name).map(|id| &self.values[id])
    }

    pub fn define_global(&mut self, name: &str, value: Value) -> Result<()> {
        let id = self.values.alloc(value)?;
        self.global.insert(name.into(), id);
        Ok(())
    }

    pub fn session(&self, name: &str) -> Option<&Value> {
        self.global.get(&session_key(name)).map(|id| &self.values[*id])
    }

    pub fn set_session(&mut self, name: &str, value: Value) -> Result<()> {
        let id = self.values.alloc(value)?;
        self.global.insert(session_key(name), id);
        Ok(())
    }

    /// Names visible from the current frame, locals first. A shadowed
    /// name is listed once.
    pub fn names(&self) -> Vec<Rc<str>> {
        let mut names: IndexSet<Rc<str>> = IndexSet::new();
        if let Some(frame) = self.frames.last() {
            for scope in frame.iter().rev() {
                names.extend(scope.keys().cloned());
            }
        }
        names.extend(self.global.keys().cloned());
        names.into_iter().collect()
    }

    fn exec_out(&self, stream: &str) -> String {
        match self.global.get(RULE_EXEC_OUT).map(|id| &self.values[*id]) {
            Some(Value::KeyValue(m)) => m.get(stream).map(|v| v.to_string()).unwrap_or_default(),
            _ => String::new(),
        }
    }

    /// Append `text` to the `stdout` or `stderr` buffer of `ruleExecOut`.
    /// The buffers keep their slot in the region.
    pub fn write_out(&mut self, stream: &str, text: &str) -> Result<()> {
        let Some(id) = self.global.get(RULE_EXEC_OUT).copied() else {
            let buffers = BTreeMap::from([(Rc::from(stream), Value::from(text))]);
            return self.define_global(RULE_EXEC_OUT, Value::KeyValue(Rc::new(buffers)));
        };
        let mut buffers = match self.values.replace(id, Value::Unit)? {
            Value::KeyValue(m) => m,
            _ => Rc::new(BTreeMap::new()),
        };
        let map = Rc::make_mut(&mut buffers);
        let mut current = map.get(stream).map(|v| v.to_string()).unwrap_or_default();
        current.push_str(text);
        map.insert(stream.into(), Value::from(current));
        self.values.replace(id, Value::KeyValue(buffers))?;
        Ok(())
    }

    pub fn stdout(&self) -> String {
        self.exec_out("stdout")
    }

    pub fn stderr(&self) -> String {
        self.exec_out("stderr")
    }

    fn footprint(&self) -> usize {
        self.values.footprint()
    }

    /// Move every live value into a fresh region once the current one has
    /// grown past the compaction threshold.
    pub fn compact_if_needed(&mut self) -> Result<()> {
        let before = self.footprint();
        if before <= self.compaction_threshold {
            return Ok(());
        }
        let mut fresh = Region::with_limit(self.values.limit());
        let mut global = Scope::new();
        for (name, id) in &self.global {
            global.insert(name.clone(), promote(&self.values, *id, &mut fresh)?);
        }
        let mut frames = Vec::with_capacity(self.frames.len());
        for frame in &self.frames {
            let mut scopes = Vec::with_capacity(frame.len());
            for scope in frame {
                let mut s = Scope::new();
                for (name, id) in scope {
                    s.insert(name.clone(), promote(&self.values, *id, &mut fresh)?);
                }
                scopes.push(s);
            }
            frames.push(scopes);
        }
        self.values = fresh;
        self.global = global;
        self.frames = frames;
        debug!(before, after = self.footprint(), "compacted environment");
        Ok(())
    }
}

/// Owners of an `Env`, so that a guard can restore a binding through them.
pub trait Scoped {
    fn env_mut(&mut self) -> &mut Env;
}

impl Scoped for Env {
    fn env_mut(&mut self) -> &mut Env {
        self
    }
}

/// Saves the binding of a variable and restores it on drop: the previous
/// value is written back, or the variable is removed if it had none.
pub struct ScopeGuard<'a, T: Scoped> {
    owner: &'a mut T,
    name: Rc<str>,
    saved: Option<Value>,
}

impl<'a, T: Scoped> ScopeGuard<'a, T> {
    pub fn new(owner: &'a mut T, name: Rc<str>) -> Self {
        let saved = owner.env_mut().lookup(&name).cloned();
        Self { owner, name, saved }
    }
}

impl<T: Scoped> Deref for ScopeGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &*self.owner
    }
}

impl<T: Scoped> DerefMut for ScopeGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.owner
    }
}

impl<T: Scoped> Drop for ScopeGuard<'_, T> {
    fn drop(&mut self) {
        let env = self.owner.env_mut();
        match self.saved.take() {
            Some(v) => {
                if let Err(e) = env.update(&self.name, v) {
                    debug!("unable to restore `{}`: {e}", self.name);
                }
            }
            None => env.unset(&self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{codes, RuleError};

    #[test]
    fn frames_hide_caller_locals() -> Result<()> {
        let mut env = Env::default();
        env.define_global("G", Value::Int(1))?;
        env.push_frame();
        env.define("a", Value::Int(2))?;
        env.push_frame();
        assert!(env.lookup("a").is_none());
        assert_eq!(env.lookup("G"), Some(&Value::Int(1)));
        env.pop_frame();
        assert_eq!(env.lookup("a"), Some(&Value::Int(2)));
        Ok(())
    }

    #[test]
    fn update_writes_where_found() -> Result<()> {
        let mut env = Env::default();
        env.push_frame();
        env.define("x", Value::Int(1))?;
        env.push_scope();
        env.update("x", Value::Int(5))?;
        env.pop_scope();
        assert_eq!(env.lookup("x"), Some(&Value::Int(5)));
        Ok(())
    }

    #[test]
    fn guard_restores_or_removes() -> Result<()> {
        let mut env = Env::default();
        env.push_frame();
        {
            let mut g = ScopeGuard::new(&mut env, "I".into());
            g.update("I", Value::Int(3))?;
            assert_eq!(g.lookup("I"), Some(&Value::Int(3)));
        }
        assert!(env.lookup("I").is_none());

        env.define("I", Value::from("before"))?;
        {
            let mut g = ScopeGuard::new(&mut env, "I".into());
            g.update("I", Value::Int(3))?;
        }
        assert_eq!(env.lookup("I"), Some(&Value::from("before")));
        Ok(())
    }

    #[test]
    fn session_and_locals_do_not_collide() -> Result<()> {
        let mut env = Env::default();
        env.set_session("userName", Value::from("alice"))?;
        env.push_frame();
        env.define("userName", Value::from("bob"))?;
        assert_eq!(env.session("userName"), Some(&Value::from("alice")));
        assert_eq!(env.lookup("userName"), Some(&Value::from("bob")));
        Ok(())
    }

    #[test]
    fn compaction_keeps_live_values_only() -> Result<()> {
        let mut env = Env::new(usize::MAX, 1024);
        env.push_frame();
        for i in 0..200 {
            env.update("i", Value::Int(i))?;
        }
        let grown = env.footprint();
        env.compact_if_needed()?;
        assert!(env.footprint() < grown);
        assert_eq!(env.lookup("i"), Some(&Value::Int(199)));
        Ok(())
    }

    #[test]
    fn region_limit_is_out_of_memory() {
        let mut env = Env::new(256, usize::MAX);
        let mut result = Ok(());
        for i in 0..100 {
            result = env.define("x", Value::from(format!("value {i}")));
            if result.is_err() {
                break;
            }
        }
        let err = result.err().map(|e| RuleError::from_anyhow(&e).code());
        assert_eq!(err, Some(codes::RE_OUT_OF_MEMORY));
    }

    #[test]
    fn exec_out_buffers_accumulate() -> Result<()> {
        let mut env = Env::default();
        env.write_out("stdout", "1\n")?;
        env.write_out("stdout", "2\n")?;
        env.write_out("stderr", "oops")?;
        assert_eq!(env.stdout(), "1\n2\n");
        assert_eq!(env.stderr(), "oops");
        Ok(())
    }

    #[test]
    fn exec_out_buffers_are_updated_in_place() -> Result<()> {
        let mut env = Env::default();
        env.write_out("stdout", "line\n")?;
        let slots = env.values.len();
        for _ in 0..100 {
            env.write_out("stdout", "line\n")?;
        }
        env.write_out("stderr", "oops")?;
        assert_eq!(env.values.len(), slots);
        assert_eq!(env.stdout(), "line\n".repeat(101));
        assert!(env.footprint() < 4096, "{}", env.footprint());
        Ok(())
    }

    #[test]
    fn shadowed_names_are_listed_once() -> Result<()> {
        let mut env = Env::default();
        env.define_global("x", Value::Int(1))?;
        env.define_global("g", Value::Int(2))?;
        env.push_frame();
        env.define("x", Value::Int(3))?;
        env.push_scope();
        env.define("x", Value::Int(4))?;
        let names = env.names();
        let names: Vec<&str> = names.iter().map(|n| n.as_ref()).collect();
        assert_eq!(names, vec!["x", "g"]);
        Ok(())
    }
}
