// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Values `foreach` can iterate over.

use crate::ast::{Node, NodeId, VarScope};
use crate::catalog::Catalog;
use crate::env::ScopeGuard;
use crate::error::RuleError;
use crate::interpreter::{EvalResult, Interpreter, Interrupt};
use crate::value::{Rows, Value};
use crate::*;

use std::collections::VecDeque;

use anyhow::{bail, Result};

/// A cursor over the elements of a value. `init` is called once before the
/// first element and `finalize` once after the last, even when the loop
/// ends early.
pub trait Iterable {
    fn init(&mut self, _catalog: &mut dyn Catalog) -> Result<()> {
        Ok(())
    }
    fn has_next(&mut self, catalog: &mut dyn Catalog) -> Result<bool>;
    fn next(&mut self, catalog: &mut dyn Catalog) -> Result<Value>;
    fn finalize(&mut self, _catalog: &mut dyn Catalog) -> Result<()> {
        Ok(())
    }
}

/// Elements held in memory.
struct Sequence<T> {
    items: Rc<Vec<T>>,
    pos: usize,
    make: fn(&T) -> Value,
}

impl<T> Iterable for Sequence<T> {
    fn has_next(&mut self, _: &mut dyn Catalog) -> Result<bool> {
        Ok(self.pos < self.items.len())
    }

    fn next(&mut self, _: &mut dyn Catalog) -> Result<Value> {
        match self.items.get(self.pos) {
            Some(item) => {
                self.pos += 1;
                Ok((self.make)(item))
            }
            None => bail!(RuleError::Runtime("iteration past the end".to_string())),
        }
    }
}

fn sequence<T: 'static>(items: Rc<Vec<T>>, make: fn(&T) -> Value) -> Box<dyn Iterable> {
    Box::new(Sequence { items, pos: 0, make })
}

/// Query results, one key-value collection per row.
struct RowsIter {
    rows: Rc<Rows>,
    pos: usize,
}

impl Iterable for RowsIter {
    fn has_next(&mut self, _: &mut dyn Catalog) -> Result<bool> {
        Ok(self.pos < self.rows.rows.len())
    }

    fn next(&mut self, _: &mut dyn Catalog) -> Result<Value> {
        match self.rows.row(self.pos) {
            Some(row) => {
                self.pos += 1;
                Ok(row)
            }
            None => bail!(RuleError::Runtime("iteration past the end".to_string())),
        }
    }
}

/// Paths of the data objects below a collection, depth first.
pub struct CollectionWalk {
    root: Rc<str>,
    collections: Vec<Rc<str>>,
    objects: VecDeque<Rc<str>>,
}

impl CollectionWalk {
    pub fn new(root: Rc<str>) -> Self {
        Self {
            root,
            collections: vec![],
            objects: VecDeque::new(),
        }
    }
}

impl Iterable for CollectionWalk {
    fn init(&mut self, _: &mut dyn Catalog) -> Result<()> {
        self.collections = vec![self.root.clone()];
        self.objects.clear();
        Ok(())
    }

    fn has_next(&mut self, catalog: &mut dyn Catalog) -> Result<bool> {
        while self.objects.is_empty() {
            let Some(coll) = self.collections.pop() else {
                return Ok(false);
            };
            let members = catalog.list_collection(&coll)?;
            // Reversed so that sub-collections are visited in listing order.
            for m in members.iter().rev() {
                if m.is_collection {
                    self.collections.push(m.path.clone());
                }
            }
            self.objects
                .extend(members.into_iter().filter(|m| !m.is_collection).map(|m| m.path));
        }
        Ok(true)
    }

    fn next(&mut self, _: &mut dyn Catalog) -> Result<Value> {
        match self.objects.pop_front() {
            Some(p) => Ok(Value::Path(p)),
            None => bail!(RuleError::Runtime("iteration past the end".to_string())),
        }
    }
}

/// The iterable for a `foreach` subject.
pub fn iterable_for(value: &Value) -> Result<Box<dyn Iterable>> {
    Ok(match value {
        Value::String(s) => {
            let items: Vec<Rc<str>> = s
                .split(',')
                .filter(|p| !p.is_empty())
                .map(Rc::from)
                .collect();
            sequence(Rc::new(items), |s| Value::String(s.clone()))
        }
        Value::List(items) => sequence(items.clone(), Value::clone),
        Value::Rows(rows) => Box::new(RowsIter {
            rows: rows.clone(),
            pos: 0,
        }),
        Value::IntArray(items) => sequence(items.clone(), |i| Value::Int(*i)),
        Value::StrArray(items) => sequence(items.clone(), |s| Value::String(s.clone())),
        Value::KeyValue(map) => {
            let keys: Vec<Rc<str>> = map.keys().cloned().collect();
            sequence(Rc::new(keys), |k| Value::String(k.clone()))
        }
        Value::Path(p) => Box::new(CollectionWalk::new(p.clone())),
        v => bail!(RuleError::UnsupportedOp(format!(
            "cannot iterate over {} `{v}`",
            v.type_name()
        ))),
    })
}

impl Interpreter<'_> {
    /// Run `body` once per element of `iterable`, with the loop variable
    /// `var` bound to the element. The variable's previous binding is
    /// restored afterwards, or removed if it had none.
    pub fn iterate(
        &mut self,
        var: NodeId,
        iterable: &mut dyn Iterable,
        body: NodeId,
        recovery: NodeId,
    ) -> EvalResult {
        let name = match &self.ast()[var] {
            Node::Var {
                name,
                scope: VarScope::Local,
                ..
            } => name.clone(),
            _ => {
                return Err(RuleError::UnsupportedOp(
                    self.span(var)
                        .message("error", "loop variable must be a local variable"),
                )
                .into())
            }
        };
        let mut guard = ScopeGuard::new(self, name.clone());
        iterable.init(guard.catalog())?;
        let result = guard.drive(&name, iterable, body, recovery);
        let finished = iterable.finalize(guard.catalog());
        drop(guard);
        let value = result?;
        finished?;
        Ok(value)
    }

    fn drive(
        &mut self,
        name: &str,
        iterable: &mut dyn Iterable,
        body: NodeId,
        recovery: NodeId,
    ) -> EvalResult {
        while iterable.has_next(self.catalog())? {
            let item = iterable.next(self.catalog())?;
            self.env_mut().update(name, item)?;
            match self.exec_actions(body, recovery) {
                Ok(_) => (),
                Err(Interrupt::Break) => break,
                Err(e) => return Err(e),
            }
            self.env_mut().compact_if_needed()?;
        }
        Ok(Value::Int(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;

    fn collect(value: &Value, catalog: &mut dyn Catalog) -> Result<Vec<Value>> {
        let mut it = iterable_for(value)?;
        it.init(catalog)?;
        let mut out = vec![];
        while it.has_next(catalog)? {
            out.push(it.next(catalog)?);
        }
        it.finalize(catalog)?;
        Ok(out)
    }

    #[test]
    fn delimited_strings_skip_empty_items() -> Result<()> {
        let mut c = MemoryCatalog::new();
        let items = collect(&Value::from("a,,b,c"), &mut c)?;
        assert_eq!(items, vec!["a".into(), "b".into(), "c".into()]);
        Ok(())
    }

    #[test]
    fn key_value_iterates_keys() -> Result<()> {
        let mut c = MemoryCatalog::new();
        let v = Value::from_json_str(r#"{"b": 1, "a": 2}"#)?;
        assert_eq!(collect(&v, &mut c)?, vec!["a".into(), "b".into()]);
        Ok(())
    }

    #[test]
    fn rows_become_key_values() -> Result<()> {
        let mut c = MemoryCatalog::new();
        let rows = Rows {
            columns: vec!["DATA_NAME".into()],
            rows: vec![vec!["x".into()], vec!["y".into()]],
        };
        let items = collect(&Value::Rows(Rc::new(rows)), &mut c)?;
        assert_eq!(items.len(), 2);
        let Value::KeyValue(m) = &items[1] else {
            bail!("expected a row");
        };
        assert_eq!(m["DATA_NAME"], Value::from("y"));
        Ok(())
    }

    #[test]
    fn collection_walk_is_recursive() -> Result<()> {
        let mut c = MemoryCatalog::new();
        c.add_object("/z/home/a");
        c.add_object("/z/home/sub/b");
        c.add_object("/z/home/sub/deeper/c");
        c.add_object("/z/home/d");
        let items = collect(&Value::Path("/z/home".into()), &mut c)?;
        let paths: Vec<String> = items.iter().map(|v| v.to_string()).collect();
        assert_eq!(paths, ["/z/home/a", "/z/home/d", "/z/home/sub/b", "/z/home/sub/deeper/c"]);
        Ok(())
    }

    #[test]
    fn scalars_are_not_iterable() {
        assert!(iterable_for(&Value::Int(3)).is_err());
    }
}
