// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Access to the host's metadata catalog.
//!
//! The engine never talks to a database itself. Queries, collection
//! listings, host functions and deferred execution all go through the
//! `Catalog` trait supplied by the embedding server. `MemoryCatalog` is an
//! in-memory implementation used by the command line tool and the tests.

use crate::error::RuleError;
use crate::value::{Rows, Value};
use crate::*;

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryColumn {
    /// `count`, `sum`, `order` or `order_desc`.
    pub func: Option<Rc<str>>,
    pub name: Rc<str>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryAlternative {
    /// One of `=`, `<>`, `<`, `>`, `<=`, `>=`, `in`, `between`, `like`, `not like`.
    pub op: Rc<str>,
    pub values: Vec<Rc<str>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryCondition {
    pub column: Rc<str>,
    /// `||` or `&&` between alternatives.
    pub junction: Option<Rc<str>>,
    pub alternatives: Vec<QueryAlternative>,
}

/// A `select ... where ...` request with every operand evaluated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub columns: Vec<QueryColumn>,
    pub conditions: Vec<QueryCondition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionEntry {
    pub path: Rc<str>,
    pub is_collection: bool,
}

pub trait Catalog {
    fn query(&mut self, request: &QueryRequest) -> Result<Rows>;

    /// Immediate members of a collection.
    fn list_collection(&mut self, path: &str) -> Result<Vec<CollectionEntry>>;

    /// Invoke a host function. `Ok(None)` means the name is unknown to the
    /// host. Arguments may be overwritten to return output values.
    fn call(&mut self, _name: &str, _args: &mut [Value]) -> Result<Option<Value>> {
        Ok(None)
    }

    fn remote(&mut self, host: &str, _hint: &str, _actions: &str, _recovery: &str) -> Result<i32> {
        bail!(RuleError::UnsupportedOp(format!(
            "remote execution on `{host}` is not supported"
        )))
    }

    fn delay(&mut self, _hint: &str, _actions: &str, _recovery: &str) -> Result<i32> {
        bail!(RuleError::UnsupportedOp(
            "delayed execution is not supported".to_string()
        ))
    }
}

pub type HostFcn = fn(&mut [Value]) -> Result<Value>;

/// Deferred request recorded by `MemoryCatalog`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scheduled {
    pub host: Option<String>,
    pub hint: String,
    pub actions: String,
    pub recovery: String,
}

/// Catalog backed by a single table of records and a tree of collections.
#[derive(Debug, Default, Clone)]
pub struct MemoryCatalog {
    records: Vec<BTreeMap<Rc<str>, Value>>,
    collections: BTreeMap<Rc<str>, Vec<CollectionEntry>>,
    functions: BTreeMap<Rc<str>, HostFcn>,
    pub scheduled: Vec<Scheduled>,
}

fn parent_of(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) if path.len() > 1 => Some("/"),
        Some(0) | None => None,
        Some(idx) => Some(&path[..idx]),
    }
}

/// SQL `like` with `%` and `_` wildcards.
fn sql_like(text: &str, pattern: &str) -> bool {
    let t: Vec<char> = text.chars().collect();
    let p: Vec<char> = pattern.chars().collect();
    let (mut ti, mut pi) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while ti < t.len() {
        if pi < p.len() && (p[pi] == '_' || p[pi] == t[ti]) {
            ti += 1;
            pi += 1;
        } else if pi < p.len() && p[pi] == '%' {
            backtrack = Some((pi, ti));
            pi += 1;
        } else if let Some((bp, bt)) = backtrack {
            pi = bp + 1;
            ti = bt + 1;
            backtrack = Some((bp, bt + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|c| *c == '%')
}

fn cell_cmp(cell: &Value, literal: &str) -> Option<core::cmp::Ordering> {
    match cell {
        Value::Int(_) | Value::Double(_) => {
            let l: f64 = literal.parse().ok()?;
            cell.as_double().ok()?.partial_cmp(&l)
        }
        other => Some(other.to_string().as_str().cmp(literal)),
    }
}

fn matches_alternative(cell: &Value, alt: &QueryAlternative) -> Result<bool> {
    use core::cmp::Ordering::*;
    let first = || -> Result<&str> {
        match alt.values.first() {
            Some(v) => Ok(v),
            None => bail!(RuleError::UnsupportedOp(format!(
                "query operator `{}` needs an operand",
                alt.op
            ))),
        }
    };
    Ok(match alt.op.as_ref() {
        "=" => cell_cmp(cell, first()?) == Some(Equal),
        "<>" => cell_cmp(cell, first()?) != Some(Equal),
        "<" => cell_cmp(cell, first()?) == Some(Less),
        ">" => cell_cmp(cell, first()?) == Some(Greater),
        "<=" => matches!(cell_cmp(cell, first()?), Some(Less | Equal)),
        ">=" => matches!(cell_cmp(cell, first()?), Some(Greater | Equal)),
        "in" => alt
            .values
            .iter()
            .any(|v| cell_cmp(cell, v) == Some(Equal)),
        "between" => match alt.values.as_slice() {
            [lo, hi] => {
                matches!(cell_cmp(cell, lo), Some(Greater | Equal))
                    && matches!(cell_cmp(cell, hi), Some(Less | Equal))
            }
            _ => bail!(RuleError::UnsupportedOp(
                "`between` needs two operands".to_string()
            )),
        },
        "like" => sql_like(&cell.to_string(), first()?),
        "not like" => !sql_like(&cell.to_string(), first()?),
        op => bail!(RuleError::UnsupportedOp(format!(
            "unsupported query operator `{op}`"
        ))),
    })
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_record(&mut self, fields: &[(&str, Value)]) {
        self.records.push(
            fields
                .iter()
                .map(|(k, v)| (Rc::from(*k), v.clone()))
                .collect(),
        );
    }

    /// Register a data object, creating its parent collections.
    pub fn add_object(&mut self, path: &str) {
        self.add_entry(path, false);
    }

    pub fn add_collection(&mut self, path: &str) {
        self.add_entry(path, true);
    }

    fn add_entry(&mut self, path: &str, is_collection: bool) {
        if is_collection {
            self.collections.entry(path.into()).or_default();
        }
        let Some(parent) = parent_of(path) else {
            return;
        };
        let entry = CollectionEntry {
            path: path.into(),
            is_collection,
        };
        let exists = self
            .collections
            .get(parent)
            .is_some_and(|members| members.contains(&entry));
        if !exists {
            self.add_entry(parent, true);
            if let Some(members) = self.collections.get_mut(parent) {
                members.push(entry);
            }
        }
    }

    pub fn add_function(&mut self, name: &str, f: HostFcn) {
        self.functions.insert(name.into(), f);
    }

    fn record_matches(
        &self,
        record: &BTreeMap<Rc<str>, Value>,
        cond: &QueryCondition,
    ) -> Result<bool> {
        let cell = record.get(&cond.column).cloned().unwrap_or(Value::Unit);
        let and = cond.junction.as_deref() == Some("&&");
        let mut result = and;
        for alt in &cond.alternatives {
            let m = matches_alternative(&cell, alt)?;
            result = if and { result && m } else { result || m };
        }
        Ok(result)
    }
}

impl Catalog for MemoryCatalog {
    fn query(&mut self, request: &QueryRequest) -> Result<Rows> {
        let mut selected = vec![];
        'records: for record in &self.records {
            for cond in &request.conditions {
                if !self.record_matches(record, cond)? {
                    continue 'records;
                }
            }
            selected.push(record);
        }

        let columns: Vec<Rc<str>> = request.columns.iter().map(|c| c.name.clone()).collect();
        let aggregate = request
            .columns
            .iter()
            .any(|c| matches!(c.func.as_deref(), Some("count" | "sum")));
        let cell = |r: &BTreeMap<Rc<str>, Value>, c: &Rc<str>| r.get(c).cloned().unwrap_or(Value::Unit);

        if aggregate {
            let mut row = vec![];
            for c in &request.columns {
                row.push(match c.func.as_deref() {
                    Some("count") => Value::Int(selected.len() as i64),
                    Some("sum") => {
                        let mut sum = 0.0;
                        for r in &selected {
                            sum += cell(r, &c.name).as_double()?;
                        }
                        Value::Double(sum)
                    }
                    _ => selected
                        .first()
                        .map(|r| cell(r, &c.name))
                        .unwrap_or(Value::Unit),
                });
            }
            return Ok(Rows {
                columns,
                rows: vec![row],
            });
        }

        for c in request.columns.iter().rev() {
            let desc = match c.func.as_deref() {
                Some("order") => false,
                Some("order_desc") => true,
                _ => continue,
            };
            selected.sort_by(|a, b| {
                let o = cell(a, &c.name)
                    .compare(&cell(b, &c.name))
                    .unwrap_or(core::cmp::Ordering::Equal);
                if desc {
                    o.reverse()
                } else {
                    o
                }
            });
        }

        let rows = selected
            .iter()
            .map(|r| request.columns.iter().map(|c| cell(r, &c.name)).collect())
            .collect();
        Ok(Rows { columns, rows })
    }

    fn list_collection(&mut self, path: &str) -> Result<Vec<CollectionEntry>> {
        let trimmed = match path.len() > 1 {
            true => path.trim_end_matches('/'),
            false => path,
        };
        match self.collections.get(trimmed) {
            Some(members) => Ok(members.clone()),
            None => bail!(RuleError::Runtime(format!(
                "collection `{path}` does not exist"
            ))),
        }
    }

    fn call(&mut self, name: &str, args: &mut [Value]) -> Result<Option<Value>> {
        match self.functions.get(name) {
            Some(f) => f(args).map(Some),
            None => Ok(None),
        }
    }

    fn remote(&mut self, host: &str, hint: &str, actions: &str, recovery: &str) -> Result<i32> {
        self.scheduled.push(Scheduled {
            host: Some(host.to_string()),
            hint: hint.to_string(),
            actions: actions.to_string(),
            recovery: recovery.to_string(),
        });
        Ok(0)
    }

    fn delay(&mut self, hint: &str, actions: &str, recovery: &str) -> Result<i32> {
        self.scheduled.push(Scheduled {
            host: None,
            hint: hint.to_string(),
            actions: actions.to_string(),
            recovery: recovery.to_string(),
        });
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> MemoryCatalog {
        let mut c = MemoryCatalog::new();
        c.add_record(&[("DATA_NAME", "a.txt".into()), ("DATA_SIZE", Value::Int(10))]);
        c.add_record(&[("DATA_NAME", "b.dat".into()), ("DATA_SIZE", Value::Int(30))]);
        c.add_record(&[("DATA_NAME", "c.txt".into()), ("DATA_SIZE", Value::Int(20))]);
        c
    }

    fn request(cols: &[(Option<&str>, &str)], conds: Vec<QueryCondition>) -> QueryRequest {
        QueryRequest {
            columns: cols
                .iter()
                .map(|(f, n)| QueryColumn {
                    func: f.map(Rc::from),
                    name: (*n).into(),
                })
                .collect(),
            conditions: conds,
        }
    }

    fn cond(column: &str, op: &str, values: &[&str]) -> QueryCondition {
        QueryCondition {
            column: column.into(),
            junction: None,
            alternatives: vec![QueryAlternative {
                op: op.into(),
                values: values.iter().map(|v| Rc::from(*v)).collect(),
            }],
        }
    }

    #[test]
    fn like_filters_and_order_sorts() -> Result<()> {
        let mut c = catalog();
        let rows = c.query(&request(
            &[(None, "DATA_NAME"), (Some("order_desc"), "DATA_SIZE")],
            vec![cond("DATA_NAME", "like", &["%.txt"])],
        ))?;
        assert_eq!(rows.rows.len(), 2);
        assert_eq!(rows.rows[0][0], Value::from("c.txt"));
        Ok(())
    }

    #[test]
    fn aggregates_collapse_to_one_row() -> Result<()> {
        let mut c = catalog();
        let rows = c.query(&request(
            &[(Some("count"), "DATA_NAME"), (Some("sum"), "DATA_SIZE")],
            vec![cond("DATA_SIZE", "between", &["15", "40"])],
        ))?;
        assert_eq!(rows.rows, vec![vec![Value::Int(2), Value::Double(50.0)]]);
        Ok(())
    }

    #[test]
    fn objects_create_parent_collections() -> Result<()> {
        let mut c = MemoryCatalog::new();
        c.add_object("/zone/home/a");
        c.add_object("/zone/home/sub/b");
        let home = c.list_collection("/zone/home/")?;
        assert_eq!(home.len(), 2);
        assert!(home[1].is_collection);
        assert!(c.list_collection("/nowhere").is_err());

        c.add_collection("/zone/empty");
        assert!(c.list_collection("/zone/empty")?.is_empty());
        assert_eq!(c.list_collection("/zone")?.len(), 2);
        Ok(())
    }

    #[test]
    fn sql_wildcards() {
        assert!(sql_like("abc", "a%"));
        assert!(sql_like("abc", "_b_"));
        assert!(sql_like("abc", "%"));
        assert!(!sql_like("abc", "a_"));
    }
}
