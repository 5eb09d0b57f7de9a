// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Rule lookup by name.
//!
//! Every relational or function rule is listed under its name, highest tier
//! first and in definition order within a tier. When all rules of a name
//! share their parameters and test the same expression against different
//! string literals (`on (*A == "x")`), the name also gets a secondary index
//! from literal to rules, so dispatch evaluates the expression once instead
//! of once per rule.

use crate::ast::*;
use crate::*;

use core::cmp::Reverse;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CondIndex {
    /// The shared left-hand side, in the first rule of the name.
    pub lhs: NodeId,
    pub params: Vec<Rc<str>>,
    pub by_literal: IndexMap<Rc<str>, Vec<usize>>,
    pub all: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IndexEntry {
    Primary(Vec<usize>),
    Secondary(CondIndex),
}

impl IndexEntry {
    fn rules(&self) -> &[usize] {
        match self {
            IndexEntry::Primary(rules) => rules,
            IndexEntry::Secondary(ci) => &ci.all,
        }
    }
}

/// Next rule to try and the cursor to resume from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub rule: usize,
    pub cursor: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleIndex {
    entries: IndexMap<Rc<str>, IndexEntry>,
}

fn param_names(ast: &Ast, params: &[NodeId]) -> Vec<Rc<str>> {
    params
        .iter()
        .filter_map(|p| match &ast[*p] {
            Node::Param { name, .. } => Some(name.clone()),
            _ => None,
        })
        .collect()
}

/// `lhs == "literal"` conditions.
fn literal_test(ast: &Ast, cond: NodeId) -> Option<(NodeId, Rc<str>)> {
    match &ast[cond] {
        Node::App { func, args, .. } if func.as_ref() == "==" && args.len() == 2 => {
            match &ast[args[1]] {
                Node::Str { value, .. } => Some((args[0], value.clone())),
                _ => None,
            }
        }
        _ => None,
    }
}

fn secondary(ast: &Ast, rules: &RuleSet, candidates: &[usize]) -> Option<CondIndex> {
    if candidates.len() < 2 {
        return None;
    }
    let mut shape: Option<(String, Vec<Rc<str>>, NodeId)> = None;
    let mut by_literal: IndexMap<Rc<str>, Vec<usize>> = IndexMap::new();
    for idx in candidates {
        let Node::Rule { params, cond, .. } = &ast[rules.rules[*idx].node] else {
            return None;
        };
        let (lhs, literal) = literal_test(ast, *cond)?;
        let names = param_names(ast, params);
        let dump = ast.dump(lhs);
        match &shape {
            Some((d, n, _)) if *d != dump || *n != names => return None,
            Some(_) => (),
            None => shape = Some((dump, names, lhs)),
        }
        by_literal.entry(literal).or_default().push(*idx);
    }
    let (_, params, lhs) = shape?;
    Some(CondIndex {
        lhs,
        params,
        by_literal,
        all: candidates.to_vec(),
    })
}

impl RuleIndex {
    pub fn build(ast: &Ast, rules: &RuleSet) -> RuleIndex {
        let mut lists: IndexMap<Rc<str>, Vec<usize>> = IndexMap::new();
        for (idx, desc) in rules.iter().enumerate() {
            let name = match (&desc.kind, &ast[desc.node]) {
                (RuleKind::Rel, Node::Rule { name, .. }) => name,
                (RuleKind::Func, Node::FuncRule { name, .. }) => name,
                _ => continue,
            };
            lists.entry(name.clone()).or_default().push(idx);
        }

        let mut entries = IndexMap::new();
        for (name, mut list) in lists {
            // Stable: definition order is kept within a tier.
            list.sort_by_key(|idx| Reverse(rules.rules[*idx].tier));
            let entry = match secondary(ast, rules, &list) {
                Some(ci) => IndexEntry::Secondary(ci),
                None => IndexEntry::Primary(list),
            };
            entries.insert(name, entry);
        }
        RuleIndex { entries }
    }

    pub fn entry(&self, name: &str) -> Option<&IndexEntry> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &Rc<str>> {
        self.entries.keys()
    }

    /// Rules of `name` in dispatch order.
    pub fn rules(&self, name: &str) -> &[usize] {
        self.entries.get(name).map(|e| e.rules()).unwrap_or_default()
    }

    /// The candidate at position `cursor` or later. `key` is the value of the
    /// shared left-hand side of a secondary-indexed name; without it every
    /// rule of the name is a candidate.
    pub fn find_next_candidate(
        &self,
        name: &str,
        cursor: usize,
        key: Option<&str>,
    ) -> Option<Candidate> {
        let list: &[usize] = match (self.entries.get(name)?, key) {
            (IndexEntry::Secondary(ci), Some(k)) => ci.by_literal.get(k)?,
            (e, _) => e.rules(),
        };
        list.get(cursor).map(|rule| Candidate {
            rule: *rule,
            cursor: cursor + 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::{Dialect, Source};
    use crate::parser::{parse_rule_base, SymbolTable};

    use anyhow::Result;

    fn index_of(text: &str) -> Result<(Ast, RuleSet, RuleIndex)> {
        let source = Source::from_contents("<test>".into(), text.into())?;
        let mut ast = Ast::new();
        let mut symbols = SymbolTable::new();
        let mut rules = RuleSet::default();
        for r in parse_rule_base(&source, Dialect::Auto, &mut symbols, &mut ast)? {
            rules.push(r);
        }
        let index = RuleIndex::build(&ast, &rules);
        Ok((ast, rules, index))
    }

    #[test]
    fn literal_conditions_are_indexed() -> Result<()> {
        let (_, _, index) = index_of(
            r#"
            acPick(*A) { on (*A == "x") { writeLine("stdout", "x"); } }
            acPick(*A) { on (*A == "y") { writeLine("stdout", "y"); } }
            acPick(*A) { on (*A == "x") { writeLine("stdout", "x2"); } }
            "#,
        )?;
        let Some(IndexEntry::Secondary(ci)) = index.entry("acPick") else {
            panic!("expected a secondary index");
        };
        assert_eq!(ci.by_literal["x"], vec![0, 2]);
        let first = index.find_next_candidate("acPick", 0, Some("x"));
        assert_eq!(first, Some(Candidate { rule: 0, cursor: 1 }));
        assert_eq!(
            index.find_next_candidate("acPick", 1, Some("x")).map(|c| c.rule),
            Some(2)
        );
        assert!(index.find_next_candidate("acPick", 0, Some("z")).is_none());
        Ok(())
    }

    #[test]
    fn mixed_conditions_stay_primary() -> Result<()> {
        let (_, _, index) = index_of(
            r#"
            acPick(*A) { on (*A == "x") { nop; } }
            acPick(*A) { on (*A > 3) { nop; } }
            "#,
        )?;
        assert!(matches!(index.entry("acPick"), Some(IndexEntry::Primary(_))));
        assert_eq!(index.rules("acPick"), &[0, 1]);
        Ok(())
    }

    #[test]
    fn higher_tiers_come_first() -> Result<()> {
        let (ast, mut rules, _) = index_of(
            r#"
            acRun { writeLine("stdout", "core"); }
            acRun { writeLine("stdout", "app"); }
            "#,
        )?;
        rules.rules[0].tier = Tier::Core;
        rules.rules[1].tier = Tier::Extension;
        let index = RuleIndex::build(&ast, &rules);
        assert_eq!(index.rules("acRun"), &[1, 0]);
        Ok(())
    }
}
