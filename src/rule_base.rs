// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::ast::*;
use crate::config::EngineConfig;
use crate::error::RuleError;
use crate::index::RuleIndex;
use crate::lexer::Source;
use crate::parser::{Parser, SymbolTable};
use crate::typing::type_check;
use crate::*;

use std::path::PathBuf;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Parsed, type-checked and indexed rules of one set id.
///
/// The node arena is shared with every interpreter running against the
/// rule base; adding rules copies it on write.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompiledRuleBase {
    pub(crate) set_id: String,
    pub(crate) ast: Rc<Ast>,
    pub(crate) rules: RuleSet,
    pub(crate) symbols: SymbolTable,
    pub(crate) index: RuleIndex,
}

fn check_size(source: &Source, limit: usize) -> Result<()> {
    let size = source.contents().len();
    if size > limit {
        bail!(RuleError::BufferOverflow { size, limit });
    }
    Ok(())
}

impl CompiledRuleBase {
    /// Parse and check the files named by `set_id`, a comma-separated list
    /// of rule-base names. Their rules form the core tier.
    pub fn build(config: &EngineConfig, set_id: &str) -> Result<Self> {
        let mut base = CompiledRuleBase {
            set_id: set_id.to_string(),
            ..Self::default()
        };
        for name in set_id.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            let source = Source::from_file(config.rule_file(name))?;
            base.parse_source(&source, Tier::Core, config)?;
        }
        base.finish()?;
        info!(set_id, rules = base.rules.len(), "compiled rule base");
        Ok(base)
    }

    /// Compile a single rule text, as the core tier.
    pub fn from_source(source: &Source, config: &EngineConfig) -> Result<Self> {
        let mut base = CompiledRuleBase {
            set_id: source.file().clone(),
            ..Self::default()
        };
        base.parse_source(source, Tier::Core, config)?;
        base.finish()?;
        Ok(base)
    }

    fn parse_source(&mut self, source: &Source, tier: Tier, config: &EngineConfig) -> Result<()> {
        check_size(source, config.max_rule_text)?;
        let ast = Rc::make_mut(&mut self.ast);
        let mut parser = Parser::new(source, ast)?;
        parser.set_dialect(config.default_dialect)?;
        parser.set_tier(tier);
        parser.set_include_dir(config.rule_base_dir.clone());
        parser.set_max_text(config.max_rule_text);
        for desc in parser.parse_rule_base(&mut self.symbols)? {
            self.rules.push(desc);
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        type_check(Rc::make_mut(&mut self.ast), &mut self.rules, &self.symbols)?;
        self.index = RuleIndex::build(&self.ast, &self.rules);
        Ok(())
    }

    /// Append the rules of `text` in `tier`. On error the rule base is left
    /// unchanged.
    pub fn add_rules(&mut self, text: &str, tier: Tier, config: &EngineConfig) -> Result<usize> {
        let source = Source::from_contents(format!("<{tier:?} rules>"), text.to_string())?;
        let mut next = self.clone();
        let before = next.rules.len();
        next.parse_source(&source, tier, config)?;
        next.finish()?;
        let added = next.rules.len() - before;
        *self = next;
        Ok(added)
    }

    pub fn set_id(&self) -> &str {
        &self.set_id
    }

    /// Rule files the rule base was compiled from, included files among
    /// them, in the order they were first read.
    pub fn files(&self) -> Vec<PathBuf> {
        self.ast
            .sources()
            .iter()
            .filter(|s| !s.is_synthesized())
            .map(|s| PathBuf::from(s.file()))
            .collect()
    }

    pub fn ast(&self) -> &Rc<Ast> {
        &self.ast
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn index(&self) -> &RuleIndex {
        &self.index
    }

    pub fn rule_name(&self, idx: usize) -> Option<&Rc<str>> {
        match &self.ast[self.rules.rules.get(idx)?.node] {
            Node::Rule { name, .. } | Node::FuncRule { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Parameter names of rule `idx`.
    pub fn params(&self, idx: usize) -> Vec<Rc<str>> {
        let params = match self.rules.rules.get(idx).map(|d| &self.ast[d.node]) {
            Some(Node::Rule { params, .. } | Node::FuncRule { params, .. }) => params,
            _ => return vec![],
        };
        params
            .iter()
            .filter_map(|p| match &self.ast[*p] {
                Node::Param { name, .. } => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    /// Metadata triples `(attribute, value, unit)` of rule `idx`.
    pub fn metadata(&self, idx: usize) -> Vec<(Rc<str>, Rc<str>, Rc<str>)> {
        let metadata = match self.rules.rules.get(idx).map(|d| &self.ast[d.node]) {
            Some(Node::Rule { metadata, .. } | Node::FuncRule { metadata, .. }) => metadata,
            _ => return vec![],
        };
        metadata
            .iter()
            .filter_map(|m| match &self.ast[*m] {
                Node::Metadata {
                    attr, value, unit, ..
                } => Some((attr.clone(), value.clone(), unit.clone())),
                _ => None,
            })
            .collect()
    }

    /// Numeric id given by a legacy `|<int>` suffix or an `id` attribute.
    pub fn rule_id(&self, idx: usize) -> Option<i64> {
        match self.rules.rules.get(idx).map(|d| &self.ast[d.node]) {
            Some(Node::Rule { id, .. }) => *id,
            _ => None,
        }
    }

    /// `false` when the rule carries `@("logging", "false")`.
    pub fn logging_enabled(&self, idx: usize) -> bool {
        !self
            .metadata(idx)
            .iter()
            .any(|(attr, value, _)| attr.as_ref() == "logging" && value.as_ref() == "false")
    }

    /// Distinct names of the rules of `tier`, in definition order.
    pub fn names_in_tier(&self, tier: Tier) -> Vec<Rc<str>> {
        let mut names: Vec<Rc<str>> = vec![];
        for (idx, desc) in self.rules.iter().enumerate() {
            if desc.tier != tier {
                continue;
            }
            if let Some(name) = self.rule_name(idx) {
                if !names.contains(name) {
                    names.push(name.clone());
                }
            }
        }
        names
    }

    /// Render every rule and declaration back to block-dialect text.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for desc in self.rules.iter() {
            out.push_str(&render(&self.ast, desc.node));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RULES: &str = r#"
        acNotify(*who) { writeLine("stdout", "hello *who"); } @("logging", "false")
        acCount = 3
    "#;

    #[test]
    fn runtime_rules_go_to_their_tier() -> Result<()> {
        let config = EngineConfig::default();
        let source = Source::from_contents("core.re".into(), RULES.into())?;
        let mut base = CompiledRuleBase::from_source(&source, &config)?;
        let added = base.add_rules("acNotify(*who) { nop; }", Tier::Extension, &config)?;
        assert_eq!(added, 1);
        assert_eq!(base.names_in_tier(Tier::Core).len(), 2);
        assert_eq!(base.names_in_tier(Tier::Extension), vec![Rc::from("acNotify")]);
        assert_eq!(base.index().rules("acNotify"), &[2, 0]);
        assert!(!base.logging_enabled(0));
        assert!(base.logging_enabled(2));
        Ok(())
    }

    #[test]
    fn failed_additions_leave_the_base_unchanged() -> Result<()> {
        let config = EngineConfig::default();
        let source = Source::from_contents("core.re".into(), RULES.into())?;
        let mut base = CompiledRuleBase::from_source(&source, &config)?;
        assert!(base.add_rules("acBroken(*x) { writeLine(", Tier::Application, &config).is_err());
        assert!(base.add_rules("acCount = 4", Tier::Application, &config).is_err());
        assert_eq!(base.rules().len(), 2);
        Ok(())
    }

    #[test]
    fn oversized_text_is_rejected() -> Result<()> {
        let config = EngineConfig {
            max_rule_text: 8,
            ..EngineConfig::default()
        };
        let source = Source::from_contents("core.re".into(), RULES.into())?;
        let err = CompiledRuleBase::from_source(&source, &config).err();
        let code = err.map(|e| RuleError::from_anyhow(&e).code());
        assert_eq!(code, Some(crate::error::codes::RE_BUFFER_OVERFLOW));
        Ok(())
    }
}
