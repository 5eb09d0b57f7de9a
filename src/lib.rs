// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

// Use README.md as crate documentation.
#![doc = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/README.md"))]

mod ast;
mod builtins;
mod cache;
mod catalog;
mod config;
mod engine;
mod env;
mod error;
mod index;
mod interpreter;
mod lexer;
mod parser;
mod region;
mod rule_base;
mod types;
mod typing;
mod value;

pub(crate) use std::rc::Rc;

pub use ast::Tier;
pub use cache::{
    BuildCount, BuildCounter, FileSegment, Fingerprint, MemorySegment, NoCount, RuleCache, SegmentHeader,
    SharedSegment,
};
pub use catalog::{
    Catalog, CollectionEntry, HostFcn, MemoryCatalog, QueryAlternative, QueryColumn, QueryCondition, QueryRequest,
    Scheduled,
};
pub use config::EngineConfig;
pub use engine::{Binding, EngineContext, Evaluation, HookOutcome};
pub use error::{codes, ErrorChain, ErrorEntry, RuleError};
pub use lexer::Dialect;
pub use rule_base::CompiledRuleBase;
pub use value::{Rows, Value};

/// Items in `unstable` are likely to change.
pub mod unstable {
    pub use crate::ast::*;
    pub use crate::lexer::*;
    pub use crate::parser::*;
    pub use crate::region::*;
    pub use crate::types::*;
    pub use crate::typing::*;
}

#[cfg(test)]
mod tests;
