// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use core::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Numeric status codes reported to policy-hook callers.
pub mod codes {
    pub const NO_RULE_FOUND: i32 = -1017000;
    pub const ACTION_ARG_COUNT_MISMATCH: i32 = -1021000;
    pub const RETRY_WITHOUT_RECOVERY: i32 = -1088000;
    pub const CUT_ACTION_PROCESSED: i32 = -1089000;
    pub const ACTION_FAILED: i32 = -1090000;
    pub const RULE_FAILED: i32 = -1101000;
    pub const BREAK_ACTION_ENCOUNTERED: i32 = -1108000;
    pub const RE_PARSER_ERROR: i32 = -1201000;
    pub const RE_UNPARSED_SUFFIX: i32 = -1202000;
    pub const RE_RUNTIME_ERROR: i32 = -1205000;
    pub const RE_DIVISION_BY_ZERO: i32 = -1206000;
    pub const RE_BUFFER_OVERFLOW: i32 = -1207000;
    pub const RE_UNSUPPORTED_OP_OR_TYPE: i32 = -1208000;
    pub const RE_UNABLE_TO_READ_LOCAL_VAR: i32 = -1211000;
    pub const RE_UNABLE_TO_READ_SESSION_VAR: i32 = -1213000;
    pub const RE_PATTERN_NOT_MATCHED: i32 = -1216000;
    pub const RE_OUT_OF_MEMORY: i32 = -1221000;
    pub const RE_SHM_ERROR: i32 = -1222000;
    pub const RE_FILE_STAT_ERROR: i32 = -1223000;
    pub const RE_TYPE_ERROR: i32 = -1230000;
    pub const RE_FUNCTION_REDEFINITION: i32 = -1231000;
    pub const RE_DYNAMIC_TYPE_ERROR: i32 = -1232000;
    pub const RE_DYNAMIC_COERCION_ERROR: i32 = -1233000;
}

/// Errors raised while loading, checking or evaluating rules.
///
/// Messages produced by the lexer, parser and type checker already carry a
/// rendered source snippet; runtime errors carry a plain message.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuleError {
    #[error("{0}")]
    Parse(String),
    #[error("{0}")]
    UnparsedSuffix(String),
    #[error("{0}")]
    Type(String),
    #[error("{0}")]
    Redefinition(String),
    #[error("{0}")]
    DynamicType(String),
    #[error("{0}")]
    DynamicCoercion(String),

    #[error("division by zero")]
    DivisionByZero,
    #[error("rule text of {size} bytes exceeds the limit of {limit} bytes")]
    BufferOverflow { size: usize, limit: usize },
    #[error("{0}")]
    UnsupportedOp(String),
    #[error("unable to read local variable `{0}`")]
    UnboundLocal(String),
    #[error("unable to read session variable `{0}`")]
    UnboundSession(String),
    #[error("pattern not matched: {0}")]
    PatternNotMatched(String),
    #[error("evaluation region exceeded its limit of {limit} bytes")]
    OutOfMemory { limit: usize },
    #[error("{0}")]
    Runtime(String),

    #[error("no rule found for `{0}`")]
    NoRuleFound(String),
    #[error("rule `{0}` failed")]
    RuleFailed(String),
    #[error("`{name}` expects {expected} arguments, got {actual}")]
    ArgCountMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },
    #[error("action failed with status {code}: {msg}")]
    ActionFailed { code: i32, msg: String },
    #[error("cut action processed")]
    Cut,
    #[error("retry without recovery")]
    RetryWithoutRecovery,

    #[error("{0}")]
    FileStat(String),
    #[error("shared segment unavailable: {0}")]
    SegmentUnavailable(String),
}

impl RuleError {
    pub fn code(&self) -> i32 {
        use codes::*;
        match self {
            Self::Parse(_) => RE_PARSER_ERROR,
            Self::UnparsedSuffix(_) => RE_UNPARSED_SUFFIX,
            Self::Type(_) => RE_TYPE_ERROR,
            Self::Redefinition(_) => RE_FUNCTION_REDEFINITION,
            Self::DynamicType(_) => RE_DYNAMIC_TYPE_ERROR,
            Self::DynamicCoercion(_) => RE_DYNAMIC_COERCION_ERROR,
            Self::DivisionByZero => RE_DIVISION_BY_ZERO,
            Self::BufferOverflow { .. } => RE_BUFFER_OVERFLOW,
            Self::UnsupportedOp(_) => RE_UNSUPPORTED_OP_OR_TYPE,
            Self::UnboundLocal(_) => RE_UNABLE_TO_READ_LOCAL_VAR,
            Self::UnboundSession(_) => RE_UNABLE_TO_READ_SESSION_VAR,
            Self::PatternNotMatched(_) => RE_PATTERN_NOT_MATCHED,
            Self::OutOfMemory { .. } => RE_OUT_OF_MEMORY,
            Self::Runtime(_) => RE_RUNTIME_ERROR,
            Self::NoRuleFound(_) => NO_RULE_FOUND,
            Self::RuleFailed(_) => RULE_FAILED,
            Self::ArgCountMismatch { .. } => ACTION_ARG_COUNT_MISMATCH,
            Self::ActionFailed { code, .. } => *code,
            Self::Cut => CUT_ACTION_PROCESSED,
            Self::RetryWithoutRecovery => RETRY_WITHOUT_RECOVERY,
            Self::FileStat(_) => RE_FILE_STAT_ERROR,
            Self::SegmentUnavailable(_) => RE_SHM_ERROR,
        }
    }

    /// Recover a coded error from an `anyhow` chain. Errors that did not
    /// originate as a `RuleError` are reported as runtime errors.
    pub fn from_anyhow(e: &anyhow::Error) -> RuleError {
        match e.downcast_ref::<RuleError>() {
            Some(r) => r.clone(),
            None => RuleError::Runtime(e.to_string()),
        }
    }
}

/// One entry of an error-message chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub code: i32,
    pub message: String,
}

/// Ordered chain of error messages accumulated during one hook invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorChain {
    entries: Vec<ErrorEntry>,
}

impl ErrorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, code: i32, message: impl Into<String>) {
        self.entries.push(ErrorEntry {
            code,
            message: message.into(),
        });
    }

    pub fn entries(&self) -> &[ErrorEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn last_code(&self) -> Option<i32> {
        self.entries.last().map(|e| e.code)
    }
}

impl fmt::Display for ErrorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, e) in self.entries.iter().enumerate() {
            if idx > 0 {
                writeln!(f)?;
            }
            write!(f, "Level {idx}: {} (status {})", e.message, e.code)?;
        }
        Ok(())
    }
}
