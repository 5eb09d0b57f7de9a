// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

pub mod arithmetic;
pub mod catalog;
pub mod control;
pub mod conversions;
pub mod io;
pub mod lists;
pub mod strings;
#[cfg(feature = "time")]
pub mod time;
pub mod utils;

use crate::ast::NodeId;
use crate::interpreter::{EvalResult, Interpreter};
use crate::lexer::Span;
use crate::value::Value;

use std::collections::HashMap;

use lazy_static::lazy_static;

/// A builtin receives the call span, the argument nodes and the argument
/// values. Values of parameters tagged `e`, `a` or `o` are `Value::Unit`;
/// the builtin evaluates those nodes itself. Values written into slots of
/// `o` and `d` parameters are assigned back to the argument variables.
pub type BuiltinFcn = fn(&mut Interpreter<'_>, &Span, &[NodeId], &mut [Value]) -> EvalResult;

pub struct Builtin {
    /// Type signature in the rule type language.
    pub signature: &'static str,
    pub func: BuiltinFcn,
}

pub type BuiltinTable = HashMap<&'static str, Builtin>;

pub(crate) fn add(m: &mut BuiltinTable, name: &'static str, signature: &'static str, func: BuiltinFcn) {
    m.insert(name, Builtin { signature, func });
}

#[rustfmt::skip]
lazy_static! {
    pub static ref BUILTINS: BuiltinTable = {
	let mut m : BuiltinTable = HashMap::new();

	control::register(&mut m);
	arithmetic::register(&mut m);
	strings::register(&mut m);
	conversions::register(&mut m);
	lists::register(&mut m);
	io::register(&mut m);
	catalog::register(&mut m);
	#[cfg(feature = "time")]
	time::register(&mut m);

	m
    };
}
