// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::ast::{Node, NodeId};
use crate::builtins::utils::{ensure_args_count, ensure_string};
use crate::builtins::{add, BuiltinTable};
use crate::catalog::{QueryAlternative, QueryColumn, QueryCondition, QueryRequest};
use crate::error::RuleError;
use crate::interpreter::iterables::CollectionWalk;
use crate::interpreter::{EvalResult, Interpreter, Interrupt};
use crate::lexer::Span;
use crate::value::Value;
use crate::*;

use tracing::debug;

pub fn register(m: &mut BuiltinTable) {
    add(m, "query", "e ?->?", query);
    add(m, "path", "string->path", path);
    add(m, "collection", "f path->path", collection);
    add(
        m,
        "collectionSpider",
        "forall X in {string path}, e ? * X * a ? * a ? -> integer",
        collection_spider,
    );
    add(m, "remoteExec", "string * string * string * string->integer", remote_exec);
    add(m, "delayExec", "string * string * string->integer", delay_exec);
}

fn column(interp: &Interpreter<'_>, id: NodeId) -> Result<QueryColumn, Interrupt> {
    match &interp.ast()[id] {
        Node::Column { func, name, .. } => Ok(QueryColumn {
            func: func.clone(),
            name: name.clone(),
        }),
        _ => Err(RuleError::Runtime(interp.span(id).message("error", "expecting a column")).into()),
    }
}

/// Evaluate the operands of a `select` and hand it to the catalog.
fn build_request(interp: &mut Interpreter<'_>, id: NodeId) -> Result<QueryRequest, Interrupt> {
    let ast = interp.ast();
    let Node::Query { cols, conds, .. } = &ast[id] else {
        return Err(RuleError::Runtime(interp.span(id).message("error", "expecting a query")).into());
    };
    let mut request = QueryRequest::default();
    for c in cols {
        request.columns.push(column(interp, *c)?);
    }
    for c in conds {
        let Node::QueryCond {
            column: col,
            junction,
            alts,
            ..
        } = &ast[*c]
        else {
            continue;
        };
        let mut alternatives = Vec::with_capacity(alts.len());
        for alt in alts {
            let mut values = Vec::with_capacity(alt.values.len());
            for v in &alt.values {
                values.push(Rc::from(interp.eval(*v)?.to_string()));
            }
            alternatives.push(QueryAlternative {
                op: alt.op.clone(),
                values,
            });
        }
        request.conditions.push(QueryCondition {
            column: column(interp, *col)?.name,
            junction: junction.clone(),
            alternatives,
        });
    }
    Ok(request)
}

fn query(interp: &mut Interpreter<'_>, _: &Span, params: &[NodeId], args: &mut [Value]) -> EvalResult {
    ensure_args_count("query", args, 1)?;
    let request = build_request(interp, params[0])?;
    debug!(columns = request.columns.len(), conditions = request.conditions.len(), "catalog query");
    let rows = interp.catalog().query(&request)?;
    Ok(Value::Rows(Rc::new(rows)))
}

/// Path value, with repeated leading slashes collapsed.
fn path(_: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    ensure_args_count("path", args, 1)?;
    let text = ensure_string(span, "path", &args[0])?;
    let mut p: &str = &text;
    while p.starts_with("//") {
        p = &p[1..];
    }
    Ok(Value::Path(p.into()))
}

fn collection(_: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    ensure_args_count("collection", args, 1)?;
    let text = ensure_string(span, "collection", &args[0])?;
    Ok(Value::Path(text))
}

/// `collectionSpider(*obj, coll, actions, recovery)`: run the actions for
/// every data object below `coll`.
fn collection_spider(
    interp: &mut Interpreter<'_>,
    span: &Span,
    params: &[NodeId],
    args: &mut [Value],
) -> EvalResult {
    ensure_args_count("collectionSpider", args, 4)?;
    let root = ensure_string(span, "collectionSpider", &args[1])?;
    let mut walk = CollectionWalk::new(root);
    interp.iterate(params[0], &mut walk, params[2], params[3])?;
    Ok(Value::Int(0))
}

fn remote_exec(interp: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    ensure_args_count("remoteExec", args, 4)?;
    let host = ensure_string(span, "remoteExec", &args[0])?;
    let hint = ensure_string(span, "remoteExec", &args[1])?;
    let actions = ensure_string(span, "remoteExec", &args[2])?;
    let recovery = ensure_string(span, "remoteExec", &args[3])?;
    let status = interp.catalog().remote(&host, &hint, &actions, &recovery)?;
    Ok(Value::from(status))
}

fn delay_exec(interp: &mut Interpreter<'_>, span: &Span, _: &[NodeId], args: &mut [Value]) -> EvalResult {
    ensure_args_count("delayExec", args, 3)?;
    let hint = ensure_string(span, "delayExec", &args[0])?;
    let actions = ensure_string(span, "delayExec", &args[1])?;
    let recovery = ensure_string(span, "delayExec", &args[2])?;
    let status = interp.catalog().delay(&hint, &actions, &recovery)?;
    Ok(Value::from(status))
}
