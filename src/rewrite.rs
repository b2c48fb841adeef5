//! Constraint rewriting: aggregate-to-column degeneration for scans, alias
//! substitution, KILL wrapping, balanced AND combination, and clause
//! injection. Every entry point operates on a fresh parse of the policy
//! constraint; trees are never reused across passes.

use sqlparser::ast::{Array, BinaryOperator, Expr, Function, Ident, Select, SelectItem};

use crate::ast;
use crate::error::{DfcError, Result};
use crate::propagate::AliasMap;

/// Rewrites aggregate calls into row-evaluable scalars so the constraint
/// can live in a WHERE clause:
///
/// - `count(...)` becomes the literal `1`
/// - `count_if(p)` becomes `CASE WHEN p THEN 1 ELSE 0 END`
/// - `array_agg(e)` becomes the one-element array `[e]`
/// - `max/min/sum/avg(e)` become `e`, the whole argument expression
///
/// Policy construction guarantees every aggregate closes over source
/// columns only, so degeneration applies to all of them. Any other
/// aggregate is refused.
pub(crate) fn degenerate_aggregates(expr: &mut Expr) -> Result<()> {
    ast::rewrite_expr(expr, &mut |node| {
        let Expr::Function(func) = node else {
            return Ok(None);
        };
        let name = ast::function_name(func);
        if !ast::is_aggregate_function(&name) {
            return Ok(None);
        }
        let replacement = match name.as_str() {
            "count" => ast::parse_expr("1")?,
            "count_if" => {
                let predicate = sole_argument(func, &name)?;
                ast::parse_expr(&format!("CASE WHEN {predicate} THEN 1 ELSE 0 END"))?
            }
            "array_agg" => Expr::Array(Array {
                elem: vec![sole_argument(func, &name)?],
                named: false,
            }),
            "max" | "min" | "sum" | "avg" => sole_argument(func, &name)?,
            other => {
                return Err(DfcError::UnsupportedConstruct(format!(
                    "aggregate function '{other}' cannot be evaluated per row"
                )));
            }
        };
        Ok(Some(replacement))
    })
}

fn sole_argument(func: &Function, name: &str) -> Result<Expr> {
    ast::function_args(func)
        .first()
        .map(|expr| (*expr).clone())
        .ok_or_else(|| {
            DfcError::UnsupportedConstruct(format!(
                "aggregate '{name}' requires an expression argument"
            ))
        })
}

/// Redirects every qualified column reference through the alias map, so the
/// constraint addresses columns by the identifier they are visible under in
/// the rewritten query.
pub(crate) fn substitute_aliases(expr: &mut Expr, aliases: &AliasMap) -> Result<()> {
    ast::rewrite_expr(expr, &mut |node| {
        let Expr::CompoundIdentifier(parts) = node else {
            return Ok(None);
        };
        if parts.len() < 2 {
            return Ok(None);
        }
        let table = parts[parts.len() - 2].value.to_lowercase();
        let Some(alias) = aliases.get(&table) else {
            return Ok(None);
        };
        if parts[parts.len() - 2].value == *alias {
            return Ok(None);
        }
        let column = parts[parts.len() - 1].clone();
        Ok(Some(Expr::CompoundIdentifier(vec![
            Ident::new(alias.clone()),
            column,
        ])))
    })
}

/// Wraps a KILL constraint so that a violating row evaluates the abort
/// signal instead of filtering: the abort carries the policy description
/// and surfaces as a fatal execution error. Applied per policy, before
/// combination, so each policy keeps its own message.
pub(crate) fn kill_wrap(constraint: &Expr, description: Option<&str>) -> Result<Expr> {
    let message = description
        .unwrap_or("data flow control policy violated")
        .replace('\'', "''");
    ast::parse_expr(&format!(
        "CASE WHEN {constraint} THEN TRUE ELSE dfc_abort('{message}') END"
    ))
}

pub(crate) fn paren(expr: Expr) -> Expr {
    match expr {
        nested @ Expr::Nested(_) => nested,
        other => Expr::Nested(Box::new(other)),
    }
}

/// Combines predicates pairwise into an AND tree of depth ~log2(n) rather
/// than a left-leaning chain of depth n.
pub(crate) fn balanced_and(mut predicates: Vec<Expr>) -> Option<Expr> {
    match predicates.len() {
        0 => None,
        1 => Some(predicates.remove(0)),
        n => {
            let right = predicates.split_off(n / 2);
            let left = balanced_and(predicates)?;
            let right = balanced_and(right)?;
            Some(Expr::BinaryOp {
                left: Box::new(paren(left)),
                op: BinaryOperator::And,
                right: Box::new(paren(right)),
            })
        }
    }
}

fn and_combine(existing: Option<Expr>, predicate: Expr) -> Expr {
    match existing {
        Some(current) => Expr::BinaryOp {
            left: Box::new(paren(current)),
            op: BinaryOperator::And,
            right: Box::new(paren(predicate)),
        },
        None => predicate,
    }
}

pub(crate) fn inject_where(select: &mut Select, predicate: Expr) {
    select.selection = Some(and_combine(select.selection.take(), predicate));
}

pub(crate) fn inject_having(select: &mut Select, predicate: Expr) {
    select.having = Some(and_combine(select.having.take(), predicate));
}

/// Appends the INVALIDATE truth column; all rows are returned and carry
/// their per-row/group constraint verdict.
pub(crate) fn append_valid_column(select: &mut Select, predicate: Expr) {
    append_flag_column(select, predicate, "valid");
}

pub(crate) fn append_flag_column(select: &mut Select, predicate: Expr, name: &str) {
    select.projection.push(SelectItem::ExprWithAlias {
        expr: paren(predicate),
        alias: Ident::new(name),
    });
}
