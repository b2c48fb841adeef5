//! Thin adapter over the `sqlparser` tree: parsing entry points, canonical
//! lowercase name extraction, and the expression visitors the rewriting
//! passes are built on.

use once_cell::sync::Lazy;
use sqlparser::ast::{
    Expr, Function, FunctionArg, FunctionArgExpr, FunctionArguments, Ident, ObjectName,
    ObjectNamePart, Query, Select, SetExpr, Statement,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::{Parser, ParserError};
use sqlparser::tokenizer::Token;

use std::collections::BTreeSet;

use crate::error::{DfcError, Result};

static DIALECT: GenericDialect = GenericDialect {};

/// Function names treated as aggregates during shape classification,
/// policy validation, and degeneration.
static AGGREGATE_FUNCTIONS: Lazy<BTreeSet<&'static str>> = Lazy::new(|| {
    BTreeSet::from([
        "count",
        "count_if",
        "sum",
        "avg",
        "min",
        "max",
        "array_agg",
        "string_agg",
        "group_concat",
        "total",
    ])
});

pub(crate) fn is_aggregate_function(name: &str) -> bool {
    AGGREGATE_FUNCTIONS.contains(name)
}

pub(crate) fn parse_statement(sql: &str) -> Result<Statement> {
    let mut statements = Parser::new(&DIALECT).try_with_sql(sql)?.parse_statements()?;
    match statements.len() {
        1 => Ok(statements.remove(0)),
        n => Err(DfcError::Parse(ParserError::ParserError(format!(
            "expected a single statement, found {n}"
        )))),
    }
}

/// Parses a standalone expression, requiring that the whole input is
/// consumed. Every rewriting pass parses a fresh copy through here; parsed
/// trees are single-use values and are never shared between passes.
pub(crate) fn parse_expr(text: &str) -> Result<Expr> {
    let mut parser = Parser::new(&DIALECT).try_with_sql(text)?;
    let expr = parser.parse_expr()?;
    if parser.peek_token().token != Token::EOF {
        return Err(DfcError::Parse(ParserError::ParserError(format!(
            "trailing input after expression: {text}"
        ))));
    }
    Ok(expr)
}

fn part_text(part: &ObjectNamePart) -> String {
    match part {
        ObjectNamePart::Identifier(ident) => ident.value.clone(),
        other => other.to_string(),
    }
}

/// Canonical lowercase form of a possibly-qualified object name.
pub(crate) fn object_name_text(name: &ObjectName) -> String {
    name.0
        .iter()
        .map(part_text)
        .collect::<Vec<_>>()
        .join(".")
        .to_lowercase()
}

pub(crate) fn function_name(func: &Function) -> String {
    func.name
        .0
        .last()
        .map(part_text)
        .unwrap_or_default()
        .to_lowercase()
}

/// Splits a column reference into `(qualifier, column)`, both lowercased.
/// Returns `None` for anything that is not a column reference.
pub(crate) fn column_parts(expr: &Expr) -> Option<(Option<String>, String)> {
    match expr {
        Expr::Identifier(ident) => Some((None, ident.value.to_lowercase())),
        Expr::CompoundIdentifier(parts) if parts.len() >= 2 => {
            let column = parts[parts.len() - 1].value.to_lowercase();
            let qualifier = parts[parts.len() - 2].value.to_lowercase();
            Some((Some(qualifier), column))
        }
        _ => None,
    }
}

pub(crate) fn column_ref(table: &str, column: &str) -> Expr {
    Expr::CompoundIdentifier(vec![Ident::new(table), Ident::new(column)])
}

/// Plain expression arguments of a function call, in order.
pub(crate) fn function_args(func: &Function) -> Vec<&Expr> {
    let mut args = Vec::new();
    if let FunctionArguments::List(list) = &func.args {
        for arg in &list.args {
            if let FunctionArg::Unnamed(FunctionArgExpr::Expr(expr)) = arg {
                args.push(expr);
            }
        }
    }
    args
}

/// Immediate sub-expressions of the supported node kinds.
pub(crate) fn child_exprs(expr: &Expr) -> Vec<&Expr> {
    let mut children = Vec::new();
    match expr {
        Expr::BinaryOp { left, right, .. } => {
            children.push(left.as_ref());
            children.push(right.as_ref());
        }
        Expr::UnaryOp { expr: inner, .. }
        | Expr::Nested(inner)
        | Expr::IsNull(inner)
        | Expr::IsNotNull(inner)
        | Expr::IsTrue(inner)
        | Expr::IsNotTrue(inner)
        | Expr::IsFalse(inner)
        | Expr::IsNotFalse(inner) => children.push(inner.as_ref()),
        Expr::Cast { expr: inner, .. } => children.push(inner.as_ref()),
        Expr::InList { expr: inner, list, .. } => {
            children.push(inner.as_ref());
            children.extend(list.iter());
        }
        Expr::Between {
            expr: inner,
            low,
            high,
            ..
        } => {
            children.push(inner.as_ref());
            children.push(low.as_ref());
            children.push(high.as_ref());
        }
        Expr::Like {
            expr: inner,
            pattern,
            ..
        }
        | Expr::ILike {
            expr: inner,
            pattern,
            ..
        } => {
            children.push(inner.as_ref());
            children.push(pattern.as_ref());
        }
        Expr::Function(func) => children.extend(function_args(func)),
        Expr::Case {
            operand,
            conditions,
            else_result,
            ..
        } => {
            if let Some(operand) = operand {
                children.push(operand.as_ref());
            }
            for when in conditions {
                children.push(&when.condition);
                children.push(&when.result);
            }
            if let Some(else_result) = else_result {
                children.push(else_result.as_ref());
            }
        }
        Expr::Array(array) => children.extend(array.elem.iter()),
        Expr::Tuple(items) => children.extend(items.iter()),
        _ => {}
    }
    children
}

/// Pre-order traversal over an expression tree.
pub(crate) fn visit_exprs(expr: &Expr, visit: &mut dyn FnMut(&Expr)) {
    visit(expr);
    for child in child_exprs(expr) {
        visit_exprs(child, visit);
    }
}

/// Whether any column reference in the subtree is qualified with `table`.
pub(crate) fn references_table(expr: &Expr, table: &str) -> bool {
    let mut found = false;
    visit_exprs(expr, &mut |node| {
        if let Some((Some(qualifier), _)) = column_parts(node) {
            if qualifier == table {
                found = true;
            }
        }
    });
    found
}

/// Pre-order rewriting transform. `apply` is re-applied to its own
/// replacement until it declines, then the children are rewritten in place.
/// Callbacks must eventually decline for termination.
pub(crate) fn rewrite_expr(
    expr: &mut Expr,
    apply: &mut dyn FnMut(&Expr) -> Result<Option<Expr>>,
) -> Result<()> {
    while let Some(replacement) = apply(expr)? {
        *expr = replacement;
    }
    match expr {
        Expr::BinaryOp { left, right, .. } => {
            rewrite_expr(left, apply)?;
            rewrite_expr(right, apply)?;
        }
        Expr::UnaryOp { expr: inner, .. }
        | Expr::Nested(inner)
        | Expr::IsNull(inner)
        | Expr::IsNotNull(inner)
        | Expr::IsTrue(inner)
        | Expr::IsNotTrue(inner)
        | Expr::IsFalse(inner)
        | Expr::IsNotFalse(inner) => rewrite_expr(inner, apply)?,
        Expr::Cast { expr: inner, .. } => rewrite_expr(inner, apply)?,
        Expr::InList { expr: inner, list, .. } => {
            rewrite_expr(inner, apply)?;
            for item in list {
                rewrite_expr(item, apply)?;
            }
        }
        Expr::Between {
            expr: inner,
            low,
            high,
            ..
        } => {
            rewrite_expr(inner, apply)?;
            rewrite_expr(low, apply)?;
            rewrite_expr(high, apply)?;
        }
        Expr::Like {
            expr: inner,
            pattern,
            ..
        }
        | Expr::ILike {
            expr: inner,
            pattern,
            ..
        } => {
            rewrite_expr(inner, apply)?;
            rewrite_expr(pattern, apply)?;
        }
        Expr::Function(func) => {
            if let FunctionArguments::List(list) = &mut func.args {
                for arg in &mut list.args {
                    if let FunctionArg::Unnamed(FunctionArgExpr::Expr(inner)) = arg {
                        rewrite_expr(inner, apply)?;
                    }
                }
            }
        }
        Expr::Case {
            operand,
            conditions,
            else_result,
            ..
        } => {
            if let Some(operand) = operand {
                rewrite_expr(operand, apply)?;
            }
            for when in conditions {
                rewrite_expr(&mut when.condition, apply)?;
                rewrite_expr(&mut when.result, apply)?;
            }
            if let Some(else_result) = else_result {
                rewrite_expr(else_result, apply)?;
            }
        }
        Expr::Array(array) => {
            for item in &mut array.elem {
                rewrite_expr(item, apply)?;
            }
        }
        Expr::Tuple(items) => {
            for item in items {
                rewrite_expr(item, apply)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Rejects expression node kinds outside the enumerated set the rewriting
/// passes handle. Applied once at policy construction so the passes never
/// meet a node they cannot transform.
pub(crate) fn check_constraint_expr(expr: &Expr) -> Result<()> {
    match expr {
        Expr::Identifier(_) | Expr::CompoundIdentifier(_) | Expr::Value(_) => Ok(()),
        Expr::Function(func) => match &func.args {
            FunctionArguments::None => Ok(()),
            FunctionArguments::Subquery(_) => Err(DfcError::PolicySyntax(
                "subqueries are not allowed in policy constraints".into(),
            )),
            FunctionArguments::List(list) => {
                for arg in &list.args {
                    match arg {
                        FunctionArg::Unnamed(FunctionArgExpr::Expr(inner)) => {
                            check_constraint_expr(inner)?;
                        }
                        FunctionArg::Unnamed(FunctionArgExpr::Wildcard) => {}
                        other => {
                            return Err(DfcError::PolicySyntax(format!(
                                "unsupported function argument in constraint: {other}"
                            )));
                        }
                    }
                }
                Ok(())
            }
        },
        Expr::BinaryOp { .. }
        | Expr::UnaryOp { .. }
        | Expr::Nested(_)
        | Expr::IsNull(_)
        | Expr::IsNotNull(_)
        | Expr::IsTrue(_)
        | Expr::IsNotTrue(_)
        | Expr::IsFalse(_)
        | Expr::IsNotFalse(_)
        | Expr::Cast { .. }
        | Expr::InList { .. }
        | Expr::Between { .. }
        | Expr::Like { .. }
        | Expr::ILike { .. }
        | Expr::Case { .. }
        | Expr::Array(_)
        | Expr::Tuple(_) => {
            for child in child_exprs(expr) {
                check_constraint_expr(child)?;
            }
            Ok(())
        }
        other => Err(DfcError::PolicySyntax(format!(
            "unsupported expression in constraint: {other}"
        ))),
    }
}

pub(crate) fn query_select(query: &Query) -> Option<&Select> {
    match query.body.as_ref() {
        SetExpr::Select(select) => Some(select),
        _ => None,
    }
}

pub(crate) fn query_select_mut(query: &mut Query) -> Option<&mut Select> {
    match query.body.as_mut() {
        SetExpr::Select(select) => Some(select),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_expr_rejects_trailing_input() {
        assert!(parse_expr("a > 1").is_ok());
        assert!(parse_expr("a > 1 b c").is_err());
    }

    #[test]
    fn parse_statement_rejects_multiple_statements() {
        assert!(parse_statement("SELECT 1; SELECT 2").is_err());
    }

    #[test]
    fn column_parts_normalizes_case() {
        let expr = parse_expr("Foo.Bar").unwrap();
        assert_eq!(
            column_parts(&expr),
            Some((Some("foo".into()), "bar".into()))
        );
        let expr = parse_expr("Bar").unwrap();
        assert_eq!(column_parts(&expr), Some((None, "bar".into())));
    }

    #[test]
    fn references_table_sees_through_functions() {
        let expr = parse_expr("max(foo.id) > bar.x").unwrap();
        assert!(references_table(&expr, "foo"));
        assert!(references_table(&expr, "bar"));
        assert!(!references_table(&expr, "baz"));
    }

    #[test]
    fn rewrite_expr_reapplies_to_replacements() {
        // max(sum(x)) collapses to x when the callback strips one
        // aggregate layer per application.
        let mut expr = parse_expr("max(sum(foo.x)) > 1").unwrap();
        rewrite_expr(&mut expr, &mut |node| {
            if let Expr::Function(func) = node {
                if is_aggregate_function(&function_name(func)) {
                    return Ok(Some(function_args(func)[0].clone()));
                }
            }
            Ok(None)
        })
        .unwrap();
        assert_eq!(expr.to_string(), "foo.x > 1");
    }

    #[test]
    fn check_constraint_rejects_subqueries() {
        let expr = parse_expr("a > (SELECT max(x) FROM t)").unwrap();
        assert!(check_constraint_expr(&expr).is_err());
    }

    #[test]
    fn check_constraint_accepts_boolean_shapes() {
        for text in [
            "max(foo.id) >= 1",
            "count_if(foo.id > 2) > 0 AND foo.name = 'x'",
            "foo.id BETWEEN 1 AND 10",
            "CASE WHEN foo.id > 1 THEN TRUE ELSE FALSE END",
            "foo.id IN (1, 2, 3)",
        ] {
            let expr = parse_expr(text).unwrap();
            check_constraint_expr(&expr).unwrap();
        }
    }
}
