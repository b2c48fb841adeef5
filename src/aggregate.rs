//! Two-phase evaluation of aggregate policies. Observed queries are left
//! untouched; each one contributes a row of per-query aggregate values
//! (accumulate), and at finalize time the accumulated series are folded
//! into literals, substituted into the constraint, and the result is
//! evaluated against the sink.

use std::collections::BTreeMap;

use sqlparser::ast::{Expr, Query};

use crate::ast;
use crate::engine::{Engine, Value};
use crate::error::Result;
use crate::policy::{AggregatePolicy, OuterFold};
use crate::propagate::AliasMap;
use crate::rewrite;

/// Policy id to the violation message, or `None` when the policy holds or
/// was not evaluated against this sink.
pub type ViolationReport = BTreeMap<String, Option<String>>;

/// Holds per-policy accumulation state. State survives finalize so later
/// queries keep extending the same series.
#[derive(Debug, Default)]
pub(crate) struct AggregateEvaluator {
    /// Policy id to one row of source-aggregate values per observed query.
    accumulated: BTreeMap<String, Vec<Vec<Value>>>,
}

impl AggregateEvaluator {
    /// Runs the side query computing the policy's per-query aggregates over
    /// the observed query's FROM and WHERE, and appends the resulting row.
    pub fn accumulate(
        &mut self,
        policy: &AggregatePolicy,
        query: &Query,
        aliases: &AliasMap,
        engine: &dyn Engine,
    ) -> Result<()> {
        if policy.source_aggregates().is_empty() {
            return Ok(());
        }
        let Some(select) = ast::query_select(query) else {
            return Ok(());
        };
        let mut projections = Vec::new();
        for aggregate in policy.source_aggregates() {
            let mut inner = ast::parse_expr(&aggregate.inner)?;
            rewrite::substitute_aliases(&mut inner, aliases)?;
            projections.push(inner.to_string());
        }
        let from = select
            .from
            .iter()
            .map(|t| t.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        // The observed FROM may name CTEs, so the WITH clause comes along.
        let mut sql = match &query.with {
            Some(with) => format!("{with} SELECT {} FROM {from}", projections.join(", ")),
            None => format!("SELECT {} FROM {from}", projections.join(", ")),
        };
        if let Some(selection) = &select.selection {
            sql.push_str(&format!(" WHERE {selection}"));
        }
        log::debug!("accumulating {} via: {sql}", policy.id());
        let rows = engine.execute(&sql)?;
        let row = rows
            .rows
            .into_iter()
            .next()
            .unwrap_or_else(|| vec![Value::Null; policy.source_aggregates().len()]);
        self.accumulated.entry(policy.id()).or_default().push(row);
        Ok(())
    }

    /// Evaluates every policy against the named sink table. Policies whose
    /// sink is a different table get a `None` entry without evaluation.
    pub fn finalize(
        &self,
        sink_table: &str,
        policies: &[AggregatePolicy],
        engine: &dyn Engine,
    ) -> Result<ViolationReport> {
        let sink_table = sink_table.to_lowercase();
        let mut report = ViolationReport::new();
        for policy in policies {
            let applicable = match policy.sink() {
                Some(sink) => sink == sink_table,
                None => true,
            };
            if !applicable {
                report.insert(policy.id(), None);
                continue;
            }
            let violation = if self.holds(policy, engine)? {
                None
            } else {
                Some(policy.violation_message())
            };
            report.insert(policy.id(), violation);
        }
        Ok(report)
    }

    fn holds(&self, policy: &AggregatePolicy, engine: &dyn Engine) -> Result<bool> {
        let mut constraint = policy.constraint_expr()?;
        let series = self.accumulated.get(&policy.id());
        for (index, aggregate) in policy.source_aggregates().iter().enumerate() {
            let values: Vec<Value> = series
                .iter()
                .flat_map(|rows| rows.iter())
                .map(|row| row[index].clone())
                .collect();
            let folded = fold_values(aggregate.fold, &values);
            substitute_node(&mut constraint, &aggregate.node, &folded)?;
        }
        let sql = match policy.sink() {
            Some(sink) => format!("SELECT {constraint} FROM {sink}"),
            None => format!("SELECT {constraint}"),
        };
        log::debug!("finalizing {} via: {sql}", policy.id());
        let rows = engine.execute(&sql)?;
        Ok(rows
            .rows
            .iter()
            .all(|row| row.first().is_some_and(Value::is_truthy)))
    }
}

/// Replaces every occurrence of `node` (by structural equality) in the
/// constraint with the folded literal.
fn substitute_node(constraint: &mut Expr, node: &str, literal: &str) -> Result<()> {
    let target = ast::parse_expr(node)?;
    let replacement = ast::parse_expr(literal)?;
    ast::rewrite_expr(constraint, &mut |candidate| {
        if *candidate == target && *candidate != replacement {
            Ok(Some(replacement.clone()))
        } else {
            Ok(None)
        }
    })
}

fn fold_values(fold: OuterFold, values: &[Value]) -> String {
    if fold == OuterFold::Count {
        let count = values.iter().filter(|v| !matches!(v, Value::Null)).count();
        return count.to_string();
    }
    let numbers: Vec<f64> = values.iter().filter_map(Value::as_f64).collect();
    if numbers.is_empty() {
        return "NULL".to_string();
    }
    let folded = match fold {
        OuterFold::Sum => numbers.iter().sum(),
        OuterFold::Max => numbers.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
        OuterFold::Min => numbers.iter().cloned().fold(f64::INFINITY, f64::min),
        OuterFold::Avg => numbers.iter().sum::<f64>() / numbers.len() as f64,
        OuterFold::Count => unreachable!(),
    };
    numeric_literal(folded)
}

fn numeric_literal(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SqliteEngine;
    use crate::policy::ResolutionKind;
    use sqlparser::ast::Statement;

    fn parse_query(sql: &str) -> Query {
        match ast::parse_statement(sql).unwrap() {
            Statement::Query(query) => *query,
            other => panic!("expected a query, got {other}"),
        }
    }

    fn engine() -> SqliteEngine {
        let engine = SqliteEngine::open_in_memory().unwrap();
        engine
            .execute("CREATE TABLE users (id INTEGER, amount INTEGER)")
            .unwrap();
        engine
            .execute("INSERT INTO users VALUES (1, 100), (2, 200), (3, 300)")
            .unwrap();
        engine
            .execute("CREATE TABLE reports (total INTEGER)")
            .unwrap();
        engine.execute("INSERT INTO reports VALUES (1000)").unwrap();
        engine
    }

    fn policy(constraint: &str) -> AggregatePolicy {
        AggregatePolicy::new(
            Some("users"),
            Some("reports"),
            constraint,
            ResolutionKind::Invalidate,
            None,
        )
        .unwrap()
    }

    #[test]
    fn folds_sum_max_min_avg() {
        let values = vec![Value::Integer(10), Value::Real(20.0), Value::Integer(30)];
        assert_eq!(fold_values(OuterFold::Sum, &values), "60");
        assert_eq!(fold_values(OuterFold::Max, &values), "30");
        assert_eq!(fold_values(OuterFold::Min, &values), "10");
        assert_eq!(fold_values(OuterFold::Avg, &values), "20");
    }

    #[test]
    fn count_fold_skips_nulls() {
        let values = vec![Value::Integer(10), Value::Null, Value::Integer(30)];
        assert_eq!(fold_values(OuterFold::Count, &values), "2");
    }

    #[test]
    fn empty_series_folds_to_null() {
        assert_eq!(fold_values(OuterFold::Sum, &[]), "NULL");
        assert_eq!(fold_values(OuterFold::Count, &[]), "0");
    }

    #[test]
    fn fractional_folds_keep_their_precision() {
        let values = vec![Value::Integer(1), Value::Integer(2)];
        assert_eq!(fold_values(OuterFold::Avg, &values), "1.5");
    }

    #[test]
    fn accumulate_respects_observed_where_clause() {
        let engine = engine();
        let policy = policy("sum(users.amount) <= sum(reports.total)");
        let mut evaluator = AggregateEvaluator::default();
        let query = parse_query("SELECT id FROM users WHERE users.amount > 150");
        evaluator
            .accumulate(&policy, &query, &AliasMap::new(), &engine)
            .unwrap();
        let rows = &evaluator.accumulated[&policy.id()];
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0], Value::Integer(500));
    }

    #[test]
    fn accumulate_carries_the_observed_with_clause() {
        let engine = engine();
        let policy = policy("sum(users.amount) <= sum(reports.total)");
        let mut evaluator = AggregateEvaluator::default();
        let query = parse_query(
            "WITH w AS (SELECT 150 AS cutoff) \
             SELECT id FROM users, w WHERE users.amount > w.cutoff",
        );
        evaluator
            .accumulate(&policy, &query, &AliasMap::new(), &engine)
            .unwrap();
        let rows = &evaluator.accumulated[&policy.id()];
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0], Value::Integer(500));
    }

    #[test]
    fn finalize_passes_within_budget_and_fails_beyond() {
        let engine = engine();
        let policy = policy("sum(users.amount) <= sum(reports.total)");
        let mut evaluator = AggregateEvaluator::default();
        let query = parse_query("SELECT id FROM users");
        evaluator
            .accumulate(&policy, &query, &AliasMap::new(), &engine)
            .unwrap();
        let report = evaluator.finalize("reports", &[policy.clone()], &engine).unwrap();
        assert_eq!(report[&policy.id()], None);

        // A second observation doubles the accumulated sum past the budget.
        evaluator
            .accumulate(&policy, &query, &AliasMap::new(), &engine)
            .unwrap();
        let report = evaluator.finalize("reports", &[policy.clone()], &engine).unwrap();
        assert_eq!(report[&policy.id()], Some(policy.violation_message()));
    }

    #[test]
    fn unrelated_sink_is_reported_unevaluated() {
        let engine = engine();
        let policy = policy("sum(users.amount) <= sum(reports.total)");
        let evaluator = AggregateEvaluator::default();
        let report = evaluator.finalize("other", &[policy.clone()], &engine).unwrap();
        assert_eq!(report[&policy.id()], None);
    }

    #[test]
    fn nested_fold_substitutes_the_whole_node() {
        let engine = engine();
        let policy = policy("max(sum(users.amount)) <= sum(reports.total)");
        let mut evaluator = AggregateEvaluator::default();
        evaluator.accumulate(
            &policy,
            &parse_query("SELECT id FROM users WHERE users.amount < 250"),
            &AliasMap::new(),
            &engine,
        )
        .unwrap();
        evaluator.accumulate(
            &policy,
            &parse_query("SELECT id FROM users"),
            &AliasMap::new(),
            &engine,
        )
        .unwrap();
        // max(300, 600) = 600 <= 1000 holds.
        let report = evaluator.finalize("reports", &[policy.clone()], &engine).unwrap();
        assert_eq!(report[&policy.id()], None);
    }
}
