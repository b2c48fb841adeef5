//! Policy registration and query transformation. The rewriter owns the
//! engine, the registered policies, and the aggregate accumulation state;
//! it is single-writer and never shared between threads.

use std::collections::BTreeSet;

use sqlparser::ast::{Expr, Query, SetExpr, Statement};

use crate::aggregate::{AggregateEvaluator, ViolationReport};
use crate::analyzer::{self, QueryShape};
use crate::ast;
use crate::catalog;
use crate::engine::{Engine, Rows};
use crate::error::{DfcError, Result};
use crate::parser;
use crate::policy::{AggregatePolicy, Policy, RequiredColumns, ResolutionKind, RowPolicy};
use crate::propagate;
use crate::repair::{unix_timestamp, ArtifactRecord, RepairOutcome, RepairRequest, Row, RowRepair, SideArtifact};
use crate::rewrite;

/// Projection alias prefix marking hidden per-policy repair flags. Flag
/// columns never reach the caller; [`Rewriter::execute`] strips them after
/// dispatching violating rows to the repair collaborator.
const LLM_FLAG_PREFIX: &str = "__dfc_llm_";

pub struct Rewriter<E: Engine> {
    engine: E,
    row_policies: Vec<RowPolicy>,
    aggregate_policies: Vec<AggregatePolicy>,
    evaluator: AggregateEvaluator,
    repair: Option<Box<dyn RowRepair>>,
    artifact: Option<SideArtifact>,
}

impl<E: Engine> Rewriter<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            row_policies: Vec::new(),
            aggregate_policies: Vec::new(),
            evaluator: AggregateEvaluator::default(),
            repair: None,
            artifact: None,
        }
    }

    pub fn with_repair(mut self, repair: Box<dyn RowRepair>, artifact: SideArtifact) -> Self {
        self.repair = Some(repair);
        self.artifact = Some(artifact);
        self
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn row_policies(&self) -> &[RowPolicy] {
        &self.row_policies
    }

    pub fn aggregate_policies(&self) -> &[AggregatePolicy] {
        &self.aggregate_policies
    }

    /// Validates the policy against the engine's catalog and registers it.
    /// Registering an identical policy twice is a no-op.
    pub fn register(&mut self, policy: impl Into<Policy>) -> Result<()> {
        let policy = policy.into();
        catalog::validate_policy(&policy, &self.engine)?;
        let id = policy.id();
        match policy {
            Policy::Row(row) => {
                if self.row_policies.contains(&row) {
                    log::debug!("policy {id} already registered");
                } else {
                    log::info!("registered {} row policy {id}", row.resolution());
                    self.row_policies.push(row);
                }
            }
            Policy::Aggregate(aggregate) => {
                if self.aggregate_policies.contains(&aggregate) {
                    log::debug!("policy {id} already registered");
                } else {
                    log::info!("registered aggregate policy {id}");
                    self.aggregate_policies.push(aggregate);
                }
            }
        }
        Ok(())
    }

    /// Parses a policy from the textual mini-language and registers it.
    pub fn register_str(&mut self, text: &str) -> Result<()> {
        self.register(parser::parse_policy(text)?)
    }

    /// Rewrites the statement so that every matching row policy is
    /// enforced. Non-query statements pass through unchanged.
    pub fn transform_query(&self, sql: &str) -> Result<String> {
        let mut statement = ast::parse_statement(sql)?;
        let Statement::Query(query) = &mut statement else {
            log::debug!("statement is not a query, passing through");
            return Ok(sql.to_string());
        };
        self.transform_parsed(query.as_mut())?;
        Ok(statement.to_string())
    }

    fn transform_parsed(&self, query: &mut Query) -> Result<()> {
        let tables = analyzer::collect_tables(query);
        let matched: Vec<&RowPolicy> = self
            .row_policies
            .iter()
            .filter(|policy| policy.tables().iter().any(|table| tables.visible(table)))
            .collect();
        for policy in &self.row_policies {
            for table in policy.tables() {
                if tables.deep.contains(&table) && !tables.visible(&table) {
                    return Err(DfcError::UnsupportedConstruct(format!(
                        "table '{table}' is nested more than one subquery level deep"
                    )));
                }
            }
        }
        if matched.is_empty() {
            return Ok(());
        }
        if !matches!(query.body.as_ref(), SetExpr::Select(_)) {
            return Err(DfcError::UnsupportedConstruct(
                "policies cannot be applied to set operation queries".into(),
            ));
        }

        let mut required = RequiredColumns::new();
        let mut policy_tables = BTreeSet::new();
        for policy in &matched {
            for (table, columns) in policy.required_columns() {
                required
                    .entry(table.clone())
                    .or_default()
                    .extend(columns.iter().cloned());
            }
            policy_tables.extend(policy.tables());
        }
        propagate::expose_required_columns(query, &required)?;
        let aliases = propagate::table_alias_map(query, &policy_tables);

        let select = ast::query_select_mut(query).ok_or_else(|| {
            DfcError::UnsupportedConstruct(
                "policies cannot be applied to set operation queries".into(),
            )
        })?;
        let shape = analyzer::classify(select);

        let mut filters = Vec::new();
        let mut invalidations = Vec::new();
        let mut repairs: Vec<(String, Expr)> = Vec::new();
        for policy in &matched {
            // A matched policy whose constraint needs a table the query
            // does not expose fails closed rather than emitting SQL that
            // names an absent table.
            let unresolved = policy
                .required_columns()
                .keys()
                .any(|table| !tables.visible(table));
            let mut constraint = if unresolved {
                log::debug!(
                    "policy {} matched but not all constraint tables are visible, failing closed",
                    policy.id()
                );
                ast::parse_expr("FALSE")?
            } else {
                policy.constraint_expr()?
            };
            if shape == QueryShape::Scanning {
                rewrite::degenerate_aggregates(&mut constraint)?;
            }
            rewrite::substitute_aliases(&mut constraint, &aliases)?;
            match policy.resolution() {
                ResolutionKind::Remove => filters.push(rewrite::paren(constraint)),
                ResolutionKind::Kill => {
                    let wrapped = rewrite::kill_wrap(&constraint, policy.description())?;
                    filters.push(rewrite::paren(wrapped));
                }
                ResolutionKind::Invalidate => invalidations.push(constraint),
                ResolutionKind::Llm => repairs.push((policy.id(), constraint)),
            }
        }

        if let Some(combined) = rewrite::balanced_and(filters) {
            match shape {
                QueryShape::Scanning => rewrite::inject_where(select, combined),
                QueryShape::Aggregating => rewrite::inject_having(select, combined),
            }
        }
        if let Some(combined) = rewrite::balanced_and(invalidations) {
            rewrite::append_valid_column(select, combined);
        }
        for (id, constraint) in repairs {
            rewrite::append_flag_column(select, constraint, &format!("{LLM_FLAG_PREFIX}{id}"));
        }
        Ok(())
    }

    /// Records per-query aggregate observations for every aggregate policy
    /// whose source the statement reads directly.
    fn accumulate(&mut self, sql: &str) -> Result<()> {
        if self.aggregate_policies.is_empty() {
            return Ok(());
        }
        let Ok(Statement::Query(query)) = ast::parse_statement(sql) else {
            return Ok(());
        };
        let tables = analyzer::collect_tables(&query);
        for policy in &self.aggregate_policies {
            let Some(source) = policy.source() else {
                continue;
            };
            if !tables.outer.contains(source) {
                continue;
            }
            let aliases =
                propagate::table_alias_map(&query, &BTreeSet::from([source.to_string()]));
            self.evaluator
                .accumulate(policy, &query, &aliases, &self.engine)?;
        }
        Ok(())
    }

    /// Accumulates, transforms, executes, and post-processes repair flags.
    pub fn execute(&mut self, sql: &str) -> Result<Rows> {
        self.accumulate(sql)?;
        let transformed = self.transform_query(sql)?;
        let rows = self.engine.execute(&transformed)?;
        self.postprocess_repairs(sql, rows)
    }

    /// Evaluates registered aggregate policies against the named sink.
    pub fn finalize_aggregate_policies(&self, sink_table: &str) -> Result<ViolationReport> {
        self.evaluator
            .finalize(sink_table, &self.aggregate_policies, &self.engine)
    }

    /// Dispatches rows whose repair flag is false to the repair
    /// collaborator and strips the flag columns. Results pass through
    /// unchanged either way; corrections land only in the side artifact.
    fn postprocess_repairs(&self, original: &str, rows: Rows) -> Result<Rows> {
        let flagged: Vec<(usize, String)> = rows
            .columns
            .iter()
            .enumerate()
            .filter_map(|(index, name)| {
                name.strip_prefix(LLM_FLAG_PREFIX)
                    .map(|id| (index, id.to_string()))
            })
            .collect();
        if flagged.is_empty() {
            return Ok(rows);
        }
        let flag_indices: Vec<usize> = flagged.iter().map(|(index, _)| *index).collect();
        for row in &rows.rows {
            for (index, policy_id) in &flagged {
                if row[*index].is_truthy() {
                    continue;
                }
                self.dispatch_repair(original, policy_id, &rows.columns, row, &flag_indices);
            }
        }
        let keep = |index: &usize| !flag_indices.contains(index);
        let columns = rows
            .columns
            .into_iter()
            .enumerate()
            .filter(|(index, _)| keep(index))
            .map(|(_, name)| name)
            .collect();
        let stripped = rows
            .rows
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .enumerate()
                    .filter(|(index, _)| keep(index))
                    .map(|(_, value)| value)
                    .collect()
            })
            .collect();
        Ok(Rows {
            columns,
            rows: stripped,
        })
    }

    fn dispatch_repair(
        &self,
        original: &str,
        policy_id: &str,
        columns: &[String],
        row: &[crate::engine::Value],
        flag_indices: &[usize],
    ) {
        let Some(repair) = &self.repair else {
            log::warn!("row violates policy {policy_id} but no repairer is configured");
            return;
        };
        let Some(policy) = self.row_policies.iter().find(|p| p.id() == policy_id) else {
            log::warn!("repair flag names unknown policy {policy_id}");
            return;
        };
        let visible: Row = columns
            .iter()
            .enumerate()
            .filter(|(index, _)| !flag_indices.contains(index))
            .map(|(index, name)| (name.clone(), row[index].clone()))
            .collect();
        let request = RepairRequest {
            constraint: policy.constraint().to_string(),
            description: policy.description().unwrap_or_default().to_string(),
            row: visible,
        };
        match repair.repair(&request) {
            Ok(RepairOutcome::Corrected(corrected)) => {
                if let Some(artifact) = &self.artifact {
                    let record = ArtifactRecord {
                        corrected_row: corrected,
                        originating_query: original.to_string(),
                        originating_policy_id: policy_id.to_string(),
                        timestamp: unix_timestamp(),
                    };
                    if let Err(err) = artifact.append(&record) {
                        log::warn!("failed to record correction for {policy_id}: {err}");
                    }
                }
            }
            Ok(RepairOutcome::Declined) => {
                log::warn!("repairer declined to correct a row violating {policy_id}");
            }
            Err(err) => {
                log::warn!("repair failed for policy {policy_id}: {err}");
            }
        }
    }
}
