//! Policy model: row and aggregate data flow control policies, their
//! resolution kinds, and construction-time (syntax-only) validation.
//! Catalog checks happen later, at registration, in [`crate::catalog`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};

use sqlparser::ast::Expr;

use crate::ast;
use crate::error::{DfcError, Result};

/// Columns a constraint references, grouped by the table that owns them.
/// Precomputed once at construction; drives both catalog validation and
/// subquery/CTE column propagation.
pub type RequiredColumns = BTreeMap<String, BTreeSet<String>>;

/// Action taken when a policy constraint is violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolutionKind {
    /// Filter violating rows/groups out of the result.
    Remove,
    /// Abort the whole query with a fatal error.
    Kill,
    /// Keep all rows and append a boolean `valid` column.
    Invalidate,
    /// Keep all rows; send violating ones to the repair collaborator.
    Llm,
}

impl ResolutionKind {
    pub fn parse(word: &str) -> Result<Self> {
        match word.to_ascii_uppercase().as_str() {
            "REMOVE" => Ok(Self::Remove),
            "KILL" => Ok(Self::Kill),
            "INVALIDATE" => Ok(Self::Invalidate),
            "LLM" => Ok(Self::Llm),
            other => Err(DfcError::PolicySyntax(format!(
                "unknown resolution kind '{other}'"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Remove => "REMOVE",
            Self::Kill => "KILL",
            Self::Invalidate => "INVALIDATE",
            Self::Llm => "LLM",
        }
    }
}

impl fmt::Display for ResolutionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fold applied across per-query accumulated values at finalize time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OuterFold {
    Sum,
    Max,
    Min,
    Avg,
    Count,
}

/// One aggregate call over source columns inside an aggregate policy
/// constraint. `inner` is evaluated once per observed query; `fold`
/// combines the accumulated values when the constraint is finalized and
/// substituted back in place of `node`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceAggregate {
    /// The aggregate node exactly as it appears in the canonical constraint.
    pub node: String,
    /// The innermost per-query aggregate.
    pub inner: String,
    pub fold: OuterFold,
}

/// A per-query policy. Immutable after construction; consumers obtain a
/// fresh parse of the constraint via [`RowPolicy::constraint_expr`] and
/// never share a parsed tree between rewriting passes.
#[derive(Debug, Clone, PartialEq)]
pub struct RowPolicy {
    source: Option<String>,
    sink: Option<String>,
    constraint: String,
    resolution: ResolutionKind,
    description: Option<String>,
    required_columns: RequiredColumns,
}

impl RowPolicy {
    pub fn new(
        source: Option<&str>,
        sink: Option<&str>,
        constraint: &str,
        resolution: ResolutionKind,
        description: Option<&str>,
    ) -> Result<Self> {
        let source = normalize_table(source);
        let sink = normalize_table(sink);
        let parsed = validate_constraint(constraint, source.as_deref(), sink.as_deref())?;
        let required_columns =
            collect_required_columns(&parsed, source.as_deref(), sink.as_deref())?;
        check_aggregates_source_only(&parsed, source.as_deref())?;
        if let Some(table) = source.as_deref() {
            check_source_refs_aggregated(&parsed, table)?;
        }
        Ok(Self {
            source,
            sink,
            constraint: parsed.to_string(),
            resolution,
            description: description.map(str::to_string),
            required_columns,
        })
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn sink(&self) -> Option<&str> {
        self.sink.as_deref()
    }

    /// Canonical text of the constraint.
    pub fn constraint(&self) -> &str {
        &self.constraint
    }

    /// Fresh, independent parse of the constraint. Callers own the returned
    /// tree and may mutate it freely.
    pub fn constraint_expr(&self) -> Result<Expr> {
        ast::parse_expr(&self.constraint)
    }

    pub fn resolution(&self) -> ResolutionKind {
        self.resolution
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn required_columns(&self) -> &RequiredColumns {
        &self.required_columns
    }

    pub fn tables(&self) -> Vec<String> {
        self.source.iter().chain(self.sink.iter()).cloned().collect()
    }

    /// Stable identifier derived from the policy's content.
    pub fn id(&self) -> String {
        policy_id(
            "row",
            self.source.as_deref(),
            self.sink.as_deref(),
            &self.constraint,
            self.resolution,
            self.description.as_deref(),
        )
    }
}

/// A cross-query policy evaluated with the accumulate/finalize protocol.
/// Resolution is restricted to INVALIDATE.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatePolicy {
    source: Option<String>,
    sink: Option<String>,
    constraint: String,
    description: Option<String>,
    required_columns: RequiredColumns,
    source_aggregates: Vec<SourceAggregate>,
}

impl AggregatePolicy {
    pub fn new(
        source: Option<&str>,
        sink: Option<&str>,
        constraint: &str,
        resolution: ResolutionKind,
        description: Option<&str>,
    ) -> Result<Self> {
        if resolution != ResolutionKind::Invalidate {
            return Err(DfcError::PolicySyntax(
                "aggregate policies only support the INVALIDATE resolution".into(),
            ));
        }
        let source = normalize_table(source);
        let sink = normalize_table(sink);
        let parsed = validate_constraint(constraint, source.as_deref(), sink.as_deref())?;
        let required_columns =
            collect_required_columns(&parsed, source.as_deref(), sink.as_deref())?;
        if let Some(table) = source.as_deref() {
            check_source_refs_aggregated(&parsed, table)?;
        }
        let source_aggregates = match source.as_deref() {
            Some(table) => extract_source_aggregates(&parsed, table)?,
            None => Vec::new(),
        };
        Ok(Self {
            source,
            sink,
            constraint: parsed.to_string(),
            description: description.map(str::to_string),
            required_columns,
            source_aggregates,
        })
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn sink(&self) -> Option<&str> {
        self.sink.as_deref()
    }

    pub fn constraint(&self) -> &str {
        &self.constraint
    }

    pub fn constraint_expr(&self) -> Result<Expr> {
        ast::parse_expr(&self.constraint)
    }

    pub fn resolution(&self) -> ResolutionKind {
        ResolutionKind::Invalidate
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn required_columns(&self) -> &RequiredColumns {
        &self.required_columns
    }

    pub fn tables(&self) -> Vec<String> {
        self.source.iter().chain(self.sink.iter()).cloned().collect()
    }

    pub fn source_aggregates(&self) -> &[SourceAggregate] {
        &self.source_aggregates
    }

    pub fn id(&self) -> String {
        policy_id(
            "aggregate",
            self.source.as_deref(),
            self.sink.as_deref(),
            &self.constraint,
            ResolutionKind::Invalidate,
            self.description.as_deref(),
        )
    }

    pub fn violation_message(&self) -> String {
        match &self.description {
            Some(description) => format!(
                "{description}: Aggregate policy constraint violated: {}",
                self.constraint
            ),
            None => format!("Aggregate policy constraint violated: {}", self.constraint),
        }
    }
}

/// Either policy variant, as produced by the textual mini-language.
#[derive(Debug, Clone, PartialEq)]
pub enum Policy {
    Row(RowPolicy),
    Aggregate(AggregatePolicy),
}

impl Policy {
    pub fn id(&self) -> String {
        match self {
            Self::Row(policy) => policy.id(),
            Self::Aggregate(policy) => policy.id(),
        }
    }

    pub fn source(&self) -> Option<&str> {
        match self {
            Self::Row(policy) => policy.source(),
            Self::Aggregate(policy) => policy.source(),
        }
    }

    pub fn sink(&self) -> Option<&str> {
        match self {
            Self::Row(policy) => policy.sink(),
            Self::Aggregate(policy) => policy.sink(),
        }
    }

    pub fn required_columns(&self) -> &RequiredColumns {
        match self {
            Self::Row(policy) => policy.required_columns(),
            Self::Aggregate(policy) => policy.required_columns(),
        }
    }
}

impl From<RowPolicy> for Policy {
    fn from(policy: RowPolicy) -> Self {
        Self::Row(policy)
    }
}

impl From<AggregatePolicy> for Policy {
    fn from(policy: AggregatePolicy) -> Self {
        Self::Aggregate(policy)
    }
}

fn normalize_table(name: Option<&str>) -> Option<String> {
    name.map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_lowercase)
}

fn policy_id(
    kind: &str,
    source: Option<&str>,
    sink: Option<&str>,
    constraint: &str,
    resolution: ResolutionKind,
    description: Option<&str>,
) -> String {
    let mut hasher = DefaultHasher::new();
    kind.hash(&mut hasher);
    source.hash(&mut hasher);
    sink.hash(&mut hasher);
    constraint.hash(&mut hasher);
    resolution.hash(&mut hasher);
    description.hash(&mut hasher);
    format!("policy_{:016x}", hasher.finish())
}

fn validate_constraint(
    constraint: &str,
    source: Option<&str>,
    sink: Option<&str>,
) -> Result<Expr> {
    if source.is_none() && sink.is_none() {
        return Err(DfcError::PolicySyntax(
            "policy requires at least one of source or sink".into(),
        ));
    }
    let parsed = ast::parse_expr(constraint)
        .map_err(|err| DfcError::PolicySyntax(format!("constraint does not parse: {err}")))?;
    ast::check_constraint_expr(&parsed)?;
    Ok(parsed)
}

fn collect_required_columns(
    expr: &Expr,
    source: Option<&str>,
    sink: Option<&str>,
) -> Result<RequiredColumns> {
    let mut required = RequiredColumns::new();
    let mut stack = vec![expr];
    while let Some(node) = stack.pop() {
        match ast::column_parts(node) {
            Some((None, column)) => {
                return Err(DfcError::PolicySyntax(format!(
                    "constraint column '{column}' must be qualified with its table name"
                )));
            }
            Some((Some(table), column)) => {
                if Some(table.as_str()) != source && Some(table.as_str()) != sink {
                    return Err(DfcError::PolicySyntax(format!(
                        "constraint references table '{table}', which is not the source or sink"
                    )));
                }
                required.entry(table).or_default().insert(column);
            }
            None => stack.extend(ast::child_exprs(node)),
        }
    }
    Ok(required)
}

/// Row-policy aggregate calls may only close over source-table columns.
/// Sink columns stay raw, so an aggregate over them could never be made
/// row-evaluable by degeneration.
fn check_aggregates_source_only(expr: &Expr, source: Option<&str>) -> Result<()> {
    let mut result = Ok(());
    ast::visit_exprs(expr, &mut |node| {
        if result.is_err() {
            return;
        }
        let Expr::Function(func) = node else {
            return;
        };
        if !ast::is_aggregate_function(&ast::function_name(func)) {
            return;
        }
        let Some(source) = source else {
            result = Err(DfcError::PolicySyntax(format!(
                "aggregation '{node}' requires a source table; \
                 aggregations may only reference source columns"
            )));
            return;
        };
        ast::visit_exprs(node, &mut |inner| {
            if let Some((Some(table), _)) = ast::column_parts(inner) {
                if table != source {
                    result = Err(DfcError::PolicySyntax(format!(
                        "aggregation '{node}' references table '{table}', \
                         but aggregations may only reference source columns"
                    )));
                }
            }
        });
    });
    result
}

/// Every source-table column must sit inside an aggregate call. This is
/// the invariant that makes per-row degeneration well defined.
fn check_source_refs_aggregated(expr: &Expr, source: &str) -> Result<()> {
    fn walk(expr: &Expr, source: &str, in_aggregate: bool) -> Result<()> {
        if let Some((Some(table), column)) = ast::column_parts(expr) {
            if table == source && !in_aggregate {
                return Err(DfcError::PolicySyntax(format!(
                    "source column '{source}.{column}' must appear inside an aggregate function"
                )));
            }
        }
        let inside = in_aggregate
            || matches!(expr, Expr::Function(func)
                if ast::is_aggregate_function(&ast::function_name(func)));
        for child in ast::child_exprs(expr) {
            walk(child, source, inside)?;
        }
        Ok(())
    }
    walk(expr, source, false)
}

fn first_aggregate(expr: &Expr) -> Option<&Expr> {
    if let Expr::Function(func) = expr {
        if ast::is_aggregate_function(&ast::function_name(func)) {
            return Some(expr);
        }
    }
    ast::child_exprs(expr).into_iter().find_map(first_aggregate)
}

/// Fold for an aggregate that appears without nesting: the same function
/// is computed per query and across queries, except counts, which fold by
/// summing the per-query counts.
fn flat_fold(name: &str) -> Result<OuterFold> {
    match name {
        "count" | "count_if" | "total" | "sum" => Ok(OuterFold::Sum),
        "max" => Ok(OuterFold::Max),
        "min" => Ok(OuterFold::Min),
        "avg" => Ok(OuterFold::Avg),
        other => Err(DfcError::PolicySyntax(format!(
            "aggregate '{other}' is not supported in aggregate policies"
        ))),
    }
}

/// Fold named explicitly by the outer call of a nested aggregate, e.g. the
/// `max` of `max(sum(t.x))`.
fn nested_fold(name: &str) -> Result<OuterFold> {
    match name {
        "sum" | "total" => Ok(OuterFold::Sum),
        "max" => Ok(OuterFold::Max),
        "min" => Ok(OuterFold::Min),
        "avg" => Ok(OuterFold::Avg),
        "count" => Ok(OuterFold::Count),
        other => Err(DfcError::PolicySyntax(format!(
            "aggregate '{other}' cannot fold accumulated values"
        ))),
    }
}

fn extract_source_aggregates(expr: &Expr, source: &str) -> Result<Vec<SourceAggregate>> {
    fn collect(
        expr: &Expr,
        source: &str,
        seen: &mut BTreeSet<String>,
        out: &mut Vec<SourceAggregate>,
    ) -> Result<()> {
        if let Expr::Function(func) = expr {
            let name = ast::function_name(func);
            if ast::is_aggregate_function(&name) && ast::references_table(expr, source) {
                let nested = ast::function_args(func)
                    .into_iter()
                    .find_map(first_aggregate);
                let (inner, fold) = match nested {
                    Some(inner) => {
                        if ast::child_exprs(inner)
                            .into_iter()
                            .any(|c| first_aggregate(c).is_some())
                        {
                            return Err(DfcError::PolicySyntax(
                                "aggregate calls nested more than two levels are not supported"
                                    .into(),
                            ));
                        }
                        (inner.to_string(), nested_fold(&name)?)
                    }
                    None => (expr.to_string(), flat_fold(&name)?),
                };
                let node = expr.to_string();
                if seen.insert(node.clone()) {
                    out.push(SourceAggregate { node, inner, fold });
                }
                return Ok(());
            }
        }
        for child in ast::child_exprs(expr) {
            collect(child, source, seen, out)?;
        }
        Ok(())
    }

    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    collect(expr, source, &mut seen, &mut out)?;
    Ok(out)
}
