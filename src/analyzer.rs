//! Table collection and query shape classification. Base tables are
//! gathered from FROM/JOIN targets including one level of subquery/CTE
//! nesting; anything deeper is recorded separately so the transformer can
//! refuse it when a policy needs to reach that far.

use std::collections::BTreeSet;

use sqlparser::ast::{
    Expr, GroupByExpr, Query, Select, SelectItem, SetExpr, TableFactor,
};

use crate::ast;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueryShape {
    /// GROUP BY present, or a scalar aggregate in the projection.
    Aggregating,
    Scanning,
}

#[derive(Debug, Default)]
pub(crate) struct TableSet {
    /// Direct FROM/JOIN targets of the outer scope.
    pub outer: BTreeSet<String>,
    /// Base tables one subquery/CTE level down.
    pub nested: BTreeSet<String>,
    /// Base tables below one nesting level; out of reach for propagation.
    pub deep: BTreeSet<String>,
}

impl TableSet {
    /// Tables a policy may be matched and enforced against.
    pub fn visible(&self, table: &str) -> bool {
        self.outer.contains(table) || self.nested.contains(table)
    }
}

pub(crate) fn collect_tables(query: &Query) -> TableSet {
    let mut tables = TableSet::default();
    let mut cte_aliases = BTreeSet::new();
    if let Some(with) = &query.with {
        for cte in &with.cte_tables {
            cte_aliases.insert(cte.alias.name.value.to_lowercase());
            collect_from_query(&cte.query, 1, &mut tables);
        }
    }
    collect_from_body(&query.body, 0, &mut tables);
    // CTE aliases look like base tables in FROM but are not.
    for alias in &cte_aliases {
        tables.outer.remove(alias);
        tables.nested.remove(alias);
        tables.deep.remove(alias);
    }
    tables
}

fn collect_from_query(query: &Query, depth: usize, out: &mut TableSet) {
    if let Some(with) = &query.with {
        for cte in &with.cte_tables {
            collect_from_query(&cte.query, depth + 1, out);
        }
    }
    collect_from_body(&query.body, depth, out);
}

fn collect_from_body(body: &SetExpr, depth: usize, out: &mut TableSet) {
    match body {
        SetExpr::Select(select) => collect_from_select(select, depth, out),
        SetExpr::Query(query) => collect_from_query(query, depth, out),
        SetExpr::SetOperation { left, right, .. } => {
            collect_from_body(left, depth, out);
            collect_from_body(right, depth, out);
        }
        _ => {}
    }
}

fn collect_from_select(select: &Select, depth: usize, out: &mut TableSet) {
    for table_with_joins in &select.from {
        collect_from_factor(&table_with_joins.relation, depth, out);
        for join in &table_with_joins.joins {
            collect_from_factor(&join.relation, depth, out);
        }
    }
}

fn collect_from_factor(factor: &TableFactor, depth: usize, out: &mut TableSet) {
    match factor {
        TableFactor::Table { name, .. } => {
            let table = ast::object_name_text(name);
            match depth {
                0 => {
                    out.outer.insert(table);
                }
                1 => {
                    out.nested.insert(table);
                }
                _ => {
                    out.deep.insert(table);
                }
            }
        }
        TableFactor::Derived { subquery, .. } => collect_from_query(subquery, depth + 1, out),
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => {
            collect_from_factor(&table_with_joins.relation, depth, out);
            for join in &table_with_joins.joins {
                collect_from_factor(&join.relation, depth, out);
            }
        }
        _ => {}
    }
}

pub(crate) fn classify(select: &Select) -> QueryShape {
    match &select.group_by {
        GroupByExpr::All(_) => return QueryShape::Aggregating,
        GroupByExpr::Expressions(exprs, _) if !exprs.is_empty() => {
            return QueryShape::Aggregating;
        }
        _ => {}
    }
    for item in &select.projection {
        let expr = match item {
            SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => expr,
            _ => continue,
        };
        let mut found = false;
        ast::visit_exprs(expr, &mut |node| {
            if let Expr::Function(func) = node {
                if ast::is_aggregate_function(&ast::function_name(func)) {
                    found = true;
                }
            }
        });
        if found {
            return QueryShape::Aggregating;
        }
    }
    QueryShape::Scanning
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlparser::ast::Statement;

    fn parse_query(sql: &str) -> Query {
        match ast::parse_statement(sql).unwrap() {
            Statement::Query(query) => *query,
            other => panic!("expected a query, got {other}"),
        }
    }

    #[test]
    fn collects_from_and_join_tables() {
        let query = parse_query("SELECT baz.x FROM baz JOIN foo ON baz.x = foo.id");
        let tables = collect_tables(&query);
        assert!(tables.outer.contains("baz"));
        assert!(tables.outer.contains("foo"));
    }

    #[test]
    fn collects_one_level_of_subquery_tables() {
        let query = parse_query("SELECT * FROM (SELECT id FROM foo) AS sub");
        let tables = collect_tables(&query);
        assert!(tables.nested.contains("foo"));
        assert!(!tables.outer.contains("foo"));
        assert!(tables.visible("foo"));
    }

    #[test]
    fn cte_aliases_are_not_base_tables() {
        let query = parse_query("WITH sub AS (SELECT name FROM users) SELECT sub.name FROM sub");
        let tables = collect_tables(&query);
        assert!(tables.nested.contains("users"));
        assert!(!tables.visible("sub"));
    }

    #[test]
    fn deeper_nesting_is_flagged_as_deep() {
        let query = parse_query(
            "SELECT * FROM (SELECT * FROM (SELECT id FROM foo) AS inner_sub) AS outer_sub",
        );
        let tables = collect_tables(&query);
        assert!(tables.deep.contains("foo"));
        assert!(!tables.visible("foo"));
    }

    #[test]
    fn group_by_means_aggregating() {
        let query = parse_query("SELECT name FROM foo GROUP BY name");
        let select = ast::query_select(&query).unwrap();
        assert_eq!(classify(select), QueryShape::Aggregating);
    }

    #[test]
    fn scalar_aggregate_means_aggregating() {
        let query = parse_query("SELECT max(id) FROM foo");
        let select = ast::query_select(&query).unwrap();
        assert_eq!(classify(select), QueryShape::Aggregating);
    }

    #[test]
    fn plain_projection_means_scanning() {
        let query = parse_query("SELECT id, name FROM foo WHERE id > 1");
        let select = ast::query_select(&query).unwrap();
        assert_eq!(classify(select), QueryShape::Scanning);
    }
}
