//! Subquery/CTE column propagation. When a policy table is only reachable
//! through a one-level-nested SELECT, the columns its constraint needs are
//! appended to that nested projection, and the table-to-alias map records
//! the identifier under which they are visible at the outer scope.

use std::collections::{BTreeMap, BTreeSet};

use sqlparser::ast::{Query, Select, SelectItem, SetExpr, TableFactor};

use crate::ast;
use crate::error::Result;
use crate::policy::RequiredColumns;

/// Base table name (lowercase) to the qualifier its columns are visible
/// under in the outer scope. Built fresh per transform call.
pub(crate) type AliasMap = BTreeMap<String, String>;

/// Appends missing `table.column` items to one-level-nested projections.
/// This is the only structural mutation the transformer performs on the
/// query tree outside of clause injection. Projections that are `*` already
/// expose everything and are left alone.
pub(crate) fn expose_required_columns(
    query: &mut Query,
    required: &RequiredColumns,
) -> Result<()> {
    if required.is_empty() {
        return Ok(());
    }
    if let Some(with) = &mut query.with {
        for cte in &mut with.cte_tables {
            expose_in_nested_query(&mut cte.query, required);
        }
    }
    if let SetExpr::Select(select) = query.body.as_mut() {
        for table_with_joins in &mut select.from {
            expose_in_factor(&mut table_with_joins.relation, required);
            for join in &mut table_with_joins.joins {
                expose_in_factor(&mut join.relation, required);
            }
        }
    }
    Ok(())
}

fn expose_in_factor(factor: &mut TableFactor, required: &RequiredColumns) {
    if let TableFactor::Derived { subquery, .. } = factor {
        expose_in_nested_query(subquery, required);
    }
}

fn expose_in_nested_query(query: &mut Query, required: &RequiredColumns) {
    let Some(select) = ast::query_select_mut(query) else {
        return;
    };
    for (table, columns) in required {
        let Some(qualifier) = direct_qualifier(select, table) else {
            continue;
        };
        if has_wildcard(&select.projection) {
            continue;
        }
        for column in columns {
            if !exposes_column(&select.projection, table, &qualifier, column) {
                select
                    .projection
                    .push(SelectItem::UnnamedExpr(ast::column_ref(&qualifier, column)));
            }
        }
    }
}

/// The identifier under which `table`'s columns are addressable inside a
/// SELECT whose FROM names it directly: its own FROM alias, or the name.
fn direct_qualifier(select: &Select, table: &str) -> Option<String> {
    for factor in from_factors(select) {
        if let TableFactor::Table { name, alias, .. } = factor {
            if ast::object_name_text(name) == table {
                return Some(
                    alias
                        .as_ref()
                        .map(|a| a.name.value.clone())
                        .unwrap_or_else(|| table.to_string()),
                );
            }
        }
    }
    None
}

fn has_wildcard(projection: &[SelectItem]) -> bool {
    projection
        .iter()
        .any(|item| matches!(item, SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(..)))
}

fn exposes_column(
    projection: &[SelectItem],
    table: &str,
    qualifier: &str,
    column: &str,
) -> bool {
    let qualifier = qualifier.to_lowercase();
    projection.iter().any(|item| match item {
        SelectItem::UnnamedExpr(expr) => match ast::column_parts(expr) {
            Some((None, name)) => name == column,
            Some((Some(owner), name)) => name == column && (owner == table || owner == qualifier),
            None => false,
        },
        SelectItem::ExprWithAlias { alias, .. } => alias.value.to_lowercase() == column,
        _ => false,
    })
}

fn from_factors(select: &Select) -> Vec<&TableFactor> {
    let mut factors = Vec::new();
    for table_with_joins in &select.from {
        factors.push(&table_with_joins.relation);
        for join in &table_with_joins.joins {
            factors.push(&join.relation);
        }
    }
    factors
}

/// Builds the table-to-alias map for the given base tables: a direct FROM
/// target maps to its own alias (or name), a table inside a derived
/// subquery maps to the subquery alias, and a table inside a CTE body maps
/// to the CTE alias. Direct targets win when a table is visible both ways.
pub(crate) fn table_alias_map(query: &Query, tables: &BTreeSet<String>) -> AliasMap {
    let mut aliases = AliasMap::new();
    if let Some(with) = &query.with {
        for cte in &with.cte_tables {
            for table in nested_base_tables(&cte.query) {
                if tables.contains(&table) {
                    aliases.insert(table, cte.alias.name.value.clone());
                }
            }
        }
    }
    if let SetExpr::Select(select) = query.body.as_ref() {
        for factor in from_factors(select) {
            if let TableFactor::Derived {
                subquery,
                alias: Some(alias),
                ..
            } = factor
            {
                for table in nested_base_tables(subquery) {
                    if tables.contains(&table) {
                        aliases.insert(table, alias.name.value.clone());
                    }
                }
            }
        }
        for factor in from_factors(select) {
            if let TableFactor::Table { name, alias, .. } = factor {
                let table = ast::object_name_text(name);
                if tables.contains(&table) {
                    let visible = alias
                        .as_ref()
                        .map(|a| a.name.value.clone())
                        .unwrap_or_else(|| table.clone());
                    aliases.insert(table, visible);
                }
            }
        }
    }
    aliases
}

fn nested_base_tables(query: &Query) -> BTreeSet<String> {
    let mut tables = BTreeSet::new();
    if let Some(select) = ast::query_select(query) {
        for factor in from_factors(select) {
            if let TableFactor::Table { name, .. } = factor {
                tables.insert(ast::object_name_text(name));
            }
        }
    }
    tables
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

    fn required(table: &str, columns: &[&str]) -> RequiredColumns {
        let mut map = RequiredColumns::new();
        map.insert(
            table.to_string(),
            columns.iter().map(|c| c.to_string()).collect(),
        );
        map
    }

    #[test]
    fn appends_missing_column_to_cte_projection() {
        let mut query =
            parse_query("WITH sub AS (SELECT name FROM users) SELECT sub.name FROM sub");
        expose_required_columns(&mut query, &required("users", &["age"])).unwrap();
        assert_eq!(
            query.to_string(),
            "WITH sub AS (SELECT name, users.age FROM users) SELECT sub.name FROM sub"
        );
    }

    #[test]
    fn appends_missing_column_to_subquery_projection() {
        let mut query = parse_query("SELECT sub.id FROM (SELECT id FROM foo) AS sub");
        expose_required_columns(&mut query, &required("foo", &["name"])).unwrap();
        assert_eq!(
            query.to_string(),
            "SELECT sub.id FROM (SELECT id, foo.name FROM foo) AS sub"
        );
    }

    #[test]
    fn already_exposed_columns_are_not_duplicated() {
        let mut query = parse_query("SELECT sub.id FROM (SELECT id FROM foo) AS sub");
        expose_required_columns(&mut query, &required("foo", &["id"])).unwrap();
        assert_eq!(
            query.to_string(),
            "SELECT sub.id FROM (SELECT id FROM foo) AS sub"
        );
    }

    #[test]
    fn wildcard_projections_are_left_alone() {
        let mut query = parse_query("SELECT sub.id FROM (SELECT * FROM foo) AS sub");
        expose_required_columns(&mut query, &required("foo", &["name"])).unwrap();
        assert_eq!(
            query.to_string(),
            "SELECT sub.id FROM (SELECT * FROM foo) AS sub"
        );
    }

    #[test]
    fn inner_from_alias_qualifies_appended_columns() {
        let mut query = parse_query("SELECT sub.id FROM (SELECT id FROM foo AS f) AS sub");
        expose_required_columns(&mut query, &required("foo", &["name"])).unwrap();
        assert_eq!(
            query.to_string(),
            "SELECT sub.id FROM (SELECT id, f.name FROM foo AS f) AS sub"
        );
    }

    #[test]
    fn alias_map_prefers_direct_tables() {
        let query = parse_query("SELECT foo.id FROM foo, (SELECT id FROM foo) AS sub");
        let tables = BTreeSet::from(["foo".to_string()]);
        let aliases = table_alias_map(&query, &tables);
        assert_eq!(aliases["foo"], "foo");
    }

    #[test]
    fn alias_map_covers_from_aliases() {
        let query = parse_query("SELECT f.id FROM foo AS f");
        let tables = BTreeSet::from(["foo".to_string()]);
        let aliases = table_alias_map(&query, &tables);
        assert_eq!(aliases["foo"], "f");
    }

    #[test]
    fn alias_map_covers_subqueries_and_ctes() {
        let query = parse_query(
            "WITH w AS (SELECT x FROM baz) \
             SELECT * FROM (SELECT id FROM foo) AS sub JOIN w ON w.x = sub.id",
        );
        let tables = BTreeSet::from(["foo".to_string(), "baz".to_string()]);
        let aliases = table_alias_map(&query, &tables);
        assert_eq!(aliases["foo"], "sub");
        assert_eq!(aliases["baz"], "w");
    }
}
