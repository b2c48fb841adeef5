//! Registration-time validation of policy table and column references
//! against the execution engine's reported schema.

use crate::error::{DfcError, Result};
use crate::policy::Policy;

/// Schema metadata the execution collaborator exposes. Queried lazily at
/// registration; never cached beyond that check.
pub trait Catalog {
    fn table_exists(&self, table: &str) -> Result<bool>;
    fn column_exists(&self, table: &str, column: &str) -> Result<bool>;
}

pub(crate) fn validate_policy(policy: &Policy, catalog: &dyn Catalog) -> Result<()> {
    if let Some(source) = policy.source() {
        if !catalog.table_exists(source)? {
            return Err(DfcError::PolicyCatalog(format!(
                "source table '{source}' does not exist"
            )));
        }
    }
    if let Some(sink) = policy.sink() {
        if !catalog.table_exists(sink)? {
            return Err(DfcError::PolicyCatalog(format!(
                "sink table '{sink}' does not exist"
            )));
        }
    }
    for (table, columns) in policy.required_columns() {
        for column in columns {
            if !catalog.column_exists(table, column)? {
                return Err(DfcError::PolicyCatalog(format!(
                    "column '{table}.{column}' referenced by the constraint does not exist"
                )));
            }
        }
    }
    Ok(())
}
