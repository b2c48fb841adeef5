//! Data flow control for SQL: policies constrain what may flow out of
//! source tables and into sink tables, and registered policies are
//! enforced by rewriting queries before they reach the engine. Row
//! policies remove, abort, invalidate, or hand violating rows to a repair
//! collaborator; aggregate policies are evaluated across queries with an
//! accumulate/finalize protocol.

mod aggregate;
mod analyzer;
mod ast;
pub mod catalog;
pub mod engine;
pub mod error;
pub mod parser;
pub mod policy;
mod propagate;
pub mod repair;
mod rewrite;
pub mod rewriter;

pub use aggregate::ViolationReport;
pub use catalog::Catalog;
pub use engine::{Engine, Rows, SqliteEngine, Value};
pub use error::{DfcError, Result};
pub use parser::parse_policy;
pub use policy::{AggregatePolicy, Policy, ResolutionKind, RowPolicy};
pub use repair::{
    ArtifactRecord, RecordingRepair, RepairExchange, RepairOutcome, RepairRequest, ReplayRepair,
    Row, RowRepair, SideArtifact,
};
pub use rewriter::Rewriter;
