use thiserror::Error;

pub type Result<T, E = DfcError> = std::result::Result<T, E>;

/// Failure taxonomy for the policy engine. The first three are recoverable
/// at the caller's boundary; `ExecutionAbort` always propagates as the sole
/// outcome of the query that triggered it.
#[derive(Debug, Error)]
pub enum DfcError {
    /// Malformed policy at construction time: bad constraint, missing
    /// source/sink, unqualified or foreign column, ungrouped source column.
    #[error("policy syntax error: {0}")]
    PolicySyntax(String),

    /// Registration-time schema mismatch: unknown table or column.
    #[error("policy catalog error: {0}")]
    PolicyCatalog(String),

    /// Rewrite-time construct the engine cannot express per row.
    #[error("unsupported construct: {0}")]
    UnsupportedConstruct(String),

    /// A KILL policy fired during predicate evaluation. Carries the
    /// policy's description; no rows accompany this error.
    #[error("query aborted by policy: {0}")]
    ExecutionAbort(String),

    /// LLM repair path failed or declined. Non-fatal; the caller still
    /// receives the unrepaired rows.
    #[error("row repair failed: {0}")]
    RepairFailure(String),

    #[error("sql parse error: {0}")]
    Parse(#[from] sqlparser::parser::ParserError),

    #[error("engine error: {0}")]
    Engine(#[from] rusqlite::Error),

    #[error("artifact io error: {0}")]
    Artifact(#[from] std::io::Error),

    #[error("artifact encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}
