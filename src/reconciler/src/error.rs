/// Failure reported by a data endpoint while running a statement.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("failed to decode column `{column}`: {reason}")]
    Decode { column: String, reason: String },
    #[error("unsupported statement: {0}")]
    Unsupported(String),
    #[error("query rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// Malformed arguments or unknown names, detected before any query is issued.
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("query failed: {0}")]
    Query(#[from] QueryError),
    /// An internal invariant was violated. Always a bug.
    #[error("logic error: {0}")]
    Logic(String),
}

impl ReconcileError {
    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

pub type Result<T, E = ReconcileError> = std::result::Result<T, E>;
