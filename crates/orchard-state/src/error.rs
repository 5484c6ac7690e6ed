//! Store error types.

use thiserror::Error;

/// Result type alias for store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Failures surfaced by the instance store.
#[derive(Debug, Error)]
pub enum StateError {
    /// The database file could not be opened or created.
    #[error("failed to open database: {0}")]
    Open(String),

    /// A transaction, table, read, or write failed underneath an operation.
    #[error("storage failure: {0}")]
    Storage(String),

    /// A stored value could not be encoded or decoded.
    #[error("corrupt record: {0}")]
    Codec(String),
}

impl From<StateError> for orchard_core::OrchardError {
    fn from(err: StateError) -> Self {
        orchard_core::OrchardError::State(err.to_string())
    }
}
