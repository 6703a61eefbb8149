use thiserror::Error;

/// Failure of a single strategy invocation.
///
/// `Cancelled` must pass through every await boundary unmodified so the
/// racing orchestrator can unwind; everything else is caught at the
/// invocation boundary and turned into `Failed`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StrategyError {
    #[error("search cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),
}

/// Failures of a whole search request
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SearchError {
    #[error("search cancelled")]
    Cancelled,

    #[error("no search strategy succeeded: {reasons}")]
    NoStrategySucceeded { reasons: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, SearchError>;
