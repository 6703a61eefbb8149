use crate::chunk::ScoredChunk;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Identifies which strategy produced a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StrategyId {
    /// Every eligible file fit into the token budget
    FullWorkspace,
    /// Server-side code search over the remote index
    RemoteSearch,
    /// Local vector-embeddings index
    LocalEmbeddings,
    /// Local lexical (TF-IDF) index
    LocalLexical,
}

impl StrategyId {
    /// Short stable identifier for logs and provenance fields
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyId::FullWorkspace => "full-workspace",
            StrategyId::RemoteSearch => "remote-search",
            StrategyId::LocalEmbeddings => "local-embeddings",
            StrategyId::LocalLexical => "local-lexical",
        }
    }
}

/// Severity of a user-facing alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertSeverity {
    Info,
    Warning,
}

/// A user-facing message attached to a search result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchAlert {
    /// How prominently the message should be surfaced
    pub severity: AlertSeverity,

    /// The message text
    pub message: String,
}

impl SearchAlert {
    /// Informational alert
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            severity: AlertSeverity::Info,
            message: message.into(),
        }
    }

    /// Warning alert
    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: AlertSeverity::Warning,
            message: message.into(),
        }
    }
}

/// What a single strategy returned for a query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategyResult {
    /// Candidate chunks, possibly empty
    pub chunks: Vec<ScoredChunk>,

    /// Alerts to surface alongside the chunks
    pub alerts: Vec<SearchAlert>,
}

impl StrategyResult {
    /// Result carrying only chunks
    pub fn chunks(chunks: Vec<ScoredChunk>) -> Self {
        Self {
            chunks,
            alerts: Vec::new(),
        }
    }
}

/// Progress notification emitted while a search request runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchProgress {
    /// A strategy is about to be attempted
    TryingStrategy(StrategyId),
    /// The named strategy timed out and a fallback is starting
    FallingBack(StrategyId),
}

/// Optional sink for [`SearchProgress`] notifications
pub type ProgressCallback = Arc<dyn Fn(SearchProgress) + Send + Sync>;
