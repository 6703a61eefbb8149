use crate::error::StrategyError;
use crate::query::SearchQuery;
use async_trait::async_trait;
use codescout_protocol::{StrategyId, StrategyResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use wildmatch::WildMatch;

/// How much result the caller can absorb
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchSizing {
    /// Token budget the final chunk list must fit into
    pub token_budget: usize,

    /// Upper bound on returned chunks
    pub max_results: usize,
}

/// Caller-supplied search restrictions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchOptions {
    /// Glob patterns limiting which files may contribute chunks; empty
    /// means no restriction
    pub glob_patterns: Vec<String>,
}

impl SearchOptions {
    /// Whether a file passes the glob restriction
    pub fn matches(&self, path: &Path) -> bool {
        if self.glob_patterns.is_empty() {
            return true;
        }
        let text = path.to_string_lossy();
        self.glob_patterns
            .iter()
            .any(|pattern| WildMatch::new(pattern).matches(&text))
    }
}

/// One pluggable source of ranked chunks.
///
/// `search` answers `Ok(None)` when the strategy is not applicable right
/// now; that is an expected outcome, not an error. Implementations must
/// surface cancellation as [`StrategyError::Cancelled`] and abandon
/// in-flight work promptly once `token` fires.
#[async_trait]
pub trait SearchStrategy: Send + Sync {
    /// Stable identity for provenance and logs
    fn id(&self) -> StrategyId;

    /// Side-effecting preparation (may prompt for authentication); runs
    /// before the caller starts its timeout clock
    async fn prepare(&self, token: &CancellationToken) {
        let _ = token;
    }

    /// Search the whole workspace, or only `subset` when given
    async fn search(
        &self,
        sizing: &SearchSizing,
        query: &SearchQuery,
        options: &SearchOptions,
        subset: Option<&[PathBuf]>,
        token: &CancellationToken,
    ) -> Result<Option<StrategyResult>, StrategyError>;
}
