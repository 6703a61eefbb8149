use crate::error::StrategyError;
use crate::query::SearchQuery;
use crate::strategy::{SearchOptions, SearchSizing, SearchStrategy};
use async_trait::async_trait;
use codescout_protocol::{
    ChunkRange, FileChunk, ScoredChunk, StrategyId, StrategyResult, Tokenizer, WorkspaceFiles,
};
use log::debug;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;

/// Returns every eligible file whole when the workspace fits the budget.
///
/// Fitting is itself the relevance signal: when all content fits, nothing
/// needs ranking. The strategy declines for workspaces with too many files
/// to be worth enumerating, and remembers the largest token total it has
/// seen so later requests with smaller budgets can decline without reading
/// a single file.
pub struct FullWorkspaceStrategy {
    files: Arc<dyn WorkspaceFiles>,
    tokenizer: Arc<dyn Tokenizer>,
    file_cap: usize,
    /// Largest token total observed for the full workspace; 0 = never measured
    high_water_tokens: AtomicUsize,
}

impl FullWorkspaceStrategy {
    /// Create a new full-workspace strategy
    pub fn new(
        files: Arc<dyn WorkspaceFiles>,
        tokenizer: Arc<dyn Tokenizer>,
        file_cap: usize,
    ) -> Self {
        Self {
            files,
            tokenizer,
            file_cap,
            high_water_tokens: AtomicUsize::new(0),
        }
    }

    fn record_high_water(&self, total: usize) {
        self.high_water_tokens.fetch_max(total, Ordering::SeqCst);
    }
}

#[async_trait]
impl SearchStrategy for FullWorkspaceStrategy {
    fn id(&self) -> StrategyId {
        StrategyId::FullWorkspace
    }

    async fn search(
        &self,
        sizing: &SearchSizing,
        _query: &SearchQuery,
        options: &SearchOptions,
        subset: Option<&[PathBuf]>,
        token: &CancellationToken,
    ) -> Result<Option<StrategyResult>, StrategyError> {
        // Subset searches are a fallback concern; this strategy only ever
        // answers for the workspace as a whole.
        if subset.is_some() {
            return Ok(None);
        }

        let eligible: Vec<PathBuf> = self
            .files
            .eligible_files()
            .into_iter()
            .filter(|path| options.matches(path))
            .collect();
        if eligible.len() > self.file_cap {
            debug!(
                "full workspace declined: {} files exceeds cap of {}",
                eligible.len(),
                self.file_cap
            );
            return Ok(None);
        }

        let high_water = self.high_water_tokens.load(Ordering::SeqCst);
        if high_water > sizing.token_budget {
            debug!(
                "full workspace declined: prior total of {high_water} tokens exceeds budget {}",
                sizing.token_budget
            );
            return Ok(None);
        }

        let mut total_tokens = 0usize;
        let mut chunks = Vec::with_capacity(eligible.len());
        for path in eligible {
            if token.is_cancelled() {
                return Err(StrategyError::Cancelled);
            }

            let text = match self.files.read_text(&path).await {
                Ok(text) => text,
                Err(err) => {
                    // A file that vanished mid-scan just drops out.
                    debug!("skipping unreadable {}: {err}", path.display());
                    continue;
                }
            };

            total_tokens += self.tokenizer.count(&text);
            if total_tokens > sizing.token_budget {
                debug!(
                    "full workspace aborted at {total_tokens} tokens over budget {}",
                    sizing.token_budget
                );
                self.record_high_water(total_tokens);
                return Ok(None);
            }

            let line_count = text.lines().count().max(1);
            chunks.push(ScoredChunk::unscored(FileChunk::new(
                path,
                ChunkRange::new(1, line_count),
                text,
            )));
        }

        self.record_high_water(total_tokens);
        debug!(
            "full workspace fit: {} files, {total_tokens} tokens",
            chunks.len()
        );
        Ok(Some(StrategyResult::chunks(chunks)))
    }
}
