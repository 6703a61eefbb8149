use crate::error::StrategyError;
use crate::query::SearchQuery;
use crate::strategy::{SearchOptions, SearchSizing, SearchStrategy};
use async_trait::async_trait;
use codescout_protocol::{
    EmbeddingsIndex, LexicalIndex, LocalIndexError, LocalIndexState, ScoredChunk, StrategyId,
    StrategyResult,
};
use log::debug;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn usable(state: LocalIndexState) -> bool {
    // A build in progress can still answer from what it has indexed so far.
    matches!(state, LocalIndexState::Ready | LocalIndexState::Building)
}

fn filter_chunks(chunks: Vec<ScoredChunk>, options: &SearchOptions) -> Vec<ScoredChunk> {
    chunks
        .into_iter()
        .filter(|chunk| options.matches(&chunk.chunk.path))
        .collect()
}

fn map_index_error(err: LocalIndexError) -> StrategyError {
    match err {
        LocalIndexError::Cancelled => StrategyError::Cancelled,
        LocalIndexError::Unavailable(message) => StrategyError::Failed(message),
    }
}

/// Adapter over the local vector-embeddings index
pub struct LocalEmbeddingsStrategy {
    index: Arc<dyn EmbeddingsIndex>,
}

impl LocalEmbeddingsStrategy {
    /// Create a new embeddings-index strategy
    pub fn new(index: Arc<dyn EmbeddingsIndex>) -> Self {
        Self { index }
    }
}

#[async_trait]
impl SearchStrategy for LocalEmbeddingsStrategy {
    fn id(&self) -> StrategyId {
        StrategyId::LocalEmbeddings
    }

    async fn search(
        &self,
        sizing: &SearchSizing,
        query: &SearchQuery,
        options: &SearchOptions,
        subset: Option<&[PathBuf]>,
        token: &CancellationToken,
    ) -> Result<Option<StrategyResult>, StrategyError> {
        if !usable(self.index.state()) {
            debug!("embeddings index not usable: {:?}", self.index.state());
            return Ok(None);
        }

        let chunks = self
            .index
            .search(query.raw(), subset, sizing.max_results, token)
            .await
            .map_err(map_index_error)?;
        Ok(Some(StrategyResult::chunks(filter_chunks(chunks, options))))
    }
}

/// Adapter over the local lexical (TF-IDF) index
pub struct LocalLexicalStrategy {
    index: Arc<dyn LexicalIndex>,
}

impl LocalLexicalStrategy {
    /// Create a new lexical-index strategy
    pub fn new(index: Arc<dyn LexicalIndex>) -> Self {
        Self { index }
    }
}

#[async_trait]
impl SearchStrategy for LocalLexicalStrategy {
    fn id(&self) -> StrategyId {
        StrategyId::LocalLexical
    }

    async fn search(
        &self,
        sizing: &SearchSizing,
        query: &SearchQuery,
        options: &SearchOptions,
        subset: Option<&[PathBuf]>,
        token: &CancellationToken,
    ) -> Result<Option<StrategyResult>, StrategyError> {
        if !usable(self.index.state()) {
            debug!("lexical index not usable: {:?}", self.index.state());
            return Ok(None);
        }

        let chunks = self
            .index
            .search(query.raw(), subset, sizing.max_results, token)
            .await
            .map_err(map_index_error)?;
        Ok(Some(StrategyResult::chunks(filter_chunks(chunks, options))))
    }
}
