use crate::config::SearchConfig;
use crate::error::{Result, SearchError};
use crate::full_workspace::FullWorkspaceStrategy;
use crate::local::{LocalEmbeddingsStrategy, LocalLexicalStrategy};
use crate::orchestrator::StrategyOrchestrator;
use crate::query::SearchQuery;
use crate::remote::RemoteSearchStrategy;
use crate::rerank::ResultReranker;
use crate::strategy::{SearchOptions, SearchSizing};
use codescout_protocol::{
    AuthProvider, EmbeddingsIndex, EmbeddingsProvider, LexicalIndex, LocalIndexState,
    ProgressCallback, QueryResolver, RemoteSearchApi, ScoredChunk, SearchAlert, StrategyId,
    Tokenizer, WorkspaceFiles,
};
use codescout_repo_index::{
    DiffTracker, RemoteOverallStatus, RepoIndexTracker, TriggerIndexingError,
};
use log::{debug, info};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Per-request timing and cache information
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchStats {
    /// Total request time in milliseconds
    pub total_ms: u64,

    /// Time spent in the full-workspace scan, when it ran to completion
    pub full_workspace_ms: Option<u64>,

    /// Time until the remote strategy answered, when it did
    pub remote_ms: Option<u64>,

    /// Time until the local strategies answered, when they did
    pub local_ms: Option<u64>,

    /// Reranking time, absent for full-workspace answers
    pub rerank_ms: Option<u64>,

    /// The response came from the query cache
    pub cache_hit: bool,
}

/// The answer to one search request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    /// Ranked chunks, best first
    pub chunks: Vec<ScoredChunk>,

    /// Which strategy produced the chunks; absent when none succeeded
    pub strategy: Option<StrategyId>,

    /// The whole workspace fit the budget, so `chunks` is exhaustive
    pub is_full_workspace: bool,

    /// User-facing notices collected along the way
    pub alerts: Vec<SearchAlert>,

    /// Timing and cache information
    pub stats: SearchStats,
}

/// Combined index health for status UIs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexState {
    pub remote: RemoteOverallStatus,
    pub local_embeddings: LocalIndexState,
    pub local_lexical: LocalIndexState,
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    query: String,
    sizing: SearchSizing,
    globs: Vec<String>,
}

/// The workspace chunk-search facade.
///
/// Wires the strategy orchestrator to the reranker, caches recent
/// responses, and exposes the indexing triggers and status projections the
/// surrounding tooling consumes.
pub struct ChunkSearch {
    orchestrator: StrategyOrchestrator,
    reranker: ResultReranker,
    tracker: RepoIndexTracker,
    embeddings_index: Arc<dyn EmbeddingsIndex>,
    lexical_index: Arc<dyn LexicalIndex>,
    config: SearchConfig,
    cache: Arc<Mutex<LruCache<CacheKey, SearchResponse>>>,
    shutdown: CancellationToken,
}

impl ChunkSearch {
    /// Wire up the full search stack
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api: Arc<dyn RemoteSearchApi>,
        auth: Arc<dyn AuthProvider>,
        resolver: Arc<dyn QueryResolver>,
        provider: Arc<dyn EmbeddingsProvider>,
        tokenizer: Arc<dyn Tokenizer>,
        files: Arc<dyn WorkspaceFiles>,
        embeddings_index: Arc<dyn EmbeddingsIndex>,
        lexical_index: Arc<dyn LexicalIndex>,
        tracker: RepoIndexTracker,
        diffs: DiffTracker,
        config: SearchConfig,
    ) -> Result<Self> {
        config.validate().map_err(SearchError::Config)?;

        let full_workspace = Arc::new(FullWorkspaceStrategy::new(
            files.clone(),
            tokenizer,
            config.full_workspace_file_cap,
        ));
        let remote = Arc::new(RemoteSearchStrategy::new(
            api,
            auth,
            resolver.clone(),
            tracker.clone(),
            diffs,
            embeddings_index.clone(),
            lexical_index.clone(),
            config.clone(),
        ));
        let embeddings = Arc::new(LocalEmbeddingsStrategy::new(embeddings_index.clone()));
        let lexical = Arc::new(LocalLexicalStrategy::new(lexical_index.clone()));

        let orchestrator = StrategyOrchestrator::new(
            full_workspace,
            remote,
            embeddings,
            lexical,
            config.clone(),
        );
        let reranker = ResultReranker::new(
            provider,
            resolver.clone(),
            config.embedding_kind,
            config.max_embedding_spread,
        );

        let capacity = NonZeroUsize::new(config.cache_size.max(1))
            .unwrap_or(NonZeroUsize::MIN);
        let cache = Arc::new(Mutex::new(LruCache::new(capacity)));
        let shutdown = CancellationToken::new();

        // Any file change can invalidate cached answers; recent responses
        // are cheap to recompute, stale ones are not cheap to trust.
        let invalidation_cache = cache.clone();
        let mut file_events = files.subscribe();
        let invalidation_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = invalidation_shutdown.cancelled() => return,
                    event = file_events.recv() => match event {
                        Ok(_) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                            invalidation_cache.lock().await.clear();
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    },
                }
            }
        });

        Ok(Self {
            orchestrator,
            reranker,
            tracker,
            embeddings_index,
            lexical_index,
            config,
            cache,
            shutdown,
        })
    }

    /// Retrieve the most relevant chunks for `query` under `sizing`.
    ///
    /// In the default lenient mode a request where every strategy failed
    /// resolves to an empty chunk list plus a warning alert; with
    /// `strict_failures` set it becomes a hard error instead.
    pub async fn search_file_chunks(
        &self,
        sizing: SearchSizing,
        query: &str,
        options: SearchOptions,
        progress: Option<&ProgressCallback>,
        token: &CancellationToken,
    ) -> Result<SearchResponse> {
        let start = Instant::now();
        let key = CacheKey {
            query: query.to_string(),
            sizing,
            globs: options.glob_patterns.clone(),
        };

        if self.config.enable_cache {
            let mut cache = self.cache.lock().await;
            if let Some(cached) = cache.get(&key) {
                info!("cache hit for query");
                let mut response = cached.clone();
                response.stats.cache_hit = true;
                response.stats.total_ms = elapsed_ms(start);
                return Ok(response);
            }
        }

        let search_query = SearchQuery::new(query);
        let outcome = self
            .orchestrator
            .search(&sizing, &search_query, &options, progress, token)
            .await;

        let success = match outcome {
            Ok(success) => success,
            Err(SearchError::Cancelled) => return Err(SearchError::Cancelled),
            Err(SearchError::NoStrategySucceeded { reasons }) => {
                if self.config.strict_failures {
                    return Err(SearchError::NoStrategySucceeded { reasons });
                }
                debug!("no strategy succeeded: {reasons}");
                return Ok(SearchResponse {
                    chunks: Vec::new(),
                    strategy: None,
                    is_full_workspace: false,
                    alerts: vec![SearchAlert::warning(
                        "Could not search the workspace right now; no chunks were retrieved.",
                    )],
                    stats: SearchStats {
                        total_ms: elapsed_ms(start),
                        ..Default::default()
                    },
                });
            }
            Err(other) => return Err(other),
        };

        // A full-workspace answer is exhaustive by construction; ranking
        // it would only reorder content the caller gets anyway.
        let (chunks, rerank_ms) = if success.is_full_workspace {
            (success.result.chunks, None)
        } else {
            let rerank_start = Instant::now();
            let chunks = self
                .reranker
                .rerank(
                    &search_query,
                    success.result.chunks,
                    sizing.max_results,
                    token,
                )
                .await;
            (chunks, Some(elapsed_ms(rerank_start)))
        };

        let response = SearchResponse {
            chunks,
            strategy: Some(success.strategy),
            is_full_workspace: success.is_full_workspace,
            alerts: success.result.alerts,
            stats: SearchStats {
                total_ms: elapsed_ms(start),
                full_workspace_ms: success.timings.full_workspace_ms,
                remote_ms: success.timings.remote_ms,
                local_ms: success.timings.local_ms,
                rerank_ms,
                cache_hit: false,
            },
        };

        if self.config.enable_cache {
            self.cache.lock().await.put(key, response.clone());
        }
        info!(
            "search answered by {:?} with {} chunks in {}ms",
            response.strategy,
            response.chunks.len(),
            response.stats.total_ms
        );
        Ok(response)
    }

    /// Request a remote index build for every repository that needs one
    pub async fn trigger_remote_indexing(
        &self,
        reason: &str,
    ) -> std::result::Result<(), TriggerIndexingError> {
        self.tracker.trigger_remote_indexing(reason).await
    }

    /// Request local (embeddings and lexical) index builds
    pub async fn trigger_local_indexing(
        &self,
        reason: &str,
    ) -> std::result::Result<(), TriggerIndexingError> {
        let embeddings_accepted = self.embeddings_index.ensure_indexed(reason).await;
        let lexical_accepted = self.lexical_index.ensure_indexed(reason).await;
        if !embeddings_accepted && !lexical_accepted {
            return Err(TriggerIndexingError::TriggerFailed {
                repo: "the local workspace index".to_string(),
            });
        }
        self.clear_cache().await;
        Ok(())
    }

    /// Remote and local index health, for status UIs
    pub async fn index_state(&self) -> IndexState {
        IndexState {
            remote: self.tracker.overall_status().await,
            local_embeddings: self.embeddings_index.state(),
            local_lexical: self.lexical_index.state(),
        }
    }

    /// Drop every cached response
    pub async fn clear_cache(&self) {
        self.cache.lock().await.clear();
        debug!("search cache cleared");
    }

    /// Stop the cache-invalidation listener
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}
