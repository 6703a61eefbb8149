use crate::query::SearchQuery;
use codescout_protocol::{
    ChunkScore, EmbeddingKind, EmbeddingsProvider, QueryResolver, ScoredChunk,
};
use log::debug;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Fuses and re-scores candidate chunks into the final bounded list.
///
/// Chunks already scored in the target embedding family are trusted as-is;
/// the rest are scored in one batched embeddings call. The tail is cut two
/// ways: a hard result cap, and a quality-spread cutoff relative to the
/// best score so marginal matches never dilute the context window.
pub struct ResultReranker {
    provider: Arc<dyn EmbeddingsProvider>,
    resolver: Arc<dyn QueryResolver>,
    kind: EmbeddingKind,
    max_spread: f32,
}

impl ResultReranker {
    /// Create a new reranker
    pub fn new(
        provider: Arc<dyn EmbeddingsProvider>,
        resolver: Arc<dyn QueryResolver>,
        kind: EmbeddingKind,
        max_spread: f32,
    ) -> Self {
        Self {
            provider,
            resolver,
            kind,
            max_spread,
        }
    }

    /// Rank `chunks` for `query`, returning at most `max_results` of them
    pub async fn rerank(
        &self,
        query: &SearchQuery,
        chunks: Vec<ScoredChunk>,
        max_results: usize,
        token: &CancellationToken,
    ) -> Vec<ScoredChunk> {
        // Remote and local-diff answers can cover the same span; keep the
        // best-scored copy of each.
        let mut deduped: HashMap<String, ScoredChunk> = HashMap::new();
        for chunk in chunks {
            let key = chunk.chunk.key();
            match deduped.get(&key) {
                Some(existing)
                    if existing.score_for(self.kind) >= chunk.score_for(self.kind) => {}
                _ => {
                    deduped.insert(key, chunk);
                }
            }
        }

        let (mut scored, unscored): (Vec<ScoredChunk>, Vec<ScoredChunk>) = deduped
            .into_values()
            .partition(|chunk| chunk.score_for(self.kind).is_some());

        scored.extend(self.score_batch(query, unscored, token).await);

        scored.sort_by(|a, b| {
            score_value(b, self.kind).total_cmp(&score_value(a, self.kind))
        });
        scored.truncate(max_results);

        if let Some(top) = scored.first().and_then(|chunk| chunk.score_for(self.kind)) {
            let floor = top * self.max_spread;
            scored.retain(|chunk| {
                chunk
                    .score_for(self.kind)
                    .is_none_or(|value| value >= floor)
            });
        }

        scored
    }

    /// Score every unscored chunk with one embeddings call.
    ///
    /// When the provider cannot answer, the chunks come back unscored and
    /// sort behind everything that has a score.
    async fn score_batch(
        &self,
        query: &SearchQuery,
        unscored: Vec<ScoredChunk>,
        token: &CancellationToken,
    ) -> Vec<ScoredChunk> {
        if unscored.is_empty() {
            return unscored;
        }

        let Some(query_embedding) = query
            .embedding(self.resolver.as_ref(), self.provider.as_ref(), self.kind, token)
            .await
        else {
            debug!("query embedding unavailable; leaving {} chunks unscored", unscored.len());
            return unscored;
        };
        let query_embedding = query_embedding.clone();

        let texts: Vec<String> = unscored
            .iter()
            .map(|chunk| chunk.chunk.text.clone())
            .collect();
        let Some(vectors) = self.provider.compute(self.kind, &texts, token).await else {
            debug!("chunk embeddings unavailable; leaving {} chunks unscored", unscored.len());
            return unscored;
        };

        unscored
            .into_iter()
            .zip(vectors)
            .map(|(mut chunk, vector)| {
                chunk.score = Some(ChunkScore::new(
                    self.kind,
                    query_embedding.similarity(&vector),
                ));
                chunk
            })
            .collect()
    }
}

fn score_value(chunk: &ScoredChunk, kind: EmbeddingKind) -> f32 {
    chunk.score_for(kind).unwrap_or(f32::NEG_INFINITY)
}
