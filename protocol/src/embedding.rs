use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Embedding families available to the search stack.
///
/// The kind is carried alongside every score so that values produced by
/// different models are never mixed in one ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EmbeddingKind {
    /// Nomic-embed-text-v1.5, the default for code
    NomicV15,
    /// All-MiniLM-L6-v2, lightweight fallback
    MiniLmL6,
}

/// A single embedding vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding(pub Vec<f32>);

impl Embedding {
    /// Cosine similarity against another vector.
    ///
    /// Returns 0.0 for mismatched dimensions or zero-magnitude vectors.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        if self.0.len() != other.0.len() || self.0.is_empty() {
            return 0.0;
        }

        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom == 0.0 { 0.0 } else { dot / denom }
    }
}

/// Computes embeddings for batches of text.
///
/// Returns `None` when the computer is unavailable (model not downloaded,
/// service unreachable, request cancelled); callers treat that as "cannot
/// score right now", not as an error.
#[async_trait]
pub trait EmbeddingsProvider: Send + Sync {
    async fn compute(
        &self,
        kind: EmbeddingKind,
        texts: &[String],
        token: &CancellationToken,
    ) -> Option<Vec<Embedding>>;
}
