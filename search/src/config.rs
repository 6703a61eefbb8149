use codescout_protocol::EmbeddingKind;
use serde::{Deserialize, Serialize};

/// Configuration for strategy selection, racing, and reranking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Grace period for the remote strategy before the local fallback
    /// starts, in milliseconds
    #[serde(default = "default_remote_timeout_ms")]
    pub remote_timeout_ms: u64,

    /// Grace period for local embeddings before the lexical fallback
    /// starts, in milliseconds
    #[serde(default = "default_embeddings_timeout_ms")]
    pub embeddings_timeout_ms: u64,

    /// Largest workspace (in eligible files) the full-workspace strategy
    /// will even attempt to enumerate
    #[serde(default = "default_full_workspace_file_cap")]
    pub full_workspace_file_cap: usize,

    /// Whether a not-yet-indexed repository may be indexed on demand during
    /// a search request
    #[serde(default = "default_allow_instant_indexing")]
    pub allow_instant_indexing: bool,

    /// Status checks to attempt while hoping an instant index build
    /// finishes within the request
    #[serde(default = "default_instant_index_attempts")]
    pub instant_index_attempts: u32,

    /// Delay between instant-indexing status checks, in milliseconds
    #[serde(default = "default_instant_index_interval_ms")]
    pub instant_index_interval_ms: u64,

    /// Minimum score relative to the best result; chunks scoring below
    /// `top_score * max_embedding_spread` are dropped
    #[serde(default = "default_max_embedding_spread")]
    pub max_embedding_spread: f32,

    /// Embedding family used for query scoring
    #[serde(default = "default_embedding_kind")]
    pub embedding_kind: EmbeddingKind,

    /// Enable the query response cache
    #[serde(default = "default_enable_cache")]
    pub enable_cache: bool,

    /// Capacity of the query response cache
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,

    /// Treat "every strategy failed" as a hard error instead of an empty
    /// result with a warning; used by verification harnesses
    #[serde(default)]
    pub strict_failures: bool,
}

fn default_remote_timeout_ms() -> u64 {
    12_500
}

fn default_embeddings_timeout_ms() -> u64 {
    8_000
}

fn default_full_workspace_file_cap() -> usize {
    50
}

fn default_allow_instant_indexing() -> bool {
    true
}

fn default_instant_index_attempts() -> u32 {
    5
}

fn default_instant_index_interval_ms() -> u64 {
    1_000
}

fn default_max_embedding_spread() -> f32 {
    0.65
}

fn default_embedding_kind() -> EmbeddingKind {
    EmbeddingKind::NomicV15
}

fn default_enable_cache() -> bool {
    true
}

fn default_cache_size() -> usize {
    64
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            remote_timeout_ms: default_remote_timeout_ms(),
            embeddings_timeout_ms: default_embeddings_timeout_ms(),
            full_workspace_file_cap: default_full_workspace_file_cap(),
            allow_instant_indexing: default_allow_instant_indexing(),
            instant_index_attempts: default_instant_index_attempts(),
            instant_index_interval_ms: default_instant_index_interval_ms(),
            max_embedding_spread: default_max_embedding_spread(),
            embedding_kind: default_embedding_kind(),
            enable_cache: default_enable_cache(),
            cache_size: default_cache_size(),
            strict_failures: false,
        }
    }
}

impl SearchConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.remote_timeout_ms == 0 {
            return Err("remote_timeout_ms must be > 0".to_string());
        }

        if self.embeddings_timeout_ms == 0 {
            return Err("embeddings_timeout_ms must be > 0".to_string());
        }

        if !(0.0..=1.0).contains(&self.max_embedding_spread) {
            return Err("max_embedding_spread must be within [0.0, 1.0]".to_string());
        }

        if self.instant_index_attempts == 0 {
            return Err("instant_index_attempts must be > 0".to_string());
        }

        if self.instant_index_interval_ms == 0 {
            return Err("instant_index_interval_ms must be > 0".to_string());
        }

        if self.enable_cache && self.cache_size == 0 {
            return Err("cache_size must be > 0 when the cache is enabled".to_string());
        }

        Ok(())
    }
}
