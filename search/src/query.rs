use codescout_protocol::{Embedding, EmbeddingKind, EmbeddingsProvider, QueryResolver};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

/// A search request's text in all of its derived forms.
///
/// The dereferenced text, keyword list, and query embedding are each
/// resolved lazily and at most once per query instance; strategies share
/// one `SearchQuery` so the work is never repeated within a request.
pub struct SearchQuery {
    raw: String,
    dereferenced: OnceCell<String>,
    keywords: OnceCell<Vec<String>>,
    embedding: OnceCell<Option<Embedding>>,
}

impl SearchQuery {
    /// Wrap a raw query string
    pub fn new(raw: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            dereferenced: OnceCell::new(),
            keywords: OnceCell::new(),
            embedding: OnceCell::new(),
        }
    }

    /// The query exactly as the caller supplied it
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// The query with file and symbol references expanded to plain text
    pub async fn dereferenced(&self, resolver: &dyn QueryResolver) -> &str {
        self.dereferenced
            .get_or_init(|| resolver.dereference(&self.raw))
            .await
    }

    /// Search keywords extracted from the dereferenced text
    pub async fn keywords(&self, resolver: &dyn QueryResolver) -> &[String] {
        self.keywords
            .get_or_init(|| async {
                let text = self.dereferenced(resolver).await;
                resolver.keywords(text).await
            })
            .await
    }

    /// The query embedding, or `None` when the provider is unavailable.
    ///
    /// An unavailable answer is memoized too; a request does not retry the
    /// provider once it declined.
    pub async fn embedding(
        &self,
        resolver: &dyn QueryResolver,
        provider: &dyn EmbeddingsProvider,
        kind: EmbeddingKind,
        token: &CancellationToken,
    ) -> Option<&Embedding> {
        self.embedding
            .get_or_init(|| async {
                let text = self.dereferenced(resolver).await.to_string();
                provider
                    .compute(kind, &[text], token)
                    .await
                    .and_then(|mut vectors| vectors.pop())
            })
            .await
            .as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingResolver {
        dereferences: AtomicUsize,
        keyword_calls: AtomicUsize,
    }

    impl CountingResolver {
        fn new() -> Self {
            Self {
                dereferences: AtomicUsize::new(0),
                keyword_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl QueryResolver for CountingResolver {
        async fn dereference(&self, raw: &str) -> String {
            self.dereferences.fetch_add(1, Ordering::SeqCst);
            format!("resolved {raw}")
        }

        async fn keywords(&self, text: &str) -> Vec<String> {
            self.keyword_calls.fetch_add(1, Ordering::SeqCst);
            text.split_whitespace().map(str::to_string).collect()
        }
    }

    struct CountingProvider {
        computes: AtomicUsize,
        available: bool,
    }

    #[async_trait]
    impl EmbeddingsProvider for CountingProvider {
        async fn compute(
            &self,
            _kind: EmbeddingKind,
            texts: &[String],
            _token: &CancellationToken,
        ) -> Option<Vec<Embedding>> {
            self.computes.fetch_add(1, Ordering::SeqCst);
            self.available
                .then(|| texts.iter().map(|_| Embedding(vec![1.0, 0.0])).collect())
        }
    }

    #[tokio::test]
    async fn test_dereference_memoized() {
        let resolver = CountingResolver::new();
        let query = SearchQuery::new("find the parser");

        assert_eq!(query.dereferenced(&resolver).await, "resolved find the parser");
        assert_eq!(query.dereferenced(&resolver).await, "resolved find the parser");
        assert_eq!(resolver.dereferences.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_keywords_memoized_and_use_dereferenced_text() {
        let resolver = CountingResolver::new();
        let query = SearchQuery::new("parser");

        let keywords = query.keywords(&resolver).await.to_vec();
        assert_eq!(keywords, vec!["resolved".to_string(), "parser".to_string()]);

        let _ = query.keywords(&resolver).await;
        assert_eq!(resolver.keyword_calls.load(Ordering::SeqCst), 1);
        assert_eq!(resolver.dereferences.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_embedding_memoized_even_when_unavailable() {
        let resolver = CountingResolver::new();
        let provider = CountingProvider {
            computes: AtomicUsize::new(0),
            available: false,
        };
        let query = SearchQuery::new("parser");
        let token = CancellationToken::new();

        let first = query
            .embedding(&resolver, &provider, EmbeddingKind::NomicV15, &token)
            .await;
        assert!(first.is_none());

        let second = query
            .embedding(&resolver, &provider, EmbeddingKind::NomicV15, &token)
            .await;
        assert!(second.is_none());
        assert_eq!(provider.computes.load(Ordering::SeqCst), 1);
    }
}
