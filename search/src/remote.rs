use crate::config::SearchConfig;
use crate::error::StrategyError;
use crate::query::SearchQuery;
use crate::strategy::{SearchOptions, SearchSizing, SearchStrategy};
use async_trait::async_trait;
use codescout_protocol::{
    AuthProvider, EmbeddingsIndex, LexicalIndex, LocalIndexError, LocalIndexState, QueryResolver,
    RemoteApiError, RemoteSearchApi, ScoredChunk, SearchAlert, StrategyId, StrategyResult,
};
use codescout_repo_index::{DiffTracker, RepoIndexTracker, RepoStatus};
use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Searches the server-side code index, overriding its answers with local
/// content for every file that drifted from the indexed commit.
///
/// Availability hinges on the repo tracker: repositories without a usable
/// index make the strategy decline, except that a `NotYetIndexed` repository
/// may be indexed on demand and briefly polled in the hope the build lands
/// within this very request.
pub struct RemoteSearchStrategy {
    api: Arc<dyn RemoteSearchApi>,
    auth: Arc<dyn AuthProvider>,
    resolver: Arc<dyn QueryResolver>,
    tracker: RepoIndexTracker,
    diffs: DiffTracker,
    embeddings: Arc<dyn EmbeddingsIndex>,
    lexical: Arc<dyn LexicalIndex>,
    config: SearchConfig,
}

impl RemoteSearchStrategy {
    /// Create a new remote-search strategy
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api: Arc<dyn RemoteSearchApi>,
        auth: Arc<dyn AuthProvider>,
        resolver: Arc<dyn QueryResolver>,
        tracker: RepoIndexTracker,
        diffs: DiffTracker,
        embeddings: Arc<dyn EmbeddingsIndex>,
        lexical: Arc<dyn LexicalIndex>,
        config: SearchConfig,
    ) -> Self {
        Self {
            api,
            auth,
            resolver,
            tracker,
            diffs,
            embeddings,
            lexical,
            config,
        }
    }

    /// Repositories usable for remote search, after instant indexing if the
    /// configuration permits it
    async fn usable_repos(
        &self,
        token: &CancellationToken,
    ) -> Result<Vec<(PathBuf, codescout_protocol::RemoteRepoId)>, StrategyError> {
        let searchable = self.tracker.searchable_repos().await;
        if !searchable.is_empty() {
            return Ok(searchable
                .into_iter()
                .map(|(root, remote, _)| (root, remote))
                .collect());
        }

        if !self.config.allow_instant_indexing {
            return Ok(Vec::new());
        }
        let statuses = self.tracker.statuses().await;
        if !statuses
            .values()
            .any(|status| matches!(status, RepoStatus::NotYetIndexed))
        {
            return Ok(Vec::new());
        }

        info!("triggering instant remote indexing for this request");
        if let Err(err) = self.tracker.trigger_remote_indexing("instant-search").await {
            debug!("instant indexing not possible: {err}");
            return Ok(Vec::new());
        }

        let interval = Duration::from_millis(self.config.instant_index_interval_ms);
        for attempt in 0..self.config.instant_index_attempts {
            tokio::select! {
                _ = token.cancelled() => return Err(StrategyError::Cancelled),
                _ = tokio::time::sleep(interval) => {}
            }

            let building: Vec<PathBuf> = self
                .tracker
                .statuses()
                .await
                .into_iter()
                .filter(|(_, status)| matches!(status, RepoStatus::BuildingIndex))
                .map(|(root, _)| root)
                .collect();
            for root in building {
                if let Err(err) = self.tracker.poll_build_once(&root).await {
                    debug!("instant-indexing status check failed: {err}");
                }
            }

            let searchable = self.tracker.searchable_repos().await;
            if !searchable.is_empty() {
                info!("instant indexing completed within {} checks", attempt + 1);
                return Ok(searchable
                    .into_iter()
                    .map(|(root, remote, _)| (root, remote))
                    .collect());
            }
        }

        debug!(
            "instant indexing did not finish within {} checks",
            self.config.instant_index_attempts
        );
        Ok(Vec::new())
    }

    /// Search the locally-changed files through the embeddings index,
    /// falling back to the lexical index when embeddings cannot answer
    async fn search_local_subset(
        &self,
        sizing: &SearchSizing,
        query: &SearchQuery,
        subset: &[PathBuf],
        token: &CancellationToken,
    ) -> Result<Vec<ScoredChunk>, StrategyError> {
        if subset.is_empty() {
            return Ok(Vec::new());
        }

        if matches!(
            self.embeddings.state(),
            LocalIndexState::Ready | LocalIndexState::Building
        ) {
            match self
                .embeddings
                .search(query.raw(), Some(subset), sizing.max_results, token)
                .await
            {
                Ok(chunks) => return Ok(chunks),
                Err(LocalIndexError::Cancelled) => return Err(StrategyError::Cancelled),
                Err(LocalIndexError::Unavailable(message)) => {
                    debug!("embeddings diff search unavailable: {message}");
                }
            }
        }

        match self
            .lexical
            .search(query.raw(), Some(subset), sizing.max_results, token)
            .await
        {
            Ok(chunks) => Ok(chunks),
            Err(LocalIndexError::Cancelled) => Err(StrategyError::Cancelled),
            Err(LocalIndexError::Unavailable(message)) => {
                // Remote results still stand on their own; the diffed files
                // just contribute nothing.
                warn!("no local index available for changed files: {message}");
                Ok(Vec::new())
            }
        }
    }
}

#[async_trait]
impl SearchStrategy for RemoteSearchStrategy {
    fn id(&self) -> StrategyId {
        StrategyId::RemoteSearch
    }

    async fn prepare(&self, _token: &CancellationToken) {
        self.tracker.initialize().await;
        self.tracker.try_auth_if_needed().await;
    }

    async fn search(
        &self,
        sizing: &SearchSizing,
        query: &SearchQuery,
        options: &SearchOptions,
        subset: Option<&[PathBuf]>,
        token: &CancellationToken,
    ) -> Result<Option<StrategyResult>, StrategyError> {
        // Remote search always covers whole repositories; an explicit subset
        // is a local concern.
        if subset.is_some() {
            return Ok(None);
        }

        let repos = self.usable_repos(token).await?;
        if repos.is_empty() {
            debug!("remote search declined: no repository with a usable index");
            return Ok(None);
        }

        // Without a known diff the remote answers cannot be trusted to
        // reflect local edits, so the strategy is not applicable.
        let Some(diff) = self.diffs.diff_files().await else {
            debug!("remote search declined: local diff unknown");
            return Ok(None);
        };

        let wire_query = query.dereferenced(self.resolver.as_ref()).await.to_string();
        let diff_subset: Vec<PathBuf> = diff.iter().cloned().collect();

        let remote_part = async {
            let mut chunks = Vec::new();
            let mut out_of_sync = false;
            let mut failures = Vec::new();
            for (_root, remote) in &repos {
                let Some(auth) = self.auth.session(remote.provider, false).await else {
                    failures.push(format!("{remote}: not signed in"));
                    continue;
                };
                match self
                    .api
                    .search_repo(&auth, remote, &wire_query, sizing.max_results, token)
                    .await
                {
                    Ok(hit) => {
                        out_of_sync |= hit.out_of_sync;
                        chunks.extend(hit.chunks);
                    }
                    Err(RemoteApiError::Cancelled) => return Err(StrategyError::Cancelled),
                    Err(err) => failures.push(format!("{remote}: {err}")),
                }
            }
            Ok((chunks, out_of_sync, failures))
        };
        let local_part = self.search_local_subset(sizing, query, &diff_subset, token);

        let (remote_outcome, local_outcome) = tokio::join!(remote_part, local_part);
        let (remote_chunks, out_of_sync, failures) = remote_outcome?;
        let local_chunks = local_outcome?;

        if remote_chunks.is_empty() && failures.len() == repos.len() && !repos.is_empty() {
            return Err(StrategyError::Failed(failures.join("; ")));
        }
        for failure in &failures {
            warn!("remote search partial failure: {failure}");
        }

        // Local edits win: a remote chunk for any file in the diff set is
        // stale by definition.
        let mut chunks: Vec<ScoredChunk> = remote_chunks
            .into_iter()
            .filter(|chunk| !diff.contains(&chunk.chunk.path))
            .filter(|chunk| options.matches(&chunk.chunk.path))
            .collect();
        chunks.extend(
            local_chunks
                .into_iter()
                .filter(|chunk| options.matches(&chunk.chunk.path)),
        );

        let mut result = StrategyResult::chunks(chunks);
        if out_of_sync {
            result.alerts.push(SearchAlert::info(
                "The remote index lags your branch; results for changed files come from local search.",
            ));
        }
        Ok(Some(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codescout_protocol::{
        AuthSession, ChunkRange, ChunkScore, EmbeddingKind, FileChunk, FileEvent,
        RemoteIndexState, RemoteIndexStatus, RemoteProviderKind, RemoteRepoId, RemoteSearchHit,
        RepoDiscovery, RepoEvent, WorkspaceFiles,
    };
    use codescout_repo_index::{RepoIndexConfig, VcsDiffSource};
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;
    use std::path::Path;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::broadcast;

    struct ScriptedRemote {
        // Status answers, first N scripted then the steady answer forever.
        scripted: StdMutex<Vec<RemoteIndexState>>,
        steady: RemoteIndexState,
        hit: RemoteSearchHit,
        trigger_calls: AtomicUsize,
        search_calls: AtomicUsize,
    }

    impl ScriptedRemote {
        fn ready(hit: RemoteSearchHit) -> Self {
            Self {
                scripted: StdMutex::new(Vec::new()),
                steady: RemoteIndexState {
                    status: RemoteIndexStatus::Ready,
                    indexed_commit: Some("abc123".to_string()),
                },
                hit,
                trigger_calls: AtomicUsize::new(0),
                search_calls: AtomicUsize::new(0),
            }
        }

        fn building_then(steady: RemoteIndexState, building_answers: usize) -> Self {
            Self {
                scripted: StdMutex::new(vec![
                    RemoteIndexState {
                        status: RemoteIndexStatus::BuildingIndex,
                        indexed_commit: None,
                    };
                    building_answers
                ]),
                steady,
                hit: RemoteSearchHit::default(),
                trigger_calls: AtomicUsize::new(0),
                search_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl RemoteSearchApi for ScriptedRemote {
        async fn get_index_state(
            &self,
            _auth: &AuthSession,
            _repo: &RemoteRepoId,
            _token: &CancellationToken,
        ) -> Result<RemoteIndexState, RemoteApiError> {
            let mut scripted = self.scripted.lock().expect("lock poisoned");
            if scripted.is_empty() {
                Ok(self.steady.clone())
            } else {
                Ok(scripted.remove(0))
            }
        }

        async fn trigger_indexing(
            &self,
            _auth: &AuthSession,
            _reason: &str,
            _repo: &RemoteRepoId,
        ) -> Result<bool, RemoteApiError> {
            self.trigger_calls.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }

        async fn search_repo(
            &self,
            _auth: &AuthSession,
            _repo: &RemoteRepoId,
            _query: &str,
            _max_results: usize,
            _token: &CancellationToken,
        ) -> Result<RemoteSearchHit, RemoteApiError> {
            self.search_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.hit.clone())
        }
    }

    struct OpenAuth;

    #[async_trait]
    impl AuthProvider for OpenAuth {
        async fn session(
            &self,
            _provider: RemoteProviderKind,
            _interactive: bool,
        ) -> Option<AuthSession> {
            Some(AuthSession {
                token: "token".to_string(),
            })
        }
    }

    struct PassthroughResolver;

    #[async_trait]
    impl QueryResolver for PassthroughResolver {
        async fn dereference(&self, raw: &str) -> String {
            raw.to_string()
        }

        async fn keywords(&self, text: &str) -> Vec<String> {
            text.split_whitespace().map(str::to_string).collect()
        }
    }

    struct NoDiscovery {
        events: broadcast::Sender<RepoEvent>,
    }

    impl NoDiscovery {
        fn new() -> Self {
            let (events, _) = broadcast::channel(8);
            Self { events }
        }
    }

    #[async_trait]
    impl RepoDiscovery for NoDiscovery {
        async fn settled(&self) {}

        fn repos(&self) -> Vec<PathBuf> {
            Vec::new()
        }

        fn subscribe(&self) -> broadcast::Receiver<RepoEvent> {
            self.events.subscribe()
        }
    }

    struct AllEligibleFiles {
        events: broadcast::Sender<FileEvent>,
    }

    impl AllEligibleFiles {
        fn new() -> Self {
            let (events, _) = broadcast::channel(8);
            Self { events }
        }
    }

    #[async_trait]
    impl WorkspaceFiles for AllEligibleFiles {
        fn eligible_files(&self) -> Vec<PathBuf> {
            Vec::new()
        }

        fn is_eligible(&self, _path: &Path) -> bool {
            true
        }

        async fn read_text(&self, _path: &Path) -> std::io::Result<String> {
            Ok(String::new())
        }

        fn is_dirty(&self, _path: &Path) -> bool {
            false
        }

        fn subscribe(&self) -> broadcast::Receiver<FileEvent> {
            self.events.subscribe()
        }
    }

    struct FixedVcs {
        changed: HashSet<PathBuf>,
    }

    impl VcsDiffSource for FixedVcs {
        fn changed_files(&self, _root: &Path, _base: &str) -> anyhow::Result<HashSet<PathBuf>> {
            Ok(self.changed.clone())
        }

        fn upstream_ref(&self, _root: &Path) -> Option<String> {
            None
        }
    }

    struct SubsetIndex {
        state: LocalIndexState,
        chunks: Vec<ScoredChunk>,
    }

    #[async_trait]
    impl EmbeddingsIndex for SubsetIndex {
        async fn search(
            &self,
            _query: &str,
            subset: Option<&[PathBuf]>,
            _max_results: usize,
            _token: &CancellationToken,
        ) -> Result<Vec<ScoredChunk>, LocalIndexError> {
            Ok(self
                .chunks
                .iter()
                .filter(|chunk| subset.is_none_or(|subset| subset.contains(&chunk.chunk.path)))
                .cloned()
                .collect())
        }

        fn state(&self) -> LocalIndexState {
            self.state
        }

        async fn ensure_indexed(&self, _reason: &str) -> bool {
            true
        }
    }

    struct UnavailableLexical;

    #[async_trait]
    impl LexicalIndex for UnavailableLexical {
        async fn search(
            &self,
            _query: &str,
            _subset: Option<&[PathBuf]>,
            _max_results: usize,
            _token: &CancellationToken,
        ) -> Result<Vec<ScoredChunk>, LocalIndexError> {
            Err(LocalIndexError::Unavailable("no lexical index".to_string()))
        }

        fn state(&self) -> LocalIndexState {
            LocalIndexState::Unavailable
        }

        async fn ensure_indexed(&self, _reason: &str) -> bool {
            false
        }
    }

    fn chunk(path: &str, value: f32) -> ScoredChunk {
        ScoredChunk::scored(
            FileChunk::new(path, ChunkRange::new(1, 5), "code"),
            ChunkScore::new(EmbeddingKind::NomicV15, value),
        )
    }

    fn remote_id() -> RemoteRepoId {
        RemoteRepoId::new(RemoteProviderKind::GitHub, "octo", "spoon")
    }

    fn sizing() -> SearchSizing {
        SearchSizing {
            token_budget: 10_000,
            max_results: 20,
        }
    }

    struct Fixture {
        strategy: RemoteSearchStrategy,
        tracker: RepoIndexTracker,
        diffs: DiffTracker,
        api: Arc<ScriptedRemote>,
    }

    fn fixture(
        api: ScriptedRemote,
        diff: impl IntoIterator<Item = PathBuf>,
        local_chunks: Vec<ScoredChunk>,
        config: SearchConfig,
    ) -> Fixture {
        let api = Arc::new(api);
        let repo_config = RepoIndexConfig::default();
        let tracker = RepoIndexTracker::new(
            api.clone(),
            Arc::new(OpenAuth),
            Arc::new(NoDiscovery::new()),
            repo_config.clone(),
        )
        .expect("config should be valid");
        let diffs = DiffTracker::new(
            tracker.clone(),
            Arc::new(AllEligibleFiles::new()),
            Arc::new(FixedVcs {
                changed: diff.into_iter().collect(),
            }),
            &repo_config,
        );
        diffs.start();

        let strategy = RemoteSearchStrategy::new(
            api.clone(),
            Arc::new(OpenAuth),
            Arc::new(PassthroughResolver),
            tracker.clone(),
            diffs.clone(),
            Arc::new(SubsetIndex {
                state: LocalIndexState::Ready,
                chunks: local_chunks,
            }),
            Arc::new(UnavailableLexical),
            config,
        );

        Fixture {
            strategy,
            tracker,
            diffs,
            api,
        }
    }

    impl Fixture {
        /// Wait until the repository reaches `target` and the diff tracker
        /// has folded the corresponding update in.
        async fn settle(&self, root: &Path, target: impl Fn(&RepoStatus) -> bool) {
            for _ in 0..200 {
                let status_ok = self
                    .tracker
                    .status(root)
                    .await
                    .is_some_and(|status| target(&status));
                if status_ok && self.diffs.diff_files().await.is_some() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            panic!("repository never settled");
        }
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_diffed_files_never_come_from_remote() {
        let fx = fixture(
            ScriptedRemote::ready(RemoteSearchHit {
                chunks: vec![chunk("/ws/spoon/stale.rs", 0.9), chunk("/ws/spoon/fresh.rs", 0.8)],
                out_of_sync: false,
            }),
            [PathBuf::from("/ws/spoon/stale.rs")],
            vec![chunk("/ws/spoon/stale.rs", 0.7)],
            SearchConfig::default(),
        );
        let root = PathBuf::from("/ws/spoon");
        fx.tracker
            .open_repo_with_remote(root.clone(), remote_id())
            .await;
        fx.settle(&root, RepoStatus::is_searchable).await;

        let result = fx
            .strategy
            .search(
                &sizing(),
                &SearchQuery::new("query"),
                &SearchOptions::default(),
                None,
                &CancellationToken::new(),
            )
            .await
            .expect("should not fail")
            .expect("should produce a result");

        // The stale file's chunk comes from the local subset search, with
        // the remote copy discarded.
        let stale: Vec<&ScoredChunk> = result
            .chunks
            .iter()
            .filter(|chunk| chunk.chunk.path == PathBuf::from("/ws/spoon/stale.rs"))
            .collect();
        assert_eq!(stale.len(), 1);
        assert_eq!(
            stale[0].score,
            Some(ChunkScore::new(EmbeddingKind::NomicV15, 0.7))
        );
        assert!(
            result
                .chunks
                .iter()
                .any(|chunk| chunk.chunk.path == PathBuf::from("/ws/spoon/fresh.rs"))
        );
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_out_of_sync_reported_as_alert() {
        let fx = fixture(
            ScriptedRemote::ready(RemoteSearchHit {
                chunks: vec![chunk("/ws/spoon/fresh.rs", 0.8)],
                out_of_sync: true,
            }),
            [],
            Vec::new(),
            SearchConfig::default(),
        );
        let root = PathBuf::from("/ws/spoon");
        fx.tracker
            .open_repo_with_remote(root.clone(), remote_id())
            .await;
        fx.settle(&root, RepoStatus::is_searchable).await;

        let result = fx
            .strategy
            .search(
                &sizing(),
                &SearchQuery::new("query"),
                &SearchOptions::default(),
                None,
                &CancellationToken::new(),
            )
            .await
            .expect("should not fail")
            .expect("should produce a result");

        assert_eq!(result.alerts.len(), 1);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_declines_without_usable_repo() {
        let fx = fixture(
            ScriptedRemote::ready(RemoteSearchHit::default()),
            [],
            Vec::new(),
            SearchConfig {
                allow_instant_indexing: false,
                ..Default::default()
            },
        );

        let result = fx
            .strategy
            .search(
                &sizing(),
                &SearchQuery::new("query"),
                &SearchOptions::default(),
                None,
                &CancellationToken::new(),
            )
            .await
            .expect("should not fail");
        assert!(result.is_none());
        assert_eq!(fx.api.search_calls.load(Ordering::SeqCst), 0);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_instant_indexing_makes_repo_usable_in_request() {
        // First check says NotYetIndexed; after the trigger, two polls see
        // BuildingIndex before the steady Ready answer.
        let api = ScriptedRemote {
            scripted: StdMutex::new(vec![RemoteIndexState {
                status: RemoteIndexStatus::NotYetIndexed,
                indexed_commit: None,
            }]),
            steady: RemoteIndexState {
                status: RemoteIndexStatus::Ready,
                indexed_commit: Some("abc123".to_string()),
            },
            hit: RemoteSearchHit {
                chunks: vec![chunk("/ws/spoon/fresh.rs", 0.8)],
                out_of_sync: false,
            },
            trigger_calls: AtomicUsize::new(0),
            search_calls: AtomicUsize::new(0),
        };
        let fx = fixture(api, [], Vec::new(), SearchConfig::default());
        let root = PathBuf::from("/ws/spoon");
        fx.tracker
            .open_repo_with_remote(root.clone(), remote_id())
            .await;
        fx.settle(&root, |status| *status == RepoStatus::NotYetIndexed)
            .await;

        let result = fx
            .strategy
            .search(
                &sizing(),
                &SearchQuery::new("query"),
                &SearchOptions::default(),
                None,
                &CancellationToken::new(),
            )
            .await
            .expect("should not fail")
            .expect("instant indexing should make the repo usable");

        assert_eq!(fx.api.trigger_calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.chunks.len(), 1);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_instant_indexing_gives_up_after_bounded_checks() {
        let api = ScriptedRemote {
            scripted: StdMutex::new(vec![RemoteIndexState {
                status: RemoteIndexStatus::NotYetIndexed,
                indexed_commit: None,
            }]),
            steady: RemoteIndexState {
                status: RemoteIndexStatus::BuildingIndex,
                indexed_commit: None,
            },
            hit: RemoteSearchHit::default(),
            trigger_calls: AtomicUsize::new(0),
            search_calls: AtomicUsize::new(0),
        };
        let fx = fixture(api, [], Vec::new(), SearchConfig::default());
        let root = PathBuf::from("/ws/spoon");
        fx.tracker
            .open_repo_with_remote(root.clone(), remote_id())
            .await;
        fx.settle(&root, |status| *status == RepoStatus::NotYetIndexed)
            .await;

        let result = fx
            .strategy
            .search(
                &sizing(),
                &SearchQuery::new("query"),
                &SearchOptions::default(),
                None,
                &CancellationToken::new(),
            )
            .await
            .expect("should not fail");

        // The build never finished, so the strategy declines and no remote
        // search ran.
        assert!(result.is_none());
        assert_eq!(fx.api.search_calls.load(Ordering::SeqCst), 0);
    }
}
