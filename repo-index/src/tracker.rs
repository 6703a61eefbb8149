use crate::config::RepoIndexConfig;
use crate::error::{RepoIndexError, Result, TriggerIndexingError};
use crate::git;
use crate::state::{RemoteOverallStatus, RepoEntry, RepoIndexEvent, RepoStatus, TaskScope};
use codescout_protocol::{
    AuthProvider, AuthSession, RemoteApiError, RemoteIndexState, RemoteIndexStatus,
    RemoteProviderKind, RemoteRepoId, RemoteSearchApi, RepoDiscovery, RepoEvent,
};
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell, broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Tracks the remote index status of every repository in the workspace.
///
/// The status map is owned exclusively by the tracker; everything else sees
/// it through [`RepoStatus`] snapshots and the event channel.
#[derive(Clone)]
pub struct RepoIndexTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    remote: Arc<dyn RemoteSearchApi>,
    auth: Arc<dyn AuthProvider>,
    discovery: Arc<dyn RepoDiscovery>,
    config: RepoIndexConfig,
    repos: Mutex<HashMap<PathBuf, RepoEntry>>,
    polls: Mutex<HashMap<PathBuf, TaskScope>>,
    events: broadcast::Sender<RepoIndexEvent>,
    init: OnceCell<()>,
    shutdown: CancellationToken,
}

impl RepoIndexTracker {
    /// Create a new tracker
    pub fn new(
        remote: Arc<dyn RemoteSearchApi>,
        auth: Arc<dyn AuthProvider>,
        discovery: Arc<dyn RepoDiscovery>,
        config: RepoIndexConfig,
    ) -> Result<Self> {
        config.validate().map_err(RepoIndexError::Config)?;

        let (events, _) = broadcast::channel(config.event_capacity);
        Ok(Self {
            inner: Arc::new(TrackerInner {
                remote,
                auth,
                discovery,
                config,
                repos: Mutex::new(HashMap::new()),
                polls: Mutex::new(HashMap::new()),
                events,
                init: OnceCell::new(),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Subscribe to tracker events.
    ///
    /// Delivery is asynchronous; repositories still in `CheckingStatus` when
    /// `initialize` resolves report their final status through this channel.
    pub fn subscribe(&self) -> broadcast::Receiver<RepoIndexEvent> {
        self.inner.events.subscribe()
    }

    /// Discover repositories and perform one status check for each.
    ///
    /// Idempotent; concurrent callers all wait for the first run. Resolves
    /// once every discovered repository completed its first check, even if
    /// some are still polling a build.
    pub async fn initialize(&self) {
        self.inner
            .init
            .get_or_init(|| async {
                self.inner.discovery.settled().await;

                let roots = self.inner.discovery.repos();
                info!("repo index tracker: {} repositories discovered", roots.len());

                let mut handles: Vec<JoinHandle<()>> = Vec::new();
                for root in roots {
                    handles.push(self.spawn_init(root).await);
                }
                for handle in handles {
                    let _ = handle.await;
                }

                self.spawn_discovery_listener();
                self.try_auth_if_needed().await;

                let _ = self.inner.events.send(RepoIndexEvent::InitializationFinished);
            })
            .await;
    }

    /// Begin tracking a repository, resolving its remote from git state
    pub async fn open_repo(&self, root: PathBuf) {
        let _ = self.spawn_init(root).await;
    }

    /// Begin tracking a repository whose remote is already known
    pub async fn open_repo_with_remote(&self, root: PathBuf, remote: RemoteRepoId) {
        let _ = self.spawn_check(root, remote).await;
    }

    /// Stop tracking a repository
    pub async fn close_repo(&self, root: &Path) {
        if let Some(entry) = self.inner.repos.lock().await.remove(root) {
            entry.abort_task();
            let _ = self
                .inner
                .events
                .send(RepoIndexEvent::RepoRemoved(root.to_path_buf()));
        }
        if let Some(scope) = self.inner.polls.lock().await.remove(root) {
            scope.abort();
        }
    }

    /// Re-check one repository, optionally even when already `Ready`
    pub async fn refresh_repo(&self, root: &Path, force: bool) -> Result<()> {
        let remote = {
            let repos = self.inner.repos.lock().await;
            let entry = repos
                .get(root)
                .ok_or_else(|| RepoIndexError::UnknownRepo(root.display().to_string()))?;
            entry.remote().cloned()
        };
        let Some(remote) = remote else {
            return Ok(());
        };
        let token = self.inner.shutdown.child_token();
        self.update_repo_state_from_endpoint(root, &remote, force, &token)
            .await
    }

    /// One forced status check for a repository whose index is building,
    /// serialized with the background poller.
    ///
    /// The background poll task for `root` is stopped before the endpoint is
    /// queried, so only one poll request is ever in flight per repository;
    /// if the answer is still `BuildingIndex` the background poller is
    /// started again and keeps watching the build.
    pub async fn poll_build_once(&self, root: &Path) -> Result<()> {
        if let Some(scope) = self.inner.polls.lock().await.remove(root) {
            scope.abort();
        }
        self.refresh_repo(root, true).await
    }

    /// React to an authentication change by re-checking every repository
    /// whose status depended on the old credentials
    pub async fn auth_changed(&self) {
        let targets: Vec<(PathBuf, RemoteRepoId)> = {
            let repos = self.inner.repos.lock().await;
            repos
                .iter()
                .filter(|(_, entry)| {
                    matches!(
                        entry.status(),
                        RepoStatus::NotAuthorized | RepoStatus::CouldNotCheckIndexStatus
                    )
                })
                .filter_map(|(root, entry)| {
                    entry.remote().cloned().map(|remote| (root.clone(), remote))
                })
                .collect()
        };

        for (root, remote) in targets {
            let _ = self.spawn_check(root, remote).await;
        }
    }

    /// Query the remote status endpoint and fold the answer into the map.
    ///
    /// Skips the network round-trip when the repository is already `Ready`
    /// and `force` is false. Starts polling when the answer is
    /// `BuildingIndex`.
    pub async fn update_repo_state_from_endpoint(
        &self,
        root: &Path,
        remote: &RemoteRepoId,
        force: bool,
        token: &CancellationToken,
    ) -> Result<()> {
        if !force {
            let repos = self.inner.repos.lock().await;
            if let Some(entry) = repos.get(root) {
                if matches!(entry.status(), RepoStatus::Ready { .. }) {
                    return Ok(());
                }
            }
        }

        let Some(auth) = self.inner.auth.session(remote.provider, false).await else {
            self.set_entry(
                root,
                RepoEntry::NotAuthorized {
                    remote: remote.clone(),
                },
            )
            .await;
            return Ok(());
        };

        if token.is_cancelled() {
            return Err(RepoIndexError::Cancelled);
        }

        match self
            .inner
            .remote
            .get_index_state(&auth, remote, token)
            .await
        {
            Ok(state) => {
                self.apply_remote_state(root, remote, state).await;
                Ok(())
            }
            Err(RemoteApiError::Cancelled) => Err(RepoIndexError::Cancelled),
            Err(RemoteApiError::NotAuthorized) => {
                self.set_entry(
                    root,
                    RepoEntry::NotAuthorized {
                        remote: remote.clone(),
                    },
                )
                .await;
                Ok(())
            }
            Err(RemoteApiError::Unavailable(message)) => {
                warn!("index status check failed for {remote}: {message}");
                self.set_entry(
                    root,
                    RepoEntry::CouldNotCheckIndexStatus {
                        remote: remote.clone(),
                    },
                )
                .await;
                Ok(())
            }
        }
    }

    /// Request remote indexing for every repository that needs it.
    ///
    /// Precondition failures come back as a typed reason so callers can
    /// branch without parsing messages.
    pub async fn trigger_remote_indexing(
        &self,
        reason: &str,
    ) -> std::result::Result<(), TriggerIndexingError> {
        let snapshot: Vec<(PathBuf, Option<RemoteRepoId>, RepoStatus)> = {
            let repos = self.inner.repos.lock().await;
            repos
                .iter()
                .map(|(root, entry)| (root.clone(), entry.remote().cloned(), entry.status()))
                .collect()
        };

        if snapshot.is_empty() {
            return Err(TriggerIndexingError::NoGitRepos);
        }
        if snapshot
            .iter()
            .any(|(_, _, status)| !status.has_completed_check())
        {
            return Err(TriggerIndexingError::StillResolving);
        }

        let indexable: Vec<&(PathBuf, Option<RemoteRepoId>, RepoStatus)> = snapshot
            .iter()
            .filter(|(_, _, status)| {
                !matches!(status, RepoStatus::NotResolvable | RepoStatus::NotIndexable)
            })
            .collect();
        if indexable.is_empty() {
            return Err(TriggerIndexingError::NoRemoteIndexableRepos);
        }

        let mut sessions: HashMap<RemoteProviderKind, AuthSession> = HashMap::new();
        let providers: HashSet<RemoteProviderKind> = indexable
            .iter()
            .filter_map(|(_, remote, _)| remote.as_ref().map(|remote| remote.provider))
            .collect();
        for provider in providers {
            if let Some(session) = self.inner.auth.session(provider, false).await {
                sessions.insert(provider, session);
            }
        }
        if sessions.is_empty() {
            return Err(TriggerIndexingError::NoValidAuthToken);
        }

        if indexable
            .iter()
            .all(|(_, _, status)| matches!(status, RepoStatus::Ready { .. }))
        {
            return Err(TriggerIndexingError::AlreadyIndexed);
        }

        let not_yet: Vec<(PathBuf, RemoteRepoId)> = indexable
            .iter()
            .filter(|(_, _, status)| matches!(status, RepoStatus::NotYetIndexed))
            .filter_map(|(root, remote, _)| {
                remote.clone().map(|remote| (root.clone(), remote))
            })
            .collect();

        if not_yet.is_empty() {
            if indexable
                .iter()
                .any(|(_, _, status)| matches!(status, RepoStatus::BuildingIndex))
            {
                return Err(TriggerIndexingError::AlreadyIndexing);
            }
            return Err(TriggerIndexingError::CouldNotCheckIndexStatus);
        }

        for (root, remote) in not_yet {
            let Some(session) = sessions.get(&remote.provider) else {
                return Err(TriggerIndexingError::NoValidAuthToken);
            };
            match self
                .inner
                .remote
                .trigger_indexing(session, reason, &remote)
                .await
            {
                Ok(true) => {
                    info!("remote indexing accepted for {remote}");
                    self.set_entry(
                        &root,
                        RepoEntry::BuildingIndex {
                            remote: remote.clone(),
                        },
                    )
                    .await;
                    self.start_polling(root, remote).await;
                }
                Ok(false) => {
                    return Err(TriggerIndexingError::TriggerFailed {
                        repo: remote.to_string(),
                    });
                }
                Err(err) => {
                    warn!("indexing request failed for {remote}: {err}");
                    return Err(TriggerIndexingError::TriggerFailed {
                        repo: remote.to_string(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Prompt for authentication once per provider kind present among
    /// unauthorized repositories, then re-check those repositories
    pub async fn try_auth_if_needed(&self) {
        let kinds: HashSet<RemoteProviderKind> = {
            let repos = self.inner.repos.lock().await;
            repos
                .values()
                .filter(|entry| matches!(entry.status(), RepoStatus::NotAuthorized))
                .filter_map(|entry| entry.remote().map(|remote| remote.provider))
                .collect()
        };

        for kind in kinds {
            if self.inner.auth.session(kind, true).await.is_none() {
                debug!("authentication declined for {kind:?}");
                continue;
            }

            let targets: Vec<(PathBuf, RemoteRepoId)> = {
                let repos = self.inner.repos.lock().await;
                repos
                    .iter()
                    .filter(|(_, entry)| matches!(entry.status(), RepoStatus::NotAuthorized))
                    .filter_map(|(root, entry)| {
                        entry
                            .remote()
                            .filter(|remote| remote.provider == kind)
                            .cloned()
                            .map(|remote| (root.clone(), remote))
                    })
                    .collect()
            };
            for (root, remote) in targets {
                let token = self.inner.shutdown.child_token();
                if let Err(err) = self
                    .update_repo_state_from_endpoint(&root, &remote, true, &token)
                    .await
                {
                    debug!("post-auth status check failed for {remote}: {err}");
                }
            }
        }
    }

    /// Status snapshot for one repository
    pub async fn status(&self, root: &Path) -> Option<RepoStatus> {
        let repos = self.inner.repos.lock().await;
        repos.get(root).map(RepoEntry::status)
    }

    /// Status snapshot for every tracked repository
    pub async fn statuses(&self) -> HashMap<PathBuf, RepoStatus> {
        let repos = self.inner.repos.lock().await;
        repos
            .iter()
            .map(|(root, entry)| (root.clone(), entry.status()))
            .collect()
    }

    /// Repositories with a usable remote index, with their remotes
    pub async fn searchable_repos(&self) -> Vec<(PathBuf, RemoteRepoId, Option<String>)> {
        let repos = self.inner.repos.lock().await;
        repos
            .iter()
            .filter_map(|(root, entry)| match entry {
                RepoEntry::Ready {
                    remote,
                    indexed_commit,
                } => Some((root.clone(), remote.clone(), indexed_commit.clone())),
                _ => None,
            })
            .collect()
    }

    /// Aggregate status across all repositories, for status UIs
    pub async fn overall_status(&self) -> RemoteOverallStatus {
        let statuses = self.statuses().await;
        if statuses.is_empty() {
            return RemoteOverallStatus::NoRepos;
        }
        if statuses.values().any(|status| !status.has_completed_check()) {
            return RemoteOverallStatus::Resolving;
        }
        if statuses
            .values()
            .any(|status| matches!(status, RepoStatus::BuildingIndex))
        {
            return RemoteOverallStatus::Building;
        }

        let relevant: Vec<&RepoStatus> = statuses
            .values()
            .filter(|status| !matches!(status, RepoStatus::NotResolvable | RepoStatus::NotIndexable))
            .collect();
        if relevant.is_empty() {
            return RemoteOverallStatus::NotReady;
        }
        let ready = relevant
            .iter()
            .filter(|status| status.is_searchable())
            .count();
        if ready == relevant.len() {
            RemoteOverallStatus::Ready
        } else if ready > 0 {
            RemoteOverallStatus::PartiallyReady
        } else {
            RemoteOverallStatus::NotReady
        }
    }

    /// Cancel every background task owned by the tracker
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    async fn spawn_init(&self, root: PathBuf) -> JoinHandle<()> {
        let tracker = self.clone();
        let cancel = self.inner.shutdown.child_token();
        let task_cancel = cancel.clone();
        let task_root = root.clone();
        let (go_tx, go_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            // The entry must be in the map before the task touches it.
            if go_rx.await.is_err() {
                return;
            }
            tracker.run_init(task_root, task_cancel).await;
        });

        let scope = TaskScope::new(cancel, handle.abort_handle());
        {
            let mut repos = self.inner.repos.lock().await;
            if let Some(previous) =
                repos.insert(root.clone(), RepoEntry::Initializing { task: scope })
            {
                previous.abort_task();
            }
        }
        let _ = self.inner.events.send(RepoIndexEvent::RepoOpened(root));
        let _ = go_tx.send(());

        handle
    }

    async fn spawn_check(&self, root: PathBuf, remote: RemoteRepoId) -> JoinHandle<()> {
        let tracker = self.clone();
        let cancel = self.inner.shutdown.child_token();
        let task_cancel = cancel.clone();
        let task_root = root.clone();
        let task_remote = remote.clone();
        let (go_tx, go_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            if go_rx.await.is_err() {
                return;
            }
            if let Err(err) = tracker
                .update_repo_state_from_endpoint(&task_root, &task_remote, true, &task_cancel)
                .await
            {
                debug!("status check ended early for {task_remote}: {err}");
            }
        });

        let scope = TaskScope::new(cancel, handle.abort_handle());
        let known = {
            let mut repos = self.inner.repos.lock().await;
            let known = repos.contains_key(&root);
            if let Some(previous) = repos.insert(
                root.clone(),
                RepoEntry::CheckingStatus {
                    remote,
                    task: scope,
                },
            ) {
                previous.abort_task();
            }
            known
        };
        if known {
            let _ = self.inner.events.send(RepoIndexEvent::RepoUpdated {
                root,
                status: RepoStatus::CheckingStatus,
            });
        } else {
            let _ = self.inner.events.send(RepoIndexEvent::RepoOpened(root));
        }
        let _ = go_tx.send(());

        handle
    }

    async fn run_init(&self, root: PathBuf, cancel: CancellationToken) {
        let resolve_root = root.clone();
        let remote = tokio::task::spawn_blocking(move || git::resolve_remote(&resolve_root))
            .await
            .ok()
            .flatten();

        if cancel.is_cancelled() {
            return;
        }

        let Some(remote) = remote else {
            debug!("no searchable remote for {}", root.display());
            self.set_entry(&root, RepoEntry::NotResolvable).await;
            return;
        };

        self.transition_to_checking(&root, remote.clone()).await;
        if let Err(err) = self
            .update_repo_state_from_endpoint(&root, &remote, true, &cancel)
            .await
        {
            debug!("initial status check ended early for {remote}: {err}");
        }
    }

    /// Move an `Initializing` entry to `CheckingStatus`, keeping its task scope
    async fn transition_to_checking(&self, root: &Path, remote: RemoteRepoId) {
        let mut repos = self.inner.repos.lock().await;
        let Some(entry) = repos.remove(root) else {
            return;
        };
        match entry {
            RepoEntry::Initializing { task } => {
                repos.insert(root.to_path_buf(), RepoEntry::CheckingStatus { remote, task });
                drop(repos);
                let _ = self.inner.events.send(RepoIndexEvent::RepoUpdated {
                    root: root.to_path_buf(),
                    status: RepoStatus::CheckingStatus,
                });
            }
            other => {
                // Entry was replaced while we resolved; keep the newer one.
                repos.insert(root.to_path_buf(), other);
            }
        }
    }

    fn apply_remote_state<'a>(
        &'a self,
        root: &'a Path,
        remote: &'a RemoteRepoId,
        state: RemoteIndexState,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            match state.status {
                RemoteIndexStatus::Ready => {
                    self.set_entry(
                        root,
                        RepoEntry::Ready {
                            remote: remote.clone(),
                            indexed_commit: state.indexed_commit,
                        },
                    )
                    .await;
                }
                RemoteIndexStatus::NotYetIndexed => {
                    self.set_entry(
                        root,
                        RepoEntry::NotYetIndexed {
                            remote: remote.clone(),
                        },
                    )
                    .await;
                }
                RemoteIndexStatus::NotIndexable => {
                    self.set_entry(
                        root,
                        RepoEntry::NotIndexable {
                            remote: remote.clone(),
                        },
                    )
                    .await;
                }
                RemoteIndexStatus::BuildingIndex => {
                    self.set_entry(
                        root,
                        RepoEntry::BuildingIndex {
                            remote: remote.clone(),
                        },
                    )
                    .await;
                    self.start_polling(root.to_path_buf(), remote.clone()).await;
                }
            }
        })
    }

    async fn set_entry(&self, root: &Path, entry: RepoEntry) {
        let status = entry.status();
        let changed = {
            let mut repos = self.inner.repos.lock().await;
            let previous = repos.insert(root.to_path_buf(), entry);
            previous.map(|previous| previous.status()) != Some(status.clone())
        };
        if changed {
            debug!("{} -> {status:?}", root.display());
            let _ = self.inner.events.send(RepoIndexEvent::RepoUpdated {
                root: root.to_path_buf(),
                status,
            });
        }
    }

    /// Start (or restart) the build poll for one repository.
    ///
    /// Ticks are strictly sequential: the next poll is not scheduled until
    /// the previous status call returned.
    async fn start_polling(&self, root: PathBuf, remote: RemoteRepoId) {
        let cancel = self.inner.shutdown.child_token();
        let task_cancel = cancel.clone();
        let tracker = self.clone();
        let task_root = root.clone();

        let handle = tokio::spawn(async move {
            tracker.run_poll(task_root, remote, task_cancel).await;
        });

        let mut polls = self.inner.polls.lock().await;
        if let Some(previous) = polls.insert(root, TaskScope::new(cancel, handle.abort_handle())) {
            previous.abort();
        }
    }

    fn run_poll(
        &self,
        root: PathBuf,
        remote: RemoteRepoId,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let interval = Duration::from_millis(self.inner.config.poll_interval_ms);

            for attempt in 0..self.inner.config.poll_attempt_cap {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }

                let Some(auth) = self.inner.auth.session(remote.provider, false).await else {
                    self.set_entry(
                        &root,
                        RepoEntry::NotAuthorized {
                            remote: remote.clone(),
                        },
                    )
                    .await;
                    return;
                };

                match self
                    .inner
                    .remote
                    .get_index_state(&auth, &remote, &cancel)
                    .await
                {
                    Ok(state) if state.status == RemoteIndexStatus::BuildingIndex => {
                        debug!("{remote} still building (poll {attempt})");
                    }
                    Ok(state) => {
                        self.apply_remote_state(&root, &remote, state).await;
                        return;
                    }
                    Err(RemoteApiError::Cancelled) => return,
                    Err(RemoteApiError::NotAuthorized) => {
                        self.set_entry(
                            &root,
                            RepoEntry::NotAuthorized {
                                remote: remote.clone(),
                            },
                        )
                        .await;
                        return;
                    }
                    Err(RemoteApiError::Unavailable(message)) => {
                        debug!("poll failed for {remote}: {message}");
                    }
                }
            }

            warn!(
                "gave up polling {remote} after {} attempts",
                self.inner.config.poll_attempt_cap
            );
            self.set_entry(
                &root,
                RepoEntry::CouldNotCheckIndexStatus {
                    remote: remote.clone(),
                },
            )
            .await;
        })
    }

    fn spawn_discovery_listener(&self) {
        let tracker = self.clone();
        let mut events = self.inner.discovery.subscribe();
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    event = events.recv() => match event {
                        Ok(RepoEvent::Opened(root)) => {
                            let _ = tracker.spawn_init(root).await;
                        }
                        Ok(RepoEvent::Closed(root)) => {
                            tracker.close_repo(&root).await;
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("repo discovery events lagged by {skipped}");
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                }
            }
        });
    }

    #[cfg(test)]
    pub(crate) async fn insert_entry_for_tests(&self, root: PathBuf, entry: RepoEntry) {
        self.inner.repos.lock().await.insert(root, entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use codescout_protocol::RemoteSearchHit;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedRemote {
        responses: Mutex<VecDeque<std::result::Result<RemoteIndexState, RemoteApiError>>>,
        steady: std::result::Result<RemoteIndexState, RemoteApiError>,
        status_calls: AtomicUsize,
        accept_trigger: bool,
    }

    impl ScriptedRemote {
        fn steady(state: RemoteIndexState) -> Self {
            Self {
                responses: Mutex::new(VecDeque::new()),
                steady: Ok(state),
                status_calls: AtomicUsize::new(0),
                accept_trigger: true,
            }
        }

        fn scripted(
            responses: Vec<std::result::Result<RemoteIndexState, RemoteApiError>>,
            steady: std::result::Result<RemoteIndexState, RemoteApiError>,
        ) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                steady,
                status_calls: AtomicUsize::new(0),
                accept_trigger: true,
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
        ) -> std::result::Result<RemoteIndexState, RemoteApiError> {
            self.status_calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().await;
            responses.pop_front().unwrap_or_else(|| self.steady.clone())
        }

        async fn trigger_indexing(
            &self,
            _auth: &AuthSession,
            _reason: &str,
            _repo: &RemoteRepoId,
        ) -> std::result::Result<bool, RemoteApiError> {
            Ok(self.accept_trigger)
        }

        async fn search_repo(
            &self,
            _auth: &AuthSession,
            _repo: &RemoteRepoId,
            _query: &str,
            _max_results: usize,
            _token: &CancellationToken,
        ) -> std::result::Result<RemoteSearchHit, RemoteApiError> {
            Ok(RemoteSearchHit::default())
        }
    }

    struct StaticAuth {
        silent: bool,
        interactive: bool,
        prompts: AtomicUsize,
        cached_grant: std::sync::atomic::AtomicBool,
    }

    impl StaticAuth {
        fn granting() -> Self {
            Self {
                silent: true,
                interactive: true,
                prompts: AtomicUsize::new(0),
                cached_grant: std::sync::atomic::AtomicBool::new(false),
            }
        }

        fn interactive_only() -> Self {
            Self {
                silent: false,
                interactive: true,
                prompts: AtomicUsize::new(0),
                cached_grant: std::sync::atomic::AtomicBool::new(false),
            }
        }

        fn denying() -> Self {
            Self {
                silent: false,
                interactive: false,
                prompts: AtomicUsize::new(0),
                cached_grant: std::sync::atomic::AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl AuthProvider for StaticAuth {
        async fn session(
            &self,
            _provider: RemoteProviderKind,
            interactive: bool,
        ) -> Option<AuthSession> {
            let granted = if interactive {
                self.prompts.fetch_add(1, Ordering::SeqCst);
                if self.interactive {
                    // A successful prompt leaves a cached session behind.
                    self.cached_grant.store(true, Ordering::SeqCst);
                }
                self.interactive
            } else {
                self.silent || self.cached_grant.load(Ordering::SeqCst)
            };
            granted.then(|| AuthSession {
                token: "token".to_string(),
            })
        }
    }

    struct StaticDiscovery {
        roots: Vec<PathBuf>,
        events: broadcast::Sender<RepoEvent>,
    }

    impl StaticDiscovery {
        fn empty() -> Self {
            let (events, _) = broadcast::channel(8);
            Self {
                roots: Vec::new(),
                events,
            }
        }
    }

    #[async_trait]
    impl RepoDiscovery for StaticDiscovery {
        async fn settled(&self) {}

        fn repos(&self) -> Vec<PathBuf> {
            self.roots.clone()
        }

        fn subscribe(&self) -> broadcast::Receiver<RepoEvent> {
            self.events.subscribe()
        }
    }

    fn remote_id() -> RemoteRepoId {
        RemoteRepoId::new(RemoteProviderKind::GitHub, "octo", "spoon")
    }

    fn ready_state(commit: &str) -> RemoteIndexState {
        RemoteIndexState {
            status: RemoteIndexStatus::Ready,
            indexed_commit: Some(commit.to_string()),
        }
    }

    fn building_state() -> RemoteIndexState {
        RemoteIndexState {
            status: RemoteIndexStatus::BuildingIndex,
            indexed_commit: None,
        }
    }

    fn tracker_with(
        remote: ScriptedRemote,
        auth: StaticAuth,
        config: RepoIndexConfig,
    ) -> (RepoIndexTracker, Arc<ScriptedRemote>) {
        let remote = Arc::new(remote);
        let tracker = RepoIndexTracker::new(
            remote.clone(),
            Arc::new(auth),
            Arc::new(StaticDiscovery::empty()),
            config,
        )
        .expect("config should be valid");
        (tracker, remote)
    }

    async fn wait_for<F>(tracker: &RepoIndexTracker, root: &Path, predicate: F) -> RepoStatus
    where
        F: Fn(&RepoStatus) -> bool,
    {
        for _ in 0..200 {
            if let Some(status) = tracker.status(root).await {
                if predicate(&status) {
                    return status;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        tracker
            .status(root)
            .await
            .expect("repository should be tracked")
    }

    async fn dummy_scope() -> TaskScope {
        let handle = tokio::spawn(async {});
        let scope = TaskScope::new(CancellationToken::new(), handle.abort_handle());
        let _ = handle.await;
        scope
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_open_repo_reaches_ready() {
        let (tracker, remote) = tracker_with(
            ScriptedRemote::steady(ready_state("abc123")),
            StaticAuth::granting(),
            RepoIndexConfig::default(),
        );
        let root = PathBuf::from("/ws/spoon");

        tracker.open_repo_with_remote(root.clone(), remote_id()).await;
        let status = wait_for(&tracker, &root, RepoStatus::is_searchable).await;

        assert_eq!(
            status,
            RepoStatus::Ready {
                indexed_commit: Some("abc123".to_string())
            }
        );
        assert_eq!(remote.status_calls.load(Ordering::SeqCst), 1);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_missing_auth_marks_not_authorized() {
        let (tracker, remote) = tracker_with(
            ScriptedRemote::steady(ready_state("abc123")),
            StaticAuth::denying(),
            RepoIndexConfig::default(),
        );
        let root = PathBuf::from("/ws/spoon");

        tracker.open_repo_with_remote(root.clone(), remote_id()).await;
        let status = wait_for(&tracker, &root, |status| {
            *status == RepoStatus::NotAuthorized
        })
        .await;

        assert_eq!(status, RepoStatus::NotAuthorized);
        // No network call happens without a session.
        assert_eq!(remote.status_calls.load(Ordering::SeqCst), 0);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_poll_cap_downgrades_status() {
        let config = RepoIndexConfig {
            poll_attempt_cap: 5,
            ..Default::default()
        };
        let (tracker, remote) = tracker_with(
            ScriptedRemote::steady(building_state()),
            StaticAuth::granting(),
            config,
        );
        let root = PathBuf::from("/ws/spoon");

        tracker.open_repo_with_remote(root.clone(), remote_id()).await;
        let status = wait_for(&tracker, &root, |status| {
            *status == RepoStatus::CouldNotCheckIndexStatus
        })
        .await;

        assert_eq!(status, RepoStatus::CouldNotCheckIndexStatus);
        // One initial check plus exactly `poll_attempt_cap` polls.
        assert_eq!(remote.status_calls.load(Ordering::SeqCst), 6);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_poll_stops_on_ready() {
        let (tracker, remote) = tracker_with(
            ScriptedRemote::scripted(
                vec![
                    Ok(building_state()),
                    Ok(building_state()),
                    Ok(ready_state("def456")),
                ],
                Ok(ready_state("def456")),
            ),
            StaticAuth::granting(),
            RepoIndexConfig::default(),
        );
        let root = PathBuf::from("/ws/spoon");

        tracker.open_repo_with_remote(root.clone(), remote_id()).await;
        let status = wait_for(&tracker, &root, RepoStatus::is_searchable).await;

        assert_eq!(
            status,
            RepoStatus::Ready {
                indexed_commit: Some("def456".to_string())
            }
        );
        // Polling stopped at the first terminal answer.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(remote.status_calls.load(Ordering::SeqCst), 3);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_poll_build_once_owns_the_poll_slot() {
        let (tracker, remote) = tracker_with(
            ScriptedRemote::steady(building_state()),
            StaticAuth::granting(),
            RepoIndexConfig::default(),
        );
        let root = PathBuf::from("/ws/spoon");

        tracker.open_repo_with_remote(root.clone(), remote_id()).await;
        let status = wait_for(&tracker, &root, |status| {
            *status == RepoStatus::BuildingIndex
        })
        .await;
        assert_eq!(status, RepoStatus::BuildingIndex);
        let after_open = remote.status_calls.load(Ordering::SeqCst);

        // The foreground check displaces the background poller and issues
        // exactly one status call of its own.
        tracker
            .poll_build_once(&root)
            .await
            .expect("repo is tracked");
        assert_eq!(remote.status_calls.load(Ordering::SeqCst), after_open + 1);

        // Still building, so the slot goes back to the background poller.
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(remote.status_calls.load(Ordering::SeqCst) > after_open + 1);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_transient_poll_errors_are_retried() {
        let (tracker, _remote) = tracker_with(
            ScriptedRemote::scripted(
                vec![
                    Ok(building_state()),
                    Err(RemoteApiError::Unavailable("flaky".to_string())),
                    Ok(ready_state("abc123")),
                ],
                Ok(ready_state("abc123")),
            ),
            StaticAuth::granting(),
            RepoIndexConfig::default(),
        );
        let root = PathBuf::from("/ws/spoon");

        tracker.open_repo_with_remote(root.clone(), remote_id()).await;
        let status = wait_for(&tracker, &root, RepoStatus::is_searchable).await;
        assert!(status.is_searchable());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_trigger_with_no_repos() {
        let (tracker, _remote) = tracker_with(
            ScriptedRemote::steady(ready_state("abc123")),
            StaticAuth::granting(),
            RepoIndexConfig::default(),
        );

        assert_eq!(
            tracker.trigger_remote_indexing("test").await,
            Err(TriggerIndexingError::NoGitRepos)
        );
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_trigger_while_resolving() {
        let (tracker, _remote) = tracker_with(
            ScriptedRemote::steady(ready_state("abc123")),
            StaticAuth::granting(),
            RepoIndexConfig::default(),
        );
        tracker
            .insert_entry_for_tests(
                PathBuf::from("/ws/spoon"),
                RepoEntry::CheckingStatus {
                    remote: remote_id(),
                    task: dummy_scope().await,
                },
            )
            .await;

        assert_eq!(
            tracker.trigger_remote_indexing("test").await,
            Err(TriggerIndexingError::StillResolving)
        );
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_trigger_with_no_indexable_repos() {
        let (tracker, _remote) = tracker_with(
            ScriptedRemote::steady(ready_state("abc123")),
            StaticAuth::granting(),
            RepoIndexConfig::default(),
        );
        tracker
            .insert_entry_for_tests(PathBuf::from("/ws/spoon"), RepoEntry::NotResolvable)
            .await;
        tracker
            .insert_entry_for_tests(
                PathBuf::from("/ws/fork"),
                RepoEntry::NotIndexable {
                    remote: remote_id(),
                },
            )
            .await;

        assert_eq!(
            tracker.trigger_remote_indexing("test").await,
            Err(TriggerIndexingError::NoRemoteIndexableRepos)
        );
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_trigger_without_auth() {
        let (tracker, _remote) = tracker_with(
            ScriptedRemote::steady(ready_state("abc123")),
            StaticAuth::denying(),
            RepoIndexConfig::default(),
        );
        tracker
            .insert_entry_for_tests(
                PathBuf::from("/ws/spoon"),
                RepoEntry::NotYetIndexed {
                    remote: remote_id(),
                },
            )
            .await;

        assert_eq!(
            tracker.trigger_remote_indexing("test").await,
            Err(TriggerIndexingError::NoValidAuthToken)
        );
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_trigger_when_already_indexed() {
        let (tracker, _remote) = tracker_with(
            ScriptedRemote::steady(ready_state("abc123")),
            StaticAuth::granting(),
            RepoIndexConfig::default(),
        );
        tracker
            .insert_entry_for_tests(
                PathBuf::from("/ws/spoon"),
                RepoEntry::Ready {
                    remote: remote_id(),
                    indexed_commit: Some("abc123".to_string()),
                },
            )
            .await;

        assert_eq!(
            tracker.trigger_remote_indexing("test").await,
            Err(TriggerIndexingError::AlreadyIndexed)
        );
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_trigger_when_already_indexing() {
        let (tracker, _remote) = tracker_with(
            ScriptedRemote::steady(building_state()),
            StaticAuth::granting(),
            RepoIndexConfig::default(),
        );
        tracker
            .insert_entry_for_tests(
                PathBuf::from("/ws/spoon"),
                RepoEntry::BuildingIndex {
                    remote: remote_id(),
                },
            )
            .await;

        assert_eq!(
            tracker.trigger_remote_indexing("test").await,
            Err(TriggerIndexingError::AlreadyIndexing)
        );
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_trigger_when_status_unknown() {
        let (tracker, _remote) = tracker_with(
            ScriptedRemote::steady(ready_state("abc123")),
            StaticAuth::granting(),
            RepoIndexConfig::default(),
        );
        tracker
            .insert_entry_for_tests(
                PathBuf::from("/ws/spoon"),
                RepoEntry::CouldNotCheckIndexStatus {
                    remote: remote_id(),
                },
            )
            .await;

        assert_eq!(
            tracker.trigger_remote_indexing("test").await,
            Err(TriggerIndexingError::CouldNotCheckIndexStatus)
        );
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_trigger_starts_build_and_polling() {
        let (tracker, _remote) = tracker_with(
            ScriptedRemote::scripted(
                vec![Ok(building_state())],
                Ok(ready_state("abc123")),
            ),
            StaticAuth::granting(),
            RepoIndexConfig::default(),
        );
        let root = PathBuf::from("/ws/spoon");
        tracker
            .insert_entry_for_tests(
                root.clone(),
                RepoEntry::NotYetIndexed {
                    remote: remote_id(),
                },
            )
            .await;

        tracker
            .trigger_remote_indexing("test")
            .await
            .expect("trigger should succeed");
        assert_eq!(
            tracker.status(&root).await,
            Some(RepoStatus::BuildingIndex)
        );

        // Polling picks up the eventual Ready answer.
        let status = wait_for(&tracker, &root, RepoStatus::is_searchable).await;
        assert!(status.is_searchable());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_trigger_rejection_is_reported() {
        let mut remote = ScriptedRemote::steady(ready_state("abc123"));
        remote.accept_trigger = false;
        let (tracker, _remote) =
            tracker_with(remote, StaticAuth::granting(), RepoIndexConfig::default());
        tracker
            .insert_entry_for_tests(
                PathBuf::from("/ws/spoon"),
                RepoEntry::NotYetIndexed {
                    remote: remote_id(),
                },
            )
            .await;

        assert_eq!(
            tracker.trigger_remote_indexing("test").await,
            Err(TriggerIndexingError::TriggerFailed {
                repo: "octo/spoon".to_string()
            })
        );
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_auth_prompted_once_per_provider() {
        let auth = Arc::new(StaticAuth::interactive_only());
        let remote = Arc::new(ScriptedRemote::steady(ready_state("abc123")));
        let tracker = RepoIndexTracker::new(
            remote,
            auth.clone(),
            Arc::new(StaticDiscovery::empty()),
            RepoIndexConfig::default(),
        )
        .expect("config should be valid");
        tracker
            .insert_entry_for_tests(
                PathBuf::from("/ws/spoon"),
                RepoEntry::NotAuthorized {
                    remote: remote_id(),
                },
            )
            .await;
        tracker
            .insert_entry_for_tests(
                PathBuf::from("/ws/fork"),
                RepoEntry::NotAuthorized {
                    remote: RemoteRepoId::new(RemoteProviderKind::GitHub, "octo", "fork"),
                },
            )
            .await;

        tracker.try_auth_if_needed().await;

        // One prompt covers both repositories of the same provider, and the
        // cached session lets the forced re-checks succeed.
        assert_eq!(auth.prompts.load(Ordering::SeqCst), 1);
        let spoon = wait_for(&tracker, Path::new("/ws/spoon"), RepoStatus::is_searchable).await;
        let fork = wait_for(&tracker, Path::new("/ws/fork"), RepoStatus::is_searchable).await;
        assert!(spoon.is_searchable());
        assert!(fork.is_searchable());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_auth_change_recovers_unauthorized_repo() {
        let (tracker, _remote) = tracker_with(
            ScriptedRemote::steady(ready_state("abc123")),
            StaticAuth::granting(),
            RepoIndexConfig::default(),
        );
        let root = PathBuf::from("/ws/spoon");
        tracker
            .insert_entry_for_tests(
                root.clone(),
                RepoEntry::NotAuthorized {
                    remote: remote_id(),
                },
            )
            .await;

        tracker.auth_changed().await;

        let status = wait_for(&tracker, &root, RepoStatus::is_searchable).await;
        assert!(status.is_searchable());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_overall_status_aggregation() {
        let (tracker, _remote) = tracker_with(
            ScriptedRemote::steady(ready_state("abc123")),
            StaticAuth::granting(),
            RepoIndexConfig::default(),
        );
        assert_eq!(tracker.overall_status().await, RemoteOverallStatus::NoRepos);

        tracker
            .insert_entry_for_tests(
                PathBuf::from("/ws/spoon"),
                RepoEntry::Ready {
                    remote: remote_id(),
                    indexed_commit: None,
                },
            )
            .await;
        assert_eq!(tracker.overall_status().await, RemoteOverallStatus::Ready);

        tracker
            .insert_entry_for_tests(
                PathBuf::from("/ws/fork"),
                RepoEntry::NotYetIndexed {
                    remote: remote_id(),
                },
            )
            .await;
        assert_eq!(
            tracker.overall_status().await,
            RemoteOverallStatus::PartiallyReady
        );
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_initialize_is_idempotent() {
        let (tracker, _remote) = tracker_with(
            ScriptedRemote::steady(ready_state("abc123")),
            StaticAuth::granting(),
            RepoIndexConfig::default(),
        );
        let mut events = tracker.subscribe();

        tracker.initialize().await;
        tracker.initialize().await;

        assert_eq!(
            events.recv().await,
            Ok(RepoIndexEvent::InitializationFinished)
        );
        // The second call must not emit a second finished event.
        assert!(events.try_recv().is_err());
    }
}
