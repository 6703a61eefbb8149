use crate::config::RepoIndexConfig;
use crate::git;
use crate::state::{RepoIndexEvent, RepoStatus};
use crate::tracker::RepoIndexTracker;
use codescout_protocol::{FileEvent, WorkspaceFiles};
use log::{debug, warn};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Version-control answers the diff tracker needs.
///
/// Implementations are synchronous; the tracker moves them off the event
/// loop itself.
pub trait VcsDiffSource: Send + Sync {
    /// Files that differ between `base` and the working tree
    fn changed_files(&self, root: &Path, base: &str) -> anyhow::Result<HashSet<PathBuf>>;

    /// The upstream tracking ref of the current branch, if configured
    fn upstream_ref(&self, root: &Path) -> Option<String>;
}

/// [`VcsDiffSource`] backed by the git CLI
pub struct GitDiffSource;

impl VcsDiffSource for GitDiffSource {
    fn changed_files(&self, root: &Path, base: &str) -> anyhow::Result<HashSet<PathBuf>> {
        git::changed_files(root, base)
    }

    fn upstream_ref(&self, root: &Path) -> Option<String> {
        git::upstream_ref(root)
    }
}

/// Per-repository diff snapshot
#[derive(Debug, Default)]
struct RepoDiffState {
    /// Files differing from the base the remote index covers
    files: HashSet<PathBuf>,

    /// Last refresh failed; the stale set is kept and retried next cycle
    failed: bool,
}

/// Tracks which files differ from the commit the remote index covers.
///
/// Repository diffs come from version control; on top of those a rolling set
/// of locally-changed files is fed by workspace file events, so an edit is
/// visible to availability decisions before the next git refresh lands.
#[derive(Clone)]
pub struct DiffTracker {
    inner: Arc<DiffInner>,
}

struct DiffInner {
    tracker: RepoIndexTracker,
    files: Arc<dyn WorkspaceFiles>,
    vcs: Arc<dyn VcsDiffSource>,
    refresh_interval: Duration,
    repos: Mutex<HashMap<PathBuf, RepoDiffState>>,
    local_changes: Mutex<HashSet<PathBuf>>,
    shutdown: CancellationToken,
}

impl DiffTracker {
    /// Create a new diff tracker; call [`DiffTracker::start`] to begin refreshing
    pub fn new(
        tracker: RepoIndexTracker,
        files: Arc<dyn WorkspaceFiles>,
        vcs: Arc<dyn VcsDiffSource>,
        config: &RepoIndexConfig,
    ) -> Self {
        Self {
            inner: Arc::new(DiffInner {
                tracker,
                files,
                vcs,
                refresh_interval: Duration::from_millis(config.diff_refresh_interval_ms),
                repos: Mutex::new(HashMap::new()),
                local_changes: Mutex::new(HashSet::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Start the background refresh loop.
    ///
    /// One task owns every refresh, so repository diffs are recomputed
    /// strictly sequentially: on a fixed interval, on every tracker status
    /// update, and as workspace file events arrive.
    pub fn start(&self) {
        let this = self.clone();
        let mut tracker_events = self.inner.tracker.subscribe();
        let mut file_events = self.inner.files.subscribe();
        let shutdown = self.inner.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.inner.refresh_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => {
                        this.refresh_all().await;
                    }
                    event = tracker_events.recv() => match event {
                        Ok(RepoIndexEvent::RepoUpdated { root, status }) => {
                            if status.has_completed_check() {
                                this.refresh_repo(&root).await;
                            }
                        }
                        Ok(RepoIndexEvent::RepoRemoved(root)) => {
                            this.forget_repo(&root).await;
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("diff tracker lagged {skipped} tracker events, refreshing all");
                            this.refresh_all().await;
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                    event = file_events.recv() => match event {
                        Ok(event) => this.on_file_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("diff tracker lagged {skipped} file events");
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                }
            }
        });
    }

    /// Stop the background refresh loop
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Files currently known to differ from the remote-indexed state.
    ///
    /// `None` means no repository has completed a status check yet, so there
    /// is no base to diff against and callers must not assume anything.
    pub async fn diff_files(&self) -> Option<HashSet<PathBuf>> {
        let repos = self.inner.repos.lock().await;
        if repos.is_empty() {
            return None;
        }

        let mut files: HashSet<PathBuf> = repos
            .values()
            .flat_map(|state| state.files.iter().cloned())
            .collect();
        drop(repos);

        let local = self.inner.local_changes.lock().await;
        files.extend(local.iter().cloned());
        Some(files)
    }

    /// Recompute the diff for every repository that completed a status check
    pub async fn refresh_all(&self) {
        let roots: Vec<PathBuf> = self
            .inner
            .tracker
            .statuses()
            .await
            .into_iter()
            .filter(|(_, status)| status.has_completed_check())
            .map(|(root, _)| root)
            .collect();
        for root in roots {
            self.refresh_repo(&root).await;
        }
    }

    async fn forget_repo(&self, root: &Path) {
        self.inner.repos.lock().await.remove(root);
        let mut local = self.inner.local_changes.lock().await;
        local.retain(|path| !path.starts_with(root));
    }

    async fn on_file_event(&self, event: FileEvent) {
        match event {
            FileEvent::Created(path) | FileEvent::Changed(path) => {
                if self.inner.files.is_eligible(&path) {
                    self.inner.local_changes.lock().await.insert(path);
                }
            }
            FileEvent::Deleted(path) => {
                self.inner.local_changes.lock().await.remove(&path);
            }
        }
    }

    /// Recompute one repository's diff and prune the local-change set.
    ///
    /// A refresh failure keeps the previous file set and marks the entry
    /// failed; the next cycle retries.
    async fn refresh_repo(&self, root: &Path) {
        let Some(status) = self.inner.tracker.status(root).await else {
            return;
        };
        if !status.has_completed_check() {
            return;
        }

        let base = match &status {
            RepoStatus::Ready {
                indexed_commit: Some(commit),
            } => Some(commit.clone()),
            // Not indexed yet (or an empty repo): the upstream ref is the
            // best stand-in for what a future index would cover.
            _ => {
                let vcs = self.inner.vcs.clone();
                let upstream_root = root.to_path_buf();
                tokio::task::spawn_blocking(move || vcs.upstream_ref(&upstream_root))
                    .await
                    .ok()
                    .flatten()
            }
        };

        let changed = match base {
            Some(base) => {
                let vcs = self.inner.vcs.clone();
                let diff_root = root.to_path_buf();
                match tokio::task::spawn_blocking(move || vcs.changed_files(&diff_root, &base))
                    .await
                {
                    Ok(Ok(files)) => Some(files),
                    Ok(Err(err)) => {
                        debug!("diff refresh failed for {}: {err:#}", root.display());
                        None
                    }
                    Err(err) => {
                        debug!("diff refresh task failed for {}: {err}", root.display());
                        None
                    }
                }
            }
            // No base to compare against: nothing can be stale.
            None => Some(HashSet::new()),
        };

        let mut repos = self.inner.repos.lock().await;
        let state = repos.entry(root.to_path_buf()).or_default();
        match changed {
            Some(changed) => {
                let eligible: HashSet<PathBuf> = changed
                    .into_iter()
                    .filter(|path| self.inner.files.is_eligible(path))
                    .collect();
                state.files = eligible.clone();
                state.failed = false;
                drop(repos);

                // A locally-edited file leaves the rolling set only once the
                // refreshed diff agrees it is unchanged and no editor holds
                // unsaved content for it.
                let mut local = self.inner.local_changes.lock().await;
                local.retain(|path| {
                    !path.starts_with(root)
                        || eligible.contains(path)
                        || self.inner.files.is_dirty(path)
                });
            }
            None => {
                state.failed = true;
            }
        }
    }
}
