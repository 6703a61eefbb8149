use codescout_protocol::RemoteRepoId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

/// Cancellation scope of a background task owned by a repository entry.
///
/// Aborting cancels the token first so in-flight network calls unwind before
/// the task itself is torn down.
#[derive(Debug)]
pub(crate) struct TaskScope {
    cancel: CancellationToken,
    abort: AbortHandle,
}

impl TaskScope {
    pub(crate) fn new(cancel: CancellationToken, abort: AbortHandle) -> Self {
        Self { cancel, abort }
    }

    pub(crate) fn abort(&self) {
        self.cancel.cancel();
        self.abort.abort();
    }
}

/// Internal per-repository entry.
///
/// Task handles live only on the transient statuses; exactly one live init
/// task exists per repository root at any time.
#[derive(Debug)]
pub(crate) enum RepoEntry {
    /// No usable remote could be resolved for this repository
    NotResolvable,
    /// Resolving the remote; carries the init task
    Initializing { task: TaskScope },
    /// Remote resolved, first status check in flight; carries the init task
    CheckingStatus {
        remote: RemoteRepoId,
        task: TaskScope,
    },
    /// The service knows the repo but has not indexed it
    NotYetIndexed { remote: RemoteRepoId },
    /// The service refuses to index the repo
    NotIndexable { remote: RemoteRepoId },
    /// Status endpoint unreachable or polling gave up
    CouldNotCheckIndexStatus { remote: RemoteRepoId },
    /// No valid authentication for the repo's provider
    NotAuthorized { remote: RemoteRepoId },
    /// An index build is in progress and being polled
    BuildingIndex { remote: RemoteRepoId },
    /// A usable index exists
    Ready {
        remote: RemoteRepoId,
        indexed_commit: Option<String>,
    },
}

impl RepoEntry {
    /// The resolved remote, when resolution got that far
    pub(crate) fn remote(&self) -> Option<&RemoteRepoId> {
        match self {
            RepoEntry::NotResolvable | RepoEntry::Initializing { .. } => None,
            RepoEntry::CheckingStatus { remote, .. }
            | RepoEntry::NotYetIndexed { remote }
            | RepoEntry::NotIndexable { remote }
            | RepoEntry::CouldNotCheckIndexStatus { remote }
            | RepoEntry::NotAuthorized { remote }
            | RepoEntry::BuildingIndex { remote }
            | RepoEntry::Ready { remote, .. } => Some(remote),
        }
    }

    /// Abort any task the entry owns
    pub(crate) fn abort_task(&self) {
        match self {
            RepoEntry::Initializing { task } | RepoEntry::CheckingStatus { task, .. } => {
                task.abort();
            }
            _ => {}
        }
    }

    /// Public projection of the entry
    pub(crate) fn status(&self) -> RepoStatus {
        match self {
            RepoEntry::NotResolvable => RepoStatus::NotResolvable,
            RepoEntry::Initializing { .. } => RepoStatus::Initializing,
            RepoEntry::CheckingStatus { .. } => RepoStatus::CheckingStatus,
            RepoEntry::NotYetIndexed { .. } => RepoStatus::NotYetIndexed,
            RepoEntry::NotIndexable { .. } => RepoStatus::NotIndexable,
            RepoEntry::CouldNotCheckIndexStatus { .. } => RepoStatus::CouldNotCheckIndexStatus,
            RepoEntry::NotAuthorized { .. } => RepoStatus::NotAuthorized,
            RepoEntry::BuildingIndex { .. } => RepoStatus::BuildingIndex,
            RepoEntry::Ready { indexed_commit, .. } => RepoStatus::Ready {
                indexed_commit: indexed_commit.clone(),
            },
        }
    }
}

/// Read-only repository index status.
///
/// `indexed_commit` exists only on `Ready`; it may still be `None` for an
/// empty repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepoStatus {
    NotResolvable,
    Initializing,
    CheckingStatus,
    NotYetIndexed,
    NotIndexable,
    CouldNotCheckIndexStatus,
    NotAuthorized,
    BuildingIndex,
    Ready { indexed_commit: Option<String> },
}

impl RepoStatus {
    /// Whether the status can still change without an external reset
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RepoStatus::Initializing | RepoStatus::CheckingStatus | RepoStatus::BuildingIndex
        )
    }

    /// Whether at least one status check has completed for the repository
    pub fn has_completed_check(&self) -> bool {
        !matches!(self, RepoStatus::Initializing | RepoStatus::CheckingStatus)
    }

    /// Whether remote search can run against the repository right now
    pub fn is_searchable(&self) -> bool {
        matches!(self, RepoStatus::Ready { .. })
    }
}

/// Aggregate remote index state across all tracked repositories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteOverallStatus {
    /// No repositories tracked
    NoRepos,
    /// At least one repository is still resolving or checking
    Resolving,
    /// At least one repository is building its index
    Building,
    /// Every resolvable repository has a usable index
    Ready,
    /// Some repositories have an index, some do not
    PartiallyReady,
    /// No repository has a usable index
    NotReady,
}

/// Tracker notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepoIndexEvent {
    /// A repository was discovered and is being resolved
    RepoOpened(PathBuf),
    /// A repository's status changed
    RepoUpdated { root: PathBuf, status: RepoStatus },
    /// A repository was closed and dropped from tracking
    RepoRemoved(PathBuf),
    /// `initialize` finished its one status check per discovered repository
    InitializationFinished,
}
