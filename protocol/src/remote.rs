use crate::auth::{AuthSession, RemoteProviderKind};
use crate::chunk::ScoredChunk;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Identity of a repository on a remote hosting provider
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteRepoId {
    /// Hosting provider the repository lives on
    pub provider: RemoteProviderKind,

    /// Repository owner (user or organization)
    pub owner: String,

    /// Repository name
    pub name: String,
}

impl RemoteRepoId {
    /// Create a new repository id
    pub fn new(
        provider: RemoteProviderKind,
        owner: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            owner: owner.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for RemoteRepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// Index status as reported by the remote service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteIndexStatus {
    /// The repository could be indexed but nobody asked yet
    NotYetIndexed,
    /// An index build is in progress
    BuildingIndex,
    /// A usable index exists
    Ready,
    /// The service refuses to index this repository
    NotIndexable,
}

/// Full index state reported by the remote service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteIndexState {
    /// Current status
    pub status: RemoteIndexStatus,

    /// Commit the index covers; present only once `Ready`, and may be
    /// absent even then for an empty repository
    pub indexed_commit: Option<String>,
}

/// Chunks returned by a remote repository search
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteSearchHit {
    /// Matching chunks
    pub chunks: Vec<ScoredChunk>,

    /// True when the service noticed the index lags the requested commit
    pub out_of_sync: bool,
}

/// Failures talking to the remote code-search service
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteApiError {
    #[error("not authorized for remote code search")]
    NotAuthorized,

    #[error("remote code search unavailable: {0}")]
    Unavailable(String),

    #[error("remote call cancelled")]
    Cancelled,
}

/// Wire contract of the server-side code-search service.
///
/// The transport is a collaborator concern; implementations are expected to
/// abandon in-flight calls promptly once `token` is cancelled.
#[async_trait]
pub trait RemoteSearchApi: Send + Sync {
    /// Query the index state for one repository
    async fn get_index_state(
        &self,
        auth: &AuthSession,
        repo: &RemoteRepoId,
        token: &CancellationToken,
    ) -> Result<RemoteIndexState, RemoteApiError>;

    /// Ask the service to build an index; returns whether the request was accepted
    async fn trigger_indexing(
        &self,
        auth: &AuthSession,
        reason: &str,
        repo: &RemoteRepoId,
    ) -> Result<bool, RemoteApiError>;

    /// Search one repository's index
    async fn search_repo(
        &self,
        auth: &AuthSession,
        repo: &RemoteRepoId,
        query: &str,
        max_results: usize,
        token: &CancellationToken,
    ) -> Result<RemoteSearchHit, RemoteApiError>;
}
