use codescout_protocol::RemoteApiError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RepoIndexError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("git error: {0}")]
    Git(String),

    #[error("remote service error: {0}")]
    Remote(#[from] RemoteApiError),

    #[error("repository not tracked: {0}")]
    UnknownRepo(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("operation cancelled")]
    Cancelled,
}

/// Reasons remote indexing could not be triggered.
///
/// Callers branch on the variant; the messages are user-facing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TriggerIndexingError {
    #[error("no git repositories found in this workspace")]
    NoGitRepos,

    #[error("still determining repository index status, try again shortly")]
    StillResolving,

    #[error("no repositories in this workspace can be remotely indexed")]
    NoRemoteIndexableRepos,

    #[error("sign in to use remote code search")]
    NoValidAuthToken,

    #[error("the remote index is already built")]
    AlreadyIndexed,

    #[error("a remote index build is already in progress")]
    AlreadyIndexing,

    #[error("could not check the remote index status")]
    CouldNotCheckIndexStatus,

    #[error("the indexing request for {repo} was not accepted")]
    TriggerFailed { repo: String },
}

pub type Result<T> = std::result::Result<T, RepoIndexError>;
