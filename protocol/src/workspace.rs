use crate::chunk::ScoredChunk;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// File lifecycle events observed in the workspace
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEvent {
    Created(PathBuf),
    Changed(PathBuf),
    Deleted(PathBuf),
}

impl FileEvent {
    /// Path the event refers to
    pub fn path(&self) -> &Path {
        match self {
            FileEvent::Created(path) | FileEvent::Changed(path) | FileEvent::Deleted(path) => path,
        }
    }
}

/// Enumerates and observes the files of the open workspace.
///
/// Eligibility (size, type, and ignore filters) is decided here so every
/// consumer agrees on which files can be indexed at all.
#[async_trait]
pub trait WorkspaceFiles: Send + Sync {
    /// All files currently eligible for indexing
    fn eligible_files(&self) -> Vec<PathBuf>;

    /// Whether the given file would be eligible for indexing
    fn is_eligible(&self, path: &Path) -> bool;

    /// Read the current text of a file (editor buffer wins over disk)
    async fn read_text(&self, path: &Path) -> std::io::Result<String>;

    /// Whether the file has unsaved changes in an open editor
    fn is_dirty(&self, path: &Path) -> bool;

    /// Subscribe to create/change/delete events
    fn subscribe(&self) -> broadcast::Receiver<FileEvent>;
}

/// Repository open/close events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepoEvent {
    Opened(PathBuf),
    Closed(PathBuf),
}

/// Discovers git repositories in the workspace
#[async_trait]
pub trait RepoDiscovery: Send + Sync {
    /// Wait until initial discovery has settled
    async fn settled(&self);

    /// Repository roots currently open
    fn repos(&self) -> Vec<PathBuf>;

    /// Subscribe to open/close events
    fn subscribe(&self) -> broadcast::Receiver<RepoEvent>;
}

/// Health of a local (embeddings or lexical) index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalIndexState {
    /// Index not built and not building
    NotReady,
    /// Index build in progress
    Building,
    /// Index usable
    Ready,
    /// Index unavailable on this machine
    Unavailable,
}

/// Failures from a local index collaborator
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LocalIndexError {
    #[error("local index unavailable: {0}")]
    Unavailable(String),

    #[error("local index search cancelled")]
    Cancelled,
}

/// Local vector-embeddings index over workspace chunks
#[async_trait]
pub trait EmbeddingsIndex: Send + Sync {
    /// Search the whole workspace, or only `subset` when given
    async fn search(
        &self,
        query: &str,
        subset: Option<&[PathBuf]>,
        max_results: usize,
        token: &CancellationToken,
    ) -> Result<Vec<ScoredChunk>, LocalIndexError>;

    /// Current health of the index
    fn state(&self) -> LocalIndexState;

    /// Kick off (re)indexing; returns whether the request was accepted
    async fn ensure_indexed(&self, reason: &str) -> bool;
}

/// Local lexical (TF-IDF) index over workspace chunks
#[async_trait]
pub trait LexicalIndex: Send + Sync {
    /// Search the whole workspace, or only `subset` when given
    async fn search(
        &self,
        query: &str,
        subset: Option<&[PathBuf]>,
        max_results: usize,
        token: &CancellationToken,
    ) -> Result<Vec<ScoredChunk>, LocalIndexError>;

    /// Current health of the index
    fn state(&self) -> LocalIndexState;

    /// Kick off (re)indexing; returns whether the request was accepted
    async fn ensure_indexed(&self, reason: &str) -> bool;
}

/// Counts tokens the way the downstream model endpoint would
pub trait Tokenizer: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// Resolves the raw query text into its searchable forms
#[async_trait]
pub trait QueryResolver: Send + Sync {
    /// Expand references (file mentions, symbols) into plain text
    async fn dereference(&self, raw: &str) -> String;

    /// Extract search keywords from resolved text
    async fn keywords(&self, text: &str) -> Vec<String>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_file_event_path() {
        let event = FileEvent::Changed(PathBuf::from("src/lib.rs"));
        assert_eq!(event.path(), Path::new("src/lib.rs"));
    }
}
