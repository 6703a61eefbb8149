/*!
# codescout Protocol

Shared data model and collaborator contracts for the codescout workspace
search stack.

The types here are deliberately logic-free: chunks and scores, the tagged
status unions for remote repository indexes, strategy outcome envelopes, and
the trait seams behind which the heavyweight collaborators live (the remote
code-search service, the embeddings computer, the local lexical index, the
workspace file store, authentication).

Downstream crates:
- `codescout-repo-index` tracks remote index state and local diffs.
- `codescout-search` selects, races, and merges the search strategies.
*/

mod auth;
mod chunk;
mod embedding;
mod outcome;
mod remote;
mod workspace;

pub use auth::{AuthProvider, AuthSession, RemoteProviderKind};
pub use chunk::{ChunkRange, ChunkScore, FileChunk, ScoredChunk};
pub use embedding::{Embedding, EmbeddingKind, EmbeddingsProvider};
pub use outcome::{
    AlertSeverity, ProgressCallback, SearchAlert, SearchProgress, StrategyId, StrategyResult,
};
pub use remote::{
    RemoteApiError, RemoteIndexState, RemoteIndexStatus, RemoteRepoId, RemoteSearchApi,
    RemoteSearchHit,
};
pub use workspace::{
    EmbeddingsIndex, FileEvent, LexicalIndex, LocalIndexError, LocalIndexState, QueryResolver,
    RepoDiscovery, RepoEvent, Tokenizer, WorkspaceFiles,
};
