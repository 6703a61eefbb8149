/*!
# codescout Repo Index

Tracks, per git repository in the workspace, whether a server-side search
index exists, is building, or cannot be used, and which local files have
drifted from the commit that index covers.

Two cooperating pieces:
- [`RepoIndexTracker`] owns the per-repository status map, performs status
  checks against the remote service, polls while an index builds, and reacts
  to authentication changes.
- [`DiffTracker`] turns `Ready` statuses into "these files are stale" answers
  by diffing the working tree against the indexed commit, merged with a
  rolling set of files edited in this session.

Search strategies consume both through read-only snapshots; all mutation
stays inside this crate.
*/

mod config;
mod diff;
mod error;
pub mod git;
mod state;
mod tracker;

pub use config::RepoIndexConfig;
pub use diff::{DiffTracker, GitDiffSource, VcsDiffSource};
pub use error::{RepoIndexError, Result, TriggerIndexingError};
pub use state::{RemoteOverallStatus, RepoIndexEvent, RepoStatus};
pub use tracker::RepoIndexTracker;
