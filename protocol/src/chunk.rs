use crate::embedding::EmbeddingKind;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Line range of a chunk within its file (1-indexed, inclusive)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkRange {
    /// First line of the chunk
    pub start_line: usize,

    /// Last line of the chunk, inclusive
    pub end_line: usize,
}

impl ChunkRange {
    /// Create a new range
    pub fn new(start_line: usize, end_line: usize) -> Self {
        Self {
            start_line,
            end_line,
        }
    }

    /// Number of lines covered by this range
    pub fn line_count(&self) -> usize {
        if self.end_line >= self.start_line {
            self.end_line - self.start_line + 1
        } else {
            0
        }
    }
}

/// A contiguous span of a file's text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChunk {
    /// File the chunk was taken from
    pub path: PathBuf,

    /// Location of the chunk within the file
    pub range: ChunkRange,

    /// The chunk text itself
    pub text: String,
}

impl FileChunk {
    /// Create a new chunk
    pub fn new(path: impl Into<PathBuf>, range: ChunkRange, text: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            range,
            text: text.into(),
        }
    }

    /// Stable identity of a chunk: file plus line span
    pub fn key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.path.display(),
            self.range.start_line,
            self.range.end_line
        )
    }
}

/// Relevance score tagged with the embedding family that produced it.
///
/// Scores from different embedding kinds live on different scales and must
/// never be compared against each other.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChunkScore {
    /// Embedding family the score came from
    pub kind: EmbeddingKind,

    /// Similarity value, higher is more relevant
    pub value: f32,
}

impl ChunkScore {
    /// Create a new score
    pub fn new(kind: EmbeddingKind, value: f32) -> Self {
        Self { kind, value }
    }
}

/// A chunk with an optional relevance score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredChunk {
    /// The chunk
    pub chunk: FileChunk,

    /// Score, absent when the producing strategy does not rank
    pub score: Option<ChunkScore>,
}

impl ScoredChunk {
    /// Chunk without a score
    pub fn unscored(chunk: FileChunk) -> Self {
        Self { chunk, score: None }
    }

    /// Chunk with a score
    pub fn scored(chunk: FileChunk, score: ChunkScore) -> Self {
        Self {
            chunk,
            score: Some(score),
        }
    }

    /// Score value if one is present for the given embedding kind
    pub fn score_for(&self, kind: EmbeddingKind) -> Option<f32> {
        self.score
            .filter(|score| score.kind == kind)
            .map(|score| score.value)
    }
}
