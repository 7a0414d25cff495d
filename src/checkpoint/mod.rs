//! Durable progress for long matching runs.
//!
//! A checkpoint is a small state document plus numbered, immutable chunk files
//! holding the committed results. Publishing the state document is the commit
//! point: a chunk not referenced by the published state does not exist.

pub mod chunked;
pub mod legacy;
pub mod state;

use std::path::PathBuf;
use thiserror::Error;

use crate::entity::{MatchResult, PendingAdjudication};

pub use chunked::{ChunkReader, ChunkedCheckpointStore, ResultChunk};
pub use legacy::{migrate_legacy, LegacyCheckpoint, MigrationOutcome};
pub use state::{CheckpointState, MethodStats, CHECKPOINT_FORMAT_VERSION, DEFAULT_CHUNK_CAPACITY};

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Checkpoint file {path} is corrupt: {reason}. Rerun with --fresh to start over")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Checkpoint is inconsistent: {0}")]
    Inconsistent(String),

    #[error(
        "Entity ordering changed since the checkpoint was written (stored digest {stored}, \
         current {current}). Rerun with --fresh"
    )]
    OrderingChanged { stored: String, current: String },

    #[error("Legacy checkpoint not found: {0}")]
    LegacyMissing(PathBuf),
}

impl CheckpointError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CheckpointError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type CheckpointResult<T> = Result<T, CheckpointError>;

/// Storage strategy for checkpoints, chosen at construction.
pub trait CheckpointStore: Send {
    /// Reads and validates the published state, cleaning up anything a crash
    /// left behind. A missing checkpoint loads as an empty state.
    fn load(&mut self) -> CheckpointResult<CheckpointState>;

    /// The state as of the last successful `load` or publication.
    fn state(&self) -> &CheckpointState;

    /// Commits `results` (the next contiguous block after `last_offset`) as new
    /// chunks, queues `new_pending` and publishes the new state.
    fn append(
        &mut self,
        results: &[MatchResult],
        new_pending: Vec<PendingAdjudication>,
        ordering_digest: &str,
    ) -> CheckpointResult<()>;

    /// Replaces the deferred adjudication queue and publishes the state.
    fn publish_pending(&mut self, pending: Vec<PendingAdjudication>) -> CheckpointResult<()>;

    /// Reads one chunk body.
    fn chunk(&self, index: usize) -> CheckpointResult<ResultChunk>;

    /// Lazily iterates the committed chunks in order.
    fn chunks(&self) -> ChunkReader<'_>;

    /// Moves the existing checkpoint aside and starts empty. Returns the backup
    /// location, if there was anything to move.
    fn reset(&mut self) -> CheckpointResult<Option<PathBuf>>;
}

/// Every committed result, in commit order.
pub fn read_all_results(store: &dyn CheckpointStore) -> CheckpointResult<Vec<MatchResult>> {
    let mut results = Vec::with_capacity(store.state().total_results);
    for chunk in store.chunks() {
        results.extend(chunk?.results);
    }
    Ok(results)
}
