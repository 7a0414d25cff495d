use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::state::CheckpointState;
use super::{CheckpointError, CheckpointResult, CheckpointStore};
use crate::entity::{MatchResult, PendingAdjudication};
use crate::TARGET_CHECKPOINT;

const STATE_FILE: &str = "state.json";
const CHUNKS_DIR: &str = "chunks";
const TEMP_MARKER: &str = ".tmp.";

/// One immutable block of committed results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultChunk {
    pub index: usize,
    pub start_offset: usize,
    pub results: Vec<MatchResult>,
}

/// Writes `bytes` to a uniquely named temp file next to `path`, fsyncs it and
/// renames it into place.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> CheckpointResult<()> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("checkpoint");
    let temp_path = path.with_file_name(format!("{}{}{}", file_name, TEMP_MARKER, Uuid::new_v4()));

    let written = (|| -> std::io::Result<()> {
        let mut file = File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.flush()?;
        file.sync_all()?;
        fs::rename(&temp_path, path)
    })();

    if let Err(e) = written {
        let _ = fs::remove_file(&temp_path);
        return Err(CheckpointError::io(path, e));
    }
    Ok(())
}

fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.contains(TEMP_MARKER))
}

fn chunk_index(path: &Path) -> Option<usize> {
    path.file_name()?
        .to_str()?
        .strip_prefix("chunk_")?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

/// Checkpoint kept as `state.json` plus `chunks/chunk_NNNNNN.json`.
#[derive(Debug)]
pub struct ChunkedCheckpointStore {
    dir: PathBuf,
    chunk_capacity: usize,
    state: CheckpointState,
}

impl ChunkedCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, chunk_capacity: usize) -> Self {
        let chunk_capacity = chunk_capacity.max(1);
        Self {
            dir: dir.into(),
            chunk_capacity,
            state: CheckpointState::empty(chunk_capacity),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    fn chunks_dir(&self) -> PathBuf {
        self.dir.join(CHUNKS_DIR)
    }

    fn chunk_path(&self, index: usize) -> PathBuf {
        self.chunks_dir().join(format!("chunk_{:06}.json", index))
    }

    pub fn exists(&self) -> bool {
        self.state_path().exists()
    }

    fn ensure_dirs(&self) -> CheckpointResult<()> {
        let chunks_dir = self.chunks_dir();
        fs::create_dir_all(&chunks_dir).map_err(|e| CheckpointError::io(&chunks_dir, e))
    }

    fn read_state(&self) -> CheckpointResult<Option<CheckpointState>> {
        let path = self.state_path();
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CheckpointError::io(&path, e)),
        };
        let state: CheckpointState =
            serde_json::from_slice(&bytes).map_err(|e| CheckpointError::Corrupt {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        state.validate().map_err(CheckpointError::Inconsistent)?;
        Ok(Some(state))
    }

    fn publish(&mut self, mut next: CheckpointState) -> CheckpointResult<()> {
        next.updated_at = Utc::now();
        next.validate().map_err(CheckpointError::Inconsistent)?;
        let bytes = serde_json::to_vec_pretty(&next).map_err(|e| CheckpointError::Corrupt {
            path: self.state_path(),
            reason: format!("failed to serialize state: {}", e),
        })?;
        write_atomic(&self.state_path(), &bytes)?;
        self.state = next;
        Ok(())
    }

    fn write_chunk(&self, chunk: &ResultChunk) -> CheckpointResult<()> {
        let path = self.chunk_path(chunk.index);
        let bytes = serde_json::to_vec(chunk).map_err(|e| CheckpointError::Corrupt {
            path: path.clone(),
            reason: format!("failed to serialize chunk: {}", e),
        })?;
        write_atomic(&path, &bytes)
    }

    /// Removes chunk files the published state does not reference and temp files
    /// from interrupted writes. Returns how many files were removed.
    fn prune(&self) -> CheckpointResult<usize> {
        let mut removed = 0;
        for dir in [self.dir.clone(), self.chunks_dir()] {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(CheckpointError::io(&dir, e)),
            };
            for entry in entries {
                let path = entry.map_err(|e| CheckpointError::io(&dir, e))?.path();
                let orphan = chunk_index(&path).is_some_and(|index| index >= self.state.result_chunks);
                if is_temp_file(&path) || orphan {
                    warn!(target: TARGET_CHECKPOINT, "Removing unreferenced checkpoint file {}", path.display());
                    fs::remove_file(&path).map_err(|e| CheckpointError::io(&path, e))?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

impl CheckpointStore for ChunkedCheckpointStore {
    fn load(&mut self) -> CheckpointResult<CheckpointState> {
        let state = match self.read_state()? {
            Some(state) => {
                for index in 0..state.result_chunks {
                    let path = self.chunk_path(index);
                    if !path.exists() {
                        return Err(CheckpointError::Inconsistent(format!(
                            "chunk {} referenced by the state is missing ({})",
                            index,
                            path.display()
                        )));
                    }
                }
                if state.chunk_capacity != self.chunk_capacity {
                    info!(
                        target: TARGET_CHECKPOINT,
                        "Keeping stored chunk capacity {} (configured {})",
                        state.chunk_capacity, self.chunk_capacity
                    );
                }
                state
            }
            None => CheckpointState::empty(self.chunk_capacity),
        };

        self.state = state;
        let removed = self.prune()?;
        info!(
            target: TARGET_CHECKPOINT,
            "Loaded checkpoint {}: offset {}, {} chunks, {} pending adjudication{}",
            self.dir.display(),
            self.state.last_offset,
            self.state.result_chunks,
            self.state.llm_pending.len(),
            if removed > 0 { format!(", pruned {} files", removed) } else { String::new() }
        );
        Ok(self.state.clone())
    }

    fn state(&self) -> &CheckpointState {
        &self.state
    }

    fn append(
        &mut self,
        results: &[MatchResult],
        new_pending: Vec<PendingAdjudication>,
        ordering_digest: &str,
    ) -> CheckpointResult<()> {
        self.ensure_dirs()?;
        let mut next = self.state.clone();

        for block in results.chunks(next.chunk_capacity) {
            let chunk = ResultChunk {
                index: next.result_chunks,
                start_offset: next.total_results,
                results: block.to_vec(),
            };
            self.write_chunk(&chunk)?;
            debug!(
                target: TARGET_CHECKPOINT,
                "Wrote chunk {} ({} results from offset {})",
                chunk.index,
                block.len(),
                chunk.start_offset
            );

            block.iter().for_each(|result| next.stats.record(result));
            next.result_chunks += 1;
            next.chunk_sizes.push(block.len());
            next.total_results += block.len();
        }

        next.last_offset = next.total_results;
        next.ordering_digest = ordering_digest.to_string();
        next.llm_pending.extend(new_pending);
        self.publish(next)
    }

    fn publish_pending(&mut self, pending: Vec<PendingAdjudication>) -> CheckpointResult<()> {
        self.ensure_dirs()?;
        let mut next = self.state.clone();
        next.llm_pending = pending;
        self.publish(next)
    }

    fn chunk(&self, index: usize) -> CheckpointResult<ResultChunk> {
        let Some(expected) = self.state.chunk_sizes.get(index).copied() else {
            return Err(CheckpointError::Inconsistent(format!(
                "chunk {} requested but only {} are committed",
                index, self.state.result_chunks
            )));
        };

        let path = self.chunk_path(index);
        let bytes = fs::read(&path).map_err(|e| CheckpointError::io(&path, e))?;
        let chunk: ResultChunk =
            serde_json::from_slice(&bytes).map_err(|e| CheckpointError::Corrupt {
                path: path.clone(),
                reason: e.to_string(),
            })?;

        if chunk.index != index || chunk.results.len() != expected {
            return Err(CheckpointError::Inconsistent(format!(
                "chunk file {} holds index {} with {} results, state expects index {} with {}",
                path.display(),
                chunk.index,
                chunk.results.len(),
                index,
                expected
            )));
        }
        Ok(chunk)
    }

    fn chunks(&self) -> ChunkReader<'_> {
        ChunkReader::new(self)
    }

    fn reset(&mut self) -> CheckpointResult<Option<PathBuf>> {
        let backup = if self.dir.exists() {
            let mut name = self.dir.as_os_str().to_owned();
            name.push(format!(".bak-{}", Utc::now().format("%Y%m%d%H%M%S%3f")));
            let backup = PathBuf::from(name);
            fs::rename(&self.dir, &backup).map_err(|e| CheckpointError::io(&self.dir, e))?;
            warn!(
                target: TARGET_CHECKPOINT,
                "Moved checkpoint {} aside to {}",
                self.dir.display(),
                backup.display()
            );
            Some(backup)
        } else {
            None
        };
        self.state = CheckpointState::empty(self.chunk_capacity);
        Ok(backup)
    }
}

/// Reads committed chunks one at a time.
pub struct ChunkReader<'a> {
    store: &'a dyn CheckpointStore,
    next: usize,
    end: usize,
}

impl<'a> ChunkReader<'a> {
    pub fn new(store: &'a dyn CheckpointStore) -> Self {
        Self {
            end: store.state().result_chunks,
            store,
            next: 0,
        }
    }
}

impl Iterator for ChunkReader<'_> {
    type Item = CheckpointResult<ResultChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.end {
            return None;
        }
        let chunk = self.store.chunk(self.next);
        self.next += 1;
        Some(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::read_all_results;
    use crate::entity::{PendingReason, ResolvableEntity};
    use tempfile::TempDir;

    fn results(ids: std::ops::Range<i64>) -> Vec<MatchResult> {
        ids.map(|id| MatchResult::unmatched(&ResolvableEntity::new(id, &format!("entity {}", id))))
            .collect()
    }

    fn store(dir: &TempDir, capacity: usize) -> ChunkedCheckpointStore {
        ChunkedCheckpointStore::new(dir.path().join("checkpoint"), capacity)
    }

    #[test]
    fn test_append_splits_into_chunks() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir, 2);
        store.load().unwrap();
        store.append(&results(1..6), vec![], "digest").unwrap();

        let state = store.state().clone();
        assert_eq!(state.chunk_sizes, vec![2, 2, 1]);
        assert_eq!(state.result_chunks, 3);
        assert_eq!(state.last_offset, 5);
        assert_eq!(state.total_results, 5);
        assert!(store.chunk_path(2).exists());
        assert!(!store.chunk_path(3).exists());

        let chunk = store.chunk(1).unwrap();
        assert_eq!(chunk.start_offset, 2);
        assert_eq!(chunk.results[0].local_id, 3);
    }

    #[test]
    fn test_existing_chunks_are_not_rewritten() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir, 2);
        store.load().unwrap();
        store.append(&results(1..4), vec![], "a").unwrap();
        let first_chunk = fs::read(store.chunk_path(1)).unwrap();

        store.append(&results(4..6), vec![], "b").unwrap();
        assert_eq!(store.state().chunk_sizes, vec![2, 1, 2]);
        assert_eq!(fs::read(store.chunk_path(1)).unwrap(), first_chunk);

        let mut reopened = ChunkedCheckpointStore::new(store.dir(), 2);
        let state = reopened.load().unwrap();
        assert_eq!(state.last_offset, 5);
        assert_eq!(state.ordering_digest, "b");
        let ids: Vec<i64> = read_all_results(&reopened)
            .unwrap()
            .iter()
            .map(|r| r.local_id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_load_prunes_orphans_and_temp_files() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir, 2);
        store.load().unwrap();
        store.append(&results(1..3), vec![], "a").unwrap();

        // A crash after writing a chunk but before publishing the state.
        let orphan = store.chunk_path(1);
        fs::write(&orphan, b"{}").unwrap();
        let temp = store.dir().join("state.json.tmp.deadbeef");
        fs::write(&temp, b"partial").unwrap();

        let mut reopened = ChunkedCheckpointStore::new(store.dir(), 2);
        let state = reopened.load().unwrap();
        assert_eq!(state.last_offset, 2);
        assert!(!orphan.exists());
        assert!(!temp.exists());
        assert!(reopened.chunk_path(0).exists());
    }

    #[test]
    fn test_corrupt_state_is_refused() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir, 2);
        store.load().unwrap();
        store.append(&results(1..3), vec![], "a").unwrap();
        fs::write(store.state_path(), b"{\"format_version\": 2, \"last_off").unwrap();

        let mut reopened = ChunkedCheckpointStore::new(store.dir(), 2);
        assert!(matches!(reopened.load(), Err(CheckpointError::Corrupt { .. })));
    }

    #[test]
    fn test_inconsistent_state_is_refused() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir, 2);
        store.load().unwrap();
        store.append(&results(1..3), vec![], "a").unwrap();
        fs::remove_file(store.chunk_path(0)).unwrap();

        let mut reopened = ChunkedCheckpointStore::new(store.dir(), 2);
        assert!(matches!(reopened.load(), Err(CheckpointError::Inconsistent(_))));
    }

    #[test]
    fn test_reset_moves_checkpoint_aside() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir, 2);
        store.load().unwrap();
        store.append(&results(1..3), vec![], "a").unwrap();
        fs::write(store.state_path(), b"garbage").unwrap();

        let backup = store.reset().unwrap().expect("something to back up");
        assert!(backup.join("state.json").exists());
        assert!(!store.dir().exists());

        let state = store.load().unwrap();
        assert_eq!(state.last_offset, 0);
        assert!(store.reset().unwrap().is_none());
    }

    #[test]
    fn test_pending_queue_is_published() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir, 2);
        store.load().unwrap();
        let pending = PendingAdjudication {
            local_id: 1,
            local_name: "Aed".to_string(),
            candidate_ids: vec!["Q1".to_string()],
            reason: PendingReason::Skipped,
        };
        store.append(&results(1..2), vec![pending.clone()], "a").unwrap();
        assert_eq!(store.state().llm_pending, vec![pending]);

        store.publish_pending(vec![]).unwrap();
        let mut reopened = ChunkedCheckpointStore::new(store.dir(), 2);
        assert!(reopened.load().unwrap().llm_pending.is_empty());
    }
}
