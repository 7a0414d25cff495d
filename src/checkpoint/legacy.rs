use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use super::chunked::ChunkedCheckpointStore;
use super::{read_all_results, CheckpointError, CheckpointResult, CheckpointStore};
use crate::entity::{MatchResult, PendingAdjudication};
use crate::TARGET_CHECKPOINT;

/// The old single-file checkpoint: every result rewritten on each save.
#[derive(Debug, Clone, Deserialize)]
pub struct LegacyCheckpoint {
    pub last_offset: usize,
    // Recomputed from the results on migration.
    #[serde(default)]
    pub stats: serde_json::Value,
    #[serde(default)]
    pub results: Vec<MatchResult>,
    #[serde(default)]
    pub llm_pending: Vec<PendingAdjudication>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    Migrated { results: usize, archived_to: PathBuf },
    AlreadyMigrated,
}

fn archived_path(legacy: &Path) -> PathBuf {
    let mut name = legacy.as_os_str().to_owned();
    name.push(".migrated");
    PathBuf::from(name)
}

fn read_legacy(path: &Path) -> CheckpointResult<LegacyCheckpoint> {
    let bytes = fs::read(path).map_err(|e| CheckpointError::io(path, e))?;
    let legacy: LegacyCheckpoint =
        serde_json::from_slice(&bytes).map_err(|e| CheckpointError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    if legacy.last_offset != legacy.results.len() {
        return Err(CheckpointError::Inconsistent(format!(
            "legacy checkpoint {} records offset {} but holds {} results",
            path.display(),
            legacy.last_offset,
            legacy.results.len()
        )));
    }
    Ok(legacy)
}

/// Re-reads the chunked checkpoint and compares it with the legacy content.
fn verify(store: &mut ChunkedCheckpointStore, legacy: &LegacyCheckpoint) -> CheckpointResult<()> {
    let state = store.load()?;
    let migrated = read_all_results(&*store)?;
    if state.last_offset != legacy.last_offset || migrated != legacy.results {
        return Err(CheckpointError::Inconsistent(format!(
            "chunked checkpoint in {} does not match the legacy file ({} vs {} results)",
            store.dir().display(),
            migrated.len(),
            legacy.results.len()
        )));
    }
    Ok(())
}

/// One-time upgrade from the single-file format. Safe to run repeatedly: an
/// existing chunked checkpoint is verified rather than rewritten, and the
/// legacy file is renamed to `*.migrated` only after verification.
pub fn migrate_legacy(
    legacy_path: &Path,
    store: &mut ChunkedCheckpointStore,
) -> CheckpointResult<MigrationOutcome> {
    if !legacy_path.exists() {
        if archived_path(legacy_path).exists() && store.exists() {
            store.load()?;
            return Ok(MigrationOutcome::AlreadyMigrated);
        }
        return Err(CheckpointError::LegacyMissing(legacy_path.to_path_buf()));
    }

    let legacy = read_legacy(legacy_path)?;
    let already_present = store.exists();
    if !already_present {
        store.load()?;
        store.append(&legacy.results, legacy.llm_pending.clone(), "")?;
    }
    verify(store, &legacy)?;

    let archived_to = archived_path(legacy_path);
    fs::rename(legacy_path, &archived_to).map_err(|e| CheckpointError::io(legacy_path, e))?;

    if already_present {
        info!(
            target: TARGET_CHECKPOINT,
            "Checkpoint {} already holds the legacy results; archived {}",
            store.dir().display(),
            archived_to.display()
        );
        return Ok(MigrationOutcome::AlreadyMigrated);
    }

    info!(
        target: TARGET_CHECKPOINT,
        "Migrated {} results from {} into {}",
        legacy.results.len(),
        legacy_path.display(),
        store.dir().display()
    );
    Ok(MigrationOutcome::Migrated {
        results: legacy.results.len(),
        archived_to,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Candidate, MatchMethod, ResolvableEntity};
    use serde_json::json;
    use tempfile::TempDir;

    fn legacy_json() -> serde_json::Value {
        let brian = ResolvableEntity::new(1, "Brian Boru");
        let results = vec![
            MatchResult::matched(&brian, &Candidate::new("Q310", "Brian Boru"), MatchMethod::Rule, 1.0, vec![]),
            MatchResult::unmatched(&ResolvableEntity::new(2, "Aed")),
            MatchResult::unmatched(&ResolvableEntity::new(3, "Niall")),
        ];
        json!({
            "last_offset": 3,
            "stats": {"rule": 1, "none": 2},
            "results": results,
            "llm_pending": [],
        })
    }

    #[test]
    fn test_migration_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let legacy = dir.path().join("checkpoint.json");
        fs::write(&legacy, serde_json::to_vec(&legacy_json()).unwrap()).unwrap();

        let mut store = ChunkedCheckpointStore::new(dir.path().join("checkpoint"), 2);
        let outcome = migrate_legacy(&legacy, &mut store).unwrap();
        assert!(matches!(outcome, MigrationOutcome::Migrated { results: 3, .. }));
        assert!(!legacy.exists());
        assert!(archived_path(&legacy).exists());
        assert_eq!(store.state().chunk_sizes, vec![2, 1]);
        assert_eq!(store.state().stats.rule, 1);
        assert_eq!(store.state().stats.unmatched, 2);

        let again = migrate_legacy(&legacy, &mut store).unwrap();
        assert_eq!(again, MigrationOutcome::AlreadyMigrated);
        assert_eq!(store.state().last_offset, 3);
    }

    #[test]
    fn test_interrupted_migration_is_verified_then_archived() {
        let dir = TempDir::new().unwrap();
        let legacy = dir.path().join("checkpoint.json");
        fs::write(&legacy, serde_json::to_vec(&legacy_json()).unwrap()).unwrap();

        let mut store = ChunkedCheckpointStore::new(dir.path().join("checkpoint"), 2);
        migrate_legacy(&legacy, &mut store).unwrap();
        // Simulate a crash before the rename: the legacy file is back.
        fs::rename(archived_path(&legacy), &legacy).unwrap();

        let outcome = migrate_legacy(&legacy, &mut store).unwrap();
        assert_eq!(outcome, MigrationOutcome::AlreadyMigrated);
        assert!(!legacy.exists());
        assert_eq!(store.state().result_chunks, 2);
    }

    #[test]
    fn test_missing_and_broken_legacy_files() {
        let dir = TempDir::new().unwrap();
        let legacy = dir.path().join("checkpoint.json");
        let mut store = ChunkedCheckpointStore::new(dir.path().join("checkpoint"), 2);
        assert!(matches!(
            migrate_legacy(&legacy, &mut store),
            Err(CheckpointError::LegacyMissing(_))
        ));

        fs::write(&legacy, b"{\"last_offset\": 4, \"results\": []}").unwrap();
        assert!(matches!(
            migrate_legacy(&legacy, &mut store),
            Err(CheckpointError::Inconsistent(_))
        ));
        assert!(legacy.exists());
    }
}
