//! Checkpoint storage keyed by run id.
//!
//! The [`CheckpointStore`] trait hides where checkpoints live. [`FileStore`]
//! keeps one directory per run and replaces the checkpoint file atomically;
//! [`MemoryStore`] holds encoded checkpoints in process and is owned by
//! whoever creates it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use stagehand_types::{Result, StoreError};
use tokio::sync::Mutex;

use crate::checkpoint::{decode, write_atomic, Checkpoint};
use crate::export::safe_relative_path;

const CHECKPOINT_FILE: &str = "checkpoint.json";
const ARTIFACTS_DIR: &str = "artifacts";

/// Reject run ids that cannot be used as a single path component.
pub fn validate_run_id(run_id: &str) -> std::result::Result<(), StoreError> {
    let ok = !run_id.is_empty()
        && run_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidKey {
            run_id: run_id.to_string(),
        })
    }
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Fetch the stored checkpoint exactly as persisted.
    async fn get(&self, run_id: &str) -> std::result::Result<Checkpoint, StoreError>;

    /// Replace the stored checkpoint. Readers see the old or the new version,
    /// never a partial write.
    async fn put(&self, checkpoint: &Checkpoint) -> std::result::Result<(), StoreError>;

    /// Run ids currently stored, sorted.
    async fn list(&self) -> std::result::Result<Vec<String>, StoreError>;

    /// Remove a run and everything stored with it.
    async fn delete(&self, run_id: &str) -> std::result::Result<(), StoreError>;

    /// Persist one produced file next to the checkpoint. Stores without an
    /// artifact area ignore it.
    async fn put_artifact(
        &self,
        _run_id: &str,
        _path: &str,
        _content: &str,
    ) -> std::result::Result<(), StoreError> {
        Ok(())
    }

    /// Drop every produced file of a run, keeping the checkpoint.
    async fn clear_artifacts(&self, _run_id: &str) -> std::result::Result<(), StoreError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Free functions
// ---------------------------------------------------------------------------

/// Refresh counters and `updated_at`, then write through the store.
pub async fn save(store: &dyn CheckpointStore, checkpoint: &mut Checkpoint) -> Result<()> {
    checkpoint.updated_at = chrono::Utc::now();
    checkpoint.refresh_counts();
    store.put(checkpoint).await?;
    tracing::debug!(run_id = %checkpoint.run_id, progress = %checkpoint.progress(), "Checkpoint saved");
    Ok(())
}

/// Load a run for resumption. Tasks left RUNNING by a crash come back PENDING,
/// and that recovery is written back before returning.
pub async fn load(store: &dyn CheckpointStore, run_id: &str) -> Result<Checkpoint> {
    let mut checkpoint = store.get(run_id).await?;
    if !checkpoint.recover_interrupted().is_empty() {
        save(store, &mut checkpoint).await?;
    }
    Ok(checkpoint)
}

/// Load a run, or build a fresh empty checkpoint without writing it.
pub async fn load_or_create(
    store: &dyn CheckpointStore,
    run_id: &str,
    project_name: &str,
) -> Result<Checkpoint> {
    validate_run_id(run_id)?;
    match load(store, run_id).await {
        Ok(cp) => Ok(cp),
        Err(e) if e.is_not_found() => Ok(Checkpoint::new(run_id, project_name)),
        Err(e) => Err(e),
    }
}

// ---------------------------------------------------------------------------
// FileStore
// ---------------------------------------------------------------------------

/// `<root>/<run_id>/checkpoint.json`, produced files under
/// `<root>/<run_id>/artifacts/`.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join(run_id)
    }

    pub fn checkpoint_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join(CHECKPOINT_FILE)
    }

    pub fn artifacts_dir(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join(ARTIFACTS_DIR)
    }
}

#[async_trait]
impl CheckpointStore for FileStore {
    async fn get(&self, run_id: &str) -> std::result::Result<Checkpoint, StoreError> {
        validate_run_id(run_id)?;
        match tokio::fs::read(self.checkpoint_path(run_id)).await {
            Ok(bytes) => decode(&bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound {
                run_id: run_id.to_string(),
            }),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn put(&self, checkpoint: &Checkpoint) -> std::result::Result<(), StoreError> {
        validate_run_id(&checkpoint.run_id)?;
        let json = serde_json::to_vec_pretty(checkpoint)?;
        write_atomic(&self.checkpoint_path(&checkpoint.run_id), &json).await?;
        Ok(())
    }

    async fn list(&self) -> std::result::Result<Vec<String>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::Io(e)),
        };
        let mut runs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if validate_run_id(&name).is_err() {
                continue;
            }
            if tokio::fs::try_exists(entry.path().join(CHECKPOINT_FILE)).await? {
                runs.push(name);
            }
        }
        runs.sort();
        Ok(runs)
    }

    /// The run directory is first renamed to a tombstone so the run vanishes
    /// in one step, then the artifacts and finally the checkpoint are removed.
    async fn delete(&self, run_id: &str) -> std::result::Result<(), StoreError> {
        validate_run_id(run_id)?;
        let dir = self.run_dir(run_id);
        let tombstone = self
            .root
            .join(format!(".{run_id}.deleted-{}", uuid::Uuid::new_v4().simple()));
        match tokio::fs::rename(&dir, &tombstone).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound {
                    run_id: run_id.to_string(),
                })
            }
            Err(e) => return Err(StoreError::Io(e)),
        }

        let artifacts = tombstone.join(ARTIFACTS_DIR);
        if tokio::fs::try_exists(&artifacts).await? {
            tokio::fs::remove_dir_all(&artifacts).await?;
        }
        let checkpoint = tombstone.join(CHECKPOINT_FILE);
        if tokio::fs::try_exists(&checkpoint).await? {
            tokio::fs::remove_file(&checkpoint).await?;
        }
        tokio::fs::remove_dir_all(&tombstone).await?;
        tracing::info!(run_id = %run_id, "Run deleted");
        Ok(())
    }

    async fn put_artifact(
        &self,
        run_id: &str,
        path: &str,
        content: &str,
    ) -> std::result::Result<(), StoreError> {
        validate_run_id(run_id)?;
        let Some(relative) = safe_relative_path(path) else {
            tracing::warn!(run_id = %run_id, path = %path, "Skipping artifact with unsafe path");
            return Ok(());
        };
        write_atomic(&self.artifacts_dir(run_id).join(relative), content.as_bytes()).await?;
        Ok(())
    }

    async fn clear_artifacts(&self, run_id: &str) -> std::result::Result<(), StoreError> {
        validate_run_id(run_id)?;
        match tokio::fs::remove_dir_all(self.artifacts_dir(run_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(e)),
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// Encoded checkpoints held in process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    runs: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn get(&self, run_id: &str) -> std::result::Result<Checkpoint, StoreError> {
        validate_run_id(run_id)?;
        let runs = self.runs.lock().await;
        let bytes = runs.get(run_id).ok_or_else(|| StoreError::NotFound {
            run_id: run_id.to_string(),
        })?;
        decode(bytes)
    }

    async fn put(&self, checkpoint: &Checkpoint) -> std::result::Result<(), StoreError> {
        validate_run_id(&checkpoint.run_id)?;
        let bytes = serde_json::to_vec(checkpoint)?;
        self.runs
            .lock()
            .await
            .insert(checkpoint.run_id.clone(), bytes);
        Ok(())
    }

    async fn list(&self) -> std::result::Result<Vec<String>, StoreError> {
        Ok(self.runs.lock().await.keys().cloned().collect())
    }

    async fn delete(&self, run_id: &str) -> std::result::Result<(), StoreError> {
        validate_run_id(run_id)?;
        match self.runs.lock().await.remove(run_id) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound {
                run_id: run_id.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
