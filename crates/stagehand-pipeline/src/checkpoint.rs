//! Durable run state and the task mutation primitives.
//!
//! A [`Checkpoint`] is the single source of truth for one pipeline run. Every
//! task status change goes through the methods here so that illegal
//! transitions are rejected in one place. Counters are derived and are
//! recomputed on save and on load rather than trusted from disk.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stagehand_types::{Result, Stage, StagehandError, StoreError, TaskStatus};
use tokio::io::AsyncWriteExt;

use crate::graph::{Task, TaskGraph};

/// Which generative stage failed and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    pub stage: Stage,
    pub message: String,
}

/// Snapshot of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: String,
    pub project_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Shared contracts every task may rely on.
    #[serde(default)]
    pub global_context: String,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub execution_order: Vec<String>,

    #[serde(default)]
    pub total: usize,
    #[serde(default)]
    pub completed: usize,
    #[serde(default)]
    pub failed: usize,

    #[serde(default)]
    pub stage: Stage,
    #[serde(default)]
    pub prompt: String,
    /// Artifact under plan review.
    #[serde(default)]
    pub plan: Option<serde_json::Value>,
    /// Edit instructions for the stage that regenerates the next artifact.
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub stage_error: Option<StageFailure>,
}

impl Checkpoint {
    pub fn new(run_id: impl Into<String>, project_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            project_name: project_name.into(),
            created_at: now,
            updated_at: now,
            global_context: String::new(),
            tasks: Vec::new(),
            execution_order: Vec::new(),
            total: 0,
            completed: 0,
            failed: 0,
            stage: Stage::Planning,
            prompt: String::new(),
            plan: None,
            instructions: None,
            stage_error: None,
        }
    }

    /// Replace the task list with a validated graph.
    pub fn install_graph(&mut self, global_context: impl Into<String>, graph: TaskGraph) {
        let (tasks, order) = graph.into_parts();
        self.global_context = global_context.into();
        self.tasks = tasks;
        self.execution_order = order;
        self.refresh_counts();
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    fn task_mut(&mut self, id: &str) -> Result<&mut Task> {
        let run_id = &self.run_id;
        self.tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| StagehandError::TaskNotFound {
                run_id: run_id.clone(),
                task: id.to_string(),
            })
    }

    pub fn is_task_completed(&self, id: &str) -> bool {
        self.task(id)
            .is_some_and(|t| t.status == TaskStatus::Completed)
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// PENDING or RUNNING to RUNNING. Every call counts one attempt, both in
    /// total and in the current scheduling round.
    pub fn mark_running(&mut self, id: &str) -> Result<()> {
        let task = self.task_mut(id)?;
        match task.status {
            TaskStatus::Pending | TaskStatus::Running => {
                task.status = TaskStatus::Running;
                task.attempts += 1;
                task.round_attempts += 1;
                Ok(())
            }
            from => Err(invalid(id, from, TaskStatus::Running)),
        }
    }

    /// RUNNING to COMPLETED. Clears any error left by an earlier attempt.
    pub fn mark_completed(&mut self, id: &str, content: impl Into<String>) -> Result<()> {
        let task = self.task_mut(id)?;
        if task.status != TaskStatus::Running {
            return Err(invalid(id, task.status, TaskStatus::Completed));
        }
        task.status = TaskStatus::Completed;
        task.content = Some(content.into());
        task.last_error = None;
        task.round_attempts = 0;
        self.refresh_counts();
        Ok(())
    }

    /// RUNNING to FAILED, keeping the error text verbatim.
    pub fn mark_failed(&mut self, id: &str, error: impl Into<String>) -> Result<()> {
        let task = self.task_mut(id)?;
        if task.status != TaskStatus::Running {
            return Err(invalid(id, task.status, TaskStatus::Failed));
        }
        task.status = TaskStatus::Failed;
        task.last_error = Some(error.into());
        task.round_attempts = 0;
        self.refresh_counts();
        Ok(())
    }

    /// Record the error of an attempt that will be retried in place.
    pub fn note_attempt_error(&mut self, id: &str, error: impl Into<String>) -> Result<()> {
        let task = self.task_mut(id)?;
        if task.status != TaskStatus::Running {
            return Err(invalid(id, task.status, TaskStatus::Running));
        }
        task.last_error = Some(error.into());
        Ok(())
    }

    /// Operator retry: FAILED to PENDING, error cleared, one attempt added.
    pub fn reset_for_retry(&mut self, id: &str) -> Result<()> {
        let task = self.task_mut(id)?;
        if task.status != TaskStatus::Failed {
            return Err(invalid(id, task.status, TaskStatus::Pending));
        }
        task.status = TaskStatus::Pending;
        task.last_error = None;
        task.attempts += 1;
        self.refresh_counts();
        Ok(())
    }

    /// Reset every FAILED task for retry. Returns the ids that were reset.
    pub fn reset_all_failed(&mut self) -> Vec<String> {
        let mut reset = Vec::new();
        for task in self.tasks.iter_mut() {
            if task.status == TaskStatus::Failed {
                task.status = TaskStatus::Pending;
                task.last_error = None;
                task.attempts += 1;
                reset.push(task.id.clone());
            }
        }
        self.refresh_counts();
        reset
    }

    /// Crash recovery: a task found RUNNING was interrupted mid-attempt and
    /// goes back to PENDING. Attempts already counted are kept, including
    /// those of the interrupted round.
    pub fn recover_interrupted(&mut self) -> Vec<String> {
        let recovered: Vec<String> = self
            .tasks
            .iter_mut()
            .filter(|t| t.status == TaskStatus::Running)
            .map(|t| {
                t.status = TaskStatus::Pending;
                t.id.clone()
            })
            .collect();
        if !recovered.is_empty() {
            tracing::warn!(
                run_id = %self.run_id,
                tasks = ?recovered,
                "Recovered interrupted tasks"
            );
        }
        recovered
    }

    // -----------------------------------------------------------------------
    // Counters
    // -----------------------------------------------------------------------

    pub fn refresh_counts(&mut self) {
        self.total = self.tasks.len();
        self.completed = self.count(TaskStatus::Completed);
        self.failed = self.count(TaskStatus::Failed);
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    /// `"X/Y completed, Z failed"`
    pub fn progress(&self) -> String {
        format!(
            "{}/{} completed, {} failed",
            self.count(TaskStatus::Completed),
            self.tasks.len(),
            self.count(TaskStatus::Failed)
        )
    }
}

fn invalid(task: &str, from: TaskStatus, to: TaskStatus) -> StagehandError {
    StagehandError::InvalidTransition {
        task: task.to_string(),
        from,
        to,
    }
}

/// Decode a persisted checkpoint. Stored counters are ignored.
pub(crate) fn decode(bytes: &[u8]) -> std::result::Result<Checkpoint, StoreError> {
    let mut checkpoint: Checkpoint = serde_json::from_slice(bytes)?;
    checkpoint.refresh_counts();
    Ok(checkpoint)
}

/// Write a uniquely named temp file next to `path`, sync it, and rename it
/// over `path`, creating parent directories. Concurrent writers never share
/// a temp file; the last rename wins.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = tmp_path(path);
    let result = match write_synced(&tmp, bytes).await {
        Ok(()) => tokio::fs::rename(&tmp, path).await,
        Err(e) => Err(e),
    };
    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    result
}

async fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
    path.with_file_name(name)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::TaskSpec;

    fn sample() -> Checkpoint {
        let mut cp = Checkpoint::new("run-1", "todo app");
        let graph = TaskGraph::build(vec![
            TaskSpec::new("index.html").with_id("a"),
            TaskSpec::new("app.js").with_id("b").depends_on(["a"]),
        ])
        .unwrap();
        cp.install_graph("ids: #list", graph);
        cp
    }

    // 1. Legal lifecycle
    #[test]
    fn pending_running_completed() {
        let mut cp = sample();
        cp.mark_running("a").unwrap();
        assert_eq!(cp.task("a").unwrap().status, TaskStatus::Running);
        assert_eq!(cp.task("a").unwrap().attempts, 1);

        cp.mark_completed("a", "<html/>").unwrap();
        let a = cp.task("a").unwrap();
        assert_eq!(a.status, TaskStatus::Completed);
        assert_eq!(a.content.as_deref(), Some("<html/>"));
        assert_eq!(cp.completed, 1);
    }

    // 2. Re-attempt in place counts attempts
    #[test]
    fn running_to_running_increments_attempts() {
        let mut cp = sample();
        cp.mark_running("a").unwrap();
        cp.note_attempt_error("a", "timeout").unwrap();
        cp.mark_running("a").unwrap();
        let a = cp.task("a").unwrap();
        assert_eq!(a.attempts, 2);
        assert_eq!(a.last_error.as_deref(), Some("timeout"));

        cp.mark_completed("a", "ok").unwrap();
        assert!(cp.task("a").unwrap().last_error.is_none());
    }

    // 3. Illegal transitions are rejected
    #[test]
    fn completed_cannot_run_again() {
        let mut cp = sample();
        cp.mark_running("a").unwrap();
        cp.mark_completed("a", "x").unwrap();
        let err = cp.mark_running("a").unwrap_err();
        assert!(matches!(
            err,
            StagehandError::InvalidTransition {
                from: TaskStatus::Completed,
                to: TaskStatus::Running,
                ..
            }
        ));
    }

    #[test]
    fn pending_cannot_complete_or_fail() {
        let mut cp = sample();
        assert!(cp.mark_completed("a", "x").is_err());
        assert!(cp.mark_failed("a", "x").is_err());
        assert_eq!(cp.task("a").unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn failed_cannot_run_without_retry() {
        let mut cp = sample();
        cp.mark_running("a").unwrap();
        cp.mark_failed("a", "boom").unwrap();
        assert!(cp.mark_running("a").is_err());
    }

    #[test]
    fn only_failed_tasks_can_be_reset() {
        let mut cp = sample();
        assert!(cp.reset_for_retry("a").is_err());
    }

    #[test]
    fn unknown_task_is_reported() {
        let mut cp = sample();
        let err = cp.mark_running("nope").unwrap_err();
        assert!(matches!(err, StagehandError::TaskNotFound { .. }));
    }

    // 4. Operator retry
    #[test]
    fn reset_for_retry_clears_error_and_counts_attempt() {
        let mut cp = sample();
        cp.mark_running("a").unwrap();
        cp.mark_failed("a", "boom").unwrap();
        assert_eq!(cp.failed, 1);

        cp.reset_for_retry("a").unwrap();
        let a = cp.task("a").unwrap();
        assert_eq!(a.status, TaskStatus::Pending);
        assert!(a.last_error.is_none());
        assert_eq!(a.attempts, 2);
        assert_eq!(cp.failed, 0);
    }

    #[test]
    fn reset_all_failed_touches_only_failed() {
        let mut cp = sample();
        cp.mark_running("a").unwrap();
        cp.mark_failed("a", "boom").unwrap();

        let reset = cp.reset_all_failed();
        assert_eq!(reset, vec!["a"]);
        assert_eq!(cp.task("a").unwrap().attempts, 2);
        assert_eq!(cp.task("b").unwrap().attempts, 0);
        assert_eq!(cp.task("b").unwrap().status, TaskStatus::Pending);
    }

    // 5. Crash recovery
    #[test]
    fn recover_interrupted_resets_running() {
        let mut cp = sample();
        cp.mark_running("a").unwrap();
        let recovered = cp.recover_interrupted();
        assert_eq!(recovered, vec!["a"]);
        let a = cp.task("a").unwrap();
        assert_eq!(a.status, TaskStatus::Pending);
        assert_eq!(a.attempts, 1);
    }

    #[test]
    fn progress_line() {
        let mut cp = sample();
        cp.mark_running("a").unwrap();
        cp.mark_completed("a", "").unwrap();
        assert_eq!(cp.progress(), "1/2 completed, 0 failed");
    }

    #[test]
    fn round_attempts_survive_recovery_and_reset_when_the_round_ends() {
        let mut cp = sample();
        cp.mark_running("a").unwrap();
        cp.mark_running("a").unwrap();
        cp.recover_interrupted();
        assert_eq!(cp.task("a").unwrap().round_attempts, 2);

        cp.mark_running("a").unwrap();
        assert_eq!(cp.task("a").unwrap().round_attempts, 3);
        cp.mark_failed("a", "boom").unwrap();
        assert_eq!(cp.task("a").unwrap().round_attempts, 0);
        assert_eq!(cp.task("a").unwrap().attempts, 3);

        cp.reset_for_retry("a").unwrap();
        cp.mark_running("a").unwrap();
        assert_eq!(cp.task("a").unwrap().round_attempts, 1);
        cp.mark_completed("a", "ok").unwrap();
        assert_eq!(cp.task("a").unwrap().round_attempts, 0);
    }

    // 6. Atomic writes
    #[tokio::test]
    async fn write_atomic_creates_parents_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("checkpoint.json");
        write_atomic(&path, b"{}").await.unwrap();
        write_atomic(&path, b"{\"v\": 2}").await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"v\": 2}");
        let names: Vec<_> = std::fs::read_dir(dir.path().join("nested"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["checkpoint.json"]);
    }

    #[tokio::test]
    async fn concurrent_writers_do_not_clobber_each_other() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        let writers: Vec<_> = (0..16)
            .map(|i| {
                let path = path.clone();
                tokio::spawn(async move { write_atomic(&path, format!("writer {i}").as_bytes()).await })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("writer "));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn stored_counters_are_not_trusted() {
        let mut cp = sample();
        cp.completed = 99;
        let bytes = serde_json::to_vec(&cp).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.completed, 0);
        assert_eq!(decoded.total, 2);
    }
}
