//! Shared types and errors for the Stagehand pipeline engine.
//!
//! This crate provides the foundational types used across all other Stagehand crates:
//! - `StagehandError`: unified error taxonomy, with one enum per concern
//!   (`GraphError`, `StoreError`, `ProducerError`, `StallError`)
//! - `TaskStatus`: lifecycle of a single task
//! - `Stage`: coarse lifecycle of a whole pipeline run

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A task plan that cannot be scheduled.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("Cyclic dependency between tasks: {}", tasks.join(", "))]
    CyclicDependency { tasks: Vec<String> },

    #[error("Task '{task}' depends on unknown task '{dependency}'")]
    DanglingDependency { task: String, dependency: String },

    #[error("Task '{task}' depends on itself")]
    SelfDependency { task: String },

    #[error("Duplicate task id '{id}'")]
    DuplicateTaskId { id: String },

    #[error("Plan contains no tasks")]
    EmptyPlan,

    #[error("Malformed plan: {0}")]
    Malformed(String),
}

/// Checkpoint persistence failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("No checkpoint found for run '{run_id}'")]
    NotFound { run_id: String },

    #[error("Invalid run id '{run_id}': only ASCII letters, digits, '-' and '_' are allowed")]
    InvalidKey { run_id: String },

    #[error("Checkpoint IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Checkpoint encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failure reported by a content producer for a single task.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ProducerError {
    pub message: String,
    pub retryable: bool,
}

impl ProducerError {
    /// A failure that may succeed when attempted again (timeouts, rate limits).
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure that will not go away by retrying.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns `true` if the error is transient and the operation may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

/// No task is eligible to run, yet the run is not complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error(
    "Pipeline stalled: {} task(s) blocked ({}) behind failed task(s) {}",
    blocked.len(),
    blocked.join(", "),
    failed.join(", ")
)]
pub struct StallError {
    /// Pending tasks that cannot be scheduled.
    pub blocked: Vec<String>,
    /// Failed tasks the blocked ones wait on, directly or transitively.
    pub failed: Vec<String>,
}

/// Unified error type for all Stagehand subsystems.
#[derive(Debug, thiserror::Error)]
pub enum StagehandError {
    #[error("Invalid task graph: {0}")]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Producer failed on task '{task}': {source}")]
    Producer {
        task: String,
        #[source]
        source: ProducerError,
    },

    #[error(transparent)]
    Stalled(#[from] StallError),

    #[error("Task '{task}' cannot move from {from} to {to}")]
    InvalidTransition {
        task: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Task '{task}' not found in run '{run_id}'")]
    TaskNotFound { run_id: String, task: String },

    #[error("Run '{run_id}' is at stage {stage}, which does not accept {action}")]
    WrongStage {
        run_id: String,
        stage: Stage,
        action: String,
    },

    #[error("{stage} generator failed: {message}")]
    Generator { stage: Stage, message: String },

    #[error("Refusing to export '{path}': path escapes the export directory")]
    UnsafePath { path: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl StagehandError {
    /// Returns `true` if the error only means "the run cannot make progress
    /// right now" rather than that the request itself was bad.
    pub fn is_stall(&self) -> bool {
        matches!(self, StagehandError::Stalled(_))
    }

    /// Returns `true` if the error is a missing checkpoint.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StagehandError::Store(StoreError::NotFound { .. }))
    }
}

/// A convenience alias for `Result<T, StagehandError>`.
pub type Result<T> = std::result::Result<T, StagehandError>;

// ---------------------------------------------------------------------------
// TaskStatus: per-task lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    /// COMPLETED or FAILED.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Stage: coarse pipeline lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[default]
    Planning,
    PlanReview,
    Architecting,
    TaskReview,
    Coding,
    Completed,
    Failed,
}

impl Stage {
    /// Stages that suspend until an external decision arrives.
    pub fn is_review(self) -> bool {
        matches!(self, Stage::PlanReview | Stage::TaskReview)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Completed | Stage::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Planning => "planning",
            Stage::PlanReview => "plan_review",
            Stage::Architecting => "architecting",
            Stage::TaskReview => "task_review",
            Stage::Coding => "coding",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
