//! Run-level stage machine and review decisions.
//!
//! ```text
//! Planning -> PlanReview -> Architecting -> TaskReview -> Coding -> Completed | Failed
//!     ^           |             ^              |
//!     +-----------+ edit/regen  +--------------+ edit/regen
//! ```
//!
//! Review stages hold until a decision arrives. Coding is the only stage with
//! a task-level loop; the engine drives it.

use serde::{Deserialize, Serialize};
use stagehand_types::{Result, Stage, StagehandError, TaskStatus};

use crate::checkpoint::{Checkpoint, StageFailure};
use crate::scheduler;

/// Human decision at a review gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "instructions", rename_all = "snake_case")]
pub enum ReviewDecision {
    /// Accept the artifact and move to the next generative stage.
    Approve,
    /// Send the artifact back with instructions for the producing stage.
    Edit(String),
    /// Discard the artifact and produce it again from scratch.
    Regenerate,
}

/// The two review boundaries of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewGate {
    Plan,
    Tasks,
}

impl ReviewGate {
    pub fn for_stage(stage: Stage) -> Option<Self> {
        match stage {
            Stage::PlanReview => Some(ReviewGate::Plan),
            Stage::TaskReview => Some(ReviewGate::Tasks),
            _ => None,
        }
    }
}

impl std::fmt::Display for ReviewGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReviewGate::Plan => f.write_str("plan"),
            ReviewGate::Tasks => f.write_str("tasks"),
        }
    }
}

/// Externally visible state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Planning,
    AwaitingPlanReview,
    Architecting,
    AwaitingTaskReview,
    Generating,
    Stalled,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn of(checkpoint: &Checkpoint) -> Self {
        match checkpoint.stage {
            Stage::Planning => RunStatus::Planning,
            Stage::PlanReview => RunStatus::AwaitingPlanReview,
            Stage::Architecting => RunStatus::Architecting,
            Stage::TaskReview => RunStatus::AwaitingTaskReview,
            Stage::Coding if checkpoint.count(TaskStatus::Running) > 0 => RunStatus::Generating,
            Stage::Coding => match scheduler::schedule(checkpoint) {
                Err(_) => RunStatus::Stalled,
                Ok(_) => RunStatus::Generating,
            },
            Stage::Completed => RunStatus::Completed,
            Stage::Failed => RunStatus::Failed,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Planning => "planning",
            RunStatus::AwaitingPlanReview => "awaiting_plan_review",
            RunStatus::Architecting => "architecting",
            RunStatus::AwaitingTaskReview => "awaiting_task_review",
            RunStatus::Generating => "generating",
            RunStatus::Stalled => "stalled",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Apply a review decision to a run waiting at a gate. Returns the new stage.
///
/// Imported runs carry no plan, so their tasks can be approved but not sent
/// back to the architect.
pub fn apply_review(checkpoint: &mut Checkpoint, decision: ReviewDecision) -> Result<Stage> {
    let next = match (checkpoint.stage, decision) {
        (Stage::TaskReview, ReviewDecision::Edit(_) | ReviewDecision::Regenerate)
            if checkpoint.plan.is_none() =>
        {
            return Err(StagehandError::WrongStage {
                run_id: checkpoint.run_id.clone(),
                stage: Stage::TaskReview,
                action: "task revisions without a plan to architect from".into(),
            })
        }
        (Stage::PlanReview, ReviewDecision::Approve) => {
            checkpoint.instructions = None;
            Stage::Architecting
        }
        (Stage::PlanReview, ReviewDecision::Edit(text)) => {
            checkpoint.instructions = Some(text);
            Stage::Planning
        }
        (Stage::PlanReview, ReviewDecision::Regenerate) => {
            checkpoint.plan = None;
            checkpoint.instructions = None;
            Stage::Planning
        }
        (Stage::TaskReview, ReviewDecision::Approve) => {
            checkpoint.instructions = None;
            Stage::Coding
        }
        (Stage::TaskReview, ReviewDecision::Edit(text)) => {
            checkpoint.instructions = Some(text);
            Stage::Architecting
        }
        (Stage::TaskReview, ReviewDecision::Regenerate) => {
            checkpoint.tasks.clear();
            checkpoint.execution_order.clear();
            checkpoint.global_context.clear();
            checkpoint.instructions = None;
            checkpoint.refresh_counts();
            Stage::Architecting
        }
        (stage, _) => {
            return Err(StagehandError::WrongStage {
                run_id: checkpoint.run_id.clone(),
                stage,
                action: "a review decision".into(),
            })
        }
    };
    enter(checkpoint, next);
    Ok(next)
}

/// Stage that follows a successful generative stage.
pub fn after_generation(stage: Stage) -> Option<Stage> {
    match stage {
        Stage::Planning => Some(Stage::PlanReview),
        Stage::Architecting => Some(Stage::TaskReview),
        _ => None,
    }
}

/// Record a generator failure and move the run to `Failed`.
pub fn fail_stage(checkpoint: &mut Checkpoint, message: impl Into<String>) {
    let failure = StageFailure {
        stage: checkpoint.stage,
        message: message.into(),
    };
    enter(checkpoint, Stage::Failed);
    checkpoint.stage_error = Some(failure);
}

/// After an operator retry a failed run resumes where it failed: the
/// generative stage recorded in `stage_error`, otherwise Coding.
pub fn resume_after_retry(checkpoint: &mut Checkpoint) {
    if checkpoint.stage != Stage::Failed {
        return;
    }
    let next = checkpoint
        .stage_error
        .take()
        .map(|f| f.stage)
        .unwrap_or(Stage::Coding);
    enter(checkpoint, next);
}

/// Move to `next`, logging the change.
pub fn enter(checkpoint: &mut Checkpoint, next: Stage) {
    if checkpoint.stage != next {
        tracing::info!(
            run_id = %checkpoint.run_id,
            from = %checkpoint.stage,
            to = %next,
            "Stage changed"
        );
    }
    checkpoint.stage = next;
    if next != Stage::Failed {
        checkpoint.stage_error = None;
    }
}
