//! Pipeline engine: drives runs through their stages and exposes the run
//! lifecycle operations.
//!
//! [`PipelineEngine::advance`] is re-entrant. Every call reloads the run from
//! the store, recovers interrupted tasks, and continues from the persisted
//! stage until the run reaches a review gate, stalls, or finishes. Nothing
//! about a run lives in memory between calls.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use stagehand_types::{Result, Stage, StagehandError, StallError, TaskStatus};

use crate::checkpoint::{Checkpoint, StageFailure};
use crate::events::{EventEmitter, PipelineEvent};
use crate::export::{export_checkpoint, ExportManifest};
use crate::graph::{Task, TaskGraph};
use crate::plan::normalize_tasks;
use crate::planner::Planner;
use crate::producer::{DependencyOutput, Producer, ProducerContext};
use crate::retriever::BestEffortRetriever;
use crate::retry::{execute_with_retry, RetryDecision, RetryPolicy};
use crate::review::ReviewSource;
use crate::scheduler;
use crate::stage::{self, ReviewDecision, ReviewGate, RunStatus};
use crate::store::{self, CheckpointStore};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Engine-level knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub retry: RetryPolicy,
    /// Reference snippets fetched per task; 0 disables retrieval.
    pub patterns_per_task: usize,
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            patterns_per_task: 2,
            event_capacity: 256,
        }
    }
}

impl EngineConfig {
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_patterns_per_task(mut self, n: usize) -> Self {
        self.patterns_per_task = n;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }
}

/// Where a call to [`PipelineEngine::advance`] stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum AdvanceOutcome {
    /// Suspended at a gate until a decision arrives.
    AwaitingReview { gate: ReviewGate },
    /// No eligible task, but the run is not finished. Stage stays Coding.
    Stalled(StallError),
    Completed,
    /// Every task is terminal and at least one FAILED, or a generative
    /// stage failed earlier and has not been retried.
    Failed {
        failed: Vec<String>,
        stage_error: Option<StageFailure>,
    },
}

/// Status view of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub project_name: String,
    pub status: RunStatus,
    pub stage: Stage,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub pending: usize,
    pub progress: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub stage_error: Option<StageFailure>,
    pub stall: Option<StallError>,
}

impl RunSummary {
    pub fn of(cp: &Checkpoint) -> Self {
        let status = RunStatus::of(cp);
        let stall = match status {
            RunStatus::Stalled => scheduler::schedule(cp).err(),
            _ => None,
        };
        Self {
            run_id: cp.run_id.clone(),
            project_name: cp.project_name.clone(),
            status,
            stage: cp.stage,
            total: cp.tasks.len(),
            completed: cp.count(TaskStatus::Completed),
            failed: cp.count(TaskStatus::Failed),
            pending: cp.count(TaskStatus::Pending),
            progress: cp.progress(),
            created_at: cp.created_at,
            updated_at: cp.updated_at,
            stage_error: cp.stage_error.clone(),
            stall,
        }
    }
}

/// One row of [`PipelineEngine::list_tasks`]; content is fetched separately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: String,
    pub path: String,
    pub kind: String,
    pub status: TaskStatus,
    pub attempts: u32,
    pub dependencies: Vec<String>,
    pub last_error: Option<String>,
    pub has_content: bool,
}

impl From<&Task> for TaskSummary {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            path: task.path.clone(),
            kind: task.kind.clone(),
            status: task.status,
            attempts: task.attempts,
            dependencies: task.dependencies.clone(),
            last_error: task.last_error.clone(),
            has_content: task.content.is_some(),
        }
    }
}

// ---------------------------------------------------------------------------
// PipelineEngine
// ---------------------------------------------------------------------------

/// Shared by every run; the run id is the only thing that separates them.
pub struct PipelineEngine {
    store: Arc<dyn CheckpointStore>,
    planner: Arc<dyn Planner>,
    producer: Arc<dyn Producer>,
    retriever: BestEffortRetriever,
    config: EngineConfig,
    events: EventEmitter,
}

impl PipelineEngine {
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        planner: Arc<dyn Planner>,
        producer: Arc<dyn Producer>,
    ) -> Self {
        let config = EngineConfig::default();
        Self {
            store,
            planner,
            producer,
            retriever: BestEffortRetriever::noop(),
            events: EventEmitter::new(config.event_capacity),
            config,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.events = EventEmitter::new(config.event_capacity);
        self.config = config;
        self
    }

    pub fn with_retriever(mut self, retriever: BestEffortRetriever) -> Self {
        self.retriever = retriever;
        self
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn store(&self) -> &dyn CheckpointStore {
        self.store.as_ref()
    }

    // -----------------------------------------------------------------------
    // Lifecycle operations
    // -----------------------------------------------------------------------

    /// Start a run at Planning.
    pub async fn create_run(&self, project_name: &str, prompt: &str) -> Result<Checkpoint> {
        let mut cp = self.start(project_name).await?;
        cp.prompt = prompt.to_string();
        self.save(&mut cp).await?;
        tracing::info!(run_id = %cp.run_id, project = %project_name, "Run created");
        Ok(cp)
    }

    /// Start a run from a ready task payload. The run waits at the task
    /// review gate. An invalid payload is rejected before anything is stored.
    pub async fn import_run(&self, project_name: &str, payload: &Value) -> Result<Checkpoint> {
        let normalized = normalize_tasks(payload)?;
        let graph = TaskGraph::build(normalized.tasks)?;
        let mut cp = self.start(project_name).await?;
        cp.install_graph(normalized.global_context, graph);
        cp.stage = Stage::TaskReview;
        self.save(&mut cp).await?;
        tracing::info!(run_id = %cp.run_id, tasks = cp.total, "Run imported");
        Ok(cp)
    }

    pub async fn status(&self, run_id: &str) -> Result<RunSummary> {
        let cp = self.store.get(run_id).await?;
        Ok(RunSummary::of(&cp))
    }

    /// Summaries of every stored run. Runs that cannot be read are skipped.
    pub async fn list_runs(&self) -> Result<Vec<RunSummary>> {
        let mut runs = Vec::new();
        for run_id in self.store.list().await? {
            match self.store.get(&run_id).await {
                Ok(cp) => runs.push(RunSummary::of(&cp)),
                Err(e) => tracing::warn!(run_id = %run_id, error = %e, "Skipping unreadable run"),
            }
        }
        Ok(runs)
    }

    /// Tasks in execution order.
    pub async fn list_tasks(&self, run_id: &str) -> Result<Vec<TaskSummary>> {
        let cp = self.store.get(run_id).await?;
        Ok(cp
            .execution_order
            .iter()
            .filter_map(|id| cp.task(id))
            .map(TaskSummary::from)
            .collect())
    }

    /// Content of one task, `None` until it has completed.
    pub async fn task_content(&self, run_id: &str, task_id: &str) -> Result<Option<String>> {
        let cp = self.store.get(run_id).await?;
        let task = cp.task(task_id).ok_or_else(|| StagehandError::TaskNotFound {
            run_id: run_id.to_string(),
            task: task_id.to_string(),
        })?;
        Ok(task.content.clone())
    }

    pub async fn export_run(&self, run_id: &str, dest: &Path) -> Result<ExportManifest> {
        let cp = self.store.get(run_id).await?;
        export_checkpoint(&cp, dest).await
    }

    /// Reset one FAILED task to PENDING and reopen the run for coding.
    pub async fn retry_task(&self, run_id: &str, task_id: &str) -> Result<RunSummary> {
        let mut cp = self.load(run_id).await?;
        cp.reset_for_retry(task_id)?;
        tracing::info!(run_id = %run_id, task_id = %task_id, "Task reset for retry");
        self.reopen(&mut cp);
        self.save(&mut cp).await?;
        Ok(RunSummary::of(&cp))
    }

    /// Reset every FAILED task. A run whose planner or architect failed goes
    /// back to that stage.
    pub async fn retry_failed(&self, run_id: &str) -> Result<(Vec<String>, RunSummary)> {
        let mut cp = self.load(run_id).await?;
        let reset = cp.reset_all_failed();
        tracing::info!(run_id = %run_id, tasks = ?reset, "Failed tasks reset for retry");
        self.reopen(&mut cp);
        self.save(&mut cp).await?;
        Ok((reset, RunSummary::of(&cp)))
    }

    /// Throw away everything generated for a run and plan it again from its
    /// prompt. Imported runs have no prompt and are rejected.
    pub async fn regenerate_run(&self, run_id: &str) -> Result<RunSummary> {
        let mut cp = self.load(run_id).await?;
        if cp.prompt.trim().is_empty() {
            return Err(StagehandError::WrongStage {
                run_id: run_id.to_string(),
                stage: cp.stage,
                action: "regeneration without a prompt".into(),
            });
        }
        cp.tasks.clear();
        cp.execution_order.clear();
        cp.global_context.clear();
        cp.plan = None;
        cp.instructions = None;
        cp.stage_error = None;
        if let Err(e) = self.store.clear_artifacts(run_id).await {
            tracing::warn!(run_id = %run_id, error = %e, "Old artifacts not removed");
        }
        self.transition(&mut cp, Stage::Planning);
        self.save(&mut cp).await?;
        tracing::info!(run_id = %run_id, "Run regenerated from its prompt");
        Ok(RunSummary::of(&cp))
    }

    pub async fn delete_run(&self, run_id: &str) -> Result<()> {
        self.store.delete(run_id).await?;
        Ok(())
    }

    /// Apply a decision to a run waiting at a gate.
    pub async fn submit_review(&self, run_id: &str, decision: ReviewDecision) -> Result<Stage> {
        let mut cp = self.load(run_id).await?;
        let from = cp.stage;
        let to = stage::apply_review(&mut cp, decision)?;
        self.emit_stage(&cp.run_id, from, to);
        self.save(&mut cp).await?;
        Ok(to)
    }

    // -----------------------------------------------------------------------
    // Driver
    // -----------------------------------------------------------------------

    /// Drive a run as far as it can go.
    pub async fn advance(&self, run_id: &str, reviews: &dyn ReviewSource) -> Result<AdvanceOutcome> {
        let mut cp = self.load(run_id).await?;

        loop {
            match cp.stage {
                Stage::Planning => self.run_planning(&mut cp).await?,
                Stage::Architecting => self.run_architecting(&mut cp).await?,
                Stage::PlanReview => {
                    if let Some(hold) = self.run_gate(&mut cp, ReviewGate::Plan, reviews).await? {
                        return Ok(hold);
                    }
                }
                Stage::TaskReview => {
                    if let Some(hold) = self.run_gate(&mut cp, ReviewGate::Tasks, reviews).await? {
                        return Ok(hold);
                    }
                }
                Stage::Coding => return self.run_coding(&mut cp).await,
                Stage::Completed => return Ok(AdvanceOutcome::Completed),
                Stage::Failed => return Ok(failed_outcome(&cp)),
            }
        }
    }

    /// Apply the pending decision, or report the hold when there is none.
    async fn run_gate(
        &self,
        cp: &mut Checkpoint,
        gate: ReviewGate,
        reviews: &dyn ReviewSource,
    ) -> Result<Option<AdvanceOutcome>> {
        let Some(decision) = reviews.decision(&cp.run_id, gate).await? else {
            tracing::info!(run_id = %cp.run_id, gate = %gate, "Awaiting review");
            self.events.emit(PipelineEvent::AwaitingReview {
                run_id: cp.run_id.clone(),
                stage: cp.stage,
            });
            return Ok(Some(AdvanceOutcome::AwaitingReview { gate }));
        };
        let from = cp.stage;
        let to = stage::apply_review(cp, decision)?;
        self.emit_stage(&cp.run_id, from, to);
        self.save(cp).await?;
        Ok(None)
    }

    async fn run_planning(&self, cp: &mut Checkpoint) -> Result<()> {
        let planner = self.planner.clone();
        let prompt = cp.prompt.clone();
        let instructions = cp.instructions.clone();
        let result = execute_with_retry(
            move || {
                let planner = planner.clone();
                let prompt = prompt.clone();
                let instructions = instructions.clone();
                async move { planner.plan(&prompt, instructions.as_deref()).await }
            },
            &self.config.retry,
            "planning",
        )
        .await;

        match result {
            Ok(plan) => {
                cp.plan = Some(plan);
                cp.instructions = None;
                self.transition(cp, Stage::PlanReview);
                self.save(cp).await
            }
            Err(e) => self.fail_generator(cp, e.message).await,
        }
    }

    async fn run_architecting(&self, cp: &mut Checkpoint) -> Result<()> {
        let planner = self.planner.clone();
        let plan = cp
            .plan
            .clone()
            .unwrap_or_else(|| json!({ "prompt": cp.prompt }));
        let instructions = cp.instructions.clone();
        let result = execute_with_retry(
            move || {
                let planner = planner.clone();
                let plan = plan.clone();
                let instructions = instructions.clone();
                async move { planner.architect(&plan, instructions.as_deref()).await }
            },
            &self.config.retry,
            "architecting",
        )
        .await;

        let payload = match result {
            Ok(payload) => payload,
            Err(e) => return self.fail_generator(cp, e.message).await,
        };
        let graph = normalize_tasks(&payload).and_then(|plan| {
            TaskGraph::build(plan.tasks).map(|graph| (plan.global_context, graph))
        });
        match graph {
            Ok((global_context, graph)) => {
                tracing::info!(run_id = %cp.run_id, tasks = graph.len(), "Task graph accepted");
                cp.install_graph(global_context, graph);
                cp.instructions = None;
                self.transition(cp, Stage::TaskReview);
                self.save(cp).await
            }
            Err(e) => {
                tracing::warn!(run_id = %cp.run_id, error = %e, "Task graph rejected");
                stage::fail_stage(cp, e.to_string());
                self.emit_stage(&cp.run_id, Stage::Architecting, Stage::Failed);
                self.save(cp).await?;
                Err(e.into())
            }
        }
    }

    async fn fail_generator(&self, cp: &mut Checkpoint, message: String) -> Result<()> {
        let failed_stage = cp.stage;
        tracing::warn!(run_id = %cp.run_id, stage = %failed_stage, error = %message, "Generator failed");
        stage::fail_stage(cp, message.clone());
        self.emit_stage(&cp.run_id, failed_stage, Stage::Failed);
        self.save(cp).await?;
        Err(StagehandError::Generator {
            stage: failed_stage,
            message,
        })
    }

    async fn run_coding(&self, cp: &mut Checkpoint) -> Result<AdvanceOutcome> {
        loop {
            let task = match scheduler::schedule(cp) {
                Ok(Some(task)) => task.clone(),
                Ok(None) => return self.finish(cp).await,
                Err(stall) => {
                    tracing::warn!(
                        run_id = %cp.run_id,
                        blocked = ?stall.blocked,
                        failed = ?stall.failed,
                        "Run stalled"
                    );
                    self.events.emit(PipelineEvent::RunStalled {
                        run_id: cp.run_id.clone(),
                        blocked: stall.blocked.clone(),
                        failed: stall.failed.clone(),
                    });
                    return Ok(AdvanceOutcome::Stalled(stall));
                }
            };
            self.run_task(cp, &task).await?;
        }
    }

    /// One scheduling round for `task`: attempt, re-attempt in place under
    /// the retry policy, and end COMPLETED or FAILED. Producer errors never
    /// escape this function.
    async fn run_task(&self, cp: &mut Checkpoint, task: &Task) -> Result<()> {
        let query = if task.content_spec.is_empty() {
            &task.description
        } else {
            &task.content_spec
        };
        let patterns = self
            .retriever
            .for_path(&task.path, query, self.config.patterns_per_task)
            .await;
        let mut ctx = producer_context(cp, task);
        ctx.patterns = patterns;

        loop {
            cp.mark_running(&task.id)?;
            self.save(cp).await?;
            let snapshot = match cp.task(&task.id) {
                Some(t) => t.clone(),
                None => task.clone(),
            };
            let attempt = snapshot.round_attempts;
            if attempt > self.config.retry.max_attempts {
                // Earlier attempts of this round were cut short by restarts.
                let error = snapshot.last_error.clone().unwrap_or_else(|| {
                    format!("Interrupted {} time(s) without finishing", attempt - 1)
                });
                return self.give_up(cp, task, attempt, error).await;
            }
            self.events.emit(PipelineEvent::TaskStarted {
                run_id: cp.run_id.clone(),
                task_id: task.id.clone(),
                attempt: snapshot.attempts,
            });
            ctx.attempt = attempt;

            let started = Instant::now();
            match self.producer.produce(&snapshot, &ctx).await {
                Ok(content) => {
                    if let Err(e) = self.store.put_artifact(&cp.run_id, &task.path, &content).await {
                        tracing::warn!(run_id = %cp.run_id, task_id = %task.id, error = %e, "Artifact not written");
                    }
                    cp.mark_completed(&task.id, content)?;
                    self.save(cp).await?;
                    let duration_ms = started.elapsed().as_millis() as u64;
                    tracing::info!(
                        run_id = %cp.run_id,
                        task_id = %task.id,
                        attempt = snapshot.attempts,
                        duration_ms,
                        progress = %cp.progress(),
                        "Task completed"
                    );
                    self.events.emit(PipelineEvent::TaskCompleted {
                        run_id: cp.run_id.clone(),
                        task_id: task.id.clone(),
                        duration_ms,
                    });
                    return Ok(());
                }
                Err(e) => match self.config.retry.decide(attempt, &e) {
                    RetryDecision::RetryAfter(delay) => {
                        tracing::warn!(
                            run_id = %cp.run_id,
                            task_id = %task.id,
                            attempt = snapshot.attempts,
                            delay_ms = %delay.as_millis(),
                            error = %e,
                            "Producer failed, retrying"
                        );
                        cp.note_attempt_error(&task.id, e.message.clone())?;
                        self.save(cp).await?;
                        self.events.emit(PipelineEvent::TaskRetrying {
                            run_id: cp.run_id.clone(),
                            task_id: task.id.clone(),
                            attempt: snapshot.attempts,
                            error: e.message.clone(),
                        });
                        ctx.previous_error = Some(e.message);
                        tokio::time::sleep(delay).await;
                    }
                    RetryDecision::GiveUp => {
                        return self.give_up(cp, task, attempt, e.message).await;
                    }
                },
            }
        }
    }

    /// End the round FAILED, keeping `error` verbatim.
    async fn give_up(&self, cp: &mut Checkpoint, task: &Task, attempt: u32, error: String) -> Result<()> {
        tracing::warn!(
            run_id = %cp.run_id,
            task_id = %task.id,
            attempt,
            error = %error,
            "Task failed"
        );
        cp.mark_failed(&task.id, error.clone())?;
        self.save(cp).await?;
        self.events.emit(PipelineEvent::TaskFailed {
            run_id: cp.run_id.clone(),
            task_id: task.id.clone(),
            error,
        });
        Ok(())
    }

    async fn finish(&self, cp: &mut Checkpoint) -> Result<AdvanceOutcome> {
        let next = if scheduler::is_successful(cp) {
            Stage::Completed
        } else {
            Stage::Failed
        };
        self.transition(cp, next);
        self.save(cp).await?;
        self.events.emit(PipelineEvent::RunCompleted {
            run_id: cp.run_id.clone(),
            completed: cp.completed,
            failed: cp.failed,
        });
        tracing::info!(run_id = %cp.run_id, stage = %next, progress = %cp.progress(), "Run finished");
        Ok(match next {
            Stage::Completed => AdvanceOutcome::Completed,
            _ => failed_outcome(cp),
        })
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn load(&self, run_id: &str) -> Result<Checkpoint> {
        store::load(self.store.as_ref(), run_id).await
    }

    /// Fresh checkpoint under a new run id, not yet written.
    async fn start(&self, project_name: &str) -> Result<Checkpoint> {
        let run_id = uuid::Uuid::new_v4().to_string();
        store::load_or_create(self.store.as_ref(), &run_id, project_name).await
    }

    async fn save(&self, cp: &mut Checkpoint) -> Result<()> {
        store::save(self.store.as_ref(), cp).await?;
        self.events.emit(PipelineEvent::CheckpointSaved {
            run_id: cp.run_id.clone(),
            completed: cp.completed,
            total: cp.total,
        });
        Ok(())
    }

    fn reopen(&self, cp: &mut Checkpoint) {
        let from = cp.stage;
        stage::resume_after_retry(cp);
        self.emit_stage(&cp.run_id, from, cp.stage);
    }

    fn transition(&self, cp: &mut Checkpoint, next: Stage) {
        let from = cp.stage;
        stage::enter(cp, next);
        self.emit_stage(&cp.run_id, from, next);
    }

    fn emit_stage(&self, run_id: &str, from: Stage, to: Stage) {
        if from != to {
            self.events.emit(PipelineEvent::StageChanged {
                run_id: run_id.to_string(),
                from,
                to,
            });
        }
    }
}

fn failed_outcome(cp: &Checkpoint) -> AdvanceOutcome {
    AdvanceOutcome::Failed {
        failed: cp
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .map(|t| t.id.clone())
            .collect(),
        stage_error: cp.stage_error.clone(),
    }
}

fn producer_context(cp: &Checkpoint, task: &Task) -> ProducerContext {
    let dependencies = task
        .dependencies
        .iter()
        .filter_map(|id| cp.task(id))
        .filter_map(|dep| {
            dep.content.as_ref().map(|content| DependencyOutput {
                id: dep.id.clone(),
                path: dep.path.clone(),
                content: content.clone(),
            })
        })
        .collect();
    ProducerContext {
        run_id: cp.run_id.clone(),
        project_name: cp.project_name.clone(),
        global_context: cp.global_context.clone(),
        project_files: cp.tasks.iter().map(|t| t.path.clone()).collect(),
        dependencies,
        patterns: Vec::new(),
        attempt: 1,
        previous_error: None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
