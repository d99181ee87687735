//! Resumable pipeline execution engine.
//!
//! This crate implements the Stagehand run lifecycle: task graph validation,
//! durable checkpoints, dependency-aware scheduling, review-gated stages,
//! bounded retries, and crash recovery.

pub mod checkpoint;
pub mod engine;
pub mod events;
pub mod export;
pub mod graph;
pub mod plan;
pub mod planner;
pub mod producer;
pub mod retriever;
pub mod retry;
pub mod review;
pub mod scheduler;
pub mod stage;
pub mod store;

pub use checkpoint::{Checkpoint, StageFailure};
pub use engine::{AdvanceOutcome, EngineConfig, PipelineEngine, RunSummary, TaskSummary};
pub use events::{EventEmitter, PipelineEvent};
pub use export::{export_checkpoint, safe_relative_path, ExportManifest, ExportedFile};
pub use graph::{Task, TaskGraph, TaskSpec};
pub use plan::{normalize_tasks, NormalizedPlan};
pub use planner::{CommandPlanner, Planner, StaticPlanner};
pub use producer::{CommandProducer, DependencyOutput, DryRunProducer, Producer, ProducerContext};
pub use retriever::{
    detect_tech, BestEffortRetriever, NoopRetriever, PatternRetriever, Snippet, SnippetDirRetriever,
};
pub use retry::{execute_with_retry, BackoffPolicy, RetryDecision, RetryPolicy};
pub use review::{AutoApprove, FixedDecision, NoSignal, RecordingReviewer, ReviewSource};
pub use scheduler::{is_complete, is_successful, next_pending, schedule};
pub use stage::{ReviewDecision, ReviewGate, RunStatus};
pub use store::{load, load_or_create, save, CheckpointStore, FileStore, MemoryStore};
