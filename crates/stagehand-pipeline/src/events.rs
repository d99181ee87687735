//! Pipeline event system for observability.
//!
//! Emits [`PipelineEvent`]s via a [`tokio::sync::broadcast`] channel so that
//! external observers (progress printers, websockets, tests) can follow a run
//! without coupling to the engine internals.

use serde::{Deserialize, Serialize};
use stagehand_types::Stage;

/// Events emitted while a run advances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    StageChanged {
        run_id: String,
        from: Stage,
        to: Stage,
    },
    AwaitingReview {
        run_id: String,
        stage: Stage,
    },
    TaskStarted {
        run_id: String,
        task_id: String,
        attempt: u32,
    },
    TaskRetrying {
        run_id: String,
        task_id: String,
        attempt: u32,
        error: String,
    },
    TaskCompleted {
        run_id: String,
        task_id: String,
        duration_ms: u64,
    },
    TaskFailed {
        run_id: String,
        task_id: String,
        error: String,
    },
    CheckpointSaved {
        run_id: String,
        completed: usize,
        total: usize,
    },
    RunStalled {
        run_id: String,
        blocked: Vec<String>,
        failed: Vec<String>,
    },
    RunCompleted {
        run_id: String,
        completed: usize,
        failed: usize,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<PipelineEvent>,
}

impl EventEmitter {
    /// Create a new emitter with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    ///
    /// If there are no active receivers the event is silently dropped.
    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}
