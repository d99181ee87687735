//! Review signal sources for the plan and task gates.

use async_trait::async_trait;
use stagehand_types::Result;

use crate::stage::{ReviewDecision, ReviewGate};

/// Where review decisions come from. `Ok(None)` means no decision yet; the
/// run stays at its gate.
#[async_trait]
pub trait ReviewSource: Send + Sync {
    async fn decision(&self, run_id: &str, gate: ReviewGate) -> Result<Option<ReviewDecision>>;
}

// ---------------------------------------------------------------------------
// NoSignal
// ---------------------------------------------------------------------------

/// Never decides; runs suspend at every gate.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSignal;

#[async_trait]
impl ReviewSource for NoSignal {
    async fn decision(&self, _run_id: &str, _gate: ReviewGate) -> Result<Option<ReviewDecision>> {
        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// AutoApprove
// ---------------------------------------------------------------------------

/// Approves every gate immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

#[async_trait]
impl ReviewSource for AutoApprove {
    async fn decision(&self, run_id: &str, gate: ReviewGate) -> Result<Option<ReviewDecision>> {
        tracing::info!(run_id = %run_id, gate = %gate, "Auto-approving");
        Ok(Some(ReviewDecision::Approve))
    }
}

// ---------------------------------------------------------------------------
// FixedDecision
// ---------------------------------------------------------------------------

/// Returns the same decision for one gate and nothing for the other.
#[derive(Debug, Clone)]
pub struct FixedDecision {
    gate: ReviewGate,
    decision: ReviewDecision,
}

impl FixedDecision {
    pub fn new(gate: ReviewGate, decision: ReviewDecision) -> Self {
        Self { gate, decision }
    }
}

#[async_trait]
impl ReviewSource for FixedDecision {
    async fn decision(&self, _run_id: &str, gate: ReviewGate) -> Result<Option<ReviewDecision>> {
        Ok((gate == self.gate).then(|| self.decision.clone()))
    }
}

// ---------------------------------------------------------------------------
// RecordingReviewer
// ---------------------------------------------------------------------------

/// Plays back scripted decisions in order and records every gate it was
/// asked about. Once the script runs out it answers `None`.
pub struct RecordingReviewer {
    decisions: tokio::sync::Mutex<Vec<ReviewDecision>>,
    asked: tokio::sync::Mutex<Vec<(String, ReviewGate)>>,
}

impl RecordingReviewer {
    pub fn new(decisions: Vec<ReviewDecision>) -> Self {
        let mut reversed = decisions;
        reversed.reverse();
        Self {
            decisions: tokio::sync::Mutex::new(reversed),
            asked: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    pub async fn asked(&self) -> Vec<(String, ReviewGate)> {
        self.asked.lock().await.clone()
    }
}

#[async_trait]
impl ReviewSource for RecordingReviewer {
    async fn decision(&self, run_id: &str, gate: ReviewGate) -> Result<Option<ReviewDecision>> {
        self.asked.lock().await.push((run_id.to_string(), gate));
        Ok(self.decisions.lock().await.pop())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
