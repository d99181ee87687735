//! Dependency-aware task selection.
//!
//! The scheduler walks the execution order and hands out the first PENDING
//! task whose dependencies have all COMPLETED. When nothing is eligible but
//! the run is not finished, the run is stalled and the report names the
//! blocked tasks and the failures holding them back.

use std::collections::HashSet;

use stagehand_types::{StallError, TaskStatus};

use crate::checkpoint::Checkpoint;
use crate::graph::Task;

/// First PENDING task in execution order whose dependencies are COMPLETED.
pub fn next_pending(checkpoint: &Checkpoint) -> Option<&Task> {
    checkpoint
        .execution_order
        .iter()
        .filter_map(|id| checkpoint.task(id))
        .filter(|task| task.status == TaskStatus::Pending)
        .find(|task| {
            task.dependencies
                .iter()
                .all(|dep| checkpoint.is_task_completed(dep))
        })
}

/// `Ok(Some(task))` when work is ready, `Ok(None)` when every task is
/// terminal, `Err` when the run is stalled.
pub fn schedule(checkpoint: &Checkpoint) -> Result<Option<&Task>, StallError> {
    if let Some(task) = next_pending(checkpoint) {
        return Ok(Some(task));
    }
    if is_complete(checkpoint) {
        return Ok(None);
    }
    Err(stall_report(checkpoint))
}

/// Every task is COMPLETED or FAILED.
pub fn is_complete(checkpoint: &Checkpoint) -> bool {
    checkpoint.tasks.iter().all(|t| t.status.is_terminal())
}

/// Complete with zero FAILED tasks.
pub fn is_successful(checkpoint: &Checkpoint) -> bool {
    checkpoint
        .tasks
        .iter()
        .all(|t| t.status == TaskStatus::Completed)
}

/// Blocked tasks are the non-terminal ones in execution order; failures are
/// the FAILED tasks reachable through their dependencies.
pub fn stall_report(checkpoint: &Checkpoint) -> StallError {
    let blocked: Vec<String> = ordered(checkpoint)
        .filter(|t| !t.status.is_terminal())
        .map(|t| t.id.clone())
        .collect();

    let mut seen: HashSet<&str> = HashSet::new();
    let mut stack: Vec<&str> = blocked.iter().map(String::as_str).collect();
    while let Some(id) = stack.pop() {
        if let Some(task) = checkpoint.task(id) {
            for dep in &task.dependencies {
                if seen.insert(dep.as_str()) {
                    stack.push(dep.as_str());
                }
            }
        }
    }
    let failed = ordered(checkpoint)
        .filter(|t| t.status == TaskStatus::Failed && seen.contains(t.id.as_str()))
        .map(|t| t.id.clone())
        .collect();

    StallError { blocked, failed }
}

fn ordered(checkpoint: &Checkpoint) -> impl Iterator<Item = &Task> {
    checkpoint
        .execution_order
        .iter()
        .filter_map(move |id| checkpoint.task(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{TaskGraph, TaskSpec};

    /// A, B independent; C depends on both.
    fn abc() -> Checkpoint {
        let mut cp = Checkpoint::new("run", "abc");
        let graph = TaskGraph::build(vec![
            TaskSpec::new("a").with_id("a"),
            TaskSpec::new("b").with_id("b"),
            TaskSpec::new("c").with_id("c").depends_on(["a", "b"]),
        ])
        .unwrap();
        cp.install_graph("", graph);
        cp
    }

    fn complete(cp: &mut Checkpoint, id: &str) {
        cp.mark_running(id).unwrap();
        cp.mark_completed(id, id).unwrap();
    }

    fn fail(cp: &mut Checkpoint, id: &str) {
        cp.mark_running(id).unwrap();
        cp.mark_failed(id, "boom").unwrap();
    }

    #[test]
    fn picks_first_ready_in_order() {
        let cp = abc();
        assert_eq!(next_pending(&cp).unwrap().id, "a");
    }

    #[test]
    fn never_returns_task_with_incomplete_dependency() {
        let mut cp = abc();
        complete(&mut cp, "a");
        assert_eq!(next_pending(&cp).unwrap().id, "b");
        cp.mark_running("b").unwrap();
        // C waits on B which is still running.
        assert!(next_pending(&cp).is_none());
    }

    #[test]
    fn skips_non_pending_tasks() {
        let mut cp = abc();
        fail(&mut cp, "a");
        assert_eq!(next_pending(&cp).unwrap().id, "b");
    }

    #[test]
    fn complete_and_successful() {
        let mut cp = abc();
        for id in ["a", "b", "c"] {
            complete(&mut cp, id);
        }
        assert!(is_complete(&cp));
        assert!(is_successful(&cp));
        assert!(matches!(schedule(&cp), Ok(None)));
    }

    #[test]
    fn complete_with_failure_is_not_successful() {
        let mut cp = abc();
        complete(&mut cp, "a");
        complete(&mut cp, "b");
        fail(&mut cp, "c");
        assert!(is_complete(&cp));
        assert!(!is_successful(&cp));
    }

    #[test]
    fn stall_is_distinct_from_completion() {
        let mut cp = abc();
        complete(&mut cp, "a");
        fail(&mut cp, "b");

        assert!(next_pending(&cp).is_none());
        assert!(!is_complete(&cp));
        let stall = schedule(&cp).unwrap_err();
        assert_eq!(stall.blocked, vec!["c"]);
        assert_eq!(stall.failed, vec!["b"]);
    }

    #[test]
    fn stall_traces_transitive_failures() {
        let mut cp = Checkpoint::new("run", "chain");
        let graph = TaskGraph::build(vec![
            TaskSpec::new("a").with_id("a"),
            TaskSpec::new("b").with_id("b").depends_on(["a"]),
            TaskSpec::new("c").with_id("c").depends_on(["b"]),
            TaskSpec::new("d").with_id("d"),
        ])
        .unwrap();
        cp.install_graph("", graph);
        fail(&mut cp, "a");
        fail(&mut cp, "d");

        let stall = schedule(&cp).unwrap_err();
        assert_eq!(stall.blocked, vec!["b", "c"]);
        assert_eq!(stall.failed, vec!["a"]);
    }

    #[test]
    fn empty_checkpoint_is_complete() {
        let cp = Checkpoint::new("run", "empty");
        assert!(matches!(schedule(&cp), Ok(None)));
    }
}
