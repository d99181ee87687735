//! Plan and task-payload generators for the two generative stages before
//! coding. Output is untyped JSON; the task payload goes through
//! [`crate::plan::normalize_tasks`] before it reaches the graph.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use stagehand_types::ProducerError;

use crate::producer::run_command;

#[async_trait]
pub trait Planner: Send + Sync {
    /// Produce a project plan for `prompt`. `instructions` carries reviewer
    /// edits when the plan is being revised.
    async fn plan(&self, prompt: &str, instructions: Option<&str>) -> Result<Value, ProducerError>;

    /// Produce the task payload for an approved plan.
    async fn architect(
        &self,
        plan: &Value,
        instructions: Option<&str>,
    ) -> Result<Value, ProducerError>;
}

// ---------------------------------------------------------------------------
// CommandPlanner
// ---------------------------------------------------------------------------

/// Runs one shell command per stage with a JSON request on stdin and parses
/// stdout as JSON. Markdown code fences around the JSON are tolerated.
#[derive(Debug, Clone)]
pub struct CommandPlanner {
    plan_command: String,
    architect_command: String,
    timeout: Duration,
    workdir: Option<PathBuf>,
}

impl CommandPlanner {
    pub fn new(plan_command: impl Into<String>, architect_command: impl Into<String>) -> Self {
        Self {
            plan_command: plan_command.into(),
            architect_command: architect_command.into(),
            timeout: Duration::from_secs(300),
            workdir: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    async fn call(&self, command: &str, request: Value) -> Result<Value, ProducerError> {
        let stdin = serde_json::to_vec(&request)
            .map_err(|e| ProducerError::permanent(format!("Failed to encode request: {e}")))?;
        let stdout = run_command(command, &stdin, self.timeout, self.workdir.as_deref(), &[]).await?;
        parse_json_output(&stdout)
    }
}

#[async_trait]
impl Planner for CommandPlanner {
    async fn plan(&self, prompt: &str, instructions: Option<&str>) -> Result<Value, ProducerError> {
        self.call(
            &self.plan_command,
            json!({"prompt": prompt, "instructions": instructions}),
        )
        .await
    }

    async fn architect(
        &self,
        plan: &Value,
        instructions: Option<&str>,
    ) -> Result<Value, ProducerError> {
        self.call(
            &self.architect_command,
            json!({"plan": plan, "instructions": instructions}),
        )
        .await
    }
}

/// Parse generator output, stripping a surrounding ```json fence if present.
pub fn parse_json_output(raw: &str) -> Result<Value, ProducerError> {
    let mut text = raw.trim();
    if let Some(rest) = text.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        text = rest.trim_end().strip_suffix("```").unwrap_or(rest).trim();
    }
    serde_json::from_str(text)
        .map_err(|e| ProducerError::transient(format!("Generator output is not valid JSON: {e}")))
}

// ---------------------------------------------------------------------------
// StaticPlanner
// ---------------------------------------------------------------------------

/// Returns fixed artifacts. Used for imported plans and in tests.
#[derive(Debug)]
pub struct StaticPlanner {
    plan: Value,
    tasks: Value,
    plan_calls: AtomicUsize,
    architect_calls: AtomicUsize,
}

impl StaticPlanner {
    pub fn new(plan: Value, tasks: Value) -> Self {
        Self {
            plan,
            tasks,
            plan_calls: AtomicUsize::new(0),
            architect_calls: AtomicUsize::new(0),
        }
    }

    pub fn plan_calls(&self) -> usize {
        self.plan_calls.load(Ordering::SeqCst)
    }

    pub fn architect_calls(&self) -> usize {
        self.architect_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Planner for StaticPlanner {
    async fn plan(&self, _prompt: &str, _instructions: Option<&str>) -> Result<Value, ProducerError> {
        self.plan_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.plan.clone())
    }

    async fn architect(
        &self,
        _plan: &Value,
        _instructions: Option<&str>,
    ) -> Result<Value, ProducerError> {
        self.architect_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.tasks.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_fenced_json() {
        assert_eq!(parse_json_output("{\"a\": 1}").unwrap(), json!({"a": 1}));
        assert_eq!(
            parse_json_output("```json\n{\"a\": 1}\n```\n").unwrap(),
            json!({"a": 1})
        );
        assert_eq!(parse_json_output("```\n[1, 2]\n```").unwrap(), json!([1, 2]));
    }

    #[test]
    fn invalid_json_is_retryable() {
        let err = parse_json_output("Sure! Here is your plan:").unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn command_planner_passes_request_through() {
        let planner = CommandPlanner::new("cat", "cat");
        let plan = planner.plan("todo app", Some("add auth")).await.unwrap();
        assert_eq!(plan["prompt"], "todo app");
        assert_eq!(plan["instructions"], "add auth");

        let tasks = planner.architect(&json!({"name": "todo"}), None).await.unwrap();
        assert_eq!(tasks["plan"]["name"], "todo");
        assert!(tasks["instructions"].is_null());
    }

    #[tokio::test]
    async fn command_planner_failure_surfaces() {
        let planner = CommandPlanner::new("exit 1", "exit 1");
        assert!(planner.plan("x", None).await.is_err());
    }

    #[tokio::test]
    async fn static_planner_counts_calls() {
        let planner = StaticPlanner::new(json!({"name": "p"}), json!([{"path": "a.py"}]));
        planner.plan("x", None).await.unwrap();
        planner.architect(&json!({}), None).await.unwrap();
        planner.architect(&json!({}), Some("again")).await.unwrap();
        assert_eq!(planner.plan_calls(), 1);
        assert_eq!(planner.architect_calls(), 2);
    }
}
