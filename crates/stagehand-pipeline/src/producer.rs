//! Content producers: turn one task plus its context into file content.
//!
//! The engine never talks to a generation provider itself. It hands each
//! task to a [`Producer`] and only looks at success, failure, and the
//! returned content. Producers must be safe to call again for the same task.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stagehand_types::ProducerError;
use tokio::io::AsyncWriteExt;

use crate::graph::Task;
use crate::retriever::Snippet;

const MAX_ERROR_BYTES: usize = 4096;

/// Output of an already completed dependency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyOutput {
    pub id: String,
    pub path: String,
    pub content: String,
}

/// Everything a producer may use besides the task itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProducerContext {
    pub run_id: String,
    pub project_name: String,
    pub global_context: String,
    /// Paths of every file in the plan.
    pub project_files: Vec<String>,
    pub dependencies: Vec<DependencyOutput>,
    pub patterns: Vec<Snippet>,
    /// 1-based attempt number within the current round.
    pub attempt: u32,
    /// Error from the previous attempt, if this is a re-attempt.
    pub previous_error: Option<String>,
}

#[async_trait]
pub trait Producer: Send + Sync {
    async fn produce(&self, task: &Task, ctx: &ProducerContext) -> Result<String, ProducerError>;
}

// ---------------------------------------------------------------------------
// CommandProducer: one shell command per task
// ---------------------------------------------------------------------------

/// Request written to the command's stdin.
#[derive(Debug, Serialize)]
struct ProduceRequest<'a> {
    task: &'a Task,
    context: &'a ProducerContext,
}

/// Runs `sh -c <command>` with the task request as JSON on stdin and takes
/// stdout as the file content.
///
/// Timeouts, non-zero exits and empty output are retryable; a command that
/// cannot be spawned is not.
#[derive(Debug, Clone)]
pub struct CommandProducer {
    command: String,
    timeout: Duration,
    workdir: Option<PathBuf>,
}

impl CommandProducer {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
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
}

#[async_trait]
impl Producer for CommandProducer {
    async fn produce(&self, task: &Task, ctx: &ProducerContext) -> Result<String, ProducerError> {
        let request = serde_json::to_vec(&ProduceRequest { task, context: ctx })
            .map_err(|e| ProducerError::permanent(format!("Failed to encode request: {e}")))?;
        let stdout = run_command(
            &self.command,
            &request,
            self.timeout,
            self.workdir.as_deref(),
            &[
                ("STAGEHAND_RUN_ID", ctx.run_id.as_str()),
                ("STAGEHAND_TASK_ID", task.id.as_str()),
                ("STAGEHAND_TASK_PATH", task.path.as_str()),
            ],
        )
        .await?;
        if stdout.trim().is_empty() {
            return Err(ProducerError::transient("Producer returned no content"));
        }
        Ok(stdout)
    }
}

/// Spawn `sh -c command`, feed `stdin`, and collect stdout within `timeout`.
pub(crate) async fn run_command(
    command: &str,
    stdin: &[u8],
    timeout: Duration,
    workdir: Option<&std::path::Path>,
    envs: &[(&str, &str)],
) -> Result<String, ProducerError> {
    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);
    if let Some(dir) = workdir {
        cmd.current_dir(dir);
    }
    for (key, value) in envs {
        cmd.env(key, value);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| ProducerError::permanent(format!("Failed to spawn command: {e}")))?;

    // Fed from a separate task so a command that writes before draining stdin
    // cannot deadlock against us.
    if let Some(mut pipe) = child.stdin.take() {
        let input = stdin.to_vec();
        tokio::spawn(async move {
            // A command that ignores stdin may close it early; that is not a failure.
            if let Err(e) = pipe.write_all(&input).await {
                tracing::debug!(error = %e, "Command closed stdin early");
            }
        });
    }

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| {
            ProducerError::transient(format!(
                "Command timed out after {}ms",
                timeout.as_millis()
            ))
        })?
        .map_err(|e| ProducerError::transient(format!("Command execution failed: {e}")))?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let exit_code = output.status.code().unwrap_or(-1);
    tracing::debug!(exit_code, stdout_len = stdout.len(), "Command completed");

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ProducerError::transient(format!(
            "Command exited with code {}: {}",
            exit_code,
            truncate(stderr.trim(), MAX_ERROR_BYTES)
        )));
    }
    Ok(stdout)
}

/// Cut `s` to at most `max` bytes on a char boundary.
pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let cut = s
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|&i| i <= max)
        .last()
        .unwrap_or(0);
    format!("{}...(truncated)", &s[..cut])
}

// ---------------------------------------------------------------------------
// DryRunProducer
// ---------------------------------------------------------------------------

/// Produces a placeholder describing what would have been generated.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunProducer;

#[async_trait]
impl Producer for DryRunProducer {
    async fn produce(&self, task: &Task, _ctx: &ProducerContext) -> Result<String, ProducerError> {
        tracing::info!(task_id = %task.id, path = %task.path, "Dry run, content not generated");
        let spec = if task.content_spec.is_empty() {
            &task.description
        } else {
            &task.content_spec
        };
        Ok(format!("dry run: {} ({})\n{}\n", task.path, task.kind, spec))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{TaskGraph, TaskSpec};

    fn task() -> Task {
        TaskGraph::build(vec![TaskSpec::new("src/app.py")
            .with_id("t1")
            .with_kind("python")
            .with_spec("flask app")])
        .unwrap()
        .tasks()[0]
            .clone()
    }

    fn ctx() -> ProducerContext {
        ProducerContext {
            run_id: "run-1".into(),
            attempt: 1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn dry_run_echoes_spec() {
        let content = DryRunProducer.produce(&task(), &ctx()).await.unwrap();
        assert!(content.contains("src/app.py"));
        assert!(content.contains("flask app"));
    }

    #[tokio::test]
    async fn command_receives_request_on_stdin() {
        let producer = CommandProducer::new("cat");
        let content = producer.produce(&task(), &ctx()).await.unwrap();
        let echoed: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(echoed["task"]["id"], "t1");
        assert_eq!(echoed["context"]["run_id"], "run-1");
    }

    #[tokio::test]
    async fn command_sees_task_environment() {
        let producer = CommandProducer::new("echo \"$STAGEHAND_TASK_ID:$STAGEHAND_TASK_PATH\"");
        let content = producer.produce(&task(), &ctx()).await.unwrap();
        assert_eq!(content.trim(), "t1:src/app.py");
    }

    #[tokio::test]
    async fn nonzero_exit_is_retryable_and_carries_stderr() {
        let producer = CommandProducer::new("echo 'quota exceeded' >&2; exit 3");
        let err = producer.produce(&task(), &ctx()).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.message.contains("code 3"));
        assert!(err.message.contains("quota exceeded"));
    }

    #[tokio::test]
    async fn timeout_is_retryable() {
        let producer = CommandProducer::new("sleep 5").with_timeout(Duration::from_millis(100));
        let err = producer.produce(&task(), &ctx()).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.message.contains("timed out"));
    }

    #[tokio::test]
    async fn empty_output_is_retryable() {
        let producer = CommandProducer::new("true");
        let err = producer.produce(&task(), &ctx()).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn workdir_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "here").unwrap();
        let producer = CommandProducer::new("cat marker.txt").with_workdir(dir.path());
        let content = producer.produce(&task(), &ctx()).await.unwrap();
        assert_eq!(content, "here");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "é".repeat(10);
        let out = truncate(&s, 5);
        assert!(out.starts_with("éé"));
        assert!(out.ends_with("...(truncated)"));
        assert_eq!(truncate("short", 10), "short");
    }
}
