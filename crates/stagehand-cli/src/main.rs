//! CLI binary for creating, reviewing and advancing Stagehand runs.

mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde_json::Value;
use stagehand_pipeline::{
    AdvanceOutcome, AutoApprove, BestEffortRetriever, CheckpointStore, CommandPlanner, CommandProducer,
    DryRunProducer, NoSignal, PipelineEngine, PipelineEvent, Planner, Producer, ReviewDecision,
    ReviewSource, RunSummary, SnippetDirRetriever,
};
use stagehand_types::ProducerError;
use tracing_subscriber::EnvFilter;

use crate::config::{load_config, CliConfig, DEFAULT_CONFIG_FILE};

#[derive(Parser)]
#[command(name = "stagehand", version, about = "Resumable, review-gated pipeline runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Override the run store directory from the config file
    #[arg(long, global = true)]
    store: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a run from a prompt; it starts at planning
    New {
        /// Project name
        name: String,

        /// What to build
        prompt: String,
    },

    /// Create a run from an existing task payload (JSON); it starts at task review
    Import {
        /// Project name
        name: String,

        /// Path to the JSON payload
        payload: PathBuf,
    },

    /// Drive a run until it needs a review, stalls, or finishes
    Advance {
        run_id: String,

        /// Approve every review gate without stopping
        #[arg(long)]
        auto_approve: bool,
    },

    /// Decide a run waiting at a review gate
    Review {
        run_id: String,

        #[command(subcommand)]
        action: ReviewAction,
    },

    /// Show the status of one run
    Status {
        run_id: String,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// List all runs
    List {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the tasks of a run in execution order
    Tasks {
        run_id: String,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the generated content of one task
    Show { run_id: String, task_id: String },

    /// Write every completed task's content to a directory
    Export {
        run_id: String,

        /// Destination directory
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Reset failed work so the next advance picks it up again
    Retry {
        run_id: String,

        /// Task to reset
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        task_id: Option<String>,

        /// Reset every failed task (and a failed planning or architecting stage)
        #[arg(long)]
        all: bool,
    },

    /// Discard a run's plan, tasks and output and plan it again from its prompt
    Regenerate { run_id: String },

    /// Delete a run and its artifacts
    Delete { run_id: String },
}

#[derive(Subcommand)]
enum ReviewAction {
    /// Accept the plan or task list
    Approve,
    /// Send it back with instructions
    Edit {
        /// Instructions for the revision
        instructions: String,
    },
    /// Discard it and generate again
    Regenerate,
}

impl From<ReviewAction> for ReviewDecision {
    fn from(action: ReviewAction) -> Self {
        match action {
            ReviewAction::Approve => ReviewDecision::Approve,
            ReviewAction::Edit { instructions } => ReviewDecision::Edit(instructions),
            ReviewAction::Regenerate => ReviewDecision::Regenerate,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config = load_config(&cli.config)?;
    if let Some(store) = cli.store {
        config.store_dir = store;
    }
    let engine = build_engine(&config);

    match cli.command {
        Commands::New { name, prompt } => cmd_new(&engine, &name, &prompt).await?,
        Commands::Import { name, payload } => cmd_import(&engine, &name, &payload).await?,
        Commands::Advance {
            run_id,
            auto_approve,
        } => cmd_advance(engine, &run_id, auto_approve).await?,
        Commands::Review { run_id, action } => cmd_review(&engine, &run_id, action.into()).await?,
        Commands::Status { run_id, json } => cmd_status(&engine, &run_id, json).await?,
        Commands::List { json } => cmd_list(&engine, json).await?,
        Commands::Tasks { run_id, json } => cmd_tasks(&engine, &run_id, json).await?,
        Commands::Show { run_id, task_id } => cmd_show(&engine, &run_id, &task_id).await?,
        Commands::Export { run_id, output } => cmd_export(&engine, &run_id, &output).await?,
        Commands::Retry {
            run_id,
            task_id,
            all,
        } => cmd_retry(&engine, &run_id, task_id.as_deref(), all).await?,
        Commands::Regenerate { run_id } => cmd_regenerate(&engine, &run_id).await?,
        Commands::Delete { run_id } => cmd_delete(&engine, &run_id).await?,
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// Planner used when no planner commands are configured. Imported runs never
/// call it; prompt runs fail their planning stage with a clear message.
struct UnconfiguredPlanner;

#[async_trait]
impl Planner for UnconfiguredPlanner {
    async fn plan(&self, _prompt: &str, _instructions: Option<&str>) -> Result<Value, ProducerError> {
        Err(ProducerError::permanent(
            "No planner configured: set [planner] plan_command and architect_command",
        ))
    }

    async fn architect(
        &self,
        _plan: &Value,
        _instructions: Option<&str>,
    ) -> Result<Value, ProducerError> {
        Err(ProducerError::permanent(
            "No planner configured: set [planner] plan_command and architect_command",
        ))
    }
}

fn build_engine(config: &CliConfig) -> PipelineEngine {
    let store = Arc::new(stagehand_pipeline::FileStore::new(&config.store_dir));

    let producer: Arc<dyn Producer> = match &config.producer.command {
        Some(command) => {
            let mut producer = CommandProducer::new(command)
                .with_timeout(Duration::from_secs(config.producer.timeout_secs));
            if let Some(dir) = &config.producer.workdir {
                producer = producer.with_workdir(dir);
            }
            Arc::new(producer)
        }
        None => {
            tracing::debug!("No producer command configured, using dry run");
            Arc::new(DryRunProducer)
        }
    };

    let planner: Arc<dyn Planner> = match (
        &config.planner.plan_command,
        &config.planner.architect_command,
    ) {
        (Some(plan), Some(architect)) => {
            let mut planner = CommandPlanner::new(plan, architect)
                .with_timeout(Duration::from_secs(config.planner.timeout_secs));
            if let Some(dir) = &config.producer.workdir {
                planner = planner.with_workdir(dir);
            }
            Arc::new(planner)
        }
        _ => Arc::new(UnconfiguredPlanner),
    };

    let retriever = match &config.retriever.snippets_dir {
        Some(dir) => BestEffortRetriever::new(SnippetDirRetriever::new(dir)),
        None => BestEffortRetriever::noop(),
    };

    PipelineEngine::new(store, planner, producer)
        .with_config(config.engine_config())
        .with_retriever(retriever)
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn cmd_new(engine: &PipelineEngine, name: &str, prompt: &str) -> anyhow::Result<()> {
    let cp = engine.create_run(name, prompt).await?;
    println!("Created run {}", cp.run_id);
    println!("  Project: {}", cp.project_name);
    println!("  Stage: {}", cp.stage);
    println!("\nNext: stagehand advance {}", cp.run_id);
    Ok(())
}

async fn cmd_import(engine: &PipelineEngine, name: &str, payload: &Path) -> anyhow::Result<()> {
    let source = std::fs::read_to_string(payload)
        .with_context(|| format!("read {}", payload.display()))?;
    let value: Value = serde_json::from_str(&source)
        .with_context(|| format!("parse {}", payload.display()))?;
    let cp = engine.import_run(name, &value).await?;

    println!("Imported run {}", cp.run_id);
    println!("  Project: {}", cp.project_name);
    println!("  Tasks: {}", cp.total);
    println!("  Stage: {}", cp.stage);
    println!("\nNext steps:");
    println!("1. Review tasks: stagehand tasks {}", cp.run_id);
    println!("2. Approve: stagehand review {} approve", cp.run_id);
    println!("3. Generate: stagehand advance {}", cp.run_id);
    Ok(())
}

async fn cmd_advance(engine: PipelineEngine, run_id: &str, auto_approve: bool) -> anyhow::Result<()> {
    let mut rx = engine.events().subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            print_event(&event);
        }
    });

    let reviews: &dyn ReviewSource = if auto_approve { &AutoApprove } else { &NoSignal };
    let outcome = engine.advance(run_id, reviews).await;
    let summary = engine.status(run_id).await;

    // Closing the channel lets the printer drain and exit.
    drop(engine);
    let _ = printer.await;

    let outcome = outcome?;
    println!();
    match &outcome {
        AdvanceOutcome::AwaitingReview { gate } => {
            println!("Waiting for {} review", gate);
            println!("  Approve: stagehand review {} approve", run_id);
            println!("  Edit: stagehand review {} edit \"<instructions>\"", run_id);
            println!("  Regenerate: stagehand review {} regenerate", run_id);
        }
        AdvanceOutcome::Completed => {
            println!("✓ Run completed");
        }
        AdvanceOutcome::Stalled(stall) => {
            println!("⚠ {}", stall);
            println!("  Retry: stagehand retry {} --all", run_id);
        }
        AdvanceOutcome::Failed {
            failed,
            stage_error,
        } => {
            println!("✗ Run failed");
            if let Some(err) = stage_error {
                println!("  {} stage: {}", err.stage, err.message);
            }
            if !failed.is_empty() {
                println!("  Failed tasks: {}", failed.join(", "));
            }
            println!("  Retry: stagehand retry {} --all", run_id);
        }
    }
    if let Ok(summary) = summary {
        println!("Progress: {}", summary.progress);
    }

    if matches!(
        outcome,
        AdvanceOutcome::Stalled(_) | AdvanceOutcome::Failed { .. }
    ) {
        std::process::exit(1);
    }
    Ok(())
}

fn print_event(event: &PipelineEvent) {
    match event {
        PipelineEvent::StageChanged { from, to, .. } => println!("Stage: {} -> {}", from, to),
        PipelineEvent::TaskStarted {
            task_id, attempt, ..
        } => println!("  [{}] started (attempt {})", task_id, attempt),
        PipelineEvent::TaskRetrying {
            task_id, error, ..
        } => println!("  [{}] retrying: {}", task_id, error),
        PipelineEvent::TaskCompleted {
            task_id,
            duration_ms,
            ..
        } => println!("  [{}] completed in {}ms", task_id, duration_ms),
        PipelineEvent::TaskFailed { task_id, error, .. } => {
            println!("  [{}] failed: {}", task_id, error)
        }
        PipelineEvent::AwaitingReview { .. }
        | PipelineEvent::CheckpointSaved { .. }
        | PipelineEvent::RunStalled { .. }
        | PipelineEvent::RunCompleted { .. } => {}
    }
}

async fn cmd_review(
    engine: &PipelineEngine,
    run_id: &str,
    decision: ReviewDecision,
) -> anyhow::Result<()> {
    let stage = engine.submit_review(run_id, decision).await?;
    println!("Run {} moved to {}", run_id, stage);
    println!("\nNext: stagehand advance {}", run_id);
    Ok(())
}

async fn cmd_status(engine: &PipelineEngine, run_id: &str, json: bool) -> anyhow::Result<()> {
    let summary = engine.status(run_id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    print_summary(&summary);
    if let Some(err) = &summary.stage_error {
        println!("Stage error ({}): {}", err.stage, err.message);
    }
    if let Some(stall) = &summary.stall {
        println!("{}", stall);
    }

    // The plan is what a reviewer needs to see at the plan gate.
    if summary.stage == stagehand_types::Stage::PlanReview {
        let cp = engine.store().get(run_id).await?;
        if let Some(plan) = &cp.plan {
            println!("\nPlan:\n{}", serde_json::to_string_pretty(plan)?);
        }
    }
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!("Run: {}", summary.run_id);
    println!("Project: {}", summary.project_name);
    println!("Status: {}", summary.status);
    println!("Stage: {}", summary.stage);
    println!("Progress: {} ({} pending)", summary.progress, summary.pending);
    println!("Created: {}", summary.created_at.to_rfc3339());
    println!("Updated: {}", summary.updated_at.to_rfc3339());
}

async fn cmd_list(engine: &PipelineEngine, json: bool) -> anyhow::Result<()> {
    let runs = engine.list_runs().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }
    if runs.is_empty() {
        println!("No runs");
        return Ok(());
    }
    for run in &runs {
        println!(
            "{}  {:<22} {:<20} {}",
            run.run_id, run.status, run.project_name, run.progress
        );
    }
    Ok(())
}

async fn cmd_tasks(engine: &PipelineEngine, run_id: &str, json: bool) -> anyhow::Result<()> {
    let tasks = engine.list_tasks(run_id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
        return Ok(());
    }
    if tasks.is_empty() {
        println!("No tasks yet");
        return Ok(());
    }
    for task in &tasks {
        let deps = if task.dependencies.is_empty() {
            String::new()
        } else {
            format!(" <- {}", task.dependencies.join(", "))
        };
        println!(
            "  {} [{}] {} attempts={}{}",
            task.id, task.status, task.path, task.attempts, deps
        );
        if let Some(err) = &task.last_error {
            println!("      error: {}", err);
        }
    }
    Ok(())
}

async fn cmd_show(engine: &PipelineEngine, run_id: &str, task_id: &str) -> anyhow::Result<()> {
    match engine.task_content(run_id, task_id).await? {
        Some(content) => print!("{}", content),
        None => anyhow::bail!("Task {} has no content yet", task_id),
    }
    Ok(())
}

async fn cmd_export(engine: &PipelineEngine, run_id: &str, output: &Path) -> anyhow::Result<()> {
    let manifest = engine.export_run(run_id, output).await?;
    println!("✓ Exported {} file(s) to {}", manifest.files.len(), output.display());
    if !manifest.skipped.is_empty() {
        println!("  Skipped (not completed): {}", manifest.skipped.join(", "));
    }
    Ok(())
}

async fn cmd_retry(
    engine: &PipelineEngine,
    run_id: &str,
    task_id: Option<&str>,
    all: bool,
) -> anyhow::Result<()> {
    let summary = match (task_id, all) {
        (_, true) => {
            let (reset, summary) = engine.retry_failed(run_id).await?;
            if reset.is_empty() {
                println!("No failed tasks to reset");
            } else {
                println!("Reset {} task(s): {}", reset.len(), reset.join(", "));
            }
            summary
        }
        (Some(task_id), false) => {
            let summary = engine.retry_task(run_id, task_id).await?;
            println!("Reset task {}", task_id);
            summary
        }
        (None, false) => anyhow::bail!("Specify a task id or --all"),
    };
    println!("Stage: {}", summary.stage);
    println!("\nNext: stagehand advance {}", run_id);
    Ok(())
}

async fn cmd_regenerate(engine: &PipelineEngine, run_id: &str) -> anyhow::Result<()> {
    let summary = engine.regenerate_run(run_id).await?;
    println!("Run {} cleared and back at {}", run_id, summary.stage);
    println!("\nNext: stagehand advance {}", run_id);
    Ok(())
}

async fn cmd_delete(engine: &PipelineEngine, run_id: &str) -> anyhow::Result<()> {
    engine.delete_run(run_id).await?;
    println!("Deleted run {}", run_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_in(dir: &Path) -> PipelineEngine {
        let config = CliConfig {
            store_dir: dir.join("runs"),
            ..CliConfig::default()
        };
        build_engine(&config)
    }

    #[test]
    fn parses_regenerate() {
        let cli = Cli::try_parse_from(["stagehand", "regenerate", "run-1"]).unwrap();
        assert!(matches!(cli.command, Commands::Regenerate { ref run_id } if run_id == "run-1"));
    }

    #[tokio::test]
    async fn import_errors_name_the_payload_file() {
        let temp = tempfile::tempdir().unwrap();
        let engine = engine_in(temp.path());

        let missing = temp.path().join("missing.json");
        let err = cmd_import(&engine, "demo", &missing).await.unwrap_err();
        let rendered = format!("{err:#}");
        assert!(rendered.starts_with("read "));
        assert!(rendered.contains("missing.json"));
        assert!(err.downcast_ref::<std::io::Error>().is_some());

        let bad = temp.path().join("bad.json");
        std::fs::write(&bad, "{ not json").unwrap();
        let err = cmd_import(&engine, "demo", &bad).await.unwrap_err();
        assert!(format!("{err:#}").starts_with(&format!("parse {}", bad.display())));
        assert!(err.downcast_ref::<serde_json::Error>().is_some());
    }

    #[tokio::test]
    async fn regenerate_rejects_imported_runs() {
        let temp = tempfile::tempdir().unwrap();
        let engine = engine_in(temp.path());
        let payload = temp.path().join("tasks.json");
        std::fs::write(&payload, r#"[{"id": "a", "path": "a.py"}]"#).unwrap();
        cmd_import(&engine, "demo", &payload).await.unwrap();

        let run_id = engine.list_runs().await.unwrap().remove(0).run_id;
        assert!(cmd_regenerate(&engine, &run_id).await.is_err());
        assert_eq!(engine.status(&run_id).await.unwrap().total, 1);
    }
}
