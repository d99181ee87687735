//! CLI configuration read from `stagehand.toml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use stagehand_pipeline::{BackoffPolicy, EngineConfig, RetryPolicy};

pub const DEFAULT_CONFIG_FILE: &str = "stagehand.toml";

/// Top-level configuration. Every field has a default, so an empty or
/// missing file is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CliConfig {
    /// Directory holding one sub-directory per run.
    pub store_dir: PathBuf,
    pub retry: RetryConfig,
    pub producer: ProducerConfig,
    pub planner: PlannerConfig,
    pub retriever: RetrieverConfig,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from(".stagehand/runs"),
            retry: RetryConfig::default(),
            producer: ProducerConfig::default(),
            planner: PlannerConfig::default(),
            retriever: RetrieverConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    /// Producer calls per task per scheduling round.
    pub max_attempts: u32,
    pub backoff: BackoffConfig,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffConfig {
    None,
    Fixed { delay_ms: u64 },
    Exponential { base_ms: u64, max_ms: u64 },
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig::Exponential {
            base_ms: 500,
            max_ms: 30_000,
        }
    }
}

impl From<&BackoffConfig> for BackoffPolicy {
    fn from(cfg: &BackoffConfig) -> Self {
        match cfg {
            BackoffConfig::None => BackoffPolicy::None,
            BackoffConfig::Fixed { delay_ms } => BackoffPolicy::Fixed(Duration::from_millis(*delay_ms)),
            BackoffConfig::Exponential { base_ms, max_ms } => BackoffPolicy::Exponential {
                base: Duration::from_millis(*base_ms),
                max: Duration::from_millis(*max_ms),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProducerConfig {
    /// Shell command producing one task's content. Unset means dry run.
    pub command: Option<String>,
    pub timeout_secs: u64,
    pub workdir: Option<PathBuf>,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            command: None,
            timeout_secs: 300,
            workdir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PlannerConfig {
    pub plan_command: Option<String>,
    pub architect_command: Option<String>,
    pub timeout_secs: u64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            plan_command: None,
            architect_command: None,
            timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetrieverConfig {
    /// Directory of `<tech>/<snippet>` files. Unset disables retrieval.
    pub snippets_dir: Option<PathBuf>,
    pub patterns_per_task: usize,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            snippets_dir: None,
            patterns_per_task: 2,
        }
    }
}

impl CliConfig {
    pub fn validate(&self) -> Result<()> {
        if self.store_dir.as_os_str().is_empty() {
            return Err(anyhow!("store_dir must not be empty"));
        }
        if self.retry.max_attempts == 0 {
            return Err(anyhow!("retry.max_attempts must be > 0"));
        }
        if let BackoffConfig::Exponential { base_ms, max_ms } = self.retry.backoff {
            if base_ms > max_ms {
                return Err(anyhow!("retry.backoff.base_ms must be <= max_ms"));
            }
        }
        if self.producer.timeout_secs == 0 {
            return Err(anyhow!("producer.timeout_secs must be > 0"));
        }
        if self.planner.timeout_secs == 0 {
            return Err(anyhow!("planner.timeout_secs must be > 0"));
        }
        if blank(&self.producer.command) {
            return Err(anyhow!("producer.command must not be blank"));
        }
        if self.planner.plan_command.is_some() != self.planner.architect_command.is_some() {
            return Err(anyhow!(
                "planner.plan_command and planner.architect_command must be set together"
            ));
        }
        if blank(&self.planner.plan_command) || blank(&self.planner.architect_command) {
            return Err(anyhow!("planner commands must not be blank"));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry.max_attempts).with_backoff((&self.retry.backoff).into())
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig::default()
            .with_retry(self.retry_policy())
            .with_patterns_per_task(self.retriever.patterns_per_task)
    }
}

fn blank(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|s| s.trim().is_empty())
}

/// Load config from a TOML file. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<CliConfig> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "No config file, using defaults");
        return Ok(CliConfig::default());
    }
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: CliConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, CliConfig::default());
        cfg.validate().expect("default config is valid");
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(
            &path,
            r#"
store_dir = "runs"

[retry]
max_attempts = 5

[retry.backoff]
kind = "fixed"
delay_ms = 250

[producer]
command = "./gen.sh"
"#,
        )
        .unwrap();

        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.store_dir, PathBuf::from("runs"));
        assert_eq!(cfg.retry.max_attempts, 5);
        assert_eq!(cfg.retry.backoff, BackoffConfig::Fixed { delay_ms: 250 });
        assert_eq!(cfg.producer.command.as_deref(), Some("./gen.sh"));
        assert_eq!(cfg.producer.timeout_secs, 300);
        assert_eq!(cfg.retriever.patterns_per_task, 2);
    }

    #[test]
    fn converts_to_engine_config() {
        let mut cfg = CliConfig::default();
        cfg.retry.max_attempts = 4;
        cfg.retry.backoff = BackoffConfig::None;
        cfg.retriever.patterns_per_task = 1;

        let engine = cfg.engine_config();
        assert_eq!(engine.retry.max_attempts, 4);
        assert_eq!(engine.retry.backoff, BackoffPolicy::None);
        assert_eq!(engine.patterns_per_task, 1);

        cfg.retry.backoff = BackoffConfig::default();
        assert_eq!(
            cfg.retry_policy().backoff,
            BackoffPolicy::Exponential {
                base: Duration::from_millis(500),
                max: Duration::from_secs(30),
            }
        );
    }

    #[test]
    fn rejects_invalid_values() {
        let mut cfg = CliConfig::default();
        cfg.retry.max_attempts = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = CliConfig::default();
        cfg.planner.plan_command = Some("plan.sh".into());
        assert!(cfg.validate().is_err());

        let mut cfg = CliConfig::default();
        cfg.producer.command = Some("  ".into());
        assert!(cfg.validate().is_err());

        let mut cfg = CliConfig::default();
        cfg.retry.backoff = BackoffConfig::Exponential {
            base_ms: 10_000,
            max_ms: 100,
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn parse_error_names_the_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("bad.toml");
        std::fs::write(&path, "retry = 3").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("bad.toml"));
    }
}
