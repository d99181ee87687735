//! Reference pattern retrieval.
//!
//! Retrieval only enriches producer context, so it is best effort: any
//! failure degrades to "no patterns" and never fails a task.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stagehand_types::Result;

/// One reference snippet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snippet {
    pub tech: String,
    pub source: String,
    pub code: String,
}

#[async_trait]
pub trait PatternRetriever: Send + Sync {
    async fn retrieve(&self, tech: &str, query: &str, n: usize) -> Result<Vec<Snippet>>;
}

/// Technology tag for a file path, by extension.
pub fn detect_tech(path: &str) -> Option<&'static str> {
    let ext = std::path::Path::new(path)
        .extension()?
        .to_string_lossy()
        .to_lowercase();
    match ext.as_str() {
        "py" => Some("python"),
        "jsx" | "tsx" => Some("react"),
        "vue" => Some("vue"),
        "js" | "ts" | "mjs" | "cjs" => Some("nodejs"),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// BestEffortRetriever
// ---------------------------------------------------------------------------

/// Wraps any retriever and turns every failure into an empty result.
pub struct BestEffortRetriever {
    inner: Box<dyn PatternRetriever>,
}

impl BestEffortRetriever {
    pub fn new(inner: impl PatternRetriever + 'static) -> Self {
        Self {
            inner: Box::new(inner),
        }
    }

    pub fn noop() -> Self {
        Self::new(NoopRetriever)
    }

    pub async fn retrieve(&self, tech: &str, query: &str, n: usize) -> Vec<Snippet> {
        if n == 0 {
            return Vec::new();
        }
        match self.inner.retrieve(tech, query, n).await {
            Ok(mut snippets) => {
                snippets.truncate(n);
                snippets
            }
            Err(e) => {
                tracing::warn!(tech = %tech, error = %e, "Pattern retrieval failed, continuing without patterns");
                Vec::new()
            }
        }
    }

    /// Patterns for a file path, or none when its technology is unknown.
    pub async fn for_path(&self, path: &str, query: &str, n: usize) -> Vec<Snippet> {
        match detect_tech(path) {
            Some(tech) => self.retrieve(tech, query, n).await,
            None => Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// NoopRetriever
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRetriever;

#[async_trait]
impl PatternRetriever for NoopRetriever {
    async fn retrieve(&self, _tech: &str, _query: &str, _n: usize) -> Result<Vec<Snippet>> {
        Ok(Vec::new())
    }
}

// ---------------------------------------------------------------------------
// SnippetDirRetriever
// ---------------------------------------------------------------------------

/// Reads snippets from `<root>/<tech>/*` and ranks them by how many query
/// words they contain.
#[derive(Debug, Clone)]
pub struct SnippetDirRetriever {
    root: PathBuf,
}

impl SnippetDirRetriever {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl PatternRetriever for SnippetDirRetriever {
    async fn retrieve(&self, tech: &str, query: &str, n: usize) -> Result<Vec<Snippet>> {
        let dir = self.root.join(tech);
        let mut entries = tokio::fs::read_dir(&dir).await?;
        let words: Vec<String> = query
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.len() > 2)
            .map(str::to_lowercase)
            .collect();

        let mut scored = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let code = match tokio::fs::read_to_string(entry.path()).await {
                Ok(code) => code,
                Err(_) => continue,
            };
            let source = entry.file_name().to_string_lossy().into_owned();
            let haystack = format!("{} {}", source, code).to_lowercase();
            let score = words.iter().filter(|w| haystack.contains(w.as_str())).count();
            scored.push((score, source, code));
        }
        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

        Ok(scored
            .into_iter()
            .take(n)
            .map(|(_, source, code)| Snippet {
                tech: tech.to_string(),
                source,
                code,
            })
            .collect())
    }
}
