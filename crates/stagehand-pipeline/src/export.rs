//! Bulk export of completed task content to a directory.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use stagehand_types::{Result, StagehandError, TaskStatus};

use crate::checkpoint::{write_atomic, Checkpoint};

pub const MANIFEST_FILE: &str = "manifest.json";

/// Written next to the exported files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportManifest {
    pub run_id: String,
    pub project_name: String,
    pub exported_at: chrono::DateTime<chrono::Utc>,
    pub files: Vec<ExportedFile>,
    /// Tasks with no completed content, in execution order.
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedFile {
    pub id: String,
    pub path: String,
    pub kind: String,
    pub bytes: usize,
}

/// `path` as a relative path that stays inside whatever directory it is
/// joined onto, or `None` if it is absolute or climbs out.
pub fn safe_relative_path(path: &str) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Write every COMPLETED task's content under `dest` plus a manifest.
///
/// All paths are checked before anything is written, so an unsafe path
/// leaves `dest` untouched.
pub async fn export_checkpoint(checkpoint: &Checkpoint, dest: &Path) -> Result<ExportManifest> {
    let mut planned = Vec::new();
    let mut skipped = Vec::new();
    for id in &checkpoint.execution_order {
        let Some(task) = checkpoint.task(id) else {
            continue;
        };
        match (&task.status, &task.content) {
            (TaskStatus::Completed, Some(content)) => {
                let relative = safe_relative_path(&task.path).ok_or_else(|| {
                    StagehandError::UnsafePath {
                        path: task.path.clone(),
                    }
                })?;
                planned.push((task, relative, content));
            }
            _ => skipped.push(task.id.clone()),
        }
    }

    tokio::fs::create_dir_all(dest).await?;
    let mut files = Vec::with_capacity(planned.len());
    for (task, relative, content) in planned {
        write_atomic(&dest.join(&relative), content.as_bytes()).await?;
        files.push(ExportedFile {
            id: task.id.clone(),
            path: task.path.clone(),
            kind: task.kind.clone(),
            bytes: content.len(),
        });
    }

    let manifest = ExportManifest {
        run_id: checkpoint.run_id.clone(),
        project_name: checkpoint.project_name.clone(),
        exported_at: chrono::Utc::now(),
        files,
        skipped,
    };
    let json = serde_json::to_vec_pretty(&manifest)?;
    write_atomic(&dest.join(MANIFEST_FILE), &json).await?;
    tracing::info!(
        run_id = %checkpoint.run_id,
        dest = %dest.display(),
        files = manifest.files.len(),
        "Run exported"
    );
    Ok(manifest)
}
