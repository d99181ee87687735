//! Boundary between untyped generator output and the task graph.
//!
//! Architect output drifts in shape: the task list may sit under `tasks`,
//! `files` or `implementation_steps`, or be a bare array, and each field has
//! several spellings. Everything is folded into [`TaskSpec`]s here so the rest
//! of the engine sees one canonical form.

use serde_json::{Map, Value};
use stagehand_types::GraphError;

use crate::graph::TaskSpec;

const LIST_KEYS: &[&str] = &["tasks", "files", "implementation_steps"];
const ID_KEYS: &[&str] = &["id", "task_id"];
const PATH_KEYS: &[&str] = &["path", "file", "filepath", "file_path"];
const KIND_KEYS: &[&str] = &["kind", "file_type", "type"];
const DESCRIPTION_KEYS: &[&str] = &["description", "purpose"];
const SPEC_KEYS: &[&str] = &["content_spec", "task_description", "spec"];
const DEPENDENCY_KEYS: &[&str] = &["dependencies", "depends_on", "deps"];
const CONTEXT_KEYS: &[&str] = &["global_context", "contracts"];

/// Canonical task payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedPlan {
    pub global_context: String,
    pub tasks: Vec<TaskSpec>,
}

/// Fold any accepted plan shape into canonical task specs.
pub fn normalize_tasks(payload: &Value) -> Result<NormalizedPlan, GraphError> {
    let (items, global_context) = match payload {
        Value::Array(items) => (items, String::new()),
        Value::Object(obj) => {
            let items = LIST_KEYS
                .iter()
                .find_map(|k| obj.get(*k).and_then(Value::as_array))
                .ok_or_else(|| {
                    GraphError::Malformed(format!(
                        "expected one of {} to hold a task list",
                        LIST_KEYS.join(", ")
                    ))
                })?;
            (items, context_text(obj))
        }
        other => {
            return Err(GraphError::Malformed(format!(
                "expected an object or array, got {}",
                type_name(other)
            )))
        }
    };

    let tasks = items
        .iter()
        .enumerate()
        .map(|(i, item)| normalize_task(i, item))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(NormalizedPlan {
        global_context,
        tasks,
    })
}

fn normalize_task(index: usize, item: &Value) -> Result<TaskSpec, GraphError> {
    let obj = item.as_object().ok_or_else(|| {
        GraphError::Malformed(format!("task #{} is {}, not an object", index + 1, type_name(item)))
    })?;
    let path = first_string(obj, PATH_KEYS)
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| GraphError::Malformed(format!("task #{} has no path", index + 1)))?;
    let description = first_string(obj, DESCRIPTION_KEYS).unwrap_or_default();
    let content_spec = first_string(obj, SPEC_KEYS).unwrap_or_else(|| description.clone());

    Ok(TaskSpec {
        id: first_string(obj, ID_KEYS).filter(|id| !id.is_empty()),
        kind: first_string(obj, KIND_KEYS).unwrap_or_else(|| kind_from_path(&path)),
        path,
        description,
        content_spec,
        dependencies: dependencies(obj),
    })
}

fn first_string(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match obj.get(*k)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn dependencies(obj: &Map<String, Value>) -> Vec<String> {
    let Some(value) = DEPENDENCY_KEYS.iter().find_map(|k| obj.get(*k)) else {
        return Vec::new();
    };
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect(),
        Value::String(s) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        _ => Vec::new(),
    }
}

/// Contracts may be free text or structured; structured contracts are kept as
/// pretty JSON so producers see them verbatim.
fn context_text(obj: &Map<String, Value>) -> String {
    match CONTEXT_KEYS.iter().find_map(|k| obj.get(*k)) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => serde_json::to_string_pretty(other).unwrap_or_default(),
    }
}

fn kind_from_path(path: &str) -> String {
    std::path::Path::new(path)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
