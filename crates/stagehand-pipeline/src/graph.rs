//! Task graph model: the unit of work and dependency validation.
//!
//! A plan is accepted only when every dependency resolves to a task in the
//! same plan, nothing depends on itself, and the dependency relation is
//! acyclic. Accepted plans carry a deterministic execution order.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use stagehand_types::{GraphError, TaskStatus};

/// One file-producing unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    /// Output path, relative to the project root.
    pub path: String,
    /// Content-type tag, e.g. `python` or `component`.
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub content_spec: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub attempts: u32,
    /// Attempts in the current scheduling round, persisted across restarts.
    /// Zero once the round ends COMPLETED or FAILED.
    #[serde(default)]
    pub round_attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

/// A task as described by a plan, before ids are assigned and state attached.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    #[serde(default)]
    pub id: Option<String>,
    pub path: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub content_spec: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl TaskSpec {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    pub fn with_spec(mut self, content_spec: impl Into<String>) -> Self {
        self.content_spec = content_spec.into();
        self
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }
}

/// Generated id for the task at `index` (0-based) in plan order.
pub fn generated_id(index: usize) -> String {
    format!("task_{:03}", index + 1)
}

impl Task {
    fn from_spec(id: String, spec: TaskSpec) -> Self {
        let mut seen = HashSet::new();
        let dependencies = spec
            .dependencies
            .into_iter()
            .filter(|d| seen.insert(d.clone()))
            .collect();
        Self {
            id,
            path: spec.path,
            kind: spec.kind,
            description: spec.description,
            content_spec: spec.content_spec,
            dependencies,
            status: TaskStatus::Pending,
            attempts: 0,
            round_attempts: 0,
            last_error: None,
            content: None,
        }
    }
}

/// A validated plan: tasks in declaration order plus their execution order.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    tasks: Vec<Task>,
    order: Vec<String>,
}

impl TaskGraph {
    /// Validate a plan and compute its execution order.
    ///
    /// Tasks without an id receive `task_001`, `task_002`, ... by position.
    /// A generated id already claimed by the plan is skipped for the next
    /// free number. Repeated dependencies collapse to one, keeping the first
    /// occurrence.
    pub fn build(specs: Vec<TaskSpec>) -> Result<Self, GraphError> {
        if specs.is_empty() {
            return Err(GraphError::EmptyPlan);
        }
        let mut taken: HashSet<String> = specs.iter().filter_map(|s| s.id.clone()).collect();
        let mut next = 0;
        let mut tasks = Vec::with_capacity(specs.len());
        for (i, mut spec) in specs.into_iter().enumerate() {
            let id = match spec.id.take() {
                Some(id) => id,
                None => {
                    next = next.max(i);
                    while taken.contains(&generated_id(next)) {
                        next += 1;
                    }
                    let id = generated_id(next);
                    taken.insert(id.clone());
                    next += 1;
                    id
                }
            };
            tasks.push(Task::from_spec(id, spec));
        }
        let order = topological_order(&tasks)?;
        Ok(Self { tasks, order })
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn execution_order(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn into_parts(self) -> (Vec<Task>, Vec<String>) {
        (self.tasks, self.order)
    }
}

/// Kahn's algorithm over a min-heap of declaration indices: among tasks whose
/// dependencies are all placed, the earliest declared goes first.
pub fn topological_order(tasks: &[Task]) -> Result<Vec<String>, GraphError> {
    let mut index_map: HashMap<&str, usize> = HashMap::with_capacity(tasks.len());
    for (i, task) in tasks.iter().enumerate() {
        if index_map.insert(task.id.as_str(), i).is_some() {
            return Err(GraphError::DuplicateTaskId {
                id: task.id.clone(),
            });
        }
    }

    let mut forward_edges: Vec<Vec<usize>> = vec![Vec::new(); tasks.len()];
    let mut in_degree = vec![0usize; tasks.len()];
    for (i, task) in tasks.iter().enumerate() {
        for dep in &task.dependencies {
            if dep == &task.id {
                return Err(GraphError::SelfDependency {
                    task: task.id.clone(),
                });
            }
            let &from = index_map
                .get(dep.as_str())
                .ok_or_else(|| GraphError::DanglingDependency {
                    task: task.id.clone(),
                    dependency: dep.clone(),
                })?;
            forward_edges[from].push(i);
            in_degree[i] += 1;
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, &d)| d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();
    let mut order = Vec::with_capacity(tasks.len());
    while let Some(Reverse(i)) = ready.pop() {
        order.push(tasks[i].id.clone());
        for &next in &forward_edges[i] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push(Reverse(next));
            }
        }
    }

    if order.len() != tasks.len() {
        let unplaced: Vec<bool> = in_degree.iter().map(|&d| d > 0).collect();
        let tasks = (0..tasks.len())
            .filter(|&i| unplaced[i] && reaches_itself(i, &forward_edges, &unplaced))
            .map(|i| tasks[i].id.clone())
            .collect();
        return Err(GraphError::CyclicDependency { tasks });
    }
    Ok(order)
}

/// Whether `start` lies on a cycle among the tasks Kahn's pass left
/// unplaced. Tasks that merely wait on a cycle do not.
fn reaches_itself(start: usize, forward_edges: &[Vec<usize>], unplaced: &[bool]) -> bool {
    let mut visited = vec![false; forward_edges.len()];
    let mut stack: Vec<usize> = forward_edges[start].clone();
    while let Some(node) = stack.pop() {
        if node == start {
            return true;
        }
        if !unplaced[node] || visited[node] {
            continue;
        }
        visited[node] = true;
        stack.extend(forward_edges[node].iter().copied());
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: &str, deps: &[&str]) -> TaskSpec {
        TaskSpec::new(format!("src/{id}.py"))
            .with_id(id)
            .depends_on(deps.iter().copied())
    }

    fn position(order: &[String], id: &str) -> usize {
        order.iter().position(|x| x == id).unwrap()
    }

    #[test]
    fn linear_chain_orders_dependencies_first() {
        let graph = TaskGraph::build(vec![spec("c", &["b"]), spec("b", &["a"]), spec("a", &[])])
            .unwrap();
        assert_eq!(graph.execution_order(), ["a", "b", "c"]);
    }

    #[test]
    fn independent_tasks_keep_declaration_order() {
        let graph =
            TaskGraph::build(vec![spec("z", &[]), spec("m", &[]), spec("a", &[])]).unwrap();
        assert_eq!(graph.execution_order(), ["z", "m", "a"]);
    }

    #[test]
    fn diamond_is_valid_and_deterministic() {
        let build = || {
            TaskGraph::build(vec![
                spec("d", &["b", "c"]),
                spec("b", &["a"]),
                spec("c", &["a"]),
                spec("a", &[]),
            ])
            .unwrap()
        };
        let first = build();
        let order = first.execution_order();
        assert_eq!(order, ["a", "b", "c", "d"]);
        for task in first.tasks() {
            for dep in &task.dependencies {
                assert!(position(order, dep) < position(order, &task.id));
            }
        }
        assert_eq!(build().execution_order(), order);
    }

    #[test]
    fn two_task_cycle_is_rejected() {
        let err = TaskGraph::build(vec![spec("a", &["b"]), spec("b", &["a"])]).unwrap_err();
        assert_eq!(
            err,
            GraphError::CyclicDependency {
                tasks: vec!["a".into(), "b".into()]
            }
        );
    }

    #[test]
    fn cycle_report_excludes_tasks_upstream_of_the_cycle() {
        let err = TaskGraph::build(vec![
            spec("root", &[]),
            spec("x", &["root", "z"]),
            spec("y", &["x"]),
            spec("z", &["y"]),
        ])
        .unwrap_err();
        match err {
            GraphError::CyclicDependency { tasks } => {
                assert_eq!(tasks, vec!["x", "y", "z"]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn cycle_report_excludes_tasks_waiting_on_the_cycle() {
        let err = TaskGraph::build(vec![
            spec("a", &["b"]),
            spec("b", &["a"]),
            spec("c", &["a"]),
            spec("d", &["c"]),
        ])
        .unwrap_err();
        assert_eq!(
            err,
            GraphError::CyclicDependency {
                tasks: vec!["a".into(), "b".into()]
            }
        );
    }

    #[test]
    fn dangling_dependency_is_rejected() {
        let err = TaskGraph::build(vec![spec("ui", &["api"])]).unwrap_err();
        assert_eq!(
            err,
            GraphError::DanglingDependency {
                task: "ui".into(),
                dependency: "api".into()
            }
        );
    }

    #[test]
    fn self_dependency_is_rejected() {
        let err = TaskGraph::build(vec![spec("a", &["a"])]).unwrap_err();
        assert_eq!(err, GraphError::SelfDependency { task: "a".into() });
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let err = TaskGraph::build(vec![spec("a", &[]), spec("a", &[])]).unwrap_err();
        assert_eq!(err, GraphError::DuplicateTaskId { id: "a".into() });
    }

    #[test]
    fn empty_plan_is_rejected() {
        assert_eq!(TaskGraph::build(vec![]).unwrap_err(), GraphError::EmptyPlan);
    }

    #[test]
    fn missing_ids_are_generated_in_plan_order() {
        let graph = TaskGraph::build(vec![
            TaskSpec::new("a.py"),
            TaskSpec::new("b.py").depends_on(["task_001"]),
        ])
        .unwrap();
        let ids: Vec<_> = graph.tasks().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, ["task_001", "task_002"]);
        assert_eq!(graph.execution_order(), ["task_001", "task_002"]);
    }

    #[test]
    fn generated_ids_skip_ids_the_plan_already_uses() {
        let graph = TaskGraph::build(vec![
            TaskSpec::new("a.py").with_id("task_002"),
            TaskSpec::new("b.py"),
            TaskSpec::new("c.py").depends_on(["task_002"]),
        ])
        .unwrap();
        let ids: Vec<_> = graph.tasks().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, ["task_002", "task_003", "task_004"]);
    }

    #[test]
    fn repeated_dependencies_collapse() {
        let graph = TaskGraph::build(vec![spec("a", &[]), spec("b", &["a", "a"])]).unwrap();
        assert_eq!(graph.tasks()[1].dependencies, vec!["a"]);
    }

    #[test]
    fn new_tasks_start_pending_with_no_attempts() {
        let graph = TaskGraph::build(vec![spec("a", &[])]).unwrap();
        let task = &graph.tasks()[0];
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 0);
        assert!(task.last_error.is_none());
        assert!(task.content.is_none());
    }
}
