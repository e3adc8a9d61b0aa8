//! Durable task graph.
//!
//! Tasks are the unit of work agents claim and complete, possibly across
//! several invocations. The store keeps one JSON index
//! (`runtime/tasks/index.json`) mapping id to record, and validates the
//! dependency graph on every write: a task becomes executable only when all
//! of its dependencies are completed, and any update that would introduce a
//! cycle is rejected.
//!
//! Completion carries an iron law: a task cannot move to `Completed` without
//! a summary string in its metadata. The companion rule (callers
//! re-list tasks after any completion to pick up newly unblocked work) is
//! enforced by the dispatch layer, not here.

use crate::maestro::paths::{AccessMode, PathError, PathResult, Resolver};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;
use std::fmt;
use std::sync::Arc;

pub type TaskResult<T> = Result<T, TaskError>;

#[derive(Debug)]
pub enum TaskError {
    NotFound(String),
    /// The update would introduce a dependency cycle through this task.
    Cycle(String),
    /// Completion attempted without a summary.
    MissingSummary(String),
    /// Claim attempted while a dependency is not completed.
    DependencyIncomplete { task: String, dependency: String },
    UnknownDependency { task: String, dependency: String },
    Storage(PathError),
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::NotFound(id) => write!(f, "Task not found: {}", id),
            TaskError::Cycle(id) => write!(f, "Dependency cycle through task {}", id),
            TaskError::MissingSummary(id) => {
                write!(f, "Task {} cannot complete without a summary", id)
            }
            TaskError::DependencyIncomplete { task, dependency } => write!(
                f,
                "Task {} cannot start: dependency {} is not completed",
                task, dependency
            ),
            TaskError::UnknownDependency { task, dependency } => {
                write!(f, "Task {} references unknown dependency {}", task, dependency)
            }
            TaskError::Storage(err) => write!(f, "Task storage error: {}", err),
        }
    }
}

impl Error for TaskError {}

impl From<PathError> for TaskError {
    fn from(err: PathError) -> Self {
        TaskError::Storage(err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Blocked,
    Completed,
    Failed,
}

/// Completion metadata accumulated while a task runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskMetadata {
    #[serde(default)]
    pub discoveries: Vec<String>,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub patterns: Vec<String>,
    /// Required at completion time (the iron law).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub subject: String,
    pub description: String,
    pub status: TaskStatus,
    /// Agent kind currently responsible for the task, if claimed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    #[serde(default)]
    pub metadata: TaskMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial update applied by [`TaskStore::update`]. `None` fields are left
/// untouched.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub subject: Option<String>,
    pub description: Option<String>,
    pub status: Option<TaskStatus>,
    pub owner: Option<Option<String>>,
    pub dependencies: Option<BTreeSet<String>>,
    pub summary: Option<String>,
    pub files_modified: Option<Vec<String>>,
    pub discoveries: Option<Vec<String>>,
    pub patterns: Option<Vec<String>>,
}

impl TaskPatch {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn completed(summary: impl Into<String>) -> Self {
        Self {
            status: Some(TaskStatus::Completed),
            summary: Some(summary.into()),
            ..Self::default()
        }
    }
}

/// The durable task index.
pub struct TaskStore {
    resolver: Arc<Resolver>,
}

const INDEX_SUBPATH: &str = "tasks/index.json";

impl TaskStore {
    pub fn new(resolver: Arc<Resolver>) -> Self {
        Self { resolver }
    }

    /// Create a task. Dependencies must already exist and must not form a
    /// cycle. Returns the stored record with its assigned id.
    pub fn create(
        &self,
        subject: &str,
        description: &str,
        dependencies: BTreeSet<String>,
    ) -> TaskResult<TaskRecord> {
        let mut tasks = self.load_index()?;
        let id = (tasks
            .keys()
            .filter_map(|k| k.parse::<u64>().ok())
            .max()
            .unwrap_or(0)
            + 1)
        .to_string();
        for dependency in &dependencies {
            if !tasks.contains_key(dependency) {
                return Err(TaskError::UnknownDependency {
                    task: id,
                    dependency: dependency.clone(),
                });
            }
        }
        let now = Utc::now();
        let record = TaskRecord {
            id: id.clone(),
            subject: subject.to_string(),
            description: description.to_string(),
            status: TaskStatus::Pending,
            owner: None,
            dependencies,
            metadata: TaskMetadata::default(),
            created_at: now,
            updated_at: now,
        };
        tasks.insert(id.clone(), record.clone());
        if has_cycle(&tasks, &id) {
            return Err(TaskError::Cycle(id));
        }
        self.store_index(&tasks)?;
        Ok(record)
    }

    pub fn get(&self, id: &str) -> TaskResult<TaskRecord> {
        self.load_index()?
            .remove(id)
            .ok_or_else(|| TaskError::NotFound(id.to_string()))
    }

    /// List tasks, optionally filtered by status, ordered by numeric id.
    pub fn list(&self, filter: Option<TaskStatus>) -> TaskResult<Vec<TaskRecord>> {
        let tasks = self.load_index()?;
        let mut records: Vec<TaskRecord> = tasks
            .into_values()
            .filter(|t| filter.map(|f| t.status == f).unwrap_or(true))
            .collect();
        records.sort_by_key(|t| t.id.parse::<u64>().unwrap_or(u64::MAX));
        Ok(records)
    }

    /// Apply a patch. Enforces the completion iron law, the single-owner
    /// rule on claims, and cycle-freedom on dependency changes.
    pub fn update(&self, id: &str, patch: TaskPatch) -> TaskResult<TaskRecord> {
        let mut tasks = self.load_index()?;
        let mut record = tasks
            .get(id)
            .cloned()
            .ok_or_else(|| TaskError::NotFound(id.to_string()))?;

        if let Some(subject) = patch.subject {
            record.subject = subject;
        }
        if let Some(description) = patch.description {
            record.description = description;
        }
        if let Some(owner) = patch.owner {
            record.owner = owner;
        }
        if let Some(dependencies) = patch.dependencies {
            for dependency in &dependencies {
                if !tasks.contains_key(dependency) {
                    return Err(TaskError::UnknownDependency {
                        task: id.to_string(),
                        dependency: dependency.clone(),
                    });
                }
            }
            record.dependencies = dependencies;
        }
        if let Some(summary) = patch.summary {
            record.metadata.summary = Some(summary);
        }
        if let Some(files) = patch.files_modified {
            record.metadata.files_modified = files;
        }
        if let Some(discoveries) = patch.discoveries {
            record.metadata.discoveries = discoveries;
        }
        if let Some(patterns) = patch.patterns {
            record.metadata.patterns = patterns;
        }
        if let Some(status) = patch.status {
            if status == TaskStatus::Completed && record.metadata.summary.is_none() {
                return Err(TaskError::MissingSummary(id.to_string()));
            }
            if status == TaskStatus::InProgress {
                for dependency in &record.dependencies {
                    let done = tasks
                        .get(dependency)
                        .map(|d| d.status == TaskStatus::Completed)
                        .unwrap_or(false);
                    if !done {
                        return Err(TaskError::DependencyIncomplete {
                            task: id.to_string(),
                            dependency: dependency.clone(),
                        });
                    }
                }
            }
            record.status = status;
        }
        record.updated_at = Utc::now();

        tasks.insert(id.to_string(), record.clone());
        if has_cycle(&tasks, id) {
            return Err(TaskError::Cycle(id.to_string()));
        }
        self.store_index(&tasks)?;
        Ok(record)
    }

    /// Claim a task for an owner, moving it to `InProgress`. Fails if any
    /// dependency is not completed.
    pub fn claim(&self, id: &str, owner: &str) -> TaskResult<TaskRecord> {
        self.update(
            id,
            TaskPatch {
                status: Some(TaskStatus::InProgress),
                owner: Some(Some(owner.to_string())),
                ..TaskPatch::default()
            },
        )
    }

    /// Tasks that are pending with every dependency completed, in id order.
    pub fn next_available_tasks(&self) -> TaskResult<Vec<TaskRecord>> {
        let tasks = self.load_index()?;
        let mut available: Vec<TaskRecord> = tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter(|t| {
                t.dependencies.iter().all(|d| {
                    tasks
                        .get(d)
                        .map(|dep| dep.status == TaskStatus::Completed)
                        .unwrap_or(false)
                })
            })
            .cloned()
            .collect();
        available.sort_by_key(|t| t.id.parse::<u64>().unwrap_or(u64::MAX));
        Ok(available)
    }

    fn load_index(&self) -> TaskResult<BTreeMap<String, TaskRecord>> {
        let path = self
            .resolver
            .resolve_runtime(INDEX_SUBPATH, AccessMode::Read)?;
        let tasks = self
            .resolver
            .safe_read_json(&path, "tasks-index")?
            .and_then(|v| v.get("tasks").cloned())
            .and_then(|tasks| serde_json::from_value(tasks).ok())
            .unwrap_or_default();
        Ok(tasks)
    }

    fn store_index(&self, tasks: &BTreeMap<String, TaskRecord>) -> TaskResult<()> {
        let path = self
            .resolver
            .resolve_runtime(INDEX_SUBPATH, AccessMode::Write)?;
        let doc = json!({
            "tasks": serde_json::to_value(tasks).unwrap_or(Value::Null),
            "updated_at": Utc::now(),
        });
        self.resolver.atomic_write_json(&path, &doc)?;
        Ok(())
    }
}

/// Depth-first cycle check over the dependency edges reachable from `start`.
fn has_cycle(tasks: &BTreeMap<String, TaskRecord>, start: &str) -> bool {
    fn visit(
        tasks: &BTreeMap<String, TaskRecord>,
        id: &str,
        in_stack: &mut BTreeSet<String>,
        visited: &mut BTreeSet<String>,
    ) -> bool {
        if in_stack.contains(id) {
            return true;
        }
        if visited.contains(id) {
            return false;
        }
        in_stack.insert(id.to_string());
        if let Some(record) = tasks.get(id) {
            for dependency in &record.dependencies {
                if visit(tasks, dependency, in_stack, visited) {
                    return true;
                }
            }
        }
        in_stack.remove(id);
        visited.insert(id.to_string());
        false
    }
    visit(tasks, start, &mut BTreeSet::new(), &mut BTreeSet::new())
}
