//! Durable run state, artifact registry, gate records, and audit log.
//!
//! A run is one invocation of a workflow. Each run owns a directory under
//! `runtime/runs/<run_id>/` holding its state machine document, plan files,
//! registered artifacts, gate outcomes, and per-step reasoning dumps. The
//! store guarantees crash safety: every document is written atomically, the
//! audit log is append-only with one record per line, and a run can always be
//! resumed by scanning its gates and artifact registry.
//!
//! Status transitions only move forward; the single exception is
//! `Paused -> InProgress` when a run resumes.

use crate::maestro::paths::{AccessMode, ArtifactKind, PathError, PathResult, Resolver};
use crate::maestro::telemetry::SessionCosts;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug)]
pub enum StateError {
    UnknownRun(String),
    InvalidTransition { from: RunStatus, to: RunStatus },
    /// `current_step` is monotonic; a smaller value was supplied.
    StepRegression { current: u64, requested: u64 },
    Storage(PathError),
    Malformed(String),
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateError::UnknownRun(id) => write!(f, "Unknown run: {}", id),
            StateError::InvalidTransition { from, to } => {
                write!(f, "Invalid run transition {:?} -> {:?}", from, to)
            }
            StateError::StepRegression { current, requested } => write!(
                f,
                "current_step is monotonic: {} -> {} rejected",
                current, requested
            ),
            StateError::Storage(err) => write!(f, "State storage error: {}", err),
            StateError::Malformed(msg) => write!(f, "Malformed state document: {}", msg),
        }
    }
}

impl Error for StateError {}

impl From<PathError> for StateError {
    fn from(err: PathError) -> Self {
        StateError::Storage(err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    InProgress,
    Paused,
    Completed,
    Failed,
}

impl RunStatus {
    /// Forward-only ordering, with `Paused -> InProgress` as the one
    /// allowed reversal.
    pub fn can_transition_to(&self, to: RunStatus) -> bool {
        use RunStatus::*;
        match (self, to) {
            (Paused, InProgress) => true,
            (Created, InProgress) | (Created, Failed) => true,
            (InProgress, Paused) | (InProgress, Completed) | (InProgress, Failed) => true,
            _ => false,
        }
    }
}

/// One invocation of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub status: RunStatus,
    /// Path of the workflow definition driving this run.
    pub workflow: String,
    /// Workflow chosen by routing, when the router made the choice.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_workflow: Option<String>,
    pub current_step: u64,
    /// Open map: routing decision, session id, router handoff, etc.
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    /// Accumulated cost across the router and every agent invocation.
    #[serde(default)]
    pub costs: SessionCosts,
}

/// A registered artifact (metadata only; content stays on disk).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub path: String,
    pub kind: ArtifactKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    pub created_by: String,
    pub step: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

/// Append-only state-change entry in the artifact registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactChange {
    pub path: String,
    pub change: String,
    pub at: DateTime<Utc>,
}

/// Outcome of a validation gate, persisted as `gates/NN-<name>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateRecord {
    pub gate: String,
    pub passed: bool,
    pub reason: String,
    pub step: u64,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub details: BTreeMap<String, Value>,
}

/// One line of the append-only audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook: Option<String>,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    pub decision: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

impl AuditRecord {
    pub fn new(event: impl Into<String>, decision: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            hook: None,
            event: event.into(),
            tool_name: None,
            decision: decision.into(),
            reason: reason.into(),
            agent_role: None,
            run_id: None,
        }
    }

    pub fn with_hook(mut self, hook: impl Into<String>) -> Self {
        self.hook = Some(hook.into());
        self
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool_name = Some(tool.into());
        self
    }

    pub fn with_agent_role(mut self, role: impl Into<String>) -> Self {
        self.agent_role = Some(role.into());
        self
    }

    pub fn with_run(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }
}

/// The durable substrate for runs, artifacts, gates, and audit.
pub struct StateStore {
    resolver: Arc<Resolver>,
}

impl StateStore {
    pub fn new(resolver: Arc<Resolver>) -> Self {
        Self { resolver }
    }

    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.resolver
    }

    // ── Runs ──────────────────────────────────────────────────────────────

    /// Create a run and persist its initial state.
    pub fn create_run(
        &self,
        workflow: &str,
        selected_workflow: Option<String>,
        metadata: BTreeMap<String, Value>,
    ) -> StateResult<Run> {
        let run = Run {
            id: format!("run_{}", uuid::Uuid::new_v4().simple()),
            created_at: Utc::now(),
            status: RunStatus::Created,
            workflow: workflow.to_string(),
            selected_workflow,
            current_step: 0,
            metadata,
            costs: SessionCosts::default(),
        };
        self.save_run(&run)?;
        Ok(run)
    }

    pub fn load_run(&self, run_id: &str) -> StateResult<Run> {
        let path = self.run_state_path(run_id, AccessMode::Read)?;
        let value = self
            .resolver
            .safe_read_json(&path, "run-state")?
            .ok_or_else(|| StateError::UnknownRun(run_id.to_string()))?;
        serde_json::from_value(value).map_err(|e| StateError::Malformed(e.to_string()))
    }

    pub fn save_run(&self, run: &Run) -> StateResult<()> {
        let path = self.run_state_path(&run.id, AccessMode::Write)?;
        let value = serde_json::to_value(run).map_err(|e| StateError::Malformed(e.to_string()))?;
        self.resolver.atomic_write_json(&path, &value)?;
        Ok(())
    }

    /// Transition a run's status, enforcing the forward-only rule.
    pub fn set_status(&self, run_id: &str, status: RunStatus) -> StateResult<Run> {
        let mut run = self.load_run(run_id)?;
        if run.status == status {
            return Ok(run);
        }
        if !run.status.can_transition_to(status) {
            return Err(StateError::InvalidTransition {
                from: run.status,
                to: status,
            });
        }
        run.status = status;
        self.save_run(&run)?;
        Ok(run)
    }

    /// Advance `current_step`. Regressions are rejected.
    pub fn advance_step(&self, run_id: &str, step: u64) -> StateResult<Run> {
        let mut run = self.load_run(run_id)?;
        if step < run.current_step {
            return Err(StateError::StepRegression {
                current: run.current_step,
                requested: step,
            });
        }
        run.current_step = step;
        self.save_run(&run)?;
        Ok(run)
    }

    /// Remove a run directory entirely; artifacts and gate records live
    /// under the run and disappear with it.
    pub fn purge_run(&self, run_id: &str) -> StateResult<()> {
        let dir = self.run_dir(run_id, AccessMode::Read)?;
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(PathError::from)?;
        }
        Ok(())
    }

    /// Ids of all runs present on disk.
    pub fn list_runs(&self) -> StateResult<Vec<String>> {
        let dir = self.resolver.resolve_runtime("runs", AccessMode::Read)?;
        let mut ids = Vec::new();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(err) => return Err(PathError::from(err).into()),
        };
        for entry in entries.flatten() {
            if entry.path().is_dir() {
                ids.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn run_dir(&self, run_id: &str, mode: AccessMode) -> PathResult<PathBuf> {
        self.resolver.resolve_runtime(&format!("runs/{}", run_id), mode)
    }

    fn run_state_path(&self, run_id: &str, mode: AccessMode) -> PathResult<PathBuf> {
        self.resolver
            .resolve_runtime(&format!("runs/{}/state.json", run_id), mode)
    }

    // ── Plans & reasoning ─────────────────────────────────────────────────

    /// Persist a plan document under the run's `plans/` directory.
    pub fn save_plan(&self, run_id: &str, plan_id: &str, plan: &Value) -> StateResult<PathBuf> {
        let path = self.resolver.resolve_runtime(
            &format!("runs/{}/plans/{}.json", run_id, plan_id),
            AccessMode::Write,
        )?;
        self.resolver.atomic_write_json(&path, plan)?;
        Ok(path)
    }

    /// Persist a plan rating alongside its plan (`<plan_id>-rating.json`).
    pub fn save_plan_rating(&self, run_id: &str, plan_id: &str, rating: &Value) -> StateResult<()> {
        let path = self.resolver.resolve_runtime(
            &format!("runs/{}/plans/{}-rating.json", run_id, plan_id),
            AccessMode::Write,
        )?;
        self.resolver.atomic_write_json(&path, rating)?;
        Ok(())
    }

    /// Persist a step's reasoning dump (`reasoning/<step>-<agent>.json`).
    pub fn save_reasoning(
        &self,
        run_id: &str,
        step: u64,
        agent: &str,
        reasoning: &Value,
    ) -> StateResult<()> {
        let path = self.resolver.resolve_runtime(
            &format!("runs/{}/reasoning/{}-{}.json", run_id, step, agent),
            AccessMode::Write,
        )?;
        self.resolver.atomic_write_json(&path, reasoning)?;
        Ok(())
    }

    // ── Gates ─────────────────────────────────────────────────────────────

    /// Record a gate outcome as `gates/NN-<name>.json`.
    pub fn record_gate(&self, run_id: &str, index: u32, record: &GateRecord) -> StateResult<()> {
        let path = self.resolver.resolve_runtime(
            &format!("runs/{}/gates/{:02}-{}.json", run_id, index, record.gate),
            AccessMode::Write,
        )?;
        let value = serde_json::to_value(record).map_err(|e| StateError::Malformed(e.to_string()))?;
        self.resolver.atomic_write_json(&path, &value)?;
        Ok(())
    }

    /// All gate records for a run, ordered by file index.
    pub fn load_gates(&self, run_id: &str) -> StateResult<Vec<GateRecord>> {
        let dir = self
            .resolver
            .resolve_runtime(&format!("runs/{}/gates", run_id), AccessMode::Read)?;
        let mut indexed: Vec<(u32, GateRecord)> = Vec::new();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(PathError::from(err).into()),
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(index) = name.split('-').next().and_then(|n| n.parse::<u32>().ok()) else {
                continue;
            };
            let Some(value) = self.resolver.safe_read_json(&entry.path(), "gate-record")? else {
                continue;
            };
            match serde_json::from_value(value) {
                Ok(record) => indexed.push((index, record)),
                Err(err) => log::warn!("skipping malformed gate record {}: {}", name, err),
            }
        }
        indexed.sort_by_key(|(index, _)| *index);
        Ok(indexed.into_iter().map(|(_, record)| record).collect())
    }

    /// Reconstruct the step a run should resume from: one past the highest
    /// step with a passed gate. No re-planning is needed when plan
    /// artifacts are intact.
    pub fn recover_current_step(&self, run_id: &str) -> StateResult<u64> {
        let gates = self.load_gates(run_id)?;
        Ok(gates
            .iter()
            .filter(|g| g.passed)
            .map(|g| g.step + 1)
            .max()
            .unwrap_or(0))
    }

    // ── Artifact registry ─────────────────────────────────────────────────

    /// Register an artifact in the run's registry. Idempotent by
    /// path + content hash: re-registering an identical artifact is a no-op.
    pub fn register_artifact(
        &self,
        run_id: &str,
        artifact_path: &Path,
        kind: ArtifactKind,
        schema: Option<String>,
        created_by: &str,
        step: u64,
    ) -> StateResult<bool> {
        let registry_path = self.registry_path(run_id, AccessMode::Write)?;
        let mut doc = self.load_registry(&registry_path)?;
        let content_hash = hash_file(artifact_path);
        let path_string = artifact_path.to_string_lossy().into_owned();
        let duplicate = doc.artifacts.iter().any(|a: &ArtifactRecord| {
            a.path == path_string && a.content_hash == content_hash
        });
        if duplicate {
            return Ok(false);
        }
        doc.artifacts.push(ArtifactRecord {
            path: path_string.clone(),
            kind,
            schema,
            created_by: created_by.to_string(),
            step,
            created_at: Utc::now(),
            content_hash,
        });
        doc.changes.push(ArtifactChange {
            path: path_string,
            change: "registered".to_string(),
            at: Utc::now(),
        });
        self.store_registry(&registry_path, &doc)?;
        Ok(true)
    }

    /// Append an invalidation record. History is never rewritten.
    pub fn invalidate_artifact(&self, run_id: &str, artifact_path: &str) -> StateResult<()> {
        let registry_path = self.registry_path(run_id, AccessMode::Write)?;
        let mut doc = self.load_registry(&registry_path)?;
        doc.changes.push(ArtifactChange {
            path: artifact_path.to_string(),
            change: "invalidated".to_string(),
            at: Utc::now(),
        });
        self.store_registry(&registry_path, &doc)
    }

    pub fn list_artifacts(&self, run_id: &str) -> StateResult<Vec<ArtifactRecord>> {
        let registry_path = self.registry_path(run_id, AccessMode::Read)?;
        Ok(self.load_registry(&registry_path)?.artifacts)
    }

    /// The full append-only change log for a run's artifacts.
    pub fn artifact_changes(&self, run_id: &str) -> StateResult<Vec<ArtifactChange>> {
        let registry_path = self.registry_path(run_id, AccessMode::Read)?;
        Ok(self.load_registry(&registry_path)?.changes)
    }

    fn registry_path(&self, run_id: &str, mode: AccessMode) -> PathResult<PathBuf> {
        self.resolver
            .resolve_runtime(&format!("runs/{}/artifact-registry.json", run_id), mode)
    }

    fn load_registry(&self, path: &Path) -> StateResult<RegistryDoc> {
        match self.resolver.safe_read_json(path, "artifact-registry")? {
            Some(value) => {
                serde_json::from_value(value).map_err(|e| StateError::Malformed(e.to_string()))
            }
            None => Ok(RegistryDoc::default()),
        }
    }

    fn store_registry(&self, path: &Path, doc: &RegistryDoc) -> StateResult<()> {
        let value = serde_json::to_value(doc).map_err(|e| StateError::Malformed(e.to_string()))?;
        self.resolver.atomic_write_json(path, &value)?;
        Ok(())
    }

    // ── Audit ─────────────────────────────────────────────────────────────

    /// Append one record to the audit log. The file is opened in append
    /// mode so concurrent writers interleave whole lines rather than
    /// clobbering each other.
    pub fn append_audit(&self, record: &AuditRecord) -> StateResult<()> {
        self.append_jsonl("logs/audit.jsonl", record)
    }

    /// Append a CRITICAL incident to the security-events log (in addition
    /// to the audit log, which the caller writes separately).
    pub fn append_security_event(&self, record: &AuditRecord) -> StateResult<()> {
        self.append_jsonl("logs/security-events.jsonl", record)
    }

    fn append_jsonl<T: Serialize>(&self, subpath: &str, record: &T) -> StateResult<()> {
        let path = self.resolver.resolve_runtime(subpath, AccessMode::Write)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(PathError::from)?;
        }
        let line = serde_json::to_string(record).map_err(|e| StateError::Malformed(e.to_string()))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(PathError::from)?;
        writeln!(file, "{}", line).map_err(PathError::from)?;
        Ok(())
    }

    /// Read the audit log back as parsed records, skipping malformed lines.
    pub fn read_audit(&self) -> StateResult<Vec<AuditRecord>> {
        let path = self.resolver.resolve_runtime("logs/audit.jsonl", AccessMode::Read)?;
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(PathError::from(err).into()),
        };
        Ok(raw
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RegistryDoc {
    #[serde(default)]
    artifacts: Vec<ArtifactRecord>,
    #[serde(default)]
    changes: Vec<ArtifactChange>,
}

/// SHA-256 of a file's content, when it exists.
fn hash_file(path: &Path) -> Option<String> {
    let content = fs::read(path).ok()?;
    let mut hasher = Sha256::new();
    hasher.update(&content);
    Some(format!("{:x}", hasher.finalize()))
}

/// Convenience document builder for gate records.
impl GateRecord {
    pub fn passed(gate: impl Into<String>, step: u64, reason: impl Into<String>) -> Self {
        Self {
            gate: gate.into(),
            passed: true,
            reason: reason.into(),
            step,
            at: Utc::now(),
            details: BTreeMap::new(),
        }
    }

    pub fn failed(gate: impl Into<String>, step: u64, reason: impl Into<String>) -> Self {
        Self {
            gate: gate.into(),
            passed: false,
            reason: reason.into(),
            step,
            at: Utc::now(),
            details: BTreeMap::new(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }
}

/// JSON view of a run used by the CLI `state summary` command.
pub fn run_summary(run: &Run) -> Value {
    json!({
        "id": run.id,
        "status": run.status,
        "workflow": run.workflow,
        "selected_workflow": run.selected_workflow,
        "current_step": run.current_step,
        "created_at": run.created_at,
        "total_cost_usd": run.costs.total_usd,
    })
}
