//! Agent Dispatch
//!
//! The actual agent-invocation boundary. Every delegation is an
//! [`AgentTask`] envelope that must validate against the task schema before
//! anything runs: freeform prompts are rejected by the template enforcer
//! with a block. Validated tasks get their prompt augmented with the skills
//! the knowledge index requires for the agent role, then execute through
//! the supervisor (isolated or in-process), with every tool call filtered
//! by the hook pipeline.
//!
//! After the agent returns, the response is verified: the schema-mandated
//! sections (`completed`, `artifacts`, `errors`, `summary`) are parsed,
//! every declared output artifact is cross-checked against the registry,
//! and the outcome is classified `success`, `partial`, or `failed` with
//! explicit predicates. A task whose verification demands a summary fails
//! without one, however successful it looks otherwise.

use crate::maestro::hooks::{
    Decision, Hook, HookDecision, HookEnvelope, HookEvent, HookPipeline, HookResult,
};
use crate::maestro::knowledge::KnowledgeIndex;
use crate::maestro::paths::ArtifactKind;
use crate::maestro::state::{AuditRecord, StateStore};
use crate::maestro::supervisor::{
    ExecutionLimits, Supervisor, TaskEnvelope, WorkerContext, WorkerOutcome, WorkerStatus,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;

/// The reason prefix every template block carries.
pub const TEMPLATE_VIOLATION: &str = "AGENT TASK TEMPLATE VIOLATION";

/// Verification demands attached to a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerificationSpec {
    #[serde(default)]
    pub must_produce: Vec<String>,
    #[serde(default)]
    pub must_not_error: bool,
    #[serde(default)]
    pub summary_required: bool,
}

/// The schema-validated delegation payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTask {
    pub agent_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub description: String,
    pub assigned_skills: Vec<String>,
    #[serde(default)]
    pub required_artifacts: Vec<String>,
    pub output_artifacts: Vec<String>,
    pub execution_limits: ExecutionLimits,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub tools_allowed: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_template_id: Option<String>,
    pub verification: VerificationSpec,
}

/// Validate a raw delegation payload against the task schema.
///
/// Every missing required key is collected so the rejection reason names
/// all of them at once.
pub fn validate_task_input(input: &Value) -> Result<AgentTask, String> {
    let Some(map) = input.as_object() else {
        return Err(format!("{}: payload must be a JSON object", TEMPLATE_VIOLATION));
    };

    let mut missing = Vec::new();
    for key in [
        "agent_type",
        "description",
        "assigned_skills",
        "output_artifacts",
        "execution_limits",
        "verification",
    ] {
        if !map.contains_key(key) {
            missing.push(key.to_string());
        }
    }
    if let Some(limits) = map.get("execution_limits").and_then(|l| l.as_object()) {
        for key in ["max_turns", "max_duration_ms", "max_cost_usd", "timeout_action"] {
            if !limits.contains_key(key) {
                missing.push(format!("execution_limits.{}", key));
            }
        }
    }
    if let Some(verification) = map.get("verification").and_then(|v| v.as_object()) {
        for key in ["must_produce", "summary_required"] {
            if !verification.contains_key(key) {
                missing.push(format!("verification.{}", key));
            }
        }
    }
    if !missing.is_empty() {
        return Err(format!(
            "{}: missing required keys: {}",
            TEMPLATE_VIOLATION,
            missing.join(", ")
        ));
    }

    serde_json::from_value(input.clone())
        .map_err(|e| format!("{}: {}", TEMPLATE_VIOLATION, e))
}

// ── Pre-dispatch hooks ────────────────────────────────────────────────────

/// Blocks delegation payloads that do not conform to the task schema.
pub struct TemplateEnforcementHook;

#[async_trait]
impl Hook for TemplateEnforcementHook {
    fn name(&self) -> &str {
        "template-enforcer"
    }

    fn security_critical(&self) -> bool {
        true
    }

    async fn run(&self, envelope: &HookEnvelope) -> HookResult<HookDecision> {
        let input = envelope.tool_input.as_ref().ok_or("missing tool input")?;
        match validate_task_input(input) {
            Ok(_) => Ok(HookDecision::allow()),
            Err(reason) => Ok(HookDecision::block(reason)),
        }
    }
}

/// Keywords that make a task security-relevant.
pub const DEFAULT_SECURITY_TRIGGERS: [&str; 8] = [
    "auth",
    "password",
    "credential",
    "token",
    "secret",
    "injection",
    "vulnerability",
    "encryption",
];

/// Requires a security-capable agent whenever the task description matches
/// a trigger keyword.
pub struct SecurityTriggerHook {
    triggers: Vec<String>,
}

impl Default for SecurityTriggerHook {
    fn default() -> Self {
        Self {
            triggers: DEFAULT_SECURITY_TRIGGERS
                .iter()
                .map(|t| t.to_string())
                .collect(),
        }
    }
}

impl SecurityTriggerHook {
    pub fn new(triggers: Vec<String>) -> Self {
        Self { triggers }
    }
}

#[async_trait]
impl Hook for SecurityTriggerHook {
    fn name(&self) -> &str {
        "security-trigger"
    }

    fn security_critical(&self) -> bool {
        true
    }

    async fn run(&self, envelope: &HookEnvelope) -> HookResult<HookDecision> {
        let input = envelope.tool_input.as_ref().ok_or("missing tool input")?;
        let description = input
            .get("description")
            .and_then(|d| d.as_str())
            .unwrap_or_default()
            .to_lowercase();
        let Some(matched) = self.triggers.iter().find(|t| description.contains(t.as_str())) else {
            return Ok(HookDecision::allow());
        };
        let agent_type = input
            .get("agent_type")
            .and_then(|a| a.as_str())
            .unwrap_or_default();
        let skills = input
            .get("assigned_skills")
            .and_then(|s| s.as_array())
            .map(|skills| {
                skills
                    .iter()
                    .filter_map(|s| s.as_str())
                    .any(|s| s.contains("security"))
            })
            .unwrap_or(false);
        if agent_type.contains("security") || skills {
            return Ok(HookDecision::allow());
        }
        Ok(HookDecision::block(format!(
            "task matches security trigger '{}' but no security-capable agent is assigned",
            matched
        )))
    }
}

// ── Verification ──────────────────────────────────────────────────────────

/// Outcome classification after verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeClass {
    Success,
    Partial,
    Failed,
}

impl OutcomeClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeClass::Success => "success",
            OutcomeClass::Partial => "partial",
            OutcomeClass::Failed => "failed",
        }
    }
}

/// The parsed response sections plus the cross-checks.
#[derive(Debug, Clone, Default, Serialize)]
pub struct VerificationReport {
    pub completed: bool,
    pub artifacts: Vec<String>,
    pub errors: Vec<String>,
    pub summary: Option<String>,
    /// Skills the agent reports having invoked (consumed by the
    /// skill-usage gate).
    pub skills_used: Vec<String>,
    /// Declared outputs that do not exist on disk.
    pub missing_artifacts: Vec<String>,
}

/// Parse the structured sections out of an agent's final text. The agent is
/// instructed to end with a JSON object carrying `completed`, `artifacts`,
/// `errors`, and `summary`.
pub fn parse_response_sections(output: &str) -> VerificationReport {
    let parsed = output
        .find('{')
        .and_then(|start| output.rfind('}').map(|end| (start, end)))
        .filter(|(start, end)| end > start)
        .and_then(|(start, end)| serde_json::from_str::<Value>(&output[start..=end]).ok());
    let Some(value) = parsed else {
        return VerificationReport::default();
    };
    VerificationReport {
        completed: value.get("completed").and_then(|c| c.as_bool()).unwrap_or(false),
        artifacts: string_array(value.get("artifacts")),
        errors: string_array(value.get("errors")),
        summary: value
            .get("summary")
            .and_then(|s| s.as_str())
            .map(|s| s.to_string()),
        skills_used: string_array(value.get("skills_used")),
        missing_artifacts: Vec::new(),
    }
}

fn string_array(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|entries| {
            entries
                .iter()
                .filter_map(|e| e.as_str())
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default()
}

/// The classification rubric, as explicit predicates:
///
/// - `failed`: a must-produce artifact is missing, a fatal error was
///   recorded while `must_not_error` is set, or a required summary is
///   absent.
/// - `partial`: the agent reported completion but produced only a subset
///   of its declared artifacts, or reported non-fatal errors.
/// - `success`: everything else with `completed = true`.
pub fn classify_outcome(spec: &VerificationSpec, report: &VerificationReport) -> OutcomeClass {
    if !report.missing_artifacts.is_empty()
        && spec
            .must_produce
            .iter()
            .any(|required| report.missing_artifacts.contains(required))
    {
        return OutcomeClass::Failed;
    }
    if spec.must_not_error && !report.errors.is_empty() {
        return OutcomeClass::Failed;
    }
    if spec.summary_required && report.summary.as_deref().map(str::trim).unwrap_or("").is_empty() {
        return OutcomeClass::Failed;
    }
    if !report.completed {
        return OutcomeClass::Failed;
    }
    if !report.missing_artifacts.is_empty() || !report.errors.is_empty() {
        return OutcomeClass::Partial;
    }
    OutcomeClass::Success
}

// ── The dispatcher ────────────────────────────────────────────────────────

/// Result of one dispatch.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// A pre-dispatch hook rejected the delegation. No worker was spawned.
    Blocked { reason: String },
    /// The agent ran; verification classified the result.
    Executed {
        class: OutcomeClass,
        report: VerificationReport,
        worker: WorkerOutcome,
    },
}

/// The agent invocation boundary.
pub struct Dispatcher {
    pipeline: Arc<HookPipeline>,
    supervisor: Arc<Supervisor>,
    knowledge: Arc<KnowledgeIndex>,
    state: Arc<StateStore>,
}

impl Dispatcher {
    pub fn new(
        pipeline: Arc<HookPipeline>,
        supervisor: Arc<Supervisor>,
        knowledge: Arc<KnowledgeIndex>,
        state: Arc<StateStore>,
    ) -> Self {
        Self {
            pipeline,
            supervisor,
            knowledge,
            state,
        }
    }

    /// Dispatch a raw delegation payload for a run step.
    ///
    /// The payload goes through the pre-dispatch hooks first (template
    /// enforcement, security triggers, role permissions); a block means no
    /// worker is ever spawned. Allowed tasks are skill-injected, executed,
    /// verified, and audited.
    pub async fn dispatch(
        &self,
        run_id: Option<&str>,
        raw_task: &Value,
        context: WorkerContext,
        step: u64,
        complexity_score: f64,
    ) -> DispatchOutcome {
        let hook_envelope =
            HookEnvelope::for_tool(HookEvent::PreToolUse, "task-delegation", raw_task.clone())
                .with_context("run_id", json!(run_id.unwrap_or_default()));
        let aggregate = self
            .pipeline
            .dispatch(HookEvent::PreToolUse, &hook_envelope)
            .await;
        if aggregate.decision == Decision::Block {
            let reason = aggregate
                .blocking()
                .map(|b| b.reason.clone())
                .unwrap_or_else(|| format!("{}: delegation rejected", TEMPLATE_VIOLATION));
            return DispatchOutcome::Blocked { reason };
        }

        // The pipeline allowed it; the schema must parse now. A divergence
        // here means the enforcer was not registered, so fail closed anyway.
        let task = match validate_task_input(raw_task) {
            Ok(task) => task,
            Err(reason) => return DispatchOutcome::Blocked { reason },
        };

        let prompt = self.build_prompt(&task);
        let envelope = TaskEnvelope {
            session_id: task
                .task_id
                .clone()
                .unwrap_or_else(|| format!("task_{}", uuid::Uuid::new_v4().simple())),
            agent_kind: task.agent_type.clone(),
            prompt,
            tools_allowed: task.tools_allowed.clone(),
            execution_limits: task.execution_limits.clamped(),
            context_refs: task.required_artifacts.clone(),
        };

        let worker = self
            .supervisor
            .execute_task(envelope, context, complexity_score)
            .await;

        let mut report = worker
            .output
            .as_deref()
            .map(parse_response_sections)
            .unwrap_or_default();
        if worker.status != WorkerStatus::Completed {
            report.completed = false;
            if let Some(reason) = &worker.reason {
                report.errors.push(reason.clone());
            }
        }
        self.cross_check_artifacts(run_id, &task, &mut report, step);

        let class = classify_outcome(&task.verification, &report);
        self.audit(run_id, &task, class, &report);

        DispatchOutcome::Executed {
            class,
            report,
            worker,
        }
    }

    /// Skill injection: prepend the skills the knowledge index requires
    /// for this agent role, merged with the task's assigned skills.
    fn build_prompt(&self, task: &AgentTask) -> String {
        let mut skills: Vec<String> = task.assigned_skills.clone();
        for row in self.knowledge.skills_for_agent(&task.agent_type) {
            if !skills.contains(&row.name) {
                skills.push(row.name);
            }
        }
        let mut prompt = String::new();
        if !skills.is_empty() {
            prompt.push_str(&format!("Required skills: {}\n", skills.join(", ")));
        }
        if !task.required_artifacts.is_empty() {
            prompt.push_str(&format!(
                "Input artifacts: {}\n",
                task.required_artifacts.join(", ")
            ));
        }
        if !task.output_artifacts.is_empty() {
            prompt.push_str(&format!(
                "You must produce: {}\n",
                task.output_artifacts.join(", ")
            ));
        }
        prompt.push_str(
            "Finish with a JSON object: {\"completed\": bool, \"artifacts\": [..], \
             \"errors\": [..], \"summary\": \"...\"}.\n\n",
        );
        prompt.push_str(&task.description);
        prompt
    }

    /// Every declared output artifact must exist on disk and register
    /// cleanly in the run's registry.
    fn cross_check_artifacts(
        &self,
        run_id: Option<&str>,
        task: &AgentTask,
        report: &mut VerificationReport,
        step: u64,
    ) {
        for declared in &task.output_artifacts {
            let resolved = self
                .state
                .resolver()
                .resolve_artifact(ArtifactKind::Generated, declared);
            let path = match resolved {
                Ok(path) => path,
                Err(err) => {
                    report.errors.push(format!("artifact path rejected: {}", err));
                    report.missing_artifacts.push(declared.clone());
                    continue;
                }
            };
            if !Path::new(&path).exists() {
                report.missing_artifacts.push(declared.clone());
                continue;
            }
            if let Some(run_id) = run_id {
                if let Err(err) = self.state.register_artifact(
                    run_id,
                    &path,
                    ArtifactKind::Generated,
                    None,
                    &task.agent_type,
                    step,
                ) {
                    report
                        .errors
                        .push(format!("artifact registration failed: {}", err));
                }
            }
        }
    }

    fn audit(
        &self,
        run_id: Option<&str>,
        task: &AgentTask,
        class: OutcomeClass,
        report: &VerificationReport,
    ) {
        let mut record = AuditRecord::new(
            "PostDelegation",
            class.as_str(),
            report
                .summary
                .clone()
                .unwrap_or_else(|| "no summary provided".to_string()),
        )
        .with_agent_role(task.agent_type.clone());
        if let Some(run_id) = run_id {
            record = record.with_run(run_id.to_string());
        }
        if let Err(err) = self.state.append_audit(&record) {
            log::warn!("failed to audit dispatch outcome: {}", err);
        }
    }
}
