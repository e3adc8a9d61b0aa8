//! Workflow Executor
//!
//! Drives a workflow to completion: strictly sequential steps, each of
//! which loads its inputs from the artifact registry, dispatches one or
//! more agents (concurrently within the step), validates what came back,
//! and runs the step's gates before the run may advance. Step 0 is always
//! planning, and the plan must be rated at least 7/10, with at most three
//! rating attempts, before anything else happens.
//!
//! Gate predicates are data-driven expressions (`rating >= 7.0`) evaluated
//! against the gate's context, so operators can tighten thresholds without
//! touching code. A failed gate rejects the step with a precise reason and
//! pauses the run; there is no silent recovery.
//!
//! When a router handoff is present the executor trusts it completely: the
//! routing decision rides in the run metadata, the router's accumulated
//! costs are merged into the run, and no re-classification happens. Legacy
//! callers without a handoff get the executor's own semantic routing.

use crate::maestro::dispatch::{DispatchOutcome, Dispatcher, OutcomeClass};
use crate::maestro::paths::AccessMode;
use crate::maestro::router::RouterHandoff;
use crate::maestro::state::{GateRecord, Run, RunStatus, StateStore};
use crate::maestro::supervisor::WorkerContext;
use crate::maestro::telemetry::Telemetry;
use evalexpr::ContextWithMutableVariables;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// The plan-rating predicate and attempt cap.
pub const PLAN_RATING_PREDICATE: &str = "rating >= 7.0";
pub const MAX_RATING_ATTEMPTS: u32 = 3;

pub type WorkflowResult<T> = Result<T, WorkflowError>;

#[derive(Debug)]
pub enum WorkflowError {
    State(crate::maestro::state::StateError),
    InvalidSpec(String),
    Predicate(String),
}

impl fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowError::State(err) => write!(f, "State error: {}", err),
            WorkflowError::InvalidSpec(msg) => write!(f, "Invalid workflow: {}", msg),
            WorkflowError::Predicate(msg) => write!(f, "Gate predicate error: {}", msg),
        }
    }
}

impl Error for WorkflowError {}

impl From<crate::maestro::state::StateError> for WorkflowError {
    fn from(err: crate::maestro::state::StateError) -> Self {
        WorkflowError::State(err)
    }
}

/// Validation attached to a step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepValidation {
    /// Schema name the produced artifacts must satisfy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    /// Whether this step's primary artifact needs a rating gate.
    #[serde(default)]
    pub rating_required: bool,
}

/// One step of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: u64,
    pub name: String,
    /// Agents dispatched for this step; more than one runs concurrently
    /// and the gates evaluate after all have returned.
    pub agents: Vec<String>,
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Artifact names this step must produce.
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub validation: StepValidation,
}

/// A parsed workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub name: String,
    pub steps: Vec<WorkflowStep>,
}

impl WorkflowSpec {
    /// Parse and validate a workflow document. Step 0 must exist and is
    /// always planning.
    pub fn from_value(value: &Value) -> WorkflowResult<Self> {
        let spec: WorkflowSpec = serde_json::from_value(value.clone())
            .map_err(|e| WorkflowError::InvalidSpec(e.to_string()))?;
        if spec.steps.is_empty() {
            return Err(WorkflowError::InvalidSpec("workflow has no steps".to_string()));
        }
        if spec.steps[0].id != 0 {
            return Err(WorkflowError::InvalidSpec(
                "step 0 (planning) must come first".to_string(),
            ));
        }
        for (position, step) in spec.steps.iter().enumerate() {
            if step.id != position as u64 {
                return Err(WorkflowError::InvalidSpec(format!(
                    "step ids must be sequential; found {} at position {}",
                    step.id, position
                )));
            }
            if step.agents.is_empty() {
                return Err(WorkflowError::InvalidSpec(format!(
                    "step {} has no agents",
                    step.id
                )));
            }
        }
        Ok(spec)
    }
}

/// Rates a plan document out of 10. Production wiring dispatches the
/// rating skill; tests supply a scripted rater.
#[async_trait::async_trait]
pub trait PlanRater: Send + Sync {
    async fn rate(&self, plan: &Value) -> f64;
}

/// The user-visible structured record a run returns.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub status: RunStatus,
    pub reason: String,
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

/// Evaluate a gate predicate against numeric bindings.
pub fn evaluate_gate_predicate(
    predicate: &str,
    bindings: &[(&str, f64)],
) -> WorkflowResult<bool> {
    let mut context: evalexpr::HashMapContext = evalexpr::HashMapContext::new();
    for (name, value) in bindings {
        context
            .set_value((*name).to_string(), evalexpr::Value::Float(*value))
            .map_err(|e| WorkflowError::Predicate(e.to_string()))?;
    }
    evalexpr::eval_boolean_with_context(predicate, &context)
        .map_err(|e| WorkflowError::Predicate(e.to_string()))
}

/// The executor.
pub struct WorkflowExecutor {
    state: Arc<StateStore>,
    dispatcher: Arc<Dispatcher>,
    telemetry: Arc<Telemetry>,
    rater: Arc<dyn PlanRater>,
    signoff_matrix: BTreeMap<String, Vec<String>>,
    security_triggers: Vec<String>,
}

impl WorkflowExecutor {
    pub fn new(
        state: Arc<StateStore>,
        dispatcher: Arc<Dispatcher>,
        telemetry: Arc<Telemetry>,
        rater: Arc<dyn PlanRater>,
    ) -> Self {
        let signoff_matrix = load_signoff_matrix(&state);
        let security_triggers = load_security_triggers(&state);
        Self {
            state,
            dispatcher,
            telemetry,
            rater,
            signoff_matrix,
            security_triggers,
        }
    }

    /// Create (or seed) a run. When a router handoff is supplied its
    /// decision and accumulated costs ride along and the executor performs
    /// no routing of its own; otherwise the legacy semantic route applies.
    pub fn start_run(
        &self,
        workflow_path: &str,
        prompt: &str,
        session_id: &str,
        handoff: Option<RouterHandoff>,
    ) -> WorkflowResult<Run> {
        let mut metadata = BTreeMap::new();
        metadata.insert("session_id".to_string(), json!(session_id));

        let selected_workflow = match &handoff {
            Some(handoff) => {
                metadata.insert(
                    "routerHandoff".to_string(),
                    serde_json::to_value(handoff).unwrap_or(Value::Null),
                );
                metadata.insert("routing_method".to_string(), json!("router_handoff"));
                handoff.routing_decision.workflow.clone()
            }
            None => {
                metadata.insert("routing_method".to_string(), json!("semantic_routing"));
                semantic_route(prompt)
            }
        };

        let mut run = self
            .state
            .create_run(workflow_path, selected_workflow, metadata)?;

        if let Some(handoff) = &handoff {
            run.costs.merge(&handoff.accumulated_costs);
            self.state.save_run(&run)?;
            self.telemetry.merge_costs(session_id, &handoff.accumulated_costs);
        }
        Ok(run)
    }

    /// Drive a run from its current step to completion or to the first
    /// failed gate.
    pub async fn execute_run(
        &self,
        run_id: &str,
        spec: &WorkflowSpec,
        context: &WorkerContext,
    ) -> WorkflowResult<RunReport> {
        let run = self.state.load_run(run_id)?;
        if run.status == RunStatus::Created || run.status == RunStatus::Paused {
            self.state.set_status(run_id, RunStatus::InProgress)?;
        }
        let start_step = run.current_step;

        for step in spec.steps.iter().filter(|s| s.id >= start_step) {
            let report = self.execute_step(run_id, spec, step, context).await?;
            if let Some(report) = report {
                // Gate failure: the run is blocked until corrected.
                self.state.set_status(run_id, RunStatus::Paused)?;
                return Ok(report);
            }
            self.state.advance_step(run_id, step.id + 1)?;
        }

        self.state.set_status(run_id, RunStatus::Completed)?;
        Ok(RunReport {
            status: RunStatus::Completed,
            reason: format!("workflow {} completed", spec.name),
            run_id: run_id.to_string(),
            step_id: None,
            gate: None,
            remediation: None,
        })
    }

    /// Run one step. `Ok(None)` means the step passed; `Ok(Some(report))`
    /// carries the gate failure.
    async fn execute_step(
        &self,
        run_id: &str,
        spec: &WorkflowSpec,
        step: &WorkflowStep,
        context: &WorkerContext,
    ) -> WorkflowResult<Option<RunReport>> {
        if step.id == 0 {
            return self.execute_planning_step(run_id, spec, step, context).await;
        }

        // Security-trigger gate evaluates before dispatch: a matching step
        // must carry a security-capable agent.
        let description = format!("{}: {}", step.name, step.inputs.join(", "));
        if let Some(trigger) = self
            .security_triggers
            .iter()
            .find(|t| description.to_lowercase().contains(t.as_str()))
        {
            let covered = step.agents.iter().any(|a| a.contains("security"));
            let record = if covered {
                GateRecord::passed("security-triggers", step.id, format!("trigger '{}' covered", trigger))
            } else {
                GateRecord::failed(
                    "security-triggers",
                    step.id,
                    format!("trigger '{}' matched but no security agent assigned", trigger),
                )
            };
            let passed = record.passed;
            self.record_gate(run_id, step, record)?;
            if !passed {
                return Ok(Some(self.blocked_report(
                    run_id,
                    step,
                    "security-triggers",
                    "assign a security-capable agent to this step",
                )));
            }
        }

        // Dispatch every agent of the step concurrently; the barrier is the
        // step boundary.
        let inputs = self.collect_inputs(run_id, step)?;
        let dispatches = step.agents.iter().map(|agent| {
            let payload = step_task_payload(spec, step, agent, &inputs);
            let context = context.clone();
            async move {
                self.dispatcher
                    .dispatch(Some(run_id), &payload, context, step.id, 0.5)
                    .await
            }
        });
        let outcomes = join_all(dispatches).await;

        let mut skills_used: Vec<String> = Vec::new();
        for outcome in &outcomes {
            match outcome {
                DispatchOutcome::Blocked { reason } => {
                    let record = GateRecord::failed("dispatch", step.id, reason.clone());
                    self.record_gate(run_id, step, record)?;
                    return Ok(Some(self.blocked_report(
                        run_id,
                        step,
                        "dispatch",
                        "correct the task envelope and resume",
                    )));
                }
                DispatchOutcome::Executed { class, report, .. } => {
                    skills_used.extend(report.skills_used.iter().cloned());
                    if *class == OutcomeClass::Failed {
                        let reason = report
                            .errors
                            .first()
                            .cloned()
                            .unwrap_or_else(|| "agent result failed verification".to_string());
                        let record = GateRecord::failed("verification", step.id, reason);
                        self.record_gate(run_id, step, record)?;
                        return Ok(Some(self.blocked_report(
                            run_id,
                            step,
                            "verification",
                            "fix the failing agent output and resume",
                        )));
                    }
                }
            }
        }

        // Signoff gate: every configured signer must have a passed record.
        if let Some(required) = self.signoff_matrix.get(&step.name) {
            let gates = self.state.load_gates(run_id)?;
            let missing: Vec<&String> = required
                .iter()
                .filter(|signer| {
                    !gates
                        .iter()
                        .any(|g| g.passed && g.gate == format!("signoff-{}", signer))
                })
                .collect();
            let record = if missing.is_empty() {
                GateRecord::passed("signoffs", step.id, "all signers present")
            } else {
                GateRecord::failed(
                    "signoffs",
                    step.id,
                    format!("missing signoffs: {}", missing.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")),
                )
            };
            let passed = record.passed;
            self.record_gate(run_id, step, record)?;
            if !passed {
                return Ok(Some(self.blocked_report(
                    run_id,
                    step,
                    "signoffs",
                    "collect the missing signoffs and resume",
                )));
            }
        }

        // Skill-usage gate: the execution log must show each required
        // skill. Required skills are the step's declared inputs of the
        // form `skill:<name>`.
        let required_skills: Vec<&str> = step
            .inputs
            .iter()
            .filter_map(|i| i.strip_prefix("skill:"))
            .collect();
        if !required_skills.is_empty() {
            let missing: Vec<&&str> = required_skills
                .iter()
                .filter(|skill| !skills_used.iter().any(|used| used == **skill))
                .collect();
            let record = if missing.is_empty() {
                GateRecord::passed("skill-usage", step.id, "all required skills invoked")
            } else {
                GateRecord::failed(
                    "skill-usage",
                    step.id,
                    format!(
                        "skills never invoked: {}",
                        missing.iter().map(|s| **s).collect::<Vec<_>>().join(", ")
                    ),
                )
            };
            let passed = record.passed;
            self.record_gate(run_id, step, record)?;
            if !passed {
                return Ok(Some(self.blocked_report(
                    run_id,
                    step,
                    "skill-usage",
                    "ensure the agent invokes every required skill",
                )));
            }
        }

        Ok(None)
    }

    /// Step 0: produce a plan, rate it, and require the rating gate to
    /// pass within the attempt cap.
    async fn execute_planning_step(
        &self,
        run_id: &str,
        spec: &WorkflowSpec,
        step: &WorkflowStep,
        context: &WorkerContext,
    ) -> WorkflowResult<Option<RunReport>> {
        let inputs = self.collect_inputs(run_id, step)?;
        let planner = step.agents.first().cloned().unwrap_or_else(|| "planner".to_string());

        for attempt in 1..=MAX_RATING_ATTEMPTS {
            let mut payload = step_task_payload(spec, step, &planner, &inputs);
            if attempt > 1 {
                if let Some(description) = payload.get_mut("description") {
                    *description = json!(format!(
                        "{} (revision {}: previous plan was rated below the bar)",
                        description.as_str().unwrap_or_default(),
                        attempt
                    ));
                }
            }
            let outcome = self
                .dispatcher
                .dispatch(Some(run_id), &payload, context.clone(), step.id, 0.7)
                .await;

            let plan = match outcome {
                DispatchOutcome::Blocked { reason } => {
                    let record = GateRecord::failed("dispatch", step.id, reason);
                    self.record_gate(run_id, step, record)?;
                    return Ok(Some(self.blocked_report(
                        run_id,
                        step,
                        "dispatch",
                        "correct the planning task envelope",
                    )));
                }
                DispatchOutcome::Executed { worker, .. } => {
                    extract_plan(worker.output.as_deref().unwrap_or_default())
                }
            };

            let plan_id = format!("plan-{:02}", attempt);
            self.state.save_plan(run_id, &plan_id, &plan)?;

            let rating = self.rater.rate(&plan).await;
            self.state.save_plan_rating(
                run_id,
                &plan_id,
                &json!({ "rating": rating, "attempt": attempt }),
            )?;

            let passed = evaluate_gate_predicate(PLAN_RATING_PREDICATE, &[("rating", rating)])?;
            let record = if passed {
                GateRecord::passed(
                    "plan-rating",
                    step.id,
                    format!("plan rated {:.1}/10 on attempt {}", rating, attempt),
                )
            } else {
                GateRecord::failed(
                    "plan-rating",
                    step.id,
                    format!("plan rated {:.1}/10, below the bar", rating),
                )
            }
            .with_detail("rating", json!(rating))
            .with_detail("attempt", json!(attempt));
            self.record_gate(run_id, step, record)?;

            if passed {
                return Ok(None);
            }
            log::info!(
                "plan for run {} rated {:.1} on attempt {}/{}",
                run_id,
                rating,
                attempt,
                MAX_RATING_ATTEMPTS
            );
        }

        Ok(Some(self.blocked_report(
            run_id,
            step,
            "plan-rating",
            "revise the plan; three attempts were below the rating bar",
        )))
    }

    fn collect_inputs(&self, run_id: &str, step: &WorkflowStep) -> WorkflowResult<Vec<String>> {
        let artifacts = self.state.list_artifacts(run_id)?;
        Ok(step
            .inputs
            .iter()
            .filter(|input| !input.starts_with("skill:"))
            .map(|input| {
                artifacts
                    .iter()
                    .find(|a| a.path.ends_with(input.as_str()))
                    .map(|a| a.path.clone())
                    .unwrap_or_else(|| input.clone())
            })
            .collect())
    }

    fn record_gate(&self, run_id: &str, step: &WorkflowStep, record: GateRecord) -> WorkflowResult<()> {
        let index = (step.id as u32) * 10 + self.gate_ordinal(run_id, step.id);
        self.state.record_gate(run_id, index, &record)?;
        Ok(())
    }

    /// Next free gate slot within a step's decade of index numbers.
    fn gate_ordinal(&self, run_id: &str, step_id: u64) -> u32 {
        self.state
            .load_gates(run_id)
            .map(|gates| gates.iter().filter(|g| g.step == step_id).count() as u32)
            .unwrap_or(0)
    }

    fn blocked_report(
        &self,
        run_id: &str,
        step: &WorkflowStep,
        gate: &str,
        remediation: &str,
    ) -> RunReport {
        RunReport {
            status: RunStatus::Paused,
            reason: format!("gate {} failed at step {} ({})", gate, step.id, step.name),
            run_id: run_id.to_string(),
            step_id: Some(step.id),
            gate: Some(gate.to_string()),
            remediation: Some(remediation.to_string()),
        }
    }
}

/// Build the schema-complete delegation payload for one step agent.
fn step_task_payload(spec: &WorkflowSpec, step: &WorkflowStep, agent: &str, inputs: &[String]) -> Value {
    json!({
        "agent_type": agent,
        "description": format!("Workflow {} step {} ({})", spec.name, step.id, step.name),
        "assigned_skills": [],
        "required_artifacts": inputs,
        "output_artifacts": step.outputs,
        "execution_limits": {
            "max_turns": 25,
            "max_duration_ms": 600000,
            "max_cost_usd": 1.0,
            "timeout_action": "terminate"
        },
        "verification": {
            "must_produce": step.outputs,
            "must_not_error": false,
            "summary_required": true
        }
    })
}

/// The plan document is the agent's trailing JSON object; plain text plans
/// degrade to a wrapper object so rating still has something to score.
fn extract_plan(output: &str) -> Value {
    output
        .find('{')
        .and_then(|start| output.rfind('}').map(|end| (start, end)))
        .filter(|(start, end)| end > start)
        .and_then(|(start, end)| serde_json::from_str(&output[start..=end]).ok())
        .filter(|v: &Value| v.get("phases").is_some())
        .unwrap_or_else(|| json!({ "phases": [], "raw": output }))
}

/// The executor's own routing for legacy callers without a router
/// decision.
fn semantic_route(prompt: &str) -> Option<String> {
    let lowered = prompt.to_lowercase();
    let table = [
        (&["web", "frontend", "ui"][..], "workflows/web-app.yaml"),
        (&["deploy", "terraform", "cluster"][..], "workflows/infrastructure.yaml"),
        (&["analyze", "report", "metrics"][..], "workflows/analysis.yaml"),
        (&["security", "audit", "vulnerability"][..], "workflows/security-review.yaml"),
    ];
    for (keywords, workflow) in table {
        if keywords.iter().any(|kw| lowered.contains(kw)) {
            return Some(workflow.to_string());
        }
    }
    None
}

fn load_signoff_matrix(state: &Arc<StateStore>) -> BTreeMap<String, Vec<String>> {
    let Ok(path) = state.resolver().resolve_config("signoff-matrix", AccessMode::Read) else {
        return BTreeMap::new();
    };
    state
        .resolver()
        .safe_read_json(&path, "free")
        .ok()
        .flatten()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
}

fn load_security_triggers(state: &Arc<StateStore>) -> Vec<String> {
    let defaults: Vec<String> = crate::maestro::dispatch::DEFAULT_SECURITY_TRIGGERS
        .iter()
        .map(|t| t.to_string())
        .collect();
    let Ok(path) = state.resolver().resolve_config("security-triggers", AccessMode::Read) else {
        return defaults;
    };
    state
        .resolver()
        .safe_read_json(&path, "free")
        .ok()
        .flatten()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or(defaults)
}
