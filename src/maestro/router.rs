//! Router & Handoff
//!
//! The router is the cheap front door: every user prompt is classified by a
//! cheap-tier model, trivial prompts are answered directly, and complex ones
//! are handed off to the workflow executor together with the routing
//! decision and the costs accumulated so far. The executor must not
//! re-classify when a decision is present; the handoff envelope is the
//! contract that keeps the two stages from doing the same work twice.
//!
//! Classification failures are not fatal: the router falls back to a
//! handoff without a workflow choice, and the executor performs its own
//! semantic routing exactly as it would for a legacy caller.

use crate::maestro::client::{AgentClient, Message, Role};
use crate::maestro::paths::{AccessMode, PathResult, Resolver};
use crate::maestro::telemetry::{SessionCosts, Telemetry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Default complexity threshold above which a prompt is routed.
pub const ROUTING_THRESHOLD: f64 = 0.5;

/// Coarse complexity band reported by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComplexityBand {
    Low,
    Medium,
    High,
}

impl Default for ComplexityBand {
    fn default() -> Self {
        ComplexityBand::Low
    }
}

/// Stage-1 output of the cheap classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub intent: String,
    #[serde(default)]
    pub complexity: ComplexityBand,
    #[serde(default)]
    pub complexity_score: f64,
    #[serde(default)]
    pub should_route: bool,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cuj_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_provider: Option<String>,
}

/// Rolling metrics kept in the router session state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingMetrics {
    pub total: u64,
    pub simple_handled: u64,
    pub routed_to_orchestrator: u64,
    pub avg_complexity: f64,
    pub avg_confidence: f64,
}

impl RoutingMetrics {
    fn record(&mut self, decision: &RoutingDecision) {
        let n = self.total as f64;
        self.avg_complexity = (self.avg_complexity * n + decision.complexity_score) / (n + 1.0);
        self.avg_confidence = (self.avg_confidence * n + decision.confidence) / (n + 1.0);
        self.total += 1;
        if decision.should_route {
            self.routed_to_orchestrator += 1;
        } else {
            self.simple_handled += 1;
        }
    }
}

/// Persisted per-session router state (`runtime/sessions/<id>.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterSessionState {
    pub session_id: String,
    pub agent_role: String,
    #[serde(default)]
    pub read_count: u64,
    #[serde(default)]
    pub violations: Vec<String>,
    #[serde(default)]
    pub files_read: Vec<String>,
    pub model: String,
    #[serde(default)]
    pub model_history: Vec<String>,
    #[serde(default)]
    pub routing_decisions: RoutingMetrics,
    #[serde(default)]
    pub costs: SessionCosts,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The envelope carried into the run's metadata under `routerHandoff`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterHandoff {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "routerSessionId")]
    pub router_session_id: String,
    #[serde(rename = "routerModel")]
    pub router_model: String,
    #[serde(rename = "routingDecision")]
    pub routing_decision: RoutingDecision,
    #[serde(rename = "accumulatedCosts")]
    pub accumulated_costs: SessionCosts,
}

/// What the router did with a prompt.
#[derive(Debug, Clone)]
pub enum RouterOutcome {
    /// The prompt was simple; the router answered it directly.
    Handled { response: String },
    /// The prompt needs the workflow executor; carry this envelope.
    Handoff(RouterHandoff),
}

/// Intents that always demand a workflow, regardless of score.
const WORKFLOW_INTENTS: [&str; 5] = [
    "web_app",
    "infrastructure",
    "analysis",
    "cuj_execution",
    "security_review",
];

/// The two-stage router.
pub struct Router {
    client: Arc<dyn AgentClient>,
    resolver: Arc<Resolver>,
    telemetry: Arc<Telemetry>,
    threshold: f64,
    intent_map: BTreeMap<String, String>,
}

impl Router {
    pub fn new(client: Arc<dyn AgentClient>, resolver: Arc<Resolver>, telemetry: Arc<Telemetry>) -> Self {
        let intent_map = load_intent_map(&resolver);
        Self {
            client,
            resolver,
            telemetry,
            threshold: ROUTING_THRESHOLD,
            intent_map,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    /// The data-driven intent → workflow map the router consults.
    pub fn intent_map(&self) -> &BTreeMap<String, String> {
        &self.intent_map
    }

    /// Stage 1: classify a prompt with the cheap model.
    ///
    /// The model is asked for a JSON decision; malformed output degrades to
    /// a route-everything fallback so the executor's own routing takes
    /// over.
    pub async fn classify(&self, session_id: &str, prompt: &str) -> RoutingDecision {
        let request = [
            Message::new(
                Role::System,
                "Classify the user's request. Respond with JSON only: \
                 {\"intent\", \"complexity\" (low|medium|high), \"complexity_score\" (0..1), \
                 \"should_route\", \"confidence\" (0..1), \"reasoning\", \"workflow\"?, \
                 \"cuj_id\"?, \"cloud_provider\"?}.",
            ),
            Message::new(Role::User, prompt),
        ];
        let reply = match self.client.invoke(&request).await {
            Ok(reply) => reply,
            Err(err) => {
                log::warn!("classification call failed, deferring to executor routing: {}", err);
                return fallback_decision(&format!("classifier error: {}", err));
            }
        };
        if let Some(usage) = reply.usage {
            self.telemetry
                .record_cost(session_id, self.client.model_name(), usage);
        }
        let mut decision = match parse_decision(&reply.content) {
            Some(decision) => decision,
            None => {
                log::warn!("classifier returned no parseable decision, deferring to executor");
                return fallback_decision("unparseable classifier output");
            }
        };
        self.finalize_decision(&mut decision);
        decision
    }

    /// Apply the threshold rules and the intent registry on top of the raw
    /// classifier output.
    fn finalize_decision(&self, decision: &mut RoutingDecision) {
        if decision.complexity == ComplexityBand::High
            || decision.complexity_score > self.threshold
            || WORKFLOW_INTENTS.contains(&decision.intent.as_str())
        {
            decision.should_route = true;
        }
        if decision.should_route && decision.workflow.is_none() {
            decision.workflow = self.intent_map.get(&decision.intent).cloned();
        }
    }

    /// Run the full two-stage flow for one prompt.
    pub async fn handle(&self, session_id: &str, prompt: &str) -> PathResult<RouterOutcome> {
        let mut state = self.load_or_init_session(session_id)?;
        let decision = self.classify(session_id, prompt).await;
        state.routing_decisions.record(&decision);
        state.costs = self.telemetry.session_costs(session_id);
        state.updated_at = Utc::now();

        let outcome = if decision.should_route {
            RouterOutcome::Handoff(RouterHandoff {
                timestamp: Utc::now(),
                router_session_id: session_id.to_string(),
                router_model: self.client.model_name().to_string(),
                routing_decision: decision,
                accumulated_costs: state.costs.clone(),
            })
        } else {
            // Stage 1 said simple: answer directly with the cheap model.
            let request = [Message::new(Role::User, prompt)];
            match self.client.invoke(&request).await {
                Ok(reply) => {
                    if let Some(usage) = reply.usage {
                        self.telemetry
                            .record_cost(session_id, self.client.model_name(), usage);
                        state.costs = self.telemetry.session_costs(session_id);
                    }
                    RouterOutcome::Handled {
                        response: reply.content,
                    }
                }
                Err(err) => {
                    // Even the direct path failed; let the executor try.
                    log::warn!("direct answer failed, handing off: {}", err);
                    RouterOutcome::Handoff(RouterHandoff {
                        timestamp: Utc::now(),
                        router_session_id: session_id.to_string(),
                        router_model: self.client.model_name().to_string(),
                        routing_decision: fallback_decision(&err.to_string()),
                        accumulated_costs: state.costs.clone(),
                    })
                }
            }
        };

        self.save_session(&state)?;
        Ok(outcome)
    }

    /// Initialize (or reset) the session state for a new prompt cycle.
    pub fn init_session(&self, session_id: &str, agent_role: &str) -> PathResult<RouterSessionState> {
        let now = Utc::now();
        let state = RouterSessionState {
            session_id: session_id.to_string(),
            agent_role: agent_role.to_string(),
            read_count: 0,
            violations: Vec::new(),
            files_read: Vec::new(),
            model: self.client.model_name().to_string(),
            model_history: vec![self.client.model_name().to_string()],
            routing_decisions: RoutingMetrics::default(),
            costs: SessionCosts::default(),
            created_at: now,
            updated_at: now,
        };
        self.save_session(&state)?;
        Ok(state)
    }

    pub fn load_session(&self, session_id: &str) -> PathResult<Option<RouterSessionState>> {
        let path = self.session_path(session_id, AccessMode::Read)?;
        let Some(value) = self.resolver.safe_read_json(&path, "router-state")? else {
            return Ok(None);
        };
        Ok(serde_json::from_value(value).ok())
    }

    fn load_or_init_session(&self, session_id: &str) -> PathResult<RouterSessionState> {
        match self.load_session(session_id)? {
            Some(state) => Ok(state),
            None => self.init_session(session_id, "router"),
        }
    }

    pub fn save_session(&self, state: &RouterSessionState) -> PathResult<()> {
        let path = self.session_path(&state.session_id, AccessMode::Write)?;
        let value = serde_json::to_value(state)
            .unwrap_or_else(|_| json!({"session_id": state.session_id}));
        self.resolver.atomic_write_json(&path, &value)
    }

    fn session_path(&self, session_id: &str, mode: AccessMode) -> PathResult<std::path::PathBuf> {
        self.resolver
            .resolve_runtime(&format!("sessions/{}.json", session_id), mode)
    }

    /// The routing metrics block for a session, as the CLI reports it.
    pub fn routing_metrics(&self, session_id: &str) -> PathResult<Option<RoutingMetrics>> {
        Ok(self.load_session(session_id)?.map(|s| s.routing_decisions))
    }
}

/// Write a fresh session state without needing a live router (used by the
/// CLI `state init`/`state reset` commands).
pub fn init_session_state(
    resolver: &Resolver,
    session_id: &str,
    agent_role: &str,
    model: &str,
) -> PathResult<RouterSessionState> {
    let now = Utc::now();
    let state = RouterSessionState {
        session_id: session_id.to_string(),
        agent_role: agent_role.to_string(),
        read_count: 0,
        violations: Vec::new(),
        files_read: Vec::new(),
        model: model.to_string(),
        model_history: vec![model.to_string()],
        routing_decisions: RoutingMetrics::default(),
        costs: SessionCosts::default(),
        created_at: now,
        updated_at: now,
    };
    let path = resolver.resolve_runtime(&format!("sessions/{}.json", session_id), AccessMode::Write)?;
    let value = serde_json::to_value(&state).unwrap_or_else(|_| json!({"session_id": session_id}));
    resolver.atomic_write_json(&path, &value)?;
    Ok(state)
}

/// Load a session state directly from disk (CLI read paths).
pub fn load_session_state(
    resolver: &Resolver,
    session_id: &str,
) -> PathResult<Option<RouterSessionState>> {
    let path = resolver.resolve_runtime(&format!("sessions/{}.json", session_id), AccessMode::Read)?;
    let Some(value) = resolver.safe_read_json(&path, "router-state")? else {
        return Ok(None);
    };
    Ok(serde_json::from_value(value).ok())
}

/// Recording hook for `UserPromptSubmit`: resets the per-prompt counters
/// (read count, violations, file list) in the router session state while
/// keeping costs and routing metrics. Fails open.
pub struct PromptResetHook {
    resolver: Arc<Resolver>,
}

impl PromptResetHook {
    pub fn new(resolver: Arc<Resolver>) -> Self {
        Self { resolver }
    }
}

#[async_trait::async_trait]
impl crate::maestro::hooks::Hook for PromptResetHook {
    fn name(&self) -> &str {
        "router-state-reset"
    }

    async fn run(
        &self,
        envelope: &crate::maestro::hooks::HookEnvelope,
    ) -> crate::maestro::hooks::HookResult<crate::maestro::hooks::HookDecision> {
        let session_id = envelope
            .context
            .get("session_id")
            .and_then(|s| s.as_str())
            .ok_or("prompt-submit hook invoked without a session id")?;
        if let Some(mut state) = load_session_state(&self.resolver, session_id)? {
            state.read_count = 0;
            state.violations.clear();
            state.files_read.clear();
            state.updated_at = Utc::now();
            let path = self
                .resolver
                .resolve_runtime(&format!("sessions/{}.json", session_id), AccessMode::Write)?;
            let value =
                serde_json::to_value(&state).unwrap_or_else(|_| json!({"session_id": session_id}));
            self.resolver.atomic_write_json(&path, &value)?;
        }
        Ok(crate::maestro::hooks::HookDecision::allow())
    }
}

/// A decision that defers everything to the executor's built-in routing.
fn fallback_decision(reason: &str) -> RoutingDecision {
    RoutingDecision {
        intent: "unknown".to_string(),
        complexity: ComplexityBand::High,
        complexity_score: 1.0,
        should_route: true,
        confidence: 0.0,
        reasoning: format!("fallback: {}", reason),
        workflow: None,
        cuj_id: None,
        cloud_provider: None,
    }
}

/// Extract the first JSON object from model output and deserialize it.
fn parse_decision(content: &str) -> Option<RoutingDecision> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&content[start..=end]).ok()
}

/// The intent → workflow registry. Loaded from the `cuj-registry` config
/// file when present, with built-in defaults otherwise.
fn load_intent_map(resolver: &Arc<Resolver>) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    map.insert("web_app".to_string(), "workflows/web-app.yaml".to_string());
    map.insert(
        "infrastructure".to_string(),
        "workflows/infrastructure.yaml".to_string(),
    );
    map.insert("analysis".to_string(), "workflows/analysis.yaml".to_string());
    map.insert(
        "cuj_execution".to_string(),
        "workflows/cuj-execution.yaml".to_string(),
    );
    map.insert(
        "security_review".to_string(),
        "workflows/security-review.yaml".to_string(),
    );

    let loaded = resolver
        .resolve_config("cuj-registry", AccessMode::Read)
        .ok()
        .and_then(|path| resolver.safe_read_json(&path, "free").ok().flatten());
    if let Some(Value::Object(entries)) = loaded {
        for (intent, workflow) in entries {
            if let Value::String(workflow) = workflow {
                map.insert(intent, workflow);
            }
        }
    }
    map
}
