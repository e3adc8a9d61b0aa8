use async_trait::async_trait;
use maestro::maestro::client::{AgentClient, AgentReply, ClientResult, Message};
use maestro::maestro::config::RuntimeConfig;
use maestro::maestro::dispatch::{Dispatcher, TemplateEnforcementHook};
use maestro::maestro::hooks::{HookEvent, HookPipeline};
use maestro::maestro::knowledge::KnowledgeIndex;
use maestro::maestro::paths::Resolver;
use maestro::maestro::router::{ComplexityBand, RouterHandoff, RoutingDecision};
use maestro::maestro::state::{RunStatus, StateStore};
use maestro::maestro::supervisor::{EchoToolExecutor, Supervisor, WorkerContext};
use maestro::maestro::telemetry::{ModelCost, SessionCosts, Telemetry};
use maestro::maestro::workflow::{
    evaluate_gate_predicate, PlanRater, RunReport, WorkflowExecutor, WorkflowSpec,
};
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

struct PlannerClient;

#[async_trait]
impl AgentClient for PlannerClient {
    async fn invoke(&self, _messages: &[Message]) -> ClientResult<AgentReply> {
        Ok(AgentReply::text(
            r#"{"completed": true, "artifacts": [], "errors": [], "summary": "planned",
                "phases": ["discover", "build", "verify"]}"#,
        ))
    }

    fn model_name(&self) -> &str {
        "opus-deep"
    }
}

struct ScriptedRater {
    ratings: Mutex<VecDeque<f64>>,
    fallback: f64,
}

#[async_trait]
impl PlanRater for ScriptedRater {
    async fn rate(&self, _plan: &Value) -> f64 {
        self.ratings.lock().unwrap().pop_front().unwrap_or(self.fallback)
    }
}

struct Rig {
    _dir: TempDir,
    executor: WorkflowExecutor,
    state: Arc<StateStore>,
}

fn rig(ratings: Vec<f64>, fallback: f64) -> Rig {
    let dir = TempDir::new().unwrap();
    let resolver = Arc::new(Resolver::new(dir.path()));
    let state = Arc::new(StateStore::new(Arc::clone(&resolver)));
    let telemetry = Telemetry::disabled();
    let supervisor = Arc::new(Supervisor::new(
        RuntimeConfig::default(),
        Arc::clone(&resolver),
        Arc::clone(&telemetry),
    ));
    let knowledge = Arc::new(KnowledgeIndex::open(dir.path().join("index.csv")));
    let mut pipeline = HookPipeline::new(RuntimeConfig::default()).with_audit(Arc::clone(&state));
    pipeline
        .register(
            HookEvent::PreToolUse,
            vec!["task-delegation".to_string()],
            Arc::new(TemplateEnforcementHook),
        )
        .unwrap();
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(pipeline),
        supervisor,
        knowledge,
        Arc::clone(&state),
    ));
    let rater = Arc::new(ScriptedRater {
        ratings: Mutex::new(ratings.into()),
        fallback,
    });
    let executor = WorkflowExecutor::new(Arc::clone(&state), dispatcher, telemetry, rater);
    Rig {
        _dir: dir,
        executor,
        state,
    }
}

fn context() -> WorkerContext {
    WorkerContext {
        client: Arc::new(PlannerClient),
        pipeline: None,
        tools: Arc::new(EchoToolExecutor),
    }
}

fn two_step_spec() -> WorkflowSpec {
    WorkflowSpec::from_value(&json!({
        "name": "web-app",
        "steps": [
            {"id": 0, "name": "planning", "agents": ["planner"]},
            {"id": 1, "name": "build", "agents": ["builder"]}
        ]
    }))
    .unwrap()
}

fn handoff(total_usd: f64) -> RouterHandoff {
    let mut costs = SessionCosts::default();
    costs.per_model.insert(
        "haiku-fast".to_string(),
        ModelCost {
            input_tokens: 400,
            output_tokens: 50,
            cost_usd: total_usd,
        },
    );
    costs.total_usd = total_usd;
    RouterHandoff {
        timestamp: Utc::now(),
        router_session_id: "sess-router".to_string(),
        router_model: "haiku-fast".to_string(),
        routing_decision: RoutingDecision {
            intent: "web_app".to_string(),
            complexity: ComplexityBand::High,
            complexity_score: 0.9,
            should_route: true,
            confidence: 0.95,
            reasoning: "full build".to_string(),
            workflow: Some("workflows/web-app.yaml".to_string()),
            cuj_id: None,
            cloud_provider: None,
        },
        accumulated_costs: costs,
    }
}

#[tokio::test]
async fn test_plan_rated_below_bar_then_revised_above_it() {
    // First attempt rates 6.2, the revision rates 8.0.
    let rig = rig(vec![6.2, 8.0], 8.0);
    let run = rig
        .executor
        .start_run("workflows/web-app.yaml", "build it", "sess-a", None)
        .unwrap();

    let report = rig
        .executor
        .execute_run(&run.id, &two_step_spec(), &context())
        .await
        .unwrap();
    assert_eq!(report.status, RunStatus::Completed);

    let gates = rig.state.load_gates(&run.id).unwrap();
    let ratings: Vec<(bool, f64)> = gates
        .iter()
        .filter(|g| g.gate == "plan-rating")
        .map(|g| (g.passed, g.details["rating"].as_f64().unwrap()))
        .collect();
    assert_eq!(ratings, vec![(false, 6.2), (true, 8.0)]);

    // Both plans and both ratings were persisted.
    let run_record = rig.state.load_run(&run.id).unwrap();
    assert_eq!(run_record.current_step, 2);
}

#[tokio::test]
async fn test_three_low_ratings_block_the_run() {
    let rig = rig(vec![6.0, 5.5, 6.5], 6.0);
    let run = rig
        .executor
        .start_run("workflows/web-app.yaml", "build it", "sess-b", None)
        .unwrap();

    let report: RunReport = rig
        .executor
        .execute_run(&run.id, &two_step_spec(), &context())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Paused);
    assert_eq!(report.gate.as_deref(), Some("plan-rating"));
    assert_eq!(report.step_id, Some(0));
    assert!(report.remediation.is_some());

    // The workflow did not advance.
    let run_record = rig.state.load_run(&run.id).unwrap();
    assert_eq!(run_record.current_step, 0);
    assert_eq!(run_record.status, RunStatus::Paused);

    // Three failed rating gates are on record.
    let gates = rig.state.load_gates(&run.id).unwrap();
    assert_eq!(gates.iter().filter(|g| g.gate == "plan-rating" && !g.passed).count(), 3);
}

#[tokio::test]
async fn test_router_handoff_costs_aggregate_and_executor_skips_classification() {
    let rig = rig(vec![], 8.0);
    let run = rig
        .executor
        .start_run(
            "workflows/web-app.yaml",
            "build me a web app",
            "sess-c",
            Some(handoff(0.00045)),
        )
        .unwrap();

    // The handoff rode into the run untouched.
    assert_eq!(run.metadata["routing_method"], json!("router_handoff"));
    assert!(run.metadata.contains_key("routerHandoff"));
    assert_eq!(run.selected_workflow.as_deref(), Some("workflows/web-app.yaml"));
    assert!((run.costs.total_usd - 0.00045).abs() < 1e-12);

    // Executor-side spend joins the same accumulator; the total stays
    // sum-consistent.
    let mut run_record = rig.state.load_run(&run.id).unwrap();
    let mut executor_costs = SessionCosts::default();
    executor_costs.per_model.insert(
        "opus-deep".to_string(),
        ModelCost {
            input_tokens: 50,
            output_tokens: 10,
            cost_usd: 0.0012,
        },
    );
    executor_costs.total_usd = 0.0012;
    run_record.costs.merge(&executor_costs);
    rig.state.save_run(&run_record).unwrap();

    let reloaded = rig.state.load_run(&run.id).unwrap();
    assert!((reloaded.costs.total_usd - 0.00165).abs() < 1e-12);
    let sum: f64 = reloaded.costs.per_model.values().map(|c| c.cost_usd).sum();
    assert!((reloaded.costs.total_usd - sum).abs() < 1e-12);
}

#[tokio::test]
async fn test_legacy_callers_get_semantic_routing() {
    let rig = rig(vec![], 8.0);
    let run = rig
        .executor
        .start_run("workflows/auto.yaml", "audit this for security holes", "sess-d", None)
        .unwrap();
    assert_eq!(run.metadata["routing_method"], json!("semantic_routing"));
    assert_eq!(
        run.selected_workflow.as_deref(),
        Some("workflows/security-review.yaml")
    );
}

#[tokio::test]
async fn test_security_trigger_gate_blocks_uncovered_step() {
    let rig = rig(vec![8.0], 8.0);
    let spec = WorkflowSpec::from_value(&json!({
        "name": "hardening",
        "steps": [
            {"id": 0, "name": "planning", "agents": ["planner"]},
            {"id": 1, "name": "auth hardening", "agents": ["builder"]}
        ]
    }))
    .unwrap();
    let run = rig
        .executor
        .start_run("workflows/hardening.yaml", "harden auth", "sess-e", None)
        .unwrap();

    let report = rig
        .executor
        .execute_run(&run.id, &spec, &context())
        .await
        .unwrap();
    assert_eq!(report.status, RunStatus::Paused);
    assert_eq!(report.gate.as_deref(), Some("security-triggers"));

    // The same step with a security agent assigned passes the gate.
    let spec = WorkflowSpec::from_value(&json!({
        "name": "hardening",
        "steps": [
            {"id": 0, "name": "planning", "agents": ["planner"]},
            {"id": 1, "name": "auth hardening", "agents": ["builder", "security-architect"]}
        ]
    }))
    .unwrap();
    let run = rig
        .executor
        .start_run("workflows/hardening.yaml", "harden auth", "sess-f", None)
        .unwrap();
    let report = rig
        .executor
        .execute_run(&run.id, &spec, &context())
        .await
        .unwrap();
    assert_eq!(report.status, RunStatus::Completed);
}

#[test]
fn test_gate_predicates_evaluate_against_bindings() {
    assert!(evaluate_gate_predicate("rating >= 7.0", &[("rating", 8.0)]).unwrap());
    assert!(!evaluate_gate_predicate("rating >= 7.0", &[("rating", 6.2)]).unwrap());
    assert!(evaluate_gate_predicate(
        "rating >= 7.0 && attempts <= 3.0",
        &[("rating", 7.5), ("attempts", 2.0)]
    )
    .unwrap());
    assert!(evaluate_gate_predicate("nonsense >", &[]).is_err());
}

#[test]
fn test_workflow_spec_validation() {
    assert!(WorkflowSpec::from_value(&json!({"name": "x", "steps": []})).is_err());
    assert!(WorkflowSpec::from_value(&json!({
        "name": "x",
        "steps": [{"id": 1, "name": "not-planning-first", "agents": ["a"]}]
    }))
    .is_err());
    assert!(WorkflowSpec::from_value(&json!({
        "name": "x",
        "steps": [{"id": 0, "name": "planning", "agents": []}]
    }))
    .is_err());
}
