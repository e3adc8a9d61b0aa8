use async_trait::async_trait;
use maestro::maestro::client::{AgentClient, AgentReply, ClientResult, Message};
use maestro::maestro::config::RuntimeConfig;
use maestro::maestro::dispatch::{
    classify_outcome, parse_response_sections, validate_task_input, DispatchOutcome, Dispatcher,
    OutcomeClass, SecurityTriggerHook, TemplateEnforcementHook, VerificationSpec,
    TEMPLATE_VIOLATION,
};
use maestro::maestro::hooks::{HookEvent, HookPipeline};
use maestro::maestro::knowledge::KnowledgeIndex;
use maestro::maestro::paths::Resolver;
use maestro::maestro::state::StateStore;
use maestro::maestro::supervisor::{EchoToolExecutor, Supervisor, WorkerContext};
use maestro::maestro::telemetry::Telemetry;
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

struct FixedClient {
    response: String,
}

#[async_trait]
impl AgentClient for FixedClient {
    async fn invoke(&self, _messages: &[Message]) -> ClientResult<AgentReply> {
        Ok(AgentReply::text(self.response.clone()))
    }

    fn model_name(&self) -> &str {
        "sonnet-core"
    }
}

struct Rig {
    _dir: TempDir,
    dispatcher: Dispatcher,
    supervisor: Arc<Supervisor>,
    state: Arc<StateStore>,
}

fn rig(with_security_hook: bool) -> Rig {
    let dir = TempDir::new().unwrap();
    let resolver = Arc::new(Resolver::new(dir.path()));
    let state = Arc::new(StateStore::new(Arc::clone(&resolver)));
    let supervisor = Arc::new(Supervisor::new(
        RuntimeConfig::default().with_use_workers(true),
        Arc::clone(&resolver),
        Telemetry::disabled(),
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
    if with_security_hook {
        pipeline
            .register(
                HookEvent::PreToolUse,
                vec!["task-delegation".to_string()],
                Arc::new(SecurityTriggerHook::default()),
            )
            .unwrap();
    }

    let dispatcher = Dispatcher::new(
        Arc::new(pipeline),
        Arc::clone(&supervisor),
        knowledge,
        Arc::clone(&state),
    );
    Rig {
        _dir: dir,
        dispatcher,
        supervisor,
        state,
    }
}

fn context(response: &str) -> WorkerContext {
    WorkerContext {
        client: Arc::new(FixedClient {
            response: response.to_string(),
        }),
        pipeline: None,
        tools: Arc::new(EchoToolExecutor),
    }
}

fn valid_task() -> serde_json::Value {
    json!({
        "agent_type": "backend-engineer",
        "description": "implement the session store",
        "assigned_skills": ["rust"],
        "output_artifacts": [],
        "execution_limits": {
            "max_turns": 5,
            "max_duration_ms": 60000,
            "max_cost_usd": 0.5,
            "timeout_action": "terminate"
        },
        "verification": {
            "must_produce": [],
            "must_not_error": true,
            "summary_required": true
        }
    })
}

#[tokio::test]
async fn test_freeform_delegation_is_blocked_before_any_worker_spawns() {
    let rig = rig(false);
    let freeform = json!({"prompt": "implement the login feature"});

    let outcome = rig
        .dispatcher
        .dispatch(None, &freeform, context("ignored"), 0, 0.5)
        .await;

    let DispatchOutcome::Blocked { reason } = outcome else {
        panic!("freeform delegation must be blocked");
    };
    assert!(reason.contains(TEMPLATE_VIOLATION), "got: {}", reason);
    assert!(reason.contains("agent_type"));

    // No worker was spawned.
    assert!(rig.supervisor.sessions().is_empty());

    // The block was audited.
    let records = rig.state.read_audit().unwrap();
    assert!(records
        .iter()
        .any(|r| r.decision == "block" && r.hook.as_deref() == Some("template-enforcer")));
}

#[tokio::test]
async fn test_valid_task_executes_and_verifies_success() {
    let rig = rig(false);
    let response =
        r#"{"completed": true, "artifacts": [], "errors": [], "summary": "store implemented"}"#;

    let outcome = rig
        .dispatcher
        .dispatch(None, &valid_task(), context(response), 1, 0.5)
        .await;

    let DispatchOutcome::Executed { class, report, worker } = outcome else {
        panic!("expected execution");
    };
    assert_eq!(class, OutcomeClass::Success);
    assert_eq!(report.summary.as_deref(), Some("store implemented"));
    assert_eq!(worker.turns_used, 1);
}

#[tokio::test]
async fn test_missing_summary_fails_despite_apparent_success() {
    let rig = rig(false);
    let response = r#"{"completed": true, "artifacts": [], "errors": []}"#;

    let outcome = rig
        .dispatcher
        .dispatch(None, &valid_task(), context(response), 1, 0.5)
        .await;

    let DispatchOutcome::Executed { class, .. } = outcome else {
        panic!("expected execution");
    };
    assert_eq!(class, OutcomeClass::Failed);
}

#[tokio::test]
async fn test_security_trigger_requires_security_capable_agent() {
    let rig = rig(true);
    let mut task = valid_task();
    task["description"] = json!("update the auth token rotation");

    let outcome = rig
        .dispatcher
        .dispatch(None, &task, context("ignored"), 1, 0.5)
        .await;
    assert!(matches!(outcome, DispatchOutcome::Blocked { .. }));

    // Same task assigned to a security agent passes the trigger.
    task["agent_type"] = json!("security-architect");
    let response = r#"{"completed": true, "artifacts": [], "errors": [], "summary": "rotated"}"#;
    let outcome = rig
        .dispatcher
        .dispatch(None, &task, context(response), 1, 0.5)
        .await;
    assert!(matches!(
        outcome,
        DispatchOutcome::Executed {
            class: OutcomeClass::Success,
            ..
        }
    ));
}

#[test]
fn test_validate_task_input_lists_every_missing_key() {
    let err = validate_task_input(&json!({"agent_type": "x"})).unwrap_err();
    for key in ["description", "assigned_skills", "output_artifacts", "execution_limits", "verification"] {
        assert!(err.contains(key), "{} missing from: {}", key, err);
    }

    let err = validate_task_input(&json!({
        "agent_type": "x",
        "description": "y",
        "assigned_skills": [],
        "output_artifacts": [],
        "execution_limits": {"max_turns": 1},
        "verification": {"must_produce": []}
    }))
    .unwrap_err();
    assert!(err.contains("execution_limits.max_duration_ms"));
    assert!(err.contains("verification.summary_required"));
}

#[test]
fn test_classification_rubric_predicates() {
    let spec = VerificationSpec {
        must_produce: vec!["report.json".to_string()],
        must_not_error: true,
        summary_required: true,
    };

    // Missing must-produce artifact: failed.
    let mut report = parse_response_sections(
        r#"{"completed": true, "artifacts": [], "errors": [], "summary": "ok"}"#,
    );
    report.missing_artifacts.push("report.json".to_string());
    assert_eq!(classify_outcome(&spec, &report), OutcomeClass::Failed);

    // Errors under must_not_error: failed.
    let report = parse_response_sections(
        r#"{"completed": true, "artifacts": [], "errors": ["boom"], "summary": "ok"}"#,
    );
    assert_eq!(classify_outcome(&spec, &report), OutcomeClass::Failed);

    // Non-fatal errors without must_not_error: partial.
    let relaxed = VerificationSpec {
        must_produce: vec![],
        must_not_error: false,
        summary_required: true,
    };
    let report = parse_response_sections(
        r#"{"completed": true, "artifacts": [], "errors": ["flaky test"], "summary": "ok"}"#,
    );
    assert_eq!(classify_outcome(&relaxed, &report), OutcomeClass::Partial);

    // Clean run: success.
    let report = parse_response_sections(
        r#"{"completed": true, "artifacts": ["report.json"], "errors": [], "summary": "ok"}"#,
    );
    assert_eq!(classify_outcome(&relaxed, &report), OutcomeClass::Success);
}
