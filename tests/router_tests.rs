use async_trait::async_trait;
use maestro::maestro::client::{AgentClient, AgentReply, ClientResult, FinishReason, Message, Usage};
use maestro::maestro::paths::Resolver;
use maestro::maestro::router::{Router, RouterOutcome};
use maestro::maestro::telemetry::Telemetry;
use std::sync::Arc;
use tempfile::TempDir;

struct ClassifierClient {
    response: String,
    usage: Usage,
}

#[async_trait]
impl AgentClient for ClassifierClient {
    async fn invoke(&self, _messages: &[Message]) -> ClientResult<AgentReply> {
        Ok(AgentReply {
            content: self.response.clone(),
            tool_calls: vec![],
            usage: Some(self.usage),
            finish_reason: FinishReason::Stop,
        })
    }

    fn model_name(&self) -> &str {
        "haiku-fast"
    }
}

fn setup(response: &str) -> (TempDir, Router, Arc<Telemetry>) {
    let dir = TempDir::new().unwrap();
    let resolver = Arc::new(Resolver::new(dir.path()));
    let telemetry = Telemetry::disabled();
    let client = Arc::new(ClassifierClient {
        response: response.to_string(),
        usage: Usage {
            input_tokens: 200,
            output_tokens: 80,
        },
    });
    let router = Router::new(client, resolver, Arc::clone(&telemetry));
    (dir, router, telemetry)
}

#[tokio::test]
async fn test_high_complexity_prompt_hands_off_with_decision_and_costs() {
    let (_dir, router, telemetry) = setup(
        r#"{"intent": "web_app", "complexity": "high", "complexity_score": 0.9,
            "should_route": true, "confidence": 0.95, "reasoning": "multi-component build"}"#,
    );

    let outcome = router.handle("sess-1", "build me a web app").await.unwrap();
    let RouterOutcome::Handoff(handoff) = outcome else {
        panic!("expected a handoff");
    };

    assert_eq!(handoff.routing_decision.intent, "web_app");
    assert!(handoff.routing_decision.should_route);
    // The intent registry filled the workflow in.
    assert_eq!(
        handoff.routing_decision.workflow.as_deref(),
        Some("workflows/web-app.yaml")
    );
    assert_eq!(handoff.router_model, "haiku-fast");

    // The classifier call was priced and carried into the handoff.
    assert!(handoff.accumulated_costs.total_usd > 0.0);
    let session_costs = telemetry.session_costs("sess-1");
    assert_eq!(session_costs.total_usd, handoff.accumulated_costs.total_usd);

    // Session state was persisted with the decision counted.
    let state = router.load_session("sess-1").unwrap().unwrap();
    assert_eq!(state.routing_decisions.total, 1);
    assert_eq!(state.routing_decisions.routed_to_orchestrator, 1);
}

#[tokio::test]
async fn test_simple_prompt_is_answered_directly() {
    let (_dir, router, _telemetry) = setup(
        r#"{"intent": "question", "complexity": "low", "complexity_score": 0.1,
            "should_route": false, "confidence": 0.9, "reasoning": "one-liner"}"#,
    );

    let outcome = router.handle("sess-2", "what does this regex do").await.unwrap();
    let RouterOutcome::Handled { response } = outcome else {
        panic!("expected direct handling");
    };
    assert!(response.contains("intent"));

    let state = router.load_session("sess-2").unwrap().unwrap();
    assert_eq!(state.routing_decisions.simple_handled, 1);
    // Two cheap-model calls: classify plus the direct answer.
    assert_eq!(state.costs.model_usage.len(), 2);
}

#[tokio::test]
async fn test_unparseable_classifier_output_falls_back_to_routing() {
    let (_dir, router, _telemetry) = setup("I cannot answer in JSON today.");

    let decision = router.classify("sess-3", "do something").await;
    assert!(decision.should_route);
    assert!(decision.workflow.is_none());
    assert!(decision.reasoning.contains("fallback"));
}

#[tokio::test]
async fn test_workflow_intents_route_even_at_low_scores() {
    let (_dir, router, _telemetry) = setup(
        r#"{"intent": "infrastructure", "complexity": "low", "complexity_score": 0.2,
            "should_route": false, "confidence": 0.8, "reasoning": "small tf change"}"#,
    );
    let decision = router.classify("sess-4", "tweak the terraform").await;
    assert!(decision.should_route, "known workflow intents always route");
    assert_eq!(
        decision.workflow.as_deref(),
        Some("workflows/infrastructure.yaml")
    );
}

#[tokio::test]
async fn test_prompt_submit_resets_per_prompt_counters() {
    use maestro::maestro::hooks::{Hook, HookEnvelope, HookEvent};
    use maestro::maestro::router::PromptResetHook;

    let (dir, router, _telemetry) = setup("{}");
    let mut state = router.init_session("sess-reset", "router").unwrap();
    state.read_count = 7;
    state.violations.push("read outside project".to_string());
    state.files_read.push("src/lib.rs".to_string());
    router.save_session(&state).unwrap();

    let hook = PromptResetHook::new(Arc::new(Resolver::new(dir.path())));
    let envelope = HookEnvelope::for_event(HookEvent::UserPromptSubmit)
        .with_context("session_id", serde_json::json!("sess-reset"));
    hook.run(&envelope).await.unwrap();

    let reset = router.load_session("sess-reset").unwrap().unwrap();
    assert_eq!(reset.read_count, 0);
    assert!(reset.violations.is_empty());
    assert!(reset.files_read.is_empty());
    // The model history and metrics survive the reset.
    assert_eq!(reset.model, "haiku-fast");
}

#[tokio::test]
async fn test_avg_metrics_accumulate_across_decisions() {
    let (_dir, router, _telemetry) = setup(
        r#"{"intent": "analysis", "complexity": "high", "complexity_score": 0.8,
            "should_route": true, "confidence": 0.5, "reasoning": "deep dive"}"#,
    );
    router.handle("sess-5", "analyze the logs").await.unwrap();
    router.handle("sess-5", "analyze the metrics").await.unwrap();

    let metrics = router.routing_metrics("sess-5").unwrap().unwrap();
    assert_eq!(metrics.total, 2);
    assert!((metrics.avg_complexity - 0.8).abs() < 1e-9);
    assert!((metrics.avg_confidence - 0.5).abs() < 1e-9);
}
