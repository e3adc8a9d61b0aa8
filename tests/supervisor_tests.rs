use async_trait::async_trait;
use maestro::maestro::client::{
    AgentClient, AgentReply, ClientResult, FinishReason, Message, ToolCallRequest, Usage,
};
use maestro::maestro::config::RuntimeConfig;
use maestro::maestro::paths::Resolver;
use maestro::maestro::supervisor::{
    classify_task, EchoToolExecutor, ExecutionLimits, ExecutionMode, Supervisor, TaskEnvelope,
    TimeoutAction, WorkerContext, WorkerStatus,
};
use maestro::maestro::telemetry::Telemetry;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Pops scripted replies; repeats the last one when the script runs dry.
struct ScriptedClient {
    replies: Mutex<VecDeque<AgentReply>>,
    fallback: AgentReply,
}

impl ScriptedClient {
    fn new(replies: Vec<AgentReply>, fallback: AgentReply) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            fallback,
        }
    }
}

#[async_trait]
impl AgentClient for ScriptedClient {
    async fn invoke(&self, _messages: &[Message]) -> ClientResult<AgentReply> {
        Ok(self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone()))
    }

    fn model_name(&self) -> &str {
        "haiku-fast"
    }
}

fn tool_reply(content: String) -> AgentReply {
    AgentReply {
        content,
        tool_calls: vec![ToolCallRequest {
            id: "call_1".to_string(),
            name: "Scratch".to_string(),
            arguments: serde_json::json!({}),
        }],
        usage: Some(Usage {
            input_tokens: 100,
            output_tokens: 50,
        }),
        finish_reason: FinishReason::ToolUse,
    }
}

fn supervisor(dir: &TempDir, use_workers: bool) -> Supervisor {
    let resolver = Arc::new(Resolver::new(dir.path()));
    let config = RuntimeConfig::default().with_use_workers(use_workers);
    Supervisor::new(config, resolver, Telemetry::disabled())
        .with_report_interval(Duration::from_millis(0))
}

fn context(client: Arc<dyn AgentClient>) -> WorkerContext {
    WorkerContext {
        client,
        pipeline: None,
        tools: Arc::new(EchoToolExecutor),
    }
}

fn envelope(session: &str, prompt: &str, limits: ExecutionLimits) -> TaskEnvelope {
    TaskEnvelope {
        session_id: session.to_string(),
        agent_kind: "backend-engineer".to_string(),
        prompt: prompt.to_string(),
        tools_allowed: vec![],
        execution_limits: limits,
        context_refs: vec![],
    }
}

#[test]
fn test_classification_heuristic() {
    assert_eq!(
        classify_task("implement the billing service", 0.3),
        ExecutionMode::Worker
    );
    assert_eq!(
        classify_task("comprehensive refactor of the parser", 0.1),
        ExecutionMode::Worker
    );
    assert_eq!(classify_task("fix the typo in the readme", 0.2), ExecutionMode::Legacy);
    assert_eq!(classify_task("look into this", 0.85), ExecutionMode::Worker);
    assert_eq!(classify_task("look into this", 0.4), ExecutionMode::Legacy);
}

#[tokio::test]
async fn test_completed_worker_reports_turns_and_output() {
    let dir = TempDir::new().unwrap();
    let supervisor = supervisor(&dir, true);
    let client = Arc::new(ScriptedClient::new(vec![], AgentReply::text("all done")));

    let outcome = supervisor
        .execute_task(
            envelope("w-done", "implement the widget", ExecutionLimits::default()),
            context(client),
            0.9,
        )
        .await;

    assert_eq!(outcome.status, WorkerStatus::Completed);
    assert_eq!(outcome.turns_used, 1);
    assert_eq!(outcome.output.as_deref(), Some("all done"));

    let session = supervisor.session("w-done").unwrap();
    assert_eq!(session.status, WorkerStatus::Completed);
    assert!(session.ended_at.is_some());
}

#[tokio::test]
async fn test_turn_limit_terminates_with_precise_reason() {
    let dir = TempDir::new().unwrap();
    let supervisor = supervisor(&dir, true);
    let client = Arc::new(ScriptedClient::new(vec![], tool_reply("thinking".to_string())));

    let limits = ExecutionLimits {
        max_turns: 2,
        timeout_action: TimeoutAction::Terminate,
        ..ExecutionLimits::default()
    };
    let outcome = supervisor
        .execute_task(
            envelope("w-turns", "implement endless loop", limits),
            context(client),
            0.9,
        )
        .await;

    assert_eq!(outcome.status, WorkerStatus::Failed);
    assert_eq!(outcome.turns_used, 2);
    assert!(outcome.reason.unwrap().contains("max_turns"));
}

#[tokio::test]
async fn test_memory_budget_breach_terminates_worker_and_supervisor_survives() {
    let dir = TempDir::new().unwrap();
    let supervisor = supervisor(&dir, true).with_heap_budget(4 * 1024);
    // Every reply copies 2 KiB into the worker arena; the second turn
    // crosses the 4 KiB budget.
    let client = Arc::new(ScriptedClient::new(
        vec![],
        tool_reply("x".repeat(2 * 1024)),
    ));

    let outcome = supervisor
        .execute_task(
            envelope("w-oom", "implement a memory hog", ExecutionLimits::default()),
            context(client),
            0.9,
        )
        .await;

    assert_eq!(outcome.status, WorkerStatus::MemoryExceeded);
    assert!(outcome.memory_peak > 4 * 1024);
    assert!(outcome.reason.unwrap().contains("heap budget exceeded"));

    // The supervisor is untouched and can run the next task.
    let session = supervisor.session("w-oom").unwrap();
    assert_eq!(session.status, WorkerStatus::MemoryExceeded);
    assert!(session.peak_memory > 4 * 1024);

    let client = Arc::new(ScriptedClient::new(vec![], AgentReply::text("fine")));
    let next = supervisor
        .execute_task(
            envelope("w-after", "implement something small", ExecutionLimits::default()),
            context(client),
            0.9,
        )
        .await;
    assert_eq!(next.status, WorkerStatus::Completed);
}

#[tokio::test]
async fn test_pause_persists_and_resume_completes() {
    let dir = TempDir::new().unwrap();
    let supervisor = supervisor(&dir, true);
    let client = Arc::new(ScriptedClient::new(
        vec![tool_reply("working on it".to_string())],
        AgentReply::text("{\"completed\": true, \"summary\": \"resumed and finished\"}"),
    ));

    let limits = ExecutionLimits {
        max_turns: 1,
        timeout_action: TimeoutAction::Pause,
        ..ExecutionLimits::default()
    };
    let outcome = supervisor
        .execute_task(
            envelope("w-pause", "implement the long migration", limits),
            context(client.clone()),
            0.9,
        )
        .await;
    assert_eq!(outcome.status, WorkerStatus::Paused);
    assert!(!outcome.transcript.is_empty());

    // The paused record is on disk too.
    assert!(dir
        .path()
        .join("runtime/sessions/workers/w-pause-paused.json")
        .exists());

    // Resume under raised limits.
    let raised = ExecutionLimits {
        max_turns: 10,
        timeout_action: TimeoutAction::Pause,
        ..ExecutionLimits::default()
    };
    let resumed = supervisor
        .resume_worker("w-pause", context(client), Some(raised))
        .await
        .expect("paused worker should be resumable");
    assert_eq!(resumed.status, WorkerStatus::Completed);
}

#[tokio::test]
async fn test_warn_action_logs_and_continues() {
    let dir = TempDir::new().unwrap();
    let supervisor = supervisor(&dir, true);
    let client = Arc::new(ScriptedClient::new(
        vec![tool_reply("turn one".to_string()), tool_reply("turn two".to_string())],
        AgentReply::text("done anyway"),
    ));

    let limits = ExecutionLimits {
        max_turns: 1,
        timeout_action: TimeoutAction::Warn,
        ..ExecutionLimits::default()
    };
    let outcome = supervisor
        .execute_task(
            envelope("w-warn", "implement with warnings", limits),
            context(client),
            0.9,
        )
        .await;

    assert_eq!(outcome.status, WorkerStatus::Completed);
    assert!(outcome.turns_used > 1);
}

#[tokio::test]
async fn test_legacy_mode_runs_in_process_when_workers_disabled() {
    let dir = TempDir::new().unwrap();
    let supervisor = supervisor(&dir, false);
    let client = Arc::new(ScriptedClient::new(vec![], AgentReply::text("quick fix")));

    let outcome = supervisor
        .execute_task(
            envelope("w-legacy", "fix the typo", ExecutionLimits::default()),
            context(client),
            0.1,
        )
        .await;
    assert_eq!(outcome.status, WorkerStatus::Completed);
}

#[tokio::test]
async fn test_worker_session_record_is_persisted_for_audit() {
    let dir = TempDir::new().unwrap();
    let supervisor = supervisor(&dir, true);
    let client = Arc::new(ScriptedClient::new(vec![], AgentReply::text("done")));

    supervisor
        .execute_task(
            envelope("w-persist", "implement persistence", ExecutionLimits::default()),
            context(client),
            0.9,
        )
        .await;

    let record = dir.path().join("runtime/sessions/workers/w-persist.json");
    assert!(record.exists());
    let value: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(record).unwrap()).unwrap();
    assert_eq!(value["status"], "completed");
    assert_eq!(value["agent_kind"], "backend-engineer");
}

#[tokio::test]
async fn test_execution_limits_are_clamped_into_bounds() {
    let limits = ExecutionLimits {
        max_turns: 1000,
        max_duration_ms: 10,
        max_cost_usd: 10_000.0,
        timeout_action: TimeoutAction::Terminate,
    }
    .clamped();
    assert_eq!(limits.max_turns, 100);
    assert_eq!(limits.max_duration_ms, 1_000);
    assert_eq!(limits.max_cost_usd, 100.0);
}
