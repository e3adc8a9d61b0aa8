//! Worker Supervisor
//!
//! Bounded, isolated execution for agent sessions. A single long-lived
//! [`Supervisor`] holds the worker table; each agent task runs either
//! **in-process (legacy)** or in an **ephemeral worker**: a spawned task
//! owning a dedicated [`bumpalo`] scratch arena with a hard byte budget and
//! its own scratch directory. Workers are discarded after one task, so long
//! runs never accumulate heap in the coordinator.
//!
//! # Architecture
//!
//! ```text
//! Supervisor (long-lived, tiny)
//!   ├─ Worker A (ephemeral)  arena ≤ 4 GiB   limits: turns/duration/cost
//!   │    └─ agent loop → tool calls → hook pipeline
//!   ├─ Worker B (ephemeral)
//!   └─ session table + paused-worker store
//! ```
//!
//! Every worker emits periodic memory reports; a report that crosses the
//! arena budget terminates the worker with `memory_exceeded` regardless of
//! the configured timeout action (a paused worker cannot shed its heap).
//! Worker crashes are contained: the task is marked failed and the
//! supervisor keeps running.
//!
//! Whether a task gets a worker is decided by [`classify_task`]: tasks with
//! long-running keywords or a complexity score ≥ 0.8 are isolated, short
//! tasks stay in-process. Spawning costs on the order of 100 ms, which
//! amortizes quickly for long tasks.

use crate::maestro::client::{AgentClient, Message, Role, ToolCallRequest, Usage};
use crate::maestro::config::RuntimeConfig;
use crate::maestro::event::{EventHandler, RuntimeEvent};
use crate::maestro::hooks::{Decision, HookEnvelope, HookEvent, HookPipeline, HookResult};
use crate::maestro::paths::{AccessMode, Resolver};
use crate::maestro::telemetry::{pricing_for, Telemetry};
use async_trait::async_trait;
use bumpalo::Bump;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

/// Default dedicated heap budget per worker: 4 GiB.
pub const DEFAULT_HEAP_BUDGET: usize = 4 * 1024 * 1024 * 1024;

/// Default interval between worker memory reports.
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(10);

/// What to do when a worker breaches a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutAction {
    /// Fail the task with a precise reason.
    Terminate,
    /// Persist state for a later explicit resume.
    Pause,
    /// Log and keep going.
    Warn,
}

/// Per-worker execution limits with documented bounds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ExecutionLimits {
    /// Tool-call turns: 1–100.
    pub max_turns: u32,
    /// Wall time: 1 s – 1 h, in milliseconds.
    pub max_duration_ms: u64,
    /// Cost ceiling: 0.01 – 100.0 USD.
    pub max_cost_usd: f64,
    pub timeout_action: TimeoutAction,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            max_turns: 25,
            max_duration_ms: 600_000,
            max_cost_usd: 1.0,
            timeout_action: TimeoutAction::Terminate,
        }
    }
}

impl ExecutionLimits {
    /// Clamp every limit into its documented bounds.
    pub fn clamped(mut self) -> Self {
        self.max_turns = self.max_turns.clamp(1, 100);
        self.max_duration_ms = self.max_duration_ms.clamp(1_000, 3_600_000);
        self.max_cost_usd = self.max_cost_usd.clamp(0.01, 100.0);
        self
    }
}

/// The message a worker receives: everything needed to run one agent task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub session_id: String,
    pub agent_kind: String,
    pub prompt: String,
    #[serde(default)]
    pub tools_allowed: Vec<String>,
    #[serde(default)]
    pub execution_limits: ExecutionLimits,
    /// Paths of artifacts the agent should read, already resolved.
    #[serde(default)]
    pub context_refs: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Spawning,
    Running,
    Completed,
    Failed,
    TimedOut,
    MemoryExceeded,
    Paused,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Spawning => "spawning",
            WorkerStatus::Running => "running",
            WorkerStatus::Completed => "completed",
            WorkerStatus::Failed => "failed",
            WorkerStatus::TimedOut => "timed_out",
            WorkerStatus::MemoryExceeded => "memory_exceeded",
            WorkerStatus::Paused => "paused",
        }
    }
}

/// The supervisor's durable record of one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSession {
    pub id: String,
    pub supervisor_id: String,
    pub agent_kind: String,
    pub status: WorkerStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub peak_memory: usize,
    pub turns_used: u32,
    pub cost_accumulated: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Periodic heap report emitted by a running worker.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryReport {
    pub session_id: String,
    pub heap_used: usize,
    pub heap_total: usize,
    /// Resident set size when the platform exposes it cheaply.
    pub rss: Option<u64>,
}

/// Terminal result of one worker execution.
#[derive(Debug, Clone)]
pub struct WorkerOutcome {
    pub session_id: String,
    pub status: WorkerStatus,
    pub execution_time_ms: u64,
    pub memory_peak: usize,
    pub turns_used: u32,
    pub cost_accumulated: f64,
    pub usage: Usage,
    pub output: Option<String>,
    pub reason: Option<String>,
    /// Conversation so far, carried only on a pause so the worker can be
    /// resumed where it stopped.
    pub transcript: Vec<(Role, String)>,
}

/// Executes a tool call a worker's agent requested, after the hook
/// pipeline allowed it. The concrete sandboxing primitive lives outside
/// this crate.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, call: &ToolCallRequest) -> HookResult<Value>;
}

/// Acknowledges every call without side effects. Used by tests and by
/// dry-run dispatch.
pub struct EchoToolExecutor;

#[async_trait]
impl ToolExecutor for EchoToolExecutor {
    async fn execute(&self, call: &ToolCallRequest) -> HookResult<Value> {
        Ok(json!({ "tool": call.name, "ok": true }))
    }
}

/// Execution mode chosen for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Ephemeral isolated worker.
    Worker,
    /// In-process legacy execution.
    Legacy,
}

const LONG_RUNNING_KEYWORDS: [&str; 5] = [
    "implement",
    "refactor",
    "migrate",
    "architecture",
    "comprehensive",
];

const SHORT_TASK_KEYWORDS: [&str; 4] = ["fix", "update", "add", "rename"];

/// The legacy-vs-worker heuristic: long-running keywords or a complexity
/// score ≥ 0.8 isolate; short keywords and low scores stay in-process.
pub fn classify_task(description: &str, complexity_score: f64) -> ExecutionMode {
    let lowered = description.to_lowercase();
    if LONG_RUNNING_KEYWORDS.iter().any(|kw| lowered.contains(kw)) {
        return ExecutionMode::Worker;
    }
    if complexity_score >= 0.8 {
        return ExecutionMode::Worker;
    }
    if SHORT_TASK_KEYWORDS
        .iter()
        .any(|kw| lowered.split_whitespace().any(|word| word == *kw))
    {
        return ExecutionMode::Legacy;
    }
    ExecutionMode::Legacy
}

/// Paused worker state kept for an explicit resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PausedWorker {
    envelope: TaskEnvelope,
    transcript: Vec<(Role, String)>,
    turns_used: u32,
    cost_accumulated: f64,
}

/// Shared pieces a worker needs besides its envelope.
#[derive(Clone)]
pub struct WorkerContext {
    pub client: Arc<dyn AgentClient>,
    pub pipeline: Option<Arc<HookPipeline>>,
    pub tools: Arc<dyn ToolExecutor>,
}

/// The long-lived coordinator of the worker pool.
pub struct Supervisor {
    id: String,
    config: RuntimeConfig,
    resolver: Arc<Resolver>,
    telemetry: Arc<Telemetry>,
    sessions: Mutex<HashMap<String, WorkerSession>>,
    paused: Mutex<HashMap<String, PausedWorker>>,
    heap_budget: usize,
    report_interval: Duration,
    cancel: watch::Sender<bool>,
    event_handler: Option<Arc<dyn EventHandler>>,
}

impl Supervisor {
    pub fn new(config: RuntimeConfig, resolver: Arc<Resolver>, telemetry: Arc<Telemetry>) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            id: format!("sup_{}", uuid::Uuid::new_v4().simple()),
            config,
            resolver,
            telemetry,
            sessions: Mutex::new(HashMap::new()),
            paused: Mutex::new(HashMap::new()),
            heap_budget: DEFAULT_HEAP_BUDGET,
            report_interval: DEFAULT_REPORT_INTERVAL,
            cancel,
            event_handler: None,
        }
    }

    /// Override the per-worker arena budget (tests use small budgets).
    pub fn with_heap_budget(mut self, bytes: usize) -> Self {
        self.heap_budget = bytes;
        self
    }

    pub fn with_report_interval(mut self, interval: Duration) -> Self {
        self.report_interval = interval;
        self
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Execute one task envelope, isolated or in-process depending on the
    /// configuration flag and the classification heuristic.
    pub async fn execute_task(
        &self,
        envelope: TaskEnvelope,
        context: WorkerContext,
        complexity_score: f64,
    ) -> WorkerOutcome {
        let mode = if self.config.use_workers {
            classify_task(&envelope.prompt, complexity_score)
        } else {
            ExecutionMode::Legacy
        };
        match mode {
            ExecutionMode::Worker => self.run_isolated(envelope, context, Vec::new(), 0, 0.0).await,
            ExecutionMode::Legacy => self.run_in_process(envelope, context).await,
        }
    }

    /// Resume a previously paused worker by session id. The paused record
    /// is looked up in memory first, then on disk (surviving a supervisor
    /// restart). Counters carry over, so callers typically pass raised
    /// `limits`; resuming under the limits that caused the pause would
    /// pause again on the first check.
    pub async fn resume_worker(
        &self,
        session_id: &str,
        context: WorkerContext,
        limits: Option<ExecutionLimits>,
    ) -> Option<WorkerOutcome> {
        let from_memory = self
            .paused
            .lock()
            .ok()
            .and_then(|mut paused| paused.remove(session_id));
        let mut paused = match from_memory {
            Some(paused) => paused,
            None => self.load_paused(session_id)?,
        };
        if let Some(limits) = limits {
            paused.envelope.execution_limits = limits;
        }
        Some(
            self.run_isolated(
                paused.envelope,
                context,
                paused.transcript,
                paused.turns_used,
                paused.cost_accumulated,
            )
            .await,
        )
    }

    async fn run_isolated(
        &self,
        envelope: TaskEnvelope,
        context: WorkerContext,
        transcript: Vec<(Role, String)>,
        turns_used: u32,
        cost_accumulated: f64,
    ) -> WorkerOutcome {
        let session_id = envelope.session_id.clone();
        self.insert_session(&envelope, WorkerStatus::Spawning);
        self.emit(RuntimeEvent::WorkerSpawned {
            session_id: session_id.clone(),
            agent_kind: envelope.agent_kind.clone(),
        })
        .await;

        let (report_tx, mut report_rx) = mpsc::unbounded_channel::<MemoryReport>();
        let cancel_rx = self.cancel.subscribe();
        let heap_budget = self.heap_budget;
        let report_interval = self.report_interval;
        let span = self
            .telemetry
            .start_span("worker.execute")
            .with_agent(envelope.agent_kind.clone());

        self.update_session(&session_id, |s| s.status = WorkerStatus::Running);

        let worker_envelope = envelope.clone();
        let mut handle = tokio::spawn(async move {
            run_agent_loop(
                worker_envelope,
                context,
                heap_budget,
                report_interval,
                report_tx,
                cancel_rx,
                transcript,
                turns_used,
                cost_accumulated,
            )
            .await
        });

        // Drain reports while the worker runs; the supervisor itself stays
        // tiny; it only tracks the peak.
        let drain_session = session_id.clone();
        let outcome = loop {
            tokio::select! {
                report = report_rx.recv() => {
                    if let Some(report) = report {
                        self.update_session(&drain_session, |s| {
                            s.peak_memory = s.peak_memory.max(report.heap_used);
                        });
                        self.emit(RuntimeEvent::WorkerMemoryReport {
                            session_id: report.session_id.clone(),
                            heap_used: report.heap_used,
                            heap_budget: report.heap_total,
                        })
                        .await;
                    }
                }
                joined = &mut handle => {
                    break joined;
                }
            }
        };

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(join_error) => {
                // Worker crash: contained. The supervisor never aborts.
                log::error!(
                    "{{\"component\":\"supervisor\",\"supervisorId\":\"{}\",\"level\":\"error\",\"message\":\"worker {} crashed: {}\"}}",
                    self.id, session_id, join_error
                );
                WorkerOutcome {
                    session_id: session_id.clone(),
                    status: WorkerStatus::Failed,
                    execution_time_ms: 0,
                    memory_peak: 0,
                    turns_used: 0,
                    cost_accumulated: 0.0,
                    usage: Usage::default(),
                    output: None,
                    reason: Some(format!("worker crashed: {}", join_error)),
                    transcript: Vec::new(),
                }
            }
        };

        self.finalize(&envelope, &outcome).await;
        span.finish(outcome.status.as_str());
        outcome
    }

    async fn run_in_process(&self, envelope: TaskEnvelope, context: WorkerContext) -> WorkerOutcome {
        self.insert_session(&envelope, WorkerStatus::Running);
        let (report_tx, _report_rx) = mpsc::unbounded_channel();
        let cancel_rx = self.cancel.subscribe();
        let span = self
            .telemetry
            .start_span("worker.execute")
            .with_agent(envelope.agent_kind.clone())
            .with_attribute("mode", json!("legacy"));
        let outcome = run_agent_loop(
            envelope.clone(),
            context,
            usize::MAX,
            self.report_interval,
            report_tx,
            cancel_rx,
            Vec::new(),
            0,
            0.0,
        )
        .await;
        self.finalize(&envelope, &outcome).await;
        span.finish(outcome.status.as_str());
        outcome
    }

    async fn finalize(&self, envelope: &TaskEnvelope, outcome: &WorkerOutcome) {
        self.update_session(&outcome.session_id, |s| {
            s.status = outcome.status;
            s.ended_at = Some(Utc::now());
            s.peak_memory = s.peak_memory.max(outcome.memory_peak);
            s.turns_used = outcome.turns_used;
            s.cost_accumulated = outcome.cost_accumulated;
            s.reason = outcome.reason.clone();
        });

        if outcome.status == WorkerStatus::Paused {
            let paused = PausedWorker {
                envelope: envelope.clone(),
                transcript: outcome.transcript.clone(),
                turns_used: outcome.turns_used,
                cost_accumulated: outcome.cost_accumulated,
            };
            self.persist_paused(&outcome.session_id, &paused);
            if let Ok(mut store) = self.paused.lock() {
                store.insert(outcome.session_id.clone(), paused);
            }
        }

        self.persist_session(&outcome.session_id);
        self.emit(RuntimeEvent::WorkerFinished {
            session_id: outcome.session_id.clone(),
            status: outcome.status.as_str().to_string(),
            execution_time_ms: outcome.execution_time_ms,
            memory_peak: outcome.memory_peak,
        })
        .await;
    }

    /// Snapshot of a worker session record.
    pub fn session(&self, session_id: &str) -> Option<WorkerSession> {
        self.sessions.lock().ok()?.get(session_id).cloned()
    }

    /// All worker session records, newest first.
    pub fn sessions(&self) -> Vec<WorkerSession> {
        let mut sessions: Vec<WorkerSession> = self
            .sessions
            .lock()
            .map(|s| s.values().cloned().collect())
            .unwrap_or_default();
        sessions.sort_by_key(|s| std::cmp::Reverse(s.started_at));
        sessions
    }

    /// Signal all workers to stop, wait a grace window, then drop them.
    pub async fn shutdown(&self) {
        let _ = self.cancel.send(true);
        tokio::time::sleep(Duration::from_millis(500)).await;
        self.telemetry.flush();
    }

    fn insert_session(&self, envelope: &TaskEnvelope, status: WorkerStatus) {
        let record = WorkerSession {
            id: envelope.session_id.clone(),
            supervisor_id: self.id.clone(),
            agent_kind: envelope.agent_kind.clone(),
            status,
            started_at: Utc::now(),
            ended_at: None,
            peak_memory: 0,
            turns_used: 0,
            cost_accumulated: 0.0,
            reason: None,
        };
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.insert(envelope.session_id.clone(), record);
        }
    }

    fn update_session(&self, session_id: &str, apply: impl FnOnce(&mut WorkerSession)) {
        if let Ok(mut sessions) = self.sessions.lock() {
            if let Some(session) = sessions.get_mut(session_id) {
                apply(session);
            }
        }
    }

    fn load_paused(&self, session_id: &str) -> Option<PausedWorker> {
        let subpath = format!("sessions/workers/{}-paused.json", session_id);
        let path = self.resolver.resolve_runtime(&subpath, AccessMode::Read).ok()?;
        let value = self.resolver.safe_read_json(&path, "free").ok()??;
        serde_json::from_value(value).ok()
    }

    fn persist_paused(&self, session_id: &str, paused: &PausedWorker) {
        let subpath = format!("sessions/workers/{}-paused.json", session_id);
        let Ok(path) = self.resolver.resolve_runtime(&subpath, AccessMode::Write) else {
            return;
        };
        let Ok(value) = serde_json::to_value(paused) else {
            return;
        };
        if let Err(err) = self.resolver.atomic_write_json(&path, &value) {
            log::warn!("failed to persist paused worker {}: {}", session_id, err);
        }
    }

    fn persist_session(&self, session_id: &str) {
        let Some(record) = self.session(session_id) else {
            return;
        };
        let subpath = format!("sessions/workers/{}.json", session_id);
        let Ok(path) = self.resolver.resolve_runtime(&subpath, AccessMode::Write) else {
            return;
        };
        let Ok(value) = serde_json::to_value(&record) else {
            return;
        };
        if let Err(err) = self.resolver.atomic_write_json(&path, &value) {
            log::warn!("failed to persist worker session {}: {}", session_id, err);
        }
    }

    async fn emit(&self, event: RuntimeEvent) {
        if let Some(handler) = &self.event_handler {
            handler.on_event(&event).await;
        }
    }
}

/// Why the loop stopped early.
enum Breach {
    Turns,
    Duration,
    Cost,
}

impl Breach {
    fn reason(&self, limits: &ExecutionLimits) -> String {
        match self {
            Breach::Turns => format!("max_turns {} exceeded", limits.max_turns),
            Breach::Duration => format!("max_duration_ms {} exceeded", limits.max_duration_ms),
            Breach::Cost => format!("max_cost_usd {} exceeded", limits.max_cost_usd),
        }
    }
}

/// The worker body: drive the agent loop under limits, with every tool
/// call filtered through the hook pipeline and every reply copied into the
/// worker's arena so heap growth is observable.
#[allow(clippy::too_many_arguments)]
async fn run_agent_loop(
    envelope: TaskEnvelope,
    context: WorkerContext,
    heap_budget: usize,
    report_interval: Duration,
    report_tx: mpsc::UnboundedSender<MemoryReport>,
    mut cancel_rx: watch::Receiver<bool>,
    transcript: Vec<(Role, String)>,
    resumed_turns: u32,
    resumed_cost: f64,
) -> WorkerOutcome {
    let limits = envelope.execution_limits.clamped();
    let start = Instant::now();
    let arena = Bump::new();
    let mut usage_total = Usage::default();
    let mut turns = resumed_turns;
    let mut cost = resumed_cost;
    let mut warned = false;
    let mut last_report = Instant::now();

    let mut messages: Vec<Message> = Vec::new();
    messages.push(Message::new(
        Role::System,
        format!("You are the {} agent.", envelope.agent_kind),
    ));
    if transcript.is_empty() {
        messages.push(Message::new(Role::User, &envelope.prompt));
    } else {
        // Resumed: the transcript already carries the prompt and any turns
        // taken before the pause.
        for (role, content) in &transcript {
            messages.push(Message::new(*role, content));
        }
    }
    // Account the prompt against the arena up front.
    arena.alloc_str(&envelope.prompt);

    let fail = |status: WorkerStatus, reason: String, arena: &Bump, turns: u32, cost: f64, usage: Usage| {
        WorkerOutcome {
            session_id: envelope.session_id.clone(),
            status,
            execution_time_ms: start.elapsed().as_millis() as u64,
            memory_peak: arena.allocated_bytes(),
            turns_used: turns,
            cost_accumulated: cost,
            usage,
            output: None,
            reason: Some(reason),
            transcript: Vec::new(),
        }
    };

    loop {
        if *cancel_rx.borrow_and_update() {
            return fail(
                WorkerStatus::Failed,
                "cancelled by supervisor shutdown".to_string(),
                &arena,
                turns,
                cost,
                usage_total,
            );
        }

        // Limit checks happen before every turn so a breach is reported
        // with a precise reason.
        let elapsed_ms = start.elapsed().as_millis() as u64;
        let breach = if turns >= limits.max_turns {
            Some(Breach::Turns)
        } else if elapsed_ms >= limits.max_duration_ms {
            Some(Breach::Duration)
        } else if cost >= limits.max_cost_usd {
            Some(Breach::Cost)
        } else {
            None
        };
        if let Some(breach) = breach {
            let reason = breach.reason(&limits);
            match limits.timeout_action {
                TimeoutAction::Terminate => {
                    let status = match breach {
                        Breach::Duration => WorkerStatus::TimedOut,
                        _ => WorkerStatus::Failed,
                    };
                    return fail(status, reason, &arena, turns, cost, usage_total);
                }
                TimeoutAction::Pause => {
                    return WorkerOutcome {
                        session_id: envelope.session_id.clone(),
                        status: WorkerStatus::Paused,
                        execution_time_ms: start.elapsed().as_millis() as u64,
                        memory_peak: arena.allocated_bytes(),
                        turns_used: turns,
                        cost_accumulated: cost,
                        usage: usage_total,
                        output: None,
                        reason: Some(reason),
                        transcript: messages
                            .iter()
                            .skip(1)
                            .map(|m| (m.role, m.content.to_string()))
                            .collect(),
                    };
                }
                TimeoutAction::Warn => {
                    if !warned {
                        log::warn!("worker {} over limit ({}), continuing", envelope.session_id, reason);
                        warned = true;
                    }
                }
            }
        }

        let reply = match context.client.invoke(&messages).await {
            Ok(reply) => reply,
            Err(err) => {
                return fail(
                    WorkerStatus::Failed,
                    format!("agent invocation failed: {}", err),
                    &arena,
                    turns,
                    cost,
                    usage_total,
                );
            }
        };
        turns += 1;
        if let Some(usage) = reply.usage {
            usage_total.add(&usage);
            cost += pricing_for(context.client.model_name()).cost(&usage);
        }

        // The reply is the worker's scratch: copy it into the arena so the
        // heap budget sees real growth.
        arena.alloc_str(&reply.content);

        if last_report.elapsed() >= report_interval || reply.tool_calls.is_empty() {
            let _ = report_tx.send(MemoryReport {
                session_id: envelope.session_id.clone(),
                heap_used: arena.allocated_bytes(),
                heap_total: heap_budget,
                rss: None,
            });
            last_report = Instant::now();
        }

        // Heap breaches always terminate; pausing cannot shed the arena.
        if arena.allocated_bytes() > heap_budget {
            return fail(
                WorkerStatus::MemoryExceeded,
                format!(
                    "heap budget exceeded: {} > {}",
                    arena.allocated_bytes(),
                    heap_budget
                ),
                &arena,
                turns,
                cost,
                usage_total,
            );
        }

        if reply.tool_calls.is_empty() {
            return WorkerOutcome {
                session_id: envelope.session_id.clone(),
                status: WorkerStatus::Completed,
                execution_time_ms: start.elapsed().as_millis() as u64,
                memory_peak: arena.allocated_bytes(),
                turns_used: turns,
                cost_accumulated: cost,
                usage: usage_total,
                output: Some(reply.content),
                reason: None,
                transcript: Vec::new(),
            };
        }

        messages.push(Message::new(Role::Assistant, &reply.content));
        for call in &reply.tool_calls {
            let result = execute_tool_call(&envelope, &context, call).await;
            messages.push(Message::new(Role::Tool, result.to_string()));
        }
    }
}

/// Filter one tool call through the hook pipeline, execute it if allowed,
/// then run the recording hooks.
async fn execute_tool_call(
    envelope: &TaskEnvelope,
    context: &WorkerContext,
    call: &ToolCallRequest,
) -> Value {
    if !envelope.tools_allowed.is_empty() && !envelope.tools_allowed.iter().any(|t| t == &call.name) {
        return json!({
            "blocked": true,
            "reason": format!("tool {} not in the allowed list", call.name),
        });
    }

    let hook_envelope = HookEnvelope::for_tool(HookEvent::PreToolUse, call.name.clone(), call.arguments.clone())
        .with_context("agent_role", json!(envelope.agent_kind))
        .with_context("session_id", json!(envelope.session_id));

    if let Some(pipeline) = &context.pipeline {
        let outcome = pipeline.dispatch(HookEvent::PreToolUse, &hook_envelope).await;
        if outcome.decision == Decision::Block {
            let reason = outcome
                .blocking()
                .map(|b| b.reason.clone())
                .unwrap_or_else(|| "blocked by policy".to_string());
            return json!({ "blocked": true, "reason": reason });
        }
    }

    let result = match context.tools.execute(call).await {
        Ok(result) => result,
        Err(err) => json!({ "error": err.to_string() }),
    };

    if let Some(pipeline) = &context.pipeline {
        let post = hook_envelope.clone().with_result(result.clone());
        let _ = pipeline.dispatch(HookEvent::PostToolUse, &post).await;
    }

    result
}
