//! Telemetry: spans, batched OTLP export, and cost accounting.
//!
//! Spans are created around worker execution, tool calls, hook invocations,
//! and memory operations. Each span carries `operation.type`, optional
//! `agent.name` and `task.id`, and a `result.status`. Finished spans flow
//! through an in-process batch processor (size 512, timeout 5000 ms, queue
//! 4096 by default) that exports OTLP/HTTP JSON to the configured endpoint
//! and flushes on shutdown.
//!
//! Cost accounting is independent of export: every model invocation is
//! priced from a single table keyed by model id, accumulated per session and
//! per model, with a timeline of individual records. The running-sum
//! invariant (session total equals the sum of per-model totals) holds
//! after every update.

use crate::maestro::client::Usage;
use crate::maestro::config::RuntimeConfig;
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

// ── Cost model ────────────────────────────────────────────────────────────

/// Model tier used for reporting rollups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Cheap,
    Mid,
    Expensive,
}

/// Pricing for one model, in USD per million tokens.
#[derive(Debug, Clone, Copy)]
pub struct ModelPricing {
    pub tier: ModelTier,
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

impl ModelPricing {
    /// Price a usage record in USD.
    pub fn cost(&self, usage: &Usage) -> f64 {
        (usage.input_tokens as f64 * self.input_per_mtok
            + usage.output_tokens as f64 * self.output_per_mtok)
            / 1_000_000.0
    }
}

lazy_static! {
    /// The single pricing table. Totals are always computed from persisted
    /// usage through this table, never from transient state.
    static ref PRICING: HashMap<&'static str, ModelPricing> = {
        let mut table = HashMap::new();
        table.insert("haiku-fast", ModelPricing { tier: ModelTier::Cheap, input_per_mtok: 0.80, output_per_mtok: 4.00 });
        table.insert("sonnet-core", ModelPricing { tier: ModelTier::Mid, input_per_mtok: 3.00, output_per_mtok: 15.00 });
        table.insert("opus-deep", ModelPricing { tier: ModelTier::Expensive, input_per_mtok: 15.00, output_per_mtok: 75.00 });
        table
    };
}

/// Pricing for a model id; unknown ids fall back to the mid tier.
pub fn pricing_for(model: &str) -> ModelPricing {
    PRICING.get(model).copied().unwrap_or(ModelPricing {
        tier: ModelTier::Mid,
        input_per_mtok: 3.00,
        output_per_mtok: 15.00,
    })
}

/// Per-model accumulator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelCost {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

/// One entry in the usage timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelUsageRecord {
    pub model: String,
    pub usage: Usage,
    pub cost_usd: f64,
    pub at: DateTime<Utc>,
}

/// Accumulated costs for one session (router plus every agent invocation).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionCosts {
    #[serde(default)]
    pub per_model: BTreeMap<String, ModelCost>,
    #[serde(default)]
    pub total_usd: f64,
    #[serde(default)]
    pub model_usage: Vec<ModelUsageRecord>,
}

impl SessionCosts {
    /// Record usage against a model. Returns the cost of this record.
    pub fn record(&mut self, model: &str, usage: Usage) -> f64 {
        let cost = pricing_for(model).cost(&usage);
        let entry = self.per_model.entry(model.to_string()).or_default();
        entry.input_tokens += usage.input_tokens;
        entry.output_tokens += usage.output_tokens;
        entry.cost_usd += cost;
        self.model_usage.push(ModelUsageRecord {
            model: model.to_string(),
            usage,
            cost_usd: cost,
            at: Utc::now(),
        });
        self.recompute_total();
        cost
    }

    /// Fold another accumulator into this one (router handoff).
    pub fn merge(&mut self, other: &SessionCosts) {
        for (model, cost) in &other.per_model {
            let entry = self.per_model.entry(model.clone()).or_default();
            entry.input_tokens += cost.input_tokens;
            entry.output_tokens += cost.output_tokens;
            entry.cost_usd += cost.cost_usd;
        }
        self.model_usage.extend(other.model_usage.iter().cloned());
        self.recompute_total();
    }

    /// The total is always derived from the per-model sums.
    fn recompute_total(&mut self) {
        self.total_usd = self.per_model.values().map(|c| c.cost_usd).sum();
    }

    /// Rollup by tier for reporting.
    pub fn by_tier(&self) -> BTreeMap<String, f64> {
        let mut tiers: BTreeMap<String, f64> = BTreeMap::new();
        for (model, cost) in &self.per_model {
            let tier = match pricing_for(model).tier {
                ModelTier::Cheap => "cheap",
                ModelTier::Mid => "mid",
                ModelTier::Expensive => "expensive",
            };
            *tiers.entry(tier.to_string()).or_default() += cost.cost_usd;
        }
        tiers
    }
}

// ── Spans ─────────────────────────────────────────────────────────────────

/// A finished span ready for export.
#[derive(Debug, Clone, Serialize)]
pub struct Span {
    pub trace_id: String,
    pub span_id: String,
    pub operation_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

/// An in-flight span. Call [`finish`](ActiveSpan::finish) to record it;
/// dropping without finishing records it with status `"dropped"`.
pub struct ActiveSpan {
    telemetry: Arc<Telemetry>,
    operation_type: String,
    agent_name: Option<String>,
    task_id: Option<String>,
    attributes: BTreeMap<String, Value>,
    started_at: DateTime<Utc>,
    finished: bool,
}

impl ActiveSpan {
    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent_name = Some(agent.into());
        self
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Finish the span with a result status (`ok`, `error`, `blocked`, ...).
    pub fn finish(mut self, status: &str) {
        self.finished = true;
        self.telemetry.submit(Span {
            trace_id: uuid::Uuid::new_v4().simple().to_string(),
            span_id: uuid::Uuid::new_v4().simple().to_string()[..16].to_string(),
            operation_type: self.operation_type.clone(),
            agent_name: self.agent_name.take(),
            task_id: self.task_id.take(),
            status: status.to_string(),
            started_at: self.started_at,
            ended_at: Utc::now(),
            attributes: std::mem::take(&mut self.attributes),
        });
    }
}

impl Drop for ActiveSpan {
    fn drop(&mut self) {
        if !self.finished {
            self.telemetry.submit(Span {
                trace_id: uuid::Uuid::new_v4().simple().to_string(),
                span_id: uuid::Uuid::new_v4().simple().to_string()[..16].to_string(),
                operation_type: self.operation_type.clone(),
                agent_name: self.agent_name.take(),
                task_id: self.task_id.take(),
                status: "dropped".to_string(),
                started_at: self.started_at,
                ended_at: Utc::now(),
                attributes: std::mem::take(&mut self.attributes),
            });
        }
    }
}

// ── The telemetry hub ─────────────────────────────────────────────────────

/// Span sink plus per-session cost store.
pub struct Telemetry {
    sender: Option<mpsc::Sender<ExporterMessage>>,
    costs: Mutex<HashMap<String, SessionCosts>>,
    /// Spans retained in-process when export is disabled (bounded), so
    /// tests and the CLI can still inspect them.
    recent: Mutex<Vec<Span>>,
}

enum ExporterMessage {
    Span(Span),
    Flush,
}

const RECENT_CAP: usize = 1024;

impl Telemetry {
    /// Create a telemetry hub. When `config.otel_enabled` and an endpoint
    /// are set, a batch exporter task is spawned on the current tokio
    /// runtime; otherwise spans are retained in a bounded in-process
    /// buffer.
    pub fn new(config: &RuntimeConfig) -> Arc<Self> {
        let sender = match (&config.otel_endpoint, config.otel_enabled) {
            (Some(endpoint), true) => Some(spawn_exporter(
                endpoint.clone(),
                config.otel_batch_size,
                config.otel_batch_timeout_ms,
            )),
            _ => None,
        };
        Arc::new(Self {
            sender,
            costs: Mutex::new(HashMap::new()),
            recent: Mutex::new(Vec::new()),
        })
    }

    /// A disabled hub for tests and short-lived CLI commands.
    pub fn disabled() -> Arc<Self> {
        Arc::new(Self {
            sender: None,
            costs: Mutex::new(HashMap::new()),
            recent: Mutex::new(Vec::new()),
        })
    }

    /// Start a span around an operation.
    pub fn start_span(self: &Arc<Self>, operation_type: &str) -> ActiveSpan {
        ActiveSpan {
            telemetry: Arc::clone(self),
            operation_type: operation_type.to_string(),
            agent_name: None,
            task_id: None,
            attributes: BTreeMap::new(),
            started_at: Utc::now(),
            finished: false,
        }
    }

    fn submit(&self, span: Span) {
        match &self.sender {
            Some(sender) => {
                // try_send: the queue bound is the backpressure policy; a
                // full queue drops the span rather than stalling the caller.
                if sender.try_send(ExporterMessage::Span(span)).is_err() {
                    log::warn!("telemetry queue full, span dropped");
                }
            }
            None => {
                if let Ok(mut recent) = self.recent.lock() {
                    if recent.len() >= RECENT_CAP {
                        recent.remove(0);
                    }
                    recent.push(span);
                }
            }
        }
    }

    /// Request an export flush (no-op when export is disabled).
    pub fn flush(&self) {
        if let Some(sender) = &self.sender {
            let _ = sender.try_send(ExporterMessage::Flush);
        }
    }

    /// Spans retained in-process (export disabled only).
    pub fn recent_spans(&self) -> Vec<Span> {
        self.recent.lock().map(|r| r.clone()).unwrap_or_default()
    }

    // ── Cost API ──────────────────────────────────────────────────────────

    /// Record usage for a session/model pair. Returns the cost in USD of
    /// this record.
    pub fn record_cost(&self, session_id: &str, model: &str, usage: Usage) -> f64 {
        let mut costs = match self.costs.lock() {
            Ok(costs) => costs,
            Err(poisoned) => poisoned.into_inner(),
        };
        costs.entry(session_id.to_string()).or_default().record(model, usage)
    }

    /// Merge an externally accumulated cost set (e.g. a router handoff)
    /// into a session.
    pub fn merge_costs(&self, session_id: &str, other: &SessionCosts) {
        let mut costs = match self.costs.lock() {
            Ok(costs) => costs,
            Err(poisoned) => poisoned.into_inner(),
        };
        costs.entry(session_id.to_string()).or_default().merge(other);
    }

    /// Accumulated costs for a session.
    pub fn session_costs(&self, session_id: &str) -> SessionCosts {
        self.costs
            .lock()
            .ok()
            .and_then(|costs| costs.get(session_id).cloned())
            .unwrap_or_default()
    }

    /// Tier rollup plus totals, the shape the CLI `state costs` prints.
    pub fn cost_report(&self, session_id: &str) -> Value {
        let costs = self.session_costs(session_id);
        json!({
            "session_id": session_id,
            "total_usd": costs.total_usd,
            "by_tier": costs.by_tier(),
            "per_model": costs.per_model,
            "invocations": costs.model_usage.len(),
        })
    }
}

fn spawn_exporter(endpoint: String, batch_size: usize, timeout_ms: u64) -> mpsc::Sender<ExporterMessage> {
    let (sender, mut receiver) = mpsc::channel::<ExporterMessage>(4096);
    tokio::spawn(async move {
        let client = reqwest::Client::new();
        let mut batch: Vec<Span> = Vec::with_capacity(batch_size);
        let flush_every = std::time::Duration::from_millis(timeout_ms.max(1));
        loop {
            let message = tokio::time::timeout(flush_every, receiver.recv()).await;
            match message {
                Ok(Some(ExporterMessage::Span(span))) => {
                    batch.push(span);
                    if batch.len() >= batch_size {
                        export_batch(&client, &endpoint, &mut batch).await;
                    }
                }
                Ok(Some(ExporterMessage::Flush)) => {
                    export_batch(&client, &endpoint, &mut batch).await;
                }
                // Channel closed: final flush, then exit.
                Ok(None) => {
                    export_batch(&client, &endpoint, &mut batch).await;
                    break;
                }
                // Batch timeout elapsed with no traffic.
                Err(_) => {
                    export_batch(&client, &endpoint, &mut batch).await;
                }
            }
        }
    });
    sender
}

async fn export_batch(client: &reqwest::Client, endpoint: &str, batch: &mut Vec<Span>) {
    if batch.is_empty() {
        return;
    }
    let spans: Vec<Value> = batch
        .drain(..)
        .map(|span| {
            json!({
                "traceId": span.trace_id,
                "spanId": span.span_id,
                "name": span.operation_type,
                "startTimeUnixNano": span.started_at.timestamp_nanos_opt().unwrap_or(0),
                "endTimeUnixNano": span.ended_at.timestamp_nanos_opt().unwrap_or(0),
                "attributes": span_attributes(&span),
            })
        })
        .collect();
    let body = json!({
        "resourceSpans": [{
            "scopeSpans": [{ "spans": spans }]
        }]
    });
    let url = format!("{}/v1/traces", endpoint.trim_end_matches('/'));
    if let Err(err) = client.post(&url).json(&body).send().await {
        log::warn!("telemetry export failed: {}", err);
    }
}

fn span_attributes(span: &Span) -> Vec<Value> {
    let mut attrs = vec![
        json!({"key": "operation.type", "value": {"stringValue": span.operation_type}}),
        json!({"key": "result.status", "value": {"stringValue": span.status}}),
    ];
    if let Some(agent) = &span.agent_name {
        attrs.push(json!({"key": "agent.name", "value": {"stringValue": agent}}));
    }
    if let Some(task) = &span.task_id {
        attrs.push(json!({"key": "task.id", "value": {"stringValue": task}}));
    }
    for (key, value) in &span.attributes {
        attrs.push(json!({"key": key, "value": {"stringValue": value.to_string()}}));
    }
    attrs
}
