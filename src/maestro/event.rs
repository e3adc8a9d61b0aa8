//! Runtime Event System
//!
//! Every long-lived component of the runtime (the supervisor, the hook
//! pipeline, the workflow executor, the party coordinator) emits
//! [`RuntimeEvent`]s during its lifecycle. Attach an [`EventHandler`] to
//! receive real-time notifications about worker spawns, hook decisions, gate
//! outcomes, debate rounds, security incidents, and cost updates.
//!
//! The telemetry subsystem subscribes through this trait to turn events into
//! spans; applications can attach their own handlers for logging or UI
//! surfaces.
//!
//! # Event Flow (during a typical supervised step)
//!
//! ```text
//! WorkerSpawned
//!   └─ HookDecision { event: "PreToolUse", .. }   (per tool call)
//!   └─ WorkerMemoryReport                          (every report interval)
//! WorkerFinished
//! GateEvaluated { gate: "plan-rating", .. }
//! CostRecorded
//! ```

use crate::maestro::client::Usage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Events emitted by the runtime.
///
/// Variants carry enough identity (session, worker, run ids) that handlers
/// need no external state to attribute them.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    // ── Worker lifecycle ──────────────────────────────────────────────────
    /// A supervised worker started executing a task envelope.
    WorkerSpawned {
        /// Worker session id.
        session_id: String,
        /// Agent kind the worker is running (e.g. `"backend-engineer"`).
        agent_kind: String,
    },

    /// Periodic heap report from a running worker.
    WorkerMemoryReport {
        /// Worker session id.
        session_id: String,
        /// Bytes currently allocated in the worker's arena.
        heap_used: usize,
        /// The worker's configured heap budget in bytes.
        heap_budget: usize,
    },

    /// A worker finished, normally or not.
    WorkerFinished {
        /// Worker session id.
        session_id: String,
        /// Terminal status string (`completed`, `failed`, `timed_out`,
        /// `memory_exceeded`, `paused`).
        status: String,
        /// Wall-clock execution time in milliseconds.
        execution_time_ms: u64,
        /// Peak arena allocation observed, in bytes.
        memory_peak: usize,
    },

    // ── Policy ────────────────────────────────────────────────────────────
    /// A hook reached a decision for a tool call.
    HookDecision {
        /// Hook name (e.g. `"template-enforcer"`).
        hook: String,
        /// Lifecycle event the hook fired on (e.g. `"PreToolUse"`).
        event: String,
        /// Tool under consideration, when applicable.
        tool_name: Option<String>,
        /// `allow`, `block`, or `warn`.
        decision: String,
        /// Human-readable reason attached by the hook.
        reason: String,
    },

    /// A workflow gate was evaluated.
    GateEvaluated {
        /// Run the gate belongs to.
        run_id: String,
        /// Gate name (e.g. `"plan-rating"`, `"signoffs"`).
        gate: String,
        /// Whether the gate passed.
        passed: bool,
        /// Reason recorded alongside the outcome.
        reason: String,
    },

    /// A CRITICAL security incident (chain break, identity mismatch,
    /// boundary violation). These are additionally written to the audit log
    /// by the emitter.
    SecurityEvent {
        /// Incident category (e.g. `"chain_break"`).
        category: String,
        /// Detail message preserved as evidence.
        detail: String,
        /// When the incident was detected.
        at: DateTime<Utc>,
    },

    // ── Debate rounds ─────────────────────────────────────────────────────
    /// A party-mode round completed and its responses were chained.
    RoundCompleted {
        /// Party session id.
        session_id: String,
        /// 1-based round number.
        round: usize,
        /// Number of responses accepted into the chain this round.
        responses: usize,
        /// Consensus state after aggregation (`strong`, `weak`, `none`).
        consensus: String,
    },

    // ── Accounting ────────────────────────────────────────────────────────
    /// Token usage was attributed to a model for a session.
    CostRecorded {
        /// Session the cost belongs to.
        session_id: String,
        /// Model the usage was billed against.
        model: String,
        /// The usage being recorded.
        usage: Usage,
        /// Computed cost in USD for this record.
        cost_usd: f64,
    },
}

/// Receiver for [`RuntimeEvent`]s.
///
/// The single method has a no-op default so handlers only match the variants
/// they care about.
///
/// # Example
///
/// ```rust
/// use maestro::event::{EventHandler, RuntimeEvent};
/// use async_trait::async_trait;
///
/// struct Printer;
///
/// #[async_trait]
/// impl EventHandler for Printer {
///     async fn on_event(&self, event: &RuntimeEvent) {
///         if let RuntimeEvent::GateEvaluated { gate, passed, .. } = event {
///             println!("gate {} passed={}", gate, passed);
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Called for every emitted event.
    async fn on_event(&self, _event: &RuntimeEvent) {}
}
