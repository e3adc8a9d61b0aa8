//! Hook Pipeline
//!
//! Deterministic, bounded, crash-resistant policy enforcement around every
//! tool call. Hooks fire on four lifecycle events (`UserPromptSubmit`,
//! `PreToolUse`, `PostToolUse`, `SessionEnd`) and come in two flavors that
//! share one envelope contract:
//!
//! - **Subprocess hooks** ([`CommandHook`]): an independent executable
//!   receives the JSON envelope on stdin and answers with an optional JSON
//!   decision on stdout plus an exit code (`0` allow, `2` block, `1` error).
//!   This keeps external hook authors free to use any language.
//! - **In-process hooks** (the [`Hook`] trait): built-in validators
//!   registered directly for latency; the dispatcher calls them through the
//!   same envelope.
//!
//! # Recursion prevention (four layers)
//!
//! 1. Meta-tool exclusion: tool-event hooks skip the delegation and
//!    todo-list tools, so a hook's own side effects cannot re-trigger it.
//! 2. A per-hook environment guard (`CLAUDE_<HOOK>_EXECUTING`): set while
//!    the hook runs; a hook that finds its own guard set exits immediately.
//! 3. Matcher restriction: `PreToolUse` registrations must name explicit
//!    tools; wildcards are rejected at registration time.
//! 4. A hard timeout (default 1000 ms) armed around every invocation.
//!
//! # Failure policy
//!
//! Security-critical hooks fail **closed**: any error, timeout, or
//! malformed output becomes a block. Recording hooks (audit, memory) fail
//! **open** so they can never stall the pipeline. A per-hook enforcement
//! override (`<HOOK>_ENFORCEMENT=block|warn|off`) can downgrade blocks for
//! debugging; every downgrade is itself audit-logged.
//!
//! # Aggregation
//!
//! When several hooks fire for one event, any block wins; warnings are
//! advisory and collected into the aggregate outcome. `PostToolUse` hooks
//! are recording-only: a block from one is demoted to a warning, because
//! the tool has already run.

use crate::maestro::config::{EnforcementMode, RuntimeConfig};
use crate::maestro::state::{AuditRecord, StateStore};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

/// Default hard timeout for a single hook invocation.
pub const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_millis(1000);

/// Stdin read timeout for the envelope parser used by hook executables.
pub const STDIN_READ_TIMEOUT: Duration = Duration::from_millis(250);

/// Tools excluded from tool-event hooks (recursion layer 1).
pub const META_TOOLS: [&str; 2] = ["task-delegation", "todo-list"];

pub type HookResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

/// Lifecycle events the pipeline dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HookEvent {
    /// The user submitted a prompt (router-state reset).
    UserPromptSubmit,
    /// A tool is about to run. Hooks may allow, block, or warn.
    PreToolUse,
    /// A tool has run. Recording only; cannot block.
    PostToolUse,
    /// The session is ending (persist memory).
    SessionEnd,
}

impl HookEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookEvent::UserPromptSubmit => "UserPromptSubmit",
            HookEvent::PreToolUse => "PreToolUse",
            HookEvent::PostToolUse => "PostToolUse",
            HookEvent::SessionEnd => "SessionEnd",
        }
    }
}

/// The JSON envelope every hook receives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookEnvelope {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<Value>,
    #[serde(default)]
    pub context: BTreeMap<String, Value>,
}

impl HookEnvelope {
    pub fn for_event(event: HookEvent) -> Self {
        Self {
            event: event.as_str().to_string(),
            tool_name: None,
            tool_input: None,
            tool_result: None,
            context: BTreeMap::new(),
        }
    }

    pub fn for_tool(event: HookEvent, tool_name: impl Into<String>, tool_input: Value) -> Self {
        Self {
            event: event.as_str().to_string(),
            tool_name: Some(tool_name.into()),
            tool_input: Some(tool_input),
            tool_result: None,
            context: BTreeMap::new(),
        }
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.tool_result = Some(result);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }
}

/// Normalize a hook's input: an argv-passed JSON blob wins, otherwise the
/// envelope is read from stdin under a small timeout. Malformed input is an
/// error (security hooks treat it as a block).
pub async fn read_envelope(args: &[String]) -> HookResult<HookEnvelope> {
    if let Some(blob) = args.first() {
        if blob.trim_start().starts_with('{') {
            return Ok(serde_json::from_str(blob)?);
        }
    }
    let mut raw = String::new();
    let read = tokio::time::timeout(STDIN_READ_TIMEOUT, async {
        tokio::io::stdin().read_to_string(&mut raw).await
    })
    .await;
    match read {
        Ok(Ok(_)) if !raw.trim().is_empty() => Ok(serde_json::from_str(&raw)?),
        Ok(Ok(_)) => Err("empty hook input".into()),
        Ok(Err(err)) => Err(Box::new(err)),
        Err(_) => Err("timed out reading hook input from stdin".into()),
    }
}

/// The three-valued hook decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Block,
    Warn,
}

impl Decision {
    /// The exit code a subprocess hook uses to carry this decision.
    pub fn exit_code(&self) -> i32 {
        match self {
            Decision::Block => 2,
            Decision::Allow | Decision::Warn => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Allow => "allow",
            Decision::Block => "block",
            Decision::Warn => "warn",
        }
    }
}

/// Structured stdout payload of a hook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookDecision {
    pub decision: Decision,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl HookDecision {
    pub fn allow() -> Self {
        Self {
            decision: Decision::Allow,
            reason: String::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn block(reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::Block,
            reason: reason.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn warn(reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::Warn,
            reason: reason.into(),
            metadata: BTreeMap::new(),
        }
    }
}

/// One hook's resolved outcome within a dispatch.
#[derive(Debug, Clone)]
pub struct HookOutcome {
    pub hook: String,
    pub decision: Decision,
    pub reason: String,
    pub timed_out: bool,
}

/// Aggregate of all hooks fired for one event. Any block wins.
#[derive(Debug, Clone)]
pub struct AggregateOutcome {
    pub decision: Decision,
    pub outcomes: Vec<HookOutcome>,
}

impl AggregateOutcome {
    pub fn allowed(&self) -> bool {
        self.decision != Decision::Block
    }

    /// The first blocking outcome, when one exists.
    pub fn blocking(&self) -> Option<&HookOutcome> {
        self.outcomes.iter().find(|o| o.decision == Decision::Block)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &HookOutcome> {
        self.outcomes.iter().filter(|o| o.decision == Decision::Warn)
    }
}

/// An in-process hook.
#[async_trait]
pub trait Hook: Send + Sync {
    fn name(&self) -> &str;

    /// Security-critical hooks fail closed: errors and timeouts block.
    fn security_critical(&self) -> bool {
        false
    }

    async fn run(&self, envelope: &HookEnvelope) -> HookResult<HookDecision>;
}

/// A subprocess hook: the stable external contract.
#[derive(Debug, Clone)]
pub struct CommandHook {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub security_critical: bool,
    pub timeout: Duration,
}

impl CommandHook {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            security_critical: false,
            timeout: DEFAULT_HOOK_TIMEOUT,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn security_critical(mut self) -> Self {
        self.security_critical = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Spawn the hook, feed it the envelope, and interpret exit code plus
    /// optional stdout decision. Timeouts kill the child and surface as
    /// errors.
    async fn invoke(&self, envelope: &HookEnvelope) -> HookResult<HookDecision> {
        let payload = serde_json::to_string(envelope)?;
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .env(guard_var(&self.name), "true")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(payload.as_bytes()).await?;
            drop(stdin);
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output()).await;
        let output = match output {
            Ok(result) => result?,
            Err(_) => return Err(format!("hook {} timed out", self.name).into()),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let code = output.status.code().unwrap_or(1);

        // Stdout JSON, when present, must validate; malformed output is an
        // error rather than a silent allow.
        let decision = if stdout.trim().is_empty() {
            None
        } else {
            Some(
                serde_json::from_str::<HookDecision>(stdout.trim())
                    .map_err(|e| format!("hook {} produced malformed output: {}", self.name, e))?,
            )
        };

        match code {
            0 => Ok(decision.unwrap_or_else(HookDecision::allow)),
            2 => Ok(decision.unwrap_or_else(|| {
                HookDecision::block(format!("hook {} blocked the operation", self.name))
            })),
            other => Err(format!("hook {} exited with code {}", self.name, other).into()),
        }
    }
}

enum HookKind {
    InProcess(Arc<dyn Hook>),
    Command(CommandHook),
}

struct Registration {
    event: HookEvent,
    /// Explicit tool list. Empty means "every occurrence of the event",
    /// which is only legal for events that do not gate tool dispatch.
    matcher: Vec<String>,
    kind: HookKind,
}

impl Registration {
    fn name(&self) -> &str {
        match &self.kind {
            HookKind::InProcess(hook) => hook.name(),
            HookKind::Command(hook) => &hook.name,
        }
    }

    fn security_critical(&self) -> bool {
        match &self.kind {
            HookKind::InProcess(hook) => hook.security_critical(),
            HookKind::Command(hook) => hook.security_critical,
        }
    }
}

#[derive(Debug)]
pub enum HookConfigError {
    /// Wildcard matchers are forbidden on dispatch-affecting hooks.
    WildcardMatcher(String),
    /// `PreToolUse` hooks must name the tools they match.
    EmptyMatcher(String),
}

impl fmt::Display for HookConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookConfigError::WildcardMatcher(hook) => {
                write!(f, "hook {} registered with a wildcard matcher", hook)
            }
            HookConfigError::EmptyMatcher(hook) => {
                write!(f, "PreToolUse hook {} must list explicit tools", hook)
            }
        }
    }
}

impl Error for HookConfigError {}

/// The pipeline: ordered registrations plus the dispatch loop.
pub struct HookPipeline {
    registrations: Vec<Registration>,
    config: RuntimeConfig,
    audit: Option<Arc<StateStore>>,
}

impl HookPipeline {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            registrations: Vec::new(),
            config,
            audit: None,
        }
    }

    /// Attach the audit sink. Decisions, downgrades, and errors are
    /// appended there.
    pub fn with_audit(mut self, audit: Arc<StateStore>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Register an in-process hook.
    pub fn register(
        &mut self,
        event: HookEvent,
        matcher: Vec<String>,
        hook: Arc<dyn Hook>,
    ) -> Result<(), HookConfigError> {
        self.validate_matcher(event, &matcher, hook.name())?;
        self.registrations.push(Registration {
            event,
            matcher,
            kind: HookKind::InProcess(hook),
        });
        Ok(())
    }

    /// Register a subprocess hook.
    pub fn register_command(
        &mut self,
        event: HookEvent,
        matcher: Vec<String>,
        hook: CommandHook,
    ) -> Result<(), HookConfigError> {
        self.validate_matcher(event, &matcher, &hook.name)?;
        self.registrations.push(Registration {
            event,
            matcher,
            kind: HookKind::Command(hook),
        });
        Ok(())
    }

    fn validate_matcher(
        &self,
        event: HookEvent,
        matcher: &[String],
        name: &str,
    ) -> Result<(), HookConfigError> {
        if matcher.iter().any(|m| m == "*" || m.contains('*')) {
            return Err(HookConfigError::WildcardMatcher(name.to_string()));
        }
        if event == HookEvent::PreToolUse && matcher.is_empty() {
            return Err(HookConfigError::EmptyMatcher(name.to_string()));
        }
        Ok(())
    }

    /// Dispatch an envelope to every matching hook and aggregate.
    pub async fn dispatch(&self, event: HookEvent, envelope: &HookEnvelope) -> AggregateOutcome {
        let mut outcomes = Vec::new();

        for registration in self.registrations.iter().filter(|r| r.event == event) {
            let name = registration.name().to_string();

            if let Some(tool) = &envelope.tool_name {
                if matches!(event, HookEvent::PreToolUse | HookEvent::PostToolUse) {
                    // Meta-tools only reach hooks that name them explicitly
                    // (recursion layer 1): a broad recording hook must never
                    // fire on the delegation machinery's own side effects.
                    if META_TOOLS.contains(&tool.as_str()) && registration.matcher.is_empty() {
                        continue;
                    }
                    if !registration.matcher.is_empty()
                        && !registration.matcher.iter().any(|m| m == tool)
                    {
                        continue;
                    }
                }
            }

            let enforcement = self.config.hook_enforcement(&name);
            if enforcement == EnforcementMode::Off {
                self.audit_decision(&name, event, envelope, Decision::Allow, "enforcement off");
                continue;
            }

            // Recursion guard (layer 2): skip when our own guard is set.
            if std::env::var(guard_var(&name)).map(|v| v == "true").unwrap_or(false) {
                if self.config.debug_hooks {
                    log::debug!("hook {} skipped: recursion guard set", name);
                }
                continue;
            }

            let mut outcome = self.run_one(registration, envelope).await;

            if enforcement == EnforcementMode::Warn && outcome.decision == Decision::Block {
                self.audit_decision(
                    &name,
                    event,
                    envelope,
                    Decision::Warn,
                    "block downgraded to warn by enforcement override",
                );
                outcome.decision = Decision::Warn;
            }

            // PostToolUse is recording-only; the tool already ran.
            if event == HookEvent::PostToolUse && outcome.decision == Decision::Block {
                log::warn!(
                    "PostToolUse hook {} attempted to block; demoting to warn",
                    name
                );
                outcome.decision = Decision::Warn;
            }

            self.audit_decision(&name, event, envelope, outcome.decision, &outcome.reason);
            outcomes.push(outcome);
        }

        let decision = if outcomes.iter().any(|o| o.decision == Decision::Block) {
            Decision::Block
        } else if outcomes.iter().any(|o| o.decision == Decision::Warn) {
            Decision::Warn
        } else {
            Decision::Allow
        };

        AggregateOutcome { decision, outcomes }
    }

    async fn run_one(&self, registration: &Registration, envelope: &HookEnvelope) -> HookOutcome {
        let name = registration.name().to_string();
        let security = registration.security_critical();

        let result = match &registration.kind {
            HookKind::Command(hook) => hook.invoke(envelope).await,
            HookKind::InProcess(hook) => {
                let guard = guard_var(&name);
                std::env::set_var(&guard, "true");
                let run = tokio::time::timeout(DEFAULT_HOOK_TIMEOUT, hook.run(envelope)).await;
                std::env::remove_var(&guard);
                match run {
                    Ok(result) => result,
                    Err(_) => Err(format!("hook {} timed out", name).into()),
                }
            }
        };

        match result {
            Ok(decision) => HookOutcome {
                hook: name,
                decision: decision.decision,
                reason: decision.reason,
                timed_out: false,
            },
            Err(err) => {
                let timed_out = err.to_string().contains("timed out");
                if security {
                    // Fail closed.
                    HookOutcome {
                        hook: name,
                        decision: Decision::Block,
                        reason: format!("security hook error: {}", err),
                        timed_out,
                    }
                } else {
                    // Recording hooks fail open.
                    log::warn!("hook {} failed open: {}", name, err);
                    HookOutcome {
                        hook: name,
                        decision: Decision::Allow,
                        reason: format!("hook error ignored: {}", err),
                        timed_out,
                    }
                }
            }
        }
    }

    fn audit_decision(
        &self,
        hook: &str,
        event: HookEvent,
        envelope: &HookEnvelope,
        decision: Decision,
        reason: &str,
    ) {
        let Some(audit) = &self.audit else {
            return;
        };
        let mut record = AuditRecord::new(event.as_str(), decision.as_str(), reason).with_hook(hook);
        if let Some(tool) = &envelope.tool_name {
            record = record.with_tool(tool.clone());
        }
        if let Some(Value::String(role)) = envelope.context.get("agent_role") {
            record = record.with_agent_role(role.clone());
        }
        if let Some(Value::String(run_id)) = envelope.context.get("run_id") {
            record = record.with_run(run_id.clone());
        }
        if let Err(err) = audit.append_audit(&record) {
            log::warn!("failed to append audit record: {}", err);
        }
    }
}

/// The per-hook recursion-guard variable (`CLAUDE_<HOOK>_EXECUTING`).
pub fn guard_var(hook_name: &str) -> String {
    format!(
        "CLAUDE_{}_EXECUTING",
        hook_name.to_ascii_uppercase().replace('-', "_")
    )
}

// ── Built-in safety hooks ─────────────────────────────────────────────────

use crate::maestro::validators::ValidatorRegistry;

/// Shell-command safety: consult the validator registry before any shell
/// tool call. Fails closed.
pub struct ShellSafetyHook {
    validators: ValidatorRegistry,
}

impl ShellSafetyHook {
    pub fn new(validators: ValidatorRegistry) -> Self {
        Self { validators }
    }
}

#[async_trait]
impl Hook for ShellSafetyHook {
    fn name(&self) -> &str {
        "shell-safety"
    }

    fn security_critical(&self) -> bool {
        true
    }

    async fn run(&self, envelope: &HookEnvelope) -> HookResult<HookDecision> {
        let command = envelope
            .tool_input
            .as_ref()
            .and_then(|input| input.get("command"))
            .and_then(|c| c.as_str())
            .ok_or("shell hook invoked without a command")?;
        let verdict = self.validators.validate_command_line(command);
        if verdict.valid {
            Ok(HookDecision::allow())
        } else {
            Ok(HookDecision::block(
                verdict.error.unwrap_or_else(|| "command blocked".to_string()),
            ))
        }
    }
}

/// Role-based tool restriction: an orchestrator role must delegate rather
/// than touch files itself.
pub struct RoleRestrictionHook {
    /// role -> tools that role may not call.
    restrictions: BTreeMap<String, Vec<String>>,
}

impl Default for RoleRestrictionHook {
    fn default() -> Self {
        let mut restrictions = BTreeMap::new();
        restrictions.insert(
            "orchestrator".to_string(),
            vec!["Write".to_string(), "Edit".to_string()],
        );
        Self { restrictions }
    }
}

impl RoleRestrictionHook {
    pub fn new(restrictions: BTreeMap<String, Vec<String>>) -> Self {
        Self { restrictions }
    }
}

#[async_trait]
impl Hook for RoleRestrictionHook {
    fn name(&self) -> &str {
        "role-restriction"
    }

    fn security_critical(&self) -> bool {
        true
    }

    async fn run(&self, envelope: &HookEnvelope) -> HookResult<HookDecision> {
        let role = envelope
            .context
            .get("agent_role")
            .and_then(|r| r.as_str())
            .unwrap_or_default();
        let tool = envelope.tool_name.as_deref().unwrap_or_default();
        if let Some(denied) = self.restrictions.get(role) {
            if denied.iter().any(|d| d == tool) {
                return Ok(HookDecision::block(format!(
                    "role {} may not call {}; delegate instead",
                    role, tool
                )));
            }
        }
        Ok(HookDecision::allow())
    }
}
