//! Party Mode Coordinator
//!
//! A constrained multi-agent debate: two to four agents, at most ten
//! rounds, with the coordinator as the only trusted process. Agents are
//! untrusted peers: every context handed to one is a deep clone of the
//! shared state with orchestrator-only keys stripped and sibling responses
//! sanitized down to six public fields, and every response coming back is
//! identity-checked and appended to a SHA-256 hash chain so post-hoc
//! tampering is detectable.
//!
//! # Architecture
//!
//! ```text
//! PartyCoordinator (trusted)
//!   ├─ load team roster (CSV) → identity hashes
//!   ├─ round: isolate context → invoke ≤4 agents in parallel
//!   │    └─ responses → identity check → hash chain append
//!   ├─ verify chain before the next round
//!   └─ consensus: strong ≥80%, weak 60–79%, none <60% (another round)
//! ```
//!
//! # Disk Format
//!
//! Session audit entries are newline-delimited JSON, append-only, carrying
//! response hashes (never bodies). A broken chain or an identity mismatch
//! is CRITICAL: the session terminates, the evidence stays on disk, and a
//! security event is recorded.

use crate::maestro::client::{AgentClient, Message, Role};
use crate::maestro::hooks::{Hook, HookDecision, HookEnvelope, HookResult};
use crate::maestro::state::{AuditRecord, StateStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;

/// Hard limits on a party session.
pub const MAX_AGENTS_PER_ROUND: usize = 4;
pub const MAX_ROUNDS: usize = 10;

/// Context-size thresholds, in tokens (estimated at four chars per token).
pub const CONTEXT_WARN_TOKENS: usize = 100_000;
pub const CONTEXT_HARD_TOKENS: usize = 150_000;

/// Keys that must never reach an agent's context.
pub const FORBIDDEN_CONTEXT_KEYS: [&str; 4] = [
    "_orchestratorState",
    "_sessionSecrets",
    "coordination_state",
    "session_secrets",
];

/// Sibling-response fields an agent is allowed to see.
const SANITIZED_RESPONSE_FIELDS: [&str; 6] =
    ["agentName", "displayName", "icon", "content", "hash", "timestamp"];

pub type PartyResult<T> = Result<T, PartyError>;

#[derive(Debug)]
pub enum PartyError {
    TeamTooLarge(usize),
    MalformedRoster(String),
    MissingAgentFile(String),
    RoundLimitReached,
    ContextOverflow(usize),
    IdentityMismatch(String),
    /// The chain failed verification at this index.
    ChainBroken(usize),
    SessionTerminated(String),
    Io(std::io::Error),
}

impl fmt::Display for PartyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartyError::TeamTooLarge(n) => {
                write!(f, "Team has {} agents; the limit is {}", n, MAX_AGENTS_PER_ROUND)
            }
            PartyError::MalformedRoster(msg) => write!(f, "Malformed team roster: {}", msg),
            PartyError::MissingAgentFile(agent) => {
                write!(f, "No agent file for agent_type {}", agent)
            }
            PartyError::RoundLimitReached => {
                write!(f, "Round limit of {} reached", MAX_ROUNDS)
            }
            PartyError::ContextOverflow(tokens) => write!(
                f,
                "Context is ~{} tokens, above the hard cap of {}",
                tokens, CONTEXT_HARD_TOKENS
            ),
            PartyError::IdentityMismatch(agent) => {
                write!(f, "Identity hash mismatch for {}", agent)
            }
            PartyError::ChainBroken(index) => {
                write!(f, "Response chain broken at index {}", index)
            }
            PartyError::SessionTerminated(reason) => write!(f, "Session terminated: {}", reason),
            PartyError::Io(err) => write!(f, "IO error: {}", err),
        }
    }
}

impl Error for PartyError {}

impl From<std::io::Error> for PartyError {
    fn from(err: std::io::Error) -> Self {
        PartyError::Io(err)
    }
}

/// One row of the team roster CSV
/// (`agent_type, role, priority, tools, model`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamMember {
    pub agent_type: String,
    pub role: String,
    pub priority: u32,
    pub tools: Vec<String>,
    pub model: String,
}

/// A participating agent with its computed identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartyAgent {
    /// `agent_<hash>_<timestamp>`.
    pub id: String,
    /// `SHA-256(agent file path || file content)[0..8]`.
    pub identity_hash: String,
    pub member: TeamMember,
    pub display: String,
}

/// A response accepted into the chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainedResponse {
    pub agent_id: String,
    pub agent_name: String,
    pub display_name: String,
    pub icon: String,
    pub content: String,
    pub timestamp: String,
    /// `SHA-256(prev ":" agent_id ":" content ":" timestamp)[0..16]`.
    pub hash: String,
}

/// A response as submitted by (or on behalf of) an agent, before the
/// coordinator has verified it.
#[derive(Debug, Clone)]
pub struct IncomingResponse {
    pub agent_id: String,
    pub identity_hash: String,
    pub content: String,
    pub timestamp: String,
}

/// Verdict of [`verify_response_chain`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainVerdict {
    pub valid: bool,
    pub tampered_at: Option<usize>,
}

/// Weighted consensus state after a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Consensus {
    /// ≥ 80 % weighted agreement.
    Strong,
    /// 60–79 %.
    Weak,
    /// < 60 %; triggers another round up to the cap.
    None,
}

impl Consensus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Consensus::Strong => "strong",
            Consensus::Weak => "weak",
            Consensus::None => "none",
        }
    }
}

/// A live debate session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartySession {
    pub id: String,
    pub team: String,
    pub round_count: usize,
    pub agents: Vec<PartyAgent>,
    pub chain: Vec<ChainedResponse>,
    pub last_hash: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub terminated: bool,
}

// ── Pure building blocks ──────────────────────────────────────────────────

/// `SHA-256(path || content)[0..8]`, the agent's identity fingerprint.
pub fn identity_hash(agent_path: &Path, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(agent_path.to_string_lossy().as_bytes());
    hasher.update(content.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..8].to_string()
}

/// The chain link hash:
/// `SHA-256(prev ":" agent_id ":" content ":" timestamp)[0..16]`.
pub fn chain_hash(prev: &str, agent_id: &str, content: &str, timestamp: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev.as_bytes());
    hasher.update(b":");
    hasher.update(agent_id.as_bytes());
    hasher.update(b":");
    hasher.update(content.as_bytes());
    hasher.update(b":");
    hasher.update(timestamp.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

/// Recompute every link. The genesis previous-hash is `"0"`.
pub fn verify_response_chain(chain: &[ChainedResponse]) -> ChainVerdict {
    let mut prev = "0".to_string();
    for (index, response) in chain.iter().enumerate() {
        let expected = chain_hash(&prev, &response.agent_id, &response.content, &response.timestamp);
        if expected != response.hash {
            return ChainVerdict {
                valid: false,
                tampered_at: Some(index),
            };
        }
        prev = response.hash.clone();
    }
    ChainVerdict {
        valid: true,
        tampered_at: None,
    }
}

/// Deep-clone the shared context and strip everything an agent must not
/// see, then stamp the isolation markers.
pub fn build_isolated_context(
    shared: &Value,
    agent_id: &str,
    previous: &[ChainedResponse],
) -> Value {
    let mut context = shared.clone();
    if let Value::Object(map) = &mut context {
        for key in FORBIDDEN_CONTEXT_KEYS {
            map.remove(key);
        }
        // Any remaining underscore-prefixed key is coordinator-internal.
        let internal: Vec<String> = map
            .keys()
            .filter(|k| k.starts_with('_'))
            .cloned()
            .collect();
        for key in internal {
            map.remove(&key);
        }
        map.insert("_isolationBoundary".to_string(), json!(true));
        map.insert("_agentId".to_string(), json!(agent_id));
        map.insert(
            "previous_responses".to_string(),
            Value::Array(previous.iter().map(sanitize_response).collect()),
        );
    }
    context
}

/// Keep only the six public fields of a sibling response; raw reasoning,
/// tool calls, and memory access never cross the boundary.
pub fn sanitize_response(response: &ChainedResponse) -> Value {
    let full = json!({
        "agentName": response.agent_name,
        "displayName": response.display_name,
        "icon": response.icon,
        "content": response.content,
        "hash": response.hash,
        "timestamp": response.timestamp,
    });
    // The allowlist is authoritative even if the struct grows fields.
    let mut sanitized = serde_json::Map::new();
    if let Value::Object(map) = full {
        for (key, value) in map {
            if SANITIZED_RESPONSE_FIELDS.contains(&key.as_str()) {
                sanitized.insert(key, value);
            }
        }
    }
    Value::Object(sanitized)
}

/// Weighted agree/disagree aggregation. Responses vote through explicit
/// markers; a security-architect's vote counts 1.5× on security topics.
pub fn aggregate_consensus(
    chain: &[ChainedResponse],
    agents: &[PartyAgent],
    topic: &str,
) -> (Consensus, f64) {
    let security_topic = topic.to_lowercase().contains("security");
    let mut agree_weight = 0.0;
    let mut total_weight = 0.0;
    for response in chain {
        let role = agents
            .iter()
            .find(|a| a.id == response.agent_id)
            .map(|a| a.member.role.as_str())
            .unwrap_or_default();
        let weight = if security_topic && role == "security-architect" {
            1.5
        } else {
            1.0
        };
        let content = response.content.to_uppercase();
        let agrees = content.contains("AGREE") && !content.contains("DISAGREE");
        let disagrees = content.contains("DISAGREE");
        if agrees || disagrees {
            total_weight += weight;
            if agrees {
                agree_weight += weight;
            }
        }
    }
    if total_weight == 0.0 {
        return (Consensus::None, 0.0);
    }
    let share = agree_weight / total_weight;
    let consensus = if share >= 0.8 {
        Consensus::Strong
    } else if share >= 0.6 {
        Consensus::Weak
    } else {
        Consensus::None
    };
    (consensus, share)
}

/// Rough token estimate for context-size limits.
pub fn estimate_tokens(context: &Value) -> usize {
    context.to_string().len() / 4
}

// ── Team loading ──────────────────────────────────────────────────────────

/// Load and validate the team roster. Rejects oversized teams, malformed
/// rows, and agent types without a persona file.
pub fn load_team(roster_path: &Path, agents_dir: &Path) -> PartyResult<Vec<TeamMember>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(roster_path)
        .map_err(|e| PartyError::MalformedRoster(e.to_string()))?;
    let mut members = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| PartyError::MalformedRoster(e.to_string()))?;
        if record.len() < 5 {
            return Err(PartyError::MalformedRoster(format!(
                "expected 5 columns, found {}",
                record.len()
            )));
        }
        let agent_type = record.get(0).unwrap_or_default().trim().to_string();
        if agent_type.is_empty() {
            return Err(PartyError::MalformedRoster("empty agent_type".to_string()));
        }
        if !agents_dir.join(format!("{}.md", agent_type)).exists() {
            return Err(PartyError::MissingAgentFile(agent_type));
        }
        members.push(TeamMember {
            agent_type,
            role: record.get(1).unwrap_or_default().trim().to_string(),
            priority: record
                .get(2)
                .unwrap_or_default()
                .trim()
                .parse()
                .map_err(|_| PartyError::MalformedRoster("priority must be numeric".to_string()))?,
            tools: record
                .get(3)
                .unwrap_or_default()
                .split(';')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            model: record.get(4).unwrap_or_default().trim().to_string(),
        });
    }
    if members.len() > MAX_AGENTS_PER_ROUND {
        return Err(PartyError::TeamTooLarge(members.len()));
    }
    Ok(members)
}

// ── The coordinator ───────────────────────────────────────────────────────

/// The only trusted process in a debate.
pub struct PartyCoordinator {
    state: Arc<StateStore>,
    agents_dir: PathBuf,
    /// Per-round deadline; agents that miss it are absent from consensus.
    round_timeout: Duration,
}

impl PartyCoordinator {
    pub fn new(state: Arc<StateStore>, agents_dir: impl Into<PathBuf>) -> Self {
        Self {
            state,
            agents_dir: agents_dir.into(),
            round_timeout: Duration::from_secs(120),
        }
    }

    pub fn with_round_timeout(mut self, timeout: Duration) -> Self {
        self.round_timeout = timeout;
        self
    }

    /// Load the team, compute identities, and open a session.
    pub fn start_session(&self, team: &str, roster_path: &Path) -> PartyResult<PartySession> {
        let members = load_team(roster_path, &self.agents_dir)?;
        let mut agents = Vec::new();
        for member in members {
            let agent_path = self.agents_dir.join(format!("{}.md", member.agent_type));
            let content = std::fs::read_to_string(&agent_path)?;
            let identity = identity_hash(&agent_path, &content);
            agents.push(PartyAgent {
                id: format!("agent_{}_{}", identity, Utc::now().timestamp_millis()),
                identity_hash: identity,
                display: member.agent_type.replace('-', " "),
                member,
            });
        }
        let session = PartySession {
            id: format!("party_{}", uuid::Uuid::new_v4().simple()),
            team: team.to_string(),
            round_count: 0,
            agents,
            chain: Vec::new(),
            last_hash: "0".to_string(),
            started_at: Utc::now(),
            ended_at: None,
            terminated: false,
        };
        self.audit(&session.id, "session_start", "allow", &format!("team {}", team));
        Ok(session)
    }

    /// Run one debate round: verify the chain, enforce rate limits, hand
    /// every agent an isolated context, invoke them in parallel, and chain
    /// the responses in deterministic order.
    pub async fn run_round(
        &self,
        session: &mut PartySession,
        shared_context: &Value,
        prompt: &str,
        clients: &BTreeMap<String, Arc<dyn AgentClient>>,
    ) -> PartyResult<(Consensus, f64)> {
        if session.terminated {
            return Err(PartyError::SessionTerminated(
                "session already terminated".to_string(),
            ));
        }

        // Chain verification precedes every round.
        let verdict = verify_response_chain(&session.chain);
        if !verdict.valid {
            let index = verdict.tampered_at.unwrap_or(0);
            self.terminate(session, &format!("chain broken at {}", index));
            return Err(PartyError::ChainBroken(index));
        }

        if session.round_count >= MAX_ROUNDS {
            return Err(PartyError::RoundLimitReached);
        }
        let tokens = estimate_tokens(shared_context);
        if tokens > CONTEXT_HARD_TOKENS {
            return Err(PartyError::ContextOverflow(tokens));
        }
        if tokens > CONTEXT_WARN_TOKENS {
            log::warn!(
                "party context is ~{} tokens; consider summarizing before the hard cap of {}",
                tokens,
                CONTEXT_HARD_TOKENS
            );
        }

        // Rate limit: at most four participants per round.
        let participants: Vec<PartyAgent> =
            session.agents.iter().take(MAX_AGENTS_PER_ROUND).cloned().collect();

        let invocations = participants.iter().map(|agent| {
            let context = build_isolated_context(shared_context, &agent.id, &session.chain);
            let client = clients.get(&agent.member.agent_type).cloned();
            let agent = agent.clone();
            let prompt = prompt.to_string();
            let timeout = self.round_timeout;
            async move {
                let client = client?;
                let request = [
                    Message::new(
                        Role::System,
                        format!("You are {} ({}). Context: {}", agent.display, agent.member.role, context),
                    ),
                    Message::new(Role::User, prompt),
                ];
                match tokio::time::timeout(timeout, client.invoke(&request)).await {
                    Ok(Ok(reply)) => Some(IncomingResponse {
                        agent_id: agent.id.clone(),
                        identity_hash: agent.identity_hash.clone(),
                        content: reply.content,
                        timestamp: Utc::now().to_rfc3339(),
                    }),
                    Ok(Err(err)) => {
                        log::warn!("agent {} failed this round: {}", agent.id, err);
                        None
                    }
                    Err(_) => {
                        log::warn!("agent {} missed the round deadline", agent.id);
                        None
                    }
                }
            }
        });
        let mut incoming: Vec<IncomingResponse> = futures_util::future::join_all(invocations)
            .await
            .into_iter()
            .flatten()
            .collect();

        // Deterministic chain order: agent id, then arrival.
        incoming.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        let mut accepted = 0usize;
        for response in incoming {
            self.accept_response(session, response)?;
            accepted += 1;
        }

        session.round_count += 1;
        let (consensus, share) = aggregate_consensus(&session.chain, &session.agents, prompt);
        self.audit(
            &session.id,
            "round_complete",
            "allow",
            &format!(
                "round {} accepted {} responses, consensus {} ({:.0}%)",
                session.round_count,
                accepted,
                consensus.as_str(),
                share * 100.0
            ),
        );
        Ok((consensus, share))
    }

    /// Verify an incoming response's identity and append it to the chain.
    /// An identity mismatch is CRITICAL and terminates the session.
    pub fn accept_response(
        &self,
        session: &mut PartySession,
        incoming: IncomingResponse,
    ) -> PartyResult<()> {
        let agent = match session.agents.iter().find(|a| a.id == incoming.agent_id) {
            Some(agent) => agent.clone(),
            None => {
                self.terminate(session, &format!("unknown agent {}", incoming.agent_id));
                return Err(PartyError::IdentityMismatch(incoming.agent_id));
            }
        };
        let matches: bool = agent
            .identity_hash
            .as_bytes()
            .ct_eq(incoming.identity_hash.as_bytes())
            .into();
        if !matches {
            self.terminate(session, &format!("identity mismatch for {}", incoming.agent_id));
            return Err(PartyError::IdentityMismatch(incoming.agent_id));
        }

        let hash = chain_hash(
            &session.last_hash,
            &incoming.agent_id,
            &incoming.content,
            &incoming.timestamp,
        );
        let response = ChainedResponse {
            agent_id: incoming.agent_id,
            agent_name: agent.member.agent_type.clone(),
            display_name: agent.display.clone(),
            icon: String::new(),
            content: incoming.content,
            timestamp: incoming.timestamp,
            hash: hash.clone(),
        };
        self.audit(
            &session.id,
            "response_accepted",
            "allow",
            &format!("{} hash {}", response.agent_id, hash),
        );
        session.chain.push(response);
        session.last_hash = hash;
        Ok(())
    }

    /// Close a session normally.
    pub fn end_session(&self, session: &mut PartySession, reason: &str) {
        session.ended_at = Some(Utc::now());
        self.audit(&session.id, "session_end", "allow", reason);
    }

    /// CRITICAL path: preserve evidence, record the security event, mark
    /// the session dead.
    fn terminate(&self, session: &mut PartySession, reason: &str) {
        session.terminated = true;
        session.ended_at = Some(Utc::now());
        log::error!("party session {} terminated: {}", session.id, reason);
        let record = AuditRecord::new("party_security", "block", reason)
            .with_run(session.id.clone());
        if let Err(err) = self.state.append_audit(&record) {
            log::warn!("failed to audit session termination: {}", err);
        }
        if let Err(err) = self.state.append_security_event(&record) {
            log::warn!("failed to record security event: {}", err);
        }
    }

    fn audit(&self, session_id: &str, event: &str, decision: &str, reason: &str) {
        let record = AuditRecord::new(event, decision, reason).with_run(session_id.to_string());
        if let Err(err) = self.state.append_audit(&record) {
            log::warn!("failed to append party audit record: {}", err);
        }
    }
}

// ── Sidecar memory boundary ───────────────────────────────────────────────

/// Blocks Read/Write/Edit calls whose target lies in another agent's
/// sidecar memory directory. Paths outside the sidecar root are not this
/// hook's business.
pub struct MemoryBoundaryHook {
    sidecars_root: PathBuf,
}

impl MemoryBoundaryHook {
    pub fn new(sidecars_root: impl Into<PathBuf>) -> Self {
        Self {
            sidecars_root: sidecars_root.into(),
        }
    }
}

#[async_trait]
impl Hook for MemoryBoundaryHook {
    fn name(&self) -> &str {
        "memory-boundary"
    }

    fn security_critical(&self) -> bool {
        true
    }

    async fn run(&self, envelope: &HookEnvelope) -> HookResult<HookDecision> {
        let target = envelope
            .tool_input
            .as_ref()
            .and_then(|input| input.get("file_path").or_else(|| input.get("path")))
            .and_then(|p| p.as_str())
            .ok_or("memory boundary hook invoked without a path")?;
        let agent_id = envelope
            .context
            .get("agent_id")
            .and_then(|a| a.as_str())
            .unwrap_or_default();
        match check_sidecar_access(&self.sidecars_root, agent_id, Path::new(target)) {
            Ok(()) => Ok(HookDecision::allow()),
            Err(reason) => Ok(HookDecision::block(reason)),
        }
    }
}

/// Normalized ownership check: a path under the sidecar root must be under
/// the calling agent's own subdirectory.
pub fn check_sidecar_access(
    sidecars_root: &Path,
    agent_id: &str,
    target: &Path,
) -> Result<(), String> {
    let normalized = normalize_lexically(target);
    let root = normalize_lexically(sidecars_root);
    if !normalized.starts_with(&root) {
        return Ok(());
    }
    if agent_id.is_empty() {
        return Err("no agent identity in context for a sidecar access".to_string());
    }
    let own = root.join(agent_id);
    if normalized.starts_with(&own) {
        Ok(())
    } else {
        Err(format!(
            "{} is outside the sidecar owned by {}",
            target.display(),
            agent_id
        ))
    }
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            other => normalized.push(other),
        }
    }
    normalized
}
