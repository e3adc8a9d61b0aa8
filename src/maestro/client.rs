//! Shared primitives for the opaque agent-invocation boundary.
//!
//! The runtime never talks to an LLM vendor directly. Everything that needs a
//! model response (the router's cheap classifier, workflow steps, party-mode
//! debaters, supervised workers) goes through the [`AgentClient`] trait. The
//! supporting structs describe chat messages, native tool-call requests, and
//! token accounting.
//!
//! Inference itself lives outside this crate: production deployments plug in a
//! vendor client, tests plug in mocks. The runtime only decides *which* model
//! tier is used and routes every tool call the reply requests through the hook
//! pipeline before execution.
//!
//! # Basic request/response
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use maestro::client::{AgentClient, Message, Role};
//!
//! # async fn demo(client: Arc<dyn AgentClient>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let reply = client
//!     .invoke(&[Message {
//!         role: Role::User,
//!         content: Arc::from("Classify this prompt."),
//!     }])
//!     .await?;
//!
//! println!("{} ({:?})", reply.content, reply.finish_reason);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::sync::Arc;

/// Role of a chat message sent to or received from an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// System instructions (persona, task template, injected skills).
    System,
    /// Content originating from the user or the orchestrator.
    User,
    /// Content produced by the agent.
    Assistant,
    /// A tool result being fed back into the conversation.
    Tool,
}

/// A single chat message.
///
/// Content is stored as `Arc<str>` so messages can be shared between the
/// coordinator, workers, and telemetry without copying large prompts.
#[derive(Debug, Clone)]
pub struct Message {
    /// Who produced this message.
    pub role: Role,
    /// The message text.
    pub content: Arc<str>,
}

impl Message {
    /// Build a message from a role and anything string-like.
    pub fn new(role: Role, content: impl AsRef<str>) -> Self {
        Self {
            role,
            content: Arc::from(content.as_ref()),
        }
    }
}

/// Token accounting reported by the inference provider for one invocation.
///
/// # Example
///
/// ```rust
/// use maestro::client::Usage;
///
/// let usage = Usage { input_tokens: 1200, output_tokens: 340 };
/// assert_eq!(usage.total(), 1540);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens consumed by the prompt.
    pub input_tokens: u64,
    /// Tokens produced in the completion.
    pub output_tokens: u64,
}

impl Usage {
    /// Sum of input and output tokens.
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Accumulate another usage record into this one.
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// A tool call requested by the agent in its reply.
///
/// The runtime routes each request through the hook pipeline; only calls that
/// survive every `PreToolUse` hook are executed.
///
/// # Example
///
/// ```rust
/// use maestro::client::ToolCallRequest;
///
/// let call = ToolCallRequest {
///     id: "call_01".to_string(),
///     name: "Bash".to_string(),
///     arguments: serde_json::json!({"command": "ls -la"}),
/// };
/// assert_eq!(call.name, "Bash");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Provider-assigned call id, used to correlate the tool result.
    pub id: String,
    /// Tool name, matched against the agent's allowed tool list.
    pub name: String,
    /// Parsed JSON arguments supplied by the agent.
    pub arguments: serde_json::Value,
}

/// Why the provider stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinishReason {
    /// Natural end of the reply.
    Stop,
    /// The reply requests one or more tool calls.
    ToolUse,
    /// The provider truncated at its output limit.
    Length,
    /// The provider reported an error mid-generation.
    Error,
}

/// The reply returned by one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentReply {
    /// Final text content of the reply.
    pub content: String,
    /// Tool calls the agent wants executed, in request order.
    pub tool_calls: Vec<ToolCallRequest>,
    /// Token accounting, when the provider reports it.
    pub usage: Option<Usage>,
    /// Why generation stopped.
    pub finish_reason: FinishReason,
}

impl AgentReply {
    /// A plain text reply with no tool calls, as mocks and simple paths
    /// produce it.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: Vec::new(),
            usage: None,
            finish_reason: FinishReason::Stop,
        }
    }
}

/// Result alias used across the invocation boundary.
pub type ClientResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

/// The opaque inference seam.
///
/// Implementations wrap a concrete vendor client for one model. The runtime
/// owns model selection: the router holds a cheap-tier client, workflow steps
/// hold the expensive tier, and the supervisor hands each worker the client
/// its task envelope names.
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Send the conversation so far and wait for one reply.
    async fn invoke(&self, messages: &[Message]) -> ClientResult<AgentReply>;

    /// Identifier of the underlying model (e.g. `"haiku-fast"`), used as the
    /// pricing-table key for cost accounting.
    fn model_name(&self) -> &str;
}

/// Convenience: any `Arc<dyn AgentClient>` is itself usable where a client is
/// expected.
#[async_trait]
impl AgentClient for Arc<dyn AgentClient> {
    async fn invoke(&self, messages: &[Message]) -> ClientResult<AgentReply> {
        (**self).invoke(messages).await
    }

    fn model_name(&self) -> &str {
        (**self).model_name()
    }
}
