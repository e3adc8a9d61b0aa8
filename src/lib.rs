// src/lib.rs

// Import the top-level `maestro` module.
pub mod maestro;

// Re-exporting key items for easier external access.
pub use maestro::client::{self, AgentClient, AgentReply, Message, Role, Usage};
pub use maestro::config::{self, RuntimeConfig};
pub use maestro::dispatch::{self, AgentTask, Dispatcher};
pub use maestro::event::{self, EventHandler, RuntimeEvent};
pub use maestro::hooks::{self, HookPipeline};
pub use maestro::knowledge::{self, KnowledgeIndex};
pub use maestro::memory::{self, MemoryStore};
pub use maestro::party::{self, PartyCoordinator};
pub use maestro::paths::{self, Resolver};
pub use maestro::router::{self, Router};
pub use maestro::state::{self, StateStore};
pub use maestro::supervisor::{self, Supervisor};
pub use maestro::tasks::{self, TaskStore};
pub use maestro::telemetry::{self, Telemetry};
pub use maestro::validators::{self, ValidatorRegistry};
pub use maestro::workflow::{self, WorkflowExecutor};
