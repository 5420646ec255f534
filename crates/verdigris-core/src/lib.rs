pub mod gateway;
pub mod report;
pub mod session;
pub mod session_key;
pub mod subagent;
pub mod tools;

// Re-export key types
pub use gateway::{Gateway, RunStatus, RunWait, SessionMessage, StartRun, ThinkLevel, ToolOverrides};
pub use report::{CompletionReport, CompletionReportBook};
pub use session::{FileSessionStore, SessionPatch, SessionStore};
pub use subagent::mediator::OrchestratorMediator;
pub use subagent::registry::{JsonSnapshotStore, NullSnapshotStore, RunRegistry, SubagentRun};
pub use subagent::spawn::{SpawnAccepted, SpawnError, SpawnRequest, SubagentOrchestrator};
pub use subagent::verification::VerificationContract;
pub use tools::ToolRegistry;
