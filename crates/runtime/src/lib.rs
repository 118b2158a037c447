//! The PenguiFlow planner runtime.
//!
//! A session-scoped control plane for LLM agents: the plan→act→observe
//! planner loop, per-task steering inboxes, a task registry with lifecycle
//! and limits, context snapshots with explicit merges, task groups,
//! recovery (compression/backoff), a replayable event sink, and the
//! per-session single-writer coordinator that ties them together.
//!
//! LLM providers, tool implementations, transports, and durable stores are
//! external collaborators injected through the contracts in `pf-llm`,
//! `pf-domain`, and `pf-store`.

pub mod cancel;
pub mod coordinator;
pub mod groups;
pub mod inbox;
pub mod planner;
pub mod recovery;
pub mod registry;
pub mod sink;
pub mod snapshot;
pub mod tools;

pub use cancel::CancelMap;
pub use coordinator::{SessionCoordinator, SpawnRequest, FOREGROUND_TASK};
pub use groups::{GroupRegistry, GroupReport};
pub use inbox::{InboxMap, SteeringInbox};
pub use planner::{action_schema, FinishReason, PlannerRuntime, RuntimeContext, TaskRun};
pub use recovery::{ObservationSummarizer, RecoveryPolicy, TruncatingSummarizer};
pub use registry::{SpawnOutcome, TaskRegistry};
pub use sink::EventSink;
pub use snapshot::{freeze_snapshot, MergeDirective, MergeEngine, MergeOutcome};
pub use tools::ToolRegistry;
