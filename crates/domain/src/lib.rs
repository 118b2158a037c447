//! Shared domain types for the PenguiFlow planner runtime.
//!
//! Everything here is transport-agnostic and provider-agnostic: actions,
//! trajectories, task lifecycle records, steering events, outbound state
//! updates, context snapshots, group records, the tool contract, and the
//! shared error/config/trace surfaces the other crates build on.

pub mod action;
pub mod cancel;
pub mod config;
pub mod error;
pub mod group;
pub mod message;
pub mod snapshot;
pub mod steering;
pub mod stream;
pub mod task;
pub mod tool;
pub mod trace;
pub mod trajectory;
pub mod update;

pub use action::{FinalArgs, PlanArgs, PlanJoin, PlanStep, PlannerAction, TaskArgs};
pub use cancel::CancelToken;
pub use error::{Error, ErrorClass, Result};
pub use group::{GroupStatus, ReportStrategy, TaskGroup};
pub use message::{ContentPart, Message, MessageContent, Role};
pub use snapshot::{ContextPatch, MemorySnapshot, MergeStrategy, TaskContextSnapshot};
pub use steering::{SteeringEvent, SteeringKind};
pub use task::{TaskSpawnSpec, TaskState, TaskStatus, TaskType};
pub use tool::{SideEffects, Tool, ToolContext, ToolDefinition, ToolSpec};
pub use trajectory::{Trajectory, TrajectoryStep};
pub use update::{StateUpdate, UpdateType};
