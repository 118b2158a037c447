//! The state-store protocol.
//!
//! Three operations are required of every store: `save_event`,
//! `load_history`, and `save_remote_binding`. Everything else is optional
//! and capability-gated — a session discovers what its store can do at
//! startup and disables the corresponding features (with a single warning)
//! rather than failing. All writes are idempotent by natural key; `list_*`
//! results ascend by `(ts, id)` and `since` cursors are exclusive.

pub mod gate;
pub mod jsonl;
pub mod memory;
pub mod records;

pub use gate::{Feature, FeatureGate};
pub use jsonl::JsonlStateStore;
pub use memory::MemoryStateStore;
pub use records::{artifact_ref, event_kind, FlowEvent, PauseRecord, RemoteBinding};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use pf_domain::error::{Error, Result};
use pf_domain::steering::SteeringEvent;
use pf_domain::task::TaskState;
use pf_domain::trajectory::Trajectory;
use pf_domain::update::StateUpdate;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Capabilities
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreCapabilities {
    pub planner_state: bool,
    pub memory: bool,
    pub tasks: bool,
    pub updates: bool,
    pub steering: bool,
    pub trajectories: bool,
    pub planner_events: bool,
    pub artifacts: bool,
}

impl StoreCapabilities {
    pub fn all() -> Self {
        Self {
            planner_state: true,
            memory: true,
            tasks: true,
            updates: true,
            steering: true,
            trajectories: true,
            planner_events: true,
            artifacts: true,
        }
    }
}

fn unsupported<T>(op: &str) -> Result<T> {
    Err(Error::Unsupported(format!("store does not implement {op}")))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Protocol
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Unified persistence surface. The store is the only shared mutable
/// resource in the runtime; every method must be safe to call from
/// concurrent tasks.
#[async_trait]
pub trait StateStore: Send + Sync {
    // ── Required: core audit log ───────────────────────────────────

    /// Append to the audit log. Idempotent by `event_id`. A failure here is
    /// surfaced to the caller (it fails the task), unlike optional writes.
    async fn save_event(&self, event: FlowEvent) -> Result<()>;

    /// Full history for a trace, ascending `(ts, event_id)`.
    async fn load_history(&self, trace_id: &str) -> Result<Vec<FlowEvent>>;

    /// Record a transport binding for a session. Idempotent by
    /// `(session_id, transport)`.
    async fn save_remote_binding(&self, binding: RemoteBinding) -> Result<()>;

    /// What the optional surface supports; checked once at session startup.
    fn capabilities(&self) -> StoreCapabilities;

    // ── Optional: pause/resume ─────────────────────────────────────

    async fn save_planner_state(&self, record: PauseRecord) -> Result<()> {
        let _ = record;
        unsupported("save_planner_state")
    }

    /// Load-and-consume a pause record. Returns `None` when the token is
    /// unknown or already consumed (this is what makes resume idempotent).
    async fn consume_planner_state(&self, resume_token: &str) -> Result<Option<PauseRecord>> {
        let _ = resume_token;
        unsupported("consume_planner_state")
    }

    // ── Optional: memory state ─────────────────────────────────────

    async fn save_memory_state(&self, session_id: &str, state: Value) -> Result<()> {
        let _ = (session_id, state);
        unsupported("save_memory_state")
    }

    async fn load_memory_state(&self, session_id: &str) -> Result<Option<Value>> {
        let _ = session_id;
        unsupported("load_memory_state")
    }

    // ── Optional: tasks ────────────────────────────────────────────

    /// Upsert a task record (idempotent by `task_id`, last write wins).
    async fn save_task(&self, task: TaskState) -> Result<()> {
        let _ = task;
        unsupported("save_task")
    }

    async fn list_tasks(&self, session_id: &str) -> Result<Vec<TaskState>> {
        let _ = session_id;
        unsupported("list_tasks")
    }

    // ── Optional: updates ──────────────────────────────────────────

    /// Idempotent by `update_id`.
    async fn save_update(&self, update: StateUpdate) -> Result<()> {
        let _ = update;
        unsupported("save_update")
    }

    /// Updates for a stream, ascending; `since_update_id` is exclusive.
    async fn list_updates(
        &self,
        session_id: &str,
        task_id: &str,
        since_update_id: Option<&str>,
    ) -> Result<Vec<StateUpdate>> {
        let _ = (session_id, task_id, since_update_id);
        unsupported("list_updates")
    }

    // ── Optional: steering ─────────────────────────────────────────

    /// Idempotent by `event_id`.
    async fn save_steering(&self, event: SteeringEvent) -> Result<()> {
        let _ = event;
        unsupported("save_steering")
    }

    async fn list_steering(&self, session_id: &str, task_id: &str) -> Result<Vec<SteeringEvent>> {
        let _ = (session_id, task_id);
        unsupported("list_steering")
    }

    // ── Optional: trajectories ─────────────────────────────────────

    /// Upsert the trajectory for a task (idempotent by `task_id`).
    async fn save_trajectory(&self, task_id: &str, trajectory: &Trajectory) -> Result<()> {
        let _ = (task_id, trajectory);
        unsupported("save_trajectory")
    }

    async fn get_trajectory(&self, task_id: &str) -> Result<Option<Trajectory>> {
        let _ = task_id;
        unsupported("get_trajectory")
    }

    /// Task ids with stored trajectories for a session.
    async fn list_traces(&self, session_id: &str) -> Result<Vec<String>> {
        let _ = session_id;
        unsupported("list_traces")
    }

    // ── Optional: planner events ───────────────────────────────────

    async fn save_planner_event(&self, event: FlowEvent) -> Result<()> {
        let _ = event;
        unsupported("save_planner_event")
    }

    async fn list_planner_events(
        &self,
        trace_id: &str,
        since_event_id: Option<&str>,
    ) -> Result<Vec<FlowEvent>> {
        let _ = (trace_id, since_event_id);
        unsupported("list_planner_events")
    }

    // ── Optional: artifacts ────────────────────────────────────────

    /// Store a blob; returns its content-addressed reference.
    async fn put_artifact(&self, blob: Value) -> Result<String> {
        let _ = blob;
        unsupported("put_artifact")
    }

    async fn get_artifact(&self, artifact_ref: &str) -> Result<Option<Value>> {
        let _ = artifact_ref;
        unsupported("get_artifact")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A store that implements only the required surface.
    struct BareStore;

    #[async_trait]
    impl StateStore for BareStore {
        async fn save_event(&self, _event: FlowEvent) -> Result<()> {
            Ok(())
        }
        async fn load_history(&self, _trace_id: &str) -> Result<Vec<FlowEvent>> {
            Ok(Vec::new())
        }
        async fn save_remote_binding(&self, _binding: RemoteBinding) -> Result<()> {
            Ok(())
        }
        fn capabilities(&self) -> StoreCapabilities {
            StoreCapabilities::default()
        }
    }

    #[tokio::test]
    async fn optional_defaults_are_unsupported() {
        let store = BareStore;
        assert!(matches!(
            store.consume_planner_state("tok").await,
            Err(Error::Unsupported(_))
        ));
        assert!(matches!(
            store.list_tasks("s1").await,
            Err(Error::Unsupported(_))
        ));
        assert!(matches!(
            store.put_artifact(serde_json::json!({})).await,
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn default_capabilities_are_empty() {
        let caps = StoreCapabilities::default();
        assert!(!caps.tasks && !caps.updates && !caps.planner_state);
        let caps = StoreCapabilities::all();
        assert!(caps.tasks && caps.updates && caps.planner_state && caps.artifacts);
    }
}
