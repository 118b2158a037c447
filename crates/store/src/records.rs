//! Persisted record shapes: the append-only event log, pause records, and
//! remote bindings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event log
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Well-known event kinds of the lifecycle log.
pub mod event_kind {
    pub const TASK_CREATED: &str = "task.created";
    pub const TASK_STATUS_CHANGED: &str = "task.status_changed";
    pub const TASK_PROGRESS: &str = "task.progress";
    pub const TASK_RESULT_READY: &str = "task.result_ready";
    pub const TASK_CONTEXT_PATCH_READY: &str = "task.context_patch_ready";
    pub const TASK_CONTEXT_PATCH_APPLIED: &str = "task.context_patch_applied";
    pub const TASK_STEERING_RECEIVED: &str = "task.steering_received";
    pub const TASK_CONTROL_REQUESTED: &str = "task.control_requested";
    pub const TASK_CONTROL_CONFIRMED: &str = "task.control_confirmed";
}

/// One append-only event-log row. Replay by `trace_id` reconstructs state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowEvent {
    pub trace_id: String,
    /// Unique row id — the idempotence key for writes.
    pub event_id: String,
    pub ts: DateTime<Utc>,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    #[serde(default, rename = "payload_json")]
    pub payload: Value,
}

impl FlowEvent {
    pub fn new(trace_id: impl Into<String>, kind: impl Into<String>, payload: Value) -> Self {
        Self {
            trace_id: trace_id.into(),
            event_id: Uuid::new_v4().to_string(),
            ts: Utc::now(),
            kind: kind.into(),
            node_id: None,
            node_name: None,
            payload,
        }
    }

    pub fn with_node(
        mut self,
        node_id: impl Into<String>,
        node_name: impl Into<String>,
    ) -> Self {
        self.node_id = Some(node_id.into());
        self.node_name = Some(node_name.into());
        self
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pause records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Durable pause state keyed by a resume token. Consumption is
/// at-most-once: resuming with the same token twice is a no-op the second
/// time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PauseRecord {
    pub resume_token: String,
    pub session_id: String,
    pub task_id: String,
    /// Serialized trajectory at the pause point.
    pub trajectory: Value,
    /// Serialized constraint state (budget spent, deadline, hop count).
    #[serde(default)]
    pub constraints: Value,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub consumed: bool,
}

impl PauseRecord {
    pub fn new(
        session_id: impl Into<String>,
        task_id: impl Into<String>,
        trajectory: Value,
        constraints: Value,
    ) -> Self {
        Self {
            resume_token: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            task_id: task_id.into(),
            trajectory,
            constraints,
            created_at: Utc::now(),
            consumed: false,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Remote bindings
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Maps a session to whatever identity the embedding transport assigned it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteBinding {
    pub session_id: String,
    pub remote_id: String,
    pub transport: String,
    pub created_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Artifact refs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Content-addressed artifact reference: FNV-1a over the canonical JSON.
/// Equal payloads always produce equal refs, which is what makes artifact
/// writes idempotent.
pub fn artifact_ref(value: &Value) -> String {
    let canonical = serde_json::to_string(value).unwrap_or_default();
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in canonical.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    format!("art-{hash:016x}")
}
