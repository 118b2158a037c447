//! Outbound state updates — the ordered observer stream for one task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::task::TaskStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateType {
    Thinking,
    Progress,
    ToolCall,
    Result,
    Error,
    Checkpoint,
    StatusChange,
    Notification,
    ArtifactChunk,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateUpdate {
    pub session_id: String,
    pub task_id: String,
    /// Unique per `(session_id, task_id)`; zero-padded sequence numbers so
    /// lexicographic order equals emission order (the replay cursor relies
    /// on this).
    pub update_id: String,
    pub update_type: UpdateType,
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_steps: Option<usize>,
    pub created_at: DateTime<Utc>,
}

impl StateUpdate {
    /// Updates that must never be dropped under backpressure: RESULT,
    /// ERROR, NOTIFICATION, and terminal STATUS_CHANGE.
    pub fn is_critical(&self) -> bool {
        match self.update_type {
            UpdateType::Result | UpdateType::Error | UpdateType::Notification => true,
            UpdateType::StatusChange => self
                .content
                .get("status")
                .and_then(|s| serde_json::from_value::<TaskStatus>(s.clone()).ok())
                .map(|s| s.is_terminal())
                .unwrap_or(false),
            _ => false,
        }
    }
}
