//! Inbound steering events — control and context inputs for running tasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SteeringKind {
    UserMessage,
    Redirect,
    InjectContext,
    Cancel,
    Pause,
    Resume,
    Prioritize,
    Approve,
    Reject,
}

impl SteeringKind {
    /// Control events preempt: they always fit in a full inbox and are
    /// applied in arrival order before the next LLM call.
    pub fn is_control(self) -> bool {
        matches!(
            self,
            Self::Cancel | Self::Pause | Self::Resume | Self::Approve | Self::Reject
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SteeringEvent {
    pub session_id: String,
    pub task_id: String,
    pub event_id: String,
    #[serde(rename = "event_type")]
    pub kind: SteeringKind,
    #[serde(default)]
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl SteeringEvent {
    pub fn new(
        session_id: impl Into<String>,
        task_id: impl Into<String>,
        kind: SteeringKind,
        payload: Value,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            task_id: task_id.into(),
            event_id: uuid::Uuid::new_v4().to_string(),
            kind,
            payload,
            created_at: Utc::now(),
        }
    }
}
