//! Context snapshots and merge patches.
//!
//! A snapshot freezes the foreground's LLM-visible context at the moment a
//! background task spawns; it is read-only after creation. Background tasks
//! report back through a `ContextPatch`, merged under an explicit strategy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Merge strategy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Push an entry onto `llm_context.research_results[]`.
    Append,
    /// Upsert a named key; the target key path must already exist.
    Replace,
    /// Queue the patch until an APPROVE steering event references it.
    HumanGated,
}

impl Default for MergeStrategy {
    fn default() -> Self {
        Self::Append
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Memory snapshot
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How the background task sees the session's memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum MemorySnapshot {
    /// No shared memory.
    Isolated,
    /// A copy-on-write branch of the memory backend.
    Branch { branch_id: String },
    /// A pre-rendered summary string.
    Summary { summary: String },
}

impl Default for MemorySnapshot {
    fn default() -> Self {
        Self::Isolated
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Snapshot
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskContextSnapshot {
    /// Deep-cloned LLM context; must round-trip through JSON.
    pub llm_context: Value,
    /// Tool-context handle names (never raw objects).
    #[serde(default)]
    pub tool_context: Vec<String>,
    #[serde(default)]
    pub memory: MemorySnapshot,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spawned_from_task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spawned_from_event_id: Option<String>,
    pub spawned_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spawn_reason: Option<String>,
}

impl TaskContextSnapshot {
    /// Freeze a context by forcing it through JSON serialization. Rejects
    /// values that do not round-trip (the frozen copy must be detached from
    /// any live structure).
    pub fn freeze(
        llm_context: &Value,
        tool_context: Vec<String>,
        memory: MemorySnapshot,
        artifacts: Vec<String>,
    ) -> Result<Self> {
        let serialized = serde_json::to_string(llm_context)
            .map_err(|e| Error::Validation(format!("llm_context not serializable: {e}")))?;
        let frozen: Value = serde_json::from_str(&serialized)
            .map_err(|e| Error::Validation(format!("llm_context does not round-trip: {e}")))?;
        Ok(Self {
            llm_context: frozen,
            tool_context,
            memory,
            artifacts,
            spawned_from_task_id: None,
            spawned_from_event_id: None,
            spawned_at: Utc::now(),
            spawn_reason: None,
        })
    }

    /// An empty snapshot for tasks spawned with no foreground context.
    pub fn empty() -> Self {
        Self {
            llm_context: Value::Object(Map::new()),
            tool_context: Vec::new(),
            memory: MemorySnapshot::Isolated,
            artifacts: Vec::new(),
            spawned_from_task_id: None,
            spawned_from_event_id: None,
            spawned_at: Utc::now(),
            spawn_reason: None,
        }
    }

    pub fn with_provenance(
        mut self,
        task_id: impl Into<String>,
        event_id: impl Into<String>,
        reason: Option<String>,
    ) -> Self {
        self.spawned_from_task_id = Some(task_id.into());
        self.spawned_from_event_id = Some(event_id.into());
        self.spawn_reason = reason;
        self
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Context patch
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The merge payload a finished background task sends to the foreground.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextPatch {
    pub patch_id: String,
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spawned_from_event_id: Option<String>,
    pub completed_at: DateTime<Utc>,
    #[serde(default)]
    pub digest: Vec<String>,
    #[serde(default)]
    pub facts: Map<String, Value>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub assumptions: Vec<String>,
    #[serde(default)]
    pub recommended_next_steps: Vec<String>,
}

impl ContextPatch {
    pub fn new(task_id: impl Into<String>, spawned_from_event_id: Option<String>) -> Self {
        Self {
            patch_id: Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            spawned_from_event_id,
            completed_at: Utc::now(),
            digest: Vec::new(),
            facts: Map::new(),
            artifacts: Vec::new(),
            sources: Vec::new(),
            assumptions: Vec::new(),
            recommended_next_steps: Vec::new(),
        }
    }

    /// The entry pushed onto `research_results[]` under the append strategy.
    pub fn as_append_entry(&self) -> Value {
        serde_json::json!({
            "patch_id": self.patch_id,
            "task_id": self.task_id,
            "ts": self.completed_at,
            "digest": self.digest,
            "facts": self.facts,
            "sources": self.sources,
            "artifacts": self.artifacts,
        })
    }
}
