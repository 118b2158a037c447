//! The tool contract.
//!
//! Tools are described by data — a descriptor with JSON schemas and a
//! side-effect tag — and invoked through one async trait. There is no
//! runtime introspection: the registry is a plain map of descriptors.
//!
//! Output fields whose `out_schema` property carries `"artifact": true` are
//! extracted to the artifact store by the runtime and replaced with
//! `<artifact:ref>` placeholders in the LLM-visible observation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cancel::CancelToken;
use crate::error::Result;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Side effects
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffects {
    Pure,
    Read,
    Write,
    External,
    Stateful,
}

impl SideEffects {
    /// The default auto-seq policy admits only these.
    pub fn is_read_only(self) -> bool {
        matches!(self, Self::Pure | Self::Read)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Descriptors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Full tool descriptor as the runtime sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's arguments.
    pub args_schema: Value,
    /// JSON Schema for the tool's output.
    pub out_schema: Value,
    pub side_effects: SideEffects,
    /// When true, any error from this tool fails the task instead of being
    /// recorded as a step error.
    #[serde(default)]
    pub fatal_errors: bool,
}

/// Tool definition exposed to the LLM (name + description + parameters).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolSpec {
    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.args_schema.clone(),
        }
    }

    /// Names of output fields marked `"artifact": true` in `out_schema`.
    pub fn artifact_fields(&self) -> Vec<String> {
        self.out_schema
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| {
                props
                    .iter()
                    .filter(|(_, schema)| {
                        schema.get("artifact").and_then(Value::as_bool) == Some(true)
                    })
                    .map(|(name, _)| name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Invocation context + trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Context handed to every tool call. Tools must check `is_cancelled()` at
/// safe boundaries.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub task_id: String,
    pub deadline: Option<DateTime<Utc>>,
    cancel: CancelToken,
}

impl ToolContext {
    pub fn new(
        session_id: impl Into<String>,
        task_id: impl Into<String>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            task_id: task_id.into(),
            deadline: None,
            cancel,
        }
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline.map(|d| Utc::now() >= d).unwrap_or(false)
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }
}

/// A callable tool. Implementations translate `args` (validated against
/// `spec().args_schema` by the caller) into an output value.
#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> &ToolSpec;

    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<Value>;
}
