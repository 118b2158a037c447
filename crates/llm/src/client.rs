//! The abstract LLM client contract.
//!
//! Provider wire adapters (OpenAI-compat, Anthropic, Bedrock, …) live
//! outside this workspace; they implement [`LlmClient`] and translate these
//! request/response types to their wire format.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use pf_domain::cancel::CancelToken;
use pf_domain::error::Result;
use pf_domain::message::Message;
use pf_domain::stream::{StreamEvent, Usage};
use pf_domain::tool::ToolDefinition;

use crate::profile::ModelProfile;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / Response types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Native structured-output request: the provider constrains generation to
/// this schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredOutputSpec {
    pub name: String,
    pub json_schema: Value,
    pub strict: bool,
}

/// Which tool, if any, the provider must call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum ToolChoice {
    Auto,
    Required,
    Tool { name: String },
}

/// A provider-agnostic completion request.
#[derive(Debug, Clone, Default)]
pub struct LlmRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub structured_output: Option<StructuredOutputSpec>,
    pub tool_choice: Option<ToolChoice>,
    /// Model override. `None` = the client's default model.
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// A provider-agnostic completion response, normalized to typed content
/// parts.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub message: Message,
    pub usage: Usage,
    /// Out-of-band reasoning content, when the provider surfaces it.
    pub reasoning_content: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Trait every LLM adapter must implement.
///
/// `complete` must respect `timeout` and observe `cancel` at its suspension
/// points; when `stream` is provided, raw body tokens and reasoning deltas
/// are forwarded as [`StreamEvent`]s while the call is in flight.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(
        &self,
        req: LlmRequest,
        timeout: Duration,
        cancel: CancelToken,
        stream: Option<mpsc::Sender<StreamEvent>>,
    ) -> Result<CompletionResponse>;

    /// Structured-output capabilities of the default model.
    fn profile(&self) -> &ModelProfile;

    /// Default model identifier (used for pricing lookups).
    fn model_id(&self) -> &str;
}
