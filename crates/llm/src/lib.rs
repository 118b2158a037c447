//! LLM access layer: the abstract client contract, per-model schema
//! planning, the retrying invoker that turns completions into planner
//! actions, and the streaming answer extractor.
//!
//! No provider wire adapter lives here — embedders implement [`LlmClient`]
//! for their provider of choice.

pub mod client;
pub mod extract;
pub mod invoker;
pub mod profile;
pub mod schema;

pub use client::{CompletionResponse, LlmClient, LlmRequest, StructuredOutputSpec, ToolChoice};
pub use extract::{ExtractEvent, StreamingExtractor};
pub use invoker::{InvokeOutcome, Invoker};
pub use profile::ModelProfile;
pub use schema::{plan_schema, select_mode, validate_value, OutputMode, SchemaPlan};
