//! The LLM invoker — one `call()` that turns a conversation into a
//! validated [`PlannerAction`].
//!
//! The invoker picks an output mode from the schema plan, builds the
//! request, and runs the retry loop: invalid structured output is answered
//! with a corrective user message and re-invoked; transient transport
//! errors back off briefly; context-length errors return immediately so
//! the recovery layer can compress the trajectory before the caller
//! retries. Cost accumulates across every attempt.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;

use pf_domain::action::PlannerAction;
use pf_domain::cancel::CancelToken;
use pf_domain::config::PricingConfig;
use pf_domain::error::{Error, ErrorClass, Result};
use pf_domain::message::Message;
use pf_domain::stream::{StreamEvent, Usage};

use crate::client::{LlmClient, LlmRequest, StructuredOutputSpec, ToolChoice};
use crate::schema::{plan_schema, select_mode, validate_value, OutputMode, SchemaPlan};

/// Name of the structured-output spec / forced tool carrying the action.
const ACTION_CHANNEL: &str = "planner_action";

const TRANSPORT_BACKOFF_BASE_MS: u64 = 250;
const TRANSPORT_BACKOFF_CAP_MS: u64 = 4_000;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Outcome
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct InvokeOutcome {
    pub action: PlannerAction,
    pub reasoning: Option<String>,
    pub cost_usd: f64,
    pub usage: Usage,
    pub attempts: u32,
    pub mode: OutputMode,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Invoker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Invoker {
    client: Arc<dyn LlmClient>,
    pricing: PricingConfig,
    max_retries: usize,
}

impl Invoker {
    pub fn new(client: Arc<dyn LlmClient>, pricing: PricingConfig, max_retries: usize) -> Self {
        Self {
            client,
            pricing,
            max_retries,
        }
    }

    pub fn client(&self) -> &Arc<dyn LlmClient> {
        &self.client
    }

    /// One planner step: request → parse → validate, with retries.
    pub async fn call(
        &self,
        messages: Vec<Message>,
        response_schema: &Value,
        requested_mode: Option<OutputMode>,
        timeout: Duration,
        cancel: &CancelToken,
        stream: Option<mpsc::Sender<StreamEvent>>,
    ) -> Result<InvokeOutcome> {
        let plan = plan_schema(response_schema, self.client.profile());
        let mode = select_mode(&plan, requested_mode);
        let mut req = self.build_request(messages, &plan, mode);

        let mut total_usage = Usage::default();
        let mut cost_usd = 0.0;
        let mut attempts: u32 = 0;
        let mut last_invalid: Option<Error> = None;

        while attempts <= self.max_retries as u32 {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled("invoker".into()));
            }
            attempts += 1;

            let resp = match self
                .client
                .complete(req.clone(), timeout, cancel.clone(), stream.clone())
                .await
            {
                Ok(resp) => resp,
                Err(e) => match e.class() {
                    ErrorClass::RetryableTransport if attempts <= self.max_retries as u32 => {
                        let delay = (TRANSPORT_BACKOFF_BASE_MS << (attempts - 1))
                            .min(TRANSPORT_BACKOFF_CAP_MS);
                        tracing::warn!(
                            error = %e,
                            attempt = attempts,
                            delay_ms = delay,
                            "llm transport error, backing off"
                        );
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        continue;
                    }
                    _ => return Err(e),
                },
            };

            total_usage.add(&resp.usage);
            cost_usd += self.pricing.estimate_cost(
                req.model.as_deref().unwrap_or_else(|| self.client.model_id()),
                resp.usage.input_tokens,
                resp.usage.output_tokens,
            );

            let reasoning = resp.reasoning_content.clone();
            match self.parse_action(&resp.message, &plan, mode) {
                Ok(action) => {
                    return Ok(InvokeOutcome {
                        action,
                        reasoning,
                        cost_usd,
                        usage: total_usage,
                        attempts,
                        mode,
                    });
                }
                Err(e) if e.retryable() && attempts <= self.max_retries as u32 => {
                    tracing::debug!(error = %e, attempt = attempts, "invalid action, retrying");
                    req.messages.push(Message::assistant(
                        resp.message.content.extract_all_text(),
                    ));
                    req.messages.push(Message::user(format!(
                        "Your previous response was not a valid action: {e}. \
                         Respond again with a single JSON object matching the required \
                         schema, with exactly the fields `next_node` and `args`."
                    )));
                    last_invalid = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_invalid
            .unwrap_or_else(|| Error::Validation("structured output retries exhausted".into())))
    }

    fn build_request(
        &self,
        mut messages: Vec<Message>,
        plan: &SchemaPlan,
        mode: OutputMode,
    ) -> LlmRequest {
        let mut req = LlmRequest {
            messages: Vec::new(),
            tools: Vec::new(),
            structured_output: None,
            tool_choice: None,
            model: None,
            temperature: Some(0.2),
            max_tokens: None,
        };
        match mode {
            OutputMode::Native => {
                req.structured_output = Some(StructuredOutputSpec {
                    name: ACTION_CHANNEL.into(),
                    json_schema: plan.transformed_schema.clone(),
                    strict: plan.strict_applied,
                });
            }
            OutputMode::Tools => {
                req.tools = vec![pf_domain::tool::ToolDefinition {
                    name: ACTION_CHANNEL.into(),
                    description: "Report the next planner action.".into(),
                    parameters: plan.transformed_schema.clone(),
                }];
                req.tool_choice = Some(ToolChoice::Tool {
                    name: ACTION_CHANNEL.into(),
                });
            }
            OutputMode::Prompted => {
                messages.push(Message::system(format!(
                    "Respond with a single JSON object and nothing else. The object \
                     must match this JSON schema:\n{}",
                    plan.transformed_schema
                )));
            }
        }
        req.messages = messages;
        req
    }

    fn parse_action(
        &self,
        message: &Message,
        plan: &SchemaPlan,
        mode: OutputMode,
    ) -> Result<PlannerAction> {
        let value = match mode {
            OutputMode::Tools => match message.content.first_tool_use() {
                Some((_, name, input)) if name == ACTION_CHANNEL => input.clone(),
                Some((_, name, _)) => {
                    return Err(Error::Parse(format!("unexpected tool call {name}")))
                }
                // Some providers answer in text even under forced tools.
                None => extract_json_object(&message.content.extract_all_text())?,
            },
            OutputMode::Native | OutputMode::Prompted => {
                extract_json_object(&message.content.extract_all_text())?
            }
        };

        if let Err(violations) = validate_value(&value, &plan.transformed_schema) {
            return Err(Error::Validation(violations.join("; ")));
        }
        serde_json::from_value(value).map_err(|e| Error::Validation(format!("action shape: {e}")))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Pull the first balanced JSON object out of free text (models wrap JSON
/// in prose or code fences more often than not).
pub fn extract_json_object(text: &str) -> Result<Value> {
    let start = text
        .find('{')
        .ok_or_else(|| Error::Parse("no JSON object in response".into()))?;

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &text[start..start + i + 1];
                    return serde_json::from_str(candidate)
                        .map_err(|e| Error::Parse(format!("invalid JSON object: {e}")));
                }
            }
            _ => {}
        }
    }
    Err(Error::Parse("unbalanced JSON object in response".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    use crate::client::CompletionResponse;
    use crate::profile::ModelProfile;
    use pf_domain::message::{ContentPart, MessageContent};

    /// Scripted client: pops one canned result per call.
    struct ScriptedClient {
        profile: ModelProfile,
        script: Mutex<Vec<Result<CompletionResponse>>>,
        calls: Mutex<Vec<LlmRequest>>,
    }

    impl ScriptedClient {
        fn new(profile: ModelProfile, script: Vec<Result<CompletionResponse>>) -> Self {
            Self {
                profile,
                script: Mutex::new(script),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedClient {
        async fn complete(
            &self,
            req: LlmRequest,
            _timeout: Duration,
            _cancel: CancelToken,
            _stream: Option<mpsc::Sender<StreamEvent>>,
        ) -> Result<CompletionResponse> {
            self.calls.lock().push(req);
            let mut script = self.script.lock();
            if script.is_empty() {
                return Err(Error::Other("script exhausted".into()));
            }
            script.remove(0)
        }

        fn profile(&self) -> &ModelProfile {
            &self.profile
        }

        fn model_id(&self) -> &str {
            "test-model"
        }
    }

    fn text_response(text: &str) -> CompletionResponse {
        CompletionResponse {
            message: Message::assistant(text),
            usage: Usage { input_tokens: 100, output_tokens: 50, total_tokens: 150 },
            reasoning_content: Some("because".into()),
        }
    }

    fn tool_response(input: Value) -> CompletionResponse {
        CompletionResponse {
            message: Message {
                role: pf_domain::message::Role::Assistant,
                content: MessageContent::Parts(vec![ContentPart::ToolUse {
                    id: "c1".into(),
                    name: ACTION_CHANNEL.into(),
                    input,
                }]),
            },
            usage: Usage { input_tokens: 80, output_tokens: 20, total_tokens: 100 },
            reasoning_content: None,
        }
    }

    fn action_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "next_node": {"type": "string"},
                "args": {"type": "object"}
            },
            "required": ["next_node", "args"]
        })
    }

    fn pricing() -> PricingConfig {
        let mut cfg = PricingConfig::default();
        cfg.models.insert(
            "test-model".into(),
            pf_domain::config::ModelPricing { input_per_1k: 1.0, output_per_1k: 2.0 },
        );
        cfg
    }

    #[tokio::test]
    async fn parses_native_text_action() {
        let client = Arc::new(ScriptedClient::new(
            ModelProfile::strict_native("x"),
            vec![Ok(text_response(
                r#"{"next_node": "search", "args": {"q": "rust"}}"#,
            ))],
        ));
        let invoker = Invoker::new(client, pricing(), 2);
        let out = invoker
            .call(
                vec![Message::user("go")],
                &action_schema(),
                None,
                Duration::from_secs(5),
                &CancelToken::new(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(out.action.next_node, "search");
        assert_eq!(out.mode, OutputMode::Native);
        assert_eq!(out.attempts, 1);
        assert_eq!(out.reasoning.as_deref(), Some("because"));
        // 100 in @ 1.0/1k + 50 out @ 2.0/1k
        assert!((out.cost_usd - 0.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn parses_tool_call_action() {
        let client = Arc::new(ScriptedClient::new(
            ModelProfile::tools_only("x"),
            vec![Ok(tool_response(json!({"next_node": "triage", "args": {}})))],
        ));
        let invoker = Invoker::new(client, PricingConfig::default(), 2);
        let out = invoker
            .call(
                vec![Message::user("go")],
                &action_schema(),
                None,
                Duration::from_secs(5),
                &CancelToken::new(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(out.mode, OutputMode::Tools);
        assert_eq!(out.action.next_node, "triage");
    }

    #[tokio::test]
    async fn retries_invalid_output_with_feedback() {
        let client = Arc::new(ScriptedClient::new(
            ModelProfile::strict_native("x"),
            vec![
                Ok(text_response(r#"{"wrong": true}"#)),
                Ok(text_response(r#"{"next_node": "search", "args": {}}"#)),
            ],
        ));
        let invoker = Invoker::new(client.clone(), PricingConfig::default(), 2);
        let out = invoker
            .call(
                vec![Message::user("go")],
                &action_schema(),
                None,
                Duration::from_secs(5),
                &CancelToken::new(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(out.attempts, 2);

        // Second request must carry the corrective user message.
        let calls = client.calls.lock();
        let last = calls.last().unwrap();
        let text = last.messages.last().unwrap().content.extract_all_text();
        assert!(text.contains("not a valid action"));
    }

    #[tokio::test]
    async fn cost_accumulates_across_attempts() {
        let client = Arc::new(ScriptedClient::new(
            ModelProfile::strict_native("x"),
            vec![
                Ok(text_response("not json at all")),
                Ok(text_response(r#"{"next_node": "a", "args": {}}"#)),
            ],
        ));
        let invoker = Invoker::new(client, pricing(), 2);
        let out = invoker
            .call(
                vec![Message::user("go")],
                &action_schema(),
                None,
                Duration::from_secs(5),
                &CancelToken::new(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(out.usage.total_tokens, 300);
        assert!((out.cost_usd - 0.4).abs() < 1e-9);
    }

    #[tokio::test]
    async fn retries_exhausted_surfaces_validation() {
        let client = Arc::new(ScriptedClient::new(
            ModelProfile::strict_native("x"),
            vec![
                Ok(text_response(r#"{"bad": 1}"#)),
                Ok(text_response(r#"{"bad": 2}"#)),
            ],
        ));
        let invoker = Invoker::new(client, PricingConfig::default(), 1);
        let err = invoker
            .call(
                vec![Message::user("go")],
                &action_schema(),
                None,
                Duration::from_secs(5),
                &CancelToken::new(),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn context_length_returns_immediately() {
        let client = Arc::new(ScriptedClient::new(
            ModelProfile::strict_native("x"),
            vec![
                Err(Error::ContextLengthExceeded("too big".into())),
                Ok(text_response(r#"{"next_node": "a", "args": {}}"#)),
            ],
        ));
        let invoker = Invoker::new(client, PricingConfig::default(), 3);
        let err = invoker
            .call(
                vec![Message::user("go")],
                &action_schema(),
                None,
                Duration::from_secs(5),
                &CancelToken::new(),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ContextLengthExceeded(_)));
    }

    #[tokio::test]
    async fn transport_errors_back_off_then_succeed() {
        let client = Arc::new(ScriptedClient::new(
            ModelProfile::strict_native("x"),
            vec![
                Err(Error::LlmRateLimit("slow down".into())),
                Ok(text_response(r#"{"next_node": "a", "args": {}}"#)),
            ],
        ));
        let invoker = Invoker::new(client, PricingConfig::default(), 2);
        let out = invoker
            .call(
                vec![Message::user("go")],
                &action_schema(),
                None,
                Duration::from_secs(5),
                &CancelToken::new(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(out.attempts, 2);
    }

    #[tokio::test]
    async fn auth_error_is_fatal() {
        let client = Arc::new(ScriptedClient::new(
            ModelProfile::strict_native("x"),
            vec![Err(Error::LlmAuth("bad key".into()))],
        ));
        let invoker = Invoker::new(client, PricingConfig::default(), 3);
        let err = invoker
            .call(
                vec![Message::user("go")],
                &action_schema(),
                None,
                Duration::from_secs(5),
                &CancelToken::new(),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LlmAuth(_)));
    }

    #[tokio::test]
    async fn cancelled_before_call() {
        let client = Arc::new(ScriptedClient::new(ModelProfile::strict_native("x"), vec![]));
        let invoker = Invoker::new(client, PricingConfig::default(), 3);
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = invoker
            .call(
                vec![Message::user("go")],
                &action_schema(),
                None,
                Duration::from_secs(5),
                &cancel,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
    }

    // ── extract_json_object ────────────────────────────────────────

    #[test]
    fn extracts_from_prose() {
        let v = extract_json_object("Sure! Here is the action: {\"a\": 1} hope it helps").unwrap();
        assert_eq!(v, json!({"a": 1}));
    }

    #[test]
    fn extracts_from_code_fence() {
        let v = extract_json_object("```json\n{\"a\": {\"b\": \"}\"}}\n```").unwrap();
        assert_eq!(v, json!({"a": {"b": "}"}}));
    }

    #[test]
    fn no_object_is_parse_error() {
        assert!(matches!(
            extract_json_object("no json here"),
            Err(Error::Parse(_))
        ));
    }

    #[test]
    fn unbalanced_is_parse_error() {
        assert!(matches!(
            extract_json_object("{\"a\": {"),
            Err(Error::Parse(_))
        ));
    }
}
