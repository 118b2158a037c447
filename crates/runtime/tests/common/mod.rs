//! Shared test doubles: a scripted LLM client, canned tools, and a
//! fully wired runtime over the in-memory store.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify};

use pf_domain::cancel::CancelToken;
use pf_domain::config::FlowConfig;
use pf_domain::error::{Error, Result};
use pf_domain::message::Message;
use pf_domain::stream::{StreamEvent, Usage};
use pf_domain::task::{TaskStatus, TaskType};
use pf_domain::tool::{SideEffects, Tool, ToolContext, ToolSpec};
use pf_domain::update::StateUpdate;

use pf_llm::client::{CompletionResponse, LlmClient, LlmRequest};
use pf_llm::profile::ModelProfile;

use pf_store::MemoryStateStore;

use pf_runtime::{RuntimeContext, ToolRegistry};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scripted LLM client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub enum ScriptItem {
    /// Return this action object as the response text.
    Action(Value),
    /// Return raw text.
    Text(String),
    /// Stream the serialized action through the stream hook in chunks,
    /// then return it as the response text.
    Streamed { value: Value, chunk_bytes: usize },
    /// Fail the call.
    Fail(Error),
}

pub struct ScriptEntry {
    /// Only consumed when some message in the request contains this
    /// substring (multi-task tests route on the task query this way).
    pub when: Option<String>,
    pub item: ScriptItem,
}

pub fn action(value: Value) -> ScriptEntry {
    ScriptEntry { when: None, item: ScriptItem::Action(value) }
}

pub fn action_when(needle: &str, value: Value) -> ScriptEntry {
    ScriptEntry {
        when: Some(needle.to_owned()),
        item: ScriptItem::Action(value),
    }
}

pub fn fail(error: Error) -> ScriptEntry {
    ScriptEntry { when: None, item: ScriptItem::Fail(error) }
}

pub fn streamed(value: Value, chunk_bytes: usize) -> ScriptEntry {
    ScriptEntry {
        when: None,
        item: ScriptItem::Streamed { value, chunk_bytes },
    }
}

pub fn final_response(answer: &str) -> Value {
    json!({"next_node": "final_response", "args": {"answer": answer}})
}

pub fn tool_action(name: &str, args: Value) -> Value {
    json!({"next_node": name, "args": args})
}

pub struct ScriptedClient {
    profile: ModelProfile,
    script: Mutex<Vec<ScriptEntry>>,
    pub requests: Mutex<Vec<LlmRequest>>,
}

impl ScriptedClient {
    pub fn new(script: Vec<ScriptEntry>) -> Self {
        Self {
            profile: ModelProfile::strict_native("test"),
            script: Mutex::new(script),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }
}

fn request_text(req: &LlmRequest) -> String {
    req.messages
        .iter()
        .map(|m| m.content.extract_all_text())
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl LlmClient for ScriptedClient {
    async fn complete(
        &self,
        req: LlmRequest,
        _timeout: Duration,
        cancel: CancelToken,
        stream: Option<mpsc::Sender<StreamEvent>>,
    ) -> Result<CompletionResponse> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled("scripted client".into()));
        }
        let haystack = request_text(&req);
        self.requests.lock().push(req);

        let entry = {
            let mut script = self.script.lock();
            let idx = script.iter().position(|e| match &e.when {
                Some(needle) => haystack.contains(needle.as_str()),
                None => true,
            });
            match idx {
                Some(i) => script.remove(i),
                None => {
                    return Err(Error::Other(format!(
                        "script exhausted or no entry matched request: {haystack:.200}"
                    )))
                }
            }
        };

        let usage = Usage { input_tokens: 100, output_tokens: 20, total_tokens: 120 };
        let text = match entry.item {
            ScriptItem::Action(value) => value.to_string(),
            ScriptItem::Text(text) => text,
            ScriptItem::Streamed { value, chunk_bytes } => {
                let text = value.to_string();
                if let Some(tx) = &stream {
                    let bytes = text.as_bytes();
                    let mut start = 0;
                    while start < bytes.len() {
                        let mut end = (start + chunk_bytes).min(bytes.len());
                        while end < bytes.len() && !text.is_char_boundary(end) {
                            end += 1;
                        }
                        let _ = tx
                            .send(StreamEvent::Token {
                                text: text[start..end].to_string(),
                            })
                            .await;
                        start = end;
                    }
                    let _ = tx
                        .send(StreamEvent::Done {
                            usage: Some(usage.clone()),
                            finish_reason: Some("stop".into()),
                        })
                        .await;
                }
                text
            }
            ScriptItem::Fail(error) => return Err(error),
        };

        Ok(CompletionResponse {
            message: Message::assistant(text),
            usage,
            reasoning_content: None,
        })
    }

    fn profile(&self) -> &ModelProfile {
        &self.profile
    }

    fn model_id(&self) -> &str {
        "test-model"
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Test tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub enum ToolBehavior {
    /// Return this value.
    Value(Value),
    /// Record the args, then return the value.
    Record {
        calls: Arc<Mutex<Vec<Value>>>,
        value: Value,
    },
    /// Signal `started`, wait for `release`, then return the value.
    Gated {
        started: Arc<Notify>,
        release: Arc<Notify>,
        value: Value,
    },
}

pub struct TestTool {
    spec: ToolSpec,
    behavior: ToolBehavior,
}

impl TestTool {
    pub fn new(spec: ToolSpec, behavior: ToolBehavior) -> Arc<dyn Tool> {
        Arc::new(Self { spec, behavior })
    }
}

#[async_trait]
impl Tool for TestTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    async fn call(&self, args: Value, _ctx: &ToolContext) -> Result<Value> {
        match &self.behavior {
            ToolBehavior::Value(value) => Ok(value.clone()),
            ToolBehavior::Record { calls, value } => {
                calls.lock().push(args);
                Ok(value.clone())
            }
            ToolBehavior::Gated { started, release, value } => {
                started.notify_one();
                release.notified().await;
                Ok(value.clone())
            }
        }
    }
}

/// Build a closed object schema: `{"type": "object", properties, required,
/// additionalProperties: false}`.
pub fn obj_schema(fields: &[(&str, &str)]) -> Value {
    let properties: serde_json::Map<String, Value> = fields
        .iter()
        .map(|(name, ty)| ((*name).to_owned(), json!({"type": ty})))
        .collect();
    let required: Vec<&str> = fields.iter().map(|(name, _)| *name).collect();
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false
    })
}

pub fn tool_spec(
    name: &str,
    side_effects: SideEffects,
    args_schema: Value,
    out_schema: Value,
) -> ToolSpec {
    ToolSpec {
        name: name.into(),
        description: format!("{name} test tool"),
        args_schema,
        out_schema,
        side_effects,
        fatal_errors: false,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Environment wiring
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct TestEnv {
    pub ctx: Arc<RuntimeContext>,
    pub store: Arc<MemoryStateStore>,
    pub client: Arc<ScriptedClient>,
}

/// Install a test logger once per process (inspect with `RUST_LOG=debug`).
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn build_env(
    mut config: FlowConfig,
    script: Vec<ScriptEntry>,
    tools: Vec<Arc<dyn Tool>>,
) -> TestEnv {
    init_tracing();
    // Tests never want minute-long real waits.
    config.runtime.timeout_s = 5.0;
    config.runtime.tool_timeout_s = 5.0;

    let store = Arc::new(MemoryStateStore::new());
    let client = Arc::new(ScriptedClient::new(script));
    let registry = Arc::new(ToolRegistry::new());
    for tool in tools {
        registry.register(tool);
    }
    let ctx = RuntimeContext::new(config, store.clone(), client.clone(), registry);
    TestEnv { ctx, store, client }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Assertion helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Collect updates until one satisfies the predicate (inclusive). Panics
/// on timeout with the updates seen so far.
pub async fn recv_until(
    rx: &mut mpsc::Receiver<StateUpdate>,
    timeout: Duration,
    pred: impl Fn(&StateUpdate) -> bool,
) -> Vec<StateUpdate> {
    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .unwrap_or(Duration::ZERO);
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(update)) => {
                let done = pred(&update);
                seen.push(update);
                if done {
                    return seen;
                }
            }
            Ok(None) => panic!("update stream closed; saw: {seen:#?}"),
            Err(_) => panic!("timed out waiting for update; saw: {seen:#?}"),
        }
    }
}

/// Poll the registry until a task reaches the expected status.
pub async fn wait_for_status(
    ctx: &Arc<RuntimeContext>,
    task_id: &str,
    status: TaskStatus,
    timeout: Duration,
) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(task) = ctx.registry.get(task_id) {
            if task.status == status {
                return;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "task {task_id} never reached {status:?}; current: {:?}",
                ctx.registry.get(task_id).map(|t| t.status)
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// First background task of a session (tests that spawn exactly one).
pub fn background_task_id(ctx: &Arc<RuntimeContext>, session_id: &str) -> Option<String> {
    ctx.registry
        .list(session_id, None)
        .into_iter()
        .find(|t| t.task_type == TaskType::Background)
        .map(|t| t.task_id)
}
