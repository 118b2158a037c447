//! The planner runtime — the per-task plan→act→observe state machine.
//!
//! One `PlannerRuntime` drives one task at a time through the loop:
//! cancellation check, steering drain, pause gate, pending-action dequeue
//! or auto-seq detection or LLM call, constraint checks, then dispatch
//! (`final_response` / `plan` / `task` / tool). Updates flow through the
//! shared [`EventSink`]; every lifecycle change lands in the audit log.
//! A failure of the audit log itself fails the task; optional persistence
//! degrades through the capability gate instead.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use parking_lot::RwLock;
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, Semaphore};

use pf_domain::action::{PlanArgs, PlannerAction, TaskArgs};
use pf_domain::cancel::CancelToken;
use pf_domain::config::FlowConfig;
use pf_domain::error::{Error, ErrorClass, Result};
use pf_domain::message::Message;
use pf_domain::snapshot::MemorySnapshot;
use pf_domain::steering::{SteeringEvent, SteeringKind};
use pf_domain::stream::StreamEvent;
use pf_domain::task::{TaskSpawnSpec, TaskState, TaskStatus, TaskType};
use pf_domain::tool::{ToolContext, ToolDefinition};
use pf_domain::trace::FlowTrace;
use pf_domain::trajectory::Trajectory;
use pf_domain::update::UpdateType;

use pf_llm::extract::{ExtractEvent, StreamingExtractor};
use pf_llm::invoker::{InvokeOutcome, Invoker};
use pf_store::{event_kind, Feature, FeatureGate, FlowEvent, PauseRecord, StateStore};

use crate::cancel::CancelMap;
use crate::groups::GroupRegistry;
use crate::inbox::InboxMap;
use crate::recovery::{ObservationSummarizer, RecoveryPolicy};
use crate::registry::{SpawnOutcome, TaskRegistry};
use crate::sink::EventSink;
use crate::snapshot::{freeze_snapshot, MergeEngine};
use crate::tools::ToolRegistry;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Runtime context
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything a planner run needs, injected once. No global state: the
/// session coordinator builds one of these and hands out clones of the Arc.
pub struct RuntimeContext {
    pub config: FlowConfig,
    pub store: Arc<dyn StateStore>,
    pub gate: Arc<FeatureGate>,
    pub registry: Arc<TaskRegistry>,
    pub groups: Arc<GroupRegistry>,
    pub inboxes: Arc<InboxMap>,
    pub tools: Arc<ToolRegistry>,
    pub sink: Arc<EventSink>,
    pub invoker: Arc<Invoker>,
    pub merges: Arc<MergeEngine>,
    pub recovery: Arc<RecoveryPolicy>,
    pub summarizer: Arc<dyn ObservationSummarizer>,
}

impl RuntimeContext {
    /// Wire up a runtime from its injected collaborators. The store's
    /// capabilities are discovered here (one warning per missing feature).
    pub fn new(
        config: FlowConfig,
        store: Arc<dyn StateStore>,
        client: Arc<dyn pf_llm::client::LlmClient>,
        tools: Arc<ToolRegistry>,
    ) -> Arc<Self> {
        let gate = Arc::new(FeatureGate::discover(store.capabilities()));
        let cancel_map = Arc::new(CancelMap::new());
        let registry = Arc::new(TaskRegistry::new(config.tasks.clone(), cancel_map));
        let inboxes = Arc::new(InboxMap::new(config.tasks.clone()));
        let sink = Arc::new(EventSink::new(store.clone(), gate.clone(), 256));
        let invoker = Arc::new(Invoker::new(
            client,
            config.pricing.clone(),
            config.runtime.max_retries,
        ));
        let recovery = Arc::new(RecoveryPolicy::new(config.recovery.clone()));
        Arc::new(Self {
            config,
            store,
            gate,
            registry,
            groups: Arc::new(GroupRegistry::new()),
            inboxes,
            tools,
            sink,
            invoker,
            merges: Arc::new(MergeEngine::new()),
            recovery,
            summarizer: Arc::new(crate::recovery::TruncatingSummarizer::default()),
        })
    }

    pub fn cancel_map(&self) -> &Arc<CancelMap> {
        self.registry.cancel_map()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scheduling messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Messages from a planner run back to the session scheduler.
#[derive(Debug)]
pub enum SchedMsg {
    /// A background spawn got a free slot; the scheduler should start it.
    StartTask { task_id: String },
}

/// Why a run returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Completed,
    Cancelled,
    Failed { kind: String },
    BudgetExceeded,
    ConstraintViolated,
    Paused { resume_token: String },
}

/// Per-run input: the task, its LLM-visible context handle, the foreground
/// turn it belongs to, and the scheduler channel.
pub struct TaskRun {
    pub task_id: String,
    pub context: Arc<RwLock<Value>>,
    pub turn_id: String,
    pub sched: Option<mpsc::UnboundedSender<SchedMsg>>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Planner runtime
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct PlannerRuntime {
    ctx: Arc<RuntimeContext>,
}

/// The response schema every planner step is parsed against: exactly
/// `next_node` and `args`.
pub fn action_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "next_node": {"type": "string"},
            "args": {"type": "object"}
        },
        "required": ["next_node", "args"],
        "additionalProperties": false
    })
}

impl PlannerRuntime {
    pub fn new(ctx: Arc<RuntimeContext>) -> Self {
        Self { ctx }
    }

    /// Run a task from its registry record. The trajectory starts fresh;
    /// use [`PlannerRuntime::resume`] to continue from a pause record.
    pub async fn run_task(&self, run: TaskRun) -> FinishReason {
        let task = match self.ctx.registry.get(&run.task_id) {
            Some(t) => t,
            None => return FinishReason::Failed { kind: "unknown_task".into() },
        };
        let trajectory = Trajectory::new(task.query.clone());
        self.drive(task, trajectory, run).await
    }

    /// Resume from a durable pause record. Idempotent: a consumed (or
    /// unknown) token returns `None` without side effects.
    pub async fn resume(&self, resume_token: &str, run: TaskRun) -> Result<Option<FinishReason>> {
        if !self.ctx.gate.enabled(Feature::PlannerState) {
            return Ok(None);
        }
        let record = match self.ctx.store.consume_planner_state(resume_token).await {
            Ok(Some(r)) => r,
            Ok(None) => return Ok(None),
            Err(e) => {
                self.ctx.gate.optional_failed(Feature::PlannerState, &e);
                return Ok(None);
            }
        };
        let trajectory: Trajectory = serde_json::from_value(record.trajectory.clone())?;
        let task = self.ctx.registry.resume(&record.task_id)?;
        FlowTrace::TaskResumed {
            task_id: record.task_id.clone(),
            resume_token: resume_token.to_owned(),
        }
        .emit();
        self.emit_status(&task.session_id, &task.task_id, TaskStatus::Running).await;
        Ok(Some(self.drive(task, trajectory, run).await))
    }

    // ── The loop ───────────────────────────────────────────────────

    async fn drive(&self, task: TaskState, mut trajectory: Trajectory, run: TaskRun) -> FinishReason {
        let session_id = task.session_id.clone();
        let task_id = task.task_id.clone();
        let cancel = self
            .ctx
            .cancel_map()
            .get(&task_id)
            .unwrap_or_else(|| self.ctx.cancel_map().register(&task_id));
        let inbox = self.ctx.inboxes.for_task(&task_id);
        let max_iters = self.ctx.config.runtime.max_iters;
        let deadline =
            task.created_at + chrono_seconds(self.ctx.config.tasks.max_task_lifetime_s);
        let schema = action_schema();

        if task.status == TaskStatus::Pending {
            if let Err(e) = self.ctx.registry.transition(&task_id, TaskStatus::Running) {
                return self.finish_failed(&session_id, &task_id, &trajectory, e).await;
            }
            self.emit_status(&session_id, &task_id, TaskStatus::Running).await;
            if let Err(e) = self
                .audit(&task_id, event_kind::TASK_STATUS_CHANGED, json!({"status": "running"}))
                .await
            {
                return self.finish_failed(&session_id, &task_id, &trajectory, e).await;
            }
        }

        let mut paused_requested = false;

        loop {
            // ── 1. Cancellation (token or external registry flip) ──
            if cancel.is_cancelled()
                || self
                    .ctx
                    .registry
                    .get(&task_id)
                    .map(|t| t.status == TaskStatus::Cancelled)
                    .unwrap_or(false)
            {
                return self
                    .finish_cancelled(&session_id, &task_id, &trajectory, "cancelled")
                    .await;
            }

            // ── 2. Steering drain ──────────────────────────────────
            for event in inbox.drain() {
                match self
                    .apply_steering(&task_id, &mut trajectory, &event, &mut paused_requested)
                    .await
                {
                    Ok(SteeringEffect::Continue) => {}
                    Ok(SteeringEffect::Cancelled(reason)) => {
                        return self
                            .finish_cancelled(&session_id, &task_id, &trajectory, &reason)
                            .await;
                    }
                    Err(e) => {
                        return self.finish_failed(&session_id, &task_id, &trajectory, e).await;
                    }
                }
            }

            // ── 3. Pause gate ──────────────────────────────────────
            if paused_requested {
                match self.pause_task(&session_id, &task_id, &trajectory).await {
                    Ok(Some(reason)) => return reason,
                    Ok(None) => paused_requested = false, // pause unavailable; keep going
                    Err(e) => {
                        return self.finish_failed(&session_id, &task_id, &trajectory, e).await;
                    }
                }
            }

            // ── 4. Constraints ─────────────────────────────────────
            if trajectory.len() >= max_iters {
                return self
                    .finish_budget(&session_id, &task_id, &trajectory, "max_iters")
                    .await;
            }
            if Utc::now() > deadline {
                return self
                    .finish_constraint(&session_id, &task_id, &trajectory, "max_task_lifetime")
                    .await;
            }
            if let Some(current) = self.ctx.registry.get(&task_id) {
                if let Some(hops) = current.continuation_hops {
                    if hops == 0 {
                        return self
                            .finish_budget(&session_id, &task_id, &trajectory, "continuation_hops")
                            .await;
                    }
                    self.ctx
                        .registry
                        .update(&task_id, |t| t.continuation_hops = Some(hops - 1));
                }
            }

            // ── 5. Action selection ────────────────────────────────
            let (action, reasoning) = if let Some(action) =
                trajectory.metadata.pending_actions.pop_front()
            {
                (action, None)
            } else if let Some((tool_name, args)) = self.auto_seq_candidate(&trajectory) {
                FlowTrace::AutoSeqDetectedUnique {
                    task_id: task_id.clone(),
                    tool_name: tool_name.clone(),
                }
                .emit();
                self.ctx
                    .sink
                    .emit(
                        &session_id,
                        &task_id,
                        UpdateType::Progress,
                        json!({"phase": "auto_seq_detected_unique", "tool_name": &tool_name}),
                        Some(trajectory.len()),
                        Some(max_iters),
                    )
                    .await;
                if self.ctx.config.runtime.auto_seq_execute {
                    (PlannerAction::tool(tool_name, args), None)
                } else {
                    match self.llm_step(&session_id, &task_id, &run, &mut trajectory, &schema, &cancel).await {
                        Ok(StepOutcome::Action(outcome)) => self.absorb_outcome(&task_id, outcome),
                        Ok(StepOutcome::Synthesized) => continue,
                        Err(e) => return self.step_error_finish(&session_id, &task_id, &trajectory, e).await,
                    }
                }
            } else {
                match self.llm_step(&session_id, &task_id, &run, &mut trajectory, &schema, &cancel).await {
                    Ok(StepOutcome::Action(outcome)) => self.absorb_outcome(&task_id, outcome),
                    Ok(StepOutcome::Synthesized) => continue,
                    Err(e) => return self.step_error_finish(&session_id, &task_id, &trajectory, e).await,
                }
            };

            // Alias rewrite for tool actions.
            let action = if action.is_reserved() {
                action
            } else {
                let resolved = self.ctx.tools.resolve(&action.next_node);
                PlannerAction { next_node: resolved, args: action.args }
            };

            if let Some(reasoning_text) = reasoning.as_deref() {
                self.ctx
                    .sink
                    .emit(
                        &session_id,
                        &task_id,
                        UpdateType::Thinking,
                        json!({"text": reasoning_text}),
                        Some(trajectory.len()),
                        Some(max_iters),
                    )
                    .await;
            }

            // ── 6. Dispatch ────────────────────────────────────────
            if action.is_final() {
                return self
                    .finish_complete(&session_id, &task_id, trajectory, action, reasoning)
                    .await;
            }

            if action.is_plan() {
                let step_index = trajectory.append_step(action.clone(), reasoning);
                let plan = match action.plan_args() {
                    Ok(p) => p,
                    Err(e) => {
                        let _ = trajectory.record_error(step_index, e.to_string());
                        continue;
                    }
                };
                self.ctx
                    .sink
                    .emit(
                        &session_id,
                        &task_id,
                        UpdateType::ToolCall,
                        json!({"node": "plan", "steps": plan.steps.len()}),
                        Some(step_index),
                        Some(max_iters),
                    )
                    .await;
                match self.execute_plan(&session_id, &task_id, &plan, &cancel).await {
                    Ok((observation, llm_observation)) => {
                        let _ = trajectory.record_observation(step_index, observation, llm_observation);
                    }
                    Err(Error::Cancelled(_)) => {
                        return self
                            .finish_cancelled(&session_id, &task_id, &trajectory, "cancelled")
                            .await;
                    }
                    Err(e) => {
                        let _ = trajectory.record_error(step_index, e.to_string());
                    }
                }
                self.persist_progress(&task_id, &trajectory).await;
                continue;
            }

            if action.is_task() {
                let step_index = trajectory.append_step(action.clone(), reasoning);
                let args = match action.task_args() {
                    Ok(a) => a,
                    Err(e) => {
                        let _ = trajectory.record_error(step_index, e.to_string());
                        continue;
                    }
                };
                let retain = args.retain_turn;
                match self.spawn_background(&session_id, &task_id, &run, args).await {
                    Ok((observation, wait_ids)) => {
                        let _ = trajectory.record_observation(
                            step_index,
                            observation.clone(),
                            observation,
                        );
                        if retain && !wait_ids.is_empty() {
                            self.retain_turn(&session_id, &task_id, &wait_ids, &cancel).await;
                        }
                    }
                    Err(e) => {
                        let _ = trajectory.record_error(step_index, e.to_string());
                    }
                }
                self.persist_progress(&task_id, &trajectory).await;
                continue;
            }

            // Plain tool call.
            let step_index = trajectory.append_step(action.clone(), reasoning);
            self.ctx
                .sink
                .emit(
                    &session_id,
                    &task_id,
                    UpdateType::ToolCall,
                    json!({"node": action.next_node, "args": Value::Object(action.args.clone())}),
                    Some(step_index),
                    Some(max_iters),
                )
                .await;
            if let Err(e) = self
                .audit(
                    &task_id,
                    event_kind::TASK_PROGRESS,
                    json!({"step_index": step_index, "node": action.next_node}),
                )
                .await
            {
                return self.finish_failed(&session_id, &task_id, &trajectory, e).await;
            }

            let tool_ctx = ToolContext::new(&session_id, &task_id, cancel.clone());
            let tool_timeout = duration_seconds(self.ctx.config.runtime.tool_timeout_s);
            let exec = self
                .ctx
                .tools
                .execute(
                    &action.next_node,
                    Value::Object(action.args.clone()),
                    &tool_ctx,
                    tool_timeout,
                )
                .await;

            match exec {
                Ok(output) => {
                    let (full, redacted) = self.redact_output(&action.next_node, output).await;
                    let _ = trajectory.record_observation(step_index, full, redacted.clone());
                    self.ctx
                        .sink
                        .emit(
                            &session_id,
                            &task_id,
                            UpdateType::Progress,
                            json!({"phase": "observation", "node": action.next_node, "observation": redacted}),
                            Some(step_index),
                            Some(max_iters),
                        )
                        .await;
                }
                Err(Error::Cancelled(_)) => {
                    return self
                        .finish_cancelled(&session_id, &task_id, &trajectory, "cancelled")
                        .await;
                }
                Err(Error::Tool { tool_name, message, fatal: true }) => {
                    let _ = trajectory
                        .record_error(step_index, format!("{tool_name}: {message}"));
                    return self
                        .finish_failed(
                            &session_id,
                            &task_id,
                            &trajectory,
                            Error::Tool { tool_name, message, fatal: true },
                        )
                        .await;
                }
                Err(e) => {
                    // Default tool-error policy: record and let the LLM react.
                    let _ = trajectory.record_error(step_index, e.to_string());
                    self.ctx
                        .sink
                        .emit(
                            &session_id,
                            &task_id,
                            UpdateType::Progress,
                            json!({"phase": "tool_error", "node": action.next_node, "error": e.to_string()}),
                            Some(step_index),
                            Some(max_iters),
                        )
                        .await;
                }
            }
            self.persist_progress(&task_id, &trajectory).await;
        }
    }

    fn absorb_outcome(&self, task_id: &str, outcome: InvokeOutcome) -> (PlannerAction, Option<String>) {
        self.ctx.registry.update(task_id, |t| {
            t.input_tokens += u64::from(outcome.usage.input_tokens);
            t.output_tokens += u64::from(outcome.usage.output_tokens);
            t.cost_usd += outcome.cost_usd;
        });
        (outcome.action, outcome.reasoning)
    }

    // ── Steering ───────────────────────────────────────────────────

    async fn apply_steering(
        &self,
        task_id: &str,
        trajectory: &mut Trajectory,
        event: &SteeringEvent,
        paused_requested: &mut bool,
    ) -> Result<SteeringEffect> {
        if self.ctx.gate.enabled(Feature::Steering) {
            if let Err(e) = self.ctx.store.save_steering(event.clone()).await {
                self.ctx.gate.optional_failed(Feature::Steering, &e);
            }
        }
        self.audit(
            task_id,
            event_kind::TASK_STEERING_RECEIVED,
            json!({"event_id": event.event_id, "kind": event.kind}),
        )
        .await?;

        match event.kind {
            SteeringKind::Cancel => {
                let reason = event
                    .payload
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("cancelled")
                    .to_owned();
                let cascade = event
                    .payload
                    .get("cascade")
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                self.ctx.registry.cancel(task_id, &reason, cascade)?;
                self.audit(
                    task_id,
                    event_kind::TASK_CONTROL_CONFIRMED,
                    json!({"control": "cancel"}),
                )
                .await?;
                Ok(SteeringEffect::Cancelled(reason))
            }
            SteeringKind::Pause => {
                self.audit(
                    task_id,
                    event_kind::TASK_CONTROL_REQUESTED,
                    json!({"control": "pause"}),
                )
                .await?;
                *paused_requested = true;
                Ok(SteeringEffect::Continue)
            }
            SteeringKind::Resume => {
                *paused_requested = false;
                Ok(SteeringEffect::Continue)
            }
            SteeringKind::Prioritize => {
                if let Some(priority) = event.payload.get("priority").and_then(Value::as_i64) {
                    let _ = self.ctx.registry.prioritize(task_id, priority as i32);
                }
                Ok(SteeringEffect::Continue)
            }
            SteeringKind::Approve | SteeringKind::Reject => {
                // Patch approvals are session-level and handled by the
                // coordinator before events reach a task inbox; one that
                // lands here anyway is ignored.
                tracing::debug!(task_id, kind = ?event.kind, "session-level event in task inbox; ignoring");
                Ok(SteeringEffect::Continue)
            }
            SteeringKind::UserMessage | SteeringKind::InjectContext | SteeringKind::Redirect => {
                trajectory.metadata.steering_inputs.push(json!({
                    "kind": event.kind,
                    "payload": event.payload,
                }));
                Ok(SteeringEffect::Continue)
            }
        }
    }

    // ── Auto-seq ───────────────────────────────────────────────────

    /// The deterministic-next-step gate. Fires only when the previous step
    /// is a non-plan step with a structured, error-free observation that
    /// exactly one visible, policy-compliant tool validates.
    fn auto_seq_candidate(&self, trajectory: &Trajectory) -> Option<(String, Map<String, Value>)> {
        if !self.ctx.config.runtime.auto_seq_enabled {
            return None;
        }
        let last = trajectory.last_step()?;
        if last.action.is_plan() || last.error.is_some() {
            return None;
        }
        let observation = last.coerce_observation()?;
        let tool_name = self
            .ctx
            .tools
            .unique_consumer(observation, self.ctx.config.runtime.auto_seq_read_only_only)?;
        Some((tool_name, observation.clone()))
    }

    // ── LLM step with recovery ─────────────────────────────────────

    async fn llm_step(
        &self,
        session_id: &str,
        task_id: &str,
        run: &TaskRun,
        trajectory: &mut Trajectory,
        schema: &Value,
        cancel: &CancelToken,
    ) -> Result<StepOutcome> {
        let timeout = duration_seconds(self.ctx.config.runtime.timeout_s);
        let recovery = &self.ctx.recovery;
        let mut compress_attempts = 0usize;
        let mut transport_attempts = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled("before llm call".into()));
            }
            let messages = {
                let context = run.context.read();
                build_messages(&context, trajectory, &self.ctx.tools.definitions())
            };
            let bridge = self
                .ctx
                .config
                .runtime
                .streaming_enabled
                .then(|| self.spawn_stream_bridge(session_id, task_id));
            let (stream, bridge_handle) = match bridge {
                Some((tx, handle)) => (Some(tx), Some(handle)),
                None => (None, None),
            };

            let started = Utc::now();
            let result = self
                .ctx
                .invoker
                .call(messages, schema, None, timeout, cancel, stream)
                .await;
            let duration_ms = (Utc::now() - started).num_milliseconds().max(0) as u64;

            // Drain the extractor bridge so streamed answer chunks land
            // before any RESULT emitted for this step.
            if let Some(handle) = bridge_handle {
                let _ = handle.await;
            }

            match result {
                Ok(outcome) => {
                    FlowTrace::LlmCall {
                        task_id: task_id.to_owned(),
                        mode: format!("{:?}", outcome.mode),
                        attempts: outcome.attempts,
                        duration_ms,
                        input_tokens: Some(outcome.usage.input_tokens),
                        output_tokens: Some(outcome.usage.output_tokens),
                    }
                    .emit();
                    return Ok(StepOutcome::Action(outcome));
                }
                Err(Error::ContextLengthExceeded(msg)) => {
                    if !recovery.config().enabled
                        || compress_attempts >= recovery.config().max_compress_retries
                    {
                        return Err(Error::ContextLengthExceeded(msg));
                    }
                    let compressed = recovery
                        .compress_trajectory(trajectory, self.ctx.summarizer.as_ref(), task_id)
                        .await?;
                    if compressed == 0 {
                        return Err(Error::ContextLengthExceeded(msg));
                    }
                    self.ctx
                        .sink
                        .emit(
                            session_id,
                            task_id,
                            UpdateType::Checkpoint,
                            json!({"phase": "trajectory_compressed", "steps_compressed": compressed}),
                            Some(trajectory.len()),
                            None,
                        )
                        .await;
                    compress_attempts += 1;
                }
                Err(e) if e.class() == ErrorClass::RetryableTransport => {
                    if transport_attempts >= recovery.config().max_transport_retries as u32 {
                        return Err(e);
                    }
                    let delay = recovery.backoff_delay(transport_attempts, task_id);
                    tracing::warn!(error = %e, delay_ms = delay.as_millis() as u64, "llm transport error, backing off");
                    tokio::time::sleep(delay).await;
                    transport_attempts += 1;
                }
                Err(Error::LlmInvalidRequest(msg)) => {
                    // Bad request (non-context): synthesize an observation
                    // step with the cleaned error and let the next LLM call
                    // react to it.
                    let cleaned = recovery.clean_bad_request(&msg);
                    let step_index = trajectory
                        .append_step(PlannerAction::tool("llm_error", Map::new()), None);
                    let _ = trajectory.record_observation(step_index, cleaned.clone(), cleaned);
                    return Ok(StepOutcome::Synthesized);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Bridge raw stream tokens through the answer extractor into
    /// ARTIFACT_CHUNK updates with a monotonic `seq`, plus a `done` marker
    /// when the answer string closes. The caller awaits the returned handle
    /// after the LLM call so chunk ordering is preserved.
    fn spawn_stream_bridge(
        &self,
        session_id: &str,
        task_id: &str,
    ) -> (mpsc::Sender<StreamEvent>, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<StreamEvent>(64);
        let sink = self.ctx.sink.clone();
        let session_id = session_id.to_owned();
        let task_id = task_id.to_owned();

        let handle = tokio::spawn(async move {
            let mut extractor = StreamingExtractor::new();
            let mut seq: u64 = 0;
            while let Some(event) = rx.recv().await {
                match event {
                    StreamEvent::Token { text } => {
                        for extracted in extractor.feed(&text) {
                            seq += 1;
                            let content = match extracted {
                                ExtractEvent::Delta(delta) => {
                                    json!({"phase": "answer", "seq": seq, "text": delta})
                                }
                                ExtractEvent::Done => {
                                    json!({"phase": "answer", "seq": seq, "done": true})
                                }
                            };
                            sink.emit(
                                &session_id,
                                &task_id,
                                UpdateType::ArtifactChunk,
                                content,
                                None,
                                None,
                            )
                            .await;
                        }
                    }
                    StreamEvent::Reasoning { text } => {
                        sink.emit(
                            &session_id,
                            &task_id,
                            UpdateType::Thinking,
                            json!({"text": text}),
                            None,
                            None,
                        )
                        .await;
                    }
                    StreamEvent::Done { .. } | StreamEvent::Error { .. } => {}
                }
            }
        });
        (tx, handle)
    }

    // ── Parallel plans ─────────────────────────────────────────────

    async fn execute_plan(
        &self,
        session_id: &str,
        task_id: &str,
        plan: &PlanArgs,
        cancel: &CancelToken,
    ) -> Result<(Value, Value)> {
        let semaphore = Arc::new(Semaphore::new(
            self.ctx.config.runtime.plan_concurrency.max(1),
        ));
        let tool_timeout = duration_seconds(self.ctx.config.runtime.tool_timeout_s);

        let futures = plan.steps.iter().enumerate().map(|(idx, step)| {
            let semaphore = semaphore.clone();
            let tools = self.ctx.tools.clone();
            let tool_ctx = ToolContext::new(session_id, task_id, cancel.clone());
            let node = step.node.clone();
            let args = Value::Object(step.args.clone());
            async move {
                let _permit = semaphore.acquire().await;
                (idx, tools.execute(&node, args, &tool_ctx, tool_timeout).await)
            }
        });

        // join_all keeps input order, so results land by step index.
        let results = join_all(futures).await;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled("during plan".into()));
        }
        if self.ctx.config.runtime.plan_fail_fast {
            for (idx, result) in &results {
                if let Err(e) = result {
                    return Err(Error::Other(format!("plan step {idx} failed: {e}")));
                }
            }
        }

        let outputs: Vec<Value> = results
            .into_iter()
            .map(|(_, result)| match result {
                Ok(v) => v,
                Err(e) => json!({"error": e.to_string()}),
            })
            .collect();

        let join_directive = plan
            .join
            .as_ref()
            .and_then(|j| j.node.as_ref().map(|n| (j, n.clone())));
        match join_directive {
            Some((join, join_node)) => {
                let mut args = join.args.clone();
                for (key, directive) in &join.inject {
                    let injected = match directive.as_str() {
                        Some("$all") => Value::Array(outputs.clone()),
                        Some(s) if s.starts_with('$') => s[1..]
                            .parse::<usize>()
                            .ok()
                            .and_then(|i| outputs.get(i).cloned())
                            .unwrap_or(Value::Null),
                        _ => directive.clone(),
                    };
                    args.insert(key.clone(), injected);
                }
                let tool_ctx = ToolContext::new(session_id, task_id, cancel.clone());
                let joined = self
                    .ctx
                    .tools
                    .execute(&join_node, Value::Object(args), &tool_ctx, tool_timeout)
                    .await?;
                let (full, redacted) = self.redact_output(&join_node, joined).await;
                Ok((full, redacted))
            }
            None => {
                // No join node: the raw result list becomes the step
                // observation and the next LLM call aggregates it.
                let observation = json!({"results": outputs});
                Ok((observation.clone(), observation))
            }
        }
    }

    // ── Background spawns ──────────────────────────────────────────

    async fn spawn_background(
        &self,
        session_id: &str,
        task_id: &str,
        run: &TaskRun,
        args: TaskArgs,
    ) -> Result<(Value, Vec<String>)> {
        let merge_strategy = args
            .merge_strategy
            .unwrap_or(self.ctx.config.groups.default_group_merge_strategy);

        let group = if args.group_name.is_some() || args.group_id.is_some() {
            Some(self.ctx.groups.create_or_join(
                session_id,
                &run.turn_id,
                args.group_name.as_deref(),
                args.group_id.as_deref(),
                merge_strategy,
                self.ctx.config.groups.default_group_report,
            )?)
        } else {
            None
        };

        let snapshot = {
            let context = run.context.read();
            freeze_snapshot(
                &context,
                self.ctx
                    .tools
                    .visible_specs()
                    .iter()
                    .map(|s| s.name.clone())
                    .collect(),
                MemorySnapshot::Isolated,
                Vec::new(),
            )?
        }
        .with_provenance(
            task_id,
            self.ctx
                .sink
                .last_update_id(session_id, task_id)
                .unwrap_or_default(),
            args.description.clone(),
        );

        let spec = TaskSpawnSpec {
            session_id: session_id.to_owned(),
            task_type: TaskType::Background,
            query: args.query.clone(),
            description: args.description.clone(),
            priority: args.priority,
            group_id: group.as_ref().map(|g| g.group_id.clone()),
            idempotency_key: args.idempotency_key.clone(),
            context_snapshot: snapshot,
        };
        let (spawned, outcome) = self.ctx.registry.spawn(spec)?;

        if let Some(g) = &group {
            self.ctx.groups.add_task(&g.group_id, &spawned.task_id)?;
            if args.group_sealed {
                self.ctx.groups.seal(&g.group_id)?;
            }
        }

        self.audit(
            &spawned.task_id,
            event_kind::TASK_CREATED,
            json!({
                "session_id": session_id,
                "parent_task_id": task_id,
                "group_id": group.as_ref().map(|g| g.group_id.clone()),
                "query": args.query,
            }),
        )
        .await?;

        if outcome == SpawnOutcome::Created {
            if let Some(sched) = &run.sched {
                let _ = sched.send(SchedMsg::StartTask {
                    task_id: spawned.task_id.clone(),
                });
            }
        }

        let wait_ids = match &group {
            Some(g) => self
                .ctx
                .groups
                .get(&g.group_id)
                .map(|g| g.task_ids)
                .unwrap_or_default(),
            None => vec![spawned.task_id.clone()],
        };

        let observation = json!({
            "task_id": spawned.task_id,
            "status": spawned.status,
            "group_id": group.as_ref().map(|g| g.group_id.clone()),
            "queued": outcome == SpawnOutcome::Queued,
        });
        Ok((observation, wait_ids))
    }

    /// Retain-turn wait: suspend until every awaited task is terminal or
    /// the retain-turn timeout forces a yield (granting the stragglers a
    /// bounded continuation budget).
    async fn retain_turn(
        &self,
        session_id: &str,
        task_id: &str,
        wait_ids: &[String],
        cancel: &CancelToken,
    ) {
        let timeout = duration_seconds(self.ctx.config.tasks.retain_turn_timeout_s);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if cancel.is_cancelled() {
                return;
            }
            let all_terminal = wait_ids.iter().all(|id| {
                self.ctx
                    .registry
                    .get(id)
                    .map(|t| t.is_terminal())
                    .unwrap_or(true)
            });
            if all_terminal {
                return;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                break;
            }
            let _ = tokio::time::timeout_at(
                deadline.min(now + Duration::from_millis(250)),
                self.ctx.registry.terminal_notify().notified(),
            )
            .await;
        }

        // Force-yield: the group continues in the background under a
        // bounded hop budget.
        let hops = self.ctx.config.tasks.background_continuation_max_hops;
        for id in wait_ids {
            if let Some(t) = self.ctx.registry.get(id) {
                if !t.is_terminal() {
                    self.ctx
                        .registry
                        .update(id, |t| t.continuation_hops = Some(hops));
                }
            }
        }
        let group_id = wait_ids
            .first()
            .and_then(|id| self.ctx.registry.get(id))
            .and_then(|t| t.group_id);
        FlowTrace::RetainTurnTimeout {
            task_id: task_id.to_owned(),
            group_id: group_id.clone(),
        }
        .emit();
        self.ctx
            .sink
            .emit(
                session_id,
                task_id,
                UpdateType::Notification,
                json!({
                    "title": "Background work is taking longer than expected",
                    "detail": "continuing in the background",
                    "group_id": group_id,
                }),
                None,
                None,
            )
            .await;
    }

    // ── Artifact redaction ─────────────────────────────────────────

    /// Split a tool output into (full observation, LLM-visible form):
    /// artifact-marked fields go to the artifact store and are replaced by
    /// `<artifact:ref>` placeholders.
    async fn redact_output(&self, tool_name: &str, output: Value) -> (Value, Value) {
        let spec = match self.ctx.tools.get(tool_name) {
            Some(tool) => tool.spec().clone(),
            None => return (output.clone(), output),
        };
        let fields = spec.artifact_fields();
        if fields.is_empty() || !self.ctx.gate.enabled(Feature::Artifacts) {
            return (output.clone(), output);
        }

        let mut redacted = output.clone();
        if let Some(obj) = redacted.as_object_mut() {
            for field in fields {
                let Some(blob) = obj.get(&field).cloned() else {
                    continue;
                };
                match self.ctx.store.put_artifact(blob).await {
                    Ok(reference) => {
                        obj.insert(field, Value::String(format!("<artifact:{reference}>")));
                    }
                    Err(e) => {
                        self.ctx.gate.optional_failed(Feature::Artifacts, &e);
                        return (output.clone(), output);
                    }
                }
            }
        }
        (output, redacted)
    }

    // ── Persistence helpers ────────────────────────────────────────

    async fn audit(&self, trace_id: &str, kind: &str, payload: Value) -> Result<()> {
        self.ctx
            .store
            .save_event(FlowEvent::new(trace_id, kind, payload))
            .await
            .map_err(|e| Error::StoreCore(e.to_string()))
    }

    async fn persist_progress(&self, task_id: &str, trajectory: &Trajectory) {
        if self.ctx.gate.enabled(Feature::Trajectories) {
            if let Err(e) = self.ctx.store.save_trajectory(task_id, trajectory).await {
                self.ctx.gate.optional_failed(Feature::Trajectories, &e);
            }
        }
        if self.ctx.gate.enabled(Feature::Tasks) {
            if let Some(task) = self.ctx.registry.get(task_id) {
                if let Err(e) = self.ctx.store.save_task(task).await {
                    self.ctx.gate.optional_failed(Feature::Tasks, &e);
                }
            }
        }
    }

    async fn emit_status(&self, session_id: &str, task_id: &str, status: TaskStatus) {
        self.ctx
            .sink
            .emit(
                session_id,
                task_id,
                UpdateType::StatusChange,
                json!({"status": status}),
                None,
                None,
            )
            .await;
    }

    // ── Finishing ──────────────────────────────────────────────────

    async fn pause_task(
        &self,
        session_id: &str,
        task_id: &str,
        trajectory: &Trajectory,
    ) -> Result<Option<FinishReason>> {
        if !self.ctx.gate.enabled(Feature::PlannerState) {
            tracing::warn!(task_id, "pause requested but planner_state is unavailable; ignoring");
            return Ok(None);
        }
        let record = PauseRecord::new(
            session_id,
            task_id,
            serde_json::to_value(trajectory)?,
            json!({"steps": trajectory.len()}),
        );
        let resume_token = record.resume_token.clone();
        if let Err(e) = self.ctx.store.save_planner_state(record).await {
            self.ctx.gate.optional_failed(Feature::PlannerState, &e);
            return Ok(None);
        }
        self.ctx.registry.pause(task_id)?;
        FlowTrace::PauseRecorded {
            task_id: task_id.to_owned(),
            resume_token: resume_token.clone(),
        }
        .emit();
        self.emit_status(session_id, task_id, TaskStatus::Paused).await;
        self.ctx
            .sink
            .emit(
                session_id,
                task_id,
                UpdateType::Checkpoint,
                json!({"phase": "paused", "resume_token": resume_token}),
                Some(trajectory.len()),
                None,
            )
            .await;
        self.audit(
            task_id,
            event_kind::TASK_CONTROL_CONFIRMED,
            json!({"control": "pause", "resume_token": resume_token}),
        )
        .await?;
        self.persist_progress(task_id, trajectory).await;
        Ok(Some(FinishReason::Paused { resume_token }))
    }

    async fn finish_complete(
        &self,
        session_id: &str,
        task_id: &str,
        mut trajectory: Trajectory,
        action: PlannerAction,
        reasoning: Option<String>,
    ) -> FinishReason {
        let step_index = trajectory.append_step(action.clone(), reasoning);
        let final_payload = match action.final_args() {
            Ok(args) => {
                let mut payload = json!({
                    "success": true,
                    "answer": args.answer,
                });
                if let Some(obj) = payload.as_object_mut() {
                    if !args.artifacts.is_empty() {
                        obj.insert("artifacts".into(), json!(args.artifacts));
                    }
                    if !args.sources.is_empty() {
                        obj.insert("sources".into(), json!(args.sources));
                    }
                    if let Some(confidence) = args.confidence {
                        obj.insert("confidence".into(), json!(confidence));
                    }
                    if !args.warnings.is_empty() {
                        obj.insert("warnings".into(), json!(args.warnings));
                    }
                }
                payload
            }
            Err(_) => json!({
                "success": true,
                "answer": Value::Object(action.args.clone()),
            }),
        };

        self.ctx.registry.update(task_id, |t| {
            t.result = Some(final_payload.clone());
        });
        if self.ctx.registry.transition(task_id, TaskStatus::Complete).is_err() {
            // Raced with an external cancel; report the cancel instead.
            return self
                .finish_cancelled(session_id, task_id, &trajectory, "cancelled")
                .await;
        }

        if self
            .audit(task_id, event_kind::TASK_RESULT_READY, final_payload.clone())
            .await
            .is_err()
        {
            return FinishReason::Failed { kind: "store_core".into() };
        }
        self.ctx
            .sink
            .emit(
                session_id,
                task_id,
                UpdateType::Result,
                final_payload,
                Some(step_index),
                Some(trajectory.len()),
            )
            .await;
        self.emit_status(session_id, task_id, TaskStatus::Complete).await;
        self.persist_progress(task_id, &trajectory).await;
        self.cleanup(task_id);
        FinishReason::Completed
    }

    async fn finish_cancelled(
        &self,
        session_id: &str,
        task_id: &str,
        trajectory: &Trajectory,
        reason: &str,
    ) -> FinishReason {
        // The record may already be Cancelled (external cancel); otherwise
        // flip it now.
        if let Some(task) = self.ctx.registry.get(task_id) {
            if !task.is_terminal() {
                let _ = self.ctx.registry.cancel(task_id, reason, false);
            }
        }
        self.emit_status(session_id, task_id, TaskStatus::Cancelled).await;
        self.ctx
            .sink
            .emit(
                session_id,
                task_id,
                UpdateType::Result,
                json!({
                    "success": false,
                    "error": {"kind": "cancelled", "message": reason, "trace_id": task_id},
                }),
                None,
                Some(trajectory.len()),
            )
            .await;
        let _ = self
            .audit(
                task_id,
                event_kind::TASK_STATUS_CHANGED,
                json!({"status": "cancelled", "reason": reason}),
            )
            .await;
        self.persist_progress(task_id, trajectory).await;
        self.cleanup(task_id);
        FinishReason::Cancelled
    }

    async fn finish_failed(
        &self,
        session_id: &str,
        task_id: &str,
        trajectory: &Trajectory,
        error: Error,
    ) -> FinishReason {
        if matches!(error, Error::Cancelled(_)) {
            return self
                .finish_cancelled(session_id, task_id, trajectory, "cancelled")
                .await;
        }
        let kind = error.kind().to_owned();
        self.ctx.registry.update(task_id, |t| {
            t.error = Some(error.to_string());
        });
        let _ = self.ctx.registry.transition(task_id, TaskStatus::Failed);

        self.ctx
            .sink
            .emit(
                session_id,
                task_id,
                UpdateType::Error,
                json!({"kind": kind, "message": error.to_string(), "trace_id": task_id}),
                None,
                Some(trajectory.len()),
            )
            .await;
        self.ctx
            .sink
            .emit(
                session_id,
                task_id,
                UpdateType::Result,
                json!({
                    "success": false,
                    "error": {"kind": kind, "message": error.to_string(), "trace_id": task_id},
                    "fallback_answer": fallback_answer(trajectory),
                }),
                None,
                Some(trajectory.len()),
            )
            .await;
        self.emit_status(session_id, task_id, TaskStatus::Failed).await;
        let _ = self
            .audit(
                task_id,
                event_kind::TASK_STATUS_CHANGED,
                json!({"status": "failed", "kind": kind}),
            )
            .await;
        self.persist_progress(task_id, trajectory).await;
        self.cleanup(task_id);
        FinishReason::Failed { kind }
    }

    async fn finish_budget(
        &self,
        session_id: &str,
        task_id: &str,
        trajectory: &Trajectory,
        which: &str,
    ) -> FinishReason {
        self.ctx.registry.update(task_id, |t| {
            t.error = Some(format!("budget exceeded: {which}"));
        });
        let _ = self.ctx.registry.transition(task_id, TaskStatus::Failed);
        self.ctx
            .sink
            .emit(
                session_id,
                task_id,
                UpdateType::Result,
                json!({
                    "success": false,
                    "error": {"kind": "budget_exceeded", "message": which, "trace_id": task_id},
                    "fallback_answer": fallback_answer(trajectory),
                }),
                None,
                Some(trajectory.len()),
            )
            .await;
        self.emit_status(session_id, task_id, TaskStatus::Failed).await;
        let _ = self
            .audit(
                task_id,
                event_kind::TASK_STATUS_CHANGED,
                json!({"status": "failed", "reason": "budget_exceeded"}),
            )
            .await;
        self.persist_progress(task_id, trajectory).await;
        self.cleanup(task_id);
        FinishReason::BudgetExceeded
    }

    async fn finish_constraint(
        &self,
        session_id: &str,
        task_id: &str,
        trajectory: &Trajectory,
        which: &str,
    ) -> FinishReason {
        let reason = self
            .finish_failed(
                session_id,
                task_id,
                trajectory,
                Error::Constraint(which.to_owned()),
            )
            .await;
        match reason {
            FinishReason::Failed { .. } => FinishReason::ConstraintViolated,
            other => other,
        }
    }

    async fn step_error_finish(
        &self,
        session_id: &str,
        task_id: &str,
        trajectory: &Trajectory,
        error: Error,
    ) -> FinishReason {
        self.finish_failed(session_id, task_id, trajectory, error).await
    }

    fn cleanup(&self, task_id: &str) {
        self.ctx.inboxes.remove(task_id);
        self.ctx.cancel_map().remove(task_id);
    }
}

enum SteeringEffect {
    Continue,
    Cancelled(String),
}

enum StepOutcome {
    Action(InvokeOutcome),
    /// A bad-request observation step was synthesized; re-enter the loop.
    Synthesized,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message building
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn build_messages(
    context: &Value,
    trajectory: &Trajectory,
    tools: &[ToolDefinition],
) -> Vec<Message> {
    let tool_lines: Vec<String> = tools
        .iter()
        .map(|t| {
            format!(
                "- {}: {} (args schema: {})",
                t.name, t.description, t.parameters
            )
        })
        .collect();
    let system = format!(
        "You are a planning agent. At each step respond with exactly one JSON \
         object {{\"next_node\", \"args\"}}. `next_node` is a tool name, or \
         \"plan\" to run several tools in parallel, \"task\" to spawn a \
         background task, or \"final_response\" to answer the user.\n\
         Available tools:\n{}",
        tool_lines.join("\n")
    );

    let mut messages = vec![Message::system(system)];
    if context.as_object().map(|o| !o.is_empty()).unwrap_or(false) {
        messages.push(Message::system(format!("Session context:\n{context}")));
    }
    messages.push(Message::user(
        serde_json::to_string(&trajectory.serialize_for_llm()).unwrap_or_default(),
    ));
    messages
}

/// A safe fallback answer for user-visible failures: the last redacted
/// observation, truncated.
fn fallback_answer(trajectory: &Trajectory) -> Value {
    for step in trajectory.steps().iter().rev() {
        if let Some(obs) = &step.llm_observation {
            let serialized = serde_json::to_string(obs).unwrap_or_default();
            let mut end = serialized.len().min(400);
            while end > 0 && !serialized.is_char_boundary(end) {
                end -= 1;
            }
            return Value::String(serialized[..end].to_string());
        }
    }
    Value::Null
}

fn duration_seconds(seconds: f64) -> Duration {
    Duration::from_millis((seconds.max(0.0) * 1000.0) as u64)
}

fn chrono_seconds(seconds: f64) -> chrono::Duration {
    chrono::Duration::milliseconds((seconds.max(0.0) * 1000.0) as i64)
}
