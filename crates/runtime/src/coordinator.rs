//! The session coordinator — one single-writer command loop per session.
//!
//! All mutations to a session's registry, foreground context, and merge
//! state flow through this loop, which removes lock-step races without any
//! global locking. The coordinator spawns planner runs (foreground and
//! background), routes steering (including the `"foreground"` pseudo task
//! id), releases queued tasks as slots free, seals groups when the
//! foreground yields, applies context patches under their merge strategy,
//! and emits the exactly-once group reports.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use pf_domain::error::{Error, Result};
use pf_domain::snapshot::{ContextPatch, MergeStrategy};
use pf_domain::steering::{SteeringEvent, SteeringKind};
use pf_domain::task::{TaskSpawnSpec, TaskState, TaskStatus, TaskType};
use pf_domain::update::{StateUpdate, UpdateType};

use pf_store::event_kind;

use crate::groups::GroupReport;
use crate::planner::{FinishReason, PlannerRuntime, RuntimeContext, SchedMsg, TaskRun};
use crate::registry::SpawnOutcome;
use crate::snapshot::{freeze_snapshot, MergeDirective, MergeOutcome};

/// Pseudo task id steering clients may address: resolves to the current
/// foreground task.
pub const FOREGROUND_TASK: &str = "foreground";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Public request types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub task_type: TaskType,
    pub query: String,
    pub description: Option<String>,
    pub priority: i32,
    pub idempotency_key: Option<String>,
}

impl SpawnRequest {
    pub fn foreground(query: impl Into<String>) -> Self {
        Self {
            task_type: TaskType::Foreground,
            query: query.into(),
            description: None,
            priority: 0,
            idempotency_key: None,
        }
    }

    pub fn background(query: impl Into<String>) -> Self {
        Self {
            task_type: TaskType::Background,
            query: query.into(),
            description: None,
            priority: 0,
            idempotency_key: None,
        }
    }
}

enum Command {
    Spawn {
        req: SpawnRequest,
        reply: oneshot::Sender<Result<String>>,
    },
    Steer {
        event: SteeringEvent,
        reply: oneshot::Sender<Result<bool>>,
    },
    ApplyPatch {
        patch: ContextPatch,
        directive: MergeDirective,
        reply: oneshot::Sender<Result<MergeOutcome>>,
    },
    ForegroundContext {
        reply: oneshot::Sender<Value>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Coordinator handle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SessionCoordinator {
    session_id: String,
    ctx: Arc<RuntimeContext>,
    tx: mpsc::Sender<Command>,
}

impl SessionCoordinator {
    pub fn start(session_id: impl Into<String>, ctx: Arc<RuntimeContext>) -> Self {
        let session_id = session_id.into();
        let (tx, rx) = mpsc::channel(64);
        let (worker, internal_rx) = Worker::new(session_id.clone(), ctx.clone());
        tokio::spawn(worker.run(rx, internal_rx));
        Self {
            session_id,
            ctx,
            tx,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Record a transport binding for this session (idempotent per
    /// `(session, transport)`). The transport itself lives outside this
    /// crate; only the durable binding is our concern.
    pub async fn connect(&self, transport: &str, remote_id: &str) -> Result<()> {
        self.ctx
            .store
            .save_remote_binding(pf_store::RemoteBinding {
                session_id: self.session_id.clone(),
                remote_id: remote_id.to_owned(),
                transport: transport.to_owned(),
                created_at: Utc::now(),
            })
            .await
            .map_err(|e| Error::StoreCore(e.to_string()))
    }

    /// Spawn a task and return its id (the task may be queued).
    pub async fn spawn_task(&self, req: SpawnRequest) -> Result<String> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Spawn { req, reply }).await?;
        rx.await
            .map_err(|_| Error::Other("coordinator stopped".into()))?
    }

    /// Route a steering event. Returns whether it was accepted.
    pub async fn steer(&self, event: SteeringEvent) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Steer { event, reply }).await?;
        rx.await
            .map_err(|_| Error::Other("coordinator stopped".into()))?
    }

    /// Apply (or queue) a context patch against the foreground context.
    pub async fn apply_context_patch(
        &self,
        patch: ContextPatch,
        directive: MergeDirective,
    ) -> Result<MergeOutcome> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ApplyPatch { patch, directive, reply }).await?;
        rx.await
            .map_err(|_| Error::Other("coordinator stopped".into()))?
    }

    /// Read-only task lookup (registry reads need no serialization).
    pub fn get_task_state(&self, task_id: &str) -> Option<TaskState> {
        self.ctx.registry.get(task_id)
    }

    /// Subscribe to a task's update stream, replaying from the exclusive
    /// cursor first.
    pub fn subscribe(
        &self,
        task_id: &str,
        since_update_id: Option<String>,
    ) -> mpsc::Receiver<StateUpdate> {
        self.ctx.sink.subscribe(&self.session_id, task_id, since_update_id)
    }

    /// The current foreground LLM context (a detached copy).
    pub async fn foreground_context(&self) -> Result<Value> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ForegroundContext { reply }).await?;
        rx.await.map_err(|_| Error::Other("coordinator stopped".into()))
    }

    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Shutdown { reply }).await?;
        let _ = rx.await;
        Ok(())
    }

    async fn send(&self, cmd: Command) -> Result<()> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| Error::Other("coordinator stopped".into()))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Worker — the single writer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum Internal {
    Sched(SchedMsg),
    Finished { task_id: String, reason: FinishReason },
}

struct Worker {
    session_id: String,
    ctx: Arc<RuntimeContext>,
    /// Live foreground LLM context; foreground runs share this handle.
    context: Arc<RwLock<Value>>,
    /// Current foreground turn (group name resolution scope).
    turn_id: String,
    /// Steering addressed to "foreground" while none is running.
    buffered_foreground: Vec<SteeringEvent>,
    /// Tasks handed to a planner run that may not have flipped to Running
    /// yet (prevents double-starts from the pending queue).
    started: HashSet<String>,
    /// Pause tokens for paused tasks, by task id.
    resume_tokens: HashMap<String, String>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    sched_tx: mpsc::UnboundedSender<SchedMsg>,
}

impl Worker {
    fn new(
        session_id: String,
        ctx: Arc<RuntimeContext>,
    ) -> (Self, mpsc::UnboundedReceiver<Internal>) {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (sched_tx, mut sched_rx) = mpsc::unbounded_channel::<SchedMsg>();
        // Forward scheduler messages from planner runs into the worker.
        let forward = internal_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = sched_rx.recv().await {
                if forward.send(Internal::Sched(msg)).is_err() {
                    return;
                }
            }
        });
        let worker = Self {
            session_id,
            ctx,
            context: Arc::new(RwLock::new(Value::Object(Map::new()))),
            turn_id: Uuid::new_v4().to_string(),
            buffered_foreground: Vec::new(),
            started: HashSet::new(),
            resume_tokens: HashMap::new(),
            internal_tx,
            sched_tx,
        };
        (worker, internal_rx)
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut internal_rx: mpsc::UnboundedReceiver<Internal>,
    ) {
        loop {
            tokio::select! {
                cmd = commands.recv() => {
                    match cmd {
                        Some(Command::Spawn { req, reply }) => {
                            let _ = reply.send(self.handle_spawn(req).await);
                        }
                        Some(Command::Steer { event, reply }) => {
                            let _ = reply.send(self.handle_steer(event).await);
                        }
                        Some(Command::ApplyPatch { patch, directive, reply }) => {
                            let _ = reply.send(self.handle_patch(patch, directive).await);
                        }
                        Some(Command::ForegroundContext { reply }) => {
                            let _ = reply.send(self.context.read().clone());
                        }
                        Some(Command::Shutdown { reply }) => {
                            let _ = reply.send(());
                            return;
                        }
                        None => return,
                    }
                }
                Some(internal) = internal_rx.recv() => {
                    match internal {
                        Internal::Sched(SchedMsg::StartTask { task_id }) => {
                            self.start_task(&task_id);
                        }
                        Internal::Finished { task_id, reason } => {
                            self.handle_finished(&task_id, reason).await;
                        }
                    }
                }
            }
        }
    }

    // ── Spawning ───────────────────────────────────────────────────

    async fn handle_spawn(&mut self, req: SpawnRequest) -> Result<String> {
        let snapshot = freeze_snapshot(
            &self.context.read(),
            self.ctx
                .tools
                .visible_specs()
                .iter()
                .map(|s| s.name.clone())
                .collect(),
            pf_domain::snapshot::MemorySnapshot::Isolated,
            Vec::new(),
        )?;
        let spec = TaskSpawnSpec {
            session_id: self.session_id.clone(),
            task_type: req.task_type,
            query: req.query.clone(),
            description: req.description,
            priority: req.priority,
            group_id: None,
            idempotency_key: req.idempotency_key,
            context_snapshot: snapshot,
        };
        let (task, outcome) = self.ctx.registry.spawn(spec)?;
        if outcome == SpawnOutcome::Existing {
            return Ok(task.task_id);
        }

        self.ctx
            .store
            .save_event(pf_store::FlowEvent::new(
                &task.task_id,
                event_kind::TASK_CREATED,
                json!({"session_id": self.session_id, "query": req.query}),
            ))
            .await
            .map_err(|e| Error::StoreCore(e.to_string()))?;

        if req.task_type == TaskType::Foreground {
            // A new foreground turn begins; deliver any buffered steering.
            self.turn_id = Uuid::new_v4().to_string();
            let inbox = self.ctx.inboxes.for_task(&task.task_id);
            for mut event in self.buffered_foreground.drain(..) {
                event.task_id = task.task_id.clone();
                inbox.push(event);
            }
        }

        if outcome == SpawnOutcome::Created {
            self.start_task(&task.task_id);
        }
        Ok(task.task_id)
    }

    fn start_task(&mut self, task_id: &str) {
        if self.started.contains(task_id) {
            return;
        }
        let task = match self.ctx.registry.get(task_id) {
            Some(t) if !t.is_terminal() => t,
            _ => return,
        };
        self.started.insert(task_id.to_owned());
        self.ctx.cancel_map().register(task_id);

        let context = match task.task_type {
            TaskType::Foreground => self.context.clone(),
            TaskType::Background => {
                Arc::new(RwLock::new(task.context_snapshot.llm_context.clone()))
            }
        };
        let run = TaskRun {
            task_id: task_id.to_owned(),
            context,
            turn_id: self.turn_id.clone(),
            sched: Some(self.sched_tx.clone()),
        };
        let planner = PlannerRuntime::new(self.ctx.clone());
        let done = self.internal_tx.clone();
        let task_id = task_id.to_owned();
        tokio::spawn(async move {
            let reason = planner.run_task(run).await;
            let _ = done.send(Internal::Finished { task_id, reason });
        });
    }

    fn resume_task(&mut self, task_id: &str, resume_token: String) {
        let task = match self.ctx.registry.get(task_id) {
            Some(t) => t,
            None => return,
        };
        self.started.insert(task_id.to_owned());
        let context = match task.task_type {
            TaskType::Foreground => self.context.clone(),
            TaskType::Background => {
                Arc::new(RwLock::new(task.context_snapshot.llm_context.clone()))
            }
        };
        let run = TaskRun {
            task_id: task_id.to_owned(),
            context,
            turn_id: self.turn_id.clone(),
            sched: Some(self.sched_tx.clone()),
        };
        let planner = PlannerRuntime::new(self.ctx.clone());
        let done = self.internal_tx.clone();
        let task_id = task_id.to_owned();
        tokio::spawn(async move {
            match planner.resume(&resume_token, run).await {
                Ok(Some(reason)) => {
                    let _ = done.send(Internal::Finished { task_id, reason });
                }
                // Consumed token: the resume was a no-op.
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(error = %e, %task_id, "resume failed");
                    let _ = done.send(Internal::Finished {
                        task_id,
                        reason: FinishReason::Failed { kind: "resume".into() },
                    });
                }
            }
        });
    }

    // ── Steering ───────────────────────────────────────────────────

    async fn handle_steer(&mut self, mut event: SteeringEvent) -> Result<bool> {
        event.session_id = self.session_id.clone();

        // Patch approvals act on the session's foreground context, which
        // this worker owns; they never travel through a task inbox.
        if matches!(event.kind, SteeringKind::Approve | SteeringKind::Reject) {
            return self.handle_approval(&event).await;
        }

        // Resolve the foreground pseudo id.
        if event.task_id == FOREGROUND_TASK {
            match self.ctx.registry.running_foreground(&self.session_id) {
                Some(task) => event.task_id = task.task_id,
                None => {
                    let pending_foreground = !self
                        .ctx
                        .registry
                        .list(&self.session_id, Some(TaskStatus::Pending))
                        .iter()
                        .filter(|t| t.task_type == TaskType::Foreground)
                        .collect::<Vec<_>>()
                        .is_empty();
                    if pending_foreground || !self.ctx.config.tasks.reject_unroutable_steering {
                        self.buffered_foreground.push(event);
                        return Ok(true);
                    }
                    return Ok(false);
                }
            }
        }

        let task = self
            .ctx
            .registry
            .get(&event.task_id)
            .ok_or_else(|| Error::Validation(format!("unknown task {}", event.task_id)))?;

        // Paused and pending tasks have no loop draining their inbox;
        // control events act here, everything else queues for later.
        match (task.status, event.kind) {
            (status, _) if status.is_terminal() => Ok(false),
            (TaskStatus::Pending, SteeringKind::Cancel) => {
                let reason = event
                    .payload
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("cancelled")
                    .to_owned();
                self.ctx.registry.cancel(&event.task_id, &reason, true)?;
                Ok(true)
            }
            (TaskStatus::Paused, SteeringKind::Resume) => {
                if let Some(token) = self.resume_tokens.remove(&event.task_id) {
                    self.resume_task(&event.task_id, token);
                }
                Ok(true)
            }
            (TaskStatus::Paused, SteeringKind::Cancel) => {
                let reason = event
                    .payload
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("cancelled")
                    .to_owned();
                self.ctx.registry.cancel(&event.task_id, &reason, true)?;
                self.resume_tokens.remove(&event.task_id);
                Ok(true)
            }
            _ => {
                let inbox = self.ctx.inboxes.for_task(&event.task_id);
                Ok(inbox.push(event))
            }
        }
    }

    async fn handle_approval(&mut self, event: &SteeringEvent) -> Result<bool> {
        let patch_id = match event.payload.get("patch_id").and_then(Value::as_str) {
            Some(id) => id.to_owned(),
            None => return Ok(false),
        };
        match event.kind {
            SteeringKind::Approve => {
                let current_event_id = self.current_foreground_event_id();
                let approved = {
                    let mut context = self.context.write();
                    self.ctx
                        .merges
                        .approve(&mut context, &patch_id, current_event_id.as_deref())?
                };
                match approved {
                    Some((patch, outcome)) => {
                        self.report_patch_outcome(&patch, &outcome).await;
                        let stream_task = self
                            .ctx
                            .registry
                            .running_foreground(&self.session_id)
                            .map(|t| t.task_id)
                            .unwrap_or_else(|| patch.task_id.clone());
                        self.ctx
                            .sink
                            .emit(
                                &self.session_id,
                                &stream_task,
                                UpdateType::Notification,
                                json!({
                                    "title": "Context patch applied",
                                    "patch_id": patch.patch_id,
                                    "task_id": patch.task_id,
                                }),
                                None,
                                None,
                            )
                            .await;
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }
            SteeringKind::Reject => Ok(self.ctx.merges.reject(&patch_id)),
            _ => Ok(false),
        }
    }

    // ── Patches ────────────────────────────────────────────────────

    async fn handle_patch(
        &mut self,
        patch: ContextPatch,
        directive: MergeDirective,
    ) -> Result<MergeOutcome> {
        let current_event_id = self.current_foreground_event_id();
        let outcome = {
            let mut context = self.context.write();
            self.ctx
                .merges
                .apply(&mut context, &patch, &directive, current_event_id.as_deref())?
        };
        self.report_patch_outcome(&patch, &outcome).await;
        Ok(outcome)
    }

    fn current_foreground_event_id(&self) -> Option<String> {
        self.ctx
            .registry
            .running_foreground(&self.session_id)
            .and_then(|t| self.ctx.sink.last_update_id(&self.session_id, &t.task_id))
    }

    async fn report_patch_outcome(&self, patch: &ContextPatch, outcome: &MergeOutcome) {
        let stream_task = self
            .ctx
            .registry
            .running_foreground(&self.session_id)
            .map(|t| t.task_id)
            .unwrap_or_else(|| patch.task_id.clone());
        match outcome {
            MergeOutcome::Queued => {
                self.ctx
                    .sink
                    .emit(
                        &self.session_id,
                        &stream_task,
                        UpdateType::Notification,
                        json!({
                            "title": "Research complete",
                            "patch_id": patch.patch_id,
                            "task_id": patch.task_id,
                            "actions": [{"id": "apply"}, {"id": "reject"}],
                        }),
                        None,
                        None,
                    )
                    .await;
                let _ = self
                    .ctx
                    .store
                    .save_event(pf_store::FlowEvent::new(
                        &patch.task_id,
                        event_kind::TASK_CONTEXT_PATCH_READY,
                        json!({"patch_id": patch.patch_id}),
                    ))
                    .await;
            }
            MergeOutcome::Applied { diverged } => {
                if *diverged {
                    self.ctx
                        .sink
                        .emit(
                            &self.session_id,
                            &stream_task,
                            UpdateType::Notification,
                            json!({
                                "title": "Context merged after divergence",
                                "detail": "the conversation advanced while this task ran",
                                "patch_id": patch.patch_id,
                            }),
                            None,
                            None,
                        )
                        .await;
                }
                let _ = self
                    .ctx
                    .store
                    .save_event(pf_store::FlowEvent::new(
                        &patch.task_id,
                        event_kind::TASK_CONTEXT_PATCH_APPLIED,
                        json!({"patch_id": patch.patch_id, "diverged": diverged}),
                    ))
                    .await;
            }
            MergeOutcome::Duplicate => {}
        }
    }

    // ── Completion plumbing ────────────────────────────────────────

    async fn handle_finished(&mut self, task_id: &str, reason: FinishReason) {
        self.started.remove(task_id);
        if let FinishReason::Paused { resume_token } = &reason {
            self.resume_tokens
                .insert(task_id.to_owned(), resume_token.clone());
        }

        let task = match self.ctx.registry.get(task_id) {
            Some(t) => t,
            None => return,
        };

        // Background completion: turn the result into a context patch.
        if task.task_type == TaskType::Background
            && task.status == TaskStatus::Complete
            && reason == FinishReason::Completed
        {
            let patch = patch_from_task(&task);
            let directive = self.merge_directive_for(&task);
            let current_event_id = self.current_foreground_event_id();
            let outcome = {
                let mut context = self.context.write();
                self.ctx
                    .merges
                    .apply(&mut context, &patch, &directive, current_event_id.as_deref())
            };
            match outcome {
                Ok(outcome) => {
                    if let Some(group_id) = &task.group_id {
                        if outcome == MergeOutcome::Queued {
                            self.ctx.groups.add_patch(group_id, &patch.patch_id);
                        }
                    }
                    self.report_patch_outcome(&patch, &outcome).await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, task_id, "context patch failed to apply");
                }
            }
        }

        // Foreground yield: auto-seal this turn's open groups.
        if task.task_type == TaskType::Foreground
            && task.is_terminal()
            && self.ctx.config.groups.auto_seal_groups_on_foreground_yield
        {
            for group in self
                .ctx
                .groups
                .seal_open_for_turn(&self.session_id, &self.turn_id)
            {
                self.check_group(&group.group_id).await;
            }
        }

        // Group completion check for this member.
        if let Some(group_id) = &task.group_id {
            if task.is_terminal() {
                self.check_group(group_id).await;
            }
        }

        // Free slot: release the next queued task(s).
        while let Some(next) = self.ctx.registry.next_runnable(&self.session_id) {
            if self.started.contains(&next.task_id) {
                break;
            }
            self.start_task(&next.task_id);
        }
    }

    fn merge_directive_for(&self, task: &TaskState) -> MergeDirective {
        let strategy = task
            .group_id
            .as_ref()
            .and_then(|gid| self.ctx.groups.get(gid))
            .map(|g| g.merge_strategy)
            .unwrap_or(self.ctx.config.groups.default_group_merge_strategy);
        match strategy {
            MergeStrategy::Append => MergeDirective::Append,
            MergeStrategy::HumanGated => MergeDirective::HumanGated,
            // Replace without a named key degrades to append; embedders
            // that want replace semantics route through apply_context_patch.
            MergeStrategy::Replace => MergeDirective::Append,
        }
    }

    async fn check_group(&self, group_id: &str) {
        let registry = self.ctx.registry.clone();
        let report = self
            .ctx
            .groups
            .try_complete(group_id, |id| registry.get(id).map(|t| t.status));
        if let Some(report) = report {
            self.emit_group_report(report).await;
        }
    }

    /// The group-level RESULT: deterministic update id + idempotent store
    /// writes keep this exactly-once even across restarts.
    async fn emit_group_report(&self, report: GroupReport) {
        let group = &report.group;
        let human_gated = group.merge_strategy == MergeStrategy::HumanGated;
        let mut content = json!({
            "group_id": group.group_id,
            "display_name": group.display_name,
            "status": group.status,
            "members": group.task_ids,
            "failed_members": report.failed_members,
            "cancelled_members": report.cancelled_members,
        });
        if let Some(obj) = content.as_object_mut() {
            if human_gated {
                // No synthesis before bundled approval; surface only the
                // patch ids awaiting it.
                obj.insert("requires_approval".into(), json!(true));
                obj.insert("pending_patches".into(), json!(group.pending_patches));
            } else {
                let results: Vec<Value> = group
                    .task_ids
                    .iter()
                    .filter_map(|id| self.ctx.registry.get(id))
                    .map(|t| json!({"task_id": t.task_id, "result": t.result}))
                    .collect();
                obj.insert("results".into(), json!(results));
            }
        }

        self.ctx
            .sink
            .emit_with_id(StateUpdate {
                session_id: self.session_id.clone(),
                task_id: group.group_id.clone(),
                update_id: format!("group-{}-report", group.group_id),
                update_type: UpdateType::Result,
                content,
                step_index: None,
                total_steps: None,
                created_at: Utc::now(),
            })
            .await;
    }
}

/// Build the merge payload from a finished background task's result.
fn patch_from_task(task: &TaskState) -> ContextPatch {
    let mut patch = ContextPatch::new(
        task.task_id.clone(),
        task.context_snapshot.spawned_from_event_id.clone(),
    );
    if let Some(result) = &task.result {
        if let Some(answer) = result.get("answer").and_then(Value::as_str) {
            patch.digest.push(answer.to_owned());
        }
        if let Some(sources) = result.get("sources").and_then(Value::as_array) {
            patch.sources = sources
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect();
        }
        if let Some(artifacts) = result.get("artifacts").and_then(Value::as_array) {
            patch.artifacts = artifacts
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect();
        }
    }
    patch
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_from_task_pulls_result_fields() {
        let spec = TaskSpawnSpec {
            session_id: "s1".into(),
            task_type: TaskType::Background,
            query: "q".into(),
            description: None,
            priority: 0,
            group_id: None,
            idempotency_key: None,
            context_snapshot: pf_domain::snapshot::TaskContextSnapshot::empty()
                .with_provenance("parent", "ev-7", None),
        };
        let mut task = TaskState::new(spec);
        task.result = Some(json!({
            "answer": "Q4 grew 12%",
            "sources": ["report.pdf"],
            "artifacts": ["art-1"],
        }));

        let patch = patch_from_task(&task);
        assert_eq!(patch.digest, vec!["Q4 grew 12%"]);
        assert_eq!(patch.sources, vec!["report.pdf"]);
        assert_eq!(patch.artifacts, vec!["art-1"]);
        assert_eq!(patch.spawned_from_event_id.as_deref(), Some("ev-7"));
    }

    #[test]
    fn spawn_request_builders() {
        let fg = SpawnRequest::foreground("analyze");
        assert_eq!(fg.task_type, TaskType::Foreground);
        let bg = SpawnRequest::background("research");
        assert_eq!(bg.task_type, TaskType::Background);
    }
}
