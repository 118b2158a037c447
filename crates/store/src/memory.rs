//! Full-capability in-memory store — the default for tests and embedders
//! that bring their own durability.
//!
//! All mutation goes through synchronous crate-internal helpers so the
//! JSONL store can replay its files into the same structure without an
//! async context; the [`StateStore`] impl delegates to them.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use pf_domain::error::Result;
use pf_domain::steering::SteeringEvent;
use pf_domain::task::TaskState;
use pf_domain::trajectory::Trajectory;
use pf_domain::update::StateUpdate;

use crate::records::{artifact_ref, FlowEvent, PauseRecord, RemoteBinding};
use crate::{StateStore, StoreCapabilities};

#[derive(Default)]
struct Inner {
    events: Vec<FlowEvent>,
    event_ids: HashSet<String>,
    planner_events: Vec<FlowEvent>,
    planner_event_ids: HashSet<String>,
    bindings: HashMap<(String, String), RemoteBinding>,
    planner_states: HashMap<String, PauseRecord>,
    memory: HashMap<String, Value>,
    tasks: HashMap<String, TaskState>,
    updates: HashMap<(String, String), Vec<StateUpdate>>,
    update_ids: HashSet<(String, String, String)>,
    steering: HashMap<(String, String), Vec<SteeringEvent>>,
    steering_ids: HashSet<(String, String, String)>,
    trajectories: HashMap<String, Trajectory>,
    artifacts: HashMap<String, Value>,
}

#[derive(Default)]
pub struct MemoryStateStore {
    inner: RwLock<Inner>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Synchronous mutation helpers ───────────────────────────────

    pub(crate) fn insert_event(&self, event: FlowEvent) {
        let mut inner = self.inner.write();
        if inner.event_ids.insert(event.event_id.clone()) {
            inner.events.push(event);
        }
    }

    pub(crate) fn insert_planner_event(&self, event: FlowEvent) {
        let mut inner = self.inner.write();
        if inner.planner_event_ids.insert(event.event_id.clone()) {
            inner.planner_events.push(event);
        }
    }

    pub(crate) fn insert_binding(&self, binding: RemoteBinding) {
        self.inner
            .write()
            .bindings
            .insert((binding.session_id.clone(), binding.transport.clone()), binding);
    }

    pub(crate) fn insert_pause(&self, record: PauseRecord) {
        self.inner
            .write()
            .planner_states
            .entry(record.resume_token.clone())
            .or_insert(record);
    }

    /// Consume a pause record; `None` when unknown or already consumed.
    pub(crate) fn take_pause(&self, resume_token: &str) -> Option<PauseRecord> {
        let mut inner = self.inner.write();
        match inner.planner_states.get_mut(resume_token) {
            Some(record) if !record.consumed => {
                record.consumed = true;
                Some(record.clone())
            }
            _ => None,
        }
    }

    pub(crate) fn insert_memory(&self, session_id: &str, state: Value) {
        self.inner.write().memory.insert(session_id.to_owned(), state);
    }

    pub(crate) fn insert_task(&self, task: TaskState) {
        self.inner.write().tasks.insert(task.task_id.clone(), task);
    }

    pub(crate) fn insert_update(&self, update: StateUpdate) {
        let mut inner = self.inner.write();
        let key = (
            update.session_id.clone(),
            update.task_id.clone(),
            update.update_id.clone(),
        );
        if inner.update_ids.insert(key) {
            inner
                .updates
                .entry((update.session_id.clone(), update.task_id.clone()))
                .or_default()
                .push(update);
        }
    }

    pub(crate) fn insert_steering(&self, event: SteeringEvent) {
        let mut inner = self.inner.write();
        let key = (
            event.session_id.clone(),
            event.task_id.clone(),
            event.event_id.clone(),
        );
        if inner.steering_ids.insert(key) {
            inner
                .steering
                .entry((event.session_id.clone(), event.task_id.clone()))
                .or_default()
                .push(event);
        }
    }

    pub(crate) fn insert_trajectory(&self, task_id: &str, trajectory: Trajectory) {
        self.inner
            .write()
            .trajectories
            .insert(task_id.to_owned(), trajectory);
    }

    pub(crate) fn insert_artifact(&self, blob: Value) -> String {
        let reference = artifact_ref(&blob);
        self.inner.write().artifacts.insert(reference.clone(), blob);
        reference
    }
}

fn sort_events(events: &mut [FlowEvent]) {
    events.sort_by(|a, b| (a.ts, &a.event_id).cmp(&(b.ts, &b.event_id)));
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn save_event(&self, event: FlowEvent) -> Result<()> {
        self.insert_event(event);
        Ok(())
    }

    async fn load_history(&self, trace_id: &str) -> Result<Vec<FlowEvent>> {
        let inner = self.inner.read();
        let mut events: Vec<FlowEvent> = inner
            .events
            .iter()
            .filter(|e| e.trace_id == trace_id)
            .cloned()
            .collect();
        sort_events(&mut events);
        Ok(events)
    }

    async fn save_remote_binding(&self, binding: RemoteBinding) -> Result<()> {
        self.insert_binding(binding);
        Ok(())
    }

    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities::all()
    }

    async fn save_planner_state(&self, record: PauseRecord) -> Result<()> {
        self.insert_pause(record);
        Ok(())
    }

    async fn consume_planner_state(&self, resume_token: &str) -> Result<Option<PauseRecord>> {
        Ok(self.take_pause(resume_token))
    }

    async fn save_memory_state(&self, session_id: &str, state: Value) -> Result<()> {
        self.insert_memory(session_id, state);
        Ok(())
    }

    async fn load_memory_state(&self, session_id: &str) -> Result<Option<Value>> {
        Ok(self.inner.read().memory.get(session_id).cloned())
    }

    async fn save_task(&self, task: TaskState) -> Result<()> {
        self.insert_task(task);
        Ok(())
    }

    async fn list_tasks(&self, session_id: &str) -> Result<Vec<TaskState>> {
        let inner = self.inner.read();
        let mut tasks: Vec<TaskState> = inner
            .tasks
            .values()
            .filter(|t| t.session_id == session_id)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| (a.created_at, &a.task_id).cmp(&(b.created_at, &b.task_id)));
        Ok(tasks)
    }

    async fn save_update(&self, update: StateUpdate) -> Result<()> {
        self.insert_update(update);
        Ok(())
    }

    async fn list_updates(
        &self,
        session_id: &str,
        task_id: &str,
        since_update_id: Option<&str>,
    ) -> Result<Vec<StateUpdate>> {
        let inner = self.inner.read();
        let mut updates: Vec<StateUpdate> = inner
            .updates
            .get(&(session_id.to_owned(), task_id.to_owned()))
            .map(|v| v.as_slice())
            .unwrap_or_default()
            .iter()
            .filter(|u| match since_update_id {
                Some(cursor) => u.update_id.as_str() > cursor,
                None => true,
            })
            .cloned()
            .collect();
        updates.sort_by(|a, b| a.update_id.cmp(&b.update_id));
        Ok(updates)
    }

    async fn save_steering(&self, event: SteeringEvent) -> Result<()> {
        self.insert_steering(event);
        Ok(())
    }

    async fn list_steering(&self, session_id: &str, task_id: &str) -> Result<Vec<SteeringEvent>> {
        let inner = self.inner.read();
        let mut events: Vec<SteeringEvent> = inner
            .steering
            .get(&(session_id.to_owned(), task_id.to_owned()))
            .cloned()
            .unwrap_or_default();
        events.sort_by(|a, b| (a.created_at, &a.event_id).cmp(&(b.created_at, &b.event_id)));
        Ok(events)
    }

    async fn save_trajectory(&self, task_id: &str, trajectory: &Trajectory) -> Result<()> {
        self.insert_trajectory(task_id, trajectory.clone());
        Ok(())
    }

    async fn get_trajectory(&self, task_id: &str) -> Result<Option<Trajectory>> {
        Ok(self.inner.read().trajectories.get(task_id).cloned())
    }

    async fn list_traces(&self, session_id: &str) -> Result<Vec<String>> {
        let inner = self.inner.read();
        let mut ids: Vec<String> = inner
            .trajectories
            .keys()
            .filter(|task_id| {
                inner
                    .tasks
                    .get(*task_id)
                    .map(|t| t.session_id == session_id)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn save_planner_event(&self, event: FlowEvent) -> Result<()> {
        self.insert_planner_event(event);
        Ok(())
    }

    async fn list_planner_events(
        &self,
        trace_id: &str,
        since_event_id: Option<&str>,
    ) -> Result<Vec<FlowEvent>> {
        let inner = self.inner.read();
        let mut events: Vec<FlowEvent> = inner
            .planner_events
            .iter()
            .filter(|e| e.trace_id == trace_id)
            .cloned()
            .collect();
        sort_events(&mut events);
        if let Some(cursor) = since_event_id {
            if let Some(idx) = events.iter().position(|e| e.event_id == cursor) {
                events.drain(..=idx);
            }
        }
        Ok(events)
    }

    async fn put_artifact(&self, blob: Value) -> Result<String> {
        Ok(self.insert_artifact(blob))
    }

    async fn get_artifact(&self, artifact_ref: &str) -> Result<Option<Value>> {
        Ok(self.inner.read().artifacts.get(artifact_ref).cloned())
    }
}
