//! Per-session task registry.
//!
//! Owns every task record for its sessions: spawn (idempotent under an
//! idempotency key), per-session limits with a priority-ordered pending
//! queue, the one-running-foreground policy, validated lifecycle
//! transitions, and best-effort preemptive cancellation with descendant
//! cascade.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;

use pf_domain::config::TaskLimitsConfig;
use pf_domain::error::{Error, Result};
use pf_domain::task::{TaskSpawnSpec, TaskState, TaskStatus, TaskType};
use pf_domain::trace::FlowTrace;

use crate::cancel::CancelMap;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Spawn outcome
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnOutcome {
    /// New task with a free slot; the caller should start it now.
    Created,
    /// Same idempotency key already live; the existing record is returned.
    Existing,
    /// New task, but the session is at capacity; it waits in the pending
    /// queue until a slot frees.
    Queued,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
struct Inner {
    tasks: HashMap<String, TaskState>,
    /// (session_id, idempotency_key) → task_id.
    by_idempotency: HashMap<(String, String), String>,
    /// parent task → direct children.
    children: HashMap<String, Vec<String>>,
}

pub struct TaskRegistry {
    inner: RwLock<Inner>,
    cancel_map: Arc<CancelMap>,
    limits: TaskLimitsConfig,
    /// Woken whenever any task reaches a terminal status (retain-turn
    /// waiters re-check their predicate on each wake).
    terminal_notify: tokio::sync::Notify,
}

impl TaskRegistry {
    pub fn new(limits: TaskLimitsConfig, cancel_map: Arc<CancelMap>) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            cancel_map,
            limits: limits.clamped(),
            terminal_notify: tokio::sync::Notify::new(),
        }
    }

    pub fn cancel_map(&self) -> &Arc<CancelMap> {
        &self.cancel_map
    }

    pub fn terminal_notify(&self) -> &tokio::sync::Notify {
        &self.terminal_notify
    }

    /// Create (or return) a task. The new record is always `Pending`; the
    /// outcome says whether a slot is free to start it immediately.
    pub fn spawn(&self, spec: TaskSpawnSpec) -> Result<(TaskState, SpawnOutcome)> {
        let mut inner = self.inner.write();

        // Idempotency: a live task with the same key wins.
        if let Some(key) = &spec.idempotency_key {
            let map_key = (spec.session_id.clone(), key.clone());
            if let Some(task_id) = inner.by_idempotency.get(&map_key) {
                if let Some(existing) = inner.tasks.get(task_id) {
                    if !existing.is_terminal() {
                        return Ok((existing.clone(), SpawnOutcome::Existing));
                    }
                }
            }
        }

        let session_total = inner
            .tasks
            .values()
            .filter(|t| t.session_id == spec.session_id)
            .count();
        if session_total >= self.limits.max_total_tasks {
            return Err(Error::Constraint(format!(
                "session {} at max_total_tasks ({})",
                spec.session_id, self.limits.max_total_tasks
            )));
        }

        let slot_free = self.slot_free_locked(&inner, &spec.session_id, spec.task_type);

        let task = TaskState::new(spec);
        if let Some(key) = &task.idempotency_key {
            inner
                .by_idempotency
                .insert((task.session_id.clone(), key.clone()), task.task_id.clone());
        }
        if let Some(parent) = &task.context_snapshot.spawned_from_task_id {
            inner
                .children
                .entry(parent.clone())
                .or_default()
                .push(task.task_id.clone());
            self.cancel_map.add_child(parent, &task.task_id);
        }
        inner.tasks.insert(task.task_id.clone(), task.clone());

        let outcome = if slot_free {
            SpawnOutcome::Created
        } else {
            SpawnOutcome::Queued
        };
        FlowTrace::TaskSpawned {
            session_id: task.session_id.clone(),
            task_id: task.task_id.clone(),
            task_type: format!("{:?}", task.task_type),
            queued: outcome == SpawnOutcome::Queued,
        }
        .emit();
        Ok((task, outcome))
    }

    fn slot_free_locked(&self, inner: &Inner, session_id: &str, task_type: TaskType) -> bool {
        let running = inner
            .tasks
            .values()
            .filter(|t| t.session_id == session_id && t.status == TaskStatus::Running)
            .count();
        if running >= self.limits.max_concurrent_tasks {
            return false;
        }
        if task_type == TaskType::Foreground {
            let fg_running = inner.tasks.values().any(|t| {
                t.session_id == session_id
                    && t.task_type == TaskType::Foreground
                    && t.status == TaskStatus::Running
            });
            if fg_running {
                return false;
            }
        }
        true
    }

    pub fn get(&self, task_id: &str) -> Option<TaskState> {
        self.inner.read().tasks.get(task_id).cloned()
    }

    pub fn list(&self, session_id: &str, status: Option<TaskStatus>) -> Vec<TaskState> {
        let inner = self.inner.read();
        let mut tasks: Vec<TaskState> = inner
            .tasks
            .values()
            .filter(|t| t.session_id == session_id)
            .filter(|t| status.map(|s| t.status == s).unwrap_or(true))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| (a.created_at, &a.task_id).cmp(&(b.created_at, &b.task_id)));
        tasks
    }

    /// Mutate a task in place. Returns true when the task exists.
    pub fn update<F>(&self, task_id: &str, f: F) -> bool
    where
        F: FnOnce(&mut TaskState),
    {
        let mut inner = self.inner.write();
        if let Some(task) = inner.tasks.get_mut(task_id) {
            f(task);
            task.updated_at = Utc::now();
            return true;
        }
        false
    }

    /// Validated lifecycle transition. Terminal states are absorbing.
    pub fn transition(&self, task_id: &str, to: TaskStatus) -> Result<TaskState> {
        let mut inner = self.inner.write();
        let task = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| Error::Validation(format!("unknown task {task_id}")))?;
        if !task.status.can_transition(to) {
            return Err(Error::Validation(format!(
                "invalid transition {:?} -> {to:?} for task {task_id}",
                task.status
            )));
        }
        let from = task.status;
        task.status = to;
        task.updated_at = Utc::now();
        let snapshot = task.clone();
        drop(inner);

        FlowTrace::TaskStatusChanged {
            task_id: task_id.to_owned(),
            from: format!("{from:?}"),
            to: format!("{to:?}"),
        }
        .emit();
        if to.is_terminal() {
            self.terminal_notify.notify_waiters();
        }
        Ok(snapshot)
    }

    /// Best-effort preemptive cancel. Returns the cancelled record, or
    /// `None` when the task was already terminal (cancel ignored).
    pub fn cancel(
        &self,
        task_id: &str,
        reason: &str,
        cascade: bool,
    ) -> Result<Option<TaskState>> {
        let targets = {
            let inner = self.inner.read();
            if !inner.tasks.contains_key(task_id) {
                return Err(Error::Validation(format!("unknown task {task_id}")));
            }
            let mut targets = vec![task_id.to_owned()];
            if cascade {
                let mut stack = vec![task_id.to_owned()];
                while let Some(current) = stack.pop() {
                    if let Some(kids) = inner.children.get(&current) {
                        for kid in kids {
                            targets.push(kid.clone());
                            stack.push(kid.clone());
                        }
                    }
                }
            }
            targets
        };

        let mut cancelled_root = None;
        {
            let mut inner = self.inner.write();
            for target in &targets {
                if let Some(task) = inner.tasks.get_mut(target) {
                    if task.is_terminal() {
                        continue;
                    }
                    task.status = TaskStatus::Cancelled;
                    task.error = Some(reason.to_owned());
                    task.updated_at = Utc::now();
                    if target == task_id {
                        cancelled_root = Some(task.clone());
                    }
                }
            }
        }

        // Signal tokens after the records flip so observers that poll state
        // never see a signalled-but-running task.
        self.cancel_map.cancel(task_id, cascade);
        self.terminal_notify.notify_waiters();
        Ok(cancelled_root)
    }

    /// Owner-only transition helpers.
    pub fn pause(&self, task_id: &str) -> Result<TaskState> {
        self.transition(task_id, TaskStatus::Paused)
    }

    pub fn resume(&self, task_id: &str) -> Result<TaskState> {
        self.transition(task_id, TaskStatus::Running)
    }

    pub fn prioritize(&self, task_id: &str, priority: i32) -> Result<TaskState> {
        let mut inner = self.inner.write();
        let task = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| Error::Validation(format!("unknown task {task_id}")))?;
        task.priority = priority;
        task.updated_at = Utc::now();
        Ok(task.clone())
    }

    /// The highest-priority pending task that a free slot could run now.
    /// Ties break by spawn order.
    pub fn next_runnable(&self, session_id: &str) -> Option<TaskState> {
        let inner = self.inner.read();
        let mut pending: Vec<&TaskState> = inner
            .tasks
            .values()
            .filter(|t| t.session_id == session_id && t.status == TaskStatus::Pending)
            .collect();
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.task_id.cmp(&b.task_id))
        });
        pending
            .into_iter()
            .find(|t| self.slot_free_locked(&inner, session_id, t.task_type))
            .cloned()
    }

    pub fn running_foreground(&self, session_id: &str) -> Option<TaskState> {
        self.inner
            .read()
            .tasks
            .values()
            .find(|t| {
                t.session_id == session_id
                    && t.task_type == TaskType::Foreground
                    && t.status == TaskStatus::Running
            })
            .cloned()
    }

    pub fn descendants(&self, task_id: &str) -> Vec<String> {
        let inner = self.inner.read();
        let mut out = Vec::new();
        let mut stack = vec![task_id.to_owned()];
        while let Some(current) = stack.pop() {
            if let Some(kids) = inner.children.get(&current) {
                for kid in kids {
                    out.push(kid.clone());
                    stack.push(kid.clone());
                }
            }
        }
        out
    }

    /// Aggregate LLM usage across a session's tasks:
    /// `(input_tokens, output_tokens, cost_usd)`.
    pub fn session_usage(&self, session_id: &str) -> (u64, u64, f64) {
        let inner = self.inner.read();
        inner
            .tasks
            .values()
            .filter(|t| t.session_id == session_id)
            .fold((0, 0, 0.0), |(input, output, cost), t| {
                (
                    input + t.input_tokens,
                    output + t.output_tokens,
                    cost + t.cost_usd,
                )
            })
    }

    /// Task counts by status (dashboard-style aggregation).
    pub fn status_counts(&self, session_id: &str) -> HashMap<String, usize> {
        let inner = self.inner.read();
        let mut counts = HashMap::new();
        for task in inner.tasks.values().filter(|t| t.session_id == session_id) {
            let key = serde_json::to_value(task.status)
                .ok()
                .and_then(|v| v.as_str().map(String::from))
                .unwrap_or_else(|| format!("{:?}", task.status).to_lowercase());
            *counts.entry(key).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pf_domain::snapshot::TaskContextSnapshot;

    fn registry(max_concurrent: usize) -> TaskRegistry {
        let limits = TaskLimitsConfig {
            max_concurrent_tasks: max_concurrent,
            max_total_tasks: 10,
            ..Default::default()
        };
        TaskRegistry::new(limits, Arc::new(CancelMap::new()))
    }

    fn spec(session: &str, task_type: TaskType) -> TaskSpawnSpec {
        TaskSpawnSpec {
            session_id: session.into(),
            task_type,
            query: "q".into(),
            description: None,
            priority: 0,
            group_id: None,
            idempotency_key: None,
            context_snapshot: TaskContextSnapshot::empty(),
        }
    }

    #[test]
    fn spawn_creates_pending() {
        let reg = registry(2);
        let (task, outcome) = reg.spawn(spec("s1", TaskType::Background)).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(outcome, SpawnOutcome::Created);
    }

    #[test]
    fn idempotent_spawn_returns_same_task() {
        let reg = registry(2);
        let mut s = spec("s1", TaskType::Background);
        s.idempotency_key = Some("k1".into());
        let (t1, _) = reg.spawn(s.clone()).unwrap();
        let (t2, outcome) = reg.spawn(s).unwrap();
        assert_eq!(t1.task_id, t2.task_id);
        assert_eq!(outcome, SpawnOutcome::Existing);
    }

    #[test]
    fn idempotency_expires_with_terminal_task() {
        let reg = registry(2);
        let mut s = spec("s1", TaskType::Background);
        s.idempotency_key = Some("k1".into());
        let (t1, _) = reg.spawn(s.clone()).unwrap();
        reg.transition(&t1.task_id, TaskStatus::Running).unwrap();
        reg.transition(&t1.task_id, TaskStatus::Complete).unwrap();

        let (t2, outcome) = reg.spawn(s).unwrap();
        assert_ne!(t1.task_id, t2.task_id);
        assert_eq!(outcome, SpawnOutcome::Created);
    }

    #[test]
    fn concurrency_limit_queues() {
        let reg = registry(1);
        let (t1, o1) = reg.spawn(spec("s1", TaskType::Background)).unwrap();
        assert_eq!(o1, SpawnOutcome::Created);
        reg.transition(&t1.task_id, TaskStatus::Running).unwrap();

        let (_t2, o2) = reg.spawn(spec("s1", TaskType::Background)).unwrap();
        assert_eq!(o2, SpawnOutcome::Queued);
    }

    #[test]
    fn max_total_rejects() {
        let limits = TaskLimitsConfig {
            max_total_tasks: 1,
            ..Default::default()
        };
        let reg = TaskRegistry::new(limits, Arc::new(CancelMap::new()));
        reg.spawn(spec("s1", TaskType::Background)).unwrap();
        let err = reg.spawn(spec("s1", TaskType::Background)).unwrap_err();
        assert!(matches!(err, Error::Constraint(_)));
    }

    #[test]
    fn one_running_foreground_per_session() {
        let reg = registry(5);
        let (fg1, o1) = reg.spawn(spec("s1", TaskType::Foreground)).unwrap();
        assert_eq!(o1, SpawnOutcome::Created);
        reg.transition(&fg1.task_id, TaskStatus::Running).unwrap();

        let (_fg2, o2) = reg.spawn(spec("s1", TaskType::Foreground)).unwrap();
        assert_eq!(o2, SpawnOutcome::Queued);

        // Background tasks still start.
        let (_bg, o3) = reg.spawn(spec("s1", TaskType::Background)).unwrap();
        assert_eq!(o3, SpawnOutcome::Created);
    }

    #[test]
    fn invalid_transition_rejected() {
        let reg = registry(2);
        let (t, _) = reg.spawn(spec("s1", TaskType::Background)).unwrap();
        // Pending → Complete skips Running.
        assert!(reg.transition(&t.task_id, TaskStatus::Complete).is_err());
        // Terminal is absorbing.
        reg.transition(&t.task_id, TaskStatus::Cancelled).unwrap();
        assert!(reg.transition(&t.task_id, TaskStatus::Running).is_err());
    }

    #[test]
    fn cancel_terminal_is_ignored() {
        let reg = registry(2);
        let (t, _) = reg.spawn(spec("s1", TaskType::Background)).unwrap();
        reg.transition(&t.task_id, TaskStatus::Running).unwrap();
        reg.transition(&t.task_id, TaskStatus::Complete).unwrap();
        assert!(reg.cancel(&t.task_id, "late", false).unwrap().is_none());
        assert_eq!(reg.get(&t.task_id).unwrap().status, TaskStatus::Complete);
    }

    #[test]
    fn cancel_signals_token() {
        let reg = registry(2);
        let (t, _) = reg.spawn(spec("s1", TaskType::Background)).unwrap();
        reg.transition(&t.task_id, TaskStatus::Running).unwrap();
        let token = reg.cancel_map().register(&t.task_id);

        let cancelled = reg.cancel(&t.task_id, "stop", false).unwrap().unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert!(token.is_cancelled());
    }

    #[test]
    fn cascade_cancels_descendants() {
        let reg = registry(5);
        let (parent, _) = reg.spawn(spec("s1", TaskType::Foreground)).unwrap();
        reg.transition(&parent.task_id, TaskStatus::Running).unwrap();

        let mut child_spec = spec("s1", TaskType::Background);
        child_spec.context_snapshot = TaskContextSnapshot::empty().with_provenance(
            parent.task_id.clone(),
            "e1",
            None,
        );
        let (child, _) = reg.spawn(child_spec).unwrap();
        reg.transition(&child.task_id, TaskStatus::Running).unwrap();

        reg.cancel(&parent.task_id, "stop all", true).unwrap();
        assert_eq!(reg.get(&child.task_id).unwrap().status, TaskStatus::Cancelled);
        assert_eq!(reg.descendants(&parent.task_id), vec![child.task_id]);
    }

    #[test]
    fn next_runnable_orders_by_priority_then_age() {
        let reg = registry(1);
        let (running, _) = reg.spawn(spec("s1", TaskType::Background)).unwrap();
        reg.transition(&running.task_id, TaskStatus::Running).unwrap();

        let mut low = spec("s1", TaskType::Background);
        low.priority = 1;
        let (low_task, _) = reg.spawn(low).unwrap();
        let mut high = spec("s1", TaskType::Background);
        high.priority = 5;
        let (high_task, _) = reg.spawn(high).unwrap();

        // No slot free yet.
        assert!(reg.next_runnable("s1").is_none());

        reg.transition(&running.task_id, TaskStatus::Complete).unwrap();
        assert_eq!(reg.next_runnable("s1").unwrap().task_id, high_task.task_id);

        reg.transition(&high_task.task_id, TaskStatus::Running).unwrap();
        assert!(reg.next_runnable("s1").is_none());
        reg.transition(&high_task.task_id, TaskStatus::Complete).unwrap();
        assert_eq!(reg.next_runnable("s1").unwrap().task_id, low_task.task_id);
    }

    #[test]
    fn pause_resume_cycle() {
        let reg = registry(2);
        let (t, _) = reg.spawn(spec("s1", TaskType::Background)).unwrap();
        reg.transition(&t.task_id, TaskStatus::Running).unwrap();
        assert_eq!(reg.pause(&t.task_id).unwrap().status, TaskStatus::Paused);
        assert_eq!(reg.resume(&t.task_id).unwrap().status, TaskStatus::Running);
    }

    #[test]
    fn status_counts() {
        let reg = registry(5);
        let (a, _) = reg.spawn(spec("s1", TaskType::Background)).unwrap();
        reg.spawn(spec("s1", TaskType::Background)).unwrap();
        reg.transition(&a.task_id, TaskStatus::Running).unwrap();

        let counts = reg.status_counts("s1");
        assert_eq!(counts.get("running"), Some(&1));
        assert_eq!(counts.get("pending"), Some(&1));
    }

    #[test]
    fn session_usage_aggregates_across_tasks() {
        let reg = registry(5);
        let (a, _) = reg.spawn(spec("s1", TaskType::Background)).unwrap();
        let (b, _) = reg.spawn(spec("s1", TaskType::Background)).unwrap();
        reg.update(&a.task_id, |t| {
            t.input_tokens = 100;
            t.output_tokens = 10;
            t.cost_usd = 0.5;
        });
        reg.update(&b.task_id, |t| {
            t.input_tokens = 50;
            t.output_tokens = 5;
            t.cost_usd = 0.25;
        });

        let (input, output, cost) = reg.session_usage("s1");
        assert_eq!(input, 150);
        assert_eq!(output, 15);
        assert!((cost - 0.75).abs() < 1e-9);
        assert_eq!(reg.session_usage("other"), (0, 0, 0.0));
    }
}
