//! Steering inboxes — one bounded, typed event queue per task.
//!
//! `push` is non-blocking and deduplicates by `event_id`. A full inbox
//! rejects ordinary events; control events (Cancel/Pause/Resume/Approve/
//! Reject) always fit by evicting the oldest non-control event. `drain`
//! removes everything FIFO; the planner drains at each loop boundary so
//! control events take effect before the next LLM call.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use pf_domain::config::TaskLimitsConfig;
use pf_domain::steering::{SteeringEvent, SteeringKind};
use pf_domain::trace::FlowTrace;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inbox
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct InboxState {
    queue: VecDeque<SteeringEvent>,
    seen: HashSet<String>,
}

pub struct SteeringInbox {
    state: Mutex<InboxState>,
    capacity: usize,
    max_user_messages: usize,
}

impl SteeringInbox {
    pub fn new(capacity: usize, max_user_messages: usize) -> Self {
        Self {
            state: Mutex::new(InboxState {
                queue: VecDeque::new(),
                seen: HashSet::new(),
            }),
            capacity: capacity.max(1),
            max_user_messages,
        }
    }

    /// Non-blocking push. Returns whether the event was accepted.
    pub fn push(&self, event: SteeringEvent) -> bool {
        let mut state = self.state.lock();

        // Dedupe across the whole task lifetime, not just the current queue.
        if state.seen.contains(&event.event_id) {
            return false;
        }

        let is_control = event.kind.is_control();

        if event.kind == SteeringKind::UserMessage {
            let queued_user = state
                .queue
                .iter()
                .filter(|e| e.kind == SteeringKind::UserMessage)
                .count();
            if queued_user >= self.max_user_messages {
                return false;
            }
        }

        if state.queue.len() >= self.capacity {
            if !is_control {
                return false;
            }
            // Control events preempt: evict the oldest non-control event.
            match state.queue.iter().position(|e| !e.kind.is_control()) {
                Some(idx) => {
                    state.queue.remove(idx);
                }
                None => return false, // full of control events; give up
            }
        }

        FlowTrace::SteeringReceived {
            task_id: event.task_id.clone(),
            event_id: event.event_id.clone(),
            kind: format!("{:?}", event.kind),
            accepted: true,
        }
        .emit();

        state.seen.insert(event.event_id.clone());
        state.queue.push_back(event);
        true
    }

    /// Atomically remove all queued events in FIFO order.
    pub fn drain(&self) -> Vec<SteeringEvent> {
        let mut state = self.state.lock();
        state.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Per-task inbox map
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct InboxMap {
    inboxes: Mutex<HashMap<String, Arc<SteeringInbox>>>,
    config: TaskLimitsConfig,
}

impl InboxMap {
    pub fn new(config: TaskLimitsConfig) -> Self {
        Self {
            inboxes: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn for_task(&self, task_id: &str) -> Arc<SteeringInbox> {
        let mut inboxes = self.inboxes.lock();
        inboxes
            .entry(task_id.to_owned())
            .or_insert_with(|| {
                Arc::new(SteeringInbox::new(
                    self.config.steering_inbox_capacity,
                    self.config.max_pending_user_messages,
                ))
            })
            .clone()
    }

    pub fn remove(&self, task_id: &str) {
        self.inboxes.lock().remove(task_id);
    }
}
