//! The event sink — ordered, replayable `StateUpdate` streams.
//!
//! Per `(session_id, task_id)` the sink assigns zero-padded sequence
//! numbers (lexicographic order == emission order), persists to the store
//! when the `updates` capability is live, and fans out to subscribers over
//! a broadcast channel. Subscribers get replay-then-live with consumer-side
//! dedupe by `update_id`. The outbound pipe is bounded: low-priority
//! updates are dropped under pressure, critical ones (RESULT, ERROR,
//! NOTIFICATION, terminal STATUS_CHANGE) never are.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use pf_domain::trace::FlowTrace;
use pf_domain::update::{StateUpdate, UpdateType};

use pf_store::{Feature, FeatureGate, StateStore};

struct StreamState {
    seq: u64,
    tx: broadcast::Sender<StateUpdate>,
    dropped: u64,
}

type StreamMap = Mutex<HashMap<(String, String), StreamState>>;

pub struct EventSink {
    store: Arc<dyn StateStore>,
    gate: Arc<FeatureGate>,
    streams: Arc<StreamMap>,
    outbound_capacity: usize,
}

fn with_stream<R>(
    streams: &StreamMap,
    capacity: usize,
    session_id: &str,
    task_id: &str,
    f: impl FnOnce(&mut StreamState) -> R,
) -> R {
    let mut streams = streams.lock();
    let state = streams
        .entry((session_id.to_owned(), task_id.to_owned()))
        .or_insert_with(|| StreamState {
            seq: 0,
            tx: broadcast::channel(capacity * 4).0,
            dropped: 0,
        });
    f(state)
}

fn note_dropped(streams: &StreamMap, capacity: usize, session_id: &str, task_id: &str, n: u64) {
    let total = with_stream(streams, capacity, session_id, task_id, |state| {
        state.dropped += n;
        state.dropped
    });
    FlowTrace::UpdatesDropped {
        session_id: session_id.to_owned(),
        task_id: task_id.to_owned(),
        dropped: total,
    }
    .emit();
}

impl EventSink {
    pub fn new(store: Arc<dyn StateStore>, gate: Arc<FeatureGate>, outbound_capacity: usize) -> Self {
        Self {
            store,
            gate,
            streams: Arc::new(Mutex::new(HashMap::new())),
            outbound_capacity: outbound_capacity.max(1),
        }
    }

    fn with_stream<R>(
        &self,
        session_id: &str,
        task_id: &str,
        f: impl FnOnce(&mut StreamState) -> R,
    ) -> R {
        with_stream(&self.streams, self.outbound_capacity, session_id, task_id, f)
    }

    /// Emit the next update in a stream. Assigns the sequence id, persists
    /// (capability-gated), and broadcasts to live subscribers.
    pub async fn emit(
        &self,
        session_id: &str,
        task_id: &str,
        update_type: UpdateType,
        content: Value,
        step_index: Option<usize>,
        total_steps: Option<usize>,
    ) -> StateUpdate {
        let update = self.with_stream(session_id, task_id, |state| {
            state.seq += 1;
            let update = StateUpdate {
                session_id: session_id.to_owned(),
                task_id: task_id.to_owned(),
                update_id: format!("{:010}", state.seq),
                update_type,
                content,
                step_index,
                total_steps,
                created_at: Utc::now(),
            };
            let _ = state.tx.send(update.clone());
            update
        });
        self.persist(update.clone()).await;
        update
    }

    /// Emit with a caller-chosen `update_id` (used for group reports, where
    /// the deterministic id plus idempotent store writes make the
    /// exactly-once guarantee hold across restarts).
    pub async fn emit_with_id(&self, update: StateUpdate) {
        self.with_stream(&update.session_id, &update.task_id, |state| {
            let _ = state.tx.send(update.clone());
        });
        self.persist(update).await;
    }

    async fn persist(&self, update: StateUpdate) {
        if !self.gate.enabled(Feature::Updates) {
            return;
        }
        if let Err(e) = self.store.save_update(update).await {
            self.gate.optional_failed(Feature::Updates, &e);
        }
    }

    /// The most recently assigned sequence id in a stream (snapshot
    /// provenance uses this as `spawned_from_event_id`).
    pub fn last_update_id(&self, session_id: &str, task_id: &str) -> Option<String> {
        self.streams
            .lock()
            .get(&(session_id.to_owned(), task_id.to_owned()))
            .and_then(|s| (s.seq > 0).then(|| format!("{:010}", s.seq)))
    }

    /// Updates dropped under outbound pressure for one stream.
    pub fn dropped(&self, session_id: &str, task_id: &str) -> u64 {
        self.streams
            .lock()
            .get(&(session_id.to_owned(), task_id.to_owned()))
            .map(|s| s.dropped)
            .unwrap_or(0)
    }

    /// Subscribe to a stream: replay persisted updates after the exclusive
    /// cursor, then switch live. The returned channel is bounded; when the
    /// consumer falls behind, droppable updates are sampled away and
    /// critical updates block until there is room.
    pub fn subscribe(
        &self,
        session_id: &str,
        task_id: &str,
        since_update_id: Option<String>,
    ) -> mpsc::Receiver<StateUpdate> {
        let (out_tx, out_rx) = mpsc::channel(self.outbound_capacity);
        // Register with the broadcast before replaying so no update falls
        // between replay and live.
        let mut live_rx = self.with_stream(session_id, task_id, |state| state.tx.subscribe());

        let store = self.store.clone();
        let gate = self.gate.clone();
        let streams = self.streams.clone();
        let capacity = self.outbound_capacity;
        let session_id = session_id.to_owned();
        let task_id = task_id.to_owned();
        tokio::spawn(async move {
            let mut last_sent = since_update_id.clone().unwrap_or_default();

            if gate.enabled(Feature::Updates) {
                match store
                    .list_updates(&session_id, &task_id, since_update_id.as_deref())
                    .await
                {
                    Ok(history) => {
                        for update in history {
                            if update.update_id > last_sent {
                                last_sent = update.update_id.clone();
                            }
                            if out_tx.send(update).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => gate.optional_failed(Feature::Updates, &e),
                }
            }

            loop {
                match live_rx.recv().await {
                    Ok(update) => {
                        // Consumer-side dedupe across the replay/live seam.
                        if !update.update_id.is_empty() && update.update_id <= last_sent {
                            continue;
                        }
                        last_sent = update.update_id.clone();
                        if update.is_critical() {
                            if out_tx.send(update).await.is_err() {
                                return;
                            }
                        } else {
                            match out_tx.try_send(update) {
                                Ok(()) => {}
                                Err(mpsc::error::TrySendError::Full(_)) => {
                                    note_dropped(&streams, capacity, &session_id, &task_id, 1);
                                }
                                Err(mpsc::error::TrySendError::Closed(_)) => return,
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        note_dropped(&streams, capacity, &session_id, &task_id, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        out_rx
    }
}
