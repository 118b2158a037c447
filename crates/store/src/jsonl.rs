//! JSONL-file state store.
//!
//! One append-only file per record family under a state directory. On
//! startup every file is replayed into an in-memory store that serves all
//! reads; writes append a row and delegate to the same in-memory store.
//! The two high-volume files (events, updates) are pruned to a bounded tail
//! on load via an atomic `.tmp` + rename rewrite.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use pf_domain::error::{Error, Result};
use pf_domain::steering::SteeringEvent;
use pf_domain::task::TaskState;
use pf_domain::trajectory::Trajectory;
use pf_domain::update::StateUpdate;

use crate::memory::MemoryStateStore;
use crate::records::{FlowEvent, PauseRecord, RemoteBinding};
use crate::{StateStore, StoreCapabilities};

const MAX_LOG_ROWS: usize = 20_000;

const EVENTS: &str = "events.jsonl";
const PLANNER_EVENTS: &str = "planner_events.jsonl";
const BINDINGS: &str = "bindings.jsonl";
const PAUSES: &str = "pauses.jsonl";
const MEMORY: &str = "memory.jsonl";
const TASKS: &str = "tasks.jsonl";
const UPDATES: &str = "updates.jsonl";
const STEERING: &str = "steering.jsonl";
const TRAJECTORIES: &str = "trajectories.jsonl";
const ARTIFACTS: &str = "artifacts.jsonl";

#[derive(Debug, Clone, Serialize, serde::Deserialize)]
struct MemoryRow {
    session_id: String,
    state: Value,
}

#[derive(Debug, Clone, Serialize, serde::Deserialize)]
struct TrajectoryRow {
    task_id: String,
    trajectory: Trajectory,
}

#[derive(Debug, Clone, Serialize, serde::Deserialize)]
struct ArtifactRow {
    artifact_ref: String,
    blob: Value,
}

#[derive(Debug, Clone, Serialize, serde::Deserialize)]
struct PauseConsumedRow {
    resume_token: String,
    consumed: bool,
}

pub struct JsonlStateStore {
    dir: PathBuf,
    mem: MemoryStateStore,
    /// Serializes file appends (one writer at a time per store).
    io: Mutex<()>,
}

impl JsonlStateStore {
    /// Open (or create) a store under `state_path/flow`.
    pub fn new(state_path: &Path) -> Result<Self> {
        let dir = state_path.join("flow");
        std::fs::create_dir_all(&dir).map_err(Error::Io)?;

        let store = Self {
            dir,
            mem: MemoryStateStore::new(),
            io: Mutex::new(()),
        };
        store.replay()?;
        Ok(store)
    }

    fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    /// Replay every file into the in-memory store, pruning the high-volume
    /// logs to their bounded tail.
    fn replay(&self) -> Result<()> {
        let events: Vec<FlowEvent> = self.load_pruned(EVENTS)?;
        let updates: Vec<StateUpdate> = self.load_pruned(UPDATES)?;
        let planner_events: Vec<FlowEvent> = load_rows(&self.path(PLANNER_EVENTS));
        let bindings: Vec<RemoteBinding> = load_rows(&self.path(BINDINGS));
        let pauses: Vec<Value> = load_rows(&self.path(PAUSES));
        let memory: Vec<MemoryRow> = load_rows(&self.path(MEMORY));
        let tasks: Vec<TaskState> = load_rows(&self.path(TASKS));
        let steering: Vec<SteeringEvent> = load_rows(&self.path(STEERING));
        let trajectories: Vec<TrajectoryRow> = load_rows(&self.path(TRAJECTORIES));
        let artifacts: Vec<ArtifactRow> = load_rows(&self.path(ARTIFACTS));

        for ev in events {
            self.mem.insert_event(ev);
        }
        for ev in planner_events {
            self.mem.insert_planner_event(ev);
        }
        for b in bindings {
            self.mem.insert_binding(b);
        }
        for row in pauses {
            // A row is either a full record or a consumption marker.
            if row.get("session_id").is_some() {
                if let Ok(rec) = serde_json::from_value::<PauseRecord>(row) {
                    self.mem.insert_pause(rec);
                }
            } else if let Ok(mark) = serde_json::from_value::<PauseConsumedRow>(row) {
                if mark.consumed {
                    self.mem.take_pause(&mark.resume_token);
                }
            }
        }
        for row in memory {
            self.mem.insert_memory(&row.session_id, row.state);
        }
        for t in tasks {
            self.mem.insert_task(t);
        }
        for u in updates {
            self.mem.insert_update(u);
        }
        for s in steering {
            self.mem.insert_steering(s);
        }
        for row in trajectories {
            self.mem.insert_trajectory(&row.task_id, row.trajectory);
        }
        for row in artifacts {
            self.mem.insert_artifact(row.blob);
        }
        Ok(())
    }

    /// Load a high-volume log, keeping only the most recent rows; rewrite
    /// the file when it held more than we keep.
    fn load_pruned<T: DeserializeOwned + Serialize>(&self, file: &str) -> Result<Vec<T>> {
        let path = self.path(file);
        let mut all: Vec<T> = load_rows(&path);
        if all.len() <= MAX_LOG_ROWS {
            return Ok(all);
        }
        let tail = all.split_off(all.len() - MAX_LOG_ROWS);
        tracing::info!(file, kept = tail.len(), pruned = all.len(), "pruning JSONL log on disk");
        rewrite_jsonl(&path, &tail)?;
        Ok(tail)
    }

    fn append<T: Serialize>(&self, file: &str, row: &T) -> Result<()> {
        let json = serde_json::to_string(row).map_err(Error::Json)?;
        let _guard = self.io.lock();
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(file))
            .map_err(Error::Io)?;
        writeln!(f, "{json}").map_err(Error::Io)?;
        Ok(())
    }
}

fn load_rows<T: DeserializeOwned>(path: &Path) -> Vec<T> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return Vec::new(),
    };
    content
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}

fn rewrite_jsonl<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    let tmp = path.with_extension("jsonl.tmp");
    {
        let mut f = std::fs::File::create(&tmp).map_err(Error::Io)?;
        for row in rows {
            let json = serde_json::to_string(row).map_err(Error::Json)?;
            writeln!(f, "{json}").map_err(Error::Io)?;
        }
    }
    std::fs::rename(&tmp, path).map_err(Error::Io)?;
    Ok(())
}

#[async_trait]
impl StateStore for JsonlStateStore {
    async fn save_event(&self, event: FlowEvent) -> Result<()> {
        self.append(EVENTS, &event)?;
        self.mem.save_event(event).await
    }

    async fn load_history(&self, trace_id: &str) -> Result<Vec<FlowEvent>> {
        self.mem.load_history(trace_id).await
    }

    async fn save_remote_binding(&self, binding: RemoteBinding) -> Result<()> {
        self.append(BINDINGS, &binding)?;
        self.mem.save_remote_binding(binding).await
    }

    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities::all()
    }

    async fn save_planner_state(&self, record: PauseRecord) -> Result<()> {
        self.append(PAUSES, &record)?;
        self.mem.save_planner_state(record).await
    }

    async fn consume_planner_state(&self, resume_token: &str) -> Result<Option<PauseRecord>> {
        let consumed = self.mem.consume_planner_state(resume_token).await?;
        if consumed.is_some() {
            self.append(
                PAUSES,
                &PauseConsumedRow {
                    resume_token: resume_token.to_owned(),
                    consumed: true,
                },
            )?;
        }
        Ok(consumed)
    }

    async fn save_memory_state(&self, session_id: &str, state: Value) -> Result<()> {
        self.append(
            MEMORY,
            &MemoryRow {
                session_id: session_id.to_owned(),
                state: state.clone(),
            },
        )?;
        self.mem.save_memory_state(session_id, state).await
    }

    async fn load_memory_state(&self, session_id: &str) -> Result<Option<Value>> {
        self.mem.load_memory_state(session_id).await
    }

    async fn save_task(&self, task: TaskState) -> Result<()> {
        self.append(TASKS, &task)?;
        self.mem.save_task(task).await
    }

    async fn list_tasks(&self, session_id: &str) -> Result<Vec<TaskState>> {
        self.mem.list_tasks(session_id).await
    }

    async fn save_update(&self, update: StateUpdate) -> Result<()> {
        self.append(UPDATES, &update)?;
        self.mem.save_update(update).await
    }

    async fn list_updates(
        &self,
        session_id: &str,
        task_id: &str,
        since_update_id: Option<&str>,
    ) -> Result<Vec<StateUpdate>> {
        self.mem.list_updates(session_id, task_id, since_update_id).await
    }

    async fn save_steering(&self, event: SteeringEvent) -> Result<()> {
        self.append(STEERING, &event)?;
        self.mem.save_steering(event).await
    }

    async fn list_steering(&self, session_id: &str, task_id: &str) -> Result<Vec<SteeringEvent>> {
        self.mem.list_steering(session_id, task_id).await
    }

    async fn save_trajectory(&self, task_id: &str, trajectory: &Trajectory) -> Result<()> {
        self.append(
            TRAJECTORIES,
            &TrajectoryRow {
                task_id: task_id.to_owned(),
                trajectory: trajectory.clone(),
            },
        )?;
        self.mem.save_trajectory(task_id, trajectory).await
    }

    async fn get_trajectory(&self, task_id: &str) -> Result<Option<Trajectory>> {
        self.mem.get_trajectory(task_id).await
    }

    async fn list_traces(&self, session_id: &str) -> Result<Vec<String>> {
        self.mem.list_traces(session_id).await
    }

    async fn save_planner_event(&self, event: FlowEvent) -> Result<()> {
        self.append(PLANNER_EVENTS, &event)?;
        self.mem.save_planner_event(event).await
    }

    async fn list_planner_events(
        &self,
        trace_id: &str,
        since_event_id: Option<&str>,
    ) -> Result<Vec<FlowEvent>> {
        self.mem.list_planner_events(trace_id, since_event_id).await
    }

    async fn put_artifact(&self, blob: Value) -> Result<String> {
        self.append(
            ARTIFACTS,
            &ArtifactRow {
                artifact_ref: crate::records::artifact_ref(&blob),
                blob: blob.clone(),
            },
        )?;
        self.mem.put_artifact(blob).await
    }

    async fn get_artifact(&self, artifact_ref: &str) -> Result<Option<Value>> {
        self.mem.get_artifact(artifact_ref).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pf_domain::update::UpdateType;
    use serde_json::json;

    fn update(seq: u64) -> StateUpdate {
        StateUpdate {
            session_id: "s1".into(),
            task_id: "t1".into(),
            update_id: format!("{seq:010}"),
            update_type: UpdateType::Progress,
            content: json!({}),
            step_index: None,
            total_steps: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn events_persist_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlStateStore::new(dir.path()).unwrap();
        let ev = FlowEvent::new("tr1", "task.created", json!({"k": 1}));
        store.save_event(ev.clone()).await.unwrap();
        drop(store);

        let store2 = JsonlStateStore::new(dir.path()).unwrap();
        let history = store2.load_history("tr1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].event_id, ev.event_id);
    }

    #[tokio::test]
    async fn duplicate_event_rows_dedupe_on_replay() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlStateStore::new(dir.path()).unwrap();
        let ev = FlowEvent::new("tr1", "task.created", json!({}));
        store.save_event(ev.clone()).await.unwrap();
        store.save_event(ev).await.unwrap();
        drop(store);

        let store2 = JsonlStateStore::new(dir.path()).unwrap();
        assert_eq!(store2.load_history("tr1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn pause_consumption_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlStateStore::new(dir.path()).unwrap();
        let rec = PauseRecord::new("s1", "t1", json!({}), json!({}));
        let token = rec.resume_token.clone();
        store.save_planner_state(rec).await.unwrap();
        assert!(store.consume_planner_state(&token).await.unwrap().is_some());
        drop(store);

        // After reload, the token is already consumed.
        let store2 = JsonlStateStore::new(dir.path()).unwrap();
        assert!(store2.consume_planner_state(&token).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn updates_cursor_after_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlStateStore::new(dir.path()).unwrap();
        for seq in 1..=4 {
            store.save_update(update(seq)).await.unwrap();
        }
        drop(store);

        let store2 = JsonlStateStore::new(dir.path()).unwrap();
        let after = store2
            .list_updates("s1", "t1", Some(&format!("{:010}", 2)))
            .await
            .unwrap();
        assert_eq!(after.len(), 2);
        assert_eq!(after[0].update_id, format!("{:010}", 3));
    }

    #[tokio::test]
    async fn trajectory_last_write_wins_on_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlStateStore::new(dir.path()).unwrap();
        let mut t = Trajectory::new("q");
        store.save_trajectory("t1", &t).await.unwrap();
        t.append_step(pf_domain::action::PlannerAction::final_response("x"), None);
        store.save_trajectory("t1", &t).await.unwrap();
        drop(store);

        let store2 = JsonlStateStore::new(dir.path()).unwrap();
        let back = store2.get_trajectory("t1").await.unwrap().unwrap();
        assert_eq!(back.len(), 1);
    }

    #[tokio::test]
    async fn corrupt_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = JsonlStateStore::new(dir.path()).unwrap();
            store
                .save_event(FlowEvent::new("tr1", "task.created", json!({})))
                .await
                .unwrap();
        }
        // Corrupt the file with a partial line.
        let path = dir.path().join("flow").join(EVENTS);
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{\"broken\": tru");
        std::fs::write(&path, content).unwrap();

        let store2 = JsonlStateStore::new(dir.path()).unwrap();
        assert_eq!(store2.load_history("tr1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn artifacts_persist() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlStateStore::new(dir.path()).unwrap();
        let r = store.put_artifact(json!({"blob": true})).await.unwrap();
        drop(store);

        let store2 = JsonlStateStore::new(dir.path()).unwrap();
        assert_eq!(
            store2.get_artifact(&r).await.unwrap(),
            Some(json!({"blob": true}))
        );
    }
}
