//! Snapshot freezing and the context-merge engine.
//!
//! Background tasks see a frozen copy of the foreground's LLM context and
//! report back with a [`ContextPatch`]. Merges into the live foreground
//! context are explicit: `append` pushes onto `research_results[]`,
//! `replace` overwrites a named existing key path, `human_gated` queues the
//! patch until an APPROVE steering event references it. Every application
//! is deduped by patch id.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use serde_json::{Map, Value};

use pf_domain::error::{Error, Result};
use pf_domain::snapshot::{ContextPatch, MemorySnapshot, MergeStrategy, TaskContextSnapshot};
use pf_domain::trace::FlowTrace;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Freezing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Freeze the live foreground context for a background spawn.
pub fn freeze_snapshot(
    llm_context: &Value,
    tool_handles: Vec<String>,
    memory: MemorySnapshot,
    artifacts: Vec<String>,
) -> Result<TaskContextSnapshot> {
    TaskContextSnapshot::freeze(llm_context, tool_handles, memory, artifacts)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Merge directives
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A merge strategy resolved with its runtime arguments. `Replace` must
/// name its target key path (dot-separated); the bare [`MergeStrategy`]
/// cannot carry that.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeDirective {
    Append,
    Replace { key_path: String },
    HumanGated,
}

impl MergeDirective {
    pub fn from_strategy(strategy: MergeStrategy, replace_key: Option<String>) -> Result<Self> {
        match strategy {
            MergeStrategy::Append => Ok(Self::Append),
            MergeStrategy::HumanGated => Ok(Self::HumanGated),
            MergeStrategy::Replace => replace_key
                .map(|key_path| Self::Replace { key_path })
                .ok_or_else(|| Error::Validation("replace merge must name a target key".into())),
        }
    }
}

/// What happened to a patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Merged into the context. `diverged` is set when the foreground had
    /// advanced past the patch's spawn event (the caller should emit a
    /// NOTIFICATION warning).
    Applied { diverged: bool },
    /// Same patch id applied before; nothing changed.
    Duplicate,
    /// Queued awaiting human approval.
    Queued,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Merge engine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct MergeEngine {
    /// Patches queued under `human_gated`, by patch id.
    pending: Mutex<HashMap<String, ContextPatch>>,
    /// Every patch id ever applied (the dedupe set).
    applied: Mutex<HashSet<String>>,
}

impl MergeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply (or queue) a patch against the live foreground context.
    ///
    /// `current_event_id` is the foreground's latest processed event; a
    /// mismatch against the patch's spawn provenance flags divergence but
    /// does not block the merge.
    pub fn apply(
        &self,
        context: &mut Value,
        patch: &ContextPatch,
        directive: &MergeDirective,
        current_event_id: Option<&str>,
    ) -> Result<MergeOutcome> {
        if self.applied.lock().contains(&patch.patch_id) {
            return Ok(MergeOutcome::Duplicate);
        }

        match directive {
            MergeDirective::HumanGated => {
                self.pending
                    .lock()
                    .insert(patch.patch_id.clone(), patch.clone());
                FlowTrace::PatchReady {
                    task_id: patch.task_id.clone(),
                    patch_id: patch.patch_id.clone(),
                    strategy: "human_gated".into(),
                }
                .emit();
                Ok(MergeOutcome::Queued)
            }
            MergeDirective::Append => {
                self.do_append(context, patch)?;
                self.finish_applied(patch, "append", current_event_id)
            }
            MergeDirective::Replace { key_path } => {
                self.do_replace(context, patch, key_path)?;
                self.finish_applied(patch, "replace", current_event_id)
            }
        }
    }

    /// Approve a queued human-gated patch by id; merges it (append
    /// semantics) into the context. `None` when the id is unknown (already
    /// approved, rejected, or never queued).
    pub fn approve(
        &self,
        context: &mut Value,
        patch_id: &str,
        current_event_id: Option<&str>,
    ) -> Result<Option<(ContextPatch, MergeOutcome)>> {
        let patch = match self.pending.lock().remove(patch_id) {
            Some(p) => p,
            None => return Ok(None),
        };
        self.do_append(context, &patch)?;
        let outcome = self.finish_applied(&patch, "human_gated", current_event_id)?;
        Ok(Some((patch, outcome)))
    }

    /// Drop a queued patch. Returns whether anything was removed.
    pub fn reject(&self, patch_id: &str) -> bool {
        self.pending.lock().remove(patch_id).is_some()
    }

    pub fn pending_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.pending.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn finish_applied(
        &self,
        patch: &ContextPatch,
        strategy: &str,
        current_event_id: Option<&str>,
    ) -> Result<MergeOutcome> {
        self.applied.lock().insert(patch.patch_id.clone());
        let diverged = match (&patch.spawned_from_event_id, current_event_id) {
            (Some(spawned), Some(current)) => spawned != current,
            _ => false,
        };
        FlowTrace::MergeApplied {
            patch_id: patch.patch_id.clone(),
            strategy: strategy.into(),
            diverged,
        }
        .emit();
        Ok(MergeOutcome::Applied { diverged })
    }

    fn do_append(&self, context: &mut Value, patch: &ContextPatch) -> Result<()> {
        let obj = context
            .as_object_mut()
            .ok_or_else(|| Error::Validation("llm_context is not an object".into()))?;
        let results = obj
            .entry("research_results")
            .or_insert_with(|| Value::Array(Vec::new()));
        match results.as_array_mut() {
            Some(arr) => {
                arr.push(patch.as_append_entry());
                Ok(())
            }
            None => Err(Error::Validation(
                "llm_context.research_results is not an array".into(),
            )),
        }
    }

    fn do_replace(&self, context: &mut Value, patch: &ContextPatch, key_path: &str) -> Result<()> {
        let mut node = context;
        let segments: Vec<&str> = key_path.split('.').collect();
        let (last, parents) = segments
            .split_last()
            .ok_or_else(|| Error::Validation("empty replace key path".into()))?;

        for segment in parents {
            node = node
                .get_mut(*segment)
                .ok_or_else(|| Error::Validation(format!("replace path missing: {segment}")))?;
        }
        let obj = node
            .as_object_mut()
            .ok_or_else(|| Error::Validation(format!("replace parent of {last} not an object")))?;
        if !obj.contains_key(*last) {
            return Err(Error::Validation(format!(
                "replace target key missing: {key_path}"
            )));
        }
        obj.insert((*last).to_owned(), patch.as_append_entry());
        Ok(())
    }
}

/// Convenience: a fresh empty LLM context.
pub fn empty_context() -> Value {
    Value::Object(Map::new())
}
