//! Trajectories — the append-only (action, observation) history of one task.
//!
//! A trajectory is owned by exactly one runtime; step indices are dense from
//! zero and a step becomes visible only once its action has been chosen.
//! Observations are written once: `observation` holds the full tool output,
//! `llm_observation` the redacted form fed back to the model.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::action::PlannerAction;
use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Step
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrajectoryStep {
    pub step_index: usize,
    pub action: PlannerAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observation: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_observation: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl TrajectoryStep {
    /// Structured view of the observation: a JSON object, or nothing.
    ///
    /// Auto-seq and validation paths skip steps whose observation is not a
    /// structured mapping.
    pub fn coerce_observation(&self) -> Option<&Map<String, Value>> {
        match &self.observation {
            Some(Value::Object(map)) => Some(map),
            _ => None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Metadata
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Side-band state the run loop threads through iterations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrajectoryMetadata {
    /// Actions queued for deterministic execution before the next LLM call.
    /// Dequeue preserves insertion order.
    #[serde(default)]
    pub pending_actions: VecDeque<PlannerAction>,
    #[serde(default)]
    pub hints: Vec<String>,
    /// Injected steering payloads, surfaced to the LLM as user messages.
    #[serde(default)]
    pub steering_inputs: Vec<Value>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trajectory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trajectory {
    pub query: String,
    pub started_at: DateTime<Utc>,
    steps: Vec<TrajectoryStep>,
    #[serde(default)]
    pub metadata: TrajectoryMetadata,
}

impl Trajectory {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            started_at: Utc::now(),
            steps: Vec::new(),
            metadata: TrajectoryMetadata::default(),
        }
    }

    pub fn steps(&self) -> &[TrajectoryStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn last_step(&self) -> Option<&TrajectoryStep> {
        self.steps.last()
    }

    /// Append a step for a chosen action. Returns the new step index.
    pub fn append_step(
        &mut self,
        action: PlannerAction,
        reasoning: Option<String>,
    ) -> usize {
        let step_index = self.steps.len();
        self.steps.push(TrajectoryStep {
            step_index,
            action,
            observation: None,
            llm_observation: None,
            error: None,
            timestamp: Utc::now(),
            reasoning,
        });
        step_index
    }

    /// Record the observation pair for a step. Write-once.
    pub fn record_observation(
        &mut self,
        step_index: usize,
        observation: Value,
        llm_observation: Value,
    ) -> Result<()> {
        let step = self.step_mut(step_index)?;
        if step.observation.is_some() || step.llm_observation.is_some() {
            return Err(Error::Validation(format!(
                "observation already recorded for step {step_index}"
            )));
        }
        step.observation = Some(observation);
        step.llm_observation = Some(llm_observation);
        Ok(())
    }

    /// Record a step error. Write-once.
    pub fn record_error(&mut self, step_index: usize, error: impl Into<String>) -> Result<()> {
        let step = self.step_mut(step_index)?;
        if step.error.is_some() {
            return Err(Error::Validation(format!(
                "error already recorded for step {step_index}"
            )));
        }
        step.error = Some(error.into());
        Ok(())
    }

    /// Replace an oversized LLM observation with its compressed summary.
    ///
    /// This is the one sanctioned rewrite of `llm_observation`, used by the
    /// context-overflow recovery path. The full `observation` is untouched.
    pub fn compress_llm_observation(
        &mut self,
        step_index: usize,
        summary: impl Into<String>,
    ) -> Result<()> {
        let step = self.step_mut(step_index)?;
        step.llm_observation = Some(json!({
            "_compressed": true,
            "summary": summary.into(),
        }));
        Ok(())
    }

    fn step_mut(&mut self, step_index: usize) -> Result<&mut TrajectoryStep> {
        let len = self.steps.len();
        self.steps
            .get_mut(step_index)
            .ok_or_else(|| Error::Validation(format!("step {step_index} out of range ({len})")))
    }

    /// Canonical JSON the LLM sees: the query plus each step's action,
    /// redacted observation, and error. serde_json maps are key-ordered, so
    /// the output is deterministic for equal inputs.
    pub fn serialize_for_llm(&self) -> Value {
        let steps: Vec<Value> = self
            .steps
            .iter()
            .map(|s| {
                let mut obj = Map::new();
                obj.insert("step_index".into(), json!(s.step_index));
                obj.insert(
                    "action".into(),
                    serde_json::to_value(&s.action).unwrap_or(Value::Null),
                );
                if let Some(o) = &s.llm_observation {
                    obj.insert("observation".into(), o.clone());
                }
                if let Some(e) = &s.error {
                    obj.insert("error".into(), json!(e));
                }
                Value::Object(obj)
            })
            .collect();

        let mut root = Map::new();
        root.insert("query".into(), json!(self.query));
        root.insert("steps".into(), Value::Array(steps));
        if !self.metadata.steering_inputs.is_empty() {
            root.insert(
                "steering_inputs".into(),
                Value::Array(self.metadata.steering_inputs.clone()),
            );
        }
        if !self.metadata.hints.is_empty() {
            root.insert("hints".into(), json!(self.metadata.hints));
        }
        Value::Object(root)
    }

    /// Check the density invariant: indices are exactly `[0..len)`.
    pub fn validate(&self) -> Result<()> {
        for (i, step) in self.steps.iter().enumerate() {
            if step.step_index != i {
                return Err(Error::Validation(format!(
                    "trajectory not dense: step {} has index {}",
                    i, step.step_index
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool_action(name: &str) -> PlannerAction {
        PlannerAction::tool(name, Map::new())
    }

    #[test]
    fn indices_are_dense() {
        let mut t = Trajectory::new("q");
        assert_eq!(t.append_step(tool_action("a"), None), 0);
        assert_eq!(t.append_step(tool_action("b"), None), 1);
        assert_eq!(t.append_step(tool_action("c"), None), 2);
        t.validate().unwrap();
    }

    #[test]
    fn observation_write_once() {
        let mut t = Trajectory::new("q");
        let i = t.append_step(tool_action("a"), None);
        t.record_observation(i, json!({"ok": true}), json!({"ok": true}))
            .unwrap();
        let err = t
            .record_observation(i, json!({}), json!({}))
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn error_write_once() {
        let mut t = Trajectory::new("q");
        let i = t.append_step(tool_action("a"), None);
        t.record_error(i, "boom").unwrap();
        assert!(t.record_error(i, "again").is_err());
    }

    #[test]
    fn record_out_of_range_fails() {
        let mut t = Trajectory::new("q");
        assert!(t.record_observation(0, json!({}), json!({})).is_err());
    }

    #[test]
    fn coerce_structured_observation() {
        let mut t = Trajectory::new("q");
        let i = t.append_step(tool_action("triage"), None);
        t.record_observation(i, json!({"route": "docs"}), json!({"route": "docs"}))
            .unwrap();
        let coerced = t.steps()[i].coerce_observation().unwrap();
        assert_eq!(coerced.get("route"), Some(&json!("docs")));
    }

    #[test]
    fn coerce_non_structured_is_none() {
        let mut t = Trajectory::new("q");
        let i = t.append_step(tool_action("fetch"), None);
        t.record_observation(i, json!("plain text"), json!("plain text"))
            .unwrap();
        assert!(t.steps()[i].coerce_observation().is_none());
    }

    #[test]
    fn serialize_uses_redacted_observation() {
        let mut t = Trajectory::new("q");
        let i = t.append_step(tool_action("fetch"), Some("thinking".into()));
        t.record_observation(
            i,
            json!({"data": "full blob", "secret": "raw"}),
            json!({"data": "<artifact:a1>"}),
        )
        .unwrap();
        let v = t.serialize_for_llm();
        let obs = &v["steps"][0]["observation"];
        assert_eq!(obs, &json!({"data": "<artifact:a1>"}));
        // Reasoning stays out of the LLM-visible canonical form.
        assert!(v["steps"][0].get("reasoning").is_none());
    }

    #[test]
    fn serialize_is_deterministic() {
        let mut t = Trajectory::new("q");
        let i = t.append_step(tool_action("a"), None);
        t.record_observation(i, json!({"z": 1, "a": 2}), json!({"z": 1, "a": 2}))
            .unwrap();
        let a = serde_json::to_string(&t.serialize_for_llm()).unwrap();
        let b = serde_json::to_string(&t.serialize_for_llm()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn compression_replaces_llm_observation_only() {
        let mut t = Trajectory::new("q");
        let i = t.append_step(tool_action("fetch"), None);
        t.record_observation(i, json!({"big": "x"}), json!({"big": "x"}))
            .unwrap();
        t.compress_llm_observation(i, "summary of x").unwrap();
        let step = &t.steps()[i];
        assert_eq!(step.observation, Some(json!({"big": "x"})));
        assert_eq!(
            step.llm_observation,
            Some(json!({"_compressed": true, "summary": "summary of x"}))
        );
    }

    #[test]
    fn persistence_roundtrip_preserves_observable_fields() {
        let mut t = Trajectory::new("q");
        let i = t.append_step(tool_action("a"), Some("r".into()));
        t.record_observation(i, json!({"k": 1}), json!({"k": 1})).unwrap();
        t.metadata.hints.push("prefer docs".into());
        t.metadata
            .pending_actions
            .push_back(PlannerAction::final_response("done"));

        let j = serde_json::to_string(&t).unwrap();
        let back: Trajectory = serde_json::from_str(&j).unwrap();
        back.validate().unwrap();
        assert_eq!(back.query, t.query);
        assert_eq!(back.len(), t.len());
        assert_eq!(back.metadata.hints, t.metadata.hints);
        assert_eq!(back.metadata.pending_actions.len(), 1);
        assert_eq!(
            serde_json::to_value(back.steps()).unwrap(),
            serde_json::to_value(t.steps()).unwrap()
        );
    }

    #[test]
    fn pending_actions_fifo() {
        let mut t = Trajectory::new("q");
        t.metadata.pending_actions.push_back(tool_action("a"));
        t.metadata.pending_actions.push_back(tool_action("b"));
        assert_eq!(t.metadata.pending_actions.pop_front().unwrap().next_node, "a");
        assert_eq!(t.metadata.pending_actions.pop_front().unwrap().next_node, "b");
    }
}
