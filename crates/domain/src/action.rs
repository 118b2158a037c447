//! Planner actions — the structured decision an LLM step produces.
//!
//! An action is exactly `{ next_node, args }`. `next_node` names a tool, or
//! one of the reserved nodes `plan` (parallel fan-out), `task` (background
//! spawn), `final_response` (terminal answer). Reasoning text travels
//! out-of-band on the trajectory step, never inside the action.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Reserved node name: expand into parallel sub-calls.
pub const NODE_PLAN: &str = "plan";
/// Reserved node name: spawn a background task.
pub const NODE_TASK: &str = "task";
/// Reserved node name: terminal answer.
pub const NODE_FINAL: &str = "final_response";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// PlannerAction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A structured planner decision. Immutable once chosen for a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlannerAction {
    /// Tool name or reserved node. A JSON `null` is accepted on the wire as
    /// a legacy spelling of `final_response`.
    #[serde(deserialize_with = "de_next_node")]
    pub next_node: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

fn de_next_node<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Option::<String>::deserialize(deserializer)?;
    Ok(v.unwrap_or_else(|| NODE_FINAL.to_string()))
}

impl PlannerAction {
    pub fn tool(name: impl Into<String>, args: Map<String, Value>) -> Self {
        Self {
            next_node: name.into(),
            args,
        }
    }

    pub fn final_response(answer: impl Into<String>) -> Self {
        let mut args = Map::new();
        args.insert("answer".into(), Value::String(answer.into()));
        Self {
            next_node: NODE_FINAL.into(),
            args,
        }
    }

    pub fn is_final(&self) -> bool {
        self.next_node == NODE_FINAL
    }

    pub fn is_plan(&self) -> bool {
        self.next_node == NODE_PLAN
    }

    pub fn is_task(&self) -> bool {
        self.next_node == NODE_TASK
    }

    /// Whether this action names a reserved node rather than a tool.
    pub fn is_reserved(&self) -> bool {
        matches!(self.next_node.as_str(), NODE_PLAN | NODE_TASK | NODE_FINAL)
    }

    fn args_value(&self) -> Value {
        Value::Object(self.args.clone())
    }

    /// Typed view of a `plan` action's args.
    pub fn plan_args(&self) -> Result<PlanArgs> {
        if !self.is_plan() {
            return Err(Error::Validation(format!(
                "not a plan action: {}",
                self.next_node
            )));
        }
        let args: PlanArgs = serde_json::from_value(self.args_value())
            .map_err(|e| Error::Validation(format!("plan args: {e}")))?;
        if args.steps.is_empty() {
            return Err(Error::Validation("plan has no steps".into()));
        }
        Ok(args)
    }

    /// Typed view of a `task` action's args.
    pub fn task_args(&self) -> Result<TaskArgs> {
        if !self.is_task() {
            return Err(Error::Validation(format!(
                "not a task action: {}",
                self.next_node
            )));
        }
        serde_json::from_value(self.args_value())
            .map_err(|e| Error::Validation(format!("task args: {e}")))
    }

    /// Typed view of a `final_response` action's args.
    pub fn final_args(&self) -> Result<FinalArgs> {
        if !self.is_final() {
            return Err(Error::Validation(format!(
                "not a final_response action: {}",
                self.next_node
            )));
        }
        serde_json::from_value(self.args_value())
            .map_err(|e| Error::Validation(format!("final_response args: {e}")))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Typed arg views
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One step of a parallel plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub node: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

/// Optional join directive for a plan. When `node` is absent the runtime
/// aggregates results via the LLM instead.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanJoin {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    #[serde(default)]
    pub args: Map<String, Value>,
    /// Mapping of join-arg name → `"$all"` (inject the ordered result list)
    /// or `"$<index>"` (inject a single step result).
    #[serde(default)]
    pub inject: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanArgs {
    pub steps: Vec<PlanStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join: Option<PlanJoin>,
}

/// Args of a `task` action — a background spawn request as the LLM states it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskArgs {
    /// The sub-query the background task should pursue.
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: i32,
    /// Resolve or create a group by display name (turn-scoped).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
    /// Join an existing group directly by id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_strategy: Option<crate::snapshot::MergeStrategy>,
    /// Seal the group after this spawn.
    #[serde(default)]
    pub group_sealed: bool,
    /// Hold the foreground turn until the task (or its group) completes.
    #[serde(default)]
    pub retain_turn: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

/// Args of a `final_response` action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalArgs {
    #[serde(alias = "raw_answer")]
    pub answer: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// Providers attach ad-hoc extras; keep them without modeling each.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
