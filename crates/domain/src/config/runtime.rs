use serde::{Deserialize, Serialize};

/// Planner run-loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Maximum loop iterations before the task finishes with
    /// `reason=budget_exceeded`.
    #[serde(default = "default_max_iters")]
    pub max_iters: usize,
    /// Structured-output retry cap per LLM call.
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    /// Per-LLM-call timeout in seconds.
    #[serde(default = "default_timeout_s")]
    pub timeout_s: f64,
    #[serde(default = "default_true")]
    pub streaming_enabled: bool,
    /// Detect deterministic next steps from structured observations.
    #[serde(default = "default_true")]
    pub auto_seq_enabled: bool,
    /// Execute the detected step without an LLM call (otherwise it is only
    /// queued as a pending action for confirmation).
    #[serde(default = "default_true")]
    pub auto_seq_execute: bool,
    /// Restrict auto-seq to pure/read tools.
    #[serde(default = "default_true")]
    pub auto_seq_read_only_only: bool,
    /// Concurrency cap for parallel plan sub-calls.
    #[serde(default = "default_plan_concurrency")]
    pub plan_concurrency: usize,
    /// Fail the whole plan step on the first sub-call failure instead of
    /// recording the failure in the join input.
    #[serde(default)]
    pub plan_fail_fast: bool,
    /// Per-tool-call timeout in seconds.
    #[serde(default = "default_tool_timeout_s")]
    pub tool_timeout_s: f64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_iters: default_max_iters(),
            max_retries: default_max_retries(),
            timeout_s: default_timeout_s(),
            streaming_enabled: true,
            auto_seq_enabled: true,
            auto_seq_execute: true,
            auto_seq_read_only_only: true,
            plan_concurrency: default_plan_concurrency(),
            plan_fail_fast: false,
            tool_timeout_s: default_tool_timeout_s(),
        }
    }
}

fn default_max_iters() -> usize {
    25
}
fn default_max_retries() -> usize {
    3
}
fn default_timeout_s() -> f64 {
    120.0
}
fn default_tool_timeout_s() -> f64 {
    60.0
}
fn default_plan_concurrency() -> usize {
    8
}
fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.max_iters, 25);
        assert_eq!(cfg.max_retries, 3);
        assert!(cfg.auto_seq_enabled);
        assert!(cfg.auto_seq_read_only_only);
        assert!(!cfg.plan_fail_fast);
    }

    #[test]
    fn deserialize_missing_fields_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.plan_concurrency, 8);
        assert!(cfg.streaming_enabled);
    }
}
