use serde::{Deserialize, Serialize};

/// Per-session task limits and background-coordination settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLimitsConfig {
    /// Total tasks (any status) a session may hold.
    #[serde(default = "default_max_total")]
    pub max_total_tasks: usize,
    /// Tasks that may run concurrently within a session; excess spawns are
    /// queued as Pending by priority. Clamped to `1..=20`.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_tasks: usize,
    /// Maximum task lifetime in seconds.
    #[serde(default = "default_lifetime_s")]
    pub max_task_lifetime_s: f64,
    /// Cap on queued USER_MESSAGE steering events per task.
    #[serde(default = "default_max_pending_user_messages")]
    pub max_pending_user_messages: usize,
    /// Steering inbox capacity per task.
    #[serde(default = "default_inbox_capacity")]
    pub steering_inbox_capacity: usize,
    /// How long a retain-turn foreground waits before force-yielding.
    #[serde(default = "default_retain_turn_timeout_s")]
    pub retain_turn_timeout_s: f64,
    /// Loop-iteration budget for background continuation after a forced
    /// yield.
    #[serde(default = "default_continuation_hops")]
    pub background_continuation_max_hops: usize,
    /// Reject foreground-addressed steering when no foreground task is
    /// running or pending (otherwise buffer it for the next spawn).
    #[serde(default)]
    pub reject_unroutable_steering: bool,
}

impl Default for TaskLimitsConfig {
    fn default() -> Self {
        Self {
            max_total_tasks: default_max_total(),
            max_concurrent_tasks: default_max_concurrent(),
            max_task_lifetime_s: default_lifetime_s(),
            max_pending_user_messages: default_max_pending_user_messages(),
            steering_inbox_capacity: default_inbox_capacity(),
            retain_turn_timeout_s: default_retain_turn_timeout_s(),
            background_continuation_max_hops: default_continuation_hops(),
            reject_unroutable_steering: false,
        }
    }
}

impl TaskLimitsConfig {
    /// Clamp `max_concurrent_tasks` to the allowed range `1..=20`.
    pub fn clamped(&self) -> Self {
        Self {
            max_concurrent_tasks: self.max_concurrent_tasks.clamp(1, 20),
            ..self.clone()
        }
    }
}

fn default_max_total() -> usize {
    64
}
fn default_max_concurrent() -> usize {
    5
}
fn default_lifetime_s() -> f64 {
    900.0
}
fn default_max_pending_user_messages() -> usize {
    2
}
fn default_inbox_capacity() -> usize {
    32
}
fn default_retain_turn_timeout_s() -> f64 {
    120.0
}
fn default_continuation_hops() -> usize {
    4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = TaskLimitsConfig::default();
        assert_eq!(cfg.max_concurrent_tasks, 5);
        assert_eq!(cfg.max_pending_user_messages, 2);
        assert!(!cfg.reject_unroutable_steering);
    }

    #[test]
    fn clamp_bounds() {
        let cfg = TaskLimitsConfig { max_concurrent_tasks: 0, ..Default::default() };
        assert_eq!(cfg.clamped().max_concurrent_tasks, 1);
        let cfg = TaskLimitsConfig { max_concurrent_tasks: 100, ..Default::default() };
        assert_eq!(cfg.clamped().max_concurrent_tasks, 20);
    }

    #[test]
    fn deserialize_missing_field_uses_default() {
        let cfg: TaskLimitsConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.steering_inbox_capacity, 32);
    }
}
