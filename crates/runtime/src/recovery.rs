//! Error recovery: trajectory compression on context overflow, backoff for
//! transient transport errors, and bad-request observation synthesis.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use pf_domain::config::RecoveryConfig;
use pf_domain::error::Result;
use pf_domain::trace::FlowTrace;
use pf_domain::trajectory::Trajectory;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Summarizer hook
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Produces the replacement summary for an oversized observation. The
/// default is plain truncation; embedders plug an LLM-backed summarizer in
/// through the same trait.
#[async_trait]
pub trait ObservationSummarizer: Send + Sync {
    async fn summarize(&self, observation: &Value) -> Result<String>;
}

pub struct TruncatingSummarizer {
    pub max_chars: usize,
}

impl Default for TruncatingSummarizer {
    fn default() -> Self {
        Self { max_chars: 400 }
    }
}

#[async_trait]
impl ObservationSummarizer for TruncatingSummarizer {
    async fn summarize(&self, observation: &Value) -> Result<String> {
        let serialized = serde_json::to_string(observation)?;
        let mut end = self.max_chars.min(serialized.len());
        while end > 0 && !serialized.is_char_boundary(end) {
            end -= 1;
        }
        let mut summary = serialized[..end].to_string();
        if end < serialized.len() {
            summary.push_str("...");
        }
        Ok(summary)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Policy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct RecoveryPolicy {
    config: RecoveryConfig,
}

impl RecoveryPolicy {
    pub fn new(config: RecoveryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Exponential backoff with deterministic jitter: the jitter component
    /// is hashed from `(seed, attempt)` so retry schedules are reproducible
    /// in tests and spread across concurrent tasks in production.
    pub fn backoff_delay(&self, attempt: u32, seed: &str) -> Duration {
        let base = self.config.backoff_base_ms;
        let cap = self.config.backoff_cap_ms.max(base);
        let exp = base.saturating_mul(1u64 << attempt.min(16));
        let bounded = exp.min(cap);

        let mut hash: u64 = 0xcbf29ce484222325;
        for byte in seed.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x100000001b3);
        }
        hash ^= u64::from(attempt);
        hash = hash.wrapping_mul(0x100000001b3);
        // Jitter in [0, bounded/2).
        let jitter = hash % (bounded / 2).max(1);
        Duration::from_millis(bounded / 2 + jitter)
    }

    /// Replace every oversized `llm_observation` with a compressed marker.
    /// Returns how many steps were compressed.
    pub async fn compress_trajectory(
        &self,
        trajectory: &mut Trajectory,
        summarizer: &dyn ObservationSummarizer,
        task_id: &str,
    ) -> Result<usize> {
        let threshold = self.config.compression_threshold_chars;
        let candidates: Vec<(usize, Value)> = trajectory
            .steps()
            .iter()
            .filter_map(|step| {
                let obs = step.llm_observation.as_ref()?;
                if obs.get("_compressed").and_then(Value::as_bool) == Some(true) {
                    return None;
                }
                let size = serde_json::to_string(obs).map(|s| s.len()).unwrap_or(0);
                (size > threshold).then(|| (step.step_index, obs.clone()))
            })
            .collect();

        let mut compressed = 0;
        for (step_index, observation) in candidates {
            let summary = summarizer.summarize(&observation).await?;
            trajectory.compress_llm_observation(step_index, summary)?;
            compressed += 1;
        }
        if compressed > 0 {
            FlowTrace::TrajectoryCompressed {
                task_id: task_id.to_owned(),
                steps_compressed: compressed,
            }
            .emit();
        }
        Ok(compressed)
    }

    /// Synthesize the observation payload for a non-context bad request:
    /// unwrap nested provider JSON down to the innermost message so the
    /// next LLM step sees a clean error instead of a wire blob.
    pub fn clean_bad_request(&self, message: &str) -> Value {
        json!({
            "error": unwrap_error_message(message),
            "recoverable": true,
        })
    }
}

/// Providers wrap errors in JSON, often nested stringified JSON. Descend
/// `error`/`message` fields (re-parsing string payloads) to the innermost
/// human-readable message.
fn unwrap_error_message(message: &str) -> String {
    let mut current = message.trim().to_string();
    for _ in 0..4 {
        let parsed: Value = match serde_json::from_str(&current) {
            Ok(v) => v,
            Err(_) => break,
        };
        let next = parsed
            .get("error")
            .and_then(|e| {
                e.get("message")
                    .or(Some(e))
                    .map(|m| m.clone())
            })
            .or_else(|| parsed.get("message").cloned());
        match next {
            Some(Value::String(s)) => current = s,
            Some(other) => {
                current = serde_json::to_string(&other).unwrap_or(current);
            }
            None => break,
        }
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use pf_domain::action::PlannerAction;
    use serde_json::Map;

    fn policy() -> RecoveryPolicy {
        RecoveryPolicy::new(RecoveryConfig::default())
    }

    #[test]
    fn backoff_grows_and_caps() {
        let p = policy();
        let d0 = p.backoff_delay(0, "task");
        let d3 = p.backoff_delay(3, "task");
        assert!(d3 >= d0);
        let capped = p.backoff_delay(30, "task");
        assert!(capped.as_millis() as u64 <= p.config().backoff_cap_ms + p.config().backoff_cap_ms / 2);
    }

    #[test]
    fn backoff_is_deterministic_per_seed() {
        let p = policy();
        assert_eq!(p.backoff_delay(2, "t1"), p.backoff_delay(2, "t1"));
        // Different seeds spread.
        let spread = (0..8)
            .map(|i| p.backoff_delay(2, &format!("t{i}")).as_millis())
            .collect::<std::collections::HashSet<_>>();
        assert!(spread.len() > 1);
    }

    #[tokio::test]
    async fn compress_replaces_only_oversized() {
        let mut config = RecoveryConfig::default();
        config.compression_threshold_chars = 50;
        let p = RecoveryPolicy::new(config);
        let summarizer = TruncatingSummarizer { max_chars: 20 };

        let mut traj = Trajectory::new("q");
        let big = json!({"blob": "x".repeat(200)});
        let small = json!({"ok": true});
        for obs in [&big, &small, &big] {
            let i = traj.append_step(PlannerAction::tool("fetch", Map::new()), None);
            traj.record_observation(i, obs.clone(), obs.clone()).unwrap();
        }

        let n = p.compress_trajectory(&mut traj, &summarizer, "t1").await.unwrap();
        assert_eq!(n, 2);
        let steps = traj.steps();
        assert_eq!(steps[0].llm_observation.as_ref().unwrap()["_compressed"], json!(true));
        assert_eq!(steps[1].llm_observation.as_ref().unwrap(), &small);
        assert_eq!(steps[2].llm_observation.as_ref().unwrap()["_compressed"], json!(true));
        // Full observations untouched.
        assert_eq!(steps[0].observation.as_ref().unwrap(), &big);
    }

    #[tokio::test]
    async fn compress_skips_already_compressed() {
        let mut config = RecoveryConfig::default();
        config.compression_threshold_chars = 10;
        let p = RecoveryPolicy::new(config);
        let summarizer = TruncatingSummarizer::default();

        let mut traj = Trajectory::new("q");
        let big = json!({"blob": "x".repeat(100)});
        let i = traj.append_step(PlannerAction::tool("fetch", Map::new()), None);
        traj.record_observation(i, big.clone(), big).unwrap();

        assert_eq!(p.compress_trajectory(&mut traj, &summarizer, "t1").await.unwrap(), 1);
        assert_eq!(p.compress_trajectory(&mut traj, &summarizer, "t1").await.unwrap(), 0);
    }

    #[test]
    fn unwrap_nested_error_json() {
        let raw = r#"{"error": {"message": "{\"error\": {\"message\": \"tool xyz not found\"}}"}}"#;
        assert_eq!(unwrap_error_message(raw), "tool xyz not found");
        assert_eq!(unwrap_error_message("plain text"), "plain text");
        assert_eq!(
            unwrap_error_message(r#"{"message": "top level"}"#),
            "top level"
        );
    }

    #[test]
    fn clean_bad_request_shape() {
        let v = policy().clean_bad_request(r#"{"error": {"message": "bad param"}}"#);
        assert_eq!(v["error"], "bad param");
        assert_eq!(v["recoverable"], true);
    }
}
