use serde::{Deserialize, Serialize};

/// Error-recovery settings: backoff, trajectory compression.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// How many compress-then-retry cycles a single step may attempt.
    #[serde(default = "default_max_compress_retries")]
    pub max_compress_retries: usize,
    /// LLM observations larger than this (serialized chars) are compression
    /// candidates.
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold_chars: usize,
    /// Base backoff delay for retryable transport errors, in milliseconds.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Upper bound for a single backoff delay, in milliseconds.
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    /// Retry cap for retryable transport errors.
    #[serde(default = "default_max_transport_retries")]
    pub max_transport_retries: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_compress_retries: default_max_compress_retries(),
            compression_threshold_chars: default_compression_threshold(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            max_transport_retries: default_max_transport_retries(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_max_compress_retries() -> usize {
    1
}
fn default_compression_threshold() -> usize {
    4000
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_cap_ms() -> u64 {
    30_000
}
fn default_max_transport_retries() -> usize {
    4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = RecoveryConfig::default();
        assert!(cfg.enabled);
        assert_eq!(cfg.max_compress_retries, 1);
        assert_eq!(cfg.compression_threshold_chars, 4000);
    }

    #[test]
    fn deserialize_missing_field_uses_default() {
        let cfg: RecoveryConfig = serde_json::from_str("{\"enabled\": false}").unwrap();
        assert!(!cfg.enabled);
        assert_eq!(cfg.backoff_base_ms, 500);
    }
}
