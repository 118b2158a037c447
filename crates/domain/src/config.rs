//! Configuration surface — one serde-default struct per concern.
//!
//! Loading and merging (files, env) is the embedder's job; the structs,
//! field defaults, and clamping live here.

mod groups;
mod pricing;
mod recovery;
mod runtime;
mod tasks;

pub use groups::GroupConfig;
pub use pricing::{ModelPricing, PricingConfig};
pub use recovery::RecoveryConfig;
pub use runtime::RuntimeConfig;
pub use tasks::TaskLimitsConfig;

use serde::{Deserialize, Serialize};

/// Aggregate configuration for one planner runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub tasks: TaskLimitsConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub groups: GroupConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let cfg: FlowConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.runtime.max_iters, 25);
        assert_eq!(cfg.tasks.max_pending_user_messages, 2);
        assert!(cfg.recovery.enabled);
    }

    #[test]
    fn partial_toml_overrides() {
        let cfg: FlowConfig = toml::from_str(
            r#"
            [runtime]
            max_iters = 5
            streaming_enabled = false

            [tasks]
            max_concurrent_tasks = 3
            "#,
        )
        .unwrap();
        assert_eq!(cfg.runtime.max_iters, 5);
        assert!(!cfg.runtime.streaming_enabled);
        assert_eq!(cfg.tasks.max_concurrent_tasks, 3);
        // Untouched sections keep defaults.
        assert_eq!(cfg.recovery.compression_threshold_chars, 4000);
    }
}
