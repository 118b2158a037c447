use serde::{Deserialize, Serialize};

use crate::group::ReportStrategy;
use crate::snapshot::MergeStrategy;

/// Task-group coordination settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    #[serde(default)]
    pub default_group_merge_strategy: MergeStrategy,
    #[serde(default)]
    pub default_group_report: ReportStrategy,
    /// Overall group deadline in seconds.
    #[serde(default = "default_group_timeout_s")]
    pub group_timeout_s: f64,
    /// Emit a partial group report when some members fail.
    #[serde(default = "default_true")]
    pub group_partial_on_failure: bool,
    /// Auto-seal open groups when the foreground turn yields.
    #[serde(default = "default_true")]
    pub auto_seal_groups_on_foreground_yield: bool,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            default_group_merge_strategy: MergeStrategy::default(),
            default_group_report: ReportStrategy::default(),
            group_timeout_s: default_group_timeout_s(),
            group_partial_on_failure: true,
            auto_seal_groups_on_foreground_yield: true,
        }
    }
}

fn default_group_timeout_s() -> f64 {
    600.0
}
fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = GroupConfig::default();
        assert_eq!(cfg.default_group_merge_strategy, MergeStrategy::Append);
        assert_eq!(cfg.default_group_report, ReportStrategy::All);
        assert!(cfg.auto_seal_groups_on_foreground_yield);
    }
}
