//! Task groups — named sets of related background tasks that report together.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::snapshot::MergeStrategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    Open,
    Sealed,
    Complete,
    Failed,
}

impl GroupStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

/// How many member results the group report waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStrategy {
    All,
    Any,
    None,
}

impl Default for ReportStrategy {
    fn default() -> Self {
        Self::All
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskGroup {
    pub group_id: String,
    pub display_name: String,
    pub session_id: String,
    pub status: GroupStatus,
    pub merge_strategy: MergeStrategy,
    pub report_strategy: ReportStrategy,
    #[serde(default)]
    pub task_ids: Vec<String>,
    /// Patch ids accumulated from finished members, pending the group report.
    #[serde(default)]
    pub pending_patches: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sealed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskGroup {
    pub fn new(
        display_name: impl Into<String>,
        session_id: impl Into<String>,
        merge_strategy: MergeStrategy,
        report_strategy: ReportStrategy,
    ) -> Self {
        Self {
            group_id: Uuid::new_v4().to_string(),
            display_name: display_name.into(),
            session_id: session_id.into(),
            status: GroupStatus::Open,
            merge_strategy,
            report_strategy,
            task_ids: Vec::new(),
            pending_patches: Vec::new(),
            created_at: Utc::now(),
            sealed_at: None,
            completed_at: None,
        }
    }
}
