use serde::Serialize;

/// Structured lifecycle events emitted across all PenguiFlow crates.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum FlowTrace {
    SessionResolved {
        session_id: String,
        is_new: bool,
    },
    TaskSpawned {
        session_id: String,
        task_id: String,
        task_type: String,
        queued: bool,
    },
    TaskStatusChanged {
        task_id: String,
        from: String,
        to: String,
    },
    SteeringReceived {
        task_id: String,
        event_id: String,
        kind: String,
        accepted: bool,
    },
    AutoSeqDetectedUnique {
        task_id: String,
        tool_name: String,
    },
    AutoSeqExecuted {
        task_id: String,
        tool_name: String,
        step_index: usize,
    },
    TrajectoryCompressed {
        task_id: String,
        steps_compressed: usize,
    },
    LlmCall {
        task_id: String,
        mode: String,
        attempts: u32,
        duration_ms: u64,
        input_tokens: Option<u32>,
        output_tokens: Option<u32>,
    },
    PatchReady {
        task_id: String,
        patch_id: String,
        strategy: String,
    },
    MergeApplied {
        patch_id: String,
        strategy: String,
        diverged: bool,
    },
    GroupSealed {
        group_id: String,
        members: usize,
    },
    GroupComplete {
        group_id: String,
    },
    PauseRecorded {
        task_id: String,
        resume_token: String,
    },
    TaskResumed {
        task_id: String,
        resume_token: String,
    },
    RetainTurnTimeout {
        task_id: String,
        group_id: Option<String>,
    },
    StoreFeatureDisabled {
        feature: String,
        reason: String,
    },
    UpdatesDropped {
        session_id: String,
        task_id: String,
        dropped: u64,
    },
}

impl FlowTrace {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(flow_event = %json, "pf_event");
    }
}
