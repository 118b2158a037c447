//! Capability gating with log-once degradation.
//!
//! A missing optional capability, or a runtime failure of an optional
//! write, disables the corresponding feature for the rest of the session
//! and logs exactly one warning. Core audit failures are never gated.

use std::collections::HashSet;

use parking_lot::Mutex;

use pf_domain::trace::FlowTrace;

use crate::StoreCapabilities;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    PlannerState,
    Memory,
    Tasks,
    Updates,
    Steering,
    Trajectories,
    PlannerEvents,
    Artifacts,
}

impl Feature {
    pub fn name(self) -> &'static str {
        match self {
            Feature::PlannerState => "planner_state",
            Feature::Memory => "memory",
            Feature::Tasks => "tasks",
            Feature::Updates => "updates",
            Feature::Steering => "steering",
            Feature::Trajectories => "trajectories",
            Feature::PlannerEvents => "planner_events",
            Feature::Artifacts => "artifacts",
        }
    }
}

pub struct FeatureGate {
    caps: StoreCapabilities,
    disabled: Mutex<HashSet<Feature>>,
}

impl FeatureGate {
    /// Discover capabilities once at session startup; warn once for every
    /// missing optional feature.
    pub fn discover(caps: StoreCapabilities) -> Self {
        let gate = Self {
            caps,
            disabled: Mutex::new(HashSet::new()),
        };
        for feature in [
            Feature::PlannerState,
            Feature::Memory,
            Feature::Tasks,
            Feature::Updates,
            Feature::Steering,
            Feature::Trajectories,
            Feature::PlannerEvents,
            Feature::Artifacts,
        ] {
            if !gate.supported(feature) {
                gate.disable(feature, "not supported by store");
            }
        }
        gate
    }

    fn supported(&self, feature: Feature) -> bool {
        match feature {
            Feature::PlannerState => self.caps.planner_state,
            Feature::Memory => self.caps.memory,
            Feature::Tasks => self.caps.tasks,
            Feature::Updates => self.caps.updates,
            Feature::Steering => self.caps.steering,
            Feature::Trajectories => self.caps.trajectories,
            Feature::PlannerEvents => self.caps.planner_events,
            Feature::Artifacts => self.caps.artifacts,
        }
    }

    /// Whether the feature is currently usable.
    pub fn enabled(&self, feature: Feature) -> bool {
        !self.disabled.lock().contains(&feature)
    }

    /// Disable a feature (idempotent; warns only on the first call).
    pub fn disable(&self, feature: Feature, reason: &str) {
        let mut disabled = self.disabled.lock();
        if disabled.insert(feature) {
            tracing::warn!(feature = feature.name(), reason, "store feature disabled");
            FlowTrace::StoreFeatureDisabled {
                feature: feature.name().into(),
                reason: reason.into(),
            }
            .emit();
        }
    }

    /// Record a runtime failure of an optional operation: disables the
    /// feature and swallows the error (optional persistence must not crash
    /// the run).
    pub fn optional_failed(&self, feature: Feature, error: &pf_domain::error::Error) {
        self.disable(feature, &error.to_string());
    }
}
