//! Task-group coordination.
//!
//! Groups collect related background tasks and report once. Display names
//! resolve turn-scoped: within one foreground turn the same name joins the
//! same OPEN group; a later turn gets a fresh group. Completion requires
//! SEALED plus every member terminal, and the group-level report is handed
//! out exactly once.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use parking_lot::RwLock;

use pf_domain::error::{Error, Result};
use pf_domain::group::{GroupStatus, ReportStrategy, TaskGroup};
use pf_domain::snapshot::MergeStrategy;
use pf_domain::task::TaskStatus;
use pf_domain::trace::FlowTrace;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Group reports
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Handed out once when a group completes.
#[derive(Debug, Clone)]
pub struct GroupReport {
    pub group: TaskGroup,
    pub failed_members: Vec<String>,
    pub cancelled_members: Vec<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
struct Inner {
    groups: HashMap<String, TaskGroup>,
    /// (session_id, turn_id, display_name) → group_id.
    turn_names: HashMap<(String, String, String), String>,
    reported: HashSet<String>,
}

#[derive(Default)]
pub struct GroupRegistry {
    inner: RwLock<Inner>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve or create a group.
    ///
    /// With `group_id` the group must exist, belong to the same session
    /// (cross-session joining is rejected), and still be OPEN. With a
    /// display name, an OPEN group created earlier in the same turn is
    /// joined; otherwise a new group is created.
    pub fn create_or_join(
        &self,
        session_id: &str,
        turn_id: &str,
        display_name: Option<&str>,
        group_id: Option<&str>,
        merge_strategy: MergeStrategy,
        report_strategy: ReportStrategy,
    ) -> Result<TaskGroup> {
        let mut inner = self.inner.write();

        if let Some(id) = group_id {
            let group = inner
                .groups
                .get(id)
                .ok_or_else(|| Error::Validation(format!("unknown group {id}")))?;
            if group.session_id != session_id {
                return Err(Error::Validation(format!(
                    "group {id} belongs to another session"
                )));
            }
            if group.status != GroupStatus::Open {
                return Err(Error::Validation(format!("group {id} is not open")));
            }
            return Ok(group.clone());
        }

        let name = display_name.unwrap_or("background");
        let key = (session_id.to_owned(), turn_id.to_owned(), name.to_owned());
        if let Some(id) = inner.turn_names.get(&key) {
            if let Some(group) = inner.groups.get(id) {
                if group.status == GroupStatus::Open {
                    return Ok(group.clone());
                }
            }
        }

        let group = TaskGroup::new(name, session_id, merge_strategy, report_strategy);
        inner.turn_names.insert(key, group.group_id.clone());
        inner.groups.insert(group.group_id.clone(), group.clone());
        Ok(group)
    }

    pub fn get(&self, group_id: &str) -> Option<TaskGroup> {
        self.inner.read().groups.get(group_id).cloned()
    }

    pub fn add_task(&self, group_id: &str, task_id: &str) -> Result<()> {
        let mut inner = self.inner.write();
        let group = inner
            .groups
            .get_mut(group_id)
            .ok_or_else(|| Error::Validation(format!("unknown group {group_id}")))?;
        if group.status != GroupStatus::Open {
            return Err(Error::Validation(format!("group {group_id} is sealed")));
        }
        if !group.task_ids.iter().any(|t| t == task_id) {
            group.task_ids.push(task_id.to_owned());
        }
        Ok(())
    }

    pub fn add_patch(&self, group_id: &str, patch_id: &str) {
        let mut inner = self.inner.write();
        if let Some(group) = inner.groups.get_mut(group_id) {
            if !group.pending_patches.iter().any(|p| p == patch_id) {
                group.pending_patches.push(patch_id.to_owned());
            }
        }
    }

    /// Explicit seal. Idempotent (sealing a sealed group is a no-op).
    pub fn seal(&self, group_id: &str) -> Result<TaskGroup> {
        let mut inner = self.inner.write();
        let group = inner
            .groups
            .get_mut(group_id)
            .ok_or_else(|| Error::Validation(format!("unknown group {group_id}")))?;
        if group.status == GroupStatus::Open {
            group.status = GroupStatus::Sealed;
            group.sealed_at = Some(Utc::now());
            FlowTrace::GroupSealed {
                group_id: group_id.to_owned(),
                members: group.task_ids.len(),
            }
            .emit();
        }
        Ok(group.clone())
    }

    /// Auto-seal every OPEN group the turn created (foreground yield).
    pub fn seal_open_for_turn(&self, session_id: &str, turn_id: &str) -> Vec<TaskGroup> {
        let ids: Vec<String> = {
            let inner = self.inner.read();
            inner
                .turn_names
                .iter()
                .filter(|((sid, tid, _), _)| sid == session_id && tid == turn_id)
                .map(|(_, gid)| gid.clone())
                .collect()
        };
        let mut sealed = Vec::new();
        for id in ids {
            if let Ok(group) = self.seal(&id) {
                if group.status == GroupStatus::Sealed {
                    sealed.push(group);
                }
            }
        }
        sealed
    }

    /// Check completion: SEALED ∧ all members terminal. The report is
    /// returned exactly once per group; later calls return `None`.
    pub fn try_complete(
        &self,
        group_id: &str,
        status_of: impl Fn(&str) -> Option<TaskStatus>,
    ) -> Option<GroupReport> {
        let mut inner = self.inner.write();
        let group = inner.groups.get_mut(group_id)?;
        if group.status != GroupStatus::Sealed {
            return None;
        }

        let mut failed = Vec::new();
        let mut cancelled = Vec::new();
        for task_id in &group.task_ids {
            match status_of(task_id) {
                Some(TaskStatus::Failed) => failed.push(task_id.clone()),
                Some(TaskStatus::Cancelled) => cancelled.push(task_id.clone()),
                Some(s) if s.is_terminal() => {}
                _ => return None, // someone is still running
            }
        }

        let all_failed = !group.task_ids.is_empty()
            && failed.len() + cancelled.len() == group.task_ids.len();
        group.status = if all_failed {
            GroupStatus::Failed
        } else {
            GroupStatus::Complete
        };
        group.completed_at = Some(Utc::now());
        let snapshot = group.clone();

        if !inner.reported.insert(group_id.to_owned()) {
            return None; // already reported
        }
        FlowTrace::GroupComplete {
            group_id: group_id.to_owned(),
        }
        .emit();
        Some(GroupReport {
            group: snapshot,
            failed_members: failed,
            cancelled_members: cancelled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn statuses(pairs: &[(&str, TaskStatus)]) -> HashMap<String, TaskStatus> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn same_turn_same_name_joins() {
        let reg = GroupRegistry::new();
        let g1 = reg
            .create_or_join("s1", "turn1", Some("research"), None, MergeStrategy::Append, ReportStrategy::All)
            .unwrap();
        let g2 = reg
            .create_or_join("s1", "turn1", Some("research"), None, MergeStrategy::Append, ReportStrategy::All)
            .unwrap();
        assert_eq!(g1.group_id, g2.group_id);
    }

    #[test]
    fn different_turn_gets_fresh_group() {
        let reg = GroupRegistry::new();
        let g1 = reg
            .create_or_join("s1", "turn1", Some("research"), None, MergeStrategy::Append, ReportStrategy::All)
            .unwrap();
        let g2 = reg
            .create_or_join("s1", "turn2", Some("research"), None, MergeStrategy::Append, ReportStrategy::All)
            .unwrap();
        assert_ne!(g1.group_id, g2.group_id);
    }

    #[test]
    fn cross_session_join_rejected() {
        let reg = GroupRegistry::new();
        let g1 = reg
            .create_or_join("s1", "turn1", Some("research"), None, MergeStrategy::Append, ReportStrategy::All)
            .unwrap();
        let err = reg
            .create_or_join("s2", "turn1", None, Some(&g1.group_id), MergeStrategy::Append, ReportStrategy::All)
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn sealed_group_rejects_new_members() {
        let reg = GroupRegistry::new();
        let g = reg
            .create_or_join("s1", "turn1", Some("research"), None, MergeStrategy::Append, ReportStrategy::All)
            .unwrap();
        reg.add_task(&g.group_id, "t1").unwrap();
        reg.seal(&g.group_id).unwrap();
        assert!(reg.add_task(&g.group_id, "t2").is_err());
        // Joining by id after seal is rejected too.
        assert!(reg
            .create_or_join("s1", "turn1", None, Some(&g.group_id), MergeStrategy::Append, ReportStrategy::All)
            .is_err());
    }

    #[test]
    fn completion_requires_seal_and_terminal_members() {
        let reg = GroupRegistry::new();
        let g = reg
            .create_or_join("s1", "turn1", Some("research"), None, MergeStrategy::Append, ReportStrategy::All)
            .unwrap();
        reg.add_task(&g.group_id, "t1").unwrap();
        reg.add_task(&g.group_id, "t2").unwrap();

        let map = statuses(&[("t1", TaskStatus::Complete), ("t2", TaskStatus::Running)]);
        // Not sealed yet.
        assert!(reg
            .try_complete(&g.group_id, |id| map.get(id).copied())
            .is_none());

        reg.seal(&g.group_id).unwrap();
        // Sealed but t2 still running.
        assert!(reg
            .try_complete(&g.group_id, |id| map.get(id).copied())
            .is_none());

        let map = statuses(&[("t1", TaskStatus::Complete), ("t2", TaskStatus::Complete)]);
        let report = reg
            .try_complete(&g.group_id, |id| map.get(id).copied())
            .unwrap();
        assert_eq!(report.group.status, GroupStatus::Complete);
        assert!(report.failed_members.is_empty());
    }

    #[test]
    fn report_emitted_exactly_once() {
        let reg = GroupRegistry::new();
        let g = reg
            .create_or_join("s1", "turn1", Some("research"), None, MergeStrategy::Append, ReportStrategy::All)
            .unwrap();
        reg.add_task(&g.group_id, "t1").unwrap();
        reg.seal(&g.group_id).unwrap();

        let map = statuses(&[("t1", TaskStatus::Complete)]);
        assert!(reg
            .try_complete(&g.group_id, |id| map.get(id).copied())
            .is_some());
        assert!(reg
            .try_complete(&g.group_id, |id| map.get(id).copied())
            .is_none());
    }

    #[test]
    fn all_failed_members_fail_the_group() {
        let reg = GroupRegistry::new();
        let g = reg
            .create_or_join("s1", "turn1", Some("research"), None, MergeStrategy::Append, ReportStrategy::All)
            .unwrap();
        reg.add_task(&g.group_id, "t1").unwrap();
        reg.add_task(&g.group_id, "t2").unwrap();
        reg.seal(&g.group_id).unwrap();

        let map = statuses(&[("t1", TaskStatus::Failed), ("t2", TaskStatus::Cancelled)]);
        let report = reg
            .try_complete(&g.group_id, |id| map.get(id).copied())
            .unwrap();
        assert_eq!(report.group.status, GroupStatus::Failed);
        assert_eq!(report.failed_members, vec!["t1"]);
        assert_eq!(report.cancelled_members, vec!["t2"]);
    }

    #[test]
    fn partial_failure_still_completes() {
        let reg = GroupRegistry::new();
        let g = reg
            .create_or_join("s1", "turn1", Some("research"), None, MergeStrategy::Append, ReportStrategy::All)
            .unwrap();
        reg.add_task(&g.group_id, "t1").unwrap();
        reg.add_task(&g.group_id, "t2").unwrap();
        reg.seal(&g.group_id).unwrap();

        let map = statuses(&[("t1", TaskStatus::Complete), ("t2", TaskStatus::Failed)]);
        let report = reg
            .try_complete(&g.group_id, |id| map.get(id).copied())
            .unwrap();
        assert_eq!(report.group.status, GroupStatus::Complete);
        assert_eq!(report.failed_members, vec!["t2"]);
    }

    #[test]
    fn auto_seal_for_turn() {
        let reg = GroupRegistry::new();
        let g1 = reg
            .create_or_join("s1", "turn1", Some("a"), None, MergeStrategy::Append, ReportStrategy::All)
            .unwrap();
        let g2 = reg
            .create_or_join("s1", "turn1", Some("b"), None, MergeStrategy::Append, ReportStrategy::All)
            .unwrap();
        let other_turn = reg
            .create_or_join("s1", "turn2", Some("c"), None, MergeStrategy::Append, ReportStrategy::All)
            .unwrap();

        let sealed = reg.seal_open_for_turn("s1", "turn1");
        let sealed_ids: Vec<&str> = sealed.iter().map(|g| g.group_id.as_str()).collect();
        assert_eq!(sealed.len(), 2);
        assert!(sealed_ids.contains(&g1.group_id.as_str()));
        assert!(sealed_ids.contains(&g2.group_id.as_str()));
        assert_eq!(reg.get(&other_turn.group_id).unwrap().status, GroupStatus::Open);
    }
}
