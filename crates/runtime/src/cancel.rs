//! Per-task cancellation with descendant fan-out.
//!
//! Each running task registers a token here. Cancelling a task also
//! cancels every descendant registered under it (children of children
//! included), which is what `cancel(cascade=true)` and group teardown
//! build on.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use pf_domain::cancel::CancelToken;

/// Tracks active cancellation tokens per task id, with parent→children
/// edges for cascading cancellation.
pub struct CancelMap {
    tokens: Mutex<HashMap<String, CancelToken>>,
    children: Mutex<HashMap<String, HashSet<String>>>,
}

impl Default for CancelMap {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelMap {
    pub fn new() -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Create and register a new cancel token for a task.
    pub fn register(&self, task_id: &str) -> CancelToken {
        let token = CancelToken::new();
        self.tokens.lock().insert(task_id.to_owned(), token.clone());
        token
    }

    /// Fetch the live token for a task, if registered.
    pub fn get(&self, task_id: &str) -> Option<CancelToken> {
        self.tokens.lock().get(task_id).cloned()
    }

    /// Record a parent→child edge for cascading cancel.
    pub fn add_child(&self, parent_id: &str, child_id: &str) {
        self.children
            .lock()
            .entry(parent_id.to_owned())
            .or_default()
            .insert(child_id.to_owned());
    }

    /// Cancel one task. With `cascade`, every transitive descendant is
    /// cancelled too. Returns true when at least one token was signalled.
    pub fn cancel(&self, task_id: &str, cascade: bool) -> bool {
        let mut targets = vec![task_id.to_owned()];
        if cascade {
            let children = self.children.lock();
            let mut seen: HashSet<String> = HashSet::new();
            let mut stack = vec![task_id.to_owned()];
            while let Some(current) = stack.pop() {
                if !seen.insert(current.clone()) {
                    continue;
                }
                if let Some(kids) = children.get(&current) {
                    for kid in kids {
                        targets.push(kid.clone());
                        stack.push(kid.clone());
                    }
                }
            }
        }

        let tokens = self.tokens.lock();
        let mut any = false;
        for target in targets {
            if let Some(token) = tokens.get(&target) {
                token.cancel();
                any = true;
            }
        }
        any
    }

    /// Remove the token and child edges for a finished task.
    pub fn remove(&self, task_id: &str) {
        self.tokens.lock().remove(task_id);
        self.children.lock().remove(task_id);
    }

    /// Whether a task currently holds a live token.
    pub fn is_running(&self, task_id: &str) -> bool {
        self.tokens.lock().contains_key(task_id)
    }
}
