//! Per-policy wall-time accounting.

use std::{
    collections::BTreeMap,
    sync::Mutex,
    time::Duration,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PolicyAction {
    Handle,
    Resolve,
}

impl PolicyAction {
    pub fn label(&self) -> &'static str {
        match self {
            PolicyAction::Handle => "handle",
            PolicyAction::Resolve => "resolve",
        }
    }
}

/// Accumulated elapsed time per (policy, action).
#[derive(Debug, Default)]
pub struct PolicyTimings {
    totals: Mutex<BTreeMap<(String, PolicyAction), Duration>>,
}

impl PolicyTimings {
    pub fn record(&self, policy: &str, action: PolicyAction, elapsed: Duration) {
        let mut totals = self.totals.lock().expect("timing mutex is never poisoned");
        *totals
            .entry((policy.to_owned(), action))
            .or_insert(Duration::ZERO) += elapsed;
    }

    pub fn snapshot(&self) -> Vec<(String, PolicyAction, Duration)> {
        self.totals
            .lock()
            .expect("timing mutex is never poisoned")
            .iter()
            .map(|((policy, action), elapsed)| (policy.clone(), *action, *elapsed))
            .collect()
    }
}
