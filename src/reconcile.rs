//! Computes the minimal fetch set for a channel refresh.
//!
//! Always an identifier-set difference, never a count comparison: a remote
//! listing can lose one video and gain another without changing size, and
//! the new one still has to be fetched. Videos that disappeared from the
//! remote listing are reported but never deleted locally.

use std::collections::HashSet;

use crate::fetch::FetchTask;

/// What an update run has to do, derived from the remote listing and the
/// locally indexed identifiers.
#[derive(Debug, Default)]
pub struct FetchPlan {
    /// Videos present remotely but not yet indexed, in remote listing order.
    pub tasks: Vec<FetchTask>,
    /// Videos indexed locally that the remote listing no longer carries.
    /// Kept in place; pruning is a deliberate non-goal.
    pub missing_remotely: Vec<String>,
}

impl FetchPlan {
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Builds the plan. First-time ingestion passes an empty `local` set, which
/// turns the plan into the full remote list.
pub fn plan_fetches(remote: &[String], local: &HashSet<String>, language: &str) -> FetchPlan {
    let remote_set: HashSet<&str> = remote.iter().map(String::as_str).collect();

    let tasks = remote
        .iter()
        .filter(|id| !local.contains(id.as_str()))
        .map(|id| FetchTask::new(id, language))
        .collect();

    let mut missing_remotely: Vec<String> = local
        .iter()
        .filter(|id| !remote_set.contains(id.as_str()))
        .cloned()
        .collect();
    missing_remotely.sort();

    FetchPlan {
        tasks,
        missing_remotely,
    }
}
