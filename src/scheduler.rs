use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::models::{Task, TaskStatus};

/// A scheduled task eligible for a claim, ranked so that the greatest
/// candidate is the one to hand out: tasks hinted at the claiming agent
/// first, then oldest first, then lowest id.
#[derive(Debug)]
struct ClaimCandidate<'a> {
  hinted: bool,
  created_at: DateTime<Utc>,
  id: &'a str,
}

impl Eq for ClaimCandidate<'_> {}

impl PartialEq for ClaimCandidate<'_> {
  fn eq(&self, other: &Self) -> bool {
    self.cmp(other) == Ordering::Equal
  }
}

impl PartialOrd for ClaimCandidate<'_> {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl Ord for ClaimCandidate<'_> {
  fn cmp(&self, other: &Self) -> Ordering {
    self
      .hinted
      .cmp(&other.hinted)
      .then_with(|| other.created_at.cmp(&self.created_at))
      .then_with(|| other.id.cmp(self.id))
  }
}

/// Picks the task `agent_id` should receive from `org`, if any. The caller
/// must hold the task map exclusively across this call and the mutation of
/// the returned task.
pub fn select_task<'a>(tasks: &'a HashMap<String, Task>, org: &str, agent_id: &str) -> Option<&'a str> {
  tasks
    .values()
    .filter(|t| t.org == org && t.status == TaskStatus::Scheduled)
    .map(|t| ClaimCandidate {
      hinted: t.agent_hint.as_deref() == Some(agent_id),
      created_at: t.created_at,
      id: t.id.as_str(),
    })
    .max()
    .map(|c| c.id)
}
