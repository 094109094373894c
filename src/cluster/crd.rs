//! The `AgentTask` custom resource and its declarative surface.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::api::{Api, PostParams};
use kube::{Client, CustomResource, ResourceExt};
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio_retry::RetryIf;
use tokio_retry::strategy::FixedInterval;
use tracing::{info, warn};

use crate::error::{ClusterError, api_reason};

pub const FINALIZER: &str = "agenttasks.hexa.dev/finalizer";
pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_CANCELLED: &str = "Cancelled";

const CANCEL_RETRY_DELAY: Duration = Duration::from_millis(150);
const CANCEL_RETRIES: usize = 3;
const MAX_NAME_LEN: usize = 63;

#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
  group = "agents.hexa.dev",
  version = "v1alpha1",
  kind = "AgentTask",
  plural = "agenttasks",
  shortname = "at",
  namespaced,
  status = "AgentTaskStatus",
  printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
  printcolumn = r#"{"name":"Agent","type":"string","jsonPath":".status.agentName"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AgentTaskSpec {
  pub org_id: String,
  pub task: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub image: Option<String>,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub env: BTreeMap<String, String>,
  #[serde(default)]
  pub cancel: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub ttl_seconds_after_finished: Option<i32>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum TaskPhase {
  #[default]
  Pending,
  Running,
  Cancelled,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
  #[serde(rename = "type")]
  pub type_: String,
  pub status: String,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub reason: String,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub message: String,
  pub last_transition_time: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentTaskStatus {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub phase: Option<TaskPhase>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub conditions: Vec<Condition>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub agent_name: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub observed_generation: Option<i64>,
}

impl AgentTaskStatus {
  /// Upserts a condition by type. The transition time moves only when the
  /// condition is new or its status flips. Returns whether anything changed.
  pub fn set_condition(&mut self, type_: &str, status: &str, reason: &str, message: &str, now: DateTime<Utc>) -> bool {
    match self.conditions.iter_mut().find(|c| c.type_ == type_) {
      Some(existing) => {
        let changed = existing.status != status || existing.reason != reason || existing.message != message;
        if existing.status != status {
          existing.last_transition_time = now;
        }
        existing.status = status.to_string();
        existing.reason = reason.to_string();
        existing.message = message.to_string();
        changed
      }
      None => {
        self.conditions.push(Condition {
          type_: type_.to_string(),
          status: status.to_string(),
          reason: reason.to_string(),
          message: message.to_string(),
          last_transition_time: now,
        });
        true
      }
    }
  }

  pub fn condition(&self, type_: &str) -> Option<&Condition> {
    self.conditions.iter().find(|c| c.type_ == type_)
  }

  /// Moves the transition time of an existing condition to `now`.
  pub fn refresh_condition(&mut self, type_: &str, now: DateTime<Utc>) -> bool {
    match self.conditions.iter_mut().find(|c| c.type_ == type_) {
      Some(existing) if existing.last_transition_time != now => {
        existing.last_transition_time = now;
        true
      }
      _ => false,
    }
  }
}

/// Namespace/name of an `AgentTask`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskKey {
  pub namespace: String,
  pub name: String,
}

impl TaskKey {
  pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
    Self { namespace: namespace.into(), name: name.into() }
  }
}

impl fmt::Display for TaskKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.namespace, self.name)
  }
}

impl AgentTask {
  pub fn key(&self) -> TaskKey {
    TaskKey::new(self.namespace().unwrap_or_default(), self.name_any())
  }

  pub fn phase(&self) -> TaskPhase {
    self.status.as_ref().and_then(|s| s.phase).unwrap_or_default()
  }

  pub fn condition(&self, type_: &str) -> Option<&Condition> {
    self.status.as_ref().and_then(|s| s.condition(type_))
  }

  pub fn agent_name(&self) -> Option<&str> {
    self.status.as_ref().and_then(|s| s.agent_name.as_deref()).filter(|n| !n.is_empty())
  }

  pub fn status_mut(&mut self) -> &mut AgentTaskStatus {
    self.status.get_or_insert_with(AgentTaskStatus::default)
  }

  pub fn is_deleting(&self) -> bool {
    self.metadata.deletion_timestamp.is_some()
  }

  pub fn has_finalizer(&self) -> bool {
    self.finalizers().iter().any(|f| f == FINALIZER)
  }

  pub fn add_finalizer(&mut self) -> bool {
    if self.has_finalizer() {
      return false;
    }
    self.finalizers_mut().push(FINALIZER.to_string());
    true
  }

  pub fn remove_finalizer(&mut self) -> bool {
    let before = self.finalizers().len();
    self.finalizers_mut().retain(|f| f != FINALIZER);
    self.finalizers().len() != before
  }

  pub fn image_or<'a>(&'a self, default: &'a str) -> &'a str {
    self.spec.image.as_deref().filter(|i| !i.is_empty()).unwrap_or(default)
  }

  pub fn ttl_after_finished(&self) -> Option<chrono::Duration> {
    self
      .spec
      .ttl_seconds_after_finished
      .filter(|ttl| *ttl > 0)
      .map(|ttl| chrono::Duration::seconds(i64::from(ttl)))
  }
}

static INVALID_NAME_CHARS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-z0-9-]+").unwrap());

/// Lowercases and strips `value` down to something usable inside a
/// DNS-1123 label.
pub fn dns_label(value: &str) -> String {
  let lowered = value.to_lowercase();
  let cleaned = INVALID_NAME_CHARS.replace_all(&lowered, "-");
  cleaned.trim_matches('-').to_string()
}

/// Builds `<prefix>-<org>-<suffix>`, trimming the org part so the result
/// (plus a `-env` child suffix) stays a valid label.
pub fn child_name(prefix: &str, org: &str, suffix: &str) -> String {
  let org = dns_label(org);
  let suffix = dns_label(suffix);
  let budget = MAX_NAME_LEN.saturating_sub("-env".len() + prefix.len() + suffix.len() + 2);
  let org: String = org.chars().take(budget).collect();
  let org = org.trim_end_matches('-');
  if org.is_empty() {
    format!("{}-{}", prefix, suffix)
  } else {
    format!("{}-{}-{}", prefix, org, suffix)
  }
}

/// Creates an `AgentTask`, returning the existing object if one with the same
/// name is already present.
pub async fn create_agent_task(client: &Client, namespace: &str, name: &str, spec: AgentTaskSpec) -> Result<AgentTask, ClusterError> {
  let api: Api<AgentTask> = Api::namespaced(client.clone(), namespace);
  let task = AgentTask::new(name, spec);
  match api.create(&PostParams::default(), &task).await {
    Ok(created) => {
      info!(namespace, name, "agent task created");
      Ok(created)
    }
    Err(e) if api_reason(&e) == Some("AlreadyExists") => {
      info!(namespace, name, "agent task already exists");
      Ok(api.get(name).await?)
    }
    Err(e) => Err(e.into()),
  }
}

pub async fn get_agent_task(client: &Client, namespace: &str, name: &str) -> Result<Option<AgentTask>, ClusterError> {
  let api: Api<AgentTask> = Api::namespaced(client.clone(), namespace);
  Ok(api.get_opt(name).await?)
}

/// Sets `spec.cancel`, re-reading and retrying on write conflicts.
pub async fn set_agent_task_cancel(client: &Client, namespace: &str, name: &str, cancel: bool) -> Result<AgentTask, ClusterError> {
  let api: Api<AgentTask> = Api::namespaced(client.clone(), namespace);
  let strategy = FixedInterval::new(CANCEL_RETRY_DELAY).take(CANCEL_RETRIES);
  RetryIf::spawn(
    strategy,
    || {
      let api = api.clone();
      async move {
        let mut task = api.get(name).await?;
        task.spec.cancel = cancel;
        api.replace(name, &PostParams::default(), &task).await.map_err(ClusterError::from)
      }
    },
    |e: &ClusterError| {
      let retry = e.is_conflict();
      if retry {
        warn!(namespace, name, "conflict updating agent task, retrying");
      }
      retry
    },
  )
  .await
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration as ChronoDuration;

  #[test]
  fn set_condition_replaces_in_place() {
    let mut status = AgentTaskStatus::default();
    let t0 = Utc::now();
    assert!(status.set_condition(CONDITION_READY, "True", "ResourcesCreated", "created", t0));
    assert!(status.set_condition(CONDITION_CANCELLED, "True", "UserRequested", "cancelled", t0));
    let t1 = t0 + ChronoDuration::seconds(30);
    assert!(status.set_condition(CONDITION_READY, "False", "Cancelled", "removed", t1));

    assert_eq!(status.conditions.len(), 2);
    assert_eq!(status.conditions[0].type_, CONDITION_READY);
    assert_eq!(status.conditions[0].status, "False");
    assert_eq!(status.conditions[0].last_transition_time, t1);
  }

  #[test]
  fn unchanged_condition_keeps_its_transition_time() {
    let mut status = AgentTaskStatus::default();
    let t0 = Utc::now();
    status.set_condition(CONDITION_READY, "True", "ResourcesCreated", "created", t0);
    let later = t0 + ChronoDuration::seconds(10);
    assert!(!status.set_condition(CONDITION_READY, "True", "ResourcesCreated", "created", later));
    assert_eq!(status.condition(CONDITION_READY).unwrap().last_transition_time, t0);
  }

  #[test]
  fn refresh_moves_only_existing_conditions() {
    let mut status = AgentTaskStatus::default();
    let t0 = Utc::now();
    assert!(!status.refresh_condition(CONDITION_CANCELLED, t0));
    status.set_condition(CONDITION_CANCELLED, "True", "UserRequested", "Task cancelled", t0);
    let later = t0 + ChronoDuration::seconds(30);
    assert!(status.refresh_condition(CONDITION_CANCELLED, later));
    assert!(!status.refresh_condition(CONDITION_CANCELLED, later));
    let cancelled = status.condition(CONDITION_CANCELLED).unwrap();
    assert_eq!(cancelled.status, "True");
    assert_eq!(cancelled.last_transition_time, later);
  }

  #[test]
  fn finalizer_helpers_are_idempotent() {
    let mut task = AgentTask::new("t1", AgentTaskSpec::default());
    assert!(task.add_finalizer());
    assert!(!task.add_finalizer());
    assert!(task.has_finalizer());
    assert!(task.remove_finalizer());
    assert!(!task.remove_finalizer());
  }

  #[test]
  fn image_falls_back_to_default() {
    let mut task = AgentTask::new("t1", AgentTaskSpec::default());
    assert_eq!(task.image_or("mvp-agent:latest"), "mvp-agent:latest");
    task.spec.image = Some(String::new());
    assert_eq!(task.image_or("mvp-agent:latest"), "mvp-agent:latest");
    task.spec.image = Some("custom:1".into());
    assert_eq!(task.image_or("mvp-agent:latest"), "custom:1");
  }

  #[test]
  fn zero_ttl_means_no_expiry() {
    let mut task = AgentTask::new("t1", AgentTaskSpec::default());
    task.spec.ttl_seconds_after_finished = Some(0);
    assert!(task.ttl_after_finished().is_none());
    task.spec.ttl_seconds_after_finished = Some(5);
    assert_eq!(task.ttl_after_finished(), Some(ChronoDuration::seconds(5)));
  }

  #[test]
  fn child_names_are_valid_labels() {
    assert_eq!(child_name("agent", "Acme Corp", "1a2b3c4d"), "agent-acme-corp-1a2b3c4d");
    assert_eq!(child_name("agent", "___", "1a2b"), "agent-1a2b");
    let long = child_name("agent", &"x".repeat(200), "1a2b3c4d");
    assert!(long.len() + "-env".len() <= MAX_NAME_LEN);
    assert!(long.ends_with("-1a2b3c4d"));
  }

  #[test]
  fn spec_uses_wire_field_names() {
    let spec: AgentTaskSpec = serde_json::from_value(serde_json::json!({
      "orgId": "acme",
      "task": "build x",
      "ttlSecondsAfterFinished": 5,
      "cancel": true
    }))
    .unwrap();
    assert_eq!(spec.org_id, "acme");
    assert_eq!(spec.ttl_seconds_after_finished, Some(5));
    assert!(spec.cancel);
    assert!(spec.env.is_empty());
  }
}
