use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
  Scheduled,
  Running,
  Completed,
  Cancelled,
}

impl TaskStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      TaskStatus::Scheduled => "scheduled",
      TaskStatus::Running => "running",
      TaskStatus::Completed => "completed",
      TaskStatus::Cancelled => "cancelled",
    }
  }

  pub fn is_terminal(&self) -> bool {
    matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
  }
}

impl fmt::Display for TaskStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for TaskStatus {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "scheduled" => Ok(TaskStatus::Scheduled),
      "running" => Ok(TaskStatus::Running),
      "completed" => Ok(TaskStatus::Completed),
      "cancelled" => Ok(TaskStatus::Cancelled),
      other => Err(format!("unknown task status '{}'", other)),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
  pub id: String,
  pub org: String,
  pub text: String,
  pub status: TaskStatus,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub agent_hint: Option<String>,
  pub created_at: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub agent_id: Option<String>,
}

/// Agent status as reported by heartbeats. Agents are free to report values
/// other than `idle`/`running`; absence is inferred from `last_seen`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
  pub name: String,
  pub org: String,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub labels: BTreeMap<String, String>,
  pub status: String,
  #[serde(rename = "lastSeen")]
  pub last_seen: DateTime<Utc>,
}

pub const AGENT_IDLE: &str = "idle";
pub const AGENT_RUNNING: &str = "running";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
  pub at: DateTime<Utc>,
  pub text: String,
}

impl LogLine {
  pub fn new(text: impl Into<String>) -> Self {
    Self { at: Utc::now(), text: text.into() }
  }
}

impl fmt::Display for LogLine {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.at.to_rfc3339_opts(SecondsFormat::Secs, true), self.text)
  }
}

// Request and response bodies for the registry HTTP surface.

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRequest {
  #[serde(default)]
  pub org: String,
  #[serde(default)]
  pub task: String,
  #[serde(default)]
  pub agent_hint: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClaimRequest {
  #[serde(default)]
  pub org: String,
  #[serde(default, rename = "agentID", alias = "agentId")]
  pub agent_id: String,
}

/// Body returned by a claim that found nothing: `{"task": null}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct NoTask {
  pub task: Option<Task>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateRequest {
  #[serde(default)]
  pub id: String,
  #[serde(default)]
  pub status: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskRef {
  #[serde(default)]
  pub id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskLogRequest {
  #[serde(default)]
  pub id: String,
  #[serde(default)]
  pub line: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskLogs {
  pub id: String,
  pub lines: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskStatusResponse {
  pub task: Task,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterRequest {
  #[serde(default)]
  pub name: String,
  #[serde(default)]
  pub org: String,
  #[serde(default)]
  pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct HeartbeatRequest {
  #[serde(default)]
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub org: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub status: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AgentLogRequest {
  #[serde(default)]
  pub name: String,
  #[serde(default)]
  pub line: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AgentLogs {
  pub name: String,
  pub lines: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Health {
  pub status: String,
  pub host: String,
}
