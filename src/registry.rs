//! In-process task and agent registry.
//!
//! State lives for the lifetime of the process. Each logical map has its own
//! reader/writer lock; no lock is held across I/O.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::RwLock;
use tracing::info;

use crate::error::RegistryError;
use crate::ledger::{LogLedger, Subscription};
use crate::models::{AGENT_IDLE, Agent, LogLine, Task, TaskStatus};
use crate::scheduler::select_task;

#[derive(Default)]
pub struct Registry {
  tasks: RwLock<HashMap<String, Task>>,
  agents: RwLock<HashMap<String, Agent>>,
  task_logs: LogLedger,
  agent_logs: LogLedger,
  seq: AtomicU64,
}

impl Registry {
  pub fn new() -> Self {
    Self::default()
  }

  fn next_task_id(&self) -> String {
    let seq = self.seq.fetch_add(1, Ordering::Relaxed);
    format!("{}-{:04}", Utc::now().format("%Y%m%d-%H%M%S%.3f"), seq)
  }

  pub fn register(&self, name: &str, org: &str, labels: BTreeMap<String, String>) -> Result<Agent, RegistryError> {
    if name.is_empty() || org.is_empty() {
      return Err(RegistryError::InvalidRequest("missing name/org".into()));
    }
    let agent = Agent {
      name: name.to_string(),
      org: org.to_string(),
      labels,
      status: AGENT_IDLE.to_string(),
      last_seen: Utc::now(),
    };
    self.agents.write().insert(agent.name.clone(), agent.clone());
    info!(agent = name, org, "agent registered");
    Ok(agent)
  }

  /// Refreshes `last_seen`, creating a sparse record for unknown names.
  pub fn heartbeat(&self, name: &str, org: Option<&str>, status: Option<&str>) -> Result<Agent, RegistryError> {
    if name.is_empty() {
      return Err(RegistryError::InvalidRequest("missing name".into()));
    }
    let mut agents = self.agents.write();
    let agent = agents.entry(name.to_string()).or_insert_with(|| Agent {
      name: name.to_string(),
      org: String::new(),
      labels: BTreeMap::new(),
      status: String::new(),
      last_seen: Utc::now(),
    });
    if let Some(org) = org.filter(|o| !o.is_empty()) {
      agent.org = org.to_string();
    }
    if let Some(status) = status.filter(|s| !s.is_empty()) {
      agent.status = status.to_string();
    }
    agent.last_seen = Utc::now();
    Ok(agent.clone())
  }

  pub fn schedule_task(&self, org: &str, text: &str, hint: Option<&str>) -> Result<Task, RegistryError> {
    if org.is_empty() || text.is_empty() {
      return Err(RegistryError::InvalidRequest("missing org/task".into()));
    }
    let task = Task {
      id: self.next_task_id(),
      org: org.to_string(),
      text: text.to_string(),
      status: TaskStatus::Scheduled,
      agent_hint: hint.filter(|h| !h.is_empty()).map(str::to_string),
      created_at: Utc::now(),
      agent_id: None,
    };
    self.tasks.write().insert(task.id.clone(), task.clone());
    info!(task_id = %task.id, org, text, "scheduled task");
    Ok(task)
  }

  /// Hands at most one scheduled task of `org` to `agent_id`. `Ok(None)` means
  /// there is nothing to do right now.
  pub fn claim(&self, org: &str, agent_id: &str) -> Result<Option<Task>, RegistryError> {
    if org.is_empty() || agent_id.is_empty() {
      return Err(RegistryError::InvalidRequest("missing org/agentId".into()));
    }
    let mut tasks = self.tasks.write();
    let Some(id) = select_task(&tasks, org, agent_id).map(str::to_string) else {
      return Ok(None);
    };
    let Some(task) = tasks.get_mut(&id) else {
      return Ok(None);
    };
    task.status = TaskStatus::Running;
    task.agent_id = Some(agent_id.to_string());
    let claimed = task.clone();
    drop(tasks);
    info!(task_id = %claimed.id, org, agent = agent_id, "task claimed");
    Ok(Some(claimed))
  }

  /// Overwrites the status. Callers are trusted to move tasks forward.
  pub fn update_status(&self, id: &str, status: TaskStatus) -> Result<Task, RegistryError> {
    if id.is_empty() {
      return Err(RegistryError::InvalidRequest("missing id".into()));
    }
    let mut tasks = self.tasks.write();
    let task = tasks.get_mut(id).ok_or_else(|| RegistryError::NotFound(format!("task {}", id)))?;
    task.status = status;
    let updated = task.clone();
    drop(tasks);
    info!(task_id = id, status = %status, "task status updated");
    Ok(updated)
  }

  /// Moves a task to `cancelled`. Completed tasks are immutable; cancelling
  /// twice returns the existing record.
  pub fn cancel_task(&self, id: &str) -> Result<Task, RegistryError> {
    if id.is_empty() {
      return Err(RegistryError::InvalidRequest("missing id".into()));
    }
    let mut tasks = self.tasks.write();
    let task = tasks.get_mut(id).ok_or_else(|| RegistryError::NotFound(format!("task {}", id)))?;
    match task.status {
      TaskStatus::Completed => {
        return Err(RegistryError::InvalidRequest(format!("task {} already completed", id)));
      }
      TaskStatus::Cancelled => return Ok(task.clone()),
      _ => task.status = TaskStatus::Cancelled,
    }
    let cancelled = task.clone();
    drop(tasks);
    info!(task_id = id, "task cancelled");
    Ok(cancelled)
  }

  pub fn get_task(&self, id: &str) -> Result<Task, RegistryError> {
    self
      .tasks
      .read()
      .get(id)
      .cloned()
      .ok_or_else(|| RegistryError::NotFound(format!("task {}", id)))
  }

  pub fn list_tasks(&self) -> Vec<Task> {
    let mut out: Vec<Task> = self.tasks.read().values().cloned().collect();
    out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    out
  }

  pub fn list_agents(&self) -> Vec<Agent> {
    let mut out: Vec<Agent> = self.agents.read().values().cloned().collect();
    out.sort_by(|a, b| a.name.cmp(&b.name));
    out
  }

  pub fn append_task_log(&self, id: &str, line: &str) -> Option<LogLine> {
    if line.is_empty() {
      return None;
    }
    info!("task[{}]: {}", id, line);
    Some(self.task_logs.append(id, line))
  }

  pub fn append_agent_log(&self, name: &str, line: &str) -> Option<LogLine> {
    if line.is_empty() {
      return None;
    }
    info!("agent[{}]: {}", name, line);
    Some(self.agent_logs.append(name, line))
  }

  pub fn task_logs(&self, id: &str) -> Vec<LogLine> {
    self.task_logs.lines(id)
  }

  pub fn agent_logs(&self, name: &str) -> Vec<LogLine> {
    self.agent_logs.lines(name)
  }

  pub fn subscribe_task(&self, id: &str) -> Subscription {
    self.task_logs.subscribe(id)
  }

  pub fn subscribe_agent(&self, name: &str) -> Subscription {
    self.agent_logs.subscribe(name)
  }
}
