//! An in-process [`TaskStore`] with the API server semantics the reconciler
//! relies on: resource versions, finalizer-gated deletion, owner cascade and
//! change notifications.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::{Resource, ResourceExt};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::cluster::crd::{AgentTask, TaskKey};
use crate::reconcile::store::{EventType, StoreError, TaskStore};

const CHANGE_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
  pub task: TaskKey,
  pub type_: EventType,
  pub reason: String,
  pub message: String,
}

#[derive(Default)]
struct State {
  tasks: BTreeMap<TaskKey, AgentTask>,
  secrets: BTreeMap<TaskKey, Secret>,
  deployments: BTreeMap<TaskKey, Deployment>,
  services: BTreeMap<TaskKey, Service>,
  events: Vec<RecordedEvent>,
  version: u64,
  /// Number of upcoming task writes to reject with a conflict.
  conflicts: usize,
}

impl State {
  fn next_version(&mut self) -> String {
    self.version += 1;
    self.version.to_string()
  }

  fn check_write(&mut self, task: &AgentTask) -> Result<AgentTask, StoreError> {
    let key = task.key();
    let stored = self.tasks.get(&key).ok_or_else(|| StoreError::NotFound(key.to_string()))?;
    if self.conflicts > 0 {
      self.conflicts -= 1;
      return Err(StoreError::Conflict(key.to_string()));
    }
    if task.resource_version() != stored.resource_version() {
      return Err(StoreError::Conflict(key.to_string()));
    }
    Ok(stored.clone())
  }

  /// Drops a task and every child that names it as owner.
  fn purge(&mut self, key: &TaskKey) {
    let Some(task) = self.tasks.remove(key) else {
      return;
    };
    let Some(uid) = task.uid() else {
      return;
    };
    let owned = |meta: &ObjectMeta| meta.owner_references.iter().flatten().any(|o| o.uid == uid);
    self.secrets.retain(|_, s| !owned(&s.metadata));
    self.deployments.retain(|_, d| !owned(&d.metadata));
    self.services.retain(|_, s| !owned(&s.metadata));
  }

  /// The task a child object belongs to, if any.
  fn owner_of(&self, namespace: &str, meta: &ObjectMeta) -> Option<TaskKey> {
    let owner = meta.owner_references.as_ref()?.iter().find(|o| o.kind == "AgentTask")?;
    let key = TaskKey::new(namespace, owner.name.clone());
    self.tasks.get(&key).filter(|t| t.uid().as_deref() == Some(owner.uid.as_str())).map(|_| key)
  }
}

struct Inner {
  state: Mutex<State>,
  changes: broadcast::Sender<TaskKey>,
}

#[derive(Clone)]
pub struct MemoryStore {
  inner: Arc<Inner>,
}

impl Default for MemoryStore {
  fn default() -> Self {
    Self::new()
  }
}

impl MemoryStore {
  pub fn new() -> Self {
    let (changes, _) = broadcast::channel(CHANGE_BUFFER);
    Self {
      inner: Arc::new(Inner {
        state: Mutex::new(State::default()),
        changes,
      }),
    }
  }

  /// Keys of tasks that changed, either directly or through an owned child.
  pub fn subscribe(&self) -> broadcast::Receiver<TaskKey> {
    self.inner.changes.subscribe()
  }

  fn notify(&self, key: Option<TaskKey>) {
    if let Some(key) = key {
      // No receivers is fine.
      let _ = self.inner.changes.send(key);
    }
  }

  /// Creates a task the way the API server would: uid, generation and
  /// resource version are assigned here.
  pub fn create(&self, mut task: AgentTask) -> Result<AgentTask, StoreError> {
    let key = task.key();
    let created = {
      let mut state = self.inner.state.lock();
      if state.tasks.contains_key(&key) {
        return Err(StoreError::AlreadyExists(key.to_string()));
      }
      let version = state.next_version();
      task.metadata.uid = Some(format!("{:08x}-0000-4000-8000-{:012x}", state.version, state.version));
      task.metadata.resource_version = Some(version);
      task.metadata.generation = Some(1);
      task.metadata.creation_timestamp = Some(Time(Utc::now()));
      state.tasks.insert(key.clone(), task.clone());
      task
    };
    self.notify(Some(key));
    Ok(created)
  }

  /// Sets `spec.cancel` on the stored object, bypassing version checks.
  pub fn set_cancel(&self, key: &TaskKey, cancel: bool) -> Result<(), StoreError> {
    {
      let mut state = self.inner.state.lock();
      let version = state.next_version();
      let task = state.tasks.get_mut(key).ok_or_else(|| StoreError::NotFound(key.to_string()))?;
      if task.spec.cancel == cancel {
        return Ok(());
      }
      task.spec.cancel = cancel;
      task.metadata.generation = Some(task.metadata.generation.unwrap_or(0) + 1);
      task.metadata.resource_version = Some(version);
    }
    self.notify(Some(key.clone()));
    Ok(())
  }

  /// Makes the next `n` task writes fail with [`StoreError::Conflict`].
  pub fn inject_conflicts(&self, n: usize) {
    self.inner.state.lock().conflicts = n;
  }

  pub fn task(&self, key: &TaskKey) -> Option<AgentTask> {
    self.inner.state.lock().tasks.get(key).cloned()
  }

  pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
    self.inner.state.lock().secrets.get(&TaskKey::new(namespace, name)).cloned()
  }

  pub fn deployment(&self, namespace: &str, name: &str) -> Option<Deployment> {
    self.inner.state.lock().deployments.get(&TaskKey::new(namespace, name)).cloned()
  }

  pub fn service(&self, namespace: &str, name: &str) -> Option<Service> {
    self.inner.state.lock().services.get(&TaskKey::new(namespace, name)).cloned()
  }

  pub fn events(&self) -> Vec<RecordedEvent> {
    self.inner.state.lock().events.clone()
  }
}

fn apply_child<K>(state: &mut State, select: fn(&mut State) -> &mut BTreeMap<TaskKey, K>, obj: &K) -> Option<TaskKey>
where
  K: Resource + Clone,
{
  let namespace = obj.namespace().unwrap_or_default();
  let owner = state.owner_of(&namespace, obj.meta());
  select(state).insert(TaskKey::new(namespace, obj.name_any()), obj.clone());
  owner
}

fn delete_child<K>(
  state: &mut State,
  select: fn(&mut State) -> &mut BTreeMap<TaskKey, K>,
  namespace: &str,
  name: &str,
) -> Result<Option<TaskKey>, StoreError>
where
  K: Resource,
{
  let key = TaskKey::new(namespace, name);
  let removed = select(state).remove(&key).ok_or_else(|| StoreError::NotFound(key.to_string()))?;
  Ok(state.owner_of(namespace, removed.meta()))
}

#[async_trait]
impl TaskStore for MemoryStore {
  async fn get(&self, key: &TaskKey) -> Result<Option<AgentTask>, StoreError> {
    Ok(self.task(key))
  }

  async fn update(&self, task: &AgentTask) -> Result<AgentTask, StoreError> {
    let key = task.key();
    let updated = {
      let mut state = self.inner.state.lock();
      let stored = state.check_write(task)?;
      let mut next = task.clone();
      next.status = stored.status.clone();
      next.metadata.uid = stored.metadata.uid.clone();
      next.metadata.creation_timestamp = stored.metadata.creation_timestamp.clone();
      next.metadata.deletion_timestamp = stored.metadata.deletion_timestamp.clone();
      let generation = stored.metadata.generation.unwrap_or(1);
      next.metadata.generation = Some(if next.spec != stored.spec { generation + 1 } else { generation });
      next.metadata.resource_version = Some(state.next_version());

      if next.is_deleting() && next.finalizers().is_empty() {
        state.purge(&key);
      } else {
        state.tasks.insert(key.clone(), next.clone());
      }
      next
    };
    self.notify(Some(key));
    Ok(updated)
  }

  async fn update_status(&self, task: &AgentTask) -> Result<AgentTask, StoreError> {
    let key = task.key();
    let updated = {
      let mut state = self.inner.state.lock();
      let mut stored = state.check_write(task)?;
      stored.status = task.status.clone();
      stored.metadata.resource_version = Some(state.next_version());
      state.tasks.insert(key.clone(), stored.clone());
      stored
    };
    self.notify(Some(key));
    Ok(updated)
  }

  async fn delete(&self, key: &TaskKey) -> Result<(), StoreError> {
    {
      let mut state = self.inner.state.lock();
      let version = state.next_version();
      let task = state.tasks.get_mut(key).ok_or_else(|| StoreError::NotFound(key.to_string()))?;
      if task.finalizers().is_empty() {
        state.purge(key);
      } else if task.metadata.deletion_timestamp.is_none() {
        task.metadata.deletion_timestamp = Some(Time(Utc::now()));
        task.metadata.resource_version = Some(version);
      }
    }
    self.notify(Some(key.clone()));
    Ok(())
  }

  async fn apply_secret(&self, secret: &Secret) -> Result<(), StoreError> {
    let owner = apply_child(&mut self.inner.state.lock(), |s| &mut s.secrets, secret);
    self.notify(owner);
    Ok(())
  }

  async fn apply_deployment(&self, deployment: &Deployment) -> Result<(), StoreError> {
    let owner = apply_child(&mut self.inner.state.lock(), |s| &mut s.deployments, deployment);
    self.notify(owner);
    Ok(())
  }

  async fn apply_service(&self, service: &Service) -> Result<(), StoreError> {
    let owner = apply_child(&mut self.inner.state.lock(), |s| &mut s.services, service);
    self.notify(owner);
    Ok(())
  }

  async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
    let owner = delete_child(&mut self.inner.state.lock(), |s| &mut s.deployments, namespace, name)?;
    self.notify(owner);
    Ok(())
  }

  async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
    let owner = delete_child(&mut self.inner.state.lock(), |s| &mut s.services, namespace, name)?;
    self.notify(owner);
    Ok(())
  }

  async fn record_event(&self, task: &AgentTask, type_: EventType, reason: &str, message: &str) {
    self.inner.state.lock().events.push(RecordedEvent {
      task: task.key(),
      type_,
      reason: reason.to_string(),
      message: message.to_string(),
    });
  }
}
