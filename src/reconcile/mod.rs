//! Level-triggered reconciliation of `AgentTask` resources.
//!
//! One pass reads the latest object and either finishes or asks to be run
//! again after some duration:
//!
//! 1. gone: nothing to do
//! 2. cancelled with a TTL: delete once `Cancelled.lastTransitionTime + ttl`
//!    has passed, otherwise requeue for exactly the remainder
//! 3. no finalizer yet: add it
//! 4. being deleted: drop the finalizer
//! 5. `spec.cancel`: tear down the deployment and service, record `Cancelled`
//! 6. otherwise: apply secret, deployment and service, record `Running`
//!
//! Task writes that hit a version conflict are re-read and retried.

pub mod kube_store;
pub mod memory;
pub mod runner;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::{Resource, ResourceExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::cluster::crd::{AgentTask, CONDITION_CANCELLED, CONDITION_READY, TaskKey, TaskPhase, child_name};
use crate::cluster::resources::AgentResources;
use crate::config::{DEFAULT_AGENT_IMAGE, DEFAULT_AGENT_PORT};

pub use kube_store::KubeStore;
pub use memory::MemoryStore;
pub use runner::Runner;
pub use store::{EventType, StoreError, TaskStore};

#[derive(Debug, Error)]
pub enum ReconcileError {
  #[error(transparent)]
  Store(#[from] StoreError),

  #[error("agent task {0} has no uid")]
  MissingUid(TaskKey),
}

/// What to do after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
  /// Wait for the next change.
  Done,
  RequeueAfter(Duration),
}

impl From<Action> for kube::runtime::controller::Action {
  fn from(action: Action) -> Self {
    match action {
      Action::Done => kube::runtime::controller::Action::await_change(),
      Action::RequeueAfter(after) => kube::runtime::controller::Action::requeue(after),
    }
  }
}

#[async_trait]
pub trait Reconcile: Send + Sync + 'static {
  async fn reconcile(&self, key: &TaskKey) -> Result<Action, ReconcileError>;
}

pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// A clock that only moves when told to.
#[derive(Clone)]
pub struct ManualClock(Arc<Mutex<DateTime<Utc>>>);

impl ManualClock {
  pub fn new(start: DateTime<Utc>) -> Self {
    Self(Arc::new(Mutex::new(start)))
  }

  pub fn advance(&self, by: chrono::Duration) {
    *self.0.lock() += by;
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *self.0.lock()
  }
}

#[derive(Debug, Clone)]
pub struct Settings {
  pub default_image: String,
  pub agent_port: i32,
  /// Delay before re-checking a cancelled task for TTL expiry.
  pub cancel_requeue: Duration,
  /// Steady-state drift check interval.
  pub running_requeue: Duration,
  pub conflict_attempts: usize,
  pub conflict_delay: Duration,
}

impl Default for Settings {
  fn default() -> Self {
    Self {
      default_image: DEFAULT_AGENT_IMAGE.to_string(),
      agent_port: DEFAULT_AGENT_PORT,
      cancel_requeue: Duration::from_secs(5),
      running_requeue: Duration::from_secs(10),
      conflict_attempts: 4,
      conflict_delay: Duration::from_millis(150),
    }
  }
}

#[derive(Clone, Copy)]
enum Write {
  Object,
  Status,
}

enum Outcome {
  Unchanged,
  Written(Box<AgentTask>),
  Gone,
}

pub struct Reconciler<S> {
  store: S,
  settings: Settings,
  clock: Arc<dyn Clock>,
}

impl<S: TaskStore> Reconciler<S> {
  pub fn new(store: S, settings: Settings) -> Self {
    Self::with_clock(store, settings, Arc::new(SystemClock))
  }

  pub fn with_clock(store: S, settings: Settings, clock: Arc<dyn Clock>) -> Self {
    Self { store, settings, clock }
  }

  pub fn store(&self) -> &S {
    &self.store
  }

  /// Applies `mutate` to the latest copy of the task and writes it back,
  /// re-reading after each conflict. `mutate` returns false when there is
  /// nothing to write.
  async fn modify<F>(&self, mut task: AgentTask, write: Write, mutate: F) -> Result<Outcome, ReconcileError>
  where
    F: Fn(&mut AgentTask) -> bool + Send + Sync,
  {
    let key = task.key();
    let mut attempt = 1;
    loop {
      if !mutate(&mut task) {
        return Ok(Outcome::Unchanged);
      }
      let written = match write {
        Write::Object => self.store.update(&task).await,
        Write::Status => self.store.update_status(&task).await,
      };
      match written {
        Ok(stored) => return Ok(Outcome::Written(Box::new(stored))),
        Err(e) if e.is_conflict() && attempt < self.settings.conflict_attempts => {
          debug!(task = %key, attempt, "write conflict, re-reading");
          attempt += 1;
          sleep(self.settings.conflict_delay).await;
          match self.store.get(&key).await? {
            Some(latest) => task = latest,
            None => return Ok(Outcome::Gone),
          }
        }
        Err(e) if e.is_not_found() => return Ok(Outcome::Gone),
        Err(e) => return Err(e.into()),
      }
    }
  }

  async fn expire(&self, task: &AgentTask) -> Result<Option<Action>, ReconcileError> {
    if task.is_deleting() || task.phase() != TaskPhase::Cancelled {
      return Ok(None);
    }
    let (Some(ttl), Some(cancelled)) = (task.ttl_after_finished(), task.condition(CONDITION_CANCELLED)) else {
      return Ok(None);
    };
    let expires_at = cancelled.last_transition_time + ttl;
    let now = self.clock.now();
    if now < expires_at {
      let remaining = (expires_at - now).to_std().unwrap_or_default();
      return Ok(Some(Action::RequeueAfter(remaining)));
    }

    let key = task.key();
    match self.store.delete(&key).await {
      Ok(()) => info!(task = %key, "ttl elapsed, agent task deleted"),
      Err(e) if e.is_not_found() => {}
      Err(e) => return Err(e.into()),
    }
    Ok(Some(Action::Done))
  }

  async fn cancel(&self, task: AgentTask) -> Result<Action, ReconcileError> {
    let key = task.key();
    if let Some(name) = task.agent_name().map(str::to_string) {
      let deployment = self.store.delete_deployment(&key.namespace, &name).await;
      let service = self.store.delete_service(&key.namespace, &name).await;
      for (kind, result) in [("deployment", deployment), ("service", service)] {
        match result {
          Ok(()) => info!(task = %key, kind, name = %name, "removed"),
          Err(e) if e.is_not_found() => {}
          Err(e) => warn!(task = %key, kind, name = %name, error = %e, "failed to remove"),
        }
      }
    }

    let now = self.clock.now();
    let outcome = self
      .modify(task, Write::Status, |t| {
        let prior = t.status.clone();
        let entering = t.phase() != TaskPhase::Cancelled;
        let status = t.status_mut();
        status.phase = Some(TaskPhase::Cancelled);
        status.set_condition(CONDITION_CANCELLED, "True", "UserRequested", "Task cancelled", now);
        // The TTL clock starts at every entry into Cancelled.
        if entering {
          status.refresh_condition(CONDITION_CANCELLED, now);
        }
        if status.condition(CONDITION_READY).is_some() {
          status.set_condition(CONDITION_READY, "False", "Cancelled", "Agent resources removed", now);
        }
        t.status != prior
      })
      .await?;

    if let Outcome::Written(updated) = outcome {
      info!(task = %key, "agent task cancelled");
      self
        .store
        .record_event(&updated, EventType::Normal, "Cancelled", "AgentTask cancelled; resources removed")
        .await;
    }
    Ok(Action::RequeueAfter(self.settings.cancel_requeue))
  }

  async fn converge(&self, task: AgentTask) -> Result<Action, ReconcileError> {
    let key = task.key();
    let name = match task.agent_name() {
      Some(name) => name.to_string(),
      None => {
        let uid = task.uid().ok_or_else(|| ReconcileError::MissingUid(key.clone()))?;
        let suffix: String = uid.chars().filter(|c| *c != '-').take(8).collect();
        child_name("agent", &task.spec.org_id, &suffix)
      }
    };

    let children = AgentResources {
      name: name.clone(),
      namespace: key.namespace.clone(),
      image: task.image_or(&self.settings.default_image).to_string(),
      port: self.settings.agent_port,
      env: task.spec.env.clone(),
      probes: false,
      owner: Some(task.controller_owner_ref(&()).ok_or_else(|| ReconcileError::MissingUid(key.clone()))?),
    };
    self.store.apply_secret(&children.secret()).await?;
    self.store.apply_deployment(&children.deployment()).await?;
    self.store.apply_service(&children.service()).await?;

    let now = self.clock.now();
    let outcome = self
      .modify(task, Write::Status, |t| {
        let prior = t.status.clone();
        let generation = t.metadata.generation;
        let status = t.status_mut();
        status.agent_name = Some(name.clone());
        status.phase = Some(TaskPhase::Running);
        status.observed_generation = generation;
        status.set_condition(CONDITION_READY, "True", "ResourcesCreated", "Agent resources created", now);
        if status.condition(CONDITION_CANCELLED).is_some() {
          status.set_condition(CONDITION_CANCELLED, "False", "Resumed", "Cancel flag cleared", now);
        }
        t.status != prior
      })
      .await?;

    if let Outcome::Written(updated) = outcome {
      info!(task = %key, agent = %name, "agent task running");
      self
        .store
        .record_event(&updated, EventType::Normal, "Running", &format!("Agent {} running", name))
        .await;
    }
    Ok(Action::RequeueAfter(self.settings.running_requeue))
  }
}

#[async_trait]
impl<S: TaskStore + 'static> Reconcile for Reconciler<S> {
  async fn reconcile(&self, key: &TaskKey) -> Result<Action, ReconcileError> {
    let Some(task) = self.store.get(key).await? else {
      debug!(task = %key, "agent task gone");
      return Ok(Action::Done);
    };

    if let Some(action) = self.expire(&task).await? {
      return Ok(action);
    }

    if !task.is_deleting() && !task.has_finalizer() {
      self.modify(task, Write::Object, AgentTask::add_finalizer).await?;
      debug!(task = %key, "finalizer added");
      return Ok(Action::RequeueAfter(Duration::ZERO));
    }

    if task.is_deleting() {
      self.modify(task, Write::Object, AgentTask::remove_finalizer).await?;
      info!(task = %key, "finalizer removed, deletion proceeds");
      return Ok(Action::Done);
    }

    if task.spec.cancel {
      return self.cancel(task).await;
    }
    self.converge(task).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cluster::crd::AgentTaskSpec;
  use std::collections::BTreeMap;

  fn setup() -> (MemoryStore, Reconciler<MemoryStore>, ManualClock) {
    let store = MemoryStore::new();
    let clock = ManualClock::new(Utc::now());
    let settings = Settings {
      conflict_delay: Duration::from_millis(1),
      ..Settings::default()
    };
    let reconciler = Reconciler::with_clock(store.clone(), settings, Arc::new(clock.clone()));
    (store, reconciler, clock)
  }

  fn create(store: &MemoryStore, spec: AgentTaskSpec) -> TaskKey {
    let mut task = AgentTask::new("t1", spec);
    task.metadata.namespace = Some("default".into());
    store.create(task).unwrap().key()
  }

  fn spec() -> AgentTaskSpec {
    AgentTaskSpec {
      org_id: "acme".into(),
      task: "build x".into(),
      env: BTreeMap::from([("API_KEY".to_string(), "s3cret".to_string())]),
      ..Default::default()
    }
  }

  /// Runs passes until one asks for a non-zero delay or finishes.
  async fn settle(reconciler: &Reconciler<MemoryStore>, key: &TaskKey) -> Action {
    for _ in 0..10 {
      match reconciler.reconcile(key).await.unwrap() {
        Action::RequeueAfter(d) if d.is_zero() => continue,
        other => return other,
      }
    }
    panic!("reconciliation did not settle");
  }

  #[tokio::test]
  async fn converges_to_running() {
    let (store, reconciler, _) = setup();
    let key = create(&store, spec());

    assert_eq!(settle(&reconciler, &key).await, Action::RequeueAfter(Duration::from_secs(10)));

    let task = store.task(&key).unwrap();
    assert!(task.has_finalizer());
    assert_eq!(task.phase(), TaskPhase::Running);
    let name = task.agent_name().unwrap().to_string();
    assert!(name.starts_with("agent-acme-"));
    assert_eq!(task.condition(CONDITION_READY).unwrap().status, "True");
    assert_eq!(task.status.as_ref().unwrap().observed_generation, Some(1));

    let deployment = store.deployment("default", &name).unwrap();
    let container = &deployment.spec.unwrap().template.spec.unwrap().containers[0];
    assert_eq!(container.image.as_deref(), Some(DEFAULT_AGENT_IMAGE));
    assert!(store.service("default", &name).is_some());
    assert!(store.secret("default", &format!("{}-env", name)).is_some());
    assert_eq!(store.events().len(), 1);
  }

  #[tokio::test]
  async fn steady_state_does_not_rewrite_status() {
    let (store, reconciler, clock) = setup();
    let key = create(&store, spec());
    settle(&reconciler, &key).await;
    let version = store.task(&key).unwrap().resource_version();

    clock.advance(chrono::Duration::seconds(30));
    reconciler.reconcile(&key).await.unwrap();
    let task = store.task(&key).unwrap();
    assert_eq!(task.resource_version(), version);
    assert_eq!(store.events().len(), 1);
  }

  #[tokio::test]
  async fn cancel_tears_down_children() {
    let (store, reconciler, _) = setup();
    let key = create(&store, spec());
    settle(&reconciler, &key).await;
    let name = store.task(&key).unwrap().agent_name().unwrap().to_string();

    store.set_cancel(&key, true).unwrap();
    assert_eq!(reconciler.reconcile(&key).await.unwrap(), Action::RequeueAfter(Duration::from_secs(5)));

    let task = store.task(&key).unwrap();
    assert_eq!(task.phase(), TaskPhase::Cancelled);
    assert_eq!(task.condition(CONDITION_CANCELLED).unwrap().status, "True");
    assert_eq!(task.condition(CONDITION_READY).unwrap().status, "False");
    assert!(store.deployment("default", &name).is_none());
    assert!(store.service("default", &name).is_none());
    assert_eq!(store.events().last().unwrap().reason, "Cancelled");

    // Already torn down: a second pass is quiet.
    reconciler.reconcile(&key).await.unwrap();
    assert_eq!(store.events().len(), 2);
  }

  #[tokio::test]
  async fn ttl_deletes_after_expiry() {
    let (store, reconciler, clock) = setup();
    let key = create(
      &store,
      AgentTaskSpec {
        cancel: true,
        ttl_seconds_after_finished: Some(5),
        ..spec()
      },
    );
    settle(&reconciler, &key).await;
    assert_eq!(store.task(&key).unwrap().phase(), TaskPhase::Cancelled);

    clock.advance(chrono::Duration::seconds(2));
    assert_eq!(reconciler.reconcile(&key).await.unwrap(), Action::RequeueAfter(Duration::from_secs(3)));
    assert!(store.task(&key).is_some());

    clock.advance(chrono::Duration::seconds(3));
    assert_eq!(reconciler.reconcile(&key).await.unwrap(), Action::Done);

    // The finalizer holds the object until the next pass drops it.
    assert!(store.task(&key).unwrap().is_deleting());
    assert_eq!(reconciler.reconcile(&key).await.unwrap(), Action::Done);
    assert!(store.task(&key).is_none());
  }

  #[tokio::test]
  async fn recancel_restarts_the_ttl_clock() {
    let (store, reconciler, clock) = setup();
    let key = create(&store, spec());
    settle(&reconciler, &key).await;

    store.set_cancel(&key, true).unwrap();
    reconciler.reconcile(&key).await.unwrap();
    store.set_cancel(&key, false).unwrap();
    settle(&reconciler, &key).await;

    let task = store.task(&key).unwrap();
    assert_eq!(task.phase(), TaskPhase::Running);
    assert_eq!(task.condition(CONDITION_CANCELLED).unwrap().status, "False");
    assert_eq!(task.condition(CONDITION_READY).unwrap().status, "True");

    clock.advance(chrono::Duration::hours(1));
    let mut task = store.task(&key).unwrap();
    task.spec.cancel = true;
    task.spec.ttl_seconds_after_finished = Some(5);
    store.update(&task).await.unwrap();

    assert_eq!(reconciler.reconcile(&key).await.unwrap(), Action::RequeueAfter(Duration::from_secs(5)));
    let task = store.task(&key).unwrap();
    let cancelled = task.condition(CONDITION_CANCELLED).unwrap();
    assert_eq!(cancelled.status, "True");
    assert_eq!(cancelled.last_transition_time, clock.now());

    assert_eq!(reconciler.reconcile(&key).await.unwrap(), Action::RequeueAfter(Duration::from_secs(5)));
    assert!(!store.task(&key).unwrap().is_deleting());

    clock.advance(chrono::Duration::seconds(5));
    assert_eq!(reconciler.reconcile(&key).await.unwrap(), Action::Done);
    assert!(store.task(&key).unwrap().is_deleting());
  }

  #[tokio::test]
  async fn deletion_removes_finalizer_and_cascades() {
    let (store, reconciler, _) = setup();
    let key = create(&store, spec());
    settle(&reconciler, &key).await;
    let name = store.task(&key).unwrap().agent_name().unwrap().to_string();

    store.delete(&key).await.unwrap();
    assert!(store.task(&key).is_some());
    assert_eq!(reconciler.reconcile(&key).await.unwrap(), Action::Done);
    assert!(store.task(&key).is_none());
    assert!(store.deployment("default", &name).is_none());
    assert_eq!(reconciler.reconcile(&key).await.unwrap(), Action::Done);
  }

  #[tokio::test]
  async fn conflicts_are_retried() {
    let (store, reconciler, _) = setup();
    let key = create(&store, spec());
    store.inject_conflicts(3);
    settle(&reconciler, &key).await;
    assert_eq!(store.task(&key).unwrap().phase(), TaskPhase::Running);
  }

  #[tokio::test]
  async fn persistent_conflicts_surface_as_errors() {
    let (store, reconciler, _) = setup();
    let key = create(&store, spec());
    store.inject_conflicts(4);
    let err = reconciler.reconcile(&key).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Store(ref e) if e.is_conflict()));
  }

  #[tokio::test]
  async fn explicit_image_is_used() {
    let (store, reconciler, _) = setup();
    let key = create(
      &store,
      AgentTaskSpec {
        image: Some("custom:1".into()),
        ..spec()
      },
    );
    settle(&reconciler, &key).await;
    let name = store.task(&key).unwrap().agent_name().unwrap().to_string();
    let deployment = store.deployment("default", &name).unwrap();
    assert_eq!(
      deployment.spec.unwrap().template.spec.unwrap().containers[0].image.as_deref(),
      Some("custom:1")
    );
  }

  #[tokio::test]
  async fn missing_task_is_a_no_op() {
    let (_, reconciler, _) = setup();
    assert_eq!(reconciler.reconcile(&TaskKey::new("default", "ghost")).await.unwrap(), Action::Done);
  }
}
