use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Secret, Service};
use thiserror::Error;

use crate::cluster::crd::{AgentTask, TaskKey};
use crate::error::{api_code, api_reason};

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("{0} not found")]
  NotFound(String),

  #[error("conflict writing {0}")]
  Conflict(String),

  #[error("{0} already exists")]
  AlreadyExists(String),

  #[error("kubernetes api error: {0}")]
  Kube(kube::Error),
}

impl StoreError {
  pub fn is_conflict(&self) -> bool {
    matches!(self, StoreError::Conflict(_))
  }

  pub fn is_not_found(&self) -> bool {
    matches!(self, StoreError::NotFound(_))
  }
}

impl From<kube::Error> for StoreError {
  fn from(err: kube::Error) -> Self {
    let message = match &err {
      kube::Error::Api(resp) => resp.message.clone(),
      _ => String::new(),
    };
    match (api_code(&err), api_reason(&err)) {
      (Some(404), _) => StoreError::NotFound(message),
      (Some(409), Some("AlreadyExists")) => StoreError::AlreadyExists(message),
      (Some(409), _) => StoreError::Conflict(message),
      _ => StoreError::Kube(err),
    }
  }
}

/// Event severity, mirroring the core/v1 `Event.type` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
  Normal,
  Warning,
}

impl EventType {
  pub fn as_str(&self) -> &'static str {
    match self {
      EventType::Normal => "Normal",
      EventType::Warning => "Warning",
    }
  }
}

/// Everything the reconciler reads and writes.
///
/// Writes of an `AgentTask` are guarded by its `resourceVersion`: a stale
/// object yields [`StoreError::Conflict`]. Child writes are idempotent
/// create-or-update.
#[async_trait]
pub trait TaskStore: Send + Sync {
  async fn get(&self, key: &TaskKey) -> Result<Option<AgentTask>, StoreError>;

  /// Persists metadata and spec. Status is left untouched.
  async fn update(&self, task: &AgentTask) -> Result<AgentTask, StoreError>;

  /// Persists the status block only.
  async fn update_status(&self, task: &AgentTask) -> Result<AgentTask, StoreError>;

  /// Requests deletion. Finalizers may keep the object around.
  async fn delete(&self, key: &TaskKey) -> Result<(), StoreError>;

  async fn apply_secret(&self, secret: &Secret) -> Result<(), StoreError>;
  async fn apply_deployment(&self, deployment: &Deployment) -> Result<(), StoreError>;
  async fn apply_service(&self, service: &Service) -> Result<(), StoreError>;

  async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), StoreError>;
  async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), StoreError>;

  /// Best effort; failures are logged by the implementation.
  async fn record_event(&self, task: &AgentTask, type_: EventType, reason: &str, message: &str);
}
