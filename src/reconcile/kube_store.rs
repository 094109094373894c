use std::fmt::Debug;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Event, EventSource, ObjectReference, Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::warn;

use crate::cluster::crd::{AgentTask, TaskKey};
use crate::reconcile::store::{EventType, StoreError, TaskStore};

const FIELD_MANAGER: &str = "agenttask-controller";

/// [`TaskStore`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeStore {
  client: Client,
}

impl KubeStore {
  pub fn new(client: Client) -> Self {
    Self { client }
  }

  fn tasks(&self, namespace: &str) -> Api<AgentTask> {
    Api::namespaced(self.client.clone(), namespace)
  }

  async fn apply<K>(&self, obj: &K) -> Result<(), StoreError>
  where
    K: Resource<Scope = NamespaceResourceScope> + Clone + Debug + Serialize + DeserializeOwned,
    K::DynamicType: Default,
  {
    let api: Api<K> = Api::namespaced(self.client.clone(), &obj.namespace().unwrap_or_default());
    let params = PatchParams::apply(FIELD_MANAGER).force();
    api.patch(&obj.name_any(), &params, &Patch::Apply(obj)).await?;
    Ok(())
  }

  async fn delete_child<K>(&self, namespace: &str, name: &str) -> Result<(), StoreError>
  where
    K: Resource<Scope = NamespaceResourceScope> + Clone + Debug + DeserializeOwned,
    K::DynamicType: Default,
  {
    let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
    api.delete(name, &DeleteParams::default()).await?;
    Ok(())
  }
}

#[async_trait]
impl TaskStore for KubeStore {
  async fn get(&self, key: &TaskKey) -> Result<Option<AgentTask>, StoreError> {
    Ok(self.tasks(&key.namespace).get_opt(&key.name).await?)
  }

  async fn update(&self, task: &AgentTask) -> Result<AgentTask, StoreError> {
    let key = task.key();
    Ok(self.tasks(&key.namespace).replace(&key.name, &PostParams::default(), task).await?)
  }

  async fn update_status(&self, task: &AgentTask) -> Result<AgentTask, StoreError> {
    let key = task.key();
    // resourceVersion in a merge patch makes the write conditional.
    let patch = json!({
      "metadata": { "resourceVersion": task.resource_version() },
      "status": task.status,
    });
    Ok(
      self
        .tasks(&key.namespace)
        .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?,
    )
  }

  async fn delete(&self, key: &TaskKey) -> Result<(), StoreError> {
    self.tasks(&key.namespace).delete(&key.name, &DeleteParams::default()).await?;
    Ok(())
  }

  async fn apply_secret(&self, secret: &Secret) -> Result<(), StoreError> {
    self.apply(secret).await
  }

  async fn apply_deployment(&self, deployment: &Deployment) -> Result<(), StoreError> {
    self.apply(deployment).await
  }

  async fn apply_service(&self, service: &Service) -> Result<(), StoreError> {
    self.apply(service).await
  }

  async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
    self.delete_child::<Deployment>(namespace, name).await
  }

  async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
    self.delete_child::<Service>(namespace, name).await
  }

  async fn record_event(&self, task: &AgentTask, type_: EventType, reason: &str, message: &str) {
    let key = task.key();
    let now = Utc::now();
    let event = Event {
      metadata: ObjectMeta {
        name: Some(format!("{}.{:x}", key.name, now.timestamp_nanos_opt().unwrap_or_default())),
        namespace: Some(key.namespace.clone()),
        ..Default::default()
      },
      involved_object: ObjectReference {
        api_version: Some(AgentTask::api_version(&()).to_string()),
        kind: Some(AgentTask::kind(&()).to_string()),
        name: Some(key.name.clone()),
        namespace: Some(key.namespace.clone()),
        uid: task.uid(),
        resource_version: task.resource_version(),
        ..Default::default()
      },
      reason: Some(reason.to_string()),
      message: Some(message.to_string()),
      type_: Some(type_.as_str().to_string()),
      first_timestamp: Some(Time(now)),
      last_timestamp: Some(Time(now)),
      count: Some(1),
      source: Some(EventSource {
        component: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
      }),
      ..Default::default()
    };
    let api: Api<Event> = Api::namespaced(self.client.clone(), &key.namespace);
    if let Err(e) = api.create(&PostParams::default(), &event).await {
      warn!(task = %key, reason, error = %e, "failed to record event");
    }
  }
}
