//! One-shot deployment of an agent, outside the reconciliation loop.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_retry::Retry;
use tracing::{info, warn};

use crate::cluster::crd::child_name;
use crate::cluster::resources::AgentResources;
use crate::config::{DEFAULT_AGENT_IMAGE, DEFAULT_AGENT_NAMESPACE, DEFAULT_AGENT_PORT};
use crate::error::{ClusterError, api_reason};

const WRITE_ATTEMPTS: u64 = 3;
const BACKOFF_STEP_MS: u64 = 200;

#[derive(Debug, Clone, Default)]
pub struct DeployParams {
  pub org: String,
  pub image: Option<String>,
  pub namespace: Option<String>,
  pub name: Option<String>,
  pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Deployed {
  pub name: String,
  pub namespace: String,
}

impl DeployParams {
  pub fn resources(&self) -> AgentResources {
    let name = self
      .name
      .clone()
      .filter(|n| !n.is_empty())
      .unwrap_or_else(|| child_name("agent", &self.org, &Utc::now().timestamp().to_string()));
    AgentResources {
      name,
      namespace: self
        .namespace
        .clone()
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| DEFAULT_AGENT_NAMESPACE.to_string()),
      image: self
        .image
        .clone()
        .filter(|i| !i.is_empty())
        .unwrap_or_else(|| DEFAULT_AGENT_IMAGE.to_string()),
      port: DEFAULT_AGENT_PORT,
      env: self.env.clone(),
      probes: true,
      owner: None,
    }
  }
}

/// Linearly growing delays between write attempts: 200ms, 400ms, ...
fn linear_backoff() -> impl Iterator<Item = Duration> {
  (1..WRITE_ATTEMPTS).map(|i| Duration::from_millis(BACKOFF_STEP_MS * i))
}

async fn ensure_namespace(client: &Client, namespace: &str) -> Result<(), ClusterError> {
  let api: Api<Namespace> = Api::all(client.clone());
  if api.get_opt(namespace).await?.is_some() {
    return Ok(());
  }
  let ns = Namespace {
    metadata: ObjectMeta {
      name: Some(namespace.to_string()),
      ..Default::default()
    },
    ..Default::default()
  };
  match api.create(&PostParams::default(), &ns).await {
    Ok(_) => {
      info!(namespace, "namespace created");
      Ok(())
    }
    Err(e) if api_reason(&e) == Some("AlreadyExists") => Ok(()),
    Err(e) => Err(e.into()),
  }
}

/// Creates `obj`, falling back to a replace when the create fails.
async fn create_or_replace<K>(client: &Client, obj: &K) -> Result<K, ClusterError>
where
  K: Resource<Scope = NamespaceResourceScope> + Clone + Debug + Serialize + DeserializeOwned,
  K::DynamicType: Default,
{
  let name = obj.name_any();
  let api: Api<K> = Api::namespaced(client.clone(), &obj.namespace().unwrap_or_default());
  Retry::spawn(linear_backoff(), || async {
    match api.create(&PostParams::default(), obj).await {
      Ok(created) => Ok(created),
      Err(create_err) => match api.replace(&name, &PostParams::default(), obj).await {
        Ok(replaced) => Ok(replaced),
        Err(replace_err) => {
          warn!(name = %name, error = %create_err, "create failed, replace failed too: {}", replace_err);
          Err(ClusterError::from(replace_err))
        }
      },
    }
  })
  .await
}

/// Creates or updates the namespace, secret, deployment and service for one
/// agent. Returns the name shared by the children.
pub async fn deploy_agent(client: &Client, params: &DeployParams) -> Result<Deployed, ClusterError> {
  let resources = params.resources();
  ensure_namespace(client, &resources.namespace).await?;
  create_or_replace(client, &resources.secret()).await?;
  create_or_replace(client, &resources.deployment()).await?;
  create_or_replace(client, &resources.service()).await?;
  info!(org = %params.org, name = %resources.name, namespace = %resources.namespace, "agent deployed");
  Ok(Deployed {
    name: resources.name,
    namespace: resources.namespace,
  })
}
